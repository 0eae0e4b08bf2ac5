use std::{fmt::Write, net::Ipv4Addr};

pub const ETC_HOSTS_PATH: &str = "/etc/hosts";

#[derive(Debug, Clone, PartialEq)]
pub struct HostsEntry<'a> {
    pub ip: Ipv4Addr,
    pub hostname: &'a str,
    pub aliases: &'a [String],
}

/// `/etc/hosts` content for a cluster, one line per entry in the given order.
pub fn synthesize_etc_hosts(entries: &[HostsEntry<'_>]) -> String {
    let mut hosts = String::from("127.0.0.1 localhost\n");

    for entry in entries {
        let _ = write!(hosts, "{} {}", entry.ip, entry.hostname);
        for alias in entry.aliases {
            let _ = write!(hosts, " {alias}");
        }
        hosts.push('\n');
    }

    hosts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_container_gets_a_line_in_order() {
        let head = vec!["head".to_owned()];
        let entries = [
            HostsEntry {
                ip: Ipv4Addr::new(10, 0, 0, 2),
                hostname: "node-1",
                aliases: &head,
            },
            HostsEntry {
                ip: Ipv4Addr::new(10, 0, 0, 3),
                hostname: "node-2",
                aliases: &[],
            },
            HostsEntry {
                ip: Ipv4Addr::new(10, 0, 0, 4),
                hostname: "node-3",
                aliases: &[],
            },
        ];

        let hosts = synthesize_etc_hosts(&entries);
        let lines = hosts.lines().collect::<Vec<_>>();

        assert!(hosts.starts_with("127.0.0.1 localhost\n"));
        assert!(hosts.ends_with('\n'));
        assert_eq!(
            lines,
            [
                "127.0.0.1 localhost",
                "10.0.0.2 node-1 head",
                "10.0.0.3 node-2",
                "10.0.0.4 node-3",
            ]
        );
    }

    #[test]
    fn no_entries_still_has_localhost() {
        assert_eq!(synthesize_etc_hosts(&[]), "127.0.0.1 localhost\n");
    }
}
