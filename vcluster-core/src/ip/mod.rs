use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

pub mod db;
pub mod ranges;

pub use db::{AddressDbError, IpAddrDb};
pub use ranges::AddressRanges;

/// How a cluster subnet is split between static and engine-managed addresses.
///
/// Containers get static addresses from the bottom of the subnet in node
/// order, the engine keeps the `/30` at the top for its own needs and the
/// gateway sits right below the broadcast address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetLayout {
    subnet: Ipv4Net,
}

impl SubnetLayout {
    pub fn new(subnet: Ipv4Net) -> Self {
        Self {
            subnet: subnet.trunc(),
        }
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet.broadcast()).saturating_sub(1))
    }

    pub fn engine_range(&self) -> Ipv4Net {
        let top = u32::from(self.subnet.broadcast()) & !3;

        // a /30 is always a valid prefix
        Ipv4Net::new(Ipv4Addr::from(top), 30).unwrap_or(self.subnet)
    }

    /// Static addresses handed out to containers, in order.
    pub fn static_addresses(&self) -> impl Iterator<Item = Ipv4Addr> {
        let engine = self.engine_range();
        let gateway = self.gateway();

        self.subnet
            .hosts()
            .filter(move |ip| !engine.contains(ip) && *ip != gateway)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_reserves_the_top_of_the_subnet() {
        let layout = SubnetLayout::new("10.10.0.0/24".parse().unwrap());

        assert_eq!(layout.gateway(), Ipv4Addr::new(10, 10, 0, 254));
        assert_eq!(layout.engine_range(), "10.10.0.252/30".parse::<Ipv4Net>().unwrap());
        assert_eq!(
            layout.static_addresses().take(3).collect::<Vec<_>>(),
            [
                Ipv4Addr::new(10, 10, 0, 1),
                Ipv4Addr::new(10, 10, 0, 2),
                Ipv4Addr::new(10, 10, 0, 3),
            ]
        );
        assert_eq!(layout.static_addresses().count(), 251);
    }

    #[test]
    fn layout_normalizes_host_bits() {
        let layout = SubnetLayout::new("192.168.7.77/28".parse().unwrap());

        assert_eq!(layout.subnet(), "192.168.7.64/28".parse::<Ipv4Net>().unwrap());
        assert_eq!(layout.gateway(), Ipv4Addr::new(192, 168, 7, 78));
    }
}
