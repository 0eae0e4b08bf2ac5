use std::fmt::Display;

use log::{debug, info};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum AllocationError {
    #[error("There are no backend hosts to allocate {} node(s) on!", .0)]
    NoHosts(usize),
}

/// Nodes assigned to one backend host.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment<H> {
    pub host: H,
    /// load the host had before the assignment
    pub load: usize,
    pub nodes: Vec<String>,
}

impl<H> Assignment<H> {
    pub fn total_load(&self) -> usize {
        self.load + self.nodes.len()
    }
}

/// Spreads `nodes` over `hosts` (host id with its current load).
///
/// Hosts are levelled up to the most loaded one first, whatever is left is
/// split evenly and the remainder goes one by one to the least loaded hosts.
/// The result lists every host, least loaded first; nodes keep their
/// declaration order, both across and within assignments.
pub fn plan<H: Clone + Display>(
    nodes: &[String],
    hosts: &[(H, usize)],
) -> Result<Vec<Assignment<H>>, AllocationError> {
    if hosts.is_empty() {
        return Err(AllocationError::NoHosts(nodes.len()));
    }

    let mut table = hosts.to_vec();
    // stable, so equally loaded hosts keep the caller's order
    table.sort_by_key(|(_, load)| *load);

    let max_load = table.last().map(|(_, load)| *load).unwrap_or_default();
    let mut counts = vec![0usize; table.len()];
    let mut pending = nodes.len();

    for (count, (_, load)) in counts.iter_mut().zip(&table) {
        if pending == 0 {
            break;
        }

        let deficit = max_load - load;
        if deficit == 0 {
            break;
        }

        *count = deficit.min(pending);
        pending -= *count;
    }

    let share = pending / table.len();
    let remainder = pending % table.len();
    for (i, count) in counts.iter_mut().enumerate() {
        *count += share + usize::from(i < remainder);
    }

    let mut remaining = nodes.iter();
    let assignments = table
        .into_iter()
        .zip(counts)
        .map(|((host, load), count)| Assignment {
            nodes: remaining.by_ref().take(count).cloned().collect(),
            host,
            load,
        })
        .collect::<Vec<_>>();

    for assignment in &assignments {
        debug!(
            "Host {} (load {}) gets {} node(s)",
            assignment.host,
            assignment.load,
            assignment.nodes.len()
        );
    }

    info!(
        "Planned {} node(s) across {} host(s)",
        nodes.len(),
        assignments.len()
    );

    Ok(assignments)
}
