//! Finding the routing components between the active trace sources and a sink.
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::enablement::SourceEnablement;
use crate::topology::{DeviceId, Topology};

/// Every router that can forward trace data into `sink`, in the order a backward walk from the
/// sink discovers them.
pub fn static_routers(topology: &Topology, sink: DeviceId) -> Vec<DeviceId> {
    let mut discovered = Vec::new();
    let mut visited = BTreeSet::from([sink]);
    let mut queue = VecDeque::from([sink]);

    while let Some(current) = queue.pop_front() {
        for (upstream, _) in topology.routes_into(current) {
            if topology.node(upstream).kind.is_router() && visited.insert(upstream) {
                discovered.push(upstream);
                queue.push_back(upstream);
            }
        }
    }

    discovered
}

/// The routers carrying data from an enabled source into `sink`.
///
/// The chain is ordered from the sources towards the sink: a router always comes before every
/// router it feeds. Routers at the same depth keep the order the backward walk found them in.
pub fn resolve_chain(
    topology: &Topology,
    enablement: &SourceEnablement,
    sink: DeviceId,
) -> Vec<DeviceId> {
    let upstream = static_routers(topology, sink);
    let fed = routers_fed_by(topology, enablement);

    let candidates: Vec<DeviceId> = upstream
        .into_iter()
        .filter(|router| fed.contains(router))
        .collect();
    let rank: BTreeMap<DeviceId, usize> = candidates
        .iter()
        .enumerate()
        .map(|(rank, router)| (*router, rank))
        .collect();

    // Number of candidate routers feeding each candidate.
    let mut pending: BTreeMap<DeviceId, usize> = candidates
        .iter()
        .map(|router| {
            let feeders = topology
                .routes_into(*router)
                .filter(|(from, _)| rank.contains_key(from))
                .map(|(from, _)| from)
                .collect::<BTreeSet<_>>()
                .len();
            (*router, feeders)
        })
        .collect();

    let mut chain = Vec::with_capacity(candidates.len());
    // Ready routers keyed by discovery rank.
    let mut ready: BTreeMap<usize, DeviceId> = pending
        .iter()
        .filter(|(_, feeders)| **feeders == 0)
        .map(|(router, _)| (rank[router], *router))
        .collect();

    while let Some((_, router)) = ready.pop_first() {
        chain.push(router);
        let downstream: BTreeSet<DeviceId> = topology
            .routes_from(router)
            .map(|(to, _)| to)
            .filter(|to| rank.contains_key(to))
            .collect();
        for next in downstream {
            if let Some(feeders) = pending.get_mut(&next) {
                *feeders -= 1;
                if *feeders == 0 {
                    ready.insert(rank[&next], next);
                }
            }
        }
    }

    chain
}

fn routers_fed_by(topology: &Topology, enablement: &SourceEnablement) -> BTreeSet<DeviceId> {
    let mut fed = BTreeSet::new();
    let mut queue: VecDeque<DeviceId> = enablement.enabled_sources().collect();

    while let Some(current) = queue.pop_front() {
        for (next, _) in topology.routes_from(current) {
            if topology.node(next).kind.is_router() && fed.insert(next) {
                queue.push_back(next);
            }
        }
    }

    fed
}
