//! Floating-IP manager.
//!
//! Renders the DNAT (external address -> workload address) and the
//! matching SNAT chains from the endpoints' floating-IP mappings.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::proto::{EndpointId, Update};
use crate::render::{Action, Chain, Match, Rule, CHAIN_FIP_DNAT, CHAIN_FIP_SNAT};

use super::{DataplaneManager, Result, SharedTable};

pub struct FloatingIpManager {
    nat_table: SharedTable,
    /// (external, internal) pairs per endpoint.
    nat_maps: BTreeMap<EndpointId, Vec<(Ipv4Addr, Ipv4Addr)>>,
    dirty: bool,
}

impl FloatingIpManager {
    pub fn new(nat_table: SharedTable) -> Self {
        Self {
            nat_table,
            nat_maps: BTreeMap::new(),
            dirty: true,
        }
    }

    fn render_chains(&self) -> (Chain, Chain) {
        let mut dnat = Vec::new();
        let mut snat = Vec::new();
        for pairs in self.nat_maps.values() {
            for (ext, int) in pairs {
                let (Ok(ext_net), Ok(int_net)) =
                    (Ipv4Net::new(*ext, 32), Ipv4Net::new(*int, 32))
                else {
                    continue;
                };
                dnat.push(Rule::new(
                    Match::new().dst_net(&ext_net),
                    Action::DnatTo {
                        addr: *int,
                        port: 0,
                    },
                ));
                // Rewrite the source back to the floating address on
                // the way out.
                snat.push(Rule::new(
                    Match::new().src_net(&int_net),
                    Action::SnatTo { addr: *ext },
                ));
            }
        }
        (
            Chain::new(CHAIN_FIP_DNAT, dnat),
            Chain::new(CHAIN_FIP_SNAT, snat),
        )
    }
}

impl DataplaneManager for FloatingIpManager {
    fn on_update(&mut self, update: &Update) {
        match update {
            Update::WorkloadEndpoint { id, endpoint } => {
                let pairs = endpoint.nat_maps.clone();
                if pairs.is_empty() {
                    if self.nat_maps.remove(id).is_some() {
                        self.dirty = true;
                    }
                } else if self.nat_maps.insert(id.clone(), pairs.clone()) != Some(pairs) {
                    self.dirty = true;
                }
            }
            Update::WorkloadEndpointRemove { id } => {
                if self.nat_maps.remove(id).is_some() {
                    self.dirty = true;
                }
            }
            _ => {}
        }
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let (dnat, snat) = self.render_chains();
        let mut table = self.nat_table.lock().unwrap();
        table.update_chain(dnat);
        table.update_chain(snat);
        table.update_chain(crate::render::nat_prerouting_chain());
        self.dirty = false;
        Ok(())
    }
}
