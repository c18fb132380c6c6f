//! NAT-outgoing (masquerade) manager.
//!
//! Tracks the IP pools and keeps two sets (all pools, masquerading
//! pools) plus the postrouting chain that SNATs traffic leaving a
//! masquerading pool for a destination outside every pool.

use std::collections::BTreeMap;

use ipnet::Ipv4Net;

use crate::proto::{IpSetKind, Update};
use crate::render::{self, IPSET_ALL_POOLS, IPSET_MASQ_POOLS};

use super::{DataplaneManager, Result, SharedIpSets, SharedTable};

pub struct MasqManager {
    ipsets: SharedIpSets,
    nat_table: SharedTable,
    pools: BTreeMap<Ipv4Net, bool>,
    dirty: bool,
}

impl MasqManager {
    pub fn new(ipsets: SharedIpSets, nat_table: SharedTable) -> Self {
        Self {
            ipsets,
            nat_table,
            pools: BTreeMap::new(),
            dirty: true,
        }
    }

    /// Does any pool masquerade at all? Controls whether the masq
    /// chain is wired into postrouting.
    fn masq_enabled(&self) -> bool {
        self.pools.values().any(|m| *m)
    }
}

impl DataplaneManager for MasqManager {
    fn on_update(&mut self, update: &Update) {
        match update {
            Update::IpPool { cidr, masquerade } => {
                if self.pools.insert(*cidr, *masquerade) != Some(*masquerade) {
                    self.dirty = true;
                }
            }
            Update::IpPoolRemove { cidr } => {
                if self.pools.remove(cidr).is_some() {
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

        let all: Vec<String> = self.pools.keys().map(|c| c.to_string()).collect();
        let masq: Vec<String> = self
            .pools
            .iter()
            .filter(|(_, m)| **m)
            .map(|(c, _)| c.to_string())
            .collect();
        {
            let mut ipsets = self.ipsets.lock().unwrap();
            ipsets.add_or_replace_members(IPSET_ALL_POOLS, IpSetKind::Net, all);
            ipsets.add_or_replace_members(IPSET_MASQ_POOLS, IpSetKind::Net, masq);
        }

        let mut table = self.nat_table.lock().unwrap();
        table.update_chain(render::masq_chain());
        table.update_chain(render::nat_postrouting_chain(self.masq_enabled()));
        self.dirty = false;
        Ok(())
    }
}
