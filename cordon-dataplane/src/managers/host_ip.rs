//! Host-IP manager: keeps the set of this host's addresses current so
//! policy can match "this host" symbolically.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::proto::{IpSetKind, Update};
use crate::render::IPSET_THIS_HOST;

use super::{DataplaneManager, Result, SharedIpSets};

pub struct HostIpManager {
    ipsets: SharedIpSets,
    workload_prefixes: Vec<String>,
    /// Address set per non-workload interface.
    iface_addrs: BTreeMap<String, Vec<Ipv4Addr>>,
    dirty: bool,
}

impl HostIpManager {
    pub fn new(ipsets: SharedIpSets, workload_prefixes: Vec<String>) -> Self {
        Self {
            ipsets,
            workload_prefixes,
            iface_addrs: BTreeMap::new(),
            dirty: true,
        }
    }

    fn is_workload_iface(&self, name: &str) -> bool {
        self.workload_prefixes
            .iter()
            .any(|p| name.starts_with(p.as_str()))
    }

    fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self
            .iface_addrs
            .values()
            .flatten()
            .map(|a| a.to_string())
            .collect();
        members.sort();
        members.dedup();
        members
    }
}

impl DataplaneManager for HostIpManager {
    fn on_update(&mut self, update: &Update) {
        if let Update::IfaceAddrsUpdate { name, addrs } = update {
            // Workload interface addresses belong to pods, not us.
            if self.is_workload_iface(name) {
                return;
            }
            let changed = match addrs {
                Some(addrs) => self.iface_addrs.insert(name.clone(), addrs.clone())
                    != Some(addrs.clone()),
                None => self.iface_addrs.remove(name).is_some(),
            };
            if changed {
                self.dirty = true;
            }
        }
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.ipsets.lock().unwrap().add_or_replace_members(
            IPSET_THIS_HOST,
            IpSetKind::Net,
            self.members(),
        );
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsets::IpSetsWriter;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        replaced: Vec<(String, Vec<String>)>,
    }

    impl IpSetsWriter for Recorder {
        fn add_or_replace_members(
            &mut self,
            set_id: &str,
            _kind: IpSetKind,
            members: Vec<String>,
        ) {
            self.replaced.push((set_id.to_string(), members));
        }
        fn add_members(&mut self, _: &str, _: Vec<String>) {}
        fn remove_members(&mut self, _: &str, _: Vec<String>) {}
        fn remove_set(&mut self, _: &str) {}
        fn queue_resync(&mut self) {}
        fn apply_updates(&mut self) -> crate::ipsets::Result<()> {
            Ok(())
        }
        fn apply_deletions(&mut self) -> crate::ipsets::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn publishes_host_addresses_excluding_workload_ifaces() {
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let writer: SharedIpSets = recorder.clone();
        let mut mgr = HostIpManager::new(writer, vec![String::from("cord")]);

        mgr.on_update(&Update::IfaceAddrsUpdate {
            name: String::from("eth0"),
            addrs: Some(vec![Ipv4Addr::new(192, 168, 1, 10)]),
        });
        mgr.on_update(&Update::IfaceAddrsUpdate {
            name: String::from("cord123"),
            addrs: Some(vec![Ipv4Addr::new(10, 0, 0, 5)]),
        });
        mgr.complete_deferred_work().await.unwrap();

        let recorder = recorder.lock().unwrap();
        let (set, members) = recorder.replaced.last().unwrap();
        assert_eq!(set, IPSET_THIS_HOST);
        assert_eq!(members, &vec![String::from("192.168.1.10")]);
    }
}
