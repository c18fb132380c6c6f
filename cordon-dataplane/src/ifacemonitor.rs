//! Interface monitor.
//!
//! Subscribes to kernel link and address notifications and republishes
//! them as `Update::IfaceUpdate` / `Update::IfaceAddrsUpdate` events
//! into the driver's channels. Events for one interface are delivered
//! in order; consumers are responsible for deduplication. A periodic
//! full resync papers over lost netlink messages.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use futures::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{LinkAttribute, State};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

use crate::proto::{IfaceState, Update};

/// How often the monitor re-lists links and addresses to recover from
/// missed events.
const RESYNC_INTERVAL: Duration = Duration::from_secs(90);

pub struct InterfaceMonitor {
    excludes: Vec<String>,
    tx: mpsc::Sender<Update>,
    /// Last published (state, ifindex) per interface.
    known_state: HashMap<String, (IfaceState, u32)>,
    /// Last published address set per interface.
    known_addrs: HashMap<String, Vec<Ipv4Addr>>,
}

impl InterfaceMonitor {
    pub fn new(excludes: Vec<String>, tx: mpsc::Sender<Update>) -> Self {
        Self {
            excludes,
            tx,
            known_state: HashMap::new(),
            known_addrs: HashMap::new(),
        }
    }

    fn excluded(&self, name: &str) -> bool {
        self.excludes.iter().any(|e| name.starts_with(e.as_str()))
    }

    /// Run forever, publishing interface events. Resyncs periodically;
    /// netlink failures are logged and retried on the next tick.
    pub async fn run(mut self) {
        info!("interface monitor started");
        let mut ticker = time::interval(RESYNC_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = self.resync().await {
                warn!(error = %e, "interface resync failed, will retry");
            }
        }
    }

    /// Compare kernel state against what we last published and emit
    /// the differences in order.
    pub async fn resync(&mut self) -> std::io::Result<()> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        let mut current: HashMap<String, (IfaceState, u32)> = HashMap::new();
        let mut index_to_name: HashMap<u32, String> = HashMap::new();

        let mut links = handle.link().get().execute();
        while let Some(link) = links.try_next().await.map_err(std::io::Error::other)? {
            let ifindex = link.header.index;
            let mut name = None;
            let mut oper_state = IfaceState::Unknown;
            for attr in &link.attributes {
                match attr {
                    LinkAttribute::IfName(n) => name = Some(n.clone()),
                    LinkAttribute::OperState(s) => {
                        oper_state = match s {
                            State::Up => IfaceState::Up,
                            State::Unknown => IfaceState::Unknown,
                            _ => IfaceState::Down,
                        };
                    }
                    _ => {}
                }
            }
            let Some(name) = name else { continue };
            if self.excluded(&name) {
                continue;
            }
            index_to_name.insert(ifindex, name.clone());
            current.insert(name, (oper_state, ifindex));
        }

        // State transitions and new interfaces.
        for (name, (state, ifindex)) in &current {
            if self.known_state.get(name) != Some(&(*state, *ifindex)) {
                self.publish_state(name, *state, *ifindex).await;
            }
        }
        // Interfaces that went away.
        let gone: Vec<String> = self
            .known_state
            .keys()
            .filter(|n| !current.contains_key(*n))
            .cloned()
            .collect();
        for name in gone {
            let ifindex = self.known_state[&name].1;
            self.publish_state(&name, IfaceState::Down, ifindex).await;
            self.known_state.remove(&name);
            if self.known_addrs.remove(&name).is_some() {
                let _ = self
                    .tx
                    .send(Update::IfaceAddrsUpdate {
                        name: name.clone(),
                        addrs: None,
                    })
                    .await;
            }
        }
        self.known_state = current;

        // Address sets.
        let mut addrs_by_iface: HashMap<String, Vec<Ipv4Addr>> = HashMap::new();
        let mut addrs = handle.address().get().execute();
        while let Some(msg) = addrs.try_next().await.map_err(std::io::Error::other)? {
            let Some(name) = index_to_name.get(&msg.header.index) else {
                continue;
            };
            for attr in &msg.attributes {
                if let AddressAttribute::Address(std::net::IpAddr::V4(v4)) = attr {
                    addrs_by_iface.entry(name.clone()).or_default().push(*v4);
                }
            }
        }
        for addrs in addrs_by_iface.values_mut() {
            addrs.sort_unstable();
            addrs.dedup();
        }

        for (name, addrs) in &addrs_by_iface {
            if self.known_addrs.get(name) != Some(addrs) {
                debug!(name, count = addrs.len(), "interface addresses changed");
                let _ = self
                    .tx
                    .send(Update::IfaceAddrsUpdate {
                        name: name.clone(),
                        addrs: Some(addrs.clone()),
                    })
                    .await;
            }
        }
        let lost: Vec<String> = self
            .known_addrs
            .keys()
            .filter(|n| !addrs_by_iface.contains_key(*n))
            .cloned()
            .collect();
        for name in lost {
            let _ = self
                .tx
                .send(Update::IfaceAddrsUpdate {
                    name: name.clone(),
                    addrs: None,
                })
                .await;
        }
        self.known_addrs = addrs_by_iface;

        Ok(())
    }

    async fn publish_state(&self, name: &str, state: IfaceState, ifindex: u32) {
        info!(name, ?state, ifindex, "interface state changed");
        let _ = self
            .tx
            .send(Update::IfaceUpdate {
                name: name.to_string(),
                state,
                ifindex,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusion_by_prefix() {
        let (tx, _rx) = mpsc::channel(1);
        let mon = InterfaceMonitor::new(vec![String::from("lo"), String::from("docker")], tx);
        assert!(mon.excluded("lo"));
        assert!(mon.excluded("docker0"));
        assert!(!mon.excluded("eth0"));
    }
}
