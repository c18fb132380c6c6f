//! Service manager: owns the NAT frontend/backend/affinity maps.
//!
//! Absorbs service messages and reprograms the maps in the apply
//! phase. Publishes the live frontend set to the conntrack scanner so
//! stale NAT flows are swept when their service disappears.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::warn;

use cordon_common::nat::FrontendKey;

use crate::maps::NatMaps;
use crate::proto::{ServiceSpec, Update};

use super::{DataplaneManager, Result};

pub struct ServiceManager {
    nat: NatMaps,
    desired: BTreeMap<String, Arc<ServiceSpec>>,
    dirty: HashSet<String>,
    /// (vip, port, protocol) of services removed since last apply.
    removed: HashMap<String, (std::net::Ipv4Addr, u16, u8)>,
    frontends_tx: watch::Sender<HashSet<FrontendKey>>,
}

impl ServiceManager {
    pub fn new(nat: NatMaps) -> (Self, watch::Receiver<HashSet<FrontendKey>>) {
        let (frontends_tx, rx) = watch::channel(HashSet::new());
        (
            Self {
                nat,
                desired: BTreeMap::new(),
                dirty: HashSet::new(),
                removed: HashMap::new(),
                frontends_tx,
            },
            rx,
        )
    }
}

impl DataplaneManager for ServiceManager {
    fn on_update(&mut self, update: &Update) {
        match update {
            Update::Service { name, spec } => {
                self.removed.remove(name);
                if self.desired.insert(name.clone(), spec.clone()) != Some(spec.clone()) {
                    self.dirty.insert(name.clone());
                }
            }
            Update::ServiceRemove { name } => {
                if let Some(spec) = self.desired.remove(name) {
                    self.dirty.remove(name);
                    self.removed
                        .insert(name.clone(), (spec.vip, spec.port, spec.protocol));
                }
            }
            _ => {}
        }
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        for (name, (vip, port, protocol)) in std::mem::take(&mut self.removed) {
            if let Err(e) = self.nat.remove_service(vip, port, protocol) {
                warn!(service = %name, error = %e, "failed to remove service");
                self.removed.insert(name, (vip, port, protocol));
                return Err(e.into());
            }
        }

        let dirty: Vec<String> = self.dirty.drain().collect();
        for name in dirty {
            let Some(spec) = self.desired.get(&name).cloned() else {
                continue;
            };
            if let Err(e) = self.nat.upsert_service(&spec) {
                warn!(service = %name, error = %e, "failed to program service");
                self.dirty.insert(name);
                return Err(e.into());
            }
        }

        let _ = self.frontends_tx.send(self.nat.live_frontends());
        Ok(())
    }
}
