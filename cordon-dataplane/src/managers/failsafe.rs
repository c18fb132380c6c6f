//! Failsafe-ports manager (fast-path mode).
//!
//! Writes the configured failsafe ports into the shared map the TC
//! programs consult; registered before the endpoint managers so the
//! map is correct before the first program attaches.

use std::collections::HashSet;

use cordon_common::failsafe::FailsafeKey;

use crate::config::ProtoPort;
use crate::maps::FailsafeMap;
use crate::proto::Update;

use super::{DataplaneManager, Result};

pub struct FailsafeManager {
    map: FailsafeMap,
    inbound: Vec<ProtoPort>,
    outbound: Vec<ProtoPort>,
    synced: bool,
}

impl FailsafeManager {
    pub fn new(map: FailsafeMap, inbound: Vec<ProtoPort>, outbound: Vec<ProtoPort>) -> Self {
        Self {
            map,
            inbound,
            outbound,
            synced: false,
        }
    }

    fn desired(&self) -> HashSet<FailsafeKey> {
        let mut keys = HashSet::new();
        for p in &self.inbound {
            keys.insert(FailsafeKey::ingress(p.port, p.protocol));
        }
        for p in &self.outbound {
            keys.insert(FailsafeKey::egress(p.port, p.protocol));
        }
        keys
    }
}

impl DataplaneManager for FailsafeManager {
    fn on_update(&mut self, _update: &Update) {
        // Failsafe ports are configuration, not desired state.
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        if self.synced {
            return Ok(());
        }
        let desired = self.desired();
        let existing: HashSet<FailsafeKey> = self.map.keys().collect();
        for key in existing.difference(&desired) {
            self.map.remove(key)?;
        }
        for key in desired.difference(&existing) {
            self.map.insert(*key)?;
        }
        self.synced = true;
        Ok(())
    }
}
