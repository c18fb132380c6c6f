//! NAT frontend/backend/affinity map programming.
//!
//! Owned by the service manager. Writes are ordered so the programs
//! never chase a dangling reference: backends go in before the
//! frontend that points at them, and the frontend's count shrinks
//! before surplus backends are deleted.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use aya::maps::{HashMap as AyaHashMap, MapData};
use tracing::{debug, warn};

use cordon_common::nat::{
    AffinityKey, AffinityValue, BackendKey, BackendValue, FrontendKey, FrontendValue,
    FE_FLAG_DSR, FE_FLAG_EXTERNAL_LOCAL,
};

use crate::proto::ServiceSpec;

use super::{open_pinned, MapError, Result, MAP_NAT_AFF, MAP_NAT_BE, MAP_NAT_FE};

pub struct NatMaps {
    frontends: AyaHashMap<MapData, FrontendKey, FrontendValue>,
    backends: AyaHashMap<MapData, BackendKey, BackendValue>,
    affinity: AyaHashMap<MapData, AffinityKey, AffinityValue>,
    /// Ordinal and programmed backend count per frontend.
    allocations: HashMap<FrontendKey, (u32, u32)>,
    next_ordinal: u32,
    dsr: bool,
}

impl NatMaps {
    pub fn open(pin_dir: &Path, dsr: bool) -> Result<Self> {
        let frontends = AyaHashMap::try_from(open_pinned(pin_dir, MAP_NAT_FE)?)
            .map_err(|_| MapError::WrongType { name: MAP_NAT_FE })?;
        let backends = AyaHashMap::try_from(open_pinned(pin_dir, MAP_NAT_BE)?)
            .map_err(|_| MapError::WrongType { name: MAP_NAT_BE })?;
        let affinity = AyaHashMap::try_from(open_pinned(pin_dir, MAP_NAT_AFF)?)
            .map_err(|_| MapError::WrongType { name: MAP_NAT_AFF })?;
        Ok(Self {
            frontends,
            backends,
            affinity,
            allocations: HashMap::new(),
            next_ordinal: 0,
            dsr,
        })
    }

    fn frontend_key(spec: &ServiceSpec) -> FrontendKey {
        FrontendKey::new(spec.vip.octets(), spec.port, spec.protocol)
    }

    /// Program one service. Local backends sort first so the frontend
    /// value's `local_count` indexes a prefix of the block.
    pub fn upsert_service(&mut self, spec: &ServiceSpec) -> Result<()> {
        let fe_key = Self::frontend_key(spec);
        let (ordinal, old_count) = match self.allocations.get(&fe_key) {
            Some(v) => *v,
            None => {
                let ordinal = self.next_ordinal;
                self.next_ordinal += 1;
                (ordinal, 0)
            }
        };

        let mut backends = spec.backends.clone();
        backends.sort_by_key(|b| (!b.local, b.addr, b.port));
        let local_count = backends.iter().filter(|b| b.local).count() as u32;

        for (i, backend) in backends.iter().enumerate() {
            let key = BackendKey {
                ordinal,
                index: i as u32,
            };
            let value = BackendValue::new(backend.addr.octets(), backend.port);
            self.backends.insert(key, value, 0).map_err(|source| MapError::Op {
                name: MAP_NAT_BE,
                source,
            })?;
        }

        let mut flags = 0;
        if spec.external_local {
            flags |= FE_FLAG_EXTERNAL_LOCAL;
        }
        if self.dsr {
            flags |= FE_FLAG_DSR;
        }
        let fe_value = FrontendValue::new(
            ordinal,
            backends.len() as u32,
            local_count,
            flags,
            spec.affinity_secs,
        );
        self.frontends
            .insert(fe_key, fe_value, 0)
            .map_err(|source| MapError::Op {
                name: MAP_NAT_FE,
                source,
            })?;

        // Now nothing references the surplus block; trim it.
        for i in backends.len() as u32..old_count {
            let key = BackendKey { ordinal, index: i };
            let _ = self.backends.remove(&key);
        }

        self.allocations
            .insert(fe_key, (ordinal, backends.len() as u32));
        debug!(vip = %spec.vip, port = spec.port, backends = backends.len(), "programmed service");
        Ok(())
    }

    /// Remove a service: frontend first so no lookup can select a
    /// backend we are about to delete.
    pub fn remove_service(&mut self, vip: std::net::Ipv4Addr, port: u16, protocol: u8) -> Result<()> {
        let fe_key = FrontendKey::new(vip.octets(), port, protocol);
        match self.frontends.remove(&fe_key) {
            Ok(()) | Err(aya::maps::MapError::KeyNotFound) => {}
            Err(source) => {
                return Err(MapError::Op {
                    name: MAP_NAT_FE,
                    source,
                })
            }
        }

        if let Some((ordinal, count)) = self.allocations.remove(&fe_key) {
            for i in 0..count {
                let key = BackendKey { ordinal, index: i };
                let _ = self.backends.remove(&key);
            }
        }

        // Affinity entries for this frontend are now meaningless.
        let stale: Vec<AffinityKey> = self
            .affinity
            .keys()
            .filter_map(|k| k.ok())
            .filter(|k| k.frontend == fe_key)
            .collect();
        for key in stale {
            if let Err(e) = self.affinity.remove(&key) {
                warn!(error = %e, "failed to remove stale affinity entry");
            }
        }
        Ok(())
    }

    /// Frontend keys currently programmed; feeds the conntrack
    /// scanner's stale-NAT sweep.
    pub fn live_frontends(&self) -> HashSet<FrontendKey> {
        self.allocations.keys().copied().collect()
    }

    /// Remove kernel state for services we do not know, after a
    /// restart or on the periodic refresh.
    pub fn resync(&mut self) -> Result<()> {
        let known: HashSet<FrontendKey> = self.allocations.keys().copied().collect();
        let stale: Vec<FrontendKey> = self
            .frontends
            .keys()
            .filter_map(|k| k.ok())
            .filter(|k| !known.contains(k))
            .collect();
        for key in stale {
            warn!(?key, "removing unknown NAT frontend");
            let _ = self.frontends.remove(&key);
        }
        Ok(())
    }
}
