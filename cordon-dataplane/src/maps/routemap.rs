//! Kernel route-map programming (longest-prefix dataplane routes).
//!
//! Owned by the endpoint manager, which absorbs workload, host and
//! pool updates and reduces them to LPM entries the TC programs
//! consult for RPF, encap next-hops and NAT-outgoing decisions.

use std::collections::HashMap;
use std::path::Path;

use aya::maps::lpm_trie::{Key, LpmTrie};
use aya::maps::MapData;
use ipnet::Ipv4Net;
use tracing::{debug, warn};

use cordon_common::routes::RouteValue;

use super::{open_pinned, MapError, Result, MAP_ROUTES};

pub struct RouteMap {
    map: LpmTrie<MapData, [u8; 4], RouteValue>,
    desired: HashMap<Ipv4Net, RouteValue>,
}

impl RouteMap {
    pub fn open(pin_dir: &Path) -> Result<Self> {
        let map = open_pinned(pin_dir, MAP_ROUTES)?;
        let map = LpmTrie::try_from(map)
            .map_err(|_| MapError::WrongType { name: MAP_ROUTES })?;
        Ok(Self {
            map,
            desired: HashMap::new(),
        })
    }

    fn key(cidr: &Ipv4Net) -> Key<[u8; 4]> {
        Key::new(u32::from(cidr.prefix_len()), cidr.addr().octets())
    }

    pub fn upsert(&mut self, cidr: Ipv4Net, value: RouteValue) -> Result<()> {
        if self.desired.get(&cidr) == Some(&value) {
            return Ok(());
        }
        self.map
            .insert(&Self::key(&cidr), value, 0)
            .map_err(|source| MapError::Op {
                name: MAP_ROUTES,
                source,
            })?;
        debug!(%cidr, flags = value.flags, "route map entry upserted");
        self.desired.insert(cidr, value);
        Ok(())
    }

    pub fn remove(&mut self, cidr: &Ipv4Net) -> Result<()> {
        self.desired.remove(cidr);
        match self.map.remove(&Self::key(cidr)) {
            Ok(()) | Err(aya::maps::MapError::KeyNotFound) => Ok(()),
            Err(source) => Err(MapError::Op {
                name: MAP_ROUTES,
                source,
            }),
        }
    }

    pub fn get(&self, cidr: &Ipv4Net) -> Option<&RouteValue> {
        self.desired.get(cidr)
    }

    /// Rewrite every desired entry and delete kernel entries we do
    /// not recognize.
    pub fn resync(&mut self) -> Result<()> {
        let kernel_keys: Vec<Key<[u8; 4]>> = self.map.keys().filter_map(|k| k.ok()).collect();
        for key in kernel_keys {
            let data = key.data();
            let prefix_len = key.prefix_len();
            let cidr = Ipv4Net::new(data.into(), prefix_len as u8)
                .unwrap_or_else(|_| Ipv4Net::default());
            if !self.desired.contains_key(&cidr) {
                warn!(%cidr, "removing unknown route map entry");
                let _ = self.map.remove(&key);
            }
        }
        let entries: Vec<(Ipv4Net, RouteValue)> =
            self.desired.iter().map(|(k, v)| (*k, *v)).collect();
        for (cidr, value) in entries {
            self.map
                .insert(&Self::key(&cidr), value, 0)
                .map_err(|source| MapError::Op {
                    name: MAP_ROUTES,
                    source,
                })?;
        }
        Ok(())
    }
}
