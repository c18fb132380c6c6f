//! Userland handles for the shared BPF maps.
//!
//! The maps are created (and pinned) by the first program load; these
//! wrappers open the pins and give each manager a typed, owned handle
//! for the slice it programs. Components that only read take their
//! own read handle via `open_*`.

mod conntrack;
mod ipsets_map;
mod natmaps;
mod routemap;

pub use conntrack::{ConntrackScanner, ConntrackTable};
pub use ipsets_map::{BpfIpSets, IpSetIdAllocator};
pub use natmaps::NatMaps;
pub use routemap::RouteMap;

use std::path::{Path, PathBuf};

use aya::maps::{HashMap as AyaHashMap, Map, MapData, MapType};
use thiserror::Error;

use cordon_common::arp::{ArpKey, ArpValue};
use cordon_common::failsafe::FailsafeKey;

// Pinned map file names; must match the `#[map(name = ...)]`
// declarations in the TC programs.
pub const MAP_CONNTRACK: &str = "cordon_ct";
pub const MAP_NAT_FE: &str = "cordon_nat_fe";
pub const MAP_NAT_BE: &str = "cordon_nat_be";
pub const MAP_NAT_AFF: &str = "cordon_nat_aff";
pub const MAP_CT_NATS: &str = "cordon_ct_nats";
pub const MAP_ROUTES: &str = "cordon_routes";
pub const MAP_ARP: &str = "cordon_arp";
pub const MAP_IPSETS: &str = "cordon_ipsets";
pub const MAP_FAILSAFES: &str = "cordon_failsafes";
pub const MAP_POLICY_RULES: &str = "cordon_pol_rules";
pub const MAP_POLICY_CFG: &str = "cordon_pol_cfg";
pub const MAP_JUMP: &str = "cordon_jump";

#[derive(Debug, Error)]
pub enum MapError {
    #[error("failed to open pinned map {name}: {source}")]
    Pin {
        name: &'static str,
        source: aya::maps::MapError,
    },

    #[error("map {name} has unexpected type")]
    WrongType { name: &'static str },

    #[error("map operation on {name} failed: {source}")]
    Op {
        name: &'static str,
        source: aya::maps::MapError,
    },

    #[error("map {name} is exhausted")]
    Exhausted { name: &'static str },
}

pub type Result<T> = std::result::Result<T, MapError>;

/// Open one pinned map by name.
pub fn open_pinned(pin_dir: &Path, name: &'static str) -> Result<Map> {
    let path: PathBuf = pin_dir.join(name);
    let data = MapData::from_pin(&path).map_err(|source| MapError::Pin { name, source })?;
    let map_type = data
        .info()
        .and_then(|info| info.map_type())
        .map_err(|source| MapError::Pin { name, source })?;
    Ok(match map_type {
        MapType::Array => Map::Array(data),
        MapType::BloomFilter => Map::BloomFilter(data),
        MapType::CpuMap => Map::CpuMap(data),
        MapType::DevMap => Map::DevMap(data),
        MapType::DevMapHash => Map::DevMapHash(data),
        MapType::Hash => Map::HashMap(data),
        MapType::LpmTrie => Map::LpmTrie(data),
        MapType::LruHash => Map::LruHashMap(data),
        MapType::PerCpuArray => Map::PerCpuArray(data),
        MapType::PerCpuHash => Map::PerCpuHashMap(data),
        MapType::LruPerCpuHash => Map::PerCpuLruHashMap(data),
        MapType::PerfEventArray => Map::PerfEventArray(data),
        MapType::ProgramArray => Map::ProgramArray(data),
        MapType::Queue => Map::Queue(data),
        MapType::RingBuf => Map::RingBuf(data),
        MapType::SockHash => Map::SockHash(data),
        MapType::SockMap => Map::SockMap(data),
        MapType::Stack => Map::Stack(data),
        MapType::StackTrace => Map::StackTraceMap(data),
        MapType::XskMap => Map::XskMap(data),
        _ => Map::Unsupported(data),
    })
}

/// Typed failsafe-port set handle, owned by the failsafe manager.
pub struct FailsafeMap {
    map: AyaHashMap<MapData, FailsafeKey, u8>,
}

impl FailsafeMap {
    pub fn open(pin_dir: &Path) -> Result<Self> {
        let map = open_pinned(pin_dir, MAP_FAILSAFES)?;
        let map = AyaHashMap::try_from(map).map_err(|_| MapError::WrongType {
            name: MAP_FAILSAFES,
        })?;
        Ok(Self { map })
    }

    pub fn insert(&mut self, key: FailsafeKey) -> Result<()> {
        self.map.insert(key, 1, 0).map_err(|source| MapError::Op {
            name: MAP_FAILSAFES,
            source,
        })
    }

    pub fn remove(&mut self, key: &FailsafeKey) -> Result<()> {
        match self.map.remove(key) {
            Ok(()) => Ok(()),
            // Already gone: converged.
            Err(aya::maps::MapError::KeyNotFound) => Ok(()),
            Err(source) => Err(MapError::Op {
                name: MAP_FAILSAFES,
                source,
            }),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = FailsafeKey> + '_ {
        self.map.keys().filter_map(|k| k.ok())
    }
}

/// Read-only ARP map view, for diagnostics.
pub struct ArpMap {
    map: AyaHashMap<MapData, ArpKey, ArpValue>,
}

impl ArpMap {
    pub fn open(pin_dir: &Path) -> Result<Self> {
        let map = open_pinned(pin_dir, MAP_ARP)?;
        let map = AyaHashMap::try_from(map)
            .map_err(|_| MapError::WrongType { name: MAP_ARP })?;
        Ok(Self { map })
    }

    pub fn entries(&self) -> impl Iterator<Item = (ArpKey, ArpValue)> + '_ {
        self.map.iter().filter_map(|e| e.ok())
    }
}
