//! Fast-path IP sets: LPM map entries instead of kernel ipsets.
//!
//! Implements the same writer interface as the `ipset` backend so the
//! IP-sets manager and the driver are oblivious to the mode. Set ids
//! are mapped to numeric ids; members parse from the upstream string
//! forms ("10.0.0.0/24", "10.0.0.1,tcp:8080").

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use aya::maps::lpm_trie::{Key, LpmTrie};
use aya::maps::MapData;
use tracing::{debug, warn};

use cordon_common::ipsets::{IpSetKey, PREFIX_SET_ID};

use crate::ipsets::{IpSetError, IpSetsWriter, Result};
use crate::proto::IpSetKind;

use super::{open_pinned, MAP_IPSETS};

/// Maps upstream set ids to the numeric ids used in the kernel map.
/// Shared with the program-attachment manager so flattened policy
/// rules and set entries agree.
#[derive(Debug, Default)]
pub struct IpSetIdAllocator {
    ids: HashMap<String, u64>,
    next_id: u64,
}

impl IpSetIdAllocator {
    pub fn new() -> Self {
        Self {
            ids: HashMap::new(),
            next_id: 1,
        }
    }

    /// Numeric id for a set, allocating on first use.
    pub fn get_or_alloc(&mut self, set_id: &str) -> u64 {
        if let Some(id) = self.ids.get(set_id) {
            return *id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ids.insert(set_id.to_string(), id);
        id
    }

    pub fn get(&self, set_id: &str) -> Option<u64> {
        self.ids.get(set_id).copied()
    }

    pub fn release(&mut self, set_id: &str) -> Option<u64> {
        self.ids.remove(set_id)
    }

    pub fn live_ids(&self) -> Vec<u64> {
        self.ids.values().copied().collect()
    }
}

pub struct BpfIpSets {
    map: LpmTrie<MapData, IpSetKey, u32>,
    ids: std::sync::Arc<std::sync::Mutex<IpSetIdAllocator>>,
    desired: HashMap<String, BTreeSet<String>>,
    dirty: HashSet<String>,
    pending_deletions: HashSet<String>,
    need_resync: bool,
}

/// A parsed member: CIDR plus optional protocol/port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub addr: [u8; 4],
    pub prefix_len: u8,
    pub protocol: u8,
    pub port: u16,
}

impl Member {
    /// Prefix length of the LPM entry for this member.
    fn lpm_prefix(&self) -> u32 {
        if self.protocol == 0 && self.port == 0 {
            PREFIX_SET_ID + u32::from(self.prefix_len)
        } else {
            cordon_common::ipsets::PREFIX_FULL
        }
    }
}

/// Parse the upstream member forms: `addr`, `addr/len`,
/// `addr,proto:port`.
pub fn parse_member(s: &str) -> Option<Member> {
    let (addr_part, rest) = match s.split_once(',') {
        Some((a, r)) => (a, Some(r)),
        None => (s, None),
    };

    let (addr, prefix_len) = match addr_part.split_once('/') {
        Some((a, l)) => (a.parse::<std::net::Ipv4Addr>().ok()?, l.parse().ok()?),
        None => (addr_part.parse::<std::net::Ipv4Addr>().ok()?, 32),
    };
    if prefix_len > 32 {
        return None;
    }

    let (protocol, port) = match rest {
        Some(r) => {
            let (proto_s, port_s) = r.split_once(':')?;
            let protocol = match proto_s {
                "tcp" => 6,
                "udp" => 17,
                "sctp" => 132,
                other => other.parse().ok()?,
            };
            (protocol, port_s.parse().ok()?)
        }
        None => (0, 0),
    };

    Some(Member {
        addr: addr.octets(),
        prefix_len,
        protocol,
        port,
    })
}

impl BpfIpSets {
    pub fn open(
        pin_dir: &Path,
        ids: std::sync::Arc<std::sync::Mutex<IpSetIdAllocator>>,
    ) -> std::result::Result<Self, super::MapError> {
        let map = open_pinned(pin_dir, MAP_IPSETS)?;
        let map = LpmTrie::try_from(map)
            .map_err(|_| super::MapError::WrongType { name: MAP_IPSETS })?;
        Ok(Self {
            map,
            ids,
            desired: HashMap::new(),
            dirty: HashSet::new(),
            pending_deletions: HashSet::new(),
            need_resync: false,
        })
    }

    fn write_set(&mut self, set_id: &str) -> Result<()> {
        let Some(members) = self.desired.get(set_id).cloned() else {
            return Ok(());
        };
        let id = self.ids.lock().unwrap().get_or_alloc(set_id);
        for member_s in &members {
            let Some(member) = parse_member(member_s) else {
                warn!(set = set_id, member = %member_s, "unparseable set member");
                continue;
            };
            let key = Key::new(
                member.lpm_prefix(),
                IpSetKey::member(id, member.addr, member.port, member.protocol),
            );
            self.map
                .insert(&key, 1, 0)
                .map_err(|e| IpSetError::CommandFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn delete_member(&mut self, id: u64, member_s: &str) {
        let Some(member) = parse_member(member_s) else {
            return;
        };
        let key = Key::new(
            member.lpm_prefix(),
            IpSetKey::member(id, member.addr, member.port, member.protocol),
        );
        let _ = self.map.remove(&key);
    }

    fn delete_set_entries(&mut self, id: u64) {
        let id_be = id.to_be_bytes();
        let keys: Vec<Key<IpSetKey>> = self
            .map
            .keys()
            .filter_map(|k| k.ok())
            .filter(|k| {
                let data = k.data();
                data.set_id == id_be
            })
            .collect();
        for key in keys {
            let _ = self.map.remove(&key);
        }
    }
}

impl IpSetsWriter for BpfIpSets {
    fn add_or_replace_members(&mut self, set_id: &str, _kind: IpSetKind, members: Vec<String>) {
        self.pending_deletions.remove(set_id);
        self.desired
            .insert(set_id.to_string(), members.into_iter().collect());
        self.dirty.insert(set_id.to_string());
    }

    fn add_members(&mut self, set_id: &str, members: Vec<String>) {
        if let Some(set) = self.desired.get_mut(set_id) {
            set.extend(members);
            self.dirty.insert(set_id.to_string());
        }
    }

    fn remove_members(&mut self, set_id: &str, members: Vec<String>) {
        let Some(set) = self.desired.get_mut(set_id) else {
            return;
        };
        let mut removed = Vec::new();
        for member in members {
            if set.remove(&member) {
                removed.push(member);
            }
        }
        if removed.is_empty() {
            return;
        }
        self.dirty.insert(set_id.to_string());
        let id = self.ids.lock().unwrap().get(set_id);
        if let Some(id) = id {
            for member in removed {
                self.delete_member(id, &member);
            }
        }
    }

    fn remove_set(&mut self, set_id: &str) {
        self.desired.remove(set_id);
        self.dirty.remove(set_id);
        self.pending_deletions.insert(set_id.to_string());
    }

    fn queue_resync(&mut self) {
        self.need_resync = true;
    }

    fn apply_updates(&mut self) -> Result<()> {
        if self.need_resync {
            // Remove entries for ids we no longer know, then rewrite
            // everything desired.
            let live: HashSet<[u8; 8]> = self
                .ids
                .lock()
                .unwrap()
                .live_ids()
                .into_iter()
                .map(|id| id.to_be_bytes())
                .collect();
            let stale: Vec<Key<IpSetKey>> = self
                .map
                .keys()
                .filter_map(|k| k.ok())
                .filter(|k| {
                    let data = k.data();
                    !live.contains(&data.set_id)
                })
                .collect();
            for key in stale {
                let _ = self.map.remove(&key);
            }
            for set_id in self.desired.keys().cloned().collect::<Vec<_>>() {
                self.dirty.insert(set_id);
            }
            self.need_resync = false;
        }

        let dirty: Vec<String> = self.dirty.drain().collect();
        for set_id in dirty {
            self.write_set(&set_id)?;
            debug!(set = %set_id, "fast-path set written");
        }
        Ok(())
    }

    fn apply_deletions(&mut self) -> Result<()> {
        let deletions: Vec<String> = self.pending_deletions.drain().collect();
        for set_id in deletions {
            let id = self.ids.lock().unwrap().release(&set_id);
            if let Some(id) = id {
                self.delete_set_entries(id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_address() {
        let m = parse_member("10.0.0.1").unwrap();
        assert_eq!(m.addr, [10, 0, 0, 1]);
        assert_eq!(m.prefix_len, 32);
        assert_eq!((m.protocol, m.port), (0, 0));
    }

    #[test]
    fn parses_cidr() {
        let m = parse_member("10.1.0.0/16").unwrap();
        assert_eq!(m.prefix_len, 16);
    }

    #[test]
    fn parses_proto_port_member() {
        let m = parse_member("10.0.0.1,tcp:8080").unwrap();
        assert_eq!((m.protocol, m.port), (6, 8080));
        let m = parse_member("10.0.0.1,udp:53").unwrap();
        assert_eq!((m.protocol, m.port), (17, 53));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_member("").is_none());
        assert!(parse_member("10.0.0.1,tcp").is_none());
        assert!(parse_member("10.0.0.0/64").is_none());
        assert!(parse_member("not-an-ip").is_none());
    }
}
