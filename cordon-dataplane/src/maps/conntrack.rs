//! Conntrack table handle and the userland scanner.
//!
//! BPF hash maps have no expiry, so the scanner sweeps the table on
//! an interval, evicting entries past their protocol timeout and NAT
//! entries whose service has gone away. Only the TC programs create
//! entries; the scanner only reads and deletes.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use aya::maps::{HashMap as AyaHashMap, MapData};
use tokio::time;
use tracing::{debug, info, warn};

use cordon_common::conntrack::{
    ConntrackKey, ConntrackValue, Timeouts, CT_TYPE_NAT_FWD, CT_TYPE_NAT_REV,
};
use cordon_common::nat::FrontendKey;

use super::{open_pinned, MapError, Result, MAP_CONNTRACK};

pub struct ConntrackTable {
    map: AyaHashMap<MapData, ConntrackKey, ConntrackValue>,
}

impl ConntrackTable {
    pub fn open(pin_dir: &Path) -> Result<Self> {
        let map = open_pinned(pin_dir, MAP_CONNTRACK)?;
        let map = AyaHashMap::try_from(map).map_err(|_| MapError::WrongType {
            name: MAP_CONNTRACK,
        })?;
        Ok(Self { map })
    }

    pub fn entries(&self) -> impl Iterator<Item = (ConntrackKey, ConntrackValue)> + '_ {
        self.map.iter().filter_map(|e| e.ok())
    }

    pub fn remove(&mut self, key: &ConntrackKey) -> Result<()> {
        match self.map.remove(key) {
            Ok(()) | Err(aya::maps::MapError::KeyNotFound) => Ok(()),
            Err(source) => Err(MapError::Op {
                name: MAP_CONNTRACK,
                source,
            }),
        }
    }
}

/// Decide which keys to evict. Pure so the sweep logic is testable
/// without a kernel.
pub fn expired_keys(
    entries: &[(ConntrackKey, ConntrackValue)],
    timeouts: &Timeouts,
    now_ns: u64,
    live_frontends: &HashSet<FrontendKey>,
) -> Vec<ConntrackKey> {
    let mut evict = Vec::new();
    for (key, value) in entries {
        let established = value.leg_ba.seen_reply != 0;
        let timeout = timeouts.for_entry(key.protocol, established);
        if now_ns.saturating_sub(value.last_seen_ns) > timeout {
            evict.push(*key);
            continue;
        }
        // NAT-forward entries are keyed by the original (VIP)
        // destination; if the service is gone, the flow can never
        // progress and holds a backend pinned.
        if value.entry_type == CT_TYPE_NAT_FWD {
            let fe = FrontendKey::new(key.dst_addr, key.dst_port, key.protocol);
            if !live_frontends.contains(&fe) {
                evict.push(*key);
            }
        }
    }
    evict
}

/// Companion reverse keys for evicted NAT entries, preserving the
/// both-or-neither invariant of the entry pairs.
pub fn companion_keys(
    evicted: &[ConntrackKey],
    entries: &[(ConntrackKey, ConntrackValue)],
) -> Vec<ConntrackKey> {
    let mut out = Vec::new();
    for key in evicted {
        let Some((_, value)) = entries.iter().find(|(k, _)| k == key) else {
            continue;
        };
        match value.entry_type {
            CT_TYPE_NAT_FWD => {
                // The forward entry records the backend; the reverse
                // entry is keyed by (client, backend).
                out.push(ConntrackKey::new(
                    key.protocol,
                    key.src_addr,
                    key.src_port,
                    value.nat_addr,
                    value.nat_port,
                ));
            }
            CT_TYPE_NAT_REV => {
                // The reverse entry records the VIP; the forward
                // entry is keyed by (client, VIP).
                out.push(ConntrackKey::new(
                    key.protocol,
                    key.src_addr,
                    key.src_port,
                    value.nat_addr,
                    value.nat_port,
                ));
            }
            _ => {}
        }
    }
    out
}

/// Periodic sweep task.
pub struct ConntrackScanner {
    table: ConntrackTable,
    timeouts: Timeouts,
    interval: Duration,
    /// Updated by the service manager through a watch channel.
    frontends: tokio::sync::watch::Receiver<HashSet<FrontendKey>>,
}

impl ConntrackScanner {
    pub fn new(
        table: ConntrackTable,
        timeouts: Timeouts,
        interval: Duration,
        frontends: tokio::sync::watch::Receiver<HashSet<FrontendKey>>,
    ) -> Self {
        Self {
            table,
            timeouts,
            interval,
            frontends,
        }
    }

    /// One sweep; returns the number of evicted entries.
    pub fn scan(&mut self, now_ns: u64) -> usize {
        let entries: Vec<_> = self.table.entries().collect();
        let live = self.frontends.borrow().clone();
        let mut evict = expired_keys(&entries, &self.timeouts, now_ns, &live);
        let companions = companion_keys(&evict, &entries);
        evict.extend(companions);

        let mut removed = 0;
        for key in evict {
            match self.table.remove(&key) {
                Ok(()) => removed += 1,
                Err(e) => warn!(error = %e, "failed to remove conntrack entry"),
            }
        }
        if removed > 0 {
            debug!(removed, "conntrack sweep evicted entries");
        }
        removed
    }

    pub async fn run(mut self) {
        info!(interval = ?self.interval, "conntrack scanner started");
        let mut ticker = time::interval(self.interval);
        loop {
            ticker.tick().await;
            let now_ns = monotonic_ns();
            let _ = tokio::task::block_in_place(|| self.scan(now_ns));
        }
    }
}

/// CLOCK_MONOTONIC in nanoseconds, the clock `bpf_ktime_get_ns` uses.
pub fn monotonic_ns() -> u64 {
    let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .unwrap_or(nix::sys::time::TimeSpec::new(0, 0));
    ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordon_common::conntrack::{ConntrackLeg, CT_TYPE_NORMAL};

    fn entry(last_seen_ns: u64, established: bool) -> ConntrackValue {
        ConntrackValue {
            entry_type: CT_TYPE_NORMAL,
            last_seen_ns,
            leg_ba: ConntrackLeg {
                seen_reply: established as u8,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn stale_udp_evicted_fresh_tcp_kept() {
        let timeouts = Timeouts::default();
        let now = 10 * timeouts.udp_ns;
        let udp_key = ConntrackKey::new(17, [1, 1, 1, 1], 1, [2, 2, 2, 2], 53);
        let tcp_key = ConntrackKey::new(6, [1, 1, 1, 1], 2, [2, 2, 2, 2], 80);
        let entries = vec![
            (udp_key, entry(0, false)),
            (tcp_key, entry(now - 1, true)),
        ];
        let evicted = expired_keys(&entries, &timeouts, now, &HashSet::new());
        assert_eq!(evicted, vec![udp_key]);
    }

    #[test]
    fn nat_pair_evicted_together() {
        let timeouts = Timeouts::default();
        let vip = [10, 0, 0, 1];
        let backend = [8, 8, 8, 8];
        let client = [1, 1, 1, 1];
        let fwd_key = ConntrackKey::new(6, client, 5000, vip, 80);
        let fwd_value = ConntrackValue {
            entry_type: CT_TYPE_NAT_FWD,
            nat_addr: backend,
            nat_port: 666,
            last_seen_ns: 0,
            ..Default::default()
        };
        let rev_key = ConntrackKey::new(6, client, 5000, backend, 666);
        let rev_value = ConntrackValue {
            entry_type: CT_TYPE_NAT_REV,
            nat_addr: vip,
            nat_port: 80,
            last_seen_ns: 0,
            ..Default::default()
        };
        let entries = vec![(fwd_key, fwd_value), (rev_key, rev_value)];

        let timeouts_now = timeouts.tcp_setup_ns * 2;
        let evicted = expired_keys(&entries, &timeouts, timeouts_now, &HashSet::new());
        let companions = companion_keys(&evicted, &entries);
        let mut all: Vec<_> = evicted.into_iter().chain(companions).collect();
        all.sort_by_key(|k| k.dst_port);
        all.dedup();
        assert!(all.contains(&fwd_key));
        assert!(all.contains(&rev_key));
    }

    #[test]
    fn nat_forward_without_frontend_is_evicted() {
        let timeouts = Timeouts::default();
        let fwd_key = ConntrackKey::new(6, [1, 1, 1, 1], 5000, [10, 0, 0, 1], 80);
        let fwd_value = ConntrackValue {
            entry_type: CT_TYPE_NAT_FWD,
            nat_addr: [8, 8, 8, 8],
            nat_port: 666,
            last_seen_ns: 1,
            leg_ba: ConntrackLeg {
                seen_reply: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let entries = vec![(fwd_key, fwd_value)];

        // Service still exists: kept.
        let mut live = HashSet::new();
        live.insert(FrontendKey::new([10, 0, 0, 1], 80, 6));
        assert!(expired_keys(&entries, &timeouts, 2, &live).is_empty());

        // Service gone: evicted even though fresh.
        assert_eq!(
            expired_keys(&entries, &timeouts, 2, &HashSet::new()),
            vec![fwd_key]
        );
    }
}
