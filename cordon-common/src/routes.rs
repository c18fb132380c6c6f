//! Route map schema: longest-prefix match over destination CIDRs.
//!
//! The key follows the kernel LPM trie layout (prefix length then
//! address); `aya::maps::lpm_trie::Key` and the in-kernel trie both
//! use it directly.

/// Maximum route entries.
pub const ROUTES_MAX_ENTRIES: u32 = 256 * 1024;

// Route flags.

/// Destination is an address owned by this node.
pub const RT_LOCAL_HOST: u32 = 0x01;
/// Destination is another node in the cluster.
pub const RT_REMOTE_HOST: u32 = 0x02;
/// Destination is a workload (here or elsewhere).
pub const RT_WORKLOAD: u32 = 0x04;
/// Workload is attached to this node; `ifindex` is valid.
pub const RT_LOCAL: u32 = 0x08;
/// Destination is inside a cluster IP pool.
pub const RT_IN_POOL: u32 = 0x10;
/// Pool has NAT-outgoing enabled; traffic leaving the pool is SNATed.
pub const RT_NAT_OUT: u32 = 0x20;

pub const RT_LOCAL_WORKLOAD: u32 = RT_WORKLOAD | RT_LOCAL;
pub const RT_REMOTE_WORKLOAD: u32 = RT_WORKLOAD;

/// LPM key: prefix length in bits, then the address octets.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteKey {
    pub prefix_len: u32,
    pub addr: [u8; 4],
}

impl RouteKey {
    pub const fn new(prefix_len: u32, addr: [u8; 4]) -> Self {
        Self { prefix_len, addr }
    }
}

/// Route value, 12 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteValue {
    pub flags: u32,
    /// Local interface for `RT_LOCAL` workloads; zero otherwise.
    pub ifindex: u32,
    /// Next-hop node address for remote workloads, network-order
    /// octets; zeroed for local destinations.
    pub next_hop: [u8; 4],
}

impl RouteValue {
    pub const fn new(flags: u32) -> Self {
        Self {
            flags,
            ifindex: 0,
            next_hop: [0; 4],
        }
    }

    pub const fn local_workload(ifindex: u32) -> Self {
        Self {
            flags: RT_LOCAL_WORKLOAD,
            ifindex,
            next_hop: [0; 4],
        }
    }

    pub const fn remote_workload(next_hop: [u8; 4]) -> Self {
        Self {
            flags: RT_REMOTE_WORKLOAD,
            ifindex: 0,
            next_hop,
        }
    }

    pub const fn is_local_host(&self) -> bool {
        self.flags & RT_LOCAL_HOST != 0
    }

    pub const fn is_remote_host(&self) -> bool {
        self.flags & RT_REMOTE_HOST != 0
    }

    pub const fn is_local_workload(&self) -> bool {
        self.flags & RT_LOCAL_WORKLOAD == RT_LOCAL_WORKLOAD
    }

    pub const fn is_local(&self) -> bool {
        self.flags & (RT_LOCAL | RT_LOCAL_HOST) != 0
    }

    pub const fn is_workload(&self) -> bool {
        self.flags & RT_WORKLOAD != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts() {
        assert_eq!(core::mem::size_of::<RouteKey>(), 8);
        assert_eq!(core::mem::size_of::<RouteValue>(), 12);
    }

    #[test]
    fn local_workload_implies_workload_and_local() {
        let v = RouteValue::local_workload(3);
        assert!(v.is_local_workload());
        assert!(v.is_workload());
        assert!(v.is_local());
        assert!(!v.is_remote_host());
    }

    #[test]
    fn remote_workload_is_not_local() {
        let v = RouteValue::remote_workload([10, 0, 0, 2]);
        assert!(v.is_workload());
        assert!(!v.is_local_workload());
        assert!(!v.is_local());
    }
}
