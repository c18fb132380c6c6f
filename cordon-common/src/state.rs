//! Per-CPU scratch state carried across tail calls.
//!
//! The main program decomposes the packet into this struct, the policy
//! program reads the pre-NAT tuple from it, and the accepted/ICMP
//! programs finish the job. One entry per CPU; a program run never
//! yields between tail calls so the slot cannot be reused mid-flight.

/// Packet state flags.
pub const ST_NAT_OUTGOING: u16 = 0x01;
pub const ST_SKIP_FIB: u16 = 0x02;
pub const ST_DEST_IS_HOST: u16 = 0x04;
pub const ST_SRC_IS_HOST: u16 = 0x08;

/// Policy verdicts left in `PacketState::pol_rc` by the policy
/// program.
pub const POL_NO_MATCH: u8 = 0;
pub const POL_ALLOW: u8 = 1;
pub const POL_DENY: u8 = 2;

/// The scratch entry, 64 bytes. Layout is part of the external map
/// schema: the policy program is generated separately and indexes
/// into this struct by offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketState {
    /// Source address, network-order octets.
    pub ip_src: [u8; 4],
    /// Destination address as seen on the wire.
    pub ip_dst: [u8; 4],
    /// Destination before any connect-time DNAT; what policy matches.
    pub pre_nat_ip_dst: [u8; 4],
    /// Destination after service NAT selection.
    pub post_nat_ip_dst: [u8; 4],
    /// Tunnel peer when the packet arrived encapsulated.
    pub tun_ip: [u8; 4],
    pub sport: u16,
    pub dport: u16,
    pub pre_nat_dport: u16,
    pub post_nat_dport: u16,
    pub ip_proto: u8,
    /// Conntrack lookup result (`conntrack::CT_LOOKUP_*`).
    pub ct_rc: u8,
    /// Flags copied out of the conntrack entry.
    pub ct_flags: u8,
    /// Policy verdict (`POL_*`), set by the policy program.
    pub pol_rc: u8,
    pub flags: u16,
    pub icmp_type: u8,
    pub icmp_code: u8,
    /// NAT rewrite data recovered from conntrack for established flows.
    pub ct_nat_addr: [u8; 4],
    pub ct_nat_port: u16,
    /// Chosen backend for new NATed flows.
    pub nat_backend_addr: [u8; 4],
    pub nat_backend_port: u16,
    /// Forward-leg interface recovered from conntrack.
    pub ct_ifindex_fwd: u32,
    pub _pad: [u8; 12],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_64_bytes() {
        assert_eq!(core::mem::size_of::<PacketState>(), 64);
    }
}
