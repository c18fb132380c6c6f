//! Shared map schema for the cordon dataplane.
//!
//! Every type in this crate crosses the kernel/userland boundary: the
//! TC programs in `cordon-ebpf` read and write these structs through
//! BPF maps and the agent in `cordon-dataplane` programs the same maps
//! from userland. Layouts are `#[repr(C)]` and must not change without
//! a coordinated upgrade of both halves and of peer nodes (the VXLAN
//! wire format and the conntrack schema are shared across the
//! cluster).
//!
//! Keep this crate `no_std` friendly so it can be used from eBPF code.
//! The `user` feature adds `aya::Pod` impls for the userland side.

#![cfg_attr(not(any(feature = "user", test)), no_std)]

pub mod arp;
pub mod conntrack;
pub mod failsafe;
pub mod hash;
pub mod ipsets;
pub mod jump;
pub mod marks;
pub mod nat;
pub mod policy;
pub mod reasons;
pub mod routes;
pub mod state;

/// UDP port carrying overlay (VXLAN) traffic between nodes.
pub const VXLAN_PORT: u16 = 4789;

/// VNI stamped on every overlay packet we originate.
pub const VXLAN_VNI: u32 = 4096;

/// Bytes of overhead added by the overlay encap: outer IP (20) +
/// outer UDP (8) + VXLAN (8) + inner Ethernet (14).
pub const VXLAN_ENCAP_OVERHEAD: u16 = 50;

// IP protocol numbers used throughout the dataplane.
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_IPIP: u8 = 4;
pub const IPPROTO_SCTP: u8 = 132;

// EtherTypes.
pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_ARP: u16 = 0x0806;
pub const ETH_P_IPV6: u16 = 0x86DD;

#[cfg(feature = "user")]
mod user_impls {
    use super::arp::{ArpKey, ArpValue};
    use super::conntrack::{ConntrackKey, ConntrackValue};
    use super::failsafe::FailsafeKey;
    use super::nat::{AffinityKey, AffinityValue, BackendKey, BackendValue, FrontendKey, FrontendValue};
    use super::routes::RouteValue;
    use super::state::PacketState;
    use aya::Pod;

    unsafe impl Pod for ConntrackKey {}
    unsafe impl Pod for ConntrackValue {}
    unsafe impl Pod for FrontendKey {}
    unsafe impl Pod for FrontendValue {}
    unsafe impl Pod for BackendKey {}
    unsafe impl Pod for BackendValue {}
    unsafe impl Pod for AffinityKey {}
    unsafe impl Pod for AffinityValue {}
    unsafe impl Pod for RouteValue {}
    unsafe impl Pod for ArpKey {}
    unsafe impl Pod for ArpValue {}
    unsafe impl Pod for FailsafeKey {}
    unsafe impl Pod for PacketState {}
}
