//! Overlay encap/decap.
//!
//! The wire format is plain VXLAN-over-UDP with a fixed VNI so peer
//! nodes (and standard tooling) can decode it. Decap learns the peer's
//! MACs into the ARP map; encap consults it when forwarding replies
//! out a host interface.

use aya_ebpf::programs::TcContext;

use cordon_common::arp::{ArpKey, ArpValue};
use cordon_common::reasons::{REASON_ENCAP_FAIL, REASON_SHORT, REASON_UNAUTH_SOURCE};
use cordon_common::routes::RT_REMOTE_HOST;
use cordon_common::state::PacketState;
use cordon_common::{IPPROTO_UDP, VXLAN_ENCAP_OVERHEAD, VXLAN_VNI};

use crate::parse::{
    read_addr, read_u16_be, read_u8, ETH_HLEN, IP_HLEN, IP_OFF_CSUM, IP_OFF_PROTO, IP_OFF_SADDR,
    IP_OFF_TOT_LEN, UDP_HLEN,
};
use crate::skbops;
use crate::{overlay_port, routes_lookup_flags, ARP};

/// VXLAN header: flags (bit 3 = VNI valid), reserved, VNI << 8.
const VXLAN_HLEN: usize = 8;
const VXLAN_FLAG_VNI: u8 = 0x08;

/// Offset of the inner Ethernet header of an encapsulated packet.
const INNER_ETH_OFF: usize = ETH_HLEN + IP_HLEN + UDP_HLEN + VXLAN_HLEN;

/// Is this packet addressed to our overlay port?
#[inline(always)]
pub fn is_overlay_packet(ctx: &TcContext) -> bool {
    let Ok(proto) = read_u8(ctx, ETH_HLEN + IP_OFF_PROTO) else {
        return false;
    };
    if proto != IPPROTO_UDP {
        return false;
    }
    match read_u16_be(ctx, ETH_HLEN + IP_HLEN + 2) {
        Ok(dport) => dport == overlay_port(),
        Err(_) => false,
    }
}

pub enum Decap {
    /// Packet decapsulated; reparse from scratch.
    Decapped,
    /// Valid overlay packet from a peer, but not our VNI; let the
    /// stack have it.
    NotOurs,
}

/// Validate and strip the outer headers.
///
/// The outer source must be a known remote host; anything else is a
/// spoofed tunnel packet and is dropped. On success the peer address
/// is recorded in the state (`tun_ip`) and the peer's MACs are learned
/// into the ARP map for the reply path.
#[inline(always)]
pub fn attempt_decap(ctx: &TcContext, state: &mut PacketState) -> Result<Decap, u8> {
    let outer_src = read_addr(ctx, ETH_HLEN + IP_OFF_SADDR)?;
    if routes_lookup_flags(outer_src) & RT_REMOTE_HOST == 0 {
        return Err(REASON_UNAUTH_SOURCE);
    }

    let vni_off = ETH_HLEN + IP_HLEN + UDP_HLEN;
    let flags = read_u8(ctx, vni_off)?;
    if flags & VXLAN_FLAG_VNI == 0 {
        return Ok(Decap::NotOurs);
    }
    let vni = {
        let hi = read_u16_be(ctx, vni_off + 4)? as u32;
        let lo = read_u8(ctx, vni_off + 6)? as u32;
        (hi << 8) | lo
    };
    if vni != VXLAN_VNI {
        return Ok(Decap::NotOurs);
    }

    // Learn the peer's MACs before the outer header goes away.
    learn_arp(ctx, outer_src);

    if skbops::adjust_room(
        ctx,
        -((IP_HLEN + UDP_HLEN + VXLAN_HLEN + ETH_HLEN) as i32),
        aya_ebpf::bindings::BPF_ADJ_ROOM_MAC,
    )
    .is_err()
    {
        return Err(REASON_SHORT);
    }

    state.tun_ip = outer_src;
    Ok(Decap::Decapped)
}

#[inline(always)]
fn learn_arp(ctx: &TcContext, peer: [u8; 4]) {
    let data = ctx.data();
    if data + ETH_HLEN > ctx.data_end() {
        return;
    }
    // Reply direction swaps the roles: the packet's source MAC is our
    // future destination.
    let mac_dst = unsafe { *((data + 6) as *const [u8; 6]) };
    let mac_src = unsafe { *(data as *const [u8; 6]) };
    let key = ArpKey {
        addr: peer,
        ifindex: skbops::skb_ifindex(ctx),
    };
    let value = ArpValue { mac_dst, mac_src };
    let _ = ARP.insert(&key, &value, 0);
}

/// Would encapsulating this packet overflow the tunnel MTU?
#[inline(always)]
pub fn encap_too_big(ctx: &TcContext) -> bool {
    let Ok(tot_len) = read_u16_be(ctx, ETH_HLEN + IP_OFF_TOT_LEN) else {
        return false;
    };
    tot_len.saturating_add(VXLAN_ENCAP_OVERHEAD) > crate::tunnel_mtu()
}

/// Push outer Ethernet + IP + UDP + VXLAN headers around the packet.
///
/// The inner Ethernet header is carried as the VXLAN payload; the
/// outer source port is derived from the flow so ECMP spreads tunnel
/// traffic.
#[inline(always)]
pub fn encap(ctx: &TcContext, state: &mut PacketState, src: [u8; 4], dst: [u8; 4]) -> Result<(), u8> {
    let inner_len = skbops::skb_len(ctx) as usize;

    if skbops::adjust_room(
        ctx,
        (IP_HLEN + UDP_HLEN + VXLAN_HLEN + ETH_HLEN) as i32,
        aya_ebpf::bindings::BPF_ADJ_ROOM_MAC,
    )
    .is_err()
    {
        return Err(REASON_ENCAP_FAIL);
    }

    // Copy the (pre-encap) Ethernet header into the inner position,
    // then overwrite the outer one below.
    let data = ctx.data();
    let data_end = ctx.data_end();
    if data + INNER_ETH_OFF + ETH_HLEN > data_end {
        return Err(REASON_ENCAP_FAIL);
    }
    let inner_eth = unsafe { *(data as *const [u8; ETH_HLEN]) };
    if skbops::store(ctx, INNER_ETH_OFF, &inner_eth).is_err() {
        return Err(REASON_ENCAP_FAIL);
    }

    // Outer MACs: learned peer MACs when we have them, otherwise keep
    // what routing gave us.
    let arp_key = ArpKey {
        addr: dst,
        ifindex: skbops::skb_ifindex(ctx),
    };
    if let Some(arp) = unsafe { ARP.get(&arp_key) } {
        let _ = skbops::store(ctx, 0, &arp.mac_dst);
        let _ = skbops::store(ctx, 6, &arp.mac_src);
    }

    let outer_tot_len = (inner_len - ETH_HLEN + IP_HLEN + UDP_HLEN + VXLAN_HLEN + ETH_HLEN) as u16;
    let udp_len = (outer_tot_len as usize - IP_HLEN) as u16;

    let mut ip_hdr = [0u8; IP_HLEN];
    ip_hdr[0] = 0x45;
    ip_hdr[2..4].copy_from_slice(&outer_tot_len.to_be_bytes());
    ip_hdr[6] = 0x40; // DF
    ip_hdr[8] = 64; // TTL
    ip_hdr[9] = IPPROTO_UDP;
    ip_hdr[12..16].copy_from_slice(&src);
    ip_hdr[16..20].copy_from_slice(&dst);
    let csum = ip_header_checksum(&ip_hdr);
    ip_hdr[IP_OFF_CSUM..IP_OFF_CSUM + 2].copy_from_slice(&csum.to_be_bytes());
    if skbops::store(ctx, ETH_HLEN, &ip_hdr).is_err() {
        return Err(REASON_ENCAP_FAIL);
    }

    // Source port from the flow hash keeps one flow on one ECMP path.
    let sport = 49152
        | (cordon_common::hash::flow_hash(
            state.ip_proto,
            state.ip_src,
            state.sport,
            state.ip_dst,
            state.dport,
        ) & 0x3fff) as u16;
    let mut udp_hdr = [0u8; UDP_HLEN];
    udp_hdr[0..2].copy_from_slice(&sport.to_be_bytes());
    udp_hdr[2..4].copy_from_slice(&overlay_port().to_be_bytes());
    udp_hdr[4..6].copy_from_slice(&udp_len.to_be_bytes());
    // Checksum 0: legal for UDP over IPv4 and what peers expect.
    if skbops::store(ctx, ETH_HLEN + IP_HLEN, &udp_hdr).is_err() {
        return Err(REASON_ENCAP_FAIL);
    }

    let mut vxlan_hdr = [0u8; VXLAN_HLEN];
    vxlan_hdr[0] = VXLAN_FLAG_VNI;
    let vni_bytes = (VXLAN_VNI << 8).to_be_bytes();
    vxlan_hdr[4..8].copy_from_slice(&vni_bytes);
    if skbops::store(ctx, ETH_HLEN + IP_HLEN + UDP_HLEN, &vxlan_hdr).is_err() {
        return Err(REASON_ENCAP_FAIL);
    }

    state.sport = sport;
    state.dport = overlay_port();
    state.ip_proto = IPPROTO_UDP;
    state.ip_src = src;
    state.ip_dst = dst;
    Ok(())
}

/// RFC 1071 checksum over the 20-byte IPv4 header.
#[inline(always)]
pub fn ip_header_checksum(hdr: &[u8; IP_HLEN]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;
    while i < IP_HLEN {
        if i != IP_OFF_CSUM {
            sum += u32::from(u16::from_be_bytes([hdr[i], hdr[i + 1]]));
        }
        i += 2;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
