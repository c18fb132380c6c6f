//! L2/L3/L4 parsing into the scratch state.

use aya_ebpf::programs::TcContext;

use cordon_common::reasons::{REASON_IP_MALFORMED, REASON_IP_OPTIONS, REASON_SHORT};
use cordon_common::state::PacketState;
use cordon_common::{ETH_P_ARP, ETH_P_IP, ETH_P_IPV6, IPPROTO_ICMP, IPPROTO_IPIP, IPPROTO_TCP, IPPROTO_UDP};

use crate::flavor::Flavor;
use crate::{host_ip, routes_lookup_flags};

pub const ETH_HLEN: usize = 14;
pub const IP_HLEN: usize = 20;
pub const UDP_HLEN: usize = 8;

// Offsets within the IPv4 header.
pub const IP_OFF_TOT_LEN: usize = 2;
pub const IP_OFF_FRAG: usize = 6;
pub const IP_OFF_TTL: usize = 8;
pub const IP_OFF_PROTO: usize = 9;
pub const IP_OFF_CSUM: usize = 10;
pub const IP_OFF_SADDR: usize = 12;
pub const IP_OFF_DADDR: usize = 16;

pub enum ParseVerdict {
    /// Keep going through the state machine.
    Proceed,
    /// Let the packet through without applying policy.
    AllowNoPolicy,
}

#[inline(always)]
pub fn read_u8(ctx: &TcContext, off: usize) -> Result<u8, u8> {
    let data = ctx.data();
    if data + off + 1 > ctx.data_end() {
        return Err(REASON_SHORT);
    }
    Ok(unsafe { *((data + off) as *const u8) })
}

#[inline(always)]
pub fn read_u16_be(ctx: &TcContext, off: usize) -> Result<u16, u8> {
    let data = ctx.data();
    if data + off + 2 > ctx.data_end() {
        return Err(REASON_SHORT);
    }
    Ok(u16::from_be(unsafe { *((data + off) as *const u16) }))
}

#[inline(always)]
pub fn read_addr(ctx: &TcContext, off: usize) -> Result<[u8; 4], u8> {
    let data = ctx.data();
    if data + off + 4 > ctx.data_end() {
        return Err(REASON_SHORT);
    }
    Ok(unsafe { *((data + off) as *const [u8; 4]) })
}

/// Parse up to and including the IP header.
///
/// ARP is allowed without policy. IPv6 from a workload is dropped,
/// from a host interface allowed (not yet supported on the fast
/// path). Unknown ethertypes are dropped from workloads and allowed on
/// host interfaces. Malformed IP (IHL < 5) is dropped; IP options are
/// dropped unless the packet is addressed to this host from the
/// fabric.
#[inline(always)]
pub fn parse_packet_ip(ctx: &TcContext, flavor: Flavor) -> Result<ParseVerdict, u8> {
    let data = ctx.data();
    let data_end = ctx.data_end();

    if data + ETH_HLEN > data_end {
        return Err(REASON_SHORT);
    }
    let eth_proto = u16::from_be(unsafe { *((data + 12) as *const u16) });

    match eth_proto {
        ETH_P_IP => {}
        ETH_P_ARP => return Ok(ParseVerdict::AllowNoPolicy),
        ETH_P_IPV6 => {
            if flavor.workload_iface() {
                return Err(REASON_IP_MALFORMED);
            }
            return Ok(ParseVerdict::AllowNoPolicy);
        }
        _ => {
            if flavor.workload_iface() {
                return Err(REASON_IP_MALFORMED);
            }
            return Ok(ParseVerdict::AllowNoPolicy);
        }
    }

    // Validate up to a UDP-sized packet before touching the header.
    if data + ETH_HLEN + IP_HLEN + UDP_HLEN > data_end {
        return Err(REASON_SHORT);
    }

    let version_ihl = unsafe { *((data + ETH_HLEN) as *const u8) };
    let ihl = version_ihl & 0x0f;
    if ihl < 5 {
        return Err(REASON_IP_MALFORMED);
    }
    if ihl > 5 {
        let dst = read_addr(ctx, ETH_HLEN + IP_OFF_DADDR)?;
        if flavor.workload_iface() || !(flavor.from_host_iface() && dst == host_ip()) {
            return Err(REASON_IP_OPTIONS);
        }
        // Options to this host: allowed, but the stack deals with it.
        return Ok(ParseVerdict::AllowNoPolicy);
    }

    Ok(ParseVerdict::Proceed)
}

/// Copy the IP header fields the rest of the pipeline needs.
#[inline(always)]
pub fn fill_state_from_ip(ctx: &TcContext, state: &mut PacketState) -> Result<(), u8> {
    state.ip_src = read_addr(ctx, ETH_HLEN + IP_OFF_SADDR)?;
    state.ip_dst = read_addr(ctx, ETH_HLEN + IP_OFF_DADDR)?;
    state.pre_nat_ip_dst = state.ip_dst;
    state.post_nat_ip_dst = state.ip_dst;
    state.ip_proto = read_u8(ctx, ETH_HLEN + IP_OFF_PROTO)?;
    Ok(())
}

/// Parse the transport header.
///
/// Overlay-port UDP between known hosts is allowed without policy
/// (decap happens earlier, on the ingress hook). IP-in-IP is allowed
/// between known hosts and dropped otherwise.
#[inline(always)]
pub fn fill_state_from_next_header(
    ctx: &TcContext,
    state: &mut PacketState,
    flavor: Flavor,
) -> Result<ParseVerdict, u8> {
    let l4 = ETH_HLEN + IP_HLEN;
    match state.ip_proto {
        IPPROTO_TCP => {
            // TCP headers are larger than the UDP floor we validated.
            if ctx.data() + l4 + 20 > ctx.data_end() {
                return Err(REASON_SHORT);
            }
            state.sport = read_u16_be(ctx, l4)?;
            state.dport = read_u16_be(ctx, l4 + 2)?;
        }
        IPPROTO_UDP => {
            state.sport = read_u16_be(ctx, l4)?;
            state.dport = read_u16_be(ctx, l4 + 2)?;
            if state.dport == crate::overlay_port() && flavor.to_host_iface() {
                let dst_flags = routes_lookup_flags(state.ip_dst);
                if dst_flags & cordon_common::routes::RT_REMOTE_HOST != 0
                    && state.ip_src == host_ip()
                {
                    // Our own overlay traffic to a peer node.
                    return Ok(ParseVerdict::AllowNoPolicy);
                }
                // The user may run VXLAN on the same port with another
                // VNI; fall through to policy rather than drop.
            }
        }
        IPPROTO_ICMP => {
            state.icmp_type = read_u8(ctx, l4)?;
            state.icmp_code = read_u8(ctx, l4 + 1)?;
        }
        IPPROTO_IPIP => {
            if flavor.from_host_iface() {
                let src_flags = routes_lookup_flags(state.ip_src);
                if src_flags & cordon_common::routes::RT_REMOTE_HOST != 0 {
                    return Ok(ParseVerdict::AllowNoPolicy);
                }
                return Err(cordon_common::reasons::REASON_UNAUTH_SOURCE);
            }
            if flavor.to_host_iface() {
                let dst_flags = routes_lookup_flags(state.ip_dst);
                if dst_flags & cordon_common::routes::RT_REMOTE_HOST != 0 {
                    return Ok(ParseVerdict::AllowNoPolicy);
                }
                return Err(cordon_common::reasons::REASON_UNAUTH_SOURCE);
            }
            // Tunnel-in-tunnel or workload-originated IPIP.
            return Err(cordon_common::reasons::REASON_UNAUTH_SOURCE);
        }
        _ => {
            // No ports to extract.
        }
    }
    state.pre_nat_dport = state.dport;
    state.post_nat_dport = state.dport;
    Ok(ParseVerdict::Proceed)
}
