//! ICMP error synthesis.
//!
//! Rewrites the packet in place into an ICMP error addressed back to
//! the sender, quoting the original IP header plus eight payload
//! bytes, then lets the kernel route it. Reached by tail call with the
//! type/code already in the scratch state.

use aya_ebpf::bindings::{BPF_F_INGRESS, TC_ACT_UNSPEC};
use aya_ebpf::helpers::bpf_redirect;
use aya_ebpf::programs::TcContext;

use cordon_common::marks::MARK_BYPASS_FWD;
use cordon_common::reasons::REASON_SHORT;
use cordon_common::state::PacketState;
use cordon_common::IPPROTO_ICMP;

use crate::flavor::Flavor;
use crate::parse::{ETH_HLEN, IP_HLEN, IP_OFF_CSUM};
use crate::skbops;
use crate::vxlan::ip_header_checksum;
use crate::{addr_is_local_host, host_ip};

pub const ICMP_DEST_UNREACH: u8 = 3;
pub const ICMP_PORT_UNREACH: u8 = 3;
pub const ICMP_FRAG_NEEDED: u8 = 4;
pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMP_EXC_TTL: u8 = 0;

const ICMP_HLEN: usize = 8;
/// Quoted original: IP header + 8 bytes of payload.
const QUOTE_LEN: usize = IP_HLEN + 8;
/// Total length of a synthesized reply.
const REPLY_LEN: usize = ETH_HLEN + IP_HLEN + ICMP_HLEN + QUOTE_LEN;

/// Build and emit the reply recorded in `state.icmp_type`/`icmp_code`.
///
/// For frag-needed replies the next-hop MTU rides in `state.tun_ip`
/// (two zero bytes then the MTU, big-endian), mirroring the on-wire
/// layout of the ICMP header's second word.
#[inline(always)]
pub fn run_icmp_reply(ctx: &TcContext, state: &mut PacketState, flavor: Flavor) -> Result<i32, u8> {
    let data = ctx.data();
    let data_end = ctx.data_end();
    if data + REPLY_LEN > data_end {
        return Err(REASON_SHORT);
    }

    // Quote the offending header before overwriting anything.
    let quote = unsafe { *((data + ETH_HLEN) as *const [u8; QUOTE_LEN]) };
    let orig_src = [quote[12], quote[13], quote[14], quote[15]];
    let orig_dst = [quote[16], quote[17], quote[18], quote[19]];

    // Errors come from us: prefer the host address, unless the packet
    // was addressed to a local address that is not the host (a VIP),
    // in which case answer as the original destination.
    let reply_src = if addr_is_local_host(orig_dst) {
        orig_dst
    } else {
        host_ip()
    };

    // Swap the Ethernet addresses in place.
    let mac_dst = unsafe { *(data as *const [u8; 6]) };
    let mac_src = unsafe { *((data + 6) as *const [u8; 6]) };
    if skbops::store(ctx, 0, &mac_src).is_err() || skbops::store(ctx, 6, &mac_dst).is_err() {
        return Err(REASON_SHORT);
    }

    let tot_len = (IP_HLEN + ICMP_HLEN + QUOTE_LEN) as u16;
    let mut ip_hdr = [0u8; IP_HLEN];
    ip_hdr[0] = 0x45;
    ip_hdr[2..4].copy_from_slice(&tot_len.to_be_bytes());
    ip_hdr[8] = 64; // TTL
    ip_hdr[9] = IPPROTO_ICMP;
    ip_hdr[12..16].copy_from_slice(&reply_src);
    ip_hdr[16..20].copy_from_slice(&orig_src);
    let ip_csum = ip_header_checksum(&ip_hdr);
    ip_hdr[IP_OFF_CSUM..IP_OFF_CSUM + 2].copy_from_slice(&ip_csum.to_be_bytes());
    if skbops::store(ctx, ETH_HLEN, &ip_hdr).is_err() {
        return Err(REASON_SHORT);
    }

    let mut icmp = [0u8; ICMP_HLEN];
    icmp[0] = state.icmp_type;
    icmp[1] = state.icmp_code;
    // Second word: zero except for frag-needed, where it carries the
    // next-hop MTU smuggled through `tun_ip`.
    icmp[4..8].copy_from_slice(&state.tun_ip);
    let icmp_csum = icmp_checksum(&icmp, &quote);
    icmp[2..4].copy_from_slice(&icmp_csum.to_be_bytes());
    if skbops::store(ctx, ETH_HLEN + IP_HLEN, &icmp).is_err() {
        return Err(REASON_SHORT);
    }
    if skbops::store(ctx, ETH_HLEN + IP_HLEN + ICMP_HLEN, &quote).is_err() {
        return Err(REASON_SHORT);
    }

    if skbops::change_tail(ctx, REPLY_LEN as u32).is_err() {
        return Err(REASON_SHORT);
    }

    skbops::set_skb_mark(ctx, MARK_BYPASS_FWD);

    state.ip_proto = IPPROTO_ICMP;
    state.ip_src = reply_src;
    state.ip_dst = orig_src;
    state.sport = 0;
    state.dport = 0;

    // A reply to a workload goes straight back out the way it came.
    if flavor.from_workload() {
        let ifindex = skbops::skb_ifindex(ctx);
        return Ok(unsafe { bpf_redirect(ifindex, BPF_F_INGRESS as u64) } as i32);
    }
    Ok(TC_ACT_UNSPEC)
}

/// Checksum over the fixed ICMP header (with zeroed checksum field)
/// and the quoted original packet.
#[inline(always)]
fn icmp_checksum(icmp: &[u8; ICMP_HLEN], quote: &[u8; QUOTE_LEN]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;
    while i < ICMP_HLEN {
        if i != 2 {
            sum += u32::from(u16::from_be_bytes([icmp[i], icmp[i + 1]]));
        }
        i += 2;
    }
    let mut j = 0;
    while j < QUOTE_LEN {
        sum += u32::from(u16::from_be_bytes([quote[j], quote[j + 1]]));
        j += 2;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
