//! Conntrack lookup and creation for the TC programs.
//!
//! Creation is race-safe: the first insert for a key wins
//! (`BPF_NOEXIST`) and losers reuse the winner's entry, so SYN retries
//! racing on different CPUs settle on one backend.

use aya_ebpf::helpers::bpf_ktime_get_ns;
use aya_ebpf::programs::TcContext;

use cordon_common::conntrack::*;
use cordon_common::reasons::REASON_CT_CREATE_FAIL;
use cordon_common::state::PacketState;
use cordon_common::IPPROTO_TCP;

use crate::parse::{read_u8, ETH_HLEN, IP_HLEN};
use crate::CONNTRACK;

/// TCP flag byte offset within the TCP header.
const TCP_OFF_FLAGS: usize = 13;
const TCP_SYN: u8 = 0x02;

#[inline(always)]
fn forward_key(state: &PacketState) -> ConntrackKey {
    ConntrackKey::new(
        state.ip_proto,
        state.ip_src,
        state.sport,
        state.ip_dst,
        state.dport,
    )
}

/// Look up the flow and record the result in the state.
#[inline(always)]
pub fn lookup(ctx: &TcContext, state: &mut PacketState) {
    let now = unsafe { bpf_ktime_get_ns() };
    let fwd_key = forward_key(state);

    if let Some(entry) = unsafe { CONNTRACK.get(&fwd_key) } {
        ct_hit_forward(state, entry, now, &fwd_key);
        return;
    }

    let rev_key = fwd_key.reversed();
    if let Some(entry) = unsafe { CONNTRACK.get(&rev_key) } {
        ct_hit_reverse(state, entry, now, &rev_key);
        return;
    }

    // No entry in either direction.
    let mid_flow = state.ip_proto == IPPROTO_TCP && !is_syn(ctx);
    state.ct_rc = if mid_flow {
        CT_LOOKUP_MID_FLOW_MISS
    } else {
        CT_LOOKUP_NEW
    };
}

#[inline(always)]
fn is_syn(ctx: &TcContext) -> bool {
    match read_u8(ctx, ETH_HLEN + IP_HLEN + TCP_OFF_FLAGS) {
        Ok(flags) => flags & TCP_SYN != 0,
        Err(_) => false,
    }
}

#[inline(always)]
fn ct_hit_forward(state: &mut PacketState, entry: &ConntrackValue, now: u64, key: &ConntrackKey) {
    state.ct_flags = entry.flags;
    state.ct_ifindex_fwd = entry.ifindex_fwd;

    match entry.entry_type {
        CT_TYPE_NAT_FWD => {
            // Forward leg of a NATed flow: rewrite dst to the backend.
            state.ct_nat_addr = entry.nat_addr;
            state.ct_nat_port = entry.nat_port;
            state.ct_rc = CT_LOOKUP_ESTABLISHED_DNAT;
        }
        CT_TYPE_NAT_REV => {
            // Already-translated packet (client -> backend).
            state.ct_rc = CT_LOOKUP_ESTABLISHED;
        }
        _ => {
            state.ct_rc = CT_LOOKUP_ESTABLISHED;
        }
    }
    tun_src_check(state, entry);
    touch(key, entry, now, false);
}

#[inline(always)]
fn ct_hit_reverse(state: &mut PacketState, entry: &ConntrackValue, now: u64, key: &ConntrackKey) {
    state.ct_flags = entry.flags;
    state.ct_ifindex_fwd = entry.ifindex_fwd;
    if entry.tun_addr != [0; 4] && state.tun_ip == [0; 4] {
        // Reply must go back through the tunnel to this peer.
        state.tun_ip = entry.tun_addr;
    }

    match entry.entry_type {
        CT_TYPE_NAT_REV => {
            // Reply from the backend: restore the service VIP source.
            state.ct_nat_addr = entry.nat_addr;
            state.ct_nat_port = entry.nat_port;
            state.ct_rc = CT_LOOKUP_ESTABLISHED_SNAT;
        }
        _ => {
            state.ct_rc = CT_LOOKUP_ESTABLISHED;
        }
    }
    touch(key, entry, now, true);
}

/// Refresh timestamps and mark the reply leg seen. The value is
/// re-inserted whole; last-writer-wins is fine for bookkeeping fields.
#[inline(always)]
fn touch(key: &ConntrackKey, entry: &ConntrackValue, now: u64, reply_dir: bool) {
    let mut updated = *entry;
    updated.last_seen_ns = now;
    if reply_dir {
        updated.leg_ba.seen_reply = 1;
    }
    let _ = CONNTRACK.insert(key, &updated, 0);
}

/// Parameters for creating entries for a freshly-admitted flow.
pub struct CreateCtx {
    pub flags: u8,
    pub tun_ip: [u8; 4],
    pub ifindex_fwd: u32,
}

/// Create the entry (or entry pair) for a new flow.
///
/// For NATed flows both the forward entry (keyed by the pre-NAT
/// destination) and the reverse entry (keyed by the backend) are
/// created together; the invariant that both exist or neither does is
/// what keeps reply traffic translatable.
#[inline(always)]
pub fn create(state: &PacketState, cc: &CreateCtx, nated: bool) -> Result<(), u8> {
    let now = unsafe { bpf_ktime_get_ns() };

    if !nated {
        let key = forward_key(state);
        let value = ConntrackValue {
            entry_type: CT_TYPE_NORMAL,
            flags: cc.flags,
            tun_addr: cc.tun_ip,
            ifindex_fwd: cc.ifindex_fwd,
            created_ns: now,
            last_seen_ns: now,
            leg_ab: whitelisted_leg(),
            leg_ba: whitelisted_leg(),
            ..Default::default()
        };
        return insert_new(&key, &value);
    }

    // NAT flow: reverse entry first so a racing reply never finds the
    // forward entry alone.
    let rev_key = ConntrackKey::new(
        state.ip_proto,
        state.ip_src,
        state.sport,
        state.post_nat_ip_dst,
        state.post_nat_dport,
    );
    let rev_value = ConntrackValue {
        entry_type: CT_TYPE_NAT_REV,
        flags: cc.flags,
        nat_addr: state.pre_nat_ip_dst,
        nat_port: state.pre_nat_dport,
        tun_addr: cc.tun_ip,
        ifindex_fwd: cc.ifindex_fwd,
        created_ns: now,
        last_seen_ns: now,
        leg_ab: whitelisted_leg(),
        leg_ba: whitelisted_leg(),
        ..Default::default()
    };
    insert_new(&rev_key, &rev_value)?;

    let fwd_key = ConntrackKey::new(
        state.ip_proto,
        state.ip_src,
        state.sport,
        state.pre_nat_ip_dst,
        state.pre_nat_dport,
    );
    let fwd_value = ConntrackValue {
        entry_type: CT_TYPE_NAT_FWD,
        flags: cc.flags,
        nat_addr: state.post_nat_ip_dst,
        nat_port: state.post_nat_dport,
        tun_addr: cc.tun_ip,
        ifindex_fwd: cc.ifindex_fwd,
        created_ns: now,
        last_seen_ns: now,
        leg_ab: whitelisted_leg(),
        leg_ba: whitelisted_leg(),
        ..Default::default()
    };
    if insert_new(&fwd_key, &fwd_value).is_err() {
        // Keep the pair invariant.
        let _ = CONNTRACK.remove(&rev_key);
        return Err(REASON_CT_CREATE_FAIL);
    }
    Ok(())
}

#[inline(always)]
fn insert_new(key: &ConntrackKey, value: &ConntrackValue) -> Result<(), u8> {
    // BPF_NOEXIST: lose gracefully to a concurrent creator.
    const BPF_NOEXIST: u64 = 1;
    match CONNTRACK.insert(key, value, BPF_NOEXIST) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Entry exists already; the racing CPU won. That is fine.
            if unsafe { CONNTRACK.get(key) }.is_some() {
                Ok(())
            } else {
                Err(REASON_CT_CREATE_FAIL)
            }
        }
    }
}

#[inline(always)]
fn whitelisted_leg() -> ConntrackLeg {
    ConntrackLeg {
        whitelisted: 1,
        seen_reply: 0,
        _pad: [0; 2],
    }
}

/// A NAT-reverse hit whose recorded tunnel peer differs from the
/// packet's outer source is a spoofing attempt.
#[inline(always)]
fn tun_src_check(state: &mut PacketState, entry: &ConntrackValue) {
    if entry.entry_type == CT_TYPE_NAT_REV
        && state.tun_ip != [0; 4]
        && entry.tun_addr != [0; 4]
        && state.tun_ip != entry.tun_addr
    {
        state.ct_rc = CT_LOOKUP_TUN_SRC_CHANGED;
    }
}
