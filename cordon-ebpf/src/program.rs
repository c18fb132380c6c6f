//! The per-packet state machine.
//!
//! `run_main` is the classifier body: parse, decap, conntrack, NAT
//! decision, special allows, workload RPF, then a tail call into the
//! policy program. `run_accepted` picks up after policy: conntrack
//! creation, NAT rewrite, encap and the forward/drop verdict.

use aya_ebpf::bindings::{TC_ACT_SHOT, TC_ACT_UNSPEC};
use aya_ebpf::helpers::bpf_redirect;
use aya_ebpf::programs::TcContext;

use cordon_common::conntrack::*;
use cordon_common::failsafe::FailsafeKey;
use cordon_common::jump::{PROG_INDEX_ACCEPTED, PROG_INDEX_ICMP, PROG_INDEX_POLICY};
use cordon_common::marks::*;
use cordon_common::reasons::*;
use cordon_common::routes::*;
use cordon_common::state::*;
use cordon_common::{IPPROTO_ICMP, IPPROTO_TCP};

use crate::flavor::Flavor;
use crate::skbops;
use crate::icmp::{ICMP_DEST_UNREACH, ICMP_EXC_TTL, ICMP_FRAG_NEEDED, ICMP_PORT_UNREACH, ICMP_TIME_EXCEEDED};
use crate::parse::{self, ParseVerdict, ETH_HLEN, IP_HLEN, IP_OFF_CSUM, IP_OFF_DADDR, IP_OFF_FRAG, IP_OFF_SADDR, IP_OFF_TTL};
use crate::{addr_is_local_host, count_reason, ct, host_ip, jump_base, natlb, routes_lookup, routes_lookup_flags, vxlan, FAILSAFES, JUMP};

use crate::skbops::{set_skb_mark, skb_mark};

#[inline(always)]
fn skb_seen(mark: u32) -> bool {
    mark & MARK_SEEN_MASK == MARK_SEEN
}

pub fn run_main(ctx: &TcContext, state: &mut PacketState, flavor: Flavor) -> Result<i32, u8> {
    let mark = skb_mark(ctx);

    // Pre-approved by the program on the other side of the flow: skip
    // all processing.
    if flavor.from_host() && mark & MARK_BYPASS_MASK == MARK_BYPASS {
        count_reason(REASON_BYPASS);
        return Ok(TC_ACT_UNSPEC);
    }

    *state = PacketState::default();

    if flavor.from_host() {
        match mark & MARK_SKIP_RPF_MASK {
            m if m == MARK_BYPASS_FWD => {
                count_reason(REASON_BYPASS);
                return Ok(TC_ACT_UNSPEC);
            }
            m if m == MARK_BYPASS_FWD_SRC_FIXUP => {
                // Approved for forward, but the source address still
                // carries the original client; fix it to the host.
                fixup_src_to_host(ctx)?;
                count_reason(REASON_BYPASS);
                return Ok(TC_ACT_UNSPEC);
            }
            _ => {}
        }
    }

    match parse::parse_packet_ip(ctx, flavor)? {
        ParseVerdict::AllowNoPolicy => return Ok(TC_ACT_UNSPEC),
        ParseVerdict::Proceed => {}
    }

    if flavor.should_decap() && vxlan::is_overlay_packet(ctx) {
        match vxlan::attempt_decap(ctx, state)? {
            vxlan::Decap::Decapped => {
                // Re-validate the inner packet from scratch.
                match parse::parse_packet_ip(ctx, flavor)? {
                    ParseVerdict::AllowNoPolicy => return Ok(TC_ACT_UNSPEC),
                    ParseVerdict::Proceed => {}
                }
            }
            vxlan::Decap::NotOurs => {
                // Overlay traffic from a peer on a foreign VNI.
                return Ok(TC_ACT_UNSPEC);
            }
        }
    }

    parse::fill_state_from_ip(ctx, state)?;
    match parse::fill_state_from_next_header(ctx, state, flavor)? {
        ParseVerdict::AllowNoPolicy => return Ok(TC_ACT_UNSPEC),
        ParseVerdict::Proceed => {}
    }

    state.pol_rc = POL_NO_MATCH;
    ct::lookup(ctx, state);

    if flavor.from_host_iface() && state.ct_rc == CT_LOOKUP_TUN_SRC_CHANGED {
        // Tunnel packet whose outer source moved mid-flow: spoofing.
        return Err(REASON_UNAUTH_SOURCE);
    }

    if state.ct_flags & CT_FLAG_NAT_OUT != 0 {
        state.flags |= ST_NAT_OUTGOING;
    }

    if state.ct_rc == CT_LOOKUP_MID_FLOW_MISS {
        if flavor.to_host() {
            // Flow predates us; let iptables decide using the Linux
            // conntrack table.
            set_skb_mark(ctx, MARK_FALLTHROUGH);
            return Ok(TC_ACT_UNSPEC);
        }
        if flavor.host_iface() {
            // TODO for active host endpoints this should apply policy
            // rather than allow.
            return Ok(TC_ACT_UNSPEC);
        }
        return Err(REASON_UNKNOWN);
    }

    if state.ct_rc != CT_LOOKUP_NEW {
        // Conntrack hit: policy already ran for this flow.
        if state.ct_flags & CT_FLAG_SKIP_FIB != 0 {
            state.flags |= ST_SKIP_FIB;
        }
        let _ = unsafe { JUMP.tail_call(ctx, jump_base() + PROG_INDEX_ACCEPTED) };
        return Err(REASON_UNKNOWN);
    }

    // New flow. We cannot do RPF against our route map for traffic
    // from the fabric; flag it so the stack enforces RPF instead.
    if flavor.from_host_iface() {
        state.ct_flags |= CT_FLAG_RPF_FAILED;
    }

    match natlb::lookup(state, state.tun_ip != [0; 4]) {
        natlb::NatLookup::Drop => return Err(REASON_UNAUTH_SOURCE),
        natlb::NatLookup::Backend(be) => {
            state.post_nat_ip_dst = be.addr;
            state.post_nat_dport = be.port;
            state.nat_backend_addr = be.addr;
            state.nat_backend_port = be.port;
        }
        natlb::NatLookup::NoMatch => {
            state.post_nat_ip_dst = state.ip_dst;
            state.post_nat_dport = state.dport;
        }
        natlb::NatLookup::NoBackend => {
            state.icmp_type = ICMP_DEST_UNREACH;
            state.icmp_code = ICMP_PORT_UNREACH;
            state.tun_ip = [0; 4];
            let _ = unsafe { JUMP.tail_call(ctx, jump_base() + PROG_INDEX_ICMP) };
            return Err(REASON_UNKNOWN);
        }
    }

    if flavor.to_workload()
        && !skb_seen(skb_mark(ctx))
        && addr_is_local_host(state.ip_src)
    {
        // Host to local workload is always allowed; traffic seen by
        // another program came in via a different interface and does
        // not qualify.
        state.pol_rc = POL_ALLOW;
        let _ = unsafe { JUMP.tail_call(ctx, jump_base() + PROG_INDEX_ACCEPTED) };
        return Err(REASON_UNKNOWN);
    }

    if flavor.from_workload() {
        workload_rpf(ctx, state)?;
    }

    // Reverse any connect-time DNAT so policy sees the original
    // destination.
    natlb::reverse_ctlb_dnat(ctx, state);

    if addr_is_local_host(state.post_nat_ip_dst) {
        state.flags |= ST_DEST_IS_HOST;
        if flavor.from_host_iface()
            && failsafe_hit(&FailsafeKey::ingress(state.post_nat_dport, state.ip_proto))
        {
            state.pol_rc = POL_ALLOW;
            let _ = unsafe { JUMP.tail_call(ctx, jump_base() + PROG_INDEX_ACCEPTED) };
            return Err(REASON_UNKNOWN);
        }
    }
    if addr_is_local_host(state.ip_src) {
        state.flags |= ST_SRC_IS_HOST;
        if flavor.to_host_iface()
            && failsafe_hit(&FailsafeKey::egress(state.post_nat_dport, state.ip_proto))
        {
            state.pol_rc = POL_ALLOW;
            let _ = unsafe { JUMP.tail_call(ctx, jump_base() + PROG_INDEX_ACCEPTED) };
            return Err(REASON_UNKNOWN);
        }
    }

    let _ = unsafe { JUMP.tail_call(ctx, jump_base() + PROG_INDEX_POLICY) };
    // No policy program installed yet. Host endpoints default to
    // allow; workloads to deny.
    if flavor.host_iface() {
        return Ok(TC_ACT_UNSPEC);
    }
    Err(REASON_POLICY_DENY)
}

#[inline(always)]
fn failsafe_hit(key: &FailsafeKey) -> bool {
    unsafe { FAILSAFES.get(key) }.is_some()
}

/// Source must be a local workload whose recorded interface matches
/// the one the packet arrived on.
#[inline(always)]
fn workload_rpf(ctx: &TcContext, state: &mut PacketState) -> Result<(), u8> {
    let Some(r) = routes_lookup(state.ip_src) else {
        return Err(REASON_RPF_FAIL);
    };
    if !r.is_local_workload() {
        return Err(REASON_RPF_FAIL);
    }
    if r.ifindex != skbops::skb_ifindex(ctx) {
        return Err(REASON_RPF_FAIL);
    }

    if r.flags & RT_NAT_OUT != 0
        && routes_lookup_flags(state.post_nat_ip_dst) & RT_IN_POOL == 0
    {
        // Source pool wants NAT-outgoing and the destination is
        // outside the pools.
        state.flags |= ST_NAT_OUTGOING;
    }
    if r.flags & RT_IN_POOL == 0 {
        let dst_flags = routes_lookup_flags(state.post_nat_ip_dst);
        if dst_flags & (RT_WORKLOAD | RT_LOCAL_HOST | RT_REMOTE_HOST) == 0 {
            // Neither end is cluster-owned; routing is not ours.
            state.flags |= ST_SKIP_FIB;
        }
    }
    Ok(())
}

/// Rewrite the source address to the host address, fixing the L3
/// checksum.
#[inline(always)]
fn fixup_src_to_host(ctx: &TcContext) -> Result<(), u8> {
    let src = parse::read_addr(ctx, ETH_HLEN + IP_OFF_SADDR)?;
    let host = host_ip();
    if src == host {
        return Ok(());
    }
    if skbops::store(ctx, ETH_HLEN + IP_OFF_SADDR, &host).is_err() {
        return Err(REASON_SHORT);
    }
    if skbops::l3_csum_replace(
        ctx,
        ETH_HLEN + IP_OFF_CSUM,
        u32::from_ne_bytes(src) as u64,
        u32::from_ne_bytes(host) as u64,
        4,
    )
    .is_err()
    {
        return Err(REASON_CSUM_FAIL);
    }
    Ok(())
}

pub fn run_accepted(ctx: &TcContext, state: &mut PacketState, flavor: Flavor) -> Result<i32, u8> {
    // ICMP conntrack keys use zeroed ports; type/code live elsewhere.
    if state.ip_proto == IPPROTO_ICMP {
        state.dport = 0;
        state.post_nat_dport = 0;
        state.pre_nat_dport = 0;
    }

    let mut seen_mark = MARK_SEEN;
    let mut fib = false;
    if flavor.from_workload() && state.flags & ST_NAT_OUTGOING != 0 {
        // iptables applies the SNAT; the mark triggers its rule.
        seen_mark = MARK_NAT_OUT;
    } else if state.flags & ST_SKIP_FIB == 0
        && flavor.to_host()
        && state.ct_flags & CT_FLAG_RPF_FAILED == 0
    {
        fib = true;
    }

    // Answer TTL expiry ourselves for flows we would forward;
    // anything else belongs to the stack.
    let ttl = parse::read_u8(ctx, ETH_HLEN + IP_OFF_TTL)?;
    if ttl <= 1 {
        let forwarded = match state.ct_rc {
            CT_LOOKUP_NEW => state.nat_backend_port != 0 || state.nat_backend_addr != [0; 4],
            CT_LOOKUP_ESTABLISHED_DNAT | CT_LOOKUP_ESTABLISHED_SNAT => true,
            _ => false,
        };
        if forwarded {
            if is_late_fragment(ctx)? {
                return Err(REASON_UNKNOWN);
            }
            state.icmp_type = ICMP_TIME_EXCEEDED;
            state.icmp_code = ICMP_EXC_TTL;
            state.tun_ip = [0; 4];
            let _ = unsafe { JUMP.tail_call(ctx, jump_base() + PROG_INDEX_ICMP) };
            return Err(REASON_UNKNOWN);
        }
    }

    match state.ct_rc {
        CT_LOOKUP_NEW => accepted_new_flow(ctx, state, flavor, &mut seen_mark, &mut fib),
        CT_LOOKUP_ESTABLISHED_DNAT => {
            accepted_established_dnat(ctx, state, flavor, &mut seen_mark, &mut fib)
        }
        CT_LOOKUP_ESTABLISHED_SNAT => {
            accepted_established_snat(ctx, state, flavor, &mut seen_mark, &mut fib)
        }
        CT_LOOKUP_ESTABLISHED_BYPASS => {
            seen_mark = MARK_BYPASS;
            finalize(ctx, state, seen_mark, fib)
        }
        CT_LOOKUP_ESTABLISHED => finalize(ctx, state, seen_mark, fib),
        _ => {
            if flavor.from_host_iface() {
                // Host traffic we failed to track; fall through to
                // iptables rather than break the host.
                finalize(ctx, state, MARK_FALLTHROUGH, false)
            } else {
                Err(REASON_UNKNOWN)
            }
        }
    }
}

/// Non-first fragment: no L4 header to quote in an ICMP error.
#[inline(always)]
fn is_late_fragment(ctx: &TcContext) -> Result<bool, u8> {
    let frag = parse::read_u16_be(ctx, ETH_HLEN + IP_OFF_FRAG)?;
    Ok(frag & 0x1fff != 0)
}

#[inline(always)]
fn is_dnf(ctx: &TcContext) -> Result<bool, u8> {
    let frag = parse::read_u16_be(ctx, ETH_HLEN + IP_OFF_FRAG)?;
    Ok(frag & 0x4000 != 0)
}

fn accepted_new_flow(
    ctx: &TcContext,
    state: &mut PacketState,
    flavor: Flavor,
    seen_mark: &mut u32,
    fib: &mut bool,
) -> Result<i32, u8> {
    match state.pol_rc {
        POL_ALLOW => {}
        POL_DENY => return Err(REASON_POLICY_DENY),
        _ => {
            // No match: deny for workloads, allow for host endpoints.
            if flavor.workload_iface() {
                return Err(REASON_POLICY_DENY);
            }
        }
    }

    // Policy said yes, but the default endpoint-to-host action still
    // applies: workload traffic terminating at a local host address
    // is blocked unless the operator opted in to accepting it.
    if flavor.from_workload()
        && flavor.drop_workload_to_host()
        && addr_is_local_host(state.post_nat_ip_dst)
    {
        return Err(REASON_WORKLOAD_TO_HOST);
    }

    let mut cc = ct::CreateCtx {
        flags: 0,
        tun_ip: state.tun_ip,
        ifindex_fwd: skbops::skb_ifindex(ctx),
    };
    if state.flags & ST_NAT_OUTGOING != 0 {
        cc.flags |= CT_FLAG_NAT_OUT;
    }
    if flavor.from_workload() && state.flags & ST_SKIP_FIB != 0 {
        cc.flags |= CT_FLAG_SKIP_FIB;
    }
    if state.ct_flags & CT_FLAG_RPF_FAILED != 0 {
        cc.flags |= CT_FLAG_RPF_FAILED;
    }

    let nated = state.nat_backend_port != 0 || state.nat_backend_addr != [0; 4];
    if !nated {
        if ct::create(state, &cc, false).is_err() {
            // Host-local traffic survives a full conntrack table.
            if (flavor.from_host_iface() && addr_is_local_host(state.post_nat_ip_dst))
                || (flavor.to_host_iface() && addr_is_local_host(state.ip_src))
            {
                return finalize(ctx, state, *seen_mark, *fib);
            }
            return Err(REASON_CT_CREATE_FAIL);
        }
        return finalize(ctx, state, *seen_mark, *fib);
    }

    // DNAT chosen. Find out whether the backend is behind the overlay
    // before creating conntrack: the entries must carry the tunnel
    // peer.
    let mut encap = flavor.dnat_should_encap();
    if encap {
        let Some(rt) = routes_lookup(state.post_nat_ip_dst) else {
            return Err(REASON_RT_UNKNOWN);
        };
        encap = !rt.is_local();
        if encap {
            if flavor.from_host_iface() && state.tun_ip == [0; 4] {
                if flavor.dsr() {
                    cc.flags |= CT_FLAG_DSR_FWD;
                }
                cc.flags |= CT_FLAG_NP_FWD;
            }
            cc.tun_ip = rt.next_hop;
            state.ip_dst = rt.next_hop;
        } else if rt.is_workload() && state.ip_dst != state.post_nat_ip_dst {
            // External traffic DNATed to a local workload: the
            // kernel's RPF would judge the post-NAT destination, so
            // mark the flow to steer the routing rule instead.
            cc.flags |= CT_FLAG_EXT_LOCAL;
        }
    }

    ct::create(state, &cc, true).map_err(|_| REASON_CT_CREATE_FAIL)?;

    if encap {
        if is_dnf(ctx)? && vxlan::encap_too_big(ctx) {
            state.icmp_type = ICMP_DEST_UNREACH;
            state.icmp_code = ICMP_FRAG_NEEDED;
            state.tun_ip = frag_needed_param();
            let _ = unsafe { JUMP.tail_call(ctx, jump_base() + PROG_INDEX_ICMP) };
            return Err(REASON_UNKNOWN);
        }
        // First rewrite the inner destination to the backend, then
        // wrap the result.
        rewrite_dnat(ctx, state)?;
        state.ip_src = host_ip();
        *seen_mark = MARK_SKIP_RPF;
        *fib = true;
        return nat_encap(ctx, state, flavor, *seen_mark, *fib);
    }

    rewrite_dnat(ctx, state)?;
    state.ip_dst = state.post_nat_ip_dst;
    state.dport = state.post_nat_dport;
    finalize(ctx, state, *seen_mark, *fib)
}

fn accepted_established_dnat(
    ctx: &TcContext,
    state: &mut PacketState,
    flavor: Flavor,
    seen_mark: &mut u32,
    fib: &mut bool,
) -> Result<i32, u8> {
    if flavor.from_host_iface() && state.tun_ip != [0; 4] && state.ct_flags & CT_FLAG_NP_FWD != 0 {
        // Returning from the NAT tunnel, already translated.
        return finalize(ctx, state, MARK_BYPASS_FWD, false);
    }

    state.post_nat_ip_dst = state.ct_nat_addr;
    state.post_nat_dport = state.ct_nat_port;

    let encap = flavor.dnat_should_encap()
        && state.ct_flags & CT_FLAG_NP_FWD != 0
        && state.tun_ip != [0; 4];
    if encap {
        if is_dnf(ctx)? && vxlan::encap_too_big(ctx) {
            state.icmp_type = ICMP_DEST_UNREACH;
            state.icmp_code = ICMP_FRAG_NEEDED;
            state.tun_ip = frag_needed_param();
            let _ = unsafe { JUMP.tail_call(ctx, jump_base() + PROG_INDEX_ICMP) };
            return Err(REASON_UNKNOWN);
        }
        rewrite_dnat(ctx, state)?;
        state.ip_dst = state.tun_ip;
        state.ip_src = host_ip();
        *seen_mark = MARK_SKIP_RPF;
        *fib = true;
        return nat_encap(ctx, state, flavor, *seen_mark, *fib);
    }

    rewrite_dnat(ctx, state)?;
    state.ip_dst = state.post_nat_ip_dst;
    state.dport = state.post_nat_dport;
    finalize(ctx, state, *seen_mark, *fib)
}

fn accepted_established_snat(
    ctx: &TcContext,
    state: &mut PacketState,
    flavor: Flavor,
    seen_mark: &mut u32,
    fib: &mut bool,
) -> Result<i32, u8> {
    if flavor.dnat_return_should_encap() && state.tun_ip != [0; 4] {
        if flavor.dsr() {
            // DSR: the reply leaves directly to the client; SNAT and
            // encap happen nowhere. An oversized reply with DF set
            // would deserve a frag-needed here, but the reply may
            // arrive on a non-canonical interface, so it is elided.
            return finalize(ctx, state, *seen_mark, *fib);
        }
        if is_dnf(ctx)? && vxlan::encap_too_big(ctx) {
            state.icmp_type = ICMP_DEST_UNREACH;
            state.icmp_code = ICMP_FRAG_NEEDED;
            state.tun_ip = frag_needed_param();
            let _ = unsafe { JUMP.tail_call(ctx, jump_base() + PROG_INDEX_ICMP) };
            return Err(REASON_UNKNOWN);
        }
    }

    rewrite_snat(ctx, state)?;

    if (flavor.dnat_return_should_encap() || (flavor.to_host_iface() && !flavor.dsr()))
        && state.tun_ip != [0; 4]
    {
        // Reply goes back through the tunnel to the client's node; the
        // outer source fixup happens on the way out of the host.
        state.ip_src = state.ct_nat_addr;
        state.ip_dst = state.tun_ip;
        return nat_encap(ctx, state, flavor, MARK_BYPASS_FWD_SRC_FIXUP, *fib);
    }

    state.ip_src = state.ct_nat_addr;
    state.sport = state.ct_nat_port;
    finalize(ctx, state, *seen_mark, *fib)
}

/// MTU parameter for a frag-needed reply, laid out as the second word
/// of the ICMP header expects it.
#[inline(always)]
fn frag_needed_param() -> [u8; 4] {
    let mtu = crate::tunnel_mtu().to_be_bytes();
    [0, 0, mtu[0], mtu[1]]
}

/// Rewrite the destination to `post_nat_*`, fixing L3 and L4
/// checksums.
#[inline(always)]
fn rewrite_dnat(ctx: &TcContext, state: &PacketState) -> Result<(), u8> {
    let old_addr = parse::read_addr(ctx, ETH_HLEN + IP_OFF_DADDR)?;
    let new_addr = state.post_nat_ip_dst;
    let old_port = parse::read_u16_be(ctx, ETH_HLEN + IP_HLEN + 2)?;
    let new_port = state.post_nat_dport;
    rewrite_l3_l4(
        ctx,
        state.ip_proto,
        ETH_HLEN + IP_OFF_DADDR,
        old_addr,
        new_addr,
        ETH_HLEN + IP_HLEN + 2,
        old_port,
        new_port,
    )
}

/// Rewrite the source back to the service address on replies.
#[inline(always)]
fn rewrite_snat(ctx: &TcContext, state: &PacketState) -> Result<(), u8> {
    let old_addr = parse::read_addr(ctx, ETH_HLEN + IP_OFF_SADDR)?;
    let new_addr = state.ct_nat_addr;
    let old_port = parse::read_u16_be(ctx, ETH_HLEN + IP_HLEN)?;
    let new_port = state.ct_nat_port;
    rewrite_l3_l4(
        ctx,
        state.ip_proto,
        ETH_HLEN + IP_OFF_SADDR,
        old_addr,
        new_addr,
        ETH_HLEN + IP_HLEN,
        old_port,
        new_port,
    )
}

#[inline(always)]
#[allow(clippy::too_many_arguments)]
fn rewrite_l3_l4(
    ctx: &TcContext,
    proto: u8,
    addr_off: usize,
    old_addr: [u8; 4],
    new_addr: [u8; 4],
    port_off: usize,
    old_port: u16,
    new_port: u16,
) -> Result<(), u8> {
    use aya_ebpf::bindings::{BPF_F_MARK_MANGLED_0, BPF_F_PSEUDO_HDR};

    let l4_csum_off = match proto {
        IPPROTO_TCP => Some(ETH_HLEN + IP_HLEN + 16),
        cordon_common::IPPROTO_UDP => Some(ETH_HLEN + IP_HLEN + 6),
        _ => None,
    };

    if skbops::store(ctx, addr_off, &new_addr).is_err() {
        return Err(REASON_SHORT);
    }
    let old32 = u32::from_ne_bytes(old_addr) as u64;
    let new32 = u32::from_ne_bytes(new_addr) as u64;
    if skbops::l3_csum_replace(ctx, ETH_HLEN + IP_OFF_CSUM, old32, new32, 4).is_err() {
        return Err(REASON_CSUM_FAIL);
    }

    if let Some(csum_off) = l4_csum_off {
        let mangled = if proto == cordon_common::IPPROTO_UDP {
            BPF_F_MARK_MANGLED_0 as u64
        } else {
            0
        };
        // The address is part of the pseudo-header.
        if skbops::l4_csum_replace(
            ctx,
            csum_off,
            old32,
            new32,
            BPF_F_PSEUDO_HDR as u64 | 4 | mangled,
        )
        .is_err()
        {
            return Err(REASON_CSUM_FAIL);
        }
        if old_port != new_port {
            let old16 = old_port.to_be() as u64;
            let new16 = new_port.to_be() as u64;
            if skbops::l4_csum_replace(ctx, csum_off, old16, new16, 2 | mangled).is_err() {
                return Err(REASON_CSUM_FAIL);
            }
            let port_be = new_port.to_be();
            if skbops::store(ctx, port_off, &port_be).is_err() {
                return Err(REASON_SHORT);
            }
        }
    }
    Ok(())
}

/// Wrap the packet for the overlay and emit it.
fn nat_encap(
    ctx: &TcContext,
    state: &mut PacketState,
    flavor: Flavor,
    seen_mark: u32,
    fib: bool,
) -> Result<i32, u8> {
    let dst = state.ip_dst;
    let src = host_ip();
    vxlan::encap(ctx, state, src, dst)?;

    set_skb_mark(ctx, seen_mark);

    if flavor.dnat_return_should_encap() && state.ct_ifindex_fwd != IFINDEX_INVALID {
        // We remember which interface the forward leg used; shortcut
        // the routing and send the reply straight there.
        return Ok(unsafe { bpf_redirect(state.ct_ifindex_fwd, 0) } as i32);
    }

    if fib {
        if let Some(verdict) = fib_redirect(ctx, state) {
            return Ok(verdict);
        }
    }
    Ok(TC_ACT_UNSPEC)
}

/// Final verdict for an accepted packet: stamp the mark, then either
/// FIB-redirect or hand the packet to the stack.
fn finalize(ctx: &TcContext, state: &mut PacketState, seen_mark: u32, fib: bool) -> Result<i32, u8> {
    set_skb_mark(ctx, seen_mark);
    if fib {
        if let Some(verdict) = fib_redirect(ctx, state) {
            return Ok(verdict);
        }
    }
    Ok(TC_ACT_UNSPEC)
}

/// Ask the kernel FIB where the (possibly rewritten) packet goes and
/// redirect straight to that interface when the answer is usable.
#[inline(always)]
fn fib_redirect(ctx: &TcContext, state: &PacketState) -> Option<i32> {
    use aya_ebpf::bindings::{bpf_fib_lookup as FibParams, BPF_FIB_LKUP_RET_SUCCESS};
    use aya_ebpf::helpers::gen::bpf_fib_lookup;

    let mut params = unsafe { core::mem::zeroed::<FibParams>() };
    params.family = 2; // AF_INET
    params.ifindex = skbops::skb_ifindex(ctx);
    params.l4_protocol = state.ip_proto;
    params.__bindgen_anon_3.ipv4_src = u32::from_ne_bytes(state.ip_src);
    params.__bindgen_anon_4.ipv4_dst = u32::from_ne_bytes(state.ip_dst);

    let rc = unsafe {
        bpf_fib_lookup(
            ctx.skb.skb as *mut _,
            &mut params as *mut _,
            core::mem::size_of::<FibParams>() as i32,
            0,
        )
    };
    if rc != BPF_FIB_LKUP_RET_SUCCESS as i64 {
        return None;
    }

    let dmac = params.dmac;
    let smac = params.smac;
    if skbops::store(ctx, 0, &dmac).is_err() || skbops::store(ctx, 6, &smac).is_err() {
        return None;
    }
    Some(unsafe { bpf_redirect(params.ifindex, 0) } as i32)
}
