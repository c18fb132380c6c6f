//! Service NAT lookup and backend selection for new flows.

use aya_ebpf::helpers::{bpf_get_socket_cookie, bpf_ktime_get_ns};
use aya_ebpf::programs::TcContext;

use cordon_common::nat::{
    select_backend, AffinityKey, AffinityValue, BackendKey, BackendValue, CtNatsKey, FrontendKey,
};
use cordon_common::state::PacketState;

use crate::{CT_NATS, NAT_AFFINITY, NAT_BACKENDS, NAT_FRONTENDS};

pub enum NatLookup {
    /// No frontend for this destination; the wire destination stands.
    NoMatch,
    /// Frontend with a chosen backend.
    Backend(BackendValue),
    /// Frontend exists but has no endpoints: answer with ICMP port
    /// unreachable.
    NoBackend,
    /// Frontend hit on traffic that arrived through the tunnel: a
    /// second NAT hop would loop, drop it.
    Drop,
}

/// Look up the 3-tuple in the frontend map and pick a backend.
#[inline(always)]
pub fn lookup(state: &PacketState, from_tunnel: bool) -> NatLookup {
    let fe_key = FrontendKey::new(state.ip_dst, state.dport, state.ip_proto);
    let Some(fe) = (unsafe { NAT_FRONTENDS.get(&fe_key) }) else {
        return NatLookup::NoMatch;
    };

    if from_tunnel {
        return NatLookup::Drop;
    }
    if fe.backend_count == 0 {
        return NatLookup::NoBackend;
    }

    let index = if fe.affinity_secs > 0 {
        affinity_backend(state, &fe_key, fe.affinity_secs, fe.backend_count, fe.ordinal)
    } else {
        select_backend(
            state.ip_proto,
            state.ip_src,
            state.sport,
            state.ip_dst,
            state.dport,
            fe.backend_count,
        )
    };

    let be_key = BackendKey {
        ordinal: fe.ordinal,
        index,
    };
    match unsafe { NAT_BACKENDS.get(&be_key) } {
        Some(be) => NatLookup::Backend(*be),
        // Frontend and backend maps are updated independently; a
        // torn window reads as no backend.
        None => NatLookup::NoBackend,
    }
}

/// Pick (and refresh) the backend for a client with session affinity.
#[inline(always)]
fn affinity_backend(
    state: &PacketState,
    fe_key: &FrontendKey,
    affinity_secs: u32,
    backend_count: u32,
    ordinal: u32,
) -> u32 {
    let now = unsafe { bpf_ktime_get_ns() };
    let aff_key = AffinityKey {
        client: state.ip_src,
        frontend: *fe_key,
    };

    if let Some(aff) = unsafe { NAT_AFFINITY.get(&aff_key) } {
        if aff.fresh(now, affinity_secs) {
            // Refresh the window and find which index the sticky
            // backend currently has.
            if let Some(index) = backend_index_of(ordinal, backend_count, &aff.backend) {
                let _ = NAT_AFFINITY.insert(&aff_key, &AffinityValue::new(now, aff.backend), 0);
                return index;
            }
            // Sticky backend no longer exists; fall through and pick
            // a new one.
        }
    }

    let index = select_backend(
        state.ip_proto,
        state.ip_src,
        state.sport,
        state.ip_dst,
        state.dport,
        backend_count,
    );
    let be_key = BackendKey { ordinal, index };
    if let Some(be) = unsafe { NAT_BACKENDS.get(&be_key) } {
        let _ = NAT_AFFINITY.insert(&aff_key, &AffinityValue::new(now, *be), 0);
    }
    index
}

/// Linear scan for the sticky backend's current index. Bounded so the
/// verifier can unroll it.
#[inline(always)]
fn backend_index_of(ordinal: u32, backend_count: u32, wanted: &BackendValue) -> Option<u32> {
    const SCAN_MAX: u32 = 32;
    let limit = if backend_count < SCAN_MAX {
        backend_count
    } else {
        SCAN_MAX
    };
    let mut i = 0u32;
    while i < limit {
        let key = BackendKey { ordinal, index: i };
        if let Some(be) = unsafe { NAT_BACKENDS.get(&key) } {
            if be.addr == wanted.addr && be.port == wanted.port {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

/// Undo a connect-time DNAT so policy sees the original destination.
///
/// The connect-time load balancer records (cookie, post-NAT dst) ->
/// pre-NAT dst for local sockets; if the sending socket has such an
/// entry, restore the pre-NAT values in the state.
#[inline(always)]
pub fn reverse_ctlb_dnat(ctx: &TcContext, state: &mut PacketState) {
    let cookie = unsafe { bpf_get_socket_cookie(ctx.skb.skb as *mut _) };
    if cookie == 0 {
        return;
    }
    let key = CtNatsKey {
        cookie,
        addr: state.ip_dst,
        port: state.dport,
        protocol: state.ip_proto,
        _pad: 0,
    };
    if let Some(orig) = unsafe { CT_NATS.get(&key) } {
        state.pre_nat_ip_dst = orig.addr;
        state.pre_nat_dport = orig.port;
    }
}
