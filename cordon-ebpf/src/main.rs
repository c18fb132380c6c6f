//! TC classifier programs for the cordon dataplane.
//!
//! One object file carries the whole pipeline: the main classifier,
//! the default policy stubs, the accepted-path program and the ICMP
//! reply program. Userland loads a fresh instance per attachment and
//! specializes it through the load-time globals below; the long-lived
//! maps (conntrack, NAT, routes, ARP, IP sets, failsafes) are pinned
//! and shared across all instances.
//!
//! Packet flow:
//!
//! ```text
//! tc_main --tail--> policy (replaced by userland) --tail--> tc_accepted
//!     \--tail--> tc_icmp (port unreachable / frag needed / ttl exceeded)
//! ```

#![no_std]
#![no_main]

mod ct;
mod flavor;
mod icmp;
mod natlb;
mod parse;
mod policy;
mod skbops;
mod program;
mod vxlan;

use aya_ebpf::{
    bindings::TC_ACT_SHOT,
    macros::{classifier, map},
    maps::{HashMap, LpmTrie, PerCpuArray, ProgramArray},
    programs::TcContext,
};

use cordon_common::arp::{ArpKey, ArpValue, ARP_MAX_ENTRIES};
use cordon_common::conntrack::{ConntrackKey, ConntrackValue, CT_MAX_ENTRIES};
use cordon_common::failsafe::{FailsafeKey, FAILSAFE_MAX_ENTRIES};
use cordon_common::ipsets::{IpSetKey, IPSETS_MAX_ENTRIES};
use cordon_common::jump::JUMP_MAP_ENTRIES;
use cordon_common::nat::{
    AffinityKey, AffinityValue, BackendKey, BackendValue, CtNatsKey, CtNatsValue, FrontendKey,
    FrontendValue, AFFINITY_MAX_ENTRIES, BE_MAX_ENTRIES, FE_MAX_ENTRIES,
};
use cordon_common::policy::{PolicyConfig, PolicyRule, POLICY_RULES_MAX};
use cordon_common::reasons::REASON_MAX;
use cordon_common::routes::{RouteValue, ROUTES_MAX_ENTRIES};
use cordon_common::state::PacketState;

use flavor::Flavor;

// Load-time parameterization. Userland patches these per attachment
// before the object is verified (aya `set_global`); reads go through
// `read_volatile` so the compiler cannot fold the initializers.

/// This node's address, network-order octets packed into a u32.
#[no_mangle]
static HOST_IP: u32 = 0;
/// Flavor bits for this attachment (see `flavor`).
#[no_mangle]
static FLAVOR: u32 = 0;
/// Overlay MTU used for the frag-needed check.
#[no_mangle]
static TUNNEL_MTU: u32 = 1450;
/// UDP port carrying overlay traffic.
#[no_mangle]
static OVERLAY_PORT: u32 = 4789;
/// Base slot of this attachment's block in the shared jump map.
#[no_mangle]
static JUMP_BASE: u32 = 0;
/// 0 = no per-packet debug counters beyond drop reasons.
#[no_mangle]
static LOG_LEVEL: u32 = 0;

#[inline(always)]
pub fn host_ip() -> [u8; 4] {
    unsafe { core::ptr::read_volatile(&HOST_IP) }.to_ne_bytes()
}

#[inline(always)]
pub fn tunnel_mtu() -> u16 {
    unsafe { core::ptr::read_volatile(&TUNNEL_MTU) } as u16
}

#[inline(always)]
pub fn overlay_port() -> u16 {
    unsafe { core::ptr::read_volatile(&OVERLAY_PORT) } as u16
}

#[inline(always)]
pub fn jump_base() -> u32 {
    unsafe { core::ptr::read_volatile(&JUMP_BASE) }
}

#[inline(always)]
fn flavor() -> Flavor {
    Flavor::from_bits(unsafe { core::ptr::read_volatile(&FLAVOR) })
}

// Shared maps, pinned by userland under the bpf filesystem.

#[map(name = "cordon_ct")]
static CONNTRACK: HashMap<ConntrackKey, ConntrackValue> =
    HashMap::with_max_entries(CT_MAX_ENTRIES, 0);

#[map(name = "cordon_nat_fe")]
static NAT_FRONTENDS: HashMap<FrontendKey, FrontendValue> =
    HashMap::with_max_entries(FE_MAX_ENTRIES, 0);

#[map(name = "cordon_nat_be")]
static NAT_BACKENDS: HashMap<BackendKey, BackendValue> =
    HashMap::with_max_entries(BE_MAX_ENTRIES, 0);

#[map(name = "cordon_nat_aff")]
static NAT_AFFINITY: HashMap<AffinityKey, AffinityValue> =
    HashMap::with_max_entries(AFFINITY_MAX_ENTRIES, 0);

#[map(name = "cordon_ct_nats")]
static CT_NATS: HashMap<CtNatsKey, CtNatsValue> = HashMap::with_max_entries(65536, 0);

#[map(name = "cordon_routes")]
static ROUTES: LpmTrie<[u8; 4], RouteValue> = LpmTrie::with_max_entries(ROUTES_MAX_ENTRIES, 0);

#[map(name = "cordon_arp")]
static ARP: HashMap<ArpKey, ArpValue> = HashMap::with_max_entries(ARP_MAX_ENTRIES, 0);

#[map(name = "cordon_ipsets")]
static IP_SETS: LpmTrie<IpSetKey, u32> = LpmTrie::with_max_entries(IPSETS_MAX_ENTRIES, 0);

#[map(name = "cordon_pol_rules")]
static POLICY_RULES: aya_ebpf::maps::Array<PolicyRule> =
    aya_ebpf::maps::Array::with_max_entries(POLICY_RULES_MAX, 0);

#[map(name = "cordon_pol_cfg")]
static POLICY_CFG: HashMap<u32, PolicyConfig> = HashMap::with_max_entries(4096, 0);

#[map(name = "cordon_failsafes")]
static FAILSAFES: HashMap<FailsafeKey, u8> = HashMap::with_max_entries(FAILSAFE_MAX_ENTRIES, 0);

/// Per-CPU scratch carrying `PacketState` across tail calls.
#[map(name = "cordon_state")]
static STATE: PerCpuArray<PacketState> = PerCpuArray::with_max_entries(1, 0);

/// Tail-call targets, one instance per attachment.
#[map(name = "cordon_jump")]
static JUMP: ProgramArray = ProgramArray::with_max_entries(JUMP_MAP_ENTRIES, 0);

/// Per-CPU drop/forward reason counters.
#[map(name = "cordon_reasons")]
static REASONS: PerCpuArray<u64> = PerCpuArray::with_max_entries(REASON_MAX, 0);

#[inline(always)]
pub fn routes_lookup(addr: [u8; 4]) -> Option<&'static RouteValue> {
    ROUTES.get(&aya_ebpf::maps::lpm_trie::Key::new(32, addr))
}

#[inline(always)]
pub fn routes_lookup_flags(addr: [u8; 4]) -> u32 {
    match routes_lookup(addr) {
        Some(v) => v.flags,
        None => 0,
    }
}

#[inline(always)]
pub fn addr_is_local_host(addr: [u8; 4]) -> bool {
    routes_lookup_flags(addr) & cordon_common::routes::RT_LOCAL_HOST != 0
}

#[inline(always)]
pub fn count_reason(reason: u8) {
    if let Some(c) = REASONS.get_ptr_mut(reason as u32) {
        unsafe { *c += 1 };
    }
}

#[inline(always)]
fn state_get() -> Option<&'static mut PacketState> {
    let ptr = STATE.get_ptr_mut(0)?;
    unsafe { ptr.as_mut() }
}

/// Main entry. Attached at ingress or egress of every managed
/// interface; behavior is selected by the `FLAVOR` global.
#[classifier]
pub fn tc_main(ctx: TcContext) -> i32 {
    let Some(state) = state_get() else {
        return TC_ACT_SHOT;
    };
    match program::run_main(&ctx, state, flavor()) {
        Ok(verdict) => verdict,
        Err(reason) => {
            count_reason(reason);
            TC_ACT_SHOT
        }
    }
}

/// Rules-driven policy program, installed once the attachment's rule
/// block has been written. First match wins; no match falls back to
/// the configured default.
#[classifier]
pub fn tc_policy(ctx: TcContext) -> i32 {
    let Some(state) = state_get() else {
        return TC_ACT_SHOT;
    };
    policy::evaluate(&ctx, state);
    let _ = unsafe { JUMP.tail_call(&ctx, jump_base() + cordon_common::jump::PROG_INDEX_ACCEPTED) };
    TC_ACT_SHOT
}

/// Default policy stub installed for workload interfaces before the
/// rules-driven program replaces it: no match, which the accepted
/// path treats as deny.
#[classifier]
pub fn tc_policy_deny(ctx: TcContext) -> i32 {
    let Some(state) = state_get() else {
        return TC_ACT_SHOT;
    };
    state.pol_rc = cordon_common::state::POL_NO_MATCH;
    let _ = unsafe { JUMP.tail_call(&ctx, jump_base() + cordon_common::jump::PROG_INDEX_ACCEPTED) };
    TC_ACT_SHOT
}

/// Default policy stub for host interfaces: allow until the generated
/// program is installed.
#[classifier]
pub fn tc_policy_allow(ctx: TcContext) -> i32 {
    let Some(state) = state_get() else {
        return TC_ACT_SHOT;
    };
    state.pol_rc = cordon_common::state::POL_ALLOW;
    let _ = unsafe { JUMP.tail_call(&ctx, jump_base() + cordon_common::jump::PROG_INDEX_ACCEPTED) };
    TC_ACT_SHOT
}

/// Post-policy program: conntrack creation, NAT rewrite, encap and the
/// final forward/drop decision.
#[classifier]
pub fn tc_accepted(ctx: TcContext) -> i32 {
    let Some(state) = state_get() else {
        return TC_ACT_SHOT;
    };
    match program::run_accepted(&ctx, state, flavor()) {
        Ok(verdict) => verdict,
        Err(reason) => {
            count_reason(reason);
            TC_ACT_SHOT
        }
    }
}

/// ICMP error synthesis: port unreachable, frag needed, ttl exceeded.
#[classifier]
pub fn tc_icmp(ctx: TcContext) -> i32 {
    let Some(state) = state_get() else {
        return TC_ACT_SHOT;
    };
    match icmp::run_icmp_reply(&ctx, state, flavor()) {
        Ok(verdict) => verdict,
        Err(reason) => {
            count_reason(reason);
            TC_ACT_SHOT
        }
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
