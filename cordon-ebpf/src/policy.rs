//! Generic policy program.
//!
//! Scans this attachment's rule block in order; the first matching
//! rule decides, `PASS` skips to the end of the tier, and running off
//! the end yields the configured no-match action. Userland rewrites
//! the block and swaps the config whenever policy changes.

use aya_ebpf::programs::TcContext;

use cordon_common::ipsets::{IpSetKey, PREFIX_FULL};
use cordon_common::policy::*;
use cordon_common::state::{PacketState, POL_ALLOW, POL_DENY, POL_NO_MATCH};

use crate::{jump_base, IP_SETS, POLICY_CFG, POLICY_RULES};

/// Evaluate policy for the packet in `state` and record the verdict.
#[inline(always)]
pub fn evaluate(_ctx: &TcContext, state: &mut PacketState) {
    let Some(cfg) = (unsafe { POLICY_CFG.get(&jump_base()) }) else {
        // No policy programmed yet; leave the default verdict.
        state.pol_rc = POL_NO_MATCH;
        return;
    };

    let src = state.ip_src;
    // Policy always sees the pre-NAT destination.
    let dst = state.pre_nat_ip_dst;
    let sport = state.sport;
    let dport = state.pre_nat_dport;
    let proto = state.ip_proto;

    let end = cfg.start + cfg.count;
    let mut i = cfg.start;
    let mut iter = 0u32;
    while i < end && iter < POLICY_SCAN_MAX {
        iter += 1;
        let Some(rule) = POLICY_RULES.get(i) else {
            i += 1;
            continue;
        };

        if !rule_matches_packet(rule, proto, src, dst, sport, dport) {
            i += 1;
            continue;
        }
        if !set_matches(rule, src, dst, proto, sport, dport) {
            i += 1;
            continue;
        }

        match rule.action {
            RULE_ACTION_ALLOW => {
                state.pol_rc = POL_ALLOW;
                return;
            }
            RULE_ACTION_DENY => {
                state.pol_rc = POL_DENY;
                return;
            }
            RULE_ACTION_PASS => {
                // Jump past the rest of this tier.
                i = if rule.tier_end > i { rule.tier_end } else { i + 1 };
                continue;
            }
            _ => {
                i += 1;
            }
        }
    }

    state.pol_rc = match cfg.no_match_action {
        RULE_ACTION_ALLOW => POL_ALLOW,
        _ => POL_NO_MATCH,
    };
}

/// IP-set half of the rule match.
#[inline(always)]
fn set_matches(
    rule: &PolicyRule,
    src: [u8; 4],
    dst: [u8; 4],
    proto: u8,
    sport: u16,
    dport: u16,
) -> bool {
    if rule.match_flags & (RULE_MATCH_SRC_SET | RULE_MATCH_NOT_SRC_SET) != 0 {
        let hit = set_contains(rule.src_set_id, src, proto, sport);
        if rule.match_flags & RULE_MATCH_SRC_SET != 0 && !hit {
            return false;
        }
        if rule.match_flags & RULE_MATCH_NOT_SRC_SET != 0 && hit {
            return false;
        }
    }
    if rule.match_flags & (RULE_MATCH_DST_SET | RULE_MATCH_NOT_DST_SET) != 0 {
        let hit = set_contains(rule.dst_set_id, dst, proto, dport);
        if rule.match_flags & RULE_MATCH_DST_SET != 0 && !hit {
            return false;
        }
        if rule.match_flags & RULE_MATCH_NOT_DST_SET != 0 && hit {
            return false;
        }
    }
    true
}

/// Longest-prefix membership test. Address-only members match because
/// their entries stop at the address bits; port+protocol members only
/// match when the full key lines up.
#[inline(always)]
fn set_contains(set_id: u64, addr: [u8; 4], proto: u8, port: u16) -> bool {
    let key = aya_ebpf::maps::lpm_trie::Key::new(
        PREFIX_FULL,
        IpSetKey::member(set_id, addr, port, proto),
    );
    IP_SETS.get(&key).is_some()
}
