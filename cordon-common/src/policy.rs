//! Policy rule schema for the in-kernel policy program.
//!
//! Userland flattens each endpoint's tiers, policies and profiles
//! into a contiguous block of `PolicyRule`s in the rules map and
//! points the per-attachment `PolicyConfig` at the block. The policy
//! program scans the block in order; the first matching rule's action
//! wins. Replacing an endpoint's policy writes a fresh block and then
//! swaps the config, so evaluation never sees a half-written program.

/// Maximum rules across all attachments.
pub const POLICY_RULES_MAX: u32 = 256 * 1024;
/// Scan bound per attachment, for the verifier.
pub const POLICY_SCAN_MAX: u32 = 512;

// Rule actions.
pub const RULE_ACTION_ALLOW: u8 = 0;
pub const RULE_ACTION_DENY: u8 = 1;
/// Skip the rest of this tier; evaluation continues at `tier_end`.
pub const RULE_ACTION_PASS: u8 = 2;

// Match-presence flags. Unset fields match everything.
pub const RULE_MATCH_PROTOCOL: u16 = 0x01;
pub const RULE_MATCH_SRC_NET: u16 = 0x02;
pub const RULE_MATCH_DST_NET: u16 = 0x04;
pub const RULE_MATCH_SRC_PORTS: u16 = 0x08;
pub const RULE_MATCH_DST_PORTS: u16 = 0x10;
pub const RULE_MATCH_SRC_SET: u16 = 0x20;
pub const RULE_MATCH_DST_SET: u16 = 0x40;
/// Negate the source-set match.
pub const RULE_MATCH_NOT_SRC_SET: u16 = 0x80;
pub const RULE_MATCH_NOT_DST_SET: u16 = 0x100;

/// One flattened rule, 48 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyRule {
    pub action: u8,
    pub protocol: u8,
    /// Which optional matches are present.
    pub match_flags: u16,
    /// Rule index just past this rule's tier, for `PASS`.
    pub tier_end: u32,
    /// Source CIDR, network-order octets + prefix length.
    pub src_addr: [u8; 4],
    pub src_prefix_len: u8,
    /// Destination CIDR.
    pub dst_prefix_len: u8,
    pub _pad: [u8; 2],
    pub dst_addr: [u8; 4],
    /// Single port range each; multi-range rules are flattened into
    /// one rule per range by userland.
    pub src_port_start: u16,
    pub src_port_end: u16,
    pub dst_port_start: u16,
    pub dst_port_end: u16,
    /// Numeric IP-set ids for set matches; zero when unused.
    pub src_set_id: u64,
    pub dst_set_id: u64,
}

/// Per-attachment policy program configuration, 16 bytes. Keyed by
/// the attachment's jump-map base slot, which is unique per
/// (interface, direction).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyConfig {
    /// First rule index in the rules map.
    pub start: u32,
    pub count: u32,
    /// Verdict when no rule matches (`RULE_ACTION_ALLOW` for host
    /// endpoints, `RULE_ACTION_DENY` for workloads).
    pub no_match_action: u8,
    pub _pad: [u8; 7],
}

/// Does `addr` fall inside the rule CIDR? Pure so the kernel program
/// and the tests share it.
pub fn cidr_contains(cidr: [u8; 4], prefix_len: u8, addr: [u8; 4]) -> bool {
    if prefix_len == 0 {
        return true;
    }
    if prefix_len >= 32 {
        return cidr == addr;
    }
    let mask = u32::MAX << (32 - prefix_len as u32);
    (u32::from_be_bytes(cidr) & mask) == (u32::from_be_bytes(addr) & mask)
}

/// Protocol/CIDR/port half of the rule match; set matches are layered
/// on by the caller (they need map lookups).
pub fn rule_matches_packet(
    rule: &PolicyRule,
    protocol: u8,
    src: [u8; 4],
    dst: [u8; 4],
    sport: u16,
    dport: u16,
) -> bool {
    if rule.match_flags & RULE_MATCH_PROTOCOL != 0 && rule.protocol != protocol {
        return false;
    }
    if rule.match_flags & RULE_MATCH_SRC_NET != 0
        && !cidr_contains(rule.src_addr, rule.src_prefix_len, src)
    {
        return false;
    }
    if rule.match_flags & RULE_MATCH_DST_NET != 0
        && !cidr_contains(rule.dst_addr, rule.dst_prefix_len, dst)
    {
        return false;
    }
    if rule.match_flags & RULE_MATCH_SRC_PORTS != 0
        && !(rule.src_port_start..=rule.src_port_end).contains(&sport)
    {
        return false;
    }
    if rule.match_flags & RULE_MATCH_DST_PORTS != 0
        && !(rule.dst_port_start..=rule.dst_port_end).contains(&dport)
    {
        return false;
    }
    true
}

#[cfg(feature = "user")]
mod user_impls {
    unsafe impl aya::Pod for super::PolicyRule {}
    unsafe impl aya::Pod for super::PolicyConfig {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts() {
        assert_eq!(core::mem::size_of::<PolicyRule>(), 48);
        assert_eq!(core::mem::size_of::<PolicyConfig>(), 16);
    }

    #[test]
    fn cidr_matching() {
        assert!(cidr_contains([10, 0, 0, 0], 8, [10, 200, 3, 4]));
        assert!(!cidr_contains([10, 0, 0, 0], 8, [11, 0, 0, 1]));
        assert!(cidr_contains([1, 1, 1, 1], 32, [1, 1, 1, 1]));
        assert!(!cidr_contains([1, 1, 1, 1], 32, [1, 1, 1, 2]));
        assert!(cidr_contains([0, 0, 0, 0], 0, [255, 255, 255, 255]));
    }

    #[test]
    fn unset_fields_match_everything() {
        let rule = PolicyRule::default();
        assert!(rule_matches_packet(&rule, 6, [1, 1, 1, 1], [2, 2, 2, 2], 1, 2));
    }

    #[test]
    fn port_range_matching() {
        let rule = PolicyRule {
            match_flags: RULE_MATCH_PROTOCOL | RULE_MATCH_DST_PORTS,
            protocol: 6,
            dst_port_start: 8000,
            dst_port_end: 8080,
            ..Default::default()
        };
        assert!(rule_matches_packet(&rule, 6, [1, 1, 1, 1], [2, 2, 2, 2], 5, 8080));
        assert!(!rule_matches_packet(&rule, 6, [1, 1, 1, 1], [2, 2, 2, 2], 5, 8081));
        assert!(!rule_matches_packet(&rule, 17, [1, 1, 1, 1], [2, 2, 2, 2], 5, 8080));
    }
}
