//! Fixed packet-mark bits.
//!
//! The 32-bit skb mark carries decisions from the TC programs to the
//! iptables legacy path and between program stages. These bits are
//! compiled into the programs and are not configurable; the agent
//! verifies at startup that its allowed mark mask covers them before
//! allocating the remaining configurable bits (see
//! `cordon-dataplane::marks`).

/// Brand bits identifying a mark as ours.
pub const MARK_CORDON: u32 = 0xc000_0000;
pub const MARK_CORDON_MASK: u32 = 0xe000_0000;

/// Packet has been through one of our programs.
pub const MARK_SEEN: u32 = MARK_CORDON | 0x0100_0000;
pub const MARK_SEEN_MASK: u32 = MARK_CORDON_MASK | MARK_SEEN;

/// Flow approved at both ingress and egress; later programs skip all
/// processing.
pub const MARK_BYPASS: u32 = MARK_SEEN | 0x0200_0000;
pub const MARK_BYPASS_MASK: u32 = MARK_SEEN_MASK | MARK_BYPASS;

/// Mid-flow miss: hand the packet to the legacy path, which accepts
/// it only if Linux conntrack already knows the flow.
pub const MARK_FALLTHROUGH: u32 = MARK_SEEN | 0x0400_0000;
pub const MARK_FALLTHROUGH_MASK: u32 = MARK_SEEN_MASK | MARK_FALLTHROUGH;

/// Approved for forwarding (encapped NodePort traffic, ICMP replies).
pub const MARK_BYPASS_FWD: u32 = MARK_BYPASS | 0x0030_0000;
/// As `MARK_BYPASS_FWD`, but the source IP still needs fixing up to
/// the host address on the way out.
pub const MARK_BYPASS_FWD_SRC_FIXUP: u32 = MARK_BYPASS | 0x0050_0000;
/// Skip the RPF check in the raw table for this packet.
pub const MARK_SKIP_RPF: u32 = MARK_BYPASS | 0x0040_0000;
pub const MARK_SKIP_RPF_MASK: u32 = MARK_BYPASS_MASK | 0x00f0_0000;

/// Flow needs iptables SNAT (NAT-outgoing pool).
pub const MARK_NAT_OUT: u32 = MARK_BYPASS | 0x0080_0000;
pub const MARK_NAT_OUT_MASK: u32 = MARK_BYPASS_MASK | MARK_NAT_OUT;

/// Set by iptables on flows Linux conntrack already tracks, so the
/// programs can tell pre-existing flows apart from invalid ones.
pub const MARK_LINUX_CT_ESTABLISHED: u32 = MARK_CORDON | 0x0800_0000;
pub const MARK_LINUX_CT_ESTABLISHED_MASK: u32 = MARK_CORDON | 0x0800_0000;

/// Every bit any program may set. The agent's allowed mark mask must
/// cover this.
pub const MARKS_MASK: u32 = 0xfff0_0000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_bits_within_marks_mask() {
        for mark in [
            MARK_SEEN,
            MARK_BYPASS,
            MARK_FALLTHROUGH,
            MARK_BYPASS_FWD,
            MARK_BYPASS_FWD_SRC_FIXUP,
            MARK_SKIP_RPF,
            MARK_NAT_OUT,
            MARK_LINUX_CT_ESTABLISHED,
        ] {
            assert_eq!(mark & !MARKS_MASK, 0, "mark {mark:#010x} escapes the mask");
        }
    }

    #[test]
    fn bypass_variants_distinguishable_under_mask() {
        let m = MARK_SKIP_RPF_MASK;
        let variants = [MARK_BYPASS_FWD & m, MARK_BYPASS_FWD_SRC_FIXUP & m, MARK_SKIP_RPF & m];
        assert_ne!(variants[0], variants[1]);
        assert_ne!(variants[0], variants[2]);
        assert_ne!(variants[1], variants[2]);
    }
}
