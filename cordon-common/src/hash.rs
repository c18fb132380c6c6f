//! Flow hashing shared by the TC programs and userland.

/// 32-bit FNV-1a over the flow 5-tuple.
///
/// Needs no lookup tables and unrolls to straight-line code, which
/// keeps the verifier happy. Distribution over source ports is good
/// enough for backend spreading (see the tests in `nat`).
pub fn flow_hash(
    protocol: u8,
    src_addr: [u8; 4],
    src_port: u16,
    dst_addr: [u8; 4],
    dst_port: u16,
) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let mut h = OFFSET;
    let mut step = |b: u8| {
        h ^= b as u32;
        h = h.wrapping_mul(PRIME);
    };
    step(protocol);
    for b in src_addr {
        step(b);
    }
    step((src_port >> 8) as u8);
    step(src_port as u8);
    for b in dst_addr {
        step(b);
    }
    step((dst_port >> 8) as u8);
    step(dst_port as u8);
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let a = flow_hash(6, [1, 2, 3, 4], 1000, [5, 6, 7, 8], 80);
        let b = flow_hash(6, [1, 2, 3, 4], 1000, [5, 6, 7, 8], 80);
        assert_eq!(a, b);
    }

    #[test]
    fn sensitive_to_every_field() {
        let base = flow_hash(6, [1, 2, 3, 4], 1000, [5, 6, 7, 8], 80);
        assert_ne!(base, flow_hash(17, [1, 2, 3, 4], 1000, [5, 6, 7, 8], 80));
        assert_ne!(base, flow_hash(6, [1, 2, 3, 5], 1000, [5, 6, 7, 8], 80));
        assert_ne!(base, flow_hash(6, [1, 2, 3, 4], 1001, [5, 6, 7, 8], 80));
        assert_ne!(base, flow_hash(6, [1, 2, 3, 4], 1000, [5, 6, 7, 9], 80));
        assert_ne!(base, flow_hash(6, [1, 2, 3, 4], 1000, [5, 6, 7, 8], 81));
    }
}
