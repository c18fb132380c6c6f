//! Drop/forward reason codes.
//!
//! Purely diagnostic: counted per-CPU and surfaced in debug logs,
//! never acted on.

pub const REASON_UNKNOWN: u8 = 0;
pub const REASON_BYPASS: u8 = 1;
pub const REASON_SHORT: u8 = 2;
pub const REASON_IP_MALFORMED: u8 = 3;
pub const REASON_IP_OPTIONS: u8 = 4;
pub const REASON_UNAUTH_SOURCE: u8 = 5;
pub const REASON_RT_UNKNOWN: u8 = 6;
pub const REASON_CSUM_FAIL: u8 = 7;
pub const REASON_ENCAP_FAIL: u8 = 8;
pub const REASON_POLICY_DENY: u8 = 9;
pub const REASON_RPF_FAIL: u8 = 10;
pub const REASON_CT_CREATE_FAIL: u8 = 11;
/// Workload-to-host traffic blocked by the default endpoint-to-host
/// action.
pub const REASON_WORKLOAD_TO_HOST: u8 = 12;

/// Number of reason slots in the per-CPU counter array.
pub const REASON_MAX: u32 = 16;
