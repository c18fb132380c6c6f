//! Rule and chain rendering.
//!
//! Pure data-to-text: managers describe what they want as `Chain`s of
//! `Rule`s and the table writers turn them into `iptables-restore`
//! input. Rendering is deterministic, and every rule carries a short
//! content hash in its comment so the writers can diff programmed
//! state against desired state without parsing match syntax.

mod chains;
mod policy;

pub use chains::*;
pub use policy::*;

use std::fmt::Write as _;

/// Prefix on every chain we own.
pub const CHAIN_PREFIX: &str = "cord-";
/// Prefix on every rule-hash comment we insert.
pub const RULE_HASH_PREFIX: &str = "cord:";
/// iptables limits chain names to 28 characters.
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// Hex digits of hash appended to generated chain names.
const NAME_HASH_LEN: usize = 11;

/// Action of a rendered rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Accept,
    Drop,
    Return,
    Jump(String),
    Goto(String),
    SetMark { mark: u32, mask: u32 },
    SetConnMark { mark: u32, mask: u32 },
    Masquerade,
    DnatTo { addr: std::net::Ipv4Addr, port: u16 },
    SnatTo { addr: std::net::Ipv4Addr },
    Log { prefix: String },
    /// No action: the rule only exists for its side effects (e.g. a
    /// counter) or as a match-only marker.
    NoOp,
}

impl Action {
    fn render(&self, out: &mut String) {
        match self {
            Action::Accept => out.push_str("-j ACCEPT"),
            Action::Drop => out.push_str("-j DROP"),
            Action::Return => out.push_str("-j RETURN"),
            Action::Jump(target) => {
                let _ = write!(out, "-j {target}");
            }
            Action::Goto(target) => {
                let _ = write!(out, "-g {target}");
            }
            Action::SetMark { mark, mask } => {
                let _ = write!(out, "-j MARK --set-xmark {mark:#x}/{mask:#x}");
            }
            Action::SetConnMark { mark, mask } => {
                let _ = write!(out, "-j CONNMARK --set-mark {mark:#x}/{mask:#x}");
            }
            Action::Masquerade => out.push_str("-j MASQUERADE"),
            Action::DnatTo { addr, port } => {
                if *port == 0 {
                    let _ = write!(out, "-j DNAT --to-destination {addr}");
                } else {
                    let _ = write!(out, "-j DNAT --to-destination {addr}:{port}");
                }
            }
            Action::SnatTo { addr } => {
                let _ = write!(out, "-j SNAT --to-source {addr}");
            }
            Action::Log { prefix } => {
                let _ = write!(out, "-j LOG --log-prefix \"{prefix}: \" --log-level 5");
            }
            Action::NoOp => {}
        }
    }
}

/// Builder for the match half of a rule. Fragments are appended in
/// call order so identical builders render identically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Match {
    spec: String,
}

impl Match {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, fragment: &str) -> Self {
        if !self.spec.is_empty() {
            self.spec.push(' ');
        }
        self.spec.push_str(fragment);
        self
    }

    pub fn in_interface(self, iface: &str) -> Self {
        self.push(&format!("-i {iface}"))
    }

    pub fn out_interface(self, iface: &str) -> Self {
        self.push(&format!("-o {iface}"))
    }

    pub fn protocol(self, proto: u8) -> Self {
        self.push(&format!("-p {proto}"))
    }

    pub fn src_net(self, net: &ipnet::Ipv4Net) -> Self {
        self.push(&format!("-s {net}"))
    }

    pub fn dst_net(self, net: &ipnet::Ipv4Net) -> Self {
        self.push(&format!("-d {net}"))
    }

    pub fn dst_ports(self, ranges: &[(u16, u16)]) -> Self {
        self.ports("--dports", ranges)
    }

    pub fn src_ports(self, ranges: &[(u16, u16)]) -> Self {
        self.ports("--sports", ranges)
    }

    fn ports(self, flag: &str, ranges: &[(u16, u16)]) -> Self {
        if ranges.is_empty() {
            return self;
        }
        let list = ranges
            .iter()
            .map(|(lo, hi)| {
                if lo == hi {
                    lo.to_string()
                } else {
                    format!("{lo}:{hi}")
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        self.push(&format!("-m multiport {flag} {list}"))
    }

    pub fn mark_matches_with_mask(self, mark: u32, mask: u32) -> Self {
        self.push(&format!("-m mark --mark {mark:#x}/{mask:#x}"))
    }

    pub fn not_mark_matches_with_mask(self, mark: u32, mask: u32) -> Self {
        self.push(&format!("-m mark ! --mark {mark:#x}/{mask:#x}"))
    }

    pub fn conntrack_state(self, states: &str) -> Self {
        self.push(&format!("-m conntrack --ctstate {states}"))
    }

    pub fn ip_set_src(self, set: &str) -> Self {
        self.push(&format!("-m set --match-set {set} src"))
    }

    pub fn ip_set_dst(self, set: &str) -> Self {
        self.push(&format!("-m set --match-set {set} dst"))
    }

    pub fn not_ip_set_src(self, set: &str) -> Self {
        self.push(&format!("-m set ! --match-set {set} src"))
    }

    pub fn not_ip_set_dst(self, set: &str) -> Self {
        self.push(&format!("-m set ! --match-set {set} dst"))
    }

    pub fn rpf_check_passed(self) -> Self {
        self.push("-m rpfilter --validmark")
    }

    pub fn is_empty(&self) -> bool {
        self.spec.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.spec
    }
}

/// One rendered rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub matches: Match,
    pub action: Action,
    pub comment: Option<String>,
}

impl Rule {
    pub fn new(matches: Match, action: Action) -> Self {
        Self {
            matches,
            action,
            comment: None,
        }
    }

    pub fn commented(matches: Match, action: Action, comment: impl Into<String>) -> Self {
        Self {
            matches,
            action,
            comment: Some(comment.into()),
        }
    }

    /// Render as an `-A <chain>` line for iptables-restore, with the
    /// hash comment first so a kernel round trip preserves our
    /// ordering of comment modules.
    pub fn render_append(&self, chain: &str, hash: &str) -> String {
        let mut out = format!("-A {chain} -m comment --comment \"{RULE_HASH_PREFIX}{hash}\"");
        if let Some(c) = &self.comment {
            let _ = write!(out, " -m comment --comment \"{c}\"");
        }
        if !self.matches.is_empty() {
            out.push(' ');
            out.push_str(self.matches.as_str());
        }
        if self.action != Action::NoOp {
            out.push(' ');
            self.action.render(&mut out);
        }
        out
    }

    /// Content fed into the per-rule hash (no comments, no hash).
    fn hash_input(&self) -> String {
        let mut out = String::new();
        out.push_str(self.matches.as_str());
        out.push('|');
        self.action.render(&mut out);
        out
    }
}

/// An ordered chain of rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    pub rules: Vec<Rule>,
}

impl Chain {
    pub fn new(name: impl Into<String>, rules: Vec<Rule>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }

    /// Per-rule hashes. Each hash covers the chain name, the rule's
    /// position-dependent predecessor hash and the rule content, so
    /// any insertion or reorder changes every later hash and the
    /// writer replaces exactly the affected tail.
    pub fn rule_hashes(&self) -> Vec<String> {
        let mut hashes = Vec::with_capacity(self.rules.len());
        let mut prev: u64 = fnv64(self.name.as_bytes());
        for rule in &self.rules {
            let mut h = prev;
            h = fnv64_continue(h, rule.hash_input().as_bytes());
            hashes.push(short_hash(h));
            prev = h;
        }
        hashes
    }
}

/// 64-bit FNV-1a.
fn fnv64(data: &[u8]) -> u64 {
    fnv64_continue(0xcbf2_9ce4_8422_2325, data)
}

fn fnv64_continue(mut h: u64, data: &[u8]) -> u64 {
    for b in data {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

/// Hash rendered for rule comments: 16 hex chars.
fn short_hash(h: u64) -> String {
    format!("{h:016x}")
}

/// Build a chain name from a prefix and a seed, hashing the seed so
/// arbitrary-length identifiers fit the kernel's 28-character limit.
/// Unrelated seeds keep unrelated names, so a change to one endpoint
/// or policy never renames another's chain.
pub fn chain_name(prefix: &str, seed: &str) -> String {
    let mut name = format!("{CHAIN_PREFIX}{prefix}-");
    let budget = MAX_CHAIN_NAME_LEN - name.len();
    if seed.len() <= budget {
        name.push_str(seed);
    } else {
        let h = short_hash(fnv64(seed.as_bytes()));
        name.push_str(&h[..NAME_HASH_LEN.min(budget)]);
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(frag: &str) -> Rule {
        Rule::new(Match::new().push(frag), Action::Accept)
    }

    #[test]
    fn identical_chains_hash_identically() {
        let a = Chain::new("cord-test", vec![rule("-p 6"), rule("-p 17")]);
        let b = Chain::new("cord-test", vec![rule("-p 6"), rule("-p 17")]);
        assert_eq!(a.rule_hashes(), b.rule_hashes());
    }

    #[test]
    fn insertion_changes_later_hashes_only() {
        let a = Chain::new("cord-test", vec![rule("-p 6"), rule("-p 17")]);
        let b = Chain::new(
            "cord-test",
            vec![rule("-p 6"), rule("-p 1"), rule("-p 17")],
        );
        let ha = a.rule_hashes();
        let hb = b.rule_hashes();
        assert_eq!(ha[0], hb[0]);
        assert_ne!(ha[1], hb[1]);
    }

    #[test]
    fn chain_name_respects_length_limit() {
        let long = "a-very-long-workload-identifier/with/slashes";
        let name = chain_name("tw", long);
        assert!(name.len() <= MAX_CHAIN_NAME_LEN, "{name}");
        assert!(name.starts_with("cord-tw-"));
        // Deterministic.
        assert_eq!(name, chain_name("tw", long));
        // Distinct seeds get distinct names.
        assert_ne!(name, chain_name("tw", "another-long-workload-identifier"));
    }

    #[test]
    fn rendered_rule_includes_hash_comment_and_action() {
        let r = Rule::new(Match::new().protocol(6), Action::Drop);
        let line = r.render_append("cord-fw", "deadbeefdeadbeef");
        assert_eq!(
            line,
            "-A cord-fw -m comment --comment \"cord:deadbeefdeadbeef\" -p 6 -j DROP"
        );
    }

    #[test]
    fn match_builder_order_is_stable() {
        let a = Match::new().protocol(6).in_interface("cord123");
        let b = Match::new().protocol(6).in_interface("cord123");
        assert_eq!(a, b);
    }
}
