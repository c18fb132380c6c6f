//! Chain construction for the managers.
//!
//! Chain and set names are fixed here so managers never collide:
//! every manager renders only through its own constructors.

use ipnet::Ipv4Net;

use cordon_common::marks;

use super::{chain_name, Action, Chain, Match, Rule};

// Dispatch and static chain names.
pub const CHAIN_TO_WL_DISPATCH: &str = "cord-to-wl-dispatch";
pub const CHAIN_FROM_WL_DISPATCH: &str = "cord-from-wl-dispatch";
pub const CHAIN_FORWARD: &str = "cord-FORWARD";
pub const CHAIN_INPUT: &str = "cord-INPUT";
pub const CHAIN_OUTPUT: &str = "cord-OUTPUT";
pub const CHAIN_NAT_POSTROUTING: &str = "cord-nat-POSTROUTING";
pub const CHAIN_NAT_PREROUTING: &str = "cord-nat-PREROUTING";
pub const CHAIN_MASQ: &str = "cord-masq";
pub const CHAIN_FIP_DNAT: &str = "cord-fip-dnat";
pub const CHAIN_FIP_SNAT: &str = "cord-fip-snat";
pub const CHAIN_RAW_PREROUTING: &str = "cord-raw-PREROUTING";
pub const CHAIN_RPF: &str = "cord-rpf";
pub const CHAIN_SERVICE_LOOP: &str = "cord-svc-loop";
pub const CHAIN_WG_INCOMING_MARK: &str = "cord-wg-mark";

// IP-set names (the kernel limits set names to 31 characters).
pub const IPSET_ALL_POOLS: &str = "cord-all-pools";
pub const IPSET_MASQ_POOLS: &str = "cord-masq-pools";
pub const IPSET_ALL_HOSTS: &str = "cord-all-hosts";
pub const IPSET_THIS_HOST: &str = "cord-this-host";

const MAX_SET_NAME_LEN: usize = 31;

/// Kernel set name for an upstream IP-set id. Internal sets pass
/// their final name straight through.
pub fn ip_set_name(id: &str) -> String {
    if id.starts_with("cord-") {
        return id.to_string();
    }
    let name = format!("cord-s-{id}");
    if name.len() <= MAX_SET_NAME_LEN {
        return name;
    }
    chain_name("s", id)
}

/// Per-endpoint chain names.
pub fn endpoint_to_wl_chain_name(workload_id: &str) -> String {
    chain_name("tw", workload_id)
}

pub fn endpoint_from_wl_chain_name(workload_id: &str) -> String {
    chain_name("fw", workload_id)
}

/// Filter-table base-chain rules for fast-path mode.
///
/// The TC programs make the decisions; these rules translate the
/// packet marks they leave into iptables verdicts and close the gap
/// for flows that predate the programs.
pub struct BpfFilterRules {
    pub input: Vec<Rule>,
    pub output: Vec<Rule>,
    pub forward: Vec<Rule>,
}

fn bpf_input_output_rules(
    workload_prefixes: &[String],
    endpoint_to_host_accept: bool,
) -> (Vec<Rule>, Vec<Rule>) {
    let mut input = vec![
        Rule::commented(
            Match::new()
                .mark_matches_with_mask(marks::MARK_FALLTHROUGH, marks::MARK_FALLTHROUGH_MASK)
                .conntrack_state("ESTABLISHED,RELATED"),
            Action::Accept,
            "Accept flows that pre-date the programs",
        ),
        Rule::commented(
            Match::new()
                .mark_matches_with_mask(marks::MARK_FALLTHROUGH, marks::MARK_FALLTHROUGH_MASK),
            Action::Drop,
            "Drop unknown fallthrough flows",
        ),
    ];

    let output = vec![Rule::commented(
        Match::new().conntrack_state("ESTABLISHED,RELATED"),
        Action::SetConnMark {
            mark: marks::MARK_LINUX_CT_ESTABLISHED,
            mask: marks::MARK_LINUX_CT_ESTABLISHED_MASK,
        },
        "Mark pre-established host flows",
    )];

    for prefix in workload_prefixes {
        let iface = format!("{prefix}+");
        if endpoint_to_host_accept {
            input.push(Rule::new(
                Match::new()
                    .in_interface(&iface)
                    .mark_matches_with_mask(marks::MARK_SEEN, marks::MARK_SEEN_MASK),
                Action::Accept,
            ));
        }
        input.push(Rule::new(
            Match::new()
                .in_interface(&iface)
                .not_mark_matches_with_mask(marks::MARK_SEEN, marks::MARK_SEEN_MASK),
            Action::Drop,
        ));
    }
    (input, output)
}

pub fn bpf_filter_base_rules(
    workload_prefixes: &[String],
    endpoint_to_host_accept: bool,
) -> BpfFilterRules {
    let mut forward = vec![Rule::commented(
        Match::new().mark_matches_with_mask(marks::MARK_BYPASS, marks::MARK_BYPASS_MASK),
        Action::Accept,
        "Pre-approved by the TC programs",
    )];

    let (input, output) = bpf_input_output_rules(workload_prefixes, endpoint_to_host_accept);

    for prefix in workload_prefixes {
        let iface = format!("{prefix}+");
        forward.push(Rule::commented(
            Match::new()
                .in_interface(&iface)
                .not_mark_matches_with_mask(marks::MARK_SEEN, marks::MARK_SEEN_MASK),
            Action::Drop,
            "From workload without seen mark",
        ));
    }

    // Route fast-path-bound packets through the dispatch chain so a
    // workload without an attached program cannot receive unpoliced
    // traffic, then accept workload traffic the programs marked.
    for prefix in workload_prefixes {
        let iface = format!("{prefix}+");
        forward.push(Rule::commented(
            Match::new().out_interface(&iface),
            Action::Jump(CHAIN_TO_WL_DISPATCH.to_string()),
            "To workload; check workload is known",
        ));
    }
    for prefix in workload_prefixes {
        let iface = format!("{prefix}+");
        forward.push(Rule::commented(
            Match::new().in_interface(&iface),
            Action::Accept,
            "From workload; mark verified",
        ));
    }

    BpfFilterRules {
        input,
        output,
        forward,
    }
}

/// IPv6 variant: the fast path does not police IPv6, so traffic to a
/// workload is dropped outright and nothing is dispatched.
pub fn bpf_filter_base_rules_v6(
    workload_prefixes: &[String],
    endpoint_to_host_accept: bool,
) -> BpfFilterRules {
    let mut forward = vec![Rule::commented(
        Match::new().mark_matches_with_mask(marks::MARK_BYPASS, marks::MARK_BYPASS_MASK),
        Action::Accept,
        "Pre-approved by the TC programs",
    )];

    let (input, output) = bpf_input_output_rules(workload_prefixes, endpoint_to_host_accept);

    for prefix in workload_prefixes {
        let iface = format!("{prefix}+");
        forward.push(Rule::commented(
            Match::new()
                .in_interface(&iface)
                .not_mark_matches_with_mask(marks::MARK_SEEN, marks::MARK_SEEN_MASK),
            Action::Drop,
            "From workload without seen mark",
        ));
        forward.push(Rule::commented(
            Match::new().out_interface(&iface),
            Action::Drop,
            "To workload, drop IPv6",
        ));
    }

    BpfFilterRules {
        input,
        output,
        forward,
    }
}

/// Raw-table RPF chain for fast-path mode.
pub fn bpf_rpf_chain() -> Chain {
    let rules = vec![
        Rule::commented(
            Match::new()
                .mark_matches_with_mask(marks::MARK_SKIP_RPF, marks::MARK_SKIP_RPF_MASK),
            Action::Return,
            "Programs asked to skip RPF",
        ),
        Rule::commented(
            Match::new()
                .mark_matches_with_mask(marks::MARK_BYPASS_FWD, marks::MARKS_MASK)
                .rpf_check_passed(),
            Action::Return,
            "Approved for forward",
        ),
        Rule::new(
            Match::new().not_mark_matches_with_mask(marks::MARK_SEEN, marks::MARK_SEEN_MASK),
            Action::Return,
        ),
        Rule::commented(Match::new(), Action::Drop, "Failed RPF"),
    ];
    Chain::new(CHAIN_RPF, rules)
}

/// Raw prerouting dispatch: wireguard mark first (when enabled), then
/// the RPF chain.
pub fn raw_prerouting_chain(wireguard: bool) -> Chain {
    let mut rules = Vec::new();
    if wireguard {
        rules.push(Rule::new(
            Match::new(),
            Action::Jump(CHAIN_WG_INCOMING_MARK.to_string()),
        ));
    }
    rules.push(Rule::new(Match::new(), Action::Jump(CHAIN_RPF.to_string())));
    Chain::new(CHAIN_RAW_PREROUTING, rules)
}

/// Marks traffic arriving on non-crypto interfaces so the RPF check
/// tolerates the asymmetric return path through the crypto device.
pub fn wireguard_incoming_mark_chain(wg_iface: &str, wg_mark: u32, workload_prefixes: &[String]) -> Chain {
    let mut rules = vec![Rule::new(
        Match::new().in_interface("lo"),
        Action::Return,
    )];
    rules.push(Rule::new(
        Match::new().in_interface(wg_iface),
        Action::Return,
    ));
    for prefix in workload_prefixes {
        rules.push(Rule::new(
            Match::new().in_interface(&format!("{prefix}+")),
            Action::Return,
        ));
    }
    rules.push(Rule::new(
        Match::new(),
        Action::SetMark {
            mark: wg_mark,
            mask: wg_mark,
        },
    ));
    Chain::new(CHAIN_WG_INCOMING_MARK, rules)
}

/// Source-NAT chain: masquerade traffic leaving the masq pools for
/// destinations outside every pool.
pub fn masq_chain() -> Chain {
    Chain::new(
        CHAIN_MASQ,
        vec![Rule::commented(
            Match::new()
                .ip_set_src(IPSET_MASQ_POOLS)
                .not_ip_set_dst(IPSET_ALL_POOLS),
            Action::Masquerade,
            "NAT-outgoing",
        )],
    )
}

/// NAT postrouting dispatch.
pub fn nat_postrouting_chain(masq_enabled: bool) -> Chain {
    let mut rules = vec![Rule::new(
        Match::new(),
        Action::Jump(CHAIN_FIP_SNAT.to_string()),
    )];
    if masq_enabled {
        rules.push(Rule::new(
            Match::new(),
            Action::Jump(CHAIN_MASQ.to_string()),
        ));
    }
    Chain::new(CHAIN_NAT_POSTROUTING, rules)
}

/// NAT prerouting dispatch (floating-IP DNAT).
pub fn nat_prerouting_chain() -> Chain {
    Chain::new(
        CHAIN_NAT_PREROUTING,
        vec![Rule::new(
            Match::new(),
            Action::Jump(CHAIN_FIP_DNAT.to_string()),
        )],
    )
}

/// Drop rules preventing service VIP traffic from looping back into
/// the dataplane.
pub fn service_loop_chain(cidrs: &[Ipv4Net]) -> Chain {
    let rules = cidrs
        .iter()
        .map(|cidr| {
            Rule::commented(
                Match::new().dst_net(cidr),
                Action::Drop,
                "Unhandled service VIP",
            )
        })
        .collect();
    Chain::new(CHAIN_SERVICE_LOOP, rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_set_names_fit_kernel_limit() {
        assert_eq!(ip_set_name("abc"), "cord-s-abc");
        let long = ip_set_name("an-extremely-long-ip-set-identifier-from-upstream");
        assert!(long.len() <= MAX_SET_NAME_LEN);
    }

    #[test]
    fn bpf_forward_rules_check_dispatch_before_accepting() {
        let r = bpf_filter_base_rules(&[String::from("cord")], false);
        let dispatch_pos = r
            .forward
            .iter()
            .position(|r| matches!(&r.action, Action::Jump(t) if t == CHAIN_TO_WL_DISPATCH))
            .unwrap();
        let accept_pos = r
            .forward
            .iter()
            .rposition(|r| r.action == Action::Accept)
            .unwrap();
        assert!(dispatch_pos < accept_pos);
    }

    #[test]
    fn endpoint_to_host_accept_adds_input_accept() {
        let prefixes = vec![String::from("cord")];
        let dropped = bpf_filter_base_rules(&prefixes, false);
        assert!(
            !dropped.input.iter().any(|r| r.action == Action::Accept
                && r.matches.as_str().contains("-i cord+")),
            "workload input traffic accepted without opt-in"
        );
        let accepted = bpf_filter_base_rules(&prefixes, true);
        assert!(accepted.input.iter().any(|r| r.action == Action::Accept
            && r.matches.as_str().contains("-i cord+")));
    }

    #[test]
    fn v6_forward_drops_to_workload_without_dispatch() {
        let prefixes = vec![String::from("cord")];
        let r = bpf_filter_base_rules_v6(&prefixes, false);
        assert!(r.forward.iter().any(|r| r.action == Action::Drop
            && r.matches.as_str().contains("-o cord+")));
        assert!(
            !r.forward
                .iter()
                .any(|r| matches!(&r.action, Action::Jump(t) if t == CHAIN_TO_WL_DISPATCH)),
            "v6 must not dispatch to per-endpoint chains"
        );
    }

    #[test]
    fn service_loop_chain_drops_each_cidr() {
        let cidrs = ["10.96.0.0/12", "10.100.0.0/16"]
            .map(|c| c.parse::<Ipv4Net>().unwrap());
        let chain = service_loop_chain(&cidrs);
        assert_eq!(chain.rules.len(), 2);
        assert!(chain.rules.iter().all(|r| r.action == Action::Drop));
    }
}
