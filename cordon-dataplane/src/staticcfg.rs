//! Start-of-day static chain configuration.
//!
//! Queues the rule skeleton into the table writers before the main
//! loop starts; the actual kernel writes happen on the first apply.

use crate::config::{Config, EndpointToHostAction};
use crate::managers::SharedTable;
use crate::marks::Marks;
use crate::render::{self, Action, Match, Rule};

/// Fast-path mode: the TC programs decide; iptables only honors their
/// marks and polices the gaps (pre-existing flows, detached
/// workloads).
pub fn setup_bpf(
    cfg: &Config,
    marks: &Marks,
    filter: &SharedTable,
    nat: &SharedTable,
    raw: &SharedTable,
) {
    // Only an explicit accept opts workload-to-host traffic in; drop
    // is compiled into the TC programs and return is a no-op here.
    let ep_to_host_accept = cfg.endpoint_to_host_action == EndpointToHostAction::Accept;
    let rules = render::bpf_filter_base_rules(&cfg.workload_iface_prefixes, ep_to_host_accept);
    {
        let mut filter = filter.lock().unwrap();
        filter.insert_or_append_rules("INPUT", rules.input);
        filter.insert_or_append_rules("OUTPUT", rules.output);
        filter.insert_or_append_rules("FORWARD", rules.forward);
    }

    // The postrouting dispatch chain itself belongs to the masq
    // manager; only the jump from the built-in chain is ours.
    {
        let mut nat = nat.lock().unwrap();
        nat.insert_or_append_rules(
            "POSTROUTING",
            vec![Rule::new(
                Match::new(),
                Action::Jump(render::CHAIN_NAT_POSTROUTING.to_string()),
            )],
        );
    }

    {
        let mut raw = raw.lock().unwrap();
        raw.update_chain(render::bpf_rpf_chain());
        if cfg.wireguard_enabled {
            raw.update_chain(render::wireguard_incoming_mark_chain(
                &cfg.wireguard_iface,
                marks.wireguard,
                &cfg.workload_iface_prefixes,
            ));
        }
        raw.update_chain(render::raw_prerouting_chain(cfg.wireguard_enabled));
        raw.insert_or_append_rules(
            "PREROUTING",
            vec![Rule::new(
                Match::new(),
                Action::Jump(render::CHAIN_RAW_PREROUTING.to_string()),
            )],
        );
    }
}

/// IPv6 static chains for fast-path mode. The programs only police
/// IPv4, so the v6 rules stand alone: drop traffic to workloads,
/// police the seen mark from workloads, and keep the RPF chain
/// consistent. No v6 policy or NAT is rendered.
pub fn setup_bpf_v6(cfg: &Config, filter: &SharedTable, raw: &SharedTable) {
    let ep_to_host_accept = cfg.endpoint_to_host_action == EndpointToHostAction::Accept;
    let rules = render::bpf_filter_base_rules_v6(&cfg.workload_iface_prefixes, ep_to_host_accept);
    {
        let mut filter = filter.lock().unwrap();
        filter.insert_or_append_rules("INPUT", rules.input);
        filter.insert_or_append_rules("OUTPUT", rules.output);
        filter.insert_or_append_rules("FORWARD", rules.forward);
    }

    {
        let mut raw = raw.lock().unwrap();
        raw.update_chain(render::bpf_rpf_chain());
        raw.update_chain(render::raw_prerouting_chain(false));
        raw.insert_or_append_rules(
            "PREROUTING",
            vec![Rule::new(
                Match::new(),
                Action::Jump(render::CHAIN_RAW_PREROUTING.to_string()),
            )],
        );
    }
}

/// Legacy mode: iptables does the policing; wire the dispatch chains
/// into the built-in chains.
pub fn setup_legacy(
    cfg: &Config,
    marks: &Marks,
    filter: &SharedTable,
    nat: &SharedTable,
    raw: &SharedTable,
) {
    {
        let mut filter = filter.lock().unwrap();
        let mut forward = Vec::new();
        for prefix in &cfg.workload_iface_prefixes {
            let iface = format!("{prefix}+");
            forward.push(Rule::new(
                Match::new().in_interface(&iface),
                Action::Jump(render::CHAIN_FROM_WL_DISPATCH.to_string()),
            ));
            forward.push(Rule::new(
                Match::new().out_interface(&iface),
                Action::Jump(render::CHAIN_TO_WL_DISPATCH.to_string()),
            ));
        }
        // Accept whatever the dispatch chains marked.
        forward.push(Rule::new(
            Match::new().mark_matches_with_mask(marks.accept, marks.accept),
            Action::Accept,
        ));
        filter.insert_or_append_rules("FORWARD", forward);

        let mut input = vec![Rule::new(
            Match::new().conntrack_state("ESTABLISHED,RELATED"),
            Action::Accept,
        )];
        // Workload-to-host traffic runs the from-workload policy
        // dispatch, then meets the configured default action.
        for prefix in &cfg.workload_iface_prefixes {
            let iface = format!("{prefix}+");
            input.push(Rule::new(
                Match::new().in_interface(&iface),
                Action::Jump(render::CHAIN_FROM_WL_DISPATCH.to_string()),
            ));
            input.push(Rule::new(
                Match::new()
                    .in_interface(&iface)
                    .mark_matches_with_mask(marks.accept, marks.accept),
                Action::Accept,
            ));
            match cfg.endpoint_to_host_action {
                EndpointToHostAction::Drop => {
                    input.push(Rule::commented(
                        Match::new().in_interface(&iface),
                        Action::Drop,
                        "Default endpoint-to-host action",
                    ));
                }
                EndpointToHostAction::Accept => {
                    input.push(Rule::commented(
                        Match::new().in_interface(&iface),
                        Action::Accept,
                        "Default endpoint-to-host action",
                    ));
                }
                EndpointToHostAction::Return => {
                    // Fall through to whatever else is in INPUT.
                }
            }
        }
        filter.insert_or_append_rules("INPUT", input);
    }

    // Dispatch chains belong to the floating-IP and masq managers;
    // only the jumps from the built-in chains are ours.
    {
        let mut nat = nat.lock().unwrap();
        nat.insert_or_append_rules(
            "PREROUTING",
            vec![Rule::new(
                Match::new(),
                Action::Jump(render::CHAIN_NAT_PREROUTING.to_string()),
            )],
        );
        nat.insert_or_append_rules(
            "POSTROUTING",
            vec![Rule::new(
                Match::new(),
                Action::Jump(render::CHAIN_NAT_POSTROUTING.to_string()),
            )],
        );
    }

    {
        let mut raw = raw.lock().unwrap();
        if cfg.wireguard_enabled {
            raw.update_chain(render::wireguard_incoming_mark_chain(
                &cfg.wireguard_iface,
                marks.wireguard,
                &cfg.workload_iface_prefixes,
            ));
        }
        raw.update_chain(render::raw_prerouting_chain(cfg.wireguard_enabled));
        raw.update_chain(render::bpf_rpf_chain());
        raw.insert_or_append_rules(
            "PREROUTING",
            vec![Rule::new(
                Match::new(),
                Action::Jump(render::CHAIN_RAW_PREROUTING.to_string()),
            )],
        );
    }
}
