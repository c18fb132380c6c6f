//! Legacy-path policy rendering: one chain per policy per direction.
//!
//! An allow rule sets the accept mark and returns; the endpoint chain
//! checks the mark after each tier. A pass rule sets the pass mark,
//! which ends the tier without accepting. Deny drops outright.

use crate::proto::{Policy, Rule as ProtoRule, RuleAction, RuleDir};

use super::{chain_name, ip_set_name, Action, Chain, Match, Rule};

/// Marks the policy chains communicate through.
#[derive(Debug, Clone, Copy)]
pub struct PolicyMarks {
    pub accept: u32,
    pub pass: u32,
}

pub fn policy_chain_name(dir: RuleDir, name: &str) -> String {
    match dir {
        RuleDir::Ingress => chain_name("pi", name),
        RuleDir::Egress => chain_name("po", name),
    }
}

pub fn profile_chain_name(dir: RuleDir, name: &str) -> String {
    match dir {
        RuleDir::Ingress => chain_name("qi", name),
        RuleDir::Egress => chain_name("qo", name),
    }
}

/// Render both directions of a policy.
pub fn render_policy(name: &str, policy: &Policy, marks: PolicyMarks) -> Vec<Chain> {
    vec![
        Chain::new(
            policy_chain_name(RuleDir::Ingress, name),
            render_rules(&policy.inbound_rules, marks),
        ),
        Chain::new(
            policy_chain_name(RuleDir::Egress, name),
            render_rules(&policy.outbound_rules, marks),
        ),
    ]
}

/// Render both directions of a profile.
pub fn render_profile(name: &str, profile: &Policy, marks: PolicyMarks) -> Vec<Chain> {
    vec![
        Chain::new(
            profile_chain_name(RuleDir::Ingress, name),
            render_rules(&profile.inbound_rules, marks),
        ),
        Chain::new(
            profile_chain_name(RuleDir::Egress, name),
            render_rules(&profile.outbound_rules, marks),
        ),
    ]
}

fn render_rules(rules: &[ProtoRule], marks: PolicyMarks) -> Vec<Rule> {
    let mut out = Vec::with_capacity(rules.len() * 2);
    for rule in rules {
        let matches = rule_match(rule);
        match rule.action.unwrap_or(RuleAction::Allow) {
            RuleAction::Allow => {
                out.push(Rule::new(
                    matches,
                    Action::SetMark {
                        mark: marks.accept,
                        mask: marks.accept,
                    },
                ));
                out.push(Rule::new(
                    Match::new().mark_matches_with_mask(marks.accept, marks.accept),
                    Action::Return,
                ));
            }
            RuleAction::Deny => {
                out.push(Rule::new(matches, Action::Drop));
            }
            RuleAction::Pass => {
                out.push(Rule::new(
                    matches,
                    Action::SetMark {
                        mark: marks.pass,
                        mask: marks.pass,
                    },
                ));
                out.push(Rule::new(
                    Match::new().mark_matches_with_mask(marks.pass, marks.pass),
                    Action::Return,
                ));
            }
            RuleAction::Log => {
                out.push(Rule::new(
                    matches,
                    Action::Log {
                        prefix: String::from("cordon-packet"),
                    },
                ));
            }
        }
    }
    out
}

fn rule_match(rule: &ProtoRule) -> Match {
    let mut m = Match::new();
    if let Some(proto) = rule.protocol {
        m = m.protocol(proto);
    }
    if let Some(net) = &rule.src_net {
        m = m.src_net(net);
    }
    if let Some(net) = &rule.dst_net {
        m = m.dst_net(net);
    }
    m = m.src_ports(&rule.src_ports);
    m = m.dst_ports(&rule.dst_ports);
    for id in &rule.src_ip_set_ids {
        m = m.ip_set_src(&ip_set_name(id));
    }
    for id in &rule.dst_ip_set_ids {
        m = m.ip_set_dst(&ip_set_name(id));
    }
    for id in &rule.not_src_ip_set_ids {
        m = m.not_ip_set_src(&ip_set_name(id));
    }
    for id in &rule.not_dst_ip_set_ids {
        m = m.not_ip_set_dst(&ip_set_name(id));
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::RuleAction;

    const MARKS: PolicyMarks = PolicyMarks {
        accept: 0x10000,
        pass: 0x20000,
    };

    fn allow_tcp_8080() -> ProtoRule {
        ProtoRule {
            action: Some(RuleAction::Allow),
            protocol: Some(6),
            dst_ports: vec![(8080, 8080)],
            ..Default::default()
        }
    }

    #[test]
    fn rendering_is_deterministic() {
        let policy = Policy {
            inbound_rules: vec![allow_tcp_8080()],
            ..Default::default()
        };
        let a = render_policy("web", &policy, MARKS);
        let b = render_policy("web", &policy, MARKS);
        assert_eq!(a, b);
        let ha: Vec<_> = a.iter().map(Chain::rule_hashes).collect();
        let hb: Vec<_> = b.iter().map(Chain::rule_hashes).collect();
        assert_eq!(ha, hb);
    }

    #[test]
    fn allow_renders_mark_then_return() {
        let policy = Policy {
            inbound_rules: vec![allow_tcp_8080()],
            ..Default::default()
        };
        let chains = render_policy("web", &policy, MARKS);
        let rules = &chains[0].rules;
        assert_eq!(rules.len(), 2);
        assert!(matches!(rules[0].action, Action::SetMark { .. }));
        assert_eq!(rules[1].action, Action::Return);
    }

    #[test]
    fn set_references_render_via_set_names() {
        let rule = ProtoRule {
            action: Some(RuleAction::Deny),
            src_ip_set_ids: vec![String::from("blocklist")],
            ..Default::default()
        };
        let policy = Policy {
            inbound_rules: vec![rule],
            ..Default::default()
        };
        let chains = render_policy("deny-bad", &policy, MARKS);
        let line = chains[0].rules[0].matches.as_str().to_string();
        assert!(line.contains("--match-set cord-s-blocklist src"), "{line}");
    }

    #[test]
    fn ingress_and_egress_chain_names_differ() {
        assert_ne!(
            policy_chain_name(RuleDir::Ingress, "p"),
            policy_chain_name(RuleDir::Egress, "p")
        );
    }
}
