//! Program-attachment manager (fast-path mode).
//!
//! For every bound workload interface and every matched host data
//! interface, ensures the TC programs are attached at ingress and
//! egress with the right load-time parameterization, flattens the
//! endpoint's tiers into the policy rules map and swaps the policy
//! program into the attachment's jump slot.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use aya::maps::{Array, HashMap as AyaHashMap, MapData};
use tracing::{debug, info, warn};

use cordon_common::policy::{
    PolicyConfig, PolicyRule, RULE_ACTION_ALLOW, RULE_ACTION_DENY, RULE_ACTION_PASS,
    RULE_MATCH_DST_NET, RULE_MATCH_DST_PORTS, RULE_MATCH_DST_SET, RULE_MATCH_NOT_DST_SET,
    RULE_MATCH_NOT_SRC_SET, RULE_MATCH_PROTOCOL, RULE_MATCH_SRC_NET, RULE_MATCH_SRC_PORTS,
    RULE_MATCH_SRC_SET,
};

use crate::attach::{Attacher, Hook};
use crate::maps::{open_pinned, IpSetIdAllocator, MapError, MAP_POLICY_CFG, MAP_POLICY_RULES};
use crate::proto::{
    EndpointBinding, EndpointId, IfaceState, Policy, Rule as ProtoRule, RuleAction, Update,
    WorkloadEndpoint,
};

use super::{DataplaneManager, Result};

/// A contiguous block in the rules map.
#[derive(Debug, Clone, Copy)]
struct RuleBlock {
    start: u32,
    len: u32,
}

/// Bump-plus-free-list allocator over the rules map.
struct BlockAllocator {
    next: u32,
    free: Vec<RuleBlock>,
    limit: u32,
}

impl BlockAllocator {
    fn new(limit: u32) -> Self {
        Self {
            next: 0,
            free: Vec::new(),
            limit,
        }
    }

    fn alloc(&mut self, len: u32) -> Option<RuleBlock> {
        if len == 0 {
            return Some(RuleBlock { start: 0, len: 0 });
        }
        if let Some(pos) = self.free.iter().position(|b| b.len >= len) {
            let block = self.free.swap_remove(pos);
            if block.len > len {
                self.free.push(RuleBlock {
                    start: block.start + len,
                    len: block.len - len,
                });
            }
            return Some(RuleBlock {
                start: block.start,
                len,
            });
        }
        if self.next + len > self.limit {
            return None;
        }
        let block = RuleBlock {
            start: self.next,
            len,
        };
        self.next += len;
        Some(block)
    }

    fn free(&mut self, block: RuleBlock) {
        if block.len > 0 {
            self.free.push(block);
        }
    }
}

pub struct ProgramAttachManager {
    attacher: Attacher,
    rules_map: Array<MapData, PolicyRule>,
    cfg_map: AyaHashMap<MapData, u32, PolicyConfig>,
    alloc: BlockAllocator,
    set_ids: Arc<Mutex<IpSetIdAllocator>>,
    data_iface_prefixes: Vec<String>,

    endpoints: BTreeMap<EndpointId, Arc<WorkloadEndpoint>>,
    policies: BTreeMap<String, Arc<Policy>>,
    profiles: BTreeMap<String, Arc<Policy>>,
    bindings: HashMap<EndpointId, EndpointBinding>,
    /// Host data interfaces and their oper state.
    data_ifaces: HashMap<String, bool>,

    dirty_endpoints: HashSet<EndpointId>,
    dirty_ifaces: HashSet<String>,
    /// Attachment -> programmed rule blocks (ingress hook, egress
    /// hook order is by jump base key).
    blocks: HashMap<u32, RuleBlock>,
    /// A full re-attach/reprogram pass was requested.
    resync_queued: bool,
}

impl ProgramAttachManager {
    pub fn new(
        attacher: Attacher,
        pin_dir: &Path,
        set_ids: Arc<Mutex<IpSetIdAllocator>>,
        data_iface_prefixes: Vec<String>,
    ) -> std::result::Result<Self, MapError> {
        let rules_map = Array::try_from(open_pinned(pin_dir, MAP_POLICY_RULES)?)
            .map_err(|_| MapError::WrongType {
                name: MAP_POLICY_RULES,
            })?;
        let cfg_map = AyaHashMap::try_from(open_pinned(pin_dir, MAP_POLICY_CFG)?)
            .map_err(|_| MapError::WrongType {
                name: MAP_POLICY_CFG,
            })?;
        Ok(Self {
            attacher,
            rules_map,
            cfg_map,
            alloc: BlockAllocator::new(cordon_common::policy::POLICY_RULES_MAX),
            set_ids,
            data_iface_prefixes,
            endpoints: BTreeMap::new(),
            policies: BTreeMap::new(),
            profiles: BTreeMap::new(),
            bindings: HashMap::new(),
            data_ifaces: HashMap::new(),
            dirty_endpoints: HashSet::new(),
            dirty_ifaces: HashSet::new(),
            blocks: HashMap::new(),
            resync_queued: false,
        })
    }

    fn is_data_iface(&self, name: &str) -> bool {
        self.data_iface_prefixes
            .iter()
            .any(|p| name.starts_with(p.as_str()))
    }

    /// Everything gets reprogrammed on the next apply.
    pub fn queue_resync(&mut self) {
        self.resync_queued = true;
    }

    fn mark_all_dirty(&mut self) {
        let ids: Vec<EndpointId> = self.bindings.keys().cloned().collect();
        self.dirty_endpoints.extend(ids);
        let ifaces: Vec<String> = self.data_ifaces.keys().cloned().collect();
        self.dirty_ifaces.extend(ifaces);
    }

    /// Endpoints referencing a policy/profile need their blocks
    /// rebuilt when it changes.
    fn dirty_referencing(&mut self, name: &str, profile: bool) {
        let affected: Vec<EndpointId> = self
            .endpoints
            .iter()
            .filter(|(_, ep)| {
                if profile {
                    ep.profile_ids.iter().any(|p| p == name)
                } else {
                    ep.tiers_ingress
                        .iter()
                        .chain(ep.tiers_egress.iter())
                        .any(|t| t.policies.iter().any(|p| p == name))
                }
            })
            .map(|(id, _)| id.clone())
            .collect();
        self.dirty_endpoints.extend(affected);
    }

    /// Flatten one direction of an endpoint's policy stack.
    fn flatten(&self, ep: &WorkloadEndpoint, ingress: bool) -> Vec<PolicyRule> {
        let tiers = if ingress {
            &ep.tiers_ingress
        } else {
            &ep.tiers_egress
        };
        let mut rules = Vec::new();
        for tier in tiers {
            let tier_start = rules.len();
            for policy_name in &tier.policies {
                let Some(policy) = self.policies.get(policy_name) else {
                    warn!(policy = %policy_name, "endpoint references unknown policy");
                    continue;
                };
                let dir_rules = if ingress {
                    &policy.inbound_rules
                } else {
                    &policy.outbound_rules
                };
                for rule in dir_rules {
                    rules.extend(self.flatten_rule(rule));
                }
            }
            // Fix up PASS targets now that the tier's extent is known.
            let tier_end = rules.len() as u32;
            for rule in &mut rules[tier_start..] {
                if rule.action == RULE_ACTION_PASS {
                    rule.tier_end = tier_end;
                }
            }
        }
        for profile_name in &ep.profile_ids {
            let Some(profile) = self.profiles.get(profile_name) else {
                continue;
            };
            let dir_rules = if ingress {
                &profile.inbound_rules
            } else {
                &profile.outbound_rules
            };
            for rule in dir_rules {
                rules.extend(self.flatten_rule(rule));
            }
        }
        rules
    }

    /// One proto rule becomes one kernel rule per port-range
    /// combination (the kernel rule holds a single range each way).
    fn flatten_rule(&self, rule: &ProtoRule) -> Vec<PolicyRule> {
        let mut base = PolicyRule {
            action: match rule.action.unwrap_or(RuleAction::Allow) {
                RuleAction::Allow | RuleAction::Log => RULE_ACTION_ALLOW,
                RuleAction::Deny => RULE_ACTION_DENY,
                RuleAction::Pass => RULE_ACTION_PASS,
            },
            ..Default::default()
        };
        if let Some(proto) = rule.protocol {
            base.protocol = proto;
            base.match_flags |= RULE_MATCH_PROTOCOL;
        }
        if let Some(net) = &rule.src_net {
            base.src_addr = net.addr().octets();
            base.src_prefix_len = net.prefix_len();
            base.match_flags |= RULE_MATCH_SRC_NET;
        }
        if let Some(net) = &rule.dst_net {
            base.dst_addr = net.addr().octets();
            base.dst_prefix_len = net.prefix_len();
            base.match_flags |= RULE_MATCH_DST_NET;
        }
        {
            let mut ids = self.set_ids.lock().unwrap();
            if let Some(id) = rule.src_ip_set_ids.first() {
                base.src_set_id = ids.get_or_alloc(id);
                base.match_flags |= RULE_MATCH_SRC_SET;
            } else if let Some(id) = rule.not_src_ip_set_ids.first() {
                base.src_set_id = ids.get_or_alloc(id);
                base.match_flags |= RULE_MATCH_NOT_SRC_SET;
            }
            if let Some(id) = rule.dst_ip_set_ids.first() {
                base.dst_set_id = ids.get_or_alloc(id);
                base.match_flags |= RULE_MATCH_DST_SET;
            } else if let Some(id) = rule.not_dst_ip_set_ids.first() {
                base.dst_set_id = ids.get_or_alloc(id);
                base.match_flags |= RULE_MATCH_NOT_DST_SET;
            }
        }

        let src_ranges: Vec<Option<(u16, u16)>> = if rule.src_ports.is_empty() {
            vec![None]
        } else {
            rule.src_ports.iter().map(|r| Some(*r)).collect()
        };
        let dst_ranges: Vec<Option<(u16, u16)>> = if rule.dst_ports.is_empty() {
            vec![None]
        } else {
            rule.dst_ports.iter().map(|r| Some(*r)).collect()
        };

        let mut out = Vec::with_capacity(src_ranges.len() * dst_ranges.len());
        for src in &src_ranges {
            for dst in &dst_ranges {
                let mut r = base;
                if let Some((lo, hi)) = src {
                    r.src_port_start = *lo;
                    r.src_port_end = *hi;
                    r.match_flags |= RULE_MATCH_SRC_PORTS;
                }
                if let Some((lo, hi)) = dst {
                    r.dst_port_start = *lo;
                    r.dst_port_end = *hi;
                    r.match_flags |= RULE_MATCH_DST_PORTS;
                }
                out.push(r);
            }
        }
        out
    }

    /// Write an attachment's rule block and swap its config in.
    fn program_rules(
        &mut self,
        jump_base: u32,
        rules: &[PolicyRule],
        no_match_action: u8,
    ) -> Result<()> {
        let block = self
            .alloc
            .alloc(rules.len() as u32)
            .ok_or(MapError::Exhausted {
                name: MAP_POLICY_RULES,
            })?;
        for (i, rule) in rules.iter().enumerate() {
            let mut rule = *rule;
            if rule.action == RULE_ACTION_PASS {
                // Tier ends were computed relative to the block.
                rule.tier_end += block.start;
            }
            self.rules_map
                .set(block.start + i as u32, rule, 0)
                .map_err(|source| MapError::Op {
                    name: MAP_POLICY_RULES,
                    source,
                })?;
        }
        let cfg = PolicyConfig {
            start: block.start,
            count: block.len,
            no_match_action,
            _pad: [0; 7],
        };
        self.cfg_map
            .insert(jump_base, cfg, 0)
            .map_err(|source| MapError::Op {
                name: MAP_POLICY_CFG,
                source,
            })?;
        // The old block is unreferenced now that the config points at
        // the new one.
        if let Some(old) = self.blocks.insert(jump_base, block) {
            self.alloc.free(old);
        }
        Ok(())
    }

    fn detach_iface(&mut self, iface: &str) {
        for hook in [Hook::Ingress, Hook::Egress] {
            if let Some(jump_base) = self.attacher.jump_base(iface, hook) {
                let _ = self.cfg_map.remove(&jump_base);
                if let Some(block) = self.blocks.remove(&jump_base) {
                    self.alloc.free(block);
                }
            }
        }
        self.attacher.detach(iface);
    }
}

impl DataplaneManager for ProgramAttachManager {
    fn on_update(&mut self, update: &Update) {
        match update {
            Update::WorkloadEndpoint { id, endpoint } => {
                self.endpoints.insert(id.clone(), endpoint.clone());
                self.dirty_endpoints.insert(id.clone());
            }
            Update::WorkloadEndpointRemove { id } => {
                self.endpoints.remove(id);
            }
            Update::ActivePolicy { name, policy } => {
                if self.policies.insert(name.clone(), policy.clone()) != Some(policy.clone()) {
                    self.dirty_referencing(name, false);
                }
            }
            Update::ActivePolicyRemove { name } => {
                self.policies.remove(name);
                self.dirty_referencing(name, false);
            }
            Update::ActiveProfile { name, profile } => {
                if self.profiles.insert(name.clone(), profile.clone()) != Some(profile.clone()) {
                    self.dirty_referencing(name, true);
                }
            }
            Update::ActiveProfileRemove { name } => {
                self.profiles.remove(name);
                self.dirty_referencing(name, true);
            }
            Update::EndpointBindings { bindings } => {
                for binding in bindings {
                    if binding.oper_up {
                        self.bindings.insert(binding.id.clone(), binding.clone());
                        self.dirty_endpoints.insert(binding.id.clone());
                    } else if let Some(old) = self.bindings.remove(&binding.id) {
                        self.dirty_ifaces.insert(old.iface);
                    }
                }
            }
            Update::IfaceUpdate { name, state, .. } => {
                if self.is_data_iface(name) {
                    let up = *state == IfaceState::Up;
                    if self.data_ifaces.insert(name.clone(), up) != Some(up) {
                        self.dirty_ifaces.insert(name.clone());
                    }
                }
            }
            _ => {}
        }
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        if self.resync_queued {
            self.mark_all_dirty();
            self.resync_queued = false;
        }

        // Workload attachments follow the endpoint bindings.
        let dirty: Vec<EndpointId> = self.dirty_endpoints.drain().collect();
        for id in dirty {
            let Some(binding) = self.bindings.get(&id).cloned() else {
                continue;
            };
            let Some(ep) = self.endpoints.get(&id).cloned() else {
                continue;
            };

            let ingress_base = self.attacher.attach(&binding.iface, true, Hook::Ingress)?;
            let egress_base = self.attacher.attach(&binding.iface, true, Hook::Egress)?;

            // The ingress hook (from-workload) applies the egress
            // tiers; the egress hook (to-workload) the ingress tiers.
            let from_rules = self.flatten(&ep, false);
            let to_rules = self.flatten(&ep, true);
            self.program_rules(ingress_base, &from_rules, RULE_ACTION_DENY)?;
            self.program_rules(egress_base, &to_rules, RULE_ACTION_DENY)?;
            self.attacher
                .install_policy_program(&binding.iface, Hook::Ingress)?;
            self.attacher
                .install_policy_program(&binding.iface, Hook::Egress)?;
            info!(endpoint = %id, iface = %binding.iface, "fast path programmed");
        }

        // Host data interfaces: attach with host-endpoint defaults
        // (allow); detach interfaces that went away.
        let dirty_ifaces: Vec<String> = self.dirty_ifaces.drain().collect();
        for iface in dirty_ifaces {
            let bound = self.bindings.values().any(|b| b.iface == iface);
            let data_up = self.data_ifaces.get(&iface).copied().unwrap_or(false);
            if bound {
                continue;
            }
            if data_up {
                self.attacher.attach(&iface, false, Hook::Ingress)?;
                self.attacher.attach(&iface, false, Hook::Egress)?;
                debug!(iface, "host interface programs attached");
            } else {
                self.detach_iface(&iface);
            }
        }
        Ok(())
    }
}
