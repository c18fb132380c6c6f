//! Policy manager (legacy path).
//!
//! Renders tier/policy/profile chains into the filter table. The
//! hash-stable chain names mean an update to one policy rewrites only
//! that policy's chains; the per-endpoint dispatch is the endpoint
//! manager's business.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::proto::{Policy, RuleDir, Update};
use crate::render::{self, PolicyMarks};

use super::{DataplaneManager, Result, SharedTable};

pub struct PolicyManager {
    filter_table: SharedTable,
    marks: PolicyMarks,
    policies: BTreeMap<String, Arc<Policy>>,
    profiles: BTreeMap<String, Arc<Policy>>,
    dirty_policies: HashSet<String>,
    dirty_profiles: HashSet<String>,
    removed_chains: Vec<String>,
}

impl PolicyManager {
    pub fn new(filter_table: SharedTable, marks: PolicyMarks) -> Self {
        Self {
            filter_table,
            marks,
            policies: BTreeMap::new(),
            profiles: BTreeMap::new(),
            dirty_policies: HashSet::new(),
            dirty_profiles: HashSet::new(),
            removed_chains: Vec::new(),
        }
    }
}

impl DataplaneManager for PolicyManager {
    fn on_update(&mut self, update: &Update) {
        match update {
            Update::ActivePolicy { name, policy } => {
                if self.policies.insert(name.clone(), policy.clone()) != Some(policy.clone()) {
                    self.dirty_policies.insert(name.clone());
                }
            }
            Update::ActivePolicyRemove { name } => {
                if self.policies.remove(name).is_some() {
                    self.dirty_policies.remove(name);
                    for dir in [RuleDir::Ingress, RuleDir::Egress] {
                        self.removed_chains.push(render::policy_chain_name(dir, name));
                    }
                }
            }
            Update::ActiveProfile { name, profile } => {
                if self.profiles.insert(name.clone(), profile.clone()) != Some(profile.clone()) {
                    self.dirty_profiles.insert(name.clone());
                }
            }
            Update::ActiveProfileRemove { name } => {
                if self.profiles.remove(name).is_some() {
                    self.dirty_profiles.remove(name);
                    for dir in [RuleDir::Ingress, RuleDir::Egress] {
                        self.removed_chains
                            .push(render::profile_chain_name(dir, name));
                    }
                }
            }
            _ => {}
        }
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        let mut table = self.filter_table.lock().unwrap();
        for name in self.dirty_policies.drain() {
            if let Some(policy) = self.policies.get(&name) {
                table.update_chains(render::render_policy(&name, policy, self.marks));
            }
        }
        for name in self.dirty_profiles.drain() {
            if let Some(profile) = self.profiles.get(&name) {
                table.update_chains(render::render_profile(&name, profile, self.marks));
            }
        }
        table.remove_chains(self.removed_chains.drain(..));
        Ok(())
    }
}
