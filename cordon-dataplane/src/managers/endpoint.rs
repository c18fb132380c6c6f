//! Endpoint manager.
//!
//! Owns everything keyed by workload endpoint: the per-endpoint
//! filter chains and dispatch, the endpoint mark bits, the /32 routes
//! to each workload interface, the kernel route map (fast-path mode)
//! and the endpoint status reports. Dataplane programming for an
//! endpoint must outlive any rule that references it, so chain
//! removal happens in the same batch that rewrites the dispatch.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::{debug, info, warn};

use cordon_common::routes::{RouteValue, RT_IN_POOL, RT_LOCAL_HOST, RT_NAT_OUT, RT_REMOTE_HOST};

use crate::marks::EndpointMarkAllocator;
use crate::maps::RouteMap;
use crate::proto::{
    EndpointBinding, EndpointId, EndpointStatus, IfaceState, RuleDir, Status, Update,
    WorkloadEndpoint,
};
use crate::render::{
    self, Action, Chain, Match, Rule, CHAIN_FROM_WL_DISPATCH, CHAIN_TO_WL_DISPATCH,
};
use crate::routetable::{RouteTable, Target};

use super::{DataplaneManager, Result, SharedTable};

/// Marks the rendered chains use (legacy path).
#[derive(Debug, Clone, Copy)]
pub struct EndpointMarks {
    pub accept: u32,
    pub pass: u32,
    pub endpoint_block: u32,
}

pub struct EndpointManager {
    filter_table: SharedTable,
    route_table: RouteTable,
    /// Fast-path route map; absent in legacy mode.
    route_map: Option<RouteMap>,
    bpf_enabled: bool,
    hostname: String,
    marks: EndpointMarks,
    mark_alloc: EndpointMarkAllocator,

    endpoints: BTreeMap<EndpointId, std::sync::Arc<WorkloadEndpoint>>,
    ep_marks: HashMap<EndpointId, u32>,
    iface_states: HashMap<String, (IfaceState, u32)>,
    /// Last published binding per endpoint.
    bindings: HashMap<EndpointId, EndpointBinding>,

    dirty_endpoints: HashSet<EndpointId>,
    /// Endpoints removed since last apply, with their old interface.
    removed: HashMap<EndpointId, String>,
    dispatch_dirty: bool,

    /// Hosts/pools/remote blocks feeding the route map.
    hosts: BTreeMap<String, Ipv4Addr>,
    pools: BTreeMap<Ipv4Net, bool>,
    remote_blocks: BTreeMap<Ipv4Net, Ipv4Addr>,
    route_map_dirty: bool,

    statuses: HashMap<EndpointId, EndpointStatus>,
    pending_status: Vec<Status>,
}

impl EndpointManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        filter_table: SharedTable,
        route_table: RouteTable,
        route_map: Option<RouteMap>,
        bpf_enabled: bool,
        hostname: String,
        marks: EndpointMarks,
    ) -> Self {
        Self {
            filter_table,
            route_table,
            route_map,
            bpf_enabled,
            hostname,
            mark_alloc: EndpointMarkAllocator::new(marks.endpoint_block),
            marks,
            endpoints: BTreeMap::new(),
            ep_marks: HashMap::new(),
            iface_states: HashMap::new(),
            bindings: HashMap::new(),
            dirty_endpoints: HashSet::new(),
            removed: HashMap::new(),
            // The dispatch chains must exist before any base rule
            // jumps to them.
            dispatch_dirty: true,
            hosts: BTreeMap::new(),
            pools: BTreeMap::new(),
            remote_blocks: BTreeMap::new(),
            route_map_dirty: true,
            statuses: HashMap::new(),
            pending_status: Vec::new(),
        }
    }

    fn iface_oper_up(&self, iface: &str) -> bool {
        matches!(self.iface_states.get(iface), Some((IfaceState::Up, _)))
    }

    fn iface_index(&self, iface: &str) -> u32 {
        self.iface_states.get(iface).map(|(_, i)| *i).unwrap_or(0)
    }

    /// The chain protecting traffic into the workload.
    fn to_wl_chain(&self, id: &EndpointId, ep: &WorkloadEndpoint) -> Chain {
        let name = render::endpoint_to_wl_chain_name(&id.workload_id);
        if !ep.admin_up {
            return Chain::new(
                name,
                vec![Rule::commented(
                    Match::new(),
                    Action::Drop,
                    "Endpoint admin down",
                )],
            );
        }
        if self.bpf_enabled {
            // The TC program is the enforcement point; reaching this
            // chain means the program vouched for the packet.
            return Chain::new(name, vec![Rule::new(Match::new(), Action::Accept)]);
        }
        let mut rules = Vec::new();
        for tier in &ep.tiers_ingress {
            for policy in &tier.policies {
                rules.push(Rule::new(
                    Match::new(),
                    Action::Jump(render::policy_chain_name(RuleDir::Ingress, policy)),
                ));
                rules.push(Rule::new(
                    Match::new().mark_matches_with_mask(self.marks.accept, self.marks.accept),
                    Action::Return,
                ));
            }
        }
        for profile in &ep.profile_ids {
            rules.push(Rule::new(
                Match::new(),
                Action::Jump(render::profile_chain_name(RuleDir::Ingress, profile)),
            ));
            rules.push(Rule::new(
                Match::new().mark_matches_with_mask(self.marks.accept, self.marks.accept),
                Action::Return,
            ));
        }
        rules.push(Rule::commented(
            Match::new(),
            Action::Drop,
            "No policy matched",
        ));
        Chain::new(name, rules)
    }

    /// The chain policing traffic from the workload; also stamps the
    /// endpoint mark.
    fn from_wl_chain(&self, id: &EndpointId, ep: &WorkloadEndpoint) -> Chain {
        let name = render::endpoint_from_wl_chain_name(&id.workload_id);
        let mut rules = Vec::new();
        if let Some(mark) = self.ep_marks.get(id) {
            rules.push(Rule::new(
                Match::new(),
                Action::SetMark {
                    mark: *mark,
                    mask: self.marks.endpoint_block,
                },
            ));
        }
        if !ep.admin_up {
            rules.push(Rule::commented(
                Match::new(),
                Action::Drop,
                "Endpoint admin down",
            ));
            return Chain::new(name, rules);
        }
        if self.bpf_enabled {
            rules.push(Rule::new(Match::new(), Action::Accept));
            return Chain::new(name, rules);
        }
        for tier in &ep.tiers_egress {
            for policy in &tier.policies {
                rules.push(Rule::new(
                    Match::new(),
                    Action::Jump(render::policy_chain_name(RuleDir::Egress, policy)),
                ));
                rules.push(Rule::new(
                    Match::new().mark_matches_with_mask(self.marks.accept, self.marks.accept),
                    Action::Return,
                ));
            }
        }
        for profile in &ep.profile_ids {
            rules.push(Rule::new(
                Match::new(),
                Action::Jump(render::profile_chain_name(RuleDir::Egress, profile)),
            ));
            rules.push(Rule::new(
                Match::new().mark_matches_with_mask(self.marks.accept, self.marks.accept),
                Action::Return,
            ));
        }
        rules.push(Rule::commented(
            Match::new(),
            Action::Drop,
            "No policy matched",
        ));
        Chain::new(name, rules)
    }

    fn dispatch_chains(&self) -> (Chain, Chain) {
        let mut to_rules = Vec::new();
        let mut from_rules = Vec::new();
        for (id, ep) in &self.endpoints {
            to_rules.push(Rule::new(
                Match::new().out_interface(&ep.iface_name),
                Action::Goto(render::endpoint_to_wl_chain_name(&id.workload_id)),
            ));
            from_rules.push(Rule::new(
                Match::new().in_interface(&ep.iface_name),
                Action::Goto(render::endpoint_from_wl_chain_name(&id.workload_id)),
            ));
        }
        to_rules.push(Rule::commented(
            Match::new(),
            Action::Drop,
            "Unknown workload interface",
        ));
        from_rules.push(Rule::commented(
            Match::new(),
            Action::Drop,
            "Unknown workload interface",
        ));
        (
            Chain::new(CHAIN_TO_WL_DISPATCH, to_rules),
            Chain::new(CHAIN_FROM_WL_DISPATCH, from_rules),
        )
    }

    fn publish_status(&mut self, id: &EndpointId, status: Option<EndpointStatus>) {
        let changed = match status {
            Some(s) => self.statuses.insert(id.clone(), s) != Some(s),
            None => self.statuses.remove(id).is_some(),
        };
        if changed {
            self.pending_status.push(Status::Endpoint {
                id: id.clone(),
                status,
            });
        }
    }

    fn rebuild_route_map(&mut self) -> Result<()> {
        let Some(route_map) = self.route_map.as_mut() else {
            return Ok(());
        };

        // Hosts.
        let hostname = self.hostname.clone();
        for (name, addr) in &self.hosts {
            let Ok(net) = Ipv4Net::new(*addr, 32) else {
                continue;
            };
            let flags = if *name == hostname {
                RT_LOCAL_HOST
            } else {
                RT_REMOTE_HOST
            };
            route_map.upsert(net, RouteValue::new(flags))?;
        }

        // Pools.
        for (cidr, masq) in &self.pools {
            let mut flags = RT_IN_POOL;
            if *masq {
                flags |= RT_NAT_OUT;
            }
            route_map.upsert(*cidr, RouteValue::new(flags))?;
        }

        // Remote workload blocks.
        for (cidr, node) in &self.remote_blocks {
            let mut value = RouteValue::remote_workload(node.octets());
            value.flags |= RT_IN_POOL;
            route_map.upsert(*cidr, value)?;
        }

        // Local workloads, with NAT-outgoing inherited from the
        // covering pool.
        for ep in self.endpoints.values() {
            let ifindex = self
                .iface_states
                .get(&ep.iface_name)
                .map(|(_, i)| *i)
                .unwrap_or(0);
            if ifindex == 0 {
                continue;
            }
            for addr in &ep.addrs {
                let mut value = RouteValue::local_workload(ifindex);
                for (pool, masq) in &self.pools {
                    if pool.contains(&addr.addr()) {
                        value.flags |= RT_IN_POOL;
                        if *masq {
                            value.flags |= RT_NAT_OUT;
                        }
                    }
                }
                route_map.upsert(*addr, value)?;
            }
        }
        Ok(())
    }
}

impl DataplaneManager for EndpointManager {
    fn on_update(&mut self, update: &Update) {
        match update {
            Update::WorkloadEndpoint { id, endpoint } => {
                if let Some(old) = self.endpoints.insert(id.clone(), endpoint.clone()) {
                    if old.iface_name != endpoint.iface_name {
                        self.route_table
                            .on_iface_gone(self.iface_index(&old.iface_name));
                    }
                } else {
                    match self.mark_alloc.allocate() {
                        Some(mark) => {
                            self.ep_marks.insert(id.clone(), mark);
                        }
                        None => {
                            warn!(endpoint = %id, "out of endpoint mark bits, endpoint unmarked");
                        }
                    }
                }
                self.dirty_endpoints.insert(id.clone());
                self.dispatch_dirty = true;
                self.route_map_dirty = true;
            }
            Update::WorkloadEndpointRemove { id } => {
                if let Some(ep) = self.endpoints.remove(id) {
                    self.removed.insert(id.clone(), ep.iface_name.clone());
                    self.dirty_endpoints.remove(id);
                    if let Some(mark) = self.ep_marks.remove(id) {
                        self.mark_alloc.release(mark);
                    }
                    self.dispatch_dirty = true;
                    self.route_map_dirty = true;
                }
            }
            Update::IfaceUpdate {
                name,
                state,
                ifindex,
            } => {
                let prev = self.iface_states.insert(name.clone(), (*state, *ifindex));
                if prev != Some((*state, *ifindex)) {
                    // Endpoints bound to this interface need a status
                    // and binding refresh.
                    let affected: Vec<EndpointId> = self
                        .endpoints
                        .iter()
                        .filter(|(_, ep)| ep.iface_name == *name)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for id in affected {
                        self.dirty_endpoints.insert(id);
                    }
                    self.route_map_dirty = true;
                }
            }
            Update::HostMetadata { hostname, addr } => {
                if self.hosts.insert(hostname.clone(), *addr) != Some(*addr) {
                    self.route_map_dirty = true;
                }
            }
            Update::HostMetadataRemove { hostname } => {
                if let Some(addr) = self.hosts.remove(hostname) {
                    if let (Some(route_map), Ok(net)) =
                        (self.route_map.as_mut(), Ipv4Net::new(addr, 32))
                    {
                        let _ = route_map.remove(&net);
                    }
                }
            }
            Update::IpPool { cidr, masquerade } => {
                if self.pools.insert(*cidr, *masquerade) != Some(*masquerade) {
                    self.route_map_dirty = true;
                }
            }
            Update::IpPoolRemove { cidr } => {
                if self.pools.remove(cidr).is_some() {
                    if let Some(route_map) = self.route_map.as_mut() {
                        let _ = route_map.remove(cidr);
                    }
                    self.route_map_dirty = true;
                }
            }
            Update::RemoteRoute { cidr, node } => {
                if self.remote_blocks.insert(*cidr, *node) != Some(*node) {
                    self.route_map_dirty = true;
                }
            }
            Update::RemoteRouteRemove { cidr } => {
                if self.remote_blocks.remove(cidr).is_some() {
                    if let Some(route_map) = self.route_map.as_mut() {
                        let _ = route_map.remove(cidr);
                    }
                }
            }
            _ => {}
        }
    }

    /// Recompute endpoint/interface bindings and publish the changes
    /// so the program-attachment manager can act on them in the same
    /// apply.
    fn resolve_update_batch(&mut self) -> Result<Vec<Update>> {
        let mut changed = Vec::new();
        for id in &self.dirty_endpoints {
            let Some(ep) = self.endpoints.get(id) else {
                continue;
            };
            let binding = EndpointBinding {
                id: id.clone(),
                iface: ep.iface_name.clone(),
                ifindex: self.iface_index(&ep.iface_name),
                admin_up: ep.admin_up,
                oper_up: self.iface_oper_up(&ep.iface_name),
            };
            if self.bindings.get(id) != Some(&binding) {
                self.bindings.insert(id.clone(), binding.clone());
                changed.push(binding);
            }
        }
        // Removed endpoints are published as down bindings so the
        // program-attachment manager detaches in the same apply.
        for (id, iface) in &self.removed {
            if self.bindings.remove(id).is_some() {
                changed.push(EndpointBinding {
                    id: id.clone(),
                    iface: iface.clone(),
                    ifindex: 0,
                    admin_up: false,
                    oper_up: false,
                });
            }
        }

        if changed.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Update::EndpointBindings { bindings: changed }])
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        // Removed endpoints: drop chains, routes and status.
        let removed: Vec<(EndpointId, String)> = self.removed.drain().collect();
        for (id, iface) in removed {
            let mut table = self.filter_table.lock().unwrap();
            table.remove_chain_by_name(&render::endpoint_to_wl_chain_name(&id.workload_id));
            table.remove_chain_by_name(&render::endpoint_from_wl_chain_name(&id.workload_id));
            drop(table);
            let ifindex = self.iface_index(&iface);
            if ifindex != 0 {
                self.route_table.on_iface_gone(ifindex);
            }
            self.publish_status(&id, None);
            info!(endpoint = %id, "endpoint removed");
        }

        // Dirty endpoints: chains, routes, status.
        let dirty: Vec<EndpointId> = self.dirty_endpoints.drain().collect();
        for id in dirty {
            let Some(ep) = self.endpoints.get(&id).cloned() else {
                continue;
            };
            {
                let mut table = self.filter_table.lock().unwrap();
                table.update_chain(self.to_wl_chain(&id, &ep));
                table.update_chain(self.from_wl_chain(&id, &ep));
            }

            let ifindex = self.iface_index(&ep.iface_name);
            if ifindex != 0 {
                for addr in &ep.addrs {
                    self.route_table.upsert_route(
                        *addr,
                        Target {
                            ifindex,
                            gateway: None,
                        },
                    );
                }
            }

            let status = if !ep.admin_up {
                EndpointStatus::Down
            } else if self.iface_oper_up(&ep.iface_name) {
                EndpointStatus::Up
            } else {
                EndpointStatus::Down
            };
            self.publish_status(&id, Some(status));
            debug!(endpoint = %id, ?status, "endpoint programmed");
        }

        if self.dispatch_dirty {
            let (to_dispatch, from_dispatch) = self.dispatch_chains();
            let mut table = self.filter_table.lock().unwrap();
            table.update_chain(to_dispatch);
            table.update_chain(from_dispatch);
            self.dispatch_dirty = false;
        }

        if self.route_map_dirty {
            self.rebuild_route_map()?;
            self.route_map_dirty = false;
        }
        Ok(())
    }

    fn route_table_syncers(&mut self) -> Vec<&mut RouteTable> {
        vec![&mut self.route_table]
    }

    fn take_status(&mut self) -> Vec<Status> {
        std::mem::take(&mut self.pending_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainInsertMode;
    use crate::iptables::{SharedLock, Table, TableOptions};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn test_manager() -> EndpointManager {
        let lock = Arc::new(SharedLock::new(
            std::path::Path::new("/dev/null"),
            Duration::ZERO,
            Duration::from_millis(1),
        ));
        let opts = TableOptions {
            insert_mode: ChainInsertMode::Insert,
            refresh_interval: Duration::from_secs(3600),
            post_write_interval: Duration::from_secs(3600),
        };
        let table = Arc::new(Mutex::new(Table::new("filter", 4, lock, opts)));
        EndpointManager::new(
            table,
            RouteTable::new(254, Duration::from_secs(1)),
            None,
            false,
            String::from("node-a"),
            EndpointMarks {
                accept: 0x1_0000,
                pass: 0x2_0000,
                endpoint_block: 0xfc_0000,
            },
        )
    }

    fn endpoint(iface: &str) -> std::sync::Arc<WorkloadEndpoint> {
        std::sync::Arc::new(WorkloadEndpoint {
            iface_name: iface.to_string(),
            addrs: vec!["10.0.0.5/32".parse().unwrap()],
            tiers_ingress: vec![],
            tiers_egress: vec![],
            profile_ids: vec![String::from("default")],
            admin_up: true,
            expects_encap: true,
            nat_maps: vec![],
        })
    }

    #[test]
    fn endpoint_gets_a_mark_and_releases_it() {
        let mut mgr = test_manager();
        let id = EndpointId::new("wl-1");
        mgr.on_update(&Update::WorkloadEndpoint {
            id: id.clone(),
            endpoint: endpoint("cord1"),
        });
        let mark = *mgr.ep_marks.get(&id).unwrap();
        assert_ne!(mark, 0);
        assert_eq!(mark & !0xfc_0000, 0);

        mgr.on_update(&Update::WorkloadEndpointRemove { id: id.clone() });
        assert!(mgr.ep_marks.get(&id).is_none());
        // The bit is reusable.
        let id2 = EndpointId::new("wl-2");
        mgr.on_update(&Update::WorkloadEndpoint {
            id: id2.clone(),
            endpoint: endpoint("cord2"),
        });
        assert_eq!(*mgr.ep_marks.get(&id2).unwrap(), mark);
    }

    #[test]
    fn binding_published_once_per_change() {
        let mut mgr = test_manager();
        let id = EndpointId::new("wl-1");
        mgr.on_update(&Update::IfaceUpdate {
            name: String::from("cord1"),
            state: IfaceState::Up,
            ifindex: 7,
        });
        mgr.on_update(&Update::WorkloadEndpoint {
            id: id.clone(),
            endpoint: endpoint("cord1"),
        });

        let published = mgr.resolve_update_batch().unwrap();
        assert_eq!(published.len(), 1);
        let Update::EndpointBindings { bindings } = &published[0] else {
            panic!("expected bindings update");
        };
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].ifindex, 7);
        assert!(bindings[0].oper_up);

        // Unchanged state publishes nothing.
        mgr.dirty_endpoints.insert(id);
        let published = mgr.resolve_update_batch().unwrap();
        assert!(published.is_empty());
    }

    #[test]
    fn admin_down_renders_drop_chain() {
        let mgr = test_manager();
        let id = EndpointId::new("wl-1");
        let mut ep = (*endpoint("cord1")).clone();
        ep.admin_up = false;
        let chain = mgr.to_wl_chain(&id, &ep);
        assert_eq!(chain.rules.len(), 1);
        assert_eq!(chain.rules[0].action, Action::Drop);
    }
}
