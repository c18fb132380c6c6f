//! Typed messages crossing the agent's boundary.
//!
//! `Update` is the desired-state stream from the calculation graph;
//! `Status` flows back the other way. The driver fans every update to
//! every manager, so each variant carries everything its consumers
//! need.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;

/// Stable identifier of a workload endpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId {
    pub workload_id: String,
}

impl EndpointId {
    pub fn new(workload_id: impl Into<String>) -> Self {
        Self {
            workload_id: workload_id.into(),
        }
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.workload_id)
    }
}

/// Desired state of a workload endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadEndpoint {
    pub iface_name: String,
    /// Addresses owned by the workload, programmed as /32 routes.
    pub addrs: Vec<Ipv4Net>,
    /// Policy tiers applied to traffic entering the workload.
    pub tiers_ingress: Vec<TierRef>,
    /// Policy tiers applied to traffic leaving the workload.
    pub tiers_egress: Vec<TierRef>,
    /// Profiles applied after tiers when no tier matched.
    pub profile_ids: Vec<String>,
    /// Administratively up: down endpoints keep chains but drop all.
    pub admin_up: bool,
    /// Addresses are reached over the overlay from other nodes.
    pub expects_encap: bool,
    /// Floating-IP mappings: (external address, workload address).
    pub nat_maps: Vec<(Ipv4Addr, Ipv4Addr)>,
}

/// An ordered reference to policies within a tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierRef {
    pub name: String,
    pub policies: Vec<String>,
}

/// Direction a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDir {
    Ingress,
    Egress,
}

/// Action of a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Allow,
    Deny,
    /// Stop evaluating this tier and continue with the next.
    Pass,
    Log,
}

/// One structured match+action rule. Matches are ANDed; empty fields
/// match everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Rule {
    pub action: Option<RuleAction>,
    pub protocol: Option<u8>,
    pub src_net: Option<Ipv4Net>,
    pub dst_net: Option<Ipv4Net>,
    pub src_ports: Vec<(u16, u16)>,
    pub dst_ports: Vec<(u16, u16)>,
    /// IP-set ids the source address must (or must not) be in.
    pub src_ip_set_ids: Vec<String>,
    pub dst_ip_set_ids: Vec<String>,
    pub not_src_ip_set_ids: Vec<String>,
    pub not_dst_ip_set_ids: Vec<String>,
}

/// A policy: ordered rules per direction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Policy {
    pub inbound_rules: Vec<Rule>,
    pub outbound_rules: Vec<Rule>,
    pub untracked: bool,
    pub pre_dnat: bool,
}

/// Kind of values an IP set holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpSetKind {
    /// Bare addresses / CIDRs.
    Net,
    /// (address, protocol, port) triples.
    NetPort,
    /// (address, protocol) pairs.
    NetProto,
}

/// State of a service frontend for the NAT maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub vip: Ipv4Addr,
    pub port: u16,
    pub protocol: u8,
    pub backends: Vec<ServiceBackend>,
    pub affinity_secs: u32,
    pub external_local: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceBackend {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub local: bool,
}

/// A resolved (endpoint, interface) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointBinding {
    pub id: EndpointId,
    pub iface: String,
    pub ifindex: u32,
    pub admin_up: bool,
    pub oper_up: bool,
}

/// Interface oper/admin state reported by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfaceState {
    Unknown,
    Up,
    Down,
}

/// Desired-state messages into the dataplane.
///
/// Boxed/arc'd payloads keep the enum small on the channel; updates
/// are fanned out to a dozen managers and cloned into their state.
#[derive(Debug, Clone)]
pub enum Update {
    /// Upsert a workload endpoint.
    WorkloadEndpoint {
        id: EndpointId,
        endpoint: Arc<WorkloadEndpoint>,
    },
    WorkloadEndpointRemove {
        id: EndpointId,
    },
    ActivePolicy {
        name: String,
        policy: Arc<Policy>,
    },
    ActivePolicyRemove {
        name: String,
    },
    ActiveProfile {
        name: String,
        profile: Arc<Policy>,
    },
    ActiveProfileRemove {
        name: String,
    },
    /// Full replacement of a set's membership.
    IpSet {
        id: String,
        kind: IpSetKind,
        members: Vec<String>,
    },
    /// Additive / subtractive delta on an existing set.
    IpSetDelta {
        id: String,
        added: Vec<String>,
        removed: Vec<String>,
    },
    IpSetRemove {
        id: String,
    },
    /// Upsert a service (NAT frontend + backends).
    Service {
        name: String,
        spec: Arc<ServiceSpec>,
    },
    ServiceRemove {
        name: String,
    },
    /// A node appeared or changed address.
    HostMetadata {
        hostname: String,
        addr: Ipv4Addr,
    },
    HostMetadataRemove {
        hostname: String,
    },
    /// A remote workload block and the node it lives behind.
    RemoteRoute {
        cidr: Ipv4Net,
        node: Ipv4Addr,
    },
    RemoteRouteRemove {
        cidr: Ipv4Net,
    },
    /// Pools routed inside the cluster, with the NAT-outgoing flag.
    IpPool {
        cidr: Ipv4Net,
        masquerade: bool,
    },
    IpPoolRemove {
        cidr: Ipv4Net,
    },
    /// Public key learned for a peer's crypto device.
    WireguardEndpoint {
        hostname: String,
        public_key: String,
        addr: Ipv4Addr,
    },
    WireguardEndpointRemove {
        hostname: String,
    },
    /// The upstream has replayed all state; open the apply gate.
    InSync,
    /// Endpoint-to-interface bindings resolved by the endpoint
    /// manager; consumed by the program-attachment manager.
    EndpointBindings {
        bindings: Vec<EndpointBinding>,
    },
    /// Interface oper-state event (from the interface monitor).
    IfaceUpdate {
        name: String,
        state: IfaceState,
        ifindex: u32,
    },
    /// Interface address-set event (from the interface monitor).
    IfaceAddrsUpdate {
        name: String,
        addrs: Option<Vec<Ipv4Addr>>,
    },
}

/// Endpoint programming outcome, reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    Up,
    Down,
    Error,
}

/// Status messages out of the dataplane.
#[derive(Debug, Clone)]
pub enum Status {
    Endpoint {
        id: EndpointId,
        status: Option<EndpointStatus>,
    },
    Process {
        iso_timestamp: String,
        uptime_secs: f64,
    },
    WireguardPublicKey {
        public_key: String,
    },
    Health {
        live: bool,
        ready: bool,
    },
}

/// Snapshot of endpoint statuses, used by the status combiner to
/// publish only real transitions.
pub type EndpointStatusMap = BTreeMap<EndpointId, EndpointStatus>;
