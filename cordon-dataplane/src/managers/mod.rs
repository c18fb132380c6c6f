//! Domain managers.
//!
//! Each manager owns one slice of desired state and the writer
//! handles for the dataplane it programs. The driver fans every
//! update to every manager (`on_update` is pure absorption), then
//! drives the apply phases: `resolve_update_batch` may publish
//! cross-manager messages, `complete_deferred_work` queues writer
//! operations.

mod endpoint;
mod failsafe;
mod floating_ip;
mod host_ip;
mod ipsets_mgr;
mod masq;
mod policy;
mod program_attach;
mod service;
mod service_loop;
mod tunnel;
mod wireguard;

pub use endpoint::{EndpointManager, EndpointMarks};
pub use failsafe::FailsafeManager;
pub use floating_ip::FloatingIpManager;
pub use host_ip::HostIpManager;
pub use ipsets_mgr::IpSetsManager;
pub use masq::MasqManager;
pub use policy::PolicyManager;
pub use program_attach::ProgramAttachManager;
pub use service::ServiceManager;
pub use service_loop::ServiceLoopManager;
pub use tunnel::TunnelManager;
pub use wireguard::WireguardManager;

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::ipsets::IpSetsWriter;
use crate::iptables::Table;
use crate::proto::{Status, Update};
use crate::routetable::RouteTable;

/// Table writers are shared between managers (each manager owns its
/// chain namespace within them); short lock sections only.
pub type SharedTable = Arc<Mutex<Table>>;
pub type SharedIpSets = Arc<Mutex<dyn IpSetsWriter>>;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Table(#[from] crate::iptables::TableError),

    #[error(transparent)]
    IpSet(#[from] crate::ipsets::IpSetError),

    #[error(transparent)]
    Map(#[from] crate::maps::MapError),

    #[error(transparent)]
    Attach(#[from] crate::attach::AttachError),

    #[error(transparent)]
    Route(#[from] crate::routetable::RouteError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ManagerError>;

/// The two-phase manager contract.
#[allow(async_fn_in_trait)]
pub trait DataplaneManager {
    /// Absorb one desired-state update. No dataplane writes.
    fn on_update(&mut self, update: &Update);

    /// Pre-programming step: resolve state that depends on the whole
    /// preceding batch and publish any cross-manager messages. Still
    /// no dataplane writes.
    fn resolve_update_batch(&mut self) -> Result<Vec<Update>> {
        Ok(Vec::new())
    }

    /// Queue/perform the dataplane writes for everything absorbed
    /// since the last successful call.
    async fn complete_deferred_work(&mut self) -> Result<()>;

    /// Route tables this manager owns, for the driver's parallel
    /// apply and resync scheduling.
    fn route_table_syncers(&mut self) -> Vec<&mut RouteTable> {
        Vec::new()
    }

    /// Status messages produced since the last collection.
    fn take_status(&mut self) -> Vec<Status> {
        Vec::new()
    }
}

/// Tagged variant over the managers, so the driver iterates a plain
/// vector without trait objects.
pub enum Manager {
    IpSets(IpSetsManager),
    HostIp(HostIpManager),
    Policy(PolicyManager),
    Endpoint(EndpointManager),
    Masq(MasqManager),
    FloatingIp(FloatingIpManager),
    Tunnel(TunnelManager),
    ServiceLoop(ServiceLoopManager),
    Wireguard(WireguardManager),
    ProgramAttach(ProgramAttachManager),
    Failsafe(FailsafeManager),
    Service(ServiceManager),
}

macro_rules! delegate {
    ($self:expr, $m:ident => $body:expr) => {
        match $self {
            Manager::IpSets($m) => $body,
            Manager::HostIp($m) => $body,
            Manager::Policy($m) => $body,
            Manager::Endpoint($m) => $body,
            Manager::Masq($m) => $body,
            Manager::FloatingIp($m) => $body,
            Manager::Tunnel($m) => $body,
            Manager::ServiceLoop($m) => $body,
            Manager::Wireguard($m) => $body,
            Manager::ProgramAttach($m) => $body,
            Manager::Failsafe($m) => $body,
            Manager::Service($m) => $body,
        }
    };
}

impl Manager {
    pub fn name(&self) -> &'static str {
        match self {
            Manager::IpSets(_) => "ipsets",
            Manager::HostIp(_) => "host-ip",
            Manager::Policy(_) => "policy",
            Manager::Endpoint(_) => "endpoint",
            Manager::Masq(_) => "masq",
            Manager::FloatingIp(_) => "floating-ip",
            Manager::Tunnel(_) => "tunnel",
            Manager::ServiceLoop(_) => "service-loop",
            Manager::Wireguard(_) => "wireguard",
            Manager::ProgramAttach(_) => "program-attach",
            Manager::Failsafe(_) => "failsafe",
            Manager::Service(_) => "service",
        }
    }

    pub fn on_update(&mut self, update: &Update) {
        delegate!(self, m => m.on_update(update))
    }

    pub fn resolve_update_batch(&mut self) -> Result<Vec<Update>> {
        delegate!(self, m => m.resolve_update_batch())
    }

    pub async fn complete_deferred_work(&mut self) -> Result<()> {
        delegate!(self, m => m.complete_deferred_work().await)
    }

    pub fn route_table_syncers(&mut self) -> Vec<&mut RouteTable> {
        delegate!(self, m => m.route_table_syncers())
    }

    pub fn take_status(&mut self) -> Vec<Status> {
        delegate!(self, m => m.take_status())
    }
}
