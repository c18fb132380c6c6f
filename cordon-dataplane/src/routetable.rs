//! Netlink route-table maintenance.
//!
//! One writer per managed routing table index. Owns every route it
//! has been told about and, on resync, removes routes in its table
//! that it does not recognize (other tables are never touched).

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use futures::TryStreamExt;
use ipnet::Ipv4Net;
use netlink_packet_route::route::{RouteAddress, RouteAttribute};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("netlink I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("netlink request failed: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("netlink request timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, RouteError>;

/// A route we own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Deliver via this interface.
    pub ifindex: u32,
    /// Optional gateway.
    pub gateway: Option<Ipv4Addr>,
}

pub struct RouteTable {
    /// Kernel routing table index this writer owns.
    pub table_index: u32,
    netlink_timeout: Duration,
    desired: BTreeMap<Ipv4Net, Target>,
    dirty: HashSet<Ipv4Net>,
    deleted: HashSet<Ipv4Net>,
    need_resync: bool,
}

impl RouteTable {
    pub fn new(table_index: u32, netlink_timeout: Duration) -> Self {
        Self {
            table_index,
            netlink_timeout,
            desired: BTreeMap::new(),
            dirty: HashSet::new(),
            deleted: HashSet::new(),
            need_resync: true,
        }
    }

    /// Upsert a route; applied on the next `apply`.
    pub fn upsert_route(&mut self, dst: Ipv4Net, target: Target) {
        self.deleted.remove(&dst);
        if self.desired.get(&dst) != Some(&target) {
            self.desired.insert(dst, target);
            self.dirty.insert(dst);
        }
    }

    pub fn delete_route(&mut self, dst: Ipv4Net) {
        if self.desired.remove(&dst).is_some() {
            self.dirty.remove(&dst);
            self.deleted.insert(dst);
        }
    }

    /// Drop every route owned by `ifindex` (interface went away; the
    /// kernel already removed the routes).
    pub fn on_iface_gone(&mut self, ifindex: u32) {
        let gone: Vec<Ipv4Net> = self
            .desired
            .iter()
            .filter(|(_, t)| t.ifindex == ifindex)
            .map(|(d, _)| *d)
            .collect();
        for dst in gone {
            self.desired.remove(&dst);
            self.dirty.remove(&dst);
            self.deleted.remove(&dst);
        }
    }

    /// Full kernel comparison on the next `apply`.
    pub fn queue_resync(&mut self) {
        self.need_resync = true;
    }

    /// Reconcile the kernel table with the desired routes.
    pub async fn apply(&mut self) -> Result<()> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        if self.need_resync {
            self.resync(&handle).await?;
            self.need_resync = false;
        }

        let deleted: Vec<Ipv4Net> = self.deleted.drain().collect();
        for dst in deleted {
            if let Err(e) = self.del_route(&handle, dst).await {
                // Route may already be gone; that is convergence too.
                debug!(table = self.table_index, %dst, error = %e, "route delete failed");
            }
        }

        let dirty: Vec<Ipv4Net> = self.dirty.drain().collect();
        for dst in dirty {
            let Some(target) = self.desired.get(&dst).cloned() else {
                continue;
            };
            if let Err(e) = self.add_route(&handle, dst, &target).await {
                warn!(table = self.table_index, %dst, error = %e, "route add failed");
                self.dirty.insert(dst);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Compare the kernel's view of our table against the desired set
    /// and reconcile both directions.
    async fn resync(&mut self, handle: &rtnetlink::Handle) -> Result<()> {
        let mut kernel: BTreeMap<Ipv4Net, ()> = BTreeMap::new();
        let mut routes = handle
            .route()
            .get(rtnetlink::IpVersion::V4)
            .execute();
        while let Some(route) = timeout(self.netlink_timeout, routes.try_next())
            .await
            .map_err(|_| RouteError::Timeout)?
            .map_err(RouteError::Netlink)?
        {
            if u32::from(route.header.table) != self.table_index
                && route_table_attr(&route) != Some(self.table_index)
            {
                continue;
            }
            let Some(dst) = route_destination(&route) else {
                continue;
            };
            kernel.insert(dst, ());
        }

        // Kernel routes we do not want: delete. Desired routes the
        // kernel is missing: re-add.
        for dst in kernel.keys() {
            if !self.desired.contains_key(dst) {
                self.deleted.insert(*dst);
            }
        }
        for dst in self.desired.keys() {
            if !kernel.contains_key(dst) {
                self.dirty.insert(*dst);
            }
        }
        info!(
            table = self.table_index,
            kernel = kernel.len(),
            desired = self.desired.len(),
            "route table resync"
        );
        Ok(())
    }

    async fn add_route(
        &self,
        handle: &rtnetlink::Handle,
        dst: Ipv4Net,
        target: &Target,
    ) -> Result<()> {
        let mut req = handle
            .route()
            .add()
            .v4()
            .destination_prefix(dst.addr(), dst.prefix_len())
            .output_interface(target.ifindex)
            .table_id(self.table_index);
        if let Some(gw) = target.gateway {
            req = req.gateway(gw);
        }
        timeout(self.netlink_timeout, req.replace().execute())
            .await
            .map_err(|_| RouteError::Timeout)?
            .map_err(RouteError::Netlink)?;
        debug!(table = self.table_index, %dst, ifindex = target.ifindex, "route added");
        Ok(())
    }

    async fn del_route(&self, handle: &rtnetlink::Handle, dst: Ipv4Net) -> Result<()> {
        // Find the matching kernel route and remove it.
        let mut routes = handle.route().get(rtnetlink::IpVersion::V4).execute();
        while let Some(route) = timeout(self.netlink_timeout, routes.try_next())
            .await
            .map_err(|_| RouteError::Timeout)?
            .map_err(RouteError::Netlink)?
        {
            if u32::from(route.header.table) != self.table_index
                && route_table_attr(&route) != Some(self.table_index)
            {
                continue;
            }
            if route_destination(&route) == Some(dst) {
                timeout(self.netlink_timeout, handle.route().del(route).execute())
                    .await
                    .map_err(|_| RouteError::Timeout)?
                    .map_err(RouteError::Netlink)?;
                debug!(table = self.table_index, %dst, "route deleted");
                return Ok(());
            }
        }
        Ok(())
    }

    /// Number of desired routes; used by tests and debug logs.
    pub fn len(&self) -> usize {
        self.desired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.desired.is_empty()
    }
}

fn route_destination(
    route: &netlink_packet_route::route::RouteMessage,
) -> Option<Ipv4Net> {
    let prefix_len = route.header.destination_prefix_length;
    for attr in &route.attributes {
        if let RouteAttribute::Destination(RouteAddress::Inet(addr)) = attr {
            return Ipv4Net::new(*addr, prefix_len).ok();
        }
    }
    None
}

fn route_table_attr(route: &netlink_packet_route::route::RouteMessage) -> Option<u32> {
    for attr in &route.attributes {
        if let RouteAttribute::Table(t) = attr {
            return Some(*t);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn upsert_tracks_dirty_only_on_change() {
        let mut rt = RouteTable::new(254, Duration::from_secs(1));
        let target = Target {
            ifindex: 3,
            gateway: None,
        };
        rt.upsert_route(net("10.0.1.0/26"), target.clone());
        assert_eq!(rt.dirty.len(), 1);
        rt.dirty.clear();
        // Same route again: nothing to do.
        rt.upsert_route(net("10.0.1.0/26"), target);
        assert!(rt.dirty.is_empty());
    }

    #[test]
    fn delete_moves_route_to_deleted() {
        let mut rt = RouteTable::new(254, Duration::from_secs(1));
        rt.upsert_route(
            net("10.0.1.0/26"),
            Target {
                ifindex: 3,
                gateway: None,
            },
        );
        rt.delete_route(net("10.0.1.0/26"));
        assert!(rt.desired.is_empty());
        assert!(rt.dirty.is_empty());
        assert_eq!(rt.deleted.len(), 1);
    }

    #[test]
    fn iface_gone_forgets_its_routes() {
        let mut rt = RouteTable::new(254, Duration::from_secs(1));
        rt.upsert_route(
            net("10.0.1.1/32"),
            Target {
                ifindex: 3,
                gateway: None,
            },
        );
        rt.upsert_route(
            net("10.0.1.2/32"),
            Target {
                ifindex: 4,
                gateway: None,
            },
        );
        rt.on_iface_gone(3);
        assert_eq!(rt.len(), 1);
        assert!(rt.desired.contains_key(&net("10.0.1.2/32")));
    }
}
