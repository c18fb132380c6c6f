//! Overlay tunnel manager.
//!
//! Keeps the VXLAN device existing, up and sized; maintains the
//! all-hosts IP set from host metadata; and steers remote workload
//! blocks through the device in its own routing table slice.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use futures::TryStreamExt;
use ipnet::Ipv4Net;
use tracing::{debug, info, warn};

use crate::proto::{IpSetKind, Update};
use crate::render::IPSET_ALL_HOSTS;
use crate::routetable::{RouteTable, Target};

use super::{DataplaneManager, Result, SharedIpSets};

pub struct TunnelManager {
    ipsets: SharedIpSets,
    route_table: RouteTable,
    iface: String,
    port: u16,
    vni: u32,
    mtu: u16,
    /// Peer nodes by hostname.
    hosts: BTreeMap<String, Ipv4Addr>,
    /// Remote workload blocks by CIDR.
    remote_blocks: BTreeMap<Ipv4Net, Ipv4Addr>,
    hosts_dirty: bool,
    device_ifindex: Option<u32>,
}

impl TunnelManager {
    pub fn new(
        ipsets: SharedIpSets,
        iface: String,
        port: u16,
        mtu: u16,
        netlink_timeout: Duration,
    ) -> Self {
        Self {
            ipsets,
            // Main table; the device routes live alongside normal
            // routes but are tagged by the device.
            route_table: RouteTable::new(254, netlink_timeout),
            iface,
            port,
            vni: cordon_common::VXLAN_VNI,
            mtu,
            hosts: BTreeMap::new(),
            remote_blocks: BTreeMap::new(),
            hosts_dirty: true,
            device_ifindex: None,
        }
    }

    /// Make sure the tunnel device exists, has the right MTU and is
    /// up. Returns its ifindex.
    async fn ensure_device(&mut self) -> Result<u32> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        let mut links = handle
            .link()
            .get()
            .match_name(self.iface.clone())
            .execute();
        let existing = links.try_next().await.ok().flatten();

        let ifindex = match existing {
            Some(link) => link.header.index,
            None => {
                info!(iface = %self.iface, vni = self.vni, "creating VXLAN device");
                handle
                    .link()
                    .add()
                    .vxlan(self.iface.clone(), self.vni)
                    .port(self.port)
                    .execute()
                    .await
                    .map_err(std::io::Error::other)?;
                let mut links = handle
                    .link()
                    .get()
                    .match_name(self.iface.clone())
                    .execute();
                match links.try_next().await.map_err(std::io::Error::other)? {
                    Some(link) => link.header.index,
                    None => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "VXLAN device vanished after creation",
                        )
                        .into())
                    }
                }
            }
        };

        handle
            .link()
            .set(ifindex)
            .mtu(u32::from(self.mtu))
            .up()
            .execute()
            .await
            .map_err(std::io::Error::other)?;
        debug!(iface = %self.iface, ifindex, mtu = self.mtu, "VXLAN device ensured");
        self.device_ifindex = Some(ifindex);
        Ok(ifindex)
    }

    /// Remove the device when encap is disabled (start-of-day
    /// cleanup path).
    pub async fn clean_up_device(iface: &str) {
        let Ok((connection, handle, _)) = rtnetlink::new_connection() else {
            return;
        };
        tokio::spawn(connection);
        let mut links = handle.link().get().match_name(iface.to_string()).execute();
        if let Ok(Some(link)) = links.try_next().await {
            if let Err(e) = handle.link().del(link.header.index).execute().await {
                warn!(iface, error = %e, "failed to delete stale VXLAN device");
            }
        }
    }
}

impl DataplaneManager for TunnelManager {
    fn on_update(&mut self, update: &Update) {
        match update {
            Update::HostMetadata { hostname, addr } => {
                if self.hosts.insert(hostname.clone(), *addr) != Some(*addr) {
                    self.hosts_dirty = true;
                }
            }
            Update::HostMetadataRemove { hostname } => {
                if self.hosts.remove(hostname).is_some() {
                    self.hosts_dirty = true;
                }
            }
            Update::RemoteRoute { cidr, node } => {
                self.remote_blocks.insert(*cidr, *node);
            }
            Update::RemoteRouteRemove { cidr } => {
                self.remote_blocks.remove(cidr);
                self.route_table.delete_route(*cidr);
            }
            _ => {}
        }
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        let ifindex = self.ensure_device().await?;

        if self.hosts_dirty {
            let members: Vec<String> = self.hosts.values().map(|a| a.to_string()).collect();
            self.ipsets.lock().unwrap().add_or_replace_members(
                IPSET_ALL_HOSTS,
                IpSetKind::Net,
                members,
            );
            self.hosts_dirty = false;
        }

        // Remote blocks ride the overlay; the TC fast path encaps
        // directly, these routes cover the legacy path.
        let blocks: Vec<(Ipv4Net, Ipv4Addr)> = self
            .remote_blocks
            .iter()
            .map(|(c, n)| (*c, *n))
            .collect();
        for (cidr, node) in blocks {
            self.route_table.upsert_route(
                cidr,
                Target {
                    ifindex,
                    gateway: Some(node),
                },
            );
        }
        Ok(())
    }

    fn route_table_syncers(&mut self) -> Vec<&mut RouteTable> {
        vec![&mut self.route_table]
    }
}
