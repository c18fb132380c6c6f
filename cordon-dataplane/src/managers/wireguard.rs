//! Wireguard-style encryption manager.
//!
//! Keeps the crypto device configured (key, port, peers) and installs
//! the routing rule that steers inter-node traffic through its
//! routing table. Registered even when encryption is disabled so a
//! previous run's device and rules get tidied up.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::process::Command;
use std::time::Duration;

use futures::TryStreamExt;
use ipnet::Ipv4Net;
use tracing::{debug, info, warn};

use crate::proto::{Status, Update};
use crate::routetable::{RouteTable, Target};

use super::{DataplaneManager, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Peer {
    public_key: String,
    addr: Ipv4Addr,
}

pub struct WireguardManager {
    enabled: bool,
    iface: String,
    port: u16,
    mtu: u16,
    routing_table: u32,
    rule_priority: u32,
    firewall_mark: u32,
    route_table: RouteTable,
    peers: BTreeMap<String, Peer>,
    peers_dirty: bool,
    device_ready: bool,
    rule_installed: bool,
    public_key: Option<String>,
    status: Vec<Status>,
}

impl WireguardManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        enabled: bool,
        iface: String,
        port: u16,
        mtu: u16,
        routing_table: u32,
        rule_priority: u32,
        firewall_mark: u32,
        netlink_timeout: Duration,
    ) -> Self {
        Self {
            enabled,
            iface,
            port,
            mtu,
            routing_table,
            rule_priority,
            firewall_mark,
            route_table: RouteTable::new(routing_table, netlink_timeout),
            peers: BTreeMap::new(),
            peers_dirty: false,
            device_ready: false,
            rule_installed: false,
            public_key: None,
            status: Vec::new(),
        }
    }

    /// Run `wg`, logging failures. The tool is idempotent for the
    /// operations we use.
    fn wg(&self, args: &[&str]) -> std::io::Result<String> {
        let output = Command::new("wg").args(args).output()?;
        if !output.status.success() {
            return Err(std::io::Error::other(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn ensure_device(&mut self) -> Result<u32> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        let mut links = handle
            .link()
            .get()
            .match_name(self.iface.clone())
            .execute();
        let ifindex = match links.try_next().await.ok().flatten() {
            Some(link) => link.header.index,
            None => {
                info!(iface = %self.iface, "creating wireguard device");
                handle
                    .link()
                    .add()
                    .wireguard(self.iface.clone())
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
                            "wireguard device vanished after creation",
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

        if !self.device_ready {
            // Key and listen port; generates a key on first run.
            let key_file = "/var/lib/cordon/wg.key";
            if !std::path::Path::new(key_file).exists() {
                let key = self.wg(&["genkey"])?;
                if let Some(parent) = std::path::Path::new(key_file).parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(key_file, key)?;
            }
            let port = self.port.to_string();
            let mark = format!("{:#x}", self.firewall_mark);
            self.wg(&[
                "set",
                &self.iface,
                "listen-port",
                &port,
                "fwmark",
                &mark,
                "private-key",
                key_file,
            ])?;
            let public_key = self.wg(&["show", &self.iface, "public-key"])?;
            if self.public_key.as_deref() != Some(public_key.as_str()) {
                self.status.push(Status::WireguardPublicKey {
                    public_key: public_key.clone(),
                });
                self.public_key = Some(public_key);
            }
            self.device_ready = true;
        }
        Ok(ifindex)
    }

    /// Steer everything except our own tunnel traffic through the
    /// crypto table.
    fn ensure_rule(&mut self) -> Result<()> {
        if self.rule_installed {
            return Ok(());
        }
        let output = Command::new("ip")
            .args([
                "rule",
                "add",
                "not",
                "fwmark",
                &self.firewall_mark.to_string(),
                "table",
                &self.routing_table.to_string(),
                "priority",
                &self.rule_priority.to_string(),
            ])
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("File exists") {
                return Err(std::io::Error::other(stderr.into_owned()).into());
            }
        }
        self.rule_installed = true;
        Ok(())
    }

    /// Remove our rule and device when encryption is turned off.
    fn tear_down(&mut self) {
        let _ = Command::new("ip")
            .args([
                "rule",
                "del",
                "table",
                &self.routing_table.to_string(),
                "priority",
                &self.rule_priority.to_string(),
            ])
            .output();
        let _ = Command::new("ip")
            .args(["link", "del", &self.iface])
            .output();
        debug!(iface = %self.iface, "wireguard teardown attempted");
    }
}

impl DataplaneManager for WireguardManager {
    fn on_update(&mut self, update: &Update) {
        match update {
            Update::WireguardEndpoint {
                hostname,
                public_key,
                addr,
            } => {
                let peer = Peer {
                    public_key: public_key.clone(),
                    addr: *addr,
                };
                if self.peers.insert(hostname.clone(), peer.clone()) != Some(peer) {
                    self.peers_dirty = true;
                }
            }
            Update::WireguardEndpointRemove { hostname } => {
                if self.peers.remove(hostname).is_some() {
                    self.peers_dirty = true;
                }
            }
            _ => {}
        }
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        if !self.enabled {
            // Tidy up anything a previous (enabled) run left behind.
            self.tear_down();
            return Ok(());
        }

        let ifindex = self.ensure_device().await?;
        self.ensure_rule()?;

        if self.peers_dirty {
            for peer in self.peers.values() {
                let endpoint = format!("{}:{}", peer.addr, self.port);
                let allowed = format!("{}/32", peer.addr);
                if let Err(e) = self.wg(&[
                    "set",
                    &self.iface,
                    "peer",
                    &peer.public_key,
                    "endpoint",
                    &endpoint,
                    "allowed-ips",
                    &allowed,
                ]) {
                    warn!(error = %e, "failed to configure wireguard peer");
                    return Err(e.into());
                }
                if let Ok(net) = Ipv4Net::new(peer.addr, 32) {
                    self.route_table.upsert_route(
                        net,
                        Target {
                            ifindex,
                            gateway: None,
                        },
                    );
                }
            }
            self.peers_dirty = false;
        }
        Ok(())
    }

    fn route_table_syncers(&mut self) -> Vec<&mut RouteTable> {
        if self.enabled {
            vec![&mut self.route_table]
        } else {
            Vec::new()
        }
    }

    fn take_status(&mut self) -> Vec<Status> {
        std::mem::take(&mut self.status)
    }
}
