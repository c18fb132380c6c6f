//! MTU detection and the pod-MTU file.
//!
//! The pod MTU is the smallest MTU among enabled encapsulations (or
//! the detected host MTU when none is enabled) and is persisted to a
//! well-known file so co-resident collaborators (e.g. the CNI plugin)
//! agree on it.

use std::io;
use std::path::Path;

use futures::TryStreamExt;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Per-encap header overheads.
pub const VXLAN_OVERHEAD: u16 = 50;
pub const WIREGUARD_OVERHEAD: u16 = 60;

/// Fallback when no interface matches the detection pattern; the
/// smallest default among common cloud fabrics.
const FALLBACK_HOST_MTU: u16 = 1460;

/// Smallest MTU among interfaces matching the configured prefixes.
pub async fn detect_host_mtu(cfg: &Config) -> io::Result<u16> {
    let (connection, handle, _) = rtnetlink::new_connection().map_err(io::Error::other)?;
    tokio::spawn(connection);

    let mut smallest: u16 = 0;
    let mut links = handle.link().get().execute();
    while let Ok(Some(link)) = links.try_next().await {
        let mut name = None;
        let mut mtu = None;
        for attr in &link.attributes {
            match attr {
                netlink_packet_route::link::LinkAttribute::IfName(n) => name = Some(n.clone()),
                netlink_packet_route::link::LinkAttribute::Mtu(m) => mtu = Some(*m as u16),
                _ => {}
            }
        }
        let (Some(name), Some(mtu)) = (name, mtu) else {
            continue;
        };
        if !cfg.mtu_iface_prefixes.iter().any(|p| name.starts_with(p.as_str())) {
            debug!(name, mtu, "skipping interface for MTU detection");
            continue;
        }
        debug!(name, mtu, "examining link for MTU calculation");
        if smallest == 0 || mtu < smallest {
            smallest = mtu;
        }
    }

    if smallest == 0 {
        warn!(
            fallback = FALLBACK_HOST_MTU,
            "no interface matched the MTU detection pattern"
        );
        return Ok(FALLBACK_HOST_MTU);
    }
    Ok(smallest)
}

/// Fill in any unset encap MTUs from the host MTU, and compute the
/// pod MTU.
pub fn determine_pod_mtu(cfg: &mut Config, host_mtu: u16) -> u16 {
    if cfg.vxlan_mtu == 0 {
        cfg.vxlan_mtu = host_mtu.saturating_sub(VXLAN_OVERHEAD);
    }
    if cfg.wireguard_mtu == 0 {
        cfg.wireguard_mtu = host_mtu.saturating_sub(WIREGUARD_OVERHEAD);
    }

    let mut mtu = 0u16;
    for (enabled, encap_mtu) in [
        (cfg.vxlan_enabled, cfg.vxlan_mtu),
        (cfg.wireguard_enabled, cfg.wireguard_mtu),
    ] {
        if enabled && encap_mtu != 0 && (mtu == 0 || encap_mtu < mtu) {
            mtu = encap_mtu;
        }
    }
    if mtu == 0 {
        mtu = host_mtu;
    } else if mtu > host_mtu {
        warn!(mtu, host_mtu, "configured MTU is larger than the host interface MTU");
    }
    info!(mtu, "determined pod MTU");
    mtu
}

/// Persist the pod MTU for collaborators on this host.
pub fn write_mtu_file(path: &Path, mtu: u16) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, mtu.to_string())?;
    debug!(path = %path.display(), mtu, "wrote MTU file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_mtu_is_smallest_enabled_encap() {
        let mut cfg = Config {
            vxlan_enabled: true,
            wireguard_enabled: true,
            ..Config::default()
        };
        let mtu = determine_pod_mtu(&mut cfg, 1500);
        assert_eq!(cfg.vxlan_mtu, 1450);
        assert_eq!(cfg.wireguard_mtu, 1440);
        assert_eq!(mtu, 1440);
    }

    #[test]
    fn pod_mtu_defaults_to_host_without_encap() {
        let mut cfg = Config {
            vxlan_enabled: false,
            wireguard_enabled: false,
            ..Config::default()
        };
        assert_eq!(determine_pod_mtu(&mut cfg, 9000), 9000);
    }

    #[test]
    fn explicit_encap_mtu_is_respected() {
        let mut cfg = Config {
            vxlan_enabled: true,
            vxlan_mtu: 1400,
            ..Config::default()
        };
        assert_eq!(determine_pod_mtu(&mut cfg, 1500), 1400);
    }

    #[test]
    fn mtu_file_roundtrip() {
        let dir = std::env::temp_dir().join("cordon-mtu-test");
        let path = dir.join("mtu");
        write_mtu_file(&path, 1450).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1450");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
