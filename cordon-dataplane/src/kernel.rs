//! Start-of-day kernel configuration.
//!
//! Sysctls the dataplane depends on, plus best-effort modprobes for
//! modules that are built in on some kernels and modular on others.

use std::io;
use std::process::Command;

use tracing::{error, info};

use crate::config::Config;

const SCTP_CONNTRACK_MODULE: &str = "nf_conntrack_proto_sctp";
const WIREGUARD_MODULE: &str = "wireguard";

/// Write a /proc/sys value.
fn write_proc_sys(path: &str, value: &str) -> io::Result<()> {
    std::fs::write(path, value)
}

/// Best-effort modprobe. Some kernels build these in and the call
/// fails; that is fine and logged at info for troubleshooting.
fn modprobe(module: &str) {
    match Command::new("modprobe").arg(module).output() {
        Ok(out) if out.status.success() => {
            info!(module, "modprobe succeeded");
        }
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            info!(module, error = %stderr.trim(), "modprobe failed, continuing");
        }
        Err(e) => {
            info!(module, error = %e, "could not run modprobe, continuing");
        }
    }
}

/// Configure global kernel parameters. Failures to set forwarding are
/// logged but not fatal: the supervisor environment may have set them
/// already and made /proc read-only.
pub fn configure(cfg: &Config) {
    modprobe(SCTP_CONNTRACK_MODULE);

    info!("making sure IPv4 forwarding is enabled");
    if let Err(e) = write_proc_sys("/proc/sys/net/ipv4/ip_forward", "1") {
        error!(error = %e, "failed to set IPv4 forwarding sysctl");
    }

    if cfg.ipv6_enabled {
        info!("making sure IPv6 forwarding is enabled");
        if let Err(e) = write_proc_sys("/proc/sys/net/ipv6/conf/all/forwarding", "1") {
            error!(error = %e, "failed to set IPv6 forwarding sysctl");
        }
    }

    if cfg.bpf_enabled && cfg.bpf_disable_unprivileged {
        info!("fast path enabled, disabling unprivileged BPF usage");
        if let Err(e) = write_proc_sys("/proc/sys/kernel/unprivileged_bpf_disabled", "1") {
            error!(error = %e, "failed to set unprivileged_bpf_disabled sysctl");
        }
    }

    if cfg.wireguard_enabled {
        modprobe(WIREGUARD_MODULE);
    }
}
