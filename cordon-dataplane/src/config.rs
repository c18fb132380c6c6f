//! Agent configuration.
//!
//! Populated by the external config loader; everything here has a
//! sensible default so tests can build a config with struct-update
//! syntax from `Config::default()`.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Where rules are placed relative to the kernel's built-in chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChainInsertMode {
    #[default]
    Insert,
    Append,
}

/// What happens to workload traffic addressed to the host itself
/// after policy has allowed it. Drop is the safe default: the host's
/// control plane is reachable only through the failsafe ports unless
/// the operator opts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndpointToHostAction {
    #[default]
    Drop,
    Accept,
    /// Legacy path only: fall through to the rest of the INPUT chain.
    Return,
}

/// A protocol/port pair for the failsafe lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ProtoPort {
    pub protocol: u8,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hostname: String,

    /// Interface name prefixes that identify workload interfaces.
    pub workload_iface_prefixes: Vec<String>,
    /// Prefixes of host data interfaces the fast path attaches to.
    pub data_iface_prefixes: Vec<String>,
    /// Interfaces the monitor should ignore entirely.
    pub iface_excludes: Vec<String>,
    /// Default fate of policy-allowed workload traffic to the host.
    pub endpoint_to_host_action: EndpointToHostAction,
    /// Pattern prefix for interfaces counted in host MTU detection.
    pub mtu_iface_prefixes: Vec<String>,

    pub ipv6_enabled: bool,

    /// Fast path: attach TC programs and program the BPF maps.
    pub bpf_enabled: bool,
    pub bpf_dsr_enabled: bool,
    pub bpf_disable_unprivileged: bool,
    /// Directory holding the compiled TC program object.
    pub bpf_programs_path: PathBuf,
    /// Directory the shared maps are pinned under.
    pub bpf_pin_dir: PathBuf,
    pub bpf_log_level: u32,

    pub vxlan_enabled: bool,
    pub vxlan_port: u16,
    pub vxlan_mtu: u16,
    pub vxlan_iface: String,

    pub wireguard_enabled: bool,
    pub wireguard_iface: String,
    pub wireguard_port: u16,
    pub wireguard_mtu: u16,
    pub wireguard_routing_table: u32,
    pub wireguard_rule_priority: u32,

    pub max_ipset_size: usize,

    pub iptables_insert_mode: ChainInsertMode,
    pub iptables_refresh_interval: Duration,
    pub iptables_post_write_check_interval: Duration,
    pub iptables_lock_file: PathBuf,
    pub iptables_lock_timeout: Duration,
    pub iptables_lock_probe_interval: Duration,

    pub ipsets_refresh_interval: Duration,
    pub route_refresh_interval: Duration,
    pub program_refresh_interval: Duration,

    pub netlink_timeout: Duration,

    pub status_reporting_interval: Duration,
    pub health_interval: Duration,

    /// Allowed bits for configurable packet marks; must cover the
    /// fixed program bits in fast-path mode.
    pub mark_mask: u32,

    pub failsafe_inbound_ports: Vec<ProtoPort>,
    pub failsafe_outbound_ports: Vec<ProtoPort>,

    /// CIDRs covering service VIPs, for service-loop prevention.
    pub service_loop_cidrs: Vec<ipnet::Ipv4Net>,
    /// CIDRs of nodes outside the cluster allowed to reach us over
    /// the overlay.
    pub external_nodes_cidrs: Vec<ipnet::Ipv4Net>,

    /// File recording the pod MTU for co-resident collaborators.
    pub mtu_file: PathBuf,

    /// Sleep this long into the main loop, then hang for an hour.
    /// Exercises upstream watchdogs.
    pub debug_simulate_hang_after: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: String::from("localhost"),
            workload_iface_prefixes: vec![String::from("cord")],
            data_iface_prefixes: vec![String::from("eth"), String::from("ens"), String::from("enp")],
            iface_excludes: vec![String::from("lo")],
            endpoint_to_host_action: EndpointToHostAction::Drop,
            mtu_iface_prefixes: vec![String::from("eth"), String::from("ens")],
            ipv6_enabled: false,
            bpf_enabled: false,
            bpf_dsr_enabled: false,
            bpf_disable_unprivileged: false,
            bpf_programs_path: PathBuf::from("/usr/lib/cordon/ebpf"),
            bpf_pin_dir: PathBuf::from("/sys/fs/bpf/cordon"),
            bpf_log_level: 0,
            vxlan_enabled: true,
            vxlan_port: 4789,
            vxlan_mtu: 0,
            vxlan_iface: String::from("vxlan.cordon"),
            wireguard_enabled: false,
            wireguard_iface: String::from("wg.cordon"),
            wireguard_port: 51820,
            wireguard_mtu: 0,
            wireguard_routing_table: 1,
            wireguard_rule_priority: 99,
            max_ipset_size: 1_048_576,
            iptables_insert_mode: ChainInsertMode::Insert,
            iptables_refresh_interval: Duration::from_secs(90),
            iptables_post_write_check_interval: Duration::from_secs(1),
            iptables_lock_file: PathBuf::from("/run/xtables.lock"),
            iptables_lock_timeout: Duration::from_secs(10),
            iptables_lock_probe_interval: Duration::from_millis(50),
            ipsets_refresh_interval: Duration::from_secs(90),
            route_refresh_interval: Duration::from_secs(90),
            program_refresh_interval: Duration::from_secs(90),
            netlink_timeout: Duration::from_secs(10),
            status_reporting_interval: Duration::from_secs(30),
            health_interval: Duration::from_secs(10),
            mark_mask: 0xffff_0000,
            failsafe_inbound_ports: vec![
                ProtoPort { protocol: 6, port: 22 },
                ProtoPort { protocol: 6, port: 179 },
                ProtoPort { protocol: 6, port: 6443 },
            ],
            failsafe_outbound_ports: vec![
                ProtoPort { protocol: 6, port: 179 },
                ProtoPort { protocol: 6, port: 2379 },
                ProtoPort { protocol: 6, port: 6443 },
            ],
            service_loop_cidrs: vec![],
            external_nodes_cidrs: vec![],
            mtu_file: PathBuf::from("/var/lib/cordon/mtu"),
            debug_simulate_hang_after: None,
        }
    }
}

impl Config {
    /// Is `iface` a workload interface by name?
    pub fn is_workload_iface(&self, iface: &str) -> bool {
        self.workload_iface_prefixes
            .iter()
            .any(|p| iface.starts_with(p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_to_host_defaults_to_drop() {
        assert_eq!(
            Config::default().endpoint_to_host_action,
            EndpointToHostAction::Drop
        );
    }

    #[test]
    fn workload_iface_matching() {
        let cfg = Config {
            workload_iface_prefixes: vec![String::from("cord"), String::from("veth")],
            ..Config::default()
        };
        assert!(cfg.is_workload_iface("cord1234"));
        assert!(cfg.is_workload_iface("veth0"));
        assert!(!cfg.is_workload_iface("eth0"));
    }
}
