//! cordon-dataplane daemon: wires the managers, writers and driver
//! together and runs until signalled.

use std::sync::{Arc, Mutex};

use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cordon_dataplane::attach::{AttachParams, Attacher};
use cordon_dataplane::config::Config;
use cordon_dataplane::driver;
use cordon_dataplane::ifacemonitor::InterfaceMonitor;
use cordon_dataplane::ipsets::IpSets;
use cordon_dataplane::iptables::{SharedLock, Table, TableOptions};
use cordon_dataplane::kernel;
use cordon_dataplane::managers::{
    self, EndpointManager, FailsafeManager, FloatingIpManager, HostIpManager, IpSetsManager,
    Manager, MasqManager, PolicyManager, ProgramAttachManager, ServiceLoopManager, ServiceManager,
    TunnelManager, WireguardManager,
};
use cordon_dataplane::maps;
use cordon_dataplane::marks;
use cordon_dataplane::mtu;
use cordon_dataplane::proto::Status;
use cordon_dataplane::render::PolicyMarks;
use cordon_dataplane::routetable::RouteTable;
use cordon_dataplane::staticcfg;

use cordon_common::conntrack::Timeouts;

fn fatal(msg: &str, err: impl std::fmt::Display) -> ! {
    error!(error = %err, "{msg}");
    std::process::exit(1);
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("cordon-dataplane starting...");

    let mut config = Config::default();
    if let Ok(hostname) = std::env::var("CORDON_HOSTNAME") {
        config.hostname = hostname;
    }

    // Mark plan first: a mask that cannot cover the program bits is a
    // configuration error nothing downstream can repair.
    let mark_plan = match marks::allocate(config.mark_mask, config.bpf_enabled, config.wireguard_enabled)
    {
        Ok(plan) => plan,
        Err(e) => fatal("mark allocation failed", e),
    };

    // MTU detection and the shared MTU file.
    let host_mtu = match mtu::detect_host_mtu(&config).await {
        Ok(mtu) => mtu,
        Err(e) => fatal("unable to detect host MTU", e),
    };
    let pod_mtu = mtu::determine_pod_mtu(&mut config, host_mtu);
    if let Err(e) = mtu::write_mtu_file(&config.mtu_file, pod_mtu) {
        warn!(error = %e, "failed to write MTU file, pod MTU may not be propagated");
    }

    kernel::configure(&config);

    // Table writers share one lock; applies to different tables run
    // in parallel under it.
    let lock = Arc::new(SharedLock::new(
        &config.iptables_lock_file,
        config.iptables_lock_timeout,
        config.iptables_lock_probe_interval,
    ));
    let opts = TableOptions {
        insert_mode: config.iptables_insert_mode,
        refresh_interval: config.iptables_refresh_interval,
        post_write_interval: config.iptables_post_write_check_interval,
    };
    let filter_table = Arc::new(Mutex::new(Table::new("filter", 4, lock.clone(), opts.clone())));
    let nat_table = Arc::new(Mutex::new(Table::new("nat", 4, lock.clone(), opts.clone())));
    let mangle_table = Arc::new(Mutex::new(Table::new("mangle", 4, lock.clone(), opts.clone())));
    let raw_table = Arc::new(Mutex::new(Table::new("raw", 4, lock.clone(), opts.clone())));
    let tables = vec![
        filter_table.clone(),
        nat_table.clone(),
        mangle_table.clone(),
        raw_table.clone(),
    ];

    let kernel_ipsets: managers::SharedIpSets =
        Arc::new(Mutex::new(IpSets::new(config.max_ipset_size)));
    let mut ip_sets: Vec<managers::SharedIpSets> = vec![kernel_ipsets.clone()];

    let mut managers: Vec<Manager> = Vec::new();

    // Fast-path plumbing, when enabled: maps, attacher, scanner.
    let mut route_map = None;
    if config.bpf_enabled {
        let host_ip = std::env::var("CORDON_HOST_IP")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
        let attacher = Attacher::new(AttachParams {
            programs_path: config.bpf_programs_path.clone(),
            pin_dir: config.bpf_pin_dir.clone(),
            host_ip,
            tunnel_mtu: config.vxlan_mtu,
            overlay_port: config.vxlan_port,
            log_level: config.bpf_log_level,
            dsr: config.bpf_dsr_enabled,
            drop_workload_to_host: config.endpoint_to_host_action
                == cordon_dataplane::config::EndpointToHostAction::Drop,
        });
        // A verifier rejection here is fatal: without the programs we
        // cannot enforce anything on the fast path.
        if let Err(e) = attacher.ensure_maps() {
            fatal("failed to load TC programs", e);
        }

        let set_ids = Arc::new(Mutex::new(maps::IpSetIdAllocator::new()));
        let bpf_sets = match maps::BpfIpSets::open(&config.bpf_pin_dir, set_ids.clone()) {
            Ok(sets) => sets,
            Err(e) => fatal("failed to open fast-path IP sets map", e),
        };
        let bpf_sets: managers::SharedIpSets = Arc::new(Mutex::new(bpf_sets));
        ip_sets.push(bpf_sets.clone());
        managers.push(Manager::IpSets(IpSetsManager::new(
            bpf_sets,
            config.max_ipset_size,
        )));

        let failsafe_map = match maps::FailsafeMap::open(&config.bpf_pin_dir) {
            Ok(map) => map,
            Err(e) => fatal("failed to open failsafe map", e),
        };
        managers.push(Manager::Failsafe(FailsafeManager::new(
            failsafe_map,
            config.failsafe_inbound_ports.clone(),
            config.failsafe_outbound_ports.clone(),
        )));

        let nat_maps = match maps::NatMaps::open(&config.bpf_pin_dir, config.bpf_dsr_enabled) {
            Ok(maps) => maps,
            Err(e) => fatal("failed to open NAT maps", e),
        };
        let (service_mgr, frontends_rx) = ServiceManager::new(nat_maps);
        managers.push(Manager::Service(service_mgr));

        match maps::ConntrackTable::open(&config.bpf_pin_dir) {
            Ok(table) => {
                let scanner = maps::ConntrackScanner::new(
                    table,
                    Timeouts::default(),
                    std::time::Duration::from_secs(30),
                    frontends_rx,
                );
                tokio::spawn(scanner.run());
            }
            Err(e) => fatal("failed to open conntrack map", e),
        }

        route_map = match maps::RouteMap::open(&config.bpf_pin_dir) {
            Ok(map) => Some(map),
            Err(e) => fatal("failed to open route map", e),
        };

        let attach_mgr = match ProgramAttachManager::new(
            attacher,
            &config.bpf_pin_dir,
            set_ids,
            config.data_iface_prefixes.clone(),
        ) {
            Ok(mgr) => mgr,
            Err(e) => fatal("failed to open policy maps", e),
        };
        managers.push(Manager::ProgramAttach(attach_mgr));
    } else {
        cordon_dataplane::attach::clean_up_pins(&config.bpf_pin_dir);
        managers.push(Manager::IpSets(IpSetsManager::new(
            kernel_ipsets.clone(),
            config.max_ipset_size,
        )));
        managers.push(Manager::Policy(PolicyManager::new(
            filter_table.clone(),
            PolicyMarks {
                accept: mark_plan.accept,
                pass: mark_plan.pass,
            },
        )));
    }

    managers.push(Manager::HostIp(HostIpManager::new(
        kernel_ipsets.clone(),
        config.workload_iface_prefixes.clone(),
    )));
    managers.push(Manager::Endpoint(EndpointManager::new(
        filter_table.clone(),
        RouteTable::new(254, config.netlink_timeout),
        route_map,
        config.bpf_enabled,
        config.hostname.clone(),
        managers::EndpointMarks {
            accept: mark_plan.accept,
            pass: mark_plan.pass,
            endpoint_block: mark_plan.endpoint_block,
        },
    )));
    managers.push(Manager::Masq(MasqManager::new(
        kernel_ipsets.clone(),
        nat_table.clone(),
    )));
    managers.push(Manager::FloatingIp(FloatingIpManager::new(
        nat_table.clone(),
    )));
    if config.vxlan_enabled {
        managers.push(Manager::Tunnel(TunnelManager::new(
            kernel_ipsets.clone(),
            config.vxlan_iface.clone(),
            config.vxlan_port,
            config.vxlan_mtu,
            config.netlink_timeout,
        )));
    } else {
        let iface = config.vxlan_iface.clone();
        tokio::spawn(async move { TunnelManager::clean_up_device(&iface).await });
    }
    managers.push(Manager::ServiceLoop(ServiceLoopManager::new(
        filter_table.clone(),
        config.service_loop_cidrs.clone(),
    )));
    // Registered even when disabled so leftover devices are tidied.
    managers.push(Manager::Wireguard(WireguardManager::new(
        config.wireguard_enabled,
        config.wireguard_iface.clone(),
        config.wireguard_port,
        config.wireguard_mtu,
        config.wireguard_routing_table,
        config.wireguard_rule_priority,
        mark_plan.wireguard,
        config.netlink_timeout,
    )));

    // Static chains: queued now, written by the first apply.
    if config.bpf_enabled {
        staticcfg::setup_bpf(&config, &mark_plan, &filter_table, &nat_table, &raw_table);
    } else {
        staticcfg::setup_legacy(&config, &mark_plan, &filter_table, &nat_table, &raw_table);
    }

    // IPv6 gets static chains only: the fast path polices IPv4, so
    // the v6 rules just keep workloads from receiving unpoliced v6.
    let mut tables = tables;
    if config.bpf_enabled && config.ipv6_enabled {
        let filter_v6 = Arc::new(Mutex::new(Table::new("filter", 6, lock.clone(), opts.clone())));
        let raw_v6 = Arc::new(Mutex::new(Table::new("raw", 6, lock.clone(), opts.clone())));
        staticcfg::setup_bpf_v6(&config, &filter_v6, &raw_v6);
        tables.push(filter_v6);
        tables.push(raw_v6);
    }

    let (driver, mut dataplane, iface_tx) =
        driver::new(config.clone(), managers, tables, ip_sets);

    tokio::spawn(driver::status_report_loop(
        driver.status_sender(),
        config.status_reporting_interval,
    ));

    let monitor = InterfaceMonitor::new(config.iface_excludes.clone(), iface_tx);
    tokio::spawn(monitor.run());
    tokio::spawn(driver.run());

    // Drain status messages into the log until we are told to stop.
    // The real upstream collaborator owns this channel in production.
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => fatal("failed to register SIGINT handler", e),
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => fatal("failed to register SIGTERM handler", e),
    };

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                break;
            }
            status = dataplane.recv() => {
                match status {
                    Some(Status::Health { live, ready }) => {
                        info!(live, ready, "health report");
                    }
                    Some(status) => {
                        info!(?status, "status update");
                    }
                    None => break,
                }
            }
        }
    }

    info!("cordon-dataplane stopped");
}
