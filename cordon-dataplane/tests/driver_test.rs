//! Driver integration tests against in-memory table/set backends:
//! apply ordering, idempotency and the create-before-reference
//! invariant.

mod harness;

use std::sync::Arc;

use cordon_dataplane::driver;
use cordon_dataplane::managers::{
    EndpointManager, EndpointMarks, HostIpManager, IpSetsManager, Manager, MasqManager,
    PolicyManager, ServiceLoopManager,
};
use cordon_dataplane::proto::{
    EndpointId, IfaceState, IpSetKind, Policy, Rule, RuleAction, Update, WorkloadEndpoint,
};
use cordon_dataplane::render::PolicyMarks;
use cordon_dataplane::routetable::RouteTable;

use harness::{assert_no_violations, fixture, Fixture};

const MARKS: PolicyMarks = PolicyMarks {
    accept: 0x0001_0000,
    pass: 0x0002_0000,
};

fn build_driver(fx: &Fixture) -> driver::Driver {
    let managers = vec![
        Manager::IpSets(IpSetsManager::new(fx.ipsets_writer.clone(), 1024)),
        Manager::HostIp(HostIpManager::new(
            fx.ipsets_writer.clone(),
            vec![String::from("cord")],
        )),
        Manager::Policy(PolicyManager::new(fx.filter_table.clone(), MARKS)),
        Manager::Endpoint(EndpointManager::new(
            fx.filter_table.clone(),
            RouteTable::new(200, std::time::Duration::from_secs(1)),
            None,
            false,
            fx.config.hostname.clone(),
            EndpointMarks {
                accept: MARKS.accept,
                pass: MARKS.pass,
                endpoint_block: 0x00fc_0000,
            },
        )),
        Manager::Masq(MasqManager::new(
            fx.ipsets_writer.clone(),
            fx.nat_table.clone(),
        )),
        Manager::ServiceLoop(ServiceLoopManager::new(
            fx.filter_table.clone(),
            vec!["10.96.0.0/12".parse().unwrap()],
        )),
    ];
    let tables = vec![fx.filter_table.clone(), fx.nat_table.clone()];
    let ip_sets = vec![fx.ipsets_writer.clone()];
    let (driver, _handle, _iface_tx) = driver::new(fx.config.clone(), managers, tables, ip_sets);
    driver
}

fn endpoint(iface: &str, profile: &str) -> Update {
    Update::WorkloadEndpoint {
        id: EndpointId::new(format!("wl-{iface}")),
        endpoint: Arc::new(WorkloadEndpoint {
            iface_name: iface.to_string(),
            addrs: vec!["10.0.0.5/32".parse().unwrap()],
            tiers_ingress: vec![],
            tiers_egress: vec![],
            profile_ids: vec![profile.to_string()],
            admin_up: true,
            expects_encap: true,
            nat_maps: vec![],
        }),
    }
}

fn profile_with_set(set_id: &str) -> Update {
    Update::ActiveProfile {
        name: String::from("default"),
        profile: Arc::new(Policy {
            inbound_rules: vec![Rule {
                action: Some(RuleAction::Allow),
                src_ip_set_ids: vec![set_id.to_string()],
                ..Default::default()
            }],
            ..Default::default()
        }),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn in_sync_gate_opens_on_sentinel() {
    let fx = fixture();
    let mut driver = build_driver(&fx);
    assert!(!driver.datastore_in_sync());
    driver.dispatch(Update::InSync);
    assert!(driver.datastore_in_sync());
}

#[tokio::test(flavor = "multi_thread")]
async fn apply_is_idempotent() {
    let fx = fixture();
    let mut driver = build_driver(&fx);

    driver.dispatch(Update::IpSet {
        id: String::from("allowed"),
        kind: IpSetKind::Net,
        members: vec![String::from("10.1.0.0/16")],
    });
    driver.dispatch(profile_with_set("allowed"));
    driver.dispatch(Update::IfaceUpdate {
        name: String::from("cordabc"),
        state: IfaceState::Up,
        ifindex: 4,
    });
    driver.dispatch(endpoint("cordabc", "default"));
    driver.dispatch(Update::InSync);

    driver.apply().await;
    let filter_first = fx.filter.lock().unwrap().clone().chains;
    let nat_first = fx.nat.lock().unwrap().clone().chains;

    driver.apply().await;
    let filter_second = fx.filter.lock().unwrap().clone().chains;
    let nat_second = fx.nat.lock().unwrap().clone().chains;

    assert_eq!(filter_first, filter_second);
    assert_eq!(nat_first, nat_second);
    assert_no_violations(&fx);
}

#[tokio::test(flavor = "multi_thread")]
async fn rules_never_reference_missing_sets() {
    let fx = fixture();
    let mut driver = build_driver(&fx);

    // The profile references a set delivered in the same batch; the
    // set must hit the kernel before the chain that mentions it.
    driver.dispatch(profile_with_set("allowed"));
    driver.dispatch(Update::IpSet {
        id: String::from("allowed"),
        kind: IpSetKind::Net,
        members: vec![String::from("10.1.0.0/16")],
    });
    driver.dispatch(Update::InSync);
    driver.apply().await;

    assert_no_violations(&fx);
    let sets = fx.sets.lock().unwrap();
    assert!(sets.sets.contains_key("cord-s-allowed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn set_deletion_waits_for_dereference() {
    let fx = fixture();
    let mut driver = build_driver(&fx);

    driver.dispatch(Update::IpSet {
        id: String::from("allowed"),
        kind: IpSetKind::Net,
        members: vec![String::from("10.1.0.0/16")],
    });
    driver.dispatch(profile_with_set("allowed"));
    driver.dispatch(Update::InSync);
    driver.apply().await;

    // Remove the profile and the set in one batch: the table write
    // (which drops the reference) must precede the set destroy.
    driver.dispatch(Update::ActiveProfileRemove {
        name: String::from("default"),
    });
    driver.dispatch(Update::IpSetRemove {
        id: String::from("allowed"),
    });
    driver.apply().await;

    assert_no_violations(&fx);
    assert!(!fx.sets.lock().unwrap().sets.contains_key("cord-s-allowed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn endpoint_lifecycle_programs_and_cleans_chains() {
    let fx = fixture();
    let mut driver = build_driver(&fx);

    driver.dispatch(Update::IfaceUpdate {
        name: String::from("cordabc"),
        state: IfaceState::Up,
        ifindex: 4,
    });
    driver.dispatch(endpoint("cordabc", "default"));
    driver.dispatch(Update::InSync);
    driver.apply().await;

    let per_ep_chains: Vec<String> = {
        let filter = fx.filter.lock().unwrap();
        filter
            .chains
            .keys()
            .filter(|n| n.starts_with("cord-tw-") || n.starts_with("cord-fw-"))
            .cloned()
            .collect()
    };
    assert_eq!(per_ep_chains.len(), 2, "{per_ep_chains:?}");

    driver.dispatch(Update::WorkloadEndpointRemove {
        id: EndpointId::new("wl-cordabc"),
    });
    driver.apply().await;

    let filter = fx.filter.lock().unwrap();
    for name in per_ep_chains {
        assert!(
            !filter.chains.contains_key(&name),
            "stale chain {name} left behind"
        );
    }
    assert_no_violations(&fx);
}

#[tokio::test(flavor = "multi_thread")]
async fn masq_pools_render_sets_and_chain() {
    let fx = fixture();
    let mut driver = build_driver(&fx);

    driver.dispatch(Update::IpPool {
        cidr: "10.0.0.0/16".parse().unwrap(),
        masquerade: true,
    });
    driver.dispatch(Update::IpPool {
        cidr: "10.1.0.0/16".parse().unwrap(),
        masquerade: false,
    });
    driver.dispatch(Update::InSync);
    driver.apply().await;

    let sets = fx.sets.lock().unwrap();
    assert_eq!(sets.sets["cord-all-pools"].len(), 2);
    assert_eq!(sets.sets["cord-masq-pools"].len(), 1);
    drop(sets);

    let nat = fx.nat.lock().unwrap();
    let masq = &nat.chains["cord-masq"];
    assert_eq!(masq.len(), 1);
    assert!(masq[0].contains("-j MASQUERADE"), "{masq:?}");
    assert_no_violations(&fx);
}
