//! Shared test plumbing: in-memory stand-ins for the iptables and
//! ipset binaries, and builders for a driver wired to them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cordon_dataplane::config::{ChainInsertMode, Config};
use cordon_dataplane::ipsets::{self, IpSets};
use cordon_dataplane::iptables::{self, SharedLock, Table, TableOptions};
use cordon_dataplane::managers::SharedIpSets;

/// In-memory model of one iptables table.
#[derive(Default, Clone)]
pub struct FakeTable {
    pub chains: BTreeMap<String, Vec<String>>,
}

impl FakeTable {
    pub fn apply_restore(&mut self, input: &str) {
        for line in input.lines() {
            let line = line.trim();
            if line.starts_with('*') || line == "COMMIT" || line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix(':') {
                let name = rest.split_whitespace().next().unwrap().to_string();
                self.chains.insert(name, Vec::new());
            } else if let Some(rest) = line.strip_prefix("-A ") {
                let (chain, spec) = rest.split_once(' ').unwrap();
                self.chains
                    .entry(chain.to_string())
                    .or_default()
                    .push(spec.to_string());
            } else if let Some(rest) = line.strip_prefix("-I ") {
                let mut parts = rest.splitn(3, ' ');
                let chain = parts.next().unwrap().to_string();
                let index: usize = parts.next().unwrap().parse().unwrap();
                let spec = parts.next().unwrap_or("").to_string();
                let rules = self.chains.entry(chain).or_default();
                rules.insert((index - 1).min(rules.len()), spec);
            } else if let Some(rest) = line.strip_prefix("-D ") {
                let (chain, idx) = rest.split_once(' ').unwrap();
                if let (Some(rules), Ok(index)) =
                    (self.chains.get_mut(chain), idx.parse::<usize>())
                {
                    if index >= 1 && index <= rules.len() {
                        rules.remove(index - 1);
                    }
                }
            } else if let Some(name) = line.strip_prefix("-F ") {
                if let Some(rules) = self.chains.get_mut(name) {
                    rules.clear();
                }
            } else if let Some(name) = line.strip_prefix("-X ") {
                self.chains.remove(name);
            }
        }
    }

    pub fn save(&self, table: &str) -> String {
        let mut out = format!("*{table}\n");
        for name in self.chains.keys() {
            out.push_str(&format!(":{name} - [0:0]\n"));
        }
        for (name, rules) in &self.chains {
            for rule in rules {
                out.push_str(&format!("-A {name} {rule}\n"));
            }
        }
        out.push_str("COMMIT\n");
        out
    }

    /// Every set name referenced by any `--match-set` in the table.
    pub fn referenced_sets(&self) -> BTreeSet<String> {
        let mut sets = BTreeSet::new();
        for rules in self.chains.values() {
            for rule in rules {
                let mut rest = rule.as_str();
                while let Some(pos) = rest.find("--match-set ") {
                    rest = &rest[pos + "--match-set ".len()..];
                    if let Some(name) = rest.split_whitespace().next() {
                        sets.insert(name.to_string());
                    }
                }
            }
        }
        sets
    }
}

pub struct FakeTableBackend {
    pub table: Arc<Mutex<FakeTable>>,
    /// Shared view of the kernel sets, for ordering assertions.
    pub sets: Arc<Mutex<FakeSets>>,
    /// Ordering violations recorded during restore.
    pub violations: Arc<Mutex<Vec<String>>>,
}

impl iptables::Backend for FakeTableBackend {
    fn save(&mut self, table: &str) -> Result<String, iptables::TableError> {
        Ok(self.table.lock().unwrap().save(table))
    }

    fn restore(&mut self, _table: &str, input: &str) -> Result<(), iptables::TableError> {
        let mut table = self.table.lock().unwrap();
        table.apply_restore(input);
        // Invariant: every set a rule references must exist at the
        // moment the rule exists.
        let sets = self.sets.lock().unwrap();
        for set in table.referenced_sets() {
            if !sets.sets.contains_key(&set) {
                self.violations
                    .lock()
                    .unwrap()
                    .push(format!("rule references missing set {set}"));
            }
        }
        Ok(())
    }
}

/// In-memory model of the kernel's IP sets.
#[derive(Default)]
pub struct FakeSets {
    pub sets: HashMap<String, BTreeSet<String>>,
}

pub struct FakeSetsBackend {
    pub sets: Arc<Mutex<FakeSets>>,
    /// Set names referenced by the fake table at deletion time; used
    /// to catch delete-while-referenced.
    pub table: Arc<Mutex<FakeTable>>,
    pub violations: Arc<Mutex<Vec<String>>>,
}

impl ipsets::Backend for FakeSetsBackend {
    fn restore(&mut self, input: &str) -> ipsets::Result<()> {
        let mut state = self.sets.lock().unwrap();
        for line in input.lines() {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("create") => {
                    let name = parts.next().unwrap().to_string();
                    state.sets.entry(name).or_default();
                }
                Some("flush") => {
                    let name = parts.next().unwrap();
                    if let Some(set) = state.sets.get_mut(name) {
                        set.clear();
                    }
                }
                Some("add") => {
                    let name = parts.next().unwrap().to_string();
                    let member = parts.collect::<Vec<_>>().join(" ");
                    state.sets.entry(name).or_default().insert(member);
                }
                Some("swap") => {
                    let a = parts.next().unwrap().to_string();
                    let b = parts.next().unwrap().to_string();
                    let va = state.sets.get(&a).cloned().unwrap_or_default();
                    let vb = state.sets.get(&b).cloned().unwrap_or_default();
                    state.sets.insert(a, vb);
                    state.sets.insert(b, va);
                }
                Some("destroy") => {
                    let name = parts.next().unwrap();
                    if self
                        .table
                        .lock()
                        .unwrap()
                        .referenced_sets()
                        .contains(name)
                    {
                        self.violations
                            .lock()
                            .unwrap()
                            .push(format!("set {name} destroyed while referenced"));
                    }
                    state.sets.remove(name);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn list_set_names(&mut self) -> ipsets::Result<Vec<String>> {
        Ok(self.sets.lock().unwrap().sets.keys().cloned().collect())
    }
}

/// Everything a driver test needs to observe the fake kernel.
pub struct Fixture {
    pub config: Config,
    pub filter: Arc<Mutex<FakeTable>>,
    pub nat: Arc<Mutex<FakeTable>>,
    pub sets: Arc<Mutex<FakeSets>>,
    pub violations: Arc<Mutex<Vec<String>>>,
    pub filter_table: Arc<Mutex<Table>>,
    pub nat_table: Arc<Mutex<Table>>,
    pub ipsets_writer: SharedIpSets,
}

pub fn fixture() -> Fixture {
    let config = Config {
        hostname: String::from("node-a"),
        ..Config::default()
    };
    let sets = Arc::new(Mutex::new(FakeSets::default()));
    let violations = Arc::new(Mutex::new(Vec::new()));

    let lock = Arc::new(SharedLock::new(
        std::path::Path::new("/dev/null"),
        Duration::ZERO,
        Duration::from_millis(1),
    ));
    let opts = TableOptions {
        insert_mode: ChainInsertMode::Insert,
        refresh_interval: Duration::from_secs(3600),
        post_write_interval: Duration::from_secs(3600),
    };

    let make_table = |name: &str| {
        let model = Arc::new(Mutex::new(FakeTable::default()));
        let backend = FakeTableBackend {
            table: model.clone(),
            sets: sets.clone(),
            violations: violations.clone(),
        };
        let table = Arc::new(Mutex::new(Table::with_backend(
            name,
            4,
            lock.clone(),
            opts.clone(),
            Box::new(backend),
        )));
        (model, table)
    };
    let (filter, filter_table) = make_table("filter");
    let (nat, nat_table) = make_table("nat");

    let set_backend = FakeSetsBackend {
        sets: sets.clone(),
        table: filter.clone(),
        violations: violations.clone(),
    };
    let writer = IpSets::with_backend(1024, Box::new(set_backend));
    let ipsets_writer: SharedIpSets = Arc::new(Mutex::new(writer));
    // The fake starts empty; skip the initial resync noise.
    ipsets_writer.lock().unwrap().apply_updates().unwrap();

    Fixture {
        config,
        filter,
        nat,
        sets,
        violations,
        filter_table,
        nat_table,
        ipsets_writer,
    }
}

/// Convenience: assert no ordering violations were recorded.
pub fn assert_no_violations(fx: &Fixture) {
    let violations = fx.violations.lock().unwrap();
    assert!(violations.is_empty(), "violations: {violations:?}");
}
