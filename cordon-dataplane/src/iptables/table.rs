//! One writer per (address family, kernel table).
//!
//! The writer owns every `cord-` chain in its table plus our rules in
//! the kernel's built-in chains. Managers queue chain updates; each
//! `apply` flushes the queued changes as a single transactional
//! `iptables-restore --noflush` batch. A jittered post-write check
//! re-reads the kernel and schedules a reconvergence apply when
//! another tool has disturbed our rules.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::io::Write as _;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ChainInsertMode;
use crate::render::{Chain, Rule, CHAIN_PREFIX, RULE_HASH_PREFIX};

use super::SharedLock;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("failed to run {cmd}: {source}")]
    Exec {
        cmd: &'static str,
        source: io::Error,
    },

    #[error("{cmd} failed: {stderr}")]
    CommandFailed { cmd: &'static str, stderr: String },

    #[error("failed to take iptables lock: {0}")]
    Lock(io::Error),
}

pub type Result<T> = std::result::Result<T, TableError>;

/// Runs the save/restore binaries. Swappable so tests can model the
/// kernel table in memory.
pub trait Backend: Send {
    fn save(&mut self, table: &str) -> Result<String>;
    fn restore(&mut self, table: &str, input: &str) -> Result<()>;
}

/// Real backend driving iptables-save / iptables-restore.
pub struct ExecBackend {
    ip_version: u8,
}

impl ExecBackend {
    pub fn new(ip_version: u8) -> Self {
        Self { ip_version }
    }

    fn save_cmd(&self) -> &'static str {
        if self.ip_version == 6 {
            "ip6tables-save"
        } else {
            "iptables-save"
        }
    }

    fn restore_cmd(&self) -> &'static str {
        if self.ip_version == 6 {
            "ip6tables-restore"
        } else {
            "iptables-restore"
        }
    }
}

impl Backend for ExecBackend {
    fn save(&mut self, table: &str) -> Result<String> {
        let cmd = self.save_cmd();
        let output = Command::new(cmd)
            .args(["-t", table])
            .output()
            .map_err(|source| TableError::Exec { cmd, source })?;
        if !output.status.success() {
            return Err(TableError::CommandFailed {
                cmd,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn restore(&mut self, table: &str, input: &str) -> Result<()> {
        let cmd = self.restore_cmd();
        let mut child = Command::new(cmd)
            .args(["--noflush", "--verbose"])
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|source| TableError::Exec { cmd, source })?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(input.as_bytes())
                .map_err(|source| TableError::Exec { cmd, source })?;
        }
        let output = child
            .wait_with_output()
            .map_err(|source| TableError::Exec { cmd, source })?;
        if !output.status.success() {
            return Err(TableError::CommandFailed {
                cmd,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        debug!(table, "restore batch applied");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TableOptions {
    pub insert_mode: ChainInsertMode,
    pub refresh_interval: Duration,
    pub post_write_interval: Duration,
}

/// Our rules in one built-in chain.
#[derive(Debug, Clone)]
struct BaseChain {
    mode: ChainInsertMode,
    rules: Vec<Rule>,
}

/// Kernel-side picture from the last save.
#[derive(Debug, Default)]
struct KernelState {
    /// Rule hashes per `cord-` chain.
    chain_hashes: BTreeMap<String, Vec<String>>,
    /// (line index within chain, hash) of our rules per built-in
    /// chain, in kernel order.
    base_positions: BTreeMap<String, Vec<(usize, String)>>,
}

pub struct Table {
    pub table: String,
    pub ip_version: u8,
    opts: TableOptions,
    lock: Arc<SharedLock>,
    backend: Box<dyn Backend>,

    /// Desired `cord-` chains.
    chains: HashMap<String, Chain>,
    dirty_chains: HashSet<String>,
    chains_to_delete: HashSet<String>,
    /// Desired rules in built-in chains.
    base_chains: HashMap<String, BaseChain>,
    dirty_base: HashSet<String>,

    /// Believed kernel state; rebuilt whenever `in_sync` is false.
    kernel: KernelState,
    in_sync: bool,
    /// When the next post-write check is due, if a write happened.
    post_write_check_at: Option<Instant>,
    last_refresh: Instant,
}

impl Table {
    pub fn new(
        table: impl Into<String>,
        ip_version: u8,
        lock: Arc<SharedLock>,
        opts: TableOptions,
    ) -> Self {
        let backend = Box::new(ExecBackend::new(ip_version));
        Self::with_backend(table, ip_version, lock, opts, backend)
    }

    pub fn with_backend(
        table: impl Into<String>,
        ip_version: u8,
        lock: Arc<SharedLock>,
        opts: TableOptions,
        backend: Box<dyn Backend>,
    ) -> Self {
        Self {
            table: table.into(),
            ip_version,
            opts,
            lock,
            backend,
            chains: HashMap::new(),
            dirty_chains: HashSet::new(),
            chains_to_delete: HashSet::new(),
            base_chains: HashMap::new(),
            dirty_base: HashSet::new(),
            kernel: KernelState::default(),
            in_sync: false,
            post_write_check_at: None,
            last_refresh: Instant::now(),
        }
    }

    /// Upsert a chain; no kernel write until `apply`.
    pub fn update_chain(&mut self, chain: Chain) {
        self.chains_to_delete.remove(&chain.name);
        self.dirty_chains.insert(chain.name.clone());
        self.chains.insert(chain.name.clone(), chain);
    }

    pub fn update_chains(&mut self, chains: impl IntoIterator<Item = Chain>) {
        for chain in chains {
            self.update_chain(chain);
        }
    }

    pub fn remove_chain_by_name(&mut self, name: &str) {
        if self.chains.remove(name).is_some() || self.kernel.chain_hashes.contains_key(name) {
            self.dirty_chains.remove(name);
            self.chains_to_delete.insert(name.to_string());
        }
    }

    pub fn remove_chains(&mut self, names: impl IntoIterator<Item = String>) {
        for name in names {
            self.remove_chain_by_name(&name);
        }
    }

    /// Ensure `rules` exist in a built-in chain at the configured
    /// position (top for insert mode, bottom for append mode).
    pub fn insert_or_append_rules(&mut self, base_chain: &str, rules: Vec<Rule>) {
        self.set_base_rules(base_chain, self.opts.insert_mode, rules);
    }

    /// Ensure `rules` are appended to a built-in chain.
    pub fn append_rules(&mut self, base_chain: &str, rules: Vec<Rule>) {
        self.set_base_rules(base_chain, ChainInsertMode::Append, rules);
    }

    fn set_base_rules(&mut self, base_chain: &str, mode: ChainInsertMode, rules: Vec<Rule>) {
        self.base_chains
            .insert(base_chain.to_string(), BaseChain { mode, rules });
        self.dirty_base.insert(base_chain.to_string());
    }

    /// Force a full re-read and reconverge on the next apply.
    pub fn invalidate(&mut self) {
        self.in_sync = false;
    }

    /// Flush queued changes in one transactional batch. Returns the
    /// delay after which the driver should call apply again (zero if
    /// no recheck is needed).
    pub fn apply(&mut self) -> Result<Duration> {
        // Periodic refresh: distrust our cache occasionally even if
        // nothing else asked for it.
        if !self.opts.refresh_interval.is_zero()
            && self.last_refresh.elapsed() >= self.opts.refresh_interval
        {
            self.in_sync = false;
        }
        // Post-write check due?
        if let Some(due) = self.post_write_check_at {
            if Instant::now() >= due {
                self.post_write_check_at = None;
                self.in_sync = false;
            }
        }

        if !self.in_sync {
            self.load_kernel_state()?;
            self.last_refresh = Instant::now();
        }

        let input = self.build_restore_input();
        if input.is_empty() {
            return Ok(self.reschedule_delay());
        }

        let _guard = self.lock.acquire().map_err(TableError::Lock)?;
        if let Err(e) = self.backend.restore(&self.table, &input) {
            // The batch aborted; distrust everything and retry later.
            warn!(table = %self.table, error = %e, "restore batch failed");
            self.in_sync = false;
            return Err(e);
        }
        drop(_guard);

        self.record_applied();
        // Schedule the external-mutation check, jittered so many
        // nodes do not stampede.
        if !self.opts.post_write_interval.is_zero() {
            let jitter =
                rand::thread_rng().gen_range(Duration::ZERO..=self.opts.post_write_interval / 2);
            self.post_write_check_at = Some(Instant::now() + self.opts.post_write_interval + jitter);
        }

        info!(table = %self.table, "applied table updates");
        Ok(self.reschedule_delay())
    }

    fn reschedule_delay(&self) -> Duration {
        match self.post_write_check_at {
            Some(due) => due.saturating_duration_since(Instant::now()).max(Duration::from_millis(50)),
            None => Duration::ZERO,
        }
    }

    /// Read the kernel and mark everything that diverges dirty.
    fn load_kernel_state(&mut self) -> Result<()> {
        let saved = self.backend.save(&self.table)?;
        let state = parse_save_output(&saved);

        // Our chains: any kernel chain with stale or missing content
        // becomes dirty; unknown cord- chains get deleted.
        for (name, hashes) in &state.chain_hashes {
            match self.chains.get(name) {
                Some(desired) => {
                    if &desired.rule_hashes() != hashes {
                        self.dirty_chains.insert(name.clone());
                    }
                }
                None => {
                    self.chains_to_delete.insert(name.clone());
                }
            }
        }
        for name in self.chains.keys() {
            if !state.chain_hashes.contains_key(name) {
                self.dirty_chains.insert(name.clone());
            }
        }

        // Built-in chains: dirty when our rules are missing, stale,
        // or out of position.
        for (base, desired) in &self.base_chains {
            let want: Vec<String> = base_rule_hashes(base, &desired.rules);
            let have: Vec<String> = state
                .base_positions
                .get(base)
                .map(|v| v.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default();
            let positions_ok = match desired.mode {
                ChainInsertMode::Insert => state
                    .base_positions
                    .get(base)
                    .map(|v| v.iter().enumerate().all(|(i, (pos, _))| *pos == i))
                    .unwrap_or(false),
                ChainInsertMode::Append => true,
            };
            if want != have || !positions_ok {
                self.dirty_base.insert(base.clone());
            }
        }

        self.kernel = state;
        self.in_sync = true;
        Ok(())
    }

    /// Assemble the `iptables-restore --noflush` payload for every
    /// queued change.
    fn build_restore_input(&mut self) -> String {
        let mut lines: Vec<String> = Vec::new();

        // Chain declarations first: referenced chains must exist
        // before any rule mentions them, and listing a chain flushes
        // it, which is exactly the replace semantics we want.
        let mut dirty: Vec<&String> = self.dirty_chains.iter().collect();
        dirty.sort();
        for name in &dirty {
            lines.push(format!(":{name} - -"));
        }
        for name in &dirty {
            if let Some(chain) = self.chains.get(*name) {
                for (rule, hash) in chain.rules.iter().zip(chain.rule_hashes()) {
                    lines.push(rule.render_append(name, &hash));
                }
            }
        }

        // Built-in chain fix-ups: delete our stale rules by position
        // (descending so indices stay valid), then re-add.
        let mut dirty_base: Vec<&String> = self.dirty_base.iter().collect();
        dirty_base.sort();
        for base in &dirty_base {
            if let Some(positions) = self.kernel.base_positions.get(*base) {
                for (pos, _) in positions.iter().rev() {
                    lines.push(format!("-D {base} {}", pos + 1));
                }
            }
            if let Some(desired) = self.base_chains.get(*base) {
                let hashes = base_rule_hashes(base, &desired.rules);
                match desired.mode {
                    ChainInsertMode::Insert => {
                        for (i, (rule, hash)) in
                            desired.rules.iter().zip(&hashes).enumerate()
                        {
                            let rendered = rule.render_append(base, hash);
                            let prefix = format!("-A {base} ");
                            let spec = rendered.strip_prefix(&prefix).unwrap_or(&rendered);
                            lines.push(format!("-I {base} {} {spec}", i + 1));
                        }
                    }
                    ChainInsertMode::Append => {
                        for (rule, hash) in desired.rules.iter().zip(&hashes) {
                            lines.push(rule.render_append(base, hash));
                        }
                    }
                }
            }
        }

        // Deletions last, after nothing references the chains.
        let mut deletes: Vec<&String> = self.chains_to_delete.iter().collect();
        deletes.sort();
        for name in &deletes {
            if self.kernel.chain_hashes.contains_key(*name) {
                lines.push(format!("-F {name}"));
                lines.push(format!("-X {name}"));
            }
        }

        if lines.is_empty() {
            return String::new();
        }

        let mut out = format!("*{}\n", self.table);
        for line in lines {
            out.push_str(&line);
            out.push('\n');
        }
        out.push_str("COMMIT\n");
        out
    }

    /// The batch went in; fold the queued changes into our picture of
    /// the kernel.
    fn record_applied(&mut self) {
        for name in self.dirty_chains.drain() {
            if let Some(chain) = self.chains.get(&name) {
                self.kernel
                    .chain_hashes
                    .insert(name.clone(), chain.rule_hashes());
            }
        }
        for base in self.dirty_base.drain() {
            if let Some(desired) = self.base_chains.get(&base) {
                let hashes = base_rule_hashes(&base, &desired.rules);
                self.kernel.base_positions.insert(
                    base.clone(),
                    hashes.into_iter().enumerate().collect(),
                );
            }
        }
        for name in self.chains_to_delete.drain() {
            self.kernel.chain_hashes.remove(&name);
        }
    }
}

/// Hashes for our rules in a built-in chain.
fn base_rule_hashes(base: &str, rules: &[Rule]) -> Vec<String> {
    Chain::new(base, rules.to_vec()).rule_hashes()
}

/// Pull chain contents and our base-chain rule positions out of
/// `iptables-save` output.
fn parse_save_output(saved: &str) -> KernelState {
    let mut state = KernelState::default();
    let mut base_counts: HashMap<String, usize> = HashMap::new();

    for line in saved.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(':') {
            if let Some(name) = rest.split_whitespace().next() {
                if name.starts_with(CHAIN_PREFIX) {
                    state.chain_hashes.entry(name.to_string()).or_default();
                }
            }
            continue;
        }
        let Some(rest) = line.strip_prefix("-A ") else {
            continue;
        };
        let Some(chain) = rest.split_whitespace().next() else {
            continue;
        };
        let hash = extract_rule_hash(line);
        if chain.starts_with(CHAIN_PREFIX) {
            if let Some(hash) = hash {
                state
                    .chain_hashes
                    .entry(chain.to_string())
                    .or_default()
                    .push(hash);
            }
        } else {
            // Built-in chain: remember the position of every rule so
            // ours can be deleted by index.
            let count = base_counts.entry(chain.to_string()).or_insert(0);
            let pos = *count;
            *count += 1;
            if let Some(hash) = hash {
                state
                    .base_positions
                    .entry(chain.to_string())
                    .or_default()
                    .push((pos, hash));
            }
        }
    }
    state
}

/// Extract the `cord:<hash>` comment from a saved rule line.
fn extract_rule_hash(line: &str) -> Option<String> {
    let marker = format!("--comment \"{RULE_HASH_PREFIX}");
    let start = line.find(&marker)? + marker.len();
    let rest = &line[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{Action, Match};

    /// In-memory model of one kernel table, driven through the same
    /// save/restore text the real binaries consume.
    #[derive(Default, Clone)]
    struct FakeKernel {
        chains: BTreeMap<String, Vec<String>>,
    }

    struct FakeBackend {
        kernel: std::sync::Arc<std::sync::Mutex<FakeKernel>>,
    }

    impl FakeKernel {
        fn apply_restore(&mut self, input: &str) {
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
                    let spec = parts.next().unwrap().to_string();
                    let rules = self.chains.entry(chain).or_default();
                    rules.insert((index - 1).min(rules.len()), spec);
                } else if let Some(rest) = line.strip_prefix("-D ") {
                    let (chain, idx) = rest.split_once(' ').unwrap();
                    let index: usize = idx.parse().unwrap();
                    if let Some(rules) = self.chains.get_mut(chain) {
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

        fn save(&self, table: &str) -> String {
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
    }

    impl Backend for FakeBackend {
        fn save(&mut self, table: &str) -> Result<String> {
            Ok(self.kernel.lock().unwrap().save(table))
        }

        fn restore(&mut self, _table: &str, input: &str) -> Result<()> {
            self.kernel.lock().unwrap().apply_restore(input);
            Ok(())
        }
    }

    fn test_table() -> (Table, std::sync::Arc<std::sync::Mutex<FakeKernel>>) {
        let mut kernel = FakeKernel::default();
        // Built-in chains exist from the start.
        kernel.chains.insert("FORWARD".into(), vec!["-j SOMETHING-ELSE".into()]);
        kernel.chains.insert("INPUT".into(), Vec::new());
        let kernel = std::sync::Arc::new(std::sync::Mutex::new(kernel));
        let backend = Box::new(FakeBackend {
            kernel: kernel.clone(),
        });
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
        (
            Table::with_backend("filter", 4, lock, opts, backend),
            kernel,
        )
    }

    fn chain(name: &str, frags: &[&str]) -> Chain {
        Chain::new(
            name,
            frags
                .iter()
                .map(|f| Rule::new(Match::new().in_interface(f), Action::Accept))
                .collect(),
        )
    }

    #[test]
    fn creates_and_programs_chains() {
        let (mut table, kernel) = test_table();
        table.update_chain(chain("cord-test", &["eth0", "eth1"]));
        table.apply().unwrap();
        let k = kernel.lock().unwrap();
        assert_eq!(k.chains["cord-test"].len(), 2);
        assert!(k.chains["cord-test"][0].contains("-i eth0"));
    }

    #[test]
    fn apply_is_idempotent() {
        let (mut table, kernel) = test_table();
        table.update_chain(chain("cord-test", &["eth0"]));
        table.insert_or_append_rules(
            "FORWARD",
            vec![Rule::new(Match::new(), Action::Jump("cord-test".into()))],
        );
        table.apply().unwrap();
        let first = kernel.lock().unwrap().clone().chains;
        table.apply().unwrap();
        let second = kernel.lock().unwrap().clone().chains;
        assert_eq!(first, second);
    }

    #[test]
    fn removed_chain_is_deleted_from_kernel() {
        let (mut table, kernel) = test_table();
        table.update_chain(chain("cord-test", &["eth0"]));
        table.apply().unwrap();
        assert!(kernel.lock().unwrap().chains.contains_key("cord-test"));
        table.remove_chain_by_name("cord-test");
        table.apply().unwrap();
        assert!(!kernel.lock().unwrap().chains.contains_key("cord-test"));
    }

    #[test]
    fn external_mutation_is_reconverged_after_invalidate() {
        let (mut table, kernel) = test_table();
        table.update_chain(chain("cord-test", &["eth0"]));
        table.apply().unwrap();

        // Another tool rewrites our chain.
        kernel.lock().unwrap().chains.insert(
            "cord-test".into(),
            vec!["-j DROP".into()],
        );
        table.invalidate();
        table.apply().unwrap();
        let k = kernel.lock().unwrap();
        assert_eq!(k.chains["cord-test"].len(), 1);
        assert!(k.chains["cord-test"][0].contains("-i eth0"));
    }

    #[test]
    fn insert_mode_places_rules_at_top_of_base_chain() {
        let (mut table, kernel) = test_table();
        table.update_chain(chain("cord-fw", &["eth0"]));
        table.insert_or_append_rules(
            "FORWARD",
            vec![Rule::new(Match::new(), Action::Jump("cord-fw".into()))],
        );
        table.apply().unwrap();
        let k = kernel.lock().unwrap();
        assert!(k.chains["FORWARD"][0].contains("-j cord-fw"));
        // The pre-existing rule is preserved below ours.
        assert!(k.chains["FORWARD"][1].contains("SOMETHING-ELSE"));
    }

    #[test]
    fn unknown_cord_chains_are_cleaned_up() {
        let (mut table, kernel) = test_table();
        kernel
            .lock()
            .unwrap()
            .chains
            .insert("cord-stale".into(), vec!["-j DROP".into()]);
        table.apply().unwrap();
        assert!(!kernel.lock().unwrap().chains.contains_key("cord-stale"));
    }
}
