//! Kernel IP-set maintenance.
//!
//! The driver calls `apply_updates` before the table writers run (so
//! every set a rule references exists) and `apply_deletions` after
//! them (so no rule still references a removed set). Updates that
//! replace a whole set go through a temporary set and an atomic swap.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::process::{Command, Stdio};

use std::io::Write as _;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::proto::IpSetKind;
use crate::render::ip_set_name;

#[derive(Debug, Error)]
pub enum IpSetError {
    #[error("failed to run ipset: {0}")]
    Exec(#[from] io::Error),

    #[error("ipset failed: {0}")]
    CommandFailed(String),
}

pub type Result<T> = std::result::Result<T, IpSetError>;

/// The operations the driver and the IP-sets manager need; the kernel
/// `ipset` implementation below and the fast-path BPF map
/// implementation both provide them.
pub trait IpSetsWriter: Send {
    fn add_or_replace_members(&mut self, set_id: &str, kind: IpSetKind, members: Vec<String>);
    fn add_members(&mut self, set_id: &str, members: Vec<String>);
    fn remove_members(&mut self, set_id: &str, members: Vec<String>);
    fn remove_set(&mut self, set_id: &str);
    fn queue_resync(&mut self);
    fn apply_updates(&mut self) -> Result<()>;
    fn apply_deletions(&mut self) -> Result<()>;
}

/// Runs the `ipset` binary; swappable for tests.
pub trait Backend: Send {
    fn restore(&mut self, input: &str) -> Result<()>;
    /// Names of all sets currently in the kernel.
    fn list_set_names(&mut self) -> Result<Vec<String>>;
}

pub struct ExecBackend;

impl Backend for ExecBackend {
    fn restore(&mut self, input: &str) -> Result<()> {
        let mut child = Command::new("ipset")
            .args(["restore", "-exist"])
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(input.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(IpSetError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(())
    }

    fn list_set_names(&mut self) -> Result<Vec<String>> {
        let output = Command::new("ipset").args(["list", "-n"]).output()?;
        if !output.status.success() {
            return Err(IpSetError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }
}

#[derive(Debug, Clone)]
struct DesiredSet {
    kind: IpSetKind,
    members: BTreeSet<String>,
}

/// ipset-backed writer (legacy path).
pub struct IpSets {
    backend: Box<dyn Backend>,
    max_size: usize,
    desired: HashMap<String, DesiredSet>,
    dirty: HashSet<String>,
    pending_deletions: HashSet<String>,
    need_resync: bool,
    /// Kernel set names we believe exist.
    known: HashSet<String>,
}

impl IpSets {
    pub fn new(max_size: usize) -> Self {
        Self::with_backend(max_size, Box::new(ExecBackend))
    }

    pub fn with_backend(max_size: usize, backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            max_size,
            desired: HashMap::new(),
            dirty: HashSet::new(),
            pending_deletions: HashSet::new(),
            need_resync: true,
            known: HashSet::new(),
        }
    }

    fn set_type(kind: IpSetKind) -> &'static str {
        match kind {
            IpSetKind::Net => "hash:net",
            IpSetKind::NetPort | IpSetKind::NetProto => "hash:ip,port",
        }
    }

    /// Build the `ipset restore` payload for one set: fill a fresh
    /// temporary set, swap it in, destroy the leftover.
    fn render_replace(&self, name: &str, set: &DesiredSet) -> String {
        let tmp = format!("{name}-tmp");
        let ty = Self::set_type(set.kind);
        let mut out = String::new();
        out.push_str(&format!(
            "create {name} {ty} family inet maxelem {}\n",
            self.max_size
        ));
        out.push_str(&format!(
            "create {tmp} {ty} family inet maxelem {}\n",
            self.max_size
        ));
        out.push_str(&format!("flush {tmp}\n"));
        for member in &set.members {
            out.push_str(&format!("add {tmp} {member}\n"));
        }
        out.push_str(&format!("swap {tmp} {name}\n"));
        out.push_str(&format!("destroy {tmp}\n"));
        out
    }
}

impl IpSetsWriter for IpSets {
    fn add_or_replace_members(&mut self, set_id: &str, kind: IpSetKind, members: Vec<String>) {
        let name = ip_set_name(set_id);
        self.pending_deletions.remove(&name);
        self.desired.insert(
            name.clone(),
            DesiredSet {
                kind,
                members: members.into_iter().collect(),
            },
        );
        self.dirty.insert(name);
    }

    fn add_members(&mut self, set_id: &str, members: Vec<String>) {
        let name = ip_set_name(set_id);
        if let Some(set) = self.desired.get_mut(&name) {
            set.members.extend(members);
            self.dirty.insert(name);
        } else {
            warn!(set = %name, "delta add for unknown set, dropping");
        }
    }

    fn remove_members(&mut self, set_id: &str, members: Vec<String>) {
        let name = ip_set_name(set_id);
        if let Some(set) = self.desired.get_mut(&name) {
            for member in &members {
                set.members.remove(member);
            }
            self.dirty.insert(name);
        }
    }

    fn remove_set(&mut self, set_id: &str) {
        let name = ip_set_name(set_id);
        self.desired.remove(&name);
        self.dirty.remove(&name);
        self.pending_deletions.insert(name);
    }

    fn queue_resync(&mut self) {
        self.need_resync = true;
    }

    fn apply_updates(&mut self) -> Result<()> {
        if self.need_resync {
            let kernel_sets = self.backend.list_set_names()?;
            self.known = kernel_sets
                .iter()
                .filter(|n| n.starts_with("cord-"))
                .cloned()
                .collect();
            // Re-write everything we own; schedule deletion of any
            // cordon set we no longer want.
            for name in self.desired.keys() {
                self.dirty.insert(name.clone());
            }
            for name in &self.known {
                if !self.desired.contains_key(name) {
                    self.pending_deletions.insert(name.clone());
                }
            }
            self.need_resync = false;
            debug!(known = self.known.len(), "IP set resync queued all sets");
        }

        if self.dirty.is_empty() {
            return Ok(());
        }

        let mut input = String::new();
        let mut dirty: Vec<String> = self.dirty.iter().cloned().collect();
        dirty.sort();
        for name in &dirty {
            if let Some(set) = self.desired.get(name) {
                input.push_str(&self.render_replace(name, set));
            }
        }
        self.backend.restore(&input)?;
        for name in dirty {
            self.known.insert(name.clone());
            self.dirty.remove(&name);
        }
        info!("applied IP set updates");
        Ok(())
    }

    fn apply_deletions(&mut self) -> Result<()> {
        if self.pending_deletions.is_empty() {
            return Ok(());
        }
        let mut input = String::new();
        let mut deletions: Vec<String> = self.pending_deletions.iter().cloned().collect();
        deletions.sort();
        for name in &deletions {
            if self.known.contains(name) {
                input.push_str(&format!("destroy {name}\n"));
            }
        }
        if !input.is_empty() {
            self.backend.restore(&input)?;
        }
        for name in deletions {
            self.known.remove(&name);
            self.pending_deletions.remove(&name);
        }
        info!("applied IP set deletions");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeBackend {
        sets: std::sync::Arc<std::sync::Mutex<HashMap<String, BTreeSet<String>>>>,
    }

    impl Backend for FakeBackend {
        fn restore(&mut self, input: &str) -> Result<()> {
            let mut sets = self.sets.lock().unwrap();
            for line in input.lines() {
                let mut parts = line.split_whitespace();
                match parts.next() {
                    Some("create") => {
                        let name = parts.next().unwrap().to_string();
                        sets.entry(name).or_default();
                    }
                    Some("flush") => {
                        let name = parts.next().unwrap();
                        sets.get_mut(name).unwrap().clear();
                    }
                    Some("add") => {
                        let name = parts.next().unwrap().to_string();
                        let member = parts.collect::<Vec<_>>().join(" ");
                        sets.get_mut(&name).unwrap().insert(member);
                    }
                    Some("swap") => {
                        let a = parts.next().unwrap().to_string();
                        let b = parts.next().unwrap().to_string();
                        let va = sets.get(&a).cloned().unwrap_or_default();
                        let vb = sets.get(&b).cloned().unwrap_or_default();
                        sets.insert(a, vb);
                        sets.insert(b, va);
                    }
                    Some("destroy") => {
                        let name = parts.next().unwrap();
                        sets.remove(name);
                    }
                    _ => {}
                }
            }
            Ok(())
        }

        fn list_set_names(&mut self) -> Result<Vec<String>> {
            Ok(self.sets.lock().unwrap().keys().cloned().collect())
        }
    }

    fn test_sets() -> (
        IpSets,
        std::sync::Arc<std::sync::Mutex<HashMap<String, BTreeSet<String>>>>,
    ) {
        let backend = FakeBackend::default();
        let sets = backend.sets.clone();
        (IpSets::with_backend(1024, Box::new(backend)), sets)
    }

    #[test]
    fn replace_swaps_in_full_membership() {
        let (mut writer, sets) = test_sets();
        writer.add_or_replace_members(
            "pods",
            IpSetKind::Net,
            vec![String::from("10.0.0.1"), String::from("10.0.0.2")],
        );
        writer.apply_updates().unwrap();
        let sets = sets.lock().unwrap();
        let members = &sets["cord-s-pods"];
        assert_eq!(members.len(), 2);
        assert!(!sets.contains_key("cord-s-pods-tmp"));
    }

    #[test]
    fn delta_updates_are_additive() {
        let (mut writer, sets) = test_sets();
        writer.add_or_replace_members("pods", IpSetKind::Net, vec![String::from("10.0.0.1")]);
        writer.apply_updates().unwrap();
        writer.add_members("pods", vec![String::from("10.0.0.2")]);
        writer.remove_members("pods", vec![String::from("10.0.0.1")]);
        writer.apply_updates().unwrap();
        let sets = sets.lock().unwrap();
        let members = &sets["cord-s-pods"];
        assert!(members.contains("10.0.0.2"));
        assert!(!members.contains("10.0.0.1"));
    }

    #[test]
    fn deletions_wait_for_apply_deletions() {
        let (mut writer, sets) = test_sets();
        writer.add_or_replace_members("pods", IpSetKind::Net, vec![String::from("10.0.0.1")]);
        writer.apply_updates().unwrap();
        writer.remove_set("pods");
        writer.apply_updates().unwrap();
        assert!(sets.lock().unwrap().contains_key("cord-s-pods"));
        writer.apply_deletions().unwrap();
        assert!(!sets.lock().unwrap().contains_key("cord-s-pods"));
    }

    #[test]
    fn resync_cleans_up_stale_sets() {
        let (mut writer, sets) = test_sets();
        sets.lock()
            .unwrap()
            .insert(String::from("cord-s-stale"), BTreeSet::new());
        writer.queue_resync();
        writer.apply_updates().unwrap();
        writer.apply_deletions().unwrap();
        assert!(!sets.lock().unwrap().contains_key("cord-s-stale"));
    }
}
