//! TC program loading and attachment.
//!
//! Every attachment loads a fresh instance of the compiled object,
//! patches its load-time globals (host address, flavor, tunnel MTU,
//! jump-map base slot) and pins nothing new: the long-lived maps are
//! pinned on the first load and every later instance reuses them by
//! name. The instance's policy/accepted/ICMP programs are installed
//! into the shared jump map at the attachment's slot block.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use aya::maps::ProgramArray;
use aya::programs::{tc, SchedClassifier, TcAttachType};
use aya::{Ebpf, EbpfLoader};
use thiserror::Error;
use tracing::{debug, info};

use cordon_common::jump::{
    JUMP_MAP_ENTRIES, JUMP_SLOTS_PER_ATTACH, PROG_INDEX_ACCEPTED, PROG_INDEX_ICMP,
    PROG_INDEX_POLICY,
};

/// Flavor bits, mirrored from the program side.
const F_TO_HOST: u32 = 0x1;
const F_WORKLOAD: u32 = 0x2;
const F_DSR: u32 = 0x4;
const F_DROP_WL_TO_HOST: u32 = 0x10;

/// Object file name produced by the program build.
const PROGRAM_OBJECT: &str = "cordon-tc";

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("failed to load program object: {0}")]
    Load(#[from] aya::EbpfError),

    #[error("failed to attach program: {0}")]
    Program(#[from] aya::programs::ProgramError),

    #[error("map error: {0}")]
    Map(#[from] aya::maps::MapError),

    #[error("program {0} not found in object")]
    ProgramNotFound(&'static str),

    #[error("map {0} not found in object")]
    MapNotFound(&'static str),

    #[error("TC setup failed: {0}")]
    Tc(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("out of jump map slots")]
    OutOfSlots,
}

pub type Result<T> = std::result::Result<T, AttachError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Ingress,
    Egress,
}

/// Loader-wide parameters shared by every attachment.
#[derive(Debug, Clone)]
pub struct AttachParams {
    pub programs_path: PathBuf,
    pub pin_dir: PathBuf,
    pub host_ip: Ipv4Addr,
    pub tunnel_mtu: u16,
    pub overlay_port: u16,
    pub log_level: u32,
    pub dsr: bool,
    /// Default endpoint-to-host action is drop.
    pub drop_workload_to_host: bool,
}

/// One live attachment: keeps the loaded object (and with it the
/// verifier-approved programs) alive.
pub struct Attachment {
    pub iface: String,
    pub hook: Hook,
    pub jump_base: u32,
    pub workload: bool,
    ebpf: Ebpf,
}

pub struct Attacher {
    params: AttachParams,
    /// Free jump-map base slots.
    free_slots: Vec<u32>,
    attachments: HashMap<(String, Hook), Attachment>,
}

impl Attacher {
    pub fn new(params: AttachParams) -> Self {
        let mut free_slots: Vec<u32> = (0..JUMP_MAP_ENTRIES / JUMP_SLOTS_PER_ATTACH)
            .map(|i| i * JUMP_SLOTS_PER_ATTACH)
            .collect();
        free_slots.reverse();
        Self {
            params,
            free_slots,
            attachments: HashMap::new(),
        }
    }

    fn object_path(&self) -> PathBuf {
        self.params.programs_path.join(PROGRAM_OBJECT)
    }

    /// Load the object once without attaching so the shared maps are
    /// created and pinned before anything opens them.
    pub fn ensure_maps(&self) -> Result<()> {
        std::fs::create_dir_all(&self.params.pin_dir)
            .map_err(|e| AttachError::Tc(format!("failed to create pin dir: {e}")))?;
        let _ebpf = self.load_object(0, 0)?;
        info!(pin_dir = %self.params.pin_dir.display(), "shared maps materialized");
        Ok(())
    }

    /// Load a specialized instance of the program object.
    fn load_object(&self, flavor: u32, jump_base: u32) -> Result<Ebpf> {
        let host_ip = u32::from_ne_bytes(self.params.host_ip.octets());
        let tunnel_mtu = u32::from(self.params.tunnel_mtu);
        let overlay_port = u32::from(self.params.overlay_port);
        let mut loader = EbpfLoader::new();
        loader
            .map_pin_path(&self.params.pin_dir)
            .set_global("HOST_IP", &host_ip, true)
            .set_global("FLAVOR", &flavor, true)
            .set_global("TUNNEL_MTU", &tunnel_mtu, true)
            .set_global("OVERLAY_PORT", &overlay_port, true)
            .set_global("LOG_LEVEL", &self.params.log_level, true)
            .set_global("JUMP_BASE", &jump_base, true);
        Ok(loader.load_file(self.object_path())?)
    }

    /// Is the program attached at (iface, hook)?
    pub fn is_attached(&self, iface: &str, hook: Hook) -> bool {
        self.attachments.contains_key(&(iface.to_string(), hook))
    }

    pub fn jump_base(&self, iface: &str, hook: Hook) -> Option<u32> {
        self.attachments
            .get(&(iface.to_string(), hook))
            .map(|a| a.jump_base)
    }

    /// Attach the pipeline to one hook of one interface.
    pub fn attach(&mut self, iface: &str, workload: bool, hook: Hook) -> Result<u32> {
        if let Some(existing) = self.attachments.get(&(iface.to_string(), hook)) {
            return Ok(existing.jump_base);
        }

        let jump_base = self.free_slots.pop().ok_or(AttachError::OutOfSlots)?;
        let mut flavor = 0;
        if hook == Hook::Ingress {
            flavor |= F_TO_HOST;
        }
        if workload {
            flavor |= F_WORKLOAD;
        }
        if self.params.dsr {
            flavor |= F_DSR;
        }
        if self.params.drop_workload_to_host {
            flavor |= F_DROP_WL_TO_HOST;
        }

        let mut ebpf = match self.load_object(flavor, jump_base) {
            Ok(ebpf) => ebpf,
            Err(e) => {
                self.free_slots.push(jump_base);
                return Err(e);
            }
        };

        // clsact may already be there from a previous run.
        if let Err(e) = tc::qdisc_add_clsact(iface) {
            if !e.to_string().contains("exists") {
                self.free_slots.push(jump_base);
                return Err(AttachError::Tc(format!(
                    "failed to add clsact qdisc to {iface}: {e}"
                )));
            }
        }

        let result = Self::load_and_wire(&mut ebpf, iface, hook, jump_base, workload);
        if let Err(e) = result {
            self.free_slots.push(jump_base);
            return Err(e);
        }

        info!(iface, ?hook, jump_base, workload, "TC programs attached");
        self.attachments.insert(
            (iface.to_string(), hook),
            Attachment {
                iface: iface.to_string(),
                hook,
                jump_base,
                workload,
                ebpf,
            },
        );
        Ok(jump_base)
    }

    fn load_and_wire(
        ebpf: &mut Ebpf,
        iface: &str,
        hook: Hook,
        jump_base: u32,
        workload: bool,
    ) -> Result<()> {
        // Tail-call targets first: load them and fill the jump slots
        // before tc_main can be invoked.
        let accepted_fd = {
            let prog: &mut SchedClassifier = ebpf
                .program_mut("tc_accepted")
                .ok_or(AttachError::ProgramNotFound("tc_accepted"))?
                .try_into()?;
            prog.load()?;
            prog.fd()?.try_clone()?
        };
        let icmp_fd = {
            let prog: &mut SchedClassifier = ebpf
                .program_mut("tc_icmp")
                .ok_or(AttachError::ProgramNotFound("tc_icmp"))?
                .try_into()?;
            prog.load()?;
            prog.fd()?.try_clone()?
        };
        // Pre-policy default: deny for workloads, allow for host
        // interfaces, until the policy manager swaps in the real one.
        let stub = if workload {
            "tc_policy_deny"
        } else {
            "tc_policy_allow"
        };
        let policy_fd = {
            let prog: &mut SchedClassifier = ebpf
                .program_mut(stub)
                .ok_or(AttachError::ProgramNotFound("tc_policy stub"))?
                .try_into()?;
            prog.load()?;
            prog.fd()?.try_clone()?
        };

        {
            let map = ebpf
                .map_mut("cordon_jump")
                .ok_or(AttachError::MapNotFound("cordon_jump"))?;
            let mut jump: ProgramArray<_> = ProgramArray::try_from(map)?;
            jump.set(jump_base + PROG_INDEX_POLICY, &policy_fd, 0)?;
            jump.set(jump_base + PROG_INDEX_ACCEPTED, &accepted_fd, 0)?;
            jump.set(jump_base + PROG_INDEX_ICMP, &icmp_fd, 0)?;
        }

        let attach_type = match hook {
            Hook::Ingress => TcAttachType::Ingress,
            Hook::Egress => TcAttachType::Egress,
        };
        let prog: &mut SchedClassifier = ebpf
            .program_mut("tc_main")
            .ok_or(AttachError::ProgramNotFound("tc_main"))?
            .try_into()?;
        prog.load()?;
        prog.attach(iface, attach_type)?;
        Ok(())
    }

    /// Swap the rules-driven policy program into an attachment's
    /// policy slot (called once its rule block is programmed).
    pub fn install_policy_program(&mut self, iface: &str, hook: Hook) -> Result<()> {
        let Some(attachment) = self.attachments.get_mut(&(iface.to_string(), hook)) else {
            return Ok(());
        };
        let jump_base = attachment.jump_base;
        let policy_fd = {
            let prog: &mut SchedClassifier = attachment
                .ebpf
                .program_mut("tc_policy")
                .ok_or(AttachError::ProgramNotFound("tc_policy"))?
                .try_into()?;
            prog.load()?;
            prog.fd()?.try_clone()?
        };
        let map = attachment
            .ebpf
            .map_mut("cordon_jump")
            .ok_or(AttachError::MapNotFound("cordon_jump"))?;
        let mut jump: ProgramArray<_> = ProgramArray::try_from(map)?;
        jump.set(jump_base + PROG_INDEX_POLICY, &policy_fd, 0)?;
        debug!(iface, ?hook, jump_base, "policy program installed");
        Ok(())
    }

    /// Detach (drop) the programs for an interface and recycle its
    /// jump slots.
    pub fn detach(&mut self, iface: &str) {
        for hook in [Hook::Ingress, Hook::Egress] {
            if let Some(attachment) = self.attachments.remove(&(iface.to_string(), hook)) {
                self.free_slots.push(attachment.jump_base);
                info!(iface, ?hook, "TC programs detached");
                drop(attachment);
            }
        }
    }

    /// Interfaces that currently have both hooks attached.
    pub fn attached_ifaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .attachments
            .values()
            .map(|a| a.iface.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Remove stale pins from a previous run (called when fast-path mode
/// is disabled so leftover programs cannot keep policing traffic).
pub fn clean_up_pins(pin_dir: &Path) {
    if pin_dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(pin_dir) {
            tracing::warn!(error = %e, "failed to remove stale program pins");
        }
    }
}
