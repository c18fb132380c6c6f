//! cordon-dataplane: per-node network policy dataplane agent.
//!
//! The agent consumes a stream of desired-state messages (endpoints,
//! policies, IP sets, services, host metadata) and reconciles them
//! into the kernel: iptables chains, IP sets, routing tables, shared
//! BPF maps and the TC programs that implement conntrack-aware policy,
//! service NAT and VXLAN overlay on the fast path.
//!
//! # Architecture
//!
//! ```text
//! desired-state msgs --> driver --> managers (absorb, then program)
//!                          |            |
//!                          |            +--> renderer --> table writers
//!                          |            +--> IP-set / route writers
//!                          |            +--> BPF maps + TC attach
//!                          +--> status msgs out
//! ```

pub mod attach;
pub mod config;
pub mod driver;
pub mod ifacemonitor;
pub mod iptables;
pub mod ipsets;
pub mod kernel;
pub mod managers;
pub mod maps;
pub mod marks;
pub mod mtu;
pub mod proto;
pub mod render;
pub mod routetable;
pub mod staticcfg;
pub mod throttle;

// Re-export the pieces main.rs wires together.
pub use config::Config;
pub use driver::Dataplane;
pub use proto::{Status, Update};
