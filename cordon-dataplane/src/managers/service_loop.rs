//! Service-loop prevention.
//!
//! Traffic destined to a service VIP that was not handled by NAT
//! would otherwise be routed back out and loop between nodes; drop
//! rules covering the configured VIP CIDRs close that off.

use ipnet::Ipv4Net;

use crate::proto::Update;
use crate::render::{self, Action, Match, Rule, CHAIN_SERVICE_LOOP};

use super::{DataplaneManager, Result, SharedTable};

pub struct ServiceLoopManager {
    filter_table: SharedTable,
    cidrs: Vec<Ipv4Net>,
    programmed: bool,
}

impl ServiceLoopManager {
    pub fn new(filter_table: SharedTable, cidrs: Vec<Ipv4Net>) -> Self {
        Self {
            filter_table,
            cidrs,
            programmed: false,
        }
    }
}

impl DataplaneManager for ServiceLoopManager {
    fn on_update(&mut self, _update: &Update) {
        // The protected CIDRs come from configuration, not the
        // desired-state stream.
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        if self.programmed {
            return Ok(());
        }
        let mut table = self.filter_table.lock().unwrap();
        table.update_chain(render::service_loop_chain(&self.cidrs));
        table.append_rules(
            "FORWARD",
            vec![Rule::new(
                Match::new(),
                Action::Jump(CHAIN_SERVICE_LOOP.to_string()),
            )],
        );
        self.programmed = true;
        Ok(())
    }
}
