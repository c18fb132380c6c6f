//! IP-sets manager: translates membership messages into writer
//! operations. The create-before-reference / delete-after-dereference
//! ordering is the driver's job (set additions apply before the table
//! writers, deletions after); this manager only has to route the
//! messages and police the size limit.

use tracing::warn;

use crate::proto::Update;

use super::{DataplaneManager, Result, SharedIpSets};

pub struct IpSetsManager {
    writer: SharedIpSets,
    max_size: usize,
}

impl IpSetsManager {
    pub fn new(writer: SharedIpSets, max_size: usize) -> Self {
        Self { writer, max_size }
    }

    fn capped(&self, id: &str, mut members: Vec<String>) -> Vec<String> {
        if members.len() > self.max_size {
            warn!(
                set = id,
                members = members.len(),
                max = self.max_size,
                "IP set over configured maximum size, truncating"
            );
            members.truncate(self.max_size);
        }
        members
    }
}

impl DataplaneManager for IpSetsManager {
    fn on_update(&mut self, update: &Update) {
        match update {
            Update::IpSet { id, kind, members } => {
                let members = self.capped(id, members.clone());
                self.writer
                    .lock()
                    .unwrap()
                    .add_or_replace_members(id, *kind, members);
            }
            Update::IpSetDelta { id, added, removed } => {
                let mut writer = self.writer.lock().unwrap();
                writer.add_members(id, added.clone());
                writer.remove_members(id, removed.clone());
            }
            Update::IpSetRemove { id } => {
                self.writer.lock().unwrap().remove_set(id);
            }
            _ => {}
        }
    }

    async fn complete_deferred_work(&mut self) -> Result<()> {
        // Writes happen in the driver's writer phases.
        Ok(())
    }
}
