use crate::platform::notify_records::{NotifyAction, NotifyRecord};
use crate::{EventKind, EventRecord, WatchHandle};

/// Names are joined as Windows paths, where `/` is also accepted as separator
const SEPARATOR: u8 = b'\\';

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RenameState {
    #[default]
    Idle,
    /// Old name of a rename, waiting for the new name record
    PendingOld(Vec<u8>),
}

/// Pairs renamed-from and renamed-to records into one `ChildRename` event
///
/// Renamed-from must be immediately followed by renamed-to in the same batch,
/// otherwise the old name is dropped without emitting anything.
#[derive(Debug, Default)]
pub struct RenameCorrelator {
    state: RenameState,
}

impl RenameCorrelator {
    pub fn state(&self) -> &RenameState {
        &self.state
    }

    /// Translates one decoded batch of records into events
    ///
    /// `parent` is path of watched directory, child names are joined to it.
    pub fn translate(
        &mut self,
        handle: WatchHandle,
        parent: &[u8],
        records: &[NotifyRecord],
    ) -> Vec<EventRecord> {
        self.reset();
        let events = records
            .iter()
            .filter_map(|record| {
                let path = join(parent, &record.name.to_string_lossy());
                self.feed(handle, record.action, path)
            })
            .collect();
        self.reset();
        events
    }

    /// Feeds single record, returns event if this record completes one
    pub fn feed(
        &mut self,
        handle: WatchHandle,
        action: NotifyAction,
        path: Vec<u8>,
    ) -> Option<EventRecord> {
        let kind = match action {
            NotifyAction::RenamedOldName => {
                self.reset();
                self.state = RenameState::PendingOld(path);
                return None;
            }
            NotifyAction::RenamedNewName => {
                let old_path = match std::mem::take(&mut self.state) {
                    RenameState::PendingOld(old_path) => old_path,
                    // moved in from outside of watched directory
                    RenameState::Idle => vec![],
                };
                return Some(EventRecord::renamed(handle, path, old_path));
            }
            NotifyAction::Added => EventKind::ChildCreate,
            NotifyAction::Removed => EventKind::ChildDelete,
            NotifyAction::Modified => EventKind::ChildChange,
            NotifyAction::Other(action) => {
                log::debug!("skipping unknown notification action {}", action);
                self.reset();
                return None;
            }
        };
        self.reset();
        Some(EventRecord::with_path(kind, handle, path))
    }

    /// Drops pending old name if there is one
    pub fn reset(&mut self) {
        if let RenameState::PendingOld(old_path) = std::mem::take(&mut self.state) {
            log::debug!(
                "dropping unmatched rename of {}",
                String::from_utf8_lossy(&old_path)
            );
        }
    }
}

fn join(parent: &[u8], name: &str) -> Vec<u8> {
    let mut path = Vec::with_capacity(parent.len() + 1 + name.len());
    path.extend_from_slice(parent);
    if !matches!(path.last(), None | Some(&SEPARATOR) | Some(&b'/')) {
        path.push(SEPARATOR);
    }
    path.extend_from_slice(name.as_bytes());
    path
}
