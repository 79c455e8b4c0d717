use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::{ListenerId, PathEvent};

#[derive(Debug)]
struct Polled<T> {
    path: PathBuf,

    /// Modification time seen by the last tick
    modified: Option<SystemTime>,

    token: T,
}

/// Detects changes by comparing modification time of every polled path
///
/// Used for paths that can't be watched natively once watch limit is
/// reached. Nothing happens until `tick` is called.
#[derive(Debug)]
pub struct StatPoll<T> {
    polled: BTreeMap<ListenerId, Polled<T>>,
}

impl<T> StatPoll<T> {
    pub fn new() -> Self {
        StatPoll {
            polled: BTreeMap::new(),
        }
    }

    /// Starts polling path, it must exist
    pub fn add(&mut self, id: ListenerId, path: &Path, token: T) -> io::Result<()> {
        let modified = fs::symlink_metadata(path)?.modified().ok();
        self.polled.insert(
            id,
            Polled {
                path: path.to_path_buf(),
                modified,
                token,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, id: ListenerId) -> Option<T> {
        self.polled.remove(&id).map(|p| p.token)
    }

    pub fn has(&self, id: ListenerId) -> bool {
        self.polled.contains_key(&id)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.polled.values().map(|p| p.path.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.polled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polled.is_empty()
    }

    pub fn clear(&mut self) {
        self.polled.clear();
    }

    /// Checks every polled path and reports its change
    ///
    /// Path that no longer exists is reported as deleted and is not polled
    /// anymore. Returns number of reported events.
    pub fn tick<F: FnMut(&mut T, &PathEvent)>(&mut self, mut report: F) -> usize {
        let mut reported = 0;
        let mut deleted = vec![];
        for (id, polled) in self.polled.iter_mut() {
            let metadata = match fs::symlink_metadata(&polled.path) {
                Ok(metadata) => metadata,
                Err(_) => {
                    report(&mut polled.token, &PathEvent::Delete);
                    reported += 1;
                    deleted.push(*id);
                    continue;
                }
            };

            let modified = metadata.modified().ok();
            if modified > polled.modified {
                report(&mut polled.token, &PathEvent::Change);
                reported += 1;
            }
            polled.modified = modified;
        }

        for id in deleted {
            if let Some(polled) = self.polled.remove(&id) {
                log::debug!("{} is gone, stopped polling it", polled.path.display());
            }
        }
        reported
    }
}

impl<T> Default for StatPoll<T> {
    fn default() -> Self {
        StatPoll::new()
    }
}
