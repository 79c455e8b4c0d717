//! Scripted backend used by tests of platform independent code

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::bridge::EventBridge;
use crate::platform::PlatformBackend;
use crate::{EventRecord, WatchHandle, Watcher, WatcherBuilder, WatcherError};

#[derive(Debug)]
enum Command {
    Emit(EventRecord),
    Fail(String),
    Stop,
}

#[derive(Debug, Default)]
struct Script {
    commands: VecDeque<Command>,
    posted: usize,
    removed: Vec<WatchHandle>,
}

/// Shared between test and backend running on worker thread
#[derive(Debug, Default)]
pub struct MockControl {
    script: Mutex<Script>,
    changed: Condvar,
}

impl MockControl {
    pub fn emit(&self, record: EventRecord) {
        self.push(Command::Emit(record));
    }

    pub fn fail(&self, reason: &str) {
        self.push(Command::Fail(reason.to_string()));
    }

    /// Waits until worker started posting given number of events
    pub fn wait_posted(&self, count: usize) {
        let mut script = self.script.lock();
        while script.posted < count {
            self.changed.wait(&mut script);
        }
    }

    pub fn removed(&self) -> Vec<WatchHandle> {
        self.script.lock().removed.clone()
    }

    fn push(&self, command: Command) {
        self.script.lock().commands.push_back(command);
        self.changed.notify_all();
    }

    fn next_command(&self) -> Command {
        let mut script = self.script.lock();
        loop {
            if let Some(command) = script.commands.pop_front() {
                if matches!(command, Command::Emit(_)) {
                    script.posted += 1;
                    self.changed.notify_all();
                }
                return command;
            }
            self.changed.wait(&mut script);
        }
    }
}

/// Backend that hands out sequential handles and posts scripted events
///
/// Watching the same path twice returns the same handle, like inotify does.
/// Paths are case insensitive so `/A` is the same object as `/a`.
/// Paths containing "missing" can't be watched.
#[derive(Debug)]
pub struct MockBackend {
    control: Arc<MockControl>,
    fail_init: bool,
    limit: usize,
    watches: Mutex<(i32, HashMap<PathBuf, WatchHandle>)>,
}

impl MockBackend {
    pub fn new(limit: usize) -> (Self, Arc<MockControl>) {
        let control = Arc::new(MockControl::default());
        let backend = MockBackend {
            control: Arc::clone(&control),
            fail_init: false,
            limit,
            watches: Mutex::new((0, HashMap::new())),
        };
        (backend, control)
    }

    pub fn failing_init() -> Self {
        let (mut backend, _) = MockBackend::new(0);
        backend.fail_init = true;
        backend
    }
}

impl PlatformBackend for MockBackend {
    fn init(&self) -> Result<(), WatcherError> {
        if self.fail_init {
            Err(WatcherError::Fatal("init failed".to_string()))
        } else {
            Ok(())
        }
    }

    fn add_watch(&self, path: &Path) -> Result<WatchHandle, WatcherError> {
        if path.to_string_lossy().contains("missing") {
            return Err(WatcherError::InvalidHandle(io::Error::from(
                io::ErrorKind::NotFound,
            )));
        }
        let path = PathBuf::from(path.to_string_lossy().to_lowercase());
        let mut watches = self.watches.lock();
        if let Some(handle) = watches.1.get(&path) {
            return Ok(*handle);
        }
        if watches.1.len() >= self.limit {
            return Err(WatcherError::LimitReached);
        }
        watches.0 += 1;
        let handle = WatchHandle::from_raw(watches.0 as _);
        watches.1.insert(path, handle);
        Ok(handle)
    }

    fn remove_watch(&self, handle: WatchHandle) {
        self.watches.lock().1.retain(|_, h| *h != handle);
        self.control.script.lock().removed.push(handle);
    }

    fn run_loop(&self, bridge: &EventBridge) -> Result<(), WatcherError> {
        loop {
            match self.control.next_command() {
                Command::Emit(record) => {
                    if bridge.post(record).is_err() {
                        return Ok(());
                    }
                }
                Command::Fail(reason) => return Err(WatcherError::Fatal(reason)),
                Command::Stop => return Ok(()),
            }
        }
    }

    fn shutdown(&self) {
        self.control.push(Command::Stop);
    }
}

/// Uninitialized watcher over mock backend that allows `limit` watches
pub fn mock_watcher(limit: usize) -> (Watcher<MockBackend>, Arc<MockControl>) {
    let (backend, control) = MockBackend::new(limit);
    (WatcherBuilder::default().build_with(backend), control)
}
