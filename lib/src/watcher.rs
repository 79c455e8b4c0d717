use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use derivative::Derivative;
use thiserror::Error;

use crate::bridge::{Delivery, EventBridge, Signal};
use crate::keep_alive::KeepAlive;
use crate::platform::{NativeBackend, PlatformBackend};
use crate::{EventRecord, HandleMap, HandleMapError, WatchHandle};

/// Size of buffer used for reading native notifications
pub const DEFAULT_BUFFER_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum WatcherError {
    /// Native watch limit is reached, watching may succeed after other watches are removed
    #[error("EMFILE: Unable to watch path")]
    LimitReached,

    /// Path doesn't exist, can't be watched or access was denied
    #[error("Unable to watch path: {0}")]
    InvalidHandle(#[source] io::Error),

    #[error("watcher is not running")]
    NotRunning,

    /// Worker thread stopped, no more events will be delivered
    #[error("watcher stopped: {0}")]
    Fatal(String),

    #[error(transparent)]
    Registry(#[from] HandleMapError),
}

#[derive(Clone, Debug)]
pub struct WatcherConfig {
    /// Length (in bytes) of buffer for native notifications
    pub buffer_len: usize,

    /// Name of worker thread
    pub thread_name: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            buffer_len: DEFAULT_BUFFER_LEN,
            thread_name: "pathwatcher".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct WatcherBuilder {
    config: WatcherConfig,
}

impl WatcherBuilder {
    pub fn buffer_len(mut self, buffer_len: usize) -> Self {
        self.config.buffer_len = buffer_len;
        self
    }

    pub fn thread_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.thread_name = name.into();
        self
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Creates uninitialized watcher with native backend of current platform
    pub fn build(self) -> Watcher {
        Watcher::new(self.config)
    }

    pub fn build_with<B: PlatformBackend>(self, backend: B) -> Watcher<B> {
        Watcher::with_backend(backend, self.config)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatcherState {
    Uninitialized,
    Ready,
    /// Ready and has at least one active watch
    Watching,
    Failed,
    ShuttingDown,
}

/// Outcome of processing one item from worker thread
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Event was passed to sink
    Delivered,
    /// Event was dropped (watch is no longer active or there is no sink)
    Discarded,
    /// Nothing was pending
    Idle,
}

#[derive(Debug)]
struct WatchEntry {
    path: PathBuf,
}

pub type EventSink = Box<dyn FnMut(&EventRecord)>;

/// Owns worker thread and delivers its events on consumer thread
///
/// Consumer thread is the one that owns `Watcher`. It installs watches and
/// drives delivery with `process_next` or `try_process_next`.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Watcher<B: PlatformBackend = NativeBackend> {
    config: WatcherConfig,

    backend: Arc<B>,

    bridge: Arc<EventBridge>,

    /// All active watches
    handles: HandleMap<WatchEntry>,

    #[derivative(Debug = "ignore")]
    sink: Option<EventSink>,

    keep_alive: KeepAlive,

    state: WatcherState,

    worker: Option<JoinHandle<()>>,
}

impl Watcher<NativeBackend> {
    pub fn new(config: WatcherConfig) -> Self {
        let backend = NativeBackend::new(&config);
        Watcher::with_backend(backend, config)
    }
}

impl<B: PlatformBackend> Watcher<B> {
    pub fn with_backend(backend: B, config: WatcherConfig) -> Self {
        Watcher {
            config,
            backend: Arc::new(backend),
            bridge: Arc::new(EventBridge::new()),
            handles: HandleMap::new(),
            sink: None,
            keep_alive: KeepAlive::default(),
            state: WatcherState::Uninitialized,
            worker: None,
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn state(&self) -> WatcherState {
        match self.state {
            WatcherState::Ready if self.keep_alive.is_active() => WatcherState::Watching,
            state => state,
        }
    }

    /// Spawns worker thread and waits until backend is initialized
    pub fn init(&mut self) -> Result<(), WatcherError> {
        match self.state {
            WatcherState::Uninitialized => {}
            WatcherState::Ready | WatcherState::Watching => return Ok(()),
            WatcherState::Failed | WatcherState::ShuttingDown => {
                return Err(WatcherError::NotRunning)
            }
        }

        let backend = Arc::clone(&self.backend);
        let bridge = Arc::clone(&self.bridge);
        let worker = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || run_worker(backend, bridge))
            .map_err(|e| {
                self.state = WatcherState::Failed;
                WatcherError::Fatal(format!("unable to spawn worker thread: {}", e))
            })?;
        self.worker = Some(worker);

        let signal = self.bridge.receive().map(|delivery| delivery.signal().clone());
        match signal {
            Some(Signal::Ready) => {
                log::debug!("watcher is ready");
                self.state = WatcherState::Ready;
                Ok(())
            }
            Some(Signal::Fatal(reason)) => {
                self.fail();
                Err(WatcherError::Fatal(reason))
            }
            Some(Signal::Event(record)) => {
                self.fail();
                Err(WatcherError::Fatal(format!(
                    "event {} received before worker was ready",
                    record
                )))
            }
            None => {
                self.fail();
                Err(WatcherError::Fatal("worker exited during startup".to_string()))
            }
        }
    }

    /// Sets callback that receives every delivered event, replacing previous one
    pub fn set_event_sink<F: FnMut(&EventRecord) + 'static>(&mut self, sink: F) {
        self.sink = Some(Box::new(sink));
    }

    /// Sets callback that is notified when first watch is added (`true`)
    /// and when last one is removed (`false`)
    pub fn set_keep_alive_hook<F: FnMut(bool) + 'static>(&mut self, hook: F) {
        self.keep_alive.set_hook(hook);
    }

    pub fn active_watches(&self) -> usize {
        self.keep_alive.count()
    }

    /// Returns `true` while at least one watch is active
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive.is_active()
    }

    pub fn is_watching(&self, handle: WatchHandle) -> bool {
        self.handles.has(handle)
    }

    /// All active watches in ascending order
    pub fn watched_handles(&self) -> Vec<WatchHandle> {
        let mut handles = self.handles.handles();
        handles.sort();
        handles
    }

    /// Path that was used when watch was installed
    pub fn watched_path(&self, handle: WatchHandle) -> Option<&Path> {
        self.handles.get(handle).ok().map(|e| e.path.as_path())
    }

    pub fn watch<P: AsRef<Path>>(&mut self, path: P) -> Result<WatchHandle, WatcherError> {
        self.ensure_running()?;
        let path = path.as_ref();

        let handle = self.backend.add_watch(path)?;
        if self.handles.has(handle) {
            // same native object is already watched (possibly through other path),
            // single unwatch removes it
            log::debug!("{} is already watched with handle {}", path.display(), handle);
            return Ok(handle);
        }
        self.handles.add(
            handle,
            WatchEntry {
                path: path.to_path_buf(),
            },
        )?;
        self.keep_alive.acquire();
        log::debug!("watching {} with handle {}", path.display(), handle);

        Ok(handle)
    }

    /// Removes watch previously returned by `watch`
    ///
    /// Native watch is removed even if `watch` returned this handle several
    /// times. No events with this handle are delivered after this call.
    pub fn unwatch(&mut self, handle: WatchHandle) -> Result<(), WatcherError> {
        if matches!(
            self.state,
            WatcherState::Uninitialized | WatcherState::ShuttingDown
        ) {
            return Err(WatcherError::NotRunning);
        }

        let entry = self.handles.remove(handle)?;
        self.backend.remove_watch(handle);
        self.keep_alive.release();
        log::debug!("stopped watching {}", entry.path.display());

        Ok(())
    }

    /// Blocks until worker posts next event and delivers it to sink
    ///
    /// Fatal worker error is returned once, after that watcher is not running.
    pub fn process_next(&mut self) -> Result<Dispatch, WatcherError> {
        self.ensure_running()?;
        let bridge = Arc::clone(&self.bridge);
        // delivery borrows bridge so it must be released first
        let dispatch = match bridge.receive() {
            Some(delivery) => self.dispatch(delivery),
            None => {
                self.fail();
                Err(WatcherError::NotRunning)
            }
        };
        dispatch
    }

    /// Delivers pending event if there is one, never blocks
    pub fn try_process_next(&mut self) -> Result<Dispatch, WatcherError> {
        self.ensure_running()?;
        let bridge = Arc::clone(&self.bridge);
        // delivery borrows bridge so it must be released first
        let dispatch = match bridge.try_receive() {
            Some(delivery) => self.dispatch(delivery),
            None => Ok(Dispatch::Idle),
        };
        dispatch
    }

    /// Stops worker thread, all watches are released
    ///
    /// Also called on drop.
    pub fn shutdown(&mut self) {
        if self.state == WatcherState::ShuttingDown {
            return;
        }
        self.state = WatcherState::ShuttingDown;

        self.bridge.close();
        self.backend.shutdown();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("watcher worker thread panicked");
            }
        }
        self.handles.clear();
    }

    fn dispatch(&mut self, delivery: Delivery<'_>) -> Result<Dispatch, WatcherError> {
        let reason = match delivery.signal() {
            Signal::Event(record) => return Ok(self.deliver(record)),
            Signal::Ready => return Ok(Dispatch::Discarded),
            Signal::Fatal(reason) => reason.clone(),
        };
        // worker must be released before it can be joined
        drop(delivery);
        log::error!("watcher stopped: {}", reason);
        self.fail();
        Err(WatcherError::Fatal(reason))
    }

    fn deliver(&mut self, record: &EventRecord) -> Dispatch {
        if !record.kind.is_deliverable() {
            return Dispatch::Discarded;
        }
        if !self.handles.has(record.handle) {
            log::debug!("discarding {} for inactive watch", record);
            return Dispatch::Discarded;
        }
        match self.sink.as_mut() {
            Some(sink) => {
                sink(record);
                Dispatch::Delivered
            }
            None => Dispatch::Discarded,
        }
    }

    fn ensure_running(&self) -> Result<(), WatcherError> {
        match self.state {
            WatcherState::Ready | WatcherState::Watching => Ok(()),
            _ => Err(WatcherError::NotRunning),
        }
    }

    fn fail(&mut self) {
        self.state = WatcherState::Failed;
        self.bridge.close();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl<B: PlatformBackend> Drop for Watcher<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<B: PlatformBackend>(backend: Arc<B>, bridge: Arc<EventBridge>) {
    if let Err(e) = backend.init() {
        log::error!("unable to initialize watcher backend: {}", e);
        let _ = bridge.post_fatal(fatal_reason(e));
        return;
    }
    if bridge.post_ready().is_err() {
        return;
    }

    match backend.run_loop(&bridge) {
        Ok(()) => log::debug!("watcher worker finished"),
        Err(e) => {
            log::error!("watcher worker failed: {}", e);
            let _ = bridge.post_fatal(fatal_reason(e));
        }
    }
}

fn fatal_reason(e: WatcherError) -> String {
    match e {
        WatcherError::Fatal(reason) => reason,
        other => other.to_string(),
    }
}
