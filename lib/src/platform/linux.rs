use std::collections::HashMap;
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use derivative::Derivative;
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use nix::errno::Errno;
use nix::libc::{EMFILE, ENFILE, ENOSPC};
use nix::poll::{poll, PollFd, PollFlags};
use parking_lot::Mutex;

use crate::bridge::EventBridge;
use crate::platform::PlatformBackend;
use crate::{EventKind, EventRecord, WatchHandle, WatcherConfig, WatcherError};

struct InotifyState {
    inotify: Inotify,

    /// Written to when worker loop must wake up
    wake_tx: UnixStream,
    wake_rx: UnixStream,

    watches: HashMap<WatchHandle, WatchDescriptor>,
}

impl InotifyState {
    /// Records result of inotify_add_watch
    fn register(
        &mut self,
        path: &Path,
        added: io::Result<WatchDescriptor>,
    ) -> Result<WatchHandle, WatcherError> {
        let wd = added.map_err(|e| {
            log::debug!("inotify_add_watch {}: {}", path.display(), e);
            watch_error(e)
        })?;

        let handle = WatchHandle::from_raw(wd.get_watch_descriptor_id());
        self.watches.insert(handle, wd);
        Ok(handle)
    }
}

/// Single inotify instance shared by all watches
///
/// Inotify doesn't report names of children at the level we watch them, so
/// only `Change` and `Delete` events are produced and their paths are empty.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct InotifyBackend {
    buffer_len: usize,

    #[derivative(Debug = "ignore")]
    state: Mutex<Option<InotifyState>>,

    should_stop: AtomicBool,
}

impl InotifyBackend {
    pub fn new(config: &WatcherConfig) -> Self {
        InotifyBackend {
            buffer_len: config.buffer_len,
            state: Mutex::new(None),
            should_stop: AtomicBool::new(false),
        }
    }

    fn raw_fds(&self) -> Result<(RawFd, RawFd), WatcherError> {
        let state = self.state.lock();
        let state = state.as_ref().ok_or(WatcherError::NotRunning)?;
        Ok((state.inotify.as_raw_fd(), state.wake_rx.as_raw_fd()))
    }

    /// Reads all available events without blocking
    fn read_events(&self, buffer: &mut [u8]) -> Result<Vec<EventRecord>, WatcherError> {
        let mut state = self.state.lock();
        let state = state.as_mut().ok_or(WatcherError::NotRunning)?;

        let events = match state.inotify.read_events(buffer) {
            Ok(events) => events,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                return Ok(vec![]);
            }
            Err(e) => return Err(WatcherError::Fatal(format!("read: {}", e))),
        };

        let mut records = vec![];
        for event in events {
            if event.mask.contains(EventMask::Q_OVERFLOW) {
                log::warn!("inotify queue overflowed, some events were lost");
                continue;
            }
            let handle = WatchHandle::from_raw(event.wd.get_watch_descriptor_id());
            if event.mask.contains(EventMask::IGNORED) {
                // watch was removed (explicitly or because file is gone) so remove it from our map
                if state.watches.get(&handle) == Some(&event.wd) {
                    state.watches.remove(&handle);
                }
            }
            match event_kind(event.mask) {
                EventKind::None => {}
                kind => records.push(EventRecord::new(kind, handle)),
            }
        }
        Ok(records)
    }
}

impl PlatformBackend for InotifyBackend {
    fn init(&self) -> Result<(), WatcherError> {
        let inotify =
            Inotify::init().map_err(|e| WatcherError::Fatal(format!("inotify_init: {}", e)))?;
        let (wake_tx, wake_rx) = UnixStream::pair()
            .and_then(|(tx, rx)| {
                tx.set_nonblocking(true)?;
                rx.set_nonblocking(true)?;
                Ok((tx, rx))
            })
            .map_err(|e| WatcherError::Fatal(format!("unable to create wake up channel: {}", e)))?;

        *self.state.lock() = Some(InotifyState {
            inotify,
            wake_tx,
            wake_rx,
            watches: HashMap::new(),
        });
        Ok(())
    }

    fn add_watch(&self, path: &Path) -> Result<WatchHandle, WatcherError> {
        let mut state = self.state.lock();
        let state = state.as_mut().ok_or(WatcherError::NotRunning)?;

        let added = state.inotify.watches().add(
            path,
            WatchMask::ATTRIB
                | WatchMask::CREATE
                | WatchMask::DELETE
                | WatchMask::MODIFY
                | WatchMask::MOVE
                | WatchMask::MOVE_SELF
                | WatchMask::DELETE_SELF,
        );
        state.register(path, added)
    }

    fn remove_watch(&self, handle: WatchHandle) {
        let mut state = self.state.lock();
        if let Some(state) = state.as_mut() {
            if let Some(wd) = state.watches.remove(&handle) {
                if let Err(e) = state.inotify.watches().remove(wd) {
                    // kernel already dropped it, for example after file was deleted
                    log::debug!("inotify_rm_watch {}: {}", handle, e);
                }
            }
        }
    }

    fn run_loop(&self, bridge: &EventBridge) -> Result<(), WatcherError> {
        let (inotify_fd, wake_fd) = self.raw_fds()?;
        // needs to be large enough for sizeof(inotify_event) + strlen(filename)
        let mut buffer = vec![0; self.buffer_len];

        while !self.should_stop.load(Ordering::SeqCst) {
            wait_readable(inotify_fd, wake_fd)?;
            if self.should_stop.load(Ordering::SeqCst) {
                break;
            }

            // lock is not held while posting so watches can be changed meanwhile
            for record in self.read_events(&mut buffer)? {
                if bridge.post(record).is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(state) = self.state.lock().as_mut() {
            if let Err(e) = state.wake_tx.write_all(&[1]) {
                log::debug!("unable to wake up watcher loop: {}", e);
            }
        }
    }
}

/// Maps inotify flags to event kind, `None` means event is ignored
///
/// Note that inotify won't tell us where the file or directory has been
/// moved to, so moving watched entry is treated as its deletion.
fn event_kind(mask: EventMask) -> EventKind {
    let changed = EventMask::ATTRIB
        | EventMask::CREATE
        | EventMask::DELETE
        | EventMask::MODIFY
        | EventMask::MOVED_FROM
        | EventMask::MOVED_TO;

    if mask.intersects(changed) {
        EventKind::Change
    } else if mask.intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF) {
        EventKind::Delete
    } else {
        EventKind::None
    }
}

fn watch_error(e: io::Error) -> WatcherError {
    match e.raw_os_error() {
        // ENOSPC is reported when max_user_watches is reached
        Some(ENOSPC) | Some(EMFILE) | Some(ENFILE) => WatcherError::LimitReached,
        _ => WatcherError::InvalidHandle(e),
    }
}

fn wait_readable(inotify_fd: RawFd, wake_fd: RawFd) -> Result<(), WatcherError> {
    let mut fds = [
        PollFd::new(inotify_fd, PollFlags::POLLIN),
        PollFd::new(wake_fd, PollFlags::POLLIN),
    ];
    loop {
        match poll(&mut fds, -1) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(WatcherError::Fatal(format!("poll: {}", e))),
        }
    }
}
