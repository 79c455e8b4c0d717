use std::fmt::Debug;
use std::path::Path;

use crate::bridge::EventBridge;
use crate::{WatchHandle, WatcherError};

#[cfg(target_os = "linux")]
pub use linux::InotifyBackend as NativeBackend;
#[cfg(windows)]
pub use windows::WindowsBackend as NativeBackend;

#[cfg(not(any(target_os = "linux", windows)))]
compile_error!("pathwatcher supports only linux (inotify) and windows");

#[cfg(target_os = "linux")]
mod linux;
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) mod notify_records;
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) mod rename;
#[cfg(windows)]
mod windows;

/// Native change notification facility
///
/// `init` and `run_loop` are called on the dedicated worker thread, the
/// rest is called from consumer thread while worker may be blocked in its wait.
pub trait PlatformBackend: Debug + Send + Sync + 'static {
    /// One-time setup of native notification channel
    fn init(&self) -> Result<(), WatcherError>;

    /// Installs watch on a single existing file or directory
    ///
    /// Returns `LimitReached` when native watch limit is exhausted and
    /// `InvalidHandle` for every other failure.
    fn add_watch(&self, path: &Path) -> Result<WatchHandle, WatcherError>;

    /// Requests cancellation of a watch
    ///
    /// Native resources may be released later, when worker loop notices it.
    fn remove_watch(&self, handle: WatchHandle);

    /// Waits for native notifications and posts each translated event to bridge
    ///
    /// Returns `Ok` after `shutdown` or when bridge is closed, error means
    /// worker can't continue and no more events will be delivered.
    fn run_loop(&self, bridge: &EventBridge) -> Result<(), WatcherError>;

    /// Wakes up `run_loop` and makes it return
    fn shutdown(&self);
}
