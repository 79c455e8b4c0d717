#![warn(rust_2018_idioms, missing_debug_implementations)]

pub use bridge::{BridgeClosed, Delivery, EventBridge, Signal};
pub use event::{EventKind, EventRecord, WatchHandle};
pub use handle_map::{HandleMap, HandleMapError};
pub use path_watcher::{ListenerId, PathCallback, PathEvent, PathWatchers, WatchMode};
pub use platform::{NativeBackend, PlatformBackend};
pub use stat_poll::StatPoll;
pub use watcher::{
    Dispatch, EventSink, Watcher, WatcherBuilder, WatcherConfig, WatcherError, WatcherState,
    DEFAULT_BUFFER_LEN,
};

mod bridge;
mod event;
mod handle_map;
mod keep_alive;
mod path_watcher;
mod platform;
mod stat_poll;
#[cfg(test)]
mod testing;
mod watcher;
