use std::borrow::Cow;
use std::fmt::{Display, Formatter};

#[cfg(windows)]
type RawHandle = isize;
#[cfg(not(windows))]
type RawHandle = i32;

/// Opaque identifier of one active watch
///
/// On Linux this is the inotify watch descriptor, on Windows it is the value
/// of the event object that signals completion of the watch's pending read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchHandle(RawHandle);

impl WatchHandle {
    pub fn from_raw(raw: RawHandle) -> Self {
        WatchHandle(raw)
    }

    pub fn as_raw(&self) -> RawHandle {
        self.0
    }
}

impl Display for WatchHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    None,
    Change,
    Delete,
    Rename,
    ChildCreate,
    ChildChange,
    ChildDelete,
    ChildRename,
    Unknown,
}

impl EventKind {
    /// Name under which this kind is reported to embedding code
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::None => "none",
            EventKind::Change => "change",
            EventKind::Delete => "delete",
            EventKind::Rename => "rename",
            EventKind::ChildCreate => "child-create",
            EventKind::ChildChange => "child-change",
            EventKind::ChildDelete => "child-delete",
            EventKind::ChildRename => "child-rename",
            EventKind::Unknown => "unknown",
        }
    }

    /// `None` and `Unknown` never reach the event sink
    pub fn is_deliverable(&self) -> bool {
        !matches!(self, EventKind::None | EventKind::Unknown)
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One detected change, produced by a backend and consumed exactly once
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub kind: EventKind,
    pub handle: WatchHandle,
    pub new_path: Vec<u8>,
    /// Empty unless this is a rename
    pub old_path: Vec<u8>,
}

impl EventRecord {
    pub fn new(kind: EventKind, handle: WatchHandle) -> Self {
        EventRecord {
            kind,
            handle,
            new_path: vec![],
            old_path: vec![],
        }
    }

    pub fn with_path(kind: EventKind, handle: WatchHandle, new_path: Vec<u8>) -> Self {
        EventRecord {
            kind,
            handle,
            new_path,
            old_path: vec![],
        }
    }

    pub fn renamed(handle: WatchHandle, new_path: Vec<u8>, old_path: Vec<u8>) -> Self {
        EventRecord {
            kind: EventKind::ChildRename,
            handle,
            new_path,
            old_path,
        }
    }

    pub fn new_path_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.new_path)
    }

    pub fn old_path_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.old_path)
    }
}

impl Display for EventRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.kind, self.handle)?;
        if !self.new_path.is_empty() {
            write!(f, " {}", self.new_path_lossy())?;
        }
        if !self.old_path.is_empty() {
            write!(f, " (from {})", self.old_path_lossy())?;
        }
        Ok(())
    }
}
