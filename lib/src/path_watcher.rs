use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use derivative::Derivative;

use crate::platform::{NativeBackend, PlatformBackend};
use crate::stat_poll::StatPoll;
use crate::{
    Dispatch, EventKind, EventRecord, HandleMap, HandleMapError, WatchHandle, Watcher,
    WatcherError,
};

/// Change of a watched path as seen by its listener
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathEvent {
    Change,
    Delete,
    Rename { new_path: PathBuf },
}

impl Display for PathEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PathEvent::Change => write!(f, "change"),
            PathEvent::Delete => write!(f, "delete"),
            PathEvent::Rename { new_path } => write!(f, "rename to {}", new_path.display()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl Display for ListenerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type PathCallback = Box<dyn FnMut(&PathEvent)>;

/// How paths are watched
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WatchMode {
    /// Native watches until watch limit is reached, polling after that
    #[default]
    Auto,
    /// Native watches only, reaching the limit is an error
    Watch,
    /// Polling only
    Poll,
}

#[derive(Derivative)]
#[derivative(Debug)]
struct Listener {
    id: ListenerId,

    path: PathBuf,

    /// File is watched through its parent directory
    watching_parent: bool,

    #[derivative(Debug = "ignore")]
    callback: PathCallback,
}

impl Listener {
    /// Converts native event to the one this listener cares about
    fn translate(&self, record: &EventRecord) -> Option<PathEvent> {
        let new_path = || PathBuf::from(record.new_path_lossy().into_owned());
        match record.kind {
            EventKind::Change => Some(PathEvent::Change),
            EventKind::Delete => Some(PathEvent::Delete),
            EventKind::Rename => Some(PathEvent::Rename {
                new_path: new_path(),
            }),
            EventKind::ChildRename if self.watching_parent => {
                let old_path = PathBuf::from(record.old_path_lossy().into_owned());
                (self.path == old_path).then(|| PathEvent::Rename {
                    new_path: new_path(),
                })
            }
            EventKind::ChildDelete if self.watching_parent => {
                (self.path == new_path()).then_some(PathEvent::Delete)
            }
            EventKind::ChildChange => {
                (self.watching_parent && self.path == new_path()).then_some(PathEvent::Change)
            }
            EventKind::ChildCreate if self.watching_parent => None,
            EventKind::ChildRename | EventKind::ChildDelete | EventKind::ChildCreate => {
                Some(PathEvent::Change)
            }
            EventKind::None | EventKind::Unknown => None,
        }
    }
}

/// All listeners sharing single native watch
#[derive(Debug)]
struct HandleWatcher {
    path: PathBuf,
    listeners: Vec<Listener>,
}

/// Path level subscriptions on top of `Watcher`
///
/// Any number of listeners can watch the same path, they share a single
/// native watch which is released when the last listener is closed.
/// When file emulation is enabled files are watched through their parent
/// directory and only events about the file itself reach its listeners.
///
/// Paths that can't be watched natively because of watch limit are polled,
/// see `WatchMode` and `tick`.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PathWatchers<B: PlatformBackend = NativeBackend> {
    watcher: Watcher<B>,

    watchers: HandleMap<HandleWatcher>,

    /// Records passed to watcher sink that are not dispatched to listeners yet
    queue: Rc<RefCell<VecDeque<EventRecord>>>,

    /// Listeners of paths that are polled instead of watched natively
    polled: StatPoll<Listener>,

    mode: WatchMode,

    /// Set once native watch limit is reached in `Auto` mode
    limit_reached: bool,

    emulate_files: bool,

    next_id: u64,
}

impl<B: PlatformBackend> PathWatchers<B> {
    /// Takes over watcher, its event sink is replaced
    pub fn new(mut watcher: Watcher<B>) -> Self {
        let queue = Rc::new(RefCell::new(VecDeque::new()));
        let sink_queue = Rc::clone(&queue);
        watcher.set_event_sink(move |record| sink_queue.borrow_mut().push_back(record.clone()));

        PathWatchers {
            watcher,
            watchers: HandleMap::new(),
            queue,
            polled: StatPoll::new(),
            mode: WatchMode::default(),
            limit_reached: false,
            emulate_files: cfg!(windows),
            next_id: 0,
        }
    }

    pub fn watcher(&self) -> &Watcher<B> {
        &self.watcher
    }

    pub fn watcher_mut(&mut self) -> &mut Watcher<B> {
        &mut self.watcher
    }

    pub fn set_mode(&mut self, mode: WatchMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> WatchMode {
        self.mode
    }

    /// Whether new paths are polled because native watch limit was reached
    pub fn is_polling(&self) -> bool {
        match self.mode {
            WatchMode::Auto => self.limit_reached,
            WatchMode::Watch => false,
            WatchMode::Poll => true,
        }
    }

    /// Enabled by default on windows where only directories can be watched
    pub fn set_file_emulation(&mut self, enabled: bool) {
        self.emulate_files = enabled;
    }

    pub fn is_emulating_files(&self) -> bool {
        self.emulate_files
    }

    /// Starts watching path, callback is called on consumer thread for every change
    pub fn watch<P, F>(&mut self, path: P, callback: F) -> Result<ListenerId, WatcherError>
    where
        P: AsRef<Path>,
        F: FnMut(&PathEvent) + 'static,
    {
        let path = path.as_ref().to_path_buf();
        if self.is_polling() {
            return self.poll(path, Box::new(callback));
        }

        let watching_parent = self.emulate_files
            && !fs::metadata(&path)
                .map_err(WatcherError::InvalidHandle)?
                .is_dir();
        let target = if watching_parent {
            path.parent()
                .ok_or_else(|| {
                    WatcherError::InvalidHandle(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("{} has no parent directory", path.display()),
                    ))
                })?
                .to_path_buf()
        } else {
            path.clone()
        };

        let handle = match self.find_handle(&target) {
            Some(handle) => handle,
            None => match self.watch_handle(target) {
                Ok(handle) => handle,
                Err(WatcherError::LimitReached) if self.mode == WatchMode::Auto => {
                    log::warn!(
                        "too many watches, falling back to polling for {}",
                        path.display()
                    );
                    self.limit_reached = true;
                    return self.poll(path, Box::new(callback));
                }
                Err(e) => return Err(e),
            },
        };

        let id = self.next_listener_id();
        self.watchers.get_mut(handle)?.listeners.push(Listener {
            id,
            path,
            watching_parent,
            callback: Box::new(callback),
        });

        Ok(id)
    }

    /// Checks polled paths and calls their listeners, returns number of events
    ///
    /// Should be called periodically, at least every 500ms so changes of
    /// directory contents are noticed.
    pub fn tick(&mut self) -> usize {
        self.polled.tick(|listener, event| (listener.callback)(event))
    }

    /// Removes listener, native watch is released when it was the last one
    pub fn close(&mut self, id: ListenerId) -> Result<(), WatcherError> {
        if self.polled.remove(id).is_some() {
            return Ok(());
        }

        let handle = self
            .watchers
            .handles()
            .into_iter()
            .find(|h| {
                self.watchers
                    .get(*h)
                    .map(|w| w.listeners.iter().any(|l| l.id == id))
                    .unwrap_or(false)
            })
            .ok_or(HandleMapError::InvalidKey)?;

        let watcher = self.watchers.get_mut(handle)?;
        watcher.listeners.retain(|l| l.id != id);
        if watcher.listeners.is_empty() {
            self.close_handle(handle)?;
        }
        Ok(())
    }

    /// Releases every native watch, all listener ids become invalid
    pub fn close_all(&mut self) -> Result<(), WatcherError> {
        self.polled.clear();
        for handle in self.watchers.handles() {
            self.close_handle(handle)?;
        }
        Ok(())
    }

    /// Paths of native watches and polled paths
    ///
    /// For emulated files it's their parent directory.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.watchers.values().iter().map(|w| w.path.clone()).collect();
        paths.extend(self.polled.paths());
        paths.sort();
        paths.dedup();
        paths
    }

    pub fn listener_count(&self) -> usize {
        let watching: usize = self.watchers.values().iter().map(|w| w.listeners.len()).sum();
        watching + self.polled.len()
    }

    /// Blocks until next event is processed and passes it to listeners
    pub fn process_next(&mut self) -> Result<Dispatch, WatcherError> {
        let dispatch = self.watcher.process_next()?;
        self.dispatch_queued()?;
        Ok(dispatch)
    }

    pub fn try_process_next(&mut self) -> Result<Dispatch, WatcherError> {
        let dispatch = self.watcher.try_process_next()?;
        self.dispatch_queued()?;
        Ok(dispatch)
    }

    fn next_listener_id(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }

    fn poll(
        &mut self,
        path: PathBuf,
        callback: PathCallback,
    ) -> Result<ListenerId, WatcherError> {
        let id = self.next_listener_id();
        let listener = Listener {
            id,
            path: path.clone(),
            watching_parent: false,
            callback,
        };
        self.polled
            .add(id, &path, listener)
            .map_err(WatcherError::InvalidHandle)?;
        log::debug!("polling {}", path.display());
        Ok(id)
    }

    fn find_handle(&self, path: &Path) -> Option<WatchHandle> {
        self.watchers
            .handles()
            .into_iter()
            .find(|h| self.watchers.get(*h).map(|w| w.path == path).unwrap_or(false))
    }

    fn watch_handle(&mut self, path: PathBuf) -> Result<WatchHandle, WatcherError> {
        let handle = self.watcher.watch(&path)?;
        if self.watchers.has(handle) {
            // different path resolved to already watched object, share its watch
            log::debug!(
                "{} is the same object as already watched {}",
                path.display(),
                self.watchers.get(handle)?.path.display()
            );
        } else {
            self.watchers.add(
                handle,
                HandleWatcher {
                    path,
                    listeners: vec![],
                },
            )?;
        }
        Ok(handle)
    }

    fn close_handle(&mut self, handle: WatchHandle) -> Result<(), WatcherError> {
        let watcher = self.watchers.remove(handle)?;
        log::debug!("closing watch of {}", watcher.path.display());
        self.watcher.unwatch(handle)
    }

    fn dispatch_queued(&mut self) -> Result<(), WatcherError> {
        loop {
            // queue must not be borrowed while callbacks run
            let record = self.queue.borrow_mut().pop_front();
            match record {
                Some(record) => self.dispatch(&record)?,
                None => return Ok(()),
            }
        }
    }

    fn dispatch(&mut self, record: &EventRecord) -> Result<(), WatcherError> {
        let watcher = match self.watchers.get_mut(record.handle) {
            Ok(watcher) => watcher,
            Err(_) => return Ok(()),
        };

        for listener in watcher.listeners.iter_mut() {
            if let Some(event) = listener.translate(record) {
                if let PathEvent::Rename { new_path } = &event {
                    listener.path = new_path.clone();
                }
                (listener.callback)(&event);
            }
        }

        match record.kind {
            EventKind::Delete => self.close_handle(record.handle)?,
            EventKind::Rename => watcher.path = PathBuf::from(record.new_path_lossy().into_owned()),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{mock_watcher, MockBackend, MockControl};

    type Events = Rc<RefCell<Vec<PathEvent>>>;

    fn watchers() -> (PathWatchers<MockBackend>, Arc<MockControl>) {
        let (mut watcher, control) = mock_watcher(8);
        watcher.init().unwrap();
        let mut watchers = PathWatchers::new(watcher);
        watchers.set_file_emulation(false);
        (watchers, control)
    }

    fn listen<P: AsRef<Path>>(
        watchers: &mut PathWatchers<MockBackend>,
        path: P,
    ) -> (ListenerId, Events) {
        let events = Events::default();
        let callback_events = Rc::clone(&events);
        let id = watchers
            .watch(path, move |e| callback_events.borrow_mut().push(e.clone()))
            .unwrap();
        (id, events)
    }

    fn bytes(path: &Path) -> Vec<u8> {
        path.to_string_lossy().as_bytes().to_vec()
    }

    #[test]
    fn listeners_share_watch() {
        let (mut watchers, control) = watchers();
        let (first, first_events) = listen(&mut watchers, "/dir");
        let (second, second_events) = listen(&mut watchers, "/dir");
        assert_eq!(watchers.watched_paths(), vec![PathBuf::from("/dir")]);
        assert_eq!(watchers.listener_count(), 2);
        assert_eq!(watchers.watcher().active_watches(), 1);

        let handle = watchers.watcher().watched_handles()[0];
        control.emit(EventRecord::new(EventKind::Change, handle));
        watchers.process_next().unwrap();
        assert_eq!(*first_events.borrow(), vec![PathEvent::Change]);
        assert_eq!(*second_events.borrow(), vec![PathEvent::Change]);

        watchers.close(first).unwrap();
        assert!(control.removed().is_empty());
        watchers.close(second).unwrap();
        assert_eq!(control.removed(), vec![handle]);
        assert!(watchers.watched_paths().is_empty());
    }

    #[test]
    fn same_object_through_other_path() {
        let (mut watchers, control) = watchers();
        let (_, events) = listen(&mut watchers, "/dir");
        let (other, other_events) = listen(&mut watchers, "/DIR");
        assert_eq!(watchers.watched_paths(), vec![PathBuf::from("/dir")]);
        assert_eq!(watchers.watcher().active_watches(), 1);

        let handle = watchers.watcher().watched_handles()[0];
        control.emit(EventRecord::new(EventKind::Change, handle));
        watchers.process_next().unwrap();
        assert_eq!(events.borrow().len(), 1);
        assert_eq!(other_events.borrow().len(), 1);

        watchers.close(other).unwrap();
        assert!(control.removed().is_empty());
    }

    #[test]
    fn unknown_listener() {
        let (mut watchers, _) = watchers();
        let (id, _) = listen(&mut watchers, "/dir");
        watchers.close(id).unwrap();
        assert!(matches!(
            watchers.close(id),
            Err(WatcherError::Registry(HandleMapError::InvalidKey))
        ));
    }

    #[test]
    fn directory_events() {
        let (mut watchers, control) = watchers();
        let (_, events) = listen(&mut watchers, "/dir");
        let handle = watchers.watcher().watched_handles()[0];

        let records = [
            EventRecord::with_path(EventKind::ChildCreate, handle, b"/dir/a".to_vec()),
            EventRecord::with_path(EventKind::ChildChange, handle, b"/dir/a".to_vec()),
            EventRecord::renamed(handle, b"/dir/b".to_vec(), b"/dir/a".to_vec()),
            EventRecord::with_path(EventKind::ChildDelete, handle, b"/dir/b".to_vec()),
        ];
        for record in records.iter() {
            control.emit(record.clone());
            watchers.process_next().unwrap();
        }
        // child changes are not reported for directories
        assert_eq!(*events.borrow(), vec![PathEvent::Change; 3]);
    }

    #[test]
    fn delete_closes_watch() {
        let (mut watchers, control) = watchers();
        let (id, events) = listen(&mut watchers, "/dir");
        let handle = watchers.watcher().watched_handles()[0];

        control.emit(EventRecord::new(EventKind::Delete, handle));
        watchers.process_next().unwrap();
        assert_eq!(*events.borrow(), vec![PathEvent::Delete]);
        assert_eq!(control.removed(), vec![handle]);
        assert!(watchers.watched_paths().is_empty());
        assert!(watchers.close(id).is_err());
    }

    #[test]
    fn rename_updates_path() {
        let (mut watchers, control) = watchers();
        let (_, events) = listen(&mut watchers, "/dir");
        let handle = watchers.watcher().watched_handles()[0];

        control.emit(EventRecord::with_path(
            EventKind::Rename,
            handle,
            b"/moved".to_vec(),
        ));
        watchers.process_next().unwrap();
        assert_eq!(
            *events.borrow(),
            vec![PathEvent::Rename {
                new_path: PathBuf::from("/moved")
            }]
        );
        assert_eq!(watchers.watched_paths(), vec![PathBuf::from("/moved")]);
    }

    #[test]
    fn file_emulation() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        let other = dir.path().join("other.txt");
        let renamed = dir.path().join("b.txt");
        fs::write(&file, "").unwrap();

        let (mut watchers, control) = watchers();
        watchers.set_file_emulation(true);
        let (_, events) = listen(&mut watchers, &file);
        assert_eq!(watchers.watched_paths(), vec![dir.path().to_path_buf()]);
        let handle = watchers.watcher().watched_handles()[0];

        let records = [
            EventRecord::with_path(EventKind::ChildCreate, handle, bytes(&other)),
            EventRecord::with_path(EventKind::ChildChange, handle, bytes(&other)),
            EventRecord::with_path(EventKind::ChildChange, handle, bytes(&file)),
            EventRecord::renamed(handle, bytes(&renamed), bytes(&file)),
            EventRecord::with_path(EventKind::ChildDelete, handle, bytes(&renamed)),
        ];
        for record in records.iter() {
            control.emit(record.clone());
            watchers.process_next().unwrap();
        }

        assert_eq!(
            *events.borrow(),
            vec![
                PathEvent::Change,
                PathEvent::Rename {
                    new_path: renamed.clone()
                },
                PathEvent::Delete,
            ]
        );
        // parent is still watched
        assert!(control.removed().is_empty());
    }

    #[test]
    fn emulated_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut watchers, _) = watchers();
        watchers.set_file_emulation(true);
        assert!(matches!(
            watchers.watch(dir.path().join("missing.txt"), |_| {}),
            Err(WatcherError::InvalidHandle(_))
        ));
        assert_eq!(watchers.listener_count(), 0);
    }

    #[test]
    fn close_all() {
        let (mut watchers, control) = watchers();
        listen(&mut watchers, "/a");
        listen(&mut watchers, "/b");
        watchers.close_all().unwrap();
        assert_eq!(control.removed().len(), 2);
        assert_eq!(watchers.listener_count(), 0);
        assert!(!watchers.watcher().is_keep_alive());
    }

    fn touch(path: &Path) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(10))
            .unwrap();
    }

    #[test]
    fn polls_after_watch_limit() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.txt");
        fs::write(&file, "").unwrap();

        let (mut watcher, control) = mock_watcher(1);
        watcher.init().unwrap();
        let mut watchers = PathWatchers::new(watcher);
        watchers.set_file_emulation(false);
        listen(&mut watchers, "/a");
        assert!(!watchers.is_polling());

        let (id, events) = listen(&mut watchers, &file);
        assert!(watchers.is_polling());
        assert_eq!(watchers.watcher().active_watches(), 1);
        assert_eq!(watchers.listener_count(), 2);
        assert_eq!(
            watchers.watched_paths(),
            vec![PathBuf::from("/a"), file.clone()]
        );

        assert_eq!(watchers.tick(), 0);
        touch(&file);
        assert_eq!(watchers.tick(), 1);
        assert_eq!(*events.borrow(), vec![PathEvent::Change]);

        fs::remove_file(&file).unwrap();
        assert_eq!(watchers.tick(), 1);
        assert_eq!(*events.borrow(), vec![PathEvent::Change, PathEvent::Delete]);
        assert_eq!(watchers.listener_count(), 1);
        assert!(watchers.close(id).is_err());
        assert!(control.removed().is_empty());
    }

    #[test]
    fn watch_mode_reports_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (mut watcher, _) = mock_watcher(1);
        watcher.init().unwrap();
        let mut watchers = PathWatchers::new(watcher);
        watchers.set_file_emulation(false);
        watchers.set_mode(WatchMode::Watch);
        listen(&mut watchers, "/a");

        assert!(matches!(
            watchers.watch(dir.path(), |_| {}),
            Err(WatcherError::LimitReached)
        ));
        assert!(!watchers.is_polling());
        assert_eq!(watchers.listener_count(), 1);
    }

    #[test]
    fn poll_mode() {
        let dir = tempfile::tempdir().unwrap();
        let (mut watchers, control) = watchers();
        watchers.set_mode(WatchMode::Poll);

        let (id, _) = listen(&mut watchers, dir.path());
        assert_eq!(watchers.watcher().active_watches(), 0);
        assert_eq!(watchers.watched_paths(), vec![dir.path().to_path_buf()]);
        assert!(matches!(
            watchers.watch(dir.path().join("missing"), |_| {}),
            Err(WatcherError::InvalidHandle(_))
        ));

        watchers.close(id).unwrap();
        assert!(watchers.watched_paths().is_empty());
        assert!(control.removed().is_empty());
    }
}
