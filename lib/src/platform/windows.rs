use std::collections::HashMap;
use std::ffi::c_void;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use derivative::Derivative;
use parking_lot::Mutex;
use widestring::U16CString;
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_TOO_MANY_OPEN_FILES, HANDLE, INVALID_HANDLE_VALUE, WAIT_FAILED,
    WAIT_OBJECT_0,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, GetFileAttributesW, ReadDirectoryChangesW, FILE_ATTRIBUTE_DIRECTORY,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
    FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME,
    FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_ACCESS, FILE_NOTIFY_CHANGE_LAST_WRITE,
    FILE_NOTIFY_CHANGE_SECURITY, FILE_NOTIFY_CHANGE_SIZE, FILE_SHARE_DELETE, FILE_SHARE_READ,
    FILE_SHARE_WRITE, INVALID_FILE_ATTRIBUTES, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::{CreateEventW, SetEvent, WaitForMultipleObjects};
use windows_sys::Win32::System::WindowsProgramming::INFINITE;
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};

use crate::bridge::EventBridge;
use crate::platform::notify_records::decode_records;
use crate::platform::rename::RenameCorrelator;
use crate::platform::PlatformBackend;
use crate::{EventRecord, WatchHandle, WatcherConfig, WatcherError};

/// MAXIMUM_WAIT_OBJECTS, one of them is always taken by wake up event
const MAX_WAIT_OBJECTS: usize = 64;

const NOTIFY_FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_LAST_WRITE
    | FILE_NOTIFY_CHANGE_LAST_ACCESS
    | FILE_NOTIFY_CHANGE_CREATION
    | FILE_NOTIFY_CHANGE_SECURITY;

struct WatchState {
    dir_handle: HANDLE,

    /// Watched directory as given by the caller, child names are joined to it
    path: Vec<u8>,

    canceled: bool,

    /// Whether read request is queued for this directory
    armed: bool,

    /// `hEvent` is signaled when queued read completes and is used as watch handle
    overlapped: OVERLAPPED,

    /// Must be dword aligned so u32 is used
    buffer: Vec<u32>,

    correlator: RenameCorrelator,
}

// SAFETY: handles and OVERLAPPED are only touched while backend mutex is held
unsafe impl Send for WatchState {}

impl WatchState {
    fn handle(&self) -> WatchHandle {
        WatchHandle::from_raw(self.overlapped.hEvent)
    }

    /// Queues asynchronous read of directory changes, completion signals `hEvent`
    fn queue_read(&mut self) -> bool {
        // SAFETY: buffer and overlapped live in boxed state that outlives the request,
        // pending request is always completed or canceled before state is dropped
        let status = unsafe {
            ReadDirectoryChangesW(
                self.dir_handle,
                self.buffer.as_mut_ptr() as *mut c_void,
                (self.buffer.len() * 4) as u32,
                0,
                NOTIFY_FILTER,
                std::ptr::null_mut(),
                &mut self.overlapped,
                None,
            )
        };
        self.armed = status != 0;
        self.armed
    }

    /// Decodes completed read and queues next one
    fn complete(&mut self) -> Result<Vec<EventRecord>, WatcherError> {
        self.armed = false;
        let mut bytes = 0u32;
        // SAFETY: handle and overlapped are valid, request has completed since event is signaled
        let status =
            unsafe { GetOverlappedResult(self.dir_handle, &self.overlapped, &mut bytes, 0) };
        if status == 0 {
            // directory is most likely gone, watch becomes inert until it is removed
            log::warn!(
                "unable to read changes of {}: {}",
                String::from_utf8_lossy(&self.path),
                io::Error::last_os_error()
            );
            return Ok(vec![]);
        }
        if bytes == 0 {
            log::warn!(
                "too many changes in {}, some events were lost",
                String::from_utf8_lossy(&self.path)
            );
        }

        let len = (bytes as usize).min(self.buffer.len() * 4);
        // SAFETY: buffer has at least len initialized bytes, u8 has no alignment requirements
        let bytes = unsafe { std::slice::from_raw_parts(self.buffer.as_ptr() as *const u8, len) };
        let records = decode_records(bytes).map_err(|e| {
            WatcherError::Fatal(format!("unable to decode change notifications: {}", e))
        })?;
        let handle = self.handle();
        let events = self.correlator.translate(handle, &self.path, &records);

        // restart the monitor before events are dispatched so nothing is missed meanwhile
        if !self.queue_read() {
            log::warn!(
                "unable to continue watching {}: {}",
                String::from_utf8_lossy(&self.path),
                io::Error::last_os_error()
            );
        }

        Ok(events)
    }
}

impl Drop for WatchState {
    fn drop(&mut self) {
        // SAFETY: handles are valid and owned by this state
        unsafe {
            if self.armed {
                CancelIoEx(self.dir_handle, &self.overlapped);
                let mut bytes = 0u32;
                // wait until canceled request no longer references buffer
                GetOverlappedResult(self.dir_handle, &self.overlapped, &mut bytes, 1);
            }
            CloseHandle(self.dir_handle);
            CloseHandle(self.overlapped.hEvent);
        }
    }
}

struct WaitSet {
    /// Wakes worker so it picks up changed set of events
    wake_event: HANDLE,

    /// Events that worker waits for, wake up event is the first one
    events: Vec<HANDLE>,

    watches: HashMap<WatchHandle, Box<WatchState>>,
}

impl WaitSet {
    fn wake(&self) {
        // SAFETY: wake_event is a valid event handle
        unsafe { SetEvent(self.wake_event) };
    }
}

impl Drop for WaitSet {
    fn drop(&mut self) {
        self.watches.clear();
        // SAFETY: handle is valid
        unsafe { CloseHandle(self.wake_event) };
    }
}

/// Watches directories with overlapped `ReadDirectoryChangesW`
///
/// Every watch owns directory handle, event and read buffer. Only
/// directories can be watched.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct WindowsBackend {
    buffer_len: usize,

    #[derivative(Debug = "ignore")]
    state: Mutex<Option<WaitSet>>,

    should_stop: AtomicBool,
}

impl WindowsBackend {
    pub fn new(config: &WatcherConfig) -> Self {
        WindowsBackend {
            buffer_len: config.buffer_len,
            state: Mutex::new(None),
            should_stop: AtomicBool::new(false),
        }
    }

    fn events(&self) -> Result<(HANDLE, Vec<HANDLE>), WatcherError> {
        let state = self.state.lock();
        let state = state.as_ref().ok_or(WatcherError::NotRunning)?;
        // copy is used since set may change while worker is waiting
        Ok((state.wake_event, state.events.clone()))
    }

    fn complete(&self, handle: WatchHandle) -> Result<Vec<EventRecord>, WatcherError> {
        let mut state = self.state.lock();
        let state = state.as_mut().ok_or(WatcherError::NotRunning)?;

        let canceled = match state.watches.get(&handle) {
            Some(watch) => watch.canceled,
            None => return Ok(vec![]),
        };
        if canceled {
            state.events.retain(|e| *e != handle.as_raw());
            // dropping state waits for canceled read and closes handles
            state.watches.remove(&handle);
            return Ok(vec![]);
        }

        match state.watches.get_mut(&handle) {
            Some(watch) => watch.complete(),
            None => Ok(vec![]),
        }
    }
}

impl PlatformBackend for WindowsBackend {
    fn init(&self) -> Result<(), WatcherError> {
        // SAFETY: null attributes and name are allowed
        let wake_event = unsafe { CreateEventW(std::ptr::null(), 0, 0, std::ptr::null()) };
        if wake_event == 0 {
            return Err(WatcherError::Fatal(format!(
                "unable to create wake up event: {}",
                io::Error::last_os_error()
            )));
        }

        *self.state.lock() = Some(WaitSet {
            wake_event,
            events: vec![wake_event],
            watches: HashMap::new(),
        });
        Ok(())
    }

    fn add_watch(&self, path: &Path) -> Result<WatchHandle, WatcherError> {
        let mut state = self.state.lock();
        let state = state.as_mut().ok_or(WatcherError::NotRunning)?;
        if state.events.len() >= MAX_WAIT_OBJECTS {
            return Err(WatcherError::LimitReached);
        }

        let wide_path = U16CString::from_os_str(path)
            .map_err(|e| WatcherError::InvalidHandle(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        // requires a directory, files are watched through their parent
        // SAFETY: wide_path is a valid null terminated wide string
        let attributes = unsafe { GetFileAttributesW(wide_path.as_ptr()) };
        if attributes == INVALID_FILE_ATTRIBUTES {
            return Err(WatcherError::InvalidHandle(io::Error::last_os_error()));
        }
        if attributes & FILE_ATTRIBUTE_DIRECTORY == 0 {
            return Err(WatcherError::InvalidHandle(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", path.display()),
            )));
        }

        // SAFETY: wide_path is a valid null terminated wide string
        let dir_handle = unsafe {
            CreateFileW(
                wide_path.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                std::ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                0,
            )
        };
        if dir_handle == INVALID_HANDLE_VALUE {
            let e = io::Error::last_os_error();
            return if e.raw_os_error() == Some(ERROR_TOO_MANY_OPEN_FILES as i32) {
                Err(WatcherError::LimitReached)
            } else {
                Err(WatcherError::InvalidHandle(e))
            };
        }

        // SAFETY: null attributes and name are allowed
        let event = unsafe { CreateEventW(std::ptr::null(), 0, 0, std::ptr::null()) };
        if event == 0 {
            let e = io::Error::last_os_error();
            // SAFETY: handle was just opened
            unsafe { CloseHandle(dir_handle) };
            return Err(WatcherError::InvalidHandle(e));
        }

        // SAFETY: all-zero OVERLAPPED is a valid initial state
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        overlapped.hEvent = event;
        let mut watch = Box::new(WatchState {
            dir_handle,
            path: path.to_string_lossy().into_owned().into_bytes(),
            canceled: false,
            armed: false,
            overlapped,
            buffer: vec![0u32; (self.buffer_len + 3) / 4],
            correlator: RenameCorrelator::default(),
        });
        if !watch.queue_read() {
            // dropping watch closes both handles
            return Err(WatcherError::InvalidHandle(io::Error::last_os_error()));
        }

        let handle = watch.handle();
        state.events.push(event);
        state.watches.insert(handle, watch);
        // wake up the worker so it waits for the new event too
        state.wake();

        Ok(handle)
    }

    fn remove_watch(&self, handle: WatchHandle) {
        let mut state = self.state.lock();
        let watch = match state.as_mut().and_then(|s| s.watches.get_mut(&handle)) {
            Some(watch) => watch,
            None => return,
        };
        watch.canceled = true;
        // worker frees the state once it sees the event signaled
        // SAFETY: handles are valid while state is in the map
        unsafe {
            if !watch.armed || CancelIoEx(watch.dir_handle, &watch.overlapped) == 0 {
                SetEvent(watch.overlapped.hEvent);
            }
        }
    }

    fn run_loop(&self, bridge: &EventBridge) -> Result<(), WatcherError> {
        while !self.should_stop.load(Ordering::SeqCst) {
            let (wake_event, events) = self.events()?;

            // SAFETY: events are valid handles, they are closed only by this thread
            let status =
                unsafe { WaitForMultipleObjects(events.len() as u32, events.as_ptr(), 0, INFINITE) };
            if status == WAIT_FAILED {
                return Err(WatcherError::Fatal(format!(
                    "WaitForMultipleObjects: {}",
                    io::Error::last_os_error()
                )));
            }
            let index = status.wrapping_sub(WAIT_OBJECT_0) as usize;
            let signaled = match events.get(index) {
                Some(&event) => event,
                None => continue,
            };
            // it's a wake up event, there are no fs events
            if signaled == wake_event {
                continue;
            }

            for record in self.complete(WatchHandle::from_raw(signaled))? {
                if bridge.post(record).is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(state) = self.state.lock().as_ref() {
            state.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fs;
    use std::rc::Rc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::{EventKind, Watcher, WatcherBuilder};

    type Events = Rc<RefCell<Vec<EventRecord>>>;

    fn watcher() -> (Watcher, Events) {
        let mut watcher = WatcherBuilder::default().build();
        watcher.init().unwrap();
        let events = Events::default();
        let sink_events = Rc::clone(&events);
        watcher.set_event_sink(move |e| sink_events.borrow_mut().push(e.clone()));
        (watcher, events)
    }

    fn wait_for<F: Fn(&[EventRecord]) -> bool>(
        watcher: &mut Watcher,
        events: &Events,
        done: F,
    ) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            watcher.try_process_next().unwrap();
            if done(&events.borrow()) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn files_are_not_watched() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.txt");
        fs::write(&file, "").unwrap();

        let (mut watcher, _) = watcher();
        assert!(matches!(
            watcher.watch(&file),
            Err(WatcherError::InvalidHandle(_))
        ));
    }

    #[test]
    fn child_create() {
        let dir = tempfile::tempdir().unwrap();
        let (mut watcher, events) = watcher();
        let handle = watcher.watch(dir.path()).unwrap();
        fs::write(dir.path().join("new.txt"), "").unwrap();

        assert!(wait_for(&mut watcher, &events, |e| e
            .iter()
            .any(|e| e.kind == EventKind::ChildCreate)));
        let events = events.borrow();
        let created = events
            .iter()
            .find(|e| e.kind == EventKind::ChildCreate)
            .unwrap();
        assert_eq!(created.handle, handle);
        assert!(created.new_path_lossy().ends_with("\\new.txt"));
    }

    #[test]
    fn child_rename() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "").unwrap();
        let (mut watcher, events) = watcher();
        watcher.watch(dir.path()).unwrap();
        fs::rename(dir.path().join("a.txt"), dir.path().join("b.txt")).unwrap();

        assert!(wait_for(&mut watcher, &events, |e| e
            .iter()
            .any(|e| e.kind == EventKind::ChildRename)));
        let events = events.borrow();
        let renamed = events
            .iter()
            .find(|e| e.kind == EventKind::ChildRename)
            .unwrap();
        assert!(renamed.new_path_lossy().ends_with("\\b.txt"));
        assert!(renamed.old_path_lossy().ends_with("\\a.txt"));
    }

    #[test]
    fn no_events_after_unwatch() {
        let dir = tempfile::tempdir().unwrap();
        let (mut watcher, events) = watcher();
        let handle = watcher.watch(dir.path()).unwrap();
        watcher.unwatch(handle).unwrap();
        fs::write(dir.path().join("after.txt"), "").unwrap();

        thread::sleep(Duration::from_millis(200));
        watcher.try_process_next().unwrap();
        assert!(events.borrow().is_empty());
    }
}
