use std::{
    collections::HashMap,
    ffi::OsStr,
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{Engine, EventMask, KanshiError};

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "macos")]
mod darwin;

#[cfg(windows)]
mod windows;

/// Identifies one registration made through a [`NativeWatcher`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct WatchHandle(u64);

impl WatchHandle {
    pub fn from_raw(id: u64) -> Self {
        WatchHandle(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receives raw changes from a backend.
///
/// Methods are called on the backend's own notification thread with the
/// watched root and names relative to it. Implementations must not block.
pub trait NativeListener: Send + Sync {
    fn on_created(&self, root: &Path, name: &OsStr);
    fn on_deleted(&self, root: &Path, name: &OsStr);
    fn on_modified(&self, root: &Path, name: &OsStr);
    fn on_renamed(&self, root: &Path, old_name: &OsStr, new_name: &OsStr);

    /// The backend can no longer deliver events for this registration.
    fn on_failure(&self, error: KanshiError);
}

/// An OS notification backend.
pub trait NativeWatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts watching `path`. Blocks until the OS watch is in place or has
    /// failed; `listener` is called from then on until deregistration.
    fn register(
        &self,
        path: &Path,
        mask: EventMask,
        recursive: bool,
        listener: Arc<dyn NativeListener>,
    ) -> Result<WatchHandle, KanshiError>;

    /// Releases the OS watch behind `handle`. Must be called at most once.
    fn deregister(&self, handle: WatchHandle);
}

/// Returns the backend for `engine`, or the platform default when `None`.
pub fn native_watcher(engine: Option<Engine>) -> Result<Arc<dyn NativeWatcher>, KanshiError> {
    let engine = engine
        .or_else(Engine::platform_default)
        .ok_or_else(|| KanshiError::UnsupportedEngine(std::env::consts::OS.to_owned()))?;

    match engine {
        #[cfg(target_os = "linux")]
        Engine::Inotify => Ok(Arc::new(linux::INotifyWatcher::new())),

        #[cfg(target_os = "macos")]
        Engine::FSEvents => Ok(Arc::new(darwin::FSEventsWatcher::new())),

        #[cfg(windows)]
        Engine::ReadDirectoryChangesW => Ok(Arc::new(windows::ReadDirectoryChangesWatcher::new())),

        #[allow(unreachable_patterns)]
        other => Err(KanshiError::UnsupportedEngine(other.to_string())),
    }
}

/// Per-backend registrations keyed by handles that are never reused.
pub(crate) struct HandleTable<T> {
    next: AtomicU64,
    entries: Mutex<HashMap<WatchHandle, T>>,
}

impl<T> HandleTable<T> {
    pub(crate) fn new() -> Self {
        HandleTable {
            next: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, entry: T) -> WatchHandle {
        let handle = WatchHandle(self.next.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().insert(handle, entry);
        handle
    }

    pub(crate) fn remove(&self, handle: WatchHandle) -> Option<T> {
        self.entries.lock().remove(&handle)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scriptable backend for exercising sessions without an OS watch.

    use std::{
        ffi::OsStr,
        path::{Path, PathBuf},
        sync::Arc,
    };

    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use super::{HandleTable, NativeListener, NativeWatcher, WatchHandle};
    use crate::{EventMask, KanshiError};

    struct Registration {
        root: PathBuf,
        listener: Arc<dyn NativeListener>,
    }

    #[derive(Default)]
    pub(crate) struct FakeState {
        pub(crate) registered: Vec<(PathBuf, EventMask, bool)>,
        pub(crate) deregistered: Vec<WatchHandle>,
        pub(crate) fail_with: Option<KanshiError>,
    }

    pub(crate) struct FakeWatcher {
        table: HandleTable<Registration>,
        live: Mutex<Option<WatchHandle>>,
        pub(crate) state: Mutex<FakeState>,
        gate: Option<Arc<Notify>>,
    }

    impl FakeWatcher {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::build(None))
        }

        /// Registration blocks until `gate` is notified.
        pub(crate) fn gated(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self::build(Some(gate)))
        }

        pub(crate) fn failing(error: KanshiError) -> Arc<Self> {
            let watcher = Self::build(None);
            watcher.state.lock().fail_with = Some(error);
            Arc::new(watcher)
        }

        fn build(gate: Option<Arc<Notify>>) -> Self {
            FakeWatcher {
                table: HandleTable::new(),
                live: Mutex::new(None),
                state: Mutex::new(FakeState::default()),
                gate,
            }
        }

        fn with_listener(&self, f: impl FnOnce(&Path, &dyn NativeListener)) {
            let Some(handle) = *self.live.lock() else {
                return;
            };
            let registration = self
                .table
                .entries
                .lock()
                .get(&handle)
                .map(|r| (r.root.clone(), r.listener.clone()));
            if let Some((root, listener)) = registration {
                f(&root, listener.as_ref());
            }
        }

        pub(crate) fn emit_created(&self, name: &str) {
            self.with_listener(|root, l| l.on_created(root, OsStr::new(name)));
        }

        pub(crate) fn emit_modified(&self, name: &str) {
            self.with_listener(|root, l| l.on_modified(root, OsStr::new(name)));
        }

        pub(crate) fn emit_deleted(&self, name: &str) {
            self.with_listener(|root, l| l.on_deleted(root, OsStr::new(name)));
        }

        pub(crate) fn emit_renamed(&self, old_name: &str, new_name: &str) {
            self.with_listener(|root, l| {
                l.on_renamed(root, OsStr::new(old_name), OsStr::new(new_name))
            });
        }

        pub(crate) fn emit_failure(&self, error: KanshiError) {
            self.with_listener(|_, l| l.on_failure(error));
        }

        pub(crate) fn deregistered(&self) -> Vec<WatchHandle> {
            self.state.lock().deregistered.clone()
        }
    }

    impl NativeWatcher for FakeWatcher {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn register(
            &self,
            path: &Path,
            mask: EventMask,
            recursive: bool,
            listener: Arc<dyn NativeListener>,
        ) -> Result<WatchHandle, KanshiError> {
            if let Some(gate) = &self.gate {
                futures::executor::block_on(gate.notified());
            }

            let mut state = self.state.lock();
            state.registered.push((path.to_path_buf(), mask, recursive));
            if let Some(error) = state.fail_with.clone() {
                return Err(error);
            }
            drop(state);

            let handle = self.table.insert(Registration {
                root: path.to_path_buf(),
                listener,
            });
            *self.live.lock() = Some(handle);
            Ok(handle)
        }

        fn deregister(&self, handle: WatchHandle) {
            self.table.remove(handle);
            self.state.lock().deregistered.push(handle);
        }
    }
}
