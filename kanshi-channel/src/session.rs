use std::{
    ffi::OsStr,
    fmt,
    path::{self, Path, PathBuf},
    sync::{Arc, Weak},
};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::watch};
use tracing::{debug, error, trace, warn};

use crate::{
    filter::{should_suppress, should_suppress_rename},
    native_watcher, EventChannel, EventKind, FileEvent, KanshiError, NativeListener, NativeWatcher,
    WatchHandle, WatchOptions,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Created,
    Registering,
    Live,
    Closed,
}

/// A live subscription to one directory.
///
/// The session is usable as soon as it is opened; registration with the OS
/// happens on the runtime's blocking pool. The first event received is
/// always [`EventKind::Init`] once registration succeeds. If it fails, the
/// stream ends without any event and [`ready`](WatchSession::ready) reports
/// the error.
///
/// Dropping the session closes it.
pub struct WatchSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    path: PathBuf,
    options: WatchOptions,
    watcher: Arc<dyn NativeWatcher>,
    channel: EventChannel,
    runtime: Handle,
    lifecycle: Mutex<Lifecycle>,
    state: watch::Sender<SessionState>,
    registration: OnceCell<Result<(), KanshiError>>,
    close_result: OnceCell<bool>,
}

struct Lifecycle {
    state: SessionState,
    handle: Option<WatchHandle>,
    // Events that raced ahead of Init while registering.
    held: Vec<FileEvent>,
}

impl WatchSession {
    /// Opens a session on the current tokio runtime.
    pub fn open(path: impl AsRef<Path>, options: WatchOptions) -> Result<Self, KanshiError> {
        let runtime = Handle::try_current().map_err(|_| KanshiError::NoRuntime)?;
        Self::open_with(&runtime, path, options)
    }

    /// Opens a session whose registration and teardown run on `runtime`.
    pub fn open_with(
        runtime: &Handle,
        path: impl AsRef<Path>,
        options: WatchOptions,
    ) -> Result<Self, KanshiError> {
        let watcher = native_watcher(options.engine)?;
        Self::with_watcher(runtime, watcher, path, options)
    }

    /// Opens a session on a caller-provided backend. `options.engine` is ignored.
    pub fn with_watcher(
        runtime: &Handle,
        watcher: Arc<dyn NativeWatcher>,
        path: impl AsRef<Path>,
        options: WatchOptions,
    ) -> Result<Self, KanshiError> {
        let path = path.as_ref();
        let path = path::absolute(path)
            .map_err(|e| KanshiError::InvalidPath(path.to_path_buf(), e.to_string()))?;

        let (state, _) = watch::channel(SessionState::Created);
        let inner = Arc::new(SessionInner {
            path,
            options,
            watcher,
            channel: EventChannel::new(),
            runtime: runtime.clone(),
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Created,
                handle: None,
                held: Vec::new(),
            }),
            state,
            registration: OnceCell::new(),
            close_result: OnceCell::new(),
        });

        inner.set_state(&mut inner.lifecycle.lock(), SessionState::Registering);
        let registering = inner.clone();
        runtime.spawn_blocking(move || registering.register());

        Ok(WatchSession { inner })
    }

    /// Opens a session and waits for registration, returning its error if any.
    pub async fn try_open(path: impl AsRef<Path>, options: WatchOptions) -> Result<Self, KanshiError> {
        let session = Self::open(path, options)?;
        session.ready().await?;
        Ok(session)
    }

    /// Resolves once registration has settled.
    ///
    /// Fails with the registration error, or with
    /// [`KanshiError::SessionClosed`] if the session was closed before the
    /// watch was established.
    pub async fn ready(&self) -> Result<(), KanshiError> {
        let mut state = self.inner.state.subscribe();
        state
            .wait_for(|s| matches!(s, SessionState::Live | SessionState::Closed))
            .await
            .map_err(|_| KanshiError::SessionClosed)?;

        match self.inner.registration.get() {
            Some(result) => result.clone(),
            None => Err(KanshiError::SessionClosed),
        }
    }

    /// Waits for the next event; `None` once the session is closed and drained.
    pub async fn receive(&self) -> Option<FileEvent> {
        self.inner.channel.receive().await
    }

    pub fn events(&self) -> impl futures::Stream<Item = FileEvent> + Send + '_ {
        self.inner.channel.stream()
    }

    /// Deregisters the OS watch and closes the channel.
    ///
    /// Returns whether the channel went from open to closed. Calling it again
    /// does nothing and returns the first call's result.
    pub fn close(&self) -> bool {
        *self.inner.close_result.get_or_init(|| self.inner.shutdown())
    }

    pub fn state(&self) -> SessionState {
        self.inner.lifecycle.lock().state
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn options(&self) -> &WatchOptions {
        &self.inner.options
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for WatchSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchSession")
            .field("path", &self.inner.path)
            .field("watcher", &self.inner.watcher.name())
            .field("state", &self.state())
            .finish()
    }
}

impl SessionInner {
    fn register(self: Arc<Self>) {
        let listener: Arc<dyn NativeListener> = Arc::new(SessionRelay {
            session: Arc::downgrade(&self),
        });

        debug!(
            path = %self.path.display(),
            watcher = self.watcher.name(),
            recursive = self.options.recursive,
            "registering watch"
        );

        let registered = self.watcher.register(
            &self.path,
            self.options.mask,
            self.options.recursive,
            listener,
        );

        match registered {
            Ok(handle) => {
                let mut lifecycle = self.lifecycle.lock();
                if lifecycle.state == SessionState::Closed {
                    drop(lifecycle);
                    debug!(%handle, "session closed while registering, releasing watch");
                    self.watcher.deregister(handle);
                    return;
                }

                let _ = self.registration.set(Ok(()));
                lifecycle.handle = Some(handle);
                self.channel.send(FileEvent::init(&self.path));
                for event in lifecycle.held.drain(..) {
                    self.channel.send(event);
                }
                self.set_state(&mut lifecycle, SessionState::Live);
                debug!(%handle, path = %self.path.display(), "watch is live");
            }
            Err(error) => {
                warn!(?error, path = %self.path.display(), "unable to register watch");
                let _ = self.registration.set(Err(error));
                self.shutdown();
            }
        }
    }

    fn set_state(&self, lifecycle: &mut Lifecycle, state: SessionState) {
        lifecycle.state = state;
        self.state.send_replace(state);
    }

    /// Moves to `Closed`, handing back the OS handle if one is still held.
    fn enter_closed(&self) -> Option<WatchHandle> {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.held.clear();
        self.set_state(&mut lifecycle, SessionState::Closed);
        lifecycle.handle.take()
    }

    fn shutdown(&self) -> bool {
        if let Some(handle) = self.enter_closed() {
            debug!(%handle, path = %self.path.display(), "deregistering watch");
            self.watcher.deregister(handle);
        }
        self.channel.close()
    }

    /// Called from the backend's thread; deregistration is moved off it.
    fn fail(&self, error: KanshiError) {
        error!(?error, path = %self.path.display(), "native watcher failed, closing session");

        let handle = self.enter_closed();
        self.channel.close();

        if let Some(handle) = handle {
            let watcher = self.watcher.clone();
            self.runtime.spawn_blocking(move || watcher.deregister(handle));
        }
    }

    fn deliver(&self, event: FileEvent) {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            SessionState::Registering => lifecycle.held.push(event),
            SessionState::Live => {
                self.channel.send(event);
            }
            SessionState::Created | SessionState::Closed => {
                trace!(kind = ?event.kind(), "dropping event for inactive session");
            }
        }
    }

    fn accepts(&self, kind: EventKind) -> bool {
        self.options.mask.reports(kind)
    }
}

/// Bridges backend callbacks into the session's channel.
struct SessionRelay {
    session: Weak<SessionInner>,
}

impl NativeListener for SessionRelay {
    fn on_created(&self, _root: &Path, name: &OsStr) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if !session.accepts(EventKind::Created)
            || should_suppress(name, session.options.filter_temp_files)
        {
            return;
        }
        session.deliver(FileEvent::created(&session.path, name));
    }

    fn on_deleted(&self, _root: &Path, name: &OsStr) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if !session.accepts(EventKind::Deleted)
            || should_suppress(name, session.options.filter_temp_files)
        {
            return;
        }
        session.deliver(FileEvent::deleted(&session.path, name));
    }

    fn on_modified(&self, _root: &Path, name: &OsStr) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if !session.accepts(EventKind::Modified)
            || should_suppress(name, session.options.filter_temp_files)
        {
            return;
        }

        // Modified followed closely by a delete: nothing left to read.
        if !session.path.join(name).exists() {
            trace!(?name, "dropping modification of a vanished entry");
            return;
        }
        session.deliver(FileEvent::modified(&session.path, name));
    }

    fn on_renamed(&self, _root: &Path, old_name: &OsStr, new_name: &OsStr) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if !session.accepts(EventKind::Renamed)
            || should_suppress_rename(old_name, new_name, session.options.filter_temp_files)
        {
            return;
        }
        session.deliver(FileEvent::renamed(&session.path, old_name, new_name));
    }

    fn on_failure(&self, error: KanshiError) {
        if let Some(session) = self.session.upgrade() {
            session.fail(error);
        }
    }
}
