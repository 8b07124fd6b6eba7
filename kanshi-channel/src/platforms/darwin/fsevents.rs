use std::{
    collections::HashSet,
    ffi::{CStr, OsStr},
    os::{
        raw::{c_char, c_void},
        unix::ffi::OsStrExt,
    },
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::core_foundation::{
    self as CoreFoundation,
    types::{self as CFTypes, FSEventStreamEventFlags as Flags},
};
use crate::{
    platforms::{HandleTable, NativeListener, NativeWatcher, WatchHandle},
    EventMask, KanshiError,
};

/// How long the first half of a rename waits for its partner before it is
/// reported as a delete.
const RENAME_TIMEOUT_MS: i64 = 50;

/// Upper bound on remembered creations; past it the set starts over.
const MAX_TRACKED_CREATIONS: usize = 4096;

pub struct FSEventsWatcher {
    streams: HandleTable<WrappedEventStream>,
}

struct WrappedEventStream {
    stream: CFTypes::FSEventStreamRef,
    queue: CFTypes::dispatch_queue_t,
}

// Only touched from `deregister`, once, after removal from the table.
unsafe impl Send for WrappedEventStream {}

/// Shared with FSEvents through the stream context; its lifetime is managed
/// by the retain/release callbacks below.
struct StreamContext {
    root: PathBuf,
    recursive: bool,
    queue: CFTypes::dispatch_queue_t,
    listener: Arc<dyn NativeListener>,
    state: Mutex<StreamState>,
}

#[derive(Default)]
struct StreamState {
    pending_rename: Option<PendingRename>,
    generation: u64,
    // FSEvents keeps reporting ItemCreated on later changes to the same item.
    created: HashSet<PathBuf>,
}

/// First half of a rename, waiting for the item that still exists.
struct PendingRename {
    name: PathBuf,
    generation: u64,
    scheduled: bool,
}

struct RenameExpiry {
    context: Arc<StreamContext>,
    generation: u64,
}

extern "C" fn retain_context(info: *const c_void) -> *const c_void {
    unsafe { Arc::increment_strong_count(info as *const StreamContext) };
    info
}

extern "C" fn release_context(info: *const c_void) {
    unsafe { drop(Arc::from_raw(info as *const StreamContext)) };
}

extern "C" fn callback(
    _stream_ref: CFTypes::FSEventStreamRef,
    info: *mut c_void,
    num_events: usize,
    event_paths: *const *const c_char,
    event_flags: *const Flags,
    _event_ids: *const CFTypes::FSEventStreamId,
) {
    let context = unsafe { &*(info as *const StreamContext) };
    let mut state = context.state.lock();

    for idx in 0..num_events {
        let (path, flags) = unsafe {
            (
                CStr::from_ptr(*event_paths.add(idx)),
                *event_flags.add(idx),
            )
        };
        let path = Path::new(OsStr::from_bytes(path.to_bytes()));
        context.handle(&mut state, path, flags);
    }

    // The other half of a rename may only come with a later batch.
    let unscheduled = state
        .pending_rename
        .as_mut()
        .filter(|pending| !pending.scheduled)
        .map(|pending| {
            pending.scheduled = true;
            pending.generation
        });
    drop(state);

    if let Some(generation) = unscheduled {
        schedule_rename_expiry(info, context.queue, generation);
    }
}

fn schedule_rename_expiry(info: *mut c_void, queue: CFTypes::dispatch_queue_t, generation: u64) {
    let context = unsafe {
        Arc::increment_strong_count(info as *const StreamContext);
        Arc::from_raw(info as *const StreamContext)
    };
    let expiry = Box::into_raw(Box::new(RenameExpiry {
        context,
        generation,
    }));

    unsafe {
        CoreFoundation::dispatch_after_f(
            CoreFoundation::dispatch_time(CFTypes::DISPATCH_TIME_NOW, RENAME_TIMEOUT_MS * 1_000_000),
            queue,
            expiry.cast(),
            expire_rename,
        );
    }
}

extern "C" fn expire_rename(raw: *mut c_void) {
    let expiry = unsafe { Box::from_raw(raw as *mut RenameExpiry) };
    expiry.context.expire_rename(expiry.generation);
}

impl StreamContext {
    fn handle(&self, state: &mut StreamState, path: &Path, flags: Flags) {
        if flags.intersects(
            Flags::kFSEventStreamEventFlagUserDropped
                | Flags::kFSEventStreamEventFlagKernelDropped
                | Flags::kFSEventStreamEventFlagMustScanSubDirs,
        ) {
            warn!(path = %path.display(), ?flags, "FSEvents dropped events");
            state.created.clear();
        }

        if flags.contains(Flags::kFSEventStreamEventFlagRootChanged) {
            self.listener.on_failure(KanshiError::NativeFailure(format!(
                "{} was moved or deleted",
                self.root.display()
            )));
            return;
        }

        let Ok(name) = path.strip_prefix(&self.root) else {
            return;
        };
        if name.as_os_str().is_empty() || (!self.recursive && name.components().count() > 1) {
            return;
        }
        let exists = path.symlink_metadata().is_ok();

        if flags.contains(Flags::kFSEventStreamEventFlagItemRenamed) {
            if exists {
                match state.pending_rename.take() {
                    Some(old) => self.listener.on_renamed(
                        &self.root,
                        old.name.as_os_str(),
                        name.as_os_str(),
                    ),
                    None => self.listener.on_created(&self.root, name.as_os_str()),
                }
                remember_created(state, name);
            } else {
                self.flush_pending_rename(state);
                state.created.remove(name);
                state.generation += 1;
                state.pending_rename = Some(PendingRename {
                    name: name.to_path_buf(),
                    generation: state.generation,
                    scheduled: false,
                });
            }
            return;
        }

        if flags.contains(Flags::kFSEventStreamEventFlagItemRemoved) && !exists {
            state.created.remove(name);
            self.listener.on_deleted(&self.root, name.as_os_str());
            return;
        }

        if flags.contains(Flags::kFSEventStreamEventFlagItemCreated) && remember_created(state, name)
        {
            self.listener.on_created(&self.root, name.as_os_str());
        } else if flags.contains(Flags::kFSEventStreamEventFlagItemModified) {
            self.listener.on_modified(&self.root, name.as_os_str());
        }
    }

    /// Reports a parked rename half as a delete if nothing claimed it since.
    fn expire_rename(&self, generation: u64) {
        let mut state = self.state.lock();
        if state
            .pending_rename
            .as_ref()
            .is_some_and(|pending| pending.generation == generation)
        {
            trace!(generation, "rename partner never arrived");
            self.flush_pending_rename(&mut state);
        }
    }

    fn flush_pending_rename(&self, state: &mut StreamState) {
        if let Some(old) = state.pending_rename.take() {
            self.listener.on_deleted(&self.root, old.name.as_os_str());
        }
    }
}

/// Returns whether `name` was not known to be created yet.
fn remember_created(state: &mut StreamState, name: &Path) -> bool {
    if state.created.len() >= MAX_TRACKED_CREATIONS {
        state.created.clear();
    }
    state.created.insert(name.to_path_buf())
}

impl FSEventsWatcher {
    pub fn new() -> Self {
        FSEventsWatcher {
            streams: HandleTable::new(),
        }
    }
}

impl NativeWatcher for FSEventsWatcher {
    fn name(&self) -> &'static str {
        "fsevents"
    }

    // FSEvents cannot filter by kind; the session applies the mask.
    fn register(
        &self,
        path: &Path,
        _mask: EventMask,
        recursive: bool,
        listener: Arc<dyn NativeListener>,
    ) -> Result<WatchHandle, KanshiError> {
        let root = path
            .canonicalize()
            .map_err(|e| KanshiError::registration(path, e))?;
        if !root.is_dir() {
            return Err(KanshiError::InvalidPath(
                path.to_path_buf(),
                "not a directory".to_owned(),
            ));
        }

        let paths = unsafe { CoreFoundation::path_array(root.as_os_str().as_bytes()) };
        if paths.is_null() {
            return Err(KanshiError::ResourceExhausted(
                "unable to allocate the FSEvents path list".to_owned(),
            ));
        }

        let queue = unsafe {
            CoreFoundation::dispatch_queue_create(
                c"kanshi.fsevents".as_ptr(),
                CFTypes::DISPATCH_QUEUE_SERIAL,
            )
        };

        let context = Arc::new(StreamContext {
            root,
            recursive,
            queue,
            listener,
            state: Mutex::new(StreamState::default()),
        });
        let info = Arc::into_raw(context) as *mut c_void;

        let stream_context = CFTypes::FSEventStreamContext {
            version: 0,
            info,
            retain: Some(retain_context),
            release: Some(release_context),
            copy_description: None,
        };

        let flags = CFTypes::FSEventStreamCreateFlags::kFSEventStreamCreateFlagFileEvents
            | CFTypes::FSEventStreamCreateFlags::kFSEventStreamCreateFlagNoDefer
            | CFTypes::FSEventStreamCreateFlags::kFSEventStreamCreateFlagWatchRoot;

        let stream = unsafe {
            let stream = CoreFoundation::FSEventStreamCreate(
                CFTypes::kCFAllocatorDefault,
                callback,
                &stream_context,
                paths,
                CFTypes::kFSEventStreamEventIdSinceNow,
                0.0,
                flags,
            );
            CoreFoundation::CFRelease(paths);
            // The stream holds its own reference from here on.
            release_context(info);
            stream
        };

        if stream.is_null() {
            unsafe { CoreFoundation::dispatch_release(queue) };
            return Err(KanshiError::ResourceExhausted(
                "FSEventStreamCreate returned no stream".to_owned(),
            ));
        }

        unsafe { CoreFoundation::FSEventStreamSetDispatchQueue(stream, queue) };

        if unsafe { CoreFoundation::FSEventStreamStart(stream) } == 0 {
            unsafe {
                CoreFoundation::FSEventStreamInvalidate(stream);
                CoreFoundation::FSEventStreamRelease(stream);
                CoreFoundation::dispatch_release(queue);
            }
            return Err(KanshiError::FileSystemError(format!(
                "unable to start an FSEvents stream for {}",
                path.display()
            )));
        }

        debug!(path = %path.display(), "FSEvents stream started");
        Ok(self.streams.insert(WrappedEventStream { stream, queue }))
    }

    fn deregister(&self, handle: WatchHandle) {
        let Some(wrapped) = self.streams.remove(handle) else {
            return;
        };

        // Pending rename expiries keep the queue alive on their own.
        unsafe {
            CoreFoundation::FSEventStreamStop(wrapped.stream);
            CoreFoundation::FSEventStreamInvalidate(wrapped.stream);
            CoreFoundation::FSEventStreamRelease(wrapped.stream);
            CoreFoundation::dispatch_release(wrapped.queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        ffi::OsStr,
        fs,
        path::{Path, PathBuf},
        ptr,
        sync::Arc,
    };

    use parking_lot::Mutex;

    use super::{Flags, StreamContext, StreamState, MAX_TRACKED_CREATIONS};
    use crate::{platforms::NativeListener, KanshiError};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock())
        }
    }

    impl NativeListener for Recorder {
        fn on_created(&self, _root: &Path, name: &OsStr) {
            self.0.lock().push(format!("created {}", name.to_string_lossy()));
        }

        fn on_deleted(&self, _root: &Path, name: &OsStr) {
            self.0.lock().push(format!("deleted {}", name.to_string_lossy()));
        }

        fn on_modified(&self, _root: &Path, name: &OsStr) {
            self.0.lock().push(format!("modified {}", name.to_string_lossy()));
        }

        fn on_renamed(&self, _root: &Path, old_name: &OsStr, new_name: &OsStr) {
            self.0.lock().push(format!(
                "renamed {} {}",
                old_name.to_string_lossy(),
                new_name.to_string_lossy()
            ));
        }

        fn on_failure(&self, error: KanshiError) {
            self.0.lock().push(format!("failed {error}"));
        }
    }

    fn context(root: PathBuf) -> (StreamContext, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let context = StreamContext {
            root,
            recursive: true,
            queue: ptr::null_mut(),
            listener: recorder.clone(),
            state: Mutex::new(StreamState::default()),
        };
        (context, recorder)
    }

    fn batch(context: &StreamContext, events: &[(PathBuf, Flags)]) {
        let mut state = context.state.lock();
        for (path, flags) in events {
            context.handle(&mut state, path, *flags);
        }
    }

    #[test]
    fn rename_halves_pair_across_batches() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::write(root.join("b.txt"), "x").unwrap();
        let (context, recorder) = context(root.clone());

        batch(&context, &[(root.join("a.txt"), Flags::kFSEventStreamEventFlagItemRenamed)]);
        assert!(recorder.take().is_empty());

        batch(&context, &[(root.join("b.txt"), Flags::kFSEventStreamEventFlagItemRenamed)]);
        assert_eq!(recorder.take(), vec!["renamed a.txt b.txt"]);
    }

    #[test]
    fn unclaimed_rename_half_expires_as_delete() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let (context, recorder) = context(root.clone());

        batch(&context, &[(root.join("a.txt"), Flags::kFSEventStreamEventFlagItemRenamed)]);
        let first = context.state.lock().generation;
        batch(&context, &[(root.join("c.txt"), Flags::kFSEventStreamEventFlagItemRenamed)]);
        assert_eq!(recorder.take(), vec!["deleted a.txt"]);

        // The earlier deadline must not claim the newer half.
        context.expire_rename(first);
        assert!(recorder.take().is_empty());

        context.expire_rename(first + 1);
        assert_eq!(recorder.take(), vec!["deleted c.txt"]);
    }

    #[test]
    fn dropped_events_forget_known_creations() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::write(root.join("b.txt"), "x").unwrap();
        let (context, recorder) = context(root.clone());
        let created = Flags::kFSEventStreamEventFlagItemCreated;
        let rewritten = created | Flags::kFSEventStreamEventFlagItemModified;

        batch(&context, &[(root.join("b.txt"), created), (root.join("b.txt"), rewritten)]);
        assert_eq!(recorder.take(), vec!["created b.txt", "modified b.txt"]);

        batch(&context, &[(root.clone(), Flags::kFSEventStreamEventFlagMustScanSubDirs)]);
        assert!(context.state.lock().created.is_empty());
    }

    #[test]
    fn remembered_creations_are_bounded() {
        let mut state = StreamState::default();
        for idx in 0..MAX_TRACKED_CREATIONS + 10 {
            super::remember_created(&mut state, Path::new(&format!("f{idx}")));
        }
        assert!(state.created.len() <= MAX_TRACKED_CREATIONS);
    }
}
