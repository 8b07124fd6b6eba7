use std::{
    collections::{HashMap, HashSet, VecDeque},
    fs, io,
    os::{fd::AsFd, unix::fs::MetadataExt},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use nix::{
    errno::Errno,
    sys::{
        epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags},
        inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent, WatchDescriptor},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    platforms::{HandleTable, NativeListener, NativeWatcher, WatchHandle},
    EventMask, KanshiError,
};

/// How long the pump waits on epoll before re-checking for cancellation and
/// giving up on an unpaired `IN_MOVED_FROM`.
const POLL_TIMEOUT_MS: u8 = 50;

pub struct INotifyWatcher {
    registrations: HandleTable<CancellationToken>,
}

impl INotifyWatcher {
    pub fn new() -> Self {
        INotifyWatcher {
            registrations: HandleTable::new(),
        }
    }
}

impl NativeWatcher for INotifyWatcher {
    fn name(&self) -> &'static str {
        "inotify"
    }

    fn register(
        &self,
        path: &Path,
        mask: EventMask,
        recursive: bool,
        listener: Arc<dyn NativeListener>,
    ) -> Result<WatchHandle, KanshiError> {
        let os_error = |errno: Errno| KanshiError::registration(path, io::Error::from(errno));

        let inotify =
            Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK).map_err(os_error)?;
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(os_error)?;
        epoll
            .add(inotify.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 0))
            .map_err(os_error)?;

        let cancel = CancellationToken::new();
        let mut pump = Pump {
            inotify,
            epoll,
            root: path.to_path_buf(),
            flags: watch_flags(mask, recursive),
            recursive,
            directories: HashMap::new(),
            root_wd: None,
            pending_move: None,
            listener,
            cancel: cancel.clone(),
        };

        let root_wd = pump.mark(Path::new(""), AddWatchFlags::IN_ONLYDIR)?;
        pump.root_wd = Some(root_wd);
        if recursive {
            pump.mark_subtree(Path::new(""), false)?;
        }

        debug!(
            path = %path.display(),
            directories = pump.directories.len(),
            "inotify watches added"
        );

        thread::Builder::new()
            .name("kanshi-inotify".to_owned())
            .spawn(move || pump.run())
            .map_err(|e| KanshiError::registration(path, e))?;

        Ok(self.registrations.insert(cancel))
    }

    fn deregister(&self, handle: WatchHandle) {
        // The pump drops the inotify fd, and with it every watch, on its way out.
        if let Some(cancel) = self.registrations.remove(handle) {
            cancel.cancel();
        }
    }
}

fn watch_flags(mask: EventMask, recursive: bool) -> AddWatchFlags {
    let mut flags = AddWatchFlags::IN_DELETE_SELF | AddWatchFlags::IN_MOVE_SELF;

    // Directories created, moved in or renamed have to be seen to keep the
    // per-directory watches accurate.
    if mask.intersects(EventMask::CREATED | EventMask::DELETED | EventMask::RENAMED) || recursive {
        flags |= AddWatchFlags::IN_MOVE;
    }
    if mask.contains(EventMask::CREATED) || recursive {
        flags |= AddWatchFlags::IN_CREATE;
    }
    if mask.contains(EventMask::DELETED) {
        flags |= AddWatchFlags::IN_DELETE;
    }
    if mask.contains(EventMask::MODIFIED) {
        flags |= AddWatchFlags::IN_MODIFY;
    }

    flags
}

struct PendingMove {
    cookie: u32,
    name: PathBuf,
    is_dir: bool,
}

struct Pump {
    inotify: Inotify,
    epoll: Epoll,
    root: PathBuf,
    flags: AddWatchFlags,
    recursive: bool,
    // Watched directories, relative to `root`.
    directories: HashMap<WatchDescriptor, PathBuf>,
    root_wd: Option<WatchDescriptor>,
    pending_move: Option<PendingMove>,
    listener: Arc<dyn NativeListener>,
    cancel: CancellationToken,
}

impl Pump {
    fn run(mut self) {
        let mut events = [EpollEvent::empty(); 1];

        while !self.cancel.is_cancelled() {
            let outcome = match self.epoll.wait(&mut events, POLL_TIMEOUT_MS) {
                Ok(0) => {
                    self.flush_pending_move();
                    Ok(())
                }
                Ok(_) => self.drain(),
                Err(Errno::EINTR) => Ok(()),
                Err(errno) => Err(KanshiError::NativeFailure(format!("epoll wait failed: {errno}"))),
            };

            if let Err(error) = outcome {
                if !self.cancel.is_cancelled() {
                    self.listener.on_failure(error);
                }
                break;
            }
        }

        trace!(path = %self.root.display(), "inotify pump stopped");
    }

    fn drain(&mut self) -> Result<(), KanshiError> {
        loop {
            let records = match self.inotify.read_events() {
                Ok(records) => records,
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(KanshiError::NativeFailure(format!(
                        "reading inotify events failed: {errno}"
                    )))
                }
            };

            for record in records {
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                self.handle(record)?;
            }
        }
    }

    fn handle(&mut self, record: InotifyEvent) -> Result<(), KanshiError> {
        let mask = record.mask;

        if mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
            warn!(path = %self.root.display(), "inotify queue overflowed, events were lost");
            return Ok(());
        }

        if mask.contains(AddWatchFlags::IN_IGNORED) {
            self.directories.remove(&record.wd);
            if Some(record.wd) == self.root_wd {
                return Err(KanshiError::NativeFailure(format!(
                    "{} is no longer watched",
                    self.root.display()
                )));
            }
            return Ok(());
        }

        if mask.intersects(AddWatchFlags::IN_DELETE_SELF | AddWatchFlags::IN_MOVE_SELF) {
            if Some(record.wd) == self.root_wd {
                return Err(KanshiError::NativeFailure(format!(
                    "{} was moved or deleted",
                    self.root.display()
                )));
            }
            return Ok(());
        }

        let (Some(dir), Some(name)) = (self.directories.get(&record.wd), record.name) else {
            return Ok(());
        };
        let name = dir.join(name);
        let is_dir = mask.contains(AddWatchFlags::IN_ISDIR);

        // Kernel emits the two halves of a rename back to back, so anything
        // else arriving first means the source left the watched tree.
        let pairs_with_pending = mask.contains(AddWatchFlags::IN_MOVED_TO)
            && self
                .pending_move
                .as_ref()
                .is_some_and(|pending| pending.cookie == record.cookie);
        if !pairs_with_pending {
            self.flush_pending_move();
        }

        if mask.contains(AddWatchFlags::IN_CREATE) {
            self.listener.on_created(&self.root, name.as_os_str());
            if is_dir && self.recursive {
                self.watch_new_directory(&name, true)?;
            }
        } else if mask.contains(AddWatchFlags::IN_DELETE) {
            self.listener.on_deleted(&self.root, name.as_os_str());
        } else if mask.contains(AddWatchFlags::IN_MODIFY) {
            self.listener.on_modified(&self.root, name.as_os_str());
        } else if mask.contains(AddWatchFlags::IN_MOVED_FROM) {
            self.pending_move = Some(PendingMove {
                cookie: record.cookie,
                name,
                is_dir,
            });
        } else if mask.contains(AddWatchFlags::IN_MOVED_TO) {
            match self.pending_move.take() {
                Some(from) => {
                    if is_dir {
                        self.rebase(&from.name, &name);
                    }
                    self.listener
                        .on_renamed(&self.root, from.name.as_os_str(), name.as_os_str());
                }
                None => {
                    self.listener.on_created(&self.root, name.as_os_str());
                    if is_dir && self.recursive {
                        self.watch_new_directory(&name, false)?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Reports a move whose destination never showed up as a delete.
    fn flush_pending_move(&mut self) {
        let Some(pending) = self.pending_move.take() else {
            return;
        };

        if pending.is_dir {
            self.forget_subtree(&pending.name);
        }
        self.listener.on_deleted(&self.root, pending.name.as_os_str());
    }

    fn mark(&mut self, dir: &Path, extra: AddWatchFlags) -> Result<WatchDescriptor, KanshiError> {
        let path = self.root.join(dir);
        let wd = self
            .inotify
            .add_watch(path.as_path(), self.flags | extra)
            .map_err(|errno| KanshiError::registration(&path, io::Error::from(errno)))?;

        self.directories.insert(wd, dir.to_path_buf());
        Ok(wd)
    }

    /// Watches every directory below `top`, which must already be watched.
    ///
    /// With `report`, every entry found is announced as created: they were
    /// made before the watch on their parent existed.
    fn mark_subtree(&mut self, top: &Path, report: bool) -> Result<(), KanshiError> {
        let mut queue = VecDeque::from([top.to_path_buf()]);
        let mut visited = HashSet::<u64>::new();

        while let Some(dir) = queue.pop_front() {
            let Ok(entries) = fs::read_dir(self.root.join(&dir)) else {
                continue;
            };

            for entry in entries.flatten() {
                let child = dir.join(entry.file_name());
                if report {
                    self.listener.on_created(&self.root, child.as_os_str());
                }

                // DirEntry metadata does not follow symlinks.
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                if !metadata.is_dir() || !visited.insert(metadata.ino()) {
                    continue;
                }

                match self.mark(&child, AddWatchFlags::empty()) {
                    Ok(_) => queue.push_back(child),
                    Err(error @ KanshiError::ResourceExhausted(_)) => return Err(error),
                    Err(error) => {
                        warn!(?error, dir = %child.display(), "skipping directory that cannot be watched")
                    }
                }
            }
        }

        Ok(())
    }

    fn watch_new_directory(&mut self, dir: &Path, report: bool) -> Result<(), KanshiError> {
        match self.mark(dir, AddWatchFlags::empty()) {
            Ok(_) => self.mark_subtree(dir, report),
            Err(error @ KanshiError::ResourceExhausted(_)) => Err(error),
            // Usually already gone again.
            Err(error) => {
                trace!(?error, dir = %dir.display(), "new directory could not be watched");
                Ok(())
            }
        }
    }

    fn forget_subtree(&mut self, top: &Path) {
        let inotify = &self.inotify;
        self.directories.retain(|wd, dir| {
            let inside = dir.starts_with(top);
            if inside {
                let _ = inotify.rm_watch(*wd);
            }
            !inside
        });
    }

    fn rebase(&mut self, from: &Path, to: &Path) {
        for dir in self.directories.values_mut() {
            if let Ok(rest) = dir.strip_prefix(from) {
                *dir = to.join(rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use nix::sys::inotify::AddWatchFlags;

    use super::watch_flags;
    use crate::EventMask;

    #[test]
    fn all_kinds_subscribe_to_every_change() {
        let flags = watch_flags(EventMask::ALL, false);
        for flag in [
            AddWatchFlags::IN_CREATE,
            AddWatchFlags::IN_DELETE,
            AddWatchFlags::IN_MODIFY,
            AddWatchFlags::IN_MOVED_FROM,
            AddWatchFlags::IN_MOVED_TO,
            AddWatchFlags::IN_DELETE_SELF,
        ] {
            assert!(flags.contains(flag), "{flag:?}");
        }
    }

    #[test]
    fn recursive_watches_always_see_creations_and_moves() {
        let flags = watch_flags(EventMask::MODIFIED, true);
        assert!(flags.contains(AddWatchFlags::IN_CREATE));
        assert!(flags.contains(AddWatchFlags::IN_MOVE));
        assert!(!flags.contains(AddWatchFlags::IN_DELETE));

        let flags = watch_flags(EventMask::MODIFIED, false);
        assert!(!flags.contains(AddWatchFlags::IN_CREATE));
        assert!(!flags.intersects(AddWatchFlags::IN_MOVE));
    }
}
