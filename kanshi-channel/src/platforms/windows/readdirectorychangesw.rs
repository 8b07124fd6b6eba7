use std::{
    ffi::OsString,
    fs, io, iter, mem,
    os::windows::{
        ffi::{OsStrExt, OsStringExt},
        io::{AsRawHandle, FromRawHandle, OwnedHandle},
    },
    path::{Path, PathBuf},
    ptr, slice,
    sync::Arc,
    thread,
};

use tracing::{debug, trace, warn};
use windows_sys::Win32::{
    Foundation::{
        GetLastError, ERROR_IO_PENDING, ERROR_OPERATION_ABORTED, FALSE, HANDLE,
        INVALID_HANDLE_VALUE, TRUE, WAIT_OBJECT_0,
    },
    Storage::FileSystem::{
        CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
        FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
        FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
        FILE_NOTIFY_CHANGE, FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME,
        FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION,
        FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
    },
    System::{
        IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED},
        Threading::{CreateEventW, SetEvent, WaitForMultipleObjects, INFINITE},
    },
};

use crate::{
    platforms::{HandleTable, NativeListener, NativeWatcher, WatchHandle},
    EventMask, KanshiError,
};

/// Bytes per ReadDirectoryChangesW call; larger buffers fail on network shares.
const BUFFER_SIZE: usize = 64 * 1024;

pub struct ReadDirectoryChangesWatcher {
    // Stop events, one per registration.
    registrations: HandleTable<Arc<OwnedHandle>>,
}

impl ReadDirectoryChangesWatcher {
    pub fn new() -> Self {
        ReadDirectoryChangesWatcher {
            registrations: HandleTable::new(),
        }
    }
}

impl NativeWatcher for ReadDirectoryChangesWatcher {
    fn name(&self) -> &'static str {
        "readdirectorychangesw"
    }

    fn register(
        &self,
        path: &Path,
        mask: EventMask,
        recursive: bool,
        listener: Arc<dyn NativeListener>,
    ) -> Result<WatchHandle, KanshiError> {
        let registration_error = |e: io::Error| KanshiError::registration(path, e);

        let metadata = fs::metadata(path).map_err(registration_error)?;
        if !metadata.is_dir() {
            return Err(KanshiError::InvalidPath(
                path.to_path_buf(),
                "not a directory".to_owned(),
            ));
        }

        let directory = open_directory(path).map_err(registration_error)?;
        let completion = manual_reset_event().map_err(registration_error)?;
        let stop = Arc::new(manual_reset_event().map_err(registration_error)?);

        let mut overlapped: Box<OVERLAPPED> = Box::new(unsafe { mem::zeroed() });
        overlapped.hEvent = completion.as_raw_handle();

        let mut pump = Pump {
            directory,
            completion,
            stop: stop.clone(),
            overlapped,
            buffer: vec![0u32; BUFFER_SIZE / mem::size_of::<u32>()],
            filter: notify_filter(mask),
            recursive,
            root: path.to_path_buf(),
            pending_rename: None,
            in_flight: false,
            listener,
        };

        // The first read is issued here so nothing after `register` returns is missed.
        pump.read().map_err(registration_error)?;

        debug!(path = %path.display(), recursive, "ReadDirectoryChangesW watch added");

        thread::Builder::new()
            .name("kanshi-rdcw".to_owned())
            .spawn(move || pump.run())
            .map_err(registration_error)?;

        Ok(self.registrations.insert(stop))
    }

    fn deregister(&self, handle: WatchHandle) {
        if let Some(stop) = self.registrations.remove(handle) {
            unsafe { SetEvent(stop.as_raw_handle()) };
        }
    }
}

fn notify_filter(mask: EventMask) -> FILE_NOTIFY_CHANGE {
    let mut filter = FILE_NOTIFY_CHANGE_FILE_NAME | FILE_NOTIFY_CHANGE_DIR_NAME;
    if mask.contains(EventMask::MODIFIED) {
        filter |= FILE_NOTIFY_CHANGE_LAST_WRITE | FILE_NOTIFY_CHANGE_SIZE;
    }
    filter
}

fn open_directory(path: &Path) -> io::Result<OwnedHandle> {
    let wide: Vec<u16> = path
        .as_os_str()
        .encode_wide()
        .chain(iter::once(0))
        .collect();

    let handle = unsafe {
        CreateFileW(
            wide.as_ptr(),
            FILE_LIST_DIRECTORY,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
            ptr::null(),
            OPEN_EXISTING,
            FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
            ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }

    Ok(unsafe { OwnedHandle::from_raw_handle(handle) })
}

fn manual_reset_event() -> io::Result<OwnedHandle> {
    let handle = unsafe { CreateEventW(ptr::null(), TRUE, FALSE, ptr::null()) };
    if handle.is_null() {
        return Err(io::Error::last_os_error());
    }

    Ok(unsafe { OwnedHandle::from_raw_handle(handle) })
}

struct Pump {
    directory: OwnedHandle,
    completion: OwnedHandle,
    stop: Arc<OwnedHandle>,
    // Boxed so the kernel's pointer stays valid when the pump moves threads.
    overlapped: Box<OVERLAPPED>,
    buffer: Vec<u32>,
    filter: FILE_NOTIFY_CHANGE,
    recursive: bool,
    root: PathBuf,
    pending_rename: Option<PathBuf>,
    in_flight: bool,
    listener: Arc<dyn NativeListener>,
}

// The OVERLAPPED only ever belongs to the thread running the pump.
unsafe impl Send for Pump {}

impl Pump {
    fn run(mut self) {
        let handles: [HANDLE; 2] = [self.completion.as_raw_handle(), self.stop.as_raw_handle()];

        loop {
            let signalled = unsafe { WaitForMultipleObjects(2, handles.as_ptr(), FALSE, INFINITE) };

            if signalled == WAIT_OBJECT_0 + 1 {
                break;
            }

            let outcome = if signalled == WAIT_OBJECT_0 {
                self.complete().and_then(|_| {
                    self.read().map_err(|e| {
                        KanshiError::NativeFailure(format!("ReadDirectoryChangesW failed: {e}"))
                    })
                })
            } else {
                Err(KanshiError::NativeFailure(format!(
                    "waiting for directory changes failed: {}",
                    io::Error::last_os_error()
                )))
            };

            if let Err(error) = outcome {
                self.listener.on_failure(error);
                break;
            }
        }

        self.cancel();
        trace!(path = %self.root.display(), "ReadDirectoryChangesW pump stopped");
    }

    fn read(&mut self) -> io::Result<()> {
        let succeeded = unsafe {
            ReadDirectoryChangesW(
                self.directory.as_raw_handle(),
                self.buffer.as_mut_ptr().cast(),
                BUFFER_SIZE as u32,
                if self.recursive { TRUE } else { FALSE },
                self.filter,
                ptr::null_mut(),
                &mut *self.overlapped,
                None,
            )
        };
        if succeeded == FALSE && unsafe { GetLastError() } != ERROR_IO_PENDING {
            return Err(io::Error::last_os_error());
        }

        self.in_flight = true;
        Ok(())
    }

    fn complete(&mut self) -> Result<(), KanshiError> {
        let mut transferred = 0u32;
        let succeeded = unsafe {
            GetOverlappedResult(
                self.directory.as_raw_handle(),
                &*self.overlapped,
                &mut transferred,
                FALSE,
            )
        };
        self.in_flight = false;

        if succeeded == FALSE {
            // Typically ERROR_ACCESS_DENIED once the directory itself is gone.
            return Err(KanshiError::NativeFailure(format!(
                "{} can no longer be watched: {}",
                self.root.display(),
                io::Error::last_os_error()
            )));
        }

        if transferred == 0 {
            warn!(path = %self.root.display(), "change buffer overflowed, events were lost");
            return Ok(());
        }

        self.parse(transferred as usize);
        // Both halves of a rename land in the same buffer.
        self.flush_pending_rename();
        Ok(())
    }

    fn parse(&mut self, len: usize) {
        let base = self.buffer.as_ptr().cast::<u8>();
        let mut offset = 0usize;
        let mut records = Vec::new();

        while offset + mem::size_of::<FILE_NOTIFY_INFORMATION>() <= len {
            let (action, name, next) = unsafe {
                let info = base.add(offset).cast::<FILE_NOTIFY_INFORMATION>();
                let name = slice::from_raw_parts(
                    ptr::addr_of!((*info).FileName).cast::<u16>(),
                    (*info).FileNameLength as usize / mem::size_of::<u16>(),
                );
                (
                    (*info).Action,
                    PathBuf::from(OsString::from_wide(name)),
                    (*info).NextEntryOffset as usize,
                )
            };
            records.push((action, name));

            if next == 0 {
                break;
            }
            offset += next;
        }

        for (action, name) in records {
            self.handle(action, name);
        }
    }

    fn handle(&mut self, action: u32, name: PathBuf) {
        if action != FILE_ACTION_RENAMED_NEW_NAME {
            self.flush_pending_rename();
        }

        match action {
            FILE_ACTION_ADDED => self.listener.on_created(&self.root, name.as_os_str()),
            FILE_ACTION_REMOVED => self.listener.on_deleted(&self.root, name.as_os_str()),
            FILE_ACTION_MODIFIED => self.listener.on_modified(&self.root, name.as_os_str()),
            FILE_ACTION_RENAMED_OLD_NAME => self.pending_rename = Some(name),
            FILE_ACTION_RENAMED_NEW_NAME => match self.pending_rename.take() {
                Some(old) => {
                    self.listener
                        .on_renamed(&self.root, old.as_os_str(), name.as_os_str())
                }
                None => self.listener.on_created(&self.root, name.as_os_str()),
            },
            other => trace!(action = other, "ignoring unknown change action"),
        }
    }

    fn flush_pending_rename(&mut self) {
        if let Some(old) = self.pending_rename.take() {
            self.listener.on_deleted(&self.root, old.as_os_str());
        }
    }

    /// Waits out an outstanding read so the buffer can be freed.
    fn cancel(&mut self) {
        if !self.in_flight {
            return;
        }

        let mut transferred = 0u32;
        unsafe {
            CancelIoEx(self.directory.as_raw_handle(), &*self.overlapped);
            let finished = GetOverlappedResult(
                self.directory.as_raw_handle(),
                &*self.overlapped,
                &mut transferred,
                TRUE,
            );
            if finished == FALSE && GetLastError() != ERROR_OPERATION_ABORTED {
                trace!(error = %io::Error::last_os_error(), "cancelled read finished with an error");
            }
        }
        self.in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use windows_sys::Win32::Storage::FileSystem::{
        FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE,
    };

    use super::notify_filter;
    use crate::EventMask;

    #[test]
    fn name_changes_are_always_watched() {
        let filter = notify_filter(EventMask::MODIFIED);
        assert_ne!(filter & FILE_NOTIFY_CHANGE_FILE_NAME, 0);
        assert_ne!(filter & FILE_NOTIFY_CHANGE_LAST_WRITE, 0);

        let filter = notify_filter(EventMask::CREATED);
        assert_eq!(filter & FILE_NOTIFY_CHANGE_LAST_WRITE, 0);
    }
}
