//! Filesystem watch sessions delivered over an async channel.
//!
//! A [`WatchSession`] registers a native watch (inotify, FSEvents or
//! ReadDirectoryChangesW) on a directory, emits a synthetic
//! [`EventKind::Init`] once the watch is live, and then relays every change
//! as a [`FileEvent`] until it is closed.
//!
//! ```no_run
//! use kanshi_channel::{WatchOptions, WatchSession};
//!
//! # async fn run() -> Result<(), kanshi_channel::KanshiError> {
//! let session = WatchSession::try_open("./src", WatchOptions::default()).await?;
//! while let Some(event) = session.receive().await {
//!     println!("{:?} {:?}", event.kind(), event.name());
//! }
//! # Ok(())
//! # }
//! ```

mod channel;
mod event;
mod filter;
mod opts;
mod platforms;
mod session;

use std::{io, path::PathBuf};

use thiserror::Error;

pub use channel::EventChannel;
pub use event::{EventKind, FileEvent, FileEventHandler};
pub use filter::{is_noise, should_suppress, should_suppress_rename};
pub use opts::{Engine, EventMask, WatchOptions};
pub use platforms::{native_watcher, NativeListener, NativeWatcher, WatchHandle};
pub use session::{SessionState, WatchSession};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KanshiError {
    #[error("invalid watch path {0:?}: {1}")]
    InvalidPath(PathBuf, String),

    #[error("permission denied watching {0:?}")]
    PermissionDenied(PathBuf),

    #[error("out of native watch resources: {0}")]
    ResourceExhausted(String),

    #[error("file system error {0}")]
    FileSystemError(String),

    #[error("native watcher failed: {0}")]
    NativeFailure(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("engine {0} is not available on this platform")]
    UnsupportedEngine(String),

    #[error("no tokio runtime is available to run the watch session")]
    NoRuntime,

    #[error("the watch session was closed")]
    SessionClosed,
}

impl KanshiError {
    /// Classifies an I/O error raised while registering a watch on `path`.
    pub(crate) fn registration(path: impl Into<PathBuf>, error: io::Error) -> Self {
        let path = path.into();

        #[cfg(unix)]
        if let Some(libc::ENOSPC | libc::EMFILE | libc::ENFILE | libc::ENOMEM) =
            error.raw_os_error()
        {
            return KanshiError::ResourceExhausted(error.to_string());
        }

        match error.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::InvalidInput => {
                KanshiError::InvalidPath(path, error.to_string())
            }
            io::ErrorKind::PermissionDenied => KanshiError::PermissionDenied(path),
            io::ErrorKind::OutOfMemory => KanshiError::ResourceExhausted(error.to_string()),
            _ if error.raw_os_error() == Some(not_a_directory()) => {
                KanshiError::InvalidPath(path, error.to_string())
            }
            _ => KanshiError::FileSystemError(error.to_string()),
        }
    }

    /// True for the errors a failed registration can produce.
    pub fn is_registration_failure(&self) -> bool {
        matches!(
            self,
            KanshiError::InvalidPath(..)
                | KanshiError::PermissionDenied(_)
                | KanshiError::ResourceExhausted(_)
                | KanshiError::FileSystemError(_)
        )
    }
}

#[cfg(unix)]
fn not_a_directory() -> i32 {
    libc::ENOTDIR
}

#[cfg(windows)]
fn not_a_directory() -> i32 {
    windows_sys::Win32::Foundation::ERROR_DIRECTORY as i32
}

impl From<io::Error> for KanshiError {
    fn from(value: io::Error) -> Self {
        KanshiError::FileSystemError(value.to_string())
    }
}

#[cfg(target_os = "linux")]
impl From<nix::errno::Errno> for KanshiError {
    fn from(value: nix::errno::Errno) -> Self {
        KanshiError::FileSystemError(value.to_string())
    }
}
