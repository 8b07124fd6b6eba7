use std::{fmt, str::FromStr};

use bitflags::bitflags;

use crate::{EventKind, KanshiError};

bitflags! {
    /// Which change kinds a session reports. `Init` is always delivered.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    pub struct EventMask: u8 {
        const CREATED = 0b0001;
        const MODIFIED = 0b0010;
        const DELETED = 0b0100;
        const RENAMED = 0b1000;
        const ALL = Self::CREATED.bits()
            | Self::MODIFIED.bits()
            | Self::DELETED.bits()
            | Self::RENAMED.bits();
    }
}

impl EventMask {
    pub fn reports(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Init => true,
            EventKind::Created => self.contains(EventMask::CREATED),
            EventKind::Modified => self.contains(EventMask::MODIFIED),
            EventKind::Deleted => self.contains(EventMask::DELETED),
            EventKind::Renamed => self.contains(EventMask::RENAMED),
        }
    }
}

impl Default for EventMask {
    fn default() -> Self {
        EventMask::ALL
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Engine {
    Inotify,
    FSEvents,
    ReadDirectoryChangesW,
}

impl Engine {
    pub fn platform_default() -> Option<Engine> {
        if cfg!(target_os = "linux") {
            Some(Engine::Inotify)
        } else if cfg!(target_os = "macos") {
            Some(Engine::FSEvents)
        } else if cfg!(windows) {
            Some(Engine::ReadDirectoryChangesW)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Inotify => "inotify",
            Engine::FSEvents => "fsevents",
            Engine::ReadDirectoryChangesW => "readdirectorychangesw",
        }
    }
}

impl FromStr for Engine {
    type Err = KanshiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inotify" => Ok(Engine::Inotify),
            "fsevents" => Ok(Engine::FSEvents),
            "readdirectorychangesw" => Ok(Engine::ReadDirectoryChangesW),
            _ => Err(KanshiError::InvalidParameter(format!(
                "invalid engine {s:?}. Allowed values are: 'inotify', 'fsevents', 'readdirectorychangesw'."
            ))),
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WatchOptions {
    pub mask: EventMask,
    /// Watch the whole subtree instead of only direct children.
    pub recursive: bool,
    /// Drop events for `~`-prefixed or suffixed names.
    pub filter_temp_files: bool,
    /// Forces a backend; `None` picks the platform default.
    pub engine: Option<Engine>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        WatchOptions {
            mask: EventMask::ALL,
            recursive: true,
            filter_temp_files: true,
            engine: None,
        }
    }
}

impl WatchOptions {
    pub fn mask(mut self, mask: EventMask) -> Self {
        self.mask = mask;
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn filter_temp_files(mut self, filter: bool) -> Self {
        self.filter_temp_files = filter;
        self
    }

    pub fn engine(mut self, engine: Engine) -> Self {
        self.engine = Some(engine);
        self
    }
}
