use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

use crate::KanshiError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventKind {
    Init,
    Created,
    Modified,
    Deleted,
    Renamed,
}

/// A single change observed under a watched root.
///
/// `path` is always the watched root. `name` is relative to it and is absent
/// only for [`EventKind::Init`]; `old_name` is present only for
/// [`EventKind::Renamed`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileEvent {
    path: PathBuf,
    kind: EventKind,
    name: Option<OsString>,
    old_name: Option<OsString>,
}

impl FileEvent {
    /// Builds an event, rejecting field combinations that do not fit `kind`.
    pub fn new(
        path: impl Into<PathBuf>,
        kind: EventKind,
        name: Option<OsString>,
        old_name: Option<OsString>,
    ) -> Result<Self, KanshiError> {
        let valid = match kind {
            EventKind::Init => name.is_none() && old_name.is_none(),
            EventKind::Created | EventKind::Modified | EventKind::Deleted => {
                name.is_some() && old_name.is_none()
            }
            EventKind::Renamed => name.is_some() && old_name.is_some(),
        };

        if !valid {
            return Err(KanshiError::InvalidEvent(format!(
                "{kind:?} with name {name:?} and old name {old_name:?}"
            )));
        }

        Ok(FileEvent {
            path: path.into(),
            kind,
            name,
            old_name,
        })
    }

    pub fn init(path: impl Into<PathBuf>) -> Self {
        FileEvent {
            path: path.into(),
            kind: EventKind::Init,
            name: None,
            old_name: None,
        }
    }

    pub fn created(path: impl Into<PathBuf>, name: impl Into<OsString>) -> Self {
        Self::named(path, EventKind::Created, name)
    }

    pub fn modified(path: impl Into<PathBuf>, name: impl Into<OsString>) -> Self {
        Self::named(path, EventKind::Modified, name)
    }

    pub fn deleted(path: impl Into<PathBuf>, name: impl Into<OsString>) -> Self {
        Self::named(path, EventKind::Deleted, name)
    }

    pub fn renamed(
        path: impl Into<PathBuf>,
        old_name: impl Into<OsString>,
        name: impl Into<OsString>,
    ) -> Self {
        FileEvent {
            path: path.into(),
            kind: EventKind::Renamed,
            name: Some(name.into()),
            old_name: Some(old_name.into()),
        }
    }

    fn named(path: impl Into<PathBuf>, kind: EventKind, name: impl Into<OsString>) -> Self {
        FileEvent {
            path: path.into(),
            kind,
            name: Some(name.into()),
            old_name: None,
        }
    }

    /// The watched root this event belongs to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn name(&self) -> Option<&OsStr> {
        self.name.as_deref()
    }

    pub fn old_name(&self) -> Option<&OsStr> {
        self.old_name.as_deref()
    }

    /// Path of the affected entry, or the root itself for `Init`.
    pub fn full_path(&self) -> PathBuf {
        match &self.name {
            Some(name) => self.path.join(name),
            None => self.path.clone(),
        }
    }

    /// Path the entry had before a rename.
    pub fn old_path(&self) -> Option<PathBuf> {
        self.old_name.as_ref().map(|old| self.path.join(old))
    }

    /// Calls the one handler method matching this event's kind.
    pub fn dispatch<H: FileEventHandler + ?Sized>(&self, handler: &mut H) {
        // Constructors guarantee the fields each kind needs.
        let name = self.name.as_deref().unwrap_or_default();
        let old_name = self.old_name.as_deref().unwrap_or_default();

        match self.kind {
            EventKind::Init => handler.on_initialized(&self.path),
            EventKind::Created => handler.on_created(&self.path, name),
            EventKind::Modified => handler.on_modified(&self.path, name),
            EventKind::Deleted => handler.on_deleted(&self.path, name),
            EventKind::Renamed => handler.on_renamed(&self.path, old_name, name),
        }
    }
}

pub trait FileEventHandler {
    fn on_initialized(&mut self, _root: &Path) {}
    fn on_created(&mut self, root: &Path, name: &OsStr);
    fn on_modified(&mut self, root: &Path, name: &OsStr);
    fn on_renamed(&mut self, root: &Path, old_name: &OsStr, name: &OsStr);
    fn on_deleted(&mut self, root: &Path, name: &OsStr);
}

#[cfg(test)]
mod tests {
    use std::{
        ffi::{OsStr, OsString},
        path::{Path, PathBuf},
    };

    use super::{EventKind, FileEvent, FileEventHandler};

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl FileEventHandler for Recorder {
        fn on_initialized(&mut self, root: &Path) {
            self.calls.push(format!("init {}", root.display()));
        }

        fn on_created(&mut self, _root: &Path, name: &OsStr) {
            self.calls.push(format!("created {}", name.to_string_lossy()));
        }

        fn on_modified(&mut self, _root: &Path, name: &OsStr) {
            self.calls.push(format!("modified {}", name.to_string_lossy()));
        }

        fn on_renamed(&mut self, _root: &Path, old_name: &OsStr, name: &OsStr) {
            self.calls.push(format!(
                "renamed {} {}",
                old_name.to_string_lossy(),
                name.to_string_lossy()
            ));
        }

        fn on_deleted(&mut self, _root: &Path, name: &OsStr) {
            self.calls.push(format!("deleted {}", name.to_string_lossy()));
        }
    }

    #[test]
    fn rejects_fields_that_do_not_fit_the_kind() {
        let name = || Some(OsString::from("a.txt"));

        assert!(FileEvent::new("/w", EventKind::Init, name(), None).is_err());
        assert!(FileEvent::new("/w", EventKind::Created, None, None).is_err());
        assert!(FileEvent::new("/w", EventKind::Deleted, name(), name()).is_err());
        assert!(FileEvent::new("/w", EventKind::Renamed, name(), None).is_err());

        assert!(FileEvent::new("/w", EventKind::Init, None, None).is_ok());
        assert!(FileEvent::new("/w", EventKind::Modified, name(), None).is_ok());
        assert!(FileEvent::new("/w", EventKind::Renamed, name(), name()).is_ok());
    }

    #[test]
    fn validated_and_shorthand_constructors_agree() {
        let built = FileEvent::new(
            "/w",
            EventKind::Renamed,
            Some("new.txt".into()),
            Some("old.txt".into()),
        )
        .unwrap();

        assert_eq!(built, FileEvent::renamed("/w", "old.txt", "new.txt"));
        assert_eq!(built.full_path(), PathBuf::from("/w/new.txt"));
        assert_eq!(built.old_path(), Some(PathBuf::from("/w/old.txt")));
    }

    #[test]
    fn init_has_no_names() {
        let init = FileEvent::init("/w");
        assert_eq!(init.kind(), EventKind::Init);
        assert!(init.name().is_none());
        assert!(init.old_name().is_none());
        assert_eq!(init.full_path(), PathBuf::from("/w"));
    }

    #[test]
    fn dispatch_calls_exactly_one_handler() {
        let mut recorder = Recorder::default();

        FileEvent::init("/w").dispatch(&mut recorder);
        FileEvent::created("/w", "a").dispatch(&mut recorder);
        FileEvent::modified("/w", "a").dispatch(&mut recorder);
        FileEvent::renamed("/w", "a", "b").dispatch(&mut recorder);
        FileEvent::deleted("/w", "b").dispatch(&mut recorder);

        assert_eq!(
            recorder.calls,
            vec![
                "init /w",
                "created a",
                "modified a",
                "renamed a b",
                "deleted b"
            ]
        );
    }
}
