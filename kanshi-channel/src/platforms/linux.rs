mod inotify;

pub use inotify::INotifyWatcher;
