mod readdirectorychangesw;

pub use readdirectorychangesw::ReadDirectoryChangesWatcher;
