mod core_foundation;
mod fsevents;

pub use fsevents::FSEventsWatcher;
