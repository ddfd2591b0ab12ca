pub mod event_log;
pub mod index;
pub mod memory;

pub use event_log::JsonlEventLog;
pub use index::{JobStore, RedbStore};
pub use memory::MemoryStore;
