//! SQLite implementations of the queue and content store interfaces.

pub mod content;
pub mod job;

pub use content::SqlxContentStore;
pub use job::SqlxJobQueue;
