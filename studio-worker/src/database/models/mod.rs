//! Row models.
//!
//! These map one-to-one onto the SQLite schema and convert into the domain
//! types the engine works with.

pub mod content;
pub mod job;

pub use content::*;
pub use job::*;
