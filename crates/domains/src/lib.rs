//! feed-sync/crates/domains/src/lib.rs
//!
//! Entity models, the error taxonomy and the port traits shared by every
//! other crate in the workspace. No I/O lives here.

pub mod error;
pub mod models;
pub mod traits;

// Re-exporting for easier access in other crates
pub use error::*;
pub use models::*;
pub use traits::*;
