//! Testing utilities for floodgate.
//!
//! This crate provides test doubles and fixtures for exercising the
//! resilience layer without real dependencies:
//!
//! - [`FlakyStore`]: a [`RemoteStore`](floodgate::RemoteStore) wrapper with
//!   injectable outages and latency
//! - [`ScriptedOperation`]: a guarded operation that replays a fixed list of
//!   outcomes and counts invocations
//! - [`fixtures`]: small, fast configurations
//!
//! # Example
//!
//! ```rust
//! use floodgate_testing::{ScriptedOperation, TestError};
//!
//! # async fn example() {
//! let op = ScriptedOperation::new([Err(TestError::transient("503")), Ok(7)]);
//! assert!(op.call().await.is_err());
//! assert_eq!(op.call().await.unwrap(), 7);
//! assert_eq!(op.invocations(), 2);
//! # }
//! ```

#![deny(missing_docs)]

pub mod fixtures;
pub mod operation;
pub mod store;

// Re-export commonly used types
pub use operation::{ScriptedOperation, TestError};
pub use store::FlakyStore;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::fixtures;
    pub use crate::operation::{ScriptedOperation, TestError};
    pub use crate::store::FlakyStore;
}
