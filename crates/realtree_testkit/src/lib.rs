//! # Realtree Testkit
//!
//! Test utilities for realtree.
//!
//! This crate provides:
//! - A mock remote database with scriptable failures and call counters
//! - Ordered side-effect logs for reversion and callback ordering checks
//! - Recording data listeners
//! - Property-based test generators using proptest
//! - Test logging initialization
//!
//! ## Usage
//!
//! ```rust,ignore
//! use realtree_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_cache() {
//!     with_cache(|db, txn| {
//!         txn.add_value(&Node::root().child("a"), 1i64).unwrap();
//!         assert!(commit_and_wait(&txn).is_success());
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_test_logging;
}

pub use fixtures::*;
pub use generators::*;

use tracing_subscriber::EnvFilter;

/// Installs a test-friendly `tracing` subscriber.
///
/// Filtering follows `RUST_LOG`. Calling it more than once is harmless.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
