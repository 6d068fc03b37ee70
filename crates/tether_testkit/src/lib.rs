//! # Tether Testkit
//!
//! Test utilities for Tether.
//!
//! This crate provides:
//! - Store and queue fixtures (volatile, durable over shared memory, and
//!   on-disk in a temporary data directory)
//! - Property-based test generators using proptest
//! - Invariant checks over store contents
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tether_testkit::prelude::*;
//!
//! #[test]
//! fn survives_restart() {
//!     let fixture = DurableFixture::new();
//!     // ... write through fixture.store and fixture.queue
//!     let reopened = fixture.reopen();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod checks;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::checks::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use checks::*;
pub use fixtures::*;
pub use generators::*;
