//! # gantry-core - Core Types for Gantry
//!
//! Foundation crate for Gantry, the container-engine client layer. Provides
//! the error model (including transport/body error normalization), typed
//! engine events, and logging setup.
//!
//! This crate has **zero internal dependencies** -- it only depends on
//! external crates (serde, chrono, thiserror, tracing).
//!
//! ## Public API
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Error enum organized by layer, with `recoverable` vs
//!   `fatal` classification
//! - [`EngineError`] - Structured engine failure; [`EngineError::normalize`]
//!   merges a response body onto transport-level fields (body wins)
//! - [`problem`](error::problem) - Transport problem codes, plus the
//!   [`status_problem`]/[`io_problem`] mappings that produce them
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ### Events (`events`)
//! - [`EngineEvent`] - One typed record of the engine's event stream
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use gantry_core::prelude::*;
//! ```

pub mod error;
pub mod events;
pub mod logging;

/// Prelude for common imports used throughout the gantry crates
pub mod prelude {
    pub use super::error::{Error, Result, ResultExt};
    pub use tracing::{debug, error, info, instrument, trace, warn};
}

// Re-export commonly used types at crate root for convenience
pub use error::{io_problem, status_problem, EngineError, Error, Result, ResultExt};
pub use events::{EngineEvent, EventActor};
