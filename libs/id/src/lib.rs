//! # magick-id
//!
//! Typed identifiers used by the agent world reconciler.
//!
//! ## Design Principles
//!
//! - Agent IDs are assigned by the external state store and treated as opaque
//!   keys; they are validated but never generated locally
//! - Runtime IDs (ticks, worker boots) are generated locally and ULID-based
//! - All IDs have a canonical string representation with strict parsing
//! - IDs are typed to prevent mixing different kinds of identifiers
//!
//! ## Runtime ID Format
//!
//! Locally generated IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `tick_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `boot_01HV4Z3MXNKPQR9HSTZ7WCLD4E`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
