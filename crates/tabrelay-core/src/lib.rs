//! tabrelay-core: shared protocol library for the tab relay.
//!
//! Provides the terminal frame wire format, JSON control notifications and
//! session descriptors, the error taxonomy, and session password hashing.

pub mod error;
pub mod frame;
pub mod messages;
pub mod password;

// Re-export commonly used items at crate root.
pub use error::{ErrorKind, RelayError, RelayResult};
pub use frame::{FrameRef, FrameTag, Geometry, TAG_DATA, TAG_RESIZE};
pub use messages::{CloseReason, Control, SessionInfo, TabDescriptor};
pub use password::{hash_password, verify_password};
