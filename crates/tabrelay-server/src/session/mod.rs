//! Sessions: tab lists, passwords and activity expiry.

pub mod registry;

pub use registry::{RemovedSession, Session, SessionRegistry};
