//! Measurement sessions: registry and expiry.

pub mod store;
pub mod sweeper;

pub use store::{Session, SessionStats, SessionStore};
pub use sweeper::ExpirySweeper;
