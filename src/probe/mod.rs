//! Packet-loss probe protocol: wire codec and the per-session handler.

pub mod codec;
pub mod handler;

pub use codec::{Acknowledgment, CodecError, Probe};
pub use handler::{LossProbeHandler, ProbeState};
