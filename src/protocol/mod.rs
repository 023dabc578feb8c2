//! Message protocol for the device mesh.
//!
//! Defines the envelope exchanged between devices and between local
//! applications and the coordinator, plus the message-type constants the
//! coordinator itself speaks. Envelopes travel as JSON bodies; the classic
//! transport adds length-prefixed framing at the stream boundary.

pub mod envelope;

pub use envelope::{Envelope, EnvelopeBuilder, MAX_FRAME_LEN};

/// Stable radio address identifying a device across both transports.
pub type DeviceAddress = String;

/// Package identifier of a locally installed application.
pub type AppId = String;

/// Application id the coordinator uses as source on self-originated envelopes.
pub const COORDINATOR_APP_ID: &str = "tether.internal.coordinator";

// Message type constants
pub const MESSAGE_TYPE_HANDSHAKE: i32 = 0x01;
pub const MESSAGE_TYPE_DATA: i32 = 0x10;
pub const MESSAGE_TYPE_SYNC_APP_INFO: i32 = 0x20;
pub const MESSAGE_TYPE_SYNC_MEASUREMENT: i32 = 0x21;

/// Generate a fresh correlation code for a request/response pair.
///
/// Uniqueness across in-flight requests is the caller's responsibility; this
/// is only a convenience source of well-spread values.
pub fn next_code() -> u32 {
    rand::random()
}
