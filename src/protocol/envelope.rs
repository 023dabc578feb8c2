//! The message envelope and its staged builder.
//!
//! An [`Envelope`] is immutable once built: the builder stamps the creation
//! timestamp in `build()` and hands out a finished, read-only value.
//! Destination fields left unset signal broadcast semantics — no destination
//! device means "every device", no destination app means "every app on the
//! resolved device(s)".

use bytes::Bytes;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::{AppId, DeviceAddress};

/// Upper bound on one serialized envelope body.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Structured unit exchanged between devices and apps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub source_device_address: DeviceAddress,
    pub source_app_id: AppId,
    /// `None` broadcasts to every connected device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_device_address: Option<DeviceAddress>,
    /// `None` broadcasts to every app on the destination device(s).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_app_id: Option<AppId>,
    /// Transfer purpose of the message, one of the `MESSAGE_TYPE_*` constants
    /// for coordinator traffic; applications may define their own values.
    #[serde(rename = "type")]
    pub kind: i32,
    /// Correlation id pairing a request with its asynchronous response.
    pub code: u32,
    /// Whether the sender wants a delivery outcome reported. The router does
    /// not enforce this; reliability is caller-managed.
    pub reliable: bool,
    /// Milliseconds since the Unix epoch, assigned at build time.
    pub timestamp: i64,
    /// Opaque payload, typically a serialized data object.
    pub payload: String,
}

impl Envelope {
    pub fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::default()
    }

    /// True when this envelope addresses every connected device.
    pub fn is_device_broadcast(&self) -> bool {
        self.dest_device_address.is_none()
    }

    /// Serialize to the wire body (JSON, no framing).
    pub fn to_bytes(&self) -> Result<Bytes> {
        let body = serde_json::to_vec(self)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!(
                "envelope body of {} bytes exceeds the {} byte limit",
                body.len(),
                MAX_FRAME_LEN
            )));
        }
        Ok(Bytes::from(body))
    }

    /// Deserialize a wire body produced by [`Envelope::to_bytes`].
    pub fn from_bytes(body: &[u8]) -> Result<Envelope> {
        serde_json::from_slice(body)
            .map_err(|e| Error::Protocol(format!("malformed envelope: {e}")))
    }

    /// Deserialize the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.payload)
            .map_err(|e| Error::Protocol(format!("malformed payload: {e}")))
    }
}

/// Staged builder producing a finished [`Envelope`].
#[derive(Debug, Default)]
pub struct EnvelopeBuilder {
    source_device: Option<DeviceAddress>,
    source_app: Option<AppId>,
    dest_device: Option<DeviceAddress>,
    dest_app: Option<AppId>,
    kind: i32,
    code: u32,
    reliable: bool,
    payload: String,
}

impl EnvelopeBuilder {
    pub fn source_device(mut self, address: impl Into<DeviceAddress>) -> Self {
        self.source_device = Some(address.into());
        self
    }

    pub fn source_app(mut self, app_id: impl Into<AppId>) -> Self {
        self.source_app = Some(app_id.into());
        self
    }

    /// Address a single device. Not calling this leaves the envelope a
    /// broadcast to every device.
    pub fn dest_device(mut self, address: impl Into<DeviceAddress>) -> Self {
        self.dest_device = Some(address.into());
        self
    }

    /// Address a single app. Not calling this leaves the envelope a broadcast
    /// to every app on the destination device(s).
    pub fn dest_app(mut self, app_id: impl Into<AppId>) -> Self {
        self.dest_app = Some(app_id.into());
        self
    }

    pub fn kind(mut self, kind: i32) -> Self {
        self.kind = kind;
        self
    }

    pub fn code(mut self, code: u32) -> Self {
        self.code = code;
        self
    }

    pub fn reliable(mut self, reliable: bool) -> Self {
        self.reliable = reliable;
        self
    }

    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Serialize a data object into the payload.
    pub fn payload_json<T: Serialize>(mut self, value: &T) -> Result<Self> {
        self.payload = serde_json::to_string(value)?;
        Ok(self)
    }

    /// Finish the envelope, stamping the creation timestamp.
    pub fn build(self) -> Result<Envelope> {
        let source_device_address = self
            .source_device
            .ok_or_else(|| Error::Protocol("envelope requires a source device".into()))?;
        let source_app_id = self
            .source_app
            .ok_or_else(|| Error::Protocol("envelope requires a source app".into()))?;

        Ok(Envelope {
            source_device_address,
            source_app_id,
            dest_device_address: self.dest_device,
            dest_app_id: self.dest_app,
            kind: self.kind,
            code: self.code,
            reliable: self.reliable,
            timestamp: Utc::now().timestamp_millis(),
            payload: self.payload,
        })
    }
}
