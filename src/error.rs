//! Error types of this crate.

use std::io;
use std::path::PathBuf;

use drm::control::{connector, crtc, plane, RawResourceHandle};

/// Errors thrown by the [`DrmDevice`](crate::DrmDevice), the
/// [`AtomicRequest`](crate::AtomicRequest) and the
/// [`FlipPipeline`](crate::FlipPipeline).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The device encountered an access error
    #[error("DRM access error: {0}")]
    Access(#[from] AccessError),
    /// Unknown connector handle
    #[error("Unknown connector handle ({0:?})")]
    UnknownConnector(connector::Handle),
    /// Unknown crtc handle
    #[error("Unknown crtc handle ({0:?})")]
    UnknownCrtc(crtc::Handle),
    /// Unknown plane handle
    #[error("Unknown plane handle ({0:?})")]
    UnknownPlane(plane::Handle),
    /// The device is missing a required property
    #[error("The device is missing a required property '{name}' for handle ({handle:?})")]
    UnknownProperty {
        /// Object the property was looked up on
        handle: RawResourceHandle,
        /// Property name
        name: &'static str,
    },
    /// The event stream could not be decoded
    #[error("Failed to decode the device event stream: {0}")]
    Decode(#[from] DecodeError),
}

/// So many ways to access the DRM device
#[derive(Debug, thiserror::Error)]
#[error("{errmsg} on device `{dev:?}` ({source})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}

/// Errors decoding the binary completion-event stream.
///
/// All of these are fatal for the read buffer they occurred in: the decoder
/// does not resynchronize mid-buffer, and correlation state derived from a
/// partially decoded stream cannot be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The record kind tag is not one this protocol version knows
    #[error("unrecognized event kind {kind:#x} at offset {offset}")]
    UnrecognizedKind {
        /// The kind tag read from the record header
        kind: u32,
        /// Byte offset of the record header
        offset: usize,
    },
    /// The buffer ended in the middle of a record
    #[error("truncated event record at offset {offset}: need {expected} bytes, {available} available")]
    Truncated {
        /// Byte offset of the record header
        offset: usize,
        /// Bytes the record required
        expected: usize,
        /// Bytes left in the buffer
        available: usize,
    },
    /// The record's declared length is shorter than its fixed layout
    #[error("event record at offset {offset} declares impossible length {length}")]
    InvalidLength {
        /// Byte offset of the record header
        offset: usize,
        /// The declared total record length
        length: usize,
    },
}
