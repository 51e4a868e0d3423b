#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # Scanout: atomic KMS display plumbing
//!
//! This crate drives hardware display outputs through the kernel's atomic
//! modesetting api. A caller builds a batch of property changes — which
//! buffer a plane shows, its placement and scaling, which mode a pipe runs,
//! which connector a pipe drives — and submits the batch as a single commit
//! that the kernel accepts or rejects as a whole. Completion of an
//! asynchronous commit is reported through the device's binary event stream,
//! correlated back to the submission by an opaque token.
//!
//! ## Structure of the crate
//!
//! - [`events`] decodes the raw completion-event stream into typed
//!   [`EventRecord`]s.
//! - [`request`] builds atomic commits ([`AtomicRequest`]) and submits them
//!   in one of three modes: validate-only, non-blocking with a completion
//!   event, or blocking.
//! - [`pipeline`] is the [`FlipPipeline`] state machine tying a buffer
//!   producer (e.g. a capture device) to display pipes, double-buffered,
//!   with at most one commit outstanding per pipe.
//! - [`device`] wraps the open drm node: fd lifecycle ([`DrmDeviceFd`]),
//!   property-name resolution ([`PropMapping`]) and the [`calloop`] event
//!   source ([`DrmDevice`]).
//! - [`fixed`] and [`geometry`] keep the two coordinate spaces of the
//!   property interface — 16.16 fixed-point plane sources, integer pipe
//!   destinations — from ever being confused.
//!
//! Resource discovery (which connector, crtc and plane to use), buffer
//! allocation and mode handling are deliberately *not* part of this crate;
//! it consumes already-resolved handles.
//!
//! ## The event loop
//!
//! Everything is single-threaded and readiness-driven, built around
//! [`calloop`]: the [`DrmDevice`] is an event source dispatching decoded
//! completion records, producer fds are registered alongside it, and all
//! state lives in the value passed through the loop — no handler blocks,
//! except a blocking initial mode-set before the loop starts.
//!
//! ```ignore
//! use scanout::{DrmDevice, DrmDeviceFd, DrmEvent, FlipPipeline};
//!
//! let fd = DrmDeviceFd::new(std::fs::File::open("/dev/dri/card0")?.into());
//! let mut device = DrmDevice::new(fd.clone())?;
//!
//! // resolve connector/crtc/plane/buffers externally, mode-set once,
//! // then hand the pipe to a FlipPipeline and run the loop:
//! let mut event_loop = calloop::EventLoop::<State>::try_new()?;
//! event_loop.handle().insert_source(device, |event, _, state| {
//!     match event {
//!         DrmEvent::Completion(record) => {
//!             state.pipeline.dispatch(&record).unwrap();
//!         }
//!         DrmEvent::Error(err) => panic!("event stream broke: {err}"),
//!     }
//! })?;
//! // + one source per producer fd calling state.pipeline.buffer_ready(..)
//! event_loop.run(None, &mut state, |_| {})?;
//! ```
//!
//! ## Logging
//!
//! This crate makes use of [`tracing`] for its internal logging. Attach a
//! subscriber (e.g. `tracing-subscriber`) to see per-device and per-pipe
//! spans around every commit and hand-off transition.

pub mod buffer;
pub mod device;
pub mod error;
pub mod events;
pub mod fixed;
pub mod geometry;
pub mod pipeline;
pub mod request;

pub use buffer::{PlaneLayout, ScanoutBuffer};
pub use device::{DevPath, DrmDevice, DrmDeviceFd, DrmEvent, PlaneInfo, PropMapping};
pub use error::{AccessError, DecodeError, Error};
pub use events::{EventKind, EventRecord, Events};
pub use pipeline::{
    BufferProducer, FlipPipeline, PipePhase, PipeState, PipelineConfig, PlaneAssignment,
    SaturationWarning,
};
pub use request::{AtomicRequest, CommitBatch, CommitDevice, CommitFlags, Object};
