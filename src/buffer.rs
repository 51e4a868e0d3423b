//! Framebuffer handles as seen by the scanout pipeline.

use drm::control::framebuffer;
use drm_fourcc::DrmFourcc;
use smallvec::SmallVec;

use crate::geometry::{Buffer, Rectangle, Size};

/// Memory layout of one plane of a [`ScanoutBuffer`].
///
/// Multi-planar formats (e.g. NV12) carry one descriptor per plane; packed
/// formats carry exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Driver-local buffer object handle backing this plane
    pub handle: u32,
    /// Bytes per row
    pub pitch: u32,
    /// Byte offset of the plane's first pixel inside the buffer object
    pub offset: u32,
}

/// A pixel buffer registered with the display subsystem.
///
/// Created by the external allocation layer and only *referenced* here: the
/// pipeline never frees one. At any instant a buffer is logically owned
/// either by the producer (being filled) or by the pipeline (queued, pending
/// or on screen) — the [`FlipPipeline`](crate::FlipPipeline) state machine
/// moves it between the two and hands it back through
/// [`BufferProducer::return_buffer`](crate::BufferProducer::return_buffer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanoutBuffer {
    /// The framebuffer handle the kernel knows this buffer by
    pub fb: framebuffer::Handle,
    /// Dimensions in pixels
    pub size: Size<u32, Buffer>,
    /// Pixel format
    pub format: DrmFourcc,
    /// Per-plane memory descriptors
    pub planes: SmallVec<[PlaneLayout; 4]>,
}

impl ScanoutBuffer {
    /// The source rectangle covering the whole buffer
    pub fn full_rect(&self) -> Rectangle<f64, Buffer> {
        Rectangle::from_size(self.size).to_f64()
    }
}
