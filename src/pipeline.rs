//! Double-buffered hand-off between a buffer producer and display pipes.
//!
//! A producer (typically a capture device) delivers filled buffers; the
//! display consumes them one flip at a time. The [`FlipPipeline`] sits
//! between the two and owns the per-pipe bookkeeping:
//!
//! - the buffer currently on screen (`displayed`),
//! - the buffer whose commit is in flight (`pending`),
//! - everything else waiting its turn (`queue`).
//!
//! At most one commit is outstanding per pipe at any time. That bounds the
//! kernel's queue depth to one and keeps completion-to-request correlation
//! unambiguous: a pipe's token is never reused while a previous use is
//! unresolved. When a completion arrives, the previously displayed buffer
//! goes back to the producer — only then, the kernel may scan it out right
//! up to the acknowledgement — and the queue is drained immediately instead
//! of waiting for the next loop iteration.
//!
//! Buffers are never dropped under backpressure. If the producer outruns
//! the display the queue grows, and crossing the configured threshold is
//! reported once as a [`SaturationWarning`]; throttling is the producer's
//! job, since queueing without bound would exhaust buffer memory.

use std::collections::{HashMap, VecDeque};

use drm::control::crtc;
use tracing::{debug, info_span, trace, warn};

use crate::buffer::ScanoutBuffer;
use crate::device::{PlaneInfo, PropMapping};
use crate::error::Error;
use crate::events::{EventKind, EventRecord};
use crate::geometry::{Buffer, Physical, Rectangle};
use crate::request::{AtomicRequest, CommitDevice};

/// The consumer side of the buffer hand-off.
///
/// Implemented by whatever fills the buffers. [`return_buffer`] is the only
/// point at which a buffer's memory may legally be reused; until then the
/// kernel may still be reading it.
///
/// [`return_buffer`]: BufferProducer::return_buffer
pub trait BufferProducer {
    /// Hands a buffer back for refill
    fn return_buffer(&mut self, buffer: ScanoutBuffer);
}

/// Which plane of which pipe a stream of buffers is displayed on, and where.
#[derive(Debug, Clone)]
pub struct PlaneAssignment {
    /// The crtc of the pipe
    pub crtc: crtc::Handle,
    /// The plane scanning the buffers out
    pub plane: PlaneInfo,
    /// Source rectangle; `None` shows each buffer in full
    pub src: Option<Rectangle<f64, Buffer>>,
    /// Destination rectangle; `None` places the source size at the origin
    pub dst: Option<Rectangle<i32, Physical>>,
    /// Z-order of the plane, if it should be set
    pub zpos: Option<u64>,
}

/// Tuning knobs of a [`FlipPipeline`]
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Queue depth at which a [`SaturationWarning`] is reported
    pub saturation_threshold: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            saturation_threshold: 4,
        }
    }
}

/// The lifecycle phase of one pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipePhase {
    /// Nothing committed yet
    Idle,
    /// The first commit is in flight, nothing on screen yet
    Armed,
    /// A buffer is on screen
    Steady,
}

/// The producer is delivering buffers faster than the display retires them.
///
/// Not an error: nothing was dropped. Reported exactly once each time the
/// queue grows across the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaturationWarning {
    /// The affected pipe
    pub crtc: crtc::Handle,
    /// Queue depth at the time of the warning
    pub depth: usize,
}

/// Hand-off state of one pipe.
///
/// All mutation happens through the [`FlipPipeline`] transition functions;
/// this view is read-only.
#[derive(Debug)]
pub struct PipeState {
    assignment: PlaneAssignment,
    displayed: Option<ScanoutBuffer>,
    pending: Option<ScanoutBuffer>,
    queue: VecDeque<ScanoutBuffer>,
    /// set once the full plane setup has been committed
    armed: bool,
    saturated: bool,
    span: tracing::Span,
}

impl PipeState {
    /// The buffer currently on screen
    pub fn displayed(&self) -> Option<&ScanoutBuffer> {
        self.displayed.as_ref()
    }

    /// The buffer whose commit is submitted but not yet acknowledged
    pub fn pending(&self) -> Option<&ScanoutBuffer> {
        self.pending.as_ref()
    }

    /// Buffers awaiting display, in producer order
    pub fn queued(&self) -> impl Iterator<Item = &ScanoutBuffer> {
        self.queue.iter()
    }

    /// Number of buffers awaiting display
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Whether a commit is in flight for this pipe
    pub fn commit_outstanding(&self) -> bool {
        self.pending.is_some()
    }

    /// The pipe's current lifecycle phase
    pub fn phase(&self) -> PipePhase {
        if self.displayed.is_some() {
            PipePhase::Steady
        } else if self.pending.is_some() {
            PipePhase::Armed
        } else {
            PipePhase::Idle
        }
    }
}

/// Orchestrates buffer hand-off for one or more pipes of one device.
///
/// Owns the per-pipe state and the producer end; the resource layer decides
/// *which* crtcs and planes to drive and attaches them here.
#[derive(Debug)]
pub struct FlipPipeline<D: CommitDevice, P: BufferProducer> {
    device: D,
    props: PropMapping,
    producer: P,
    config: PipelineConfig,
    pipes: HashMap<crtc::Handle, PipeState>,
}

impl<D: CommitDevice, P: BufferProducer> FlipPipeline<D, P> {
    /// Creates a pipeline submitting through `device` and recycling buffers
    /// to `producer`
    pub fn new(device: D, props: PropMapping, producer: P, config: PipelineConfig) -> FlipPipeline<D, P> {
        FlipPipeline {
            device,
            props,
            producer,
            config,
            pipes: HashMap::new(),
        }
    }

    /// Starts driving a pipe.
    ///
    /// The pipe stays [`Idle`](PipePhase::Idle) until the first buffer
    /// arrives; that first commit carries the full plane setup, later ones
    /// only swap the framebuffer.
    ///
    /// # Panics
    ///
    /// Panics if the crtc is already attached.
    pub fn attach(&mut self, assignment: PlaneAssignment) {
        let crtc = assignment.crtc;
        assert!(
            !self.pipes.contains_key(&crtc),
            "pipe {crtc:?} is already attached",
        );

        let span = info_span!("scanout_pipe", crtc = ?crtc);
        debug!(parent: &span, plane = ?assignment.plane.handle, "Attaching pipe");

        self.pipes.insert(
            crtc,
            PipeState {
                assignment,
                displayed: None,
                pending: None,
                queue: VecDeque::new(),
                armed: false,
                saturated: false,
                span,
            },
        );
    }

    /// Stops driving a pipe and returns every buffer it held to the
    /// producer.
    ///
    /// An in-flight commit cannot be cancelled — the protocol has no cancel
    /// — its completion is simply no longer acted upon. Detaching a crtc
    /// that is not attached is a no-op.
    pub fn detach(&mut self, crtc: crtc::Handle) {
        let Some(mut pipe) = self.pipes.remove(&crtc) else {
            return;
        };
        debug!(parent: &pipe.span, "Detaching pipe");

        let held = pipe
            .displayed
            .take()
            .into_iter()
            .chain(pipe.pending.take())
            .chain(pipe.queue.drain(..));
        for buffer in held {
            self.producer.return_buffer(buffer);
        }
    }

    /// Read access to the state of one pipe
    pub fn pipe(&self, crtc: crtc::Handle) -> Option<&PipeState> {
        self.pipes.get(&crtc)
    }

    /// Accepts a filled buffer from the producer.
    ///
    /// The buffer is queued and, if no commit is outstanding for the pipe,
    /// committed right away. Returns a [`SaturationWarning`] when this
    /// enqueue grew the queue across the configured threshold.
    ///
    /// # Panics
    ///
    /// Panics if no pipe is attached for `crtc`.
    pub fn buffer_ready(
        &mut self,
        crtc: crtc::Handle,
        buffer: ScanoutBuffer,
    ) -> Result<Option<SaturationWarning>, Error> {
        let pipe = self
            .pipes
            .get_mut(&crtc)
            .unwrap_or_else(|| panic!("no pipe attached for {crtc:?}"));
        trace!(parent: &pipe.span, fb = ?buffer.fb, depth = pipe.queue.len() + 1, "Buffer ready");
        pipe.queue.push_back(buffer);
        let outstanding = pipe.pending.is_some();

        if !outstanding {
            self.try_advance(crtc)?;
        }

        let threshold = self.config.saturation_threshold;
        let pipe = self.pipes.get_mut(&crtc).unwrap();
        let depth = pipe.queue.len();
        if depth >= threshold && !pipe.saturated {
            pipe.saturated = true;
            warn!(parent: &pipe.span, depth, "Producer is outrunning the display, queue saturated");
            return Ok(Some(SaturationWarning { crtc, depth }));
        }
        Ok(None)
    }

    /// Commits the head of the pipe's queue if nothing is in flight.
    ///
    /// A no-op when the queue is empty or a commit is already outstanding.
    /// On a kernel rejection the buffer goes back to the head of the queue
    /// and the error is returned; nothing is retried automatically, since a
    /// rejected plane update is usually a logic error rather than a
    /// transient condition.
    ///
    /// # Panics
    ///
    /// Panics if no pipe is attached for `crtc`.
    #[profiling::function]
    pub fn try_advance(&mut self, crtc: crtc::Handle) -> Result<(), Error> {
        let props = &self.props;
        let device = &self.device;
        let pipe = self
            .pipes
            .get_mut(&crtc)
            .unwrap_or_else(|| panic!("no pipe attached for {crtc:?}"));

        if pipe.pending.is_some() || pipe.queue.is_empty() {
            return Ok(());
        }

        let buffer = pipe.queue.pop_front().unwrap();
        if pipe.queue.len() < self.config.saturation_threshold {
            pipe.saturated = false;
        }

        let submit = |pipe: &PipeState, buffer: &ScanoutBuffer| -> Result<(), Error> {
            let mut req = AtomicRequest::new(props);
            if pipe.armed {
                req.add(pipe.assignment.plane.handle, "FB_ID", u32::from(buffer.fb) as u64)?;
            } else {
                trace!(parent: &pipe.span, "First commit carries the full plane setup");
                req.add_plane(
                    &pipe.assignment.plane,
                    buffer,
                    crtc,
                    pipe.assignment.src,
                    pipe.assignment.dst,
                    pipe.assignment.zpos,
                    &[],
                )?;
            }
            // plane updates never set a mode; the correlation token is the
            // pipe's own identity
            req.commit(device, u32::from(crtc) as u64, false)
        };

        match submit(pipe, &buffer) {
            Ok(()) => {
                trace!(parent: &pipe.span, fb = ?buffer.fb, "Queued flip");
                pipe.armed = true;
                pipe.pending = Some(buffer);
                Ok(())
            }
            Err(err) => {
                // the buffer stays with the pipeline, head of the line for a retry
                pipe.queue.push_front(buffer);
                Err(err)
            }
        }
    }

    /// Handles the completion of a previously submitted commit.
    ///
    /// Resolves the correlation token back to its pipe, recycles the buffer
    /// that just left the screen to the producer, promotes the pending
    /// buffer and immediately commits the next queued one, if any. Returns
    /// the pipe the completion belonged to, or `None` for tokens of pipes
    /// this pipeline no longer drives.
    pub fn flip_complete(&mut self, user_data: u64) -> Result<Option<crtc::Handle>, Error> {
        let crtc = self
            .pipes
            .keys()
            .copied()
            .find(|crtc| u32::from(*crtc) as u64 == user_data);
        let Some(crtc) = crtc else {
            trace!(user_data, "Completion for a pipe this pipeline does not drive");
            return Ok(None);
        };

        let pipe = self.pipes.get_mut(&crtc).unwrap();
        let Some(next) = pipe.pending.take() else {
            debug!(parent: &pipe.span, "Completion with no commit outstanding");
            return Ok(None);
        };

        trace!(parent: &pipe.span, fb = ?next.fb, "Flip complete");
        let previous = pipe.displayed.replace(next);
        if let Some(previous) = previous {
            // the kernel read from this buffer right up to the
            // acknowledgement, it may only be refilled from here on
            self.producer.return_buffer(previous);
        }

        // drain the queue in the same tick, not on the next loop iteration
        self.try_advance(crtc)?;
        Ok(Some(crtc))
    }

    /// Routes one decoded event record.
    ///
    /// Flip completions feed [`flip_complete`](Self::flip_complete); plain
    /// vblank records do not concern the hand-off and are ignored.
    pub fn dispatch(&mut self, event: &EventRecord) -> Result<Option<crtc::Handle>, Error> {
        match event.kind {
            EventKind::FlipComplete => self.flip_complete(event.user_data),
            EventKind::VBlank => Ok(None),
        }
    }

    /// Access to the producer end, e.g. to drive it from the same event loop
    pub fn producer_mut(&mut self) -> &mut P {
        &mut self.producer
    }
}
