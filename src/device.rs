//! The open DRM device: fd lifecycle, property lookup and the event source.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;

use calloop::generic::Generic;
use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use drm::control::{connector, crtc, plane, property, Device as ControlDevice, ResourceHandle};
use drm::{ClientCapability, Device as BasicDevice};
use drm_fourcc::DrmFourcc;
use tracing::{debug, info, info_span, trace, warn};

use crate::error::{AccessError, Error};
use crate::events::{EventRecord, Events};
use crate::request::{atomic_commit_ioctl, AtomicRequest, CommitBatch, CommitDevice, CommitFlags};

/// Size of the read buffer for the event stream. Events are small and the
/// kernel only delivers whole records, so this bounds one batch of them.
const EVENT_BUFFER_LEN: usize = 1024;

/// Trait representing open devices that *may* return a `Path`
pub trait DevPath {
    /// Returns the path of the open device if possible
    fn dev_path(&self) -> Option<PathBuf>;
}

impl<A: AsFd> DevPath for A {
    fn dev_path(&self) -> Option<PathBuf> {
        fs::read_link(format!("/proc/self/fd/{}", self.as_fd().as_raw_fd())).ok()
    }
}

#[derive(Debug)]
struct InternalDrmDeviceFd {
    fd: OwnedFd,
    privileged: bool,
}

impl Drop for InternalDrmDeviceFd {
    fn drop(&mut self) {
        info!("Dropping device: {:?}", self.fd.dev_path());
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                tracing::error!("Failed to drop drm master state. Error: {}", err);
            }
        }
    }
}

impl AsFd for InternalDrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalDrmDeviceFd {}
impl ControlDevice for InternalDrmDeviceFd {}

/// Ref-counted file descriptor of an open drm device node.
///
/// Opening the node and choosing which one to open belongs to the resource
/// layer; this type takes over an already-open fd.
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl DrmDeviceFd {
    /// Wraps an open drm node.
    ///
    /// Tries to acquire the master lock for the device and releases it again
    /// on the last drop. For that reason do not create multiple
    /// `DrmDeviceFd`s from dups of the same node; clone this one instead.
    pub fn new(fd: OwnedFd) -> DrmDeviceFd {
        let mut dev = InternalDrmDeviceFd {
            fd,
            privileged: false,
        };

        // We want to modeset, so we better be the master, if we run via a tty session.
        // This is only needed on older kernels. Newer kernels grant this permission,
        // if no other process is already the *master*. So we skip over this error.
        if dev.acquire_master_lock().is_err() {
            warn!("Unable to become drm master, assuming unprivileged mode");
        } else {
            dev.privileged = true;
        }

        DrmDeviceFd(Arc::new(dev))
    }
}

impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}

impl CommitDevice for DrmDeviceFd {
    fn atomic_commit(&self, flags: CommitFlags, batch: CommitBatch, user_data: u64) -> io::Result<()> {
        atomic_commit_ioctl(self.as_fd(), flags, &batch, user_data)
    }

    fn dev_path(&self) -> Option<PathBuf> {
        DevPath::dev_path(self)
    }
}

/// Cached mapping of property names to property handles, per object.
///
/// The atomic api addresses everything through properties, and the handle
/// for a given name is not consistent across devices, so the lookup is done
/// once for the resolved objects and cached here.
#[derive(Clone, Debug, Default)]
pub struct PropMapping {
    /// Properties of the resolved connectors
    pub connectors: HashMap<connector::Handle, HashMap<String, property::Handle>>,
    /// Properties of the resolved crtcs
    pub crtcs: HashMap<crtc::Handle, HashMap<String, property::Handle>>,
    /// Properties of the resolved planes
    pub planes: HashMap<plane::Handle, HashMap<String, property::Handle>>,
}

impl PropMapping {
    /// Queries the properties of all given objects from the device
    pub fn from_device<D>(
        device: &D,
        connectors: &[connector::Handle],
        crtcs: &[crtc::Handle],
        planes: &[plane::Handle],
    ) -> Result<PropMapping, Error>
    where
        D: ControlDevice + DevPath,
    {
        let mut mapping = PropMapping::default();
        map_props(device, connectors, &mut mapping.connectors)?;
        map_props(device, crtcs, &mut mapping.crtcs)?;
        map_props(device, planes, &mut mapping.planes)?;
        trace!("Mapping: {:#?}", mapping);
        Ok(mapping)
    }

    pub(crate) fn conn_prop_handle(
        &self,
        handle: connector::Handle,
        name: &'static str,
    ) -> Result<property::Handle, Error> {
        self.connectors
            .get(&handle)
            .ok_or(Error::UnknownConnector(handle))?
            .get(name)
            .ok_or_else(|| Error::UnknownProperty {
                handle: handle.into(),
                name,
            })
            .copied()
    }

    pub(crate) fn crtc_prop_handle(
        &self,
        handle: crtc::Handle,
        name: &'static str,
    ) -> Result<property::Handle, Error> {
        self.crtcs
            .get(&handle)
            .ok_or(Error::UnknownCrtc(handle))?
            .get(name)
            .ok_or_else(|| Error::UnknownProperty {
                handle: handle.into(),
                name,
            })
            .copied()
    }

    pub(crate) fn plane_prop_handle(
        &self,
        handle: plane::Handle,
        name: &'static str,
    ) -> Result<property::Handle, Error> {
        self.planes
            .get(&handle)
            .ok_or(Error::UnknownPlane(handle))?
            .get(name)
            .ok_or_else(|| Error::UnknownProperty {
                handle: handle.into(),
                name,
            })
            .copied()
    }
}

/// Create a mapping of property names and handles for the given handles of
/// one drm resource type.
fn map_props<D, T>(
    device: &D,
    handles: &[T],
    mapping: &mut HashMap<T, HashMap<String, property::Handle>>,
) -> Result<(), Error>
where
    D: ControlDevice + DevPath,
    T: ResourceHandle + Eq + std::hash::Hash + Copy,
{
    handles
        .iter()
        .map(|handle| (handle, device.get_properties(*handle)))
        .try_for_each(|(handle, props)| match props {
            Ok(props) => {
                let mut map = HashMap::new();
                let (prop_handles, _) = props.as_props_and_values();
                for prop in prop_handles {
                    if let Ok(info) = device.get_property(*prop) {
                        let name = info.name().to_string_lossy().into_owned();
                        map.insert(name, *prop);
                    }
                }
                mapping.insert(*handle, map);
                Ok(())
            }
            Err(err) => Err(err),
        })
        .map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Error reading properties",
                dev: device.dev_path(),
                source,
            })
        })
}

/// A resolved plane and the pixel formats it can scan out
#[derive(Debug, Clone)]
pub struct PlaneInfo {
    /// The plane handle
    pub handle: plane::Handle,
    /// Formats the plane supports. Empty means unknown, which disables the
    /// format check in [`AtomicRequest::add_plane`](crate::AtomicRequest::add_plane).
    pub formats: Vec<DrmFourcc>,
}

impl PlaneInfo {
    /// Creates a plane description from already-known parts
    pub fn new(handle: plane::Handle, formats: Vec<DrmFourcc>) -> PlaneInfo {
        PlaneInfo { handle, formats }
    }

    /// Queries the plane's supported formats from the device
    pub fn from_device<D>(device: &D, handle: plane::Handle) -> Result<PlaneInfo, Error>
    where
        D: ControlDevice + DevPath,
    {
        let info = device.get_plane(handle).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to get plane info",
                dev: device.dev_path(),
                source,
            })
        })?;
        let formats = info
            .formats()
            .iter()
            .filter_map(|format| DrmFourcc::try_from(*format).ok())
            .collect();
        Ok(PlaneInfo { handle, formats })
    }

    /// Whether the plane can scan out buffers of the given format
    pub fn supports(&self, format: DrmFourcc) -> bool {
        self.formats.is_empty() || self.formats.contains(&format)
    }
}

/// Events that can be generated by a [`DrmDevice`]
#[derive(Debug)]
pub enum DrmEvent {
    /// A completion record was decoded from the device's event stream
    Completion(EventRecord),
    /// An error happened while reading or decoding events
    Error(Error),
}

/// An open drm device, ready to be inserted into a [`calloop`] event loop.
///
/// Dispatches the decoded completion events to the loop's callback whenever
/// the device fd becomes readable. A decode error is reported once, after
/// which the source disables itself: the correlation state of anything
/// driven from this stream can no longer be trusted.
#[derive(Debug)]
pub struct DrmDevice {
    source: Generic<DrmDeviceFd>,
    event_buffer: Box<[u8]>,
    span: tracing::Span,
}

impl DrmDevice {
    /// Initializes the device for atomic use.
    ///
    /// Enables the `UniversalPlanes` and `Atomic` client capabilities; a
    /// device refusing either cannot be driven by this crate.
    pub fn new(fd: DrmDeviceFd) -> Result<DrmDevice, Error> {
        let span = info_span!("scanout_device", dev = ?DevPath::dev_path(&fd));
        {
            let _guard = span.enter();
            info!("Initializing device");

            for capability in [ClientCapability::UniversalPlanes, ClientCapability::Atomic] {
                fd.set_client_capability(capability, true).map_err(|source| {
                    Error::Access(AccessError {
                        errmsg: "Error enabling client capability",
                        dev: DevPath::dev_path(&fd),
                        source,
                    })
                })?;
            }
        }

        Ok(DrmDevice {
            source: Generic::new(fd, Interest::READ, Mode::Level),
            event_buffer: vec![0; EVENT_BUFFER_LEN].into_boxed_slice(),
            span,
        })
    }

    /// Returns a handle to the underlying fd, e.g. for submitting commits
    pub fn device_fd(&self) -> DrmDeviceFd {
        self.source.get_ref().clone()
    }

    /// Reads and decodes all events the device has pending.
    ///
    /// One raw read is performed. A read of zero bytes yields an empty
    /// sequence (end of available data); a would-block error on a
    /// non-blocking fd is propagated for the caller to treat as "poll
    /// again". Usually not called directly — the [`EventSource`] impl does
    /// this when the event loop signals readiness.
    pub fn receive_events(&mut self) -> Result<Events<'_>, Error> {
        let read = rustix::io::read(self.source.get_ref(), &mut self.event_buffer).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Error reading device events",
                dev: DevPath::dev_path(self.source.get_ref()),
                source: source.into(),
            })
        })?;
        trace!(bytes = read, "Read from the event stream");
        Ok(Events::new(&self.event_buffer[..read]))
    }

    /// Disables every connector, plane and crtc in `props` with one
    /// mode-setting commit.
    ///
    /// Useful on startup to get the device out of whatever state the
    /// previous user left it in, so later commits do not fail over
    /// conflicting routing.
    pub fn reset_state(&self, props: &PropMapping) -> Result<(), Error> {
        let _guard = self.span.enter();
        debug!("Resetting device to a known state");

        let mut req = AtomicRequest::new(props);
        for conn in props.connectors.keys() {
            req.add(*conn, "CRTC_ID", 0)?;
        }
        for plane in props.planes.keys() {
            req.add(*plane, "FB_ID", 0)?;
            req.add(*plane, "CRTC_ID", 0)?;
        }
        for crtc in props.crtcs.keys() {
            req.add(*crtc, "ACTIVE", 0)?;
            req.add(*crtc, "MODE_ID", 0)?;
        }
        req.commit_sync(self.source.get_ref(), true)
    }
}

impl EventSource for DrmDevice {
    type Event = DrmEvent;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(
        &mut self,
        readiness: Readiness,
        token: Token,
        mut callback: F,
    ) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        let buffer = &mut self.event_buffer;
        let span = &self.span;

        self.source.process_events(readiness, token, |_, fd| {
            let _guard = span.enter();

            let read = match rustix::io::read(&**fd, &mut buffer[..]) {
                Ok(read) => read,
                Err(err) if err == rustix::io::Errno::AGAIN => return Ok(PostAction::Continue),
                Err(err) => return Err(err.into()),
            };
            trace!(bytes = read, "Read from the event stream");

            for event in Events::new(&buffer[..read]) {
                match event {
                    Ok(record) => callback(DrmEvent::Completion(record), &mut ()),
                    Err(err) => {
                        // correlation state is unrecoverable past this point,
                        // stop driving anything from this stream
                        callback(DrmEvent::Error(err.into()), &mut ());
                        return Ok(PostAction::Disable);
                    }
                }
            }

            Ok(PostAction::Continue)
        })
    }

    fn register(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.register(poll, token_factory)
    }

    fn reregister(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.reregister(poll, token_factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.source.unregister(poll)
    }
}
