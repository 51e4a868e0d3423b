//! Building and submitting atomic commits.
//!
//! An [`AtomicRequest`] accumulates property assignments for connectors,
//! crtcs and planes and submits them as one all-or-nothing batch. The kernel
//! either applies every assignment in the batch or none of them; there is no
//! partial application.
//!
//! Three submission modes exist, mirroring the three ways the atomic ioctl
//! can be invoked:
//!
//! - [`test`](AtomicRequest::test) asks the kernel to *validate* the batch
//!   without applying anything,
//! - [`commit`](AtomicRequest::commit) queues the batch and returns
//!   immediately; completion is reported later through the event stream,
//!   correlated by the caller-supplied token,
//! - [`commit_sync`](AtomicRequest::commit_sync) applies the batch before
//!   returning and produces no event.
//!
//! Whether a batch may change the output configuration (mode, active state,
//! connector routing) is stated explicitly via `allow_modeset` at submission
//! time. The request tracks whether mode-setting properties were added and
//! refuses — before any kernel call — to submit them through the non-flagged
//! path, instead of letting the kernel degrade the commit or reject it with
//! an unhelpful error.

use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd};
use std::path::PathBuf;

use drm::control::{connector, crtc, plane, property, RawResourceHandle};
use indexmap::IndexMap;
use tracing::trace;

use crate::buffer::ScanoutBuffer;
use crate::device::{PlaneInfo, PropMapping};
use crate::error::{AccessError, Error};
use crate::fixed::rect_to_fixed;
use crate::geometry::{Buffer, Physical, Rectangle};

bitflags::bitflags! {
    /// Flags accepted by the atomic-commit ioctl
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommitFlags: u32 {
        /// Request a completion event for this commit
        const PAGE_FLIP_EVENT = 0x0001;
        /// Check the configuration without applying it
        const TEST_ONLY = 0x0100;
        /// Queue the commit and return immediately
        const NONBLOCK = 0x0200;
        /// Permit changes that require a full modeset
        const ALLOW_MODESET = 0x0400;
    }
}

/// Any KMS object an atomic request can address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Object {
    /// A connector
    Connector(connector::Handle),
    /// A crtc
    Crtc(crtc::Handle),
    /// A plane
    Plane(plane::Handle),
}

impl Object {
    fn raw(&self) -> RawResourceHandle {
        match *self {
            Object::Connector(handle) => handle.into(),
            Object::Crtc(handle) => handle.into(),
            Object::Plane(handle) => handle.into(),
        }
    }
}

impl From<connector::Handle> for Object {
    fn from(handle: connector::Handle) -> Self {
        Object::Connector(handle)
    }
}

impl From<crtc::Handle> for Object {
    fn from(handle: crtc::Handle) -> Self {
        Object::Crtc(handle)
    }
}

impl From<plane::Handle> for Object {
    fn from(handle: plane::Handle) -> Self {
        Object::Plane(handle)
    }
}

/// Property arrays marshalled into the layout the atomic ioctl consumes:
/// one entry per object, its properties and values flattened in order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommitBatch {
    /// Object ids, each listed once
    pub objects: Vec<u32>,
    /// Number of properties per object
    pub count_props: Vec<u32>,
    /// Property ids, grouped by object
    pub props: Vec<u32>,
    /// Property values, parallel to `props`
    pub values: Vec<u64>,
}

/// The kernel-facing half of commit submission.
///
/// Implemented by [`DrmDeviceFd`](crate::DrmDeviceFd); tests substitute a
/// recording implementation.
pub trait CommitDevice {
    /// Submit one marshalled batch with the given flags and correlation token
    fn atomic_commit(&self, flags: CommitFlags, batch: CommitBatch, user_data: u64) -> io::Result<()>;

    /// Path of the underlying device node, for error reporting
    fn dev_path(&self) -> Option<PathBuf> {
        None
    }
}

/// An atomic commit under construction.
///
/// Accumulates `(object, property) -> value` assignments, ordered, with
/// last-write-wins semantics for duplicates — the kernel treats the batch as
/// a property map, and so does this builder. Consumed by submission.
#[derive(Debug)]
pub struct AtomicRequest<'a> {
    props: &'a PropMapping,
    values: IndexMap<RawResourceHandle, IndexMap<property::Handle, u64>>,
    modeset: bool,
}

impl<'a> AtomicRequest<'a> {
    /// Creates an empty request resolving property names through `props`
    pub fn new(props: &'a PropMapping) -> AtomicRequest<'a> {
        AtomicRequest {
            props,
            values: IndexMap::new(),
            modeset: false,
        }
    }

    /// Appends one property assignment.
    ///
    /// The property name is resolved against the object's class; an object
    /// the mapping does not know, or a name the object does not have, is an
    /// error. Assigning the same property of the same object twice
    /// overwrites the earlier value.
    pub fn add(&mut self, object: impl Into<Object>, name: &'static str, value: u64) -> Result<(), Error> {
        let object = object.into();
        let prop = match object {
            Object::Connector(handle) => self.props.conn_prop_handle(handle, name)?,
            Object::Crtc(handle) => self.props.crtc_prop_handle(handle, name)?,
            Object::Plane(handle) => self.props.plane_prop_handle(handle, name)?,
        };

        // these are the properties whose change requires a full modeset
        self.modeset |= matches!(
            (object, name),
            (Object::Connector(_), "CRTC_ID") | (Object::Crtc(_), "MODE_ID") | (Object::Crtc(_), "ACTIVE")
        );

        self.values.entry(object.raw()).or_default().insert(prop, value);
        Ok(())
    }

    /// Assigns a framebuffer to a plane on a crtc, with source and
    /// destination geometry.
    ///
    /// Expands to the full `FB_ID`/`CRTC_ID`/`SRC_*`/`CRTC_*` set plus any
    /// `extra_props`. `src` defaults to the whole buffer, `dst` to the
    /// source size at the origin. Only the source rectangle passes through
    /// the 16.16 conversion; the destination stays in integer pipe
    /// coordinates.
    ///
    /// # Panics
    ///
    /// Panics if the buffer's pixel format is not supported by the plane.
    /// That mismatch is a programmer error in the resource setup, not a
    /// runtime condition.
    pub fn add_plane(
        &mut self,
        plane: &PlaneInfo,
        buffer: &ScanoutBuffer,
        crtc: crtc::Handle,
        src: Option<Rectangle<f64, Buffer>>,
        dst: Option<Rectangle<i32, Physical>>,
        zpos: Option<u64>,
        extra_props: &[(&'static str, u64)],
    ) -> Result<(), Error> {
        assert!(
            plane.supports(buffer.format),
            "plane {:?} does not support the {:?} format of framebuffer {:?}",
            plane.handle,
            buffer.format,
            buffer.fb,
        );

        let src = src.unwrap_or_else(|| buffer.full_rect());
        let dst = dst.unwrap_or_else(|| {
            Rectangle::from_size((src.size.w.round() as i32, src.size.h.round() as i32))
        });

        let handle = plane.handle;
        let [src_x, src_y, src_w, src_h] = rect_to_fixed(src);
        self.add(handle, "FB_ID", u32::from(buffer.fb) as u64)?;
        self.add(handle, "CRTC_ID", u32::from(crtc) as u64)?;
        // source rectangle, in 16.16 fixed point
        self.add(handle, "SRC_X", src_x as u64)?;
        self.add(handle, "SRC_Y", src_y as u64)?;
        self.add(handle, "SRC_W", src_w as u64)?;
        self.add(handle, "SRC_H", src_h as u64)?;
        // destination rectangle, in integer pipe coordinates
        self.add(handle, "CRTC_X", dst.loc.x as i64 as u64)?;
        self.add(handle, "CRTC_Y", dst.loc.y as i64 as u64)?;
        self.add(handle, "CRTC_W", dst.size.w as u64)?;
        self.add(handle, "CRTC_H", dst.size.h as u64)?;

        if let Some(zpos) = zpos {
            self.add(handle, "zpos", zpos)?;
        }
        for &(name, value) in extra_props {
            self.add(handle, name, value)?;
        }

        Ok(())
    }

    /// Routes a connector to a crtc, activates the crtc with the given mode
    /// blob and puts a first framebuffer on the primary plane.
    ///
    /// This is the usual initial-modeset batch; submit it with
    /// `allow_modeset` and, typically, [`commit_sync`](Self::commit_sync).
    pub fn add_display(
        &mut self,
        conn: connector::Handle,
        crtc: crtc::Handle,
        mode_blob: u64,
        plane: &PlaneInfo,
        buffer: &ScanoutBuffer,
    ) -> Result<(), Error> {
        self.add(conn, "CRTC_ID", u32::from(crtc) as u64)?;
        self.add(crtc, "ACTIVE", 1)?;
        self.add(crtc, "MODE_ID", mode_blob)?;
        self.add_plane(plane, buffer, crtc, None, None, None, &[])
    }

    /// Returns whether this request contains mode-setting properties
    pub fn is_modeset(&self) -> bool {
        self.modeset
    }

    /// Returns whether no property has been added yet
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Validates the batch kernel-side without applying it
    #[profiling::function]
    pub fn test<D: CommitDevice>(self, device: &D, allow_modeset: bool) -> Result<(), Error> {
        let mut flags = CommitFlags::TEST_ONLY;
        if allow_modeset {
            flags |= CommitFlags::ALLOW_MODESET;
        }
        self.submit(device, flags, 0, "Atomic test failed")
    }

    /// Queues the batch and returns immediately.
    ///
    /// The kernel reports completion through the event stream with a record
    /// carrying `user_data`; until that record arrives the submitted
    /// configuration may not be visible yet.
    #[profiling::function]
    pub fn commit<D: CommitDevice>(
        self,
        device: &D,
        user_data: u64,
        allow_modeset: bool,
    ) -> Result<(), Error> {
        let mut flags = CommitFlags::NONBLOCK | CommitFlags::PAGE_FLIP_EVENT;
        if allow_modeset {
            flags |= CommitFlags::ALLOW_MODESET;
        }
        self.submit(device, flags, user_data, "Atomic commit failed")
    }

    /// Applies the batch synchronously. No completion event is produced;
    /// the return is the completion signal.
    #[profiling::function]
    pub fn commit_sync<D: CommitDevice>(self, device: &D, allow_modeset: bool) -> Result<(), Error> {
        let mut flags = CommitFlags::empty();
        if allow_modeset {
            flags |= CommitFlags::ALLOW_MODESET;
        }
        self.submit(device, flags, 0, "Atomic commit failed")
    }

    fn submit<D: CommitDevice>(
        self,
        device: &D,
        flags: CommitFlags,
        user_data: u64,
        errmsg: &'static str,
    ) -> Result<(), Error> {
        assert!(
            !self.modeset || flags.contains(CommitFlags::ALLOW_MODESET),
            "mode-setting properties submitted without allow_modeset",
        );

        let batch = self.into_batch();
        trace!(?flags, user_data, ?batch, "Submitting atomic request");

        device.atomic_commit(flags, batch, user_data).map_err(|source| {
            Error::Access(AccessError {
                errmsg,
                dev: device.dev_path(),
                source,
            })
        })
    }

    fn into_batch(self) -> CommitBatch {
        let mut batch = CommitBatch::default();
        for (object, props) in self.values {
            batch.objects.push(object.get());
            batch.count_props.push(props.len() as u32);
            for (prop, value) in props {
                batch.props.push(u32::from(prop));
                batch.values.push(value);
            }
        }
        batch
    }
}

/// `struct drm_mode_atomic` from the kernel uapi
#[allow(non_camel_case_types)]
#[repr(C)]
struct drm_mode_atomic {
    flags: u32,
    count_objs: u32,
    objs_ptr: u64,
    count_props_ptr: u64,
    props_ptr: u64,
    prop_values_ptr: u64,
    reserved: u64,
    user_data: u64,
}

/// `DRM_IOWR(0xBC, struct drm_mode_atomic)`
const DRM_IOCTL_MODE_ATOMIC: u32 =
    (3 << 30) | ((std::mem::size_of::<drm_mode_atomic>() as u32) << 16) | ((b'd' as u32) << 8) | 0xBC;

/// Issues the atomic ioctl, retrying on `EINTR`/`EAGAIN` like libdrm does.
pub(crate) fn atomic_commit_ioctl(
    fd: BorrowedFd<'_>,
    flags: CommitFlags,
    batch: &CommitBatch,
    user_data: u64,
) -> io::Result<()> {
    let mut arg = drm_mode_atomic {
        flags: flags.bits(),
        count_objs: batch.objects.len() as u32,
        objs_ptr: batch.objects.as_ptr() as usize as u64,
        count_props_ptr: batch.count_props.as_ptr() as usize as u64,
        props_ptr: batch.props.as_ptr() as usize as u64,
        prop_values_ptr: batch.values.as_ptr() as usize as u64,
        reserved: 0,
        user_data,
    };

    loop {
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), DRM_IOCTL_MODE_ATOMIC as _, &mut arg) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
            _ => return Err(err),
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::num::NonZeroU32;

    use super::*;
    use crate::device::PlaneInfo;
    use drm_fourcc::DrmFourcc;
    use smallvec::smallvec;

    #[derive(Default)]
    struct Recorder {
        commits: RefCell<Vec<(CommitFlags, CommitBatch, u64)>>,
    }

    impl CommitDevice for Recorder {
        fn atomic_commit(&self, flags: CommitFlags, batch: CommitBatch, user_data: u64) -> io::Result<()> {
            self.commits.borrow_mut().push((flags, batch, user_data));
            Ok(())
        }
    }

    fn raw(id: u32) -> NonZeroU32 {
        NonZeroU32::new(id).unwrap()
    }

    fn mapping() -> PropMapping {
        let mut props = PropMapping::default();
        let conn = connector::Handle::from(raw(31));
        let crtc = crtc::Handle::from(raw(41));
        let plane = plane::Handle::from(raw(51));

        let mut next = 100u32;
        let mut named = |names: &[&str]| {
            let mut map = std::collections::HashMap::new();
            for name in names {
                map.insert(name.to_string(), property::Handle::from(raw(next)));
                next += 1;
            }
            map
        };

        props.connectors.insert(conn, named(&["CRTC_ID"]));
        props.crtcs.insert(crtc, named(&["ACTIVE", "MODE_ID"]));
        props.planes.insert(
            plane,
            named(&[
                "FB_ID", "CRTC_ID", "SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y", "CRTC_W",
                "CRTC_H", "zpos",
            ]),
        );
        props
    }

    fn plane_info() -> PlaneInfo {
        PlaneInfo::new(plane::Handle::from(raw(51)), vec![DrmFourcc::Xrgb8888])
    }

    fn framebuffer() -> ScanoutBuffer {
        ScanoutBuffer {
            fb: drm::control::framebuffer::Handle::from(raw(61)),
            size: (640, 480).into(),
            format: DrmFourcc::Xrgb8888,
            planes: smallvec![crate::buffer::PlaneLayout {
                handle: 1,
                pitch: 640 * 4,
                offset: 0,
            }],
        }
    }

    #[test]
    fn unknown_property_is_an_error() {
        let props = mapping();
        let mut req = AtomicRequest::new(&props);
        let plane = plane::Handle::from(raw(51));
        assert!(matches!(
            req.add(plane, "alpha", 0),
            Err(Error::UnknownProperty { name: "alpha", .. })
        ));
    }

    #[test]
    fn unknown_object_is_an_error() {
        let props = mapping();
        let mut req = AtomicRequest::new(&props);
        let stranger = crtc::Handle::from(raw(77));
        assert!(matches!(req.add(stranger, "ACTIVE", 1), Err(Error::UnknownCrtc(_))));
    }

    #[test]
    fn duplicate_add_overwrites() {
        let props = mapping();
        let device = Recorder::default();
        let plane = plane::Handle::from(raw(51));

        let mut req = AtomicRequest::new(&props);
        req.add(plane, "FB_ID", 1).unwrap();
        req.add(plane, "CRTC_ID", 41).unwrap();
        req.add(plane, "FB_ID", 2).unwrap();
        req.commit(&device, 0, false).unwrap();

        let commits = device.commits.borrow();
        let (_, batch, _) = &commits[0];
        assert_eq!(batch.objects, vec![51]);
        assert_eq!(batch.count_props, vec![2]);
        // FB_ID kept its original position but carries the later value
        assert_eq!(batch.values[0], 2);
        assert_eq!(batch.values[1], 41);
    }

    #[test]
    fn add_plane_expands_geometry() {
        let props = mapping();
        let device = Recorder::default();

        let mut req = AtomicRequest::new(&props);
        req.add_plane(
            &plane_info(),
            &framebuffer(),
            crtc::Handle::from(raw(41)),
            None,
            None,
            None,
            &[],
        )
        .unwrap();
        assert!(!req.is_modeset());
        req.commit(&device, 7, false).unwrap();

        let commits = device.commits.borrow();
        let (flags, batch, user_data) = &commits[0];
        assert_eq!(*flags, CommitFlags::NONBLOCK | CommitFlags::PAGE_FLIP_EVENT);
        assert_eq!(*user_data, 7);
        assert_eq!(batch.objects, vec![51]);
        assert_eq!(batch.count_props, vec![10]);
        // FB_ID, CRTC_ID, then the source rectangle in 16.16 ...
        assert_eq!(batch.values[0], 61);
        assert_eq!(batch.values[1], 41);
        assert_eq!(batch.values[2..6], [0, 0, 640 << 16, 480 << 16]);
        // ... and the destination rectangle in plain pixels
        assert_eq!(batch.values[6..10], [0, 0, 640, 480]);
    }

    #[test]
    #[should_panic(expected = "does not support")]
    fn add_plane_checks_the_format() {
        let props = mapping();
        let plane = PlaneInfo::new(plane::Handle::from(raw(51)), vec![DrmFourcc::Nv12]);
        let mut req = AtomicRequest::new(&props);
        let _ = req.add_plane(
            &plane,
            &framebuffer(),
            crtc::Handle::from(raw(41)),
            None,
            None,
            None,
            &[],
        );
    }

    #[test]
    fn display_setup_is_a_modeset() {
        let props = mapping();
        let device = Recorder::default();

        let mut req = AtomicRequest::new(&props);
        req.add_display(
            connector::Handle::from(raw(31)),
            crtc::Handle::from(raw(41)),
            900,
            &plane_info(),
            &framebuffer(),
        )
        .unwrap();
        assert!(req.is_modeset());
        req.commit_sync(&device, true).unwrap();

        let commits = device.commits.borrow();
        let (flags, batch, user_data) = &commits[0];
        assert_eq!(*flags, CommitFlags::ALLOW_MODESET);
        assert_eq!(*user_data, 0);
        assert_eq!(batch.objects, vec![31, 41, 51]);
        assert_eq!(batch.count_props, vec![1, 2, 10]);
    }

    #[test]
    #[should_panic(expected = "without allow_modeset")]
    fn modeset_without_the_flag_fails_fast() {
        let props = mapping();
        let device = Recorder::default();

        let mut req = AtomicRequest::new(&props);
        req.add(crtc::Handle::from(raw(41)), "ACTIVE", 1).unwrap();
        let _ = req.commit(&device, 0, false);
    }

    #[test]
    fn modeset_without_the_flag_never_reaches_the_device() {
        let props = mapping();
        let device = Recorder::default();

        let mut req = AtomicRequest::new(&props);
        req.add(crtc::Handle::from(raw(41)), "ACTIVE", 1).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = req.test(&device, false);
        }));
        assert!(result.is_err());
        assert!(device.commits.borrow().is_empty());
    }

    #[test]
    fn test_mode_sets_test_only() {
        let props = mapping();
        let device = Recorder::default();

        let mut req = AtomicRequest::new(&props);
        req.add(plane::Handle::from(raw(51)), "FB_ID", 61).unwrap();
        req.test(&device, false).unwrap();

        let commits = device.commits.borrow();
        assert_eq!(commits[0].0, CommitFlags::TEST_ONLY);
    }
}
