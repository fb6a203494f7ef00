use std::os::fd::RawFd;
use std::sync::Arc;

use crate::poll::EventSlot;

/// Largest number of RX/TX vector eventfds one handle may carry.
pub const MAX_RXTX_INTR_VEC: u32 = 512;

/// Vector slots reserved for the non-queue (link status etc.) interrupt.
pub const NB_OTHER_INTR: u32 = 1;

/// Offset of the first RX/TX queue vector within a handle's vector space.
pub const RXTX_VEC_OFFSET: u32 = 1;

/// Classification of how an interrupt source is driven.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleType {
    Unknown = 0,
    Uio,
    UioIntx,
    Vdev,
    VfioLegacy,
    VfioMsi,
    VfioMsix,
    VfioReq,
    DevEvent,
    Ext,
    Alarm,
}

impl TryFrom<u32> for HandleType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(HandleType::Unknown),
            1 => Ok(HandleType::Uio),
            2 => Ok(HandleType::UioIntx),
            3 => Ok(HandleType::Vdev),
            4 => Ok(HandleType::VfioLegacy),
            5 => Ok(HandleType::VfioMsi),
            6 => Ok(HandleType::VfioMsix),
            7 => Ok(HandleType::VfioReq),
            8 => Ok(HandleType::DevEvent),
            9 => Ok(HandleType::Ext),
            10 => Ok(HandleType::Alarm),
            _ => Err(value),
        }
    }
}

/// One device's interrupt capability: how it is driven, which descriptors
/// carry its events, and the per-vector state used by the polling facility.
///
/// The handle does not own `fd`/`dev_fd`; it does own the vector eventfds
/// created by [`crate::poll::efd_enable`], which are closed by
/// [`crate::poll::efd_disable`]. `Clone` is the duplicate operation: the
/// registry duplicates the handle so its lifetime is independent of the
/// caller's copy.
#[derive(Clone, Debug)]
pub struct IntrHandle {
    ty: HandleType,
    fd: RawFd,
    dev_fd: RawFd,
    max_intr: u32,
    nb_efd: u32,
    efd_counter_size: u8,
    efds: Vec<RawFd>,
    elist: Vec<Arc<EventSlot>>,
}

impl IntrHandle {
    pub fn new(ty: HandleType, fd: RawFd) -> Self {
        IntrHandle {
            ty,
            fd,
            dev_fd: -1,
            max_intr: 0,
            nb_efd: 0,
            efd_counter_size: 0,
            efds: Vec::new(),
            elist: Vec::new(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_fd(&mut self, fd: RawFd) {
        self.fd = fd;
    }

    /// Device/config fd used by ioctl- and config-space-driven backends.
    pub fn dev_fd(&self) -> RawFd {
        self.dev_fd
    }

    pub fn set_dev_fd(&mut self, fd: RawFd) {
        self.dev_fd = fd;
    }

    pub fn handle_type(&self) -> HandleType {
        self.ty
    }

    pub fn set_handle_type(&mut self, ty: HandleType) {
        self.ty = ty;
    }

    pub fn max_intr(&self) -> u32 {
        self.max_intr
    }

    pub fn set_max_intr(&mut self, n: u32) {
        self.max_intr = n;
    }

    pub fn nb_efd(&self) -> u32 {
        self.nb_efd
    }

    pub fn set_nb_efd(&mut self, n: u32) {
        self.nb_efd = n;
    }

    /// Size of one counter read on a virtual-device eventfd, set by the
    /// driver that owns the device.
    pub fn efd_counter_size(&self) -> u8 {
        self.efd_counter_size
    }

    pub fn set_efd_counter_size(&mut self, size: u8) {
        self.efd_counter_size = size;
    }

    pub fn efd(&self, idx: usize) -> Option<RawFd> {
        self.efds.get(idx).copied()
    }

    /// Stores a vector eventfd, growing the vector table as needed. Every
    /// vector slot gets its own idle [`EventSlot`].
    pub fn set_efd(&mut self, idx: usize, fd: RawFd) {
        if idx >= self.efds.len() {
            self.efds.resize(idx + 1, -1);
        }
        self.efds[idx] = fd;
        while self.elist.len() < self.efds.len() {
            self.elist.push(Arc::new(EventSlot::new()));
        }
    }

    pub(crate) fn slot(&self, idx: usize) -> Option<&Arc<EventSlot>> {
        self.elist.get(idx)
    }

    pub(crate) fn clear_efds(&mut self) {
        self.efds.clear();
        self.elist.clear();
    }
}
