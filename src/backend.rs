use std::os::fd::{BorrowedFd, RawFd};

use log::error;
use nix::errno::Errno;
use nix::libc::off_t;
use nix::sys::uio::{pread, pwrite};
use nix::unistd;
use nix::{ioctl_write_ptr_bad, request_code_none};
use tracing::trace;

use crate::error::{IntrError, Result};
use crate::handle::{HandleType, IntrHandle, MAX_RXTX_INTR_VEC};
use crate::utils::to_bytes;

/// Interrupt control primitives for one handle type.
struct BackendOps {
    enable: fn(&IntrHandle) -> Result<()>,
    disable: fn(&IntrHandle) -> Result<()>,
    ack: fn(&IntrHandle) -> Result<()>,
}

/// Enables event delivery for the handle. Virtual-device sources are always
/// enabled; unknown handle types are refused.
pub fn enable(handle: &IntrHandle) -> Result<()> {
    let rc = control(handle, |ops| ops.enable);
    trace!(fd = handle.fd(), ok = rc.is_ok(), "intr_enable");
    rc
}

/// Disables event delivery for the handle.
pub fn disable(handle: &IntrHandle) -> Result<()> {
    let rc = control(handle, |ops| ops.disable);
    trace!(fd = handle.fd(), ok = rc.is_ok(), "intr_disable");
    rc
}

/// Unmasks a level-triggered interrupt after its callback ran; such
/// interrupts are auto-masked on delivery. A no-op for vectored types that
/// never auto-mask, refused for types with no acknowledge concept.
pub fn ack(handle: &IntrHandle) -> Result<()> {
    control(handle, |ops| ops.ack)
}

fn control(handle: &IntrHandle, sel: fn(&BackendOps) -> fn(&IntrHandle) -> Result<()>) -> Result<()> {
    if handle.handle_type() == HandleType::Vdev {
        return Ok(());
    }
    if handle.fd() < 0 || handle.dev_fd() < 0 {
        return Err(IntrError::InvalidArgument(
            "handle missing interrupt or device fd",
        ));
    }
    match ops_for(handle.handle_type()) {
        Some(ops) => sel(ops)(handle),
        None => {
            error!("unknown handle type of fd {}", handle.fd());
            Err(IntrError::UnsupportedType(handle.handle_type()))
        }
    }
}

fn ops_for(ty: HandleType) -> Option<&'static BackendOps> {
    match ty {
        HandleType::Uio => Some(&UIO_OPS),
        HandleType::UioIntx => Some(&UIO_INTX_OPS),
        HandleType::VfioLegacy => Some(&VFIO_INTX_OPS),
        HandleType::VfioMsi => Some(&VFIO_MSI_OPS),
        HandleType::VfioMsix => Some(&VFIO_MSIX_OPS),
        HandleType::VfioReq => Some(&VFIO_REQ_OPS),
        HandleType::Alarm => Some(&ALARM_OPS),
        HandleType::DevEvent => Some(&DEV_EVENT_OPS),
        _ => None,
    }
}

static UIO_OPS: BackendOps = BackendOps {
    enable: uio_intr_enable,
    disable: uio_intr_disable,
    // acking and enabling are the same write for uio
    ack: uio_intr_enable,
};

static UIO_INTX_OPS: BackendOps = BackendOps {
    enable: uio_intx_intr_enable,
    disable: uio_intx_intr_disable,
    ack: uio_intx_intr_enable,
};

static VFIO_INTX_OPS: BackendOps = BackendOps {
    enable: vfio_enable_intx,
    disable: vfio_disable_intx,
    ack: vfio_ack_intx,
};

static VFIO_MSI_OPS: BackendOps = BackendOps {
    enable: vfio_enable_msi,
    disable: vfio_disable_msi,
    ack: ack_noop,
};

static VFIO_MSIX_OPS: BackendOps = BackendOps {
    enable: vfio_enable_msix,
    disable: vfio_disable_msix,
    ack: ack_noop,
};

static VFIO_REQ_OPS: BackendOps = BackendOps {
    enable: vfio_enable_req,
    disable: vfio_disable_req,
    ack: unsupported,
};

static ALARM_OPS: BackendOps = BackendOps {
    enable: unsupported,
    disable: unsupported,
    ack: unsupported,
};

static DEV_EVENT_OPS: BackendOps = BackendOps {
    enable: unsupported,
    disable: unsupported,
    ack: unsupported,
};

fn ack_noop(_handle: &IntrHandle) -> Result<()> {
    Ok(())
}

fn unsupported(handle: &IntrHandle) -> Result<()> {
    Err(IntrError::UnsupportedType(handle.handle_type()))
}

fn uio_intr_enable(handle: &IntrHandle) -> Result<()> {
    uio_intr_write(handle, 1)
}

fn uio_intr_disable(handle: &IntrHandle) -> Result<()> {
    uio_intr_write(handle, 0)
}

// The uio fd takes a 4-byte interrupt-enable flag.
fn uio_intr_write(handle: &IntrHandle, value: i32) -> Result<()> {
    let fd = handle.fd();
    // Safety: fd validity is the handle owner's contract.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    if let Err(e) = unistd::write(borrowed, &value.to_ne_bytes()) {
        error!(
            "error writing uio interrupt control, fd: {}, err: {}",
            fd, e
        );
        return Err(IntrError::Io(e));
    }
    Ok(())
}

const PCI_CMD_HIGH_OFFSET: off_t = 5;
const PCI_CMD_INTX_DISABLE: u8 = 0x4;

fn uio_intx_intr_enable(handle: &IntrHandle) -> Result<()> {
    uio_intx_update(handle, false)
}

fn uio_intx_intr_disable(handle: &IntrHandle) -> Result<()> {
    uio_intx_update(handle, true)
}

// Read-modify-write of the INTx disable bit in the high byte of the PCI
// command register, through the uio config-space fd.
fn uio_intx_update(handle: &IntrHandle, mask: bool) -> Result<()> {
    let cfg_fd = handle.dev_fd();
    // Safety: dev fd validity is the handle owner's contract.
    let borrowed = unsafe { BorrowedFd::borrow_raw(cfg_fd) };
    let mut command_high = [0u8; 1];
    match pread(borrowed, &mut command_high, PCI_CMD_HIGH_OFFSET) {
        Ok(1) => {}
        Ok(_) => {
            error!("error reading interrupt status, fd: {}", cfg_fd);
            return Err(IntrError::Io(Errno::EIO));
        }
        Err(e) => {
            error!("error reading interrupt status, fd: {}, err: {}", cfg_fd, e);
            return Err(IntrError::Io(e));
        }
    }

    if mask {
        command_high[0] |= PCI_CMD_INTX_DISABLE;
    } else {
        command_high[0] &= !PCI_CMD_INTX_DISABLE;
    }

    match pwrite(borrowed, &command_high, PCI_CMD_HIGH_OFFSET) {
        Ok(1) => Ok(()),
        Ok(_) => {
            error!("error updating interrupt mask, fd: {}", cfg_fd);
            Err(IntrError::Io(Errno::EIO))
        }
        Err(e) => {
            error!("error updating interrupt mask, fd: {}, err: {}", cfg_fd, e);
            Err(IntrError::Io(e))
        }
    }
}

const VFIO_IRQ_SET_DATA_NONE: u32 = 1 << 0;
const VFIO_IRQ_SET_DATA_EVENTFD: u32 = 1 << 2;
const VFIO_IRQ_SET_ACTION_MASK: u32 = 1 << 3;
const VFIO_IRQ_SET_ACTION_UNMASK: u32 = 1 << 4;
const VFIO_IRQ_SET_ACTION_TRIGGER: u32 = 1 << 5;

const VFIO_PCI_INTX_IRQ_INDEX: u32 = 0;
const VFIO_PCI_MSI_IRQ_INDEX: u32 = 1;
const VFIO_PCI_MSIX_IRQ_INDEX: u32 = 2;
const VFIO_PCI_REQ_IRQ_INDEX: u32 = 4;

// Header of the kernel's vfio_irq_set request; eventfds follow in-line.
// See <linux/vfio.h>.
#[repr(C)]
struct VfioIrqSet {
    argsz: u32,
    flags: u32,
    index: u32,
    start: u32,
    count: u32,
}

ioctl_write_ptr_bad!(
    vfio_device_set_irqs,
    request_code_none!(b';', 110),
    VfioIrqSet
);

fn vfio_set_irqs(
    dev_fd: RawFd,
    flags: u32,
    index: u32,
    start: u32,
    count: u32,
    fds: &[RawFd],
) -> Result<()> {
    let argsz = std::mem::size_of::<VfioIrqSet>() + std::mem::size_of_val(fds);
    let header = VfioIrqSet {
        argsz: argsz as u32,
        flags,
        index,
        start,
        count,
    };
    let mut buf = Vec::with_capacity(argsz);
    // Safety: VfioIrqSet is #[repr(C)] plain-old-data.
    buf.extend_from_slice(unsafe { to_bytes(&header) });
    for fd in fds {
        buf.extend_from_slice(&fd.to_ne_bytes());
    }
    // Safety: buf holds a kernel-layout vfio_irq_set sized to argsz and
    // outlives the call.
    unsafe { vfio_device_set_irqs(dev_fd, buf.as_ptr() as *const VfioIrqSet) }?;
    Ok(())
}

fn vfio_enable_intx(handle: &IntrHandle) -> Result<()> {
    // route INTx to the handle's eventfd
    if let Err(e) = vfio_set_irqs(
        handle.dev_fd(),
        VFIO_IRQ_SET_DATA_EVENTFD | VFIO_IRQ_SET_ACTION_TRIGGER,
        VFIO_PCI_INTX_IRQ_INDEX,
        0,
        1,
        &[handle.fd()],
    ) {
        error!("error enabling intx interrupts, fd: {}", handle.fd());
        return Err(e);
    }

    // unmask after enabling: INTx is auto-masked on delivery
    if let Err(e) = vfio_set_irqs(
        handle.dev_fd(),
        VFIO_IRQ_SET_DATA_NONE | VFIO_IRQ_SET_ACTION_UNMASK,
        VFIO_PCI_INTX_IRQ_INDEX,
        0,
        1,
        &[],
    ) {
        error!("error unmasking intx interrupts, fd: {}", handle.fd());
        return Err(e);
    }
    Ok(())
}

fn vfio_disable_intx(handle: &IntrHandle) -> Result<()> {
    // mask before tearing the trigger down
    if let Err(e) = vfio_set_irqs(
        handle.dev_fd(),
        VFIO_IRQ_SET_DATA_NONE | VFIO_IRQ_SET_ACTION_MASK,
        VFIO_PCI_INTX_IRQ_INDEX,
        0,
        1,
        &[],
    ) {
        error!("error masking intx interrupts, fd: {}", handle.fd());
        return Err(e);
    }

    if let Err(e) = vfio_set_irqs(
        handle.dev_fd(),
        VFIO_IRQ_SET_DATA_NONE | VFIO_IRQ_SET_ACTION_TRIGGER,
        VFIO_PCI_INTX_IRQ_INDEX,
        0,
        0,
        &[],
    ) {
        error!("error disabling intx interrupts, fd: {}", handle.fd());
        return Err(e);
    }
    Ok(())
}

fn vfio_ack_intx(handle: &IntrHandle) -> Result<()> {
    if let Err(e) = vfio_set_irqs(
        handle.dev_fd(),
        VFIO_IRQ_SET_DATA_NONE | VFIO_IRQ_SET_ACTION_UNMASK,
        VFIO_PCI_INTX_IRQ_INDEX,
        0,
        1,
        &[],
    ) {
        error!("error unmasking intx interrupts, fd: {}", handle.fd());
        return Err(e);
    }
    Ok(())
}

fn vfio_enable_msi(handle: &IntrHandle) -> Result<()> {
    if let Err(e) = vfio_set_irqs(
        handle.dev_fd(),
        VFIO_IRQ_SET_DATA_EVENTFD | VFIO_IRQ_SET_ACTION_TRIGGER,
        VFIO_PCI_MSI_IRQ_INDEX,
        0,
        1,
        &[handle.fd()],
    ) {
        error!("error enabling msi interrupts, fd: {}", handle.fd());
        return Err(e);
    }
    Ok(())
}

fn vfio_disable_msi(handle: &IntrHandle) -> Result<()> {
    if let Err(e) = vfio_set_irqs(
        handle.dev_fd(),
        VFIO_IRQ_SET_DATA_NONE | VFIO_IRQ_SET_ACTION_TRIGGER,
        VFIO_PCI_MSI_IRQ_INDEX,
        0,
        0,
        &[],
    ) {
        error!("error disabling msi interrupts, fd: {}", handle.fd());
        return Err(e);
    }
    Ok(())
}

fn vfio_enable_msix(handle: &IntrHandle) -> Result<()> {
    let max = handle.max_intr();
    let count = if max == 0 {
        1
    } else {
        max.min(MAX_RXTX_INTR_VEC + 1)
    };

    // vector slot 0 carries the non-queue interrupt, queue eventfds follow
    let mut fds = Vec::with_capacity(1 + handle.nb_efd() as usize);
    fds.push(handle.fd());
    for i in 0..handle.nb_efd() as usize {
        fds.push(handle.efd(i).unwrap_or(-1));
    }

    if let Err(e) = vfio_set_irqs(
        handle.dev_fd(),
        VFIO_IRQ_SET_DATA_EVENTFD | VFIO_IRQ_SET_ACTION_TRIGGER,
        VFIO_PCI_MSIX_IRQ_INDEX,
        0,
        count,
        &fds,
    ) {
        error!("error enabling msi-x interrupts, fd: {}", handle.fd());
        return Err(e);
    }
    Ok(())
}

fn vfio_disable_msix(handle: &IntrHandle) -> Result<()> {
    if let Err(e) = vfio_set_irqs(
        handle.dev_fd(),
        VFIO_IRQ_SET_DATA_NONE | VFIO_IRQ_SET_ACTION_TRIGGER,
        VFIO_PCI_MSIX_IRQ_INDEX,
        0,
        0,
        &[],
    ) {
        error!("error disabling msi-x interrupts, fd: {}", handle.fd());
        return Err(e);
    }
    Ok(())
}

fn vfio_enable_req(handle: &IntrHandle) -> Result<()> {
    if let Err(e) = vfio_set_irqs(
        handle.dev_fd(),
        VFIO_IRQ_SET_DATA_EVENTFD | VFIO_IRQ_SET_ACTION_TRIGGER,
        VFIO_PCI_REQ_IRQ_INDEX,
        0,
        1,
        &[handle.fd()],
    ) {
        error!("error enabling req interrupts, fd: {}", handle.fd());
        return Err(e);
    }
    Ok(())
}

fn vfio_disable_req(handle: &IntrHandle) -> Result<()> {
    if let Err(e) = vfio_set_irqs(
        handle.dev_fd(),
        VFIO_IRQ_SET_DATA_NONE | VFIO_IRQ_SET_ACTION_TRIGGER,
        VFIO_PCI_REQ_IRQ_INDEX,
        0,
        0,
        &[],
    ) {
        error!("error disabling req interrupts, fd: {}", handle.fd());
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::FileExt;

    use nix::unistd;

    use super::*;

    #[test]
    fn uio_enable_disable_roundtrip() {
        let (r, w) = unistd::pipe().unwrap();
        let mut handle = IntrHandle::new(HandleType::Uio, w.as_raw_fd());
        handle.set_dev_fd(r.as_raw_fd());

        let mut buf = [0u8; 4];
        enable(&handle).unwrap();
        unistd::read(r.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(i32::from_ne_bytes(buf), 1);

        disable(&handle).unwrap();
        unistd::read(r.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(i32::from_ne_bytes(buf), 0);

        // acking a uio interrupt re-enables it
        ack(&handle).unwrap();
        unistd::read(r.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(i32::from_ne_bytes(buf), 1);
    }

    #[test]
    fn uio_intx_config_byte_roundtrip() {
        let mut path = std::env::temp_dir();
        path.push(format!("irqmux-cfg-{}", std::process::id()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(8).unwrap();

        let mut handle = IntrHandle::new(HandleType::UioIntx, file.as_raw_fd());
        handle.set_dev_fd(file.as_raw_fd());

        let byte_at = |off: u64| {
            let mut b = [0u8; 1];
            file.read_at(&mut b, off).unwrap();
            b[0]
        };

        disable(&handle).unwrap();
        assert_eq!(byte_at(5), PCI_CMD_INTX_DISABLE);
        disable(&handle).unwrap();
        assert_eq!(byte_at(5), PCI_CMD_INTX_DISABLE);

        enable(&handle).unwrap();
        assert_eq!(byte_at(5), 0);
        enable(&handle).unwrap();
        assert_eq!(byte_at(5), 0);

        // the rest of the config space is untouched
        assert_eq!(byte_at(0), 0);
        assert_eq!(byte_at(6), 0);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn vdev_is_trivially_enabled() {
        let handle = IntrHandle::new(HandleType::Vdev, -1);
        enable(&handle).unwrap();
        disable(&handle).unwrap();
        ack(&handle).unwrap();
    }

    #[test]
    fn alarm_and_dev_event_are_refused() {
        let (r, _w) = unistd::pipe().unwrap();
        let mut handle = IntrHandle::new(HandleType::Alarm, r.as_raw_fd());
        handle.set_dev_fd(r.as_raw_fd());
        assert!(matches!(
            enable(&handle),
            Err(IntrError::UnsupportedType(HandleType::Alarm))
        ));
        assert!(matches!(ack(&handle), Err(IntrError::UnsupportedType(_))));

        handle.set_handle_type(HandleType::DevEvent);
        assert!(matches!(
            disable(&handle),
            Err(IntrError::UnsupportedType(HandleType::DevEvent))
        ));
    }

    #[test]
    fn unknown_type_is_refused() {
        let (r, _w) = unistd::pipe().unwrap();
        let mut handle = IntrHandle::new(HandleType::Unknown, r.as_raw_fd());
        handle.set_dev_fd(r.as_raw_fd());
        assert!(matches!(
            enable(&handle),
            Err(IntrError::UnsupportedType(HandleType::Unknown))
        ));
    }

    #[test]
    fn missing_fds_are_invalid() {
        let handle = IntrHandle::new(HandleType::Uio, -1);
        assert!(matches!(
            enable(&handle),
            Err(IntrError::InvalidArgument(_))
        ));

        // a valid interrupt fd without a device fd is rejected too
        let (r, _w) = unistd::pipe().unwrap();
        let handle = IntrHandle::new(HandleType::VfioMsi, r.as_raw_fd());
        assert!(matches!(
            enable(&handle),
            Err(IntrError::InvalidArgument(_))
        ));
    }

    #[test]
    fn vfio_ioctl_error_propagates() {
        // a pipe is not a vfio device; the ioctl must surface the errno
        let (r, w) = unistd::pipe().unwrap();
        let mut handle = IntrHandle::new(HandleType::VfioMsi, r.as_raw_fd());
        handle.set_dev_fd(w.as_raw_fd());
        assert!(matches!(enable(&handle), Err(IntrError::Io(_))));
    }
}
