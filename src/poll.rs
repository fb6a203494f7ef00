use std::cell::{RefCell, UnsafeCell};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::unistd;

use crate::dispatch::READ_BUF_LEN;
use crate::error::{IntrError, Result};
use crate::handle::{HandleType, IntrHandle, MAX_RXTX_INTR_VEC, NB_OTHER_INTR, RXTX_VEC_OFFSET};

const SLOT_INVALID: u32 = 0;
const SLOT_VALID: u32 = 1;
const SLOT_EXEC: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotStatus {
    Invalid,
    Valid,
    Exec,
}

/// One fd's registration state in a caller-owned multiplexer.
///
/// The status word is the sole synchronization point between concurrent
/// add, delete and fire: a waiter may only touch the payload after winning
/// the VALID -> EXEC exchange, and removal spins until the slot is
/// observably back at VALID. No lock is taken on this path.
pub struct EventSlot {
    status: AtomicU32,
    data: UnsafeCell<SlotData>,
}

#[derive(Clone, Copy)]
struct SlotData {
    fd: RawFd,
    mux_fd: RawFd,
    events: EpollFlags,
    data: usize,
    callback: Option<SlotCallback>,
}

// Safety: the payload is only written while the slot is INVALID (before the
// release store that publishes VALID) and only read by the waiter that won
// the acquire VALID -> EXEC exchange.
unsafe impl Sync for EventSlot {}

impl EventSlot {
    pub fn new() -> Self {
        EventSlot {
            status: AtomicU32::new(SLOT_INVALID),
            data: UnsafeCell::new(SlotData {
                fd: -1,
                mux_fd: -1,
                events: EpollFlags::empty(),
                data: 0,
                callback: None,
            }),
        }
    }

    pub fn status(&self) -> SlotStatus {
        match self.status.load(Ordering::Relaxed) {
            SLOT_VALID => SlotStatus::Valid,
            SLOT_EXEC => SlotStatus::Exec,
            _ => SlotStatus::Invalid,
        }
    }
}

impl Default for EventSlot {
    fn default() -> Self {
        EventSlot::new()
    }
}

impl std::fmt::Debug for EventSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSlot")
            .field("status", &self.status())
            .finish()
    }
}

/// Fire callback invoked on the waiter thread while the slot is in EXEC.
#[derive(Clone, Copy)]
pub struct SlotCallback {
    pub func: fn(fd: RawFd, arg: usize),
    pub arg: usize,
}

#[derive(Clone, Copy)]
pub enum SlotCtl {
    Add {
        events: EpollFlags,
        data: usize,
        callback: Option<SlotCallback>,
    },
    /// Updates the edge set only.
    Modify { events: EpollFlags },
    Delete,
}

/// Snapshot of one delivered event, copied out while its slot was in EXEC.
#[derive(Clone, Copy, Debug)]
pub struct PolledEvent {
    pub fd: RawFd,
    pub mux_fd: RawFd,
    pub events: EpollFlags,
    pub data: usize,
}

impl Default for PolledEvent {
    fn default() -> Self {
        PolledEvent {
            fd: -1,
            mux_fd: -1,
            events: EpollFlags::empty(),
            data: 0,
        }
    }
}

thread_local! {
    static THREAD_MUX: RefCell<Option<Rc<Epoll>>> = const { RefCell::new(None) };
}

/// The calling thread's default multiplexer, created on first use.
fn thread_mux() -> Result<Rc<Epoll>> {
    THREAD_MUX.with(|cell| {
        let mut slot = cell.borrow_mut();
        if let Some(ep) = slot.as_ref() {
            return Ok(ep.clone());
        }
        let ep = Rc::new(Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|e| {
            error!("cannot create per-thread multiplexer instance, err: {}", e);
            IntrError::Io(e)
        })?);
        *slot = Some(ep.clone());
        Ok(ep)
    })
}

fn with_mux<R>(mux: Option<&Epoll>, f: impl FnOnce(&Epoll) -> Result<R>) -> Result<R> {
    match mux {
        Some(ep) => f(ep),
        None => {
            let ep = thread_mux()?;
            f(&ep)
        }
    }
}

/// Registers, retargets or removes one slot on a multiplexer; `None` selects
/// the calling thread's default instance.
///
/// The slot must stay alive from a successful `Add` until the matching
/// `Delete` returns (a strong reference is held for that window), and
/// `Delete` must not be called concurrently for the same slot.
pub fn slot_ctl(mux: Option<&Epoll>, op: SlotCtl, fd: RawFd, slot: &Arc<EventSlot>) -> Result<()> {
    with_mux(mux, |ep| slot_ctl_in(ep, op, fd, slot))
}

fn slot_ctl_in(ep: &Epoll, op: SlotCtl, fd: RawFd, slot: &Arc<EventSlot>) -> Result<()> {
    match op {
        SlotCtl::Add {
            events,
            data,
            callback,
        } => {
            if slot.status.load(Ordering::Relaxed) != SLOT_INVALID {
                info!("event slot already added, fd: {}", fd);
                return Err(IntrError::AlreadyExists);
            }

            // the slot is invisible to waiters until the release store below
            unsafe {
                let d = &mut *slot.data.get();
                d.fd = fd;
                d.mux_fd = ep.0.as_raw_fd();
                d.events = events;
                d.data = data;
                d.callback = callback;
            }
            slot.status.store(SLOT_VALID, Ordering::Release);

            // park one strong reference in the multiplexer's event data
            let ptr = Arc::into_raw(slot.clone()) as u64;
            // Safety: fd liveness for the registration window is the
            // caller's contract.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            if let Err(e) = ep.add(borrowed, EpollEvent::new(events, ptr)) {
                error!("error adding fd to multiplexer, fd: {}, err: {}", fd, e);
                // roll the handshake back and reclaim the parked reference
                slot.status.store(SLOT_INVALID, Ordering::Relaxed);
                // Safety: reclaims the reference parked just above.
                unsafe { drop(Arc::from_raw(ptr as *const EventSlot)) };
                return Err(IntrError::Io(e));
            }
            Ok(())
        }
        SlotCtl::Modify { events } => {
            if slot.status.load(Ordering::Relaxed) == SLOT_INVALID {
                return Err(IntrError::NotFound(fd));
            }
            unsafe {
                (*slot.data.get()).events = events;
            }
            let mut ev = EpollEvent::new(events, Arc::as_ptr(slot) as u64);
            // Safety: same contract as for Add.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            if let Err(e) = ep.modify(borrowed, &mut ev) {
                error!("error modifying fd on multiplexer, fd: {}, err: {}", fd, e);
                return Err(IntrError::Io(e));
            }
            Ok(())
        }
        SlotCtl::Delete => {
            // Safety: same contract as for Add.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            if let Err(e) = ep.delete(borrowed) {
                error!("error removing fd from multiplexer, fd: {}, err: {}", fd, e);
                return Err(IntrError::Io(e));
            }
            if slot.status.load(Ordering::Relaxed) != SLOT_INVALID {
                safe_free(slot);
                // Safety: releases the reference parked when the slot was
                // added; the slot is INVALID so no waiter holds it.
                unsafe { drop(Arc::from_raw(Arc::as_ptr(slot))) };
            }
            Ok(())
        }
    }
}

/// Takes the slot from VALID to INVALID, waiting out any waiter that holds
/// it in EXEC, then clears the payload.
fn safe_free(slot: &EventSlot) {
    loop {
        match slot.status.compare_exchange(
            SLOT_VALID,
            SLOT_INVALID,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(SLOT_INVALID) => break,
            Err(_) => {
                while slot.status.load(Ordering::Relaxed) == SLOT_EXEC {
                    thread::yield_now();
                }
            }
        }
    }
    unsafe {
        *slot.data.get() = SlotData {
            fd: -1,
            mux_fd: -1,
            events: EpollFlags::empty(),
            data: 0,
            callback: None,
        };
    }
}

/// Blocks on the multiplexer and copies ready slots into `events`, firing
/// each slot's callback while it is held in EXEC. Slots that are not VALID
/// when their readiness arrives are silently dropped as stale. A wait
/// interrupted by a signal is retried.
pub fn poll_wait(
    mux: Option<&Epoll>,
    events: &mut [PolledEvent],
    timeout: EpollTimeout,
) -> Result<usize> {
    wait_inner(mux, events, timeout, false)
}

/// [`poll_wait`] that returns [`Errno::EINTR`] instead of retrying when a
/// signal interrupts the wait.
pub fn poll_wait_interruptible(
    mux: Option<&Epoll>,
    events: &mut [PolledEvent],
    timeout: EpollTimeout,
) -> Result<usize> {
    wait_inner(mux, events, timeout, true)
}

#[tracing::instrument(skip_all)]
fn wait_inner(
    mux: Option<&Epoll>,
    events: &mut [PolledEvent],
    timeout: EpollTimeout,
    interruptible: bool,
) -> Result<usize> {
    if events.is_empty() {
        return Err(IntrError::InvalidArgument("empty event buffer"));
    }

    with_mux(mux, |ep| {
        let mut evs = vec![EpollEvent::empty(); events.len()];
        loop {
            match ep.wait(&mut evs, timeout) {
                Ok(0) => return Ok(0),
                Ok(n) => return Ok(process_slots(&evs[..n], events)),
                Err(Errno::EINTR) => {
                    if interruptible {
                        return Err(IntrError::Io(Errno::EINTR));
                    }
                    continue;
                }
                Err(e) => {
                    error!("event wait failed, err: {}", e);
                    return Err(IntrError::Io(e));
                }
            }
        }
    })
}

fn process_slots(evs: &[EpollEvent], out: &mut [PolledEvent]) -> usize {
    let mut count = 0;
    for ev in evs {
        let ptr = ev.data() as *const EventSlot;
        if ptr.is_null() {
            continue;
        }
        // Safety: the pointer was parked by slot_ctl(Add), which keeps a
        // strong reference until the matching Delete completes.
        let slot = unsafe { &*ptr };

        // the acquire here pairs with the release store below, acting as a
        // lock around the payload; losing the exchange means the event is
        // stale or racing a removal and is dropped
        if slot
            .status
            .compare_exchange(SLOT_VALID, SLOT_EXEC, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            continue;
        }

        let data = unsafe { *slot.data.get() };
        out[count] = PolledEvent {
            fd: data.fd,
            mux_fd: data.mux_fd,
            events: ev.events(),
            data: data.data,
        };
        if let Some(cb) = data.callback {
            (cb.func)(data.fd, cb.arg);
        }

        // the status update must be observed after the payload copy
        slot.status.store(SLOT_VALID, Ordering::Release);
        count += 1;
    }
    count
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxCtlOp {
    Add,
    Delete,
}

/// Attaches or detaches one RX/TX queue vector of `handle` on a caller-owned
/// multiplexer, bypassing the global registry. Delivered events carry
/// `data`; the vector eventfd is drained on the waiter thread.
pub fn rx_ctl(
    handle: &IntrHandle,
    mux: Option<&Epoll>,
    op: RxCtlOp,
    vec: u32,
    data: usize,
) -> Result<()> {
    let efd_idx = if vec >= RXTX_VEC_OFFSET {
        vec - RXTX_VEC_OFFSET
    } else {
        vec
    } as usize;

    if handle.nb_efd() == 0 || efd_idx >= handle.nb_efd() as usize {
        error!("wrong interrupt vector number: {}", vec);
        return Err(IntrError::InvalidArgument("interrupt vector out of range"));
    }
    let (Some(slot), Some(efd)) = (handle.slot(efd_idx), handle.efd(efd_idx)) else {
        return Err(IntrError::InvalidArgument("interrupt vector out of range"));
    };

    match op {
        RxCtlOp::Add => {
            if slot.status() != SlotStatus::Invalid {
                info!("event already added, vec: {}", vec);
                return Err(IntrError::AlreadyExists);
            }
            let callback = Some(SlotCallback {
                func: drain_rxtx,
                arg: rxtx_drain_len(handle),
            });
            slot_ctl(
                mux,
                SlotCtl::Add {
                    events: EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI | EpollFlags::EPOLLET,
                    data,
                    callback,
                },
                efd,
                slot,
            )?;
            debug!("efd {} associated with vec {} added to multiplexer", efd, vec);
            Ok(())
        }
        RxCtlOp::Delete => {
            if slot.status() == SlotStatus::Invalid {
                info!("event does not exist, vec: {}", vec);
                return Err(IntrError::NotFound(efd));
            }
            slot_ctl(mux, SlotCtl::Delete, efd, slot)
        }
    }
}

/// Bytes one counter read takes for this handle's vector eventfds.
fn rxtx_drain_len(handle: &IntrHandle) -> usize {
    match handle.handle_type() {
        HandleType::Uio | HandleType::UioIntx => 4,
        HandleType::VfioMsix | HandleType::VfioMsi | HandleType::VfioLegacy => 8,
        HandleType::Vdev => handle.efd_counter_size() as usize,
        HandleType::Ext => 0,
        _ => {
            info!("unexpected handle type, fd: {}", handle.fd());
            1
        }
    }
}

// Clears the ready flag on a queue vector fd; runs on the waiter thread
// while the slot is in EXEC.
fn drain_rxtx(fd: RawFd, nbytes: usize) {
    if nbytes == 0 {
        return;
    }
    let mut buf = [0u8; READ_BUF_LEN];
    let nbytes = nbytes.min(buf.len());
    loop {
        match unistd::read(fd, &mut buf[..nbytes]) {
            Ok(0) => {
                error!("read nothing from fd: {}", fd);
                return;
            }
            Ok(_) => return,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return,
            Err(e) => {
                error!("error reading from fd: {}, err: {}", fd, e);
                return;
            }
        }
    }
}

/// Sets up `nb_efd` per-queue event vectors on the handle. MSI-X handles get
/// freshly created eventfds; virtual devices are only validated (the driver
/// creates their descriptors); everything else aliases vector 0 to the
/// primary fd.
pub fn efd_enable(handle: &mut IntrHandle, nb_efd: u32) -> Result<()> {
    if nb_efd == 0 {
        return Err(IntrError::InvalidArgument("nb_efd must be non-zero"));
    }

    match handle.handle_type() {
        HandleType::VfioMsix => {
            let n = nb_efd.min(MAX_RXTX_INTR_VEC);
            for i in 0..n {
                // Safety: plain fd-creating syscall.
                let fd = unsafe {
                    nix::libc::eventfd(0, nix::libc::EFD_NONBLOCK | nix::libc::EFD_CLOEXEC)
                };
                if fd < 0 {
                    let e = Errno::last();
                    error!("cannot set up eventfd, err: {}", e);
                    return Err(IntrError::Io(e));
                }
                handle.set_efd(i as usize, fd);
            }
            handle.set_nb_efd(n);
            handle.set_max_intr(n + NB_OTHER_INTR);
        }
        HandleType::Vdev => {
            // initialization is done by the virtual device's driver
            if handle.efd_counter_size() as usize > READ_BUF_LEN {
                error!(
                    "the efd counter size is oversized: {}",
                    handle.efd_counter_size()
                );
                return Err(IntrError::InvalidArgument("efd counter size oversized"));
            }
        }
        _ => {
            let fd = handle.fd();
            handle.set_efd(0, fd);
            handle.set_nb_efd(nb_efd.min(1));
            handle.set_max_intr(NB_OTHER_INTR);
        }
    }
    Ok(())
}

/// Tears down the handle's event vectors: detaches any live slots from
/// `mux`, closes the eventfds the handle owns, zeroes the counts.
pub fn efd_disable(handle: &mut IntrHandle, mux: Option<&Epoll>) {
    free_slots(mux, handle);
    if handle.max_intr() > handle.nb_efd() {
        for i in 0..handle.nb_efd() as usize {
            if let Some(fd) = handle.efd(i) {
                // Safety: closes an eventfd this handle created and owns.
                unsafe { nix::libc::close(fd) };
            }
        }
    }
    handle.clear_efds();
    handle.set_nb_efd(0);
    handle.set_max_intr(0);
}

/// Releases every non-idle slot of the handle, forcing the free when the
/// multiplexer refuses the removal.
pub fn free_slots(mux: Option<&Epoll>, handle: &IntrHandle) {
    for i in 0..handle.nb_efd() as usize {
        let Some(slot) = handle.slot(i) else {
            continue;
        };
        if slot.status() == SlotStatus::Invalid {
            continue;
        }
        let fd = handle.efd(i).unwrap_or(-1);
        if slot_ctl(mux, SlotCtl::Delete, fd, slot).is_err()
            && slot.status.load(Ordering::Relaxed) != SLOT_INVALID
        {
            safe_free(slot);
            // Safety: releases the reference parked at add time; the slot is
            // INVALID so no waiter holds it.
            unsafe { drop(Arc::from_raw(Arc::as_ptr(slot))) };
        }
    }
}

/// True when the handle has per-queue event vectors set up.
pub fn dp_is_en(handle: &IntrHandle) -> bool {
    handle.nb_efd() != 0
}

/// True when a vector beyond the queue vectors is available for non-queue
/// interrupts.
pub fn allow_others(handle: &IntrHandle) -> bool {
    if !dp_is_en(handle) {
        true
    } else {
        handle.max_intr() > handle.nb_efd()
    }
}

/// True when the handle type supports multiple queue vectors.
pub fn cap_multiple(handle: &IntrHandle) -> bool {
    matches!(
        handle.handle_type(),
        HandleType::VfioMsix | HandleType::Vdev
    )
}
