use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use log::{debug, error};
use nix::errno::Errno;
use nix::unistd;
use tracing::trace;

use crate::dispatch;
use crate::error::{IntrError, Result};
use crate::handle::IntrHandle;

/// Interrupt callback, invoked on the dispatch thread once per delivered
/// event. Matched by pointer equality on unregistration.
pub type IntrCallback = fn(arg: usize);

/// Hook invoked by the dispatch thread right before a pending-delete
/// callback is dropped.
pub type UnregisterHook = fn(handle: &IntrHandle, arg: usize);

#[derive(Clone, Copy)]
pub(crate) struct Callback {
    pub(crate) cb: IntrCallback,
    pub(crate) arg: usize,
    pub(crate) pending_delete: bool,
    pub(crate) ucb: Option<UnregisterHook>,
}

impl Callback {
    fn matches(&self, cb: IntrCallback, arg: Option<usize>) -> bool {
        std::ptr::fn_addr_eq(self.cb, cb) && arg.map_or(true, |a| a == self.arg)
    }
}

pub(crate) struct IntrSource {
    pub(crate) handle: IntrHandle,
    pub(crate) callbacks: Vec<Callback>,
    /// Set while this source's callbacks are running on the dispatch thread.
    pub(crate) active: bool,
}

/// State shared between the caller-facing manager and the dispatch thread.
pub(crate) struct Shared {
    pub(crate) sources: Mutex<Vec<IntrSource>>,
    pub(crate) pipe_rx: OwnedFd,
    pipe_tx: OwnedFd,
    pub(crate) shutdown: AtomicBool,
}

impl Shared {
    /// Writes one byte to the self-pipe so the dispatch thread rebuilds its
    /// wait set. Best-effort: the registry mutation that triggered the wake
    /// has already been applied.
    pub(crate) fn wake(&self) -> Result<()> {
        match unistd::write(&self.pipe_tx, b"1") {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("wake pipe write failed, err: {}", e);
                Err(IntrError::BrokenPipe)
            }
        }
    }
}

/// Registry of interrupt sources plus the background thread that serves
/// them. Cheap to clone; all clones share one registry and one thread.
#[derive(Clone)]
pub struct InterruptManager {
    shared: Arc<Shared>,
    dispatch_thread: Arc<Mutex<Option<JoinHandle<()>>>>,
    dispatch_thread_id: ThreadId,
}

impl InterruptManager {
    /// Creates the self-pipe and spawns the dispatch thread. Failure of
    /// either is fatal to initialization; nothing is left running.
    pub fn start() -> Result<Self> {
        let (pipe_rx, pipe_tx) = unistd::pipe()?;
        let shared = Arc::new(Shared {
            sources: Mutex::new(Vec::new()),
            pipe_rx,
            pipe_tx,
            shutdown: AtomicBool::new(false),
        });

        let thread_shared = shared.clone();
        let join = thread::Builder::new()
            .name("intr".to_string())
            .spawn(move || dispatch::dispatch_loop(thread_shared))
            .map_err(|e| {
                error!("failed to create interrupt dispatch thread: {}", e);
                IntrError::Io(Errno::from_raw(e.raw_os_error().unwrap_or(0)))
            })?;

        let dispatch_thread_id = join.thread().id();
        Ok(InterruptManager {
            shared,
            dispatch_thread: Arc::new(Mutex::new(Some(join))),
            dispatch_thread_id,
        })
    }

    /// Registers `cb(arg)` against the handle's primary fd. Callbacks on one
    /// source fire in registration order. A [`IntrError::BrokenPipe`] return
    /// means the registration stuck but the dispatch thread wake failed.
    #[tracing::instrument(skip_all, fields(fd = handle.fd()))]
    pub fn register(&self, handle: &IntrHandle, cb: IntrCallback, arg: usize) -> Result<()> {
        if handle.fd() < 0 {
            error!("registering with invalid fd: {}", handle.fd());
            return Err(IntrError::InvalidArgument("negative interrupt fd"));
        }

        let callback = Callback {
            cb,
            arg,
            pending_delete: false,
            ucb: None,
        };

        let mut wake_thread = false;
        {
            let mut sources = self.shared.sources.lock().unwrap();
            match sources.iter_mut().find(|s| s.handle.fd() == handle.fd()) {
                Some(src) => {
                    // An emptied source is absent from the wait set; adding
                    // the first callback back requires a rebuild.
                    if src.callbacks.is_empty() {
                        wake_thread = true;
                    }
                    src.callbacks
                        .try_reserve(1)
                        .map_err(|_| IntrError::AllocationFailure)?;
                    src.callbacks.push(callback);
                }
                None => {
                    sources
                        .try_reserve(1)
                        .map_err(|_| IntrError::AllocationFailure)?;
                    let mut callbacks = Vec::new();
                    callbacks
                        .try_reserve(1)
                        .map_err(|_| IntrError::AllocationFailure)?;
                    callbacks.push(callback);
                    sources.push(IntrSource {
                        handle: handle.clone(),
                        callbacks,
                        active: false,
                    });
                    wake_thread = true;
                }
            }
        }

        let ret = if wake_thread { self.shared.wake() } else { Ok(()) };
        debug!("registered interrupt callback, fd: {}", handle.fd());
        trace!(fd = handle.fd(), ok = ret.is_ok(), "intr_callback_register");
        ret
    }

    /// Removes every callback matching `(cb, arg)`; `None` matches any
    /// argument. Returns the number removed. Fails with [`IntrError::Busy`]
    /// while the source's callbacks are running on the dispatch thread.
    #[tracing::instrument(skip_all, fields(fd = handle.fd()))]
    pub fn unregister(
        &self,
        handle: &IntrHandle,
        cb: IntrCallback,
        arg: Option<usize>,
    ) -> Result<usize> {
        if handle.fd() < 0 {
            error!("unregistering with invalid fd: {}", handle.fd());
            return Err(IntrError::InvalidArgument("negative interrupt fd"));
        }

        let removed;
        {
            let mut sources = self.shared.sources.lock().unwrap();
            let Some(idx) = sources.iter().position(|s| s.handle.fd() == handle.fd()) else {
                return Err(IntrError::NotFound(handle.fd()));
            };
            if sources[idx].active {
                return Err(IntrError::Busy(handle.fd()));
            }

            let src = &mut sources[idx];
            let before = src.callbacks.len();
            src.callbacks.retain(|c| !c.matches(cb, arg));
            removed = before - src.callbacks.len();

            if src.callbacks.is_empty() {
                sources.remove(idx);
                debug!("removed interrupt source, fd: {}", handle.fd());
            }
        }

        self.shared.wake()?;
        trace!(fd = handle.fd(), removed, "intr_callback_unregister");
        Ok(removed)
    }

    /// [`Self::unregister`] that retries on [`IntrError::Busy`], yielding
    /// between attempts, until the source goes inactive.
    pub fn unregister_sync(
        &self,
        handle: &IntrHandle,
        cb: IntrCallback,
        arg: Option<usize>,
    ) -> Result<usize> {
        loop {
            match self.unregister(handle, cb, arg) {
                Err(IntrError::Busy(_)) => thread::yield_now(),
                ret => return ret,
            }
        }
    }

    /// Marks matching callbacks for deletion by the dispatch thread after
    /// the current invocation round; `hook` runs right before each one is
    /// dropped. Only meaningful while the source is active, typically called
    /// from within one of its own callbacks.
    #[tracing::instrument(skip_all, fields(fd = handle.fd()))]
    pub fn unregister_pending(
        &self,
        handle: &IntrHandle,
        cb: IntrCallback,
        arg: Option<usize>,
        hook: Option<UnregisterHook>,
    ) -> Result<usize> {
        if handle.fd() < 0 {
            error!("unregistering with invalid fd: {}", handle.fd());
            return Err(IntrError::InvalidArgument("negative interrupt fd"));
        }

        let mut sources = self.shared.sources.lock().unwrap();
        let Some(src) = sources.iter_mut().find(|s| s.handle.fd() == handle.fd()) else {
            return Err(IntrError::NotFound(handle.fd()));
        };
        if !src.active {
            return Err(IntrError::Busy(handle.fd()));
        }

        let mut marked = 0;
        for c in src.callbacks.iter_mut() {
            if c.matches(cb, arg) {
                c.pending_delete = true;
                c.ucb = hook;
                marked += 1;
            }
        }
        Ok(marked)
    }

    /// True when called from the dispatch thread itself.
    pub fn is_dispatch_thread(&self) -> bool {
        thread::current().id() == self.dispatch_thread_id
    }

    /// Stops the dispatch thread and joins it. Outstanding registrations are
    /// dropped with the registry.
    pub fn shutdown(self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.shared.wake();
        if let Some(join) = self.dispatch_thread.lock().unwrap().take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
impl InterruptManager {
    pub(crate) fn source_count(&self) -> usize {
        self.shared.sources.lock().unwrap().len()
    }

    pub(crate) fn callback_count(&self, fd: std::os::fd::RawFd) -> usize {
        let sources = self.shared.sources.lock().unwrap();
        sources
            .iter()
            .find(|s| s.handle.fd() == fd)
            .map_or(0, |s| s.callbacks.len())
    }

    pub(crate) fn has_source(&self, fd: std::os::fd::RawFd) -> bool {
        let sources = self.shared.sources.lock().unwrap();
        sources.iter().any(|s| s.handle.fd() == fd)
    }

    pub(crate) fn set_active(&self, fd: std::os::fd::RawFd, active: bool) -> bool {
        let mut sources = self.shared.sources.lock().unwrap();
        match sources.iter_mut().find(|s| s.handle.fd() == fd) {
            Some(src) => {
                src.active = active;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;
    use std::time::Duration;

    use nix::unistd;

    use super::*;
    use crate::handle::HandleType;

    fn nop(_arg: usize) {}
    fn nop2(_arg: usize) {}

    #[test]
    fn register_rejects_invalid_fd() -> anyhow::Result<()> {
        let mgr = InterruptManager::start()?;
        let handle = IntrHandle::new(HandleType::Ext, -1);
        assert!(matches!(
            mgr.register(&handle, nop, 0),
            Err(IntrError::InvalidArgument(_))
        ));
        mgr.shutdown();
        Ok(())
    }

    #[test]
    fn callback_count_is_net_of_matched_removals() -> anyhow::Result<()> {
        let mgr = InterruptManager::start()?;
        let (r, _w) = unistd::pipe()?;
        let handle = IntrHandle::new(HandleType::Ext, r.as_raw_fd());

        mgr.register(&handle, nop, 1)?;
        mgr.register(&handle, nop, 2)?;
        mgr.register(&handle, nop2, 1)?;
        assert_eq!(mgr.callback_count(handle.fd()), 3);
        assert_eq!(mgr.source_count(), 1);

        assert_eq!(mgr.unregister(&handle, nop, Some(2))?, 1);
        assert_eq!(mgr.callback_count(handle.fd()), 2);
        assert_eq!(mgr.unregister(&handle, nop2, Some(1))?, 1);
        assert_eq!(mgr.unregister(&handle, nop, None)?, 1);

        // last callback removed the source with it
        assert!(matches!(
            mgr.unregister(&handle, nop, None),
            Err(IntrError::NotFound(_))
        ));
        assert_eq!(mgr.source_count(), 0);
        mgr.shutdown();
        Ok(())
    }

    #[test]
    fn wildcard_arg_removes_all_matching_fn() -> anyhow::Result<()> {
        let mgr = InterruptManager::start()?;
        let (r, _w) = unistd::pipe()?;
        let handle = IntrHandle::new(HandleType::Ext, r.as_raw_fd());

        mgr.register(&handle, nop, 1)?;
        mgr.register(&handle, nop, 2)?;
        mgr.register(&handle, nop, 3)?;
        mgr.register(&handle, nop2, 4)?;
        assert_eq!(mgr.unregister(&handle, nop, None)?, 3);
        assert_eq!(mgr.callback_count(handle.fd()), 1);
        mgr.shutdown();
        Ok(())
    }

    #[test]
    fn unregister_on_active_source_is_busy() -> anyhow::Result<()> {
        let mgr = InterruptManager::start()?;
        let (r, _w) = unistd::pipe()?;
        let handle = IntrHandle::new(HandleType::Ext, r.as_raw_fd());
        mgr.register(&handle, nop, 1)?;

        assert!(mgr.set_active(handle.fd(), true));
        assert!(matches!(
            mgr.unregister(&handle, nop, None),
            Err(IntrError::Busy(_))
        ));

        // sync variant spins until another thread clears the flag
        let mgr2 = mgr.clone();
        let fd = handle.fd();
        let clearer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            mgr2.set_active(fd, false);
        });
        assert_eq!(mgr.unregister_sync(&handle, nop, None)?, 1);
        clearer.join().unwrap();
        mgr.shutdown();
        Ok(())
    }

    #[test]
    fn unregister_pending_requires_active_source() -> anyhow::Result<()> {
        let mgr = InterruptManager::start()?;
        let (r, _w) = unistd::pipe()?;
        let handle = IntrHandle::new(HandleType::Ext, r.as_raw_fd());

        assert!(matches!(
            mgr.unregister_pending(&handle, nop, None, None),
            Err(IntrError::NotFound(_))
        ));

        mgr.register(&handle, nop, 1)?;
        assert!(matches!(
            mgr.unregister_pending(&handle, nop, None, None),
            Err(IntrError::Busy(_))
        ));

        mgr.set_active(handle.fd(), true);
        assert_eq!(mgr.unregister_pending(&handle, nop, None, None)?, 1);
        // marking does not remove anything by itself
        assert_eq!(mgr.callback_count(handle.fd()), 1);
        mgr.set_active(handle.fd(), false);
        mgr.shutdown();
        Ok(())
    }

    #[test]
    fn sources_are_keyed_by_primary_fd() -> anyhow::Result<()> {
        let mgr = InterruptManager::start()?;
        let (r1, _w1) = unistd::pipe()?;
        let (r2, _w2) = unistd::pipe()?;

        // same fd through two distinct handles lands on one source
        let a = IntrHandle::new(HandleType::Ext, r1.as_raw_fd());
        let b = IntrHandle::new(HandleType::Uio, r1.as_raw_fd());
        mgr.register(&a, nop, 1)?;
        mgr.register(&b, nop, 2)?;
        assert_eq!(mgr.source_count(), 1);

        let c = IntrHandle::new(HandleType::Ext, r2.as_raw_fd());
        mgr.register(&c, nop, 3)?;
        assert_eq!(mgr.source_count(), 2);
        mgr.shutdown();
        Ok(())
    }
}
