use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, error};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::unistd;

use crate::handle::HandleType;
use crate::registry::Shared;

/// Scratch buffer large enough for any per-type counter read.
pub(crate) const READ_BUF_LEN: usize = 16;

enum Cycle {
    Continue,
    Rebuild,
}

/// Body of the dispatch thread. Rebuilds the wait set from the registry,
/// serves readiness events until a registry mutation is signalled on the
/// self-pipe, then starts over with a fresh multiplexer instance.
pub(crate) fn dispatch_loop(shared: Arc<Shared>) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            debug!("interrupt dispatch thread exiting");
            return;
        }

        let epoll =
            Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).expect("cannot create epoll instance");
        let pipe_fd = shared.pipe_rx.as_raw_fd();
        epoll
            .add(
                &shared.pipe_rx,
                EpollEvent::new(
                    EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI,
                    pipe_fd as u64,
                ),
            )
            .expect("cannot add the wake pipe to the wait set");

        let mut numfds = 1usize;
        {
            let sources = shared.sources.lock().unwrap();
            for src in sources.iter() {
                if src.callbacks.is_empty() {
                    continue;
                }
                let fd = src.handle.fd();
                let events = EpollFlags::EPOLLIN
                    | EpollFlags::EPOLLPRI
                    | EpollFlags::EPOLLRDHUP
                    | EpollFlags::EPOLLHUP;
                // Safety: fd liveness until unregister is the registrant's
                // contract.
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                match epoll.add(borrowed, EpollEvent::new(events, fd as u64)) {
                    Ok(()) => numfds += 1,
                    Err(e) => {
                        error!("cannot add fd to the wait set, fd: {}, err: {}", fd, e);
                    }
                }
            }
        }

        handle_interrupts(&shared, &epoll, numfds);
        // dropping the multiplexer closes it; the next pass rebuilds
    }
}

fn handle_interrupts(shared: &Arc<Shared>, epoll: &Epoll, numfds: usize) {
    let mut events = vec![EpollEvent::empty(); numfds];
    loop {
        let nfds = match epoll.wait(&mut events, EpollTimeout::NONE) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                error!("interrupt wait failed, err: {}", e);
                return;
            }
        };
        if nfds == 0 {
            continue;
        }
        if let Cycle::Rebuild = process_interrupts(shared, &events[..nfds]) {
            return;
        }
    }
}

fn process_interrupts(shared: &Arc<Shared>, events: &[EpollEvent]) -> Cycle {
    let pipe_fd = shared.pipe_rx.as_raw_fd();
    let mut buf = [0u8; READ_BUF_LEN];

    for ev in events {
        let fd = ev.data() as RawFd;

        // a byte on the self-pipe means the wait set is stale
        if fd == pipe_fd {
            let _ = unistd::read(pipe_fd, &mut buf);
            return Cycle::Rebuild;
        }

        let ty = {
            let mut sources = shared.sources.lock().unwrap();
            let Some(src) = sources.iter_mut().find(|s| s.handle.fd() == fd) else {
                continue;
            };
            src.active = true;
            src.handle.handle_type()
        };

        let (nbytes, unconditional) = drain_len(ty);
        let mut deliver = unconditional;
        if nbytes > 0 {
            // clear the ready flag before dispatching
            match unistd::read(fd, &mut buf[..nbytes]) {
                Ok(0) => error!("read nothing from fd: {}", fd),
                Ok(_) => deliver = true,
                Err(e) if e == Errno::EINTR || e == Errno::EAGAIN => {
                    let mut sources = shared.sources.lock().unwrap();
                    if let Some(src) = sources.iter_mut().find(|s| s.handle.fd() == fd) {
                        src.active = false;
                    }
                    continue;
                }
                Err(e) => {
                    // the device is unplugged or buggy; drop it as a source
                    // and force the wait set to be rebuilt without it
                    error!(
                        "error reading from fd: {}, err: {}; removing interrupt source",
                        fd, e
                    );
                    let mut sources = shared.sources.lock().unwrap();
                    if let Some(idx) = sources.iter().position(|s| s.handle.fd() == fd) {
                        sources.remove(idx);
                    }
                    return Cycle::Rebuild;
                }
            }
        }

        let mut sources = shared.sources.lock().unwrap();

        if deliver {
            // invoke each callback on a copy taken under the lock, with the
            // lock released around the call so registry operations from
            // within a callback make progress
            let mut i = 0;
            loop {
                let cb = {
                    let Some(src) = sources.iter().find(|s| s.handle.fd() == fd) else {
                        break;
                    };
                    match src.callbacks.get(i) {
                        Some(c) => *c,
                        None => break,
                    }
                };
                drop(sources);
                (cb.cb)(cb.arg);
                sources = shared.sources.lock().unwrap();
                i += 1;
            }
        }

        let Some(idx) = sources.iter().position(|s| s.handle.fd() == fd) else {
            continue;
        };
        let src = &mut sources[idx];
        src.active = false;

        // sweep out callbacks marked for deletion while they were running
        let mut removed = 0;
        let mut i = 0;
        while i < src.callbacks.len() {
            if src.callbacks[i].pending_delete {
                let cb = src.callbacks.remove(i);
                if let Some(ucb) = cb.ucb {
                    ucb(&src.handle, cb.arg);
                }
                removed += 1;
            } else {
                i += 1;
            }
        }

        if src.callbacks.is_empty() {
            sources.remove(idx);
            debug!("interrupt source drained of callbacks, fd: {}", fd);
        }

        // the wake is sent under the lock so the rebuild cannot miss the
        // pruning that triggered it
        if removed > 0 && shared.wake().is_err() {
            return Cycle::Rebuild;
        }
    }

    Cycle::Continue
}

/// Bytes to read to clear one event, per handle type. The second member is
/// set for types that dispatch unconditionally without draining.
fn drain_len(ty: HandleType) -> (usize, bool) {
    match ty {
        HandleType::Uio | HandleType::UioIntx => (4, false),
        HandleType::Alarm => (8, false),
        HandleType::VfioMsix
        | HandleType::VfioMsi
        | HandleType::VfioLegacy
        | HandleType::VfioReq => (8, false),
        HandleType::Vdev | HandleType::Ext | HandleType::DevEvent => (0, true),
        _ => (1, false),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Mutex, Once, OnceLock};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::error::IntrError;
    use crate::handle::IntrHandle;
    use crate::registry::InterruptManager;

    static LOG_INIT: Once = Once::new();

    // route log records through tracing and capture them per test
    fn init_logging() {
        LOG_INIT.call_once(|| {
            tracing_log::LogTracer::init().ok();
            let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        });
    }

    fn eventfd() -> RawFd {
        let fd = unsafe { nix::libc::eventfd(0, 0) };
        assert!(fd >= 0);
        fd
    }

    fn fire(fd: RawFd) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        unistd::write(borrowed, &1u64.to_ne_bytes()).unwrap();
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..2000 {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    static ORDER: Mutex<Vec<usize>> = Mutex::new(Vec::new());
    fn record(arg: usize) {
        ORDER.lock().unwrap().push(arg);
    }

    #[test]
    fn callbacks_fire_in_registration_order() -> anyhow::Result<()> {
        init_logging();
        let mgr = InterruptManager::start()?;
        let efd = eventfd();
        // an alarm handle drains one 8-byte counter, same as an eventfd
        let handle = IntrHandle::new(HandleType::Alarm, efd);

        mgr.register(&handle, record, 1)?;
        mgr.register(&handle, record, 2)?;
        fire(efd);
        assert!(wait_until(|| ORDER.lock().unwrap().len() >= 2));
        assert_eq!(*ORDER.lock().unwrap(), vec![1, 2]);

        // a second event fires the pair exactly once more
        fire(efd);
        assert!(wait_until(|| ORDER.lock().unwrap().len() >= 4));
        assert_eq!(*ORDER.lock().unwrap(), vec![1, 2, 1, 2]);

        assert_eq!(mgr.unregister_sync(&handle, record, None)?, 2);
        mgr.shutdown();
        Ok(())
    }

    static REENT: OnceLock<(InterruptManager, IntrHandle)> = OnceLock::new();
    static REENT_RESULT: Mutex<Option<Result<usize, IntrError>>> = Mutex::new(None);
    fn reentrant_cb(_arg: usize) {
        let (mgr, handle) = REENT.get().unwrap();
        let res = mgr.unregister(handle, reentrant_cb, None);
        *REENT_RESULT.lock().unwrap() = Some(res);
    }

    #[test]
    fn unregister_from_own_callback_is_busy() -> anyhow::Result<()> {
        let mgr = InterruptManager::start()?;
        let efd = eventfd();
        let handle = IntrHandle::new(HandleType::Alarm, efd);
        REENT.set((mgr.clone(), handle.clone())).ok().unwrap();

        mgr.register(&handle, reentrant_cb, 0)?;
        fire(efd);
        assert!(wait_until(|| REENT_RESULT.lock().unwrap().is_some()));
        assert!(matches!(
            REENT_RESULT.lock().unwrap().unwrap(),
            Err(IntrError::Busy(_))
        ));

        // once the invocation round finished, removal goes through
        assert_eq!(mgr.unregister_sync(&handle, reentrant_cb, None)?, 1);
        mgr.shutdown();
        Ok(())
    }

    static PEND: OnceLock<(InterruptManager, IntrHandle)> = OnceLock::new();
    static HOOK_CALLS: AtomicUsize = AtomicUsize::new(0);
    static HOOK_ARG: AtomicUsize = AtomicUsize::new(0);
    fn pending_cb(_arg: usize) {
        let (mgr, handle) = PEND.get().unwrap();
        mgr.unregister_pending(handle, pending_cb, None, Some(pending_hook))
            .unwrap();
    }
    fn pending_hook(_handle: &IntrHandle, arg: usize) {
        HOOK_ARG.store(arg, Ordering::SeqCst);
        HOOK_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn pending_delete_prunes_after_invocation() -> anyhow::Result<()> {
        let mgr = InterruptManager::start()?;
        let efd = eventfd();
        let handle = IntrHandle::new(HandleType::Alarm, efd);
        PEND.set((mgr.clone(), handle.clone())).ok().unwrap();

        mgr.register(&handle, pending_cb, 9)?;
        fire(efd);
        assert!(wait_until(|| HOOK_CALLS.load(Ordering::SeqCst) == 1));
        assert_eq!(HOOK_ARG.load(Ordering::SeqCst), 9);

        // the emptied source is gone from the registry
        assert!(wait_until(|| !mgr.has_source(handle.fd())));
        assert!(matches!(
            mgr.unregister(&handle, pending_cb, None),
            Err(IntrError::NotFound(_))
        ));
        mgr.shutdown();
        Ok(())
    }

    static EVICTED_FIRED: AtomicUsize = AtomicUsize::new(0);
    fn evicted_cb(_arg: usize) {
        EVICTED_FIRED.fetch_add(1, Ordering::SeqCst);
    }
    static ALIVE_FIRED: AtomicUsize = AtomicUsize::new(0);
    fn alive_cb(_arg: usize) {
        ALIVE_FIRED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn dead_source_is_evicted_and_loop_survives() -> anyhow::Result<()> {
        init_logging();
        let mgr = InterruptManager::start()?;

        // a uio handle drains 4 bytes, which an eventfd rejects with EINVAL;
        // the read error must evict the source without killing the loop
        let bad_efd = eventfd();
        let bad = IntrHandle::new(HandleType::Uio, bad_efd);
        mgr.register(&bad, evicted_cb, 0)?;
        fire(bad_efd);
        assert!(wait_until(|| !mgr.has_source(bad.fd())));
        assert_eq!(EVICTED_FIRED.load(Ordering::SeqCst), 0);
        assert!(matches!(
            mgr.unregister(&bad, evicted_cb, None),
            Err(IntrError::NotFound(_))
        ));

        // the dispatch thread keeps serving other sources
        let good_efd = eventfd();
        let good = IntrHandle::new(HandleType::Alarm, good_efd);
        mgr.register(&good, alive_cb, 0)?;
        fire(good_efd);
        assert!(wait_until(|| ALIVE_FIRED.load(Ordering::SeqCst) == 1));

        assert_eq!(mgr.unregister_sync(&good, alive_cb, None)?, 1);
        mgr.shutdown();
        Ok(())
    }

    #[test]
    fn shutdown_joins_the_dispatch_thread() -> anyhow::Result<()> {
        let mgr = InterruptManager::start()?;
        assert!(!mgr.is_dispatch_thread());
        mgr.shutdown();
        Ok(())
    }
}
