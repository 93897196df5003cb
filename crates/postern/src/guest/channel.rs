// SPDX-License-Identifier: Apache-2.0

use super::alloc::{Alloc, Collector};
use super::arena::Arena;
use super::call::Call;
use super::Host;
use crate::item::{Family, Header, HEADER_SIZE};
use crate::{Error, Result, MAX_ARENA_SIZE};

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use libc::{EFAULT, ENOMEM, EOVERFLOW};
use tracing::{error, trace, trace_span};

/// Largest errno value a host may report.
const MAX_ERRNO: usize = 4095;

/// Per-family marshaling channel.
///
/// A channel lazily creates one [`Arena`] and serializes all requests of its family on it,
/// so there is at most one request of a family in flight at any time. The arena is held
/// while the host runs the request, which may block indefinitely, so other callers of the
/// family sleep on the lock instead of spinning.
#[derive(Debug)]
pub struct Channel {
    family: Family,
    capacity: AtomicUsize,
    arena: Mutex<Option<Arena>>,
    hint: AtomicUsize,
}

impl Channel {
    /// Creates a channel, whose arena will hold `capacity` bytes once created.
    pub fn new(family: Family, capacity: usize) -> Self {
        Self {
            family,
            capacity: AtomicUsize::new(capacity),
            arena: Mutex::new(None),
            hint: AtomicUsize::new(0),
        }
    }

    /// Returns the family served by this channel.
    #[inline]
    pub fn family(&self) -> Family {
        self.family
    }

    /// Returns the capacity of the arena in bytes, header included.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Returns the arena capacity the last overflowing request required, if any.
    #[inline]
    pub fn required(&self) -> Option<usize> {
        match self.hint.load(Ordering::Relaxed) {
            0 => None,
            hint => Some(hint),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arena>> {
        // Every request rewrites the header, so a poisoned arena is still usable.
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Destroys the arena and recreates it with at least `capacity` bytes.
    ///
    /// Arenas never shrink: a `capacity` not exceeding the current one is a no-op.
    pub fn grow(&self, capacity: usize) -> Result<()> {
        if capacity > MAX_ARENA_SIZE {
            return Err(ENOMEM);
        }
        let mut arena = self.lock();
        if capacity <= self.capacity() {
            return Ok(());
        }
        let new = Arena::new(capacity)?;
        trace!(family = self.family.name(), capacity = new.capacity(), "grow arena");
        self.capacity.store(new.capacity(), Ordering::Relaxed);
        if self.required().map_or(false, |hint| hint <= new.capacity()) {
            self.hint.store(0, Ordering::Relaxed);
        }
        *arena = Some(new);
        Ok(())
    }

    fn record_hint(&self, required: usize) {
        let required = required.min(MAX_ARENA_SIZE);
        trace!(family = self.family.name(), required, "arena overflow");
        self.hint.store(required, Ordering::Relaxed);
    }

    /// Executes `call` on the host.
    ///
    /// Stages the call, passes control to the host exactly once and collects the reply.
    /// Fails with [`EOVERFLOW`] without involving the host if the call does not fit the
    /// arena, and with [`EFAULT`] if the host tampered with the request header.
    pub fn execute<C: Call>(&self, host: &dyn Host, call: C) -> Result<C::Collected> {
        debug_assert_eq!(C::FAMILY, self.family);

        let span = trace_span!("execute", family = self.family.name(), op = call.op());
        let _enter = span.enter();

        let mut guard = self.lock();
        if guard.is_none() {
            *guard = Some(Arena::new(self.capacity())?);
        }
        let arena = guard.as_mut().ok_or(ENOMEM)?;

        let (request, staged) = {
            let (_, data) = arena.split_mut();
            let mut alloc = Alloc::new(data);
            let (argv, staged) = call.stage(&mut alloc)?;
            if alloc.overflowed() {
                self.record_hint(HEADER_SIZE.saturating_add(alloc.used()));
                return Err(EOVERFLOW);
            }
            let request = Header::request(self.family, call.op(), argv.into(), alloc.used());
            (request, staged)
        };
        arena.set_header(&request);

        host.sally(arena.block_mut())?;

        let reply = arena.header();
        if reply.family != request.family
            || reply.op != request.op
            || reply.argv != request.argv
            || reply.data_len != request.data_len
        {
            error!(?request, ?reply, "host modified request header");
            return Err(EFAULT);
        }
        trace!(ret = reply.ret, err = reply.err, "reply");

        match reply.err {
            0 => {}
            err if err > MAX_ERRNO => {
                error!(err, "host returned invalid errno");
                return Err(EFAULT);
            }
            err if err == EOVERFLOW as usize => {
                // The host reports the data length it requires.
                if reply.ret > request.data_len && reply.ret != crate::NULL {
                    self.record_hint(HEADER_SIZE.saturating_add(reply.ret));
                }
                return Err(EOVERFLOW);
            }
            err => return Err(err as Error),
        }

        let (_, data) = arena.split();
        let col = Collector::new(&data[..request.data_len]);
        call.collect(staged, reply.ret, &col)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::call::fs::{Close, Write};
    use crate::plain::Plain;

    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc::{channel, Receiver};
    use std::thread;
    use std::time::Duration;

    use libc::EBADF;

    /// Host, which replies with whatever the test scripted.
    struct Scripted<F: Fn(&mut Header) + Send + Sync> {
        called: AtomicBool,
        reply: F,
    }

    impl<F: Fn(&mut Header) + Send + Sync> Host for Scripted<F> {
        fn sally(&self, block: &mut [usize]) -> Result<()> {
            self.called.store(true, Ordering::SeqCst);
            let (_, bytes, _) = unsafe { block.align_to_mut::<u8>() };
            let mut header = Header::read_from(bytes).unwrap();
            (self.reply)(&mut header);
            bytes[..HEADER_SIZE].copy_from_slice(header.as_bytes());
            Ok(())
        }
    }

    /// Host, which holds every request until the test releases it.
    struct Gate {
        calls: AtomicUsize,
        release: Mutex<Receiver<()>>,
    }

    impl Host for Gate {
        fn sally(&self, _: &mut [usize]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.lock().unwrap().recv().unwrap();
            Ok(())
        }
    }

    fn scripted<F: Fn(&mut Header) + Send + Sync>(reply: F) -> Scripted<F> {
        Scripted {
            called: AtomicBool::new(false),
            reply,
        }
    }

    #[test]
    fn lazy_arena() {
        let channel = Channel::new(Family::Fs, HEADER_SIZE + 64);
        assert!(channel.lock().is_none());

        let host = scripted(|_| {});
        channel.execute(&host, Close { fd: 3 }).unwrap();
        assert!(channel.lock().is_some());
    }

    #[test]
    fn one_request_in_flight() {
        let (tx, rx) = channel();
        let host = Gate {
            calls: AtomicUsize::new(0),
            release: Mutex::new(rx),
        };
        let chan = Channel::new(Family::Fs, HEADER_SIZE + 64);

        thread::scope(|s| {
            let first = s.spawn(|| chan.execute(&host, Close { fd: 3 }));
            while host.calls.load(Ordering::SeqCst) == 0 {
                thread::yield_now();
            }

            // The second request waits for the arena while the host holds the first.
            let second = s.spawn(|| chan.execute(&host, Close { fd: 4 }));
            thread::sleep(Duration::from_millis(50));
            assert_eq!(host.calls.load(Ordering::SeqCst), 1);

            tx.send(()).unwrap();
            tx.send(()).unwrap();
            assert_eq!(first.join().unwrap(), Ok(()));
            assert_eq!(second.join().unwrap(), Ok(()));
        });
        assert_eq!(host.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn host_errno() {
        let channel = Channel::new(Family::Fs, HEADER_SIZE + 64);

        let host = scripted(|h| h.err = EBADF as _);
        assert_eq!(channel.execute(&host, Close { fd: 3 }), Err(EBADF));

        let host = scripted(|h| h.err = 5000);
        assert_eq!(channel.execute(&host, Close { fd: 3 }), Err(EFAULT));
    }

    #[test]
    fn tampered_header() {
        let channel = Channel::new(Family::Fs, HEADER_SIZE + 64);

        let host = scripted(|h| h.data_len += 8);
        let call = Write { fd: 1, buf: b"data" };
        assert_eq!(channel.execute(&host, call), Err(EFAULT));

        let host = scripted(|h| h.argv[0] = 7);
        assert_eq!(channel.execute(&host, Close { fd: 3 }), Err(EFAULT));

        let host = scripted(|h| h.family = Family::Socket as _);
        assert_eq!(channel.execute(&host, Close { fd: 3 }), Err(EFAULT));
    }

    #[test]
    fn overflow_skips_host() {
        let channel = Channel::new(Family::Fs, HEADER_SIZE + 8);
        let host = scripted(|h| h.ret = 0);
        let path = [b'a'; 20];
        let call = crate::guest::call::fs::Unlink { path: &path };

        assert_eq!(channel.execute(&host, call), Err(EOVERFLOW));
        assert!(!host.called.load(Ordering::SeqCst));
        assert_eq!(channel.required(), Some(HEADER_SIZE + 21));

        channel.grow(HEADER_SIZE + 21).unwrap();
        assert_eq!(channel.capacity(), HEADER_SIZE + 24);
        assert_eq!(channel.required(), None);

        let call = crate::guest::call::fs::Unlink { path: &path };
        assert_eq!(channel.execute(&host, call), Ok(()));
        assert!(host.called.load(Ordering::SeqCst));
    }

    #[test]
    fn grow_never_shrinks() {
        let channel = Channel::new(Family::Epoll, HEADER_SIZE + 64);
        channel.grow(HEADER_SIZE + 8).unwrap();
        assert_eq!(channel.capacity(), HEADER_SIZE + 64);
        assert_eq!(channel.grow(MAX_ARENA_SIZE + 1), Err(ENOMEM));
    }

    #[test]
    fn host_overflow_hint() {
        let channel = Channel::new(Family::Fs, HEADER_SIZE + 64);

        let host = scripted(|h| {
            h.err = EOVERFLOW as _;
            h.ret = 1000;
        });
        let call = Write { fd: 1, buf: b"x" };
        assert_eq!(channel.execute(&host, call), Err(EOVERFLOW));
        assert_eq!(channel.required(), Some(HEADER_SIZE + 1000));

        let host = scripted(|h| {
            h.err = EOVERFLOW as _;
            h.ret = usize::MAX - 1;
        });
        let call = Write { fd: 1, buf: b"x" };
        assert_eq!(channel.execute(&host, call), Err(EOVERFLOW));
        assert_eq!(channel.required(), Some(MAX_ARENA_SIZE));
    }
}
