//! Event queue and readiness loop.
//!
//! One thread owns both the deadline-ordered event queue and the epoll set
//! of readiness sources: each container's OOM eventfd plus a wakeup
//! eventfd the queue rings when something is pushed. Dispatch happens on
//! that thread; a container that is locked by a concurrent request gets
//! its event requeued behind the current slot.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant};

use arbor_common::error::{ArborError, Result};
use arbor_common::types::CtId;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::waiter::Waiter;

/// Everything the loop can be asked to do.
#[derive(Debug)]
pub enum Event {
    /// A container's memory cgroup reported OOM.
    Oom(CtId),
    /// A watched task exited; delivered by the reaper.
    Exit {
        /// Exited pid.
        pid: i32,
        /// Raw wait status.
        status: i32,
    },
    /// A task exit picked up from the signal path.
    ChildExit {
        /// Exited pid.
        pid: i32,
        /// Raw wait status.
        status: i32,
    },
    /// A dead container's respawn delay elapsed.
    Respawn(CtId),
    /// A meta container may have lost its last live child.
    MetaExit(CtId),
    /// A dead container outlived its aging time.
    DestroyAged(CtId),
    /// A weak container lost its last client.
    DestroyWeak(CtId),
    /// A wait deadline fired.
    WaitTimeout(Weak<Waiter>),
    /// Periodic stdio rotation and aging sweep.
    RotateLogs,
}

#[derive(Debug)]
struct Scheduled {
    due: Instant,
    seq: u64,
    event: Event,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    heap: BinaryHeap<Reverse<Scheduled>>,
    seq: u64,
}

/// The deadline queue plus the epoll readiness set.
#[derive(Debug)]
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    epoll: Epoll,
    wake: File,
    oom_sources: Mutex<HashMap<u64, CtId>>,
}

const WAKE_TOKEN: u64 = u64::MAX;

impl EventQueue {
    /// Creates the queue with its epoll set and wakeup eventfd.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel objects cannot be created.
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| ArborError::system(format!("epoll_create: {e}")))?;
        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if raw < 0 {
            return Err(ArborError::system("eventfd"));
        }
        // SAFETY: fresh descriptor from eventfd, exclusively owned here.
        let wake = File::from(unsafe { OwnedFd::from_raw_fd(raw) });
        epoll
            .add(&wake, EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN))
            .map_err(|e| ArborError::system(format!("epoll_ctl: {e}")))?;
        Ok(Self {
            inner: Mutex::new(QueueInner::default()),
            epoll,
            wake,
            oom_sources: Mutex::new(HashMap::new()),
        })
    }

    /// Queues an event after `delay`.
    pub fn push_after(&self, delay: Duration, event: Event) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.seq += 1;
        let seq = inner.seq;
        inner.heap.push(Reverse(Scheduled {
            due: Instant::now() + delay,
            seq,
            event,
        }));
        drop(inner);
        self.ring();
    }

    /// Queues an event for immediate dispatch.
    pub fn push(&self, event: Event) {
        self.push_after(Duration::ZERO, event);
    }

    fn ring(&self) {
        let one = 1u64.to_ne_bytes();
        let _ = (&self.wake).write(&one);
    }

    /// Registers a container's OOM eventfd as a readiness source.
    ///
    /// # Errors
    ///
    /// Returns an error if epoll refuses the descriptor.
    pub fn register_oom(&self, id: CtId, fd: &File) -> Result<()> {
        let token = u64::from(id.0);
        self.epoll
            .add(fd, EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, token))
            .map_err(|e| ArborError::system(format!("epoll_ctl add oom: {e}")))?;
        self.oom_sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token, id);
        tracing::debug!(id = %id, fd = fd.as_raw_fd(), "oom source registered");
        Ok(())
    }

    /// Drops a container's OOM source.
    pub fn unregister_oom(&self, id: CtId, fd: &File) {
        let token = u64::from(id.0);
        let _ = self.epoll.delete(fd);
        self.oom_sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&token);
    }

    /// Blocks until a source is readable or the next deadline arrives,
    /// translating readable OOM fds into events, then pops one due event.
    /// Returns `None` on a pure wakeup with nothing due yet.
    pub fn wait_next(&self, max_park: Duration) -> Option<Event> {
        let now = Instant::now();
        let until_due = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .heap
                .peek()
                .map(|Reverse(s)| s.due.saturating_duration_since(now))
        };
        let park = until_due.unwrap_or(max_park).min(max_park);

        if !park.is_zero() {
            let mut ready = [EpollEvent::empty(); 16];
            let timeout = EpollTimeout::try_from(park).unwrap_or(EpollTimeout::NONE);
            match self.epoll.wait(&mut ready, timeout) {
                Ok(n) => {
                    for event in &ready[..n] {
                        let token = event.data();
                        if token == WAKE_TOKEN {
                            let mut buf = [0u8; 8];
                            let _ = (&self.wake).read(&mut buf);
                            continue;
                        }
                        let id = self
                            .oom_sources
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .get(&token)
                            .copied();
                        if let Some(id) = id {
                            self.push(Event::Oom(id));
                        }
                    }
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => tracing::warn!(error = %e, "epoll wait failed"),
            }
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.heap.peek() {
            Some(Reverse(s)) if s.due <= Instant::now() => {
                inner.heap.pop().map(|Reverse(s)| s.event)
            }
            _ => None,
        }
    }

    /// Pops the next due event without blocking; test and drain helper.
    #[must_use]
    pub fn pop_due(&self) -> Option<Event> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.heap.peek() {
            Some(Reverse(s)) if s.due <= Instant::now() => {
                inner.heap.pop().map(|Reverse(s)| s.event)
            }
            _ => None,
        }
    }

    /// Number of queued events, due or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).heap.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_events_pop_in_order() {
        let queue = EventQueue::new().expect("queue");
        queue.push(Event::RotateLogs);
        queue.push(Event::Oom(CtId(4)));
        assert!(matches!(queue.pop_due(), Some(Event::RotateLogs)));
        assert!(matches!(queue.pop_due(), Some(Event::Oom(CtId(4)))));
        assert!(queue.pop_due().is_none());
    }

    #[test]
    fn delayed_events_wait_for_their_deadline() {
        let queue = EventQueue::new().expect("queue");
        queue.push_after(Duration::from_millis(50), Event::Respawn(CtId(5)));
        assert!(queue.pop_due().is_none());
        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(queue.pop_due(), Some(Event::Respawn(CtId(5)))));
    }

    #[test]
    fn wait_next_returns_pushed_event() {
        let queue = EventQueue::new().expect("queue");
        queue.push(Event::RotateLogs);
        let event = queue.wait_next(Duration::from_millis(10));
        assert!(matches!(event, Some(Event::RotateLogs)));
    }

    #[test]
    fn wait_next_times_out_quietly() {
        let queue = EventQueue::new().expect("queue");
        let started = Instant::now();
        let event = queue.wait_next(Duration::from_millis(20));
        assert!(event.is_none());
        assert!(started.elapsed() >= Duration::from_millis(15));
    }
}
