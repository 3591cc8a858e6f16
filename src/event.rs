//! Single-threaded readiness loop with integrated timers.
//!
//! Descriptors live in a fixed-size slot table indexed by fd and are
//! multiplexed with epoll. Timers sit in an insertion-ordered list; a timer
//! deleted while its callback runs is only marked and gets freed by a later
//! scan once nothing references it.
//!
//! Callbacks receive the loop itself plus a caller-owned context `C`, so
//! handlers can register or drop events without any shared global state.
use crate::config::types::{Result, TurfError};
use log::{debug, error};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::Instant;

/// Slot count of the default loop
pub const DEFAULT_SETSIZE: usize = 1024;
/// Poll interval when no timer is pending
pub const DEFAULT_WAIT_MS: i64 = 1000;

pub type TimerId = u64;
/// Marker id of a timer waiting to be freed
pub const TIMER_DELETED: TimerId = u64::MAX;

/// Readiness interest of one descriptor
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Mask(u8);

impl Mask {
    pub const NONE: Mask = Mask(0);
    pub const READ: Mask = Mask(1);
    pub const WRITE: Mask = Mask(2);
    pub const ALL: Mask = Mask(3);

    pub fn contains(self, other: Mask) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    fn epoll_flags(self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.contains(Mask::READ) {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.contains(Mask::WRITE) {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }

    fn from_epoll(flags: EpollFlags) -> Mask {
        let mut mask = Mask::NONE;
        if flags.contains(EpollFlags::EPOLLIN) {
            mask = mask | Mask::READ;
        }
        if flags.contains(EpollFlags::EPOLLOUT) {
            mask = mask | Mask::WRITE;
        }
        // errors and hangups wake whichever side is registered
        if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
            mask = mask | Mask::ALL;
        }
        mask
    }
}

impl std::ops::BitOr for Mask {
    type Output = Mask;
    fn bitor(self, rhs: Mask) -> Mask {
        Mask(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for Mask {
    type Output = Mask;
    fn bitand(self, rhs: Mask) -> Mask {
        Mask(self.0 & rhs.0)
    }
}

impl std::ops::Not for Mask {
    type Output = Mask;
    fn not(self) -> Mask {
        Mask(!self.0 & Mask::ALL.0)
    }
}

/// Called with the fd and the fired mask.
pub type FileCallback<C> = Rc<dyn Fn(&mut EventLoop<C>, &mut C, RawFd, Mask)>;
/// Returns the delay in ms until the next firing, or a negative value to stop.
pub type TimerCallback<C> = Rc<dyn Fn(&mut EventLoop<C>, &mut C, TimerId) -> i64>;

struct FileEvent<C> {
    mask: Mask,
    read: Option<FileCallback<C>>,
    write: Option<FileCallback<C>>,
}

impl<C> Default for FileEvent<C> {
    fn default() -> Self {
        Self {
            mask: Mask::NONE,
            read: None,
            write: None,
        }
    }
}

struct TimerEntry<C> {
    id: TimerId,
    /// Absolute due time in microseconds since loop creation
    when: u64,
    callback: TimerCallback<C>,
    refcnt: u32,
}

/// epoll_ctl operation on one descriptor
#[derive(Clone, Copy, Debug)]
enum Ctl {
    Add,
    Modify,
    Delete,
}

pub struct EventLoop<C> {
    epoll: Epoll,
    events: Vec<FileEvent<C>>,
    maxfd: RawFd,
    timers: Vec<TimerEntry<C>>,
    next_timer_id: TimerId,
    base: Instant,
}

impl<C> EventLoop<C> {
    pub fn new(setsize: usize) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|e| {
            error!("epoll_create1 failed: {}", e);
            TurfError::Sys(e)
        })?;

        let mut events = Vec::with_capacity(setsize);
        events.resize_with(setsize, FileEvent::default);

        Ok(Self {
            epoll,
            events,
            maxfd: -1,
            timers: Vec::new(),
            next_timer_id: 1,
            base: Instant::now(),
        })
    }

    pub fn setsize(&self) -> usize {
        self.events.len()
    }

    fn now_us(&self) -> u64 {
        self.base.elapsed().as_micros() as u64
    }

    fn slot(&self, fd: RawFd) -> Result<usize> {
        if fd < 0 || fd as usize >= self.events.len() {
            return Err(TurfError::InvalidArgument(format!(
                "fd {} outside event table of {}",
                fd,
                self.events.len()
            )));
        }
        Ok(fd as usize)
    }

    fn epoll_ctl(&self, op: Ctl, fd: RawFd, mask: Mask) -> Result<()> {
        // SAFETY: callers registered `fd` and keep it open while it is
        // in the table; the borrow does not outlive this call.
        let target = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut ev = EpollEvent::new(mask.epoll_flags(), fd as u64);
        let rc = match op {
            Ctl::Add => self.epoll.add(target, ev),
            Ctl::Modify => self.epoll.modify(target, &mut ev),
            Ctl::Delete => self.epoll.delete(target),
        };
        rc.map_err(TurfError::Sys)
    }

    /// Register `callback` for the directions in `mask`, merging with any
    /// interest already present on `fd`.
    pub fn create_event(&mut self, fd: RawFd, mask: Mask, callback: FileCallback<C>) -> Result<()> {
        let idx = self.slot(fd)?;
        let old = self.events[idx].mask;
        let op = if old.is_empty() { Ctl::Add } else { Ctl::Modify };
        self.epoll_ctl(op, fd, old | mask).map_err(|e| {
            error!("poll add failed for fd {}: {}", fd, e);
            e
        })?;

        let fe = &mut self.events[idx];
        fe.mask = old | mask;
        if mask.contains(Mask::READ) {
            fe.read = Some(Rc::clone(&callback));
        }
        if mask.contains(Mask::WRITE) {
            fe.write = Some(callback);
        }
        if fd > self.maxfd {
            self.maxfd = fd;
        }
        debug!("event add fd={} mask={:?}", fd, fe.mask);
        Ok(())
    }

    /// Drop the interest in `mask` only; the other direction stays registered.
    pub fn delete_event(&mut self, fd: RawFd, mask: Mask) -> Result<()> {
        let idx = self.slot(fd)?;
        let old = self.events[idx].mask;
        if old.is_empty() {
            return Err(TurfError::NotFound(format!("no event registered on fd {}", fd)));
        }

        let remaining = old & !mask;
        let rc = if remaining.is_empty() {
            self.epoll_ctl(Ctl::Delete, fd, Mask::NONE)
        } else {
            self.epoll_ctl(Ctl::Modify, fd, remaining)
        };
        if let Err(e) = rc {
            // the fd may already be closed, which also removed it from epoll
            debug!("poll del on fd {}: {}", fd, e);
        }

        let fe = &mut self.events[idx];
        fe.mask = remaining;
        if mask.contains(Mask::READ) {
            fe.read = None;
        }
        if mask.contains(Mask::WRITE) {
            fe.write = None;
        }

        if fd == self.maxfd && remaining.is_empty() {
            self.maxfd = (0..fd)
                .rev()
                .find(|i| !self.events[*i as usize].mask.is_empty())
                .unwrap_or(-1);
        }
        Ok(())
    }

    /// Interest currently registered on `fd`.
    pub fn event_mask(&self, fd: RawFd) -> Mask {
        self.slot(fd)
            .map(|idx| self.events[idx].mask)
            .unwrap_or(Mask::NONE)
    }

    /// Schedule `callback` to fire in `ms` milliseconds.
    pub fn create_timer(&mut self, ms: u64, callback: TimerCallback<C>) -> TimerId {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        let when = self.now_us() + ms * 1000;
        self.timers.push(TimerEntry {
            id,
            when,
            callback,
            refcnt: 0,
        });
        id
    }

    /// Mark a timer for removal. Safe to call from the timer's own callback.
    pub fn delete_timer(&mut self, id: TimerId) -> Result<()> {
        if id == TIMER_DELETED {
            return Err(TurfError::NotFound("timer".to_string()));
        }
        match self.timers.iter_mut().find(|t| t.id == id) {
            Some(t) => {
                t.id = TIMER_DELETED;
                Ok(())
            }
            None => Err(TurfError::NotFound(format!("timer {}", id))),
        }
    }

    /// True while a live timer or a descriptor with non-empty interest exists.
    pub fn loop_alive(&self) -> bool {
        if self.timers.iter().any(|t| t.id != TIMER_DELETED) {
            return true;
        }
        self.maxfd >= 0
            && self.events[..=self.maxfd as usize]
                .iter()
                .any(|fe| !fe.mask.is_empty())
    }

    /// Milliseconds until the earliest live timer, `None` without timers.
    fn calc_pop_time(&self) -> Option<i64> {
        let earliest = self
            .timers
            .iter()
            .filter(|t| t.id != TIMER_DELETED)
            .map(|t| t.when)
            .min()?;
        let now = self.now_us();
        if now >= earliest {
            return Some(0);
        }
        // round up so a pending timer is due once the wait ends
        Some(((earliest - now + 999) / 1000) as i64)
    }

    fn poll(&self, timeout_ms: i64) -> Result<Vec<(RawFd, Mask)>> {
        let capacity = (self.maxfd + 1).max(1) as usize;
        let mut ready = vec![EpollEvent::empty(); capacity];
        let timeout = EpollTimeout::try_from(timeout_ms.max(0)).unwrap_or(EpollTimeout::MAX);

        let n = match self.epoll.wait(&mut ready, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(TurfError::Sys(e)),
        };

        Ok(ready[..n]
            .iter()
            .map(|ev| (ev.data() as RawFd, Mask::from_epoll(ev.events())))
            .collect())
    }

    fn process_timers(&mut self, ctx: &mut C) -> usize {
        let mut processed = 0;
        // timers created while scanning wait for the next pass
        let cur_id = self.next_timer_id - 1;
        let mut now = self.now_us();

        let mut i = 0;
        while i < self.timers.len() {
            let entry = &self.timers[i];
            if entry.id == TIMER_DELETED {
                if entry.refcnt > 0 {
                    i += 1;
                } else {
                    self.timers.remove(i);
                }
                continue;
            }
            if entry.id > cur_id || entry.when > now {
                i += 1;
                continue;
            }

            let id = entry.id;
            let callback = Rc::clone(&entry.callback);
            self.timers[i].refcnt += 1;
            let rc = callback(self, ctx, id);
            processed += 1;

            now = self.now_us();
            // callbacks only append, so the entry is still at index i
            let entry = &mut self.timers[i];
            entry.refcnt -= 1;
            if rc >= 0 {
                entry.when = now + rc as u64 * 1000;
            } else {
                entry.id = TIMER_DELETED;
            }
            i += 1;
        }
        processed
    }

    /// One iteration: wait for readiness or the next timer, run ready
    /// descriptor callbacks, then due timers. Returns the callbacks run.
    pub fn process_events(&mut self, ctx: &mut C) -> Result<usize> {
        let wait_ms = self.calc_pop_time().unwrap_or(DEFAULT_WAIT_MS);
        let fired = self.poll(wait_ms)?;

        let mut processed = 0;
        for (fd, mask) in fired {
            let Ok(idx) = self.slot(fd) else { continue };

            let read = (self.events[idx].mask & mask)
                .contains(Mask::READ)
                .then(|| self.events[idx].read.clone())
                .flatten();
            if let Some(cb) = read {
                cb(self, ctx, fd, mask);
            }

            // the read callback may have removed or replaced the registration
            let write = (self.events[idx].mask & mask)
                .contains(Mask::WRITE)
                .then(|| self.events[idx].write.clone())
                .flatten();
            if let Some(cb) = write {
                cb(self, ctx, fd, mask);
            }
            processed += 1;
        }

        processed += self.process_timers(ctx);
        Ok(processed)
    }

    /// Drive the loop until nothing is registered.
    pub fn run(&mut self, ctx: &mut C) -> Result<()> {
        while self.loop_alive() {
            self.process_events(ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{pipe, write};
    use std::os::fd::AsRawFd;

    #[derive(Default)]
    struct Counter {
        reads: usize,
        fires: Vec<TimerId>,
    }

    #[test]
    fn test_mask_ops() {
        let m = Mask::READ | Mask::WRITE;
        assert_eq!(m, Mask::ALL);
        assert_eq!(m & !Mask::WRITE, Mask::READ);
        assert!(!Mask::READ.contains(Mask::WRITE));
        assert!(!Mask::NONE.contains(Mask::NONE));
    }

    #[test]
    fn test_out_of_range_fd() {
        let mut el: EventLoop<Counter> = EventLoop::new(16).unwrap();
        let cb: FileCallback<Counter> =
            Rc::new(|_: &mut EventLoop<Counter>, _: &mut Counter, _: RawFd, _: Mask| {});
        assert_eq!(el.create_event(16, Mask::READ, cb.clone()).unwrap_err().errno(), libc::EINVAL);
        assert_eq!(el.create_event(-1, Mask::READ, cb).unwrap_err().errno(), libc::EINVAL);
        assert_eq!(el.delete_event(3, Mask::READ).unwrap_err().errno(), libc::ENOENT);
    }

    #[test]
    fn test_read_dispatch_and_liveness() {
        let mut el: EventLoop<Counter> = EventLoop::new(DEFAULT_SETSIZE).unwrap();
        let mut ctx = Counter::default();
        assert!(!el.loop_alive());

        let (r, w) = pipe().unwrap();
        let rfd = r.as_raw_fd();
        el.create_event(
            rfd,
            Mask::READ,
            Rc::new(|el: &mut EventLoop<Counter>, ctx: &mut Counter, fd: RawFd, mask: Mask| {
                assert!(mask.contains(Mask::READ));
                let mut buf = [0u8; 8];
                let _ = nix::unistd::read(fd, &mut buf);
                ctx.reads += 1;
                el.delete_event(fd, Mask::READ).unwrap();
            }),
        )
        .unwrap();
        assert!(el.loop_alive());

        write(&w, b"x").unwrap();
        el.process_events(&mut ctx).unwrap();
        assert_eq!(ctx.reads, 1);
        assert!(!el.loop_alive());
    }

    #[test]
    fn test_timer_reschedule_and_cancel() {
        let mut el: EventLoop<Counter> = EventLoop::new(8).unwrap();
        let mut ctx = Counter::default();

        el.create_timer(
            0,
            Rc::new(|_: &mut EventLoop<Counter>, ctx: &mut Counter, id: TimerId| {
                ctx.fires.push(id);
                if ctx.fires.len() < 3 {
                    0
                } else {
                    -1
                }
            }),
        );
        el.run(&mut ctx).unwrap();
        assert_eq!(ctx.fires.len(), 3);
        assert!(!el.loop_alive());
    }

    #[test]
    fn test_timer_created_in_callback_waits() {
        let mut el: EventLoop<Counter> = EventLoop::new(8).unwrap();
        let mut ctx = Counter::default();

        el.create_timer(
            0,
            Rc::new(|el: &mut EventLoop<Counter>, ctx: &mut Counter, id: TimerId| {
                ctx.fires.push(id);
                el.create_timer(0, Rc::new(|_: &mut EventLoop<Counter>, ctx: &mut Counter, id: TimerId| {
                    ctx.fires.push(id);
                    -1
                }));
                -1
            }),
        );
        el.process_events(&mut ctx).unwrap();
        assert_eq!(ctx.fires, vec![1]);
        el.process_events(&mut ctx).unwrap();
        assert_eq!(ctx.fires, vec![1, 2]);
    }

    #[test]
    fn test_self_delete_in_callback() {
        let mut el: EventLoop<Counter> = EventLoop::new(8).unwrap();
        let mut ctx = Counter::default();

        el.create_timer(
            0,
            Rc::new(|el: &mut EventLoop<Counter>, ctx: &mut Counter, id: TimerId| {
                ctx.fires.push(id);
                el.delete_timer(id).unwrap();
                100
            }),
        );
        el.process_events(&mut ctx).unwrap();
        assert!(!el.loop_alive());
        el.process_events(&mut ctx).unwrap();
        assert_eq!(ctx.fires.len(), 1);
        assert!(el.timers.is_empty());
    }
}
