//! One pollable descriptor per connection.
//!
//! The epoll set watches three level-triggered sources: the connection
//! manager channel, the completion channel and an eventfd whose counter holds
//! the number of received bytes not yet read. Callers may wait on
//! [`Notifier::as_raw_fd`] with their own poll loop.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::utils::timeout_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Received bytes are waiting in the sink.
    Buffer = 1 << 0,
    /// The completion channel has an event.
    Completion = 1 << 1,
    /// The connection manager channel has an event.
    Cm = 1 << 2,
}

impl Source {
    fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            t if t == Source::Buffer as u64 => Some(Source::Buffer),
            t if t == Source::Completion as u64 => Some(Source::Completion),
            t if t == Source::Cm as u64 => Some(Source::Cm),
            _ => None,
        }
    }
}

/// Sources found ready by one check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSet(u8);

impl EventSet {
    pub fn contains(&self, source: Source) -> bool {
        self.0 & source as u8 != 0
    }

    pub fn insert(&mut self, source: Source) {
        self.0 |= source as u8;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Non-blocking eventfd used as a counter.
#[derive(Debug)]
pub struct EventFd(OwnedFd);

impl EventFd {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::last_os("eventfd"));
        }
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// Adds `n` to the counter, making the descriptor readable.
    pub fn add(&self, n: u64) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let ret = unsafe {
            libc::write(
                self.0.as_raw_fd(),
                &n as *const u64 as *const libc::c_void,
                core::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            return Err(Error::last_os("eventfd write"));
        }
        Ok(())
    }

    /// Returns the counter and resets it to zero.
    pub fn take(&self) -> Result<u64> {
        let mut n = 0u64;
        let ret = unsafe {
            libc::read(
                self.0.as_raw_fd(),
                &mut n as *mut u64 as *mut libc::c_void,
                core::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(Error::device("eventfd read", err));
        }
        Ok(n)
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

#[derive(Debug)]
pub struct Notifier {
    epoll: OwnedFd,
    available: EventFd,
}

impl Notifier {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(Error::last_os("epoll_create1"));
        }
        let notifier = Self {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            available: EventFd::new()?,
        };
        notifier.register(Source::Buffer, notifier.available.as_raw_fd())?;
        Ok(notifier)
    }

    /// Watches `fd` for readability on behalf of `source`.
    pub fn register(&self, source: Source, fd: RawFd) -> Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: source as u64,
        };
        let ret =
            unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) };
        if ret < 0 {
            return Err(Error::last_os("epoll_ctl"));
        }
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                core::ptr::null_mut(),
            )
        };
        if ret < 0 {
            return Err(Error::last_os("epoll_ctl"));
        }
        Ok(())
    }

    /// Sources ready right now.
    #[cfg(test)]
    pub fn check(&self) -> Result<EventSet> {
        self.wait(Some(Duration::ZERO))
    }

    /// Blocks until a source is ready or `timeout` passes.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<EventSet> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 3];
        let n = loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.len() as i32,
                    timeout_millis(timeout),
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::device("epoll_wait", err));
            }
        };
        let mut set = EventSet::default();
        for event in &events[..n] {
            let tag = event.u64;
            if let Some(source) = Source::from_tag(tag) {
                set.insert(source);
            }
        }
        Ok(set)
    }

    /// Signals `n` more received bytes.
    pub fn add_available(&self, n: u64) -> Result<()> {
        self.available.add(n)
    }

    /// Takes every signaled byte count; re-add what is left unread.
    pub fn take_available(&self) -> Result<u64> {
        self.available.take()
    }
}

impl AsRawFd for Notifier {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_bytes_are_level_triggered() {
        let notifier = Notifier::new().unwrap();
        assert!(notifier.check().unwrap().is_empty());
        notifier.add_available(10).unwrap();
        notifier.add_available(5).unwrap();
        assert!(notifier.check().unwrap().contains(Source::Buffer));
        assert!(notifier.check().unwrap().contains(Source::Buffer));
        assert_eq!(15, notifier.take_available().unwrap());
        assert!(notifier.check().unwrap().is_empty());
        assert_eq!(0, notifier.take_available().unwrap());
    }

    #[test]
    fn merges_registered_sources() {
        let notifier = Notifier::new().unwrap();
        let completion = EventFd::new().unwrap();
        let cm = EventFd::new().unwrap();
        notifier
            .register(Source::Completion, completion.as_raw_fd())
            .unwrap();
        notifier.register(Source::Cm, cm.as_raw_fd()).unwrap();
        cm.add(1).unwrap();
        let set = notifier.wait(Some(Duration::from_millis(100))).unwrap();
        assert!(set.contains(Source::Cm));
        assert!(!set.contains(Source::Completion));
        completion.add(1).unwrap();
        notifier.add_available(1).unwrap();
        let set = notifier.check().unwrap();
        assert!(set.contains(Source::Cm));
        assert!(set.contains(Source::Completion));
        assert!(set.contains(Source::Buffer));
        notifier.deregister(cm.as_raw_fd()).unwrap();
        assert!(!notifier.check().unwrap().contains(Source::Cm));
    }

    #[test]
    fn wait_times_out_empty() {
        let notifier = Notifier::new().unwrap();
        let set = notifier.wait(Some(Duration::from_millis(10))).unwrap();
        assert!(set.is_empty());
    }
}
