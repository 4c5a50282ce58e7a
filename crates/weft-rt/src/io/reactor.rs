// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reactor: epoll-based readiness notification for the worker thread.
//!
//! Level-triggered epoll, one-shot handlers. A handler runs once when its
//! FD becomes ready and the registration is dropped before it runs, so the
//! handler is free to register again.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

/// I/O interest for reactor registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn to_epoll_events(self) -> u32 {
        match self {
            Interest::Readable => libc::EPOLLIN as u32,
            Interest::Writable => libc::EPOLLOUT as u32,
        }
    }
}

/// What to run when a registered FD becomes ready.
struct Registration {
    handler: Box<dyn FnOnce()>,
}

/// Readiness reactor backed by epoll (Linux).
pub struct Reactor {
    epoll_fd: RawFd,
    /// FD → registration mapping.
    registrations: RefCell<HashMap<RawFd, Registration>>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd,
            registrations: RefCell::new(HashMap::new()),
        })
    }

    /// Register a file descriptor. Replaces any handler already waiting on it.
    pub fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        handler: impl FnOnce() + 'static,
    ) -> io::Result<()> {
        let mut regs = self.registrations.borrow_mut();

        let mut ev = libc::epoll_event {
            events: interest.to_epoll_events(),
            u64: fd as u64,
        };

        let op = if regs.contains_key(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };

        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let replaced = regs.insert(
            fd,
            Registration {
                handler: Box::new(handler),
            },
        );
        drop(regs);
        drop(replaced);
        Ok(())
    }

    /// Remove a file descriptor. Its handler is dropped without running.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let removed = self.registrations.borrow_mut().remove(&fd);
        if removed.is_some() {
            self.epoll_del(fd)?;
        }
        Ok(())
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registrations.borrow().contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.registrations.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn epoll_del(&self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // ENOENT / EBADF are expected if FD was already closed.
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF)
            {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Run one poll cycle.
    ///
    /// Blocks up to `timeout_ms` waiting for events, then runs the handlers
    /// of ready FDs. Returns the number of handlers run.
    pub fn poll_once(&self, timeout_ms: i32) -> io::Result<usize> {
        const MAX_EVENTS: usize = 64;
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let n = unsafe {
            libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0); // EINTR: retry next cycle.
            }
            return Err(err);
        }

        // Collect handlers under the borrow, run them after releasing it.
        // Handlers re-enter the scheduler, which registers again.
        let mut ready = Vec::new();
        {
            let mut regs = self.registrations.borrow_mut();
            for ev in events.iter().take(n as usize) {
                let fd = ev.u64 as RawFd;
                if let Some(reg) = regs.remove(&fd) {
                    self.epoll_del(fd)?;
                    ready.push(reg.handler);
                }
            }
        }

        let count = ready.len();
        for handler in ready {
            handler();
        }
        Ok(count)
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let regs = self.registrations.get_mut();
        for &fd in regs.keys() {
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
        regs.clear();
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close(fds: &[RawFd]) {
        for &fd in fds {
            unsafe { libc::close(fd) };
        }
    }

    #[test]
    fn reactor_pipe_readiness() {
        let reactor = Reactor::new().unwrap();
        let (read_fd, write_fd) = pipe();

        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        reactor
            .register(read_fd, Interest::Readable, move || f.set(f.get() + 1))
            .unwrap();

        // Write something to make the read end readable.
        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }

        assert_eq!(reactor.poll_once(100).unwrap(), 1);
        assert_eq!(fired.get(), 1);
        assert!(!reactor.is_registered(read_fd));

        // One-shot: still readable, but nothing is registered anymore.
        assert_eq!(reactor.poll_once(10).unwrap(), 0);
        assert_eq!(fired.get(), 1);

        close(&[read_fd, write_fd]);
    }

    #[test]
    fn reactor_timeout_no_events() {
        let reactor = Reactor::new().unwrap();
        // Poll with short timeout, no FDs registered.
        assert_eq!(reactor.poll_once(1).unwrap(), 0);
        assert!(reactor.is_empty());
    }

    #[test]
    fn deregister_drops_handler() {
        let reactor = Reactor::new().unwrap();
        let (read_fd, write_fd) = pipe();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        reactor
            .register(read_fd, Interest::Readable, move || f.set(true))
            .unwrap();
        reactor.deregister(read_fd).unwrap();
        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }
        assert_eq!(reactor.poll_once(10).unwrap(), 0);
        assert!(!fired.get());
        close(&[read_fd, write_fd]);
    }

    #[test]
    fn handler_may_register_again() {
        let reactor = Rc::new(Reactor::new().unwrap());
        let (read_fd, write_fd) = pipe();
        let r = reactor.clone();
        reactor
            .register(read_fd, Interest::Readable, move || {
                r.register(read_fd, Interest::Readable, || {}).unwrap();
            })
            .unwrap();
        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }
        assert_eq!(reactor.poll_once(100).unwrap(), 1);
        assert!(reactor.is_registered(read_fd));
        reactor.deregister(read_fd).unwrap();
        close(&[read_fd, write_fd]);
    }
}
