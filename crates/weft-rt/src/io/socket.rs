// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Non-blocking TCP socket driven by the worker reactor.
//!
//! Every operation first tries the syscall. On `EAGAIN` it registers the
//! fd with the reactor, arms a timer for the direction's timeout, records
//! the pending cleanup on the calling coroutine, and suspends. Readiness or
//! the timer resumes the coroutine and the syscall is retried.

use std::cell::RefCell;
use std::io;
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::debug;

use crate::co::{Co, CoOp};
use crate::error::{IoFailure, SocketError};
use crate::io::reactor::Interest;
use crate::io::timer::TimerId;
use crate::phase::resume_after_io;
use crate::runtime::Runtime;
use crate::value::Value;

/// What `receive` reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// Up to the next `\n`, without the line terminator.
    Line,
    /// Until the peer closes.
    All,
    /// Exactly this many bytes.
    Bytes(usize),
}

struct SocketInner {
    rt: Weak<Runtime>,
    /// Request the socket was created in.
    owner: u64,
    fd: Option<OwnedFd>,
    buffer: Vec<u8>,
    connect_timeout: Duration,
    send_timeout: Duration,
    read_timeout: Duration,
    /// Operation in progress.
    busy: Option<&'static str>,
    timer: Option<TimerId>,
}

impl SocketInner {
    fn raw_fd(&self) -> Result<RawFd, SocketError> {
        self.fd
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .ok_or_else(|| SocketError::new(IoFailure::Closed))
    }

    /// Drop any reactor registration and timer, then close the fd.
    fn release(&mut self) {
        if let Some(rt) = self.rt.upgrade() {
            if let Some(timer) = self.timer.take() {
                rt.cancel_timer(timer);
            }
            if let Some(fd) = &self.fd {
                let _ = rt.reactor().deregister(fd.as_raw_fd());
            }
        }
        self.timer = None;
        self.fd = None;
        self.buffer.clear();
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Clears the busy flag when an operation ends, however it ends.
struct BusyGuard {
    inner: Rc<RefCell<SocketInner>>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.try_borrow_mut() {
            inner.busy = None;
        }
    }
}

/// A TCP connection owned by one request.
pub struct TcpSocket {
    inner: Rc<RefCell<SocketInner>>,
}

impl TcpSocket {
    /// An unconnected socket with the configured default timeouts.
    pub fn new(co: &Co) -> Result<Self, SocketError> {
        let req = co.request()?;
        let rt = req.runtime();
        let config = rt.config();
        Ok(Self {
            inner: Rc::new(RefCell::new(SocketInner {
                rt: Rc::downgrade(&rt),
                owner: req.id(),
                fd: None,
                buffer: Vec::new(),
                connect_timeout: config.connect_timeout(),
                send_timeout: config.send_timeout(),
                read_timeout: config.read_timeout(),
                busy: None,
                timer: None,
            })),
        })
    }

    /// Wrap an already connected stream.
    pub fn from_fd(co: &Co, fd: OwnedFd) -> Result<Self, SocketError> {
        set_nonblocking(fd.as_raw_fd()).map_err(|e| SocketError::new(IoFailure::from_io(&e)))?;
        let sock = Self::new(co)?;
        sock.inner.borrow_mut().fd = Some(fd);
        Ok(sock)
    }

    /// Set the connect, send, and read timeouts at once.
    pub fn settimeout(&self, ms: u64) {
        let t = Duration::from_millis(ms);
        self.settimeouts(t, t, t);
    }

    pub fn settimeouts(&self, connect: Duration, send: Duration, read: Duration) {
        let mut inner = self.inner.borrow_mut();
        inner.connect_timeout = connect;
        inner.send_timeout = send;
        inner.read_timeout = read;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().fd.is_some()
    }

    pub fn close(&self) -> Result<(), SocketError> {
        let mut inner = self.inner.borrow_mut();
        if inner.fd.is_none() {
            return Err(SocketError::new(IoFailure::Closed));
        }
        inner.release();
        Ok(())
    }

    pub async fn connect(&self, co: &Co, host: &str, port: u16) -> Result<(), SocketError> {
        let _busy = self.begin(co, "connect")?;
        self.inner.borrow_mut().release();

        let addr = resolve(host, port)?;
        let fd = open_socket(&addr).map_err(|e| SocketError::new(IoFailure::from_io(&e)))?;
        let raw = fd.as_raw_fd();
        self.inner.borrow_mut().fd = Some(fd);

        let (storage, len) = socket_addr_to_raw(&addr);
        let ret = unsafe {
            libc::connect(
                raw,
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            self.inner.borrow_mut().release();
            return Err(SocketError::new(IoFailure::from_io(&err)));
        }

        let timeout = self.inner.borrow().connect_timeout;
        debug!("co {} connecting to {addr}", co.id());
        if !self.wait_ready(co, Interest::Writable, timeout).await? {
            self.inner.borrow_mut().release();
            return Err(SocketError::new(IoFailure::Timeout));
        }
        match take_socket_error(raw) {
            Ok(0) => Ok(()),
            Ok(code) => {
                self.inner.borrow_mut().release();
                let err = io::Error::from_raw_os_error(code);
                Err(SocketError::new(IoFailure::from_io(&err)))
            }
            Err(err) => {
                self.inner.borrow_mut().release();
                Err(SocketError::new(IoFailure::from_io(&err)))
            }
        }
    }

    /// Send all of `data`. Returns the byte count.
    pub async fn send(&self, co: &Co, data: &[u8]) -> Result<usize, SocketError> {
        let _busy = self.begin(co, "send")?;
        let mut sent = 0;
        while sent < data.len() {
            let fd = self.inner.borrow().raw_fd()?;
            let rest = &data[sent..];
            let n = unsafe {
                libc::send(
                    fd,
                    rest.as_ptr() as *const libc::c_void,
                    rest.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if n > 0 {
                sent += n as usize;
                continue;
            }
            if n == 0 {
                return Err(SocketError::new(IoFailure::PartialWrite));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    let timeout = self.inner.borrow().send_timeout;
                    if !self.wait_ready(co, Interest::Writable, timeout).await? {
                        return Err(SocketError::new(IoFailure::Timeout));
                    }
                }
                _ => return Err(SocketError::new(IoFailure::from_io(&err))),
            }
        }
        Ok(sent)
    }

    /// Read according to `pattern`. Data read before a failure is kept in
    /// the error's `partial`.
    pub async fn receive(&self, co: &Co, pattern: Pattern) -> Result<Vec<u8>, SocketError> {
        if pattern == Pattern::Bytes(0) {
            self.inner.borrow().raw_fd()?;
            return Ok(Vec::new());
        }
        let _busy = self.begin(co, "read")?;
        loop {
            if let Some(data) = self.take_buffered(pattern)? {
                return Ok(data);
            }
            match self.fill()? {
                Fill::Data => continue,
                Fill::Eof => return self.finish_at_eof(pattern),
                Fill::WouldBlock => {}
            }
            let timeout = self.inner.borrow().read_timeout;
            if !self.wait_ready(co, Interest::Readable, timeout).await? {
                let partial = mem::take(&mut self.inner.borrow_mut().buffer);
                return Err(SocketError::with_partial(IoFailure::Timeout, partial));
            }
        }
    }

    fn begin(&self, co: &Co, op: &'static str) -> Result<BusyGuard, SocketError> {
        let req = co.check_yieldable()?;
        let mut inner = self.inner.borrow_mut();
        if inner.owner != req.id() {
            return Err(SocketError::new(IoFailure::Other("bad request".into())));
        }
        if let Some(current) = inner.busy {
            return Err(SocketError::new(IoFailure::Busy(current)));
        }
        inner.busy = Some(op);
        Ok(BusyGuard {
            inner: self.inner.clone(),
        })
    }

    fn take_buffered(&self, pattern: Pattern) -> Result<Option<Vec<u8>>, SocketError> {
        let mut inner = self.inner.borrow_mut();
        match pattern {
            Pattern::Line => {
                if let Some(pos) = inner.buffer.iter().position(|b| *b == b'\n') {
                    let mut line: Vec<u8> = inner.buffer.drain(..=pos).collect();
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return Ok(Some(line));
                }
                let limit = inner
                    .rt
                    .upgrade()
                    .map_or(usize::MAX, |rt| rt.config().socket_buffer_size);
                if inner.buffer.len() >= limit {
                    let partial = mem::take(&mut inner.buffer);
                    return Err(SocketError::with_partial(IoFailure::BufferTooSmall, partial));
                }
                Ok(None)
            }
            Pattern::Bytes(n) if inner.buffer.len() >= n => {
                Ok(Some(inner.buffer.drain(..n).collect()))
            }
            Pattern::Bytes(_) | Pattern::All => Ok(None),
        }
    }

    fn fill(&self) -> Result<Fill, SocketError> {
        let mut inner = self.inner.borrow_mut();
        let fd = inner.raw_fd()?;
        let mut chunk = [0u8; 4096];
        loop {
            let n = unsafe {
                libc::recv(
                    fd,
                    chunk.as_mut_ptr() as *mut libc::c_void,
                    chunk.len(),
                    0,
                )
            };
            if n > 0 {
                inner.buffer.extend_from_slice(&chunk[..n as usize]);
                return Ok(Fill::Data);
            }
            if n == 0 {
                return Ok(Fill::Eof);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(Fill::WouldBlock),
                _ => {
                    let partial = mem::take(&mut inner.buffer);
                    return Err(SocketError::with_partial(IoFailure::from_io(&err), partial));
                }
            }
        }
    }

    fn finish_at_eof(&self, pattern: Pattern) -> Result<Vec<u8>, SocketError> {
        let data = mem::take(&mut self.inner.borrow_mut().buffer);
        match pattern {
            Pattern::All => Ok(data),
            Pattern::Line | Pattern::Bytes(_) => {
                Err(SocketError::with_partial(IoFailure::Closed, data))
            }
        }
    }

    /// Suspend `co` until the fd is ready or `timeout` passes. Returns
    /// `false` on timeout.
    async fn wait_ready(
        &self,
        co: &Co,
        interest: Interest,
        timeout: Duration,
    ) -> Result<bool, SocketError> {
        self.arm(co, interest, timeout)?;
        let got = co.suspend().await;
        Ok(got.first().map_or(false, Value::is_truthy))
    }

    fn arm(&self, co: &Co, interest: Interest, timeout: Duration) -> Result<(), SocketError> {
        let req = co.check_yieldable()?;
        let rt = req.runtime();
        let id = co.id();
        req.cleanup_pending_operation(id);
        let fd = self.inner.borrow().raw_fd()?;

        let ready_req = req.clone();
        let ready_sock = Rc::downgrade(&self.inner);
        let ready_rt = Rc::downgrade(&rt);
        rt.reactor()
            .register(fd, interest, move || {
                if let (Some(inner), Some(rt)) = (ready_sock.upgrade(), ready_rt.upgrade()) {
                    let timer = inner.borrow_mut().timer.take();
                    if let Some(timer) = timer {
                        rt.cancel_timer(timer);
                    }
                }
                ready_req.clear_pending(id);
                resume_after_io(&ready_req, id, vec![Value::Bool(true)]);
            })
            .map_err(|e| SocketError::new(IoFailure::from_io(&e)))?;

        let timer_req = req.clone();
        let timer_sock = Rc::downgrade(&self.inner);
        let timer_rt = Rc::downgrade(&rt);
        let timer = rt.add_timer(timeout, move || {
            if let (Some(inner), Some(rt)) = (timer_sock.upgrade(), timer_rt.upgrade()) {
                inner.borrow_mut().timer = None;
                let _ = rt.reactor().deregister(fd);
            }
            debug!("socket wait timed out for co {id}");
            timer_req.clear_pending(id);
            resume_after_io(&timer_req, id, vec![Value::Nil, Value::from("timeout")]);
        });
        self.inner.borrow_mut().timer = Some(timer);

        let abort = Rc::downgrade(&self.inner);
        co.set_pending("tcp socket", move || {
            if let Some(inner) = abort.upgrade() {
                inner.borrow_mut().release();
            }
        });
        co.prepare_yield(&req, CoOp::Nop, Vec::new());
        Ok(())
    }
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("TcpSocket")
                .field("fd", &inner.fd)
                .field("busy", &inner.busy)
                .field("buffered", &inner.buffer.len())
                .finish(),
            Err(_) => f.write_str("TcpSocket(<busy>)"),
        }
    }
}

enum Fill {
    Data,
    Eof,
    WouldBlock,
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, SocketError> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| SocketError::new(IoFailure::Resolver(e.to_string())))?;
    addrs.next().ok_or_else(|| {
        SocketError::new(IoFailure::Resolver(format!("{host} could not be resolved")))
    })
}

fn open_socket(addr: &SocketAddr) -> io::Result<OwnedFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: `fd` was just returned by socket(2) and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn take_socket_error(fd: RawFd) -> io::Result<i32> {
    let mut code: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut code as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(code)
}

fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // Safety: an all-zero sockaddr_storage is a valid value.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*a.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            // Safety: sockaddr_storage is large enough and suitably aligned.
            unsafe {
                std::ptr::write(
                    &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in,
                    sin,
                )
            };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            // Safety: as above.
            unsafe {
                std::ptr::write(
                    &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6,
                    sin6,
                )
            };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_v4_address_round_trips_port() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let (storage, len) = socket_addr_to_raw(&addr);
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in>());
        let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
        assert_eq!(u16::from_be(sin.sin_port), 8080);
        assert_eq!(u32::from_be(sin.sin_addr.s_addr), 0x7f00_0001);
    }

    #[test]
    fn resolve_literal_address() {
        let addr = resolve("127.0.0.1", 80).unwrap();
        assert_eq!(addr.port(), 80);
    }
}
