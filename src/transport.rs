//! Byte-stream transports
//!
//! The engine only needs a duplex byte stream it can poll for readability.
//! [`Transport`] is implemented for `TcpStream` (polled with `poll(2)`) and
//! for an in-process pipe ([`memory_pair`]) used by tests and benchmarks.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Duplex byte stream under a TLS connection
pub trait Transport {
    /// Wait until a read would not block
    ///
    /// Returns false if `timeout` elapsed first. `None` waits forever.
    fn poll_read(&self, timeout: Option<Duration>) -> io::Result<bool>;

    /// Read available bytes; `Ok(0)` is end of stream
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Close both directions
    fn close(&mut self) -> io::Result<()>;
}

/// Wait up to `timeout` for `fd` to become readable
///
/// Timeouts round up to whole milliseconds and the deadline holds across
/// EINTR, so the wait never ends early. `None` waits forever.
pub(crate) fn poll_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    use libc::{poll, pollfd, POLLIN};

    let deadline = timeout.and_then(|d| Instant::now().checked_add(d));
    loop {
        let timeout_ms = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                ((remaining.as_nanos() + 999_999) / 1_000_000).min(i32::MAX as u128) as i32
            }
            None => -1, // infinite
        };

        let mut pfd = pollfd { fd, events: POLLIN, revents: 0 };
        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(result > 0);
    }
}

impl Transport for TcpStream {
    fn poll_read(&self, timeout: Option<Duration>) -> io::Result<bool> {
        poll_readable(self.as_raw_fd(), timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(self)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn poll_read(&self, timeout: Option<Duration>) -> io::Result<bool> {
        (**self).poll_read(timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

#[derive(Default)]
struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

/// One direction of an in-memory connection
#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Pipe {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_all();
    }
}

/// One end of an in-memory duplex stream
pub struct MemoryTransport {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
}

/// Create two connected in-memory transports
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let a_to_b = Arc::new(Pipe::default());
    let b_to_a = Arc::new(Pipe::default());
    (
        MemoryTransport { incoming: b_to_a.clone(), outgoing: a_to_b.clone() },
        MemoryTransport { incoming: a_to_b, outgoing: b_to_a },
    )
}

impl Transport for MemoryTransport {
    fn poll_read(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.incoming.lock();
        loop {
            if !state.buf.is_empty() || state.closed {
                return Ok(true);
            }
            state = match deadline {
                None => self.incoming.readable.wait(state).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    self.incoming
                        .readable
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.incoming.lock();
        while state.buf.is_empty() && !state.closed {
            state = self.incoming.readable.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        let n = buf.len().min(state.buf.len());
        for (dst, src) in buf.iter_mut().zip(state.buf.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.outgoing.lock();
        if state.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.buf.extend(buf);
        drop(state);
        self.outgoing.readable.notify_all();
        Ok(buf.len())
    }

    fn close(&mut self) -> io::Result<()> {
        self.outgoing.close();
        self.incoming.close();
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.outgoing.close();
        self.incoming.close();
    }
}
