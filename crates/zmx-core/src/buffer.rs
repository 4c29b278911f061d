//! Reusable byte buffers for non-blocking socket I/O.
//!
//! Both endpoints keep one [`SocketBuffer`] per connection for inbound
//! frames and one [`WriteBuffer`] for outbound bytes. Reads and writes
//! are single non-blocking syscalls per poll wakeup; partial frames and
//! partial writes carry over to the next wakeup.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::ZmxError;
use crate::frame::{self, Tag, HEADER_LEN};

/// Bytes appended per read call.
const READ_CHUNK: usize = 4096;

/// Read side: accumulates raw bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct SocketBuffer {
    buf: Vec<u8>,
    start: usize,
}

impl SocketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// One non-blocking `read` into the tail.
    ///
    /// Returns the byte count; 0 means the peer closed. `WouldBlock`
    /// surfaces as an error for the caller's transient bucket.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        self.compact();
        let filled = self.buf.len();
        self.buf.resize(filled + READ_CHUNK, 0);
        let n = unsafe {
            libc::read(
                fd,
                self.buf[filled..].as_mut_ptr() as *mut libc::c_void,
                READ_CHUNK,
            )
        };
        if n < 0 {
            self.buf.truncate(filled);
            return Err(io::Error::last_os_error());
        }
        self.buf.truncate(filled + n as usize);
        Ok(n as usize)
    }

    /// Pull the next complete frame, if any.
    ///
    /// The payload is a borrowed view; the consumed cursor has already
    /// moved past it, so the next call continues with the following
    /// frame.
    pub fn next(&mut self) -> Result<Option<(Tag, &[u8])>, ZmxError> {
        let header = match frame::decode(&self.buf[self.start..])? {
            Some(h) => h,
            None => return Ok(None),
        };
        let payload_start = self.start + HEADER_LEN;
        let payload_end = payload_start + header.payload_len;
        self.start = payload_end;
        Ok(Some((header.tag, &self.buf[payload_start..payload_end])))
    }

    /// Unparsed byte count.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Drop the consumed prefix once it dominates the buffer, so the
    /// allocation gets reused instead of growing forever.
    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        if self.start >= self.buf.len() {
            self.buf.clear();
            self.start = 0;
        } else if self.buf.len() - self.start <= self.start {
            self.buf.copy_within(self.start.., 0);
            self.buf.truncate(self.buf.len() - self.start);
            self.start = 0;
        }
    }

    #[cfg(test)]
    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

/// Write side: bytes queued for a non-blocking fd.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    buf: Vec<u8>,
    start: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.buf.len()
    }

    /// Queue one frame.
    pub fn push_frame(&mut self, tag: Tag, payload: &[u8]) {
        frame::encode_into(&mut self.buf, tag, payload);
    }

    /// Queue raw bytes (the client's stdout path carries no framing).
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write as much as the fd accepts, compacting the consumed prefix.
    ///
    /// `WouldBlock` is not an error here: the caller polls for
    /// writability while the buffer is non-empty.
    pub fn flush_fd(&mut self, fd: RawFd) -> io::Result<()> {
        while !self.is_empty() {
            let chunk = &self.buf[self.start..];
            let n = unsafe { libc::write(fd, chunk.as_ptr() as *const libc::c_void, chunk.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            self.start += n as usize;
        }
        if self.is_empty() {
            self.buf.clear();
            self.start = 0;
        } else if self.start > self.buf.len() / 2 {
            self.buf.copy_within(self.start.., 0);
            self.buf.truncate(self.buf.len() - self.start);
            self.start = 0;
        }
        Ok(())
    }
}
