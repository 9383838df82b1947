//! Socket buffer handle.
//!
//! The engine never touches real sockets: each `PgSocket` owns an `SBuf`,
//! a send queue plus pause/close flags. The I/O driver pumps queued bytes
//! to the wire and stops feeding inbound data while the buffer is paused,
//! which keeps every engine operation synchronous and deterministic.

use bytes::BytesMut;

use crate::errors::Error;

#[derive(Debug, Default)]
pub struct SBuf {
    sendq: BytesMut,
    paused: bool,
    closed: bool,
}

impl SBuf {
    pub fn new() -> SBuf {
        SBuf::default()
    }

    /// Queue bytes for delivery. Fails once the buffer is closed.
    pub fn queue(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Socket("send on closed socket".into()));
        }
        self.sendq.extend_from_slice(data);
        Ok(())
    }

    /// Whether everything queued has been handed to the driver.
    pub fn is_empty(&self) -> bool {
        self.sendq.is_empty()
    }

    /// Stop inbound delivery. Only succeeds once the send queue has
    /// drained; a buffer with bytes in flight cannot be parked safely.
    pub fn pause(&mut self) -> bool {
        if !self.sendq.is_empty() {
            return false;
        }
        self.paused = true;
        true
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Hand the queued bytes to the driver, leaving the queue empty.
    pub fn take_output(&mut self) -> BytesMut {
        self.sendq.split()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_then_take_round_trips() {
        let mut sbuf = SBuf::new();
        sbuf.queue(b"abc").unwrap();
        sbuf.queue(b"def").unwrap();
        assert_eq!(&sbuf.take_output()[..], b"abcdef");
        assert!(sbuf.is_empty());
    }

    #[test]
    fn pause_requires_drained_queue() {
        let mut sbuf = SBuf::new();
        sbuf.queue(b"x").unwrap();
        assert!(!sbuf.pause());
        sbuf.take_output();
        assert!(sbuf.pause());
        assert!(sbuf.is_paused());
        sbuf.resume();
        assert!(!sbuf.is_paused());
    }

    #[test]
    fn closed_buffer_rejects_writes() {
        let mut sbuf = SBuf::new();
        sbuf.close();
        assert!(sbuf.queue(b"x").is_err());
    }
}
