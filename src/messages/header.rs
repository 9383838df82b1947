//! Wire packet framing.
//!
//! Demarcates one PostgreSQL packet at the front of a byte buffer. Both
//! header forms are understood: the protocol-3.0 tagged form (one type byte
//! plus a 32-bit length) and the legacy untagged form used by startup,
//! cancel-request and SSL-request packets.

use crate::errors::Error;

/// Tagged header: type byte + 4-byte length.
pub const NEW_HEADER_LEN: usize = 5;
/// Legacy header: 4-byte length + 4-byte code.
pub const OLD_HEADER_LEN: usize = 8;

/// Code of a legacy cancel-request packet.
pub const PKT_CANCEL: u32 = 80877102;
/// Code of a legacy SSL-request packet.
pub const PKT_SSLREQ: u32 = 80877103;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PktType {
    /// Regular tagged packet; payload is the wire tag byte.
    Typed(u8),
    /// Protocol 3.x StartupMessage.
    Startup,
    /// Cancel request.
    Cancel,
    /// SSL negotiation request.
    SslReq,
}

/// One parsed packet header plus a view of whatever payload bytes are
/// already buffered.
#[derive(Debug)]
pub struct PktHdr<'a> {
    pub ptype: PktType,
    /// Total packet length in bytes. For tagged packets the wire length
    /// excludes the tag byte; it is normalized here to include it.
    pub len: usize,
    /// Payload bytes available so far, header stripped. Shorter than
    /// `len - header_len()` while the packet is still streaming in.
    pub data: &'a [u8],
}

impl PktHdr<'_> {
    /// Header bytes this packet form consumes.
    pub fn header_len(&self) -> usize {
        match self.ptype {
            PktType::Typed(_) => NEW_HEADER_LEN,
            _ => OLD_HEADER_LEN,
        }
    }

    /// Whether the whole packet is buffered.
    pub fn complete(&self) -> bool {
        self.header_len() + self.data.len() >= self.len
    }
}

/// Parse the packet header at the front of `buf`.
///
/// Returns `Ok(None)` when too few bytes are buffered to decide, an error
/// for nonsense (unknown legacy code, length below the header, length
/// ≥ 2^31), and otherwise a header whose `data` views the available
/// payload. Never consumes bytes from `buf`.
pub fn get_header(buf: &[u8]) -> Result<Option<PktHdr<'_>>, Error> {
    if buf.len() < NEW_HEADER_LEN {
        return Ok(None);
    }

    let tag = buf[0];
    let (ptype, len, got) = if tag != 0 {
        // Wire length does not include the type byte.
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as u64 + 1;
        (PktType::Typed(tag), len, NEW_HEADER_LEN)
    } else {
        if buf[1] != 0 {
            return Err(Error::Protocol("unknown special packet".into()));
        }
        // Don't tolerate a partial legacy header.
        if buf.len() < OLD_HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
        let code = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ptype = if code == PKT_CANCEL {
            PktType::Cancel
        } else if code == PKT_SSLREQ {
            PktType::SslReq
        } else if (code >> 16) == 3 && (code & 0xFFFF) < 2 {
            PktType::Startup
        } else {
            return Err(Error::Protocol(format!(
                "unknown special packet: len={len} code={code}"
            )));
        };
        (ptype, len, OLD_HEADER_LEN)
    };

    // Don't believe nonsense.
    if len < got as u64 || len >= 0x8000_0000 {
        return Err(Error::Protocol(format!("bogus packet length {len}")));
    }

    let len = len as usize;
    let avail = len.min(buf.len());
    Ok(Some(PktHdr {
        ptype,
        len,
        data: &buf[got..avail],
    }))
}
