//! Ring buffer keeping the last bytes seen on a socket, dumpable to a file
//! when the connection goes bad.

use std::fs::{DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;

use log::warn;

pub const TRACEBUF_SIZE: usize = 4096;

const TRACE_DIR: &str = "/tmp/pg_usher-trace";

/// Fixed-size ring with two cursors: `start` points at the first byte of the
/// last appended chunk (`None` while empty), `end` is the write cursor.
pub struct TraceBuf {
    data: Box<[u8; TRACEBUF_SIZE]>,
    start: Option<usize>,
    end: usize,
}

impl Default for TraceBuf {
    fn default() -> Self {
        TraceBuf::new()
    }
}

impl TraceBuf {
    pub fn new() -> TraceBuf {
        TraceBuf {
            data: Box::new([0u8; TRACEBUF_SIZE]),
            start: None,
            end: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_none()
    }

    /// Record a chunk. Oversized input keeps only its last
    /// `TRACEBUF_SIZE` bytes; the copy wraps in at most two segments.
    pub fn append(&mut self, data: &[u8]) {
        let end_space = TRACEBUF_SIZE - self.end;

        self.start = Some(self.end);

        let src = if data.len() > TRACEBUF_SIZE {
            &data[data.len() - TRACEBUF_SIZE..]
        } else {
            data
        };

        if src.len() <= end_space {
            self.data[self.end..self.end + src.len()].copy_from_slice(src);
            self.end += src.len();
        } else {
            let (head, tail) = src.split_at(end_space);
            self.data[self.end..].copy_from_slice(head);
            self.data[..tail.len()].copy_from_slice(tail);
            self.end = tail.len();
        }
    }

    /// The bytes of the last appended chunk, in append order.
    pub fn last_chunk(&self) -> Vec<u8> {
        let start = match self.start {
            Some(s) => s,
            None => return Vec::new(),
        };
        if start < self.end {
            self.data[start..self.end].to_vec()
        } else {
            let mut out = self.data[start..].to_vec();
            out.extend_from_slice(&self.data[..self.end]);
            out
        }
    }

    /// Write the last chunk into a fresh file under `/tmp/pg_usher-trace/`.
    ///
    /// The directory is created mode 0777 (umask cleared around the mkdir),
    /// the file ends up mode 0666 so any operator can read it. Returns the
    /// path, or `None` when the buffer is empty or the dump failed.
    pub fn dump(&self) -> Option<PathBuf> {
        if self.is_empty() {
            return None;
        }

        let mask = unsafe { libc::umask(0) };
        let res = DirBuilder::new().mode(0o777).create(TRACE_DIR);
        unsafe { libc::umask(mask) };
        if let Err(err) = res {
            if err.kind() != std::io::ErrorKind::AlreadyExists {
                warn!("cannot create {TRACE_DIR}: {err}");
                return None;
            }
        }

        let (path, mut file) = open_temp()?;

        if let Err(err) = file.write_all(&self.last_chunk()) {
            warn!("trace dump write failed: {err}");
            return None;
        }
        if let Err(err) = file.set_permissions(std::fs::Permissions::from_mode(0o666)) {
            warn!("trace dump chmod failed: {err}");
        }
        Some(path)
    }
}

fn open_temp() -> Option<(PathBuf, std::fs::File)> {
    for _ in 0..32 {
        let name: u64 = rand::random();
        let path = PathBuf::from(format!("{TRACE_DIR}/{name:016x}"));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
        {
            Ok(file) => return Some((path, file)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                warn!("cannot create trace dump file: {err}");
                return None;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_has_no_chunk() {
        let trace = TraceBuf::new();
        assert!(trace.is_empty());
        assert!(trace.last_chunk().is_empty());
        assert!(trace.dump().is_none());
    }

    #[test]
    fn short_append_round_trips() {
        let mut trace = TraceBuf::new();
        trace.append(b"hello");
        assert_eq!(trace.last_chunk(), b"hello");
    }

    #[test]
    fn oversized_append_keeps_tail() {
        let mut trace = TraceBuf::new();
        let big: Vec<u8> = (0..TRACEBUF_SIZE + 100).map(|i| (i % 251) as u8).collect();
        trace.append(&big);
        assert_eq!(trace.last_chunk(), &big[100..]);
    }

    #[test]
    fn wrapped_append_keeps_order() {
        let mut trace = TraceBuf::new();
        trace.append(&vec![b'x'; TRACEBUF_SIZE - 10]);
        let chunk: Vec<u8> = (0..100u8).collect();
        trace.append(&chunk);
        assert_eq!(trace.last_chunk(), chunk);
    }

    #[test]
    fn append_exactly_capacity() {
        let mut trace = TraceBuf::new();
        trace.append(b"seed");
        let full: Vec<u8> = (0..TRACEBUF_SIZE).map(|i| (i % 256) as u8).collect();
        trace.append(&full);
        assert_eq!(trace.last_chunk(), full);
    }

    #[test]
    fn dump_writes_last_chunk() {
        let mut trace = TraceBuf::new();
        trace.append(b"dump me");
        let path = trace.dump().expect("dump should succeed");
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data, b"dump me");
        std::fs::remove_file(path).unwrap();
    }
}
