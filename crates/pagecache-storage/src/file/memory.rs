//! In-memory channel with fault injection.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use super::channel::ReliableChannel;

/// [`ReliableChannel`] keeping the file content in memory.
///
/// Reads and writes can be made to fail on demand, and the channel counts
/// the operations it served, which makes it convenient for tests and
/// benchmarks.
#[derive(Debug)]
pub struct MemoryChannel {
    path: PathBuf,
    data: RwLock<Vec<u8>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_written: AtomicU64,
    syncs: AtomicU64,
}

impl MemoryChannel {
    /// Creates an empty channel identified by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_content(path, Vec::new())
    }

    /// Creates a channel with the given initial content.
    pub fn with_content(path: impl Into<PathBuf>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            data: RwLock::new(content),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        }
    }

    /// Makes subsequent reads fail (or succeed again).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns a copy of the current content.
    pub fn content(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Number of successful `read_at` calls.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of successful `write_at` calls.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Total bytes written.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Number of `sync` calls.
    pub fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }
}

fn injected(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("injected {op} failure"))
}

impl ReliableChannel for MemoryChannel {
    fn path(&self) -> &Path {
        &self.path
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(injected("read"));
        }
        let data = self.data.read();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(injected("write"));
        }
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
        let end = start + buf.len();
        let mut data = self.data.write();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(buf.len())
    }

    fn sync(&self) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(injected("sync"));
        }
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_past_end() {
        let channel = MemoryChannel::with_content("mem", vec![1, 2, 3]);
        let mut buf = [9u8; 4];
        assert_eq!(channel.read_up_to(&mut buf, 1).unwrap(), 2);
        assert_eq!(&buf[..2], &[2, 3]);
        assert_eq!(channel.read_up_to(&mut buf, 10).unwrap(), 0);
    }

    #[test]
    fn test_write_extends() {
        let channel = MemoryChannel::new("mem");
        channel.write_all_at(&[7, 7], 4).unwrap();
        assert_eq!(channel.content(), vec![0, 0, 0, 0, 7, 7]);
        assert_eq!(channel.writes(), 1);
        assert_eq!(channel.bytes_written(), 2);
    }

    #[test]
    fn test_fault_injection() {
        let channel = MemoryChannel::new("mem");
        channel.set_fail_writes(true);
        assert!(channel.write_all_at(&[1], 0).is_err());
        assert!(channel.sync().is_err());

        channel.set_fail_writes(false);
        channel.write_all_at(&[1], 0).unwrap();

        channel.set_fail_reads(true);
        let mut buf = [0u8; 1];
        assert!(channel.read_up_to(&mut buf, 0).is_err());
    }
}
