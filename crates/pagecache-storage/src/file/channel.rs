//! The channel trait.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Positional read/write access to the bytes of one file.
///
/// All operations are position-based (pread/pwrite style) so a channel can
/// be shared by many threads without a seek cursor. Writing the same bytes
/// at the same offset twice must be harmless, since a flush may be replayed.
pub trait ReliableChannel: Send + Sync + fmt::Debug {
    /// Returns the file path.
    fn path(&self) -> &Path;

    /// Returns the current file size.
    fn size(&self) -> io::Result<u64>;

    /// Reads data from the file at the specified offset.
    ///
    /// Returns the number of bytes read. May return less than the buffer
    /// size, and 0 at EOF.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Fills `buf` from `offset`, stopping early only at EOF.
    ///
    /// Returns the number of bytes read.
    fn read_up_to(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut total_read = 0;
        while total_read < buf.len() {
            match self.read_at(&mut buf[total_read..], offset + total_read as u64) {
                Ok(0) => break,
                Ok(n) => total_read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(total_read)
    }

    /// Writes data to the file at the specified offset.
    ///
    /// Returns the number of bytes written.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Writes all bytes to the file at the specified offset.
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut total_written = 0;
        while total_written < buf.len() {
            match self.write_at(&buf[total_written..], offset + total_written as u64) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!(
                            "short write: expected {} bytes, wrote {total_written}",
                            buf.len()
                        ),
                    ))
                }
                Ok(n) => total_written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Syncs all data and metadata to the device.
    fn sync(&self) -> io::Result<()>;
}

/// A shared channel, so the caller can keep a handle to a channel it hands
/// to a storage.
impl<C: ReliableChannel + ?Sized> ReliableChannel for Arc<C> {
    fn path(&self) -> &Path {
        (**self).path()
    }

    fn size(&self) -> io::Result<u64> {
        (**self).size()
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        (**self).write_at(buf, offset)
    }

    fn sync(&self) -> io::Result<()> {
        (**self).sync()
    }
}
