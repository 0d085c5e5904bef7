//! Block Reader - random-access reads over raw storage sources
//!
//! A source is a disk image, a block device, or an in-memory buffer. Reads
//! are bounded, may land at any offset, and never load the whole source.
//!
//! Transient read errors are retried once after a short backoff. Errors
//! that mean the device went away surface as `SourceUnavailable`; anything
//! else that persists is an `IoFailure` the scanner can skip over.

pub mod cursor;
pub mod devices;

use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use memmap2::Mmap;

use crate::error::{RecoveryError, Result};

pub use cursor::Cursor;
pub use devices::{list_devices, DeviceKind, SourceDevice};

/// Default backoff before the single retry of a failed read
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Positioned reads over some raw storage
pub trait BlockSource: Send {
    /// Total size in bytes
    fn size(&self) -> u64;

    /// Read up to `buf.len()` bytes at `offset`. Returns 0 at end of source.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: BlockSource + ?Sized> BlockSource for Box<T> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }
}

/// Regular file or block device
pub struct FileSource {
    file: File,
    size: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        // metadata().len() is 0 for block devices
        let size = file.seek(SeekFrom::End(0))?;
        Ok(Self { file, size })
    }
}

impl BlockSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(&self.file, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(&self.file, buf, offset)
    }
}

/// Read-only memory mapping of an image file
pub struct MmapSource {
    map: Mmap,
}

impl MmapSource {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only and the source is never written by us
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { map })
    }
}

impl BlockSource for MmapSource {
    fn size(&self) -> u64 {
        self.map.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        copy_from_slice(&self.map, offset, buf)
    }
}

/// In-memory source, mostly for tests and small buffers
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl BlockSource for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        copy_from_slice(&self.data, offset, buf)
    }
}

fn copy_from_slice(data: &[u8], offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    if offset >= data.len() as u64 {
        return Ok(0);
    }
    let start = offset as usize;
    let n = buf.len().min(data.len() - start);
    buf[..n].copy_from_slice(&data[start..start + n]);
    Ok(n)
}

/// Bounded random-access reader over a [`BlockSource`]
pub struct BlockReader {
    source: Box<dyn BlockSource>,
    path: PathBuf,
    size: u64,
    retry_delay: Duration,
}

impl std::fmt::Debug for BlockReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockReader")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

impl BlockReader {
    /// Open a file or device with positioned reads
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = FileSource::open(path).map_err(|e| unavailable(path, None, e))?;
        Ok(Self::from_source(path, source))
    }

    /// Open an image file through a read-only memory map
    pub fn open_mmap(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path).map_err(|e| unavailable(path, None, e))?;
        if !meta.is_file() || meta.len() == 0 {
            // Devices and empty files can't be mapped portably
            return Self::open(path);
        }
        let source = MmapSource::open(path).map_err(|e| unavailable(path, None, e))?;
        Ok(Self::from_source(path, source))
    }

    pub fn from_source(path: impl Into<PathBuf>, source: impl BlockSource + 'static) -> Self {
        let size = source.size();
        Self {
            source: Box::new(source),
            path: path.into(),
            size,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self::from_source("<memory>", MemorySource::new(data))
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read `len` bytes at `offset`, clamped to the end of the source.
    ///
    /// Reading at or past the end is an `IoFailure`.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.read_into(offset, &mut buf, len)?;
        Ok(buf)
    }

    /// Like [`read_at`](Self::read_at) but reuses `buf`. Returns the number of bytes read.
    pub fn read_into(&self, offset: u64, buf: &mut Vec<u8>, len: usize) -> Result<usize> {
        buf.clear();
        if len == 0 {
            return Ok(0);
        }
        if offset >= self.size {
            return Err(RecoveryError::IoFailure {
                offset,
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("offset beyond source size {}", self.size),
                ),
            });
        }

        let want = (len as u64).min(self.size - offset) as usize;
        buf.resize(want, 0);

        match self.fill(offset, buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(n)
            }
            Err(e) if is_disconnect(&e) => Err(unavailable(&self.path, Some(offset), e)),
            Err(first) => {
                tracing::warn!(offset, error = %first, "Read failed, retrying once");
                std::thread::sleep(self.retry_delay);
                match self.fill(offset, buf) {
                    Ok(n) => {
                        buf.truncate(n);
                        Ok(n)
                    }
                    Err(e) if is_disconnect(&e) => Err(unavailable(&self.path, Some(offset), e)),
                    Err(e) => {
                        buf.clear();
                        Err(RecoveryError::IoFailure { offset, source: e })
                    }
                }
            }
        }
    }

    /// Loop over short reads until `buf` is full or the source ends
    fn fill(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            match self.source.read_at(offset + done as u64, &mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }
}

fn unavailable(path: &Path, offset: Option<u64>, source: io::Error) -> RecoveryError {
    RecoveryError::SourceUnavailable {
        path: path.to_path_buf(),
        offset,
        source,
    }
}

/// Errors meaning the source is gone rather than a bad sector
fn is_disconnect(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    ) {
        return true;
    }
    // ENXIO, ENODEV
    cfg!(unix) && matches!(e.raw_os_error(), Some(6) | Some(19))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    struct Flaky {
        inner: MemorySource,
        failures: Arc<AtomicUsize>,
        kind: io::ErrorKind,
    }

    impl BlockSource for Flaky {
        fn size(&self) -> u64 {
            self.inner.size()
        }

        fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(io::Error::new(self.kind, "flaky"));
            }
            self.inner.read_at(offset, buf)
        }
    }

    fn flaky(failures: usize, kind: io::ErrorKind) -> BlockReader {
        BlockReader::from_source(
            "flaky",
            Flaky {
                inner: MemorySource::new((0..=255u8).collect()),
                failures: Arc::new(AtomicUsize::new(failures)),
                kind,
            },
        )
        .with_retry_delay(Duration::from_millis(1))
    }

    #[test]
    fn test_file_source_reads() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789abcdef").unwrap();
        tmp.flush().unwrap();

        let reader = BlockReader::open(tmp.path()).unwrap();
        assert_eq!(reader.size(), 16);
        assert_eq!(reader.read_at(10, 4).unwrap(), b"abcd");
        assert_eq!(reader.read_at(0, 3).unwrap(), b"012");
    }

    #[test]
    fn test_mmap_matches_file() {
        let mut tmp = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let a = BlockReader::open(tmp.path()).unwrap();
        let b = BlockReader::open_mmap(tmp.path()).unwrap();
        assert_eq!(a.size(), b.size());
        assert_eq!(a.read_at(4321, 777).unwrap(), b.read_at(4321, 777).unwrap());
    }

    #[test]
    fn test_read_clamped_at_end() {
        let reader = BlockReader::from_bytes(vec![7u8; 100]);
        let bytes = reader.read_at(90, 64).unwrap();
        assert_eq!(bytes.len(), 10);
    }

    #[test]
    fn test_read_past_end_is_io_failure() {
        let reader = BlockReader::from_bytes(vec![7u8; 100]);
        let err = reader.read_at(100, 1).unwrap_err();
        assert!(matches!(err, RecoveryError::IoFailure { offset: 100, .. }));
    }

    #[test]
    fn test_open_missing_source() {
        let err = BlockReader::open("/definitely/not/here.img").unwrap_err();
        assert!(matches!(err, RecoveryError::SourceUnavailable { .. }));
    }

    #[test]
    fn test_transient_error_retried_once() {
        let reader = flaky(1, io::ErrorKind::Other);
        assert_eq!(reader.read_at(16, 4).unwrap(), vec![16, 17, 18, 19]);
    }

    #[test]
    fn test_persistent_error_becomes_io_failure() {
        let reader = flaky(2, io::ErrorKind::Other);
        let err = reader.read_at(16, 4).unwrap_err();
        assert!(matches!(err, RecoveryError::IoFailure { offset: 16, .. }));
        // Source recovers afterwards
        assert_eq!(reader.read_at(16, 1).unwrap(), vec![16]);
    }

    #[test]
    fn test_disconnect_is_not_retried() {
        let reader = flaky(1, io::ErrorKind::NotFound);
        let err = reader.read_at(0, 4).unwrap_err();
        assert!(matches!(err, RecoveryError::SourceUnavailable { offset: Some(0), .. }));
    }
}
