//! File carving module - find deleted files in raw storage by signature.
//!
//! Walks a [`BlockReader`] through a sliding window, matches headers from
//! the [`SignatureCatalog`], and hands each match to the validator to find
//! where the file really ends.
//!
//! # Design
//!
//! - **Lazy**: [`Scanner`] is an iterator; nothing is read until it is polled
//! - **Bounded memory**: one window of source bytes plus the validator's cursor
//! - **First-byte dispatch**: constant-time pre-filter before full header match
//! - **Cooperative cancellation**: checked once per step and before each
//!   candidate is validated, never in the middle of one
//! - **Sector alignment**: optional stride (e.g. 512) for true disk images

pub mod signatures;
pub mod structure;
pub mod validate;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, RecoveryError, Result};
use crate::reader::BlockReader;
use signatures::{Signature, SignatureCatalog};
use validate::{validate, Confidence, ValidatedExtent, ValidationError};

/// Default read window for the scanner (1 MiB)
pub const DEFAULT_WINDOW_SIZE: usize = 1024 * 1024;

/// Granularity of unreadable regions skipped after a failed read
pub const BAD_BLOCK_SIZE: u64 = 4096;

/// Byte range of a potential file in the source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateExtent {
    pub type_id: String,
    /// First byte of the file
    pub start: u64,
    /// One past the last byte
    pub end: u64,
    pub confidence: Confidence,
}

impl CandidateExtent {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn overlaps(&self, other: &CandidateExtent) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A header match that did not become a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Matched signature, absent for unreadable blocks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_id: Option<String>,
    pub offset: u64,
    pub kind: ErrorKind,
    pub message: String,
}

/// One item of scanner output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStep {
    /// Validated extent, ready to be written
    Candidate(ValidatedExtent),
    /// Match (or unreadable block) that was skipped
    Rejected(Rejection),
    /// Everything before `offset` has been examined
    Progress { offset: u64 },
}

/// Options for a scan
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Offset to begin scanning at
    pub start_offset: u64,
    /// Distance between examined offsets; 512 for sector-aligned carving
    pub stride: u64,
    /// Bytes read per window refill
    pub window_size: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            start_offset: 0,
            stride: 1,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

impl ScanOptions {
    pub fn sector_aligned() -> Self {
        Self {
            stride: 512,
            ..Self::default()
        }
    }
}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lazy, finite sequence of scan steps over one source.
///
/// An `Err` item is fatal (source gone) and ends the sequence. To resume
/// elsewhere, start a fresh scan with a different `start_offset`.
pub struct Scanner<'a> {
    reader: &'a BlockReader,
    catalog: &'a SignatureCatalog,
    cancel: CancelToken,
    stride: u64,
    origin: u64,
    window_size: usize,
    header_len: usize,

    offset: u64,
    window: Vec<u8>,
    window_start: u64,
    /// Window ends at end of source or at an unreadable block
    window_closed: bool,
    last_progress: u64,
    pending: VecDeque<ScanStep>,
    finished: bool,
    cancelled: bool,
}

/// Start scanning `reader` for anything in `catalog`
pub fn scan<'a>(
    reader: &'a BlockReader,
    catalog: &'a SignatureCatalog,
    options: &ScanOptions,
    cancel: CancelToken,
) -> Scanner<'a> {
    Scanner::new(reader, catalog, options, cancel)
}

impl<'a> Scanner<'a> {
    pub fn new(
        reader: &'a BlockReader,
        catalog: &'a SignatureCatalog,
        options: &ScanOptions,
        cancel: CancelToken,
    ) -> Self {
        let header_len = catalog.max_header_len().max(1);
        let window_size = options
            .window_size
            .max(2 * header_len)
            .max(BAD_BLOCK_SIZE as usize);
        let offset = options.start_offset.min(reader.size());
        Self {
            reader,
            catalog,
            cancel,
            stride: options.stride.max(1),
            origin: offset,
            window_size,
            header_len,
            offset,
            window: Vec::new(),
            window_start: offset,
            window_closed: false,
            last_progress: offset,
            pending: VecDeque::new(),
            finished: false,
            cancelled: false,
        }
    }

    pub fn reader(&self) -> &'a BlockReader {
        self.reader
    }

    /// Next offset to be examined
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Round `pos` up onto the stride grid, never past the end of source
    fn align_up(&self, pos: u64) -> u64 {
        let rel = pos.saturating_sub(self.origin);
        let aligned = self.origin + rel.div_ceil(self.stride) * self.stride;
        aligned.min(self.reader.size())
    }

    fn progress(&mut self, offset: u64) {
        if offset > self.last_progress {
            self.last_progress = offset;
            self.pending.push_back(ScanStep::Progress { offset });
        }
    }

    fn window_end(&self) -> u64 {
        self.window_start + self.window.len() as u64
    }

    fn step(&mut self) -> Result<()> {
        let size = self.reader.size();
        if self.offset >= size || self.catalog.is_empty() {
            self.offset = size;
            self.progress(size);
            self.finished = true;
            return Ok(());
        }

        let needs_refill = self.offset < self.window_start
            || self.window.is_empty()
            || if self.window_closed {
                self.offset >= self.window_end()
            } else {
                self.offset + self.header_len as u64 > self.window_end()
            };
        if needs_refill {
            return self.refill();
        }

        let scan_end = if self.window_closed {
            self.window_end()
        } else {
            self.window_end() - self.header_len as u64 + 1
        };

        let catalog = self.catalog;
        let mut pos = self.offset;
        while pos < scan_end {
            let at = (pos - self.window_start) as usize;
            if catalog.could_match(self.window[at]) {
                let head_end = (at + self.header_len).min(self.window.len());
                let matches = catalog.matches(&self.window[at..head_end]);
                if !matches.is_empty() {
                    self.offset = pos;
                    return self.examine(pos, matches);
                }
            }
            pos += self.stride;
        }
        self.offset = pos.min(size);
        Ok(())
    }

    /// Read the next window at the current offset. A persistent read error
    /// on the first block rejects that block and skips past it.
    fn refill(&mut self) -> Result<()> {
        let size = self.reader.size();
        let offset = self.offset;
        self.window_start = offset;
        self.window_closed = false;

        match self.reader.read_into(offset, &mut self.window, self.window_size) {
            Ok(_) => {}
            Err(RecoveryError::IoFailure { .. }) => self.salvage(offset)?,
            Err(e) => return Err(e),
        }

        if self.window_end() >= size {
            self.window_closed = true;
        }

        if self.window.is_empty() {
            let next = self.align_up((offset / BAD_BLOCK_SIZE + 1) * BAD_BLOCK_SIZE);
            tracing::warn!(offset, next, "Skipping unreadable block");
            self.pending.push_back(ScanStep::Rejected(Rejection {
                type_id: None,
                offset,
                kind: ErrorKind::IoFailure,
                message: format!("unreadable block at {offset:#x}"),
            }));
            self.offset = next.max(offset + 1).min(size);
            self.window_start = self.offset;
            self.progress(self.offset);
            return Ok(());
        }

        self.progress(offset);
        Ok(())
    }

    /// Re-read block by block after a failed window read, keeping the
    /// readable prefix
    fn salvage(&mut self, offset: u64) -> Result<()> {
        let size = self.reader.size();
        let limit = (offset + self.window_size as u64).min(size);
        let mut buf = Vec::new();
        let mut pos = offset;
        self.window.clear();

        while pos < limit {
            let block_end = ((pos / BAD_BLOCK_SIZE + 1) * BAD_BLOCK_SIZE).min(limit);
            match self.reader.read_into(pos, &mut buf, (block_end - pos) as usize) {
                Ok(_) => {
                    self.window.extend_from_slice(&buf);
                    pos = block_end;
                }
                Err(RecoveryError::IoFailure { .. }) => {
                    self.window_closed = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Try each matching signature at `pos`; the first that validates wins.
    ///
    /// Matches whose header fails the plausibility check are dropped
    /// silently. If none was plausible the offset is treated as a plain
    /// non-match and the scan moves one stride on.
    fn examine(&mut self, pos: u64, matches: Vec<&'a Signature>) -> Result<()> {
        let mut rejection: Option<Rejection> = None;
        let mut plausible = None;

        for sig in matches {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            match validate(self.reader, pos, sig) {
                Ok(found) => {
                    if !found.warnings.is_empty() {
                        tracing::warn!(
                            offset = pos,
                            type_id = %sig.id,
                            warnings = ?found.warnings,
                            "Accepted with warnings"
                        );
                    }
                    self.offset = self.align_up(found.extent.end);
                    self.pending.push_back(ScanStep::Candidate(found));
                    return Ok(());
                }
                Err(ValidationError::Read(e)) if e.is_fatal() => return Err(e),
                Err(e) if !e.is_rejection() => {
                    tracing::trace!(offset = pos, type_id = %sig.id, error = %e, "Implausible header");
                }
                Err(e) => {
                    plausible = plausible.or(Some(sig.header.len() as u64));
                    tracing::debug!(offset = pos, type_id = %sig.id, error = %e, "Rejected candidate");
                    rejection.get_or_insert_with(|| Rejection {
                        type_id: Some(sig.id.clone()),
                        offset: pos,
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        }

        if let Some(r) = rejection {
            self.pending.push_back(ScanStep::Rejected(r));
        }
        let size = self.reader.size();
        self.offset = match plausible {
            Some(header) => self.align_up(pos + header).max(pos + 1).min(size),
            None => (pos + self.stride).min(size),
        };
        Ok(())
    }
}

impl Iterator for Scanner<'_> {
    type Item = Result<ScanStep>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(step) = self.pending.pop_front() {
                return Some(Ok(step));
            }
            if self.finished {
                return None;
            }
            if self.cancel.is_cancelled() {
                self.cancelled = true;
                self.finished = true;
                return None;
            }
            if let Err(e) = self.step() {
                self.finished = true;
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{BlockSource, MemorySource};
    use std::io;

    fn jpeg(body: usize) -> Vec<u8> {
        let mut v = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        v.extend_from_slice(b"JFIF\0\x01\x01\0\0\x01\0\x01\0\0");
        v.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00]);
        v.extend((0..body).map(|i| (i % 200) as u8));
        v.extend_from_slice(&[0xFF, 0xD9]);
        v
    }

    fn filler(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn candidates(reader: &BlockReader, options: &ScanOptions) -> Vec<ValidatedExtent> {
        let catalog = SignatureCatalog::builtin();
        scan(reader, &catalog, options, CancelToken::new())
            .filter_map(|s| match s.unwrap() {
                ScanStep::Candidate(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn scenario_1_finds_embedded_files_across_windows() {
        let mut data = filler(300_000);
        let a = jpeg(1000);
        let b = jpeg(70_000);
        data[100..100 + a.len()].copy_from_slice(&a);
        data[150_000..150_000 + b.len()].copy_from_slice(&b);
        let reader = BlockReader::from_bytes(data);

        let options = ScanOptions {
            window_size: 8192,
            ..Default::default()
        };
        let found = candidates(&reader, &options);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].extent.start, 100);
        assert_eq!(found[0].extent.end, 100 + a.len() as u64);
        assert_eq!(found[1].extent.start, 150_000);
        assert_eq!(found[1].extent.len(), b.len() as u64);
    }

    #[test]
    fn scenario_2_header_straddling_window_edge() {
        let mut data = filler(20_000);
        let a = jpeg(100);
        let at = 4096 - 2;
        data[at..at + a.len()].copy_from_slice(&a);
        let reader = BlockReader::from_bytes(data);
        let options = ScanOptions {
            window_size: 4096,
            ..Default::default()
        };
        let found = candidates(&reader, &options);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].extent.start, at as u64);
    }

    #[test]
    fn scenario_3_rejection_does_not_halt_scan() {
        let mut data = filler(50_000);
        let a = jpeg(500);
        data[1000..1000 + a.len()].copy_from_slice(&a);
        // header-only JPEG with no footer after it
        data[30_000..30_006].copy_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x04]);
        let reader = BlockReader::from_bytes(data);
        let catalog = SignatureCatalog::builtin();

        let steps: Vec<_> = scan(&reader, &catalog, &ScanOptions::default(), CancelToken::new())
            .map(|s| s.unwrap())
            .collect();
        let rejected: Vec<_> = steps
            .iter()
            .filter_map(|s| match s {
                ScanStep::Rejected(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].offset, 30_000);
        assert_eq!(rejected[0].type_id.as_deref(), Some("jpeg"));
        assert!(steps
            .iter()
            .any(|s| matches!(s, ScanStep::Candidate(v) if v.extent.start == 1000)));
    }

    #[test]
    fn scenario_4_progress_is_strictly_increasing() {
        let data = filler(100_000);
        let reader = BlockReader::from_bytes(data);
        let catalog = SignatureCatalog::builtin();
        let options = ScanOptions {
            window_size: 4096,
            ..Default::default()
        };
        let offsets: Vec<u64> = scan(&reader, &catalog, &options, CancelToken::new())
            .filter_map(|s| match s.unwrap() {
                ScanStep::Progress { offset } => Some(offset),
                _ => None,
            })
            .collect();
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(offsets.last(), Some(&100_000));
    }

    #[test]
    fn scenario_5_sector_aligned_skips_unaligned_headers() {
        let mut data = filler(8192);
        let a = jpeg(100);
        data[700..700 + a.len()].copy_from_slice(&a);
        let b = jpeg(100);
        data[2048..2048 + b.len()].copy_from_slice(&b);
        let reader = BlockReader::from_bytes(data);

        let found = candidates(&reader, &ScanOptions::sector_aligned());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].extent.start, 2048);
    }

    #[test]
    fn scenario_6_cancelled_before_start_yields_nothing() {
        let mut data = filler(10_000);
        let a = jpeg(100);
        data[0..a.len()].copy_from_slice(&a);
        let reader = BlockReader::from_bytes(data);
        let catalog = SignatureCatalog::builtin();
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut scanner = scan(&reader, &catalog, &ScanOptions::default(), cancel);
        assert!(scanner.next().is_none());
        assert!(scanner.was_cancelled());
    }

    #[test]
    fn scenario_7_start_offset_resumes_mid_source() {
        let mut data = filler(30_000);
        let a = jpeg(100);
        data[1000..1000 + a.len()].copy_from_slice(&a);
        data[20_000..20_000 + a.len()].copy_from_slice(&a);
        let reader = BlockReader::from_bytes(data);
        let options = ScanOptions {
            start_offset: 5000,
            ..Default::default()
        };
        let found = candidates(&reader, &options);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].extent.start, 20_000);
    }

    struct BadBlock {
        inner: MemorySource,
        bad: std::ops::Range<u64>,
    }

    impl BlockSource for BadBlock {
        fn size(&self) -> u64 {
            self.inner.size()
        }

        fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
            let end = offset + buf.len() as u64;
            if offset < self.bad.end && self.bad.start < end {
                return Err(io::Error::new(io::ErrorKind::Other, "media error"));
            }
            self.inner.read_at(offset, buf)
        }
    }

    #[test]
    fn scenario_8_unreadable_block_is_skipped() {
        let mut data = filler(256 * 1024);
        let a = jpeg(100);
        data[100..100 + a.len()].copy_from_slice(&a);
        data[200_000..200_000 + a.len()].copy_from_slice(&a);
        let reader = BlockReader::from_source(
            "bad",
            BadBlock {
                inner: MemorySource::new(data),
                bad: 131_072..135_168,
            },
        )
        .with_retry_delay(std::time::Duration::from_millis(1));
        let catalog = SignatureCatalog::builtin();

        let steps: Vec<_> = scan(&reader, &catalog, &ScanOptions::default(), CancelToken::new())
            .map(|s| s.unwrap())
            .collect();
        let found = steps
            .iter()
            .filter(|s| matches!(s, ScanStep::Candidate(_)))
            .count();
        assert_eq!(found, 2);
        assert!(steps.iter().any(|s| matches!(
            s,
            ScanStep::Rejected(Rejection { kind: ErrorKind::IoFailure, offset: 131_072, .. })
        )));
    }

    #[test]
    fn scenario_9_chance_header_bytes_are_not_rejections() {
        let mut data = filler(40_000);
        // "BM" followed by non-zero reserved fields, as random data would be
        data[2000..2018].copy_from_slice(b"BM\x10\x20\x30\x40\x55\x66\x77\x88\x36\0\0\0\x28\0\0\0");
        // "BM" one byte before a real file
        let a = jpeg(300);
        data[9998..10_000].copy_from_slice(b"BM");
        data[10_000..10_000 + a.len()].copy_from_slice(&a);
        // "BM" too close to the end to carry a header
        let end = data.len();
        data[end - 4..end - 2].copy_from_slice(b"BM");
        let reader = BlockReader::from_bytes(data);
        let catalog = SignatureCatalog::builtin();

        let steps: Vec<_> = scan(&reader, &catalog, &ScanOptions::default(), CancelToken::new())
            .map(|s| s.unwrap())
            .collect();
        assert!(!steps.iter().any(|s| matches!(s, ScanStep::Rejected(_))));
        let found: Vec<_> = steps
            .iter()
            .filter_map(|s| match s {
                ScanStep::Candidate(v) => Some(v.extent.start),
                _ => None,
            })
            .collect();
        assert_eq!(found, vec![10_000]);
    }

    #[test]
    fn test_extent_overlap() {
        let e = |start, end| CandidateExtent {
            type_id: "x".into(),
            start,
            end,
            confidence: Confidence::HeaderFooter,
        };
        assert!(e(0, 10).overlaps(&e(5, 15)));
        assert!(!e(0, 10).overlaps(&e(10, 20)));
        assert_eq!(e(3, 10).len(), 7);
    }
}
