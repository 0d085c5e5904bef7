//! Synthetic disk images shared by the integration tests

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::time::Duration;

use deepscan::reader::MemorySource;
use deepscan::{BlockSource, CancelToken, RecoveryEvent, RecoveryReport};

/// Byte ramp that never contains a catalog header
pub fn filler(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Seeded pseudo-random bytes (xorshift64).
///
/// 0xFF is folded to 0xFE, so no JPEG start appears by chance. Every other
/// header can, and `BM` turns up roughly every 64 KiB.
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed | 1;
    let mut out = Vec::with_capacity(len + 8);
    while out.len() < len {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        out.extend(x.to_le_bytes().iter().map(|&b| b.min(0xFE)));
    }
    out.truncate(len);
    out
}

/// BMP header whose declared size is far larger than any test image
pub fn oversized_bmp() -> Vec<u8> {
    let mut v = b"BM".to_vec();
    v.extend_from_slice(&0x0300_0000u32.to_le_bytes());
    v.extend_from_slice(&[0; 4]);
    v.extend_from_slice(&54u32.to_le_bytes());
    v.extend_from_slice(&40u32.to_le_bytes());
    v.extend_from_slice(&[0; 40]);
    v
}

/// Minimal baseline JPEG: SOI, APP0, SOS, entropy data, EOI
pub fn jpeg(body: usize) -> Vec<u8> {
    let mut v = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
    v.extend_from_slice(b"JFIF\0\x01\x01\0\0\x01\0\x01\0\0");
    v.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00]);
    v.extend((0..body).map(|i| (i % 200) as u8));
    v.extend_from_slice(&[0xFF, 0xD9]);
    v
}

/// One stored entry plus central directory. `cd_offset` overrides the
/// offset recorded in the end-of-central-directory record.
pub fn zip(cd_offset: Option<u32>) -> Vec<u8> {
    let name = b"notes.txt";
    let data = b"the quick brown fox jumps over the lazy dog";
    let mut v = Vec::new();
    v.extend_from_slice(&[0x50, 0x4B, 0x03, 0x04, 20, 0, 0, 0, 0, 0]);
    v.extend_from_slice(&[0; 8]); // time, date, crc
    v.extend_from_slice(&(data.len() as u32).to_le_bytes());
    v.extend_from_slice(&(data.len() as u32).to_le_bytes());
    v.extend_from_slice(&(name.len() as u16).to_le_bytes());
    v.extend_from_slice(&0u16.to_le_bytes());
    v.extend_from_slice(name);
    v.extend_from_slice(data);

    let cd = v.len() as u32;
    v.extend_from_slice(&[0x50, 0x4B, 0x01, 0x02, 20, 0, 20, 0, 0, 0, 0, 0]);
    v.extend_from_slice(&[0; 8]);
    v.extend_from_slice(&(data.len() as u32).to_le_bytes());
    v.extend_from_slice(&(data.len() as u32).to_le_bytes());
    v.extend_from_slice(&(name.len() as u16).to_le_bytes());
    v.extend_from_slice(&[0; 12]);
    v.extend_from_slice(&0u32.to_le_bytes());
    v.extend_from_slice(name);
    let cd_size = v.len() as u32 - cd;

    v.extend_from_slice(&[0x50, 0x4B, 0x05, 0x06, 0, 0, 0, 0, 1, 0, 1, 0]);
    v.extend_from_slice(&cd_size.to_le_bytes());
    v.extend_from_slice(&cd_offset.unwrap_or(cd).to_le_bytes());
    v.extend_from_slice(&0u16.to_le_bytes());
    v
}

/// Filler of `len` bytes with each file copied in at its offset
pub fn image(len: usize, files: &[(usize, &[u8])]) -> Vec<u8> {
    place(filler(len), files)
}

/// Like [`image`] over seeded noise
pub fn noisy_image(len: usize, seed: u64, files: &[(usize, &[u8])]) -> Vec<u8> {
    place(noise(len, seed), files)
}

fn place(mut data: Vec<u8>, files: &[(usize, &[u8])]) -> Vec<u8> {
    for (at, file) in files {
        data[*at..*at + file.len()].copy_from_slice(file);
    }
    data
}

pub fn write_image(dir: &Path, data: &[u8]) -> std::path::PathBuf {
    let path = dir.join("disk.img");
    std::fs::write(&path, data).unwrap();
    path
}

/// Collect events until the stream closes
pub async fn collect(mut events: deepscan::EventStream) -> Vec<RecoveryEvent> {
    let mut out = Vec::new();
    while let Some(event) = events.recv().await {
        out.push(event);
    }
    out
}

pub fn final_report(events: &[RecoveryEvent]) -> &RecoveryReport {
    match events.last() {
        Some(RecoveryEvent::Completed { report }) => report,
        other => panic!("expected completed event, got {other:?}"),
    }
}

pub fn hashes(report: &RecoveryReport) -> BTreeSet<String> {
    report.files.iter().map(|f| f.blake3.clone()).collect()
}

pub fn partial_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "partial"))
        .count()
}

/// Holds back every read that reaches past `gate` until the token is cancelled
pub struct GatedSource {
    inner: MemorySource,
    gate: u64,
    open: CancelToken,
}

impl GatedSource {
    pub fn new(data: Vec<u8>, gate: u64, open: CancelToken) -> Self {
        Self {
            inner: MemorySource::new(data),
            gate,
            open,
        }
    }
}

impl BlockSource for GatedSource {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        while offset + buf.len() as u64 > self.gate && !self.open.is_cancelled() {
            std::thread::sleep(Duration::from_millis(5));
        }
        self.inner.read_at(offset, buf)
    }
}
