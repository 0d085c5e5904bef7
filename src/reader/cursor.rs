//! Windowed view over a [`BlockReader`] used by the structure walkers.

use crate::error::Result;
use crate::reader::BlockReader;

const WINDOW: usize = 64 * 1024;

/// Random-access view over `reader` limited to offsets below `limit`.
///
/// Accessors return `Ok(None)` when the requested bytes would cross the
/// limit, so truncated structures are distinguished from read errors.
pub struct Cursor<'r> {
    reader: &'r BlockReader,
    limit: u64,
    window: Vec<u8>,
    window_start: u64,
    window_size: usize,
}

impl<'r> Cursor<'r> {
    pub fn new(reader: &'r BlockReader, limit: u64) -> Self {
        Self {
            reader,
            limit: limit.min(reader.size()),
            window: Vec::new(),
            window_start: 0,
            window_size: WINDOW,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Make `[pos, pos + len)` resident. False if it crosses the limit.
    fn ensure(&mut self, pos: u64, len: usize) -> Result<bool> {
        let end = match pos.checked_add(len as u64) {
            Some(end) if end <= self.limit => end,
            _ => return Ok(false),
        };
        let window_end = self.window_start + self.window.len() as u64;
        if pos >= self.window_start && end <= window_end {
            return Ok(true);
        }

        let want = (self.window_size.max(len) as u64).min(self.limit - pos) as usize;
        self.window_start = pos;
        self.reader.read_into(pos, &mut self.window, want)?;
        Ok(self.window.len() >= len)
    }

    pub fn bytes(&mut self, pos: u64, len: usize) -> Result<Option<&[u8]>> {
        if !self.ensure(pos, len)? {
            return Ok(None);
        }
        let at = (pos - self.window_start) as usize;
        Ok(Some(&self.window[at..at + len]))
    }

    pub fn byte(&mut self, pos: u64) -> Result<Option<u8>> {
        Ok(self.bytes(pos, 1)?.map(|b| b[0]))
    }

    pub fn u16_be(&mut self, pos: u64) -> Result<Option<u16>> {
        Ok(self.bytes(pos, 2)?.map(|b| u16::from_be_bytes([b[0], b[1]])))
    }

    pub fn u16_le(&mut self, pos: u64) -> Result<Option<u16>> {
        Ok(self.bytes(pos, 2)?.map(|b| u16::from_le_bytes([b[0], b[1]])))
    }

    pub fn u32_be(&mut self, pos: u64) -> Result<Option<u32>> {
        Ok(self
            .bytes(pos, 4)?
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
    }

    pub fn u32_le(&mut self, pos: u64) -> Result<Option<u32>> {
        Ok(self
            .bytes(pos, 4)?
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])))
    }

    /// First occurrence of `pattern` at or after `from`, ending before the limit
    pub fn find(&mut self, pattern: &[u8], from: u64) -> Result<Option<u64>> {
        if pattern.is_empty() {
            return Ok(Some(from));
        }
        let plen = pattern.len();
        let mut pos = from;
        while pos + plen as u64 <= self.limit {
            let span = (self.window_size as u64).min(self.limit - pos) as usize;
            if !self.ensure(pos, span)? {
                return Ok(None);
            }
            let at = (pos - self.window_start) as usize;
            let hay = &self.window[at..at + span];
            if let Some(i) = find_in(hay, pattern) {
                return Ok(Some(pos + i as u64));
            }
            if span < plen {
                break;
            }
            // Overlap so a pattern straddling two windows is still seen
            pos += (span - (plen - 1)) as u64;
        }
        Ok(None)
    }
}

/// Naive substring search; patterns are short and start with rare bytes
pub(crate) fn find_in(hay: &[u8], pattern: &[u8]) -> Option<usize> {
    if pattern.len() > hay.len() {
        return None;
    }
    let first = pattern[0];
    let last_start = hay.len() - pattern.len();
    let mut i = 0;
    while i <= last_start {
        match hay[i..=last_start].iter().position(|&b| b == first) {
            Some(p) => {
                let at = i + p;
                if &hay[at..at + pattern.len()] == pattern {
                    return Some(at);
                }
                i = at + 1;
            }
            None => return None,
        }
    }
    None
}
