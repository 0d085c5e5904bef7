//! Format-specific structure checks.
//!
//! Byte order is explicit per format: JPEG, PNG and SQLite fields are
//! big-endian; GIF, ZIP, BMP and RIFF fields are little-endian.

use crate::carve::signatures::Structure;
use crate::error::Result;
use crate::reader::Cursor;

/// ZIP central directory file header
const ZIP_CDFH: [u8; 4] = [0x50, 0x4B, 0x01, 0x02];
/// Fixed part of the ZIP end-of-central-directory record
pub const ZIP_EOCD_LEN: u64 = 22;

/// Result of walking a file's internal structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Walk {
    /// Structure ends at `end` (exclusive)
    End { end: u64, warnings: Vec<String> },
    /// Ran into the search limit before the structure ended
    Truncated,
    /// Structure is inconsistent
    Malformed(String),
}

macro_rules! need {
    ($e:expr) => {
        match $e? {
            Some(v) => v,
            None => return Ok(Walk::Truncated),
        }
    };
}

/// Cheap plausibility check on the first bytes of a candidate.
///
/// `head` may be shorter than the fields being checked when the candidate
/// sits at the very end of the source; missing fields pass unless the
/// format needs them to size the file.
pub fn check_header(structure: Structure, head: &[u8]) -> std::result::Result<(), String> {
    match structure {
        Structure::Jpeg => match head.get(3) {
            Some(&m) if (0xC0..=0xFE).contains(&m) && !(0xD0..=0xD9).contains(&m) => Ok(()),
            Some(&m) => Err(format!("byte after SOI is not a segment marker (0x{m:02X})")),
            None => Ok(()),
        },
        Structure::Png => {
            if head.len() < 16 {
                return Ok(());
            }
            if be32(head, 8) != 13 || &head[12..16] != b"IHDR" {
                return Err("first chunk is not a 13-byte IHDR".into());
            }
            Ok(())
        }
        Structure::Gif => match head.get(4..6) {
            Some(b"7a") | Some(b"9a") => Ok(()),
            Some(v) => Err(format!("unknown GIF version {:?}", String::from_utf8_lossy(v))),
            None => Ok(()),
        },
        Structure::Zip => {
            if head.len() < 30 {
                return Ok(());
            }
            let version = le16(head, 4);
            let method = le16(head, 8);
            let name_len = le16(head, 26);
            if version > 100 {
                return Err(format!("implausible version needed {version}"));
            }
            if !matches!(method, 0..=9 | 12 | 14 | 18 | 19 | 93 | 95 | 96 | 97 | 98 | 99) {
                return Err(format!("unknown compression method {method}"));
            }
            if name_len == 0 || name_len > 1024 {
                return Err(format!("implausible file name length {name_len}"));
            }
            Ok(())
        }
        Structure::Bmp => {
            if head.len() < 18 {
                return Err("BMP header truncated".into());
            }
            if le32(head, 6) != 0 {
                return Err("reserved BMP fields are not zero".into());
            }
            let dib = le32(head, 14);
            if !matches!(dib, 12 | 40 | 52 | 56 | 64 | 108 | 124) {
                return Err(format!("unknown DIB header size {dib}"));
            }
            let pixels = le32(head, 10);
            let size = le32(head, 2);
            if pixels < 14 + dib || pixels > size {
                return Err(format!("pixel data offset {pixels} out of range"));
            }
            Ok(())
        }
        Structure::Riff => {
            if head.len() < 12 {
                return Err("RIFF header truncated".into());
            }
            if !head[8..12].iter().all(|b| b.is_ascii_alphanumeric() || *b == b' ') {
                return Err("RIFF form type is not printable".into());
            }
            Ok(())
        }
        Structure::Pdf => match head.get(5) {
            Some(v) if v.is_ascii_digit() => Ok(()),
            Some(&v) => Err(format!("PDF version does not start with a digit (0x{v:02X})")),
            None => Ok(()),
        },
        Structure::Sqlite => {
            if head.len() < 32 {
                return Err("SQLite header truncated".into());
            }
            if head[21] != 64 || head[22] != 32 || head[23] != 32 {
                return Err("SQLite payload fractions are wrong".into());
            }
            Ok(())
        }
    }
}

/// Total file size declared in the header, for formats that carry one
pub fn declared_size(structure: Structure, head: &[u8]) -> std::result::Result<u64, String> {
    match structure {
        Structure::Bmp if head.len() >= 6 => {
            let size = le32(head, 2) as u64;
            if size < 26 {
                return Err(format!("declared BMP size {size} is too small"));
            }
            Ok(size)
        }
        Structure::Riff if head.len() >= 8 => Ok(le32(head, 4) as u64 + 8),
        Structure::Sqlite if head.len() >= 32 => {
            let page_size = match u16::from_be_bytes([head[16], head[17]]) {
                1 => 65536u64,
                n => n as u64,
            };
            if page_size < 512 || !page_size.is_power_of_two() {
                return Err(format!("invalid SQLite page size {page_size}"));
            }
            let pages = be32(head, 28) as u64;
            if pages == 0 {
                return Err("SQLite header has no in-header page count".into());
            }
            Ok(page_size * pages)
        }
        Structure::Bmp | Structure::Riff | Structure::Sqlite => Err("header truncated".into()),
        other => Err(format!("{} has no declared size", other.name())),
    }
}

/// Walk a marker-delimited format from `start` to its terminator
pub fn walk(structure: Structure, cursor: &mut Cursor<'_>, start: u64) -> Result<Walk> {
    match structure {
        Structure::Jpeg => walk_jpeg(cursor, start),
        Structure::Png => walk_png(cursor, start),
        Structure::Gif => walk_gif(cursor, start),
        other => Ok(Walk::Malformed(format!(
            "{} is not a marker-delimited format",
            other.name()
        ))),
    }
}

fn walk_jpeg(c: &mut Cursor<'_>, start: u64) -> Result<Walk> {
    let mut pos = start + 2;
    loop {
        if need!(c.byte(pos)) != 0xFF {
            return Ok(Walk::Malformed(format!("expected marker at {pos:#x}")));
        }
        while need!(c.byte(pos + 1)) == 0xFF {
            pos += 1;
        }
        let marker = need!(c.byte(pos + 1));
        match marker {
            0xD9 => {
                return Ok(Walk::End {
                    end: pos + 2,
                    warnings: Vec::new(),
                })
            }
            0x01 | 0xD0..=0xD7 => pos += 2,
            0x00 | 0xD8 => {
                return Ok(Walk::Malformed(format!(
                    "unexpected marker 0x{marker:02X} at {pos:#x}"
                )))
            }
            0xDA => {
                let len = need!(c.u16_be(pos + 2)) as u64;
                if len < 2 {
                    return Ok(Walk::Malformed(format!("bad SOS length at {pos:#x}")));
                }
                pos += 2 + len;
                // Entropy-coded data runs until a marker that isn't a stuffed
                // zero, a restart, or fill
                loop {
                    let ff = need!(c.find(&[0xFF], pos));
                    match need!(c.byte(ff + 1)) {
                        0x00 | 0xD0..=0xD7 => pos = ff + 2,
                        0xFF => pos = ff + 1,
                        _ => {
                            pos = ff;
                            break;
                        }
                    }
                }
            }
            _ => {
                let len = need!(c.u16_be(pos + 2)) as u64;
                if len < 2 {
                    return Ok(Walk::Malformed(format!(
                        "bad segment length for marker 0x{marker:02X} at {pos:#x}"
                    )));
                }
                pos += 2 + len;
            }
        }
    }
}

fn walk_png(c: &mut Cursor<'_>, start: u64) -> Result<Walk> {
    let mut pos = start + 8;
    let mut warnings = Vec::new();
    loop {
        let len = need!(c.u32_be(pos)) as u64;
        if len > 0x7FFF_FFFF {
            return Ok(Walk::Malformed(format!("chunk length overflow at {pos:#x}")));
        }
        let kind = need!(c.bytes(pos + 4, 4));
        let kind = [kind[0], kind[1], kind[2], kind[3]];
        if !kind.iter().all(u8::is_ascii_alphabetic) {
            return Ok(Walk::Malformed(format!("invalid chunk type at {pos:#x}")));
        }

        let crc_pos = pos + 8 + len;
        let stored = need!(c.u32_be(crc_pos));
        let actual = need!(crc_range(c, pos + 4, 4 + len));
        if stored != actual {
            warnings.push(format!(
                "CRC mismatch in {} chunk at {pos:#x}",
                String::from_utf8_lossy(&kind)
            ));
        }

        pos = crc_pos + 4;
        if &kind == b"IEND" {
            return Ok(Walk::End { end: pos, warnings });
        }
    }
}

/// CRC-32 of `[from, from + len)`, read in window-sized pieces
fn crc_range(c: &mut Cursor<'_>, from: u64, len: u64) -> Result<Option<u32>> {
    const PIECE: u64 = 64 * 1024;
    let mut hasher = crc32fast::Hasher::new();
    let mut pos = from;
    let end = from + len;
    while pos < end {
        let n = PIECE.min(end - pos) as usize;
        match c.bytes(pos, n)? {
            Some(b) => hasher.update(b),
            None => return Ok(None),
        }
        pos += n as u64;
    }
    Ok(Some(hasher.finalize()))
}

fn walk_gif(c: &mut Cursor<'_>, start: u64) -> Result<Walk> {
    let packed = need!(c.byte(start + 10));
    let mut pos = start + 13 + color_table_len(packed);
    loop {
        match need!(c.byte(pos)) {
            0x3B => {
                return Ok(Walk::End {
                    end: pos + 1,
                    warnings: Vec::new(),
                })
            }
            0x21 => {
                pos = match skip_sub_blocks(c, pos + 2)? {
                    Some(p) => p,
                    None => return Ok(Walk::Truncated),
                };
            }
            0x2C => {
                let packed = need!(c.byte(pos + 9));
                pos += 10 + color_table_len(packed) + 1;
                pos = match skip_sub_blocks(c, pos)? {
                    Some(p) => p,
                    None => return Ok(Walk::Truncated),
                };
            }
            other => {
                return Ok(Walk::Malformed(format!(
                    "unknown GIF block 0x{other:02X} at {pos:#x}"
                )))
            }
        }
    }
}

fn color_table_len(packed: u8) -> u64 {
    if packed & 0x80 != 0 {
        3 * (1u64 << ((packed & 0x07) + 1))
    } else {
        0
    }
}

fn skip_sub_blocks(c: &mut Cursor<'_>, mut pos: u64) -> Result<Option<u64>> {
    loop {
        let n = match c.byte(pos)? {
            Some(n) => n,
            None => return Ok(None),
        };
        pos += 1;
        if n == 0 {
            return Ok(Some(pos));
        }
        pos += n as u64;
    }
}

/// Follow incremental updates past a PDF's first `%%EOF`.
///
/// An update section starts right after the previous `%%EOF` and its line
/// break with either an indirect object (`12 0 obj`) or an `xref` table.
/// Each one moves the end to its own `%%EOF`. An update with no `%%EOF`
/// before the limit or before the next `%PDF-` header is left out with a
/// warning.
pub fn pdf_updates(c: &mut Cursor<'_>, first_end: u64, eof: &[u8]) -> Result<(u64, Vec<String>)> {
    let mut end = first_end;
    let mut warnings = Vec::new();
    loop {
        let mut pos = end;
        while let Some(b'\r' | b'\n') = c.byte(pos)? {
            pos += 1;
        }
        let avail = c.limit().saturating_sub(pos).min(32) as usize;
        match c.bytes(pos, avail)? {
            Some(lead) if starts_pdf_update(lead) => {}
            _ => break,
        }
        let Some(at) = c.find(eof, pos)? else {
            warnings.push(format!(
                "incremental update at {pos:#x} has no %%EOF; kept the revision ending at {end:#x}"
            ));
            break;
        };
        if let Some(next) = c.find(b"%PDF-", pos)?.filter(|&h| h < at) {
            warnings.push(format!(
                "incremental update at {pos:#x} runs into a PDF header at {next:#x}; kept the revision ending at {end:#x}"
            ));
            break;
        }
        end = at + eof.len() as u64;
    }
    Ok((end, warnings))
}

/// `xref` or `<digits> <digits> obj`
fn starts_pdf_update(b: &[u8]) -> bool {
    if b.starts_with(b"xref") {
        return true;
    }
    let digits = |from: usize| b[from..].iter().take_while(|c| c.is_ascii_digit()).count();
    let n = digits(0);
    if n == 0 || b.get(n) != Some(&b' ') {
        return false;
    }
    let g = digits(n + 1);
    g > 0 && b[n + 1 + g..].starts_with(b" obj")
}

/// Length of the EOCD record at `eocd` including its trailing comment
pub fn zip_trailer_len(c: &mut Cursor<'_>, eocd: u64) -> Result<Option<u64>> {
    Ok(c.u16_le(eocd + 20)?
        .map(|comment| ZIP_EOCD_LEN + comment as u64))
}

/// Compare the EOCD's central directory fields with where the archive
/// actually starts and where its EOCD was found
pub fn zip_cross_check(c: &mut Cursor<'_>, start: u64, eocd: u64) -> Result<Vec<String>> {
    let mut warnings = Vec::new();
    let (Some(cd_size), Some(cd_offset)) = (c.u32_le(eocd + 12)?, c.u32_le(eocd + 16)?) else {
        warnings.push("end of central directory record is truncated".to_string());
        return Ok(warnings);
    };
    if cd_offset == u32::MAX || cd_size == u32::MAX {
        warnings.push("zip64 archive; central directory not verified".to_string());
        return Ok(warnings);
    }

    let body = eocd - start;
    let (cd_offset, cd_size) = (cd_offset as u64, cd_size as u64);
    if cd_offset >= body {
        warnings.push(format!(
            "central directory offset {cd_offset} points outside the archive ({body} bytes before EOCD)"
        ));
        return Ok(warnings);
    }
    if cd_offset + cd_size != body {
        warnings.push(format!(
            "central directory ends at {} but EOCD is at {body}",
            cd_offset + cd_size
        ));
    }
    if c.bytes(start + cd_offset, 4)? != Some(&ZIP_CDFH[..]) {
        warnings.push(format!(
            "no central directory header at offset {cd_offset}"
        ));
    }
    Ok(warnings)
}

fn be32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}
