//! Validator - turns a header match into a bounded extent or a rejection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::signatures::{Signature, Structure};
use super::structure::{self, Walk};
use super::CandidateExtent;
use crate::error::{ErrorKind, RecoveryError};
use crate::reader::{BlockReader, Cursor};

/// Bytes read up front for header checks and extension sniffing
const HEAD_LEN: usize = 64;

/// How strongly the extent boundaries are supported
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Header matched; end taken from a declared length
    HeaderOnly,
    /// Header and footer matched
    HeaderFooter,
    /// Internal structure walked or cross-checked
    Validated,
}

/// Validation outcome recorded per recovered file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    AcceptedWithWarnings,
    Rejected,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Outcome::Accepted => "accepted",
            Outcome::AcceptedWithWarnings => "accepted-with-warnings",
            Outcome::Rejected => "rejected",
        })
    }
}

/// A candidate whose boundaries passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedExtent {
    pub extent: CandidateExtent,
    pub outcome: Outcome,
    pub warnings: Vec<String>,
    /// Extension to write the file with
    pub extension: String,
}

impl ValidatedExtent {
    pub fn len(&self) -> u64 {
        self.extent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extent.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    /// The bytes at `offset` only look like a header; not a candidate at all
    #[error("not a plausible header at {offset:#x}: {reason}")]
    Implausible { offset: u64, reason: String },

    #[error("no footer within {searched} bytes of {offset:#x}")]
    NoFooterFound { offset: u64, searched: u64 },

    #[error("structural mismatch at {offset:#x}: {reason}")]
    StructuralMismatch { offset: u64, reason: String },

    #[error(transparent)]
    Read(#[from] RecoveryError),
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ValidationError::NoFooterFound { .. } => ErrorKind::NoFooterFound,
            ValidationError::Implausible { .. } | ValidationError::StructuralMismatch { .. } => {
                ErrorKind::StructuralMismatch
            }
            ValidationError::Read(e) => e.kind(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ValidationError::Read(e) if e.is_fatal())
    }

    /// Whether the match should be reported as a rejected candidate.
    /// Implausible headers are chance byte patterns and are not reported.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, ValidationError::Implausible { .. })
    }
}

/// Find the end of the file starting at `start` that matched `sig`.
///
/// Reads never go past `min(source size, start + max size)`. Bytes that
/// match the header but fail its plausibility check give
/// [`ValidationError::Implausible`].
pub fn validate(
    reader: &BlockReader,
    start: u64,
    sig: &Signature,
) -> Result<ValidatedExtent, ValidationError> {
    let limit = reader.size().min(start.saturating_add(sig.size_limit()));
    let head = reader.read_at(start, HEAD_LEN)?;
    if !head.starts_with(&sig.header) {
        return Err(implausible(start, "header does not match"));
    }
    let extension = sig.extension_for(&head);
    let mut cursor = Cursor::new(reader, limit);

    let Some(kind) = sig.structure else {
        return footer_only(&mut cursor, start, sig, extension);
    };

    structure::check_header(kind, &head).map_err(|reason| implausible(start, reason))?;

    match kind {
        Structure::Jpeg | Structure::Png | Structure::Gif => {
            match structure::walk(kind, &mut cursor, start)? {
                Walk::End { end, warnings } => {
                    Ok(accept(sig, start, end, Confidence::Validated, warnings, extension))
                }
                Walk::Truncated => {
                    let why = format!("{} structure truncated; end taken from footer", kind.name());
                    footer_fallback(&mut cursor, start, sig, extension, why)
                }
                Walk::Malformed(reason) => {
                    let why = format!("{reason}; end taken from footer");
                    footer_fallback(&mut cursor, start, sig, extension, why)
                }
            }
        }
        Structure::Zip => zip(&mut cursor, start, sig, extension),
        Structure::Pdf => {
            let first = find_footer_end(&mut cursor, start, sig)?;
            let footer = sig.footer.as_deref().unwrap_or_default();
            let (end, warnings) = structure::pdf_updates(&mut cursor, first, footer)?;
            Ok(accept(sig, start, end, Confidence::HeaderFooter, warnings, extension))
        }
        Structure::Bmp | Structure::Riff | Structure::Sqlite => {
            let size = structure::declared_size(kind, &head).map_err(|r| mismatch(start, r))?;
            if size > sig.size_limit() {
                return Err(mismatch(
                    start,
                    format!("declared size {size} exceeds maximum {}", sig.size_limit()),
                ));
            }
            let end = start + size;
            if end > reader.size() {
                return Err(mismatch(
                    start,
                    format!("declared size {size} runs past end of source"),
                ));
            }
            Ok(accept(sig, start, end, Confidence::HeaderOnly, Vec::new(), extension))
        }
    }
}

fn footer_only(
    cursor: &mut Cursor<'_>,
    start: u64,
    sig: &Signature,
    extension: String,
) -> Result<ValidatedExtent, ValidationError> {
    let end = find_footer_end(cursor, start, sig)?;
    Ok(accept(sig, start, end, Confidence::HeaderFooter, Vec::new(), extension))
}

fn footer_fallback(
    cursor: &mut Cursor<'_>,
    start: u64,
    sig: &Signature,
    extension: String,
    warning: String,
) -> Result<ValidatedExtent, ValidationError> {
    if sig.footer.is_none() {
        return Err(mismatch(start, warning));
    }
    let end = find_footer_end(cursor, start, sig)?;
    Ok(accept(sig, start, end, Confidence::HeaderFooter, vec![warning], extension))
}

/// End offset just past the first footer after the header
fn find_footer_end(
    cursor: &mut Cursor<'_>,
    start: u64,
    sig: &Signature,
) -> Result<u64, ValidationError> {
    let footer = sig.footer.as_deref().unwrap_or_default();
    if footer.is_empty() {
        return Err(mismatch(start, "signature has no footer"));
    }
    match cursor.find(footer, start + sig.header.len() as u64)? {
        Some(at) => Ok(at + footer.len() as u64),
        None => Err(ValidationError::NoFooterFound {
            offset: start,
            searched: cursor.limit().saturating_sub(start),
        }),
    }
}

fn zip(
    cursor: &mut Cursor<'_>,
    start: u64,
    sig: &Signature,
    extension: String,
) -> Result<ValidatedExtent, ValidationError> {
    let footer = sig.footer.as_deref().unwrap_or_default();
    let not_found = |cursor: &Cursor<'_>| ValidationError::NoFooterFound {
        offset: start,
        searched: cursor.limit().saturating_sub(start),
    };
    if footer.is_empty() {
        return Err(not_found(cursor));
    }
    let Some(eocd) = cursor.find(footer, start + sig.header.len() as u64)? else {
        return Err(not_found(cursor));
    };

    let mut warnings = Vec::new();
    let end = match structure::zip_trailer_len(cursor, eocd)? {
        Some(len) if eocd + len <= cursor.limit() => eocd + len,
        Some(_) => {
            warnings.push("archive comment runs past the end of the source".to_string());
            (eocd + structure::ZIP_EOCD_LEN).min(cursor.limit())
        }
        None => {
            warnings.push("end of central directory record is truncated".to_string());
            eocd + footer.len() as u64
        }
    };
    warnings.extend(structure::zip_cross_check(cursor, start, eocd)?);

    let confidence = if warnings.is_empty() {
        Confidence::Validated
    } else {
        Confidence::HeaderFooter
    };
    Ok(accept(sig, start, end, confidence, warnings, extension))
}

fn accept(
    sig: &Signature,
    start: u64,
    end: u64,
    confidence: Confidence,
    warnings: Vec<String>,
    extension: String,
) -> ValidatedExtent {
    let outcome = if warnings.is_empty() {
        Outcome::Accepted
    } else {
        Outcome::AcceptedWithWarnings
    };
    ValidatedExtent {
        extent: CandidateExtent {
            type_id: sig.id.clone(),
            start,
            end,
            confidence,
        },
        outcome,
        warnings,
        extension,
    }
}

fn implausible(offset: u64, reason: impl Into<String>) -> ValidationError {
    ValidationError::Implausible {
        offset,
        reason: reason.into(),
    }
}

fn mismatch(offset: u64, reason: impl Into<String>) -> ValidationError {
    ValidationError::StructuralMismatch {
        offset,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carve::signatures::SignatureCatalog;

    fn sig(id: &str) -> Signature {
        SignatureCatalog::builtin().get(id).cloned().unwrap()
    }

    fn jpeg() -> Vec<u8> {
        let mut v = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        v.extend_from_slice(b"JFIF\0\x01\x01\0\0\x01\0\x01\0\0");
        v.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00]);
        v.extend((0..3000).map(|i| (i % 200) as u8));
        v.extend_from_slice(&[0xFF, 0xD9]);
        v
    }

    /// Single stored entry archive; `cd_offset` overrides the EOCD field
    fn zip(cd_offset: Option<u32>) -> Vec<u8> {
        let name = b"a.txt";
        let data = b"hello zip";
        let mut v = Vec::new();
        v.extend_from_slice(&[0x50, 0x4B, 0x03, 0x04, 20, 0, 0, 0, 0, 0]);
        v.extend_from_slice(&[0; 16]); // time, date, crc, sizes
        v.extend_from_slice(&(name.len() as u16).to_le_bytes());
        v.extend_from_slice(&0u16.to_le_bytes());
        v.extend_from_slice(name);
        v.extend_from_slice(data);
        let cd = v.len() as u32;
        v.extend_from_slice(&[0x50, 0x4B, 0x01, 0x02, 20, 0, 20, 0, 0, 0, 0, 0]);
        v.extend_from_slice(&[0; 16]);
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

    fn embed(file: &[u8], at: usize, total: usize) -> BlockReader {
        let mut data = vec![0u8; total];
        data[at..at + file.len()].copy_from_slice(file);
        BlockReader::from_bytes(data)
    }

    #[test]
    fn test_jpeg_validated_by_walk() {
        let file = jpeg();
        let reader = embed(&file, 100, 10_000);
        let v = validate(&reader, 100, &sig("jpeg")).unwrap();
        assert_eq!(v.extent.start, 100);
        assert_eq!(v.extent.end, 100 + file.len() as u64);
        assert_eq!(v.extent.confidence, Confidence::Validated);
        assert_eq!(v.outcome, Outcome::Accepted);
        assert_eq!(v.extension, "jpg");
    }

    #[test]
    fn test_truncated_jpeg_without_footer() {
        let file = jpeg();
        let cut = &file[..file.len() - 50];
        let reader = embed(cut, 1000, 1000 + cut.len());
        let err = validate(&reader, 1000, &sig("jpeg")).unwrap_err();
        assert!(matches!(err, ValidationError::NoFooterFound { offset: 1000, .. }));
        assert_eq!(err.kind(), ErrorKind::NoFooterFound);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_malformed_jpeg_falls_back_to_footer() {
        let mut file = jpeg();
        // break the SOS segment marker
        file[20] = 0x00;
        let reader = embed(&file, 0, 8000);
        let v = validate(&reader, 0, &sig("jpeg")).unwrap();
        assert_eq!(v.outcome, Outcome::AcceptedWithWarnings);
        assert_eq!(v.extent.confidence, Confidence::HeaderFooter);
        assert_eq!(v.extent.end, file.len() as u64);
    }

    #[test]
    fn test_zip_validated() {
        let file = zip(None);
        let reader = embed(&file, 512, 4096);
        let v = validate(&reader, 512, &sig("zip")).unwrap();
        assert_eq!(v.extent.end, 512 + file.len() as u64);
        assert_eq!(v.outcome, Outcome::Accepted);
        assert_eq!(v.extent.confidence, Confidence::Validated);
    }

    #[test]
    fn test_zip_bad_cd_offset_warns() {
        let file = zip(Some(0x00FF_FFFF));
        let reader = embed(&file, 0, 4096);
        let v = validate(&reader, 0, &sig("zip")).unwrap();
        assert_eq!(v.extent.end, file.len() as u64);
        assert_eq!(v.outcome, Outcome::AcceptedWithWarnings);
        assert!(v.warnings[0].contains("outside the archive"));
    }

    #[test]
    fn test_zip_without_eocd() {
        let mut file = zip(None);
        file.truncate(file.len() - 22);
        let reader = embed(&file, 0, file.len());
        let err = validate(&reader, 0, &sig("zip")).unwrap_err();
        assert!(matches!(err, ValidationError::NoFooterFound { .. }));
    }

    #[test]
    fn test_declared_size_past_end() {
        let mut riff = b"RIFF".to_vec();
        riff.extend_from_slice(&10_000u32.to_le_bytes());
        riff.extend_from_slice(b"WAVEfmt ");
        let reader = embed(&riff, 0, 2000);
        let err = validate(&reader, 0, &sig("riff")).unwrap_err();
        assert!(matches!(err, ValidationError::StructuralMismatch { .. }));

        let mut riff = b"RIFF".to_vec();
        riff.extend_from_slice(&1000u32.to_le_bytes());
        riff.extend_from_slice(b"WAVEfmt ");
        let reader = embed(&riff, 0, 2000);
        let v = validate(&reader, 0, &sig("riff")).unwrap();
        assert_eq!(v.extent.end, 1008);
        assert_eq!(v.extension, "wav");
        assert_eq!(v.extent.confidence, Confidence::HeaderOnly);
    }

    #[test]
    fn test_footer_only_signature() {
        let mut data = b"<html><body>hi</body></html>".to_vec();
        let len = data.len() as u64;
        data.extend_from_slice(b"trailing junk");
        let reader = BlockReader::from_bytes(data);
        let v = validate(&reader, 0, &sig("html")).unwrap();
        assert_eq!(v.extent.end, len);
        assert_eq!(v.extent.confidence, Confidence::HeaderFooter);
    }

    #[test]
    fn test_search_bounded_by_max_size() {
        let custom = Signature::new("tiny", *b"TT").footer(*b"EE").max_size(16);
        let mut data = b"TT".to_vec();
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(b"EE");
        let reader = BlockReader::from_bytes(data);
        let err = validate(&reader, 0, &custom).unwrap_err();
        assert!(matches!(err, ValidationError::NoFooterFound { searched: 16, .. }));
    }

    fn png_chunk(kind: &[u8; 4], data: &[u8]) -> Vec<u8> {
        let mut v = (data.len() as u32).to_be_bytes().to_vec();
        v.extend_from_slice(kind);
        v.extend_from_slice(data);
        let mut h = crc32fast::Hasher::new();
        h.update(kind);
        h.update(data);
        v.extend_from_slice(&h.finalize().to_be_bytes());
        v
    }

    #[test]
    fn test_png_validated_by_chunk_walk() {
        let mut file = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        file.extend(png_chunk(b"IHDR", &[0, 0, 0, 2, 0, 0, 0, 2, 8, 2, 0, 0, 0]));
        file.extend(png_chunk(b"IDAT", &[0x78, 0x9C, 0x63, 0x60, 0x00, 0x00]));
        file.extend(png_chunk(b"IEND", &[]));
        let reader = embed(&file, 64, 4096);
        let v = validate(&reader, 64, &sig("png")).unwrap();
        assert_eq!(v.extent.end, 64 + file.len() as u64);
        assert_eq!(v.extent.confidence, Confidence::Validated);
        assert_eq!(v.outcome, Outcome::Accepted);
    }

    #[test]
    fn test_gif_validated_by_block_walk() {
        let mut file = b"GIF89a".to_vec();
        // 1x1 screen, 2-entry global color table
        file.extend_from_slice(&[1, 0, 1, 0, 0x80, 0, 0]);
        file.extend_from_slice(&[0, 0, 0, 255, 255, 255]);
        file.extend_from_slice(&[0x2C, 0, 0, 0, 0, 1, 0, 1, 0, 0]);
        file.extend_from_slice(&[0x02, 0x02, 0x4C, 0x01, 0x00]);
        file.push(0x3B);
        let reader = embed(&file, 0, 2048);
        let v = validate(&reader, 0, &sig("gif")).unwrap();
        assert_eq!(v.extent.end, file.len() as u64);
        assert_eq!(v.extent.confidence, Confidence::Validated);
    }

    #[test]
    fn test_bmp_sized_from_header() {
        let mut file = b"BM".to_vec();
        file.extend_from_slice(&1000u32.to_le_bytes());
        file.extend_from_slice(&[0; 4]);
        file.extend_from_slice(&54u32.to_le_bytes());
        file.extend_from_slice(&40u32.to_le_bytes());
        file.resize(1000, 0x7F);
        let reader = embed(&file, 100, 4096);
        let v = validate(&reader, 100, &sig("bmp")).unwrap();
        assert_eq!(v.extent.end, 1100);
        assert_eq!(v.extent.confidence, Confidence::HeaderOnly);
        assert_eq!(v.extension, "bmp");
    }

    #[test]
    fn test_sqlite_sized_from_page_count() {
        let mut file = b"SQLite format 3\0".to_vec();
        file.extend_from_slice(&[0x10, 0x00, 1, 1, 0, 64, 32, 32]);
        file.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 2]);
        file.resize(8192, 0);
        let reader = embed(&file, 0, 10_000);
        let v = validate(&reader, 0, &sig("sqlite")).unwrap();
        assert_eq!(v.extent.end, 8192);
        assert_eq!(v.extension, "db");
        assert_eq!(v.extent.confidence, Confidence::HeaderOnly);
    }

    #[test]
    fn test_pdf_end_includes_incremental_update() {
        let mut file = b"%PDF-1.6\n1 0 obj\n<<>>\nendobj\ntrailer\n<<>>\n%%EOF".to_vec();
        let first = file.len() as u64;
        file.extend_from_slice(b"\n2 0 obj\n<<>>\nendobj\ntrailer\n<<>>\n%%EOF\n");
        let reader = embed(&file, 512, 4096);
        let v = validate(&reader, 512, &sig("pdf")).unwrap();
        assert!(v.extent.end > 512 + first);
        assert_eq!(v.extent.end, 512 + file.len() as u64 - 1);
        assert_eq!(v.outcome, Outcome::Accepted);
        assert_eq!(v.extent.confidence, Confidence::HeaderFooter);
    }

    #[test]
    fn test_chance_header_bytes_are_implausible() {
        let reader = BlockReader::from_bytes(b"BM\x9a\x01\x00\x00\x13\x37garbage garbage".to_vec());
        let err = validate(&reader, 0, &sig("bmp")).unwrap_err();
        assert!(matches!(err, ValidationError::Implausible { offset: 0, .. }));
        assert!(!err.is_rejection());

        let mut png = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        png.extend_from_slice(&[0; 24]);
        let err = validate(&BlockReader::from_bytes(png), 0, &sig("png")).unwrap_err();
        assert!(matches!(err, ValidationError::Implausible { .. }));

        // plausible header, missing end: still a rejection
        let file = jpeg();
        let reader = embed(&file[..200], 0, 200);
        assert!(validate(&reader, 0, &sig("jpeg")).unwrap_err().is_rejection());
    }
}
