//! Signature catalog for carving.
//!
//! Each signature defines header magic bytes, an optional footer, a maximum
//! plausible size, and an optional structure validator that reads the file's
//! own length fields or markers to find its real end.
//!
//! The catalog is built once at startup and is read-only afterwards, so it
//! can be shared between sessions behind an `Arc`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// Search window used when a signature declares no maximum size
pub const DEFAULT_MAX_SIZE: u64 = 64 * 1024 * 1024;

const MIB: u64 = 1024 * 1024;

/// Internal structure validators known to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Structure {
    /// JPEG marker segments, entropy-coded data, EOI
    Jpeg,
    /// PNG chunk walk with CRC check, IEND
    Png,
    /// GIF blocks and sub-blocks, trailer
    Gif,
    /// ZIP end-of-central-directory plus central directory cross-check
    Zip,
    /// BMP declared file size
    Bmp,
    /// RIFF declared chunk size
    Riff,
    /// SQLite page size times page count
    Sqlite,
    /// PDF `%%EOF`, following incremental updates appended after it
    Pdf,
}

impl Structure {
    pub fn name(&self) -> &'static str {
        match self {
            Structure::Jpeg => "jpeg",
            Structure::Png => "png",
            Structure::Gif => "gif",
            Structure::Zip => "zip",
            Structure::Bmp => "bmp",
            Structure::Riff => "riff",
            Structure::Sqlite => "sqlite",
            Structure::Pdf => "pdf",
        }
    }
}

/// A file type signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Unique type identifier (e.g. "jpeg")
    pub id: String,
    /// Default extension for recovered files
    pub extension: String,
    pub description: String,
    /// Magic bytes at the start of the file
    pub header: Vec<u8>,
    /// Bytes marking the end of the file (included in the extent)
    pub footer: Option<Vec<u8>>,
    /// Maximum plausible size; bounds footer searches
    pub max_size: Option<u64>,
    pub structure: Option<Structure>,
}

impl Signature {
    pub fn new(id: impl Into<String>, header: impl Into<Vec<u8>>) -> Self {
        let id = id.into();
        Self {
            extension: id.clone(),
            description: String::new(),
            id,
            header: header.into(),
            footer: None,
            max_size: None,
            structure: None,
        }
    }

    pub fn footer(mut self, footer: impl Into<Vec<u8>>) -> Self {
        self.footer = Some(footer.into());
        self
    }

    pub fn max_size(mut self, max: u64) -> Self {
        self.max_size = Some(max);
        self
    }

    pub fn structure(mut self, structure: Structure) -> Self {
        self.structure = Some(structure);
        self
    }

    pub fn extension(mut self, ext: impl Into<String>) -> Self {
        self.extension = ext.into();
        self
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Size cap used to bound validation
    pub fn size_limit(&self) -> u64 {
        self.max_size.unwrap_or(DEFAULT_MAX_SIZE)
    }

    /// Extension for a file whose first bytes are `head`
    pub fn extension_for(&self, head: &[u8]) -> String {
        match self.structure {
            Some(Structure::Riff) => discriminate_riff(head)
                .map(str::to_string)
                .unwrap_or_else(|| self.extension.clone()),
            _ => self.extension.clone(),
        }
    }

    fn check(&self) -> Result<(), CatalogError> {
        if self.header.is_empty() {
            return Err(CatalogError::EmptyHeader(self.id.clone()));
        }
        if self.footer.as_ref().map_or(true, |f| f.is_empty()) && self.structure.is_none() {
            return Err(CatalogError::Unbounded(self.id.clone()));
        }
        Ok(())
    }
}

/// Distinguish RIFF containers by their form type
pub fn discriminate_riff(data: &[u8]) -> Option<&'static str> {
    if data.len() < 12 {
        return None;
    }
    match &data[8..12] {
        b"WAVE" => Some("wav"),
        b"AVI " => Some("avi"),
        b"WEBP" => Some("webp"),
        _ => Some("riff"),
    }
}

/// Registry of signatures with a first-byte index for fast matching
#[derive(Debug, Clone)]
pub struct SignatureCatalog {
    signatures: Vec<Signature>,
    /// Per first byte: signature indices, longest header first, then registration order
    first_byte: Vec<Vec<usize>>,
    max_header_len: usize,
}

impl Default for SignatureCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self {
            signatures: Vec::new(),
            first_byte: vec![Vec::new(); 256],
            max_header_len: 0,
        }
    }

    /// Catalog with the built-in signatures
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for sig in builtin_signatures() {
            catalog.insert(sig);
        }
        catalog
    }

    /// Add a signature. Ids must be unique and the signature must have a
    /// non-empty header and some way to find its end.
    pub fn register(&mut self, sig: Signature) -> Result<(), CatalogError> {
        sig.check()?;
        if self.get(&sig.id).is_some() {
            return Err(CatalogError::Duplicate(sig.id));
        }
        self.insert(sig);
        Ok(())
    }

    fn insert(&mut self, sig: Signature) {
        let idx = self.signatures.len();
        let first = sig.header[0] as usize;
        self.max_header_len = self.max_header_len.max(sig.header.len());
        self.signatures.push(sig);

        let sigs = &self.signatures;
        let bucket = &mut self.first_byte[first];
        bucket.push(idx);
        // Stable: equal lengths keep registration order
        bucket.sort_by(|&a, &b| sigs[b].header.len().cmp(&sigs[a].header.len()));
    }

    /// Signatures whose header matches at the start of `buf`, most specific first
    pub fn matches<'a>(&'a self, buf: &[u8]) -> Vec<&'a Signature> {
        let Some(&first) = buf.first() else {
            return Vec::new();
        };
        self.first_byte[first as usize]
            .iter()
            .map(|&i| &self.signatures[i])
            .filter(|s| buf.starts_with(&s.header))
            .collect()
    }

    /// Cheap pre-filter: can any header start with `byte`?
    #[inline]
    pub fn could_match(&self, byte: u8) -> bool {
        !self.first_byte[byte as usize].is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Signature> {
        self.signatures.iter().find(|s| s.id == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.signatures.iter().map(|s| s.id.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Signature> {
        self.signatures.iter()
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn max_header_len(&self) -> usize {
        self.max_header_len
    }

    /// Sub-catalog restricted to `ids`, keeping registration order
    pub fn filtered<S: AsRef<str>>(&self, ids: &[S]) -> Result<Self, CatalogError> {
        for id in ids {
            if self.get(id.as_ref()).is_none() {
                return Err(CatalogError::Unknown(id.as_ref().to_string()));
            }
        }
        let mut catalog = Self::new();
        for sig in &self.signatures {
            if ids.iter().any(|id| id.as_ref() == sig.id) {
                catalog.insert(sig.clone());
            }
        }
        Ok(catalog)
    }

    /// Register every signature from a JSON signature file
    pub fn extend_from_file(&mut self, path: &Path) -> Result<usize, CatalogError> {
        let sigs = load_file(path)?;
        let count = sigs.len();
        for sig in sigs {
            self.register(sig)?;
        }
        tracing::info!(path = %path.display(), count, "Loaded custom signatures");
        Ok(count)
    }
}

/// One entry of a signature file. Patterns are hex strings, spaces allowed.
#[derive(Debug, Deserialize)]
struct SignatureEntry {
    header: String,
    #[serde(default)]
    footer: Option<String>,
    #[serde(default)]
    extension: Option<String>,
    #[serde(default)]
    max_size: Option<u64>,
    #[serde(default)]
    structure: Option<Structure>,
    #[serde(default)]
    description: Option<String>,
}

/// Parse a JSON signature file: an object mapping type ids to entries
///
/// ```json
/// { "jpg": { "header": "FFD8FF", "footer": "FFD9" } }
/// ```
pub fn load_file(path: &Path) -> Result<Vec<Signature>, CatalogError> {
    let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_signatures(&content).map_err(|e| match e {
        ParseFailure::Json(source) => CatalogError::Parse {
            path: path.to_path_buf(),
            source,
        },
        ParseFailure::Catalog(e) => e,
    })
}

enum ParseFailure {
    Json(serde_json::Error),
    Catalog(CatalogError),
}

fn parse_signatures(content: &str) -> Result<Vec<Signature>, ParseFailure> {
    let entries: BTreeMap<String, SignatureEntry> =
        serde_json::from_str(content).map_err(ParseFailure::Json)?;

    let mut sigs = Vec::with_capacity(entries.len());
    for (id, entry) in entries {
        let header = decode_hex(&id, &entry.header).map_err(ParseFailure::Catalog)?;
        let mut sig = Signature::new(id.clone(), header);
        if let Some(footer) = entry.footer.as_deref() {
            sig = sig.footer(decode_hex(&id, footer).map_err(ParseFailure::Catalog)?);
        }
        if let Some(ext) = entry.extension {
            sig = sig.extension(ext);
        }
        if let Some(max) = entry.max_size {
            sig = sig.max_size(max);
        }
        if let Some(structure) = entry.structure {
            sig = sig.structure(structure);
        }
        if let Some(desc) = entry.description {
            sig = sig.description(desc);
        }
        sigs.push(sig);
    }
    Ok(sigs)
}

fn decode_hex(id: &str, pattern: &str) -> Result<Vec<u8>, CatalogError> {
    let compact: String = pattern.split_whitespace().collect();
    hex::decode(compact).map_err(|source| CatalogError::Hex {
        id: id.to_string(),
        source,
    })
}

pub fn builtin_signatures() -> Vec<Signature> {
    vec![
        Signature::new("jpeg", [0xFF, 0xD8, 0xFF])
            .extension("jpg")
            .description("JPEG image")
            .footer([0xFF, 0xD9])
            .max_size(64 * MIB)
            .structure(Structure::Jpeg),
        Signature::new("png", [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A])
            .description("PNG image")
            .footer([0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82])
            .max_size(64 * MIB)
            .structure(Structure::Png),
        Signature::new("gif", *b"GIF8")
            .description("GIF image")
            .footer([0x00, 0x3B])
            .max_size(32 * MIB)
            .structure(Structure::Gif),
        Signature::new("bmp", *b"BM")
            .description("Windows bitmap")
            .max_size(64 * MIB)
            .structure(Structure::Bmp),
        Signature::new("riff", *b"RIFF")
            .extension("riff")
            .description("RIFF container (WAV, AVI, WebP)")
            .max_size(512 * MIB)
            .structure(Structure::Riff),
        Signature::new("zip", [0x50, 0x4B, 0x03, 0x04])
            .description("ZIP archive (also DOCX, XLSX, JAR, APK)")
            .footer([0x50, 0x4B, 0x05, 0x06])
            .max_size(512 * MIB)
            .structure(Structure::Zip),
        Signature::new("pdf", *b"%PDF-")
            .description("PDF document")
            .footer(*b"%%EOF")
            .max_size(256 * MIB)
            .structure(Structure::Pdf),
        Signature::new("sqlite", *b"SQLite format 3\0")
            .extension("db")
            .description("SQLite database")
            .max_size(1024 * MIB)
            .structure(Structure::Sqlite),
        Signature::new("html", *b"<html")
            .description("HTML document")
            .footer(*b"</html>")
            .max_size(16 * MIB),
    ]
}
