//! Writes validated extents to the destination directory.
//!
//! Each file is copied to `<name>.partial` and renamed into place only once
//! every byte has been written and synced, so an interrupted run never
//! leaves a truncated file under a final name.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::OverwritePolicy;
use crate::carve::validate::ValidatedExtent;
use crate::error::{RecoveryError, Result};
use crate::reader::BlockReader;

/// Copy chunk size (1 MiB)
const COPY_CHUNK: usize = 1024 * 1024;

/// Bytes handed to `infer` for content sniffing
const SNIFF_LEN: usize = 8192;

pub const PARTIAL_SUFFIX: &str = "partial";

/// A file that made it to the destination
#[derive(Debug, Clone)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub size: u64,
    pub blake3: String,
    pub detected_type: Option<String>,
}

pub struct OutputWriter {
    dir: PathBuf,
    policy: OverwritePolicy,
    verify_types: bool,
    seq: u64,
    buf: Vec<u8>,
}

impl OutputWriter {
    /// Create the destination if needed and apply the overwrite policy
    pub fn prepare(dir: &Path, policy: OverwritePolicy, verify_types: bool) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| RecoveryError::destination(dir, None, e))?;

        if policy == OverwritePolicy::Refuse {
            let mut entries = fs::read_dir(dir).map_err(|e| RecoveryError::destination(dir, None, e))?;
            if entries.next().is_some() {
                return Err(RecoveryError::destination(
                    dir,
                    None,
                    io::Error::new(io::ErrorKind::AlreadyExists, "destination is not empty"),
                ));
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            policy,
            verify_types,
            seq: 0,
            buf: Vec::with_capacity(COPY_CHUNK),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy the extent's bytes from `reader` into a new file.
    ///
    /// Read errors are returned as-is (non-fatal `IoFailure` or fatal
    /// `SourceUnavailable`); write errors are `DestinationUnwritable`.
    /// The partial file is removed on any error.
    pub fn write(&mut self, reader: &BlockReader, found: &ValidatedExtent) -> Result<WrittenFile> {
        self.seq += 1;
        let extent = &found.extent;
        let name = file_name(&extent.type_id, self.seq, extent.start, &found.extension);
        let path = self.resolve(&name, extent.start)?;
        let partial = partial_path(&path);

        let mut file = File::create(&partial)
            .map_err(|e| RecoveryError::destination(&partial, Some(extent.start), e))?;

        let copied = self.copy_range(reader, &mut file, &partial, extent.start, extent.end);
        drop(file);

        let (blake3, detected_type) = match copied {
            Ok(v) => v,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&partial, &path) {
            let _ = fs::remove_file(&partial);
            return Err(RecoveryError::destination(&path, Some(extent.start), e));
        }

        Ok(WrittenFile {
            path,
            size: extent.len(),
            blake3,
            detected_type,
        })
    }

    fn copy_range(
        &mut self,
        reader: &BlockReader,
        file: &mut File,
        partial: &Path,
        start: u64,
        end: u64,
    ) -> Result<(String, Option<String>)> {
        let mut hasher = blake3::Hasher::new();
        let mut detected = None;
        let mut pos = start;

        while pos < end {
            let want = ((end - pos) as usize).min(COPY_CHUNK);
            let n = reader.read_into(pos, &mut self.buf, want)?;
            if n < want {
                return Err(RecoveryError::IoFailure {
                    offset: pos + n as u64,
                    source: io::Error::new(io::ErrorKind::UnexpectedEof, "source ended mid-file"),
                });
            }
            if pos == start && self.verify_types {
                detected = infer::get(&self.buf[..n.min(SNIFF_LEN)]).map(|k| k.extension().to_string());
            }
            file.write_all(&self.buf)
                .map_err(|e| RecoveryError::destination(partial, Some(pos), e))?;
            hasher.update(&self.buf);
            pos += n as u64;
        }

        file.sync_all()
            .map_err(|e| RecoveryError::destination(partial, Some(start), e))?;
        Ok((hasher.finalize().to_hex().to_string(), detected))
    }

    /// Final path for `name` under the overwrite policy
    fn resolve(&self, name: &str, offset: u64) -> Result<PathBuf> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(path);
        }
        match self.policy {
            OverwritePolicy::Overwrite => Ok(path),
            OverwritePolicy::Refuse => Err(RecoveryError::destination(
                &path,
                Some(offset),
                io::Error::new(io::ErrorKind::AlreadyExists, "file already exists"),
            )),
            OverwritePolicy::Rename => {
                let (stem, ext) = match name.rsplit_once('.') {
                    Some((stem, ext)) => (stem, format!(".{ext}")),
                    None => (name, String::new()),
                };
                let mut n = 1u32;
                loop {
                    let candidate = self.dir.join(format!("{stem}-{n}{ext}"));
                    if !candidate.exists() {
                        return Ok(candidate);
                    }
                    n += 1;
                }
            }
        }
    }
}

/// `<type>_<seq>_<offset hex>.<ext>`
pub fn file_name(type_id: &str, seq: u64, offset: u64, extension: &str) -> String {
    let ext = sanitize_component(extension).to_ascii_lowercase();
    format!("{}_{:06}_{:012x}.{}", sanitize_component(type_id), seq, offset, ext)
}

pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    path.with_file_name(name)
}

fn sanitize_component(value: &str) -> String {
    let out: String = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        "unknown".to_string()
    } else {
        out
    }
}
