//! Storage for streamed file parts.
//!
//! The multipart reader never holds a whole file in memory: it opens a part
//! on an [`UploadSink`], pushes body chunks as they arrive and finally gets
//! back an [`UploadedFile`] handle. The handle owns the stored file until
//! the application [`persist`](UploadedFile::persist)s it; a handle dropped
//! without being persisted deletes its file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// Errors produced by upload storage.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to create upload file in {dir}: {source}")]
    Create {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write upload {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to move upload to {dest}: {source}")]
    Persist {
        dest: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no upload part is open")]
    NoOpenPart,
}

/// Metadata taken from a part's headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartInfo {
    /// `name` parameter of `Content-Disposition`.
    pub field_name: String,
    /// `filename` parameter of `Content-Disposition`; present for file parts.
    pub file_name: Option<String>,
    /// The part's own `Content-Type`.
    pub content_type: Option<String>,
}

impl PartInfo {
    /// Whether the part carried a `filename` and goes to the sink.
    pub fn is_file(&self) -> bool {
        self.file_name.is_some()
    }
}

/// Destination for file parts. One part is open at a time.
pub trait UploadSink: Send {
    /// Starts storing a new part.
    fn begin(&mut self, part: &PartInfo) -> Result<(), UploadError>;

    /// Appends bytes to the open part.
    fn write(&mut self, chunk: &[u8]) -> Result<(), UploadError>;

    /// Closes the open part and hands out its handle.
    fn finish(&mut self) -> Result<UploadedFile, UploadError>;

    /// Drops the open part, if any, and whatever was stored for it.
    fn abort(&mut self);
}

/// A stored file part.
#[derive(Debug)]
pub struct UploadedFile {
    info: PartInfo,
    path: PathBuf,
    size: u64,
    persisted: bool,
}

impl UploadedFile {
    /// The form field name from `Content-Disposition`.
    pub fn field_name(&self) -> &str {
        &self.info.field_name
    }

    /// The client-side file name, if one was sent.
    pub fn file_name(&self) -> Option<&str> {
        self.info.file_name.as_deref()
    }

    /// The part's own `Content-Type`.
    pub fn content_type(&self) -> Option<&str> {
        self.info.content_type.as_deref()
    }

    /// Where the data currently lives.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of bytes stored.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Moves the file to `dest` and gives up ownership of it.
    ///
    /// Falls back to copy-and-delete when a rename is not possible (for
    /// instance across file systems).
    ///
    /// # Errors
    ///
    /// [`UploadError::Persist`] if neither rename nor copy succeeds.
    pub fn persist(mut self, dest: impl AsRef<Path>) -> Result<PathBuf, UploadError> {
        let dest = dest.as_ref().to_path_buf();
        if fs::rename(&self.path, &dest).is_err() {
            fs::copy(&self.path, &dest).map_err(|source| UploadError::Persist {
                dest: dest.clone(),
                source,
            })?;
            let _ = fs::remove_file(&self.path);
        }
        self.persisted = true;
        Ok(dest)
    }
}

impl Drop for UploadedFile {
    fn drop(&mut self) {
        if !self.persisted {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "failed to remove upload");
                }
            }
        }
    }
}

struct OpenPart {
    info: PartInfo,
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
}

/// Stores each part as its own file in a fixed directory.
///
/// The file is named after the sanitized client file name; when that name is
/// empty or already taken, a random name is used instead.
pub struct DiskSink {
    dir: PathBuf,
    open: Option<OpenPart>,
}

impl DiskSink {
    /// Creates a sink writing into `dir`. The directory is created lazily.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            open: None,
        }
    }

    fn create(&self, part: &PartInfo) -> Result<(PathBuf, File), UploadError> {
        fs::create_dir_all(&self.dir).map_err(|source| UploadError::Create {
            dir: self.dir.clone(),
            source,
        })?;

        let preferred = part
            .file_name
            .as_deref()
            .map(sanitize_file_name)
            .filter(|name| !name.is_empty());
        let candidates = preferred
            .into_iter()
            .chain(std::iter::repeat_with(random_name).take(8));

        let mut last_error = None;
        for name in candidates {
            let path = self.dir.join(&name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => last_error = Some(e),
                Err(source) => {
                    return Err(UploadError::Create {
                        dir: self.dir.clone(),
                        source,
                    });
                }
            }
        }
        Err(UploadError::Create {
            dir: self.dir.clone(),
            source: last_error.unwrap_or_else(|| ErrorKind::AlreadyExists.into()),
        })
    }
}

impl UploadSink for DiskSink {
    fn begin(&mut self, part: &PartInfo) -> Result<(), UploadError> {
        self.abort();
        let (path, file) = self.create(part)?;
        debug!(field = %part.field_name, path = %path.display(), "upload started");
        self.open = Some(OpenPart {
            info: part.clone(),
            path,
            writer: BufWriter::new(file),
            size: 0,
        });
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), UploadError> {
        let part = self.open.as_mut().ok_or(UploadError::NoOpenPart)?;
        part.writer
            .write_all(chunk)
            .map_err(|source| UploadError::Write {
                path: part.path.clone(),
                source,
            })?;
        part.size += chunk.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<UploadedFile, UploadError> {
        let mut part = self.open.take().ok_or(UploadError::NoOpenPart)?;
        // Build the handle first so a failed flush still cleans up the file.
        let file = UploadedFile {
            info: part.info,
            path: part.path,
            size: part.size,
            persisted: false,
        };
        part.writer.flush().map_err(|source| UploadError::Write {
            path: file.path.clone(),
            source,
        })?;
        debug!(path = %file.path.display(), size = file.size, "upload stored");
        Ok(file)
    }

    fn abort(&mut self) {
        if let Some(part) = self.open.take() {
            drop(part.writer);
            let _ = fs::remove_file(&part.path);
        }
    }
}

impl Drop for DiskSink {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Keeps only the final path component and characters safe in a file name.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    cleaned.trim_start_matches('.').to_owned()
}

fn random_name() -> String {
    format!("upload-{:016x}", fastrand::u64(..))
}
