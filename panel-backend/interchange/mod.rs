//! Pipeline output files exchanged through the cache directory.
//!
//! Names coming from clients are percent-decoded, checked against an
//! allow-listed extension set and required to be a bare file name, so every
//! resolved path stays directly inside the cache directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;

pub const ALLOWED_EXTENSIONS: &[&str] = &["json", "md", "xlsx", "txt", "csv"];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InterchangeError {
    #[error("File name is required")]
    MissingName,

    #[error("Invalid file name")]
    InvalidName,

    #[error("File {0} not found")]
    NotFound(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("{0}")]
    Io(String),
}

impl InterchangeError {
    pub fn status_code(&self) -> u16 {
        match self {
            InterchangeError::MissingName | InterchangeError::InvalidName => 400,
            InterchangeError::NotFound(_) => 404,
            InterchangeError::PermissionDenied => 403,
            InterchangeError::Io(_) => 500,
        }
    }

    fn from_io(err: std::io::Error, name: &str, action: &str) -> Self {
        match err.kind() {
            ErrorKind::NotFound => InterchangeError::NotFound(name.to_string()),
            ErrorKind::PermissionDenied => InterchangeError::PermissionDenied,
            _ => InterchangeError::Io(format!("Error {action} file: {err}")),
        }
    }
}

/// Decode `raw` and check it names an allowed file directly inside the cache
/// directory. Returns the decoded name.
pub fn validate_file_name(raw: &str) -> Result<String, InterchangeError> {
    if raw.is_empty() {
        return Err(InterchangeError::MissingName);
    }

    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| InterchangeError::InvalidName)?
        .into_owned();

    let Some((stem, extension)) = decoded.rsplit_once('.') else {
        return Err(InterchangeError::InvalidName);
    };
    let stem_ok = !stem.is_empty()
        && stem
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    let extension_ok = ALLOWED_EXTENSIONS
        .iter()
        .any(|allowed| extension.eq_ignore_ascii_case(allowed));
    if !stem_ok || !extension_ok {
        return Err(InterchangeError::InvalidName);
    }

    let is_basename = Path::new(&decoded)
        .file_name()
        .is_some_and(|name| name == decoded.as_str());
    if !is_basename {
        return Err(InterchangeError::InvalidName);
    }

    Ok(decoded)
}

/// `Content-Type` header value for a download of `name`.
pub fn content_type(name: &str) -> &'static str {
    let extension = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("md") => "text/markdown; charset=utf-8",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("json") => "application/json; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// An opened file ready to be streamed to a client.
pub struct Download {
    pub name: String,
    pub size: u64,
    pub content_type: &'static str,
    pub file: tokio::fs::File,
}

/// The cache directory the pipeline writes its outputs into.
#[derive(Debug, Clone)]
pub struct InterchangeDir {
    root: PathBuf,
}

impl InterchangeDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of the `.json` files in the directory, sorted.
    pub async fn list(&self) -> Result<Vec<String>, InterchangeError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| InterchangeError::Io(format!("Error listing files: {e}")))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| InterchangeError::Io(format!("Error listing files: {e}")))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".json") {
                    files.push(name.to_string());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    pub async fn open(&self, raw_name: &str) -> Result<Download, InterchangeError> {
        let name = validate_file_name(raw_name)?;
        let path = self.root.join(&name);

        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| InterchangeError::from_io(e, &name, "reading"))?;
        let metadata = file
            .metadata()
            .await
            .map_err(|e| InterchangeError::from_io(e, &name, "reading"))?;
        if !metadata.is_file() {
            return Err(InterchangeError::NotFound(name));
        }

        Ok(Download {
            content_type: content_type(&name),
            size: metadata.len(),
            name,
            file,
        })
    }

    /// Remove a file; returns the decoded name that was deleted.
    pub async fn delete(&self, raw_name: &str) -> Result<String, InterchangeError> {
        let name = validate_file_name(raw_name)?;
        let path = self.root.join(&name);

        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| InterchangeError::from_io(e, &name, "deleting"))?;

        tracing::info!(path = %path.display(), "deleted interchange file");
        Ok(name)
    }
}
