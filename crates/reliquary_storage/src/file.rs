//! File backend: one `MessagePack` file per key.
//!
//! Keys are escaped into file names: ASCII alphanumerics, `-` and `_` are
//! kept, every other byte becomes `%XX`. Files are written to a temporary
//! name and renamed into place.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use reliquary_foundation::{Error, ErrorContext, ErrorKind, Record, Result};

use crate::store::Backend;

const EXTENSION: &str = "msgpack";

/// Encodes a record using `MessagePack` with named fields.
///
/// # Errors
///
/// Returns a serialization error if encoding fails.
pub fn to_bytes(record: &Record) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(record).map_err(|e| Error::new(ErrorKind::Serialization(e.to_string())))
}

/// Decodes a `MessagePack` record.
///
/// # Errors
///
/// Returns a serialization error if decoding fails.
pub fn from_bytes(bytes: &[u8]) -> Result<Record> {
    rmp_serde::from_slice(bytes).map_err(|e| Error::new(ErrorKind::Serialization(e.to_string())))
}

/// Escapes a key into a file stem.
#[must_use]
pub fn escape_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            escaped.push(char::from(byte));
        } else {
            let _ = write!(escaped, "%{byte:02x}");
        }
    }
    escaped
}

/// Reverses [`escape_key`]. Returns `None` for malformed stems.
#[must_use]
pub fn unescape_key(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn io_error(action: &str, path: &Path, e: &std::io::Error) -> Error {
    Error::new(ErrorKind::Io(format!(
        "failed to {action} '{}': {e}",
        path.display()
    )))
}

/// A backend storing each record as a file in one directory.
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
    open: bool,
}

impl FileBackend {
    /// Creates a closed backend over `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            open: false,
        }
    }

    /// Creates a backend over `dir` and opens it, creating the directory if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let mut backend = Self::new(dir);
        backend.open()?;
        Ok(backend)
    }

    /// Returns the backing directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{EXTENSION}", escape_key(key)))
    }

    fn ensure_open(&self, operation: &'static str, key: &str) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::usage("file backend is closed")
                .with_context(ErrorContext::new().with_key(key).with_operation(operation)))
        }
    }
}

impl Backend for FileBackend {
    fn opens(&self) -> bool {
        true
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn open(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| io_error("create directory", &self.dir, &e))?;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn has(&self, key: &str) -> bool {
        self.open && self.path_for(key).is_file()
    }

    fn get(&self, key: &str) -> Result<Record> {
        self.ensure_open("get", key)?;
        let path = self.path_for(key);
        if !path.is_file() {
            return Err(Error::not_found("key", key));
        }
        let bytes = fs::read(&path).map_err(|e| io_error("read", &path, &e))?;
        from_bytes(&bytes).map_err(|e| e.with_context(ErrorContext::new().with_key(key)))
    }

    fn put(&mut self, key: &str, record: &Record) -> Result<()> {
        self.ensure_open("put", key)?;
        let path = self.path_for(key);
        let temp = path.with_extension("tmp");
        let bytes = to_bytes(record)?;
        fs::write(&temp, bytes).map_err(|e| io_error("write", &temp, &e))?;
        fs::rename(&temp, &path).map_err(|e| io_error("rename", &temp, &e))
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.ensure_open("delete", key)?;
        let path = self.path_for(key);
        if path.is_file() {
            fs::remove_file(&path).map_err(|e| io_error("remove", &path, &e))?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.ensure_open("keys", "")?;
        let entries = fs::read_dir(&self.dir).map_err(|e| io_error("list", &self.dir, &e))?;
        let mut keys = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| io_error("list", &self.dir, &e))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(key) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(unescape_key)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
