//! multipart/form-data encoding

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

use crate::error::{Error, Result};

const CRLF: &str = "\r\n";

/// Content of one form part
#[derive(Clone, Debug)]
pub enum PartBody {
    /// In-memory bytes
    Bytes(Bytes),
    /// File read when the form is encoded
    File(PathBuf),
}

/// One named part of a form
#[derive(Clone, Debug)]
pub struct Part {
    /// Form field name
    pub name: String,
    /// `filename` parameter of the Content-Disposition header
    pub filename: Option<String>,
    /// Content-Type of the part
    pub content_type: Option<String>,
    /// Part content
    pub body: PartBody,
}

impl Part {
    fn header(&self, boundary: &str) -> String {
        let mut header = format!(
            "--{boundary}{CRLF}Content-Disposition: form-data; name=\"{}\"",
            escape_quoted(&self.name)
        );
        if let Some(filename) = &self.filename {
            header.push_str(&format!("; filename=\"{}\"", escape_quoted(filename)));
        }
        header.push_str(CRLF);
        if let Some(content_type) = &self.content_type {
            header.push_str(&format!("Content-Type: {content_type}{CRLF}"));
        }
        header.push_str(CRLF);
        header
    }

    async fn body_len(&self) -> Result<u64> {
        match &self.body {
            PartBody::Bytes(bytes) => Ok(bytes.len() as u64),
            PartBody::File(path) => Ok(metadata(path).await?.len()),
        }
    }
}

/// A multipart/form-data body
///
/// Parts are written in insertion order. File parts are only read when the
/// form is encoded.
#[derive(Clone, Debug)]
pub struct MultipartForm {
    boundary: String,
    parts: Vec<Part>,
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartForm {
    /// Empty form with a random boundary
    pub fn new() -> Self {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        Self::with_boundary(format!("wirekit-{token}"))
    }

    /// Empty form with a fixed boundary
    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            parts: Vec::new(),
        }
    }

    /// Add a plain text field
    pub fn text(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.part(Part {
            name: name.into(),
            filename: None,
            content_type: None,
            body: PartBody::Bytes(Bytes::from(value.into())),
        })
    }

    /// Add in-memory bytes sent as a named file
    pub fn bytes(
        self,
        name: impl Into<String>,
        bytes: impl Into<Bytes>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        self.part(Part {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: Some(content_type.into()),
            body: PartBody::Bytes(bytes.into()),
        })
    }

    /// Add a file from disk, named after its final path component
    pub fn file(
        self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        content_type: impl Into<String>,
    ) -> Self {
        let path = path.into();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string);
        self.part(Part {
            name: name.into(),
            filename,
            content_type: Some(content_type.into()),
            body: PartBody::File(path),
        })
    }

    /// Add a fully specified part
    pub fn part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    /// Boundary separating the parts
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Parts in encoding order
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Value for the request's Content-Type header
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    fn closing(&self) -> String {
        format!("--{}--{CRLF}", self.boundary)
    }

    /// Size of the encoded form in bytes
    pub async fn content_length(&self) -> Result<u64> {
        let mut total = self.closing().len() as u64;
        for part in &self.parts {
            total += part.header(&self.boundary).len() as u64;
            total += part.body_len().await?;
            total += CRLF.len() as u64;
        }
        Ok(total)
    }

    /// Encode the whole form into memory
    pub async fn encode(&self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        for part in &self.parts {
            out.put_slice(part.header(&self.boundary).as_bytes());
            match &part.body {
                PartBody::Bytes(bytes) => out.put_slice(bytes),
                PartBody::File(path) => out.put_slice(&read(path).await?),
            }
            out.put_slice(CRLF.as_bytes());
        }
        out.put_slice(self.closing().as_bytes());
        Ok(out.freeze())
    }

    /// Stream the encoded form to `destination`
    ///
    /// File parts are copied through a buffer of `buffer_size` bytes, so
    /// memory use stays bounded regardless of attachment size. Returns the
    /// number of bytes written.
    pub async fn write_to_file(&self, destination: &Path, buffer_size: usize) -> Result<u64> {
        let buffer_size = buffer_size.max(1);
        let file = tokio::fs::File::create(destination).await?;
        let mut writer = BufWriter::with_capacity(buffer_size, file);
        let mut buffer = vec![0u8; buffer_size];
        let mut written: u64 = 0;

        for part in &self.parts {
            let header = part.header(&self.boundary);
            writer.write_all(header.as_bytes()).await?;
            written += header.len() as u64;

            match &part.body {
                PartBody::Bytes(bytes) => {
                    writer.write_all(bytes).await?;
                    written += bytes.len() as u64;
                }
                PartBody::File(path) => {
                    let mut source = open(path).await?;
                    loop {
                        let n = source.read(&mut buffer).await?;
                        if n == 0 {
                            break;
                        }
                        writer.write_all(&buffer[..n]).await?;
                        written += n as u64;
                    }
                }
            }
            writer.write_all(CRLF.as_bytes()).await?;
            written += CRLF.len() as u64;
        }

        let closing = self.closing();
        writer.write_all(closing.as_bytes()).await?;
        written += closing.len() as u64;
        writer.flush().await?;

        tracing::debug!(
            path = %destination.display(),
            bytes = written,
            parts = self.parts.len(),
            "multipart form written to file"
        );
        Ok(written)
    }
}

fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn not_found(path: &Path, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::FileNotFound(path.to_path_buf())
    } else {
        Error::Io(e)
    }
}

async fn metadata(path: &Path) -> Result<std::fs::Metadata> {
    tokio::fs::metadata(path).await.map_err(|e| not_found(path, e))
}

async fn read(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| not_found(path, e))
}

async fn open(path: &Path) -> Result<tokio::fs::File> {
    tokio::fs::File::open(path).await.map_err(|e| not_found(path, e))
}
