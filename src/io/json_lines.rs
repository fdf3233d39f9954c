//! Line-delimited JSON file endpoint.
//!
//! Each line holds one JSON value. Reading stops at end of file, which also
//! releases the underlying handle. Malformed lines and unserializable values
//! surface as [`PipeError::Decode`] / [`PipeError::Encode`] and are recorded on
//! the endpoint's status.

use crate::error::{PipeError, Result};
use crate::io::{Input, Output};
use crate::status::{Source, StatusTracker};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;

type Reader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type Writer = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// JSON-lines reader and/or writer.
pub struct JsonLinesIo<T> {
    reader: Mutex<Option<Reader>>,
    writer: Mutex<Option<Writer>>,
    /// Write string values verbatim instead of as JSON strings.
    raw_strings: bool,
    lines_read: AtomicU64,
    bytes_read: Arc<AtomicU64>,
    status: Arc<StatusTracker>,
    _item: PhantomData<fn() -> T>,
}

impl<T> JsonLinesIo<T> {
    fn build(reader: Option<Reader>, writer: Option<Writer>) -> Self {
        let status = StatusTracker::new();
        status
            .counter("read_count")
            .counter("write_count")
            .counter("error_count")
            .flag("closed");
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            raw_strings: false,
            lines_read: AtomicU64::new(0),
            bytes_read: Arc::new(AtomicU64::new(0)),
            status,
            _item: PhantomData,
        }
    }

    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self::build(Some(BufReader::new(reader)), None)
    }

    pub fn from_writer<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        Self::build(None, Some(BufWriter::new(writer)))
    }

    /// Open an existing file for reading, tracking `percentage_read` by bytes.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        let size = file.metadata().await?.len();
        let io = Self::from_reader(file);

        let position = Arc::clone(&io.bytes_read);
        io.status.percentage(
            "read",
            Source::probe(move || position.load(Ordering::Relaxed)),
            Source::probe(move || size),
        );
        Ok(io)
    }

    /// Create (or truncate) a file for writing.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = tokio::fs::File::create(path.as_ref()).await?;
        Ok(Self::from_writer(file))
    }

    pub fn with_raw_strings(mut self, raw_strings: bool) -> Self {
        self.raw_strings = raw_strings;
        self
    }

    fn record_error(&self, err: &PipeError) {
        self.status.inc("error_count");
        self.status.error(err, None);
    }
}

#[async_trait]
impl<T> Input<T> for JsonLinesIo<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn read(&self) -> Result<Option<T>> {
        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Ok(None);
        };

        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            *guard = None;
            self.status.set_flag("closed", true);
            tracing::debug!("json lines input exhausted");
            return Ok(None);
        }
        drop(guard);

        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        let line_no = self.lines_read.fetch_add(1, Ordering::Relaxed) + 1;
        self.status.inc("read_count");

        serde_json::from_str(line.trim_end_matches(['\n', '\r'])).map(Some).map_err(|source| {
            let err = PipeError::Decode {
                line: line_no,
                source,
            };
            self.record_error(&err);
            err
        })
    }

    fn status(&self) -> &Arc<StatusTracker> {
        &self.status
    }
}

#[async_trait]
impl<T> Output<T> for JsonLinesIo<T>
where
    T: Serialize + Send + 'static,
{
    async fn write(&self, item: T) -> Result<()> {
        let encoded = if self.raw_strings {
            serde_json::to_value(&item).map(|value| match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
        } else {
            serde_json::to_string(&item)
        };
        let mut line = match encoded {
            Ok(line) => line,
            Err(source) => {
                let err = PipeError::Encode(source);
                self.record_error(&err);
                return Err(err);
            }
        };
        line.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            PipeError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "json lines output is closed or read-only",
            ))
        })?;
        writer.write_all(line.as_bytes()).await?;
        self.status.inc("write_count");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.status.set_flag("closed", true);
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.flush().await?;
            writer.shutdown().await?;
        }
        self.reader.lock().await.take();
        Ok(())
    }

    fn status(&self) -> &Arc<StatusTracker> {
        &self.status
    }
}
