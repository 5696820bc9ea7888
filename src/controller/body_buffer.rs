//! Request body buffering with spill-to-disk
//!
//! Bodies up to the threshold stay in memory. The first byte past it moves
//! everything into an anonymous temporary file that is removed when the
//! buffer is dropped.

use futures::stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Bytes, Frame};
use std::io;
use std::path::Path;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("client body error: {0}")]
    Client(String),
    #[error("spill file error: {0}")]
    Spill(#[from] io::Error),
}

#[derive(Debug)]
enum Storage {
    Memory(Vec<Bytes>),
    File { file: NamedTempFile, handle: tokio::fs::File },
}

/// A fully received request body
#[derive(Debug)]
pub struct BufferedBody {
    storage: Storage,
    len: u64,
}

impl BufferedBody {
    pub fn empty() -> Self {
        Self {
            storage: Storage::Memory(Vec::new()),
            len: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.storage, Storage::File { .. })
    }

    /// Path of the spill file, while one exists
    pub fn spill_path(&self) -> Option<&Path> {
        match &self.storage {
            Storage::File { file, .. } => Some(file.path()),
            Storage::Memory(_) => None,
        }
    }

    /// Read a body to the end, spilling past `threshold` bytes
    pub async fn collect<B>(mut body: B, threshold: usize) -> Result<Self, BufferError>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Display,
    {
        let mut buffered = Self::empty();
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| BufferError::Client(e.to_string()))?;
            if let Ok(data) = frame.into_data() {
                buffered.push(data, threshold).await?;
            }
        }
        Ok(buffered)
    }

    async fn push(&mut self, data: Bytes, threshold: usize) -> Result<(), BufferError> {
        if data.is_empty() {
            return Ok(());
        }
        self.len += data.len() as u64;

        match &mut self.storage {
            Storage::Memory(chunks) => {
                chunks.push(data);
                if self.len > threshold as u64 {
                    self.spill().await?;
                }
            }
            Storage::File { handle, .. } => handle.write_all(&data).await?,
        }
        Ok(())
    }

    async fn spill(&mut self) -> Result<(), BufferError> {
        let file = NamedTempFile::new()?;
        let mut handle = tokio::fs::File::from_std(file.reopen()?);
        if let Storage::Memory(chunks) = &self.storage {
            for chunk in chunks {
                handle.write_all(chunk).await?;
            }
        }
        debug!(path = %file.path().display(), bytes = self.len, "Request body spilled to disk");
        self.storage = Storage::File { file, handle };
        Ok(())
    }

    /// Write the whole body to `sink`
    pub async fn write_to<W>(&mut self, sink: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match &mut self.storage {
            Storage::Memory(chunks) => {
                for chunk in chunks.iter() {
                    sink.write_all(chunk).await?;
                }
            }
            Storage::File { handle, .. } => {
                handle.flush().await?;
                handle.seek(io::SeekFrom::Start(0)).await?;
                let mut buf = vec![0u8; READ_CHUNK];
                loop {
                    let n = handle.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    sink.write_all(&buf[..n]).await?;
                }
            }
        }
        Ok(())
    }

    /// The body as a stream of frames. A spill file is read back in chunks
    /// and removed once the stream is dropped.
    pub fn into_body(self) -> UnsyncBoxBody<Bytes, io::Error> {
        match self.storage {
            Storage::Memory(chunks) => {
                let frames = chunks.into_iter().map(|c| Ok::<_, io::Error>(Frame::data(c)));
                StreamBody::new(stream::iter(frames)).boxed_unsync()
            }
            Storage::File { file, handle } => {
                let frames = stream::try_unfold((file, handle, false), |(file, mut handle, rewound)| async move {
                    if !rewound {
                        handle.flush().await?;
                        handle.seek(io::SeekFrom::Start(0)).await?;
                    }
                    let mut buf = vec![0u8; READ_CHUNK];
                    let n = handle.read(&mut buf).await?;
                    if n == 0 {
                        return Ok(None);
                    }
                    buf.truncate(n);
                    Ok::<_, io::Error>(Some((Frame::data(Bytes::from(buf)), (file, handle, true))))
                });
                StreamBody::new(frames).boxed_unsync()
            }
        }
    }
}
