//! Read-once plaintext handed to a caller

use crate::error::{Error, Result};
use crate::staging::StagingPath;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

/// A staged file opened for reading.
///
/// The file is removed as soon as the reader hits end-of-file, or when the
/// value is dropped, whichever comes first. Dropping mid-stream (a caller
/// that went away) therefore still purges the file.
#[derive(Debug)]
pub struct EphemeralFile {
    file: File,
    staged: Option<StagingPath>,
}

impl EphemeralFile {
    /// Open a staged file; if opening fails the staged path is released
    pub async fn open(staged: StagingPath) -> Result<Self> {
        let file = File::open(staged.path())
            .await
            .map_err(|e| Error::CipherIo(format!("failed to open {:?}: {}", staged.path(), e)))?;
        Ok(EphemeralFile {
            file,
            staged: Some(staged),
        })
    }

    /// Whether the backing file has already been removed
    pub fn is_released(&self) -> bool {
        self.staged.is_none()
    }
}

impl AsyncRead for EphemeralFile {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let polled = Pin::new(&mut this.file).poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = polled {
            if buf.filled().len() == before && buf.remaining() > 0 {
                if let Some(staged) = this.staged.take() {
                    debug!("Fully consumed {:?}", staged.path());
                    drop(staged);
                }
            }
        }
        polled
    }
}
