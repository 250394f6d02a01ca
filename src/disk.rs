//! Piece persistence. The orchestrator is the only writer; workers hand
//! over completed buffers and never touch the filesystem.

use std::path::PathBuf;

use tokio::fs;
use tracing::debug;

use crate::error::Error;

#[derive(Debug, Clone)]
pub struct Disk {
    download_dir: PathBuf,
}

impl Disk {
    pub fn new(download_dir: PathBuf) -> Self {
        Self { download_dir }
    }

    /// Write one completed piece as `piece_<index>`, a single write of
    /// the whole buffer. An existing file is overwritten, re-downloads
    /// of the same piece are harmless.
    pub async fn write_piece(
        &self,
        piece_index: u32,
        buf: &[u8],
    ) -> Result<PathBuf, Error> {
        fs::create_dir_all(&self.download_dir).await.map_err(|_| {
            Error::FolderOpenError(
                self.download_dir.to_string_lossy().into_owned(),
            )
        })?;

        let path = self.download_dir.join(format!("piece_{piece_index}"));
        fs::write(&path, buf).await?;

        debug!("wrote {} bytes to {}", buf.len(), path.display());
        Ok(path)
    }
}
