use std::path::PathBuf;

use anyhow::Result;
use fs4::tokio::AsyncFileExt;
use tokio::{
    fs::File,
    io::AsyncWriteExt,
    sync::{mpsc, oneshot},
};
use tracing::{debug, error, info};

use crate::fs::operations::{needs_line_break, write_atomically};

/// Disk operation queued by [RecordLog](super::record_log::RecordLog).
#[derive(Debug)]
pub enum WriteOp {
    /// One serialized record, without the trailing newline.
    Append(String),
    /// The complete canonical file content.
    Rewrite(String),
    /// Resolved once every operation queued before it has been processed.
    Flush(oneshot::Sender<()>),
}

/// Background task that owns the log file. Operations are applied strictly in submission order,
/// so an append queued after a rewrite always lands in the rewritten file.
pub struct LogWriter {
    path: PathBuf,
    receiver: mpsc::UnboundedReceiver<WriteOp>,
}

impl LogWriter {
    pub fn new(path: PathBuf, receiver: mpsc::UnboundedReceiver<WriteOp>) -> Self {
        Self { path, receiver }
    }

    /// Runs until every sender is dropped. Failures are logged and the write is dropped.
    pub async fn run(mut self) {
        while let Some(op) = self.receiver.recv().await {
            match op {
                WriteOp::Flush(done) => {
                    let _ = done.send(());
                }
                WriteOp::Append(line) => {
                    debug!("Appending record to {:?}", self.path);
                    if let Err(e) = self.append(&line).await {
                        error!("Failed to append record to {:?}: {e:?}", self.path);
                    }
                }
                WriteOp::Rewrite(content) => {
                    debug!("Rewriting {:?}", self.path);
                    if let Err(e) = write_atomically(&self.path, content.as_bytes()).await {
                        error!("Failed to rewrite {:?}: {e:?}", self.path);
                    }
                }
            }
        }
        info!("Record writer for {:?} stopped", self.path);
    }

    async fn append(&self, line: &str) -> Result<()> {
        let mut file = File::options()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await?;

        // Semi-safe acquire-release for a file
        file.lock_exclusive()?;
        let result = Self::append_with_file(&mut file, line).await;
        file.unlock_async().await?;
        result
    }

    async fn append_with_file(file: &mut File, line: &str) -> Result<()> {
        let mut buffer = Vec::with_capacity(line.len() + 2);
        // A torn final line from an earlier crash must not swallow this record.
        if needs_line_break(file).await? {
            buffer.push(b'\n');
        }
        buffer.extend_from_slice(line.as_bytes());
        buffer.push(b'\n');
        file.write_all(&buffer).await?;
        file.flush().await?;
        Ok(())
    }
}
