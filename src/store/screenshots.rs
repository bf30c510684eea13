//! Moves inline screenshots out of records and into date-bucketed files.
//!
//! Layout: `<base>/<YYYY-MM-DD>/<YYYYMMDD>_<HHMMSS>_<owner>_<index>.<ext>` where the owner is the
//! record id, or `manual` for captures taken outside a record. Records refer to the files as
//! `screenshot://<YYYY-MM-DD>/<filename>`.

use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Local, NaiveDate, Utc};
use futures::future::join_all;
use tracing::{debug, warn};

use crate::{
    error::{CoreError, CoreResult},
    utils::time::{date_to_bucket_name, local_from_millis},
};

use super::entities::Record;

pub const SCREENSHOT_SCHEME: &str = "screenshot://";

/// Result of [ScreenshotMaterializer::materialize].
#[derive(Debug, Clone, PartialEq)]
pub enum Materialized {
    /// Nothing needed to change, this is the input record.
    Unchanged(Record),
    /// At least one entry now points at a file.
    Rewritten(Record),
}

impl Materialized {
    pub fn changed(&self) -> bool {
        matches!(self, Materialized::Rewritten(_))
    }

    pub fn into_record(self) -> Record {
        match self {
            Materialized::Unchanged(record) | Materialized::Rewritten(record) => record,
        }
    }
}

pub struct ScreenshotMaterializer {
    base_dir: PathBuf,
}

impl ScreenshotMaterializer {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Writes every inline image of `record` to disk. Entries that are already references are
    /// kept as they are, and an image that fails to write stays inline.
    pub async fn materialize(&self, record: Record) -> Materialized {
        if !record.screenshots.iter().any(|s| is_inline(s)) {
            return Materialized::Unchanged(record);
        }

        let taken_at = local_from_millis(record.id);
        let owner = record.id.to_string();
        let writes = record
            .screenshots
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let owner = owner.as_str();
                async move {
                    if !is_inline(entry) {
                        return entry.clone();
                    }
                    match self.store(entry, taken_at, owner, index).await {
                        Ok(reference) => reference,
                        Err(e) => {
                            warn!("Keeping screenshot {index} of record {owner} inline: {e}");
                            entry.clone()
                        }
                    }
                }
            });
        let screenshots = join_all(writes).await;

        if screenshots == record.screenshots {
            Materialized::Unchanged(record)
        } else {
            Materialized::Rewritten(Record {
                screenshots,
                ..record
            })
        }
    }

    /// Stores a capture that doesn't belong to a record yet and returns its reference.
    pub async fn save_manual_capture(&self, data_uri: &str, at: DateTime<Utc>) -> CoreResult<String> {
        let index = at.timestamp_subsec_millis() as usize;
        self.store(data_uri, at.with_timezone(&Local), "manual", index)
            .await
    }

    /// Maps a `screenshot://date/filename` reference back to its file. Returns `None` for
    /// anything that isn't a well-formed reference inside the base directory.
    pub fn resolve_reference(&self, reference: &str) -> Option<PathBuf> {
        let relative = reference.strip_prefix(SCREENSHOT_SCHEME)?;
        let (bucket, file_name) = relative.split_once('/')?;
        NaiveDate::parse_from_str(bucket, "%Y-%m-%d").ok()?;
        let safe_name = !file_name.is_empty()
            && !file_name.contains(['/', '\\'])
            && file_name != "."
            && file_name != "..";
        safe_name.then(|| self.base_dir.join(bucket).join(file_name))
    }

    async fn store(
        &self,
        data_uri: &str,
        taken_at: DateTime<Local>,
        owner: &str,
        index: usize,
    ) -> CoreResult<String> {
        let image = InlineImage::parse(data_uri)?;
        let bucket = date_to_bucket_name(taken_at.date_naive());
        let file_name = format!(
            "{}_{owner}_{index}.{}",
            taken_at.format("%Y%m%d_%H%M%S"),
            image.extension
        );

        let dir = self.base_dir.join(&bucket);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(&file_name), &image.bytes).await?;
        debug!("Stored screenshot {bucket}/{file_name}");

        Ok(format!("{SCREENSHOT_SCHEME}{bucket}/{file_name}"))
    }
}

fn is_inline(entry: &str) -> bool {
    entry.starts_with("data:")
}

struct InlineImage {
    extension: &'static str,
    bytes: Vec<u8>,
}

impl InlineImage {
    /// Parses `data:image/<type>;base64,<payload>`.
    fn parse(data_uri: &str) -> CoreResult<Self> {
        let (header, payload) = data_uri
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(','))
            .ok_or(CoreError::NotInlineImage)?;
        let mime = header
            .strip_suffix(";base64")
            .ok_or(CoreError::NotInlineImage)?;
        let bytes = STANDARD.decode(payload.trim())?;
        Ok(Self {
            extension: extension_for(mime),
            bytes,
        })
    }
}

fn extension_for(mime: &str) -> &'static str {
    match mime.to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        _ => "png",
    }
}
