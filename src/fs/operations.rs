use std::{
    ffi::OsString,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Result;
use tokio::{
    fs::File,
    io::{self, AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWriteExt},
};

/// Moves backwards in a file to beginning of a previous line.
/// Useful for reading the newest entry of an append-only log.
pub async fn seek_line_backwards(
    file: &mut (impl AsyncSeek + AsyncRead + Unpin),
    buffer: &mut [u8],
) -> Result<(), io::Error> {
    // We skip first new line that is right before the buffer, so that reading doesn't get stuck.
    // For example: need_to_read_this\nwe_are_here_now\n
    let mut need_to_skip = 1usize;
    loop {
        let leftover = file.stream_position().await?;
        if leftover == 0 {
            return Ok(());
        }
        let next_chunk = u64::min(leftover, buffer.len() as u64) as usize;
        file.seek(std::io::SeekFrom::Current(-(next_chunk as i64)))
            .await?;

        file.read_exact(&mut buffer[..next_chunk]).await?;
        let iter = buffer[..next_chunk].iter().rev().enumerate();
        let iter = iter.skip(need_to_skip);
        for (index, value) in iter {
            if *value == b'\n' {
                file.seek(std::io::SeekFrom::Current(-(index as i64)))
                    .await?;
                return Ok(());
            }
        }

        need_to_skip = need_to_skip.saturating_sub(1);
        file.seek(std::io::SeekFrom::Current(-(next_chunk as i64)))
            .await?;
    }
}

/// Reads the last non-empty line of a line-delimited file without reading the rest of it.
/// Returns `None` when the file is missing or empty.
pub async fn read_last_line(path: &Path) -> Result<Option<String>, io::Error> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    file.seek(std::io::SeekFrom::End(0)).await?;
    let mut buffer = vec![0; 1024];
    loop {
        let end = file.stream_position().await?;
        if end == 0 {
            return Ok(None);
        }
        seek_line_backwards(&mut file, &mut buffer).await?;
        let start = file.stream_position().await?;
        let mut line = vec![0; (end - start) as usize];
        file.read_exact(&mut line).await?;
        let line = String::from_utf8_lossy(&line);
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Ok(Some(trimmed.to_string()));
        }
        // Blank trailing line, keep walking backwards.
        file.seek(std::io::SeekFrom::Start(start)).await?;
    }
}

/// Whether a non-empty file is missing its final `\n`. A crash mid-append leaves such a tail,
/// and the next append has to start on a fresh line.
pub async fn needs_line_break(file: &mut (impl AsyncSeek + AsyncRead + Unpin)) -> Result<bool, io::Error> {
    let len = file.seek(std::io::SeekFrom::End(0)).await?;
    if len == 0 {
        return Ok(false);
    }
    file.seek(std::io::SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

/// Replaces `path` wholesale. Content goes to a sibling temporary file first and is renamed over
/// the target, so readers never observe a half-written file.
pub async fn write_atomically(path: &Path, content: &[u8]) -> Result<(), io::Error> {
    let temporary = sibling_with_suffix(path, ".tmp");
    let mut file = File::create(&temporary).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&temporary, path).await
}

/// `records.json` + `.bak` -> `records.json.bak`.
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Size of a file in bytes, `None` when it doesn't exist.
pub async fn file_size(path: &Path) -> Result<Option<u64>, io::Error> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(Some(metadata.len())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use anyhow::Result;

    use tempfile::{tempdir, tempfile};
    use tokio::io::AsyncSeekExt;

    use crate::fs::operations::{
        file_size, needs_line_break, read_last_line, seek_line_backwards, sibling_with_suffix,
        write_atomically,
    };

    #[tokio::test]
    async fn test_seek_line_backwards_reaches_start() -> Result<()> {
        let mut file = tempfile()?;
        file.write_all(b"{\"id\":1}\n{\"id\":2}\n{\"id\":3}")?;

        let mut file = tokio::fs::File::from_std(file);
        file.seek(std::io::SeekFrom::End(0)).await?;

        for _ in 0..3 {
            seek_line_backwards(&mut file, vec![0; 4].as_mut_slice()).await?;
        }

        assert_eq!(file.stream_position().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_last_line_skips_trailing_blank_lines() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, "{\"id\":1}\n{\"id\":2}\n\n")?;

        assert_eq!(read_last_line(&path).await?.as_deref(), Some("{\"id\":2}"));
        Ok(())
    }

    #[tokio::test]
    async fn test_read_last_line_single_unterminated_line() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, "{\"id\":7}")?;

        assert_eq!(read_last_line(&path).await?.as_deref(), Some("{\"id\":7}"));
        Ok(())
    }

    #[tokio::test]
    async fn test_read_last_line_missing_or_empty() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("log.jsonl");
        assert_eq!(read_last_line(&path).await?, None);

        std::fs::write(&path, "")?;
        assert_eq!(read_last_line(&path).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_needs_line_break() -> Result<()> {
        let mut file = tempfile()?;
        let mut handle = tokio::fs::File::from_std(file.try_clone()?);
        assert!(!needs_line_break(&mut handle).await?);

        file.write_all(b"{\"id\":1}\n{\"id\":")?;
        assert!(needs_line_break(&mut handle).await?);

        file.write_all(b"2}\n")?;
        assert!(!needs_line_break(&mut handle).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_write_atomically_replaces_content() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "old content that is longer")?;

        write_atomically(&path, b"new").await?;

        assert_eq!(std::fs::read_to_string(&path)?, "new");
        assert!(!sibling_with_suffix(&path, ".tmp").exists());
        assert_eq!(file_size(&path).await?, Some(3));
        assert_eq!(file_size(&dir.path().join("missing")).await?, None);
        Ok(())
    }

    #[test]
    fn test_sibling_with_suffix() {
        let path = std::path::Path::new("/data/records.json");
        assert_eq!(
            sibling_with_suffix(path, ".bak"),
            std::path::PathBuf::from("/data/records.json.bak")
        );
    }
}
