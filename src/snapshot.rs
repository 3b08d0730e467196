//! Repository snapshots: zstd-compressed tars of a working checkout.
//!
//! A snapshot is built from a temporary *non-bare* clone of the bare mirror
//! (hardlinked objects make this cheap) so that restoring it yields a usable
//! working tree, which populates CI workspaces much faster than a fresh
//! clone.  Lock files are excluded; the scratch clone is removed whether
//! generation succeeds or fails.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{Cache, Headers, Key};
use crate::gitclone::command::run_git;

pub const CONTENT_TYPE: &str = "application/zstd";

const ZSTD_LEVEL: i32 = 3;

/// Whether `name` matches any of the exclude patterns.  Patterns are either
/// literal names or `*.suffix` globs; that is all the archive needs.
fn excluded(name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        match pattern.strip_prefix('*') {
            Some(suffix) => name.ends_with(suffix),
            None => name == pattern,
        }
    })
}

/// Create a snapshot of the bare mirror at `mirror_path` under `key`.
///
/// `workdir` is the scratch location for the temporary clone; callers pick a
/// path outside the mirror itself (e.g. `mirror_root/.snapshots/...`).
pub async fn create(
    cancel: &CancellationToken,
    cache: &Cache,
    key: Key,
    mirror_path: &Path,
    workdir: &Path,
    ttl: Duration,
    exclude: &[String],
) -> Result<()> {
    let result = build_and_upload(cancel, cache, key, mirror_path, workdir, ttl, exclude).await;
    // The scratch clone is always removed, success or failure.
    let _ = tokio::fs::remove_dir_all(workdir).await;
    result
}

async fn build_and_upload(
    cancel: &CancellationToken,
    cache: &Cache,
    key: Key,
    mirror_path: &Path,
    workdir: &Path,
    ttl: Duration,
    exclude: &[String],
) -> Result<()> {
    if workdir.exists() {
        tokio::fs::remove_dir_all(workdir)
            .await
            .context("remove stale snapshot workdir")?;
    }
    if let Some(parent) = workdir.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("create snapshot scratch directory")?;
    }

    // Local clone; objects are hardlinked from the mirror.
    run_git(
        cancel,
        None,
        None,
        [
            "clone",
            &mirror_path.display().to_string(),
            &workdir.display().to_string(),
        ],
    )
    .await
    .context("clone mirror into snapshot workdir")?;

    let archive = archive_workdir(workdir, exclude).await?;
    let upload = stream_file_into_cache(cache, key, &archive, ttl).await;
    let _ = tokio::fs::remove_file(&archive).await;
    upload
}

/// Tar + zstd the working tree into a file next to it.  Archiving is
/// CPU/disk bound, so it runs on the blocking pool.
async fn archive_workdir(workdir: &Path, exclude: &[String]) -> Result<PathBuf> {
    let archive_path = workdir.with_extension("tar.zst");
    let workdir = workdir.to_path_buf();
    let exclude = exclude.to_vec();
    let out = archive_path.clone();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::create(&out).context("create snapshot archive")?;
        let encoder = zstd::Encoder::new(file, ZSTD_LEVEL).context("create zstd encoder")?;
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        for entry in walkdir::WalkDir::new(&workdir).min_depth(1) {
            let entry = entry.context("walk snapshot workdir")?;
            let name = entry.file_name().to_string_lossy();
            if excluded(&name, &exclude) {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&workdir)
                .context("entry outside workdir")?;
            if entry.file_type().is_dir() {
                builder
                    .append_dir(relative, entry.path())
                    .with_context(|| format!("archive dir {}", relative.display()))?;
            } else if entry.file_type().is_file() {
                builder
                    .append_path_with_name(entry.path(), relative)
                    .with_context(|| format!("archive file {}", relative.display()))?;
            }
        }

        let encoder = builder.into_inner().context("finish tar stream")?;
        encoder.finish().context("finish zstd stream")?;
        Ok(())
    })
    .await
    .context("archive task panicked")??;

    Ok(archive_path)
}

async fn stream_file_into_cache(
    cache: &Cache,
    key: Key,
    archive: &Path,
    ttl: Duration,
) -> Result<()> {
    let mut headers = Headers::new();
    headers.set("Content-Type", CONTENT_TYPE);
    let mut writer = cache
        .create(&key, headers, ttl)
        .await
        .context("create snapshot cache entry")?;

    let mut file = tokio::fs::File::open(archive)
        .await
        .context("open snapshot archive")?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await.context("read snapshot archive")?;
        if read == 0 {
            break;
        }
        writer
            .write(&buf[..read])
            .await
            .context("write snapshot to cache")?;
    }
    writer.finish().await.context("publish snapshot")?;
    debug!(key = %key, "snapshot uploaded");
    Ok(())
}

/// Restore a snapshot into `dest`, producing a working checkout.
pub async fn restore(cache: &Cache, key: Key, dest: &Path) -> Result<()> {
    let (mut reader, _headers) = cache
        .open(&key)
        .await
        .context("open snapshot cache entry")?;

    // Spill to a temp file so decompression can run on the blocking pool.
    let staging = tempfile::NamedTempFile::new().context("create staging file")?;
    let staging_path = staging.path().to_path_buf();
    {
        let mut out = tokio::fs::File::create(&staging_path)
            .await
            .context("open staging file")?;
        tokio::io::copy(&mut reader, &mut out)
            .await
            .context("download snapshot")?;
    }

    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(&dest).context("create restore directory")?;
        let file = std::fs::File::open(&staging_path).context("open staged snapshot")?;
        let decoder = zstd::Decoder::new(file).context("create zstd decoder")?;
        let mut archive = tar::Archive::new(decoder);
        archive.unpack(&dest).context("unpack snapshot")?;
        Ok(())
    })
    .await
    .context("restore task panicked")??;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::{Memory, MemoryConfig};

    #[test]
    fn exclude_patterns() {
        let patterns = vec!["*.lock".to_string()];
        assert!(excluded("index.lock", &patterns));
        assert!(excluded("shallow.lock", &patterns));
        assert!(!excluded("config", &patterns));
        assert!(!excluded("lock", &patterns));

        let literal = vec!["FETCH_HEAD".to_string()];
        assert!(excluded("FETCH_HEAD", &literal));
        assert!(!excluded("HEAD", &literal));
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok()
    }

    fn run(args: &[&str]) {
        let output = std::process::Command::new("git").args(args).output().unwrap();
        assert!(
            output.status.success(),
            "git {args:?}: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    #[tokio::test]
    async fn snapshot_round_trip_restores_working_tree() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        std::fs::create_dir_all(&source).unwrap();
        let source_str = source.display().to_string();
        run(&["init", "-b", "main", &source_str]);
        run(&["-C", &source_str, "config", "user.email", "test@test.invalid"]);
        run(&["-C", &source_str, "config", "user.name", "Test"]);
        std::fs::write(source.join("hello.txt"), "hello\n").unwrap();
        run(&["-C", &source_str, "add", "."]);
        run(&["-C", &source_str, "commit", "-m", "initial"]);

        let mirror = dir.path().join("mirrors/github.com/org/repo");
        std::fs::create_dir_all(mirror.parent().unwrap()).unwrap();
        run(&["clone", "--mirror", &source_str, &mirror.display().to_string()]);

        let cache = Memory::new(MemoryConfig::default()).into_cache();
        let key = Key::new("https://github.com/org/repo.snapshot");
        let workdir = dir.path().join("mirrors/.snapshots/github.com/org/repo");
        let cancel = CancellationToken::new();

        create(
            &cancel,
            &cache,
            key,
            &mirror,
            &workdir,
            Duration::from_secs(7 * 24 * 3600),
            &["*.lock".to_string()],
        )
        .await
        .unwrap();

        // Scratch clone was cleaned up.
        assert!(!workdir.exists());

        // Stored entry advertises the right content type.
        let headers = cache.stat(&key).await.unwrap();
        assert_eq!(headers.get("Content-Type"), Some(CONTENT_TYPE));

        let restored = dir.path().join("restored");
        restore(&cache, key, &restored).await.unwrap();

        // A working checkout: .git directory plus tracked files.
        assert!(restored.join(".git").is_dir());
        assert_eq!(
            std::fs::read_to_string(restored.join("hello.txt")).unwrap(),
            "hello\n"
        );
    }
}
