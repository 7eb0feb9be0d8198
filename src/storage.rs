//! Local-disk storage for uploaded originals and their preview frames.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// URL prefix under which the static root is served.
pub const STATIC_URL_PREFIX: &str = "/static";

/// Extension given to blobs whose original name has no usable one.
pub const FALLBACK_EXTENSION: &str = "bin";

/// A blob that has been written under the static root.
#[derive(Debug, Clone)]
pub struct StoredFile {
    /// Generated unique name, without extension.
    pub token: String,
    pub path: PathBuf,
    /// Root-relative URL of the file.
    pub url: String,
    pub bytes: u64,
}

/// A blob being written chunk by chunk. Call [`PendingFile::finish`] once the
/// last chunk is in, or [`PendingFile::discard`] to drop what was written.
#[derive(Debug)]
pub struct PendingFile {
    file: tokio::fs::File,
    stored: StoredFile,
}

impl PendingFile {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.file
            .write_all(chunk)
            .await
            .with_context(|| format!("writing {}", self.stored.path.display()))?;
        self.stored.bytes += chunk.len() as u64;
        Ok(())
    }

    /// Makes the blob durable. On failure the file is removed.
    pub async fn finish(mut self) -> Result<StoredFile> {
        if let Err(err) = self.sync().await {
            self.discard().await;
            return Err(err);
        }
        Ok(self.stored)
    }

    async fn sync(&mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .with_context(|| format!("flushing {}", self.stored.path.display()))?;
        self.file
            .sync_all()
            .await
            .with_context(|| format!("syncing {}", self.stored.path.display()))
    }

    pub async fn discard(self) {
        drop(self.file);
        remove_quietly(&self.stored.path).await;
    }
}

#[derive(Debug, Clone)]
pub struct MediaStorage {
    root: PathBuf,
}

impl MediaStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prepare(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("creating {}", self.root.display()))
    }

    /// Opens a fresh uniquely named file for an upload. Only the extension of
    /// `original_name` is kept; the rest of the client's name is discarded.
    pub async fn create(&self, original_name: Option<&str>) -> Result<PendingFile> {
        let token = Uuid::new_v4().to_string();
        let ext = original_name
            .and_then(safe_extension)
            .unwrap_or_else(|| FALLBACK_EXTENSION.to_string());
        let file_name = format!("{token}.{ext}");
        let path = self.root.join(&file_name);

        let file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;

        Ok(PendingFile {
            file,
            stored: StoredFile {
                url: format!("{STATIC_URL_PREFIX}/{file_name}"),
                token,
                path,
                bytes: 0,
            },
        })
    }

    /// Deletes a finished blob that will not be referenced by any record.
    pub async fn remove(&self, file: &StoredFile) {
        remove_quietly(&file.path).await;
    }

    /// Directory that receives the preview frames of `file`.
    pub fn preview_dir(&self, file: &StoredFile) -> PathBuf {
        self.root.join(&file.token)
    }

    /// Maps a path under the static root to its URL, e.g.
    /// `<root>/abc/abc_1.jpg` becomes `/static/abc/abc_1.jpg`.
    pub fn public_url(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut url = String::from(STATIC_URL_PREFIX);
        for component in relative.components() {
            let Component::Normal(part) = component else {
                return None;
            };
            url.push('/');
            url.push_str(part.to_str()?);
        }
        Some(url)
    }

    /// Resolves a path taken from a `/static/...` URL back to the file it
    /// names. Anything that could escape the root is refused.
    pub fn resolve(&self, relative: &str) -> Option<PathBuf> {
        let relative = Path::new(relative);
        if relative.as_os_str().is_empty()
            || !relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed upload"),
        Err(err) => warn!(path = %path.display(), error = %err, "could not remove upload"),
    }
}

/// Returns the lowercase extension if it is plain ASCII alphanumerics.
fn safe_extension(name: &str) -> Option<String> {
    let ext = Path::new(name).extension()?.to_str()?;
    if ext.is_empty() || ext.len() > 16 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn write_all(
        storage: &MediaStorage,
        original_name: Option<&str>,
        chunks: &[&[u8]],
    ) -> Result<StoredFile> {
        let mut pending = storage.create(original_name).await?;
        for chunk in chunks {
            pending.write(chunk).await?;
        }
        pending.finish().await
    }

    #[tokio::test]
    async fn store_keeps_extension_and_ignores_client_name() -> Result<()> {
        let dir = tempdir()?;
        let storage = MediaStorage::new(dir.path());
        let chunks = [&b"vid"[..], &b"eo"[..]];
        let stored = write_all(&storage, Some("../../etc/clip.MP4"), &chunks).await?;

        assert_eq!(stored.path.parent(), Some(dir.path()));
        assert_eq!(stored.path.extension().unwrap(), "mp4");
        assert!(!stored.url.contains("clip"));
        assert_eq!(stored.url, format!("/static/{}.mp4", stored.token));
        assert_eq!(stored.bytes, 5);
        assert_eq!(std::fs::read(&stored.path)?, b"video");
        Ok(())
    }

    #[tokio::test]
    async fn store_generates_distinct_names() -> Result<()> {
        let dir = tempdir()?;
        let storage = MediaStorage::new(dir.path());
        let a = write_all(&storage, Some("clip.mp4"), &[&b"a"[..]]).await?;
        let b = write_all(&storage, Some("clip.mp4"), &[&b"b"[..]]).await?;
        assert_ne!(a.path, b.path);
        Ok(())
    }

    #[tokio::test]
    async fn unusable_extensions_fall_back_to_bin() -> Result<()> {
        let dir = tempdir()?;
        let storage = MediaStorage::new(dir.path());
        for name in [Some("clip"), Some("clip.m p4"), None] {
            let stored = write_all(&storage, name, &[&b"x"[..]]).await?;
            assert_eq!(stored.url, format!("/static/{}.bin", stored.token));
            assert_ne!(stored.path, storage.preview_dir(&stored));
        }
        Ok(())
    }

    #[tokio::test]
    async fn discard_and_remove_delete_the_blob() -> Result<()> {
        let dir = tempdir()?;
        let storage = MediaStorage::new(dir.path());

        let mut pending = storage.create(Some("clip.mp4")).await?;
        pending.write(b"partial").await?;
        pending.discard().await;
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);

        let stored = write_all(&storage, Some("clip.mp4"), &[&b"done"[..]]).await?;
        storage.remove(&stored).await;
        assert!(!stored.path.exists());
        Ok(())
    }

    #[test]
    fn public_url_strips_root() {
        let storage = MediaStorage::new("/srv/static");
        assert_eq!(
            storage.public_url(Path::new("/srv/static/abc/abc_1.jpg")),
            Some("/static/abc/abc_1.jpg".to_string())
        );
        assert_eq!(storage.public_url(Path::new("/elsewhere/abc_1.jpg")), None);

        let relative = MediaStorage::new("./static");
        assert_eq!(
            relative.public_url(&relative.root().join("abc").join("abc_2.jpg")),
            Some("/static/abc/abc_2.jpg".to_string())
        );
    }

    #[test]
    fn resolve_refuses_traversal() {
        let storage = MediaStorage::new("/srv/static");
        assert_eq!(
            storage.resolve("abc/abc_1.jpg"),
            Some(PathBuf::from("/srv/static/abc/abc_1.jpg"))
        );
        assert_eq!(storage.resolve("../secret"), None);
        assert_eq!(storage.resolve("/etc/passwd"), None);
        assert_eq!(storage.resolve(""), None);
    }
}
