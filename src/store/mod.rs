//! On-disk store for content entries.
//!
//! Every admitted upload owns one directory named by its content id under
//! the base directory, holding the verbatim source image, the recompressed
//! `target.jpg` once a transformation succeeded, and the `meta` record.
//! There are no in-process locks: a content id is written only by the job
//! that owns it, so file-level isolation is left to the filesystem.

pub mod meta;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::fs::File;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use self::meta::{ImageMetadata, ImageType};

const META_FILE: &str = "meta";
const META_TMP_FILE: &str = "meta.tmp";
const TARGET_FILE: &str = "target.jpg";
const DEFAULT_BASE_DIR: &str = ".guetzli-data";

static BASE_PATH_LOGGED: AtomicBool = AtomicBool::new(false);

/// Filesystem-backed entry store.
#[derive(Debug)]
pub struct ImageStore {
    base: PathBuf,
}

impl ImageStore {
    /// Open the store, creating the base directory if missing.
    ///
    /// `base` falls back to `<home>/.guetzli-data` when unset.
    pub fn open(base: Option<PathBuf>) -> Result<Self> {
        let base = match base {
            Some(path) => path,
            None => dirs::home_dir()
                .ok_or_else(|| Error::config("unable to determine the home directory"))?
                .join(DEFAULT_BASE_DIR),
        };
        std::fs::create_dir_all(&base)?;
        if !BASE_PATH_LOGGED.swap(true, Ordering::Relaxed) {
            info!(base = %base.display(), "storage base path");
        }
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Store a new source image and return its freshly generated content id.
    ///
    /// Metadata is not written here; admission completes when the caller
    /// persists the initial record via [`write_meta`](Self::write_meta).
    pub async fn admit(&self, bytes: &[u8], image_type: ImageType) -> Result<String> {
        let content_id = Uuid::new_v4().simple().to_string();
        let dir = self.base.join(&content_id);
        tokio::fs::create_dir_all(&dir).await?;
        let source = dir.join(format!("source.{}", image_type.postfix()));
        tokio::fs::write(&source, bytes).await?;
        debug!(content_id, path = %source.display(), "stored source image");
        Ok(content_id)
    }

    /// Open the source image for reading.
    pub async fn read_source(&self, content_id: &str) -> Result<File> {
        let meta = self.read_meta(content_id).await?;
        let path = self.source_path(content_id, meta.source_type);
        self.open_image(content_id, &path).await
    }

    /// Open the transformed target image for reading.
    ///
    /// The target only exists for entries in the `transformed` state, so a
    /// pending or failed entry surfaces as not-found.
    pub async fn read_target(&self, content_id: &str) -> Result<File> {
        let path = self.target_path(content_id);
        self.open_image(content_id, &path).await
    }

    async fn open_image(&self, content_id: &str, path: &Path) -> Result<File> {
        if !valid_content_id(content_id) {
            return Err(Error::not_found("image", content_id));
        }
        match File::open(path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found("image", content_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read and parse the metadata record.
    pub async fn read_meta(&self, content_id: &str) -> Result<ImageMetadata> {
        if !valid_content_id(content_id) {
            return Err(Error::not_found("metadata", content_id));
        }
        let path = self.entry_dir(content_id).join(META_FILE);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("metadata", content_id));
            }
            Err(e) => return Err(e.into()),
        };
        ImageMetadata::from_properties(&text)
            .map_err(|reason| Error::corrupt_metadata(content_id, reason))
    }

    /// Serialize and rewrite the metadata record.
    ///
    /// The record is replaced via rename so a concurrent reader never
    /// observes a half-written file.
    pub async fn write_meta(&self, meta: &ImageMetadata) -> Result<()> {
        let dir = self.entry_dir(&meta.content_id);
        let tmp = dir.join(META_TMP_FILE);
        tokio::fs::write(&tmp, meta.to_properties()).await?;
        tokio::fs::rename(&tmp, dir.join(META_FILE)).await?;
        Ok(())
    }

    /// Names of all entry directories, in no particular order.
    pub async fn list_content_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base).await?;
        while let Some(entry) = entries.next_entry().await? {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(ids)
    }

    /// Remove the entry's directory tree.
    ///
    /// Per-file failures are logged and skipped so a partially locked entry
    /// still loses everything removable; an absent directory is a no-op.
    pub async fn delete(&self, content_id: &str) -> Result<()> {
        if !valid_content_id(content_id) {
            return Ok(());
        }
        let dir = self.entry_dir(content_id);
        info!(content_id, path = %dir.display(), "deleting entry");
        purge_dir(dir).await
    }

    pub fn source_path(&self, content_id: &str, image_type: ImageType) -> PathBuf {
        self.entry_dir(content_id)
            .join(format!("source.{}", image_type.postfix()))
    }

    pub fn target_path(&self, content_id: &str) -> PathBuf {
        self.entry_dir(content_id).join(TARGET_FILE)
    }

    fn entry_dir(&self, content_id: &str) -> PathBuf {
        self.base.join(content_id)
    }
}

/// Content ids are 32 lowercase hex characters; anything else never names
/// an entry (and must not escape the base directory).
fn valid_content_id(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Depth-first removal that keeps walking past per-file failures, then
/// removes the directory itself. An absent directory is a no-op.
async fn purge_dir(dir: PathBuf) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            if let Err(e) = Box::pin(purge_dir(path.clone())).await {
                warn!(path = %path.display(), error = %e, "unable to remove subdirectory, continuing");
            }
        } else if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "unable to remove file, continuing");
        }
    }
    tokio::fs::remove_dir(&dir).await?;
    Ok(())
}
