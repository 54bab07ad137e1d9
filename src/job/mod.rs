//! Job coordination: admission and the transformation state machine.
//!
//! Every admitted entry is driven through
//! `stored → waiting → transforming → {transformed|failed}` by exactly one
//! job, spawned at submission. A process-wide semaphore caps concurrent
//! recompressor runs at two; everything before and after the transform is
//! unthrottled.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Local;
use tokio::fs::File;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::probe::QualityProbe;
use crate::store::meta::{ImageMetadata, ImageType, ProcessStatus};
use crate::store::ImageStore;
use crate::transform::GuetzliTransformer;

/// Maximum admitted source size in bytes.
pub const MAX_SOURCE_SIZE: u64 = MAX_SOURCE_SIZE_MB * 1024 * 1024;
/// Maximum admitted source size in whole mebibytes, for messages.
pub const MAX_SOURCE_SIZE_MB: u64 = 8;

/// Number of recompressor processes allowed to run concurrently.
const TRANSFORM_SLOTS: usize = 2;

/// PNG sources are never probed; they always record this quality level.
const PNG_QUALITY: u8 = 100;

/// Coordinates uploads and their asynchronous transformation jobs.
pub struct JobCoordinator {
    store: Arc<ImageStore>,
    probe: QualityProbe,
    transformer: GuetzliTransformer,
    transform_slots: Semaphore,
}

impl JobCoordinator {
    pub fn new(
        store: Arc<ImageStore>,
        probe: QualityProbe,
        transformer: GuetzliTransformer,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            probe,
            transformer,
            transform_slots: Semaphore::new(TRANSFORM_SLOTS),
        })
    }

    /// Admit an upload and schedule its transformation job.
    ///
    /// Returns the new content id as soon as the source and its initial
    /// `stored` metadata are on disk; the job itself runs on a spawned task.
    pub async fn submit(
        self: &Arc<Self>,
        body: Bytes,
        mime: &str,
        name: Option<String>,
    ) -> Result<String> {
        if body.len() as u64 > MAX_SOURCE_SIZE {
            return Err(Error::TooLarge(MAX_SOURCE_SIZE_MB));
        }
        let image_type = ImageType::from_mime(mime)?;

        let content_id = self.store.admit(&body, image_type).await?;
        info!(content_id, "received new image");

        let quality = match image_type {
            ImageType::Jpg => {
                let source = self.store.source_path(&content_id, image_type);
                self.probe.probe(&source).await?
            }
            ImageType::Png => PNG_QUALITY,
        };

        let meta = ImageMetadata {
            content_id: content_id.clone(),
            status: ProcessStatus::Stored,
            stored_datetime: Local::now().naive_local(),
            source_name: name.filter(|n| !n.trim().is_empty()),
            source_type: image_type,
            source_quality: quality,
            source_size: body.len() as u64,
            target_quality: None,
            target_size: None,
        };
        self.store.write_meta(&meta).await?;
        info!(content_id, size = meta.source_size, quality, "stored new image");

        let coordinator = Arc::clone(self);
        let job_id = content_id.clone();
        tokio::spawn(async move {
            coordinator.run_job(job_id).await;
        });

        Ok(content_id)
    }

    /// Drive one admitted entry to a terminal state.
    ///
    /// Failures are absorbed into the `failed` state; clients observe them
    /// by polling the metadata.
    pub async fn run_job(&self, content_id: String) {
        if let Err(e) = self.execute(&content_id).await {
            warn!(content_id, error = %e, "guetzli transformation failed");
            self.mark_failed(&content_id).await;
        }
    }

    async fn execute(&self, content_id: &str) -> Result<()> {
        let mut meta = self.store.read_meta(content_id).await?;
        if meta.status != ProcessStatus::Stored {
            // the job for this id already ran or is running
            return Ok(());
        }
        info!(content_id, "starting guetzli transformation");
        meta.status = ProcessStatus::Waiting;
        self.store.write_meta(&meta).await?;

        let source = self.store.source_path(content_id, meta.source_type);
        let target = self.store.target_path(content_id);

        {
            let _permit = self
                .transform_slots
                .acquire()
                .await
                .map_err(|e| Error::Other(format!("transform slot pool closed: {e}")))?;
            meta.status = ProcessStatus::Transforming;
            self.store.write_meta(&meta).await?;
            self.transformer.transform(&source, &target).await?;
        }

        meta.target_quality = Some(self.probe.probe(&target).await?);
        meta.target_size = Some(tokio::fs::metadata(&target).await?.len());
        meta.status = ProcessStatus::Transformed;
        self.store.write_meta(&meta).await?;
        info!(content_id, target_size = meta.target_size, "finished guetzli transformation");
        Ok(())
    }

    /// Best-effort terminal write; a secondary failure is only logged.
    async fn mark_failed(&self, content_id: &str) {
        match self.store.read_meta(content_id).await {
            Ok(mut meta) => {
                meta.status = ProcessStatus::Failed;
                if let Err(e) = self.store.write_meta(&meta).await {
                    error!(content_id, error = %e, "unable to record failed state");
                }
            }
            Err(e) => error!(content_id, error = %e, "unable to record failed state"),
        }
    }

    /// Pick up entries left behind by a previous process.
    ///
    /// `stored` entries never had their job start, so they are re-enqueued;
    /// `waiting` and `transforming` entries lost their child process with
    /// the old runtime and are marked `failed`. Terminal entries are left
    /// alone.
    pub async fn recover(self: &Arc<Self>) {
        let ids = match self.store.list_content_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "unable to enumerate entries for recovery");
                return;
            }
        };
        for id in ids {
            let meta = match self.store.read_meta(&id).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(content_id = id, error = %e, "skipping entry during recovery");
                    continue;
                }
            };
            match meta.status {
                ProcessStatus::Stored => {
                    info!(content_id = id, "re-enqueueing entry after restart");
                    let coordinator = Arc::clone(self);
                    tokio::spawn(async move {
                        coordinator.run_job(id).await;
                    });
                }
                ProcessStatus::Waiting | ProcessStatus::Transforming => {
                    info!(content_id = id, "failing entry interrupted by restart");
                    self.mark_failed(&id).await;
                }
                ProcessStatus::Transformed | ProcessStatus::Failed => {}
            }
        }
    }

    pub async fn get_meta(&self, content_id: &str) -> Result<ImageMetadata> {
        self.store.read_meta(content_id).await
    }

    pub async fn get_source(&self, content_id: &str) -> Result<File> {
        self.store.read_source(content_id).await
    }

    pub async fn get_target(&self, content_id: &str) -> Result<File> {
        self.store.read_target(content_id).await
    }
}
