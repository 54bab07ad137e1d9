//! API response models.

use serde::Serialize;

use crate::store::meta::{ImageMetadata, ProcessStatus};

/// Metadata document returned for one entry.
///
/// The `source` fields are emitted only when set and, for the numeric ones,
/// strictly positive; the `target` object only exists once the entry is
/// transformed.
#[derive(Debug, Serialize)]
pub struct MetaResponse {
    #[serde(rename = "contentId")]
    pub content_id: String,
    pub status: ProcessStatus,
    pub source: SourceDocument,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetDocument>,
}

#[derive(Debug, Serialize)]
pub struct SourceDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub mime: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qualitylevel: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct TargetDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qualitylevel: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl MetaResponse {
    pub fn from_metadata(meta: &ImageMetadata) -> Self {
        let target = (meta.status == ProcessStatus::Transformed).then(|| TargetDocument {
            qualitylevel: meta.target_quality.filter(|&q| q > 0),
            size: meta.target_size.filter(|&s| s > 0),
        });
        Self {
            content_id: meta.content_id.clone(),
            status: meta.status,
            source: SourceDocument {
                name: meta.source_name.clone(),
                mime: meta.source_type.mime_type(),
                qualitylevel: Some(meta.source_quality).filter(|&q| q > 0),
                size: Some(meta.source_size).filter(|&s| s > 0),
            },
            target,
        }
    }
}

/// Listing of all known content ids.
#[derive(Debug, Serialize)]
pub struct IdListResponse {
    pub ids: Vec<String>,
}

/// Service liveness document.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}
