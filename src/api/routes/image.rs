//! Image resource routes.
//!
//! The upload endpoint admits a JPEG or PNG body and answers immediately
//! with the new entry's location; the transformation itself runs in the
//! background and is observed by polling the meta endpoint.

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{IdListResponse, MetaResponse};
use crate::api::server::AppState;
use crate::error::Error;
use crate::job::{MAX_SOURCE_SIZE, MAX_SOURCE_SIZE_MB};
use crate::store::meta::ImageType;

/// Optional upload filename header.
const IMG_NAME_HEADER: &str = "x-guetzli-img-name";

/// Create the image router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_images).post(upload_image))
        .route("/{content_id}/meta", get(get_meta))
        .route("/{content_id}/source", get(get_source_image))
        .route("/{content_id}/target", get(get_target_image))
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    download: Option<String>,
}

impl DownloadQuery {
    /// `yes`, `true`, `y` and `t` (case-insensitive) request a download
    /// disposition; everything else does not.
    fn wants_download(&self) -> bool {
        self.download
            .as_deref()
            .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "yes" | "true" | "y" | "t"))
    }
}

async fn upload_image(State(state): State<AppState>, request: Request) -> ApiResult<Response> {
    let headers = request.headers();

    // reject by the declared size before reading a single body byte
    let declared_size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared_size.is_some_and(|size| size > MAX_SOURCE_SIZE) {
        return Err(Error::TooLarge(MAX_SOURCE_SIZE_MB).into());
    }

    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let name = headers
        .get(IMG_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let body = axum::body::to_bytes(request.into_body(), MAX_SOURCE_SIZE as usize)
        .await
        .map_err(|_| ApiError::from(Error::TooLarge(MAX_SOURCE_SIZE_MB)))?;

    let content_id = state
        .coordinator
        .submit(body, &mime, name)
        .await
        .map_err(ApiError::from)?;

    let location = format!("/image/{content_id}/source");
    Ok((StatusCode::CREATED, [(header::LOCATION, location)]).into_response())
}

async fn list_images(State(state): State<AppState>) -> ApiResult<Json<IdListResponse>> {
    let ids = state.store.list_content_ids().await.map_err(ApiError::from)?;
    Ok(Json(IdListResponse { ids }))
}

async fn get_meta(
    State(state): State<AppState>,
    Path(content_id): Path<String>,
) -> ApiResult<Json<MetaResponse>> {
    let meta = state
        .coordinator
        .get_meta(&content_id)
        .await
        .map_err(|e| entry_error("metadata", &content_id, e))?;
    Ok(Json(MetaResponse::from_metadata(&meta)))
}

async fn get_source_image(
    State(state): State<AppState>,
    Path(content_id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let meta = state
        .coordinator
        .get_meta(&content_id)
        .await
        .map_err(|e| entry_error("source image", &content_id, e))?;
    let file = state
        .coordinator
        .get_source(&content_id)
        .await
        .map_err(|e| entry_error("source image", &content_id, e))?;

    let name = query.wants_download().then_some(meta.source_name).flatten();
    Ok(image_response(file, meta.source_type.mime_type(), name))
}

async fn get_target_image(
    State(state): State<AppState>,
    Path(content_id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let file = state
        .coordinator
        .get_target(&content_id)
        .await
        .map_err(|e| entry_error("target image", &content_id, e))?;

    // the disposition filename comes from the upload; losing it only loses
    // the header
    let name = if query.wants_download() {
        state
            .coordinator
            .get_meta(&content_id)
            .await
            .ok()
            .and_then(|meta| meta.source_name)
    } else {
        None
    };
    Ok(image_response(file, ImageType::Jpg.mime_type(), name))
}

fn image_response(file: tokio::fs::File, mime: &'static str, download_name: Option<String>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
    if let Some(name) = download_name {
        let disposition = format!("attachment; filename=\"{name}\"");
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
    let stream = ReaderStream::new(file);
    (StatusCode::OK, headers, Body::from_stream(stream)).into_response()
}

/// Map store errors for one entry: absent data is 404, everything else is a
/// 500 naming the affected id.
fn entry_error(what: &str, content_id: &str, err: Error) -> ApiError {
    match err {
        Error::NotFound { .. } => ApiError::not_found(format!("No {what} for ID {content_id}")),
        err => {
            tracing::error!(content_id, what, error = %err, "request failed");
            ApiError::internal(format!("Unable to get {what} for ID {content_id}"))
        }
    }
}
