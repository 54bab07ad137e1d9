//! HTTP wrapper around the `guetzli` JPEG recompressor.
//!
//! Uploads are stored under a content-addressed directory, recompressed in
//! the background by the external `guetzli` binary (at most two at a time),
//! and cleaned up once they are a day old. Clients poll the metadata
//! endpoint to watch a job advance through
//! `stored → waiting → transforming → {transformed|failed}`.

pub mod api;
pub mod config;
pub mod error;
pub mod janitor;
pub mod job;
pub mod probe;
pub mod store;
pub mod transform;

pub use error::{Error, Result};
