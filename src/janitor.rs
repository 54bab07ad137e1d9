//! Periodic removal of aged entries.
//!
//! Entries live for 24 hours after admission; a background sweep runs every
//! half hour and deletes whatever has expired. Sweeps fire 11 seconds past
//! the half-hour mark so that tenants sharing a clock do not all hit the
//! filesystem at once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, Timelike};
use tokio::time::interval_at;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::store::ImageStore;

/// Entries whose stored time lies further in the past are deleted.
const MAX_AGE_SECONDS: i64 = 24 * 60 * 60;

const SWEEP_PERIOD: Duration = Duration::from_secs(30 * 60);
const SWEEP_OFFSET_SECONDS: u32 = 11;

/// Deletes entries older than 24 hours.
pub struct Janitor {
    store: Arc<ImageStore>,
}

impl Janitor {
    pub fn new(store: Arc<ImageStore>) -> Self {
        Self { store }
    }

    /// Start the background sweep task.
    ///
    /// The task runs until the cancellation token fires at shutdown.
    pub fn start_background_task(&self, cancellation_token: CancellationToken) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let janitor = Janitor { store };
            let first = delay_until_next_sweep(Local::now().naive_local());
            info!(first_sweep_in_secs = first.as_secs(), "janitor started");
            let mut ticks = interval_at(tokio::time::Instant::now() + first, SWEEP_PERIOD);
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("janitor shutting down");
                        break;
                    }
                    _ = ticks.tick() => {
                        janitor.sweep().await;
                    }
                }
            }
        });
    }

    /// Run one sweep over all entries.
    ///
    /// Per-entry failures are logged and skipped; the sweep never aborts
    /// early.
    pub async fn sweep(&self) {
        info!("automated cleanup sweep started");
        let now = Local::now().naive_local();
        let ids = match self.store.list_content_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "unable to enumerate entries, skipping sweep");
                return;
            }
        };
        for id in ids {
            let meta = match self.store.read_meta(&id).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(content_id = id, error = %e, "unable to read metadata, skipping entry");
                    continue;
                }
            };
            if is_expired(&meta.stored_datetime, now) {
                info!(
                    content_id = id,
                    stored = %meta.stored_datetime,
                    "entry older than 24h, deleting"
                );
                if let Err(e) = self.store.delete(&id).await {
                    warn!(content_id = id, error = %e, "unable to delete entry");
                }
            }
        }
    }
}

fn is_expired(stored: &NaiveDateTime, now: NaiveDateTime) -> bool {
    now.signed_duration_since(*stored) > chrono::Duration::seconds(MAX_AGE_SECONDS)
}

/// Time until the local clock next reads hh:00:11 or hh:30:11.
fn delay_until_next_sweep(now: NaiveDateTime) -> Duration {
    let into_half_hour = (now.minute() % 30) * 60 + now.second();
    let period = SWEEP_PERIOD.as_secs() as u32;
    let wait = if into_half_hour < SWEEP_OFFSET_SECONDS {
        SWEEP_OFFSET_SECONDS - into_half_hour
    } else {
        period - into_half_hour + SWEEP_OFFSET_SECONDS
    };
    Duration::from_secs(u64::from(wait))
}
