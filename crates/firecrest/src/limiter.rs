//! Implementation of the client-side rate limiter.
//!
//! FirecREST groups its endpoints into categories (`compute`, `storage`, and
//! so on) and deployments commonly throttle clients that call a category too
//! frequently. The limiter enforces a minimum interval between consecutive
//! dispatches within each category.
//!
//! Waiters for a category queue on an asynchronous mutex, which hands out the
//! lock in the order it was requested; a workflow waiting on the limiter is
//! suspended on a timer and does not block the thread of any other workflow.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::config::RateLimitConfig;

/// Represents a FirecREST API category.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Category {
    /// Job submission and scheduler queries.
    Compute,
    /// Staged transfers through object storage.
    Storage,
    /// System and service status.
    Status,
    /// Asynchronous task status.
    Tasks,
    /// Small file operations.
    Utilities,
    /// Scheduler reservations.
    Reservations,
}

impl Category {
    /// The number of categories.
    const COUNT: usize = 6;

    /// Gets the index of the category's slot in the limiter.
    fn index(self) -> usize {
        match self {
            Self::Compute => 0,
            Self::Storage => 1,
            Self::Status => 2,
            Self::Tasks => 3,
            Self::Utilities => 4,
            Self::Reservations => 5,
        }
    }
}

/// Represents the limiter state of a single category.
#[derive(Debug)]
struct Slot {
    /// The minimum interval between dispatches.
    interval: Duration,
    /// The time of the previous dispatch.
    ///
    /// This is `None` if no call has been dispatched yet.
    last: Mutex<Option<Instant>>,
}

/// Enforces a minimum interval between calls within each API category.
#[derive(Debug)]
pub struct RateLimiter {
    /// The per-category slots, indexed by [`Category::index`].
    slots: [Slot; Category::COUNT],
}

impl RateLimiter {
    /// Constructs a new rate limiter from the given configuration.
    pub fn new(config: &RateLimitConfig) -> Self {
        let slot = |category| Slot {
            interval: config.interval(category),
            last: Mutex::new(None),
        };

        Self {
            slots: [
                slot(Category::Compute),
                slot(Category::Storage),
                slot(Category::Status),
                slot(Category::Tasks),
                slot(Category::Utilities),
                slot(Category::Reservations),
            ],
        }
    }

    /// Gets the minimum interval between calls for a category.
    pub fn interval(&self, category: Category) -> Duration {
        self.slots[category.index()].interval
    }

    /// Waits until a call in the given category may be dispatched.
    ///
    /// Upon return the dispatch is recorded; the caller is expected to send
    /// its request immediately.
    pub async fn acquire(&self, category: Category) {
        let slot = &self.slots[category.index()];
        let mut last = slot.last.lock().await;

        if let Some(next) = (*last).and_then(|previous| previous.checked_add(slot.interval)) {
            if next > Instant::now() {
                trace!(
                    %category,
                    "waiting {wait:?} before dispatching",
                    wait = next - Instant::now()
                );
                tokio::time::sleep_until(next).await;
            }
        }

        *last = Some(Instant::now());
    }
}
