//! Dispatcher: routes record tuples into one bounded queue per category.
//!
//! RULES:
//!   - IDs come from one atomic counter and are never handed out twice.
//!   - A full queue blocks the producer (backpressure); nothing is dropped.
//!   - Records from one producer keep their order within a category.
//!     Nothing is promised about order across producers.
//!   - Each generation task holds a clone of the dispatcher. Queues close
//!     once every clone is gone and `close_all` has consumed the last handle.

use crate::{
    error::{CohortError, CohortResult},
    types::MemberId,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc;

/// IDs start just above this offset so they never collide with small,
/// externally meaningful identifiers.
pub const ID_OFFSET: MemberId = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Person,
    Hosp,
    Clinic,
    Rx,
}

impl Category {
    pub const ALL: [Category; 4] = [Self::Person, Self::Hosp, Self::Clinic, Self::Rx];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Hosp => "hosp",
            Self::Clinic => "clinic",
            Self::Rx => "rx",
        }
    }

    /// Output columns before any optional locator column.
    pub fn base_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Person => &[
                "subject_id",
                "gender",
                "birthdate",
                "age",
                "coverage_start",
                "coverage_end",
            ],
            Self::Hosp => &["subject_id", "service_date", "discharge_date", "code"],
            Self::Clinic => &["subject_id", "service_date", "code"],
            Self::Rx => &["subject_id", "service_date", "code"],
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The unit crossing the dispatcher boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub category: Category,
    pub fields: Vec<String>,
}

impl Record {
    pub fn new(category: Category, fields: Vec<String>) -> Self {
        Self { category, fields }
    }
}

pub type CategoryReceivers = BTreeMap<Category, mpsc::Receiver<Record>>;

#[derive(Debug, Default)]
struct Counters {
    last_id: AtomicI64,
    emitted: [AtomicU64; 4],
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    counters: Arc<Counters>,
    senders: BTreeMap<Category, mpsc::Sender<Record>>,
}

impl Dispatcher {
    /// Build the dispatcher and the receiving ends of its queues.
    /// `buffer_size` bounds every category queue independently.
    pub fn new(buffer_size: usize) -> (Self, CategoryReceivers) {
        let mut senders = BTreeMap::new();
        let mut receivers = BTreeMap::new();
        for category in Category::ALL {
            let (tx, rx) = mpsc::channel(buffer_size.max(1));
            senders.insert(category, tx);
            receivers.insert(category, rx);
        }
        let counters = Counters {
            last_id: AtomicI64::new(ID_OFFSET),
            ..Counters::default()
        };
        (
            Self {
                counters: Arc::new(counters),
                senders,
            },
            receivers,
        )
    }

    /// Next member ID. Lock-free; linearizable across tasks.
    pub fn allocate_id(&self) -> MemberId {
        self.counters.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Push a record, waiting while its category queue is full.
    pub async fn enqueue(&self, record: Record) -> CohortResult<()> {
        let category = record.category;
        let sender = self
            .senders
            .get(&category)
            .ok_or(CohortError::DispatchClosed { category })?;
        sender
            .send(record)
            .await
            .map_err(|_| CohortError::DispatchClosed { category })?;
        self.counters.emitted[category.index()].fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Records accepted so far for a category.
    pub fn emitted(&self, category: Category) -> u64 {
        self.counters.emitted[category.index()].load(Ordering::Acquire)
    }

    /// Drop the last senders so consumers see end-of-stream. Call once,
    /// after every generation task has finished. Returns the final
    /// emitted counts.
    pub fn close_all(self) -> BTreeMap<Category, u64> {
        let counts = Category::ALL
            .into_iter()
            .map(|c| (c, self.emitted(c)))
            .collect();
        drop(self.senders);
        log::debug!("dispatch: all queues closed");
        counts
    }
}
