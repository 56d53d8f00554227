//! The orchestrator: drives one generation run from start to finish.
//!
//! PHASES (one way only, never re-entered):
//!   1. Init      build dispatcher, generator, random streams
//!   2. Running   open sinks, spawn one consumer per category,
//!                spawn one generation task per member
//!   3. Draining  wait for every generation task, then close all queues
//!   4. Terminal  wait for every consumer to drain and flush
//!
//! RULES:
//!   - Any error in any task aborts the whole run. There is no partial
//!     success; output files may be incomplete after an abort.
//!   - A consumer failure is reported in preference to the generation
//!     errors it causes downstream.
//!   - No timeouts or cancellation once Running is entered.

use crate::{
    config::CohortConfig,
    dispatch::{Category, CategoryReceivers, Dispatcher, Record},
    error::{CohortError, CohortResult},
    generator::CohortGenerator,
    rng::{MemberRng, RngMode, SeedBank},
    sink::{RecordSink, SinkFactory},
    types::{MemberId, RunId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, sync::Arc};
use tokio::{
    sync::{mpsc, Semaphore},
    task::{JoinError, JoinHandle, JoinSet},
};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    Running,
    Draining,
    Terminal,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub seed: u64,
    pub rng_mode: RngMode,
    pub members: u64,
    pub emitted: BTreeMap<Category, u64>,
    pub written: BTreeMap<Category, u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn written(&self, category: Category) -> u64 {
        self.written.get(&category).copied().unwrap_or(0)
    }

    /// Write the summary as pretty-printed JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> CohortResult<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        log::info!("cohort: run summary written to {}", path.display());
        Ok(())
    }
}

type Consumers = Vec<(Category, JoinHandle<CohortResult<u64>>)>;

pub struct Orchestrator {
    pub run_id: RunId,
    config: Arc<CohortConfig>,
    sinks: Arc<dyn SinkFactory>,
    phase: RunPhase,
}

impl Orchestrator {
    pub fn new(config: CohortConfig, sinks: Arc<dyn SinkFactory>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            config: Arc::new(config),
            sinks,
            phase: RunPhase::Init,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<RunId>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn config(&self) -> &CohortConfig {
        &self.config
    }

    /// Generate the whole cohort and deliver every record to the sinks.
    pub async fn run(&mut self) -> CohortResult<RunSummary> {
        if self.phase != RunPhase::Init {
            return Err(CohortError::config(format!(
                "run {} already started ({:?})",
                self.run_id, self.phase
            )));
        }
        let started_at = Utc::now();
        log::info!(
            "cohort: run {} starting, n={} seed={} buffer={}",
            self.run_id,
            self.config.n,
            self.config.seed,
            self.config.buffer_size
        );

        let (dispatcher, receivers) = Dispatcher::new(self.config.buffer_size);
        let generator = CohortGenerator::new(Arc::clone(&self.config));
        let seeds = SeedBank::new(self.config.seed, self.config.rng_mode);

        self.enter(RunPhase::Running);
        let consumers = match self.spawn_consumers(receivers) {
            Ok(c) => c,
            Err(e) => return Err(self.abort(e)),
        };
        let generation = self.generate_all(&dispatcher, &generator, &seeds).await;

        self.enter(RunPhase::Draining);
        let emitted = dispatcher.close_all();
        let consumed = join_consumers(consumers).await;

        let (members, written) = match (generation, consumed) {
            (_, Err(e)) => return Err(self.abort(e)),
            (Err(e), Ok(_)) => return Err(self.abort(e)),
            (Ok(members), Ok(written)) => (members, written),
        };

        for category in Category::ALL {
            let sent = emitted.get(&category).copied().unwrap_or(0);
            let got = written.get(&category).copied().unwrap_or(0);
            if sent != got {
                return Err(self.abort(CohortError::DeliveryMismatch {
                    category,
                    emitted: sent,
                    written: got,
                }));
            }
        }

        self.enter(RunPhase::Terminal);
        Ok(RunSummary {
            run_id: self.run_id.clone(),
            seed: self.config.seed,
            rng_mode: self.config.rng_mode,
            members,
            emitted,
            written,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn enter(&mut self, next: RunPhase) {
        log::info!("cohort: phase {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }

    fn abort(&mut self, err: CohortError) -> CohortError {
        log::error!("cohort: run {} aborted in {:?}: {err}", self.run_id, self.phase);
        self.phase = RunPhase::Aborted;
        err
    }

    /// Open every sink first so a bad destination fails before any
    /// consumer starts, then hand each receiver to a blocking thread.
    fn spawn_consumers(&self, mut receivers: CategoryReceivers) -> CohortResult<Consumers> {
        let mut opened = Vec::with_capacity(Category::ALL.len());
        for category in Category::ALL {
            opened.push((category, self.sinks.open(category)?));
        }

        let mut consumers = Vec::with_capacity(opened.len());
        for (category, sink) in opened {
            let rx = receivers
                .remove(&category)
                .ok_or(CohortError::DispatchClosed { category })?;
            let header = self.config.field_names(category).to_vec();
            let handle = tokio::task::spawn_blocking(move || consume(category, rx, sink, header));
            consumers.push((category, handle));
        }
        Ok(consumers)
    }

    /// One task per member, at most `max_in_flight` alive at once.
    /// Returns the number of members generated.
    async fn generate_all(
        &self,
        dispatcher: &Dispatcher,
        generator: &CohortGenerator,
        seeds: &SeedBank,
    ) -> CohortResult<u64> {
        let permits = Arc::new(Semaphore::new(self.config.max_in_flight));
        let mut tasks = JoinSet::new();
        let mut generated = 0u64;

        for index in 0..self.config.n {
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|e| CohortError::TaskFailed(e.to_string()))?;
            while let Some(done) = tasks.try_join_next() {
                generated += reap(done)?;
            }

            // IDs follow the stream index.
            let id = dispatcher.allocate_id();
            let dispatcher = dispatcher.clone();
            let generator = generator.clone();
            let mut rng = seeds.for_member(index as u64);
            tasks.spawn(async move {
                let _permit = permit;
                generate_member(id, &generator, &dispatcher, &mut rng).await
            });
        }

        while let Some(done) = tasks.join_next().await {
            generated += reap(done)?;
        }
        log::info!("cohort: {generated} members generated");
        Ok(generated)
    }
}

/// Emits the person row before any disease work, then each exposure's
/// rows as soon as that exposure is drawn.
async fn generate_member(
    id: MemberId,
    generator: &CohortGenerator,
    dispatcher: &Dispatcher,
    rng: &mut MemberRng,
) -> CohortResult<()> {
    let member = generator.generate_person(id, rng)?;
    dispatcher.enqueue(member.to_record()?).await?;
    for disease in generator.config().diseases() {
        if let Some(exposure) = generator.expose(&member, disease, rng)? {
            for record in exposure.to_records()? {
                dispatcher.enqueue(record).await?;
            }
        }
    }
    Ok(())
}

fn reap(done: Result<CohortResult<()>, JoinError>) -> CohortResult<u64> {
    match done {
        Ok(Ok(())) => Ok(1),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(CohortError::TaskFailed(format!("generation task: {e}"))),
    }
}

/// Drain one category queue into its sink until the queue closes.
fn consume(
    category: Category,
    mut rx: mpsc::Receiver<Record>,
    mut sink: Box<dyn RecordSink>,
    header: Vec<String>,
) -> CohortResult<u64> {
    log::info!("consumer: writing {category}");
    sink.write_header(&header)?;
    let mut written = 0u64;
    while let Some(record) = rx.blocking_recv() {
        sink.write_record(&record.fields)?;
        written += 1;
    }
    sink.finish()?;
    log::info!("consumer: done writing {written} rows to {category}");
    Ok(written)
}

async fn join_consumers(consumers: Consumers) -> CohortResult<BTreeMap<Category, u64>> {
    let mut written = BTreeMap::new();
    let mut first_error = None;
    for (category, handle) in consumers {
        let result = match handle.await {
            Ok(r) => r,
            Err(e) => Err(CohortError::TaskFailed(format!("{category} consumer: {e}"))),
        };
        match result {
            Ok(count) => {
                written.insert(category, count);
            }
            Err(e) => {
                log::error!("consumer: {category} failed: {e}");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(written),
    }
}
