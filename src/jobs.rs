//! Job Dispatcher (C13)
//! Mission: a bounded worker pool that runs the file-processing pipeline
//! (parse -> transform -> persist -> score -> link -> mine) to completion
//! per job, enforcing soft/hard deadlines and emitting progress on C14.
//! Worker-pool shape mirrors the teacher's `DomeEnrichmentService::spawn_workers`
//! (`signals/enrichment.rs`): a shared `tokio::sync::Mutex`-guarded receiver,
//! N spawned loop-workers, failures logged and swallowed per worker.

use crate::edi::parser;
use crate::edi::segment::SegmentSource;
use crate::episodes::EpisodeLinker;
use crate::error::AppError;
use crate::models::Claim;
use crate::patterns::{PatternDetector, DEFAULT_MIN_FREQUENCY, DEFAULT_MIN_OCCURRENCES, DEFAULT_WINDOW_DAYS};
use crate::push::{FileProgressStage, PushChannel, PushEvent};
use crate::risk::scorer::RiskScorer;
use crate::storage::Storage;
use crate::transform::Transformer;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use uuid::Uuid;

const JOB_QUEUE_CAPACITY: usize = 256;

/// Matches `Storage::insert_claims_batch`'s own chunk size (§4.6) so a
/// "batch boundary" for soft-deadline purposes lines up with a commit.
const CLAIM_BATCH_SIZE: usize = 50;

/// Where the uploaded file's bytes live: in memory for small files, on disk
/// for anything above the streaming threshold (spec.md §6) — `C15` decides
/// which at upload time; the dispatcher just needs to open whichever it's
/// given. `SegmentSource::from_bytes`/`from_file` already abstract the read
/// path uniformly (spec.md §9), so this enum only decides which to call.
#[derive(Debug, Clone)]
pub enum FileSource {
    Memory(Vec<u8>),
    Path(PathBuf),
}

#[derive(Debug, Clone)]
pub enum JobKind {
    ProcessClaimFile { filename: String, source: FileSource },
    ProcessRemittanceFile { filename: String, source: FileSource },
    RecalculateRisk { claim_id: Uuid },
    DetectPatterns { payer_id: Option<Uuid> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    CompletedWithWarnings,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Finished(JobOutcome),
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub state: JobState,
    pub message: Option<String>,
}

struct Job {
    id: Uuid,
    kind: JobKind,
    soft_deadline: Duration,
    hard_deadline: Duration,
}

/// Internal sentinel returned by a parser callback to ask the streaming
/// parser to stop at the next batch boundary once the soft deadline has
/// elapsed — the callback API has no other way to request a graceful stop
/// mid-stream (spec.md §5). The pipeline recognizes this specific message
/// and treats it as a deliberate stop, not a failure.
const SOFT_DEADLINE_SENTINEL: &str = "__soft_deadline_exceeded__";

fn soft_deadline_marker() -> AppError {
    AppError::InvariantViolation(SOFT_DEADLINE_SENTINEL.to_string())
}

fn is_soft_deadline_marker(e: &AppError) -> bool {
    matches!(e, AppError::InvariantViolation(msg) if msg == SOFT_DEADLINE_SENTINEL)
}

pub struct JobDispatcher {
    storage: Arc<Storage>,
    transformer: Arc<Transformer>,
    scorer: Arc<RiskScorer>,
    linker: Arc<EpisodeLinker>,
    patterns: Arc<PatternDetector>,
    push: Arc<PushChannel>,
    sender: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobStatus>>>,
    default_soft_deadline: Duration,
    default_hard_deadline: Duration,
}

impl JobDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<Storage>,
        transformer: Arc<Transformer>,
        scorer: Arc<RiskScorer>,
        linker: Arc<EpisodeLinker>,
        patterns: Arc<PatternDetector>,
        push: Arc<PushChannel>,
        worker_count: usize,
        default_soft_deadline: Duration,
        default_hard_deadline: Duration,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(JOB_QUEUE_CAPACITY);
        let dispatcher = Arc::new(Self {
            storage,
            transformer,
            scorer,
            linker,
            patterns,
            push,
            sender,
            statuses: Arc::new(Mutex::new(HashMap::new())),
            default_soft_deadline,
            default_hard_deadline,
        });
        dispatcher.clone().spawn_workers(receiver, worker_count.max(1));
        dispatcher
    }

    fn spawn_workers(self: Arc<Self>, receiver: mpsc::Receiver<Job>, worker_count: usize) {
        let receiver = Arc::new(AsyncMutex::new(receiver));
        for worker_id in 0..worker_count {
            let dispatcher = self.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move {
                loop {
                    let job = { receiver.lock().await.recv().await };
                    let Some(job) = job else { break };
                    let job_id = job.id;
                    if let Err(e) = dispatcher.run_job(job).await {
                        tracing::warn!(worker = worker_id, job_id = %job_id, error = %e, "job failed");
                    }
                }
            });
        }
    }

    pub fn submit(&self, kind: JobKind) -> Result<Uuid, AppError> {
        self.submit_with_deadlines(kind, self.default_soft_deadline, self.default_hard_deadline)
    }

    pub fn submit_with_deadlines(
        &self,
        kind: JobKind,
        soft_deadline: Duration,
        hard_deadline: Duration,
    ) -> Result<Uuid, AppError> {
        let id = Uuid::new_v4();
        self.statuses.lock().insert(
            id,
            JobStatus {
                state: JobState::Queued,
                message: None,
            },
        );
        self.sender
            .try_send(Job {
                id,
                kind,
                soft_deadline,
                hard_deadline,
            })
            .map_err(|_| AppError::InvariantViolation("job queue is full".to_string()))?;
        Ok(id)
    }

    pub fn status(&self, id: Uuid) -> Option<JobStatus> {
        self.statuses.lock().get(&id).cloned()
    }

    fn set_status(&self, id: Uuid, state: JobState, message: Option<String>) {
        self.statuses.lock().insert(id, JobStatus { state, message });
    }

    /// Runs one job to completion under its hard deadline. Work happens on
    /// the blocking pool: the EDI parser's callback is synchronous and
    /// "does not suspend within a single block" (spec.md §5), so there is
    /// no `.await` point inside the pipeline for `tokio::time::timeout` to
    /// preempt at. Wrapping the whole job in `spawn_blocking` and timing out
    /// the join is the closest approximation of "force-kill" Tokio allows —
    /// the blocking task itself is orphaned on the blocking pool rather than
    /// truly cancelled, which is a known, accepted limitation recorded in
    /// DESIGN.md.
    async fn run_job(&self, job: Job) -> Result<(), AppError> {
        let job_id = job.id;
        self.set_status(job_id, JobState::Running, None);

        let storage = self.storage.clone();
        let transformer = self.transformer.clone();
        let scorer = self.scorer.clone();
        let linker = self.linker.clone();
        let patterns = self.patterns.clone();
        let push = self.push.clone();
        let kind = job.kind;
        let soft_deadline = job.soft_deadline;

        let handle = tokio::task::spawn_blocking(move || {
            run_pipeline(job_id, kind, soft_deadline, &storage, &transformer, &scorer, &linker, &patterns, &push)
        });

        match tokio::time::timeout(job.hard_deadline, handle).await {
            Ok(Ok(Ok(outcome))) => {
                self.set_status(job_id, JobState::Finished(outcome), None);
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                self.set_status(job_id, JobState::Finished(JobOutcome::Failed), Some(e.to_string()));
                Err(e)
            }
            Ok(Err(join_err)) => {
                let msg = format!("job panicked: {join_err}");
                self.set_status(job_id, JobState::Finished(JobOutcome::Failed), Some(msg.clone()));
                Err(AppError::InvariantViolation(msg))
            }
            Err(_) => {
                let msg = "hard deadline exceeded".to_string();
                self.set_status(job_id, JobState::Finished(JobOutcome::TimedOut), Some(msg.clone()));
                Err(AppError::InvariantViolation(format!("job {job_id}: {msg}")))
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_pipeline(
    job_id: Uuid,
    kind: JobKind,
    soft_deadline: Duration,
    storage: &Arc<Storage>,
    transformer: &Arc<Transformer>,
    scorer: &Arc<RiskScorer>,
    linker: &Arc<EpisodeLinker>,
    patterns: &Arc<PatternDetector>,
    push: &Arc<PushChannel>,
) -> Result<JobOutcome, AppError> {
    match kind {
        JobKind::ProcessClaimFile { filename, source } => {
            process_claim_file(job_id, filename, source, soft_deadline, storage, transformer, scorer, push)
        }
        JobKind::ProcessRemittanceFile { filename, source } => process_remittance_file(
            job_id,
            filename,
            source,
            soft_deadline,
            storage,
            transformer,
            scorer,
            linker,
            patterns,
            push,
        ),
        JobKind::RecalculateRisk { claim_id } => {
            let claim = storage.get_claim(claim_id)?.ok_or(AppError::NotFound)?;
            scorer.score(&claim)?;
            Ok(JobOutcome::Completed)
        }
        JobKind::DetectPatterns { payer_id } => {
            let observations = storage.fetch_denial_observations(payer_id, DEFAULT_WINDOW_DAYS)?;
            patterns.detect(&observations, DEFAULT_MIN_FREQUENCY, DEFAULT_MIN_OCCURRENCES)?;
            Ok(JobOutcome::Completed)
        }
    }
}

fn open_source(source: FileSource) -> Result<SegmentSource, AppError> {
    match source {
        FileSource::Memory(bytes) => SegmentSource::from_bytes(bytes),
        FileSource::Path(path) => SegmentSource::from_file(&path),
    }
}

fn progress_event(
    filename: &str,
    file_type: &'static str,
    task_id: Uuid,
    stage: FileProgressStage,
    current: u64,
    message: impl Into<String>,
) -> PushEvent {
    // Total claim/line count isn't known ahead of a single streaming pass,
    // so `total` mirrors `current` except at `Complete`, where `progress`
    // is pinned to 1.0; subscribers treat 0 < progress < 1 as indeterminate.
    let progress = match stage {
        FileProgressStage::Complete => 1.0,
        _ => 0.0,
    };
    PushEvent::FileProgress {
        filename: filename.to_string(),
        file_type,
        task_id,
        stage,
        progress,
        current,
        total: current,
        message: message.into(),
    }
}

#[allow(clippy::too_many_arguments)]
fn process_claim_file(
    job_id: Uuid,
    filename: String,
    source: FileSource,
    soft_deadline: Duration,
    storage: &Arc<Storage>,
    transformer: &Arc<Transformer>,
    scorer: &Arc<RiskScorer>,
    push: &Arc<PushChannel>,
) -> Result<JobOutcome, AppError> {
    const FT: &str = "837";
    let started = Instant::now();
    push.publish(progress_event(&filename, FT, job_id, FileProgressStage::Parsing, 0, "starting parse"));

    let mut source = open_source(source)?;
    let mut batch: Vec<Claim> = Vec::with_capacity(CLAIM_BATCH_SIZE);
    let mut processed: u64 = 0;
    let mut soft_deadline_hit = false;

    let result = parser::parse_837(&mut source, |parsed| {
        let claim = transformer.transform_claim(parsed)?;
        batch.push(claim);

        if batch.len() >= CLAIM_BATCH_SIZE {
            flush_claim_batch(&mut batch, storage, scorer, push, &filename, job_id, &mut processed)?;
            if started.elapsed() >= soft_deadline {
                soft_deadline_hit = true;
                return Err(soft_deadline_marker());
            }
        }
        Ok(())
    });

    match result {
        Ok(_) => {}
        Err(e) if is_soft_deadline_marker(&e) => {}
        Err(e) => return Err(e),
    }

    if !batch.is_empty() {
        flush_claim_batch(&mut batch, storage, scorer, push, &filename, job_id, &mut processed)?;
    }

    let message = if soft_deadline_hit { "stopped at soft deadline" } else { "complete" };
    push.publish(progress_event(&filename, FT, job_id, FileProgressStage::Complete, processed, message));

    Ok(if soft_deadline_hit {
        JobOutcome::CompletedWithWarnings
    } else {
        JobOutcome::Completed
    })
}

fn flush_claim_batch(
    batch: &mut Vec<Claim>,
    storage: &Arc<Storage>,
    scorer: &Arc<RiskScorer>,
    push: &Arc<PushChannel>,
    filename: &str,
    job_id: Uuid,
    processed: &mut u64,
) -> Result<(), AppError> {
    const FT: &str = "837";
    storage.insert_claims_batch(batch)?;
    push.publish(progress_event(
        filename,
        FT,
        job_id,
        FileProgressStage::Saving,
        *processed + batch.len() as u64,
        format!("persisted {} claims", batch.len()),
    ));

    for claim in batch.iter() {
        scorer.score(claim)?;
    }
    *processed += batch.len() as u64;
    push.publish(progress_event(
        filename,
        FT,
        job_id,
        FileProgressStage::Processing,
        *processed,
        format!("scored {} claims", batch.len()),
    ));
    batch.clear();
    Ok(())
}

/// Remittances are read into memory in full before persisting: unlike
/// claims (persisted in batches of `CLAIM_BATCH_SIZE` as the parser
/// produces them), `Transformer::transform_remittance` builds one
/// `Remittance` aggregate (header + all its `RemittanceClaim` children) and
/// `Storage::insert_remittance` writes it as a single non-idempotent
/// insert, so there is no batch boundary to stop at mid-parse without
/// losing the header. The soft deadline instead gates the post-parse
/// per-claim linking/scoring loop, which can stop cleanly between claims.
#[allow(clippy::too_many_arguments)]
fn process_remittance_file(
    job_id: Uuid,
    filename: String,
    source: FileSource,
    soft_deadline: Duration,
    storage: &Arc<Storage>,
    transformer: &Arc<Transformer>,
    scorer: &Arc<RiskScorer>,
    linker: &Arc<EpisodeLinker>,
    patterns: &Arc<PatternDetector>,
    push: &Arc<PushChannel>,
) -> Result<JobOutcome, AppError> {
    const FT: &str = "835";
    let started = Instant::now();
    push.publish(progress_event(&filename, FT, job_id, FileProgressStage::Parsing, 0, "starting parse"));

    let mut source = open_source(source)?;
    let mut parsed_claims = Vec::new();
    let result = parser::parse_835(&mut source, |claim| {
        parsed_claims.push(claim);
        Ok(())
    });
    let (_, header) = result?;

    push.publish(progress_event(
        &filename,
        FT,
        job_id,
        FileProgressStage::Processing,
        parsed_claims.len() as u64,
        "parsed, resolving identities",
    ));

    let remittance = transformer.transform_remittance(header, parsed_claims)?;
    transformer.persist_remittance(&remittance)?;
    let payer_id = remittance.payer_id;

    push.publish(progress_event(
        &filename,
        FT,
        job_id,
        FileProgressStage::Saving,
        remittance.claims.len() as u64,
        "persisted remittance",
    ));

    let mut soft_deadline_hit = false;
    let mut linked: u64 = 0;
    for remit_claim in &remittance.claims {
        if started.elapsed() >= soft_deadline {
            soft_deadline_hit = true;
            break;
        }
        if let Some(episode) = linker.link(remit_claim, remittance.id)? {
            push.publish(PushEvent::EpisodeLinked {
                episode_id: episode.id,
                claim_id: episode.claim_id,
                remittance_id: remittance.id,
                status: episode.status,
            });
            if let Some(claim) = storage.get_claim(episode.claim_id)? {
                scorer.score(&claim)?;
            }
        }
        linked += 1;
    }

    if !soft_deadline_hit {
        let observations = storage.fetch_denial_observations(Some(payer_id), DEFAULT_WINDOW_DAYS)?;
        patterns.detect(&observations, DEFAULT_MIN_FREQUENCY, DEFAULT_MIN_OCCURRENCES)?;
    }

    let message = if soft_deadline_hit { "stopped at soft deadline" } else { "complete" };
    push.publish(progress_event(&filename, FT, job_id, FileProgressStage::Complete, linked, message));

    Ok(if soft_deadline_hit {
        JobOutcome::CompletedWithWarnings
    } else {
        JobOutcome::Completed
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use std::time::Duration;

    fn dispatcher() -> Arc<JobDispatcher> {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let cache = Cache::new();
        let push = PushChannel::new(64);
        let transformer = Arc::new(Transformer::new(storage.clone(), cache.clone(), "test-salt".to_string()));
        let scorer = Arc::new(RiskScorer::new(storage.clone(), cache.clone(), push.clone()));
        let linker = Arc::new(EpisodeLinker::new(storage.clone(), cache.clone()));
        let patterns = Arc::new(PatternDetector::new(storage.clone()));
        JobDispatcher::new(
            storage,
            transformer,
            scorer,
            linker,
            patterns,
            push,
            2,
            Duration::from_secs(30),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn recalculate_risk_on_unknown_claim_reports_not_found() {
        let dispatcher = dispatcher();
        let id = dispatcher
            .submit(JobKind::RecalculateRisk {
                claim_id: Uuid::new_v4(),
            })
            .unwrap();

        for _ in 0..50 {
            if let Some(status) = dispatcher.status(id) {
                if !matches!(status.state, JobState::Queued | JobState::Running) {
                    assert_eq!(status.state, JobState::Finished(JobOutcome::Failed));
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job did not finish in time");
    }

    #[tokio::test]
    async fn detect_patterns_with_no_observations_completes() {
        let dispatcher = dispatcher();
        let id = dispatcher.submit(JobKind::DetectPatterns { payer_id: None }).unwrap();

        for _ in 0..50 {
            if let Some(status) = dispatcher.status(id) {
                if matches!(status.state, JobState::Finished(_)) {
                    assert_eq!(status.state, JobState::Finished(JobOutcome::Completed));
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job did not finish in time");
    }
}
