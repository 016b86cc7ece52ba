//! Single-flight caching. Each distinct [`RunConfig`] reaches the inner
//! evaluator at most once no matter how many callers ask for it
//! concurrently. Terminal results are kept for the lifetime of the
//! decorator, except KILLED ones which are never cached.
//!
//! Work happens on three small worker pools fed by channels: one submits
//! newly owned configurations, one fires caller completions and one
//! delivers observer snapshots. None of them ever runs on the stack of a
//! caller's `evaluate_runs_async`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use itertools::Itertools;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::core::{
    domain::{KillHandler, RunConfig, RunResult, RunStatus},
    errors::EvaluatorError,
    pipeline::complete_detached,
    traits::evaluator::{CompletionHandler, Evaluator, RunObserver},
};

const WORKERS_PER_POOL: usize = 2;

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(0);

pub struct CachingEvaluator {
    inner: Arc<dyn Evaluator>,
    entries: DashMap<RunConfig, Arc<CacheEntry>>,
    queues: Queues,
    shut_down: Arc<AtomicBool>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl fmt::Debug for CachingEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingEvaluator")
            .field("inner", &self.inner)
            .field("entries", &self.entries.len())
            .field("hits", &self.cache_hits())
            .field("misses", &self.cache_misses())
            .finish()
    }
}

impl CachingEvaluator {
    /// Spawns the worker pools, so it must be called within a Tokio runtime.
    pub fn new(inner: Arc<dyn Evaluator>) -> Self {
        let queues = Queues {
            submit: spawn_pool("submit", submit),
            complete: spawn_pool("completion", |token: Arc<Token>| token.fire()),
            observe: spawn_pool("observe", |token: Arc<Token>| token.deliver_snapshot()),
        };
        Self {
            inner,
            entries: DashMap::new(),
            queues,
            shut_down: Arc::new(AtomicBool::new(false)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Requests answered from a finished or already running evaluation.
    pub fn cache_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Requests that had to be submitted to the inner evaluator.
    pub fn cache_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn entry(&self, rc: &RunConfig) -> Arc<CacheEntry> {
        self.entries
            .entry(rc.clone())
            .or_insert_with(|| Arc::new(CacheEntry::new(rc.clone())))
            .value()
            .clone()
    }
}

/// Channels feeding the worker pools.
#[derive(Clone)]
struct Queues {
    submit: mpsc::UnboundedSender<SubmitJob>,
    complete: mpsc::UnboundedSender<Arc<Token>>,
    observe: mpsc::UnboundedSender<Arc<Token>>,
}

fn spawn_pool<T: Send + 'static>(name: &'static str, handle: fn(T)) -> mpsc::UnboundedSender<T> {
    let (tx, rx) = mpsc::unbounded_channel();
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    for worker in 0..WORKERS_PER_POOL {
        let rx = rx.clone();
        tokio::spawn(async move {
            loop {
                let job = rx.lock().await.recv().await;
                match job {
                    Some(job) => handle(job),
                    None => break,
                }
            }
            tracing::trace!("Cache {} worker {} stopped", name, worker);
        });
    }
    tx
}

enum Phase {
    Idle,
    Submitted,
    Done(RunResult),
}

struct CacheEntry {
    rc: RunConfig,
    state: Mutex<EntryState>,
}

struct EntryState {
    phase: Phase,
    live: Option<RunResult>,
    waiters: Vec<(Arc<Token>, usize)>,
    interested: usize,
}

impl CacheEntry {
    fn new(rc: RunConfig) -> Self {
        Self {
            rc,
            state: Mutex::new(EntryState {
                phase: Phase::Idle,
                live: None,
                waiters: Vec::new(),
                interested: 0,
            }),
        }
    }
}

/// Kill handle given to one caller for one position. Kills the shared run
/// only when no other caller is still waiting for it.
#[derive(Debug)]
struct CallerKillHandler {
    entry: Arc<CacheEntry>,
    token_id: u64,
    pos: usize,
    killed: AtomicBool,
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry").field("rc", &self.rc).finish()
    }
}

impl KillHandler for CallerKillHandler {
    fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        let live = {
            let mut state = self.entry.state.lock();
            let waiting = state
                .waiters
                .iter()
                .any(|(token, pos)| token.id == self.token_id && *pos == self.pos);
            if !waiting {
                return;
            }
            state.interested = state.interested.saturating_sub(1);
            if state.interested > 0 {
                return;
            }
            state.live.clone()
        };
        if let Some(live) = live {
            tracing::debug!("No caller left waiting for {}, killing it", self.entry.rc);
            live.kill();
        }
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

/// Per-call record: what the caller asked for and how to answer it.
struct Token {
    id: u64,
    runs: Vec<RunConfig>,
    entries: Vec<Arc<CacheEntry>>,
    kill_handlers: Vec<Arc<CallerKillHandler>>,
    observer: Option<RunObserver>,
    queues: Queues,
    state: Mutex<TokenState>,
    delivery: Mutex<()>,
    fired: AtomicBool,
    observe_queued: AtomicBool,
}

struct TokenState {
    results: Vec<Option<RunResult>>,
    outstanding: usize,
    on_complete: Option<CompletionHandler>,
    completion_queued: bool,
    failure: Option<EvaluatorError>,
}

impl Token {
    fn resolve(self: &Arc<Self>, pos: usize, result: RunResult) {
        let mut state = self.state.lock();
        if state.results[pos].is_some() {
            return;
        }
        state.results[pos] = Some(result);
        state.outstanding -= 1;
        let finished = state.outstanding == 0;
        drop(state);

        if finished {
            self.queue_completion();
        } else {
            self.queue_observe();
        }
    }

    fn fail(self: &Arc<Self>, error: EvaluatorError) {
        {
            let mut state = self.state.lock();
            if state.failure.is_none() {
                state.failure = Some(error);
            }
        }
        self.queue_completion();
    }

    fn queue_completion(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.completion_queued {
                return;
            }
            state.completion_queued = true;
        }
        if self.queues.complete.send(self.clone()).is_err() {
            tracing::error!("Cache completion workers are gone");
        }
    }

    fn queue_observe(self: &Arc<Self>) {
        if self.observer.is_none() || self.fired.load(Ordering::SeqCst) {
            return;
        }
        if !self.observe_queued.swap(true, Ordering::SeqCst) {
            let _ = self.queues.observe.send(self.clone());
        }
    }

    fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
        // waits out an observer delivery already in progress
        drop(self.delivery.lock());

        let (on_complete, result) = {
            let mut state = self.state.lock();
            let result = match &state.failure {
                Some(e) => Err(e.clone()),
                None => state
                    .results
                    .iter()
                    .cloned()
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| EvaluatorError::Internal {
                        msg: "cached batch completed without every result".to_string(),
                    }),
            };
            (state.on_complete.take(), result)
        };
        if let Some(on_complete) = on_complete {
            on_complete(result);
        }
    }

    fn deliver_snapshot(&self) {
        self.observe_queued.store(false, Ordering::SeqCst);
        let Some(observer) = &self.observer else {
            return;
        };
        let _delivery = self.delivery.lock();
        if self.fired.load(Ordering::SeqCst) {
            return;
        }
        observer(&self.snapshot());
    }

    fn snapshot(&self) -> Vec<RunResult> {
        let results = self.state.lock().results.clone();
        results
            .into_iter()
            .enumerate()
            .map(|(pos, result)| {
                if let Some(result) = result {
                    return result;
                }
                let handler = self.kill_handlers[pos].clone();
                let live = self.entries[pos].state.lock().live.clone();
                match live {
                    Some(live) if live.is_running() => live.with_kill_handler(handler),
                    Some(live) if live.status() != RunStatus::Killed => live,
                    live => {
                        let (runtime, wallclock) = live
                            .map(|l| (l.runtime(), l.wallclock_time()))
                            .unwrap_or_default();
                        RunResult::running(self.runs[pos].clone(), runtime, wallclock, handler)
                    }
                }
            })
            .collect()
    }
}

struct SubmitJob {
    inner: Arc<dyn Evaluator>,
    queues: Queues,
    shut_down: Arc<AtomicBool>,
    entries: Vec<Arc<CacheEntry>>,
}

fn submit(job: SubmitJob) {
    let SubmitJob {
        inner,
        queues,
        shut_down,
        entries,
    } = job;
    let runs = entries.iter().map(|entry| entry.rc.clone()).collect();
    let entries = Arc::new(entries);

    let observer: RunObserver = {
        let entries = entries.clone();
        Arc::new(move |results: &[RunResult]| observe_entries(&entries, results))
    };

    let resubmit_to = inner.clone();
    inner.evaluate_runs_async(
        runs,
        Box::new(move |result| match result {
            Ok(results) => {
                for (entry, result) in entries.iter().zip(results) {
                    complete_entry(entry, result, &resubmit_to, &queues, &shut_down);
                }
            }
            Err(e) => {
                tracing::error!("Inner evaluator failed for {} cached run(s): {}", entries.len(), e);
                for entry in entries.iter() {
                    fail_entry(entry, &e);
                }
            }
        }),
        Some(observer),
    );
}

fn observe_entries(entries: &[Arc<CacheEntry>], results: &[RunResult]) {
    for (entry, result) in entries.iter().zip(results) {
        let (tokens, orphaned) = {
            let mut state = entry.state.lock();
            if !matches!(state.phase, Phase::Submitted) {
                continue;
            }
            state.live = Some(result.clone());
            let tokens: Vec<_> = state.waiters.iter().map(|(token, _)| token.clone()).collect();
            (tokens, state.interested == 0 && result.is_running())
        };
        if orphaned {
            tracing::debug!("No caller left waiting for {}, killing it", entry.rc);
            result.kill();
        }
        for token in tokens {
            token.queue_observe();
        }
    }
}

fn complete_entry(
    entry: &Arc<CacheEntry>,
    result: RunResult,
    inner: &Arc<dyn Evaluator>,
    queues: &Queues,
    shut_down: &Arc<AtomicBool>,
) {
    let mut state = entry.state.lock();
    let waiters = std::mem::take(&mut state.waiters);
    state.live = None;

    let killed = result.status() == RunStatus::Killed;
    let (deliver, resubmit) = if killed && shut_down.load(Ordering::SeqCst) {
        // a shut down evaluator answers every resubmission with KILLED
        state.phase = Phase::Idle;
        state.interested = 0;
        (waiters, false)
    } else if killed {
        let (killers, keepers): (Vec<_>, Vec<_>) = waiters
            .into_iter()
            .partition(|(token, pos)| token.kill_handlers[*pos].is_killed());
        let resubmit = !keepers.is_empty();
        state.phase = if resubmit { Phase::Submitted } else { Phase::Idle };
        state.interested = keepers.len();
        state.waiters = keepers;
        (killers, resubmit)
    } else {
        state.phase = Phase::Done(result.clone());
        state.interested = 0;
        (waiters, false)
    };
    drop(state);

    if resubmit {
        tracing::debug!("Resubmitting {}, it was killed while other callers still wait", entry.rc);
        let job = SubmitJob {
            inner: inner.clone(),
            queues: queues.clone(),
            shut_down: shut_down.clone(),
            entries: vec![entry.clone()],
        };
        if queues.submit.send(job).is_err() {
            tracing::error!("Cache submit workers are gone");
        }
    }
    for (token, pos) in deliver {
        token.resolve(pos, result.clone());
    }
}

/// Unblocks every waiter and forgets the entry so a later request retries.
fn fail_entry(entry: &Arc<CacheEntry>, error: &EvaluatorError) {
    let waiters = {
        let mut state = entry.state.lock();
        state.phase = Phase::Idle;
        state.live = None;
        state.interested = 0;
        std::mem::take(&mut state.waiters)
    };
    for (token, _) in waiters {
        token.fail(error.clone());
    }
}

#[async_trait::async_trait]
impl Evaluator for CachingEvaluator {
    #[tracing::instrument(skip_all, fields(runs = runs.len()))]
    fn evaluate_runs_async(
        &self,
        runs: Vec<RunConfig>,
        on_complete: CompletionHandler,
        observer: Option<RunObserver>,
    ) {
        if runs.is_empty() {
            complete_detached(on_complete, Ok(Vec::new()));
            return;
        }
        if let Some(duplicate) = runs.iter().duplicates().next() {
            complete_detached(
                on_complete,
                Err(EvaluatorError::DuplicateRunConfig {
                    run: duplicate.to_string(),
                }),
            );
            return;
        }

        let id = NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed);
        let entries: Vec<_> = runs.iter().map(|rc| self.entry(rc)).collect();
        let kill_handlers = entries
            .iter()
            .enumerate()
            .map(|(pos, entry)| {
                Arc::new(CallerKillHandler {
                    entry: entry.clone(),
                    token_id: id,
                    pos,
                    killed: AtomicBool::new(false),
                })
            })
            .collect();
        let token = Arc::new(Token {
            id,
            entries: entries.clone(),
            kill_handlers,
            observer,
            queues: self.queues.clone(),
            state: Mutex::new(TokenState {
                results: vec![None; runs.len()],
                outstanding: runs.len(),
                on_complete: Some(on_complete),
                completion_queued: false,
                failure: None,
            }),
            delivery: Mutex::new(()),
            fired: AtomicBool::new(false),
            observe_queued: AtomicBool::new(false),
            runs,
        });

        let mut owned = Vec::new();
        let mut cached = Vec::new();
        for (pos, entry) in entries.into_iter().enumerate() {
            let mut state = entry.state.lock();
            if let Phase::Done(result) = &state.phase {
                cached.push((pos, result.clone()));
                continue;
            }
            if matches!(state.phase, Phase::Idle) {
                state.phase = Phase::Submitted;
                owned.push(entry.clone());
            }
            state.interested += 1;
            state.waiters.push((token.clone(), pos));
        }

        let misses = owned.len() as u64;
        self.misses.fetch_add(misses, Ordering::Relaxed);
        self.hits
            .fetch_add(token.runs.len() as u64 - misses, Ordering::Relaxed);
        tracing::debug!(
            "{} run(s) submitted, {} answered from cache or in flight",
            misses,
            token.runs.len() as u64 - misses
        );

        if !owned.is_empty() {
            let job = SubmitJob {
                inner: self.inner.clone(),
                queues: self.queues.clone(),
                shut_down: self.shut_down.clone(),
                entries: owned,
            };
            if self.queues.submit.send(job).is_err() {
                token.fail(EvaluatorError::Internal {
                    msg: "cache submit workers are gone".to_string(),
                });
            }
        }
        for (pos, result) in cached {
            token.resolve(pos, result);
        }
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.inner.shutdown();
    }

    async fn wait_for_outstanding(&self) {
        self.inner.wait_for_outstanding().await;
    }
}
