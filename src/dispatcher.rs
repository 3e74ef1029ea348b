// Concurrency dispatcher. Owns the only shared mutable state
// besides the clock: SeenCommits, the FIFO pending queue, and the active-build
// map, all touched exclusively from the Supervisor's single loop task
// (a single logical executor) -- no lock is needed because nothing
// else ever calls into the dispatcher concurrently.
//
// Builds run on separate spawned tasks, reporting back over an mpsc channel
// so the dispatcher can promote the queue without waiting for the cancelled
// build to actually exit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::builder::{BuildOutcome, Builder};
use crate::refs::{Ref, Sha};
use crate::seen::SeenCommits;

/// Monotonic id distinguishing successive launches of the same SHA, so a
/// late completion from a build we already cancelled-and-replaced can be
/// told apart from the build currently occupying that slot.
type LaunchId = u64;

struct ActiveEntry {
    id: LaunchId,
    ref_name: String,
    cancel: CancellationToken,
}

struct PendingBuild {
    r: Ref,
}

/// What happened to a build, reported back to the Supervisor for logging and
/// metrics. Stale completions (a cancelled build finally exiting after its
/// slot was already reused) are folded in as `stale: true`.
pub struct Completion {
    pub sha: Sha,
    pub ref_name: String,
    pub outcome: anyhow::Result<BuildOutcome>,
    pub stale: bool,
}

/// Cheap-to-clone, lock-free handle onto the dispatcher's running counters.
/// Safe to read concurrently with the dispatcher's owning task, so a
/// `Supervisor` can hand one out to callers without exposing the dispatcher
/// itself (which is moved into the polling task and otherwise unshared).
#[derive(Clone, Default)]
pub struct Stats(Arc<StatsInner>);

#[derive(Default)]
struct StatsInner {
    launched: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
}

impl Stats {
    pub fn launched(&self) -> usize {
        self.0.launched.load(Ordering::SeqCst)
    }
    pub fn completed(&self) -> usize {
        self.0.completed.load(Ordering::SeqCst)
    }
    pub fn failed(&self) -> usize {
        self.0.failed.load(Ordering::SeqCst)
    }
    pub fn cancelled(&self) -> usize {
        self.0.cancelled.load(Ordering::SeqCst)
    }
    /// Currently-running builds: launched minus every terminal outcome.
    pub fn live(&self) -> usize {
        self.launched() - self.completed() - self.failed() - self.cancelled()
    }

    fn inc_launched(&self) {
        self.0.launched.fetch_add(1, Ordering::SeqCst);
    }
    fn inc_completed(&self) {
        self.0.completed.fetch_add(1, Ordering::SeqCst);
    }
    fn inc_failed(&self) {
        self.0.failed.fetch_add(1, Ordering::SeqCst);
    }
    fn inc_cancelled(&self) {
        self.0.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Dispatcher<B: Builder> {
    max_concurrent: usize,
    builder: Arc<B>,
    seen: SeenCommits,
    active: HashMap<Sha, ActiveEntry>,
    queue: VecDeque<PendingBuild>,
    next_launch_id: LaunchId,
    completions_tx: mpsc::UnboundedSender<(Sha, LaunchId, anyhow::Result<BuildOutcome>)>,
    completions_rx: mpsc::UnboundedReceiver<(Sha, LaunchId, anyhow::Result<BuildOutcome>)>,
    stats: Stats,
    shutting_down: bool,
}

impl<B: Builder> Dispatcher<B> {
    pub fn new(max_concurrent: usize, builder: Arc<B>) -> anyhow::Result<Self> {
        if max_concurrent == 0 {
            anyhow::bail!("maxConcurrent must be > 0, got {max_concurrent}");
        }
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Ok(Self {
            max_concurrent,
            builder,
            seen: SeenCommits::new(),
            active: HashMap::new(),
            queue: VecDeque::new(),
            next_launch_id: 0,
            completions_tx,
            completions_rx,
            stats: Stats::default(),
            shutting_down: false,
        })
    }

    pub fn stats(&self) -> Stats {
        self.stats.clone()
    }

    pub fn seen(&self) -> &SeenCommits {
        &self.seen
    }

    /// Preload SeenCommits. Only meaningful before the Supervisor starts
    /// submitting; enforcement of that one-shot latch lives in `Supervisor`.
    pub fn seed(&mut self, shas: impl IntoIterator<Item = Sha>) {
        self.seen.add_all(shas);
    }

    pub fn active_shas(&self) -> HashSet<Sha> {
        self.active.keys().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.active.len()
    }

    /// Adds `r.sha()` to SeenCommits at submission time and either
    /// starts it immediately or enqueues it, FIFO.
    pub fn submit(&mut self, r: Ref) {
        if self.shutting_down {
            return;
        }
        if self.active.contains_key(r.sha()) || self.queue.iter().any(|p| p.r.sha() == r.sha()) {
            // Invariant 3: no two Active/Pending records share a SHA.
            return;
        }
        self.seen.add(r.sha().clone());
        if self.active.len() < self.max_concurrent {
            self.launch(r);
        } else {
            self.queue.push_back(PendingBuild { r });
        }
    }

    /// Cancels a queued or running build. No-op if the SHA is unknown. Does
    /// not wait for a running build's activity to actually stop before
    /// promoting the next queued build into its slot.
    pub fn cancel(&mut self, sha: &str) {
        if let Some(pos) = self.queue.iter().position(|p| p.r.sha() == sha) {
            self.queue.remove(pos);
            return;
        }
        if let Some(entry) = self.active.remove(sha) {
            debug!("cancelling build for {} ({})", entry.ref_name, sha);
            entry.cancel.cancel();
            self.promote_queue();
        }
    }

    /// Cancels all queued and running builds and refuses new submissions.
    pub fn shutdown(&mut self) {
        self.shutting_down = true;
        self.queue.clear();
        for (_, entry) in self.active.drain() {
            entry.cancel.cancel();
        }
    }

    /// Awaits the next build completion, applies bookkeeping (frees the
    /// active slot, promotes the queue), and returns it for logging/metrics.
    /// Returns `None` only if every sender has been dropped, which cannot
    /// happen while `self` is alive (the dispatcher holds one itself).
    pub async fn drive(&mut self) -> Option<Completion> {
        let (sha, launch_id, outcome) = self.completions_rx.recv().await?;
        self.account(&outcome);
        let (ref_name, stale) = match self.active.get(&sha) {
            Some(entry) if entry.id == launch_id => {
                let entry = self.active.remove(&sha).expect("just matched");
                self.promote_queue();
                (entry.ref_name, false)
            }
            // Slot already freed and possibly reused by `cancel` -- this
            // completion is the original build finally exiting. It still
            // counts for accounting but must not touch `active`/`queue`
            // again. Its outcome isn't necessarily `Canceled`: `ProcessBuilder`
            // polls the child's own completion before the cancellation signal,
            // so a build whose process happened to exit right as it was
            // cancelled can still report `Completed`/`Err` here.
            _ => (String::new(), true),
        };
        Some(Completion {
            ref_name,
            sha,
            outcome,
            stale,
        })
    }

    /// Credits exactly one terminal bucket for every completion, stale or not.
    fn account(&self, outcome: &anyhow::Result<BuildOutcome>) {
        match outcome {
            Ok(BuildOutcome::Completed { exit_code: 0 }) => self.stats.inc_completed(),
            Ok(BuildOutcome::Completed { .. }) => self.stats.inc_failed(),
            Ok(BuildOutcome::Canceled) => self.stats.inc_cancelled(),
            Err(_) => self.stats.inc_failed(),
        }
    }

    fn promote_queue(&mut self) {
        if let Some(pending) = self.queue.pop_front() {
            self.launch(pending.r);
        }
    }

    fn launch(&mut self, r: Ref) {
        let id = self.next_launch_id;
        self.next_launch_id += 1;
        let cancel = CancellationToken::new();
        let sha = r.sha().clone();
        self.active.insert(
            sha.clone(),
            ActiveEntry {
                id,
                ref_name: r.name.clone(),
                cancel: cancel.clone(),
            },
        );
        self.stats.inc_launched();
        info!("launching build for {} ({})", r.name, sha);

        let builder = self.builder.clone();
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let outcome = builder.run_build(&r, cancel).await;
            if let Err(e) = &outcome {
                warn!("build for {} ({}) errored: {e:#}", r.name, r.sha());
            }
            let _ = tx.send((r.sha().clone(), id, outcome));
        });
    }
}
