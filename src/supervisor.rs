// Supervisor loop: ties clock, fetcher, diff engine and
// dispatcher together. The Dispatcher is moved wholesale into the spawned
// polling task once `start()` runs, so it is touched from exactly one place
// -- no lock is needed for the state it owns. Everything external
// callers (and tests) can observe afterwards -- running counts -- comes back
// through the lock-free `Stats` handle grabbed before the move.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::builder::Builder;
use crate::clock::Clock;
use crate::diff::compute_diff;
use crate::dispatcher::{Dispatcher, Stats};
use crate::fetcher::Fetcher;
use crate::refs::{RefSnapshot, Sha};

type FetchFut = Pin<Box<dyn Future<Output = anyhow::Result<RefSnapshot>> + Send>>;

/// Construction-time configuration errors.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("max_concurrent must be > 0, got {0}")]
    NonPositiveConcurrency(usize),
    #[error("poll_interval must be positive, got {0:?}")]
    NonPositivePollInterval(Duration),
}

pub struct Supervisor<F: Fetcher, B: Builder, C: Clock> {
    fetcher: Arc<F>,
    clock: Arc<C>,
    poll_interval: Duration,
    // `None` once `start()` has moved it into the polling task.
    dispatcher: StdMutex<Option<Dispatcher<B>>>,
    stats: Stats,
    cancel: CancellationToken,
    handle: StdMutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl<F: Fetcher, B: Builder, C: Clock> Supervisor<F, B, C> {
    pub fn new(
        fetcher: F,
        max_concurrent: usize,
        poll_interval: Duration,
        builder: B,
        clock: C,
    ) -> Result<Self, ConfigError> {
        if max_concurrent == 0 {
            return Err(ConfigError::NonPositiveConcurrency(max_concurrent));
        }
        if poll_interval.is_zero() {
            return Err(ConfigError::NonPositivePollInterval(poll_interval));
        }
        let dispatcher = Dispatcher::new(max_concurrent, Arc::new(builder))
            .expect("max_concurrent already validated above");
        let stats = dispatcher.stats();
        Ok(Self {
            fetcher: Arc::new(fetcher),
            clock: Arc::new(clock),
            poll_interval,
            dispatcher: StdMutex::new(Some(dispatcher)),
            stats,
            cancel: CancellationToken::new(),
            handle: StdMutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// Preloads SeenCommits. Permitted only before `start()`; a call
    /// after `start()` is ignored and logged.
    pub fn seed(&self, shas: impl IntoIterator<Item = Sha>) {
        match self.dispatcher.lock().unwrap().as_mut() {
            Some(d) => d.seed(shas),
            None => warn!("ignoring seed() call after start()"),
        }
    }

    pub fn stats(&self) -> Stats {
        self.stats.clone()
    }

    /// Idempotent; enters Polling.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap()
            .take()
            .expect("dispatcher only taken once, guarded by `started`");
        let fetcher = self.fetcher.clone();
        let clock = self.clock.clone();
        let poll_interval = self.poll_interval;
        let cancel = self.cancel.clone();
        let task = tokio::spawn(run_loop(fetcher, clock, poll_interval, dispatcher, cancel));
        *self.handle.lock().unwrap() = Some(task);
    }

    /// Idempotent; enters Stopped. Waits for the polling task to actually
    /// exit so that, once this returns, no further `fetch_refs`/`run_build`
    /// calls can occur.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_loop<F: Fetcher, B: Builder, C: Clock>(
    fetcher: Arc<F>,
    clock: Arc<C>,
    poll_interval: Duration,
    mut dispatcher: Dispatcher<B>,
    cancel: CancellationToken,
) {
    let mut ticker = clock.ticker(poll_interval);
    let mut fetch_fut: Option<FetchFut> = None;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = ticker.tick() => {
                if fetch_fut.is_some() {
                    debug!("previous fetchRefs call still in flight; skipping this tick");
                } else {
                    let fetcher = fetcher.clone();
                    fetch_fut = Some(Box::pin(async move { fetcher.fetch_refs().await }));
                }
            }

            result = poll_fetch(&mut fetch_fut), if fetch_fut.is_some() => {
                fetch_fut = None;
                match result {
                    Ok(snapshot) => {
                        let diff = compute_diff(&snapshot, dispatcher.seen(), &dispatcher.active_shas());
                        for sha in &diff.to_cancel {
                            dispatcher.cancel(sha);
                        }
                        for r in diff.to_launch {
                            dispatcher.submit(r);
                        }
                    }
                    Err(e) => warn!("fetchRefs failed, skipping this tick: {e:#}"),
                }
            }

            Some(completion) = dispatcher.drive() => {
                if completion.stale {
                    debug!("stale completion for {} ({})", completion.ref_name, completion.sha);
                } else {
                    match &completion.outcome {
                        Ok(outcome) => debug!(
                            "build for {} ({}) {}", completion.ref_name, completion.sha, outcome
                        ),
                        Err(e) => warn!(
                            "build for {} ({}) errored: {e:#}", completion.ref_name, completion.sha
                        ),
                    }
                }
            }
        }
    }

    dispatcher.shutdown();
}

/// `fetch_fut.as_mut().unwrap().await`, pulled into a free function so the
/// borrow lives only as long as this call and `select!`'s `if` guard can
/// check `is_some()` beforehand without a double mutable borrow.
async fn poll_fetch(fetch_fut: &mut Option<FetchFut>) -> anyhow::Result<RefSnapshot> {
    fetch_fut.as_mut().expect("guarded by is_some()").as_mut().await
}
