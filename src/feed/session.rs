//! Feed session actor.
//!
//! One task owns the [`FeedState`] and [`RefreshScheduler`] and multiplexes
//! user intents, fetch results, change notifications, the polling interval
//! and the debounce deadline with a biased `select!`. Consumers talk to it
//! through a [`FeedHandle`] and observe it through a `watch` channel.

use super::fetcher::{fetch_page, Backend, FetchError, DEFAULT_FETCH_TIMEOUT};
use super::scheduler::{Decision, RefreshScheduler, Trigger};
use super::state::{FeedSnapshot, FeedState, FetchRequest, Outcome, RefreshPolicy, DEFAULT_PAGE_SIZE};
use super::types::{ChangeEvent, Filter, FilterPatch, Page, Sort};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// User-facing operations accepted by a session.
#[derive(Debug, Clone)]
pub enum Intent {
    ChangeFilter(FilterPatch),
    SetFilter(Filter),
    ClearFilters,
    ChangeSort(Sort),
    LoadMore,
    Refresh,
    DismissError,
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// The session task has stopped.
    #[error("Feed session is no longer running")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub page_size: u32,
    /// Polling period. `None` disables polling.
    pub refresh_interval: Option<Duration>,
    pub change_debounce: Duration,
    pub fetch_timeout: Duration,
    pub refresh_policy: RefreshPolicy,
    pub filter: Filter,
    pub sort: Sort,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            refresh_interval: None,
            change_debounce: Duration::from_millis(500),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            refresh_policy: RefreshPolicy::default(),
            filter: Filter::default(),
            sort: Sort::default(),
        }
    }
}

/// Handle to a running session. Dropping every handle stops the session.
pub struct FeedHandle {
    intents: mpsc::Sender<Intent>,
    snapshots: watch::Receiver<FeedSnapshot>,
    task: JoinHandle<()>,
}

impl FeedHandle {
    pub async fn dispatch(&self, intent: Intent) -> Result<(), SessionError> {
        self.intents
            .send(intent)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Latest published snapshot.
    pub fn state(&self) -> FeedSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot> {
        self.snapshots.clone()
    }

    /// Waits until a published snapshot satisfies `predicate`.
    pub async fn wait_until(
        &self,
        predicate: impl FnMut(&FeedSnapshot) -> bool,
    ) -> Result<FeedSnapshot, SessionError> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| SessionError::Closed)?;
        Ok(snapshot.clone())
    }

    /// Stops the session and waits for its task to exit.
    pub async fn shutdown(self) {
        drop(self.intents);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Feed session task ended abnormally");
        }
    }
}

/// Starts a session on the current runtime and issues the initial load.
///
/// `changes` is the optional realtime notification stream; when it is absent
/// or closes, the session relies on polling alone.
pub fn spawn(
    backend: Arc<dyn Backend>,
    options: SessionOptions,
    changes: Option<mpsc::Receiver<ChangeEvent>>,
) -> FeedHandle {
    let mut state = FeedState::new(options.page_size, options.filter, options.sort)
        .with_policy(options.refresh_policy);
    // Issued before the first snapshot so observers never see an idle,
    // empty feed that has not been asked for anything yet
    let initial = state.start();
    let (intent_tx, intent_rx) = mpsc::channel(32);
    let (results_tx, results_rx) = mpsc::channel(8);
    let (publish, snapshots) = watch::channel(state.snapshot());

    let ticker = options.refresh_interval.map(new_ticker);
    let session = Session {
        state,
        scheduler: RefreshScheduler::new(options.change_debounce),
        backend,
        fetch_timeout: options.fetch_timeout,
        results: results_tx,
        publish,
        fetch_task: None,
        ticker,
        refresh_interval: options.refresh_interval,
    };

    let task = tokio::spawn(session.run(initial, intent_rx, results_rx, changes));
    FeedHandle {
        intents: intent_tx,
        snapshots,
        task,
    }
}

fn new_ticker(period: Duration) -> Interval {
    // First tick one full period from now, not immediately
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

struct FetchOutcome {
    epoch: u64,
    result: Result<Page, FetchError>,
}

struct Session {
    state: FeedState,
    scheduler: RefreshScheduler,
    backend: Arc<dyn Backend>,
    fetch_timeout: Duration,
    results: mpsc::Sender<FetchOutcome>,
    publish: watch::Sender<FeedSnapshot>,
    /// The one live fetch. Superseded fetches are aborted.
    fetch_task: Option<(u64, JoinHandle<()>)>,
    ticker: Option<Interval>,
    refresh_interval: Option<Duration>,
}

impl Session {
    async fn run(
        mut self,
        initial: Option<FetchRequest>,
        mut intents: mpsc::Receiver<Intent>,
        mut results: mpsc::Receiver<FetchOutcome>,
        mut changes: Option<mpsc::Receiver<ChangeEvent>>,
    ) {
        self.launch(initial);

        loop {
            let deadline = self.scheduler.deadline();

            tokio::select! {
                biased;

                intent = intents.recv() => match intent {
                    Some(intent) => self.handle_intent(intent),
                    None => {
                        tracing::debug!("All feed handles dropped, stopping session");
                        break;
                    }
                },

                Some(outcome) = results.recv() => self.handle_result(outcome),

                event = next_change(&mut changes) => match event {
                    Some(event) => self.handle_change(event),
                    None => {
                        tracing::warn!("Change stream closed, falling back to polling");
                        changes = None;
                    }
                },

                _ = next_tick(&mut self.ticker) => self.trigger(Trigger::Interval),

                _ = sleep_until(deadline) => {
                    if self.scheduler.take_due(Instant::now()) {
                        self.fire_refresh();
                    }
                }
            }

            self.publish();
        }

        if let Some((epoch, task)) = self.fetch_task.take() {
            tracing::debug!(epoch, "Aborting fetch on shutdown");
            task.abort();
        }
    }

    fn handle_intent(&mut self, intent: Intent) {
        tracing::debug!(?intent, "Handling intent");
        let request = match intent {
            Intent::ChangeFilter(patch) => {
                let request = self.state.update_filter(patch);
                self.view_changed(request)
            }
            Intent::SetFilter(filter) => {
                let request = self.state.set_filter(filter);
                self.view_changed(request)
            }
            Intent::ClearFilters => {
                let request = self.state.clear_filters();
                self.view_changed(request)
            }
            Intent::ChangeSort(sort) => {
                let request = self.state.set_sort(sort);
                self.view_changed(request)
            }
            Intent::LoadMore => self.state.load_more(),
            Intent::Refresh => {
                self.trigger(Trigger::Manual);
                None
            }
            Intent::DismissError => {
                self.state.dismiss_error();
                None
            }
        };
        self.launch(request);
    }

    /// A new view supersedes any pending or in-flight refresh and restarts
    /// the polling period.
    fn view_changed(&mut self, request: Option<FetchRequest>) -> Option<FetchRequest> {
        if request.is_some() {
            self.scheduler.cancel();
            if let Some(period) = self.refresh_interval {
                self.ticker = Some(new_ticker(period));
            }
        }
        request
    }

    fn handle_result(&mut self, outcome: FetchOutcome) {
        self.scheduler.finished(outcome.epoch);
        let completion = self.state.complete(outcome.epoch, outcome.result);
        if completion.outcome != Outcome::Stale {
            self.fetch_task = None;
        }
        self.launch(completion.next);
    }

    fn handle_change(&mut self, event: ChangeEvent) {
        let patch = self.state.apply_change(&event);
        if patch.needs_confirmation() {
            self.trigger(Trigger::Change);
        }
    }

    fn trigger(&mut self, trigger: Trigger) {
        if trigger != Trigger::Manual && !self.state.auto_refresh_allowed() {
            tracing::debug!(?trigger, "Automatic refresh suspended until manual retry");
            return;
        }
        match self.scheduler.request(trigger, Instant::now()) {
            Decision::FireNow => self.fire_refresh(),
            Decision::FireAt(at) => {
                tracing::debug!(
                    ?trigger,
                    delay_ms = at.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "Refresh debounced"
                );
            }
            Decision::Coalesced => {}
        }
    }

    fn fire_refresh(&mut self) {
        let request = self.state.refresh();
        if let Some(request) = &request {
            self.scheduler.started(request.epoch);
        }
        self.launch(request);
    }

    /// Runs `request` on a background task. At most one fetch is live, so any
    /// previous task belongs to a superseded request.
    fn launch(&mut self, request: Option<FetchRequest>) {
        let Some(request) = request else {
            return;
        };

        if let Some((epoch, task)) = self.fetch_task.take() {
            if !task.is_finished() {
                tracing::debug!(epoch, "Aborting superseded fetch");
                task.abort();
            }
        }

        let backend = Arc::clone(&self.backend);
        let results = self.results.clone();
        let timeout = self.fetch_timeout;
        let epoch = request.epoch;
        let task = tokio::spawn(async move {
            let result = fetch_page(backend.as_ref(), &request.descriptor, timeout).await;
            // Session gone means nobody wants the page
            let _ = results.send(FetchOutcome { epoch, result }).await;
        });
        self.fetch_task = Some((epoch, task));
    }

    fn publish(&self) {
        self.publish.send_replace(self.state.snapshot());
    }
}

async fn next_change(changes: &mut Option<mpsc::Receiver<ChangeEvent>>) -> Option<ChangeEvent> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
