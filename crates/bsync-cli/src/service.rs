//! The sync service: one shared instance owning the queue, the engine
//! connection table and the store.
//!
//! All mutable state sits behind a single async mutex. A delivery round
//! takes the lock to build the request, releases it for the engine calls,
//! and takes it again to settle the outcome. Immediately dispatched
//! events run on tracked tasks so shutdown can drain them.
//!
//! Events whose every target is offline are parked outside the queue so
//! they never crowd out deliverable work; they rejoin the queue once one
//! of their engines is reachable again.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bsync_core::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_CONTEXT_TTL_SECS, DEFAULT_ENGINE_CONCURRENCY,
    DEFAULT_RATE_LIMIT_PER_MINUTE, HEALTH_TIMEOUT_SECS,
};
use bsync_core::session::SESSION_IDLE_SECS;
use bsync_core::time::{now_iso8601, now_unix_millis, now_unix_secs};
use bsync_core::{
    BehaviorEvent, ClientMeta, ConnectionState, ConnectionTable, DispatchRequest, DispatchStats,
    EngineAttempt, EngineId, EngineReply, EngineResponse, EngineSpec, EventDraft,
    FixedWindowLimiter, Insight, MAX_ATTEMPTS, MetricTotals, PriorityQueue, SessionData,
    StatusSummary, SyncError, Transition, TtlCache, UserContext, Verdict,
};
use bsync_store::{QueueCounts, Store, StoreError, StreamRow, UserProfile};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore, broadcast};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::EngineTransport;
use crate::config::DispatchConfig;

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub batch_size: usize,
    pub health_timeout: Duration,
    pub max_concurrency_per_engine: usize,
    pub context_ttl_secs: u64,
    pub rate_limit_per_minute: u32,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            health_timeout: Duration::from_secs(HEALTH_TIMEOUT_SECS),
            max_concurrency_per_engine: DEFAULT_ENGINE_CONCURRENCY,
            context_ttl_secs: DEFAULT_CONTEXT_TTL_SECS,
            rate_limit_per_minute: DEFAULT_RATE_LIMIT_PER_MINUTE,
        }
    }
}

impl From<&DispatchConfig> for ServiceOptions {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            health_timeout: config.health_timeout(),
            max_concurrency_per_engine: config.max_concurrency_per_engine,
            context_ttl_secs: config.context_ttl_secs,
            rate_limit_per_minute: config.rate_limit_per_minute,
        }
    }
}

/// Fire-and-forget notifications for whoever is listening.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceSignal {
    EngineOffline { engine: EngineId, error: String },
    EngineRecovered { engine: EngineId },
    RankingRecalculation { user_id: u64, engine: EngineId },
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueueReceipt {
    pub id: Uuid,
    pub action: &'static str,
    pub priority: u8,
    pub immediate: bool,
    pub queue_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub dispatched: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    pub deferred: usize,
    pub queue_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub engines: BTreeMap<EngineId, StatusSummary>,
    /// Pending events held in memory, parked ones included.
    pub queue_size: usize,
    /// Held back because every target engine is offline.
    pub parked: usize,
    pub in_flight: usize,
    pub stats: DispatchStats,
    pub persisted: QueueCounts,
    pub rate_limit_remaining: u32,
    pub context_cache: CacheReport,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheReport {
    pub hits: u64,
    pub misses: u64,
}

struct ServiceState {
    queue: PriorityQueue,
    /// Pending events with no reachable target, keyed by id.
    parked: HashMap<Uuid, BehaviorEvent>,
    connections: ConnectionTable,
    store: Store,
    contexts: TtlCache<u64, UserContext>,
    sessions: TtlCache<u64, SessionData>,
    limiter: FixedWindowLimiter,
    stats: DispatchStats,
    /// Popped or immediately dispatched, not yet settled.
    inflight: HashSet<Uuid>,
}

impl ServiceState {
    /// Cached profile and metrics, plus the live session if any.
    fn user_context(&mut self, user_id: u64) -> UserContext {
        let now = now_unix_millis();
        let mut context = match self.contexts.get(&user_id, now) {
            Some(context) => context,
            None => match self.load_context(user_id) {
                Ok(context) => {
                    self.contexts.insert(user_id, context.clone(), now);
                    context
                }
                Err(e) => {
                    error!("failed to load context for user {user_id}: {e}");
                    UserContext::anonymous(user_id)
                }
            },
        };
        context.session_data = self.sessions.get(&user_id, now);
        context
    }

    fn record_session(&mut self, draft: &EventDraft, client: &ClientMeta) {
        let now = now_unix_millis();
        let now_secs = now_unix_secs();
        let mut session = self
            .sessions
            .get(&draft.user_id, now)
            .unwrap_or_else(|| SessionData::start(now_secs));
        session.record(draft, client, now_secs);
        self.sessions.insert(draft.user_id, session, now);
    }

    fn load_context(&self, user_id: u64) -> Result<UserContext, StoreError> {
        let (plan, milestones) = match self.store.get_profile(user_id)? {
            Some(profile) => (profile.subscription_plan, profile.completed_milestones.len()),
            None => (None, 0),
        };
        let metrics = self.store.user_metrics(user_id)?;
        Ok(UserContext::new(user_id, plan, milestones, metrics.into_map()))
    }

    fn reachable(&self, event: &BehaviorEvent) -> bool {
        event
            .target_engines()
            .iter()
            .any(|&id| self.connections.allows_dispatch(id))
    }

    fn park(&mut self, event: BehaviorEvent) {
        self.parked.insert(event.id(), event);
    }

    /// Requeue parked events that have a reachable target again.
    fn release_parked(&mut self) -> usize {
        let ready: Vec<Uuid> = self
            .parked
            .values()
            .filter(|event| self.reachable(event))
            .map(BehaviorEvent::id)
            .collect();
        for id in &ready {
            if let Some(event) = self.parked.remove(id) {
                self.queue.push(event);
            }
        }
        ready.len()
    }

    /// Pull up to `limit` pending rows from the store that are not already
    /// held in memory. Returns how many were queued.
    fn reload(&mut self, limit: usize) -> Result<usize, StoreError> {
        let held: HashSet<Uuid> = self
            .inflight
            .iter()
            .chain(self.parked.keys())
            .chain(self.queue.ids())
            .copied()
            .collect();
        let restored = self.store.load_pending(limit, &held)?;
        let mut queued = 0;
        for event in restored {
            if self.queue.push(event) {
                queued += 1;
            }
        }
        if queued > 0 {
            debug!("reloaded {queued} pending events from the store");
        }
        Ok(queued)
    }

    fn pending_len(&self) -> usize {
        self.queue.len() + self.parked.len()
    }

    fn persist_connection(&self, engine: EngineId) {
        if let Some(row) = self.connections.get(engine)
            && let Err(e) = self.store.save_connection(row)
        {
            error!("failed to persist {engine} status: {e}");
        }
    }
}

struct Inner {
    engines: BTreeMap<EngineId, EngineSpec>,
    transport: Arc<dyn EngineTransport>,
    permits: BTreeMap<EngineId, Arc<Semaphore>>,
    state: Mutex<ServiceState>,
    signals: broadcast::Sender<ServiceSignal>,
    tracker: TaskTracker,
    options: ServiceOptions,
}

#[derive(Clone)]
pub struct SyncService {
    inner: Arc<Inner>,
}

impl SyncService {
    /// Engine statuses persisted by a previous run are restored.
    pub fn new(
        store: Store,
        engines: Vec<EngineSpec>,
        transport: Arc<dyn EngineTransport>,
        options: ServiceOptions,
    ) -> Result<Self, SyncError> {
        let mut connections = ConnectionTable::new(engines.iter().map(|e| e.id));
        connections.restore(store.load_connections()?);

        let concurrency = options.max_concurrency_per_engine.max(1);
        let permits = engines
            .iter()
            .map(|e| (e.id, Arc::new(Semaphore::new(concurrency))))
            .collect();
        let engines = engines.into_iter().map(|e| (e.id, e)).collect();
        let (signals, _) = broadcast::channel(64);

        let state = ServiceState {
            queue: PriorityQueue::new(),
            parked: HashMap::new(),
            connections,
            store,
            contexts: TtlCache::new(options.context_ttl_secs),
            sessions: TtlCache::new(SESSION_IDLE_SECS),
            limiter: FixedWindowLimiter::new(options.rate_limit_per_minute),
            stats: DispatchStats::default(),
            inflight: HashSet::new(),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                engines,
                transport,
                permits,
                state: Mutex::new(state),
                signals,
                tracker: TaskTracker::new(),
                options,
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceSignal> {
        self.inner.signals.subscribe()
    }

    /// Validate, persist and queue one event.
    ///
    /// High-priority events skip the batch queue and are handed to a
    /// tracked task; this call never waits on an engine.
    pub async fn enqueue(&self, draft: EventDraft) -> Result<EnqueueReceipt, SyncError> {
        if let Some(missing) = draft
            .target_engines
            .iter()
            .find(|id| !self.inner.engines.contains_key(id))
        {
            return Err(SyncError::Validation(format!(
                "engine {missing} is not configured"
            )));
        }
        let event = BehaviorEvent::new(draft, now_unix_millis())?;
        let immediate = event.wants_immediate_dispatch();

        let receipt = {
            let mut state = self.inner.state.lock().await;
            state.store.insert_event(&event)?;
            if immediate {
                state.inflight.insert(event.id());
            } else {
                state.queue.push(event.clone());
            }
            EnqueueReceipt {
                id: event.id(),
                action: event.action().as_str(),
                priority: event.priority(),
                immediate,
                queue_size: state.pending_len(),
            }
        };
        debug!(
            "queued {} {} for user {} (priority {})",
            receipt.action,
            receipt.id,
            event.user_id(),
            receipt.priority
        );

        if immediate {
            let service = self.clone();
            self.inner.tracker.spawn(async move {
                service.deliver(event).await;
            });
        }
        Ok(receipt)
    }

    /// `enqueue` for an event reported by a client request. The request's
    /// details extend the user's browsing session first.
    pub async fn capture(
        &self,
        draft: EventDraft,
        client: &ClientMeta,
    ) -> Result<EnqueueReceipt, SyncError> {
        if draft.user_id != 0 {
            self.inner
                .state
                .lock()
                .await
                .record_session(&draft, client);
        }
        self.enqueue(draft).await
    }

    /// Dispatch up to `batch_size` deliverable events, highest priority
    /// first.
    ///
    /// Events with no reachable target are parked instead of taking a
    /// batch slot. A short batch is topped up from the store's pending
    /// rows, so events survive restarts.
    pub async fn flush(&self, batch_size: Option<usize>) -> Result<FlushReport, SyncError> {
        let limit = batch_size.unwrap_or(self.inner.options.batch_size).max(1);
        let (batch, parked) = {
            let mut state = self.inner.state.lock().await;
            let now = now_unix_millis();
            state.contexts.purge_expired(now);
            state.sessions.purge_expired(now);
            let released = state.release_parked();
            if released > 0 {
                debug!("{released} parked events have a reachable engine again");
            }

            let mut batch = Vec::new();
            let mut parked = 0;
            loop {
                while batch.len() < limit {
                    let Some(event) = state.queue.pop() else {
                        break;
                    };
                    if state.reachable(&event) {
                        state.inflight.insert(event.id());
                        batch.push(event);
                    } else {
                        state.park(event);
                        parked += 1;
                    }
                }
                if batch.len() >= limit || state.reload(limit - batch.len())? == 0 {
                    break;
                }
            }
            (batch, parked)
        };

        let verdicts = join_all(batch.into_iter().map(|event| self.deliver(event))).await;

        let mut report = FlushReport {
            dispatched: verdicts.len(),
            deferred: parked,
            ..Default::default()
        };
        for verdict in &verdicts {
            match verdict {
                Verdict::Delivered => report.delivered += 1,
                Verdict::Retry { .. } => report.retried += 1,
                Verdict::Failed { .. } => report.failed += 1,
                Verdict::Deferred => report.deferred += 1,
            }
        }
        report.queue_size = self.queue_size().await;
        if report.dispatched > 0 || report.deferred > 0 {
            info!(
                "flushed {} events: {} delivered, {} retried, {} failed, {} deferred",
                report.dispatched, report.delivered, report.retried, report.failed, report.deferred
            );
        }
        Ok(report)
    }

    /// Offer one event to its engines and settle the result.
    async fn deliver(&self, mut event: BehaviorEvent) -> Verdict {
        let (request, offers) = {
            let mut state = self.inner.state.lock().await;
            let user_context = state.user_context(event.user_id());
            let offers: Vec<(EngineId, bool)> = event
                .target_engines()
                .iter()
                .map(|&id| (id, state.connections.allows_dispatch(id)))
                .collect();
            let request = DispatchRequest {
                event: event.clone(),
                user_context,
                timestamp: now_iso8601(),
            };
            (request, offers)
        };

        let calls = offers
            .iter()
            .filter(|(_, allowed)| *allowed)
            .map(|&(engine, _)| self.call_engine(engine, &request));
        let results = join_all(calls).await;

        let event_id = event.id();
        let user_id = event.user_id();
        let mut state = self.inner.state.lock().await;
        let mut round = Vec::with_capacity(offers.len());

        for &(engine, allowed) in &offers {
            if !allowed {
                debug!("skipping offline {engine} for event {event_id}");
                state.stats.record_skip();
                round.push((engine, EngineAttempt::Skipped));
            }
        }

        let now_secs = now_unix_secs();
        for (engine, response) in results {
            let EngineResponse {
                data,
                error,
                response_time,
                ..
            } = response;
            let transition = match error {
                None => {
                    state.stats.record_success(response_time);
                    if let Some(reply) = &data {
                        self.absorb_reply(
                            &mut state,
                            user_id,
                            event_id,
                            engine,
                            reply,
                            response_time,
                        );
                    }
                    let transition = state
                        .connections
                        .record_success(engine, response_time, now_secs);
                    round.push((engine, EngineAttempt::Accepted));
                    transition
                }
                Some(e) => {
                    debug!("{engine} rejected event {event_id} after {response_time:.3}s: {e}");
                    state.stats.record_failure(response_time);
                    let transition = state.connections.record_failure(engine, &e.to_string());
                    round.push((engine, EngineAttempt::Rejected(e)));
                    transition
                }
            };
            state.persist_connection(engine);
            self.announce(&state, engine, transition);
        }

        let verdict = event.settle(&round);
        state.inflight.remove(&event_id);
        match &verdict {
            Verdict::Delivered => {
                state.stats.events_delivered += 1;
                if let Err(e) = state.store.mark_processed(event_id) {
                    error!("failed to mark event {event_id} processed: {e}");
                }
            }
            Verdict::Retry { attempts, error } => {
                debug!("event {event_id} will be retried (attempt {attempts}): {error}");
                let message = error.to_string();
                if let Err(e) = state.store.record_attempt(event_id, *attempts, &message) {
                    error!("failed to record attempt for event {event_id}: {e}");
                }
                state.queue.push(event);
            }
            Verdict::Failed {
                attempts,
                last_error,
            } => {
                state.stats.events_failed += 1;
                let message = if *attempts >= MAX_ATTEMPTS {
                    let capacity = SyncError::Capacity {
                        attempts: *attempts,
                    };
                    format!("{capacity}; last error: {last_error}")
                } else {
                    last_error.to_string()
                };
                warn!("event {event_id} failed: {message}");
                if let Err(e) = state.store.mark_failed(event_id, *attempts, &message) {
                    error!("failed to mark event {event_id} failed: {e}");
                }
            }
            Verdict::Deferred => {
                debug!("no reachable engine for event {event_id}; parked");
                state.park(event);
            }
        }

        verdict
    }

    /// One engine call. Failures come back as a failed response timed
    /// from the start of the call, permit wait included.
    async fn call_engine(
        &self,
        engine: EngineId,
        request: &DispatchRequest,
    ) -> (EngineId, EngineResponse) {
        let started = Instant::now();
        let result = match (
            self.inner.engines.get(&engine),
            self.inner.permits.get(&engine),
        ) {
            (None, _) => Err(SyncError::Validation(format!(
                "engine {engine} is not configured"
            ))),
            (Some(spec), Some(permits)) => match permits.acquire().await {
                Ok(_permit) => self.inner.transport.send(spec, request).await,
                Err(_) => Err(SyncError::Transport("dispatcher is shutting down".into())),
            },
            (Some(spec), None) => self.inner.transport.send(spec, request).await,
        };
        let response = result
            .unwrap_or_else(|e| EngineResponse::failed(e, started.elapsed().as_secs_f64()));
        (engine, response)
    }

    /// Record what an engine said: the insight, any metric deltas, and a
    /// ranking signal when asked for.
    fn absorb_reply(
        &self,
        state: &mut ServiceState,
        user_id: u64,
        event_id: Uuid,
        engine: EngineId,
        reply: &EngineReply,
        response_time: f64,
    ) {
        let insight = Insight::from_reply(
            user_id,
            engine,
            Some(event_id),
            reply,
            response_time,
            now_unix_millis(),
        );
        if let Err(e) = state.store.insert_insight(&insight) {
            error!("failed to store {engine} insight for user {user_id}: {e}");
        }

        if !reply.metric_updates.is_empty() {
            match state.store.apply_metric_deltas(user_id, &reply.metric_updates) {
                Ok(()) => state.contexts.invalidate(&user_id),
                Err(e) => error!("failed to apply metric updates for user {user_id}: {e}"),
            }
        }

        if reply.ranking_impact {
            debug!("{engine} requested ranking recalculation for user {user_id}");
            let _ = self
                .inner
                .signals
                .send(ServiceSignal::RankingRecalculation { user_id, engine });
        }
    }

    fn announce(&self, state: &ServiceState, engine: EngineId, transition: Option<Transition>) {
        match transition {
            Some(Transition::WentOffline) => {
                let error = state
                    .connections
                    .get(engine)
                    .and_then(|row| row.last_error.clone())
                    .unwrap_or_default();
                warn!("{engine} is offline: {error}");
                let _ = self
                    .inner
                    .signals
                    .send(ServiceSignal::EngineOffline { engine, error });
            }
            Some(Transition::Recovered) => {
                info!("{engine} is back online");
                let _ = self
                    .inner
                    .signals
                    .send(ServiceSignal::EngineRecovered { engine });
            }
            None => {}
        }
    }

    /// Health-check every engine once and fold the results into the connection
    /// table, offline engines included.
    pub async fn health_check_all(&self) -> BTreeMap<EngineId, ConnectionState> {
        let timeout = self.inner.options.health_timeout;
        let checks = self.inner.engines.values().map(|spec| async move {
            (spec.id, self.inner.transport.health(spec, timeout).await)
        });
        let results = join_all(checks).await;

        let mut state = self.inner.state.lock().await;
        let now_secs = now_unix_secs();
        for (engine, result) in results {
            let transition = match result {
                Ok(rtt) => state.connections.record_success(engine, rtt, now_secs),
                Err(e) => {
                    debug!("health check for {engine} failed: {e}");
                    state.connections.record_failure(engine, &e.to_string())
                }
            };
            state.persist_connection(engine);
            self.announce(&state, engine, transition);
        }
        state
            .connections
            .iter()
            .map(|row| (row.engine, row.state))
            .collect()
    }

    /// Count one capture request against the per-minute budget.
    pub async fn check_rate_limit(&self) -> bool {
        let mut state = self.inner.state.lock().await;
        let allowed = state.limiter.check(now_unix_millis());
        if !allowed {
            state.stats.rate_limit_blocks = state.limiter.blocked();
        }
        allowed
    }

    pub async fn queue_size(&self) -> usize {
        self.inner.state.lock().await.pending_len()
    }

    pub async fn ai_status(&self) -> BTreeMap<EngineId, StatusSummary> {
        self.inner.state.lock().await.connections.summary()
    }

    pub async fn status(&self) -> Result<StatusReport, SyncError> {
        let state = self.inner.state.lock().await;
        let (hits, misses) = state.contexts.stats();
        Ok(StatusReport {
            engines: state.connections.summary(),
            queue_size: state.pending_len(),
            parked: state.parked.len(),
            in_flight: state.inflight.len(),
            stats: state.stats.clone(),
            persisted: state.store.queue_counts()?,
            rate_limit_remaining: state.limiter.remaining(now_unix_millis()),
            context_cache: CacheReport { hits, misses },
        })
    }

    pub async fn user_metrics(&self, user_id: u64) -> Result<MetricTotals, SyncError> {
        let state = self.inner.state.lock().await;
        Ok(state.store.user_metrics(user_id)?)
    }

    pub async fn user_insights(
        &self,
        user_id: u64,
        limit: usize,
    ) -> Result<Vec<Insight>, SyncError> {
        let state = self.inner.state.lock().await;
        Ok(state.store.insights_for_user(user_id, limit)?)
    }

    pub async fn update_profile(&self, profile: UserProfile) -> Result<(), SyncError> {
        if profile.user_id == 0 {
            return Err(SyncError::Validation("user_id must be positive".into()));
        }
        let mut state = self.inner.state.lock().await;
        state.store.upsert_profile(&profile)?;
        state.contexts.invalidate(&profile.user_id);
        Ok(())
    }

    /// Persisted behavior rows with a sequence number above `after_seq`.
    pub async fn recent_events(
        &self,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<StreamRow>, SyncError> {
        let state = self.inner.state.lock().await;
        Ok(state.store.recent_events(after_seq, limit)?)
    }

    /// Wait for every in-flight immediate dispatch to settle.
    pub async fn drain(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }
}
