//! Hashtag statistics synchronization worker.
//!
//! Producers hand tag names to a `HashtagSyncHandle`; a single worker thread
//! owns the cache, the cooldown window and the user baseline. Chunks wait in
//! a worker-side queue and at most `max_in_flight` of them are fetched at
//! once, each on its own dispatch thread. Responses are posted back into the
//! worker inbox, so store writes never interleave.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::num::NonZeroU32;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use governor::state::NotKeyed;
use governor::{Quota, RateLimiter};
use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::backends::{BackendFailure, HashtagBackend, HttpFailureKind};
use crate::config::{MaintenanceConfig, SyncConfig};
use crate::cooldown::{now_unix_secs, CooldownPolicy};
use crate::db_manager::{DbManager, HashtagFilter};
use crate::hashtag::{HashtagRecord, NAME_SEPARATOR};
use crate::protocol::{ChunkOutcome, SyncMessage};
use crate::response_parser::{parse_response, payload_records, ResponsePayload, ResponseStatus};
use crate::scoring;
use crate::user_baseline::UserBaselineCache;

/// Invoked once per outcome record, after persistence.
pub type LookupCallback = Arc<dyn Fn(&HashtagRecord) + Send + Sync>;

/// One outbound call worth of tag names.
pub struct LookupRequest {
    pub request_id: u64,
    pub chunk: String,
    pub callback: Option<LookupCallback>,
    pub persist: bool,
}

impl fmt::Debug for LookupRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LookupRequest")
            .field("request_id", &self.request_id)
            .field("chunk", &self.chunk)
            .field("callback", &self.callback.is_some())
            .field("persist", &self.persist)
            .finish()
    }
}

/// What `HashtagSyncHandle::request_hashtags` queued. Every chunk is later
/// reported as a `ChunkFinished` carrying `request_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedLookup {
    pub request_id: u64,
    pub chunks: Vec<String>,
}

enum SyncEvent {
    Lookup(LookupRequest),
    Completed {
        request: LookupRequest,
        result: Result<String, BackendFailure>,
    },
    SetCurrentUser(String),
    RefreshUserBaseline {
        user: String,
        daily_likes: Option<i64>,
    },
    Shutdown,
}

/// Joins `names` with commas and cuts the result into pieces of at most
/// `chunk_chars` characters. Cuts may fall inside a tag name.
pub fn chunk_names<I, S>(names: I, chunk_chars: usize) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined = names
        .into_iter()
        .map(|name| name.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(&NAME_SEPARATOR.to_string());
    let chars: Vec<char> = joined.chars().collect();
    chars
        .chunks(chunk_chars.max(1))
        .map(|piece| piece.iter().collect())
        .collect()
}

/// Names requested by a chunk, in order, without empties or repeats.
fn requested_names(chunk: &str) -> Vec<&str> {
    let mut seen = HashSet::new();
    chunk
        .split(NAME_SEPARATOR)
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(*name))
        .collect()
}

/// Stamps parsed records with `fetched_at` and appends an invalid record for
/// every requested name the service left out.
pub fn reconcile(chunk: &str, parsed: Vec<HashtagRecord>, fetched_at: i64) -> Vec<HashtagRecord> {
    let mut records: Vec<HashtagRecord> = parsed
        .into_iter()
        .map(|record| HashtagRecord {
            last_update: fetched_at,
            ..record
        })
        .collect();
    let returned: HashSet<String> = records.iter().map(|record| record.name.clone()).collect();
    for name in requested_names(chunk) {
        if !returned.contains(name) {
            info!("Invalidating hashtag missing from response: {}", name);
            records.push(HashtagRecord::invalid(name));
        }
    }
    records
}

/// Cloneable producer side of the sync worker.
#[derive(Clone)]
pub struct HashtagSyncHandle {
    sender: Sender<SyncEvent>,
    bus_producer: broadcast::Sender<SyncMessage>,
    next_request_id: Arc<AtomicU64>,
    chunk_chars: usize,
}

impl HashtagSyncHandle {
    /// Queues a lookup and returns its id and chunks. Never blocks.
    pub fn request_hashtags<I, S>(
        &self,
        names: I,
        callback: Option<LookupCallback>,
        persist: bool,
    ) -> QueuedLookup
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let mut chunks = Vec::new();
        for chunk in chunk_names(names, self.chunk_chars) {
            let request = LookupRequest {
                request_id,
                chunk: chunk.clone(),
                callback: callback.clone(),
                persist,
            };
            if self.sender.send(SyncEvent::Lookup(request)).is_err() {
                warn!("Hashtag sync worker is gone; dropping lookup request");
                break;
            }
            chunks.push(chunk);
        }
        QueuedLookup { request_id, chunks }
    }

    pub fn set_current_user(&self, user: impl Into<String>) {
        if self.sender.send(SyncEvent::SetCurrentUser(user.into())).is_err() {
            warn!("Hashtag sync worker is gone; current user not updated");
        }
    }

    /// Drops the cached daily likes for `user`, storing `daily_likes` first when given.
    pub fn refresh_user_baseline(&self, user: impl Into<String>, daily_likes: Option<i64>) {
        let event = SyncEvent::RefreshUserBaseline {
            user: user.into(),
            daily_likes,
        };
        if self.sender.send(event).is_err() {
            warn!("Hashtag sync worker is gone; baseline not refreshed");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.bus_producer.subscribe()
    }

    /// Stops the worker loop. Queued chunks are dropped and calls already in
    /// flight are abandoned.
    pub fn shutdown(&self) {
        let _ = self.sender.send(SyncEvent::Shutdown);
    }
}

pub struct HashtagSyncManager {
    inbox: Receiver<SyncEvent>,
    completion_sender: Sender<SyncEvent>,
    bus_producer: broadcast::Sender<SyncMessage>,
    db_manager: DbManager,
    backend: Arc<dyn HashtagBackend>,
    cooldown: CooldownPolicy,
    user_baseline: UserBaselineCache,
    current_user: Option<String>,
    pending: VecDeque<LookupRequest>,
    in_flight: usize,
    max_in_flight: usize,
    next_request_id: Arc<AtomicU64>,
    poll_interval: Duration,
    chunk_chars: usize,
    maintenance: MaintenanceConfig,
    maintenance_limiter:
        RateLimiter<NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>,
    clock: fn() -> i64,
}

impl HashtagSyncManager {
    /// Creates the worker and its producer handle. Nothing runs until `run`.
    pub fn new(
        db_manager: DbManager,
        backend: Arc<dyn HashtagBackend>,
        bus_producer: broadcast::Sender<SyncMessage>,
        sync_config: &SyncConfig,
        maintenance: &MaintenanceConfig,
    ) -> (Self, HashtagSyncHandle) {
        let (sender, inbox) = mpsc::channel();
        let next_request_id = Arc::new(AtomicU64::new(1));
        let handle = HashtagSyncHandle {
            sender: sender.clone(),
            bus_producer: bus_producer.clone(),
            next_request_id: Arc::clone(&next_request_id),
            chunk_chars: sync_config.chunk_chars.max(1),
        };
        let maintenance_quota = Quota::with_period(maintenance.interval())
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::MIN);

        let manager = Self {
            inbox,
            completion_sender: sender,
            bus_producer,
            db_manager,
            backend,
            cooldown: CooldownPolicy::new(sync_config.cooldown()),
            user_baseline: UserBaselineCache::new(),
            current_user: sync_config.current_user.clone(),
            pending: VecDeque::new(),
            in_flight: 0,
            max_in_flight: sync_config.max_in_flight.max(1),
            next_request_id,
            poll_interval: sync_config.poll_interval(),
            chunk_chars: sync_config.chunk_chars.max(1),
            maintenance: maintenance.clone(),
            maintenance_limiter: RateLimiter::direct(maintenance_quota),
            clock: now_unix_secs,
        };
        (manager, handle)
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the worker on a named thread. Joining yields the store back.
    pub fn spawn(mut self) -> std::io::Result<thread::JoinHandle<DbManager>> {
        thread::Builder::new()
            .name("hashtag-sync".to_string())
            .spawn(move || {
                self.run();
                self.db_manager
            })
    }

    fn publish(&self, message: SyncMessage) {
        // No subscribers is fine
        let _ = self.bus_producer.send(message);
    }

    fn finish_chunk(&self, request: LookupRequest, outcome: ChunkOutcome) {
        self.publish(SyncMessage::ChunkFinished {
            request_id: request.request_id,
            chunk: request.chunk,
            outcome,
        });
    }

    /// Inserts never-fetched rows for requested names the cache has not seen.
    fn add_placeholders(&self, chunk: &str) {
        for name in requested_names(chunk) {
            match self.db_manager.exists(&HashtagFilter::by_name(name)) {
                Ok(true) => {}
                Ok(false) => {
                    if let Err(error) = self.db_manager.add_empty(name) {
                        warn!("Failed to add placeholder for hashtag {}: {}", name, error);
                    }
                }
                Err(error) => warn!("Failed to look up hashtag {}: {}", name, error),
            }
        }
    }

    fn enqueue(&mut self, request: LookupRequest) {
        if request.persist {
            self.add_placeholders(&request.chunk);
        }
        self.pending.push_back(request);
        self.pump();
    }

    /// Starts queued chunks while slots are free. The cooldown is checked as
    /// each chunk leaves the queue.
    fn pump(&mut self) {
        while self.in_flight < self.max_in_flight {
            let Some(request) = self.pending.pop_front() else {
                break;
            };
            let now = (self.clock)();
            if self.cooldown.is_cooling_down(now) {
                debug!(
                    "Hashtag lookup suppressed, cooldown has {:?} left: {}",
                    self.cooldown.remaining(now).unwrap_or_default(),
                    request.chunk
                );
                self.finish_chunk(request, ChunkOutcome::Suppressed);
                continue;
            }
            self.dispatch(request);
        }
    }

    fn dispatch(&mut self, request: LookupRequest) {
        debug!("Dispatching hashtag lookup: {}", request.chunk);
        let backend = Arc::clone(&self.backend);
        let completion_sender = self.completion_sender.clone();
        let (request_id, chunk) = (request.request_id, request.chunk.clone());
        let spawned = thread::Builder::new()
            .name("hashtag-dispatch".to_string())
            .spawn(move || {
                let result = backend.fetch_chunk(&request.chunk);
                let _ = completion_sender.send(SyncEvent::Completed { request, result });
            });
        match spawned {
            Ok(_) => self.in_flight += 1,
            Err(error) => {
                warn!("Failed to start hashtag dispatch for {}: {}", chunk, error);
                self.publish(SyncMessage::ChunkFinished {
                    request_id,
                    chunk,
                    outcome: ChunkOutcome::TransportFailed(error.to_string()),
                });
            }
        }
    }

    fn start_cooldown(&mut self, request: LookupRequest) {
        let resume_not_before = self.cooldown.trip((self.clock)());
        warn!(
            "Hashtag service is throttling requests; lookups paused until {}",
            resume_not_before
        );
        self.publish(SyncMessage::CooldownStarted { resume_not_before });
        self.finish_chunk(request, ChunkOutcome::Throttled);
    }

    fn current_daily_likes(&mut self) -> Option<i64> {
        match self.current_user.as_deref() {
            Some(user) => self.user_baseline.daily_likes(&self.db_manager, user),
            None => None,
        }
    }

    fn handle_completion(&mut self, request: LookupRequest, result: Result<String, BackendFailure>) {
        let body = match result {
            Ok(body) => body,
            Err(failure) if failure.kind == HttpFailureKind::RateLimited => {
                self.start_cooldown(request);
                return;
            }
            Err(failure) => {
                warn!("Hashtag lookup failed for {}: {}", request.chunk, failure.message);
                self.finish_chunk(request, ChunkOutcome::TransportFailed(failure.message));
                return;
            }
        };

        let response = match parse_response(&body) {
            Ok(response) => response,
            Err(error) => {
                warn!("Hashtag response for {} not usable: {}", request.chunk, error);
                self.finish_chunk(request, ChunkOutcome::Rejected(error));
                return;
            }
        };
        match response.status {
            ResponseStatus::Ok => {}
            ResponseStatus::TooManyRequests => {
                self.start_cooldown(request);
                return;
            }
            ResponseStatus::Other(status) => {
                warn!(
                    "Hashtag service answered status '{}' for {}: {}",
                    status, request.chunk, body
                );
                self.finish_chunk(request, ChunkOutcome::Rejected(status));
                return;
            }
        }
        if response.payload == ResponsePayload::Unrecognized {
            warn!("Unrecognized hashtag response shape for {}: {}", request.chunk, body);
            self.finish_chunk(
                request,
                ChunkOutcome::Rejected("unrecognized payload".to_string()),
            );
            return;
        }

        let (parsed, errors) = payload_records(&response.payload);
        for error in errors {
            warn!("Skipping malformed hashtag record: {}", error);
        }
        let records = reconcile(&request.chunk, parsed, (self.clock)());
        let daily_likes = self.current_daily_likes();
        let record_count = records.len();
        for mut record in records {
            record.score = daily_likes
                .and_then(|daily_likes| scoring::score(&record, daily_likes).as_option());
            if request.persist {
                if let Err(error) = self.db_manager.upsert_hashtag(&record) {
                    warn!("Failed to persist hashtag {}: {}", record.name, error);
                }
            }
            if let Some(callback) = request.callback.as_ref() {
                if panic::catch_unwind(AssertUnwindSafe(|| callback(&record))).is_err() {
                    warn!("Lookup callback panicked for hashtag {}", record.name);
                }
            }
            self.publish(SyncMessage::RecordSynced(record));
        }
        self.finish_chunk(
            request,
            ChunkOutcome::Reconciled {
                records: record_count,
            },
        );
    }

    fn refresh_user_baseline(&mut self, user: &str, daily_likes: Option<i64>) {
        if let Some(daily_likes) = daily_likes {
            match self.db_manager.upsert_user(user, daily_likes) {
                Ok(()) => info!("Daily likes for {} set to {}", user, daily_likes),
                Err(error) => warn!("Failed to store daily likes for {}: {}", user, error),
            }
        }
        self.user_baseline.invalidate(user);
    }

    /// Queues a refresh for cache rows older than the configured age. Only
    /// runs while nothing is queued or in flight.
    fn run_idle_maintenance(&mut self) {
        if !self.maintenance.enabled || self.in_flight > 0 || !self.pending.is_empty() {
            return;
        }
        let now = (self.clock)();
        if self.cooldown.is_cooling_down(now) || self.maintenance_limiter.check().is_err() {
            return;
        }

        let older_than = now.saturating_sub(self.maintenance.stale_after_secs());
        match self
            .db_manager
            .stale_hashtag_names(older_than, self.maintenance.batch_limit)
        {
            Ok(names) if names.is_empty() => {}
            Ok(names) => {
                info!("Refreshing {} stale hashtags", names.len());
                let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
                for chunk in chunk_names(&names, self.chunk_chars) {
                    self.pending.push_back(LookupRequest {
                        request_id,
                        chunk,
                        callback: None,
                        persist: true,
                    });
                }
                self.pump();
            }
            Err(error) => warn!("Failed to query stale hashtags: {}", error),
        }
    }

    fn handle_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Lookup(request) => self.enqueue(request),
            SyncEvent::Completed { request, result } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.handle_completion(request, result);
                self.pump();
            }
            SyncEvent::SetCurrentUser(user) => {
                info!("Current user set to {}", user);
                self.current_user = Some(user.clone());
                self.publish(SyncMessage::CurrentUserChanged(user));
            }
            SyncEvent::RefreshUserBaseline { user, daily_likes } => {
                self.refresh_user_baseline(&user, daily_likes)
            }
            SyncEvent::Shutdown => {}
        }
    }

    /// Starts the blocking event loop. Returns after `HashtagSyncHandle::shutdown`.
    pub fn run(&mut self) {
        loop {
            match self.inbox.recv_timeout(self.poll_interval) {
                Ok(SyncEvent::Shutdown) => {
                    info!("Hashtag sync worker shutting down");
                    break;
                }
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => self.run_idle_maintenance(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use tokio::sync::broadcast::{self, error::TryRecvError, Receiver};

    use super::{
        chunk_names, reconcile, HashtagSyncHandle, HashtagSyncManager, LookupCallback,
    };
    use crate::backends::{BackendFailure, HashtagBackend};
    use crate::config::{MaintenanceConfig, SyncConfig};
    use crate::db_manager::{DbManager, HashtagFilter};
    use crate::hashtag::{HashtagRecord, INVALID_SENTINEL, NEVER_FETCHED};
    use crate::protocol::{ChunkOutcome, SyncMessage};

    type Responder = Box<dyn Fn(&str) -> Result<String, BackendFailure> + Send + Sync>;

    struct ScriptedBackend {
        calls: Mutex<Vec<String>>,
        respond: Responder,
    }

    impl ScriptedBackend {
        fn new(respond: impl Fn(&str) -> Result<String, BackendFailure> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().expect("calls lock").len()
        }
    }

    impl HashtagBackend for ScriptedBackend {
        fn fetch_chunk(&self, chunk: &str) -> Result<String, BackendFailure> {
            self.calls.lock().expect("calls lock").push(chunk.to_string());
            (self.respond)(chunk)
        }
    }

    struct FinishedChunk {
        request_id: u64,
        chunk: String,
        outcome: ChunkOutcome,
    }

    struct SyncHarness {
        handle: HashtagSyncHandle,
        receiver: Receiver<SyncMessage>,
        worker: thread::JoinHandle<DbManager>,
    }

    impl SyncHarness {
        fn start(
            backend: Arc<ScriptedBackend>,
            sync_config: SyncConfig,
            maintenance: MaintenanceConfig,
            clock: Option<fn() -> i64>,
            seed: impl FnOnce(&DbManager),
        ) -> Self {
            let db_manager = DbManager::new_in_memory().expect("failed to create in-memory db");
            seed(&db_manager);
            let (bus_sender, _) = broadcast::channel(1024);
            let receiver = bus_sender.subscribe();
            let (mut manager, handle) = HashtagSyncManager::new(
                db_manager,
                backend,
                bus_sender,
                &sync_config,
                &maintenance,
            );
            if let Some(clock) = clock {
                manager = manager.with_clock(clock);
            }
            let worker = manager.spawn().expect("failed to spawn sync worker");
            Self {
                handle,
                receiver,
                worker,
            }
        }

        fn with_backend(backend: Arc<ScriptedBackend>) -> Self {
            Self::start(
                backend,
                test_sync_config(),
                MaintenanceConfig::default(),
                None,
                |db| db.upsert_user("alice", 1000).expect("seed user"),
            )
        }

        fn next_finished(&mut self) -> FinishedChunk {
            let message = wait_for_message(&mut self.receiver, Duration::from_secs(2), |message| {
                matches!(message, SyncMessage::ChunkFinished { .. })
            });
            let SyncMessage::ChunkFinished {
                request_id,
                chunk,
                outcome,
            } = message
            else {
                panic!("expected ChunkFinished message");
            };
            FinishedChunk {
                request_id,
                chunk,
                outcome,
            }
        }

        fn wait_for_chunks(&mut self, count: usize) -> Vec<(String, ChunkOutcome)> {
            (0..count)
                .map(|_| {
                    let finished = self.next_finished();
                    (finished.chunk, finished.outcome)
                })
                .collect()
        }

        /// Skips chunks that belong to other requests.
        fn wait_for_request(&mut self, request_id: u64) -> ChunkOutcome {
            loop {
                let finished = self.next_finished();
                if finished.request_id == request_id {
                    return finished.outcome;
                }
            }
        }

        fn stop(self) -> DbManager {
            self.handle.shutdown();
            self.worker.join().expect("worker thread should not panic")
        }
    }

    fn test_sync_config() -> SyncConfig {
        SyncConfig {
            current_user: Some("alice".to_string()),
            poll_interval_ms: 20,
            ..SyncConfig::default()
        }
    }

    fn wait_for_message<F>(
        receiver: &mut Receiver<SyncMessage>,
        timeout: Duration,
        mut predicate: F,
    ) -> SyncMessage
    where
        F: FnMut(&SyncMessage) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match receiver.try_recv() {
                Ok(message) if predicate(&message) => return message,
                Ok(_) => {}
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
                Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Closed) => break,
            }
        }
        panic!("timed out waiting for sync message");
    }

    fn collecting_callback() -> (LookupCallback, Arc<Mutex<Vec<HashtagRecord>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: LookupCallback = Arc::new(move |record: &HashtagRecord| {
            sink.lock().expect("sink lock").push(record.clone());
        });
        (callback, seen)
    }

    fn tag_map_body(records: &[String]) -> String {
        let tags: serde_json::Map<String, serde_json::Value> = records
            .iter()
            .map(|record| {
                let name = record.split(':').next().unwrap_or_default().to_string();
                (name, serde_json::Value::String(record.clone()))
            })
            .collect();
        serde_json::json!({ "status": "ok", "tags": tags }).to_string()
    }

    fn answer_every_name(chunk: &str) -> Result<String, BackendFailure> {
        let records: Vec<String> = chunk
            .split(',')
            .filter(|name| !name.is_empty())
            .map(|name| format!("{name}:1:x:y:10:1:1:"))
            .collect();
        Ok(tag_map_body(&records))
    }

    #[test]
    fn test_chunk_names_splits_joined_string_by_characters() {
        let names: Vec<String> = (0..40).map(|index| format!("tag{index:02}")).collect();
        let joined = names.join(",");

        let chunks = chunk_names(&names, 100);

        assert_eq!(chunks.len(), joined.chars().count().div_ceil(100));
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 100));
        assert_eq!(chunks.concat(), joined);
    }

    #[test]
    fn test_chunk_names_never_splits_inside_a_code_point() {
        let chunks = chunk_names(["ümlaut", "café"], 4);

        assert_eq!(chunks, vec!["ümla", "ut,c", "afé"]);
        assert!(chunk_names(Vec::<String>::new(), 100).is_empty());
        assert_eq!(chunk_names(["food,drink"], 100), vec!["food,drink"]);
    }

    #[test]
    fn test_reconcile_synthesizes_invalid_records_once_per_missing_name() {
        let parsed = vec![HashtagRecord {
            likes: Some(100),
            ..HashtagRecord::empty("food")
        }];

        let records = reconcile("food,drink,,drink", parsed, 1_700_000_000);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "food");
        assert_eq!(records[0].last_update, 1_700_000_000);
        assert_eq!(records[1], HashtagRecord::invalid("drink"));
    }

    #[test]
    fn test_reconcile_keeps_unrequested_records() {
        let parsed = vec![HashtagRecord::empty("a"), HashtagRecord::empty("bonus")];

        let records = reconcile("a", parsed, 5);

        let names: Vec<&str> = records.iter().map(|record| record.name.as_str()).collect();
        assert_eq!(names, vec!["a", "bonus"]);
    }

    #[test]
    fn test_request_ids_are_unique_per_request() {
        let backend = ScriptedBackend::new(answer_every_name);
        let mut harness = SyncHarness::with_backend(backend);

        let first = harness.handle.request_hashtags(["a"], None, false);
        let second = harness.handle.request_hashtags(["b"], None, false);
        assert_ne!(first.request_id, second.request_id);
        assert_eq!(first.chunks, vec!["a".to_string()]);

        assert_eq!(
            harness.wait_for_request(second.request_id),
            ChunkOutcome::Reconciled { records: 1 }
        );
        harness.stop();
    }

    #[test]
    fn test_tag_map_response_persists_found_and_invalidates_missing() {
        let backend = ScriptedBackend::new(|_| {
            Ok(r#"{"status":"ok","tags":{"food":"food:42:x:y:100:5:12:cooking,kitchen"}}"#.to_string())
        });
        let mut harness = SyncHarness::with_backend(Arc::clone(&backend));
        let (callback, seen) = collecting_callback();

        let queued = harness.handle.request_hashtags(["food", "drink"], Some(callback), true);
        assert_eq!(queued.chunks.len(), 1);
        assert_eq!(
            harness.wait_for_request(queued.request_id),
            ChunkOutcome::Reconciled { records: 2 }
        );

        let db = harness.stop();
        let seen = seen.lock().expect("sink lock").clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].name, "food");
        assert_eq!(seen[0].likes, Some(100));
        assert_eq!(seen[0].comments, Some(5));
        assert_eq!(seen[0].engagement, Some(12));
        assert_eq!(
            seen[0].suggestions,
            Some(vec!["cooking".to_string(), "kitchen".to_string()])
        );
        assert_eq!(seen[0].score, Some(0.1));
        assert_eq!(seen[1].name, "drink");
        assert_eq!(seen[1].last_update, INVALID_SENTINEL);

        let food = db
            .select_one(&HashtagFilter::by_name("food"))
            .expect("select")
            .expect("food persisted");
        assert_eq!(food, seen[0]);
        let drink = db
            .select_one(&HashtagFilter::by_name("drink"))
            .expect("select")
            .expect("drink persisted");
        assert!(drink.is_invalid());
        assert_eq!(backend.calls.lock().expect("calls lock").as_slice(), ["food,drink"]);
    }

    #[test]
    fn test_tiered_response_produces_single_record_without_synthesis() {
        let backend = ScriptedBackend::new(|_| {
            Ok(r#"{"status":"ok","low":["a:1:x:y:10:1:2:s1"],"medium":[],"high":[],"vhigh":[]}"#
                .to_string())
        });
        let mut harness = SyncHarness::with_backend(backend);
        let (callback, seen) = collecting_callback();

        harness.handle.request_hashtags(["a"], Some(callback), true);
        let finished = harness.wait_for_chunks(1);
        assert_eq!(finished[0].1, ChunkOutcome::Reconciled { records: 1 });

        let db = harness.stop();
        let seen = seen.lock().expect("sink lock").clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].name, "a");
        assert_eq!(seen[0].likes, Some(10));
        assert!(!seen[0].is_invalid());
        let rows = db
            .select_many(&HashtagFilter::new(), &[], None)
            .expect("select");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_every_requested_name_gets_exactly_one_outcome_across_chunks() {
        // Only whole five-character names are known; fragments left by
        // character chunking come back missing and get invalidated.
        let backend = ScriptedBackend::new(|chunk| {
            let records: Vec<String> = chunk
                .split(',')
                .filter(|name| name.len() == 5)
                .map(|name| format!("{name}:1:x:y:10:1:1:"))
                .collect();
            Ok(tag_map_body(&records))
        });
        let mut harness = SyncHarness::with_backend(backend);
        let names: Vec<String> = (0..30).map(|index| format!("tag{index:02}")).collect();
        let chunks = chunk_names(&names, 100);

        let queued = harness.handle.request_hashtags(&names, None, true);
        assert_eq!(queued.chunks, chunks);
        let finished = harness.wait_for_chunks(queued.chunks.len());

        for (chunk, outcome) in finished {
            let distinct: BTreeSet<&str> =
                chunk.split(',').filter(|name| !name.is_empty()).collect();
            assert_eq!(outcome, ChunkOutcome::Reconciled { records: distinct.len() });
        }

        let db = harness.stop();
        let rows = db
            .select_many(&HashtagFilter::new(), &[], None)
            .expect("select");
        let pieces: BTreeSet<String> = chunks
            .iter()
            .flat_map(|chunk| chunk.split(','))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        let stored: BTreeSet<String> = rows.iter().map(|row| row.name.clone()).collect();
        assert_eq!(rows.len(), stored.len(), "a name was stored more than once");
        assert_eq!(stored, pieces);

        let valid: BTreeSet<String> = rows
            .iter()
            .filter(|row| !row.is_invalid())
            .map(|row| row.name.clone())
            .collect();
        let whole: BTreeSet<String> = pieces
            .iter()
            .filter(|name| name.len() == 5)
            .cloned()
            .collect();
        assert_eq!(valid, whole);
        assert!(rows
            .iter()
            .all(|row| row.is_invalid() || row.likes == Some(10)));
    }

    #[test]
    fn test_same_tag_in_out_of_order_chunks_keeps_last_reconciled_record() {
        static NOW: AtomicI64 = AtomicI64::new(1_700_000_000);
        fn ticking_clock() -> i64 {
            NOW.fetch_add(1, Ordering::SeqCst)
        }

        let (release, held) = mpsc::channel::<()>();
        let held = Mutex::new(held);
        let backend = ScriptedBackend::new(move |chunk| {
            if chunk == "food" {
                let _ = held
                    .lock()
                    .expect("held lock")
                    .recv_timeout(Duration::from_secs(2));
                Ok(r#"{"status":"ok","tags":{"food":"food:1:x:y:100:1:1:"}}"#.to_string())
            } else {
                Ok(tag_map_body(&[
                    "food:1:x:y:200:1:1:".to_string(),
                    "drink:2:x:y:50:1:1:".to_string(),
                ]))
            }
        });
        let mut harness = SyncHarness::start(
            backend,
            test_sync_config(),
            MaintenanceConfig::default(),
            Some(ticking_clock as fn() -> i64),
            |db| db.upsert_user("alice", 1000).expect("seed user"),
        );
        let (callback, seen) = collecting_callback();

        let slow = harness.handle.request_hashtags(["food"], Some(Arc::clone(&callback)), true);
        let fast = harness.handle.request_hashtags(["food", "drink"], Some(callback), true);
        assert_eq!(
            harness.wait_for_request(fast.request_id),
            ChunkOutcome::Reconciled { records: 2 }
        );
        release.send(()).expect("release held chunk");
        assert_eq!(
            harness.wait_for_request(slow.request_id),
            ChunkOutcome::Reconciled { records: 1 }
        );

        let db = harness.stop();
        let food_seen: Vec<HashtagRecord> = seen
            .lock()
            .expect("sink lock")
            .iter()
            .filter(|record| record.name == "food")
            .cloned()
            .collect();
        assert_eq!(food_seen.len(), 2);
        assert_eq!(food_seen[0].likes, Some(200));
        assert!(food_seen
            .windows(2)
            .all(|pair| pair[0].last_update <= pair[1].last_update));

        let rows = db
            .select_many(&HashtagFilter::by_name("food"), &[], None)
            .expect("select");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], food_seen[1]);
        assert_eq!(rows[0].likes, Some(100));
        assert!(rows[0].last_update > food_seen[0].last_update);
    }

    #[test]
    fn test_in_flight_calls_never_exceed_configured_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (backend_active, backend_peak) = (Arc::clone(&active), Arc::clone(&peak));
        let backend = ScriptedBackend::new(move |chunk| {
            let now_active = backend_active.fetch_add(1, Ordering::SeqCst) + 1;
            backend_peak.fetch_max(now_active, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            backend_active.fetch_sub(1, Ordering::SeqCst);
            answer_every_name(chunk)
        });
        let mut harness = SyncHarness::start(
            Arc::clone(&backend),
            SyncConfig {
                max_in_flight: 3,
                ..test_sync_config()
            },
            MaintenanceConfig::default(),
            None,
            |_| {},
        );

        for index in 0..12 {
            harness.handle.request_hashtags([format!("t{index:02}")], None, true);
        }
        let finished = harness.wait_for_chunks(12);

        assert!(finished
            .iter()
            .all(|(_, outcome)| *outcome == ChunkOutcome::Reconciled { records: 1 }));
        assert_eq!(backend.call_count(), 12);
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "{peak} calls were in flight at once");
        harness.stop();
    }

    #[test]
    fn test_queued_chunks_are_suppressed_once_throttled() {
        let backend = ScriptedBackend::new(|_| {
            thread::sleep(Duration::from_millis(30));
            Ok(r#"{"status":"too-many-requests"}"#.to_string())
        });
        let mut harness = SyncHarness::start(
            Arc::clone(&backend),
            SyncConfig {
                max_in_flight: 2,
                ..test_sync_config()
            },
            MaintenanceConfig::default(),
            None,
            |_| {},
        );

        for index in 0..10 {
            harness.handle.request_hashtags([format!("t{index}")], None, true);
        }
        let finished = harness.wait_for_chunks(10);

        let throttled = finished
            .iter()
            .filter(|(_, outcome)| *outcome == ChunkOutcome::Throttled)
            .count();
        let suppressed = finished
            .iter()
            .filter(|(_, outcome)| *outcome == ChunkOutcome::Suppressed)
            .count();
        assert_eq!((throttled, suppressed), (2, 8));
        assert_eq!(backend.call_count(), 2);
        harness.stop();
    }

    #[test]
    fn test_throttled_response_suppresses_dispatch_until_cooldown_elapses() {
        static NOW: AtomicI64 = AtomicI64::new(1_700_000_000);
        fn clock() -> i64 {
            NOW.load(Ordering::SeqCst)
        }

        let backend = ScriptedBackend::new(|chunk| {
            if chunk == "first" {
                Ok(r#"{"status":"too-many-requests"}"#.to_string())
            } else {
                Ok(format!(
                    r#"{{"status":"ok","tags":{{"{chunk}":"{chunk}:1:x:y:10:1:1:"}}}}"#
                ))
            }
        });
        let mut harness = SyncHarness::start(
            Arc::clone(&backend),
            test_sync_config(),
            MaintenanceConfig::default(),
            Some(clock as fn() -> i64),
            |_| {},
        );
        let (callback, seen) = collecting_callback();

        harness.handle.request_hashtags(["first"], Some(Arc::clone(&callback)), true);
        let message = wait_for_message(&mut harness.receiver, Duration::from_secs(2), |message| {
            matches!(message, SyncMessage::CooldownStarted { .. })
        });
        assert_eq!(
            message,
            SyncMessage::CooldownStarted {
                resume_not_before: 1_700_000_000 + 7200
            }
        );
        assert_eq!(harness.wait_for_chunks(1)[0].1, ChunkOutcome::Throttled);

        NOW.store(1_700_000_000 + 7199, Ordering::SeqCst);
        harness.handle.request_hashtags(["second"], Some(Arc::clone(&callback)), true);
        assert_eq!(harness.wait_for_chunks(1)[0].1, ChunkOutcome::Suppressed);
        assert_eq!(backend.call_count(), 1);

        NOW.store(1_700_000_000 + 7200, Ordering::SeqCst);
        harness.handle.request_hashtags(["third"], Some(callback), true);
        assert_eq!(
            harness.wait_for_chunks(1)[0].1,
            ChunkOutcome::Reconciled { records: 1 }
        );
        assert_eq!(backend.call_count(), 2);

        harness.stop();
        let seen = seen.lock().expect("sink lock").clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].name, "third");
        assert_eq!(seen[0].last_update, 1_700_000_000 + 7200);
    }

    #[test]
    fn test_http_429_starts_cooldown() {
        let backend = ScriptedBackend::new(|_| Err(BackendFailure::rate_limited("status 429")));
        let mut harness = SyncHarness::with_backend(Arc::clone(&backend));

        harness.handle.request_hashtags(["food"], None, true);
        assert_eq!(harness.wait_for_chunks(1)[0].1, ChunkOutcome::Throttled);

        harness.handle.request_hashtags(["food"], None, true);
        assert_eq!(harness.wait_for_chunks(1)[0].1, ChunkOutcome::Suppressed);
        assert_eq!(backend.call_count(), 1);
        harness.stop();
    }

    #[test]
    fn test_transport_failure_leaves_only_placeholder_row() {
        let backend = ScriptedBackend::new(|_| Err(BackendFailure::hard("connection refused")));
        let mut harness = SyncHarness::with_backend(backend);
        let (callback, seen) = collecting_callback();

        harness.handle.request_hashtags(["food"], Some(callback), true);
        assert_eq!(
            harness.wait_for_chunks(1)[0].1,
            ChunkOutcome::TransportFailed("connection refused".to_string())
        );

        let db = harness.stop();
        assert!(seen.lock().expect("sink lock").is_empty());
        let food = db
            .select_one(&HashtagFilter::by_name("food"))
            .expect("select")
            .expect("placeholder row");
        assert_eq!(food, HashtagRecord::empty("food"));
    }

    #[test]
    fn test_rejected_responses_do_not_invalidate_names() {
        let bodies = Mutex::new(vec![
            r#"{"status":"ok","unexpected":true}"#.to_string(),
            r#"{"status":"error"}"#.to_string(),
            "not json".to_string(),
        ]);
        let backend = ScriptedBackend::new(move |_| {
            Ok(bodies.lock().expect("bodies lock").remove(0))
        });
        let mut harness = SyncHarness::with_backend(backend);

        for _ in 0..3 {
            harness.handle.request_hashtags(["food"], None, true);
            let finished = harness.wait_for_chunks(1);
            assert!(matches!(finished[0].1, ChunkOutcome::Rejected(_)));
        }

        let db = harness.stop();
        let rows = db
            .select_many(&HashtagFilter::by_name("food"), &[], None)
            .expect("select");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_update, NEVER_FETCHED);
    }

    #[test]
    fn test_placeholder_does_not_overwrite_cached_row() {
        let backend = ScriptedBackend::new(|_| Err(BackendFailure::hard("offline")));
        let cached = HashtagRecord {
            likes: Some(300),
            last_update: 1_700_000_000,
            ..HashtagRecord::empty("food")
        };
        let seeded = cached.clone();
        let mut harness = SyncHarness::start(
            backend,
            test_sync_config(),
            MaintenanceConfig::default(),
            None,
            move |db| {
                db.insert(&seeded).expect("seed cached row");
            },
        );

        harness.handle.request_hashtags(["food"], None, true);
        harness.wait_for_chunks(1);

        let db = harness.stop();
        let rows = db
            .select_many(&HashtagFilter::by_name("food"), &[], None)
            .expect("select");
        assert_eq!(rows, vec![cached]);
    }

    #[test]
    fn test_lookup_without_persist_only_notifies() {
        let backend = ScriptedBackend::new(|_| {
            Ok(r#"{"status":"ok","tags":{"food":"food:42:x:y:100:5:12:"}}"#.to_string())
        });
        let mut harness = SyncHarness::with_backend(backend);
        let (callback, seen) = collecting_callback();

        harness.handle.request_hashtags(["food"], Some(callback), false);
        harness.wait_for_chunks(1);

        let db = harness.stop();
        assert_eq!(seen.lock().expect("sink lock").len(), 1);
        assert!(!db
            .exists(&HashtagFilter::by_name("food"))
            .expect("exists"));
    }

    #[test]
    fn test_score_follows_current_user_baseline() {
        let backend = ScriptedBackend::new(|_| {
            Ok(r#"{"status":"ok","tags":{"food":"food:42:x:y:2500:5:12:"}}"#.to_string())
        });
        let mut harness = SyncHarness::start(
            backend,
            SyncConfig {
                current_user: None,
                poll_interval_ms: 20,
                ..SyncConfig::default()
            },
            MaintenanceConfig::default(),
            None,
            |db| {
                db.upsert_user("alice", 1000).expect("seed alice");
                db.upsert_user("bob", 500).expect("seed bob");
            },
        );
        let (callback, seen) = collecting_callback();

        harness.handle.request_hashtags(["food"], Some(Arc::clone(&callback)), true);
        harness.wait_for_chunks(1);

        harness.handle.set_current_user("alice");
        harness.handle.request_hashtags(["food"], Some(Arc::clone(&callback)), true);
        harness.wait_for_chunks(1);

        harness.handle.set_current_user("bob");
        harness.handle.request_hashtags(["food"], Some(Arc::clone(&callback)), true);
        harness.wait_for_chunks(1);

        harness.handle.refresh_user_baseline("bob", Some(250));
        harness.handle.request_hashtags(["food"], Some(callback), true);
        harness.wait_for_chunks(1);

        let db = harness.stop();
        let scores: Vec<Option<f64>> = seen
            .lock()
            .expect("sink lock")
            .iter()
            .map(|record| record.score)
            .collect();
        assert_eq!(scores, vec![None, Some(2.5), Some(5.0), Some(10.0)]);
        let stored = db
            .select_one(&HashtagFilter::by_name("food"))
            .expect("select")
            .expect("food persisted");
        assert_eq!(stored.score, Some(10.0));
        assert_eq!(db.user_daily_likes("bob").expect("select user"), Some(250));
    }

    #[test]
    fn test_set_current_user_is_announced_on_bus() {
        let backend = ScriptedBackend::new(answer_every_name);
        let mut harness = SyncHarness::with_backend(backend);

        harness.handle.set_current_user("carol");
        let message = wait_for_message(&mut harness.receiver, Duration::from_secs(2), |message| {
            matches!(message, SyncMessage::CurrentUserChanged(_))
        });
        assert_eq!(message, SyncMessage::CurrentUserChanged("carol".to_string()));
        harness.stop();
    }

    #[test]
    fn test_panicking_callback_does_not_stop_worker() {
        let backend = ScriptedBackend::new(|chunk| {
            Ok(format!(
                r#"{{"status":"ok","tags":{{"{chunk}":"{chunk}:1:x:y:10:1:1:"}}}}"#
            ))
        });
        let mut harness = SyncHarness::with_backend(backend);
        let exploding: LookupCallback = Arc::new(|_: &HashtagRecord| panic!("boom"));

        harness.handle.request_hashtags(["a"], Some(exploding), true);
        harness.wait_for_chunks(1);

        let (callback, seen) = collecting_callback();
        harness.handle.request_hashtags(["b"], Some(callback), true);
        harness.wait_for_chunks(1);

        harness.stop();
        assert_eq!(seen.lock().expect("sink lock").len(), 1);
    }

    #[test]
    fn test_idle_maintenance_refreshes_stale_rows() {
        let backend = ScriptedBackend::new(answer_every_name);
        let mut harness = SyncHarness::start(
            Arc::clone(&backend),
            test_sync_config(),
            MaintenanceConfig {
                enabled: true,
                ..MaintenanceConfig::default()
            },
            None,
            |db| {
                db.add_empty("stale").expect("seed stale row");
                db.insert(&HashtagRecord::invalid("gone")).expect("seed invalid row");
            },
        );

        let message = wait_for_message(&mut harness.receiver, Duration::from_secs(2), |message| {
            matches!(message, SyncMessage::RecordSynced(_))
        });
        let SyncMessage::RecordSynced(record) = message else {
            panic!("expected RecordSynced message");
        };
        assert_eq!(record.name, "stale");
        assert!(record.last_update > 0);

        harness.stop();
        assert_eq!(backend.calls.lock().expect("calls lock").as_slice(), ["stale"]);
    }

    #[test]
    fn test_maintenance_chunks_carry_their_own_request_id() {
        let backend = ScriptedBackend::new(answer_every_name);
        let mut harness = SyncHarness::start(
            backend,
            test_sync_config(),
            MaintenanceConfig {
                enabled: true,
                ..MaintenanceConfig::default()
            },
            None,
            |db| {
                db.add_empty("stale").expect("seed stale row");
            },
        );

        let queued = harness.handle.request_hashtags(["food"], None, false);
        let mut finished = Vec::new();
        while finished.len() < 2 {
            finished.push(harness.next_finished());
        }

        let food = finished
            .iter()
            .find(|chunk| chunk.chunk == "food")
            .expect("food chunk finished");
        let stale = finished
            .iter()
            .find(|chunk| chunk.chunk == "stale")
            .expect("maintenance chunk finished");
        assert_eq!(food.request_id, queued.request_id);
        assert_ne!(stale.request_id, queued.request_id);
        harness.stop();
    }
}
