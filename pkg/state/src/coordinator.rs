use pkg_constants::state::{
    CONTROL_DOC, DEVICE_DOC, LEASE_WINDOW_MS, READ_CACHE_TTL_MS, RENEW_INTERVAL_DIVISOR,
};
use pkg_types::document::Document;
use pkg_types::lease::{LeaseRecord, find_reserved_key};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::ReadThroughCache;
use crate::client::DocumentStore;
use crate::clock::Clock;
use crate::error::{CoordinatorError, CoordinatorResult, StoreError};

/// Where this session stands with respect to the control lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseRole {
    Bootstrapping,
    /// This session holds a valid lease.
    Owner,
    /// Another session is believed to hold a valid lease.
    Foreign,
}

impl std::fmt::Display for LeaseRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseRole::Bootstrapping => write!(f, "Bootstrapping"),
            LeaseRole::Owner => write!(f, "Owner"),
            LeaseRole::Foreign => write!(f, "Foreign"),
        }
    }
}

/// Timing knobs for a coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// A lease is valid while `|now - issuedAt| <= lease_window`.
    pub lease_window: Duration,
    /// Period of the background renewal cycle.
    pub renew_interval: Duration,
    /// Minimum spacing between store reads of a cached document.
    pub read_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::with_lease_window(Duration::from_millis(LEASE_WINDOW_MS))
    }
}

impl CoordinatorConfig {
    /// Config for the given window, renewing at `window / RENEW_INTERVAL_DIVISOR`.
    pub fn with_lease_window(lease_window: Duration) -> Self {
        Self {
            lease_window,
            renew_interval: lease_window / RENEW_INTERVAL_DIVISOR as u32,
            read_ttl: Duration::from_millis(READ_CACHE_TTL_MS),
        }
    }

    /// Reject timings the renewal cycle cannot run on: a zero window, a
    /// zero renew period or read TTL, or a renew period longer than the
    /// window (the lease would lapse between renewals).
    pub fn validate(&self) -> CoordinatorResult<()> {
        if self.lease_window.is_zero() {
            return Err(CoordinatorError::InvalidConfig(
                "lease window must be greater than zero".to_string(),
            ));
        }
        if self.renew_interval.is_zero() {
            return Err(CoordinatorError::InvalidConfig(
                "renew interval must be greater than zero".to_string(),
            ));
        }
        if self.renew_interval > self.lease_window {
            return Err(CoordinatorError::InvalidConfig(format!(
                "renew interval {}ms exceeds lease window {}ms",
                self.renew_interval.as_millis(),
                self.lease_window.as_millis()
            )));
        }
        if self.read_ttl.is_zero() {
            return Err(CoordinatorError::InvalidConfig(
                "read TTL must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn window_ms(&self) -> u64 {
        self.lease_window.as_millis() as u64
    }

    fn read_ttl_ms(&self) -> u64 {
        self.read_ttl.as_millis() as u64
    }
}

struct ControlState {
    role: LeaseRole,
    cache: ReadThroughCache<LeaseRecord>,
}

/// Outcome of a contended write: the role it left us in and the freshest
/// record we know of.
struct Contest {
    role: LeaseRole,
    record: LeaseRecord,
}

struct Shared {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    session_id: String,
    config: CoordinatorConfig,
    control: Mutex<ControlState>,
    device: Mutex<ReadThroughCache<Document>>,
    role_tx: watch::Sender<LeaseRole>,
}

/// Coordinates exclusive control of a device through a lease on the
/// control document.
///
/// Cross-session exclusion comes only from the store's CAS. Locally, each
/// document's state sits behind an async mutex held for the whole of a
/// public operation, so at most one round trip per document is in flight.
pub struct LeaseCoordinator {
    shared: Arc<Shared>,
    role_rx: watch::Receiver<LeaseRole>,
    renewal: Option<JoinHandle<()>>,
}

impl LeaseCoordinator {
    /// Bootstrap a new session and start its background renewal cycle.
    pub async fn connect(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> CoordinatorResult<Self> {
        let mut coordinator = Self::bootstrap(store, clock, config).await?;
        coordinator.start();
        Ok(coordinator)
    }

    /// Bootstrap a new session without starting the renewal cycle.
    pub async fn bootstrap(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> CoordinatorResult<Self> {
        let session_id = uuid::Uuid::new_v4().to_string();
        Self::bootstrap_as(store, clock, config, session_id).await
    }

    /// Bootstrap under an existing session id, e.g. one persisted across a
    /// restart. A still-valid lease held by that id is renewed.
    pub async fn bootstrap_as(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
        session_id: String,
    ) -> CoordinatorResult<Self> {
        config.validate()?;
        info!("Bootstrapping control session {}", session_id);

        // A missing device document means nothing to control; bail out
        // before touching the lease.
        let device = match store.get(DEVICE_DOC).await {
            Ok(doc) => doc,
            Err(e) if e.is_not_found() => {
                warn!("Device document not found. Is the device offline?");
                return Err(CoordinatorError::DeviceUnavailable(e));
            }
            Err(e) => return Err(e.into()),
        };
        let device_fetched_at = clock.now_ms();

        let (role_tx, role_rx) = watch::channel(LeaseRole::Bootstrapping);
        let read_ttl_ms = config.read_ttl_ms();
        let shared = Shared {
            store,
            clock,
            session_id,
            config,
            control: Mutex::new(ControlState {
                role: LeaseRole::Bootstrapping,
                // Placeholder until the first read below completes.
                cache: ReadThroughCache::new(LeaseRecord::genesis("", 0), 0, read_ttl_ms),
            }),
            device: Mutex::new(ReadThroughCache::new(device, device_fetched_at, read_ttl_ms)),
            role_tx,
        };

        let outcome = shared.bootstrap_control().await?;
        {
            let mut state = shared.control.lock().await;
            let now = shared.clock.now_ms();
            state.cache = ReadThroughCache::new(outcome.record, now, read_ttl_ms);
            shared.set_role(&mut state, outcome.role);
        }

        Ok(Self {
            shared: Arc::new(shared),
            role_rx,
            renewal: None,
        })
    }

    /// Start the background renewal cycle. Idempotent.
    pub fn start(&mut self) {
        if self.renewal.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let period = shared.config.renew_interval;
        self.renewal = Some(tokio::spawn(async move {
            info!(
                "Lease renewal started (session={}, window={}ms, renew={}ms)",
                shared.session_id,
                shared.config.window_ms(),
                period.as_millis()
            );

            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                shared.sync_control().await;
            }
        }));
    }

    /// Stop the renewal cycle. The lease is not released; it simply expires.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
            let _ = handle.await;
        }
        info!("Control session {} shut down", self.shared.session_id);
    }

    /// Run one renewal cycle now: re-read the control document, renew if we
    /// own it, take over if it expired, otherwise stay `Foreign`.
    ///
    /// Store failures are logged and swallowed; the next cycle retries.
    pub async fn sync_control(&self) {
        self.shared.sync_control().await;
    }

    /// Merge `payload` into the control document.
    ///
    /// Requires a valid lease held by this session. If the cached lease has
    /// gone stale a renewal is attempted first. On success the fence token
    /// advances by one and the cache holds the written record.
    pub async fn write_control(&self, payload: Map<String, Value>) -> CoordinatorResult<LeaseRecord> {
        if let Some(key) = find_reserved_key(&payload) {
            return Err(CoordinatorError::ReservedField(key));
        }

        let shared = &self.shared;
        let mut state = shared.control.lock().await;
        if state.role != LeaseRole::Owner {
            shared.refresh_control(&mut state).await;
        }

        let observed = state.cache.get().clone();
        let now = shared.clock.now_ms();
        // contend() below performs the renewal; the write rides on it.
        if state.role == LeaseRole::Owner && !observed.is_valid_at(now, shared.config.window_ms()) {
            debug!(
                "Cached lease is stale (issued {}ms ago), renewing before write",
                observed.age_ms(now)
            );
        }

        let outcome = shared.contend(observed, payload).await?;
        let now = shared.clock.now_ms();
        match outcome.role {
            LeaseRole::Owner => {
                state.cache.replace(outcome.record.clone());
                shared.set_role(&mut state, LeaseRole::Owner);
                Ok(outcome.record)
            }
            _ => {
                let owner = outcome.record.owner_session_id.clone();
                state.cache.refresh(outcome.record, now);
                shared.set_role(&mut state, LeaseRole::Foreign);
                Err(CoordinatorError::NotOwner {
                    session_id: shared.session_id.clone(),
                    owner,
                })
            }
        }
    }

    /// The most recent control record.
    ///
    /// While `Owner` the cache is authoritative and never re-fetched;
    /// otherwise it is re-read at most once per read TTL.
    pub async fn read_control(&self) -> LeaseRecord {
        let mut state = self.shared.control.lock().await;
        if state.role != LeaseRole::Owner {
            self.shared.refresh_control(&mut state).await;
        }
        state.cache.get().clone()
    }

    /// The most recent device document, re-read at most once per read TTL.
    pub async fn read_device(&self) -> Document {
        let shared = &self.shared;
        let mut cache = shared.device.lock().await;
        let now = shared.clock.now_ms();
        if cache.is_due(now) {
            match shared.store.get(DEVICE_DOC).await {
                Ok(doc) => cache.refresh(doc, now),
                Err(e) => {
                    warn!("Device document refresh failed: {}", e);
                    cache.defer(now);
                }
            }
        }
        cache.get().clone()
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn role(&self) -> LeaseRole {
        *self.role_rx.borrow()
    }

    pub fn is_owner(&self) -> bool {
        self.role() == LeaseRole::Owner
    }

    /// Get a receiver to observe role changes.
    pub fn subscribe(&self) -> watch::Receiver<LeaseRole> {
        self.role_rx.clone()
    }
}

impl Drop for LeaseCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }
}

impl Shared {
    /// Whether this session may write over `record` at `now`: it is ours,
    /// or it has expired.
    fn may_write(&self, record: &LeaseRecord, now: i64) -> bool {
        record.is_owned_by(&self.session_id) || !record.is_valid_at(now, self.config.window_ms())
    }

    async fn fetch_control(&self) -> Result<LeaseRecord, StoreError> {
        let doc = self.store.get(CONTROL_DOC).await?;
        let record = LeaseRecord::decode(&doc).map_err(|source| StoreError::Codec {
            id: CONTROL_DOC.to_string(),
            source,
        })?;
        if !record.has_current_schema() {
            warn!(
                "Control document has schema version {}, expected current",
                record.schema_version
            );
        }
        Ok(record)
    }

    /// Create the control document from `record`. Conflicts if it exists.
    async fn create_control(&self, mut record: LeaseRecord) -> Result<LeaseRecord, StoreError> {
        let body = record.encode().map_err(|source| StoreError::Codec {
            id: CONTROL_DOC.to_string(),
            source,
        })?;
        let revision = self.store.put(CONTROL_DOC, None, &body).await?;
        record.revision = Some(revision);
        Ok(record)
    }

    /// CAS-write the successor of `base` with `payload` merged in.
    async fn write_successor(
        &self,
        base: &LeaseRecord,
        payload: &Map<String, Value>,
    ) -> Result<LeaseRecord, StoreError> {
        let mut next = base
            .successor(&self.session_id, self.clock.now_ms())
            .ok_or_else(|| StoreError::FenceExhausted {
                id: CONTROL_DOC.to_string(),
                fence: base.fence_token,
            })?;
        next.merge_payload(payload.clone());
        let body = next.encode().map_err(|source| StoreError::Codec {
            id: CONTROL_DOC.to_string(),
            source,
        })?;

        let revision = match base.revision.as_ref() {
            Some(rev) => self.store.put(CONTROL_DOC, Some(rev), &body).await?,
            // The document vanished under us; recreate it without letting
            // the fence go backwards.
            None => self.store.put(CONTROL_DOC, None, &body).await?,
        };
        next.revision = Some(revision);
        Ok(next)
    }

    /// The acquire/renew write path.
    ///
    /// Writes over `observed` if we may; on conflict re-reads and tries
    /// again for as long as the fresh record is still ours or expired. A
    /// conflict means someone else's write landed, so the loop ends as soon
    /// as that writer holds a valid lease.
    async fn contend(
        &self,
        observed: LeaseRecord,
        payload: Map<String, Value>,
    ) -> Result<Contest, StoreError> {
        let mut current = observed;
        loop {
            let now = self.clock.now_ms();
            if !self.may_write(&current, now) {
                return Ok(Contest {
                    role: LeaseRole::Foreign,
                    record: current,
                });
            }

            match self.write_successor(&current, &payload).await {
                Ok(written) => {
                    debug!(
                        "Control lease written (fence={}, rev={:?})",
                        written.fence_token, written.revision
                    );
                    return Ok(Contest {
                        role: LeaseRole::Owner,
                        record: written,
                    });
                }
                Err(e) if e.is_conflict() => {
                    debug!("Control write lost the race at fence {}, re-reading", current.fence_token);
                    current = match self.fetch_control().await {
                        Ok(record) => record,
                        // Deleted between our write and the re-read: recreate
                        // on top of what we last saw.
                        Err(e) if e.is_not_found() => LeaseRecord {
                            revision: None,
                            ..current
                        },
                        Err(e) => return Err(e),
                    };
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn bootstrap_control(&self) -> CoordinatorResult<Contest> {
        let observed = match self.fetch_control().await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                let now = self.clock.now_ms();
                info!("No control document found, creating it for {}", self.session_id);
                match self
                    .create_control(LeaseRecord::genesis(&self.session_id, now))
                    .await
                {
                    Ok(record) => {
                        return Ok(Contest {
                            role: LeaseRole::Owner,
                            record,
                        });
                    }
                    Err(e) if e.is_conflict() => {
                        debug!("Another session created the control document first");
                        self.fetch_control().await?
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };

        let now = self.clock.now_ms();
        if !observed.is_owned_by(&self.session_id) && self.may_write(&observed, now) {
            info!(
                "Lease expired (held by {}, fence {}), acquiring for {}",
                observed.owner_session_id, observed.fence_token, self.session_id
            );
        }
        Ok(self.contend(observed, Map::new()).await?)
    }

    /// Re-read the control document if the TTL gate allows.
    async fn refresh_control(&self, state: &mut ControlState) {
        let now = self.clock.now_ms();
        if !state.cache.is_due(now) {
            return;
        }
        match self.fetch_control().await {
            Ok(record) => state.cache.refresh(record, now),
            Err(e) => {
                warn!("Control document refresh failed: {}", e);
                state.cache.defer(now);
            }
        }
    }

    async fn sync_control(&self) {
        let mut state = self.control.lock().await;

        let observed = match self.fetch_control().await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                warn!("Control document disappeared, recreating it");
                LeaseRecord {
                    revision: None,
                    ..state.cache.get().clone()
                }
            }
            Err(e) => {
                warn!("Lease renewal error: {}", e);
                return;
            }
        };

        let now = self.clock.now_ms();
        if !self.may_write(&observed, now) {
            state.cache.refresh(observed, now);
            self.set_role(&mut state, LeaseRole::Foreign);
            return;
        }

        if !observed.is_owned_by(&self.session_id) {
            info!(
                "Lease expired (held by {}), acquiring for {}",
                observed.owner_session_id, self.session_id
            );
        }
        match self.contend(observed, Map::new()).await {
            Ok(outcome) => {
                let now = self.clock.now_ms();
                state.cache.refresh(outcome.record, now);
                self.set_role(&mut state, outcome.role);
            }
            Err(e) => warn!("Lease renewal error: {}", e),
        }
    }

    fn set_role(&self, state: &mut ControlState, role: LeaseRole) {
        let was = state.role;
        state.role = role;
        if role == was {
            return;
        }

        let fence = state.cache.get().fence_token;
        match (was, role) {
            (_, LeaseRole::Owner) => {
                info!("Session {} now holds the control lease (fence {})", self.session_id, fence);
            }
            (LeaseRole::Owner, _) => {
                warn!(
                    "Control lease LOST by {}, now held by {}",
                    self.session_id,
                    state.cache.get().owner_session_id
                );
            }
            _ => {
                info!(
                    "Control lease held by {} (fence {})",
                    state.cache.get().owner_session_id,
                    fence
                );
            }
        }
        let _ = self.role_tx.send(role);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryStore;
    use serde_json::json;

    const T0: i64 = 1_700_000_000_000;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    async fn device_store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .seed(
                DEVICE_DOC,
                json!({ "meta": { "version": "2022.5.14" }, "mode": "SAFE", "utcEpoch": 1.0 }),
            )
            .await;
        store
    }

    async fn coordinator(store: &MemoryStore, clock: &ManualClock) -> LeaseCoordinator {
        LeaseCoordinator::bootstrap(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            CoordinatorConfig::default(),
        )
        .await
        .unwrap()
    }

    async fn stored_lease(store: &MemoryStore) -> LeaseRecord {
        let doc = store.document(CONTROL_DOC).await.unwrap();
        LeaseRecord::decode(&doc).unwrap()
    }

    #[test]
    fn default_config_matches_constants() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.lease_window, Duration::from_millis(10_000));
        assert_eq!(config.renew_interval, Duration::from_millis(5_000));
        assert_eq!(config.read_ttl, Duration::from_millis(100));
    }

    #[test]
    fn config_rejects_unusable_timings() {
        let zero = CoordinatorConfig::with_lease_window(Duration::ZERO);
        assert!(matches!(zero.validate(), Err(CoordinatorError::InvalidConfig(_))));

        let mut config = CoordinatorConfig::default();
        config.read_ttl = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::default();
        config.renew_interval = Duration::from_millis(10_001);
        assert!(config.validate().is_err());

        assert!(CoordinatorConfig::with_lease_window(Duration::from_millis(2)).validate().is_ok());
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_zero_lease_window() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let result = LeaseCoordinator::bootstrap(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            CoordinatorConfig::with_lease_window(Duration::ZERO),
        )
        .await;

        assert!(matches!(result, Err(CoordinatorError::InvalidConfig(_))));
        assert!(store.document(CONTROL_DOC).await.is_none());
        assert_eq!(store.read_count(DEVICE_DOC).await, 0);
    }

    #[tokio::test]
    async fn test_bootstrap_creates_missing_control_document() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);

        let a = coordinator(&store, &clock).await;
        assert_eq!(a.role(), LeaseRole::Owner);

        let lease = stored_lease(&store).await;
        assert_eq!(lease.owner_session_id, a.session_id());
        assert_eq!(lease.fence_token, 0);
        assert_eq!(lease.issued_at, T0);
        assert_eq!(lease.schema_version, "2022.5.14");
        assert_eq!(store.write_count(CONTROL_DOC).await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_bootstrap_has_one_owner() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);

        let (a, b) = tokio::join!(coordinator(&store, &clock), coordinator(&store, &clock));

        let owners: Vec<_> = [&a, &b].into_iter().filter(|c| c.is_owner()).collect();
        assert_eq!(owners.len(), 1);
        let foreign = if a.is_owner() { &b } else { &a };
        assert_eq!(foreign.role(), LeaseRole::Foreign);

        let lease = stored_lease(&store).await;
        assert_eq!(lease.owner_session_id, owners[0].session_id());
        assert_eq!(foreign.read_control().await.owner_session_id, owners[0].session_id());
        assert_eq!(store.write_count(CONTROL_DOC).await, 1);
    }

    #[tokio::test]
    async fn test_bootstrap_create_conflict_falls_back_to_foreign() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let rival = LeaseRecord::genesis("rival", T0);
        store
            .stage_foreign_write(CONTROL_DOC, rival.encode().unwrap())
            .await;

        let b = coordinator(&store, &clock).await;
        assert_eq!(b.role(), LeaseRole::Foreign);
        assert_eq!(stored_lease(&store).await.owner_session_id, "rival");
    }

    #[tokio::test]
    async fn test_bootstrap_takes_over_expired_lease() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let mut stale = LeaseRecord::genesis("gone", T0 - 10_001);
        stale.fence_token = 41;
        store.seed(CONTROL_DOC, stale.encode().unwrap()).await;

        let a = coordinator(&store, &clock).await;
        assert!(a.is_owner());
        let lease = stored_lease(&store).await;
        assert_eq!(lease.owner_session_id, a.session_id());
        assert_eq!(lease.fence_token, 42);
        assert_eq!(lease.issued_at, T0);
    }

    #[tokio::test]
    async fn test_exhausted_fence_is_never_wrapped() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let mut stale = LeaseRecord::genesis("gone", T0 - 10_001);
        stale.fence_token = u64::MAX;
        let rev = store.seed(CONTROL_DOC, stale.encode().unwrap()).await;

        let err = LeaseCoordinator::bootstrap(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            CoordinatorConfig::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(
            err,
            CoordinatorError::Store(StoreError::FenceExhausted { fence: u64::MAX, .. })
        ));
        assert_eq!(store.document(CONTROL_DOC).await.unwrap().revision, rev);
        assert_eq!(stored_lease(&store).await.fence_token, u64::MAX);
        assert_eq!(store.write_count(CONTROL_DOC).await, 0);
    }

    #[tokio::test]
    async fn test_bootstrap_respects_valid_foreign_lease() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let held = LeaseRecord::genesis("other", T0 - 10_000);
        let rev = store.seed(CONTROL_DOC, held.encode().unwrap()).await;

        let b = coordinator(&store, &clock).await;
        assert_eq!(b.role(), LeaseRole::Foreign);
        assert_eq!(store.document(CONTROL_DOC).await.unwrap().revision, rev);
    }

    #[tokio::test]
    async fn test_future_stamped_lease_counts_as_valid() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let skewed = LeaseRecord::genesis("skewed", T0 + 8_000);
        store.seed(CONTROL_DOC, skewed.encode().unwrap()).await;

        let b = coordinator(&store, &clock).await;
        assert_eq!(b.role(), LeaseRole::Foreign);

        clock.advance(1);
        b.sync_control().await;
        assert_eq!(b.role(), LeaseRole::Foreign);
        assert_eq!(stored_lease(&store).await.owner_session_id, "skewed");
    }

    #[tokio::test]
    async fn test_restart_with_same_session_renews() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let mut held = LeaseRecord::genesis("persisted", T0 - 3_000);
        held.fence_token = 5;
        store.seed(CONTROL_DOC, held.encode().unwrap()).await;

        let a = LeaseCoordinator::bootstrap_as(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            CoordinatorConfig::default(),
            "persisted".to_string(),
        )
        .await
        .unwrap();
        assert!(a.is_owner());
        let lease = stored_lease(&store).await;
        assert_eq!(lease.fence_token, 6);
        assert_eq!(lease.issued_at, T0);
    }

    #[tokio::test]
    async fn test_missing_device_is_fatal() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(T0);

        let err = LeaseCoordinator::bootstrap(
            Arc::new(store.clone()),
            Arc::new(clock),
            CoordinatorConfig::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, CoordinatorError::DeviceUnavailable(_)));
        assert!(store.document(CONTROL_DOC).await.is_none());
    }

    #[tokio::test]
    async fn test_write_while_foreign_is_refused() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let a = coordinator(&store, &clock).await;
        let b = coordinator(&store, &clock).await;
        let before = store.document(CONTROL_DOC).await.unwrap().revision;

        let err = b
            .write_control(fields(json!({ "mode": "MANUAL" })))
            .await
            .unwrap_err();
        match err {
            CoordinatorError::NotOwner { owner, .. } => assert_eq!(owner, a.session_id()),
            other => panic!("expected NotOwner, got {other:?}"),
        }
        assert_eq!(store.document(CONTROL_DOC).await.unwrap().revision, before);
        assert_eq!(store.write_count(CONTROL_DOC).await, 1);
    }

    #[tokio::test]
    async fn test_write_then_read_needs_no_store_read() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let a = coordinator(&store, &clock).await;

        clock.advance(250);
        let written = a
            .write_control(fields(json!({ "mode": "AUTO" })))
            .await
            .unwrap();
        assert_eq!(written.fence_token, 1);
        assert_eq!(written.issued_at, T0 + 250);

        let reads = store.read_count(CONTROL_DOC).await;
        let seen = a.read_control().await;
        assert_eq!(store.read_count(CONTROL_DOC).await, reads);
        assert_eq!(seen.payload.get("mode"), Some(&json!("AUTO")));
        assert_eq!(seen.revision, store.document(CONTROL_DOC).await.map(|d| d.revision));
    }

    #[tokio::test]
    async fn test_write_rejects_reserved_fields() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let a = coordinator(&store, &clock).await;

        let err = a
            .write_control(fields(json!({ "fenceToken": 1000 })))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ReservedField("fenceToken")));
        assert_eq!(stored_lease(&store).await.fence_token, 0);
    }

    #[tokio::test]
    async fn test_renewal_keeps_payload() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let a = coordinator(&store, &clock).await;
        a.write_control(fields(json!({ "mode": "MANUAL" })))
            .await
            .unwrap();

        clock.advance(5_000);
        a.sync_control().await;
        let lease = stored_lease(&store).await;
        assert_eq!(lease.fence_token, 2);
        assert_eq!(lease.payload.get("mode"), Some(&json!("MANUAL")));
    }

    #[tokio::test]
    async fn test_renewal_resets_window() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let a = coordinator(&store, &clock).await;
        let b = coordinator(&store, &clock).await;

        clock.set(T0 + 5_000);
        a.sync_control().await;
        assert_eq!(stored_lease(&store).await.issued_at, T0 + 5_000);

        clock.set(T0 + 10_001);
        b.sync_control().await;
        assert_eq!(b.role(), LeaseRole::Foreign);
        assert_eq!(stored_lease(&store).await.owner_session_id, a.session_id());

        let err = b
            .write_control(fields(json!({ "mode": "AUTO" })))
            .await
            .unwrap_err();
        assert!(err.is_not_owner());
        assert!(a.is_owner());
    }

    #[tokio::test]
    async fn test_takeover_after_owner_stops_renewing() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let a = coordinator(&store, &clock).await;
        a.write_control(fields(json!({ "mode": "SAFE" })))
            .await
            .unwrap();
        let last = stored_lease(&store).await.fence_token;
        let b = coordinator(&store, &clock).await;
        drop(a);

        clock.set(T0 + 10_000);
        b.sync_control().await;
        assert_eq!(b.role(), LeaseRole::Foreign);

        clock.set(T0 + 10_001);
        b.sync_control().await;
        assert!(b.is_owner());
        let lease = stored_lease(&store).await;
        assert_eq!(lease.owner_session_id, b.session_id());
        assert_eq!(lease.fence_token, last + 1);
        assert_eq!(lease.issued_at, T0 + 10_001);
    }

    #[tokio::test]
    async fn test_stale_owner_loses_write_after_takeover() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let a = coordinator(&store, &clock).await;
        let b = coordinator(&store, &clock).await;

        clock.set(T0 + 10_001);
        b.sync_control().await;
        assert!(b.is_owner());

        // `a` still believes it owns the lease; its CAS must lose.
        assert!(a.is_owner());
        let err = a
            .write_control(fields(json!({ "mode": "AUTO" })))
            .await
            .unwrap_err();
        assert!(err.is_not_owner());
        assert_eq!(a.role(), LeaseRole::Foreign);

        let lease = stored_lease(&store).await;
        assert_eq!(lease.owner_session_id, b.session_id());
        assert!(lease.payload.get("mode").is_none());
    }

    #[tokio::test]
    async fn test_stale_owner_renews_before_write_when_uncontested() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let a = coordinator(&store, &clock).await;

        clock.set(T0 + 30_000);
        let written = a
            .write_control(fields(json!({ "mode": "MANUAL" })))
            .await
            .unwrap();
        assert_eq!(written.fence_token, 1);
        assert_eq!(written.issued_at, T0 + 30_000);
        assert!(a.is_owner());
    }

    #[tokio::test]
    async fn test_foreign_takes_over_expired_lease_on_write() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let a = coordinator(&store, &clock).await;
        let b = coordinator(&store, &clock).await;
        drop(a);

        clock.set(T0 + 12_000);
        let written = b
            .write_control(fields(json!({ "mode": "AUTO" })))
            .await
            .unwrap();
        assert!(b.is_owner());
        assert_eq!(written.owner_session_id, b.session_id());
        assert_eq!(written.fence_token, 1);
    }

    #[tokio::test]
    async fn test_write_conflict_with_interleaved_renewal() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let a = coordinator(&store, &clock).await;
        let b = coordinator(&store, &clock).await;
        let current = stored_lease(&store).await;

        // b sees an expired lease, but a renews just before b's CAS lands.
        clock.set(T0 + 10_001);
        let renewed = current.successor(a.session_id(), T0 + 10_001).unwrap();
        store
            .stage_foreign_write(CONTROL_DOC, renewed.encode().unwrap())
            .await;

        let err = b
            .write_control(fields(json!({ "mode": "AUTO" })))
            .await
            .unwrap_err();
        assert!(err.is_not_owner());
        assert_eq!(b.role(), LeaseRole::Foreign);
        assert_eq!(stored_lease(&store).await.owner_session_id, a.session_id());
    }

    #[tokio::test]
    async fn test_fence_tokens_strictly_increase_under_contention() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let a = coordinator(&store, &clock).await;
        let b = coordinator(&store, &clock).await;
        let c = coordinator(&store, &clock).await;
        let sessions = [&a, &b, &c];

        for round in 0..12usize {
            // Every third round the clock jumps past the window and whoever
            // goes first takes the lease.
            let step = if round % 3 == 2 { 10_001 } else { 4_000 };
            clock.advance(step);
            for s in sessions.iter().cycle().skip(round % 3).take(3) {
                s.sync_control().await;
                let _ = s
                    .write_control(fields(json!({ "round": round })))
                    .await;
            }
        }

        let fences: Vec<u64> = store
            .history(CONTROL_DOC)
            .await
            .iter()
            .map(|body| body["fenceToken"].as_u64().unwrap())
            .collect();
        assert!(fences.len() > 12);
        assert!(fences.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(sessions.iter().filter(|s| s.is_owner()).count(), 1);
    }

    #[tokio::test]
    async fn test_foreign_read_is_ttl_gated() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let a = coordinator(&store, &clock).await;
        let b = coordinator(&store, &clock).await;
        let reads = store.read_count(CONTROL_DOC).await;

        b.read_control().await;
        assert_eq!(store.read_count(CONTROL_DOC).await, reads);

        clock.advance(100);
        b.read_control().await;
        clock.advance(50);
        b.read_control().await;
        assert_eq!(store.read_count(CONTROL_DOC).await, reads + 1);

        a.write_control(fields(json!({ "mode": "MANUAL" })))
            .await
            .unwrap();
        clock.advance(50);
        let seen = b.read_control().await;
        assert_eq!(store.read_count(CONTROL_DOC).await, reads + 2);
        assert_eq!(seen.payload.get("mode"), Some(&json!("MANUAL")));
    }

    #[tokio::test]
    async fn test_owner_read_never_refetches() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let a = coordinator(&store, &clock).await;
        let reads = store.read_count(CONTROL_DOC).await;

        for _ in 0..5 {
            clock.advance(1_000);
            a.read_control().await;
        }
        assert_eq!(store.read_count(CONTROL_DOC).await, reads);
    }

    #[tokio::test]
    async fn test_device_read_is_ttl_gated() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let a = coordinator(&store, &clock).await;
        let reads = store.read_count(DEVICE_DOC).await;

        store
            .seed(DEVICE_DOC, json!({ "mode": "AUTO", "utcEpoch": 2.0 }))
            .await;
        assert_eq!(a.read_device().await.body["mode"], json!("SAFE"));
        assert_eq!(store.read_count(DEVICE_DOC).await, reads);

        clock.advance(100);
        assert_eq!(a.read_device().await.body["mode"], json!("AUTO"));
        assert_eq!(store.read_count(DEVICE_DOC).await, reads + 1);
    }

    #[tokio::test]
    async fn test_transport_errors_are_swallowed() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let a = coordinator(&store, &clock).await;
        let b = coordinator(&store, &clock).await;

        store.fail_next_reads(1).await;
        clock.advance(5_000);
        a.sync_control().await;
        assert!(a.is_owner());
        assert_eq!(stored_lease(&store).await.issued_at, T0);

        store.fail_next_reads(1).await;
        clock.advance(200);
        let seen = b.read_control().await;
        assert_eq!(seen.owner_session_id, a.session_id());

        store.fail_next_reads(1).await;
        let device = b.read_device().await;
        assert_eq!(device.body["mode"], json!("SAFE"));

        a.sync_control().await;
        assert_eq!(stored_lease(&store).await.issued_at, T0 + 5_200);
    }

    #[tokio::test]
    async fn test_write_transport_error_is_surfaced() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let a = coordinator(&store, &clock).await;

        store.fail_next_writes(1).await;
        let err = a
            .write_control(fields(json!({ "mode": "AUTO" })))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Store(StoreError::Transport { .. })));
        assert!(a.is_owner());

        let written = a
            .write_control(fields(json!({ "mode": "AUTO" })))
            .await
            .unwrap();
        assert_eq!(written.fence_token, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_cycle_takes_over_from_crashed_owner() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let config = CoordinatorConfig::default();
        let a = LeaseCoordinator::connect(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            config.clone(),
        )
        .await
        .unwrap();
        let b = LeaseCoordinator::connect(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            config,
        )
        .await
        .unwrap();
        let mut roles = b.subscribe();
        assert_eq!(*roles.borrow_and_update(), LeaseRole::Foreign);

        a.shutdown().await;
        clock.set(T0 + 10_001);
        tokio::time::sleep(Duration::from_millis(5_100)).await;

        assert!(b.is_owner());
        assert!(roles.has_changed().unwrap());
        let lease = stored_lease(&store).await;
        assert_eq!(lease.owner_session_id, b.session_id());
        assert_eq!(lease.fence_token, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_owner_stops_renewing() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let a = LeaseCoordinator::connect(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            CoordinatorConfig::default(),
        )
        .await
        .unwrap();
        drop(a);

        for step in 1..=4 {
            clock.set(T0 + step * 5_000);
            tokio::time::sleep(Duration::from_millis(5_100)).await;
        }

        let lease = stored_lease(&store).await;
        assert_eq!(lease.fence_token, 0);
        assert_eq!(lease.issued_at, T0);
        assert_eq!(store.write_count(CONTROL_DOC).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_cycle_renews_owner() {
        let store = device_store().await;
        let clock = ManualClock::new(T0);
        let a = LeaseCoordinator::connect(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            CoordinatorConfig::default(),
        )
        .await
        .unwrap();

        clock.set(T0 + 5_000);
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(stored_lease(&store).await.issued_at, T0 + 5_000);

        clock.set(T0 + 10_000);
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        let lease = stored_lease(&store).await;
        assert_eq!(lease.issued_at, T0 + 10_000);
        assert_eq!(lease.fence_token, 2);
        assert!(a.is_owner());
    }
}
