use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    net::{Ipv4Addr, SocketAddr, TcpStream},
    sync::{
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    catalog::{CatalogError, CatalogSettings, build_catalog},
    ports::PortConfiguration,
};

pub const DEFAULT_LEASE_PERIOD: Duration = Duration::from_secs(5 * 60);

const PROBE_TIMEOUT: Duration = Duration::from_millis(100);
const PROBED_PORT: &str = "http";

pub trait Clock: fmt::Debug + Send + Sync {
    fn now_unix_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_unix_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_unix_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("catalog: {0}")]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone)]
enum CatalogSource {
    Generated(CatalogSettings),
    Fixed(Vec<PortConfiguration>),
}

/// Point-in-time copy of every partition, keyed by configuration key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub catalog: Vec<u32>,
    pub available: Vec<u32>,
    pub reserved: BTreeMap<String, u32>,
    pub banned: Vec<u32>,
    pub expirations: Vec<Expiration>,
}

impl StoreSnapshot {
    pub fn expires_at(&self, key: u32) -> Option<u64> {
        self.expirations
            .iter()
            .find(|expiration| expiration.key == key)
            .map(|expiration| expiration.expires_at)
    }
}

/// Lease deadline of one reserved configuration, in unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expiration {
    pub key: u32,
    pub expires_at: u64,
}

#[derive(Debug, Default)]
struct Partitions {
    initialized: bool,
    all: BTreeMap<u32, Arc<PortConfiguration>>,
    available: BTreeMap<u32, Arc<PortConfiguration>>,
    reserved: HashMap<String, Arc<PortConfiguration>>,
    banned: BTreeMap<u32, Arc<PortConfiguration>>,
    expirations: HashMap<u32, u64>,
}

impl Partitions {
    fn holder_of(&self, key: u32) -> Option<String> {
        self.reserved
            .iter()
            .find(|(_, held)| held.key() == key)
            .map(|(client_key, _)| client_key.clone())
    }

    fn return_to_pool(&mut self, configuration: Arc<PortConfiguration>) {
        self.expirations.remove(&configuration.key());
        if !self.banned.contains_key(&configuration.key()) {
            self.available.insert(configuration.key(), configuration);
        }
    }
}

/// In-memory lease book for the configuration catalog.
///
/// All four partitions live behind one lock: mutations take it exclusively,
/// lookups share it. Nothing here blocks waiting for a configuration to free
/// up; exhaustion is reported as `None`.
#[derive(Debug)]
pub struct ReservationStore {
    source: CatalogSource,
    lease_period: Duration,
    probe_local_ports: bool,
    clock: Arc<dyn Clock>,
    state: RwLock<Partitions>,
    shutdown: watch::Sender<bool>,
}

impl ReservationStore {
    pub fn new(catalog: CatalogSettings) -> Self {
        Self::from_source(CatalogSource::Generated(catalog))
    }

    /// Store over an explicit list of configurations instead of a generated
    /// catalog.
    pub fn with_catalog(configurations: Vec<PortConfiguration>) -> Self {
        Self::from_source(CatalogSource::Fixed(configurations))
    }

    fn from_source(source: CatalogSource) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            source,
            lease_period: DEFAULT_LEASE_PERIOD,
            probe_local_ports: false,
            clock: Arc::new(SystemClock),
            state: RwLock::new(Partitions::default()),
            shutdown,
        }
    }

    pub fn with_lease_period(mut self, lease_period: Duration) -> Self {
        self.lease_period = lease_period;
        self
    }

    pub fn with_local_port_probe(mut self, enabled: bool) -> Self {
        self.probe_local_ports = enabled;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn lease_period(&self) -> Duration {
        self.lease_period
    }

    /// Builds the catalog and fills the available pool. Calling it again is
    /// a no-op.
    pub fn initialize(&self) -> Result<(), StoreError> {
        if self.read().initialized {
            return Ok(());
        }

        let candidates = match &self.source {
            CatalogSource::Generated(settings) => build_catalog(settings)?,
            CatalogSource::Fixed(configurations) => configurations.clone(),
        };

        let defined = candidates
            .into_iter()
            .filter(|candidate| self.validate(candidate))
            .collect::<Vec<_>>();

        let mut state = self.write();
        if state.initialized {
            return Ok(());
        }
        if defined.is_empty() {
            return Err(CatalogError::NoUsableConfiguration.into());
        }

        for configuration in defined {
            let key = configuration.key();
            if state.all.contains_key(&key) {
                warn!(key, "duplicate configuration key ignored");
                continue;
            }
            debug!(%configuration, "defined");
            let configuration = Arc::new(configuration);
            state.all.insert(key, Arc::clone(&configuration));
            state.available.insert(key, configuration);
        }
        state.initialized = true;

        info!(
            configurations = state.all.len(),
            lease_period_ms = self.lease_period.as_millis() as u64,
            "reservation store initialized"
        );
        Ok(())
    }

    fn validate(&self, candidate: &PortConfiguration) -> bool {
        if !candidate.is_sane() {
            warn!(key = candidate.key(), "configuration has ports outside 1024-65535");
            return false;
        }

        if let Some(port) = candidate.repeated_port() {
            warn!(key = candidate.key(), port, "configuration uses a port more than once");
            return false;
        }

        if self.probe_local_ports {
            if let Some(port) = first_bound_local_port(candidate) {
                warn!(key = candidate.key(), port, "configuration port already in use on this host");
                return false;
            }
        }

        true
    }

    /// Stops the sweeper. In-memory state is kept.
    pub fn destroy(&self) {
        self.shutdown.send_replace(true);
        info!("reservation store destroyed");
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Leases the lowest-keyed available configuration to `client_key`.
    ///
    /// A lease the client already held is handed back to the pool first, so
    /// a client never holds two configurations.
    pub fn reserve(&self, client_key: &str, ttl: Option<Duration>) -> Option<Arc<PortConfiguration>> {
        let now = self.clock.now_unix_ms();
        let mut state = self.write();
        self.reserve_locked(&mut state, client_key, ttl, now)
    }

    fn reserve_locked(
        &self,
        state: &mut Partitions,
        client_key: &str,
        ttl: Option<Duration>,
        now: u64,
    ) -> Option<Arc<PortConfiguration>> {
        let (key, configuration) = state.available.pop_first()?;

        if let Some(previous) = state
            .reserved
            .insert(client_key.to_string(), Arc::clone(&configuration))
        {
            debug!(client_key, key = previous.key(), "replacing earlier lease");
            state.return_to_pool(previous);
        }

        let expires_at = now.saturating_add(self.effective_ttl(ttl).as_millis() as u64);
        state.expirations.insert(key, expires_at);
        info!(client_key, key, expires_at, "reserved");
        Some(configuration)
    }

    /// Returns the client's current lease with a fresh expiry, or leases a new
    /// configuration when it holds none. Both paths run under one lock.
    pub fn reserve_or_renew(
        &self,
        client_key: &str,
        ttl: Option<Duration>,
    ) -> Option<Arc<PortConfiguration>> {
        let now = self.clock.now_unix_ms();
        let mut state = self.write();

        if let Some(held) = state.reserved.get(client_key).cloned() {
            let expires_at = now.saturating_add(self.effective_ttl(ttl).as_millis() as u64);
            state.expirations.insert(held.key(), expires_at);
            debug!(client_key, key = held.key(), expires_at, "renewed");
            return Some(held);
        }

        self.reserve_locked(&mut state, client_key, ttl, now)
    }

    /// Pushes the expiry of an active lease to now plus the effective TTL.
    /// Configurations that are not currently leased are left alone.
    pub fn renew(&self, configuration: &PortConfiguration, ttl: Option<Duration>) {
        let now = self.clock.now_unix_ms();
        let key = configuration.key();
        let mut state = self.write();

        if state.holder_of(key).is_none() {
            debug!(key, "renew ignored for configuration without a lease");
            return;
        }

        let expires_at = now.saturating_add(self.effective_ttl(ttl).as_millis() as u64);
        state.expirations.insert(key, expires_at);
        debug!(key, expires_at, "renewed");
    }

    /// Requested TTL when it is at most twice the lease period, otherwise
    /// the lease period itself.
    pub fn effective_ttl(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(ttl) if ttl <= self.lease_period * 2 => ttl,
            _ => self.lease_period,
        }
    }

    /// Ends the lease only when `client_key` still holds `configuration`.
    pub fn release(&self, configuration: &PortConfiguration, client_key: &str) -> bool {
        let mut state = self.write();

        let owned = state
            .reserved
            .get(client_key)
            .is_some_and(|held| held.key() == configuration.key());
        if !owned {
            return false;
        }

        if let Some(released) = state.reserved.remove(client_key) {
            info!(client_key, key = released.key(), "released");
            state.return_to_pool(released);
        }
        true
    }

    pub fn release_key(&self, key: u32, client_key: &str) -> bool {
        let Some(configuration) = self.configuration(key) else {
            return false;
        };
        self.release(&configuration, client_key)
    }

    /// Ends whatever lease `client_key` holds and reports which
    /// configuration that was.
    pub fn release_held(&self, client_key: &str) -> Option<Arc<PortConfiguration>> {
        let mut state = self.write();
        let released = state.reserved.remove(client_key)?;
        info!(client_key, key = released.key(), "released");
        state.return_to_pool(Arc::clone(&released));
        Some(released)
    }

    /// Takes a configuration out of circulation for good, whatever state it
    /// is in. Keys outside the catalog are ignored.
    pub fn ban(&self, configuration: &PortConfiguration) {
        self.ban_key(configuration.key());
    }

    pub fn ban_key(&self, key: u32) {
        let mut state = self.write();
        let Some(configuration) = state.all.get(&key).cloned() else {
            debug!(key, "ban ignored for unknown configuration");
            return;
        };

        if let Some(client_key) = state.holder_of(key) {
            state.reserved.remove(&client_key);
            info!(client_key = %client_key, key, "lease revoked by ban");
        }
        state.available.remove(&key);
        state.expirations.remove(&key);
        if state.banned.insert(key, configuration).is_none() {
            info!(key, "banned");
        }
    }

    pub fn get_reservation(&self, client_key: &str) -> Option<Arc<PortConfiguration>> {
        self.read().reserved.get(client_key).cloned()
    }

    pub fn configuration(&self, key: u32) -> Option<Arc<PortConfiguration>> {
        self.read().all.get(&key).cloned()
    }

    /// Hands every lease whose expiry is at or before now back to the pool
    /// and returns how many were reclaimed.
    pub fn clear_expired_reservations(&self) -> usize {
        let now = self.clock.now_unix_ms();
        let mut state = self.write();

        let expired = state
            .expirations
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();

        for &key in &expired {
            state.expirations.remove(&key);
            let Some(client_key) = state.holder_of(key) else {
                continue;
            };
            if let Some(configuration) = state.reserved.remove(&client_key) {
                info!(client_key = %client_key, key, "lease expired");
                state.return_to_pool(configuration);
            }
        }

        expired.len()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.read();
        let mut expirations = state
            .expirations
            .iter()
            .map(|(key, expires_at)| Expiration {
                key: *key,
                expires_at: *expires_at,
            })
            .collect::<Vec<_>>();
        expirations.sort_by_key(|expiration| expiration.key);
        StoreSnapshot {
            catalog: state.all.keys().copied().collect(),
            available: state.available.keys().copied().collect(),
            reserved: state
                .reserved
                .iter()
                .map(|(client_key, held)| (client_key.clone(), held.key()))
                .collect(),
            banned: state.banned.keys().copied().collect(),
            expirations,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Partitions> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Partitions> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Only the `http` port is checked; configurations without one are not probed.
fn first_bound_local_port(configuration: &PortConfiguration) -> Option<u32> {
    let port = configuration.port(PROBED_PORT)?;
    let port16 = u16::try_from(port).ok()?;
    let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port16));
    TcpStream::connect_timeout(&address, PROBE_TIMEOUT)
        .is_ok()
        .then_some(port)
}
