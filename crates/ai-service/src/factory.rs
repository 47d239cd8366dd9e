//! Pooling factory for backend client instances
//!
//! Caches live clients per (provider, normalized config) key, deduplicates
//! concurrent initializations, cascades through credential strategies, and
//! evicts idle instances on a periodic schedule.

use crate::backend::{
    ClientBuilder, ClientConfig, CompletionClient, CredentialSource, StoredCredentials,
};
use crate::circuit_breaker::CircuitBreaker;
use crate::errors::{classify_error, BackendError, ErrorKind};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Maximum idle time before a cached instance is evicted
    pub instance_ttl: Duration,
    /// Eviction scheduler period; should be shorter than the TTL
    pub eviction_interval: Duration,
    /// Attempt the stored-credentials strategy when options carry credentials
    pub enable_stored_credentials: bool,
    /// Attempt environment-supplied configuration as a fallback strategy
    pub enable_env_fallback: bool,
    /// Prefix for the environment strategy's variables
    /// (`{prefix}_ACCESS_KEY_ID`, `{prefix}_SECRET_ACCESS_KEY`)
    pub env_prefix: String,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            instance_ttl: Duration::from_millis(30_000),
            eviction_interval: Duration::from_millis(10_000),
            enable_stored_credentials: true,
            enable_env_fallback: true,
            env_prefix: "AWS".to_string(),
        }
    }
}

/// Caller-supplied selection of provider and configuration.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub provider: String,
    pub model: String,
    pub region: Option<String>,
    pub stored_credentials: Option<StoredCredentials>,
}

impl ServiceOptions {
    pub fn new(provider: &str, model: &str) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            region: None,
            stored_credentials: None,
        }
    }

    pub fn with_region(mut self, region: &str) -> Self {
        self.region = Some(region.to_string());
        self
    }

    pub fn with_stored_credentials(mut self, credentials: StoredCredentials) -> Self {
        self.stored_credentials = Some(credentials);
        self
    }
}

/// One failed initialization attempt. Accumulated across a single cascade,
/// then discarded.
#[derive(Debug, Clone)]
pub struct StrategyError {
    pub strategy: &'static str,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Cache observability snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_instances: usize,
    pub entries: Vec<CacheEntryStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryStats {
    pub key: String,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub access_count: u64,
}

struct CachedInstance {
    client: Arc<dyn CompletionClient>,
    created_at: Instant,
    last_accessed_at: Instant,
    access_count: u64,
}

impl CachedInstance {
    fn new(client: Arc<dyn CompletionClient>) -> Self {
        let now = Instant::now();
        Self {
            client,
            created_at: now,
            last_accessed_at: now,
            access_count: 1,
        }
    }
}

type InitOutcome = Result<Arc<dyn CompletionClient>, Arc<anyhow::Error>>;
type InitFuture = Shared<BoxFuture<'static, InitOutcome>>;

/// Pool of live backend clients keyed by (provider, normalized config).
pub struct ServiceFactory {
    builder: Arc<dyn ClientBuilder>,
    breaker: Arc<CircuitBreaker>,
    config: FactoryConfig,
    cache: Arc<Mutex<HashMap<String, CachedInstance>>>,
    in_flight: Arc<Mutex<HashMap<String, InitFuture>>>,
    evictor: Arc<Evictor>,
}

impl ServiceFactory {
    pub fn new(
        builder: Arc<dyn ClientBuilder>,
        breaker: Arc<CircuitBreaker>,
        config: FactoryConfig,
    ) -> Self {
        let cache = Arc::new(Mutex::new(HashMap::new()));
        let evictor = Arc::new(Evictor {
            cache: Arc::clone(&cache),
            task: Mutex::new(None),
            pass_running: AtomicBool::new(false),
            instance_ttl: config.instance_ttl,
            interval: config.eviction_interval,
        });
        Self {
            builder,
            breaker,
            config,
            cache,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            evictor,
        }
    }

    /// Return a live client for `options`, creating one if necessary.
    ///
    /// Concurrent callers for the same key share a single initialization;
    /// all of them receive the same instance.
    pub async fn create_service(
        &self,
        options: &ServiceOptions,
    ) -> Result<Arc<dyn CompletionClient>> {
        let key = cache_key(options);

        if let Some(client) = self.lookup_live(&key) {
            return Ok(client);
        }

        let init = {
            let mut in_flight = lock(&self.in_flight);
            if let Some(pending) = in_flight.get(&key) {
                debug!("joining in-flight initialization for {key}");
                pending.clone()
            } else {
                let pending = self.begin_initialization(key.clone(), options.clone());
                in_flight.insert(key.clone(), pending.clone());
                pending
            }
        };

        init.await.map_err(|err| match err.downcast_ref::<BackendError>() {
            Some(backend) => anyhow::Error::new(backend.clone()),
            None => anyhow!("{err:#}"),
        })
    }

    /// Dispose cached instances immediately, optionally only for one
    /// provider. Used for credential rotation and tests.
    pub fn clear_cache(&self, provider: Option<&str>) -> usize {
        let mut cache = lock(&self.cache);
        let before = cache.len();
        match provider {
            Some(provider) => {
                let prefix = format!("{}:", provider.trim().to_lowercase());
                cache.retain(|key, _| !key.starts_with(&prefix));
            }
            None => cache.clear(),
        }
        let disposed = before - cache.len();
        if disposed > 0 {
            info!("disposed {disposed} cached client instance(s)");
        }
        disposed
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = lock(&self.cache);
        let entries: Vec<CacheEntryStats> = cache
            .iter()
            .map(|(key, instance)| CacheEntryStats {
                key: key.clone(),
                age_ms: instance.created_at.elapsed().as_millis() as u64,
                idle_ms: instance.last_accessed_at.elapsed().as_millis() as u64,
                access_count: instance.access_count,
            })
            .collect();
        CacheStats {
            total_instances: entries.len(),
            entries,
        }
    }

    fn lookup_live(&self, key: &str) -> Option<Arc<dyn CompletionClient>> {
        let mut cache = lock(&self.cache);
        match cache.get_mut(key) {
            Some(instance)
                if instance.last_accessed_at.elapsed() <= self.config.instance_ttl =>
            {
                instance.last_accessed_at = Instant::now();
                instance.access_count += 1;
                debug!("cache hit for {key} (access #{})", instance.access_count);
                Some(Arc::clone(&instance.client))
            }
            Some(_) => {
                info!("cached instance for {key} expired, disposing");
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn begin_initialization(&self, key: String, options: ServiceOptions) -> InitFuture {
        info!(
            "starting initialization cascade for {key} (provider '{}')",
            options.provider
        );
        let builder = Arc::clone(&self.builder);
        let breaker = Arc::clone(&self.breaker);
        let config = self.config.clone();
        let cache = Arc::clone(&self.cache);
        let in_flight = Arc::clone(&self.in_flight);
        let evictor = Arc::clone(&self.evictor);

        async move {
            let result = run_cascade(&*builder, &breaker, &options, &config).await;

            if let Ok(client) = &result {
                lock(&cache).insert(key.clone(), CachedInstance::new(Arc::clone(client)));
            }
            lock(&in_flight).remove(&key);
            if result.is_ok() {
                Evictor::ensure_running(&evictor);
            }
            result.map_err(Arc::new)
        }
        .boxed()
        .shared()
    }
}

/// Ordered credential strategies for one cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitStrategy {
    StoredCredentials,
    EnvironmentConfig,
    DefaultChain,
}

impl InitStrategy {
    fn name(self) -> &'static str {
        match self {
            InitStrategy::StoredCredentials => "stored-credentials",
            InitStrategy::EnvironmentConfig => "environment-config",
            InitStrategy::DefaultChain => "default-chain",
        }
    }
}

fn strategy_order(options: &ServiceOptions, config: &FactoryConfig) -> Vec<InitStrategy> {
    let mut order = Vec::new();
    if config.enable_stored_credentials && options.stored_credentials.is_some() {
        order.push(InitStrategy::StoredCredentials);
    }
    if config.enable_env_fallback {
        order.push(InitStrategy::EnvironmentConfig);
    }
    order.push(InitStrategy::DefaultChain);
    order
}

async fn run_cascade(
    builder: &dyn ClientBuilder,
    breaker: &CircuitBreaker,
    options: &ServiceOptions,
    config: &FactoryConfig,
) -> Result<Arc<dyn CompletionClient>> {
    let mut failures: Vec<StrategyError> = Vec::new();

    for strategy in strategy_order(options, config) {
        debug!("attempting initialization strategy '{}'", strategy.name());
        match attempt_strategy(builder, breaker, options, config, strategy).await {
            Ok(client) => {
                info!(
                    "initialization strategy '{}' succeeded for provider '{}'",
                    strategy.name(),
                    options.provider
                );
                return Ok(client);
            }
            Err(err) => {
                let kind = classify_error(&err);
                warn!(
                    "initialization strategy '{}' failed ({kind}): {err:#}",
                    strategy.name()
                );
                failures.push(StrategyError {
                    strategy: strategy.name(),
                    kind,
                    message: format!("{err:#}"),
                    at: Utc::now(),
                });
            }
        }
    }

    Err(anyhow::Error::new(BackendError::Initialization(
        aggregate_message(&options.provider, &failures),
    )))
}

async fn attempt_strategy(
    builder: &dyn ClientBuilder,
    breaker: &CircuitBreaker,
    options: &ServiceOptions,
    config: &FactoryConfig,
    strategy: InitStrategy,
) -> Result<Arc<dyn CompletionClient>> {
    let client_config = resolve_client_config(strategy, options, config)?;

    // Construction and the validation probe share one breaker timeout budget.
    breaker
        .execute(async {
            let client = builder.construct(&client_config).await?;
            client.validate_availability().await?;
            Ok(client)
        })
        .await
}

fn resolve_client_config(
    strategy: InitStrategy,
    options: &ServiceOptions,
    config: &FactoryConfig,
) -> Result<ClientConfig, BackendError> {
    let credentials = match strategy {
        InitStrategy::StoredCredentials => {
            let credentials = options.stored_credentials.clone().ok_or_else(|| {
                BackendError::Initialization("no stored credentials available".to_string())
            })?;
            CredentialSource::Stored(credentials)
        }
        InitStrategy::EnvironmentConfig => {
            let access_key_id = require_env(&config.env_prefix, "ACCESS_KEY_ID")?;
            let secret_access_key = require_env(&config.env_prefix, "SECRET_ACCESS_KEY")?;
            CredentialSource::Environment {
                access_key_id,
                secret_access_key,
            }
        }
        InitStrategy::DefaultChain => CredentialSource::DefaultChain,
    };

    Ok(ClientConfig {
        provider: options.provider.clone(),
        model: options.model.clone(),
        region: options.region.clone(),
        credentials,
    })
}

fn require_env(prefix: &str, suffix: &str) -> Result<String, BackendError> {
    let name = format!("{prefix}_{suffix}");
    std::env::var(&name)
        .map_err(|_| BackendError::Initialization(format!("{name} is not set in the environment")))
}

fn aggregate_message(provider: &str, failures: &[StrategyError]) -> String {
    let mut message = format!("all initialization strategies failed for provider '{provider}':");
    for failure in failures {
        message.push_str(&format!(
            "\n  [{}] {}: {}",
            failure.strategy, failure.kind, failure.message
        ));
    }
    message.push_str(
        "\nverify that credentials are configured, the configured region is reachable, \
         and the backend service is enabled for this account",
    );
    message
}

/// Deterministic cache key from provider and normalized config. The provider
/// stays in clear text so `clear_cache(provider)` can match on it.
fn cache_key(options: &ServiceOptions) -> String {
    let mut hasher = DefaultHasher::new();
    options.model.trim().to_lowercase().hash(&mut hasher);
    options
        .region
        .as_deref()
        .map(str::trim)
        .unwrap_or("")
        .hash(&mut hasher);
    if let Some(credentials) = &options.stored_credentials {
        credentials.access_key_id.hash(&mut hasher);
    }
    format!(
        "{}:{:016x}",
        options.provider.trim().to_lowercase(),
        hasher.finish()
    )
}

/// Periodic TTL sweep over the instance cache. Passes never overlap, and the
/// scheduler stops itself once the cache is empty.
struct Evictor {
    cache: Arc<Mutex<HashMap<String, CachedInstance>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    pass_running: AtomicBool,
    instance_ttl: Duration,
    interval: Duration,
}

impl Evictor {
    fn ensure_running(evictor: &Arc<Evictor>) {
        let mut task = lock(&evictor.task);
        if task.as_ref().map(|handle| !handle.is_finished()).unwrap_or(false) {
            return;
        }
        debug!("starting eviction scheduler (interval {:?})", evictor.interval);
        let runner = Arc::clone(evictor);
        *task = Some(tokio::spawn(async move {
            runner.run().await;
        }));
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            if self.pass_running.swap(true, Ordering::SeqCst) {
                continue;
            }
            let empty = self.sweep();
            self.pass_running.store(false, Ordering::SeqCst);
            if empty {
                debug!("instance cache empty, eviction scheduler stopping");
                break;
            }
        }
    }

    fn sweep(&self) -> bool {
        let mut cache = lock(&self.cache);
        cache.retain(|key, instance| {
            let idle = instance.last_accessed_at.elapsed();
            if idle > self.instance_ttl {
                info!("evicting instance {key} after {:?} idle", idle);
                false
            } else {
                true
            }
        });
        cache.is_empty()
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
