//! End-to-end tests wiring the admission layer together the way a backend
//! would: one shared store standing in for Redis, several components (or
//! several "processes") sharing it.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use turnstile::{
    AdmissionConfig, AdmissionController, AdmissionError, AdmissionPolicy, CacheConfig,
    CallContext, Denial, DistributedConfig, DistributedLockService, InMemoryStore,
    LocalLockService, LockPolicy, LockService, MetricsSink, NoopMetrics, PermitScriptArgs,
    RateLimitScope, SharedStore, StampedeSafeCache, StoreError, with_lock,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    user_id: u64,
    display_name: String,
}

/// A store that refuses every operation, standing in for a network
/// partition between this process and the coordination store.
#[derive(Debug)]
struct PartitionedStore;

impl PartitionedStore {
    fn err() -> StoreError {
        StoreError::Unavailable("connection refused".into())
    }
}

impl SharedStore for PartitionedStore {
    fn get(&self, _: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Err(Self::err())
    }
    fn set(&self, _: &str, _: &[u8], _: Option<Duration>) -> Result<(), StoreError> {
        Err(Self::err())
    }
    fn delete(&self, _: &str) -> Result<bool, StoreError> {
        Err(Self::err())
    }
    fn set_if_absent(&self, _: &str, _: &[u8], _: Option<Duration>) -> Result<bool, StoreError> {
        Err(Self::err())
    }
    fn delete_if_equals(&self, _: &str, _: &[u8]) -> Result<bool, StoreError> {
        Err(Self::err())
    }
    fn acquire_permits(&self, _: &str, _: &PermitScriptArgs) -> Result<bool, StoreError> {
        Err(Self::err())
    }
}

#[derive(Debug, Default)]
struct RecordingMetrics {
    rejections: Mutex<Vec<String>>,
    cache_hits: AtomicU32,
    cache_misses: AtomicU32,
}

impl MetricsSink for RecordingMetrics {
    fn record_rejection(&self, scope: &str, target: &str) {
        self.rejections.lock().push(format!("{scope}:{target}"));
    }
    fn record_cache_hit(&self, _: &str) {
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
    }
    fn record_cache_miss(&self, _: &str) {
        self.cache_misses.fetch_add(1, Ordering::SeqCst);
    }
}

fn controller_with(
    config: AdmissionConfig,
    metrics: Arc<dyn MetricsSink>,
) -> AdmissionController {
    AdmissionController::new(config, Arc::new(InMemoryStore::new()), metrics).unwrap()
}

#[test]
fn test_denied_login_surfaces_retry_hint() {
    let config = AdmissionConfig {
        user_qps: 2.0,
        ..AdmissionConfig::default()
    };
    let metrics = Arc::new(RecordingMetrics::default());
    let controller = controller_with(config, metrics.clone());

    let ctx = CallContext::new("UserService.login").with_subject("1001");
    let policy = AdmissionPolicy::scoped(RateLimitScope::User);

    let mut denied = None;
    for _ in 0..10 {
        match controller.run(&ctx, &policy, || "ok", None) {
            Ok(_) => {}
            Err(err) => {
                denied = Some(err);
                break;
            }
        }
    }

    let err = denied.expect("2 QPS bucket must deny within 10 attempts");
    match &err {
        AdmissionError::Denied { scope, target, .. } => {
            assert_eq!(*scope, "USER");
            assert_eq!(target, "1001");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.retry_after_secs(), 1);
    assert_eq!(metrics.rejections.lock().first().unwrap(), "USER:1001");
}

#[test]
fn test_fallback_served_instead_of_denial() {
    let config = AdmissionConfig {
        user_qps: 1.0,
        ..AdmissionConfig::default()
    };
    let metrics = Arc::new(RecordingMetrics::default());
    let controller = controller_with(config, metrics.clone());

    let ctx = CallContext::new("FeedService.home").with_subject("7");
    let policy = AdmissionPolicy::scoped(RateLimitScope::User);
    let fallback = |_: &Denial| "stale feed".to_string();

    let mut outcomes = Vec::new();
    for _ in 0..5 {
        outcomes.push(
            controller
                .run(&ctx, &policy, || "fresh feed".to_string(), Some(&fallback))
                .unwrap(),
        );
    }

    assert_eq!(outcomes[0], "fresh feed");
    assert!(outcomes.contains(&"stale feed".to_string()));
    // A served fallback is degradation, not rejection.
    assert!(metrics.rejections.lock().is_empty());
}

#[test]
fn test_fleet_limit_shared_by_two_processes() {
    let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
    let config = AdmissionConfig {
        global_qps: 100.0,
        user_qps: 100.0,
        distributed: DistributedConfig {
            enabled: true,
            burst_factor: 1.0,
            bucket_ttl_secs: 10,
        },
        ..AdmissionConfig::default()
    };
    let a = AdmissionController::new(config.clone(), store.clone(), Arc::new(NoopMetrics))
        .unwrap();
    let b = AdmissionController::new(config, store, Arc::new(NoopMetrics)).unwrap();

    let ctx = CallContext::new("ExportService.run");
    let policy = AdmissionPolicy {
        qps: Some(6.0),
        distributed: true,
        ..AdmissionPolicy::scoped(RateLimitScope::Interface)
    };

    // Locally each process would admit 6; the shared bucket caps the pair.
    let granted = (0..20)
        .filter(|i| {
            let c = if i % 2 == 0 { &a } else { &b };
            c.try_admit(&ctx, &policy).is_ok()
        })
        .count();
    assert!((6..=7).contains(&granted), "granted {granted}");
}

#[test]
fn test_partitioned_store_fails_open_for_limiting() {
    let config = AdmissionConfig {
        global_qps: 100.0,
        user_qps: 100.0,
        distributed: DistributedConfig {
            enabled: true,
            burst_factor: 1.0,
            bucket_ttl_secs: 10,
        },
        ..AdmissionConfig::default()
    };
    let controller =
        AdmissionController::new(config, Arc::new(PartitionedStore), Arc::new(NoopMetrics))
            .unwrap();

    let ctx = CallContext::new("op").with_subject("u");
    let policy = AdmissionPolicy {
        distributed: true,
        ..AdmissionPolicy::scoped(RateLimitScope::User)
    };

    // The local tier still limits; the unreachable fleet tier does not deny.
    let granted = (0..10)
        .filter(|_| controller.try_admit(&ctx, &policy).is_ok())
        .count();
    assert!(granted >= 5, "granted {granted}");
}

#[test]
fn test_partitioned_store_fails_closed_for_locking() {
    let locks = DistributedLockService::new(Arc::new(PartitionedStore), Arc::new(NoopMetrics));
    let policy = LockPolicy {
        wait: Duration::ZERO,
        ..LockPolicy::default()
    };
    assert!(!locks.try_lock("account:1", &policy));
}

#[test]
fn test_distributed_lock_excludes_across_processes() {
    let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
    let a = Arc::new(DistributedLockService::new(store.clone(), Arc::new(NoopMetrics)));
    let b = Arc::new(DistributedLockService::new(store, Arc::new(NoopMetrics)));

    let counter = Arc::new(Mutex::new(0u32));
    let mut handles = Vec::new();
    for service in [a, b] {
        for _ in 0..2 {
            let service = Arc::clone(&service);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                let policy = LockPolicy {
                    wait: Duration::from_secs(5),
                    ..LockPolicy::default()
                };
                for _ in 0..25 {
                    let done = with_lock(&*service, "account:42", &policy, || {
                        let mut n = counter.lock();
                        *n += 1;
                    });
                    done.unwrap();
                }
            }));
        }
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*counter.lock(), 100);
}

#[test]
fn test_expired_lease_recovers_across_processes() {
    let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
    let crashed = DistributedLockService::new(store.clone(), Arc::new(NoopMetrics));
    let survivor = DistributedLockService::new(store, Arc::new(NoopMetrics));

    // "Process" one takes the lock with a 500 ms lease and never releases.
    let policy = LockPolicy {
        wait: Duration::ZERO,
        lease: Some(Duration::from_millis(500)),
        fair: false,
    };
    assert!(crashed.try_lock("job:rebuild", &policy));
    drop(crashed);

    let wait = LockPolicy {
        wait: Duration::from_millis(1500),
        ..LockPolicy::default()
    };
    let start = Instant::now();
    assert!(survivor.try_lock("job:rebuild", &wait));
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(400), "waited {waited:?}");
    assert!(waited < Duration::from_millis(1200), "waited {waited:?}");
    survivor.unlock("job:rebuild");
}

#[test]
fn test_cache_single_flight_across_processes() {
    // Two caches over one store, each with its own distributed lock
    // service: an expiry storm across both "processes" loads once.
    let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
    let config = CacheConfig {
        base_ttl_secs: 60,
        jitter_secs: 10,
        tombstone_ttl_secs: 5,
        lock_wait_ms: 3000,
        lock_lease_ms: 5000,
    };
    let cache_for = |store: Arc<InMemoryStore>| -> Arc<StampedeSafeCache<Profile>> {
        Arc::new(StampedeSafeCache::new(
            "profiles",
            store.clone(),
            Arc::new(DistributedLockService::new(store, Arc::new(NoopMetrics))),
            Arc::new(NoopMetrics),
            config.clone(),
        ))
    };
    let a = cache_for(store.clone());
    let b = cache_for(store);
    let loads = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for cache in [a, b] {
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            let loads = Arc::clone(&loads);
            handles.push(thread::spawn(move || {
                cache.get("42", move || -> Result<Option<Profile>, Infallible> {
                    loads.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(100));
                    Ok(Some(Profile {
                        user_id: 42,
                        display_name: "Ada".into(),
                    }))
                })
            }));
        }
    }
    for handle in handles {
        let got = handle.join().unwrap().unwrap();
        assert_eq!(got.map(|p| p.user_id), Some(42));
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cache_metrics_follow_reads() {
    let metrics = Arc::new(RecordingMetrics::default());
    let cache: StampedeSafeCache<Profile> = StampedeSafeCache::new(
        "profiles",
        Arc::new(InMemoryStore::new()),
        Arc::new(LocalLockService::new(Arc::new(NoopMetrics))),
        metrics.clone(),
        CacheConfig::default(),
    );

    let load = || -> Result<Option<Profile>, Infallible> {
        Ok(Some(Profile {
            user_id: 1,
            display_name: "Grace".into(),
        }))
    };
    cache.get("1", load).unwrap();
    cache.get("1", load).unwrap();
    cache.get("1", load).unwrap();

    assert_eq!(metrics.cache_misses.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.cache_hits.load(Ordering::SeqCst), 2);
}

#[test]
fn test_toml_config_drives_controller() {
    let config = AdmissionConfig::from_toml_str(
        r#"
        global_qps = 50.0
        global_warmup_secs = 0
        global_timeout_ms = 0
        user_qps = 3.0
        lock_mode = "local"

        [registry]
        idle_secs = 60
        max_entries = 100

        [distributed]
        enabled = false
        "#,
    )
    .unwrap();
    let controller =
        AdmissionController::new(config, Arc::new(InMemoryStore::new()), Arc::new(NoopMetrics))
            .unwrap();

    let ctx = CallContext::new("op").with_subject("u");
    let policy = AdmissionPolicy::scoped(RateLimitScope::User);
    let granted = (0..10)
        .filter(|_| controller.try_admit(&ctx, &policy).is_ok())
        .count();
    assert!((3..=4).contains(&granted), "granted {granted}");
}

#[test]
fn test_global_warmup_throttles_cold_start() {
    let config = AdmissionConfig {
        global_qps: 20.0,
        global_warmup_secs: 2,
        global_timeout_ms: 0,
        ..AdmissionConfig::default()
    };
    let controller = controller_with(config, Arc::new(NoopMetrics));

    let ctx = CallContext::new("op");
    let policy = AdmissionPolicy::scoped(RateLimitScope::Global);

    // Cold: the warm-up bucket starts empty, so immediate probes fail.
    assert!(controller.try_admit(&ctx, &policy).is_err());

    // A moment later the ramp has accrued at least one permit.
    thread::sleep(Duration::from_millis(400));
    assert!(controller.try_admit(&ctx, &policy).is_ok());
}

#[test]
fn test_registry_cleanup_thread_evicts_idle_users() {
    let config = AdmissionConfig {
        user_qps: 5.0,
        registry: turnstile::RegistryConfig {
            idle_secs: 1,
            max_entries: 100,
            cleanup_interval_secs: 1,
        },
        ..AdmissionConfig::default()
    };
    let controller = controller_with(config, Arc::new(NoopMetrics));

    let policy = AdmissionPolicy::scoped(RateLimitScope::User);
    for user in ["a", "b", "c"] {
        let ctx = CallContext::new("op").with_subject(user);
        assert!(controller.try_admit(&ctx, &policy).is_ok());
    }
    assert_eq!(controller.registry().len(), 3);

    let (handle, stop_tx) = Arc::clone(controller.registry()).start_cleanup_thread();
    thread::sleep(Duration::from_millis(2500));
    stop_tx.send(()).unwrap();
    handle.join().unwrap();

    assert!(controller.registry().is_empty());
    assert_eq!(controller.registry().total_evicted(), 3);
}
