//! End-to-end scenarios against the full runtime with in-memory
//! collaborators and a paused clock.

use berth_core::{Phase, PoolId, VersionTag};
use berth_runtime::{
    config::PoolSpec,
    registry::Registry,
    testing::{FakeBridge, FlakyProber, MemoryStore, StaticMetrics},
};
use std::{sync::Arc, time::Duration};
use tokio::time::advance;

struct Harness {
    registry: Arc<Registry>,
    bridge: Arc<FakeBridge>,
    metrics: Arc<StaticMetrics>,
    store: Arc<MemoryStore>,
}

async fn start() -> Harness {
    start_with(Arc::new(MemoryStore::default()), FlakyProber::healthy()).await
}

async fn start_with(store: Arc<MemoryStore>, prober: FlakyProber) -> Harness {
    let bridge = Arc::new(FakeBridge::new());
    let metrics = Arc::new(StaticMetrics::default());
    let registry = Registry::builder(bridge.clone(), store.clone(), metrics.clone())
        .prober(Arc::new(prober))
        .start()
        .await
        .expect("registry starts");
    Harness {
        registry,
        bridge,
        metrics,
        store,
    }
}

fn web_pool() -> PoolId {
    PoolId::new("a1", "web")
}

async fn create_web_pool(h: &Harness, min: u32, max: u32) {
    h.registry
        .create_pool(
            PoolSpec::new(web_pool())
                .with_bounds(min, max)
                .with_capacity(10.0, 1.0),
        )
        .await
        .unwrap();
    h.registry
        .activate_version(&web_pool(), VersionTag::new("v1"), "registry/app:v1")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn cold_start_grants_within_the_deadline() {
    let h = start().await;
    create_web_pool(&h, 0, 4).await;

    let lease = h
        .registry
        .acquire_lease("a1", "web", Duration::from_secs(30))
        .await
        .expect("cold acquire should launch and grant");

    let status = h.registry.describe_pool(&web_pool()).unwrap();
    assert_eq!(status.desired, 1);
    assert_eq!(status.ready, 1);
    assert_eq!(status.leases, 1);
    assert_eq!(h.bridge.launched_count(), 1);

    lease.release();
    let status = h.registry.describe_pool(&web_pool()).unwrap();
    assert_eq!(status.leases, 0);
}

#[tokio::test(start_paused = true)]
async fn unknown_pool_fails_fast() {
    let h = start().await;
    let err = h
        .registry
        .acquire_lease("ghost", "web", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, berth_core::AcquireError::UnknownPool(_)));
}

#[tokio::test(start_paused = true)]
async fn sustained_load_scales_to_demand_and_spreads_leases() {
    let h = start().await;
    create_web_pool(&h, 0, 4).await;

    // Warm one handle, then offer 35 rps for a minute.
    let warm = h
        .registry
        .acquire_lease("a1", "web", Duration::from_secs(30))
        .await
        .unwrap();
    warm.release();
    h.metrics.set_rps(&web_pool(), 35.0);
    advance(Duration::from_secs(60)).await;

    let status = h.registry.describe_pool(&web_pool()).unwrap();
    assert_eq!(status.desired, 4, "ceil(35/10) = 4");
    assert_eq!(status.ready, 4);

    // Four concurrent leases spread one per handle.
    let mut leases = Vec::new();
    for _ in 0..4 {
        leases.push(
            h.registry
                .acquire_lease("a1", "web", Duration::from_secs(5))
                .await
                .unwrap(),
        );
    }
    let status = h.registry.describe_pool(&web_pool()).unwrap();
    let counts: Vec<u32> = status.windows[0].handles.iter().map(|h| h.leases).collect();
    assert_eq!(counts.iter().sum::<u32>(), 4);
    assert!(counts.iter().all(|&c| c <= 1), "leases uneven: {counts:?}");
    for lease in leases {
        lease.release();
    }
}

#[tokio::test(start_paused = true)]
async fn idle_pool_scales_to_zero_and_cold_starts_again() {
    let h = start().await;
    create_web_pool(&h, 0, 4).await;

    let lease = h
        .registry
        .acquire_lease("a1", "web", Duration::from_secs(30))
        .await
        .unwrap();
    lease.release();
    assert_eq!(h.registry.describe_pool(&web_pool()).unwrap().ready, 1);

    // No offered load for well past idle_to_zero.
    h.metrics.set_rps(&web_pool(), 0.0);
    advance(Duration::from_secs(400)).await;

    let status = h.registry.describe_pool(&web_pool()).unwrap();
    assert_eq!(status.desired, 0);
    assert_eq!(status.ready, 0);
    assert_eq!(h.bridge.running_count(), 0, "sandbox tasks reaped");

    // The next acquire cold-starts a fresh handle.
    let lease = h
        .registry
        .acquire_lease("a1", "web", Duration::from_secs(30))
        .await
        .expect("cold start after scale-to-zero");
    assert_eq!(h.registry.describe_pool(&web_pool()).unwrap().ready, 1);
    lease.release();
}

#[tokio::test(start_paused = true)]
async fn rolling_update_routes_to_new_version_and_never_revokes_leases() {
    let h = start().await;
    create_web_pool(&h, 0, 4).await;
    h.registry.set_desired_scale(&web_pool(), 3, 4).unwrap();
    advance(Duration::from_secs(10)).await;
    assert_eq!(h.registry.describe_pool(&web_pool()).unwrap().ready, 3);

    // Hold a v1 lease across the rollout.
    let held = h
        .registry
        .acquire_lease("a1", "web", Duration::from_secs(5))
        .await
        .unwrap();

    h.registry
        .activate_version(&web_pool(), VersionTag::new("v2"), "registry/app:v2")
        .unwrap();
    advance(Duration::from_secs(20)).await;

    let status = h.registry.describe_pool(&web_pool()).unwrap();
    assert_eq!(status.active_version, Some(VersionTag::new("v2")));
    let v2 = status
        .windows
        .iter()
        .find(|w| w.version == VersionTag::new("v2"))
        .expect("v2 window exists");
    assert!(v2.handles.iter().filter(|h| h.phase == Phase::Ready).count() >= 3);

    // New acquires land on v2.
    let fresh = h
        .registry
        .acquire_lease("a1", "web", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(v2.handles.iter().any(|h| &h.id == fresh.handle()));

    // The v1 window is draining but the held lease survives.
    let v1 = status
        .windows
        .iter()
        .find(|w| w.version == VersionTag::new("v1"))
        .expect("v1 window still present while leased");
    assert_eq!(v1.mode, "draining");
    assert!(v1.handles.iter().any(|h| &h.id == held.handle()));

    // Release; the drained window is then collected.
    held.release();
    fresh.release();
    advance(Duration::from_secs(40)).await;
    let status = h.registry.describe_pool(&web_pool()).unwrap();
    assert!(
        !status
            .windows
            .iter()
            .any(|w| w.version == VersionTag::new("v1")),
        "v1 window should be gone after drain"
    );
}

#[tokio::test(start_paused = true)]
async fn repeated_launch_failures_poison_the_version_and_keep_prior_serving() {
    let h = start().await;
    create_web_pool(&h, 0, 4).await;

    // v1 serving.
    let warm = h
        .registry
        .acquire_lease("a1", "web", Duration::from_secs(30))
        .await
        .unwrap();
    warm.release();

    // v3's image crashes every launch.
    h.bridge.fail_next_launches(u32::MAX);
    h.registry
        .activate_version(&web_pool(), VersionTag::new("v3"), "registry/app:v3")
        .unwrap();
    advance(Duration::from_secs(60)).await;

    let status = h.registry.describe_pool(&web_pool()).unwrap();
    assert!(status.poisoned.contains(&VersionTag::new("v3")));

    // Re-activation of the poisoned tag is rejected.
    let err = h
        .registry
        .activate_version(&web_pool(), VersionTag::new("v3"), "registry/app:v3")
        .unwrap_err();
    assert!(matches!(err, berth_core::ConfigError::Poisoned(_, _)));

    // The prior version keeps serving.
    let lease = h
        .registry
        .acquire_lease("a1", "web", Duration::from_secs(5))
        .await
        .expect("v1 still serves while v3 is poisoned");
    lease.release();

    // Operator reset clears the block.
    assert!(h
        .registry
        .reset_poison(&web_pool(), &VersionTag::new("v3"))
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn desired_zero_keeps_leased_handle_until_release() {
    let h = start().await;
    create_web_pool(&h, 0, 4).await;

    let lease = h
        .registry
        .acquire_lease("a1", "web", Duration::from_secs(30))
        .await
        .unwrap();

    // Operator forces the pool to zero while the lease is held.
    h.registry.set_desired_scale(&web_pool(), 0, 0).unwrap();
    advance(Duration::from_secs(30)).await;

    let status = h.registry.describe_pool(&web_pool()).unwrap();
    assert_eq!(status.desired, 0);
    assert_eq!(status.leases, 1);
    assert_eq!(h.bridge.running_count(), 1, "leased handle must survive");

    lease.release();
    advance(Duration::from_secs(10)).await;
    assert_eq!(h.bridge.running_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn pinned_pool_ignores_idle_eviction() {
    let h = start().await;
    h.registry
        .create_pool(
            PoolSpec::new(web_pool())
                .with_bounds(2, 2)
                .with_capacity(10.0, 1.0),
        )
        .await
        .unwrap();
    h.registry
        .activate_version(&web_pool(), VersionTag::new("v1"), "registry/app:v1")
        .unwrap();
    h.registry.set_desired_scale(&web_pool(), 2, 2).unwrap();

    advance(Duration::from_secs(600)).await;
    let status = h.registry.describe_pool(&web_pool()).unwrap();
    assert_eq!(status.ready, 2, "min=max pins the pool regardless of load");
}

#[tokio::test(start_paused = true)]
async fn acquire_times_out_without_consuming_capacity() {
    let h = start().await;
    h.registry
        .create_pool(PoolSpec::new(web_pool()).with_bounds(0, 0))
        .await
        .unwrap();
    h.registry
        .activate_version(&web_pool(), VersionTag::new("v1"), "registry/app:v1")
        .unwrap();

    // max=0: nothing can ever launch, so the acquire must time out.
    let err = h
        .registry
        .acquire_lease("a1", "web", Duration::from_secs(3))
        .await
        .unwrap_err();
    assert!(matches!(err, berth_core::AcquireError::Timeout(_)));

    // The next reconcile pass prunes the abandoned waiter.
    advance(Duration::from_secs(3)).await;
    let status = h.registry.describe_pool(&web_pool()).unwrap();
    assert_eq!(status.leases, 0);
    assert_eq!(status.waiters, 0, "timed-out waiter should be gone");
}

#[tokio::test(start_paused = true)]
async fn restart_rebuilds_pools_and_reproves_handles() {
    let store = Arc::new(MemoryStore::default());
    let h = start_with(store.clone(), FlakyProber::healthy()).await;
    create_web_pool(&h, 0, 4).await;
    let lease = h
        .registry
        .acquire_lease("a1", "web", Duration::from_secs(30))
        .await
        .unwrap();
    lease.release();
    h.registry.shutdown().await;

    // A new registry over the same store adopts the pool and handle.
    let h2 = start_with(store, FlakyProber::healthy()).await;
    let status = h2.registry.describe_pool(&web_pool()).unwrap();
    assert_eq!(status.desired, 1);
    assert_eq!(status.active_version, Some(VersionTag::new("v1")));

    // The adopted handle must be re-proven before serving again.
    let lease = h2
        .registry
        .acquire_lease("a1", "web", Duration::from_secs(30))
        .await
        .expect("adopted handle serves after a fresh probe");
    lease.release();
}

#[tokio::test(start_paused = true)]
async fn shutdown_refuses_new_leases_and_lets_old_ones_release() {
    let h = start().await;
    create_web_pool(&h, 0, 4).await;
    let lease = h
        .registry
        .acquire_lease("a1", "web", Duration::from_secs(30))
        .await
        .unwrap();

    h.registry.shutdown().await;
    let err = h
        .registry
        .acquire_lease("a1", "web", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, berth_core::AcquireError::ShuttingDown));

    // The in-flight lease still releases cleanly.
    lease.release();
    assert_eq!(h.registry.describe_pool(&web_pool()).unwrap().leases, 0);

    // Final state was persisted.
    assert!(h.store.tuple_count() > 0);
}
