use std::time::Duration;

use bundle_manager::config::{CacheConfig, CachePolicy};
use bundle_manager::*;
use bundle_manager_test as test;
use futures::future::join_all;

use crate::{
    CURRENT_VERSION, MockBundle, MockStores, cache_config, example_bundle, setup_manager,
    wait_for_open_bundles, write_bundle,
};

fn slow_stores(open_latency: u64, query_latency: u64) -> MockStores {
    MockStores {
        open_latency: Duration::from_millis(open_latency),
        query_latency: Duration::from_millis(query_latency),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_missing_bundle() {
    let (manager, stats, _bundle_dir) =
        setup_manager(cache_config(CachePolicy::Lru, 10), MockStores::default());
    let ctx = RequestContext::new();

    assert!(!manager.exists_bundle(BundleId(1)).await.unwrap());

    let err = manager.exists(&ctx, BundleId(1), "main.go").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(stats.opens(), 0);

    // the failed entry does not stick around
    wait_for_open_bundles(&manager, 0).await;
}

#[tokio::test]
async fn test_exists_bundles() {
    let (manager, stats, bundle_dir) =
        setup_manager(cache_config(CachePolicy::Lru, 10), MockStores::default());
    write_bundle(bundle_dir.path(), BundleId(1), &example_bundle());
    write_bundle(bundle_dir.path(), BundleId(3), &example_bundle());

    let exists = manager
        .exists_bundles(&[BundleId(3), BundleId(2), BundleId(1)])
        .await
        .unwrap();
    let expected = [
        (BundleId(1), true),
        (BundleId(2), false),
        (BundleId(3), true),
    ];
    assert_eq!(exists.into_iter().collect::<Vec<_>>(), expected);

    assert!(manager.exists_bundles(&[]).await.unwrap().is_empty());

    // checking for bundles never opens them
    assert_eq!(stats.opens(), 0);
    assert_eq!(manager.open_bundles(), 0);
}

#[tokio::test]
async fn test_bundle_appears_later() {
    let (manager, stats, bundle_dir) =
        setup_manager(cache_config(CachePolicy::Lru, 10), MockStores::default());
    let ctx = RequestContext::new();

    let err = manager.exists(&ctx, BundleId(1), "main.go").await.unwrap_err();
    assert!(err.is_not_found());
    wait_for_open_bundles(&manager, 0).await;

    write_bundle(bundle_dir.path(), BundleId(1), &example_bundle());
    assert!(manager.exists_bundle(BundleId(1)).await.unwrap());
    assert!(manager.exists(&ctx, BundleId(1), "main.go").await.unwrap());
    assert_eq!(stats.opens(), 1);
}

#[tokio::test]
async fn test_malformed_bundles() {
    let (manager, stats, bundle_dir) =
        setup_manager(cache_config(CachePolicy::Lru, 10), MockStores::default());
    let ctx = RequestContext::new();

    let future_bundle = MockBundle {
        version: CURRENT_VERSION + 1,
        ..Default::default()
    };
    write_bundle(bundle_dir.path(), BundleId(1), &future_bundle);
    test::write_file(bundle_dir.path(), "dbs/2.lsif.db", b"not a bundle");

    let err = manager.exists(&ctx, BundleId(1), "main.go").await.unwrap_err();
    assert!(matches!(
        err,
        BundleError::Cache(CacheError::Malformed(ref reason)) if reason.contains("schema version")
    ));

    let err = manager.exists(&ctx, BundleId(2), "main.go").await.unwrap_err();
    assert!(matches!(err, BundleError::Cache(CacheError::Malformed(_))));

    assert_eq!(stats.opens(), 2);
    assert_eq!(stats.closes(), 0);
}

#[tokio::test]
async fn test_concurrent_queries_open_once() {
    let (manager, stats, bundle_dir) =
        setup_manager(cache_config(CachePolicy::Drain, 0), slow_stores(50, 10));
    write_bundle(bundle_dir.path(), BundleId(1), &example_bundle());
    let ctx = RequestContext::new();

    let results = join_all((0..16).map(|_| manager.exists(&ctx, BundleId(1), "main.go"))).await;
    assert!(results.into_iter().all(|res| res.unwrap()));
    assert_eq!(stats.opens(), 1);

    // the drain policy closes the bundle right after the last query
    wait_for_open_bundles(&manager, 0).await;
    assert_eq!(stats.closes(), 1);
    assert_eq!(stats.closed_in_use(), 0);
}

#[tokio::test]
async fn test_wait_timeout() {
    let cache = CacheConfig {
        policy: CachePolicy::Lru,
        capacity: 10,
        wait_timeout: Some(Duration::from_millis(10)),
    };
    let (manager, stats, bundle_dir) = setup_manager(cache, slow_stores(200, 0));
    write_bundle(bundle_dir.path(), BundleId(1), &example_bundle());

    let err = manager
        .exists(&RequestContext::new(), BundleId(1), "main.go")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BundleError::Cache(CacheError::DeadlineExceeded(_))
    ));

    // an explicit deadline takes precedence over the configured timeout
    let ctx = RequestContext::with_timeout(Duration::from_secs(5));
    assert!(manager.exists(&ctx, BundleId(1), "main.go").await.unwrap());
    assert_eq!(stats.opens(), 1);
}

#[tokio::test]
async fn test_canceled_query() {
    let (manager, stats, bundle_dir) =
        setup_manager(cache_config(CachePolicy::Lru, 10), slow_stores(100, 0));
    write_bundle(bundle_dir.path(), BundleId(1), &example_bundle());

    let token = CancellationToken::new();
    let canceled = RequestContext::new().cancellation(token.clone());
    let ctx = RequestContext::new();

    let (first, second, ()) = futures::join!(
        manager.exists(&canceled, BundleId(1), "main.go"),
        manager.exists(&ctx, BundleId(1), "main.go"),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        },
    );

    assert!(matches!(first, Err(BundleError::Cache(CacheError::Canceled))));
    assert!(second.unwrap());
    assert_eq!(stats.opens(), 1);
}

#[tokio::test]
async fn test_query_error_keeps_bundle_open() {
    let (manager, stats, bundle_dir) =
        setup_manager(cache_config(CachePolicy::Lru, 10), MockStores::default());
    write_bundle(bundle_dir.path(), BundleId(1), &example_bundle());
    let ctx = RequestContext::new();

    let result: Result<(), _> = manager
        .with_bundle(&ctx, BundleId(1), |_store| {
            Box::pin(async { Err(StoreError::Query("syntax error".into())) })
        })
        .await;
    assert!(matches!(result, Err(BundleError::Store(StoreError::Query(_)))));

    assert!(manager.exists(&ctx, BundleId(1), "main.go").await.unwrap());
    assert_eq!(stats.opens(), 1);
    assert_eq!(stats.closes(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lru_capacity_with_busy_bundles() {
    let (manager, stats, bundle_dir) =
        setup_manager(cache_config(CachePolicy::Lru, 2), slow_stores(5, 20));
    for id in 1..=5 {
        write_bundle(bundle_dir.path(), BundleId(id), &example_bundle());
    }

    let tasks: Vec<_> = (0..40u64)
        .map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                let id = BundleId(i % 5 + 1);
                let ctx = RequestContext::new();
                manager.exists(&ctx, id, "main.go").await
            })
        })
        .collect();

    for task in tasks {
        assert!(task.await.unwrap().unwrap());
    }

    assert_eq!(stats.queries(), 40);
    assert_eq!(stats.closed_in_use(), 0);

    wait_for_open_bundles(&manager, 2).await;
    assert_eq!(stats.opens() - stats.closes(), manager.open_bundles());
}

#[tokio::test]
async fn test_shutdown() {
    let (manager, stats, bundle_dir) =
        setup_manager(cache_config(CachePolicy::Lru, 10), slow_stores(0, 50));
    for id in 1..=3 {
        write_bundle(bundle_dir.path(), BundleId(id), &example_bundle());
    }
    let ctx = RequestContext::new();

    for id in 1..=2 {
        manager.exists(&ctx, BundleId(id), "main.go").await.unwrap();
    }

    // a query in flight delays the shutdown until it is done
    let running = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let ctx = RequestContext::new();
            manager.exists(&ctx, BundleId(3), "main.go").await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    manager.shutdown().await;
    assert_eq!(manager.open_bundles(), 0);
    assert_eq!(stats.closes(), 3);
    assert_eq!(stats.closed_in_use(), 0);
    assert!(running.await.unwrap().unwrap());
}
