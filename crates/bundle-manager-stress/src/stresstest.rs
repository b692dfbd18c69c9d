use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bundle_manager::config::Config;
use bundle_manager::metrics::MetricsHandle;
use bundle_manager::{BundleError, BundleId, BundleManager, Position, RequestContext};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{SimulatedStores, WorkloadsConfig};

struct PreparedWorkload {
    concurrency: usize,
    bundles: u64,
    manager: BundleManager<SimulatedStores>,
    stores: Arc<crate::workloads::StoreStats>,
    _bundle_dir: tempfile::TempDir,
}

/// Runs one query against one of the bundles of the workload, cycling through query kinds.
async fn process_query(workload: &PreparedWorkload, n: u64) -> Result<(), BundleError> {
    let id = BundleId(n % workload.bundles.max(1));
    let ctx = RequestContext::new();
    let position = Position::new(10, 5);

    match n % 3 {
        0 => workload.manager.exists(&ctx, id, "main.go").await.map(drop),
        1 => workload
            .manager
            .hover(&ctx, id, "main.go", position)
            .await
            .map(drop),
        _ => workload
            .manager
            .definitions(&ctx, id, "main.go", position)
            .await
            .map(drop),
    }
}

pub async fn perform_stresstest(
    config: Config,
    metrics: MetricsHandle,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // initialize workloads, each with its own directory of empty bundle files
    let mut prepared = Vec::with_capacity(workloads.workloads.len());
    for workload in &workloads.workloads {
        let bundle_dir = tempfile::tempdir().context("failed to create bundle directory")?;
        let dbs = bundle_dir.path().join("dbs");
        std::fs::create_dir_all(&dbs).context("failed to create bundle directory")?;
        for id in 0..workload.bundles.max(1) {
            std::fs::write(dbs.join(format!("{id}.lsif.db")), b"")
                .context("failed to write bundle")?;
        }

        let stores = SimulatedStores::new(workload);
        let stats = Arc::clone(&stores.stats);
        let manager = BundleManager::new(bundle_dir.path(), &config.cache, stores, metrics.clone());

        prepared.push(Arc::new(PreparedWorkload {
            concurrency: workload.concurrency,
            bundles: workload.bundles,
            manager,
            stores: stats,
            _bundle_dir: bundle_dir,
        }));
    }

    // warmup: run each workload once to make sure bundles are open
    {
        let start = Instant::now();

        let futures = prepared.iter().map(|workload| {
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                if let Err(error) = process_query(&workload, 0).await {
                    tracing::error!(error = &error as &dyn std::error::Error, "Warmup failed");
                }
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(prepared.len());
    for workload in prepared.iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let workload = Arc::clone(workload);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let errors = Arc::new(AtomicU64::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));
            let mut n = 0;

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let errors = Arc::clone(&errors);
                        let task_start = Instant::now();
                        n += 1;

                        let future = async move {
                            if process_query(&workload, n).await.is_err() {
                                errors.fetch_add(1, Ordering::Relaxed);
                            }

                            if let Ok(mut durations) = task_durations.lock() {
                                durations.add(task_start.elapsed().as_secs_f64());
                            }

                            drop(permit);
                        };
                        let future = future.bind_hub(sentry::Hub::new_from_top(sentry::Hub::current()));

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = match task_durations.lock() {
                Ok(mut durations) => std::mem::take(&mut *durations),
                Err(_) => DDSketch::default(),
            };

            (task_durations, errors.load(Ordering::Relaxed))
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, (task, workload)) in finished_tasks.into_iter().zip(&prepared).enumerate() {
        let (task_durations, errors) = task.context("workload panicked")?;
        let concurrency = workload.concurrency;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {errors} errors"
        );

        let opens = workload.stores.opens.load(Ordering::Relaxed);
        let closes = workload.stores.closes.load(Ordering::Relaxed);
        println!("  bundles opened: {opens}; closed: {closes}");

        if ops == 0 {
            continue;
        }
        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    for workload in &prepared {
        workload.manager.shutdown().await;
    }

    Ok(())
}
