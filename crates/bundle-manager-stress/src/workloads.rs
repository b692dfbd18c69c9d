use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use bundle_manager::{
    BundleStore, CodeIntelligenceRange, Diagnostic, Hover, Location, MonikerData,
    MonikerResultKind, PackageInformationData, Page, Position, Resource, StoreError, StoreOpener,
};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// The number of queries running at the same time.
    pub concurrency: usize,
    /// The number of distinct bundles being queried, in round-robin order.
    pub bundles: u64,
    /// The time it takes to open a bundle.
    #[serde(with = "humantime_serde")]
    pub open_latency: Duration,
    /// The time it takes to run a query against an open bundle.
    #[serde(with = "humantime_serde")]
    pub query_latency: Duration,
}

#[derive(Debug, Default)]
pub struct StoreStats {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
}

/// Opens [`SimulatedStore`]s, which only pretend to do any work.
#[derive(Debug)]
pub struct SimulatedStores {
    open_latency: Duration,
    query_latency: Duration,
    pub stats: Arc<StoreStats>,
}

impl SimulatedStores {
    pub fn new(workload: &Workload) -> Self {
        Self {
            open_latency: workload.open_latency,
            query_latency: workload.query_latency,
            stats: Default::default(),
        }
    }
}

#[async_trait]
impl StoreOpener for SimulatedStores {
    type Store = SimulatedStore;

    async fn open(&self, _path: &Path) -> Result<SimulatedStore, StoreError> {
        tokio::time::sleep(self.open_latency).await;
        self.stats.opens.fetch_add(1, Ordering::Relaxed);
        Ok(SimulatedStore {
            query_latency: self.query_latency,
            stats: Arc::clone(&self.stats),
        })
    }
}

#[derive(Debug)]
pub struct SimulatedStore {
    query_latency: Duration,
    stats: Arc<StoreStats>,
}

impl SimulatedStore {
    async fn work(&self) {
        tokio::time::sleep(self.query_latency).await;
    }
}

impl Resource for SimulatedStore {
    type Error = std::convert::Infallible;

    fn close(&self) -> Result<(), Self::Error> {
        self.stats.closes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl BundleStore for SimulatedStore {
    async fn exists(&self, _path: &str) -> Result<bool, StoreError> {
        self.work().await;
        Ok(true)
    }

    async fn ranges(
        &self,
        _path: &str,
        _start_line: u32,
        _end_line: u32,
    ) -> Result<Vec<CodeIntelligenceRange>, StoreError> {
        self.work().await;
        Ok(vec![])
    }

    async fn definitions(
        &self,
        _path: &str,
        _position: Position,
    ) -> Result<Vec<Location>, StoreError> {
        self.work().await;
        Ok(vec![])
    }

    async fn references(
        &self,
        _path: &str,
        _position: Position,
    ) -> Result<Vec<Location>, StoreError> {
        self.work().await;
        Ok(vec![])
    }

    async fn hover(&self, _path: &str, _position: Position) -> Result<Option<Hover>, StoreError> {
        self.work().await;
        Ok(None)
    }

    async fn diagnostics(
        &self,
        _prefix: &str,
        _skip: usize,
        _take: usize,
    ) -> Result<Page<Diagnostic>, StoreError> {
        self.work().await;
        Ok(Page {
            items: vec![],
            count: 0,
        })
    }

    async fn monikers_by_position(
        &self,
        _path: &str,
        _position: Position,
    ) -> Result<Vec<Vec<MonikerData>>, StoreError> {
        self.work().await;
        Ok(vec![])
    }

    async fn moniker_results(
        &self,
        _kind: MonikerResultKind,
        _scheme: &str,
        _identifier: &str,
        _skip: usize,
        _take: usize,
    ) -> Result<Page<Location>, StoreError> {
        self.work().await;
        Ok(Page {
            items: vec![],
            count: 0,
        })
    }

    async fn package_information(
        &self,
        _path: &str,
        _package_information_id: &str,
    ) -> Result<Option<PackageInformationData>, StoreError> {
        self.work().await;
        Ok(None)
    }
}
