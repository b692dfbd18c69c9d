use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bundle_cache::metrics::MetricsHandle;
use bundle_cache::{
    CacheError, DrainPolicy, LruPolicy, OpenResult, RequestContext, ResourceCache, ResourceOpener,
};
use futures::future::BoxFuture;
use futures::{FutureExt, TryFutureExt};

use crate::config::{CacheConfig, CachePolicy, Config};
use crate::store::{BundleStore, StoreError, StoreOpener};
use crate::types::{
    BundleId, CodeIntelligenceRange, Diagnostic, Hover, Location, MonikerData, MonikerResultKind,
    PackageInformationData, Page, Position,
};

/// An error querying a bundle.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    /// The bundle could not be opened, or the request gave up waiting for it.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// The bundle was opened, but the query failed.
    #[error("failed to query bundle")]
    Store(#[from] StoreError),
}

impl BundleError {
    /// Whether the requested bundle does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Cache(CacheError::NotFound))
    }
}

/// Opens the bundle files requested by the cache, after making sure they exist.
#[derive(Debug)]
pub struct BundleOpener<S> {
    stores: S,
}

impl<S: StoreOpener> ResourceOpener for BundleOpener<S> {
    type Key = PathBuf;
    type Resource = S::Store;

    fn open(&self, path: PathBuf) -> BoxFuture<'_, OpenResult<S::Store>> {
        Box::pin(async move {
            let metadata = tokio::fs::metadata(&path).await?;
            if !metadata.is_file() {
                return Err(CacheError::NotFound);
            }

            self.stores.open(&path).await.map_err(|err| {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to open bundle",
                );
                open_error(err)
            })
        })
    }

    fn weight(&self, store: &S::Store) -> u32 {
        self.stores.weight(store)
    }
}

fn open_error(err: StoreError) -> CacheError {
    match err {
        StoreError::Migration(reason) | StoreError::Corrupt(reason) => {
            CacheError::Malformed(reason)
        }
        StoreError::Io(err) => err.into(),
        err => CacheError::OpenFailed(err.to_string()),
    }
}

/// Serves code intelligence queries from the bundles in a directory.
///
/// Bundles are opened on demand, shared between concurrent queries, and closed according to the
/// configured [`CachePolicy`]. A bundle is never closed while a query is running against it.
#[derive(Debug)]
pub struct BundleManager<S: StoreOpener> {
    bundle_dir: PathBuf,
    cache: ResourceCache<BundleOpener<S>>,
    wait_timeout: Option<Duration>,
}

impl<S: StoreOpener> Clone for BundleManager<S> {
    fn clone(&self) -> Self {
        Self {
            bundle_dir: self.bundle_dir.clone(),
            cache: self.cache.clone(),
            wait_timeout: self.wait_timeout,
        }
    }
}

impl<S: StoreOpener> BundleManager<S> {
    /// Creates a manager for the bundles below `bundle_dir`, opened by `stores`.
    pub fn new(
        bundle_dir: impl Into<PathBuf>,
        config: &CacheConfig,
        stores: S,
        metrics: MetricsHandle,
    ) -> Self {
        let opener = BundleOpener { stores };
        let cache = match config.policy {
            CachePolicy::Lru => {
                ResourceCache::new("bundles", opener, LruPolicy::new(config.capacity), metrics)
            }
            CachePolicy::Drain => ResourceCache::new("bundles", opener, DrainPolicy, metrics),
        };

        Self {
            bundle_dir: bundle_dir.into(),
            cache,
            wait_timeout: config.wait_timeout,
        }
    }

    /// Creates a manager for the bundle directory and cache described by `config`.
    pub fn from_config(config: &Config, stores: S, metrics: MetricsHandle) -> Self {
        Self::new(config.bundle_dir.clone(), &config.cache, stores, metrics)
    }

    /// The path of the bundle file with the given id.
    pub fn bundle_path(&self, id: BundleId) -> PathBuf {
        bundle_path(&self.bundle_dir, id)
    }

    /// The number of bundles that are open, or being opened or closed.
    pub fn open_bundles(&self) -> usize {
        self.cache.len()
    }

    /// Whether the bundle file exists, without opening it.
    pub async fn exists_bundle(&self, id: BundleId) -> Result<bool, BundleError> {
        match tokio::fs::metadata(self.bundle_path(id)).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::Io(err).into()),
        }
    }

    /// Checks which of the given bundle files exist, without opening them.
    pub async fn exists_bundles(
        &self,
        ids: &[BundleId],
    ) -> Result<BTreeMap<BundleId, bool>, BundleError> {
        let checks = ids.iter().map(|&id| async move {
            let exists = self.exists_bundle(id).await?;
            Ok::<_, BundleError>((id, exists))
        });
        futures::future::try_join_all(checks)
            .await
            .map(|results| results.into_iter().collect())
    }

    /// Runs `op` against the opened bundle with the given id.
    ///
    /// The wait for the bundle is bounded by `ctx`. Without a deadline in `ctx`, the configured
    /// [`wait_timeout`](CacheConfig::wait_timeout) applies. The query itself is not bounded.
    pub async fn with_bundle<T, F>(
        &self,
        ctx: &RequestContext,
        id: BundleId,
        op: F,
    ) -> Result<T, BundleError>
    where
        T: 'static,
        F: for<'r> FnOnce(&'r S::Store) -> BoxFuture<'r, Result<T, StoreError>>,
    {
        let ctx = match (ctx.deadline(), self.wait_timeout) {
            (None, Some(timeout)) => ctx.clone().timeout(timeout),
            _ => ctx.clone(),
        };

        self.cache
            .with_resource(&ctx, self.bundle_path(id), move |store| {
                op(store).map_err(BundleError::Store).boxed()
            })
            .await
    }

    /// Whether the bundle contains the document at `path`.
    pub async fn exists(
        &self,
        ctx: &RequestContext,
        id: BundleId,
        path: &str,
    ) -> Result<bool, BundleError> {
        let path = path.to_owned();
        self.with_bundle(ctx, id, move |store| {
            Box::pin(async move { store.exists(&path).await })
        })
        .await
    }

    /// The code intelligence ranges of `path` between `start_line` and `end_line`.
    #[tracing::instrument(skip_all, fields(bundle = %id))]
    pub async fn ranges(
        &self,
        ctx: &RequestContext,
        id: BundleId,
        path: &str,
        start_line: u32,
        end_line: u32,
    ) -> Result<Vec<CodeIntelligenceRange>, BundleError> {
        let path = path.to_owned();
        self.with_bundle(ctx, id, move |store| {
            Box::pin(async move { store.ranges(&path, start_line, end_line).await })
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(bundle = %id))]
    pub async fn definitions(
        &self,
        ctx: &RequestContext,
        id: BundleId,
        path: &str,
        position: Position,
    ) -> Result<Vec<Location>, BundleError> {
        let path = path.to_owned();
        self.with_bundle(ctx, id, move |store| {
            Box::pin(async move { store.definitions(&path, position).await })
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(bundle = %id))]
    pub async fn references(
        &self,
        ctx: &RequestContext,
        id: BundleId,
        path: &str,
        position: Position,
    ) -> Result<Vec<Location>, BundleError> {
        let path = path.to_owned();
        self.with_bundle(ctx, id, move |store| {
            Box::pin(async move { store.references(&path, position).await })
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(bundle = %id))]
    pub async fn hover(
        &self,
        ctx: &RequestContext,
        id: BundleId,
        path: &str,
        position: Position,
    ) -> Result<Option<Hover>, BundleError> {
        let path = path.to_owned();
        self.with_bundle(ctx, id, move |store| {
            Box::pin(async move { store.hover(&path, position).await })
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(bundle = %id))]
    pub async fn diagnostics(
        &self,
        ctx: &RequestContext,
        id: BundleId,
        prefix: &str,
        skip: usize,
        take: usize,
    ) -> Result<Page<Diagnostic>, BundleError> {
        let prefix = prefix.to_owned();
        self.with_bundle(ctx, id, move |store| {
            Box::pin(async move { store.diagnostics(&prefix, skip, take).await })
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(bundle = %id))]
    pub async fn monikers_by_position(
        &self,
        ctx: &RequestContext,
        id: BundleId,
        path: &str,
        position: Position,
    ) -> Result<Vec<Vec<MonikerData>>, BundleError> {
        let path = path.to_owned();
        self.with_bundle(ctx, id, move |store| {
            Box::pin(async move { store.monikers_by_position(&path, position).await })
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(bundle = %id))]
    #[allow(clippy::too_many_arguments)]
    pub async fn moniker_results(
        &self,
        ctx: &RequestContext,
        id: BundleId,
        kind: MonikerResultKind,
        scheme: &str,
        identifier: &str,
        skip: usize,
        take: usize,
    ) -> Result<Page<Location>, BundleError> {
        let scheme = scheme.to_owned();
        let identifier = identifier.to_owned();
        self.with_bundle(ctx, id, move |store| {
            Box::pin(async move {
                store
                    .moniker_results(kind, &scheme, &identifier, skip, take)
                    .await
            })
        })
        .await
    }

    #[tracing::instrument(skip_all, fields(bundle = %id))]
    pub async fn package_information(
        &self,
        ctx: &RequestContext,
        id: BundleId,
        path: &str,
        package_information_id: &str,
    ) -> Result<Option<PackageInformationData>, BundleError> {
        let path = path.to_owned();
        let package_information_id = package_information_id.to_owned();
        self.with_bundle(ctx, id, move |store| {
            Box::pin(async move {
                store
                    .package_information(&path, &package_information_id)
                    .await
            })
        })
        .await
    }

    /// Closes all bundles once the queries running against them are done.
    ///
    /// Resolves when every bundle is closed. Queries made after this open their bundles again.
    pub async fn shutdown(&self) {
        tracing::info!(open = self.cache.len(), "Closing all bundles");
        self.cache.clear();
        while !self.cache.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// The path of the bundle file with the given id below `bundle_dir`.
pub fn bundle_path(bundle_dir: &Path, id: BundleId) -> PathBuf {
    bundle_dir.join("dbs").join(format!("{id}.lsif.db"))
}
