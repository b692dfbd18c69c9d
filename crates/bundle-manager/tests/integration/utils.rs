use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bundle_manager::config::CacheConfig;
use bundle_manager::metrics::MetricsHandle;
use bundle_manager::*;
use bundle_manager_test as test;
use serde::{Deserialize, Serialize};

/// The schema version written by [`write_bundle`].
pub const CURRENT_VERSION: u32 = 2;

/// The contents of a bundle file read by the [`MockStores`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MockBundle {
    pub version: u32,
    pub documents: BTreeMap<String, Vec<CodeIntelligenceRange>>,
    pub diagnostics: Vec<Diagnostic>,
    pub monikers: BTreeMap<String, Vec<(Range, Vec<MonikerData>)>>,
    pub moniker_locations: Vec<MonikerLocation>,
    pub packages: BTreeMap<String, PackageInformationData>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MonikerLocation {
    pub kind: MonikerResultKind,
    pub scheme: String,
    pub identifier: String,
    pub location: Location,
}

/// Counts what happened to the stores of a [`MockStores`] opener.
#[derive(Debug, Default)]
pub struct MockStats {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub closed_in_use: AtomicUsize,
    pub queries: AtomicUsize,
}

impl MockStats {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn closed_in_use(&self) -> usize {
        self.closed_in_use.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("store closed twice")]
pub struct CloseError;

/// A store answering queries from a deserialized [`MockBundle`].
#[derive(Debug)]
pub struct MockStore {
    bundle: MockBundle,
    query_latency: Duration,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    stats: Arc<MockStats>,
}

impl MockStore {
    async fn enter(&self) -> Result<InFlight<'_>, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Query("store is closed".into()));
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.stats.queries.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        tokio::time::sleep(self.query_latency).await;
        Ok(guard)
    }

    fn range_at(&self, path: &str, position: Position) -> Option<&CodeIntelligenceRange> {
        self.bundle
            .documents
            .get(path)?
            .iter()
            .find(|range| range.range.contains(position))
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Resource for MockStore {
    type Error = CloseError;

    fn close(&self) -> Result<(), CloseError> {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            self.stats.closed_in_use.fetch_add(1, Ordering::SeqCst);
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(CloseError);
        }
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl BundleStore for MockStore {
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let _guard = self.enter().await?;
        Ok(self.bundle.documents.contains_key(path))
    }

    async fn ranges(
        &self,
        path: &str,
        start_line: u32,
        end_line: u32,
    ) -> Result<Vec<CodeIntelligenceRange>, StoreError> {
        let _guard = self.enter().await?;
        let ranges = self.bundle.documents.get(path).into_iter().flatten();
        Ok(ranges
            .filter(|r| r.range.start.line < end_line && r.range.end.line >= start_line)
            .cloned()
            .collect())
    }

    async fn definitions(
        &self,
        path: &str,
        position: Position,
    ) -> Result<Vec<Location>, StoreError> {
        let _guard = self.enter().await?;
        let range = self.range_at(path, position);
        Ok(range.map(|r| r.definitions.clone()).unwrap_or_default())
    }

    async fn references(
        &self,
        path: &str,
        position: Position,
    ) -> Result<Vec<Location>, StoreError> {
        let _guard = self.enter().await?;
        let range = self.range_at(path, position);
        Ok(range.map(|r| r.references.clone()).unwrap_or_default())
    }

    async fn hover(&self, path: &str, position: Position) -> Result<Option<Hover>, StoreError> {
        let _guard = self.enter().await?;
        let hover = self
            .range_at(path, position)
            .filter(|r| !r.hover_text.is_empty())
            .map(|r| Hover {
                text: r.hover_text.clone(),
                range: r.range,
            });
        Ok(hover)
    }

    async fn diagnostics(
        &self,
        prefix: &str,
        skip: usize,
        take: usize,
    ) -> Result<Page<Diagnostic>, StoreError> {
        let _guard = self.enter().await?;
        let matching: Vec<_> = self
            .bundle
            .diagnostics
            .iter()
            .filter(|d| d.path.starts_with(prefix))
            .collect();
        Ok(Page {
            count: matching.len(),
            items: matching.into_iter().skip(skip).take(take).cloned().collect(),
        })
    }

    async fn monikers_by_position(
        &self,
        path: &str,
        position: Position,
    ) -> Result<Vec<Vec<MonikerData>>, StoreError> {
        let _guard = self.enter().await?;
        let monikers = self.bundle.monikers.get(path).into_iter().flatten();
        Ok(monikers
            .filter(|(range, _)| range.contains(position))
            .map(|(_, monikers)| monikers.clone())
            .collect())
    }

    async fn moniker_results(
        &self,
        kind: MonikerResultKind,
        scheme: &str,
        identifier: &str,
        skip: usize,
        take: usize,
    ) -> Result<Page<Location>, StoreError> {
        let _guard = self.enter().await?;
        let matching: Vec<_> = self
            .bundle
            .moniker_locations
            .iter()
            .filter(|m| m.kind == kind && m.scheme == scheme && m.identifier == identifier)
            .collect();
        Ok(Page {
            count: matching.len(),
            items: matching
                .into_iter()
                .skip(skip)
                .take(take)
                .map(|m| m.location.clone())
                .collect(),
        })
    }

    async fn package_information(
        &self,
        _path: &str,
        package_information_id: &str,
    ) -> Result<Option<PackageInformationData>, StoreError> {
        let _guard = self.enter().await?;
        Ok(self.bundle.packages.get(package_information_id).cloned())
    }
}

/// Opens [`MockStore`]s from JSON encoded [`MockBundle`] files.
#[derive(Debug, Default)]
pub struct MockStores {
    pub open_latency: Duration,
    pub query_latency: Duration,
    pub stats: Arc<MockStats>,
}

#[async_trait]
impl StoreOpener for MockStores {
    type Store = MockStore;

    async fn open(&self, path: &Path) -> Result<MockStore, StoreError> {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.open_latency).await;

        let contents = tokio::fs::read(path).await?;
        let bundle: MockBundle = serde_json::from_slice(&contents)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        if bundle.version > CURRENT_VERSION {
            return Err(StoreError::Migration(format!(
                "unknown schema version {}",
                bundle.version
            )));
        }

        Ok(MockStore {
            bundle,
            query_latency: self.query_latency,
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            stats: Arc::clone(&self.stats),
        })
    }
}

/// Writes `bundle` to the location of bundle `id` below `bundle_dir`.
pub fn write_bundle(bundle_dir: &Path, id: BundleId, bundle: &MockBundle) {
    let contents = serde_json::to_vec(bundle).unwrap();
    test::write_file(bundle_dir, format!("dbs/{id}.lsif.db"), &contents);
}

/// Setup tests and create a bundle manager over [`MockStores`].
///
/// This returns the manager, the stats of its stores, and the temporary bundle directory, which is
/// cleaned up when the [`TempDir`](test::TempDir) instance is dropped. Keep it as guard until the
/// test has finished.
pub fn setup_manager(
    cache: CacheConfig,
    stores: MockStores,
) -> (BundleManager<MockStores>, Arc<MockStats>, test::TempDir) {
    test::setup();

    let bundle_dir = test::tempdir();
    let stats = Arc::clone(&stores.stats);
    let manager = BundleManager::new(bundle_dir.path(), &cache, stores, MetricsHandle::noop());

    (manager, stats, bundle_dir)
}

/// A cache config without wait timeout.
pub fn cache_config(policy: config::CachePolicy, capacity: u64) -> CacheConfig {
    CacheConfig {
        policy,
        capacity,
        wait_timeout: None,
    }
}

/// Waits until the manager has at most `count` bundles open.
pub async fn wait_for_open_bundles(manager: &BundleManager<MockStores>, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.open_bundles() > count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("bundles were not closed in time");
}

pub fn location(id: u64, path: &str, start: (u32, u32), end: (u32, u32)) -> Location {
    Location {
        dump_id: BundleId(id),
        path: path.into(),
        range: Range::new(Position::new(start.0, start.1), Position::new(end.0, end.1)),
    }
}

/// A small bundle for a Go repository.
pub fn example_bundle() -> MockBundle {
    let main_range = CodeIntelligenceRange {
        range: Range::new(Position::new(10, 5), Position::new(10, 9)),
        definitions: vec![location(42, "main.go", (3, 5), (3, 9))],
        references: vec![
            location(42, "main.go", (10, 5), (10, 9)),
            location(42, "util/pad.go", (7, 1), (7, 5)),
        ],
        hover_text: "func main()".into(),
    };
    let pad_range = CodeIntelligenceRange {
        range: Range::new(Position::new(20, 2), Position::new(20, 10)),
        definitions: vec![],
        references: vec![],
        hover_text: String::new(),
    };

    let diagnostic = |path: &str, line: u32| Diagnostic {
        dump_id: BundleId(42),
        path: path.into(),
        severity: 1,
        code: "c1".into(),
        message: "unused variable".into(),
        source: "go vet".into(),
        start_line: line,
        start_character: 0,
        end_line: line,
        end_character: 4,
    };

    let leftpad = MonikerData {
        kind: MonikerKind::Import,
        scheme: "gomod".into(),
        identifier: "leftpad".into(),
        package_information_id: Some("123".into()),
    };

    MockBundle {
        version: CURRENT_VERSION,
        documents: BTreeMap::from([("main.go".to_owned(), vec![main_range, pad_range])]),
        diagnostics: vec![
            diagnostic("internal/foo.go", 11),
            diagnostic("internal/bar.go", 21),
            diagnostic("internal/baz.go", 31),
            diagnostic("main.go", 1),
        ],
        monikers: BTreeMap::from([(
            "main.go".to_owned(),
            vec![(
                Range::new(Position::new(20, 2), Position::new(20, 10)),
                vec![leftpad],
            )],
        )]),
        moniker_locations: vec![
            MonikerLocation {
                kind: MonikerResultKind::Definition,
                scheme: "gomod".into(),
                identifier: "leftpad".into(),
                location: location(42, "foo.go", (1, 2), (3, 4)),
            },
            MonikerLocation {
                kind: MonikerResultKind::Definition,
                scheme: "gomod".into(),
                identifier: "leftpad".into(),
                location: location(42, "bar.go", (5, 6), (7, 8)),
            },
            MonikerLocation {
                kind: MonikerResultKind::Reference,
                scheme: "gomod".into(),
                identifier: "leftpad".into(),
                location: location(42, "baz.go", (9, 0), (9, 7)),
            },
        ],
        packages: BTreeMap::from([(
            "123".to_owned(),
            PackageInformationData {
                name: "leftpad".into(),
                version: "0.1.0".into(),
            },
        )]),
    }
}
