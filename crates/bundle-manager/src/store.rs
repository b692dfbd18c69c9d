use std::io;
use std::path::Path;

use async_trait::async_trait;
use bundle_cache::Resource;

use crate::types::{
    CodeIntelligenceRange, Diagnostic, Hover, Location, MonikerData, MonikerResultKind,
    PackageInformationData, Page, Position,
};

/// An error reading a bundle.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The bundle was written by an incompatible version and could not be migrated.
    #[error("failed to migrate bundle: {0}")]
    Migration(String),
    /// The bundle contents are corrupt.
    #[error("corrupt bundle: {0}")]
    Corrupt(String),
    /// A query failed.
    #[error("query failed: {0}")]
    Query(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// An open bundle.
///
/// Stores are opened by a [`StoreOpener`] and shared between concurrent requests by the
/// [`BundleManager`](crate::BundleManager). They are [closed](Resource::close) once no request uses
/// them anymore.
///
/// Every `path` argument is relative to the root of the indexed repository.
#[async_trait]
pub trait BundleStore: Resource {
    /// Whether the bundle contains the document at `path`.
    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// All code intelligence ranges of `path` that intersect the lines `start_line..end_line`.
    async fn ranges(
        &self,
        path: &str,
        start_line: u32,
        end_line: u32,
    ) -> Result<Vec<CodeIntelligenceRange>, StoreError>;

    /// The definitions of the symbol at `position`.
    async fn definitions(&self, path: &str, position: Position)
    -> Result<Vec<Location>, StoreError>;

    /// The references to the symbol at `position`.
    async fn references(&self, path: &str, position: Position)
    -> Result<Vec<Location>, StoreError>;

    /// The hover text of the symbol at `position`, if there is any.
    async fn hover(&self, path: &str, position: Position) -> Result<Option<Hover>, StoreError>;

    /// A page of the diagnostics of all documents whose path starts with `prefix`.
    async fn diagnostics(
        &self,
        prefix: &str,
        skip: usize,
        take: usize,
    ) -> Result<Page<Diagnostic>, StoreError>;

    /// The monikers of all ranges enclosing `position`, innermost first.
    async fn monikers_by_position(
        &self,
        path: &str,
        position: Position,
    ) -> Result<Vec<Vec<MonikerData>>, StoreError>;

    /// A page of the definitions or references of the given moniker.
    async fn moniker_results(
        &self,
        kind: MonikerResultKind,
        scheme: &str,
        identifier: &str,
        skip: usize,
        take: usize,
    ) -> Result<Page<Location>, StoreError>;

    /// The package information with the given id, which is referenced by monikers of `path`.
    async fn package_information(
        &self,
        path: &str,
        package_information_id: &str,
    ) -> Result<Option<PackageInformationData>, StoreError>;
}

/// Opens [`BundleStore`]s from bundle files.
#[async_trait]
pub trait StoreOpener: Send + Sync + 'static {
    type Store: BundleStore;

    /// Opens the bundle file at `path`, migrating it to the current schema if needed.
    ///
    /// The manager ensures the file exists before calling this.
    async fn open(&self, path: &Path) -> Result<Self::Store, StoreError>;

    /// The cost of keeping `store` open, counted against the cache capacity.
    fn weight(&self, _store: &Self::Store) -> u32 {
        1
    }
}
