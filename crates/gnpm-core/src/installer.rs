//! Concurrent install pipeline.
//!
//! Three worker pools connected by bounded queues operate over a shared,
//! deduplicated dependency graph:
//!
//! resolve -> download -> extract
//!
//! Resolve workers pick a concrete version for each requested range, record
//! the package in the graph, and feed its declared dependencies back into the
//! resolve queue. Download workers open tarball streams, throttled by a
//! counting semaphore. Extract workers unpack each stream into
//! `node_modules/<name>`.
//!
//! Termination uses a three-phase drain: each queue has a pending counter
//! incremented before a task is enqueued and decremented only after the task
//! fully completes, including any enqueues it performs downstream. The driver
//! waits out the resolve counter, closes the resolve queue, then repeats for
//! download and extract, so no dangling producer races a close.

use crate::error::Error;
use crate::graph::{package_key, DependencyGraph, ResolvedVersions};
use crate::registry::{Packument, RegistryClient, VersionManifest};
use crate::semver_range;
use crate::spec::{PackageSpec, LATEST_TAG};
use crate::tarball::{self, DirSet, ExtractError};
use futures::TryStreamExt;
use semver::Version;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::thread;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, warn};

const RESOLVE_QUEUE_CAPACITY: usize = 64;
const DOWNLOAD_QUEUE_CAPACITY: usize = 32;
const EXTRACT_QUEUE_CAPACITY: usize = 32;

/// Simultaneously-open tarball streams, regardless of worker count.
const MAX_OPEN_DOWNLOADS: usize = 8;

/// Fallback worker scale when hardware parallelism cannot be determined.
const DEFAULT_PARALLELISM: usize = 4;

struct ResolveTask {
    name: String,
    requested: String,
    parent_key: Option<String>,
}

struct DownloadTask {
    name: String,
    tarball_url: String,
    install_path: PathBuf,
}

struct ExtractTask {
    name: String,
    stream: reqwest::Response,
    install_path: PathBuf,
}

/// Pending-task counter for one pipeline stage.
///
/// `add` must happen before the task is enqueued; `done` only after the task
/// fully completes. `wait` resolves once the count reaches zero.
#[derive(Default)]
struct TaskCounter {
    pending: AtomicUsize,
    drained: Notify,
}

impl TaskCounter {
    fn add(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    fn count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        while self.pending.load(Ordering::SeqCst) != 0 {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
    }
}

type SenderSlot<T> = StdMutex<Option<mpsc::Sender<T>>>;

fn sender<T>(slot: &SenderSlot<T>) -> Option<mpsc::Sender<T>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

fn close<T>(slot: &SenderSlot<T>) {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take();
}

/// Outcome summary of one install run.
#[derive(Debug, Clone, Copy)]
pub struct InstallReport {
    /// Distinct `name@version` nodes recorded in the graph.
    pub resolved: usize,
    /// Distinct tarball downloads scheduled.
    pub downloaded: usize,
}

/// The install pipeline. One instance drives one install run.
pub struct Installer {
    registry: RegistryClient,
    install_root: PathBuf,

    graph: RwLock<DependencyGraph>,
    resolved: RwLock<ResolvedVersions>,
    manifest_cache: RwLock<HashMap<String, VersionManifest>>,
    packument_cache: RwLock<HashMap<String, Arc<Packument>>>,
    download_cache: RwLock<HashSet<String>>,
    created_dirs: Arc<DirSet>,

    resolve_tx: SenderSlot<ResolveTask>,
    download_tx: SenderSlot<DownloadTask>,
    extract_tx: SenderSlot<ExtractTask>,

    resolve_pending: Arc<TaskCounter>,
    download_pending: Arc<TaskCounter>,
    extract_pending: Arc<TaskCounter>,

    download_slots: Semaphore,

    fatal: StdMutex<Option<Error>>,
}

impl Installer {
    #[must_use]
    pub fn new(registry: RegistryClient, install_root: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            install_root: install_root.into(),
            graph: RwLock::new(DependencyGraph::new()),
            resolved: RwLock::new(ResolvedVersions::new()),
            manifest_cache: RwLock::new(HashMap::new()),
            packument_cache: RwLock::new(HashMap::new()),
            download_cache: RwLock::new(HashSet::new()),
            created_dirs: Arc::new(DirSet::new()),
            resolve_tx: StdMutex::new(None),
            download_tx: StdMutex::new(None),
            extract_tx: StdMutex::new(None),
            resolve_pending: Arc::new(TaskCounter::default()),
            download_pending: Arc::new(TaskCounter::default()),
            extract_pending: Arc::new(TaskCounter::default()),
            download_slots: Semaphore::new(MAX_OPEN_DOWNLOADS),
            fatal: StdMutex::new(None),
        }
    }

    /// Resolve, download, and extract the full transitive graph of `spec`.
    ///
    /// Resolver errors are fatal: the first one is returned after the
    /// pipeline drains. Download and extraction failures are logged per
    /// package and do not abort sibling installs.
    pub async fn run(self: &Arc<Self>, spec: &PackageSpec) -> Result<InstallReport, Error> {
        let parallelism = thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(DEFAULT_PARALLELISM);

        let (resolve_tx, resolve_rx) = mpsc::channel(RESOLVE_QUEUE_CAPACITY);
        let (download_tx, download_rx) = mpsc::channel(DOWNLOAD_QUEUE_CAPACITY);
        let (extract_tx, extract_rx) = mpsc::channel(EXTRACT_QUEUE_CAPACITY);

        *self.resolve_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(resolve_tx);
        *self.download_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(download_tx);
        *self.extract_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(extract_tx);

        let resolve_rx = Arc::new(Mutex::new(resolve_rx));
        let download_rx = Arc::new(Mutex::new(download_rx));
        let extract_rx = Arc::new(Mutex::new(extract_rx));

        let mut workers = Vec::new();
        // Resolve is I/O-bound on metadata; run twice as many workers.
        for _ in 0..parallelism * 2 {
            workers.push(tokio::spawn(
                Arc::clone(self).resolve_worker(Arc::clone(&resolve_rx)),
            ));
        }
        for _ in 0..parallelism {
            workers.push(tokio::spawn(
                Arc::clone(self).download_worker(Arc::clone(&download_rx)),
            ));
        }
        for _ in 0..parallelism {
            workers.push(tokio::spawn(
                Arc::clone(self).extract_worker(Arc::clone(&extract_rx)),
            ));
        }

        debug!(
            name = %spec.name,
            requested = %spec.requested,
            workers = parallelism * 4,
            "Starting install pipeline"
        );

        self.enqueue_resolve(spec.name.clone(), spec.requested.clone(), None);

        // Three-phase drain. Closing a queue signals its workers to exit.
        self.resolve_pending.wait().await;
        close(&self.resolve_tx);
        self.download_pending.wait().await;
        close(&self.download_tx);
        self.extract_pending.wait().await;
        close(&self.extract_tx);

        for worker in workers {
            let _ = worker.await;
        }

        if let Some(err) = self
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(err);
        }

        let report = InstallReport {
            resolved: self.graph.read().await.len(),
            downloaded: self.download_cache.read().await.len(),
        };
        debug!(
            resolved = report.resolved,
            downloaded = report.downloaded,
            "Install pipeline drained"
        );
        Ok(report)
    }

    /// Snapshot of the dependency graph (for callers and tests).
    pub async fn graph(&self) -> DependencyGraph {
        self.graph.read().await.clone()
    }

    /// Versions selected for `name`, in selection order.
    pub async fn selected_versions(&self, name: &str) -> Vec<Version> {
        self.resolved
            .read()
            .await
            .versions(name)
            .map(<[Version]>::to_vec)
            .unwrap_or_default()
    }

    /// Package keys whose download was scheduled.
    pub async fn downloaded_keys(&self) -> HashSet<String> {
        self.download_cache.read().await.clone()
    }

    /// True once every queue is idle. Meaningful after `run` returns.
    pub fn is_drained(&self) -> bool {
        self.resolve_pending.count() == 0
            && self.download_pending.count() == 0
            && self.extract_pending.count() == 0
    }

    // ---- queue plumbing ----------------------------------------------------

    /// Enqueue a resolve task, counting it pending before the send.
    ///
    /// Resolve workers enqueue into their own stage, so a blocking send here
    /// could wedge the whole pool against a full queue. Overflow falls back
    /// to a detached forwarder task; the pending count is already held, so
    /// the drain barrier still covers the task.
    fn enqueue_resolve(self: &Arc<Self>, name: String, requested: String, parent_key: Option<String>) {
        self.resolve_pending.add();

        let Some(tx) = sender(&self.resolve_tx) else {
            self.resolve_pending.done();
            return;
        };

        let task = ResolveTask {
            name,
            requested,
            parent_key,
        };
        match tx.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => {
                let pending = Arc::clone(&self.resolve_pending);
                tokio::spawn(async move {
                    if tx.send(task).await.is_err() {
                        pending.done();
                    }
                });
            }
            Err(TrySendError::Closed(_)) => self.resolve_pending.done(),
        }
    }

    async fn enqueue_download(&self, task: DownloadTask) {
        self.download_pending.add();
        match sender(&self.download_tx) {
            Some(tx) => {
                if tx.send(task).await.is_err() {
                    self.download_pending.done();
                }
            }
            None => self.download_pending.done(),
        }
    }

    async fn enqueue_extract(&self, task: ExtractTask) {
        self.extract_pending.add();
        match sender(&self.extract_tx) {
            Some(tx) => {
                if tx.send(task).await.is_err() {
                    self.extract_pending.done();
                }
            }
            None => self.extract_pending.done(),
        }
    }

    // ---- workers -----------------------------------------------------------

    async fn resolve_worker(self: Arc<Self>, rx: Arc<Mutex<mpsc::Receiver<ResolveTask>>>) {
        loop {
            let task = { rx.lock().await.recv().await };
            let Some(task) = task else { break };

            if let Err(err) = self.install_package(&task).await {
                self.record_fatal(err);
            }
            self.resolve_pending.done();
        }
    }

    async fn download_worker(self: Arc<Self>, rx: Arc<Mutex<mpsc::Receiver<DownloadTask>>>) {
        loop {
            let task = { rx.lock().await.recv().await };
            let Some(task) = task else { break };

            let Ok(permit) = self.download_slots.acquire().await else {
                self.download_pending.done();
                break;
            };

            match self.registry.open_tarball(&task.tarball_url).await {
                Ok(stream) => {
                    self.enqueue_extract(ExtractTask {
                        name: task.name,
                        stream,
                        install_path: task.install_path,
                    })
                    .await;
                }
                Err(err) => {
                    warn!(error = %err, "Failed to download: {}", task.name);
                }
            }

            drop(permit);
            self.download_pending.done();
        }
    }

    async fn extract_worker(self: Arc<Self>, rx: Arc<Mutex<mpsc::Receiver<ExtractTask>>>) {
        loop {
            let task = { rx.lock().await.recv().await };
            let Some(task) = task else { break };

            let name = task.name.clone();
            if let Err(err) = self.extract_stream(task).await {
                warn!("Failed to extract: {name} {err}");
            }
            self.extract_pending.done();
        }
    }

    /// Consume a tarball stream into its install path.
    ///
    /// The response body is bridged into a blocking reader so decompression
    /// streams straight from the socket to disk without buffering the whole
    /// archive. The stream is dropped on all exit paths.
    async fn extract_stream(&self, task: ExtractTask) -> Result<(), Error> {
        let ExtractTask {
            name,
            stream,
            install_path,
        } = task;

        debug!(name = %name, path = %install_path.display(), "Extracting");

        let reader = StreamReader::new(stream.bytes_stream().map_err(io::Error::other));
        let bridge = SyncIoBridge::new(reader);
        let dirs = Arc::clone(&self.created_dirs);

        tokio::task::spawn_blocking(move || tarball::extract(bridge, &install_path, &dirs))
            .await
            .map_err(|join_err| {
                Error::Extract(ExtractError::Tar(io::Error::other(format!(
                    "extraction task failed: {join_err}"
                ))))
            })??;

        Ok(())
    }

    // ---- per-task resolution ----------------------------------------------

    /// Process one resolve task: pick a concrete version, record the node and
    /// its parent edge, feed dependencies back into the resolve queue, and
    /// schedule the download once per package key.
    async fn install_package(self: &Arc<Self>, task: &ResolveTask) -> Result<(), Error> {
        // A fatal error is already recorded; drain remaining tasks as no-ops.
        if self.has_fatal() {
            return Ok(());
        }

        let (manifest, version) = match Version::parse(&task.requested) {
            Ok(full) => {
                let key = package_key(&task.name, &full);
                if !self.graph.write().await.mark_visited(&key) {
                    self.record_parent_edge(task.parent_key.as_deref(), &key).await;
                    return Ok(());
                }

                let manifest = self.version_manifest(&task.name, &task.requested).await?;
                (manifest, full)
            }
            Err(_) => {
                let manifest = self.resolve_requested(&task.name, &task.requested).await?;
                let version =
                    Version::parse(&manifest.version).map_err(|source| Error::SemverParse {
                        name: task.name.clone(),
                        value: manifest.version.clone(),
                        source,
                    })?;

                let key = package_key(&task.name, &version);
                if !self.graph.write().await.mark_visited(&key) {
                    self.record_parent_edge(task.parent_key.as_deref(), &key).await;
                    return Ok(());
                }
                (manifest, version)
            }
        };

        let key = package_key(&task.name, &version);
        self.record_parent_edge(task.parent_key.as_deref(), &key).await;

        for (dep_name, dep_range) in &manifest.dependencies {
            self.enqueue_resolve(dep_name.clone(), dep_range.clone(), Some(key.clone()));
        }

        self.resolved.write().await.record(&task.name, version);

        match &manifest.dist.tarball {
            Some(url) => {
                if self.claim_download(&key).await {
                    self.enqueue_download(DownloadTask {
                        name: task.name.clone(),
                        tarball_url: url.clone(),
                        install_path: self.install_root.join(&task.name),
                    })
                    .await;
                }
            }
            None => {
                warn!(key = %key, "Version metadata has no tarball URL, skipping download");
            }
        }

        Ok(())
    }

    async fn record_parent_edge(&self, parent_key: Option<&str>, child_key: &str) {
        if let Some(parent) = parent_key {
            self.graph.write().await.add_edge(parent, child_key);
        }
    }

    /// Resolve a non-exact request: the `latest` tag fast path, or range
    /// selection against already-chosen versions and, failing that, the full
    /// package document.
    async fn resolve_requested(
        &self,
        name: &str,
        requested: &str,
    ) -> Result<VersionManifest, Error> {
        if requested == LATEST_TAG {
            return self.version_manifest(name, LATEST_TAG).await;
        }

        let req = match semver_range::parse(requested) {
            Ok(req) => req,
            Err(err) => {
                warn!(name = %name, range = %requested, error = %err, "Unable to parse range");
                return Err(Error::RangeUnsatisfied {
                    name: name.to_string(),
                    range: requested.to_string(),
                });
            }
        };

        // Reuse an already-selected version when the range admits one.
        let reusable = self
            .resolved
            .read()
            .await
            .first_satisfying(name, &req)
            .cloned();
        if let Some(version) = reusable {
            debug!(name = %name, version = %version, range = %requested, "Reusing resolved version");
            return self.version_manifest(name, &version.to_string()).await;
        }

        let packument = self.packument(name).await?;

        let mut best: Option<(Version, &String)> = None;
        for raw in packument.versions.keys() {
            let version = match Version::parse(raw) {
                Ok(v) => v,
                Err(err) => {
                    warn!(name = %name, version = %raw, error = %err, "Skipping unparsable published version");
                    continue;
                }
            };
            if !req.matches(&version) {
                continue;
            }
            match &best {
                Some((current, _)) if *current >= version => {}
                _ => best = Some((version, raw)),
            }
        }

        let Some((version, raw)) = best else {
            return Err(Error::RangeUnsatisfied {
                name: name.to_string(),
                range: requested.to_string(),
            });
        };

        debug!(name = %name, version = %version, range = %requested, "Selected version");
        Ok(packument.versions[raw].clone())
    }

    /// Fetch a version document through the `name@version` cache.
    async fn version_manifest(
        &self,
        name: &str,
        version_or_tag: &str,
    ) -> Result<VersionManifest, Error> {
        let key = format!("{name}@{version_or_tag}");

        if let Some(hit) = self.manifest_cache.read().await.get(&key) {
            return Ok(hit.clone());
        }

        let fetched = self.registry.fetch_version(name, version_or_tag).await?;

        let mut cache = self.manifest_cache.write().await;
        // Recheck under the write lock; first writer wins.
        Ok(cache.entry(key).or_insert(fetched).clone())
    }

    /// Fetch the full package document through the per-name cache.
    async fn packument(&self, name: &str) -> Result<Arc<Packument>, Error> {
        if let Some(hit) = self.packument_cache.read().await.get(name) {
            return Ok(Arc::clone(hit));
        }

        let fetched = Arc::new(self.registry.fetch_packument(name).await?);

        let mut cache = self.packument_cache.write().await;
        Ok(Arc::clone(
            cache.entry(name.to_string()).or_insert(fetched),
        ))
    }

    /// Check-and-insert into the download dedup set. True when this caller
    /// should schedule the download.
    async fn claim_download(&self, key: &str) -> bool {
        self.download_cache.write().await.insert(key.to_string())
    }

    fn has_fatal(&self) -> bool {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn record_fatal(&self, err: Error) {
        let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        if fatal.is_none() {
            *fatal = Some(err);
        } else {
            warn!(error = %err, "Further resolve error after fatal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_counter_balances() {
        let counter = TaskCounter::default();
        counter.add();
        counter.add();
        counter.done();
        assert_eq!(counter.count(), 1);
        counter.done();
        assert_eq!(counter.count(), 0);
    }

    #[tokio::test]
    async fn test_task_counter_wait_resolves_on_drain() {
        let counter = Arc::new(TaskCounter::default());
        counter.add();

        let waiter = {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move { counter.wait().await })
        };

        counter.done();
        waiter.await.unwrap();
        assert_eq!(counter.count(), 0);
    }

    #[tokio::test]
    async fn test_task_counter_wait_returns_immediately_when_idle() {
        let counter = TaskCounter::default();
        counter.wait().await;
    }

    #[tokio::test]
    async fn test_claim_download_dedups() {
        let registry = RegistryClient::new(crate::DEFAULT_REGISTRY).unwrap();
        let installer = Installer::new(registry, "node_modules");

        assert!(installer.claim_download("a@1.0.0").await);
        assert!(!installer.claim_download("a@1.0.0").await);
        assert!(installer.claim_download("a@2.0.0").await);
        assert_eq!(installer.downloaded_keys().await.len(), 2);
    }
}
