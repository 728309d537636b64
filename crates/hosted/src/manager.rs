//! Hosted document storage manager.
//!
//! Keeps a population of SQLite documents synchronized between this
//! worker's local filesystem and a versioned external object store. The
//! live file is edited in place by the document engine; this manager owns
//! everything around it: materializing the file on open, debouncing and
//! pushing consistent snapshots after edits, coordinating ownership
//! through the worker directory, and cleaning up on close and delete.
//!
//! Layout under `docs_root`, per document:
//!
//! ```text
//! <docId>.grist                  live SQLite file
//! <docId>.grist-hash             last confirmed content digest (hex)
//! <docId>.grist-backup-<uuid>    transient snapshot during upload
//! <docId>.grist-<uuid>           transient copy (download, replace)
//! <docId>.grist-replacing        holder for the old file during replace
//! ```
//!
//! Transient sidecars are safe to delete on recovery; a leftover
//! `-replacing` file signals a crashed replace and is removed the next
//! time the document is prepared.

use crate::directory::{DirectoryHashRegister, WorkerDirectory};
use crate::error::{DocError, DocResult};
use crate::pruner::{KeepRecent, SnapshotPruner};
use crate::scheduler::{KeyedOps, KeyedOpsOptions};
use crate::snapshot::backup_sqlite_database;
use crate::updates::{DocUpdateQueue, DocUpdateSink};
use granary_core::{
    validate_doc_id, Checksum, DocIdParts, HostedOptions, DELETED_SENTINEL, NEW_DOCUMENT_CODE,
};
use granary_storage::{
    ChecksummedOptions, ChecksummedStorage, ExternalStorage, FileHashRegister,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::fs;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// Extension of the live document file.
const DOC_SUFFIX: &str = ".grist";

/// Debounce window for home-database update pushes.
const DOC_UPDATE_FLUSH_DELAY: Duration = Duration::from_secs(5);

/// Pruning runs at most this fraction of the push rate.
const PRUNE_DELAY_FACTOR: u32 = 4;

/// The caller's identity, as far as this manager cares.
#[derive(Clone, Debug, Default)]
pub struct DocSession {
    pub user_id: Option<i64>,
}

impl DocSession {
    pub fn for_user(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Options for [`HostedStorageManager::replace`].
#[derive(Clone, Debug, Default)]
pub struct ReplaceOptions {
    /// Document to take content from; the target itself when unset.
    pub source_doc_id: Option<String>,
    /// Specific historical version of the source to install.
    pub snapshot_id: Option<String>,
}

/// One snapshot of a document, as listed by [`HostedStorageManager::get_snapshots`].
#[derive(Clone, Debug)]
pub struct DocSnapshot {
    pub snapshot_id: String,
    pub last_modified: Option<time::OffsetDateTime>,
    /// Composite doc id addressing this snapshot directly.
    pub doc_id: String,
}

/// Construction parameters.
#[derive(Clone, Debug)]
pub struct HostedStorageConfig {
    pub docs_root: PathBuf,
    pub worker_id: String,
    pub options: HostedOptions,
}

/// Presence of a document's local state. An absent entry means this worker
/// holds no local state for the doc.
#[derive(Clone)]
enum Presence {
    /// Materialization in flight; the channel flips to `true` on completion.
    Pending(watch::Receiver<bool>),
    /// Materialized; caches whether the doc had to be created.
    Ready(bool),
}

pub struct HostedStorageManager {
    docs_root: PathBuf,
    worker_id: String,
    options: HostedOptions,
    directory: Arc<dyn WorkerDirectory>,
    remote: Option<Arc<ChecksummedStorage>>,
    uploads: KeyedOps,
    pruner: Option<SnapshotPruner>,
    updates: Option<DocUpdateQueue>,
    local_files: Mutex<HashMap<String, Presence>>,
    prepare_files: Mutex<HashSet<String>>,
    doc_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    doc_users: Mutex<HashMap<String, i64>>,
    closed: AtomicBool,
}

impl HostedStorageManager {
    /// Build a manager. `external` is the raw object store; `None` (or
    /// `GRIST_DISABLE_S3=true`, read once here) runs local-only.
    /// `update_sink` receives "last edited" records; `None` disables them.
    pub fn new(
        config: HostedStorageConfig,
        directory: Arc<dyn WorkerDirectory>,
        external: Option<Arc<dyn ExternalStorage>>,
        update_sink: Option<Arc<dyn DocUpdateSink>>,
    ) -> DocResult<Arc<Self>> {
        std::fs::create_dir_all(&config.docs_root)?;

        let disable_remote = granary_core::config::remote_disabled_from_env();
        let remote = match external {
            Some(ext) if !disable_remote => {
                let shared = Arc::new(DirectoryHashRegister::new(directory.clone()));
                let root = config.docs_root.clone();
                let local =
                    Arc::new(FileHashRegister::new(move |key| root.join(format!("{key}-hash"))));
                Some(Arc::new(ChecksummedStorage::new(
                    ext,
                    shared,
                    local,
                    ChecksummedOptions {
                        initial_delay: config.options.first_retry_delay(),
                        ..Default::default()
                    },
                )))
            }
            _ => None,
        };

        let pruner = remote.clone().map(|store| {
            SnapshotPruner::new(
                store as Arc<dyn ExternalStorage>,
                Arc::new(KeepRecent::default()),
                config.options.delay_before_push() * PRUNE_DELAY_FACTOR,
            )
        });
        let updates = update_sink.map(|sink| DocUpdateQueue::new(sink, DOC_UPDATE_FLUSH_DELAY));

        let scheduler_options = KeyedOpsOptions {
            delay_before_operation: config.options.delay_before_push(),
            initial_retry_delay: config.options.first_retry_delay(),
            ..Default::default()
        };

        Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
            let push_target = weak.clone();
            let uploads = KeyedOps::new(
                scheduler_options,
                Box::new(move |doc_id| {
                    let push_target = push_target.clone();
                    Box::pin(async move {
                        match push_target.upgrade() {
                            Some(manager) => manager.push_doc(&doc_id).await.map_err(|e| {
                                Box::new(e) as Box<dyn std::error::Error + Send + Sync>
                            }),
                            None => Ok(()),
                        }
                    })
                }),
            );

            Self {
                docs_root: config.docs_root,
                worker_id: config.worker_id,
                options: config.options,
                directory,
                remote,
                uploads,
                pruner,
                updates,
                local_files: Mutex::new(HashMap::new()),
                prepare_files: Mutex::new(HashSet::new()),
                doc_locks: Mutex::new(HashMap::new()),
                doc_users: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }
        }))
    }

    /// Local path of the live file. Pure computation: strips any path
    /// traversal by basename, then validates the id shape. No I/O.
    pub fn get_path(&self, doc_id: &str) -> DocResult<PathBuf> {
        let name = doc_id.rsplit(['/', '\\']).next().unwrap_or(doc_id);
        validate_doc_id(name)?;
        Ok(self.docs_root.join(format!("{name}{DOC_SUFFIX}")))
    }

    fn hash_path(&self, doc_id: &str) -> PathBuf {
        self.docs_root.join(format!("{doc_id}{DOC_SUFFIX}-hash"))
    }

    fn replacing_path(&self, doc_id: &str) -> PathBuf {
        self.docs_root
            .join(format!("{doc_id}{DOC_SUFFIX}-replacing"))
    }

    /// Unique backup sidecar; concurrent backups of one doc never collide.
    fn backup_sidecar_path(&self, doc_id: &str) -> PathBuf {
        self.docs_root.join(format!(
            "{doc_id}{DOC_SUFFIX}-backup-{}",
            Uuid::new_v4().simple()
        ))
    }

    fn temp_doc_path(&self, doc_id: &str) -> PathBuf {
        self.docs_root
            .join(format!("{doc_id}{DOC_SUFFIX}-{}", Uuid::new_v4().simple()))
    }

    /// Remote key for a doc. Snapshots are object versions, so the
    /// snapshot component never appears in the key.
    fn remote_key(parts: &DocIdParts) -> String {
        format!("{}{DOC_SUFFIX}", parts.without_snapshot())
    }

    fn check_open(&self) -> DocResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DocError::AfterClose)
        } else {
            Ok(())
        }
    }

    fn doc_lock(&self, doc_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.doc_locks
            .lock()
            .expect("doc locks poisoned")
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn remove_if_exists(path: &Path) -> DocResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DocError::Io(e)),
        }
    }

    async fn wait_presence(mut rx: watch::Receiver<bool>) -> bool {
        loop {
            if *rx.borrow_and_update() {
                return true;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Ensure the document is available locally. Returns `true` iff the
    /// document had to be created (absent remotely, caller may create it).
    ///
    /// Single-flight per doc: a concurrent second call is a programming
    /// error and fails with `ConcurrentPrepare`. Orders after any
    /// `close_document` in flight for the same doc.
    pub async fn prepare_local_doc(&self, doc_id: &str, session: &DocSession) -> DocResult<bool> {
        self.check_open()?;
        let parts = DocIdParts::parse(doc_id)?;

        {
            let mut preparing = self.prepare_files.lock().expect("prepare set poisoned");
            if !preparing.insert(doc_id.to_string()) {
                return Err(DocError::ConcurrentPrepare(doc_id.to_string()));
            }
        }
        let result = self.prepare_inner(doc_id, &parts, session).await;
        self.prepare_files
            .lock()
            .expect("prepare set poisoned")
            .remove(doc_id);
        result
    }

    async fn prepare_inner(
        &self,
        doc_id: &str,
        parts: &DocIdParts,
        session: &DocSession,
    ) -> DocResult<bool> {
        let lock = self.doc_lock(doc_id);
        let _guard = lock.lock().await;

        // Presence cache: an entry means this worker already holds (or is
        // fetching) local state for the doc.
        loop {
            let existing = self
                .local_files
                .lock()
                .expect("local files poisoned")
                .get(doc_id)
                .cloned();
            match existing {
                Some(Presence::Ready(is_new)) => return Ok(is_new),
                Some(Presence::Pending(rx)) => {
                    if !Self::wait_presence(rx).await {
                        // Abandoned by a cancelled prepare; discard it.
                        self.local_files
                            .lock()
                            .expect("local files poisoned")
                            .remove(doc_id);
                    }
                }
                None => break,
            }
        }

        let (tx, rx) = watch::channel(false);
        self.local_files
            .lock()
            .expect("local files poisoned")
            .insert(doc_id.to_string(), Presence::Pending(rx));

        let result = self.ensure_local(doc_id, parts, session).await;

        {
            let mut map = self.local_files.lock().expect("local files poisoned");
            match &result {
                Ok(is_new) => {
                    map.insert(doc_id.to_string(), Presence::Ready(*is_new));
                }
                Err(_) => {
                    map.remove(doc_id);
                }
            }
        }
        let _ = tx.send(true);
        result
    }

    async fn ensure_local(
        &self,
        doc_id: &str,
        parts: &DocIdParts,
        session: &DocSession,
    ) -> DocResult<bool> {
        let path = self.get_path(doc_id)?;

        // A leftover replace holder means a crashed replace; the live file
        // is authoritative.
        Self::remove_if_exists(&self.replacing_path(doc_id)).await?;

        let status = self
            .directory
            .get_doc_worker_or_assign(doc_id, &self.worker_id)
            .await?;
        let owned = status.is_active
            && status
                .doc_worker
                .as_ref()
                .map(|worker| worker.id == self.worker_id)
                .unwrap_or(false);
        if !owned {
            return Err(DocError::NotOwner {
                doc_id: doc_id.to_string(),
                worker_id: self.worker_id.clone(),
            });
        }

        let can_create_fork = match parts.fork_user_id {
            None => true,
            Some(user) => session.user_id == Some(user),
        };
        // Edit attribution follows the latest preparing session; an
        // anonymous open clears any previous user's claim.
        match session.user_id {
            Some(user) => {
                self.doc_users
                    .lock()
                    .expect("doc users poisoned")
                    .insert(doc_id.to_string(), user);
            }
            None => {
                self.doc_users
                    .lock()
                    .expect("doc users poisoned")
                    .remove(doc_id);
            }
        }

        let Some(remote) = self.remote.clone() else {
            return self
                .ensure_local_only(doc_id, parts, &path, can_create_fork)
                .await;
        };

        if fs::try_exists(&path).await? {
            match status.doc_md5.as_deref() {
                // Never uploaded (or tombstoned while we kept working):
                // the local file is the only copy there is.
                None => return Ok(false),
                Some(md5) if md5 == DELETED_SENTINEL => return Ok(false),
                Some(md5) => {
                    let expected = Checksum::from_hex(md5)
                        .map_err(|e| DocError::Directory(e.to_string()))?;
                    match self.read_local_hash(doc_id).await? {
                        Some(recorded) if recorded == md5 => return Ok(false),
                        Some(_) => {
                            // The recorded digest is stale; the content may
                            // still match what the directory expects.
                            if self.local_matches(doc_id, &path, expected).await? {
                                fs::write(self.hash_path(doc_id), md5).await?;
                                return Ok(false);
                            }
                            info!(doc_id, "local file out of date, fetching from remote");
                        }
                        None => {
                            info!(doc_id, "local file has no recorded hash, fetching from remote");
                        }
                    }
                    // Remote is canonical; the local copy goes.
                    Self::remove_if_exists(&path).await?;
                    Self::remove_if_exists(&self.hash_path(doc_id)).await?;
                }
            }
        }

        let key = Self::remote_key(parts);
        if remote.exists(&key).await? {
            remote
                .download(&key, &path, parts.snapshot_id.as_deref())
                .await?;
            return Ok(false);
        }

        if parts.is_fork() {
            if !can_create_fork {
                return Err(DocError::ForkForbidden(doc_id.to_string()));
            }
            if parts.trunk_id == NEW_DOCUMENT_CODE {
                return Ok(true);
            }
            let trunk_key = format!("{}{DOC_SUFFIX}", parts.trunk_id);
            if !remote.exists(&trunk_key).await? {
                return Err(DocError::DocNotFound(doc_id.to_string()));
            }
            remote
                .download(&trunk_key, &path, parts.snapshot_id.as_deref())
                .await?;
            return Ok(true);
        }

        if parts.is_snapshot() {
            return Err(DocError::DocNotFound(doc_id.to_string()));
        }
        Ok(true)
    }

    async fn ensure_local_only(
        &self,
        doc_id: &str,
        parts: &DocIdParts,
        path: &Path,
        can_create_fork: bool,
    ) -> DocResult<bool> {
        if fs::try_exists(path).await? {
            return Ok(false);
        }
        if parts.is_snapshot() {
            return Err(DocError::DocNotFound(doc_id.to_string()));
        }
        if parts.is_fork() {
            if !can_create_fork {
                return Err(DocError::ForkForbidden(doc_id.to_string()));
            }
            if parts.trunk_id != NEW_DOCUMENT_CODE {
                let trunk_path = self.get_path(&parts.trunk_id)?;
                if fs::try_exists(&trunk_path).await? {
                    fs::copy(&trunk_path, path).await?;
                }
            }
            return Ok(true);
        }
        Ok(true)
    }

    async fn read_local_hash(&self, doc_id: &str) -> DocResult<Option<String>> {
        match fs::read_to_string(self.hash_path(doc_id)).await {
            Ok(content) => Ok(Some(content.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DocError::Io(e)),
        }
    }

    /// Snapshot the live file and compare its digest to `expected`. The
    /// sidecar is removed on every exit path.
    async fn local_matches(
        &self,
        doc_id: &str,
        path: &Path,
        expected: Checksum,
    ) -> DocResult<bool> {
        let sidecar = self.backup_sidecar_path(doc_id);
        let result = async {
            backup_sqlite_database(path, &sidecar, None).await?;
            let actual = Checksum::of_file(&sidecar).await?;
            Ok::<bool, DocError>(actual == expected)
        }
        .await;
        let _ = Self::remove_if_exists(&sidecar).await;
        result
    }

    /// One push: snapshot the live file, upload it, tell the pruner.
    /// Invoked by the upload scheduler; serial per doc.
    async fn push_doc(&self, doc_id: &str) -> DocResult<()> {
        if self
            .prepare_files
            .lock()
            .expect("prepare set poisoned")
            .contains(doc_id)
        {
            // Requeued by the scheduler's retry policy.
            return Err(DocError::PushFailed {
                doc_id: doc_id.to_string(),
                message: "local file still being prepared".to_string(),
            });
        }

        let parts = DocIdParts::parse(doc_id)?;
        let Some(remote) = self.remote.clone() else {
            return Ok(());
        };

        let path = self.get_path(doc_id)?;
        let sidecar = self.backup_sidecar_path(doc_id);
        let result: DocResult<()> = async {
            backup_sqlite_database(&path, &sidecar, None).await?;
            let key = Self::remote_key(&parts);
            remote.upload(&key, &sidecar).await?;
            if let Some(pruner) = &self.pruner {
                pruner.request_prune(&key);
            }
            Ok(())
        }
        .await;
        // The sidecar never outlives the push.
        let cleanup = Self::remove_if_exists(&sidecar).await;
        result?;
        cleanup
    }

    /// Idempotently schedule an upload after the debounce window. A no-op
    /// for snapshot-addressed ids; snapshots are immutable views.
    pub fn mark_as_changed(&self, doc_id: &str) -> DocResult<()> {
        self.check_open()?;
        let parts = DocIdParts::parse(doc_id)?;
        if parts.is_snapshot() {
            return Ok(());
        }
        self.uploads.add_operation(doc_id);
        Ok(())
    }

    /// Schedule the user-visible "last edited" metadata update.
    pub fn mark_as_edited(&self, doc_id: &str) -> DocResult<()> {
        self.check_open()?;
        let parts = DocIdParts::parse(doc_id)?;
        if parts.is_snapshot() || !self.options.push_doc_update_times {
            return Ok(());
        }
        if let Some(updates) = &self.updates {
            let edited_by = self
                .doc_users
                .lock()
                .expect("doc users poisoned")
                .get(doc_id)
                .copied();
            updates.schedule_update(doc_id, edited_by);
        }
        Ok(())
    }

    /// True when no push is scheduled or running for the doc.
    pub fn is_saved(&self, doc_id: &str) -> bool {
        !self.uploads.has_pending_operation(doc_id)
    }

    /// Block until no pending upload remains for the doc, expediting a
    /// scheduled one. Re-throws the failure of the attempt it awaited.
    pub async fn flush_doc(&self, doc_id: &str) -> DocResult<()> {
        while self.uploads.has_pending_operation(doc_id) {
            self.uploads
                .expedite_operation_and_wait(doc_id)
                .await
                .map_err(|failure| DocError::PushFailed {
                    doc_id: doc_id.to_string(),
                    message: failure.0,
                })?;
        }
        Ok(())
    }

    /// Await any outstanding materialization, drop the presence entry,
    /// then flush.
    pub async fn close_document(&self, doc_id: &str) -> DocResult<()> {
        validate_doc_id(doc_id)?;
        let lock = self.doc_lock(doc_id);
        let _guard = lock.lock().await;

        let presence = self
            .local_files
            .lock()
            .expect("local files poisoned")
            .remove(doc_id);
        if let Some(Presence::Pending(rx)) = presence {
            Self::wait_presence(rx).await;
        }
        self.flush_doc(doc_id).await
    }

    /// Permanent deletion: close, remove the remote object with all its
    /// versions, remove the local file and its hash sidecar. Idempotent.
    pub async fn delete_doc(&self, doc_id: &str, permanent: bool) -> DocResult<()> {
        self.check_open()?;
        if !permanent {
            return Err(DocError::Unsupported("non-permanent delete"));
        }
        let parts = DocIdParts::parse(doc_id)?;
        if parts.is_snapshot() {
            return Err(DocError::Unsupported("delete a snapshot"));
        }

        self.close_document(doc_id).await?;

        if let Some(remote) = &self.remote {
            remote.remove(&Self::remote_key(&parts), None).await?;
        }
        Self::remove_if_exists(&self.get_path(doc_id)?).await?;
        Self::remove_if_exists(&self.hash_path(doc_id)).await?;
        self.doc_users
            .lock()
            .expect("doc users poisoned")
            .remove(doc_id);
        Ok(())
    }

    /// A fresh, independent snapshot of the doc, suitable for download.
    /// The caller owns (and deletes) the returned file.
    pub async fn get_copy(&self, doc_id: &str) -> DocResult<PathBuf> {
        DocIdParts::parse(doc_id)?;
        let path = self.get_path(doc_id)?;
        if !fs::try_exists(&path).await? {
            return Err(DocError::DocNotFound(doc_id.to_string()));
        }
        let copy = self.temp_doc_path(doc_id);
        backup_sqlite_database(&path, &copy, None).await?;
        Ok(copy)
    }

    /// A named consistent snapshot next to the live file. The caller owns
    /// the returned file; nothing schedules its cleanup.
    pub async fn make_backup(&self, doc_id: &str, tag: &str) -> DocResult<PathBuf> {
        DocIdParts::parse(doc_id)?;
        validate_doc_id(tag)?;
        let path = self.get_path(doc_id)?;
        if !fs::try_exists(&path).await? {
            return Err(DocError::DocNotFound(doc_id.to_string()));
        }
        let dest = self.docs_root.join(format!(
            "{doc_id}-{tag}-{}{DOC_SUFFIX}",
            Uuid::new_v4().simple()
        ));
        backup_sqlite_database(&path, &dest, None).await?;
        Ok(dest)
    }

    /// Atomic swap of the doc's content with another doc's (or one of its
    /// own historical snapshots). On failure the prior local file is
    /// restored. Success invalidates the hash sidecar and marks the doc
    /// changed and edited so the new content gets pushed.
    pub async fn replace(&self, doc_id: &str, options: ReplaceOptions) -> DocResult<()> {
        self.check_open()?;
        let parts = DocIdParts::parse(doc_id)?;
        if parts.is_snapshot() {
            return Err(DocError::Unsupported("replace a snapshot"));
        }

        let source_id = options
            .source_doc_id
            .clone()
            .unwrap_or_else(|| doc_id.to_string());
        // Swapping a doc with its own current content is an identity.
        if source_id == doc_id && options.snapshot_id.is_none() {
            return Ok(());
        }
        let source_parts = DocIdParts::parse(&source_id)?;

        self.flush_doc(doc_id).await?;

        let path = self.get_path(doc_id)?;
        let incoming = self.temp_doc_path(doc_id);
        let fetched: DocResult<()> = async {
            let source_path = self.get_path(&source_id)?;
            let source_is_local =
                source_id != doc_id && fs::try_exists(&source_path).await?;
            if options.snapshot_id.is_none() && source_is_local {
                // The source is live on this worker; copy it consistently.
                backup_sqlite_database(&source_path, &incoming, None).await?;
                return Ok(());
            }
            match &self.remote {
                Some(remote) => {
                    remote
                        .download(
                            &Self::remote_key(&source_parts),
                            &incoming,
                            options.snapshot_id.as_deref(),
                        )
                        .await?;
                    Ok(())
                }
                // Snapshots are object versions; without remote storage
                // there is nothing to address them by.
                None if options.snapshot_id.is_some() => {
                    Err(DocError::Unsupported("snapshots-without-remote"))
                }
                None => Err(DocError::DocNotFound(source_id.clone())),
            }
        }
        .await;
        if let Err(e) = fetched {
            let _ = Self::remove_if_exists(&incoming).await;
            return Err(e);
        }

        let holding = self.replacing_path(doc_id);
        Self::remove_if_exists(&holding).await?;
        let had_original = fs::try_exists(&path).await?;
        if had_original {
            fs::rename(&path, &holding).await?;
        }
        match fs::rename(&incoming, &path).await {
            Ok(()) => {
                Self::remove_if_exists(&holding).await?;
                Self::remove_if_exists(&self.hash_path(doc_id)).await?;
                self.mark_as_changed(doc_id)?;
                self.mark_as_edited(doc_id)?;
                Ok(())
            }
            Err(e) => {
                if had_original {
                    if let Err(restore) = fs::rename(&holding, &path).await {
                        warn!(doc_id, error = %restore, "failed to restore original after replace");
                    }
                }
                let _ = Self::remove_if_exists(&incoming).await;
                Err(DocError::Io(e))
            }
        }
    }

    /// List the doc's snapshots, newest first. Without remote storage the
    /// local file is the only version and lists as `current`.
    pub async fn get_snapshots(&self, doc_id: &str) -> DocResult<Vec<DocSnapshot>> {
        let parts = DocIdParts::parse(doc_id)?;
        match &self.remote {
            Some(remote) => {
                let versions = remote.versions(&Self::remote_key(&parts)).await?;
                Ok(versions
                    .into_iter()
                    .map(|v| DocSnapshot {
                        doc_id: parts.at_snapshot(&v.snapshot_id),
                        snapshot_id: v.snapshot_id,
                        last_modified: v.last_modified,
                    })
                    .collect())
            }
            None => {
                let path = self.get_path(doc_id)?;
                let metadata = fs::metadata(&path)
                    .await
                    .map_err(|_| DocError::DocNotFound(doc_id.to_string()))?;
                Ok(vec![DocSnapshot {
                    doc_id: parts.at_snapshot("current"),
                    snapshot_id: "current".to_string(),
                    last_modified: metadata.modified().ok().map(|t| t.into()),
                }])
            }
        }
    }

    /// Drain uploads, close the update queue and pruner, wait for pending
    /// materializations. Idempotent; starts no new work.
    pub async fn close_storage(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.uploads.expedite_operations();
        self.uploads
            .wait(Some(&|| info!("waiting for uploads to finish")))
            .await;

        if let Some(updates) = &self.updates {
            updates.close().await;
        }
        if let Some(pruner) = &self.pruner {
            pruner.close().await;
        }

        let pending: Vec<watch::Receiver<bool>> = self
            .local_files
            .lock()
            .expect("local files poisoned")
            .values()
            .filter_map(|presence| match presence {
                Presence::Pending(rx) => Some(rx.clone()),
                Presence::Ready(_) => None,
            })
            .collect();
        for rx in pending {
            Self::wait_presence(rx).await;
        }
    }
}
