//! Live-Update Broker – routes updates between editor clients, the file
//! watcher and the running scene.
//!
//! ## Inputs
//!
//! | Input               | Effect                                                     |
//! |---------------------|------------------------------------------------------------|
//! | `EditorMessage`     | relay to scene + other clients, debounce a write if durable |
//! | `FileChanged`       | re-read, diff against cache, emit non-empty deltas          |
//! | `LocalEdit`         | broadcast to clients, debounce a write if durable           |
//! | `ClientConnected`   | add to the broadcast set                                    |
//! | `ClientDisconnected`| remove from the broadcast set                               |
//!
//! ## Echo suppression
//!
//! The cache holds what the broker last observed on disk. A broker write
//! updates the cache *before* the file is written, so the watcher event it
//! triggers diffs to nothing and emits nothing.

use crate::diff::{self, DiffKind};
use crate::error::{PersistenceError, TransportError};
use crate::protocol::{LiveUpdate, UpdateAction};
use crate::store::SceneStore;
use crate::types::{BrokerConfig, BrokerStats};
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

pub type ClientId = u64;

/// One framed message for a client (JSON, no trailing newline).
pub type ClientSender = UnboundedSender<Bytes>;

#[derive(Debug)]
pub enum BrokerInput {
    EditorMessage { client: ClientId, text: String },
    FileChanged(PathBuf),
    LocalEdit(LiveUpdate),
    ClientConnected { client: ClientId, sender: ClientSender },
    ClientDisconnected(ClientId),
}

struct CachedFile {
    digest: md5::Digest,
    document: Value,
}

struct PendingWrite {
    generation: u64,
    update: LiveUpdate,
    handle: JoinHandle<()>,
}

type DebounceKey = (String, String);

struct BrokerInner {
    config: BrokerConfig,
    root: PathBuf,
    store: Arc<dyn SceneStore>,
    cache: Mutex<HashMap<PathBuf, CachedFile>>,
    scenes: Mutex<HashMap<PathBuf, String>>,
    clients: Mutex<HashMap<ClientId, ClientSender>>,
    scene_tx: UnboundedSender<LiveUpdate>,
    pending: Mutex<HashMap<DebounceKey, PendingWrite>>,
    generation: AtomicU64,
    write_lock: tokio::sync::Mutex<()>,
    stats: Mutex<BrokerStats>,
}

/// Cheap to clone; every clone drives the same broker.
#[derive(Clone)]
pub struct LiveUpdateBroker {
    inner: Arc<BrokerInner>,
}

impl LiveUpdateBroker {
    /// Build a broker rooted at `root`. The receiver yields every update
    /// bound for the running scene.
    pub fn new(
        config: BrokerConfig,
        root: impl Into<PathBuf>,
        store: Arc<dyn SceneStore>,
    ) -> (Self, UnboundedReceiver<LiveUpdate>) {
        let (scene_tx, scene_rx) = mpsc::unbounded_channel();
        let inner = BrokerInner {
            config,
            root: root.into(),
            store,
            cache: Mutex::new(HashMap::new()),
            scenes: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            scene_tx,
            pending: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            write_lock: tokio::sync::Mutex::new(()),
            stats: Mutex::new(BrokerStats::default()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            scene_rx,
        )
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> BrokerStats {
        self.inner.stats.lock().clone()
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    pub fn pending_writes(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Drive the broker until every input sender is dropped.
    pub async fn run(self, mut inbound: UnboundedReceiver<BrokerInput>) {
        info!("Live-update broker running (root={})", self.inner.root.display());
        while let Some(input) = inbound.recv().await {
            self.handle(input).await;
        }
        self.flush().await;
        info!("Live-update broker stopped");
    }

    pub async fn handle(&self, input: BrokerInput) {
        match input {
            BrokerInput::EditorMessage { client, text } => {
                self.handle_editor_message(client, &text)
            }
            BrokerInput::FileChanged(path) => {
                self.handle_file_change(&path).await;
            }
            BrokerInput::LocalEdit(update) => self.handle_local_edit(update),
            BrokerInput::ClientConnected { client, sender } => self.add_client(client, sender),
            BrokerInput::ClientDisconnected(client) => self.remove_client(client),
        }
    }

    // -----------------------------------------------------------------------
    // Paths
    // -----------------------------------------------------------------------

    /// `levels/one.ts` → `<root>/levels/one.editor.json`. Remembers the
    /// mapping so file events can be attributed to their scene.
    pub fn override_path_for(&self, scene_path: &str) -> PathBuf {
        let mut path = self
            .inner
            .root
            .join(scene_path)
            .with_extension("")
            .into_os_string();
        path.push(&self.inner.config.override_suffix);
        let path = PathBuf::from(path);
        self.inner
            .scenes
            .lock()
            .insert(path.clone(), scene_path.to_string());
        path
    }

    /// Register a scene so its override file is attributed correctly.
    pub fn register_scene(&self, scene_path: &str) -> PathBuf {
        self.override_path_for(scene_path)
    }

    pub fn is_override_file(&self, path: &Path) -> bool {
        path.to_str()
            .is_some_and(|p| p.ends_with(&self.inner.config.override_suffix))
    }

    fn scene_path_for(&self, override_path: &Path) -> String {
        if let Some(scene) = self.inner.scenes.lock().get(override_path) {
            return scene.clone();
        }
        let relative = override_path
            .strip_prefix(&self.inner.root)
            .unwrap_or(override_path)
            .to_string_lossy()
            .into_owned();
        relative
            .strip_suffix(&self.inner.config.override_suffix)
            .map(str::to_string)
            .unwrap_or(relative)
    }

    // -----------------------------------------------------------------------
    // Clients
    // -----------------------------------------------------------------------

    pub fn add_client(&self, client: ClientId, sender: ClientSender) {
        self.inner.clients.lock().insert(client, sender);
        debug!("Editor client {} connected", client);
    }

    pub fn remove_client(&self, client: ClientId) {
        if self.inner.clients.lock().remove(&client).is_some() {
            debug!("Editor client {} disconnected", client);
        }
    }

    /// Send to every client; closed channels are pruned. Returns the number
    /// of successful sends.
    pub fn broadcast(&self, update: &LiveUpdate) -> usize {
        self.broadcast_except(update, None)
    }

    fn broadcast_except(&self, update: &LiveUpdate, skip: Option<ClientId>) -> usize {
        let frame = match update.to_json() {
            Ok(text) => Bytes::from(text),
            Err(e) => {
                warn!("{}", TransportError::Encode(e));
                return 0;
            }
        };
        let mut clients = self.inner.clients.lock();
        let mut stale = Vec::new();
        let mut sent = 0;
        for (id, sender) in clients.iter() {
            if Some(*id) == skip {
                continue;
            }
            match sender.send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(_) => stale.push(*id),
            }
        }
        for id in stale {
            warn!("{}; pruning", TransportError::Closed(id));
            clients.remove(&id);
        }
        drop(clients);
        self.inner.stats.lock().broadcast += sent as u64;
        sent
    }

    fn relay_to_scene(&self, update: LiveUpdate) {
        if self.inner.scene_tx.send(update).is_err() {
            debug!("No running scene attached; update not relayed");
            return;
        }
        self.inner.stats.lock().relayed += 1;
    }

    // -----------------------------------------------------------------------
    // Editor & local edits
    // -----------------------------------------------------------------------

    pub fn handle_editor_message(&self, client: ClientId, text: &str) {
        let update = match LiveUpdate::from_json(text) {
            Ok(update) => update,
            Err(e) => {
                debug!("Ignoring unreadable message from client {}: {}", client, e);
                self.inner.stats.lock().dropped += 1;
                return;
            }
        };
        if update.action() != Some(UpdateAction::Property) {
            self.inner.stats.lock().dropped += 1;
            return;
        }
        self.relay_to_scene(update.clone());
        self.broadcast_except(&update, Some(client));
        if update.is_persistable() {
            self.schedule_write(update);
        }
    }

    /// An edit made inside the running scene or editor UI.
    pub fn handle_local_edit(&self, update: LiveUpdate) {
        if update.action() != Some(UpdateAction::Property) {
            self.inner.stats.lock().dropped += 1;
            return;
        }
        self.broadcast(&update);
        if update.is_persistable() {
            self.schedule_write(update);
        }
    }

    // -----------------------------------------------------------------------
    // Debounced persistence
    // -----------------------------------------------------------------------

    /// Restart the timer for `(scenePath, property)`; the last update wins.
    fn schedule_write(&self, update: LiveUpdate) {
        let (Some(scene_path), Some(property)) = (&update.scene_path, &update.property) else {
            return;
        };
        let key = (scene_path.clone(), property.clone());
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let delay = Duration::from_millis(self.inner.config.debounce_ms);

        let broker = self.clone();
        let task_key = key.clone();
        let task_update = update.clone();
        // Held across the spawn so the timer cannot fire before it is registered.
        let mut pending = self.inner.pending.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _guard = broker.inner.write_lock.lock().await;
            {
                // Once fired the write can no longer be cancelled by newer edits.
                let mut pending = broker.inner.pending.lock();
                if pending.get(&task_key).map(|p| p.generation) != Some(generation) {
                    return;
                }
                pending.remove(&task_key);
            }
            broker.persist_locked(&task_update).await;
        });

        let previous = pending.insert(
            key,
            PendingWrite {
                generation,
                update,
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    /// Write every pending update now instead of waiting for its timer.
    pub async fn flush(&self) {
        let pending: Vec<PendingWrite> = self.inner.pending.lock().drain().map(|(_, p)| p).collect();
        for p in pending {
            p.handle.abort();
            self.persist(&p.update).await;
        }
        // A fired timer holds the write lock until its write lands.
        drop(self.inner.write_lock.lock().await);
    }

    /// Merge one property into its override file. Failures are logged and
    /// the cycle is abandoned.
    pub async fn persist(&self, update: &LiveUpdate) -> bool {
        let _guard = self.inner.write_lock.lock().await;
        self.persist_locked(update).await
    }

    async fn persist_locked(&self, update: &LiveUpdate) -> bool {
        let (Some(scene_path), Some(property)) = (&update.scene_path, &update.property) else {
            return false;
        };
        let path = self.override_path_for(scene_path);

        match self.try_persist(&path, property, &update.value).await {
            Ok(()) => {
                debug!("Persisted '{}' to {}", property, path.display());
                self.inner.stats.lock().persisted += 1;
                true
            }
            Err(e) => {
                warn!("Dropping write of '{}': {}", property, e);
                self.inner.stats.lock().dropped += 1;
                false
            }
        }
    }

    async fn try_persist(
        &self,
        path: &Path,
        property: &str,
        value: &Value,
    ) -> Result<(), PersistenceError> {
        let label = path.display().to_string();
        let cached = self
            .inner
            .cache
            .lock()
            .get(path)
            .map(|c| c.document.clone());
        let mut document = match cached {
            Some(doc) => doc,
            None => match self.inner.store.read(path).await {
                Ok(text) => serde_json::from_str(&text).map_err(|source| {
                    PersistenceError::Parse {
                        path: label.clone(),
                        source,
                    }
                })?,
                Err(e) if e.kind() == io::ErrorKind::NotFound => Value::Object(Map::new()),
                Err(source) => {
                    return Err(PersistenceError::Io {
                        path: label,
                        source,
                    })
                }
            },
        };

        diff::set_dotted(&mut document, property, value.clone());
        let document = canonical(&document);
        let text = if self.inner.config.pretty_json {
            serde_json::to_string_pretty(&document)
        } else {
            serde_json::to_string(&document)
        }
        .map_err(|source| PersistenceError::Serialize {
            path: label.clone(),
            source,
        })?;

        let previous = self.inner.cache.lock().insert(
            path.to_path_buf(),
            CachedFile {
                digest: md5::compute(text.as_bytes()),
                document,
            },
        );

        if let Err(source) = self.inner.store.write(path, text).await {
            let mut cache = self.inner.cache.lock();
            match previous {
                Some(prev) => {
                    cache.insert(path.to_path_buf(), prev);
                }
                None => {
                    cache.remove(path);
                }
            }
            return Err(PersistenceError::Io {
                path: label,
                source,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // File changes
    // -----------------------------------------------------------------------

    /// Record current disk content as the baseline without emitting.
    pub async fn prime(&self, path: &Path) -> Result<(), PersistenceError> {
        let document = self.read_document(path).await?;
        self.inner.cache.lock().insert(path.to_path_buf(), document);
        Ok(())
    }

    async fn read_document(&self, path: &Path) -> Result<CachedFile, PersistenceError> {
        let label = path.display().to_string();
        let text = self
            .inner
            .store
            .read(path)
            .await
            .map_err(|source| PersistenceError::Io {
                path: label.clone(),
                source,
            })?;
        let digest = md5::compute(text.as_bytes());
        let document = serde_json::from_str(&text)
            .map_err(|source| PersistenceError::Parse { path: label, source })?;
        Ok(CachedFile { digest, document })
    }

    pub fn cached_document(&self, path: &Path) -> Option<Value> {
        self.inner
            .cache
            .lock()
            .get(path)
            .map(|c| c.document.clone())
    }

    /// Re-read a changed override file and emit whatever actually changed.
    /// Returns the number of updates emitted.
    pub async fn handle_file_change(&self, path: &Path) -> usize {
        if !self.is_override_file(path) {
            return 0;
        }
        let label = path.display().to_string();
        let text = match self.inner.store.read(path).await {
            Ok(text) => text,
            Err(source) => {
                warn!("{}", PersistenceError::Io { path: label, source });
                self.inner.stats.lock().dropped += 1;
                return 0;
            }
        };

        let digest = md5::compute(text.as_bytes());
        let baseline = {
            let cache = self.inner.cache.lock();
            match cache.get(path) {
                Some(c) if c.digest == digest => return 0,
                Some(c) => c.document.clone(),
                None => Value::Object(Map::new()),
            }
        };

        let document: Value = match serde_json::from_str(&text) {
            Ok(doc) => doc,
            Err(source) => {
                warn!("{}", PersistenceError::Parse { path: label, source });
                self.inner.stats.lock().dropped += 1;
                return 0;
            }
        };

        let entries = diff::diff(&baseline, &document);
        self.inner.cache.lock().insert(
            path.to_path_buf(),
            CachedFile {
                digest,
                document: document.clone(),
            },
        );
        if entries.is_empty() {
            return 0;
        }

        let scene_path = self.scene_path_for(path);
        let classified = diff::classify(entries);
        debug!(
            "{} changed: {} property, {} structural",
            label,
            classified.properties.len(),
            classified.structural.len()
        );

        // A reload re-applies the whole document, flat properties included.
        if !classified.structural.is_empty() {
            let update = LiveUpdate::scene_reload(scene_path, document);
            self.relay_to_scene(update.clone());
            self.broadcast(&update);
            return 1;
        }

        let mut emitted = 0;
        for entry in classified.properties {
            let value = match entry.kind {
                DiffKind::Remove => Value::Null,
                DiffKind::Create | DiffKind::Change => entry.value.clone(),
            };
            let update =
                LiveUpdate::property_update(scene_path.clone(), entry.dotted(), value, false);
            self.relay_to_scene(update.clone());
            self.broadcast(&update);
            emitted += 1;
        }
        emitted
    }
}

/// Rebuild a document with every object's keys in sorted order.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            Value::Object(
                keys.into_iter()
                    .map(|k| (k.clone(), canonical(&map[k])))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}
