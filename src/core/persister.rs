use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::ports::notify::NotifyError;
use super::store::TableStore;
use super::table::{ChangedTables, TableChanges};

/// Receives content reloaded from disk.
pub type ReloadListener = Arc<dyn Fn(TableChanges) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("[{label}] failed to set up file change listener: {source}")]
    ListenerSetup {
        label: String,
        #[source]
        source: NotifyError,
    },
}

/// The load / save / listen triple behind a [`Persister`].
pub trait PersisterAdapter: Send + Sync + 'static {
    fn label(&self) -> &str;

    /// Reads the backing files. `None` means there is nothing to apply.
    fn load(&self) -> BoxFuture<'_, Option<TableChanges>>;

    /// Writes the store back to disk. With `changed`, adapters skip work for
    /// tables that are not in the set. Failures are logged, never returned.
    fn save<'a>(
        &'a self,
        store: &'a TableStore,
        changed: Option<&'a ChangedTables>,
    ) -> BoxFuture<'a, ()>;

    fn add_listener(
        self: Arc<Self>,
        listener: ReloadListener,
    ) -> BoxFuture<'static, Result<ListenerHandle, PersistError>>;
}

/// Owns the two optional resources a listener may hold: the task consuming
/// the notification channel and the polling task.
pub struct ListenerHandle {
    unlisten: Option<JoinHandle<()>>,
    interval: Option<JoinHandle<()>>,
    closed: Arc<AtomicBool>,
}

impl Default for ListenerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("unlisten", &self.unlisten.is_some())
            .field("interval", &self.interval.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ListenerHandle {
    pub fn new() -> Self {
        Self {
            unlisten: None,
            interval: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_unlisten(&mut self, task: JoinHandle<()>) {
        if let Some(previous) = self.unlisten.replace(task) {
            previous.abort();
        }
    }

    pub fn set_interval(&mut self, task: JoinHandle<()>) {
        if let Some(previous) = self.interval.replace(task) {
            previous.abort();
        }
    }

    /// Shared with listener tasks; set once the handle is disposed so a
    /// reload that was already in flight drops its result.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    pub fn has_unlisten(&self) -> bool {
        self.unlisten.is_some()
    }

    pub fn has_interval(&self) -> bool {
        self.interval.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops whichever resources are held. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.unlisten.take() {
            task.abort();
        }
        if let Some(task) = self.interval.take() {
            task.abort();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersisterState {
    Uninitialized,
    Loaded,
    Listening,
    Idle,
}

impl PersisterState {
    pub fn as_str(self) -> &'static str {
        match self {
            PersisterState::Uninitialized => "uninitialized",
            PersisterState::Loaded => "loaded",
            PersisterState::Listening => "listening",
            PersisterState::Idle => "idle",
        }
    }
}

/// Binds a [`PersisterAdapter`] to a [`TableStore`] and drives its lifecycle.
pub struct Persister<A: PersisterAdapter> {
    adapter: Arc<A>,
    store: Arc<TableStore>,
    state: Mutex<PersisterState>,
    listener: Mutex<Option<ListenerHandle>>,
    auto_save: Mutex<Option<JoinHandle<()>>>,
}

impl<A: PersisterAdapter> Persister<A> {
    pub fn new(store: Arc<TableStore>, adapter: A) -> Self {
        Self {
            adapter: Arc::new(adapter),
            store,
            state: Mutex::new(PersisterState::Uninitialized),
            listener: Mutex::new(None),
            auto_save: Mutex::new(None),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn store(&self) -> &Arc<TableStore> {
        &self.store
    }

    pub fn state(&self) -> PersisterState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PersisterState) {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        log::debug!(
            "[{}] {} -> {}",
            self.adapter.label(),
            guard.as_str(),
            state.as_str()
        );
        *guard = state;
    }

    /// Loads the backing files into the store. Returns whether anything was
    /// applied.
    pub async fn load(&self) -> bool {
        let applied = match self.adapter.load().await {
            Some(changes) => {
                self.store.apply_persisted(changes);
                true
            }
            None => false,
        };
        if self.state() == PersisterState::Uninitialized {
            self.set_state(PersisterState::Loaded);
        }
        applied
    }

    /// Writes the whole store through the adapter.
    pub async fn save(&self) {
        self.adapter.save(&self.store, None).await;
    }

    /// Loads, then sets up the listener. The persister is ready once this
    /// resolves; a listener setup failure is returned instead of logged.
    pub async fn start_auto_load(&self) -> Result<(), PersistError> {
        self.load().await;
        self.stop_listener();

        let store = Arc::clone(&self.store);
        let listener: ReloadListener = Arc::new(move |changes| store.apply_persisted(changes));
        let handle = Arc::clone(&self.adapter).add_listener(listener).await?;

        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        self.set_state(PersisterState::Listening);
        Ok(())
    }

    /// Saves whenever the store publishes a local change.
    pub async fn start_auto_save(&self) {
        self.stop_auto_save();

        let adapter = Arc::clone(&self.adapter);
        let store = Arc::clone(&self.store);
        let mut changes = store.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(changed) => adapter.save(&store, Some(&changed)).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!(
                            "[{}] missed {} change notifications, saving everything",
                            adapter.label(),
                            missed
                        );
                        adapter.save(&store, None).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        *self.auto_save.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    pub async fn start_auto_persisting(&self) -> Result<(), PersistError> {
        self.start_auto_load().await?;
        self.start_auto_save().await;
        Ok(())
    }

    fn stop_listener(&self) {
        if let Some(mut handle) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.dispose();
        }
    }

    fn stop_auto_save(&self) {
        if let Some(task) = self
            .auto_save
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    /// Tears down the listener and auto-save. Reads or writes already in
    /// flight are not cancelled, but reload results are discarded.
    pub fn stop(&self) {
        self.stop_listener();
        self.stop_auto_save();
        if self.state() != PersisterState::Uninitialized {
            self.set_state(PersisterState::Idle);
        }
    }
}

impl<A: PersisterAdapter> Drop for Persister<A> {
    fn drop(&mut self) {
        self.stop_listener();
        self.stop_auto_save();
    }
}
