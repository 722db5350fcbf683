use notify_debouncer_full::notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::core::paths::normalize_path;
use crate::core::ports::notify::{
    FileChangePort, FileChangeStream, FileChanged, NotifyError,
};

pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Fan-out channel for file change notifications. Anything that sees a file
/// change publishes here; json-file and chat persisters subscribe.
#[derive(Clone)]
pub struct FileChangeBus {
    tx: broadcast::Sender<FileChanged>,
}

impl Default for FileChangeBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl FileChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, path: impl Into<String>) -> usize {
        let event = FileChanged { path: path.into() };
        self.tx.send(event).unwrap_or(0)
    }

    pub fn stream(&self) -> FileChangeStream {
        FileChangeStream::new(self.tx.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl FileChangePort for FileChangeBus {
    fn subscribe(&self) -> BoxFuture<'_, Result<FileChangeStream, NotifyError>> {
        Box::pin(async move { Ok(self.stream()) })
    }
}

/// `path` relative to `root` with `/` separators, or `None` for paths the
/// persisters never read: hidden entries and in-progress temp files.
fn relative_watch_path(roots: &[PathBuf], path: &Path) -> Option<String> {
    let relative = roots.iter().find_map(|root| path.strip_prefix(root).ok())?;
    let normalized = normalize_path(relative);
    if normalized.is_empty() {
        return None;
    }
    if normalized.split('/').any(|part| part.starts_with('.')) {
        return None;
    }
    if normalized.ends_with(".tmp") {
        return None;
    }
    Some(normalized)
}

/// Recursive debounced watcher over the settings base that forwards every
/// relevant change to a [`FileChangeBus`].
#[derive(Debug)]
pub struct FsWatcher {
    root: PathBuf,
    stop_tx: Option<mpsc::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl FsWatcher {
    pub fn start(root: &Path, bus: FileChangeBus, debounce: Duration) -> Result<Self, NotifyError> {
        let watch_error = |message: String| NotifyError::Watch {
            path: root.display().to_string(),
            message,
        };

        let mut roots = vec![root.to_path_buf()];
        if let Ok(canonical) = root.canonicalize() {
            if canonical != root {
                roots.push(canonical);
            }
        }

        let watch_root = root.to_path_buf();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

        let join_handle = std::thread::Builder::new()
            .name("echonote-fs-watcher".to_string())
            .spawn(move || {
                let (events_tx, events_rx) = mpsc::channel::<DebounceEventResult>();
                let mut debouncer = match new_debouncer(debounce, None, events_tx) {
                    Ok(value) => value,
                    Err(error) => {
                        let _ = ready_tx.send(Err(error.to_string()));
                        return;
                    }
                };

                if let Err(error) = debouncer.watch(&watch_root, RecursiveMode::Recursive) {
                    let _ = ready_tx.send(Err(error.to_string()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                loop {
                    if stop_rx.try_recv().is_ok() {
                        break;
                    }

                    match events_rx.recv_timeout(Duration::from_millis(500)) {
                        Ok(Ok(events)) => {
                            let changed: BTreeSet<String> = events
                                .iter()
                                .flat_map(|event| event.paths.iter())
                                .filter_map(|path| relative_watch_path(&roots, path))
                                .collect();
                            for path in changed {
                                log::debug!("[watcher] changed: {}", path);
                                bus.publish(path);
                            }
                        }
                        Ok(Err(errors)) => {
                            for error in errors {
                                log::warn!("[watcher] event error: {}", error);
                            }
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|error| watch_error(error.to_string()))?;

        let ready = ready_rx
            .recv()
            .map_err(|_| watch_error("watcher thread exited during setup".to_string()))?;
        if let Err(message) = ready {
            let _ = join_handle.join();
            return Err(watch_error(message));
        }

        log::info!("[watcher] watching {}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stops the watcher thread and waits for it to exit.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.join();
        }
    }
}

impl Drop for FsWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::{relative_watch_path, FileChangeBus, FsWatcher};
    use crate::core::ports::notify::{FileChangeEvent, FileChangePort};
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    #[test]
    fn relative_paths_skip_hidden_and_temp_files() {
        let roots = vec![PathBuf::from("/data/echonote")];
        let path = |value: &str| relative_watch_path(&roots, Path::new(value));

        assert_eq!(
            path("/data/echonote/chats/g1/messages.json").as_deref(),
            Some("chats/g1/messages.json")
        );
        assert_eq!(path("/data/echonote/templates.json.tmp"), None);
        assert_eq!(path("/data/echonote/.git/index"), None);
        assert_eq!(path("/data/echonote"), None);
        assert_eq!(path("/elsewhere/templates.json"), None);
    }

    #[tokio::test]
    async fn bus_delivers_to_every_subscriber() {
        let bus = FileChangeBus::default();
        assert_eq!(bus.publish("nobody.json"), 0);

        let mut first = bus.subscribe().await.expect("subscribe");
        let mut second = bus.subscribe().await.expect("subscribe");
        assert_eq!(bus.subscriber_count(), 2);
        assert_eq!(bus.publish("templates.json"), 2);

        for stream in [&mut first, &mut second] {
            match stream.next().await {
                Some(FileChangeEvent::Changed(changed)) => {
                    assert_eq!(changed.path, "templates.json")
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn slow_subscriber_sees_lagged() {
        let bus = FileChangeBus::new(2);
        let mut stream = bus.subscribe().await.expect("subscribe");
        for index in 0..5 {
            bus.publish(format!("file-{index}.json"));
        }
        assert!(matches!(stream.next().await, Some(FileChangeEvent::Lagged(3))));
    }

    #[tokio::test]
    async fn watcher_publishes_relative_paths() {
        let root = std::env::temp_dir().join(format!("echonote-watch-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).expect("create root");

        let bus = FileChangeBus::default();
        let mut stream = bus.subscribe().await.expect("subscribe");
        let mut watcher =
            FsWatcher::start(&root, bus.clone(), Duration::from_millis(50)).expect("start watcher");

        std::fs::write(root.join("templates.json"), "{}").expect("write file");

        let event = tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .expect("change in time");
        match event {
            Some(FileChangeEvent::Changed(changed)) => assert_eq!(changed.path, "templates.json"),
            other => panic!("unexpected event: {:?}", other),
        }

        watcher.stop();
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn watching_a_missing_directory_fails() {
        let root = std::env::temp_dir().join(format!("echonote-missing-{}", uuid::Uuid::new_v4()));
        let error = FsWatcher::start(&root, FileChangeBus::default(), Duration::from_millis(50))
            .expect_err("missing root");
        assert!(error.to_string().contains("failed to watch"));
    }
}
