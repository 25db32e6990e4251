use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

use super::SessionError;
use super::store::StoreSnapshot;

enum PersistCmd {
    /// Debounced save; the latest snapshot within a window wins.
    Save(Box<StoreSnapshot>),
    /// Immediate save, bypassing the debounce (shutdown path).
    SaveNow(Box<StoreSnapshot>, oneshot::Sender<()>),
}

/// Debounced, serialized snapshot writer.
///
/// `save` is idempotent and safe to call arbitrarily often: repeated calls
/// within the debounce window coalesce into a single disk write carrying the
/// most recent snapshot. Write failures are logged and swallowed; the next
/// save retries from scratch with fresh state.
pub struct PersistenceManager {
    tx: mpsc::Sender<PersistCmd>,
    task: JoinHandle<()>,
}

impl PersistenceManager {
    pub fn spawn(path: PathBuf, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(run_writer(path, debounce, rx));
        Self { tx, task }
    }

    pub async fn save(&self, snapshot: StoreSnapshot) {
        let _ = self.tx.send(PersistCmd::Save(Box::new(snapshot))).await;
    }

    /// Write immediately and wait for the write to finish.
    pub async fn save_now(&self, snapshot: StoreSnapshot) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(PersistCmd::SaveNow(Box::new(snapshot), reply_tx))
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    /// Flush any pending snapshot and stop the writer task.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.task.await;
    }

    /// Load the durable snapshot, if one exists.
    pub async fn load(path: &Path) -> Result<Option<StoreSnapshot>, SessionError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

async fn run_writer(path: PathBuf, debounce: Duration, mut rx: mpsc::Receiver<PersistCmd>) {
    let mut pending: Option<Box<StoreSnapshot>> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(PersistCmd::Save(snapshot)) => {
                    pending = Some(snapshot);
                    if deadline.is_none() {
                        deadline = Some(Instant::now() + debounce);
                    }
                }
                Some(PersistCmd::SaveNow(snapshot, reply)) => {
                    write_snapshot(&path, &snapshot).await;
                    pending = None;
                    deadline = None;
                    let _ = reply.send(());
                }
                None => {
                    if let Some(snapshot) = pending.take() {
                        write_snapshot(&path, &snapshot).await;
                    }
                    break;
                }
            },
            () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                if deadline.is_some() =>
            {
                if let Some(snapshot) = pending.take() {
                    write_snapshot(&path, &snapshot).await;
                }
                deadline = None;
            }
        }
    }

    debug!("persistence writer stopped");
}

async fn write_snapshot(path: &Path, snapshot: &StoreSnapshot) {
    if let Err(e) = try_write(path, snapshot).await {
        error!(path = %path.display(), error = %e, "failed to persist sessions");
    } else {
        debug!(path = %path.display(), sessions = snapshot.sessions.len(), "persisted sessions");
    }
}

/// Atomic replace: write to a sibling temp file, then rename over the
/// destination. Parent directories are created first.
async fn try_write(path: &Path, snapshot: &StoreSnapshot) -> Result<(), SessionError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &json).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
