use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::{debug, warn};

const WRITE_ATTEMPTS: u32 = 3;

/// What the worker should do next. At most one value is ever pending: a
/// newer command supersedes the one waiting its turn, so a delete replaces a
/// queued write and a write queued behind an executing delete re-creates the
/// file.
#[derive(Debug, Default)]
enum Pending {
    #[default]
    None,
    Write(Vec<u8>),
    Delete,
}

#[derive(Debug, Default)]
struct Slot {
    pending: Pending,
    in_flight: bool,
    /// Set by the worker once a delete drains with nothing queued behind
    /// it; the worker is gone and the handle is spent.
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    slot: Mutex<Slot>,
    work: Notify,
    idle: Notify,
    errors: Mutex<Vec<String>>,
}

/// Serializes writes to one file. Producers never block: handing the worker
/// a payload is a mutex store plus a wakeup, and the worker owns all I/O.
/// Writes are double-buffered (temp file, fsync, rename) so a crash leaves
/// either the old or the new content, never a torn file.
#[derive(Debug)]
pub struct FileWriter {
    path: PathBuf,
    shared: Arc<Shared>,
}

impl FileWriter {
    /// Spawns the worker task. Must be called within a tokio runtime.
    pub fn new(path: PathBuf) -> Self {
        let shared = Arc::new(Shared::default());
        tokio::spawn(worker(path.clone(), Arc::clone(&shared)));
        FileWriter { path, shared }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Queues `bytes` as the next content of the file, replacing whatever
    /// command is still waiting its turn. Returns false when the worker has
    /// already terminated (the file was deleted with nothing queued after);
    /// the caller then needs a fresh writer.
    #[must_use]
    pub fn write(&self, bytes: Vec<u8>) -> bool {
        let mut slot = self.shared.slot.lock().unwrap();
        if slot.closed {
            return false;
        }
        slot.pending = Pending::Write(bytes);
        drop(slot);
        self.shared.work.notify_one();
        true
    }

    /// Queues removal of the file, superseding any pending write. The
    /// worker terminates after the delete unless a newer write arrives
    /// first.
    pub fn delete(&self) {
        let mut slot = self.shared.slot.lock().unwrap();
        if slot.closed {
            return;
        }
        slot.pending = Pending::Delete;
        drop(slot);
        self.shared.work.notify_one();
    }

    /// True once the worker has terminated.
    pub fn is_closed(&self) -> bool {
        self.shared.slot.lock().unwrap().closed
    }

    /// Errors the worker hit since the last call (retries already
    /// exhausted).
    pub fn take_errors(&self) -> Vec<String> {
        std::mem::take(&mut self.shared.errors.lock().unwrap())
    }

    /// Resolves once nothing is pending or in flight.
    pub async fn flush(&self) {
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            // Register interest before checking, so a completion between the
            // check and the await cannot be missed.
            idle.as_mut().enable();
            {
                let slot = self.shared.slot.lock().unwrap();
                if matches!(slot.pending, Pending::None) && !slot.in_flight {
                    return;
                }
            }
            idle.await;
        }
    }
}

async fn worker(path: PathBuf, shared: Arc<Shared>) {
    loop {
        let command = loop {
            let work = shared.work.notified();
            {
                let mut slot = shared.slot.lock().unwrap();
                match std::mem::take(&mut slot.pending) {
                    Pending::None => {}
                    command => {
                        slot.in_flight = true;
                        break command;
                    }
                }
            }
            work.await;
        };

        let was_delete = matches!(command, Pending::Delete);
        match command {
            Pending::None => unreachable!("taken under the lock"),
            Pending::Write(bytes) => {
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    match write_atomic(&path, &bytes).await {
                        Ok(()) => {
                            debug!(path = %path.display(), bytes = bytes.len(), "wrote file");
                            break;
                        }
                        Err(e) if attempt < WRITE_ATTEMPTS => {
                            warn!(path = %path.display(), attempt, error = %e, "write failed, retrying");
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "write failed, giving up");
                            shared.errors.lock().unwrap().push(e.to_string());
                            break;
                        }
                    }
                }
            }
            Pending::Delete => {
                debug!(path = %path.display(), "deleting file");
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        shared.errors.lock().unwrap().push(e.to_string());
                    }
                }
            }
        }

        let mut slot = shared.slot.lock().unwrap();
        slot.in_flight = false;
        let terminate = was_delete && matches!(slot.pending, Pending::None);
        if terminate {
            slot.closed = true;
        }
        drop(slot);
        shared.idle.notify_waiters();
        if terminate {
            return;
        }
    }
}

/// Temp file, fsync, rename: the reader always sees a complete file.
async fn write_atomic(path: &PathBuf, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("msgpack.tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await
}
