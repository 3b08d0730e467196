//! Request spooling: one upstream round-trip shared by N concurrent clients.
//!
//! While a repository is still cloning, concurrent clients asking for the
//! same protocol response are collapsed onto a single upstream request.  The
//! first client becomes the writer and tees the upstream response into a
//! disk-backed spool file; later clients tail that file, receiving bytes as
//! they land.  A spool is write-once/read-many: its terminal state
//! (`complete` or `failed`) latches, and `failed` tells readers to fall back
//! to a direct upstream request.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::cache::Headers;

const READ_CHUNK: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum SpoolError {
    /// The writer failed before a response head was captured; callers should
    /// retry directly against the upstream.
    #[error("spool failed before the response started")]
    Failed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpoolState {
    Writing,
    Complete,
    Failed,
}

/// Response status and headers captured from the writer's upstream response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
}

#[derive(Debug, Clone)]
struct Progress {
    head: Option<ResponseHead>,
    len: u64,
    state: SpoolState,
}

// ---------------------------------------------------------------------------
// Spool
// ---------------------------------------------------------------------------

pub struct Spool {
    path: PathBuf,
    progress: watch::Sender<Progress>,
}

impl Spool {
    fn new(path: PathBuf) -> Self {
        let (progress, _) = watch::channel(Progress {
            head: None,
            len: 0,
            state: SpoolState::Writing,
        });
        Self { path, progress }
    }

    pub fn state(&self) -> SpoolState {
        self.progress.borrow().state
    }

    pub fn failed(&self) -> bool {
        self.state() == SpoolState::Failed
    }

    /// Block until the writer has captured the response head (or failed
    /// without one).
    pub async fn wait_for_head(&self) -> Result<ResponseHead, SpoolError> {
        let mut rx = self.progress.subscribe();
        loop {
            {
                let progress = rx.borrow();
                if let Some(head) = &progress.head {
                    return Ok(head.clone());
                }
                if progress.state == SpoolState::Failed {
                    return Err(SpoolError::Failed);
                }
            }
            if rx.changed().await.is_err() {
                return Err(SpoolError::Failed);
            }
        }
    }

    /// Stream the spool body from the beginning.  Bytes are delivered as the
    /// writer lands them; the stream ends when the spool completes, or with
    /// an error when the spool fails after bytes were already delivered.
    pub fn body_stream(
        self: &Arc<Self>,
    ) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);
        let spool = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = pump_body(&spool, &tx).await {
                let _ = tx.send(Err(err)).await;
            }
        });
        tokio_stream::wrappers::ReceiverStream::new(rx)
    }
}

/// Tail the spool file into `tx` until the terminal state is reached.
async fn pump_body(
    spool: &Spool,
    tx: &mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> Result<(), std::io::Error> {
    let mut file = tokio::fs::File::open(&spool.path).await?;
    file.seek(std::io::SeekFrom::Start(0)).await?;
    let mut position: u64 = 0;
    let mut rx = spool.progress.subscribe();

    loop {
        let (len, state) = {
            let progress = rx.borrow_and_update();
            (progress.len, progress.state)
        };

        while position < len {
            let chunk_len = (len - position).min(READ_CHUNK) as usize;
            let mut buf = vec![0u8; chunk_len];
            file.read_exact(&mut buf).await?;
            position += chunk_len as u64;
            if tx.send(Ok(Bytes::from(buf))).await.is_err() {
                // Reader went away.
                return Ok(());
            }
        }

        match state {
            SpoolState::Complete => return Ok(()),
            SpoolState::Failed => {
                return Err(std::io::Error::other("spool failed mid-stream"));
            }
            SpoolState::Writing => {
                if rx.changed().await.is_err() {
                    return Err(std::io::Error::other("spool writer vanished"));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Exclusive write side of a spool.  Dropping without
/// [`SpoolWriter::mark_complete`] marks the spool failed, so an aborted
/// upstream transfer can never strand readers.
pub struct SpoolWriter {
    spool: Arc<Spool>,
    file: tokio::fs::File,
    finished: bool,
}

impl SpoolWriter {
    /// Latch the response status and headers.  First call wins.
    pub fn set_head(&self, status: u16, headers: Headers) {
        self.spool.progress.send_modify(|progress| {
            if progress.head.is_none() {
                progress.head = Some(ResponseHead { status, headers });
            }
        });
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<(), std::io::Error> {
        self.file.write_all(buf).await?;
        self.file.flush().await?;
        let written = buf.len() as u64;
        self.spool.progress.send_modify(|progress| {
            progress.len += written;
        });
        Ok(())
    }

    pub fn mark_complete(mut self) {
        self.finished = true;
        self.spool.progress.send_modify(|progress| {
            if progress.state == SpoolState::Writing {
                progress.state = SpoolState::Complete;
            }
        });
    }

    pub fn mark_failed(mut self) {
        self.finished = true;
        fail(&self.spool);
    }
}

impl Drop for SpoolWriter {
    fn drop(&mut self) {
        if !self.finished {
            fail(&self.spool);
        }
    }
}

fn fail(spool: &Spool) {
    spool.progress.send_modify(|progress| {
        if progress.state == SpoolState::Writing {
            progress.state = SpoolState::Failed;
        }
    });
}

// ---------------------------------------------------------------------------
// Per-repo spool table
// ---------------------------------------------------------------------------

/// Spools for one repository, keyed by spool-key string and stored under one
/// directory that is removed wholesale when the repository leaves its
/// cloning phase.
pub struct RepoSpools {
    dir: PathBuf,
    spools: Mutex<HashMap<String, Arc<Spool>>>,
}

impl RepoSpools {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            spools: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the spool for `key`.  The first caller receives the writer and
    /// is responsible for producing the response; everyone else reads.
    pub fn get_or_create(
        &self,
        key: &str,
    ) -> Result<(Arc<Spool>, Option<SpoolWriter>), std::io::Error> {
        let mut spools = self.spools.lock().expect("spool table lock poisoned");
        if let Some(spool) = spools.get(key) {
            return Ok((Arc::clone(spool), None));
        }

        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(key);
        let file = std::fs::File::create(&path)?;
        let spool = Arc::new(Spool::new(path));
        spools.insert(key.to_string(), Arc::clone(&spool));
        debug!(dir = %self.dir.display(), key, "created spool");

        let writer = SpoolWriter {
            spool: Arc::clone(&spool),
            file: tokio::fs::File::from_std(file),
            finished: false,
        };
        Ok((spool, Some(writer)))
    }

    /// Fail any live spools and delete the backing files.
    pub fn close(&self) -> Result<(), std::io::Error> {
        let spools: Vec<Arc<Spool>> = {
            let mut table = self.spools.lock().expect("spool table lock poisoned");
            table.drain().map(|(_, spool)| spool).collect()
        };
        for spool in spools {
            fail(&spool);
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "failed to remove spool directory");
                Err(err)
            }
        }
    }
}
