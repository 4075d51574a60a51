//! Append-Only Log
//!
//! Every successful mutation is encoded as a multi-bulk frame and handed to
//! a dedicated writer thread through a bounded queue. The writer appends
//! frames in the order they were submitted; since submission happens while
//! the mutation still holds its key locks, the file is a valid replay of
//! the concurrent command stream.
//!
//! ## Online rewrite
//!
//! ```text
//!   Pause A        snapshot (no pause)           Pause B
//!  ┌───────┐  ┌──────────────────────────────┐  ┌────────┐
//!  │flush  │  │replay first L bytes into a   │  │drain   │
//!  │len = L│─▶│replica, dump every key into  │─▶│mirror, │
//!  │mirror │  │the temp file                 │  │rename  │
//!  └───────┘  └──────────────────────────────┘  └────────┘
//!        frames keep flowing to the live file and the mirror
//! ```
//!
//! The writer holds the shared side of the pause lock for each frame, so
//! the two pauses stop it only briefly. If anything fails the live file is
//! left untouched and the temp file is deleted.

use crate::db::marshal::{entity_to_cmd, ttl_cmd};
use crate::db::registry::{command_name, validate_arity};
use crate::db::Db;
use crate::protocol::reply::encode_cmd_line;
use crate::protocol::{CmdLine, CommandParser, ProtocolError};
use bytes::{Buf, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Instant, SystemTime};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum AofError {
    #[error("AOF I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Background append only file rewriting already in progress")]
    RewriteInProgress,

    #[error("rewrite buffer overflowed, rewrite abandoned")]
    RewriteOverflow,

    #[error("append only file is corrupt at byte {offset}: {source}")]
    Corrupt { offset: u64, source: ProtocolError },

    #[error("append only file is disabled")]
    Disabled,

    #[error("AOF writer has stopped")]
    WriterStopped,
}

/// Where the log lives and how much it may buffer.
#[derive(Debug, Clone)]
pub struct AofConfig {
    pub path: PathBuf,
    /// Frames waiting for the writer before producers block (default: 65536)
    pub queue_capacity: usize,
    /// Frames mirrored during a rewrite before it is abandoned (default: 65536)
    pub rewrite_buffer: usize,
}

impl AofConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            queue_capacity: 1 << 16,
            rewrite_buffer: 1 << 16,
        }
    }
}

enum Msg {
    Frame(CmdLine),
    Flush(SyncSender<()>),
    Shutdown,
}

struct Shared {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
    pause: RwLock<()>,
    mirror: Mutex<Option<SyncSender<CmdLine>>>,
    overflowed: AtomicBool,
    rewriting: AtomicBool,
    rewrite_buffer: usize,
}

impl Shared {
    fn write_frame(&self, line: &CmdLine, buf: &mut Vec<u8>) {
        let _pause = self.pause.read();

        {
            let mut mirror = self.mirror.lock();
            if let Some(tx) = mirror.as_ref() {
                if tx.try_send(line.clone()).is_err() {
                    self.overflowed.store(true, Ordering::SeqCst);
                    *mirror = None;
                }
            }
        }

        buf.clear();
        encode_cmd_line(line, buf);
        if let Err(e) = self.file.lock().write_all(buf) {
            warn!(error = %e, "AOF write failed");
        }
    }

    fn flush(&self) {
        if let Err(e) = self.file.lock().flush() {
            warn!(error = %e, "AOF flush failed");
        }
    }

    fn sync(&self) {
        let mut file = self.file.lock();
        if let Err(e) = file.flush().and_then(|_| file.get_ref().sync_all()) {
            warn!(error = %e, "AOF fsync failed");
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn writer_loop(shared: Arc<Shared>, rx: Receiver<Msg>) {
    let mut buf = Vec::with_capacity(4096);

    while let Ok(first) = rx.recv() {
        let mut next = Some(first);
        // Drain whatever is queued, then flush once.
        while let Some(msg) = next.take() {
            match msg {
                Msg::Frame(line) => shared.write_frame(&line, &mut buf),
                Msg::Flush(ack) => {
                    shared.flush();
                    let _ = ack.send(());
                }
                Msg::Shutdown => {
                    shared.sync();
                    debug!("AOF writer stopped");
                    return;
                }
            }
            next = rx.try_recv().ok();
        }
        shared.flush();
    }

    shared.sync();
}

/// Handle to the live log and its writer thread.
pub struct Aof {
    tx: SyncSender<Msg>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Aof {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aof")
            .field("path", &self.shared.path)
            .field("rewriting", &self.is_rewriting())
            .finish()
    }
}

impl Aof {
    /// Opens (or creates) the log for appending and starts the writer.
    pub fn open(config: &AofConfig) -> Result<Self, AofError> {
        let file = open_append(&config.path)?;
        let shared = Arc::new(Shared {
            path: config.path.clone(),
            file: Mutex::new(BufWriter::new(file)),
            pause: RwLock::new(()),
            mirror: Mutex::new(None),
            overflowed: AtomicBool::new(false),
            rewriting: AtomicBool::new(false),
            rewrite_buffer: config.rewrite_buffer.max(1),
        });

        let (tx, rx) = mpsc::sync_channel(config.queue_capacity.max(1));
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("aof-writer".to_string())
            .spawn(move || writer_loop(worker_shared, rx))?;

        info!(path = %config.path.display(), "Append only file opened");

        Ok(Self {
            tx,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Queues one frame. Blocks while the queue is full.
    pub fn append(&self, line: CmdLine) {
        if self.tx.send(Msg::Frame(line)).is_err() {
            warn!("AOF writer has stopped, frame dropped");
        }
    }

    /// Returns once every frame queued before the call is written.
    pub fn flush(&self) -> Result<(), AofError> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.tx
            .send(Msg::Flush(ack_tx))
            .map_err(|_| AofError::WriterStopped)?;
        ack_rx.recv().map_err(|_| AofError::WriterStopped)
    }

    /// Drains the queue, fsyncs and stops the writer. Safe to call twice.
    pub fn close(&self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = self.tx.send(Msg::Shutdown);
            if worker.join().is_err() {
                error!("AOF writer thread panicked");
            }
            info!(path = %self.shared.path.display(), "Append only file closed");
        }
    }

    pub fn is_rewriting(&self) -> bool {
        self.shared.rewriting.load(Ordering::SeqCst)
    }

    /// Pause A: flush and measure the live file, open the temp file and
    /// start mirroring frames.
    pub fn start_rewrite(&self) -> Result<Rewrite, AofError> {
        if self
            .shared
            .rewriting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AofError::RewriteInProgress);
        }
        let slot = RewriteSlot(Arc::clone(&self.shared));

        let _pause = self.shared.pause.write();

        let size = {
            let mut file = self.shared.file.lock();
            file.flush()?;
            file.get_ref().sync_all()?;
            file.get_ref().metadata()?.len()
        };

        let dir = match self.shared.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let tmp = NamedTempFile::new_in(dir)?;

        let (tx, rx) = mpsc::sync_channel(self.shared.rewrite_buffer);
        self.shared.overflowed.store(false, Ordering::SeqCst);
        *self.shared.mirror.lock() = Some(tx);

        info!(size, "AOF rewrite started");
        Ok(Rewrite {
            tmp,
            size,
            mirrored: rx,
            started: Instant::now(),
            _slot: slot,
        })
    }

    /// Pause B: append the mirrored frames to the temp file and swap it in.
    pub fn finish_rewrite(&self, rewrite: Rewrite) -> Result<(), AofError> {
        let Rewrite {
            mut tmp,
            mirrored,
            started,
            _slot,
            ..
        } = rewrite;

        let _pause = self.shared.pause.write();
        *self.shared.mirror.lock() = None;

        if self.shared.overflowed.load(Ordering::SeqCst) {
            warn!("AOF rewrite buffer overflowed, keeping the old file");
            return Err(AofError::RewriteOverflow);
        }

        let mut buf = Vec::new();
        let mut tail = 0usize;
        while let Ok(line) = mirrored.try_recv() {
            encode_cmd_line(&line, &mut buf);
            tail += 1;
        }
        tmp.write_all(&buf)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;

        tmp.persist(&self.shared.path).map_err(|e| AofError::Io(e.error))?;
        *self.shared.file.lock() = BufWriter::new(open_append(&self.shared.path)?);

        info!(
            tail_frames = tail,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "AOF rewrite finished"
        );
        Ok(())
    }
}

impl Drop for Aof {
    fn drop(&mut self) {
        self.close();
    }
}

// Clears the mirror and the in-progress flag however the rewrite ends.
struct RewriteSlot(Arc<Shared>);

impl Drop for RewriteSlot {
    fn drop(&mut self) {
        *self.0.mirror.lock() = None;
        self.0.rewriting.store(false, Ordering::SeqCst);
    }
}

/// A rewrite between its two pauses.
pub struct Rewrite {
    tmp: NamedTempFile,
    size: u64,
    mirrored: Receiver<CmdLine>,
    started: Instant,
    _slot: RewriteSlot,
}

impl Rewrite {
    /// Length of the live file at Pause A.
    pub fn size(&self) -> u64 {
        self.size
    }
}

// ============================================================================
// Replay
// ============================================================================

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub applied: usize,
    pub skipped: usize,
    pub bytes: u64,
}

/// Replays the log at `path` (only its first `limit` bytes if given) into
/// `db`, calling executors directly.
pub fn load(path: &Path, limit: Option<u64>, db: &Db) -> Result<ReplayStats, AofError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ReplayStats::default()),
        Err(e) => return Err(e.into()),
    };
    let mut reader: Box<dyn Read> = match limit {
        Some(n) => Box::new(file.take(n)),
        None => Box::new(file),
    };

    let parser = CommandParser::new();
    let mut stats = ReplayStats::default();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        loop {
            match parser.parse(&buf) {
                Ok(Some((line, used))) => {
                    buf.advance(used);
                    stats.bytes += used as u64;
                    if db.replay_line(&line) {
                        stats.applied += 1;
                    } else {
                        stats.skipped += 1;
                    }
                }
                Ok(None) => break,
                Err(source) => {
                    return Err(AofError::Corrupt {
                        offset: stats.bytes,
                        source,
                    })
                }
            }
        }

        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    if !buf.is_empty() {
        warn!(
            bytes = buf.len(),
            "AOF ends with an incomplete frame, ignoring it"
        );
    }

    Ok(stats)
}

impl Db {
    /// Runs one logged command without locks, versions or logging.
    pub(crate) fn replay_line(&self, line: &[bytes::Bytes]) -> bool {
        let name = command_name(line);
        let Some(cmd) = self.commands().get(&name) else {
            debug!(command = %name, "Skipping unknown command in AOF");
            return false;
        };
        if !validate_arity(cmd.arity, line) {
            debug!(command = %name, "Skipping malformed command in AOF");
            return false;
        }
        if let Err(e) = (cmd.executor)(self, &line[1..]) {
            debug!(command = %name, error = %e, "Replayed command failed");
        }
        true
    }

    /// Full online rewrite of the live log.
    pub fn rewrite_aof(&self) -> Result<(), AofError> {
        let aof = self.aof().ok_or(AofError::Disabled)?;
        let mut rewrite = aof.start_rewrite()?;
        if let Err(e) = self.write_snapshot(&mut rewrite) {
            warn!(error = %e, "AOF rewrite abandoned");
            return Err(e);
        }
        aof.finish_rewrite(rewrite).inspect_err(|e| {
            warn!(error = %e, "AOF rewrite abandoned");
        })
    }

    /// Rebuilds the state as of Pause A in a replica and writes one
    /// command per key plus its TTL into the temp file.
    pub fn write_snapshot(&self, rewrite: &mut Rewrite) -> Result<(), AofError> {
        let aof = self.aof().ok_or(AofError::Disabled)?;
        let replica = Db::replica(self.commands_arc());
        let stats = load(aof.path(), Some(rewrite.size), &replica)?;

        let now = SystemTime::now();
        let mut out = BufWriter::new(rewrite.tmp.as_file_mut());
        let mut buf = Vec::with_capacity(4096);
        let mut failed: Option<io::Error> = None;
        let mut keys = 0usize;

        replica.for_each_entity(|key, value, ttl| {
            if matches!(ttl, Some(at) if at <= now) {
                return true;
            }
            buf.clear();
            encode_cmd_line(&entity_to_cmd(key, value), &mut buf);
            encode_cmd_line(&ttl_cmd(key, ttl), &mut buf);
            if let Err(e) = out.write_all(&buf) {
                failed = Some(e);
                return false;
            }
            keys += 1;
            true
        });

        if let Some(e) = failed {
            return Err(e.into());
        }
        out.flush()?;

        debug!(replayed = stats.applied, keys, "AOF snapshot written");
        Ok(())
    }
}
