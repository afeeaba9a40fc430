//! Embedded on-disk backend
//!
//! An append-only log with an in-memory table, owned by a dedicated worker
//! thread. Callers talk to the worker over a channel and are completed
//! through callbacks, so this backend implements [`CallbackAdapter`] and is
//! exposed to the store through [`Promisified`](crate::adapter::Promisified).
//!
//! ## File format
//!
//! `store.log` starts with a 12 byte header (`OUROSTOR` magic + u32 version).
//! Each write call appends exactly one record:
//!
//! ```text
//! [len: u32 BE][crc32: u32 BE][bincode(Vec<LogOp>)]
//! ```
//!
//! A batch is one record, so it replays entirely or not at all. A record cut
//! short at the end of the file (torn write) is dropped and the file is
//! truncated back to the last complete record. A checksum mismatch on a
//! complete record fails the open.
//!
//! ## Sets
//!
//! `SetAdd`/`SetRemove` batch entries are resolved by the worker against the
//! live table and logged as a `Put` (or `Delete`, once empty) of the set's
//! sorted JSON list, inside the same record as the rest of the batch. The
//! worker handles one request at a time, so concurrent set mutations never
//! overwrite each other.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::adapter::{BatchEntry, CallbackAdapter, Capabilities, Completion, IndexStrategy};

const MAGIC: &[u8; 8] = b"OUROSTOR";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 12;
const LOG_FILE: &str = "store.log";
/// Upper bound on a single record, guards against reading a garbage length
const MAX_RECORD_SIZE: usize = 256 * 1024 * 1024;

/// Disk backend errors
#[derive(Error, Debug)]
pub enum DiskError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Corrupted log at byte {pos}: {reason}")]
    Corrupted { pos: u64, reason: String },

    #[error("Store directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    #[error("Store is already open")]
    AlreadyOpen,

    #[error("Store is closed")]
    Closed,

    #[error("Set '{key}' is not a valid member list: {reason}")]
    CorruptSet { key: String, reason: String },

    #[error("Store is unusable after a failed rollback: {0}")]
    Poisoned(String),
}

/// Disk backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Directory holding `store.log`
    pub directory: PathBuf,
    /// Create the directory (and parents) when it does not exist
    pub create_if_missing: bool,
    /// Initial capacity of the record encoding buffer, in bytes
    pub write_buffer_size: usize,
    /// fsync after every record
    pub sync_on_write: bool,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("disk-store"),
            create_if_missing: true,
            write_buffer_size: 4 * 1024 * 1024,
            sync_on_write: true,
        }
    }
}

impl DiskConfig {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.directory.join(LOG_FILE)
    }
}

/// Logged mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Request sent to the worker thread
enum Request {
    Get {
        key: String,
        done: Completion<Option<Vec<u8>>, DiskError>,
    },
    Apply {
        entries: Vec<BatchEntry>,
        done: Completion<(), DiskError>,
    },
    Members {
        set_key: String,
        done: Completion<Vec<String>, DiskError>,
    },
    Shutdown {
        done: Completion<(), DiskError>,
    },
}

/// Embedded on-disk store
pub struct DiskStore {
    config: DiskConfig,
    sender: Mutex<Option<Sender<Request>>>,
}

impl DiskStore {
    pub fn new(config: DiskConfig) -> Self {
        Self {
            config,
            sender: Mutex::new(None),
        }
    }

    /// Hand a request to the worker, completing it with `Closed` if there is none
    fn dispatch(&self, request: Request) {
        let sender = self.sender.lock().clone();
        let rejected = match sender {
            Some(sender) => match sender.send(request) {
                Ok(()) => return,
                Err(crossbeam_channel::SendError(request)) => request,
            },
            None => request,
        };
        match rejected {
            Request::Get { done, .. } => done(Err(DiskError::Closed)),
            Request::Apply { done, .. } => done(Err(DiskError::Closed)),
            Request::Members { done, .. } => done(Err(DiskError::Closed)),
            Request::Shutdown { done } => done(Err(DiskError::Closed)),
        }
    }

    fn apply(&self, entries: Vec<BatchEntry>, done: Completion<(), DiskError>) {
        self.dispatch(Request::Apply { entries, done });
    }
}

impl CallbackAdapter for DiskStore {
    type Error = DiskError;

    fn name(&self) -> &'static str {
        "disk"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            is_async: false,
            native_batch: true,
            index: IndexStrategy::NativeSet,
        }
    }

    fn init(&self, done: Completion<(), DiskError>) {
        let mut slot = self.sender.lock();
        if slot.is_some() {
            drop(slot);
            done(Err(DiskError::AlreadyOpen));
            return;
        }

        let (sender, receiver) = unbounded::<Request>();
        let config = self.config.clone();
        let spawned = thread::Builder::new()
            .name("store-disk".to_string())
            .spawn(move || match LogTable::open(&config) {
                Ok(table) => {
                    done(Ok(()));
                    table.run(receiver);
                }
                Err(e) => {
                    error!("Failed to open disk store {}: {}", config.directory.display(), e);
                    done(Err(e));
                }
            });

        match spawned {
            Ok(_) => *slot = Some(sender),
            // The closure (and `done`) was dropped with the failed spawn;
            // the caller sees a dropped completion.
            Err(e) => error!("Failed to spawn disk store worker: {}", e),
        }
    }

    fn get(&self, key: String, done: Completion<Option<Vec<u8>>, DiskError>) {
        self.dispatch(Request::Get { key, done });
    }

    fn set(&self, key: String, value: Vec<u8>, done: Completion<(), DiskError>) {
        self.apply(vec![BatchEntry::Put { key, value }], done);
    }

    fn remove(&self, key: String, done: Completion<(), DiskError>) {
        self.apply(vec![BatchEntry::Delete { key }], done);
    }

    fn write_batch(&self, entries: Vec<BatchEntry>, done: Completion<(), DiskError>) {
        self.apply(entries, done);
    }

    fn set_members(&self, set_key: String, done: Completion<Vec<String>, DiskError>) {
        self.dispatch(Request::Members { set_key, done });
    }

    fn close(&self, done: Completion<(), DiskError>) {
        let sender = self.sender.lock().take();
        match sender {
            Some(sender) => {
                if let Err(crossbeam_channel::SendError(Request::Shutdown { done })) =
                    sender.send(Request::Shutdown { done })
                {
                    // Worker already gone (open failed); nothing left to release
                    done(Ok(()));
                }
            }
            None => done(Err(DiskError::Closed)),
        }
    }
}

impl Drop for DiskStore {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.lock().take() {
            warn!("DiskStore dropped without close, flushing in background");
            let _ = sender.send(Request::Shutdown {
                done: Box::new(|result| {
                    if let Err(e) = result {
                        error!("Failed to flush disk store on drop: {}", e);
                    }
                }),
            });
        }
    }
}

/// Worker-owned state: the open log file plus the live table
struct LogTable {
    table: HashMap<String, Vec<u8>>,
    file: File,
    buffer: Vec<u8>,
    position: u64,
    sync_on_write: bool,
    path: PathBuf,
    /// Set when a failed append could not be rolled back
    poisoned: Option<String>,
}

impl LogTable {
    fn open(config: &DiskConfig) -> Result<Self, DiskError> {
        if !config.directory.exists() {
            if !config.create_if_missing {
                return Err(DiskError::MissingDirectory(config.directory.clone()));
            }
            fs::create_dir_all(&config.directory)?;
        }

        let path = config.log_path();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            file.write_all(MAGIC)?;
            file.write_all(&FORMAT_VERSION.to_be_bytes())?;
            file.sync_data()?;
            debug!("Created new store log: {}", path.display());
        }

        let (table, valid_len, records) = replay(&mut file)?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            warn!(
                "Dropping {} bytes of incomplete record at end of {}",
                file_len - valid_len,
                path.display()
            );
            file.set_len(valid_len)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        info!(
            "Opened disk store {} ({} keys from {} records)",
            path.display(),
            table.len(),
            records
        );

        Ok(Self {
            table,
            file,
            buffer: Vec::with_capacity(config.write_buffer_size),
            position: valid_len,
            sync_on_write: config.sync_on_write,
            path,
            poisoned: None,
        })
    }

    fn run(mut self, receiver: Receiver<Request>) {
        for request in receiver.iter() {
            match request {
                Request::Get { key, done } => done(Ok(self.table.get(&key).cloned())),
                Request::Apply { entries, done } => {
                    let result = self.resolve(entries).and_then(|ops| self.apply(ops));
                    done(result)
                }
                Request::Members { set_key, done } => {
                    done(self.members(&set_key).map(|set| set.into_iter().collect()))
                }
                Request::Shutdown { done } => {
                    let result = self.shutdown();
                    done(result);
                    return;
                }
            }
        }

        // Every sender dropped without an explicit shutdown
        if let Err(e) = self.shutdown() {
            error!("Failed to flush disk store: {}", e);
        }
    }

    /// Current members of the set stored at `set_key`
    fn members(&self, set_key: &str) -> Result<BTreeSet<String>, DiskError> {
        match self.table.get(set_key) {
            Some(bytes) => serde_json::from_slice::<Vec<String>>(bytes)
                .map(|list| list.into_iter().collect())
                .map_err(|e| DiskError::CorruptSet {
                    key: set_key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(BTreeSet::new()),
        }
    }

    /// Turn batch entries into logged ops, folding set mutations into one
    /// `Put`/`Delete` per changed set
    fn resolve(&self, entries: Vec<BatchEntry>) -> Result<Vec<LogOp>, DiskError> {
        let mut ops = Vec::with_capacity(entries.len());
        // set key -> (members before, members after)
        let mut sets: HashMap<String, (BTreeSet<String>, BTreeSet<String>)> = HashMap::new();

        for entry in entries {
            match entry {
                BatchEntry::Put { key, value } => ops.push(LogOp::Put { key, value }),
                BatchEntry::Delete { key } => ops.push(LogOp::Delete { key }),
                BatchEntry::SetAdd { set_key, member } => {
                    let (_, after) = self.pending_set(&mut sets, set_key)?;
                    after.insert(member);
                }
                BatchEntry::SetRemove { set_key, member } => {
                    let (_, after) = self.pending_set(&mut sets, set_key)?;
                    after.remove(&member);
                }
            }
        }

        let mut changed: Vec<_> = sets
            .into_iter()
            .filter(|(_, (before, after))| before != after)
            .collect();
        changed.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, (_, after)) in changed {
            if after.is_empty() {
                ops.push(LogOp::Delete { key });
            } else {
                let list: Vec<&String> = after.iter().collect();
                let value =
                    serde_json::to_vec(&list).map_err(|e| DiskError::Encoding(e.to_string()))?;
                ops.push(LogOp::Put { key, value });
            }
        }
        Ok(ops)
    }

    fn pending_set<'a>(
        &self,
        sets: &'a mut HashMap<String, (BTreeSet<String>, BTreeSet<String>)>,
        set_key: String,
    ) -> Result<&'a mut (BTreeSet<String>, BTreeSet<String>), DiskError> {
        match sets.entry(set_key) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let current = self.members(entry.key())?;
                Ok(entry.insert((current.clone(), current)))
            }
        }
    }

    /// Append one record for `ops`, then apply them to the table
    fn apply(&mut self, ops: Vec<LogOp>) -> Result<(), DiskError> {
        if let Some(reason) = &self.poisoned {
            return Err(DiskError::Poisoned(reason.clone()));
        }
        if ops.is_empty() {
            return Ok(());
        }

        encode_record_into(&mut self.buffer, &ops)?;
        let start = self.position;

        let mut written = self.file.write_all(&self.buffer);
        if written.is_ok() && self.sync_on_write {
            written = self.file.sync_data();
        }

        if let Err(e) = written {
            // Cut the partial record so later appends stay readable
            let rollback = self
                .file
                .set_len(start)
                .and_then(|()| self.file.seek(SeekFrom::Start(start)).map(|_| ()));
            if let Err(rollback_err) = rollback {
                error!(
                    "Failed to roll back {} after write error, refusing further writes: {}",
                    self.path.display(),
                    rollback_err
                );
                self.poisoned = Some(format!(
                    "write failed ({}) and rollback failed ({})",
                    e, rollback_err
                ));
            }
            return Err(e.into());
        }

        self.position += self.buffer.len() as u64;
        for op in ops {
            match op {
                LogOp::Put { key, value } => {
                    self.table.insert(key, value);
                }
                LogOp::Delete { key } => {
                    self.table.remove(&key);
                }
            }
        }
        Ok(())
    }

    /// Flush and fsync, then drop the file handle
    fn shutdown(self) -> Result<(), DiskError> {
        self.file.sync_all()?;
        debug!("Closed disk store {}", self.path.display());
        Ok(())
    }
}

/// Encode `ops` as one framed record into `buf`, replacing its contents
fn encode_record_into(buf: &mut Vec<u8>, ops: &[LogOp]) -> Result<(), DiskError> {
    let payload = bincode::serialize(ops).map_err(|e| DiskError::Encoding(e.to_string()))?;
    if payload.len() > MAX_RECORD_SIZE {
        return Err(DiskError::Encoding(format!(
            "record of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_RECORD_SIZE
        )));
    }
    buf.clear();
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(())
}

/// Rebuild the table from the log.
///
/// Returns the table, the length of the valid prefix and the record count.
fn replay(file: &mut File) -> Result<(HashMap<String, Vec<u8>>, u64, usize), DiskError> {
    file.seek(SeekFrom::Start(0))?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(&mut *file);

    let mut header = [0u8; HEADER_SIZE as usize];
    reader.read_exact(&mut header).map_err(|_| DiskError::Corrupted {
        pos: 0,
        reason: "truncated header".to_string(),
    })?;
    if &header[0..8] != MAGIC {
        return Err(DiskError::Corrupted {
            pos: 0,
            reason: "bad magic".to_string(),
        });
    }
    let version = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    if version != FORMAT_VERSION {
        return Err(DiskError::Corrupted {
            pos: 8,
            reason: format!("unsupported format version {}", version),
        });
    }

    let mut table = HashMap::new();
    let mut position = HEADER_SIZE;
    let mut records = 0usize;

    loop {
        if file_len - position < 8 {
            // Nothing, or a torn record prefix
            break;
        }

        let mut prefix = [0u8; 8];
        reader.read_exact(&mut prefix)?;
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        let crc = u32::from_be_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);

        if len > MAX_RECORD_SIZE {
            return Err(DiskError::Corrupted {
                pos: position,
                reason: format!("record length too large: {} bytes", len),
            });
        }
        if file_len - position - 8 < len as u64 {
            // Torn write at the tail
            break;
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != crc {
            return Err(DiskError::Corrupted {
                pos: position,
                reason: "checksum mismatch".to_string(),
            });
        }

        let ops: Vec<LogOp> = bincode::deserialize(&payload).map_err(|e| DiskError::Corrupted {
            pos: position,
            reason: e.to_string(),
        })?;
        for op in ops {
            match op {
                LogOp::Put { key, value } => {
                    table.insert(key, value);
                }
                LogOp::Delete { key } => {
                    table.remove(&key);
                }
            }
        }

        position += 8 + len as u64;
        records += 1;
    }

    Ok((table, position, records))
}
