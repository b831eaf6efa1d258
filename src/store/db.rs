use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Error, Info, Meta, Storage};

// key length (u32), value length (u32), write time in unix millis (u64)
const HEADER_LEN: usize = 4 + 4 + 8;

const MIN_REAP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// A log structured store split in chunk files.
///
/// Every write is appended to the newest chunk, the write log. Once the write log grows past the
/// configured chunk size it is sealed and becomes a read chunk, and a fresh write log is started.
/// Values live for `expiry` after being written; read chunks holding nothing but expired values
/// are deleted by a background task.
///
/// A key can only be written once while it is live, so there is never more than one live copy of
/// a key across all chunks.
///
/// Like most handles in this crate, it is cheap to clone and every clone refers to the same
/// database.
#[derive(Clone)]
pub struct Db {
    inner: Arc<Inner>,
}

struct Inner {
    dir: PathBuf,
    chunk_size: u64,
    expiry: Duration,
    state: Mutex<State>,
    reaper: CancellationToken,
}

struct State {
    closed: bool,
    write_log: WriteLog,
    // Oldest first.
    read_chunks: Vec<Chunk>,
}

struct WriteLog {
    seq: u64,
    path: PathBuf,
    file: File,
    size: u64,
    entries: HashMap<Bytes, Entry>,
}

struct Entry {
    value: Bytes,
    // Position of the value inside the chunk file.
    offset: u64,
    written_at: u64,
}

struct Chunk {
    path: PathBuf,
    file: File,
    size: u64,
    newest: u64,
    locations: HashMap<Bytes, Location>,
}

#[derive(Clone, Copy, Debug)]
struct Location {
    offset: u64,
    len: u32,
    written_at: u64,
}

struct Record {
    key: Bytes,
    value: Bytes,
    value_offset: u64,
    written_at: u64,
}

impl Db {
    /// Opens the database stored in `dir`, creating it if needed.
    ///
    /// Existing chunks are replayed in order. A partially written record at the end of the write
    /// log is what a crash in the middle of an append leaves behind, so it is cut off; anywhere
    /// else it means the chunk is corrupt.
    ///
    /// Must be called from within a tokio runtime, which runs the expiry task.
    pub fn open(dir: impl AsRef<Path>, chunk_size: u64, expiry: Duration) -> Result<Db, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let now = now_millis();
        let expiry_millis = as_millis(expiry);

        let mut seqs = list_chunks(&dir)?;
        let write_seq = seqs.pop();

        let mut read_chunks = Vec::with_capacity(seqs.len());
        for seq in seqs {
            let chunk = Chunk::load(chunk_path(&dir, seq))?;
            if chunk.is_expired(now, expiry_millis) {
                debug!(path = %chunk.path.display(), "Removing expired chunk");
                fs::remove_file(&chunk.path)?;
                continue;
            }
            read_chunks.push(chunk);
        }

        let write_log = match write_seq {
            Some(seq) => WriteLog::recover(&dir, seq)?,
            None => WriteLog::create(&dir, 0)?,
        };

        let mut state = State {
            closed: false,
            write_log,
            read_chunks,
        };
        if state.write_log.size >= chunk_size {
            state.rotate(&dir)?;
        }

        let inner = Arc::new(Inner {
            dir,
            chunk_size,
            expiry,
            state: Mutex::new(state),
            reaper: CancellationToken::new(),
        });

        info!(
            dir = %inner.dir.display(),
            chunk_size,
            ?expiry,
            "Opened database: {}",
            inner.lock().info()
        );

        tokio::spawn({
            let inner = inner.clone();
            async move { reap_expired_chunks(inner).await }
        });

        Ok(Db { inner })
    }

    /// Deletes the read chunks whose values have all expired and returns how many were removed.
    pub fn remove_expired_chunks(&self) -> usize {
        self.inner.remove_expired_chunks()
    }
}

impl Storage for Db {
    fn put(&self, key: Bytes, value: Bytes) -> Result<(), Error> {
        let inner = &self.inner;
        let mut state = inner.lock();
        if state.closed {
            return Err(Error::Closed);
        }

        let now = now_millis();
        if state.contains_live(&key, now, inner.expiry_millis()) {
            return Err(Error::KeyExists);
        }
        if u32::try_from(key.len()).is_err() || u32::try_from(value.len()).is_err() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "record too large").into());
        }

        let res = state.write_log.append(key, value, now).and_then(|()| {
            if state.write_log.size >= inner.chunk_size {
                state.rotate(&inner.dir)
            } else {
                Ok(())
            }
        });

        if let Err(e) = res {
            // The write log may now end in a partial record, so nothing else may be appended.
            state.closed = true;
            return Err(Error::Fatal(format!(
                "cannot write to {}: {}",
                state.write_log.path.display(),
                e
            )));
        }

        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<(Bytes, Meta), Error> {
        let inner = &self.inner;
        let state = inner.lock();
        if state.closed {
            return Err(Error::Closed);
        }

        let now = now_millis();
        let expiry_millis = inner.expiry_millis();

        if let Some(entry) = state.write_log.entries.get(key) {
            if !is_live(entry.written_at, now, expiry_millis) {
                return Err(Error::KeyNotFound);
            }
            return Ok((entry.value.clone(), meta(entry.written_at)));
        }

        for chunk in state.read_chunks.iter().rev() {
            if let Some(location) = chunk.locations.get(key) {
                if !is_live(location.written_at, now, expiry_millis) {
                    return Err(Error::KeyNotFound);
                }
                let value = chunk.read(location)?;
                return Ok((value, meta(location.written_at)));
            }
        }

        Err(Error::KeyNotFound)
    }

    fn info(&self) -> Info {
        self.inner.lock().info()
    }

    fn close(&self) -> Result<(), Error> {
        let mut state = self.inner.lock();
        if state.closed {
            return Ok(());
        }

        state.closed = true;
        self.inner.reaper.cancel();
        state.write_log.file.sync_all()?;

        info!(dir = %self.inner.dir.display(), "Closed database");
        Ok(())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expiry_millis(&self) -> u64 {
        as_millis(self.expiry)
    }

    fn remove_expired_chunks(&self) -> usize {
        let now = now_millis();
        let expiry_millis = self.expiry_millis();

        let mut state = self.lock();
        if state.closed {
            return 0;
        }

        let (expired, live): (Vec<_>, Vec<_>) = state
            .read_chunks
            .drain(..)
            .partition(|chunk| chunk.is_expired(now, expiry_millis));
        state.read_chunks = live;

        for chunk in &expired {
            if let Err(e) = fs::remove_file(&chunk.path) {
                warn!(path = %chunk.path.display(), "Failed to remove expired chunk: {}", e);
            }
        }

        expired.len()
    }
}

impl State {
    fn contains_live(&self, key: &[u8], now: u64, expiry_millis: u64) -> bool {
        if let Some(entry) = self.write_log.entries.get(key) {
            return is_live(entry.written_at, now, expiry_millis);
        }

        // Newer chunks shadow older ones.
        self.read_chunks
            .iter()
            .rev()
            .find_map(|chunk| chunk.locations.get(key))
            .map_or(false, |location| {
                is_live(location.written_at, now, expiry_millis)
            })
    }

    fn rotate(&mut self, dir: &Path) -> io::Result<()> {
        self.write_log.file.sync_all()?;

        let next = WriteLog::create(dir, self.write_log.seq + 1)?;
        let sealed = std::mem::replace(&mut self.write_log, next);

        debug!(path = %sealed.path.display(), size = sealed.size, "Sealed write log");
        self.read_chunks.push(sealed.seal()?);

        Ok(())
    }

    fn info(&self) -> Info {
        let write_log_keys = self.write_log.entries.len() as u64;
        let read_log_keys = self
            .read_chunks
            .iter()
            .map(|chunk| chunk.locations.len() as u64)
            .sum();

        Info {
            read_chunks: self.read_chunks.len() as u64,
            total_read_log_size: self.read_chunks.iter().map(|chunk| chunk.size).sum(),
            write_log_keys,
            read_log_keys,
            total_keys: write_log_keys + read_log_keys,
        }
    }
}

impl WriteLog {
    fn create(dir: &Path, seq: u64) -> io::Result<WriteLog> {
        let path = chunk_path(dir, seq);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();

        Ok(WriteLog {
            seq,
            path,
            file,
            size,
            entries: HashMap::new(),
        })
    }

    fn recover(dir: &Path, seq: u64) -> Result<WriteLog, Error> {
        let path = chunk_path(dir, seq);
        let data = Bytes::from(fs::read(&path)?);
        let (records, valid) = scan_records(&data);

        if valid < data.len() {
            warn!(
                path = %path.display(),
                discarded = data.len() - valid,
                "Discarding partially written record at the end of the write log"
            );
            OpenOptions::new()
                .write(true)
                .open(&path)?
                .set_len(valid as u64)?;
        }

        let mut log = WriteLog::create(dir, seq)?;
        for record in records {
            log.entries.insert(
                record.key,
                Entry {
                    value: record.value,
                    offset: record.value_offset,
                    written_at: record.written_at,
                },
            );
        }

        Ok(log)
    }

    fn append(&mut self, key: Bytes, value: Bytes, written_at: u64) -> io::Result<()> {
        let mut record = BytesMut::with_capacity(HEADER_LEN + key.len() + value.len());
        record.put_u32(key.len() as u32);
        record.put_u32(value.len() as u32);
        record.put_u64(written_at);
        record.put_slice(&key);
        record.put_slice(&value);

        self.file.write_all(&record)?;

        let offset = self.size + (HEADER_LEN + key.len()) as u64;
        self.size += record.len() as u64;
        self.entries.insert(
            key,
            Entry {
                value,
                offset,
                written_at,
            },
        );

        Ok(())
    }

    fn seal(self) -> io::Result<Chunk> {
        let file = File::open(&self.path)?;
        let newest = self
            .entries
            .values()
            .map(|entry| entry.written_at)
            .max()
            .unwrap_or(0);
        let locations = self
            .entries
            .into_iter()
            .map(|(key, entry)| {
                let location = Location {
                    offset: entry.offset,
                    len: entry.value.len() as u32,
                    written_at: entry.written_at,
                };
                (key, location)
            })
            .collect();

        Ok(Chunk {
            path: self.path,
            file,
            size: self.size,
            newest,
            locations,
        })
    }
}

impl Chunk {
    fn load(path: PathBuf) -> Result<Chunk, Error> {
        let data = Bytes::from(fs::read(&path)?);
        let (records, valid) = scan_records(&data);

        if valid < data.len() {
            return Err(Error::Corrupt {
                path: path.display().to_string(),
                reason: format!("{} trailing bytes", data.len() - valid),
            });
        }

        let mut newest = 0;
        let mut locations = HashMap::with_capacity(records.len());
        for record in records {
            newest = newest.max(record.written_at);
            locations.insert(
                record.key,
                Location {
                    offset: record.value_offset,
                    len: record.value.len() as u32,
                    written_at: record.written_at,
                },
            );
        }

        Ok(Chunk {
            file: File::open(&path)?,
            path,
            size: data.len() as u64,
            newest,
            locations,
        })
    }

    fn read(&self, location: &Location) -> io::Result<Bytes> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(location.offset))?;

        let mut value = vec![0; location.len as usize];
        file.read_exact(&mut value)?;

        Ok(Bytes::from(value))
    }

    fn is_expired(&self, now: u64, expiry_millis: u64) -> bool {
        !is_live(self.newest, now, expiry_millis)
    }
}

async fn reap_expired_chunks(inner: Arc<Inner>) {
    let interval = inner.expiry.clamp(MIN_REAP_INTERVAL, MAX_REAP_INTERVAL);

    loop {
        tokio::select! {
            _ = inner.reaper.cancelled() => break,
            _ = sleep(interval) => {}
        }

        let removed = inner.remove_expired_chunks();
        if removed > 0 {
            debug!(removed, "Removed expired chunks");
        }
    }
}

// Returns the complete records in `data` and the length of the prefix they cover.
fn scan_records(data: &[u8]) -> (Vec<Record>, usize) {
    let mut records = vec![];
    let mut position = 0;

    while data.len() - position >= HEADER_LEN {
        let mut header = &data[position..position + HEADER_LEN];
        let key_len = header.get_u32() as usize;
        let value_len = header.get_u32() as usize;
        let written_at = header.get_u64();

        let key_start = position + HEADER_LEN;
        let value_start = key_start + key_len;
        let end = value_start + value_len;
        if end > data.len() {
            break;
        }

        // Copy so that the index does not keep the whole chunk alive.
        records.push(Record {
            key: Bytes::copy_from_slice(&data[key_start..value_start]),
            value: Bytes::copy_from_slice(&data[value_start..end]),
            value_offset: value_start as u64,
            written_at,
        });
        position = end;
    }

    (records, position)
}

fn list_chunks(dir: &Path) -> io::Result<Vec<u64>> {
    let mut seqs = vec![];
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let seq = name
            .to_str()
            .and_then(|name| name.strip_prefix("chunk-"))
            .and_then(|name| name.strip_suffix(".log"))
            .and_then(|seq| seq.parse::<u64>().ok());
        if let Some(seq) = seq {
            seqs.push(seq);
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}

fn chunk_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("chunk-{:08}.log", seq))
}

fn is_live(written_at: u64, now: u64, expiry_millis: u64) -> bool {
    now.saturating_sub(written_at) < expiry_millis
}

fn meta(written_at: u64) -> Meta {
    Meta {
        written_at: UNIX_EPOCH + Duration::from_millis(written_at),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(as_millis)
        .unwrap_or(0)
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
