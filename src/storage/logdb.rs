use crate::error::{Error, Result};
use crate::{errdata, errinput};

use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// A log-structured key/value store. Writes and erases are buffered in
/// memory and made durable by appending a single frame to an append-only
/// log file on flush. The full data set is kept in an in-memory index and
/// rebuilt by replaying the log when opened. All live keys and values must
/// fit in memory.
///
/// The log file is a sequence of frames, each of which contains:
///
/// - 4 bytes magic: `0xCC 0xC4 0xE6 0xB0`.
/// - N records, each of which contains:
///   - 1 byte mode: 1=insert/overwrite, 2=erase.
///   - Key length as a compact integer (max 4 KiB), and the key bytes.
///   - If mode=1: value length as a compact integer (max 1 MiB), and the
///     value bytes.
/// - 1 byte frame terminator: mode 0.
/// - 8 bytes checksum.
///
/// The checksum is the first 8 bytes of a SHA-256 computed over every
/// record of every frame since the file was created: each record
/// contributes its mode byte, its key length as a fixed 4-byte
/// little-endian integer, the key bytes, and for insert records the value
/// length (again 4-byte little-endian) and value bytes; the frame
/// terminator contributes its mode byte. The hash state carries across
/// frames, so a frame only verifies when every frame before it is intact.
/// Note that the hash absorbs fixed-width lengths while the disk carries
/// compact integers.
///
/// A frame is applied on load only if it is complete and its checksum
/// verifies; otherwise the tail of the file is a torn write, which is
/// ignored but not truncated. A subsequent flush appends after it.
///
/// All state is guarded by a single coarse mutex, held for the duration of
/// every public operation, including flush I/O. The design is
/// single-writer: an exclusive file lock is taken for read-write opens, a
/// shared lock for read-only opens.
pub struct LogDb {
    inner: Mutex<Inner>,
}

/// Frame header magic.
const MAGIC: [u8; 4] = [0xcc, 0xc4, 0xe6, 0xb0];

/// Record modes. END terminates a frame's record list.
const MODE_END: u8 = 0;
const MODE_UPDATE: u8 = 1;
const MODE_ERASE: u8 = 2;

/// Maximum key size in bytes. Keys at or above this are rejected, both
/// when writing and when loading.
const MAX_KEY_SIZE: u64 = 4096;

/// Maximum value size in bytes, enforced like the key size.
const MAX_VALUE_SIZE: u64 = 1 << 20;

impl LogDb {
    /// Creates a new, closed database. Use [`LogDb::open`] to load a log
    /// file into it.
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::new()) }
    }

    /// Acquires the state mutex.
    fn inner(&self) -> Result<MutexGuard<'_, Inner>> {
        Ok(self.inner.lock()?)
    }

    /// Opens the log file at the given path and replays it into the
    /// in-memory index, first closing (and flushing) any previously open
    /// file. A read-only open takes a shared file lock and refuses writes;
    /// otherwise the file is opened for reading and appending under an
    /// exclusive lock, created if `create` is true.
    pub fn open(&self, path: &Path, create: bool, read_only: bool) -> Result<()> {
        self.inner()?.open(path, create, read_only)
    }

    /// Writes a key/value pair to the in-memory index and marks the key
    /// dirty. The change is not durable until the next flush. Writing a
    /// value identical to the current one succeeds without marking the key
    /// dirty. If `overwrite` is false, writing to an existing key fails.
    pub fn write(&self, key: &[u8], value: Vec<u8>, overwrite: bool) -> Result<()> {
        self.inner()?.write(key, value, overwrite)
    }

    /// Removes a key from the in-memory index and marks it dirty. Erasing
    /// an absent key succeeds without marking it dirty.
    pub fn erase(&self, key: &[u8]) -> Result<()> {
        self.inner()?.erase(key)
    }

    /// Returns the value of a key, if it exists.
    pub fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner()?.index.get(key).cloned())
    }

    /// Returns true if the key exists.
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.inner()?.index.contains_key(key))
    }

    /// Durably writes every dirty key as a single frame and syncs the
    /// file. Does nothing if no keys are dirty. On failure the dirty set
    /// is retained, so the flush can be retried.
    pub fn flush(&self) -> Result<()> {
        self.inner()?.flush()
    }

    /// Flushes and closes the database, releasing the file and its lock
    /// and clearing the in-memory state.
    pub fn close(&self) -> Result<()> {
        self.inner()?.close()
    }

    /// Returns a snapshot of the key/value pairs, in ascending key order.
    pub fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self.inner()?.index.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Returns true if there are unflushed changes.
    pub fn is_dirty(&self) -> Result<bool> {
        Ok(!self.inner()?.dirty.is_empty())
    }

    /// Returns true if a log file is open.
    pub fn is_open(&self) -> Result<bool> {
        Ok(self.inner()?.file.is_some())
    }

    /// Returns true if the database is open read-only.
    pub fn is_read_only(&self) -> Result<bool> {
        Ok(self.inner()?.read_only)
    }

    /// Returns database status.
    pub fn status(&self) -> Result<Status> {
        self.inner()?.status()
    }
}

/// Attempt to flush and close the file when the database is dropped.
impl Drop for LogDb {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            log::error!("failed to close database: {error}")
        }
    }
}

/// Database status. The byte counters are advisory: they track the live
/// data size and the cumulative record bytes ever written, e.g. to decide
/// when rewriting the log would be worthwhile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Number of live keys.
    pub keys: u64,
    /// Total size of live keys and values.
    pub used_bytes: u64,
    /// Total bytes contributed to on-disk records over the file's
    /// lifetime, including records since overwritten or erased.
    pub written_bytes: u64,
    /// Size of the log file on disk.
    pub disk_size: u64,
}

/// The mutex-guarded state of a [`LogDb`].
struct Inner {
    /// The open log file, if any. Dropping it releases the file lock.
    file: Option<File>,
    /// Whether writes are refused.
    read_only: bool,
    /// Running SHA-256 over all records committed to the file, used to
    /// chain frame checksums.
    hash: Sha256,
    /// The in-memory key/value index.
    index: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Keys whose in-memory state has not been flushed yet.
    dirty: BTreeSet<Vec<u8>>,
    /// Size of live keys and values.
    used_bytes: u64,
    /// Cumulative record bytes written to disk.
    written_bytes: u64,
}

/// A decoded record, pending commit of its frame.
enum Record {
    Update(Vec<u8>, Vec<u8>),
    Erase(Vec<u8>),
}

impl Inner {
    fn new() -> Self {
        Self {
            file: None,
            read_only: false,
            hash: Sha256::new(),
            index: BTreeMap::new(),
            dirty: BTreeSet::new(),
            used_bytes: 0,
            written_bytes: 0,
        }
    }

    /// Resets to the initial, closed state.
    fn reset(&mut self) {
        *self = Self::new();
    }

    fn open(&mut self, path: &Path, create: bool, read_only: bool) -> Result<()> {
        self.close()?;
        log::info!("Opening database {}", path.display());

        let file = if read_only {
            let file = OpenOptions::new().read(true).open(path)?;
            file.try_lock_shared()?;
            file
        } else {
            if create {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?
                }
            }
            let file =
                OpenOptions::new().read(true).write(true).create(create).truncate(false).open(path)?;
            file.try_lock_exclusive()?;
            file
        };
        self.file = Some(file);
        self.read_only = read_only;

        if let Err(err) = self.load() {
            self.reset();
            return Err(err);
        }
        log::info!("Indexed {} live keys in {}", self.index.len(), path.display());
        Ok(())
    }

    /// Replays the log file into the in-memory state. Each frame is decoded
    /// tentatively, against a copy of the running hash, and committed in
    /// full once its checksum verifies. A frame cut short by end-of-file is
    /// a torn write: it is discarded, everything before it is kept, and the
    /// load succeeds. Corrupt data (bad magic, unknown modes, oversized
    /// lengths, checksum mismatches) fails the load.
    fn load(&mut self) -> Result<()> {
        let Some(file) = &self.file else { return Ok(()) };
        let mut r = BufReader::new(file);
        r.seek(SeekFrom::Start(0))?;

        loop {
            // Frame magic. A clean end-of-file before the first byte
            // terminates the load.
            match read_byte(&mut r)? {
                None => return Ok(()),
                Some(byte) if byte != MAGIC[0] => {
                    return errdata!("invalid frame magic {byte:#04x}")
                }
                Some(_) => {}
            }
            let mut rest = [0u8; 3];
            match r.read_exact(&mut rest) {
                Ok(()) if rest == MAGIC[1..] => {}
                Ok(()) => return errdata!("invalid frame magic"),
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                    log::warn!("Discarding torn frame at end of log");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }

            // Decode records into a tentative list, feeding a copy of the
            // running hash state.
            let mut hash = self.hash.clone();
            let mut records = Vec::new();
            let mut complete = false;
            loop {
                let Some(mode) = read_byte(&mut r)? else { break };
                if mode > MODE_ERASE {
                    return errdata!("unknown record mode {mode}");
                }
                hash.update([mode]);
                if mode == MODE_END {
                    complete = true;
                    break;
                }
                let Some(key_len) = read_varint(&mut r)? else { break };
                if key_len >= MAX_KEY_SIZE {
                    return errdata!("oversized key ({key_len} bytes)");
                }
                let Some(key) = read_bytes(&mut r, key_len as usize)? else { break };
                hash.update((key_len as u32).to_le_bytes());
                hash.update(&key);
                if mode == MODE_UPDATE {
                    let Some(value_len) = read_varint(&mut r)? else { break };
                    if value_len >= MAX_VALUE_SIZE {
                        return errdata!("oversized value ({value_len} bytes)");
                    }
                    let Some(value) = read_bytes(&mut r, value_len as usize)? else { break };
                    hash.update((value_len as u32).to_le_bytes());
                    hash.update(&value);
                    records.push(Record::Update(key, value));
                } else {
                    records.push(Record::Erase(key));
                }
            }
            if !complete {
                log::warn!("Discarding torn frame at end of log");
                return Ok(());
            }

            let mut checksum = [0u8; 8];
            match r.read_exact(&mut checksum) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                    log::warn!("Discarding torn frame at end of log");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
            if hash.clone().finalize()[..8] != checksum[..] {
                return errdata!("frame checksum mismatch");
            }

            // The frame is valid: commit the hash state and apply the
            // records. Replayed records don't mark keys dirty.
            log::debug!("Replaying frame with {} records", records.len());
            self.hash = hash;
            for record in records {
                match record {
                    Record::Update(key, value) => {
                        self.written_bytes += (key.len() + value.len()) as u64;
                        if let Some(old) = self.index.get(&key) {
                            self.used_bytes -= (key.len() + old.len()) as u64;
                        }
                        self.used_bytes += (key.len() + value.len()) as u64;
                        self.index.insert(key, value);
                    }
                    Record::Erase(key) => {
                        self.written_bytes += key.len() as u64;
                        if let Some(value) = self.index.remove(&key) {
                            self.used_bytes -= (key.len() + value.len()) as u64;
                        }
                    }
                }
            }
        }
    }

    fn write(&mut self, key: &[u8], value: Vec<u8>, overwrite: bool) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if self.file.is_none() {
            return errinput!("database is not open");
        }
        if key.len() as u64 >= MAX_KEY_SIZE {
            return errinput!("key too large ({} bytes)", key.len());
        }
        if value.len() as u64 >= MAX_VALUE_SIZE {
            return errinput!("value too large ({} bytes)", value.len());
        }
        if let Some(old) = self.index.get(key) {
            if *old == value {
                return Ok(());
            }
            if !overwrite {
                return errinput!("key already exists");
            }
            self.used_bytes -= (key.len() + old.len()) as u64;
        }
        self.used_bytes += (key.len() + value.len()) as u64;
        self.index.insert(key.to_vec(), value);
        self.dirty.insert(key.to_vec());
        Ok(())
    }

    fn erase(&mut self, key: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if self.file.is_none() {
            return errinput!("database is not open");
        }
        if let Some(value) = self.index.remove(key) {
            self.used_bytes -= (key.len() + value.len()) as u64;
            self.dirty.insert(key.to_vec());
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let Some(file) = &self.file else {
            return errinput!("database is not open");
        };

        // Append after any torn tail left by an earlier crash.
        let mut tail: &File = file;
        let pos = tail.seek(SeekFrom::End(0))?;

        match self.write_frame(file) {
            Ok((hash, written)) => {
                self.hash = hash;
                self.written_bytes += written;
                self.dirty.clear();
                Ok(())
            }
            Err(err) => {
                // Drop any partially written frame, so that the retained
                // dirty set can be retried onto a clean tail.
                if let Err(trunc_err) = file.set_len(pos) {
                    log::error!("failed to remove partial frame: {trunc_err}");
                }
                Err(err)
            }
        }
    }

    /// Writes a single frame containing every dirty key, in ascending key
    /// order, and syncs the file. Returns the advanced hash state and the
    /// record bytes written, leaving in-memory state untouched.
    fn write_frame(&self, file: &File) -> Result<(Sha256, u64)> {
        let mut hash = self.hash.clone();
        let mut written = 0u64;
        let mut w = BufWriter::new(file);

        w.write_all(&MAGIC)?;
        for key in &self.dirty {
            if let Some(value) = self.index.get(key) {
                w.write_all(&[MODE_UPDATE])?;
                write_varint(&mut w, key.len() as u64)?;
                w.write_all(key)?;
                write_varint(&mut w, value.len() as u64)?;
                w.write_all(value)?;
                hash.update([MODE_UPDATE]);
                hash.update((key.len() as u32).to_le_bytes());
                hash.update(key);
                hash.update((value.len() as u32).to_le_bytes());
                hash.update(value);
                written += (key.len() + value.len()) as u64;
            } else {
                w.write_all(&[MODE_ERASE])?;
                write_varint(&mut w, key.len() as u64)?;
                w.write_all(key)?;
                hash.update([MODE_ERASE]);
                hash.update((key.len() as u32).to_le_bytes());
                hash.update(key);
                written += key.len() as u64;
            }
        }
        w.write_all(&[MODE_END])?;
        hash.update([MODE_END]);
        let checksum = hash.clone().finalize();
        w.write_all(&checksum[..8])?;
        w.flush()?;
        drop(w);
        file.sync_data()?;

        Ok((hash, written))
    }

    fn close(&mut self) -> Result<()> {
        if self.file.is_some() {
            self.flush()?;
        }
        self.reset();
        Ok(())
    }

    fn status(&self) -> Result<Status> {
        let Some(file) = &self.file else {
            return errinput!("database is not open");
        };
        Ok(Status {
            keys: self.index.len() as u64,
            used_bytes: self.used_bytes,
            written_bytes: self.written_bytes,
            disk_size: file.metadata()?.len(),
        })
    }
}

/// Reads a single byte, or returns None at end-of-file.
fn read_byte(r: &mut impl Read) -> Result<Option<u8>> {
    let mut buf = [0u8; 1];
    match r.read_exact(&mut buf) {
        Ok(()) => Ok(Some(buf[0])),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Reads an exact number of bytes, or returns None if the input ends short.
fn read_bytes(r: &mut impl Read, len: usize) -> Result<Option<Vec<u8>>> {
    let mut buf = vec![0; len];
    match r.read_exact(&mut buf) {
        Ok(()) => Ok(Some(buf)),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Decodes a compact integer: least-significant digit first, base 128, with
/// the high bit of each byte as a continuation flag. To rule out redundant
/// encodings, every digit after the first is biased by one. Returns None if
/// the input ends mid-integer.
fn read_varint(r: &mut impl Read) -> Result<Option<u64>> {
    let mut n: u64 = 0;
    let mut base: u64 = 1;
    loop {
        let Some(byte) = read_byte(r)? else { return Ok(None) };
        let digit = (byte & 0x7f) as u64 + u64::from(base > 1);
        n = match base.checked_mul(digit).and_then(|d| n.checked_add(d)) {
            Some(n) => n,
            None => return errdata!("compact integer overflow"),
        };
        if byte & 0x80 == 0 {
            return Ok(Some(n));
        }
        base = match base.checked_mul(128) {
            Some(base) => base,
            None => return errdata!("compact integer overflow"),
        };
    }
}

/// Encodes a compact integer. See [`read_varint`] for the format.
fn write_varint(w: &mut impl Write, mut n: u64) -> Result<()> {
    loop {
        let mut byte = (n % 128) as u8;
        if n > 127 {
            byte |= 0x80;
        }
        w.write_all(&[byte])?;
        if n < 128 {
            return Ok(());
        }
        n = n / 128 - 1;
    }
}
