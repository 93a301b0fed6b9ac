//! Content-addressed persistent tier
//!
//! A directory of value files indexed by an append-only journal. Each entry has
//! a fixed number of value slots. Writers go through an [`Editor`] which
//! writes to temporary files and publishes them atomically on
//! [`commit`](Editor::commit); at most one editor can be open per key.
//!
//! Index bookkeeping is synchronous and guarded by a mutex, value bytes are
//! read and written through `tokio::fs`.

use crate::error::{FetchError, Result};
use crate::journal::{corrupt, Header, Record};
use lru::LruCache;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

const JOURNAL_FILE: &str = "journal";
const JOURNAL_FILE_TMP: &str = "journal.tmp";
const REDUNDANT_OP_COMPACT_THRESHOLD: usize = 2000;
const MAX_KEY_LEN: usize = 120;

#[derive(Debug, Clone)]
struct Entry {
    lengths: Vec<u64>,
    /// True once the entry has been committed at least once
    readable: bool,
    /// True while an editor is open for this key
    editing: bool,
}

impl Entry {
    fn new(value_count: usize) -> Self {
        Self {
            lengths: vec![0; value_count],
            readable: false,
            editing: false,
        }
    }

    fn total_len(&self) -> u64 {
        self.lengths.iter().sum()
    }
}

struct State {
    entries: LruCache<String, Entry>,
    size: u64,
    journal: Option<BufWriter<File>>,
    redundant_ops: usize,
}

struct StoreInner {
    directory: PathBuf,
    header: Header,
    max_size: u64,
    state: Mutex<State>,
}

/// Journal-indexed disk cache with single-writer-per-key semantics
#[derive(Clone)]
pub struct DiskStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStore")
            .field("directory", &self.inner.directory)
            .field("max_size", &self.inner.max_size)
            .finish()
    }
}

impl DiskStore {
    /// Open the store in `directory`, creating it if needed.
    ///
    /// An existing journal written with a different `app_version` or
    /// `value_count` (or one that is unreadable) causes the directory to be
    /// wiped, so stale entries are never served.
    pub async fn open(
        directory: impl Into<PathBuf>,
        app_version: u32,
        value_count: usize,
        max_size: u64,
    ) -> Result<Self> {
        let directory = directory.into();
        let header = Header {
            app_version,
            value_count: value_count.max(1),
        };
        tokio::task::spawn_blocking(move || Self::open_blocking(directory, header, max_size))
            .await
            .map_err(|e| FetchError::Io(Box::new(io::Error::other(e))))?
    }

    fn open_blocking(directory: PathBuf, header: Header, max_size: u64) -> Result<Self> {
        fs::create_dir_all(&directory)?;

        let state = match replay_journal(&directory, header) {
            Ok(Some(state)) => state,
            Ok(None) => fresh_state(&directory, header)?,
            Err(e) => {
                warn!(directory = ?directory, error = %e, "Disk cache journal unusable, wiping cache");
                fs::remove_dir_all(&directory)?;
                fs::create_dir_all(&directory)?;
                fresh_state(&directory, header)?
            }
        };

        info!(
            directory = ?directory,
            entries = state.entries.len(),
            size = state.size,
            max_size,
            "Disk cache opened"
        );

        let store = Self {
            inner: Arc::new(StoreInner {
                directory,
                header,
                max_size,
                state: Mutex::new(state),
            }),
        };
        {
            let mut state = store.inner.lock();
            store.inner.trim_to_size(&mut state, None)?;
        }
        Ok(store)
    }

    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    pub fn max_size(&self) -> u64 {
        self.inner.max_size
    }

    /// Bytes currently stored in committed entries
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Number of entries known to the index, including ones being written
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().journal.is_none()
    }

    /// Hold the index lock until the returned guard is dropped
    #[cfg(test)]
    pub(crate) fn hold_index(&self) -> impl Sized + '_ {
        self.inner.lock()
    }

    /// Snapshot of a committed entry, `None` if absent or never committed
    pub async fn lookup(&self, key: &str) -> Result<Option<Snapshot>> {
        validate_key(key)?;

        let lengths = {
            let mut state = self.inner.lock();
            if state.journal.is_none() {
                return Err(FetchError::StoreClosed);
            }
            let lengths = match state.entries.get(key) {
                Some(entry) if entry.readable => entry.lengths.clone(),
                _ => return Ok(None),
            };
            state.redundant_ops += 1;
            self.inner.append(&mut state, &Record::Read(key.to_string()))?;
            if state.needs_compaction() {
                self.inner.rebuild_journal(&mut state)?;
            }
            lengths
        };

        let mut files = Vec::with_capacity(lengths.len());
        for index in 0..lengths.len() {
            match tokio::fs::File::open(self.inner.clean_path(key, index)).await {
                Ok(file) => files.push(file),
                // Evicted or removed between the index read and the open
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Some(Snapshot {
            key: key.to_string(),
            files,
            lengths,
        }))
    }

    /// Open an editor for `key`, `None` if another editor already holds it
    pub fn edit(&self, key: &str) -> Result<Option<Editor>> {
        validate_key(key)?;

        let mut state = self.inner.lock();
        if state.journal.is_none() {
            return Err(FetchError::StoreClosed);
        }

        let value_count = self.inner.header.value_count;
        let entry = state
            .entries
            .get_or_insert_mut(key.to_string(), || Entry::new(value_count));
        if entry.editing {
            return Ok(None);
        }
        entry.editing = true;
        let is_new = !entry.readable;

        // Flushed straight away so a crash mid-write leaves a DIRTY marker
        self.inner.append(&mut state, &Record::Dirty(key.to_string()))?;
        self.inner.flush_journal(&mut state)?;

        Ok(Some(Editor {
            store: Arc::clone(&self.inner),
            key: key.to_string(),
            written: vec![false; value_count],
            is_new,
            done: false,
        }))
    }

    /// Drop a committed entry. Entries with an open editor are left alone.
    pub fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;

        let mut state = self.inner.lock();
        if state.journal.is_none() {
            return Err(FetchError::StoreClosed);
        }
        match state.entries.peek(key) {
            Some(entry) if !entry.editing => {}
            _ => return Ok(false),
        }
        self.inner.remove_entry(&mut state, key)?;
        if state.needs_compaction() {
            self.inner.rebuild_journal(&mut state)?;
        }
        Ok(true)
    }

    /// Trim to size and force the journal to stable storage
    pub fn flush(&self) -> Result<()> {
        let mut state = self.inner.lock();
        if state.journal.is_none() {
            return Err(FetchError::StoreClosed);
        }
        self.inner.trim_to_size(&mut state, None)?;
        self.inner.flush_journal(&mut state)?;
        if let Some(journal) = state.journal.as_mut() {
            journal.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Flush and close. Open editors are discarded when they finish.
    pub fn close(&self) -> Result<()> {
        let mut state = self.inner.lock();
        if state.journal.is_none() {
            return Ok(());
        }
        self.inner.trim_to_size(&mut state, None)?;
        self.inner.flush_journal(&mut state)?;
        state.journal = None;
        info!(directory = ?self.inner.directory, "Disk cache closed");
        Ok(())
    }

    /// Close the store and delete everything it wrote
    pub fn delete(&self) -> Result<()> {
        self.close()?;
        fs::remove_dir_all(&self.inner.directory)?;
        Ok(())
    }
}

impl StoreInner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn clean_path(&self, key: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{}.{}", key, index))
    }

    fn dirty_path(&self, key: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{}.{}.tmp", key, index))
    }

    fn append(&self, state: &mut State, record: &Record) -> Result<()> {
        match state.journal.as_mut() {
            Some(journal) => {
                writeln!(journal, "{}", record)?;
                Ok(())
            }
            None => Err(FetchError::StoreClosed),
        }
    }

    fn flush_journal(&self, state: &mut State) -> Result<()> {
        if let Some(journal) = state.journal.as_mut() {
            journal.flush()?;
        }
        Ok(())
    }

    fn remove_entry(&self, state: &mut State, key: &str) -> Result<()> {
        let Some(entry) = state.entries.pop(key) else {
            return Ok(());
        };
        for index in 0..entry.lengths.len() {
            remove_if_exists(&self.clean_path(key, index))?;
        }
        state.size -= entry.total_len();
        state.redundant_ops += 1;
        self.append(state, &Record::Remove(key.to_string()))?;
        Ok(())
    }

    /// Evict least-recently-used entries until the store fits `max_size`,
    /// never evicting `keep`
    fn trim_to_size(&self, state: &mut State, keep: Option<&str>) -> Result<()> {
        while state.size > self.max_size {
            let victim = state
                .entries
                .iter()
                .rev()
                .find(|(key, entry)| {
                    !entry.editing && entry.readable && keep != Some(key.as_str())
                })
                .map(|(key, _)| key.clone());
            let Some(key) = victim else {
                break;
            };
            debug!(disk_key = %key, "Evicting disk cache entry");
            self.remove_entry(state, &key)?;
        }
        Ok(())
    }

    /// Rewrite the journal with one record per live entry
    fn rebuild_journal(&self, state: &mut State) -> Result<()> {
        if let Some(mut journal) = state.journal.take() {
            journal.flush()?;
        }

        let tmp_path = self.directory.join(JOURNAL_FILE_TMP);
        {
            let mut out = BufWriter::new(File::create(&tmp_path)?);
            self.header.write_to(&mut out)?;
            for (key, entry) in state.entries.iter().rev() {
                let record = if entry.editing {
                    Record::Dirty(key.clone())
                } else {
                    Record::Clean(key.clone(), entry.lengths.clone())
                };
                writeln!(out, "{}", record)?;
            }
            out.flush()?;
        }
        fs::rename(&tmp_path, self.directory.join(JOURNAL_FILE))?;

        state.journal = Some(open_journal_for_append(&self.directory)?);
        state.redundant_ops = 0;
        debug!(directory = ?self.directory, entries = state.entries.len(), "Rebuilt disk cache journal");
        Ok(())
    }

    /// Move written slots into place, returning the entry's new lengths
    fn publish(&self, key: &str, previous: &[u64]) -> io::Result<Vec<u64>> {
        let mut lengths = previous.to_vec();
        for (index, length) in lengths.iter_mut().enumerate() {
            let dirty = self.dirty_path(key, index);
            if dirty.exists() {
                let clean = self.clean_path(key, index);
                fs::rename(&dirty, &clean)?;
                *length = fs::metadata(&clean)?.len();
            }
        }
        Ok(lengths)
    }

    fn discard_dirty(&self, key: &str) -> io::Result<()> {
        for index in 0..self.header.value_count {
            remove_if_exists(&self.dirty_path(key, index))?;
        }
        Ok(())
    }

    /// Forget an entry whose edit could not be finished, along with every
    /// file it may have left behind
    fn drop_failed_edit(&self, state: &mut State, key: &str, previous: &Entry) {
        state.entries.pop(key);
        state.size -= previous.total_len();
        for index in 0..self.header.value_count {
            for path in [self.dirty_path(key, index), self.clean_path(key, index)] {
                if let Err(e) = remove_if_exists(&path) {
                    debug!(path = ?path, error = %e, "Failed to remove disk cache file");
                }
            }
        }
        state.redundant_ops += 1;
        if let Err(e) = self
            .append(state, &Record::Remove(key.to_string()))
            .and_then(|()| self.flush_journal(state))
        {
            debug!(disk_key = %key, error = %e, "Failed to journal dropped entry");
        }
    }

    fn complete_edit(&self, editor: &mut Editor, success: bool) -> Result<()> {
        editor.done = true;
        let key = editor.key.as_str();
        let value_count = self.header.value_count;
        let mut state = self.lock();

        if state.journal.is_none() {
            state.entries.pop(key);
            if let Err(e) = self.discard_dirty(key) {
                debug!(disk_key = %key, error = %e, "Failed to discard edit of closed store");
            }
            return Err(FetchError::StoreClosed);
        }

        if success && editor.is_new {
            let missing = (0..value_count)
                .find(|&i| !editor.written[i] || !self.dirty_path(key, i).exists());
            if let Some(index) = missing {
                drop(state);
                self.complete_edit(editor, false)?;
                return Err(FetchError::Io(Box::new(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("new entry has no value for slot {}", index),
                ))));
            }
        }

        let Some(previous) = state.entries.peek(key).cloned() else {
            return Ok(());
        };

        let finished = if success {
            self.publish(key, &previous.lengths)
        } else {
            self.discard_dirty(key).map(|()| previous.lengths.clone())
        };
        let lengths = match finished {
            Ok(lengths) => lengths,
            Err(e) => {
                warn!(disk_key = %key, error = %e, "Failed to finish disk edit, dropping entry");
                self.drop_failed_edit(&mut state, key, &previous);
                return Err(e.into());
            }
        };

        state.size = state.size - previous.total_len() + lengths.iter().sum::<u64>();
        state.redundant_ops += 1;

        if previous.readable || success {
            let entry = Entry {
                lengths,
                readable: true,
                editing: false,
            };
            let record = Record::Clean(key.to_string(), entry.lengths.clone());
            state.entries.put(key.to_string(), entry);
            self.append(&mut state, &record)?;
        } else {
            state.entries.pop(key);
            self.append(&mut state, &Record::Remove(key.to_string()))?;
        }
        self.flush_journal(&mut state)?;

        // The entry just published stays readable until the next trim, even
        // when it alone is larger than the store.
        if state.size > self.max_size {
            self.trim_to_size(&mut state, success.then_some(key))?;
        }
        if state.needs_compaction() {
            self.rebuild_journal(&mut state)?;
        }
        Ok(())
    }
}

impl State {
    fn needs_compaction(&self) -> bool {
        self.redundant_ops >= REDUNDANT_OP_COMPACT_THRESHOLD
            && self.redundant_ops >= self.entries.len()
    }
}

/// Read handle over the value files of one committed entry
#[derive(Debug)]
pub struct Snapshot {
    key: String,
    files: Vec<tokio::fs::File>,
    lengths: Vec<u64>,
}

impl Snapshot {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Length in bytes of the value in `index`
    pub fn length(&self, index: usize) -> Option<u64> {
        self.lengths.get(index).copied()
    }

    /// Read the whole value in `index`
    pub async fn read(&mut self, index: usize) -> Result<Vec<u8>> {
        let len = self.length(index).unwrap_or(0) as usize;
        let file = self.files.get_mut(index).ok_or_else(|| {
            FetchError::Io(Box::new(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no value slot {}", index),
            )))
        })?;
        let mut data = Vec::with_capacity(len);
        file.read_to_end(&mut data).await?;
        Ok(data)
    }
}

/// Exclusive writer for one disk key.
///
/// Dropping an editor without calling [`commit`](Self::commit) aborts it.
pub struct Editor {
    store: Arc<StoreInner>,
    key: String,
    written: Vec<bool>,
    is_new: bool,
    done: bool,
}

impl std::fmt::Debug for Editor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Editor")
            .field("key", &self.key)
            .field("is_new", &self.is_new)
            .finish()
    }
}

impl Editor {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Create (or truncate) the temporary file backing slot `index`.
    ///
    /// Callers must flush the returned file before committing.
    pub async fn new_output(&mut self, index: usize) -> Result<tokio::fs::File> {
        if index >= self.written.len() {
            return Err(FetchError::Io(Box::new(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no value slot {}", index),
            ))));
        }
        let file = tokio::fs::File::create(self.store.dirty_path(&self.key, index)).await?;
        self.written[index] = true;
        Ok(file)
    }

    /// Publish written slots. A new entry must have every slot written.
    pub fn commit(mut self) -> Result<()> {
        let store = Arc::clone(&self.store);
        store.complete_edit(&mut self, true)
    }

    /// Discard written slots, leaving any previous value visible
    pub fn abort(mut self) -> Result<()> {
        let store = Arc::clone(&self.store);
        store.complete_edit(&mut self, false)
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if !self.done {
            let store = Arc::clone(&self.store);
            if let Err(e) = store.complete_edit(self, false) {
                debug!(disk_key = %self.key, error = %e, "Failed to abort dropped editor");
            }
        }
    }
}

fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(FetchError::Io(Box::new(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid disk key: {:?}", key),
        ))))
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn open_journal_for_append(directory: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(directory.join(JOURNAL_FILE))?;
    Ok(BufWriter::new(file))
}

fn fresh_state(directory: &Path, header: Header) -> Result<State> {
    let tmp_path = directory.join(JOURNAL_FILE_TMP);
    {
        let mut out = BufWriter::new(File::create(&tmp_path)?);
        header.write_to(&mut out)?;
        out.flush()?;
    }
    fs::rename(&tmp_path, directory.join(JOURNAL_FILE))?;

    Ok(State {
        entries: LruCache::unbounded(),
        size: 0,
        journal: Some(open_journal_for_append(directory)?),
        redundant_ops: 0,
    })
}

/// Rebuild the index from an existing journal, `Ok(None)` if there is none
fn replay_journal(directory: &Path, header: Header) -> io::Result<Option<State>> {
    let path = directory.join(JOURNAL_FILE);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut lines = BufReader::new(file).lines();
    Header::read_from(&mut lines, header)?;

    let mut entries: LruCache<String, Entry> = LruCache::unbounded();
    let mut line_count = 0usize;
    for line in lines {
        let line = line?;
        let record = Record::parse(&line, header.value_count)?;
        line_count += 1;

        match record {
            Record::Dirty(key) => {
                entries
                    .get_or_insert_mut(key, || Entry::new(header.value_count))
                    .editing = true;
            }
            Record::Clean(key, lengths) => {
                let entry = entries.get_or_insert_mut(key, || Entry::new(header.value_count));
                entry.lengths = lengths;
                entry.readable = true;
                entry.editing = false;
            }
            Record::Remove(key) => {
                entries.pop(&key);
            }
            Record::Read(key) => {
                entries.get(&key);
            }
        }
    }

    // Entries whose last record is DIRTY were being written when the
    // process stopped: their files cannot be trusted.
    let abandoned: Vec<String> = entries
        .iter()
        .filter(|(_, entry)| entry.editing)
        .map(|(key, _)| key.clone())
        .collect();
    for key in &abandoned {
        entries.pop(key);
        for index in 0..header.value_count {
            remove_if_exists(&directory.join(format!("{}.{}", key, index)))?;
            remove_if_exists(&directory.join(format!("{}.{}.tmp", key, index)))?;
        }
    }

    for (key, _) in entries.iter() {
        if !directory.join(format!("{}.0", key)).exists() {
            return Err(corrupt(format!("missing value file for {}", key)));
        }
    }

    let size = entries.iter().map(|(_, entry)| entry.total_len()).sum();
    let redundant_ops = line_count.saturating_sub(entries.len());

    Ok(Some(State {
        entries,
        size,
        journal: Some(open_journal_for_append(directory)?),
        redundant_ops,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    async fn write_entry(store: &DiskStore, key: &str, data: &[u8]) {
        let mut editor = store.edit(key).unwrap().unwrap();
        let mut out = editor.new_output(0).await.unwrap();
        out.write_all(data).await.unwrap();
        out.flush().await.unwrap();
        drop(out);
        editor.commit().unwrap();
    }

    async fn read_entry(store: &DiskStore, key: &str) -> Option<Vec<u8>> {
        let mut snapshot = store.lookup(key).await.unwrap()?;
        Some(snapshot.read(0).await.unwrap())
    }

    #[tokio::test]
    async fn test_commit_then_lookup() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1, 1, 1024).await.unwrap();

        assert!(store.lookup("abc").await.unwrap().is_none());
        write_entry(&store, "abc", b"hello").await;

        assert_eq!(read_entry(&store, "abc").await.unwrap(), b"hello");
        assert_eq!(store.size(), 5);
        let snapshot = store.lookup("abc").await.unwrap().unwrap();
        assert_eq!(snapshot.key(), "abc");
        assert_eq!(snapshot.length(0), Some(5));
    }

    #[tokio::test]
    async fn test_single_editor_per_key() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1, 1, 1024).await.unwrap();

        let editor = store.edit("abc").unwrap().unwrap();
        assert!(store.edit("abc").unwrap().is_none());
        assert!(store.edit("def").unwrap().is_some());

        editor.abort().unwrap();
        assert!(store.edit("abc").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_abort_leaves_nothing_visible() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1, 1, 1024).await.unwrap();

        let mut editor = store.edit("abc").unwrap().unwrap();
        let mut out = editor.new_output(0).await.unwrap();
        out.write_all(b"partial").await.unwrap();
        out.flush().await.unwrap();
        drop(out);
        editor.abort().unwrap();

        assert!(store.lookup("abc").await.unwrap().is_none());
        assert!(!dir.path().join("abc.0.tmp").exists());
        assert!(!dir.path().join("abc.0").exists());
        assert_eq!(store.size(), 0);
    }

    #[tokio::test]
    async fn test_dropped_editor_aborts() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1, 1, 1024).await.unwrap();

        {
            let mut editor = store.edit("abc").unwrap().unwrap();
            let mut out = editor.new_output(0).await.unwrap();
            out.write_all(b"partial").await.unwrap();
            out.flush().await.unwrap();
        }

        assert!(store.lookup("abc").await.unwrap().is_none());
        assert!(store.edit("abc").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_commit_without_value_fails() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1, 1, 1024).await.unwrap();

        let editor = store.edit("abc").unwrap().unwrap();
        assert!(editor.commit().is_err());
        assert!(store.lookup("abc").await.unwrap().is_none());
        assert!(store.edit("abc").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_abort_keeps_previous_value() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1, 1, 1024).await.unwrap();
        write_entry(&store, "abc", b"first").await;

        let mut editor = store.edit("abc").unwrap().unwrap();
        let mut out = editor.new_output(0).await.unwrap();
        out.write_all(b"second").await.unwrap();
        out.flush().await.unwrap();
        drop(out);
        editor.abort().unwrap();

        assert_eq!(read_entry(&store, "abc").await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_reopen_replays_journal() {
        let dir = tempdir().unwrap();
        {
            let store = DiskStore::open(dir.path(), 7, 1, 1024).await.unwrap();
            write_entry(&store, "abc", b"hello").await;
            write_entry(&store, "def", b"world!").await;
            assert!(store.remove("abc").unwrap());
            store.close().unwrap();
            assert!(store.is_closed());
        }

        let store = DiskStore::open(dir.path(), 7, 1, 1024).await.unwrap();
        assert!(store.lookup("abc").await.unwrap().is_none());
        assert_eq!(read_entry(&store, "def").await.unwrap(), b"world!");
        assert_eq!(store.size(), 6);
    }

    #[tokio::test]
    async fn test_version_change_wipes_entries() {
        let dir = tempdir().unwrap();
        {
            let store = DiskStore::open(dir.path(), 1, 1, 1024).await.unwrap();
            write_entry(&store, "abc", b"hello").await;
            store.close().unwrap();
        }

        let store = DiskStore::open(dir.path(), 2, 1, 1024).await.unwrap();
        assert!(store.lookup("abc").await.unwrap().is_none());
        assert!(store.is_empty());
        assert!(!dir.path().join("abc.0").exists());
    }

    #[tokio::test]
    async fn test_unfinished_edit_is_discarded_on_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = DiskStore::open(dir.path(), 1, 1, 1024).await.unwrap();
            write_entry(&store, "abc", b"hello").await;
            let editor = store.edit("def").unwrap().unwrap();
            // Simulate a crash: the DIRTY record is on disk, nothing follows it
            std::mem::forget(editor);
            store.flush().unwrap();
        }

        let store = DiskStore::open(dir.path(), 1, 1, 1024).await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.lookup("def").await.unwrap().is_none());
        assert!(store.edit("def").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_trims_least_recently_used() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1, 1, 20).await.unwrap();

        write_entry(&store, "a", b"0123456789").await;
        write_entry(&store, "b", b"abcdefghij").await;
        // Touch "a" so "b" is evicted first
        assert!(store.lookup("a").await.unwrap().is_some());
        write_entry(&store, "c", b"ABCDEFGHIJ").await;

        assert!(store.size() <= 20);
        assert!(store.lookup("a").await.unwrap().is_some());
        assert!(store.lookup("b").await.unwrap().is_none());
        assert!(store.lookup("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_entry_larger_than_store_survives_its_commit() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1, 1, 4).await.unwrap();

        write_entry(&store, "big", b"0123456789").await;
        assert_eq!(read_entry(&store, "big").await.unwrap(), b"0123456789");
        assert_eq!(store.size(), 10);

        // The next commit trims it away
        write_entry(&store, "small", b"x").await;
        assert!(store.lookup("big").await.unwrap().is_none());
        assert_eq!(read_entry(&store, "small").await.unwrap(), b"x");
        assert_eq!(store.size(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_releases_key() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1, 1, 1024).await.unwrap();

        let mut editor = store.edit("abc").unwrap().unwrap();
        let mut out = editor.new_output(0).await.unwrap();
        out.write_all(b"hello").await.unwrap();
        out.flush().await.unwrap();
        drop(out);

        // A directory in the way makes publishing the value fail
        let obstruction = dir.path().join("abc.0");
        std::fs::create_dir(&obstruction).unwrap();
        assert!(editor.commit().is_err());
        std::fs::remove_dir(&obstruction).unwrap();

        assert!(store.lookup("abc").await.unwrap().is_none());
        assert!(!dir.path().join("abc.0.tmp").exists());
        assert_eq!(store.size(), 0);
        write_entry(&store, "abc", b"again").await;
        assert_eq!(read_entry(&store, "abc").await.unwrap(), b"again");
    }

    #[tokio::test]
    async fn test_failed_commit_drops_previous_value() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1, 1, 1024).await.unwrap();
        write_entry(&store, "abc", b"first").await;

        let mut editor = store.edit("abc").unwrap().unwrap();
        let mut out = editor.new_output(0).await.unwrap();
        out.write_all(b"second").await.unwrap();
        out.flush().await.unwrap();
        drop(out);

        let clean = dir.path().join("abc.0");
        std::fs::remove_file(&clean).unwrap();
        std::fs::create_dir(&clean).unwrap();
        assert!(editor.commit().is_err());
        std::fs::remove_dir(&clean).unwrap();

        assert!(store.lookup("abc").await.unwrap().is_none());
        assert_eq!(store.size(), 0);
        assert!(store.edit("abc").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1, 1, 1024).await.unwrap();
        store.close().unwrap();

        assert!(matches!(store.lookup("abc").await, Err(FetchError::StoreClosed)));
        assert!(matches!(store.edit("abc"), Err(FetchError::StoreClosed)));
        assert!(matches!(store.flush(), Err(FetchError::StoreClosed)));
        assert!(store.close().is_ok());
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1, 1, 1024).await.unwrap();

        assert!(store.edit("../escape").is_err());
        assert!(store.edit("UPPER").is_err());
        assert!(store.lookup("").await.is_err());
    }

    #[tokio::test]
    async fn test_compaction_keeps_entries() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1, 1, 1024).await.unwrap();
        write_entry(&store, "abc", b"hello").await;

        for _ in 0..(REDUNDANT_OP_COMPACT_THRESHOLD + 10) {
            assert!(store.lookup("abc").await.unwrap().is_some());
        }
        store.close().unwrap();

        let journal = std::fs::read_to_string(dir.path().join(JOURNAL_FILE)).unwrap();
        assert!(journal.lines().count() < 100);

        let store = DiskStore::open(dir.path(), 1, 1, 1024).await.unwrap();
        assert_eq!(read_entry(&store, "abc").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_delete_removes_directory() {
        let dir = tempdir().unwrap();
        let cache_dir = dir.path().join("thumb");
        let store = DiskStore::open(&cache_dir, 1, 1, 1024).await.unwrap();
        write_entry(&store, "abc", b"hello").await;

        store.delete().unwrap();
        assert!(!cache_dir.exists());
        assert!(store.is_closed());
    }
}
