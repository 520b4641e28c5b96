//! # raft-storage
//!
//! why: keep the raft log, term and vote across restarts using standard rust fs apis
//! relations: implements raft-core's RaftLog, handed to ConsensusManager::new
//! what: FileLog, a json-lines log file plus an atomically replaced meta file

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use raft_core::{HardState, LogEntry, RaftLog};

const LOG_FILE: &str = "log.jsonl";
const META_FILE: &str = "meta.json";

/// file-backed durable log
///
/// stores raft state in a directory with:
/// - log.jsonl: one json log entry per line, appended and fsynced in place
/// - meta.json: current term and voted_for
///
/// entries are cached in memory after `open`, so reads never touch disk.
pub struct FileLog {
    /// directory path for storing state files
    dir: PathBuf,
    entries: Vec<LogEntry>,
    hard_state: HardState,
    /// append handle on log.jsonl, reopened whenever the file is replaced
    writer: File,
    /// byte length of log.jsonl covering exactly the acknowledged entries
    synced_len: u64,
}

impl FileLog {
    /// open the log stored in `dir`, creating the directory if it doesn't exist
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let hard_state = load_hard_state(&dir.join(META_FILE))?;
        let (entries, synced_len) = load_entries(&dir.join(LOG_FILE))?;
        let writer = open_for_append(&dir.join(LOG_FILE))?;

        tracing::debug!(
            dir = %dir.display(),
            entries = entries.len(),
            term = hard_state.current_term,
            "Opened file log"
        );
        Ok(Self {
            dir,
            entries,
            hard_state,
            writer,
            synced_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// atomic write: write to temp file then rename over `name`
    fn replace_file(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        let temp_path = self.dir.join(format!("{name}.tmp"));
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.dir.join(name))
    }
}

impl RaftLog for FileLog {
    fn append(&mut self, mut entry: LogEntry) -> io::Result<u64> {
        entry.index = self.last_index() + 1;

        let mut line = serde_json::to_vec(&entry).map_err(invalid_data)?;
        line.push(b'\n');
        let written = self
            .writer
            .write_all(&line)
            .and_then(|()| self.writer.sync_data());
        if let Err(e) = written {
            // an unacknowledged line must not survive to collide with the next append
            if let Err(rollback) = self.writer.set_len(self.synced_len) {
                tracing::error!(
                    dir = %self.dir.display(),
                    error = %rollback,
                    "Failed to roll back partial append"
                );
            }
            return Err(e);
        }
        self.synced_len += line.len() as u64;

        let index = entry.index;
        self.entries.push(entry);
        Ok(index)
    }

    fn entry(&self, index: u64) -> Option<&LogEntry> {
        let position = usize::try_from(index.checked_sub(1)?).ok()?;
        self.entries.get(position)
    }

    fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    fn truncate_after(&mut self, index: u64) -> io::Result<()> {
        if index >= self.last_index() {
            return Ok(());
        }
        let keep = index as usize;

        let mut contents = Vec::new();
        for entry in &self.entries[..keep] {
            serde_json::to_writer(&mut contents, entry).map_err(invalid_data)?;
            contents.push(b'\n');
        }
        self.replace_file(LOG_FILE, &contents)?;
        // the old handle still points at the replaced file
        self.writer = open_for_append(&self.log_path())?;
        self.synced_len = contents.len() as u64;

        tracing::debug!(
            dir = %self.dir.display(),
            dropped = self.entries.len() - keep,
            last_index = index,
            "Truncated file log"
        );
        self.entries.truncate(keep);
        Ok(())
    }

    fn save_hard_state(&mut self, state: &HardState) -> io::Result<()> {
        if *state == self.hard_state {
            return Ok(());
        }
        let json = serde_json::to_vec_pretty(state).map_err(invalid_data)?;
        self.replace_file(META_FILE, &json)?;
        self.hard_state = state.clone();
        Ok(())
    }

    fn hard_state(&self) -> io::Result<HardState> {
        Ok(self.hard_state.clone())
    }
}

fn invalid_data<E>(error: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, error)
}

fn open_for_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn load_hard_state(path: &Path) -> io::Result<HardState> {
    if !path.exists() {
        return Ok(HardState::default()); // default for new nodes
    }
    let contents = fs::read(path)?;
    serde_json::from_slice(&contents).map_err(invalid_data)
}

/// Parse log.jsonl, returning the entries and the byte length they occupy.
///
/// Every acknowledged line ends in a newline. An unterminated final line is
/// the remains of an append that crashed before its fsync; it is cut off the
/// file. Malformed terminated lines are corruption.
fn load_entries(path: &Path) -> io::Result<(Vec<LogEntry>, u64)> {
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }

    let contents = fs::read(path)?;
    let mut entries: Vec<LogEntry> = Vec::new();
    let mut synced_len = 0usize;
    for (number, line) in contents.split_inclusive(|b| *b == b'\n').enumerate() {
        let Some(body) = line.strip_suffix(b"\n") else {
            tracing::warn!(
                path = %path.display(),
                line = number + 1,
                bytes = line.len(),
                "Discarding torn tail of log file"
            );
            break;
        };
        synced_len += line.len();
        if body.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let entry: LogEntry = serde_json::from_slice(body)
            .map_err(|e| invalid_data(format!("line {}: {e}", number + 1)))?;

        let expected = entries.len() as u64 + 1;
        if entry.index != expected {
            return Err(invalid_data(format!(
                "line {}: expected index {expected}, found {}",
                number + 1,
                entry.index
            )));
        }
        entries.push(entry);
    }

    if synced_len < contents.len() {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(synced_len as u64)?;
        file.sync_all()?;
    }
    Ok((entries, synced_len as u64))
}
