//! Persistence adapters for last-known values.
//!
//! Records and processors flagged persistent save their fields into a
//! [`PersistenceStore`] under keys of the form `<owner>::<field>` (see
//! [`store_key`]), and read them back when they are initialized. Two stores are
//! provided: [`MemoryStore`] and [`FileStore`], a line-oriented `key=value` text
//! file in which values are escaped so that embedded separators survive.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use nom::{
    IResult, Parser,
    bytes::complete::take_till1,
    character::complete::char,
    combinator::rest,
    sequence::separated_pair,
};
use tracing::{debug, warn};

use crate::utils::{escape_separators, unescape};

/// Abstract key-value store for persistent fields
pub trait PersistenceStore: Send + Sync {
    fn load(&self, key: &str) -> Option<String>;
    fn save(&self, key: &str, value: &str);
    /// Make saved values durable
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Build the key for a persisted field
pub fn store_key(owner: &str, field: &str) -> String {
    format!("{owner}::{field}")
}

/// Keeps values in memory only
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistenceStore for MemoryStore {
    fn load(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }
    fn save(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }
}

/// Parse one `key=value` line. The value is everything after the first `=`.
fn parse_line(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(take_till1(|c| c == '='), char('='), rest).parse(input)
}

/// Stores values in a text file, written out on [`PersistenceStore::flush`]
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
    dirty: AtomicBool,
}

impl FileStore {
    /// Open a store, loading any existing entries. A missing file is not an error.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = BTreeMap::new();
        match fs::read_to_string(&path) {
            Ok(text) => {
                for (number, line) in text.lines().enumerate() {
                    let line = line.trim_end_matches('\r');
                    if line.trim().is_empty() || line.starts_with('#') {
                        continue;
                    }
                    match parse_line(line) {
                        Ok((_, (key, value))) => {
                            entries.insert(key.trim().to_string(), unescape(value));
                        }
                        Err(_) => warn!(
                            "Skipping malformed line {} in {}: {line:?}",
                            number + 1,
                            path.display()
                        ),
                    }
                }
                debug!("Loaded {} persisted values from {}", entries.len(), path.display());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => (),
            Err(e) => return Err(e),
        }
        Ok(FileStore {
            path,
            entries: Mutex::new(entries),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistenceStore for FileStore {
    fn load(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn save(&self, key: &str, value: &str) {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).map(String::as_str) != Some(value) {
            entries.insert(key.to_string(), value.to_string());
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    fn flush(&self) -> io::Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        // Write to a sibling file and rename over, so a crash never truncates
        let temporary = self.path.with_extension("tmp");
        let snapshot = self.entries.lock().unwrap().clone();
        let written = (|| {
            let mut file = io::BufWriter::new(fs::File::create(&temporary)?);
            for (key, value) in &snapshot {
                writeln!(file, "{key}={}", escape_separators(value))?;
            }
            file.flush()?;
            fs::rename(&temporary, &self.path)
        })();
        if written.is_err() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        written?;
        debug!("Flushed persisted values to {}", self.path.display());
        Ok(())
    }
}
