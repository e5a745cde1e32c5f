use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{seconds, CacheConfig};
use crate::models::Measurement;

const DATA_FILE: &str = "cached.jsonl";
const OFFSET_FILE: &str = "cached.offset";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unable to serialize cache entry: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid circuit open time {0}s")]
    InvalidCircuitTime(u64),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A measurement that could not be published, with the time it was taken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(flatten)]
    pub measurement: Measurement,
    pub time: DateTime<Utc>,
}

/// FIFO of cache entries on disk.
///
/// Entries are appended as JSON lines to `cached.jsonl`. The byte offset of the first entry
/// not yet replayed lives in `cached.offset`, so a restart continues where the last run
/// stopped. Once everything is replayed both files are removed.
pub struct DiskQueue {
    data_path: PathBuf,
    offset_path: PathBuf,
    offset: u64,
    peeked: Option<u64>,
}

impl DiskQueue {
    pub fn open(dir: &Path) -> Result<Self, CacheError> {
        fs::create_dir_all(dir).map_err(io_error(dir))?;

        let data_path = dir.join(DATA_FILE);
        let offset_path = dir.join(OFFSET_FILE);

        let mut offset = match fs::read_to_string(&offset_path) {
            Ok(contents) => contents.trim().parse::<u64>().unwrap_or_else(|_| {
                warn!("Ignoring broken cache offset {:?}", contents);
                0
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(io_error(&offset_path)(e)),
        };

        let data_len = file_len(&data_path)?;
        if offset > data_len {
            warn!("Cache offset {} beyond {} bytes of data, starting over", offset, data_len);
            offset = 0;
        }

        let queue = DiskQueue {
            data_path,
            offset_path,
            offset,
            peeked: None,
        };
        info!("Disk cache at {} holds {} measurements", dir.display(), queue.len()?);
        Ok(queue)
    }

    pub fn push(&mut self, entry: &CacheEntry) -> Result<(), CacheError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.data_path)
            .map_err(io_error(&self.data_path))?;
        file.write_all(line.as_bytes()).map_err(io_error(&self.data_path))?;

        debug!("Cached {}", entry.measurement.key());
        Ok(())
    }

    /// The oldest entry, left in the queue until `remove_peeked` is called
    pub fn peek(&mut self) -> Result<Option<CacheEntry>, CacheError> {
        let mut reader = match File::open(&self.data_path) {
            Ok(file) => BufReader::new(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&self.data_path)(e)),
        };
        reader.seek(SeekFrom::Start(self.offset)).map_err(io_error(&self.data_path))?;

        let mut position = self.offset;
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line).map_err(io_error(&self.data_path))?;
            // a line without newline is still being written or was torn by a crash
            if read == 0 || line.last() != Some(&b'\n') {
                return Ok(None);
            }
            position += read as u64;

            match serde_json::from_slice::<CacheEntry>(&line) {
                Ok(entry) => {
                    self.peeked = Some(position);
                    return Ok(Some(entry));
                }
                Err(e) => {
                    warn!("Dropping unreadable cache entry: {}", e);
                    self.advance(position)?;
                }
            }
        }
    }

    /// Drops the entry returned by the last `peek`
    pub fn remove_peeked(&mut self) -> Result<(), CacheError> {
        match self.peeked.take() {
            Some(next) => self.advance(next),
            None => Ok(()),
        }
    }

    /// Number of entries waiting for replay
    pub fn len(&self) -> Result<usize, CacheError> {
        let mut reader = match File::open(&self.data_path) {
            Ok(file) => BufReader::new(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_error(&self.data_path)(e)),
        };
        reader.seek(SeekFrom::Start(self.offset)).map_err(io_error(&self.data_path))?;

        let mut count = 0;
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line).map_err(io_error(&self.data_path))?;
            if read == 0 || line.last() != Some(&b'\n') {
                return Ok(count);
            }
            count += 1;
        }
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    fn advance(&mut self, offset: u64) -> Result<(), CacheError> {
        self.offset = offset;
        if offset >= file_len(&self.data_path)? {
            // everything replayed, start with fresh files
            remove_if_exists(&self.data_path)?;
            remove_if_exists(&self.offset_path)?;
            self.offset = 0;
            return Ok(());
        }
        fs::write(&self.offset_path, offset.to_string()).map_err(io_error(&self.offset_path))
    }
}

fn file_len(path: &Path) -> Result<u64, CacheError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(io_error(path)(e)),
    }
}

fn remove_if_exists(path: &Path) -> Result<(), CacheError> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(io_error(path)(e)),
        _ => Ok(()),
    }
}

/// Stops sending for `open_for` after a failure
pub struct CircuitBreaker {
    open_for: TimeDelta,
    open_until: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(open_for: TimeDelta) -> Self {
        CircuitBreaker {
            open_for,
            open_until: None,
        }
    }

    pub fn trip(&mut self, now: DateTime<Utc>) {
        if self.open_until.is_none() {
            warn!("Circuit open for {}s", self.open_for.num_seconds());
        }
        self.open_until = Some(now.checked_add_signed(self.open_for).unwrap_or(DateTime::<Utc>::MAX_UTC));
    }

    pub fn is_open(&mut self, now: DateTime<Utc>) -> bool {
        match self.open_until {
            Some(until) if now < until => true,
            Some(_) => {
                info!("Circuit closed");
                self.open_until = None;
                false
            }
            None => false,
        }
    }
}

/// Sends measurements through a fallible `send`, parking the ones that fail on disk and
/// sending them again once the circuit is closed
pub struct Spooler {
    queue: DiskQueue,
    circuit: CircuitBreaker,
}

impl Spooler {
    pub fn new(queue: DiskQueue, circuit: CircuitBreaker) -> Self {
        Spooler { queue, circuit }
    }

    pub fn open(config: &CacheConfig) -> Result<Self, CacheError> {
        let open_for = seconds(config.circuit_open_secs)
            .ok_or(CacheError::InvalidCircuitTime(config.circuit_open_secs))?;
        let queue = DiskQueue::open(Path::new(&config.path))?;
        Ok(Spooler::new(queue, CircuitBreaker::new(open_for)))
    }

    pub fn queue(&self) -> &DiskQueue {
        &self.queue
    }

    /// Sends `entry` unless the circuit is open. A failed send opens the circuit, in both
    /// cases the entry goes to disk.
    pub fn submit<F>(&mut self, entry: CacheEntry, now: DateTime<Utc>, mut send: F)
    where
        F: FnMut(&CacheEntry) -> bool,
    {
        if !self.circuit.is_open(now) {
            if send(&entry) {
                return;
            }
            self.circuit.trip(now);
        }

        if let Err(e) = self.queue.push(&entry) {
            error!("Lost {}: {}", entry.measurement.key(), e);
        }
    }

    /// Sends up to `limit` cached entries in the order they were cached, stopping at the
    /// first failure. Returns the number sent.
    pub fn replay<F>(&mut self, now: DateTime<Utc>, limit: usize, mut send: F) -> usize
    where
        F: FnMut(&CacheEntry) -> bool,
    {
        let mut sent = 0;
        while sent < limit && !self.circuit.is_open(now) {
            let entry = match self.queue.peek() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!("Unable to read cache: {}", e);
                    break;
                }
            };

            if !send(&entry) {
                self.circuit.trip(now);
                break;
            }
            if let Err(e) = self.queue.remove_peeked() {
                error!("Unable to update cache: {}", e);
                break;
            }
            sent += 1;
        }

        if sent > 0 {
            info!("Replayed {} cached measurements", sent);
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(ident: &str, value: &str) -> CacheEntry {
        CacheEntry {
            measurement: Measurement {
                prefix: "1-0".to_string(),
                ident: ident.to_string(),
                suffix: "255".to_string(),
                value: value.to_string(),
                unit: "Wh".to_string(),
            },
            time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    fn spooler(dir: &Path) -> Spooler {
        Spooler::new(DiskQueue::open(dir).unwrap(), CircuitBreaker::new(TimeDelta::seconds(30)))
    }

    #[test]
    fn test_entry_format() {
        let line = serde_json::to_string(&entry("1.8.0", "1.5")).unwrap();
        assert_eq!(
            line,
            r#"{"prefix":"1-0","ident":"1.8.0","suffix":"255","value":"1.5","unit":"Wh","time":"2024-03-01T12:00:00Z"}"#
        );
        assert_eq!(serde_json::from_str::<CacheEntry>(&line).unwrap(), entry("1.8.0", "1.5"));
    }

    #[test]
    fn test_queue_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = DiskQueue::open(dir.path()).unwrap();
        assert!(queue.is_empty().unwrap());
        assert_eq!(queue.peek().unwrap(), None);

        queue.push(&entry("1.8.0", "1")).unwrap();
        queue.push(&entry("1.8.0", "2")).unwrap();
        assert_eq!(queue.len().unwrap(), 2);

        // peeking twice yields the same entry
        assert_eq!(queue.peek().unwrap(), Some(entry("1.8.0", "1")));
        assert_eq!(queue.peek().unwrap(), Some(entry("1.8.0", "1")));
        queue.remove_peeked().unwrap();
        assert_eq!(queue.len().unwrap(), 1);

        assert_eq!(queue.peek().unwrap(), Some(entry("1.8.0", "2")));
        queue.remove_peeked().unwrap();
        assert_eq!(queue.peek().unwrap(), None);
        assert!(queue.is_empty().unwrap());

        // drained queues leave no files behind
        assert!(!dir.path().join(DATA_FILE).exists());
        assert!(!dir.path().join(OFFSET_FILE).exists());
    }

    #[test]
    fn test_remove_without_peek() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = DiskQueue::open(dir.path()).unwrap();
        queue.push(&entry("1.8.0", "1")).unwrap();
        queue.remove_peeked().unwrap();
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut queue = DiskQueue::open(dir.path()).unwrap();
            for value in ["1", "2", "3"] {
                queue.push(&entry("1.8.0", value)).unwrap();
            }
            queue.peek().unwrap();
            queue.remove_peeked().unwrap();
        }

        let mut queue = DiskQueue::open(dir.path()).unwrap();
        assert_eq!(queue.len().unwrap(), 2);
        assert_eq!(queue.peek().unwrap(), Some(entry("1.8.0", "2")));
    }

    #[test]
    fn test_creates_cache_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let mut queue = DiskQueue::open(&nested).unwrap();
        queue.push(&entry("1.8.0", "1")).unwrap();
        assert!(nested.join(DATA_FILE).exists());
    }

    #[test]
    fn test_broken_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = serde_json::to_string(&entry("1.8.0", "1")).unwrap();
        fs::write(dir.path().join(DATA_FILE), format!("not json\n{}\n{{\"torn\":", good)).unwrap();

        let mut queue = DiskQueue::open(dir.path()).unwrap();
        assert_eq!(queue.len().unwrap(), 2);
        assert_eq!(queue.peek().unwrap(), Some(entry("1.8.0", "1")));
        queue.remove_peeked().unwrap();

        // the torn tail is not an entry yet
        assert_eq!(queue.peek().unwrap(), None);
        assert_eq!(queue.len().unwrap(), 0);
    }

    #[test]
    fn test_offset_beyond_data_starts_over() {
        let dir = tempfile::tempdir().unwrap();
        let good = serde_json::to_string(&entry("1.8.0", "1")).unwrap();
        fs::write(dir.path().join(DATA_FILE), format!("{}\n", good)).unwrap();
        fs::write(dir.path().join(OFFSET_FILE), "100000").unwrap();

        let mut queue = DiskQueue::open(dir.path()).unwrap();
        assert_eq!(queue.peek().unwrap(), Some(entry("1.8.0", "1")));
    }

    #[test]
    fn test_circuit_breaker() {
        let start = Utc::now();
        let mut circuit = CircuitBreaker::new(TimeDelta::seconds(30));
        assert!(!circuit.is_open(start));

        circuit.trip(start);
        assert!(circuit.is_open(start));
        assert!(circuit.is_open(start + TimeDelta::seconds(29)));
        assert!(!circuit.is_open(start + TimeDelta::seconds(30)));
        assert!(!circuit.is_open(start + TimeDelta::seconds(31)));
    }

    #[test]
    fn test_circuit_breaker_saturates() {
        let mut circuit = CircuitBreaker::new(TimeDelta::MAX);
        let now = Utc::now();
        circuit.trip(now);
        assert!(circuit.is_open(now + TimeDelta::days(365 * 1000)));
    }

    #[test]
    fn test_sent_entries_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut spooler = spooler(dir.path());
        let mut sent = Vec::new();

        spooler.submit(entry("1.8.0", "1"), Utc::now(), |e| {
            sent.push(e.clone());
            true
        });

        assert_eq!(sent, vec![entry("1.8.0", "1")]);
        assert!(spooler.queue().is_empty().unwrap());
    }

    #[test]
    fn test_failure_opens_circuit_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let mut spooler = spooler(dir.path());
        let start = Utc::now();
        let mut attempts = 0;

        spooler.submit(entry("1.8.0", "1"), start, |_| {
            attempts += 1;
            false
        });
        // the open circuit keeps further entries away from the backend
        spooler.submit(entry("1.8.0", "2"), start + TimeDelta::seconds(10), |_| {
            attempts += 1;
            true
        });

        assert_eq!(attempts, 1);
        assert_eq!(spooler.queue().len().unwrap(), 2);

        // closed again after 30s
        spooler.submit(entry("1.8.0", "3"), start + TimeDelta::seconds(30), |_| {
            attempts += 1;
            true
        });
        assert_eq!(attempts, 2);
        assert_eq!(spooler.queue().len().unwrap(), 2);
    }

    #[test]
    fn test_replay_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut spooler = spooler(dir.path());
        let start = Utc::now();

        for value in ["1", "2", "3"] {
            spooler.submit(entry("1.8.0", value), start, |_| false);
        }

        // nothing is replayed while the circuit is open
        let mut replayed = Vec::new();
        assert_eq!(spooler.replay(start + TimeDelta::seconds(5), 10, |e| {
            replayed.push(e.measurement.value.clone());
            true
        }), 0);
        assert!(replayed.is_empty());

        let later = start + TimeDelta::seconds(31);
        assert_eq!(spooler.replay(later, 2, |e| {
            replayed.push(e.measurement.value.clone());
            true
        }), 2);
        assert_eq!(spooler.replay(later, 10, |e| {
            replayed.push(e.measurement.value.clone());
            true
        }), 1);

        assert_eq!(replayed, vec!["1", "2", "3"]);
        assert!(spooler.queue().is_empty().unwrap());
    }

    #[test]
    fn test_replay_stops_at_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut spooler = spooler(dir.path());
        let start = Utc::now();
        spooler.submit(entry("1.8.0", "1"), start, |_| false);
        spooler.submit(entry("1.8.0", "2"), start, |_| false);

        let later = start + TimeDelta::seconds(31);
        let mut attempts = 0;
        assert_eq!(spooler.replay(later, 10, |_| {
            attempts += 1;
            false
        }), 0);

        // the failure opened the circuit again and kept both entries
        assert_eq!(attempts, 1);
        assert_eq!(spooler.queue().len().unwrap(), 2);
        assert_eq!(spooler.replay(later + TimeDelta::seconds(1), 10, |_| true), 0);
        assert_eq!(spooler.replay(later + TimeDelta::seconds(30), 10, |_| true), 2);
    }

    #[test]
    fn test_open_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            path: dir.path().join("cache").to_string_lossy().to_string(),
            circuit_open_secs: 30,
        };
        assert!(Spooler::open(&config).is_ok());

        let config = CacheConfig {
            circuit_open_secs: u64::MAX,
            ..config
        };
        assert!(matches!(Spooler::open(&config), Err(CacheError::InvalidCircuitTime(u64::MAX))));
    }
}
