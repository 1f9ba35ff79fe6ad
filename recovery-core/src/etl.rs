//! External-memory collector: append, spill, sort, merge.
//!
//! Records are accumulated in memory until a budget is exceeded, at which
//! point the buffer is sorted by key and written out as an anonymous run
//! file. [`Collector::load`] drains the collector, merging the in-memory
//! buffer with every spilled run into one globally key-ordered stream.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// One collected key/value record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtlEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Errors raised by the collector.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("collector i/o: {0}")]
    Io(#[from] io::Error),
    #[error("truncated spill run")]
    TruncatedRun,
}

/// Append-ordered key/value accumulator with a memory budget.
pub struct Collector {
    temp_dir: PathBuf,
    buffer: Vec<EtlEntry>,
    buffer_bytes: usize,
    spilled_bytes: usize,
    memory_budget: usize,
    runs: Vec<File>,
}

impl Collector {
    /// Create a collector spilling into `temp_dir` once more than
    /// `memory_budget` bytes of keys and values are buffered.
    pub fn new(temp_dir: &Path, memory_budget: usize) -> Result<Self, EtlError> {
        std::fs::create_dir_all(temp_dir)?;
        Ok(Self {
            temp_dir: temp_dir.to_path_buf(),
            buffer: Vec::new(),
            buffer_bytes: 0,
            spilled_bytes: 0,
            memory_budget,
            runs: Vec::new(),
        })
    }

    /// Append a record, spilling the buffer to disk if the budget is hit.
    pub fn collect(&mut self, entry: EtlEntry) -> Result<(), EtlError> {
        self.buffer_bytes += entry.key.len() + entry.value.len();
        self.buffer.push(entry);
        if self.buffer_bytes >= self.memory_budget {
            self.spill()?;
        }
        Ok(())
    }

    /// Whether anything has been collected since the last load.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.runs.is_empty()
    }

    /// Total payload bytes currently held, in memory and on disk.
    pub fn bytes_size(&self) -> usize {
        self.buffer_bytes + self.spilled_bytes
    }

    /// Drain the collector into a globally key-ordered stream.
    pub fn load(&mut self) -> Result<LoadIter, EtlError> {
        self.buffer.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        let memory = std::mem::take(&mut self.buffer).into_iter();
        self.buffer_bytes = 0;
        self.spilled_bytes = 0;

        let mut sources: Vec<Source> = Vec::with_capacity(self.runs.len() + 1);
        sources.push(Source::Memory(memory));
        for mut file in self.runs.drain(..) {
            file.seek(SeekFrom::Start(0))?;
            sources.push(Source::Run(BufReader::new(file)));
        }

        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (index, source) in sources.iter_mut().enumerate() {
            if let Some(entry) = source.next_entry()? {
                heap.push(Reverse((entry.key, entry.value, index)));
            }
        }

        Ok(LoadIter { sources, heap })
    }

    fn spill(&mut self) -> Result<(), EtlError> {
        self.buffer.sort_unstable_by(|a, b| a.key.cmp(&b.key));

        let mut writer = BufWriter::new(tempfile::tempfile_in(&self.temp_dir)?);
        for entry in &self.buffer {
            writer.write_all(&(entry.key.len() as u32).to_be_bytes())?;
            writer.write_all(&(entry.value.len() as u32).to_be_bytes())?;
            writer.write_all(&entry.key)?;
            writer.write_all(&entry.value)?;
        }
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|err| EtlError::Io(err.into_error()))?;

        debug!(
            "[Etl] spilled {} records ({} bytes) to run #{}",
            self.buffer.len(),
            self.buffer_bytes,
            self.runs.len()
        );

        self.runs.push(file);
        self.spilled_bytes += self.buffer_bytes;
        self.buffer.clear();
        self.buffer_bytes = 0;
        Ok(())
    }
}

enum Source {
    Memory(std::vec::IntoIter<EtlEntry>),
    Run(BufReader<File>),
}

impl Source {
    fn next_entry(&mut self) -> Result<Option<EtlEntry>, EtlError> {
        match self {
            Source::Memory(iter) => Ok(iter.next()),
            Source::Run(reader) => read_entry(reader),
        }
    }
}

fn read_entry(reader: &mut BufReader<File>) -> Result<Option<EtlEntry>, EtlError> {
    let mut key_len = [0u8; 4];
    match reader.read_exact(&mut key_len) {
        Ok(()) => {}
        // A clean end of run falls exactly on an entry boundary
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let mut value_len = [0u8; 4];
    reader
        .read_exact(&mut value_len)
        .map_err(|_| EtlError::TruncatedRun)?;

    let mut key = vec![0u8; u32::from_be_bytes(key_len) as usize];
    let mut value = vec![0u8; u32::from_be_bytes(value_len) as usize];
    reader.read_exact(&mut key).map_err(|_| EtlError::TruncatedRun)?;
    reader
        .read_exact(&mut value)
        .map_err(|_| EtlError::TruncatedRun)?;
    Ok(Some(EtlEntry { key, value }))
}

/// Merging iterator over every run of a drained [`Collector`], yielding
/// records in ascending key order.
pub struct LoadIter {
    sources: Vec<Source>,
    heap: BinaryHeap<Reverse<(Vec<u8>, Vec<u8>, usize)>>,
}

impl Iterator for LoadIter {
    type Item = Result<EtlEntry, EtlError>;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse((key, value, index)) = self.heap.pop()?;
        match self.sources[index].next_entry() {
            Ok(Some(entry)) => self.heap.push(Reverse((entry.key, entry.value, index))),
            Ok(None) => {}
            Err(err) => return Some(Err(err)),
        }
        Some(Ok(EtlEntry { key, value }))
    }
}
