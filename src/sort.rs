//! External sorter.

use log;
use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::io::prelude::*;
use std::sync::{Arc, OnceLock};

use rayon::slice::ParallelSliceMut;

use crate::buffer::ChunkBuffer;
use crate::chunk::{self, ChunkError, ChunkReader};
use crate::codec::{RecordCodec, RmpCodec};
use crate::merger::ChunkMerger;
use crate::observer::{LogObserver, SortObserver, SplitStats};
use crate::record::{self, CompareError, Record};
use crate::storage::{Compression, LocalStorage, Storage};

/// Default memory budget of a single chunk.
pub const DEFAULT_MEMORY_BUDGET: u64 = 64 * 1024 * 1024;
/// Default capacity of a chunk worker queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Sorting error.
#[derive(Debug)]
pub enum SortError<S: Error, D: Error> {
    /// Sorter configuration error.
    Config(String),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Common I/O error.
    IO(io::Error),
    /// Chunk writing or reading error.
    Chunk { chunk: String, source: ChunkError<S, D> },
    /// Records comparison error.
    CompareError(CompareError),
    /// Chunk worker terminated without finishing its chunk.
    WorkerLost { chunk: String },
    /// Merge was cancelled.
    Cancelled,
}

impl<S, D> Error for SortError<S, D>
where
    S: Error + 'static,
    D: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::IO(err) => Some(err),
            SortError::Chunk { source, .. } => Some(source),
            SortError::CompareError(err) => Some(err),
            SortError::Config(_) | SortError::WorkerLost { .. } | SortError::Cancelled => None,
        }
    }
}

impl<S: Error, D: Error> Display for SortError<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::Config(err) => write!(f, "sorter configuration error: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::Chunk { chunk, source } => write!(f, "chunk {} error: {}", chunk, source),
            SortError::CompareError(err) => write!(f, "records comparison error: {}", err),
            SortError::WorkerLost { chunk } => write!(f, "chunk {} reader terminated unexpectedly", chunk),
            SortError::Cancelled => write!(f, "merge cancelled"),
        }
    }
}

type Factory<T> = Arc<dyn Fn() -> T + Send + Sync>;
type Parser<T> = Box<dyn Fn(&str) -> Option<T> + Send + Sync>;

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
pub struct ExternalSorterBuilder<T, S = LocalStorage, C = RmpCodec>
where
    T: Record,
    S: Storage,
    C: RecordCodec<T>,
{
    /// Number of threads to be used to sort chunks in parallel.
    threads_number: Option<usize>,
    /// Chunk size limit in bytes of source lines.
    memory_budget: u64,
    /// Capacity of a chunk worker queue used during merging.
    queue_capacity: usize,
    /// Chunk files compression.
    chunk_compression: Compression,
    /// Creates empty records used as decode targets.
    factory: Option<Factory<T>>,
    /// Converts input lines to records.
    parser: Option<Parser<T>>,
    /// Input and chunks storage.
    storage: S,
    /// Chunk records codec.
    codec: C,
    /// Progress observer.
    observer: Arc<dyn SortObserver>,
}

impl<T, S, C> ExternalSorterBuilder<T, S, C>
where
    T: Record,
    S: Storage + Default,
    C: RecordCodec<T> + Default,
{
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }
}

impl<T, S, C> ExternalSorterBuilder<T, S, C>
where
    T: Record,
    S: Storage,
    C: RecordCodec<T>,
{
    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<T, S, C>, SortError<C::EncodeError, C::DecodeError>> {
        let factory = self
            .factory
            .ok_or_else(|| SortError::Config("record factory is not set".to_string()))?;
        let parser = self
            .parser
            .ok_or_else(|| SortError::Config("line parser is not set".to_string()))?;

        return Ok(ExternalSorter {
            thread_pool: ExternalSorter::<T, S, C>::init_thread_pool(self.threads_number)?,
            memory_budget: self.memory_budget,
            queue_capacity: self.queue_capacity,
            chunk_compression: self.chunk_compression,
            factory,
            parser,
            storage: Arc::new(self.storage),
            codec: Arc::new(self.codec),
            observer: self.observer,
        });
    }

    /// Sets number of threads to be used to sort chunks in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder<T, S, C> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets the chunk memory budget: a chunk is flushed as soon as the total size of its source lines exceeds it.
    pub fn with_memory_budget(mut self, memory_budget: u64) -> ExternalSorterBuilder<T, S, C> {
        self.memory_budget = memory_budget;
        return self;
    }

    /// Sets capacity of a chunk worker queue.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> ExternalSorterBuilder<T, S, C> {
        self.queue_capacity = queue_capacity;
        return self;
    }

    /// Sets chunk files compression.
    pub fn with_chunk_compression(mut self, compression: Compression) -> ExternalSorterBuilder<T, S, C> {
        self.chunk_compression = compression;
        return self;
    }

    /// Sets record factory.
    pub fn with_factory<F>(mut self, factory: F) -> ExternalSorterBuilder<T, S, C>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        return self;
    }

    /// Sets line parser. Lines the parser returns [`None`] for are skipped.
    pub fn with_parser<F>(mut self, parser: F) -> ExternalSorterBuilder<T, S, C>
    where
        F: Fn(&str) -> Option<T> + Send + Sync + 'static,
    {
        self.parser = Some(Box::new(parser));
        return self;
    }

    /// Sets storage.
    pub fn with_storage(mut self, storage: S) -> ExternalSorterBuilder<T, S, C> {
        self.storage = storage;
        return self;
    }

    /// Sets record codec.
    pub fn with_codec(mut self, codec: C) -> ExternalSorterBuilder<T, S, C> {
        self.codec = codec;
        return self;
    }

    /// Sets progress observer.
    pub fn with_observer(mut self, observer: Arc<dyn SortObserver>) -> ExternalSorterBuilder<T, S, C> {
        self.observer = observer;
        return self;
    }
}

impl<T, S, C> Default for ExternalSorterBuilder<T, S, C>
where
    T: Record,
    S: Storage + Default,
    C: RecordCodec<T> + Default,
{
    fn default() -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            chunk_compression: Compression::Plain,
            factory: None,
            parser: None,
            storage: S::default(),
            codec: C::default(),
            observer: Arc::new(LogObserver),
        }
    }
}

/// External sorter.
///
/// Holds the configuration shared by both sorting phases: [`ExternalSorter::split`] turns the input into
/// sorted chunks and [`ExternalSorter::merge`] merges them into a single sorted stream. Chunks are owned
/// by the caller and should be removed once merged (see [`ExternalSorter::remove_chunks`]).
pub struct ExternalSorter<T, S = LocalStorage, C = RmpCodec>
where
    T: Record,
    S: Storage,
    C: RecordCodec<T>,
{
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Chunk size limit in bytes of source lines.
    memory_budget: u64,
    /// Capacity of a chunk worker queue.
    queue_capacity: usize,
    /// Chunk files compression.
    chunk_compression: Compression,
    factory: Factory<T>,
    parser: Parser<T>,
    storage: Arc<S>,
    codec: Arc<C>,
    observer: Arc<dyn SortObserver>,
}

impl<T, S, C> ExternalSorter<T, S, C>
where
    T: Record,
    S: Storage,
    C: RecordCodec<T>,
{
    fn init_thread_pool(
        threads_number: Option<usize>,
    ) -> Result<rayon::ThreadPool, SortError<C::EncodeError, C::DecodeError>> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    /// Returns the sorter storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Returns the chunk memory budget.
    pub fn memory_budget(&self) -> u64 {
        self.memory_budget
    }

    /// Splits the input stream into sorted chunks.
    /// Returns chunk names in creation order.
    ///
    /// # Arguments
    /// * `input` - Input stream name. Chunk names are derived from it.
    pub fn split(&self, input: &str) -> Result<Vec<String>, SortError<C::EncodeError, C::DecodeError>> {
        log::info!("splitting {} into chunks", input);
        let reader = self
            .storage
            .open_read(input, Compression::Detect)
            .map_err(SortError::IO)?;

        self.split_reader(input, reader)
    }

    /// Splits a newline delimited stream into sorted chunks.
    /// Returns chunk names in creation order.
    ///
    /// Lines that are not valid UTF-8 are skipped the same way as lines the parser rejects.
    ///
    /// # Arguments
    /// * `prefix` - Chunk name prefix
    /// * `reader` - Input stream
    pub fn split_reader<R: BufRead>(
        &self,
        prefix: &str,
        reader: R,
    ) -> Result<Vec<String>, SortError<C::EncodeError, C::DecodeError>> {
        self.split_raw(prefix, reader.split(b'\n'))
    }

    /// Splits input lines into sorted chunks.
    /// Returns chunk names in creation order.
    ///
    /// Lines the parser rejects are skipped. Any other failure removes all chunks created so far
    /// and returns the error.
    ///
    /// # Arguments
    /// * `prefix` - Chunk name prefix
    /// * `lines` - Input lines
    pub fn split_lines<I>(
        &self,
        prefix: &str,
        lines: I,
    ) -> Result<Vec<String>, SortError<C::EncodeError, C::DecodeError>>
    where
        I: IntoIterator<Item = io::Result<String>>,
    {
        self.split_raw(prefix, lines.into_iter().map(|line| line.map(String::into_bytes)))
    }

    fn split_raw<I>(&self, prefix: &str, lines: I) -> Result<Vec<String>, SortError<C::EncodeError, C::DecodeError>>
    where
        I: Iterator<Item = io::Result<Vec<u8>>>,
    {
        let mut chunks = Vec::new();

        match self.split_into(prefix, lines.fuse(), &mut chunks) {
            Ok(stats) => {
                log::debug!("external sort preparation done");
                self.observer.split_finished(&stats);
                Ok(chunks)
            }
            Err(err) => {
                log::warn!("splitting failed, removing {} chunks: {}", chunks.len(), err);
                self.discard(&chunks);
                Err(err)
            }
        }
    }

    fn split_into<I>(
        &self,
        prefix: &str,
        mut lines: I,
        chunks: &mut Vec<String>,
    ) -> Result<SplitStats, SortError<C::EncodeError, C::DecodeError>>
    where
        I: Iterator<Item = io::Result<Vec<u8>>>,
    {
        let mut stats = SplitStats::default();

        loop {
            let mut buffer = ChunkBuffer::new(self.memory_budget);

            while !buffer.is_full() {
                let mut line = match lines.next() {
                    Some(line) => line.map_err(SortError::IO)?,
                    None => break,
                };
                stats.lines_read += 1;
                if line.last() == Some(&b'\r') {
                    line.pop();
                }

                let parsed = match String::from_utf8(line) {
                    Ok(line) => match (self.parser)(&line) {
                        Some(item) => Ok((item, line.len() as u64)),
                        None => Err(line),
                    },
                    Err(err) => Err(String::from_utf8_lossy(err.as_bytes()).into_owned()),
                };
                match parsed {
                    Ok((item, size)) => buffer.push(item, size),
                    Err(line) => {
                        stats.skipped += 1;
                        self.observer.line_skipped(stats.lines_read, &line);
                    }
                }
            }

            if buffer.is_empty() {
                break;
            }

            let name = chunk::chunk_name(prefix, chunks.len(), self.storage.extension(self.chunk_compression));
            // registered before writing so that a partially written chunk is removed on failure
            chunks.push(name.clone());

            let records = self.create_chunk(&name, buffer)?;
            stats.records += records;
            self.observer.chunk_written(&name, records);
        }

        stats.chunks = chunks.len();
        return Ok(stats);
    }

    fn create_chunk(
        &self,
        name: &str,
        mut buffer: ChunkBuffer<T>,
    ) -> Result<u64, SortError<C::EncodeError, C::DecodeError>> {
        log::debug!("sorting chunk data ({} records, {} bytes) ...", buffer.len(), buffer.mem_size());
        let failure = OnceLock::new();
        self.thread_pool.install(|| {
            buffer.par_sort_by(|a, b| match record::compare(a, b) {
                Ok(ordering) => ordering,
                Err(err) => {
                    let _ = failure.set(err);
                    Ordering::Equal
                }
            });
        });
        if let Some(err) = failure.into_inner() {
            return Err(SortError::CompareError(err));
        }

        log::debug!("saving chunk data to {}", name);
        let chunk_err = |err: ChunkError<C::EncodeError, C::DecodeError>| SortError::Chunk {
            chunk: name.to_string(),
            source: err,
        };

        let mut writer = self
            .storage
            .create(name, self.chunk_compression)
            .map_err(|err| chunk_err(ChunkError::IO(err)))?;
        let records = chunk::write_chunk(&mut writer, self.codec.as_ref(), buffer.as_slice())
            .map_err(|err| chunk_err(err))?;
        self.storage
            .commit(writer)
            .map_err(|err| chunk_err(ChunkError::IO(err)))?;

        return Ok(records);
    }

    /// Merges sorted chunks into a single sorted stream.
    /// Returns an iterator that can be used to get sorted data stream.
    ///
    /// All chunks are opened before the merge starts, so a missing or malformed chunk is reported here.
    /// Errors occurred while streaming are yielded by the iterator.
    ///
    /// # Arguments
    /// * `chunks` - Chunk names returned by [`ExternalSorter::split`]
    pub fn merge(
        &self,
        chunks: &[String],
    ) -> Result<ChunkMerger<T, C::EncodeError, C::DecodeError>, SortError<C::EncodeError, C::DecodeError>> {
        let mut sources = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let chunk_reader = self
                .storage
                .open_read(chunk, self.chunk_compression)
                .map_err(ChunkError::IO)
                .and_then(|reader| ChunkReader::open(reader, self.codec.clone(), self.factory.clone()))
                .map_err(|err| SortError::Chunk {
                    chunk: chunk.clone(),
                    source: err,
                })?;
            log::debug!("chunk {} opened ({} records)", chunk, chunk_reader.declared_count());

            let name = chunk.clone();
            let source = chunk_reader.map(move |item| {
                item.map_err(|err| SortError::Chunk {
                    chunk: name.clone(),
                    source: err,
                })
            });
            sources.push((chunk.clone(), source));
        }

        ChunkMerger::spawn(sources, self.queue_capacity, self.observer.clone())
    }

    /// Removes chunks from the storage.
    /// All chunks are tried, the first failure is returned.
    pub fn remove_chunks(&self, chunks: &[String]) -> Result<(), SortError<C::EncodeError, C::DecodeError>> {
        let mut result = Ok(());
        for chunk in chunks {
            if let Err(err) = self.storage.remove(chunk) {
                log::warn!("failed to remove chunk {}: {}", chunk, err);
                if result.is_ok() {
                    result = Err(SortError::Chunk {
                        chunk: chunk.clone(),
                        source: ChunkError::IO(err),
                    });
                }
            }
        }

        return result;
    }

    fn discard(&self, chunks: &[String]) {
        for chunk in chunks {
            match self.storage.remove(chunk) {
                Ok(()) => log::debug!("chunk {} removed", chunk),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => log::warn!("failed to remove chunk {}: {}", chunk, err),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::io;
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use rand::seq::SliceRandom;
    use rstest::*;

    use super::{ExternalSorter, ExternalSorterBuilder, SortError};
    use crate::chunk::{self, ChunkError, ChunkReader};
    use crate::codec::{RecordCodec, RmpCodec};
    use crate::observer::{SortObserver, SplitStats};
    use crate::record::{CompareError, Record};
    use crate::storage::{Compression, LocalStorage, Storage};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    #[derive(Default)]
    struct CountingObserver {
        skipped: AtomicU64,
        chunks: AtomicU64,
        merged: AtomicU64,
    }

    impl SortObserver for CountingObserver {
        fn line_skipped(&self, _line_number: u64, _line: &str) {
            self.skipped.fetch_add(1, Ordering::SeqCst);
        }

        fn chunk_written(&self, _chunk: &str, _records: u64) {
            self.chunks.fetch_add(1, Ordering::SeqCst);
        }

        fn split_finished(&self, stats: &SplitStats) {
            assert_eq!(stats.chunks as u64, self.chunks.load(Ordering::SeqCst));
        }

        fn merge_finished(&self, records: u64, _chunks: usize) {
            self.merged.store(records, Ordering::SeqCst);
        }
    }

    fn int_sorter(dir: &Path, memory_budget: u64) -> ExternalSorter<i64> {
        ExternalSorterBuilder::new()
            .with_storage(LocalStorage::new(dir))
            .with_factory(|| 0)
            .with_parser(|line| line.parse().ok())
            .with_memory_budget(memory_budget)
            .with_threads_number(2)
            .build()
            .unwrap()
    }

    fn lines(input: &[&str]) -> Vec<io::Result<String>> {
        Vec::from_iter(input.iter().map(|line| Ok(line.to_string())))
    }

    fn read_chunk(sorter: &ExternalSorter<i64>, chunk: &str) -> Vec<i64> {
        let reader = sorter.storage().open_read(chunk, Compression::Detect).unwrap();
        let chunk_reader: ChunkReader<i64, _, _> =
            ChunkReader::open(reader, Arc::new(RmpCodec), Arc::new(|| 0)).unwrap();
        chunk_reader.map(Result::unwrap).collect()
    }

    fn merge_all(sorter: &ExternalSorter<i64>, chunks: &[String]) -> Vec<i64> {
        sorter.merge(chunks).unwrap().map(Result::unwrap).collect()
    }

    #[rstest]
    fn test_split_and_merge_scenario(tmp_dir: tempfile::TempDir) {
        let observer = Arc::new(CountingObserver::default());
        let sorter: ExternalSorter<i64> = ExternalSorterBuilder::new()
            .with_storage(LocalStorage::new(tmp_dir.path()))
            .with_factory(|| 0)
            .with_parser(|line| line.parse().ok())
            .with_memory_budget(1)
            .with_observer(observer.clone())
            .build()
            .unwrap();

        let chunks = sorter
            .split_lines("input", lines(&["5", "3", "9", "1", "No", "7"]))
            .unwrap();
        assert_eq!(
            chunks,
            vec![
                "input.chunk.00000000",
                "input.chunk.00000001",
                "input.chunk.00000002"
            ]
        );
        assert_eq!(read_chunk(&sorter, &chunks[0]), vec![3, 5]);
        assert_eq!(read_chunk(&sorter, &chunks[1]), vec![1, 9]);
        assert_eq!(read_chunk(&sorter, &chunks[2]), vec![7]);
        assert_eq!(observer.skipped.load(Ordering::SeqCst), 1);

        assert_eq!(merge_all(&sorter, &chunks), vec![1, 3, 5, 7, 9]);
        assert_eq!(observer.merged.load(Ordering::SeqCst), 5);

        sorter.remove_chunks(&chunks).unwrap();
        assert!(chunks.iter().all(|chunk| !tmp_dir.path().join(chunk).exists()));
    }

    #[rstest]
    #[case(Compression::Plain, 64)]
    #[case(Compression::Gzip, 64)]
    #[case(Compression::Plain, 1_000_000)]
    fn test_external_sorter(tmp_dir: tempfile::TempDir, #[case] compression: Compression, #[case] memory_budget: u64) {
        let input_sorted = 0..1000i64;

        let mut input_shuffled = Vec::from_iter(input_sorted.clone());
        input_shuffled.shuffle(&mut rand::thread_rng());
        let input = Vec::from_iter(input_shuffled.iter().map(|item| Ok(item.to_string())));

        let sorter: ExternalSorter<i64> = ExternalSorterBuilder::new()
            .with_storage(LocalStorage::new(tmp_dir.path()))
            .with_factory(|| 0)
            .with_parser(|line| line.parse().ok())
            .with_memory_budget(memory_budget)
            .with_chunk_compression(compression)
            .with_queue_capacity(8)
            .with_threads_number(2)
            .build()
            .unwrap();

        let chunks = sorter.split_lines("shuffled", input).unwrap();
        if memory_budget == 1_000_000 {
            assert_eq!(chunks.len(), 1);
        } else {
            assert!(chunks.len() > 1);
        }
        for chunk in &chunks {
            assert!(chunk.ends_with(sorter.storage().extension(compression)));
            let items = read_chunk(&sorter, chunk);
            assert!(items.windows(2).all(|pair| pair[0] <= pair[1]));
        }

        assert_eq!(merge_all(&sorter, &chunks), Vec::from_iter(input_sorted));
    }

    #[rstest]
    fn test_empty_input(tmp_dir: tempfile::TempDir) {
        let sorter = int_sorter(tmp_dir.path(), 1024);

        let chunks = sorter.split_lines("empty", lines(&[])).unwrap();
        assert!(chunks.is_empty());

        let mut merger = sorter.merge(&chunks).unwrap();
        assert!(merger.next().is_none());
    }

    #[rstest]
    fn test_single_record(tmp_dir: tempfile::TempDir) {
        let sorter = int_sorter(tmp_dir.path(), 1024);

        let chunks = sorter.split_lines("single", lines(&["42"])).unwrap();
        assert_eq!(chunks.len(), 1);

        let reader = sorter.storage().open_read(&chunks[0], Compression::Plain).unwrap();
        let chunk_reader: ChunkReader<i64, _, _> =
            ChunkReader::open(reader, Arc::new(RmpCodec), Arc::new(|| 0)).unwrap();
        assert_eq!(chunk_reader.declared_count(), 1);

        assert_eq!(merge_all(&sorter, &chunks), vec![42]);
    }

    #[rstest]
    fn test_oversized_records(tmp_dir: tempfile::TempDir) {
        let sorter = int_sorter(tmp_dir.path(), 0);

        let chunks = sorter.split_lines("oversized", lines(&["300", "100", "200"])).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(read_chunk(&sorter, &chunks[0]), vec![300]);

        assert_eq!(merge_all(&sorter, &chunks), vec![100, 200, 300]);
    }

    #[rstest]
    fn test_unequal_chunks(tmp_dir: tempfile::TempDir) {
        let sorter = int_sorter(tmp_dir.path(), 1024);
        let contents: [&[i64]; 3] = [&[2, 4, 6, 8, 10], &[5], &[1, 3, 5, 7, 9, 11, 13, 15]];

        let mut chunks = Vec::new();
        for (idx, &items) in contents.iter().enumerate() {
            let name = chunk::chunk_name("manual", idx, "");
            let mut writer = sorter.storage().create(&name, Compression::Plain).unwrap();
            chunk::write_chunk(&mut writer, &RmpCodec, items).unwrap();
            sorter.storage().commit(writer).unwrap();
            chunks.push(name);
        }

        let mut expected = Vec::from_iter(contents.iter().flat_map(|items| items.iter().copied()));
        expected.sort();
        assert_eq!(merge_all(&sorter, &chunks), expected);
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Keyed {
        key: u32,
        position: usize,
    }

    impl std::fmt::Display for Keyed {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{} {}", self.key, self.position)
        }
    }

    impl Record for Keyed {
        fn less(&self, other: &Self) -> Result<bool, CompareError> {
            Ok(self.key < other.key)
        }
    }

    #[rstest]
    fn test_external_sorter_stability(tmp_dir: tempfile::TempDir) {
        let mut keys = Vec::from_iter((0..20u32).flat_map(|key| (0..5).map(move |_| key)));
        keys.shuffle(&mut rand::thread_rng());
        let input = Vec::from_iter(keys.iter().enumerate().map(|(position, key)| Ok(format!("{} {}", key, position))));

        let sorter: ExternalSorter<Keyed> = ExternalSorterBuilder::new()
            .with_storage(LocalStorage::new(tmp_dir.path()))
            .with_factory(|| Keyed { key: 0, position: 0 })
            .with_parser(|line| {
                let (key, position) = line.split_once(' ')?;
                Some(Keyed {
                    key: key.parse().ok()?,
                    position: position.parse().ok()?,
                })
            })
            .with_memory_budget(40)
            .with_queue_capacity(2)
            .build()
            .unwrap();

        let chunks = sorter.split_lines("keyed", input).unwrap();
        assert!(chunks.len() > 1);

        let actual: Vec<Keyed> = sorter.merge(&chunks).unwrap().map(Result::unwrap).collect();
        let mut expected = Vec::from_iter(keys.iter().enumerate().map(|(position, &key)| Keyed { key, position }));
        expected.sort_by_key(|item| item.key);

        assert_eq!(actual.len(), 100);
        assert_eq!(actual, expected);
    }

    #[rstest]
    fn test_split_from_storage(tmp_dir: tempfile::TempDir) {
        let sorter = int_sorter(tmp_dir.path(), 4);

        let mut writer = sorter.storage().create("numbers.txt.gz", Compression::Gzip).unwrap();
        io::Write::write_all(&mut writer, b"10\n-3\nabc\n7\n\n0\n").unwrap();
        sorter.storage().commit(writer).unwrap();

        let chunks = sorter.split("numbers.txt.gz").unwrap();
        assert_eq!(chunks[0], "numbers.txt.gz.chunk.00000000");
        assert_eq!(merge_all(&sorter, &chunks), vec![-3, 0, 7, 10]);
    }

    #[rstest]
    fn test_split_skips_invalid_utf8(tmp_dir: tempfile::TempDir) {
        let observer = Arc::new(CountingObserver::default());
        let sorter: ExternalSorter<i64> = ExternalSorterBuilder::new()
            .with_storage(LocalStorage::new(tmp_dir.path()))
            .with_factory(|| 0)
            .with_parser(|line| line.parse().ok())
            .with_observer(observer.clone())
            .build()
            .unwrap();

        let mut writer = sorter.storage().create("mixed.txt", Compression::Plain).unwrap();
        io::Write::write_all(&mut writer, b"3\n\xff\xfe\n1\r\n2\n").unwrap();
        sorter.storage().commit(writer).unwrap();

        let chunks = sorter.split("mixed.txt").unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(observer.skipped.load(Ordering::SeqCst), 1);
        assert_eq!(merge_all(&sorter, &chunks), vec![1, 2, 3]);
    }

    /// Writes records with MessagePack but refuses to encode `13`.
    #[derive(Debug, Default, Clone, Copy)]
    struct UnluckyCodec;

    impl RecordCodec<i64> for UnluckyCodec {
        type EncodeError = io::Error;
        type DecodeError = rmp_serde::decode::Error;

        fn encode<W: io::Write>(&self, writer: &mut W, item: &i64) -> Result<(), Self::EncodeError> {
            if *item == 13 {
                return Err(io::Error::new(io::ErrorKind::Other, "unlucky record"));
            }
            <RmpCodec as RecordCodec<i64>>::encode(&RmpCodec, writer, item)
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
        }

        fn decode_into<R: io::Read>(&self, reader: &mut R, target: &mut i64) -> Result<(), Self::DecodeError> {
            <RmpCodec as RecordCodec<i64>>::decode_into(&RmpCodec, reader, target)
        }
    }

    #[rstest]
    fn test_split_encode_error_removes_partial_chunk(tmp_dir: tempfile::TempDir) {
        let sorter: ExternalSorter<i64, LocalStorage, UnluckyCodec> = ExternalSorterBuilder::new()
            .with_storage(LocalStorage::new(tmp_dir.path()))
            .with_codec(UnluckyCodec)
            .with_factory(|| 0)
            .with_parser(|line| line.parse().ok())
            .with_memory_budget(4)
            .build()
            .unwrap();

        // chunks: [1..=5], [6..=10], [11, 12, 13] where the last one fails after two records
        let input = Vec::from_iter((1..=20).map(|item| Ok(item.to_string())));
        let result = sorter.split_lines("partial", input);
        match result {
            Err(SortError::Chunk {
                chunk,
                source: ChunkError::SerializationError(_),
            }) => assert_eq!(chunk, "partial.chunk.00000002"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(std::fs::read_dir(tmp_dir.path()).unwrap().count(), 0);

        let chunks = sorter.split_lines("whole", lines(&["12", "11", "14"])).unwrap();
        let merged: Vec<i64> = sorter.merge(&chunks).unwrap().map(Result::unwrap).collect();
        assert_eq!(merged, vec![11, 12, 14]);
    }

    #[rstest]
    fn test_split_compare_error(tmp_dir: tempfile::TempDir) {
        let sorter: ExternalSorter<f64> = ExternalSorterBuilder::new()
            .with_storage(LocalStorage::new(tmp_dir.path()))
            .with_factory(|| 0.0)
            .with_parser(|line| line.parse().ok())
            .with_memory_budget(3)
            .build()
            .unwrap();

        let result = sorter.split_lines("floats", lines(&["1.5", "0.5", "NaN", "2.5"]));
        assert!(matches!(result, Err(SortError::CompareError(_))));
        assert!(!tmp_dir.path().join("floats.chunk.00000000").exists());
        assert!(!tmp_dir.path().join("floats.chunk.00000001").exists());
    }

    #[rstest]
    fn test_split_input_error(tmp_dir: tempfile::TempDir) {
        let sorter = int_sorter(tmp_dir.path(), 1);
        let mut input = lines(&["1", "2", "3", "4"]);
        input.push(Err(io::Error::new(io::ErrorKind::InvalidData, "broken input")));

        let result = sorter.split_lines("broken", input);
        assert!(matches!(result, Err(SortError::IO(_))));
        assert!(!tmp_dir.path().join("broken.chunk.00000000").exists());
        assert_eq!(std::fs::read_dir(tmp_dir.path()).unwrap().count(), 0);
    }

    #[rstest]
    fn test_merge_corrupted_chunk(tmp_dir: tempfile::TempDir) {
        let sorter = int_sorter(tmp_dir.path(), 1024);
        let chunks = sorter.split_lines("corrupted", lines(&["3", "1", "2"])).unwrap();

        let path = tmp_dir.path().join(&chunks[0]);
        let mut data = std::fs::read(&path).unwrap();
        data.truncate(data.len() - 1);
        std::fs::write(&path, data).unwrap();

        let result: Vec<_> = sorter.merge(&chunks).unwrap().collect();
        assert_eq!(result.len(), 3);
        assert_eq!(*result[0].as_ref().unwrap(), 1);
        assert_eq!(*result[1].as_ref().unwrap(), 2);
        match &result[2] {
            Err(SortError::Chunk {
                chunk,
                source: ChunkError::CountMismatch { declared, decoded },
            }) => {
                assert_eq!(chunk, &chunks[0]);
                assert_eq!((*declared, *decoded), (3, 2));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[rstest]
    fn test_merge_missing_chunk(tmp_dir: tempfile::TempDir) {
        let sorter = int_sorter(tmp_dir.path(), 1024);

        let result = sorter.merge(&["missing.chunk.00000000".to_string()]);
        assert!(matches!(
            result,
            Err(SortError::Chunk {
                source: ChunkError::IO(_),
                ..
            })
        ));
    }

    #[rstest]
    fn test_merge_cancel(tmp_dir: tempfile::TempDir) {
        let sorter = int_sorter(tmp_dir.path(), 2048);
        let input = Vec::from_iter((0..5000).rev().map(|item| Ok(item.to_string())));
        let chunks = sorter.split_lines("cancelled", input).unwrap();
        assert!(chunks.len() > 2);

        let mut merger = sorter.merge(&chunks).unwrap();
        assert_eq!(merger.next().unwrap().unwrap(), 0);
        merger.cancel_token().cancel();
        assert!(matches!(merger.next(), Some(Err(SortError::Cancelled))));
        assert!(merger.next().is_none());

        sorter.remove_chunks(&chunks).unwrap();
    }

    #[test]
    fn test_builder_requires_parser() {
        let result: Result<ExternalSorter<i64>, _> = ExternalSorterBuilder::new().with_factory(|| 0).build();
        assert!(matches!(result, Err(SortError::Config(_))));

        let result: Result<ExternalSorter<i64>, _> = ExternalSorterBuilder::new()
            .with_parser(|line| line.parse().ok())
            .build();
        assert!(matches!(result, Err(SortError::Config(_))));
    }
}
