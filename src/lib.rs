//! `ext-merge-sort` is a memory bounded external sort with a concurrent k-way merge.
//!
//! The sort runs in two phases. [`ExternalSorter::split`] reads the input line by line, buffers parsed records
//! until their source lines exceed the memory budget, sorts every buffer in place and persists it as a chunk.
//! [`ExternalSorter::merge`] streams all chunks back and merges them into one lazily produced sorted sequence.
//! Chunks are left to the caller, see [`ExternalSorter::remove_chunks`].
//! For background see [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! * **Record agnostic:**
//!   any type implementing [`Record`] can be sorted. Comparison is fallible: an ill-defined order aborts
//!   the sort instead of producing garbage.
//! * **Serialization format agnostic:**
//!   chunks are encoded with `MessagePack` by default, any [`RecordCodec`] can be used instead.
//! * **Storage agnostic:**
//!   the input and the chunks are accessed through a [`Storage`], the local file system with optional gzip
//!   compression is provided.
//! * **Concurrent merge:**
//!   every chunk is decoded by its own thread feeding a bounded queue, so merge memory is bounded by
//!   the number of chunks times the queue capacity. The merge can be cancelled at any time.
//!
//! # Example
//!
//! ```no_run
//! use std::fs;
//! use std::io::{self, prelude::*};
//!
//! use ext_merge_sort::{ExternalSorter, ExternalSorterBuilder, LocalStorage};
//!
//! fn main() {
//!     let mut output_writer = io::BufWriter::new(fs::File::create("output.txt").unwrap());
//!
//!     let sorter: ExternalSorter<i64> = ExternalSorterBuilder::new()
//!         .with_storage(LocalStorage::new("./"))
//!         .with_factory(|| 0)
//!         .with_parser(|line| line.trim().parse().ok())
//!         .with_memory_budget(50 * 1024 * 1024)
//!         .build()
//!         .unwrap();
//!
//!     let chunks = sorter.split("input.txt").unwrap();
//!     for item in sorter.merge(&chunks).unwrap().map(Result::unwrap) {
//!         output_writer.write_all(format!("{}\n", item).as_bytes()).unwrap();
//!     }
//!     output_writer.flush().unwrap();
//!
//!     sorter.remove_chunks(&chunks).unwrap();
//! }
//! ```

pub mod buffer;
pub mod chunk;
pub mod codec;
pub mod merger;
pub mod observer;
pub mod record;
pub mod sort;
pub mod storage;

pub use buffer::ChunkBuffer;
pub use chunk::{ChunkError, ChunkReader};
pub use codec::{RecordCodec, RmpCodec};
pub use merger::{CancelToken, ChunkMerger};
pub use observer::{LogObserver, SortObserver, SplitStats};
pub use record::{CompareError, Record};
pub use sort::{ExternalSorter, ExternalSorterBuilder, SortError};
pub use storage::{Compression, LocalStorage, Storage};
