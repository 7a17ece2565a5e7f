//! Chunk binary format.
//!
//! A chunk is a count-prefixed sequence of serialized records:
//! `[record_count][record_1][record_2]...[record_n]`. The count is a MessagePack unsigned integer,
//! records are encoded by a [`RecordCodec`] and must be self-delimiting.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::io::prelude::*;
use std::sync::Arc;

use crate::codec::RecordCodec;

/// Chunk encoding or decoding error.
#[derive(Debug)]
pub enum ChunkError<S: Error, D: Error> {
    /// Common I/O error.
    IO(io::Error),
    /// Record count header serialization error.
    HeaderWrite(rmp_serde::encode::Error),
    /// Record count header deserialization error.
    HeaderRead(rmp_serde::decode::Error),
    /// Record serialization error.
    SerializationError(S),
    /// Record deserialization error.
    DeserializationError(D),
    /// Chunk ended before the declared number of records was decoded.
    CountMismatch { declared: u64, decoded: u64 },
    /// Chunk contains data after the declared number of records.
    TrailingData { declared: u64 },
}

impl<S, D> Error for ChunkError<S, D>
where
    S: Error + 'static,
    D: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            ChunkError::IO(err) => Some(err),
            ChunkError::HeaderWrite(err) => Some(err),
            ChunkError::HeaderRead(err) => Some(err),
            ChunkError::SerializationError(err) => Some(err),
            ChunkError::DeserializationError(err) => Some(err),
            ChunkError::CountMismatch { .. } | ChunkError::TrailingData { .. } => None,
        }
    }
}

impl<S: Error, D: Error> Display for ChunkError<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ChunkError::IO(err) => write!(f, "I/O operation failed: {}", err),
            ChunkError::HeaderWrite(err) => write!(f, "record count serialization error: {}", err),
            ChunkError::HeaderRead(err) => write!(f, "record count deserialization error: {}", err),
            ChunkError::SerializationError(err) => write!(f, "data serialization error: {}", err),
            ChunkError::DeserializationError(err) => write!(f, "data deserialization error: {}", err),
            ChunkError::CountMismatch { declared, decoded } => write!(
                f,
                "chunk is truncated: {} records declared, {} decoded",
                declared, decoded
            ),
            ChunkError::TrailingData { declared } => {
                write!(f, "chunk has unexpected data after {} declared records", declared)
            }
        }
    }
}

impl<S: Error, D: Error> From<io::Error> for ChunkError<S, D> {
    fn from(err: io::Error) -> Self {
        ChunkError::IO(err)
    }
}

/// Builds a chunk name: `<prefix>.chunk.<index, 8-digit zero-padded><extension>`.
pub fn chunk_name(prefix: &str, index: usize, extension: &str) -> String {
    format!("{}.chunk.{:08}{}", prefix, index, extension)
}

/// Writes records to the writer as a single chunk. Returns the number of written records.
pub fn write_chunk<T, W, C>(
    writer: &mut W,
    codec: &C,
    items: &[T],
) -> Result<u64, ChunkError<C::EncodeError, C::DecodeError>>
where
    W: Write,
    C: RecordCodec<T>,
{
    let count = items.len() as u64;
    rmp_serde::encode::write(writer, &count).map_err(ChunkError::HeaderWrite)?;

    for item in items {
        codec.encode(writer, item).map_err(ChunkError::SerializationError)?;
    }

    return Ok(count);
}

/// Streaming chunk reader.
///
/// Decodes records one at a time so that many chunks can be read concurrently without loading them into memory.
/// Iteration stops after the declared number of records; any disagreement between the declared count
/// and the chunk content is reported as an error.
pub struct ChunkReader<T, R, C>
where
    C: RecordCodec<T>,
{
    reader: R,
    codec: Arc<C>,
    factory: Arc<dyn Fn() -> T + Send + Sync>,
    declared: u64,
    decoded: u64,
    finished: bool,
}

impl<T, R, C> ChunkReader<T, R, C>
where
    R: BufRead,
    C: RecordCodec<T>,
{
    /// Reads the chunk header and creates a reader positioned at the first record.
    ///
    /// # Arguments
    /// * `reader` - Chunk data source
    /// * `codec` - Record codec the chunk was written with
    /// * `factory` - Creates decode targets
    pub fn open(
        mut reader: R,
        codec: Arc<C>,
        factory: Arc<dyn Fn() -> T + Send + Sync>,
    ) -> Result<Self, ChunkError<C::EncodeError, C::DecodeError>> {
        let declared: u64 = rmp_serde::decode::from_read(&mut reader).map_err(ChunkError::HeaderRead)?;

        return Ok(ChunkReader {
            reader,
            codec,
            factory,
            declared,
            decoded: 0,
            finished: false,
        });
    }

    /// Returns the number of records declared in the chunk header.
    pub fn declared_count(&self) -> u64 {
        self.declared
    }

    fn read_next(&mut self) -> Result<Option<T>, ChunkError<C::EncodeError, C::DecodeError>> {
        if self.decoded == self.declared {
            if !self.reader.fill_buf()?.is_empty() {
                return Err(ChunkError::TrailingData {
                    declared: self.declared,
                });
            }
            return Ok(None);
        }

        if self.reader.fill_buf()?.is_empty() {
            return Err(ChunkError::CountMismatch {
                declared: self.declared,
                decoded: self.decoded,
            });
        }

        let mut item = (self.factory)();
        self.codec
            .decode_into(&mut self.reader, &mut item)
            .map_err(ChunkError::DeserializationError)?;
        self.decoded += 1;

        return Ok(Some(item));
    }
}

impl<T, R, C> Iterator for ChunkReader<T, R, C>
where
    R: BufRead,
    C: RecordCodec<T>,
{
    type Item = Result<T, ChunkError<C::EncodeError, C::DecodeError>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let result = self.read_next().transpose();
        if !matches!(result, Some(Ok(_))) {
            self.finished = true;
        }

        return result;
    }
}
