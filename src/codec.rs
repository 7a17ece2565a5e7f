//! Record serialization.

use std::error::Error;
use std::io::{Read, Write};

/// Record serialization interface.
///
/// Encoded records must be self-delimiting: a decoder reads exactly one record from the stream and leaves the
/// reader positioned at the beginning of the next one. Round trip must be exact.
pub trait RecordCodec<T>: Send + Sync + 'static {
    /// Record serialization error.
    type EncodeError: Error + Send + 'static;
    /// Record deserialization error.
    type DecodeError: Error + Send + 'static;

    /// Writes a single record to the writer.
    fn encode<W: Write>(&self, writer: &mut W, item: &T) -> Result<(), Self::EncodeError>;

    /// Reads a single record from the reader into a target produced by the record factory.
    fn decode_into<R: Read>(&self, reader: &mut R, target: &mut T) -> Result<(), Self::DecodeError>;
}

/// RMP (Rust MessagePack) record codec.
/// It uses MessagePack as a data serialization format.
/// For more information see https://msgpack.org/.
#[derive(Debug, Clone, Copy, Default)]
pub struct RmpCodec;

impl<T> RecordCodec<T> for RmpCodec
where
    T: serde::ser::Serialize + serde::de::DeserializeOwned,
{
    type EncodeError = rmp_serde::encode::Error;
    type DecodeError = rmp_serde::decode::Error;

    fn encode<W: Write>(&self, writer: &mut W, item: &T) -> Result<(), Self::EncodeError> {
        rmp_serde::encode::write(writer, item)
    }

    fn decode_into<R: Read>(&self, reader: &mut R, target: &mut T) -> Result<(), Self::DecodeError> {
        *target = rmp_serde::decode::from_read(reader)?;
        return Ok(());
    }
}
