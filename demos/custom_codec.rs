use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::{self, prelude::*};

use env_logger;
use log;

use ext_merge_sort::{ExternalSorter, ExternalSorterBuilder, LocalStorage, RecordCodec};

#[derive(Debug)]
enum FixedWidthError {
    IO(io::Error),
}

impl Display for FixedWidthError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FixedWidthError::IO(err) => write!(f, "fixed width codec I/O error: {}", err),
        }
    }
}

impl Error for FixedWidthError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FixedWidthError::IO(err) => Some(err),
        }
    }
}

/// Encodes every record as 8 little-endian bytes.
#[derive(Default)]
struct FixedWidthCodec;

impl RecordCodec<i64> for FixedWidthCodec {
    type EncodeError = FixedWidthError;
    type DecodeError = FixedWidthError;

    fn encode<W: Write>(&self, writer: &mut W, item: &i64) -> Result<(), Self::EncodeError> {
        writer.write_all(&item.to_le_bytes()).map_err(FixedWidthError::IO)
    }

    fn decode_into<R: Read>(&self, reader: &mut R, target: &mut i64) -> Result<(), Self::DecodeError> {
        let mut bytes = [0u8; 8];
        reader.read_exact(&mut bytes).map_err(FixedWidthError::IO)?;
        *target = i64::from_le_bytes(bytes);
        Ok(())
    }
}

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let mut output_writer = io::BufWriter::new(fs::File::create("output.txt").unwrap());

    let sorter: ExternalSorter<i64, LocalStorage, FixedWidthCodec> = ExternalSorterBuilder::new()
        .with_storage(LocalStorage::new("./"))
        .with_codec(FixedWidthCodec)
        .with_factory(|| 0)
        .with_parser(|line| line.trim().parse().ok())
        .with_memory_budget(50 * 1024 * 1024)
        .build()
        .unwrap();

    let chunks = sorter.split("input.txt").unwrap();
    for item in sorter.merge(&chunks).unwrap().map(Result::unwrap) {
        output_writer.write_all(format!("{}\n", item).as_bytes()).unwrap();
    }
    output_writer.flush().unwrap();

    sorter.remove_chunks(&chunks).unwrap();
}
