use std::fs;
use std::io::{self, prelude::*};

use env_logger;
use log;

use ext_merge_sort::{Compression, ExternalSorter, ExternalSorterBuilder, LocalStorage};

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let mut output_writer = io::BufWriter::new(fs::File::create("output.txt").unwrap());

    let sorter: ExternalSorter<String> = ExternalSorterBuilder::new()
        .with_storage(LocalStorage::new("./"))
        .with_factory(String::new)
        .with_parser(|line| Some(line.to_string()))
        .with_memory_budget(50 * 1024 * 1024)
        .with_chunk_compression(Compression::Gzip)
        .build()
        .unwrap();

    let chunks = sorter.split("input.txt").unwrap();
    let merger = sorter.merge(&chunks).unwrap();
    for item in merger.map(Result::unwrap) {
        output_writer.write_all(format!("{}\n", item).as_bytes()).unwrap();
    }
    output_writer.flush().unwrap();

    sorter.remove_chunks(&chunks).unwrap();
}
