use std::error::Error;
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use ext_merge_sort::{Compression, ExternalSorter, ExternalSorterBuilder, LocalStorage, Record, RecordCodec};

struct Options {
    input: String,
    output: String,
    tmp_dir: Option<String>,
    chunk_size: u64,
    threads: Option<usize>,
    queue_capacity: Option<usize>,
    compression: Compression,
    keep_chunks: bool,
}

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let options = Options {
        input: arg_parser.value_of("input").expect("value is required").to_string(),
        output: arg_parser.value_of("output").expect("value is required").to_string(),
        tmp_dir: arg_parser.value_of("tmp_dir").map(str::to_string),
        chunk_size: arg_parser
            .value_of("chunk_size")
            .expect("value is required")
            .parse::<ByteSize>()
            .expect("value is pre-validated")
            .as_u64(),
        threads: arg_parser
            .is_present("threads")
            .then(|| arg_parser.value_of_t_or_exit("threads")),
        queue_capacity: arg_parser
            .is_present("queue_capacity")
            .then(|| arg_parser.value_of_t_or_exit("queue_capacity")),
        compression: if arg_parser.is_present("gzip") {
            Compression::Gzip
        } else {
            Compression::Plain
        },
        keep_chunks: arg_parser.is_present("keep_chunks"),
    };

    let result = if arg_parser.is_present("numeric") {
        run::<i64>(&options, |line| line.trim().parse().ok(), || 0)
    } else {
        run::<String>(&options, |line| Some(line.to_string()), String::new)
    };

    if let Err(err) = result {
        log::error!("{}", err);
        process::exit(1);
    }
}

fn run<T>(
    options: &Options,
    parser: fn(&str) -> Option<T>,
    factory: fn() -> T,
) -> Result<(), Box<dyn Error>>
where
    T: Record + serde::Serialize + serde::de::DeserializeOwned,
{
    let mut sorter_builder = ExternalSorterBuilder::new()
        .with_factory(factory)
        .with_parser(parser)
        .with_memory_budget(options.chunk_size)
        .with_chunk_compression(options.compression);
    if let Some(threads) = options.threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }
    if let Some(queue_capacity) = options.queue_capacity {
        sorter_builder = sorter_builder.with_queue_capacity(queue_capacity);
    }

    let sorter: ExternalSorter<T> = sorter_builder
        .build()
        .map_err(|err| format!("sorter initialization error: {}", err))?;

    let input_stream = sorter
        .storage()
        .open_read(&options.input, Compression::Detect)
        .map_err(|err| format!("input file opening error: {}", err))?;
    let prefix = chunk_prefix(&options.input, options.tmp_dir.as_deref());

    let chunks = sorter
        .split_reader(&prefix, input_stream)
        .map_err(|err| format!("data splitting error: {}", err))?;

    let result = write_sorted(&sorter, &chunks, &options.output);

    if options.keep_chunks {
        log::info!("keeping {} chunks", chunks.len());
    } else if let Err(err) = sorter.remove_chunks(&chunks) {
        log::warn!("chunks removal error: {}", err);
    }

    return result;
}

fn write_sorted<T, C>(
    sorter: &ExternalSorter<T, LocalStorage, C>,
    chunks: &[String],
    output: &str,
) -> Result<(), Box<dyn Error>>
where
    T: Record,
    C: RecordCodec<T>,
{
    let mut output_stream = fs::File::create(output)
        .map(io::BufWriter::new)
        .map_err(|err| format!("output file creation error: {}", err))?;

    let sorted_stream = sorter
        .merge(chunks)
        .map_err(|err| format!("data merging error: {}", err))?;

    for item in sorted_stream {
        let item = item.map_err(|err| format!("sorting stream error: {}", err))?;
        output_stream
            .write_all(format!("{}\n", item).as_bytes())
            .map_err(|err| format!("data saving error: {}", err))?;
    }

    output_stream
        .flush()
        .map_err(|err| format!("data flushing error: {}", err))?;

    return Ok(());
}

fn chunk_prefix(input: &str, tmp_dir: Option<&str>) -> String {
    match tmp_dir {
        Some(tmp_dir) => {
            let file_name = Path::new(input)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "input".to_string());
            Path::new(tmp_dir).join(file_name).to_string_lossy().into_owned()
        }
        None => input.to_string(),
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("ext-merge-sort")
        .about("external merge sorter")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("numeric")
                .short('n')
                .long("numeric")
                .help("sort lines as integers, unparseable lines are skipped"),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel chunk sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("queue_capacity")
                .short('q')
                .long("queue-capacity")
                .help("number of records buffered per chunk while merging")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store chunks")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("gzip")
                .short('z')
                .long("gzip")
                .help("compress chunks with gzip"),
        )
        .arg(
            clap::Arg::new("keep_chunks")
                .short('k')
                .long("keep-chunks")
                .help("do not remove chunks after merging"),
        )
        .arg(
            clap::Arg::new("chunk_size")
                .short('c')
                .long("chunk-size")
                .help("chunk memory budget")
                .required(true)
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Chunk size format incorrect: {}", err)),
                }),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
