use std::fmt::{Display, Formatter};
use std::fs;
use std::io::{self, prelude::*};

use env_logger;
use log;
use serde;

use ext_merge_sort::{CompareError, ExternalSorter, ExternalSorterBuilder, LocalStorage, Record};

#[derive(Default, serde::Serialize, serde::Deserialize)]
struct Measurement {
    sensor: String,
    value: f64,
}

impl Measurement {
    fn from_csv(line: &str) -> Option<Self> {
        let (sensor, value) = line.split_once(',')?;
        Some(Measurement {
            sensor: sensor.to_string(),
            value: value.trim().parse().ok()?,
        })
    }
}

impl Display for Measurement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.sensor, self.value)
    }
}

impl Record for Measurement {
    // sorted by value then by sensor, a NaN reading makes the whole sort fail
    fn less(&self, other: &Self) -> Result<bool, CompareError> {
        match self.value.partial_cmp(&other.value) {
            Some(ordering) => Ok(ordering.then_with(|| self.sensor.cmp(&other.sensor)).is_lt()),
            None => Err(CompareError::new(format!("readings {} and {} have no order", self, other))),
        }
    }
}

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let mut output_writer = io::BufWriter::new(fs::File::create("output.csv").unwrap());

    let sorter: ExternalSorter<Measurement> = ExternalSorterBuilder::new()
        .with_storage(LocalStorage::new("./"))
        .with_factory(Measurement::default)
        .with_parser(Measurement::from_csv)
        .with_memory_budget(1_000_000)
        .build()
        .unwrap();

    let chunks = match sorter.split("input.csv") {
        Ok(chunks) => chunks,
        Err(err) => {
            log::error!("{}", err);
            return;
        }
    };

    for item in sorter.merge(&chunks).unwrap() {
        match item {
            Ok(item) => output_writer.write_all(format!("{}\n", item).as_bytes()).unwrap(),
            Err(err) => {
                log::error!("{}", err);
                break;
            }
        }
    }
    output_writer.flush().unwrap();

    sorter.remove_chunks(&chunks).unwrap();
}
