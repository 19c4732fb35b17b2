use anyhow::{format_err, Result};
use std::env;
use tracing_subscriber::EnvFilter;

use datalog::{DataLogReader, Record};

fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = env::args().collect::<Vec<String>>();
    let filename = args
        .get(1)
        .ok_or_else(|| format_err!("Need a file to read from"))?;

    let count = args
        .get(2)
        .and_then(|count| count.parse().ok())
        .unwrap_or(10);

    println!("Reading first {count} record(s) from {filename}");

    let reader = DataLogReader::from_file(filename)?;
    println!("Extra header: {:?}", reader.extra_header());

    let mut records = 0;
    for record in &reader {
        if records < count {
            let record = Record::try_from(record)?;
            dbg!(record);
        }

        records += 1;
    }

    println!("The file had {records} record(s) in total.");

    Ok(())
}
