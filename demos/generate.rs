use anyhow::Result;
use std::{env, path::Path};
use tracing_subscriber::EnvFilter;

use datalog::{DataLog, DataLogConfig, Entry, StructSerializable};

#[derive(Clone, Copy, Debug, PartialEq)]
struct Translation2d {
    x: f64,
    y: f64,
}

impl StructSerializable for Translation2d {
    const TYPE_NAME: &'static str = "Translation2d";
    const SCHEMA: &'static str = "double x;double y";
    const SIZE: usize = 16;

    fn pack(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.x.to_le_bytes());
        buf.extend_from_slice(&self.y.to_le_bytes());
    }
}

fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = env::args().collect::<Vec<String>>();
    let filename = args.get(1).map_or("generate-out.wpilog", String::as_str);

    println!("Writing example file with all datatypes to {filename}");

    let path = Path::new(filename);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let log = DataLog::create_file(
        dir,
        &name,
        DataLogConfig::default().with_extra_header("generated by the datalog demo"),
    )?;

    let raw = log.new_entry::<Vec<u8>>("NT:Primitives/raw", "")?;
    let boolean = log.new_lazy_entry::<bool>("NT:Primitives/boolean", "")?;
    let int64 = log.new_lazy_entry::<i64>("NT:Primitives/int64", "")?;
    let float = log.new_entry::<f32>("NT:Primitives/float", "")?;
    let double = log.new_entry::<f64>("NT:Primitives/double", "")?;
    let string = log.new_entry::<String>("NT:Primitives/string", "")?;

    let boolean_array = log.new_entry::<Vec<bool>>("NT:Array/boolean", "")?;
    let int64_array = log.new_entry::<Vec<i64>>("NT:Array/int64", "")?;
    let float_array = log.new_entry::<Vec<f32>>("NT:Array/float", "")?;
    let double_array = log.new_entry::<Vec<f64>>("NT:Array/double", "")?;
    let string_array = log.new_entry::<Vec<String>>("NT:Array/string", "")?;

    let pose = log.new_struct_entry::<Translation2d>("NT:Struct/pose", "")?;
    let waypoints = log.new_struct_array_entry::<Translation2d>("NT:Struct/waypoints", "")?;

    let words = ["Hello", ", ", "World", "!"];
    for step in 1..=4u8 {
        let time = u64::from(step) * 1_000_000;
        let scale = f64::from(step);

        raw.append(&vec![step >> 1, step & 1], time)?;
        boolean.update(&(step % 2 == 0), time)?;
        int64.update(&(1i64 << step.min(3)), time)?;
        float.append(&(0.25 * scale as f32), time)?;
        double.append(&(2.5e-10 * scale), time)?;
        string.append(&words[usize::from(step - 1)].to_string(), time)?;

        boolean_array.append(&vec![step & 2 != 0, step & 1 != 0], time)?;
        int64_array.append(&vec![i64::from(step) - 3, i64::from(step) - 2], time)?;
        float_array.append(&vec![0.5 * scale as f32 - 1.5, 0.5 * scale as f32 - 1.0], time)?;
        double_array.append(&vec![-1e-10 * scale, 1e-10 * scale], time)?;
        string_array.append(&words.iter().map(ToString::to_string).collect::<Vec<_>>(), time)?;

        pose.append(&Translation2d { x: scale, y: -scale }, time)?;
        waypoints.append(
            &vec![Translation2d { x: 0.0, y: 0.0 }, Translation2d { x: scale, y: scale }],
            time,
        )?;
    }

    // Unchanged, so the lazy entry skips it
    int64.update(&8, 5_000_000)?;

    log.close()?;

    let stats = log.stats();
    println!(
        "Wrote {} bytes ({} write failures)",
        stats.bytes_written, stats.write_failures
    );

    Ok(())
}
