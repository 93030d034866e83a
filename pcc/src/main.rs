use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use chrono::Local;
use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use pcc_lib::error::Error;

const CONTAINER_PATH: &str = "compressed.bin";

#[derive(Parser, Debug)]
#[command(
    name = "PLY Point Cloud Codec",
    version = "1.0",
    about = "Compresses a PLY point cloud through a TLV payload container and back"
)]
struct Cli {
    /// Path to the input PLY file.
    input: PathBuf,

    /// Path to the output PLY file.
    output: PathBuf,
}

fn main() {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, LevelFilter::Info)
        .init();

    let cli = Cli::try_parse().unwrap_or_else(|err| {
        // Usage mistakes exit 1; --help and --version stay 0.
        let code = if err.use_stderr() { 1 } else { 0 };
        let _ = err.print();
        process::exit(code);
    });

    if let Err(e) = run(&cli) {
        log::error!("{}", e);
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Error> {
    let container = Path::new(CONTAINER_PATH);

    let start = Instant::now();
    log::info!(
        "Compressing '{}' into '{}'",
        cli.input.display(),
        container.display()
    );
    let stats = pcc_lib::encode_file(&cli.input, container)?;
    log::info!(
        "Wrote {} payload units, {} bytes in {} ms",
        stats.units,
        stats.bytes,
        start.elapsed().as_millis()
    );

    let start = Instant::now();
    log::info!(
        "Decompressing '{}' into '{}'",
        container.display(),
        cli.output.display()
    );
    let points = pcc_lib::decode_file(container, &cli.output)?;
    log::info!(
        "Reconstructed {} points in {} ms",
        points,
        start.elapsed().as_millis()
    );

    Ok(())
}
