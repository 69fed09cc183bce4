use anyhow::Result;
use chrono::Local;
use env_logger::{Builder, Target};
use log::LevelFilter;
use std::io::Write;

/// Initialize logging. A file target can come from the command line or the
/// `BRIDGE485_LOG_FILE` environment variable; otherwise logs go to stderr
/// under the usual `RUST_LOG` control.
pub fn init_logging(log_file: Option<&str>) -> Result<()> {
    let path = log_file
        .map(str::to_owned)
        .or_else(|| std::env::var("BRIDGE485_LOG_FILE").ok());

    match path {
        Some(path) => init_file_logger(&path),
        None => {
            env_logger::init();
            Ok(())
        }
    }
}

fn init_file_logger(path: &str) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    Builder::from_default_env()
        .target(Target::Pipe(Box::new(file)))
        .filter_level(LevelFilter::Debug)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {:<5} {}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
    Ok(())
}
