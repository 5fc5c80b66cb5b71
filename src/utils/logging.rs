use std::fs::File;
use std::io::Write;

use anyhow::{Context, Result};
use env_logger::{Env, Target};

pub const LOG_FILE: &str = "/tmp/openwrt-ids-ips.log";

/// Truncates the log file and routes all log output there, one
/// `timestamp - LEVEL - message` line per record. `RUST_LOG` overrides the
/// default `info` filter.
pub fn init_logging(path: &str) -> Result<()> {
    let file = File::create(path).with_context(|| format!("cannot create log file {}", path))?;

    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(file)))
        .try_init()
        .context("logger already initialized")?;
    Ok(())
}
