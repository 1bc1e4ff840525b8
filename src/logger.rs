use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Context;
use time::{
    format_description::{self, parse},
    OffsetDateTime,
};
use tracing::{subscriber::set_global_default, Level};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, FmtSubscriber};

/// Install a global subscriber writing every event, down to `TRACE`, to a timestamped log file
/// in `directory`. Returns the path of the file.
///
/// Fails if a global subscriber is already set.
pub fn init_logger(directory: impl AsRef<Path>) -> anyhow::Result<PathBuf> {
    let path = directory.as_ref().join(get_log_file_name()?);
    let file = File::create(&path)
        .with_context(|| format!("could not create log file {}", path.display()))?;
    let writer = BoxMakeWriter::new(file);
    let local_offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")?,
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::TRACE)
        .with_ansi(false)
        .with_timer(timer)
        .with_writer(writer)
        .finish();

    set_global_default(subscriber).context(
        "Could not set global default tracing subscriber. Consider disabling logs if you are already setting a subscriber.",
    )?;
    Ok(path)
}

fn get_log_file_name() -> anyhow::Result<String> {
    let format = parse("[year]-[month]-[day]_[hour]-[minute]-[second]_league_log.txt")?;
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    Ok(now.format(&format)?)
}
