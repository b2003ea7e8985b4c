use std::{fs::File, path::PathBuf};

use anyhow::Context;
use time::{
    format_description::{self, parse},
    OffsetDateTime,
};
use tracing::{subscriber::set_global_default, Level};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, FmtSubscriber};

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    /// A new timestamped file in this directory.
    Directory(PathBuf),
}

/// Install the global subscriber. `name` identifies the binary in log file names.
/// Returns the log file, if any.
pub fn init_logger(target: &LogTarget, level: Level, name: &str) -> anyhow::Result<Option<PathBuf>> {
    let (writer, ansi, path) = match target {
        LogTarget::Stderr => (BoxMakeWriter::new(std::io::stderr), true, None),
        LogTarget::Directory(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("could not create log directory {}", dir.display()))?;
            let path = dir.join(get_log_file_name(name)?);
            let file = File::create(&path)
                .with_context(|| format!("could not create log file {}", path.display()))?;
            (BoxMakeWriter::new(file), false, Some(path))
        }
    };
    // the local offset cannot be read once other threads run
    let local_offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")?,
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_ansi(ansi)
        .with_timer(timer)
        .with_writer(writer)
        .finish();

    set_global_default(subscriber)
        .context("could not set global default tracing subscriber, one is already installed")?;
    Ok(path)
}

fn get_log_file_name(name: &str) -> anyhow::Result<String> {
    let format = parse("[year]-[month]-[day]_[hour]-[minute]-[second]")?;
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    Ok(format!("{}_{name}.log", now.format(&format)?))
}
