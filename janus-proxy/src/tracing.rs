//! Provide tracing, tailored to this program.
//!
//! The binary calls [`init_journald_or_stdout`] once at startup to
//! install a subscriber. Event emission elsewhere goes through the
//! standard `tracing` macros; the structured proxy events additionally
//! carry the `janus_proxy::event` target so a log collaborator can
//! subscribe to just those.

use std::{env, fmt};

use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer as FmtWriter, time::FormatTime},
    prelude::*,
};

#[cfg(target_os = "linux")]
use std::{io, os::unix::io::AsRawFd};

#[cfg(target_os = "linux")]
use nix::libc;

use tracing::error;

/// Check if stderr is connected to the systemd journal by validating
/// JOURNAL_STREAM.
///
/// Per systemd documentation, programs should parse the device and
/// inode numbers from JOURNAL_STREAM and compare them against stderr to
/// detect I/O redirection and ensure the connection is genuine.
#[cfg(target_os = "linux")]
fn stderr_is_journal_stream() -> bool {
    let journal_stream = match env::var("JOURNAL_STREAM") {
        Ok(val) => val,
        Err(_) => return false,
    };

    let mut parts = journal_stream.split(':');
    let (dev, ino) = match (parts.next(), parts.next(), parts.next()) {
        (Some(dev), Some(ino), None) => (dev, ino),
        _ => return false,
    };
    let expected_dev: u64 = match dev.parse() {
        Ok(dev) => dev,
        Err(_) => return false,
    };
    let expected_ino: u64 = match ino.parse() {
        Ok(ino) => ino,
        Err(_) => return false,
    };

    let stderr = io::stderr();
    let fd = stderr.as_raw_fd();

    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }

    stat.st_dev == expected_dev && stat.st_ino == expected_ino
}

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall back to
/// stdout.
pub fn init_journald_or_stdout() {
    #[cfg(target_os = "linux")]
    {
        if stderr_is_journal_stream() {
            if let Ok(layer) = tracing_journald::layer() {
                tracing_subscriber::registry().with(layer).init();
                return;
            } else {
                error!("Failed to initialize journald logging, using stdout.");
            }
        }
    }

    use_stdout();
}

// Log to stdout, filtering according to environment variable RUST_LOG,
// overriding the default level (ERROR) to INFO.
fn use_stdout() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTimer)
                .with_target(true),
        )
        .init();
}

// Local-time timestamps to the nearest second. The default timer is UTC
// and formats a long, ugly string.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut FmtWriter<'_>) -> fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        write!(
            w,
            "{}",
            now.format(time::macros::format_description!(
                "[hour]:[minute]:[second]"
            ))
            .unwrap_or_default(),
        )
    }
}
