use std::{num::NonZeroU8, panic, path::Path};

use anyhow::Result;
use time::format_description::well_known::{iso8601, Iso8601};
use tracing::{error, Level};
use tracing_subscriber::{
    fmt::{time::LocalTime, writer::MakeWriterExt},
    prelude::__tracing_subscriber_SubscriberExt,
    EnvFilter, Layer,
};

const MY_CONFIG: iso8601::EncodedConfig = iso8601::Config::DEFAULT
    .set_time_precision(iso8601::TimePrecision::Second {
        decimal_digits: NonZeroU8::new(3),
    })
    .encode();

const LOG_FILE_NAME: &str = "sendrecv.log";

fn default_directives() -> &'static str {
    if cfg!(debug_assertions) {
        "sendrecv=trace,sendrecv_lib=trace"
    } else {
        "sendrecv=info,sendrecv_lib=info"
    }
}

fn make_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives()))
}

/// Logs to stderr, and additionally to `<log_dir>/sendrecv.log` (warnings and
/// above) when a directory is given.
pub fn init_tracing(log_dir: Option<&Path>) -> Result<()> {
    let default_layer = || {
        const WITH_FILE_PATH: bool = cfg!(debug_assertions);
        tracing_subscriber::fmt::layer()
            .compact()
            .with_file(WITH_FILE_PATH)
            .with_line_number(WITH_FILE_PATH)
            .with_target(!WITH_FILE_PATH)
            .with_thread_ids(true)
            .with_timer(LocalTime::new(Iso8601::<MY_CONFIG>))
    };
    let stderr_layer = default_layer()
        .with_writer(std::io::stderr)
        .with_filter(make_filter());

    let file_layer = log_dir.map(|dir| {
        let writer = tracing_appender::rolling::never(dir, LOG_FILE_NAME)
            .with_max_level(Level::WARN);
        default_layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(make_filter())
    });

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(stderr_layer.and_then(file_layer)),
    )?;

    panic::set_hook(Box::new(|panic| error!("{}", panic)));
    Ok(())
}
