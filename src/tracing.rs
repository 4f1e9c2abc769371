use std::fs::File;
use std::sync::Mutex;

use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// - Create a formatting subscriber for outputting logs to stderr
/// - Filter using the `RUST_LOG` env variable
/// - If `RUST_LOG` is not set, filter using the `verbose` argument:
///     - 0: info
///     - 1: debug
///     - 2: trace
/// - If `main_log` is given, mirror everything into that file as well
pub fn init(verbose: u8, main_log: Option<File>) {
    let env_filter = EnvFilter::try_from_default_env().ok();
    let env_filter = env_filter.unwrap_or(match verbose {
        0 => EnvFilter::from("info"),
        1 => EnvFilter::from("debug"),
        _ => EnvFilter::from("trace"),
    });

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    let file_layer = main_log.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_filter(EnvFilter::from("debug"))
    });

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
}
