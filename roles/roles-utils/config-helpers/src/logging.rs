use std::{fs::OpenOptions, io, path::Path, str::FromStr};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Default filter used when `RUST_LOG` is unset or unparsable.
const DEFAULT_LEVEL: LevelFilter = LevelFilter::INFO;

/// Initialize logging to stdout and optionally to a file.
///
/// If `log_file` is Some, logs are appended to the file as well as written to stdout.
/// `RUST_LOG` may hold either a bare level (`debug`) or a full directive string
/// (`farm_pool=debug,farm_rpc=trace`); anything unparsable falls back to `info`.
pub fn init_logging(log_file: Option<&Path>) {
    let env_filter = build_filter(std::env::var("RUST_LOG").ok().as_deref());

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = match log_file {
        Some(path) => {
            let path = path.to_owned();
            let file_layer = fmt::layer().with_ansi(false).with_writer(move || {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .expect("Failed to open log file")
            });
            let stdout_layer = fmt::layer().with_writer(io::stdout);
            Box::new(
                Registry::default()
                    .with(env_filter)
                    .with(stdout_layer)
                    .with(file_layer),
            )
        }
        None => {
            let stdout_layer = fmt::layer().with_writer(io::stdout);
            Box::new(Registry::default().with(env_filter).with(stdout_layer))
        }
    };

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global subscriber");
}

fn build_filter(rust_log: Option<&str>) -> EnvFilter {
    match rust_log {
        Some(raw) if LevelFilter::from_str(raw).is_ok() => EnvFilter::new(raw),
        Some(raw) => {
            EnvFilter::try_new(raw).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL.to_string()))
        }
        None => EnvFilter::new(DEFAULT_LEVEL.to_string()),
    }
}
