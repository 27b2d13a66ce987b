// Logging for shardcast
//
// A thin layer over the `tracing` ecosystem. The dispatcher, its workers, the
// result collector and the shared-state servers all emit structured events;
// this module installs the subscriber that renders them.
//
// # Usage Examples
//
// ```rust
// use shardcast::logging;
//
// // INFO level, human-readable console output
// logging::init_default();
//
// // Or pick the settings explicitly
// let config = logging::LogConfig {
//     level: tracing::Level::DEBUG,
//     json_format: false,
//     ..Default::default()
// };
// logging::init(config);
// ```
//
// Worker threads are spawned with the subscriber that was current when the
// dispatcher was built, so thread-local subscribers installed by tests also
// see worker events.
//
// ```rust
// let span = shardcast::job_span!(42, "grep");
// let _guard = span.enter();
// shardcast::log_job!(42, "submitted", shards = 4);
// ```

use std::io;
use std::sync::Once;
use tracing::{Level, Subscriber};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: Level,
    /// Whether to use JSON format for logs
    pub json_format: bool,
    /// Whether to include file and line information
    pub show_file_line: bool,
    /// Whether to include thread name/id
    pub show_thread_info: bool,
    /// Whether to include timestamps
    pub show_time: bool,
    /// Target filter expressions (format: "target=level,target2=level2,...")
    pub target_filters: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            show_file_line: true,
            // worker threads are named after their shard, so keep them visible
            show_thread_info: true,
            show_time: true,
            target_filters: None,
        }
    }
}

// Initialization guard to ensure we only initialize once
static INIT: Once = Once::new();

fn build_filter(config: &LogConfig) -> EnvFilter {
    let mut env_filter = EnvFilter::from_default_env().add_directive(config.level.into());

    if let Some(filters) = &config.target_filters {
        for filter in filters.split(',') {
            if let Ok(directive) = filter.trim().parse() {
                env_filter = env_filter.add_directive(directive);
            }
        }
    }
    env_filter
}

/// Initialize the logging system with the given configuration.
///
/// Safe to call multiple times; only the first call takes effect.
pub fn init(config: LogConfig) {
    INIT.call_once(|| {
        let registry = tracing_subscriber::registry().with(build_filter(&config));

        let subscriber: Box<dyn Subscriber + Send + Sync> = if config.json_format {
            Box::new(
                registry.with(
                    fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_thread_names(config.show_thread_info),
                ),
            )
        } else if config.show_time {
            Box::new(
                registry.with(
                    fmt::layer()
                        .with_ansi(atty::is(atty::Stream::Stdout))
                        .with_file(config.show_file_line)
                        .with_line_number(config.show_file_line)
                        .with_thread_names(config.show_thread_info)
                        .with_thread_ids(config.show_thread_info),
                ),
            )
        } else {
            Box::new(
                registry.with(
                    fmt::layer()
                        .without_time()
                        .with_ansi(atty::is(atty::Stream::Stdout))
                        .with_file(config.show_file_line)
                        .with_line_number(config.show_file_line)
                        .with_thread_names(config.show_thread_info)
                        .with_thread_ids(config.show_thread_info),
                ),
            )
        };

        set_global_subscriber(subscriber);
    });
}

fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error setting global tracing subscriber: {}", err);
    }
}

/// Open `path` in append mode for use as a log writer.
pub fn file_writer(path: &str) -> io::Result<Box<dyn io::Write + Send + Sync + 'static>> {
    use std::fs::OpenOptions;

    let file = OpenOptions::new().create(true).append(true).open(path)?;

    Ok(Box::new(file))
}

/// Initialize logging with both console and file output.
///
/// The file is opened up front so a bad path is reported to the caller; the
/// file layer never uses ANSI colors and always records file/line and thread.
pub fn init_with_file(config: LogConfig, log_file: &str) -> Result<(), io::Error> {
    // Fail early on an unusable path
    drop(file_writer(log_file)?);

    INIT.call_once(|| {
        let console_layer = fmt::layer()
            .with_ansi(atty::is(atty::Stream::Stdout))
            .with_file(config.show_file_line)
            .with_line_number(config.show_file_line)
            .with_thread_names(config.show_thread_info)
            .with_thread_ids(config.show_thread_info);

        let log_file_path = log_file.to_string();

        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(move || match file_writer(&log_file_path) {
                Ok(writer) => writer,
                Err(_) => Box::new(std::io::stderr()),
            })
            .with_file(true)
            .with_line_number(true)
            .with_thread_names(true)
            .with_thread_ids(true);

        let subscriber = tracing_subscriber::registry()
            .with(build_filter(&config))
            .with(console_layer)
            .with(file_layer);

        set_global_subscriber(subscriber);
    });

    Ok(())
}

/// INFO level, human-readable console output.
pub fn init_default() {
    init(LogConfig::default());
}

/// DEBUG for the crate, TRACE for the pool internals (routing, late reports).
pub fn init_development() {
    let config = LogConfig {
        level: Level::DEBUG,
        json_format: false,
        show_file_line: true,
        show_thread_info: true,
        show_time: true,
        target_filters: Some("shardcast=debug,shardcast::pool=trace".to_string()),
    };
    init(config);
}

/// JSON output, no file/line information.
pub fn init_production() {
    let config = LogConfig {
        level: Level::INFO,
        json_format: true,
        show_file_line: false,
        show_thread_info: true,
        show_time: true,
        target_filters: None,
    };
    init(config);
}

/// Warnings and errors only, compact output for test runs.
pub fn init_test() {
    let config = LogConfig {
        level: Level::WARN,
        json_format: false,
        show_file_line: true,
        show_thread_info: false,
        show_time: false,
        target_filters: None,
    };
    init(config);
}

/// Span covering everything done for one job.
///
/// ```rust
/// let span = shardcast::job_span!(7, "grep");
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! job_span {
    ($job_id:expr, $action:expr) => {
        tracing::debug_span!("job", job_id = $job_id, action = %$action)
    };
    ($job_id:expr, $action:expr, $($fields:tt)*) => {
        tracing::debug_span!("job", job_id = $job_id, action = %$action, $($fields)*)
    };
}

/// Job lifecycle events (submitted, completed, timed out, ...).
#[macro_export]
macro_rules! log_job {
    ($job_id:expr, $event:expr) => {
        tracing::debug!(job_id = $job_id, event = $event);
    };
    ($job_id:expr, $event:expr, $($fields:tt)*) => {
        tracing::debug!(job_id = $job_id, event = $event, $($fields)*);
    };
}

/// Worker lifecycle events.
#[macro_export]
macro_rules! log_worker {
    ($shard:expr, $event:expr) => {
        tracing::debug!(shard = $shard, event = $event);
    };
    ($shard:expr, $event:expr, $($fields:tt)*) => {
        tracing::debug!(shard = $shard, event = $event, $($fields)*);
    };
}

/// Pool-level state changes (started, terminated, interrupted).
#[macro_export]
macro_rules! log_pool {
    ($dispatcher:expr, $event:expr) => {
        tracing::info!(dispatcher = %$dispatcher, event = $event);
    };
    ($dispatcher:expr, $event:expr, $($fields:tt)*) => {
        tracing::info!(dispatcher = %$dispatcher, event = $event, $($fields)*);
    };
}

/// Log an error value with optional context fields.
#[macro_export]
macro_rules! log_error {
    ($error:expr) => {
        tracing::error!(error = %$error);
    };
    ($error:expr, $($fields:tt)*) => {
        tracing::error!(error = %$error, $($fields)*);
    };
}

/// The dispatcher current on this thread, to be re-installed on spawned threads.
#[inline]
pub fn current_subscriber() -> tracing::Dispatch {
    tracing::dispatcher::get_default(|d| d.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.json_format);
        assert!(config.show_thread_info);
        assert!(config.target_filters.is_none());
    }

    #[test]
    fn test_build_filter_skips_bad_directives() {
        let config = LogConfig {
            target_filters: Some("shardcast::pool=trace, not a directive==".to_string()),
            ..Default::default()
        };
        let filter = build_filter(&config).to_string();
        assert!(filter.contains("shardcast::pool=trace"));
    }

    #[test]
    fn test_current_subscriber_follows_thread_default() {
        let dispatch = tracing::Dispatch::new(tracing_subscriber::registry());
        tracing::dispatcher::with_default(&dispatch, || {
            let current = current_subscriber();
            assert!(current.is::<tracing_subscriber::Registry>());
        });
    }
}
