use crate::domain::settings::LogSettings;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

pub struct LoggingGuard {
    // Keep alive so buffered file logs are flushed
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber described by `settings`. Fails if one is
/// already installed.
pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let (file_layer, file_guard) = match file_layer(settings) {
        Some((layer, guard)) => (Some(layer), Some(guard)),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(level_filter(settings, std::env::var(EnvFilter::DEFAULT_ENV).ok()))
        .with(console_layer(settings))
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))?;

    tracing::info!(
        "Logging at {} (console: {}, file: {})",
        settings.level,
        settings.console_logging_enabled,
        settings.file_logging_enabled
    );

    Ok(LoggingGuard { _file: file_guard })
}

/// `RUST_LOG` wins over the configured level; an unusable level means info
fn level_filter(settings: &LogSettings, env: Option<String>) -> EnvFilter {
    env.and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_new(&settings.level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// stdout belongs to the interactive console, so logs go to stderr
fn console_layer<S>(settings: &LogSettings) -> Option<BoxedLayer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if !settings.console_logging_enabled {
        return None;
    }
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_file(settings.show_file_line)
        .with_line_number(settings.show_file_line)
        .with_thread_ids(settings.show_thread_ids)
        .with_target(settings.show_target)
        .with_ansi(settings.ansi_colors);
    Some(layer.boxed())
}

fn file_layer<S>(settings: &LogSettings) -> Option<(BoxedLayer<S>, WorkerGuard)>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if !settings.file_logging_enabled {
        return None;
    }
    let appender = RollingFileAppender::new(
        rotation(&settings.rotation),
        &settings.log_dir,
        &settings.file_name_prefix,
    );
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_file(settings.show_file_line)
        .with_line_number(settings.show_file_line)
        .with_thread_ids(settings.show_thread_ids)
        .with_target(settings.show_target);
    Some((layer.boxed(), guard))
}

fn rotation(name: &str) -> Rotation {
    match name.to_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}
