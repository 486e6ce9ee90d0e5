//! Console logging through `tracing`.
//!
//! Step banners are emitted on the `recimg::step` target and rendered as
//! `==> name`; everything else is indented beneath them.

use std::fmt;

/// Console verbosity selected by `--quiet`, `--verbose` or `--debug`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Quiet,
    #[default]
    Normal,
    Verbose,
    Debug,
}

impl LogLevel {
    fn filter(self) -> tracing_subscriber::filter::LevelFilter {
        use tracing_subscriber::filter::LevelFilter;
        match self {
            LogLevel::Quiet => LevelFilter::WARN,
            LogLevel::Normal => LevelFilter::INFO,
            LogLevel::Verbose => LevelFilter::DEBUG,
            LogLevel::Debug => LevelFilter::TRACE,
        }
    }
}

#[derive(Default)]
struct MessageExtractor {
    message: String,
}

impl tracing::field::Visit for MessageExtractor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

struct RecimgFormatter;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for RecimgFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut extractor = MessageExtractor::default();
        event.record(&mut extractor);
        let msg = &extractor.message;

        match *metadata.level() {
            tracing::Level::ERROR => writeln!(writer, "[ERROR] {msg}"),
            tracing::Level::WARN => writeln!(writer, "[WARN] {msg}"),
            tracing::Level::INFO if metadata.target() == "recimg::step" => {
                writeln!(writer, "==> {msg}")
            }
            tracing::Level::INFO => writeln!(writer, "  {msg}"),
            _ => writeln!(writer, "  [{}] {msg}", metadata.target()),
        }
    }
}

/// Install the global subscriber. Call once, before any logging.
pub fn init(level: LogLevel) {
    use tracing_subscriber::fmt::writer::MakeWriterExt as _;
    use tracing_subscriber::{
        fmt as sub_fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer as _,
    };

    let make_writer = std::io::stderr
        .with_max_level(tracing::Level::WARN)
        .and(std::io::stdout.with_min_level(tracing::Level::INFO));

    let console = sub_fmt::layer()
        .event_format(RecimgFormatter)
        .with_writer(make_writer)
        .with_filter(level.filter());

    tracing_subscriber::registry().with(console).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_still_shows_warnings() {
        assert_eq!(
            LogLevel::Quiet.filter(),
            tracing_subscriber::filter::LevelFilter::WARN
        );
        assert_eq!(LogLevel::default(), LogLevel::Normal);
    }
}
