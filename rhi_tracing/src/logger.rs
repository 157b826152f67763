use std::fmt::{self, Debug, Display, Formatter, Write as _};
use std::io::{IsTerminal, Write};

use chrono::Local;
use tracing::field::{Field, Visit};
use tracing::metadata::LevelFilter;
use tracing::span::Id;
use tracing::subscriber::{set_global_default, SetGlobalDefaultError};
use tracing::{Event, Level, Metadata, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Installs the [`Logger`] as the global default subscriber.
///
/// # Errors
///
/// Returns an error if a global subscriber was already installed.
pub fn init() -> Result<(), SetGlobalDefaultError> {
    let subscriber = tracing_subscriber::registry().with(Logger::new());
    set_global_default(subscriber)
}

/// A [`Layer`] that writes events to stdout.
///
/// The filter is read from `RUST_LOG`. It is a comma separated list of a default level and
/// `target=level` directives, e.g. `warn,rhi_core::staging=debug`. Without `RUST_LOG` only
/// `INFO` and above is logged.
#[derive(Debug)]
pub struct Logger {
    is_tty: bool,
    filter: Filter,
}

impl Logger {
    pub fn new() -> Self {
        let filter = match std::env::var("RUST_LOG") {
            Ok(directives) => Filter::parse(&directives),
            Err(_) => Filter::new(LevelFilter::INFO),
        };

        Self::with_filter(filter)
    }

    pub fn with_filter(filter: Filter) -> Self {
        Self {
            is_tty: std::io::stdout().is_terminal(),
            filter,
        }
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    fn log<T>(&self, level: Level, target: &str, content: T)
    where
        T: Display,
    {
        let now = Local::now().format("%Y-%m-%d %H:%M:%S%.6f");

        let (name, color) = match level {
            Level::ERROR => ("ERROR", Color::RED),
            Level::WARN => ("WARN ", Color::YELLOW),
            Level::INFO => ("INFO ", Color::GREEN),
            Level::DEBUG => ("DEBUG", Color::BLUE),
            Level::TRACE => ("TRACE", Color::GRAY),
        };

        // A closed stdout is not worth panicking over.
        let mut stdout = std::io::stdout().lock();
        let _ = if self.is_tty {
            writeln!(
                stdout,
                "{} {} {} {}",
                Paint(Color::GRAY, format_args!("[{}]", now)),
                Paint(color, name),
                Paint(Color::GRAY, target),
                content
            )
        } else {
            writeln!(stdout, "[{}] {} {} {}", now, name, target, content)
        };
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for Logger
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if !self.filter.enabled(meta) {
            return;
        }

        let mut fields = Fields::default();
        event.record(&mut fields);

        self.log(*meta.level(), meta.target(), fields);
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            let meta = span.metadata();
            if self.filter.enabled(meta) {
                self.log(*meta.level(), meta.target(), format_args!("--> {}", span.name()));
            }
        }
    }

    fn on_exit(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            let meta = span.metadata();
            if self.filter.enabled(meta) {
                self.log(*meta.level(), meta.target(), format_args!("<-- {}", span.name()));
            }
        }
    }
}

/// Per-target maximum levels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    default: LevelFilter,
    /// Sorted by descending target length so the most specific directive matches first.
    targets: Vec<(String, LevelFilter)>,
}

impl Filter {
    pub fn new(default: LevelFilter) -> Self {
        Self {
            default,
            targets: Vec::new(),
        }
    }

    /// Parses a `RUST_LOG` style directive list.
    ///
    /// Directives that fail to parse are skipped. An unknown default level falls back to
    /// `INFO`.
    pub fn parse(directives: &str) -> Self {
        let mut filter = Self::new(LevelFilter::INFO);

        for directive in directives.split(',').map(str::trim) {
            match directive.split_once('=') {
                Some((target, level)) => {
                    if let Some(level) = parse_level(level) {
                        filter.targets.push((target.trim().to_owned(), level));
                    }
                }
                None if !directive.is_empty() => {
                    filter.default = parse_level(directive).unwrap_or(LevelFilter::INFO);
                }
                None => (),
            }
        }

        filter
            .targets
            .sort_by(|(lhs, _), (rhs, _)| rhs.len().cmp(&lhs.len()));
        filter
    }

    /// Returns the maximum level for events from `target`.
    pub fn level(&self, target: &str) -> LevelFilter {
        self.targets
            .iter()
            .find(|(prefix, _)| is_module_prefix(prefix, target))
            .map_or(self.default, |(_, level)| *level)
    }

    pub fn enabled(&self, meta: &Metadata<'_>) -> bool {
        *meta.level() <= self.level(meta.target())
    }
}

fn is_module_prefix(prefix: &str, target: &str) -> bool {
    match target.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with("::"),
        None => false,
    }
}

fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_ascii_lowercase().as_str() {
        "error" => Some(LevelFilter::ERROR),
        "warn" => Some(LevelFilter::WARN),
        "info" => Some(LevelFilter::INFO),
        "debug" => Some(LevelFilter::DEBUG),
        "trace" => Some(LevelFilter::TRACE),
        "off" => Some(LevelFilter::OFF),
        _ => None,
    }
}

/// Formats the fields of an event as `message key = value ...`.
#[derive(Default)]
struct Fields {
    buf: String,
}

impl Visit for Fields {
    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if !self.buf.is_empty() {
            self.buf.push(' ');
        }

        let _ = match field.name() {
            "message" => write!(self.buf, "{:?}", value),
            name => write!(self.buf, "{} = {:?}", name, value),
        };
    }
}

impl Display for Fields {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.buf)
    }
}

/// SGR attributes of an ANSI escape sequence.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Color(&'static str);

impl Color {
    const RED: Self = Self("1;31");
    const YELLOW: Self = Self("1;33");
    const GREEN: Self = Self("1;32");
    const BLUE: Self = Self("1;34");
    const GRAY: Self = Self("2;37");
}

struct Paint<T>(Color, T);

impl<T> Display for Paint<T>
where
    T: Display,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "\x1b[{}m{}\x1b[0m", (self.0).0, self.1)
    }
}

#[cfg(test)]
mod tests {
    use tracing::metadata::LevelFilter;

    use super::{parse_level, Color, Filter, Paint};

    #[test]
    fn parse_level_names() {
        assert_eq!(parse_level("warn"), Some(LevelFilter::WARN));
        assert_eq!(parse_level("TRACE"), Some(LevelFilter::TRACE));
        assert_eq!(parse_level("off"), Some(LevelFilter::OFF));
        assert_eq!(parse_level("verbose"), None);
    }

    #[test]
    fn default_level_only() {
        let filter = Filter::parse("debug");
        assert_eq!(filter.level("rhi_core::queue"), LevelFilter::DEBUG);

        let filter = Filter::parse("verbose");
        assert_eq!(filter.level("rhi_core"), LevelFilter::INFO);
    }

    #[test]
    fn most_specific_target_wins() {
        let filter = Filter::parse("warn, rhi_core=info ,rhi_core::staging=trace");

        assert_eq!(filter.level("rhi_core::staging"), LevelFilter::TRACE);
        assert_eq!(filter.level("rhi_core::device"), LevelFilter::INFO);
        assert_eq!(filter.level("rhi_core"), LevelFilter::INFO);
        assert_eq!(filter.level("ash"), LevelFilter::WARN);
    }

    #[test]
    fn target_prefix_respects_module_boundaries() {
        let filter = Filter::parse("error,rhi=trace");

        assert_eq!(filter.level("rhi::queue"), LevelFilter::TRACE);
        assert_eq!(filter.level("rhi_core::queue"), LevelFilter::ERROR);
    }

    #[test]
    fn invalid_directives_are_skipped() {
        let filter = Filter::parse("info,rhi_core=loud,,");
        assert_eq!(filter, Filter::new(LevelFilter::INFO));
    }

    #[test]
    fn paint_escape_codes() {
        let text = Paint(Color::RED, "x").to_string();
        assert_eq!(text, "\x1b[1;31mx\x1b[0m");
    }
}
