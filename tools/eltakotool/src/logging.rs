//! Console logging for the tool
//!
//! Logs go to stderr so telegram output on stdout stays pipeable. Lines are
//! short: local wall-clock time, the level, the library module that logged
//! and the event.

use colored::{ColoredString, Colorize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    registry::LookupSpan,
    EnvFilter,
};

/// `[LVL]` tag, colored when the terminal takes escapes
fn level_tag(level: Level, ansi: bool) -> ColoredString {
    let tag = match level {
        Level::ERROR => "[ERR]",
        Level::WARN => "[WRN]",
        Level::INFO => "[INF]",
        Level::DEBUG => "[DBG]",
        Level::TRACE => "[TRC]",
    };
    if !ansi {
        return tag.normal();
    }
    match level {
        Level::ERROR => tag.red().bold(),
        Level::WARN => tag.yellow(),
        Level::INFO => tag.green(),
        Level::DEBUG => tag.blue(),
        Level::TRACE => tag.magenta(),
    }
}

/// `eltakobus::serial::codec` → `serial::codec`; the tool's own events get no module
fn short_target(target: &str) -> Option<&str> {
    match target.split_once("::") {
        Some(("eltakotool", _)) => None,
        Some((_, rest)) => Some(rest),
        None if target == "eltakotool" => None,
        None => Some(target),
    }
}

/// `12:03:41.412 [DBG] serial: [Serial Bus] Telegram hex_data=...`
struct ConsoleFormat;

impl<S, N> FormatEvent<S, N> for ConsoleFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let ansi = writer.has_ansi_escapes();

        let time = chrono::Local::now().format("%H:%M:%S%.3f").to_string();
        if ansi {
            write!(writer, "{} ", time.as_str().dimmed())?;
        } else {
            write!(writer, "{time} ")?;
        }
        write!(writer, "{} ", level_tag(*metadata.level(), ansi))?;

        if let Some(module) = short_target(metadata.target()) {
            write!(writer, "{module}: ")?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` wins over the `-v` flag.
pub fn init(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level)?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .event_format(ConsoleFormat)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_tag_plain() {
        assert_eq!(level_tag(Level::INFO, false).to_string(), "[INF]");
        assert_eq!(level_tag(Level::ERROR, false).to_string(), "[ERR]");
        assert_eq!(level_tag(Level::TRACE, false).to_string(), "[TRC]");
    }

    #[test]
    fn test_short_target() {
        assert_eq!(short_target("eltakobus::serial::codec"), Some("serial::codec"));
        assert_eq!(short_target("eltakobus"), Some("eltakobus"));
        assert_eq!(short_target("eltakotool"), None);
        assert_eq!(short_target("eltakotool::logging"), None);
    }
}
