//! Provide tracing, tailored to this program.
//!
//! The binary calls [`init_journald_or_stdout`] once at startup to install a
//! subscriber. Everything else uses `use crate::tracing::prelude::*` for the
//! `trace!()` through `error!()` macros.
//!
//! Stdout output is one line per event: local time, colored level, the module
//! path with our crate prefix removed, and the message. Structured fields go on
//! a dimmed second line so device registers and nonces stay readable.

use std::env;
use std::fmt::Write as _;

use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime, FmtContext, FormatEvent, FormatFields},
    prelude::*,
    registry::LookupSpan,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

const CRATE_PREFIX: &str = "accel_miner::";

/// Initialize logging.
///
/// Under systemd (JOURNAL_STREAM set) events go to journald; otherwise to
/// stdout, filtered by RUST_LOG with INFO as the default level.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        match tracing_journald::layer() {
            Ok(layer) => tracing_subscriber::registry().with(layer).init(),
            Err(e) => {
                use_stdout();
                error!("Failed to initialize journald logging, using stdout: {}", e);
            }
        }
    } else {
        use_stdout();
    }
}

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
                .event_format(LineFormatter),
        )
        .init();
}

/// Event formatter producing the two-line layout described above.
struct LineFormatter;

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for FieldCollector {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let formatted = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(formatted);
        } else {
            self.fields.push((field.name(), unwrap_some(formatted)));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push((field.name(), value.to_string()));
        }
    }
}

// Some("foo") -> foo
fn unwrap_some(formatted: String) -> String {
    match formatted
        .strip_prefix("Some(")
        .and_then(|s| s.strip_suffix(')'))
    {
        Some(inner) => inner.to_string(),
        None => formatted,
    }
}

/// Module path to print: our own paths lose the crate prefix, events bridged
/// from the `log` crate use their original target.
fn short_target<'a>(target: &'a str, fields: &'a [(&'static str, String)]) -> &'a str {
    if let Some(stripped) = target.strip_prefix(CRATE_PREFIX) {
        stripped
    } else if target == "log" {
        fields
            .iter()
            .find(|(k, _)| *k == "log.target")
            .map(|(_, v)| v.trim_matches('"'))
            .unwrap_or(target)
    } else {
        target
    }
}

impl<S, N> FormatEvent<S, N> for LineFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        LocalTimer.format_time(&mut writer)?;

        let (color, label) = match *event.metadata().level() {
            tracing::Level::ERROR => ("\x1b[31m", "ERROR"),
            tracing::Level::WARN => ("\x1b[33m", "WARN "),
            tracing::Level::INFO => ("\x1b[32m", "INFO "),
            tracing::Level::DEBUG => ("\x1b[34m", "DEBUG"),
            tracing::Level::TRACE => ("\x1b[35m", "TRACE"),
        };
        write!(writer, " {}{}\x1b[0m ", color, label)?;

        let target = short_target(event.metadata().target(), &visitor.fields);
        write!(writer, "{}: ", target)?;

        if let Some(msg) = &visitor.message {
            write!(writer, "{}", msg.trim_matches('"'))?;
        }

        let mut line = String::new();
        for (key, value) in visitor.fields.iter().filter(|(k, _)| !k.starts_with("log.")) {
            if !line.is_empty() {
                line.push_str(", ");
            }
            write!(line, "{}={}", key, value.trim_matches('"'))?;
        }
        if !line.is_empty() {
            // Align under the module column: 8 chars of time, level, spaces
            write!(writer, "\n\x1b[90m               {}\x1b[0m", line)?;
        }

        writeln!(writer)
    }
}

// Local wall-clock time to the second.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let text = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| std::fmt::Error)?;
        w.write_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_target_strips_own_prefix() {
        assert_eq!(short_target("accel_miner::scanner", &[]), "scanner");
        assert_eq!(short_target("mio::poll", &[]), "mio::poll");
    }

    #[test]
    fn test_short_target_uses_log_target() {
        let fields = vec![("log.target", "\"hyper::proto\"".to_string())];
        assert_eq!(short_target("log", &fields), "hyper::proto");
        assert_eq!(short_target("log", &[]), "log");
    }

    #[test]
    fn test_unwrap_some() {
        assert_eq!(unwrap_some("Some(42.5)".into()), "42.5");
        assert_eq!(unwrap_some("None".into()), "None");
        assert_eq!(unwrap_some("Something".into()), "Something");
    }
}
