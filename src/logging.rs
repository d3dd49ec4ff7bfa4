use anyhow::anyhow;
use tracing::Subscriber;
use tracing_subscriber::{filter::LevelFilter, fmt::MakeWriter};

use crate::config::{Config, LogFormat};

const ACCEPTED_LEVELS: &str = "trace, debug, info, warn, error, off";

/// Effective logging settings: CLI override, then `[logging]`, then info/json.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Json,
        }
    }
}

impl LogSettings {
    pub fn resolve(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let section = config.logging.as_ref();

        let level = match cli_level_override.or_else(|| section.and_then(|s| s.level.as_deref())) {
            Some(raw) => parse_level(raw)?,
            None => defaults.level,
        };
        let format = section
            .and_then(|logging| logging.format)
            .unwrap_or(defaults.format);
        Ok(Self { level, format })
    }
}

fn parse_level(raw: &str) -> anyhow::Result<LevelFilter> {
    raw.trim()
        .to_ascii_lowercase()
        .parse::<LevelFilter>()
        .map_err(|_| anyhow!("invalid log level `{raw}`; expected one of {ACCEPTED_LEVELS}"))
}

/// Builds the fmt subscriber for `settings`, writing to `writer`.
pub fn subscriber<W>(settings: LogSettings, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_max_level(settings.level)
        .with_target(true)
        .with_writer(writer);
    match settings.format {
        LogFormat::Json => Box::new(builder.json().finish()),
        LogFormat::Pretty => Box::new(builder.pretty().finish()),
    }
}

/// Installs the global subscriber. Output goes to stderr; stdout carries command results.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let settings = LogSettings::resolve(config, cli_level_override)?;
    tracing::subscriber::set_global_default(subscriber(settings, std::io::stderr))
        .map_err(|err| anyhow!("initialize logging subscriber: {err}"))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::Value;
    use tracing_subscriber::{filter::LevelFilter, fmt::MakeWriter};

    use super::{LogSettings, subscriber};
    use crate::{
        capture::{CaptureController, test_support::ScriptedChannel},
        config::{Config, LogFormat},
        ledger::LedgerLimits,
        model::{ContextId, RequestStart},
    };

    /// Clears a context holding one record, the way `clearRequests` does.
    fn clear_one_request() {
        let capture = CaptureController::new(ScriptedChannel::default(), LedgerLimits::default());
        capture.lock_state().ledger.upsert_on_request_start(
            ContextId(7),
            "r1",
            RequestStart {
                url: "https://a.test/".to_owned(),
                method: "GET".to_owned(),
                timestamp: 1.0,
                ..RequestStart::default()
            },
        );
        assert_eq!(capture.clear(ContextId(7)), 1);
    }

    fn capture_logs(settings: LogSettings) -> String {
        let writer = SharedWriter::default();
        tracing::subscriber::with_default(subscriber(settings, writer.clone()), clear_one_request);
        writer.as_string()
    }

    #[test]
    fn logging_section_sets_level_and_format() {
        let config = Config::from_toml_str("[logging]\nlevel = \" WARN \"\nformat = \"pretty\"\n")
            .expect("config should parse");
        assert_eq!(
            LogSettings::resolve(&config, None).expect("config level should resolve"),
            LogSettings {
                level: LevelFilter::WARN,
                format: LogFormat::Pretty,
            }
        );

        let settings = LogSettings::resolve(&config, Some("off")).expect("cli level should resolve");
        assert_eq!(settings.level, LevelFilter::OFF);
        assert_eq!(settings.format, LogFormat::Pretty);
    }

    #[test]
    fn capture_section_alone_keeps_logging_defaults() {
        let config = Config::from_toml_str("[capture]\nauto_capture = true\n")
            .expect("config should parse");
        assert_eq!(
            LogSettings::resolve(&config, None).expect("defaults should resolve"),
            LogSettings::default()
        );
    }

    #[test]
    fn unknown_level_names_accepted_values() {
        let err = LogSettings::resolve(&Config::default(), Some("loud")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid log level `loud`; expected one of trace, debug, info, warn, error, off"
        );
    }

    #[test]
    fn clearing_requests_logs_context_and_count_as_json() {
        let output = capture_logs(LogSettings::default());
        let line = output
            .lines()
            .find(|line| line.contains("requests cleared"))
            .expect("clear should be logged");
        let log: Value = serde_json::from_str(line).expect("log line should be valid JSON");

        assert_eq!(log["level"], "INFO", "log: {log}");
        assert_eq!(log["target"], "reqscope::capture", "log: {log}");
        assert_eq!(log["fields"]["context"], "7", "log: {log}");
        assert_eq!(log["fields"]["removed"], 1, "log: {log}");
    }

    #[test]
    fn level_threshold_suppresses_capture_summaries() {
        let output = capture_logs(LogSettings {
            level: LevelFilter::WARN,
            format: LogFormat::Json,
        });
        assert!(output.is_empty(), "unexpected output: {output}");

        let output = capture_logs(LogSettings {
            level: LevelFilter::INFO,
            format: LogFormat::Pretty,
        });
        assert!(output.contains("requests cleared"), "output: {output}");
        assert!(serde_json::from_str::<Value>(output.trim()).is_err());
    }

    #[derive(Clone, Default)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl SharedWriter {
        fn as_string(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).expect("log output should be UTF-8")
        }
    }

    impl std::io::Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }
}
