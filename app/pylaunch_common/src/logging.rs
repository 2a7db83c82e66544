/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

//! Launcher log output.
//!
//! The codebase logs through `tracing`; this module installs the global
//! subscriber. Two formats: `text` (timestamped single lines, level prefix
//! for non-info) and `json` (one object per line with `timestamp`, `level`,
//! `message`, `logger`, plus static fields from configuration). The
//! `PYLAUNCH_LOG` environment variable overrides the configured level with
//! a full `tracing_subscriber::EnvFilter` directive.

use std::collections::BTreeMap;
use std::fmt;

use chrono::SecondsFormat;
use serde::Deserialize;
use serde::Serialize;
use tracing::Event;
use tracing::Level;
use tracing::Subscriber;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::fmt::FormatFields;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const ENV_VAR: &str = "PYLAUNCH_LOG";
const LOGGER_NAME: &str = "pylaunch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub format: LogFormat,

    /// Minimum level. Default `info`. `PYLAUNCH_LOG` wins when set.
    pub level: Option<String>,

    /// Extra key-value pairs included in every JSON line.
    pub fields: BTreeMap<String, String>,
}

/// Install the global subscriber. Errors if a subscriber is already set.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match std::env::var(ENV_VAR) {
        Ok(v) => EnvFilter::try_new(v)?,
        Err(_) => EnvFilter::try_new(config.level.as_deref().unwrap_or("info"))?,
    };

    match config.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .event_format(TextFormat)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .event_format(JsonFormat {
                fields: config.fields.clone(),
            })
            .try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

/// Collects an event's fields: `message` separated out, the rest kept in
/// declaration order.
#[derive(Default)]
struct FieldCollector {
    message: String,
    rest: Vec<(String, String)>,
}

impl FieldCollector {
    fn collect(event: &Event<'_>) -> Self {
        let mut collector = Self::default();
        event.record(&mut collector);
        collector
    }

    fn push(&mut self, name: &str, value: String) {
        if name == "message" {
            self.message = value;
        } else {
            self.rest.push((name.to_owned(), value));
        }
    }
}

impl tracing::field::Visit for FieldCollector {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        self.push(field.name(), format!("{value:?}"));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.push(field.name(), value.to_owned());
    }
}

fn level_str(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        Level::TRACE => "trace",
    }
}

/// `2006/01/02 15:04:05.000000 [PREFIX: ]message [k=v ...]`
struct TextFormat;

impl<S, N> FormatEvent<S, N> for TextFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let fields = FieldCollector::collect(event);

        write!(
            writer,
            "{} ",
            chrono::Local::now().format("%Y/%m/%d %H:%M:%S%.6f")
        )?;
        match *event.metadata().level() {
            Level::ERROR => write!(writer, "ERROR: ")?,
            Level::WARN => write!(writer, "WARNING: ")?,
            _ => {}
        }
        write!(writer, "{}", fields.message)?;
        for (name, value) in &fields.rest {
            write!(writer, " {name}={value}")?;
        }
        writeln!(writer)
    }
}

/// One JSON object per line.
struct JsonFormat {
    fields: BTreeMap<String, String>,
}

impl JsonFormat {
    fn line(&self, level: &Level, collected: &FieldCollector) -> String {
        let mut entry = serde_json::Map::new();
        entry.insert(
            "timestamp".to_owned(),
            chrono::Utc::now()
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .into(),
        );
        entry.insert("level".to_owned(), level_str(level).into());
        entry.insert("message".to_owned(), collected.message.clone().into());
        entry.insert("logger".to_owned(), LOGGER_NAME.into());
        for (k, v) in &self.fields {
            entry.insert(k.clone(), v.clone().into());
        }
        for (k, v) in &collected.rest {
            entry.insert(k.clone(), v.clone().into());
        }
        serde_json::Value::Object(entry).to_string()
    }
}

impl<S, N> FormatEvent<S, N> for JsonFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let collected = FieldCollector::collect(event);
        writeln!(writer, "{}", self.line(event.metadata().level(), &collected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_parse() {
        let raw = "format: json\nlevel: warn\nfields:\n  service: my-service\n";
        let config: LoggingConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level.as_deref(), Some("warn"));
        assert_eq!(config.fields["service"], "my-service");
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: LoggingConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.format, LogFormat::Text);
        assert_eq!(config.level, None);
        assert!(config.fields.is_empty());
    }

    #[test]
    fn test_json_line_shape() {
        let format = JsonFormat {
            fields: BTreeMap::from([("service".to_owned(), "svc".to_owned())]),
        };
        let collected = FieldCollector {
            message: "child exited".to_owned(),
            rest: vec![("code".to_owned(), "0".to_owned())],
        };
        let line = format.line(&Level::WARN, &collected);
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(parsed["level"], "warn");
        assert_eq!(parsed["message"], "child exited");
        assert_eq!(parsed["logger"], LOGGER_NAME);
        assert_eq!(parsed["service"], "svc");
        assert_eq!(parsed["code"], "0");
        // RFC 3339 with nanosecond precision, UTC.
        let ts = parsed["timestamp"].as_str().unwrap();
        assert!(ts.ends_with('Z'), "timestamp not UTC: {ts}");
        chrono::DateTime::parse_from_rfc3339(ts).unwrap();
    }

    #[test]
    fn test_level_str() {
        assert_eq!(level_str(&Level::INFO), "info");
        assert_eq!(level_str(&Level::WARN), "warn");
        assert_eq!(level_str(&Level::ERROR), "error");
    }
}
