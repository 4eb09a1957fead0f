use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::filter::LogLevel;

impl Serialize for LogLevel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(LogLevel::parse(&raw))
    }
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Silent => "silent",
        }
    }
}

/// A single logged line, as retained in memory and as forwarded to a remote
/// sink (spec.md §3). `meta` is an open bag of structured fields; the wire
/// protocol adds `remote: true` to it when an entry crosses a socket (spec.md
/// §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub namespace: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl LogEntry {
    /// A clone of this entry with `meta.remote = true`, as required of every
    /// entry that crosses the wire (spec.md §6).
    pub(crate) fn marked_remote(&self) -> LogEntry {
        let mut entry = self.clone();
        entry.meta.insert("remote".to_string(), serde_json::Value::Bool(true));
        entry
    }
}

/// Messages exchanged with a remote log sink (spec.md §6). Unlike most of
/// this workspace's internal types, the wire shape here is dictated
/// literally by spec.md rather than left to `serde`'s derived defaults:
///
/// - `{"log":[debug,level,message,meta]}` — a positional 4-element array,
///   one per forwarded line.
/// - `{"logAll":[LogEntry,…]}` — the full in-memory backlog, sent once when
///   a sink first connects.
/// - `{"env":{"PERCY_DEBUG":…,"PERCY_LOGLEVEL":…}}` — an environment
///   snapshot/update, sent on connect and, from the client side, whenever
///   its env changes.
///
/// Hand-rolled `Serialize`/`Deserialize` implementations below build and
/// tear down those exact shapes instead of deriving a tagged-enum
/// representation, which would nest an extra `"type"` discriminator spec.md
/// never describes.
#[derive(Debug, Clone)]
pub enum WireMessage {
    /// A single new entry, forwarded as it's produced.
    Log {
        debug: String,
        level: LogLevel,
        message: String,
        meta: serde_json::Map<String, serde_json::Value>,
    },
    /// The full in-memory backlog, sent once when a sink first connects.
    LogAll { entries: Vec<LogEntry> },
    /// An environment snapshot (server→client on connect) or update
    /// (client→server at any time).
    Env {
        percy_debug: Option<String>,
        percy_loglevel: Option<String>,
    },
}

impl WireMessage {
    /// Build a `{"log":[...]}` message out of one retained entry, tagging
    /// its `meta` with `remote: true` per spec.md §6.
    pub fn log(entry: &LogEntry) -> Self {
        let marked = entry.marked_remote();
        WireMessage::Log {
            debug: marked.namespace,
            level: marked.level,
            message: marked.message,
            meta: marked.meta,
        }
    }
}

impl Serialize for WireMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            WireMessage::Log { debug, level, message, meta } => {
                map.serialize_entry("log", &(debug, level, message, meta))?;
            }
            WireMessage::LogAll { entries } => {
                map.serialize_entry("logAll", entries)?;
            }
            WireMessage::Env { percy_debug, percy_loglevel } => {
                let mut env = serde_json::Map::new();
                env.insert(
                    "PERCY_DEBUG".to_string(),
                    percy_debug.clone().map(serde_json::Value::String).unwrap_or(serde_json::Value::Null),
                );
                env.insert(
                    "PERCY_LOGLEVEL".to_string(),
                    percy_loglevel.clone().map(serde_json::Value::String).unwrap_or(serde_json::Value::Null),
                );
                map.serialize_entry("env", &env)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for WireMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let obj = value.as_object().ok_or_else(|| D::Error::custom("wire message must be a JSON object"))?;

        if let Some(log) = obj.get("log") {
            let (debug, level, message, meta): (String, LogLevel, String, serde_json::Map<String, serde_json::Value>) =
                serde_json::from_value(log.clone()).map_err(D::Error::custom)?;
            return Ok(WireMessage::Log { debug, level, message, meta });
        }
        if let Some(log_all) = obj.get("logAll") {
            let entries: Vec<LogEntry> = serde_json::from_value(log_all.clone()).map_err(D::Error::custom)?;
            return Ok(WireMessage::LogAll { entries });
        }
        if let Some(env) = obj.get("env") {
            let percy_debug = env.get("PERCY_DEBUG").and_then(|v| v.as_str()).map(str::to_string);
            let percy_loglevel = env.get("PERCY_LOGLEVEL").and_then(|v| v.as_str()).map(str::to_string);
            return Ok(WireMessage::Env { percy_debug, percy_loglevel });
        }
        Err(D::Error::custom("unrecognized wire message shape (expected log/logAll/env)"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_message_serializes_as_a_positional_array() {
        let mut meta = serde_json::Map::new();
        meta.insert("remote".to_string(), serde_json::Value::Bool(true));
        let message = WireMessage::Log {
            debug: "percy:core".to_string(),
            level: LogLevel::Info,
            message: "hello".to_string(),
            meta,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"log": ["percy:core", "info", "hello", {"remote": true}]})
        );
    }

    #[test]
    fn env_message_uses_the_literal_env_var_keys() {
        let message = WireMessage::Env {
            percy_debug: Some("percy:*".to_string()),
            percy_loglevel: None,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json, serde_json::json!({"env": {"PERCY_DEBUG": "percy:*", "PERCY_LOGLEVEL": null}}));
    }

    #[test]
    fn log_message_round_trips_through_json_text() {
        let mut meta = serde_json::Map::new();
        meta.insert("remote".to_string(), serde_json::Value::Bool(true));
        let message = WireMessage::Log {
            debug: "percy:core".to_string(),
            level: LogLevel::Warn,
            message: "uh oh".to_string(),
            meta,
        };
        let text = serde_json::to_string(&message).unwrap();
        let parsed: WireMessage = serde_json::from_str(&text).unwrap();
        match parsed {
            WireMessage::Log { debug, level, message, .. } => {
                assert_eq!(debug, "percy:core");
                assert_eq!(level, LogLevel::Warn);
                assert_eq!(message, "uh oh");
            }
            other => panic!("expected Log, got {other:?}"),
        }
    }
}
