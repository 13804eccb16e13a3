use chrono::DateTime;
use tally_core::{Event, EventParser, ParseError, RawRecord};

/// Parses JSON object payloads into events.
/// - `key_field`: grouping key; strings are used as-is, other scalars are stringified
/// - `time_field`: event time as epoch milliseconds or an RFC3339 string
///
/// The whole object becomes the event payload.
#[derive(Debug, Clone)]
pub struct JsonEventParser {
    pub key_field: String,
    pub time_field: String,
}

impl JsonEventParser {
    pub fn new(key_field: impl Into<String>, time_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
            time_field: time_field.into(),
        }
    }
}

pub(crate) fn extract_event_time(v: &serde_json::Value) -> Option<i64> {
    match v {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s
            .parse::<i64>()
            .ok()
            .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|t| t.timestamp_millis())),
        _ => None,
    }
}

impl EventParser for JsonEventParser {
    fn parse(&self, raw: &RawRecord) -> Result<Event, ParseError> {
        let value: serde_json::Value =
            serde_json::from_slice(&raw.payload).map_err(|e| ParseError::malformed(raw, e.to_string()))?;
        if !value.is_object() {
            return Err(ParseError::malformed(raw, "payload is not a JSON object"));
        }
        let key = match value.get(&self.key_field) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => return Err(ParseError::missing_field(raw, &self.key_field)),
            Some(other @ (serde_json::Value::Number(_) | serde_json::Value::Bool(_))) => other.to_string(),
            Some(_) => return Err(ParseError::missing_field(raw, &self.key_field)),
        };
        let timestamp = value
            .get(&self.time_field)
            .and_then(extract_event_time)
            .ok_or_else(|| ParseError::missing_field(raw, &self.time_field))?;
        Ok(Event::new(key, timestamp, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(v: serde_json::Value) -> RawRecord {
        RawRecord::json(0, 7, &v)
    }

    #[test]
    fn parses_epoch_and_rfc3339() {
        let p = JsonEventParser::new("terminal", "ts");
        let ev = p.parse(&raw(json!({"terminal": "pc", "ts": 2200}))).unwrap();
        assert_eq!((ev.key.as_str(), ev.timestamp), ("pc", 2200));

        let ev = p
            .parse(&raw(json!({"terminal": "mobile", "ts": "1970-01-01T00:00:02.200Z"})))
            .unwrap();
        assert_eq!(ev.timestamp, 2200);

        let ev = p.parse(&raw(json!({"terminal": 3, "ts": "2200"}))).unwrap();
        assert_eq!(ev.key, "3");
    }

    #[test]
    fn missing_timestamp_is_a_parse_error() {
        let p = JsonEventParser::new("terminal", "ts");
        let err = p.parse(&raw(json!({"terminal": "pc"}))).unwrap_err();
        assert_eq!(
            err,
            ParseError::MissingField {
                partition: 0,
                offset: 7,
                field: "ts".into()
            }
        );
        assert!(p.parse(&raw(json!({"terminal": "pc", "ts": "yesterday"}))).is_err());
    }

    #[test]
    fn missing_key_and_garbage_are_parse_errors() {
        let p = JsonEventParser::new("terminal", "ts");
        assert!(matches!(
            p.parse(&raw(json!({"ts": 1}))),
            Err(ParseError::MissingField { .. })
        ));
        assert!(matches!(
            p.parse(&RawRecord::new(0, 1, "{not json")),
            Err(ParseError::Malformed { .. })
        ));
        assert!(matches!(p.parse(&raw(json!([1, 2]))), Err(ParseError::Malformed { .. })));
    }
}
