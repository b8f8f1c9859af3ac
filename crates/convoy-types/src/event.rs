use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub properties: Value,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }

    /// Reads a string property, e.g. `sessionID` or `attemptID`.
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn engine_event_serializes_type_field() {
        let event = EngineEvent::new("attempt.queued", json!({ "attemptID": "a-1" }));
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "attempt.queued");
        assert_eq!(event.property_str("attemptID"), Some("a-1"));
        assert_eq!(event.property_str("missing"), None);
    }
}
