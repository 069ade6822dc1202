use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanType {
    Quick,
    #[default]
    Default,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOptions {
    pub scan_type: ScanType,
    pub ports: Option<String>,
}

impl ScanOptions {
    pub fn from_value(raw: &Value) -> Self {
        let map = normalize_options(raw);

        let scan_type = match map.get("scan_type").and_then(Value::as_str) {
            Some("quick") => ScanType::Quick,
            _ => ScanType::Default,
        };

        let ports = map
            .get("ports")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty() && !p.starts_with('-'))
            .map(ToString::to_string);

        Self { scan_type, ports }
    }

    pub fn is_quick(&self) -> bool {
        self.scan_type == ScanType::Quick
    }
}

// A JSON-encoded string is decoded once; anything else that is not an object becomes empty.
pub fn normalize_options(raw: &Value) -> Map<String, Value> {
    match raw {
        Value::Object(map) => map.clone(),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        },
        _ => Map::new(),
    }
}
