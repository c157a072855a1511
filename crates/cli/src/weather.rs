//! Demo weather provider served by `mcphub serve`.

use std::sync::{Arc, Mutex, PoisonError};

use mcp::ToolSchema;
use reactor::{HandlerError, ToolProvider};
use serde_json::Value;
use tracing::info;

/// Queried locations, in call order.
#[derive(Debug, Clone, Default)]
pub struct Records(Arc<Mutex<Vec<String>>>);

impl Records {
    fn push(&self, location: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(location.to_string());
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

pub fn lookup(location: &str) -> String {
    let location = location.trim();
    if location.is_empty() {
        return "Location is required".to_string();
    }

    match location.to_lowercase().as_str() {
        "beijing" => "The weather of Beijing is sunny, 25°C".to_string(),
        "shanghai" => "The weather of Shanghai is cloudy, 22°C".to_string(),
        "hangzhou" => {
            "The weather of Hangzhou is rainy, 29°C, 80% humidity, wind 10km/h".to_string()
        }
        other => format!("The weather of {} is unknown", title_case(other)),
    }
}

fn title_case(s: &str) -> String {
    s.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn provider() -> ToolProvider {
    let records = Records::default();

    let get_weather = {
        let records = records.clone();
        move |args: serde_json::Map<String, Value>| {
            let location = args.get("location").and_then(Value::as_str).unwrap_or_default();
            info!(%location, "get_weather");
            records.push(location);
            Ok::<_, HandlerError>(lookup(location))
        }
    };

    let list_records = move |_: serde_json::Map<String, Value>| {
        Ok::<_, HandlerError>(serde_json::to_string(&records.snapshot())?)
    };

    ToolProvider::new("weather", env!("CARGO_PKG_VERSION"))
        .instructions("Look up the current weather of a city.")
        .tool(
            ToolSchema::builder("get_weather")
                .description("Get the weather of a location")
                .required::<String>("location", "The location to get weather for")
                .build(),
            get_weather,
        )
        .tool(
            ToolSchema::builder("list_get_weather_records")
                .description("List all get weather records")
                .build(),
            list_records,
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_cities() {
        assert_eq!(lookup("beijing"), "The weather of Beijing is sunny, 25°C");
        assert_eq!(lookup(" Shanghai "), "The weather of Shanghai is cloudy, 22°C");
    }

    #[test]
    fn unknown_and_empty() {
        assert_eq!(lookup("new york"), "The weather of New York is unknown");
        assert_eq!(lookup("  "), "Location is required");
    }
}
