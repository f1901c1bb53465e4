//! Weather tool: a stub that returns mock weather data.
//!
//! Returns plausible, deterministic weather for a city so the loop can be
//! exercised end-to-end without network access.

use async_trait::async_trait;
use serde_json::Value;
use steploop_core::error::ToolError;
use steploop_core::shape::{FieldKind, InputShape};
use steploop_core::tool::Tool;

pub struct GetWeatherTool;

#[async_trait]
impl Tool for GetWeatherTool {
    fn name(&self) -> &str {
        "getWeather"
    }

    fn description(&self) -> &str {
        "Get the weather for a city. Returns temperature (°F), condition, and the city."
    }

    fn input_shape(&self) -> InputShape {
        InputShape::object()
            .field("city", FieldKind::String)
            .describe("The city to get weather for")
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        let city = input["city"]
            .as_str()
            .ok_or_else(|| ToolError::failed(self.name(), "Missing 'city' argument"))?;

        serde_json::to_value(generate_mock_weather(city))
            .map_err(|e| ToolError::failed(self.name(), e.to_string()))
    }
}

#[derive(serde::Serialize)]
struct WeatherData {
    temperature: i64,
    condition: String,
    city: String,
}

/// Generate deterministic mock weather based on the city name hash.
fn generate_mock_weather(city: &str) -> WeatherData {
    let hash: u32 = city
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));

    let conditions = [
        "sunny",
        "partly cloudy",
        "cloudy",
        "light rain",
        "heavy rain",
        "thunderstorms",
        "snow",
        "foggy",
    ];

    WeatherData {
        temperature: 23 + (hash % 72) as i64, // 23 to 94°F
        condition: conditions[(hash as usize / 7) % conditions.len()].to_string(),
        city: city.to_string(),
    }
}
