use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    pub brand: String,
    #[serde(rename = "type")]
    pub sensor_type: String,
}

impl Sensor {
    pub fn new(brand: impl Into<String>, sensor_type: impl Into<String>) -> Self {
        Self {
            brand: brand.into(),
            sensor_type: sensor_type.into(),
        }
    }

    /// Filesystem-safe identifier, used for result directories and
    /// datasheet filenames.
    pub fn slug(&self) -> String {
        format!("{}_{}", self.brand, self.sensor_type).replace(' ', "_")
    }
}

impl std::fmt::Display for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.brand, self.sensor_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_replaces_spaces() {
        let sensor = Sensor::new("Bosch", "BME 280");
        assert_eq!(sensor.slug(), "Bosch_BME_280");
    }
}
