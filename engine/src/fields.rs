//! Structured column types.
//!
//! Some back-office columns hold nested objects (a concession's `location`,
//! a purchase's `quality_specifications`). They are modelled as explicit
//! records with known optional fields and checked when a write is validated,
//! instead of trusting their shape when rows are read.

use crate::{error::Result, Error};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Where a concession, stockpile or site is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Location {
    fn check(&self, field: &str) -> Result<()> {
        if let Some(lat) = self.latitude {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(Error::InvalidPayload(format!(
                    "{field}.latitude {lat} is out of range"
                )));
            }
        }
        if let Some(lon) = self.longitude {
            if !(-180.0..=180.0).contains(&lon) {
                return Err(Error::InvalidPayload(format!(
                    "{field}.longitude {lon} is out of range"
                )));
            }
        }
        Ok(())
    }
}

/// Assay figures agreed for a commodity lot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QualitySpecifications {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purity_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moisture_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impurities_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub particle_size_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl QualitySpecifications {
    fn check(&self, field: &str) -> Result<()> {
        let percents = [
            ("purity_percent", self.purity_percent),
            ("moisture_percent", self.moisture_percent),
            ("impurities_percent", self.impurities_percent),
        ];
        for (name, value) in percents {
            if let Some(v) = value {
                if !(0.0..=100.0).contains(&v) {
                    return Err(Error::InvalidPayload(format!(
                        "{field}.{name} {v} is not a percentage"
                    )));
                }
            }
        }
        if self.particle_size_mm.is_some_and(|size| size < 0.0) {
            return Err(Error::InvalidPayload(format!(
                "{field}.particle_size_mm must not be negative"
            )));
        }
        Ok(())
    }
}

fn parse<T: DeserializeOwned>(field: &str, value: &serde_json::Value) -> Result<T> {
    T::deserialize(value).map_err(|e| Error::InvalidPayload(format!("{field}: {e}")))
}

/// Check a `location` column value.
pub fn validate_location(field: &str, value: &serde_json::Value) -> Result<()> {
    parse::<Location>(field, value)?.check(field)
}

/// Check a `quality_specifications` column value.
pub fn validate_quality(field: &str, value: &serde_json::Value) -> Result<()> {
    parse::<QualitySpecifications>(field, value)?.check(field)
}
