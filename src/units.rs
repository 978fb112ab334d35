// src/units.rs
//
// =============================================================================
// LABCOMPILE: UNITS & CANONICAL QUANTITIES
// =============================================================================
//
// Every unit-bearing property is converted here, once, at construction time.
// Downstream code only ever sees canonical numbers:
//
//   volume      -> millilitres
//   temperature -> degrees Celsius
//   time        -> seconds
//   stir speed  -> RPM
//   flow rate   -> mL/min
//   mass        -> grams

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// 1. TYPE-SAFE UNITS (The "Newtype" Pattern)
// ============================================================================

/// Volume in millilitres (mL).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd, Default)]
pub struct Millilitres(pub f64);

/// Temperature in degrees Celsius.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd)]
pub struct Celsius(pub f64);

/// Duration in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd, Default)]
pub struct Seconds(pub f64);

impl fmt::Display for Millilitres {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} mL", self.0)
    }
}

impl fmt::Display for Celsius {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} °C", self.0)
    }
}

// ============================================================================
// 2. DIMENSIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Volume,
    Temperature,
    Time,
    RotationSpeed,
    FlowRate,
    Mass,
}

impl Dimension {
    pub fn canonical_unit(&self) -> &'static str {
        match self {
            Dimension::Volume => "mL",
            Dimension::Temperature => "°C",
            Dimension::Time => "s",
            Dimension::RotationSpeed => "RPM",
            Dimension::FlowRate => "mL/min",
            Dimension::Mass => "g",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum UnitError {
    #[error("cannot parse '{0}' as a number")]
    NotANumber(String),
    #[error("unit '{unit}' is not a {dimension:?} unit")]
    WrongUnit { unit: String, dimension: Dimension },
}

// ============================================================================
// 3. PARSING
// ============================================================================

/// Parses `"<number> <unit>"` (or a bare number, assumed canonical) into the
/// canonical value for `dimension`.
pub fn parse_quantity(raw: &str, dimension: Dimension) -> Result<f64, UnitError> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+' || c == 'e'))
        .unwrap_or(raw.len());

    // "1e" would swallow the start of an exponent-less unit, back off to the digits.
    let (number, unit) = match raw[..split].parse::<f64>() {
        Ok(_) => raw.split_at(split),
        Err(_) => {
            let digits_end = raw
                .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
                .unwrap_or(raw.len());
            raw.split_at(digits_end)
        }
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| UnitError::NotANumber(raw.to_string()))?;

    convert(value, unit.trim(), dimension)
}

/// Converts `value` expressed in `unit` to the canonical unit of `dimension`.
pub fn convert(value: f64, unit: &str, dimension: Dimension) -> Result<f64, UnitError> {
    let wrong = || UnitError::WrongUnit {
        unit: unit.to_string(),
        dimension,
    };

    if unit.is_empty() {
        return Ok(value);
    }

    let converted = match dimension {
        Dimension::Volume => match unit {
            "uL" | "µL" | "ul" => value / 1000.0,
            "mL" | "ml" => value,
            "cL" | "cl" => value * 10.0,
            "dL" | "dl" => value * 100.0,
            "L" | "l" => value * 1000.0,
            _ => return Err(wrong()),
        },
        Dimension::Temperature => match unit {
            "°C" | "C" | "degC" => value,
            "K" => value - 273.15,
            "°F" | "F" | "degF" => (value - 32.0) * 5.0 / 9.0,
            _ => return Err(wrong()),
        },
        Dimension::Time => match unit {
            "s" | "sec" | "secs" | "seconds" => value,
            "min" | "mins" | "minutes" => value * 60.0,
            "h" | "hr" | "hrs" | "hours" => value * 3600.0,
            _ => return Err(wrong()),
        },
        Dimension::RotationSpeed => match unit {
            "RPM" | "rpm" => value,
            _ => return Err(wrong()),
        },
        Dimension::FlowRate => match unit {
            "mL/min" | "ml/min" => value,
            "mL/h" | "ml/h" => value / 60.0,
            "L/min" | "l/min" => value * 1000.0,
            _ => return Err(wrong()),
        },
        Dimension::Mass => match unit {
            "mg" => value / 1000.0,
            "g" => value,
            "kg" => value * 1000.0,
            _ => return Err(wrong()),
        },
    };

    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volumes_normalise_to_millilitres() {
        assert_eq!(parse_quantity("1.5 L", Dimension::Volume).unwrap(), 1500.0);
        assert_eq!(parse_quantity("250 uL", Dimension::Volume).unwrap(), 0.25);
        assert_eq!(parse_quantity("12", Dimension::Volume).unwrap(), 12.0);
    }

    #[test]
    fn temperatures_normalise_to_celsius() {
        let k = parse_quantity("373.15 K", Dimension::Temperature).unwrap();
        assert!((k - 100.0).abs() < 1e-9);
        let f = parse_quantity("212 °F", Dimension::Temperature).unwrap();
        assert!((f - 100.0).abs() < 1e-9);
    }

    #[test]
    fn times_normalise_to_seconds() {
        assert_eq!(parse_quantity("5 min", Dimension::Time).unwrap(), 300.0);
        assert_eq!(parse_quantity("2h", Dimension::Time).unwrap(), 7200.0);
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let err = parse_quantity("10 min", Dimension::Volume).unwrap_err();
        assert!(matches!(err, UnitError::WrongUnit { .. }));
        assert!(parse_quantity("lots", Dimension::Volume).is_err());
    }
}
