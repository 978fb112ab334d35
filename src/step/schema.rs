// src/step/schema.rs
//
// =============================================================================
// LABCOMPILE: STEP PROPERTY SCHEMAS
// =============================================================================
//
// Every step kind declares a fixed property set. Each property has a type,
// an optional numeric range (in canonical units), an optional default, and
// may be flagged `internal` (filled in by the compiler, never by the user).

use super::value::{PropValue, ALL};
use super::StepKind;
use crate::error::PropertyError;
use crate::units::{parse_quantity, Dimension};
use serde_json::Value;

// ============================================================================
// 1. TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropType {
    Text,
    /// Abstract vessel role, rewritten to a graph node during binding.
    Vessel,
    /// Reagent identifier, declared in the procedure's reagent list.
    Reagent,
    Port,
    /// mL, "all", or "<pct>%".
    Volume,
    Temperature,
    Time,
    Speed,
    FlowRate,
    Number,
    Count,
    Flag,
    Choice(&'static [&'static str]),
    NodeList,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Number(f64),
    Flag(bool),
    Text(&'static str),
}

impl DefaultValue {
    fn to_value(self) -> PropValue {
        match self {
            DefaultValue::Number(n) => PropValue::Number(n),
            DefaultValue::Flag(b) => PropValue::Flag(b),
            DefaultValue::Text(s) => PropValue::Text(s.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropSpec {
    pub name: &'static str,
    pub ty: PropType,
    pub range: Option<(f64, f64)>,
    pub default: Option<DefaultValue>,
    pub required: bool,
    pub internal: bool,
}

const fn req(name: &'static str, ty: PropType) -> PropSpec {
    PropSpec {
        name,
        ty,
        range: None,
        default: None,
        required: true,
        internal: false,
    }
}

const fn opt(name: &'static str, ty: PropType) -> PropSpec {
    PropSpec {
        name,
        ty,
        range: None,
        default: None,
        required: false,
        internal: false,
    }
}

const fn internal(name: &'static str, ty: PropType) -> PropSpec {
    PropSpec {
        name,
        ty,
        range: None,
        default: None,
        required: false,
        internal: true,
    }
}

impl PropSpec {
    const fn within(self, min: f64, max: f64) -> Self {
        PropSpec {
            range: Some((min, max)),
            ..self
        }
    }

    const fn or(self, default: DefaultValue) -> Self {
        PropSpec {
            default: Some(default),
            required: false,
            ..self
        }
    }
}

use DefaultValue as D;
use PropType as T;

const VOLUME_LIMITS: (f64, f64) = (0.0, 100_000.0);
const TEMP_LIMITS: (f64, f64) = (-100.0, 400.0);
const TIME_LIMITS: (f64, f64) = (0.0, 7.0 * 24.0 * 3600.0);
const STIR_LIMITS: (f64, f64) = (0.0, 2000.0);

const fn volume(spec: PropSpec) -> PropSpec {
    spec.within(VOLUME_LIMITS.0, VOLUME_LIMITS.1)
}
const fn temp(spec: PropSpec) -> PropSpec {
    spec.within(TEMP_LIMITS.0, TEMP_LIMITS.1)
}
const fn time(spec: PropSpec) -> PropSpec {
    spec.within(TIME_LIMITS.0, TIME_LIMITS.1)
}
const fn stir(spec: PropSpec) -> PropSpec {
    spec.within(STIR_LIMITS.0, STIR_LIMITS.1)
}

// ============================================================================
// 2. SCHEMA TABLES
// ============================================================================

const MOVE: &[PropSpec] = &[
    req("from_vessel", T::Vessel),
    req("to_vessel", T::Vessel),
    volume(req("volume", T::Volume)),
    opt("from_port", T::Port),
    opt("to_port", T::Port),
    opt("through", T::Text),
    opt("move_speed", T::FlowRate).within(0.0, 1000.0),
    opt("aspiration_speed", T::FlowRate).within(0.0, 1000.0),
    volume(internal("estimated_volume", T::Volume)),
];

const SEPARATE_PHASES: &[PropSpec] = &[
    req("separation_vessel", T::Vessel),
    req("lower_phase_vessel", T::Vessel),
    req("upper_phase_vessel", T::Vessel),
];

const START_STIR: &[PropSpec] = &[
    req("vessel", T::Vessel),
    stir(opt("stir_speed", T::Speed).or(D::Number(250.0))),
];

const VESSEL_ONLY: &[PropSpec] = &[req("vessel", T::Vessel)];

const SET_TEMP: &[PropSpec] = &[req("vessel", T::Vessel), temp(req("temp", T::Temperature))];

const WAIT: &[PropSpec] = &[time(req("time", T::Time))];

const PID_ONLY: &[PropSpec] = &[req("pid", T::Text)];

const ADD: &[PropSpec] = &[
    req("vessel", T::Vessel),
    req("reagent", T::Reagent),
    volume(req("volume", T::Volume)),
    opt("port", T::Port),
    time(opt("time", T::Time).or(D::Number(0.0))),
    opt("stir", T::Flag).or(D::Flag(false)),
    stir(opt("stir_speed", T::Speed)),
    internal("reagent_vessel", T::Vessel),
];

const TRANSFER: &[PropSpec] = &[
    req("from_vessel", T::Vessel),
    req("to_vessel", T::Vessel),
    volume(req("volume", T::Volume)),
    opt("from_port", T::Port),
    opt("to_port", T::Port),
    opt("through", T::Reagent),
    internal("cartridge", T::Vessel),
];

const HEATCHILL: &[PropSpec] = &[
    req("vessel", T::Vessel),
    temp(req("temp", T::Temperature)),
    time(req("time", T::Time)),
    opt("stir", T::Flag).or(D::Flag(true)),
    stir(opt("stir_speed", T::Speed).or(D::Number(250.0))),
    opt("active", T::Flag).or(D::Flag(true)),
];

const HEATCHILL_TO_TEMP: &[PropSpec] = &[
    req("vessel", T::Vessel),
    temp(req("temp", T::Temperature)),
    opt("active", T::Flag).or(D::Flag(true)),
    opt("continue_heatchill", T::Flag).or(D::Flag(true)),
    opt("stir", T::Flag).or(D::Flag(true)),
    stir(opt("stir_speed", T::Speed).or(D::Number(250.0))),
];

const STIR: &[PropSpec] = &[
    req("vessel", T::Vessel),
    time(req("time", T::Time)),
    stir(opt("stir_speed", T::Speed).or(D::Number(250.0))),
];

const FILTER: &[PropSpec] = &[
    req("filter_vessel", T::Vessel),
    opt("filtrate_vessel", T::Vessel),
    time(opt("wait_time", T::Time).or(D::Number(120.0))),
    internal("waste_vessel", T::Vessel),
];

const WASH_SOLID: &[PropSpec] = &[
    req("vessel", T::Vessel),
    req("solvent", T::Reagent),
    volume(req("volume", T::Volume)),
    opt("repeats", T::Count).within(1.0, 20.0).or(D::Number(1.0)),
    time(opt("time", T::Time).or(D::Number(60.0))),
    internal("solvent_vessel", T::Vessel),
    internal("waste_vessel", T::Vessel),
    volume(internal("vessel_capacity", T::Volume)),
];

const DRY: &[PropSpec] = &[req("vessel", T::Vessel), time(req("time", T::Time))];

const FILTER_THROUGH: &[PropSpec] = &[
    req("from_vessel", T::Vessel),
    req("to_vessel", T::Vessel),
    req("through", T::Reagent),
    opt("eluting_solvent", T::Reagent),
    volume(opt("eluting_volume", T::Volume).or(D::Number(0.0))),
    opt("eluting_repeats", T::Count).within(1.0, 20.0).or(D::Number(1.0)),
    internal("cartridge", T::Vessel),
    internal("solvent_vessel", T::Vessel),
    internal("buffer_flasks", T::NodeList),
    volume(internal("from_capacity", T::Volume)),
];

const SEPARATE: &[PropSpec] = &[
    req("purpose", T::Choice(&["extract", "wash"])),
    req("product_phase", T::Choice(&["top", "bottom"])),
    req("from_vessel", T::Vessel),
    req("separation_vessel", T::Vessel),
    req("to_vessel", T::Vessel),
    opt("waste_phase_to_vessel", T::Vessel),
    opt("solvent", T::Reagent),
    volume(opt("solvent_volume", T::Volume).or(D::Number(0.0))),
    internal("solvent_vessel", T::Vessel),
    internal("waste_vessel", T::Vessel),
    internal("buffer_flasks", T::NodeList),
    volume(internal("separator_capacity", T::Volume)),
];

const REPEAT: &[PropSpec] = &[req("repeats", T::Count).within(1.0, 1000.0)];

const CLEAN_BACKBONE: &[PropSpec] = &[
    req("solvent", T::Reagent),
    volume(opt("volume", T::Volume).or(D::Number(5.0))),
    internal("solvent_vessel", T::Vessel),
    internal("waste_vessel", T::Vessel),
];

const REMOVE_DEAD_VOLUME: &[PropSpec] = &[
    req("filter_vessel", T::Vessel),
    volume(req("dead_volume", T::Volume)),
    internal("waste_vessel", T::Vessel),
];

const PURGE_UNTIL_STABLE: &[PropSpec] = &[
    req("vessel", T::Vessel),
    opt("sensor", T::Text).or(D::Text("pressure")),
    opt("tolerance", T::Number).within(0.0, 1.0e6).or(D::Number(1.0)),
    time(opt("interval", T::Time).or(D::Number(30.0))),
    opt("max_cycles", T::Count).within(1.0, 10_000.0).or(D::Number(20.0)),
];

/// The declared property set of `kind`.
pub fn schema(kind: StepKind) -> &'static [PropSpec] {
    use StepKind::*;
    match kind {
        Move => MOVE,
        SeparatePhases => SEPARATE_PHASES,
        StartStir => START_STIR,
        StopStir | StartHeatChill | StopHeatChill | StartVacuum | StopVacuum | StartPurge
        | StopPurge => VESSEL_ONLY,
        SetTemp => SET_TEMP,
        Wait => WAIT,
        AwaitAsync | Async => PID_ONLY,
        Add => ADD,
        Transfer => TRANSFER,
        HeatChill => HEATCHILL,
        HeatChillToTemp => HEATCHILL_TO_TEMP,
        Stir => STIR,
        Filter => FILTER,
        WashSolid => WASH_SOLID,
        Dry => DRY,
        FilterThrough => FILTER_THROUGH,
        Separate => SEPARATE,
        Repeat => REPEAT,
        CleanBackbone => CLEAN_BACKBONE,
        RemoveFilterDeadVolume => REMOVE_DEAD_VOLUME,
        PurgeUntilStable => PURGE_UNTIL_STABLE,
    }
}

pub fn lookup(kind: StepKind, name: &str) -> Result<&'static PropSpec, PropertyError> {
    schema(kind)
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| PropertyError::UnknownProperty {
            step: kind.name().to_string(),
            property: name.to_string(),
        })
}

// ============================================================================
// 3. CONVERSION & VALIDATION
// ============================================================================

impl PropSpec {
    pub fn default_value(&self) -> Option<PropValue> {
        self.default.map(DefaultValue::to_value)
    }

    /// Converts a raw (declarative-source) value into its canonical form.
    pub fn convert_raw(&self, kind: StepKind, raw: &Value) -> Result<PropValue, PropertyError> {
        let invalid = |reason: String| PropertyError::InvalidValue {
            step: kind.name().to_string(),
            property: self.name.to_string(),
            reason,
        };
        let unit = |dimension: Dimension| -> Result<PropValue, PropertyError> {
            match raw {
                Value::Number(n) => n
                    .as_f64()
                    .map(PropValue::Number)
                    .ok_or_else(|| invalid(format!("{} is not finite", n))),
                Value::String(s) => parse_quantity(s, dimension)
                    .map(PropValue::Number)
                    .map_err(|reason| PropertyError::Unit {
                        step: kind.name().to_string(),
                        reason,
                    }),
                other => Err(invalid(format!("expected a quantity, got {}", other))),
            }
        };

        let value = match self.ty {
            T::Text | T::Vessel | T::Reagent | T::Port => match raw {
                Value::String(s) if !s.trim().is_empty() => PropValue::Text(s.trim().to_string()),
                other => return Err(invalid(format!("expected a non-empty string, got {}", other))),
            },
            T::Choice(options) => match raw {
                Value::String(s) if options.contains(&s.to_lowercase().as_str()) => {
                    PropValue::Text(s.to_lowercase())
                }
                other => return Err(invalid(format!("expected one of {:?}, got {}", options, other))),
            },
            T::Volume => match raw {
                Value::String(s) if s.trim().eq_ignore_ascii_case(ALL) => {
                    PropValue::Text(ALL.to_string())
                }
                Value::String(s) if s.trim().ends_with('%') => {
                    let pct: f64 = s
                        .trim()
                        .trim_end_matches('%')
                        .trim()
                        .parse()
                        .map_err(|_| invalid(format!("bad percentage '{}'", s)))?;
                    if !(pct > 0.0 && pct <= 100.0) {
                        return Err(invalid(format!("percentage {} out of (0, 100]", pct)));
                    }
                    PropValue::Text(format!("{}%", pct))
                }
                _ => unit(Dimension::Volume)?,
            },
            T::Temperature => unit(Dimension::Temperature)?,
            T::Time => unit(Dimension::Time)?,
            T::Speed => unit(Dimension::RotationSpeed)?,
            T::FlowRate => unit(Dimension::FlowRate)?,
            T::Number => match raw {
                Value::Number(n) => n
                    .as_f64()
                    .map(PropValue::Number)
                    .ok_or_else(|| invalid(format!("{} is not finite", n)))?,
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(PropValue::Number)
                    .map_err(|_| invalid(format!("'{}' is not a number", s)))?,
                other => return Err(invalid(format!("expected a number, got {}", other))),
            },
            T::Count => {
                let n = match raw {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                }
                .ok_or_else(|| invalid(format!("expected an integer, got {}", raw)))?;
                if n.fract() != 0.0 || n < 0.0 {
                    return Err(invalid(format!("{} is not a whole number", n)));
                }
                PropValue::Number(n)
            }
            T::Flag => match raw {
                Value::Bool(b) => PropValue::Flag(*b),
                Value::String(s) if s.eq_ignore_ascii_case("true") => PropValue::Flag(true),
                Value::String(s) if s.eq_ignore_ascii_case("false") => PropValue::Flag(false),
                other => return Err(invalid(format!("expected a boolean, got {}", other))),
            },
            T::NodeList => match raw {
                Value::Array(items) => PropValue::List(
                    items
                        .iter()
                        .map(|i| {
                            i.as_str()
                                .map(str::to_string)
                                .ok_or_else(|| invalid(format!("list item {} is not a string", i)))
                        })
                        .collect::<Result<_, _>>()?,
                ),
                other => return Err(invalid(format!("expected a list, got {}", other))),
            },
        };

        self.check(kind, &value)?;
        Ok(value)
    }

    /// Type and range check of an already canonical value.
    pub fn check(&self, kind: StepKind, value: &PropValue) -> Result<(), PropertyError> {
        let invalid = |reason: String| PropertyError::InvalidValue {
            step: kind.name().to_string(),
            property: self.name.to_string(),
            reason,
        };

        let shape_ok = match (self.ty, value) {
            (T::Flag, PropValue::Flag(_)) => true,
            (T::NodeList, PropValue::List(_)) => true,
            (T::Volume, PropValue::Text(s)) => s == ALL || s.ends_with('%'),
            (T::Choice(options), PropValue::Text(s)) => options.contains(&s.as_str()),
            (T::Text | T::Vessel | T::Reagent | T::Port, PropValue::Text(_)) => true,
            (
                T::Volume
                | T::Temperature
                | T::Time
                | T::Speed
                | T::FlowRate
                | T::Number
                | T::Count,
                PropValue::Number(_),
            ) => true,
            _ => false,
        };
        if !shape_ok {
            return Err(invalid(format!("{:?} does not accept {}", self.ty, value)));
        }

        if let (Some((min, max)), PropValue::Number(v)) = (self.range, value) {
            if !v.is_finite() || *v < min || *v > max {
                return Err(PropertyError::Range {
                    step: kind.name().to_string(),
                    property: self.name.to_string(),
                    value: *v,
                    min,
                    max,
                });
            }
        }
        Ok(())
    }
}
