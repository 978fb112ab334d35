// src/step.rs
//
// =============================================================================
// LABCOMPILE: STEP TREE
// =============================================================================
//
// One node of a procedure. The kind set is closed and falls into four
// variants:
//
//   Base       -> one device command, no children.
//   Composite  -> children derived from its own properties (and the graph).
//   Dynamic    -> children produced phase by phase at runtime.
//   Async      -> a body that runs off the main schedule.
//
// Children of composite/dynamic steps are expanded once, on first request,
// and cached on the step. Cloning a step drops the cache, so a clone is
// always a fresh, unexpanded copy.

use crate::config::CompilerConfig;
use crate::error::PropertyError;
use crate::graph::ResourceGraph;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

pub mod dynamic;
pub mod expand;
pub mod locks;
pub mod schema;
pub mod value;

pub use locks::LockDeclaration;
pub use schema::{PropSpec, PropType};
pub use value::{Amount, PropValue, Properties};

// ============================================================================
// 1. KINDS & VARIANTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StepKind {
    // Base
    Move,
    SeparatePhases,
    StartStir,
    StopStir,
    SetTemp,
    StartHeatChill,
    StopHeatChill,
    StartVacuum,
    StopVacuum,
    StartPurge,
    StopPurge,
    Wait,
    AwaitAsync,
    // Composite
    Add,
    Transfer,
    HeatChill,
    HeatChillToTemp,
    Stir,
    Filter,
    WashSolid,
    Dry,
    FilterThrough,
    Separate,
    Repeat,
    CleanBackbone,
    RemoveFilterDeadVolume,
    // Dynamic
    PurgeUntilStable,
    // Async
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Base,
    Composite,
    Dynamic,
    Async,
}

impl StepKind {
    pub const ALL_KINDS: &'static [StepKind] = &[
        StepKind::Move,
        StepKind::SeparatePhases,
        StepKind::StartStir,
        StepKind::StopStir,
        StepKind::SetTemp,
        StepKind::StartHeatChill,
        StepKind::StopHeatChill,
        StepKind::StartVacuum,
        StepKind::StopVacuum,
        StepKind::StartPurge,
        StepKind::StopPurge,
        StepKind::Wait,
        StepKind::AwaitAsync,
        StepKind::Add,
        StepKind::Transfer,
        StepKind::HeatChill,
        StepKind::HeatChillToTemp,
        StepKind::Stir,
        StepKind::Filter,
        StepKind::WashSolid,
        StepKind::Dry,
        StepKind::FilterThrough,
        StepKind::Separate,
        StepKind::Repeat,
        StepKind::CleanBackbone,
        StepKind::RemoveFilterDeadVolume,
        StepKind::PurgeUntilStable,
        StepKind::Async,
    ];

    pub fn variant(&self) -> Variant {
        use StepKind::*;
        match self {
            Move | SeparatePhases | StartStir | StopStir | SetTemp | StartHeatChill
            | StopHeatChill | StartVacuum | StopVacuum | StartPurge | StopPurge | Wait
            | AwaitAsync => Variant::Base,
            Add | Transfer | HeatChill | HeatChillToTemp | Stir | Filter | WashSolid | Dry
            | FilterThrough | Separate | Repeat | CleanBackbone | RemoveFilterDeadVolume => {
                Variant::Composite
            }
            PurgeUntilStable => Variant::Dynamic,
            Async => Variant::Async,
        }
    }

    pub fn name(&self) -> &'static str {
        use StepKind::*;
        match self {
            Move => "Move",
            SeparatePhases => "SeparatePhases",
            StartStir => "StartStir",
            StopStir => "StopStir",
            SetTemp => "SetTemp",
            StartHeatChill => "StartHeatChill",
            StopHeatChill => "StopHeatChill",
            StartVacuum => "StartVacuum",
            StopVacuum => "StopVacuum",
            StartPurge => "StartPurge",
            StopPurge => "StopPurge",
            Wait => "Wait",
            AwaitAsync => "AwaitAsync",
            Add => "Add",
            Transfer => "Transfer",
            HeatChill => "HeatChill",
            HeatChillToTemp => "HeatChillToTemp",
            Stir => "Stir",
            Filter => "Filter",
            WashSolid => "WashSolid",
            Dry => "Dry",
            FilterThrough => "FilterThrough",
            Separate => "Separate",
            Repeat => "Repeat",
            CleanBackbone => "CleanBackbone",
            RemoveFilterDeadVolume => "RemoveFilterDeadVolume",
            PurgeUntilStable => "PurgeUntilStable",
            Async => "Async",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL_KINDS
            .iter()
            .copied()
            .find(|k| k.name().eq_ignore_ascii_case(name))
    }

    /// Steps that draw liquid down through a filter frit.
    pub fn is_filtration(&self) -> bool {
        matches!(self, StepKind::Filter | StepKind::WashSolid)
    }

    /// Steps whose body is supplied by the user rather than derived.
    pub fn takes_body(&self) -> bool {
        matches!(self, StepKind::Repeat | StepKind::Async)
    }
}

// ============================================================================
// 2. EXPANSION CONTEXT
// ============================================================================

/// What an expansion may look at besides the step's own properties.
#[derive(Clone, Copy)]
pub struct ExpandCtx<'a> {
    pub graph: Option<&'a ResourceGraph>,
    pub config: &'a CompilerConfig,
}

impl<'a> ExpandCtx<'a> {
    pub fn new(graph: Option<&'a ResourceGraph>, config: &'a CompilerConfig) -> Self {
        Self { graph, config }
    }
}

// ============================================================================
// 3. THE STEP
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct Step {
    pub kind: StepKind,
    props: Properties,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    children: Vec<Step>,
    #[serde(skip)]
    expanded: OnceLock<Vec<Step>>,
}

impl Clone for Step {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            props: self.props.clone(),
            children: self.children.clone(),
            expanded: OnceLock::new(),
        }
    }
}

impl PartialEq for Step {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.props == other.props && self.children == other.children
    }
}

impl Step {
    /// Builds a step from declarative-source values. Units are converted,
    /// ranges checked and defaults filled here; internal properties are refused.
    pub fn new<K, I>(kind: StepKind, raw: I) -> Result<Self, PropertyError>
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut props = Properties::default();
        for (name, value) in raw {
            let spec = schema::lookup(kind, name.as_ref())?;
            if spec.internal {
                return Err(PropertyError::Internal {
                    step: kind.name().to_string(),
                    property: spec.name.to_string(),
                });
            }
            props.insert(spec.name, spec.convert_raw(kind, &value)?);
        }
        Self::finish(kind, props)
    }

    /// Builds a step from canonical values. Used by the compiler itself.
    pub fn from_values<'n, I>(kind: StepKind, values: I) -> Result<Self, PropertyError>
    where
        I: IntoIterator<Item = (&'n str, PropValue)>,
    {
        let mut props = Properties::default();
        for (name, value) in values {
            let spec = schema::lookup(kind, name)?;
            spec.check(kind, &value)?;
            props.insert(spec.name, value);
        }
        Self::finish(kind, props)
    }

    fn finish(kind: StepKind, mut props: Properties) -> Result<Self, PropertyError> {
        for spec in schema::schema(kind) {
            if props.contains(spec.name) {
                continue;
            }
            if let Some(default) = spec.default_value() {
                props.insert(spec.name, default);
            } else if spec.required {
                return Err(PropertyError::Missing {
                    step: kind.name().to_string(),
                    property: spec.name.to_string(),
                });
            }
        }
        Ok(Self {
            kind,
            props,
            children: Vec::new(),
            expanded: OnceLock::new(),
        })
    }

    /// Attaches a user-supplied body (Repeat / Async only).
    pub fn with_body(mut self, body: Vec<Step>) -> Result<Self, PropertyError> {
        if !self.kind.takes_body() && !body.is_empty() {
            return Err(PropertyError::InvalidValue {
                step: self.name().to_string(),
                property: "children".into(),
                reason: "this step does not take substeps".into(),
            });
        }
        self.children = body;
        self.expanded = OnceLock::new();
        Ok(self)
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn variant(&self) -> Variant {
        self.kind.variant()
    }

    pub fn props(&self) -> &Properties {
        &self.props
    }

    /// User-supplied body of a Repeat / Async step.
    pub fn body(&self) -> &[Step] {
        &self.children
    }

    pub fn body_mut(&mut self) -> &mut Vec<Step> {
        self.expanded = OnceLock::new();
        &mut self.children
    }

    /// Resolved property dictionary, as recorded in the diagnostics trace.
    pub fn resolved_props(&self) -> BTreeMap<String, PropValue> {
        self.props.as_map().clone()
    }

    // ------------------------------------------------------------------------
    // Mutation (drops the expansion cache)
    // ------------------------------------------------------------------------

    /// Overwrites a user-facing property, e.g. when binding a vessel role.
    pub fn set(&mut self, name: &str, value: impl Into<PropValue>) -> Result<(), PropertyError> {
        let spec = schema::lookup(self.kind, name)?;
        let value = value.into();
        spec.check(self.kind, &value)?;
        self.props.insert(spec.name, value);
        self.expanded = OnceLock::new();
        Ok(())
    }

    /// Records a compiler-computed property.
    pub fn set_internal(
        &mut self,
        name: &str,
        value: impl Into<PropValue>,
    ) -> Result<(), PropertyError> {
        let spec = schema::lookup(self.kind, name)?;
        if !spec.internal {
            return Err(PropertyError::InvalidValue {
                step: self.name().to_string(),
                property: name.to_string(),
                reason: "not an internal property".into(),
            });
        }
        self.set(name, value)
    }

    // ------------------------------------------------------------------------
    // Typed access
    // ------------------------------------------------------------------------

    /// Raw access; fails on names the kind does not declare.
    pub fn get(&self, name: &str) -> Result<Option<&PropValue>, PropertyError> {
        schema::lookup(self.kind, name)?;
        Ok(self.props.get(name))
    }

    fn missing(&self, name: &str) -> PropertyError {
        PropertyError::Missing {
            step: self.name().to_string(),
            property: name.to_string(),
        }
    }

    fn wrong_type(&self, name: &str, expected: &str) -> PropertyError {
        PropertyError::InvalidValue {
            step: self.name().to_string(),
            property: name.to_string(),
            reason: format!("expected {}", expected),
        }
    }

    pub fn text(&self, name: &str) -> Result<Option<&str>, PropertyError> {
        match self.get(name)? {
            None => Ok(None),
            Some(PropValue::Text(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(self.wrong_type(name, "text")),
        }
    }

    pub fn req_text(&self, name: &str) -> Result<&str, PropertyError> {
        self.text(name)?.ok_or_else(|| self.missing(name))
    }

    pub fn number(&self, name: &str) -> Result<Option<f64>, PropertyError> {
        match self.get(name)? {
            None => Ok(None),
            Some(PropValue::Number(n)) => Ok(Some(*n)),
            Some(_) => Err(self.wrong_type(name, "a number")),
        }
    }

    pub fn req_number(&self, name: &str) -> Result<f64, PropertyError> {
        self.number(name)?.ok_or_else(|| self.missing(name))
    }

    pub fn count(&self, name: &str) -> Result<usize, PropertyError> {
        Ok(self.req_number(name)?.max(0.0) as usize)
    }

    pub fn flag(&self, name: &str) -> Result<bool, PropertyError> {
        match self.get(name)? {
            None => Ok(false),
            Some(PropValue::Flag(b)) => Ok(*b),
            Some(_) => Err(self.wrong_type(name, "a boolean")),
        }
    }

    pub fn amount(&self, name: &str) -> Result<Option<Amount>, PropertyError> {
        match self.get(name)? {
            None => Ok(None),
            Some(v) => Amount::from_value(v)
                .map(Some)
                .ok_or_else(|| self.wrong_type(name, "a volume")),
        }
    }

    pub fn list(&self, name: &str) -> Result<Vec<String>, PropertyError> {
        match self.get(name)? {
            None => Ok(Vec::new()),
            Some(PropValue::List(l)) => Ok(l.clone()),
            Some(_) => Err(self.wrong_type(name, "a list")),
        }
    }

    // ------------------------------------------------------------------------
    // Expansion
    // ------------------------------------------------------------------------

    /// Pure expansion: derives the child sequence without touching the cache.
    pub fn expand(&self, ctx: ExpandCtx<'_>) -> Result<Vec<Step>, PropertyError> {
        match self.variant() {
            Variant::Base => Ok(Vec::new()),
            Variant::Composite => expand::expand_composite(self, ctx),
            Variant::Dynamic => dynamic::static_phases(self),
            Variant::Async => Ok(self.children.clone()),
        }
    }

    /// Cached children: expanded on first request, reused afterwards.
    pub fn substeps(&self, ctx: ExpandCtx<'_>) -> Result<&[Step], PropertyError> {
        if let Some(children) = self.expanded.get() {
            return Ok(children);
        }
        let children = self.expand(ctx)?;
        Ok(self.expanded.get_or_init(|| children))
    }

    pub fn is_expanded(&self) -> bool {
        self.expanded.get().is_some()
    }

    /// Depth-first traversal down to base steps. Calling it again restarts the
    /// walk over the cached expansion.
    pub fn base_operations<'a>(&'a self, ctx: ExpandCtx<'a>) -> BaseOperations<'a> {
        BaseOperations {
            ctx,
            root: Some(self),
            stack: Vec::new(),
            failed: false,
        }
    }

    /// Exclusive-lock declaration of this step.
    pub fn locks(&self, graph: Option<&ResourceGraph>) -> LockDeclaration {
        locks::declare(self, graph)
    }
}

// ============================================================================
// 4. TRAVERSAL
// ============================================================================

pub struct BaseOperations<'a> {
    ctx: ExpandCtx<'a>,
    root: Option<&'a Step>,
    stack: Vec<std::slice::Iter<'a, Step>>,
    failed: bool,
}

impl<'a> Iterator for BaseOperations<'a> {
    type Item = Result<&'a Step, PropertyError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let step = match self.root.take() {
                Some(root) => root,
                None => {
                    let top = self.stack.last_mut()?;
                    match top.next() {
                        Some(step) => step,
                        None => {
                            self.stack.pop();
                            continue;
                        }
                    }
                }
            };

            if step.variant() == Variant::Base {
                return Some(Ok(step));
            }

            match step.substeps(self.ctx) {
                Ok(children) => self.stack.push(children.iter()),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Convenience for building compiler-generated steps.
#[macro_export]
macro_rules! step {
    ($kind:ident { $($name:literal => $value:expr),* $(,)? }) => {
        $crate::step::Step::from_values(
            $crate::step::StepKind::$kind,
            [$(($name, $crate::step::PropValue::from($value))),*],
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kinds(walk: BaseOperations<'_>) -> Vec<&'static str> {
        walk.map(|step| step.expect("Expansion should succeed").name())
            .collect()
    }

    fn stir(vessel: &str) -> Step {
        Step::new(StepKind::Stir, [("vessel", json!(vessel)), ("time", json!(10))]).unwrap()
    }

    #[test]
    fn walk_repeats_body_in_order() {
        let cfg = CompilerConfig::default();
        let dry = Step::new(StepKind::Dry, [("vessel", json!("filter")), ("time", json!(30))]).unwrap();
        let repeat = Step::new(StepKind::Repeat, [("repeats", json!(2))])
            .unwrap()
            .with_body(vec![dry])
            .unwrap();

        assert_eq!(
            kinds(repeat.base_operations(ExpandCtx::new(None, &cfg))),
            vec!["StartVacuum", "Wait", "StopVacuum", "StartVacuum", "Wait", "StopVacuum"]
        );
    }

    #[test]
    fn walk_descends_into_async_body_and_reuses_cache() {
        let cfg = CompilerConfig::default();
        let ctx = ExpandCtx::new(None, &cfg);
        let background = Step::new(StepKind::Async, [("pid", json!("bg"))])
            .unwrap()
            .with_body(vec![stir("reactor")])
            .unwrap();
        assert!(!background.is_expanded());

        let first: Vec<*const Step> = background
            .base_operations(ctx)
            .map(|s| s.unwrap() as *const Step)
            .collect();
        assert!(background.is_expanded());
        assert!(background.substeps(ctx).unwrap()[0].is_expanded());

        // A second walk hands out the very same cached steps.
        let second: Vec<*const Step> = background
            .base_operations(ctx)
            .map(|s| s.unwrap() as *const Step)
            .collect();
        assert_eq!(first, second);
        assert_eq!(kinds(background.base_operations(ctx)), vec!["StartStir", "Wait", "StopStir"]);
    }

    #[test]
    fn expansion_error_ends_the_walk() {
        let cfg = CompilerConfig::default();
        // Elution volume without an eluting solvent only fails on expansion.
        let broken = Step::new(
            StepKind::FilterThrough,
            [
                ("from_vessel", json!("reactor")),
                ("to_vessel", json!("flask")),
                ("through", json!("celite")),
                ("eluting_volume", json!(10)),
            ],
        )
        .unwrap();
        let root = Step::new(StepKind::Repeat, [("repeats", json!(1))])
            .unwrap()
            .with_body(vec![Step::new(StepKind::Wait, [("time", json!(5))]).unwrap(), broken, stir("reactor")])
            .unwrap();

        let mut walk = root.base_operations(ExpandCtx::new(None, &cfg));
        assert_eq!(walk.next().unwrap().unwrap().kind, StepKind::Wait);
        assert!(matches!(walk.next(), Some(Err(PropertyError::Missing { .. }))));
        assert!(walk.next().is_none());
    }
}
