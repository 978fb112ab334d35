// src/step/expand.rs
//
// =============================================================================
// LABCOMPILE: COMPOSITE EXPANSION
// =============================================================================
//
// Pure functions `step + graph + config -> child steps`.
//
// Bound steps carry internal properties (reagent flask, waste, buffer flasks,
// capacities) filled in by the executor. Unbound steps still expand, using
// the abstract names as node names, so a tree can be inspected before any
// apparatus exists.

use super::value::{Amount, PropValue};
use super::{ExpandCtx, Step, StepKind};
use crate::error::PropertyError;
use crate::step;

const DEFAULT_WASTE: &str = "waste";

pub(crate) fn expand_composite(
    step: &Step,
    ctx: ExpandCtx<'_>,
) -> Result<Vec<Step>, PropertyError> {
    use StepKind::*;
    match step.kind {
        Add => add(step, ctx),
        Transfer => transfer(step),
        HeatChill => heatchill(step),
        HeatChillToTemp => heatchill_to_temp(step),
        Stir => stir(step),
        Filter => filter(step, ctx),
        WashSolid => wash_solid(step, ctx),
        Dry => dry(step),
        FilterThrough => filter_through(step, ctx),
        Separate => separate(step, ctx),
        Repeat => repeat(step),
        CleanBackbone => clean_backbone(step),
        RemoveFilterDeadVolume => remove_dead_volume(step, ctx),
        _ => Ok(Vec::new()),
    }
}

// ============================================================================
// 1. SHARED HELPERS
// ============================================================================

/// Splits `total` into the fewest equal transfers that each fit `capacity`.
/// The last chunk absorbs rounding so the chunks sum to `total`.
pub fn split_volume(total: f64, capacity: f64) -> Vec<f64> {
    if !(capacity > 0.0) || !capacity.is_finite() || total <= capacity {
        return vec![total];
    }
    let n = (total / capacity).ceil() as usize;
    let chunk = total / n as f64;
    let mut chunks = vec![chunk; n - 1];
    chunks.push(total - chunk * (n - 1) as f64);
    chunks
}

/// Number of sub-separations a Separate step needs against `capacity`.
pub fn separation_count(solvent_volume: f64, capacity: f64) -> usize {
    if solvent_volume > 0.0 {
        split_volume(solvent_volume, capacity).len()
    } else {
        1
    }
}

/// Transient holding flasks a step needs once its split count is known.
pub fn buffer_flasks_needed(step: &Step, split_count: usize) -> Result<usize, PropertyError> {
    match step.kind {
        StepKind::FilterThrough => {
            Ok(usize::from(step.req_text("from_vessel")? == step.req_text("to_vessel")?))
        }
        StepKind::Separate if split_count > 1 => Ok(split_count),
        StepKind::Separate => {
            Ok(usize::from(step.req_text("from_vessel")? == step.req_text("to_vessel")?))
        }
        _ => Ok(0),
    }
}

/// Separator capacity seen by a Separate step: bound value, graph value, or
/// the template-mode assumption.
pub fn separator_capacity(step: &Step, ctx: ExpandCtx<'_>) -> Result<f64, PropertyError> {
    if let Some(cap) = step.number("separator_capacity")? {
        return Ok(cap);
    }
    let graph_cap = ctx
        .graph
        .and_then(|g| g.node(step.text("separation_vessel").ok().flatten()?))
        .and_then(|n| n.capacity);
    Ok(graph_cap.unwrap_or(ctx.config.separation.template_separator_capacity_ml))
}

fn value(step: &Step, name: &str) -> Result<PropValue, PropertyError> {
    step.get(name)?.cloned().ok_or_else(|| PropertyError::Missing {
        step: step.name().to_string(),
        property: name.to_string(),
    })
}

fn metered(step: &Step, name: &str) -> Result<f64, PropertyError> {
    match step.amount(name)? {
        Some(Amount::Ml(v)) => Ok(v),
        Some(_) => Err(PropertyError::InvalidValue {
            step: step.name().to_string(),
            property: name.to_string(),
            reason: "a metered volume in mL is required here".into(),
        }),
        None => Err(PropertyError::Missing {
            step: step.name().to_string(),
            property: name.to_string(),
        }),
    }
}

fn bound_or<'s>(step: &'s Step, internal: &str, fallback: &'s str) -> Result<&'s str, PropertyError> {
    Ok(step.text(internal)?.unwrap_or(fallback))
}

fn buffer_names(step: &Step, count: usize) -> Result<Vec<String>, PropertyError> {
    let mut names = step.list("buffer_flasks")?;
    while names.len() < count {
        names.push(format!("buffer_flask_{}", names.len() + 1));
    }
    Ok(names)
}

fn capacity_of(step: &Step, ctx: ExpandCtx<'_>, internal: &str, vessel: &str) -> Result<f64, PropertyError> {
    if let Some(cap) = step.number(internal)? {
        return Ok(cap);
    }
    Ok(ctx
        .graph
        .and_then(|g| g.node(vessel))
        .and_then(|n| n.capacity)
        .unwrap_or(f64::INFINITY))
}

/// `port` when the bound node declares it, so unbound trees stay portless.
fn declared_port(ctx: ExpandCtx<'_>, vessel: &str, port: &'static str) -> Option<&'static str> {
    let node = ctx.graph?.node(vessel)?;
    node.ports.iter().any(|p| p == port).then_some(port)
}

fn transfer_step(
    from: &str,
    to: &str,
    amount: impl Into<PropValue>,
    from_port: Option<&str>,
    to_port: Option<&str>,
    through: Option<&str>,
) -> Result<Step, PropertyError> {
    let mut mv = step!(Move {
        "from_vessel" => from,
        "to_vessel" => to,
        "volume" => amount.into(),
    })?;
    if let Some(port) = from_port {
        mv.set("from_port", port)?;
    }
    if let Some(port) = to_port {
        mv.set("to_port", port)?;
    }
    if let Some(via) = through {
        mv.set("through", via)?;
    }
    Ok(mv)
}

fn wait(seconds: f64) -> Result<Step, PropertyError> {
    step!(Wait { "time" => seconds })
}

// ============================================================================
// 2. PER-KIND EXPANSIONS
// ============================================================================

fn add(step: &Step, ctx: ExpandCtx<'_>) -> Result<Vec<Step>, PropertyError> {
    let vessel = step.req_text("vessel")?;
    let reagent = step.req_text("reagent")?;
    let source = bound_or(step, "reagent_vessel", reagent)?;

    let mut out = Vec::new();
    if step.flag("stir")? {
        let speed = step.number("stir_speed")?.unwrap_or(ctx.config.transfer.add_stir_speed_rpm);
        out.push(step!(StartStir { "vessel" => vessel, "stir_speed" => speed })?);
    }
    out.push(transfer_step(
        source,
        vessel,
        value(step, "volume")?,
        None,
        step.text("port")?,
        None,
    )?);
    let time = step.req_number("time")?;
    if time > 0.0 {
        out.push(wait(time)?);
    }
    Ok(out)
}

fn transfer(step: &Step) -> Result<Vec<Step>, PropertyError> {
    let through = match step.text("cartridge")? {
        Some(node) => Some(node),
        None => step.text("through")?,
    };
    Ok(vec![transfer_step(
        step.req_text("from_vessel")?,
        step.req_text("to_vessel")?,
        value(step, "volume")?,
        step.text("from_port")?,
        step.text("to_port")?,
        through,
    )?])
}

fn bracket_stir(step: &Step, vessel: &str, body: Vec<Step>) -> Result<Vec<Step>, PropertyError> {
    if !step.flag("stir")? {
        return Ok(body);
    }
    let mut out = vec![step!(StartStir {
        "vessel" => vessel,
        "stir_speed" => step.req_number("stir_speed")?,
    })?];
    out.extend(body);
    out.push(step!(StopStir { "vessel" => vessel })?);
    Ok(out)
}

fn heatchill(step: &Step) -> Result<Vec<Step>, PropertyError> {
    let vessel = step.req_text("vessel")?;
    let time = step.req_number("time")?;
    let body = if step.flag("active")? {
        vec![
            step!(SetTemp { "vessel" => vessel, "temp" => step.req_number("temp")? })?,
            step!(StartHeatChill { "vessel" => vessel })?,
            wait(time)?,
            step!(StopHeatChill { "vessel" => vessel })?,
        ]
    } else {
        // Passive: let the vessel drift towards the set-point on its own.
        vec![wait(time)?]
    };
    bracket_stir(step, vessel, body)
}

fn heatchill_to_temp(step: &Step) -> Result<Vec<Step>, PropertyError> {
    let vessel = step.req_text("vessel")?;
    let mut out = Vec::new();
    if step.flag("stir")? {
        out.push(step!(StartStir {
            "vessel" => vessel,
            "stir_speed" => step.req_number("stir_speed")?,
        })?);
    }
    if step.flag("active")? {
        out.push(step!(SetTemp { "vessel" => vessel, "temp" => step.req_number("temp")? })?);
        out.push(step!(StartHeatChill { "vessel" => vessel })?);
        if !step.flag("continue_heatchill")? {
            out.push(step!(StopHeatChill { "vessel" => vessel })?);
        }
    }
    Ok(out)
}

fn stir(step: &Step) -> Result<Vec<Step>, PropertyError> {
    let vessel = step.req_text("vessel")?;
    Ok(vec![
        step!(StartStir {
            "vessel" => vessel,
            "stir_speed" => step.req_number("stir_speed")?,
        })?,
        wait(step.req_number("time")?)?,
        step!(StopStir { "vessel" => vessel })?,
    ])
}

fn filter(step: &Step, ctx: ExpandCtx<'_>) -> Result<Vec<Step>, PropertyError> {
    let filter = step.req_text("filter_vessel")?;
    let dest = match step.text("filtrate_vessel")? {
        Some(v) => v,
        None => bound_or(step, "waste_vessel", DEFAULT_WASTE)?,
    };
    Ok(vec![
        transfer_step(
            filter,
            dest,
            Amount::All,
            declared_port(ctx, filter, "bottom"),
            None,
            None,
        )?,
        wait(step.req_number("wait_time")?)?,
    ])
}

fn wash_solid(step: &Step, ctx: ExpandCtx<'_>) -> Result<Vec<Step>, PropertyError> {
    let vessel = step.req_text("vessel")?;
    let solvent = bound_or(step, "solvent_vessel", step.req_text("solvent")?)?;
    let waste = bound_or(step, "waste_vessel", DEFAULT_WASTE)?;
    let volume = metered(step, "volume")?;
    let capacity = capacity_of(step, ctx, "vessel_capacity", vessel)?;
    let time = step.req_number("time")?;

    let mut out = Vec::new();
    for _ in 0..step.count("repeats")? {
        for chunk in split_volume(volume, capacity) {
            out.push(transfer_step(
                solvent,
                vessel,
                chunk,
                None,
                declared_port(ctx, vessel, "top"),
                None,
            )?);
            out.push(wait(time)?);
            out.push(transfer_step(
                vessel,
                waste,
                Amount::All,
                declared_port(ctx, vessel, "bottom"),
                None,
                None,
            )?);
        }
    }
    Ok(out)
}

fn dry(step: &Step) -> Result<Vec<Step>, PropertyError> {
    let vessel = step.req_text("vessel")?;
    Ok(vec![
        step!(StartVacuum { "vessel" => vessel })?,
        wait(step.req_number("time")?)?,
        step!(StopVacuum { "vessel" => vessel })?,
    ])
}

fn filter_through(step: &Step, ctx: ExpandCtx<'_>) -> Result<Vec<Step>, PropertyError> {
    let from = step.req_text("from_vessel")?;
    let to = step.req_text("to_vessel")?;
    let cartridge = bound_or(step, "cartridge", step.req_text("through")?)?;
    let pass_through = from == to;

    let buffers = buffer_names(step, usize::from(pass_through))?;
    let dest = if pass_through { buffers[0].as_str() } else { to };

    let mut out = vec![transfer_step(from, dest, Amount::All, None, None, Some(cartridge))?];

    let eluting_volume = metered(step, "eluting_volume")?;
    if eluting_volume > 0.0 {
        let solvent_name = step.text("eluting_solvent")?.ok_or_else(|| PropertyError::Missing {
            step: step.name().to_string(),
            property: "eluting_solvent".into(),
        })?;
        let solvent = bound_or(step, "solvent_vessel", solvent_name)?;
        let capacity = capacity_of(step, ctx, "from_capacity", from)?;

        for _ in 0..step.count("eluting_repeats")? {
            for chunk in split_volume(eluting_volume, capacity) {
                out.push(transfer_step(solvent, from, chunk, None, None, None)?);
                out.push(transfer_step(from, dest, Amount::All, None, None, Some(cartridge))?);
            }
        }
    }

    if pass_through {
        out.push(transfer_step(dest, to, Amount::All, None, None, None)?);
    }
    Ok(out)
}

fn separate(step: &Step, ctx: ExpandCtx<'_>) -> Result<Vec<Step>, PropertyError> {
    let from = step.req_text("from_vessel")?;
    let separator = step.req_text("separation_vessel")?;
    let to = step.req_text("to_vessel")?;
    let product_bottom = step.req_text("product_phase")? == "bottom";
    let waste_dest = match step.text("waste_phase_to_vessel")? {
        Some(v) => v,
        None => bound_or(step, "waste_vessel", DEFAULT_WASTE)?,
    };

    let solvent_volume = metered(step, "solvent_volume")?;
    let solvent = match step.text("solvent")? {
        Some(name) => Some(bound_or(step, "solvent_vessel", name)?),
        None if solvent_volume > 0.0 => {
            return Err(PropertyError::Missing {
                step: step.name().to_string(),
                property: "solvent".into(),
            })
        }
        None => None,
    };

    let capacity = separator_capacity(step, ctx)?;
    let chunks = if solvent_volume > 0.0 {
        split_volume(solvent_volume, capacity)
    } else {
        vec![0.0]
    };
    let n = chunks.len();
    let buffers = buffer_names(step, buffer_flasks_needed(step, n)?)?;
    let cfg = &ctx.config.separation;

    let mut out = Vec::new();
    let mut product_dest = to;
    let sources: Vec<&str> = if n > 1 {
        // Portion the mixture into the buffers first, one per sub-separation.
        for (k, buffer) in buffers.iter().take(n).enumerate() {
            let amount = if k + 1 < n {
                Amount::Fraction(1.0 / (n - k) as f64)
            } else {
                Amount::All
            };
            out.push(transfer_step(from, buffer, amount, None, None, None)?);
        }
        buffers.iter().take(n).map(String::as_str).collect()
    } else {
        if from == to {
            product_dest = buffers[0].as_str();
        }
        vec![from]
    };

    for (source, chunk) in sources.iter().zip(&chunks) {
        if let (Some(solvent), true) = (solvent, *chunk > 0.0) {
            out.push(transfer_step(
                solvent,
                separator,
                *chunk,
                None,
                declared_port(ctx, separator, "top"),
                None,
            )?);
        }
        out.push(transfer_step(
            source,
            separator,
            Amount::All,
            None,
            declared_port(ctx, separator, "top"),
            None,
        )?);
        out.push(step!(StartStir {
            "vessel" => separator,
            "stir_speed" => cfg.stir_speed_rpm,
        })?);
        out.push(wait(cfg.stir_time_s)?);
        out.push(step!(StopStir { "vessel" => separator })?);
        out.push(wait(cfg.settle_time_s)?);

        let (lower, upper) = if product_bottom {
            (product_dest, waste_dest)
        } else {
            (waste_dest, product_dest)
        };
        out.push(step!(SeparatePhases {
            "separation_vessel" => separator,
            "lower_phase_vessel" => lower,
            "upper_phase_vessel" => upper,
        })?);
    }

    if n == 1 && from == to {
        out.push(transfer_step(product_dest, to, Amount::All, None, None, None)?);
    }
    Ok(out)
}

fn repeat(step: &Step) -> Result<Vec<Step>, PropertyError> {
    let times = step.count("repeats")?;
    let mut out = Vec::with_capacity(times * step.body().len());
    for _ in 0..times {
        out.extend(step.body().iter().cloned());
    }
    Ok(out)
}

fn clean_backbone(step: &Step) -> Result<Vec<Step>, PropertyError> {
    let solvent = bound_or(step, "solvent_vessel", step.req_text("solvent")?)?;
    let waste = bound_or(step, "waste_vessel", DEFAULT_WASTE)?;
    Ok(vec![transfer_step(
        solvent,
        waste,
        value(step, "volume")?,
        None,
        None,
        None,
    )?])
}

fn remove_dead_volume(step: &Step, ctx: ExpandCtx<'_>) -> Result<Vec<Step>, PropertyError> {
    let filter = step.req_text("filter_vessel")?;
    let waste = bound_or(step, "waste_vessel", DEFAULT_WASTE)?;
    Ok(vec![transfer_step(
        filter,
        waste,
        value(step, "dead_volume")?,
        declared_port(ctx, filter, "bottom"),
        None,
        None,
    )?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use proptest::prelude::*;
    use serde_json::json;

    fn names(steps: &[Step]) -> Vec<&'static str> {
        steps.iter().map(|s| s.name()).collect()
    }

    #[test]
    fn split_prefers_fewest_transfers() {
        assert_eq!(split_volume(300.0, 400.0), vec![300.0]);
        assert_eq!(split_volume(1000.0, 400.0).len(), 3);
        assert_eq!(split_volume(800.0, 400.0), vec![400.0, 400.0]);
    }

    proptest! {
        #[test]
        fn split_chunks_fit_and_sum(total in 0.1f64..10_000.0, capacity in 1.0f64..2_000.0) {
            let chunks = split_volume(total, capacity);
            prop_assert_eq!(chunks.len(), (total / capacity).ceil().max(1.0) as usize);
            prop_assert!(chunks.iter().all(|c| *c <= capacity + 1e-9));
            let sum: f64 = chunks.iter().sum();
            prop_assert!((sum - total).abs() < 1e-9 * total.max(1.0));
        }
    }

    #[test]
    fn heatchill_with_stirring_is_bracketed() {
        let cfg = CompilerConfig::default();
        let step = Step::new(
            StepKind::HeatChill,
            [
                ("vessel", json!("reactor")),
                ("temp", json!("60 °C")),
                ("time", json!("1 h")),
            ],
        )
        .unwrap();
        let children = step.expand(ExpandCtx::new(None, &cfg)).unwrap();
        assert_eq!(
            names(&children),
            vec!["StartStir", "SetTemp", "StartHeatChill", "Wait", "StopHeatChill", "StopStir"]
        );
        assert_eq!(children[3].req_number("time").unwrap(), 3600.0);
    }

    #[test]
    fn separate_splits_against_template_capacity() {
        let cfg = CompilerConfig::default();
        let step = Step::new(
            StepKind::Separate,
            [
                ("purpose", json!("extract")),
                ("product_phase", json!("top")),
                ("from_vessel", json!("reactor")),
                ("separation_vessel", json!("separator")),
                ("to_vessel", json!("flask_product")),
                ("solvent", json!("ether")),
                ("solvent_volume", json!("500 mL")),
            ],
        )
        .unwrap();
        let children = step.expand(ExpandCtx::new(None, &cfg)).unwrap();
        let phase_splits = children
            .iter()
            .filter(|s| s.kind == StepKind::SeparatePhases)
            .count();
        // 500 mL against the 200 mL template separator.
        assert_eq!(phase_splits, 3);
        assert_eq!(children[0].text("to_vessel").unwrap(), Some("buffer_flask_1"));
    }

    #[test]
    fn add_stirs_at_configured_speed_unless_given() {
        let cfg = CompilerConfig::from_yaml_str("transfer:\n  add_stir_speed_rpm: 400\n").unwrap();
        let ctx = ExpandCtx::new(None, &cfg);
        let add = |speed: Option<f64>| {
            let mut raw = vec![
                ("vessel", json!("reactor")),
                ("reagent", json!("water")),
                ("volume", json!(10)),
                ("stir", json!(true)),
            ];
            if let Some(rpm) = speed {
                raw.push(("stir_speed", json!(rpm)));
            }
            Step::new(StepKind::Add, raw).unwrap()
        };

        let children = add(None).expand(ctx).unwrap();
        assert_eq!(names(&children), vec!["StartStir", "Move"]);
        assert_eq!(children[0].number("stir_speed").unwrap(), Some(400.0));
        let children = add(Some(150.0)).expand(ctx).unwrap();
        assert_eq!(children[0].number("stir_speed").unwrap(), Some(150.0));
    }

    #[test]
    fn repeat_clones_its_body() {
        let cfg = CompilerConfig::default();
        let body = vec![Step::new(StepKind::Wait, [("time", json!(5))]).unwrap()];
        let step = Step::new(StepKind::Repeat, [("repeats", json!(3))])
            .unwrap()
            .with_body(body)
            .unwrap();
        assert_eq!(step.expand(ExpandCtx::new(None, &cfg)).unwrap().len(), 3);
    }
}
