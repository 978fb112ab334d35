mod common;

use common::{names, platform, platform_description, platform_without_solvents};
use labcompile::error::CompileError;
use labcompile::resolver::{BufferFlaskRequirement, Resolver};
use labcompile::step::schema::schema;
use labcompile::step::{Amount, PropType};
use labcompile::{
    compile, step, Apparatus, ApparatusKind, CompiledProcedure, CompilerConfig, GraphDescription, Procedure,
    Requirements, ResourceGraph, StepKind,
};

fn moves_between<'a>(compiled: &'a CompiledProcedure, from: &str, to: &str) -> Vec<&'a labcompile::Step> {
    compiled
        .base_steps()
        .into_iter()
        .filter(|s| s.kind == StepKind::Move)
        .filter(|s| s.text("from_vessel").unwrap() == Some(from) && s.text("to_vessel").unwrap() == Some(to))
        .collect()
}

fn separation(solvent_volume: f64) -> Procedure {
    Procedure::new()
        .reagent("ether")
        .vessel("reactor", ApparatusKind::Reactor)
        .vessel("separator", ApparatusKind::Separator)
        .vessel("product_flask", ApparatusKind::Flask)
        .step(
            step!(Separate {
                "purpose" => "extract",
                "product_phase" => "top",
                "from_vessel" => "reactor",
                "separation_vessel" => "separator",
                "to_vessel" => "product_flask",
                "solvent" => "ether",
                "solvent_volume" => solvent_volume,
            })
            .unwrap(),
        )
}

fn elution(to: &str, eluting_volume: f64, repeats: usize) -> Procedure {
    Procedure::new()
        .reagent("ether")
        .vessel("reactor", ApparatusKind::Reactor)
        .vessel(to, ApparatusKind::Flask)
        .step(
            step!(FilterThrough {
                "from_vessel" => "reactor",
                "to_vessel" => to,
                "through" => "celite",
                "eluting_solvent" => "ether",
                "eluting_volume" => eluting_volume,
                "eluting_repeats" => repeats,
            })
            .unwrap(),
        )
}

// ============================================================================
// Buffer flasks
// ============================================================================

#[test]
fn test_pass_through_needs_one_buffer_anchored_at_vessel() {
    let raw = r#"
reagents: []
hardware:
  - id: column_feed
    type: reactor
steps:
  - kind: FilterThrough
    from_vessel: column_feed
    to_vessel: column_feed
    through: celite
"#;
    let procedure = Procedure::from_yaml_str(raw).expect("Procedure should parse");
    let req = Requirements::template(&procedure, &CompilerConfig::default()).unwrap();
    assert_eq!(
        req.buffer_flasks,
        Some(BufferFlaskRequirement {
            count: 1,
            anchor: "column_feed".into()
        })
    );
}

#[test]
fn test_separation_buffer_count_follows_separator_capacity() {
    let graph = platform();
    let cfg = CompilerConfig::default();
    let procedure = separation(1000.0);

    let resolution = Resolver::new(&graph, &cfg).resolve(&procedure).expect("Should resolve");
    let buffers = resolution.requirements.buffer_flasks.expect("Buffers required");
    // 1000 mL against a 400 mL separator.
    assert_eq!(buffers.count, 3);
    assert_eq!(buffers.anchor, "reactor");
    assert_eq!(resolution.bindings.buffer_flasks, vec!["buffer_1", "buffer_2", "buffer_3"]);

    let compiled = compile(&procedure, &graph, &cfg).expect("Should compile");
    let phases = compiled
        .base_steps()
        .into_iter()
        .filter(|s| s.kind == StepKind::SeparatePhases)
        .count();
    assert_eq!(phases, 3);
}

#[test]
fn test_template_uses_default_separator_capacity() {
    // Template separator is 200 mL, so the same volume needs 5 buffers.
    let req = Requirements::template(&separation(1000.0), &CompilerConfig::default()).unwrap();
    assert_eq!(req.buffer_flasks.map(|b| b.count), Some(5));
}

// ============================================================================
// Capacities
// ============================================================================

#[test]
fn test_destination_overflow_is_fatal() {
    let mut desc = platform_description();
    if let Some(reactor) = desc.nodes.iter_mut().find(|n| n.id == "reactor") {
        reactor.current_volume = 100.0;
    }
    let graph = ResourceGraph::from_description(&desc).unwrap();

    // 100 + 2 x 300 mL of eluent into a 500 mL flask.
    let err = compile(&elution("product_flask", 300.0, 2), &graph, &CompilerConfig::default()).unwrap_err();
    match &err {
        CompileError::CapacityOverflow {
            vessel,
            volume,
            capacity,
            ..
        } => {
            assert_eq!(vessel, "product_flask");
            assert_eq!(*capacity, 500.0);
            assert!((volume - 700.0).abs() < 1e-6);
        }
        other => panic!("Expected CapacityOverflow, got {:?}", other),
    }
    assert!(err.is_graph_mismatch());
}

#[test]
fn test_source_overflow_is_split() {
    let graph = platform();
    let compiled = compile(&elution("collection_flask", 1500.0, 1), &graph, &CompilerConfig::default())
        .expect("Source overflow should be split, not rejected");

    let refills = moves_between(&compiled, "flask_ether", "reactor");
    assert_eq!(refills.len(), 2);
    let total: f64 = refills
        .iter()
        .map(|s| match s.amount("volume").unwrap() {
            Some(Amount::Ml(v)) => v,
            other => panic!("Unexpected amount {:?}", other),
        })
        .sum();
    assert!((total - 1500.0).abs() < 1e-9);
    assert!(refills
        .iter()
        .all(|s| s.number("volume").unwrap().unwrap() <= 1000.0));
}

// ============================================================================
// Determinism & binding
// ============================================================================

#[test]
fn test_compilation_is_deterministic() {
    let graph = platform();
    let cfg = CompilerConfig::default();
    let a = compile(&separation(1000.0), &graph, &cfg).unwrap();
    let b = compile(&separation(1000.0), &graph, &cfg).unwrap();
    assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
}

#[test]
fn test_every_vessel_is_bound_to_a_node() {
    let graph = platform();
    let compiled = compile(&separation(1000.0), &graph, &CompilerConfig::default()).unwrap();

    for step in compiled.base_steps() {
        for spec in schema(step.kind).iter().filter(|s| s.ty == PropType::Vessel) {
            if let Some(node) = step.text(spec.name).unwrap() {
                assert!(graph.contains(node), "{} {} = '{}' is not a node", step.name(), spec.name, node);
            }
        }
    }
}

#[test]
fn test_undeclared_reagent_is_a_declaration_error() {
    let procedure = Procedure::new().vessel("reactor", ApparatusKind::Reactor).step(
        step!(Add { "vessel" => "reactor", "reagent" => "water", "volume" => 10.0 }).unwrap(),
    );
    let err = compile(&procedure, &platform(), &CompilerConfig::default()).unwrap_err();
    assert!(matches!(err, CompileError::ReagentNotDeclared { index: 0, .. }));
    assert!(err.is_declaration());
}

#[test]
fn test_unknown_port_is_rejected() {
    let procedure = Procedure::new()
        .reagent("water")
        .vessel("filter", ApparatusKind::Filter)
        .step(
            step!(Add {
                "vessel" => "filter",
                "reagent" => "water",
                "volume" => 10.0,
                "port" => "side",
            })
            .unwrap(),
        );
    let err = compile(&procedure, &platform(), &CompilerConfig::default()).unwrap_err();
    match err {
        CompileError::InvalidPort { port, available, .. } => {
            assert_eq!(port, "side");
            assert_eq!(available, vec!["top", "bottom"]);
        }
        other => panic!("Expected InvalidPort, got {:?}", other),
    }
}

// ============================================================================
// Housekeeping
// ============================================================================

fn add_base() -> Procedure {
    Procedure::new()
        .reagent("NaOH")
        .vessel("reactor", ApparatusKind::Reactor)
        .step(step!(Add { "vessel" => "reactor", "reagent" => "NaOH", "volume" => 10.0 }).unwrap())
}

#[test]
fn test_base_gets_extra_backbone_cleans() {
    let compiled = compile(&add_base(), &platform(), &CompilerConfig::default()).unwrap();
    assert_eq!(moves_between(&compiled, "flask_naoh", "reactor").len(), 1);
    assert_eq!(moves_between(&compiled, "flask_water", "waste").len(), 4);
}

#[test]
fn test_clean_count_is_policy() {
    let cfg = CompilerConfig::from_yaml_str("cleaning:\n  extra_base_cleans: 0\n").unwrap();
    let compiled = compile(&add_base(), &platform(), &cfg).unwrap();
    assert_eq!(moves_between(&compiled, "flask_water", "waste").len(), 1);
}

#[test]
fn test_missing_solvent_for_mandatory_clean() {
    let err = compile(&add_base(), &platform_without_solvents(), &CompilerConfig::default()).unwrap_err();
    assert_eq!(
        err,
        CompileError::NoSolvents {
            index: 0,
            reagent: "NaOH".into()
        }
    );
    assert!(err.is_resource_shortage());
    assert!(!err.is_declaration());
}

#[test]
fn test_no_clean_after_adding_a_solvent() {
    let procedure = Procedure::new()
        .reagent("water")
        .vessel("reactor", ApparatusKind::Reactor)
        .step(step!(Add { "vessel" => "reactor", "reagent" => "water", "volume" => 10.0 }).unwrap());
    let compiled = compile(&procedure, &platform(), &CompilerConfig::default()).unwrap();
    assert_eq!(compiled.len(), 1);
}

fn with_reactive_flasks(desc: GraphDescription) -> GraphDescription {
    let flask = |id: &str, chemical: &str| {
        Apparatus::new(id, ApparatusKind::Flask)
            .chemical(chemical)
            .capacity(100.0)
            .current_volume(100.0)
    };
    desc.node(flask("flask_nah", "NaH"))
        .connect("valve", "flask_nah")
        .node(flask("flask_aldehyde", "benzaldehyde"))
        .connect("valve", "flask_aldehyde")
}

fn nah_then_aldehyde() -> Procedure {
    Procedure::new()
        .reagent("NaH")
        .reagent("benzaldehyde")
        .vessel("reactor", ApparatusKind::Reactor)
        .step(step!(Add { "vessel" => "reactor", "reagent" => "NaH", "volume" => 5.0 }).unwrap())
        .step(step!(Add { "vessel" => "reactor", "reagent" => "benzaldehyde", "volume" => 5.0 }).unwrap())
}

#[test]
fn test_skipped_clean_leaves_residue_that_blocks_later_solvents() {
    let mut desc = platform_description();
    desc.nodes.retain(|n| n.id != "flask_ether");
    desc.links.retain(|l| l.source != "flask_ether" && l.target != "flask_ether");
    let graph = ResourceGraph::from_description(&with_reactive_flasks(desc)).unwrap();
    let compiled = compile(&nah_then_aldehyde(), &graph, &CompilerConfig::default()).unwrap();

    // Water is the only solvent and it is banned next to NaH, which is still
    // in the line when the aldehyde clean comes up.
    assert!(moves_between(&compiled, "flask_water", "waste").is_empty());
    assert_eq!(moves_between(&compiled, "flask_aldehyde", "reactor").len(), 1);
}

#[test]
fn test_clean_clears_residue() {
    let cfg = CompilerConfig::from_yaml_str(
        "cleaning:\n  incompatible:\n    nah: [water]\n    benzaldehyde: [ether]\n",
    )
    .unwrap();
    let graph = ResourceGraph::from_description(&with_reactive_flasks(platform_description())).unwrap();
    let compiled = compile(&nah_then_aldehyde(), &graph, &cfg).unwrap();

    // Ether flushes the NaH out, so water is fine after the aldehyde.
    assert_eq!(moves_between(&compiled, "flask_ether", "waste").len(), 1);
    assert_eq!(moves_between(&compiled, "flask_water", "waste").len(), 1);
}

#[test]
fn test_dead_volume_removed_once_per_filtration_run() {
    let filter = || step!(Filter { "filter_vessel" => "filter" }).unwrap();
    let procedure = Procedure::new()
        .vessel("filter", ApparatusKind::Filter)
        .vessel("reactor", ApparatusKind::Reactor)
        .step(filter())
        .step(filter())
        .step(step!(Stir { "vessel" => "reactor", "time" => 60.0 }).unwrap())
        .step(filter());
    let compiled = compile(&procedure, &platform(), &CompilerConfig::default()).unwrap();

    let removals: Vec<_> = compiled
        .steps
        .iter()
        .filter(|e| e.step.kind == StepKind::Move)
        .filter(|e| e.step.amount("volume").unwrap() == Some(Amount::Ml(2.0)))
        .collect();
    let origins: Vec<usize> = removals.iter().map(|e| e.origin).collect();
    assert_eq!(origins, vec![0, 3]);
    for removal in removals {
        assert_eq!(removal.step.text("from_port").unwrap(), Some("bottom"));
        assert_eq!(removal.step.text("to_vessel").unwrap(), Some("waste"));
    }
}

#[test]
fn test_stirring_stops_before_draining() {
    let procedure = Procedure::new()
        .vessel("reactor", ApparatusKind::Reactor)
        .vessel("product_flask", ApparatusKind::Flask)
        .step(step!(HeatChillToTemp { "vessel" => "reactor", "temp" => 40.0 }).unwrap())
        .step(
            step!(Transfer {
                "from_vessel" => "reactor",
                "to_vessel" => "product_flask",
                "volume" => "all",
            })
            .unwrap(),
        );
    let compiled = compile(&procedure, &platform(), &CompilerConfig::default()).unwrap();
    assert_eq!(
        names(&compiled.base_steps()),
        vec!["StartStir", "SetTemp", "StartHeatChill", "StopStir", "Move", "StopHeatChill"]
    );
}

// ============================================================================
// Dynamic & async steps
// ============================================================================

#[test]
fn test_dynamic_and_async_survive_flattening() {
    let background = step!(Async { "pid" => "bg" })
        .unwrap()
        .with_body(vec![step!(Stir { "vessel" => "reactor", "time" => 30.0 }).unwrap()])
        .unwrap();
    let procedure = Procedure::new()
        .vessel("reactor", ApparatusKind::Reactor)
        .step(background)
        .step(step!(PurgeUntilStable { "vessel" => "reactor" }).unwrap())
        .step(step!(AwaitAsync { "pid" => "bg" }).unwrap());
    let compiled = compile(&procedure, &platform(), &CompilerConfig::default()).unwrap();

    let kinds: Vec<StepKind> = compiled.steps.iter().map(|e| e.step.kind).collect();
    assert_eq!(kinds, vec![StepKind::Async, StepKind::PurgeUntilStable, StepKind::AwaitAsync]);
    let body: Vec<&labcompile::Step> = compiled.steps[0].step.body().iter().collect();
    assert_eq!(names(&body), vec!["StartStir", "Wait", "StopStir"]);
}

// ============================================================================
// Artifacts
// ============================================================================

#[test]
fn test_artifact_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("separation.json");
    let compiled = compile(&separation(1000.0), &platform(), &CompilerConfig::default()).unwrap();

    let fingerprint = compiled.save(&path).expect("Artifact should save");
    let loaded = CompiledProcedure::load_verified(&path, &fingerprint).expect("Fingerprint should match");
    assert_eq!(loaded, compiled);
    assert!(CompiledProcedure::load_verified(&path, "0000").is_err());
}

#[test]
fn test_graph_and_procedure_load_from_files() {
    let dir = tempfile::tempdir().unwrap();
    let graph_path = dir.path().join("platform.json");
    let procedure_path = dir.path().join("procedure.yaml");
    std::fs::write(&graph_path, platform_description().to_json().unwrap()).unwrap();
    std::fs::write(
        &procedure_path,
        r#"
reagents:
  - id: solvent
    chemical: Water
hardware:
  - id: main
    type: reactor
    node: reactor
steps:
  - kind: Add
    vessel: main
    reagent: solvent
    volume: 25 mL
    stir: true
  - kind: Stir
    vessel: main
    time: 2 min
"#,
    )
    .unwrap();

    let graph = ResourceGraph::load(&graph_path).expect("Graph should load");
    let procedure = Procedure::load(&procedure_path).expect("Procedure should load");
    let compiled = compile(&procedure, &graph, &CompilerConfig::default()).expect("Should compile");

    assert_eq!(compiled.bindings.vessel("main"), Some("reactor"));
    assert_eq!(compiled.bindings.reagent_flask("solvent"), Some("flask_water"));
    let transfer = moves_between(&compiled, "flask_water", "reactor");
    assert_eq!(transfer.len(), 1);
    assert_eq!(transfer[0].number("estimated_volume").unwrap(), Some(25.0));
}
