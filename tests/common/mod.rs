#![allow(dead_code)]

use labcompile::{Apparatus, ApparatusKind, GraphDescription, ResourceGraph, Step};

/// Bench platform: every unit hangs off one backbone valve.
pub fn platform_description() -> GraphDescription {
    use ApparatusKind::*;

    let nodes = vec![
        Apparatus::new("reactor", Reactor)
            .capacity(1000.0)
            .stirrer()
            .heater()
            .chiller()
            .temp_range(-20.0, 150.0),
        Apparatus::new("separator", Separator)
            .capacity(400.0)
            .ports(&["top", "bottom"])
            .stirrer(),
        Apparatus::new("filter", Filter)
            .capacity(200.0)
            .dead_volume(2.0)
            .ports(&["top", "bottom"]),
        Apparatus::new("product_flask", Flask).capacity(500.0),
        Apparatus::new("collection_flask", Flask).capacity(5000.0),
        Apparatus::new("flask_water", Flask)
            .chemical("water")
            .capacity(2000.0)
            .current_volume(2000.0),
        Apparatus::new("flask_ether", Flask)
            .chemical("ether")
            .capacity(5000.0)
            .current_volume(5000.0),
        Apparatus::new("flask_naoh", Flask)
            .chemical("NaOH")
            .capacity(500.0)
            .current_volume(500.0),
        Apparatus::new("buffer_1", Flask).capacity(1000.0),
        Apparatus::new("buffer_2", Flask).capacity(1000.0),
        Apparatus::new("buffer_3", Flask).capacity(1000.0),
        Apparatus::new("cartridge_celite", Cartridge).chemical("celite"),
        Apparatus::new("waste", Waste),
    ];

    let mut desc = GraphDescription::default().node(Apparatus::new("valve", Valve));
    for node in nodes {
        let id = node.id.clone();
        desc = desc.node(node).connect("valve", &id);
    }
    desc
}

pub fn platform() -> ResourceGraph {
    ResourceGraph::from_description(&platform_description()).expect("Bench platform should be valid")
}

/// Same platform without any cleaning solvent on it.
pub fn platform_without_solvents() -> ResourceGraph {
    let mut desc = platform_description();
    let solvents = ["flask_water", "flask_ether"];
    desc.nodes.retain(|n| !solvents.contains(&n.id.as_str()));
    desc.links
        .retain(|l| !solvents.contains(&l.source.as_str()) && !solvents.contains(&l.target.as_str()));
    ResourceGraph::from_description(&desc).expect("Trimmed platform should be valid")
}

pub fn names(steps: &[&Step]) -> Vec<&'static str> {
    steps.iter().map(|s| s.name()).collect()
}
