// src/graph.rs
//
// =============================================================================
// LABCOMPILE: RESOURCE GRAPH (v 0.3)
// =============================================================================
//
// The Apparatus Map.
//
// Responsibilities:
// 1. Load the node-link description of a platform (vessels, flasks, valves,
//    pumps, cartridges) and validate it.
// 2. Answer routing questions: is there a liquid path from A to B, which
//    valves/pumps does it cross, which waste/empty flask is nearest.
// 3. Stay immutable: one graph is shared read-only for a whole compilation
//    and by the Parallelizer afterwards.

use crate::config::normalise;
use crate::error::GraphError;
use anyhow::{Context, Result};
use petgraph::algo::{astar, dijkstra};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::NodeFiltered;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

// ============================================================================
// 1. DESCRIPTION (what gets loaded)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApparatusKind {
    Reactor,
    Separator,
    Filter,
    Flask,
    Waste,
    Cartridge,
    Valve,
    Pump,
    Rotavap,
}

impl ApparatusKind {
    /// Nodes that hold liquid.
    pub fn is_vessel(&self) -> bool {
        matches!(
            self,
            ApparatusKind::Reactor
                | ApparatusKind::Separator
                | ApparatusKind::Filter
                | ApparatusKind::Flask
                | ApparatusKind::Waste
                | ApparatusKind::Rotavap
        )
    }

    /// Nodes liquid may pass through on its way somewhere else.
    pub fn is_conduit(&self) -> bool {
        matches!(self, ApparatusKind::Valve | ApparatusKind::Pump)
    }
}

/// One apparatus unit with its attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Apparatus {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ApparatusKind,
    /// Maximum volume, mL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<f64>,
    #[serde(default)]
    pub current_volume: f64,
    /// Liquid trapped below a filter frit, mL.
    #[serde(default)]
    pub dead_volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chemical: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default)]
    pub heater: bool,
    #[serde(default)]
    pub chiller: bool,
    #[serde(default)]
    pub stirrer: bool,
    #[serde(default)]
    pub vacuum: bool,
    #[serde(default)]
    pub inert_gas: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_temp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_temp: Option<f64>,
}

impl Apparatus {
    pub fn new(id: impl Into<String>, kind: ApparatusKind) -> Self {
        Self {
            id: id.into(),
            kind,
            capacity: None,
            current_volume: 0.0,
            dead_volume: 0.0,
            chemical: None,
            ports: Vec::new(),
            heater: false,
            chiller: false,
            stirrer: false,
            vacuum: false,
            inert_gas: false,
            min_temp: None,
            max_temp: None,
        }
    }

    pub fn capacity(mut self, ml: f64) -> Self {
        self.capacity = Some(ml);
        self
    }

    pub fn current_volume(mut self, ml: f64) -> Self {
        self.current_volume = ml;
        self
    }

    pub fn dead_volume(mut self, ml: f64) -> Self {
        self.dead_volume = ml;
        self
    }

    pub fn chemical(mut self, chemical: impl Into<String>) -> Self {
        self.chemical = Some(chemical.into());
        self
    }

    pub fn ports(mut self, ports: &[&str]) -> Self {
        self.ports = ports.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn heater(mut self) -> Self {
        self.heater = true;
        self
    }

    pub fn chiller(mut self) -> Self {
        self.chiller = true;
        self
    }

    pub fn stirrer(mut self) -> Self {
        self.stirrer = true;
        self
    }

    pub fn vacuum(mut self) -> Self {
        self.vacuum = true;
        self
    }

    pub fn temp_range(mut self, min: f64, max: f64) -> Self {
        self.min_temp = Some(min);
        self.max_temp = Some(max);
        self
    }

    pub fn has_temperature_control(&self) -> bool {
        self.heater || self.chiller
    }

    /// An empty flask: no chemical assigned, usable as transient storage.
    pub fn is_empty_flask(&self) -> bool {
        self.kind == ApparatusKind::Flask && self.chemical.is_none()
    }

    pub fn holds(&self, chemical: &str) -> bool {
        self.chemical
            .as_deref()
            .map(|c| normalise(c) == normalise(chemical))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub source: String,
    pub target: String,
}

/// Node-link document, as stored next to a platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDescription {
    pub nodes: Vec<Apparatus>,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl GraphDescription {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read graph description: {:?}", path))?;
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse graph JSON: {:?}", path))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn node(mut self, apparatus: Apparatus) -> Self {
        self.nodes.push(apparatus);
        self
    }

    /// One-way tubing.
    pub fn link(mut self, source: &str, target: &str) -> Self {
        self.links.push(Link {
            source: source.to_string(),
            target: target.to_string(),
        });
        self
    }

    /// Tubing usable in both directions.
    pub fn connect(self, a: &str, b: &str) -> Self {
        self.link(a, b).link(b, a)
    }
}

// ============================================================================
// 2. THE GRAPH
// ============================================================================

#[derive(Debug, Clone)]
pub struct ResourceGraph {
    graph: DiGraph<Apparatus, ()>,
    index: BTreeMap<String, NodeIndex>,
}

impl ResourceGraph {
    pub fn from_description(desc: &GraphDescription) -> Result<Self, GraphError> {
        let mut graph = DiGraph::new();
        let mut index = BTreeMap::new();

        for node in &desc.nodes {
            validate_node(node)?;
            if index.contains_key(&node.id) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
            let idx = graph.add_node(node.clone());
            index.insert(node.id.clone(), idx);
        }

        for link in &desc.links {
            let a = *index
                .get(&link.source)
                .ok_or_else(|| GraphError::UnknownNode(link.source.clone()))?;
            let b = *index
                .get(&link.target)
                .ok_or_else(|| GraphError::UnknownNode(link.target.clone()))?;
            graph.update_edge(a, b, ());
        }

        log::debug!(
            "Resource graph loaded: {} nodes, {} links",
            graph.node_count(),
            graph.edge_count()
        );

        Ok(Self { graph, index })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let desc = GraphDescription::load(path)?;
        Ok(Self::from_description(&desc)?)
    }

    pub fn node(&self, id: &str) -> Option<&Apparatus> {
        self.index.get(id).map(|idx| &self.graph[*idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Apparatus> {
        self.index.values().map(|idx| &self.graph[*idx])
    }

    pub fn nodes_of_kind(&self, kind: ApparatusKind) -> Vec<&Apparatus> {
        self.nodes().filter(|n| n.kind == kind).collect()
    }

    /// First flask (by id) holding `chemical`.
    pub fn flask_for(&self, chemical: &str) -> Option<&Apparatus> {
        self.nodes()
            .find(|n| n.kind == ApparatusKind::Flask && n.holds(chemical))
    }

    pub fn cartridges_for(&self, chemical: &str) -> Vec<&Apparatus> {
        self.nodes()
            .filter(|n| n.kind == ApparatusKind::Cartridge && n.holds(chemical))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    /// Shortest liquid path `from -> to` crossing only valves and pumps.
    /// Returns node ids including both endpoints.
    pub fn route(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let start = *self.index.get(from)?;
        let goal = *self.index.get(to)?;
        if start == goal {
            return Some(vec![from.to_string()]);
        }

        let g = &self.graph;
        let filtered =
            NodeFiltered::from_fn(g, |n: NodeIndex| n == start || n == goal || g[n].kind.is_conduit());
        let (_, path) = astar(&filtered, start, |n| n == goal, |_| 1usize, |_| 0usize)?;
        Some(path.into_iter().map(|idx| g[idx].id.clone()).collect())
    }

    /// Path `from -> via -> to`, e.g. through a cartridge.
    pub fn route_via(&self, from: &str, via: &str, to: &str) -> Option<Vec<String>> {
        let mut first = self.route(from, via)?;
        let second = self.route(via, to)?;
        first.extend(second.into_iter().skip(1));
        Some(first)
    }

    /// Nodes a transfer holds while it runs: endpoints plus every conduit on
    /// the route. Falls back to the endpoints when no route exists.
    pub fn transfer_nodes(&self, from: &str, to: &str, through: Option<&str>) -> Vec<String> {
        let path = match through {
            Some(via) => self.route_via(from, via, to),
            None => self.route(from, to),
        };
        let mut nodes = path.unwrap_or_else(|| {
            let mut v = vec![from.to_string(), to.to_string()];
            v.extend(through.map(str::to_string));
            v
        });
        nodes.sort();
        nodes.dedup();
        nodes
    }

    /// Nearest node (hop count, then id) reachable from `from` that satisfies
    /// `pred`.
    pub fn nearest_from<F>(&self, from: &str, pred: F) -> Option<&Apparatus>
    where
        F: Fn(&Apparatus) -> bool,
    {
        let start = *self.index.get(from)?;
        let g = &self.graph;
        let filtered = NodeFiltered::from_fn(g, |n: NodeIndex| {
            n == start || g[n].kind.is_conduit() || pred(&g[n])
        });
        let distances = dijkstra(&filtered, start, None, |_| 1usize);

        distances
            .into_iter()
            .filter(|(idx, _)| *idx != start && pred(&g[*idx]))
            .map(|(idx, d)| (d, &g[idx]))
            .min_by(|(da, a), (db, b)| da.cmp(db).then_with(|| a.id.cmp(&b.id)))
            .map(|(_, node)| node)
    }

    /// The `count` empty flasks closest to `anchor`, excluding `taken`.
    pub fn nearest_empty_flasks(&self, anchor: &str, count: usize, taken: &[String]) -> Vec<String> {
        let start = match self.index.get(anchor) {
            Some(idx) => *idx,
            None => return Vec::new(),
        };
        let g = &self.graph;
        let usable = |n: &Apparatus| n.is_empty_flask() && !taken.contains(&n.id);
        let filtered = NodeFiltered::from_fn(g, |n: NodeIndex| {
            n == start || g[n].kind.is_conduit() || usable(&g[n])
        });
        let mut found: Vec<(usize, String)> = dijkstra(&filtered, start, None, |_| 1usize)
            .into_iter()
            .filter(|(idx, _)| *idx != start && usable(&g[*idx]))
            .map(|(idx, d)| (d, g[idx].id.clone()))
            .collect();
        found.sort();
        found.into_iter().take(count).map(|(_, id)| id).collect()
    }

    /// Nearest waste reachable from `from`.
    pub fn nearest_waste(&self, from: &str) -> Option<&Apparatus> {
        self.nearest_from(from, |n| n.kind == ApparatusKind::Waste)
    }
}

fn validate_node(node: &Apparatus) -> Result<(), GraphError> {
    let invalid = |reason: String| GraphError::InvalidAttribute {
        node: node.id.clone(),
        reason,
    };
    if node.id.trim().is_empty() {
        return Err(invalid("empty id".into()));
    }
    if let Some(cap) = node.capacity {
        if !(cap > 0.0) {
            return Err(invalid(format!("capacity must be positive, got {}", cap)));
        }
        if node.current_volume > cap {
            return Err(invalid(format!(
                "current volume {} exceeds capacity {}",
                node.current_volume, cap
            )));
        }
        if node.dead_volume > cap {
            return Err(invalid(format!(
                "dead volume {} exceeds capacity {}",
                node.dead_volume, cap
            )));
        }
    }
    if node.current_volume < 0.0 || node.dead_volume < 0.0 {
        return Err(invalid("volumes must not be negative".into()));
    }
    if let (Some(min), Some(max)) = (node.min_temp, node.max_temp) {
        if min > max {
            return Err(invalid(format!("min_temp {} above max_temp {}", min, max)));
        }
    }
    Ok(())
}
