// src/main.rs
//
// =============================================================================
// LABCOMPILE: COMMANDER & ENTRY POINT (v 0.3)
// =============================================================================
//
// Thin CLI over the library.
//
// Modes:
// 1. REQUIREMENTS: What a procedure needs (template, or bound to a graph).
// 2. COMPILE:      Procedure + graph -> compiled artifact (JSON, fingerprinted).
// 3. SCHEDULE:     Several procedures on one graph -> interleaved schedule.
// 4. SIMULATE:     Run procedures (or a saved artifact) on the simulated
//                  backend and print the execution trace.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use labcompile::resolver::Resolver;
use labcompile::{
    CompiledProcedure, CompilerConfig, Executor, Parallelizer, Procedure, Requirements, ResourceGraph,
    Runtime, ScheduleRunner, SimulatedBackend,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(
    name = "labcompile",
    version,
    about = "Procedure compiler and resource-lock scheduler for automated chemistry"
)]
struct Cli {
    /// Compiler config (YAML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the hardware a procedure needs.
    Requirements {
        /// Procedure source (YAML).
        procedure: PathBuf,

        /// Resolve against this graph (JSON) instead of the template.
        #[arg(long)]
        graph: Option<PathBuf>,

        /// Write a skeleton graph satisfying the template requirements.
        #[arg(long)]
        emit_graph: Option<PathBuf>,
    },

    /// Compile one procedure against a graph.
    Compile {
        procedure: PathBuf,

        #[arg(long)]
        graph: PathBuf,

        /// Save the compiled artifact here instead of printing it.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Interleave several procedures on one graph.
    Schedule {
        #[arg(required = true, num_args = 1..)]
        procedures: Vec<PathBuf>,

        #[arg(long)]
        graph: PathBuf,
    },

    /// Execute on the simulated backend and print the trace.
    Simulate {
        #[arg(num_args = 0..)]
        procedures: Vec<PathBuf>,

        #[arg(long)]
        graph: Option<PathBuf>,

        /// Run a saved artifact instead of compiling.
        #[arg(long, conflicts_with = "procedures")]
        artifact: Option<PathBuf>,

        /// Expected artifact fingerprint.
        #[arg(long, requires = "artifact")]
        fingerprint: Option<String>,

        /// Scripted sensor readings: node:quantity=v1,v2,...
        #[arg(long = "sensor")]
        sensors: Vec<String>,
    },
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match &cli.config {
        Some(path) => CompilerConfig::load(path)?,
        None => CompilerConfig::default(),
    };

    match cli.command {
        Commands::Requirements {
            procedure,
            graph,
            emit_graph,
        } => run_requirements(&procedure, graph.as_deref(), emit_graph.as_deref(), &config),
        Commands::Compile {
            procedure,
            graph,
            output,
        } => run_compile(&procedure, &graph, output.as_deref(), &config),
        Commands::Schedule { procedures, graph } => run_schedule(&procedures, &graph, &config),
        Commands::Simulate {
            procedures,
            graph,
            artifact,
            fingerprint,
            sensors,
        } => {
            let backend = scripted_backend(&sensors)?;
            match artifact {
                Some(path) => run_artifact(&path, fingerprint.as_deref(), backend).await,
                None => {
                    let graph = graph.ok_or_else(|| anyhow!("--graph is required when simulating procedures"))?;
                    run_simulation(&procedures, &graph, &config, backend).await
                }
            }
        }
    }
}

// ============================================================================
// 3. COMMANDS
// ============================================================================

fn run_requirements(
    procedure: &Path,
    graph: Option<&Path>,
    emit_graph: Option<&Path>,
    config: &CompilerConfig,
) -> Result<()> {
    let procedure = Procedure::load(procedure)?;
    let template = Requirements::template(&procedure, config)?;

    if let Some(path) = emit_graph {
        let desc = template.template_graph(&procedure, config);
        fs::write(path, desc.to_json()?).with_context(|| format!("Failed to write graph: {:?}", path))?;
        log::info!("Template graph written to {:?}", path);
    }

    let json = match graph {
        Some(path) => {
            let graph = ResourceGraph::load(path)?;
            let resolution = Resolver::new(&graph, config).resolve(&procedure)?;
            serde_json::to_string_pretty(&resolution)?
        }
        None => serde_json::to_string_pretty(&template)?,
    };
    println!("{}", json);
    Ok(())
}

fn run_compile(procedure: &Path, graph: &Path, output: Option<&Path>, config: &CompilerConfig) -> Result<()> {
    let procedure = Procedure::load(procedure)?;
    let graph = ResourceGraph::load(graph)?;
    let compiled = Executor::new(&graph, config).compile(&procedure)?;

    match output {
        Some(path) => {
            let fingerprint = compiled.save(path)?;
            log::info!("Artifact saved to {:?}", path);
            println!("{}", fingerprint);
        }
        None => println!("{}", compiled.to_json()?),
    }
    Ok(())
}

fn run_schedule(procedures: &[PathBuf], graph: &Path, config: &CompilerConfig) -> Result<()> {
    let procedures = load_all(procedures)?;
    let graph = ResourceGraph::load(graph)?;
    let (_, schedule) = Parallelizer::new(&graph, config).compile_and_schedule(&procedures)?;
    schedule.verify_lock_safety()?;
    println!("{}", serde_json::to_string_pretty(&schedule)?);
    Ok(())
}

async fn run_artifact(path: &Path, fingerprint: Option<&str>, backend: SimulatedBackend) -> Result<()> {
    let compiled = match fingerprint {
        Some(expected) => CompiledProcedure::load_verified(path, expected)?,
        None => CompiledProcedure::load(path)?,
    };
    let runtime = Runtime::new(Arc::new(backend));
    runtime.execute(&compiled).await?;
    print_trace(&runtime)
}

async fn run_simulation(
    procedures: &[PathBuf],
    graph: &Path,
    config: &CompilerConfig,
    backend: SimulatedBackend,
) -> Result<()> {
    let procedures = load_all(procedures)?;
    let graph = ResourceGraph::load(graph)?;
    let runtime = Runtime::new(Arc::new(backend))
        .with_completion_hook(|pid| log::info!("Async '{}' completed", pid));

    match procedures.as_slice() {
        [] => return Err(anyhow!("Nothing to simulate: pass procedures or --artifact")),
        [single] => {
            let compiled = Executor::new(&graph, config).compile(single)?;
            runtime.execute(&compiled).await?;
        }
        many => {
            let (_, schedule) = Parallelizer::new(&graph, config).compile_and_schedule(many)?;
            ScheduleRunner::new(runtime.clone()).run(&schedule).await?;
        }
    }
    print_trace(&runtime)
}

// ============================================================================
// 4. HELPERS
// ============================================================================

fn load_all(paths: &[PathBuf]) -> Result<Vec<Procedure>> {
    paths
        .iter()
        .map(|p| Procedure::load(p).with_context(|| format!("in procedure {:?}", p)))
        .collect()
}

fn print_trace(runtime: &Runtime) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&runtime.trace().entries())?);
    Ok(())
}

/// Parses `node:quantity=v1,v2,...` into scripted readings.
fn scripted_backend(specs: &[String]) -> Result<SimulatedBackend> {
    let mut backend = SimulatedBackend::new();
    for spec in specs {
        let (target, values) = spec
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid --sensor '{}': expected node:quantity=v1,v2", spec))?;
        let (node, quantity) = target
            .split_once(':')
            .ok_or_else(|| anyhow!("Invalid --sensor '{}': expected node:quantity", spec))?;
        let values = values
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Invalid reading in --sensor '{}'", spec))?;
        backend = backend.with_readings(node, quantity, values);
    }
    Ok(backend)
}
