//! CLI entry point for the taskmesh orchestrator.
//!
//! Connects to the bus, spawns (by default) a set of simulated
//! capability workers so the run is self-contained, plans the task set,
//! and drives the orchestrator to completion.  Exits non-zero when the
//! bus connection fails.

mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::info;

use taskmesh_kernel::MemoryBus;
use taskmesh_orchestrator::{
    KeywordPlanner, LlmPlanner, Orchestrator, OrchestratorConfig, Planner, RawTask,
};
use taskmesh_sync::Context;

use crate::worker::SimWorker;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Meta-orchestrator for a distributed multi-agent task system.
#[derive(Debug, Parser)]
#[command(name = "taskmesh", version, about)]
struct Cli {
    /// JSON task file: `[{"id": 1, "content": "..."}]`.  Uses a built-in
    /// demo set when omitted.
    #[arg(long)]
    tasks: Option<PathBuf>,

    /// Bus endpoint (overrides BUS_URL).
    #[arg(long)]
    bus_url: Option<String>,

    /// Do not spawn in-process simulated workers; expect external
    /// workers to register.
    #[arg(long)]
    no_sim_workers: bool,

    /// Log filter (overrides RUST_LOG), e.g. `info` or `taskmesh=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (silently ignore if missing).
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut config = OrchestratorConfig::from_env();
    if let Some(bus_url) = cli.bus_url {
        config.bus_url = bus_url;
    }

    let bus = Arc::new(
        MemoryBus::connect(&config.bus_url)
            .with_context(|| format!("failed to connect to bus at {}", config.bus_url))?,
    );
    info!(bus_url = %config.bus_url, "bus connected");

    let planner: Arc<dyn Planner> = match &config.planner {
        Some(planner_config) => {
            info!(model = %planner_config.model, "using LLM planner");
            Arc::new(LlmPlanner::new(planner_config.clone()).context("failed to build planner")?)
        }
        None => {
            info!("PLANNER_API_KEY not set, using offline keyword planner");
            Arc::new(KeywordPlanner)
        }
    };

    if !cli.no_sim_workers {
        spawn_sim_workers(bus.clone()).await?;
    }

    let tasks = match &cli.tasks {
        Some(path) => load_tasks(path)?,
        None => demo_tasks(),
    };
    info!(count = tasks.len(), "task set loaded");

    let orchestrator = Orchestrator::new(bus, planner, config);
    let tracker = orchestrator.tracker().clone();
    orchestrator.run(tasks).await?;

    for task_id in tracker.task_ids() {
        if let Some(snapshot) = tracker.get(task_id) {
            println!("task {task_id}: {}", snapshot.source);
            for (stage, result) in snapshot.results.iter().enumerate() {
                println!("  stage {stage}: {result}");
            }
        }
    }
    info!("run complete");
    Ok(())
}

fn init_tracing(filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Read a task file, seeding a demo context for tasks that carry none.
fn load_tasks(path: &PathBuf) -> Result<Vec<RawTask>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read task file {}", path.display()))?;
    let mut tasks: Vec<RawTask> =
        serde_json::from_str(&raw).context("task file is not a JSON task array")?;
    for task in &mut tasks {
        if task.context.is_empty() {
            task.context = demo_context(task.id);
        }
    }
    Ok(tasks)
}

/// Built-in demo tasks exercising each capability.
fn demo_tasks() -> Vec<RawTask> {
    let contents = [
        "Write a short essay on the history of artificial intelligence and summarise its future trends.",
        "Calculate the 20th Fibonacci number and explain the computation.",
        "Polish the grammar of the following paragraph and summarise its main point: Artificial intelligence is transforming industries worldwide.",
        "Analyse the impact of climate change on agriculture, then polish the analysis into a short report.",
        "Write an introduction to blockchain technology and summarise its financial applications.",
    ];
    contents
        .iter()
        .enumerate()
        .map(|(index, content)| {
            let id = index as u64 + 1;
            RawTask {
                id,
                content: content.to_string(),
                context: demo_context(id),
            }
        })
        .collect()
}

/// Two seed documents per task, mirroring a real per-task corpus.
fn demo_context(task_id: u64) -> Context {
    let mut context = Context::new();
    context.insert(
        format!("doc_{task_id}_1"),
        format!("This is the first document for task {task_id}.").into_bytes(),
    );
    context.insert(
        format!("doc_{task_id}_2"),
        format!("This is the second document for task {task_id}.").into_bytes(),
    );
    context
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// One specialist per capability plus a generalist, matching the agent
/// population the orchestrator is normally deployed against.
async fn spawn_sim_workers(bus: Arc<MemoryBus>) -> Result<()> {
    let roster: [(&str, &str); 5] = [
        ("gen-1", "text-generation"),
        ("math-1", "math-reasoning"),
        ("polish-1", "grammar-polish"),
        ("summary-1", "analysis-summary"),
        (
            "poly-1",
            "text-generation,math-reasoning,grammar-polish,analysis-summary",
        ),
    ];
    for (id, capabilities) in roster {
        SimWorker::new(bus.clone(), id, capabilities).spawn().await?;
    }
    info!(workers = roster.len(), "simulated workers online");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_tasks_have_unique_ids_and_contexts() {
        let tasks = demo_tasks();
        let mut ids: Vec<u64> = tasks.iter().map(|t| t.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), tasks.len());
        for task in &tasks {
            assert_eq!(task.context.len(), 2);
        }
    }

    #[test]
    fn task_file_parses_and_seeds_context() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id": 10, "content": "do a thing"}}, {{"id": 11, "content": "another"}}]"#
        )
        .unwrap();

        let tasks = load_tasks(&file.path().to_path_buf()).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, 10);
        assert!(tasks[0].context.contains_key("doc_10_1"));
    }

    #[test]
    fn malformed_task_file_is_an_error() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(load_tasks(&file.path().to_path_buf()).is_err());
    }
}
