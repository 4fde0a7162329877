use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use flowgate::engine::{InvocationOutcome, ScriptResult};
use flowgate::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flowgate")]
#[command(about = "Run phase-ordered batch workflows", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a batch, one flow of it, or one phase of a flow
    Run {
        /// Engine profile file
        #[arg(short, long, value_name = "FILE")]
        profile: PathBuf,

        /// Compiled graph store file
        #[arg(short, long, value_name = "FILE")]
        script: PathBuf,

        /// Batch ID
        #[arg(short, long)]
        batch: String,

        /// Flow ID (runs a single flow)
        #[arg(short, long)]
        flow: Option<String>,

        /// Execution ID (generated for a single flow when omitted)
        #[arg(short, long)]
        execution: Option<String>,

        /// Phase symbol (runs a single phase; needs --flow and --execution)
        #[arg(long)]
        phase: Option<Phase>,

        /// Batch argument, repeatable
        #[arg(short = 'A', long = "argument", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        arguments: Vec<(String, String)>,

        /// Engine definition, repeatable (skipFlows, serializeFlows, parallelism)
        #[arg(short = 'D', long = "define", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        definitions: Vec<(String, String)>,

        /// Extra variable for profile placeholders, repeatable
        #[arg(short = 'V', long = "variable", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        variables: Vec<(String, String)>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the flows of a graph store
    List {
        /// Compiled graph store file
        #[arg(short, long, value_name = "FILE")]
        script: PathBuf,
    },

    /// Validate a graph store (and a profile) without running anything
    Validate {
        /// Compiled graph store file
        #[arg(short, long, value_name = "FILE")]
        script: PathBuf,

        /// Engine profile file
        #[arg(short, long, value_name = "FILE")]
        profile: Option<PathBuf>,

        /// Extra variable for profile placeholders, repeatable
        #[arg(short = 'V', long = "variable", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        variables: Vec<(String, String)>,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        "flowgate=debug"
    } else {
        "flowgate=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Invocation failed");
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    match cli.command {
        Commands::Run {
            profile,
            script,
            batch,
            flow,
            execution,
            phase,
            arguments,
            definitions,
            variables,
            json,
        } => {
            let mut request =
                InvocationRequest::new(InvocationMode::infer(flow.as_deref(), phase), batch);
            request.flow_id = flow;
            request.execution_id = execution;
            request.phase = phase;
            request.arguments = arguments.into_iter().collect();
            request.definitions = definitions.into_iter().collect();
            run_invocation(profile, script, request, variables, json).await
        }
        Commands::List { script } => list_flows(script),
        Commands::Validate {
            script,
            profile,
            variables,
        } => validate(script, profile, variables),
    }
}

async fn run_invocation(
    profile_path: PathBuf,
    script: PathBuf,
    request: InvocationRequest,
    variables: Vec<(String, String)>,
    json: bool,
) -> anyhow::Result<bool> {
    let resolver = VariableResolver::system_with(variables);
    let profile = EngineProfile::load(&profile_path, resolver)
        .with_context(|| format!("Failed to load profile {}", profile_path.display()))?;

    let result = Executor::new(profile).run_file(&request, &script).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_invocation_result(&result);
    }
    Ok(result.success)
}

fn list_flows(script: PathBuf) -> anyhow::Result<bool> {
    let store = PropertyStore::load(&script)?;
    let graph = codec::load_batch(&store)
        .with_context(|| format!("Failed to load {}", script.display()))?;

    if graph.is_empty() {
        println!("No flows found in: {}", script.display());
        return Ok(true);
    }

    println!("Flows in {}:\n", script.display());
    for flow in graph.flows() {
        let phases: Vec<String> = flow
            .phases()
            .map(|(phase, scripts)| format!("{}:{}", phase, scripts.len()))
            .collect();
        if flow.blocker_ids().is_empty() {
            println!("  {} (no blockers) [{}]", flow.id(), phases.join(" "));
        } else {
            let blockers: Vec<&str> = flow.blocker_ids().iter().map(String::as_str).collect();
            println!(
                "  {} (blocked by: {}) [{}]",
                flow.id(),
                blockers.join(", "),
                phases.join(" ")
            );
        }
    }

    println!("\nExecution order:");
    for (i, level) in graph.execution_levels().iter().enumerate() {
        println!("  Level {}: [{}]", i, level.join(", "));
    }

    Ok(true)
}

fn validate(
    script: PathBuf,
    profile: Option<PathBuf>,
    variables: Vec<(String, String)>,
) -> anyhow::Result<bool> {
    let store = PropertyStore::load(&script)?;
    let graph = match codec::load_batch(&store) {
        Ok(graph) => graph,
        Err(e) => {
            println!("✗ {} is invalid: {}", script.display(), e);
            return Ok(false);
        }
    };
    println!(
        "✓ {} is valid ({} flows, {} scripts)",
        script.display(),
        graph.len(),
        graph.flows().iter().map(|f| f.script_count()).sum::<usize>()
    );

    if let Some(path) = profile {
        let resolver = VariableResolver::system_with(variables);
        let kinds: BTreeSet<ScriptKind> = graph.flows().iter().flat_map(|f| f.active_kinds()).collect();
        let checked = EngineProfile::load(&path, resolver)
            .and_then(|p| p.instantiate(&HandlerRegistry::new(), &kinds).map(|_| p));
        match checked {
            Ok(engine) => {
                println!("✓ {} is valid", path.display());
                for kind in engine.configured_kinds() {
                    if let Some(service) = engine.handler_profile(kind) {
                        println!("  {} -> {}", kind, service.selector());
                    }
                }
            }
            Err(e) => {
                println!("✗ {} is invalid: {}", path.display(), e);
                return Ok(false);
            }
        }
    }

    Ok(true)
}

fn print_invocation_result(result: &InvocationResult) {
    println!("\n=== {} Result ===\n", result.mode);
    println!("Success: {}", if result.success { "YES" } else { "NO" });

    if let InvocationOutcome::Batch(batch) = &result.outcome {
        println!("Batch ID: {}", batch.batch_id);
        if !batch.execution_order.is_empty() {
            println!("Order: {}", batch.execution_order.join(" -> "));
        }
    }
    println!();

    for flow in result.flows() {
        let status = match (flow.success, flow.skipped) {
            (true, false) => "✓",
            (true, true) => "○",
            (false, true) => "⊘",
            (false, false) => "✗",
        };
        println!("{} Flow: {} ({})", status, flow.flow_id, flow.execution_id);
        for script in &flow.scripts {
            print_script_result(script);
        }
    }

    let failures = result.failures();
    if !failures.is_empty() {
        println!("\nFailures:");
        for failure in failures {
            println!(
                "  {}/{}/{}: {}",
                failure.flow_id, failure.phase, failure.script_id, failure.message
            );
        }
    }
}

fn print_script_result(script: &ScriptResult) {
    let status = match script.status {
        ScriptStatus::Succeeded => "✓".to_string(),
        ScriptStatus::Failed => "✗".to_string(),
        ScriptStatus::Skipped(reason) => format!("○ ({:?})", reason),
    };
    println!("  {} [{}] {}", status, script.phase, script.id);
    if let Some(err) = &script.error {
        println!("      Error: {}", err);
    }
}
