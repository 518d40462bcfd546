//! flowrt command line
//!
//! Usage:
//!   flowrt run <WORKSPACE> <KIND/NAME> [--input JSON] [--stream] [--stub]
//!   flowrt triggers <WORKSPACE>
//!   flowrt models [--provider NAME]

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use flowrt::{
    EntityKind, ExecuteOptions, Runtime, RuntimeConfig, StreamEvent, StubProvider, TriggerEngine,
    Value, Workspace,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "flowrt")]
#[command(about = "Run declarative agent workflows")]
struct Args {
    /// Runtime configuration file (TOML format)
    #[arg(long, global = true, env = "FLOWRT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute one entity and print its output
    Run {
        /// Workspace file (JSON array of entities)
        workspace: PathBuf,

        /// Entity to run, as `kind/name` (e.g. `pipeline/review`)
        target: String,

        /// Input value; parsed as JSON when possible, otherwise taken as text
        #[arg(long)]
        input: Option<String>,

        /// Deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Print model output as it arrives
        #[arg(long)]
        stream: bool,

        /// Use the scripted stub provider instead of HTTP providers
        #[arg(long)]
        stub: bool,

        /// Print the full execution result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the trigger scheduler until interrupted
    Triggers {
        workspace: PathBuf,

        /// Poll interval in seconds
        #[arg(long)]
        tick: Option<u64>,
    },
    /// List models offered by the configured providers
    Models {
        #[arg(long)]
        provider: Option<String>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<RuntimeConfig> {
    let config = match path {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    Ok(config.with_env_overrides())
}

fn load_workspace(path: &PathBuf) -> anyhow::Result<Workspace> {
    Workspace::from_json_file(path).with_context(|| format!("loading workspace {}", path.display()))
}

fn parse_input(raw: &str) -> Value {
    serde_json::from_str::<serde_json::Value>(raw)
        .map(|json| Value::from_json(&json))
        .unwrap_or_else(|_| Value::from(raw))
}

fn print_event(event: StreamEvent) {
    match event {
        StreamEvent::Chunk { content } => {
            print!("{}", content);
            let _ = std::io::stdout().flush();
        }
        StreamEvent::StepStarted { step } => eprintln!("[step] {}", step),
        StreamEvent::ToolCall { tool, success } => {
            eprintln!("[tool] {} ({})", tool, if success { "ok" } else { "failed" })
        }
        StreamEvent::Error { message } => eprintln!("[error] {}", message),
        _ => {}
    }
}

async fn run(
    config: RuntimeConfig,
    workspace: &PathBuf,
    target: &str,
    input: Option<String>,
    timeout: Option<u64>,
    stream: bool,
    stub: bool,
    json: bool,
) -> anyhow::Result<()> {
    let (kind, name) = target
        .split_once('/')
        .ok_or_else(|| anyhow!("target must look like kind/name, got '{}'", target))?;
    let workspace = load_workspace(workspace)?;
    let runtime = if stub {
        let runtime = Runtime::new(workspace, config);
        runtime.register_provider(Arc::new(StubProvider::new()));
        runtime
    } else {
        Runtime::from_config(workspace, config)
    };
    let entity = runtime
        .workspace()
        .require(&EntityKind::from(kind), name)?
        .clone();

    let options = ExecuteOptions {
        input: input.as_deref().map(parse_input),
        stream: stream.then(|| Arc::new(print_event) as flowrt::StreamSink),
        timeout: timeout.map(Duration::from_secs),
        ..Default::default()
    };
    let outcome = runtime.execute(&entity, options).await;
    runtime.shutdown().await;

    match outcome {
        Ok(result) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if stream {
                println!();
            } else {
                println!("{}", result.output);
            }
            info!(
                tokens = result.usage.total_tokens,
                duration_ms = result.duration_ms,
                "done"
            );
            Ok(())
        }
        Err(failure) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&failure.partial)?);
            }
            Err(failure.error.into())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("flowrt=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Run {
            workspace,
            target,
            input,
            timeout,
            stream,
            stub,
            json,
        } => run(config, &workspace, &target, input, timeout, stream, stub, json).await,
        Command::Triggers { workspace, tick } => {
            let runtime = Runtime::from_config(load_workspace(&workspace)?, config);
            let mut engine = TriggerEngine::new(runtime.clone());
            if let Some(secs) = tick {
                engine = engine.with_tick(Duration::from_secs(secs.max(1)));
            }
            let handle = engine.start();
            tokio::signal::ctrl_c().await?;
            handle.stop().await;
            runtime.shutdown().await;
            Ok(())
        }
        Command::Models { provider } => {
            let runtime = Runtime::from_config(Workspace::new(), config);
            let names = match provider {
                Some(name) => vec![name],
                None => runtime.providers().names(),
            };
            if names.is_empty() {
                return Err(anyhow!("no providers configured; set OPENAI_API_KEY or ANTHROPIC_API_KEY"));
            }
            for name in names {
                let provider = runtime
                    .providers()
                    .get(&name)
                    .ok_or_else(|| anyhow!("provider '{}' is not configured", name))?;
                for model in provider.list_models().await? {
                    println!("{}\t{}", name, model);
                }
            }
            Ok(())
        }
    }
}
