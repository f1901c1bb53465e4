//! `steploop run`: replay a scripted session.

use anyhow::Context;
use clap::Args;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use steploop_agent::{
    AgentLoop, GenerateOptions, GenerateResult, ScriptedProvider, StopCondition, has_tool_call,
    load_script, step_count_is, text_matches,
};
use steploop_core::tool::ToolRegistry;
use steploop_tools::{default_registry, registry_with_deferred_orders};

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// JSON script of backend turns
    #[arg(long)]
    pub script: PathBuf,

    /// User prompt that starts the run
    #[arg(short, long)]
    pub prompt: String,

    /// System instructions (overrides the config)
    #[arg(long)]
    pub system: Option<String>,

    /// Consume the script as streamed events and print text as it arrives
    #[arg(long)]
    pub stream: bool,

    /// Hard step ceiling (overrides the config)
    #[arg(long)]
    pub max_steps: Option<usize>,

    /// Stop once the run has this many steps
    #[arg(long)]
    pub stop_after: Option<usize>,

    /// Stop after a step that called this tool (repeatable)
    #[arg(long)]
    pub stop_on_tool: Vec<String>,

    /// Stop when the last step's text matches this regex
    #[arg(long)]
    pub stop_on_text: Option<String>,

    /// Seed for the randomized findOrders tool
    #[arg(long)]
    pub seed: Option<u64>,

    /// Declare findOrders without an executor so its calls are deferred
    #[arg(long)]
    pub defer_orders: bool,
}

/// Stop conditions requested on the command line, in a fixed order.
pub fn build_conditions(args: &RunArgs) -> anyhow::Result<Vec<Arc<dyn StopCondition>>> {
    let mut conditions = Vec::new();
    if let Some(n) = args.stop_after {
        conditions.push(step_count_is(n));
    }
    for tool in &args.stop_on_tool {
        conditions.push(has_tool_call(tool));
    }
    if let Some(pattern) = &args.stop_on_text {
        let condition = text_matches(pattern)
            .with_context(|| format!("invalid --stop-on-text regex: {pattern}"))?;
        conditions.push(condition);
    }
    Ok(conditions)
}

fn registry(args: &RunArgs, seed: Option<u64>) -> anyhow::Result<ToolRegistry> {
    let registry = if args.defer_orders {
        registry_with_deferred_orders()?
    } else {
        default_registry(seed)?
    };
    Ok(registry)
}

pub async fn run(args: RunArgs, config_path: Option<&Path>) -> anyhow::Result<()> {
    let mut config = super::load_config(config_path)?;
    if let Some(max_steps) = args.max_steps {
        config.max_steps = max_steps;
    }
    if args.stream {
        config.streaming = true;
    }
    if args.seed.is_some() {
        config.tool_seed = args.seed;
    }
    config.validate()?;

    let turns = load_script(&args.script)?;
    tracing::info!(script = %args.script.display(), turns = turns.len(), "Loaded script");

    let provider = Arc::new(ScriptedProvider::new(turns));
    let tools = Arc::new(registry(&args, config.tool_seed)?);
    let streaming = config.streaming;
    let agent = Arc::new(AgentLoop::new(provider, tools, config));

    let mut options =
        GenerateOptions::prompt(args.prompt.clone()).stop_when(build_conditions(&args)?);
    if let Some(system) = &args.system {
        options = options.system(system);
    }

    let result = if streaming {
        stream_to_stdout(&agent, options).await?
    } else {
        agent.generate(options).await
    };

    println!("{}", serde_json::to_string_pretty(&result)?);

    match &result.error {
        Some(e) => Err(anyhow::anyhow!("run failed after {} step(s): {e}", result.steps.len())),
        None => Ok(()),
    }
}

async fn stream_to_stdout(
    agent: &Arc<AgentLoop>,
    options: GenerateOptions,
) -> anyhow::Result<GenerateResult> {
    let mut run = agent.stream(options);
    let mut stdout = std::io::stdout();
    while let Some(event) = run.events.recv().await {
        if let Some(text) = event.text() {
            write!(stdout, "{text}")?;
            stdout.flush()?;
        }
    }
    writeln!(stdout)?;
    Ok(run.handle.await?)
}
