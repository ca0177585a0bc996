//! pmscope - ask project-management questions about a GitHub repository
//!
//! Picks an analysis agent, lets it read the repository step by step, and
//! prints the structured answer.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pmscope::agent::{
    classify_intent, AgentContext, AgentKind, OpenRouterOracle, OrchestrationResult,
    Orchestrator, Outcome, StrategyTable,
};
use pmscope::config::Config;
use pmscope::github::GitHubClient;
use pmscope::{keyring, logging};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "pmscope",
    about = "Evidence-gathering project analysis for GitHub repositories",
    version
)]
struct Cli {
    /// Show debug diagnostics on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one analysis and print the result
    Ask(AskArgs),
    /// Store credentials in the system keychain
    Setup(SetupArgs),
}

#[derive(Args, Debug)]
struct AskArgs {
    /// Repository URL, e.g. https://github.com/owner/repo
    #[arg(long)]
    repo: Option<String>,

    /// Agent kind (task_suggestion, progress_analysis, task_completion,
    /// general_qa, task_assignment) or "auto" to let the router decide
    #[arg(long, default_value = "auto")]
    agent: String,

    /// JSON file with extra context (tasks, commits, team members, ...)
    #[arg(long)]
    context: Option<PathBuf>,

    /// Branch, tag or commit to read from
    #[arg(long = "ref")]
    git_ref: Option<String>,

    /// Override the configured step budget
    #[arg(long)]
    max_steps: Option<usize>,

    /// Print the full result as JSON
    #[arg(long)]
    json: bool,

    /// The question to answer
    #[arg(required = true, trailing_var_arg = true)]
    message: Vec<String>,
}

#[derive(Args, Debug)]
struct SetupArgs {
    /// OpenRouter API key
    #[arg(long)]
    api_key: Option<String>,

    /// GitHub token used for repository reads
    #[arg(long)]
    github_token: Option<String>,

    /// OpenRouter model id to use from now on
    #[arg(long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match cli.command {
        Commands::Ask(args) => run_ask(args).await,
        Commands::Setup(args) => run_setup(args),
    }
}

fn load_context(path: Option<&Path>) -> Result<AgentContext> {
    let Some(path) = path else {
        return Ok(AgentContext::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read context file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Context file {} is not valid JSON", path.display()))
}

async fn run_ask(args: AskArgs) -> Result<()> {
    let mut config = Config::load();
    if let Some(steps) = args.max_steps {
        config.max_steps = steps;
    }

    let api_key = config.get_api_key().ok_or_else(|| {
        anyhow::anyhow!(
            "No OpenRouter API key. Set OPENROUTER_API_KEY or run 'pmscope setup --api-key <key>'."
        )
    })?;

    let mut ctx = load_context(args.context.as_deref())?;
    if let Some(repo) = args.repo {
        ctx.github_repo = repo;
    }
    if args.git_ref.is_some() {
        ctx.git_ref = args.git_ref;
    }
    if ctx.github_token.is_none() {
        ctx.github_token = config.get_github_token();
    }
    if !ctx.has_repo() {
        eprintln!("  ! No repository given; the analysis will not read any files.");
    } else {
        ctx.repo_handle()?;
    }

    let orchestrator_config = config.orchestrator();
    let oracle = Arc::new(OpenRouterOracle::new(
        api_key,
        config.model.clone(),
        orchestrator_config.oracle_timeout,
    )?);

    let message = args.message.join(" ");
    let kind = if args.agent.trim().eq_ignore_ascii_case("auto") {
        let routed = classify_intent(
            oracle.as_ref(),
            &message,
            &[],
            orchestrator_config.oracle_timeout,
        )
        .await;
        eprintln!(
            "  Routed to {} ({} confidence{})",
            routed.agent_kind.label(),
            routed.confidence.as_str(),
            if routed.reason.is_empty() {
                String::new()
            } else {
                format!(": {}", routed.reason)
            }
        );
        routed.agent_kind
    } else {
        args.agent
            .parse::<AgentKind>()
            .map_err(|e| anyhow::anyhow!("{}", e))?
    };

    let orchestrator = Orchestrator::new(
        oracle,
        Arc::new(GitHubClient::new()?),
        StrategyTable::default().with_overrides(&config.fallback_files),
        orchestrator_config,
    );
    let result = orchestrator.run(kind, &ctx, Some(&message)).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result)?;
    }

    match result.outcome {
        Outcome::Failed => Err(anyhow::anyhow!(
            "Analysis failed: {}",
            result.error.as_deref().unwrap_or("no usable result")
        )),
        _ => Ok(()),
    }
}

fn print_summary(result: &OrchestrationResult) -> Result<()> {
    println!();
    println!("  Agent:       {}", result.agent_kind.label());
    println!("  Outcome:     {:?}", result.outcome);
    println!("  Steps:       {}", result.step_count);
    println!("  Confidence:  {}", result.confidence.as_str());
    if !result.fetched_paths.is_empty() {
        println!("  Files read:  {}", result.fetched_paths.join(", "));
    }
    println!();
    if let Some(last) = &result.last_step_result {
        println!("{}", serde_json::to_string_pretty(&last.record)?);
    }
    Ok(())
}

fn run_setup(args: SetupArgs) -> Result<()> {
    if args.api_key.is_none() && args.github_token.is_none() && args.model.is_none() {
        return Err(anyhow::anyhow!(
            "Nothing to store. Pass --api-key, --github-token or --model."
        ));
    }

    if let Some(key) = args.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
        keyring::set_api_key(key).map_err(|e| anyhow::anyhow!("{}", e))?;
        if Config::load().get_api_key().is_none() {
            eprintln!("  ! API key was saved but cannot be read back.");
            eprintln!("  Workaround: export OPENROUTER_API_KEY=\"your-key-here\"");
            return Err(anyhow::anyhow!("API key verification failed"));
        }
        println!("  + API key stored");
    }

    if let Some(token) = args
        .github_token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        keyring::set_github_token(token).map_err(|e| anyhow::anyhow!("{}", e))?;
        println!("  + GitHub token stored");
    }

    if let Some(model) = args.model.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        Config::set_model(model).map_err(|e| anyhow::anyhow!("{}", e))?;
        println!("  + Model set to {}", model);
    }

    println!("  Settings file: {}", Config::config_location());
    Ok(())
}
