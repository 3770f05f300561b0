use clap::Parser;
use finance_tool_orchestrator::{
    agent::{run_session, RunOutcome, SessionTarget},
    config::{
        redact, ConfigSource, LlmOverrides, LlmSettings, DEFAULT_ENV_YAML, DEFAULT_SERVER_URL,
        TRANSPORT_VAR,
    },
    events::{ConsoleSink, Emitter},
    llm::{ChatCompletionsClient, LlmGateway},
    models::{OrchestrationConfig, DEFAULT_MAX_STEPS, DEFAULT_TEMPERATURE},
    tools::Transport,
    OrchestrationError, Result,
};
use secrecy::ExposeSecret;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Answer finance questions with a chat model that calls remote tools
#[derive(Parser, Debug)]
#[command(name = "orchestrator", version, about)]
struct Args {
    /// Run a single query and exit (interactive mode when omitted)
    #[arg(short, long)]
    query: Option<String>,

    /// Tool server endpoint
    #[arg(long, default_value = DEFAULT_SERVER_URL)]
    server_url: String,

    /// Tool server transport: auto, http or sse
    #[arg(long, env = TRANSPORT_VAR, default_value_t = Transport::Auto)]
    transport: Transport,

    /// Chat-completion base URL (overrides DEEPSEEK_BASE_URL)
    #[arg(long)]
    base_url: Option<String>,

    /// Model identifier (overrides DEEPSEEK_MODEL)
    #[arg(long)]
    model: Option<String>,

    /// API key (overrides DEEPSEEK_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// YAML file with fallback DEEPSEEK_* values
    #[arg(long, default_value = DEFAULT_ENV_YAML)]
    env_yaml: PathBuf,

    /// Maximum number of model requests per query
    #[arg(long, default_value_t = DEFAULT_MAX_STEPS)]
    max_steps: u32,

    #[arg(long, default_value_t = DEFAULT_TEMPERATURE)]
    temperature: f32,

    /// Cancel a query that runs longer than this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Print full request and response payloads
    #[arg(short, long)]
    verbose: bool,
}

/// Everything needed to run queries, built once at startup.
struct Client {
    gateway: Arc<dyn LlmGateway>,
    target: SessionTarget,
    config: OrchestrationConfig,
    run_timeout: Option<Duration>,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    // Logs go to stderr; stdout carries the rendered run.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let code = match start(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            match e {
                OrchestrationError::Config(_) => 2,
                _ => 1,
            }
        }
    };

    std::process::exit(code);
}

async fn start(args: Args) -> Result<i32> {
    let source = ConfigSource::load(&args.env_yaml);
    let overrides = LlmOverrides {
        api_key: args.api_key.clone(),
        base_url: args.base_url.clone(),
        timeout_secs: None,
    };
    let settings = LlmSettings::resolve(&overrides, &source)?;

    let config = OrchestrationConfig {
        max_steps: args.max_steps,
        temperature: args.temperature,
        model: source.model(args.model.as_deref()),
        verbose: args.verbose,
        require_tools: false,
    };
    config.validate()?;

    println!("{}", "=".repeat(80));
    println!("Tool server: {} ({})", args.server_url, args.transport);
    println!("LLM base URL: {}", settings.base_url);
    println!("Model: {}", config.model);
    println!("API key: {}", redact(settings.api_key.expose_secret(), 4));
    println!("{}", "=".repeat(80));

    let target = SessionTarget {
        server_url: args.server_url.clone(),
        base_url: settings.base_url.clone(),
        tool_timeout: settings.timeout,
        transport: args.transport,
    };

    let client = Client {
        gateway: Arc::new(ChatCompletionsClient::new(settings)?),
        target,
        config,
        run_timeout: args.timeout_secs.map(Duration::from_secs),
    };

    match args.query {
        Some(query) => Ok(client.run(&query).await.exit_code()),
        None => client.interactive().await,
    }
}

impl Client {
    /// Run one query, cancelling it on Ctrl-C or when the run timeout elapses.
    async fn run(&self, query: &str) -> RunOutcome {
        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(cancel_on_interrupt(cancel.clone(), self.run_timeout));

        let mut emitter = Emitter::new(ConsoleSink::new(self.config.verbose));
        let report = run_session(
            self.gateway.clone(),
            &self.target,
            self.config.clone(),
            query,
            &mut emitter,
            &cancel,
        )
        .await;
        watcher.abort();

        debug!(steps = report.steps, "Query finished");
        report.outcome
    }

    async fn interactive(&self) -> Result<i32> {
        println!("Interactive mode. Type exit or quit to leave.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            print!("\n> ");
            std::io::stdout().flush()?;

            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = interrupted() => return Ok(130),
            };
            let Some(line) = line else {
                break;
            };

            let query = line.trim();
            if query.is_empty() {
                continue;
            }
            if matches!(query.to_lowercase().as_str(), "exit" | "quit") {
                break;
            }

            // Failures were already rendered; keep the session going.
            let outcome = self.run(query).await;
            info!(exit_code = outcome.exit_code(), "Interactive query finished");
        }

        println!("Bye");
        Ok(0)
    }
}

async fn cancel_on_interrupt(cancel: CancellationToken, timeout: Option<Duration>) {
    match timeout {
        Some(limit) => {
            tokio::select! {
                _ = interrupted() => {}
                _ = tokio::time::sleep(limit) => {
                    eprintln!("run timed out after {}s", limit.as_secs());
                }
            }
        }
        None => interrupted().await,
    }
    cancel.cancel();
}

/// Resolves on Ctrl-C. Never resolves when the signal cannot be installed.
async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
