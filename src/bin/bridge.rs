use finance_tool_orchestrator::{
    api::{start_server, ApiState, BridgeSettings},
    config::{
        ConfigSource, LlmOverrides, LlmSettings, BRIDGE_HOST_VAR, BRIDGE_PORT_VAR,
        DEFAULT_BRIDGE_HOST, DEFAULT_BRIDGE_PORT, DEFAULT_ENV_YAML,
    },
    llm::ChatCompletionsClient,
    OrchestrationError,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "Bridge failed");
        std::process::exit(match e {
            OrchestrationError::Config(_) => 2,
            _ => 1,
        });
    }
}

async fn run() -> finance_tool_orchestrator::Result<()> {
    let source = ConfigSource::load(DEFAULT_ENV_YAML);

    let host = source.get_or(BRIDGE_HOST_VAR, DEFAULT_BRIDGE_HOST);
    let port = match source.get(BRIDGE_PORT_VAR) {
        Some(raw) => raw.parse::<u16>().map_err(|_| {
            OrchestrationError::Config(format!("{} must be a port number: {}", BRIDGE_PORT_VAR, raw))
        })?,
        None => DEFAULT_BRIDGE_PORT,
    };

    let llm = LlmSettings::resolve(&LlmOverrides::default(), &source)?;
    let mut settings = BridgeSettings::from_source(&source, llm.base_url.clone())?;
    settings.tool_timeout = llm.timeout;

    info!(
        model = %settings.model,
        base_url = %settings.base_url,
        tool_server = %settings.server_url,
        transport = %settings.transport,
        web_dir = %settings.web_dir.display(),
        "Bridge configured"
    );

    let state = ApiState {
        gateway: Arc::new(ChatCompletionsClient::new(llm)?),
        settings: Arc::new(settings),
    };

    start_server(state, &host, port).await
}
