use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use fhir_elicit_mcp_runtime::{ConfigOverrides, McpCommands, run as run_mcp};

#[derive(Parser)]
#[command(
    name = "fhir-elicit-mcp",
    version,
    about = "Guided FHIR resource workflows as an MCP server over stdio"
)]
struct Cli {
    #[command(flatten)]
    config: ConfigOverrides,

    /// Log as JSON lines instead of human-readable text
    #[arg(long, env = "FHIR_ELICIT_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: McpCommands,
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "fhir_elicit=info".into());
    // stdout carries the MCP stream.
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let code = run_mcp(cli.config, cli.command).await;
    std::process::exit(code);
}
