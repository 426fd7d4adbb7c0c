use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vmsan_agent::shell::manager::ShellConfig;
use vmsan_agent::{router, AppState, VERSION};

#[derive(Debug, Parser)]
#[command(
    name = "vmsan-agent",
    version,
    about = "Remote execution agent for sandbox hosts"
)]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 9119)]
    port: u16,

    /// Auth token shared with the controller.
    #[arg(long, env = "VMSAN_AGENT_TOKEN", default_value = "", hide_env_values = true)]
    token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if cli.token.is_empty() {
        bail!("auth token required: use --token or VMSAN_AGENT_TOKEN");
    }

    let state = AppState::new(cli.token, ShellConfig::default());
    let app = router(state);

    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(version = VERSION, %addr, "agent listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
