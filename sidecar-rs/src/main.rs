//! sidecar-rs: TLS-terminating sidecar proxy

use sidecar_rs::ProxyConfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    info!("Starting sidecar-rs v{}", env!("CARGO_PKG_VERSION"));

    let config = ProxyConfig::from_env().inspect_err(|e| error!("{}", e))?;

    sidecar_rs::start(config)
        .await
        .inspect_err(|e| error!("Error starting server: {}", e))?;

    Ok(())
}

/// `RUST_LOG` filters, `LOG_FORMAT=json` switches to structured output
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "sidecar_rs=info,tower_http=info".into());

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
