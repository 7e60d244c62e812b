use clap::Parser;
use std::net::SocketAddr;
use talos::cli::Cli;
use talos::config::Settings;
use talos::runtime::RuntimeContext;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let settings = Settings::new_with_cli(&cli)?;
    let host = settings.server.host.clone();
    let port = settings.server.port;

    info!("Starting Talos runtime on {}:{}", host, port);

    let runtime = RuntimeContext::new(settings)?;
    runtime.start().await;

    let app = talos::create_app(runtime.clone());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown_runtime = runtime.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_runtime.shutdown().await;
        })
        .await?;

    Ok(())
}
