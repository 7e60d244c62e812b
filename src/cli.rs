use clap::Parser;
use std::path::PathBuf;

/// Talos - resilience and resource-management runtime for agent workloads
#[derive(Parser, Debug, Clone)]
#[command(name = "talos", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "TALOS_CONFIG", default_value = "talos.toml")]
    pub config: PathBuf,

    /// Server host address
    #[arg(long, env = "TALOS_HOST")]
    pub host: Option<String>,

    /// Server port
    #[arg(long, env = "TALOS_PORT")]
    pub port: Option<u16>,

    /// Base URL of the shared cache tier
    #[arg(long, env = "TALOS_SHARED_CACHE_URL")]
    pub shared_cache_url: Option<String>,
}
