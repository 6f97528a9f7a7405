use clap::Parser;
use std::path::PathBuf;

use crate::config;

#[derive(Parser, Debug)]
#[command(name = "strangers-core")]
#[command(version)]
#[command(about = "Random one-to-one video chat coordinator", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/strangers-core.toml")]
    pub config: PathBuf,

    /// HTTP bind address
    #[arg(long)]
    pub host: Option<String>,

    /// HTTP / WebSocket port (also read from PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    /// Maximum queue wait in seconds
    #[arg(long)]
    pub max_wait: Option<u64>,

    /// Sweeper period in seconds
    #[arg(long)]
    pub sweep_interval: Option<u64>,

    /// Directory with the browser client to serve
    #[arg(long)]
    pub static_root: Option<PathBuf>,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Fold command-line and environment overrides into a loaded config.
    ///
    /// Flags win over `PORT`, which wins over the file.
    pub fn apply_overrides(&self, config: &mut config::Config, env_port: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(port) = env_port {
            config.http.port = port
                .trim()
                .parse()
                .map_err(|e| format!("Invalid PORT value {:?}: {}", port, e))?;
        }
        if let Some(ref host) = self.host {
            config.http.host = host.clone();
        }
        if let Some(port) = self.port {
            config.http.port = port;
        }
        if let Some(secs) = self.max_wait {
            config.matching.max_wait_secs = secs;
        }
        if let Some(secs) = self.sweep_interval {
            config.matching.sweep_interval_secs = secs;
        }
        if let Some(ref root) = self.static_root {
            config.http.static_root = Some(root.clone());
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
        Ok(())
    }
}
