use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "cc-gw", version, about = "Self-hosted LLM gateway")]
pub(crate) struct Cli {
    /// Gateway home directory (config, secret key, database).
    #[arg(long, env = "CC_GW_HOME")]
    pub(crate) home: Option<PathBuf>,
    /// Bind host; overrides the configured value.
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Bind port; overrides the configured value.
    #[arg(long, env = "PORT")]
    pub(crate) port: Option<u16>,
    /// Directory with the built web console, served at `/`.
    #[arg(long, env = "CC_GW_UI_ROOT")]
    pub(crate) ui_root: Option<PathBuf>,
    /// Log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    pub(crate) log_level: String,
}
