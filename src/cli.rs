use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "sentry",
    about = "Autonomous supervisor for tmux sessions hosting AI coding agents",
    version
)]
pub struct Cli {
    /// Path to the agent configuration (YAML)
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,

    /// Path to the policy document (YAML)
    #[arg(long, value_name = "PATH")]
    pub policy: PathBuf,

    /// Log actions instead of sending keys or running shell commands
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Run a single poll cycle and exit
    #[arg(long, default_value_t = false)]
    pub once: bool,

    /// Secret used to sign approval tokens
    #[arg(long, env = "APPROVAL_SECRET")]
    pub approval_secret: Option<String>,

    /// Base URL for approval callback links
    #[arg(long, env = "PUBLIC_BASE_URL")]
    pub public_base_url: Option<String>,

    /// Log filter (error, warn, info, debug, trace or a filter directive)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}
