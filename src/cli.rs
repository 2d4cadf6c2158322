//! Command-line surface. The only supported invocation starts the server;
//! `--host`/`--port` override the environment-derived bind address.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "anthropic-relay", version, about = "Anthropic Messages API relay to an OpenAI-compatible backend")]
pub struct Cli {
    /// Override the bind host (takes precedence over HOST).
    #[arg(long)]
    pub host: Option<String>,

    /// Override the bind port (takes precedence over PORT).
    #[arg(long)]
    pub port: Option<u16>,
}
