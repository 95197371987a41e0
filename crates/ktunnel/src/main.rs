mod ktunnel;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "ktunnel",
    version,
    about = "ktunnel - expose services behind a firewall through a TLS tunnel"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses KTUNNEL_CONFIG; then auto-detects ktunnel.toml > ktunnel.yaml > ktunnel.yml from CWD; then falls back to the OS default path (Linux: /etc/ktunnel/ktunnel.toml; others: user config dir).
    #[arg(long, env = "KTUNNEL_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Exposed host to keep the control connections to (`host` or `host:port`). Makes this process the protected host.
    #[arg(short = 'e', long)]
    exposed: Option<String>,

    /// Shared secret(s), comma separated. The protected host logs in with the first one.
    #[arg(short = 's', long)]
    secret: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    ktunnel::run(
        cli.config,
        ktunnel::config::Overrides {
            exposed_host: cli.exposed,
            secrets: cli.secret,
        },
    )
    .await
}
