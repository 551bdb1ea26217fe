use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "rift",
    version,
    about = "rift - expose a local service through an SSH relay"
)]
struct Cli {
    /// Path to rift config file (.toml/.yaml/.yml). If omitted, uses RIFT_CONFIG; then auto-detects rift.toml > rift.yaml > rift.yml from CWD; then falls back to the OS default path (Linux: /etc/rift/rift.toml; others: user config dir).
    #[arg(long, env = "RIFT_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    rift::run(cli.config).await
}
