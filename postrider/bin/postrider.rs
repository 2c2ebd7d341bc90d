//! postrider — outbound SMTP delivery driven by AMQP queues.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use postrider::config_source::ConfigSource;

#[derive(Parser)]
#[command(name = "postrider", version, about = "Outbound SMTP delivery service")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short = 'f', long = "file", value_name = "config.yml")]
    config: Option<PathBuf>,

    /// Remote configuration URL, preferred over the local file
    #[arg(short = 'u', long = "url", value_name = "URL")]
    config_url: Option<String>,

    /// Configuration reload interval in seconds
    #[arg(short = 't', long = "reload", value_name = "SECONDS")]
    reload_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();
    if args.config.is_none() && args.config_url.is_none() {
        bail!("provide -f <config.yml> and/or -u <config-url>");
    }

    let source = ConfigSource::new(
        args.config,
        args.config_url,
        args.reload_secs.map(Duration::from_secs),
    );
    postrider::app::run(source).await
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::io::stdout().is_terminal() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    }
}
