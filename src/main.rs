use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use openworld_outbound::app::App;
use openworld_outbound::proxy::group::OutboundGroup;

#[derive(Parser, Debug)]
#[command(name = "openworld-outbound", version, about = "Outbound manager and proxy groups")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// 启动全部出站、打印状态后退出
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = openworld_outbound::config::load_config(&args.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level)),
        )
        .init();
    info!(path = %args.config.display(), "config loaded");

    let app = App::new(config).await?;
    if !args.check {
        return app.run().await;
    }

    app.start().await?;
    for outbound in app.manager().outbounds() {
        match outbound.as_group() {
            Some(group) => println!(
                "{:<20} {:<12} now={} members={}",
                outbound.tag(),
                outbound.outbound_type(),
                group.now(),
                group.all().join(",")
            ),
            None => println!("{:<20} {}", outbound.tag(), outbound.outbound_type()),
        }
    }
    app.manager().close().await
}
