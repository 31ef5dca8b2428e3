use anyhow::Result;
use clap::Parser;
use tracing::info;

mod config;
mod promql;
mod proxy;
mod telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let args = config::Args::parse();

    telemetry::init_tracing("info", args.json);

    let cfg = config::Config::from_args(args)?;
    info!(upstream = %cfg.upstream, label = %cfg.label, "starting prom-label-proxy");

    proxy::run(cfg).await
}
