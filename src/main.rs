use kube::Client;
use log::info;
use pyroscope_coordinator::{config::Config, errors::*, manager::Manager};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // logging may not be up yet
        eprintln!("error: {}", e);
        for cause in e.iter().skip(1) {
            eprintln!("caused by: {}", cause);
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::new()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.rust_log))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        // also installs the bridge for `log` records
        .try_init()
        .chain_err(|| "error initializing logging")?;

    info!(
        "starting pyroscope coordinator {} in namespace {}",
        config.pod_name, config.namespace
    );

    // Read the environment to find config for kube client.
    // Note that this tries an in-cluster configuration first,
    // then falls back on a kubeconfig file.
    let client = Client::try_default().await?;
    let (_manager, drainer) = Manager::new(client, config).await?;
    drainer.await;
    Ok(())
}
