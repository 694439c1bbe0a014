use std::io;

use comms::{SoloGroup, group::net};
use log::info;
use tokio::signal;

use node::{config::NodeConfig, error::Result, train};

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let config = NodeConfig::from_env()?;
    info!(
        "starting rank {} of {}, {} step(s)",
        config.rank(),
        config.world_size(),
        config.steps()
    );

    tokio::select! {
        ret = start(&config) => {
            ret?;
            info!("wrapping up, disconnecting...");
        }
        _ = signal::ctrl_c() => {
            info!("received Ctrl-C");
        }
    }

    Ok(())
}

/// Forms the group this worker belongs to and trains on it.
async fn start(config: &NodeConfig) -> Result<()> {
    match config.master() {
        Some(addr) if config.world_size().get() > 1 => {
            let group = net::connect(&addr, config.rank(), config.world_size()).await?;
            train::run(config, group).await?;
        }
        _ => {
            train::run(config, SoloGroup::new()).await?;
        }
    }

    Ok(())
}
