use std::{env, num::NonZeroUsize, str::FromStr};

use crate::error::{NodeErr, Result};

const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
const DEFAULT_STEPS: NonZeroUsize = NonZeroUsize::new(10).unwrap();
const DEFAULT_LR: f32 = 0.01;

/// What a single worker process was asked to do, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    rank: usize,
    world_size: NonZeroUsize,
    master_addr: String,
    master_port: Option<u16>,
    steps: NonZeroUsize,
    lr: f32,
}

impl NodeConfig {
    /// Reads the configuration from the process' environment.
    ///
    /// # Returns
    /// The configuration or an error if any variable is malformed or missing.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Builds the configuration out of a variable lookup.
    ///
    /// # Arguments
    /// * `var` - Returns the value of a variable, if set.
    ///
    /// # Returns
    /// The configuration or an error if any variable is malformed or missing.
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rank = parse(&var, "RANK")?.unwrap_or(0);
        let world_size = parse(&var, "WORLD_SIZE")?.unwrap_or(NonZeroUsize::MIN);
        let master_addr = var("MASTER_ADDR").unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string());
        let master_port = parse(&var, "MASTER_PORT")?;
        let steps = parse(&var, "STEPS")?.unwrap_or(DEFAULT_STEPS);
        let lr = parse(&var, "LR")?.unwrap_or(DEFAULT_LR);

        if rank >= world_size.get() {
            return Err(NodeErr::Config(format!(
                "RANK {rank} out of range for WORLD_SIZE {world_size}"
            )));
        }

        if world_size.get() > 1 && master_port.is_none() {
            return Err(NodeErr::Config(
                "MASTER_PORT is required when WORLD_SIZE > 1".to_string(),
            ));
        }

        Ok(Self {
            rank,
            world_size,
            master_addr,
            master_port,
            steps,
            lr,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> NonZeroUsize {
        self.world_size
    }

    /// The hub's `host:port`, if the group spans more than one process.
    pub fn master(&self) -> Option<String> {
        self.master_port
            .map(|port| format!("{}:{port}", self.master_addr))
    }

    pub fn steps(&self) -> usize {
        self.steps.get()
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }
}

fn parse<F, T>(var: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    var(key)
        .map(|value| value.trim().parse().map_err(|_| config_err(key)))
        .transpose()
}

fn config_err(key: &str) -> NodeErr {
    NodeErr::Config(format!("invalid value for {key}"))
}
