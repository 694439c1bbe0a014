use std::num::NonZeroUsize;

use comms::Collective;
use log::{debug, info};
use ndarray::Array2;
use rand::{Rng, SeedableRng, rngs::StdRng};
use spmd::{
    Args, DeviceMesh, Placement, Schema, Spmd, Tensor,
    nn::{Linear, Mse},
    optim::GradientDescent,
};

use crate::{
    config::NodeConfig,
    error::{NodeErr, Result},
};

const SEED: u64 = 0x5eed;
const BATCH: usize = 16;
const FAN_IN: usize = 4;
const FAN_OUT: usize = 2;

/// Trains a `Linear` on a rank-local synthetic batch, data parallel across `group`.
///
/// Every rank starts from its own random parameters, construction makes them rank 0's and the
/// averaged gradients keep them identical from then on.
///
/// # Arguments
/// * `config` - The amount of steps and the learning rate.
/// * `group` - The group of workers this one belongs to.
///
/// # Returns
/// The loss of every step or an error if occurred.
pub async fn run<G>(config: &NodeConfig, group: G) -> Result<Vec<f32>>
where
    G: Collective + Send,
{
    let rank = group.rank();
    let world_size = NonZeroUsize::new(group.world_size())
        .ok_or_else(|| NodeErr::Config("empty group".to_string()))?;

    let mut rng = StdRng::seed_from_u64(SEED + rank as u64);
    let layer = Linear::random((FAN_IN, FAN_OUT), &mut rng);
    let schema = Schema::replicate(DeviceMesh::new(world_size));

    let mut spmd = Spmd::new(layer, schema, vec![Placement::Shard(0)], false, group).await?;
    info!("rank {rank} of {world_size} ready to train");

    let (x, y) = synthetic_batch(&mut rng);
    let args = Args::from(x);
    let loss_fn = Mse::new();
    let optimizer = GradientDescent::new(config.lr());
    let mut losses = Vec::with_capacity(config.steps());

    for step in 0..config.steps() {
        let y_pred = spmd.forward(&args)?;
        let loss = loss_fn.loss(&y_pred, &y)?;
        let d = loss_fn.loss_prime(&y_pred, &y)?;

        let grads = spmd.backward(&d).await?;
        optimizer.step(spmd.module_mut(), &grads)?;

        debug!(step = step, loss = loss; "finished step");
        losses.push(loss);
    }

    spmd.group_mut().barrier().await?;
    if let Some(loss) = losses.last() {
        info!("rank {rank} done, final loss {loss}");
    }

    Ok(losses)
}

/// A rank-local batch of uniform inputs and their images through a linear map shared by every rank.
fn synthetic_batch<R: Rng>(rng: &mut R) -> (Tensor, Tensor) {
    let x = Array2::from_shape_fn((BATCH, FAN_IN), |_| rng.random_range(-1.0f32..1.0));
    let w = Array2::from_shape_fn((FAN_IN, FAN_OUT), |(i, j)| (i as f32 - j as f32) * 0.5);
    let y = x.dot(&w);

    (x.into_dyn(), y.into_dyn())
}
