//! Distributes a module across a group of workers: the initial parameters are broadcast from
//! rank 0 on construction, the module is traced and compiled on its first call, and every call
//! runs on the compiled module from then on.

pub mod distribute;
pub mod error;
pub mod graph;
pub mod module;
pub mod nn;
pub mod optim;
pub mod placement;
mod spmd;
mod test;

pub use distribute::{CompiledModule, Distribute, GraphDistributor};
pub use error::{Result, SpmdErr};
pub use graph::DistributedGraph;
pub use module::{Args, Module, Tensor};
pub use placement::{DeviceMesh, Placement, ReduceOp, Schema};
pub use spmd::{SOURCE_RANK, Spmd};
