//! The graph distribution pipeline: traces a module on its first call and produces the compiled
//! module every later call runs on.

use comms::Collective;
use log::{debug, info, warn};

use crate::{
    Result, SpmdErr,
    graph::{BackwardTrace, DistributedGraph, ForwardTrace, Signature},
    module::{Args, Module, Tensor},
    placement::{Placement, Schema},
};

/// Produces a compiled module out of a tracked module and the arguments of its first call.
pub trait Distribute<M: Module>: Send {
    type Compiled: CompiledModule<M> + Send;

    /// Captures and distributes the module.
    ///
    /// # Arguments
    /// * `graph` - The tracking structure holding the original module.
    /// * `schema` - The parameters' schema.
    /// * `input_schemas` - One placement per positional input, empty for the default.
    /// * `expand_first_iter` - Whether to also capture the backward pass right away.
    /// * `args` - The literal arguments of the first call, the result is specialized to them.
    ///
    /// # Returns
    /// The compiled module or an error if capture or validation failed.
    fn distribute(
        &mut self,
        graph: &mut DistributedGraph<M>,
        schema: &Schema,
        input_schemas: &[Placement],
        expand_first_iter: bool,
        args: &Args,
    ) -> Result<Self::Compiled>;
}

/// A module specialized to the signature it was traced with.
#[allow(unused)]
#[trait_variant::make(CompiledModule: Send)]
pub trait CompiledModuleTemplate<M: Module> {
    /// Runs the compiled forward pass.
    fn call(&mut self, module: &mut M, args: &Args) -> Result<Tensor>;

    /// Runs the compiled backward pass for the last `call` and synchronizes the gradients
    /// across the group.
    ///
    /// # Arguments
    /// * `module` - The original module.
    /// * `grad_output` - The gradient of the loss with respect to the last output.
    /// * `group` - The group the parameters are replicated on.
    ///
    /// # Returns
    /// The parameters' gradients, identical on every rank.
    async fn backward<G: Collective + Send>(
        &mut self,
        module: &mut M,
        grad_output: &Tensor,
        group: &mut G,
    ) -> Result<Vec<Tensor>>;
}

/// How the gradients of replicated parameters are made consistent across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradSync {
    /// Every rank saw the same inputs, gradients are already identical.
    Local,
    /// Every rank saw a shard of the inputs, gradients are averaged over the replicas.
    AllReduceMean { replicas: usize },
}

/// The default pipeline: traces the forward (and optionally backward) pass of the original module.
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphDistributor;

impl GraphDistributor {
    pub fn new() -> Self {
        Self
    }
}

impl<M: Module> Distribute<M> for GraphDistributor {
    type Compiled = Compiled;

    fn distribute(
        &mut self,
        graph: &mut DistributedGraph<M>,
        schema: &Schema,
        input_schemas: &[Placement],
        expand_first_iter: bool,
        args: &Args,
    ) -> Result<Compiled> {
        if !schema.is_replicate_only() {
            return Err(SpmdErr::UnsupportedPlacement {
                placements: schema.placements().to_vec(),
            });
        }

        let placements = resolve_input_placements(input_schemas, args)?;
        let inputs = Signature::of(args);
        info!(inputs:? = inputs; "tracing forward pass");

        let output = graph.module_mut().forward(args)?;
        let params: Vec<_> = graph
            .module()
            .parameters()
            .iter()
            .map(|p| p.shape().to_vec())
            .collect();

        if expand_first_iter {
            let grads = trace_backward(graph.module_mut(), args, &output, &params)?;
            debug!("traced backward pass of {} gradient(s)", grads.grads.len());
            graph.record_backward(grads);
        }

        let grad_sync = if placements.iter().any(Placement::is_shard) {
            GradSync::AllReduceMean {
                replicas: schema.mesh().size(),
            }
        } else {
            GradSync::Local
        };

        let trace = ForwardTrace {
            inputs,
            placements,
            params,
            output: output.shape().to_vec(),
        };

        info!("compiled module with {grad_sync:?} gradient sync");
        graph.record_forward(trace.clone());
        Ok(Compiled::new(trace, grad_sync))
    }
}

/// Gives every positional input its placement, validating the given input schemas.
fn resolve_input_placements(input_schemas: &[Placement], args: &Args) -> Result<Vec<Placement>> {
    let inputs = args.positional();

    // By default every rank holds its own shard of the batch, scalars can only be replicated.
    if input_schemas.is_empty() {
        let placements = inputs
            .iter()
            .map(|t| match t.ndim() {
                0 => Placement::Replicate,
                _ => Placement::Shard(0),
            })
            .collect();

        return Ok(placements);
    }

    if input_schemas.len() != inputs.len() {
        return Err(SpmdErr::InputSchemaMismatch {
            got: input_schemas.len(),
            expected: inputs.len(),
        });
    }

    for (index, (placement, input)) in input_schemas.iter().zip(inputs).enumerate() {
        match *placement {
            Placement::Replicate => {}
            Placement::Shard(dim) if dim < input.ndim() => {}
            Placement::Shard(dim) => {
                return Err(SpmdErr::InvalidShardDim {
                    index,
                    dim,
                    ndim: input.ndim(),
                });
            }
            Placement::Partial(_) => {
                return Err(SpmdErr::UnsupportedInputPlacement {
                    index,
                    placement: *placement,
                });
            }
        }
    }

    Ok(input_schemas.to_vec())
}

/// Differentiates `sum(output)` and checks every gradient matches its parameter.
fn trace_backward<M: Module>(
    module: &mut M,
    args: &Args,
    output: &Tensor,
    params: &[Vec<usize>],
) -> Result<BackwardTrace> {
    let grad_output = Tensor::ones(output.raw_dim());
    let grads = module.backward(args, &grad_output)?;

    if grads.len() != params.len() {
        return Err(SpmdErr::ShapeMismatch {
            what: "gradient count",
            got: vec![grads.len()],
            expected: vec![params.len()],
        });
    }

    for (grad, param) in grads.iter().zip(params) {
        if grad.shape() != param.as_slice() {
            return Err(SpmdErr::ShapeMismatch {
                what: "gradient",
                got: grad.shape().to_vec(),
                expected: param.clone(),
            });
        }
    }

    Ok(BackwardTrace {
        grads: grads.iter().map(|g| g.shape().to_vec()).collect(),
    })
}

/// The compiled module `GraphDistributor` produces.
#[derive(Debug, Clone)]
pub struct Compiled {
    trace: ForwardTrace,
    grad_sync: GradSync,
    last_args: Option<Args>,
    warned_drift: bool,
}

impl Compiled {
    fn new(trace: ForwardTrace, grad_sync: GradSync) -> Self {
        Self {
            trace,
            grad_sync,
            last_args: None,
            warned_drift: false,
        }
    }

    pub fn trace(&self) -> &ForwardTrace {
        &self.trace
    }

    pub fn grad_sync(&self) -> GradSync {
        self.grad_sync
    }
}

impl<M: Module> CompiledModule<M> for Compiled {
    fn call(&mut self, module: &mut M, args: &Args) -> Result<Tensor> {
        if !self.warned_drift {
            let signature = Signature::of(args);

            // Never recompiled, the call still runs on the module traced with the first signature.
            if signature != self.trace.inputs {
                warn!(
                    traced:? = self.trace.inputs, got:? = signature;
                    "call signature differs from the traced one, reusing the compiled module"
                );
                self.warned_drift = true;
            }
        }

        self.last_args = None;
        let output = module.forward(args)?;
        self.last_args = Some(args.clone());
        Ok(output)
    }

    async fn backward<G: Collective + Send>(
        &mut self,
        module: &mut M,
        grad_output: &Tensor,
        group: &mut G,
    ) -> Result<Vec<Tensor>> {
        let grad_sync = self.grad_sync;
        let args = self.last_args.as_ref().ok_or(SpmdErr::NoForwardPass)?;
        let mut grads = module.backward(args, grad_output)?;

        let GradSync::AllReduceMean { replicas } = grad_sync else {
            return Ok(grads);
        };

        for (index, grad) in grads.iter_mut().enumerate() {
            if !grad.is_standard_layout() {
                *grad = grad.as_standard_layout().into_owned();
            }

            let buf = grad.as_slice_mut().ok_or(SpmdErr::NonContiguous { index })?;
            group.all_reduce_sum(buf).await?;
            buf.iter_mut().for_each(|g| *g /= replicas as f32);
        }

        Ok(grads)
    }
}
