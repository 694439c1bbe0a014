use comms::Collective;
use log::{debug, info};

use crate::{
    Result, SpmdErr,
    distribute::{CompiledModule, Distribute, GraphDistributor},
    graph::DistributedGraph,
    module::{Args, Module, Tensor},
    placement::{Placement, Schema},
};

/// The rank initial parameters are broadcast from.
pub const SOURCE_RANK: usize = 0;

/// Wraps a non-distributed module, distributes it lazily on its first call and runs every call
/// on the resulting compiled module.
pub struct Spmd<M, G, D = GraphDistributor>
where
    M: Module,
    D: Distribute<M>,
{
    param_schema: Schema,
    input_schemas: Vec<Placement>,
    dist_graph: DistributedGraph<M>,
    compiled: Option<D::Compiled>,
    expand_first_iter: bool,
    distributor: D,
    group: G,
}

impl<M, G> Spmd<M, G>
where
    M: Module,
    G: Collective + Send,
{
    /// Creates a new `Spmd` using the default distribution pipeline.
    ///
    /// Every rank of `group` must call this at the same time, it blocks until the initial
    /// parameters were broadcast from rank `SOURCE_RANK`.
    ///
    /// # Arguments
    /// * `module` - The target module.
    /// * `schema` - The distributed schema of the parameters, must be `[Replicate]`.
    /// * `input_schemas` - The placements of the positional inputs, empty for the default.
    /// * `expand_first_iter` - Whether the first call also captures the backward pass.
    /// * `group` - The group of workers the module is replicated on.
    ///
    /// # Returns
    /// A new `Spmd` instance or an error if the schema is unsupported or the broadcast failed.
    pub async fn new(
        module: M,
        schema: Schema,
        input_schemas: Vec<Placement>,
        expand_first_iter: bool,
        group: G,
    ) -> Result<Self> {
        Self::with_distributor(
            module,
            schema,
            input_schemas,
            expand_first_iter,
            group,
            GraphDistributor::new(),
        )
        .await
    }
}

impl<M, G, D> Spmd<M, G, D>
where
    M: Module,
    G: Collective + Send,
    D: Distribute<M>,
{
    /// Creates a new `Spmd` that compiles with `distributor` instead of the default pipeline.
    ///
    /// See `Spmd::new` for the rest of the arguments.
    pub async fn with_distributor(
        mut module: M,
        schema: Schema,
        input_schemas: Vec<Placement>,
        expand_first_iter: bool,
        mut group: G,
        distributor: D,
    ) -> Result<Self> {
        if !schema.is_replicate_only() {
            return Err(SpmdErr::UnsupportedPlacement {
                placements: schema.placements().to_vec(),
            });
        }

        if !schema.mesh().covers(group.world_size()) {
            return Err(SpmdErr::MeshMismatch {
                ranks: schema.mesh().ranks().to_vec(),
                world_size: group.world_size(),
            });
        }

        broadcast_parameters(&mut module, &mut group).await?;
        info!(
            "rank {} of {} holds the initial parameters of rank {SOURCE_RANK}",
            group.rank(),
            group.world_size()
        );

        Ok(Self {
            param_schema: schema,
            input_schemas,
            dist_graph: DistributedGraph::new(module),
            compiled: None,
            expand_first_iter,
            distributor,
            group,
        })
    }

    /// Runs the module on `args`, distributing it first if this is the first call.
    ///
    /// The compiled module is specialized to the first call's arguments and never recompiled.
    ///
    /// # Arguments
    /// * `args` - The call's arguments.
    ///
    /// # Returns
    /// Exactly what the compiled module returns.
    pub fn forward(&mut self, args: &Args) -> Result<Tensor> {
        if self.compiled.is_none() {
            info!("first call, distributing the module");
            let compiled = self.distributor.distribute(
                &mut self.dist_graph,
                &self.param_schema,
                &self.input_schemas,
                self.expand_first_iter,
                args,
            )?;

            self.compiled = Some(compiled);
        }

        let compiled = self.compiled.as_mut().ok_or(SpmdErr::NotCompiled)?;
        compiled.call(self.dist_graph.module_mut(), args)
    }

    /// Runs the compiled backward pass for the last forward pass.
    ///
    /// # Arguments
    /// * `grad_output` - The gradient of the loss with respect to the last output.
    ///
    /// # Returns
    /// The parameters' gradients, synchronized across the group.
    ///
    /// # Errors
    /// `SpmdErr::NotCompiled` if `forward` was never called.
    pub async fn backward(&mut self, grad_output: &Tensor) -> Result<Vec<Tensor>> {
        let compiled = self.compiled.as_mut().ok_or(SpmdErr::NotCompiled)?;
        compiled
            .backward(self.dist_graph.module_mut(), grad_output, &mut self.group)
            .await
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    pub fn compiled(&self) -> Option<&D::Compiled> {
        self.compiled.as_ref()
    }

    pub fn graph(&self) -> &DistributedGraph<M> {
        &self.dist_graph
    }

    pub fn module(&self) -> &M {
        self.dist_graph.module()
    }

    pub fn module_mut(&mut self) -> &mut M {
        self.dist_graph.module_mut()
    }

    pub fn schema(&self) -> &Schema {
        &self.param_schema
    }

    pub fn input_schemas(&self) -> &[Placement] {
        &self.input_schemas
    }

    pub fn expand_first_iter(&self) -> bool {
        self.expand_first_iter
    }

    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    pub fn group_mut(&mut self) -> &mut G {
        &mut self.group
    }
}

/// Overwrites every parameter with rank `SOURCE_RANK`'s, one broadcast per parameter.
///
/// Parameters not in standard layout are copied into it first, so every rank sends and receives
/// the elements in the same order.
async fn broadcast_parameters<M, G>(module: &mut M, group: &mut G) -> Result<()>
where
    M: Module,
    G: Collective + Send,
{
    for (index, param) in module.parameters_mut().into_iter().enumerate() {
        if !param.is_standard_layout() {
            *param = param.as_standard_layout().into_owned();
        }

        let buf = param
            .as_slice_mut()
            .ok_or(SpmdErr::NonContiguous { index })?;

        debug!("broadcasting parameter {index} of {} element(s)", buf.len());
        group.broadcast(buf, SOURCE_RANK).await?;
    }

    Ok(())
}
