#![cfg(test)]

use std::{
    io,
    num::NonZeroUsize,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use comms::{Collective, SoloGroup};
use ndarray::{Array1, Array2};

use crate::{
    Args, CompiledModule, DeviceMesh, Distribute, DistributedGraph, Module, Placement, ReduceOp,
    Result, Schema, Spmd, SpmdErr, Tensor,
    distribute::GradSync,
    graph::Signature,
    nn::Linear,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Broadcast { len: usize, src: usize },
    AllReduce { len: usize },
}

/// Rank 0 of a group whose other ranks all hold the same data as this one.
struct RecordingGroup {
    world_size: usize,
    log: Arc<Mutex<Vec<Call>>>,
}

impl RecordingGroup {
    fn new(world_size: usize, log: Arc<Mutex<Vec<Call>>>) -> Self {
        Self { world_size, log }
    }
}

impl Collective for RecordingGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn broadcast(&mut self, buf: &mut [f32], src: usize) -> io::Result<()> {
        let len = buf.len();
        self.log.lock().unwrap().push(Call::Broadcast { len, src });
        Ok(())
    }

    async fn all_reduce_sum(&mut self, buf: &mut [f32]) -> io::Result<()> {
        let len = buf.len();
        self.log.lock().unwrap().push(Call::AllReduce { len });

        let world_size = self.world_size as f32;
        buf.iter_mut().for_each(|x| *x *= world_size);
        Ok(())
    }

    async fn barrier(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A group whose links are down.
struct BrokenGroup;

impl Collective for BrokenGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    async fn broadcast(&mut self, _buf: &mut [f32], _src: usize) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"))
    }

    async fn all_reduce_sum(&mut self, _buf: &mut [f32]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"))
    }

    async fn barrier(&mut self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"))
    }
}

/// A module with a single `(4, 4)` parameter that returns its first input.
#[derive(Debug)]
struct Identity {
    weight: Tensor,
}

impl Identity {
    fn new() -> Self {
        Self {
            weight: Tensor::zeros(vec![4, 4]),
        }
    }
}

impl Module for Identity {
    fn parameters(&self) -> Vec<&Tensor> {
        vec![&self.weight]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weight]
    }

    fn forward(&mut self, args: &Args) -> Result<Tensor> {
        Ok(args.get(0)?.clone())
    }
}

#[derive(Clone, Default)]
struct Counters {
    compilations: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
    compiled_with: Arc<Mutex<Vec<Signature>>>,
}

impl Counters {
    fn compilations(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Counts compilations, optionally failing the first one.
struct CountingDistributor {
    counters: Counters,
    fail_first: bool,
}

struct CountingCompiled {
    calls: Arc<AtomicUsize>,
}

impl<M: Module> Distribute<M> for CountingDistributor {
    type Compiled = CountingCompiled;

    fn distribute(
        &mut self,
        _graph: &mut DistributedGraph<M>,
        _schema: &Schema,
        _input_schemas: &[Placement],
        _expand_first_iter: bool,
        args: &Args,
    ) -> Result<CountingCompiled> {
        if self.fail_first {
            self.fail_first = false;
            return Err(SpmdErr::MissingInput { index: 0 });
        }

        self.counters.compilations.fetch_add(1, Ordering::SeqCst);
        self.counters
            .compiled_with
            .lock()
            .unwrap()
            .push(Signature::of(args));

        Ok(CountingCompiled {
            calls: self.counters.calls.clone(),
        })
    }
}

impl<M: Module> CompiledModule<M> for CountingCompiled {
    fn call(&mut self, _module: &mut M, args: &Args) -> Result<Tensor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(args.get(0)?.mapv(|x| x + 1.0))
    }

    async fn backward<G: Collective + Send>(
        &mut self,
        _module: &mut M,
        _grad_output: &Tensor,
        _group: &mut G,
    ) -> Result<Vec<Tensor>> {
        Ok(Vec::new())
    }
}

fn mesh(n: usize) -> DeviceMesh {
    DeviceMesh::new(NonZeroUsize::new(n).unwrap())
}

fn log() -> Arc<Mutex<Vec<Call>>> {
    Arc::new(Mutex::new(Vec::new()))
}

async fn counting_spmd(
    counters: &Counters,
    fail_first: bool,
) -> Spmd<Identity, RecordingGroup, CountingDistributor> {
    let distributor = CountingDistributor {
        counters: counters.clone(),
        fail_first,
    };

    Spmd::with_distributor(
        Identity::new(),
        Schema::replicate(mesh(1)),
        Vec::new(),
        false,
        RecordingGroup::new(1, log()),
        distributor,
    )
    .await
    .unwrap()
}

fn batch(rows: usize, cols: usize) -> Tensor {
    Array2::from_shape_fn((rows, cols), |(i, j)| (i * cols + j) as f32).into_dyn()
}

#[tokio::test]
async fn construction_rejects_anything_but_replicate() {
    let schemas = [
        vec![],
        vec![Placement::Shard(0)],
        vec![Placement::Partial(ReduceOp::Sum)],
        vec![Placement::Replicate, Placement::Shard(1)],
        vec![Placement::Replicate, Placement::Replicate],
    ];

    for placements in schemas {
        let log = log();
        let schema = Schema::new(mesh(2), placements.clone());
        let group = RecordingGroup::new(2, log.clone());

        let result = Spmd::new(Identity::new(), schema, Vec::new(), false, group).await;

        match result {
            Err(SpmdErr::UnsupportedPlacement { placements: got }) => assert_eq!(got, placements),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("{placements:?} was accepted"),
        }

        assert!(log.lock().unwrap().is_empty(), "broadcast before rejecting");
    }
}

#[tokio::test]
async fn construction_broadcasts_every_parameter_from_rank_zero() {
    let log = log();
    let group = RecordingGroup::new(2, log.clone());
    let schema = Schema::replicate(mesh(2));

    let spmd = Spmd::new(Linear::zeros((3, 2)), schema, Vec::new(), false, group)
        .await
        .unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            Call::Broadcast { len: 6, src: 0 },
            Call::Broadcast { len: 2, src: 0 },
        ]
    );
    assert!(!spmd.is_compiled());
}

#[tokio::test]
async fn construction_rejects_mesh_not_matching_group() {
    let group = RecordingGroup::new(3, log());
    let result = Spmd::new(
        Identity::new(),
        Schema::replicate(mesh(2)),
        Vec::new(),
        false,
        group,
    )
    .await;

    assert!(matches!(
        result,
        Err(SpmdErr::MeshMismatch { ranks, world_size: 3 }) if ranks == [0, 1]
    ));
}

#[tokio::test]
async fn construction_rejects_meshes_not_covering_the_group() {
    let meshes = [vec![0, 0], vec![1, 2], vec![0]];

    for ranks in meshes {
        let log = log();
        let schema = Schema::replicate(DeviceMesh::from_ranks(ranks.clone()));
        let group = RecordingGroup::new(2, log.clone());

        let result = Spmd::new(Identity::new(), schema, Vec::new(), false, group).await;

        assert!(
            matches!(&result, Err(SpmdErr::MeshMismatch { ranks: got, world_size: 2 }) if *got == ranks),
            "{ranks:?} was accepted"
        );
        assert!(log.lock().unwrap().is_empty());
    }

    let schema = Schema::replicate(DeviceMesh::from_ranks([1, 0]));
    let group = RecordingGroup::new(2, log());
    assert!(
        Spmd::new(Identity::new(), schema, Vec::new(), false, group)
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn column_major_parameters_are_broadcast() {
    let weight = Array2::from_shape_fn((2, 3), |(i, j)| (i * 3 + j) as f32).reversed_axes();
    let expected: Tensor = weight.clone().into_dyn();
    let layer = Linear::new(weight, Array1::zeros(2)).unwrap();
    assert!(!layer.weight().is_standard_layout());

    let log = log();
    let spmd = Spmd::new(
        layer,
        Schema::replicate(mesh(2)),
        Vec::new(),
        false,
        RecordingGroup::new(2, log.clone()),
    )
    .await
    .unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            Call::Broadcast { len: 6, src: 0 },
            Call::Broadcast { len: 2, src: 0 },
        ]
    );
    assert_eq!(spmd.module().weight(), &expected);
}

#[tokio::test]
async fn broadcast_failure_propagates() {
    let result = Spmd::new(
        Identity::new(),
        Schema::replicate(mesh(1)),
        Vec::new(),
        false,
        BrokenGroup,
    )
    .await;

    match result {
        Err(SpmdErr::Collective(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("construction succeeded over a broken group"),
    }
}

#[tokio::test]
async fn compiled_slot_is_filled_by_the_first_forward() {
    let counters = Counters::default();
    let mut spmd = counting_spmd(&counters, false).await;

    assert!(!spmd.is_compiled());
    spmd.forward(&Args::from(batch(4, 4))).unwrap();
    assert!(spmd.is_compiled());
}

#[tokio::test]
async fn compilation_happens_once_across_calls() {
    let counters = Counters::default();
    let mut spmd = counting_spmd(&counters, false).await;
    let args = Args::from(batch(4, 4));

    spmd.forward(&args).unwrap();
    spmd.forward(&args).unwrap();

    assert_eq!(counters.compilations(), 1);
    assert_eq!(counters.calls(), 2);
}

#[tokio::test]
async fn forward_returns_the_compiled_output_unchanged() {
    let counters = Counters::default();
    let mut spmd = counting_spmd(&counters, false).await;
    let x = batch(2, 3);

    let y = spmd.forward(&Args::from(x.clone())).unwrap();
    assert_eq!(y, x.mapv(|v| v + 1.0));
}

#[tokio::test]
async fn single_worker_scenario_never_recompiles() {
    let counters = Counters::default();
    let log = log();
    let distributor = CountingDistributor {
        counters: counters.clone(),
        fail_first: false,
    };

    let mut spmd = Spmd::with_distributor(
        Identity::new(),
        Schema::replicate(mesh(1)),
        Vec::new(),
        false,
        RecordingGroup::new(1, log.clone()),
        distributor,
    )
    .await
    .unwrap();

    assert_eq!(*log.lock().unwrap(), vec![Call::Broadcast { len: 16, src: 0 }]);

    let x = Args::from(batch(4, 4));
    spmd.forward(&x).unwrap();
    assert_eq!(counters.compilations(), 1);
    assert_eq!(counters.compiled_with.lock().unwrap()[0], Signature::of(&x));

    spmd.forward(&Args::from(batch(4, 4))).unwrap();
    assert_eq!(counters.compilations(), 1);

    let y = spmd.forward(&Args::from(batch(2, 8))).unwrap();
    assert_eq!(y.shape(), &[2, 8]);
    assert_eq!(counters.compilations(), 1);
    assert_eq!(counters.calls(), 3);
}

#[tokio::test]
async fn failed_compilation_leaves_the_slot_empty() {
    let counters = Counters::default();
    let mut spmd = counting_spmd(&counters, true).await;
    let args = Args::from(batch(4, 4));

    assert!(spmd.forward(&args).is_err());
    assert!(!spmd.is_compiled());
    assert_eq!(counters.calls(), 0);

    spmd.forward(&args).unwrap();
    assert!(spmd.is_compiled());
    assert_eq!(counters.compilations(), 1);
}

#[tokio::test]
async fn backward_requires_a_forward_first() {
    let mut spmd = Spmd::new(
        Linear::zeros((2, 1)),
        Schema::replicate(mesh(1)),
        Vec::new(),
        false,
        SoloGroup::new(),
    )
    .await
    .unwrap();

    let err = spmd.backward(&Tensor::ones(vec![1, 1])).await.unwrap_err();
    assert!(matches!(err, SpmdErr::NotCompiled));
}

#[tokio::test]
async fn backward_after_a_failed_forward_is_an_error() {
    let log = log();
    let mut spmd = Spmd::new(
        Linear::zeros((3, 2)),
        Schema::replicate(mesh(2)),
        Vec::new(),
        false,
        RecordingGroup::new(2, log.clone()),
    )
    .await
    .unwrap();

    let y = spmd.forward(&Args::from(batch(4, 3))).unwrap();
    assert!(spmd.forward(&Args::from(batch(4, 5))).is_err());

    log.lock().unwrap().clear();
    let err = spmd.backward(&Tensor::ones(y.raw_dim())).await.unwrap_err();
    assert!(matches!(err, SpmdErr::NoForwardPass));
    assert!(log.lock().unwrap().is_empty(), "stale gradients were reduced");
}

#[tokio::test]
async fn expand_first_iter_captures_the_backward_pass() {
    for expand in [false, true] {
        let mut spmd = Spmd::new(
            Linear::zeros((3, 2)),
            Schema::replicate(mesh(1)),
            Vec::new(),
            expand,
            SoloGroup::new(),
        )
        .await
        .unwrap();

        spmd.forward(&Args::from(batch(4, 3))).unwrap();

        let forward = spmd.graph().forward_trace().unwrap();
        assert_eq!(forward.output, vec![4, 2]);
        assert_eq!(forward.params, vec![vec![3, 2], vec![2]]);

        let backward = spmd.graph().backward_trace();
        assert_eq!(backward.is_some(), expand);
        if let Some(trace) = backward {
            assert_eq!(trace.grads, vec![vec![3, 2], vec![2]]);
        }
    }
}

#[tokio::test]
async fn expand_first_iter_fails_for_modules_without_backward() {
    let mut spmd = Spmd::new(
        Identity::new(),
        Schema::replicate(mesh(1)),
        Vec::new(),
        true,
        SoloGroup::new(),
    )
    .await
    .unwrap();

    let err = spmd.forward(&Args::from(batch(4, 4))).unwrap_err();
    assert!(matches!(err, SpmdErr::BackwardUnsupported));
    assert!(!spmd.is_compiled());
}

#[tokio::test]
async fn sharded_inputs_average_gradients_across_replicas() {
    let log = log();
    let mut spmd = Spmd::new(
        Linear::zeros((3, 2)),
        Schema::replicate(mesh(2)),
        Vec::new(),
        false,
        RecordingGroup::new(2, log.clone()),
    )
    .await
    .unwrap();

    let x = batch(4, 3);
    let y = spmd.forward(&Args::from(x.clone())).unwrap();
    assert_eq!(
        spmd.compiled().unwrap().grad_sync(),
        GradSync::AllReduceMean { replicas: 2 }
    );

    log.lock().unwrap().clear();
    let grad_output = Tensor::ones(y.raw_dim());
    let grads = spmd.backward(&grad_output).await.unwrap();

    // Every replica holds the same data, so the mean equals the local gradient.
    let mut local = Linear::zeros((3, 2));
    let expected = local.backward(&Args::from(x), &grad_output).unwrap();
    assert_eq!(grads, expected);
    assert_eq!(
        *log.lock().unwrap(),
        vec![Call::AllReduce { len: 6 }, Call::AllReduce { len: 2 }]
    );
}

#[tokio::test]
async fn replicated_inputs_keep_gradients_local() {
    let log = log();
    let mut spmd = Spmd::new(
        Linear::zeros((3, 2)),
        Schema::replicate(mesh(2)),
        vec![Placement::Replicate],
        false,
        RecordingGroup::new(2, log.clone()),
    )
    .await
    .unwrap();

    let y = spmd.forward(&Args::from(batch(4, 3))).unwrap();
    assert_eq!(spmd.compiled().unwrap().grad_sync(), GradSync::Local);

    log.lock().unwrap().clear();
    spmd.backward(&Tensor::ones(y.raw_dim())).await.unwrap();
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn input_schemas_are_validated_on_first_call() {
    let cases = [
        (
            vec![Placement::Replicate, Placement::Replicate],
            "count mismatch",
        ),
        (vec![Placement::Shard(2)], "shard dim out of range"),
        (vec![Placement::Partial(ReduceOp::Avg)], "partial input"),
    ];

    for (input_schemas, case) in cases {
        let mut spmd = Spmd::new(
            Linear::zeros((3, 2)),
            Schema::replicate(mesh(1)),
            input_schemas,
            false,
            SoloGroup::new(),
        )
        .await
        .unwrap();

        let err = spmd.forward(&Args::from(batch(4, 3))).unwrap_err();
        let expected = match case {
            "count mismatch" => matches!(
                err,
                SpmdErr::InputSchemaMismatch {
                    got: 2,
                    expected: 1
                }
            ),
            "shard dim out of range" => matches!(
                err,
                SpmdErr::InvalidShardDim {
                    index: 0,
                    dim: 2,
                    ndim: 2
                }
            ),
            _ => matches!(err, SpmdErr::UnsupportedInputPlacement { index: 0, .. }),
        };

        assert!(expected, "{case}: got {err}");
        assert!(!spmd.is_compiled());
    }
}

#[tokio::test]
async fn differently_shaped_calls_reuse_the_first_trace() {
    let mut spmd = Spmd::new(
        Linear::zeros((3, 2)),
        Schema::replicate(mesh(1)),
        Vec::new(),
        false,
        SoloGroup::new(),
    )
    .await
    .unwrap();

    let first = Args::from(batch(4, 3));
    spmd.forward(&first).unwrap();

    let y = spmd.forward(&Args::from(batch(7, 3))).unwrap();
    assert_eq!(y.shape(), &[7, 2]);

    let trace = spmd.compiled().unwrap().trace();
    assert_eq!(trace.inputs, Signature::of(&first));
    assert_eq!(spmd.graph().forward_trace(), Some(trace));

    // A shape the module itself can't handle surfaces as the module's error.
    let err = spmd.forward(&Args::from(batch(4, 5))).unwrap_err();
    assert!(matches!(err, SpmdErr::ShapeMismatch { what: "input", .. }));
}
