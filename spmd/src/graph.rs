//! Tracking of the original module and of what graph capture recorded about it.

use crate::{
    module::{Args, Module},
    placement::Placement,
};

/// The shapes of the arguments of a call, the key a compiled module is specialized to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    positional: Vec<Vec<usize>>,
    keyword: Vec<(String, Vec<usize>)>,
}

impl Signature {
    /// Reads the signature of `args`.
    pub fn of(args: &Args) -> Self {
        Self {
            positional: args
                .positional()
                .iter()
                .map(|t| t.shape().to_vec())
                .collect(),
            keyword: args
                .keyword()
                .iter()
                .map(|(name, t)| (name.clone(), t.shape().to_vec()))
                .collect(),
        }
    }

    pub fn positional(&self) -> &[Vec<usize>] {
        &self.positional
    }

    pub fn keyword(&self) -> &[(String, Vec<usize>)] {
        &self.keyword
    }
}

/// What tracing the forward pass on the first call recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardTrace {
    pub inputs: Signature,
    /// The effective placement of every positional input.
    pub placements: Vec<Placement>,
    pub params: Vec<Vec<usize>>,
    pub output: Vec<usize>,
}

/// What tracing the backward pass of `sum(output)` recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct BackwardTrace {
    pub grads: Vec<Vec<usize>>,
}

/// Keeps the original module together with the graphs captured from it.
#[derive(Debug)]
pub struct DistributedGraph<M: Module> {
    orig_module: M,
    forward: Option<ForwardTrace>,
    backward: Option<BackwardTrace>,
}

impl<M: Module> DistributedGraph<M> {
    /// Creates a new `DistributedGraph` that hasn't captured anything yet.
    pub fn new(orig_module: M) -> Self {
        Self {
            orig_module,
            forward: None,
            backward: None,
        }
    }

    pub fn module(&self) -> &M {
        &self.orig_module
    }

    pub fn module_mut(&mut self) -> &mut M {
        &mut self.orig_module
    }

    pub fn into_module(self) -> M {
        self.orig_module
    }

    pub fn forward_trace(&self) -> Option<&ForwardTrace> {
        self.forward.as_ref()
    }

    pub fn backward_trace(&self) -> Option<&BackwardTrace> {
        self.backward.as_ref()
    }

    pub fn record_forward(&mut self, trace: ForwardTrace) {
        self.forward = Some(trace);
    }

    pub fn record_backward(&mut self, trace: BackwardTrace) {
        self.backward = Some(trace);
    }
}
