use std::collections::BTreeMap;

use ndarray::ArrayD;

use crate::{Result, SpmdErr};

/// The tensor type every module computes with.
pub type Tensor = ArrayD<f32>;

/// The arguments of a module call: positional tensors plus keyword tensors ordered by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    positional: Vec<Tensor>,
    keyword: BTreeMap<String, Tensor>,
}

impl Args {
    /// Creates an empty `Args`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument.
    pub fn arg(mut self, tensor: Tensor) -> Self {
        self.positional.push(tensor);
        self
    }

    /// Sets a keyword argument, replacing a previous one with the same name.
    pub fn kwarg<S: Into<String>>(mut self, name: S, tensor: Tensor) -> Self {
        self.keyword.insert(name.into(), tensor);
        self
    }

    pub fn positional(&self) -> &[Tensor] {
        &self.positional
    }

    pub fn keyword(&self) -> &BTreeMap<String, Tensor> {
        &self.keyword
    }

    /// Returns the `index`-th positional argument.
    ///
    /// # Errors
    /// `SpmdErr::MissingInput` if there are not that many positional arguments.
    pub fn get(&self, index: usize) -> Result<&Tensor> {
        self.positional
            .get(index)
            .ok_or(SpmdErr::MissingInput { index })
    }
}

impl From<Vec<Tensor>> for Args {
    fn from(positional: Vec<Tensor>) -> Self {
        Self {
            positional,
            keyword: BTreeMap::new(),
        }
    }
}

impl From<Tensor> for Args {
    fn from(value: Tensor) -> Self {
        Self::from(vec![value])
    }
}

/// A computation with learnable parameters that can be distributed.
pub trait Module: Send {
    /// The parameters of the module, always in the same order.
    fn parameters(&self) -> Vec<&Tensor>;

    /// Mutable access to the parameters, in the same order as `parameters`.
    fn parameters_mut(&mut self) -> Vec<&mut Tensor>;

    /// Makes a forward pass.
    ///
    /// # Arguments
    /// * `args` - The call's arguments.
    ///
    /// # Returns
    /// The module's output or an error if occurred.
    fn forward(&mut self, args: &Args) -> Result<Tensor>;

    /// Computes the gradient of the parameters given the gradient of the output of a forward pass
    /// made with `args`. Must not accumulate into the module's state.
    ///
    /// # Arguments
    /// * `args` - The arguments of the forward pass being differentiated.
    /// * `grad_output` - The gradient of the loss with respect to the output.
    ///
    /// # Returns
    /// One gradient per parameter, in the same order as `parameters`.
    fn backward(&mut self, args: &Args, grad_output: &Tensor) -> Result<Vec<Tensor>> {
        let _ = (args, grad_output);
        Err(SpmdErr::BackwardUnsupported)
    }
}
