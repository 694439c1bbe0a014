use crate::{
    Result, SpmdErr,
    module::{Module, Tensor},
};

/// Gradient descent optimization algorithm.
#[derive(Debug, Clone, Copy)]
pub struct GradientDescent {
    learning_rate: f32,
}

impl GradientDescent {
    /// Returns a new `GradientDescent`.
    ///
    /// # Arguments
    /// * `learning_rate` - The *length* of the steps taken on `step`.
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }

    /// Makes a step in the opposite direction of the gradient, with a length of `learning_rate`.
    ///
    /// # Arguments
    /// * `module` - The module whose parameters are updated.
    /// * `grads` - One gradient per parameter, in the module's parameter order.
    pub fn step<M: Module>(&self, module: &mut M, grads: &[Tensor]) -> Result<()> {
        let lr = self.learning_rate;
        let params = module.parameters_mut();

        if params.len() != grads.len() {
            return Err(SpmdErr::ShapeMismatch {
                what: "gradient count",
                got: vec![grads.len()],
                expected: vec![params.len()],
            });
        }

        for (param, grad) in params.into_iter().zip(grads) {
            if param.shape() != grad.shape() {
                return Err(SpmdErr::ShapeMismatch {
                    what: "gradient",
                    got: grad.shape().to_vec(),
                    expected: param.shape().to_vec(),
                });
            }

            param.zip_mut_with(grad, |w, g| *w -= lr * g);
        }

        Ok(())
    }
}
