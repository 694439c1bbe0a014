use crate::{Result, SpmdErr, module::Tensor};

/// Mean squared error loss function.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mse;

impl Mse {
    /// Returns a new `Mse`.
    pub fn new() -> Self {
        Self
    }

    /// Computes the loss of a prediction.
    ///
    /// # Arguments
    /// * `y_pred` - The module's output.
    /// * `y` - The expected output.
    pub fn loss(&self, y_pred: &Tensor, y: &Tensor) -> Result<f32> {
        check_shapes(y_pred, y)?;

        Ok((y_pred - y)
            .mapv(|x| x.powi(2))
            .mean()
            .unwrap_or_default())
    }

    /// Computes the gradient of the loss with respect to the prediction.
    pub fn loss_prime(&self, y_pred: &Tensor, y: &Tensor) -> Result<Tensor> {
        check_shapes(y_pred, y)?;
        Ok((y_pred - y) * (2.0 / y_pred.len().max(1) as f32))
    }
}

fn check_shapes(y_pred: &Tensor, y: &Tensor) -> Result<()> {
    if y_pred.shape() != y.shape() {
        return Err(SpmdErr::ShapeMismatch {
            what: "loss target",
            got: y.shape().to_vec(),
            expected: y_pred.shape().to_vec(),
        });
    }

    Ok(())
}
