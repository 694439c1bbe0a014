use ndarray::{Array1, Array2, ArrayView2, Axis, Ix1, Ix2};
use ndarray_rand::{RandomExt, rand_distr::StandardNormal};
use rand::Rng;

use crate::{
    Result, SpmdErr,
    module::{Args, Module, Tensor},
};

/// A fully connected layer: `y = x · w + b` for an input of shape `(batch, in)`.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Tensor,
    bias: Tensor,
}

impl Linear {
    /// Creates a new `Linear` out of its weights and biases.
    ///
    /// # Arguments
    /// * `weight` - The weights, of shape `(in, out)`.
    /// * `bias` - The biases, of shape `(out)`.
    ///
    /// # Returns
    /// A new `Linear` or an error if the biases don't match the weights' output dim.
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if bias.len() != weight.ncols() {
            return Err(SpmdErr::ShapeMismatch {
                what: "bias",
                got: bias.shape().to_vec(),
                expected: vec![weight.ncols()],
            });
        }

        Ok(Self {
            weight: weight.into_dyn(),
            bias: bias.into_dyn(),
        })
    }

    /// Creates a `Linear` with every parameter set to zero.
    pub fn zeros(dim: (usize, usize)) -> Self {
        Self {
            weight: Tensor::zeros(vec![dim.0, dim.1]),
            bias: Tensor::zeros(vec![dim.1]),
        }
    }

    /// Creates a `Linear` with normally distributed weights scaled by `1 / sqrt(in)` and zero biases.
    ///
    /// # Arguments
    /// * `dim` - The `(in, out)` dims of the layer.
    /// * `rng` - The source of randomness.
    pub fn random<R: Rng + ?Sized>(dim: (usize, usize), rng: &mut R) -> Self {
        let scale = 1.0 / (dim.0.max(1) as f32).sqrt();
        let weight = Array2::<f32>::random_using(dim, StandardNormal, rng) * scale;

        Self {
            weight: weight.into_dyn(),
            bias: Tensor::zeros(vec![dim.1]),
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    fn weight_view(&self) -> Result<ArrayView2<'_, f32>> {
        as_matrix(&self.weight, "weight")
    }

    /// Views the first positional argument as a `(batch, in)` matrix.
    fn input<'a>(&self, args: &'a Args) -> Result<ArrayView2<'a, f32>> {
        let x = as_matrix(args.get(0)?, "input")?;
        let fan_in = self.weight.shape()[0];

        if x.ncols() != fan_in {
            return Err(SpmdErr::ShapeMismatch {
                what: "input",
                got: x.shape().to_vec(),
                expected: vec![x.nrows(), fan_in],
            });
        }

        Ok(x)
    }
}

impl Module for Linear {
    fn parameters(&self) -> Vec<&Tensor> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weight, &mut self.bias]
    }

    fn forward(&mut self, args: &Args) -> Result<Tensor> {
        let x = self.input(args)?;
        let w = self.weight_view()?;
        let b = self
            .bias
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|_| SpmdErr::ShapeMismatch {
                what: "bias",
                got: self.bias.shape().to_vec(),
                expected: vec![w.ncols()],
            })?;

        let z = x.dot(&w) + &b;
        Ok(z.into_dyn())
    }

    fn backward(&mut self, args: &Args, grad_output: &Tensor) -> Result<Vec<Tensor>> {
        let x = self.input(args)?;
        let d = as_matrix(grad_output, "output gradient")?;
        let fan_out = self.bias.len();

        if d.dim() != (x.nrows(), fan_out) {
            return Err(SpmdErr::ShapeMismatch {
                what: "output gradient",
                got: d.shape().to_vec(),
                expected: vec![x.nrows(), fan_out],
            });
        }

        let dw = x.t().dot(&d);
        let db = d.sum_axis(Axis(0));

        Ok(vec![dw.into_dyn(), db.into_dyn()])
    }
}

fn as_matrix<'a>(tensor: &'a Tensor, what: &'static str) -> Result<ArrayView2<'a, f32>> {
    tensor
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| SpmdErr::ShapeMismatch {
            what,
            got: tensor.shape().to_vec(),
            expected: vec![0, 0],
        })
}
