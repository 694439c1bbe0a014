mod linear;
mod loss;

pub use linear::Linear;
pub use loss::Mse;
