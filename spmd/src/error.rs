use std::{error::Error, fmt, io};

use crate::placement::Placement;

/// The result type used in the entire spmd module.
pub type Result<T> = std::result::Result<T, SpmdErr>;

/// The spmd module's error type.
#[derive(Debug)]
pub enum SpmdErr {
    /// The parameter schema is not exactly `[Replicate]`.
    UnsupportedPlacement {
        placements: Vec<Placement>,
    },
    /// The schema's mesh is not made of exactly the ranks `0..world_size` of the group.
    MeshMismatch {
        ranks: Vec<usize>,
        world_size: usize,
    },
    UnsupportedInputPlacement {
        index: usize,
        placement: Placement,
    },
    InputSchemaMismatch {
        got: usize,
        expected: usize,
    },
    InvalidShardDim {
        index: usize,
        dim: usize,
        ndim: usize,
    },
    MissingInput {
        index: usize,
    },
    ShapeMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    NonContiguous {
        index: usize,
    },
    BackwardUnsupported,
    NotCompiled,
    /// The last forward pass failed, there's nothing to differentiate.
    NoForwardPass,
    Collective(io::Error),
}

impl fmt::Display for SpmdErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpmdErr::UnsupportedPlacement { placements } => write!(
                f,
                "only [Replicate] parameter placements are supported, got {placements:?}"
            ),
            SpmdErr::MeshMismatch { ranks, world_size } => write!(
                f,
                "the schema's mesh spans ranks {ranks:?} but the group has ranks 0..{world_size}"
            ),
            SpmdErr::UnsupportedInputPlacement { index, placement } => {
                write!(f, "input {index} can't be placed as {placement}")
            }
            SpmdErr::InputSchemaMismatch { got, expected } => write!(
                f,
                "got {got} input schema(s) for {expected} positional input(s)"
            ),
            SpmdErr::InvalidShardDim { index, dim, ndim } => write!(
                f,
                "input {index} is sharded on dim {dim} but only has {ndim} dim(s)"
            ),
            SpmdErr::MissingInput { index } => write!(f, "missing positional input {index}"),
            SpmdErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "there's a shape mismatch in {what}, got {got:?} and expected {expected:?}"
            ),
            SpmdErr::NonContiguous { index } => {
                write!(f, "parameter {index} is not laid out contiguously")
            }
            SpmdErr::BackwardUnsupported => write!(f, "the module has no backward pass"),
            SpmdErr::NotCompiled => {
                write!(f, "the module isn't compiled yet, forward must be called first")
            }
            SpmdErr::NoForwardPass => {
                write!(f, "backward requires the last forward pass to have succeeded")
            }
            SpmdErr::Collective(e) => write!(f, "collective failed: {e}"),
        }
    }
}

impl Error for SpmdErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SpmdErr::Collective(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SpmdErr {
    fn from(value: io::Error) -> Self {
        Self::Collective(value)
    }
}
