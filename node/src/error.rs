use std::{error::Error, fmt, io};

use spmd::SpmdErr;

/// The node's result type.
pub type Result<T> = std::result::Result<T, NodeErr>;

/// Node runtime failures.
#[derive(Debug)]
pub enum NodeErr {
    Config(String),
    Spmd(SpmdErr),
    Io(io::Error),
}

impl fmt::Display for NodeErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeErr::Config(detail) => write!(f, "configuration error: {detail}"),
            NodeErr::Spmd(e) => write!(f, "spmd error: {e}"),
            NodeErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for NodeErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NodeErr::Spmd(e) => Some(e),
            NodeErr::Io(e) => Some(e),
            NodeErr::Config(_) => None,
        }
    }
}

impl From<SpmdErr> for NodeErr {
    fn from(value: SpmdErr) -> Self {
        Self::Spmd(value)
    }
}

impl From<io::Error> for NodeErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for the binary.
impl From<NodeErr> for io::Error {
    fn from(value: NodeErr) -> Self {
        match value {
            NodeErr::Io(e) | NodeErr::Spmd(SpmdErr::Collective(e)) => e,
            NodeErr::Config(_) => io::Error::new(io::ErrorKind::InvalidInput, value),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
