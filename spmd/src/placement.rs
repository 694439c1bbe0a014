use std::{fmt, num::NonZeroUsize};

/// How partial values held by each rank combine into the full value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Avg,
}

/// How a tensor is laid out across the ranks of a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placement {
    /// Every rank holds the full, identical tensor.
    Replicate,
    /// Every rank holds one slice of the tensor along the given dim.
    Shard(usize),
    /// Every rank holds a partial value, the full tensor is their reduction.
    Partial(ReduceOp),
}

impl Placement {
    pub fn is_replicate(&self) -> bool {
        matches!(self, Placement::Replicate)
    }

    pub fn is_shard(&self) -> bool {
        matches!(self, Placement::Shard(_))
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Replicate => write!(f, "Replicate()"),
            Placement::Shard(dim) => write!(f, "Shard(dim={dim})"),
            Placement::Partial(op) => write!(f, "Partial({op:?})"),
        }
    }
}

/// The ordered ranks a schema spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMesh {
    ranks: Vec<usize>,
}

impl DeviceMesh {
    /// Creates a mesh over ranks `0..world_size`.
    pub fn new(world_size: NonZeroUsize) -> Self {
        Self {
            ranks: (0..world_size.get()).collect(),
        }
    }

    /// Creates a mesh over an explicit list of ranks.
    pub fn from_ranks<I>(ranks: I) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        Self {
            ranks: ranks.into_iter().collect(),
        }
    }

    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    pub fn contains(&self, rank: usize) -> bool {
        self.ranks.contains(&rank)
    }

    /// Whether the mesh is made of exactly the ranks `0..world_size`, each one once.
    pub fn covers(&self, world_size: usize) -> bool {
        self.size() == world_size && (0..world_size).all(|rank| self.contains(rank))
    }
}

/// The distribution schema of a module's parameters: a mesh plus one placement per mesh dim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    mesh: DeviceMesh,
    placements: Vec<Placement>,
}

impl Schema {
    /// Creates a new `Schema`.
    ///
    /// # Arguments
    /// * `mesh` - The ranks the parameters live on.
    /// * `placements` - How the parameters are laid out on the mesh.
    pub fn new(mesh: DeviceMesh, placements: Vec<Placement>) -> Self {
        Self { mesh, placements }
    }

    /// Creates a schema replicating the parameters on every rank of `mesh`.
    pub fn replicate(mesh: DeviceMesh) -> Self {
        Self::new(mesh, vec![Placement::Replicate])
    }

    pub fn mesh(&self) -> &DeviceMesh {
        &self.mesh
    }

    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    /// Whether the placements are exactly `[Replicate]`.
    pub fn is_replicate_only(&self) -> bool {
        self.placements == [Placement::Replicate]
    }
}
