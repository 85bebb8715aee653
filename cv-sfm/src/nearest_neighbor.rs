use crate::{check_dimension, DescriptorElement, Result};

/// One candidate returned by a nearest neighbor query.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Neighbor<D> {
    /// Index of the candidate descriptor in the searched block.
    pub index: usize,
    /// Squared distance in the units of the element type.
    pub distance: D,
}

/// The best and second best candidates of a query.
///
/// `best` is `None` when the block has no candidates at all.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct NeighborResult<D> {
    pub best: Option<Neighbor<D>>,
    pub second: Option<Neighbor<D>>,
}

impl<D> NeighborResult<D> {
    /// The result of searching an empty block.
    pub fn no_match() -> Self {
        Self {
            best: None,
            second: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.best.is_some()
    }
}

/// Exhaustive nearest neighbor search over a borrowed, immutable block of descriptors.
///
/// The block is shared read-only, so one instance can serve queries from many threads.
#[derive(Debug, Clone)]
pub struct NearestNeighbor<'a, T: DescriptorElement> {
    dim: usize,
    elements: &'a [T],
    norms: Vec<T::Distance>,
}

impl<'a, T: DescriptorElement> NearestNeighbor<'a, T> {
    /// Wraps `elements`, a contiguous block of descriptors with `dim` components each.
    pub fn new(dim: usize, elements: &'a [T]) -> Result<Self> {
        check_dimension(dim)?;
        if elements.len() % dim != 0 {
            return Err(crate::SfmError::BlockLengthMismatch {
                len: elements.len(),
                dim,
            });
        }
        let norms = elements
            .chunks_exact(dim)
            .map(|c| T::inner_product(c, c))
            .collect();
        Ok(Self {
            dim,
            elements,
            norms,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_elements(&self) -> usize {
        self.norms.len()
    }

    /// Finds the nearest and second nearest candidate of `query`.
    ///
    /// Ties keep the lower index, so repeated searches are deterministic.
    /// A query of the wrong length matches nothing.
    pub fn find(&self, query: &[T]) -> NeighborResult<T::Distance> {
        if query.len() != self.dim {
            return NeighborResult::no_match();
        }
        let query_norm = T::inner_product(query, query);
        let mut result = NeighborResult::no_match();
        for (index, (candidate, &norm)) in self
            .elements
            .chunks_exact(self.dim)
            .zip(&self.norms)
            .enumerate()
        {
            let distance =
                T::squared_distance(query_norm, norm, T::inner_product(query, candidate));
            let neighbor = Neighbor { index, distance };
            match result.best {
                Some(best) if distance >= best.distance => {
                    if result.second.map_or(true, |second| distance < second.distance) {
                        result.second = Some(neighbor);
                    }
                }
                _ => {
                    result.second = result.best;
                    result.best = Some(neighbor);
                }
            }
        }
        result
    }
}
