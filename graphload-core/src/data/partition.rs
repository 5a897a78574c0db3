//! Partition planning
//!
//! Computes how many partitions a pass has, how large they are and in which
//! order the transport asks for them. Which element lands in which partition
//! is decided server-side from `(num_batches, seed)`; the plan only has to
//! hand every request the same pair so partitions stay disjoint.

use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::Sizing;
use crate::error::ConfigError;
use crate::schema::{AttrKind, ElementKind, GraphSchema};

/// One unit of the planned split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    /// Server-side partition identifier
    pub id: u32,
    /// Position of this partition in the request order
    pub position: usize,
}

/// The full split for one production pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    /// Filtered element count
    pub total: usize,
    pub batch_size: usize,
    pub num_batches: usize,
    pub shuffle: bool,
    /// Seed the server uses to assign elements; 0 keeps natural order
    pub seed: u64,
    /// Partitions in request order
    pub partitions: Vec<PartitionSpec>,
}

impl PartitionPlan {
    /// The whole filtered set in one partition
    pub fn is_single(&self) -> bool {
        self.num_batches == 1
    }

    pub fn ids(&self) -> Vec<u32> {
        self.partitions.iter().map(|p| p.id).collect()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// Plans partitions for one element kind
pub struct PartitionPlanner<'a> {
    schema: &'a GraphSchema,
    element: ElementKind,
    types: Vec<String>,
    filter_by: Option<String>,
}

impl<'a> PartitionPlanner<'a> {
    pub fn new(schema: &'a GraphSchema, element: ElementKind, types: Vec<String>) -> Self {
        Self {
            schema,
            element,
            types,
            filter_by: None,
        }
    }

    /// Gate inclusion on a boolean attribute present on every planned type
    pub fn filter_by(mut self, attribute: Option<&str>) -> Result<Self, ConfigError> {
        if let Some(attribute) = attribute {
            for type_name in &self.types {
                let kind = self
                    .schema
                    .attribute_kind(self.element, type_name, attribute)
                    .map_err(|_| ConfigError::UnknownFilterAttribute {
                        element_type: type_name.clone(),
                        attribute: attribute.to_string(),
                    })?;
                if kind != AttrKind::Bool {
                    return Err(ConfigError::FilterNotBoolean {
                        element_type: type_name.clone(),
                        attribute: attribute.to_string(),
                    });
                }
            }
            self.filter_by = Some(attribute.to_string());
        }
        Ok(self)
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter_by.as_deref()
    }

    pub fn types(&self) -> &[String] {
        &self.types
    }

    /// Plan a pass over `total` filtered elements
    pub fn plan(
        &self,
        total: usize,
        sizing: Sizing,
        shuffle: bool,
        seed: Option<u64>,
    ) -> Result<PartitionPlan, ConfigError> {
        plan(total, sizing, shuffle, seed)
    }
}

/// Plan a pass: resolve the derived sizing parameter and the request order.
///
/// - `BatchSize(b)`: `num_batches = ceil(total / b)`
/// - `NumBatches(n)`: `batch_size = ceil(total / n)`
///
/// Without shuffle the seed is 0 and partitions are requested in id order,
/// so repeated passes see identical contents in identical order. Partition
/// ids are `u32` on the wire; a split needing more fails.
pub fn plan(total: usize, sizing: Sizing, shuffle: bool, seed: Option<u64>) -> Result<PartitionPlan, ConfigError> {
    let (batch_size, num_batches) = match sizing {
        Sizing::BatchSize(size) => (size, total.div_ceil(size.max(1))),
        Sizing::NumBatches(count) => (total.div_ceil(count.max(1)), count),
    };

    let seed = if shuffle {
        seed.filter(|s| *s != 0)
            .unwrap_or_else(|| rand::thread_rng().gen_range(1..u64::MAX))
    } else {
        0
    };

    let last = u32::try_from(num_batches).map_err(|_| ConfigError::TooManyPartitions { num_batches })?;
    let mut ids: Vec<u32> = (0..last).collect();
    if shuffle {
        ids.shuffle(&mut StdRng::seed_from_u64(seed));
    }

    let partitions = ids
        .into_iter()
        .enumerate()
        .map(|(position, id)| PartitionSpec { id, position })
        .collect();

    debug!(
        "Planned {} partitions of up to {} rows over {} elements (shuffle={})",
        num_batches, batch_size, total, shuffle
    );

    Ok(PartitionPlan {
        total,
        batch_size,
        num_batches,
        shuffle,
        seed,
        partitions,
    })
}

/// Balanced contiguous range of partition `index` out of `num_batches`.
///
/// Partition sizes differ by at most one row and ranges are disjoint and
/// cover `0..total`.
pub fn partition_range(total: usize, num_batches: usize, index: usize) -> std::ops::Range<usize> {
    if num_batches == 0 {
        return 0..0;
    }
    let start = index * total / num_batches;
    let end = (index + 1) * total / num_batches;
    start..end.min(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_batches_derives_batch_size() {
        let plan = plan(2708, Sizing::NumBatches(10), false, None).unwrap();
        assert_eq!(plan.num_batches, 10);
        assert_eq!(plan.batch_size, 271);
        assert_eq!(plan.ids(), (0..10).collect::<Vec<_>>());
        assert_eq!(plan.seed, 0);
    }

    #[test]
    fn test_batch_size_derives_num_batches() {
        let plan = plan(1000, Sizing::BatchSize(300), false, None).unwrap();
        assert_eq!(plan.num_batches, 4);
        assert!(!plan.is_single());

        let single = super::plan(1000, Sizing::BatchSize(5000), false, None).unwrap();
        assert!(single.is_single());

        let empty = super::plan(0, Sizing::BatchSize(10), false, None).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_shuffle_covers_every_partition() {
        let plan = plan(100, Sizing::NumBatches(16), true, Some(7)).unwrap();
        let mut ids = plan.ids();
        ids.sort_unstable();
        assert_eq!(ids, (0..16).collect::<Vec<_>>());
        assert_eq!(plan.seed, 7);

        let again = super::plan(100, Sizing::NumBatches(16), true, Some(7)).unwrap();
        assert_eq!(plan, again);

        let random = super::plan(100, Sizing::NumBatches(16), true, None).unwrap();
        assert_ne!(random.seed, 0);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_partition_ids_must_fit_wire_range() {
        let num_batches = u32::MAX as usize + 1;
        assert_eq!(
            plan(10, Sizing::NumBatches(num_batches), false, None).unwrap_err(),
            ConfigError::TooManyPartitions { num_batches }
        );
    }

    #[test]
    fn test_partition_ranges_cover_total() {
        for (total, n) in [(2708, 10), (9, 6), (3, 5), (0, 3)] {
            let mut covered = 0;
            let mut next = 0;
            for i in 0..n {
                let range = partition_range(total, n, i);
                assert_eq!(range.start, next);
                next = range.end;
                covered += range.len();
            }
            assert_eq!(covered, total);
        }
    }

    #[test]
    fn test_filter_must_be_boolean() {
        let schema = GraphSchema::new("g").with_vertex(
            "Paper",
            &[("is_train", AttrKind::Bool), ("y", AttrKind::Int)],
        );
        let types = vec!["Paper".to_string()];

        let ok = PartitionPlanner::new(&schema, ElementKind::Vertex, types.clone())
            .filter_by(Some("is_train"));
        assert_eq!(ok.unwrap().filter(), Some("is_train"));

        let not_bool = PartitionPlanner::new(&schema, ElementKind::Vertex, types.clone())
            .filter_by(Some("y"));
        assert!(matches!(not_bool, Err(ConfigError::FilterNotBoolean { .. })));

        let missing = PartitionPlanner::new(&schema, ElementKind::Vertex, types)
            .filter_by(Some("is_val"));
        assert!(matches!(missing, Err(ConfigError::UnknownFilterAttribute { .. })));
    }
}
