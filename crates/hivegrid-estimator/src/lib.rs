//! hivegrid-estimator: resource demand estimation for HiveGrid policies.
//!
//! The [`ResourceDemandEstimator`] turns monitoring history stored in the
//! repository into capacity vectors: VM demand, local controller
//! active/used/free capacity, and group manager capacity from summaries.
//! The [`sort`] module orders entities by the L1 norm of those vectors.

pub mod aggregation;
pub mod error;
pub mod estimator;
pub mod sort;

pub use aggregation::{Aggregator, Average, MostRecent, Weighted};
pub use error::{EstimatorError, EstimatorResult};
pub use estimator::ResourceDemandEstimator;
pub use sort::{NormComparator, SortKey, SortOrder};
