//! Strategies collapsing a sample history into one value.
//!
//! Samples are always passed oldest first. An empty history aggregates to
//! zero for every strategy.

use hive_core::config::AggregationPolicy;

pub trait Aggregator: Send + Sync {
    fn aggregate(&self, values: &[f64]) -> f64;
}

/// Arithmetic mean.
#[derive(Debug, Clone, Copy, Default)]
pub struct Average;

impl Aggregator for Average {
    fn aggregate(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// The newest sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct MostRecent;

impl Aggregator for MostRecent {
    fn aggregate(&self, values: &[f64]) -> f64 {
        values.last().copied().unwrap_or(0.0)
    }
}

/// Weighted mean with weights `1, 2, .., n` from oldest to newest.
#[derive(Debug, Clone, Copy, Default)]
pub struct Weighted;

impl Aggregator for Weighted {
    fn aggregate(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let (sum, weights) = values
            .iter()
            .enumerate()
            .fold((0.0, 0.0), |(sum, weights), (i, v)| {
                let w = (i + 1) as f64;
                (sum + w * v, weights + w)
            });
        sum / weights
    }
}

pub fn aggregator_for(policy: AggregationPolicy) -> Box<dyn Aggregator> {
    match policy {
        AggregationPolicy::Average => Box::new(Average),
        AggregationPolicy::MostRecent => Box::new(MostRecent),
        AggregationPolicy::Weighted => Box::new(Weighted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_history_is_zero() {
        for policy in [
            AggregationPolicy::Average,
            AggregationPolicy::MostRecent,
            AggregationPolicy::Weighted,
        ] {
            assert_eq!(aggregator_for(policy).aggregate(&[]), 0.0);
        }
    }

    #[test]
    fn average() {
        assert_eq!(Average.aggregate(&[1.0, 2.0, 6.0]), 3.0);
    }

    #[test]
    fn most_recent_takes_last() {
        assert_eq!(MostRecent.aggregate(&[1.0, 2.0, 6.0]), 6.0);
    }

    #[test]
    fn weighted_favors_newest() {
        // (1*0 + 2*0 + 3*6) / 6
        assert_eq!(Weighted.aggregate(&[0.0, 0.0, 6.0]), 3.0);
        assert!(Weighted.aggregate(&[0.0, 10.0]) > Average.aggregate(&[0.0, 10.0]));
    }
}
