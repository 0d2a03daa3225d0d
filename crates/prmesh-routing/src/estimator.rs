//! Link cost estimation
//!
//! Costs come from a bounded Bernoulli sampling process that stands in for a
//! real link metric such as expected transmission count. The cost to a
//! candidate is the number of successes over a fixed number of trials, each
//! succeeding with probability `min(1, cost_parameter / distance)`.

use crate::error::{Result, RoutingError};
use crate::types::{Address, NodeId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Default number of Bernoulli trials per estimate
pub const DEFAULT_TRIALS: u32 = 100;

/// Produces a scalar cost for reaching `candidate` from `local`
pub trait CostEstimator: Send {
    fn estimate(&mut self, local: Address, candidate: Address) -> Result<f64>;
}

/// Reject cost parameters the sampling process is not defined for
pub fn validate_cost_parameter(cost_parameter: f64) -> Result<()> {
    if !cost_parameter.is_finite() {
        return Err(RoutingError::Configuration(format!(
            "cost parameter must be finite, got {}",
            cost_parameter
        )));
    }
    if cost_parameter < 0.0 {
        return Err(RoutingError::Configuration(format!(
            "cost parameter must be >= 0, got {}",
            cost_parameter
        )));
    }
    Ok(())
}

/// Per-trial success probability for a candidate `distance` away
///
/// Zero distance means the same endpoint and yields zero.
pub fn success_probability(distance: u32, cost_parameter: f64) -> f64 {
    if distance == 0 {
        return 0.0;
    }
    let inverse_distance = 1.0 / f64::from(distance);
    (cost_parameter * inverse_distance).clamp(0.0, 1.0)
}

/// Derive a node-local seed from a deployment-wide seed
///
/// Nodes sharing a deployment seed still draw independent streams.
pub fn node_seed(base: u64, node: NodeId) -> u64 {
    base ^ u64::from(node.as_u32()).wrapping_add(1).wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

/// Bernoulli-trial cost estimator with a node-local generator
#[derive(Debug)]
pub struct BernoulliEstimator {
    cost_parameter: f64,
    trials: u32,
    rng: StdRng,
}

impl BernoulliEstimator {
    /// Create an estimator with a fixed seed
    pub fn new(cost_parameter: f64, trials: u32, seed: u64) -> Result<Self> {
        validate_cost_parameter(cost_parameter)?;
        if trials == 0 {
            return Err(RoutingError::Configuration(
                "trial count must be at least 1".to_string(),
            ));
        }

        Ok(BernoulliEstimator {
            cost_parameter,
            trials,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Create an estimator seeded from OS entropy
    pub fn from_entropy(cost_parameter: f64, trials: u32) -> Result<Self> {
        Self::new(cost_parameter, trials, rand::random())
    }

    /// Count successes over all trials for a candidate `distance` away
    pub fn sample(&mut self, distance: u32) -> u32 {
        let p = success_probability(distance, self.cost_parameter);
        if p <= 0.0 {
            return 0;
        }
        if p >= 1.0 {
            return self.trials;
        }

        let mut successes = 0;
        for _ in 0..self.trials {
            if self.rng.gen_bool(p) {
                successes += 1;
            }
        }
        successes
    }
}

impl CostEstimator for BernoulliEstimator {
    fn estimate(&mut self, local: Address, candidate: Address) -> Result<f64> {
        Ok(f64::from(self.sample(local.distance(&candidate))))
    }
}
