// SPDX-License-Identifier: MPL-2.0

//! The Laplace mechanism, providing pure epsilon-DP for queries with bounded L1 sensitivity.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::distributions::{
    check_scale, round_to_multiple, LaplaceDistribution, NoiseDistribution,
};
use super::sensitivity::{Norm, SensitivityBounds};
use super::{
    check_confidence_level, check_epsilon, check_privacy_budget, ConfidenceInterval,
    MechanismError, NumericalMechanism, NumericalMechanismBuilder,
};

/// Smallest epsilon the Laplace mechanism accepts. Below it the diversity grows so large that
/// the noise drowns any aggregate.
const MIN_EPSILON: f64 = 1.0 / (1u64 << 50) as f64;

/// Adds Laplace noise with diversity `sensitivity / epsilon` to numeric values.
#[derive(Clone, Debug)]
pub struct LaplaceMechanism<D = LaplaceDistribution> {
    epsilon: f64,
    sensitivity: f64,
    diversity: f64,
    distribution: D,
}

impl LaplaceMechanism {
    /// Create a mechanism with L1 sensitivity `sensitivity`, drawing noise from a sampler seeded
    /// by the operating system.
    ///
    /// Unlike [`LaplaceMechanismBuilder`], this accepts a sensitivity of zero, in which case the
    /// mechanism adds no noise at all.
    pub fn new(epsilon: f64, sensitivity: f64) -> Result<Self, MechanismError> {
        Self::with_distribution(epsilon, sensitivity, LaplaceDistribution::new())
    }
}

impl<D> LaplaceMechanism<D>
where
    D: NoiseDistribution,
{
    /// Create a mechanism that draws its noise from `distribution`.
    pub fn with_distribution(
        epsilon: f64,
        sensitivity: f64,
        distribution: D,
    ) -> Result<Self, MechanismError> {
        let epsilon = check_epsilon(Some(epsilon))?;
        if epsilon < MIN_EPSILON {
            return Err(MechanismError::invalid_argument(format!(
                "Epsilon has to be at least 2^-50 but is {epsilon}"
            )));
        }
        if !sensitivity.is_finite() || sensitivity < 0.0 {
            return Err(MechanismError::invalid_argument(format!(
                "L1 sensitivity has to be finite and non-negative but is {sensitivity}"
            )));
        }
        let diversity = sensitivity / epsilon;
        check_scale(diversity)?;
        Ok(Self {
            epsilon,
            sensitivity,
            diversity,
            distribution,
        })
    }

    /// The L1 sensitivity the mechanism was calibrated to.
    pub fn sensitivity(&self) -> f64 {
        self.sensitivity
    }

    /// The scale of the noise added with the full budget, `sensitivity / epsilon`.
    pub fn diversity(&self) -> f64 {
        self.diversity
    }

    /// The sampler the mechanism draws from.
    pub fn distribution(&self) -> &D {
        &self.distribution
    }

    fn noised(&mut self, value: f64, scale: f64) -> f64 {
        if self.sensitivity == 0.0 {
            return value;
        }
        // Noise is a multiple of the granularity, so only the snapped input reaches the sum.
        let snapped = round_to_multiple(value, self.distribution.granularity(scale));
        snapped + self.distribution.sample(scale)
    }
}

impl<D> NumericalMechanism for LaplaceMechanism<D>
where
    D: NoiseDistribution,
{
    fn add_noise(&mut self, value: f64, privacy_budget: f64) -> Result<f64, MechanismError> {
        check_privacy_budget(privacy_budget)?;
        let scale = self.diversity / privacy_budget;
        check_scale(scale)?;
        Ok(self.noised(value, scale))
    }

    fn noised_value_above_threshold(&mut self, value: f64, threshold: f64) -> bool {
        self.noised(value, self.diversity) > threshold
    }

    fn noise_confidence_interval(
        &self,
        confidence_level: f64,
        privacy_budget: f64,
        noised_result: f64,
    ) -> Result<ConfidenceInterval, MechanismError> {
        check_confidence_level(confidence_level)?;
        check_privacy_budget(privacy_budget)?;
        let bound = (1.0 - confidence_level).ln() / self.epsilon / privacy_budget;
        Ok(ConfidenceInterval::new(
            noised_result + bound,
            noised_result - bound,
            confidence_level,
        ))
    }

    fn epsilon(&self) -> f64 {
        self.epsilon
    }
}

/// Configuration for a [`LaplaceMechanism`].
///
/// Either the L1 sensitivity or both the L0 and L∞ sensitivities have to be set, along with
/// epsilon. Nothing is checked until [`NumericalMechanismBuilder::build`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaplaceMechanismBuilder {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    epsilon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    l0_sensitivity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    l1_sensitivity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    linf_sensitivity: Option<f64>,
}

impl LaplaceMechanismBuilder {
    /// A builder with nothing set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the privacy loss parameter.
    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = Some(epsilon);
        self
    }

    /// Set the maximum number of records one individual can contribute to.
    pub fn l0_sensitivity(mut self, sensitivity: f64) -> Self {
        self.l0_sensitivity = Some(sensitivity);
        self
    }

    /// Set the bound on the L1 distance between neighboring aggregates.
    pub fn l1_sensitivity(mut self, sensitivity: f64) -> Self {
        self.l1_sensitivity = Some(sensitivity);
        self
    }

    /// Set the maximum magnitude of one record's contribution.
    pub fn linf_sensitivity(mut self, sensitivity: f64) -> Self {
        self.linf_sensitivity = Some(sensitivity);
        self
    }

    /// Build a mechanism that draws its noise from `distribution` instead of a fresh
    /// [`LaplaceDistribution`].
    pub fn build_with_distribution<D>(
        &self,
        distribution: D,
    ) -> Result<LaplaceMechanism<D>, MechanismError>
    where
        D: NoiseDistribution,
    {
        self.calibrate()
            .and_then(|(epsilon, sensitivity)| {
                LaplaceMechanism::with_distribution(epsilon, sensitivity, distribution)
            })
            .inspect(|mechanism| {
                debug!(
                    epsilon = mechanism.epsilon,
                    sensitivity = mechanism.sensitivity,
                    diversity = mechanism.diversity,
                    "built Laplace mechanism"
                )
            })
            .inspect_err(|error| debug!(%error, "rejected Laplace mechanism parameters"))
    }

    fn calibrate(&self) -> Result<(f64, f64), MechanismError> {
        let epsilon = check_epsilon(self.epsilon)?;
        let sensitivity = SensitivityBounds {
            l0: self.l0_sensitivity,
            direct: self.l1_sensitivity,
            l_inf: self.linf_sensitivity,
        }
        .resolve(Norm::L1)?;
        Ok((epsilon, sensitivity))
    }
}

impl NumericalMechanismBuilder for LaplaceMechanismBuilder {
    type Mechanism = LaplaceMechanism;

    fn build(&self) -> Result<LaplaceMechanism, MechanismError> {
        self.build_with_distribution(LaplaceDistribution::new())
    }
}
