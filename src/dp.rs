// SPDX-License-Identifier: MPL-2.0

//! Differential privacy (DP) noise mechanisms.
//!
//! There are two main traits defined in this module:
//!
//!  - `NumericalMechanism`: Implementors add calibrated noise to numeric aggregates and report
//!    confidence intervals for that noise.
//!    Examples: LaplaceMechanism, GaussianMechanism
//!
//!  - `NumericalMechanismBuilder`: Validates privacy parameters and sensitivities, and produces
//!    an immutable mechanism.
//!    Examples: LaplaceMechanismBuilder, GaussianMechanismBuilder
//!
//! Noise itself is drawn from a [`distributions::NoiseDistribution`], which a mechanism owns for
//! its whole lifetime.
//!
//! A mechanism does not track how much privacy budget its callers spend across calls. Each call
//! is charged only the fraction passed to it.
use serde::{Deserialize, Serialize};

/// Errors propagated by methods in this module.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum MechanismError {
    /// A privacy parameter, sensitivity or per-call argument was missing or out of range.
    #[error("{0}")]
    InvalidArgument(String),
}

impl MechanismError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        MechanismError::InvalidArgument(message.into())
    }

    /// The human-readable message carried by this error.
    pub fn message(&self) -> &str {
        match self {
            MechanismError::InvalidArgument(message) => message,
        }
    }
}

/// The range within which the noise added by a mechanism falls with probability
/// `confidence_level`, centered on a noised result.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    lower_bound: f64,
    upper_bound: f64,
    confidence_level: f64,
}

impl ConfidenceInterval {
    /// Construct an interval from its bounds and the level it was computed for.
    pub fn new(lower_bound: f64, upper_bound: f64, confidence_level: f64) -> Self {
        Self {
            lower_bound,
            upper_bound,
            confidence_level,
        }
    }

    /// Lower bound of the interval.
    pub fn lower_bound(&self) -> f64 {
        self.lower_bound
    }

    /// Upper bound of the interval.
    pub fn upper_bound(&self) -> f64 {
        self.upper_bound
    }

    /// Probability that the added noise lies within the interval.
    pub fn confidence_level(&self) -> f64 {
        self.confidence_level
    }
}

/// A noise mechanism calibrated to a fixed privacy loss and sensitivity.
///
/// Mechanisms are immutable after construction except for the random state of their sampler,
/// which is why noising methods take `&mut self`. Sharing one mechanism between threads needs
/// either external synchronization or one clone per thread.
pub trait NumericalMechanism {
    /// Add noise to `value`, spending the fraction `privacy_budget` (in (0, 1]) of the
    /// mechanism's calibrated privacy loss. The result is snapped to the sampler's granularity.
    fn add_noise(&mut self, value: f64, privacy_budget: f64) -> Result<f64, MechanismError>;

    /// Run one randomized trial of whether `value`, noised with the full budget, exceeds
    /// `threshold`.
    fn noised_value_above_threshold(&mut self, value: f64, threshold: f64) -> bool;

    /// The interval around `noised_result` that contains the noise added by a call with budget
    /// `privacy_budget` with probability `confidence_level`.
    fn noise_confidence_interval(
        &self,
        confidence_level: f64,
        privacy_budget: f64,
        noised_result: f64,
    ) -> Result<ConfidenceInterval, MechanismError>;

    /// The privacy loss parameter the mechanism was calibrated to.
    fn epsilon(&self) -> f64;

    /// Add noise to an integer-valued aggregate, rounding the noised value to the nearest
    /// integer. Results beyond the range of `i64` saturate.
    fn add_noise_to_integer(
        &mut self,
        value: i64,
        privacy_budget: f64,
    ) -> Result<i64, MechanismError> {
        let noised = self.add_noise(value as f64, privacy_budget)?;
        Ok(noised.round() as i64)
    }
}

/// Validates privacy parameters and produces a [`NumericalMechanism`].
pub trait NumericalMechanismBuilder {
    /// The mechanism this builder produces.
    type Mechanism: NumericalMechanism;

    /// Validate the configured parameters and build a mechanism with a freshly seeded sampler.
    /// The builder is left untouched and can build further, independent mechanisms.
    fn build(&self) -> Result<Self::Mechanism, MechanismError>;

    /// Like [`NumericalMechanismBuilder::build`], for callers generic over the mechanism family.
    fn build_boxed(&self) -> Result<Box<dyn NumericalMechanism>, MechanismError>
    where
        Self::Mechanism: 'static,
    {
        Ok(Box::new(self.build()?))
    }
}

/// Check that a per-call privacy budget lies in (0, 1].
pub(crate) fn check_privacy_budget(privacy_budget: f64) -> Result<(), MechanismError> {
    if privacy_budget > 0.0 && privacy_budget <= 1.0 {
        Ok(())
    } else {
        Err(MechanismError::invalid_argument(format!(
            "privacy_budget has to be in the interval (0, 1] but is {privacy_budget}"
        )))
    }
}

/// Check that a confidence level lies in (0, 1).
pub(crate) fn check_confidence_level(confidence_level: f64) -> Result<(), MechanismError> {
    if confidence_level > 0.0 && confidence_level < 1.0 {
        Ok(())
    } else {
        Err(MechanismError::invalid_argument(format!(
            "Confidence level has to be in the interval (0, 1) but is {confidence_level}"
        )))
    }
}

/// Check the epsilon a mechanism is built with: it must be set, positive and finite, in that
/// order of precedence.
pub(crate) fn check_epsilon(epsilon: Option<f64>) -> Result<f64, MechanismError> {
    let epsilon = epsilon.ok_or_else(|| {
        MechanismError::invalid_argument("Epsilon has to be set but is missing")
    })?;
    if epsilon <= 0.0 {
        return Err(MechanismError::invalid_argument(format!(
            "Epsilon has to be positive but is {epsilon}"
        )));
    }
    if !epsilon.is_finite() {
        return Err(MechanismError::invalid_argument(format!(
            "Epsilon has to be finite but is {epsilon}"
        )));
    }
    Ok(epsilon)
}

/// Check the delta a Gaussian mechanism is built with: it must be set, finite, and lie in (0, 1).
pub(crate) fn check_delta(delta: Option<f64>) -> Result<f64, MechanismError> {
    let delta = delta
        .ok_or_else(|| MechanismError::invalid_argument("Delta has to be set but is missing"))?;
    if !delta.is_finite() {
        return Err(MechanismError::invalid_argument(format!(
            "Delta has to be finite but is {delta}"
        )));
    }
    if delta <= 0.0 || delta >= 1.0 {
        return Err(MechanismError::invalid_argument(format!(
            "Delta has to be in the interval (0, 1) but is {delta}"
        )));
    }
    Ok(delta)
}

pub mod distributions;
pub mod gaussian;
pub mod laplace;
mod rand_bigint;
pub mod sensitivity;

pub use gaussian::{GaussianMechanism, GaussianMechanismBuilder};
pub use laplace::{LaplaceMechanism, LaplaceMechanismBuilder};
