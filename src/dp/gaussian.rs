// SPDX-License-Identifier: MPL-2.0

//! The Gaussian mechanism, providing (epsilon, delta)-DP for queries with bounded L2
//! sensitivity.
//!
//! The noise is calibrated with the analytic Gaussian mechanism of [[BW18]], which finds the
//! smallest standard deviation meeting the privacy guarantee exactly rather than through the
//! classical tail bound. That bound is loose, and only valid for epsilon below one.
//!
//! [BW18]: https://arxiv.org/pdf/1805.06530.pdf

use std::f64::consts::SQRT_2;

use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use tracing::debug;

use super::distributions::{
    check_scale, round_to_multiple, GaussianDistribution, NoiseDistribution,
};
use super::sensitivity::{Norm, SensitivityBounds};
use super::{
    check_confidence_level, check_delta, check_epsilon, check_privacy_budget, ConfidenceInterval,
    MechanismError, NumericalMechanism, NumericalMechanismBuilder,
};

/// Relative accuracy to which [`calculate_stddev`] resolves the standard deviation.
const SIGMA_ACCURACY: f64 = 1e-3;

fn standard_normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / SQRT_2)
}

/// The smallest delta for which Gaussian noise with standard deviation `sigma` gives
/// (epsilon, delta)-DP to a query with unit L2 sensitivity (Theorem 8 of [[BW18]]).
///
/// [BW18]: https://arxiv.org/pdf/1805.06530.pdf
fn calculate_delta(sigma: f64, epsilon: f64) -> f64 {
    let a = 1.0 / (2.0 * sigma);
    let b = epsilon * sigma;
    let tail = standard_normal_cdf(-a - b);
    let growth = epsilon.exp();
    let scaled_tail = if tail == 0.0 {
        0.0
    } else if growth.is_finite() {
        growth * tail
    } else {
        // e^epsilon alone overflows, but its product with a tiny tail may not.
        (epsilon + tail.ln()).exp()
    };
    standard_normal_cdf(a - b) - scaled_tail
}

/// The standard deviation of Gaussian noise that gives (epsilon, delta)-DP to a query with unit
/// L2 sensitivity. Noise for a query with sensitivity `s` needs `s` times as much.
///
/// The bound is bracketed by doubling from one, then bisected until the bracket is within a
/// relative accuracy of 10^-3. The upper end of the bracket is returned, so the result always
/// satisfies the guarantee. The result is finite for any epsilon and delta in the ranges the
/// mechanism accepts, however extreme.
pub fn calculate_stddev(epsilon: f64, delta: f64) -> f64 {
    let mut lower = 0.0;
    let mut upper = 1.0;
    while calculate_delta(upper, epsilon) > delta {
        lower = upper;
        upper *= 2.0;
    }
    while upper - lower > SIGMA_ACCURACY * lower {
        let middle = lower * 0.5 + upper * 0.5;
        if middle <= lower || middle >= upper {
            // The bracket cannot shrink any further in floating point.
            break;
        }
        if calculate_delta(middle, epsilon) > delta {
            lower = middle;
        } else {
            upper = middle;
        }
    }
    upper
}

/// Adds Gaussian noise calibrated to epsilon, delta and the L2 sensitivity to numeric values.
#[derive(Clone, Debug)]
pub struct GaussianMechanism<D = GaussianDistribution> {
    epsilon: f64,
    delta: f64,
    l2_sensitivity: f64,
    stddev: f64,
    distribution: D,
}

impl GaussianMechanism {
    /// Create a mechanism drawing noise from a sampler seeded by the operating system.
    ///
    /// Unlike [`GaussianMechanismBuilder`], this accepts an L2 sensitivity of zero, in which case
    /// the mechanism adds no noise at all.
    pub fn new(epsilon: f64, delta: f64, l2_sensitivity: f64) -> Result<Self, MechanismError> {
        Self::with_distribution(epsilon, delta, l2_sensitivity, GaussianDistribution::new())
    }

    /// See [`calculate_stddev`].
    pub fn calculate_stddev(epsilon: f64, delta: f64) -> f64 {
        calculate_stddev(epsilon, delta)
    }
}

impl<D> GaussianMechanism<D>
where
    D: NoiseDistribution,
{
    /// Create a mechanism that draws its noise from `distribution`.
    pub fn with_distribution(
        epsilon: f64,
        delta: f64,
        l2_sensitivity: f64,
        distribution: D,
    ) -> Result<Self, MechanismError> {
        let epsilon = check_epsilon(Some(epsilon))?;
        let delta = check_delta(Some(delta))?;
        if !l2_sensitivity.is_finite() || l2_sensitivity < 0.0 {
            return Err(MechanismError::invalid_argument(format!(
                "L2 sensitivity has to be finite and non-negative but is {l2_sensitivity}"
            )));
        }
        let stddev = calculate_stddev(epsilon, delta) * l2_sensitivity;
        check_scale(stddev)?;
        Ok(Self {
            epsilon,
            delta,
            l2_sensitivity,
            stddev,
            distribution,
        })
    }

    /// The delta the mechanism was calibrated to.
    pub fn delta(&self) -> f64 {
        self.delta
    }

    /// The L2 sensitivity the mechanism was calibrated to.
    pub fn l2_sensitivity(&self) -> f64 {
        self.l2_sensitivity
    }

    /// The standard deviation of the noise added with the full budget.
    pub fn stddev(&self) -> f64 {
        self.stddev
    }

    /// The sampler the mechanism draws from.
    pub fn distribution(&self) -> &D {
        &self.distribution
    }

    /// Clamp `value` to `[-bound, bound]`, then add noise as [`NumericalMechanism::add_noise`]
    /// does.
    pub fn add_noise_clamped(
        &mut self,
        value: f64,
        bound: f64,
        privacy_budget: f64,
    ) -> Result<f64, MechanismError> {
        if !bound.is_finite() || bound < 0.0 {
            return Err(MechanismError::invalid_argument(format!(
                "Clamping bound has to be finite and non-negative but is {bound}"
            )));
        }
        self.add_noise(value.clamp(-bound, bound), privacy_budget)
    }

    /// A call spending the fraction `privacy_budget` is calibrated to epsilon and delta both
    /// scaled by that fraction.
    fn stddev_for_budget(&self, privacy_budget: f64) -> f64 {
        if privacy_budget == 1.0 {
            self.stddev
        } else {
            calculate_stddev(self.epsilon * privacy_budget, self.delta * privacy_budget)
                * self.l2_sensitivity
        }
    }

    fn noised(&mut self, value: f64, stddev: f64) -> f64 {
        if self.l2_sensitivity == 0.0 {
            return value;
        }
        // Noise is a multiple of the granularity, so only the snapped input reaches the sum.
        let snapped = round_to_multiple(value, self.distribution.granularity(stddev));
        snapped + self.distribution.sample(stddev)
    }
}

impl<D> NumericalMechanism for GaussianMechanism<D>
where
    D: NoiseDistribution,
{
    fn add_noise(&mut self, value: f64, privacy_budget: f64) -> Result<f64, MechanismError> {
        check_privacy_budget(privacy_budget)?;
        let stddev = self.stddev_for_budget(privacy_budget);
        check_scale(stddev)?;
        Ok(self.noised(value, stddev))
    }

    fn noised_value_above_threshold(&mut self, value: f64, threshold: f64) -> bool {
        self.noised(value, self.stddev) > threshold
    }

    fn noise_confidence_interval(
        &self,
        confidence_level: f64,
        privacy_budget: f64,
        noised_result: f64,
    ) -> Result<ConfidenceInterval, MechanismError> {
        check_confidence_level(confidence_level)?;
        check_privacy_budget(privacy_budget)?;
        let stddev = self.stddev_for_budget(privacy_budget);
        check_scale(stddev)?;
        let bound = self
            .distribution
            .quantile((1.0 + confidence_level) / 2.0, stddev);
        Ok(ConfidenceInterval::new(
            noised_result - bound,
            noised_result + bound,
            confidence_level,
        ))
    }

    fn epsilon(&self) -> f64 {
        self.epsilon
    }
}

/// Configuration for a [`GaussianMechanism`].
///
/// Epsilon, delta, and either the L2 sensitivity or both the L0 and L∞ sensitivities have to be
/// set. Nothing is checked until [`NumericalMechanismBuilder::build`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GaussianMechanismBuilder {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    epsilon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    l0_sensitivity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    l2_sensitivity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    linf_sensitivity: Option<f64>,
}

impl GaussianMechanismBuilder {
    /// A builder with nothing set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the privacy loss parameter.
    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = Some(epsilon);
        self
    }

    /// Set the probability with which the epsilon guarantee may fail.
    pub fn delta(mut self, delta: f64) -> Self {
        self.delta = Some(delta);
        self
    }

    /// Set the maximum number of records one individual can contribute to.
    pub fn l0_sensitivity(mut self, sensitivity: f64) -> Self {
        self.l0_sensitivity = Some(sensitivity);
        self
    }

    /// Set the bound on the L2 distance between neighboring aggregates.
    pub fn l2_sensitivity(mut self, sensitivity: f64) -> Self {
        self.l2_sensitivity = Some(sensitivity);
        self
    }

    /// Set the maximum magnitude of one record's contribution.
    pub fn linf_sensitivity(mut self, sensitivity: f64) -> Self {
        self.linf_sensitivity = Some(sensitivity);
        self
    }

    /// Build a mechanism that draws its noise from `distribution` instead of a fresh
    /// [`GaussianDistribution`].
    pub fn build_with_distribution<D>(
        &self,
        distribution: D,
    ) -> Result<GaussianMechanism<D>, MechanismError>
    where
        D: NoiseDistribution,
    {
        self.calibrate()
            .and_then(|(epsilon, delta, l2_sensitivity)| {
                GaussianMechanism::with_distribution(epsilon, delta, l2_sensitivity, distribution)
            })
            .inspect(|mechanism| {
                debug!(
                    epsilon = mechanism.epsilon,
                    delta = mechanism.delta,
                    l2_sensitivity = mechanism.l2_sensitivity,
                    stddev = mechanism.stddev,
                    "built Gaussian mechanism"
                )
            })
            .inspect_err(|error| debug!(%error, "rejected Gaussian mechanism parameters"))
    }

    fn calibrate(&self) -> Result<(f64, f64, f64), MechanismError> {
        let epsilon = check_epsilon(self.epsilon)?;
        let delta = check_delta(self.delta)?;
        let l2_sensitivity = SensitivityBounds {
            l0: self.l0_sensitivity,
            direct: self.l2_sensitivity,
            l_inf: self.linf_sensitivity,
        }
        .resolve(Norm::L2)?;
        Ok((epsilon, delta, l2_sensitivity))
    }
}

impl NumericalMechanismBuilder for GaussianMechanismBuilder {
    type Mechanism = GaussianMechanism;

    fn build(&self) -> Result<GaussianMechanism, MechanismError> {
        self.build_with_distribution(GaussianDistribution::new())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::dp::distributions::{
        gaussian_quantile, granularity_for_scale,
        test_utils::{FixedNoise, NoiseFamily},
    };
    use crate::dp::test_support::count_events;

    fn build_error(builder: GaussianMechanismBuilder) -> String {
        let err = builder.build().unwrap_err();
        assert_matches!(err, MechanismError::InvalidArgument(_));
        err.to_string()
    }

    #[test]
    fn stddev() {
        assert_eq!(
            GaussianMechanism::calculate_stddev(3f64.ln(), 0.00001),
            3.42578125
        );
        let mechanism = GaussianMechanism::new(3f64.ln(), 0.00001, 2.0).unwrap();
        assert_eq!(mechanism.stddev(), 2.0 * 3.42578125);
    }

    #[test]
    fn stddev_meets_the_guarantee() {
        for (epsilon, delta) in [(0.1, 1e-9), (1.0, 1e-5), (1.0, 0.5), (5.0, 1e-3), (20.0, 1e-12)] {
            let sigma = calculate_stddev(epsilon, delta);
            assert!(calculate_delta(sigma, epsilon) <= delta);
            // Within the accuracy of the search, nothing smaller would do.
            assert!(calculate_delta(sigma * (1.0 - 2.0 * SIGMA_ACCURACY), epsilon) > delta);
        }
    }

    #[test]
    fn stddev_is_monotone() {
        assert!(calculate_stddev(0.5, 1e-5) > calculate_stddev(1.0, 1e-5));
        assert!(calculate_stddev(1.0, 1e-7) > calculate_stddev(1.0, 1e-5));
    }

    #[test]
    fn stddev_extreme_parameters() {
        for epsilon in [1e-150, 1e-10, 1.0, 1e10, 1.257239018692402e+232, f64::MAX] {
            for delta in [2.7161546250836291e-312, 1e-100, 1e-5, 0.5, 0.999] {
                let sigma = calculate_stddev(epsilon, delta);
                assert!(sigma.is_finite(), "epsilon {epsilon}, delta {delta}");
                assert!(sigma > 0.0, "epsilon {epsilon}, delta {delta}");
                assert_eq!(sigma, calculate_stddev(epsilon, delta));
            }
        }
    }

    #[test]
    fn builder_delta_errors() {
        let base = GaussianMechanismBuilder::new().l2_sensitivity(1.0).epsilon(1.0);
        assert!(build_error(base.clone()).starts_with("Delta has to be set"));
        assert!(build_error(base.clone().delta(f64::NAN)).starts_with("Delta has to be finite"));
        for bad in [-1.0, 0.0, 1.0] {
            assert!(
                build_error(base.clone().delta(bad)).starts_with("Delta has to be in the interval")
            );
        }
    }

    #[test]
    fn builder_epsilon_errors() {
        let base = GaussianMechanismBuilder::new().l2_sensitivity(1.0).delta(0.2);
        assert!(build_error(base.clone()).starts_with("Epsilon has to be set"));
        assert!(build_error(base.clone().epsilon(-3.0)).starts_with("Epsilon has to be positive"));
        assert!(build_error(base.epsilon(f64::NAN)).starts_with("Epsilon has to be finite"));
    }

    #[test]
    fn builder_sensitivity_errors() {
        let base = GaussianMechanismBuilder::new().epsilon(1.0).delta(0.2);
        assert!(
            build_error(base.clone().l0_sensitivity(f64::NAN).linf_sensitivity(1.0))
                .starts_with("L0 sensitivity has to be finite")
        );
        assert!(
            build_error(base.clone().l0_sensitivity(1.0).linf_sensitivity(f64::INFINITY))
                .starts_with("LInf sensitivity has to be finite")
        );
        assert!(build_error(base.clone().l2_sensitivity(f64::NAN))
            .starts_with("L2 sensitivity has to be finite"));
        assert!(build_error(
            base.l0_sensitivity(4.94065645841247e-323)
                .linf_sensitivity(5.24566986113514e-317)
        )
        .starts_with("The calculated L2 sensitivity has to be positive and finite"));
    }

    #[test]
    fn estimates_l2_from_l0_and_linf() {
        let mechanism = GaussianMechanismBuilder::new()
            .epsilon(1.0)
            .delta(1e-5)
            .l0_sensitivity(9.0)
            .linf_sensitivity(2.0)
            .build()
            .unwrap();
        assert_eq!(mechanism.l2_sensitivity(), 6.0);
    }

    #[test]
    fn builder_clone() {
        let clone = GaussianMechanismBuilder::new()
            .l2_sensitivity(1.2)
            .epsilon(1.1)
            .delta(0.5)
            .clone();
        let mechanism = clone.build().unwrap();
        assert_eq!(mechanism.epsilon(), 1.1);
        assert_eq!(mechanism.delta(), 0.5);
        assert_eq!(mechanism.l2_sensitivity(), 1.2);
        assert_eq!(mechanism.stddev(), calculate_stddev(1.1, 0.5) * 1.2);
    }

    #[test]
    fn builder_sensitivity_too_high() {
        let err = build_error(
            GaussianMechanismBuilder::new()
                .l2_sensitivity(f64::MAX)
                .epsilon(1.0)
                .delta(1e-5),
        );
        assert!(err.starts_with("The calibrated noise scale"));
    }

    #[test]
    fn builder_from_config() {
        let builder: GaussianMechanismBuilder = serde_json::from_str(
            r#"{"epsilon": 1.0, "delta": 0.5, "l2_sensitivity": 1.0}"#,
        )
        .unwrap();
        assert_eq!(
            serde_json::to_value(&builder).unwrap(),
            serde_json::json!({"epsilon": 1.0, "delta": 0.5, "l2_sensitivity": 1.0})
        );
        assert_eq!(builder.build().unwrap().stddev(), calculate_stddev(1.0, 0.5));
    }

    #[test]
    fn adds_noise() {
        let mut mechanism = GaussianMechanism::new(1.0, 0.5, 1.0).unwrap();
        assert_ne!(mechanism.add_noise(1.0, 1.0).unwrap(), 1.0);
        assert_ne!(mechanism.add_noise(1.1, 1.0).unwrap(), 1.1);
    }

    #[test]
    fn clamps_input() {
        let mut mechanism =
            GaussianMechanism::with_distribution(1.0, 0.5, 1.0, FixedNoise::new(0.0)).unwrap();
        assert_eq!(mechanism.add_noise_clamped(1.5, 2.0, 1.0).unwrap(), 1.5);
        assert_eq!(mechanism.add_noise_clamped(3.5, 2.0, 1.0).unwrap(), 2.0);
        assert_eq!(mechanism.add_noise_clamped(-3.5, 2.0, 1.0).unwrap(), -2.0);
        assert!(mechanism
            .add_noise_clamped(1.0, f64::NAN, 1.0)
            .unwrap_err()
            .to_string()
            .starts_with("Clamping bound has to be finite"));
        assert!(mechanism
            .add_noise_clamped(1.0, 2.0, 2.0)
            .unwrap_err()
            .to_string()
            .starts_with("privacy_budget has to be in"));

        let mut real = GaussianMechanism::new(1.0, 0.5, 1.0).unwrap();
        assert!(!real.add_noise_clamped(1.1, 2.0, 1.0).unwrap().is_nan());
    }

    #[test]
    fn high_epsilon_and_low_delta() {
        let mut mechanism = GaussianMechanismBuilder::new()
            .l2_sensitivity(6.2324042213746395e-184)
            .delta(2.7161546250836291e-312)
            .epsilon(1.257239018692402e+232)
            .build()
            .unwrap();
        assert!(mechanism.stddev().is_finite());

        let raw_value = 2.7161546250836291e-312;
        let noised = mechanism.add_noise(raw_value, 1.0).unwrap();
        assert!(noised.is_finite());
    }

    #[test]
    fn adds_no_noise_when_sensitivity_is_zero() {
        let mut mechanism = GaussianMechanism::new(1.0, 1e-5, 0.0).unwrap();
        assert_eq!(mechanism.stddev(), 0.0);
        assert_eq!(mechanism.add_noise(12.3, 1.0).unwrap(), 12.3);
        assert_eq!(mechanism.add_noise(12.3, 0.1).unwrap(), 12.3);
    }

    #[test]
    fn budget_recalibrates() {
        let mut mechanism =
            GaussianMechanism::with_distribution(1.0, 0.5, 2.0, FixedNoise::new(0.0)).unwrap();
        mechanism.add_noise(0.0, 1.0).unwrap();
        mechanism.add_noise(0.0, 0.5).unwrap();
        assert_eq!(
            mechanism.distribution().requested_scales(),
            &[calculate_stddev(1.0, 0.5) * 2.0, calculate_stddev(0.5, 0.25) * 2.0]
        );
    }

    #[test]
    fn snaps_to_granularity() {
        let mut mechanism =
            GaussianMechanism::with_distribution(1.0, 0.5, 1.0, FixedNoise::new(10.0)).unwrap();
        let granularity = granularity_for_scale(mechanism.stddev());
        let noised = mechanism.add_noise(0.1 * granularity, 1.0).unwrap();
        assert_eq!(noised % granularity, 0.0);
        assert!((noised - 10.0).abs() < 0.000001);
    }

    #[test]
    fn inputs_on_one_grid_point_give_one_output() {
        let mut mechanism =
            GaussianMechanism::with_distribution(1.0, 0.5, 1.0, FixedNoise::new(8192.0)).unwrap();
        let granularity = granularity_for_scale(mechanism.stddev());

        let on_grid = mechanism.add_noise(granularity, 1.0).unwrap();
        for offset in [2f64.powi(-30), 2f64.powi(-10), 0.25, -0.4] {
            let nearby = granularity * (1.0 + offset);
            assert_eq!(mechanism.add_noise(nearby, 1.0).unwrap(), on_grid, "{offset}");
        }
    }

    #[test]
    fn confidence_interval_rejects_unrepresentable_scale() {
        let mechanism = GaussianMechanism::new(1.0, 1e-5, 1e300).unwrap();
        mechanism.noise_confidence_interval(0.9, 1.0, 0.0).unwrap();

        // a smaller budget needs noise too wide to represent
        let budget = 1e-3;
        assert_matches!(
            mechanism.noise_confidence_interval(0.9, budget, 0.0),
            Err(MechanismError::InvalidArgument(msg)) if msg.starts_with("The calibrated noise scale")
        );
        assert!(mechanism.clone().add_noise(0.0, budget).is_err());
    }

    #[test]
    fn confidence_interval_with_injected_sampler() {
        let mechanism = GaussianMechanism::with_distribution(
            1.0,
            0.5,
            1.0,
            FixedNoise::with_family(0.0, NoiseFamily::Gaussian),
        )
        .unwrap();
        let interval = mechanism.noise_confidence_interval(0.95, 1.0, 0.0).unwrap();
        let expected = gaussian_quantile(0.975, mechanism.stddev());
        assert_eq!(interval.upper_bound(), expected);
        assert_eq!(interval.lower_bound(), -expected);
    }

    #[test]
    fn build_logs_outcome() {
        let (rejected, events) = count_events(|| {
            GaussianMechanismBuilder::new()
                .epsilon(1.0)
                .l2_sensitivity(1.0)
                .build()
        });
        assert!(rejected.is_err());
        assert_eq!(events, 1);

        let (built, events) = count_events(|| {
            GaussianMechanismBuilder::new()
                .epsilon(1.0)
                .delta(1e-5)
                .l2_sensitivity(1.0)
                .build()
        });
        assert!(built.is_ok());
        assert_eq!(events, 1);
    }

    #[test]
    fn confidence_interval() {
        // (epsilon, delta, sensitivity, level, budget, result, lower bound offset)
        let cases = [
            (1.2, 0.3, 1.0, 0.9, 0.5, 0.0, -1.9613),
            (1.0, 0.5, 1.0, 0.95, 0.5, 1.3, -1.9054),
            (10.0, 0.5, 1.0, 0.95, 0.75, 2.7, -0.5154),
        ];
        for (epsilon, delta, sensitivity, level, budget, result, offset) in cases {
            let mechanism = GaussianMechanism::new(epsilon, delta, sensitivity).unwrap();
            let interval = mechanism
                .noise_confidence_interval(level, budget, result)
                .unwrap();
            assert!((interval.lower_bound() - (result + offset)).abs() < 0.001);
            assert!((interval.upper_bound() - (result - offset)).abs() < 0.001);
            assert_eq!(interval.confidence_level(), level);
        }
    }

    #[test]
    fn confidence_interval_errors() {
        let mechanism = GaussianMechanism::new(1.0, 0.5, 1.0).unwrap();
        assert_matches!(
            mechanism.noise_confidence_interval(0.5, f64::NAN, 0.0),
            Err(MechanismError::InvalidArgument(msg)) if msg.contains("privacy_budget has to be in")
        );
        assert_matches!(
            mechanism.noise_confidence_interval(f64::NAN, 1.0, 0.0),
            Err(MechanismError::InvalidArgument(msg)) if msg.contains("Confidence level has to be in")
        );
    }
}
