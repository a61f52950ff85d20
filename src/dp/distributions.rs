// SPDX-License-Identifier: MPL-2.0

//! Secure samplers for the noise added by the mechanisms in this crate.
//!
//! Naively adding a floating-point Laplace or Gaussian draw to a value leaks information about
//! the value through the low-order bits of the sum [[Mir12]]. The samplers here avoid that by
//! drawing noise that is an exact integer multiple of a power-of-two *granularity*, and the
//! mechanisms snap their results to the same grid, so nothing finer than the granularity can
//! depend on the private input.
//!
//! Laplace noise is a discrete Laplace variable over the grid. Gaussian noise is a discrete
//! Gaussian over the grid, sampled by rejection from discrete Laplace proposals following
//! Algorithm 3 of [[CKS20]]. Both are sampled with exact rational arithmetic on the number of
//! granules, so no floating-point error distorts their tails.
//!
//! [Mir12]: https://www.microsoft.com/en-us/research/wp-content/uploads/2012/10/lsbs.pdf
//! [CKS20]: https://arxiv.org/pdf/2004.00010.pdf

use std::f64::consts::SQRT_2;
use std::fmt;

use num_bigint::{BigInt, BigUint};
use num_integer::Integer;
use num_rational::{BigRational, Ratio};
use num_traits::{One, ToPrimitive, Zero};
use rand::{rngs::StdRng, Rng};
use rand_core::SeedableRng;
use statrs::function::erf::erf_inv;

use super::rand_bigint::random_biguint_below;
use super::MechanismError;

/// Ratio between a scale and its granularity: noise is resolved to about 2^-40 of its scale.
const GRANULARITY_PARAM: f64 = 1_099_511_627_776.0;

/// Magnitude of a granule count beyond which every float is already on the grid.
const EXACT_GRID_LIMIT: f64 = 4_503_599_627_370_496.0;

/// Largest number of granules a sample may plausibly span.
const MAX_GRANULES: f64 = 18_446_744_073_709_551_616.0;

/// The smallest positive subnormal, below which no granularity can go.
const MIN_GRANULARITY: f64 = 4.9406564584124654e-324;

/// A source of noise for a mechanism.
///
/// Implementations draw from a zero-centered distribution family whose spread is given by
/// `scale`: the diversity `b` for Laplace noise, the standard deviation for Gaussian noise.
pub trait NoiseDistribution {
    /// Draw one sample at the given scale. The sample is an integer multiple of
    /// `self.granularity(scale)`.
    fn sample(&mut self, scale: f64) -> f64;

    /// The power-of-two step that samples at the given scale are quantized to.
    fn granularity(&self, scale: f64) -> f64;

    /// The value below which a sample at the given scale falls with probability `probability`.
    fn quantile(&self, probability: f64, scale: f64) -> f64;
}

/// The smallest power of two that is at least `value`, clamped to the subnormal range.
fn next_power_of_two(value: f64) -> f64 {
    if value.is_nan() || value <= MIN_GRANULARITY {
        return MIN_GRANULARITY;
    }
    if value.is_infinite() {
        return value;
    }
    let mut power = value.log2().ceil().exp2();
    // log2 may be off by an ulp next to exact powers of two
    if power < value {
        power *= 2.0;
    } else if power / 2.0 >= value {
        power /= 2.0;
    }
    power
}

/// The granularity of the default samplers at the given scale.
pub fn granularity_for_scale(scale: f64) -> f64 {
    next_power_of_two(scale / GRANULARITY_PARAM)
}

/// Round `value` to the nearest integer multiple of `granularity`, which must be a power of two.
///
/// Values too large to have any bits below the granularity are returned unchanged, as are
/// non-finite values.
pub fn round_to_multiple(value: f64, granularity: f64) -> f64 {
    if granularity.is_nan() || granularity <= 0.0 || !value.is_finite() {
        return value;
    }
    let granules = value / granularity;
    if granules.abs() >= EXACT_GRID_LIMIT {
        return value;
    }
    granules.round() * granularity
}

/// Check that noise at the given scale can be represented: the scale is finite and a sample
/// spanning the largest plausible number of granules does not overflow.
pub(crate) fn check_scale(scale: f64) -> Result<(), MechanismError> {
    if scale.is_finite() && (granularity_for_scale(scale) * MAX_GRANULES).is_finite() {
        Ok(())
    } else {
        Err(MechanismError::invalid_argument(format!(
            "The calibrated noise scale {scale} is too large"
        )))
    }
}

/// Sample from the Bernoulli(gamma) distribution, where `gamma <= 1`, as described on page 30
/// of [[CKS20]].
///
/// [CKS20]: https://arxiv.org/pdf/2004.00010.pdf
fn sample_bernoulli<R: Rng + ?Sized>(gamma: &Ratio<BigUint>, rng: &mut R) -> bool {
    random_biguint_below(rng, gamma.denom()) < *gamma.numer()
}

/// Sample from the Bernoulli(exp(-gamma)) distribution, following Algorithm 1 of [[CKS20]].
///
/// [CKS20]: https://arxiv.org/pdf/2004.00010.pdf
fn sample_bernoulli_exp<R: Rng + ?Sized>(gamma: &Ratio<BigUint>, rng: &mut R) -> bool {
    // exp(-gamma) = exp(-1)^floor(gamma) * exp(-fract(gamma))
    let one = Ratio::<BigUint>::one();
    let mut whole = gamma.floor().to_integer();
    while !whole.is_zero() {
        if !sample_bernoulli_exp_below_one(&one, rng) {
            return false;
        }
        whole -= 1u8;
    }
    sample_bernoulli_exp_below_one(&gamma.fract(), rng)
}

fn sample_bernoulli_exp_below_one<R: Rng + ?Sized>(gamma: &Ratio<BigUint>, rng: &mut R) -> bool {
    let mut k = BigUint::one();
    while sample_bernoulli(&(gamma / k.clone()), rng) {
        k += 1u8;
    }
    k.is_odd()
}

/// Sample from the geometric distribution with parameter `1 - exp(-gamma)`, following all but
/// the last three lines of Algorithm 2 of [[CKS20]].
///
/// [CKS20]: https://arxiv.org/pdf/2004.00010.pdf
fn sample_geometric_exp<R: Rng + ?Sized>(gamma: &Ratio<BigUint>, rng: &mut R) -> BigUint {
    if gamma.is_zero() {
        return BigUint::zero();
    }
    let (s, t) = (gamma.numer(), gamma.denom());

    let mut u = random_biguint_below(rng, t);
    while !sample_bernoulli_exp(&Ratio::new_raw(u.clone(), t.clone()), rng) {
        u = random_biguint_below(rng, t);
    }

    let one = Ratio::<BigUint>::one();
    let mut v = BigUint::zero();
    while sample_bernoulli_exp(&one, rng) {
        v += 1u8;
    }

    // integer division, so this is floor((u + t * v) / s)
    (u + t * v) / s
}

/// Sample from the discrete Laplace distribution with the given scale, i.e. the integer `k`
/// with probability proportional to `exp(-|k| / scale)`.
///
/// Follows Algorithm 2 of [[CKS20]]: a uniform sign and a geometric magnitude, rejecting the
/// negative zero so that zero is not counted twice.
///
/// [CKS20]: https://arxiv.org/pdf/2004.00010.pdf
fn sample_discrete_laplace<R: Rng + ?Sized>(scale: &Ratio<BigUint>, rng: &mut R) -> BigInt {
    if scale.is_zero() {
        return BigInt::zero();
    }
    let half = Ratio::new_raw(BigUint::one(), BigUint::from(2u8));
    let gamma = scale.recip();
    loop {
        let negative = sample_bernoulli(&half, rng);
        let magnitude = BigInt::from(sample_geometric_exp(&gamma, rng));
        if negative && magnitude.is_zero() {
            continue;
        }
        return if negative { -magnitude } else { magnitude };
    }
}

/// Sample from the discrete Gaussian distribution with parameter `sigma`, i.e. the integer `k`
/// with probability proportional to `exp(-k^2 / (2 sigma^2))`.
///
/// Follows Algorithm 3 of [[CKS20]].
///
/// [CKS20]: https://arxiv.org/pdf/2004.00010.pdf
fn sample_discrete_gaussian<R: Rng + ?Sized>(sigma: &Ratio<BigUint>, rng: &mut R) -> BigInt {
    if sigma.is_zero() {
        return BigInt::zero();
    }
    let t = sigma.floor() + BigUint::one();
    let variance = sigma.pow(2);

    // no need to compute these parts of the acceptance probability every iteration
    let offset = &variance / &t;
    let factor = (variance * BigUint::from(2u8)).recip();
    loop {
        let y = sample_discrete_laplace(&t, rng);
        let y_abs = Ratio::from_integer(y.magnitude().clone());

        // unsigned subtraction followed by squaring
        let distance = if y_abs < offset {
            &offset - y_abs
        } else {
            y_abs - &offset
        };

        if sample_bernoulli_exp(&(distance.pow(2) * &factor), rng) {
            return y;
        }
    }
}

/// The scale measured in granules, as an exact rational. Non-positive and non-finite scales
/// give zero, which makes the samplers return zero noise.
fn granules(scale: f64, granularity: f64) -> Ratio<BigUint> {
    if scale.is_nan() || scale <= 0.0 {
        return Ratio::zero();
    }
    // dividing by a power of two is exact
    match BigRational::from_float(scale / granularity) {
        Some(exact) => Ratio::new_raw(
            exact.numer().magnitude().clone(),
            exact.denom().magnitude().clone(),
        ),
        None => Ratio::zero(),
    }
}

/// A granule count as a multiple of `granularity`.
fn to_grid(granule_count: &BigInt, granularity: f64) -> f64 {
    // BigInt converts to f64 without failing, saturating to infinity
    granule_count.to_f64().unwrap_or(f64::NAN) * granularity
}

/// Quantile of the zero-centered Laplace distribution with diversity `scale`.
pub fn laplace_quantile(probability: f64, scale: f64) -> f64 {
    if probability < 0.5 {
        scale * (2.0 * probability).ln()
    } else {
        -scale * (2.0 * (1.0 - probability)).ln()
    }
}

/// Quantile of the zero-centered normal distribution with standard deviation `scale`.
pub fn gaussian_quantile(probability: f64, scale: f64) -> f64 {
    scale * SQRT_2 * erf_inv(2.0 * probability - 1.0)
}

/// Laplace noise on a power-of-two grid, drawn from an operating-system-seeded CSPRNG.
pub struct LaplaceDistribution {
    rng: StdRng,
}

impl LaplaceDistribution {
    /// Create a sampler seeded from the operating system.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Create a sampler with a fixed seed. Only for reproducible tests and benchmarks: noise
    /// from a known seed provides no privacy.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: StdRng::from_seed(seed),
        }
    }
}

impl Default for LaplaceDistribution {
    fn default() -> Self {
        Self::new()
    }
}

/// A clone draws fresh randomness rather than replaying the original's stream.
impl Clone for LaplaceDistribution {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl fmt::Debug for LaplaceDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaplaceDistribution").finish_non_exhaustive()
    }
}

impl NoiseDistribution for LaplaceDistribution {
    fn sample(&mut self, scale: f64) -> f64 {
        let granularity = self.granularity(scale);
        to_grid(
            &sample_discrete_laplace(&granules(scale, granularity), &mut self.rng),
            granularity,
        )
    }

    fn granularity(&self, scale: f64) -> f64 {
        granularity_for_scale(scale)
    }

    fn quantile(&self, probability: f64, scale: f64) -> f64 {
        laplace_quantile(probability, scale)
    }
}

/// Gaussian noise on a power-of-two grid, drawn from an operating-system-seeded CSPRNG.
pub struct GaussianDistribution {
    rng: StdRng,
}

impl GaussianDistribution {
    /// Create a sampler seeded from the operating system.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Create a sampler with a fixed seed. Only for reproducible tests and benchmarks: noise
    /// from a known seed provides no privacy.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: StdRng::from_seed(seed),
        }
    }
}

impl Default for GaussianDistribution {
    fn default() -> Self {
        Self::new()
    }
}

/// A clone draws fresh randomness rather than replaying the original's stream.
impl Clone for GaussianDistribution {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl fmt::Debug for GaussianDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GaussianDistribution").finish_non_exhaustive()
    }
}

impl NoiseDistribution for GaussianDistribution {
    fn sample(&mut self, scale: f64) -> f64 {
        let granularity = self.granularity(scale);
        to_grid(
            &sample_discrete_gaussian(&granules(scale, granularity), &mut self.rng),
            granularity,
        )
    }

    fn granularity(&self, scale: f64) -> f64 {
        granularity_for_scale(scale)
    }

    fn quantile(&self, probability: f64, scale: f64) -> f64 {
        gaussian_quantile(probability, scale)
    }
}

/// Deterministic samplers for exercising mechanisms in tests.
#[cfg(any(test, feature = "test-util"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod test_utils {
    use super::{gaussian_quantile, granularity_for_scale, laplace_quantile, NoiseDistribution};

    /// The distribution family whose quantiles a [`FixedNoise`] reports.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub enum NoiseFamily {
        /// Quantiles of the Laplace distribution with diversity `scale`.
        #[default]
        Laplace,
        /// Quantiles of the normal distribution with standard deviation `scale`.
        Gaussian,
    }

    /// Returns the same draw every time and records the scale of every request.
    #[derive(Clone, Debug, Default, PartialEq)]
    pub struct FixedNoise {
        noise: f64,
        family: NoiseFamily,
        requested_scales: Vec<f64>,
    }

    impl FixedNoise {
        /// A sampler whose every draw is `noise`, reporting Laplace quantiles.
        pub fn new(noise: f64) -> Self {
            Self::with_family(noise, NoiseFamily::Laplace)
        }

        /// A sampler whose every draw is `noise`, reporting the quantiles of `family`.
        pub fn with_family(noise: f64, family: NoiseFamily) -> Self {
            Self {
                noise,
                family,
                requested_scales: Vec::new(),
            }
        }

        /// The scales passed to [`NoiseDistribution::sample`], in call order.
        pub fn requested_scales(&self) -> &[f64] {
            &self.requested_scales
        }
    }

    impl NoiseDistribution for FixedNoise {
        fn sample(&mut self, scale: f64) -> f64 {
            self.requested_scales.push(scale);
            self.noise
        }

        fn granularity(&self, scale: f64) -> f64 {
            granularity_for_scale(scale)
        }

        fn quantile(&self, probability: f64, scale: f64) -> f64 {
            match self.family {
                NoiseFamily::Laplace => laplace_quantile(probability, scale),
                NoiseFamily::Gaussian => gaussian_quantile(probability, scale),
            }
        }
    }
}
