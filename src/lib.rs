// SPDX-License-Identifier: MPL-2.0

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # dp-mechanisms
//!
//! Noise mechanisms that make numeric aggregates (sums, counts, quantiles) differentially
//! private. Given a true statistic and a bound on how much one individual can change it, a
//! mechanism returns a randomized value satisfying an epsilon-DP ([`dp::LaplaceMechanism`]) or
//! (epsilon, delta)-DP ([`dp::GaussianMechanism`]) guarantee, and reports confidence intervals
//! for the noise it added.
//!
//! ```
//! use dp_mechanisms::dp::{LaplaceMechanismBuilder, NumericalMechanism, NumericalMechanismBuilder};
//!
//! let mut mechanism = LaplaceMechanismBuilder::new()
//!     .epsilon(1.0)
//!     .l0_sensitivity(1.0)
//!     .linf_sensitivity(5.0)
//!     .build()
//!     .unwrap();
//! let noised_sum = mechanism.add_noise(1234.0, 1.0).unwrap();
//! let interval = mechanism.noise_confidence_interval(0.95, 1.0, noised_sum).unwrap();
//! assert!(interval.lower_bound() < noised_sum && noised_sum < interval.upper_bound());
//! ```

pub mod dp;
