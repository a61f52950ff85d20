// SPDX-License-Identifier: MPL-2.0

//! Validation of sensitivity bounds.
//!
//! A mechanism needs one scalar sensitivity under the norm its noise is calibrated for: the L1
//! norm for Laplace noise and the L2 norm for Gaussian noise. Callers either supply that bound
//! directly, or supply the L0 sensitivity (how many records one individual can influence) and the
//! L∞ sensitivity (how much each of those records can change), from which the bound is derived.

use serde::{Deserialize, Serialize};

use super::MechanismError;

/// The norm a sensitivity bound is expressed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Norm {
    /// Used to calibrate Laplace noise. Derived as `l0 * l_inf`.
    L1,
    /// Used to calibrate Gaussian noise. Derived as `sqrt(l0) * l_inf`.
    L2,
}

impl Norm {
    fn name(self) -> &'static str {
        match self {
            Norm::L1 => "L1",
            Norm::L2 => "L2",
        }
    }

    fn derive(self, l0: f64, l_inf: f64) -> f64 {
        match self {
            Norm::L1 => l0 * l_inf,
            Norm::L2 => l0.sqrt() * l_inf,
        }
    }
}

/// The sensitivity parameters supplied to a builder. Any subset may be set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SensitivityBounds {
    /// Maximum number of records one individual can contribute to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l0: Option<f64>,
    /// Bound on the change of the aggregate under the mechanism's norm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct: Option<f64>,
    /// Maximum magnitude of a single record's contribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l_inf: Option<f64>,
}

/// Check that a supplied sensitivity is finite and strictly positive.
fn check_finite_and_positive(name: &str, value: f64) -> Result<f64, MechanismError> {
    if !value.is_finite() {
        return Err(MechanismError::invalid_argument(format!(
            "{name} sensitivity has to be finite but is {value}"
        )));
    }
    if value <= 0.0 {
        return Err(MechanismError::invalid_argument(format!(
            "{name} sensitivity has to be positive but is {value}"
        )));
    }
    Ok(value)
}

impl SensitivityBounds {
    /// Resolve the supplied parameters into a single sensitivity under `norm`.
    ///
    /// Every supplied value is checked, even ones that end up unused. A directly supplied bound
    /// takes precedence over one derived from L0 and L∞, and a derived bound is checked again
    /// since the derivation itself can underflow to zero or overflow to infinity.
    pub fn resolve(&self, norm: Norm) -> Result<f64, MechanismError> {
        let l0 = self
            .l0
            .map(|value| check_finite_and_positive("L0", value))
            .transpose()?;
        let l_inf = self
            .l_inf
            .map(|value| check_finite_and_positive("LInf", value))
            .transpose()?;
        let direct = self
            .direct
            .map(|value| check_finite_and_positive(norm.name(), value))
            .transpose()?;

        match (direct, l0, l_inf) {
            (Some(direct), _, _) => Ok(direct),
            (None, Some(l0), Some(l_inf)) => {
                let derived = norm.derive(l0, l_inf);
                if derived.is_finite() && derived > 0.0 {
                    Ok(derived)
                } else {
                    Err(MechanismError::invalid_argument(format!(
                        "The calculated {} sensitivity has to be positive and finite but is {derived}",
                        norm.name()
                    )))
                }
            }
            _ => Err(MechanismError::invalid_argument(format!(
                "{} sensitivity has to be set, or both L0 and LInf sensitivities have to be set",
                norm.name()
            ))),
        }
    }
}
