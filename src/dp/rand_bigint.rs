// SPDX-License-Identifier: MPL-2.0 AND Apache-2.0
//
// Portions of this file are derived from the num-bigint crate
// (https://docs.rs/num-bigint/0.4.6/)
// Copyright 2013-2014 The Rust Project Developers
// Licensed under the Apache 2.0 license

//! Uniform sampling of big integers with a rand 0.9 generator.
//!
//! num-bigint only implements uniform sampling against rand 0.8, so the exact samplers in
//! [`super::distributions`] draw their uniform integers through these functions instead.

use num_bigint::BigUint;
use num_integer::Integer;
use num_traits::Zero;
use rand::Rng;

/// Fill `data` with random bits, keeping only the lowest `rem` bits of the last digit when
/// `rem` is non-zero.
fn random_bits<R>(rng: &mut R, data: &mut [u32], rem: u64)
where
    R: Rng + ?Sized,
{
    // `fill` is faster than many `random::<u32>` calls
    rng.fill(data);
    if rem > 0 {
        if let Some(last) = data.last_mut() {
            *last >>= 32 - rem;
        }
    }
}

/// Uniformly generate a random [`BigUint`] in the range \[0, 2^`bits`).
fn random_biguint<R>(rng: &mut R, bits: u64) -> BigUint
where
    R: Rng + ?Sized,
{
    let (digits, rem) = bits.div_rem(&32);
    let len = digits + u64::from(rem > 0);
    let mut data = vec![0u32; len as usize];
    random_bits(rng, &mut data, rem);
    BigUint::new(data)
}

/// Uniformly generate a random [`BigUint`] in the range \[0, `bound`). A zero bound yields zero.
pub(super) fn random_biguint_below<R>(rng: &mut R, bound: &BigUint) -> BigUint
where
    R: Rng + ?Sized,
{
    if bound.is_zero() {
        return BigUint::zero();
    }
    let bits = bound.bits();
    loop {
        let n = random_biguint(rng, bits);
        if n < *bound {
            return n;
        }
    }
}
