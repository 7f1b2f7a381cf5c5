// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Noise schedules and the diffusion process built on top of them.
//!
//! * The [`NoiseSchedule`] precomputes, for every training timestep `t`, the variance `β_t`, `α_t = 1 - β_t` and the
//!   cumulative product `ᾱ_t = ∏_{s≤t} α_s`.
//! * [`DDPMDiffusion`] uses those coefficients to corrupt clean images during training (the forward process) and to
//!   iteratively denoise pure noise during sampling (the reverse, ancestral process).

use ndarray::{Array1, Array4};

use crate::{Result, UmiError};

mod ddpm;

pub use self::ddpm::*;

/// A mapping from a beta range to a sequence of betas for stepping the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BetaSchedule {
	/// Linear beta schedule.
	#[default]
	Linear,
	/// Scaled linear beta schedule; betas are interpolated linearly in square-root space.
	ScaledLinear
}

/// The three per-timestep scalars of a [`NoiseSchedule`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleCoefficients {
	/// Noise variance `β_t`.
	pub beta: f32,
	/// `α_t = 1 - β_t`.
	pub alpha: f32,
	/// Cumulative product `ᾱ_t`.
	pub alpha_hat: f32
}

/// Precomputed per-timestep coefficients of a variance schedule. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
	betas: Array1<f32>,
	alphas: Array1<f32>,
	alphas_cumprod: Array1<f32>
}

impl Default for NoiseSchedule {
	fn default() -> Self {
		Self::from_betas(Array1::linspace(0.0001, 0.02, 1000))
	}
}

impl NoiseSchedule {
	/// Creates a new schedule.
	///
	/// # Parameters
	/// - **`num_train_timesteps`**: number of diffusion steps `T`.
	/// - **`beta_start`**: the `β` of timestep 0.
	/// - **`beta_end`**: the `β` of timestep `T - 1`.
	/// - **`beta_schedule`**: how betas are interpolated between the two bounds; see [`BetaSchedule`]
	///
	/// # Errors
	/// Returns [`UmiError::Configuration`] if:
	/// - `num_train_timesteps` is 0
	/// - `beta_start` or `beta_end` are not normal numbers (not zero, infinite, `NaN`, or subnormal)
	/// - `beta_end` is less than or equal to `beta_start`
	/// - `beta_end` is not below 1
	/// - the cumulative product `ᾱ` underflows or stops strictly decreasing before timestep `T - 1`
	pub fn new(num_train_timesteps: usize, beta_start: f32, beta_end: f32, beta_schedule: &BetaSchedule) -> Result<Self> {
		if num_train_timesteps == 0 {
			return Err(UmiError::config(format!("num_train_timesteps ({num_train_timesteps}) must be >0")));
		}
		if !beta_start.is_normal() || !beta_end.is_normal() {
			return Err(UmiError::config(format!(
				"beta_start ({beta_start}) and beta_end ({beta_end}) must be normal (not zero, infinite, NaN, or subnormal)"
			)));
		}
		if beta_start >= beta_end {
			return Err(UmiError::config(format!("beta_start ({beta_start}) must be < beta_end ({beta_end})")));
		}
		if beta_start < 0.0 || beta_end >= 1.0 {
			return Err(UmiError::config(format!("betas must lie in (0, 1), got [{beta_start}, {beta_end}]")));
		}

		let betas = match beta_schedule {
			BetaSchedule::Linear => Array1::linspace(beta_start, beta_end, num_train_timesteps),
			BetaSchedule::ScaledLinear => {
				let mut betas = Array1::linspace(beta_start.sqrt(), beta_end.sqrt(), num_train_timesteps);
				betas.par_map_inplace(|f| *f = f.powi(2));
				betas
			}
		};

		let schedule = Self::from_betas(betas);
		// ᾱ must stay a normal f32 and strictly decrease; long schedules underflow the cumulative product
		if let Some(t) = schedule.alphas_cumprod.iter().position(|a| !a.is_normal()) {
			return Err(UmiError::config(format!(
				"alpha_hat underflows at timestep {t} of {num_train_timesteps}; use fewer timesteps or smaller betas"
			)));
		}
		if let Some(t) = schedule.alphas_cumprod.windows(2).into_iter().position(|w| w[1] >= w[0]) {
			return Err(UmiError::config(format!("alpha_hat stops decreasing at timestep {}; betas are too small to resolve in f32", t + 1)));
		}

		Ok(schedule)
	}

	fn from_betas(betas: Array1<f32>) -> Self {
		let alphas = 1.0 - &betas;

		let alphas_cumprod = alphas
			.view()
			.into_iter()
			.scan(1.0, |prod, alpha| {
				*prod *= *alpha;
				Some(*prod)
			})
			.collect::<Array1<_>>();

		Self { betas, alphas, alphas_cumprod }
	}

	/// Returns `β_t`.
	///
	/// # Panics
	/// Panics if `timestep` is out of this schedule's bounds (see [`NoiseSchedule::len`]).
	#[inline]
	pub fn beta(&self, timestep: usize) -> f32 {
		self.betas[timestep]
	}

	/// Returns `α_t`.
	///
	/// # Panics
	/// Panics if `timestep` is out of this schedule's bounds.
	#[inline]
	pub fn alpha(&self, timestep: usize) -> f32 {
		self.alphas[timestep]
	}

	/// Returns `ᾱ_t`.
	///
	/// # Panics
	/// Panics if `timestep` is out of this schedule's bounds.
	#[inline]
	pub fn alpha_hat(&self, timestep: usize) -> f32 {
		self.alphas_cumprod[timestep]
	}

	/// Returns the `(β_t, α_t, ᾱ_t)` triple, or `None` if `timestep` is out of bounds.
	pub fn coefficients(&self, timestep: usize) -> Option<ScheduleCoefficients> {
		Some(ScheduleCoefficients {
			beta: *self.betas.get(timestep)?,
			alpha: self.alphas[timestep],
			alpha_hat: self.alphas_cumprod[timestep]
		})
	}

	/// Gathers `β_t` for each timestep of a batch into a `(batch, 1, 1, 1)` array, broadcastable against image batches.
	pub fn gather_betas(&self, timesteps: &[usize]) -> Result<Array4<f32>> {
		gather(&self.betas, timesteps)
	}

	/// Gathers `α_t` for each timestep of a batch into a `(batch, 1, 1, 1)` array.
	pub fn gather_alphas(&self, timesteps: &[usize]) -> Result<Array4<f32>> {
		gather(&self.alphas, timesteps)
	}

	/// Gathers `ᾱ_t` for each timestep of a batch into a `(batch, 1, 1, 1)` array.
	pub fn gather_alphas_cumprod(&self, timesteps: &[usize]) -> Result<Array4<f32>> {
		gather(&self.alphas_cumprod, timesteps)
	}

	/// All betas, indexed by timestep.
	pub fn betas(&self) -> &Array1<f32> {
		&self.betas
	}

	/// All cumulative alpha products, indexed by timestep.
	pub fn alphas_cumprod(&self) -> &Array1<f32> {
		&self.alphas_cumprod
	}

	/// Returns the number of train timesteps `T`.
	#[allow(clippy::len_without_is_empty)]
	pub fn len(&self) -> usize {
		self.betas.len()
	}
}

fn gather(values: &Array1<f32>, timesteps: &[usize]) -> Result<Array4<f32>> {
	let gathered = timesteps
		.iter()
		.map(|&t| {
			values
				.get(t)
				.copied()
				.ok_or_else(|| UmiError::shape(format!("timestep {t} out of bounds for a schedule of {} steps", values.len())))
		})
		.collect::<Result<Vec<_>>>()?;
	Ok(Array4::from_shape_vec((timesteps.len(), 1, 1, 1), gathered)?)
}

#[cfg(test)]
mod tests {
	use super::{BetaSchedule, NoiseSchedule};

	#[test]
	fn test_linear_schedule_is_monotonic() {
		let schedule = NoiseSchedule::new(1000, 1e-4, 0.02, &BetaSchedule::Linear).unwrap();
		assert_eq!(schedule.len(), 1000);
		for t in 0..schedule.len() - 1 {
			assert!(schedule.beta(t) > 0.0 && schedule.beta(t) < schedule.beta(t + 1) && schedule.beta(t + 1) < 1.0);
			assert!(schedule.alpha_hat(t) > schedule.alpha_hat(t + 1) && schedule.alpha_hat(t + 1) > 0.0);
		}
		assert!((schedule.beta(0) - 1e-4).abs() < 1e-9);
		assert!((schedule.beta(999) - 0.02).abs() < 1e-6);
		assert!(schedule.alpha_hat(0) > 0.999);
		assert!(schedule.alpha_hat(999) < 1e-3);
	}

	#[test]
	fn test_scaled_linear_schedule_is_monotonic() {
		let schedule = NoiseSchedule::new(1000, 0.00085, 0.012, &BetaSchedule::ScaledLinear).unwrap();
		for t in 0..schedule.len() - 1 {
			assert!(schedule.beta(t) < schedule.beta(t + 1));
			assert!(schedule.alpha_hat(t) > schedule.alpha_hat(t + 1));
		}
	}

	#[test]
	fn test_alpha_is_complement_of_beta() {
		let schedule = NoiseSchedule::default();
		let c = schedule.coefficients(500).unwrap();
		assert_eq!(c.alpha, 1.0 - c.beta);
		assert!(schedule.coefficients(1000).is_none());
	}

	#[test]
	fn test_invalid_bounds() {
		assert!(NoiseSchedule::new(0, 1e-4, 0.02, &BetaSchedule::Linear).unwrap_err().is_configuration());
		assert!(NoiseSchedule::new(1000, 0.02, 1e-4, &BetaSchedule::Linear).unwrap_err().is_configuration());
		assert!(NoiseSchedule::new(1000, 0.02, 0.02, &BetaSchedule::Linear).unwrap_err().is_configuration());
		assert!(NoiseSchedule::new(1000, 0.0, 0.02, &BetaSchedule::Linear).unwrap_err().is_configuration());
		assert!(NoiseSchedule::new(1000, 0.5, f32::NAN, &BetaSchedule::Linear).unwrap_err().is_configuration());
		assert!(NoiseSchedule::new(1000, 0.5, 1.0, &BetaSchedule::Linear).unwrap_err().is_configuration());
	}

	#[test]
	fn test_rejects_underflowing_alpha_hat() {
		let err = NoiseSchedule::new(10_000, 1e-4, 0.02, &BetaSchedule::Linear).unwrap_err();
		assert!(err.is_configuration());
		assert!(NoiseSchedule::new(100_000, 1e-4, 0.02, &BetaSchedule::Linear).unwrap_err().is_configuration());
		// betas too small for 1 - β to differ from 1 in f32
		assert!(NoiseSchedule::new(10, 1e-9, 2e-9, &BetaSchedule::Linear).unwrap_err().is_configuration());

		let schedule = NoiseSchedule::new(4000, 1e-4, 0.02, &BetaSchedule::Linear).unwrap();
		assert!(schedule.alphas_cumprod().iter().all(|a| a.is_normal() && *a < 1.0));
	}

	#[test]
	fn test_gather_is_broadcastable() {
		let schedule = NoiseSchedule::default();
		let gathered = schedule.gather_alphas_cumprod(&[1, 10, 999]).unwrap();
		assert_eq!(gathered.shape(), &[3, 1, 1, 1]);
		assert_eq!(gathered[[1, 0, 0, 0]], schedule.alpha_hat(10));
		assert!(schedule.gather_betas(&[1000]).is_err());
	}
}
