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

//! Exponential moving average of model weights.
//!
//! The EMA shadow model is a deep, independent copy of the live model that trails it by exponential smoothing:
//! after every optimizer step, `shadow = shadow · β + live · (1 - β)`. Sampling from the shadow gives noticeably more
//! stable results than sampling from the raw training weights.

use ndarray::{ArrayD, ArrayViewD, Zip};

use crate::models::{ensure_same_structure, Parameterized};
use crate::{Result, UmiError};

/// Default smoothing coefficient.
pub const DEFAULT_EMA_DECAY: f32 = 0.995;
/// Default number of initial steps during which the shadow is reset to the live weights instead of being averaged.
pub const DEFAULT_EMA_WARMUP_STEPS: usize = 2000;

/// Tracks EMA state and updates shadow models.
#[derive(Debug, Clone, PartialEq)]
pub struct Ema {
	decay: f32,
	warmup_steps: usize,
	steps: usize
}

impl Ema {
	/// Creates a tracker with the given decay and no warm-up.
	///
	/// # Errors
	/// Returns [`UmiError::Configuration`] if `decay` is not in `[0, 1)`.
	pub fn new(decay: f32) -> Result<Self> {
		if !(0.0..1.0).contains(&decay) {
			return Err(UmiError::config(format!("ema decay ({decay}) must be in [0, 1)")));
		}
		Ok(Self { decay, warmup_steps: 0, steps: 0 })
	}

	/// For the first `warmup_steps` calls to [`Ema::step_ema`], copy the live weights into the shadow verbatim. Early
	/// training weights move fast, and averaging over them only drags the shadow towards the random initialization.
	pub fn with_warmup(mut self, warmup_steps: usize) -> Self {
		self.warmup_steps = warmup_steps;
		self
	}

	/// The smoothing factor `β`.
	pub fn decay(&self) -> f32 {
		self.decay
	}

	/// Number of initial steps that copy instead of averaging.
	pub fn warmup_steps(&self) -> usize {
		self.warmup_steps
	}

	/// Number of completed [`Ema::step_ema`] calls.
	pub fn steps(&self) -> usize {
		self.steps
	}

	/// Builds a shadow model: an independent clone of `live` with gradients disabled, held in inference mode.
	pub fn shadow_of<M: Parameterized + Clone>(live: &M) -> M {
		let mut shadow = live.clone();
		shadow.requires_grad_(false);
		shadow.train(false);
		shadow
	}

	/// Returns `old · β + new · (1 - β)`, or `new` unchanged when there is no previous value.
	pub fn update_average(&self, old: Option<ArrayViewD<'_, f32>>, new: ArrayViewD<'_, f32>) -> ArrayD<f32> {
		match old {
			Some(old) => {
				let mut averaged = old.to_owned();
				self.average_into(&mut averaged, &new);
				averaged
			}
			None => new.to_owned()
		}
	}

	/// Advances the shadow model by one step towards `live`. Only the shadow is written.
	///
	/// # Errors
	/// Returns [`UmiError::Configuration`] if the two models do not have the same parameter names and shapes; the
	/// shadow is left untouched in that case.
	pub fn step_ema<M: Parameterized + ?Sized>(&mut self, shadow: &mut M, live: &M) -> Result<()> {
		ensure_same_structure(shadow, live)?;

		if self.steps < self.warmup_steps {
			Self::reset_parameters(shadow, live);
		} else {
			for (shadow_param, live_param) in shadow.parameters_mut().into_iter().zip(live.parameters()) {
				self.average_into(shadow_param.value_mut(), &live_param.value().view());
			}
		}
		self.steps += 1;
		Ok(())
	}

	fn reset_parameters<M: Parameterized + ?Sized>(shadow: &mut M, live: &M) {
		for (shadow_param, live_param) in shadow.parameters_mut().into_iter().zip(live.parameters()) {
			shadow_param.value_mut().assign(live_param.value());
		}
	}

	fn average_into(&self, old: &mut ArrayD<f32>, new: &ArrayViewD<'_, f32>) {
		let beta = self.decay;
		Zip::from(old).and(new).par_for_each(|o, &n| *o = *o * beta + n * (1.0 - beta));
	}
}

#[cfg(test)]
mod tests {
	use ndarray::{arr1, ArrayD};
	use rand::{rngs::StdRng, SeedableRng};

	use super::Ema;
	use crate::models::{ConditionalAffineDenoiser, Parameterized};

	fn max_abs_diff(a: &ArrayD<f32>, b: &ArrayD<f32>) -> f32 {
		a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
	}

	#[test]
	fn test_update_average() {
		let ema = Ema::new(0.9).unwrap();
		let new = arr1(&[1.0f32, 2.0]).into_dyn();
		assert_eq!(ema.update_average(None, new.view()), new);
		let old = arr1(&[0.0f32, 0.0]).into_dyn();
		let averaged = ema.update_average(Some(old.view()), new.view());
		assert!((averaged[0] - 0.1).abs() < 1e-6 && (averaged[1] - 0.2).abs() < 1e-6);
	}

	#[test]
	fn test_invalid_decay() {
		assert!(Ema::new(1.0).unwrap_err().is_configuration());
		assert!(Ema::new(-0.1).is_err());
		assert!(Ema::new(f32::NAN).is_err());
		assert!(Ema::new(0.0).is_ok());
	}

	#[test]
	fn test_shadow_is_independent_and_frozen() {
		let mut live = ConditionalAffineDenoiser::new(3, 2, 1000, &mut StdRng::seed_from_u64(0));
		let shadow = Ema::shadow_of(&live);
		assert_eq!(shadow.state_dict(), live.state_dict());
		assert!(!shadow.is_training());
		assert!(shadow.parameters().iter().all(|p| !p.requires_grad()));
		assert!(live.parameters().iter().all(|p| p.requires_grad()));

		live.parameters_mut()[0].value_mut().fill(5.0);
		assert!(shadow.parameters()[0].value().iter().all(|&v| v != 5.0));
	}

	#[test]
	fn test_step_ema_with_identical_weights_is_idempotent() {
		let live = ConditionalAffineDenoiser::new(3, 2, 1000, &mut StdRng::seed_from_u64(1));
		let mut shadow = Ema::shadow_of(&live);
		let mut ema = Ema::new(0.995).unwrap();
		for _ in 0..10 {
			ema.step_ema(&mut shadow, &live).unwrap();
		}
		for (s, l) in shadow.parameters().iter().zip(live.parameters()) {
			assert!(max_abs_diff(s.value(), l.value()) < 1e-6);
		}
		assert_eq!(ema.steps(), 10);
	}

	#[test]
	fn test_step_ema_converges_to_fixed_live_weights() {
		let mut rng = StdRng::seed_from_u64(2);
		let live = ConditionalAffineDenoiser::new(3, 2, 1000, &mut rng);
		let mut shadow = Ema::shadow_of(&ConditionalAffineDenoiser::new(3, 2, 1000, &mut rng));

		let distance = |shadow: &ConditionalAffineDenoiser| {
			shadow.parameters().iter().zip(live.parameters()).map(|(s, l)| max_abs_diff(s.value(), l.value())).fold(0.0, f32::max)
		};

		let mut fast = Ema::new(0.9).unwrap();
		let mut slow = Ema::new(0.995).unwrap();
		let mut slow_shadow = shadow.clone();
		let mut previous = distance(&shadow);
		for _ in 0..100 {
			fast.step_ema(&mut shadow, &live).unwrap();
			slow.step_ema(&mut slow_shadow, &live).unwrap();
			let current = distance(&shadow);
			assert!(current <= previous);
			previous = current;
		}
		assert!(distance(&shadow) < 1e-4);
		assert!(distance(&slow_shadow) > distance(&shadow));
	}

	#[test]
	fn test_warmup_copies_live_weights() {
		let mut rng = StdRng::seed_from_u64(3);
		let live = ConditionalAffineDenoiser::new(3, 2, 1000, &mut rng);
		let mut shadow = Ema::shadow_of(&ConditionalAffineDenoiser::new(3, 2, 1000, &mut rng));
		let mut ema = Ema::new(0.995).unwrap().with_warmup(1);
		ema.step_ema(&mut shadow, &live).unwrap();
		assert_eq!(shadow.state_dict(), live.state_dict());
		assert!(shadow.parameters().iter().all(|p| !p.requires_grad()));
	}

	#[test]
	fn test_structure_mismatch_is_rejected() {
		let mut rng = StdRng::seed_from_u64(4);
		let live = ConditionalAffineDenoiser::new(3, 2, 1000, &mut rng);
		let mut shadow = Ema::shadow_of(&ConditionalAffineDenoiser::new(3, 4, 1000, &mut rng));
		let before = shadow.state_dict();
		let mut ema = Ema::new(0.995).unwrap();
		assert!(ema.step_ema(&mut shadow, &live).unwrap_err().is_configuration());
		assert_eq!(shadow.state_dict(), before);
		assert_eq!(ema.steps(), 0);
	}
}
