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

use ndarray::{Array4, ArrayView4, Ix4, Zip};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use num_traits::ToPrimitive;
use rand::Rng;

use super::NoiseSchedule;
use crate::models::{Label, NoisePredictor};
use crate::{Result, UmiError};

/// [Denoising diffusion probabilistic models][ddpm] (DDPMs) with ancestral sampling and classifier-free guidance.
///
/// Training corrupts clean images with [`DDPMDiffusion::noise_images`] at timesteps drawn by
/// [`DDPMDiffusion::sample_timesteps`]; the model learns to predict the injected noise. Sampling starts from pure
/// noise and applies `T - 1` reverse steps, `t = T-1 … 1`.
///
/// [ddpm]: https://arxiv.org/abs/2006.11239
#[derive(Debug, Clone)]
pub struct DDPMDiffusion {
	schedule: NoiseSchedule,
	channels: usize,
	img_size: usize
}

impl DDPMDiffusion {
	/// Creates a diffusion process producing square `img_size`×`img_size` images with `channels` channels.
	///
	/// # Errors
	/// Returns [`UmiError::Configuration`] if the schedule has fewer than 2 timesteps (timestep 0 is never used, so at
	/// least one noisy timestep is needed) or if `channels` or `img_size` is 0.
	pub fn new(schedule: NoiseSchedule, channels: usize, img_size: usize) -> Result<Self> {
		if schedule.len() < 2 {
			return Err(UmiError::config(format!("noise_steps ({}) must be >= 2", schedule.len())));
		}
		if channels == 0 || img_size == 0 {
			return Err(UmiError::config(format!("channels ({channels}) and img_size ({img_size}) must be >0")));
		}
		Ok(Self { schedule, channels, img_size })
	}

	/// The underlying noise schedule.
	pub fn schedule(&self) -> &NoiseSchedule {
		&self.schedule
	}

	/// Number of timesteps `T`.
	pub fn noise_steps(&self) -> usize {
		self.schedule.len()
	}

	/// Channels of generated images.
	pub fn channels(&self) -> usize {
		self.channels
	}

	/// Height and width of generated images.
	pub fn img_size(&self) -> usize {
		self.img_size
	}

	/// The `(n, channels, img_size, img_size)` shape of a batch of `n` images.
	pub fn image_shape(&self, n: usize) -> (usize, usize, usize, usize) {
		(n, self.channels, self.img_size, self.img_size)
	}

	/// Draws `batch_size` timesteps uniformly from `[1, T)`. Timestep 0 denotes a clean image and is never a training
	/// target.
	pub fn sample_timesteps<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Vec<usize> {
		(0..batch_size).map(|_| rng.gen_range(1..self.noise_steps())).collect()
	}

	/// Corrupts `x0` to `x_t = sqrt(ᾱ_t)·x0 + sqrt(1 - ᾱ_t)·ε` with freshly drawn `ε ~ N(0, 1)`.
	///
	/// Returns `(x_t, ε)`; `ε` is the regression target for the model.
	pub fn noise_images<R: Rng + ?Sized>(&self, x0: ArrayView4<'_, f32>, timesteps: &[usize], rng: &mut R) -> Result<(Array4<f32>, Array4<f32>)> {
		self.check_images(&x0)?;
		self.check_timesteps(x0.shape()[0], timesteps)?;
		let noise = Array4::<f32>::random_using(x0.raw_dim(), StandardNormal, rng);
		let x_t = self.noise_images_with(x0, timesteps, noise.view())?;
		Ok((x_t, noise))
	}

	/// Corrupts `x0` with the given noise; see [`DDPMDiffusion::noise_images`].
	pub fn noise_images_with(&self, x0: ArrayView4<'_, f32>, timesteps: &[usize], noise: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
		self.check_images(&x0)?;
		self.check_timesteps(x0.shape()[0], timesteps)?;
		if noise.shape() != x0.shape() {
			return Err(UmiError::shape(format!("noise of shape {:?} does not match images of shape {:?}", noise.shape(), x0.shape())));
		}

		let alpha_hat = self.schedule.gather_alphas_cumprod(timesteps)?;
		let sqrt_alpha_hat = alpha_hat.mapv(f32::sqrt);
		let sqrt_one_minus_alpha_hat = alpha_hat.mapv(|a| (1.0 - a).sqrt());
		Ok(&sqrt_alpha_hat * &x0 + &sqrt_one_minus_alpha_hat * &noise)
	}

	/// The noise injected by the reverse update at `timestep`: standard normal for `t > 1`, all zeros on the final step
	/// (`t == 1`) so the returned images carry no residual stochastic noise.
	pub fn step_noise<R: Rng + ?Sized>(&self, timestep: usize, dim: Ix4, rng: &mut R) -> Array4<f32> {
		if timestep > 1 {
			Array4::<f32>::random_using(dim, StandardNormal, rng)
		} else {
			Array4::zeros(dim)
		}
	}

	/// One reverse update:
	///
	/// `x_{t-1} = 1/sqrt(α_t) · (x_t - (1 - α_t)/sqrt(1 - ᾱ_t) · ε̂) + sqrt(β_t) · z`
	pub fn step(&self, sample: ArrayView4<'_, f32>, predicted_noise: ArrayView4<'_, f32>, timestep: usize, noise: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
		let coefficients = self
			.schedule
			.coefficients(timestep)
			.ok_or_else(|| UmiError::shape(format!("timestep {timestep} out of bounds for a schedule of {} steps", self.noise_steps())))?;
		if predicted_noise.shape() != sample.shape() || noise.shape() != sample.shape() {
			return Err(UmiError::shape(format!(
				"sample {:?}, predicted noise {:?} and noise {:?} must share a shape",
				sample.shape(),
				predicted_noise.shape(),
				noise.shape()
			)));
		}

		let sample_coeff = 1.0 / coefficients.alpha.sqrt();
		let noise_pred_coeff = (1.0 - coefficients.alpha) / (1.0 - coefficients.alpha_hat).sqrt();
		let sigma = coefficients.beta.sqrt();

		let mut prev_sample = Array4::<f32>::zeros(sample.raw_dim());
		Zip::from(&mut prev_sample)
			.and(&sample)
			.and(&predicted_noise)
			.and(&noise)
			.par_for_each(|prev, &x, &eps, &z| *prev = sample_coeff * (x - noise_pred_coeff * eps) + sigma * z);
		Ok(prev_sample)
	}

	/// Generates one image per label and returns them as 8-bit pixel values in `[0, 255]`.
	///
	/// When `cfg_scale > 0`, every step runs the model twice (conditional and unconditional) and blends the predictions
	/// with [`classifier_free_guidance`]; at `cfg_scale <= 0` the unconditional pass is skipped entirely.
	///
	/// # Errors
	/// Fails if `labels` is empty, if the model fails or returns a prediction of the wrong shape, or if the sample
	/// becomes non-finite. Sampling is all-or-nothing: no partial images are returned.
	pub fn sample<M, R>(&self, model: &M, labels: &[Label], cfg_scale: f32, rng: &mut R) -> Result<Array4<u8>>
	where
		M: NoisePredictor + ?Sized,
		R: Rng + ?Sized
	{
		self.sample_with_progress(model, labels, cfg_scale, rng, |_, _| true)
	}

	/// Like [`DDPMDiffusion::sample`], calling `progress(step, timestep)` after each reverse step. Returning `false`
	/// aborts the sample with [`UmiError::Interrupted`].
	pub fn sample_with_progress<M, R, F>(&self, model: &M, labels: &[Label], cfg_scale: f32, rng: &mut R, progress: F) -> Result<Array4<u8>>
	where
		M: NoisePredictor + ?Sized,
		R: Rng + ?Sized,
		F: FnMut(usize, usize) -> bool
	{
		let x = self.denoise(model, labels, cfg_scale, rng, progress)?;
		Ok(to_pixels(x.view()))
	}

	/// Runs the reverse process and returns the raw final sample, before clamping and pixel conversion.
	pub fn denoise<M, R, F>(&self, model: &M, labels: &[Label], cfg_scale: f32, rng: &mut R, mut progress: F) -> Result<Array4<f32>>
	where
		M: NoisePredictor + ?Sized,
		R: Rng + ?Sized,
		F: FnMut(usize, usize) -> bool
	{
		let n = labels.len();
		if n == 0 {
			return Err(UmiError::shape("cannot sample an empty batch"));
		}
		tracing::info!(n, cfg_scale, steps = self.noise_steps() - 1, "sampling new images");

		let mut x = Array4::<f32>::random_using(self.image_shape(n), StandardNormal, rng);
		let unconditional_labels = (cfg_scale > 0.0).then(|| Label::unconditional(n));

		for (i, t) in (1..self.noise_steps()).rev().enumerate() {
			let timesteps = vec![t; n];
			let mut predicted_noise = model.predict(x.view(), &timesteps, labels)?;
			check_prediction(&x, &predicted_noise)?;
			if let Some(unconditional_labels) = unconditional_labels.as_deref() {
				let uncond_predicted_noise = model.predict(x.view(), &timesteps, unconditional_labels)?;
				check_prediction(&x, &uncond_predicted_noise)?;
				predicted_noise = classifier_free_guidance(uncond_predicted_noise.view(), predicted_noise.view(), cfg_scale);
			}

			let noise = self.step_noise(t, x.raw_dim(), rng);
			x = self.step(x.view(), predicted_noise.view(), t, noise.view())?;

			if x.iter().any(|v| !v.is_finite()) {
				tracing::error!(timestep = t, "reverse process diverged");
				return Err(UmiError::NumericalFailure { timestep: t });
			}
			if !progress(i, t) {
				return Err(UmiError::Interrupted { timestep: t });
			}
		}

		Ok(x)
	}

	fn check_images(&self, images: &ArrayView4<'_, f32>) -> Result<()> {
		let (_, c, h, w) = images.dim();
		if c != self.channels || h != self.img_size || w != self.img_size {
			return Err(UmiError::shape(format!(
				"expected images of shape (_, {}, {}, {}), got {:?}",
				self.channels,
				self.img_size,
				self.img_size,
				images.shape()
			)));
		}
		Ok(())
	}

	fn check_timesteps(&self, batch_size: usize, timesteps: &[usize]) -> Result<()> {
		if timesteps.len() != batch_size {
			return Err(UmiError::shape(format!("{} timesteps for a batch of {batch_size} images", timesteps.len())));
		}
		Ok(())
	}
}

fn check_prediction(sample: &Array4<f32>, prediction: &Array4<f32>) -> Result<()> {
	if prediction.shape() != sample.shape() {
		return Err(UmiError::shape(format!("model returned {:?} for an input of shape {:?}", prediction.shape(), sample.shape())));
	}
	Ok(())
}

/// Blends unconditional and conditional noise predictions: `uncond + scale · (cond - uncond)`.
///
/// `scale` is not clamped; values above 1 extrapolate past the conditional prediction.
pub fn classifier_free_guidance(uncond: ArrayView4<'_, f32>, cond: ArrayView4<'_, f32>, scale: f32) -> Array4<f32> {
	let mut guided = Array4::<f32>::zeros(cond.raw_dim());
	Zip::from(&mut guided).and(&uncond).and(&cond).par_for_each(|g, &u, &c| *g = u + scale * (c - u));
	guided
}

/// Maps samples from `[-1, 1]` to 8-bit pixels: clamp, rescale to `[0, 1]`, multiply by 255 and truncate.
pub fn to_pixels(sample: ArrayView4<'_, f32>) -> Array4<u8> {
	sample.mapv(|v| ((v.clamp(-1.0, 1.0) + 1.0) / 2.0 * 255.0).to_u8().unwrap_or(0))
}
