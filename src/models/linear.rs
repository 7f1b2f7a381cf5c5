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

use ndarray::{Array1, Array2, Array4, ArrayView4, Axis, Zip};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::Rng;

use super::{Differentiable, Label, NoisePredictor, Parameter, Parameterized};
use crate::{Result, UmiError};

const INIT_STD: f32 = 0.02;

/// A tiny class-conditional denoiser with closed-form gradients.
///
/// For sample `b`, channel `c`:
///
/// `ε̂[b, c, h, w] = w_in[c] · x[b, c, h, w] + w_t[c] · t_b / T + e[k_b, c]`
///
/// where `e` is a `(num_classes + 1, channels)` class embedding whose last row is the unconditional class. It is far
/// too small to generate anything interesting, but it exercises every contract the training loop and the sampler rely
/// on without an external deep learning runtime.
#[derive(Debug, Clone)]
pub struct ConditionalAffineDenoiser {
	input_weight: Parameter,
	time_weight: Parameter,
	class_embedding: Parameter,
	channels: usize,
	num_classes: usize,
	noise_steps: usize,
	training: bool
}

impl ConditionalAffineDenoiser {
	/// Creates a denoiser for `channels`-channel images, `num_classes` classes and a `noise_steps`-step schedule, with
	/// weights drawn from `N(0, 0.02²)`.
	pub fn new<R: Rng + ?Sized>(channels: usize, num_classes: usize, noise_steps: usize, rng: &mut R) -> Self {
		let input_weight = Array1::<f32>::random_using(channels, StandardNormal, rng) * INIT_STD;
		let time_weight = Array1::<f32>::random_using(channels, StandardNormal, rng) * INIT_STD;
		let class_embedding = Array2::<f32>::random_using((num_classes + 1, channels), StandardNormal, rng) * INIT_STD;
		Self {
			input_weight: Parameter::new("input.weight", input_weight.into_dyn()),
			time_weight: Parameter::new("time.weight", time_weight.into_dyn()),
			class_embedding: Parameter::new("class_embedding", class_embedding.into_dyn()),
			channels,
			num_classes,
			noise_steps: noise_steps.max(1),
			training: true
		}
	}

	/// Number of image channels the model accepts.
	pub fn channels(&self) -> usize {
		self.channels
	}

	/// Number of conditional classes, excluding the unconditional row.
	pub fn num_classes(&self) -> usize {
		self.num_classes
	}

	fn embedding_row(&self, label: &Label) -> Result<usize> {
		match label {
			Label::Conditional(class) if *class < self.num_classes => Ok(*class),
			Label::Conditional(class) => Err(UmiError::shape(format!("class index {class} out of range for {} classes", self.num_classes))),
			Label::Unconditional => Ok(self.num_classes)
		}
	}

	fn check_inputs(&self, x_t: &ArrayView4<'_, f32>, timesteps: &[usize], labels: &[Label]) -> Result<Vec<usize>> {
		let batch = x_t.shape()[0];
		if x_t.shape()[1] != self.channels {
			return Err(UmiError::shape(format!("expected {} channels, got {}", self.channels, x_t.shape()[1])));
		}
		if timesteps.len() != batch || labels.len() != batch {
			return Err(UmiError::shape(format!(
				"batch of {batch} images with {} timesteps and {} labels",
				timesteps.len(),
				labels.len()
			)));
		}
		labels.iter().map(|l| self.embedding_row(l)).collect()
	}

	fn time_fraction(&self, timestep: usize) -> f32 {
		timestep as f32 / self.noise_steps as f32
	}

	fn class_embedding(&self) -> Result<Array2<f32>> {
		Ok(self.class_embedding.value().view().into_dimensionality()?.to_owned())
	}
}

impl NoisePredictor for ConditionalAffineDenoiser {
	fn predict(&self, x_t: ArrayView4<'_, f32>, timesteps: &[usize], labels: &[Label]) -> Result<Array4<f32>> {
		let rows = self.check_inputs(&x_t, timesteps, labels)?;
		let embedding = self.class_embedding()?;
		let mut output = Array4::<f32>::zeros(x_t.raw_dim());
		for (b, (mut out_b, x_b)) in output.outer_iter_mut().zip(x_t.outer_iter()).enumerate() {
			let tau = self.time_fraction(timesteps[b]);
			for (c, (mut out_bc, x_bc)) in out_b.outer_iter_mut().zip(x_b.outer_iter()).enumerate() {
				let scale = self.input_weight.value()[c];
				let shift = self.time_weight.value()[c] * tau + embedding[[rows[b], c]];
				Zip::from(&mut out_bc).and(&x_bc).for_each(|o, &x| *o = scale * x + shift);
			}
		}
		Ok(output)
	}
}

impl Parameterized for ConditionalAffineDenoiser {
	fn parameters(&self) -> Vec<&Parameter> {
		vec![&self.input_weight, &self.time_weight, &self.class_embedding]
	}

	fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
		vec![&mut self.input_weight, &mut self.time_weight, &mut self.class_embedding]
	}

	fn train(&mut self, mode: bool) {
		self.training = mode;
	}

	fn is_training(&self) -> bool {
		self.training
	}
}

impl Differentiable for ConditionalAffineDenoiser {
	fn backward(&mut self, x_t: ArrayView4<'_, f32>, timesteps: &[usize], labels: &[Label], grad_output: ArrayView4<'_, f32>) -> Result<()> {
		let rows = self.check_inputs(&x_t, timesteps, labels)?;
		if grad_output.shape() != x_t.shape() {
			return Err(UmiError::shape(format!("grad_output {:?} does not match input {:?}", grad_output.shape(), x_t.shape())));
		}

		let mut d_input = Array1::<f32>::zeros(self.channels);
		let mut d_time = Array1::<f32>::zeros(self.channels);
		let mut d_embedding = Array2::<f32>::zeros((self.num_classes + 1, self.channels));
		for (b, (g_b, x_b)) in grad_output.outer_iter().zip(x_t.outer_iter()).enumerate() {
			let tau = self.time_fraction(timesteps[b]);
			for (c, (g_bc, x_bc)) in g_b.axis_iter(Axis(0)).zip(x_b.axis_iter(Axis(0))).enumerate() {
				let g_sum = g_bc.sum();
				d_input[c] += Zip::from(&g_bc).and(&x_bc).fold(0.0, |acc, &g, &x| acc + g * x);
				d_time[c] += g_sum * tau;
				d_embedding[[rows[b], c]] += g_sum;
			}
		}

		self.input_weight.accumulate_grad(d_input.into_dyn().view())?;
		self.time_weight.accumulate_grad(d_time.into_dyn().view())?;
		self.class_embedding.accumulate_grad(d_embedding.into_dyn().view())?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use ndarray::{Array4, ArrayView4};
	use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
	use rand::{rngs::StdRng, SeedableRng};

	use super::ConditionalAffineDenoiser;
	use crate::models::{Differentiable, Label, NoisePredictor, Parameterized};

	fn loss(model: &ConditionalAffineDenoiser, x: ArrayView4<'_, f32>, t: &[usize], labels: &[Label], target: &Array4<f32>) -> f32 {
		let pred = model.predict(x, t, labels).unwrap();
		(&pred - target).mapv(|v| v * v).sum() / 2.0
	}

	#[test]
	fn test_gradients_match_finite_differences() {
		let mut rng = StdRng::seed_from_u64(7);
		let mut model = ConditionalAffineDenoiser::new(2, 3, 100, &mut rng);
		let x = Array4::<f32>::random_using((2, 2, 3, 3), StandardNormal, &mut rng);
		let target = Array4::<f32>::random_using((2, 2, 3, 3), StandardNormal, &mut rng);
		let t = [10, 90];
		let labels = [Label::Conditional(2), Label::Unconditional];

		let pred = model.predict(x.view(), &t, &labels).unwrap();
		let grad_output = &pred - &target;
		model.backward(x.view(), &t, &labels, grad_output.view()).unwrap();
		let analytic: Vec<Vec<f32>> = model.parameters().iter().map(|p| p.grad().iter().copied().collect()).collect();

		let eps = 1e-2;
		for (pi, grads) in analytic.iter().enumerate() {
			for (ei, &g) in grads.iter().enumerate() {
				let mut plus = model.clone();
				plus.parameters_mut()[pi].value_mut().as_slice_mut().unwrap()[ei] += eps;
				let mut minus = model.clone();
				minus.parameters_mut()[pi].value_mut().as_slice_mut().unwrap()[ei] -= eps;
				let numeric = (loss(&plus, x.view(), &t, &labels, &target) - loss(&minus, x.view(), &t, &labels, &target)) / (2.0 * eps);
				assert!((numeric - g).abs() < 1e-2 * (1.0 + g.abs()), "param {pi}[{ei}]: analytic {g}, numeric {numeric}");
			}
		}
	}

	#[test]
	fn test_rejects_bad_batches() {
		let model = ConditionalAffineDenoiser::new(3, 2, 1000, &mut StdRng::seed_from_u64(0));
		let x = Array4::<f32>::zeros((2, 3, 4, 4));
		assert!(model.predict(x.view(), &[1], &Label::unconditional(2)).is_err());
		assert!(model.predict(x.view(), &[1, 2], &[Label::Conditional(5), Label::Unconditional]).is_err());
		assert!(model.predict(Array4::<f32>::zeros((2, 1, 4, 4)).view(), &[1, 2], &Label::unconditional(2)).is_err());
	}
}
