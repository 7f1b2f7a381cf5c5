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

//! Gradient-descent optimizers over a [`Parameterized`] model.

use std::collections::HashMap;

use ndarray::{ArrayD, Zip};

use crate::models::Parameterized;
use crate::{Result, UmiError};

/// A stepper over a model's parameters.
pub trait Optimizer {
	/// Clears accumulated gradients.
	fn zero_grad<M: Parameterized + ?Sized>(&mut self, model: &mut M) {
		for parameter in model.parameters_mut() {
			parameter.zero_grad();
		}
	}

	/// Applies one update using the currently accumulated gradients. Parameters that do not require gradients are left
	/// untouched.
	fn step<M: Parameterized + ?Sized>(&mut self, model: &mut M) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Moments {
	first: ArrayD<f32>,
	second: ArrayD<f32>
}

/// Adam with decoupled weight decay ([Loshchilov & Hutter][adamw]).
///
/// [adamw]: https://arxiv.org/abs/1711.05101
#[derive(Debug, Clone)]
pub struct AdamW {
	lr: f32,
	betas: (f32, f32),
	eps: f32,
	weight_decay: f32,
	steps: i32,
	moments: HashMap<String, Moments>
}

impl AdamW {
	/// Creates an optimizer with the given learning rate and PyTorch's defaults for everything else (`betas = (0.9,
	/// 0.999)`, `eps = 1e-8`, `weight_decay = 0.01`).
	///
	/// # Errors
	/// Returns [`UmiError::Configuration`] if `lr` is not positive and finite.
	pub fn new(lr: f32) -> Result<Self> {
		if !(lr > 0.0 && lr.is_finite()) {
			return Err(UmiError::config(format!("learning rate ({lr}) must be positive and finite")));
		}
		Ok(Self { lr, betas: (0.9, 0.999), eps: 1e-8, weight_decay: 0.01, steps: 0, moments: HashMap::new() })
	}

	/// Sets the decoupled weight decay. Defaults to 0.01.
	pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
		self.weight_decay = weight_decay;
		self
	}

	/// Sets the decay rates of the first and second moments.
	pub fn with_betas(mut self, betas: (f32, f32)) -> Self {
		self.betas = betas;
		self
	}

	/// Sets the denominator epsilon.
	pub fn with_eps(mut self, eps: f32) -> Self {
		self.eps = eps;
		self
	}

	/// The current learning rate.
	pub fn learning_rate(&self) -> f32 {
		self.lr
	}

	/// Changes the learning rate for subsequent steps.
	pub fn set_learning_rate(&mut self, lr: f32) {
		self.lr = lr;
	}
}

impl Optimizer for AdamW {
	fn step<M: Parameterized + ?Sized>(&mut self, model: &mut M) -> Result<()> {
		self.steps = self.steps.saturating_add(1);
		let (beta1, beta2) = self.betas;
		let bias_correction1 = 1.0 - beta1.powi(self.steps);
		let bias_correction2 = 1.0 - beta2.powi(self.steps);
		let (lr, eps, decay) = (self.lr, self.eps, 1.0 - self.lr * self.weight_decay);

		for parameter in model.parameters_mut() {
			if !parameter.requires_grad() {
				continue;
			}
			let moments = self.moments.entry(parameter.name().to_owned()).or_insert_with(|| Moments {
				first: ArrayD::zeros(parameter.value().raw_dim()),
				second: ArrayD::zeros(parameter.value().raw_dim())
			});
			if moments.first.shape() != parameter.shape() {
				return Err(UmiError::config(format!("parameter `{}` changed shape between optimizer steps", parameter.name())));
			}

			let (value, grad) = parameter.value_and_grad_mut();
			Zip::from(value).and(grad).and(&mut moments.first).and(&mut moments.second).par_for_each(|p, &g, m, v| {
				*p *= decay;
				*m = beta1 * *m + (1.0 - beta1) * g;
				*v = beta2 * *v + (1.0 - beta2) * g * g;
				let m_hat = *m / bias_correction1;
				let v_hat = *v / bias_correction2;
				*p -= lr * m_hat / (v_hat.sqrt() + eps);
			});
		}
		Ok(())
	}
}
