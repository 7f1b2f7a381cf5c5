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

//! Contracts between the diffusion core and the noise-prediction network.
//!
//! The diffusion process only ever needs to *call* a model ([`NoisePredictor`]). Training additionally needs to read
//! and write its parameters ([`Parameterized`]) and to backpropagate a loss gradient ([`Differentiable`]). Anything
//! implementing these traits (and [`Clone`], for the EMA shadow) can be trained and sampled by [`Umi`](crate::Umi).

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use ndarray::{Array4, ArrayD, ArrayView4, ArrayViewD};
use serde::{Deserialize, Serialize};

use crate::{Result, UmiError};

mod linear;

pub use self::linear::ConditionalAffineDenoiser;

/// Conditioning for a single sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
	/// Condition on the given class index.
	Conditional(usize),
	/// The null class, used when a label is dropped during training and for the unconditional branch of
	/// classifier-free guidance.
	Unconditional
}

impl Label {
	/// Returns the class index, or `None` for [`Label::Unconditional`].
	pub fn class_index(&self) -> Option<usize> {
		match self {
			Label::Conditional(class) => Some(*class),
			Label::Unconditional => None
		}
	}

	/// A batch of `n` unconditional labels.
	pub fn unconditional(n: usize) -> Vec<Label> {
		vec![Label::Unconditional; n]
	}

	/// Wraps class indices as conditional labels.
	pub fn from_classes(classes: &[usize]) -> Vec<Label> {
		classes.iter().map(|&c| Label::Conditional(c)).collect()
	}
}

impl From<usize> for Label {
	fn from(value: usize) -> Self {
		Label::Conditional(value)
	}
}

/// A model that predicts the noise contained in `x_t`.
pub trait NoisePredictor {
	/// Predicts the noise in `x_t` (shape `(batch, channels, height, width)`) at the given per-sample timesteps.
	/// The output must have exactly the shape of `x_t`.
	fn predict(&self, x_t: ArrayView4<'_, f32>, timesteps: &[usize], labels: &[Label]) -> Result<Array4<f32>>;
}

impl<M: NoisePredictor + ?Sized> NoisePredictor for &M {
	fn predict(&self, x_t: ArrayView4<'_, f32>, timesteps: &[usize], labels: &[Label]) -> Result<Array4<f32>> {
		(**self).predict(x_t, timesteps, labels)
	}
}

/// A named, owned tensor with its gradient accumulator.
///
/// Cloning a parameter deep-copies both buffers, so a cloned model never shares storage with the original.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
	name: String,
	value: ArrayD<f32>,
	grad: ArrayD<f32>,
	requires_grad: bool
}

impl Parameter {
	/// Creates a trainable parameter with a zeroed gradient.
	pub fn new(name: impl Into<String>, value: ArrayD<f32>) -> Self {
		let grad = ArrayD::zeros(value.raw_dim());
		Self { name: name.into(), value, grad, requires_grad: true }
	}

	/// Unique name within the owning model.
	#[inline]
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Current value.
	#[inline]
	pub fn value(&self) -> &ArrayD<f32> {
		&self.value
	}

	/// Mutable access to the value.
	#[inline]
	pub fn value_mut(&mut self) -> &mut ArrayD<f32> {
		&mut self.value
	}

	/// Accumulated gradient, the same shape as the value.
	#[inline]
	pub fn grad(&self) -> &ArrayD<f32> {
		&self.grad
	}

	/// Simultaneous access to the value (mutable) and the gradient, as needed by optimizers.
	pub fn value_and_grad_mut(&mut self) -> (&mut ArrayD<f32>, &ArrayD<f32>) {
		(&mut self.value, &self.grad)
	}

	/// Whether gradients are accumulated and optimizer updates applied.
	#[inline]
	pub fn requires_grad(&self) -> bool {
		self.requires_grad
	}

	/// Freezes (`false`) or unfreezes the parameter.
	pub fn set_requires_grad(&mut self, requires_grad: bool) {
		self.requires_grad = requires_grad;
	}

	/// Shape of the value.
	pub fn shape(&self) -> &[usize] {
		self.value.shape()
	}

	/// Resets the accumulated gradient to zero.
	pub fn zero_grad(&mut self) {
		self.grad.fill(0.0);
	}

	/// Adds `grad` to the accumulated gradient. A no-op for frozen parameters.
	pub fn accumulate_grad(&mut self, grad: ArrayViewD<'_, f32>) -> Result<()> {
		if !self.requires_grad {
			return Ok(());
		}
		if grad.shape() != self.grad.shape() {
			return Err(UmiError::shape(format!("gradient of shape {:?} does not match parameter `{}` of shape {:?}", grad.shape(), self.name, self.grad.shape())));
		}
		self.grad += &grad;
		Ok(())
	}
}

/// A serializable snapshot of a model's parameter values, keyed by parameter name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
	/// Parameter values keyed by name.
	pub tensors: BTreeMap<String, ArrayD<f32>>
}

impl StateDict {
	/// Number of tensors.
	pub fn len(&self) -> usize {
		self.tensors.len()
	}

	/// Returns `true` if there are no tensors.
	pub fn is_empty(&self) -> bool {
		self.tensors.is_empty()
	}

	/// The tensor stored under `name`.
	pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
		self.tensors.get(name)
	}
}

/// A model with an enumerable, ordered set of parameters and a training/inference mode flag.
pub trait Parameterized {
	/// All parameters in a stable order. Two structurally identical models must list their parameters in the same order.
	fn parameters(&self) -> Vec<&Parameter>;

	/// Mutable access to [`Parameterized::parameters`], in the same order.
	fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

	/// Switches between training (`true`) and inference (`false`) mode.
	fn train(&mut self, mode: bool);

	/// Returns `true` in training mode.
	fn is_training(&self) -> bool;

	/// Enables or disables gradient tracking for every parameter.
	fn requires_grad_(&mut self, requires_grad: bool) {
		for parameter in self.parameters_mut() {
			parameter.set_requires_grad(requires_grad);
		}
	}

	/// Total number of scalar parameters.
	fn num_parameters(&self) -> usize {
		self.parameters().iter().map(|p| p.value().len()).sum()
	}

	/// Snapshots every parameter value.
	fn state_dict(&self) -> StateDict {
		StateDict {
			tensors: self.parameters().into_iter().map(|p| (p.name().to_owned(), p.value().clone())).collect()
		}
	}

	/// Overwrites parameter values from `state`. Every parameter must be present with a matching shape; nothing is
	/// written if any check fails.
	fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
		for parameter in self.parameters() {
			match state.get(parameter.name()) {
				Some(tensor) if tensor.shape() == parameter.shape() => {}
				Some(tensor) => {
					return Err(UmiError::config(format!(
						"parameter `{}` has shape {:?} in the state dict but {:?} in the model",
						parameter.name(),
						tensor.shape(),
						parameter.shape()
					)));
				}
				None => return Err(UmiError::config(format!("parameter `{}` is missing from the state dict", parameter.name())))
			}
		}
		for parameter in self.parameters_mut() {
			if let Some(tensor) = state.get(parameter.name()) {
				parameter.value_mut().assign(tensor);
			}
		}
		Ok(())
	}
}

/// A model that can backpropagate a loss gradient into its parameters.
pub trait Differentiable: NoisePredictor + Parameterized {
	/// Given `∂L/∂output` for the prediction on `(x_t, timesteps, labels)`, accumulates `∂L/∂θ` into the gradient of
	/// every parameter that requires gradients.
	fn backward(&mut self, x_t: ArrayView4<'_, f32>, timesteps: &[usize], labels: &[Label], grad_output: ArrayView4<'_, f32>) -> Result<()>;
}

/// Checks that two models have the same parameter names and shapes, in the same order.
pub fn ensure_same_structure<A: Parameterized + ?Sized, B: Parameterized + ?Sized>(a: &A, b: &B) -> Result<()> {
	let (a, b) = (a.parameters(), b.parameters());
	if a.len() != b.len() {
		return Err(UmiError::config(format!("models have {} and {} parameters", a.len(), b.len())));
	}
	for (pa, pb) in a.iter().zip(b.iter()) {
		if pa.name() != pb.name() || pa.shape() != pb.shape() {
			return Err(UmiError::config(format!(
				"parameter mismatch: `{}` {:?} vs `{}` {:?}",
				pa.name(),
				pa.shape(),
				pb.name(),
				pb.shape()
			)));
		}
	}
	Ok(())
}

/// Holds a model in inference mode for the guard's lifetime and restores the previous mode on drop, including when
/// the guarded work returns early with an error.
pub struct InferenceMode<'m, M: Parameterized + ?Sized> {
	model: &'m mut M,
	was_training: bool
}

impl<'m, M: Parameterized + ?Sized> InferenceMode<'m, M> {
	/// Switches `model` to inference mode until the guard is dropped.
	pub fn new(model: &'m mut M) -> Self {
		let was_training = model.is_training();
		model.train(false);
		Self { model, was_training }
	}
}

impl<M: Parameterized + ?Sized> Deref for InferenceMode<'_, M> {
	type Target = M;

	fn deref(&self) -> &Self::Target {
		self.model
	}
}

impl<M: Parameterized + ?Sized> DerefMut for InferenceMode<'_, M> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		self.model
	}
}

impl<M: Parameterized + ?Sized> Drop for InferenceMode<'_, M> {
	fn drop(&mut self) {
		self.model.train(self.was_training);
	}
}

#[cfg(test)]
mod tests {
	use ndarray::{ArrayD, IxDyn};
	use rand::{rngs::StdRng, SeedableRng};

	use super::{ensure_same_structure, ConditionalAffineDenoiser, InferenceMode, Label, Parameter, Parameterized};

	#[test]
	fn test_inference_mode_restores_training() {
		let mut model = ConditionalAffineDenoiser::new(3, 2, 1000, &mut StdRng::seed_from_u64(0));
		assert!(model.is_training());
		{
			let guard = InferenceMode::new(&mut model);
			assert!(!guard.is_training());
		}
		assert!(model.is_training());

		model.train(false);
		drop(InferenceMode::new(&mut model));
		assert!(!model.is_training());
	}

	#[test]
	fn test_state_dict_roundtrip_and_mismatch() {
		let mut rng = StdRng::seed_from_u64(1);
		let a = ConditionalAffineDenoiser::new(3, 2, 1000, &mut rng);
		let mut b = ConditionalAffineDenoiser::new(3, 2, 1000, &mut rng);
		assert_ne!(a.state_dict(), b.state_dict());
		b.load_state_dict(&a.state_dict()).unwrap();
		assert_eq!(a.state_dict(), b.state_dict());

		let mut c = ConditionalAffineDenoiser::new(1, 2, 1000, &mut rng);
		let before = c.state_dict();
		assert!(c.load_state_dict(&a.state_dict()).unwrap_err().is_configuration());
		assert_eq!(c.state_dict(), before);
		assert!(ensure_same_structure(&a, &c).is_err());
		assert!(ensure_same_structure(&a, &b).is_ok());
	}

	#[test]
	fn test_frozen_parameter_ignores_gradients() {
		let mut p = Parameter::new("w", ArrayD::zeros(IxDyn(&[2])));
		p.set_requires_grad(false);
		p.accumulate_grad(ArrayD::ones(IxDyn(&[2])).view()).unwrap();
		assert!(p.grad().iter().all(|&g| g == 0.0));
	}

	#[test]
	fn test_label_helpers() {
		assert_eq!(Label::from_classes(&[0, 1]), vec![Label::Conditional(0), Label::Conditional(1)]);
		assert_eq!(Label::Unconditional.class_index(), None);
		assert_eq!(Label::from(4).class_index(), Some(4));
	}
}
