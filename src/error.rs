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

//! Errors produced by the diffusion core and the [`Umi`](crate::Umi) orchestrator.

use thiserror::Error;

/// Result type used throughout `umi-diffusion`.
pub type Result<T, E = UmiError> = std::result::Result<T, E>;

/// Errors produced while configuring, training or sampling.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UmiError {
	/// Invalid schedule bounds, hyperparameters, or mismatched shadow/live model structure. Always reported at
	/// construction time and never recovered from inside the training loop.
	#[error("configuration error: {0}")]
	Configuration(String),
	/// Image, label or timestep batches that disagree in shape.
	#[error("shape mismatch: {0}")]
	ShapeMismatch(String),
	/// Persistence or authentication failure.
	#[error("external I/O error: {0:#}")]
	ExternalIo(#[source] anyhow::Error),
	/// The reverse recurrence produced NaN or infinite values.
	#[error("non-finite values in sample at timestep {timestep}")]
	NumericalFailure {
		/// The timestep whose update produced non-finite values.
		timestep: usize
	},
	/// The training loss was NaN or infinite.
	#[error("non-finite training loss ({0})")]
	NonFiniteLoss(f32),
	/// A progress callback asked to stop sampling.
	#[error("sampling interrupted by callback at timestep {timestep}")]
	Interrupted {
		/// The timestep at which the callback returned `false`.
		timestep: usize
	}
}

impl UmiError {
	pub(crate) fn config(msg: impl Into<String>) -> Self {
		Self::Configuration(msg.into())
	}

	pub(crate) fn shape(msg: impl Into<String>) -> Self {
		Self::ShapeMismatch(msg.into())
	}

	/// Returns `true` for configuration-class errors, which abort a training run instead of skipping a batch.
	pub fn is_configuration(&self) -> bool {
		matches!(self, Self::Configuration(_))
	}
}

impl From<ndarray::ShapeError> for UmiError {
	fn from(value: ndarray::ShapeError) -> Self {
		Self::ShapeMismatch(value.to_string())
	}
}
