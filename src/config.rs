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

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ema::{DEFAULT_EMA_DECAY, DEFAULT_EMA_WARMUP_STEPS};
use crate::{BetaSchedule, Result, UmiError};

/// The device tensors are placed on. All tensors used together must live on the same device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum DiffusionDevice {
	/// Use the CPU as a device. **This is the default device.**
	#[default]
	Cpu
}

/// Hyperparameters for training and sampling.
///
/// Every field has a default, so a TOML file only needs to list what it overrides:
/// ```toml
/// num-epochs = 300
/// img-size = 32
/// sample-every = 25
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct UmiConfig {
	/// Number of passes over the data loader.
	pub num_epochs: usize,
	/// AdamW learning rate.
	pub lr: f32,
	/// AdamW decoupled weight decay.
	pub weight_decay: f32,
	/// Number of diffusion timesteps `T`.
	pub noise_steps: usize,
	/// `β` of the first timestep.
	pub beta_start: f32,
	/// `β` of the last timestep.
	pub beta_end: f32,
	/// Interpolation between `beta_start` and `beta_end`.
	pub beta_schedule: BetaSchedule,
	/// Probability of dropping a batch's labels during training, which trains the unconditional branch used by
	/// classifier-free guidance.
	pub p_uncond: f32,
	/// EMA decay `β`, in `[0, 1)`.
	pub ema_decay: f32,
	/// Number of initial EMA steps that copy the live weights instead of averaging them.
	pub ema_warmup_steps: usize,
	/// Guidance scale used for the periodic inspection samples. `0` disables guidance.
	pub cfg_scale: f32,
	/// Where tensors live.
	pub device: DiffusionDevice,
	/// Images are `img_size`×`img_size`.
	pub img_size: usize,
	/// Image channels; 1 or 3 for image export.
	pub channels: usize,
	/// Number of conditional classes. Labels must lie in `0..num_classes`.
	pub num_classes: usize,
	/// Draw inspection samples with the EMA model after every `n`th epoch; `None` disables.
	pub sample_every: Option<usize>,
	/// Push the live and EMA weights to the model store after every `n`th epoch; `None` disables.
	pub checkpoint_every: Option<usize>,
	/// Directory inspection samples are written to, if any.
	pub sample_dir: Option<PathBuf>,
	/// Seed for every random draw made by the orchestrator. A random seed is chosen when unset.
	pub seed: Option<u64>,
	/// Model store identifier pushed to by checkpoints, e.g. `username/umi`.
	pub repo: String
}

impl Default for UmiConfig {
	fn default() -> Self {
		Self {
			num_epochs: 500,
			lr: 3e-4,
			weight_decay: 0.01,
			noise_steps: 1000,
			beta_start: 1e-4,
			beta_end: 0.02,
			beta_schedule: BetaSchedule::Linear,
			p_uncond: 0.1,
			ema_decay: DEFAULT_EMA_DECAY,
			ema_warmup_steps: DEFAULT_EMA_WARMUP_STEPS,
			cfg_scale: 3.0,
			device: DiffusionDevice::Cpu,
			img_size: 64,
			channels: 3,
			num_classes: 10,
			sample_every: Some(50),
			checkpoint_every: Some(50),
			sample_dir: None,
			seed: None,
			repo: "umi".to_owned()
		}
	}
}

impl UmiConfig {
	/// Reads a TOML config file. Missing keys take their default values.
	pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
		let file = fs::read_to_string(path)?;
		let config: UmiConfig = toml::from_str(&file)?;
		Ok(config)
	}

	/// Checks hyperparameters that can be validated without building the schedule.
	pub fn validate(&self) -> Result<()> {
		if !(self.lr > 0.0 && self.lr.is_finite()) {
			return Err(UmiError::config(format!("lr ({}) must be positive and finite", self.lr)));
		}
		if !(0.0..=1.0).contains(&self.p_uncond) {
			return Err(UmiError::config(format!("p_uncond ({}) must be in [0, 1]", self.p_uncond)));
		}
		if !(0.0..1.0).contains(&self.ema_decay) {
			return Err(UmiError::config(format!("ema_decay ({}) must be in [0, 1)", self.ema_decay)));
		}
		if !self.cfg_scale.is_finite() {
			return Err(UmiError::config(format!("cfg_scale ({}) must be finite", self.cfg_scale)));
		}
		if self.noise_steps < 2 {
			return Err(UmiError::config(format!("noise_steps ({}) must be >= 2", self.noise_steps)));
		}
		if self.img_size == 0 || self.channels == 0 || self.num_classes == 0 {
			return Err(UmiError::config("img_size, channels and num_classes must be >0"));
		}
		if self.sample_every == Some(0) || self.checkpoint_every == Some(0) {
			return Err(UmiError::config("sample_every and checkpoint_every must be >0 when set"));
		}
		if self.repo.trim().is_empty() {
			return Err(UmiError::config("repo must not be empty"));
		}
		Ok(())
	}
}
