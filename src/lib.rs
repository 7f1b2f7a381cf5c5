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

//! `umi-diffusion` trains and samples class-conditional denoising diffusion probabilistic models (DDPM) with
//! classifier-free guidance and exponential-moving-average weights.
//!
//! The noise-prediction network is an external collaborator: anything implementing [`NoisePredictor`],
//! [`Parameterized`] and [`Differentiable`] can be trained by [`Umi`]. [`ConditionalAffineDenoiser`] is a small
//! reference model with analytic gradients.
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use rand::{rngs::StdRng, SeedableRng};
//! use umi_diffusion::{ConditionalAffineDenoiser, Label, Umi, UmiConfig};
//!
//! let config = UmiConfig { num_classes: 10, ..Default::default() };
//! let model = ConditionalAffineDenoiser::new(config.channels, config.num_classes, config.noise_steps, &mut StdRng::seed_from_u64(42));
//! let mut umi = Umi::new(config, model)?;
//!
//! // one image of class 3, one unconditional
//! let pixels = umi.sample_ema(&[Label::Conditional(3), Label::Unconditional], 3.0)?;
//! assert_eq!(pixels.shape(), &[2, 3, 64, 64]);
//! # Ok(())
//! # }
//! ```
//!
//! See [`DDPMDiffusion`] for the forward and reverse processes, and [`Ema`] for weight averaging.

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

pub(crate) mod config;
pub mod data;
pub mod ema;
pub(crate) mod error;
pub mod hub;
pub mod models;
pub mod optim;
pub mod pipelines;
pub mod schedulers;
pub mod util;

pub use self::config::{DiffusionDevice, UmiConfig};
pub use self::data::{Batch, DataLoader, InMemoryDataLoader};
pub use self::ema::Ema;
pub use self::error::{Result, UmiError};
pub use self::hub::{Credentials, LocalStore, ModelStore};
pub use self::models::{ConditionalAffineDenoiser, Differentiable, InferenceMode, Label, NoisePredictor, Parameterized, StateDict};
pub use self::optim::{AdamW, Optimizer};
pub use self::pipelines::*;
pub use self::schedulers::*;
