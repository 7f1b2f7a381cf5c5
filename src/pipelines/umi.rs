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

use std::fmt;

use ndarray::Array4;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, error, info, warn};

use crate::data::{Batch, DataLoader};
use crate::ema::Ema;
use crate::hub::{Credentials, ModelStore};
use crate::models::{Differentiable, InferenceMode, Label};
use crate::optim::{AdamW, Optimizer};
use crate::{DDPMDiffusion, NoiseSchedule, Result, UmiConfig, UmiError};

/// Which set of weights to sample with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weights {
	/// The raw training weights.
	Live,
	/// The exponential moving average of the training weights.
	Ema
}

/// Summary of a [`Umi::train`] run.
#[derive(Debug, Clone, Default)]
pub struct TrainReport {
	/// Mean loss of each epoch, `None` if every batch of the epoch was skipped.
	pub epoch_losses: Vec<Option<f32>>,
	/// Number of optimizer steps taken.
	pub steps: usize,
	/// Number of batches skipped because of a recoverable error.
	pub skipped_batches: usize,
	/// The most recent periodic inspection samples, if any were drawn.
	pub last_samples: Option<Array4<u8>>
}

/// A class-conditional diffusion model: the noise-prediction network, its EMA shadow, the diffusion process and the
/// optimizer, wired together.
///
/// ```no_run
/// # fn main() -> anyhow::Result<()> {
/// use rand::{rngs::StdRng, SeedableRng};
/// use umi_diffusion::{ConditionalAffineDenoiser, InMemoryDataLoader, Label, LocalStore, Umi, UmiConfig};
///
/// let config = UmiConfig::from_file("umi.toml")?;
/// let model = ConditionalAffineDenoiser::new(config.channels, config.num_classes, config.noise_steps, &mut StdRng::seed_from_u64(0));
/// let mut umi = Umi::new(config, model)?.with_store(LocalStore::new("./checkpoints"));
///
/// # let (images, labels) = (ndarray::Array4::zeros((4, 3, 64, 64)), vec![0, 1, 0, 1]);
/// let mut loader = InMemoryDataLoader::new(images, labels, 2)?;
/// umi.train(&mut loader)?;
/// let pixels = umi.sample_ema(&Label::from_classes(&[0, 1]), 3.0)?;
/// # Ok(())
/// # }
/// ```
pub struct Umi<M> {
	config: UmiConfig,
	model: M,
	ema_model: M,
	ema: Ema,
	diffusion: DDPMDiffusion,
	optimizer: AdamW,
	rng: StdRng,
	store: Option<Box<dyn ModelStore>>
}

impl<M> fmt::Debug for Umi<M> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Umi")
			.field("config", &self.config)
			.field("ema", &self.ema)
			.field("has_store", &self.store.is_some())
			.finish_non_exhaustive()
	}
}

impl<M: Differentiable + Clone> Umi<M> {
	/// Validates `config` and builds the schedule, diffusion process, EMA shadow and optimizer around `model`.
	///
	/// # Errors
	/// Returns [`UmiError::Configuration`] for any invalid hyperparameter.
	pub fn new(config: UmiConfig, mut model: M) -> Result<Self> {
		config.validate()?;
		let schedule = NoiseSchedule::new(config.noise_steps, config.beta_start, config.beta_end, &config.beta_schedule)?;
		let diffusion = DDPMDiffusion::new(schedule, config.channels, config.img_size)?;
		let ema = Ema::new(config.ema_decay)?.with_warmup(config.ema_warmup_steps);
		let optimizer = AdamW::new(config.lr)?.with_weight_decay(config.weight_decay);

		model.train(true);
		model.requires_grad_(true);
		let ema_model = Ema::shadow_of(&model);

		let seed = config.seed.unwrap_or_else(|| rand::thread_rng().gen::<u64>());
		debug!(seed, parameters = model.num_parameters(), "initialized umi");

		Ok(Self { config, model, ema_model, ema, diffusion, optimizer, rng: StdRng::seed_from_u64(seed), store: None })
	}

	/// Uses `store` for [`Umi::save_pretrained`], [`Umi::load_pretrained`] and periodic checkpoints.
	pub fn with_store<S: ModelStore + 'static>(mut self, store: S) -> Self {
		self.store = Some(Box::new(store));
		self
	}

	/// The validated configuration.
	pub fn config(&self) -> &UmiConfig {
		&self.config
	}

	/// The live, trained model.
	pub fn model(&self) -> &M {
		&self.model
	}

	/// The EMA shadow of the live model.
	pub fn ema_model(&self) -> &M {
		&self.ema_model
	}

	/// The EMA tracker, including its step count.
	pub fn ema(&self) -> &Ema {
		&self.ema
	}

	/// The diffusion process used for training and sampling.
	pub fn diffusion(&self) -> &DDPMDiffusion {
		&self.diffusion
	}

	/// Trains for `config.num_epochs` epochs over `loader`.
	///
	/// Batches failing with a recoverable error (shape mismatches, non-finite losses) are logged and skipped; a
	/// configuration error aborts the run. Periodic sampling and checkpointing never abort training.
	pub fn train<D: DataLoader + ?Sized>(&mut self, loader: &mut D) -> Result<TrainReport> {
		info!(epochs = self.config.num_epochs, batches = loader.len(), parameters = self.model.num_parameters(), "starting training");
		let mut report = TrainReport::default();

		for epoch in 0..self.config.num_epochs {
			let (mut loss_sum, mut completed) = (0.0f32, 0usize);
			for (i, batch) in loader.batches().enumerate() {
				match self.train_step(&batch) {
					Ok(loss) => {
						loss_sum += loss;
						completed += 1;
					}
					Err(err) if err.is_configuration() => return Err(err),
					Err(err) => {
						warn!(epoch, batch = i, error = %err, "skipping batch");
						report.skipped_batches += 1;
					}
				}
			}
			report.steps += completed;

			let epoch_loss = (completed > 0).then(|| loss_sum / completed as f32);
			match epoch_loss {
				Some(loss) => info!(epoch, loss, "epoch finished"),
				None => warn!(epoch, "every batch of the epoch was skipped")
			}
			report.epoch_losses.push(epoch_loss);

			if let Some(samples) = self.run_periodic(epoch) {
				report.last_samples = Some(samples);
			}
		}

		Ok(report)
	}

	/// Runs one optimization step on `batch` and returns its loss.
	///
	/// Timesteps are drawn from `[1, T)`, the images are corrupted, and with probability `p_uncond` every label in the
	/// batch is replaced by [`Label::Unconditional`]. The EMA shadow is stepped after the optimizer.
	pub fn train_step(&mut self, batch: &Batch) -> Result<f32> {
		let n = batch.len();
		if n == 0 || batch.labels.len() != n {
			return Err(UmiError::shape(format!("batch of {n} images with {} labels", batch.labels.len())));
		}

		let timesteps = self.diffusion.sample_timesteps(n, &mut self.rng);
		let (x_t, noise) = self.diffusion.noise_images(batch.images.view(), &timesteps, &mut self.rng)?;
		let labels = if self.rng.gen::<f32>() < self.config.p_uncond { Label::unconditional(n) } else { Label::from_classes(&batch.labels) };

		let predicted_noise = self.model.predict(x_t.view(), &timesteps, &labels)?;
		if predicted_noise.shape() != noise.shape() {
			return Err(UmiError::shape(format!("model returned {:?} for an input of shape {:?}", predicted_noise.shape(), noise.shape())));
		}
		let residual = &predicted_noise - &noise;
		let loss = residual.mapv(|r| r * r).mean().unwrap_or(0.0);
		if !loss.is_finite() {
			return Err(UmiError::NonFiniteLoss(loss));
		}
		// d/dε̂ of mean((ε̂ - ε)²)
		let grad_output = residual * (2.0 / noise.len() as f32);

		self.optimizer.zero_grad(&mut self.model);
		self.model.backward(x_t.view(), &timesteps, &labels, grad_output.view())?;
		self.optimizer.step(&mut self.model)?;
		self.ema.step_ema(&mut self.ema_model, &self.model)?;

		Ok(loss)
	}

	/// Samples one image per label with the live weights. The model is held in inference mode for the duration of the
	/// call and returned to its previous mode afterwards, whether or not sampling succeeds.
	pub fn sample(&mut self, labels: &[Label], cfg_scale: f32) -> Result<Array4<u8>> {
		self.sample_with_progress(Weights::Live, labels, cfg_scale, |_, _| true)
	}

	/// Samples one image per label with the EMA weights.
	pub fn sample_ema(&mut self, labels: &[Label], cfg_scale: f32) -> Result<Array4<u8>> {
		self.sample_with_progress(Weights::Ema, labels, cfg_scale, |_, _| true)
	}

	/// Samples with the chosen weights, calling `progress(step, timestep)` after every reverse step.
	pub fn sample_with_progress<F>(&mut self, weights: Weights, labels: &[Label], cfg_scale: f32, progress: F) -> Result<Array4<u8>>
	where
		F: FnMut(usize, usize) -> bool
	{
		let model = match weights {
			Weights::Live => InferenceMode::new(&mut self.model),
			Weights::Ema => InferenceMode::new(&mut self.ema_model)
		};
		self.diffusion.sample_with_progress(&*model, labels, cfg_scale, &mut self.rng, progress)
	}

	/// Pushes the live weights to `config.repo` and the EMA weights to `<config.repo>-ema`.
	pub fn save_pretrained(&self) -> Result<()> {
		self.save_pretrained_to(&self.config.repo)
	}

	/// Pushes the live weights to `destination` and the EMA weights to `<destination>-ema`.
	pub fn save_pretrained_to(&self, destination: &str) -> Result<()> {
		let store = self.store()?;
		store.save(&self.model.state_dict(), destination).map_err(UmiError::ExternalIo)?;
		store.save(&self.ema_model.state_dict(), &format!("{destination}-ema")).map_err(UmiError::ExternalIo)?;
		info!(destination, "saved pretrained weights");
		Ok(())
	}

	/// Pulls the live weights from `source` and the EMA weights from `<source>-ema`. If no EMA weights can be pulled, the
	/// shadow is re-seeded from the loaded live weights.
	///
	/// Both state dicts are validated before anything is replaced; on error the current weights are kept.
	pub fn load_pretrained(&mut self, source: &str) -> Result<()> {
		let store = self.store()?;
		let state = store.load(source).map_err(UmiError::ExternalIo)?;
		let ema_source = format!("{source}-ema");
		let ema_state = match store.load(&ema_source) {
			Ok(ema_state) => Some(ema_state),
			Err(err) => {
				warn!(source = %ema_source, error = %err, "no EMA weights, re-seeding the shadow from the live weights");
				None
			}
		};

		let mut model = self.model.clone();
		model.load_state_dict(&state)?;
		let mut ema_model = Ema::shadow_of(&model);
		if let Some(ema_state) = &ema_state {
			ema_model.load_state_dict(ema_state)?;
		}

		self.model = model;
		self.ema_model = ema_model;
		info!(source, with_ema = ema_state.is_some(), "loaded pretrained weights");
		Ok(())
	}

	/// Authenticates against the model store.
	///
	/// # Errors
	/// Returns [`UmiError::Configuration`] for an empty token and [`UmiError::ExternalIo`] if there is no store or the
	/// store rejects the credentials.
	pub fn login(&mut self, token: &str) -> Result<()> {
		let credentials = Credentials::new(token)?;
		let store = self.store.as_mut().ok_or_else(|| UmiError::ExternalIo(anyhow::anyhow!("no model store configured")))?;
		store.login(credentials).map_err(UmiError::ExternalIo)?;
		info!("logged in to model store");
		Ok(())
	}

	fn store(&self) -> Result<&dyn ModelStore> {
		self.store.as_deref().ok_or_else(|| UmiError::ExternalIo(anyhow::anyhow!("no model store configured")))
	}

	fn run_periodic(&mut self, epoch: usize) -> Option<Array4<u8>> {
		let mut samples = None;
		if is_due(self.config.sample_every, epoch) {
			let labels = (0..self.config.num_classes).map(Label::Conditional).collect::<Vec<_>>();
			match self.sample_ema(&labels, self.config.cfg_scale) {
				Ok(pixels) => {
					self.export_samples(epoch, &pixels);
					samples = Some(pixels);
				}
				Err(err) => error!(epoch, error = %err, "failed to draw inspection samples")
			}
		}
		if is_due(self.config.checkpoint_every, epoch) {
			if let Err(err) = self.save_pretrained() {
				error!(epoch, error = %err, "failed to save checkpoint");
			}
		}
		samples
	}

	fn export_samples(&self, epoch: usize, pixels: &Array4<u8>) {
		cfg_if::cfg_if! {
			if #[cfg(feature = "image-export")] {
				if let Some(dir) = &self.config.sample_dir {
					let path = dir.join(format!("epoch-{epoch}.png"));
					match crate::util::image::save_images(pixels.view(), &path) {
						Ok(()) => debug!(path = %path.display(), "saved inspection samples"),
						Err(err) => error!(epoch, error = %err, "failed to save inspection samples")
					}
				}
			} else {
				let _ = (epoch, pixels);
			}
		}
	}
}

fn is_due(every: Option<usize>, epoch: usize) -> bool {
	matches!(every, Some(every) if (epoch + 1) % every == 0)
}

#[cfg(test)]
mod tests {
	use std::{cell::Cell, rc::Rc};

	use ndarray::{Array4, ArrayView4};
	use rand::{rngs::StdRng, SeedableRng};

	use super::{is_due, Umi, Weights};
	use crate::data::{Batch, InMemoryDataLoader};
	use crate::models::{ConditionalAffineDenoiser, Differentiable, Label, NoisePredictor, Parameter, Parameterized};
	use crate::{Result, UmiConfig, UmiError};

	fn config() -> UmiConfig {
		UmiConfig {
			noise_steps: 20,
			img_size: 4,
			channels: 1,
			num_classes: 2,
			sample_every: None,
			checkpoint_every: None,
			seed: Some(0),
			..Default::default()
		}
	}

	fn denoiser(config: &UmiConfig) -> ConditionalAffineDenoiser {
		ConditionalAffineDenoiser::new(config.channels, config.num_classes, config.noise_steps, &mut StdRng::seed_from_u64(9))
	}

	/// Fails every prediction, to check that sampling restores the training flag on error.
	#[derive(Clone)]
	struct Failing {
		weight: Parameter,
		training: bool
	}

	impl NoisePredictor for Failing {
		fn predict(&self, _: ArrayView4<'_, f32>, _: &[usize], _: &[Label]) -> Result<Array4<f32>> {
			Err(UmiError::ShapeMismatch("always fails".to_owned()))
		}
	}

	impl Parameterized for Failing {
		fn parameters(&self) -> Vec<&Parameter> {
			vec![&self.weight]
		}

		fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
			vec![&mut self.weight]
		}

		fn train(&mut self, mode: bool) {
			self.training = mode;
		}

		fn is_training(&self) -> bool {
			self.training
		}
	}

	impl Differentiable for Failing {
		fn backward(&mut self, _: ArrayView4<'_, f32>, _: &[usize], _: &[Label], _: ArrayView4<'_, f32>) -> Result<()> {
			Ok(())
		}
	}

	/// Wraps the reference denoiser, tallying the labels it is trained on. Optionally fails `backward` with a
	/// configuration error.
	#[derive(Clone)]
	struct Tally {
		inner: ConditionalAffineDenoiser,
		conditional: Rc<Cell<usize>>,
		unconditional: Rc<Cell<usize>>,
		misconfigured: bool
	}

	impl Tally {
		fn new(config: &UmiConfig) -> Self {
			Self { inner: denoiser(config), conditional: Rc::default(), unconditional: Rc::default(), misconfigured: false }
		}
	}

	impl NoisePredictor for Tally {
		fn predict(&self, x_t: ArrayView4<'_, f32>, timesteps: &[usize], labels: &[Label]) -> Result<Array4<f32>> {
			for label in labels {
				let counter = if label.class_index().is_some() { &self.conditional } else { &self.unconditional };
				counter.set(counter.get() + 1);
			}
			self.inner.predict(x_t, timesteps, labels)
		}
	}

	impl Parameterized for Tally {
		fn parameters(&self) -> Vec<&Parameter> {
			self.inner.parameters()
		}

		fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
			self.inner.parameters_mut()
		}

		fn train(&mut self, mode: bool) {
			self.inner.train(mode);
		}

		fn is_training(&self) -> bool {
			self.inner.is_training()
		}
	}

	impl Differentiable for Tally {
		fn backward(&mut self, x_t: ArrayView4<'_, f32>, timesteps: &[usize], labels: &[Label], grad_output: ArrayView4<'_, f32>) -> Result<()> {
			if self.misconfigured {
				return Err(UmiError::config("backward is misconfigured"));
			}
			self.inner.backward(x_t, timesteps, labels, grad_output)
		}
	}

	fn loader(labels: Vec<usize>, batch_size: usize) -> InMemoryDataLoader {
		let images = Array4::from_shape_fn((labels.len(), 1, 4, 4), |(i, ..)| if i % 2 == 0 { 0.5 } else { -0.5 });
		InMemoryDataLoader::new(images, labels, batch_size).unwrap()
	}

	#[test]
	fn test_label_dropping_follows_p_uncond() {
		for (p_uncond, expect_conditional) in [(1.0, false), (0.0, true)] {
			let config = UmiConfig { num_epochs: 5, p_uncond, ..config() };
			let model = Tally::new(&config);
			let (conditional, unconditional) = (Rc::clone(&model.conditional), Rc::clone(&model.unconditional));
			let mut umi = Umi::new(config, model).unwrap();
			let report = umi.train(&mut loader(vec![0, 1, 0, 1], 2)).unwrap();
			assert_eq!(report.steps, 10);
			if expect_conditional {
				assert_eq!((conditional.get(), unconditional.get()), (20, 0));
			} else {
				assert_eq!((conditional.get(), unconditional.get()), (0, 20));
			}
		}
	}

	#[test]
	fn test_train_skips_recoverable_batch_errors() {
		// class 7 is out of range for a 2-class model
		let config = UmiConfig { num_epochs: 5, p_uncond: 0.0, ..config() };
		let mut umi = Umi::new(config.clone(), denoiser(&config)).unwrap();
		let report = umi.train(&mut loader(vec![0, 7, 0, 7], 1)).unwrap();
		assert_eq!(report.skipped_batches, 10);
		assert_eq!(report.steps, 10);
		assert_eq!(report.epoch_losses.len(), 5);
		assert!(report.epoch_losses.iter().all(|loss| loss.map_or(false, f32::is_finite)));
		assert_eq!(umi.ema().steps(), 10);

		let mut all_bad = Umi::new(config.clone(), denoiser(&config)).unwrap();
		let report = all_bad.train(&mut loader(vec![7, 7], 1)).unwrap();
		assert_eq!(report.skipped_batches, 10);
		assert!(report.epoch_losses.iter().all(Option::is_none));
	}

	#[test]
	fn test_train_aborts_on_configuration_errors() {
		let config = UmiConfig { num_epochs: 5, ..config() };
		let mut model = Tally::new(&config);
		model.misconfigured = true;
		let mut umi = Umi::new(config, model).unwrap();
		assert!(umi.train(&mut loader(vec![0, 1, 0, 1], 2)).unwrap_err().is_configuration());
		assert_eq!(umi.ema().steps(), 0);
	}

	#[test]
	fn test_cadence() {
		assert!(!is_due(None, 49));
		assert!(!is_due(Some(50), 0));
		assert!(is_due(Some(50), 49));
		assert!(is_due(Some(1), 0));
	}

	#[test]
	fn test_new_rejects_bad_config() {
		let config = UmiConfig { beta_start: 0.5, beta_end: 0.1, ..config() };
		let model = denoiser(&config);
		assert!(Umi::new(config, model).unwrap_err().is_configuration());
	}

	#[test]
	fn test_sampling_restores_training_mode_on_failure() {
		let failing = Failing { weight: Parameter::new("w", ndarray::ArrayD::zeros(ndarray::IxDyn(&[1]))), training: true };
		let mut umi = Umi::new(config(), failing).unwrap();
		assert!(umi.sample(&Label::unconditional(1), 0.0).is_err());
		assert!(umi.model().is_training());
		assert!(!umi.ema_model().is_training());
	}

	#[test]
	fn test_train_step_updates_model_and_shadow() {
		let config = UmiConfig { ema_warmup_steps: 0, ..config() };
		let mut umi = Umi::new(config.clone(), denoiser(&config)).unwrap();
		let before = umi.model().state_dict();
		let batch = Batch { images: Array4::from_elem((2, 1, 4, 4), 0.5), labels: vec![0, 1] };
		let loss = umi.train_step(&batch).unwrap();
		assert!(loss.is_finite() && loss > 0.0);
		assert_ne!(umi.model().state_dict(), before);
		assert_ne!(umi.ema_model().state_dict(), before);
		assert_eq!(umi.ema().steps(), 1);
		assert!(umi.ema_model().parameters().iter().all(|p| !p.requires_grad()));
	}

	#[test]
	fn test_train_step_rejects_bad_batches() {
		let mut umi = Umi::new(config(), denoiser(&config())).unwrap();
		let wrong_size = Batch { images: Array4::zeros((2, 1, 8, 8)), labels: vec![0, 1] };
		assert!(matches!(umi.train_step(&wrong_size), Err(UmiError::ShapeMismatch(_))));
		let missing_labels = Batch { images: Array4::zeros((2, 1, 4, 4)), labels: vec![0] };
		assert!(matches!(umi.train_step(&missing_labels), Err(UmiError::ShapeMismatch(_))));
		assert_eq!(umi.ema().steps(), 0);
	}

	#[test]
	fn test_login_and_save_without_store() {
		let mut umi = Umi::new(config(), denoiser(&config())).unwrap();
		assert!(umi.login("").unwrap_err().is_configuration());
		assert!(matches!(umi.login("token"), Err(UmiError::ExternalIo(_))));
		assert!(matches!(umi.save_pretrained(), Err(UmiError::ExternalIo(_))));
	}

	#[test]
	fn test_sample_shapes() {
		let mut umi = Umi::new(config(), denoiser(&config())).unwrap();
		let pixels = umi.sample_with_progress(Weights::Ema, &Label::from_classes(&[0, 1, 1]), 3.0, |_, _| true).unwrap();
		assert_eq!(pixels.shape(), &[3, 1, 4, 4]);
	}
}
