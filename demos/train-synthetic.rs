use std::path::PathBuf;

use clap::Parser;
use kdam::{tqdm, BarExt};
use ndarray::Array4;
use rand::{rngs::StdRng, SeedableRng};
use umi_diffusion::{util::image::save_images, ConditionalAffineDenoiser, InMemoryDataLoader, Label, LocalStore, Umi, UmiConfig, Weights};

/// Trains a tiny class-conditional model on two synthetic classes (bright and dark images) and samples both.
#[derive(Debug, Parser)]
struct Args {
	/// TOML config, used as-is. When omitted, a small two-class config is built from `--epochs` and `--img-size`.
	#[arg(long)]
	config: Option<PathBuf>,
	#[arg(long, default_value_t = 20)]
	epochs: usize,
	#[arg(long, default_value_t = 16)]
	img_size: usize,
	#[arg(long, default_value_t = 64)]
	dataset_size: usize,
	#[arg(long, default_value_t = 3.0)]
	cfg_scale: f32,
	#[arg(long, default_value = "./checkpoints")]
	checkpoint_dir: PathBuf,
	#[arg(long, default_value = "samples.png")]
	output: PathBuf
}

fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.init();

	let args = Args::parse();
	let config = match &args.config {
		Some(path) => UmiConfig::from_file(path)?,
		None => UmiConfig {
			num_epochs: args.epochs,
			img_size: args.img_size,
			num_classes: 2,
			noise_steps: 200,
			ema_warmup_steps: 0,
			sample_every: None,
			seed: Some(42),
			..Default::default()
		}
	};
	// the synthetic dataset only has two classes
	anyhow::ensure!(config.num_classes >= 2, "--config must declare at least 2 classes, got {}", config.num_classes);

	let shape = (args.dataset_size, config.channels, config.img_size, config.img_size);
	let labels = (0..args.dataset_size).map(|i| i % 2).collect::<Vec<_>>();
	let images = Array4::from_shape_fn(shape, |(i, ..)| if labels[i] == 0 { 0.75 } else { -0.75 });
	let mut loader = InMemoryDataLoader::new(images, labels, 16)?.with_seed(7);

	let model = ConditionalAffineDenoiser::new(config.channels, config.num_classes, config.noise_steps, &mut StdRng::seed_from_u64(0));
	let noise_steps = config.noise_steps;
	let mut umi = Umi::new(config, model)?.with_store(LocalStore::new(&args.checkpoint_dir));
	let report = umi.train(&mut loader)?;
	if let Some(Some(loss)) = report.epoch_losses.last() {
		println!("final loss: {loss:.5} after {} steps", report.steps);
	}
	umi.save_pretrained()?;

	let mut pb = tqdm!(total = noise_steps - 1, desc = "sampling");
	let pixels = umi.sample_with_progress(Weights::Ema, &Label::from_classes(&[0, 1, 0, 1]), args.cfg_scale, |step, _| {
		let _ = pb.update_to(step + 1);
		true
	})?;
	save_images(pixels.view(), &args.output)?;
	println!("saved {}", args.output.display());

	Ok(())
}
