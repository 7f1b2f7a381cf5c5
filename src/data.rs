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

//! Batched training data.

use ndarray::{Array4, ArrayView4, Axis};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{Result, UmiError};

/// A batch of images in `[-1, 1]` with one class index per image.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
	/// `(batch, channels, height, width)` images.
	pub images: Array4<f32>,
	/// Class index of each image.
	pub labels: Vec<usize>
}

impl Batch {
	/// Number of images in the batch.
	pub fn len(&self) -> usize {
		self.images.len_of(Axis(0))
	}

	/// Returns `true` if the batch holds no images.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Produces a finite, lazy sequence of batches per epoch. Calling [`DataLoader::batches`] again restarts from the
/// beginning of a new epoch.
pub trait DataLoader {
	/// Starts a new epoch.
	fn batches(&mut self) -> Box<dyn Iterator<Item = Batch> + '_>;

	/// Number of batches per epoch.
	fn len(&self) -> usize;

	/// Returns `true` if an epoch yields no batches.
	fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// An in-memory dataset split into fixed-size batches, reshuffled every epoch.
#[derive(Debug, Clone)]
pub struct InMemoryDataLoader {
	images: Array4<f32>,
	labels: Vec<usize>,
	batch_size: usize,
	shuffle: bool,
	rng: StdRng
}

impl InMemoryDataLoader {
	/// # Errors
	/// Returns [`UmiError::ShapeMismatch`] if there is not exactly one label per image, and
	/// [`UmiError::Configuration`] if `batch_size` is 0.
	pub fn new(images: Array4<f32>, labels: Vec<usize>, batch_size: usize) -> Result<Self> {
		if images.len_of(Axis(0)) != labels.len() {
			return Err(UmiError::shape(format!("{} images but {} labels", images.len_of(Axis(0)), labels.len())));
		}
		if batch_size == 0 {
			return Err(UmiError::config("batch_size must be >0"));
		}
		Ok(Self { images, labels, batch_size, shuffle: true, rng: StdRng::seed_from_u64(0) })
	}

	/// Sets the seed of the per-epoch shuffle.
	pub fn with_seed(mut self, seed: u64) -> Self {
		self.rng = StdRng::seed_from_u64(seed);
		self
	}

	/// Enables or disables per-epoch shuffling. Enabled by default.
	pub fn with_shuffle(mut self, shuffle: bool) -> Self {
		self.shuffle = shuffle;
		self
	}

	/// The full dataset, in its original order.
	pub fn images(&self) -> ArrayView4<'_, f32> {
		self.images.view()
	}
}

impl DataLoader for InMemoryDataLoader {
	fn batches(&mut self) -> Box<dyn Iterator<Item = Batch> + '_> {
		let mut order: Vec<usize> = (0..self.labels.len()).collect();
		if self.shuffle {
			order.shuffle(&mut self.rng);
		}
		let images = &self.images;
		let labels = &self.labels;
		let chunks = order.chunks(self.batch_size).map(<[usize]>::to_vec).collect::<Vec<_>>();
		Box::new(chunks.into_iter().map(move |indices| Batch {
			images: images.select(Axis(0), &indices),
			labels: indices.iter().map(|&i| labels[i]).collect()
		}))
	}

	fn len(&self) -> usize {
		(self.labels.len() + self.batch_size - 1) / self.batch_size
	}
}

#[cfg(test)]
mod tests {
	use ndarray::Array4;

	use super::{DataLoader, InMemoryDataLoader};

	#[test]
	fn test_batches_cover_dataset_each_epoch() {
		let images = Array4::from_shape_fn((5, 1, 2, 2), |(b, ..)| b as f32);
		let mut loader = InMemoryDataLoader::new(images, vec![0, 1, 2, 3, 4], 2).unwrap();
		assert_eq!(loader.len(), 3);
		for _ in 0..2 {
			let batches: Vec<_> = loader.batches().collect();
			assert_eq!(batches.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![2, 2, 1]);
			let mut seen: Vec<usize> = batches.iter().flat_map(|b| b.labels.clone()).collect();
			for batch in &batches {
				for (image, &label) in batch.images.outer_iter().zip(&batch.labels) {
					assert!(image.iter().all(|&v| v == label as f32));
				}
			}
			seen.sort_unstable();
			assert_eq!(seen, vec![0, 1, 2, 3, 4]);
		}
	}

	#[test]
	fn test_rejects_mismatched_labels() {
		assert!(InMemoryDataLoader::new(Array4::zeros((3, 1, 2, 2)), vec![0, 1], 2).is_err());
		assert!(InMemoryDataLoader::new(Array4::zeros((2, 1, 2, 2)), vec![0, 1], 0).unwrap_err().is_configuration());
	}
}
