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

//! Conversion of sampled pixel tensors into [`image`] buffers.

use std::path::Path;

use image::{DynamicImage, GrayImage, RgbImage};
use ndarray::{Array3, ArrayView3, ArrayView4, Axis};

use crate::{Result, UmiError};

/// Converts a single `(channels, height, width)` pixel tensor into an image. Supports 1 (grayscale) and 3 (RGB)
/// channels.
pub fn to_image(pixels: ArrayView3<'_, u8>) -> Result<DynamicImage> {
	let (channels, height, width) = pixels.dim();
	let raw = pixels.permuted_axes([1, 2, 0]).iter().copied().collect::<Vec<_>>();
	let image = match channels {
		1 => GrayImage::from_raw(width as u32, height as u32, raw).map(DynamicImage::ImageLuma8),
		3 => RgbImage::from_raw(width as u32, height as u32, raw).map(DynamicImage::ImageRgb8),
		_ => return Err(UmiError::shape(format!("cannot convert a {channels}-channel tensor to an image")))
	};
	image.ok_or_else(|| UmiError::shape("failed to construct image"))
}

/// Converts a `(batch, channels, height, width)` pixel tensor into one image per sample.
pub fn to_images(pixels: ArrayView4<'_, u8>) -> Result<Vec<DynamicImage>> {
	pixels.axis_iter(Axis(0)).map(to_image).collect()
}

/// Tiles a batch into a single image with `nrow` images per row, separated by `padding` black pixels.
pub fn make_grid(pixels: ArrayView4<'_, u8>, nrow: usize, padding: usize) -> Result<DynamicImage> {
	let (n, channels, height, width) = pixels.dim();
	if n == 0 {
		return Err(UmiError::shape("cannot build a grid from an empty batch"));
	}
	let ncols = nrow.clamp(1, n);
	let nrows = (n + ncols - 1) / ncols;
	let grid_height = nrows * (height + padding) + padding;
	let grid_width = ncols * (width + padding) + padding;

	let mut grid = Array3::<u8>::zeros((channels, grid_height, grid_width));
	for (i, image) in pixels.axis_iter(Axis(0)).enumerate() {
		let y = padding + (i / ncols) * (height + padding);
		let x = padding + (i % ncols) * (width + padding);
		grid.slice_mut(ndarray::s![.., y..y + height, x..x + width]).assign(&image);
	}
	to_image(grid.view())
}

/// Saves a batch as a single grid image; the format is inferred from the extension of `path`.
pub fn save_images<P: AsRef<Path>>(pixels: ArrayView4<'_, u8>, path: P) -> anyhow::Result<()> {
	let path = path.as_ref();
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	make_grid(pixels, 8, 2)?.save(path)?;
	Ok(())
}
