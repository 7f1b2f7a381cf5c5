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

//! Pushing and pulling model state.
//!
//! The diffusion core treats persistence as two opaque operations, [`ModelStore::save`] and [`ModelStore::load`].
//! [`LocalStore`] implements them on the local filesystem with one JSON checkpoint per destination; a remote hub
//! client only needs to implement the same trait.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::models::StateDict;
use crate::{Result, UmiError};

/// Name of the checkpoint file written inside each destination directory.
pub const CHECKPOINT_FILE: &str = "model.json";
const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// An opaque access token for a model store.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
	token: String
}

impl Credentials {
	/// # Errors
	/// Returns [`UmiError::Configuration`] if the token is empty or only whitespace.
	pub fn new(token: impl Into<String>) -> Result<Self> {
		let token = token.into();
		if token.trim().is_empty() {
			return Err(UmiError::config("access token must not be empty"));
		}
		Ok(Self { token })
	}

	/// The raw token.
	pub fn token(&self) -> &str {
		&self.token
	}
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials").field("token", &"<redacted>").finish()
	}
}

/// Somewhere model state can be pushed to and pulled from.
pub trait ModelStore {
	/// Supplies credentials for subsequent operations.
	fn login(&mut self, credentials: Credentials) -> anyhow::Result<()>;

	/// Pushes `state` to `destination`, replacing whatever was there.
	fn save(&self, state: &StateDict, destination: &str) -> anyhow::Result<()>;

	/// Pulls the state stored at `source`.
	fn load(&self, source: &str) -> anyhow::Result<StateDict>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Checkpoint {
	format_version: u32,
	state: StateDict
}

/// Stores checkpoints under `root/<destination>/model.json`.
#[derive(Debug, Clone)]
pub struct LocalStore {
	root: PathBuf,
	credentials: Option<Credentials>
}

impl LocalStore {
	/// A store rooted at `root`. Nothing is created until the first save.
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into(), credentials: None }
	}

	/// The directory checkpoints are written under.
	pub fn root(&self) -> &Path {
		&self.root
	}

	/// Returns `true` once credentials have been supplied.
	pub fn is_logged_in(&self) -> bool {
		self.credentials.is_some()
	}

	fn checkpoint_path(&self, identifier: &str) -> anyhow::Result<PathBuf> {
		let relative = Path::new(identifier);
		if identifier.is_empty() || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
			anyhow::bail!("invalid model identifier `{identifier}`");
		}
		Ok(self.root.join(relative).join(CHECKPOINT_FILE))
	}
}

impl ModelStore for LocalStore {
	fn login(&mut self, credentials: Credentials) -> anyhow::Result<()> {
		self.credentials = Some(credentials);
		Ok(())
	}

	fn save(&self, state: &StateDict, destination: &str) -> anyhow::Result<()> {
		let path = self.checkpoint_path(destination)?;
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
		}
		let file = File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
		let checkpoint = Checkpoint { format_version: CHECKPOINT_FORMAT_VERSION, state: state.clone() };
		serde_json::to_writer(BufWriter::new(file), &checkpoint).with_context(|| format!("failed to write {}", path.display()))?;
		tracing::debug!(path = %path.display(), tensors = state.len(), "saved checkpoint");
		Ok(())
	}

	fn load(&self, source: &str) -> anyhow::Result<StateDict> {
		let path = self.checkpoint_path(source)?;
		let file = File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
		let checkpoint: Checkpoint = serde_json::from_reader(BufReader::new(file)).with_context(|| format!("failed to parse {}", path.display()))?;
		if checkpoint.format_version != CHECKPOINT_FORMAT_VERSION {
			anyhow::bail!("unsupported checkpoint format version {} in {}", checkpoint.format_version, path.display());
		}
		Ok(checkpoint.state)
	}
}
