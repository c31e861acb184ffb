//! Scheduler configuration

use std::{
	env, fs, io,
	path::{Path, PathBuf},
	time::Duration,
};

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Enables verification of every transaction when set to a truthy value.
pub const VERIFY_MODE_ENV: &str = "KVSCHED_VERIFY_MODE";
/// Enables tracing of every step of the graph walk when set to a truthy value.
pub const LOG_GRAPH_WALK_ENV: &str = "KVSCHED_LOG_GRAPH_WALK";

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file <path='{}'>: {source}", .path.display())]
	Read {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("failed to write config file <path='{}'>: {source}", .path.display())]
	Write {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("invalid config: {0}")]
	Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
	/// Keep records of processed transactions in memory.
	pub record_transaction_history: bool,

	/// How long (in minutes) recorded transactions are kept.
	pub transaction_history_age_limit: u32,

	/// Transactions started within this many minutes since startup are never trimmed.
	pub permanently_recorded_init_period: u32,

	/// How often (in seconds) old records are trimmed.
	pub history_trimming_period: u64,

	/// Capacity of the transaction queue.
	pub txn_queue_capacity: usize,

	/// Refresh and verify every value touched by a transaction.
	pub verify_mode: bool,

	/// Trace every step of the graph walk.
	pub log_graph_walk: bool,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			record_transaction_history: true,
			transaction_history_age_limit: 24 * 60,
			permanently_recorded_init_period: 60,
			history_trimming_period: 60,
			txn_queue_capacity: 100,
			verify_mode: false,
			log_graph_walk: false,
		}
	}
}

impl Config {
	/// Loads configuration from a JSON file, missing fields take their default values.
	pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();

		info!(path = %path.display(), "Loading scheduler config");
		let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.to_path_buf(),
			source,
		})?;

		Ok(serde_json::from_str(&json)?)
	}

	/// Loads configuration from the file if it exists, otherwise uses the defaults.
	pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		if path.exists() {
			Self::load_from(path)
		} else {
			warn!(path = %path.display(), "No scheduler config found, using defaults");
			Ok(Self::default())
		}
	}

	pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
		let path = path.as_ref();
		let json = serde_json::to_string_pretty(self)?;
		fs::write(path, json).map_err(|source| ConfigError::Write {
			path: path.to_path_buf(),
			source,
		})?;
		info!(path = %path.display(), "Saved scheduler config");
		Ok(())
	}

	/// Applies overrides from `KVSCHED_VERIFY_MODE` and `KVSCHED_LOG_GRAPH_WALK`.
	#[must_use]
	pub fn with_env_overrides(mut self) -> Self {
		if let Some(verify_mode) = env_flag(VERIFY_MODE_ENV) {
			self.verify_mode = verify_mode;
		}
		if let Some(log_graph_walk) = env_flag(LOG_GRAPH_WALK_ENV) {
			self.log_graph_walk = log_graph_walk;
		}
		self
	}

	pub(crate) fn history_age_limit(&self) -> TimeDelta {
		TimeDelta::minutes(i64::from(self.transaction_history_age_limit))
	}

	pub(crate) fn permanent_init_period(&self) -> TimeDelta {
		TimeDelta::minutes(i64::from(self.permanently_recorded_init_period))
	}

	pub(crate) fn trimming_period(&self) -> Duration {
		Duration::from_secs(self.history_trimming_period.max(1))
	}
}

fn env_flag(name: &str) -> Option<bool> {
	let value = env::var(name).ok()?;
	match value.trim().to_ascii_lowercase().as_str() {
		"" | "0" | "false" | "off" | "no" => Some(false),
		"1" | "true" | "on" | "yes" => Some(true),
		other => {
			warn!(variable = name, value = other, "Unrecognized boolean in environment variable");
			None
		}
	}
}
