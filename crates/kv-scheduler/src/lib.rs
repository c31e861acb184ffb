//!
//! # KV Scheduler
//!
//! Transaction scheduler which keeps a southbound (a data plane, a kernel, a remote API...)
//! in sync with the desired configuration given as key-value pairs.
//!
//! Southbound bindings implement a [`Descriptor`] for each kind of values. The scheduler then
//! takes care of the rest:
//! - Values are applied in the order given by their dependencies, values with missing
//!   dependencies are kept pending until the dependencies appear;
//! - Values derived from other values are applied and removed together with them;
//! - Failed values can be retried with an exponential backoff, or the whole transaction can be
//!   reverted;
//! - Resync transactions reconcile the desired state with the state dumped from the southbound;
//! - Every transaction is recorded, together with the history of every value.
//!
//! ## Basic example
//!
//! ```
//! use std::sync::Arc;
//!
//! use kv_scheduler::{CommitOptions, Config, Descriptor, Metadata, OperationError, Scheduler, Value, ValueState};
//! use serde_json::json;
//!
//! struct Interfaces;
//!
//! impl Descriptor for Interfaces {
//!     fn name(&self) -> &str {
//!         "interface"
//!     }
//!
//!     fn key_selector(&self, key: &str) -> bool {
//!         key.starts_with("/interface/")
//!     }
//!
//!     fn add(&self, _key: &str, _value: &Value) -> Option<Result<Option<Metadata>, OperationError>> {
//!         Some(Ok(None))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let scheduler = Scheduler::new(Config::default()).unwrap();
//!     scheduler.register_descriptor(Arc::new(Interfaces)).unwrap();
//!
//!     let mut txn = scheduler.start_transaction();
//!     txn.set_value("/interface/eth0", json!({ "mtu": 1500 }));
//!     let seq_num = txn.commit(CommitOptions::new()).await.unwrap();
//!
//!     assert_eq!(seq_num, Some(0));
//!     assert_eq!(
//!         scheduler.get_value_status("/interface/eth0").value.state,
//!         ValueState::Configured
//!     );
//!
//!     scheduler.shutdown().await;
//! }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod config;
mod descriptor;
mod error;
mod exec;
mod graph;
mod history;
mod node_utils;
mod options;
mod ordering;
mod process;
mod queue;
mod record;
mod refresh;
mod registry;
mod scheduler;
mod status;
mod txn;
mod value;

pub use config::{Config, ConfigError, LOG_GRAPH_WALK_ENV, VERIFY_MODE_ENV};
pub use descriptor::{Dependency, DependencyTarget, Descriptor};
pub use error::{
	Error, InvalidValueError, KeyWithError, OperationError, TransactionError, VerificationError,
	VerificationErrorKind,
};
pub use graph::{ErrorFlag, Flag, FlagName, FlagStats, Flags, LastUpdate, RecordedNode, Relation, Targets};
pub use options::{CommitOptions, ResyncType, RetryOptions, DEFAULT_RETRY_MAX_COUNT, DEFAULT_RETRY_PERIOD};
pub use record::{RecordedKvPair, RecordedTxn, RecordedTxnOp};
pub use scheduler::{Scheduler, Txn};
pub use status::{BaseValueStatus, ValueStatus};
pub use txn::TxnType;
pub use value::{KeySelector, KeyValuePair, KvWithMetadata, Metadata, TxnOperation, Value, ValueOrigin, ValueState, View};
