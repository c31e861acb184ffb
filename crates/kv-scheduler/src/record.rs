//! Records of planned and executed transactions.

use std::fmt::{self, Write as _};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::{
	error::OperationError,
	options::ResyncType,
	txn::TxnType,
	value::{format_value, TxnOperation, Value, ValueOrigin, ValueState},
};

fn serialize_error<S: Serializer>(error: &Option<OperationError>, serializer: S) -> Result<S::Ok, S::Error> {
	match error {
		Some(error) => serializer.serialize_some(&error.to_string()),
		None => serializer.serialize_none(),
	}
}

/// One state transition of a value, planned or executed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordedTxnOp {
	pub operation: TxnOperation,
	pub key: String,

	pub prev_value: Option<Value>,
	pub new_value: Option<Value>,
	pub prev_state: ValueState,
	pub new_state: ValueState,
	#[serde(serialize_with = "serialize_error")]
	pub prev_error: Option<OperationError>,
	#[serde(serialize_with = "serialize_error")]
	pub new_error: Option<OperationError>,
	pub noop: bool,

	pub is_derived: bool,
	/// Derived value without a descriptor, it only carries information for other values.
	pub is_property: bool,
	pub is_revert: bool,
	pub is_retry: bool,
	pub is_recreate: bool,
}

impl RecordedTxnOp {
	/// Annotations describing the operation and the state transition.
	#[must_use]
	pub fn flags(&self) -> Vec<&'static str> {
		let mut flags = Vec::new();
		let (prev, new) = (self.prev_state, self.new_state);

		if self.is_derived && !self.is_property {
			flags.push("DERIVED");
		}
		if self.is_property {
			flags.push("PROPERTY");
		}
		if self.noop {
			flags.push("NOOP");
		}
		if self.is_revert && !self.is_property {
			flags.push("REVERT");
		}
		if self.is_retry && !self.is_property {
			flags.push("RETRY");
		}
		if self.is_recreate {
			flags.push("RECREATE");
		}

		if new == ValueState::Retrieved {
			flags.push("RETRIEVED");
		}
		if prev == ValueState::Retrieved && prev != new {
			flags.push("WAS-RETRIEVED");
		}
		if new == ValueState::Unimplemented {
			flags.push("UNIMPLEMENTED");
		}
		if prev == ValueState::Unimplemented && prev != new {
			flags.push("WAS-UNIMPLEMENTED");
		}
		if prev == ValueState::Removed && !self.is_recreate {
			flags.push("ALREADY-REMOVED");
		}
		if prev == ValueState::Missing {
			flags.push(if new == ValueState::Removed {
				"ALREADY-MISSING"
			} else {
				"WAS-MISSING"
			});
		}
		if prev == ValueState::Found {
			flags.push("FOUND");
		}

		match (prev == ValueState::Pending, new == ValueState::Pending) {
			(true, true) => flags.push("STILL-PENDING"),
			(true, false) => flags.push("WAS-PENDING"),
			(false, true) => flags.push("IS-PENDING"),
			(false, false) => {}
		}

		for terminal in [ValueState::Failed, ValueState::Invalid] {
			if prev == terminal {
				if new == terminal {
					flags.push(if terminal == ValueState::Failed {
						"STILL-FAILING"
					} else {
						"STILL-INVALID"
					});
				} else if new == ValueState::Configured {
					flags.push("FIXED");
				}
			} else if new == terminal {
				flags.push(if terminal == ValueState::Failed {
					"FAILED"
				} else {
					"INVALID"
				});
			}
		}

		flags
	}

	fn write_indented(&self, out: &mut String, index: Option<usize>, indent: usize) {
		let indent1 = " ".repeat(indent);
		let indent2 = " ".repeat(indent + 4);

		let _ = write!(out, "{indent1}");
		if let Some(index) = index {
			let _ = write!(out, "{index}. ");
		}
		let flags = self.flags();
		if flags.is_empty() {
			let _ = writeln!(out, "{}:", self.operation);
		} else {
			let _ = writeln!(out, "{} [{}]:", self.operation, flags.join(" "));
		}

		let _ = writeln!(out, "{indent2}- key: {}", self.key);
		match self.operation {
			TxnOperation::Modify => {
				let _ = writeln!(out, "{indent2}- prev-value: {}", format_value(self.prev_value.as_ref()));
				let _ = writeln!(out, "{indent2}- new-value: {}", format_value(self.new_value.as_ref()));
			}
			TxnOperation::Delete => {
				let _ = writeln!(out, "{indent2}- value: {}", format_value(self.prev_value.as_ref()));
			}
			TxnOperation::Add => {
				let _ = writeln!(out, "{indent2}- value: {}", format_value(self.new_value.as_ref()));
			}
			TxnOperation::Undefined => {}
		}
		if let Some(prev_error) = &self.prev_error {
			let _ = writeln!(out, "{indent2}- prev-error: {prev_error}");
		}
		if let Some(new_error) = &self.new_error {
			let _ = writeln!(out, "{indent2}- error: {new_error}");
		}
		if self.prev_state != self.new_state {
			let _ = writeln!(out, "{indent2}- prev-state: {}", self.prev_state);
			let _ = writeln!(out, "{indent2}- new-state: {}", self.new_state);
		}
	}
}

impl fmt::Display for RecordedTxnOp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut out = String::new();
		self.write_indented(&mut out, None, 0);
		f.write_str(&out)
	}
}

fn write_ops(out: &mut String, ops: &[RecordedTxnOp], indent: usize) {
	if ops.is_empty() {
		let _ = writeln!(out, "{}<none>", " ".repeat(indent));
		return;
	}
	for (idx, op) in ops.iter().enumerate() {
		op.write_indented(out, Some(idx + 1), indent);
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedKvPair {
	pub key: String,
	pub value: Option<Value>,
	pub origin: ValueOrigin,
}

/// Record of a processed transaction.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedTxn {
	/// Only arguments and the plan are filled in, the transaction was not executed yet.
	pub pre_record: bool,

	pub start: DateTime<Utc>,
	pub stop: DateTime<Utc>,

	pub seq_num: u64,
	pub txn_type: TxnType,
	pub resync_type: ResyncType,
	pub description: String,
	pub retry_for_txn: Option<u64>,
	pub retry_attempt: u32,
	pub values: Vec<RecordedKvPair>,

	pub planned: Vec<RecordedTxnOp>,
	pub executed: Vec<RecordedTxnOp>,
}

impl RecordedTxn {
	fn resync_label(&self) -> Option<&'static str> {
		match (self.txn_type, self.resync_type) {
			(TxnType::NbTransaction, ResyncType::Full) => Some("Full Resync"),
			(TxnType::NbTransaction, ResyncType::Downstream) => Some("SB Sync"),
			(TxnType::NbTransaction, ResyncType::Upstream) => Some("NB Sync"),
			_ => None,
		}
	}

	/// Short one-line description of the transaction type.
	#[must_use]
	pub fn type_info(&self) -> String {
		self.resync_label().map_or_else(
			|| self.txn_type.to_string(),
			|resync| format!("{} ({resync})", self.txn_type),
		)
	}

	/// Renders the record; `result_only` skips the arguments and the plan.
	#[must_use]
	pub fn to_string_with_opts(&self, result_only: bool, indent: usize) -> String {
		let indent1 = " ".repeat(indent);
		let indent2 = " ".repeat(indent + 4);
		let indent3 = " ".repeat(indent + 8);
		let mut out = String::new();

		if !result_only {
			let _ = writeln!(out, "{indent1}* transaction arguments:");
			let _ = writeln!(out, "{indent2}- seq-num: {}", self.seq_num);
			match (self.resync_label(), self.retry_for_txn) {
				(Some(resync), _) => {
					let _ = writeln!(out, "{indent2}- type: {}, {resync}", self.txn_type);
				}
				(None, Some(retry_for)) => {
					let _ = writeln!(
						out,
						"{indent2}- type: {} (for txn {retry_for}, attempt #{})",
						self.txn_type, self.retry_attempt
					);
				}
				(None, None) => {
					let _ = writeln!(out, "{indent2}- type: {}", self.txn_type);
				}
			}

			for (idx, line) in self.description.lines().enumerate() {
				if idx == 0 {
					let _ = writeln!(out, "{indent2}- description: {line}");
				} else {
					let _ = writeln!(out, "{indent3}{line}");
				}
			}

			if self.resync_type != ResyncType::Downstream {
				if self.values.is_empty() {
					let _ = writeln!(out, "{indent2}- values: NONE");
				} else {
					let _ = writeln!(out, "{indent2}- values:");
				}
				for kv in &self.values {
					if self.resync_type != ResyncType::NotResync && kv.origin == ValueOrigin::FromSb {
						continue;
					}
					let _ = writeln!(out, "{indent3}- key: {}", kv.key);
					let _ = writeln!(out, "{indent3}  value: {}", format_value(kv.value.as_ref()));
				}
			}

			let _ = writeln!(out, "{indent1}* planned operations:");
			write_ops(&mut out, &self.planned, indent + 4);
		}

		if !self.pre_record {
			if self.executed.is_empty() {
				let _ = writeln!(out, "{indent1}* executed operations:");
			} else {
				let _ = writeln!(
					out,
					"{indent1}* executed operations ({} - {}, duration = {}ms):",
					self.start,
					self.stop,
					(self.stop - self.start).num_milliseconds()
				);
			}
			write_ops(&mut out, &self.executed, indent + 4);
		}

		out
	}
}

impl fmt::Display for RecordedTxn {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_string_with_opts(false, 0))
	}
}
