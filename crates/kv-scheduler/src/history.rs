use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::record::RecordedTxn;

/// In-memory history of processed transactions, ordered by start time.
pub(crate) struct TxnHistory {
	start_time: DateTime<Utc>,
	records: Mutex<Vec<Arc<RecordedTxn>>>,
}

impl TxnHistory {
	pub(crate) fn new(start_time: DateTime<Utc>) -> Self {
		Self {
			start_time,
			records: Mutex::new(Vec::new()),
		}
	}

	pub(crate) const fn start_time(&self) -> DateTime<Utc> {
		self.start_time
	}

	pub(crate) fn push(&self, record: RecordedTxn) {
		self.records
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.push(Arc::new(record));
	}

	/// Transactions started within the window, bounds are inclusive and optional.
	pub(crate) fn window(
		&self,
		since: Option<DateTime<Utc>>,
		until: Option<DateTime<Utc>>,
	) -> Vec<Arc<RecordedTxn>> {
		if let (Some(since), Some(until)) = (since, until) {
			if until < since {
				return Vec::new();
			}
		}

		let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
		let first = since.map_or(0, |since| records.partition_point(|r| r.start < since));
		let last = until.map_or(records.len(), |until| records.partition_point(|r| r.start <= until));

		records
			.get(first..last.max(first))
			.map(<[_]>::to_vec)
			.unwrap_or_default()
	}

	pub(crate) fn get(&self, seq_num: u64) -> Option<Arc<RecordedTxn>> {
		self.records
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.iter()
			.find(|r| r.seq_num == seq_num)
			.cloned()
	}

	/// Drops records which stopped before `older_than`, keeping everything started within
	/// `permanent_until` (the initial period after startup).
	pub(crate) fn trim(&self, older_than: DateTime<Utc>, permanent_until: DateTime<Utc>) -> usize {
		let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
		let before = records.len();
		records.retain(|r| r.start <= permanent_until || r.stop >= older_than);
		before - records.len()
	}
}

#[cfg(test)]
mod tests {
	use chrono::Duration;

	use crate::{options::ResyncType, txn::TxnType};

	use super::*;

	fn record(seq_num: u64, start: DateTime<Utc>) -> RecordedTxn {
		RecordedTxn {
			pre_record: false,
			start,
			stop: start + Duration::milliseconds(5),
			seq_num,
			txn_type: TxnType::NbTransaction,
			resync_type: ResyncType::NotResync,
			description: String::new(),
			retry_for_txn: None,
			retry_attempt: 0,
			values: Vec::new(),
			planned: Vec::new(),
			executed: Vec::new(),
		}
	}

	#[test]
	fn window_and_lookup() {
		let t0 = Utc::now();
		let history = TxnHistory::new(t0);
		for seq_num in 0..5 {
			history.push(record(seq_num, t0 + Duration::seconds(i64::try_from(seq_num).expect("small"))));
		}

		assert_eq!(history.window(None, None).len(), 5);
		let seq_nums = history
			.window(Some(t0 + Duration::seconds(1)), Some(t0 + Duration::seconds(3)))
			.iter()
			.map(|r| r.seq_num)
			.collect::<Vec<_>>();
		assert_eq!(seq_nums, vec![1, 2, 3]);
		assert!(history
			.window(Some(t0 + Duration::seconds(3)), Some(t0))
			.is_empty());

		assert_eq!(history.get(4).map(|r| r.seq_num), Some(4));
		assert!(history.get(9).is_none());
	}

	#[test]
	fn trimming_keeps_init_period() {
		let t0 = Utc::now() - Duration::hours(48);
		let history = TxnHistory::new(t0);
		history.push(record(0, t0));
		history.push(record(1, t0 + Duration::hours(2)));
		history.push(record(2, Utc::now()));

		let removed = history.trim(Utc::now() - Duration::hours(24), t0 + Duration::hours(1));
		assert_eq!(removed, 1);
		assert!(history.get(0).is_some());
		assert!(history.get(1).is_none());
		assert!(history.get(2).is_some());
	}
}
