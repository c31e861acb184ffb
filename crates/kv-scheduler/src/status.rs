use std::sync::{Mutex, PoisonError};

use async_channel as chan;
use serde::Serialize;
use tracing::warn;

use crate::{
	error::KeyWithError,
	value::{KeySelector, TxnOperation, ValueState},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueStatus {
	pub key: String,
	pub state: ValueState,
	pub error: Option<String>,
	pub last_operation: TxnOperation,
	/// Invalid fields for INVALID values, missing dependencies for PENDING values.
	pub details: Vec<String>,
}

/// Status of a base value and of all the values derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BaseValueStatus {
	pub value: ValueStatus,
	pub derived_values: Vec<ValueStatus>,
}

struct Subscription<T> {
	tx: chan::Sender<T>,
	selector: Option<KeySelector>,
}

impl<T> Subscription<T> {
	fn wants(&self, key: &str) -> bool {
		self.selector
			.as_ref()
			.map_or(true, |selector| selector.matches(key))
	}
}

/// Subscribers for value status changes and for value errors. Delivery never blocks: a
/// subscriber which does not keep up misses updates, a closed one is dropped.
#[derive(Default)]
pub(crate) struct Subscribers {
	status: Mutex<Vec<Subscription<BaseValueStatus>>>,
	errors: Mutex<Vec<Subscription<KeyWithError>>>,
}

impl Subscribers {
	pub(crate) fn watch_status(&self, tx: chan::Sender<BaseValueStatus>, selector: Option<KeySelector>) {
		self.status
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.push(Subscription { tx, selector });
	}

	pub(crate) fn watch_errors(&self, tx: chan::Sender<KeyWithError>, selector: Option<KeySelector>) {
		self.errors
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.push(Subscription { tx, selector });
	}

	pub(crate) fn notify_status(&self, status: &BaseValueStatus) {
		notify(&self.status, &status.value.key, status);
	}

	pub(crate) fn notify_error(&self, error: &KeyWithError) {
		notify(&self.errors, &error.key, error);
	}
}

fn notify<T: Clone>(subscriptions: &Mutex<Vec<Subscription<T>>>, key: &str, msg: &T) {
	let mut subscriptions = subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
	subscriptions.retain(|subscription| {
		if !subscription.wants(key) {
			return !subscription.tx.is_closed();
		}
		match subscription.tx.try_send(msg.clone()) {
			Ok(()) => true,
			Err(chan::TrySendError::Full(_)) => {
				warn!(%key, "Subscriber channel is full, dropping notification");
				true
			}
			Err(chan::TrySendError::Closed(_)) => false,
		}
	});
}
