use kv_scheduler::{CommitOptions, Config, ResyncType, Scheduler, TxnType, ValueState};

use serde_json::json;
use tracing_test::traced_test;

mod common;

use common::{new_scheduler, state_of, MockDescriptor, MockSouthbound, Op};

fn add(key: &str) -> Op {
	Op::Add(key.to_string())
}

fn full_resync() -> CommitOptions {
	CommitOptions::new().with_resync(ResyncType::Full, false)
}

/// Blocking empty commit, returns once everything queued before it was processed.
async fn fence(scheduler: &Scheduler) -> u64 {
	scheduler
		.start_transaction()
		.commit(CommitOptions::new())
		.await
		.unwrap()
		.unwrap()
}

#[tokio::test]
#[traced_test]
async fn full_resync_keeps_unknown_sb_values() {
	let sb = MockSouthbound::new();
	sb.inject("/a/stale", json!({ "mtu": 1400 }));

	let scheduler = new_scheduler(Config::default());
	scheduler
		.register_descriptor(MockDescriptor::new("a", "/a/", &sb).arc())
		.unwrap();

	let mut txn = scheduler.start_transaction();
	txn.set_value("/a/x", json!({ "mtu": 1500 }));
	txn.commit(full_resync()).await.unwrap();

	assert_eq!(sb.ops(), vec![add("/a/x")]);
	assert_eq!(state_of(&scheduler, "/a/x"), ValueState::Configured);
	assert_eq!(state_of(&scheduler, "/a/stale"), ValueState::Retrieved);
	assert_eq!(sb.keys(), vec!["/a/stale".to_string(), "/a/x".to_string()]);

	let record = scheduler.get_recorded_transaction(0).unwrap();
	assert_eq!(record.resync_type, ResyncType::Full);
	assert_eq!(record.txn_type, TxnType::NbTransaction);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn full_resync_repairs_lost_value() {
	let sb = MockSouthbound::new();
	let scheduler = new_scheduler(Config::default());
	scheduler
		.register_descriptor(MockDescriptor::new("a", "/a/", &sb).arc())
		.unwrap();

	let mut txn = scheduler.start_transaction();
	txn.set_value("/a/x", json!({ "mtu": 1500 }));
	txn.commit(CommitOptions::new()).await.unwrap();

	sb.remove("/a/x");
	sb.clear_ops();

	let mut txn = scheduler.start_transaction();
	txn.set_value("/a/x", json!({ "mtu": 1500 }));
	txn.commit(full_resync()).await.unwrap();

	assert_eq!(sb.ops(), vec![add("/a/x")]);
	assert_eq!(sb.value("/a/x"), Some(json!({ "mtu": 1500 })));
	assert_eq!(state_of(&scheduler, "/a/x"), ValueState::Configured);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn full_resync_removes_values_not_requested() {
	let sb = MockSouthbound::new();
	let scheduler = new_scheduler(Config::default());
	scheduler
		.register_descriptor(MockDescriptor::new("a", "/a/", &sb).arc())
		.unwrap();

	let mut txn = scheduler.start_transaction();
	txn.set_value("/a/x", json!({})).set_value("/a/y", json!({}));
	txn.commit(CommitOptions::new()).await.unwrap();
	sb.clear_ops();

	let mut txn = scheduler.start_transaction();
	txn.set_value("/a/x", json!({}));
	txn.commit(full_resync()).await.unwrap();
	scheduler.transaction_barrier().await;

	assert_eq!(sb.ops(), vec![Op::Delete("/a/y".to_string())]);
	assert_eq!(sb.keys(), vec!["/a/x".to_string()]);
	assert_eq!(state_of(&scheduler, "/a/x"), ValueState::Configured);
	assert_eq!(state_of(&scheduler, "/a/y"), ValueState::NonExistent);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn downstream_resync_reapplies_known_state() {
	let sb = MockSouthbound::new();
	let scheduler = new_scheduler(Config::default());
	scheduler
		.register_descriptor(MockDescriptor::new("a", "/a/", &sb).arc())
		.unwrap();

	let mut txn = scheduler.start_transaction();
	txn.set_value("/a/x", json!({ "mtu": 1500 }))
		.set_value("/a/y", json!({ "mtu": 9000 }));
	txn.commit(CommitOptions::new()).await.unwrap();

	sb.remove("/a/x");
	sb.clear_ops();

	scheduler
		.start_transaction()
		.commit(CommitOptions::new().with_resync(ResyncType::Downstream, true))
		.await
		.unwrap();

	assert_eq!(sb.ops(), vec![add("/a/x")]);
	assert_eq!(sb.value("/a/x"), Some(json!({ "mtu": 1500 })));
	assert_eq!(state_of(&scheduler, "/a/x"), ValueState::Configured);
	assert_eq!(state_of(&scheduler, "/a/y"), ValueState::Configured);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn upstream_resync_does_not_dump() {
	let sb = MockSouthbound::new();
	sb.inject("/a/stale", json!({}));

	let scheduler = new_scheduler(Config::default());
	scheduler
		.register_descriptor(MockDescriptor::new("a", "/a/", &sb).arc())
		.unwrap();

	let mut txn = scheduler.start_transaction();
	txn.set_value("/a/x", json!({}));
	txn.commit(CommitOptions::new().with_resync(ResyncType::Upstream, false))
		.await
		.unwrap();

	assert_eq!(sb.ops(), vec![add("/a/x")]);
	assert_eq!(state_of(&scheduler, "/a/stale"), ValueState::NonExistent);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn notification_creates_retrieved_value() {
	let sb = MockSouthbound::new();
	let scheduler = new_scheduler(Config::default());
	scheduler
		.register_descriptor(MockDescriptor::new("a", "/a/", &sb).arc())
		.unwrap();

	scheduler
		.push_notification("/a/n", Some(json!({ "mtu": 1400 })), None)
		.unwrap();
	fence(&scheduler).await;

	assert!(sb.ops().is_empty());
	let status = scheduler.get_value_status("/a/n");
	assert_eq!(status.value.state, ValueState::Retrieved);

	let record = scheduler.get_recorded_transaction(0).unwrap();
	assert_eq!(record.txn_type, TxnType::SbNotification);
	assert_eq!(record.executed.len(), 1);

	// removal reported by the southbound
	scheduler.push_notification("/a/n", None, None).unwrap();
	fence(&scheduler).await;

	assert!(sb.ops().is_empty());
	assert_eq!(state_of(&scheduler, "/a/n"), ValueState::NonExistent);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn notification_for_nb_value_is_ignored() {
	let sb = MockSouthbound::new();
	let scheduler = new_scheduler(Config::default());
	scheduler
		.register_descriptor(MockDescriptor::new("a", "/a/", &sb).arc())
		.unwrap();

	let mut txn = scheduler.start_transaction();
	txn.set_value("/a/x", json!({ "mtu": 1500 }));
	txn.commit(CommitOptions::new()).await.unwrap();

	scheduler
		.push_notification("/a/x", Some(json!({ "mtu": 1 })), None)
		.unwrap();
	// keys without a descriptor are ignored too
	scheduler
		.push_notification("/unknown/x", Some(json!({})), None)
		.unwrap();
	fence(&scheduler).await;

	let status = scheduler.get_value_status("/a/x");
	assert_eq!(status.value.state, ValueState::Configured);
	assert_eq!(sb.ops(), vec![add("/a/x")]);
	assert_eq!(state_of(&scheduler, "/unknown/x"), ValueState::NonExistent);

	for seq_num in [1, 2] {
		let record = scheduler.get_recorded_transaction(seq_num).unwrap();
		assert_eq!(record.txn_type, TxnType::SbNotification);
		assert!(record.executed.is_empty());
	}

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn dependent_waits_for_notified_value() {
	let sb = MockSouthbound::new();
	let scheduler = new_scheduler(Config::default());
	scheduler
		.register_descriptor(MockDescriptor::new("x", "/x/", &sb).with_deps_field().arc())
		.unwrap();
	scheduler
		.register_descriptor(MockDescriptor::new("link", "/link/", &sb).arc())
		.unwrap();

	let mut txn = scheduler.start_transaction();
	txn.set_value("/x/vlan", json!({ "deps": ["/link/up"] }));
	txn.commit(CommitOptions::new()).await.unwrap();
	assert_eq!(state_of(&scheduler, "/x/vlan"), ValueState::Pending);

	scheduler
		.push_notification("/link/up", Some(json!({})), None)
		.unwrap();
	fence(&scheduler).await;

	assert_eq!(sb.ops(), vec![add("/x/vlan")]);
	assert_eq!(state_of(&scheduler, "/link/up"), ValueState::Retrieved);
	assert_eq!(state_of(&scheduler, "/x/vlan"), ValueState::Configured);

	scheduler.shutdown().await;
}
