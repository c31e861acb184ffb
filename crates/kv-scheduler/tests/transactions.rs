use kv_scheduler::{CommitOptions, Config, Error, KeyValuePair, OperationError, ResyncType, TxnOperation, ValueState};

use serde_json::{json, Value};
use tracing_test::traced_test;

mod common;

use common::{new_scheduler, state_of, MockDescriptor, MockSouthbound, Op};

fn add(key: &str) -> Op {
	Op::Add(key.to_string())
}

fn delete(key: &str) -> Op {
	Op::Delete(key.to_string())
}

#[tokio::test]
#[traced_test]
async fn single_value_is_added() {
	let sb = MockSouthbound::new();
	let scheduler = new_scheduler(Config::default());
	scheduler
		.register_descriptor(MockDescriptor::new("a", "/a/", &sb).arc())
		.unwrap();

	let mut txn = scheduler.start_transaction();
	txn.set_value("/a/x", json!({ "mtu": 1500 }));
	let seq_num = txn.commit(CommitOptions::new()).await.unwrap();

	assert_eq!(seq_num, Some(0));
	assert_eq!(sb.ops(), vec![add("/a/x")]);
	assert_eq!(state_of(&scheduler, "/a/x"), ValueState::Configured);

	let record = scheduler.get_recorded_transaction(0).unwrap();
	assert!(!record.pre_record);
	assert_eq!(record.planned.len(), 1);
	assert_eq!(record.executed.len(), 1);
	assert_eq!(record.executed[0].operation, TxnOperation::Add);
	assert_eq!(record.executed[0].key, "/a/x");
	assert_eq!(record.executed[0].new_state, ValueState::Configured);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn dependency_is_added_first() {
	let sb = MockSouthbound::new();
	let scheduler = new_scheduler(Config::default());
	scheduler
		.register_descriptor(MockDescriptor::new("x", "/x/", &sb).with_deps_field().arc())
		.unwrap();

	// the dependent sorts before its dependency
	let mut txn = scheduler.start_transaction();
	txn.set_value("/x/dependent", json!({ "deps": ["/x/zzz"] }))
		.set_value("/x/zzz", json!({}));
	let seq_num = txn.commit(CommitOptions::new()).await.unwrap().unwrap();

	assert_eq!(sb.ops(), vec![add("/x/zzz"), add("/x/dependent")]);

	let record = scheduler.get_recorded_transaction(seq_num).unwrap();
	let executed = record
		.executed
		.iter()
		.map(|op| (op.key.as_str(), op.operation, op.new_state))
		.collect::<Vec<_>>();
	assert_eq!(
		executed,
		vec![
			("/x/zzz", TxnOperation::Add, ValueState::Configured),
			("/x/dependent", TxnOperation::Add, ValueState::Configured),
		]
	);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn pending_value_waits_for_dependency() {
	let sb = MockSouthbound::new();
	let scheduler = new_scheduler(Config::default());
	scheduler
		.register_descriptor(MockDescriptor::new("x", "/x/", &sb).with_deps_field().arc())
		.unwrap();

	let mut txn = scheduler.start_transaction();
	txn.set_value("/x/b", json!({ "deps": ["/x/missing"] }));
	txn.commit(CommitOptions::new()).await.unwrap();

	assert!(sb.ops().is_empty());
	let status = scheduler.get_value_status("/x/b");
	assert_eq!(status.value.state, ValueState::Pending);
	assert_eq!(status.value.details, vec!["/x/missing".to_string()]);

	let mut txn = scheduler.start_transaction();
	txn.set_value("/x/missing", json!({}));
	txn.commit(CommitOptions::new()).await.unwrap();

	assert_eq!(sb.ops(), vec![add("/x/missing"), add("/x/b")]);
	assert_eq!(state_of(&scheduler, "/x/b"), ValueState::Configured);

	// removing the dependency takes the dependent down first
	sb.clear_ops();
	let mut txn = scheduler.start_transaction();
	txn.delete_value("/x/missing");
	txn.commit(CommitOptions::new()).await.unwrap();

	assert_eq!(sb.ops(), vec![delete("/x/b"), delete("/x/missing")]);
	// removed values leave the graph once the transaction is finalized
	scheduler.transaction_barrier().await;
	assert_eq!(state_of(&scheduler, "/x/b"), ValueState::Pending);
	assert_eq!(state_of(&scheduler, "/x/missing"), ValueState::NonExistent);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn dependency_removed_after_dependent_was_configured() {
	let sb = MockSouthbound::new();
	let scheduler = new_scheduler(Config::default());
	scheduler
		.register_descriptor(MockDescriptor::new("x", "/x/", &sb).with_deps_field().arc())
		.unwrap();

	let mut txn = scheduler.start_transaction();
	txn.set_value("/x/base", json!({}));
	txn.commit(CommitOptions::new()).await.unwrap();

	let mut txn = scheduler.start_transaction();
	txn.set_value("/x/dependent", json!({ "deps": ["/x/base"] }));
	txn.commit(CommitOptions::new()).await.unwrap();
	assert_eq!(state_of(&scheduler, "/x/dependent"), ValueState::Configured);

	sb.clear_ops();
	let mut txn = scheduler.start_transaction();
	txn.delete_value("/x/base");
	txn.commit(CommitOptions::new()).await.unwrap();
	scheduler.transaction_barrier().await;

	assert_eq!(sb.ops(), vec![delete("/x/dependent"), delete("/x/base")]);
	assert_eq!(sb.keys(), Vec::<String>::new());
	let status = scheduler.get_value_status("/x/dependent");
	assert_eq!(status.value.state, ValueState::Pending);
	assert_eq!(status.value.details, vec!["/x/base".to_string()]);

	sb.clear_ops();
	let mut txn = scheduler.start_transaction();
	txn.set_value("/x/base", json!({}));
	txn.commit(CommitOptions::new()).await.unwrap();

	assert_eq!(sb.ops(), vec![add("/x/base"), add("/x/dependent")]);
	assert_eq!(state_of(&scheduler, "/x/dependent"), ValueState::Configured);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn same_state_twice_is_a_noop() {
	let sb = MockSouthbound::new();
	let scheduler = new_scheduler(Config::default());
	scheduler
		.register_descriptor(MockDescriptor::new("a", "/a/", &sb).arc())
		.unwrap();

	for _ in 0..2 {
		let mut txn = scheduler.start_transaction();
		txn.set_value("/a/x", json!({ "mtu": 1500 }))
			.set_value("/a/y", json!({ "mtu": 9000 }));
		txn.commit(CommitOptions::new()).await.unwrap();
	}

	assert_eq!(sb.ops(), vec![add("/a/x"), add("/a/y")]);
	let second = scheduler.get_recorded_transaction(1).unwrap();
	assert!(second.planned.is_empty());
	assert!(second.executed.is_empty());

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn dependency_cycle_resolves_together() {
	let sb = MockSouthbound::new();
	let scheduler = new_scheduler(Config::default());
	scheduler
		.register_descriptor(MockDescriptor::new("c", "/c/", &sb).with_deps_field().arc())
		.unwrap();

	let mut txn = scheduler.start_transaction();
	txn.set_value("/c/a", json!({ "deps": ["/c/b", "/c/e"] }))
		.set_value("/c/b", json!({ "deps": ["/c/c"] }))
		.set_value("/c/c", json!({ "deps": ["/c/a"] }));
	txn.commit(CommitOptions::new()).await.unwrap();

	assert!(sb.ops().is_empty());
	for key in ["/c/a", "/c/b", "/c/c"] {
		assert_eq!(state_of(&scheduler, key), ValueState::Pending);
	}

	let mut txn = scheduler.start_transaction();
	txn.set_value("/c/e", json!({}));
	let seq_num = txn.commit(CommitOptions::new()).await.unwrap().unwrap();

	assert_eq!(sb.ops(), vec![add("/c/e"), add("/c/a"), add("/c/c"), add("/c/b")]);
	for key in ["/c/a", "/c/b", "/c/c", "/c/e"] {
		assert_eq!(state_of(&scheduler, key), ValueState::Configured);
	}

	let record = scheduler.get_recorded_transaction(seq_num).unwrap();
	assert_eq!(record.executed.len(), 4);
	assert!(record
		.executed
		.iter()
		.all(|op| op.new_state == ValueState::Configured));

	scheduler.shutdown().await;
}

fn interface_addresses(key: &str, value: &Value) -> Vec<KeyValuePair> {
	let name = key.rsplit('/').next().unwrap_or_default();
	value["addrs"]
		.as_array()
		.map(|addrs| {
			addrs
				.iter()
				.filter_map(Value::as_str)
				.map(|addr| KeyValuePair {
					key: format!("/addr/{name}/{addr}"),
					value: Some(json!({ "ip": addr })),
				})
				.collect()
		})
		.unwrap_or_default()
}

#[tokio::test]
#[traced_test]
async fn derived_values_follow_their_base() {
	let sb = MockSouthbound::new();
	let scheduler = new_scheduler(Config::default());
	scheduler
		.register_descriptor(
			MockDescriptor::new("iface", "/iface/", &sb)
				.with_derived(interface_addresses)
				.arc(),
		)
		.unwrap();
	scheduler
		.register_descriptor(MockDescriptor::new("addr", "/addr/", &sb).arc())
		.unwrap();

	let mut txn = scheduler.start_transaction();
	txn.set_value("/iface/eth0", json!({ "addrs": ["10.0.0.1", "10.0.0.2"] }));
	txn.commit(CommitOptions::new()).await.unwrap();

	assert_eq!(
		sb.ops(),
		vec![add("/iface/eth0"), add("/addr/eth0/10.0.0.1"), add("/addr/eth0/10.0.0.2")]
	);
	let status = scheduler.get_value_status("/iface/eth0");
	assert_eq!(status.derived_values.len(), 2);
	assert!(status
		.derived_values
		.iter()
		.all(|derived| derived.state == ValueState::Configured));

	// dropped address is removed, the interface itself only modified
	sb.clear_ops();
	let mut txn = scheduler.start_transaction();
	txn.set_value("/iface/eth0", json!({ "addrs": ["10.0.0.1"], "mtu": 9000 }));
	txn.commit(CommitOptions::new()).await.unwrap();

	assert_eq!(
		sb.ops(),
		vec![delete("/addr/eth0/10.0.0.2"), Op::Modify("/iface/eth0".to_string())]
	);

	sb.clear_ops();
	let mut txn = scheduler.start_transaction();
	txn.delete_value("/iface/eth0");
	let seq_num = txn.commit(CommitOptions::new()).await.unwrap().unwrap();

	assert_eq!(sb.ops(), vec![delete("/addr/eth0/10.0.0.1"), delete("/iface/eth0")]);
	let record = scheduler.get_recorded_transaction(seq_num).unwrap();
	assert_eq!(record.executed.len(), 2);
	assert!(record.executed[0].is_derived);
	assert_eq!(record.executed[0].operation, TxnOperation::Delete);
	assert!(!record.executed[1].is_derived);
	assert_eq!(record.executed[1].key, "/iface/eth0");
	assert_eq!(state_of(&scheduler, "/addr/eth0/10.0.0.1"), ValueState::NonExistent);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn incompatible_change_recreates_value() {
	let sb = MockSouthbound::new();
	let scheduler = new_scheduler(Config::default());
	scheduler
		.register_descriptor(
			MockDescriptor::new("r", "/r/", &sb)
				.with_recreate(|old, new| old["type"] != new["type"])
				.arc(),
		)
		.unwrap();

	let mut txn = scheduler.start_transaction();
	txn.set_value("/r/x", json!({ "type": "tap" }));
	txn.commit(CommitOptions::new()).await.unwrap();

	sb.clear_ops();
	let mut txn = scheduler.start_transaction();
	txn.set_value("/r/x", json!({ "type": "memif" }));
	let seq_num = txn.commit(CommitOptions::new()).await.unwrap().unwrap();

	assert_eq!(sb.ops(), vec![delete("/r/x"), add("/r/x")]);
	assert_eq!(sb.value("/r/x"), Some(json!({ "type": "memif" })));
	assert_eq!(state_of(&scheduler, "/r/x"), ValueState::Configured);

	let record = scheduler.get_recorded_transaction(seq_num).unwrap();
	assert_eq!(record.executed.len(), 2);
	assert!(record.executed.iter().all(|op| op.is_recreate));

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn invalid_value_never_reaches_southbound() {
	let sb = MockSouthbound::new();
	let scheduler = new_scheduler(Config::default());
	scheduler
		.register_descriptor(MockDescriptor::new("a", "/a/", &sb).with_max_mtu(9000).arc())
		.unwrap();

	let mut txn = scheduler.start_transaction();
	txn.set_value("/a/x", json!({ "mtu": 9999 }));
	let error = txn.commit(CommitOptions::new()).await.unwrap_err();

	assert!(matches!(
		error.error_for_key("/a/x"),
		Some(OperationError::InvalidValue(_))
	));
	assert!(sb.ops().is_empty());

	let status = scheduler.get_value_status("/a/x");
	assert_eq!(status.value.state, ValueState::Invalid);
	assert_eq!(status.value.details, vec!["mtu".to_string()]);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn value_without_descriptor_is_unimplemented() {
	let scheduler = new_scheduler(Config::default());

	let mut txn = scheduler.start_transaction();
	txn.set_value("/unknown/x", json!({}));
	let seq_num = txn.commit(CommitOptions::new()).await.unwrap().unwrap();

	assert_eq!(state_of(&scheduler, "/unknown/x"), ValueState::Unimplemented);
	let record = scheduler.get_recorded_transaction(seq_num).unwrap();
	assert_eq!(record.executed.len(), 1);
	assert!(record.executed[0].noop);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn invalid_combinations_are_rejected() {
	let scheduler = new_scheduler(Config::default());

	let mut txn = scheduler.start_transaction();
	txn.set_value("/a/x", json!({}));
	let error = txn
		.commit(CommitOptions::new().with_resync(ResyncType::Downstream, false))
		.await
		.unwrap_err();
	assert!(matches!(error.init_error, Some(Error::CombinedDownstreamResyncWithChange)));

	let txn = scheduler.start_transaction();
	let error = txn
		.commit(
			CommitOptions::new()
				.with_resync(ResyncType::Full, false)
				.with_revert(),
		)
		.await
		.unwrap_err();
	assert!(matches!(error.init_error, Some(Error::RevertNotSupportedWithResync)));
	assert!(scheduler.get_transaction_history(None, None).is_empty());

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn non_blocking_commit_is_processed_in_order() {
	let sb = MockSouthbound::new();
	let scheduler = new_scheduler(Config::default());
	scheduler
		.register_descriptor(MockDescriptor::new("a", "/a/", &sb).arc())
		.unwrap();

	let mut txn = scheduler.start_transaction();
	txn.set_value("/a/x", json!({}));
	assert_eq!(
		txn.commit(CommitOptions::new().non_blocking()).await.unwrap(),
		None
	);

	let mut txn = scheduler.start_transaction();
	txn.set_value("/a/y", json!({}));
	assert_eq!(txn.commit(CommitOptions::new()).await.unwrap(), Some(1));

	assert_eq!(sb.ops(), vec![add("/a/x"), add("/a/y")]);

	scheduler.shutdown().await;
}
