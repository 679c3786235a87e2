mod common;

use common::{id, tensor, values};
use indexmap::IndexMap;
use shardstate::checkpoint::{
    load_optimizer_state, load_parameters, optimizer_state_from_bytes, save_optimizer_state, save_parameters,
    GlobalCheckpointState, ParameterEntry,
};
use shardstate::optim::{AdamW, Optimizer, ParamGroup, ScalarValue};
use shardstate::ShardError;

#[test]
fn test_save_load_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("model.safetensors");

    // Registry order is not alphabetical; the file must keep it.
    let params = values(&[
        ("zeta", tensor(&[1.0, 2.0, 3.0], &[3])),
        ("alpha", tensor(&[4.0, 5.0, 6.0, 7.0], &[2, 2])),
    ]);
    save_parameters(&file_path, &params).unwrap();

    let loaded = load_parameters(&file_path).unwrap();
    assert_eq!(loaded.keys().cloned().collect::<Vec<_>>(), vec![id("zeta"), id("alpha")]);
    assert_eq!(loaded[&id("zeta")].data(), &[1.0, 2.0, 3.0]);
    assert_eq!(loaded[&id("alpha")].shape(), &[2, 2]);
    assert_eq!(loaded[&id("alpha")].data(), &[4.0, 5.0, 6.0, 7.0]);
}

#[test]
fn test_optimizer_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("optimizer.safetensors");

    // 1. Update a parameter to get a non-trivial record
    let adam = AdamW::new(0.001);
    let hyper = adam.default_hyperparameters();
    let mut param = tensor(&[1.0, -1.0], &[2]);
    let grad = tensor(&[0.1, 0.2], &[2]);
    let record = adam.update(&hyper, &mut param, &grad, None).unwrap();

    // 2. Build the global view: one stepped parameter, one never stepped
    let mut params = IndexMap::new();
    params.insert(
        id("w"),
        ParameterEntry {
            shape: vec![2],
            record: Some(record.with_scalar("clip_count", ScalarValue::Int(3))),
        },
    );
    params.insert(id("frozen"), ParameterEntry { shape: vec![1], record: None });
    let state = GlobalCheckpointState {
        params,
        groups: vec![ParamGroup::new(vec![id("w"), id("frozen")])
            .with_hyperparameter("lr", 0.001)
            .with_hyperparameter("amsgrad", false)],
    };

    // 3. Save and load, by path and by bytes
    save_optimizer_state(&file_path, &state).unwrap();
    let loaded = load_optimizer_state(&file_path).unwrap();
    assert_eq!(loaded, state);

    let bytes = std::fs::read(&file_path).unwrap();
    let from_bytes = optimizer_state_from_bytes(&bytes).unwrap();
    assert_eq!(from_bytes, state);

    let restored = from_bytes.record(&id("w")).unwrap();
    assert_eq!(restored.step, 1);
    assert!(restored.tensor("exp_avg").is_some());
    assert!(restored.tensor("exp_avg_sq").is_some());
    assert!(from_bytes.record(&id("frozen")).is_none());
}

#[test]
fn test_parameters_file_is_not_optimizer_state() {
    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("model.safetensors");
    save_parameters(&file_path, &values(&[("w", tensor(&[1.0], &[1]))])).unwrap();

    assert!(matches!(load_optimizer_state(&file_path), Err(ShardError::Serialization(_))));
}

#[test]
fn test_garbage_bytes_rejected() {
    assert!(optimizer_state_from_bytes(b"not a safetensors file").is_err());
}
