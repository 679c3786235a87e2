mod common;

use common::model::{self, fc1, fc2};
use common::{assert_close, id, run_ranks, tensor, values};
use shardstate::amp::{DynamicLossScaler, LossScaler, StaticLossScaler};
use shardstate::distributed::{CollectiveBackend, CpuBackend, ParamShardRegistry, ShardedModule, StepOutcome};
use shardstate::optim::{ParamGroups, Sgd};
use shardstate::{ShardConfig, ShardError};

const TOLERANCE: f32 = 1e-3;

#[test]
fn test_sharded_mixed_precision_matches_single_process() {
    let iterations = 3;

    let reference = run_ranks(1, |backend| {
        let mut module = model::build(backend, model::registry(1), &model::initial_weights());
        model::train(&mut module, iterations);
        (module.parameter_state().unwrap(), module.global_state().unwrap())
    })
    .remove(0);

    let (ref_params, ref_state) = reference;
    let sharded = run_ranks(2, |backend| {
        let mut module = model::build(backend, model::registry(2), &model::initial_weights());
        model::train(&mut module, iterations);
        assert!(module.state_matches(&ref_state).unwrap());

        // Replicas see the owner's updated weight after every step.
        let other = if module.rank() == 0 { fc2() } else { fc1() };
        assert!(module.master_of(&other).is_err());
        module.training_weight(&other).unwrap();

        (module.parameter_state().unwrap(), module.global_state().unwrap())
    });

    for (params, state) in &sharded {
        for (pid, expected) in &ref_params {
            assert_close(&params[pid], expected, TOLERANCE, pid.as_str());
        }
        assert_eq!(state.record(&fc1()).unwrap().step, iterations as u64);
    }
    // Both ranks return the same assembled state.
    assert_eq!(sharded[0].1, sharded[1].1);
}

#[test]
fn test_local_state_holds_owned_records_only() {
    run_ranks(2, |backend| {
        let mut module = model::build(backend, model::registry(2), &model::initial_weights());
        model::train(&mut module, 1);

        let (mine, theirs) = if module.rank() == 0 { (fc1(), fc2()) } else { (fc2(), fc1()) };
        let local = module.local_state();
        assert_eq!(local.len(), 1);
        assert_eq!(local.get(&mine).unwrap().step, 1);
        assert!(matches!(local.get(&theirs), Err(ShardError::Uninitialized(_))));
    });
}

#[test]
fn test_init_broadcasts_owner_weights() {
    run_ranks(2, |backend| {
        let rank = backend.rank();
        // Each rank starts from different values; owners win.
        let v = rank as f32 + 1.0;
        let initial = values(&[("P1", tensor(&[v, v], &[2])), ("P2", tensor(&[v * 10.0], &[1]))]);
        let mut registry = ParamShardRegistry::new(2);
        registry.register(id("P1"), 0, &[2]).unwrap();
        registry.register(id("P2"), 1, &[1]).unwrap();

        let module = ShardedModule::new(
            backend,
            registry,
            &initial,
            Sgd::new(0.1),
            ParamGroups::default(),
            ShardConfig::default(),
        )
        .unwrap();
        assert_eq!(module.training_weight(&id("P1")).unwrap().data(), &[1.0, 1.0]);
        assert_eq!(module.training_weight(&id("P2")).unwrap().data(), &[20.0]);
    });
}

#[test]
fn test_overflow_on_one_rank_skips_step_everywhere() {
    let results = run_ranks(2, |backend| {
        let rank = backend.rank();
        let mut registry = ParamShardRegistry::new(2);
        registry.register(id("shared"), 0, &[1]).unwrap();
        // Only rank 1 holds this one, so only rank 1 can see its overflow.
        registry.register_replicated(id("private"), 1, &[1], vec![1]).unwrap();

        let initial = values(&[("shared", tensor(&[1.0], &[1])), ("private", tensor(&[1.0], &[1]))]);
        let mut module = ShardedModule::new(
            backend,
            registry,
            &initial,
            Sgd::new(0.5),
            ParamGroups::default(),
            ShardConfig::default().with_hold_allreduce(true),
        )
        .unwrap();
        let mut scaler = DynamicLossScaler::new(8.0);

        module.accumulate_gradient(&id("shared"), &tensor(&[8.0], &[1])).unwrap();
        if rank == 1 {
            module
                .accumulate_gradient(&id("private"), &tensor(&[f32::INFINITY], &[1]))
                .unwrap();
        }
        assert!(!module.finish_backward().unwrap());
        module.flush().unwrap();
        assert_eq!(module.step(&mut scaler).unwrap(), StepOutcome::SkippedOverflow);
        assert_eq!(scaler.loss_scale(), 4.0);
        let after_skip = module.training_weight(&id("shared")).unwrap().data()[0];

        // A clean iteration applies: grad 4.0 / scale 4.0 = 1.0, lr 0.5.
        module.accumulate_gradient(&id("shared"), &tensor(&[4.0], &[1])).unwrap();
        module.flush().unwrap();
        assert_eq!(module.step(&mut scaler).unwrap(), StepOutcome::Applied);
        (after_skip, module.training_weight(&id("shared")).unwrap().data()[0])
    });
    assert_eq!(results, vec![(1.0, 0.5), (1.0, 0.5)]);
}

#[test]
fn test_step_requires_fresh_reduction() {
    run_ranks(1, |backend| {
        let mut module = model::build(backend, model::registry(1), &model::initial_weights());
        let mut scaler = StaticLossScaler::new(1.0);
        assert!(matches!(module.step(&mut scaler), Err(ShardError::GradientsNotReduced)));

        module.accumulate_gradient(&fc1(), &shardstate::Tensor::zeros(&[2, 3])).unwrap();
        assert!(matches!(module.step(&mut scaler), Err(ShardError::GradientsNotReduced)));

        module.flush().unwrap();
        module.step(&mut scaler).unwrap();
        // The same reduction cannot feed a second step.
        assert!(matches!(module.step(&mut scaler), Err(ShardError::GradientsNotReduced)));
    });
}

#[test]
fn test_clip_grad_norm_counts_each_parameter_once() {
    let norms = run_ranks(2, |backend| {
        let mut registry = ParamShardRegistry::new(2);
        registry.register(id("a"), 0, &[2]).unwrap();
        registry.register(id("b"), 1, &[1]).unwrap();
        let initial = values(&[("a", tensor(&[0.0, 0.0], &[2])), ("b", tensor(&[0.0], &[1]))]);
        let mut module = ShardedModule::new(
            backend,
            registry,
            &initial,
            Sgd::new(1.0),
            ParamGroups::default(),
            ShardConfig::default(),
        )
        .unwrap();

        // Reduced gradients: a = [3, 0], b = [4]; global norm 5.
        module.accumulate_gradient(&id("a"), &tensor(&[3.0, 0.0], &[2])).unwrap();
        module.accumulate_gradient(&id("b"), &tensor(&[4.0], &[1])).unwrap();
        module.finish_backward().unwrap();
        let norm = module.clip_grad_norm(&StaticLossScaler::new(1.0), 1.0).unwrap();
        let clipped = module.gradient(&id("b")).unwrap().data()[0];
        (norm, clipped)
    });
    for (norm, clipped) in norms {
        assert!((norm - 5.0).abs() < 1e-5);
        assert!((clipped - 0.8).abs() < 1e-5);
    }
}

#[test]
fn test_clip_threshold_applies_to_unscaled_gradients() {
    run_ranks(1, |backend| {
        let mut registry = ParamShardRegistry::new(1);
        registry.register(id("w"), 0, &[1]).unwrap();
        let mut module = ShardedModule::new(
            backend,
            registry,
            &values(&[("w", tensor(&[0.0], &[1]))]),
            Sgd::new(1.0),
            ParamGroups::default(),
            ShardConfig::default(),
        )
        .unwrap();
        let mut scaler = StaticLossScaler::new(16.0);

        // Scaled gradient 32 is a true gradient of 2.
        module.accumulate_gradient(&id("w"), &tensor(&[32.0], &[1])).unwrap();
        module.flush().unwrap();
        let norm = module.clip_grad_norm(&scaler, 1.0).unwrap();
        assert!((norm - 2.0).abs() < 1e-5);

        assert_eq!(module.step(&mut scaler).unwrap(), StepOutcome::Applied);
        let w = module.training_weight(&id("w")).unwrap().data()[0];
        assert!((w + 1.0).abs() < 1e-5, "weight after clipped step: {}", w);
    });
}

#[test]
fn test_step_hook_rejects_foreign_parameter() {
    run_ranks(2, |backend| {
        let mut module = model::build(backend, model::registry(2), &model::initial_weights());
        let foreign = if module.rank() == 0 { fc2() } else { fc1() };
        let record = shardstate::optim::OptimizerRecord::new(1);
        assert!(matches!(
            module.step_hook(&foreign, record),
            Err(ShardError::NotOwner { .. })
        ));
    });
}

#[test]
fn test_missing_initial_value_rejected() {
    let backend: CpuBackend = CpuBackend::mesh(1).remove(0);
    let result = ShardedModule::new(
        backend,
        model::registry(1),
        &values(&[("fc1.weight", shardstate::Tensor::zeros(&[2, 3]))]),
        Sgd::new(0.1),
        ParamGroups::default(),
        ShardConfig::default(),
    );
    assert!(matches!(result, Err(ShardError::MissingParameter(pid)) if pid == fc2()));
}
