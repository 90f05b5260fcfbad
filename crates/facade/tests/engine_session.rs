mod common;

use std::sync::Arc;

use common::{batch, config, Example, Linear};
use dp_engine::{
    AccountantKind, DpError, GdpAccountant, LedgerSnapshot, Optimizer, PrivacyAccountant,
    PrivacyConfig, PrivacyEngine, PrivateUpdate, RdpAccountant, Result, Sgd, Tensor,
};

fn sgd() -> Sgd {
    Sgd::new(0.05).expect("sgd")
}

fn run(cfg: PrivacyConfig, steps: usize) -> (Linear, PrivacyEngine<Sgd>) {
    let mut engine = PrivacyEngine::new(cfg, sgd()).expect("engine");
    let mut model = Linear::new(3);
    for _ in 0..steps {
        engine.step(&mut model, &batch()[..]).expect("step");
    }
    (model, engine)
}

#[test]
fn seeded_sessions_are_reproducible() {
    let (a, ea) = run(config(), 5);
    let (b, eb) = run(config(), 5);
    assert_eq!(a.weights, b.weights);
    assert_eq!(ea.ledger_state(), eb.ledger_state());

    let (c, _) = run(config().with_seed(43), 5);
    assert_ne!(a.weights, c.weights);
}

#[test]
fn each_step_draws_fresh_noise() {
    let mut engine = PrivacyEngine::new(config(), sgd()).expect("engine");
    let mut model = Linear::new(3);
    let zero: Vec<Example> = vec![(vec![0.0, 0.0, 0.0], 0.0); 4];
    let first = engine.step(&mut model, &zero[..]).expect("step").update;
    let second = engine.step(&mut model, &zero[..]).expect("step").update;
    assert_ne!(first, second);
}

#[test]
fn calibrated_session_stays_within_budget() {
    let cfg = PrivacyConfig::new(1.0, 2.0, 1e-5, 1.0, 0.05).with_seed(1);
    let total = cfg.total_steps().expect("steps");
    let mut engine = PrivacyEngine::new(cfg, sgd()).expect("engine");
    let mut model = Linear::new(3);
    for _ in 0..total {
        engine.step(&mut model, &batch()[..]).expect("step");
    }
    let spend = engine.privacy_spent(1e-5).expect("spend");
    assert_eq!(engine.steps(), total);
    assert!(spend.epsilon <= 2.0);
    assert!(spend.epsilon > 1.5);
}

#[test]
fn epsilon_grows_with_every_step() {
    let mut engine = PrivacyEngine::new(config(), sgd()).expect("engine");
    let mut model = Linear::new(3);
    let mut last = engine.get_epsilon(1e-5).expect("eps");
    assert_eq!(last, 0.0);
    for _ in 0..10 {
        engine.step(&mut model, &batch()[..]).expect("step");
        let eps = engine.get_epsilon(1e-5).expect("eps");
        assert!(eps >= last);
        last = eps;
    }
}

#[test]
fn enforced_budget_refuses_the_overspending_step() {
    let cfg = PrivacyConfig::new(1.0, 1.0, 1e-5, 0.1, 0.05)
        .with_noise_multiplier(2.0)
        .with_seed(9)
        .with_enforce_budget(true);
    let mut engine = PrivacyEngine::new(cfg, sgd()).expect("engine");
    let mut model = Linear::new(3);

    let err = loop {
        match engine.step(&mut model, &batch()[..]) {
            Ok(_) => assert!(engine.steps() < 10_000, "budget never ran out"),
            Err(e) => break e,
        }
    };
    match err {
        DpError::BudgetExhausted { eps, delta } => {
            assert!(eps > 1.0);
            assert_eq!(delta, 1e-5);
        }
        other => panic!("unexpected error: {other}"),
    }

    let steps = engine.steps();
    let weights = model.weights.clone();
    assert!(engine.step(&mut model, &batch()[..]).is_err());
    assert_eq!(engine.steps(), steps);
    assert_eq!(model.weights, weights);
    assert!(engine.get_epsilon(1e-5).expect("eps") <= 1.0);
}

#[test]
fn empty_batches_need_expected_batch_size() {
    let empty: Vec<Example> = Vec::new();

    let mut engine = PrivacyEngine::new(config(), sgd()).expect("engine");
    let mut model = Linear::new(3);
    assert!(matches!(
        engine.step(&mut model, &empty[..]),
        Err(DpError::InvalidParameters { .. })
    ));
    assert_eq!(engine.steps(), 0);

    let mut engine =
        PrivacyEngine::new(config().with_expected_batch_size(4), sgd()).expect("engine");
    let report = engine.step(&mut model, &empty[..]).expect("noise-only step");
    assert_eq!(report.update.examples(), 0);
    assert_eq!(engine.steps(), 1);
}

#[test]
fn ledger_checkpoint_restores_spend() {
    let (_, engine) = run(config(), 7);
    let saved = engine.ledger_state();
    let json = serde_json::to_string(&saved).expect("serialize");

    let mut resumed = PrivacyEngine::new(config(), sgd()).expect("engine");
    resumed
        .restore_ledger(serde_json::from_str(&json).expect("deserialize"))
        .expect("restore");
    assert_eq!(resumed.steps(), 7);
    assert_eq!(
        resumed.get_epsilon(1e-5).expect("eps"),
        engine.get_epsilon(1e-5).expect("eps")
    );
    let mut model = Linear::new(3);
    assert_eq!(resumed.step(&mut model, &batch()[..]).expect("step").step, 8);
}

#[test]
fn restore_refuses_to_overwrite_history() {
    let (_, mut engine) = run(config(), 10);
    let before = engine.get_epsilon(1e-5).expect("eps");
    let err = engine
        .restore_ledger(LedgerSnapshot::default())
        .expect_err("stepped session");
    assert!(matches!(err, DpError::Configuration { .. }));
    assert_eq!(engine.steps(), 10);
    assert_eq!(engine.get_epsilon(1e-5).expect("eps"), before);

    let mut model = Linear::new(3);
    engine.accumulate(&mut model, &batch()[..]).expect("accumulate");
    engine.reset();
    engine.accumulate(&mut model, &batch()[..]).expect("accumulate");
    assert!(matches!(
        engine.restore_ledger(LedgerSnapshot::default()),
        Err(DpError::Configuration { .. })
    ));
}

/// Applies the update, then reports failure on the first call only.
#[derive(Default)]
struct FailsAfterApplyOnce {
    calls: usize,
    seen: Vec<PrivateUpdate>,
}

impl Optimizer for FailsAfterApplyOnce {
    fn apply(&mut self, params: &mut Tensor, update: &PrivateUpdate) -> Result<()> {
        self.calls += 1;
        *params -= &update.view();
        self.seen.push(update.clone());
        if self.calls == 1 {
            return Err(DpError::invalid("optimizer failed"));
        }
        Ok(())
    }
}

#[test]
fn failed_apply_is_still_charged() {
    let mut engine =
        PrivacyEngine::new(config(), FailsAfterApplyOnce::default()).expect("engine");
    let model_batch: Vec<Example> = batch();
    let mut model = Linear::new(3);

    assert!(engine.step(&mut model, &model_batch[..]).is_err());
    assert_eq!(engine.steps(), 1);
    assert!(engine.get_epsilon(1e-5).expect("eps") > 0.0);

    // Same weights, same batch: only fresh noise can tell the updates apart.
    let mut fresh = Linear::new(3);
    let report = engine.step(&mut fresh, &model_batch[..]).expect("step");
    assert_eq!(report.step, 2);
    let seen = &engine.optimizer().seen;
    assert_eq!(seen.len(), 2);
    assert!(seen[0]
        .view()
        .iter()
        .zip(seen[1].view().iter())
        .all(|(a, b)| a != b));
}

#[test]
fn independent_sessions_do_not_share_ledgers() {
    let (_, a) = run(config(), 3);
    let (_, b) = run(config(), 1);
    assert_eq!(a.steps(), 3);
    assert_eq!(b.steps(), 1);
}

#[test]
fn explicit_accountants_are_used() {
    let gdp = PrivacyEngine::new(config().with_accountant(AccountantKind::Gdp), sgd())
        .expect("engine");
    assert_eq!(gdp.accountant().mechanism(), "gdp");

    let custom = PrivacyEngine::with_accountant(config(), sgd(), Arc::new(GdpAccountant::new()))
        .expect("engine");
    assert_eq!(custom.accountant().mechanism(), "gdp");

    let (_, rdp) = run(config(), 4);
    let expected = RdpAccountant::new()
        .compute_epsilon(&rdp.ledger_state(), 1e-5)
        .expect("eps");
    assert_eq!(rdp.get_epsilon(1e-5).expect("eps"), expected);
}

#[test]
fn setup_fails_closed() {
    let bad = PrivacyConfig::new(0.0, 1.0, 1e-5, 1.0, 0.05);
    assert!(matches!(
        PrivacyEngine::new(bad, sgd()),
        Err(DpError::Configuration { .. })
    ));

    let underflowing = config().with_noise_multiplier(1e-170);
    assert!(matches!(
        PrivacyEngine::new(underflowing, sgd()),
        Err(DpError::Configuration { .. })
    ));

    let infeasible = PrivacyConfig::new(1.0, 1e-6, 1e-5, 10.0, 1.0);
    assert!(matches!(
        PrivacyEngine::new(infeasible, sgd()),
        Err(DpError::Calibration { .. })
    ));
}

#[test]
fn reset_starts_a_fresh_session() {
    let (_, mut engine) = run(config(), 3);
    engine.reset();
    assert_eq!(engine.steps(), 0);
    assert_eq!(engine.get_epsilon(1e-5).expect("eps"), 0.0);
}
