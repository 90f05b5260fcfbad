mod common;

use std::io;
use std::sync::{Arc, Mutex};

use common::{config, Example, Linear};
use dp_engine::core::{GradientClipper, NoiseInjector};
use dp_engine::{
    NoiseKey, Optimizer, PerExampleGradients, PrivacyEngine, PrivateUpdate, Result, Scalar,
    Tensor,
};

const MARKER: Scalar = 7777.25;

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("capture lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Capture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("capture lock")).into_owned()
    }
}

#[derive(Default)]
struct Recording {
    seen: Vec<PrivateUpdate>,
}

impl Optimizer for Recording {
    fn apply(&mut self, _params: &mut Tensor, update: &PrivateUpdate) -> Result<()> {
        self.seen.push(update.clone());
        Ok(())
    }
}

fn marked_batch() -> Vec<Example> {
    // Zero weights give gradient -2·y·x per example.
    vec![(vec![1.0, 1.0, 1.0], -MARKER / 2.0); 3]
}

#[test]
fn logs_never_contain_gradient_values() {
    let capture = Capture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let mut engine = PrivacyEngine::new(config(), Recording::default()).expect("engine");
    let mut model = Linear::new(3);
    for _ in 0..3 {
        engine.step(&mut model, &marked_batch()[..]).expect("step");
    }

    let logs = capture.text();
    assert!(logs.contains("private step"), "no step events captured: {logs}");
    assert!(!logs.contains("7777"));
    // ‖(7777.25, 7777.25, 7777.25)‖ ≈ 13470.7
    assert!(!logs.contains("13470"));
}

#[test]
fn debug_output_shows_shapes_only() {
    let rows = vec![vec![MARKER, -MARKER], vec![0.5, MARKER]];
    let grads = PerExampleGradients::from_rows(rows, 2).expect("grads");
    let shown = format!("{grads:?}");
    assert!(shown.contains("batch_size"));
    assert!(!shown.contains("7777"));

    let clipped = GradientClipper::new(1e6).expect("clipper").clip(grads).expect("clip");
    assert!(!format!("{clipped:?}").contains("7777"));
    let sum = clipped.into_sum();
    assert!(!format!("{sum:?}").contains("7777"));
}

#[test]
fn optimizer_only_sees_noised_updates() {
    let mut engine = PrivacyEngine::new(config(), Recording::default()).expect("engine");
    let mut model = Linear::new(3);
    for _ in 0..5 {
        engine.step(&mut model, &marked_batch()[..]).expect("step");
    }

    let seen = &engine.optimizer().seen;
    assert_eq!(seen.len(), 5);
    // The clipped mean is (1/√3)·(1, 1, 1); raw gradients are ~7777 per
    // coordinate. Noise keeps every update away from both.
    let clipped_mean = 1.0 / 3.0_f64.sqrt();
    for update in seen {
        assert_eq!(update.len(), 3);
        assert!(update.view().iter().all(|v| f64::from(v.abs()) < f64::from(MARKER) / 10.0));
        assert!(update
            .view()
            .iter()
            .any(|v| (f64::from(*v) - clipped_mean).abs() > 1e-6));
    }
}

#[test]
fn injector_output_is_the_only_gradient_carrier() {
    let grads = PerExampleGradients::from_rows(vec![vec![MARKER, 0.0]], 2).expect("grads");
    let clipped = GradientClipper::new(1.0).expect("clipper").clip(grads).expect("clip");
    assert_eq!(clipped.batch_size(), 1);
    assert_eq!(clipped.max_grad_norm(), 1.0);

    let update = NoiseInjector::new(1.0, 1.0)
        .expect("injector")
        .inject(clipped, &mut NoiseKey::new(0).stream(0))
        .expect("update");
    assert!(update.view().iter().all(|v| f64::from(v.abs()) < 100.0));
}
