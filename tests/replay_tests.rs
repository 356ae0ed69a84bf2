//! Replay policy tests through the public network API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use approx::assert_abs_diff_eq;
use ndarray::array;
use paragon::replay::{EntropyGate, GateInput, TemporalGate};
use paragon::{
    Activation, Network, ReplayGate, ReplayMode, ReplayPhase, ReplayPolicy, ReplayUpdate,
    RepsMapping,
};

fn network(seed: u64) -> Network {
    Network::new(
        &[(3, 1), (4, 2), (5, 1), (2, 1)],
        &[Activation::Linear, Activation::Tanh, Activation::Relu, Activation::Softmax],
        &[true, false, true, true],
        seed,
    )
    .expect("Failed to create network")
}

/// Gate with a fixed score that counts how often it is consulted.
#[derive(Default)]
struct CountingGate {
    calls: AtomicUsize,
    score: f64,
}

impl ReplayGate for CountingGate {
    fn name(&self) -> &str {
        "counting"
    }

    fn score(&self, _input: &GateInput<'_>) -> f64 {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.score
    }
}

#[test]
fn test_static_forward_only_replay_keeps_outputs() {
    let inputs = [
        array![[0.5, -1.0, 0.25]],
        array![[2.0, 0.0, -0.5]],
        array![[-1.5, 1.5, 0.75]],
    ];
    for phase in [ReplayPhase::Before, ReplayPhase::After] {
        let mut plain = network(21);
        let mut replayed = network(21);
        for l in 1..=3 {
            replayed.layers[l].replay = ReplayPolicy::fixed(3, phase, -1).expect("policy");
        }
        for input in &inputs {
            plain.forward(input).expect("forward");
            replayed.forward(input).expect("forward");
            for (a, b) in plain.extract_output().iter().zip(replayed.extract_output().iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-9);
            }
        }
    }
}

#[test]
fn test_gate_consulted_once_per_forward() {
    let gate = Arc::new(CountingGate {
        score: 0.9,
        ..CountingGate::default()
    });
    let mut net = network(4);
    net.layers[2].replay = ReplayPolicy::gated(
        gate.clone(),
        2,
        RepsMapping::Threshold { threshold: 0.5 },
        ReplayPhase::After,
        -1,
    )
    .expect("policy");

    let input = array![[0.1, 0.2, 0.3]];
    net.forward(&input).expect("forward");
    net.forward(&input).expect("forward");
    assert_eq!(gate.calls.load(Ordering::SeqCst), 2);

    net.predict(&input).expect("predict");
    assert_eq!(gate.calls.load(Ordering::SeqCst), 2, "evaluation skips replay by default");

    net.replay_in_eval = true;
    net.predict(&input).expect("predict");
    assert_eq!(gate.calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_gated_history_is_bounded() {
    let mut net = network(8);
    net.layers[1].replay = ReplayPolicy::gated(
        Arc::new(TemporalGate::default()),
        1,
        RepsMapping::default(),
        ReplayPhase::After,
        -1,
    )
    .expect("policy")
    .with_history_len(4);

    for i in 0..20 {
        net.forward(&array![[i as f64 * 0.1, 0.0, -0.2]]).expect("forward");
    }
    assert_eq!(net.layers[1].history.len(), 4);
    assert!(net.layers[2].history.is_empty());
}

#[test]
fn test_backward_inclusive_scales_hidden_update() {
    let build = |update: ReplayUpdate| {
        let mut net = Network::new(
            &[(2, 1), (4, 1), (1, 1)],
            &[Activation::Linear, Activation::Tanh, Activation::Linear],
            &[true, true, true],
            13,
        )
        .expect("create");
        net.layers[1].replay = ReplayPolicy::fixed(2, ReplayPhase::After, -1)
            .expect("policy")
            .with_update(update);
        net
    };
    let mut forward_only = build(ReplayUpdate::ForwardOnly);
    let mut inclusive = build(ReplayUpdate::BackwardInclusive);
    let before: Vec<f64> = forward_only.layers[1].neurons.iter().map(|n| n.bias).collect();

    let input = array![[0.4, -0.8]];
    let target = array![[1.0]];
    for net in [&mut forward_only, &mut inclusive] {
        net.forward(&input).expect("forward");
        net.backward(&target, 0.1).expect("backward");
    }

    let mut moved = false;
    for (i, b0) in before.iter().enumerate() {
        let plain = forward_only.layers[1].neurons[i].bias - b0;
        let summed = inclusive.layers[1].neurons[i].bias - b0;
        // one normal pass plus two replays
        assert_abs_diff_eq!(summed, 3.0 * plain, epsilon = 1e-12);
        moved |= plain.abs() > 1e-9;
    }
    assert!(moved);
    assert_abs_diff_eq!(
        forward_only.layers[2].neurons[0].bias,
        inclusive.layers[2].neurons[0].bias,
        epsilon = 1e-15
    );
}

#[test]
fn test_builtin_gate_survives_persistence() {
    let mut net = network(2);
    net.layers[1].replay = ReplayPolicy::gated(
        Arc::new(EntropyGate),
        3,
        RepsMapping::Proportional { threshold: 0.2 },
        ReplayPhase::Before,
        -1,
    )
    .expect("policy");
    net.layers[2].replay = ReplayPolicy::gated(
        Arc::new(CountingGate::default()),
        1,
        RepsMapping::default(),
        ReplayPhase::After,
        -1,
    )
    .expect("policy");

    let mut loaded = Network::from_json_str(&net.to_json_string().expect("json")).expect("load");
    assert_eq!(loaded.layers[1].replay.gate_name(), Some("entropy"));
    assert_eq!(loaded.layers[1].replay.mode, ReplayMode::Gated);
    assert_eq!(loaded.layers[1].replay.budget, 3);

    // custom gates are not stored and must be re-attached
    assert!(loaded.layers[2].replay.gate().is_none());
    loaded.layers[2].replay.set_gate(Arc::new(CountingGate::default()));

    let input = array![[1.0, 0.5, -0.5]];
    let a = net.predict(&input).expect("predict");
    let b = loaded.predict(&input).expect("predict");
    assert_eq!(a, b);
}
