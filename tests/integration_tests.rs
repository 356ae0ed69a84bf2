//! Integration tests for paragon networks on small end-to-end problems.
//!
//! These tests verify:
//! - XOR is learnable and training is reproducible for a fixed seed
//! - An update that would overflow a weight is reported and skipped
//! - Partition tags train disjoint slices of the hidden layer
//! - ADHD scoring on literal sequences
//! - Sub-networks train and survive a JSON round-trip
//! - Growth keeps outputs when the new parameters are zero

use approx::assert_abs_diff_eq;
use ndarray::{array, Array2};
use paragon::adhd::Performance;
use paragon::data::one_hot;
use paragon::utils::{argmax, inverse_softmax, softmax};
use paragon::training::{predicted_labels, target_labels};
use paragon::{
    compute_accuracy, train, Activation, DimensionOptions, Dimension, Network, ParagonError,
    Partition, TrainConfig,
};
use proptest::prelude::*;
use std::sync::Arc;

/// XOR with a single sigmoid target per sample.
fn xor_dataset() -> (Vec<Array2<f64>>, Vec<Array2<f64>>) {
    let inputs = vec![
        array![[0.0, 0.0]],
        array![[0.0, 1.0]],
        array![[1.0, 0.0]],
        array![[1.0, 1.0]],
    ];
    let targets = vec![array![[0.0]], array![[1.0]], array![[1.0]], array![[0.0]]];
    (inputs, targets)
}

fn xor_network(hidden: usize, activation: Activation, seed: u64) -> Network {
    Network::new(
        &[(2, 1), (hidden, 1), (1, 1)],
        &[Activation::Linear, activation, Activation::Sigmoid],
        &[true, true, true],
        seed,
    )
    .expect("Failed to create network")
}

fn mean_loss(net: &mut Network, inputs: &[Array2<f64>], targets: &[Array2<f64>]) -> f64 {
    let mut total = 0.0;
    for (input, target) in inputs.iter().zip(targets) {
        net.forward(input).expect("forward");
        total += net.compute_loss(target).expect("loss");
    }
    total / inputs.len() as f64
}

fn outputs(net: &mut Network, inputs: &[Array2<f64>]) -> Vec<Vec<f64>> {
    inputs
        .iter()
        .map(|i| net.predict(i).expect("predict").to_vec())
        .collect()
}

// ============================================================================
// XOR
// ============================================================================

#[test]
fn test_xor_learned_by_tanh_network() {
    let (inputs, targets) = xor_dataset();
    let config = TrainConfig {
        epochs: 2000,
        learning_rate: 0.5,
        ..TrainConfig::default()
    };

    let mut solved = 0;
    for seed in [1, 2, 3] {
        let mut net = xor_network(8, Activation::Tanh, seed);
        let before = mean_loss(&mut net, &inputs, &targets);
        let report = train(&mut net, &inputs, &targets, &config).expect("train");
        let after = mean_loss(&mut net, &inputs, &targets);

        assert_eq!(report.epochs_completed, 2000);
        assert!(after < before, "seed {seed}: loss {before} -> {after}");
        if compute_accuracy(&mut net, &inputs, &targets).expect("accuracy") == 1.0 {
            solved += 1;
        }
    }
    assert!(solved >= 2, "only {solved} of 3 seeds solved XOR");
}

#[test]
fn test_xor_baseline_is_reproducible() {
    let (inputs, targets) = xor_dataset();
    let run = || {
        let mut net = xor_network(2, Activation::Relu, 42);
        let before = mean_loss(&mut net, &inputs, &targets);
        net.train(&inputs, &targets, 100, 0.1, true, None).expect("train");
        let after = mean_loss(&mut net, &inputs, &targets);
        (before, after, net.to_json_string().expect("json"))
    };

    let (before, after, first) = run();
    let (_, _, second) = run();
    assert_eq!(first, second, "same seed must give the same parameters");
    assert!(after <= before + 1e-9, "loss rose from {before} to {after}");
}

#[test]
fn test_overflowing_weight_update_is_skipped() {
    let mut net = Network::new(
        &[(1, 1), (1, 1)],
        &[Activation::Linear, Activation::Linear],
        &[true, true],
        1,
    )
    .expect("create");
    net.layers[1].neurons[0].connections[0].weight = 0.0;
    net.layers[1].neurons[0].bias = 0.0;

    // loss and gradient stay finite; only the weight step overflows
    let inputs = vec![array![[1e200]]];
    let targets = vec![array![[1e154]]];
    let report = net.train(&inputs, &targets, 1, 1.0, false, None).expect("train");

    assert_eq!(report.numeric_skips, 1);
    assert_eq!(net.performance.numeric_failures, 1);
    assert_eq!(net.layers[1].neurons[0].connections[0].weight, 0.0);
    assert_eq!(net.layers[1].neurons[0].bias, 0.0);
}

// ============================================================================
// Partitions
// ============================================================================

#[test]
fn test_partitioned_training_touches_only_its_tag() {
    let (inputs, targets) = xor_dataset();
    let mut net = xor_network(6, Activation::Tanh, 42);
    let snapshot = net.clone();
    let tag0 = Partition::new(2, 0).expect("partition");

    for _ in 0..50 {
        for (input, target) in inputs.iter().zip(&targets) {
            net.forward_tagged(input, 2, 0).expect("forward");
            net.backward_tagged(target, 0.1, 2, 0, None).expect("backward");
        }
    }

    for (i, (trained, original)) in net.layers[1]
        .neurons
        .iter()
        .zip(&snapshot.layers[1].neurons)
        .enumerate()
    {
        let unchanged = trained.bias == original.bias
            && trained
                .connections
                .iter()
                .zip(&original.connections)
                .all(|(a, b)| a.weight == b.weight);
        assert_eq!(unchanged, !tag0.owns(i), "hidden neuron {i}");
    }
    // the output layer always trains
    assert_ne!(net.layers[2].neurons[0].bias, snapshot.layers[2].neurons[0].bias);
}

/// Accuracy of a tag-restricted forward, single sigmoid output at 0.5.
fn tagged_accuracy(net: &mut Network, inputs: &[Array2<f64>], targets: &[Array2<f64>], tag: usize) -> f64 {
    let correct = inputs
        .iter()
        .zip(targets)
        .filter(|(input, target)| {
            net.forward_tagged(input, 2, tag).expect("forward");
            (net.extract_output()[0] >= 0.5) == (target[[0, 0]] >= 0.5)
        })
        .count();
    correct as f64 / inputs.len() as f64
}

fn train_tag(net: &mut Network, inputs: &[Array2<f64>], targets: &[Array2<f64>], tag: usize, epochs: usize, lr: f64) {
    for _ in 0..epochs {
        for (input, target) in inputs.iter().zip(targets) {
            net.forward_tagged(input, 2, tag).expect("forward");
            net.backward_tagged(target, lr, 2, tag, None).expect("backward");
        }
    }
}

#[test]
fn test_partitioned_xor_sequence() {
    let (inputs, targets) = xor_dataset();

    // 8 tanh hidden neurons, 1000 epochs per tag at lr 0.5
    let solved = (1..=20u64).find(|&seed| {
        let mut net = xor_network(8, Activation::Tanh, seed);
        train_tag(&mut net, &inputs, &targets, 0, 1000, 0.5);
        train_tag(&mut net, &inputs, &targets, 1, 1000, 0.5);
        let tag1 = tagged_accuracy(&mut net, &inputs, &targets, 1);
        let mut silenced = net.clone();
        silenced.silence_partition(Partition::new(2, 1).expect("partition"));
        let tag0 = tagged_accuracy(&mut silenced, &inputs, &targets, 0);
        tag1 == 1.0 && tag0 >= 0.75
    });
    assert!(solved.is_some(), "no seed in 1..=20 met tag 1 = 4/4 and tag 0 >= 3/4");

    let mut net = xor_network(8, Activation::Tanh, 42);
    train_tag(&mut net, &inputs, &targets, 0, 50, 0.1);
    train_tag(&mut net, &inputs, &targets, 1, 50, 0.1);

    // tagged forward leaves the other partition silent
    net.forward_tagged(&inputs[1], 2, 1).expect("forward");
    for (i, neuron) in net.layers[1].neurons.iter().enumerate() {
        if i % 2 == 0 {
            assert_eq!(neuron.value, 0.0);
        }
    }

    // silencing tag 1 matches a tag-0 forward on the unsilenced network
    let mut silenced = net.clone();
    silenced.silence_partition(Partition::new(2, 1).expect("partition"));
    for input in &inputs {
        net.forward_tagged(input, 2, 0).expect("forward");
        silenced.forward_tagged(input, 2, 0).expect("forward");
        assert_abs_diff_eq!(
            net.extract_output()[0],
            silenced.extract_output()[0],
            epsilon = 1e-12
        );
    }
}

#[test]
fn test_invalid_tag_rejected() {
    let mut net = xor_network(4, Activation::Tanh, 1);
    assert!(matches!(
        net.forward_tagged(&array![[0.0, 1.0]], 2, 2),
        Err(ParagonError::InvalidArgument(_))
    ));
    assert!(Partition::new(0, 0).is_err());
}

// ============================================================================
// ADHD
// ============================================================================

#[test]
fn test_adhd_perfect_and_single_failure() {
    let perfect = Performance::evaluate(&[0.0, 1.0, 2.0, 3.0], &[0.0, 1.0, 2.0, 3.0]).expect("evaluate");
    assert_abs_diff_eq!(perfect.score, 100.0);
    assert_eq!(perfect.bucket("0-10%").expect("bucket").count, 4);

    let one_off = Performance::evaluate(&[0.0, 1.0, 2.0, 3.0], &[1.0, 1.0, 2.0, 3.0]).expect("evaluate");
    assert_abs_diff_eq!(one_off.score, 75.0);
    let failures = one_off.bucket("100%+").expect("bucket");
    assert_eq!(failures.count, 1);
    assert_eq!(failures.samples, vec![0]);
}

#[test]
fn test_adhd_on_trained_network() {
    let (inputs, targets) = xor_dataset();
    let mut net = xor_network(8, Activation::Tanh, 2);
    net.train(&inputs, &targets, 200, 0.5, true, None).expect("train");

    let labels = target_labels(&targets);
    let predicted = predicted_labels(&mut net, &inputs).expect("predict");
    let score = net.evaluate_model(&labels, &predicted).expect("evaluate");
    assert!((0.0..=100.0).contains(&score));
    assert_eq!(net.performance.total, 4);
    assert_abs_diff_eq!(net.compute_final_score(), score, epsilon = 1e-12);
}

#[test]
fn test_adhd_nan_counts_as_failure() {
    let perf = Performance::evaluate(&[1.0, 2.0], &[f64::NAN, 2.0]).expect("evaluate");
    assert_eq!(perf.bucket("100%+").expect("bucket").count, 1);
    assert_abs_diff_eq!(perf.score, 50.0);
}

// ============================================================================
// Sub-networks and persistence
// ============================================================================

fn xor_with_shared_dimension(hidden: usize, hidden_act: Activation, sub_acts: [Activation; 3], seed: u64) -> Network {
    let mut net = xor_network(hidden, hidden_act, seed);
    net.set_layer_dimension(
        1,
        &[(1, 1), (2, 1), (1, 1)],
        &sub_acts,
        &[true, true, true],
        DimensionOptions {
            shared: true,
            ..DimensionOptions::default()
        },
    )
    .expect("attach");
    net
}

/// The literal relu host and relu-tanh-relu sub-network configuration.
fn relu_shared_dimension(seed: u64) -> Network {
    xor_with_shared_dimension(
        2,
        Activation::Relu,
        [Activation::Relu, Activation::Tanh, Activation::Relu],
        seed,
    )
}

#[test]
fn test_shared_dimension_reaches_accuracy() {
    let (inputs, targets) = xor_dataset();
    // 4 tanh hosts around a linear-tanh-linear shared sub-network, 1000 epochs at lr 0.2
    let solved = (1..=10u64).find(|&seed| {
        let mut net = xor_with_shared_dimension(
            4,
            Activation::Tanh,
            [Activation::Linear, Activation::Tanh, Activation::Linear],
            seed,
        );
        net.train(&inputs, &targets, 1000, 0.2, true, None).expect("train");
        compute_accuracy(&mut net, &inputs, &targets).expect("accuracy") >= 0.75
    });
    assert!(solved.is_some(), "no seed in 1..=10 reached 3/4 on XOR");
}

#[test]
fn test_shared_dimension_trains_and_round_trips() {
    let (inputs, targets) = xor_dataset();
    let mut net = relu_shared_dimension(42);
    let report = net.train(&inputs, &targets, 50, 0.05, false, None).expect("train");
    assert_eq!(report.epochs_completed, 50);

    let shared = net.layers[1].shared_dimension().expect("shared");
    assert_eq!(net.dimension_height(), 1);
    assert_eq!(shared.lock().depth(), 1);
    assert!(
        net.layers[1].neurons.iter().all(|n| n.value.is_finite()),
        "hidden values must stay finite"
    );

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("xor.json");
    net.save_json(&path).expect("save");
    let mut loaded = Network::load_json(&path).expect("load");

    assert_eq!(outputs(&mut net, &inputs), outputs(&mut loaded, &inputs));
    let handle = loaded.layers[1].shared_dimension().expect("shared after load");
    for neuron in &loaded.layers[1].neurons {
        match &neuron.dimension {
            Some(Dimension::Shared(s)) => assert!(Arc::ptr_eq(s, handle)),
            other => panic!("expected a shared sub-network, got {other:?}"),
        }
    }
}

#[test]
fn test_owned_dimensions_change_outputs() {
    let (inputs, _) = xor_dataset();
    let mut plain = xor_network(3, Activation::Tanh, 9);
    let mut nested = plain.clone();
    nested
        .set_layer_dimension(
            1,
            &[(1, 1), (3, 1), (1, 1)],
            &[Activation::Linear, Activation::Tanh, Activation::Linear],
            &[true, true, true],
            DimensionOptions::default(),
        )
        .expect("attach");
    assert!(nested.has_dimensions());
    assert_ne!(outputs(&mut plain, &inputs), outputs(&mut nested, &inputs));

    nested.detach_layer_dimension(1).expect("detach");
    assert!(!nested.has_dimensions());
    assert_eq!(outputs(&mut plain, &inputs), outputs(&mut nested, &inputs));
}

#[test]
fn test_dimension_needs_scalar_input() {
    let mut net = xor_network(2, Activation::Relu, 1);
    let sub = Network::new(
        &[(2, 1), (1, 1)],
        &[Activation::Linear, Activation::Linear],
        &[true, true],
        1,
    )
    .expect("create");
    assert!(matches!(
        net.attach_dimension(1, 0, 0, sub),
        Err(ParagonError::Attachment(_))
    ));
}

#[test]
fn test_deep_clone_is_independent() {
    let (inputs, targets) = xor_dataset();
    let original = relu_shared_dimension(5);
    let mut copy = original.clone();
    copy.train(&inputs, &targets, 5, 0.1, false, None).expect("train");

    let a = original.layers[1].shared_dimension().expect("shared");
    let b = copy.layers[1].shared_dimension().expect("shared");
    assert!(!Arc::ptr_eq(a, b));
    assert_eq!(
        original.to_json_string().expect("json"),
        relu_shared_dimension(5).to_json_string().expect("json")
    );
}

// ============================================================================
// Growth
// ============================================================================

#[test]
fn test_growth_with_zeroed_parameters_preserves_output() {
    let mut net = Network::new(
        &[(2, 1), (3, 1), (2, 1)],
        &[Activation::Linear, Activation::Tanh, Activation::Sigmoid],
        &[true, true, true],
        17,
    )
    .expect("create");
    let input = array![[0.25, -0.75]];
    let captured = net.predict(&input).expect("predict");

    net.add_neurons_to_layer(1, 4).expect("grow");
    assert_eq!(net.layers[1].width, 7);
    for neuron in &mut net.layers[1].neurons[3..] {
        neuron.bias = 0.0;
        for c in &mut neuron.connections {
            c.weight = 0.0;
        }
    }
    for neuron in &mut net.layers[2].neurons {
        for c in &mut neuron.connections {
            if c.source.layer == 1 && c.source.x >= 3 {
                c.weight = 0.0;
            }
        }
    }

    let grown = net.predict(&input).expect("predict");
    for (a, b) in captured.iter().zip(grown.iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

// ============================================================================
// Invariants
// ============================================================================

proptest! {
    #[test]
    fn prop_softmax_output_is_distribution(x in -5.0f64..5.0, y in -5.0f64..5.0, seed in 0u64..1000) {
        let mut net = Network::new(
            &[(2, 1), (4, 1), (3, 1)],
            &[Activation::Linear, Activation::Relu, Activation::Softmax],
            &[true, false, true],
            seed,
        ).unwrap();
        let out = net.predict(&array![[x, y]]).unwrap();
        prop_assert_eq!(out.len(), 3);
        prop_assert!((out.sum() - 1.0).abs() < 1e-9);
        prop_assert!(out.iter().all(|p| *p >= 0.0));
    }

    #[test]
    fn prop_adhd_score_bounded(pairs in prop::collection::vec((-100.0f64..100.0, -100.0f64..100.0), 1..50)) {
        let (expected, actual): (Vec<f64>, Vec<f64>) = pairs.into_iter().unzip();
        let perf = Performance::evaluate(&expected, &actual).unwrap();
        prop_assert!((0.0..=100.0).contains(&perf.score));
        let counted: usize = perf.buckets.iter().map(|b| b.count).sum();
        prop_assert_eq!(counted, expected.len());
    }

    #[test]
    fn prop_every_neuron_has_one_tag(index in 0usize..1000, num_tags in 1usize..8) {
        let owners = (0..num_tags)
            .filter(|&tag| Partition::new(num_tags, tag).unwrap().owns(index))
            .count();
        prop_assert_eq!(owners, 1);
    }

    #[test]
    fn prop_argmax_of_one_hot(classes in 1usize..20, pick in 0usize..20) {
        let label = pick % classes;
        let encoded = one_hot(label, classes).unwrap();
        prop_assert_eq!(argmax(encoded.as_slice().unwrap()), label);
    }

    #[test]
    fn prop_softmax_inverts_logits(raw in prop::collection::vec(0.01f64..1.0, 2..10)) {
        let total: f64 = raw.iter().sum();
        let probs: Vec<f64> = raw.iter().map(|r| r / total).collect();
        for (a, b) in softmax(&inverse_softmax(&probs)).iter().zip(&probs) {
            prop_assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn prop_json_round_trip_preserves_outputs(seed in 0u64..500, x in -2.0f64..2.0) {
        let mut net = xor_network(3, Activation::Elu, seed);
        let mut loaded = Network::from_json_str(&net.to_json_string().unwrap()).unwrap();
        let input = array![[x, -x]];
        prop_assert_eq!(net.predict(&input).unwrap(), loaded.predict(&input).unwrap());
    }
}
