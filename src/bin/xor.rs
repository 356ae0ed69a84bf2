//! XOR demo: train a small grid network, report accuracy and ADHD diagnostics.

use std::path::PathBuf;

use clap::Parser;
use ndarray::{array, Array2};
use tracing::info;

use paragon::data::one_hot;
use paragon::training::{predicted_labels, target_labels};
use paragon::{
    compute_accuracy, Activation, DimensionOptions, LrSchedule, Network, Partition, ReplayPhase,
    ReplayPolicy, TrainConfig, Trainer,
};

#[derive(Parser, Debug)]
#[command(name = "paragon-xor", about = "Train a paragon network on XOR")]
struct Args {
    /// Number of training epochs
    #[arg(long, default_value_t = 2000)]
    epochs: usize,

    /// Learning rate
    #[arg(long, default_value_t = 0.5)]
    learning_rate: f64,

    /// Learning-rate schedule
    #[arg(long, value_enum, default_value_t = LrSchedule::Constant)]
    schedule: LrSchedule,

    /// Hidden layer width
    #[arg(long, default_value_t = 8)]
    hidden: usize,

    /// Hidden activation
    #[arg(long, default_value = "tanh")]
    activation: String,

    /// Network seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Train hidden neurons in this many partitions, one after another (0 = off)
    #[arg(long, default_value_t = 0)]
    tags: usize,

    /// Static replay passes after the hidden layer (0 = off)
    #[arg(long, default_value_t = 0)]
    replay: usize,

    /// Give the hidden layer a shared 1-4-1 sub-network
    #[arg(long, default_value_t = false)]
    dimension: bool,

    /// Save the trained network as JSON
    #[arg(long)]
    save: Option<PathBuf>,

    /// Re-run the trained network as a dense batch on GPU (wgpu backend)
    #[arg(long, default_value_t = false)]
    gpu: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("paragon=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let hidden_act: Activation = args.activation.parse()?;

    let inputs: Vec<Array2<f64>> = vec![
        array![[0.0, 0.0]],
        array![[0.0, 1.0]],
        array![[1.0, 0.0]],
        array![[1.0, 1.0]],
    ];
    let targets = [0usize, 1, 1, 0]
        .iter()
        .map(|&label| one_hot(label, 2))
        .collect::<Result<Vec<_>, _>>()?;

    let mut net = Network::new(
        &[(2, 1), (args.hidden, 1), (2, 1)],
        &[Activation::Linear, hidden_act, Activation::Softmax],
        &[true, true, true],
        args.seed,
    )?;

    if args.dimension {
        net.set_layer_dimension(
            1,
            &[(1, 1), (4, 1), (1, 1)],
            &[Activation::Linear, Activation::Tanh, Activation::Linear],
            &[true, true, true],
            DimensionOptions {
                shared: true,
                ..DimensionOptions::default()
            },
        )?;
    }
    if args.replay > 0 {
        net.layers[1].replay = ReplayPolicy::fixed(args.replay, ReplayPhase::After, -1)?;
    }

    info!(
        hidden = args.hidden,
        activation = %hidden_act,
        seed = args.seed,
        parameters = net.parameter_count(),
        "training XOR"
    );

    let config = TrainConfig {
        epochs: args.epochs,
        learning_rate: args.learning_rate,
        schedule: args.schedule,
        early_stop_accuracy: Some(1.0),
        ..TrainConfig::default()
    };

    if args.tags > 0 {
        let per_tag = TrainConfig {
            epochs: (args.epochs / args.tags).max(1),
            early_stop_accuracy: None,
            ..config.clone()
        };
        for tag in 0..args.tags {
            let report = Trainer::new(per_tag.clone())
                .with_partition(Partition::new(args.tags, tag)?)
                .run(&mut net, &inputs, &targets)?;
            info!(tag, loss = ?report.final_loss(), "partition trained");
        }
    } else {
        let report = Trainer::new(config)
            .with_validation(&inputs, &targets)
            .run(&mut net, &inputs, &targets)?;
        info!(
            outcome = ?report.outcome,
            epochs = report.epochs_completed,
            loss = ?report.final_loss(),
            skipped = report.numeric_skips,
            "training finished"
        );
    }

    let accuracy = compute_accuracy(&mut net, &inputs, &targets)?;
    let expected = target_labels(&targets);
    let actual = predicted_labels(&mut net, &inputs)?;
    net.evaluate_full(&expected, &actual, 4)?;
    info!(accuracy = accuracy * 100.0, adhd = net.performance.score, "evaluation");
    net.print_full_diagnostics();

    for input in &inputs {
        let out = net.predict(input)?;
        info!(input = ?input.as_slice(), output = ?out.as_slice(), "prediction");
    }

    if args.gpu {
        run_gpu(&net, &inputs)?;
    }

    if let Some(path) = &args.save {
        net.save_json(path)?;
        info!(path = %path.display(), "saved network");
    }
    Ok(())
}

#[cfg(feature = "gpu")]
fn run_gpu(net: &Network, inputs: &[Array2<f64>]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use paragon::gpu::{init_device, DenseNetwork};

    let device = init_device();
    let dense: DenseNetwork<burn::backend::Wgpu> = DenseNetwork::from_network(net, &device)?;
    let batch = Array2::from_shape_fn((inputs.len(), 2), |(r, c)| inputs[r][[0, c]]);
    let out = dense.forward_batch(&batch)?;
    info!(outputs = ?out, "gpu batch");
    Ok(())
}

#[cfg(not(feature = "gpu"))]
fn run_gpu(_net: &Network, _inputs: &[Array2<f64>]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing::warn!("built without the `gpu` feature; skipping GPU batch");
    Ok(())
}
