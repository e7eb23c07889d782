//! Few-shot sine-wave regression with MAML using the library provided by `metagrad`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! RUST_LOG=info cargo run --release
//! ```
//!
//! Meta-trains a small MLP on random sine tasks, then adapts it to a held-out task and plots
//! the fit before and after adaptation. Supports first-order MAML and Meta-SGD.

use std::error::Error;

use clap::Parser;
use metagrad::{
    datasets::{Mode, TaskSampler, plot_adaptation},
    loss::MSELoss,
    maml::{Maml, MamlConfig},
    nn::{Linear, ReLU, Sequential},
    optim::{Optim, SGD},
    values::Value,
};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

#[derive(Parser)]
struct Args {
    /// Learning rate of the inner adaptation steps
    #[clap(long, default_value_t = 0.01)]
    inner_lr: f32,
    /// Learning rate of the outer optimizer
    #[clap(long, default_value_t = 0.001)]
    meta_lr: f32,
    #[clap(short, long, default_value_t = 0.9)]
    momentum: f32,
    /// Support (and query) points per task
    #[clap(short, long, default_value_t = 10)]
    shots: usize,
    #[clap(short, long, default_value_t = 1)]
    adaptation_steps: usize,
    /// Tasks per meta-update
    #[clap(short = 'b', long, default_value_t = 4)]
    meta_batch_size: usize,
    #[clap(short, long, default_value_t = 1000)]
    iterations: usize,
    #[clap(short, long, default_value_t = 100)]
    print_iterations: usize,
    #[clap(long, default_value_t = 40)]
    hidden_units: usize,
    #[clap(long, default_value_t = false)]
    first_order: bool,
    /// Learn a learning rate per parameter element (Meta-SGD)
    #[clap(long, default_value_t = false)]
    meta_sgd: bool,
    /// Split used for the final evaluation
    #[clap(long, default_value_t = Mode::Test)]
    mode: Mode,
    #[clap(long, default_value_t = 42)]
    seed: u64,
    #[clap(short, long, default_value_t = format!("output"))]
    output_dir: String,
}

fn model(hidden_units: usize, seed: u64) -> Sequential {
    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    Sequential::new(vec![
        Box::new(Linear::with_rng(1, hidden_units, &mut rng)),
        Box::new(ReLU::new()),
        Box::new(Linear::with_rng(hidden_units, hidden_units, &mut rng)),
        Box::new(ReLU::new()),
        Box::new(Linear::with_rng(hidden_units, 1, &mut rng)),
    ])
}

/// Adapts a fresh clone of `maml` to a new task, returns its loss on the task's query set
fn fast_adapt(
    maml: &Maml,
    sampler: &mut TaskSampler,
    shots: usize,
    adaptation_steps: usize,
) -> Result<Value, Box<dyn Error>> {
    let task = sampler.task();
    let (support_x, support_y) = sampler.points(&task, shots)?;
    let (query_x, query_y) = sampler.points(&task, shots)?;

    let mut learner = maml.clone()?;
    for _ in 0..adaptation_steps {
        let support_loss = MSELoss::tensors(&learner.forward(&support_x)?, &support_y)?;
        learner.adapt(&support_loss)?;
    }
    let query_loss = MSELoss::tensors(&learner.forward(&query_x)?, &query_y)?;
    Ok(query_loss)
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    std::fs::create_dir_all(&args.output_dir)?;

    let module = Box::new(model(args.hidden_units, args.seed));
    let config = MamlConfig::new().first_order(args.first_order);
    let maml = if args.meta_sgd {
        Maml::meta_sgd(module, args.inner_lr, config)?
    } else {
        Maml::with_config(module, args.inner_lr, config)
    };
    let mut optim = SGD::new(maml.meta_parameters(), args.meta_lr, args.momentum);

    let mut train_tasks = TaskSampler::new(Mode::Train, args.seed);
    let print_every = args.print_iterations.max(1);

    for iteration in 0..args.iterations {
        let mut query_losses = Vec::with_capacity(args.meta_batch_size);
        for _ in 0..args.meta_batch_size {
            let query_loss = fast_adapt(
                &maml,
                &mut train_tasks,
                args.shots,
                args.adaptation_steps,
            )?;
            query_losses.push(query_loss);
        }
        let meta_loss =
            query_losses.into_iter().sum::<Value>() / Value::new(args.meta_batch_size as f32);
        // deposits the meta-gradient into the original parameters (and learning rates)
        meta_loss.backward();
        optim.step();
        optim.zero_grad();

        if iteration % print_every == 0 || iteration == args.iterations - 1 {
            log::info!(
                "iteration: {}, meta_loss: {}",
                iteration + 1,
                meta_loss.data()
            );
        }
    }

    let mut eval_tasks = TaskSampler::new(args.mode, args.seed);
    let task = eval_tasks.task();
    let (support_x, support_y) = eval_tasks.points(&task, args.shots)?;
    let mut learner = maml.clone()?;
    for step in 0..args.adaptation_steps {
        let loss = MSELoss::tensors(&learner.forward(&support_x)?, &support_y)?;
        log::info!("{} task, step {}: support loss {}", args.mode, step, loss.data());
        learner.adapt(&loss)?;
    }

    plot_adaptation(
        &task,
        (&support_x, &support_y),
        maml.module(),
        learner.module(),
        &format!("{}/adaptation_{}.png", args.output_dir, args.mode),
    )?;
    Ok(())
}
