//! Sine-wave regression tasks for few-shot learning and a plot of an adaptation
//!
//! Every task is `y = amplitude * sin(x - phase)` with amplitude in [0.1, 5.0], phase in
//! [0, pi] and inputs drawn uniformly from [-5, 5]. Each [`Mode`] split draws its tasks from
//! its own seeded stream, so the splits never share a sequence of tasks.

use std::{
    error::Error,
    f32::consts::PI,
    fmt::{self, Display},
    str::FromStr,
};

use clap::ValueEnum;
use plotters::{
    chart::ChartBuilder,
    prelude::{BitMapBackend, Circle, IntoDrawingArea, PathElement},
    series::LineSeries,
    style::{BLACK, BLUE, Color, RED, WHITE},
};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::{
    nn::Module,
    tensor::{Tensor, TensorError},
    values::no_grad,
};

pub const AMPLITUDE_RANGE: (f32, f32) = (0.1, 5.0);
pub const PHASE_RANGE: (f32, f32) = (0.0, PI);
pub const INPUT_RANGE: (f32, f32) = (-5.0, 5.0);

#[derive(Debug, Error, PartialEq)]
pub enum DatasetError {
    #[error("Needs to be train, test or validation, got '{0}'")]
    InvalidMode(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Dataset split
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Train,
    Validation,
    Test,
}

impl Mode {
    // keeps the per-split streams apart for the same user seed
    fn stream(&self) -> u64 {
        match self {
            Mode::Train => 0,
            Mode::Validation => 1,
            Mode::Test => 2,
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Train => write!(f, "train"),
            Mode::Validation => write!(f, "validation"),
            Mode::Test => write!(f, "test"),
        }
    }
}

impl FromStr for Mode {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Mode::Train),
            "validation" => Ok(Mode::Validation),
            "test" => Ok(Mode::Test),
            other => Err(DatasetError::InvalidMode(other.to_string())),
        }
    }
}

/// One regression task
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SineTask {
    pub amplitude: f32,
    pub phase: f32,
}

impl SineTask {
    pub fn new(amplitude: f32, phase: f32) -> Self {
        Self { amplitude, phase }
    }

    /// Draws a task with amplitude and phase uniform over their ranges
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            amplitude: rng.random_range(AMPLITUDE_RANGE.0..=AMPLITUDE_RANGE.1),
            phase: rng.random_range(PHASE_RANGE.0..=PHASE_RANGE.1),
        }
    }

    pub fn eval(&self, x: f32) -> f32 {
        self.amplitude * (x - self.phase).sin()
    }

    /// `k` points of the task as constant `[k, 1]` input and target tensors
    pub fn sample<R: Rng + ?Sized>(
        &self,
        k: usize,
        rng: &mut R,
    ) -> Result<(Tensor, Tensor), DatasetError> {
        let xs = (0..k)
            .map(|_| rng.random_range(INPUT_RANGE.0..INPUT_RANGE.1))
            .collect::<Vec<f32>>();
        let ys = xs.iter().map(|x| self.eval(*x)).collect();
        Ok((
            Tensor::from_vec(xs, &[k, 1])?,
            Tensor::from_vec(ys, &[k, 1])?,
        ))
    }
}

/// Samples tasks and their support/query points for one split
pub struct TaskSampler {
    mode: Mode,
    rng: Pcg64Mcg,
}

impl TaskSampler {
    pub fn new(mode: Mode, seed: u64) -> Self {
        Self {
            mode,
            rng: Pcg64Mcg::seed_from_u64(seed.wrapping_mul(3).wrapping_add(mode.stream())),
        }
    }

    /// Parses the split name first, failing on anything other than train, validation or test
    pub fn from_mode_str(mode: &str, seed: u64) -> Result<Self, DatasetError> {
        Ok(Self::new(mode.parse()?, seed))
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn task(&mut self) -> SineTask {
        SineTask::random(&mut self.rng)
    }

    pub fn tasks(&mut self, n: usize) -> Vec<SineTask> {
        (0..n).map(|_| self.task()).collect()
    }

    /// `k` points of `task` drawn from this sampler's stream
    pub fn points(&mut self, task: &SineTask, k: usize) -> Result<(Tensor, Tensor), DatasetError> {
        task.sample(k, &mut self.rng)
    }
}

/// Evaluates a 1-in 1-out model on `n` evenly spaced inputs across [`INPUT_RANGE`]
fn curve(model: &dyn Module, n: usize) -> Result<Vec<(f32, f32)>, Box<dyn Error>> {
    let step = (INPUT_RANGE.1 - INPUT_RANGE.0) / (n - 1).max(1) as f32;
    let xs = (0..n)
        .map(|i| INPUT_RANGE.0 + i as f32 * step)
        .collect::<Vec<_>>();
    let input = Tensor::from_vec(xs.clone(), &[n, 1])?;
    let output = no_grad(|| model.forward(&input))?;
    Ok(xs.into_iter().zip(output.data()).collect())
}

/// Plots the task's curve, its support points and the fit before and after adaptation
pub fn plot_adaptation(
    task: &SineTask,
    support: (&Tensor, &Tensor),
    before: &dyn Module,
    after: &dyn Module,
    file_name: &str,
) -> Result<(), Box<dyn Error>> {
    let n_points = 200;
    let before = curve(before, n_points)?;
    let after = curve(after, n_points)?;
    let truth = before
        .iter()
        .map(|(x, _)| (*x, task.eval(*x)))
        .collect::<Vec<_>>();

    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let y_max = AMPLITUDE_RANGE.1 + 1.0;
    let mut chart = ChartBuilder::on(&root_area)
        .caption(
            format!("A = {:.2}, phase = {:.2}", task.amplitude, task.phase),
            ("sans-serif", 30),
        )
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(30)
        .build_cartesian_2d(INPUT_RANGE.0..INPUT_RANGE.1, -y_max..y_max)?;

    chart.configure_mesh().draw()?;

    chart
        .draw_series(LineSeries::new(truth, BLACK.stroke_width(2)))?
        .label("task")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLACK));
    chart
        .draw_series(LineSeries::new(before, &RED))?
        .label("before adaptation")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &RED));
    chart
        .draw_series(LineSeries::new(after, &BLUE))?
        .label("after adaptation")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLUE));

    let (xs, ys) = support;
    chart.draw_series(
        xs.data()
            .into_iter()
            .zip(ys.data())
            .map(|(x, y)| Circle::new((x, y), 4, BLACK.filled())),
    )?;

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;

    root_area.present()?;
    log::info!("Adaptation plot has been saved to '{}'.", file_name);
    Ok(())
}
