//! Dataset helpers: splitting, label encoding, and grid shaping.

use ndarray::Array2;

use crate::core::{ParagonError, ParagonResult};

/// Four-way split returned by [`split_dataset`]:
/// `(train_inputs, train_targets, test_inputs, test_targets)`.
pub type Split<T> = (Vec<T>, Vec<T>, Vec<T>, Vec<T>);

/// Split paired samples in order: the first `⌊fraction · n⌋` go to training.
///
/// # Errors
/// `InvalidArgument` if the lengths differ or `fraction` is outside `[0, 1]`.
pub fn split_dataset<T: Clone>(inputs: &[T], targets: &[T], fraction: f64) -> ParagonResult<Split<T>> {
    if inputs.len() != targets.len() {
        return Err(ParagonError::InvalidArgument(format!(
            "{} inputs but {} targets",
            inputs.len(),
            targets.len()
        )));
    }
    if !(0.0..=1.0).contains(&fraction) {
        return Err(ParagonError::InvalidArgument(format!(
            "split fraction must be in [0, 1], got {fraction}"
        )));
    }
    let cut = (inputs.len() as f64 * fraction).floor() as usize;
    Ok((
        inputs[..cut].to_vec(),
        targets[..cut].to_vec(),
        inputs[cut..].to_vec(),
        targets[cut..].to_vec(),
    ))
}

/// Single-row target grid with a 1 at `label`.
pub fn one_hot(label: usize, classes: usize) -> ParagonResult<Array2<f64>> {
    if label >= classes {
        return Err(ParagonError::InvalidArgument(format!(
            "label {label} out of range for {classes} classes"
        )));
    }
    let mut grid = Array2::zeros((1, classes));
    grid[[0, label]] = 1.0;
    Ok(grid)
}

/// Shape a flat row-major vector into a `height × width` grid.
pub fn to_grid(values: &[f64], width: usize, height: usize) -> ParagonResult<Array2<f64>> {
    Array2::from_shape_vec((height, width), values.to_vec()).map_err(|e| {
        ParagonError::InvalidArgument(format!(
            "{} values do not fill a {width}x{height} grid: {e}",
            values.len()
        ))
    })
}

/// Normalize data to a target range.
pub fn normalize(data: &mut [f64], min: f64, max: f64) {
    let data_min = data.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let data_max = data.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let range = data_max - data_min;

    if range == 0.0 || !range.is_finite() {
        return;
    }

    for v in data {
        *v = min + ((*v - data_min) / range) * (max - min);
    }
}
