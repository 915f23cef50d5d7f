//! Small statistics helpers shared by the analyzers and aggregations

use num_traits::Float;

/// Arithmetic mean, `None` for an empty slice
pub fn mean<T: Float>(data: &[T]) -> Option<T> {
    if data.is_empty() {
        return None;
    }
    let sum = data.iter().fold(T::zero(), |acc, &v| acc + v);
    T::from(data.len()).map(|n| sum / n)
}

/// Mean of the finite values only
pub fn finite_mean<T: Float>(data: impl IntoIterator<Item = T>) -> Option<T> {
    let values: Vec<T> = data.into_iter().filter(|v| v.is_finite()).collect();
    mean(&values)
}

/// Index of the first maximum
pub fn argmax<T: Float>(data: &[T]) -> Option<usize> {
    let mut best: Option<(usize, T)> = None;
    for (i, &v) in data.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Index of the first minimum
pub fn argmin<T: Float>(data: &[T]) -> Option<usize> {
    let mut best: Option<(usize, T)> = None;
    for (i, &v) in data.iter().enumerate() {
        match best {
            Some((_, b)) if v >= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Largest value, ignoring NaN
pub fn max<T: Float>(data: &[T]) -> Option<T> {
    data.iter().copied().filter(|v| !v.is_nan()).reduce(T::max)
}

/// Smallest value, ignoring NaN
pub fn min<T: Float>(data: &[T]) -> Option<T> {
    data.iter().copied().filter(|v| !v.is_nan()).reduce(T::min)
}
