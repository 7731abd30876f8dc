use std::sync::Arc;

use crate::errors::SymbolicError;

/// Type alias for an allocating generated function.
///
/// This represents a function that:
/// - Takes one slice per argument group, in the order the groups were declared
/// - Returns a freshly allocated [`Output`]
/// - Is both Send and Sync for thread safety
pub type OutOfPlaceFn = Arc<dyn Fn(&[&[f64]]) -> Result<Output, SymbolicError> + Send + Sync>;

/// Type alias for a generated function writing into a caller buffer.
///
/// This represents a function that:
/// - Takes a mutable slice receiving the flattened result (row-major for matrices)
/// - Takes one slice per argument group
/// - Allocates nothing and never reads the output buffer
pub type InPlaceFn = Arc<dyn Fn(&mut [f64], &[&[f64]]) -> Result<(), SymbolicError> + Send + Sync>;

/// Shape of the values a generated function writes.
///
/// A sparse target produces the vector of its structural nonzeros in pattern order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputShape {
    Scalar,
    Vector(usize),
    Matrix { rows: usize, cols: usize },
}

impl OutputShape {
    /// Number of `f64` slots the output occupies.
    pub fn len(&self) -> usize {
        match self {
            OutputShape::Scalar => 1,
            OutputShape::Vector(len) => *len,
            OutputShape::Matrix { rows, cols } => rows * cols,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wraps a flat buffer of `self.len()` values.
    pub(crate) fn wrap(&self, data: Vec<f64>) -> Output {
        match self {
            OutputShape::Scalar => Output::Scalar(data.first().copied().unwrap_or_default()),
            OutputShape::Vector(_) => Output::Vector(data),
            OutputShape::Matrix { rows, cols } => Output::Matrix {
                rows: *rows,
                cols: *cols,
                data,
            },
        }
    }
}

/// Result of an out-of-place call.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Scalar(f64),
    Vector(Vec<f64>),
    /// Row-major data
    Matrix {
        rows: usize,
        cols: usize,
        data: Vec<f64>,
    },
}

impl Output {
    /// All values, flattened row-major.
    pub fn as_slice(&self) -> &[f64] {
        match self {
            Output::Scalar(value) => std::slice::from_ref(value),
            Output::Vector(data) | Output::Matrix { data, .. } => data,
        }
    }

    pub fn into_vec(self) -> Vec<f64> {
        match self {
            Output::Scalar(value) => vec![value],
            Output::Vector(data) | Output::Matrix { data, .. } => data,
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Output::Scalar(value) => Some(*value),
            _ => None,
        }
    }

    /// Entry `(row, col)` of a matrix output.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        match self {
            Output::Matrix { rows, cols, data } if row < *rows && col < *cols => {
                Some(data[row * cols + col])
            }
            _ => None,
        }
    }
}
