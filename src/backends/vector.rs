/// A trait for vector-like types that generated functions can write into.
///
/// Contiguous types expose their storage through [`Vector::as_mut_slice`]
/// and are written in place. Strided layouts return `None` there and are
/// filled element by element through [`Vector::assign`].
///
/// # Examples
///
/// ```rust
/// use symsys::prelude::Vector;
///
/// let mut vec: Vec<f64> = Vector::zeros(3);
/// assert_eq!(Vector::len(&vec), 3);
/// vec.assign(&[1.0, 2.0, 3.0]);
/// assert_eq!(vec, vec![1.0, 2.0, 3.0]);
/// ```
pub trait Vector {
    /// Creates a new vector of the specified length filled with zeros.
    fn zeros(len: usize) -> Self;

    /// Returns the length of the vector.
    fn len(&self) -> usize;

    /// Checks if the vector is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contiguous storage, or `None` for a strided layout.
    fn as_mut_slice(&mut self) -> Option<&mut [f64]>;

    /// Overwrites the first `data.len()` entries.
    fn assign(&mut self, data: &[f64]);
}

impl Vector for Vec<f64> {
    fn zeros(len: usize) -> Self {
        vec![0.0; len]
    }

    fn len(&self) -> usize {
        self.len()
    }

    fn as_mut_slice(&mut self) -> Option<&mut [f64]> {
        Some(self)
    }

    fn assign(&mut self, data: &[f64]) {
        self[..data.len()].copy_from_slice(data);
    }
}

/// Fixed-size arrays ignore the requested length; a mismatch surfaces as a
/// `ShapeMismatch` when the array is handed to a generated function.
impl<const N: usize> Vector for [f64; N] {
    fn zeros(_len: usize) -> Self {
        [0.0; N]
    }

    fn len(&self) -> usize {
        N
    }

    fn as_mut_slice(&mut self) -> Option<&mut [f64]> {
        Some(self)
    }

    fn assign(&mut self, data: &[f64]) {
        self[..data.len()].copy_from_slice(data);
    }
}

#[cfg(feature = "ndarray")]
impl Vector for ndarray::Array1<f64> {
    fn zeros(len: usize) -> Self {
        ndarray::Array1::zeros(len)
    }

    fn len(&self) -> usize {
        self.len()
    }

    fn as_mut_slice(&mut self) -> Option<&mut [f64]> {
        self.as_slice_mut()
    }

    fn assign(&mut self, data: &[f64]) {
        for (slot, value) in self.iter_mut().zip(data) {
            *slot = *value;
        }
    }
}

#[cfg(feature = "nalgebra")]
impl Vector for nalgebra::DVector<f64> {
    fn zeros(len: usize) -> Self {
        nalgebra::DVector::zeros(len)
    }

    fn len(&self) -> usize {
        self.len()
    }

    fn as_mut_slice(&mut self) -> Option<&mut [f64]> {
        Some(self.as_mut_slice())
    }

    fn assign(&mut self, data: &[f64]) {
        self.as_mut_slice()[..data.len()].copy_from_slice(data);
    }
}
