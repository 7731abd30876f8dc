/// A trait for matrix-like types that generated functions can fill.
///
/// Generated code writes matrices row-major. Each implementation copies
/// from that layout into its own storage, so column-major types such as
/// nalgebra's `DMatrix` receive entries at the right positions.
///
/// # Examples
///
/// ```rust
/// use symsys::prelude::Matrix;
///
/// let mut mat: Vec<Vec<f64>> = Matrix::zeros(2, 3);
/// mat.fill_row_major(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
/// assert_eq!(mat.dims(), (2, 3));
/// assert_eq!(mat[1][0], 3.0);
/// ```
pub trait Matrix {
    /// Creates a new matrix of the specified dimensions filled with zeros.
    fn zeros(rows: usize, cols: usize) -> Self;

    /// Returns the dimensions of the matrix as (rows, columns).
    fn dims(&self) -> (usize, usize);

    /// Overwrites every entry from row-major `data` of length `rows * cols`.
    fn fill_row_major(&mut self, data: &[f64]);
}

impl Matrix for Vec<Vec<f64>> {
    fn zeros(rows: usize, cols: usize) -> Self {
        vec![vec![0.0; cols]; rows]
    }

    fn dims(&self) -> (usize, usize) {
        (self.len(), self.first().map_or(0, Vec::len))
    }

    fn fill_row_major(&mut self, data: &[f64]) {
        let (_, cols) = self.dims();
        if cols == 0 {
            return;
        }
        for (row, chunk) in self.iter_mut().zip(data.chunks(cols)) {
            row.copy_from_slice(chunk);
        }
    }
}

#[cfg(feature = "ndarray")]
impl Matrix for ndarray::Array2<f64> {
    fn zeros(rows: usize, cols: usize) -> Self {
        ndarray::Array2::zeros((rows, cols))
    }

    fn dims(&self) -> (usize, usize) {
        (self.nrows(), self.ncols())
    }

    // logical iteration order of ndarray is row-major whatever the strides
    fn fill_row_major(&mut self, data: &[f64]) {
        for (slot, value) in self.iter_mut().zip(data) {
            *slot = *value;
        }
    }
}

#[cfg(feature = "nalgebra")]
impl Matrix for nalgebra::DMatrix<f64> {
    fn zeros(rows: usize, cols: usize) -> Self {
        nalgebra::DMatrix::zeros(rows, cols)
    }

    fn dims(&self) -> (usize, usize) {
        (self.nrows(), self.ncols())
    }

    fn fill_row_major(&mut self, data: &[f64]) {
        let (rows, cols) = self.dims();
        for row in 0..rows {
            for col in 0..cols {
                self[(row, col)] = data[row * cols + col];
            }
        }
    }
}
