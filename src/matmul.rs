//! GEMM used by the batched layer kernels.
//!
//! Operands are strided views ([`MatRef`]), so a transposed weight or gradient
//! matrix is read in place instead of being copied. The output is always a
//! contiguous row-major `(m, n)` buffer.
//!
//! The default backend is a plain loop; the `matrixmultiply` feature swaps in
//! that crate's blocked kernel.

/// Read-only strided view of a matrix.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MatRef<'a> {
    data: &'a [f32],
    row_stride: usize,
    col_stride: usize,
}

impl<'a> MatRef<'a> {
    /// Row-major matrix with `cols` columns.
    #[inline]
    pub(crate) fn rows(data: &'a [f32], cols: usize) -> Self {
        Self {
            data,
            row_stride: cols,
            col_stride: 1,
        }
    }

    /// Transpose of a row-major matrix with `cols` columns.
    #[inline]
    pub(crate) fn transposed(data: &'a [f32], cols: usize) -> Self {
        Self {
            data,
            row_stride: 1,
            col_stride: cols,
        }
    }

    #[cfg(not(feature = "matrixmultiply"))]
    #[inline]
    fn at(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.row_stride + col * self.col_stride]
    }

    /// Smallest buffer length that covers a `(rows, cols)` view.
    #[inline]
    fn extent(&self, rows: usize, cols: usize) -> usize {
        (rows - 1) * self.row_stride + (cols - 1) * self.col_stride + 1
    }
}

/// `c = alpha * a * b + beta * c` where `a` is `(m, k)`, `b` is `(k, n)` and `c`
/// is row-major `(m, n)`. With `beta == 0` the old contents of `c` are ignored.
#[inline]
#[allow(clippy::too_many_arguments)]
pub(crate) fn gemm(
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: MatRef<'_>,
    b: MatRef<'_>,
    beta: f32,
    c: &mut [f32],
) {
    if m == 0 || n == 0 || k == 0 {
        return;
    }
    assert!(a.data.len() >= a.extent(m, k), "gemm: lhs buffer too small");
    assert!(b.data.len() >= b.extent(k, n), "gemm: rhs buffer too small");
    assert_eq!(c.len(), m * n, "gemm: output must be m * n");

    #[cfg(feature = "matrixmultiply")]
    // SAFETY: the assertions above bound every strided access of a, b and c.
    unsafe {
        matrixmultiply::sgemm(
            m,
            k,
            n,
            alpha,
            a.data.as_ptr(),
            a.row_stride as isize,
            a.col_stride as isize,
            b.data.as_ptr(),
            b.row_stride as isize,
            b.col_stride as isize,
            beta,
            c.as_mut_ptr(),
            n as isize,
            1,
        );
    }

    #[cfg(not(feature = "matrixmultiply"))]
    for (i, c_row) in c.chunks_exact_mut(n).enumerate() {
        for (j, out) in c_row.iter_mut().enumerate() {
            let acc = (0..k).fold(0.0_f32, |acc, p| a.at(i, p).mul_add(b.at(p, j), acc));
            *out = if beta == 0.0 {
                alpha * acc
            } else {
                alpha.mul_add(acc, beta * *out)
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transposed_view_reads_in_place() {
        // a: 2x3; bt stores B^T as 2x3, so B is 3x2.
        let a = [1.0_f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let bt = [1.0_f32, 0.0, 1.0, 0.0, 1.0, 0.0];
        let mut c = [0.0_f32; 4];
        gemm(2, 2, 3, 1.0, MatRef::rows(&a, 3), MatRef::transposed(&bt, 3), 0.0, &mut c);
        assert_eq!(c, [4.0, 2.0, 10.0, 5.0]);
    }

    #[test]
    fn beta_accumulates_into_output() {
        let a = [2.0_f32];
        let b = [3.0_f32];
        let mut c = [1.0_f32];
        gemm(1, 1, 1, 1.0, MatRef::rows(&a, 1), MatRef::rows(&b, 1), 1.0, &mut c);
        assert_eq!(c, [7.0]);
    }

    #[test]
    fn beta_zero_ignores_stale_output() {
        let a = [1.0_f32, 1.0];
        let b = [2.0_f32, 3.0];
        let mut c = [f32::NAN];
        gemm(1, 1, 2, 1.0, MatRef::rows(&a, 2), MatRef::rows(&b, 1), 0.0, &mut c);
        assert_eq!(c, [5.0]);
    }
}
