//! Sparse linear solvers for the normal equations.
//!
//! Dense block assembly is done with nalgebra; the global systems are
//! solved with faer's sparse Cholesky. Factors arrive pre-whitened, so no
//! separate weight vector is threaded through the solves.

use std::ops::Mul;

use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers;

/// Sparse matrix type used for global Jacobians and Hessians.
pub type SparseMatrix = faer::sparse::SparseColMat<usize, f64>;

/// Dense matrix type used for residual and step vectors.
pub type DenseMatrix = faer::Mat<f64>;

/// Common interface for solving the (possibly damped) normal equations of
/// a whitened least-squares system.
pub trait SparseLinearSolver {
    /// Solve `JᵀJ dx = −Jᵀr`. Returns `None` when the system is not
    /// positive definite (singular or ill-posed).
    fn solve_normal_equation(
        &mut self,
        residuals: &DenseMatrix,
        jacobian: &SparseMatrix,
    ) -> Option<DenseMatrix>;

    /// Solve the Levenberg-Marquardt system `(JᵀJ + λI) dx = −Jᵀr`.
    fn solve_augmented_equation(
        &mut self,
        residuals: &DenseMatrix,
        jacobian: &SparseMatrix,
        lambda: f64,
    ) -> Option<DenseMatrix>;
}

/// Sparse Cholesky (LLᵀ) solver. The symbolic pattern of the undamped
/// normal equations is cached across calls with an unchanged pattern.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    symbolic_pattern: Option<solvers::SymbolicLlt<usize>>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the cached symbolic pattern (call when the graph has grown).
    pub fn reset_pattern(&mut self) {
        self.symbolic_pattern = None;
    }
}

impl SparseLinearSolver for SparseCholeskySolver {
    fn solve_normal_equation(
        &mut self,
        residuals: &DenseMatrix,
        jacobian: &SparseMatrix,
    ) -> Option<DenseMatrix> {
        let hessian = jacobian
            .as_ref()
            .transpose()
            .to_col_major()
            .ok()?
            .mul(jacobian.as_ref());
        let gradient = jacobian.as_ref().transpose().mul(&scale(residuals, -1.0));

        if self.symbolic_pattern.is_none() {
            self.symbolic_pattern =
                solvers::SymbolicLlt::try_new(hessian.symbolic(), faer::Side::Lower).ok();
        }

        let sym = self.symbolic_pattern.as_ref()?;
        match solvers::Llt::try_new_with_symbolic(sym.clone(), hessian.as_ref(), faer::Side::Lower)
        {
            Ok(cholesky) => Some(cholesky.solve(gradient)),
            Err(_) => None,
        }
    }

    fn solve_augmented_equation(
        &mut self,
        residuals: &DenseMatrix,
        jacobian: &SparseMatrix,
        lambda: f64,
    ) -> Option<DenseMatrix> {
        let n = jacobian.ncols();

        let hessian = jacobian
            .as_ref()
            .transpose()
            .to_col_major()
            .ok()?
            .mul(jacobian.as_ref());
        let gradient = jacobian.as_ref().transpose().mul(&scale(residuals, -1.0));

        let mut lambda_triplets = Vec::with_capacity(n);
        for i in 0..n {
            lambda_triplets.push(faer::sparse::Triplet::new(i, i, lambda));
        }
        let lambda_i =
            faer::sparse::SparseColMat::try_new_from_triplets(n, n, &lambda_triplets).ok()?;

        let augmented = hessian + lambda_i;

        // The damping changes between iterations, so the symbolic
        // factorization of the augmented system is not cached.
        let sym = solvers::SymbolicLlt::try_new(augmented.symbolic(), faer::Side::Lower).ok()?;
        match solvers::Llt::try_new_with_symbolic(sym, augmented.as_ref(), faer::Side::Lower) {
            Ok(cholesky) => Some(cholesky.solve(gradient)),
            Err(_) => None,
        }
    }
}

/// Scale a dense matrix by a scalar.
pub fn scale(mat: &DenseMatrix, factor: f64) -> DenseMatrix {
    DenseMatrix::from_fn(mat.nrows(), mat.ncols(), |i, j| mat[(i, j)] * factor)
}

/// Build a sparse matrix from triplets.
pub fn triplets_to_sparse(
    rows: usize,
    cols: usize,
    triplets: &[faer::sparse::Triplet<usize, usize, f64>],
) -> Option<SparseMatrix> {
    faer::sparse::SparseColMat::try_new_from_triplets(rows, cols, triplets).ok()
}
