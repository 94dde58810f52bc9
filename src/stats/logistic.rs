// Binary-outcome logistic regression fitted by iteratively reweighted least
// squares (Newton-Raphson on the log-likelihood).

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FitError {
    #[error("design matrix has {columns} observations but the response has {responses}")]
    DimensionMismatch { columns: usize, responses: usize },
}

/// Iteration bounds for one fit.
#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    pub max_iterations: usize,
    /// Convergence is declared once the summed absolute coefficient change
    /// falls at or below this value.
    pub convergence_threshold: f64,
}

/// A completed (not necessarily converged) fit.
#[derive(Debug, Clone)]
pub struct LogisticFit {
    /// Coefficients; index 0 is the intercept.
    pub beta: DVector<f64>,
    /// Inverse information matrix at the final iterate.
    pub covariance: DMatrix<f64>,
    pub standard_error: DVector<f64>,
    pub z: DVector<f64>,
    pub log_likelihood: f64,
    pub iterations: usize,
    /// Whether the final coefficient change was within the threshold. An
    /// unstable fit is a reported outcome, not an error.
    pub stable: bool,
}

#[inline]
fn logistic(value: f64) -> f64 {
    1.0 / (1.0 + (-value).exp())
}

// The information matrix is inverted by LU; a singular matrix falls back to
// the SVD pseudo-inverse, mirroring the solver cascade of the usual GWAS
// fitting stacks.
fn invert_information(information: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    information
        .clone()
        .lu()
        .try_inverse()
        .or_else(|| information.clone().svd(true, true).pseudo_inverse(1e-12).ok())
}

/// Fits `y ~ logit(X)` where `x` is laid out variables x observations,
/// without an intercept row; the intercept is prepended here.
pub fn fit(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    options: FitOptions,
) -> Result<LogisticFit, FitError> {
    if x.ncols() != y.len() {
        return Err(FitError::DimensionMismatch {
            columns: x.ncols(),
            responses: y.len(),
        });
    }

    let observations = x.ncols();
    let coefficients = x.nrows() + 1;

    // Intercept row of ones on top of the supplied design.
    let mut design = DMatrix::<f64>::zeros(coefficients, observations);
    design.row_mut(0).fill(1.0);
    design.rows_mut(1, x.nrows()).copy_from(x);

    let mut beta = DVector::<f64>::zeros(coefficients);
    let mut covariance = DMatrix::<f64>::zeros(coefficients, coefficients);
    let mut log_likelihood = 0.0;
    let mut difference = 1.0f64;
    let mut iterations = 0;

    while iterations < options.max_iterations {
        iterations += 1;

        let eta = design.transpose() * &beta;
        let probabilities = eta.map(logistic);

        log_likelihood = (0..observations)
            .map(|i| {
                let p = probabilities[i];
                y[i] * p.ln() + (1.0 - y[i]) * (-p).ln_1p()
            })
            .sum();

        let score = &design * (y - &probabilities);

        // Information matrix J = X W X^T with W = diag(p (1 - p)).
        let weights = probabilities.map(|p| p * (1.0 - p));
        let mut weighted = design.clone();
        for mut row in weighted.row_iter_mut() {
            row.component_mul_assign(&weights.transpose());
        }
        let information = &weighted * design.transpose();

        covariance = match invert_information(&information) {
            Some(inverse) => inverse,
            None => {
                difference = f64::INFINITY;
                break;
            }
        };

        let step = &covariance * score;
        beta += &step;

        difference = step.iter().map(|value| value.abs()).sum();
        if !difference.is_finite() {
            break;
        }
        if difference <= options.convergence_threshold {
            break;
        }
    }

    let standard_error = DVector::from_iterator(
        coefficients,
        (0..coefficients).map(|i| covariance[(i, i)].sqrt()),
    );
    let z = beta.component_div(&standard_error);
    let stable = difference <= options.convergence_threshold;

    Ok(LogisticFit {
        beta,
        covariance,
        standard_error,
        z,
        log_likelihood,
        iterations,
        stable,
    })
}
