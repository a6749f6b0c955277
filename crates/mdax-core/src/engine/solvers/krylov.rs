use super::{LinearSolution, LinearSolveError, LinearSolveFailure, LinearSolver, PreparedSolver, SolveMode};
use crate::core::jacobian::operator::SystemOperator;
use crate::core::jacobian::sparse::CsrMatrix;
use crate::engine::distributed::collective::Collective;
use crate::engine::distributed::partition::partition_range;
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;
use tracing::{debug, trace};

/// Right-hand sides below this norm are answered with zero without iterating.
const ZERO_RHS: f64 = 1e-15;

/// Restarted flexible GMRES with optional right preconditioning.
///
/// The preconditioner is applied as `A M^-1 (M x) = b`; keeping the preconditioned directions
/// (flexible variant) allows preconditioners that are themselves iterative. On several ranks
/// each matrix-vector product is split by contiguous row blocks and reassembled with an
/// all-gather, so every rank follows identical iterations.
#[derive(Debug)]
pub struct KrylovSolver {
    tolerance: f64,
    max_iterations: usize,
    restart: usize,
    preconditioner: Option<Box<dyn LinearSolver>>,
}

impl KrylovSolver {
    pub fn new(
        tolerance: f64,
        max_iterations: usize,
        restart: usize,
        preconditioner: Option<Box<dyn LinearSolver>>,
    ) -> Self {
        Self {
            tolerance,
            max_iterations,
            restart: restart.max(1),
            preconditioner,
        }
    }
}

impl LinearSolver for KrylovSolver {
    fn name(&self) -> &'static str {
        "krylov"
    }

    fn prepare(
        &self,
        op: &SystemOperator,
        mode: SolveMode,
        comm: &Arc<dyn Collective>,
    ) -> Result<Box<dyn PreparedSolver>, LinearSolveError> {
        let preconditioner = match &self.preconditioner {
            Some(pc) => Some(pc.prepare(op, mode, comm)?),
            None => None,
        };
        Ok(Box::new(PreparedKrylov {
            matrix: op.oriented(mode).clone(),
            comm: Arc::clone(comm),
            preconditioner,
            tolerance: self.tolerance,
            max_iterations: self.max_iterations,
            restart: self.restart,
        }))
    }
}

enum Outcome {
    Converged,
    IterationLimit,
    Stagnated,
}

struct PreparedKrylov {
    matrix: CsrMatrix,
    comm: Arc<dyn Collective>,
    preconditioner: Option<Box<dyn PreparedSolver>>,
    tolerance: f64,
    max_iterations: usize,
    restart: usize,
}

struct Iterate {
    x: DVector<f64>,
    iterations: usize,
    residual_norm: f64,
    outcome: Outcome,
}

impl PreparedKrylov {
    fn apply(&self, v: &DVector<f64>) -> DVector<f64> {
        let size = self.comm.size();
        if size == 1 {
            return self.matrix.matvec(v);
        }
        let n = self.matrix.nrows();
        let rows = partition_range(n, size, self.comm.rank());
        let local = self.matrix.matvec_rows(rows, v);
        let gathered = self.comm.all_gather(local);
        DVector::from_iterator(n, gathered.into_iter().flatten())
    }

    fn precondition_direction(&self, v: &DVector<f64>) -> Result<DVector<f64>, LinearSolveError> {
        match &self.preconditioner {
            Some(pc) => pc.precondition(v),
            None => Ok(v.clone()),
        }
    }

    fn failure(&self, reason: LinearSolveFailure, iterations: usize, residual_norm: f64) -> LinearSolveError {
        LinearSolveError {
            solver: "krylov",
            reason,
            iterations,
            residual_norm,
        }
    }

    fn iterate(&self, b: &DVector<f64>) -> Result<Iterate, LinearSolveError> {
        let n = b.len();
        let mut x = DVector::zeros(n);
        if b.norm() < ZERO_RHS {
            return Ok(Iterate {
                x,
                iterations: 0,
                residual_norm: 0.0,
                outcome: Outcome::Converged,
            });
        }

        let mut iterations = 0;
        let mut beta = b.norm();
        let mut r = b.clone();
        loop {
            if beta <= self.tolerance {
                return Ok(Iterate {
                    x,
                    iterations,
                    residual_norm: beta,
                    outcome: Outcome::Converged,
                });
            }
            if iterations >= self.max_iterations {
                return Ok(Iterate {
                    x,
                    iterations,
                    residual_norm: beta,
                    outcome: Outcome::IterationLimit,
                });
            }

            let m = self.restart;
            let mut basis = vec![&r / beta];
            let mut directions: Vec<DVector<f64>> = Vec::with_capacity(m);
            let mut h = DMatrix::<f64>::zeros(m + 1, m);
            let mut cs: Vec<f64> = Vec::with_capacity(m);
            let mut sn: Vec<f64> = Vec::with_capacity(m);
            let mut g = DVector::<f64>::zeros(m + 1);
            g[0] = beta;
            let mut breakdown = false;

            for j in 0..m {
                if iterations >= self.max_iterations {
                    break;
                }
                iterations += 1;

                let z = self.precondition_direction(&basis[j])?;
                let mut w = self.apply(&z);
                for (i, v) in basis.iter().enumerate() {
                    let hij = w.dot(v);
                    h[(i, j)] = hij;
                    w.axpy(-hij, v, 1.0);
                }
                let h_next = w.norm();
                h[(j + 1, j)] = h_next;

                for i in 0..j {
                    let upper = cs[i] * h[(i, j)] + sn[i] * h[(i + 1, j)];
                    h[(i + 1, j)] = -sn[i] * h[(i, j)] + cs[i] * h[(i + 1, j)];
                    h[(i, j)] = upper;
                }
                let (c, s) = givens(h[(j, j)], h[(j + 1, j)]);
                h[(j, j)] = c * h[(j, j)] + s * h[(j + 1, j)];
                h[(j + 1, j)] = 0.0;
                cs.push(c);
                sn.push(s);
                g[j + 1] = -s * g[j];
                g[j] *= c;
                directions.push(z);

                let estimate = g[j + 1].abs();
                trace!(iteration = iterations, residual = estimate, "GMRES iteration");
                if !estimate.is_finite() {
                    return Err(self.failure(LinearSolveFailure::NonConvergence, iterations, estimate));
                }
                if estimate <= self.tolerance {
                    break;
                }
                if h_next <= f64::EPSILON * beta {
                    breakdown = true;
                    break;
                }
                basis.push(&w / h_next);
            }

            let k = directions.len();
            let mut y = DVector::<f64>::zeros(k);
            for i in (0..k).rev() {
                let tail: f64 = ((i + 1)..k).map(|l| h[(i, l)] * y[l]).sum();
                if h[(i, i)] == 0.0 {
                    return Err(self.failure(LinearSolveFailure::Singular, iterations, beta));
                }
                y[i] = (g[i] - tail) / h[(i, i)];
            }
            for (yi, z) in y.iter().zip(&directions) {
                x.axpy(*yi, z, 1.0);
            }

            r = b - self.apply(&x);
            let new_beta = r.norm();
            if !new_beta.is_finite() {
                return Err(self.failure(LinearSolveFailure::NonConvergence, iterations, new_beta));
            }
            if new_beta <= self.tolerance {
                beta = new_beta;
                continue;
            }
            if breakdown {
                return Err(self.failure(LinearSolveFailure::Singular, iterations, new_beta));
            }
            if new_beta >= beta && iterations < self.max_iterations {
                return Ok(Iterate {
                    x,
                    iterations,
                    residual_norm: new_beta,
                    outcome: Outcome::Stagnated,
                });
            }
            debug!(iterations, residual = new_beta, "GMRES restart");
            beta = new_beta;
        }
    }
}

impl PreparedSolver for PreparedKrylov {
    fn solve(&self, rhs: &DVector<f64>) -> Result<LinearSolution, LinearSolveError> {
        let it = self.iterate(rhs)?;
        match it.outcome {
            Outcome::Converged => Ok(LinearSolution {
                x: it.x,
                iterations: it.iterations,
                residual_norm: it.residual_norm,
            }),
            Outcome::IterationLimit => Err(self.failure(
                LinearSolveFailure::IterationLimit,
                it.iterations,
                it.residual_norm,
            )),
            Outcome::Stagnated => Err(self.failure(
                LinearSolveFailure::NonConvergence,
                it.iterations,
                it.residual_norm,
            )),
        }
    }

    fn precondition(&self, r: &DVector<f64>) -> Result<DVector<f64>, LinearSolveError> {
        self.iterate(r).map(|it| it.x)
    }
}

/// Rotation `(c, s)` with `-s a + c b = 0`.
fn givens(a: f64, b: f64) -> (f64, f64) {
    if b == 0.0 {
        (1.0, 0.0)
    } else if b.abs() > a.abs() {
        let t = a / b;
        let s = 1.0 / (1.0 + t * t).sqrt();
        (s * t, s)
    } else {
        let t = b / a;
        let c = 1.0 / (1.0 + t * t).sqrt();
        (c, c * t)
    }
}
