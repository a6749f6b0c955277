//! # Engine Module
//!
//! This module implements the derivative engine of mdax: it turns a [`Model`] into an assembled,
//! runnable system and computes total derivatives through it.
//!
//! ## Overview
//!
//! Setup registers every component variable, resolves explicit and promoted connections,
//! orders each group's children and declares the sparsity of the partial Jacobian, failing
//! before any numerical work if anything is structurally wrong. Execution then runs the
//! schedule (iterating coupled groups and spreading parallel groups over ranks) and
//! linearizes every component, analytically or by finite difference / complex step. The
//! orchestrator finally assembles the global residual Jacobian, splits the requested
//! derivatives into independent groups of right-hand sides, and solves them in direct or
//! adjoint mode.
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Approximation, linear solver and mode settings
//! - **Error Handling** ([`error`]) - The unified error type and connection errors
//! - **Progress Monitoring** ([`progress`]) - Phase and task events for callers
//! - **Linear Solvers** ([`solvers`]) - Direct, Krylov and block Gauss-Seidel solvers
//! - **Derivatives** ([`orchestrator`]) - Mode selection and total-derivative assembly
//! - **Distribution** ([`distributed`]) - Collectives and work partitioning across ranks
//! - **Recording** ([`recording`]) - Snapshots of the variable state after each pass
//!
//! [`Model`]: crate::core::models::system::Model

pub mod config;
pub mod distributed;
pub mod error;
pub(crate) mod execution;
pub mod orchestrator;
pub(crate) mod ordering;
pub mod progress;
pub mod recording;
pub(crate) mod relevance;
pub(crate) mod setup;
pub mod solvers;

pub use execution::PartialCheck;
