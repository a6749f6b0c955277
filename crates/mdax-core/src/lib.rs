//! # mdax Core Library
//!
//! A multidisciplinary design optimization framework built around a derivative engine: given a
//! hierarchy of coupled analysis components, it evaluates the model and computes the total
//! derivatives of chosen responses with respect to chosen design variables.
//!
//! ## Architectural Philosophy
//!
//! The library keeps the same three-layer split throughout, so that data, algorithms and the
//! user-facing API can evolve independently.
//!
//! - **[`core`]: The Foundation.** Stateless data models: the system hierarchy (`Model`), the
//!   component contract, the flat variable storage (`VariableRegistry`), and the partial
//!   derivative storage (`JacobianStore`) together with its sparse operator form and the
//!   finite-difference / complex-step approximations.
//!
//! - **[`engine`]: The Logic Core.** Setup and connection resolution, execution scheduling,
//!   linear solvers (direct, Krylov, block Gauss-Seidel), relevance analysis, the derivative
//!   orchestrator that picks forward or adjoint mode, and the collective layer used to spread
//!   work over several processes.
//!
//! - **[`workflows`]: The Public API.** `Problem` ties the layers together: set up a model, run
//!   it, set design variables and request total derivatives.

pub mod core;
pub mod engine;
pub mod workflows;

#[cfg(test)]
pub(crate) mod testing;
