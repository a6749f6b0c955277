//! Partial derivative storage and the linear operator assembled from it.
//!
//! Components hand their partials over as [`block::JacobianBlock`]s keyed by `(of, wrt)`
//! variable pairs. Pairs nobody declared are structural zeros and are never allocated. The
//! [`store::JacobianStore`] turns the declared blocks into a [`operator::SystemOperator`]: a
//! sparse matrix over the unknowns vector in residual form, with connection transfers folded in.

pub mod approx;
pub mod block;
pub mod operator;
pub mod sparse;
pub mod store;
