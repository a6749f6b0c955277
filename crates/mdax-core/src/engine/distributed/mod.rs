//! Collective communication for running one problem on several processes.
//!
//! Every rank holds the full model and a replica of every variable. Work is divided three ways:
//! children of parallel groups run on the rank they are assigned to, finite-difference columns
//! are split contiguously across ranks, and Krylov matrix-vector products are split by row
//! blocks. Results are exchanged through [`collective::Collective`] after each phase, and every
//! exchange carries a status flag so a failure on one rank surfaces on all of them instead of
//! leaving the others blocked.

pub mod collective;
pub mod partition;
