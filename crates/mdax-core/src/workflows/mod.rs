//! # Workflows Module
//!
//! This module provides the driver-facing entry point of mdax.
//!
//! ## Overview
//!
//! A [`problem::Problem`] owns an assembled model together with its derivative configuration,
//! the collective it runs on, and any attached recorders. It is what an optimizer talks to:
//! set design variables, run the model, read responses, and request total derivatives.
//!
//! ## Architecture
//!
//! - **Problem** ([`problem`]) - Setup, evaluation, partial checks and total derivatives
//!   for one model on one rank of a collective.
//!
//! ## Key Capabilities
//!
//! - **Fail-fast setup** with connection and naming errors reported before any computation
//! - **Forward and adjoint derivatives** chosen automatically from the request size
//! - **Progress monitoring** through an optional callback
//! - **Recording** of the variable state after every pass

pub mod problem;
