//! This module provides the branch and bound resolution strategies.
pub mod parallel;

pub use parallel::*;
