//! Local snapshot directory scanning.

pub mod filter;
pub mod forgotten;
pub mod metadata;
pub mod scanner;
