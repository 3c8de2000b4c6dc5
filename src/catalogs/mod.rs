//! Implementations of [crate::catalog::Catalog].

pub mod consul;
pub mod fixed;
