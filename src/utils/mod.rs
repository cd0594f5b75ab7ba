//! Utils Module - Helper Functions & Shared Utilities

pub mod abi;
pub mod backoff;
pub mod cache;
pub mod constants;

pub use backoff::*;
pub use cache::*;
pub use constants::*;
