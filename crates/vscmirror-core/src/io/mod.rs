//! IO modules - side effects (network)

pub mod download;
pub mod fetch;
pub mod retry;
