//! Queue consumers.

mod cleanup;
mod email;
mod incident;
mod metrics;
mod status;

#[cfg(test)]
mod testing;

pub use cleanup::*;
pub use email::*;
pub use incident::*;
pub use metrics::*;
pub use status::*;
