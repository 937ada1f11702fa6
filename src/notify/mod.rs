//! Outbound notification channels: email and chat webhook.

mod email;
mod templates;
mod webhook;

pub use email::*;
pub use templates::*;
pub use webhook::*;
