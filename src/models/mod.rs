//! Domain entities shared across the registry, channels, and supervisor.

pub mod progress;
pub mod session;
