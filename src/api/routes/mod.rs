//! API route modules.

pub mod recorders;
