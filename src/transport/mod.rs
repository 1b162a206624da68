//! Network-facing pieces that are not the control connection itself.

pub mod discovery;
