//! Core type definitions used across the CareHub workspace.

pub mod id;

pub use id::*;
