//! Built-in pipelines.

pub mod text;
