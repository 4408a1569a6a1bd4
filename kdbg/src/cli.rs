//! Command-line interface

mod args;

pub use args::{Args, BreakTarget, Config};
