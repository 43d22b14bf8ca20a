//! Command-line policy shared by the binary and its tests.

mod color;

pub use color::ColorWhen;
