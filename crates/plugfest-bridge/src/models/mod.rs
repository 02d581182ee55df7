//! Built-in device models

mod light;

pub use light::PlugfestLight;
