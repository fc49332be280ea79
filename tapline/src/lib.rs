//! Umbrella crate re-exporting the tapline workspace

pub use tapline_bin;
pub use tapline_config;
pub use tapline_core;

pub use tapline_config::Config;
pub use tapline_core::run_proxy;
