pub mod bar;
pub mod normalizer;

// Re-export the core types for convenient access (e.g. `use crate::market_data::PriceSeries`).
pub use bar::{PriceBar, PriceSeries};
pub use normalizer::{NormalizeReport, Normalized, Normalizer};
