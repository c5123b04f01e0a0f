//! Reconstruction and classification of web resources from dissected browser traffic.
//! A capture is scanned once in frame order, resources are attributed to the first party the
//! crawl ended on, labelled by the filter engine and annotated with per-frame metrics.
pub mod containers;
pub mod core;
pub mod domain;
pub mod filter;
pub mod metrics;
pub mod party;
pub mod scan;
pub mod utils;
