//! tracksniff turns tshark captures of crawler visits into labelled web resources.
pub mod analyser;
pub mod config;
pub mod error;
pub mod ui;

pub use error::{Error, Result};
