//! Ingest sources for Klaxon
//!
//! Samples arrive through:
//! - HTTP push (`POST /ingest`, exposition text or JSON)
//! - The pull scraper, when scrape targets are configured

pub mod exposition;
pub mod scrape;

pub use exposition::{parse_exposition, render_exposition, ParseError};
pub use scrape::{ScrapeError, ScrapeTarget, Scraper, UP_METRIC};
