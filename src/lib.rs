//! unicef_sdmx
//!
//! A Rust library for pulling indicator data out of the UNICEF SDMX warehouse without
//! knowing which dataflow holds it. Pairs with the `usdmx` CLI.
//!
//! ### Features
//! - Resolve an indicator code to an ordered list of candidate dataflows
//!   (local catalog, then indicator-family table, then `GLOBAL_DATAFLOW`)
//! - Build query keys from each dataflow's own dimension order
//! - Fetch paged CSV results, retrying transient failures and falling back across dataflows
//! - Read the local metadata files with a small YAML-like parser (no YAML crate needed)
//! - Save results as CSV or JSON
//!
//! ### Example
//! ```no_run
//! use unicef_sdmx::{FetchEngine, FetchRequest, Filters, Settings};
//!
//! let settings = Settings::load(None)?;
//! let store = settings.metadata_store();
//! let engine = FetchEngine::new(&store, settings.transport()?, settings.fetch_options());
//! let request = FetchRequest::new("WS_PPL_W-SM".parse()?)
//!     .filters(Filters::new().residence("U")?)
//!     .years("2015:2022".parse()?);
//! let result = engine.fetch(&request)?;
//! println!("{} rows from {} (tried {:?})", result.row_count(), result.dataflow_used, result.tried());
//! unicef_sdmx::storage::save_csv(&result, "wash_urban.csv")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod metadata;
pub mod models;
pub mod parser;
pub mod query_key;
pub mod resolver;
pub mod storage;

pub use client::{HttpTransport, SdmxTransport};
pub use config::Settings;
pub use error::SdmxError;
pub use fetch::{Attempt, AttemptOutcome, FetchEngine, FetchOptions, FetchRequest};
pub use metadata::MetadataStore;
pub use models::{DataflowId, FetchResult, IndicatorCode, QueryKey, YearRange};
pub use query_key::{Filters, KeyMode, SchemaKeyBuilder};
pub use resolver::{IndicatorResolver, UNIVERSAL_DATAFLOW};
