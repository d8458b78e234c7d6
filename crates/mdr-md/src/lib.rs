//! mdr-md
//!
//! Market-data source adapters and the per-source Transform.
//!
//! - [`provider`]: the [`SourceAdapter`] trait and [`FetchError`].
//! - [`http_source`]: CoinPaprika-shaped ticker endpoint.
//! - [`csv_source`]: local CSV file.
//! - [`transform`]: raw payload → [`mdr_schemas::Candidate`].

pub mod csv_source;
pub mod http_source;
pub mod normalize;
pub mod provider;
pub mod transform;

pub use csv_source::CsvFileSource;
pub use http_source::HttpTickerSource;
pub use provider::{FetchError, SourceAdapter};
pub use transform::{transform, TransformError};
