use clap::ValueEnum;

pub mod aggregate;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod parse;
pub mod schema;
pub mod space;
pub mod table;

pub use aggregate::Aggregator;
pub use config::CampaignConfig;
pub use dispatch::{DispatchOptions, Dispatcher, ProcessInvoker, SyntheticInvoker};
pub use error::{CampaignError, ConfigError, DispatchError, ParseError};
pub use space::{ExperimentSpace, MetricCategory, RunDescriptor};
pub use table::{Cell, MetricTable};

/// How a cell whose extraction failed is written to a table.
#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum SentinelMode {
    /// Failed cells are written as `NaN`, missing cells stay empty.
    #[default]
    Explicit,
    /// Failed extractions collapse to `0`, as historical tables did.
    Zero,
}
