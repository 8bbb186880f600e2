//! weatherdash - core of a weather station dashboard.
//!
//! - [`feed`]: rate-limited mirror of the public weather feed with
//!   retained history
//! - [`invoke`]: bounded JSON-over-stdio calls to external processes
//! - [`forecast`]: forecast model caller built on [`invoke`]
//! - [`dispatch`]: streaming text generation with retry, model fallback
//!   and cancellation

pub mod config;
pub mod dispatch;
pub mod feed;
pub mod forecast;
pub mod invoke;
pub mod series;

pub use config::{Config, ConfigError};
pub use dispatch::{DispatchError, Dispatcher, RequestKind};
pub use feed::{FeedCache, FeedSnapshot};
pub use forecast::{ForecastMode, Forecaster};
pub use invoke::{Invocation, InvocationError};
