//! # FacilityWatch
//!
//! Multi-tenant alert rule evaluation for facilities sensor data.
//!
//! FacilityWatch evaluates threshold rules that must hold continuously over a
//! window of sensor readings, keeps at most one live alert per asset and rule,
//! and drives alerts through acknowledgment, work orders and resolution.
//!
//! ## Architecture
//!
//! - **Alerting**: threshold evaluator, rule matching and the lifecycle manager
//! - **Storage**: PostgreSQL for rules, alerts and readings; Redis for pub/sub
//! - **API**: REST administrative surface and a WebSocket event stream
//!
//! ## Quick Start
//!
//! ```bash
//! # Apply migrations
//! facilitywatch db migrate
//!
//! # Start the API and the evaluation scheduler
//! facilitywatch serve
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod alerting;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::alerting::{AlertLifecycleManager, NotificationSink, ThresholdEvaluator};
    pub use crate::config::Config;
    pub use crate::db::Database;
    pub use crate::error::{Error, Result};
    pub use crate::models::*;
}
