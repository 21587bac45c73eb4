//! Data models for FacilityWatch

mod alert;
mod rule;
mod sensor;
mod work_order;

pub use alert::*;
pub use rule::*;
pub use sensor::*;
pub use work_order::*;
