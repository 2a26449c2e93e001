//! `mercato-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model, and the reporting period arithmetic
//! that both the online and the offline read paths share.

pub mod error;
pub mod id;
pub mod period;

pub use error::{DomainError, DomainResult};
pub use id::{RecordId, SessionId};
pub use period::{PeriodKind, TimeRange, period_containing, period_range};
