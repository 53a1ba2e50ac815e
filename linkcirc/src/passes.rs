//! Analysis passes over linked circuits.

pub mod widgetize;
pub use widgetize::{widgetize_label, UnionResult, Widget, WidgetizeOptions, Widgetizer};
