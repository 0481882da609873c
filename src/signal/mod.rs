pub mod filters;
pub mod pattern;

pub use filters::{check_technical_filters, FilterVerdict};
pub use pattern::{detect_three_line_strike, PatternKind, PatternLevels};
