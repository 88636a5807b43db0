//! Small helpers shared across modules

pub mod dates;

pub use dates::parse_time_point;
