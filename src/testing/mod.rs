//! Test support utilities

pub mod mocks;

pub use mocks::{ControlCall, MockTopicControl};
