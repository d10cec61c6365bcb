//! Common types shared across the pmr relay stack.
//!
//! This crate provides:
//! - JSON frame classification and encoding ([`frame`])
//! - Protocol constants and timestamp helpers ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod frame;
pub mod types;

pub use frame::{ClientFrame, Forwarded, FrameError, Reply, ServerFrame};
pub use types::Username;
