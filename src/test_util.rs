//! In-memory resources and stream recorders for exercising transfers without a transport

pub mod memory;
pub mod recording;
