//! Core orchestration for the Rivet PBX

pub mod engine;
pub mod pbx;

pub use engine::SignalingEngine;
pub use pbx::{PbxCore, PbxEvent};
