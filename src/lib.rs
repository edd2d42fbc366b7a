//! detstream Library
//!
//! Live video detection sessions with real-time WebSocket fan-out
//!
//! ## Architecture (7 Components)
//!
//! 1. StreamSource - Frame ingestion from one live feed
//! 2. FrameTransform - Resize, overlay and JPEG encoding
//! 3. Detector - Object detection adapter
//! 4. SessionRegistry - SSoT for session state
//! 5. ConnectionHub - Per-session subscriber fan-out
//! 6. AnalysisPipeline - Per-session read → detect → broadcast loop
//! 7. AnalysisService / WebAPI - Session control and subscriber endpoint
//!
//! ## Data flow
//!
//! StreamSource → AnalysisPipeline → ConnectionHub → subscribers

pub mod analysis_pipeline;
pub mod analysis_service;
pub mod connection_hub;
pub mod detector;
pub mod frame_transform;
pub mod session_registry;
pub mod stream_source;
pub mod web_api;
pub mod models;
pub mod error;
pub mod state;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
pub use state::AppState;
