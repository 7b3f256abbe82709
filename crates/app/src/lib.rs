//! argus — multi-camera AI surveillance pipeline.
//!
//! Live frames are pulled per camera, described by a vision model, tracked
//! against per-directive baselines, interpreted by a reasoning model, and
//! classified into immediate or consolidated alerts fanned out to UI clients.

pub mod pipeline;
