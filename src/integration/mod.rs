//! End-to-end scenarios
//!
//! These tests drive real sessions over in-process pipes: synthetic
//! MPEG-TS generated by the muxer feeds the demuxer, the shared buffer
//! and the format processors exactly as an upstream would.

mod e2e;
mod fixtures;
