//! Container writers
//!
//! `ts` packetizes elementary streams into MPEG-TS; `fmp4` writes CMAF
//! init and media segments; `adapter` bridges buffered samples into the
//! writers' expected forms and harvests codec parameters.

pub mod adapter;
pub mod fmp4;
pub mod ts;

pub use adapter::Fmp4Adapter;
pub use fmp4::{FragSample, InitSegment};
pub use ts::TsMuxer;
