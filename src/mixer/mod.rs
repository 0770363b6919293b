//! Speech-over-music mixing through an external mixing engine.
//!
//! - `ducking`: gain policy and the live, timed background gain
//! - `filter`: mixing-engine command lines
//! - `orchestrator`: builds one pipeline per request, with fallbacks
//! - `stream`: chunked reader that owns the pipeline's processes

pub mod ducking;
pub mod filter;
pub mod orchestrator;
pub mod stream;

pub use ducking::{DuckingController, GainPolicy, MixParameters, compute_mix_parameters};
pub use filter::MixMode;
pub use orchestrator::{MixOrchestrator, MixRequest, MixerSettings};
pub use stream::MixStream;
