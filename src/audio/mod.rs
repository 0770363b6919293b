//! Audio primitives: playback position, formats, and WAV helpers.

pub mod clock;
pub mod format;
pub mod wav;
