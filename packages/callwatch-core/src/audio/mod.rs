//! Rolling audio storage and WAV materialization.

pub mod store;
pub mod wav;

pub use store::{AudioSnapshot, LiveAudioStore};
pub use wav::{create_wav_header, strip_wav_header};
