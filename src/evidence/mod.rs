//! Evidence capture.
//!
//! On confirmation the recorder takes the ring buffer's pre-roll, keeps the
//! next N frames as post-roll, then writes the concatenation as one clip and
//! attaches it to the confirmed event. A JPEG snapshot of the confirming frame
//! is written alongside.

mod avi;
mod encoder;
#[cfg(feature = "clip-ffmpeg")]
mod ffmpeg;
mod recorder;
mod snapshot;

pub use encoder::{encoder_for, ClipEncoder, MjpegClipEncoder};
#[cfg(feature = "clip-ffmpeg")]
pub use ffmpeg::Mp4ClipEncoder;
pub use recorder::{
    clip_file_name, EvidenceRecorder, FinishedClip, RecorderSettings, RecordingStarted, Trigger,
};
pub use snapshot::{draw_bounding_box, write_snapshot};
