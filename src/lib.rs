//! A decoder for the Apple Lossless Audio Codec (ALAC) frame stream found
//! in the `mdat` atom of an MP4 container.
//!
//! The container carries the static stream parameters out-of-band; callers
//! collect them into a [`StreamInfo`] and hand it to [`Decoder::new`]
//! together with the byte source. The decoder seeks to the `mdat` payload
//! itself and then produces one interleaved PCM [`Frame`] per call to
//! [`Decoder::read_frame`].
//!
//! ```no_run
//! use std::fs::File;
//! use std::io::BufReader;
//!
//! use alacdec::{Decoder, StreamInfo};
//!
//! # fn run(info: StreamInfo) -> Result<(), alacdec::Error> {
//! let file = BufReader::new(File::open("audio.m4a").unwrap());
//! let mut decoder = Decoder::new(file, info)?;
//! while let Some(frame) = decoder.read_frame()? {
//!     println!("{} samples", frame.samples().len());
//! }
//! # Ok(())
//! # }
//! ```

use std::error;
use std::fmt;
use std::io;

mod bits;
mod dec;
mod mp4;

pub use crate::dec::{Decoder, Frame, FrameBody, FrameInfo, Frames, SubframeHeader};

/// The static parameters of an ALAC stream.
///
/// These are carried by the container rather than the frame stream and must
/// be supplied before decoding begins. All frames of a stream share them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamInfo {
    pub sample_rate: u32,
    /// Channel count, 1 to 8.
    pub channels: u8,
    /// Speaker-position mask. Opaque to the decoder.
    pub channel_mask: u32,
    pub bits_per_sample: u8,
    /// PCM frames remaining in the stream. Decoding stops once this reaches 0.
    pub total_frames: i64,
    pub max_samples_per_frame: u32,
    /// `pb` in Apple's nomenclature: scales each residual's contribution to
    /// the history estimate.
    pub history_multiplier: u8,
    /// `mb` in Apple's nomenclature: the history value each frame's residual
    /// block starts from.
    pub initial_history: u16,
    /// `kb` in Apple's nomenclature: the largest permitted Rice parameter.
    pub maximum_k: u8,
}

/// Errors raised while locating or decoding the stream.
#[derive(Debug)]
pub enum Error {
    /// The byte source failed or ended mid-frame. Bit alignment is lost, so
    /// later frames cannot be recovered either.
    Io(io::Error),
    /// The frame stream violated the format: an unsupported prediction type,
    /// an empty coefficient table, a channel-count mismatch, or a missing
    /// end-of-frame signature.
    Format(&'static str),
    /// The container could not be walked to an `mdat` atom.
    Container(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Io(ref err) => write!(f, "IO error: {}", err),
            Error::Format(msg) => write!(f, "format error: {}", msg),
            Error::Container(msg) => write!(f, "container error: {}", msg),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Io(ref err) => Some(err),
            Error::Format(_) | Error::Container(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}
