use std::io::{Read, Seek};

use log::warn;

use crate::bits::BitReader;
use crate::mp4;
use crate::{Error, StreamInfo};

/// Longest unary prefix a Rice code may carry before the value is stored as
/// a plain fixed-width field instead.
const RICE_THRESHOLD: u32 = 8;

/// End-of-frame signature, present before byte alignment.
const FRAME_SIGNATURE: u32 = 0b111;

/// One channel's subframe parameters.
///
/// The coefficient table is rewritten at every header parse and then mutated
/// in place by the predictor's adaptation loop, so it carries state from one
/// sample to the next within a frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubframeHeader {
    /// Only type 0 (adaptive LPC) exists in practice; anything else fails
    /// the frame.
    pub prediction_type: u8,
    /// Right-shift applied to the LPC accumulator.
    pub lpc_quant: u8,
    /// Carried for diagnostics; the decoder itself never consumes it.
    pub rice_modifier: u8,
    /// Signed 16-bit coefficients, most recent tap first.
    pub lpc_coefs: Vec<i32>,
}

struct FrameHeader {
    channels: u8,
    has_size: bool,
    wasted_bits: u8,
    is_not_compressed: bool,
    output_samples: u32,
}

/// One decoded frame of PCM audio.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    channels: u8,
    bits_per_sample: u8,
    samples: Vec<i32>,
}

impl Frame {
    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn bits_per_sample(&self) -> u8 {
        self.bits_per_sample
    }

    /// Number of PCM frames (per-channel samples) held.
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels)
    }

    /// Channel-interleaved samples: `samples()[i * channels + ch]` is sample
    /// `i` of channel `ch`.
    pub fn samples(&self) -> &[i32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<i32> {
        self.samples
    }
}

/// A structural description of one frame, as produced by
/// [`Decoder::analyze_frame`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameInfo {
    pub channels: u8,
    pub has_size: bool,
    pub wasted_bits: u8,
    pub is_not_compressed: bool,
    pub output_samples: u32,
    pub body: FrameBody,
}

/// The per-frame payload behind the fixed header fields.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FrameBody {
    /// Raw interleaved samples, one `Vec` per channel.
    Uncompressed { samples: Vec<Vec<i32>> },
    /// Everything the compressed path parses before prediction runs.
    Compressed {
        interlacing_shift: u8,
        interlacing_leftweight: u8,
        subframes: Vec<SubframeHeader>,
        wasted_bits_samples: Vec<Vec<i32>>,
        residuals: Vec<Vec<i32>>,
    },
}

/// Decodes the ALAC frame stream inside an MP4 `mdat` atom.
///
/// The decoder owns the byte source for its lifetime. Frames must be decoded
/// in order: the subframe coefficient tables carry adaptation state, so
/// skipping or repeating a frame desynchronises prediction.
pub struct Decoder<R: Read + Seek> {
    stream: StreamInfo,
    reader: BitReader<R>,
    samples: Vec<Vec<i32>>,
    subframe_samples: Vec<Vec<i32>>,
    residuals: Vec<Vec<i32>>,
    wasted_bits_samples: Vec<Vec<i32>>,
    subframe_headers: Vec<SubframeHeader>,
}

impl<R: Read + Seek> Decoder<R> {
    /// Walks `reader` to the start of the `mdat` payload and prepares the
    /// per-channel buffers.
    ///
    /// `reader` must be positioned at the head of the container.
    pub fn new(mut reader: R, info: StreamInfo) -> Result<Decoder<R>, Error> {
        if info.channels < 1 || info.channels > 8 {
            return Err(Error::Format("unsupported channel count"));
        }
        if info.bits_per_sample < 1 || info.bits_per_sample > 32 {
            return Err(Error::Format("unsupported bit depth"));
        }

        mp4::seek_mdat(&mut reader)?;

        let channels = usize::from(info.channels);
        let capacity = info.max_samples_per_frame as usize;
        let subframe_headers = (0..channels)
            .map(|_| SubframeHeader {
                prediction_type: 0,
                lpc_quant: 0,
                rice_modifier: 0,
                lpc_coefs: Vec::with_capacity(8),
            })
            .collect();

        Ok(Decoder {
            stream: info,
            reader: BitReader::new(reader),
            samples: channel_buffers(channels, capacity),
            subframe_samples: channel_buffers(channels, capacity),
            residuals: channel_buffers(channels, capacity),
            wasted_bits_samples: channel_buffers(channels, capacity),
            subframe_headers,
        })
    }

    pub fn stream_info(&self) -> &StreamInfo {
        &self.stream
    }

    pub fn sample_rate(&self) -> u32 {
        self.stream.sample_rate
    }

    pub fn channels(&self) -> u8 {
        self.stream.channels
    }

    pub fn channel_mask(&self) -> u32 {
        self.stream.channel_mask
    }

    pub fn bits_per_sample(&self) -> u8 {
        self.stream.bits_per_sample
    }

    /// Returns the underlying byte source.
    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }

    /// Decodes the next frame, or returns `Ok(None)` once the stream's
    /// declared frame total is exhausted.
    ///
    /// Errors abandon the frame; because bit alignment is lost with it, the
    /// caller should stop decoding the stream.
    pub fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        if self.stream.total_frames < 1 {
            return Ok(None);
        }

        let channels = usize::from(self.stream.channels);
        for buf in &mut self.samples {
            buf.clear();
        }

        let header = read_frame_header(&mut self.reader, self.stream.max_samples_per_frame)?;
        if header.channels != self.stream.channels {
            return Err(Error::Format(
                "frame header's channel count does not match the stream's",
            ));
        }

        if header.is_not_compressed {
            // Raw samples are interleaved by sample index, then channel.
            for _ in 0..header.output_samples {
                for ch in 0..channels {
                    let sample = self
                        .reader
                        .read_signed_bits(u32::from(self.stream.bits_per_sample))?;
                    self.samples[ch].push(sample);
                }
            }
        } else {
            let interlacing_shift = self.reader.read_bits(8)?;
            let interlacing_leftweight = self.reader.read_bits(8)? as i32;
            if channels == 2 && interlacing_leftweight != 0 && interlacing_shift > 31 {
                return Err(Error::Format("invalid interlacing shift"));
            }

            for ch in 0..channels {
                read_subframe_header(&mut self.reader, &mut self.subframe_headers[ch])?;
                if self.subframe_headers[ch].prediction_type != 0 {
                    return Err(Error::Format("unsupported prediction type"));
                }
            }

            if header.wasted_bits > 0 {
                read_wasted_bits(
                    &mut self.reader,
                    &mut self.wasted_bits_samples,
                    header.output_samples,
                    u32::from(header.wasted_bits) * 8,
                )?;
            }

            let sample_size = residual_sample_size(&self.stream, header.wasted_bits)?;
            for ch in 0..channels {
                read_residuals(
                    &mut self.reader,
                    &mut self.residuals[ch],
                    header.output_samples as usize,
                    sample_size,
                    self.stream.initial_history,
                    self.stream.history_multiplier,
                    self.stream.maximum_k,
                )?;
            }

            for ch in 0..channels {
                let subframe = &mut self.subframe_headers[ch];
                predict_subframe(
                    &mut self.subframe_samples[ch],
                    &self.residuals[ch],
                    &mut subframe.lpc_coefs,
                    u32::from(subframe.lpc_quant),
                )?;
            }

            decorrelate_channels(
                &mut self.samples,
                &self.subframe_samples,
                interlacing_shift,
                interlacing_leftweight,
            );

            if header.wasted_bits > 0 {
                merge_wasted_bits(
                    &mut self.samples,
                    &self.wasted_bits_samples,
                    u32::from(header.wasted_bits) * 8,
                );
            }
        }

        self.finish_frame()?;

        let frames = self.samples[0].len();
        let mut interleaved = vec![0i32; frames * channels];
        for (ch, channel) in self.samples.iter().enumerate() {
            for (i, &sample) in channel.iter().enumerate() {
                interleaved[i * channels + ch] = sample;
            }
        }
        self.stream.total_frames -= frames as i64;

        Ok(Some(Frame {
            channels: self.stream.channels,
            bits_per_sample: self.stream.bits_per_sample,
            samples: interleaved,
        }))
    }

    /// Parses the next frame and returns its structure without predicting or
    /// decorrelating anything.
    ///
    /// Consumes exactly the bits a full decode through residuals would, so
    /// analysis and decoding may not be interleaved on one stream without
    /// accounting for the skipped coefficient adaptation.
    pub fn analyze_frame(&mut self) -> Result<Option<FrameInfo>, Error> {
        if self.stream.total_frames < 1 {
            return Ok(None);
        }

        let channels = usize::from(self.stream.channels);
        let header = read_frame_header(&mut self.reader, self.stream.max_samples_per_frame)?;

        let body = if header.is_not_compressed {
            for buf in &mut self.samples {
                buf.clear();
            }
            for _ in 0..header.output_samples {
                for ch in 0..channels {
                    let sample = self
                        .reader
                        .read_signed_bits(u32::from(self.stream.bits_per_sample))?;
                    self.samples[ch].push(sample);
                }
            }
            FrameBody::Uncompressed { samples: self.samples.clone() }
        } else {
            let interlacing_shift = self.reader.read_bits(8)? as u8;
            let interlacing_leftweight = self.reader.read_bits(8)? as u8;

            for ch in 0..channels {
                read_subframe_header(&mut self.reader, &mut self.subframe_headers[ch])?;
            }

            for buf in &mut self.wasted_bits_samples {
                buf.clear();
            }
            if header.wasted_bits > 0 {
                read_wasted_bits(
                    &mut self.reader,
                    &mut self.wasted_bits_samples,
                    header.output_samples,
                    u32::from(header.wasted_bits) * 8,
                )?;
            }

            let sample_size = residual_sample_size(&self.stream, header.wasted_bits)?;
            for ch in 0..channels {
                read_residuals(
                    &mut self.reader,
                    &mut self.residuals[ch],
                    header.output_samples as usize,
                    sample_size,
                    self.stream.initial_history,
                    self.stream.history_multiplier,
                    self.stream.maximum_k,
                )?;
            }

            FrameBody::Compressed {
                interlacing_shift,
                interlacing_leftweight,
                subframes: self.subframe_headers.clone(),
                wasted_bits_samples: self.wasted_bits_samples.clone(),
                residuals: self.residuals.clone(),
            }
        };

        self.finish_frame()?;
        self.stream.total_frames -= i64::from(header.output_samples);

        Ok(Some(FrameInfo {
            channels: header.channels,
            has_size: header.has_size,
            wasted_bits: header.wasted_bits,
            is_not_compressed: header.is_not_compressed,
            output_samples: header.output_samples,
            body,
        }))
    }

    /// Iterator over the remaining frames.
    pub fn frames(&mut self) -> Frames<'_, R> {
        Frames { decoder: self }
    }

    /// Checks the end-of-frame signature and realigns to a byte boundary.
    fn finish_frame(&mut self) -> Result<(), Error> {
        if self.reader.read_bits(3)? != FRAME_SIGNATURE {
            return Err(Error::Format("invalid signature at end of frame"));
        }
        self.reader.byte_align();
        Ok(())
    }
}

/// Iterator returned by [`Decoder::frames`].
pub struct Frames<'a, R: Read + Seek> {
    decoder: &'a mut Decoder<R>,
}

impl<'a, R: Read + Seek> Iterator for Frames<'a, R> {
    type Item = Result<Frame, Error>;

    fn next(&mut self) -> Option<Result<Frame, Error>> {
        self.decoder.read_frame().transpose()
    }
}

fn channel_buffers(channels: usize, capacity: usize) -> Vec<Vec<i32>> {
    (0..channels).map(|_| Vec::with_capacity(capacity)).collect()
}

/// Residuals are coded in `bits_per_sample` reduced by the wasted bits and
/// widened by one bit per extra channel; the stream's channel count is what
/// counts, not the frame header's.
fn residual_sample_size(stream: &StreamInfo, wasted_bits: u8) -> Result<u32, Error> {
    let size = i32::from(stream.bits_per_sample) - 8 * i32::from(wasted_bits)
        + i32::from(stream.channels)
        - 1;
    if size < 1 || size > 32 {
        return Err(Error::Format("invalid residual bit width"));
    }
    Ok(size as u32)
}

fn read_frame_header<R: Read>(
    reader: &mut BitReader<R>,
    max_samples_per_frame: u32,
) -> Result<FrameHeader, Error> {
    let channels = reader.read_bits(3)? as u8 + 1;
    // 16 reserved bits.
    reader.read_bits(16)?;
    let has_size = reader.read_bit()?;
    let wasted_bits = reader.read_bits(2)? as u8;
    let is_not_compressed = reader.read_bit()?;
    let output_samples = if has_size {
        // The final frame of a stream carries its own shorter length.
        reader.read_bits(32)?
    } else {
        max_samples_per_frame
    };
    if output_samples > max_samples_per_frame {
        return Err(Error::Format("frame length exceeds the stream maximum"));
    }

    Ok(FrameHeader { channels, has_size, wasted_bits, is_not_compressed, output_samples })
}

fn read_subframe_header<R: Read>(
    reader: &mut BitReader<R>,
    header: &mut SubframeHeader,
) -> Result<(), Error> {
    header.prediction_type = reader.read_bits(4)? as u8;
    header.lpc_quant = reader.read_bits(4)? as u8;
    header.rice_modifier = reader.read_bits(3)? as u8;
    let coef_count = reader.read_bits(5)?;
    header.lpc_coefs.clear();
    for _ in 0..coef_count {
        header.lpc_coefs.push(reader.read_signed_bits(16)?);
    }
    Ok(())
}

/// Reads the block of stripped low-order sample bits that precedes the
/// residuals, interleaved by sample index then channel.
fn read_wasted_bits<R: Read>(
    reader: &mut BitReader<R>,
    wasted_bits_samples: &mut [Vec<i32>],
    sample_count: u32,
    wasted_bits_size: u32,
) -> Result<(), Error> {
    for buf in wasted_bits_samples.iter_mut() {
        buf.clear();
    }
    for _ in 0..sample_count {
        for ch in 0..wasted_bits_samples.len() {
            let bits = reader.read_bits(wasted_bits_size)?;
            wasted_bits_samples[ch].push(bits as i32);
        }
    }
    Ok(())
}

/// `-1` for zero, otherwise the index of the highest set bit.
#[inline(always)]
fn log2_floor(val: i32) -> i32 {
    debug_assert!(val >= 0);
    if val == 0 {
        -1
    } else {
        31 - val.leading_zeros() as i32
    }
}

/// Reads one unsigned Rice value.
///
/// The unary prefix is capped at `RICE_THRESHOLD`; past it, the value is a
/// plain `sample_size`-bit field. For `k > 1` the remainder reserves its two
/// smallest codes for an implicit zero, which costs one over-read bit that is
/// pushed back onto the stream.
#[inline]
fn read_residual<R: Read>(
    reader: &mut BitReader<R>,
    k: u32,
    sample_size: u32,
) -> Result<u32, Error> {
    let mut x: u32 = 0;
    while x <= RICE_THRESHOLD && reader.read_bit()? {
        x += 1;
    }

    if x > RICE_THRESHOLD {
        x = reader.read_bits(sample_size)?;
    } else if k > 1 {
        x *= (1 << k) - 1;
        let extrabits = reader.read_bits(k)?;
        if extrabits > 1 {
            x += extrabits - 1;
        } else {
            reader.unread_bit(extrabits == 1);
        }
    }

    Ok(x)
}

/// Decodes exactly `residual_count` signed residuals.
///
/// The Rice parameter adapts through `history`, a running magnitude estimate
/// seeded from `initial_history`; when it decays below 128 a run of zero
/// residuals may follow in compressed form.
fn read_residuals<R: Read>(
    reader: &mut BitReader<R>,
    residuals: &mut Vec<i32>,
    residual_count: usize,
    sample_size: u32,
    initial_history: u16,
    history_multiplier: u8,
    maximum_k: u8,
) -> Result<(), Error> {
    let history_multiplier = i32::from(history_multiplier);
    let mut history = i32::from(initial_history);
    let mut sign_modifier: u32 = 0;

    residuals.clear();

    let mut i = 0;
    while i < residual_count {
        let k = log2_floor((history >> 9) + 3).min(i32::from(maximum_k)) as u32;

        let decoded = read_residual(reader, k, sample_size)?.wrapping_add(sign_modifier);

        let mut residual = (decoded.wrapping_add(1) >> 1) as i32;
        if decoded & 1 != 0 {
            residual = -residual;
        }
        residuals.push(residual);

        sign_modifier = 0;
        if decoded > 0xFFFF {
            history = 0xFFFF;
        } else {
            history +=
                decoded as i32 * history_multiplier - ((history * history_multiplier) >> 9);
        }

        // A small history hints at a run of zeros stored as a single length.
        if history < 128 && i + 1 < residual_count {
            let k = (7 - log2_floor(history) + (history + 16) / 64)
                .min(i32::from(maximum_k)) as u32;
            let block_size = read_residual(reader, k, 16)?;
            if block_size > 0 {
                if block_size as usize > residual_count - i - 1 {
                    return Err(Error::Format("zero run extends past the frame"));
                }
                for _ in 0..block_size {
                    residuals.push(0);
                }
                i += block_size as usize;
            }
            if block_size <= 0xFFFF {
                sign_modifier = 1;
            }
            history = 0;
        }

        i += 1;
    }

    Ok(())
}

/// Rebuilds one channel's samples from its residuals, adapting the
/// coefficients as it goes.
fn predict_subframe(
    samples: &mut Vec<i32>,
    residuals: &[i32],
    coefficients: &mut [i32],
    lpc_quant: u32,
) -> Result<(), Error> {
    let order = coefficients.len();
    if order < 1 {
        return Err(Error::Format("subframe has no predictor coefficients"));
    }
    if order != 4 && order != 8 {
        warn!("predictor order {} is not 4 or 8", order);
    }

    samples.clear();
    if residuals.is_empty() {
        return Ok(());
    }

    // The first sample arrives verbatim; the next `order` samples are deltas
    // against their predecessor.
    samples.push(residuals[0]);
    for i in 1..(order + 1).min(residuals.len()) {
        let sample = residuals[i].wrapping_add(samples[i - 1]);
        samples.push(sample);
    }

    for i in (order + 1)..residuals.len() {
        // One sample ahead of the filter taps is held out of the sum and
        // re-added after the shift, keeping the accumulator small.
        let base = samples[i - order - 1];

        // Written as a shift pair so a quant of 0 contributes no bias.
        let mut lpc_sum: i64 = (1i64 << lpc_quant) >> 1;
        for j in 0..order {
            lpc_sum += i64::from(coefficients[j]) * (i64::from(samples[i - j - 1]) - i64::from(base));
        }
        lpc_sum >>= lpc_quant;
        lpc_sum += i64::from(base);

        let mut residual = residuals[i];
        samples.push((i64::from(residual) + lpc_sum) as i32);

        // Walk the taps newest-first, nudging each coefficient one step
        // against the error and attenuating the error as we go.
        if residual != 0 {
            let original_sign = residual.signum();
            for j in 0..order {
                let val = base.wrapping_sub(samples[i - order + j]);
                let sign = if original_sign >= 0 { val.signum() } else { -val.signum() };
                coefficients[order - j - 1] -= sign;
                residual = residual
                    .wrapping_sub((val.wrapping_mul(sign) >> lpc_quant).wrapping_mul(j as i32 + 1));
                if residual.signum() != original_sign {
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Undoes the joint-stereo transform. Any channel count other than 2 passes
/// through untouched, as does a left weight of 0.
fn decorrelate_channels(
    output: &mut [Vec<i32>],
    input: &[Vec<i32>],
    interlacing_shift: u32,
    interlacing_leftweight: i32,
) {
    if input.len() != 2 {
        for (out, channel) in output.iter_mut().zip(input) {
            out.clear();
            out.extend_from_slice(channel);
        }
        return;
    }

    let channel0 = &input[0];
    let channel1 = &input[1];
    let (left, right) = output.split_at_mut(1);
    let left = &mut left[0];
    let right = &mut right[0];
    left.clear();
    right.clear();

    if interlacing_leftweight == 0 {
        left.extend_from_slice(channel0);
        right.extend_from_slice(channel1);
        return;
    }

    for i in 0..channel0.len() {
        let r = channel0[i]
            .wrapping_sub(channel1[i].wrapping_mul(interlacing_leftweight) >> interlacing_shift);
        right.push(r);
        left.push(channel1[i].wrapping_add(r));
    }
}

/// Re-attaches the stripped low-order bits to every sample.
fn merge_wasted_bits(samples: &mut [Vec<i32>], wasted_bits_samples: &[Vec<i32>], shift: u32) {
    for (channel, wasted) in samples.iter_mut().zip(wasted_bits_samples) {
        for (sample, &bits) in channel.iter_mut().zip(wasted) {
            *sample = (*sample << shift) | bits;
        }
    }
}
