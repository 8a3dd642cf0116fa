//! MP4/H.264 clip encoder using FFmpeg.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use std::path::Path;
use std::sync::Arc;

use super::encoder::ClipEncoder;
use crate::frame::Frame;

#[derive(Debug)]
pub struct Mp4ClipEncoder;

impl Mp4ClipEncoder {
    /// Fails when FFmpeg was built without an H.264 encoder.
    pub fn new() -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        h264()?;
        Ok(Self)
    }
}

fn h264() -> Result<ffmpeg::Codec> {
    ffmpeg::encoder::find(ffmpeg::codec::Id::H264)
        .ok_or_else(|| anyhow!("ffmpeg has no H.264 encoder"))
}

impl ClipEncoder for Mp4ClipEncoder {
    fn extension(&self) -> &'static str {
        "mp4"
    }

    fn encode(&self, frames: &[Arc<Frame>], fps: u32, path: &Path) -> Result<()> {
        let first = frames.first().ok_or_else(|| anyhow!("clip has no frames"))?;
        // H.264 with 4:2:0 chroma needs even dimensions.
        let width = first.width & !1;
        let height = first.height & !1;
        if width == 0 || height == 0 {
            return Err(anyhow!("frame too small for H.264: {}x{}", first.width, first.height));
        }
        let fps = fps.max(1) as i32;
        let codec = h264()?;

        let mut octx = ffmpeg::format::output_as(&path, "mp4")
            .with_context(|| format!("open mp4 output {}", path.display()))?;
        let global_header = octx
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let mut stream = octx.add_stream(codec).context("add video stream")?;
        let stream_index = stream.index();

        let mut config = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("create H.264 encoder")?;
        config.set_width(width);
        config.set_height(height);
        config.set_format(ffmpeg::format::Pixel::YUV420P);
        config.set_time_base(ffmpeg::Rational(1, fps));
        config.set_frame_rate(Some(ffmpeg::Rational(fps, 1)));
        if global_header {
            config.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let mut encoder = config.open_as(codec).context("open H.264 encoder")?;
        stream.set_parameters(&encoder);
        stream.set_time_base(ffmpeg::Rational(1, fps));

        octx.write_header().context("write mp4 header")?;
        let stream_time_base = octx
            .stream(stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| anyhow!("mp4 stream vanished"))?;

        let mut scaler = ffmpeg::software::scaling::Context::get(
            ffmpeg::format::Pixel::RGB24,
            width,
            height,
            ffmpeg::format::Pixel::YUV420P,
            width,
            height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        let mut rgb = ffmpeg::frame::Video::new(ffmpeg::format::Pixel::RGB24, width, height);
        let mut pts = 0i64;
        for frame in frames {
            if frame.width < width || frame.height < height {
                log::warn!(
                    "skipping {}x{} frame {} in {}x{} clip",
                    frame.width,
                    frame.height,
                    frame.sequence,
                    width,
                    height
                );
                continue;
            }
            copy_into(&mut rgb, frame, width, height);

            let mut yuv = ffmpeg::frame::Video::empty();
            scaler.run(&rgb, &mut yuv).context("convert frame to YUV")?;
            yuv.set_pts(Some(pts));
            pts += 1;

            encoder.send_frame(&yuv).context("send frame to encoder")?;
            drain(&mut encoder, &mut octx, stream_index, fps, stream_time_base)?;
        }

        encoder.send_eof().context("flush encoder")?;
        drain(&mut encoder, &mut octx, stream_index, fps, stream_time_base)?;
        octx.write_trailer().context("write mp4 trailer")?;
        Ok(())
    }
}

fn copy_into(dst: &mut ffmpeg::frame::Video, frame: &Frame, width: u32, height: u32) {
    let stride = dst.stride(0);
    let src_row = frame.width as usize * 3;
    let row_bytes = width as usize * 3;
    let data = dst.data_mut(0);
    for row in 0..height as usize {
        let src = &frame.pixels()[row * src_row..row * src_row + row_bytes];
        data[row * stride..row * stride + row_bytes].copy_from_slice(src);
    }
}

fn drain(
    encoder: &mut ffmpeg::encoder::Video,
    octx: &mut ffmpeg::format::context::Output,
    stream_index: usize,
    fps: i32,
    stream_time_base: ffmpeg::Rational,
) -> Result<()> {
    let mut packet = ffmpeg::Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(stream_index);
        packet.rescale_ts(ffmpeg::Rational(1, fps), stream_time_base);
        packet
            .write_interleaved(octx)
            .context("write mp4 packet")?;
    }
    Ok(())
}
