//! Minimal AVI (RIFF) container for Motion-JPEG clips.
//!
//! One video stream, every frame a keyframe, with a legacy `idx1` index so
//! players can seek. The frame rate is stored as `dwRate / dwScale` with a
//! scale of 1, and again as `dwMicroSecPerFrame` in the main header.

use anyhow::{anyhow, Context, Result};
use std::io::Write;

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;

const MAIN_HEADER_LEN: u32 = 56;
const STREAM_HEADER_LEN: u32 = 56;
const BITMAP_INFO_LEN: u32 = 40;
/// `strl` list payload: type tag, `strh` chunk, `strf` chunk.
const STRL_LEN: u32 = 4 + (8 + STREAM_HEADER_LEN) + (8 + BITMAP_INFO_LEN);
/// `hdrl` list payload: type tag, `avih` chunk, `strl` list.
const HDRL_LEN: u32 = 4 + (8 + MAIN_HEADER_LEN) + (8 + STRL_LEN);

/// Shape of the video stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AviStream {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Write `jpegs` as an MJPEG AVI. Each entry is one complete JPEG image.
pub fn write_mjpeg_avi<W: Write>(writer: &mut W, stream: AviStream, jpegs: &[Vec<u8>]) -> Result<()> {
    if jpegs.is_empty() {
        return Err(anyhow!("an AVI clip needs at least one frame"));
    }
    let fps = stream.fps.max(1);
    let frames = to_u32(jpegs.len())?;
    let largest = to_u32(jpegs.iter().map(Vec::len).max().unwrap_or(0))?;

    let mut movi_len: u32 = 4;
    for jpeg in jpegs {
        movi_len = movi_len
            .checked_add(8 + padded_len(jpeg)?)
            .ok_or_else(too_large)?;
    }
    let idx1_len = frames.checked_mul(16).ok_or_else(too_large)?;
    let riff_len = [HDRL_LEN + 8, movi_len, 8, idx1_len]
        .into_iter()
        .try_fold(4u32, |total, part| total.checked_add(part))
        .and_then(|total| total.checked_add(8))
        .ok_or_else(too_large)?;

    let mut out = Vec::with_capacity(HDRL_LEN as usize + 32);
    out.extend_from_slice(b"RIFF");
    put_u32(&mut out, riff_len);
    out.extend_from_slice(b"AVI ");

    out.extend_from_slice(b"LIST");
    put_u32(&mut out, HDRL_LEN);
    out.extend_from_slice(b"hdrl");

    out.extend_from_slice(b"avih");
    put_u32(&mut out, MAIN_HEADER_LEN);
    put_u32(&mut out, 1_000_000 / fps);
    put_u32(&mut out, largest.saturating_mul(fps)); // max bytes per second
    put_u32(&mut out, 0); // padding granularity
    put_u32(&mut out, AVIF_HASINDEX);
    put_u32(&mut out, frames);
    put_u32(&mut out, 0); // initial frames
    put_u32(&mut out, 1); // streams
    put_u32(&mut out, largest);
    put_u32(&mut out, stream.width);
    put_u32(&mut out, stream.height);
    out.extend_from_slice(&[0; 16]);

    out.extend_from_slice(b"LIST");
    put_u32(&mut out, STRL_LEN);
    out.extend_from_slice(b"strl");

    out.extend_from_slice(b"strh");
    put_u32(&mut out, STREAM_HEADER_LEN);
    out.extend_from_slice(b"vids");
    out.extend_from_slice(b"MJPG");
    put_u32(&mut out, 0); // flags
    put_u16(&mut out, 0); // priority
    put_u16(&mut out, 0); // language
    put_u32(&mut out, 0); // initial frames
    put_u32(&mut out, 1); // scale
    put_u32(&mut out, fps); // rate
    put_u32(&mut out, 0); // start
    put_u32(&mut out, frames);
    put_u32(&mut out, largest);
    put_u32(&mut out, u32::MAX); // default quality
    put_u32(&mut out, 0); // sample size varies
    put_u16(&mut out, 0);
    put_u16(&mut out, 0);
    put_u16(&mut out, clamp_u16(stream.width));
    put_u16(&mut out, clamp_u16(stream.height));

    out.extend_from_slice(b"strf");
    put_u32(&mut out, BITMAP_INFO_LEN);
    put_u32(&mut out, BITMAP_INFO_LEN);
    put_u32(&mut out, stream.width);
    put_u32(&mut out, stream.height);
    put_u16(&mut out, 1); // planes
    put_u16(&mut out, 24); // bits per pixel
    out.extend_from_slice(b"MJPG");
    put_u32(&mut out, stream.width.saturating_mul(stream.height).saturating_mul(3));
    out.extend_from_slice(&[0; 16]);

    out.extend_from_slice(b"LIST");
    put_u32(&mut out, movi_len);
    out.extend_from_slice(b"movi");
    writer.write_all(&out).context("write AVI header")?;

    // idx1 offsets are relative to the `movi` tag
    let mut index = Vec::with_capacity(idx1_len as usize + 8);
    index.extend_from_slice(b"idx1");
    put_u32(&mut index, idx1_len);
    let mut offset: u32 = 4;
    for jpeg in jpegs {
        let len = to_u32(jpeg.len())?;
        let mut chunk_header = Vec::with_capacity(8);
        chunk_header.extend_from_slice(b"00dc");
        put_u32(&mut chunk_header, len);
        writer.write_all(&chunk_header).context("write AVI frame")?;
        writer.write_all(jpeg).context("write AVI frame")?;
        if len % 2 == 1 {
            writer.write_all(&[0]).context("write AVI frame")?;
        }

        index.extend_from_slice(b"00dc");
        put_u32(&mut index, AVIIF_KEYFRAME);
        put_u32(&mut index, offset);
        put_u32(&mut index, len);
        offset += 8 + padded_len(jpeg)?;
    }
    writer.write_all(&index).context("write AVI index")?;
    Ok(())
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn clamp_u16(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

fn padded_len(chunk: &[u8]) -> Result<u32> {
    let len = to_u32(chunk.len())?;
    len.checked_add(len % 2).ok_or_else(too_large)
}

fn to_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| too_large())
}

fn too_large() -> anyhow::Error {
    anyhow!("clip exceeds the 4 GiB AVI limit")
}
