//! RTSP connector.
//!
//! `RtspConnector` turns a `CameraSource` into an open `FrameSource`:
//! - `stub://` endpoints open a `SyntheticSource`
//! - everything else opens a GStreamer pipeline (feature: rtsp-gstreamer)
//!
//! The GStreamer pipeline forces TCP interleaved transport and bounds both the
//! RTSP handshake and every sample pull by the configured I/O timeout.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::Result;
#[cfg(feature = "rtsp-gstreamer")]
use gstreamer::prelude::*;
#[cfg(feature = "rtsp-gstreamer")]
use std::time::{Duration, Instant};

use super::synthetic::SyntheticSource;
use super::target::StreamTarget;
use super::{ConnectOptions, FrameSource, SourceConnector};
#[cfg(feature = "rtsp-gstreamer")]
use crate::frame::Frame;
use crate::CameraSource;

/// Default connector used by the daemon.
#[derive(Clone, Copy, Debug, Default)]
pub struct RtspConnector;

impl RtspConnector {
    pub fn new() -> Self {
        Self
    }
}

impl SourceConnector for RtspConnector {
    fn open(&self, source: &CameraSource, options: &ConnectOptions) -> Result<Box<dyn FrameSource>> {
        let target = StreamTarget::for_endpoint(&source.endpoint)?;
        if target.is_synthetic() {
            return Ok(Box::new(SyntheticSource::open(target.url(), options)?));
        }

        #[cfg(feature = "rtsp-gstreamer")]
        {
            Ok(Box::new(GstreamerSource::open(target, options)?))
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            anyhow::bail!("{}: RTSP requires the rtsp-gstreamer feature", target)
        }
    }
}

// ----------------------------------------------------------------------------
// GStreamer source
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerSource {
    description: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    read_timeout: Duration,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerSource {
    fn open(target: StreamTarget, options: &ConnectOptions) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let timeout_us = options.io_timeout.as_micros() as u64;
        let pipeline_description = format!(
            "rtspsrc name=src location=\"{}\" protocols=tcp latency=0 timeout={} tcp-timeout={} ! \
             decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            target.url(),
            timeout_us,
            timeout_us
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        if let Some(creds) = target.credentials() {
            let src = pipeline
                .by_name("src")
                .context("rtspsrc element missing from pipeline")?;
            src.set_property("user-id", creds.username.as_str());
            src.set_property("user-pw", creds.password.as_str());
        }

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let mut source = Self {
            description: target.to_string(),
            pipeline,
            appsink,
            read_timeout: options.io_timeout,
            frame_count: 0,
            last_frame_at: None,
        };
        source.start(options.io_timeout)?;
        Ok(source)
    }

    fn start(&mut self, timeout: Duration) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("{}: set RTSP pipeline to Playing", self.description))?;

        let (result, current, _pending) = self
            .pipeline
            .state(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64));
        result.with_context(|| format!("{}: RTSP handshake failed", self.description))?;
        if let Some(message) = self.bus_error() {
            anyhow::bail!("{}: {}", self.description, message);
        }
        log::info!("RtspSource: connected to {} (state {:?})", self.description, current);
        Ok(())
    }

    fn bus_error(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Some("gstreamer reached EOS".to_string()),
                _ => {}
            }
        }
        None
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl FrameSource for GstreamerSource {
    fn read_frame(&mut self) -> Result<Frame> {
        if let Some(message) = self.bus_error() {
            anyhow::bail!("{}: {}", self.description, message);
        }

        let timeout = gstreamer::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        let sample = self.appsink.try_pull_sample(timeout).ok_or_else(|| {
            let idle = self
                .last_frame_at
                .map(|at| format!(" (last frame {:?} ago)", at.elapsed()))
                .unwrap_or_default();
            anyhow::anyhow!("{}: RTSP stream stalled{}", self.description, idle)
        })?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Frame::new(pixels, width, height, self.frame_count)
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerSource {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("{}: failed to stop RTSP pipeline: {:?}", self.description, e);
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Endpoint, GeoPoint, SourceId};

    fn camera(url: &str) -> CameraSource {
        CameraSource {
            id: SourceId(1),
            endpoint: Endpoint::from_url(url),
            location: GeoPoint::default(),
        }
    }

    #[test]
    fn stub_endpoints_open_synthetic_sources() -> Result<()> {
        let options = ConnectOptions {
            expected_fps: 1000,
            ..ConnectOptions::default()
        };
        let mut source = RtspConnector::new().open(&camera("stub://dock?width=4&height=4"), &options)?;
        let frame = source.read_frame()?;
        assert_eq!(frame.width, 4);
        assert_eq!(source.describe(), "stub://dock");
        Ok(())
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn rtsp_without_gstreamer_is_an_open_error() {
        let result = RtspConnector::new().open(&camera("rtsp://cam.local/s0"), &ConnectOptions::default());
        assert!(result.is_err());
    }
}
