use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};
use url::Url;

use super::{ConnectOptions, FrameSource};
use crate::frame::Frame;

const DEFAULT_WIDTH: u32 = 320;
const DEFAULT_HEIGHT: u32 = 240;
const DEFAULT_SCENE_EVERY: u64 = 90;
const DEFAULT_BURST: u64 = 12;

/// Synthetic `stub://` stream.
///
/// Produces a static scene that is disturbed in short bursts: for `burst`
/// frames after every `scene_every` frames the content changes on each frame,
/// otherwise it repeats. Query parameters override the defaults:
/// `stub://name?width=160&height=120&fps=30&scene_every=60&burst=8`.
///
/// Reads are paced to the configured frame rate.
pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    frame_interval: Duration,
    scene_every: u64,
    burst: u64,
    frame_count: u64,
    scene_state: u8,
    next_frame_at: Instant,
}

impl SyntheticSource {
    pub fn open(url: &Url, options: &ConnectOptions) -> Result<Self> {
        let mut width = DEFAULT_WIDTH;
        let mut height = DEFAULT_HEIGHT;
        let mut fps = options.expected_fps.max(1);
        let mut scene_every = DEFAULT_SCENE_EVERY;
        let mut burst = DEFAULT_BURST;

        for (key, value) in url.query_pairs() {
            let parsed = value
                .parse::<u64>()
                .map_err(|_| anyhow!("stub parameter {}='{}' is not a number", key, value))?;
            let as_u32 = || {
                u32::try_from(parsed)
                    .map_err(|_| anyhow!("stub parameter {}={} is out of range", key, parsed))
            };
            match key.as_ref() {
                "width" => width = as_u32()?,
                "height" => height = as_u32()?,
                "fps" => fps = as_u32()?.max(1),
                "scene_every" => scene_every = parsed.max(1),
                "burst" => burst = parsed,
                other => return Err(anyhow!("unknown stub parameter '{}'", other)),
            }
        }
        if width == 0 || height == 0 {
            return Err(anyhow!("stub stream must have non-zero dimensions"));
        }

        let name = url.host_str().unwrap_or("synthetic").to_string();
        log::info!("SyntheticSource: connected to stub://{} ({}x{} @ {} fps)", name, width, height, fps);

        Ok(Self {
            name,
            width,
            height,
            frame_interval: Duration::from_secs(1) / fps,
            scene_every,
            burst,
            frame_count: 0,
            scene_state: 0,
            next_frame_at: Instant::now(),
        })
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let phase = self.frame_count.saturating_sub(1) % self.scene_every;
        if phase < self.burst {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let pixel_count = (self.width as usize) * (self.height as usize) * 3;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 / 3 + self.scene_state as u64 * 17) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn read_frame(&mut self) -> Result<Frame> {
        let now = Instant::now();
        if self.next_frame_at > now {
            std::thread::sleep(self.next_frame_at - now);
        }
        self.next_frame_at = Instant::now() + self.frame_interval;

        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::new(pixels, self.width, self.height, self.frame_count)
    }

    fn describe(&self) -> String {
        format!("stub://{}", self.name)
    }
}
