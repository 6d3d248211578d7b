//! Generated audio for the outgoing track.
//!
//! With the `opus` feature the source encodes red (brownian) noise. Without
//! it every frame is an Opus packet that decodes to silence.

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;

pub const FRAME_DURATION: Duration = Duration::from_millis(20);
pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u16 = 2;

/// One 20 ms fullband CELT frame of silence.
pub const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];

#[cfg(feature = "opus")]
pub use self::noise::RedNoise;

#[cfg(feature = "opus")]
mod noise {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::{CHANNELS, FRAME_DURATION, SAMPLE_RATE};

    pub const SAMPLES_PER_CHANNEL: usize =
        (SAMPLE_RATE as u128 * FRAME_DURATION.as_millis() / 1000) as usize;

    const STEP: f32 = 0.02;
    const LEAK: f32 = 0.995;
    const AMPLITUDE: f32 = 0.25;

    /// Leaky integration of white noise, the same on both channels.
    pub struct RedNoise {
        level: f32,
        rng: StdRng,
    }

    impl RedNoise {
        pub fn new() -> Self {
            Self::with_rng(StdRng::from_entropy())
        }

        pub fn with_rng(rng: StdRng) -> Self {
            Self { level: 0.0, rng }
        }

        /// Interleaved PCM for one frame.
        pub fn next_frame(&mut self) -> Vec<i16> {
            let mut pcm = Vec::with_capacity(SAMPLES_PER_CHANNEL * CHANNELS as usize);
            for _ in 0..SAMPLES_PER_CHANNEL {
                let white: f32 = self.rng.gen_range(-1.0..=1.0);
                self.level = (self.level * LEAK + white * STEP).clamp(-1.0, 1.0);
                let sample = (self.level * AMPLITUDE * i16::MAX as f32) as i16;
                for _ in 0..CHANNELS {
                    pcm.push(sample);
                }
            }
            pcm
        }
    }
}

pub struct AudioTestSource {
    #[cfg(feature = "opus")]
    noise: RedNoise,
    #[cfg(feature = "opus")]
    encoder: opus::Encoder,
}

impl AudioTestSource {
    #[cfg(feature = "opus")]
    pub fn new() -> Result<Self> {
        let encoder =
            opus::Encoder::new(SAMPLE_RATE, opus::Channels::Stereo, opus::Application::Audio)
                .map_err(|err| anyhow::anyhow!("opus encoder creation failed: {:?}", err))?;
        Ok(Self {
            noise: RedNoise::new(),
            encoder,
        })
    }

    #[cfg(not(feature = "opus"))]
    pub fn new() -> Result<Self> {
        Ok(Self {})
    }

    /// One Opus packet covering `FRAME_DURATION`.
    #[cfg(feature = "opus")]
    pub fn next_packet(&mut self) -> Result<Bytes> {
        let pcm = self.noise.next_frame();
        let packet = self
            .encoder
            .encode_vec(&pcm, 1275)
            .map_err(|err| anyhow::anyhow!("opus encoding failed: {:?}", err))?;
        Ok(Bytes::from(packet))
    }

    #[cfg(not(feature = "opus"))]
    pub fn next_packet(&mut self) -> Result<Bytes> {
        Ok(Bytes::from_static(&OPUS_SILENCE))
    }
}
