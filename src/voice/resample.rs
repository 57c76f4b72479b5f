//! Sample rate conversion with rubato

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Requested input chunk; rubato may round it to fit the rate ratio
const CHUNK_SIZE: usize = 1024;

const SUB_CHUNKS: usize = 2;

/// Stateful mono resampler fed arbitrarily sized buffers
///
/// Input is accumulated until a full chunk is available, so callers like a
/// device callback can push whatever the driver hands them without the
/// rounding drift of converting each buffer on its own. The filter delay is
/// trimmed from the front of the output.
pub struct StreamResampler {
    inner: Option<FftFixedIn<f32>>,
    input: Vec<f32>,
    from: u32,
    to: u32,
    consumed: u64,
    emitted: u64,
    skip: usize,
}

impl StreamResampler {
    /// Create a resampler from `from` Hz to `to` Hz
    ///
    /// # Errors
    ///
    /// Returns error if either rate is zero or rubato rejects the ratio
    pub fn new(from: u32, to: u32) -> Result<Self> {
        if from == 0 || to == 0 {
            return Err(Error::Audio(format!("invalid resample rates {from} -> {to}")));
        }

        let inner = if from == to {
            None
        } else {
            Some(
                FftFixedIn::<f32>::new(from as usize, to as usize, CHUNK_SIZE, SUB_CHUNKS, 1)
                    .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?,
            )
        };
        let skip = inner.as_ref().map_or(0, Resampler::output_delay);

        Ok(Self {
            inner,
            input: Vec::with_capacity(CHUNK_SIZE * 2),
            from,
            to,
            consumed: 0,
            emitted: 0,
            skip,
        })
    }

    /// Feed samples, returning whatever output full chunks produced
    ///
    /// # Errors
    ///
    /// Returns error if rubato fails on a chunk
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        self.consumed += samples.len() as u64;
        let Some(inner) = self.inner.as_mut() else {
            self.emitted += samples.len() as u64;
            return Ok(samples.to_vec());
        };

        self.input.extend_from_slice(samples);
        let mut out = Vec::new();
        loop {
            let needed = inner.input_frames_next();
            if self.input.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.input.drain(..needed).collect();
            let result = inner
                .process(&[chunk], None)
                .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
            out.extend(result.into_iter().next().unwrap_or_default());
        }

        Ok(self.trim(out))
    }

    /// Flush buffered input, padding with silence
    ///
    /// The total emitted length matches the input length scaled by the
    /// rate ratio.
    ///
    /// # Errors
    ///
    /// Returns error if rubato fails on a chunk
    pub fn finish(&mut self) -> Result<Vec<f32>> {
        let target = self.expected_len();
        let mut out = Vec::new();

        if let Some(inner) = self.inner.as_mut() {
            while self.emitted + (out.len() as u64) < target {
                let needed = inner.input_frames_next();
                let mut chunk = std::mem::take(&mut self.input);
                chunk.resize(needed, 0.0);
                let result = inner
                    .process(&[chunk], None)
                    .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
                let produced = result.into_iter().next().unwrap_or_default();
                out.extend(skip_delay(&mut self.skip, produced));
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        let keep = target.saturating_sub(self.emitted) as usize;
        out.truncate(keep);
        self.emitted += out.len() as u64;
        Ok(out)
    }

    fn expected_len(&self) -> u64 {
        (self.consumed * u64::from(self.to) + u64::from(self.from) / 2) / u64::from(self.from)
    }

    fn trim(&mut self, out: Vec<f32>) -> Vec<f32> {
        let out = skip_delay(&mut self.skip, out);
        self.emitted += out.len() as u64;
        out
    }
}

/// Drop leading filter delay until `skip` is used up
fn skip_delay(skip: &mut usize, mut out: Vec<f32>) -> Vec<f32> {
    if *skip > 0 {
        let n = (*skip).min(out.len());
        out.drain(..n);
        *skip -= n;
    }
    out
}

/// Resample a whole buffer
///
/// # Errors
///
/// Returns error if either rate is zero or resampling fails
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    if from == to {
        return Ok(samples.to_vec());
    }

    let mut resampler = StreamResampler::new(from, to)?;
    let mut out = resampler.push(samples)?;
    out.extend(resampler.finish()?);
    Ok(out)
}
