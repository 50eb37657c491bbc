//! Streaming compressor with auto-decision
//!
//! Three requested modes: `none`, `zstd`, `auto`. Auto buffers up to a
//! sample's worth of input, trial-compresses the sample, and commits to zstd
//! only when the estimated saving clears the threshold; otherwise the stream
//! passes through byte-for-byte. Whatever was buffered is replayed through
//! the committed sink, so the output is identical to having decided up
//! front.
//!
//! The report is shared behind an `Arc<Mutex<_>>`: the compressor fills it
//! as bytes flow and finalizes it in `finish()`, while the upload
//! orchestrator reads it after the stage completes.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use burrow_core::{BurrowError, BurrowResult};

/// Default number of bytes sampled before the auto decision.
pub const DEFAULT_SAMPLE_BYTES: usize = 4 << 20;

/// Default minimum estimated saving (5%) for auto to pick zstd.
pub const DEFAULT_AUTO_MIN_SAVING: f64 = 0.05;

/// Default zstd level.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressMode {
    None,
    Zstd,
    Auto,
}

impl CompressMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressMode::None => "none",
            CompressMode::Zstd => "zstd",
            CompressMode::Auto => "auto",
        }
    }
}

impl std::fmt::Display for CompressMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CompressMode {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(CompressMode::None),
            "zstd" => Ok(CompressMode::Zstd),
            "auto" => Ok(CompressMode::Auto),
            other => Err(BurrowError::Format(format!(
                "unsupported compression mode {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressorConfig {
    pub mode: CompressMode,
    /// zstd level, clamped to `[1, 19]`.
    pub zstd_level: i32,
    /// Estimated-saving threshold for auto mode.
    pub auto_min_saving: f64,
    /// Sample size for auto mode.
    pub sample_bytes: usize,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            mode: CompressMode::Auto,
            zstd_level: DEFAULT_ZSTD_LEVEL,
            auto_min_saving: DEFAULT_AUTO_MIN_SAVING,
            sample_bytes: DEFAULT_SAMPLE_BYTES,
        }
    }
}

/// What the compressor did, filled as bytes flow and finalized on `finish`.
#[derive(Debug, Clone)]
pub struct CompressReport {
    pub mode_requested: CompressMode,
    pub mode_used: CompressMode,
    /// Saving estimated from the auto sample; -1 when not applicable.
    pub estimated_savings: f64,
    /// `1 - bytes_out / bytes_in` after finish; -1 when no data flowed.
    pub final_savings: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub sampled_bytes: usize,
    pub decided: bool,
}

impl CompressReport {
    fn new(mode: CompressMode) -> Self {
        Self {
            mode_requested: mode,
            mode_used: mode,
            estimated_savings: -1.0,
            final_savings: -1.0,
            bytes_in: 0,
            bytes_out: 0,
            sampled_bytes: 0,
            decided: false,
        }
    }
}

/// Counts the compressed bytes actually emitted downstream.
struct CountingWriter<W: Write> {
    dst: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.dst.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.dst.flush()
    }
}

enum Sink<W: Write> {
    Passthrough(CountingWriter<W>),
    Zstd(zstd::stream::write::Encoder<'static, CountingWriter<W>>),
    /// Auto mode before the decision: buffer and hold the writer.
    Sampling {
        out: Option<CountingWriter<W>>,
        buf: Vec<u8>,
    },
    /// Transient state during the decision; never observed.
    Deciding,
}

/// A `Write` adapter applying the configured compression. `finish()` must be
/// called to flush encoder frames and finalize the report; dropping without
/// it loses data.
pub struct Compressor<W: Write> {
    sink: Sink<W>,
    config: CompressorConfig,
    report: Arc<Mutex<CompressReport>>,
    bytes_in: u64,
}

impl<W: Write> Compressor<W> {
    pub fn new(dst: W, config: CompressorConfig) -> BurrowResult<(Self, Arc<Mutex<CompressReport>>)> {
        let mut config = config;
        if config.sample_bytes == 0 {
            config.sample_bytes = DEFAULT_SAMPLE_BYTES;
        }
        if config.auto_min_saving <= 0.0 {
            config.auto_min_saving = DEFAULT_AUTO_MIN_SAVING;
        }
        config.zstd_level = config.zstd_level.clamp(1, 19);

        let mut report = CompressReport::new(config.mode);
        let counting = CountingWriter { dst, written: 0 };

        let sink = match config.mode {
            CompressMode::None => {
                report.decided = true;
                report.estimated_savings = 0.0;
                report.final_savings = 0.0;
                Sink::Passthrough(counting)
            }
            CompressMode::Zstd => {
                report.decided = true;
                Sink::Zstd(new_encoder(counting, config.zstd_level)?)
            }
            CompressMode::Auto => Sink::Sampling {
                out: Some(counting),
                buf: Vec::with_capacity(config.sample_bytes.min(1 << 20)),
            },
        };

        let report = Arc::new(Mutex::new(report));
        Ok((
            Self {
                sink,
                config,
                report: Arc::clone(&report),
                bytes_in: 0,
            },
            report,
        ))
    }

    /// Trial-compress the sample, commit to zstd or pass-through, and replay
    /// the buffered bytes through the committed sink.
    fn decide(&mut self) -> io::Result<()> {
        let (mut out, buf) = match std::mem::replace(&mut self.sink, Sink::Deciding) {
            Sink::Sampling { out, buf } => (out.expect("sampling sink holds writer"), buf),
            other => {
                self.sink = other;
                return Ok(());
            }
        };

        let estimated = if buf.is_empty() {
            -1.0
        } else {
            let trial = zstd::encode_all(&buf[..], self.config.zstd_level)?;
            1.0 - trial.len() as f64 / buf.len() as f64
        };
        let use_zstd = estimated >= self.config.auto_min_saving;

        {
            let mut report = self.report.lock().expect("report lock");
            report.sampled_bytes = buf.len();
            report.estimated_savings = estimated;
            report.mode_used = if use_zstd {
                CompressMode::Zstd
            } else {
                CompressMode::None
            };
            report.decided = true;
        }
        tracing::debug!(
            sampled = buf.len(),
            estimated_savings = estimated,
            use_zstd,
            "compression auto-decision"
        );

        if use_zstd {
            let mut encoder =
                new_encoder(out, self.config.zstd_level).map_err(io_from_burrow)?;
            encoder.write_all(&buf)?;
            self.sink = Sink::Zstd(encoder);
        } else {
            out.write_all(&buf)?;
            self.sink = Sink::Passthrough(out);
        }
        Ok(())
    }

    /// Finish the stream: decide if still sampling, flush encoder frames,
    /// and finalize the report. Returns the final report.
    pub fn finish(mut self) -> io::Result<CompressReport> {
        if matches!(self.sink, Sink::Sampling { .. }) {
            self.decide()?;
        }

        let counting = match std::mem::replace(&mut self.sink, Sink::Deciding) {
            Sink::Passthrough(out) => out,
            Sink::Zstd(encoder) => encoder.finish()?,
            Sink::Sampling { .. } | Sink::Deciding => unreachable!("decided above"),
        };

        let mut report = self.report.lock().expect("report lock");
        report.bytes_in = self.bytes_in;
        report.bytes_out = counting.written;
        report.final_savings = if self.bytes_in > 0 {
            1.0 - counting.written as f64 / self.bytes_in as f64
        } else {
            -1.0
        };
        Ok(report.clone())
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes_in += buf.len() as u64;
        match &mut self.sink {
            Sink::Passthrough(out) => {
                out.write_all(buf)?;
                Ok(buf.len())
            }
            Sink::Zstd(encoder) => {
                encoder.write_all(buf)?;
                Ok(buf.len())
            }
            Sink::Sampling { buf: sample, .. } => {
                sample.extend_from_slice(buf);
                if sample.len() >= self.config.sample_bytes {
                    self.decide()?;
                }
                Ok(buf.len())
            }
            Sink::Deciding => unreachable!("transient state"),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            Sink::Passthrough(out) => out.flush(),
            Sink::Zstd(encoder) => encoder.flush(),
            // Nothing downstream yet while sampling.
            Sink::Sampling { .. } | Sink::Deciding => Ok(()),
        }
    }
}

/// Decompress `src` into `dst` according to the envelope's recorded mode.
pub fn decompress(dst: &mut dyn Write, src: &mut dyn Read, mode: &str) -> BurrowResult<u64> {
    match mode.parse::<CompressMode>()? {
        CompressMode::None => Ok(io::copy(src, dst)?),
        CompressMode::Zstd => {
            let mut decoder = zstd::stream::read::Decoder::new(src)
                .map_err(|e| BurrowError::Format(format!("zstd decoder: {e}")))?;
            Ok(io::copy(&mut decoder, dst)?)
        }
        CompressMode::Auto => Err(BurrowError::Format(
            "auto is not a stored compression mode".into(),
        )),
    }
}

fn new_encoder<W: Write>(
    dst: W,
    level: i32,
) -> BurrowResult<zstd::stream::write::Encoder<'static, W>> {
    let mut encoder = zstd::stream::write::Encoder::new(dst, level)
        .map_err(|e| BurrowError::Format(format!("zstd encoder: {e}")))?;
    // Spread frames over the available cores; 1 worker is still the
    // multithreaded API with a single compression thread.
    let workers = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    if let Err(e) = encoder.multithread(workers) {
        tracing::warn!("zstd multithread unavailable: {e}");
    }
    Ok(encoder)
}

fn io_from_burrow(e: BurrowError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn run(
        input: &[u8],
        config: CompressorConfig,
    ) -> (Vec<u8>, CompressReport) {
        let mut out = Vec::new();
        let (mut compressor, _report) = Compressor::new(&mut out, config).unwrap();
        compressor.write_all(input).unwrap();
        let report = compressor.finish().unwrap();
        (out, report)
    }

    fn roundtrip(input: &[u8], config: CompressorConfig) -> CompressReport {
        let (compressed, report) = run(input, config);
        let mut restored = Vec::new();
        decompress(
            &mut restored,
            &mut &compressed[..],
            report.mode_used.as_str(),
        )
        .unwrap();
        assert_eq!(restored, input, "round-trip must be lossless");
        report
    }

    #[test]
    fn test_auto_picks_zstd_for_redundant_input() {
        let input = vec![0u8; 8 << 20];
        let report = roundtrip(&input, CompressorConfig::default());

        assert_eq!(report.mode_requested, CompressMode::Auto);
        assert_eq!(report.mode_used, CompressMode::Zstd);
        assert!(report.decided);
        assert!(report.estimated_savings > 0.9);
        assert!(report.final_savings > 0.9, "got {}", report.final_savings);
        assert_eq!(report.sampled_bytes, DEFAULT_SAMPLE_BYTES);
        assert_eq!(report.bytes_in, input.len() as u64);
    }

    #[test]
    fn test_auto_picks_none_for_random_input() {
        let mut input = vec![0u8; 8 << 20];
        rand::thread_rng().fill_bytes(&mut input);
        let report = roundtrip(&input, CompressorConfig::default());

        assert_eq!(report.mode_used, CompressMode::None);
        assert!(report.estimated_savings < DEFAULT_AUTO_MIN_SAVING);
        assert!(report.final_savings.abs() < 0.01, "got {}", report.final_savings);
        assert_eq!(report.bytes_out, input.len() as u64);
    }

    #[test]
    fn test_auto_decides_on_short_stream_at_finish() {
        // Far below the sample size; the decision happens in finish().
        let input = vec![b'a'; 10 << 10];
        let report = roundtrip(&input, CompressorConfig::default());

        assert!(report.decided);
        assert_eq!(report.mode_used, CompressMode::Zstd);
        assert_eq!(report.sampled_bytes, input.len());
    }

    #[test]
    fn test_auto_empty_stream() {
        let report = roundtrip(&[], CompressorConfig::default());

        assert!(report.decided);
        assert_eq!(report.mode_used, CompressMode::None);
        assert_eq!(report.estimated_savings, -1.0);
        assert_eq!(report.final_savings, -1.0);
        assert_eq!(report.bytes_in, 0);
    }

    #[test]
    fn test_forced_zstd() {
        let input = vec![7u8; 1 << 20];
        let report = roundtrip(
            &input,
            CompressorConfig {
                mode: CompressMode::Zstd,
                ..CompressorConfig::default()
            },
        );
        assert_eq!(report.mode_used, CompressMode::Zstd);
        assert!(report.bytes_out < report.bytes_in);
    }

    #[test]
    fn test_forced_none_is_identity() {
        let input = b"plain bytes, untouched".to_vec();
        let (out, report) = run(
            &input,
            CompressorConfig {
                mode: CompressMode::None,
                ..CompressorConfig::default()
            },
        );
        assert_eq!(out, input);
        assert_eq!(report.mode_used, CompressMode::None);
        assert_eq!(report.final_savings, 0.0);
    }

    #[test]
    fn test_sample_replay_preserves_boundary() {
        // Input crosses the sample boundary mid-write; replay must keep the
        // exact byte sequence.
        let sample_bytes = 64 << 10;
        let mut input = Vec::new();
        for i in 0..(sample_bytes * 3) {
            input.push((i % 251) as u8);
        }
        roundtrip(
            &input,
            CompressorConfig {
                mode: CompressMode::Auto,
                sample_bytes,
                ..CompressorConfig::default()
            },
        );
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let mut out = Vec::new();
        let err = decompress(&mut out, &mut &b"x"[..], "lz4").unwrap_err();
        assert!(matches!(err, BurrowError::Format(_)));
    }

    #[test]
    fn test_empty_mode_means_none() {
        let mut out = Vec::new();
        decompress(&mut out, &mut &b"data"[..], "").unwrap();
        assert_eq!(out, b"data");
    }
}
