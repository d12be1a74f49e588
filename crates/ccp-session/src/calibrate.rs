use ccp_core::schema::Calibration;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::time::Instant;
use tracing::debug;

const ROUNDS: usize = 16;

/// Best-effort measurement of the overhead the PTY interposition adds to
/// a byte round trip: spawn `cat` under a scratch PTY, write one byte at
/// a time, and time until it echoes back. The figure contextualizes T1
/// values in the report; failure is non-fatal.
pub fn measure() -> Result<Calibration, String> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|err| format!("openpty failed: {err}"))?;

    let builder = CommandBuilder::new("cat");
    let mut child = pair
        .slave
        .spawn_command(builder)
        .map_err(|err| format!("spawn cat failed: {err}"))?;
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|err| format!("clone reader failed: {err}"))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|err| format!("take writer failed: {err}"))?;

    let mut samples_ms = Vec::with_capacity(ROUNDS);
    let mut buffer = [0u8; 64];
    for round in 0..ROUNDS {
        let started = Instant::now();
        writer
            .write_all(&[b'a' + (round % 26) as u8])
            .and_then(|_| writer.flush())
            .map_err(|err| format!("pty write failed: {err}"))?;
        match reader.read(&mut buffer) {
            Ok(0) => return Err("pty closed during calibration".to_string()),
            Ok(_) => samples_ms.push(started.elapsed().as_secs_f64() * 1_000.0),
            Err(err) => return Err(format!("pty read failed: {err}")),
        }
    }

    let _ = child.kill();
    let _ = child.wait();
    drop(writer);

    summarize(&samples_ms).ok_or_else(|| "no calibration samples".to_string())
}

fn summarize(samples_ms: &[f64]) -> Option<Calibration> {
    if samples_ms.is_empty() {
        return None;
    }
    let mut sorted = samples_ms.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
    let calibration = Calibration {
        samples: sorted.len() as u32,
        mean_ms: mean,
        p50_ms: percentile(&sorted, 0.50),
        p95_ms: percentile(&sorted, 0.95),
    };
    debug!(
        "pty calibration: mean {:.3}ms p95 {:.3}ms",
        calibration.mean_ms, calibration.p95_ms
    );
    Some(calibration)
}

fn percentile(sorted: &[f64], fraction: f64) -> f64 {
    let rank = ((sorted.len() as f64 - 1.0) * fraction).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_orders_percentiles() {
        let samples = vec![0.2, 0.1, 0.9, 0.3, 0.25, 0.4, 0.15, 0.35];
        let calibration = summarize(&samples).expect("summary");
        assert_eq!(calibration.samples, 8);
        assert!(calibration.p50_ms <= calibration.p95_ms);
        assert!(calibration.mean_ms > 0.0);
    }

    #[test]
    fn empty_sample_set_yields_none() {
        assert!(summarize(&[]).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn round_trip_against_cat_produces_samples() {
        match measure() {
            Ok(calibration) => {
                assert_eq!(calibration.samples as usize, ROUNDS);
                assert!(calibration.mean_ms >= 0.0);
            }
            // Constrained environments may lack a working pty device.
            Err(err) => eprintln!("calibration unavailable: {err}"),
        }
    }
}
