use crate::probe::{BasicProbe, ExtrasProbe};
use ccp_core::clock::SessionClock;
use ccp_core::schema::ProcessSample;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::debug;

#[derive(Debug)]
pub enum SamplerEvent {
    Sample(ProcessSample),
    /// The probe failed (normally: the child exited). Sent exactly once,
    /// after the error sample, and the sampler stops.
    ProcessGone,
}

pub struct ProcessSampler {
    task: JoinHandle<()>,
}

impl ProcessSampler {
    /// Samples `pid` every `interval_ms`, emitting onto `tx`. A tick that
    /// arrives while the previous probe is still running is skipped
    /// (`MissedTickBehavior::Skip` plus awaiting the blocking probe).
    pub fn spawn(
        pid: u32,
        interval_ms: u64,
        clock: SessionClock,
        probes: (Box<dyn BasicProbe>, Option<Box<dyn ExtrasProbe>>),
        store_errors: bool,
        tx: mpsc::UnboundedSender<SamplerEvent>,
    ) -> Self {
        let task = tokio::spawn(async move {
            let (mut basic, mut extras) = probes;
            let mut ticker = time::interval(Duration::from_millis(interval_ms.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick of a tokio interval is immediate; it doubles
            // as the CPU baseline refresh.
            loop {
                ticker.tick().await;
                let result = tokio::task::block_in_place(|| {
                    let reading = basic.sample(pid);
                    let linux = extras.as_mut().and_then(|probe| probe.sample(pid));
                    (reading, linux)
                });

                let t_ms = clock.now_ms();
                match result {
                    (Ok(reading), linux) => {
                        let sample = ProcessSample {
                            t_ms,
                            pid,
                            rss_bytes: reading.rss_bytes,
                            cpu_percent: reading.cpu_percent,
                            linux,
                            error: None,
                        };
                        if tx.send(SamplerEvent::Sample(sample)).is_err() {
                            break;
                        }
                    }
                    (Err(error), _) => {
                        debug!("process probe failed: {error}");
                        let recorded = if store_errors {
                            error
                        } else {
                            // Reduced to a class code unless the operator
                            // opted into plaintext errors.
                            "probe_failed".to_string()
                        };
                        let sample = ProcessSample {
                            t_ms,
                            pid,
                            rss_bytes: None,
                            cpu_percent: None,
                            linux: None,
                            error: Some(recorded),
                        };
                        let _ = tx.send(SamplerEvent::Sample(sample));
                        let _ = tx.send(SamplerEvent::ProcessGone);
                        break;
                    }
                }
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}
