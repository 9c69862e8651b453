//! Fixed-cadence device sampler.
//!
//! Owns the platform [`DeviceSource`] and a downstream [`SnapshotSink`]. Every tick it
//! polls all device slots, tracks which slots are occupied, and forwards one
//! [`DeviceSnapshot`] per attached device in slot order.
//!
//! The timer is a spawned tokio task guarded by a [`CancellationToken`]. Each tick runs
//! under the core mutex and re-checks the token after acquiring it; [`DeviceSampler::stop`]
//! cancels the token and then takes the same mutex, so once `stop` returns no tick can
//! deliver anything.

use chrono::Local;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::snapshot::{DeviceEvent, DeviceSnapshot};
use super::source::DeviceSource;

/// Receives the sampler output. Called on the sampling task, must not block.
pub trait SnapshotSink: Send {
    fn on_snapshot(&mut self, snapshot: DeviceSnapshot);

    fn on_device_event(&mut self, event: DeviceEvent) {
        let _ = event;
    }
}

const STATS_INTERVAL_SECS: i64 = 30;

struct SamplerCore {
    source: Box<dyn DeviceSource>,
    sink: Box<dyn SnapshotSink>,
    // slot index -> device id, as of the last successful poll
    connected: BTreeMap<usize, String>,
    ticks: u64,
    snapshots: u64,
    last_stats: chrono::DateTime<Local>,
}

impl SamplerCore {
    fn tick(&mut self) {
        self.ticks += 1;

        let slots = match self.source.poll() {
            Ok(slots) => slots,
            Err(e) => {
                error!("Polling devices failed, retrying next tick: {}", e);
                return;
            }
        };

        let current: BTreeMap<usize, String> = slots
            .iter()
            .flatten()
            .map(|snapshot| (snapshot.index, snapshot.id.clone()))
            .collect();

        for (index, id) in &self.connected {
            if !current.contains_key(index) {
                info!("Device {} ({}) disconnected", index, id);
                self.sink.on_device_event(DeviceEvent {
                    index: *index,
                    id: id.clone(),
                    connecting: false,
                });
            }
        }
        for (index, id) in &current {
            if !self.connected.contains_key(index) {
                info!("Device {} ({}) connected", index, id);
                self.sink.on_device_event(DeviceEvent {
                    index: *index,
                    id: id.clone(),
                    connecting: true,
                });
            }
        }
        self.connected = current;

        for snapshot in slots.into_iter().flatten() {
            self.snapshots += 1;
            self.sink.on_snapshot(snapshot);
        }

        let now = Local::now();
        if (now - self.last_stats).num_seconds() >= STATS_INTERVAL_SECS {
            info!(
                "Sampler stats: {} ticks, {} snapshots, {} devices attached",
                self.ticks,
                self.snapshots,
                self.connected.len()
            );
            self.ticks = 0;
            self.snapshots = 0;
            self.last_stats = now;
        }
    }
}

fn lock_core(core: &Mutex<SamplerCore>) -> MutexGuard<'_, SamplerCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SamplingTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct DeviceSampler {
    core: Arc<Mutex<SamplerCore>>,
    task: Option<SamplingTask>,
}

impl DeviceSampler {
    pub fn new(source: Box<dyn DeviceSource>, sink: Box<dyn SnapshotSink>) -> Self {
        Self {
            core: Arc::new(Mutex::new(SamplerCore {
                source,
                sink,
                connected: BTreeMap::new(),
                ticks: 0,
                snapshots: 0,
                last_stats: Local::now(),
            })),
            task: None,
        }
    }

    /// Start sampling every `period`. Does nothing if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, period: Duration) {
        if self.is_running() {
            debug!("Sampler already running, ignoring start");
            return;
        }

        let period = period.max(Duration::from_millis(1));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_sampling_loop(
            Arc::clone(&self.core),
            period,
            cancel.clone(),
        ));
        self.task = Some(SamplingTask { cancel, handle });
        info!("Device sampling started ({} ms interval)", period.as_millis());
    }

    /// Stop sampling. Safe to call when not running.
    pub fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        task.cancel.cancel();
        // Ein laufender Tick darf fertig werden, spätere sehen das Token
        drop(lock_core(&self.core));
        task.handle.abort();
        info!("Device sampling stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|task| !task.cancel.is_cancelled() && !task.handle.is_finished())
    }

    /// Run one tick right now, outside the timer.
    pub fn sample_now(&self) {
        lock_core(&self.core).tick();
    }

    /// Result of the most recent poll, not a live query.
    pub fn is_any_device_connected(&self) -> bool {
        !lock_core(&self.core).connected.is_empty()
    }

    pub fn connected_devices(&self) -> Vec<usize> {
        lock_core(&self.core).connected.keys().copied().collect()
    }
}

impl Drop for DeviceSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

// Returns false once the sampler has been cancelled
fn run_tick(core: &Mutex<SamplerCore>, cancel: &CancellationToken) -> bool {
    let mut core = lock_core(core);
    if cancel.is_cancelled() {
        return false;
    }
    core.tick();
    true
}

async fn run_sampling_loop(
    core: Arc<Mutex<SamplerCore>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !run_tick(&core, &cancel) {
                    break;
                }
            }
        }
    }
    debug!("Sampling loop exited");
}
