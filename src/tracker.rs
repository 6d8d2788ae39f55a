//! The detection pipeline: capture -> track -> enforce.
//!
//! Three stages run concurrently, joined by channels. The capture stage
//! owns the pcap handle and is the sole producer of observations; the
//! track stage merges each observation into the shared cache and
//! evaluates the scan heuristic; the enforce stage blocks flagged
//! sources sequentially. Closing a channel is the drain signal for the
//! downstream stage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{IntCounter, Registry};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cache::{ports_to_string, ConnCache, ConnRecord};
use crate::config::DetectionConfig;
use crate::firewall::Firewall;
use crate::packet::{decode, Observation, BPF_FILTER, SNAP_LEN};

const OBSERVATION_QUEUE: usize = 1024;
const SCAN_QUEUE: usize = 64;

/// Read timeout on the capture handle so the loop can notice the stop
/// flag between frames.
const READ_TIMEOUT_MS: i32 = 1000;

/// `true` once a record holds strictly more distinct destination ports
/// than the configured threshold.
pub fn is_port_scan(distinct_ports: usize, threshold: usize) -> bool {
    distinct_ports > threshold
}

/// Everything the tracker needs to run.
pub struct TrackerParams {
    pub interface: String,
    pub detection: DetectionConfig,
    pub firewall: Arc<dyn Firewall>,
}

/// Requests a pipeline stop; the capture stage halts first and the
/// remaining stages drain behind it.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Pipeline orchestrator. Owns the cache and the stop flag; the
/// firewall and the metrics registry are injected.
pub struct Tracker {
    interface: String,
    cache: Arc<ConnCache>,
    port_threshold: usize,
    firewall: Arc<dyn Firewall>,
    new_connections: IntCounter,
    stop: Arc<AtomicBool>,
}

impl Tracker {
    pub fn new(params: TrackerParams, metrics: &Registry) -> Result<Self> {
        let new_connections = IntCounter::new(
            "synban_new_connections",
            "Number of observed new TCP connection attempts",
        )
        .context("failed to build connection counter")?;
        metrics
            .register(Box::new(new_connections.clone()))
            .context("failed to register connection counter")?;

        Ok(Self {
            interface: params.interface,
            cache: Arc::new(ConnCache::new(params.detection.cache_ttl())),
            port_threshold: params.detection.port_threshold,
            firewall: params.firewall,
            new_connections,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: self.stop.clone(),
        }
    }

    /// Run the pipeline until the capture loop stops (shutdown request
    /// or fatal capture error), then drain the remaining stages and
    /// tear down the firewall chain.
    pub async fn run(self) -> Result<()> {
        let (obs_tx, obs_rx) = mpsc::channel(OBSERVATION_QUEUE);
        let (scan_tx, scan_rx) = mpsc::channel(SCAN_QUEUE);

        let capture = {
            let interface = self.interface.clone();
            let counter = self.new_connections.clone();
            let stop = self.stop.clone();
            tokio::task::spawn_blocking(move || capture_loop(&interface, counter, stop, obs_tx))
        };
        let track = tokio::spawn(track_stage(
            self.cache.clone(),
            self.port_threshold,
            obs_rx,
            scan_tx,
        ));
        let enforce = tokio::spawn(enforce_stage(self.firewall.clone(), scan_rx));

        // Dropping the observation sender when capture returns cascades
        // the drain through track and enforce.
        let capture_result = capture.await.context("capture stage panicked")?;
        track.await.context("track stage panicked")?;
        enforce.await.context("enforce stage panicked")?;

        if let Err(e) = self.firewall.close() {
            warn!("failed to tear down firewall chain: {e:#}");
        }

        capture_result
    }
}

/// Capture stage: blocking pcap read loop. Open and filter errors are
/// fatal; undecodable frames are logged and dropped.
fn capture_loop(
    interface: &str,
    counter: IntCounter,
    stop: Arc<AtomicBool>,
    observations: mpsc::Sender<Observation>,
) -> Result<()> {
    let mut capture = pcap::Capture::from_device(interface)
        .with_context(|| format!("failed to open capture device {interface}"))?
        .snaplen(SNAP_LEN)
        .promisc(false)
        .timeout(READ_TIMEOUT_MS)
        .open()
        .with_context(|| format!("failed to activate capture on {interface}"))?;
    capture
        .filter(BPF_FILTER, true)
        .context("failed to set capture filter")?;

    info!(interface, "capture is running");

    while !stop.load(Ordering::Relaxed) {
        match capture.next_packet() {
            Ok(frame) => match decode(frame.data) {
                Ok(obs) => {
                    counter.inc();
                    debug!(
                        src = %obs.src_ip,
                        dst = %obs.dst_ip,
                        port = obs.dst_port,
                        "new connection attempt"
                    );
                    if observations.blocking_send(obs).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("dropping undecodable frame: {e}"),
            },
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => return Err(e).context("capture read failed"),
        }
    }

    info!("capture stopped");
    Ok(())
}

/// Track stage: one merge task per observation. Same-key merges are
/// serialized inside the cache, so fan-out here cannot reorder the port
/// set a key accumulates.
async fn track_stage(
    cache: Arc<ConnCache>,
    threshold: usize,
    mut observations: mpsc::Receiver<Observation>,
    scans: mpsc::Sender<ConnRecord>,
) {
    info!("track stage is running");
    while let Some(obs) = observations.recv().await {
        let cache = cache.clone();
        let scans = scans.clone();
        tokio::spawn(async move {
            let record = cache.get_or_merge(&obs);
            if is_port_scan(record.ports.len(), threshold) {
                // Receiver gone means we are draining for shutdown.
                let _ = scans.send(record).await;
            }
        });
    }
    // In-flight merge tasks still hold sender clones; the scan channel
    // closes once the last of them finishes.
}

/// Enforce stage: sequential block calls. Block failures are logged and
/// dropped; a still-scanning source re-triggers the block on its next
/// qualifying observation.
async fn enforce_stage(firewall: Arc<dyn Firewall>, mut scans: mpsc::Receiver<ConnRecord>) {
    info!("enforce stage is running");
    while let Some(record) = scans.recv().await {
        info!(
            src = %record.src_ip,
            dst = %record.dst_ip,
            ports = %ports_to_string(&record.ports),
            "port scan detected"
        );
        if let Err(e) = firewall.block(record.src_ip) {
            error!(src = %record.src_ip, "failed to block scanning source: {e:#}");
        }
    }
}
