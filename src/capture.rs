use pcap::{Activated, Active, Capture, Error as PcapError};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::flow::{self, FALLBACK_PORT, LinkKind};
use crate::interfaces::CaptureDevice;
use crate::transmit::Transmit;
use crate::vxlan::{self, Vni};

/// Largest frame captured in full
pub const SNAPLEN: i32 = 65536;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to grab devices: {0}")]
    DeviceList(#[source] PcapError),

    #[error("No devices found")]
    NoDevices,

    #[error("Failed to open {device} for packet capture: {source}")]
    Open {
        device: String,
        #[source]
        source: PcapError,
    },

    #[error("Failed to set filter '{filter}' on {device}: {source}")]
    Filter {
        device: String,
        filter: String,
        #[source]
        source: PcapError,
    },

    #[error("Capture on {device} stopped: {source}")]
    Read {
        device: String,
        #[source]
        source: PcapError,
    },
}

/// Capture filter for one interface: the user's filter, never the tap's own tunnel traffic
pub fn build_filter(dest_host: &str, dest_port: u16, user_filter: Option<&str>) -> String {
    let own_traffic = format!("udp and dst host {} and dst port {}", dest_host, dest_port);
    match user_filter.map(str::trim).filter(|f| !f.is_empty()) {
        Some(user) => format!("( {} ) and not ({})", user, own_traffic),
        None => format!("not ({})", own_traffic),
    }
}

/// Process-wide mirroring counters
#[derive(Default)]
pub struct Stats {
    captured: AtomicU64,
    sent_packets: AtomicU64,
    sent_bytes: AtomicU64,
    dropped: AtomicU64,
    fallback_ports: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub captured: u64,
    pub sent_packets: u64,
    pub sent_bytes: u64,
    pub dropped: u64,
    pub fallback_ports: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            captured: self.captured.load(Ordering::Relaxed),
            sent_packets: self.sent_packets.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            fallback_ports: self.fallback_ports.load(Ordering::Relaxed),
        }
    }
}

/// What happened to one captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Sent { source_port: u16, bytes: usize },
    Dropped { source_port: u16 },
}

/// Hash, encapsulate and transmit pipeline for one interface
pub struct Mirror {
    device: String,
    vni: Vni,
    link: LinkKind,
    transmitter: Arc<dyn Transmit>,
    stats: Arc<Stats>,
}

impl Mirror {
    pub fn new(
        device: impl Into<String>,
        vni: Vni,
        link: LinkKind,
        transmitter: Arc<dyn Transmit>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            device: device.into(),
            vni,
            link,
            transmitter,
            stats,
        }
    }

    /// Mirror one frame. Failures drop the frame and never escape.
    pub fn process(&self, frame: &[u8]) -> FrameOutcome {
        self.stats.captured.fetch_add(1, Ordering::Relaxed);

        let source_port = flow::compute_source_port(frame, self.link);
        if source_port == FALLBACK_PORT {
            self.stats.fallback_ports.fetch_add(1, Ordering::Relaxed);
        }

        let payload = vxlan::encapsulate(frame, self.vni);

        match self.transmitter.send(source_port, &payload) {
            Ok(bytes) => {
                self.stats.sent_packets.fetch_add(1, Ordering::Relaxed);
                self.stats.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
                FrameOutcome::Sent { source_port, bytes }
            }
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("{}: dropping {} byte frame: {}", self.device, frame.len(), e);
                FrameOutcome::Dropped { source_port }
            }
        }
    }
}

/// One filtered capture handle, owned by the thread reading it
pub struct CaptureSession<T: Activated = Active> {
    device: String,
    filter: String,
    capture: Capture<T>,
}

impl CaptureSession<Active> {
    /// Open `device` in promiscuous mode, blocking reads, with `filter` installed
    pub fn open(device: &str, filter: &str) -> Result<Self, CaptureError> {
        let open_err = |source| CaptureError::Open {
            device: device.to_string(),
            source,
        };

        let capture = Capture::from_device(device)
            .map_err(open_err)?
            .promisc(true)
            .snaplen(SNAPLEN)
            .timeout(0)
            .open()
            .map_err(open_err)?;

        Self::with_filter(device, capture, filter)
    }
}

impl CaptureSession<pcap::Offline> {
    /// Replay a savefile through the same filter and loop as a live interface
    pub fn from_savefile(path: impl AsRef<Path>, filter: &str) -> Result<Self, CaptureError> {
        let name = path.as_ref().display().to_string();
        let capture = Capture::from_file(path.as_ref()).map_err(|source| CaptureError::Open {
            device: name.clone(),
            source,
        })?;

        Self::with_filter(&name, capture, filter)
    }
}

impl<T: Activated> CaptureSession<T> {
    fn with_filter(device: &str, mut capture: Capture<T>, filter: &str) -> Result<Self, CaptureError> {
        capture
            .filter(filter, true)
            .map_err(|source| CaptureError::Filter {
                device: device.to_string(),
                filter: filter.to_string(),
                source,
            })?;

        Ok(Self {
            device: device.to_string(),
            filter: filter.to_string(),
            capture,
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn link(&self) -> LinkKind {
        LinkKind::from(self.capture.get_datalink())
    }

    /// Feed every captured frame to `mirror` until the session ends.
    ///
    /// Returns `Ok` when the source is exhausted; a read error ends the loop
    /// and is not retried.
    pub fn run(&mut self, mirror: &Mirror) -> Result<u64, CaptureError> {
        let mut frames = 0u64;
        loop {
            match self.capture.next_packet() {
                Ok(packet) => {
                    frames += 1;
                    trace!("{}: captured {} bytes", self.device, packet.data.len());
                    mirror.process(packet.data);
                }
                Err(PcapError::TimeoutExpired) => continue,
                Err(PcapError::NoMorePackets) => return Ok(frames),
                Err(source) => {
                    return Err(CaptureError::Read {
                        device: self.device.clone(),
                        source,
                    });
                }
            }
        }
    }
}

/// Start mirroring `device` on its own thread.
///
/// Open and filter failures only skip this interface.
pub fn spawn_capture(
    device: CaptureDevice,
    config: Arc<Config>,
    transmitter: Arc<dyn Transmit>,
    stats: Arc<Stats>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("capture-{}", device.name))
        .spawn(move || {
            let filter = build_filter(&config.dest_host, config.dest_port, config.user_filter());

            let mut session = match CaptureSession::open(&device.name, &filter) {
                Ok(session) => session,
                Err(e) => {
                    error!("{}", e);
                    return;
                }
            };

            let link = session.link();
            if let LinkKind::Unsupported(dlt) = link {
                warn!(
                    "{}: link type {} not parsed, all frames use source port {}",
                    device.name, dlt, FALLBACK_PORT
                );
            }

            info!(
                "Capturing traffic on {} ({}) with filter: {}",
                device.name,
                device.description.as_deref().unwrap_or("no description"),
                session.filter()
            );

            let mirror = Mirror::new(&device.name, config.vni, link, transmitter, stats);
            match session.run(&mirror) {
                Ok(frames) => info!("{}: capture closed after {} frames", session.device(), frames),
                Err(e) => error!("{}", e),
            }
            debug!("Capture thread for {} exiting", device.name);
        })
}
