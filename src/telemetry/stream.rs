//! Streaming connector: JSON-lines events over TCP
//!
//! The connection is established once, with a bounded connect timeout.
//! Failure to connect yields a disabled connector rather than an error, so
//! a missing monitoring daemon never stalls the instrumented program.
//!
//! ```text
//! instrumented thread           sidecar thread
//!   publish(event)  ──push──▶  ArrayQueue  ──pop──▶  serde_json ──▶ TCP
//!   (never blocks)              (bounded)            (batched flush)
//! ```
//!
//! A full queue drops the event. A write failure marks the connector
//! disconnected and every later publish is refused.

use super::{EventSink, IoEvent, TelemetryError};
use crate::config::TelemetryConfig;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::io::{BufWriter, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Connection lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(SocketAddr),
    /// The endpoint actively refused the connection
    Rejected(String),
    Disconnected,
    Error(String),
}

/// Callback invoked on connection lifecycle changes
pub type ConnectionObserver = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
}

/// TCP event publisher with a sidecar writer thread
pub struct StreamConnector {
    queue: Option<Arc<ArrayQueue<IoEvent>>>,
    sidecar: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl StreamConnector {
    /// Connector that accepts nothing
    pub fn disabled() -> Self {
        StreamConnector {
            queue: None,
            sidecar: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(true)),
            connected: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Connect to `config.host:config.port`, waiting at most
    /// `config.connect_timeout_secs` per resolved address
    pub fn connect(config: &TelemetryConfig, observer: Option<ConnectionObserver>) -> Self {
        let notify = |event: ConnectionEvent| {
            if let Some(observer) = &observer {
                observer(event);
            }
        };

        let timeout = Duration::from_secs(config.connect_timeout_secs);
        let addrs: Vec<SocketAddr> = match (config.host.as_str(), config.port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                tracing::warn!(host = %config.host, error = %e, "telemetry endpoint did not resolve");
                notify(ConnectionEvent::Error(e.to_string()));
                return Self::disabled();
            }
        };

        let mut last_error = ConnectionEvent::Error(format!("{} resolved to no address", config.host));
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    tracing::debug!(%addr, "telemetry connected");
                    notify(ConnectionEvent::Connected(addr));
                    return Self::start(stream, config.queue_capacity, observer);
                }
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    last_error = ConnectionEvent::Rejected(e.to_string());
                }
                Err(e) => {
                    last_error = ConnectionEvent::Error(e.to_string());
                }
            }
        }

        tracing::warn!(
            host = %config.host,
            port = config.port,
            "telemetry connection failed ({:?}); streaming disabled",
            last_error
        );
        notify(last_error);
        Self::disabled()
    }

    fn start(stream: TcpStream, capacity: usize, observer: Option<ConnectionObserver>) -> Self {
        let queue = Arc::new(ArrayQueue::new(capacity.max(1)));
        let shutdown = Arc::new(AtomicBool::new(false));
        let connected = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());

        let worker = Sidecar {
            queue: queue.clone(),
            shutdown: shutdown.clone(),
            connected: connected.clone(),
            counters: counters.clone(),
            observer,
        };
        let handle = thread::spawn(move || worker.run(stream));

        StreamConnector {
            queue: Some(queue),
            sidecar: Mutex::new(Some(handle)),
            shutdown,
            connected,
            counters,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.queue.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ConnectorStats {
        ConnectorStats {
            published: self.counters.published.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            queued: self.queue.as_ref().map_or(0, |q| q.len()),
        }
    }

    /// Flush queued events and stop the sidecar
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sidecar.lock().take() {
            let _ = handle.join();
        }
    }
}

impl EventSink for StreamConnector {
    fn publish(&self, event: &IoEvent) -> Result<(), TelemetryError> {
        let queue = self.queue.as_ref().ok_or(TelemetryError::Disconnected)?;
        if !self.is_connected() {
            return Err(TelemetryError::Disconnected);
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        queue.push(event.clone()).map_err(|_| {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            TelemetryError::QueueFull
        })
    }
}

impl Drop for StreamConnector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Sidecar {
    queue: Arc<ArrayQueue<IoEvent>>,
    shutdown: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    counters: Arc<Counters>,
    observer: Option<ConnectionObserver>,
}

impl Sidecar {
    const BATCH_SIZE: usize = 100;
    const IDLE_SLEEP: Duration = Duration::from_millis(10);

    fn run(self, stream: TcpStream) {
        let mut writer = BufWriter::new(stream);

        loop {
            // Read the flag before draining so nothing pushed earlier is missed
            let stopping = self.shutdown.load(Ordering::SeqCst);

            let mut drained = 0;
            while let Some(event) = self.queue.pop() {
                if let Err(e) = write_line(&mut writer, &event) {
                    self.disconnect(&e);
                    return;
                }
                self.counters.written.fetch_add(1, Ordering::Relaxed);
                drained += 1;
                if drained >= Self::BATCH_SIZE && !stopping {
                    break;
                }
            }

            if drained > 0 {
                if let Err(e) = writer.flush() {
                    self.disconnect(&e);
                    return;
                }
            }

            if stopping {
                break;
            }
            if drained == 0 {
                thread::sleep(Self::IDLE_SLEEP);
            }
        }
    }

    fn disconnect(&self, error: &std::io::Error) {
        self.connected.store(false, Ordering::SeqCst);
        tracing::warn!(error = %error, "telemetry stream lost; disabling");
        if let Some(observer) = &self.observer {
            observer(ConnectionEvent::Disconnected);
        }
        // Anything still queued has nowhere to go
        while self.queue.pop().is_some() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn write_line<W: Write>(writer: &mut W, event: &IoEvent) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, event)?;
    writer.write_all(b"\n")
}

/// Connector statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorStats {
    pub published: u64,
    pub dropped: u64,
    pub written: u64,
    pub queued: usize,
}

impl ConnectorStats {
    /// Fraction of published events that were dropped (0.0 to 1.0)
    pub fn drop_rate(&self) -> f64 {
        if self.published == 0 {
            0.0
        } else {
            self.dropped as f64 / self.published as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_connector_refuses_events() {
        let connector = StreamConnector::disabled();
        assert!(!connector.is_enabled());
        assert!(!connector.is_connected());

        let event = IoEvent::new(
            &Default::default(),
            crate::runtime::ModuleId::Posix,
            super::super::EventKind::Meta,
            "open",
            crate::identity::RecordId(1),
            "/d".to_string(),
        );
        assert!(matches!(
            connector.publish(&event),
            Err(TelemetryError::Disconnected)
        ));
        assert_eq!(connector.stats().published, 0);
    }

    #[test]
    fn test_drop_rate() {
        let stats = ConnectorStats {
            published: 10,
            dropped: 1,
            written: 9,
            queued: 0,
        };
        assert!((stats.drop_rate() - 0.1).abs() < f64::EPSILON);

        let empty = ConnectorStats {
            published: 0,
            dropped: 0,
            written: 0,
            queued: 0,
        };
        assert_eq!(empty.drop_rate(), 0.0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let connector = StreamConnector::disabled();
        connector.shutdown();
        connector.shutdown();
    }
}
