//! Shared fixtures: an in-memory transport and a factory that hands out
//! scripted responses.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::Mutex;

use connpool_core::{ConnectError, Route, Transport, TransportFactory};

static TRACING: Once = Once::new();

/// Install a test subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Observable state of one mock transport
#[derive(Debug, Default)]
pub struct TransportLog {
    pub closed: AtomicBool,
    pub peer_closed: AtomicBool,
    pub written: Mutex<Vec<u8>>,
}

impl TransportLog {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn hang_up(&self) {
        self.peer_closed.store(true, Ordering::SeqCst);
    }
}

/// Transport reading from a fixed script
pub struct MockTransport {
    input: Cursor<Vec<u8>>,
    log: Arc<TransportLog>,
}

impl MockTransport {
    pub fn new(input: impl Into<Vec<u8>>) -> (Self, Arc<TransportLog>) {
        let log = Arc::new(TransportLog::default());
        let transport = Self {
            input: Cursor::new(input.into()),
            log: Arc::clone(&log),
        };
        (transport, log)
    }
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.log.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        self.input.read(buf)
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.log.written.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockTransport {
    fn is_peer_closed(&self) -> bool {
        self.log.peer_closed.load(Ordering::SeqCst)
    }

    fn close(&mut self) -> io::Result<()> {
        self.log.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory serving one script per connect, in order
///
/// Once the scripts run out, further transports read nothing.
#[derive(Default)]
pub struct MockFactory {
    scripts: Mutex<VecDeque<Vec<u8>>>,
    logs: Mutex<Vec<Arc<TransportLog>>>,
    connects: AtomicUsize,
    refuse: AtomicBool,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, script: impl Into<Vec<u8>>) -> Self {
        self.scripts.lock().push_back(script.into());
        self
    }

    pub fn refusing() -> Self {
        let factory = Self::default();
        factory.refuse.store(true, Ordering::SeqCst);
        factory
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Log of the `n`th transport handed out
    pub fn transport(&self, n: usize) -> Arc<TransportLog> {
        Arc::clone(&self.logs.lock()[n])
    }
}

impl TransportFactory for MockFactory {
    fn connect(&self, route: &Route, _timeout: Duration) -> Result<Box<dyn Transport>, ConnectError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ConnectError::Io {
                route: route.clone(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
            });
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().pop_front().unwrap_or_default();
        let (transport, log) = MockTransport::new(script);
        self.logs.lock().push(log);
        Ok(Box::new(transport))
    }
}
