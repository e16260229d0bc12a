use crate::tunnel::{Tunnel, TunnelConn, TunnelCreator, TunnelError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// A tunnel double that answers every dial with a canned HTTP response.
pub struct MockTunnel {
    pub address: String,
    opened: AtomicBool,
    closed: AtomicBool,
    fail_open: AtomicBool,
    fail_dial: AtomicBool,
    open_delay: Mutex<Duration>,
    dials: Mutex<Vec<(String, u16)>>,
    response: Mutex<String>,
}

impl MockTunnel {
    pub fn new(address: &str) -> MockTunnel {
        MockTunnel {
            address: address.to_string(),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            fail_dial: AtomicBool::new(false),
            open_delay: Mutex::new(Duration::ZERO),
            dials: Mutex::new(vec![]),
            response: Mutex::new("HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n".to_string()),
        }
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_dial(&self, fail: bool) {
        self.fail_dial.store(fail, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = delay;
    }

    pub fn set_response(&self, response: &str) {
        *self.response.lock().unwrap() = response.to_string();
    }

    pub fn dials(&self) -> Vec<(String, u16)> {
        self.dials.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tunnel for MockTunnel {
    async fn open(&self) -> Result<(), TunnelError> {
        let delay = *self.open_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(TunnelError::AuthFailed {
                user: "mock".to_string(),
            });
        }
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn dial(&self, host: &str, port: u16) -> Result<Box<dyn TunnelConn>, TunnelError> {
        if self.fail_dial.load(Ordering::SeqCst) {
            return Err(TunnelError::NotOpen);
        }
        self.dials.lock().unwrap().push((host.to_string(), port));

        let response = self.response.lock().unwrap().clone();
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let _ = server.read(&mut buf).await;
            let _ = server.write_all(response.as_bytes()).await;
            // dropping the server half signals EOF to read_to_end
        });
        Ok(Box::new(client))
    }

    async fn close(&self) -> Result<(), TunnelError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Creator double that records every tunnel it hands out.
pub struct MockTunnelCreator {
    created: Mutex<Vec<Arc<MockTunnel>>>,
    attempts: AtomicUsize,
    fail_create: AtomicBool,
    fail_open: AtomicBool,
    open_delay: Mutex<Duration>,
}

impl MockTunnelCreator {
    pub fn new() -> MockTunnelCreator {
        MockTunnelCreator {
            created: Mutex::new(vec![]),
            attempts: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            open_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn created(&self) -> Vec<Arc<MockTunnel>> {
        self.created.lock().unwrap().clone()
    }

    /// Create calls seen, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = delay;
    }
}

impl Default for MockTunnelCreator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelCreator for MockTunnelCreator {
    async fn create(
        &self,
        _user: &str,
        _key_file: &str,
        address: &str,
    ) -> Result<Arc<dyn Tunnel>, TunnelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TunnelError::InvalidAddress(address.to_string()));
        }
        let tunnel = Arc::new(MockTunnel::new(address));
        tunnel
            .fail_open
            .store(self.fail_open.load(Ordering::SeqCst), Ordering::SeqCst);
        tunnel.set_open_delay(*self.open_delay.lock().unwrap());
        self.created.lock().unwrap().push(Arc::clone(&tunnel));
        Ok(tunnel)
    }
}
