//! SSH tunnel to the session host
//!
//! When a session is configured with a tunnel, the real connection goes to a
//! local listener whose connections are forwarded through a direct-tcpip channel
//! of a separate SSH connection to the tunnel host.
//!
//! # Lifecycle
//! - `open`: pick a local port, connect the tunnel host, start the listener
//!   task and the keepalive pump thread
//! - `close`: stop the listener and the pump, then disconnect

pub mod ui;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, SessionData};
use crate::session::{RememberingCallbacks, SessionCallbacks, SessionError};
use crate::ssh::{HandleController, PingResult, SshClient, SshError};

pub use ui::TunnelUi;

/// How often the pump checks the tunnel connection
const PUMP_INTERVAL: Duration = Duration::from_millis(250);

/// Idle timeout of one forwarded connection
const FORWARD_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct Tunnel {
    local_port: u16,
    controller: HandleController,
    runtime: Handle,
    stop_tx: Option<mpsc::Sender<()>>,
    shutdown: Arc<AtomicBool>,
    lost: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

/// Bind the configured local port, or the first free port of the range
pub async fn bind_local_port(
    configured: u16,
    low: u16,
    high: u16,
) -> Result<(TcpListener, u16), SessionError> {
    if configured != 0 {
        let listener = TcpListener::bind(("127.0.0.1", configured))
            .await
            .map_err(|e| {
                SessionError::fatal(format!("Cannot listen on tunnel port {}: {}", configured, e))
            })?;
        return Ok((listener, configured));
    }

    for port in low..=high {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => debug!("Tunnel port {} not available: {}", port, e),
        }
    }
    Err(SessionError::fatal(format!(
        "No free local port for the tunnel in range {}-{}",
        low, high
    )))
}

fn tunnel_error(error: SshError) -> SessionError {
    SessionError::fatal(format!("Tunnel: {}", error))
}

impl Tunnel {
    pub async fn open(
        data: &SessionData,
        config: &EngineConfig,
        callbacks: Arc<RememberingCallbacks>,
    ) -> Result<Tunnel, SessionError> {
        let (listener, local_port) = bind_local_port(
            data.tunnel.local_port_number,
            config.tunnel_local_port_low,
            config.tunnel_local_port_high,
        )
        .await?;
        info!(
            "Opening tunnel to {}:{} on local port {}",
            data.tunnel.host_name, data.tunnel.port_number, local_port
        );

        let ui = Arc::new(TunnelUi::new(callbacks));
        let connection = SshClient::new(data.tunnel_ssh_config(), ui.clone())
            .connect()
            .await
            .map_err(tunnel_error)?;
        let controller = connection.controller;

        let (stop_tx, stop_rx) = mpsc::channel(1);
        tokio::spawn(accept_loop(
            listener,
            controller.clone(),
            data.host_name.clone(),
            data.port_number,
            stop_rx,
        ));

        let shutdown = Arc::new(AtomicBool::new(false));
        let lost = Arc::new(AtomicBool::new(false));
        let runtime = Handle::current();
        let pump = spawn_pump(
            runtime.clone(),
            controller.clone(),
            ui,
            Duration::from_secs(config.tunnel_keepalive_secs.max(1)),
            shutdown.clone(),
            lost.clone(),
        )
        .map_err(SessionError::IoError)?;

        Ok(Tunnel {
            local_port,
            controller,
            runtime,
            stop_tx: Some(stop_tx),
            shutdown,
            lost,
            pump: Some(pump),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Is the tunnel connection still up
    pub fn is_open(&self) -> bool {
        !self.lost.load(Ordering::SeqCst) && self.controller.is_connected()
    }

    pub fn close(&mut self) {
        let Some(stop_tx) = self.stop_tx.take() else {
            return;
        };
        info!("Closing tunnel on local port {}", self.local_port);
        let _ = stop_tx.try_send(());

        // the pump may be blocked on a ping served by this runtime, so it is
        // not joined; it exits within one interval
        self.shutdown.store(true, Ordering::SeqCst);
        drop(self.pump.take());

        let controller = self.controller.clone();
        self.runtime.spawn(async move { controller.disconnect().await });
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Keepalive thread: checks the connection every 250 ms and pings it every
/// `keepalive`
fn spawn_pump(
    runtime: Handle,
    controller: HandleController,
    ui: Arc<TunnelUi>,
    keepalive: Duration,
    shutdown: Arc<AtomicBool>,
    lost: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("tunnel-pump".to_string())
        .spawn(move || {
            ui.set_pump_thread(std::thread::current().id());
            let mut last_ping = Instant::now();
            while !shutdown.load(Ordering::SeqCst) {
                std::thread::sleep(PUMP_INTERVAL);
                if !controller.is_connected() {
                    lost.store(true, Ordering::SeqCst);
                    break;
                }
                if last_ping.elapsed() < keepalive {
                    continue;
                }
                last_ping = Instant::now();
                match runtime.block_on(controller.ping()) {
                    PingResult::Ok => {}
                    PingResult::Timeout => warn!("Tunnel keepalive timed out"),
                    PingResult::IoError => {
                        lost.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
            if lost.load(Ordering::SeqCst) {
                warn!("Tunnel connection lost");
                let _ = ui.information("Tunnel connection lost", false);
            }
            debug!("Tunnel pump exited");
        })
}

async fn accept_loop(
    listener: TcpListener,
    controller: HandleController,
    host: String,
    port: u16,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut disconnect_rx = controller.subscribe_disconnect();
    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                debug!("Tunnel listener stopped by request");
                break;
            }
            _ = disconnect_rx.recv() => {
                info!("Tunnel listener stopped: SSH disconnected");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {}", e);
                    }
                    debug!("Tunnel connection from {}", peer);
                    let controller = controller.clone();
                    let host = host.clone();
                    tokio::spawn(async move {
                        if let Err(e) = forward_connection(controller, stream, &host, port).await {
                            warn!("Tunnel connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Tunnel accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn forward_connection(
    controller: HandleController,
    mut local: TcpStream,
    host: &str,
    port: u16,
) -> Result<(), SshError> {
    let channel = controller
        .open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
        .await?;
    debug!("Opened tunnel channel to {}:{}", host, port);

    let (mut local_read, mut local_write) = local.split();
    let channel = Arc::new(tokio::sync::Mutex::new(channel));
    let channel_for_write = channel.clone();
    let channel_for_read = channel.clone();

    let local_to_remote = async {
        let mut buf = vec![0u8; 32768];
        loop {
            match tokio::time::timeout(FORWARD_IDLE_TIMEOUT, local_read.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    let ch = channel_for_write.lock().await;
                    if let Err(e) = ch.data(&buf[..n]).await {
                        debug!("Tunnel channel write error: {}", e);
                        break;
                    }
                }
                Ok(Err(e)) => {
                    debug!("Tunnel local read error: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }
        let ch = channel_for_write.lock().await;
        let _ = ch.eof().await;
    };

    let remote_to_local = async {
        loop {
            let mut ch = channel_for_read.lock().await;
            match tokio::time::timeout(FORWARD_IDLE_TIMEOUT, ch.wait()).await {
                Ok(Some(russh::ChannelMsg::Data { data })) => {
                    drop(ch);
                    if let Err(e) = local_write.write_all(&data).await {
                        debug!("Tunnel local write error: {}", e);
                        break;
                    }
                }
                Ok(Some(russh::ChannelMsg::Eof | russh::ChannelMsg::Close)) | Ok(None) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    };

    tokio::select! {
        _ = local_to_remote => {}
        _ = remote_to_local => {}
    }

    let ch = channel.lock().await;
    let _ = ch.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_free_port_in_range() {
        // hold a port of the range so the next one is picked
        let held = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let taken = held.local_addr().unwrap().port();
        let (_listener, port) = bind_local_port(0, taken, taken.saturating_add(20))
            .await
            .unwrap();
        assert_ne!(port, taken);
        assert!(port > taken);
    }

    #[tokio::test]
    async fn test_no_free_port_is_fatal() {
        let held = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let taken = held.local_addr().unwrap().port();
        let err = bind_local_port(0, taken, taken).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("No free local port"));
    }

    #[tokio::test]
    async fn test_configured_port_wins() {
        let spare = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let free = spare.local_addr().unwrap().port();
        drop(spare);
        let (_listener, port) = bind_local_port(free, 1, 2).await.unwrap();
        assert_eq!(port, free);
    }
}
