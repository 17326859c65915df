//! TCP device server.
//!
//! Each accepted connection gets a fresh [`Device`] built from the server's
//! [`DeviceConfig`], so sessions never observe each other's memory or modules.

use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread::{self, JoinHandle};

use crate::device::{Device, DeviceConfig};
use crate::error::DeviceError;
use crate::protocol::{read_frame, write_frame, ProtocolError, Request, Response};

pub struct DeviceServer {
    listener: TcpListener,
    config: DeviceConfig,
}

impl DeviceServer {
    pub fn bind(addr: impl ToSocketAddrs, config: DeviceConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let listener = TcpListener::bind(addr)?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails.
    pub fn serve(self) -> Result<(), ServerError> {
        let addr = self.listener.local_addr()?;
        tracing::info!(%addr, kind = %self.config.kind, "device_server_listening");
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(error = %err, "accept_failed");
                    continue;
                }
            };
            let config = self.config.clone();
            thread::spawn(move || {
                let peer = stream.peer_addr().ok();
                match handle_connection(stream, config) {
                    Ok(served) => tracing::info!(?peer, requests = served, "connection_closed"),
                    Err(err) => tracing::warn!(?peer, error = %err, "connection_failed"),
                }
            });
        }
        Ok(())
    }

    /// Serve on a background thread.
    pub fn spawn(self) -> JoinHandle<Result<(), ServerError>> {
        thread::spawn(move || self.serve())
    }
}

/// Serve one connection until the peer says goodbye or hangs up. Returns the
/// number of requests served.
pub fn handle_connection(stream: TcpStream, config: DeviceConfig) -> Result<usize, ServerError> {
    stream.set_nodelay(true)?;
    let mut device = Device::new(config)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    let mut served = 0;
    while let Some(request) = read_frame::<_, Request>(&mut reader)? {
        let goodbye = matches!(request, Request::Goodbye);
        let response: Response = device.handle(request);
        write_frame(&mut writer, &response)?;
        served += 1;
        if goodbye {
            break;
        }
    }
    device.reset();
    Ok(served)
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}
