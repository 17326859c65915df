//! Byte transports between a session and its device.
//!
//! Both transports move whole encoded frames, so the loopback path exercises
//! the same codec as TCP.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use rexec_device::protocol::{decode, encode, read_raw_frame, write_raw_frame};
use rexec_device::{Device, DeviceConfig, ProtocolError, Request};

/// One request/response exchange at a time.
pub trait Transport: Send {
    fn round_trip(&mut self, request: &[u8]) -> Result<Vec<u8>, ProtocolError>;

    /// Human readable peer description for logs.
    fn describe(&self) -> String;
}

/// In-process device. Every frame is still encoded and decoded.
pub struct LoopbackTransport {
    device: Device,
}

impl LoopbackTransport {
    pub fn new(config: DeviceConfig) -> rexec_device::Result<Self> {
        Ok(Self {
            device: Device::new(config)?,
        })
    }
}

impl Transport for LoopbackTransport {
    fn round_trip(&mut self, request: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let request: Request = decode(request)?;
        let response = self.device.handle(request);
        encode(&response)
    }

    fn describe(&self) -> String {
        format!("loopback:{}", self.device.kind())
    }
}

/// Length-prefixed frames over a TCP stream.
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Connect to the first reachable address `addr` resolves to.
    pub fn connect(addr: &str, connect_timeout: Duration, io_timeout: Duration) -> io::Result<Self> {
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, format!("`{addr}` resolves to no address"));
        for candidate in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&candidate, connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(io_timeout))?;
                    stream.set_write_timeout(Some(io_timeout))?;
                    stream.set_nodelay(true)?;
                    return Ok(Self {
                        stream,
                        peer: candidate,
                    });
                }
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }
}

impl Transport for TcpTransport {
    fn round_trip(&mut self, request: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        write_raw_frame(&mut self.stream, request)?;
        read_raw_frame(&mut self.stream)?.ok_or_else(|| {
            ProtocolError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} closed the connection", self.peer),
            ))
        })
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rexec_device::{Response, PROTOCOL_VERSION};

    #[test]
    fn test_loopback_encodes_every_frame() {
        let mut transport = LoopbackTransport::new(DeviceConfig::host_cpu()).unwrap();
        let reply = transport
            .round_trip(&encode(&Request::Hello { version: PROTOCOL_VERSION }).unwrap())
            .unwrap();
        assert!(matches!(decode::<Response>(&reply).unwrap(), Response::Hello(_)));
        assert!(transport.round_trip(&[0xff, 0xff, 0xff]).is_err());
        assert_eq!(transport.describe(), "loopback:cpu");
    }

    #[test]
    fn test_tcp_connect_refused() {
        // Bind then drop to get a port nothing listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let result = TcpTransport::connect(&format!("127.0.0.1:{port}"), Duration::from_millis(200), Duration::from_secs(1));
        assert!(result.is_err());
    }
}
