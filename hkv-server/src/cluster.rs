//! # Peer Transport
//!
//! Purpose: the `hkv_cluster::PeerTransport` implementation that actually
//! talks to a remote peer's client port, for `Direct`/`Prepare`/`Commit`/
//! `Rollback` (§4.8). Each call opens a short-lived connection, writes one
//! RESP command frame, and reads back one reply frame; `router::route` is a
//! synchronous call so the I/O here is blocking, wrapped in
//! `block_in_place` so it doesn't starve the tokio runtime's other tasks.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use hkv_common::{encode_command, parse_reply, Reply};
use hkv_cluster::PeerTransport;

const RPC_TIMEOUT: Duration = Duration::from_secs(3);

pub struct TcpPeerTransport;

impl TcpPeerTransport {
    fn call(&self, peer: &str, verb: &[u8], payload: &[Vec<u8>]) -> Reply {
        tokio::task::block_in_place(|| Self::call_blocking(peer, verb, payload))
    }

    fn call_blocking(peer: &str, verb: &[u8], payload: &[Vec<u8>]) -> Reply {
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(verb.to_vec());
        frame.extend_from_slice(payload);

        let connect = || -> std::io::Result<TcpStream> {
            let addr: std::net::SocketAddr = peer.parse().map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad peer address"))?;
            let stream = TcpStream::connect_timeout(&addr, RPC_TIMEOUT)?;
            stream.set_read_timeout(Some(RPC_TIMEOUT))?;
            stream.set_write_timeout(Some(RPC_TIMEOUT))?;
            Ok(stream)
        };

        let result = (|| -> std::io::Result<Reply> {
            let mut stream = connect()?;
            stream.write_all(&encode_command(&frame))?;
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                if let Ok(Some(reply)) = parse_reply(&mut buf) {
                    return Ok(reply);
                }
                let n = stream.read(&mut chunk)?;
                if n == 0 {
                    return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed connection"));
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        })();

        // A network failure during Prepare is treated as a prepare-failure,
        // which the router turns into a rollback of everyone else (§4.8).
        result.unwrap_or_else(|e| Reply::Error(format!("ERR peer {peer} unreachable: {e}")))
    }
}

impl PeerTransport for TcpPeerTransport {
    fn direct(&self, peer: &str, name: &str, args: &[Vec<u8>]) -> Reply {
        let mut payload = vec![name.as_bytes().to_vec()];
        payload.extend_from_slice(args);
        self.call(peer, b"DIRECT", &payload)
    }

    fn prepare(&self, peer: &str, tx_id: u64, name: &str, args: &[Vec<u8>]) -> Reply {
        let mut payload = vec![tx_id.to_string().into_bytes(), name.as_bytes().to_vec()];
        payload.extend_from_slice(args);
        self.call(peer, b"PREPARE", &payload)
    }

    fn commit(&self, peer: &str, tx_id: u64) -> Reply {
        self.call(peer, b"COMMIT", &[tx_id.to_string().into_bytes()])
    }

    fn rollback(&self, peer: &str, tx_id: u64) -> Reply {
        self.call(peer, b"ROLLBACK", &[tx_id.to_string().into_bytes()])
    }
}
