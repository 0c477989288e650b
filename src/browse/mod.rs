// SPDX-License-Identifier: MIT
//! Internal browse server.
//!
//! Reached through a `link` with the `internal` flag, an empty host, and
//! port [`BROWSE_PORT`]; the engine wires one end of a local socket pair to
//! the remote client and hands the other end here. On the pair, requests
//! and responses are length-prefixed records in the codec the client chose
//! at link time. One request can stream many responses; exhaustion is the
//! `nomore` error code, mirroring the scanner.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::err::{Error, Result};
use crate::io::codec::CodecId;
use crate::pal::net::SocketAddress;
use crate::pal::{AcceptItf, PalSocket, SendOp, SocketEvents, SocketProps};
use crate::scan::{ScanEvent, ScanTarget, Scanner};
use crate::sched::SchedulerHandle;
use crate::sd::SdClient;

/// Internal service port selecting the browse server in a link request.
pub const BROWSE_PORT: u16 = 1;

/// Request kinds.
pub mod request_kind {
    /// Cancel the query with the same handle.
    pub const CANCEL: u32 = 0;
    /// DNS-SD service browse; `item` is the service type.
    pub const SERVICE: u32 = 1;
    /// Local subnet sweep; `item` is the probe port.
    pub const SUBNET: u32 = 2;
    /// Port-range scan; `item` is `host:from-to`.
    pub const PORTS: u32 = 3;
    /// Directory listing; `item` is a path. Gated by `browse_fs`.
    pub const DIRPATH: u32 = 4;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowseRequest {
    pub handle: u64,
    pub kind: u32,
    #[serde(default)]
    pub item: String,
    #[serde(default)]
    pub flags: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowseResponse {
    pub handle: u64,
    pub error_code: i32,
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub item: String,
    #[serde(default)]
    pub props: Vec<(String, String)>,
    #[serde(default)]
    pub address: Option<SocketAddress>,
}

// ─── Server ───────────────────────────────────────────────────────────────────

pub struct BrowseServer {
    sched: Arc<SchedulerHandle>,
    browse_fs: bool,
    endpoints: Mutex<Vec<Arc<BrowseEndpoint>>>,
}

impl BrowseServer {
    pub fn new(sched: Arc<SchedulerHandle>, browse_fs: bool) -> Arc<BrowseServer> {
        Arc::new(BrowseServer {
            sched,
            browse_fs,
            endpoints: Mutex::new(Vec::new()),
        })
    }

    /// Create an endpoint for a new internal session. The returned interface
    /// goes into `PalSocket::pair`; the endpoint must then be attached to
    /// its half of the pair.
    pub fn accept(
        self: &Arc<Self>,
        codec: CodecId,
    ) -> Result<(AcceptItf, Arc<BrowseEndpoint>)> {
        let endpoint = Arc::new_cyclic(|weak| BrowseEndpoint {
            codec,
            server: Arc::downgrade(self),
            sched: self.sched.child(),
            browse_fs: self.browse_fs,
            weak: weak.clone(),
            sock: Mutex::new(None),
            rx_buf: Mutex::new(BytesMut::new()),
            tx_queue: Mutex::new(VecDeque::new()),
            active: Mutex::new(Vec::new()),
        });
        self.endpoints.lock().unwrap().push(endpoint.clone());
        info!(codec = ?codec, "browse session accepted");

        let events: Weak<dyn SocketEvents> = endpoint.weak.clone();
        let itf = AcceptItf {
            props: SocketProps::default(),
            events,
        };
        Ok((itf, endpoint))
    }

    fn forget(&self, endpoint: &BrowseEndpoint) {
        self.endpoints
            .lock()
            .unwrap()
            .retain(|e| !std::ptr::eq(e.as_ref(), endpoint));
    }
}

// ─── Endpoint ─────────────────────────────────────────────────────────────────

struct ActiveQuery {
    handle: u64,
    task: tokio::task::JoinHandle<()>,
}

/// The in-process half of one browse socket pair.
pub struct BrowseEndpoint {
    codec: CodecId,
    server: Weak<BrowseServer>,
    sched: Arc<SchedulerHandle>,
    browse_fs: bool,
    weak: Weak<BrowseEndpoint>,
    sock: Mutex<Option<Arc<PalSocket>>>,
    rx_buf: Mutex<BytesMut>,
    tx_queue: Mutex<VecDeque<Bytes>>,
    active: Mutex<Vec<ActiveQuery>>,
}

impl BrowseEndpoint {
    /// Wire the endpoint to its half of the socket pair and start reading.
    pub fn attach(&self, sock: Arc<PalSocket>) {
        sock.can_recv(true);
        *self.sock.lock().unwrap() = Some(sock);
    }

    fn encode_frame(&self, response: &BrowseResponse) -> Result<Bytes> {
        let body = match self.codec {
            CodecId::MsgPack => rmp_serde::to_vec(response).map_err(|_| Error::InvalidFormat)?,
            _ => serde_json::to_vec(response).map_err(|_| Error::InvalidFormat)?,
        };
        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_u32_le(body.len() as u32);
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    fn decode_frame(&self, body: &[u8]) -> Result<BrowseRequest> {
        match self.codec {
            CodecId::MsgPack => rmp_serde::from_slice(body).map_err(|_| Error::InvalidFormat),
            CodecId::Json => serde_json::from_slice(body).map_err(|_| Error::InvalidFormat),
            CodecId::Auto => {
                if body.first() == Some(&b'{') {
                    serde_json::from_slice(body).map_err(|_| Error::InvalidFormat)
                } else {
                    rmp_serde::from_slice(body).map_err(|_| Error::InvalidFormat)
                }
            }
        }
    }

    fn send_response(&self, response: &BrowseResponse) {
        match self.encode_frame(response) {
            Ok(frame) => {
                self.tx_queue.lock().unwrap().push_back(frame);
                if let Some(sock) = self.sock.lock().unwrap().clone() {
                    sock.can_send(true);
                }
            }
            Err(e) => error!(err = %e, "failed to encode browse response"),
        }
    }

    fn send_error(&self, handle: u64, err: Error) {
        self.send_response(&BrowseResponse {
            handle,
            error_code: err.code(),
            ..Default::default()
        });
    }

    /// Parse buffered bytes into requests; runs on the endpoint scheduler.
    fn drain_rx(self: &Arc<Self>) {
        loop {
            let frame = {
                let mut rx = self.rx_buf.lock().unwrap();
                if rx.len() < 4 {
                    break;
                }
                let len = u32::from_le_bytes([rx[0], rx[1], rx[2], rx[3]]) as usize;
                if rx.len() < 4 + len {
                    break;
                }
                rx.advance(4);
                rx.split_to(len).freeze()
            };
            match self.decode_frame(&frame) {
                Ok(request) => self.handle_request(request),
                Err(e) => warn!(err = %e, "undecodable browse request dropped"),
            }
        }
    }

    fn handle_request(self: &Arc<Self>, request: BrowseRequest) {
        trace!(handle = request.handle, kind = request.kind, "browse request");
        match request.kind {
            request_kind::CANCEL => {
                let mut active = self.active.lock().unwrap();
                if let Some(pos) = active.iter().position(|q| q.handle == request.handle) {
                    active.swap_remove(pos).task.abort();
                }
            }
            request_kind::SERVICE => self.start_service_browse(request),
            request_kind::SUBNET | request_kind::PORTS => self.start_scan(request),
            request_kind::DIRPATH => self.start_dir_listing(request),
            kind => {
                warn!(kind, "unsupported browse request kind");
                self.send_error(request.handle, Error::NotSupported);
            }
        }
    }

    fn start_service_browse(self: &Arc<Self>, request: BrowseRequest) {
        let handle = request.handle;
        let (client, mut results) = match SdClient::browse(&request.item) {
            Ok(v) => v,
            Err(e) => {
                self.send_error(handle, e);
                return;
            }
        };
        let weak = self.weak.clone();
        let task = tokio::spawn(async move {
            let _client = client; // keep the browse alive
            while let Some(result) = results.recv().await {
                let Some(endpoint) = weak.upgrade() else { break };
                endpoint.send_response(&BrowseResponse {
                    handle,
                    error_code: 0,
                    removed: result.removed,
                    item: result.entry,
                    props: vec![
                        ("service".to_owned(), result.service),
                        ("domain".to_owned(), result.domain),
                    ],
                    address: result.addrs.into_iter().next(),
                });
            }
        });
        self.active.lock().unwrap().push(ActiveQuery { handle, task });
    }

    fn start_scan(self: &Arc<Self>, request: BrowseRequest) {
        let handle = request.handle;
        let target = match parse_scan_target(request.kind, &request.item) {
            Ok(t) => t,
            Err(e) => {
                self.send_error(handle, e);
                return;
            }
        };
        let mut events = Scanner::new().start(target, request.flags);
        let weak = self.weak.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(endpoint) = weak.upgrade() else { break };
                match event {
                    ScanEvent::Found { address, name } => {
                        endpoint.send_response(&BrowseResponse {
                            handle,
                            error_code: 0,
                            item: name.unwrap_or_default(),
                            address: Some(address),
                            ..Default::default()
                        });
                    }
                    ScanEvent::Done => {
                        endpoint.send_error(handle, Error::Nomore);
                        break;
                    }
                }
            }
        });
        self.active.lock().unwrap().push(ActiveQuery { handle, task });
    }

    fn start_dir_listing(self: &Arc<Self>, request: BrowseRequest) {
        let handle = request.handle;
        if !self.browse_fs {
            self.send_error(handle, Error::NotSupported);
            return;
        }
        let weak = self.weak.clone();
        let path = request.item;
        let task = tokio::spawn(async move {
            let result = async {
                let mut entries = tokio::fs::read_dir(&path).await.map_err(Error::from)?;
                while let Some(entry) = entries.next_entry().await.map_err(Error::from)? {
                    let Some(endpoint) = weak.upgrade() else { break };
                    let kind = match entry.file_type().await {
                        Ok(t) if t.is_dir() => "dir",
                        Ok(_) => "file",
                        Err(_) => continue,
                    };
                    endpoint.send_response(&BrowseResponse {
                        handle,
                        error_code: 0,
                        item: entry.file_name().to_string_lossy().into_owned(),
                        props: vec![("type".to_owned(), kind.to_owned())],
                        ..Default::default()
                    });
                }
                Ok::<(), Error>(())
            }
            .await;
            if let Some(endpoint) = weak.upgrade() {
                match result {
                    Ok(()) => endpoint.send_error(handle, Error::Nomore),
                    Err(e) => endpoint.send_error(handle, e),
                }
            }
        });
        self.active.lock().unwrap().push(ActiveQuery { handle, task });
    }

    fn teardown(&self) {
        for query in self.active.lock().unwrap().drain(..) {
            query.task.abort();
        }
        if let Some(server) = self.server.upgrade() {
            server.forget(self);
        }
        debug!("browse session torn down");
    }
}

fn parse_scan_target(kind: u32, item: &str) -> Result<ScanTarget> {
    if kind == request_kind::SUBNET {
        let port: u16 = item.trim().parse().map_err(|_| Error::Arg)?;
        return Ok(ScanTarget::Subnet { base: None, port });
    }
    // host:from-to
    let (host, range) = item.rsplit_once(':').ok_or(Error::Arg)?;
    let (from, to) = range.split_once('-').ok_or(Error::Arg)?;
    Ok(ScanTarget::PortRange {
        addr: host.parse().map_err(|_| Error::Arg)?,
        from: from.parse().map_err(|_| Error::Arg)?,
        to: to.parse().map_err(|_| Error::Arg)?,
    })
}

impl SocketEvents for BrowseEndpoint {
    fn opened(&self, result: Result<()>) {
        if let Err(e) = result {
            warn!(err = %e, "browse pair failed to open");
        }
    }

    fn begin_send(&self) -> Option<SendOp> {
        self.tx_queue.lock().unwrap().pop_front().map(|buf| SendOp { buf, to: None })
    }

    fn end_send(&self, _sent: usize, result: Result<()>) {
        if let Err(e) = result {
            if e != Error::Aborted {
                warn!(err = %e, "browse send failed");
            }
        }
    }

    fn begin_recv(&self) -> Option<BytesMut> {
        Some(BytesMut::with_capacity(4096))
    }

    fn end_recv(&self, buf: BytesMut, _from: Option<SocketAddress>, result: Result<()>) {
        match result {
            Ok(()) => {
                self.rx_buf.lock().unwrap().extend_from_slice(&buf);
                let weak = self.weak.clone();
                self.sched.queue("browse_rx", move || {
                    if let Some(endpoint) = weak.upgrade() {
                        endpoint.drain_rx();
                    }
                });
            }
            Err(Error::Aborted) | Err(Error::Retry) => {}
            Err(_) => self.teardown(),
        }
    }

    fn closed(&self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scan_target() {
        assert_eq!(
            parse_scan_target(request_kind::SUBNET, "22").unwrap(),
            ScanTarget::Subnet { base: None, port: 22 }
        );
        assert_eq!(
            parse_scan_target(request_kind::PORTS, "127.0.0.1:1-10").unwrap(),
            ScanTarget::PortRange {
                addr: "127.0.0.1".parse().unwrap(),
                from: 1,
                to: 10,
            }
        );
        assert!(parse_scan_target(request_kind::PORTS, "nonsense").is_err());
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let server = BrowseServer::new(crate::sched::Scheduler::new().handle(), false);
        let (_itf, endpoint) = server.accept(CodecId::Json).unwrap();

        let frame = endpoint
            .encode_frame(&BrowseResponse {
                handle: 9,
                error_code: 0,
                item: "printer._ipp._tcp.local.".into(),
                ..Default::default()
            })
            .unwrap();
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        let body: BrowseResponse = serde_json::from_slice(&frame[4..]).unwrap();
        assert_eq!(body.handle, 9);
        assert_eq!(body.item, "printer._ipp._tcp.local.");
    }
}
