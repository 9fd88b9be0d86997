//! Stage server: exposes any [`Accelerator`] over the wire protocol.
//!
//! The accept loop runs on tokio and stops when its [`CancellationToken`]
//! fires.  Each connection is one channel with its own devices, sessions
//! and handle table, served on a blocking worker thread since stage calls
//! block.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, ErrorKind};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hwpipe_core::device::{Accelerator, DeviceHandle};
use hwpipe_core::error::{EngineError, Result};
use hwpipe_core::stage::{OutputSlot, RecvStatus, StageSession};
use hwpipe_core::types::{Artifact, ArtifactHandle, Residency};

use crate::proto::{
    PROTOCOL_VERSION, ProtoError, Request, Response, TransferMode, WireArtifact, WireError,
    WireRecv, read_frame, write_frame,
};

pub struct StageServer {
    listener: TcpListener,
    accel: Arc<dyn Accelerator>,
    cancel: CancellationToken,
}

impl StageServer {
    pub async fn bind(addr: impl ToSocketAddrs, accel: Arc<dyn Accelerator>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            accel,
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Cancelling this token stops the accept loop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn serve(self) -> io::Result<()> {
        info!(
            addr = %self.listener.local_addr()?,
            accelerator = self.accel.name(),
            "Stage server listening"
        );
        let mut next_channel = 0u64;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Stage server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            error!(error = %err, "Accept failed");
                            continue;
                        }
                    };
                    let channel = next_channel;
                    next_channel += 1;
                    debug!(channel, %peer, "Client connected");
                    let stream = match stream.into_std().and_then(|s| s.set_nonblocking(false).map(|()| s)) {
                        Ok(stream) => stream,
                        Err(err) => {
                            warn!(channel, error = %err, "Could not hand connection to a worker");
                            continue;
                        }
                    };
                    let accel = self.accel.clone();
                    tokio::task::spawn_blocking(move || {
                        if let Err(err) = Connection::new(accel, channel).serve(stream) {
                            warn!(channel, error = %err, "Connection ended with error");
                        }
                    });
                }
            }
        }
    }
}

// ─── Handle table ────────────────────────────────────────────────────────────

/// Device-resident outputs kept for the client, one live output per
/// session.  A handle dies at its session's next receive or close.
#[derive(Default)]
struct HandleTable {
    slots: HashMap<u64, OutputSlot<Artifact>>,
    /// Live handle id → producing session.
    owners: HashMap<u64, u64>,
    /// Producing session → its live handle id.
    current: HashMap<u64, u64>,
    next_handle: u64,
}

impl HandleTable {
    fn publish(&mut self, session: u64, artifact: Artifact) -> ArtifactHandle {
        self.release(session);
        self.next_handle += 1;
        let id = self.next_handle;
        let kind = artifact.kind();
        self.slots.entry(session).or_default().fill(artifact);
        self.owners.insert(id, session);
        self.current.insert(session, id);
        ArtifactHandle { id, kind }
    }

    fn resolve(&self, handle: ArtifactHandle) -> Result<&Artifact> {
        self.owners
            .get(&handle.id)
            .and_then(|session| self.slots.get(session))
            .and_then(OutputSlot::get)
            .ok_or_else(|| EngineError::Remote(format!("artifact handle {} is not live", handle.id)))
    }

    fn release(&mut self, session: u64) {
        if let Some(id) = self.current.remove(&session) {
            self.owners.remove(&id);
        }
        if let Some(slot) = self.slots.get_mut(&session) {
            slot.release();
        }
    }

    fn live(&self) -> usize {
        self.owners.len()
    }
}

/// Whether `artifact` stays on the server in handle mode.
fn stays_on_device(artifact: &Artifact) -> bool {
    match artifact {
        Artifact::Frame(frame) => frame.residency == Residency::Device,
        Artifact::Ladder(frames) => frames.iter().all(|f| f.residency == Residency::Device),
        _ => false,
    }
}

// ─── Connection ──────────────────────────────────────────────────────────────

struct Connection {
    accel: Arc<dyn Accelerator>,
    channel: u64,
    transfer: Option<TransferMode>,
    devices: Vec<DeviceHandle>,
    sessions: HashMap<u64, Box<dyn StageSession>>,
    /// Session ids in creation order, for reverse teardown.
    order: Vec<u64>,
    next_session: u64,
    handles: HandleTable,
}

impl Connection {
    fn new(accel: Arc<dyn Accelerator>, channel: u64) -> Self {
        Self {
            accel,
            channel,
            transfer: None,
            devices: Vec::new(),
            sessions: HashMap::new(),
            order: Vec::new(),
            next_session: 0,
            handles: HandleTable::default(),
        }
    }

    fn serve(mut self, stream: TcpStream) -> std::result::Result<(), ProtoError> {
        stream.set_nodelay(true)?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream);
        let result = loop {
            let request: Request = match read_frame(&mut reader) {
                Ok(request) => request,
                Err(ProtoError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                    debug!(channel = self.channel, "Client disconnected");
                    break Ok(());
                }
                Err(err) => break Err(err),
            };
            let goodbye = matches!(request, Request::Goodbye);
            let response = self.dispatch(request);
            if let Err(err) = write_frame(&mut writer, &response) {
                break Err(err);
            }
            if goodbye {
                break Ok(());
            }
        };
        self.teardown();
        result
    }

    fn dispatch(&mut self, request: Request) -> Response {
        if self.transfer.is_none() && !matches!(request, Request::Hello { .. }) {
            return Response::Err {
                error: WireError::from(&EngineError::Protocol("expected Hello first".into())),
            };
        }
        match self.handle(request) {
            Ok(response) => response,
            Err(err) => {
                debug!(channel = self.channel, code = err.error_code(), error = %err, "Request failed");
                Response::Err {
                    error: WireError::from(&err),
                }
            }
        }
    }

    fn handle(&mut self, request: Request) -> Result<Response> {
        match request {
            Request::Hello { version, transfer } => {
                if version != PROTOCOL_VERSION {
                    return Err(EngineError::Protocol(format!(
                        "protocol version mismatch: server={PROTOCOL_VERSION}, client={version}"
                    )));
                }
                self.transfer = Some(transfer);
                info!(channel = self.channel, ?transfer, "Client handshake");
                Ok(Response::HelloOk {
                    version: PROTOCOL_VERSION,
                    accelerator: self.accel.name().to_string(),
                })
            }
            Request::OpenDevice { index } => {
                let device = self.accel.open_device(index)?;
                self.devices.push(device);
                Ok(Response::Device { device })
            }
            Request::CloseDevice { device } => {
                self.accel.close_device(device)?;
                self.devices.retain(|d| *d != device);
                Ok(Response::Ok)
            }
            Request::Init {
                device,
                role,
                params,
            } => {
                let session = self.accel.init_stage(device, role, &params)?;
                self.next_session += 1;
                let id = self.next_session;
                self.sessions.insert(id, session);
                self.order.push(id);
                debug!(channel = self.channel, session = id, %role, "Remote session created");
                Ok(Response::Session { session: id })
            }
            Request::Send { session, input } => {
                let input = match input {
                    None => None,
                    Some(WireArtifact::Handle(handle)) => Some(self.handles.resolve(handle)?),
                    Some(WireArtifact::Inline(artifact)) => {
                        let stage = self.session(session)?;
                        let status = stage.send(Some(&artifact))?;
                        return Ok(Response::Sent { status });
                    }
                };
                let stage = self
                    .sessions
                    .get_mut(&session)
                    .ok_or_else(|| unknown_session(session))?;
                let status = stage.send(input)?;
                Ok(Response::Sent { status })
            }
            Request::Receive { session } => {
                self.handles.release(session);
                let status = self.session(session)?.receive()?;
                let status = match status {
                    RecvStatus::Ready(artifact) => {
                        let keep = self.transfer == Some(TransferMode::Handle)
                            && stays_on_device(&artifact);
                        if keep {
                            WireRecv::Ready(WireArtifact::Handle(
                                self.handles.publish(session, artifact),
                            ))
                        } else {
                            WireRecv::Ready(WireArtifact::Inline(artifact))
                        }
                    }
                    RecvStatus::TryAgain => WireRecv::TryAgain,
                    RecvStatus::NeedMoreInput => WireRecv::NeedMoreInput,
                    RecvStatus::EndOfStream => WireRecv::EndOfStream,
                };
                Ok(Response::Received { status })
            }
            Request::Close { session } => {
                self.handles.release(session);
                if let Some(mut stage) = self.sessions.remove(&session) {
                    self.order.retain(|id| *id != session);
                    stage.close()?;
                }
                Ok(Response::Ok)
            }
            Request::Goodbye => Ok(Response::Ok),
        }
    }

    fn session(&mut self, session: u64) -> Result<&mut Box<dyn StageSession>> {
        self.sessions
            .get_mut(&session)
            .ok_or_else(|| unknown_session(session))
    }

    /// Close what the client left open: sessions newest first, then devices.
    fn teardown(&mut self) {
        while let Some(id) = self.order.pop() {
            self.handles.release(id);
            if let Some(mut stage) = self.sessions.remove(&id)
                && let Err(err) = stage.close()
            {
                warn!(channel = self.channel, session = id, error = %err, "Session close failed");
            }
        }
        while let Some(device) = self.devices.pop() {
            if let Err(err) = self.accel.close_device(device) {
                warn!(channel = self.channel, %device, error = %err, "Device close failed");
            }
        }
        debug!(channel = self.channel, live_handles = self.handles.live(), "Connection closed");
    }
}

fn unknown_session(session: u64) -> EngineError {
    EngineError::Remote(format!("unknown session {session}"))
}
