//! Client side of the proxy: an [`Accelerator`] whose sessions live on a
//! stage server.
//!
//! All sessions of one [`RemoteAccelerator`] share its connection, so
//! handles produced by one remote stage can be fed to the next without
//! leaving the server.  The orchestrator cannot tell the difference.

use std::io::{BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use hwpipe_core::device::{Accelerator, DeviceHandle};
use hwpipe_core::error::{EngineError, Result};
use hwpipe_core::params::StreamParams;
use hwpipe_core::stage::{RecvStatus, SendStatus, StageRole, StageSession};
use hwpipe_core::types::Artifact;

use crate::proto::{
    PROTOCOL_VERSION, ProtoError, Request, Response, TransferMode, WireArtifact, read_frame,
    write_frame,
};

struct Link {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    /// Set on any framing failure; the stream position is unknown after it.
    broken: bool,
}

impl Link {
    fn new(stream: TcpStream) -> std::io::Result<Self> {
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
            broken: false,
        })
    }

    fn call(&mut self, request: &Request) -> Result<Response> {
        if self.broken {
            return Err(EngineError::Protocol(
                "connection unusable after an earlier framing error".into(),
            ));
        }
        let response = write_frame(&mut self.writer, request)
            .and_then(|()| read_frame::<_, Response>(&mut self.reader))
            .inspect_err(|err| {
                self.broken = true;
                warn!(error = %err, "Stage server connection lost");
            })?;
        match response {
            Response::Err { error } => Err(error.into()),
            response => Ok(response),
        }
    }
}

type SharedLink = Arc<Mutex<Link>>;

fn call(link: &SharedLink, request: &Request) -> Result<Response> {
    link.lock()
        .map_err(|_| EngineError::Remote("connection lock poisoned".into()))?
        .call(request)
}

fn unexpected(response: Response) -> EngineError {
    ProtoError::UnexpectedResponse(Box::new(response)).into()
}

pub struct RemoteAccelerator {
    link: SharedLink,
    transfer: TransferMode,
    name: String,
}

impl RemoteAccelerator {
    /// Connect and handshake.
    pub fn connect(addr: impl ToSocketAddrs, transfer: TransferMode) -> Result<Self> {
        let stream = TcpStream::connect(addr).map_err(ProtoError::from)?;
        stream.set_nodelay(true).map_err(ProtoError::from)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        let link = Arc::new(Mutex::new(Link::new(stream).map_err(ProtoError::from)?));

        let hello = Request::Hello {
            version: PROTOCOL_VERSION,
            transfer,
        };
        let accelerator = match call(&link, &hello)? {
            Response::HelloOk {
                version,
                accelerator,
            } if version == PROTOCOL_VERSION => accelerator,
            Response::HelloOk { version, .. } => {
                return Err(EngineError::Protocol(format!(
                    "protocol version mismatch: local={PROTOCOL_VERSION}, remote={version}"
                )));
            }
            other => return Err(unexpected(other)),
        };
        info!(%peer, remote = %accelerator, ?transfer, "Connected to stage server");

        Ok(Self {
            link,
            transfer,
            name: format!("remote:{accelerator}"),
        })
    }

    pub fn transfer(&self) -> TransferMode {
        self.transfer
    }
}

impl Accelerator for RemoteAccelerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_device(&self, index: u32) -> Result<DeviceHandle> {
        match call(&self.link, &Request::OpenDevice { index })? {
            Response::Device { device } => Ok(device),
            other => Err(unexpected(other)),
        }
    }

    fn init_stage(
        &self,
        device: DeviceHandle,
        role: StageRole,
        params: &StreamParams,
    ) -> Result<Box<dyn StageSession>> {
        let (options, dropped) = params.options.without_callbacks();
        if !dropped.is_empty() {
            warn!(%role, options = ?dropped, "Callback options cannot cross the wire, dropped");
        }
        let params = StreamParams {
            options,
            ..params.clone()
        };
        match call(&self.link, &Request::Init {
            device,
            role,
            params,
        })? {
            Response::Session { session } => {
                debug!(%role, session, "Remote session ready");
                Ok(Box::new(RemoteStage {
                    link: self.link.clone(),
                    session,
                    role,
                    closed: false,
                }))
            }
            other => Err(unexpected(other)),
        }
    }

    fn close_device(&self, device: DeviceHandle) -> Result<()> {
        match call(&self.link, &Request::CloseDevice { device })? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

impl Drop for RemoteAccelerator {
    fn drop(&mut self) {
        if let Err(err) = call(&self.link, &Request::Goodbye) {
            debug!(error = %err, "Goodbye not delivered");
        }
    }
}

/// A session running on the server.
pub struct RemoteStage {
    link: SharedLink,
    session: u64,
    role: StageRole,
    closed: bool,
}

impl StageSession for RemoteStage {
    fn role(&self) -> StageRole {
        self.role
    }

    fn send(&mut self, input: Option<&Artifact>) -> Result<SendStatus> {
        let request = Request::Send {
            session: self.session,
            input: input.map(|a| WireArtifact::from(a.clone())),
        };
        match call(&self.link, &request)? {
            Response::Sent { status } => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    fn receive(&mut self) -> Result<RecvStatus> {
        match call(&self.link, &Request::Receive {
            session: self.session,
        })? {
            Response::Received { status } => Ok(status.into()),
            other => Err(unexpected(other)),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match call(&self.link, &Request::Close {
            session: self.session,
        })? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
