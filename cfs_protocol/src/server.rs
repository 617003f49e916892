//! Server side: request validation, dispatch, and the replication
//! session.
//!
//! One connection serves either operations (Request/Response frames) or
//! a replication session (State frames followed by a raw byte splice);
//! the first non-handshake frame decides which.

use std::sync::Arc;

use cfs_core::KEY_SIZE;
use cfs_fs::{Cfs, CfsRegistry};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::codec::{Frame, FrameCodec};
use crate::error::{ProtocolError, ProtocolResult, codes};
use crate::message::{self, DriveRef, Operation, Request, Response, StateFrame, error_code};
use crate::ops;
use crate::protocol::accept_handshake;
use crate::session::{Session, SessionState};

/// Serves one connection end to end: handshake, then either the
/// operation loop or a replication session.
pub async fn serve_connection<T>(io: T, registry: Arc<CfsRegistry>) -> ProtocolResult<()>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut framed = Framed::new(io, FrameCodec::new());
    accept_handshake(&mut framed).await?;

    while let Some(frame) = framed.next().await {
        match frame? {
            Frame::Request(request) => {
                let response = handle_request(request, &registry).await;
                framed.send(Frame::Response(response)).await?;
            }
            Frame::State(state) => {
                return serve_session(framed, state, &registry).await;
            }
            Frame::Handshake(_) | Frame::Response(_) => {
                warn!("unexpected frame after handshake");
            }
        }
    }
    Ok(())
}

/// Validates and dispatches one request, always producing a response.
/// The echoed request is scrubbed: its buffer and any drive secret key
/// are zeroed, and the response nonce is the hash of the request nonce.
pub async fn handle_request(request: Request, registry: &CfsRegistry) -> Response {
    let outcome = process(&request, registry).await;
    let (error_code, buffer) = match outcome {
        Ok(buffer) => (error_code::NO_ERROR, buffer),
        Err((code, message)) => {
            warn!(
                code,
                operation = request.operation,
                "request failed: {message}"
            );
            (code, message.into_bytes())
        }
    };
    reply(request, error_code, buffer)
}

fn reply(mut request: Request, error_code: u32, buffer: Vec<u8>) -> Response {
    let nonce = message::response_nonce(&request.nonce);
    request.buffer = Vec::new();
    let drive = request.drive.take().map(DriveRef::zeroed);
    request.drive = drive.clone();
    Response {
        operation: request.operation,
        error_code,
        request,
        buffer,
        nonce,
        drive,
    }
}

async fn process(request: &Request, registry: &CfsRegistry) -> Result<Vec<u8>, (u32, String)> {
    if request.nonce.is_empty() {
        debug!(code = codes::BAD_REQUEST_NONCE, "rejecting request");
        return Err((
            error_code::BAD_REQUEST,
            "invalid or missing nonce in request".into(),
        ));
    }

    let Some(operation) = Operation::from_code(request.operation) else {
        debug!(code = codes::BAD_REQUEST_OPERATION, "rejecting request");
        return Err((
            error_code::BAD_REQUEST,
            format!("invalid operation code: {}", request.operation),
        ));
    };

    let cfs = match &request.drive {
        Some(drive) => {
            if drive.key.len() != KEY_SIZE {
                debug!(code = codes::BAD_REQUEST_DRIVE_KEY_LENGTH, "rejecting request");
                return Err((error_code::BAD_REQUEST, "invalid drive key length".into()));
            }
            let mut key = [0u8; KEY_SIZE];
            key.copy_from_slice(&drive.key);
            registry.lookup(&drive.id, &key)
        }
        None => None,
    };

    ops::dispatch(operation, cfs.as_deref(), &request.buffer)
        .await
        .map_err(|err| (err.code(), err.to_string()))
}

/// Runs the replication session after the first State frame arrived,
/// finishing with a bidirectional splice between the socket and the
/// drive's replication stream.
async fn serve_session<T>(
    mut framed: Framed<T, FrameCodec>,
    first: StateFrame,
    registry: &CfsRegistry,
) -> ProtocolResult<()>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut session = Session::new();

    expect(&mut session, &first, SessionState::Connect)?;
    send_state(&mut framed, &mut session, SessionState::ConnectAck, Vec::new()).await?;

    // Credentials: an AUTH frame carrying a drive reference.
    let auth = receive_state(&mut framed, &mut session, SessionState::Auth).await?;
    let cfs = match credentials(&auth, registry) {
        Some(cfs) => {
            debug!(key_path = cfs.key_path(), "authentication accepted");
            send_state(&mut framed, &mut session, SessionState::AuthAccept, Vec::new()).await?;
            cfs
        }
        None => {
            debug!("authentication denied");
            send_state(&mut framed, &mut session, SessionState::AuthDeny, Vec::new()).await?;
            return Ok(());
        }
    };

    receive_state(&mut framed, &mut session, SessionState::StreamProbe).await?;
    send_state(&mut framed, &mut session, SessionState::StreamAck, Vec::new()).await?;
    receive_state(&mut framed, &mut session, SessionState::StreamPull).await?;
    send_state(&mut framed, &mut session, SessionState::StreamAcq, Vec::new()).await?;

    let parts = framed.into_parts();
    let mut io = parts.io;
    let mut stream = cfs.replicate(None).await?;
    if !parts.read_buf.is_empty() {
        stream.write_all(&parts.read_buf).await?;
    }
    let (to_drive, to_peer) = tokio::io::copy_bidirectional(&mut io, &mut stream).await?;
    debug!(to_drive, to_peer, "replication stream finished");
    Ok(())
}

fn credentials(payload: &[u8], registry: &CfsRegistry) -> Option<Arc<Cfs>> {
    let drive: DriveRef = minicbor::decode(payload).ok()?;
    if drive.id.is_empty() || drive.key.len() != KEY_SIZE {
        return None;
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&drive.key);
    registry.lookup(&drive.id, &key)
}

fn expect(
    session: &mut Session,
    frame: &StateFrame,
    expected: SessionState,
) -> ProtocolResult<()> {
    session.set_state(expected)?;
    let got = SessionState::from_code(frame.state);
    if got != expected {
        return Err(ProtocolError::InvalidState {
            current: session.state(),
            target: got,
        });
    }
    Ok(())
}

async fn send_state<T>(
    framed: &mut Framed<T, FrameCodec>,
    session: &mut Session,
    state: SessionState,
    payload: Vec<u8>,
) -> ProtocolResult<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    session.set_state(state)?;
    framed
        .send(Frame::State(StateFrame {
            state: state.code(),
            payload,
        }))
        .await
}

async fn receive_state<T>(
    framed: &mut Framed<T, FrameCodec>,
    session: &mut Session,
    expected: SessionState,
) -> ProtocolResult<Vec<u8>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let frame = match framed
        .next()
        .await
        .ok_or(ProtocolError::ConnectionClosed)??
    {
        Frame::State(frame) => frame,
        _ => return Err(ProtocolError::ConnectionClosed),
    };
    expect(session, &frame, expected)?;
    Ok(frame.payload)
}
