//! Client-side protocol: the nonce handshake, multiplexed operation
//! requests, and the replication session.

use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::codec::{Frame, FrameCodec};
use crate::error::{ProtocolError, ProtocolResult, codes};
use crate::message::{
    self, DriveRef, Handshake, Operation, Request, Response, StateFrame, error_code,
};
use crate::session::{Session, SessionState};

/// Performs the client half of the nonce handshake on a fresh
/// connection.
pub async fn handshake<T>(framed: &mut Framed<T, FrameCodec>) -> ProtocolResult<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let nonce = message::nonce();
    let key = message::handshake_key(&nonce);
    framed
        .send(Frame::Handshake(Handshake {
            nonce: nonce.clone(),
            key: key.clone(),
            ack: false,
        }))
        .await?;

    let frame = framed
        .next()
        .await
        .ok_or(ProtocolError::ConnectionClosed)??;
    let Frame::Handshake(echo) = frame else {
        return Err(ProtocolError::bad_handshake(
            codes::BAD_HANDSHAKE_ACK,
            "expected a handshake frame",
        ));
    };
    if !echo.ack {
        return Err(ProtocolError::bad_handshake(
            codes::BAD_HANDSHAKE_ACK,
            "missing ack in handshake",
        ));
    }
    if echo.nonce != nonce {
        return Err(ProtocolError::bad_handshake(
            codes::BAD_HANDSHAKE_NONCE,
            "nonce mismatch in handshake",
        ));
    }
    if echo.key != key {
        return Err(ProtocolError::bad_handshake(
            codes::BAD_HANDSHAKE_KEY,
            "key mismatch in handshake",
        ));
    }
    debug!("handshake complete");
    Ok(())
}

/// Performs the server half of the nonce handshake. Any verification
/// failure is fatal; the caller tears the connection down.
pub async fn accept_handshake<T>(framed: &mut Framed<T, FrameCodec>) -> ProtocolResult<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let frame = framed
        .next()
        .await
        .ok_or(ProtocolError::ConnectionClosed)??;
    let Frame::Handshake(hello) = frame else {
        return Err(ProtocolError::bad_handshake(
            codes::BAD_HANDSHAKE_VERIFY,
            "expected a handshake frame",
        ));
    };
    if hello.nonce.is_empty() {
        return Err(ProtocolError::bad_handshake(
            codes::BAD_HANDSHAKE_NONCE,
            "invalid or missing nonce in handshake",
        ));
    }
    if hello.key.is_empty() {
        return Err(ProtocolError::bad_handshake(
            codes::BAD_HANDSHAKE_KEY,
            "invalid or missing key in handshake",
        ));
    }
    if hello.ack {
        return Err(ProtocolError::bad_handshake(
            codes::BAD_HANDSHAKE_ACK,
            "unexpected ack in handshake",
        ));
    }
    if message::handshake_key(&hello.nonce) != hello.key {
        return Err(ProtocolError::bad_handshake(
            codes::BAD_HANDSHAKE_VERIFY,
            "verification failed in handshake",
        ));
    }
    framed
        .send(Frame::Handshake(Handshake { ack: true, ..hello }))
        .await?;
    Ok(())
}

/// Multiplexed request/response client over a completed handshake.
///
/// Responses are correlated to requests solely by nonce equality, never
/// by arrival order, so any number of `send` calls may be in flight.
pub struct ProtocolClient {
    requests: mpsc::Sender<Request>,
    waiters: Arc<DashMap<Vec<u8>, oneshot::Sender<Response>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl std::fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("in_flight", &self.waiters.len())
            .finish()
    }
}

impl ProtocolClient {
    /// Spawns the reader and writer tasks over a framed transport whose
    /// handshake already completed.
    pub fn spawn<T>(framed: Framed<T, FrameCodec>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut sink, mut stream) = framed.split();
        let (requests, mut request_rx) = mpsc::channel::<Request>(32);
        let waiters: Arc<DashMap<Vec<u8>, oneshot::Sender<Response>>> = Arc::new(DashMap::new());

        let writer = tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                if let Err(err) = sink.send(Frame::Request(request)).await {
                    warn!(%err, "request write failed");
                    break;
                }
            }
        });

        let reader = tokio::spawn({
            let waiters = waiters.clone();
            async move {
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(Frame::Response(response)) => {
                            match waiters.remove(&response.request.nonce) {
                                Some((_, tx)) => {
                                    let _ = tx.send(response);
                                }
                                None => warn!("response without a matching request"),
                            }
                        }
                        Ok(_) => warn!("unexpected frame on operations connection"),
                        Err(err) => {
                            warn!(%err, "response read failed");
                            break;
                        }
                    }
                }
                // Dropping the waiters wakes every pending send with a
                // closed-connection error.
                waiters.clear();
            }
        });

        Self {
            requests,
            waiters,
            reader,
            writer,
        }
    }

    /// Sends one request and waits for its correlated response. The
    /// response nonce must be the hash of the request nonce.
    pub async fn send(
        &self,
        operation: Operation,
        drive: Option<DriveRef>,
        buffer: Vec<u8>,
    ) -> ProtocolResult<Response> {
        let nonce = message::nonce();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(nonce.clone(), tx);

        let request = Request {
            nonce: nonce.clone(),
            operation: operation.code(),
            drive,
            buffer,
        };
        if self.requests.send(request).await.is_err() {
            self.waiters.remove(&nonce);
            return Err(ProtocolError::ConnectionClosed);
        }

        let response = rx.await.map_err(|_| ProtocolError::ConnectionClosed)?;
        if response.nonce != message::response_nonce(&nonce) {
            return Err(ProtocolError::BadNonce);
        }
        Ok(response)
    }

    /// Like [`send`](Self::send) but turns error responses into typed
    /// errors and yields the result buffer.
    pub async fn call(
        &self,
        operation: Operation,
        drive: Option<DriveRef>,
        buffer: Vec<u8>,
    ) -> ProtocolResult<Vec<u8>> {
        let response = self.send(operation, drive, buffer).await?;
        if response.error_code != error_code::NO_ERROR {
            return Err(ProtocolError::Remote {
                code: response.error_code,
                message: String::from_utf8_lossy(&response.buffer).into_owned(),
            });
        }
        Ok(response.buffer)
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Client side of the replication session state machine.
pub struct ClientSession<T> {
    framed: Framed<T, FrameCodec>,
    session: Session,
}

impl<T> ClientSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a framed transport whose handshake already completed.
    pub fn new(framed: Framed<T, FrameCodec>) -> Self {
        Self {
            framed,
            session: Session::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// CONNECT / CONNECT_ACK exchange.
    pub async fn connect(&mut self) -> ProtocolResult<()> {
        self.send_state(SessionState::Connect, Vec::new()).await?;
        self.receive_state(SessionState::ConnectAck).await?;
        Ok(())
    }

    /// Presents `(id, key)` credentials. Returns `false` on a deny: the
    /// session optimistically expects ACCEPT, and a DENY on the wire is
    /// absorbed by reverting that transition rather than failing.
    pub async fn authenticate(&mut self, id: &[u8], key: &[u8]) -> ProtocolResult<bool> {
        let payload = minicbor::to_vec(&DriveRef {
            id: id.to_vec(),
            key: key.to_vec(),
            secret_key: Vec::new(),
        })?;
        self.send_state(SessionState::Auth, payload).await?;

        let frame = self.next_state().await?;
        self.session.set_state(SessionState::AuthAccept)?;
        match SessionState::from_code(frame.state) {
            SessionState::AuthAccept => Ok(true),
            SessionState::AuthDeny => {
                self.session.revert();
                self.session.set_state(SessionState::AuthDeny)?;
                Ok(false)
            }
            other => Err(ProtocolError::InvalidState {
                current: self.session.state(),
                target: other,
            }),
        }
    }

    /// PROBE/ACK/PULL/ACQ exchange; on success returns the underlying
    /// transport (plus any already-buffered bytes) for splicing into a
    /// replication stream.
    pub async fn pull(mut self) -> ProtocolResult<(T, bytes::BytesMut)> {
        self.send_state(SessionState::StreamProbe, Vec::new())
            .await?;
        self.receive_state(SessionState::StreamAck).await?;
        self.send_state(SessionState::StreamPull, Vec::new())
            .await?;
        self.receive_state(SessionState::StreamAcq).await?;

        let parts = self.framed.into_parts();
        Ok((parts.io, parts.read_buf))
    }

    async fn send_state(&mut self, state: SessionState, payload: Vec<u8>) -> ProtocolResult<()> {
        self.session.set_state(state)?;
        debug!(state = ?state, "send state");
        self.framed
            .send(Frame::State(StateFrame {
                state: state.code(),
                payload,
            }))
            .await
    }

    async fn next_state(&mut self) -> ProtocolResult<StateFrame> {
        match self
            .framed
            .next()
            .await
            .ok_or(ProtocolError::ConnectionClosed)??
        {
            Frame::State(frame) => Ok(frame),
            _ => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn receive_state(&mut self, expected: SessionState) -> ProtocolResult<Vec<u8>> {
        let frame = self.next_state().await?;
        self.session.set_state(expected)?;
        let got = SessionState::from_code(frame.state);
        debug!(state = ?got, "receive state");
        if got != expected {
            return Err(ProtocolError::InvalidState {
                current: self.session.state(),
                target: got,
            });
        }
        Ok(frame.payload)
    }
}
