//! Reverse RPC channel over a single uplink connection.
//!
//! The link dials the broker, but it is the broker that issues calls. To get
//! there the HTTP/2 roles are swapped after the TCP connection is set up:
//! the broker drives the connection as an h2 client ([`BrokerChannel`]) and
//! the link answers as an h2 server ([`LinkChannel`]). Every call is one h2
//! stream whose bodies carry length-delimited JSON frames in both directions.

use bytes::{Bytes, BytesMut};
use futures_util::future::poll_fn;
use h2::{client::SendRequest, Reason, RecvStream, SendStream};
use http::{Method, Request, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use udig_protocol::TunnelCodec;

use crate::TunnelError;

/// Authority used in call URIs. The link never looks at it.
const CALL_AUTHORITY: &str = "uplink";

/// Incoming calls buffered before the link stops reading new streams
const ACCEPT_BACKLOG: usize = 64;

/// Broker side of an uplink connection. Opens calls towards the link.
#[derive(Clone)]
pub struct BrokerChannel {
    send_request: SendRequest<Bytes>,
    closed: CancellationToken,
}

impl BrokerChannel {
    /// Start the h2 client over an accepted uplink connection.
    ///
    /// The connection is driven by a background task until the peer goes
    /// away or [`close`](Self::close) is called.
    pub async fn handshake<T>(io: T) -> Result<Self, TunnelError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (send_request, connection) = h2::client::handshake(io).await?;
        let closed = CancellationToken::new();

        let token = closed.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = connection => {
                    if let Err(e) = result {
                        tracing::debug!("Uplink connection ended: {}", e);
                    }
                }
                _ = token.cancelled() => {
                    tracing::debug!("Uplink connection closed locally");
                }
            }
            token.cancel();
        });

        Ok(Self {
            send_request,
            closed,
        })
    }

    /// Open a call on `path` and wait for the link to accept it
    pub async fn open(&self, path: &str) -> Result<TunnelStream, TunnelError> {
        if self.closed.is_cancelled() {
            return Err(TunnelError::ConnectionClosed);
        }

        let mut send_request = self.send_request.clone().ready().await?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{}{}", CALL_AUTHORITY, path))
            .body(())?;

        let (response, send) = send_request.send_request(request, false)?;
        let response = response.await?;
        if response.status() != StatusCode::OK {
            return Err(TunnelError::Protocol(format!(
                "call {} refused with status {}",
                path,
                response.status()
            )));
        }

        Ok(TunnelStream::new(send, response.into_body()))
    }

    /// Resolves once the underlying connection is gone
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Tear down the connection and every stream on it
    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// A call opened by the broker, as seen by the link
pub struct IncomingStream {
    pub path: String,
    pub stream: TunnelStream,
}

/// Link side of an uplink connection. Yields the calls the broker opens.
pub struct LinkChannel {
    incoming: mpsc::Receiver<IncomingStream>,
}

impl LinkChannel {
    /// Start the h2 server over a dialed uplink connection.
    ///
    /// The connection is driven until the broker goes away or this value
    /// is dropped. Dropping it also kills every stream taken from it.
    pub async fn handshake<T>(io: T) -> Result<Self, TunnelError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut connection = h2::server::handshake(io).await?;
        let (tx, incoming) = mpsc::channel(ACCEPT_BACKLOG);

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    next = connection.accept() => next,
                    _ = tx.closed() => break,
                };

                let (request, mut respond) = match next {
                    Some(Ok(call)) => call,
                    Some(Err(e)) => {
                        tracing::debug!("Uplink connection ended: {}", e);
                        break;
                    }
                    None => break,
                };

                let path = request.uri().path().to_string();
                let send = match respond.send_response(Response::new(()), false) {
                    Ok(send) => send,
                    Err(e) => {
                        tracing::warn!("Failed to accept call {}: {}", path, e);
                        continue;
                    }
                };

                // Never wait on the backlog; a full one refuses the call
                let stream = TunnelStream::new(send, request.into_body());
                match tx.try_send(IncomingStream { path, stream }) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(mut incoming)) => {
                        tracing::warn!("Accept backlog full, refusing call {}", incoming.path);
                        incoming.stream.refuse();
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            tracing::debug!("Uplink connection driver stopped");
        });

        Ok(Self { incoming })
    }

    /// Next call from the broker, or `None` once the connection is gone
    pub async fn accept(&mut self) -> Option<IncomingStream> {
        self.incoming.recv().await
    }
}

/// One bidirectional call carrying framed messages
pub struct TunnelStream {
    sender: StreamSender,
    receiver: StreamReceiver,
}

impl TunnelStream {
    fn new(send: SendStream<Bytes>, recv: RecvStream) -> Self {
        Self {
            sender: StreamSender { inner: send },
            receiver: StreamReceiver {
                inner: recv,
                buffer: BytesMut::new(),
            },
        }
    }

    pub async fn send<T: Serialize>(&mut self, message: T) -> Result<(), TunnelError> {
        self.sender.send(message).await
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TunnelError> {
        self.receiver.recv().await
    }

    pub fn finish(&mut self) -> Result<(), TunnelError> {
        self.sender.finish()
    }

    pub fn reset(&mut self) {
        self.sender.reset();
    }

    pub fn refuse(&mut self) {
        self.sender.refuse();
    }

    /// Split into halves that can be driven from separate tasks
    pub fn split(self) -> (StreamSender, StreamReceiver) {
        (self.sender, self.receiver)
    }
}

/// Sending half of a [`TunnelStream`]
pub struct StreamSender {
    inner: SendStream<Bytes>,
}

impl StreamSender {
    pub async fn send<T: Serialize>(&mut self, message: T) -> Result<(), TunnelError> {
        let mut frame = BytesMut::new();
        TunnelCodec::<T>::new().encode(message, &mut frame)?;
        self.send_bytes(frame.freeze()).await
    }

    /// Write raw bytes, waiting on the peer's flow-control window
    async fn send_bytes(&mut self, mut data: Bytes) -> Result<(), TunnelError> {
        while !data.is_empty() {
            self.inner.reserve_capacity(data.len());

            let mut available = self.inner.capacity();
            while available == 0 {
                match poll_fn(|cx| self.inner.poll_capacity(cx)).await {
                    Some(Ok(n)) => available = n,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(TunnelError::ConnectionClosed),
                }
            }

            let chunk = data.split_to(available.min(data.len()));
            self.inner.send_data(chunk, false)?;
        }
        Ok(())
    }

    /// Half-close: the peer reads end-of-stream after the last frame
    pub fn finish(&mut self) -> Result<(), TunnelError> {
        self.inner.send_data(Bytes::new(), true)?;
        Ok(())
    }

    /// Abort the whole stream
    pub fn reset(&mut self) {
        self.inner.send_reset(Reason::CANCEL);
    }

    /// Abort the stream because its target could not be reached
    pub fn refuse(&mut self) {
        self.inner.send_reset(Reason::REFUSED_STREAM);
    }
}

/// Receiving half of a [`TunnelStream`]
pub struct StreamReceiver {
    inner: RecvStream,
    buffer: BytesMut,
}

impl StreamReceiver {
    /// Next message, or `None` when the peer finished cleanly
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TunnelError> {
        let mut codec = TunnelCodec::<T>::new();
        loop {
            if let Some(message) = codec.decode(&mut self.buffer)? {
                return Ok(Some(message));
            }

            match self.inner.data().await {
                Some(Ok(chunk)) => {
                    self.inner.flow_control().release_capacity(chunk.len())?;
                    self.buffer.extend_from_slice(&chunk);
                }
                Some(Err(e)) => return Err(e.into()),
                None if self.buffer.is_empty() => return Ok(None),
                None => {
                    return Err(TunnelError::Protocol(format!(
                        "stream ended inside a frame ({} bytes left)",
                        self.buffer.len()
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use udig_protocol::{Down, RegisterRequest, RegisterTrigger, Up, REGISTER_PATH};

    async fn connected_pair() -> (BrokerChannel, LinkChannel) {
        let (broker_io, link_io) = tokio::io::duplex(64 * 1024);
        let (broker, link) = tokio::join!(
            BrokerChannel::handshake(broker_io),
            LinkChannel::handshake(link_io)
        );
        (broker.unwrap(), link.unwrap())
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (broker, mut link) = connected_pair().await;

        let caller = tokio::spawn(async move {
            let mut stream = broker.open(REGISTER_PATH).await.unwrap();
            stream
                .send(RegisterTrigger {
                    nonce: vec![1, 2, 3],
                })
                .await
                .unwrap();
            let reply: RegisterRequest = stream.recv().await.unwrap().unwrap();
            let end: Option<RegisterRequest> = stream.recv().await.unwrap();
            (broker, reply, end)
        });

        let incoming = timeout(Duration::from_secs(5), link.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(incoming.path, REGISTER_PATH);

        let mut stream = incoming.stream;
        let trigger: RegisterTrigger = stream.recv().await.unwrap().unwrap();
        assert_eq!(trigger.nonce, vec![1, 2, 3]);

        stream
            .send(RegisterRequest {
                ed25519_public_key: vec![9; 32],
                signature: vec![8; 64],
                ports: vec![443],
            })
            .await
            .unwrap();
        stream.finish().unwrap();

        let (_broker, reply, end) = caller.await.unwrap();
        assert_eq!(reply.ports, vec![443]);
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_large_message_respects_flow_control() {
        let (broker, mut link) = connected_pair().await;
        let payload = vec![0x5a; 1024 * 1024];

        let expected = payload.clone();
        let reader = tokio::spawn(async move {
            let incoming = link.accept().await.unwrap();
            let (_send, mut recv) = incoming.stream.split();
            let up: Up = recv.recv().await.unwrap().unwrap();
            assert_eq!(up.data, expected);
            link
        });

        let mut stream = broker.open("/test/Large").await.unwrap();
        timeout(
            Duration::from_secs(10),
            stream.send(Up {
                header: None,
                data: payload,
                finish: false,
            }),
        )
        .await
        .unwrap()
        .unwrap();

        timeout(Duration::from_secs(10), reader)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_reset_surfaces_as_error() {
        let (broker, mut link) = connected_pair().await;

        let opener = tokio::spawn(async move {
            let stream = broker.open("/test/Reset").await.unwrap();
            (broker, stream)
        });
        let incoming = link.accept().await.unwrap();
        let (_broker, mut stream) = opener.await.unwrap();

        let (mut send, _recv) = incoming.stream.split();
        send.reset();

        let result = timeout(Duration::from_secs(5), stream.recv::<Down>())
            .await
            .unwrap();
        assert!(result.unwrap_err().is_disconnect());
    }

    #[tokio::test]
    async fn test_full_backlog_refuses_without_stalling() {
        let (broker, mut link) = connected_pair().await;

        let mut first = broker.open("/test/First").await.unwrap();
        let mut accepted = timeout(Duration::from_secs(5), link.accept())
            .await
            .unwrap()
            .unwrap()
            .stream;

        // Nobody accepts these, so they fill the backlog
        let mut queued = Vec::new();
        for _ in 0..ACCEPT_BACKLOG {
            queued.push(broker.open("/test/Queued").await.unwrap());
        }

        let mut overflow = broker.open("/test/Overflow").await.unwrap();
        let result = timeout(Duration::from_secs(5), overflow.recv::<Down>())
            .await
            .unwrap();
        assert!(result.unwrap_err().is_disconnect());

        // Streams already handed out keep working
        first
            .send(Up {
                header: None,
                data: b"alive".to_vec(),
                finish: false,
            })
            .await
            .unwrap();
        let up: Up = timeout(Duration::from_secs(5), accepted.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(up.data, b"alive");
        assert_eq!(queued.len(), ACCEPT_BACKLOG);
    }

    #[tokio::test]
    async fn test_dropping_link_closes_broker_channel() {
        let (broker, link) = connected_pair().await;
        assert!(!broker.is_closed());

        drop(link);

        timeout(Duration::from_secs(5), broker.closed())
            .await
            .expect("broker channel should observe the disconnect");
        assert!(broker.is_closed());
        assert!(broker.open("/test/Late").await.is_err());
    }
}
