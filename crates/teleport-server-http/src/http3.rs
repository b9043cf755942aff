//! HTTP/3 on the tunnel endpoint
//!
//! Clients that follow the relay's `Alt-Svc` advertisement arrive on the QUIC
//! listener with the `h3` ALPN. Their requests go through the same router as
//! the plain HTTP listener, middleware included.

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::Router;
use bytes::{Buf, Bytes};
use h3::server::RequestStream;
use http::{Request, Response, Version};
use http_body::Frame;
use http_body_util::BodyExt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;
use tower::ServiceExt;
use tracing::{debug, trace};

use crate::proxy::strip_hop_by_hop;

/// Request body chunks buffered between the QUIC stream and the handler
const BODY_BUFFER: usize = 8;

#[derive(Debug, Error)]
pub enum Http3Error {
    #[error("HTTP/3 connection error: {0}")]
    Connection(String),

    #[error("HTTP/3 stream error: {0}")]
    Stream(String),

    #[error("Response body error: {0}")]
    Body(String),
}

/// Serves HTTP/3 connections with the relay's router
#[derive(Clone)]
pub struct Http3Server {
    router: Router,
}

impl Http3Server {
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    /// Serve requests until the client closes the connection
    pub async fn serve_connection(&self, conn: quinn::Connection) -> Result<(), Http3Error> {
        let remote_addr = conn.remote_address();
        let mut h3_conn = h3::server::Connection::<_, Bytes>::new(h3_quinn::Connection::new(conn))
            .await
            .map_err(|e| Http3Error::Connection(e.to_string()))?;
        debug!("Serving HTTP/3 for {}", remote_addr);

        loop {
            match h3_conn.accept().await {
                Ok(Some(resolver)) => {
                    let router = self.router.clone();
                    tokio::spawn(async move {
                        let (req, stream) = match resolver.resolve_request().await {
                            Ok(resolved) => resolved,
                            Err(e) => {
                                debug!("Bad HTTP/3 request from {}: {}", remote_addr, e);
                                return;
                            }
                        };

                        let (send, recv) = stream.split();
                        let (tx, rx) = mpsc::channel(BODY_BUFFER);
                        let body = RequestBody { rx };
                        let (_, result) = tokio::join!(
                            pump_body(recv, tx),
                            respond(router, req, body, send, remote_addr)
                        );
                        if let Err(e) = result {
                            debug!("HTTP/3 response to {} failed: {}", remote_addr, e);
                        }
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("HTTP/3 connection from {} closed: {}", remote_addr, e);
                    break;
                }
            }
        }

        trace!("HTTP/3 connection from {} finished", remote_addr);
        Ok(())
    }
}

async fn respond<S>(
    router: Router,
    req: Request<()>,
    body: RequestBody,
    mut send: RequestStream<S, Bytes>,
    remote_addr: SocketAddr,
) -> Result<(), Http3Error>
where
    S: h3::quic::SendStream<Bytes>,
{
    let (mut parts, ()) = req.into_parts();
    parts.version = Version::HTTP_3;
    parts.extensions.insert(ConnectInfo(remote_addr));
    let req = Request::from_parts(parts, Body::new(body));

    let response = match router.oneshot(req).await {
        Ok(response) => response,
        Err(never) => match never {},
    };

    let (mut parts, mut body) = response.into_parts();
    // Connection-specific headers are not allowed in HTTP/3
    strip_hop_by_hop(&mut parts.headers);
    send.send_response(Response::from_parts(parts, ()))
        .await
        .map_err(stream_error)?;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| Http3Error::Body(e.to_string()))?;
        match frame.into_data() {
            Ok(data) => send.send_data(data).await.map_err(stream_error)?,
            Err(frame) => {
                if let Ok(trailers) = frame.into_trailers() {
                    send.send_trailers(trailers).await.map_err(stream_error)?;
                }
            }
        }
    }

    send.finish().await.map_err(stream_error)
}

/// Feed the client's request body into the handler until either side is done
async fn pump_body<S>(mut recv: RequestStream<S, Bytes>, tx: mpsc::Sender<io::Result<Bytes>>)
where
    S: h3::quic::RecvStream,
{
    loop {
        let chunk = tokio::select! {
            chunk = recv.recv_data() => chunk,
            _ = tx.closed() => return,
        };

        match chunk {
            Ok(Some(mut buf)) => {
                let bytes = buf.copy_to_bytes(buf.remaining());
                if tx.send(Ok(bytes)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                return;
            }
        }
    }
}

fn stream_error(e: impl std::fmt::Display) -> Http3Error {
    Http3Error::Stream(e.to_string())
}

struct RequestBody {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl http_body::Body for RequestBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|result| result.map(Frame::data)))
    }
}
