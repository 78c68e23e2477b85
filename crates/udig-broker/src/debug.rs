use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;

use crate::router::RouteTable;

#[derive(Debug, Serialize)]
struct RouteInfo {
    tunnel_id: String,
    sessions: usize,
}

/// Plain HTTP endpoint exposing health and the current route table
pub struct DebugPlane {
    router: Arc<RouteTable>,
}

impl DebugPlane {
    pub fn new(router: Arc<RouteTable>) -> Arc<Self> {
        Arc::new(Self { router })
    }

    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!("Debug HTTP listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let this = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let this = this.clone();
                    async move { Ok::<_, Infallible>(this.handle_request(req)) }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::debug!("Debug HTTP connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }

    fn handle_request<B>(&self, req: Request<B>) -> Response<Full<Bytes>> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/healthz") => text(StatusCode::OK, "ok"),
            (&Method::GET, "/routes") => {
                let routes: Vec<RouteInfo> = self
                    .router
                    .snapshot()
                    .into_iter()
                    .map(|(tunnel_id, sessions)| RouteInfo {
                        tunnel_id,
                        sessions,
                    })
                    .collect();
                match serde_json::to_vec(&routes) {
                    Ok(body) => {
                        let mut response = Response::new(Full::new(Bytes::from(body)));
                        response
                            .headers_mut()
                            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                        response
                    }
                    Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
                }
            }
            (_, "/healthz") | (_, "/routes") => {
                text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
            }
            _ => text(StatusCode::NOT_FOUND, "not found"),
        }
    }
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
}
