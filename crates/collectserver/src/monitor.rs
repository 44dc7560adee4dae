// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Read-only HTTP status endpoint.
//!
//! `GET /debug/vars` answers `{"server": <stats snapshot>}`. `GET /e` answers 200 with an empty
//! body and serves as a liveness probe.

use std::convert::Infallible;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collector::accept_error_backoff;
use crate::errors::MonitorError;
use crate::stats::{Stats, StatsSnapshot};

#[derive(Serialize)]
struct Vars {
    server: StatsSnapshot,
}

/// Binds `addr` and serves until `cancel` fires. Returns the bound address and the server task.
pub async fn start(
    addr: &str,
    stats: Arc<Stats>,
    cancel: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>), MonitorError> {
    let resolved = addr
        .to_socket_addrs()
        .and_then(|mut addrs| {
            addrs
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses found"))
        })
        .map_err(|source| MonitorError::AddressResolution {
            addr: addr.to_string(),
            source,
        })?;
    let bind_error = |source| MonitorError::Bind {
        addr: resolved,
        source,
    };
    let listener = TcpListener::bind(resolved).await.map_err(bind_error)?;
    let local_addr = listener.local_addr().map_err(bind_error)?;
    info!("Monitor listening on http://{}", local_addr);

    Ok((local_addr, tokio::spawn(serve(listener, stats, cancel))))
}

async fn serve(listener: TcpListener, stats: Arc<Stats>, cancel: CancellationToken) {
    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = JoinSet::new();

    loop {
        let conn = tokio::select! {
            () = cancel.cancelled() => break,
            con_res = listener.accept() => match con_res {
                Ok((conn, _)) => conn,
                Err(e) => {
                    if let Some(pause) = accept_error_backoff(&e) {
                        warn!("Monitor accept failed, retrying in {pause:?}: {e}");
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(pause) => {}
                        }
                    } else {
                        debug!("Monitor accept failed: {e}");
                    }
                    continue;
                }
            },
            Some(finished) = joinset.join_next(), if !joinset.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!("Monitor connection handler panicked: {:?}", e);
                    }
                }
                continue;
            }
        };
        let conn = TokioIo::new(conn);
        let server = server.clone();
        let stats = Arc::clone(&stats);
        joinset.spawn(async move {
            let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                let stats = Arc::clone(&stats);
                async move { Ok::<_, Infallible>(route(&req, &stats)) }
            });
            if let Err(e) = server.serve_connection(conn, service).await {
                debug!("Monitor connection error: {e}");
            }
        });
    }

    joinset.abort_all();
    debug!("Monitor stopped");
}

fn route(req: &Request<Incoming>, stats: &Stats) -> Response<Full<Bytes>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/debug/vars") => {
            match serde_json::to_vec(&Vars {
                server: stats.snapshot(),
            }) {
                Ok(body) => respond(StatusCode::OK, Bytes::from(body), true),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Bytes::from(e.to_string()),
                    false,
                ),
            }
        }
        (&Method::GET, "/e") => respond(StatusCode::OK, Bytes::new(), false),
        _ => respond(StatusCode::NOT_FOUND, Bytes::from_static(b"not found"), false),
    }
}

fn respond(status: StatusCode, body: Bytes, json: bool) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    if json {
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/json"),
        );
    }
    response
}
