//! Barrage dashboard.
//!
//! A small HTTP/1 server over the stats collector's snapshot:
//!
//! * `/` and `/health` answer `{"status":"OK","message":...}`
//! * `/stats` is the per-worker map as JSON
//! * `/dashboard` is an HTML page of totals, workers and configuration
//!
//! Anything else is a 404. The server stops accepting on the shutdown
//! signal and drops open connections.

use std::{convert::Infallible, fmt::Write as _, io, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use flowgre_signal::Watcher;
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::Full;
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch, task::JoinSet};
use tracing::{debug, error, info};

use crate::{
    generator::barrage,
    stats::{Snapshot, human_bytes},
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Server`].
pub enum Error {
    /// Error binding the listener
    #[error("Failed to bind dashboard to {addr}: {source}")]
    Bind {
        /// Binding address
        addr: SocketAddr,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    message: &'static str,
}

#[derive(Debug)]
struct State {
    snapshots: watch::Receiver<Snapshot>,
    config: barrage::Config,
}

#[derive(Debug)]
/// The dashboard server.
pub struct Server {
    addr: SocketAddr,
    listener: TcpListener,
    state: Arc<State>,
    shutdown: Watcher,
}

impl Server {
    /// Bind the dashboard to `addr`.
    ///
    /// # Errors
    ///
    /// Fails if the listener cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        snapshots: watch::Receiver<Snapshot>,
        config: barrage::Config,
        shutdown: Watcher,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            addr,
            source: Box::new(source),
        })?;
        let addr = listener.local_addr().unwrap_or(addr);
        info!("Starting web server on {addr}");
        Ok(Self {
            addr,
            listener,
            state: Arc::new(State { snapshots, config }),
            shutdown,
        })
    }

    /// Address the dashboard listens on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until the shutdown signal.
    ///
    /// # Errors
    ///
    /// None at present, failed connections are logged.
    pub async fn run(self) -> Result<(), Error> {
        let mut connections = JoinSet::new();

        let shutdown_wait = self.shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                () = &mut shutdown_wait => {
                    info!("Web server exiting due to signal");
                    break;
                }
                incoming = self.listener.accept() => {
                    let (stream, peer) = match incoming {
                        Ok(sa) => sa,
                        Err(err) => {
                            error!("Error accepting connection: {err}");
                            continue;
                        }
                    };
                    debug!("Accepted connection from {peer}");
                    let state = Arc::clone(&self.state);
                    connections.spawn(async move {
                        let service = service_fn(move |req| {
                            let state = Arc::clone(&state);
                            async move { Ok::<_, Infallible>(route(&req, &state)) }
                        });
                        if let Err(err) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!("Error serving {peer}: {err}");
                        }
                    });
                }
            }
        }

        drop(self.listener);
        connections.shutdown().await;
        Ok(())
    }
}

fn route<B>(req: &Request<B>, state: &State) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }
    match req.uri().path() {
        "/" => health("Flowgre is flinging packets!"),
        "/health" => health("Everything is OK!"),
        "/stats" => {
            let snapshot = state.snapshots.borrow().clone();
            json(&snapshot.workers)
        }
        "/dashboard" => {
            let snapshot = state.snapshots.borrow().clone();
            html(render_dashboard(&snapshot, &state.config))
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

fn health(message: &'static str) -> Response<Full<Bytes>> {
    json(&Health {
        status: "OK",
        message,
    })
}

fn json<T>(value: &T) -> Response<Full<Bytes>>
where
    T: Serialize,
{
    match serde_json::to_vec(value) {
        Ok(body) => respond(StatusCode::OK, "application/json", body),
        Err(err) => {
            error!("failed to serialize response: {err}");
            text(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed")
        }
    }
}

fn html(body: String) -> Response<Full<Bytes>> {
    respond(StatusCode::OK, "text/html; charset=utf-8", body)
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    respond(status, "text/plain; charset=utf-8", body)
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static(content_type));
    response
}

fn render_dashboard(snapshot: &Snapshot, config: &barrage::Config) -> String {
    let totals = &snapshot.totals;
    let mut rows = String::new();
    for stat in snapshot.workers.values() {
        // writes to a String cannot fail
        let _ = write!(
            rows,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            stat.worker_id,
            stat.source_id,
            stat.flows_sent,
            stat.cycles,
            human_bytes(stat.bytes_sent),
            stat.packets_sent,
        );
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><meta http-equiv="refresh" content="5"><title>Flowgre Dashboard</title></head>
<body>
<h1>Flowgre Dashboard</h1>
<h2>Totals</h2>
<table>
<tr><th>Flows Sent</th><th>Cycles</th><th>Bytes Sent</th><th>Packets Sent</th></tr>
<tr><td>{flows}</td><td>{cycles}</td><td>{bytes}</td><td>{packets}</td></tr>
</table>
<h2>Workers</h2>
<table>
<tr><th>Worker ID</th><th>Source ID</th><th>Flows Sent</th><th>Cycles</th><th>Bytes Sent</th><th>Packets Sent</th></tr>
{rows}
</table>
<h2>Configuration</h2>
<table>
<tr><th>Target</th><td>{target}</td></tr>
<tr><th>Workers</th><td>{workers}</td></tr>
<tr><th>Delay</th><td>{delay}ms</td></tr>
<tr><th>Schema</th><td>{schema}</td></tr>
<tr><th>Source Range</th><td>{src_range}</td></tr>
<tr><th>Destination Range</th><td>{dst_range}</td></tr>
</table>
</body>
</html>
"#,
        flows = totals.flows_sent,
        cycles = totals.cycles,
        bytes = human_bytes(totals.bytes_sent),
        packets = totals.packets_sent,
        target = config.target,
        workers = config.workers,
        delay = config.delay.as_millis(),
        schema = config.schema,
        src_range = config.src_range,
        dst_range = config.dst_range,
    )
}
