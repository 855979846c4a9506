// gantry: a multi-language build system and test runner.
// Copyright (C) 2024 International Digital Economy Academy
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// For inquiries, you can contact us via e-mail at jichuruanjian@idea.edu.cn.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use gantrycore::bus::BuildResult;
use gantrycore::state::BuildState;
use gantryutil::stats::{ResourceSampler, SAMPLE_INTERVAL, SystemStats};
use http::{Request, Response, StatusCode, header};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, warn};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};

use super::{
    CLIENT_QUEUE_CAPACITY, CONFIG_PATH, EVENTS_PATH, RESOURCES_PATH, ServerConfig,
};

/// How long a graceful stop may take before the runtime is torn down hard.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

type Body = BoxBody<Bytes, Infallible>;
type ClientRegistry = Arc<Mutex<Vec<mpsc::Sender<BuildResult>>>>;

/// The streaming server a follower attaches to.
///
/// Runs hyper on its own tokio runtime thread; the primary build never
/// waits on it. Stop it with [`FollowServer::shutdown`] once the build has
/// ended.
pub struct FollowServer {
    pub addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl FollowServer {
    pub fn start(
        state: Arc<BuildState>,
        sampler: Arc<ResourceSampler>,
        port: u16,
    ) -> anyhow::Result<FollowServer> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", port))
            .with_context(|| format!("cannot bind follow server on port {port}"))?;
        listener
            .set_nonblocking(true)
            .context("cannot configure the follow listener")?;
        let addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let events_rx = state.bus.subscribe("follow-server");

        let thread = std::thread::Builder::new()
            .name("follow-server".to_owned())
            .spawn(move || {
                let runtime = match Runtime::new() {
                    Ok(rt) => rt,
                    Err(e) => {
                        warn!("cannot start the follow server runtime: {e}");
                        return;
                    }
                };
                runtime.block_on(serve(listener, state, sampler, events_rx, shutdown_rx));
                // Anything still streaming gets this long to finish.
                runtime.shutdown_timeout(DISCONNECT_TIMEOUT);
            })
            .context("cannot spawn the follow server thread")?;

        debug!("follow server listening on {addr}");
        Ok(FollowServer {
            addr,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Graceful stop bounded by the disconnect timeout, then hard stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for FollowServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn serve(
    listener: std::net::TcpListener,
    state: Arc<BuildState>,
    sampler: Arc<ResourceSampler>,
    events_rx: std::sync::mpsc::Receiver<BuildResult>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(l) => l,
        Err(e) => {
            warn!("cannot adopt the follow listener: {e}");
            return;
        }
    };
    let clients: ClientRegistry = Arc::new(Mutex::new(Vec::new()));

    // Bridge the result bus into every connected client's queue. A client
    // whose queue is full is dropped and logged; the bus itself already
    // guarantees the primary build never blocks here.
    {
        let clients = Arc::clone(&clients);
        let mut shutdown = shutdown_rx.clone();
        tokio::task::spawn_blocking(move || {
            loop {
                if *shutdown.borrow_and_update() {
                    break;
                }
                match events_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(event) => {
                        clients.lock().unwrap().retain(|c| {
                            match c.try_send(event.clone()) {
                                Ok(()) => true,
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    warn!("a follower fell too far behind, disconnecting it");
                                    false
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => false,
                            }
                        });
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            // Ending the senders ends every event stream with a clean EOF.
            clients.lock().unwrap().clear();
        });
    }

    let mut shutdown = shutdown_rx.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        warn!("follow accept failed: {e}");
                        continue;
                    }
                };
                debug!("follower connected from {peer}");
                let state = Arc::clone(&state);
                let sampler = Arc::clone(&sampler);
                let clients = Arc::clone(&clients);
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        handle_request(
                            req,
                            Arc::clone(&state),
                            Arc::clone(&sampler),
                            Arc::clone(&clients),
                            shutdown_rx.clone(),
                        )
                    });
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!("follower connection ended: {e}");
                    }
                });
            }
        }
    }
}

async fn handle_request<B>(
    req: Request<B>,
    state: Arc<BuildState>,
    sampler: Arc<ResourceSampler>,
    clients: ClientRegistry,
    shutdown: watch::Receiver<bool>,
) -> Result<Response<Body>, Infallible> {
    let response = match req.uri().path() {
        CONFIG_PATH => config_response(&state),
        EVENTS_PATH => events_response(&clients),
        RESOURCES_PATH => resources_response(&sampler, shutdown),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found")).boxed())
            .expect("static response builds"),
    };
    Ok(response)
}

fn config_response(state: &BuildState) -> Response<Body> {
    let config = ServerConfig {
        num_threads: state.options.num_threads,
        original_targets: state.original_targets(),
        need_tests: state.options.need_tests,
        need_coverage: state.options.need_coverage,
        start_time: state.start_time.timestamp_nanos_opt().unwrap_or(0),
        last_event_per_thread: state.bus.snapshot(),
    };
    let body = serde_json::to_vec(&config).expect("config serializes");
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).boxed())
        .expect("config response builds")
}

/// Server-streaming newline-delimited `BuildResult`s until the build ends.
fn events_response(clients: &ClientRegistry) -> Response<Body> {
    let (sender, receiver) = mpsc::channel::<BuildResult>(CLIENT_QUEUE_CAPACITY);
    clients.lock().unwrap().push(sender);
    ndjson_stream_response(receiver, |event: BuildResult| {
        serde_json::to_vec(&event).expect("events serialize")
    })
}

/// Server-streaming resource samples on the sampler's own cadence.
fn resources_response(
    sampler: &Arc<ResourceSampler>,
    mut shutdown: watch::Receiver<bool>,
) -> Response<Body> {
    let (sender, receiver) = mpsc::channel::<SystemStats>(16);
    let sampler = Arc::clone(sampler);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if sender.send(sampler.snapshot()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    ndjson_stream_response(receiver, |sample: SystemStats| {
        serde_json::to_vec(&sample).expect("samples serialize")
    })
}

fn ndjson_stream_response<T, F>(mut receiver: mpsc::Receiver<T>, encode: F) -> Response<Body>
where
    T: Send + Sync + 'static,
    F: Fn(T) -> Vec<u8> + Send + Sync + 'static,
{
    let stream = futures::stream::poll_fn(move |cx| {
        receiver.poll_recv(cx).map(|next| {
            next.map(|item| {
                let mut line = encode(item);
                line.push(b'\n');
                Ok::<_, Infallible>(Frame::data(Bytes::from(line)))
            })
        })
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(StreamBody::new(stream).boxed())
        .expect("stream response builds")
}
