//! Code for the front-end binary.
//!
//! The front-end is the system's only HTTP surface: clients upload payloads
//! and poll for results, workers fetch inputs and PUT artifacts back, and
//! the monitor reads aggregates. It owns the job index and the on-disk job
//! layout, and hands accepted jobs to the broker.

pub mod config;
mod http;
mod layout;
mod publish;
mod store;

pub use layout::JobLayout;
pub use publish::{BrokerPublisher, JobPublisher};
pub use store::{JobFilter, JobRecord, JobStore, Pagination};

use anyhow::Result;
use corral_base::EngineConfig;
use corral_util::process::signal_handler;
use hyper::{
    server::conn::{AddrIncoming, AddrStream},
    service::{make_service_fn, service_fn},
    Body, Request, Server,
};
use slog::{error, info, Logger};
use std::{convert::Infallible, sync::Arc};
use tokio::{net::TcpListener, task::JoinSet};

pub struct Frontend {
    pub store: JobStore,
    pub layout: JobLayout,
    pub engines: Vec<EngineConfig>,
    pub publisher: Box<dyn JobPublisher>,
    pub log: Logger,
}

/// The main function for the front-end. Serves until the first signal or
/// until the server itself fails.
pub async fn main(listener: TcpListener, frontend: Frontend) -> Result<()> {
    let state = Arc::new(frontend);
    for engine in &state.engines {
        info!(state.log, "registered engine"; "engine" => &engine.name);
    }

    let service_state = state.clone();
    let make_service = make_service_fn(move |_conn: &AddrStream| {
        let state = service_state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let state = state.clone();
                async move {
                    let log = state.log.clone();
                    // Each request runs on a task of its own so a panicking
                    // handler is contained: the connection gets a 500 and
                    // the server keeps serving.
                    let response = match tokio::spawn(http::serve_request(state, req)).await {
                        Ok(response) => response,
                        Err(err) => {
                            error!(log, "request handler panicked"; "error" => %err);
                            http::internal_error()
                        }
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let server = Server::builder(AddrIncoming::from_listener(listener)?).serve(make_service);

    let mut join_set = JoinSet::new();
    join_set.spawn(async move { server.await.map_err(anyhow::Error::from) });
    join_set.spawn(signal_handler(tokio::signal::unix::SignalKind::interrupt()));
    join_set.spawn(signal_handler(tokio::signal::unix::SignalKind::terminate()));

    let result = join_set
        .join_next()
        .await
        .expect("join_set is not empty")
        .expect("no task should panic or be canceled");
    if let Err(err) = &result {
        error!(state.log, "front-end task failed"; "error" => %err);
    }
    result
}
