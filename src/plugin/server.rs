//! Unix socket HTTP server for the plugin protocol

use std::convert::Infallible;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::plugin::{PluginApi, PluginResponse, CONTENT_TYPE};

/// Serve `api` on the unix socket at `socket` until `shutdown` is notified.
///
/// A stale socket file left by a previous run is replaced. The socket file
/// is removed again on shutdown.
pub async fn serve(socket: &Path, api: Arc<PluginApi>, shutdown: Arc<Notify>) -> io::Result<()> {
    if let Some(parent) = socket.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::remove_file(socket) {
        Ok(()) => debug!("Removed stale socket {:?}", socket),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let listener = UnixListener::bind(socket)?;
    info!("Listening on {:?}", socket);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("Failed to accept plugin connection: {}", e);
                        continue;
                    }
                };

                let api = api.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let api = api.clone();
                        async move { Ok::<_, Infallible>(route(&api, req).await) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!("Plugin connection closed with error: {}", e);
                    }
                });
            }
            _ = shutdown.notified() => {
                info!("Plugin server shutting down");
                break;
            }
        }
    }

    if let Err(e) = fs::remove_file(socket) {
        warn!("Failed to remove socket {:?}: {}", socket, e);
    }
    Ok(())
}

async fn route(api: &PluginApi, req: Request<Incoming>) -> Response<Full<Bytes>> {
    if req.method() != Method::POST {
        return respond(PluginResponse::err(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("{} not allowed", req.method()),
        ));
    }

    let endpoint = req.uri().path().to_string();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return respond(PluginResponse::err(
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {}", e),
            ))
        }
    };

    respond(api.handle(&endpoint, &body).await)
}

fn respond(reply: PluginResponse) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&reply.body).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = reply.status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE));
    response
}
