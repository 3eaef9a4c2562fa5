//! Docker volume plugin protocol
//!
//! Docker talks to volume plugins with JSON over HTTP `POST` requests, one
//! endpoint per verb (`/VolumeDriver.Mount`, ...). This module decodes the
//! request bodies, calls into the [`VolumeRegistry`] and encodes the reply.
//! Failures are reported as `{"Err": "<message>"}` with status 500.

pub mod server;

use std::path::PathBuf;
use std::sync::Arc;

use hyper::StatusCode;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::error::VolumeError;
use crate::registry::VolumeRegistry;
use crate::volume::VolumeInfo;

/// Content type Docker expects from plugins
pub const CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1.2+json";

/// Plugin subsystems we implement
const IMPLEMENTS: &[&str] = &["VolumeDriver"];

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateRequest {
    pub name: String,
    #[serde(default)]
    pub opts: Option<IndexMap<String, String>>,
}

/// Body of Get, Path and Remove
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NameRequest {
    pub name: String,
}

/// Body of Mount and Unmount
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountRequest {
    pub name: String,
    /// Caller id; Docker sends a unique id per container mount
    #[serde(rename = "ID", default)]
    pub id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeEntry {
    pub name: String,
    pub mountpoint: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl VolumeEntry {
    fn summary(info: VolumeInfo) -> Self {
        Self {
            name: info.name,
            mountpoint: info.mount_point,
            created_at: None,
        }
    }

    fn detailed(info: VolumeInfo) -> Self {
        let created_at = Some(info.created_at_rfc3339());
        Self {
            name: info.name,
            mountpoint: info.mount_point,
            created_at,
        }
    }
}

/// Reply to a plugin request
#[derive(Debug)]
pub struct PluginResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl PluginResponse {
    fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    fn err(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "Err": message.into() }),
        }
    }

    /// The `Err` field, if the reply carries a non-empty one
    pub fn error_message(&self) -> Option<&str> {
        self.body
            .get("Err")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Maps plugin endpoints onto registry operations
pub struct PluginApi {
    registry: Arc<VolumeRegistry>,
}

impl PluginApi {
    pub fn new(registry: Arc<VolumeRegistry>) -> Self {
        Self { registry }
    }

    /// Handle a request to `endpoint` (e.g. `/VolumeDriver.Create`) with the raw JSON `body`
    pub async fn handle(&self, endpoint: &str, body: &[u8]) -> PluginResponse {
        match endpoint {
            "/Plugin.Activate" => PluginResponse::ok(json!({ "Implements": IMPLEMENTS })),
            "/VolumeDriver.Capabilities" => {
                debug!("Capabilities Request");
                PluginResponse::ok(json!({
                    "Capabilities": { "Scope": self.registry.capabilities().as_str() }
                }))
            }
            "/VolumeDriver.List" => {
                debug!("List Request");
                let volumes: Vec<VolumeEntry> = self
                    .registry
                    .list()
                    .into_iter()
                    .map(VolumeEntry::summary)
                    .collect();
                PluginResponse::ok(json!({ "Volumes": volumes, "Err": "" }))
            }
            "/VolumeDriver.Create" => {
                let req: CreateRequest = match decode(body) {
                    Ok(req) => req,
                    Err(resp) => return resp,
                };
                debug!("Create Request {}", req.name);
                let opts = req.opts.unwrap_or_default();
                reply("Create", &req.name, self.registry.create(&req.name, &opts).await, |()| {
                    json!({ "Err": "" })
                })
            }
            "/VolumeDriver.Get" => {
                let req: NameRequest = match decode(body) {
                    Ok(req) => req,
                    Err(resp) => return resp,
                };
                debug!("Get Request {}", req.name);
                reply("Get", &req.name, self.registry.get(&req.name), |info| {
                    json!({ "Volume": VolumeEntry::detailed(info), "Err": "" })
                })
            }
            "/VolumeDriver.Remove" => {
                let req: NameRequest = match decode(body) {
                    Ok(req) => req,
                    Err(resp) => return resp,
                };
                debug!("Remove Request {}", req.name);
                reply("Remove", &req.name, self.registry.remove(&req.name).await, |()| {
                    json!({ "Err": "" })
                })
            }
            "/VolumeDriver.Path" => {
                let req: NameRequest = match decode(body) {
                    Ok(req) => req,
                    Err(resp) => return resp,
                };
                debug!("Path Request {}", req.name);
                reply("Path", &req.name, self.registry.path(&req.name), |path| {
                    json!({ "Mountpoint": path, "Err": "" })
                })
            }
            "/VolumeDriver.Mount" => {
                let req: MountRequest = match decode(body) {
                    Ok(req) => req,
                    Err(resp) => return resp,
                };
                debug!("Mount Request {} ({})", req.name, req.id);
                reply("Mount", &req.name, self.registry.mount(&req.name).await, |path| {
                    json!({ "Mountpoint": path, "Err": "" })
                })
            }
            "/VolumeDriver.Unmount" => {
                let req: MountRequest = match decode(body) {
                    Ok(req) => req,
                    Err(resp) => return resp,
                };
                debug!("Unmount Request {} ({})", req.name, req.id);
                reply("Unmount", &req.name, self.registry.unmount(&req.name).await, |()| {
                    json!({ "Err": "" })
                })
            }
            other => {
                warn!("Unknown plugin endpoint {}", other);
                PluginResponse::err(StatusCode::NOT_FOUND, format!("unknown endpoint {}", other))
            }
        }
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, PluginResponse> {
    serde_json::from_slice(body).map_err(|e| {
        warn!("Malformed plugin request: {}", e);
        PluginResponse::err(StatusCode::BAD_REQUEST, format!("malformed request: {}", e))
    })
}

fn reply<T>(
    verb: &str,
    name: &str,
    result: Result<T, VolumeError>,
    encode: impl FnOnce(T) -> Value,
) -> PluginResponse {
    match result {
        Ok(value) => PluginResponse::ok(encode(value)),
        Err(e) => {
            if e.is_caller_error() {
                warn!("{} of volume {} rejected: {}", verb, name, e);
            } else {
                error!("{} of volume {} failed: {}", verb, name, e);
            }
            PluginResponse::err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
