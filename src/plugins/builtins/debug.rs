//! Built-in debug HTTP server: read-only database queries and metrics.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tracing::debug;
use tracing::info;
use tracing::warn;
use warp::http::StatusCode;
use warp::path::FullPath;
use warp::reply::WithStatus;
use warp::Filter;
use warp::Rejection;

use crate::constants::BUILTIN_DEBUG_PLUGIN;
use crate::metrics::gather_metrics;
use crate::plugins::Plugin;
use crate::plugins::PluginDb;
use crate::plugins::PluginInfo;
use crate::storage::MeshStorage;
use crate::Error;
use crate::NetworkError;
use crate::Result;

fn default_listen_address() -> String {
    "127.0.0.1:6060".to_string()
}
fn default_path_prefix() -> String {
    "/debug".to_string()
}
fn default_enable_metrics() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DebugConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    #[serde(default)]
    pub enable_db_querier: bool,

    #[serde(default = "default_enable_metrics")]
    pub enable_metrics: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            path_prefix: default_path_prefix(),
            enable_db_querier: false,
            enable_metrics: default_enable_metrics(),
        }
    }
}

impl DebugConfig {
    pub fn validate(&self) -> Result<SocketAddr> {
        if !self.enable_db_querier && !self.enable_metrics {
            return Err(Error::InvalidArgument(
                "both the db querier and metrics are disabled".to_string(),
            ));
        }
        self.listen_address.parse().map_err(|e| {
            Error::InvalidArgument(format!("listen-address {:?}: {}", self.listen_address, e))
        })
    }
}

struct DebugState {
    config: DebugConfig,
    data: tokio::sync::Mutex<Option<PluginDb>>,
}

struct Server {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct DebugPlugin {
    state: Mutex<Option<Arc<DebugState>>>,
    server: Mutex<Option<Server>>,
}

impl DebugPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address the server is bound to, once configured
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().map(|s| s.addr)
    }

    fn current_state(&self) -> Option<Arc<DebugState>> {
        self.state.lock().clone()
    }
}

#[async_trait]
impl Plugin for DebugPlugin {
    fn get_info(&self) -> PluginInfo {
        PluginInfo {
            name: BUILTIN_DEBUG_PLUGIN.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Debug server plugin".to_string(),
            capabilities: Vec::new(),
        }
    }

    async fn configure(
        &self,
        config: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let config: DebugConfig = serde_json::from_value(serde_json::Value::Object(config))?;
        let addr = config.validate()?;
        if self.server.lock().is_some() {
            return Err(Error::FailedPrecondition("debug server already running".to_string()));
        }

        let state = Arc::new(DebugState {
            config,
            data: tokio::sync::Mutex::new(None),
        });
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let (bound, server) = warp::serve(routes(state.clone()))
            .try_bind_with_graceful_shutdown(addr, async move { signal.cancelled().await })
            .map_err(|e| NetworkError::Bind {
                address: addr.to_string(),
                reason: e.to_string(),
            })?;
        info!(plugin = BUILTIN_DEBUG_PLUGIN, "debug server listening on {}", bound);

        *self.state.lock() = Some(state);
        *self.server.lock() = Some(Server {
            addr: bound,
            shutdown,
            handle: tokio::spawn(server),
        });
        Ok(())
    }

    async fn inject_querier(
        &self,
        db: PluginDb,
    ) -> Result<()> {
        match self.current_state() {
            Some(state) => {
                *state.data.lock().await = Some(db);
                Ok(())
            }
            None => Err(crate::PluginError::NotConfigured.into()),
        }
    }

    async fn close(&self) -> Result<()> {
        let server = self.server.lock().take();
        if let Some(server) = server {
            server.shutdown.cancel();
            if let Err(e) = server.handle.await {
                warn!(plugin = BUILTIN_DEBUG_PLUGIN, "debug server task: {:?}", e);
            }
            info!(plugin = BUILTIN_DEBUG_PLUGIN, "debug server closed");
        }
        let state = self.state.lock().take();
        let Some(state) = state else {
            return Ok(());
        };
        let db = state.data.lock().await.take();
        match db {
            Some(db) => db.close().await,
            None => Ok(()),
        }
    }
}

fn routes(
    state: Arc<DebugState>,
) -> impl Filter<Extract = (WithStatus<String>,), Error = Rejection> + Clone {
    warp::get()
        .and(warp::path::full())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::any().map(move || state.clone()))
        .and_then(handle)
}

async fn handle(
    path: FullPath,
    query: HashMap<String, String>,
    state: Arc<DebugState>,
) -> std::result::Result<WithStatus<String>, Rejection> {
    let prefix = state.config.path_prefix.trim_end_matches('/');
    let Some(route) = path.as_str().strip_prefix(prefix) else {
        return Ok(reply(StatusCode::NOT_FOUND, "not found"));
    };
    debug!(plugin = BUILTIN_DEBUG_PLUGIN, "GET {}", path.as_str());

    let response = match route {
        "/metrics" if state.config.enable_metrics => match gather_metrics() {
            Ok(body) => reply(StatusCode::OK, body),
            Err(e) => reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        "/db/list" | "/db/get" | "/db/iter-prefix" if state.config.enable_db_querier => {
            handle_db(route, query.get("q").cloned().unwrap_or_default(), &state).await
        }
        _ => reply(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

/// Holds the data handle only for a single list or get call
async fn handle_db(
    route: &str,
    q: String,
    state: &DebugState,
) -> WithStatus<String> {
    let data = state.data.lock().await;
    let Some(db) = data.as_ref() else {
        return reply(StatusCode::INTERNAL_SERVER_ERROR, "plugin not configured");
    };
    match route {
        "/db/list" => match db.list(&q).await {
            Ok(keys) => reply(StatusCode::OK, keys.join("\n")),
            Err(e) => reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        "/db/get" => {
            if q.is_empty() {
                return reply(StatusCode::BAD_REQUEST, "missing key");
            }
            match db.get_value(&q).await {
                Ok(value) => reply(StatusCode::OK, String::from_utf8_lossy(&value).into_owned()),
                Err(e) if e.is_not_found() => reply(StatusCode::NOT_FOUND, e.to_string()),
                Err(e) => reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }
        }
        _ => reply(StatusCode::NOT_IMPLEMENTED, "not implemented"),
    }
}

fn reply(
    status: StatusCode,
    body: impl Into<String>,
) -> WithStatus<String> {
    warp::reply::with_status(body.into(), status)
}

#[cfg(test)]
#[path = "debug_test.rs"]
mod debug_test;
