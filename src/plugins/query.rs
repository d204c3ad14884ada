//! Core side of the plugin query channel.
//!
//! A plugin sends tagged [`PluginQuery`] requests; the core answers each one
//! with one or more [`QueryResult`] frames carrying the same id, the last one
//! marked `done`. Queries are served concurrently, so frames of different
//! ids may interleave.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tracing::debug;
use tracing::trace;

use super::PluginDb;
use crate::metrics::PLUGIN_QUERIES;
use crate::storage::MeshStorage;
use crate::Error;
use crate::Result;

/// Frames buffered in each direction of a query channel
pub const QUERY_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryCommand {
    Get,
    Put,
    Delete,
    List,
    IterPrefix,
}

impl QueryCommand {
    pub fn is_write(self) -> bool {
        matches!(self, QueryCommand::Put | QueryCommand::Delete)
    }
}

impl fmt::Display for QueryCommand {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            QueryCommand::Get => "get",
            QueryCommand::Put => "put",
            QueryCommand::Delete => "delete",
            QueryCommand::List => "list",
            QueryCommand::IterPrefix => "iter-prefix",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginQuery {
    pub id: String,
    pub command: QueryCommand,
    /// Key, or prefix for `List` and `IterPrefix`
    pub key: String,
    #[serde(default)]
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryError {
    /// gRPC status code
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub id: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryError>,
    /// Last frame for this id
    pub done: bool,
}

impl QueryResult {
    fn item(
        id: &str,
        key: String,
        value: Vec<u8>,
    ) -> Self {
        Self {
            id: id.to_string(),
            key,
            value,
            error: None,
            done: false,
        }
    }

    pub(crate) fn done(id: &str) -> Self {
        Self {
            id: id.to_string(),
            key: String::new(),
            value: Vec::new(),
            error: None,
            done: true,
        }
    }

    pub(crate) fn failed(
        id: &str,
        err: &Error,
    ) -> Self {
        Self {
            error: Some(QueryError {
                code: err.code() as i32,
                message: err.to_string(),
            }),
            ..Self::done(id)
        }
    }

    /// The carried error, with its status code preserved
    pub fn into_error(self) -> Option<Error> {
        self.error
            .map(|e| tonic::Status::new(Code::from(e.code), e.message).into())
    }
}

/// Core end of a query channel
pub struct QueryStream {
    queries: mpsc::Receiver<PluginQuery>,
    results: mpsc::Sender<QueryResult>,
}

/// Creates a query channel for `plugin`: the core keeps the stream, the
/// plugin gets the database handle.
pub fn query_channel(plugin: &str) -> (QueryStream, PluginDb) {
    let (query_tx, query_rx) = mpsc::channel(QUERY_CHANNEL_CAPACITY);
    let (result_tx, result_rx) = mpsc::channel(QUERY_CHANNEL_CAPACITY);
    (
        QueryStream {
            queries: query_rx,
            results: result_tx,
        },
        PluginDb::new(plugin, query_tx, result_rx),
    )
}

/// Serves one plugin's queries against the mesh database until the plugin
/// hangs up or the session is cancelled.
pub struct QuerySession {
    plugin: String,
    storage: Arc<dyn MeshStorage>,
    writable: bool,
    cancel: CancellationToken,
}

impl QuerySession {
    pub fn new(
        plugin: impl Into<String>,
        storage: Arc<dyn MeshStorage>,
        writable: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            plugin: plugin.into(),
            storage,
            writable,
            cancel,
        }
    }

    pub async fn serve(
        self,
        stream: QueryStream,
    ) -> Result<()> {
        let QueryStream {
            mut queries,
            results,
        } = stream;
        let session = Arc::new(self);
        let mut in_flight = JoinSet::new();
        debug!(plugin = %session.plugin, "query session opened");

        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => {
                    debug!(plugin = %session.plugin, "query session cancelled");
                    break;
                }
                query = queries.recv() => {
                    let Some(query) = query else {
                        debug!(plugin = %session.plugin, "plugin closed its query channel");
                        break;
                    };
                    let session = session.clone();
                    let results = results.clone();
                    in_flight.spawn(async move { session.handle(query, results).await });
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }
        in_flight.shutdown().await;
        Ok(())
    }

    async fn handle(
        &self,
        query: PluginQuery,
        results: mpsc::Sender<QueryResult>,
    ) {
        trace!(plugin = %self.plugin, id = %query.id, "{} {}", query.command, query.key);
        PLUGIN_QUERIES
            .with_label_values(&[&self.plugin, &query.command.to_string()])
            .inc();

        let id = query.id.clone();
        if let Err(e) = self.execute(query, &results).await {
            let _ = results.send(QueryResult::failed(&id, &e)).await;
        }
    }

    async fn execute(
        &self,
        query: PluginQuery,
        results: &mpsc::Sender<QueryResult>,
    ) -> Result<()> {
        if query.command.is_write() && !self.writable {
            return Err(Error::PermissionDenied(format!(
                "plugin {} is not storage-capable",
                self.plugin
            )));
        }
        let id = query.id;
        let last = match query.command {
            QueryCommand::Get => {
                let value = self.storage.get_value(&query.key).await?;
                QueryResult {
                    key: query.key,
                    value,
                    ..QueryResult::done(&id)
                }
            }
            QueryCommand::Put => {
                self.storage.put_value(&query.key, query.value).await?;
                QueryResult::done(&id)
            }
            QueryCommand::Delete => {
                self.storage.delete(&query.key).await?;
                QueryResult::done(&id)
            }
            QueryCommand::List => {
                for key in self.storage.list(&query.key).await? {
                    send(results, QueryResult::item(&id, key, Vec::new())).await?;
                }
                QueryResult::done(&id)
            }
            QueryCommand::IterPrefix => {
                // Collect first: the visitor is synchronous.
                let mut items = Vec::new();
                self.storage
                    .iter_prefix(&query.key, &mut |k, v| {
                        items.push(QueryResult::item(&id, k.to_string(), v.to_vec()));
                        Ok(())
                    })
                    .await?;
                for item in items {
                    send(results, item).await?;
                }
                QueryResult::done(&id)
            }
        };
        send(results, last).await
    }
}

async fn send(
    results: &mpsc::Sender<QueryResult>,
    result: QueryResult,
) -> Result<()> {
    results
        .send(result)
        .await
        .map_err(|_| crate::PluginError::ChannelClosed.into())
}
