//! Plugin side of the query channel, exposed as a [`MeshStorage`].

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::PluginQuery;
use super::QueryCommand;
use super::QueryResult;
use crate::storage::MeshStorage;
use crate::storage::PrefixVisitor;
use crate::PluginError;
use crate::Result;

/// Cloneable database handle of one plugin. Concurrent requests share the
/// channel and are told apart by id.
#[derive(Clone)]
pub struct PluginDb {
    inner: Arc<PluginDbInner>,
}

struct PluginDbInner {
    plugin: String,
    /// Dropped on close so the core session ends
    queries: Mutex<Option<mpsc::Sender<PluginQuery>>>,
    pending: Arc<DashMap<String, mpsc::UnboundedSender<QueryResult>>>,
    next_id: AtomicU64,
    closed: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl PluginDb {
    pub(crate) fn new(
        plugin: &str,
        queries: mpsc::Sender<PluginQuery>,
        mut results: mpsc::Receiver<QueryResult>,
    ) -> Self {
        let pending: Arc<DashMap<String, mpsc::UnboundedSender<QueryResult>>> = Arc::new(DashMap::new());
        let closed = CancellationToken::new();

        let reader = {
            let pending = pending.clone();
            let closed = closed.clone();
            let plugin = plugin.to_string();
            tokio::spawn(async move {
                loop {
                    let result = tokio::select! {
                        _ = closed.cancelled() => break,
                        result = results.recv() => result,
                    };
                    let Some(result) = result else {
                        debug!(plugin = %plugin, "core closed the query channel");
                        break;
                    };
                    let done = result.done;
                    let id = result.id.clone();
                    match pending.get(&id) {
                        Some(waiter) => {
                            let _ = waiter.send(result);
                        }
                        None => warn!(plugin = %plugin, "result for unknown query {}", id),
                    }
                    if done {
                        pending.remove(&id);
                    }
                }
                // Wake every waiter and refuse new queries.
                closed.cancel();
                pending.clear();
            })
        };

        Self {
            inner: Arc::new(PluginDbInner {
                plugin: plugin.to_string(),
                queries: Mutex::new(Some(queries)),
                pending,
                next_id: AtomicU64::new(1),
                closed,
                reader: Mutex::new(Some(reader)),
            }),
        }
    }

    pub fn plugin(&self) -> &str {
        &self.inner.plugin
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    async fn query(
        &self,
        command: QueryCommand,
        key: &str,
        value: Vec<u8>,
    ) -> Result<mpsc::UnboundedReceiver<QueryResult>> {
        let sender = match self.inner.queries.lock().clone() {
            Some(sender) if !self.is_closed() => sender,
            _ => return Err(PluginError::ChannelClosed.into()),
        };
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.pending.insert(id.clone(), tx);
        trace!(plugin = %self.inner.plugin, id = %id, "{} {}", command, key);

        let query = PluginQuery {
            id: id.clone(),
            command,
            key: key.to_string(),
            value,
        };
        if sender.send(query).await.is_err() {
            self.inner.pending.remove(&id);
            return Err(PluginError::ChannelClosed.into());
        }
        Ok(rx)
    }

    async fn next_frame(
        &self,
        rx: &mut mpsc::UnboundedReceiver<QueryResult>,
    ) -> Result<QueryResult> {
        tokio::select! {
            frame = rx.recv() => frame.ok_or_else(|| PluginError::ChannelClosed.into()),
            _ = self.inner.closed.cancelled() => Err(PluginError::ChannelClosed.into()),
        }
    }

    /// Awaits the terminal frame of a single-frame query
    async fn single(
        &self,
        command: QueryCommand,
        key: &str,
        value: Vec<u8>,
    ) -> Result<QueryResult> {
        let mut rx = self.query(command, key, value).await?;
        let result = self.next_frame(&mut rx).await?;
        match result.clone().into_error() {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    /// Feeds every item frame to `f` until the terminal frame
    async fn stream<F>(
        &self,
        command: QueryCommand,
        prefix: &str,
        mut f: F,
    ) -> Result<()>
    where
        F: FnMut(QueryResult) -> Result<()> + Send,
    {
        let mut rx = self.query(command, prefix, Vec::new()).await?;
        loop {
            let frame = self.next_frame(&mut rx).await?;
            if frame.done {
                return match frame.into_error() {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
            }
            f(frame)?;
        }
    }
}

#[async_trait]
impl MeshStorage for PluginDb {
    async fn get_value(
        &self,
        key: &str,
    ) -> Result<Vec<u8>> {
        Ok(self.single(QueryCommand::Get, key, Vec::new()).await?.value)
    }

    async fn put_value(
        &self,
        key: &str,
        value: Vec<u8>,
    ) -> Result<()> {
        self.single(QueryCommand::Put, key, value).await.map(|_| ())
    }

    async fn delete(
        &self,
        key: &str,
    ) -> Result<()> {
        self.single(QueryCommand::Delete, key, Vec::new()).await.map(|_| ())
    }

    async fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.stream(QueryCommand::List, prefix, |frame| {
            keys.push(frame.key);
            Ok(())
        })
        .await?;
        Ok(keys)
    }

    async fn iter_prefix(
        &self,
        prefix: &str,
        visitor: PrefixVisitor<'_>,
    ) -> Result<()> {
        self.stream(QueryCommand::IterPrefix, prefix, |frame| visitor(&frame.key, &frame.value))
            .await
    }

    /// Stops the reader; in-flight and later calls fail with
    /// `PluginError::ChannelClosed`.
    async fn close(&self) -> Result<()> {
        debug!(plugin = %self.inner.plugin, "closing plugin db");
        self.inner.closed.cancel();
        self.inner.queries.lock().take();
        let reader = self.inner.reader.lock().take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
        self.inner.pending.clear();
        Ok(())
    }
}
