//! Plugin registry, address allocation dispatch and event fan-out.

use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::query_channel;
use super::AllocateIpRequest;
use super::Capability;
use super::Event;
use super::Plugin;
use super::PluginInfo;
use super::QuerySession;
use crate::metrics::DROPPED_PLUGIN_EVENTS;
use crate::metrics::PLUGIN_EVENT_ERRORS;
use crate::storage::MeshStorage;
use crate::utils::net::IpPrefix;
use crate::PluginError;
use crate::Result;

/// Events buffered for the dispatcher before new ones are dropped
pub const EVENT_QUEUE_CAPACITY: usize = 256;

struct Registered {
    /// Registration sequence; lower values win provider lookups
    order: u64,
    plugin: Arc<dyn Plugin>,
    info: PluginInfo,
    session_cancel: CancellationToken,
    session: Option<JoinHandle<()>>,
}

pub struct PluginManager {
    storage: Arc<dyn MeshStorage>,
    plugins: Arc<DashMap<String, Registered>>,
    /// Names whose registration is in flight
    pending: Mutex<HashSet<String>>,
    next_order: AtomicU64,
    events: mpsc::Sender<Event>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl PluginManager {
    /// Starts the event dispatcher. Must run inside a tokio runtime.
    pub fn new(storage: Arc<dyn MeshStorage>) -> Self {
        Self::with_event_capacity(storage, EVENT_QUEUE_CAPACITY)
    }

    pub fn with_event_capacity(
        storage: Arc<dyn MeshStorage>,
        capacity: usize,
    ) -> Self {
        let plugins: Arc<DashMap<String, Registered>> = Arc::new(DashMap::new());
        let (events, rx) = mpsc::channel(capacity);
        let shutdown = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch_events(plugins.clone(), rx, shutdown.clone()));
        Self {
            storage,
            plugins,
            pending: Mutex::new(HashSet::new()),
            next_order: AtomicU64::new(0),
            events,
            dispatcher: Mutex::new(Some(dispatcher)),
            shutdown,
        }
    }

    /// Configures `plugin`, opens its query channel and adds it to the
    /// registry under `name`.
    ///
    /// # Errors
    /// - `PluginError::AlreadyRegistered`
    /// - `PluginError::MissingCapability` when a declared capability has no
    ///   backing view
    /// - `PluginError::InvalidConfig` when `configure` rejects the map
    #[instrument(skip(self, plugin, config))]
    pub async fn register(
        &self,
        name: &str,
        plugin: Arc<dyn Plugin>,
        config: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let _reservation = self.reserve(name)?;
        let info = plugin.get_info();
        check_capabilities(name, &info, plugin.as_ref())?;

        plugin.configure(config).await.map_err(|e| PluginError::InvalidConfig {
            plugin: name.to_string(),
            reason: e.to_string(),
        })?;

        let (stream, db) = query_channel(name);
        let session_cancel = self.shutdown.child_token();
        let session = QuerySession::new(
            name,
            self.storage.clone(),
            info.has(Capability::Storage),
            session_cancel.clone(),
        );
        let plugin_name = name.to_string();
        let session = tokio::spawn(async move {
            if let Err(e) = session.serve(stream).await {
                warn!(plugin = %plugin_name, "query session ended: {}", e);
            }
        });
        if let Err(e) = plugin.inject_querier(db).await {
            session_cancel.cancel();
            if let Err(join_err) = session.await {
                warn!(plugin = %name, "query session task failed: {:?}", join_err);
            }
            return Err(e);
        }

        info!(plugin = %name, capabilities = ?info.capabilities, "plugin registered");
        self.plugins.insert(
            name.to_string(),
            Registered {
                order: self.next_order.fetch_add(1, Ordering::SeqCst),
                plugin,
                info,
                session_cancel,
                session: Some(session),
            },
        );
        Ok(())
    }

    /// Claims `name` until the returned guard drops. Fails if the name is
    /// registered or another registration holds it.
    fn reserve(
        &self,
        name: &str,
    ) -> Result<Reservation<'_>> {
        let mut pending = self.pending.lock();
        if self.plugins.contains_key(name) || !pending.insert(name.to_string()) {
            return Err(PluginError::AlreadyRegistered(name.to_string()).into());
        }
        Ok(Reservation {
            pending: &self.pending,
            name: name.to_string(),
        })
    }

    /// Earliest registered plugin providing `capability`
    fn find_provider(
        &self,
        capability: Capability,
    ) -> Option<(String, Arc<dyn Plugin>)> {
        self.plugins
            .iter()
            .filter(|p| p.info.has(capability))
            .min_by_key(|p| p.order)
            .map(|p| (p.key().clone(), p.plugin.clone()))
    }

    pub fn contains(
        &self,
        name: &str,
    ) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn info(
        &self,
        name: &str,
    ) -> Option<PluginInfo> {
        self.plugins.get(name).map(|p| p.info.clone())
    }

    /// Name of the earliest registered plugin providing `capability`
    pub fn provider(
        &self,
        capability: Capability,
    ) -> Option<String> {
        self.find_provider(capability).map(|(name, _)| name)
    }

    pub fn has_watchers(&self) -> bool {
        self.provider(Capability::Watch).is_some()
    }

    /// Allocates through the plugin providing the requested IP version.
    ///
    /// # Errors
    /// `PluginError::NoProvider` when no plugin serves that version
    pub async fn allocate_ip(
        &self,
        req: AllocateIpRequest,
    ) -> Result<IpPrefix> {
        let capability = req.version.capability();
        let (_, plugin) = self
            .find_provider(capability)
            .ok_or_else(|| PluginError::NoProvider(capability.to_string()))?;
        let ipam = plugin
            .as_ipam()
            .ok_or_else(|| PluginError::NoProvider(capability.to_string()))?;
        ipam.allocate(req).await
    }

    /// Queues `event` for every watcher without waiting for delivery.
    ///
    /// # Errors
    /// `PluginError::QueueFull` when the dispatcher is backed up; the event
    /// is dropped
    pub fn emit(
        &self,
        event: Event,
    ) -> Result<()> {
        if !self.has_watchers() {
            return Ok(());
        }
        self.events.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                DROPPED_PLUGIN_EVENTS.inc();
                PluginError::QueueFull.into()
            }
            mpsc::error::TrySendError::Closed(_) => PluginError::ChannelClosed.into(),
        })
    }

    /// Closes the plugin and its query channel.
    pub async fn unload(
        &self,
        name: &str,
    ) -> Result<()> {
        let (_, mut registered) = self
            .plugins
            .remove(name)
            .ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))?;
        info!(plugin = %name, "unloading plugin");

        let result = registered.plugin.close().await;
        registered.session_cancel.cancel();
        if let Some(session) = registered.session.take() {
            if let Err(e) = session.await {
                warn!(plugin = %name, "query session task failed: {:?}", e);
            }
        }
        result
    }

    /// Unloads every plugin and stops the dispatcher. Errors are logged and
    /// the first one is returned.
    pub async fn close(&self) -> Result<()> {
        let names: Vec<String> = self.plugins.iter().map(|p| p.key().clone()).collect();
        let mut first_err = None;
        for name in names {
            if let Err(e) = self.unload(&name).await {
                warn!(plugin = %name, "close plugin: {}", e);
                first_err.get_or_insert(e);
            }
        }
        self.shutdown.cancel();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }
        debug!("plugin manager closed");
        first_err.map_or(Ok(()), Err)
    }
}

struct Reservation<'a> {
    pending: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.name);
    }
}

fn check_capabilities(
    name: &str,
    info: &PluginInfo,
    plugin: &dyn Plugin,
) -> Result<()> {
    for capability in &info.capabilities {
        let backed = match capability {
            Capability::Storage => true,
            Capability::Watch => plugin.as_watcher().is_some(),
            Capability::Ipamv4 | Capability::Ipamv6 => plugin.as_ipam().is_some(),
        };
        if !backed {
            return Err(PluginError::MissingCapability {
                plugin: name.to_string(),
                capability: capability.to_string(),
            }
            .into());
        }
    }
    Ok(())
}

async fn dispatch_events(
    plugins: Arc<DashMap<String, Registered>>,
    mut rx: mpsc::Receiver<Event>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        let watchers: Vec<(String, Arc<dyn Plugin>)> = plugins
            .iter()
            .filter(|p| p.info.has(Capability::Watch))
            .map(|p| (p.key().clone(), p.plugin.clone()))
            .collect();
        for (name, plugin) in watchers {
            let Some(watcher) = plugin.as_watcher() else {
                continue;
            };
            if let Err(e) = watcher.emit(event.clone()).await {
                warn!(plugin = %name, "deliver {:?} event: {}", event.kind, e);
                PLUGIN_EVENT_ERRORS.with_label_values(&[&name]).inc();
            }
        }
    }
}
