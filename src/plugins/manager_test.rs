use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tonic::async_trait;
use tonic::Code;
use tracing_test::traced_test;

use super::builtins::IpamPlugin;
use super::*;
use crate::meshdb::MeshNode;
use crate::metrics::DROPPED_PLUGIN_EVENTS;
use crate::metrics::PLUGIN_EVENT_ERRORS;
use crate::storage::MeshStorage;
use crate::test_utils::mem_mesh_storage;
use crate::test_utils::wait_until;
use crate::utils::net::IpPrefix;
use crate::Error;
use crate::PluginError;
use crate::Result;

#[derive(Default)]
struct TestPlugin {
    name: String,
    capabilities: Vec<Capability>,
    /// Declares capabilities without backing them
    hollow: bool,
    reject_config: bool,
    /// Configure takes a while, widening the registration window
    slow_config: bool,
    reject_querier: bool,
    fail_events: bool,
    /// Watcher blocks on this until notified
    gate: Option<Arc<Notify>>,
    entered: AtomicUsize,
    db: tokio::sync::Mutex<Option<PluginDb>>,
    events: parking_lot::Mutex<Vec<Event>>,
    closed: AtomicBool,
}

impl TestPlugin {
    fn new(
        name: &str,
        capabilities: Vec<Capability>,
    ) -> Self {
        Self {
            name: name.to_string(),
            capabilities,
            ..Default::default()
        }
    }

    async fn db(&self) -> PluginDb {
        self.db.lock().await.clone().unwrap()
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl Plugin for TestPlugin {
    fn get_info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            version: "0.0.1".to_string(),
            description: "test plugin".to_string(),
            capabilities: self.capabilities.clone(),
        }
    }

    async fn configure(
        &self,
        config: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        if self.slow_config {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.reject_config {
            return Err(Error::InvalidArgument(format!("unexpected keys {:?}", config.keys())));
        }
        Ok(())
    }

    async fn inject_querier(
        &self,
        db: PluginDb,
    ) -> Result<()> {
        if self.reject_querier {
            return Err(Error::FailedPrecondition("querier refused".to_string()));
        }
        *self.db.lock().await = Some(db);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        match self.db.lock().await.take() {
            Some(db) => db.close().await,
            None => Ok(()),
        }
    }

    fn as_ipam(&self) -> Option<&dyn IpamProvider> {
        None
    }

    fn as_watcher(&self) -> Option<&dyn EventWatcher> {
        if self.hollow || !self.capabilities.contains(&Capability::Watch) {
            return None;
        }
        Some(self)
    }
}

#[async_trait]
impl EventWatcher for TestPlugin {
    async fn emit(
        &self,
        event: Event,
    ) -> Result<()> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail_events {
            return Err(Error::FailedPrecondition("watcher is broken".to_string()));
        }
        self.events.lock().push(event);
        Ok(())
    }
}

fn join_event(id: &str) -> Event {
    Event {
        kind: EventType::NodeJoin,
        node: MeshNode::new(id, "key"),
    }
}

fn no_config() -> serde_json::Map<String, serde_json::Value> {
    serde_json::Map::new()
}

#[tokio::test]
#[traced_test]
async fn register_should_reject_duplicate_names() {
    let manager = PluginManager::new(mem_mesh_storage());
    manager
        .register("p", Arc::new(TestPlugin::new("p", vec![])), no_config())
        .await
        .unwrap();

    let err = manager
        .register("p", Arc::new(TestPlugin::new("p", vec![])), no_config())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Plugin(PluginError::AlreadyRegistered(_))));
    assert_eq!(err.code(), Code::AlreadyExists);
}

/// # Case: two registrations race for one name
/// ## Validation criteria
/// - exactly one of them succeeds
/// - close reaches the plugin that won, and the loser was never kept
#[tokio::test]
#[traced_test]
async fn concurrent_registrations_of_one_name_should_admit_only_one() {
    let manager = PluginManager::new(mem_mesh_storage());
    let a = Arc::new(TestPlugin {
        slow_config: true,
        ..TestPlugin::new("dup", vec![])
    });
    let b = Arc::new(TestPlugin {
        slow_config: true,
        ..TestPlugin::new("dup", vec![])
    });

    let (first, second) = tokio::join!(
        manager.register("dup", a.clone(), no_config()),
        manager.register("dup", b.clone(), no_config()),
    );
    assert_eq!(first.is_ok() as u8 + second.is_ok() as u8, 1);
    let err = first.err().or(second.err()).unwrap();
    assert!(matches!(err, Error::Plugin(PluginError::AlreadyRegistered(_))));

    manager.close().await.unwrap();
    let winner_closed = a.closed.load(Ordering::SeqCst) || b.closed.load(Ordering::SeqCst);
    assert!(winner_closed);
    assert!(a.db.lock().await.is_none());
    assert!(b.db.lock().await.is_none());
}

#[tokio::test]
#[traced_test]
async fn failed_registration_should_release_the_name() {
    let manager = PluginManager::new(mem_mesh_storage());
    let refusing = Arc::new(TestPlugin {
        reject_querier: true,
        ..TestPlugin::new("p", vec![])
    });
    let err = manager.register("p", refusing, no_config()).await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
    assert!(!manager.contains("p"));

    let plugin = Arc::new(TestPlugin::new("p", vec![Capability::Storage]));
    manager.register("p", plugin.clone(), no_config()).await.unwrap();
    plugin.db().await.put_value("/registry/x", b"1".to_vec()).await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn provider_lookup_should_prefer_the_earliest_registration() {
    let manager = PluginManager::new(mem_mesh_storage());
    for name in ["zeta", "alpha", "mid"] {
        manager
            .register(name, Arc::new(IpamPlugin::new()), no_config())
            .await
            .unwrap();
    }
    for _ in 0..10 {
        assert_eq!(manager.provider(Capability::Ipamv4).as_deref(), Some("zeta"));
    }

    manager.unload("zeta").await.unwrap();
    assert_eq!(manager.provider(Capability::Ipamv4).as_deref(), Some("alpha"));
}

#[tokio::test]
#[traced_test]
async fn register_should_reject_unbacked_capabilities() {
    let manager = PluginManager::new(mem_mesh_storage());
    let plugin = TestPlugin {
        hollow: true,
        ..TestPlugin::new("w", vec![Capability::Watch])
    };
    let err = manager.register("w", Arc::new(plugin), no_config()).await.unwrap_err();
    assert!(matches!(err, Error::Plugin(PluginError::MissingCapability { .. })));
    assert!(!manager.contains("w"));

    let err = manager
        .register("v4", Arc::new(TestPlugin::new("v4", vec![Capability::Ipamv4])), no_config())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Plugin(PluginError::MissingCapability { .. })));
}

#[tokio::test]
#[traced_test]
async fn register_should_report_configuration_errors() {
    let manager = PluginManager::new(mem_mesh_storage());
    let plugin = Arc::new(TestPlugin {
        reject_config: true,
        ..TestPlugin::new("bad", vec![])
    });
    let err = manager.register("bad", plugin.clone(), no_config()).await.unwrap_err();
    assert!(matches!(err, Error::Plugin(PluginError::InvalidConfig { .. })));
    assert!(!manager.contains("bad"));
    assert!(plugin.db.lock().await.is_none());
}

/// # Case 1: write permission follows the storage capability
/// ## Validation criteria
/// - a storage plugin writes through its query channel
/// - a plain plugin reads the same value but cannot write
#[tokio::test]
#[traced_test]
async fn only_storage_plugins_should_write() {
    let storage = mem_mesh_storage();
    let manager = PluginManager::new(storage.clone());
    let writer = Arc::new(TestPlugin::new("writer", vec![Capability::Storage]));
    let reader = Arc::new(TestPlugin::new("reader", vec![]));
    manager.register("writer", writer.clone(), no_config()).await.unwrap();
    manager.register("reader", reader.clone(), no_config()).await.unwrap();

    writer.db().await.put_value("/registry/x", b"1".to_vec()).await.unwrap();
    assert_eq!(storage.get_value("/registry/x").await.unwrap(), b"1");
    assert_eq!(reader.db().await.get_value("/registry/x").await.unwrap(), b"1");

    let err = reader.db().await.delete("/registry/x").await.unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
}

#[tokio::test]
#[traced_test]
async fn allocate_ip_should_route_to_the_provider() {
    let manager = PluginManager::new(mem_mesh_storage());
    let req = AllocateIpRequest {
        node_id: "n1".to_string(),
        subnet: "10.1.0.0/24".parse().unwrap(),
        version: IpVersion::V4,
    };
    let err = manager.allocate_ip(req.clone()).await.unwrap_err();
    assert!(matches!(err, Error::Plugin(PluginError::NoProvider(_))));

    manager
        .register("ipam", Arc::new(IpamPlugin::new()), no_config())
        .await
        .unwrap();
    assert_eq!(manager.provider(Capability::Ipamv6).as_deref(), Some("ipam"));
    let ip: IpPrefix = manager.allocate_ip(req).await.unwrap();
    assert_eq!(ip, "10.1.0.1/32".parse().unwrap());
}

#[tokio::test]
#[traced_test]
async fn unload_should_close_plugin_and_its_channel() {
    let manager = PluginManager::new(mem_mesh_storage());
    let plugin = Arc::new(TestPlugin::new("p", vec![]));
    manager.register("p", plugin.clone(), no_config()).await.unwrap();
    let db = plugin.db().await;

    manager.unload("p").await.unwrap();
    assert!(plugin.closed.load(Ordering::SeqCst));
    assert!(!manager.contains("p"));
    let err = db.get_value("/registry/x").await.unwrap_err();
    assert!(matches!(err, Error::Plugin(PluginError::ChannelClosed)));

    let err = manager.unload("p").await.unwrap_err();
    assert!(matches!(err, Error::Plugin(PluginError::UnknownPlugin(_))));
}

/// # Case 2: event fan-out
/// ## Validation criteria
/// - every watcher receives the event
/// - a failing watcher is counted and does not affect the others
/// - emit itself never reports the delivery failure
#[tokio::test]
#[traced_test]
async fn emit_should_fan_out_and_contain_watcher_failures() {
    let manager = PluginManager::new(mem_mesh_storage());
    let good = Arc::new(TestPlugin::new("good", vec![Capability::Watch]));
    let broken = Arc::new(TestPlugin {
        fail_events: true,
        ..TestPlugin::new("broken", vec![Capability::Watch])
    });
    manager.register("good", good.clone(), no_config()).await.unwrap();
    manager.register("broken", broken.clone(), no_config()).await.unwrap();
    assert!(manager.has_watchers());
    let errors_before = PLUGIN_EVENT_ERRORS.with_label_values(&["broken"]).get();

    manager.emit(join_event("n1")).unwrap();
    wait_until(|| good.events().len() == 1).await;
    wait_until(|| PLUGIN_EVENT_ERRORS.with_label_values(&["broken"]).get() > errors_before).await;
    assert_eq!(good.events()[0].node.id, "n1");
    assert!(broken.events().is_empty());
}

#[tokio::test]
#[traced_test]
async fn emit_should_drop_events_when_the_queue_is_full() {
    let manager = PluginManager::with_event_capacity(mem_mesh_storage(), 1);
    let gate = Arc::new(Notify::new());
    let slow = Arc::new(TestPlugin {
        gate: Some(gate.clone()),
        ..TestPlugin::new("slow", vec![Capability::Watch])
    });
    manager.register("slow", slow.clone(), no_config()).await.unwrap();
    let dropped_before = DROPPED_PLUGIN_EVENTS.get();

    manager.emit(join_event("a")).unwrap();
    wait_until(|| slow.entered.load(Ordering::SeqCst) == 1).await;
    manager.emit(join_event("b")).unwrap();
    let err = manager.emit(join_event("c")).unwrap_err();
    assert!(matches!(err, Error::Plugin(PluginError::QueueFull)));
    assert!(DROPPED_PLUGIN_EVENTS.get() > dropped_before);

    gate.notify_one();
    wait_until(|| slow.entered.load(Ordering::SeqCst) == 2).await;
    gate.notify_one();
    wait_until(|| slow.events().len() == 2).await;
    let ids: Vec<String> = slow.events().into_iter().map(|e| e.node.id).collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn emit_without_watchers_should_be_a_no_op() {
    let manager = PluginManager::new(mem_mesh_storage());
    manager
        .register("p", Arc::new(TestPlugin::new("p", vec![])), no_config())
        .await
        .unwrap();
    assert!(!manager.has_watchers());
    manager.emit(join_event("n1")).unwrap();
}

#[tokio::test]
#[traced_test]
async fn close_should_unload_everything() {
    let manager = PluginManager::new(mem_mesh_storage());
    let a = Arc::new(TestPlugin::new("a", vec![Capability::Watch]));
    let b = Arc::new(TestPlugin::new("b", vec![Capability::Storage]));
    manager.register("a", a.clone(), no_config()).await.unwrap();
    manager.register("b", b.clone(), no_config()).await.unwrap();

    manager.close().await.unwrap();
    assert!(a.closed.load(Ordering::SeqCst));
    assert!(b.closed.load(Ordering::SeqCst));
    assert!(!manager.contains("a"));
    assert!(!manager.has_watchers());
    assert!(manager.info("b").is_none());
}
