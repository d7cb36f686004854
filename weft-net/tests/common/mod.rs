//! Shared fixtures for the end-to-end suites.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use weft_core::{ActorHost, ActorId, Envelope, NodeId};
use weft_net::{NetConfig, NetworkModule, TestBackend};

/// Install a subscriber once so failing runs can be replayed with
/// `RUST_LOG=weft_net=trace`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Host double: published paths in a map, deliveries onto a channel.
pub struct TestHost {
    registry: Mutex<HashMap<String, ActorId>>,
    delivered: Mutex<mpsc::Sender<Envelope>>,
    downs: Mutex<Vec<(NodeId, ActorId)>>,
}

impl TestHost {
    /// A host plus the receiving end of its delivery channel.
    pub fn new() -> (Arc<TestHost>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel();
        let host = Arc::new(TestHost {
            registry: Mutex::new(HashMap::new()),
            delivered: Mutex::new(tx),
            downs: Mutex::new(Vec::new()),
        });
        (host, rx)
    }

    /// Publish an actor under a path.
    pub fn publish(&self, path: &str, id: ActorId) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.insert(path.to_string(), id);
        }
    }

    /// Down notifications observed so far.
    pub fn downs(&self) -> Vec<(NodeId, ActorId)> {
        self.downs.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

impl ActorHost for TestHost {
    fn deliver(&self, envelope: Envelope) {
        if let Ok(tx) = self.delivered.lock() {
            let _ = tx.send(envelope);
        }
    }

    fn lookup(&self, path: &str) -> Option<ActorId> {
        self.registry.lock().ok()?.get(path).copied()
    }

    fn peer_down(&self, node: &NodeId, actor: ActorId) {
        if let Ok(mut downs) = self.downs.lock() {
            downs.push((node.clone(), actor));
        }
    }
}

/// Build a started module with a test backend for `origin`.
pub fn test_module(origin: &str, host: Arc<TestHost>) -> NetworkModule {
    init_tracing();
    let cfg = NetConfig::new(origin.parse().expect("locator"));
    let mut module = NetworkModule::new(cfg, host).expect("module").with_test();
    module.start().expect("start");
    module
}

/// Wire two modules' test backends together over a socket pair.
pub fn wire(a: &mut NetworkModule, b: &mut NetworkModule) {
    let a_node = a.this_node();
    let b_node = b.this_node();
    let far_end = test_backend(a).emplace(b_node).expect("emplace");
    test_backend(b)
        .emplace_with(a_node, far_end)
        .expect("emplace_with");
}

/// The module's test backend.
pub fn test_backend(module: &mut NetworkModule) -> &mut TestBackend {
    module
        .backend_mut("test")
        .expect("test backend registered")
        .as_any()
        .downcast_mut::<TestBackend>()
        .expect("test backend type")
}
