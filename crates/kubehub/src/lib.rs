//! Kollect kubehub: list+watch sources for the mirrored kinds and the
//! watch loops that feed the store.

#![forbid(unsafe_code)]

mod watch;

use std::fmt::Debug;

use anyhow::{Context, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kollect_core::{ClusterInfo, CoreError, ObservedEvent, ResourceKind, Snapshot};
use kube::api::{Api, WatchEvent, WatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

pub use watch::{spawn_supervised, Step, Teardown, WatchConfig, WatchLoop};

/// Items of one list+watch session. `Err` ends the session.
pub type EventStream = BoxStream<'static, Result<ObservedEvent, CoreError>>;

/// Opens list+watch sessions against the cluster API.
#[async_trait::async_trait]
pub trait WatchSource: Send + Sync + 'static {
    /// Start a fresh session for `kind`; existing objects arrive as `Added`.
    async fn open(&self, kind: ResourceKind) -> Result<EventStream>;

    /// API server version string.
    async fn server_version(&self) -> Result<String> {
        Ok(ClusterInfo::UNKNOWN_VERSION.to_string())
    }
}

/// `WatchSource` backed by the typed kube-rs API.
#[derive(Clone)]
pub struct KubeSource {
    client: Client,
    namespace: Option<String>,
    timeout_secs: u32,
}

impl KubeSource {
    pub fn new(client: Client, namespace: Option<String>, timeout_secs: u32) -> Self {
        Self { client, namespace, timeout_secs }
    }

    pub async fn try_default(namespace: Option<String>, timeout_secs: u32) -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::new(client, namespace, timeout_secs))
    }

    /// Namespace restriction that applies to `kind`; cluster-scoped kinds
    /// are always watched cluster-wide.
    fn namespace_for(&self, kind: ResourceKind) -> Option<&str> {
        self.namespace.as_deref().filter(|_| kind.namespaced())
    }

    fn scoped<K>(&self, kind: ResourceKind) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match self.namespace_for(kind) {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    async fn stream<K>(&self, kind: ResourceKind, api: Api<K>) -> Result<EventStream>
    where
        K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
    {
        // The API server rejects watch timeouts of 295s and above.
        let wp = WatchParams::default().timeout(self.timeout_secs.min(290));
        // Version "0": the server replays current objects as ADDED first.
        let stream = api
            .watch(&wp, "0")
            .await
            .with_context(|| format!("opening {kind} watch"))?;
        info!(kind = %kind, ns = ?self.namespace_for(kind), "watch stream opened");
        Ok(stream
            .map(move |item| match item {
                Ok(ev) => observe(kind, ev),
                Err(e) => Err(CoreError::Stream { kind, detail: e.to_string() }),
            })
            .boxed())
    }
}

#[async_trait::async_trait]
impl WatchSource for KubeSource {
    async fn open(&self, kind: ResourceKind) -> Result<EventStream> {
        match kind {
            ResourceKind::Node => self.stream(kind, Api::<Node>::all(self.client.clone())).await,
            ResourceKind::Namespace => self.stream(kind, Api::<Namespace>::all(self.client.clone())).await,
            ResourceKind::Pod => self.stream(kind, self.scoped::<Pod>(kind)).await,
            ResourceKind::Service => self.stream(kind, self.scoped::<Service>(kind)).await,
            ResourceKind::Secret => self.stream(kind, self.scoped::<Secret>(kind)).await,
            ResourceKind::CronJob => self.stream(kind, self.scoped::<CronJob>(kind)).await,
        }
    }

    async fn server_version(&self) -> Result<String> {
        let info = self.client.apiserver_version().await.context("querying server version")?;
        debug!(version = %info.git_version, platform = %info.platform, "server version");
        Ok(info.git_version)
    }
}

fn snapshot_of<K: Serialize>(kind: ResourceKind, obj: &K) -> Result<Snapshot, CoreError> {
    let raw = serde_json::to_value(obj).map_err(|e| CoreError::UnexpectedItem { kind, detail: e.to_string() })?;
    Snapshot::from_raw(kind, raw)
}

/// Map a typed watch event onto the kind-agnostic event the loops consume.
pub fn observe<K: Serialize>(kind: ResourceKind, ev: WatchEvent<K>) -> Result<ObservedEvent, CoreError> {
    Ok(match ev {
        WatchEvent::Added(o) => ObservedEvent::Added(snapshot_of(kind, &o)?),
        WatchEvent::Modified(o) => ObservedEvent::Modified(snapshot_of(kind, &o)?),
        WatchEvent::Deleted(o) => ObservedEvent::Deleted(snapshot_of(kind, &o)?),
        WatchEvent::Bookmark(_) => ObservedEvent::Bookmark,
        WatchEvent::Error(e) => ObservedEvent::Error(format!("{} ({}): {}", e.reason, e.code, e.message)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ManagedFieldsEntry, ObjectMeta};
    use kube::core::ErrorResponse;

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                managed_fields: Some(vec![ManagedFieldsEntry { manager: Some("kubelet".into()), ..Default::default() }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn typed_events_map_to_observed_events() {
        match observe(ResourceKind::Node, WatchEvent::Added(node("n1"))).expect("ok") {
            ObservedEvent::Added(s) => {
                assert_eq!(s.kind, ResourceKind::Node);
                assert_eq!(s.name, "n1");
                assert_eq!(s.payload["name"], "n1");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            observe(ResourceKind::Node, WatchEvent::Deleted(node("n1"))).expect("ok"),
            ObservedEvent::Deleted(_)
        ));
    }

    #[test]
    fn managed_fields_are_stripped_from_payload() {
        let svc = Service {
            metadata: ObjectMeta {
                name: Some("api".into()),
                managed_fields: Some(vec![ManagedFieldsEntry::default()]),
                ..Default::default()
            },
            ..Default::default()
        };
        match observe(ResourceKind::Service, WatchEvent::Modified(svc)).expect("ok") {
            ObservedEvent::Modified(s) => assert!(s.payload["metadata"].get("managedFields").is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn server_error_event_is_surfaced() {
        let ev: WatchEvent<Pod> = WatchEvent::Error(ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version".into(),
            reason: "Expired".into(),
            code: 410,
        });
        match observe(ResourceKind::Pod, ev).expect("ok") {
            ObservedEvent::Error(msg) => assert!(msg.contains("410")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn namespace_restriction_skips_cluster_scoped_kinds() {
        // Never contacted: only the namespace routing is exercised.
        let config = kube::Config::new("http://127.0.0.1:1".parse().expect("uri"));
        let client = Client::try_from(config).expect("client");
        let src = KubeSource::new(client, Some("prod".into()), 290);
        assert_eq!(src.namespace_for(ResourceKind::Pod), Some("prod"));
        assert_eq!(src.namespace_for(ResourceKind::CronJob), Some("prod"));
        assert_eq!(src.namespace_for(ResourceKind::Node), None);
        assert_eq!(src.namespace_for(ResourceKind::Namespace), None);
    }

    #[test]
    fn nameless_object_is_unexpected() {
        let err = observe(ResourceKind::Pod, WatchEvent::Added(Pod::default())).unwrap_err();
        assert!(matches!(err, CoreError::MissingIdentity { kind: ResourceKind::Pod }));
    }
}
