//! Typed access to the cluster control plane.
//!
//! Tools call through the [`ClusterClient`] trait so workflows can be
//! exercised against a fake in tests. The production implementation wraps a
//! shared `kube::Client`; every call carries a deadline so a wedged API
//! server surfaces as a typed error instead of a hung workflow.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Event, Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use thiserror::Error;

use crate::config::CLUSTER_API_TIMEOUT;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster API error: {0}")]
    Api(#[from] kube::Error),
    #[error("cluster API call timed out: {operation}")]
    Timeout { operation: &'static str },
    #[error("pod {namespace}/{pod} is not owned by a Deployment")]
    NotOwnedByDeployment { namespace: String, pod: String },
    #[error("container selection for pod {pod} is ambiguous; pass an explicit container")]
    AmbiguousContainer { pod: String },
}

impl ClusterError {
    /// Whether a retry by the alert router could plausibly succeed.
    #[must_use]
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Api(kube::Error::Api(response)) => response.code >= 500 || response.code == 429,
            Self::Api(_) => false,
            Self::NotOwnedByDeployment { .. } | Self::AmbiguousContainer { .. } => false,
        }
    }
}

/// Control-plane operations the tool set needs.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError>;
    async fn pod_events(&self, namespace: &str, pod: &str) -> Result<Vec<Event>, ClusterError>;
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError>;
    async fn get_replica_set(&self, namespace: &str, name: &str)
        -> Result<ReplicaSet, ClusterError>;
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Deployment, ClusterError>;
    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), ClusterError>;
    async fn patch_node(&self, name: &str, patch: &serde_json::Value) -> Result<(), ClusterError>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
    async fn pods_on_node(&self, node: &str) -> Result<Vec<Pod>, ClusterError>;
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}

/// Production client over a shared `kube::Client`.
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
    timeout: Duration,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            timeout: CLUSTER_API_TIMEOUT,
        }
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, ClusterError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(ClusterError::from),
            Err(_) => Err(ClusterError::Timeout { operation }),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        self.bounded("get_pod", api.get(name)).await
    }

    async fn pod_events(&self, namespace: &str, pod: &str) -> Result<Vec<Event>, ClusterError> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().fields(&format!("involvedObject.name={pod}"));
        let list = self.bounded("list_events", api.list(&lp)).await?;
        Ok(list.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        self.bounded("get_node", api.get(name)).await
    }

    async fn get_replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReplicaSet, ClusterError> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        self.bounded("get_replica_set", api.get(name)).await
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Deployment, ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        self.bounded("get_deployment", api.get(name)).await
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(
            "patch_deployment",
            api.patch(name, &PatchParams::default(), &Patch::Strategic(patch)),
        )
        .await?;
        Ok(())
    }

    async fn patch_node(&self, name: &str, patch: &serde_json::Value) -> Result<(), ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        self.bounded(
            "patch_node",
            api.patch(name, &PatchParams::default(), &Patch::Merge(patch)),
        )
        .await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        self.bounded("delete_pod", async {
            api.delete(name, &DeleteParams::default()).await.map(|_| ())
        })
        .await
    }

    async fn pods_on_node(&self, node: &str) -> Result<Vec<Pod>, ClusterError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default().fields(&format!("spec.nodeName={node}"));
        let list = self.bounded("list_pods_on_node", api.list(&lp)).await?;
        Ok(list.items)
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        self.bounded("evict_pod", async {
            api.evict(name, &EvictParams::default()).await.map(|_| ())
        })
        .await
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory cluster for workflow tests. Records every mutating call so
    //! tests can assert mode isolation and patch counts.

    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::Mutex;

    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, ReplicaSet};
    use k8s_openapi::api::core::v1::{
        Container, ContainerState, ContainerStateTerminated, ContainerStateWaiting,
        ContainerStatus, Event, Node, NodeCondition, NodeSpec, NodeStatus, Pod, PodSpec,
        PodStatus, PodTemplateSpec, ResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    use super::*;

    #[derive(Default)]
    pub struct FakeCluster {
        pub pods: Mutex<HashMap<(String, String), Pod>>,
        pub replica_sets: Mutex<HashMap<(String, String), ReplicaSet>>,
        pub deployments: Mutex<HashMap<(String, String), Deployment>>,
        pub nodes: Mutex<HashMap<String, Node>>,
        pub events: Mutex<Vec<Event>>,
        /// Every mutating call, in order, as `op:target` strings.
        pub mutations: Mutex<Vec<String>>,
        /// Pods whose eviction should fail.
        pub evict_failures: Mutex<HashSet<(String, String)>>,
    }

    impl FakeCluster {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn mutation_log(&self) -> Vec<String> {
            self.mutations.lock().unwrap().clone()
        }

        pub fn add_pod(&self, pod: Pod) {
            let ns = pod.metadata.namespace.clone().unwrap_or_default();
            let name = pod.metadata.name.clone().unwrap_or_default();
            self.pods.lock().unwrap().insert((ns, name), pod);
        }

        pub fn add_node(&self, node: Node) {
            let name = node.metadata.name.clone().unwrap_or_default();
            self.nodes.lock().unwrap().insert(name, node);
        }

        pub fn add_event(&self, namespace: &str, pod: &str, reason: &str, message: &str) {
            let event = Event {
                metadata: ObjectMeta {
                    namespace: Some(namespace.to_string()),
                    name: Some(format!("evt-{}", self.events.lock().unwrap().len())),
                    ..Default::default()
                },
                involved_object: k8s_openapi::api::core::v1::ObjectReference {
                    name: Some(pod.to_string()),
                    namespace: Some(namespace.to_string()),
                    kind: Some("Pod".to_string()),
                    ..Default::default()
                },
                reason: Some(reason.to_string()),
                message: Some(message.to_string()),
                type_: Some("Warning".to_string()),
                count: Some(1),
                ..Default::default()
            };
            self.events.lock().unwrap().push(event);
        }

        /// Wire up a pod owned (via ReplicaSet) by a Deployment whose single
        /// container has the given image and optional memory limit.
        pub fn add_owned_workload(
            &self,
            namespace: &str,
            pod: &str,
            deployment: &str,
            container: &str,
            image: &str,
            memory_limit: Option<&str>,
        ) {
            let rs_name = format!("{deployment}-7f8d9");
            self.add_pod(Pod {
                metadata: ObjectMeta {
                    namespace: Some(namespace.to_string()),
                    name: Some(pod.to_string()),
                    owner_references: Some(vec![OwnerReference {
                        api_version: "apps/v1".into(),
                        kind: "ReplicaSet".into(),
                        name: rs_name.clone(),
                        uid: "rs-uid".into(),
                        controller: Some(true),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: container.to_string(),
                        image: Some(image.to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                status: None,
            });

            self.replica_sets.lock().unwrap().insert(
                (namespace.to_string(), rs_name.clone()),
                ReplicaSet {
                    metadata: ObjectMeta {
                        namespace: Some(namespace.to_string()),
                        name: Some(rs_name),
                        owner_references: Some(vec![OwnerReference {
                            api_version: "apps/v1".into(),
                            kind: "Deployment".into(),
                            name: deployment.to_string(),
                            uid: "deploy-uid".into(),
                            controller: Some(true),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            );

            let limits = memory_limit.map(|limit| {
                let mut map = BTreeMap::new();
                map.insert("memory".to_string(), Quantity(limit.to_string()));
                map
            });
            self.deployments.lock().unwrap().insert(
                (namespace.to_string(), deployment.to_string()),
                Deployment {
                    metadata: ObjectMeta {
                        namespace: Some(namespace.to_string()),
                        name: Some(deployment.to_string()),
                        ..Default::default()
                    },
                    spec: Some(DeploymentSpec {
                        template: PodTemplateSpec {
                            metadata: None,
                            spec: Some(PodSpec {
                                containers: vec![Container {
                                    name: container.to_string(),
                                    image: Some(image.to_string()),
                                    resources: limits.map(|l| ResourceRequirements {
                                        limits: Some(l),
                                        ..Default::default()
                                    }),
                                    ..Default::default()
                                }],
                                ..Default::default()
                            }),
                        },
                        ..Default::default()
                    }),
                    status: None,
                },
            );
        }

        /// Attach a waiting reason to the pod's (single) container status.
        pub fn set_waiting_reason(&self, namespace: &str, pod: &str, container: &str, reason: &str) {
            let mut pods = self.pods.lock().unwrap();
            if let Some(p) = pods.get_mut(&(namespace.to_string(), pod.to_string())) {
                p.status = Some(PodStatus {
                    container_statuses: Some(vec![ContainerStatus {
                        name: container.to_string(),
                        state: Some(ContainerState {
                            waiting: Some(ContainerStateWaiting {
                                reason: Some(reason.to_string()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                });
            }
        }

        /// Mark the pod's container as last-terminated with OOMKilled.
        pub fn set_oom_killed(&self, namespace: &str, pod: &str, container: &str) {
            let mut pods = self.pods.lock().unwrap();
            if let Some(p) = pods.get_mut(&(namespace.to_string(), pod.to_string())) {
                p.status = Some(PodStatus {
                    container_statuses: Some(vec![ContainerStatus {
                        name: container.to_string(),
                        last_state: Some(ContainerState {
                            terminated: Some(ContainerStateTerminated {
                                exit_code: 137,
                                reason: Some("OOMKilled".to_string()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                });
            }
        }

        pub fn add_simple_node(
            &self,
            name: &str,
            ready: bool,
            unschedulable: bool,
            extra_conditions: &[(&str, &str)],
        ) {
            let mut conditions = vec![NodeCondition {
                type_: "Ready".into(),
                status: if ready { "True" } else { "False" }.into(),
                ..Default::default()
            }];
            for (ctype, status) in extra_conditions {
                conditions.push(NodeCondition {
                    type_: (*ctype).into(),
                    status: (*status).into(),
                    ..Default::default()
                });
            }
            self.add_node(Node {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                spec: Some(NodeSpec {
                    unschedulable: Some(unschedulable),
                    ..Default::default()
                }),
                status: Some(NodeStatus {
                    conditions: Some(conditions),
                    ..Default::default()
                }),
            });
        }

        fn not_found(what: &str) -> ClusterError {
            ClusterError::Api(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".into(),
                message: format!("{what} not found"),
                reason: "NotFound".into(),
                code: 404,
            }))
        }
    }

    #[async_trait]
    impl ClusterClient for FakeCluster {
        async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
            self.pods
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| Self::not_found("pod"))
        }

        async fn pod_events(&self, namespace: &str, pod: &str) -> Result<Vec<Event>, ClusterError> {
            Ok(self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| {
                    e.involved_object.name.as_deref() == Some(pod)
                        && e.metadata.namespace.as_deref() == Some(namespace)
                })
                .cloned()
                .collect())
        }

        async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
            self.nodes
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| Self::not_found("node"))
        }

        async fn get_replica_set(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<ReplicaSet, ClusterError> {
            self.replica_sets
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| Self::not_found("replicaset"))
        }

        async fn get_deployment(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Deployment, ClusterError> {
            self.deployments
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| Self::not_found("deployment"))
        }

        async fn patch_deployment(
            &self,
            namespace: &str,
            name: &str,
            patch: &serde_json::Value,
        ) -> Result<(), ClusterError> {
            self.mutations
                .lock()
                .unwrap()
                .push(format!("patch_deployment:{namespace}/{name}:{patch}"));
            Ok(())
        }

        async fn patch_node(
            &self,
            name: &str,
            patch: &serde_json::Value,
        ) -> Result<(), ClusterError> {
            self.mutations
                .lock()
                .unwrap()
                .push(format!("patch_node:{name}:{patch}"));
            Ok(())
        }

        async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
            self.mutations
                .lock()
                .unwrap()
                .push(format!("delete_pod:{namespace}/{name}"));
            Ok(())
        }

        async fn pods_on_node(&self, node: &str) -> Result<Vec<Pod>, ClusterError> {
            Ok(self
                .pods
                .lock()
                .unwrap()
                .values()
                .filter(|p| {
                    p.spec
                        .as_ref()
                        .and_then(|s| s.node_name.as_deref())
                        == Some(node)
                })
                .cloned()
                .collect())
        }

        async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
            let key = (namespace.to_string(), name.to_string());
            if self.evict_failures.lock().unwrap().contains(&key) {
                return Err(Self::not_found("eviction target"));
            }
            self.mutations
                .lock()
                .unwrap()
                .push(format!("evict_pod:{namespace}/{name}"));
            Ok(())
        }
    }
}
