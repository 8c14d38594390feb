//! Ownership-chain resolution shared by the Deployment-mutating tools.
//!
//! Supported workloads are Deployment-managed: the chain is always
//! pod → ReplicaSet → Deployment. Anything else is rejected with an explicit
//! error rather than guessed at.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Container;

use crate::cluster::{ClusterClient, ClusterError};

/// Walk `ownerReferences` from the pod to its owning Deployment and fetch it.
pub async fn resolve_owning_deployment(
    cluster: &dyn ClusterClient,
    namespace: &str,
    pod: &str,
) -> Result<(String, Deployment), ClusterError> {
    let p = cluster.get_pod(namespace, pod).await?;

    let mut deployment_name: Option<String> = None;
    for owner in p.metadata.owner_references.unwrap_or_default() {
        if owner.kind != "ReplicaSet" {
            continue;
        }
        let rs = cluster.get_replica_set(namespace, &owner.name).await?;
        if let Some(rs_owner) = rs
            .metadata
            .owner_references
            .unwrap_or_default()
            .into_iter()
            .find(|o| o.kind == "Deployment")
        {
            deployment_name = Some(rs_owner.name);
            break;
        }
    }

    let name = deployment_name.ok_or_else(|| ClusterError::NotOwnedByDeployment {
        namespace: namespace.to_string(),
        pod: pod.to_string(),
    })?;
    let deployment = cluster.get_deployment(namespace, &name).await?;
    Ok((name, deployment))
}

/// Pick the container to operate on: the requested name when given, the
/// single container when unambiguous, otherwise an error.
pub fn select_container<'a>(
    containers: &'a [Container],
    requested: &str,
    pod: &str,
) -> Result<&'a Container, ClusterError> {
    if !requested.is_empty() {
        return containers
            .iter()
            .find(|c| c.name == requested)
            .ok_or_else(|| ClusterError::AmbiguousContainer {
                pod: pod.to_string(),
            });
    }
    match containers {
        [only] => Ok(only),
        _ => Err(ClusterError::AmbiguousContainer {
            pod: pod.to_string(),
        }),
    }
}

/// Containers of a Deployment's pod template.
#[must_use]
pub fn template_containers(deployment: &Deployment) -> &[Container] {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map_or(&[], |s| s.containers.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    #[tokio::test]
    async fn resolves_pod_to_deployment() {
        let fake = FakeCluster::new();
        fake.add_owned_workload("demo", "app-x", "app-deployment", "app", "bad:tag", None);

        let (name, deployment) = resolve_owning_deployment(&fake, "demo", "app-x")
            .await
            .unwrap();
        assert_eq!(name, "app-deployment");
        assert_eq!(template_containers(&deployment).len(), 1);
    }

    #[tokio::test]
    async fn bare_pod_is_rejected() {
        let fake = FakeCluster::new();
        fake.add_pod(Pod {
            metadata: ObjectMeta {
                namespace: Some("demo".into()),
                name: Some("loner".into()),
                ..Default::default()
            },
            ..Default::default()
        });

        let err = resolve_owning_deployment(&fake, "demo", "loner")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotOwnedByDeployment { .. }));
    }

    #[tokio::test]
    async fn statefulset_owner_is_rejected() {
        let fake = FakeCluster::new();
        fake.add_pod(Pod {
            metadata: ObjectMeta {
                namespace: Some("demo".into()),
                name: Some("db-0".into()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".into(),
                    kind: "StatefulSet".into(),
                    name: "db".into(),
                    uid: "uid".into(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        });

        let err = resolve_owning_deployment(&fake, "demo", "db-0")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotOwnedByDeployment { .. }));
    }

    #[test]
    fn container_selection() {
        let one = vec![Container {
            name: "app".into(),
            ..Default::default()
        }];
        let two = vec![
            Container {
                name: "app".into(),
                ..Default::default()
            },
            Container {
                name: "sidecar".into(),
                ..Default::default()
            },
        ];

        assert_eq!(select_container(&one, "", "p").unwrap().name, "app");
        assert_eq!(select_container(&two, "sidecar", "p").unwrap().name, "sidecar");
        assert!(matches!(
            select_container(&two, "", "p"),
            Err(ClusterError::AmbiguousContainer { .. })
        ));
        assert!(matches!(
            select_container(&two, "missing", "p"),
            Err(ClusterError::AmbiguousContainer { .. })
        ));
    }
}
