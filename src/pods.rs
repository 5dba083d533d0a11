//! Pod classification helpers shared by the gate, builder, and simulator.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::crd::keys;

/// True when the pod is controlled by a DaemonSet.
///
/// Daemon pods are recreated on every node regardless of cordons, so they
/// neither block termination nor need rescheduling capacity.
pub fn is_daemon(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|r| r.controller == Some(true) && r.kind == "DaemonSet")
}

/// True when the pod has a controlling owner of any kind.
pub fn has_controller(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|r| r.controller == Some(true))
}

/// True when the pod has already run to completion.
pub fn is_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or_default(),
        "Succeeded" | "Failed"
    )
}

/// True when the pod carries the do-not-evict annotation.
pub fn is_do_not_evict(pod: &Pod) -> bool {
    pod.annotations()
        .get(keys::DO_NOT_EVICT_ANNOTATION)
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Pods that must be rescheduled elsewhere if their node is removed:
/// everything that is not daemon-owned and not already terminal.
pub fn is_reschedulable(pod: &Pod) -> bool {
    !is_daemon(pod) && !is_terminal(pod)
}

/// "namespace/name" identifier used in logs and events.
pub fn qualified_name(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.namespace().unwrap_or_default(),
        pod.name_any()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{pod, PodSpecExt};

    #[test]
    fn daemon_pods_are_not_reschedulable() {
        let p = pod("kube-proxy", "kube-system").owned_by("DaemonSet", "kube-proxy");
        assert!(is_daemon(&p));
        assert!(!is_reschedulable(&p));
    }

    #[test]
    fn replicaset_pods_are_reschedulable() {
        let p = pod("web-0", "default").owned_by("ReplicaSet", "web");
        assert!(!is_daemon(&p));
        assert!(has_controller(&p));
        assert!(is_reschedulable(&p));
    }

    #[test]
    fn ownerless_pods_have_no_controller() {
        let p = pod("one-off", "default");
        assert!(!has_controller(&p));
        assert!(is_reschedulable(&p));
    }

    #[test]
    fn completed_pods_are_terminal() {
        let mut p = pod("job-x", "batch").owned_by("Job", "job-x");
        p.status = Some(k8s_openapi::api::core::v1::PodStatus {
            phase: Some("Succeeded".into()),
            ..Default::default()
        });
        assert!(is_terminal(&p));
        assert!(!is_reschedulable(&p));
    }

    #[test]
    fn do_not_evict_requires_true() {
        let guarded = pod("db-0", "default").with_annotation(keys::DO_NOT_EVICT_ANNOTATION, "true");
        assert!(is_do_not_evict(&guarded));

        let disabled =
            pod("db-1", "default").with_annotation(keys::DO_NOT_EVICT_ANNOTATION, "false");
        assert!(!is_do_not_evict(&disabled));
        assert!(!is_do_not_evict(&pod("db-2", "default")));
    }
}
