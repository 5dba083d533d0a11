//! Resource-quantity helpers.
//!
//! Deprovisioning decisions compare node capacity and pod requests; this
//! module parses `Quantity` strings into comparable numbers. Only the
//! suffixes that appear on CPU and memory quantities in practice are
//! handled; anything unparseable is treated as absent.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// CPU resource name
pub const CPU: &str = "cpu";
/// Memory resource name
pub const MEMORY: &str = "memory";
/// Pod-count resource name
pub const PODS: &str = "pods";

/// Parse a quantity into a plain f64 (CPU cores, bytes, counts).
pub fn parse_quantity(quantity: &Quantity) -> Option<f64> {
    let s = quantity.0.trim();
    if s.is_empty() {
        return None;
    }
    let suffixes: [(&str, f64); 11] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0_f64.powi(4)),
        ("Pi", 1024.0_f64.powi(5)),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("m", 1e-3),
    ];
    for (suffix, factor) in suffixes {
        if let Some(number) = s.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * factor);
        }
    }
    s.parse::<f64>().ok()
}

/// Look up a named resource in a quantity map.
pub fn get(resources: Option<&BTreeMap<String, Quantity>>, name: &str) -> f64 {
    resources
        .and_then(|m| m.get(name))
        .and_then(parse_quantity)
        .unwrap_or(0.0)
}

/// Allocatable CPU cores of a node.
pub fn node_allocatable_cpu(node: &Node) -> f64 {
    get(
        node.status.as_ref().and_then(|s| s.allocatable.as_ref()),
        CPU,
    )
}

/// Total CPU cores requested by a pod across its containers.
pub fn pod_cpu_request(pod: &Pod) -> f64 {
    let Some(spec) = pod.spec.as_ref() else {
        return 0.0;
    };
    spec.containers
        .iter()
        .map(|c| {
            get(
                c.resources.as_ref().and_then(|r| r.requests.as_ref()),
                CPU,
            )
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn parses_plain_and_milli_cpu() {
        assert_eq!(parse_quantity(&q("2")), Some(2.0));
        assert_eq!(parse_quantity(&q("500m")), Some(0.5));
        assert_eq!(parse_quantity(&q("32")), Some(32.0));
    }

    #[test]
    fn parses_binary_and_decimal_memory() {
        assert_eq!(parse_quantity(&q("1Ki")), Some(1024.0));
        assert_eq!(parse_quantity(&q("2Mi")), Some(2.0 * 1024.0 * 1024.0));
        assert_eq!(parse_quantity(&q("1G")), Some(1e9));
    }

    #[test]
    fn garbage_is_absent() {
        assert_eq!(parse_quantity(&q("")), None);
        assert_eq!(parse_quantity(&q("lots")), None);
    }

    #[test]
    fn missing_resources_read_as_zero() {
        assert_eq!(get(None, CPU), 0.0);
        let empty = BTreeMap::new();
        assert_eq!(get(Some(&empty), CPU), 0.0);
    }
}
