//! Pricing rules shared by the consolidation sub-reconcilers.

use tracing::debug;

use crate::candidates::CandidateNode;
use crate::crd::keys;
use crate::simulation::SyntheticNode;

/// Combined price of the offerings the removed nodes currently run on.
/// `None` when any node's offering cannot be priced; an unpriceable node
/// is never consolidated.
pub(crate) fn aggregate_current_price(candidates: &[CandidateNode]) -> Option<f64> {
    candidates.iter().map(CandidateNode::current_price).sum()
}

/// Combined cheapest-offering price of the proposed replacements. `None`
/// when a replacement has no launchable backing.
pub(crate) fn aggregate_replacement_price(new_nodes: &[SyntheticNode]) -> Option<f64> {
    new_nodes.iter().map(SyntheticNode::price).sum()
}

/// Whether the proposed replacements are strictly cheaper in aggregate
/// than the nodes they replace.
pub(crate) fn replacement_is_cheaper(
    candidates: &[CandidateNode],
    new_nodes: &[SyntheticNode],
) -> bool {
    match (
        aggregate_current_price(candidates),
        aggregate_replacement_price(new_nodes),
    ) {
        (Some(current), Some(replacement)) => replacement < current,
        _ => false,
    }
}

/// The per-capacity-type price guard for single-node replacement.
///
/// For each capacity type the candidate's provisioner allows, the
/// replacement's available offerings of that type are compared against
/// the candidate's current price:
/// - on-demand: the cheapest available on-demand offering must beat it;
/// - spot: *every* available spot offering must beat it. Spot prices
///   whipsaw, and a single overpriced spot pool in the replacement's
///   options is enough to oscillate nodes back and forth.
pub(crate) fn capacity_rules_allow(
    candidate: &CandidateNode,
    new_nodes: &[SyntheticNode],
) -> bool {
    let Some(current) = candidate.current_price() else {
        return false;
    };
    for capacity_type in candidate.provisioner.spec.allowed_capacity_types() {
        let prices: Vec<f64> = new_nodes
            .iter()
            .flat_map(|n| n.instance_type_options.iter())
            .flat_map(|it| it.offerings.iter())
            .filter(|o| o.available && o.capacity_type == capacity_type)
            .map(|o| o.price)
            .collect();
        if prices.is_empty() {
            continue;
        }
        let violates = if capacity_type == keys::CAPACITY_TYPE_SPOT {
            prices.iter().any(|p| *p >= current)
        } else {
            prices.iter().all(|p| *p >= current)
        };
        if violates {
            debug!(
                node = %candidate.name(),
                capacity_type = %capacity_type,
                current_price = current,
                "Refusing replacement: offering prices do not beat the current node"
            );
            return false;
        }
    }
    true
}

/// Drop replacement instance types that merely relaunch a node being
/// removed: same type at an equal-or-higher price. Returns `None` when a
/// replacement loses all of its options, which invalidates the command;
/// the caller then shrinks the candidate set instead of performing the
/// degenerate delete-and-relaunch.
pub(crate) fn filter_same_type(
    new_nodes: Vec<SyntheticNode>,
    removed: &[CandidateNode],
) -> Option<Vec<SyntheticNode>> {
    let mut filtered = Vec::with_capacity(new_nodes.len());
    for mut synthetic in new_nodes {
        synthetic.instance_type_options.retain(|option| {
            let Some(option_price) = option.cheapest_offering().map(|o| o.price) else {
                return false;
            };
            !removed.iter().any(|candidate| {
                candidate.instance_type.name == option.name
                    && candidate
                        .current_price()
                        .is_some_and(|current| option_price >= current)
            })
        });
        if synthetic.instance_type_options.is_empty() {
            return None;
        }
        filtered.push(synthetic);
    }
    Some(filtered)
}
