//! Local datacenter discovery at session start.

use cql_core::{DriverError, Result};

use crate::metadata::NodeInfo;

/// Determines the local datacenter.
///
/// A configured datacenter always wins; contact points reporting another
/// datacenter are only logged. Without one, the datacenter is inferred from
/// the control node, but only when the session connected to the implicit
/// local contact point. Explicit contact points without a configured
/// datacenter fail fast.
pub fn discover_local_datacenter(
    configured: Option<&str>,
    implicit_contact_point: bool,
    contact_points: &[NodeInfo],
    control_node: Option<&NodeInfo>,
) -> Result<String> {
    if let Some(local) = configured {
        let mismatched: Vec<String> = contact_points
            .iter()
            .filter(|n| matches!(n.datacenter.as_deref(), Some(dc) if dc != local))
            .map(|n| format!("{}={}", n.address, n.datacenter.as_deref().unwrap_or_default()))
            .collect();
        if !mismatched.is_empty() {
            tracing::warn!(
                local_datacenter = local,
                contact_points = %mismatched.join(", "),
                "some contact points are not in the local datacenter"
            );
        }
        return Ok(local.to_string());
    }

    if !implicit_contact_point {
        let addresses: Vec<String> = contact_points.iter().map(|n| n.address.to_string()).collect();
        return Err(DriverError::Configuration(format!(
            "the local datacenter must be set when contact points are explicit (contact points: {})",
            addresses.join(", ")
        )));
    }

    match control_node.and_then(|n| n.datacenter.as_deref()) {
        Some(dc) => {
            tracing::debug!(local_datacenter = dc, "inferred local datacenter from implicit contact point");
            Ok(dc.to_string())
        }
        None => Err(DriverError::Configuration(
            "the local datacenter could not be inferred from the implicit contact point".to_string(),
        )),
    }
}
