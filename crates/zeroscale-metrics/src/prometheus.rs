//! Prometheus text exposition format.
//!
//! Renders registry snapshots so a Prometheus server can scrape what every
//! resource is doing.

use zeroscale_state::{ResourceSnapshot, ScaleState};

/// Render resource snapshots into Prometheus text format.
///
/// `zeroscale_resource_state` is one-hot: one gauge per (resource, state),
/// set to 1 for the current state.
pub fn render_prometheus(snapshots: &[ResourceSnapshot]) -> String {
    let mut out = String::new();

    out.push_str("# HELP zeroscale_resources_total Number of resources under management.\n");
    out.push_str("# TYPE zeroscale_resources_total gauge\n");
    out.push_str(&format!("zeroscale_resources_total {}\n", snapshots.len()));

    out.push_str("# HELP zeroscale_resource_state Current scale state (1 for the active state).\n");
    out.push_str("# TYPE zeroscale_resource_state gauge\n");
    for s in snapshots {
        for state in ScaleState::ALL {
            out.push_str(&format!(
                "zeroscale_resource_state{{resource=\"{}\",state=\"{}\"}} {}\n",
                escape(&s.name),
                state,
                u8::from(s.state == state)
            ));
        }
    }

    out.push_str("# HELP zeroscale_resource_degraded Whether the resource is degraded.\n");
    out.push_str("# TYPE zeroscale_resource_degraded gauge\n");
    for s in snapshots {
        out.push_str(&format!(
            "zeroscale_resource_degraded{{resource=\"{}\"}} {}\n",
            escape(&s.name),
            u8::from(s.degraded.is_some())
        ));
    }

    out.push_str("# HELP zeroscale_resource_episode Scale-from-zero episodes started.\n");
    out.push_str("# TYPE zeroscale_resource_episode counter\n");
    for s in snapshots {
        out.push_str(&format!(
            "zeroscale_resource_episode{{resource=\"{}\"}} {}\n",
            escape(&s.name),
            s.episode
        ));
    }

    out.push_str("# HELP zeroscale_resource_since_transition_seconds Time since the last state transition.\n");
    out.push_str("# TYPE zeroscale_resource_since_transition_seconds gauge\n");
    for s in snapshots {
        out.push_str(&format!(
            "zeroscale_resource_since_transition_seconds{{resource=\"{}\"}} {:.3}\n",
            escape(&s.name),
            s.since_transition_ms as f64 / 1000.0
        ));
    }

    out
}

fn escape(label: &str) -> String {
    label
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
