use pvecloud_common::{CloudInstanceState, Result};
use pvecloud_providers::Resource;

use crate::store::RecordStore;

/// Corrects the persisted phase with the hypervisor's running/stopped flag.
///
/// BUILDING and REBOOTING are owned by the orchestrator and never corrected
/// here: a clone is listed as stopped, a reboot briefly as either.
pub fn reconcile_with_live(
    persisted: CloudInstanceState,
    live: &Resource,
) -> CloudInstanceState {
    use CloudInstanceState::*;
    match persisted {
        Stopped if live.is_running() => Active,
        Active | Stopping if live.is_stopped() => Stopped,
        other => other,
    }
}

/// An instance whose guest agent reports an address is up, unless a stop was
/// requested and is still in flight.
pub fn promote_on_address(current: CloudInstanceState) -> CloudInstanceState {
    match current {
        CloudInstanceState::Stopping => CloudInstanceState::Stopping,
        _ => CloudInstanceState::Active,
    }
}

/// Persists `to` if it differs from `from`. Returns whether a write happened.
pub async fn apply(
    store: &dyn RecordStore,
    id: &str,
    from: CloudInstanceState,
    to: CloudInstanceState,
    reason: &str,
) -> Result<bool> {
    if from == to {
        return Ok(false);
    }
    transition(store, id, from, to, reason).await?;
    Ok(true)
}

/// Unconditional write, used by the lifecycle operations that set the phase themselves.
pub async fn transition(
    store: &dyn RecordStore,
    id: &str,
    from: CloudInstanceState,
    to: CloudInstanceState,
    reason: &str,
) -> Result<()> {
    store.update_instance_status(id, to).await?;
    tracing::info!(
        "🔄 [state_machine] vm {}: {} -> {} ({})",
        id,
        from,
        to,
        reason
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use CloudInstanceState::*;

    fn live(status: &str) -> Resource {
        Resource {
            id: "qemu/101".into(),
            vmid: 101,
            node: "pve1".into(),
            status: status.into(),
            ..Default::default()
        }
    }

    #[test]
    fn stopped_but_running_becomes_active() {
        assert_eq!(reconcile_with_live(Stopped, &live("running")), Active);
        assert_eq!(reconcile_with_live(Stopped, &live("stopped")), Stopped);
    }

    #[test]
    fn active_or_stopping_but_stopped_becomes_stopped() {
        assert_eq!(reconcile_with_live(Active, &live("stopped")), Stopped);
        assert_eq!(reconcile_with_live(Stopping, &live("stopped")), Stopped);
        assert_eq!(reconcile_with_live(Stopping, &live("running")), Stopping);
    }

    #[test]
    fn orchestrator_phases_are_left_alone() {
        for status in ["running", "stopped", "paused"] {
            assert_eq!(reconcile_with_live(Building, &live(status)), Building);
            assert_eq!(reconcile_with_live(Rebooting, &live(status)), Rebooting);
        }
    }

    #[test]
    fn address_promotes_all_but_stopping() {
        assert_eq!(promote_on_address(Building), Active);
        assert_eq!(promote_on_address(Stopped), Active);
        assert_eq!(promote_on_address(Rebooting), Active);
        assert_eq!(promote_on_address(Stopping), Stopping);
    }
}
