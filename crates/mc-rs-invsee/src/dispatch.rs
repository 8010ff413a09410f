//! Pushing accepted changes to every open view and folding live changes in.

use tracing::{debug, warn};

use crate::host::HostWorld;
use crate::proxy::{Origin, ProxyInventory};
use crate::registry::ObserverRegistry;

/// Counters from one dispatch pass over one proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Changes applied to the backing source and fanned out.
    pub changes: usize,
    /// Slot updates delivered to views.
    pub pushed: usize,
    /// Views that failed to take an update and were marked stale.
    pub failed: usize,
}

/// Flush `proxy`'s pending changes into its source, then push each one to
/// every open view of the same target and kind except the view of the
/// observer that made it.
///
/// A failed push only affects that view: its entry is marked stale and the
/// remaining views still receive the update.
pub fn dispatch(
    proxy: &ProxyInventory,
    registry: &mut ObserverRegistry,
    host: &mut dyn HostWorld,
) -> DispatchReport {
    let changes = proxy.flush(host);
    let mut report = DispatchReport {
        changes: changes.len(),
        ..DispatchReport::default()
    };
    if changes.is_empty() {
        return report;
    }

    let target = &proxy.target().id;
    let kind = proxy.kind();
    for change in &changes {
        let excluding = match &change.origin {
            Origin::Observer(observer) => Some(observer),
            Origin::Live => None,
        };
        let view_slot = kind.to_view_slot(change.slot);
        for entry in registry.list_observers(target, kind, excluding) {
            let Some(view) = entry.view else {
                continue;
            };
            match host.push_slot_update(view, view_slot, change.item.as_ref()) {
                Ok(()) => report.pushed += 1,
                Err(e) => {
                    warn!(
                        "Dropping view {view:?} of {} for {}: {e}",
                        entry.target, entry.observer
                    );
                    registry.mark_stale(entry.id);
                    report.failed += 1;
                }
            }
        }
    }
    debug!(
        "Dispatched {} change(s) of {} for {} to {} view(s)",
        report.changes, kind, proxy.target().name, report.pushed
    );
    report
}

/// Fold a host-reported change of a live slot into the proxy. Returns the
/// revision it was accepted at, or `None` for echoes of our own writes and
/// values the proxy already holds.
pub fn fold_live_change(proxy: &ProxyInventory, host: &dyn HostWorld, slot: usize) -> Option<u64> {
    let live = host.read_live_slot(&proxy.target().id, proxy.kind(), slot)?;
    proxy.fold_live(slot, live)
}
