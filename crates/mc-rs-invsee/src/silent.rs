//! Showing and hiding proxy containers without the host's open/close side
//! effects.
//!
//! Each transition carries a [`SilentAccessToken`] that only exists for the
//! duration of the host call. The token cannot be cloned or built outside
//! this module, so it cannot leak past its transition.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::InvseeError;
use crate::host::{ContainerSpec, HostWorld, ViewId};
use crate::identity::ParticipantId;
use crate::registry::EntryId;

/// Per-view lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Which transition a token covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Open,
    Close,
}

/// Marks one open or close as silent. Hosts must not fire their container
/// open/close notifications for a screen shown or hidden with a token.
#[derive(Debug)]
pub struct SilentAccessToken {
    observer: ParticipantId,
    transition: Transition,
}

impl SilentAccessToken {
    pub fn observer(&self) -> &ParticipantId {
        &self.observer
    }

    pub fn transition(&self) -> Transition {
        self.transition
    }
}

/// Tracks [`AccessState`] per registry entry.
#[derive(Debug, Default)]
pub struct SilentAccess {
    states: HashMap<EntryId, AccessState>,
}

/// Holds an entry in `Opening`/`Closing` and settles it on drop, so every
/// exit path (including unwinding) leaves a stable state.
struct TransitionGuard<'a> {
    states: &'a mut HashMap<EntryId, AccessState>,
    entry: EntryId,
    settle_to: AccessState,
}

impl TransitionGuard<'_> {
    fn begin(
        states: &mut HashMap<EntryId, AccessState>,
        entry: EntryId,
        during: AccessState,
        settle_to: AccessState,
    ) -> TransitionGuard<'_> {
        states.insert(entry, during);
        TransitionGuard {
            states,
            entry,
            settle_to,
        }
    }

    fn finish(mut self, state: AccessState) {
        self.settle_to = state;
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if self.settle_to == AccessState::Closed {
            self.states.remove(&self.entry);
        } else {
            self.states.insert(self.entry, self.settle_to);
        }
    }
}

impl SilentAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, entry: EntryId) -> AccessState {
        self.states
            .get(&entry)
            .copied()
            .unwrap_or(AccessState::Closed)
    }

    /// Show `spec` to `observer` with open notifications suppressed.
    ///
    /// On failure the entry is back in `Closed`; the caller rolls back its
    /// registration.
    pub fn open_silently(
        &mut self,
        host: &mut dyn HostWorld,
        entry: EntryId,
        observer: &ParticipantId,
        spec: ContainerSpec,
    ) -> Result<ViewId, InvseeError> {
        let current = self.state(entry);
        if current != AccessState::Closed {
            warn!("Open requested for entry {entry:?} in state {current:?}");
        }
        let guard = TransitionGuard::begin(
            &mut self.states,
            entry,
            AccessState::Opening,
            AccessState::Closed,
        );
        let token = SilentAccessToken {
            observer: observer.clone(),
            transition: Transition::Open,
        };
        let view = host.show_container(observer, spec, Some(&token))?;
        drop(token);
        guard.finish(AccessState::Open);
        debug!("Silently opened view {view:?} for {observer}");
        Ok(view)
    }

    /// Hide a view previously opened with [`open_silently`](Self::open_silently).
    ///
    /// `hide` is false when the client already closed the screen itself.
    pub fn close_silently(
        &mut self,
        host: &mut dyn HostWorld,
        entry: EntryId,
        observer: &ParticipantId,
        view: Option<ViewId>,
        hide: bool,
    ) {
        let guard = TransitionGuard::begin(
            &mut self.states,
            entry,
            AccessState::Closing,
            AccessState::Closed,
        );
        if let (Some(view), true) = (view, hide) {
            let token = SilentAccessToken {
                observer: observer.clone(),
                transition: Transition::Close,
            };
            host.hide_container(observer, view, Some(&token));
        }
        guard.finish(AccessState::Closed);
        debug!("Silently closed view {view:?} for {observer}");
    }
}
