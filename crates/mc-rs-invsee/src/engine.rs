//! The tick-driven engine tying resolution, sources, proxies, the observer
//! registry, dispatch and silent access together.
//!
//! Requests and host events may arrive from any thread through an
//! [`EngineHandle`]; they are queued and handled in order on the next
//! [`Engine::tick`], the only place live objects are touched.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::dispatch::{dispatch, fold_live_change};
use crate::error::{InvseeError, StoreError};
use crate::host::{render_title, ContainerSpec, HostEvent, HostWorld, PlayerStore, ViewId};
use crate::identity::{IdentityResolver, ParticipantId, ParticipantIdentity};
use crate::item::{ItemStack, Slot};
use crate::kind::InventoryKind;
use crate::proxy::{Origin, ProxyInventory, ProxyKey};
use crate::registry::{EntryId, ObserverRegistry};
use crate::search::{self, ItemMatcher, SearchHit};
use crate::silent::{AccessState, SilentAccess};
use crate::source::{StoreReply, StoreRunner};

/// Completion of an open request.
pub type OpenReceiver = oneshot::Receiver<Result<ViewHandle, InvseeError>>;
type OpenReply = oneshot::Sender<Result<ViewHandle, InvseeError>>;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// An operator's open view. Cheap to clone; writes through it are accepted
/// immediately and propagated on the next tick.
#[derive(Clone)]
pub struct ViewHandle {
    entry: EntryId,
    observer: ParticipantId,
    view: ViewId,
    proxy: Arc<ProxyInventory>,
}

impl ViewHandle {
    pub fn entry(&self) -> EntryId {
        self.entry
    }

    pub fn view(&self) -> ViewId {
        self.view
    }

    pub fn observer(&self) -> &ParticipantId {
        &self.observer
    }

    pub fn target(&self) -> &ParticipantIdentity {
        self.proxy.target()
    }

    pub fn kind(&self) -> InventoryKind {
        self.proxy.kind()
    }

    pub fn proxy(&self) -> &Arc<ProxyInventory> {
        &self.proxy
    }

    pub fn get_slot(&self, slot: usize) -> Result<Slot, InvseeError> {
        self.proxy.get_slot(slot)
    }

    /// Set a storage slot. Returns the revision the change was accepted at.
    pub fn set_slot(&self, slot: usize, item: Option<ItemStack>) -> Result<u64, InvseeError> {
        self.proxy
            .set_slot_for(self.entry, slot, item, Origin::Observer(self.observer.clone()))
    }

    /// Set a slot by its position in the container, as clicked by the client.
    pub fn set_view_slot(&self, view_slot: usize, item: Option<ItemStack>) -> Result<u64, InvseeError> {
        let kind = self.kind();
        let slot = kind.to_storage_slot(view_slot).ok_or(InvseeError::OutOfRange {
            slot: view_slot,
            size: kind.size(),
        })?;
        self.set_slot(slot, item)
    }
}

impl fmt::Debug for ViewHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewHandle")
            .field("entry", &self.entry)
            .field("observer", &self.observer)
            .field("view", &self.view)
            .field("target", &self.proxy.target().name)
            .field("kind", &self.proxy.kind())
            .finish()
    }
}

enum Request {
    Open {
        operator: ParticipantId,
        target: String,
        kind: InventoryKind,
        reply: OpenReply,
    },
    Close(EntryId),
    Event(HostEvent),
}

/// Thread-safe sender of requests and host events into the engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl EngineHandle {
    /// Queue an open of `target`'s inventory for `operator`. The receiver
    /// completes on the tick that handles it, or later if the inventory has
    /// to be loaded in the background.
    pub fn request_open(
        &self,
        operator: ParticipantId,
        target: impl Into<String>,
        kind: InventoryKind,
    ) -> OpenReceiver {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Request::Open {
            operator,
            target: target.into(),
            kind,
            reply,
        });
        rx
    }

    pub fn request_close(&self, handle: &ViewHandle) {
        let _ = self.tx.send(Request::Close(handle.entry));
    }

    /// Deliver a host event. This is the engine's event-bus subscription.
    pub fn publish(&self, event: HostEvent) {
        let _ = self.tx.send(Request::Event(event));
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct PendingOpen {
    operator: ParticipantId,
    reply: OpenReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    /// Save-back of this revision in flight.
    Saving(u64),
    /// Save-back failed; try again at this tick.
    RetryAt(u64),
}

enum Acquired {
    Ready(Arc<ProxyInventory>),
    Loading,
}

pub struct Engine {
    config: EngineConfig,
    runner: StoreRunner,
    proxies: HashMap<ProxyKey, Arc<ProxyInventory>>,
    registry: ObserverRegistry,
    access: SilentAccess,
    waiting: HashMap<ProxyKey, Vec<PendingOpen>>,
    releases: HashMap<ProxyKey, Release>,
    requests_tx: mpsc::UnboundedSender<Request>,
    requests_rx: mpsc::UnboundedReceiver<Request>,
    store_rx: mpsc::UnboundedReceiver<StoreReply>,
    tick: u64,
}

impl Engine {
    /// Create an engine. In background persistence mode this must be called
    /// from within a tokio runtime.
    pub fn new(config: EngineConfig, store: Arc<dyn PlayerStore>) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (store_tx, store_rx) = mpsc::unbounded_channel();
        let runner = StoreRunner::new(store, &config, store_tx);
        Self {
            config,
            runner,
            proxies: HashMap::new(),
            registry: ObserverRegistry::new(),
            access: SilentAccess::new(),
            waiting: HashMap::new(),
            releases: HashMap::new(),
            requests_tx,
            requests_rx,
            store_rx,
            tick: 0,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            tx: self.requests_tx.clone(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// Number of open views.
    pub fn open_views(&self) -> usize {
        self.registry.len()
    }

    pub fn proxy(&self, target: &ParticipantId, kind: InventoryKind) -> Option<Arc<ProxyInventory>> {
        self.proxies
            .get(&ProxyKey::new(target.clone(), kind))
            .cloned()
    }

    pub fn access_state(&self, entry: EntryId) -> AccessState {
        self.access.state(entry)
    }

    /// Whether a save-back for this inventory is in flight or awaiting retry.
    pub fn is_releasing(&self, target: &ParticipantId, kind: InventoryKind) -> bool {
        self.releases
            .contains_key(&ProxyKey::new(target.clone(), kind))
    }

    /// Run one scheduling step. Called by the host from its own tick.
    pub fn tick(&mut self, host: &mut dyn HostWorld) {
        self.tick += 1;
        while let Ok(reply) = self.store_rx.try_recv() {
            self.on_store_reply(host, reply);
        }
        while let Ok(request) = self.requests_rx.try_recv() {
            match request {
                Request::Open {
                    operator,
                    target,
                    kind,
                    reply,
                } => self.open(host, operator, &target, kind, reply),
                Request::Close(entry) => self.close_entry(host, entry, true),
                Request::Event(event) => self.handle_event(host, event),
            }
        }
        self.collect_garbage(host);

        let proxies: Vec<Arc<ProxyInventory>> = self.proxies.values().cloned().collect();
        for proxy in proxies {
            dispatch(&proxy, &mut self.registry, host);
        }
        self.retry_releases(host);
    }

    /// Open from inside the host's tick context, bypassing the queue.
    pub fn request_open(
        &mut self,
        host: &mut dyn HostWorld,
        operator: &ParticipantId,
        target: &str,
        kind: InventoryKind,
    ) -> OpenReceiver {
        let (reply, rx) = oneshot::channel();
        self.open(host, operator.clone(), target, kind, reply);
        rx
    }

    /// Close from inside the host's tick context, bypassing the queue.
    pub fn request_close(&mut self, host: &mut dyn HostWorld, handle: &ViewHandle) {
        self.close_entry(host, handle.entry, true);
    }

    pub fn handle_event(&mut self, host: &mut dyn HostWorld, event: HostEvent) {
        match event {
            HostEvent::ParticipantConnected(who) => self.on_connected(host, &who),
            HostEvent::ParticipantDisconnected(id) => self.on_disconnected(host, &id),
            HostEvent::LiveInventoryChanged { id, kind, slot } => {
                if let Some(proxy) = self.proxies.get(&ProxyKey::new(id, kind)) {
                    if let Some(revision) = fold_live_change(proxy, host, slot) {
                        debug!(
                            "Folded live change of {} slot {slot} for {} at revision {revision}",
                            kind,
                            proxy.target().name
                        );
                    }
                }
            }
            HostEvent::ContainerClosed { observer, view } => {
                if let Some(entry) = self.registry.find_view(&observer, view) {
                    self.close_entry(host, entry, false);
                }
            }
        }
    }

    /// Search connected players' live inventories and every loaded offline
    /// copy for matching items.
    pub fn search(
        &self,
        host: &dyn HostWorld,
        matcher: &ItemMatcher,
        kinds: &[InventoryKind],
    ) -> Vec<SearchHit> {
        let (hits, _) = self.search_loaded(host, matcher, kinds);
        self.rank(hits)
    }

    /// [`search`](Self::search), plus every offline player the store knows
    /// about. Stored inventories are read directly and no proxies are
    /// created. Players whose data cannot be read are skipped; only a
    /// failing roster is an error.
    pub fn search_all(
        &self,
        host: &dyn HostWorld,
        matcher: &ItemMatcher,
        kinds: &[InventoryKind],
    ) -> Result<Vec<SearchHit>, InvseeError> {
        let (mut hits, covered) = self.search_loaded(host, matcher, kinds);
        let store = self.runner.store();
        let known = match store.known_players() {
            Ok(known) => known,
            Err(StoreError::NoData) => Vec::new(),
            Err(e) => {
                return Err(InvseeError::StoreUnavailable {
                    target: ParticipantId::new("*"),
                    reason: e.to_string(),
                })
            }
        };
        for who in known {
            if host.is_connected(&who.id) {
                continue;
            }
            for &kind in kinds {
                if covered.contains(&ProxyKey::new(who.id.clone(), kind)) {
                    continue;
                }
                match store.load(&who.id, kind).and_then(|snap| snap.validate(kind)) {
                    Ok(snapshot) => hits.extend(search::scan(matcher, &who, kind, snapshot.slots())),
                    Err(StoreError::NoData) => {}
                    Err(e) => warn!("Skipping {} of {} in search: {e}", kind, who.name),
                }
            }
        }
        Ok(self.rank(hits))
    }

    /// Hits from live inventories and in-memory proxies, plus the keys they
    /// cover.
    fn search_loaded(
        &self,
        host: &dyn HostWorld,
        matcher: &ItemMatcher,
        kinds: &[InventoryKind],
    ) -> (Vec<SearchHit>, HashSet<ProxyKey>) {
        let mut hits = Vec::new();
        let mut covered = HashSet::new();
        for who in host.online_participants() {
            for &kind in kinds {
                let Some(snapshot) = host.read_live(&who.id, kind) else {
                    continue;
                };
                covered.insert(ProxyKey::new(who.id.clone(), kind));
                hits.extend(search::scan(matcher, &who, kind, snapshot.slots()));
            }
        }
        for (key, proxy) in &self.proxies {
            if !kinds.contains(&key.kind) || covered.contains(key) {
                continue;
            }
            // Loading proxies hold no contents yet; the store copy stands in.
            if proxy.is_offline() {
                hits.extend(search::scan(matcher, proxy.target(), key.kind, &proxy.contents()));
                covered.insert(key.clone());
            }
        }
        (hits, covered)
    }

    fn rank(&self, mut hits: Vec<SearchHit>) -> Vec<SearchHit> {
        hits.sort_by(|a, b| {
            a.target
                .name
                .to_lowercase()
                .cmp(&b.target.name.to_lowercase())
                .then(a.kind.cmp(&b.kind))
        });
        hits.truncate(self.config.search_results_max);
        hits
    }

    /// Close every view and write every offline copy back synchronously.
    pub fn shutdown(&mut self, host: &mut dyn HostWorld) {
        let entries: Vec<EntryId> = self
            .proxies
            .keys()
            .flat_map(|key| self.registry.entries_of_target(&key.target))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        for entry in entries {
            if let Some(e) = self.registry.unregister(entry) {
                self.access
                    .close_silently(host, entry, &e.entry.observer, e.entry.view, true);
            }
        }
        let mut saved = 0;
        for (key, proxy) in std::mem::take(&mut self.proxies) {
            dispatch(&proxy, &mut self.registry, host);
            if let Some((snapshot, revision)) = proxy.offline_snapshot() {
                match self.runner.store().save(&key.target, key.kind, &snapshot) {
                    Ok(()) => {
                        proxy.mark_saved(revision);
                        saved += 1;
                    }
                    Err(e) => warn!("Failed to save {} of {}: {e}", key.kind, key.target),
                }
            }
            proxy.detach();
        }
        self.releases.clear();
        for (_, waiters) in self.waiting.drain() {
            for waiter in waiters {
                let _ = waiter.reply.send(Err(InvseeError::ViewClosed));
            }
        }
        info!("Inventory views shut down, {saved} offline inventories saved");
    }

    // -----------------------------------------------------------------------
    // Opening
    // -----------------------------------------------------------------------

    fn open(
        &mut self,
        host: &mut dyn HostWorld,
        operator: ParticipantId,
        query: &str,
        kind: InventoryKind,
        reply: OpenReply,
    ) {
        let target = match IdentityResolver::resolve(host, self.runner.store(), query) {
            Ok(target) => target,
            Err(e) => {
                debug!("{operator} could not resolve '{query}': {e}");
                let _ = reply.send(Err(e));
                return;
            }
        };
        match self.acquire(host, &target, kind) {
            Ok(Acquired::Ready(proxy)) => {
                let result = self.attach_observer(host, &operator, &proxy);
                let _ = reply.send(result);
            }
            Ok(Acquired::Loading) => {
                self.waiting
                    .entry(ProxyKey::new(target.id, kind))
                    .or_default()
                    .push(PendingOpen { operator, reply });
            }
            Err(e) => {
                warn!("{operator} could not open {kind} of {}: {e}", target.name);
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Get the proxy for a target's inventory, creating its source if needed.
    /// At most one load per target and kind is ever in flight.
    fn acquire(
        &mut self,
        host: &mut dyn HostWorld,
        target: &ParticipantIdentity,
        kind: InventoryKind,
    ) -> Result<Acquired, InvseeError> {
        let key = ProxyKey::new(target.id.clone(), kind);
        if let Some(proxy) = self.proxies.get(&key) {
            if proxy.is_loading() {
                return Ok(Acquired::Loading);
            }
            if let Some(Release::RetryAt(_)) = self.releases.get(&key) {
                self.releases.remove(&key);
            }
            return Ok(Acquired::Ready(Arc::clone(proxy)));
        }

        if host.is_connected(&target.id) {
            if let Some(current) = host.read_live(&target.id, kind) {
                let proxy = Arc::new(ProxyInventory::live(target.clone(), kind, current));
                self.proxies.insert(key, Arc::clone(&proxy));
                return Ok(Acquired::Ready(proxy));
            }
        }

        let proxy = Arc::new(ProxyInventory::loading(target.clone(), kind));
        self.proxies.insert(key.clone(), Arc::clone(&proxy));
        match self.runner.load(&key) {
            None => Ok(Acquired::Loading),
            Some(Ok(snapshot)) => {
                proxy.complete_load(snapshot);
                Ok(Acquired::Ready(proxy))
            }
            Some(Err(e)) => {
                self.drop_proxy(&key);
                Err(InvseeError::from_store(e, &target.id, kind))
            }
        }
    }

    fn attach_observer(
        &mut self,
        host: &mut dyn HostWorld,
        operator: &ParticipantId,
        proxy: &Arc<ProxyInventory>,
    ) -> Result<ViewHandle, InvseeError> {
        let key = proxy.key();
        let kind = key.kind;
        let (entry, created) = self.registry.register(operator, &key.target, kind);
        if let (false, Some(view)) = (created, entry.view) {
            return Ok(ViewHandle {
                entry: entry.id,
                observer: operator.clone(),
                view,
                proxy: Arc::clone(proxy),
            });
        }

        let spec = ContainerSpec {
            title: render_title(host, operator, proxy.target(), kind),
            kind,
            rows: kind.rows(),
            contents: kind.to_view_order(&proxy.contents()),
        };
        match self.access.open_silently(host, entry.id, operator, spec) {
            Ok(view) => {
                self.registry.attach_view(entry.id, view);
                proxy.open_entry(entry.id);
                info!(
                    "{operator} opened {kind} of {} ({})",
                    proxy.target().name,
                    proxy.source_label()
                );
                Ok(ViewHandle {
                    entry: entry.id,
                    observer: operator.clone(),
                    view,
                    proxy: Arc::clone(proxy),
                })
            }
            Err(e) => {
                warn!("Showing {kind} of {} to {operator} failed: {e}", proxy.target().name);
                if let Some(removed) = self.registry.unregister(entry.id) {
                    if removed.last {
                        self.release(host, &key, false);
                    }
                }
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Closing and release
    // -----------------------------------------------------------------------

    fn close_entry(&mut self, host: &mut dyn HostWorld, entry: EntryId, hide: bool) {
        let Some(removed) = self.registry.unregister(entry) else {
            return;
        };
        let e = removed.entry;
        self.access.close_silently(host, entry, &e.observer, e.view, hide);
        let key = e.key();
        if let Some(proxy) = self.proxies.get(&key) {
            proxy.close_entry(entry);
        }
        info!("{} closed {} of {}", e.observer, e.kind, e.target);
        if removed.last {
            self.release(host, &key, true);
        }
    }

    fn collect_garbage(&mut self, host: &mut dyn HostWorld) {
        for removed in self.registry.collect_garbage() {
            let e = removed.entry;
            debug!("Collected stale view of {} for {}", e.target, e.observer);
            self.access.close_silently(host, e.id, &e.observer, e.view, false);
            let key = e.key();
            if let Some(proxy) = self.proxies.get(&key) {
                proxy.close_entry(e.id);
            }
            if removed.last {
                self.release(host, &key, true);
            }
        }
    }

    /// Let go of a proxy nobody is viewing. Live proxies are dropped after
    /// their pending writes reach the live object; offline copies are saved
    /// first and kept until the save succeeds.
    fn release(&mut self, host: &mut dyn HostWorld, key: &ProxyKey, save_clean: bool) {
        let Some(proxy) = self.proxies.get(key).cloned() else {
            return;
        };
        if self.registry.count(key) > 0 || proxy.is_loading() {
            return;
        }
        if matches!(self.releases.get(key), Some(Release::Saving(_))) {
            return;
        }
        dispatch(&proxy, &mut self.registry, host);

        let Some((snapshot, revision)) = proxy.offline_snapshot() else {
            debug!("Released live {} of {}", key.kind, proxy.target().name);
            self.drop_proxy(key);
            return;
        };
        if !save_clean && !proxy.is_dirty() {
            self.drop_proxy(key);
            return;
        }

        self.releases.insert(key.clone(), Release::Saving(revision));
        if let Some(result) = self.runner.save(key, snapshot, revision) {
            self.finish_save(host, key, revision, result);
        }
    }

    fn finish_save(
        &mut self,
        host: &mut dyn HostWorld,
        key: &ProxyKey,
        revision: u64,
        result: Result<(), StoreError>,
    ) {
        self.releases.remove(key);
        let Some(proxy) = self.proxies.get(key).cloned() else {
            return;
        };
        let unobserved = self.registry.count(key) == 0;
        match result {
            Ok(()) => {
                proxy.mark_saved(revision);
                info!(
                    "Saved {} of {} at revision {revision}",
                    key.kind,
                    proxy.target().name
                );
                if unobserved {
                    if proxy.is_dirty() {
                        self.release(host, key, false);
                    } else {
                        self.drop_proxy(key);
                    }
                }
            }
            Err(e) => {
                let err = InvseeError::from_store(e, &key.target, key.kind);
                if unobserved {
                    let at = self.tick + self.config.save_retry_ticks.max(1);
                    warn!("{err}; keeping it in memory, retry at tick {at}");
                    self.releases.insert(key.clone(), Release::RetryAt(at));
                } else {
                    warn!("{err}; will save again when its views close");
                }
            }
        }
    }

    fn retry_releases(&mut self, host: &mut dyn HostWorld) {
        let due: Vec<ProxyKey> = self
            .releases
            .iter()
            .filter(|(_, r)| matches!(r, Release::RetryAt(at) if *at <= self.tick))
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            self.releases.remove(&key);
            debug!("Retrying save of {} of {}", key.kind, key.target);
            self.release(host, &key, true);
        }
    }

    fn drop_proxy(&mut self, key: &ProxyKey) {
        if let Some(proxy) = self.proxies.remove(key) {
            proxy.detach();
        }
        self.releases.remove(key);
    }

    // -----------------------------------------------------------------------
    // Store completions and connection handoffs
    // -----------------------------------------------------------------------

    fn on_store_reply(&mut self, host: &mut dyn HostWorld, reply: StoreReply) {
        match reply {
            StoreReply::Loaded { key, result } => {
                let waiters = self.waiting.remove(&key).unwrap_or_default();
                let Some(proxy) = self.proxies.get(&key).cloned() else {
                    return;
                };
                let failure = match result {
                    Ok(snapshot) => {
                        if !proxy.complete_load(snapshot) {
                            debug!("Discarding late load of {} for {}", key.kind, key.target);
                        }
                        None
                    }
                    // A live binding made while loading makes the failure moot.
                    Err(_) if !proxy.is_loading() => None,
                    Err(e) => Some(InvseeError::from_store(e, &key.target, key.kind)),
                };
                if let Some(err) = failure {
                    warn!("Loading failed: {err}");
                    self.drop_proxy(&key);
                    for waiter in waiters {
                        let _ = waiter.reply.send(Err(err.clone()));
                    }
                    return;
                }
                for waiter in waiters {
                    let result = self.attach_observer(host, &waiter.operator, &proxy);
                    let _ = waiter.reply.send(result);
                }
            }
            StoreReply::Saved {
                key,
                revision,
                result,
            } => self.finish_save(host, &key, revision, result),
        }
    }

    fn on_connected(&mut self, host: &mut dyn HostWorld, who: &ParticipantIdentity) {
        for kind in InventoryKind::ALL {
            let key = ProxyKey::new(who.id.clone(), kind);
            let Some(proxy) = self.proxies.get(&key).cloned() else {
                continue;
            };
            if proxy.attach_live(host) && self.registry.count(&key) == 0 {
                // Only kept alive for a pending save; the live session owns it now.
                self.drop_proxy(&key);
            }
        }
    }

    fn on_disconnected(&mut self, host: &mut dyn HostWorld, id: &ParticipantId) {
        for entry in self.registry.entries_of_observer(id) {
            self.close_entry(host, entry, false);
        }

        for kind in InventoryKind::ALL {
            let key = ProxyKey::new(id.clone(), kind);
            let Some(proxy) = self.proxies.get(&key).cloned() else {
                continue;
            };
            if self.config.offline_access {
                proxy.detach_live(host);
                continue;
            }
            info!("{} left; closing views of their {}", proxy.target().name, kind);
            for entry in self.registry.entries_of_target(id) {
                if self.registry.get(entry).is_some_and(|e| e.kind == kind) {
                    self.close_entry(host, entry, true);
                }
            }
            self.drop_proxy(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::PersistenceMode;
    use crate::item::InventorySnapshot;
    use crate::search::EnchantFilter;
    use crate::testing::{MemoryStore, MockHost};

    struct Rig {
        engine: Engine,
        host: MockHost,
        store: Arc<MemoryStore>,
    }

    impl Rig {
        fn new() -> Self {
            Self::with_config(EngineConfig::default())
        }

        fn with_config(config: EngineConfig) -> Self {
            let store = Arc::new(MemoryStore::new());
            let engine = Engine::new(config, store.clone());
            Self {
                engine,
                host: MockHost::new(),
                store,
            }
        }

        /// Deliver what the host emitted since the last tick, then tick.
        fn tick(&mut self) {
            let handle = self.engine.handle();
            for event in self.host.take_events() {
                handle.publish(event);
            }
            self.engine.tick(&mut self.host);
        }

        fn open(&mut self, operator: &str, target: &str, kind: InventoryKind) -> Result<ViewHandle, InvseeError> {
            let mut rx = self
                .engine
                .request_open(&mut self.host, &id(operator), target, kind);
            rx.try_recv().expect("blocking open completes inline")
        }

        fn close(&mut self, handle: &ViewHandle) {
            self.engine.request_close(&mut self.host, handle);
        }
    }

    fn id(s: &str) -> ParticipantId {
        ParticipantId::new(s)
    }

    fn p1() -> ParticipantIdentity {
        ParticipantIdentity::new("p1", "P1")
    }

    fn p2() -> ParticipantIdentity {
        ParticipantIdentity::new("p2", "P2")
    }

    fn item(name: &str, count: u8) -> Option<ItemStack> {
        Some(ItemStack::new(name, count))
    }

    #[test]
    fn live_edits_reach_target_and_other_operator() {
        let mut rig = Rig::new();
        rig.host.connect(p1());
        let o1 = rig.open("o1", "P1", InventoryKind::Main).unwrap();
        o1.set_slot(0, item("minecraft:apple", 1)).unwrap();
        rig.tick();

        let o2 = rig.open("o2", "P1", InventoryKind::Main).unwrap();
        assert!(Arc::ptr_eq(o1.proxy(), o2.proxy()));
        assert_eq!(o2.get_slot(0).unwrap().item, item("minecraft:apple", 1));
        assert_eq!(rig.host.view_storage_slot(o2.view(), 0), item("minecraft:apple", 1));

        o2.set_slot(0, item("minecraft:bread", 2)).unwrap();
        rig.tick();
        assert_eq!(rig.host.view_storage_slot(o1.view(), 0), item("minecraft:bread", 2));
        let live = rig.host.read_live(&p1().id, InventoryKind::Main).unwrap();
        assert_eq!(live.get(0), item("minecraft:bread", 2).as_ref());
        assert!(rig.host.notifications().is_empty());
    }

    #[test]
    fn live_change_fans_out_without_feedback() {
        let mut rig = Rig::new();
        rig.host.connect(p1());
        let views: Vec<ViewHandle> = ["o1", "o2", "o3"]
            .iter()
            .map(|o| rig.open(o, "P1", InventoryKind::Main).unwrap())
            .collect();

        rig.host
            .player_sets_slot(&p1().id, InventoryKind::Main, 5, item("minecraft:stone", 7));
        rig.tick();
        rig.tick();
        rig.tick();

        assert_eq!(rig.host.live_writes(&p1().id), 1);
        for view in &views {
            assert_eq!(
                rig.host.view_storage_slot(view.view(), 5),
                item("minecraft:stone", 7)
            );
        }
    }

    #[test]
    fn observer_edit_is_written_once() {
        let mut rig = Rig::new();
        rig.host.connect(p1());
        let o1 = rig.open("o1", "P1", InventoryKind::Main).unwrap();
        let _o2 = rig.open("o2", "P1", InventoryKind::Main).unwrap();
        o1.set_slot(3, item("minecraft:torch", 16)).unwrap();
        for _ in 0..4 {
            rig.tick();
        }
        assert_eq!(rig.host.live_writes(&p1().id), 1);
        assert_eq!(o1.proxy().revision(), 1);
    }

    #[test]
    fn offline_ender_chest_is_saved_once_on_close() {
        let mut rig = Rig::new();
        rig.store.add_player(p2());
        let mut chest = InventorySnapshot::empty(InventoryKind::EnderChest);
        chest.set(3, item("minecraft:diamond", 4));
        chest.set(10, item("minecraft:emerald", 1));
        rig.store
            .put(&p2().id, InventoryKind::EnderChest, chest.clone());

        let o1 = rig.open("o1", "P2", InventoryKind::EnderChest).unwrap();
        assert!(o1.proxy().is_offline());
        assert_eq!(rig.host.view_storage_slot(o1.view(), 3), item("minecraft:diamond", 4));

        o1.set_slot(3, None).unwrap();
        rig.close(&o1);

        let saves = rig.store.saves();
        assert_eq!(saves.len(), 1);
        let mut expected = chest;
        expected.set(3, None);
        assert_eq!(saves[0].2, expected);
        assert!(rig.engine.proxy(&p2().id, InventoryKind::EnderChest).is_none());
        assert!(matches!(
            o1.set_slot(0, item("minecraft:dirt", 1)),
            Err(InvseeError::SourceDetached { .. })
        ));
    }

    #[test]
    fn only_last_close_saves() {
        let mut rig = Rig::new();
        rig.store.add_player(p2());
        let o1 = rig.open("o1", "P2", InventoryKind::Main).unwrap();
        let o2 = rig.open("o2", "P2", InventoryKind::Main).unwrap();
        o1.set_slot(0, item("minecraft:apple", 1)).unwrap();

        rig.close(&o1);
        assert!(rig.store.saves().is_empty());
        rig.tick();
        assert_eq!(rig.host.view_storage_slot(o2.view(), 0), item("minecraft:apple", 1));

        rig.close(&o2);
        assert_eq!(rig.store.saves().len(), 1);
        assert_eq!(rig.store.load_count(), 1);
    }

    #[test]
    fn target_leaving_mid_edit_keeps_every_change() {
        let mut rig = Rig::new();
        rig.store.add_player(p1());
        rig.host.connect(p1());
        let o1 = rig.open("o1", "P1", InventoryKind::Main).unwrap();
        o1.set_slot(0, item("minecraft:apple", 1)).unwrap();
        rig.tick();
        o1.set_slot(1, item("minecraft:bread", 2)).unwrap();
        o1.set_slot(2, item("minecraft:carrot", 3)).unwrap();

        // Hosts publish the disconnect while the live object is still readable.
        rig.engine
            .handle()
            .publish(HostEvent::ParticipantDisconnected(p1().id));
        rig.tick();
        rig.host.disconnect(&p1().id);

        assert!(o1.proxy().is_offline());
        assert_eq!(rig.host.live_writes(&p1().id), 1);
        o1.set_slot(4, item("minecraft:egg", 4)).unwrap();
        rig.close(&o1);

        let saves = rig.store.saves();
        assert_eq!(saves.len(), 1);
        let saved = &saves[0].2;
        assert_eq!(saved.get(0), item("minecraft:apple", 1).as_ref());
        assert_eq!(saved.get(1), item("minecraft:bread", 2).as_ref());
        assert_eq!(saved.get(2), item("minecraft:carrot", 3).as_ref());
        assert_eq!(saved.get(4), item("minecraft:egg", 4).as_ref());
    }

    #[test]
    fn target_joining_takes_over_offline_edits() {
        let mut rig = Rig::new();
        rig.store.add_player(p2());
        let o1 = rig.open("o1", "P2", InventoryKind::Main).unwrap();
        o1.set_slot(4, item("minecraft:bow", 1)).unwrap();
        rig.tick();

        rig.host.connect(p2());
        rig.engine
            .handle()
            .publish(HostEvent::ParticipantConnected(p2()));
        rig.tick();
        assert!(o1.proxy().is_live());
        let live = rig.host.read_live(&p2().id, InventoryKind::Main).unwrap();
        assert_eq!(live.get(4), item("minecraft:bow", 1).as_ref());

        rig.close(&o1);
        assert!(rig.store.saves().is_empty());
    }

    #[test]
    fn live_only_mode_closes_views_when_target_leaves() {
        let mut rig = Rig::with_config(EngineConfig {
            offline_access: false,
            ..EngineConfig::default()
        });
        rig.host.connect(p1());
        let o1 = rig.open("o1", "P1", InventoryKind::Main).unwrap();
        rig.engine
            .handle()
            .publish(HostEvent::ParticipantDisconnected(p1().id));
        rig.tick();

        assert!(!rig.host.is_view_open(o1.view()));
        assert_eq!(rig.engine.open_views(), 0);
        assert!(matches!(
            o1.set_slot(0, item("minecraft:apple", 1)),
            Err(InvseeError::SourceDetached { .. })
        ));
        assert!(rig.host.notifications().is_empty());
    }

    #[test]
    fn failed_save_is_retried() {
        let mut rig = Rig::with_config(EngineConfig {
            save_retry_ticks: 2,
            ..EngineConfig::default()
        });
        rig.store.add_player(p2());
        rig.store.fail_next_saves(1);
        let o1 = rig.open("o1", "P2", InventoryKind::Main).unwrap();
        o1.set_slot(7, item("minecraft:shield", 1)).unwrap();
        rig.close(&o1);

        assert_eq!(rig.store.saves().len(), 1);
        assert!(rig.engine.is_releasing(&p2().id, InventoryKind::Main));
        let kept = rig.engine.proxy(&p2().id, InventoryKind::Main).unwrap();
        assert_eq!(kept.get_slot(7).unwrap().item, item("minecraft:shield", 1));

        rig.tick();
        rig.tick();
        assert_eq!(rig.store.saves().len(), 2);
        assert!(rig.engine.proxy(&p2().id, InventoryKind::Main).is_none());
        let stored = rig.store.stored(&p2().id, InventoryKind::Main).unwrap();
        assert_eq!(stored.get(7), item("minecraft:shield", 1).as_ref());
    }

    #[test]
    fn reopen_during_retry_reuses_unsaved_copy() {
        let mut rig = Rig::new();
        rig.store.add_player(p2());
        rig.store.fail_next_saves(1);
        let o1 = rig.open("o1", "P2", InventoryKind::Main).unwrap();
        o1.set_slot(7, item("minecraft:shield", 1)).unwrap();
        rig.close(&o1);

        let again = rig.open("o1", "P2", InventoryKind::Main).unwrap();
        assert!(Arc::ptr_eq(o1.proxy(), again.proxy()));
        assert_eq!(again.get_slot(7).unwrap().item, item("minecraft:shield", 1));
        assert!(!rig.engine.is_releasing(&p2().id, InventoryKind::Main));
        assert_eq!(rig.store.load_count(), 1);
    }

    #[test]
    fn broken_view_does_not_block_others() {
        let mut rig = Rig::new();
        rig.host.connect(p1());
        let o1 = rig.open("o1", "P1", InventoryKind::Main).unwrap();
        let o2 = rig.open("o2", "P1", InventoryKind::Main).unwrap();
        let o3 = rig.open("o3", "P1", InventoryKind::Main).unwrap();
        rig.host.fail_pushes_to(o2.view());

        o1.set_slot(2, item("minecraft:apple", 1)).unwrap();
        rig.tick();
        assert_eq!(rig.host.view_storage_slot(o3.view(), 2), item("minecraft:apple", 1));
        rig.tick();
        assert_eq!(rig.engine.open_views(), 2);
        assert!(matches!(
            o2.set_slot(1, item("minecraft:apple", 1)),
            Err(InvseeError::ViewClosed)
        ));
    }

    #[test]
    fn failed_open_rolls_back() {
        let mut rig = Rig::new();
        rig.host.connect(p1());
        rig.host.fail_next_open();
        let err = rig.open("o1", "P1", InventoryKind::Main).unwrap_err();
        assert!(matches!(err, InvseeError::Host(_)));
        assert_eq!(rig.engine.open_views(), 0);
        assert!(rig.engine.proxy(&p1().id, InventoryKind::Main).is_none());

        rig.store.add_player(p2());
        rig.host.fail_next_open();
        assert!(rig.open("o1", "P2", InventoryKind::Main).is_err());
        assert!(rig.store.saves().is_empty());
        assert!(rig.engine.proxy(&p2().id, InventoryKind::Main).is_none());
    }

    #[test]
    fn store_failures_surface_to_operator() {
        let mut rig = Rig::new();
        assert!(matches!(
            rig.open("o1", "Nobody", InventoryKind::Main),
            Err(InvseeError::NotFound(_))
        ));

        rig.store.add_player(p2());
        rig.store.fail_loads(true);
        assert!(matches!(
            rig.open("o1", "P2", InventoryKind::Main),
            Err(InvseeError::StoreUnavailable { .. })
        ));
        assert!(rig.engine.proxy(&p2().id, InventoryKind::Main).is_none());

        rig.store.fail_loads(false);
        let mut bad = InventorySnapshot::empty(InventoryKind::Main);
        bad.set(5, Some(ItemStack::new("minecraft:stone", 99)));
        rig.store.put(&p2().id, InventoryKind::Main, bad);
        match rig.open("o1", "P2", InventoryKind::Main) {
            Err(InvseeError::CorruptData { slot, .. }) => assert_eq!(slot, Some(5)),
            other => panic!("expected corrupt data, got {other:?}"),
        }
    }

    #[test]
    fn unreadable_roster_is_not_reported_as_unknown() {
        let mut rig = Rig::new();
        rig.store.add_player(p2());
        rig.store.fail_roster(true);
        rig.store.fail_loads(true);
        match rig.open("o1", "P2", InventoryKind::Main) {
            Err(InvseeError::StoreUnavailable { reason, .. }) => assert!(reason.contains("roster")),
            other => panic!("expected store unavailable, got {other:?}"),
        }
        assert_eq!(rig.engine.open_views(), 0);
    }

    #[test]
    fn unstorable_edit_never_reaches_the_store() {
        let mut rig = Rig::new();
        rig.store.add_player(p2());
        let o1 = rig.open("o1", "P2", InventoryKind::Main).unwrap();
        assert_eq!(
            o1.set_slot(0, item("minecraft:stone", 200)).unwrap_err().code(),
            "InvalidItem"
        );
        assert_eq!(o1.set_slot(1, item("", 1)).unwrap_err().code(), "InvalidItem");
        assert_eq!(o1.proxy().revision(), 0);
        o1.set_slot(2, item("minecraft:stone", 64)).unwrap();
        rig.close(&o1);

        let again = rig.open("o1", "P2", InventoryKind::Main).unwrap();
        assert_eq!(again.get_slot(0).unwrap().item, None);
        assert_eq!(again.get_slot(2).unwrap().item, item("minecraft:stone", 64));
    }

    #[test]
    fn reopening_returns_same_view() {
        let mut rig = Rig::new();
        rig.host.connect(p1());
        let first = rig.open("o1", "P1", InventoryKind::Armor).unwrap();
        let second = rig.open("o1", "P1", InventoryKind::Armor).unwrap();
        assert_eq!(first.entry(), second.entry());
        assert_eq!(first.view(), second.view());
        assert_eq!(rig.host.open_view_count(&id("o1")), 1);
        assert_eq!(rig.engine.access_state(first.entry()), AccessState::Open);
    }

    #[test]
    fn client_close_and_observer_leave_drop_entries() {
        let mut rig = Rig::new();
        rig.store.add_player(p2());
        let o1 = rig.open("o1", "P2", InventoryKind::Main).unwrap();
        let o2 = rig.open("o2", "P2", InventoryKind::Main).unwrap();
        let handle = rig.engine.handle();

        handle.publish(HostEvent::ParticipantDisconnected(id("o1")));
        rig.tick();
        assert_eq!(rig.engine.open_views(), 1);
        assert!(rig.store.saves().is_empty());

        handle.publish(HostEvent::ContainerClosed {
            observer: id("o2"),
            view: o2.view(),
        });
        rig.tick();
        assert_eq!(rig.engine.open_views(), 0);
        assert_eq!(rig.store.saves().len(), 1);
        assert_eq!(rig.engine.access_state(o1.entry()), AccessState::Closed);
        assert!(rig.host.notifications().is_empty());
    }

    #[test]
    fn writes_by_view_slot_follow_hotbar_layout() {
        let mut rig = Rig::new();
        rig.host.connect(p1());
        let o1 = rig.open("o1", "P1", InventoryKind::Main).unwrap();
        o1.set_view_slot(27, item("minecraft:sword", 1)).unwrap();
        assert_eq!(o1.get_slot(0).unwrap().item, item("minecraft:sword", 1));
        assert!(matches!(
            o1.set_view_slot(36, None),
            Err(InvseeError::OutOfRange { .. })
        ));
    }

    #[test]
    fn titles_are_localized_per_observer() {
        let mut rig = Rig::new();
        rig.host.connect(p1());
        rig.host
            .translate("container.enderchest", "Coffre de %player%");
        let chest = rig.open("o1", "P1", InventoryKind::EnderChest).unwrap();
        let main = rig.open("o1", "P1", InventoryKind::Main).unwrap();
        assert_eq!(rig.host.view_title(chest.view()), Some("Coffre de P1"));
        assert_eq!(rig.host.view_title(main.view()), Some("P1's Inventory"));
    }

    #[test]
    fn search_covers_live_and_loaded_offline() {
        let mut rig = Rig::new();
        let mut main = InventorySnapshot::empty(InventoryKind::Main);
        main.set(0, item("minecraft:diamond", 3));
        rig.host.connect_with(p1(), InventoryKind::Main, main.clone());
        rig.store.add_player(p2());
        rig.store.put(&p2().id, InventoryKind::Main, main);
        let _view = rig.open("o1", "P2", InventoryKind::Main).unwrap();

        let hits = rig.engine.search(
            &rig.host,
            &ItemMatcher::item("diamond"),
            &[InventoryKind::Main],
        );
        let names: Vec<&str> = hits.iter().map(|h| h.target.name.as_str()).collect();
        assert_eq!(names, ["P1", "P2"]);

        let none = rig.engine.search(
            &rig.host,
            &ItemMatcher::enchanted(EnchantFilter::Any { min_level: 1 }),
            &InventoryKind::ALL,
        );
        assert!(none.is_empty());
    }

    #[test]
    fn search_all_reads_stored_players_without_loading_them() {
        let mut rig = Rig::new();
        let mut main = InventorySnapshot::empty(InventoryKind::Main);
        main.set(0, item("minecraft:diamond", 3));
        rig.host.connect_with(p1(), InventoryKind::Main, main.clone());
        rig.store.add_player(p1());
        rig.store.put(&p1().id, InventoryKind::Main, InventorySnapshot::empty(InventoryKind::Main));

        let mut chest = InventorySnapshot::empty(InventoryKind::EnderChest);
        chest.set(8, item("minecraft:diamond", 12));
        rig.store.add_player(p2());
        rig.store.put(&p2().id, InventoryKind::EnderChest, chest);

        let p3 = ParticipantIdentity::new("p3", "P3");
        let mut broken = InventorySnapshot::empty(InventoryKind::Main);
        broken.set(0, Some(ItemStack::new("minecraft:diamond", 99)));
        rig.store.add_player(p3.clone());
        rig.store.put(&p3.id, InventoryKind::Main, broken);

        let matcher = ItemMatcher::item("diamond");
        let loaded_only = rig.engine.search(&rig.host, &matcher, &InventoryKind::ALL);
        assert_eq!(loaded_only.len(), 1);

        let hits = rig.engine.search_all(&rig.host, &matcher, &InventoryKind::ALL).unwrap();
        let found: Vec<(&str, InventoryKind)> = hits.iter().map(|h| (h.target.name.as_str(), h.kind)).collect();
        assert_eq!(found, [("P1", InventoryKind::Main), ("P2", InventoryKind::EnderChest)]);
        assert_eq!(hits[1].slots, vec![8]);
        assert_eq!(hits[1].total, 12);
        assert!(rig.engine.proxy(&p2().id, InventoryKind::EnderChest).is_none());
        assert!(rig.store.saves().is_empty());

        rig.store.fail_roster(true);
        assert_eq!(
            rig.engine
                .search_all(&rig.host, &matcher, &InventoryKind::ALL)
                .unwrap_err()
                .code(),
            "StoreUnavailable"
        );
    }

    #[test]
    fn shutdown_saves_open_offline_copies() {
        let mut rig = Rig::new();
        rig.store.add_player(p2());
        let o1 = rig.open("o1", "P2", InventoryKind::Armor).unwrap();
        o1.set_slot(0, item("minecraft:iron_helmet", 1)).unwrap();
        rig.engine.shutdown(&mut rig.host);
        assert!(!rig.host.is_view_open(o1.view()));
        let stored = rig.store.stored(&p2().id, InventoryKind::Armor).unwrap();
        assert_eq!(stored.get(0), item("minecraft:iron_helmet", 1).as_ref());
    }

    #[tokio::test]
    async fn background_load_serves_all_waiters_once() {
        let mut rig = Rig::with_config(EngineConfig {
            persistence: PersistenceMode::Background,
            ..EngineConfig::default()
        });
        rig.store.add_player(p2());
        rig.store.set_delay(Duration::from_millis(10));
        let handle = rig.engine.handle();
        let mut first = handle.request_open(id("o1"), "P2", InventoryKind::Main);
        let mut second = handle.request_open(id("o2"), "P2", InventoryKind::Main);

        let mut opened = Vec::new();
        for _ in 0..200 {
            rig.tick();
            if let Ok(result) = first.try_recv() {
                opened.push(result);
            }
            if let Ok(result) = second.try_recv() {
                opened.push(result);
            }
            if opened.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(opened.len(), 2);
        let views: Vec<ViewHandle> = opened.into_iter().map(Result::unwrap).collect();
        assert!(Arc::ptr_eq(views[0].proxy(), views[1].proxy()));
        assert_eq!(rig.store.load_count(), 1);

        views[0].set_slot(1, item("minecraft:apple", 1)).unwrap();
        handle.request_close(&views[0]);
        handle.request_close(&views[1]);
        for _ in 0..200 {
            rig.tick();
            if rig.engine.proxy(&p2().id, InventoryKind::Main).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(rig.store.saves().len(), 1);
        assert!(rig.engine.proxy(&p2().id, InventoryKind::Main).is_none());
    }

    #[tokio::test]
    async fn timed_out_save_is_retried() {
        let mut rig = Rig::with_config(EngineConfig {
            persistence: PersistenceMode::Background,
            store_timeout_ms: 30,
            save_retry_ticks: 3,
            ..EngineConfig::default()
        });
        rig.store.add_player(p2());
        let handle = rig.engine.handle();
        let mut pending = handle.request_open(id("o1"), "P2", InventoryKind::Main);
        let mut view = None;
        for _ in 0..200 {
            rig.tick();
            if let Ok(result) = pending.try_recv() {
                view = Some(result.unwrap());
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let view = view.expect("load completes");
        view.set_slot(4, item("minecraft:bow", 1)).unwrap();

        rig.store.slow_next_save(Duration::from_millis(600));
        handle.request_close(&view);
        rig.tick();
        assert!(rig.engine.is_releasing(&p2().id, InventoryKind::Main));

        // Well before the slow save returns, the timeout fires and the retry
        // lands.
        for _ in 0..30 {
            if rig.engine.proxy(&p2().id, InventoryKind::Main).is_none() {
                break;
            }
            assert!(rig.engine.is_releasing(&p2().id, InventoryKind::Main));
            tokio::time::sleep(Duration::from_millis(10)).await;
            rig.tick();
        }
        assert!(rig.engine.proxy(&p2().id, InventoryKind::Main).is_none());
        assert!(!rig.engine.is_releasing(&p2().id, InventoryKind::Main));
        let saves = rig.store.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].2.get(4), item("minecraft:bow", 1).as_ref());
    }
}
