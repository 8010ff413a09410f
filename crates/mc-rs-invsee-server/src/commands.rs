//! Console commands driving the world and the inspection engine.

use std::sync::Arc;

use mc_rs_invsee::{
    AccessState, EnchantFilter, Engine, HostEvent, HostWorld, InventoryKind, InvseeError,
    ItemMatcher, ItemStack, OpenReceiver, ParticipantId, ParticipantIdentity, PlayerStore,
    StoreError, ViewHandle,
};
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{info, warn};

use crate::permissions::{node_for, Permissions, NODE_SEARCH};
use crate::persistence::JsonPlayerStore;
use crate::world::ConsoleWorld;

/// Result of one console command.
#[derive(Debug)]
pub struct CommandResult {
    pub success: bool,
    pub messages: Vec<String>,
    /// If true, the server should shut down.
    pub should_stop: bool,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            messages: vec![message.into()],
            should_stop: false,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            messages: vec![message.into()],
            should_stop: false,
        }
    }

    fn lines(messages: Vec<String>) -> Self {
        Self {
            success: true,
            messages,
            should_stop: false,
        }
    }
}

impl From<InvseeError> for CommandResult {
    fn from(e: InvseeError) -> Self {
        CommandResult::err(format!("[{}] {e}", e.code()))
    }
}

const COMMANDS: &[(&str, &str)] = &[
    ("join <name>", "Bring a player online"),
    ("quit <name>", "Take a player offline"),
    ("give <player> <item> [count] [enchant:level]", "Put an item in a player's inventory"),
    ("openinv <operator> <player>", "Open a player's inventory"),
    ("openender <operator> <player>", "Open a player's ender chest"),
    ("openarmor <operator> <player>", "Open a player's armor"),
    ("set <operator> <player> <kind> <slot> <item|air> [count]", "Edit a slot through an open view"),
    ("close <operator> <player> <kind>", "Close an open view"),
    ("searchinv <operator> <item> [min_amount] [offline]", "Find players carrying an item"),
    ("searchench <operator> <enchant|any> [min_level] [offline]", "Find players carrying enchanted items"),
    ("grant <operator> <node>", "Grant a permission node"),
    ("list", "Show online players and open views"),
    ("help", "List available commands"),
    ("stop", "Stop the server"),
];

struct PendingOpen {
    label: String,
    rx: OpenReceiver,
}

pub struct Console {
    engine: Engine,
    world: ConsoleWorld,
    store: Arc<JsonPlayerStore>,
    permissions: Permissions,
    views: Vec<ViewHandle>,
    pending: Vec<PendingOpen>,
}

impl Console {
    pub fn new(
        engine: Engine,
        world: ConsoleWorld,
        store: Arc<JsonPlayerStore>,
        permissions: Permissions,
    ) -> Self {
        Self {
            engine,
            world,
            store,
            permissions,
            views: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Forward world events, run one engine tick and report opens that
    /// completed in the background.
    pub fn tick(&mut self) -> Vec<String> {
        self.forward_events();
        self.engine.tick(&mut self.world);

        let engine = &self.engine;
        self.views
            .retain(|v| engine.access_state(v.entry()) != AccessState::Closed);

        let mut done = Vec::new();
        let views = &mut self.views;
        self.pending.retain_mut(|p| match p.rx.try_recv() {
            Ok(Ok(handle)) => {
                done.push(format!("Opened {}", p.label));
                views.push(handle);
                false
            }
            Ok(Err(e)) => {
                done.push(format!("Could not open {}: [{}] {e}", p.label, e.code()));
                false
            }
            Err(TryRecvError::Empty) => true,
            Err(TryRecvError::Closed) => {
                done.push(format!("Open of {} was dropped", p.label));
                false
            }
        });
        done
    }

    fn forward_events(&mut self) {
        for event in self.world.take_events() {
            self.engine.handle_event(&mut self.world, event);
        }
    }

    pub fn execute(&mut self, line: &str) -> CommandResult {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((name, args)) = parts.split_first() else {
            return CommandResult::err("Empty command");
        };
        let name = name.trim_start_matches('/').to_lowercase();
        match name.as_str() {
            "join" => self.cmd_join(args),
            "quit" => self.cmd_quit(args),
            "give" => self.cmd_give(args),
            "openinv" => self.cmd_open(args, InventoryKind::Main),
            "openender" => self.cmd_open(args, InventoryKind::EnderChest),
            "openarmor" => self.cmd_open(args, InventoryKind::Armor),
            "set" => self.cmd_set(args),
            "close" => self.cmd_close(args),
            "searchinv" => self.cmd_searchinv(args),
            "searchench" => self.cmd_searchench(args),
            "grant" => self.cmd_grant(args),
            "list" => self.cmd_list(),
            "help" => {
                let mut lines = vec!["Available commands:".to_string()];
                lines.extend(COMMANDS.iter().map(|(usage, desc)| format!("  {usage} - {desc}")));
                CommandResult::lines(lines)
            }
            "stop" => CommandResult {
                success: true,
                messages: vec!["Stopping the server...".to_string()],
                should_stop: true,
            },
            other => CommandResult::err(format!(
                "Unknown command: {other}. Type help for a list of commands."
            )),
        }
    }

    /// Close every view, save offline copies and every online player.
    pub fn shutdown(&mut self) {
        self.forward_events();
        self.engine.shutdown(&mut self.world);
        self.views.clear();
        for player in self.world.players() {
            save_player(self.store.as_ref(), player.identity.clone(), |kind| {
                player.snapshot(kind)
            });
        }
    }

    /// Observer id for an operator name: their player id when online.
    fn operator_id(&self, operator: &str) -> ParticipantId {
        self.world
            .find_online(operator)
            .map(|p| p.id.clone())
            .unwrap_or_else(|| ParticipantId::new(operator.to_lowercase()))
    }

    fn find_view(&self, operator: &str, target: &str, kind: InventoryKind) -> Option<usize> {
        let observer = self.operator_id(operator);
        self.views.iter().position(|v| {
            v.observer() == &observer
                && v.kind() == kind
                && v.target().name.eq_ignore_ascii_case(target)
        })
    }

    // -----------------------------------------------------------------------
    // Players
    // -----------------------------------------------------------------------

    fn cmd_join(&mut self, args: &[&str]) -> CommandResult {
        let [name] = args else {
            return CommandResult::err("Usage: join <name>");
        };
        if self.world.find_online(name).is_some() {
            return CommandResult::err(format!("{name} is already online"));
        }
        let known = self.store.known_players().unwrap_or_else(|e| {
            warn!("Could not list known players: {e}");
            Vec::new()
        });
        let identity = known
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .unwrap_or_else(|| {
                ParticipantIdentity::new(format!("{:016x}", rand::random::<u64>()), *name)
            });
        if let Err(e) = self.store.remember(&identity) {
            warn!("Could not record {}: {e}", identity.name);
        }

        let mut inventories = Vec::new();
        for kind in InventoryKind::ALL {
            match self
                .store
                .load(&identity.id, kind)
                .and_then(|snapshot| snapshot.validate(kind))
            {
                Ok(snapshot) => inventories.push((kind, snapshot)),
                Err(StoreError::NoData) => {}
                Err(e) => warn!("Could not load {kind} of {}: {e}", identity.name),
            }
        }
        let message = format!("{} joined (id {})", identity.name, identity.id);
        self.world.join(identity, inventories);
        CommandResult::ok(message)
    }

    fn cmd_quit(&mut self, args: &[&str]) -> CommandResult {
        let [name] = args else {
            return CommandResult::err("Usage: quit <name>");
        };
        let Some(identity) = self.world.find_online(name).cloned() else {
            return CommandResult::err(format!("{name} is not online"));
        };
        // The engine hands off while the live inventory is still readable.
        self.forward_events();
        self.engine
            .handle_event(&mut self.world, HostEvent::ParticipantDisconnected(identity.id.clone()));
        let Some(player) = self.world.quit(&identity.id) else {
            return CommandResult::err(format!("{name} is not online"));
        };
        save_player(self.store.as_ref(), identity, |kind| player.snapshot(kind));
        CommandResult::ok(format!("{name} left"))
    }

    fn cmd_give(&mut self, args: &[&str]) -> CommandResult {
        let Some((player, item_args)) = args.split_first() else {
            return CommandResult::err("Usage: give <player> <item> [count] [enchant:level]");
        };
        let Some(id) = self.world.find_online(player).map(|p| p.id.clone()) else {
            return CommandResult::err(format!("{player} is not online"));
        };
        let item = match parse_item(item_args) {
            Ok(Some(item)) => item,
            Ok(None) => return CommandResult::err("Nothing to give"),
            Err(e) => return CommandResult::err(e),
        };
        let label = format!("{} x{}", item.id, item.count);
        match self.world.give(&id, item) {
            Ok(slot) => CommandResult::ok(format!("Gave {label} to {player} (slot {slot})")),
            Err(e) => CommandResult::err(format!("Could not give {label} to {player}: {e}")),
        }
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    fn cmd_open(&mut self, args: &[&str], kind: InventoryKind) -> CommandResult {
        let [operator, target] = args else {
            return CommandResult::err(format!("Usage: open <operator> <player> ({kind})"));
        };
        if let Err(e) = self.permissions.check(operator, node_for(kind)) {
            return e.into();
        }
        let observer = self.operator_id(operator);
        let mut rx = self
            .engine
            .request_open(&mut self.world, &observer, target, kind);
        match rx.try_recv() {
            Ok(Ok(handle)) => {
                let message = self.describe(&handle);
                self.views.push(handle);
                CommandResult::lines(message)
            }
            Ok(Err(e)) => e.into(),
            Err(TryRecvError::Closed) => CommandResult::err("Open request was dropped"),
            Err(TryRecvError::Empty) => {
                let label = format!("{kind} of {target} for {operator}");
                info!("Waiting for {label} to load");
                self.pending.push(PendingOpen { label, rx });
                CommandResult::ok(format!("Loading {kind} of {target}..."))
            }
        }
    }

    fn describe(&self, handle: &ViewHandle) -> Vec<String> {
        let source = handle.proxy().source_label();
        let Some((title, items)) = self.world.describe_view(handle.view()) else {
            return vec![format!("Opened {} ({source})", handle.kind())];
        };
        let mut lines = vec![format!("Opened '{title}' ({source}, {} items)", items.len())];
        for (view_slot, item) in items {
            lines.push(format!("  [{view_slot}] {} x{}", item.id, item.count));
        }
        lines
    }

    fn cmd_set(&mut self, args: &[&str]) -> CommandResult {
        let [operator, target, kind, slot, item_args @ ..] = args else {
            return CommandResult::err(
                "Usage: set <operator> <player> <kind> <slot> <item|air> [count]",
            );
        };
        let kind: InventoryKind = match kind.parse() {
            Ok(kind) => kind,
            Err(e) => return CommandResult::err(e),
        };
        let Ok(slot) = slot.parse::<usize>() else {
            return CommandResult::err(format!("Invalid slot: {slot}"));
        };
        let item = match parse_item(item_args) {
            Ok(item) => item,
            Err(e) => return CommandResult::err(e),
        };
        let Some(index) = self.find_view(operator, target, kind) else {
            return CommandResult::err(format!("{operator} has no open {kind} view of {target}"));
        };
        match self.views[index].set_slot(slot, item) {
            Ok(revision) => CommandResult::ok(format!(
                "Set {kind} slot {slot} of {target} (revision {revision})"
            )),
            Err(e) => e.into(),
        }
    }

    fn cmd_close(&mut self, args: &[&str]) -> CommandResult {
        let [operator, target, kind] = args else {
            return CommandResult::err("Usage: close <operator> <player> <kind>");
        };
        let kind: InventoryKind = match kind.parse() {
            Ok(kind) => kind,
            Err(e) => return CommandResult::err(e),
        };
        let Some(index) = self.find_view(operator, target, kind) else {
            return CommandResult::err(format!("{operator} has no open {kind} view of {target}"));
        };
        let handle = self.views.remove(index);
        self.engine.request_close(&mut self.world, &handle);
        CommandResult::ok(format!("Closed {kind} of {target}"))
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    fn cmd_searchinv(&mut self, args: &[&str]) -> CommandResult {
        let (args, offline) = offline_flag(args);
        let (operator, item, min) = match args {
            [operator, item] => (operator, item, None),
            [operator, item, min] => (operator, item, Some(min)),
            _ => return CommandResult::err("Usage: searchinv <operator> <item> [min_amount] [offline]"),
        };
        let min_amount = match min.map(|m| m.parse::<u8>()).transpose() {
            Ok(min) => min.unwrap_or(1),
            Err(_) => return CommandResult::err("Invalid amount"),
        };
        let matcher = ItemMatcher::item(*item).with_min_amount(min_amount);
        self.search(operator, &matcher, &[InventoryKind::Main, InventoryKind::Armor], offline)
    }

    fn cmd_searchench(&mut self, args: &[&str]) -> CommandResult {
        let (args, offline) = offline_flag(args);
        let (operator, enchant, level) = match args {
            [operator, enchant] => (operator, enchant, None),
            [operator, enchant, level] => (operator, enchant, Some(level)),
            _ => return CommandResult::err("Usage: searchench <operator> <enchant|any> [min_level] [offline]"),
        };
        let min_level = match level.map(|l| l.parse::<u8>()).transpose() {
            Ok(level) => level.unwrap_or(1),
            Err(_) => return CommandResult::err("Invalid level"),
        };
        let filter = if enchant.eq_ignore_ascii_case("any") {
            EnchantFilter::Any { min_level }
        } else {
            EnchantFilter::Specific {
                id: enchant.to_string(),
                min_level,
            }
        };
        self.search(operator, &ItemMatcher::enchanted(filter), &InventoryKind::ALL, offline)
    }

    fn search(
        &self,
        operator: &str,
        matcher: &ItemMatcher,
        kinds: &[InventoryKind],
        offline: bool,
    ) -> CommandResult {
        if let Err(e) = self.permissions.check(operator, NODE_SEARCH) {
            return e.into();
        }
        let hits = if offline {
            match self.engine.search_all(&self.world, matcher, kinds) {
                Ok(hits) => hits,
                Err(e) => return e.into(),
            }
        } else {
            self.engine.search(&self.world, matcher, kinds)
        };
        if hits.is_empty() {
            return CommandResult::ok("No matches");
        }
        let lines = hits
            .iter()
            .map(|hit| {
                format!(
                    "{} ({}): {} in slots {:?}",
                    hit.target.name, hit.kind, hit.total, hit.slots
                )
            })
            .collect();
        CommandResult::lines(lines)
    }

    // -----------------------------------------------------------------------
    // Misc
    // -----------------------------------------------------------------------

    fn cmd_grant(&mut self, args: &[&str]) -> CommandResult {
        let [operator, node] = args else {
            return CommandResult::err("Usage: grant <operator> <node>");
        };
        self.permissions.grant(operator, node);
        self.permissions.save();
        CommandResult::ok(format!("Granted {node} to {operator}"))
    }

    fn cmd_list(&self) -> CommandResult {
        let names: Vec<String> = self
            .world
            .online_participants()
            .into_iter()
            .map(|p| p.name)
            .collect();
        let count = names.len();
        let names = if names.is_empty() {
            String::new()
        } else {
            format!(": {}", names.join(", "))
        };
        CommandResult::lines(vec![
            format!(
                "There {verb} {count} player{s} online{names}",
                verb = if count == 1 { "is" } else { "are" },
                s = if count == 1 { "" } else { "s" },
            ),
            format!(
                "{} open view(s), {} waiting to load",
                self.engine.open_views(),
                self.pending.len()
            ),
        ])
    }
}

fn save_player(
    store: &dyn PlayerStore,
    identity: ParticipantIdentity,
    snapshot: impl Fn(InventoryKind) -> mc_rs_invsee::InventorySnapshot,
) {
    for kind in InventoryKind::ALL {
        if let Err(e) = store.save(&identity.id, kind, &snapshot(kind)) {
            warn!("Could not save {kind} of {}: {e}", identity.name);
        }
    }
}

/// Split a trailing `offline` flag off search arguments.
fn offline_flag<'a, 'b>(args: &'a [&'b str]) -> (&'a [&'b str], bool) {
    match args.split_last() {
        Some((last, rest)) if last.eq_ignore_ascii_case("offline") => (rest, true),
        _ => (args, false),
    }
}

fn namespaced(id: &str) -> String {
    if id.contains(':') {
        id.to_lowercase()
    } else {
        format!("minecraft:{}", id.to_lowercase())
    }
}

/// `<item|air> [count] [enchant:level]`.
fn parse_item(args: &[&str]) -> Result<Option<ItemStack>, String> {
    let Some((id, rest)) = args.split_first() else {
        return Err("Missing item".into());
    };
    if id.eq_ignore_ascii_case("air") {
        return Ok(None);
    }
    let count = match rest.first() {
        Some(count) => count
            .parse::<u8>()
            .map_err(|_| format!("Invalid count: {count}"))?,
        None => 1,
    };
    let mut item = ItemStack::new(namespaced(id), count);
    if let Some(enchant) = rest.get(1) {
        let (name, level) = enchant.split_once(':').unwrap_or((enchant, "1"));
        let level = level
            .parse::<u8>()
            .map_err(|_| format!("Invalid enchantment level: {level}"))?;
        item = item.with_enchantment(namespaced(name), level);
    }
    if let Some(defect) = item.defect() {
        return Err(defect);
    }
    Ok((item.count > 0).then_some(item))
}
