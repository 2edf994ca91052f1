//! The browsable symbol tree.
//!
//! Symbols form a lazily materialised hierarchy of sources, stations,
//! tables and values. Expansion is driven by the owning source: asking
//! a collapsed node to expand starts enumeration traffic, and the
//! children arrive later through the manager's event stream. A symbol
//! whose source disconnects is marked, not removed; reconnection
//! reconciles the children by name.

use super::record::ValueType;
use super::uri::SourceUri;
use super::{Manager, SourceEvent};
use tokio::sync::mpsc;
use tracing::trace;

/// Symbol node kinds, root to leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolType {
    Source,
    Station,
    Table,
    Scalar,
    Array,
    Subscript,
}

/// What a source reports for one enumerated child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolSeed {
    pub name: String,
    pub symbol_type: SymbolType,
    pub value_type: Option<ValueType>,
    pub read_only: bool,
    /// False when the child can never have children of its own.
    pub can_expand: bool,
}

impl SymbolSeed {
    #[must_use]
    pub fn branch(name: &str, symbol_type: SymbolType) -> Self {
        Self {
            name: name.to_string(),
            symbol_type,
            value_type: None,
            read_only: true,
            can_expand: true,
        }
    }

    #[must_use]
    pub fn leaf(name: &str, symbol_type: SymbolType, value_type: ValueType) -> Self {
        Self {
            name: name.to_string(),
            symbol_type,
            value_type: Some(value_type),
            read_only: true,
            can_expand: false,
        }
    }
}

/// One node in the materialised tree.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub symbol_type: SymbolType,
    pub value_type: Option<ValueType>,
    pub enabled: bool,
    pub read_only: bool,
    pub can_expand: bool,
    /// True once an expansion has populated (possibly zero) children.
    pub expanded: bool,
    pub children: Vec<Symbol>,
}

impl Symbol {
    fn from_seed(seed: &SymbolSeed) -> Self {
        Self {
            name: seed.name.clone(),
            symbol_type: seed.symbol_type,
            value_type: seed.value_type,
            enabled: true,
            read_only: seed.read_only,
            can_expand: seed.can_expand,
            expanded: false,
            children: Vec::new(),
        }
    }

    fn source(name: &str, connected: bool) -> Self {
        Self {
            name: name.to_string(),
            symbol_type: SymbolType::Source,
            value_type: None,
            enabled: connected,
            read_only: true,
            can_expand: true,
            expanded: false,
            children: Vec::new(),
        }
    }

    /// Finds a node by the dotted path below this one.
    #[must_use]
    pub fn find(&self, path: &[&str]) -> Option<&Symbol> {
        match path.split_first() {
            None => Some(self),
            Some((head, rest)) => self
                .children
                .iter()
                .find(|child| child.name == *head)
                .and_then(|child| child.find(rest)),
        }
    }

    fn find_mut(&mut self, path: &[&str]) -> Option<&mut Symbol> {
        match path.split_first() {
            None => Some(self),
            Some((head, rest)) => self
                .children
                .iter_mut()
                .find(|child| child.name == *head)
                .and_then(|child| child.find_mut(rest)),
        }
    }

    /// Reconciles children against a fresh enumeration by name:
    /// missing children go away, new ones appear, survivors keep
    /// their expansion state.
    fn reconcile(&mut self, seeds: &[SymbolSeed]) -> (Vec<String>, Vec<String>) {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        self.children.retain(|child| {
            let keep = seeds.iter().any(|seed| seed.name == child.name);
            if !keep {
                removed.push(child.name.clone());
            }
            keep
        });
        for seed in seeds {
            if !self.children.iter().any(|child| child.name == seed.name) {
                added.push(seed.name.clone());
                self.children.push(Symbol::from_seed(seed));
            }
        }
        self.expanded = true;
        (added, removed)
    }
}

/// Events the browser reports to its client channel. Paths are full
/// URIs (`source:station.table.column`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserEvent {
    SymbolAdded { path: String },
    SymbolRemoved { path: String },
    /// A source's connection state changed; its subtree stays put.
    ConnectChange { source: String, connected: bool },
    EnableChange { path: String, enabled: bool },
}

/// Sending half of a browser client channel.
pub type BrowserSender = mpsc::UnboundedSender<BrowserEvent>;
/// Receiving half of a browser client channel.
pub type BrowserReceiver = mpsc::UnboundedReceiver<BrowserEvent>;

/// Builds the channel a browser client listens on.
#[must_use]
pub fn browser_channel() -> (BrowserSender, BrowserReceiver) {
    mpsc::unbounded_channel()
}

/// Wraps the manager with a lazily expanded symbol tree.
pub struct SymbolBrowser {
    roots: Vec<Symbol>,
    clients: Vec<BrowserSender>,
    events: mpsc::UnboundedReceiver<SourceEvent>,
}

impl SymbolBrowser {
    /// Builds a browser over the manager's sources and registers for
    /// its enumeration events.
    #[must_use]
    pub fn new(manager: &mut Manager) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        manager.add_symbol_listener(tx);
        let roots = manager
            .source_names()
            .into_iter()
            .map(|name| {
                let connected = manager.is_connected(&name);
                Symbol::source(&name, connected)
            })
            .collect();
        Self {
            roots,
            clients: Vec::new(),
            events: rx,
        }
    }

    /// Registers a client channel for add/remove/connect events.
    pub fn add_client(&mut self, client: BrowserSender) {
        self.clients.push(client);
    }

    /// The current roots, one per source.
    #[must_use]
    pub fn roots(&self) -> &[Symbol] {
        &self.roots
    }

    /// Looks a symbol up by URI.
    #[must_use]
    pub fn find(&self, uri: &SourceUri) -> Option<&Symbol> {
        let root = self
            .roots
            .iter()
            .find(|symbol| symbol.name == uri.source_name())?;
        if uri.is_source_only() {
            return Some(root);
        }
        let remainder = uri.remainder();
        let path: Vec<&str> = remainder.split('.').collect();
        root.find(&path)
    }

    /// Requests expansion of a collapsed node. Expansion traffic runs
    /// on the owning source; children arrive later.
    pub fn start_expansion(&mut self, manager: &mut Manager, uri: &SourceUri) -> bool {
        let Some(symbol) = self.find(uri) else {
            return false;
        };
        if !symbol.can_expand || symbol.expanded {
            return false;
        }
        trace!(uri = uri.as_str(), "symbol expansion started");
        manager.start_symbol_expansion(uri)
    }

    /// Drains pending enumeration events into the tree, firing client
    /// events for every change.
    pub fn pump(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                SourceEvent::Symbols {
                    source,
                    parent,
                    symbols,
                } => self.apply_enumeration(&source, &parent, &symbols),
                SourceEvent::Connected { source } => self.apply_connect(&source, true),
                SourceEvent::Disconnected { source, reason } => {
                    let _ = reason;
                    self.apply_connect(&source, false);
                }
                _ => {}
            }
        }
    }

    fn apply_connect(&mut self, source: &str, connected: bool) {
        if let Some(root) = self.roots.iter_mut().find(|symbol| symbol.name == source) {
            root.enabled = connected;
            if connected {
                // Stale children will be reconciled by the next
                // enumeration; mark the tree re-expandable.
                root.expanded = false;
            }
            self.emit(BrowserEvent::ConnectChange {
                source: source.to_string(),
                connected,
            });
        }
    }

    fn apply_enumeration(&mut self, source: &str, parent: &str, seeds: &[SymbolSeed]) {
        let parent_uri = SourceUri::new(parent);
        let Some(root) = self
            .roots
            .iter_mut()
            .find(|symbol| symbol.name == parent_uri.source_name())
        else {
            return;
        };
        let node = if parent_uri.is_source_only() {
            Some(root)
        } else {
            let remainder = parent_uri.remainder().to_string();
            let path: Vec<&str> = remainder.split('.').collect();
            root.find_mut(&path)
        };
        let Some(node) = node else {
            return;
        };
        let (added, removed) = node.reconcile(seeds);
        let _ = source;
        for name in added {
            self.emit(BrowserEvent::SymbolAdded {
                path: join_path(parent, &name),
            });
        }
        for name in removed {
            self.emit(BrowserEvent::SymbolRemoved {
                path: join_path(parent, &name),
            });
        }
    }

    fn emit(&mut self, event: BrowserEvent) {
        self.clients.retain(|client| client.send(event.clone()).is_ok());
    }
}

fn join_path(parent: &str, child: &str) -> String {
    if parent.contains(':') {
        format!("{parent}.{child}")
    } else {
        format!("{parent}:{child}")
    }
}
