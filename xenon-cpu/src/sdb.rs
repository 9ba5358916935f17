//! The symbol database: every guest function the runtime knows about.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SymbolState {
    Unscanned,
    Scanning,
    Declared,
    Defined,
    Failed,
}

impl SymbolState {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    Guest,
    /// A thunk that forwards to a host export.
    Import { module: String, ordinal: u32 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SymbolBehavior {
    Default,
    /// A register restore helper that returns on behalf of its caller (`__restgprlr_*`).
    EpilogReturn,
    /// A short stub that immediately jumps elsewhere.
    Thunk,
}

#[derive(Clone, Debug)]
struct SymbolInfo {
    end_address: u32,
    state: SymbolState,
    name: Option<String>,
    behavior: SymbolBehavior,
}

#[derive(Debug)]
pub struct FunctionSymbol {
    pub address: u32,
    pub kind: SymbolKind,
    info: RwLock<SymbolInfo>,
}

impl FunctionSymbol {
    fn new(address: u32, kind: SymbolKind) -> Self {
        let info = SymbolInfo {
            end_address: address,
            state: SymbolState::Unscanned,
            name: None,
            behavior: SymbolBehavior::Default,
        };
        Self { address, kind, info: RwLock::new(info) }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SymbolInfo> {
        self.info.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SymbolInfo> {
        self.info.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SymbolState {
        self.read().state
    }

    /// Address of the last instruction of the function.
    pub fn end_address(&self) -> u32 {
        self.read().end_address
    }

    pub fn contains(&self, address: u32) -> bool {
        let info = self.read();
        info.state >= SymbolState::Declared && (self.address..=info.end_address).contains(&address)
    }

    pub fn name(&self) -> String {
        match &self.read().name {
            Some(name) => name.clone(),
            None => format!("sub_{:08X}", self.address),
        }
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.write().name = Some(name.into());
    }

    pub fn behavior(&self) -> SymbolBehavior {
        self.read().behavior
    }

    pub fn set_behavior(&self, behavior: SymbolBehavior) {
        self.write().behavior = behavior;
    }

    pub fn is_import(&self) -> bool {
        matches!(self.kind, SymbolKind::Import { .. })
    }

    /// Claims the symbol for scanning. Returns false if another caller already scanned (or is
    /// scanning) it.
    pub fn begin_scan(&self) -> bool {
        let mut info = self.write();
        if info.state != SymbolState::Unscanned {
            return false;
        }
        info.state = SymbolState::Scanning;
        true
    }

    /// Records the extent of the function.
    pub fn declare(&self, end_address: u32) {
        let mut info = self.write();
        info.end_address = end_address.max(self.address);
        advance(&mut info.state, SymbolState::Declared);
    }

    /// Marks the function as translated.
    pub fn define(&self) {
        advance(&mut self.write().state, SymbolState::Defined);
    }

    pub fn fail(&self) {
        advance(&mut self.write().state, SymbolState::Failed);
    }
}

/// States only ever move forward.
fn advance(state: &mut SymbolState, next: SymbolState) {
    if next > *state {
        *state = next;
    }
}

#[derive(Default)]
pub struct SymbolDatabase {
    symbols: RwLock<BTreeMap<u32, Arc<FunctionSymbol>>>,
}

impl SymbolDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, address: u32) -> Option<Arc<FunctionSymbol>> {
        self.symbols.read().unwrap_or_else(|e| e.into_inner()).get(&address).cloned()
    }

    /// Returns the symbol at `address`, declaring a new unscanned one if none exists.
    pub fn get_or_insert(&self, address: u32) -> Arc<FunctionSymbol> {
        if let Some(symbol) = self.lookup(address) {
            return symbol;
        }
        let mut symbols = self.symbols.write().unwrap_or_else(|e| e.into_inner());
        symbols
            .entry(address)
            .or_insert_with(|| {
                tracing::trace!("new function: {address:#x}");
                Arc::new(FunctionSymbol::new(address, SymbolKind::Guest))
            })
            .clone()
    }

    /// Registers an import thunk at `address`. The thunk spans a single instruction.
    pub fn declare_import(&self, address: u32, module: &str, ordinal: u32) -> Arc<FunctionSymbol> {
        let mut symbols = self.symbols.write().unwrap_or_else(|e| e.into_inner());
        symbols
            .entry(address)
            .or_insert_with(|| {
                let kind = SymbolKind::Import { module: module.to_owned(), ordinal };
                let symbol = FunctionSymbol::new(address, kind);
                symbol.set_name(format!("{module}_{ordinal}"));
                symbol.set_behavior(SymbolBehavior::Thunk);
                symbol.declare(address);
                Arc::new(symbol)
            })
            .clone()
    }

    /// Finds the declared function whose range covers `address`.
    pub fn find_containing(&self, address: u32) -> Option<Arc<FunctionSymbol>> {
        let symbols = self.symbols.read().unwrap_or_else(|e| e.into_inner());
        symbols
            .range(..=address)
            .rev()
            .map(|(_, symbol)| symbol)
            .find(|x| x.contains(address))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.symbols.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Arc<FunctionSymbol>> {
        self.symbols.read().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
    }
}
