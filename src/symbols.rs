//! Symbol table: lexical scopes, slot allocation and free-variable resolution
//!
//! Scopes form a chain `native -> global -> local -> local ...`, one local
//! scope per function or generator literal being compiled. The chain is kept
//! as a stack; the parent of scope `n` is scope `n - 1`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of addressable global slots (16-bit operand space)
pub const MAX_VARIABLES: usize = 1 << 16;

/// Number of addressable local and captured slots per function (8-bit operand space)
pub const MAX_LOCALS: usize = 1 << 8;

static IOTA: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Native,
    Global,
    Local,
    Free,
    /// The function currently being compiled, referenced by its own name
    SelfRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub label: String,
    pub index: usize,
    pub depth: usize,
    pub kind: SymbolKind,
}

#[derive(Debug, Clone)]
struct Scope {
    kind: SymbolKind,
    symbols: HashMap<String, Symbol>,
    /// Outer symbols captured by this scope, in capture order
    free_symbols: Vec<Symbol>,
    next_index: usize,
}

impl Scope {
    fn new(kind: SymbolKind) -> Self {
        Self {
            kind,
            symbols: HashMap::new(),
            free_symbols: Vec::new(),
            next_index: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
}

impl SymbolTable {
    /// Build the root chain: a NATIVE scope seeded with `builtins` in order,
    /// under a fresh GLOBAL scope. Indices match the order of `builtins`.
    pub fn create_global_symbol_table<S: AsRef<str>>(builtins: &[S]) -> Self {
        let mut natives = Scope::new(SymbolKind::Native);
        for (index, name) in builtins.iter().enumerate() {
            let label = name.as_ref().to_string();
            natives.symbols.insert(
                label.clone(),
                Symbol { label, index, depth: 0, kind: SymbolKind::Native },
            );
        }
        natives.next_index = builtins.len();

        Self {
            scopes: vec![natives, Scope::new(SymbolKind::Global)],
        }
    }

    /// Depth of the innermost scope; 1 is the global scope
    pub fn depth(&self) -> usize {
        self.scopes.len() - 1
    }

    pub fn is_global(&self) -> bool {
        self.depth() == 1
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::new(SymbolKind::Local));
    }

    /// Pop the innermost local scope, returning its captured free symbols
    /// and the number of local slots it allocated.
    ///
    /// # Panics
    /// Popping the global or native scope is a compiler bug.
    pub fn pop_scope(&mut self) -> (Vec<Symbol>, usize) {
        assert!(self.depth() > 1, "attempted to pop the global symbol scope");
        let scope = self.scopes.pop().expect("scope stack is never empty");
        (scope.free_symbols, scope.next_index)
    }

    /// Discard every local scope, returning to the global one
    pub fn reset_to_global(&mut self) {
        self.scopes.truncate(2);
    }

    /// Allocate the next slot in the innermost scope. Redeclaring a label
    /// shadows the earlier binding.
    pub fn add(&mut self, label: &str) -> usize {
        let depth = self.depth();
        let scope = self.innermost_mut();
        let index = scope.next_index;
        scope.next_index += 1;
        let symbol = Symbol {
            label: label.to_string(),
            index,
            depth,
            kind: scope.kind,
        };
        scope.symbols.insert(label.to_string(), symbol);
        index
    }

    /// Allocate a slot under a fresh label no source identifier can spell
    pub fn add_iota(&mut self) -> Symbol {
        let label = format!("@iota{}", IOTA.fetch_add(1, Ordering::Relaxed));
        self.add(&label);
        self.innermost().symbols[&label].clone()
    }

    /// Bind the function's own name so it can recurse without a capture
    pub fn set_self(&mut self, label: &str) {
        let depth = self.depth();
        self.innermost_mut().symbols.insert(
            label.to_string(),
            Symbol {
                label: label.to_string(),
                index: 0,
                depth,
                kind: SymbolKind::SelfRef,
            },
        );
    }

    /// Resolve `label` from the innermost scope outwards. Locals of enclosing
    /// functions are converted into free variables of every scope in between.
    pub fn get(&mut self, label: &str) -> Option<Symbol> {
        self.resolve(self.depth(), label)
    }

    /// Slot count of the innermost scope, i.e. the locals a frame must reserve
    pub fn num_definitions(&self) -> usize {
        self.innermost().next_index
    }

    /// Look up a global binding without touching free-variable state
    pub fn global(&self, label: &str) -> Option<&Symbol> {
        self.scopes[1].symbols.get(label)
    }

    fn resolve(&mut self, depth: usize, label: &str) -> Option<Symbol> {
        if let Some(symbol) = self.scopes[depth].symbols.get(label) {
            return Some(symbol.clone());
        }
        if depth == 0 {
            return None;
        }

        let outer = self.resolve(depth - 1, label)?;
        match outer.kind {
            SymbolKind::Native | SymbolKind::Global => Some(outer),
            _ => Some(self.define_free(depth, outer)),
        }
    }

    fn define_free(&mut self, depth: usize, original: Symbol) -> Symbol {
        let scope = &mut self.scopes[depth];
        scope.free_symbols.push(original.clone());
        let symbol = Symbol {
            label: original.label.clone(),
            index: scope.free_symbols.len() - 1,
            depth,
            kind: SymbolKind::Free,
        };
        scope.symbols.insert(original.label, symbol.clone());
        symbol
    }

    fn innermost(&self) -> &Scope {
        self.scopes.last().expect("scope stack is never empty")
    }

    fn innermost_mut(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("scope stack is never empty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn table() -> SymbolTable {
        SymbolTable::create_global_symbol_table(&["print", "len"])
    }

    #[test]
    fn test_globals_and_natives() {
        let mut table = table();
        assert_eq!(table.add("a"), 0);
        assert_eq!(table.add("b"), 1);

        let a = table.get("a").unwrap();
        assert_eq!((a.kind, a.index), (SymbolKind::Global, 0));
        let len = table.get("len").unwrap();
        assert_eq!((len.kind, len.index), (SymbolKind::Native, 1));
        assert!(table.get("missing").is_none());
    }

    #[test]
    fn test_locals_restart_per_function() {
        let mut table = table();
        table.add("g");
        table.push_scope();
        assert_eq!(table.add("x"), 0);
        assert_eq!(table.get("x").unwrap().kind, SymbolKind::Local);
        assert_eq!(table.get("g").unwrap().kind, SymbolKind::Global);
        assert_eq!(table.num_definitions(), 1);
    }

    #[test]
    fn test_shadowing_allocates_new_slot() {
        let mut table = table();
        table.push_scope();
        table.add("x");
        table.add("x");
        assert_eq!(table.get("x").unwrap().index, 1);
        assert_eq!(table.num_definitions(), 2);
    }

    #[test]
    fn test_free_variables_through_two_levels() {
        let mut table = table();
        table.push_scope();
        table.add("z");
        table.push_scope();
        table.add("y");
        table.push_scope();
        table.add("x");

        let z = table.get("z").unwrap();
        assert_eq!((z.kind, z.index), (SymbolKind::Free, 0));
        let y = table.get("y").unwrap();
        assert_eq!((y.kind, y.index), (SymbolKind::Free, 1));

        let (free, locals) = table.pop_scope();
        assert_eq!(locals, 1);
        let labels: Vec<_> = free.iter().map(|s| (s.label.as_str(), s.kind)).collect();
        // z was already free in the middle scope, y was a local there
        assert_eq!(labels, vec![("z", SymbolKind::Free), ("y", SymbolKind::Local)]);

        let (free, _) = table.pop_scope();
        assert_eq!(free.len(), 1);
        assert_eq!((free[0].label.as_str(), free[0].kind), ("z", SymbolKind::Local));
    }

    #[test]
    fn test_self_symbol_becomes_free_in_nested_scope() {
        let mut table = table();
        table.push_scope();
        table.set_self("f");
        assert_eq!(table.get("f").unwrap().kind, SymbolKind::SelfRef);

        table.push_scope();
        let f = table.get("f").unwrap();
        assert_eq!(f.kind, SymbolKind::Free);
        let (free, _) = table.pop_scope();
        assert_eq!(free[0].kind, SymbolKind::SelfRef);
    }

    #[test]
    fn test_iota_labels_are_unique() {
        let mut table = table();
        let a = table.add_iota();
        let b = table.add_iota();
        assert_ne!(a.label, b.label);
        assert_ne!(a.index, b.index);
        assert!(a.label.starts_with('@'));
    }

    #[test]
    #[should_panic(expected = "global symbol scope")]
    fn test_popping_global_scope_panics() {
        let mut table = table();
        table.pop_scope();
    }
}
