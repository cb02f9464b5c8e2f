//! Component C: subroutine registry.
//!
//! One registry holds all three subroutine flavours (procedures, functions,
//! array-functions) plus the slot for whichever definition is mid-construction.
//! Grounded in `subroutines.h`/`subroutines.cpp`: the two-phase
//! begin/set_param/set_body/commit-or-abort build, and `get_subroutine`'s
//! arity/kind checks against the call site's argument list.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::ast::NodeRef;
use crate::error::{CompileError, MempeekResult};
use crate::location::SourceLocation;
use crate::storage::{ArrayHandle, ArrayManager, RefArray, VarHandle, VarManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubroutineKind {
    Procedure,
    Function,
    ArrayFunction,
}

/// A formal parameter: either a local scalar slot or a ref-array binding.
pub enum Param {
    Scalar(VarHandle),
    Array(Rc<RefArray>),
}

impl Param {
    pub fn is_array(&self) -> bool {
        matches!(self, Param::Array(_))
    }
}

/// A committed (or mid-construction) subroutine. Call nodes hold a `Weak`
/// reference to this; the registry is the sole strong owner, so
/// `drop_subroutine` makes every outstanding call site observe a dropped body.
pub struct Subroutine {
    pub location: SourceLocation,
    pub kind: SubroutineKind,
    pub vars: RefCell<VarManager>,
    pub arrays: RefCell<ArrayManager>,
    pub params: RefCell<Vec<Param>>,
    pub has_varargs: Cell<bool>,
    pub retval: Option<VarHandle>,
    pub array_retval: Option<ArrayHandle>,
    pub body: RefCell<Option<NodeRef>>,
}

impl Subroutine {
    pub fn num_params(&self) -> usize {
        self.params.borrow().len()
    }
}

struct Pending {
    name: String,
    kind: SubroutineKind,
    subroutine: Rc<Subroutine>,
}

#[derive(Default)]
pub struct SubroutineRegistry {
    procedures: BTreeMap<String, Rc<Subroutine>>,
    functions: BTreeMap<String, Rc<Subroutine>>,
    array_functions: BTreeMap<String, Rc<Subroutine>>,
    pending: Option<Pending>,
}

impl SubroutineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_subroutine(&self, name: &str) -> bool {
        self.procedures.contains_key(name)
            || self.functions.contains_key(name)
            || self.array_functions.contains_key(name)
            || self.pending.as_ref().is_some_and(|p| p.name == name)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The subroutine mid-construction, if any — used by the environment to
    /// route name allocation into its local managers instead of the globals.
    pub fn pending_subroutine(&self) -> Option<Rc<Subroutine>> {
        self.pending.as_ref().map(|p| p.subroutine.clone())
    }

    /// Begins a two-phase build. Fails on a name clash with any existing
    /// subroutine in any of the three tables.
    pub fn begin(
        &mut self,
        location: SourceLocation,
        name: String,
        kind: SubroutineKind,
    ) -> MempeekResult<()> {
        if self.has_subroutine(&name) {
            return Err(CompileError::NamingConflict { location, name }.into());
        }

        let mut vars = VarManager::new();
        let retval = matches!(kind, SubroutineKind::Function)
            .then(|| vars.alloc_local("return"))
            .flatten();

        let mut arrays = ArrayManager::new();
        let array_retval = matches!(kind, SubroutineKind::ArrayFunction)
            .then(|| arrays.alloc_local("return"))
            .flatten();

        let subroutine = Rc::new(Subroutine {
            location,
            kind,
            vars: RefCell::new(vars),
            arrays: RefCell::new(arrays),
            params: RefCell::new(Vec::new()),
            has_varargs: Cell::new(false),
            retval,
            array_retval,
            body: RefCell::new(None),
        });

        self.pending = Some(Pending { name, kind, subroutine });
        Ok(())
    }

    pub fn pending_location(&self) -> Option<SourceLocation> {
        self.pending.as_ref().map(|p| p.subroutine.location.clone())
    }

    /// Allocates the next parameter in declaration order into the pending
    /// subroutine's local managers.
    pub fn set_param(
        &mut self,
        location: SourceLocation,
        name: &str,
        is_array: bool,
    ) -> MempeekResult<()> {
        let pending = self.pending.as_ref().expect("set_param without begin");
        let sub = &pending.subroutine;

        if is_array {
            let handle = sub
                .arrays
                .borrow_mut()
                .alloc_ref(name)
                .ok_or_else(|| CompileError::NamingConflict {
                    location: location.clone(),
                    name: name.to_string(),
                })?;
            sub.params.borrow_mut().push(Param::Array(handle));
        } else {
            let handle = sub
                .vars
                .borrow_mut()
                .alloc_local(name)
                .ok_or_else(|| CompileError::NamingConflict {
                    location,
                    name: name.to_string(),
                })?;
            sub.params.borrow_mut().push(Param::Scalar(handle));
        }
        Ok(())
    }

    pub fn set_varargs(&mut self) {
        let pending = self.pending.as_ref().expect("set_varargs without begin");
        pending.subroutine.has_varargs.set(true);
    }

    pub fn set_body(&mut self, body: NodeRef) {
        let pending = self.pending.as_ref().expect("set_body without begin");
        *pending.subroutine.body.borrow_mut() = Some(body);
    }

    pub fn commit(&mut self) {
        let pending = self.pending.take().expect("commit without begin");
        self.table_mut(pending.kind)
            .insert(pending.name, pending.subroutine);
    }

    pub fn abort(&mut self) {
        self.pending = None;
    }

    fn table_mut(&mut self, kind: SubroutineKind) -> &mut BTreeMap<String, Rc<Subroutine>> {
        match kind {
            SubroutineKind::Procedure => &mut self.procedures,
            SubroutineKind::Function => &mut self.functions,
            SubroutineKind::ArrayFunction => &mut self.array_functions,
        }
    }

    pub fn get_autocompletion(&self, prefix: &str) -> Vec<String> {
        [&self.procedures, &self.functions, &self.array_functions]
            .into_iter()
            .flat_map(|table| {
                table
                    .range(prefix.to_string()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, _)| k.clone())
            })
            .collect()
    }

    /// Resolves `name` to its subroutine, checked against the supplied arity.
    /// Matches the pending definition first, to support direct recursion
    /// while the body is still being parsed.
    pub fn resolve(
        &self,
        location: &SourceLocation,
        name: &str,
        num_args: usize,
    ) -> MempeekResult<Option<(Weak<Subroutine>, SubroutineKind)>> {
        let found = if let Some(p) = &self.pending {
            if p.name == name {
                Some((&p.subroutine, p.kind))
            } else {
                None
            }
        } else {
            None
        }
        .or_else(|| {
            [
                (SubroutineKind::Procedure, &self.procedures),
                (SubroutineKind::Function, &self.functions),
                (SubroutineKind::ArrayFunction, &self.array_functions),
            ]
            .into_iter()
            .find_map(|(kind, table)| table.get(name).map(|s| (s, kind)))
        });

        let Some((sub, kind)) = found else {
            return Ok(None);
        };

        let num_params = sub.num_params();
        let arity_ok = if sub.has_varargs.get() {
            num_params <= num_args
        } else {
            num_params == num_args
        };
        if !arity_ok {
            return Err(CompileError::SyntaxError {
                location: location.clone(),
            }
            .into());
        }

        Ok(Some((Rc::downgrade(sub), kind)))
    }

    /// Used by `get_subroutine` call sites to check a specific parameter's
    /// array-ness before accepting an argument node.
    pub fn param_is_array(&self, weak: &Weak<Subroutine>, index: usize) -> Option<bool> {
        let sub = weak.upgrade()?;
        sub.params.borrow().get(index).map(Param::is_array)
    }

    pub fn drop_subroutine(&mut self, name: &str) -> bool {
        self.procedures.remove(name).is_some()
            || self.functions.remove(name).is_some()
            || self.array_functions.remove(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> SourceLocation {
        SourceLocation::builtin()
    }

    #[test]
    fn abort_leaves_no_trace_of_the_pending_definition() {
        let mut reg = SubroutineRegistry::new();
        reg.begin(loc(), "f".to_string(), SubroutineKind::Procedure).unwrap();
        reg.set_param(loc(), "x", false).unwrap();
        reg.abort();
        assert!(!reg.has_subroutine("f"));
        assert!(reg.resolve(&loc(), "f", 1).unwrap().is_none());
    }

    #[test]
    fn commit_publishes_under_the_pending_name() {
        let mut reg = SubroutineRegistry::new();
        reg.begin(loc(), "f".to_string(), SubroutineKind::Procedure).unwrap();
        reg.set_param(loc(), "x", false).unwrap();
        reg.set_body(crate::ast::Node::def(loc()));
        reg.commit();
        assert!(reg.has_subroutine("f"));
        assert!(reg.resolve(&loc(), "f", 1).unwrap().is_some());
    }

    #[test]
    fn arity_mismatch_is_a_syntax_error_unless_varargs() {
        let mut reg = SubroutineRegistry::new();
        reg.begin(loc(), "f".to_string(), SubroutineKind::Procedure).unwrap();
        reg.set_param(loc(), "x", false).unwrap();
        reg.set_varargs();
        reg.set_body(crate::ast::Node::def(loc()));
        reg.commit();
        assert!(reg.resolve(&loc(), "f", 1).unwrap().is_some());
        assert!(reg.resolve(&loc(), "f", 3).unwrap().is_some());
        assert!(reg.resolve(&loc(), "f", 0).is_err());
    }

    #[test]
    fn beginning_a_second_definition_with_the_same_name_conflicts() {
        let mut reg = SubroutineRegistry::new();
        reg.begin(loc(), "f".to_string(), SubroutineKind::Procedure).unwrap();
        reg.set_body(crate::ast::Node::def(loc()));
        reg.commit();
        assert!(reg.begin(loc(), "f".to_string(), SubroutineKind::Function).is_err());
    }

    #[test]
    fn dropped_subroutine_is_gone_from_every_table() {
        let mut reg = SubroutineRegistry::new();
        reg.begin(loc(), "f".to_string(), SubroutineKind::Procedure).unwrap();
        reg.set_body(crate::ast::Node::def(loc()));
        reg.commit();
        assert!(reg.drop_subroutine("f"));
        assert!(!reg.has_subroutine("f"));
        assert!(!reg.drop_subroutine("f"));
    }
}
