//! Component E: the environment facade. Wires the mapping engine, the two
//! storage managers, the subroutine registry, and the builtin tables behind
//! a single per-interpreter context; enforces the global naming rules that
//! keep procedures/functions/array-functions/builtins from colliding.

use std::cell::{Ref, RefCell};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use md5::{Digest, Md5};

use crate::ast::{CallArg, NodeRef};
use crate::error::{CompileError, MempeekError, MempeekResult};
use crate::location::SourceLocation;
use crate::mapping::MappingEngine;
use crate::storage::{ArrayHandle, ArrayManager, Var, VarHandle, VarManager};
use crate::subroutine::{SubroutineKind, SubroutineRegistry};

/// Process-wide cooperative cancellation flag. Set by the driver's
/// `SIGINT`/`SIGTERM`/`SIGABRT` handlers (async-signal-safe: a single atomic
/// store), polled by `Block` and `Sleep`. Not reset automatically; the
/// driver clears it between REPL statements.
static TERMINATE: AtomicBool = AtomicBool::new(false);

pub fn set_terminate() {
    TERMINATE.store(true, Ordering::SeqCst);
}

pub fn clear_terminate() {
    TERMINATE.store(false, Ordering::SeqCst);
}

pub fn terminate_requested() -> bool {
    TERMINATE.load(Ordering::SeqCst)
}

pub type ScalarBuiltinFactory = Rc<dyn Fn(&SourceLocation, Vec<CallArg>) -> MempeekResult<NodeRef>>;
pub type ArrayBuiltinFactory = Rc<dyn Fn(&SourceLocation, Vec<CallArg>) -> MempeekResult<NodeRef>>;

struct BuiltinEntry<F> {
    arity: usize,
    varargs: bool,
    factory: F,
}

/// Single per-interpreter context: global storage, registries, builtins,
/// import bookkeeping, and the cooperative bits of interpreter state
/// (default word size, vararg stack).
pub struct Environment {
    mapping: RefCell<MappingEngine>,
    global_vars: RefCell<VarManager>,
    global_arrays: RefCell<ArrayManager>,
    subroutines: RefCell<SubroutineRegistry>,
    scalar_builtins: RefCell<std::collections::BTreeMap<String, BuiltinEntry<ScalarBuiltinFactory>>>,
    array_builtins: RefCell<std::collections::BTreeMap<String, BuiltinEntry<ArrayBuiltinFactory>>>,
    include_paths: RefCell<Vec<PathBuf>>,
    imported_hashes: RefCell<HashSet<[u8; 16]>>,
    word_size_stack: RefCell<Vec<u32>>,
    vararg_stack: RefCell<Vec<Vec<VarargEntry>>>,
    print_sink: RefCell<Box<dyn FnMut(&str)>>,
}

#[derive(Clone)]
enum VarargEntry {
    Scalar(u64),
    Array(ArrayHandle),
}

impl Environment {
    pub fn new(include_paths: Vec<PathBuf>) -> Self {
        let env = Self {
            mapping: RefCell::new(MappingEngine::new()),
            global_vars: RefCell::new(VarManager::new()),
            global_arrays: RefCell::new(ArrayManager::new()),
            subroutines: RefCell::new(SubroutineRegistry::new()),
            scalar_builtins: RefCell::new(Default::default()),
            array_builtins: RefCell::new(Default::default()),
            include_paths: RefCell::new(include_paths),
            imported_hashes: RefCell::new(HashSet::new()),
            word_size_stack: RefCell::new(vec![64]),
            vararg_stack: RefCell::new(Vec::new()),
            print_sink: RefCell::new(Box::new(|s: &str| println!("{s}"))),
        };
        crate::builtins::register(&env);
        env
    }

    pub fn set_print_sink(&self, sink: Box<dyn FnMut(&str)>) {
        *self.print_sink.borrow_mut() = sink;
    }

    pub fn emit_print(&self, text: &str) {
        (self.print_sink.borrow_mut())(text);
    }

    pub fn mapping(&self) -> Ref<'_, MappingEngine> {
        self.mapping.borrow()
    }

    /// Overrides the device opened by bare `map(...)` statements (`--device`).
    pub fn set_default_device(&self, device: PathBuf) {
        self.mapping.borrow_mut().set_default_device(device);
    }

    pub fn map_memory(
        &self,
        location: &SourceLocation,
        phys_base: u64,
        at: u64,
        size: u64,
        device: Option<&Path>,
    ) -> MempeekResult<u64> {
        self.mapping
            .borrow_mut()
            .create(location, phys_base, at, size, device)
    }

    // ---- naming rules (component E, §4.E) -------------------------------

    fn in_subroutine(&self) -> Option<Rc<crate::subroutine::Subroutine>> {
        self.subroutines.borrow().pending_subroutine()
    }

    pub fn alloc_var(&self, location: &SourceLocation, name: &str) -> MempeekResult<VarHandle> {
        let conflict = || CompileError::NamingConflict {
            location: location.clone(),
            name: name.to_string(),
        };
        if let Some(sub) = self.in_subroutine() {
            if self
                .global_vars
                .borrow()
                .get(name)
                .map(|v| v.is_def())
                .unwrap_or(false)
            {
                return Err(conflict().into());
            }
            sub.vars.borrow_mut().alloc_local(name).ok_or_else(|| conflict().into())
        } else {
            self.global_vars
                .borrow_mut()
                .alloc_global(name)
                .ok_or_else(|| conflict().into())
        }
    }

    pub fn alloc_global_var(&self, location: &SourceLocation, name: &str) -> MempeekResult<VarHandle> {
        let conflict = || CompileError::NamingConflict {
            location: location.clone(),
            name: name.to_string(),
        };
        let handle = self
            .global_vars
            .borrow_mut()
            .alloc_global(name)
            .ok_or_else(|| conflict())?;
        if let Some(sub) = self.in_subroutine() {
            let _ = sub.vars.borrow_mut().alloc_delegate(name, handle.clone());
        }
        Ok(handle)
    }

    pub fn alloc_static_var(&self, location: &SourceLocation, name: &str) -> MempeekResult<VarHandle> {
        if let Some(sub) = self.in_subroutine() {
            sub.vars.borrow_mut().alloc_global(name).ok_or_else(|| {
                CompileError::NamingConflict {
                    location: location.clone(),
                    name: name.to_string(),
                }
                .into()
            })
        } else {
            self.alloc_global_var(location, name)
        }
    }

    pub fn alloc_def(&self, location: &SourceLocation, name: &str) -> MempeekResult<VarHandle> {
        self.global_vars
            .borrow_mut()
            .alloc_def(name)
            .ok_or_else(|| {
                CompileError::NamingConflict {
                    location: location.clone(),
                    name: name.to_string(),
                }
                .into()
            })
    }

    pub fn get_var(&self, name: &str) -> Option<VarHandle> {
        if let Some(sub) = self.in_subroutine() {
            if let Some(v) = sub.vars.borrow().get(name) {
                return Some(v);
            }
        }
        self.global_vars.borrow().get(name)
    }

    pub fn alloc_array(&self, location: &SourceLocation, name: &str) -> MempeekResult<ArrayHandle> {
        let conflict = || CompileError::NamingConflict {
            location: location.clone(),
            name: name.to_string(),
        };
        if let Some(sub) = self.in_subroutine() {
            sub.arrays.borrow_mut().alloc_local(name).ok_or_else(|| conflict().into())
        } else {
            self.global_arrays
                .borrow_mut()
                .alloc_global(name)
                .ok_or_else(|| conflict().into())
        }
    }

    pub fn alloc_global_array(&self, location: &SourceLocation, name: &str) -> MempeekResult<ArrayHandle> {
        let conflict = || CompileError::NamingConflict {
            location: location.clone(),
            name: name.to_string(),
        };
        let handle = self
            .global_arrays
            .borrow_mut()
            .alloc_global(name)
            .ok_or_else(|| conflict())?;
        if let Some(sub) = self.in_subroutine() {
            let _ = sub.arrays.borrow_mut().alloc_delegate(name, handle.clone());
        }
        Ok(handle)
    }

    pub fn alloc_static_array(&self, location: &SourceLocation, name: &str) -> MempeekResult<ArrayHandle> {
        if let Some(sub) = self.in_subroutine() {
            sub.arrays.borrow_mut().alloc_global(name).ok_or_else(|| {
                CompileError::NamingConflict {
                    location: location.clone(),
                    name: name.to_string(),
                }
                .into()
            })
        } else {
            self.alloc_global_array(location, name)
        }
    }

    /// Member suffixes (without the `base.` prefix) of a struct *def*, used by
    /// `def X from Y` to replicate `Y`'s members onto `X`.
    pub fn get_struct_members(&self, base: &str) -> Vec<String> {
        self.global_vars.borrow().get_struct_members(base)
    }

    pub fn alloc_ref_array(&self, location: &SourceLocation, name: &str) -> MempeekResult<Rc<crate::storage::RefArray>> {
        let conflict = || CompileError::NamingConflict {
            location: location.clone(),
            name: name.to_string(),
        };
        if let Some(sub) = self.in_subroutine() {
            sub.arrays.borrow_mut().alloc_ref(name).ok_or_else(|| conflict().into())
        } else {
            self.global_arrays
                .borrow_mut()
                .alloc_ref(name)
                .ok_or_else(|| conflict().into())
        }
    }

    pub fn get_array(&self, name: &str) -> Option<ArrayHandle> {
        if let Some(sub) = self.in_subroutine() {
            if let Some(a) = sub.arrays.borrow().get(name) {
                return Some(a);
            }
        }
        self.global_arrays.borrow().get(name)
    }

    pub fn get_autocompletion(&self, prefix: &str) -> Vec<String> {
        let mut out = self.global_vars.borrow().get_autocompletion(prefix);
        out.extend(self.global_arrays.borrow().get_autocompletion(prefix));
        out.extend(self.subroutines.borrow().get_autocompletion(prefix));
        out.extend(
            self.scalar_builtins
                .borrow()
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone()),
        );
        out.sort();
        out.dedup();
        out
    }

    // ---- subroutine context ----------------------------------------------

    pub fn enter_subroutine_context(
        &self,
        location: SourceLocation,
        name: String,
        kind: SubroutineKind,
    ) -> MempeekResult<()> {
        if self.scalar_builtins.borrow().contains_key(&name) || self.array_builtins.borrow().contains_key(&name) {
            return Err(CompileError::NamingConflict { location, name }.into());
        }
        self.subroutines.borrow_mut().begin(location, name, kind)
    }

    pub fn set_subroutine_param(&self, location: SourceLocation, name: &str, is_array: bool) -> MempeekResult<()> {
        self.subroutines.borrow_mut().set_param(location, name, is_array)
    }

    pub fn set_subroutine_varargs(&self) {
        self.subroutines.borrow_mut().set_varargs();
    }

    pub fn set_subroutine_body(&self, body: NodeRef) {
        self.subroutines.borrow_mut().set_body(body);
    }

    pub fn commit_subroutine_context(&self) {
        self.subroutines.borrow_mut().commit();
    }

    pub fn abort_subroutine_context(&self) {
        self.subroutines.borrow_mut().abort();
    }

    pub fn is_in_subroutine_context(&self) -> bool {
        self.subroutines.borrow().is_pending()
    }

    pub fn drop_subroutine(&self, name: &str) -> bool {
        self.subroutines.borrow_mut().drop_subroutine(name)
    }

    pub fn resolve_subroutine_call(
        &self,
        location: &SourceLocation,
        name: &str,
        args: Vec<CallArg>,
    ) -> MempeekResult<Option<NodeRef>> {
        let registry = self.subroutines.borrow();
        let Some((weak, kind)) = registry.resolve(location, name, args.len())? else {
            return Ok(None);
        };
        for (i, arg) in args.iter().enumerate() {
            if let Some(expect_array) = registry.param_is_array(&weak, i) {
                let got_array = matches!(arg, CallArg::Array(_));
                if expect_array != got_array {
                    return Err(CompileError::SyntaxError {
                        location: location.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(Some(crate::ast::Node::subroutine_call(
            location.clone(),
            weak,
            kind,
            args,
        )))
    }

    // ---- builtins ----------------------------------------------------------

    pub fn register_scalar_builtin(
        &self,
        name: &str,
        arity: usize,
        varargs: bool,
        factory: ScalarBuiltinFactory,
    ) {
        self.scalar_builtins.borrow_mut().insert(
            name.to_string(),
            BuiltinEntry {
                arity,
                varargs,
                factory,
            },
        );
    }

    pub fn register_array_builtin(
        &self,
        name: &str,
        arity: usize,
        varargs: bool,
        factory: ArrayBuiltinFactory,
    ) {
        self.array_builtins.borrow_mut().insert(
            name.to_string(),
            BuiltinEntry {
                arity,
                varargs,
                factory,
            },
        );
    }

    pub fn resolve_builtin_call(
        &self,
        location: &SourceLocation,
        name: &str,
        args: Vec<CallArg>,
    ) -> MempeekResult<Option<NodeRef>> {
        if let Some(entry) = self.scalar_builtins.borrow().get(name) {
            check_arity(location, entry.arity, entry.varargs, args.len())?;
            return Ok(Some((entry.factory)(location, args)?));
        }
        if let Some(entry) = self.array_builtins.borrow().get(name) {
            check_arity(location, entry.arity, entry.varargs, args.len())?;
            return Ok(Some((entry.factory)(location, args)?));
        }
        Ok(None)
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.scalar_builtins.borrow().contains_key(name) || self.array_builtins.borrow().contains_key(name)
    }

    // ---- word size ----------------------------------------------------------

    pub fn word_size(&self) -> u32 {
        *self.word_size_stack.borrow().last().unwrap_or(&64)
    }

    pub fn push_word_size(&self, bits: u32) {
        self.word_size_stack.borrow_mut().push(bits);
    }

    pub fn pop_word_size(&self) {
        if self.word_size_stack.borrow().len() > 1 {
            self.word_size_stack.borrow_mut().pop();
        }
    }

    // ---- varargs ----------------------------------------------------------

    pub fn push_vararg_frame(&self) {
        self.vararg_stack.borrow_mut().push(Vec::new());
    }

    pub fn pop_vararg_frame(&self) {
        self.vararg_stack.borrow_mut().pop();
    }

    pub fn append_vararg_scalar(&self, v: u64) {
        if let Some(frame) = self.vararg_stack.borrow_mut().last_mut() {
            frame.push(VarargEntry::Scalar(v));
        }
    }

    pub fn append_vararg_array(&self, a: ArrayHandle) {
        if let Some(frame) = self.vararg_stack.borrow_mut().last_mut() {
            frame.push(VarargEntry::Array(a));
        }
    }

    pub fn vararg_count(&self) -> u64 {
        self.vararg_stack
            .borrow()
            .last()
            .map(|f| f.len() as u64)
            .unwrap_or(0)
    }

    pub fn vararg_value(&self, index: u64) -> Option<u64> {
        match self.vararg_stack.borrow().last()?.get(index as usize)? {
            VarargEntry::Scalar(v) => Some(*v),
            VarargEntry::Array(_) => None,
        }
    }

    pub fn vararg_array(&self, index: u64) -> Option<ArrayHandle> {
        match self.vararg_stack.borrow().last()?.get(index as usize)? {
            VarargEntry::Array(a) => Some(a.clone()),
            VarargEntry::Scalar(_) => None,
        }
    }

    pub fn vararg_is_array(&self, index: u64) -> bool {
        matches!(
            self.vararg_stack.borrow().last().and_then(|f| f.get(index as usize)),
            Some(VarargEntry::Array(_))
        )
    }

    // ---- terminate flag -----------------------------------------------------

    pub fn is_terminated(&self) -> bool {
        terminate_requested()
    }

    // ---- import / parse entry point ----------------------------------------

    pub fn include_paths(&self) -> Vec<PathBuf> {
        self.include_paths.borrow().clone()
    }

    pub fn add_include_path(&self, path: PathBuf) {
        self.include_paths.borrow_mut().push(path);
    }

    /// Resolves a relative import against the registered include paths (or
    /// uses it directly if absolute), returning the resolved path and
    /// whether it was already imported under `run_once`.
    pub fn resolve_import(&self, file: &str, run_once: bool) -> MempeekResult<Option<PathBuf>> {
        let path = self.find_include(file)?;
        if !run_once {
            return Ok(Some(path));
        }
        let content = std::fs::read_to_string(&path).map_err(|_| CompileError::FileNotFound {
            location: SourceLocation::builtin(),
            file: file.to_string(),
        })?;
        let hash = md5_of(&content);
        if self.imported_hashes.borrow().contains(&hash) {
            return Ok(None);
        }
        self.imported_hashes.borrow_mut().insert(hash);
        Ok(Some(path))
    }

    /// Drops a just-recorded import hash if a parse that claimed it failed.
    pub fn rewind_import(&self, file: &str) {
        if let Ok(content) = std::fs::read_to_string(file) {
            self.imported_hashes.borrow_mut().remove(&md5_of(&content));
        }
    }

    fn find_include(&self, file: &str) -> MempeekResult<PathBuf> {
        let p = Path::new(file);
        if p.is_absolute() {
            if p.exists() {
                return Ok(p.to_path_buf());
            }
        } else {
            for dir in self.include_paths.borrow().iter() {
                let candidate = dir.join(p);
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
            if p.exists() {
                return Ok(p.to_path_buf());
            }
        }
        Err(CompileError::FileNotFound {
            location: SourceLocation::builtin(),
            file: file.to_string(),
        }
        .into())
    }
}

fn check_arity(location: &SourceLocation, arity: usize, varargs: bool, got: usize) -> MempeekResult<()> {
    let ok = if varargs { got >= arity } else { got == arity };
    if ok {
        Ok(())
    } else {
        Err(CompileError::SyntaxError {
            location: location.clone(),
        }
        .into())
    }
}

fn md5_of(content: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(content.as_bytes());
    hasher.finalize().into()
}

/// Switches into `dir` for the duration of parsing a file, restoring the
/// previous working directory on drop even if parsing panics or errors out.
pub struct WorkdirGuard {
    previous: PathBuf,
}

impl WorkdirGuard {
    pub fn enter(dir: &Path) -> std::io::Result<Self> {
        let previous = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        Ok(Self { previous })
    }
}

impl Drop for WorkdirGuard {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.previous);
    }
}

/// `0b…`/`0x…`/decimal integer literal parsing, trailing whitespace only.
pub fn parse_int(text: &str) -> Option<u64> {
    let t = text.trim_end();
    if let Some(rest) = t.strip_prefix("0b").or_else(|| t.strip_prefix("0B")) {
        if rest.is_empty() || !rest.bytes().all(|b| b == b'0' || b == b'1') {
            return None;
        }
        return u64::from_str_radix(rest, 2).ok();
    }
    if let Some(rest) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        return u64::from_str_radix(rest, 16).ok();
    }
    if t.bytes().all(|b| b.is_ascii_digit()) && !t.is_empty() {
        return t.parse::<u64>().ok();
    }
    None
}

/// Parses a floating point literal, returning its raw IEEE-754 bit pattern.
pub fn parse_float(text: &str) -> Option<u64> {
    let t = text.trim_end();
    t.parse::<f64>().ok().map(f64::to_bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_int_accepts_the_three_radices_and_rejects_garbage() {
        assert_eq!(parse_int("0b101"), Some(5));
        assert_eq!(parse_int("0x1F"), Some(31));
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("0x"), None);
        assert_eq!(parse_int("12a"), None);
    }

    #[test]
    fn word_size_stack_defaults_to_64_and_pops_down_to_one() {
        let env = Environment::new(Vec::new());
        assert_eq!(env.word_size(), 64);
        env.push_word_size(32);
        assert_eq!(env.word_size(), 32);
        env.pop_word_size();
        assert_eq!(env.word_size(), 64);
        env.pop_word_size();
        assert_eq!(env.word_size(), 64);
    }

    #[test]
    fn vararg_frame_is_scoped_to_the_current_call() {
        let env = Environment::new(Vec::new());
        env.push_vararg_frame();
        env.append_vararg_scalar(7);
        assert_eq!(env.vararg_count(), 1);
        assert_eq!(env.vararg_value(0), Some(7));
        env.pop_vararg_frame();
        assert_eq!(env.vararg_count(), 0);
    }

    #[test]
    fn global_var_conflicts_with_an_existing_def() {
        let env = Environment::new(Vec::new());
        let loc = SourceLocation::builtin();
        env.alloc_def(&loc, "R").unwrap();
        assert!(env.alloc_global_var(&loc, "R").is_err());
    }

    #[test]
    fn run_once_import_is_resolved_only_the_first_time() {
        let env = Environment::new(Vec::new());
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "x := 1;").unwrap();
        let path = tmp.path().to_str().unwrap().to_string();

        let first = env.resolve_import(&path, true).unwrap();
        assert!(first.is_some());
        let second = env.resolve_import(&path, true).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn rewinding_an_import_lets_it_be_resolved_again() {
        let env = Environment::new(Vec::new());
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "x := 1;").unwrap();
        let path = tmp.path().to_str().unwrap().to_string();

        env.resolve_import(&path, true).unwrap();
        env.rewind_import(&path);
        assert!(env.resolve_import(&path, true).unwrap().is_some());
    }

    #[test]
    fn include_path_is_searched_for_a_relative_import() {
        let env = Environment::new(Vec::new());
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.mp"), "x := 1;").unwrap();
        env.add_include_path(dir.path().to_path_buf());
        assert!(env.resolve_import("lib.mp", false).unwrap().is_some());
    }
}

