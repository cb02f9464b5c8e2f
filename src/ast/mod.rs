//! Component D: the execution tree.
//!
//! Nodes are a flat enum rather than a trait-object hierarchy (the design
//! notes prefer this for pattern-matched dispatch over virtual calls): one
//! `Node` struct carries the shared fields (`location`, `is_constant`) and a
//! `NodeKind` enum holds each variant's payload. Constant-folding happens at
//! the smart constructors below rather than through a generic `add_child`
//! hook, since Rust's enum constructors are already the single choke point
//! every node passes through.

mod strenc;

pub use strenc::decode_nul_terminated as strenc_decode;
pub use strenc::encode as strenc_encode;
pub use strenc::length as strenc_length;

use std::cell::Cell;
use std::rc::{Rc, Weak};

use crate::environment::Environment;
use crate::error::{CompileError, ControlSignal, MempeekError, MempeekResult, RuntimeError};
use crate::location::SourceLocation;
use crate::storage::{ArrayHandle, ArrayManager, ArrayT, RefArray, Var, VarHandle};
use crate::subroutine::{Param, Subroutine, SubroutineKind};

pub type NodeRef = Rc<Node>;

pub struct Node {
    pub location: SourceLocation,
    pub is_constant: bool,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOpKind {
    Neg,
    BitNot,
    LogicalNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOpKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    SDiv,
    SMod,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    SLt,
    SGt,
    SLe,
    SGe,
    And,
    Xor,
    Or,
    LAnd,
    LXor,
    LOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgQuery {
    Value,
    ArraySize,
    Type,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberFormat {
    Hex,
    Dec,
    SignedDec,
    Bin,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintWidth {
    Eight,
    Sixteen,
    ThirtyTwo,
    SixtyFour,
    WordSize,
}

impl PrintWidth {
    fn bits(self, default_word_size: u32) -> u32 {
        match self {
            PrintWidth::Eight => 8,
            PrintWidth::Sixteen => 16,
            PrintWidth::ThirtyTwo => 32,
            PrintWidth::SixtyFour => 64,
            PrintWidth::WordSize => default_word_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayMode {
    List,
    StringDecode,
}

#[derive(Debug, Clone, Copy)]
pub struct PrintModifier {
    pub format: NumberFormat,
    pub width: PrintWidth,
    pub array_mode: ArrayMode,
}

impl Default for PrintModifier {
    fn default() -> Self {
        Self {
            format: NumberFormat::Dec,
            width: PrintWidth::WordSize,
            array_mode: ArrayMode::List,
        }
    }
}

pub enum PrintItem {
    Literal(String),
    Expr { node: NodeRef, modifier: PrintModifier },
}

pub enum SleepMode {
    Now,
    Relative(NodeRef),
    Absolute(NodeRef),
}

pub enum StaticKind {
    UninitArray,
    CopyFrom { src: ArrayHandle },
    SizeOnly { size: NodeRef },
    Scalar { expr: NodeRef },
}

/// One argument at a subroutine call site: either an expression (scalar) or
/// a node known at construction to yield an array.
pub enum CallArg {
    Scalar(NodeRef),
    Array(NodeRef),
}

pub enum NodeKind {
    Constant(u64),
    Var(VarHandle),
    Arg {
        query: ArgQuery,
        index: Option<NodeRef>,
        arr_index: Option<NodeRef>,
    },
    Range {
        var: VarHandle,
        index: Option<NodeRef>,
    },
    ArrayAccess {
        array: ArrayHandle,
        index: Option<NodeRef>,
    },
    AssignVar {
        var: VarHandle,
        expr: NodeRef,
    },
    AssignIndex {
        array: ArrayHandle,
        index: NodeRef,
        expr: NodeRef,
    },
    AssignList {
        array: ArrayHandle,
        elems: Vec<NodeRef>,
    },
    AssignCopy {
        dest: ArrayHandle,
        src: ArrayHandle,
    },
    AssignArg {
        array: ArrayHandle,
        arg_index: NodeRef,
    },
    StringLiteral {
        array: ArrayHandle,
        literal: String,
    },
    Static {
        array: Option<ArrayHandle>,
        var: Option<VarHandle>,
        kind: StaticKind,
        initialized: Cell<bool>,
    },
    Def,
    Dim {
        array: ArrayHandle,
        size: NodeRef,
    },
    Map,
    Import {
        child: Option<NodeRef>,
    },
    UnaryOp {
        op: UnaryOpKind,
        child: NodeRef,
    },
    BinaryOp {
        op: BinaryOpKind,
        lhs: NodeRef,
        rhs: NodeRef,
    },
    Restriction {
        child: NodeRef,
        width: u32,
    },
    Peek {
        addr: NodeRef,
        width: u32,
    },
    Poke {
        addr: NodeRef,
        value: NodeRef,
        mask: Option<NodeRef>,
        width: u32,
    },
    Print {
        items: Vec<PrintItem>,
    },
    Sleep(SleepMode),
    Break,
    Exit,
    Quit,
    If {
        cond: NodeRef,
        then_branch: NodeRef,
        else_branch: Option<NodeRef>,
    },
    While {
        cond: NodeRef,
        body: NodeRef,
    },
    For {
        var: VarHandle,
        init: NodeRef,
        to: NodeRef,
        step: Option<NodeRef>,
        body: NodeRef,
    },
    Block(Vec<NodeRef>),
    ArrayBlock {
        body: Vec<NodeRef>,
        result: ArrayHandle,
    },
    SubroutineCall {
        subroutine: Weak<Subroutine>,
        kind: SubroutineKind,
        args: Vec<CallArg>,
    },
    /// A builtin invocation: a fixed-arity closure captured at registration.
    ScalarBuiltin {
        eval: Rc<dyn Fn(&[BuiltinArg]) -> MempeekResult<u64>>,
        args: Vec<CallArg>,
    },
    ArrayBuiltin {
        eval: Rc<dyn Fn(&[BuiltinArg]) -> MempeekResult<ArrayHandle>>,
        args: Vec<CallArg>,
        result: ArrayHandle,
    },
}

/// An already-evaluated builtin argument, passed to the builtin's closure.
pub enum BuiltinArg {
    Scalar(u64),
    Array(ArrayHandle),
}

impl BuiltinArg {
    pub fn as_scalar(&self) -> Option<u64> {
        match self {
            BuiltinArg::Scalar(v) => Some(*v),
            BuiltinArg::Array(_) => None,
        }
    }
    pub fn as_array(&self) -> Option<&ArrayHandle> {
        match self {
            BuiltinArg::Array(a) => Some(a),
            BuiltinArg::Scalar(_) => None,
        }
    }
}

fn truthy(v: u64) -> bool {
    v != 0
}

fn all_ones_if(cond: bool) -> u64 {
    if cond {
        u64::MAX
    } else {
        0
    }
}

impl Node {
    fn new(location: SourceLocation, is_constant: bool, kind: NodeKind) -> NodeRef {
        Rc::new(Node {
            location,
            is_constant,
            kind,
        })
    }

    pub fn constant(location: SourceLocation, value: u64) -> NodeRef {
        Self::new(location, true, NodeKind::Constant(value))
    }

    pub fn parse_int_literal(location: SourceLocation, text: &str) -> Option<NodeRef> {
        crate::environment::parse_int(text).map(|v| Self::constant(location, v))
    }

    pub fn parse_float_literal(location: SourceLocation, text: &str) -> Option<NodeRef> {
        crate::environment::parse_float(text).map(|v| Self::constant(location, v))
    }

    pub fn var(location: SourceLocation, var: VarHandle) -> NodeRef {
        let is_const = var.is_def();
        Self::new(location, is_const, NodeKind::Var(var))
    }

    pub fn arg(
        location: SourceLocation,
        query: ArgQuery,
        index: Option<NodeRef>,
        arr_index: Option<NodeRef>,
    ) -> NodeRef {
        Self::new(
            location,
            false,
            NodeKind::Arg {
                query,
                index,
                arr_index,
            },
        )
    }

    pub fn range(location: SourceLocation, var: VarHandle, index: Option<NodeRef>) -> NodeRef {
        Self::new(location, false, NodeKind::Range { var, index })
    }

    pub fn array_access(
        location: SourceLocation,
        array: ArrayHandle,
        index: Option<NodeRef>,
    ) -> NodeRef {
        Self::new(location, false, NodeKind::ArrayAccess { array, index })
    }

    pub fn assign_var(location: SourceLocation, var: VarHandle, expr: NodeRef) -> NodeRef {
        Self::new(location, false, NodeKind::AssignVar { var, expr })
    }

    pub fn assign_index(
        location: SourceLocation,
        array: ArrayHandle,
        index: NodeRef,
        expr: NodeRef,
    ) -> NodeRef {
        Self::new(
            location,
            false,
            NodeKind::AssignIndex { array, index, expr },
        )
    }

    pub fn assign_list(location: SourceLocation, array: ArrayHandle, elems: Vec<NodeRef>) -> NodeRef {
        Self::new(location, false, NodeKind::AssignList { array, elems })
    }

    pub fn assign_copy(location: SourceLocation, dest: ArrayHandle, src: ArrayHandle) -> NodeRef {
        Self::new(location, false, NodeKind::AssignCopy { dest, src })
    }

    pub fn assign_arg(location: SourceLocation, array: ArrayHandle, arg_index: NodeRef) -> NodeRef {
        Self::new(location, false, NodeKind::AssignArg { array, arg_index })
    }

    pub fn string_literal(location: SourceLocation, array: ArrayHandle, literal: String) -> NodeRef {
        Self::new(location, false, NodeKind::StringLiteral { array, literal })
    }

    pub fn static_scalar(location: SourceLocation, var: VarHandle, expr: NodeRef) -> NodeRef {
        Self::new(
            location,
            false,
            NodeKind::Static {
                array: None,
                var: Some(var),
                kind: StaticKind::Scalar { expr },
                initialized: Cell::new(false),
            },
        )
    }

    pub fn static_uninit_array(location: SourceLocation, array: ArrayHandle) -> NodeRef {
        Self::new(
            location,
            false,
            NodeKind::Static {
                array: Some(array),
                var: None,
                kind: StaticKind::UninitArray,
                initialized: Cell::new(false),
            },
        )
    }

    pub fn static_copy_array(location: SourceLocation, array: ArrayHandle, src: ArrayHandle) -> NodeRef {
        Self::new(
            location,
            false,
            NodeKind::Static {
                array: Some(array),
                var: None,
                kind: StaticKind::CopyFrom { src },
                initialized: Cell::new(false),
            },
        )
    }

    pub fn static_sized_array(location: SourceLocation, array: ArrayHandle, size: NodeRef) -> NodeRef {
        Self::new(
            location,
            false,
            NodeKind::Static {
                array: Some(array),
                var: None,
                kind: StaticKind::SizeOnly { size },
                initialized: Cell::new(false),
            },
        )
    }

    pub fn def(location: SourceLocation) -> NodeRef {
        Self::new(location, false, NodeKind::Def)
    }

    pub fn dim(location: SourceLocation, array: ArrayHandle, size: NodeRef) -> NodeRef {
        Self::new(location, false, NodeKind::Dim { array, size })
    }

    pub fn map(location: SourceLocation) -> NodeRef {
        Self::new(location, false, NodeKind::Map)
    }

    pub fn import(location: SourceLocation, child: Option<NodeRef>) -> NodeRef {
        Self::new(location, false, NodeKind::Import { child })
    }

    pub fn unary_op(location: SourceLocation, op: UnaryOpKind, child: NodeRef) -> NodeRef {
        let is_const = child.is_constant;
        Self::new(location, is_const, NodeKind::UnaryOp { op, child })
    }

    pub fn binary_op(
        location: SourceLocation,
        op: BinaryOpKind,
        lhs: NodeRef,
        rhs: NodeRef,
    ) -> NodeRef {
        let is_const = lhs.is_constant && rhs.is_constant;
        Self::new(location, is_const, NodeKind::BinaryOp { op, lhs, rhs })
    }

    pub fn restriction(location: SourceLocation, child: NodeRef, width: u32) -> NodeRef {
        let is_const = child.is_constant;
        Self::new(location, is_const, NodeKind::Restriction { child, width })
    }

    pub fn peek(location: SourceLocation, addr: NodeRef, width: u32) -> NodeRef {
        Self::new(location, false, NodeKind::Peek { addr, width })
    }

    pub fn poke(
        location: SourceLocation,
        addr: NodeRef,
        value: NodeRef,
        mask: Option<NodeRef>,
        width: u32,
    ) -> NodeRef {
        Self::new(
            location,
            false,
            NodeKind::Poke {
                addr,
                value,
                mask,
                width,
            },
        )
    }

    pub fn print(location: SourceLocation, items: Vec<PrintItem>) -> NodeRef {
        Self::new(location, false, NodeKind::Print { items })
    }

    pub fn sleep(location: SourceLocation, mode: SleepMode) -> NodeRef {
        Self::new(location, false, NodeKind::Sleep(mode))
    }

    pub fn brk(location: SourceLocation) -> NodeRef {
        Self::new(location, false, NodeKind::Break)
    }
    pub fn exit(location: SourceLocation) -> NodeRef {
        Self::new(location, false, NodeKind::Exit)
    }
    pub fn quit(location: SourceLocation) -> NodeRef {
        Self::new(location, false, NodeKind::Quit)
    }

    pub fn if_node(
        location: SourceLocation,
        cond: NodeRef,
        then_branch: NodeRef,
        else_branch: Option<NodeRef>,
    ) -> NodeRef {
        Self::new(
            location,
            false,
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            },
        )
    }

    pub fn while_node(location: SourceLocation, cond: NodeRef, body: NodeRef) -> NodeRef {
        Self::new(location, false, NodeKind::While { cond, body })
    }

    pub fn for_node(
        location: SourceLocation,
        var: VarHandle,
        init: NodeRef,
        to: NodeRef,
        step: Option<NodeRef>,
        body: NodeRef,
    ) -> NodeRef {
        Self::new(
            location,
            false,
            NodeKind::For {
                var,
                init,
                to,
                step,
                body,
            },
        )
    }

    pub fn block(location: SourceLocation, children: Vec<NodeRef>) -> NodeRef {
        Self::new(location, false, NodeKind::Block(children))
    }

    pub fn array_block(location: SourceLocation, body: Vec<NodeRef>, result: ArrayHandle) -> NodeRef {
        Self::new(location, false, NodeKind::ArrayBlock { body, result })
    }

    pub fn subroutine_call(
        location: SourceLocation,
        subroutine: Weak<Subroutine>,
        kind: SubroutineKind,
        args: Vec<CallArg>,
    ) -> NodeRef {
        Self::new(
            location,
            false,
            NodeKind::SubroutineCall {
                subroutine,
                kind,
                args,
            },
        )
    }

    pub fn scalar_builtin(
        location: SourceLocation,
        eval: Rc<dyn Fn(&[BuiltinArg]) -> MempeekResult<u64>>,
        args: Vec<CallArg>,
    ) -> NodeRef {
        Self::new(location, false, NodeKind::ScalarBuiltin { eval, args })
    }

    pub fn array_builtin(
        location: SourceLocation,
        eval: Rc<dyn Fn(&[BuiltinArg]) -> MempeekResult<ArrayHandle>>,
        args: Vec<CallArg>,
        result: ArrayHandle,
    ) -> NodeRef {
        Self::new(
            location,
            false,
            NodeKind::ArrayBuiltin { eval, args, result },
        )
    }

    /// Whether this node yields an array result rather than (or in addition
    /// to) a scalar one; used at subroutine-call and argument-binding sites
    /// to validate array-typed parameters at construction time.
    pub fn produces_array(&self) -> bool {
        match &self.kind {
            NodeKind::ArrayAccess { index: None, .. } => true,
            NodeKind::StringLiteral { .. } => true,
            NodeKind::ArrayBlock { .. } => true,
            NodeKind::ArrayBuiltin { .. } => true,
            NodeKind::SubroutineCall { kind, .. } => *kind == SubroutineKind::ArrayFunction,
            _ => false,
        }
    }

    /// If this node is constant, evaluates it now and returns a literal
    /// replacement. Division by zero encountered here is reclassified to the
    /// compile-time error kind, per the constant-folding contract.
    pub fn clone_to_const(self: &NodeRef, env: &Environment) -> MempeekResult<Option<NodeRef>> {
        if !self.is_constant {
            return Ok(None);
        }
        match self.execute(env) {
            Ok(v) => Ok(Some(Node::constant(self.location.clone(), v))),
            Err(MempeekError::Runtime(RuntimeError::DivisionByZero { location })) => {
                Err(CompileError::ConstDivisionByZero { location }.into())
            }
            Err(e) => Err(e),
        }
    }

    /// Requires `self.is_constant`; runs it and reclassifies a runtime
    /// division-by-zero into the compile-time variant.
    pub fn const_exec(self: &NodeRef, env: &Environment) -> MempeekResult<u64> {
        debug_assert!(self.is_constant);
        match self.execute(env) {
            Err(MempeekError::Runtime(RuntimeError::DivisionByZero { location })) => {
                Err(CompileError::ConstDivisionByZero { location }.into())
            }
            other => other,
        }
    }

    pub fn array_result(&self, env: &Environment) -> MempeekResult<Option<ArrayHandle>> {
        match &self.kind {
            NodeKind::ArrayAccess { array, index: None } => Ok(Some(array.clone())),
            NodeKind::StringLiteral { array, literal } => {
                let words = strenc::encode(literal);
                array.resize(words.len() as u64);
                for (i, w) in words.into_iter().enumerate() {
                    array.set(i as u64, w);
                }
                Ok(Some(array.clone()))
            }
            NodeKind::ArrayBlock { body, result } => {
                for child in body {
                    child.execute(env)?;
                }
                Ok(Some(result.clone()))
            }
            NodeKind::ArrayBuiltin { .. } => {
                let result = self.execute_array_builtin(env)?;
                Ok(Some(result))
            }
            NodeKind::SubroutineCall { kind, .. } if *kind == SubroutineKind::ArrayFunction => {
                let (_, arr) = self.call_subroutine(env)?;
                Ok(arr)
            }
            _ => Ok(None),
        }
    }

    /// Resolves a call argument to its evaluated form.
    fn eval_arg(arg: &CallArg, env: &Environment) -> MempeekResult<BuiltinArg> {
        match arg {
            CallArg::Scalar(n) => Ok(BuiltinArg::Scalar(n.execute(env)?)),
            CallArg::Array(n) => {
                let arr = n
                    .array_result(env)?
                    .expect("CallArg::Array constructed from a non-array-producing node");
                Ok(BuiltinArg::Array(arr))
            }
        }
    }

    fn execute_array_builtin(&self, env: &Environment) -> MempeekResult<ArrayHandle> {
        let NodeKind::ArrayBuiltin { eval, args, result } = &self.kind else {
            unreachable!()
        };
        let values = args
            .iter()
            .map(|a| Self::eval_arg(a, env))
            .collect::<MempeekResult<Vec<_>>>()?;
        let produced = eval(&values)?;
        // Builtins may return a fresh handle or mutate `result` in place;
        // either way `result` is what callers see, so keep them in sync.
        if !Rc::ptr_eq(&produced, result) {
            result.resize(produced.size());
            for i in 0..produced.size() {
                result.set(i, produced.get(i).unwrap_or(0));
            }
        }
        Ok(result.clone())
    }

    fn call_subroutine(
        &self,
        env: &Environment,
    ) -> MempeekResult<(u64, Option<ArrayHandle>)> {
        let NodeKind::SubroutineCall { subroutine, args, .. } = &self.kind else {
            unreachable!()
        };
        let sub = subroutine.upgrade().ok_or_else(|| {
            MempeekError::from(RuntimeError::DroppedSubroutine {
                location: self.location.clone(),
            })
        })?;

        let num_params = sub.num_params();

        let mut evaluated = Vec::with_capacity(args.len());
        for arg in args {
            evaluated.push(Self::eval_arg(arg, env)?);
        }

        env.push_vararg_frame();

        // Bind by-reference array params, tracking exactly which `RefArray`s
        // got a push so a mismatch partway through still unwinds cleanly
        // instead of leaking frames (arg kinds are already validated at
        // construction time, so `bind_result` going `Err` here is defensive).
        let mut pushed_refs: Vec<Rc<RefArray>> = Vec::new();
        let mut bind_result: MempeekResult<()> = Ok(());
        {
            let params = sub.params.borrow();
            for (i, param) in params.iter().enumerate() {
                if let Param::Array(ref_array) = param {
                    match evaluated[i].as_array().cloned() {
                        Some(arr) => {
                            ref_array.push_ref(arr);
                            pushed_refs.push(ref_array.clone());
                        }
                        None => {
                            bind_result = Err(RuntimeError::ArgTypeMismatch {
                                location: self.location.clone(),
                            }
                            .into());
                            break;
                        }
                    }
                }
            }
        }
        if bind_result.is_ok() {
            for value in &evaluated[num_params..] {
                match value {
                    BuiltinArg::Scalar(v) => env.append_vararg_scalar(*v),
                    BuiltinArg::Array(a) => env.append_vararg_array(a.clone()),
                }
            }
        }

        sub.vars.borrow_mut().push();
        sub.arrays.borrow_mut().push();

        if bind_result.is_ok() {
            let params = sub.params.borrow();
            for (i, param) in params.iter().enumerate() {
                if let Param::Scalar(var) = param {
                    match evaluated[i].as_scalar() {
                        Some(v) => var.set(v),
                        None => {
                            bind_result = Err(RuntimeError::ArgTypeMismatch {
                                location: self.location.clone(),
                            }
                            .into());
                            break;
                        }
                    }
                }
            }
        }
        if bind_result.is_ok() {
            if let Some(retval) = &sub.retval {
                retval.set(0);
            }
            if let Some(array_retval) = &sub.array_retval {
                array_retval.resize(0);
            }
        }

        let outcome = if bind_result.is_ok() {
            let body = sub.body.borrow().clone();
            match body {
                Some(body) => match body.execute(env) {
                    Ok(v) => Ok(v),
                    Err(e) if e.is_control(ControlSignal::Exit) || e.is_control(ControlSignal::Break) => Ok(0),
                    Err(e) => Err(e),
                },
                None => Err(RuntimeError::DroppedSubroutine {
                    location: self.location.clone(),
                }
                .into()),
            }
        } else {
            Ok(0)
        };

        // Read the return value before popping the local frame that backs
        // it: `retval`/`array_retval` are local slots, so reading through
        // them after `pop()` would observe the restored caller frame instead
        // of what the body just computed. The array return is snapshotted
        // into a fresh, independent handle for the same reason.
        let scalar_return = sub.retval.as_ref().map(|v| v.get()).unwrap_or(0);
        let array_return = sub.array_retval.as_ref().map(|arr| {
            let n = arr.size();
            let snapshot = ArrayManager::fresh_handle();
            snapshot.resize(n);
            for i in 0..n {
                snapshot.set(i, arr.get(i).unwrap_or(0));
            }
            snapshot
        });

        sub.arrays.borrow_mut().pop();
        sub.vars.borrow_mut().pop();

        for ref_array in pushed_refs.iter().rev() {
            ref_array.pop_ref();
        }

        env.pop_vararg_frame();

        outcome?;
        bind_result?;

        Ok((scalar_return, array_return))
    }

    pub fn execute(&self, env: &Environment) -> MempeekResult<u64> {
        match &self.kind {
            NodeKind::Constant(v) => Ok(*v),

            NodeKind::Var(var) => Ok(var.get()),

            NodeKind::Arg {
                query,
                index,
                arr_index,
            } => self.execute_arg(env, *query, index, arr_index),

            NodeKind::Range { var, index } => {
                let range = var.get_range();
                match index {
                    None => Ok(range),
                    Some(idx) => {
                        let i = idx.execute(env)?;
                        if i >= range {
                            return Err(RuntimeError::OutOfBounds {
                                location: self.location.clone(),
                                index: i,
                                size: range,
                            }
                            .into());
                        }
                        let size = var.get_size().unwrap_or(1) as u64;
                        Ok(var.get() + size * i)
                    }
                }
            }

            NodeKind::ArrayAccess { array, index } => match index {
                None => Ok(array.size()),
                Some(idx) => {
                    let i = idx.execute(env)?;
                    array.get(i).ok_or_else(|| {
                        RuntimeError::OutOfBounds {
                            location: self.location.clone(),
                            index: i,
                            size: array.size(),
                        }
                        .into()
                    })
                }
            },

            NodeKind::AssignVar { var, expr } => {
                let v = expr.execute(env)?;
                var.set(v);
                Ok(v)
            }

            NodeKind::AssignIndex { array, index, expr } => {
                let i = index.execute(env)?;
                let v = expr.execute(env)?;
                if !array.set(i, v) {
                    return Err(RuntimeError::OutOfBounds {
                        location: self.location.clone(),
                        index: i,
                        size: array.size(),
                    }
                    .into());
                }
                Ok(v)
            }

            NodeKind::AssignList { array, elems } => {
                array.resize(elems.len() as u64);
                for (i, e) in elems.iter().enumerate() {
                    let v = e.execute(env)?;
                    array.set(i as u64, v);
                }
                Ok(elems.len() as u64)
            }

            NodeKind::AssignCopy { dest, src } => {
                let n = src.size();
                dest.resize(n);
                for i in 0..n {
                    dest.set(i, src.get(i).unwrap_or(0));
                }
                Ok(n)
            }

            NodeKind::AssignArg { array, arg_index } => {
                let i = arg_index.execute(env)?;
                let src = env.vararg_array(i).ok_or_else(|| RuntimeError::ArgTypeMismatch {
                    location: self.location.clone(),
                })?;
                let n = src.size();
                array.resize(n);
                for j in 0..n {
                    array.set(j, src.get(j).unwrap_or(0));
                }
                Ok(n)
            }

            NodeKind::StringLiteral { .. } => {
                self.array_result(env)?;
                Ok(0)
            }

            NodeKind::Static {
                array,
                var,
                kind,
                initialized,
            } => {
                if initialized.get() {
                    return Ok(0);
                }
                initialized.set(true);
                match kind {
                    StaticKind::UninitArray => {}
                    StaticKind::CopyFrom { src } => {
                        let arr = array.as_ref().expect("array static without array slot");
                        let n = src.size();
                        arr.resize(n);
                        for i in 0..n {
                            arr.set(i, src.get(i).unwrap_or(0));
                        }
                    }
                    StaticKind::SizeOnly { size } => {
                        let arr = array.as_ref().expect("array static without array slot");
                        let n = size.execute(env)?;
                        arr.resize(n);
                    }
                    StaticKind::Scalar { expr } => {
                        let v = expr.execute(env)?;
                        var.as_ref().expect("scalar static without var slot").set(v);
                    }
                }
                Ok(0)
            }

            NodeKind::Def => Ok(0),

            NodeKind::Dim { array, size } => {
                let n = size.execute(env)?;
                array.resize(n);
                Ok(n)
            }

            NodeKind::Map => Ok(0),

            NodeKind::Import { child } => {
                if let Some(child) = child {
                    match child.execute(env) {
                        Ok(v) => Ok(v),
                        Err(e)
                            if e.is_control(ControlSignal::Exit) || e.is_control(ControlSignal::Break) =>
                        {
                            Ok(0)
                        }
                        Err(e) => Err(e),
                    }
                } else {
                    Ok(0)
                }
            }

            NodeKind::UnaryOp { op, child } => {
                let v = child.execute(env)?;
                Ok(match op {
                    UnaryOpKind::Neg => (v as i64).wrapping_neg() as u64,
                    UnaryOpKind::BitNot => !v,
                    UnaryOpKind::LogicalNot => all_ones_if(!truthy(v)),
                })
            }

            NodeKind::BinaryOp { op, lhs, rhs } => self.execute_binary_op(env, *op, lhs, rhs),

            NodeKind::Restriction { child, width } => {
                let v = child.execute(env)?;
                Ok(mask_for_width(*width).map(|m| v & m).unwrap_or(v))
            }

            NodeKind::Peek { addr, width } => {
                let a = addr.execute(env)?;
                let engine = env.mapping();
                let mapping = engine.lookup(a, (*width / 8) as u64).ok_or_else(|| {
                    RuntimeError::NoMapping {
                        location: self.location.clone(),
                        address: a,
                        bits: *width,
                    }
                })?;
                let v = peek_width(mapping, a, *width);
                if mapping.has_failed() {
                    return Err(RuntimeError::BusError {
                        location: self.location.clone(),
                        address: a,
                        bits: *width,
                    }
                    .into());
                }
                Ok(v)
            }

            NodeKind::Poke {
                addr,
                value,
                mask,
                width,
            } => {
                let a = addr.execute(env)?;
                let v = value.execute(env)?;
                let engine = env.mapping();
                let mapping = engine.lookup(a, (*width / 8) as u64).ok_or_else(|| {
                    RuntimeError::NoMapping {
                        location: self.location.clone(),
                        address: a,
                        bits: *width,
                    }
                })?;
                match mask {
                    Some(m) => {
                        let m = m.execute(env)?;
                        poke_clear_width(mapping, a, *width, m);
                        poke_set_width(mapping, a, *width, v & m);
                    }
                    None => poke_width(mapping, a, *width, v),
                }
                if mapping.has_failed() {
                    return Err(RuntimeError::BusError {
                        location: self.location.clone(),
                        address: a,
                        bits: *width,
                    }
                    .into());
                }
                Ok(0)
            }

            NodeKind::Print { items } => {
                self.execute_print(env, items)?;
                Ok(0)
            }

            NodeKind::Sleep(mode) => self.execute_sleep(env, mode),

            NodeKind::Break => Err(MempeekError::control(ControlSignal::Break)),
            NodeKind::Exit => Err(MempeekError::control(ControlSignal::Exit)),
            NodeKind::Quit => Err(MempeekError::control(ControlSignal::Quit)),

            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                if truthy(cond.execute(env)?) {
                    then_branch.execute(env)
                } else if let Some(e) = else_branch {
                    e.execute(env)
                } else {
                    Ok(0)
                }
            }

            NodeKind::While { cond, body } => {
                while truthy(cond.execute(env)?) {
                    match body.execute(env) {
                        Ok(_) => {}
                        Err(e) if e.is_control(ControlSignal::Break) => break,
                        Err(e) => return Err(e),
                    }
                }
                Ok(0)
            }

            NodeKind::For {
                var,
                init,
                to,
                step,
                body,
            } => {
                let start = init.execute(env)?;
                var.set(start);
                loop {
                    let to_v = to.execute(env)? as i64;
                    let step_v = match step {
                        Some(s) => s.execute(env)? as i64,
                        None => 1,
                    };
                    let i = var.get() as i64;
                    let cont = (step_v > 0 && i <= to_v) || (step_v < 0 && i >= to_v);
                    if !cont {
                        break;
                    }
                    match body.execute(env) {
                        Ok(_) => {}
                        Err(e) if e.is_control(ControlSignal::Break) => break,
                        Err(e) => return Err(e),
                    }
                    var.set((i + step_v) as u64);
                }
                Ok(0)
            }

            NodeKind::Block(children) => {
                for (i, child) in children.iter().enumerate() {
                    child.execute(env)?;
                    if env.is_terminated() && i + 1 < children.len() {
                        return Err(MempeekError::control(ControlSignal::Terminate));
                    }
                }
                Ok(0)
            }

            NodeKind::ArrayBlock { .. } => {
                self.array_result(env)?;
                Ok(0)
            }

            NodeKind::SubroutineCall { .. } => {
                let (scalar, _) = self.call_subroutine(env)?;
                Ok(scalar)
            }

            NodeKind::ScalarBuiltin { eval, args } => {
                let values = args
                    .iter()
                    .map(|a| Self::eval_arg(a, env))
                    .collect::<MempeekResult<Vec<_>>>()?;
                eval(&values)
            }

            NodeKind::ArrayBuiltin { .. } => {
                self.execute_array_builtin(env)?;
                Ok(0)
            }
        }
    }

    fn execute_arg(
        &self,
        env: &Environment,
        query: ArgQuery,
        index: &Option<NodeRef>,
        arr_index: &Option<NodeRef>,
    ) -> MempeekResult<u64> {
        let Some(index) = index else {
            return Ok(env.vararg_count());
        };
        let i = index.execute(env)?;

        if let Some(arr_index) = arr_index {
            let arr = env.vararg_array(i).ok_or_else(|| RuntimeError::ArgTypeMismatch {
                location: self.location.clone(),
            })?;
            let j = arr_index.execute(env)?;
            return arr.get(j).ok_or_else(|| {
                RuntimeError::OutOfBounds {
                    location: self.location.clone(),
                    index: j,
                    size: arr.size(),
                }
                .into()
            });
        }

        match query {
            ArgQuery::Value => env.vararg_value(i).ok_or_else(|| {
                RuntimeError::ArgTypeMismatch {
                    location: self.location.clone(),
                }
                .into()
            }),
            ArgQuery::ArraySize => env
                .vararg_array(i)
                .map(|a| a.size())
                .ok_or_else(|| RuntimeError::ArgTypeMismatch {
                    location: self.location.clone(),
                }
                .into()),
            ArgQuery::Type => Ok(if env.vararg_is_array(i) { 1 } else { 0 }),
        }
    }

    fn execute_binary_op(
        &self,
        env: &Environment,
        op: BinaryOpKind,
        lhs: &NodeRef,
        rhs: &NodeRef,
    ) -> MempeekResult<u64> {
        let a = lhs.execute(env)?;
        let b = rhs.execute(env)?;
        let (sa, sb) = (a as i64, b as i64);

        let div_by_zero = || RuntimeError::DivisionByZero {
            location: self.location.clone(),
        };

        Ok(match op {
            BinaryOpKind::Add => a.wrapping_add(b),
            BinaryOpKind::Sub => a.wrapping_sub(b),
            BinaryOpKind::Mul => a.wrapping_mul(b),
            BinaryOpKind::Div => {
                if b == 0 {
                    return Err(div_by_zero().into());
                }
                a / b
            }
            BinaryOpKind::Mod => {
                if b == 0 {
                    return Err(div_by_zero().into());
                }
                a % b
            }
            BinaryOpKind::SDiv => {
                if sb == 0 {
                    return Err(div_by_zero().into());
                }
                sa.wrapping_div(sb) as u64
            }
            BinaryOpKind::SMod => {
                if sb == 0 {
                    return Err(div_by_zero().into());
                }
                sa.wrapping_rem(sb) as u64
            }
            BinaryOpKind::Shl => a.wrapping_shl(b as u32),
            BinaryOpKind::Shr => a.wrapping_shr(b as u32),
            BinaryOpKind::Lt => all_ones_if(a < b),
            BinaryOpKind::Gt => all_ones_if(a > b),
            BinaryOpKind::Le => all_ones_if(a <= b),
            BinaryOpKind::Ge => all_ones_if(a >= b),
            BinaryOpKind::Eq => all_ones_if(a == b),
            BinaryOpKind::Ne => all_ones_if(a != b),
            BinaryOpKind::SLt => all_ones_if(sa < sb),
            BinaryOpKind::SGt => all_ones_if(sa > sb),
            BinaryOpKind::SLe => all_ones_if(sa <= sb),
            BinaryOpKind::SGe => all_ones_if(sa >= sb),
            BinaryOpKind::And => a & b,
            BinaryOpKind::Xor => a ^ b,
            BinaryOpKind::Or => a | b,
            BinaryOpKind::LAnd => all_ones_if(truthy(a) && truthy(b)),
            BinaryOpKind::LXor => all_ones_if(truthy(a) != truthy(b)),
            BinaryOpKind::LOr => all_ones_if(truthy(a) || truthy(b)),
        })
    }

    fn execute_print(&self, env: &Environment, items: &[PrintItem]) -> MempeekResult<()> {
        let mut out = String::new();
        for item in items {
            match item {
                PrintItem::Literal(s) => out.push_str(s),
                PrintItem::Expr { node, modifier } => {
                    if let Some(arr) = node.array_result(env)? {
                        match modifier.array_mode {
                            ArrayMode::StringDecode => {
                                let words: Vec<u64> = (0..arr.size()).map(|i| arr.get(i).unwrap_or(0)).collect();
                                out.push_str(&strenc::decode_nul_terminated(&words));
                            }
                            ArrayMode::List => {
                                out.push_str("[ ");
                                for i in 0..arr.size() {
                                    out.push_str(&format_scalar(
                                        arr.get(i).unwrap_or(0),
                                        modifier,
                                        env.word_size(),
                                    ));
                                    out.push(' ');
                                }
                                out.push(']');
                            }
                        }
                    } else {
                        let v = node.execute(env)?;
                        out.push_str(&format_scalar(v, modifier, env.word_size()));
                    }
                }
            }
        }
        env.emit_print(&out);
        Ok(())
    }

    fn execute_sleep(&self, env: &Environment, mode: &SleepMode) -> MempeekResult<u64> {
        match mode {
            SleepMode::Now => Ok(monotonic_micros()),
            SleepMode::Relative(expr) => {
                let ms = expr.execute(env)?;
                self.sleep_until(env, monotonic_micros() + ms * 1000)?;
                Ok(0)
            }
            SleepMode::Absolute(expr) => {
                let target = expr.execute(env)?;
                self.sleep_until(env, target)?;
                Ok(0)
            }
        }
    }

    fn sleep_until(&self, env: &Environment, target_micros: u64) -> MempeekResult<()> {
        use std::time::Duration;

        loop {
            let now = monotonic_micros();
            if now >= target_micros {
                return Ok(());
            }
            if env.is_terminated() {
                return Err(MempeekError::control(ControlSignal::Terminate));
            }
            let remaining = (target_micros - now).min(50_000);
            std::thread::sleep(Duration::from_micros(remaining));
        }
    }
}

/// Monotonic clock in microseconds (`CLOCK_MONOTONIC`), immune to wall-clock
/// (NTP) step adjustments — `SleepMode::Absolute` compares against a stored
/// value of this, so it must never run backward.
pub fn monotonic_micros() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000)
        .saturating_add((ts.tv_nsec / 1_000) as u64)
}

fn mask_for_width(width: u32) -> Option<u64> {
    match width {
        8 => Some(0xFF),
        16 => Some(0xFFFF),
        32 => Some(0xFFFF_FFFF),
        64 => None,
        _ => Some(0),
    }
}

fn peek_width(m: &crate::mapping::Mapping, addr: u64, width: u32) -> u64 {
    match width {
        8 => m.peek_u8(addr) as u64,
        16 => m.peek_u16(addr) as u64,
        32 => m.peek_u32(addr) as u64,
        _ => m.peek_u64(addr),
    }
}

fn poke_width(m: &crate::mapping::Mapping, addr: u64, width: u32, v: u64) {
    match width {
        8 => m.poke_u8(addr, v as u8),
        16 => m.poke_u16(addr, v as u16),
        32 => m.poke_u32(addr, v as u32),
        _ => m.poke_u64(addr, v),
    }
}

fn poke_set_width(m: &crate::mapping::Mapping, addr: u64, width: u32, mask: u64) {
    match width {
        8 => m.set_bits(addr, mask, 1),
        16 => m.set_bits(addr, mask, 2),
        32 => m.set_bits(addr, mask, 4),
        _ => m.set_bits(addr, mask, 8),
    }
}

fn poke_clear_width(m: &crate::mapping::Mapping, addr: u64, width: u32, mask: u64) {
    match width {
        8 => m.clear_bits(addr, mask, 1),
        16 => m.clear_bits(addr, mask, 2),
        32 => m.clear_bits(addr, mask, 4),
        _ => m.clear_bits(addr, mask, 8),
    }
}

fn format_scalar(v: u64, modifier: &PrintModifier, default_word_size: u32) -> String {
    let bits = modifier.width.bits(default_word_size);
    let masked = mask_for_width(bits).map(|m| v & m).unwrap_or(v);
    match modifier.format {
        NumberFormat::Hex => format!("{:0width$x}", masked, width = (bits / 4) as usize),
        NumberFormat::Dec => format!("{masked}"),
        NumberFormat::SignedDec => {
            let shift = 64 - bits;
            let signed = ((masked << shift) as i64) >> shift;
            format!("{signed}")
        }
        NumberFormat::Bin => format!("{:0width$b}", masked, width = bits as usize),
        NumberFormat::Float => format!("{}", f64::from_bits(masked)),
    }
}
