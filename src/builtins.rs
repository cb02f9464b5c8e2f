//! The standard builtin set: a handful of scalar and array-valued factories
//! registered into the Environment at construction time. Deliberately small —
//! just enough to drive the example scripts end-to-end.

use std::rc::Rc;

use crate::ast::{BuiltinArg, CallArg, Node, NodeRef};
use crate::environment::Environment;
use crate::error::{MempeekResult, RuntimeError};
use crate::location::SourceLocation;
use crate::storage::{ArrayManager, ArrayT};

pub fn register(env: &Environment) {
    env.register_scalar_builtin(
        "abs",
        1,
        false,
        Rc::new(|location: &SourceLocation, args: Vec<CallArg>| -> MempeekResult<NodeRef> {
            Ok(Node::scalar_builtin(
                location.clone(),
                Rc::new(|values: &[BuiltinArg]| {
                    let v = values[0].as_scalar().expect("abs: scalar argument") as i64;
                    Ok(v.unsigned_abs())
                }),
                args,
            ))
        }),
    );

    env.register_scalar_builtin(
        "min",
        2,
        false,
        Rc::new(|location: &SourceLocation, args: Vec<CallArg>| -> MempeekResult<NodeRef> {
            Ok(Node::scalar_builtin(
                location.clone(),
                Rc::new(|values: &[BuiltinArg]| {
                    let a = values[0].as_scalar().expect("min: scalar argument");
                    let b = values[1].as_scalar().expect("min: scalar argument");
                    Ok(a.min(b))
                }),
                args,
            ))
        }),
    );

    env.register_scalar_builtin(
        "max",
        2,
        false,
        Rc::new(|location: &SourceLocation, args: Vec<CallArg>| -> MempeekResult<NodeRef> {
            Ok(Node::scalar_builtin(
                location.clone(),
                Rc::new(|values: &[BuiltinArg]| {
                    let a = values[0].as_scalar().expect("max: scalar argument");
                    let b = values[1].as_scalar().expect("max: scalar argument");
                    Ok(a.max(b))
                }),
                args,
            ))
        }),
    );

    env.register_scalar_builtin(
        "strlen",
        1,
        false,
        Rc::new(|location: &SourceLocation, args: Vec<CallArg>| -> MempeekResult<NodeRef> {
            let location = location.clone();
            Ok(Node::scalar_builtin(
                location.clone(),
                Rc::new(move |values: &[BuiltinArg]| {
                    let arr = values[0].as_array().ok_or_else(|| RuntimeError::ArgTypeMismatch {
                        location: location.clone(),
                    })?;
                    let words: Vec<u64> = (0..arr.size()).map(|i| arr.get(i).unwrap_or(0)).collect();
                    Ok(crate::ast::strenc_length(&words) as u64)
                }),
                args,
            ))
        }),
    );

    env.register_scalar_builtin(
        "now",
        0,
        false,
        Rc::new(|location: &SourceLocation, args: Vec<CallArg>| -> MempeekResult<NodeRef> {
            Ok(Node::scalar_builtin(
                location.clone(),
                // Monotonic microseconds, same clock `sleep` compares against
                // (CLOCK_MONOTONIC) — not wall-clock time.
                Rc::new(|_values: &[BuiltinArg]| Ok(crate::ast::monotonic_micros())),
                args,
            ))
        }),
    );

    // `strcat(dest, a, b)`: dest is a by-reference out-array, written with the
    // string-encoded concatenation of a and b. Matches the worked example
    // `dim t; strcat(t, s, s); print t`.
    env.register_array_builtin(
        "strcat",
        3,
        false,
        Rc::new(|location: &SourceLocation, args: Vec<CallArg>| -> MempeekResult<NodeRef> {
            let result = ArrayManager::fresh_handle();
            let location = location.clone();
            Ok(Node::array_builtin(
                location.clone(),
                Rc::new(move |values: &[BuiltinArg]| {
                    let dest = values[0].as_array().ok_or_else(|| RuntimeError::ArgTypeMismatch {
                        location: location.clone(),
                    })?;
                    let a = values[1].as_array().ok_or_else(|| RuntimeError::ArgTypeMismatch {
                        location: location.clone(),
                    })?;
                    let b = values[2].as_array().ok_or_else(|| RuntimeError::ArgTypeMismatch {
                        location: location.clone(),
                    })?;
                    let wa: Vec<u64> = (0..a.size()).map(|i| a.get(i).unwrap_or(0)).collect();
                    let wb: Vec<u64> = (0..b.size()).map(|i| b.get(i).unwrap_or(0)).collect();
                    let sa = crate::ast::strenc_decode(&wa);
                    let sb = crate::ast::strenc_decode(&wb);
                    let joined = crate::ast::strenc_encode(&format!("{sa}{sb}"));
                    dest.resize(joined.len() as u64);
                    for (i, w) in joined.into_iter().enumerate() {
                        dest.set(i as u64, w);
                    }
                    Ok(dest)
                }),
                args,
                result,
            ))
        }),
    );
}
