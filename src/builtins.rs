//! Built-in functions
//!
//! The order of [`NATIVES`] fixes each function's slot in the native symbol
//! scope and therefore the operand of `GETN`. Append new entries at the end.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{ErrorKind, MeleeError, Result};
use crate::value::{Hold, NativeFn, Value, VirtualSeq};
use crate::vm::Vm;

pub static NATIVES: &[NativeFn] = &[
    NativeFn { name: "print", arity: None, func: print },
    NativeFn { name: "len", arity: Some(1), func: len },
    NativeFn { name: "range", arity: None, func: range },
    NativeFn { name: "push", arity: Some(2), func: push },
    NativeFn { name: "pop", arity: Some(1), func: pop },
    NativeFn { name: "sort", arity: Some(1), func: sort },
    NativeFn { name: "rev", arity: Some(1), func: rev },
    NativeFn { name: "concat", arity: None, func: concat },
    NativeFn { name: "min", arity: None, func: min },
    NativeFn { name: "max", arity: None, func: max },
    NativeFn { name: "abs", arity: Some(1), func: abs },
    NativeFn { name: "map", arity: Some(2), func: map },
    NativeFn { name: "filter", arity: Some(2), func: filter },
    NativeFn { name: "take", arity: Some(2), func: take },
    NativeFn { name: "cycle", arity: Some(1), func: cycle },
    NativeFn { name: "merge", arity: None, func: merge },
    NativeFn { name: "poly", arity: None, func: poly },
    NativeFn { name: "conv", arity: Some(2), func: conv },
];

pub fn native_names() -> Vec<&'static str> {
    NATIVES.iter().map(|native| native.name).collect()
}

pub fn lookup(name: &str) -> Option<&'static NativeFn> {
    NATIVES.iter().find(|native| native.name == name)
}

// ==================== Argument helpers ====================

fn type_error(expected: &str, got: &Value) -> MeleeError {
    ErrorKind::TypeMismatch(expected.to_string(), got.type_name().to_string()).into()
}

fn expect_int(value: &Value) -> Result<i64> {
    value.as_int().ok_or_else(|| type_error("int", value))
}

fn expect_array(value: &Value) -> Result<Rc<RefCell<Vec<Value>>>> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        other => Err(type_error("array", other)),
    }
}

fn expect_sequences(args: &[Value]) -> Result<Vec<Value>> {
    if args.is_empty() {
        return Err(ErrorKind::WrongArity("at least 1".to_string(), 0).into());
    }
    args.iter()
        .map(|arg| {
            if arg.is_sequence() {
                Ok(arg.clone())
            } else {
                Err(type_error("seq", arg))
            }
        })
        .collect()
}

/// Variadic ints, or a single array of ints
fn int_arguments(args: &[Value]) -> Result<Vec<i64>> {
    match args {
        [Value::Array(items)] => items.borrow().iter().map(expect_int).collect(),
        _ => args.iter().map(expect_int).collect(),
    }
}

// ==================== Natives ====================

fn print(vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let text = args
        .iter()
        .map(|arg| arg.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    vm.print(&text);
    Ok(Value::Null)
}

fn len(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let items = expect_array(&args[0])?;
    let len = items.borrow().len() as i64;
    Ok(Value::Int(len))
}

/// `range(end)` or `range(start, end)`, half-open
fn range(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let (start, end) = match args {
        [end] => (0, expect_int(end)?),
        [start, end] => (expect_int(start)?, expect_int(end)?),
        _ => return Err(ErrorKind::WrongArity("1 or 2".to_string(), args.len()).into()),
    };
    if start < 0 || end < 0 {
        return Err(MeleeError::runtime(format!(
            "range bounds must be non-negative, got {} and {}",
            start, end
        )));
    }
    if start > end {
        return Err(MeleeError::runtime(format!(
            "range start {} is past its end {}",
            start, end
        )));
    }
    Ok(Value::array((start..end).map(Value::Int).collect()))
}

fn push(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let items = expect_array(&args[0])?;
    items.borrow_mut().push(args[1].clone());
    Ok(args[0].clone())
}

fn pop(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let items = expect_array(&args[0])?;
    let last = items.borrow_mut().pop();
    Ok(last.unwrap_or(Value::Null))
}

/// Sorts in place and returns the same array
fn sort(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let items = expect_array(&args[0])?;
    let mut ints = items
        .borrow()
        .iter()
        .map(expect_int)
        .collect::<Result<Vec<_>>>()?;
    ints.sort_unstable();
    *items.borrow_mut() = ints.into_iter().map(Value::Int).collect();
    Ok(args[0].clone())
}

fn rev(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let items = expect_array(&args[0])?;
    let reversed = items.borrow().iter().rev().cloned().collect();
    Ok(Value::array(reversed))
}

fn concat(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let mut joined = Vec::new();
    for arg in args {
        joined.extend(expect_array(arg)?.borrow().iter().cloned());
    }
    Ok(Value::array(joined))
}

fn min(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let ints = int_arguments(args)?;
    Ok(ints.into_iter().min().map(Value::Int).unwrap_or(Value::Null))
}

fn max(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let ints = int_arguments(args)?;
    Ok(ints.into_iter().max().map(Value::Int).unwrap_or(Value::Null))
}

fn abs(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let n = expect_int(&args[0])?;
    n.checked_abs()
        .map(Value::Int)
        .ok_or_else(|| ErrorKind::IntegerOverflow.into())
}

fn map(vm: &mut Vm, args: &[Value]) -> Result<Value> {
    // snapshot, so the callback may mutate the source array
    let items = expect_array(&args[0])?.borrow().clone();
    let mut mapped = Vec::with_capacity(items.len());
    for item in items {
        mapped.push(vm.call_and_return(args[1].clone(), vec![item])?);
    }
    Ok(Value::array(mapped))
}

fn filter(vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let items = expect_array(&args[0])?.borrow().clone();
    let mut kept = Vec::new();
    for item in items {
        if vm.call_and_return(args[1].clone(), vec![item.clone()])?.is_truthy() {
            kept.push(item);
        }
    }
    Ok(Value::array(kept))
}

/// Pull `n` values from a sequence into an array
fn take(vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let seq = &args[0];
    if !seq.is_sequence() {
        return Err(type_error("seq", seq));
    }
    let count = expect_int(&args[1])?;
    if count < 0 {
        return Err(MeleeError::runtime(format!("cannot take {} values", count)));
    }
    let mut values = Vec::new();
    for _ in 0..count {
        values.push(vm.take_next(seq)?);
    }
    Ok(Value::array(values))
}

/// Endless sequence over the current contents of an array
fn cycle(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let items = expect_array(&args[0])?;
    let mut position = 0usize;
    let pull = move |_vm: &mut Vm| -> Result<Value> {
        let items = items.borrow();
        if items.is_empty() {
            return Ok(Value::Null);
        }
        let value = items[position % items.len()].clone();
        position = (position + 1) % items.len();
        Ok(value)
    };
    Ok(Value::VirtualSeq(Rc::new(VirtualSeq::new("cycle", Box::new(pull)))))
}

/// Sequence of `f(x)` for each value pulled from the source. A finished
/// source gives null without calling `f`.
fn conv(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let source = args[0].clone();
    if !source.is_sequence() {
        return Err(type_error("seq", &source));
    }
    let f = args[1].clone();
    let pull = move |vm: &mut Vm| -> Result<Value> {
        match vm.take_next(&source)? {
            Value::Null => Ok(Value::Null),
            value => vm.call_and_return(f.clone(), vec![value]),
        }
    };
    Ok(Value::VirtualSeq(Rc::new(VirtualSeq::new("conv", Box::new(pull)))))
}

/// One value from every input per step, as an array
fn merge(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let sources = expect_sequences(args)?;
    let pull = move |vm: &mut Vm| -> Result<Value> {
        let mut step = Vec::with_capacity(sources.len());
        for source in &sources {
            step.push(vm.take_next(source)?);
        }
        Ok(Value::array(step))
    };
    Ok(Value::VirtualSeq(Rc::new(VirtualSeq::new("merge", Box::new(pull)))))
}

/// Like `merge`, but an input whose last note is still sounding is not
/// pulled; it reports a `Hold` with the remaining duration instead.
fn poly(_vm: &mut Vm, args: &[Value]) -> Result<Value> {
    let sources = expect_sequences(args)?;
    let mut sounding: Vec<Option<Hold>> = vec![None; sources.len()];
    let pull = move |vm: &mut Vm| -> Result<Value> {
        let mut step = Vec::with_capacity(sources.len());
        for (source, slot) in sources.iter().zip(sounding.iter_mut()) {
            if let Some(hold) = slot.take() {
                if hold.duration > 1 {
                    *slot = Some(Hold {
                        pitch: hold.pitch,
                        duration: hold.duration - 1,
                    });
                }
                step.push(Value::Hold(hold));
                continue;
            }

            let value = vm.take_next(source)?;
            if let Value::Note(note) = &value {
                if note.duration > 1 {
                    *slot = Some(Hold {
                        pitch: note.pitch,
                        duration: note.duration - 1,
                    });
                }
            }
            step.push(value);
        }
        Ok(Value::array(step))
    };
    Ok(Value::VirtualSeq(Rc::new(VirtualSeq::new("poly", Box::new(pull)))))
}
