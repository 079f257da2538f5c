//! Tree-walking evaluator for the toy script language.

use std::collections::HashMap;
use std::sync::Arc;

use glomium_wire::{
    Escape, FunctionHandle, GasConfig, HeapPointer, InvocationResponse, WireObject, WireValue,
};

use crate::gas::GasMeter;
use crate::script::{BinOp, Expr, Lambda, parse};

/// Nesting limit for script function calls. Exceeding it is an engine
/// fault, not a script error.
pub const MAX_CALL_DEPTH: usize = 64;

/// Rough per-slot size charged for array elements and object entries.
const SLOT_BYTES: usize = 8;

/// A script value.
#[derive(Debug, Clone)]
pub(crate) enum Val {
    Undefined,
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Array(Vec<Val>),
    Object(Vec<(String, Val)>),
    Closure(HeapPointer),
    Host { handle: FunctionHandle, name: String },
    Print,
}

/// Why evaluation stopped early.
#[derive(Debug)]
pub(crate) enum Abort {
    /// Script-level exception.
    Throw(Val),
    /// The gas budget ran out.
    OutOfGas,
    /// The engine gave up for another reason.
    Fault(String),
}

impl From<crate::gas::OutOfGas> for Abort {
    fn from(_: crate::gas::OutOfGas) -> Self {
        Self::OutOfGas
    }
}

/// What the evaluator needs from its embedder.
pub(crate) trait HostLink {
    /// Call a host function and block until it answers.
    fn invoke(&self, handle: FunctionHandle, args: Vec<WireValue>)
    -> Result<InvocationResponse, Abort>;

    /// Emit a log line.
    fn log(&self, message: String);
}

struct Closure {
    lambda: Arc<Lambda>,
    captured: HashMap<String, Val>,
}

/// Everything one context owns: globals, function arena and gas.
pub(crate) struct Heap {
    globals: HashMap<String, Val>,
    functions: HashMap<u64, Closure>,
    next_pointer: u64,
    pub(crate) meter: GasMeter,
}

impl Heap {
    pub(crate) fn new(gas: GasConfig) -> Self {
        Self {
            globals: HashMap::new(),
            functions: HashMap::new(),
            next_pointer: 1,
            meter: GasMeter::new(gas),
        }
    }

    /// Bind a global, charging for its memory.
    pub(crate) fn set_global(&mut self, name: &str, value: WireValue) -> Result<(), Abort> {
        let value = self.from_wire(value);
        self.meter
            .charge_bytes(footprint(&value).saturating_add(name.len()))?;
        self.globals.insert(name.to_owned(), value);
        Ok(())
    }

    /// Read a global.
    pub(crate) fn get_global(&self, name: &str) -> Result<WireValue, Abort> {
        match self.globals.get(name) {
            Some(value) => Ok(self.to_wire(value)),
            None => Err(not_defined(name)),
        }
    }

    /// Parse and evaluate `code`.
    pub(crate) fn eval(&mut self, code: &str, host: &dyn HostLink) -> Result<WireValue, Abort> {
        let program =
            parse(code).map_err(|message| Abort::Throw(error_object("SyntaxError", &message)))?;
        let mut interp = Interp {
            heap: self,
            host,
            frames: Vec::new(),
        };
        let mut last = Val::Undefined;
        for statement in &program.statements {
            last = interp.eval(statement)?;
        }
        Ok(self.to_wire(&last))
    }

    /// Call an arena function by pointer.
    pub(crate) fn call_pointer(
        &mut self,
        pointer: HeapPointer,
        args: Vec<WireValue>,
        host: &dyn HostLink,
    ) -> Result<WireValue, Abort> {
        if !self.functions.contains_key(&pointer.0) {
            return Err(Abort::Throw(error_object(
                "TypeError",
                &format!("no function at pointer {pointer}"),
            )));
        }
        let args = args.into_iter().map(|arg| self.from_wire(arg)).collect();
        let mut interp = Interp {
            heap: self,
            host,
            frames: Vec::new(),
        };
        let result = interp.call(&Val::Closure(pointer), args)?;
        Ok(self.to_wire(&result))
    }

    fn alloc(&mut self, closure: Closure) -> HeapPointer {
        let pointer = self.next_pointer;
        self.next_pointer = self.next_pointer.saturating_add(1);
        self.functions.insert(pointer, closure);
        HeapPointer(pointer)
    }

    pub(crate) fn to_wire(&self, value: &Val) -> WireValue {
        match value {
            Val::Undefined | Val::Print => WireValue::undefined(),
            Val::Null => WireValue::Null,
            Val::Bool(b) => WireValue::Bool(*b),
            Val::Num(n) => WireValue::Number(*n),
            Val::Str(s) => WireValue::String(s.clone()),
            Val::Array(items) => {
                WireValue::Array(items.iter().map(|item| self.to_wire(item)).collect())
            },
            Val::Object(entries) => WireValue::Escape(Escape::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), self.to_wire(v)))
                    .collect::<WireObject>(),
            )),
            Val::Closure(pointer) => WireValue::Escape(Escape::SandboxFunction { pointer: *pointer }),
            Val::Host { handle, name } => WireValue::Escape(Escape::HostFunction {
                handle: *handle,
                name: name.clone(),
            }),
        }
    }

    pub(crate) fn from_wire(&self, value: WireValue) -> Val {
        match value {
            WireValue::Null => Val::Null,
            WireValue::Bool(b) => Val::Bool(b),
            WireValue::Number(n) => Val::Num(n),
            WireValue::String(s) => Val::Str(s),
            WireValue::Array(items) => {
                Val::Array(items.into_iter().map(|item| self.from_wire(item)).collect())
            },
            WireValue::Escape(Escape::Object(object)) => Val::Object(
                object
                    .into_iter()
                    .map(|(k, v)| (k, self.from_wire(v)))
                    .collect(),
            ),
            WireValue::Escape(Escape::Undefined {}) => Val::Undefined,
            WireValue::Escape(Escape::HostFunction { handle, name }) => Val::Host { handle, name },
            WireValue::Escape(Escape::SandboxFunction { pointer }) => {
                if self.functions.contains_key(&pointer.0) {
                    Val::Closure(pointer)
                } else {
                    Val::Undefined
                }
            },
            WireValue::Unrecognized(map) => Val::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.from_wire(WireValue::from_json(v))))
                    .collect(),
            ),
        }
    }

    /// The payload reported for an uncaught exception: the `stack` of an
    /// error-like object, otherwise the thrown value itself.
    pub(crate) fn error_payload(&self, thrown: &Val) -> WireValue {
        if let Val::Object(entries) = thrown
            && let Some((_, Val::Str(stack))) = entries.iter().find(|(k, _)| k == "stack")
        {
            return WireValue::String(stack.clone());
        }
        self.to_wire(thrown)
    }
}

struct Interp<'h> {
    heap: &'h mut Heap,
    host: &'h dyn HostLink,
    frames: Vec<HashMap<String, Val>>,
}

impl Interp<'_> {
    fn eval(&mut self, expr: &Expr) -> Result<Val, Abort> {
        self.heap.meter.charge(1)?;
        match expr {
            Expr::Number(n) => Ok(Val::Num(*n)),
            Expr::Str(s) => {
                self.heap.meter.charge_bytes(s.len())?;
                Ok(Val::Str(s.clone()))
            },
            Expr::Bool(b) => Ok(Val::Bool(*b)),
            Expr::Null => Ok(Val::Null),
            Expr::Undefined => Ok(Val::Undefined),
            Expr::Array(items) => {
                let items = items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<Vec<_>, _>>()?;
                self.heap
                    .meter
                    .charge_bytes(items.len().saturating_mul(SLOT_BYTES))?;
                Ok(Val::Array(items))
            },
            Expr::Object(entries) => {
                let mut object = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    let value = self.eval(value)?;
                    self.heap
                        .meter
                        .charge_bytes(key.len().saturating_add(SLOT_BYTES))?;
                    set_entry(&mut object, key, value);
                }
                Ok(Val::Object(object))
            },
            Expr::Ident(name) => self.lookup(name),
            Expr::Assign(name, value) => {
                let value = self.eval(value)?;
                match self.frames.last_mut() {
                    Some(frame) if frame.contains_key(name) => {
                        frame.insert(name.clone(), value.clone());
                    },
                    _ => {
                        self.heap.globals.insert(name.clone(), value.clone());
                    },
                }
                Ok(value)
            },
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.binary(*op, &left, &right)
            },
            Expr::Neg(inner) => Ok(Val::Num(-to_number(&self.eval(inner)?))),
            Expr::Member(target, name) => {
                let target = self.eval(target)?;
                member(&target, name)
            },
            Expr::Index(target, index) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                index_into(&target, &index)
            },
            Expr::Call(callee, args) => {
                let callee = self.eval(callee)?;
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(&callee, args)
            },
            Expr::Lambda(lambda) => {
                let captured = self.frames.last().cloned().unwrap_or_default();
                Ok(Val::Closure(self.heap.alloc(Closure {
                    lambda: Arc::clone(lambda),
                    captured,
                })))
            },
            Expr::Throw(value) => Err(Abort::Throw(self.eval(value)?)),
            Expr::Loop(body) => loop {
                self.eval(body)?;
            },
        }
    }

    fn lookup(&self, name: &str) -> Result<Val, Abort> {
        if let Some(value) = self.frames.last().and_then(|frame| frame.get(name)) {
            return Ok(value.clone());
        }
        if let Some(value) = self.heap.globals.get(name) {
            return Ok(value.clone());
        }
        match name {
            "print" => Ok(Val::Print),
            _ => Err(not_defined(name)),
        }
    }

    fn binary(&mut self, op: BinOp, left: &Val, right: &Val) -> Result<Val, Abort> {
        match op {
            BinOp::Add => {
                if matches!(left, Val::Str(_)) || matches!(right, Val::Str(_)) {
                    let joined = format!("{}{}", display(left), display(right));
                    self.heap.meter.charge_bytes(joined.len())?;
                    Ok(Val::Str(joined))
                } else {
                    Ok(Val::Num(to_number(left) + to_number(right)))
                }
            },
            BinOp::Sub => Ok(Val::Num(to_number(left) - to_number(right))),
            BinOp::Mul => Ok(Val::Num(to_number(left) * to_number(right))),
            BinOp::Eq => Ok(Val::Bool(loose_eq(left, right))),
        }
    }

    fn call(&mut self, callee: &Val, args: Vec<Val>) -> Result<Val, Abort> {
        match callee {
            Val::Closure(pointer) => {
                if self.frames.len() >= MAX_CALL_DEPTH {
                    return Err(Abort::Fault("maximum call depth exceeded".to_owned()));
                }
                let Some(closure) = self.heap.functions.get(&pointer.0) else {
                    return Err(Abort::Throw(error_object("TypeError", "function was freed")));
                };
                let lambda = Arc::clone(&closure.lambda);
                let mut frame = closure.captured.clone();
                let mut args = args.into_iter();
                for param in &lambda.params {
                    frame.insert(param.clone(), args.next().unwrap_or(Val::Undefined));
                }

                self.frames.push(frame);
                let result = self.eval(&lambda.body);
                self.frames.pop();
                result
            },
            Val::Host { handle, .. } => {
                let args = args.iter().map(|arg| self.heap.to_wire(arg)).collect();
                match self.host.invoke(*handle, args)? {
                    InvocationResponse::Resolved(value) => Ok(self.heap.from_wire(value)),
                    InvocationResponse::Rejected(value) => {
                        Err(Abort::Throw(self.heap.from_wire(value)))
                    },
                }
            },
            Val::Print => {
                let line: Vec<String> = args.iter().map(display).collect();
                self.host.log(line.join(" "));
                Ok(Val::Undefined)
            },
            other => Err(Abort::Throw(error_object(
                "TypeError",
                &format!("{} is not a function", display(other)),
            ))),
        }
    }
}

fn set_entry(object: &mut Vec<(String, Val)>, key: &str, value: Val) {
    if let Some(slot) = object.iter_mut().find(|(k, _)| k == key) {
        slot.1 = value;
    } else {
        object.push((key.to_owned(), value));
    }
}

fn member(target: &Val, name: &str) -> Result<Val, Abort> {
    match (target, name) {
        (Val::Undefined | Val::Null, _) => Err(Abort::Throw(error_object(
            "TypeError",
            &format!("cannot read property '{name}' of {}", display(target)),
        ))),
        (Val::Array(items), "length") => Ok(Val::Num(length(items.len()))),
        (Val::Str(s), "length") => Ok(Val::Num(length(s.chars().count()))),
        (Val::Object(entries), _) => Ok(entries
            .iter()
            .find(|(k, _)| k == name)
            .map_or(Val::Undefined, |(_, v)| v.clone())),
        _ => Ok(Val::Undefined),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn index_into(target: &Val, index: &Val) -> Result<Val, Abort> {
    match (target, index) {
        (Val::Array(items), Val::Num(n)) if *n >= 0.0 && n.fract() == 0.0 => {
            Ok(items.get(*n as usize).cloned().unwrap_or(Val::Undefined))
        },
        (Val::Str(s), Val::Num(n)) if *n >= 0.0 && n.fract() == 0.0 => Ok(s
            .chars()
            .nth(*n as usize)
            .map_or(Val::Undefined, |c| Val::Str(c.to_string()))),
        (_, Val::Str(key)) => member(target, key),
        (Val::Undefined | Val::Null, _) => member(target, &display(index)),
        _ => Ok(Val::Undefined),
    }
}

#[allow(clippy::cast_precision_loss)]
fn length(n: usize) -> f64 {
    n as f64
}

fn to_number(value: &Val) -> f64 {
    match value {
        Val::Num(n) => *n,
        Val::Bool(true) => 1.0,
        Val::Bool(false) | Val::Null => 0.0,
        Val::Str(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse().unwrap_or(f64::NAN)
            }
        },
        _ => f64::NAN,
    }
}

fn loose_eq(left: &Val, right: &Val) -> bool {
    match (left, right) {
        (Val::Undefined | Val::Null, Val::Undefined | Val::Null) => true,
        (Val::Bool(a), Val::Bool(b)) => a == b,
        (Val::Num(_) | Val::Bool(_), Val::Num(_) | Val::Bool(_))
        | (Val::Str(_), Val::Num(_))
        | (Val::Num(_), Val::Str(_)) => to_number(left) == to_number(right),
        (Val::Str(a), Val::Str(b)) => a == b,
        (Val::Closure(a), Val::Closure(b)) => a == b,
        (Val::Host { handle: a, .. }, Val::Host { handle: b, .. }) => a == b,
        (Val::Print, Val::Print) => true,
        _ => false,
    }
}

/// String conversion as script performs it.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn display(value: &Val) -> String {
    match value {
        Val::Undefined => "undefined".to_owned(),
        Val::Null => "null".to_owned(),
        Val::Bool(b) => b.to_string(),
        Val::Num(n) if n.is_nan() => "NaN".to_owned(),
        Val::Num(n) if n.is_infinite() && *n > 0.0 => "Infinity".to_owned(),
        Val::Num(n) if n.is_infinite() => "-Infinity".to_owned(),
        Val::Num(n) if n.fract() == 0.0 && n.abs() < 1e21 => format!("{}", *n as i128),
        Val::Num(n) => n.to_string(),
        Val::Str(s) => s.clone(),
        Val::Array(items) => items.iter().map(display).collect::<Vec<_>>().join(","),
        Val::Object(_) => "[object Object]".to_owned(),
        Val::Closure(_) | Val::Host { .. } | Val::Print => "function".to_owned(),
    }
}

/// An `Error`-like object with `name`, `message` and `stack`.
pub(crate) fn error_object(name: &str, message: &str) -> Val {
    Val::Object(vec![
        ("name".to_owned(), Val::Str(name.to_owned())),
        ("message".to_owned(), Val::Str(message.to_owned())),
        (
            "stack".to_owned(),
            Val::Str(format!("{name}: {message}\n    at <eval>")),
        ),
    ])
}

fn not_defined(name: &str) -> Abort {
    Abort::Throw(error_object("ReferenceError", &format!("{name} is not defined")))
}

fn footprint(value: &Val) -> usize {
    match value {
        Val::Str(s) => s.len(),
        Val::Array(items) => items.iter().fold(0, |acc: usize, item| {
            acc.saturating_add(SLOT_BYTES)
                .saturating_add(footprint(item))
        }),
        Val::Object(entries) => entries.iter().fold(0, |acc: usize, (k, v)| {
            acc.saturating_add(SLOT_BYTES)
                .saturating_add(k.len())
                .saturating_add(footprint(v))
        }),
        _ => SLOT_BYTES,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    #[derive(Default)]
    struct RecordingHost {
        invoked: RefCell<Vec<(FunctionHandle, Vec<WireValue>)>>,
        logs: RefCell<Vec<String>>,
    }

    impl HostLink for RecordingHost {
        fn invoke(
            &self,
            handle: FunctionHandle,
            args: Vec<WireValue>,
        ) -> Result<InvocationResponse, Abort> {
            self.invoked.borrow_mut().push((handle, args.clone()));
            if handle.index == 0 {
                Ok(InvocationResponse::Resolved(
                    args.into_iter().next().unwrap_or_else(WireValue::undefined),
                ))
            } else {
                Ok(InvocationResponse::Rejected(WireValue::from("uhh")))
            }
        }

        fn log(&self, message: String) {
            self.logs.borrow_mut().push(message);
        }
    }

    fn heap() -> Heap {
        Heap::new(GasConfig::new(100_000, 1))
    }

    fn run(heap: &mut Heap, code: &str) -> Result<WireValue, Abort> {
        heap.eval(code, &RecordingHost::default())
    }

    #[test]
    fn arithmetic_and_globals() {
        let mut heap = heap();
        heap.set_global("x", WireValue::from(5)).unwrap();
        assert_eq!(run(&mut heap, "x + 1").unwrap(), WireValue::from(6));
        assert_eq!(run(&mut heap, "y = 2 * -3; y").unwrap(), WireValue::from(-6));
        assert_eq!(run(&mut heap, "'a' + 1 + 2").unwrap(), WireValue::from("a12"));
        assert_eq!(run(&mut heap, "[1, 2, 3].length == 3").unwrap(), WireValue::from(true));
    }

    #[test]
    fn closures_capture_parameters() {
        let mut heap = heap();
        let result = run(&mut heap, "adder = fn(a) => fn(b) => a + b; adder(2)(40)").unwrap();
        assert_eq!(result, WireValue::from(42));

        let WireValue::Escape(Escape::SandboxFunction { pointer }) =
            run(&mut heap, "fn(s) => s + '!'").unwrap()
        else {
            panic!("expected a function");
        };
        let called = heap
            .call_pointer(pointer, vec![WireValue::from("hi")], &RecordingHost::default())
            .unwrap();
        assert_eq!(called, WireValue::from("hi!"));
    }

    #[test]
    fn thrown_errors_report_stack() {
        let mut heap = heap();
        let Err(Abort::Throw(thrown)) = run(&mut heap, "missing") else {
            panic!("expected a throw");
        };
        let WireValue::String(stack) = heap.error_payload(&thrown) else {
            panic!("expected a stack string");
        };
        assert!(stack.starts_with("ReferenceError: missing is not defined"));

        let Err(Abort::Throw(thrown)) = run(&mut heap, "throw 'boom'") else {
            panic!("expected a throw");
        };
        assert_eq!(heap.error_payload(&thrown), WireValue::from("boom"));
    }

    #[test]
    fn host_calls_pass_ordered_arguments() {
        let mut heap = heap();
        let host = RecordingHost::default();
        heap.set_global(
            "echo",
            WireValue::Escape(Escape::HostFunction {
                handle: FunctionHandle::new(0, 0),
                name: "echo".into(),
            }),
        )
        .unwrap();
        heap.set_global(
            "fails",
            WireValue::Escape(Escape::HostFunction {
                handle: FunctionHandle::new(0, 1),
                name: "fails".into(),
            }),
        )
        .unwrap();

        assert_eq!(heap.eval("echo(3, 'b')", &host).unwrap(), WireValue::from(3));
        assert_eq!(
            host.invoked.borrow()[0].1,
            vec![WireValue::from(3), WireValue::from("b")]
        );

        let Err(Abort::Throw(Val::Str(thrown))) = heap.eval("fails()", &host) else {
            panic!("expected the rejection to be rethrown");
        };
        assert_eq!(thrown, "uhh");
    }

    #[test]
    fn loop_runs_out_of_gas() {
        let mut heap = Heap::new(GasConfig::new(500, 1));
        assert!(matches!(run(&mut heap, "loop 1"), Err(Abort::OutOfGas)));
        assert!(heap.meter.snapshot().gas_used >= 500);
    }

    #[test]
    fn deep_recursion_faults() {
        let mut heap = heap();
        let result = run(&mut heap, "f = fn(n) => f(n + 1); f(0)");
        assert!(matches!(result, Err(Abort::Fault(_))));
        assert!(!heap.meter.is_exhausted());
    }

    #[test]
    fn print_logs() {
        let mut heap = heap();
        let host = RecordingHost::default();
        heap.eval("print('hello', 1, [2, 3])", &host).unwrap();
        assert_eq!(host.logs.borrow().as_slice(), ["hello 1 2,3"]);
    }

    #[test]
    fn heap_moves_between_threads() {
        fn assert_send<T: Send>() {}
        assert_send::<Heap>();

        let mut heap = Heap::new(GasConfig::new(10_000, 1));
        heap.eval("double = fn(n) => n * 2", &RecordingHost::default())
            .unwrap();
        let result = std::thread::spawn(move || {
            heap.eval("double(21)", &RecordingHost::default())
                .map_err(|_| "eval failed")
        })
        .join()
        .unwrap()
        .unwrap();
        assert_eq!(result, WireValue::from(42));
    }
}
