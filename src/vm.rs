use crate::chunk::Opcode;
use crate::natives;
use crate::object::{
    BoundMethod, Class, Closure, Function, Instance, Native, NativeFn, Object, Upvalue,
    INIT_NAME,
};
use crate::value::Value;
use arrayvec::ArrayVec;
use log::{debug, error, trace};
use num_enum::TryFromPrimitiveError;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::io::Write;
use std::rc::Rc;
use thiserror::Error;

type VMResult<A> = Result<A, VMError>;

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug)]
struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    // Stack index of the callee, which is local slot zero.
    slots: usize,
}

#[derive(Debug)]
pub struct VM<'a, W: Write> {
    write: &'a mut W,
    stack: Vec<Value>,
    frames: ArrayVec<CallFrame, FRAMES_MAX>,
    globals: HashMap<Rc<str>, Value>,
    // Sorted by stack slot, topmost slot last.
    open_upvalues: Vec<(usize, Rc<RefCell<Upvalue>>)>,
}

impl<'a, W: Write> VM<'a, W> {
    pub fn new(write: &'a mut W) -> Self {
        let mut vm = Self {
            write,
            stack: Vec::with_capacity(STACK_MAX),
            frames: ArrayVec::new(),
            globals: HashMap::new(),
            open_upvalues: Vec::new(),
        };
        vm.define_native("clock", natives::clock);
        vm
    }

    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let name: Rc<str> = Rc::from(name);
        let native = Native {
            name: name.clone(),
            function,
        };
        self.globals
            .insert(name, Value::Obj(Object::Native(Rc::new(native))));
    }

    /// Runs a compiled script. Globals survive between calls; the stacks do not.
    pub fn interpret(&mut self, function: Function) -> Result<(), RuntimeFailure> {
        let closure = Rc::new(Closure::new(Rc::new(function)));
        let result = self
            .push(Value::Obj(Object::Closure(closure.clone())))
            .and_then(|_| self.call(closure, 0))
            .and_then(|_| self.run());
        result.map_err(|error| {
            let trace = self.stack_trace();
            debug!("Runtime error: {error}");
            self.reset_stack();
            RuntimeFailure { error, trace }
        })
    }

    fn run(&mut self) -> VMResult<()> {
        loop {
            if let Some(frame) = self.frames.last() {
                trace!("Stack: {stack:?}", stack = self.stack);
                trace!(
                    "{instruction}",
                    instruction = frame.closure.function.chunk.instruction_at(frame.ip)
                );
            }
            let opcode =
                Opcode::try_from(self.read_byte()?).map_err(IncorrectInvariantError::from)?;
            match opcode {
                Opcode::Constant => {
                    let constant = self.read_constant()?;
                    self.push(constant)?;
                }
                Opcode::Nil => self.push(Value::Nil)?,
                Opcode::True => self.push(Value::Boolean(true))?,
                Opcode::False => self.push(Value::Boolean(false))?,
                Opcode::Pop => {
                    let _ = self.pop()?;
                }
                Opcode::GetLocal => {
                    let slot = self.local_slot()?;
                    let value = self
                        .stack
                        .get(slot)
                        .cloned()
                        .ok_or(IncorrectInvariantError::StackUnderflow)?;
                    self.push(value)?;
                }
                Opcode::SetLocal => {
                    let slot = self.local_slot()?;
                    let value = self.peek(0)?.clone();
                    let local = self
                        .stack
                        .get_mut(slot)
                        .ok_or(IncorrectInvariantError::StackUnderflow)?;
                    *local = value;
                }
                Opcode::GetGlobal => {
                    let name = self.read_string()?;
                    match self.globals.get(&name) {
                        Some(value) => {
                            let value = value.clone();
                            self.push(value)?
                        }
                        None => return Err(RuntimeError::UndefinedVariable(name).into()),
                    }
                }
                Opcode::DefineGlobal => {
                    let name = self.read_string()?;
                    let value = self.pop()?;
                    self.globals.insert(name, value);
                }
                Opcode::SetGlobal => {
                    let name = self.read_string()?;
                    let value = self.peek(0)?.clone();
                    match self.globals.get_mut(&name) {
                        Some(global) => *global = value,
                        None => return Err(RuntimeError::UndefinedVariable(name).into()),
                    }
                }
                Opcode::GetUpvalue => {
                    let upvalue = self.upvalue()?;
                    let value = match &*upvalue.borrow() {
                        Upvalue::Open(slot) => self
                            .stack
                            .get(*slot)
                            .cloned()
                            .ok_or(IncorrectInvariantError::StackUnderflow)?,
                        Upvalue::Closed(value) => value.clone(),
                    };
                    self.push(value)?;
                }
                Opcode::SetUpvalue => {
                    let upvalue = self.upvalue()?;
                    let value = self.peek(0)?.clone();
                    match &mut *upvalue.borrow_mut() {
                        Upvalue::Open(slot) => {
                            let local = self
                                .stack
                                .get_mut(*slot)
                                .ok_or(IncorrectInvariantError::StackUnderflow)?;
                            *local = value;
                        }
                        Upvalue::Closed(closed) => *closed = value,
                    };
                }
                Opcode::GetProperty => {
                    let Value::Obj(Object::Instance(instance)) = self.peek(0)?.clone() else {
                        return Err(RuntimeError::OnlyInstancesHaveProperties.into());
                    };
                    let name = self.read_string()?;
                    let field = instance.borrow().fields.get(&name).cloned();
                    match field {
                        Some(value) => {
                            self.pop()?;
                            self.push(value)?;
                        }
                        None => {
                            let class = instance.borrow().class.clone();
                            self.bind_method(&class, name)?;
                        }
                    }
                }
                Opcode::SetProperty => {
                    let Value::Obj(Object::Instance(instance)) = self.peek(1)?.clone() else {
                        return Err(RuntimeError::OnlyInstancesHaveFields.into());
                    };
                    let name = self.read_string()?;
                    let value = self.pop()?;
                    instance.borrow_mut().fields.insert(name, value.clone());
                    self.pop()?;
                    self.push(value)?;
                }
                Opcode::GetSuper => {
                    let name = self.read_string()?;
                    let superclass = self.pop_class()?;
                    self.bind_method(&superclass, name)?;
                }
                Opcode::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Boolean(a == b))?
                }
                Opcode::Greater => self.binary_op(|a, b| a > b, Value::Boolean)?,
                Opcode::Less => self.binary_op(|a, b| a < b, Value::Boolean)?,
                Opcode::Add => match (self.peek(1)?, self.peek(0)?) {
                    (Value::Number(_), Value::Number(_)) => {
                        self.binary_op(|a, b| a + b, Value::Number)?
                    }
                    (Value::String(_), Value::String(_)) => self.concatenate()?,
                    _ => return Err(RuntimeError::OperandsMustBeNumbers.into()),
                },
                Opcode::Subtract => self.binary_op(|a, b| a - b, Value::Number)?,
                Opcode::Multiply => self.binary_op(|a, b| a * b, Value::Number)?,
                Opcode::Divide => self.binary_op(|a, b| a / b, Value::Number)?,
                Opcode::Not => {
                    let value = self.pop()?;
                    self.push(Value::Boolean(value.is_falsey()))?
                }
                Opcode::Negate => {
                    let value = match self.pop()? {
                        Value::Number(num) => Value::Number(-num),
                        _ => return Err(RuntimeError::OperandMustBeNumber.into()),
                    };
                    self.push(value)?;
                }
                Opcode::Print => {
                    let value = self.pop()?;
                    self.print_value(value);
                }
                Opcode::Assert => match self.pop()? {
                    Value::Boolean(true) => {}
                    Value::Boolean(false) => return Err(RuntimeError::AssertionFailed.into()),
                    _ => return Err(RuntimeError::AssertionNotBoolean.into()),
                },
                Opcode::Jump => {
                    let offset = self.read_short()?;
                    self.frame_mut()?.ip += offset;
                }
                Opcode::JumpIfFalse => {
                    let offset = self.read_short()?;
                    if self.peek(0)?.is_falsey() {
                        self.frame_mut()?.ip += offset;
                    }
                }
                Opcode::Loop => {
                    let offset = self.read_short()?;
                    let frame = self.frame_mut()?;
                    frame.ip = frame.ip.checked_sub(offset).ok_or(
                        IncorrectInvariantError::InvalidInstructionPointer { pointer: frame.ip },
                    )?;
                }
                Opcode::Call => {
                    let arg_count = self.read_byte()? as usize;
                    let callee = self.peek(arg_count)?.clone();
                    self.call_value(callee, arg_count)?;
                }
                Opcode::Invoke => {
                    let name = self.read_string()?;
                    let arg_count = self.read_byte()? as usize;
                    self.invoke(name, arg_count)?;
                }
                Opcode::SuperInvoke => {
                    let name = self.read_string()?;
                    let arg_count = self.read_byte()? as usize;
                    let superclass = self.pop_class()?;
                    self.invoke_from_class(&superclass, &name, arg_count)?;
                }
                Opcode::Closure => {
                    let Value::Obj(Object::Function(function)) = self.read_constant()? else {
                        return Err(IncorrectInvariantError::InvalidTypes.into());
                    };
                    let mut closure = Closure::new(function);
                    for _ in 0..closure.function.upvalue_count {
                        let is_local = self.read_byte()? == 1;
                        let index = self.read_byte()? as usize;
                        let upvalue = if is_local {
                            let slot = self.frame()?.slots + index;
                            self.capture_upvalue(slot)
                        } else {
                            self.frame()?
                                .closure
                                .upvalues
                                .get(index)
                                .cloned()
                                .ok_or(IncorrectInvariantError::InvalidUpvalue { index })?
                        };
                        closure.upvalues.push(upvalue);
                    }
                    self.push(Value::Obj(Object::Closure(Rc::new(closure))))?;
                }
                Opcode::CloseUpvalue => {
                    let top = self
                        .stack
                        .len()
                        .checked_sub(1)
                        .ok_or(IncorrectInvariantError::StackUnderflow)?;
                    self.close_upvalues(top)?;
                    self.pop()?;
                }
                Opcode::Return => {
                    let result = self.pop()?;
                    let frame = self
                        .frames
                        .pop()
                        .ok_or(IncorrectInvariantError::MissingFrame)?;
                    self.close_upvalues(frame.slots)?;
                    self.stack.truncate(frame.slots);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result)?;
                }
                Opcode::Class => {
                    let name = self.read_string()?;
                    let class = Class::new(name);
                    self.push(Value::Obj(Object::Class(Rc::new(RefCell::new(class)))))?;
                }
                Opcode::Inherit => {
                    let Value::Obj(Object::Class(superclass)) = self.peek(1)?.clone() else {
                        return Err(RuntimeError::SuperclassMustBeClass.into());
                    };
                    let subclass = self.pop_class()?;
                    let methods = superclass.borrow().methods.clone();
                    subclass.borrow_mut().methods.extend(methods);
                }
                Opcode::Method => {
                    let name = self.read_string()?;
                    let Value::Obj(Object::Closure(method)) = self.pop()? else {
                        return Err(IncorrectInvariantError::InvalidTypes.into());
                    };
                    let Value::Obj(Object::Class(class)) = self.peek(0)? else {
                        return Err(IncorrectInvariantError::InvalidTypes.into());
                    };
                    class.borrow_mut().methods.insert(name, method);
                }
            }
        }
    }

    fn print_value(&mut self, value: Value) {
        if let Err(e) = writeln!(self.write, "{value}") {
            error!("Error writing output value: {e}")
        }
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> VMResult<()> {
        let callee_slot = self.callee_slot(arg_count)?;
        match callee {
            Value::Obj(Object::Closure(closure)) => self.call(closure, arg_count),
            Value::Obj(Object::BoundMethod(bound)) => {
                self.stack[callee_slot] = bound.receiver.clone();
                self.call(bound.method.clone(), arg_count)
            }
            Value::Obj(Object::Class(class)) => {
                let instance = Instance::new(class.clone());
                self.stack[callee_slot] =
                    Value::Obj(Object::Instance(Rc::new(RefCell::new(instance))));
                let initializer = class.borrow().methods.get(INIT_NAME).cloned();
                match initializer {
                    Some(initializer) => self.call(initializer, arg_count),
                    None if arg_count != 0 => Err(RuntimeError::ArityMismatch {
                        expected: 0,
                        got: arg_count,
                    }
                    .into()),
                    None => Ok(()),
                }
            }
            Value::Obj(Object::Native(native)) => {
                let result = (native.function)(arg_count, &self.stack[callee_slot + 1..]);
                self.stack.truncate(callee_slot);
                self.push(result)
            }
            _ => Err(RuntimeError::NotCallable.into()),
        }
    }

    fn call(&mut self, closure: Rc<Closure>, arg_count: usize) -> VMResult<()> {
        if arg_count != closure.function.arity {
            return Err(RuntimeError::ArityMismatch {
                expected: closure.function.arity,
                got: arg_count,
            }
            .into());
        }
        let slots = self.callee_slot(arg_count)?;
        self.frames
            .try_push(CallFrame {
                closure,
                ip: 0,
                slots,
            })
            .map_err(|_| RuntimeError::StackOverflow.into())
    }

    fn invoke(&mut self, name: Rc<str>, arg_count: usize) -> VMResult<()> {
        let Value::Obj(Object::Instance(instance)) = self.peek(arg_count)?.clone() else {
            return Err(RuntimeError::OnlyInstancesHaveMethods.into());
        };
        let field = instance.borrow().fields.get(&name).cloned();
        if let Some(value) = field {
            let callee_slot = self.callee_slot(arg_count)?;
            self.stack[callee_slot] = value.clone();
            return self.call_value(value, arg_count);
        }
        let class = instance.borrow().class.clone();
        self.invoke_from_class(&class, &name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: &Rc<RefCell<Class>>,
        name: &Rc<str>,
        arg_count: usize,
    ) -> VMResult<()> {
        let method = class
            .borrow()
            .methods
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UndefinedProperty(name.clone()))?;
        self.call(method, arg_count)
    }

    /// Replaces the receiver on top of the stack with its method `name` bound to it.
    fn bind_method(&mut self, class: &Rc<RefCell<Class>>, name: Rc<str>) -> VMResult<()> {
        let method = class
            .borrow()
            .methods
            .get(&name)
            .cloned()
            .ok_or(RuntimeError::UndefinedProperty(name))?;
        let receiver = self.pop()?;
        let bound = BoundMethod { receiver, method };
        self.push(Value::Obj(Object::BoundMethod(Rc::new(bound))))
    }

    fn capture_upvalue(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        let idx = self.open_upvalues.partition_point(|(s, _)| *s < slot);
        if let Some((existing, upvalue)) = self.open_upvalues.get(idx) {
            if *existing == slot {
                return upvalue.clone();
            }
        }
        let upvalue = Rc::new(RefCell::new(Upvalue::Open(slot)));
        self.open_upvalues.insert(idx, (slot, upvalue.clone()));
        upvalue
    }

    /// Closes every open upvalue pointing at `last` or above.
    fn close_upvalues(&mut self, last: usize) -> VMResult<()> {
        let idx = self.open_upvalues.partition_point(|(s, _)| *s < last);
        for (slot, upvalue) in self.open_upvalues.split_off(idx) {
            let value = self
                .stack
                .get(slot)
                .cloned()
                .ok_or(IncorrectInvariantError::StackUnderflow)?;
            *upvalue.borrow_mut() = Upvalue::Closed(value);
        }
        Ok(())
    }

    fn stack_trace(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let function = &frame.closure.function;
                let line = function
                    .chunk
                    .line_at(frame.ip.saturating_sub(1))
                    .unwrap_or_default();
                if function.name.is_empty() {
                    format!("[line {line}] in script")
                } else {
                    format!("[line {line}] in {}()", function.name)
                }
            })
            .collect()
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    fn frame(&self) -> VMResult<&CallFrame> {
        self.frames
            .last()
            .ok_or_else(|| IncorrectInvariantError::MissingFrame.into())
    }

    fn frame_mut(&mut self) -> VMResult<&mut CallFrame> {
        self.frames
            .last_mut()
            .ok_or_else(|| IncorrectInvariantError::MissingFrame.into())
    }

    fn read_byte(&mut self) -> VMResult<u8> {
        let frame = self.frame_mut()?;
        let byte = frame.closure.function.chunk.get(frame.ip).copied().ok_or(
            IncorrectInvariantError::InvalidInstructionPointer { pointer: frame.ip },
        )?;
        frame.ip += 1;
        Ok(byte)
    }

    fn read_short(&mut self) -> VMResult<usize> {
        let high = self.read_byte()?;
        let low = self.read_byte()?;
        Ok(u16::from_be_bytes([high, low]) as usize)
    }

    fn read_constant(&mut self) -> VMResult<Value> {
        let index = self.read_byte()?;
        self.frame()?
            .closure
            .function
            .chunk
            .get_constant(index)
            .cloned()
            .ok_or_else(|| IncorrectInvariantError::InvalidConstant { index }.into())
    }

    fn read_string(&mut self) -> VMResult<Rc<str>> {
        match self.read_constant()? {
            Value::String(s) => Ok(s),
            _ => Err(IncorrectInvariantError::InvalidTypes.into()),
        }
    }

    fn local_slot(&mut self) -> VMResult<usize> {
        let slot = self.read_byte()? as usize;
        Ok(self.frame()?.slots + slot)
    }

    fn upvalue(&mut self) -> VMResult<Rc<RefCell<Upvalue>>> {
        let index = self.read_byte()? as usize;
        self.frame()?
            .closure
            .upvalues
            .get(index)
            .cloned()
            .ok_or_else(|| IncorrectInvariantError::InvalidUpvalue { index }.into())
    }

    fn callee_slot(&self, arg_count: usize) -> VMResult<usize> {
        self.stack
            .len()
            .checked_sub(arg_count + 1)
            .ok_or_else(|| IncorrectInvariantError::StackUnderflow.into())
    }

    fn push(&mut self, value: Value) -> VMResult<()> {
        if self.stack.len() >= STACK_MAX {
            return Err(RuntimeError::StackOverflow.into());
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> VMResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| IncorrectInvariantError::StackUnderflow.into())
    }

    fn pop_class(&mut self) -> VMResult<Rc<RefCell<Class>>> {
        match self.pop()? {
            Value::Obj(Object::Class(class)) => Ok(class),
            _ => Err(IncorrectInvariantError::InvalidTypes.into()),
        }
    }

    fn peek(&self, distance: usize) -> VMResult<&Value> {
        self.stack
            .len()
            .checked_sub(distance + 1)
            .and_then(|idx| self.stack.get(idx))
            .ok_or_else(|| IncorrectInvariantError::StackUnderflow.into())
    }

    fn binary_op<T>(&mut self, f: impl Fn(f64, f64) -> T, v: fn(T) -> Value) -> VMResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;

        let res = match (a, b) {
            (Value::Number(a), Value::Number(b)) => v(f(a, b)),
            (_, _) => return Err(RuntimeError::OperandsMustBeNumbers.into()),
        };
        self.push(res)
    }

    fn concatenate(&mut self) -> VMResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let (Value::String(a), Value::String(b)) = (a, b) else {
            return Err(IncorrectInvariantError::InvalidTypes.into());
        };
        let mut joined = String::with_capacity(a.len() + b.len());
        joined.push_str(&a);
        joined.push_str(&b);
        self.push(Value::String(Rc::from(joined)))
    }
}

/// A runtime error together with the call stack at the point it was raised.
#[derive(Error, Debug, Clone)]
pub struct RuntimeFailure {
    error: VMError,
    trace: Vec<String>,
}

impl RuntimeFailure {
    pub fn error(&self) -> &VMError {
        &self.error
    }

    /// One line per active frame, innermost first.
    pub fn trace(&self) -> &[String] {
        &self.trace
    }
}

impl Display for RuntimeFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)?;
        for line in self.trace.iter() {
            write!(f, "\n{line}")?;
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone)]
pub enum VMError {
    #[error("Internal error: {0}")]
    IncorrectInvariantError(#[from] IncorrectInvariantError),
    #[error(transparent)]
    RuntimeError(#[from] RuntimeError),
}

#[derive(Error, Debug, Clone)]
pub enum IncorrectInvariantError {
    #[error("invalid opcode? {0}")]
    InvalidOpcode(#[from] TryFromPrimitiveError<Opcode>),
    #[error("invalid instruction pointer {pointer}")]
    InvalidInstructionPointer { pointer: usize },
    #[error("invalid constant? {index}")]
    InvalidConstant { index: u8 },
    #[error("invalid upvalue? {index}")]
    InvalidUpvalue { index: usize },
    #[error("stack underflow?")]
    StackUnderflow,
    #[error("no active call frame")]
    MissingFrame,
    #[error("invalid compile time types")]
    InvalidTypes,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Operand must be a number.")]
    OperandMustBeNumber,
    #[error("Operands must be numbers.")]
    OperandsMustBeNumbers,
    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(Rc<str>),
    #[error("Undefined property '{0}'.")]
    UndefinedProperty(Rc<str>),
    #[error("Only instances have properties.")]
    OnlyInstancesHaveProperties,
    #[error("Only instances have fields.")]
    OnlyInstancesHaveFields,
    #[error("Only instances have methods.")]
    OnlyInstancesHaveMethods,
    #[error("Superclass must be a class.")]
    SuperclassMustBeClass,
    #[error("Expected {expected} arguments but got {got}.")]
    ArityMismatch { expected: usize, got: usize },
    #[error("Can only call functions and classes.")]
    NotCallable,
    #[error("Stack overflow.")]
    StackOverflow,
    #[error("Assertion failed.")]
    AssertionFailed,
    #[error("Assertion operand must be a boolean.")]
    AssertionNotBoolean,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    fn run_source(vm: &mut VM<'_, Vec<u8>>, source: &str) -> Result<(), RuntimeFailure> {
        vm.interpret(compile(source).unwrap())
    }

    fn runtime_error(failure: &RuntimeFailure) -> &RuntimeError {
        match failure.error() {
            VMError::RuntimeError(e) => e,
            e => panic!("unexpected internal error {e}"),
        }
    }

    #[test]
    fn stack_is_empty_after_run() {
        let mut out = Vec::new();
        let mut vm = VM::new(&mut out);
        run_source(
            &mut vm,
            "fun add(a, b) { return a + b; } var x = add(1, 2); { var y = x; print y; }",
        )
        .unwrap();
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        assert!(vm.open_upvalues.is_empty());
        drop(vm);
        assert_eq!(String::from_utf8(out).unwrap(), "3\n");
    }

    #[test]
    fn globals_persist_between_runs() {
        let mut out = Vec::new();
        let mut vm = VM::new(&mut out);
        run_source(&mut vm, "var a = 1;").unwrap();
        run_source(&mut vm, "print a + 1;").unwrap();
        drop(vm);
        assert_eq!(String::from_utf8(out).unwrap(), "2\n");
    }

    #[test]
    fn unbounded_recursion_overflows() {
        let mut out = Vec::new();
        let mut vm = VM::new(&mut out);
        let failure = run_source(&mut vm, "fun f() { f(); }\nf();").unwrap_err();
        assert_eq!(runtime_error(&failure), &RuntimeError::StackOverflow);
        assert_eq!(failure.trace().len(), FRAMES_MAX);
        assert_eq!(failure.trace().first().unwrap(), "[line 1] in f()");
        assert_eq!(failure.trace().last().unwrap(), "[line 2] in script");
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn trace_lists_frames_innermost_first() {
        let mut out = Vec::new();
        let mut vm = VM::new(&mut out);
        let source = "fun a() {\n  return -nil;\n}\nfun b() { a(); }\nb();";
        let failure = run_source(&mut vm, source).unwrap_err();
        assert_eq!(
            failure.to_string(),
            "Operand must be a number.\n[line 2] in a()\n[line 4] in b()\n[line 5] in script"
        );
    }

    #[test]
    fn vm_is_usable_after_runtime_error() {
        let mut out = Vec::new();
        let mut vm = VM::new(&mut out);
        assert!(run_source(&mut vm, "print undefined;").is_err());
        run_source(&mut vm, "print 1;").unwrap();
        drop(vm);
        assert_eq!(String::from_utf8(out).unwrap(), "1\n");
    }

    fn count_args(arg_count: usize, args: &[Value]) -> Value {
        assert_eq!(arg_count, args.len());
        Value::Number(arg_count as f64)
    }

    #[test]
    fn natives_receive_their_arguments() {
        let mut out = Vec::new();
        let mut vm = VM::new(&mut out);
        vm.define_native("count", count_args);
        run_source(&mut vm, "print count(1, \"a\", nil); print count;").unwrap();
        assert!(vm.stack.is_empty());
        drop(vm);
        assert_eq!(String::from_utf8(out).unwrap(), "3\n<native fn>\n");
    }

    #[test]
    fn clock_is_defined() {
        let mut out = Vec::new();
        let mut vm = VM::new(&mut out);
        run_source(&mut vm, "assert clock() > 0;").unwrap();
    }

    #[test]
    fn open_upvalues_are_shared_and_closed() {
        let mut out = Vec::new();
        let mut vm = VM::new(&mut out);
        let source = "
            var get; var set;
            {
              var x = 1;
              fun g() { return x; }
              fun s(v) { x = v; }
              get = g; set = s;
              set(5);
              print x;
            }
            print get();
            set(7);
            print get();";
        run_source(&mut vm, source).unwrap();
        assert!(vm.open_upvalues.is_empty());
        drop(vm);
        assert_eq!(String::from_utf8(out).unwrap(), "5\n5\n7\n");
    }
}
