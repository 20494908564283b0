use crate::chunk::Chunk;
use crate::value::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::rc::Rc;

/// Name of the method that runs when a class is called.
pub const INIT_NAME: &str = "init";

/// Signature of host functions callable from scripts: argument count and arguments.
pub type NativeFn = fn(usize, &[Value]) -> Value;

/// Heap-allocated runtime objects. Cloning clones the reference, never the object.
#[derive(Clone)]
pub enum Object {
    Function(Rc<Function>),
    Closure(Rc<Closure>),
    Class(Rc<RefCell<Class>>),
    Instance(Rc<RefCell<Instance>>),
    BoundMethod(Rc<BoundMethod>),
    Native(Rc<Native>),
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Object::Function(a), Object::Function(b)) => Rc::ptr_eq(a, b),
            (Object::Closure(a), Object::Closure(b)) => Rc::ptr_eq(a, b),
            (Object::Class(a), Object::Class(b)) => Rc::ptr_eq(a, b),
            (Object::Instance(a), Object::Instance(b)) => Rc::ptr_eq(a, b),
            (Object::BoundMethod(a), Object::BoundMethod(b)) => Rc::ptr_eq(a, b),
            (Object::Native(a), Object::Native(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Display for Object {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Object::Function(function) => write!(f, "{function}"),
            Object::Closure(closure) => write!(f, "{}", closure.function),
            Object::Class(class) => write!(f, "<class {}>", class.borrow().name),
            Object::Instance(instance) => {
                write!(f, "<instance of {}>", instance.borrow().class.borrow().name)
            }
            Object::BoundMethod(bound) => write!(f, "{}", bound.method.function),
            Object::Native(_) => write!(f, "<native fn>"),
        }
    }
}

// Objects can reference each other in cycles, so debug output stops at the object's name.
impl Debug for Object {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

#[derive(Debug, Default)]
pub struct Function {
    pub name: String,
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Chunk,
}

impl Function {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Name used in stack traces and disassembly.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "script"
        } else {
            &self.name
        }
    }
}

impl Display for Function {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "<script>")
        } else {
            write!(f, "<fn {}>", self.name)
        }
    }
}

#[derive(Debug)]
pub struct Closure {
    pub function: Rc<Function>,
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

impl Closure {
    pub fn new(function: Rc<Function>) -> Self {
        Self {
            function,
            upvalues: Vec::new(),
        }
    }
}

/// A captured variable. Open cells point at a live stack slot; closed ones own the value.
#[derive(Debug, Clone, PartialEq)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct Class {
    pub name: Rc<str>,
    pub methods: HashMap<Rc<str>, Rc<Closure>>,
}

impl Class {
    pub fn new(name: Rc<str>) -> Self {
        Self {
            name,
            methods: HashMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct Instance {
    pub class: Rc<RefCell<Class>>,
    pub fields: HashMap<Rc<str>, Value>,
}

impl Instance {
    pub fn new(class: Rc<RefCell<Class>>) -> Self {
        Self {
            class,
            fields: HashMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Rc<Closure>,
}

#[derive(Debug)]
pub struct Native {
    pub name: Rc<str>,
    pub function: NativeFn,
}
