//! Finding operations inside the host, and changing what they do.
//!
//! Modifications are described by `registry::PatchDescriptor`s and installed by the
//! `engine::PatchEngine`. Wrapping modifications (before, after, replace) are dispatched through
//! a `engine::HookTable` whenever the host calls an intercepted operation; rewrites change the
//! operation's body using the `matcher`.

pub mod asm;
pub mod engine;
pub mod image;
pub mod matcher;
pub mod registry;
pub mod resolve;

use std::{collections::BTreeMap, fmt::Display};

/// Identifies an operation by its owning type, its name and (optionally) its parameter types.
/// Without parameter types the signature matches every overload, so it only resolves when the
/// member is not overloaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature {
    pub owner: String,
    pub member: String,
    pub params: Option<Vec<String>>,
}

impl Signature {
    pub fn new(owner: &str, member: &str, params: &[&str]) -> Signature {
        Signature {
            owner: owner.to_string(),
            member: member.to_string(),
            params: Some(params.iter().map(|p| p.to_string()).collect()),
        }
    }

    pub fn any_overload(owner: &str, member: &str) -> Signature {
        Signature {
            owner: owner.to_string(),
            member: member.to_string(),
            params: None,
        }
    }

    /// The `Owner::member` symbol that call instructions use to refer to this operation.
    pub fn symbol(&self) -> String {
        format!("{}::{}", self.owner, self.member)
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.params {
            Some(params) => write!(f, "{}::{}({})", self.owner, self.member, params.join(", ")),
            None => write!(f, "{}::{}", self.owner, self.member),
        }
    }
}

/// An operation's identity inside one loaded host image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

/// A resolved target. Handles never change once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetHandle {
    pub method: MethodId,
    pub signature: Signature,
}

/// A value passing through an intercepted call.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f32),
    Str(String),

    /// The instance the operation was called on.
    This,
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(int) => Some(*int),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Value::Float(float) => Some(*float),
            Value::Int(int) => Some(*int as f32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(string) => Some(string),
            _ => None,
        }
    }

    /// Whether a conditional branch on this value is taken.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Unit => false,
            Value::Bool(b) => *b,
            Value::Int(int) => *int != 0,
            Value::Float(float) => *float != 0.0,
            Value::Str(_) | Value::This => true,
        }
    }
}

/// Everything a hook can see and change about one call: the arguments, the fields of the
/// instance and the return value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallFrame {
    pub args: Vec<Value>,
    pub fields: BTreeMap<String, Value>,
    pub result: Value,
}

impl Default for Value {
    fn default() -> Self {
        Value::Unit
    }
}

impl CallFrame {
    pub fn new(args: Vec<Value>) -> CallFrame {
        CallFrame {
            args,
            ..Default::default()
        }
    }

    pub fn with_field(mut self, name: &str, value: Value) -> CallFrame {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set_field(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn float_field(&self, name: &str) -> Option<f32> {
        self.field(name).and_then(Value::as_float)
    }
}

/// What a before-hook wants to happen to the original operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,

    /// Don't run the original (or its replacement). After-hooks still run.
    Skip,
}
