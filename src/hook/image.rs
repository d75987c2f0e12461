//! The host's loaded code, as the patch engine sees it.
//!
//! `HostImage` is what an integration implements for a real host. `InMemoryImage` is a complete
//! host of its own: it stores bodies in the instruction representation and can execute them,
//! routing calls to attached operations through a `HookTable`. Gameplay patches are exercised
//! against it.

use std::{cell::Cell, collections::BTreeMap, fmt::Display};

use super::{
    asm::{InstructionStream, Label, OpCode, Operand},
    engine::HookTable,
    CallFrame, MethodId, Signature, Value,
};
use crate::settings::Configuration;

/// The host refused an operation on its code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    pub method: MethodId,
    pub reason: String,
}

impl Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "host refused change to method {}: {}", self.method.0, self.reason)
    }
}

impl std::error::Error for HostError {}

pub trait HostImage {
    /// Identifies the build of the host. Resolved handles are only valid for the same version.
    fn version(&self) -> &str;

    /// Every operation with this owner and name, with its parameter types.
    fn lookup(&self, owner: &str, member: &str) -> Vec<(MethodId, Vec<String>)>;

    fn read_body(&self, method: MethodId) -> Result<InstructionStream, HostError>;

    fn write_body(&mut self, method: MethodId, body: InstructionStream) -> Result<(), HostError>;

    /// Starts routing calls to `method` through the hook table.
    fn attach(&mut self, method: MethodId) -> Result<(), HostError>;

    /// Stops routing calls to `method` through the hook table.
    fn detach(&mut self, method: MethodId) -> Result<(), HostError>;
}

struct HostMethod {
    signature: Signature,
    has_this: bool,
    body: InstructionStream,
    attached: bool,
}

impl HostMethod {
    fn arity(&self) -> usize {
        self.signature.params.as_ref().map_or(0, Vec::len) + self.has_this as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecError {
    UnknownMethod(String),
    StackUnderflow { method: String, position: usize },
    BadOperand { method: String, position: usize },
    TypeMismatch { method: String, position: usize },
    UnknownLabel(Label),

    /// The body ran for too long; most likely a loop that never exits.
    StepLimit(String),
}

impl Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::UnknownMethod(symbol) => write!(f, "no method {symbol}"),
            ExecError::StackUnderflow { method, position } => {
                write!(f, "{method}: stack underflow at {position}")
            }
            ExecError::BadOperand { method, position } => {
                write!(f, "{method}: bad operand at {position}")
            }
            ExecError::TypeMismatch { method, position } => {
                write!(f, "{method}: type mismatch at {position}")
            }
            ExecError::UnknownLabel(label) => write!(f, "branch to unknown label {label}"),
            ExecError::StepLimit(method) => write!(f, "{method}: step limit reached"),
        }
    }
}

impl std::error::Error for ExecError {}

/// An executable host held in memory.
pub struct InMemoryImage {
    version: String,
    methods: Vec<HostMethod>,
    lookups: Cell<usize>,
}

impl InMemoryImage {
    const STEP_LIMIT: usize = 100_000;

    pub fn new(version: &str) -> InMemoryImage {
        InMemoryImage {
            version: version.to_string(),
            methods: vec![],
            lookups: Cell::new(0),
        }
    }

    fn add(&mut self, signature: Signature, has_this: bool, body: InstructionStream) -> MethodId {
        let id = MethodId(self.methods.len() as u32);

        self.methods.push(HostMethod {
            signature,
            has_this,
            body,
            attached: false,
        });

        id
    }

    /// Adds a static operation. `signature` must list its parameter types.
    pub fn add_static(&mut self, signature: Signature, body: InstructionStream) -> MethodId {
        self.add(signature, false, body)
    }

    /// Adds an instance operation. Argument 0 is the instance.
    pub fn add_instance(&mut self, signature: Signature, body: InstructionStream) -> MethodId {
        self.add(signature, true, body)
    }

    pub fn body(&self, method: MethodId) -> Option<&InstructionStream> {
        self.methods.get(method.0 as usize).map(|m| &m.body)
    }

    pub fn is_attached(&self, method: MethodId) -> bool {
        self.methods
            .get(method.0 as usize)
            .map_or(false, |m| m.attached)
    }

    pub fn attached_count(&self) -> usize {
        self.methods.iter().filter(|m| m.attached).count()
    }

    /// How many times `lookup` has been called.
    pub fn lookup_count(&self) -> usize {
        self.lookups.get()
    }

    fn find_symbol(&self, symbol: &str) -> Option<MethodId> {
        self.methods
            .iter()
            .position(|m| m.signature.symbol() == symbol)
            .map(|index| MethodId(index as u32))
    }

    fn method(&self, method: MethodId) -> Result<&HostMethod, HostError> {
        self.methods.get(method.0 as usize).ok_or_else(|| HostError {
            method,
            reason: "no such method".to_string(),
        })
    }

    fn method_mut(&mut self, method: MethodId) -> Result<&mut HostMethod, HostError> {
        self.methods
            .get_mut(method.0 as usize)
            .ok_or_else(|| HostError {
                method,
                reason: "no such method".to_string(),
            })
    }

    /// Calls `method` the way the host would: through the hook table if it is attached,
    /// directly otherwise.
    pub fn call(
        &self,
        method: MethodId,
        hooks: &HookTable,
        config: &Configuration,
        frame: &mut CallFrame,
    ) -> Result<(), ExecError> {
        let entry = self
            .methods
            .get(method.0 as usize)
            .ok_or_else(|| ExecError::UnknownMethod(format!("#{}", method.0)))?;

        if entry.attached {
            hooks.invoke(method, config, frame, |frame| {
                self.execute(method, hooks, config, frame)
            })
        } else {
            self.execute(method, hooks, config, frame)
        }
    }

    /// Looks `symbol` up and calls it. Convenient for callers that only know names.
    pub fn call_symbol(
        &self,
        symbol: &str,
        hooks: &HookTable,
        config: &Configuration,
        frame: &mut CallFrame,
    ) -> Result<(), ExecError> {
        let method = self
            .find_symbol(symbol)
            .ok_or_else(|| ExecError::UnknownMethod(symbol.to_string()))?;

        self.call(method, hooks, config, frame)
    }

    /// Runs the body of `method` on `frame`, ignoring hooks on `method` itself.
    fn execute(
        &self,
        method: MethodId,
        hooks: &HookTable,
        config: &Configuration,
        frame: &mut CallFrame,
    ) -> Result<(), ExecError> {
        let entry = &self.methods[method.0 as usize];
        let name = entry.signature.symbol();
        let instrs = entry.body.instructions();

        let targets: BTreeMap<Label, usize> = instrs
            .iter()
            .enumerate()
            .flat_map(|(index, instr)| instr.labels.iter().map(move |l| (*l, index)))
            .collect();

        let mut stack: Vec<Value> = vec![];
        let mut locals: Vec<Value> = vec![];
        let mut position = 0;

        for _ in 0..Self::STEP_LIMIT {
            let Some(instr) = instrs.get(position) else {
                // Running off the end behaves like `ret`.
                return Ok(());
            };

            let underflow = || ExecError::StackUnderflow {
                method: name.clone(),
                position,
            };

            let bad_operand = || ExecError::BadOperand {
                method: name.clone(),
                position,
            };

            let mismatch = || ExecError::TypeMismatch {
                method: name.clone(),
                position,
            };

            let mut next = position + 1;

            match (instr.opcode, &instr.operand) {
                (OpCode::Nop, _) => {}

                (OpCode::LdArg, Operand::Index(index)) => {
                    stack.push(frame.args.get(*index as usize).cloned().ok_or_else(bad_operand)?)
                }

                (OpCode::StArg, Operand::Index(index)) => {
                    let value = stack.pop().ok_or_else(underflow)?;
                    *frame
                        .args
                        .get_mut(*index as usize)
                        .ok_or_else(bad_operand)? = value;
                }

                (OpCode::LdLoc, Operand::Index(index)) => {
                    stack.push(locals.get(*index as usize).cloned().unwrap_or_default())
                }

                (OpCode::StLoc, Operand::Index(index)) => {
                    let value = stack.pop().ok_or_else(underflow)?;
                    let index = *index as usize;

                    if locals.len() <= index {
                        locals.resize(index + 1, Value::Unit);
                    }

                    locals[index] = value;
                }

                (OpCode::LdcI4, Operand::Int(value)) => stack.push(Value::Int(*value)),
                (OpCode::LdcR4, Operand::Float(value)) => stack.push(Value::Float(*value)),
                (OpCode::LdStr, Operand::Str(value)) => stack.push(Value::Str(value.clone())),

                (OpCode::LdFld, Operand::Field(field)) => {
                    if stack.pop().ok_or_else(underflow)? != Value::This {
                        return Err(mismatch());
                    }

                    stack.push(frame.fields.get(field).cloned().unwrap_or_default());
                }

                (OpCode::StFld, Operand::Field(field)) => {
                    let value = stack.pop().ok_or_else(underflow)?;

                    if stack.pop().ok_or_else(underflow)? != Value::This {
                        return Err(mismatch());
                    }

                    frame.fields.insert(field.clone(), value);
                }

                (OpCode::Call | OpCode::CallVirt, Operand::Method(symbol)) => {
                    let callee = self
                        .find_symbol(symbol)
                        .ok_or_else(|| ExecError::UnknownMethod(symbol.clone()))?;

                    let callee_entry = &self.methods[callee.0 as usize];
                    let arity = callee_entry.arity();

                    if stack.len() < arity {
                        return Err(underflow());
                    }

                    let args = stack.split_off(stack.len() - arity);

                    let mut inner = CallFrame {
                        args,
                        fields: frame.fields.clone(),
                        result: Value::Unit,
                    };

                    self.call(callee, hooks, config, &mut inner)?;

                    // Every instance in this host is the same object, so field writes carry over.
                    if callee_entry.has_this {
                        frame.fields = inner.fields;
                    }

                    if inner.result != Value::Unit {
                        stack.push(inner.result);
                    }
                }

                (OpCode::Ret, _) => {
                    frame.result = stack.pop().unwrap_or_default();
                    return Ok(());
                }

                (OpCode::Br, Operand::Label(label)) => {
                    next = *targets.get(label).ok_or(ExecError::UnknownLabel(*label))?;
                }

                (OpCode::BrTrue | OpCode::BrFalse, Operand::Label(label)) => {
                    let value = stack.pop().ok_or_else(underflow)?;

                    if value.is_truthy() == (instr.opcode == OpCode::BrTrue) {
                        next = *targets.get(label).ok_or(ExecError::UnknownLabel(*label))?;
                    }
                }

                (
                    OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Ceq
                    | OpCode::Clt | OpCode::Cgt,
                    _,
                ) => {
                    let rhs = stack.pop().ok_or_else(underflow)?;
                    let lhs = stack.pop().ok_or_else(underflow)?;
                    stack.push(binary(instr.opcode, &lhs, &rhs).ok_or_else(mismatch)?);
                }

                (OpCode::Pop, _) => {
                    stack.pop().ok_or_else(underflow)?;
                }

                (OpCode::Dup, _) => {
                    let top = stack.last().cloned().ok_or_else(underflow)?;
                    stack.push(top);
                }

                _ => return Err(bad_operand()),
            }

            position = next;
        }

        Err(ExecError::StepLimit(name))
    }
}

fn binary(opcode: OpCode, lhs: &Value, rhs: &Value) -> Option<Value> {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        let (a, b) = (*a, *b);

        return Some(match opcode {
            OpCode::Add => Value::Int(a.wrapping_add(b)),
            OpCode::Sub => Value::Int(a.wrapping_sub(b)),
            OpCode::Mul => Value::Int(a.wrapping_mul(b)),
            OpCode::Div => Value::Int(a.checked_div(b)?),
            OpCode::Ceq => Value::Bool(a == b),
            OpCode::Clt => Value::Bool(a < b),
            OpCode::Cgt => Value::Bool(a > b),
            _ => return None,
        });
    }

    let (a, b) = (lhs.as_float()?, rhs.as_float()?);

    Some(match opcode {
        OpCode::Add => Value::Float(a + b),
        OpCode::Sub => Value::Float(a - b),
        OpCode::Mul => Value::Float(a * b),
        OpCode::Div => Value::Float(a / b),
        OpCode::Ceq => Value::Bool(a == b),
        OpCode::Clt => Value::Bool(a < b),
        OpCode::Cgt => Value::Bool(a > b),
        _ => return None,
    })
}

impl HostImage for InMemoryImage {
    fn version(&self) -> &str {
        &self.version
    }

    fn lookup(&self, owner: &str, member: &str) -> Vec<(MethodId, Vec<String>)> {
        self.lookups.set(self.lookups.get() + 1);

        self.methods
            .iter()
            .enumerate()
            .filter(|(_, m)| m.signature.owner == owner && m.signature.member == member)
            .map(|(index, m)| {
                (
                    MethodId(index as u32),
                    m.signature.params.clone().unwrap_or_default(),
                )
            })
            .collect()
    }

    fn read_body(&self, method: MethodId) -> Result<InstructionStream, HostError> {
        Ok(self.method(method)?.body.clone())
    }

    fn write_body(&mut self, method: MethodId, body: InstructionStream) -> Result<(), HostError> {
        self.method_mut(method)?.body = body;
        Ok(())
    }

    fn attach(&mut self, method: MethodId) -> Result<(), HostError> {
        self.method_mut(method)?.attached = true;
        Ok(())
    }

    fn detach(&mut self, method: MethodId) -> Result<(), HostError> {
        self.method_mut(method)?.attached = false;
        Ok(())
    }
}
