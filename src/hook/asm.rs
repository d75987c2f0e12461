//! The instruction representation that rewrites operate on, plus a small text assembler so
//! bodies can be written and dumped in a readable form.
//!
//! The representation is a stack-machine instruction list. It deliberately knows nothing about
//! any host binary format; a `HostImage` converts its own code to and from this form.

use std::{fmt::Display, str::FromStr};

use itertools::Itertools;
use strum::{EnumIter, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum OpCode {
    Nop,
    LdArg,
    StArg,
    LdLoc,
    StLoc,
    #[strum(serialize = "ldc.i4")]
    LdcI4,
    #[strum(serialize = "ldc.r4")]
    LdcR4,
    LdStr,
    LdFld,
    StFld,
    Call,
    CallVirt,
    Ret,
    Br,
    BrTrue,
    BrFalse,
    Add,
    Sub,
    Mul,
    Div,
    Ceq,
    Clt,
    Cgt,
    Pop,
    Dup,
}

/// The kind of operand an opcode carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperandKind {
    None,
    Index,
    Int,
    Float,
    Str,
    Field,
    Method,
    Label,
}

impl OpCode {
    fn operand_kind(self) -> OperandKind {
        match self {
            OpCode::LdArg | OpCode::StArg | OpCode::LdLoc | OpCode::StLoc => OperandKind::Index,
            OpCode::LdcI4 => OperandKind::Int,
            OpCode::LdcR4 => OperandKind::Float,
            OpCode::LdStr => OperandKind::Str,
            OpCode::LdFld | OpCode::StFld => OperandKind::Field,
            OpCode::Call | OpCode::CallVirt => OperandKind::Method,
            OpCode::Br | OpCode::BrTrue | OpCode::BrFalse => OperandKind::Label,
            _ => OperandKind::None,
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(self, OpCode::Br | OpCode::BrTrue | OpCode::BrFalse)
    }

    pub fn is_call(self) -> bool {
        matches!(self, OpCode::Call | OpCode::CallVirt)
    }
}

/// A branch target. Labels are attached to the instruction they mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

impl Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Index(u16),
    Int(i64),
    Float(f32),
    Str(String),

    /// A field symbol, written `Owner::field`.
    Field(String),

    /// A method symbol, written `Owner::method`.
    Method(String),

    Label(Label),
}

impl Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Index(index) => index.fmt(f),
            Operand::Int(int) => int.fmt(f),
            Operand::Float(float) => write!(f, "{float:?}"),
            Operand::Str(string) => write!(f, "\"{string}\""),
            Operand::Field(symbol) | Operand::Method(symbol) => f.write_str(symbol),
            Operand::Label(label) => label.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: OpCode,
    pub operand: Operand,

    /// Labels that mark this instruction as a branch target.
    pub labels: Vec<Label>,
}

impl Instruction {
    pub fn new(opcode: OpCode, operand: Operand) -> Instruction {
        Instruction {
            opcode,
            operand,
            labels: vec![],
        }
    }

    pub fn op(opcode: OpCode) -> Instruction {
        Instruction::new(opcode, Operand::None)
    }

    pub fn ldarg(index: u16) -> Instruction {
        Instruction::new(OpCode::LdArg, Operand::Index(index))
    }

    pub fn ldc_i4(value: i64) -> Instruction {
        Instruction::new(OpCode::LdcI4, Operand::Int(value))
    }

    pub fn ldc_r4(value: f32) -> Instruction {
        Instruction::new(OpCode::LdcR4, Operand::Float(value))
    }

    pub fn call(method: &str) -> Instruction {
        Instruction::new(OpCode::Call, Operand::Method(method.to_string()))
    }

    pub fn ldfld(field: &str) -> Instruction {
        Instruction::new(OpCode::LdFld, Operand::Field(field.to_string()))
    }

    pub fn branch(opcode: OpCode, target: Label) -> Instruction {
        Instruction::new(opcode, Operand::Label(target))
    }

    pub fn calls(&self, method: &str) -> bool {
        self.opcode.is_call() && matches!(&self.operand, Operand::Method(m) if m == method)
    }

    pub fn loads_field(&self, field: &str) -> bool {
        self.opcode == OpCode::LdFld && matches!(&self.operand, Operand::Field(f) if f == field)
    }

    /// Returns the label this instruction jumps to, if it is a branch.
    pub fn branch_target(&self) -> Option<Label> {
        match (&self.operand, self.opcode.is_branch()) {
            (Operand::Label(label), true) => Some(*label),
            _ => None,
        }
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for label in &self.labels {
            write!(f, "{label}: ")?;
        }

        match self.operand {
            Operand::None => write!(f, "{}", self.opcode),
            _ => write!(f, "{} {}", self.opcode, self.operand),
        }
    }
}

#[derive(Debug)]
pub struct ParseError {
    line: usize,
    message: String,
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

/// The body of one target operation.
#[derive(Debug, Clone, Default)]
pub struct InstructionStream {
    instrs: Vec<Instruction>,
    next_label: u32,
}

impl InstructionStream {
    pub fn new(instrs: Vec<Instruction>) -> InstructionStream {
        let next_label = instrs
            .iter()
            .flat_map(|instr| instr.labels.iter().copied().chain(instr.branch_target()))
            .map(|label| label.0 + 1)
            .max()
            .unwrap_or(0);

        InstructionStream { instrs, next_label }
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instrs
    }

    pub(crate) fn instructions_mut(&mut self) -> &mut Vec<Instruction> {
        &mut self.instrs
    }

    /// Allocates a label that no instruction in this stream uses yet.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Returns the index of the instruction that `label` marks.
    pub fn position_of(&self, label: Label) -> Option<usize> {
        self.instrs
            .iter()
            .position(|instr| instr.labels.contains(&label))
    }

    /// Assembles the text form produced by `Display`: one instruction per line, each optionally
    /// preceded by `Ln:` labels. Blank lines and `;` comments are ignored.
    pub fn parse(source: &str) -> Result<InstructionStream, ParseError> {
        let mut instrs = vec![];

        for (number, line) in source.lines().enumerate() {
            let line = line.split(';').next().unwrap_or("").trim();

            if line.is_empty() {
                continue;
            }

            let error = |message: String| ParseError {
                line: number + 1,
                message,
            };

            let mut labels = vec![];
            let mut rest = line;

            while let Some((head, tail)) = rest.split_once(':') {
                // `Owner::member` symbols also contain colons, so only treat `Ln:` as a label.
                if tail.starts_with(':') || !head.starts_with('L') {
                    break;
                }

                labels.push(parse_label(head).ok_or_else(|| error(format!("bad label '{head}'")))?);
                rest = tail.trim_start();
            }

            let (mnemonic, operand_text) = match rest.split_once(char::is_whitespace) {
                Some((mnemonic, operand)) => (mnemonic, operand.trim()),
                None => (rest, ""),
            };

            let opcode = OpCode::from_str(mnemonic)
                .map_err(|_| error(format!("unknown opcode '{mnemonic}'")))?;

            let operand = parse_operand(opcode.operand_kind(), operand_text)
                .ok_or_else(|| error(format!("bad operand '{operand_text}' for {opcode}")))?;

            instrs.push(Instruction {
                opcode,
                operand,
                labels,
            });
        }

        Ok(InstructionStream::new(instrs))
    }
}

fn parse_label(text: &str) -> Option<Label> {
    text.strip_prefix('L')?.parse().ok().map(Label)
}

fn parse_operand(kind: OperandKind, text: &str) -> Option<Operand> {
    Some(match kind {
        OperandKind::None if text.is_empty() => Operand::None,
        OperandKind::None => return None,
        OperandKind::Index => Operand::Index(text.parse().ok()?),
        OperandKind::Int => Operand::Int(text.parse().ok()?),
        OperandKind::Float => Operand::Float(text.parse().ok()?),
        OperandKind::Str => Operand::Str(
            text.strip_prefix('"')?
                .strip_suffix('"')?
                .to_string(),
        ),
        OperandKind::Field if !text.is_empty() => Operand::Field(text.to_string()),
        OperandKind::Method if !text.is_empty() => Operand::Method(text.to_string()),
        OperandKind::Label => Operand::Label(parse_label(text)?),
        OperandKind::Field | OperandKind::Method => return None,
    })
}

impl PartialEq for InstructionStream {
    fn eq(&self, other: &Self) -> bool {
        self.instrs == other.instrs
    }
}

impl Display for InstructionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.instrs.iter().map(Instruction::to_string).join("\n"))
    }
}
