//! Structural matching and rewriting of instruction streams.
//!
//! A `Pattern` is an ordered list of `Step`s, each of which accepts one instruction. Matches are
//! contiguous. All edits go through a `CodeMatcher`, which works on a private copy of the
//! stream: the copy is only handed back when every step of a rewrite succeeds, so a rewrite
//! that fails halfway never leaves a half-patched body behind.

use std::fmt::Display;

use itertools::Itertools;

use super::asm::{Instruction, InstructionStream, Label, OpCode, Operand};

/// What a step requires of an instruction's operand.
#[derive(Clone)]
pub enum OperandTest {
    Any,
    Is(Operand),
    Calls(String),
    LoadsField(String),

    /// The instruction is a branch (to any label).
    Branches,

    Predicate(fn(&Instruction) -> bool),
}

#[derive(Clone)]
pub struct Step {
    opcode: Option<OpCode>,
    test: OperandTest,
}

impl Step {
    /// Matches any instruction with this opcode.
    pub fn op(opcode: OpCode) -> Step {
        Step {
            opcode: Some(opcode),
            test: OperandTest::Any,
        }
    }

    /// Matches this exact opcode and operand.
    pub fn exact(opcode: OpCode, operand: Operand) -> Step {
        Step {
            opcode: Some(opcode),
            test: OperandTest::Is(operand),
        }
    }

    /// Matches a `call` or `callvirt` of `method`.
    pub fn calls(method: &str) -> Step {
        Step {
            opcode: None,
            test: OperandTest::Calls(method.to_string()),
        }
    }

    pub fn loads_field(field: &str) -> Step {
        Step {
            opcode: Some(OpCode::LdFld),
            test: OperandTest::LoadsField(field.to_string()),
        }
    }

    pub fn branches() -> Step {
        Step {
            opcode: None,
            test: OperandTest::Branches,
        }
    }

    pub fn any() -> Step {
        Step {
            opcode: None,
            test: OperandTest::Any,
        }
    }

    pub fn predicate(test: fn(&Instruction) -> bool) -> Step {
        Step {
            opcode: None,
            test: OperandTest::Predicate(test),
        }
    }

    fn accepts(&self, instr: &Instruction) -> bool {
        if matches!(self.opcode, Some(opcode) if opcode != instr.opcode) {
            return false;
        }

        match &self.test {
            OperandTest::Any => true,
            OperandTest::Is(operand) => &instr.operand == operand,
            OperandTest::Calls(method) => instr.calls(method),
            OperandTest::LoadsField(field) => instr.loads_field(field),
            OperandTest::Branches => instr.branch_target().is_some(),
            OperandTest::Predicate(test) => test(instr),
        }
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let opcode = self
            .opcode
            .map(|op| op.to_string())
            .unwrap_or_else(|| "*".to_string());

        match &self.test {
            OperandTest::Any => write!(f, "{opcode}"),
            OperandTest::Is(operand) => write!(f, "{opcode} {operand}"),
            OperandTest::Calls(method) => write!(f, "call {method}"),
            OperandTest::LoadsField(field) => write!(f, "ldfld {field}"),
            OperandTest::Branches => write!(f, "{opcode} <branch>"),
            OperandTest::Predicate(_) => write!(f, "{opcode} <predicate>"),
        }
    }
}

#[derive(Clone)]
pub struct Pattern {
    steps: Vec<Step>,
}

impl Pattern {
    pub fn new(steps: Vec<Step>) -> Pattern {
        Pattern { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn matches_at(&self, instrs: &[Instruction], start: usize) -> bool {
        instrs.len() >= start + self.steps.len()
            && self
                .steps
                .iter()
                .zip(&instrs[start..])
                .all(|(step, instr)| step.accepts(instr))
    }
}

impl Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.steps.iter().join("; "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// A located match. `end` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub start: usize,
    pub end: usize,
}

impl Match {
    /// Index of the last matched instruction.
    pub fn last(&self) -> usize {
        self.end - 1
    }
}

/// A pattern had no match. Carries enough context to find the problem from a log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternNotMatched {
    pub pattern: String,
    pub direction: Direction,

    /// Where the search started.
    pub from: usize,

    pub stream_len: usize,
}

impl Display for PatternNotMatched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pattern {} not found searching {:?} from {} in {} instructions",
            self.pattern, self.direction, self.from, self.stream_len
        )
    }
}

impl std::error::Error for PatternNotMatched {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    NotMatched(PatternNotMatched),
    OutOfRange { position: isize, len: usize },
    NotABranch { position: usize },
    UnknownLabel(Label),

    /// Removing the instructions would leave a label with nothing to mark.
    OrphanedLabels(Vec<Label>),

    /// A rewrite gave up for a reason of its own.
    Refused(String),
}

impl From<PatternNotMatched> for RewriteError {
    fn from(err: PatternNotMatched) -> Self {
        RewriteError::NotMatched(err)
    }
}

impl Display for RewriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RewriteError::NotMatched(err) => err.fmt(f),
            RewriteError::OutOfRange { position, len } => {
                write!(f, "position {position} is outside a body of {len} instructions")
            }
            RewriteError::NotABranch { position } => {
                write!(f, "instruction {position} is not a branch")
            }
            RewriteError::UnknownLabel(label) => write!(f, "no instruction is marked {label}"),
            RewriteError::OrphanedLabels(labels) => write!(
                f,
                "removal would orphan labels {}",
                labels.iter().join(", ")
            ),
            RewriteError::Refused(reason) => f.write_str(reason),
        }
    }
}

impl std::error::Error for RewriteError {}

/// A cursor over a private copy of an instruction stream.
pub struct CodeMatcher {
    stream: InstructionStream,
    cursor: usize,
}

impl CodeMatcher {
    pub fn new(stream: InstructionStream) -> CodeMatcher {
        CodeMatcher { stream, cursor: 0 }
    }

    pub fn finish(self) -> InstructionStream {
        self.stream
    }

    pub fn stream(&self) -> &InstructionStream {
        &self.stream
    }

    pub fn len(&self) -> usize {
        self.stream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }

    pub fn pos(&self) -> usize {
        self.cursor
    }

    pub fn seek(&mut self, position: usize) -> Result<(), RewriteError> {
        self.check(position)?;
        self.cursor = position;
        Ok(())
    }

    /// Moves the cursor to the last instruction, so a backward search covers the whole body.
    pub fn seek_end(&mut self) {
        self.cursor = self.len().saturating_sub(1);
    }

    /// Moves the cursor by `delta` instructions.
    pub fn advance(&mut self, delta: isize) -> Result<usize, RewriteError> {
        let target = self.cursor as isize + delta;

        if target < 0 || target as usize >= self.len() {
            return Err(RewriteError::OutOfRange {
                position: target,
                len: self.len(),
            });
        }

        self.cursor = target as usize;
        Ok(self.cursor)
    }

    fn check(&self, position: usize) -> Result<(), RewriteError> {
        if position < self.len() {
            Ok(())
        } else {
            Err(RewriteError::OutOfRange {
                position: position as isize,
                len: self.len(),
            })
        }
    }

    fn not_matched(&self, pattern: &Pattern, direction: Direction) -> PatternNotMatched {
        PatternNotMatched {
            pattern: pattern.to_string(),
            direction,
            from: self.cursor,
            stream_len: self.len(),
        }
    }

    /// Finds the first match starting at or after the cursor, and moves the cursor to its start.
    pub fn find_forward(&mut self, pattern: &Pattern) -> Result<Match, PatternNotMatched> {
        let instrs = self.stream.instructions();

        let found = if pattern.is_empty() {
            None
        } else {
            (self.cursor..instrs.len()).find(|&start| pattern.matches_at(instrs, start))
        };

        self.located(pattern, found, Direction::Forward)
    }

    /// Finds the last match starting at or before the cursor, and moves the cursor to its start.
    pub fn find_backward(&mut self, pattern: &Pattern) -> Result<Match, PatternNotMatched> {
        let instrs = self.stream.instructions();

        let found = if pattern.is_empty() || pattern.len() > instrs.len() {
            None
        } else {
            let highest = self.cursor.min(instrs.len() - pattern.len());
            (0..=highest)
                .rev()
                .find(|&start| pattern.matches_at(instrs, start))
        };

        self.located(pattern, found, Direction::Backward)
    }

    fn located(
        &mut self,
        pattern: &Pattern,
        start: Option<usize>,
        direction: Direction,
    ) -> Result<Match, PatternNotMatched> {
        match start {
            Some(start) => {
                self.cursor = start;

                Ok(Match {
                    start,
                    end: start + pattern.len(),
                })
            }
            None => Err(self.not_matched(pattern, direction)),
        }
    }

    /// The first match in the whole body.
    pub fn first(&mut self, pattern: &Pattern) -> Result<Match, PatternNotMatched> {
        self.cursor = 0;
        self.find_forward(pattern)
    }

    /// The last match in the whole body.
    pub fn last(&mut self, pattern: &Pattern) -> Result<Match, PatternNotMatched> {
        self.seek_end();
        self.find_backward(pattern)
    }

    pub fn instruction(&self, position: usize) -> Result<&Instruction, RewriteError> {
        self.check(position)?;
        Ok(&self.stream.instructions()[position])
    }

    /// Removes `count` instructions starting at `start`. Labels on removed instructions move to
    /// the instruction that follows the removed run, so branches into the run land just past it.
    pub fn remove(&mut self, start: usize, count: usize) -> Result<Vec<Instruction>, RewriteError> {
        if count == 0 {
            return Ok(vec![]);
        }

        self.check(start + count - 1)?;

        let instrs = self.stream.instructions_mut();
        let removed: Vec<Instruction> = instrs.drain(start..start + count).collect();
        let labels: Vec<Label> = removed.iter().flat_map(|i| i.labels.clone()).collect();

        if !labels.is_empty() {
            match instrs.get_mut(start) {
                Some(next) => prepend_labels(next, labels),
                None => {
                    // Put everything back before reporting.
                    instrs.splice(start..start, removed);
                    return Err(RewriteError::OrphanedLabels(labels));
                }
            }
        }

        if self.cursor >= self.stream.len() {
            self.seek_end();
        }

        Ok(removed)
    }

    pub fn remove_match(&mut self, found: Match) -> Result<Vec<Instruction>, RewriteError> {
        self.remove(found.start, found.end - found.start)
    }

    /// Inserts `new` before `position`. Labels stay on the instruction at `position`, so code
    /// that branched there still skips the inserted instructions.
    pub fn insert_before(
        &mut self,
        position: usize,
        new: Vec<Instruction>,
    ) -> Result<(), RewriteError> {
        self.check(position)?;
        self.stream
            .instructions_mut()
            .splice(position..position, new);
        Ok(())
    }

    pub fn insert_after(
        &mut self,
        position: usize,
        new: Vec<Instruction>,
    ) -> Result<(), RewriteError> {
        self.check(position)?;
        self.stream
            .instructions_mut()
            .splice(position + 1..position + 1, new);
        Ok(())
    }

    /// Replaces the matched instructions with `new`. The first new instruction inherits every
    /// label of the replaced ones.
    pub fn replace(&mut self, found: Match, mut new: Vec<Instruction>) -> Result<(), RewriteError> {
        if new.is_empty() {
            return self.remove_match(found).map(|_| ());
        }

        self.check(found.last())?;

        let instrs = self.stream.instructions_mut();
        let labels: Vec<Label> = instrs[found.start..found.end]
            .iter()
            .flat_map(|i| i.labels.clone())
            .collect();

        prepend_labels(&mut new[0], labels);
        instrs.splice(found.start..found.end, new);

        Ok(())
    }

    pub fn set_operand(&mut self, position: usize, operand: Operand) -> Result<(), RewriteError> {
        self.check(position)?;
        self.stream.instructions_mut()[position].operand = operand;
        Ok(())
    }

    /// Overwrites the instruction at `position`, keeping its labels.
    pub fn set(
        &mut self,
        position: usize,
        opcode: OpCode,
        operand: Operand,
    ) -> Result<(), RewriteError> {
        self.check(position)?;

        let instr = &mut self.stream.instructions_mut()[position];
        instr.opcode = opcode;
        instr.operand = operand;

        Ok(())
    }

    /// Returns a label marking `position`, creating one if the instruction has none.
    pub fn label_at(&mut self, position: usize) -> Result<Label, RewriteError> {
        self.check(position)?;

        if let Some(label) = self.stream.instructions()[position].labels.first() {
            return Ok(*label);
        }

        let label = self.stream.new_label();
        self.stream.instructions_mut()[position].labels.push(label);
        Ok(label)
    }

    /// The label that the branch at `position` jumps to.
    pub fn branch_target(&self, position: usize) -> Result<Label, RewriteError> {
        self.instruction(position)?
            .branch_target()
            .ok_or(RewriteError::NotABranch { position })
    }

    pub fn position_of(&self, label: Label) -> Result<usize, RewriteError> {
        self.stream
            .position_of(label)
            .ok_or(RewriteError::UnknownLabel(label))
    }

    /// Turns the instruction at `position` into an unconditional branch to `target`.
    pub fn redirect(&mut self, position: usize, target: Label) -> Result<(), RewriteError> {
        self.position_of(target)?;
        self.set(position, OpCode::Br, Operand::Label(target))
    }

    /// Makes execution jump over the matched block without removing it. A branch to the
    /// instruction after the block is inserted in front of it and takes over the block's entry
    /// labels, so code that jumped into the block skips it too.
    pub fn jump_over(&mut self, found: Match) -> Result<(), RewriteError> {
        let target = self.label_at(found.end)?;

        let entry = &mut self.stream.instructions_mut()[found.start];
        let labels = std::mem::take(&mut entry.labels);

        let mut branch = Instruction::branch(OpCode::Br, target);
        branch.labels = labels;

        self.insert_before(found.start, vec![branch])
    }
}

fn prepend_labels(instr: &mut Instruction, mut labels: Vec<Label>) {
    labels.append(&mut instr.labels);
    instr.labels = labels;
}

impl InstructionStream {
    /// Runs `edit` against a copy of this stream and returns the edited copy. The stream itself
    /// is never touched, so a failed edit has no effect.
    pub fn rewritten<F>(&self, edit: F) -> Result<InstructionStream, RewriteError>
    where
        F: FnOnce(&mut CodeMatcher) -> Result<(), RewriteError>,
    {
        let mut matcher = CodeMatcher::new(self.clone());
        edit(&mut matcher)?;
        Ok(matcher.finish())
    }

    /// Like `rewritten`, but replaces this stream when the edit succeeds.
    pub fn rewrite<F>(&mut self, edit: F) -> Result<(), RewriteError>
    where
        F: FnOnce(&mut CodeMatcher) -> Result<(), RewriteError>,
    {
        *self = self.rewritten(edit)?;
        Ok(())
    }
}
