//! Bytecode compiler - transforms the AST into prototypes
//!
//! The compiler walks the tree once and emits stack-machine code directly.
//! Locals live in fixed frame slots (slot 0 is the running closure), so every
//! statement leaves the stack exactly as high as the number of live locals.
//! Constant sub-expressions are folded on the way down and, at optimization
//! level 2, branches with constant conditions are dropped.
//!
//! Prototypes are appended children first; the main function is always last.

use tracing::debug;

use crate::ast::{
    self, BinOp, Block, Expr, ExprKind, FunctionBody, Ident, InterpPart, Stmt, StmtKind,
    TableField, UnaryOp,
};
use crate::lexer::{LineIndex, Span};
use crate::parser::{ParseErrorKind, Parser};
use crate::value::number::{self, ArithOp};

use super::chunk::{Chunk, DebugInfo, LocalVar, Proto};
use super::constant::Constant;
use super::error::{CompileError, CompileErrorKind, CompileResult};
use super::opcode::{OpCode, MULTI};
use super::options::CompileOptions;

const MAX_LOCALS: usize = 200;
const MAX_UPVALUES: usize = 255;
const MAX_PARAMS: usize = 255;
const MAX_ARGS: usize = 255;
/// Positional constructor values stored by one SET_LIST
const FIELDS_PER_FLUSH: usize = 50;
/// Operands joined by one CONCAT
const MAX_CONCAT: usize = 200;

/// Compile source text to a serialized chunk
pub fn compile(source: &str, chunk_name: &str, options: &CompileOptions) -> CompileResult<Vec<u8>> {
    compile_chunk(source, chunk_name, options).map(|chunk| chunk.to_bytes())
}

/// Compile source text to an in-memory chunk.
///
/// Only the first diagnostic is reported; no chunk is produced on error.
pub fn compile_chunk(source: &str, chunk_name: &str, options: &CompileOptions) -> CompileResult<Chunk> {
    options.validate(chunk_name)?;
    let compiler = Compiler::new(source, chunk_name, *options);
    let ast = Parser::parse_chunk(source).map_err(|errors| {
        let first = errors.into_iter().next();
        match first {
            Some(error) => {
                let location = compiler.lines.location(error.span.start);
                let mut compile_error = CompileError::new(
                    CompileErrorKind::Syntax(error.kind),
                    chunk_name,
                    location.line,
                    location.column,
                );
                compile_error.hint = error.hint;
                compile_error
            }
            None => CompileError::new(
                CompileErrorKind::Syntax(ParseErrorKind::IncompleteStatement),
                chunk_name,
                0,
                0,
            ),
        }
    })?;
    let chunk = compiler.compile(&ast)?;
    debug!(
        chunk = chunk_name,
        protos = chunk.protos.len(),
        "compiled chunk"
    );
    Ok(chunk)
}

/// A local variable in scope
#[derive(Debug, Clone)]
struct Local {
    name: String,
    /// Scope depth (0 = function parameters)
    depth: u32,
    /// Whether a closure captures the variable
    captured: bool,
    start_pc: u32,
}

/// How a closure obtains one upvalue when it is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    /// Slot in the enclosing frame, or index into the enclosing closure's upvalues
    index: u8,
    is_local: bool,
}

/// Loop bookkeeping for `break` and `continue`
#[derive(Debug, Clone)]
struct LoopInfo {
    /// Locals alive outside the loop body
    base_locals: usize,
    body_depth: u32,
    /// `continue` in `repeat` keeps the body locals the condition may read
    keeps_locals: bool,
    /// Backward target for `continue`, when already known
    continue_target: Option<usize>,
    breaks: Vec<usize>,
    /// Forward `continue` jumps with the number of body locals still alive
    continues: Vec<(usize, usize)>,
}

/// Compiler state for a single function
struct FunctionState {
    proto: Proto,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    upvalue_names: Vec<String>,
    scope_depth: u32,
    loops: Vec<LoopInfo>,
    max_locals: usize,
    debug_locals: Vec<LocalVar>,
    /// Locals at or past this index are unreadable (a `continue` skipped them)
    guard: Option<usize>,
}

impl FunctionState {
    fn new(proto: Proto) -> Self {
        Self {
            proto,
            locals: Vec::new(),
            upvalues: Vec::new(),
            upvalue_names: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            max_locals: 0,
            debug_locals: Vec::new(),
            guard: None,
        }
    }

    fn resolve_local(&self, name: &str) -> Option<usize> {
        self.locals.iter().rposition(|local| local.name == name)
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool, name: &str) -> Result<u8, CompileErrorKind> {
        let desc = UpvalueDesc { index, is_local };
        if let Some(existing) = self.upvalues.iter().position(|u| *u == desc) {
            return Ok(existing as u8);
        }
        if self.upvalues.len() >= MAX_UPVALUES {
            return Err(CompileErrorKind::TooManyUpvalues(name.to_string()));
        }
        self.upvalues.push(desc);
        self.upvalue_names.push(name.to_string());
        Ok((self.upvalues.len() - 1) as u8)
    }
}

/// Frame slot of the local at `index`
fn slot(index: usize) -> u8 {
    (index + 1) as u8
}

/// Find `name` in the enclosing functions, threading an upvalue through each level
fn resolve_upvalue(
    current: &mut FunctionState,
    enclosing: &mut [FunctionState],
    name: &str,
) -> Result<Option<u8>, CompileErrorKind> {
    let Some((parent, outer)) = enclosing.split_last_mut() else {
        return Ok(None);
    };
    if let Some(index) = parent.resolve_local(name) {
        parent.locals[index].captured = true;
        return current.add_upvalue(slot(index), true, name).map(Some);
    }
    match resolve_upvalue(parent, outer, name)? {
        Some(index) => current.add_upvalue(index, false, name).map(Some),
        None => Ok(None),
    }
}

/// Where a name lives
#[derive(Debug, Clone, Copy)]
enum Variable {
    Local(u8),
    Upvalue(u8),
    Global(u16),
}

/// Bytecode compiler
pub struct Compiler<'src> {
    current: FunctionState,
    enclosing: Vec<FunctionState>,
    /// Finished prototypes, children first
    protos: Vec<Proto>,
    lines: LineIndex<'src>,
    chunk_name: String,
    options: CompileOptions,
}

impl<'src> Compiler<'src> {
    #[must_use]
    pub fn new(source: &'src str, chunk_name: impl Into<String>, options: CompileOptions) -> Self {
        let mut main = Proto::new(None, 0);
        main.is_vararg = true;
        Self {
            current: FunctionState::new(main),
            enclosing: Vec::new(),
            protos: Vec::new(),
            lines: LineIndex::new(source),
            chunk_name: chunk_name.into(),
            options,
        }
    }

    /// Compile a parsed chunk as the body of the vararg main function
    pub fn compile(mut self, chunk: &ast::Chunk) -> CompileResult<Chunk> {
        self.begin_scope();
        self.statements(&chunk.body.stmts)?;
        let line = self.lines.line(chunk.body.span.end);
        self.emit_return_none(line);
        self.current.scope_depth -= 1;
        self.remove_locals(0);

        let main_state = std::mem::replace(&mut self.current, FunctionState::new(Proto::default()));
        let main = self.finish_proto(main_state);
        self.protos.push(main);
        let main = (self.protos.len() - 1) as u32;
        Ok(Chunk {
            vector_size: self.options.vector_size,
            protos: self.protos,
            main,
        })
    }

    // ==================== Statements ====================

    fn statements(&mut self, stmts: &[Stmt]) -> CompileResult<()> {
        for stmt in stmts {
            self.statement(stmt)?;
        }
        Ok(())
    }

    fn block(&mut self, block: &Block) -> CompileResult<()> {
        self.begin_scope();
        self.statements(&block.stmts)?;
        let line = self.lines.line(block.span.end);
        self.end_scope(line);
        Ok(())
    }

    fn statement(&mut self, stmt: &Stmt) -> CompileResult<()> {
        let line = self.line(stmt.span);
        match &stmt.kind {
            StmtKind::Local { names, values } => {
                self.adjust_values(values, names.len(), line)?;
                for name in names {
                    self.declare_local(&name.name, name.span)?;
                }
                Ok(())
            }
            StmtKind::LocalFunction { name, func } => {
                // Declared before the body so the function can call itself
                self.emit_op(OpCode::Nil, line);
                self.declare_local(&name.name, name.span)?;
                self.function(func, line)?;
                let slot = slot(self.current.locals.len() - 1);
                self.emit_op_u8(OpCode::SetLocal, slot, line);
                Ok(())
            }
            StmtKind::Function { target, func } => self.function_statement(target, func, line),
            StmtKind::Assign { targets, values } => self.assignment(targets, values, line),
            StmtKind::CompoundAssign { target, op, value } => {
                self.compound_assignment(target, *op, value, line)
            }
            StmtKind::Call(expr) => self.call_expression(expr, 0),
            StmtKind::Do(block) => self.block(block),
            StmtKind::While { condition, body } => self.while_statement(condition, body, line),
            StmtKind::Repeat { body, condition } => self.repeat_statement(body, condition, line),
            StmtKind::If {
                branches,
                otherwise,
            } => self.if_statement(branches, otherwise.as_ref(), line),
            StmtKind::NumericFor {
                var,
                start,
                limit,
                step,
                body,
            } => self.numeric_for(var, start, limit, step.as_ref(), body, line),
            StmtKind::GenericFor { vars, exprs, body } => self.generic_for(vars, exprs, body, line),
            StmtKind::Break => self.break_statement(stmt.span, line),
            StmtKind::Continue => self.continue_statement(stmt.span, line),
            StmtKind::Return(values) => self.return_statement(values, stmt.span, line),
            StmtKind::TypeAlias => Ok(()),
        }
    }

    fn function_statement(&mut self, target: &Expr, func: &FunctionBody, line: u32) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                self.function(func, line)?;
                self.set_variable(name, line)
            }
            ExprKind::Field { object, name } => {
                self.expression(object)?;
                self.function(func, line)?;
                let constant = self.name_constant(&name.name, name.span)?;
                self.emit_op_u16(OpCode::SetField, constant, line);
                Ok(())
            }
            _ => Err(self.error(
                CompileErrorKind::Syntax(ParseErrorKind::InvalidAssignmentTarget),
                target.span,
            )),
        }
    }

    fn assignment(&mut self, targets: &[Expr], values: &[Expr], line: u32) -> CompileResult<()> {
        if let ([target], [value]) = (targets, values) {
            return match &target.kind {
                ExprKind::Name(name) => {
                    self.expression(value)?;
                    self.set_variable(name, line)
                }
                ExprKind::Field { object, name } => {
                    self.expression(object)?;
                    self.expression(value)?;
                    let constant = self.name_constant(&name.name, name.span)?;
                    self.emit_op_u16(OpCode::SetField, constant, line);
                    Ok(())
                }
                ExprKind::Index { object, key } => {
                    self.expression(object)?;
                    self.expression(key)?;
                    self.expression(value)?;
                    self.emit_op(OpCode::SetIndex, line);
                    Ok(())
                }
                _ => Err(self.invalid_target(target)),
            };
        }

        // Evaluate every target prefix and every value before storing anything
        let mut temps = 0usize;
        let mut positions = Vec::with_capacity(targets.len());
        for target in targets {
            positions.push(temps);
            match &target.kind {
                ExprKind::Name(_) => {}
                ExprKind::Field { object, .. } => {
                    self.expression(object)?;
                    temps += 1;
                }
                ExprKind::Index { object, key } => {
                    self.expression(object)?;
                    self.expression(key)?;
                    temps += 2;
                }
                _ => return Err(self.invalid_target(target)),
            }
        }
        self.adjust_values(values, targets.len(), line)?;

        let height = temps + targets.len();
        for (i, target) in targets.iter().enumerate() {
            let value_depth = height - 1 - (temps + i);
            let object_depth = height - 1 - positions[i];
            match &target.kind {
                ExprKind::Name(name) => {
                    self.pick(value_depth, target.span, line)?;
                    self.set_variable(name, line)?;
                }
                ExprKind::Field { name, .. } => {
                    self.pick(object_depth, target.span, line)?;
                    self.pick(value_depth + 1, target.span, line)?;
                    let constant = self.name_constant(&name.name, name.span)?;
                    self.emit_op_u16(OpCode::SetField, constant, line);
                }
                ExprKind::Index { .. } => {
                    self.pick(object_depth, target.span, line)?;
                    self.pick(object_depth, target.span, line)?;
                    self.pick(value_depth + 2, target.span, line)?;
                    self.emit_op(OpCode::SetIndex, line);
                }
                _ => return Err(self.invalid_target(target)),
            }
        }
        self.emit_pop(height, line);
        Ok(())
    }

    fn compound_assignment(&mut self, target: &Expr, op: BinOp, value: &Expr, line: u32) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                self.get_variable(name, line)?;
                self.expression(value)?;
                self.emit_binary_op(op, line);
                self.set_variable(name, line)
            }
            ExprKind::Field { object, name } => {
                let constant = self.name_constant(&name.name, name.span)?;
                self.expression(object)?;
                self.emit_op(OpCode::Dup, line);
                self.emit_op_u16(OpCode::GetField, constant, line);
                self.expression(value)?;
                self.emit_binary_op(op, line);
                self.emit_op_u16(OpCode::SetField, constant, line);
                Ok(())
            }
            ExprKind::Index { object, key } => {
                self.expression(object)?;
                self.expression(key)?;
                self.emit_op_u8(OpCode::Pick, 1, line);
                self.emit_op_u8(OpCode::Pick, 1, line);
                self.emit_op(OpCode::GetIndex, line);
                self.expression(value)?;
                self.emit_binary_op(op, line);
                self.emit_op(OpCode::SetIndex, line);
                Ok(())
            }
            _ => Err(self.invalid_target(target)),
        }
    }

    fn return_statement(&mut self, values: &[Expr], span: Span, line: u32) -> CompileResult<()> {
        let mut multi = 0u8;
        for (i, value) in values.iter().enumerate() {
            if i + 1 == values.len() && value.is_multi() {
                self.multi_expression(value, MULTI)?;
                multi = 1;
            } else {
                self.expression(value)?;
            }
        }
        let fixed = values.len() - multi as usize;
        let count = u8::try_from(fixed)
            .map_err(|_| self.error(CompileErrorKind::ExpressionTooComplex, span))?;
        self.emit_op(OpCode::Return, line);
        self.emit_byte(count, line);
        self.emit_byte(multi, line);
        Ok(())
    }

    fn if_statement(
        &mut self,
        branches: &[(Expr, Block)],
        otherwise: Option<&Block>,
        line: u32,
    ) -> CompileResult<()> {
        let mut end_jumps = Vec::new();
        let mut closed = false;

        for (i, (condition, block)) in branches.iter().enumerate() {
            if self.options.optimization_level >= 2 {
                if let Some(constant) = fold(condition) {
                    if constant.is_truthy() {
                        self.block(block)?;
                        closed = true;
                        break;
                    }
                    continue;
                }
            }
            self.expression(condition)?;
            let next = self.emit_jump(OpCode::JumpIfFalse, line);
            self.block(block)?;
            if i + 1 < branches.len() || otherwise.is_some() {
                end_jumps.push(self.emit_jump(OpCode::Jump, line));
            }
            self.patch_jump(next, condition.span)?;
        }

        if !closed {
            if let Some(block) = otherwise {
                self.block(block)?;
            }
        }
        for jump in end_jumps {
            self.patch_jump(jump, branches[0].0.span)?;
        }
        Ok(())
    }

    fn while_statement(&mut self, condition: &Expr, body: &Block, line: u32) -> CompileResult<()> {
        let constant = if self.options.optimization_level >= 2 {
            fold(condition)
        } else {
            None
        };
        if constant.as_ref().is_some_and(|c| !c.is_truthy()) {
            return Ok(());
        }

        let start = self.current.proto.current_offset();
        let exit = if constant.is_none() {
            self.expression(condition)?;
            Some(self.emit_jump(OpCode::JumpIfFalse, line))
        } else {
            None
        };

        self.push_loop(Some(start), false);
        self.block(body)?;
        self.emit_loop(start, body.span, line)?;
        if let Some(exit) = exit {
            self.patch_jump(exit, condition.span)?;
        }
        self.pop_loop(body.span)?;
        Ok(())
    }

    fn repeat_statement(&mut self, body: &Block, condition: &Expr, line: u32) -> CompileResult<()> {
        let start = self.current.proto.current_offset();
        self.push_loop(None, true);
        self.begin_scope();
        self.statements(&body.stmts)?;

        let base = self.current.locals.len()
            - self
                .current
                .locals
                .iter()
                .rev()
                .take_while(|l| l.depth == self.current.scope_depth)
                .count();
        let body_locals = self.current.locals.len() - base;
        let continues = self
            .current
            .loops
            .last_mut()
            .map(|l| std::mem::take(&mut l.continues))
            .unwrap_or_default();

        // A continue that skipped some body locals lands on a stub padding them with nil
        let mut to_condition = Vec::new();
        let mut fewest = body_locals;
        if continues.iter().any(|&(_, kept)| kept < body_locals) {
            to_condition.push(self.emit_jump(OpCode::Jump, line));
            let mut kept_counts: Vec<usize> = continues.iter().map(|&(_, kept)| kept).collect();
            kept_counts.sort_unstable();
            kept_counts.dedup();
            for kept in kept_counts.into_iter().filter(|&kept| kept < body_locals) {
                fewest = fewest.min(kept);
                for &(jump, _) in continues.iter().filter(|&&(_, k)| k == kept) {
                    self.patch_jump(jump, body.span)?;
                }
                for _ in kept..body_locals {
                    self.emit_op(OpCode::Nil, line);
                }
                to_condition.push(self.emit_jump(OpCode::Jump, line));
            }
        }
        for jump in to_condition {
            self.patch_jump(jump, body.span)?;
        }
        for &(jump, _) in continues.iter().filter(|&&(_, kept)| kept == body_locals) {
            self.patch_jump(jump, body.span)?;
        }

        let previous_guard = self.current.guard;
        if fewest < body_locals {
            self.current.guard = Some(base + fewest);
        }
        let condition_line = self.line(condition.span);
        let result = self.expression(condition);
        self.current.guard = previous_guard;
        result?;

        let done = self.emit_jump(OpCode::JumpIfTrue, condition_line);
        self.emit_pop_locals(base, condition_line);
        self.emit_loop(start, condition.span, condition_line)?;
        self.patch_jump(done, condition.span)?;
        self.end_scope(condition_line);
        self.pop_loop(body.span)?;
        Ok(())
    }

    fn numeric_for(
        &mut self,
        var: &Ident,
        start: &Expr,
        limit: &Expr,
        step: Option<&Expr>,
        body: &Block,
        line: u32,
    ) -> CompileResult<()> {
        self.expression(start)?;
        self.expression(limit)?;
        match step {
            Some(step) => self.expression(step)?,
            None => self.emit_constant(Constant::Number(1.0), var.span, line)?,
        }

        self.begin_scope();
        for hidden in ["(for index)", "(for limit)", "(for step)"] {
            self.declare_local(hidden, var.span)?;
        }
        let base = slot(self.current.locals.len() - 3);

        self.emit_op_u8(OpCode::ForPrep, base, line);
        let exit = self.current.proto.write_jump_placeholder(line);

        self.push_loop(None, false);
        let body_start = self.current.proto.current_offset();
        self.begin_scope();
        self.emit_op_u8(OpCode::GetLocal, base, line);
        self.declare_local(&var.name, var.span)?;
        self.statements(&body.stmts)?;
        let end_line = self.lines.line(body.span.end);
        self.end_scope(end_line);

        let continues = self
            .current
            .loops
            .last_mut()
            .map(|l| std::mem::take(&mut l.continues))
            .unwrap_or_default();
        for (jump, _) in continues {
            self.patch_jump(jump, body.span)?;
        }
        self.emit_op_u8(OpCode::ForLoop, base, end_line);
        if !self.current.proto.write_jump_back(body_start, end_line) {
            return Err(self.error(CompileErrorKind::JumpTooLarge, body.span));
        }

        self.patch_jump(exit, body.span)?;
        self.pop_loop(body.span)?;
        self.end_scope(end_line);
        Ok(())
    }

    fn generic_for(&mut self, vars: &[Ident], exprs: &[Expr], body: &Block, line: u32) -> CompileResult<()> {
        let var_count = u8::try_from(vars.len()).map_err(|_| {
            self.error(
                CompileErrorKind::TooManyLocals(vars[0].name.clone()),
                vars[0].span,
            )
        })?;

        self.adjust_values(exprs, 3, line)?;
        self.begin_scope();
        for hidden in ["(for generator)", "(for state)", "(for control)"] {
            self.declare_local(hidden, vars[0].span)?;
        }
        let base = slot(self.current.locals.len() - 3);
        self.emit_op_u8(OpCode::ForInPrep, base, line);

        let call = self.current.proto.current_offset();
        self.push_loop(Some(call), false);
        self.emit_op(OpCode::ForInCall, line);
        self.emit_byte(base, line);
        self.emit_byte(var_count, line);
        self.emit_op(OpCode::ForInLoop, line);
        self.emit_byte(base, line);
        self.emit_byte(var_count, line);
        let exit = self.current.proto.write_jump_placeholder(line);

        self.begin_scope();
        for var in vars {
            self.declare_local(&var.name, var.span)?;
        }
        self.statements(&body.stmts)?;
        let end_line = self.lines.line(body.span.end);
        self.end_scope(end_line);
        self.emit_loop(call, body.span, end_line)?;

        self.patch_jump(exit, body.span)?;
        self.pop_loop(body.span)?;
        self.end_scope(end_line);
        Ok(())
    }

    fn break_statement(&mut self, span: Span, line: u32) -> CompileResult<()> {
        let Some(base) = self.current.loops.last().map(|l| l.base_locals) else {
            return Err(self.error(CompileErrorKind::Syntax(ParseErrorKind::BreakOutsideLoop), span));
        };
        self.emit_pop_locals(base, line);
        let jump = self.emit_jump(OpCode::Jump, line);
        if let Some(info) = self.current.loops.last_mut() {
            info.breaks.push(jump);
        }
        Ok(())
    }

    fn continue_statement(&mut self, span: Span, line: u32) -> CompileResult<()> {
        let Some(info) = self.current.loops.last() else {
            return Err(self.error(
                CompileErrorKind::Syntax(ParseErrorKind::ContinueOutsideLoop),
                span,
            ));
        };
        let base = info.base_locals;
        let target = info.continue_target;
        let kept = if info.keeps_locals {
            let depth = info.body_depth;
            self.current.locals[base..]
                .iter()
                .take_while(|l| l.depth == depth)
                .count()
        } else {
            0
        };

        self.emit_pop_locals(base + kept, line);
        match target {
            Some(target) => self.emit_loop(target, span, line),
            None => {
                let jump = self.emit_jump(OpCode::Jump, line);
                if let Some(info) = self.current.loops.last_mut() {
                    info.continues.push((jump, kept));
                }
                Ok(())
            }
        }
    }

    fn push_loop(&mut self, continue_target: Option<usize>, keeps_locals: bool) {
        let info = LoopInfo {
            base_locals: self.current.locals.len(),
            body_depth: self.current.scope_depth + 1,
            keeps_locals,
            continue_target,
            breaks: Vec::new(),
            continues: Vec::new(),
        };
        self.current.loops.push(info);
    }

    /// Close the innermost loop, pointing its breaks at the current offset
    fn pop_loop(&mut self, span: Span) -> CompileResult<()> {
        if let Some(info) = self.current.loops.pop() {
            for jump in info.breaks {
                self.patch_jump(jump, span)?;
            }
        }
        Ok(())
    }

    // ==================== Functions ====================

    fn function(&mut self, func: &FunctionBody, line: u32) -> CompileResult<()> {
        if func.params.len() > MAX_PARAMS {
            return Err(self.error(CompileErrorKind::TooManyParameters, func.span));
        }
        let mut proto = Proto::new(func.name.clone(), line);
        proto.num_params = func.params.len() as u8;
        proto.is_vararg = func.is_vararg;

        let parent = std::mem::replace(&mut self.current, FunctionState::new(proto));
        self.enclosing.push(parent);
        let result = self.function_body(func);
        let Some(parent) = self.enclosing.pop() else {
            unreachable!("enclosing state pushed above");
        };
        let finished = std::mem::replace(&mut self.current, parent);
        result?;

        let upvalues = finished.upvalues.clone();
        let proto = self.finish_proto(finished);
        let index = self.protos.len() as u32;
        self.protos.push(proto);
        let child = u16::try_from(self.current.proto.children.len())
            .map_err(|_| self.error(CompileErrorKind::TooManyFunctions, func.span))?;
        self.current.proto.children.push(index);

        self.emit_op_u16(OpCode::Closure, child, line);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local), line);
            self.emit_byte(upvalue.index, line);
        }
        Ok(())
    }

    fn function_body(&mut self, func: &FunctionBody) -> CompileResult<()> {
        for param in &func.params {
            self.declare_local(&param.name, param.span)?;
        }
        self.begin_scope();
        self.statements(&func.body.stmts)?;
        let line = self.lines.line(func.span.end.saturating_sub(1));
        self.emit_return_none(line);
        self.current.scope_depth -= 1;
        self.remove_locals(0);
        Ok(())
    }

    fn finish_proto(&self, state: FunctionState) -> Proto {
        let mut proto = state.proto;
        proto.num_upvalues = state.upvalues.len() as u8;
        proto.max_stack = (state.max_locals + 1).min(255) as u8;
        match self.options.debug_level {
            0 => {
                proto.strip_lines();
                proto.name = None;
            }
            1 => {}
            _ => {
                let mut locals = state.debug_locals;
                locals.sort_by_key(|l| (l.start_pc, l.slot));
                proto.debug = Some(DebugInfo {
                    locals,
                    upvalue_names: state.upvalue_names,
                });
            }
        }
        proto
    }

    // ==================== Expressions ====================

    /// Compile an expression that leaves exactly one value
    fn expression(&mut self, expr: &Expr) -> CompileResult<()> {
        let line = self.line(expr.span);
        if self.options.optimization_level >= 1
            && matches!(expr.kind, ExprKind::Binary { .. } | ExprKind::Unary { .. } | ExprKind::Paren(_))
        {
            if let Some(constant) = fold(expr) {
                return self.emit_constant(constant, expr.span, line);
            }
        }

        match &expr.kind {
            ExprKind::Nil => self.emit_constant(Constant::Nil, expr.span, line),
            ExprKind::True => self.emit_constant(Constant::Boolean(true), expr.span, line),
            ExprKind::False => self.emit_constant(Constant::Boolean(false), expr.span, line),
            ExprKind::Number(n) => self.emit_constant(Constant::Number(*n), expr.span, line),
            ExprKind::String(s) => self.emit_constant(Constant::String(s.clone()), expr.span, line),
            ExprKind::VarArg => {
                self.emit_op_u8(OpCode::VarArg, 1, line);
                Ok(())
            }
            ExprKind::Interpolated(parts) => self.interpolated(parts, expr.span, line),
            ExprKind::Function(func) => self.function(func, line),
            ExprKind::Table(fields) => self.table_constructor(fields, line),
            ExprKind::Binary { op, left, right } => self.binary(*op, left, right, expr.span, line),
            ExprKind::Unary { op, operand } => {
                self.expression(operand)?;
                let opcode = match op {
                    UnaryOp::Neg => OpCode::Unm,
                    UnaryOp::Not => OpCode::Not,
                    UnaryOp::Len => OpCode::Len,
                };
                self.emit_op(opcode, line);
                Ok(())
            }
            ExprKind::Name(name) => self.get_variable(name, line),
            ExprKind::Index { object, key } => {
                self.expression(object)?;
                self.expression(key)?;
                self.emit_op(OpCode::GetIndex, line);
                Ok(())
            }
            ExprKind::Field { object, name } => {
                self.expression(object)?;
                let constant = self.name_constant(&name.name, name.span)?;
                self.emit_op_u16(OpCode::GetField, constant, line);
                Ok(())
            }
            ExprKind::Call { .. } | ExprKind::MethodCall { .. } => self.call_expression(expr, 1),
            ExprKind::Paren(inner) => self.expression(inner),
            ExprKind::IfElse {
                branches,
                otherwise,
            } => {
                let mut end_jumps = Vec::with_capacity(branches.len());
                for (condition, value) in branches {
                    self.expression(condition)?;
                    let next = self.emit_jump(OpCode::JumpIfFalse, line);
                    self.expression(value)?;
                    end_jumps.push(self.emit_jump(OpCode::Jump, line));
                    self.patch_jump(next, expr.span)?;
                }
                self.expression(otherwise)?;
                for jump in end_jumps {
                    self.patch_jump(jump, expr.span)?;
                }
                Ok(())
            }
        }
    }

    /// Compile a call or `...` producing `count` values (`MULTI` for all)
    fn multi_expression(&mut self, expr: &Expr, count: u8) -> CompileResult<()> {
        match expr.kind {
            ExprKind::VarArg => {
                let line = self.line(expr.span);
                self.emit_op_u8(OpCode::VarArg, count, line);
                Ok(())
            }
            _ => self.call_expression(expr, count),
        }
    }

    fn call_expression(&mut self, expr: &Expr, results: u8) -> CompileResult<()> {
        let line = self.line(expr.span);
        let (argc, multi) = match &expr.kind {
            ExprKind::Call { callee, args } => {
                self.expression(callee)?;
                self.arguments(args, 0, expr.span)?
            }
            ExprKind::MethodCall {
                object,
                method,
                args,
            } => {
                self.expression(object)?;
                let constant = self.name_constant(&method.name, method.span)?;
                self.emit_op_u16(OpCode::SelfOp, constant, line);
                self.arguments(args, 1, expr.span)?
            }
            _ => {
                self.expression(expr)?;
                if results == 0 {
                    self.emit_op(OpCode::Pop, line);
                }
                return Ok(());
            }
        };
        self.emit_op(OpCode::Call, line);
        self.emit_byte(argc, line);
        self.emit_byte(multi, line);
        self.emit_byte(results, line);
        Ok(())
    }

    /// Push call arguments; returns the fixed count and the multi flag
    fn arguments(&mut self, args: &[Expr], extra: usize, span: Span) -> CompileResult<(u8, u8)> {
        let mut multi = 0u8;
        for (i, arg) in args.iter().enumerate() {
            if i + 1 == args.len() && arg.is_multi() {
                self.multi_expression(arg, MULTI)?;
                multi = 1;
            } else {
                self.expression(arg)?;
            }
        }
        let fixed = args.len() + extra - multi as usize;
        if fixed > MAX_ARGS {
            return Err(self.error(CompileErrorKind::TooManyArguments, span));
        }
        Ok((fixed as u8, multi))
    }

    /// Push exactly `want` values from an expression list
    fn adjust_values(&mut self, values: &[Expr], want: usize, line: u32) -> CompileResult<()> {
        for (i, value) in values.iter().enumerate() {
            let last = i + 1 == values.len();
            if i < want {
                if last && value.is_multi() {
                    let count = u8::try_from(want - i)
                        .ok()
                        .filter(|&n| n != MULTI)
                        .ok_or_else(|| self.error(CompileErrorKind::ExpressionTooComplex, value.span))?;
                    self.multi_expression(value, count)?;
                } else {
                    self.expression(value)?;
                }
            } else if value.is_multi() {
                self.multi_expression(value, 0)?;
            } else {
                self.expression(value)?;
                self.emit_op(OpCode::Pop, line);
            }
        }
        if values.len() < want && !values.last().is_some_and(Expr::is_multi) {
            for _ in values.len()..want {
                self.emit_op(OpCode::Nil, line);
            }
        }
        Ok(())
    }

    fn binary(&mut self, op: BinOp, left: &Expr, right: &Expr, span: Span, line: u32) -> CompileResult<()> {
        match op {
            BinOp::And | BinOp::Or => {
                if self.options.optimization_level >= 1 {
                    if let Some(constant) = fold(left) {
                        let short_circuits = constant.is_truthy() == (op == BinOp::Or);
                        return if short_circuits {
                            self.emit_constant(constant, left.span, line)
                        } else {
                            self.expression(right)
                        };
                    }
                }
                self.expression(left)?;
                let jump_op = if op == BinOp::And {
                    OpCode::JumpIfFalseOrPop
                } else {
                    OpCode::JumpIfTrueOrPop
                };
                let jump = self.emit_jump(jump_op, line);
                self.expression(right)?;
                self.patch_jump(jump, span)
            }
            BinOp::Concat => {
                let mut operands = vec![left];
                let mut rest = right;
                while let ExprKind::Binary {
                    op: BinOp::Concat,
                    left,
                    right,
                } = &rest.kind
                {
                    operands.push(left);
                    rest = right;
                }
                operands.push(rest);
                self.concat_chain(&operands, line)
            }
            _ => {
                self.expression(left)?;
                self.expression(right)?;
                self.emit_binary_op(op, line);
                Ok(())
            }
        }
    }

    /// `a .. b .. c` is right associative, so a long chain nests on the right
    fn concat_chain(&mut self, operands: &[&Expr], line: u32) -> CompileResult<()> {
        if operands.len() > MAX_CONCAT {
            let (head, tail) = operands.split_at(MAX_CONCAT - 1);
            for operand in head {
                self.expression(operand)?;
            }
            self.concat_chain(tail, line)?;
        } else {
            for operand in operands {
                self.expression(operand)?;
            }
        }
        let count = operands.len().min(MAX_CONCAT) as u8;
        self.emit_op_u8(OpCode::Concat, count, line);
        Ok(())
    }

    fn interpolated(&mut self, parts: &[InterpPart], span: Span, line: u32) -> CompileResult<()> {
        if parts.is_empty() {
            return self.emit_constant(Constant::String(Vec::new()), span, line);
        }
        let mut pieces = 0usize;
        for part in parts {
            match part {
                InterpPart::Text(text) => {
                    self.emit_constant(Constant::String(text.clone()), span, line)?;
                }
                InterpPart::Expr(expr) => {
                    self.expression(expr)?;
                    self.emit_op(OpCode::ToStr, line);
                }
            }
            pieces += 1;
            if pieces == MAX_CONCAT {
                self.emit_op_u8(OpCode::Concat, MAX_CONCAT as u8, line);
                pieces = 1;
            }
        }
        if pieces > 1 {
            self.emit_op_u8(OpCode::Concat, pieces as u8, line);
        }
        Ok(())
    }

    fn table_constructor(&mut self, fields: &[TableField], line: u32) -> CompileResult<()> {
        let positional = fields
            .iter()
            .filter(|f| matches!(f, TableField::Positional(_)))
            .count();
        let array_hint = u16::try_from(positional).unwrap_or(u16::MAX);
        let hash_hint = u16::try_from(fields.len() - positional).unwrap_or(u16::MAX);
        self.emit_op(OpCode::NewTable, line);
        self.current.proto.write_u16(array_hint, line);
        self.current.proto.write_u16(hash_hint, line);

        let mut pending = 0usize;
        let mut next_index = 1u32;
        for (i, field) in fields.iter().enumerate() {
            match field {
                TableField::Positional(value) => {
                    if i + 1 == fields.len() && value.is_multi() {
                        self.multi_expression(value, MULTI)?;
                        self.emit_set_list(pending, true, next_index, line);
                        pending = 0;
                    } else {
                        self.expression(value)?;
                        pending += 1;
                        if pending == FIELDS_PER_FLUSH {
                            self.emit_set_list(pending, false, next_index, line);
                            next_index += pending as u32;
                            pending = 0;
                        }
                    }
                }
                TableField::Named(name, value) => {
                    if pending > 0 {
                        self.emit_set_list(pending, false, next_index, line);
                        next_index += pending as u32;
                        pending = 0;
                    }
                    self.expression(value)?;
                    let constant = self.name_constant(&name.name, name.span)?;
                    self.emit_op_u16(OpCode::InitField, constant, line);
                }
                TableField::Keyed(key, value) => {
                    if pending > 0 {
                        self.emit_set_list(pending, false, next_index, line);
                        next_index += pending as u32;
                        pending = 0;
                    }
                    self.expression(key)?;
                    self.expression(value)?;
                    self.emit_op(OpCode::InitIndex, line);
                }
            }
        }
        if pending > 0 {
            self.emit_set_list(pending, false, next_index, line);
        }
        Ok(())
    }

    fn emit_set_list(&mut self, count: usize, multi: bool, start: u32, line: u32) {
        self.emit_op(OpCode::SetList, line);
        self.emit_byte(count as u8, line);
        self.emit_byte(u8::from(multi), line);
        self.current.proto.write_u32(start, line);
    }

    fn emit_binary_op(&mut self, op: BinOp, line: u32) {
        let opcode = match op {
            BinOp::Add => OpCode::Add,
            BinOp::Sub => OpCode::Sub,
            BinOp::Mul => OpCode::Mul,
            BinOp::Div => OpCode::Div,
            BinOp::IDiv => OpCode::IDiv,
            BinOp::Mod => OpCode::Mod,
            BinOp::Pow => OpCode::Pow,
            BinOp::Eq => OpCode::Eq,
            BinOp::Ne => OpCode::Ne,
            BinOp::Lt => OpCode::Lt,
            BinOp::Le => OpCode::Le,
            BinOp::Gt => OpCode::Gt,
            BinOp::Ge => OpCode::Ge,
            BinOp::Concat => {
                self.emit_op_u8(OpCode::Concat, 2, line);
                return;
            }
            // Short-circuit operators never reach here
            BinOp::And | BinOp::Or => return,
        };
        self.emit_op(opcode, line);
    }

    // ==================== Variables ====================

    fn declare_local(&mut self, name: &str, span: Span) -> CompileResult<()> {
        if self.current.locals.len() >= MAX_LOCALS {
            return Err(self.error(CompileErrorKind::TooManyLocals(name.to_string()), span));
        }
        let start_pc = self.current.proto.current_offset() as u32;
        self.current.locals.push(Local {
            name: name.to_string(),
            depth: self.current.scope_depth,
            captured: false,
            start_pc,
        });
        self.current.max_locals = self.current.max_locals.max(self.current.locals.len());
        Ok(())
    }

    fn resolve_variable(&mut self, name: &Ident) -> CompileResult<Variable> {
        if let Some(index) = self.current.resolve_local(&name.name) {
            if self.current.guard.is_some_and(|guard| index >= guard) {
                return Err(self.error(
                    CompileErrorKind::ContinueSkipsLocal(name.name.clone()),
                    name.span,
                ));
            }
            return Ok(Variable::Local(slot(index)));
        }
        match resolve_upvalue(&mut self.current, &mut self.enclosing, &name.name) {
            Ok(Some(index)) => Ok(Variable::Upvalue(index)),
            Ok(None) => Ok(Variable::Global(self.name_constant(&name.name, name.span)?)),
            Err(kind) => Err(self.error(kind, name.span)),
        }
    }

    fn get_variable(&mut self, name: &Ident, line: u32) -> CompileResult<()> {
        match self.resolve_variable(name)? {
            Variable::Local(slot) => self.emit_op_u8(OpCode::GetLocal, slot, line),
            Variable::Upvalue(index) => self.emit_op_u8(OpCode::GetUpvalue, index, line),
            Variable::Global(constant) => self.emit_op_u16(OpCode::GetGlobal, constant, line),
        }
        Ok(())
    }

    /// Pop the top of the stack into a variable
    fn set_variable(&mut self, name: &Ident, line: u32) -> CompileResult<()> {
        match self.resolve_variable(name)? {
            Variable::Local(slot) => self.emit_op_u8(OpCode::SetLocal, slot, line),
            Variable::Upvalue(index) => self.emit_op_u8(OpCode::SetUpvalue, index, line),
            Variable::Global(constant) => self.emit_op_u16(OpCode::SetGlobal, constant, line),
        }
        Ok(())
    }

    // ==================== Scopes ====================

    fn begin_scope(&mut self) {
        self.current.scope_depth += 1;
    }

    fn end_scope(&mut self, line: u32) {
        self.current.scope_depth -= 1;
        let depth = self.current.scope_depth;
        let keep = self.current.locals.len()
            - self
                .current
                .locals
                .iter()
                .rev()
                .take_while(|l| l.depth > depth)
                .count();
        self.emit_pop_locals(keep, line);
        self.remove_locals(keep);
    }

    /// Emit code discarding every local past `keep`, closing captured ones.
    /// The compile-time scope is left untouched.
    fn emit_pop_locals(&mut self, keep: usize, line: u32) {
        let locals = &self.current.locals[keep.min(self.current.locals.len())..];
        if locals.is_empty() {
            return;
        }
        let count = locals.len();
        if locals.iter().any(|l| l.captured) {
            self.emit_op_u8(OpCode::Close, slot(keep), line);
        }
        self.emit_pop(count, line);
    }

    /// Forget locals past `keep`, recording their live ranges for debug info
    fn remove_locals(&mut self, keep: usize) {
        let end_pc = self.current.proto.current_offset() as u32;
        let record = self.options.debug_level >= 2;
        let state = &mut self.current;
        for (offset, local) in state.locals.drain(keep..).enumerate() {
            if record && !local.name.starts_with('(') {
                state.debug_locals.push(LocalVar {
                    name: local.name,
                    start_pc: local.start_pc,
                    end_pc,
                    slot: slot(keep + offset),
                });
            }
        }
    }

    // ==================== Emission ====================

    fn emit_op(&mut self, op: OpCode, line: u32) {
        self.current.proto.write_op(op, line);
    }

    fn emit_op_u8(&mut self, op: OpCode, operand: u8, line: u32) {
        self.current.proto.write_op_u8(op, operand, line);
    }

    fn emit_op_u16(&mut self, op: OpCode, operand: u16, line: u32) {
        self.current.proto.write_op_u16(op, operand, line);
    }

    fn emit_byte(&mut self, byte: u8, line: u32) {
        self.current.proto.write_byte(byte, line);
    }

    fn emit_pop(&mut self, mut count: usize, line: u32) {
        while count > 0 {
            let n = count.min(255);
            if n == 1 {
                self.emit_op(OpCode::Pop, line);
            } else {
                self.emit_op_u8(OpCode::PopN, n as u8, line);
            }
            count -= n;
        }
    }

    fn pick(&mut self, depth: usize, span: Span, line: u32) -> CompileResult<()> {
        match depth {
            0 => self.emit_op(OpCode::Dup, line),
            1..=255 => self.emit_op_u8(OpCode::Pick, depth as u8, line),
            _ => return Err(self.error(CompileErrorKind::ExpressionTooComplex, span)),
        }
        Ok(())
    }

    fn emit_jump(&mut self, op: OpCode, line: u32) -> usize {
        self.emit_op(op, line);
        self.current.proto.write_jump_placeholder(line)
    }

    fn patch_jump(&mut self, operand: usize, span: Span) -> CompileResult<()> {
        if self.current.proto.patch_jump(operand) {
            Ok(())
        } else {
            Err(self.error(CompileErrorKind::JumpTooLarge, span))
        }
    }

    fn emit_loop(&mut self, target: usize, span: Span, line: u32) -> CompileResult<()> {
        self.emit_op(OpCode::Jump, line);
        if self.current.proto.write_jump_back(target, line) {
            Ok(())
        } else {
            Err(self.error(CompileErrorKind::JumpTooLarge, span))
        }
    }

    fn emit_return_none(&mut self, line: u32) {
        self.emit_op(OpCode::Return, line);
        self.emit_byte(0, line);
        self.emit_byte(0, line);
    }

    fn emit_constant(&mut self, constant: Constant, span: Span, line: u32) -> CompileResult<()> {
        match constant {
            Constant::Nil => self.emit_op(OpCode::Nil, line),
            Constant::Boolean(true) => self.emit_op(OpCode::True, line),
            Constant::Boolean(false) => self.emit_op(OpCode::False, line),
            other => {
                let index = self
                    .current
                    .proto
                    .add_constant(other)
                    .ok_or_else(|| self.error(CompileErrorKind::TooManyConstants, span))?;
                self.emit_op_u16(OpCode::Const, index, line);
            }
        }
        Ok(())
    }

    fn name_constant(&mut self, name: &str, span: Span) -> CompileResult<u16> {
        self.current
            .proto
            .add_constant(Constant::String(name.as_bytes().to_vec()))
            .ok_or_else(|| self.error(CompileErrorKind::TooManyConstants, span))
    }

    // ==================== Diagnostics ====================

    fn line(&self, span: Span) -> u32 {
        self.lines.line(span.start)
    }

    fn error(&self, kind: CompileErrorKind, span: Span) -> CompileError {
        let location = self.lines.location(span.start);
        CompileError::new(kind, &self.chunk_name, location.line, location.column)
    }

    fn invalid_target(&self, target: &Expr) -> CompileError {
        self.error(
            CompileErrorKind::Syntax(ParseErrorKind::InvalidAssignmentTarget),
            target.span,
        )
    }
}

// ==================== Constant folding ====================

/// Evaluate an expression built only from literals
fn fold(expr: &Expr) -> Option<Constant> {
    match &expr.kind {
        ExprKind::Nil => Some(Constant::Nil),
        ExprKind::True => Some(Constant::Boolean(true)),
        ExprKind::False => Some(Constant::Boolean(false)),
        ExprKind::Number(n) => Some(Constant::Number(*n)),
        ExprKind::String(s) => Some(Constant::String(s.clone())),
        ExprKind::Paren(inner) => fold(inner),
        ExprKind::Unary { op, operand } => {
            let value = fold(operand)?;
            match op {
                UnaryOp::Neg => Some(Constant::Number(-value.as_number()?)),
                UnaryOp::Not => Some(Constant::Boolean(!value.is_truthy())),
                UnaryOp::Len => match value {
                    Constant::String(s) => Some(Constant::Number(s.len() as f64)),
                    _ => None,
                },
            }
        }
        ExprKind::Binary { op, left, right } => match op {
            BinOp::And => {
                let left = fold(left)?;
                if left.is_truthy() {
                    fold(right)
                } else {
                    Some(left)
                }
            }
            BinOp::Or => {
                let left = fold(left)?;
                if left.is_truthy() {
                    Some(left)
                } else {
                    fold(right)
                }
            }
            _ => fold_binary(*op, fold(left)?, fold(right)?),
        },
        _ => None,
    }
}

fn fold_binary(op: BinOp, left: Constant, right: Constant) -> Option<Constant> {
    use Constant::{Boolean, Number, String};

    if let Some(arith) = arith_op(op) {
        return match (left, right) {
            (Number(a), Number(b)) => Some(Number(number::arith(arith, a, b))),
            _ => None,
        };
    }
    match op {
        BinOp::Concat => {
            let mut bytes = concat_piece(&left)?;
            bytes.extend(concat_piece(&right)?);
            Some(String(bytes))
        }
        BinOp::Eq => Some(Boolean(constants_equal(&left, &right))),
        BinOp::Ne => Some(Boolean(!constants_equal(&left, &right))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (&left, &right) {
                (Number(a), Number(b)) => a.partial_cmp(b),
                (String(a), String(b)) => Some(a.cmp(b)),
                _ => return None,
            };
            let result = match (op, ordering) {
                (_, None) => false,
                (BinOp::Lt, Some(o)) => o.is_lt(),
                (BinOp::Le, Some(o)) => o.is_le(),
                (BinOp::Gt, Some(o)) => o.is_gt(),
                (_, Some(o)) => o.is_ge(),
            };
            Some(Boolean(result))
        }
        _ => None,
    }
}

fn arith_op(op: BinOp) -> Option<ArithOp> {
    Some(match op {
        BinOp::Add => ArithOp::Add,
        BinOp::Sub => ArithOp::Sub,
        BinOp::Mul => ArithOp::Mul,
        BinOp::Div => ArithOp::Div,
        BinOp::IDiv => ArithOp::IDiv,
        BinOp::Mod => ArithOp::Mod,
        BinOp::Pow => ArithOp::Pow,
        _ => return None,
    })
}

fn concat_piece(constant: &Constant) -> Option<Vec<u8>> {
    match constant {
        Constant::String(s) => Some(s.clone()),
        Constant::Number(n) => Some(number::format_number(*n).into_bytes()),
        _ => None,
    }
}

fn constants_equal(left: &Constant, right: &Constant) -> bool {
    match (left, right) {
        (Constant::Number(a), Constant::Number(b)) => a == b,
        _ => left == right,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_with(source: &str, options: CompileOptions) -> CompileResult<Chunk> {
        compile_chunk(source, "test", &options)
    }

    fn compile_ok(source: &str) -> Chunk {
        compile_with(source, CompileOptions::default()).unwrap()
    }

    fn compile_err(source: &str) -> CompileError {
        compile_with(source, CompileOptions::default()).unwrap_err()
    }

    /// Decode a prototype's instruction stream into opcodes
    fn opcodes(chunk: &Chunk, proto: &Proto) -> Vec<OpCode> {
        let code = proto.code();
        let mut ops = Vec::new();
        let mut offset = 0;
        while offset < code.len() {
            let op = OpCode::try_from(code[offset]).unwrap();
            let mut size = op.size();
            if op == OpCode::Closure {
                let child = proto.read_u16(offset + 1).unwrap() as usize;
                let index = proto.children[child] as usize;
                size += chunk.protos[index].num_upvalues as usize * 2;
            }
            ops.push(op);
            offset += size;
        }
        ops
    }

    fn main_ops(chunk: &Chunk) -> Vec<OpCode> {
        opcodes(chunk, chunk.main_proto().unwrap())
    }

    #[test]
    fn compile_locals_and_arithmetic() {
        let chunk = compile_ok("local x=10 local y=20 return x+y");
        assert_eq!(
            main_ops(&chunk),
            vec![
                OpCode::Const,
                OpCode::Const,
                OpCode::GetLocal,
                OpCode::GetLocal,
                OpCode::Add,
                OpCode::Return,
                OpCode::Return,
            ]
        );
        assert_eq!(chunk.main_proto().unwrap().max_stack, 3);
    }

    #[test]
    fn constant_folding() {
        let chunk = compile_ok("return 1 + 2 * 3, 'a' .. 'b' .. 1, not nil, -(4)");
        let main = chunk.main_proto().unwrap();
        assert!(!main_ops(&chunk).contains(&OpCode::Add));
        assert!(main.constants().contains(&Constant::Number(7.0)));
        assert!(main.constants().contains(&Constant::String(b"ab1".to_vec())));
        assert!(main.constants().contains(&Constant::Number(-4.0)));

        let unfolded = compile_with(
            "return 1 + 2 * 3",
            CompileOptions {
                optimization_level: 0,
                ..CompileOptions::default()
            },
        )
        .unwrap();
        let ops = main_ops(&unfolded);
        assert!(ops.contains(&OpCode::Add));
        assert!(ops.contains(&OpCode::Mul));
    }

    #[test]
    fn folding_keeps_runtime_errors() {
        // String arithmetic and mixed comparisons are left to the VM
        let chunk = compile_ok("return '1' + 2, 1 < 'x'");
        let ops = main_ops(&chunk);
        assert!(ops.contains(&OpCode::Add));
        assert!(ops.contains(&OpCode::Lt));
    }

    #[test]
    fn deterministic_output() {
        let source = "local t = {1, 2, x = 3}\nfor i, v in ipairs(t) do print(i, v) end";
        let a = compile(source, "det", &CompileOptions::default()).unwrap();
        let b = compile(source, "det", &CompileOptions::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn syntax_error_has_location() {
        let err = compile_err("return (");
        assert!(matches!(err.kind, CompileErrorKind::Syntax(_)));
        assert_eq!(err.line, 1);
        assert!(!err.message().is_empty());
        assert!(err.to_string().starts_with("test:1: "));
    }

    #[test]
    fn invalid_options_are_rejected() {
        let err = compile_with(
            "return 1",
            CompileOptions {
                vector_size: 4,
                ..CompileOptions::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::UnsupportedVectorSize(4));
    }

    #[test]
    fn upvalues_are_threaded() {
        let chunk = compile_ok(
            "local a = 1\nlocal function f() return function() return a end end\nreturn f",
        );
        // innermost, then f, then main
        assert_eq!(chunk.protos.len(), 3);
        assert_eq!(chunk.protos[0].num_upvalues, 1);
        assert_eq!(chunk.protos[1].num_upvalues, 1);
        assert_eq!(chunk.main, 2);

        // f captures main's local `a` in slot 1; the inner function reuses f's upvalue
        let f = &chunk.protos[1];
        let closure = opcodes(&chunk, f)
            .iter()
            .position(|op| *op == OpCode::Closure)
            .unwrap();
        assert_eq!(closure, 0);
        assert_eq!(&f.code()[3..5], &[0, 0]);

        let main = chunk.main_proto().unwrap();
        let at = main
            .code()
            .iter()
            .position(|b| *b == OpCode::Closure as u8)
            .unwrap();
        assert_eq!(&main.code()[at + 3..at + 5], &[1, 1]);
    }

    #[test]
    fn local_function_is_recursive() {
        let chunk = compile_ok("local function fact(n) if n <= 1 then return 1 end return n * fact(n - 1) end");
        let fact = &chunk.protos[0];
        assert_eq!(fact.name.as_deref(), Some("fact"));
        assert_eq!(fact.num_upvalues, 1);
        assert_eq!(fact.num_params, 1);
    }

    #[test]
    fn captured_loop_variables_are_closed() {
        let chunk = compile_ok("local fns = {}\nfor i = 1, 3 do fns[i] = function() return i end end");
        assert!(main_ops(&chunk).contains(&OpCode::Close));
    }

    #[test]
    fn too_many_locals() {
        let source: String = (0..201).map(|i| format!("local v{i} = {i}\n")).collect();
        let err = compile_err(&source);
        assert_eq!(err.kind, CompileErrorKind::TooManyLocals("v200".to_string()));
        assert_eq!(err.line, 201);
    }

    #[test]
    fn too_many_parameters() {
        let params: Vec<String> = (0..256).map(|i| format!("p{i}")).collect();
        let source = format!("local function f({}) end", params.join(", "));
        assert_eq!(compile_err(&source).kind, CompileErrorKind::TooManyParameters);
    }

    #[test]
    fn jump_too_large() {
        let body = "g = 1 ".repeat(8000);
        let err = compile_err(&format!("if x then {body} end"));
        assert_eq!(err.kind, CompileErrorKind::JumpTooLarge);
    }

    #[test]
    fn continue_in_repeat() {
        assert!(compile_with("repeat local x = 1 if x then continue end until x", CompileOptions::default()).is_ok());
        let err = compile_err("local i = 0 repeat i += 1 if i < 3 then continue end local stop = true until stop");
        assert_eq!(err.kind, CompileErrorKind::ContinueSkipsLocal("stop".to_string()));
    }

    #[test]
    fn dead_branches_at_level_two() {
        let options = CompileOptions {
            optimization_level: 2,
            ..CompileOptions::default()
        };
        let chunk = compile_with("if false then print(1) elseif true then return 2 end while false do print(3) end", options).unwrap();
        let ops = main_ops(&chunk);
        assert!(!ops.contains(&OpCode::GetGlobal));
        assert!(!ops.contains(&OpCode::JumpIfFalse));
    }

    #[test]
    fn debug_levels() {
        let source = "local function named(a) local b = a return b end";
        let stripped = compile_with(
            source,
            CompileOptions {
                debug_level: 0,
                ..CompileOptions::default()
            },
        )
        .unwrap();
        assert_eq!(stripped.protos[0].name, None);
        assert!(stripped.protos[0].line_runs().is_empty());

        let full = compile_with(
            source,
            CompileOptions {
                debug_level: 2,
                ..CompileOptions::default()
            },
        )
        .unwrap();
        let debug = full.protos[0].debug.as_ref().unwrap();
        let names: Vec<&str> = debug.locals.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(debug.locals[1].slot, 2);
    }

    #[test]
    fn table_constructor_batches() {
        let items: Vec<String> = (0..120).map(|i| i.to_string()).collect();
        let chunk = compile_ok(&format!("return {{{}, x = 1, f()}}", items.join(", ")));
        let ops = main_ops(&chunk);
        // 50 + 50 + 20 before the named field, then the multi tail
        assert_eq!(ops.iter().filter(|op| **op == OpCode::SetList).count(), 4);
        assert!(ops.contains(&OpCode::InitField));
    }

    #[test]
    fn multiple_assignment_evaluates_before_storing() {
        let chunk = compile_ok("local a, b = 1, 2\na, b = b, a");
        let ops = main_ops(&chunk);
        assert!(ops.contains(&OpCode::Pick));
        assert!(ops.contains(&OpCode::PopN));
    }

    #[test]
    fn method_calls_use_self() {
        let chunk = compile_ok("local s = 'x' return s:upper()");
        assert!(main_ops(&chunk).contains(&OpCode::SelfOp));
    }

    #[test]
    fn interpolation_concatenates() {
        let chunk = compile_ok("local n = 1 return `n = {n}!`");
        let ops = main_ops(&chunk);
        assert!(ops.contains(&OpCode::ToStr));
        assert!(ops.contains(&OpCode::Concat));
    }
}
