/// Compiler — AST to bytecode
///
/// One pass of scope analysis per function, then a single emission walk.
///
/// REGISTER PROMOTION
///   Parameters and `var` bindings become frame registers unless something
///   forces them into the environment record: capture by a nested function,
///   `with`, direct `eval`, or top-level/eval code (where `var` must create
///   global object properties). `let`/`const` always live in declarative
///   environments so TDZ and block scoping behave.
///
/// STACK DISCIPLINE
///   Every expression leaves exactly one value; every statement leaves
///   none. Constructs that keep a value live across their body (for-in/of
///   iterators, switch discriminants) record a cleanup count so `break`
///   can pop what the jump abandons.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::ast::*;
use crate::bytecode::{
    code_flags, CodeBuilder, CompiledCode, JumpPatch, Op, OpExt, SlotRef, TryKind, TryRange,
};
use crate::context::Context;
use crate::errors::{ParseError, ParseErrorKind, Position};
use crate::heap::{Cp, HeapCell};
use crate::parser::ParseFlags;

const MAX_REGISTERS: u16 = 200;
const MAX_CONSTS: usize = 32_000;

type CResult<T> = Result<T, ParseError>;

pub fn compile_program(
    ctx: &mut Context,
    program: &[Stmt],
    strict: bool,
    flags: ParseFlags,
) -> Result<Cp, ParseError> {
    let mut fc = FnCompiler::new(strict, true);
    if flags.eval {
        fc.flags |= code_flags::EVAL_CODE;
    }
    fc.compile_function_body(ctx, program, &[], None, Position::default())?;
    fc.finish(ctx, Position::default())
}

// ---------------------------------------------------------------------------
// Scope analysis walkers
// ---------------------------------------------------------------------------

/// Function-scoped declarations: `var` names and hoisted function
/// declarations, looked through blocks and control flow but not into nested
/// function bodies.
fn collect_hoisted(stmts: &[Stmt], vars: &mut Vec<String>, funcs: &mut Vec<FunctionDef>) {
    for stmt in stmts {
        match stmt {
            Stmt::VarDecl { kind: DeclKind::Var, decls, .. } => {
                for (name, _) in decls {
                    if !vars.contains(name) {
                        vars.push(name.clone());
                    }
                }
            }
            Stmt::FunctionDecl { func, .. } => {
                if let Some(name) = &func.name {
                    if !vars.contains(name) {
                        vars.push(name.clone());
                    }
                }
                funcs.push(func.clone());
            }
            Stmt::Block { body, .. } => collect_hoisted(body, vars, funcs),
            Stmt::If { then, otherwise, .. } => {
                collect_hoisted(std::slice::from_ref(then), vars, funcs);
                if let Some(e) = otherwise {
                    collect_hoisted(std::slice::from_ref(e), vars, funcs);
                }
            }
            Stmt::While { body, .. }
            | Stmt::DoWhile { body, .. }
            | Stmt::Labeled { body, .. }
            | Stmt::With { body, .. } => collect_hoisted(std::slice::from_ref(body), vars, funcs),
            Stmt::For { init, body, .. } => {
                if let Some(ForInit::Decl { kind: DeclKind::Var, decls }) = init {
                    for (name, _) in decls {
                        if !vars.contains(name) {
                            vars.push(name.clone());
                        }
                    }
                }
                collect_hoisted(std::slice::from_ref(body), vars, funcs);
            }
            Stmt::ForIn { target, body, .. } => {
                if let ForTarget::Decl { kind: DeclKind::Var, name } = target {
                    if !vars.contains(name) {
                        vars.push(name.clone());
                    }
                }
                collect_hoisted(std::slice::from_ref(body), vars, funcs);
            }
            Stmt::Try { block, catch, finally, .. } => {
                collect_hoisted(block, vars, funcs);
                if let Some(c) = catch {
                    collect_hoisted(&c.body, vars, funcs);
                }
                if let Some(f) = finally {
                    collect_hoisted(f, vars, funcs);
                }
            }
            Stmt::Switch { cases, .. } => {
                for c in cases {
                    collect_hoisted(&c.body, vars, funcs);
                }
            }
            _ => {}
        }
    }
}

/// Every identifier mentioned anywhere below, nested functions included.
/// Used as the capture over-approximation for register demotion.
fn collect_idents_deep(stmts: &[Stmt], out: &mut HashSet<String>) {
    struct W<'a> {
        out: &'a mut HashSet<String>,
    }
    impl<'a> W<'a> {
        fn stmt(&mut self, s: &Stmt) {
            match s {
                Stmt::Expr { expr, .. } | Stmt::Throw { arg: expr, .. } => self.expr(expr),
                Stmt::VarDecl { decls, .. } => {
                    for (name, init) in decls {
                        self.out.insert(name.clone());
                        if let Some(e) = init {
                            self.expr(e);
                        }
                    }
                }
                Stmt::FunctionDecl { func, .. } => self.func(func),
                Stmt::Return { arg, .. } => {
                    if let Some(e) = arg {
                        self.expr(e);
                    }
                }
                Stmt::If { cond, then, otherwise, .. } => {
                    self.expr(cond);
                    self.stmt(then);
                    if let Some(e) = otherwise {
                        self.stmt(e);
                    }
                }
                Stmt::Block { body, .. } => body.iter().for_each(|s| self.stmt(s)),
                Stmt::While { cond, body, .. } | Stmt::DoWhile { cond, body, .. } => {
                    self.expr(cond);
                    self.stmt(body);
                }
                Stmt::For { init, test, update, body, .. } => {
                    match init {
                        Some(ForInit::Decl { decls, .. }) => {
                            for (name, e) in decls {
                                self.out.insert(name.clone());
                                if let Some(e) = e {
                                    self.expr(e);
                                }
                            }
                        }
                        Some(ForInit::Expr(e)) => self.expr(e),
                        None => {}
                    }
                    if let Some(e) = test {
                        self.expr(e);
                    }
                    if let Some(e) = update {
                        self.expr(e);
                    }
                    self.stmt(body);
                }
                Stmt::ForIn { target, object, body, .. } => {
                    match target {
                        ForTarget::Decl { name, .. } => {
                            self.out.insert(name.clone());
                        }
                        ForTarget::Expr(e) => self.expr(e),
                    }
                    self.expr(object);
                    self.stmt(body);
                }
                Stmt::Try { block, catch, finally, .. } => {
                    block.iter().for_each(|s| self.stmt(s));
                    if let Some(c) = catch {
                        c.body.iter().for_each(|s| self.stmt(s));
                    }
                    if let Some(f) = finally {
                        f.iter().for_each(|s| self.stmt(s));
                    }
                }
                Stmt::Switch { disc, cases, .. } => {
                    self.expr(disc);
                    for c in cases {
                        if let Some(t) = &c.test {
                            self.expr(t);
                        }
                        c.body.iter().for_each(|s| self.stmt(s));
                    }
                }
                Stmt::Labeled { body, .. } => self.stmt(body),
                Stmt::With { object, body, .. } => {
                    self.expr(object);
                    self.stmt(body);
                }
                Stmt::Break { .. }
                | Stmt::Continue { .. }
                | Stmt::Empty { .. }
                | Stmt::Debugger { .. } => {}
            }
        }

        fn func(&mut self, f: &FunctionDef) {
            f.body.iter().for_each(|s| self.stmt(s));
        }

        fn expr(&mut self, e: &Expr) {
            match e {
                Expr::Ident { name, .. } => {
                    self.out.insert(name.clone());
                }
                Expr::Array { elements, .. } => {
                    for e in elements.iter().flatten() {
                        self.expr(e);
                    }
                }
                Expr::Object { props, .. } => {
                    for p in props {
                        match p {
                            ObjectProp::Data { key, value } => {
                                if let PropKey::Computed(k) = key {
                                    self.expr(k);
                                }
                                self.expr(value);
                            }
                            ObjectProp::Getter { key, func } | ObjectProp::Setter { key, func } => {
                                if let PropKey::Computed(k) = key {
                                    self.expr(k);
                                }
                                self.func(func);
                            }
                        }
                    }
                }
                Expr::Function { func, .. } | Expr::Arrow { func, .. } => self.func(func),
                Expr::Unary { expr, .. } => self.expr(expr),
                Expr::Update { target, .. } => self.expr(target),
                Expr::Binary { left, right, .. } | Expr::Logical { left, right, .. } => {
                    self.expr(left);
                    self.expr(right);
                }
                Expr::Assign { target, value, .. } => {
                    self.expr(target);
                    self.expr(value);
                }
                Expr::Conditional { cond, cons, alt, .. } => {
                    self.expr(cond);
                    self.expr(cons);
                    self.expr(alt);
                }
                Expr::Call { callee, args, .. } | Expr::New { callee, args, .. } => {
                    self.expr(callee);
                    for a in args {
                        self.expr(&a.expr);
                    }
                }
                Expr::Member { object, property, .. } => {
                    self.expr(object);
                    if let MemberKey::Computed(k) = property {
                        self.expr(k);
                    }
                }
                Expr::Sequence { exprs, .. } => exprs.iter().for_each(|e| self.expr(e)),
                Expr::Template { parts, .. } => {
                    for p in parts {
                        if let TemplateElem::Expr(e) = p {
                            self.expr(e);
                        }
                    }
                }
                Expr::Yield { arg, .. } => {
                    if let Some(e) = arg {
                        self.expr(e);
                    }
                }
                Expr::Await { arg, .. } => self.expr(arg),
                Expr::Number { .. }
                | Expr::Str { .. }
                | Expr::Regexp { .. }
                | Expr::Bool { .. }
                | Expr::Null { .. }
                | Expr::This { .. } => {}
            }
        }
    }
    let mut w = W { out };
    stmts.iter().for_each(|s| w.stmt(s));
}

/// Names captured by nested functions, plus facts that disable promotion.
struct Analysis {
    captured: HashSet<String>,
    uses_arguments: bool,
    has_direct_eval: bool,
    has_with: bool,
    has_let_or_const: bool,
}

fn analyze(stmts: &[Stmt]) -> Analysis {
    let mut a = Analysis {
        captured: HashSet::new(),
        uses_arguments: false,
        has_direct_eval: false,
        has_with: false,
        has_let_or_const: false,
    };
    for stmt in stmts {
        scan_stmt(stmt, &mut a);
    }
    a
}

fn scan_stmt(stmt: &Stmt, a: &mut Analysis) {
    match stmt {
        Stmt::With { .. } => a.has_with = true,
        Stmt::VarDecl { kind: DeclKind::Let | DeclKind::Const, .. } => a.has_let_or_const = true,
        _ => {}
    }
    match stmt {
        Stmt::FunctionDecl { func, .. } => {
            let mut inner = HashSet::new();
            collect_idents_deep(&func.body, &mut inner);
            a.captured.extend(inner);
            scan_for_eval(&func.body, a);
        }
        _ => {
            let mut exprs: Vec<&Expr> = Vec::new();
            stmt_exprs(stmt, &mut exprs);
            for e in exprs {
                scan_expr(e, a);
            }
            let mut children: Vec<&Stmt> = Vec::new();
            stmt_children(stmt, &mut children);
            for c in children {
                scan_stmt(c, a);
            }
        }
    }
}

fn scan_expr(e: &Expr, a: &mut Analysis) {
    match e {
        Expr::Ident { name, .. } => {
            if name == "arguments" {
                a.uses_arguments = true;
            }
        }
        Expr::Call { callee, args, .. } => {
            if let Expr::Ident { name, .. } = callee.as_ref() {
                if name == "eval" {
                    a.has_direct_eval = true;
                }
            }
            scan_expr(callee, a);
            for arg in args {
                scan_expr(&arg.expr, a);
            }
        }
        Expr::Function { func, .. } | Expr::Arrow { func, .. } => {
            // Everything a nested function mentions counts as captured.
            let mut inner = HashSet::new();
            collect_idents_deep(&func.body, &mut inner);
            inner.extend(func.params.iter().cloned());
            if func.is_arrow && inner.contains("arguments") {
                a.uses_arguments = true;
            }
            a.captured.extend(inner);
            scan_for_eval(&func.body, a);
        }
        Expr::Object { props, .. } => {
            for p in props {
                match p {
                    ObjectProp::Data { key, value } => {
                        if let PropKey::Computed(k) = key {
                            scan_expr(k, a);
                        }
                        scan_expr(value, a);
                    }
                    ObjectProp::Getter { key, func } | ObjectProp::Setter { key, func } => {
                        if let PropKey::Computed(k) = key {
                            scan_expr(k, a);
                        }
                        let mut inner = HashSet::new();
                        collect_idents_deep(&func.body, &mut inner);
                        a.captured.extend(inner);
                        scan_for_eval(&func.body, a);
                    }
                }
            }
        }
        _ => {
            let mut subs: Vec<&Expr> = Vec::new();
            expr_children(e, &mut subs);
            for s in subs {
                scan_expr(s, a);
            }
        }
    }
}

/// Direct eval anywhere below (nested functions included) poisons register
/// promotion for the whole enclosing function.
fn scan_for_eval(stmts: &[Stmt], a: &mut Analysis) {
    let mut idents = HashSet::new();
    collect_idents_deep(stmts, &mut idents);
    if idents.contains("eval") {
        a.has_direct_eval = true;
    }
}

fn stmt_exprs<'a>(stmt: &'a Stmt, out: &mut Vec<&'a Expr>) {
    match stmt {
        Stmt::Expr { expr, .. } | Stmt::Throw { arg: expr, .. } => out.push(expr),
        Stmt::VarDecl { decls, .. } => out.extend(decls.iter().filter_map(|(_, e)| e.as_ref())),
        Stmt::Return { arg, .. } => out.extend(arg.as_ref()),
        Stmt::If { cond, .. } => out.push(cond),
        Stmt::While { cond, .. } | Stmt::DoWhile { cond, .. } => out.push(cond),
        Stmt::For { init, test, update, .. } => {
            match init {
                Some(ForInit::Decl { decls, .. }) => {
                    out.extend(decls.iter().filter_map(|(_, e)| e.as_ref()))
                }
                Some(ForInit::Expr(e)) => out.push(e),
                None => {}
            }
            out.extend(test.as_ref());
            out.extend(update.as_ref());
        }
        Stmt::ForIn { target, object, .. } => {
            if let ForTarget::Expr(e) = target {
                out.push(e);
            }
            out.push(object);
        }
        Stmt::Switch { disc, cases, .. } => {
            out.push(disc);
            out.extend(cases.iter().filter_map(|c| c.test.as_ref()));
        }
        Stmt::With { object, .. } => out.push(object),
        _ => {}
    }
}

fn stmt_children<'a>(stmt: &'a Stmt, out: &mut Vec<&'a Stmt>) {
    match stmt {
        Stmt::If { then, otherwise, .. } => {
            out.push(then);
            out.extend(otherwise.iter().map(|b| b.as_ref()));
        }
        Stmt::Block { body, .. } => out.extend(body.iter()),
        Stmt::While { body, .. }
        | Stmt::DoWhile { body, .. }
        | Stmt::For { body, .. }
        | Stmt::ForIn { body, .. }
        | Stmt::Labeled { body, .. }
        | Stmt::With { body, .. } => out.push(body),
        Stmt::Try { block, catch, finally, .. } => {
            out.extend(block.iter());
            if let Some(c) = catch {
                out.extend(c.body.iter());
            }
            if let Some(f) = finally {
                out.extend(f.iter());
            }
        }
        Stmt::Switch { cases, .. } => {
            for c in cases {
                out.extend(c.body.iter());
            }
        }
        _ => {}
    }
}

fn expr_children<'a>(e: &'a Expr, out: &mut Vec<&'a Expr>) {
    match e {
        Expr::Array { elements, .. } => out.extend(elements.iter().flatten()),
        Expr::Unary { expr, .. } => out.push(expr),
        Expr::Update { target, .. } => out.push(target),
        Expr::Binary { left, right, .. } | Expr::Logical { left, right, .. } => {
            out.push(left);
            out.push(right);
        }
        Expr::Assign { target, value, .. } => {
            out.push(target);
            out.push(value);
        }
        Expr::Conditional { cond, cons, alt, .. } => {
            out.push(cond);
            out.push(cons);
            out.push(alt);
        }
        Expr::New { callee, args, .. } => {
            out.push(callee);
            out.extend(args.iter().map(|a| &a.expr));
        }
        Expr::Member { object, property, .. } => {
            out.push(object);
            if let MemberKey::Computed(k) = property {
                out.push(k);
            }
        }
        Expr::Sequence { exprs, .. } => out.extend(exprs.iter()),
        Expr::Template { parts, .. } => {
            for p in parts {
                if let TemplateElem::Expr(e) = p {
                    out.push(e);
                }
            }
        }
        Expr::Yield { arg, .. } => out.extend(arg.iter().map(|b| b.as_ref())),
        Expr::Await { arg, .. } => out.push(arg),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Loop / control context
// ---------------------------------------------------------------------------

struct LoopCtx {
    label: Option<String>,
    is_loop: bool,
    breaks: Vec<JumpPatch>,
    continues: Vec<JumpPatch>,
    /// Operand-stack values this construct keeps live across its body.
    cleanup: u16,
    env_depth: u16,
}

// ---------------------------------------------------------------------------
// Per-function compiler
// ---------------------------------------------------------------------------

struct FnCompiler {
    b: CodeBuilder,
    consts: Vec<Cp>,
    str_map: HashMap<String, u16>,
    num_map: Vec<(u64, u16)>,
    inner: Vec<Cp>,
    try_ranges: Vec<TryRange>,
    regs: HashMap<String, u16>,
    reg_count: u16,
    tmp_reg: Option<u16>,
    completion_reg: Option<u16>,
    strict: bool,
    top_level: bool,
    arg_count: u8,
    flags: u16,
    loops: Vec<LoopCtx>,
    /// Pending finally bodies, each with the loop-stack depth at its try
    /// entry so break/continue know which ones a jump escapes.
    finallys: Vec<(usize, Vec<Stmt>)>,
    env_depth: u16,
    name_const: Option<u16>,
    pending_label: Option<String>,
}

impl FnCompiler {
    fn new(strict: bool, top_level: bool) -> Self {
        FnCompiler {
            b: CodeBuilder::new(),
            consts: Vec::new(),
            str_map: HashMap::new(),
            num_map: Vec::new(),
            inner: Vec::new(),
            try_ranges: Vec::new(),
            regs: HashMap::new(),
            reg_count: 0,
            tmp_reg: None,
            completion_reg: None,
            strict,
            top_level,
            arg_count: 0,
            flags: if strict { code_flags::STRICT } else { 0 },
            loops: Vec::new(),
            finallys: Vec::new(),
            env_depth: 0,
            name_const: None,
            pending_label: None,
        }
    }

    fn err(&self, kind: ParseErrorKind, pos: Position, msg: &str) -> ParseError {
        ParseError::new(kind, pos, msg.to_string())
    }

    fn oom(&self, pos: Position) -> ParseError {
        self.err(ParseErrorKind::OutOfMemory, pos, "out of memory while compiling")
    }

    // ── Constants ────────────────────────────────────────────────────────

    fn const_str(&mut self, ctx: &mut Context, s: &str, pos: Position) -> CResult<u16> {
        if let Some(&ix) = self.str_map.get(s) {
            return Ok(ix);
        }
        if self.consts.len() >= MAX_CONSTS {
            return Err(self.err(ParseErrorKind::TooManyLiterals, pos, "constant table overflow"));
        }
        let cp = ctx.intern_string(s).map_err(|_| self.oom(pos))?;
        let ix = self.consts.len() as u16;
        self.consts.push(cp);
        self.str_map.insert(s.to_string(), ix);
        Ok(ix)
    }

    fn const_num(&mut self, ctx: &mut Context, n: f64, pos: Position) -> CResult<u16> {
        let bits = if n.is_nan() { f64::NAN.to_bits() } else { n.to_bits() };
        if let Some(&(_, ix)) = self.num_map.iter().find(|(b, _)| *b == bits) {
            return Ok(ix);
        }
        if self.consts.len() >= MAX_CONSTS {
            return Err(self.err(ParseErrorKind::TooManyLiterals, pos, "constant table overflow"));
        }
        let cp = ctx.intern_number(n).map_err(|_| self.oom(pos))?;
        let ix = self.consts.len() as u16;
        self.consts.push(cp);
        self.num_map.push((bits, ix));
        Ok(ix)
    }

    // ── Registers ────────────────────────────────────────────────────────

    fn alloc_reg(&mut self, pos: Position) -> CResult<u16> {
        if self.reg_count >= MAX_REGISTERS {
            return Err(self.err(ParseErrorKind::RegisterOverflow, pos, "too many registers"));
        }
        let r = self.reg_count;
        self.reg_count += 1;
        Ok(r)
    }

    fn tmp(&mut self, pos: Position) -> CResult<u16> {
        if let Some(r) = self.tmp_reg {
            return Ok(r);
        }
        let r = self.alloc_reg(pos)?;
        self.tmp_reg = Some(r);
        Ok(r)
    }

    // ── Function body compilation ────────────────────────────────────────

    fn compile_function_body(
        &mut self,
        ctx: &mut Context,
        body: &[Stmt],
        params: &[String],
        def: Option<&FunctionDef>,
        pos: Position,
    ) -> CResult<()> {
        let analysis = analyze(body);
        let promotion_ok = !self.top_level
            && !analysis.has_direct_eval
            && !analysis.has_with
            && !def.map(|d| d.is_generator || d.is_async).unwrap_or(false);

        let mut vars = Vec::new();
        let mut funcs = Vec::new();
        collect_hoisted(body, &mut vars, &mut funcs);

        // Parameters always arrive in registers 0..argc; promoted ones are
        // read there directly, captured ones get copied into the env.
        self.arg_count = params.len() as u8;
        self.reg_count = params.len() as u16;
        let rest = def.and_then(|d| d.rest.clone());
        if rest.is_some() {
            self.flags |= code_flags::HAS_REST;
            self.reg_count += 1;
        }

        let mut env_names: Vec<String> = Vec::new();
        for (i, p) in params.iter().enumerate() {
            if promotion_ok && !analysis.captured.contains(p) {
                self.regs.insert(p.clone(), i as u16);
            } else {
                env_names.push(p.clone());
            }
        }
        if let Some(r) = &rest {
            if promotion_ok && !analysis.captured.contains(r) {
                self.regs.insert(r.clone(), params.len() as u16);
            } else {
                env_names.push(r.clone());
            }
        }
        for v in &vars {
            if params.contains(v) || Some(v) == rest.as_ref() {
                continue;
            }
            if promotion_ok && !analysis.captured.contains(v) {
                let r = self.alloc_reg(pos)?;
                self.regs.insert(v.clone(), r);
            } else if !env_names.contains(v) {
                env_names.push(v.clone());
            }
        }

        let needs_env = self.top_level
            || !env_names.is_empty()
            || analysis.uses_arguments
            || analysis.has_let_or_const
            || analysis.has_with
            || analysis.has_direct_eval;
        if needs_env {
            self.flags |= code_flags::NEEDS_ENV;
        }
        if analysis.uses_arguments && def.map(|d| !d.is_arrow).unwrap_or(false) {
            self.flags |= code_flags::HAS_ARGUMENTS;
        }

        if self.top_level {
            let r = self.alloc_reg(pos)?;
            self.completion_reg = Some(r);
        }

        // Prologue: declare env bindings, copy captured params, bind the
        // hoisted functions.
        for name in &env_names {
            let ix = self.const_str(ctx, name, pos)?;
            self.b.op(Op::DeclVar);
            self.b.lit(ix);
        }
        for (i, p) in params.iter().enumerate() {
            if env_names.contains(p) {
                let ix = self.const_str(ctx, p, pos)?;
                self.b.op(Op::Push);
                self.b.slot(SlotRef::Reg(i as u16));
                self.b.op(Op::InitBinding);
                self.b.lit(ix);
            }
        }
        if let Some(r) = &rest {
            if env_names.contains(r) {
                let ix = self.const_str(ctx, r, pos)?;
                self.b.op(Op::Push);
                self.b.slot(SlotRef::Reg(params.len() as u16));
                self.b.op(Op::InitBinding);
                self.b.lit(ix);
            }
        }
        for func in &funcs {
            let inner_ix = self.compile_inner(ctx, func)?;
            let name = func.name.clone().unwrap_or_default();
            if let Some(&r) = self.regs.get(&name) {
                self.b.op(Op::CreateFunc);
                self.b.lit(inner_ix);
                self.b.op(Op::Store);
                self.b.slot(SlotRef::Reg(r));
            } else {
                let ix = self.const_str(ctx, &name, func.pos)?;
                if !env_names.contains(&name) {
                    self.b.op(Op::DeclVar);
                    self.b.lit(ix);
                }
                self.b.op(Op::CreateFunc);
                self.b.lit(inner_ix);
                self.b.op(Op::InitBinding);
                self.b.lit(ix);
            }
        }

        for stmt in body {
            self.stmt(ctx, stmt)?;
        }

        // Epilogue: scripts return their completion value, functions return
        // undefined when execution falls off the end.
        match self.completion_reg {
            Some(r) => {
                self.b.op(Op::Push);
                self.b.slot(SlotRef::Reg(r));
                self.b.op(Op::Return);
            }
            None => self.b.op(Op::ReturnUndefined),
        }
        Ok(())
    }

    fn compile_inner(&mut self, ctx: &mut Context, def: &FunctionDef) -> CResult<u16> {
        let mut fc = FnCompiler::new(def.is_strict, false);
        if def.is_arrow {
            fc.flags |= code_flags::ARROW;
        }
        if def.is_generator {
            fc.flags |= code_flags::GENERATOR;
        }
        if def.is_async {
            fc.flags |= code_flags::ASYNC;
        }
        fc.flags |= code_flags::FUNCTION_BODY;
        if let Some(name) = &def.name {
            let ix = fc.const_str(ctx, name, def.pos)?;
            fc.name_const = Some(ix);
        }
        fc.compile_function_body(ctx, &def.body, &def.params, Some(def), def.pos)?;
        let cp = fc.finish(ctx, def.pos)?;
        if self.inner.len() >= MAX_CONSTS {
            return Err(self.err(ParseErrorKind::TooManyLiterals, def.pos, "too many functions"));
        }
        let ix = self.inner.len() as u16;
        self.inner.push(cp);
        Ok(ix)
    }

    fn finish(mut self, ctx: &mut Context, pos: Position) -> CResult<Cp> {
        if self.reg_count > MAX_REGISTERS {
            return Err(self.err(ParseErrorKind::RegisterOverflow, pos, "too many registers"));
        }
        let code = CompiledCode {
            flags: self.flags,
            arg_count: self.arg_count,
            reg_count: self.reg_count as u8,
            consts: std::mem::take(&mut self.consts),
            inner: std::mem::take(&mut self.inner),
            try_ranges: std::mem::take(&mut self.try_ranges),
            code: std::mem::take(&mut self.b.code),
            name_const: self.name_const,
        };
        ctx.alloc_cell(HeapCell::Code(Rc::new(code))).map_err(|_| self.oom(pos))
    }

    fn cleanup_depth(&self) -> u16 {
        self.loops.iter().map(|l| l.cleanup).sum()
    }

    // ── Statements ───────────────────────────────────────────────────────

    fn stmt(&mut self, ctx: &mut Context, stmt: &Stmt) -> CResult<()> {
        match stmt {
            Stmt::Expr { expr, .. } => {
                self.expr(ctx, expr)?;
                match self.completion_reg {
                    Some(r) => {
                        self.b.op(Op::Store);
                        self.b.slot(SlotRef::Reg(r));
                    }
                    None => self.b.op(Op::Pop),
                }
                Ok(())
            }
            Stmt::Empty { .. } | Stmt::Debugger { .. } => {
                if matches!(stmt, Stmt::Debugger { .. }) {
                    self.b.ext(OpExt::Debugger);
                }
                Ok(())
            }
            Stmt::VarDecl { kind, decls, pos } => self.var_decl(ctx, *kind, decls, *pos),
            Stmt::FunctionDecl { .. } => Ok(()), // bound in the prologue
            Stmt::Return { arg, pos } => {
                match arg {
                    Some(e) => self.expr(ctx, e)?,
                    None => self.b.op(Op::PushUndefined),
                }
                // Run every pending finally body before leaving the frame.
                let finallys: Vec<Vec<Stmt>> =
                    self.finallys.iter().map(|(_, body)| body.clone()).collect();
                for body in finallys.iter().rev() {
                    for s in body {
                        self.stmt(ctx, s)?;
                    }
                }
                let _ = pos;
                self.b.op(Op::Return);
                Ok(())
            }
            Stmt::If { cond, then, otherwise, .. } => {
                self.expr(ctx, cond)?;
                let jf = self.b.jump_forward(Op::JumpIfFalseWide);
                self.stmt(ctx, then)?;
                match otherwise {
                    Some(e) => {
                        let jend = self.b.jump_forward(Op::JumpWide);
                        self.b.patch_jump(jf);
                        self.stmt(ctx, e)?;
                        self.b.patch_jump(jend);
                    }
                    None => self.b.patch_jump(jf),
                }
                Ok(())
            }
            Stmt::Block { body, .. } => {
                let scoped = body
                    .iter()
                    .any(|s| matches!(s, Stmt::VarDecl { kind: DeclKind::Let | DeclKind::Const, .. }));
                if scoped {
                    self.b.op(Op::PushEnv);
                    self.env_depth += 1;
                }
                for s in body {
                    self.stmt(ctx, s)?;
                }
                if scoped {
                    self.b.op(Op::PopEnv);
                    self.env_depth -= 1;
                }
                Ok(())
            }
            Stmt::While { cond, body, .. } => {
                let label = self.pending_label.take();
                let top = self.b.here();
                self.expr(ctx, cond)?;
                let jexit = self.b.jump_forward(Op::JumpIfFalseWide);
                self.push_loop(label, true, 0);
                self.stmt(ctx, body)?;
                self.b.jump_back(Op::Jump, Op::JumpWide, top);
                self.b.patch_jump(jexit);
                self.pop_loop(Some(top));
                Ok(())
            }
            Stmt::DoWhile { body, cond, .. } => {
                let label = self.pending_label.take();
                let top = self.b.here();
                self.push_loop(label, true, 0);
                self.stmt(ctx, body)?;
                let cont = self.b.here();
                self.expr(ctx, cond)?;
                // Loop back while true.
                let jexit = self.b.jump_forward(Op::JumpIfFalseWide);
                self.b.jump_back(Op::Jump, Op::JumpWide, top);
                self.b.patch_jump(jexit);
                self.pop_loop(Some(cont));
                Ok(())
            }
            Stmt::For { init, test, update, body, pos } => {
                let label = self.pending_label.take();
                let scoped = matches!(
                    init,
                    Some(ForInit::Decl { kind: DeclKind::Let | DeclKind::Const, .. })
                );
                if scoped {
                    self.b.op(Op::PushEnv);
                    self.env_depth += 1;
                }
                match init {
                    Some(ForInit::Decl { kind, decls }) => self.var_decl(ctx, *kind, decls, *pos)?,
                    Some(ForInit::Expr(e)) => {
                        self.expr(ctx, e)?;
                        self.b.op(Op::Pop);
                    }
                    None => {}
                }
                let top = self.b.here();
                let jexit = match test {
                    Some(t) => {
                        self.expr(ctx, t)?;
                        Some(self.b.jump_forward(Op::JumpIfFalseWide))
                    }
                    None => None,
                };
                self.push_loop(label, true, 0);
                self.stmt(ctx, body)?;
                let cont = self.b.here();
                if let Some(u) = update {
                    self.expr(ctx, u)?;
                    self.b.op(Op::Pop);
                }
                self.b.jump_back(Op::Jump, Op::JumpWide, top);
                if let Some(j) = jexit {
                    self.b.patch_jump(j);
                }
                self.pop_loop(Some(cont));
                if scoped {
                    self.b.op(Op::PopEnv);
                    self.env_depth -= 1;
                }
                Ok(())
            }
            Stmt::ForIn { target, object, body, of, pos } => {
                self.for_in(ctx, target, object, body, *of, *pos)
            }
            Stmt::Break { label, pos } => self.emit_break(ctx, label.as_deref(), *pos),
            Stmt::Continue { label, pos } => self.emit_continue(ctx, label.as_deref(), *pos),
            Stmt::Throw { arg, .. } => {
                self.expr(ctx, arg)?;
                self.b.op(Op::Throw);
                Ok(())
            }
            Stmt::Try { block, catch, finally, .. } => self.try_stmt(ctx, block, catch, finally),
            Stmt::Switch { disc, cases, .. } => self.switch_stmt(ctx, disc, cases),
            Stmt::Labeled { label, body, .. } => {
                self.pending_label = Some(label.clone());
                self.stmt(ctx, body)?;
                self.pending_label = None;
                Ok(())
            }
            Stmt::With { object, body, .. } => {
                self.expr(ctx, object)?;
                // The with-object becomes an object-bound environment.
                self.b.ext(OpExt::PushWithEnv);
                self.env_depth += 1;
                self.stmt(ctx, body)?;
                self.b.op(Op::PopEnv);
                self.env_depth -= 1;
                Ok(())
            }
        }
    }

    fn var_decl(
        &mut self,
        ctx: &mut Context,
        kind: DeclKind,
        decls: &[(String, Option<Expr>)],
        pos: Position,
    ) -> CResult<()> {
        for (name, init) in decls {
            match kind {
                DeclKind::Var => {
                    if let Some(e) = init {
                        self.expr(ctx, e)?;
                        self.store_ident(ctx, name, pos)?;
                    }
                }
                DeclKind::Let | DeclKind::Const => {
                    let ix = self.const_str(ctx, name, pos)?;
                    self.b.op(if kind == DeclKind::Let { Op::DeclLet } else { Op::DeclConst });
                    self.b.lit(ix);
                    match init {
                        Some(e) => self.expr(ctx, e)?,
                        None => self.b.op(Op::PushUndefined),
                    }
                    self.b.op(Op::InitBinding);
                    self.b.lit(ix);
                }
            }
        }
        Ok(())
    }

    /// Pop the stack top into the binding for `name`.
    fn store_ident(&mut self, ctx: &mut Context, name: &str, pos: Position) -> CResult<()> {
        if let Some(&r) = self.regs.get(name) {
            self.b.op(Op::Store);
            self.b.slot(SlotRef::Reg(r));
        } else {
            let ix = self.const_str(ctx, name, pos)?;
            self.b.op(Op::Assign);
            self.b.lit(ix);
        }
        Ok(())
    }

    fn push_loop(&mut self, label: Option<String>, is_loop: bool, cleanup: u16) {
        self.loops.push(LoopCtx {
            label,
            is_loop,
            breaks: Vec::new(),
            continues: Vec::new(),
            cleanup,
            env_depth: self.env_depth,
        });
    }

    /// Close the innermost loop: patch breaks to the current position and
    /// continues to `cont_target`.
    fn pop_loop(&mut self, cont_target: Option<usize>) {
        let ctx = self.loops.pop().unwrap_or_else(|| unreachable!("loop stack underflow"));
        for p in ctx.breaks {
            self.b.patch_jump(p);
        }
        if let Some(t) = cont_target {
            for p in ctx.continues {
                self.b.patch_jump_to(p, t);
            }
        }
    }

    fn find_loop(&self, label: Option<&str>, need_loop: bool) -> Option<usize> {
        for (i, l) in self.loops.iter().enumerate().rev() {
            match label {
                Some(want) => {
                    if l.label.as_deref() == Some(want) && (!need_loop || l.is_loop) {
                        return Some(i);
                    }
                }
                None => {
                    if !need_loop || l.is_loop {
                        return Some(i);
                    }
                }
            }
        }
        None
    }

    /// Finally bodies the jump escapes: every try entered after the target
    /// construct was pushed, innermost first.
    fn splice_escaped_finallys(&mut self, ctx: &mut Context, target: usize) -> CResult<()> {
        let pending: Vec<Vec<Stmt>> = self
            .finallys
            .iter()
            .filter(|(loops_at_entry, _)| *loops_at_entry > target)
            .map(|(_, body)| body.clone())
            .collect();
        for body in pending.iter().rev() {
            for s in body {
                self.stmt(ctx, s)?;
            }
        }
        Ok(())
    }

    fn emit_break(&mut self, ctx: &mut Context, label: Option<&str>, pos: Position) -> CResult<()> {
        let Some(target) = self.find_loop(label, false) else {
            return Err(self.err(ParseErrorKind::InvalidBreak, pos, "no enclosing breakable"));
        };
        self.splice_escaped_finallys(ctx, target)?;
        // Abandoned loop-owned stack values, innermost out, target included.
        let pops: u16 = self.loops[target..].iter().map(|l| l.cleanup).sum();
        for _ in 0..pops {
            self.b.op(Op::Pop);
        }
        let env_pops = self.env_depth - self.loops[target].env_depth;
        for _ in 0..env_pops {
            self.b.op(Op::PopEnv);
        }
        let patch = self.b.jump_forward(Op::JumpWide);
        self.loops[target].breaks.push(patch);
        Ok(())
    }

    fn emit_continue(&mut self, ctx: &mut Context, label: Option<&str>, pos: Position) -> CResult<()> {
        let Some(target) = self.find_loop(label, true) else {
            return Err(self.err(ParseErrorKind::InvalidContinue, pos, "no enclosing loop"));
        };
        // The continue stays inside the target loop, so only trys entered
        // within it are escaped.
        self.splice_escaped_finallys(ctx, target)?;
        // The target loop keeps its own stack values; only inner levels pop.
        let pops: u16 = self.loops[target + 1..].iter().map(|l| l.cleanup).sum();
        for _ in 0..pops {
            self.b.op(Op::Pop);
        }
        let env_pops = self.env_depth - self.loops[target].env_depth;
        for _ in 0..env_pops {
            self.b.op(Op::PopEnv);
        }
        let patch = self.b.jump_forward(Op::JumpWide);
        self.loops[target].continues.push(patch);
        Ok(())
    }

    fn for_in(
        &mut self,
        ctx: &mut Context,
        target: &ForTarget,
        object: &Expr,
        body: &Stmt,
        of: bool,
        pos: Position,
    ) -> CResult<()> {
        let label = self.pending_label.take();
        self.expr(ctx, object)?;
        self.b.op(if of { Op::ForOfInit } else { Op::ForInInit });

        let scoped = matches!(target, ForTarget::Decl { kind: DeclKind::Let | DeclKind::Const, .. });
        if scoped {
            self.b.op(Op::PushEnv);
            self.env_depth += 1;
            if let ForTarget::Decl { kind, name } = target {
                let ix = self.const_str(ctx, name, pos)?;
                self.b.op(if *kind == DeclKind::Const { Op::DeclConst } else { Op::DeclLet });
                self.b.lit(ix);
            }
        }

        let top = self.b.here();
        let done = self.b.jump_forward(Op::IterStep);
        // [iter, value] — move the value into the loop target.
        match target {
            ForTarget::Decl { kind: DeclKind::Var, name } => self.store_ident(ctx, name, pos)?,
            ForTarget::Decl { name, .. } => {
                let ix = self.const_str(ctx, name, pos)?;
                self.b.op(Op::InitBinding);
                self.b.lit(ix);
            }
            ForTarget::Expr(e) => match e.as_ref() {
                Expr::Ident { name, .. } => self.store_ident(ctx, name, pos)?,
                Expr::Member { object, property, .. } => {
                    let t = self.tmp(pos)?;
                    self.b.op(Op::Store);
                    self.b.slot(SlotRef::Reg(t));
                    self.expr(ctx, object)?;
                    match property {
                        MemberKey::Name(n) => {
                            let ix = self.const_str(ctx, n, pos)?;
                            self.b.op(Op::Push);
                            self.b.slot(SlotRef::Reg(t));
                            self.b.op(Op::SetProp);
                            self.b.lit(ix);
                        }
                        MemberKey::Computed(k) => {
                            self.expr(ctx, k)?;
                            self.b.op(Op::Push);
                            self.b.slot(SlotRef::Reg(t));
                            self.b.op(Op::SetElem);
                        }
                    }
                }
                _ => {
                    return Err(self.err(
                        ParseErrorKind::InvalidLhsInForLoop,
                        pos,
                        "invalid loop target",
                    ))
                }
            },
        }

        self.push_loop(label, true, 1);
        self.stmt(ctx, body)?;
        self.b.jump_back(Op::Jump, Op::JumpWide, top);
        self.b.patch_jump(done);
        self.pop_loop(Some(top));

        if scoped {
            self.b.op(Op::PopEnv);
            self.env_depth -= 1;
        }
        Ok(())
    }

    fn try_stmt(
        &mut self,
        ctx: &mut Context,
        block: &[Stmt],
        catch: &Option<CatchClause>,
        finally: &Option<Vec<Stmt>>,
    ) -> CResult<()> {
        let depth = self.cleanup_depth();
        let env_depth = self.env_depth;
        if let Some(f) = finally {
            self.finallys.push((self.loops.len(), f.clone()));
        }

        let try_start = self.b.here() as u32;
        for s in block {
            self.stmt(ctx, s)?;
        }
        let skip_catch = self.b.jump_forward(Op::JumpWide);
        // The range extends over the trailing jump so a call that ends the
        // block (whose resume ip lands on the jump) is still covered.
        let try_end = self.b.here() as u32;

        let mut catch_end = try_end;
        if let Some(clause) = catch {
            let handler = self.b.here() as u32;
            // Handler entry: the exception value is on the stack.
            match &clause.param {
                Some(param) => {
                    self.b.op(Op::PushEnv);
                    self.env_depth += 1;
                    let ix = self.const_str(ctx, param, clause.pos)?;
                    self.b.op(Op::DeclLet);
                    self.b.lit(ix);
                    self.b.op(Op::InitBinding);
                    self.b.lit(ix);
                    for s in &clause.body {
                        self.stmt(ctx, s)?;
                    }
                    self.b.op(Op::PopEnv);
                    self.env_depth -= 1;
                }
                None => {
                    self.b.op(Op::Pop);
                    for s in &clause.body {
                        self.stmt(ctx, s)?;
                    }
                }
            }
            // Guard instruction: keeps a call that ends the catch body
            // inside the finally range below.
            self.b.op(Op::Nop);
            catch_end = self.b.here() as u32;
            self.try_ranges.push(TryRange {
                start: try_start,
                end: try_end,
                handler,
                kind: TryKind::Catch,
                stack_depth: depth,
                env_depth,
            });
        }
        self.b.patch_jump(skip_catch);

        if let Some(f) = finally {
            self.finallys.pop();
            // Normal path: inline copy.
            for s in f {
                self.stmt(ctx, s)?;
            }
            let skip_handler = self.b.jump_forward(Op::JumpWide);
            // Exceptional path: run the body, then rethrow.
            let handler = self.b.here() as u32;
            let t = self.tmp(Position::default())?;
            self.b.op(Op::Store);
            self.b.slot(SlotRef::Reg(t));
            for s in f {
                self.stmt(ctx, s)?;
            }
            self.b.op(Op::Push);
            self.b.slot(SlotRef::Reg(t));
            self.b.op(Op::Throw);
            self.try_ranges.push(TryRange {
                start: try_start,
                end: catch_end.max(try_end),
                handler,
                kind: TryKind::Finally,
                stack_depth: depth,
                env_depth,
            });
            self.b.patch_jump(skip_handler);
        }
        Ok(())
    }

    fn switch_stmt(&mut self, ctx: &mut Context, disc: &Expr, cases: &[SwitchCase]) -> CResult<()> {
        let label = self.pending_label.take();
        self.expr(ctx, disc)?;
        self.push_loop(label, false, 1);

        // Dispatch: compare the discriminant against each case test.
        let mut case_jumps: Vec<(usize, JumpPatch)> = Vec::new();
        let mut default_ix: Option<usize> = None;
        for (i, case) in cases.iter().enumerate() {
            match &case.test {
                Some(test) => {
                    self.b.op(Op::Dup);
                    self.expr(ctx, test)?;
                    self.b.op(Op::StrictEq);
                    let j = self.b.jump_forward(Op::JumpIfTrueWide);
                    case_jumps.push((i, j));
                }
                None => default_ix = Some(i),
            }
        }
        let no_match = self.b.jump_forward(Op::JumpWide);

        // Bodies, in order, with fallthrough; the discriminant stays on the
        // stack until the end so the dispatch jumps are balanced.
        let mut body_starts = Vec::with_capacity(cases.len());
        for case in cases {
            body_starts.push(self.b.here());
            for s in &case.body {
                self.stmt(ctx, s)?;
            }
        }
        let end = self.b.here();

        for (i, j) in case_jumps {
            self.b.patch_jump_to(j, body_starts[i]);
        }
        match default_ix {
            Some(i) => self.b.patch_jump_to(no_match, body_starts[i]),
            None => self.b.patch_jump_to(no_match, end),
        }
        self.b.op(Op::Pop);
        self.pop_loop(None);
        Ok(())
    }

    // ── Expressions ──────────────────────────────────────────────────────

    fn expr(&mut self, ctx: &mut Context, e: &Expr) -> CResult<()> {
        match e {
            Expr::Number { value, pos } => self.number(ctx, *value, *pos),
            Expr::Str { value, pos } => {
                let ix = self.const_str(ctx, value, *pos)?;
                self.b.op(Op::Push);
                self.b.slot(SlotRef::Lit(ix));
                Ok(())
            }
            Expr::Template { parts, pos } => {
                let empty = self.const_str(ctx, "", *pos)?;
                self.b.op(Op::Push);
                self.b.slot(SlotRef::Lit(empty));
                for part in parts {
                    match part {
                        TemplateElem::Str(s) => {
                            let ix = self.const_str(ctx, s, *pos)?;
                            self.b.op(Op::Push);
                            self.b.slot(SlotRef::Lit(ix));
                        }
                        TemplateElem::Expr(e) => self.expr(ctx, e)?,
                    }
                    self.b.op(Op::Add);
                }
                Ok(())
            }
            Expr::Regexp { pattern, flags, pos } => {
                let p = self.const_str(ctx, pattern, *pos)?;
                let f = self.const_str(ctx, flags, *pos)?;
                self.b.ext(OpExt::CreateRegexp);
                self.b.lit(p);
                self.b.lit(f);
                Ok(())
            }
            Expr::Bool { value, .. } => {
                self.b.op(if *value { Op::PushTrue } else { Op::PushFalse });
                Ok(())
            }
            Expr::Null { .. } => {
                self.b.op(Op::PushNull);
                Ok(())
            }
            Expr::This { .. } => {
                self.b.op(Op::PushThis);
                Ok(())
            }
            Expr::Ident { name, pos } => {
                if let Some(&r) = self.regs.get(name) {
                    self.b.op(Op::Push);
                    self.b.slot(SlotRef::Reg(r));
                } else {
                    let ix = self.const_str(ctx, name, *pos)?;
                    self.b.op(Op::Resolve);
                    self.b.lit(ix);
                }
                Ok(())
            }
            Expr::Array { elements, .. } => {
                self.b.op(Op::CreateArray);
                for elem in elements {
                    match elem {
                        Some(e) => self.expr(ctx, e)?,
                        None => self.b.op(Op::PushUndefined),
                    }
                    self.b.op(Op::AppendElement);
                }
                Ok(())
            }
            Expr::Object { props, pos } => self.object_literal(ctx, props, *pos),
            Expr::Function { func, .. } | Expr::Arrow { func, .. } => {
                let ix = self.compile_inner(ctx, func)?;
                self.b.op(Op::CreateFunc);
                self.b.lit(ix);
                Ok(())
            }
            Expr::Unary { op, expr, pos } => self.unary(ctx, *op, expr, *pos),
            Expr::Update { inc, prefix, target, pos } => {
                self.update(ctx, *inc, *prefix, target, *pos)
            }
            Expr::Binary { op, left, right, .. } => {
                self.expr(ctx, left)?;
                self.expr(ctx, right)?;
                self.b.op(match op {
                    BinaryOp::Add => Op::Add,
                    BinaryOp::Sub => Op::Sub,
                    BinaryOp::Mul => Op::Mul,
                    BinaryOp::Div => Op::Div,
                    BinaryOp::Mod => Op::Mod,
                    BinaryOp::BitAnd => Op::BitAnd,
                    BinaryOp::BitOr => Op::BitOr,
                    BinaryOp::BitXor => Op::BitXor,
                    BinaryOp::Shl => Op::Shl,
                    BinaryOp::Shr => Op::Shr,
                    BinaryOp::UShr => Op::UShr,
                    BinaryOp::Eq => Op::Eq,
                    BinaryOp::NotEq => Op::NotEq,
                    BinaryOp::StrictEq => Op::StrictEq,
                    BinaryOp::StrictNotEq => Op::StrictNotEq,
                    BinaryOp::Lt => Op::Lt,
                    BinaryOp::LtEq => Op::LtEq,
                    BinaryOp::Gt => Op::Gt,
                    BinaryOp::GtEq => Op::GtEq,
                    BinaryOp::InstanceOf => Op::InstanceOf,
                    BinaryOp::In => Op::In,
                });
                Ok(())
            }
            Expr::Logical { op, left, right, .. } => {
                self.expr(ctx, left)?;
                self.b.op(Op::Dup);
                match op {
                    LogicalOp::And => {
                        let short = self.b.jump_forward(Op::JumpIfFalseWide);
                        self.b.op(Op::Pop);
                        self.expr(ctx, right)?;
                        self.b.patch_jump(short);
                    }
                    LogicalOp::Or => {
                        let short = self.b.jump_forward(Op::JumpIfTrueWide);
                        self.b.op(Op::Pop);
                        self.expr(ctx, right)?;
                        self.b.patch_jump(short);
                    }
                    LogicalOp::Coalesce => {
                        let take_rhs = self.b.jump_forward(Op::JumpIfNullishWide);
                        let keep = self.b.jump_forward(Op::JumpWide);
                        self.b.patch_jump(take_rhs);
                        self.b.op(Op::Pop);
                        self.expr(ctx, right)?;
                        self.b.patch_jump(keep);
                    }
                }
                Ok(())
            }
            Expr::Assign { op, target, value, pos } => {
                self.assign(ctx, *op, target, value, *pos)
            }
            Expr::Conditional { cond, cons, alt, .. } => {
                self.expr(ctx, cond)?;
                let jf = self.b.jump_forward(Op::JumpIfFalseWide);
                self.expr(ctx, cons)?;
                let jend = self.b.jump_forward(Op::JumpWide);
                self.b.patch_jump(jf);
                self.expr(ctx, alt)?;
                self.b.patch_jump(jend);
                Ok(())
            }
            Expr::Call { callee, args, pos } => self.call(ctx, callee, args, *pos),
            Expr::New { callee, args, pos } => {
                self.expr(ctx, callee)?;
                if args.iter().any(|a| a.spread) {
                    return Err(self.err(
                        ParseErrorKind::UnexpectedToken,
                        *pos,
                        "spread in new expressions is not supported",
                    ));
                }
                for a in args {
                    self.expr(ctx, &a.expr)?;
                }
                self.b.op(Op::New);
                self.b.byte(args.len() as u8);
                Ok(())
            }
            Expr::Member { object, property, pos } => {
                self.expr(ctx, object)?;
                match property {
                    MemberKey::Name(n) => {
                        let ix = self.const_str(ctx, n, *pos)?;
                        self.b.op(Op::GetProp);
                        self.b.lit(ix);
                    }
                    MemberKey::Computed(k) => {
                        self.expr(ctx, k)?;
                        self.b.op(Op::GetElem);
                    }
                }
                Ok(())
            }
            Expr::Sequence { exprs, pos } => {
                if exprs.is_empty() {
                    // Arrow cover-grammar leftover; cannot be evaluated.
                    return Err(self.err(
                        ParseErrorKind::UnexpectedToken,
                        *pos,
                        "unexpected empty parentheses",
                    ));
                }
                for (i, e) in exprs.iter().enumerate() {
                    self.expr(ctx, e)?;
                    if i + 1 != exprs.len() {
                        self.b.op(Op::Pop);
                    }
                }
                Ok(())
            }
            Expr::Yield { arg, delegate, pos } => {
                if *delegate {
                    let e = arg.as_ref().ok_or_else(|| {
                        self.err(ParseErrorKind::UnexpectedToken, *pos, "yield* needs an operand")
                    })?;
                    // Drain the inner iterator, yielding each value.
                    self.expr(ctx, e)?;
                    self.b.op(Op::ForOfInit);
                    let top = self.b.here();
                    let done = self.b.jump_forward(Op::IterStep);
                    self.b.op(Op::Yield);
                    self.b.op(Op::Pop);
                    self.b.jump_back(Op::Jump, Op::JumpWide, top);
                    self.b.patch_jump(done);
                    self.b.op(Op::PushUndefined);
                    return Ok(());
                }
                match arg {
                    Some(e) => self.expr(ctx, e)?,
                    None => self.b.op(Op::PushUndefined),
                }
                self.b.op(Op::Yield);
                Ok(())
            }
            Expr::Await { arg, .. } => {
                self.expr(ctx, arg)?;
                self.b.ext(OpExt::Await);
                Ok(())
            }
        }
    }

    fn number(&mut self, ctx: &mut Context, value: f64, pos: Position) -> CResult<()> {
        if value.fract() == 0.0
            && value >= i16::MIN as f64
            && value <= i16::MAX as f64
            && !(value == 0.0 && value.is_sign_negative())
        {
            self.b.op(Op::PushSmallInt);
            self.b.i16(value as i16);
            return Ok(());
        }
        let ix = self.const_num(ctx, value, pos)?;
        self.b.op(Op::Push);
        self.b.slot(SlotRef::Lit(ix));
        Ok(())
    }

    fn object_literal(
        &mut self,
        ctx: &mut Context,
        props: &[ObjectProp],
        pos: Position,
    ) -> CResult<()> {
        self.b.op(Op::CreateObject);
        for prop in props {
            match prop {
                ObjectProp::Data { key, value } => match key {
                    PropKey::Computed(k) => {
                        self.expr(ctx, k)?;
                        self.expr(ctx, value)?;
                        self.b.op(Op::DefineOwnElem);
                    }
                    _ => {
                        let ix = self.prop_key_const(ctx, key, pos)?;
                        self.expr(ctx, value)?;
                        self.b.op(Op::DefineOwnProp);
                        self.b.lit(ix);
                    }
                },
                ObjectProp::Getter { key, func } | ObjectProp::Setter { key, func } => {
                    if matches!(key, PropKey::Computed(_)) {
                        return Err(self.err(
                            ParseErrorKind::UnexpectedToken,
                            pos,
                            "computed accessor keys are not supported",
                        ));
                    }
                    let ix = self.prop_key_const(ctx, key, pos)?;
                    let inner = self.compile_inner(ctx, func)?;
                    self.b.op(Op::CreateFunc);
                    self.b.lit(inner);
                    self.b.ext(if matches!(prop, ObjectProp::Getter { .. }) {
                        OpExt::DefineGetter
                    } else {
                        OpExt::DefineSetter
                    });
                    self.b.lit(ix);
                }
            }
        }
        Ok(())
    }

    fn prop_key_const(&mut self, ctx: &mut Context, key: &PropKey, pos: Position) -> CResult<u16> {
        match key {
            PropKey::Ident(n) | PropKey::Str(n) => self.const_str(ctx, n, pos),
            PropKey::Num(n) => {
                let text = crate::context::number_to_js_string(*n);
                self.const_str(ctx, &text, pos)
            }
            PropKey::Computed(_) => unreachable!("computed keys take the elem path"),
        }
    }

    fn unary(&mut self, ctx: &mut Context, op: UnaryOp, expr: &Expr, pos: Position) -> CResult<()> {
        match op {
            UnaryOp::TypeOf => {
                if let Expr::Ident { name, .. } = expr {
                    if !self.regs.contains_key(name) {
                        let ix = self.const_str(ctx, name, pos)?;
                        self.b.op(Op::TypeOfIdent);
                        self.b.lit(ix);
                        return Ok(());
                    }
                }
                self.expr(ctx, expr)?;
                self.b.op(Op::TypeOf);
                Ok(())
            }
            UnaryOp::Delete => match expr {
                Expr::Member { object, property, .. } => {
                    self.expr(ctx, object)?;
                    match property {
                        MemberKey::Name(n) => {
                            let ix = self.const_str(ctx, n, pos)?;
                            self.b.op(Op::DeleteProp);
                            self.b.lit(ix);
                        }
                        MemberKey::Computed(k) => {
                            self.expr(ctx, k)?;
                            self.b.op(Op::DeleteElem);
                        }
                    }
                    Ok(())
                }
                Expr::Ident { name, .. } => {
                    // Sloppy mode only; strict is a parse error.
                    let ix = self.const_str(ctx, name, pos)?;
                    self.b.ext(OpExt::DeleteIdent);
                    self.b.lit(ix);
                    Ok(())
                }
                _ => {
                    self.expr(ctx, expr)?;
                    self.b.op(Op::Pop);
                    self.b.op(Op::PushTrue);
                    Ok(())
                }
            },
            UnaryOp::Void => {
                self.expr(ctx, expr)?;
                self.b.op(Op::Pop);
                self.b.op(Op::PushUndefined);
                Ok(())
            }
            _ => {
                self.expr(ctx, expr)?;
                self.b.op(match op {
                    UnaryOp::Neg => Op::Neg,
                    UnaryOp::Plus => Op::Plus,
                    UnaryOp::Not => Op::Not,
                    UnaryOp::BitNot => Op::BitNot,
                    _ => unreachable!(),
                });
                Ok(())
            }
        }
    }

    fn update(
        &mut self,
        ctx: &mut Context,
        inc: bool,
        prefix: bool,
        target: &Expr,
        pos: Position,
    ) -> CResult<()> {
        let step = if inc { Op::Inc } else { Op::Dec };
        match target {
            Expr::Ident { name, .. } => {
                self.load_ident(ctx, name, pos)?;
                if prefix {
                    self.b.op(step);
                    self.b.op(Op::Dup);
                    self.store_ident(ctx, name, pos)?;
                } else {
                    self.b.op(Op::Plus); // ToNumber so the old value is numeric
                    self.b.op(Op::Dup);
                    self.b.op(step);
                    self.store_ident(ctx, name, pos)?;
                }
                Ok(())
            }
            Expr::Member { object, property, .. } => {
                let t = self.tmp(pos)?;
                self.expr(ctx, object)?;
                match property {
                    MemberKey::Name(n) => {
                        let ix = self.const_str(ctx, n, pos)?;
                        self.b.op(Op::Dup);
                        self.b.op(Op::GetProp);
                        self.b.lit(ix);
                        // [obj, old]
                        if prefix {
                            self.b.op(step);
                            self.b.op(Op::Dup);
                            self.b.op(Op::Store);
                            self.b.slot(SlotRef::Reg(t));
                            // [obj, new] ; result parked in tmp
                            self.b.op(Op::SetProp);
                            self.b.lit(ix);
                        } else {
                            self.b.op(Op::Plus);
                            self.b.op(Op::Dup);
                            self.b.op(Op::Store);
                            self.b.slot(SlotRef::Reg(t));
                            self.b.op(step);
                            self.b.op(Op::SetProp);
                            self.b.lit(ix);
                        }
                        self.b.op(Op::Push);
                        self.b.slot(SlotRef::Reg(t));
                        Ok(())
                    }
                    MemberKey::Computed(k) => {
                        self.expr(ctx, k)?;
                        self.b.op(Op::Dup2);
                        self.b.op(Op::GetElem);
                        // [obj, key, old]
                        if prefix {
                            self.b.op(step);
                            self.b.op(Op::Dup);
                            self.b.op(Op::Store);
                            self.b.slot(SlotRef::Reg(t));
                            self.b.op(Op::SetElem);
                        } else {
                            self.b.op(Op::Plus);
                            self.b.op(Op::Dup);
                            self.b.op(Op::Store);
                            self.b.slot(SlotRef::Reg(t));
                            self.b.op(step);
                            self.b.op(Op::SetElem);
                        }
                        self.b.op(Op::Push);
                        self.b.slot(SlotRef::Reg(t));
                        Ok(())
                    }
                }
            }
            _ => Err(self.err(ParseErrorKind::InvalidAssignmentTarget, pos, "invalid target")),
        }
    }

    fn load_ident(&mut self, ctx: &mut Context, name: &str, pos: Position) -> CResult<()> {
        if let Some(&r) = self.regs.get(name) {
            self.b.op(Op::Push);
            self.b.slot(SlotRef::Reg(r));
        } else {
            let ix = self.const_str(ctx, name, pos)?;
            self.b.op(Op::Resolve);
            self.b.lit(ix);
        }
        Ok(())
    }

    fn assign(
        &mut self,
        ctx: &mut Context,
        op: AssignOp,
        target: &Expr,
        value: &Expr,
        pos: Position,
    ) -> CResult<()> {
        let bin = match op {
            AssignOp::Assign => None,
            AssignOp::Add => Some(Op::Add),
            AssignOp::Sub => Some(Op::Sub),
            AssignOp::Mul => Some(Op::Mul),
            AssignOp::Div => Some(Op::Div),
            AssignOp::Mod => Some(Op::Mod),
            AssignOp::BitAnd => Some(Op::BitAnd),
            AssignOp::BitOr => Some(Op::BitOr),
            AssignOp::BitXor => Some(Op::BitXor),
            AssignOp::Shl => Some(Op::Shl),
            AssignOp::Shr => Some(Op::Shr),
            AssignOp::UShr => Some(Op::UShr),
        };
        match target {
            Expr::Ident { name, .. } => {
                if let Some(b) = bin {
                    self.load_ident(ctx, name, pos)?;
                    self.expr(ctx, value)?;
                    self.b.op(b);
                } else {
                    self.expr(ctx, value)?;
                }
                self.b.op(Op::Dup);
                self.store_ident(ctx, name, pos)?;
                Ok(())
            }
            Expr::Member { object, property, .. } => {
                let t = self.tmp(pos)?;
                self.expr(ctx, object)?;
                match property {
                    MemberKey::Name(n) => {
                        let ix = self.const_str(ctx, n, pos)?;
                        if let Some(b) = bin {
                            self.b.op(Op::Dup);
                            self.b.op(Op::GetProp);
                            self.b.lit(ix);
                            self.expr(ctx, value)?;
                            self.b.op(b);
                        } else {
                            self.expr(ctx, value)?;
                        }
                        // [obj, result]
                        self.b.op(Op::Dup);
                        self.b.op(Op::Store);
                        self.b.slot(SlotRef::Reg(t));
                        self.b.op(Op::SetProp);
                        self.b.lit(ix);
                        self.b.op(Op::Push);
                        self.b.slot(SlotRef::Reg(t));
                        Ok(())
                    }
                    MemberKey::Computed(k) => {
                        self.expr(ctx, k)?;
                        if let Some(b) = bin {
                            self.b.op(Op::Dup2);
                            self.b.op(Op::GetElem);
                            self.expr(ctx, value)?;
                            self.b.op(b);
                        } else {
                            self.expr(ctx, value)?;
                        }
                        // [obj, key, result]
                        self.b.op(Op::Dup);
                        self.b.op(Op::Store);
                        self.b.slot(SlotRef::Reg(t));
                        self.b.op(Op::SetElem);
                        self.b.op(Op::Push);
                        self.b.slot(SlotRef::Reg(t));
                        Ok(())
                    }
                }
            }
            _ => Err(self.err(ParseErrorKind::InvalidAssignmentTarget, pos, "invalid target")),
        }
    }

    fn call(&mut self, ctx: &mut Context, callee: &Expr, args: &[Arg], pos: Position) -> CResult<()> {
        let has_spread = args.iter().any(|a| a.spread);
        if has_spread && !args.last().map(|a| a.spread).unwrap_or(false) {
            return Err(self.err(
                ParseErrorKind::UnexpectedToken,
                pos,
                "spread is only supported as the final argument",
            ));
        }
        let with_this = match callee {
            Expr::Member { object, property, .. } => {
                self.expr(ctx, object)?;
                self.b.op(Op::Dup);
                match property {
                    MemberKey::Name(n) => {
                        let ix = self.const_str(ctx, n, pos)?;
                        self.b.op(Op::GetProp);
                        self.b.lit(ix);
                    }
                    MemberKey::Computed(k) => {
                        self.expr(ctx, k)?;
                        self.b.op(Op::GetElem);
                    }
                }
                true
            }
            _ => {
                self.expr(ctx, callee)?;
                false
            }
        };
        for a in args {
            self.expr(ctx, &a.expr)?;
        }
        if has_spread {
            if with_this {
                // Collapse to a plain spread call; the receiver was already
                // bound through the member load above, so fold it away.
                return Err(self.err(
                    ParseErrorKind::UnexpectedToken,
                    pos,
                    "spread through a method call is not supported",
                ));
            }
            self.b.ext(OpExt::CallSpread);
            self.b.byte(args.len() as u8);
            return Ok(());
        }
        if with_this {
            self.b.op(Op::CallWithThis);
        } else {
            self.b.op(Op::Call);
        }
        self.b.byte(args.len() as u8);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Op;
    use crate::context::Context;
    use crate::parser::{parse, ParseFlags};

    fn compile_src(src: &str) -> (Context, Cp) {
        let mut ctx = Context::with_default_options();
        let code = parse(&mut ctx, src, ParseFlags::default()).expect("compile ok");
        (ctx, code)
    }

    #[test]
    fn test_small_int_uses_immediate_form() {
        let (ctx, code) = compile_src("1 + 2;");
        let code = ctx_code(&ctx, code);
        assert_eq!(Op::from_byte(code.code[0]), Op::PushSmallInt);
    }

    fn ctx_code(ctx: &Context, cp: Cp) -> std::rc::Rc<CompiledCode> {
        ctx_heap(ctx).code(cp)
    }

    fn ctx_heap(ctx: &Context) -> &crate::heap::Heap {
        // Tests in this module only peek at compiled output.
        ctx.heap_ref()
    }

    #[test]
    fn test_deterministic_bytecode() {
        let src = "var x = 1; function f(a) { return a * x; } f(3);";
        let (ctx_a, code_a) = compile_src(src);
        let (ctx_b, code_b) = compile_src(src);
        assert_eq!(ctx_code(&ctx_a, code_a).code, ctx_code(&ctx_b, code_b).code);
    }

    #[test]
    fn test_function_register_promotion() {
        // n is local and uncaptured: no Resolve in the inner function.
        let (ctx, code) = compile_src("function f(n) { var m = n + 1; return m; }");
        let outer = ctx_code(&ctx, code);
        let inner = ctx_heap(&ctx).code(outer.inner[0]);
        assert!(inner.reg_count >= 2, "param and local promoted to registers");
        let has_resolve = inner.code.iter().any(|&b| b == Op::Resolve as u8);
        assert!(!has_resolve, "promoted locals never resolve by name");
    }

    #[test]
    fn test_captured_var_not_promoted() {
        let (ctx, code) =
            compile_src("function f() { var c = 0; return function () { return c; }; }");
        let outer = ctx_code(&ctx, code);
        let f = ctx_heap(&ctx).code(outer.inner[0]);
        assert!(f.flags & code_flags::NEEDS_ENV != 0, "captured var forces an environment");
    }

    #[test]
    fn test_try_range_recorded() {
        let (ctx, code) = compile_src("try { throw 1; } catch (e) { e; }");
        let code = ctx_code(&ctx, code);
        assert_eq!(code.try_ranges.len(), 1);
        let r = code.try_ranges[0];
        assert_eq!(r.kind, TryKind::Catch);
        assert!(r.start < r.end && r.end <= r.handler);
    }

    #[test]
    fn test_strict_flag_propagates() {
        let (ctx, code) = compile_src("\"use strict\"; function f() { return 1; }");
        let outer = ctx_code(&ctx, code);
        assert!(outer.flags & code_flags::STRICT != 0);
        let inner = ctx_heap(&ctx).code(outer.inner[0]);
        assert!(inner.flags & code_flags::STRICT != 0, "strictness inherits");
    }
}
