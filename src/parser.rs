/// Parser — recursive descent over the token stream
///
/// Expressions use precedence climbing; statements are one function per
/// production. Tokens are pulled one at a time so the scanner can be told
/// whether a `/` may start a regular expression (decided from the previous
/// token). Automatic semicolon insertion consults the token's
/// newline-before flag.
///
/// Strict mode is tracked as parser state: the "use strict" directive
/// prologue switches it on for the enclosing program or function body, and
/// the early errors (reserved words, duplicate parameters, octal forms,
/// `delete identifier`) are raised at the offending token.
///
/// Nesting depth is bounded explicitly; pathological inputs get a parse
/// error instead of exhausting the native stack.

use crate::ast::*;
use crate::compiler;
use crate::context::Context;
use crate::errors::{ParseError, ParseErrorKind, Position};
use crate::heap::Cp;
use crate::lexer::{Kw, Lexer, Punct, TemplatePart, Token, TokenKind};

const MAX_NESTING_DEPTH: u32 = 256;

#[derive(Debug, Clone, Copy, Default)]
pub struct ParseFlags {
    /// Treat the source as already strict (CLI --strict, module-ish hosts).
    pub strict: bool,
    /// Code produced for eval; affects how the compiler scopes var bindings.
    pub eval: bool,
}

/// Parse source and compile it to a code block in one step.
pub fn parse(ctx: &mut Context, source: &str, flags: ParseFlags) -> Result<Cp, ParseError> {
    let mut parser = Parser::new(source, flags)?;
    let program = parser.parse_program()?;
    compiler::compile_program(ctx, &program, parser.strict, flags)
}

/// Parse without compiling; used by --parse-only and the tests.
pub fn parse_to_ast(source: &str, flags: ParseFlags) -> Result<Vec<Stmt>, ParseError> {
    let mut parser = Parser::new(source, flags)?;
    parser.parse_program()
}

/// Whether a `/` after this token starts a regexp rather than division.
fn regexp_allowed_after(kind: &TokenKind) -> bool {
    match kind {
        TokenKind::Ident(_)
        | TokenKind::Number(_)
        | TokenKind::Str(_)
        | TokenKind::Template(_)
        | TokenKind::Regexp { .. } => false,
        TokenKind::Keyword(Kw::This | Kw::True | Kw::False | Kw::Null | Kw::Super) => false,
        TokenKind::Keyword(_) => true,
        TokenKind::Punct(Punct::RParen | Punct::RBracket | Punct::PlusPlus | Punct::MinusMinus) => {
            false
        }
        TokenKind::Punct(_) => true,
        TokenKind::Eof => false,
    }
}

pub struct Parser {
    lexer: Lexer,
    current: Token,
    pub strict: bool,
    in_function: bool,
    in_generator: bool,
    in_async: bool,
    loop_depth: u32,
    switch_depth: u32,
    labels: Vec<(String, bool)>,
    no_in: bool,
    depth: u32,
}

type PResult<T> = Result<T, ParseError>;

impl Parser {
    pub fn new(source: &str, flags: ParseFlags) -> PResult<Self> {
        let mut lexer = Lexer::new(source);
        let current = lexer.next_token(true)?;
        Ok(Parser {
            lexer,
            current,
            strict: flags.strict,
            in_function: false,
            in_generator: false,
            in_async: false,
            loop_depth: 0,
            switch_depth: 0,
            labels: Vec::new(),
            no_in: false,
            depth: 0,
        })
    }

    // ── Token plumbing ───────────────────────────────────────────────────

    fn bump(&mut self) -> PResult<Token> {
        let allowed = regexp_allowed_after(&self.current.kind);
        let next = self.lexer.next_token(allowed)?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn eat_punct(&mut self, p: Punct) -> PResult<bool> {
        if self.current.is_punct(p) {
            self.bump()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect_punct(&mut self, p: Punct) -> PResult<Token> {
        if self.current.is_punct(p) {
            self.bump()
        } else {
            Err(self.unexpected(&format!("expected '{p:?}', found {}", self.current.describe())))
        }
    }

    fn eat_kw(&mut self, k: Kw) -> PResult<bool> {
        if self.current.is_kw(k) {
            self.bump()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect_kw(&mut self, k: Kw) -> PResult<Token> {
        if self.current.is_kw(k) {
            self.bump()
        } else {
            Err(self.unexpected(&format!(
                "expected '{}', found {}",
                k.text(),
                self.current.describe()
            )))
        }
    }

    fn pos(&self) -> Position {
        self.current.pos
    }

    fn unexpected(&self, message: &str) -> ParseError {
        ParseError::new(ParseErrorKind::UnexpectedToken, self.current.pos, message.to_string())
    }

    fn error_at(&self, kind: ParseErrorKind, pos: Position, message: &str) -> ParseError {
        ParseError::new(kind, pos, message.to_string())
    }

    /// An identifier token, admitting strict-only reserved words in sloppy
    /// mode.
    fn expect_binding_ident(&mut self) -> PResult<(String, Position)> {
        let pos = self.pos();
        match &self.current.kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                if self.strict && (name == "eval" || name == "arguments") {
                    return Err(self.error_at(
                        ParseErrorKind::StrictReservedWord,
                        pos,
                        &format!("'{name}' cannot be bound in strict mode"),
                    ));
                }
                self.bump()?;
                Ok((name, pos))
            }
            TokenKind::Keyword(k) if k.strict_only() => {
                if self.strict {
                    return Err(self.error_at(
                        ParseErrorKind::StrictReservedWord,
                        pos,
                        &format!("'{}' is reserved in strict mode", k.text()),
                    ));
                }
                let name = k.text().to_string();
                self.bump()?;
                Ok((name, pos))
            }
            _ => Err(self.unexpected(&format!(
                "expected identifier, found {}",
                self.current.describe()
            ))),
        }
    }

    /// Contextual identifier check without consuming.
    fn is_ident(&self, text: &str) -> bool {
        matches!(&self.current.kind, TokenKind::Ident(s) if s == text && !self.current.had_escape)
    }

    /// Statement terminator with automatic semicolon insertion: an explicit
    /// `;`, or a newline before the next token, or `}` / end of input.
    fn expect_semicolon(&mut self) -> PResult<()> {
        if self.eat_punct(Punct::Semicolon)? {
            return Ok(());
        }
        if self.current.newline_before
            || self.current.is_punct(Punct::RBrace)
            || self.current.kind == TokenKind::Eof
        {
            return Ok(());
        }
        Err(self.error_at(
            ParseErrorKind::MissingSemicolon,
            self.current.pos,
            &format!("expected ';' before {}", self.current.describe()),
        ))
    }

    fn enter(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(self.error_at(
                ParseErrorKind::NestingTooDeep,
                self.current.pos,
                "expression or statement nesting is too deep",
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // ── Program and bodies ───────────────────────────────────────────────

    pub fn parse_program(&mut self) -> PResult<Vec<Stmt>> {
        let mut body = Vec::new();
        self.parse_directive_prologue(&mut body)?;
        while self.current.kind != TokenKind::Eof {
            body.push(self.parse_statement()?);
        }
        Ok(body)
    }

    /// Consume leading string-literal statements; "use strict" flips the
    /// parser into strict mode before the rest of the body is read.
    fn parse_directive_prologue(&mut self, body: &mut Vec<Stmt>) -> PResult<()> {
        loop {
            let TokenKind::Str(text) = &self.current.kind else { return Ok(()) };
            let text = text.clone();
            let octal = self.current.octal_escape;
            let pos = self.pos();
            // A directive is a lone string literal statement; anything more
            // (an operator, a call) makes it an ordinary expression.
            let tok = self.bump()?;
            let terminated = self.current.is_punct(Punct::Semicolon)
                || self.current.newline_before
                || self.current.is_punct(Punct::RBrace)
                || self.current.kind == TokenKind::Eof;
            if !terminated {
                // Re-enter expression parsing with the literal as the head.
                let head = Expr::Str { value: text, pos: tok.pos };
                let expr = self.continue_expression(head)?;
                self.expect_semicolon()?;
                body.push(Stmt::Expr { expr, pos });
                return Ok(());
            }
            let _ = self.eat_punct(Punct::Semicolon)?;
            if text == "use strict" {
                self.strict = true;
                if octal {
                    return Err(self.error_at(
                        ParseErrorKind::OctalEscapeInStrictMode,
                        pos,
                        "octal escape in strict-mode directive",
                    ));
                }
            }
            body.push(Stmt::Expr { expr: Expr::Str { value: String::new(), pos }, pos });
            // Directives have no runtime effect; an empty string keeps the
            // statement slot without re-interning the text.
        }
    }

    // ── Statements ───────────────────────────────────────────────────────

    pub fn parse_statement(&mut self) -> PResult<Stmt> {
        self.enter()?;
        let result = self.parse_statement_inner();
        self.leave();
        result
    }

    fn parse_statement_inner(&mut self) -> PResult<Stmt> {
        let pos = self.pos();
        match &self.current.kind {
            TokenKind::Punct(Punct::LBrace) => {
                self.bump()?;
                let body = self.parse_statement_list(Punct::RBrace)?;
                self.expect_punct(Punct::RBrace)?;
                Ok(Stmt::Block { body, pos })
            }
            TokenKind::Punct(Punct::Semicolon) => {
                self.bump()?;
                Ok(Stmt::Empty { pos })
            }
            TokenKind::Keyword(Kw::Var) => {
                self.bump()?;
                self.parse_var_statement(DeclKind::Var, pos)
            }
            TokenKind::Keyword(Kw::Let) => {
                self.bump()?;
                self.parse_var_statement(DeclKind::Let, pos)
            }
            TokenKind::Keyword(Kw::Const) => {
                self.bump()?;
                self.parse_var_statement(DeclKind::Const, pos)
            }
            TokenKind::Keyword(Kw::Function) => {
                self.bump()?;
                let is_generator = self.eat_punct(Punct::Star)?;
                let func = self.parse_function_rest(true, is_generator, false, pos)?;
                Ok(Stmt::FunctionDecl { func, pos })
            }
            TokenKind::Keyword(Kw::If) => self.parse_if(pos),
            TokenKind::Keyword(Kw::While) => self.parse_while(pos),
            TokenKind::Keyword(Kw::Do) => self.parse_do_while(pos),
            TokenKind::Keyword(Kw::For) => self.parse_for(pos),
            TokenKind::Keyword(Kw::Return) => {
                if !self.in_function {
                    return Err(self.error_at(
                        ParseErrorKind::InvalidReturn,
                        pos,
                        "'return' outside of a function",
                    ));
                }
                self.bump()?;
                let arg = if self.current.is_punct(Punct::Semicolon)
                    || self.current.is_punct(Punct::RBrace)
                    || self.current.newline_before
                    || self.current.kind == TokenKind::Eof
                {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.expect_semicolon()?;
                Ok(Stmt::Return { arg, pos })
            }
            TokenKind::Keyword(Kw::Break) => {
                self.bump()?;
                let label = self.parse_jump_label()?;
                if label.is_none() && self.loop_depth == 0 && self.switch_depth == 0 {
                    return Err(self.error_at(
                        ParseErrorKind::InvalidBreak,
                        pos,
                        "'break' outside of a loop or switch",
                    ));
                }
                if let Some(l) = &label {
                    if !self.labels.iter().any(|(name, _)| name == l) {
                        return Err(self.error_at(
                            ParseErrorKind::InvalidBreak,
                            pos,
                            &format!("undefined label '{l}'"),
                        ));
                    }
                }
                self.expect_semicolon()?;
                Ok(Stmt::Break { label, pos })
            }
            TokenKind::Keyword(Kw::Continue) => {
                self.bump()?;
                let label = self.parse_jump_label()?;
                if self.loop_depth == 0 {
                    return Err(self.error_at(
                        ParseErrorKind::InvalidContinue,
                        pos,
                        "'continue' outside of a loop",
                    ));
                }
                if let Some(l) = &label {
                    if !self.labels.iter().any(|(name, is_loop)| name == l && *is_loop) {
                        return Err(self.error_at(
                            ParseErrorKind::InvalidContinue,
                            pos,
                            &format!("undefined loop label '{l}'"),
                        ));
                    }
                }
                self.expect_semicolon()?;
                Ok(Stmt::Continue { label, pos })
            }
            TokenKind::Keyword(Kw::Throw) => {
                self.bump()?;
                if self.current.newline_before {
                    return Err(
                        self.unexpected("line break is not allowed between 'throw' and its operand")
                    );
                }
                let arg = self.parse_expression()?;
                self.expect_semicolon()?;
                Ok(Stmt::Throw { arg, pos })
            }
            TokenKind::Keyword(Kw::Try) => self.parse_try(pos),
            TokenKind::Keyword(Kw::Switch) => self.parse_switch(pos),
            TokenKind::Keyword(Kw::With) => {
                if self.strict {
                    return Err(self.unexpected("'with' is not allowed in strict mode"));
                }
                self.bump()?;
                self.expect_punct(Punct::LParen)?;
                let object = self.parse_expression()?;
                self.expect_punct(Punct::RParen)?;
                let body = Box::new(self.parse_statement()?);
                Ok(Stmt::With { object, body, pos })
            }
            TokenKind::Keyword(Kw::Debugger) => {
                self.bump()?;
                self.expect_semicolon()?;
                Ok(Stmt::Debugger { pos })
            }
            TokenKind::Keyword(Kw::Class) => {
                Err(self.unexpected("class declarations are not supported"))
            }
            TokenKind::Keyword(Kw::Import) | TokenKind::Keyword(Kw::Export) => {
                Err(self.unexpected("modules are not supported"))
            }
            TokenKind::Ident(name) if name == "async" && !self.current.had_escape => {
                // `async function` declaration; plain `async` identifier
                // falls through to an expression statement.
                let saved = self.bump()?;
                if self.current.is_kw(Kw::Function) && !self.current.newline_before {
                    self.bump()?;
                    let is_generator = self.eat_punct(Punct::Star)?;
                    let func = self.parse_function_rest(true, is_generator, true, pos)?;
                    return Ok(Stmt::FunctionDecl { func, pos });
                }
                let head = Expr::Ident { name: "async".into(), pos: saved.pos };
                let expr = self.continue_expression(head)?;
                self.expect_semicolon()?;
                Ok(Stmt::Expr { expr, pos })
            }
            _ => {
                let expr = self.parse_expression()?;
                // A lone identifier followed by ':' is a labeled statement.
                if let Expr::Ident { name, .. } = &expr {
                    if self.current.is_punct(Punct::Colon) {
                        let label = name.clone();
                        self.bump()?;
                        let is_loop = matches!(
                            self.current.kind,
                            TokenKind::Keyword(Kw::While | Kw::Do | Kw::For)
                        );
                        self.labels.push((label.clone(), is_loop));
                        let body = Box::new(self.parse_statement()?);
                        self.labels.pop();
                        return Ok(Stmt::Labeled { label, body, pos });
                    }
                }
                self.expect_semicolon()?;
                Ok(Stmt::Expr { expr, pos })
            }
        }
    }

    fn parse_statement_list(&mut self, terminator: Punct) -> PResult<Vec<Stmt>> {
        let mut body = Vec::new();
        while !self.current.is_punct(terminator) {
            if self.current.kind == TokenKind::Eof {
                return Err(self.error_at(
                    ParseErrorKind::UnexpectedEnd,
                    self.current.pos,
                    "unexpected end of input",
                ));
            }
            body.push(self.parse_statement()?);
        }
        Ok(body)
    }

    fn parse_jump_label(&mut self) -> PResult<Option<String>> {
        if self.current.newline_before {
            return Ok(None);
        }
        if let TokenKind::Ident(name) = &self.current.kind {
            let name = name.clone();
            self.bump()?;
            return Ok(Some(name));
        }
        Ok(None)
    }

    fn parse_var_statement(&mut self, kind: DeclKind, pos: Position) -> PResult<Stmt> {
        let decls = self.parse_declarators(kind)?;
        self.expect_semicolon()?;
        Ok(Stmt::VarDecl { kind, decls, pos })
    }

    fn parse_declarators(&mut self, kind: DeclKind) -> PResult<Vec<(String, Option<Expr>)>> {
        let mut decls = Vec::new();
        loop {
            let (name, pos) = self.expect_binding_ident()?;
            let init = if self.eat_punct(Punct::Assign)? {
                Some(self.parse_assignment()?)
            } else {
                if kind == DeclKind::Const {
                    return Err(self.error_at(
                        ParseErrorKind::UnexpectedToken,
                        pos,
                        "missing initializer in const declaration",
                    ));
                }
                None
            };
            decls.push((name, init));
            if !self.eat_punct(Punct::Comma)? {
                break;
            }
        }
        Ok(decls)
    }

    fn parse_if(&mut self, pos: Position) -> PResult<Stmt> {
        self.expect_kw(Kw::If)?;
        self.expect_punct(Punct::LParen)?;
        let cond = self.parse_expression()?;
        self.expect_punct(Punct::RParen)?;
        let then = Box::new(self.parse_statement()?);
        let otherwise = if self.eat_kw(Kw::Else)? {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Stmt::If { cond, then, otherwise, pos })
    }

    fn parse_while(&mut self, pos: Position) -> PResult<Stmt> {
        self.expect_kw(Kw::While)?;
        self.expect_punct(Punct::LParen)?;
        let cond = self.parse_expression()?;
        self.expect_punct(Punct::RParen)?;
        self.loop_depth += 1;
        let body = Box::new(self.parse_statement()?);
        self.loop_depth -= 1;
        Ok(Stmt::While { cond, body, pos })
    }

    fn parse_do_while(&mut self, pos: Position) -> PResult<Stmt> {
        self.expect_kw(Kw::Do)?;
        self.loop_depth += 1;
        let body = Box::new(self.parse_statement()?);
        self.loop_depth -= 1;
        self.expect_kw(Kw::While)?;
        self.expect_punct(Punct::LParen)?;
        let cond = self.parse_expression()?;
        self.expect_punct(Punct::RParen)?;
        // do-while accepts ASI even before another statement.
        let _ = self.eat_punct(Punct::Semicolon)?;
        Ok(Stmt::DoWhile { body, cond, pos })
    }

    fn parse_for(&mut self, pos: Position) -> PResult<Stmt> {
        self.expect_kw(Kw::For)?;
        self.expect_punct(Punct::LParen)?;

        // Empty initializer.
        if self.eat_punct(Punct::Semicolon)? {
            return self.parse_for_rest(None, pos);
        }

        // Declaration head.
        let decl_kind = match self.current.kind {
            TokenKind::Keyword(Kw::Var) => Some(DeclKind::Var),
            TokenKind::Keyword(Kw::Let) => Some(DeclKind::Let),
            TokenKind::Keyword(Kw::Const) => Some(DeclKind::Const),
            _ => None,
        };
        if let Some(kind) = decl_kind {
            self.bump()?;
            let (name, name_pos) = self.expect_binding_ident()?;
            if self.current.is_kw(Kw::In) {
                self.bump()?;
                let object = self.parse_expression()?;
                self.expect_punct(Punct::RParen)?;
                let target = ForTarget::Decl { kind, name };
                return self.parse_for_in_body(target, object, false, pos);
            }
            if self.is_ident("of") {
                self.bump()?;
                let object = self.parse_assignment()?;
                self.expect_punct(Punct::RParen)?;
                let target = ForTarget::Decl { kind, name };
                return self.parse_for_in_body(target, object, true, pos);
            }
            // Ordinary for: finish this declarator, then the rest.
            let mut decls = Vec::new();
            let init = if self.eat_punct(Punct::Assign)? {
                let saved = self.no_in;
                self.no_in = true;
                let e = self.parse_assignment();
                self.no_in = saved;
                Some(e?)
            } else {
                if kind == DeclKind::Const {
                    return Err(self.error_at(
                        ParseErrorKind::UnexpectedToken,
                        name_pos,
                        "missing initializer in const declaration",
                    ));
                }
                None
            };
            decls.push((name, init));
            while self.eat_punct(Punct::Comma)? {
                let (n, _) = self.expect_binding_ident()?;
                let i = if self.eat_punct(Punct::Assign)? {
                    let saved = self.no_in;
                    self.no_in = true;
                    let e = self.parse_assignment();
                    self.no_in = saved;
                    Some(e?)
                } else {
                    None
                };
                decls.push((n, i));
            }
            self.expect_punct(Punct::Semicolon)?;
            return self.parse_for_rest(Some(ForInit::Decl { kind, decls }), pos);
        }

        // Expression head.
        let saved = self.no_in;
        self.no_in = true;
        let head = self.parse_expression();
        self.no_in = saved;
        let head = head?;

        if self.current.is_kw(Kw::In) {
            if !head.is_assign_target() {
                return Err(self.error_at(
                    ParseErrorKind::InvalidLhsInForLoop,
                    head.pos(),
                    "invalid left-hand side in for-in",
                ));
            }
            self.bump()?;
            let object = self.parse_expression()?;
            self.expect_punct(Punct::RParen)?;
            return self.parse_for_in_body(ForTarget::Expr(Box::new(head)), object, false, pos);
        }
        if self.is_ident("of") {
            if !head.is_assign_target() {
                return Err(self.error_at(
                    ParseErrorKind::InvalidLhsInForLoop,
                    head.pos(),
                    "invalid left-hand side in for-of",
                ));
            }
            self.bump()?;
            let object = self.parse_assignment()?;
            self.expect_punct(Punct::RParen)?;
            return self.parse_for_in_body(ForTarget::Expr(Box::new(head)), object, true, pos);
        }
        self.expect_punct(Punct::Semicolon)?;
        self.parse_for_rest(Some(ForInit::Expr(Box::new(head))), pos)
    }

    fn parse_for_rest(&mut self, init: Option<ForInit>, pos: Position) -> PResult<Stmt> {
        let test = if self.current.is_punct(Punct::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(Punct::Semicolon)?;
        let update = if self.current.is_punct(Punct::RParen) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(Punct::RParen)?;
        self.loop_depth += 1;
        let body = Box::new(self.parse_statement()?);
        self.loop_depth -= 1;
        Ok(Stmt::For { init, test, update, body, pos })
    }

    fn parse_for_in_body(
        &mut self,
        target: ForTarget,
        object: Expr,
        of: bool,
        pos: Position,
    ) -> PResult<Stmt> {
        self.loop_depth += 1;
        let body = Box::new(self.parse_statement()?);
        self.loop_depth -= 1;
        Ok(Stmt::ForIn { target, object, body, of, pos })
    }

    fn parse_try(&mut self, pos: Position) -> PResult<Stmt> {
        self.expect_kw(Kw::Try)?;
        self.expect_punct(Punct::LBrace)?;
        let block = self.parse_statement_list(Punct::RBrace)?;
        self.expect_punct(Punct::RBrace)?;

        let catch = if self.current.is_kw(Kw::Catch) {
            let cpos = self.pos();
            self.bump()?;
            let param = if self.eat_punct(Punct::LParen)? {
                let (name, _) = self.expect_binding_ident()?;
                self.expect_punct(Punct::RParen)?;
                Some(name)
            } else {
                None
            };
            self.expect_punct(Punct::LBrace)?;
            let body = self.parse_statement_list(Punct::RBrace)?;
            self.expect_punct(Punct::RBrace)?;
            Some(CatchClause { param, body, pos: cpos })
        } else {
            None
        };

        let finally = if self.eat_kw(Kw::Finally)? {
            self.expect_punct(Punct::LBrace)?;
            let body = self.parse_statement_list(Punct::RBrace)?;
            self.expect_punct(Punct::RBrace)?;
            Some(body)
        } else {
            None
        };

        if catch.is_none() && finally.is_none() {
            return Err(self.unexpected("missing catch or finally after try"));
        }
        Ok(Stmt::Try { block, catch, finally, pos })
    }

    fn parse_switch(&mut self, pos: Position) -> PResult<Stmt> {
        self.expect_kw(Kw::Switch)?;
        self.expect_punct(Punct::LParen)?;
        let disc = self.parse_expression()?;
        self.expect_punct(Punct::RParen)?;
        self.expect_punct(Punct::LBrace)?;

        let mut cases = Vec::new();
        let mut seen_default = false;
        self.switch_depth += 1;
        while !self.current.is_punct(Punct::RBrace) {
            let cpos = self.pos();
            let test = if self.eat_kw(Kw::Case)? {
                let e = self.parse_expression()?;
                Some(e)
            } else if self.eat_kw(Kw::Default)? {
                if seen_default {
                    self.switch_depth -= 1;
                    return Err(self.unexpected("multiple default clauses in switch"));
                }
                seen_default = true;
                None
            } else {
                self.switch_depth -= 1;
                return Err(self.unexpected("expected 'case' or 'default'"));
            };
            self.expect_punct(Punct::Colon)?;
            let mut body = Vec::new();
            while !self.current.is_punct(Punct::RBrace)
                && !self.current.is_kw(Kw::Case)
                && !self.current.is_kw(Kw::Default)
            {
                match self.parse_statement() {
                    Ok(s) => body.push(s),
                    Err(e) => {
                        self.switch_depth -= 1;
                        return Err(e);
                    }
                }
            }
            cases.push(SwitchCase { test, body, pos: cpos });
        }
        self.switch_depth -= 1;
        self.expect_punct(Punct::RBrace)?;
        Ok(Stmt::Switch { disc, cases, pos })
    }

    // ── Functions ────────────────────────────────────────────────────────

    /// Parse from after `function` (and optional `*`): name, parameters and
    /// body. `named` demands a binding name (declarations).
    fn parse_function_rest(
        &mut self,
        named: bool,
        is_generator: bool,
        is_async: bool,
        pos: Position,
    ) -> PResult<FunctionDef> {
        let name = if matches!(self.current.kind, TokenKind::Ident(_))
            || matches!(&self.current.kind, TokenKind::Keyword(k) if k.strict_only() && !self.strict)
        {
            Some(self.expect_binding_ident()?.0)
        } else if named {
            return Err(self.unexpected("expected function name"));
        } else {
            None
        };

        let (params, rest) = self.parse_params()?;
        let (body, body_strict) = self.parse_function_body(is_generator, is_async)?;
        if body_strict {
            // Re-validate under the body's own strictness.
            let saved = self.strict;
            self.strict = true;
            let check = self.validate_params(&params, pos);
            self.strict = saved;
            check?;
        } else {
            self.validate_params(&params, pos)?;
        }
        Ok(FunctionDef {
            name,
            params,
            rest,
            body,
            is_arrow: false,
            is_generator,
            is_async,
            is_strict: body_strict,
            pos,
        })
    }

    fn parse_params(&mut self) -> PResult<(Vec<String>, Option<String>)> {
        self.expect_punct(Punct::LParen)?;
        let mut params = Vec::new();
        let mut rest = None;
        while !self.current.is_punct(Punct::RParen) {
            if self.eat_punct(Punct::Ellipsis)? {
                let (name, pos) = self.expect_binding_ident()?;
                rest = Some(name);
                if !self.current.is_punct(Punct::RParen) {
                    return Err(self.error_at(
                        ParseErrorKind::RestParameterMustBeLast,
                        pos,
                        "rest parameter must be last",
                    ));
                }
                break;
            }
            let (name, _) = self.expect_binding_ident()?;
            params.push(name);
            if !self.eat_punct(Punct::Comma)? {
                break;
            }
        }
        self.expect_punct(Punct::RParen)?;
        Ok((params, rest))
    }

    /// Body in a fresh strict/generator/async context; the directive
    /// prologue may upgrade strictness for this body only. Returns the body
    /// and whether it ended up strict.
    fn parse_function_body(
        &mut self,
        is_generator: bool,
        is_async: bool,
    ) -> PResult<(Vec<Stmt>, bool)> {
        self.expect_punct(Punct::LBrace)?;
        let saved_strict = self.strict;
        let saved_fn = self.in_function;
        let saved_gen = self.in_generator;
        let saved_async = self.in_async;
        let saved_loops = self.loop_depth;
        let saved_switch = self.switch_depth;
        let saved_labels = std::mem::take(&mut self.labels);
        self.in_function = true;
        self.in_generator = is_generator;
        self.in_async = is_async;
        self.loop_depth = 0;
        self.switch_depth = 0;

        let mut body = Vec::new();
        let result = (|| -> PResult<()> {
            self.parse_directive_prologue(&mut body)?;
            let rest = self.parse_statement_list(Punct::RBrace)?;
            body.extend(rest);
            self.expect_punct(Punct::RBrace)?;
            Ok(())
        })();

        let body_strict = self.strict;
        self.strict = saved_strict;
        self.in_function = saved_fn;
        self.in_generator = saved_gen;
        self.in_async = saved_async;
        self.loop_depth = saved_loops;
        self.switch_depth = saved_switch;
        self.labels = saved_labels;
        result?;
        Ok((body, body_strict))
    }

    fn validate_params(&self, params: &[String], pos: Position) -> PResult<()> {
        if self.strict {
            for (i, p) in params.iter().enumerate() {
                if params[..i].contains(p) {
                    return Err(self.error_at(
                        ParseErrorKind::DuplicateParameter,
                        pos,
                        &format!("duplicate parameter '{p}' in strict mode"),
                    ));
                }
                if p == "eval" || p == "arguments" {
                    return Err(self.error_at(
                        ParseErrorKind::StrictReservedWord,
                        pos,
                        &format!("'{p}' cannot be a parameter name in strict mode"),
                    ));
                }
            }
        }
        Ok(())
    }

    // ── Expressions ──────────────────────────────────────────────────────

    /// Full expression, including the comma operator.
    pub fn parse_expression(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let first = self.parse_assignment()?;
        if !self.current.is_punct(Punct::Comma) {
            return Ok(first);
        }
        let mut exprs = vec![first];
        while self.eat_punct(Punct::Comma)? {
            exprs.push(self.parse_assignment()?);
        }
        Ok(Expr::Sequence { exprs, pos })
    }

    /// Re-enter expression parsing with an already-parsed head (directive
    /// fallback, `async` statement fallback).
    fn continue_expression(&mut self, head: Expr) -> PResult<Expr> {
        let head = self.parse_member_chain(head)?;
        let head = self.parse_binary_continue(head, 0)?;
        let head = self.parse_conditional_continue(head)?;
        self.parse_assignment_continue(head)
    }

    pub fn parse_assignment(&mut self) -> PResult<Expr> {
        self.enter()?;
        let result = self.parse_assignment_inner();
        self.leave();
        result
    }

    fn parse_assignment_inner(&mut self) -> PResult<Expr> {
        let pos = self.pos();

        if self.current.is_kw(Kw::Yield) {
            if !self.in_generator {
                return Err(self.unexpected("'yield' outside of a generator"));
            }
            self.bump()?;
            let delegate = self.eat_punct(Punct::Star)?;
            let arg = if self.current.newline_before
                || self.current.is_punct(Punct::Semicolon)
                || self.current.is_punct(Punct::RParen)
                || self.current.is_punct(Punct::RBrace)
                || self.current.is_punct(Punct::RBracket)
                || self.current.is_punct(Punct::Comma)
                || self.current.is_punct(Punct::Colon)
                || self.current.kind == TokenKind::Eof
            {
                None
            } else {
                Some(Box::new(self.parse_assignment()?))
            };
            return Ok(Expr::Yield { arg, delegate, pos });
        }

        let expr = self.parse_conditional()?;
        self.parse_assignment_continue(expr)
    }

    fn parse_assignment_continue(&mut self, expr: Expr) -> PResult<Expr> {
        let pos = expr.pos();

        // Arrow functions: `x => …`, `(a, b) => …`, `() => …`.
        if self.current.is_punct(Punct::Arrow) && !self.current.newline_before {
            return self.finish_arrow(expr, pos);
        }

        let op = match self.current.kind {
            TokenKind::Punct(Punct::Assign) => Some(AssignOp::Assign),
            TokenKind::Punct(Punct::PlusAssign) => Some(AssignOp::Add),
            TokenKind::Punct(Punct::MinusAssign) => Some(AssignOp::Sub),
            TokenKind::Punct(Punct::StarAssign) => Some(AssignOp::Mul),
            TokenKind::Punct(Punct::SlashAssign) => Some(AssignOp::Div),
            TokenKind::Punct(Punct::PercentAssign) => Some(AssignOp::Mod),
            TokenKind::Punct(Punct::AmpAssign) => Some(AssignOp::BitAnd),
            TokenKind::Punct(Punct::PipeAssign) => Some(AssignOp::BitOr),
            TokenKind::Punct(Punct::CaretAssign) => Some(AssignOp::BitXor),
            TokenKind::Punct(Punct::ShlAssign) => Some(AssignOp::Shl),
            TokenKind::Punct(Punct::ShrAssign) => Some(AssignOp::Shr),
            TokenKind::Punct(Punct::UShrAssign) => Some(AssignOp::UShr),
            _ => None,
        };
        let Some(op) = op else { return Ok(expr) };

        if !expr.is_assign_target() {
            return Err(self.error_at(
                ParseErrorKind::InvalidAssignmentTarget,
                pos,
                "invalid assignment target",
            ));
        }
        if self.strict {
            if let Expr::Ident { name, .. } = &expr {
                if name == "eval" || name == "arguments" {
                    return Err(self.error_at(
                        ParseErrorKind::InvalidAssignmentTarget,
                        pos,
                        &format!("cannot assign to '{name}' in strict mode"),
                    ));
                }
            }
        }
        self.bump()?;
        let value = Box::new(self.parse_assignment()?);
        Ok(Expr::Assign { op, target: Box::new(expr), value, pos })
    }

    fn finish_arrow(&mut self, params_expr: Expr, pos: Position) -> PResult<Expr> {
        let mut params = Vec::new();
        match params_expr {
            Expr::Ident { name, .. } => params.push(name),
            // An empty Sequence is the `()` cover-grammar marker.
            Expr::Sequence { exprs, .. } => {
                for e in exprs {
                    match e {
                        Expr::Ident { name, .. } => params.push(name),
                        other => {
                            return Err(self.error_at(
                                ParseErrorKind::InvalidAssignmentTarget,
                                other.pos(),
                                "invalid arrow function parameter",
                            ))
                        }
                    }
                }
            }
            other => {
                return Err(self.error_at(
                    ParseErrorKind::InvalidAssignmentTarget,
                    other.pos(),
                    "invalid arrow function parameter list",
                ))
            }
        }
        self.expect_punct(Punct::Arrow)?;

        let (body, body_strict) = if self.current.is_punct(Punct::LBrace) {
            self.parse_function_body(false, false)?
        } else {
            // Expression body desugars to a single return.
            let saved_fn = self.in_function;
            self.in_function = true;
            let e = self.parse_assignment();
            self.in_function = saved_fn;
            let e = e?;
            (vec![Stmt::Return { arg: Some(e), pos }], self.strict)
        };
        self.validate_params(&params, pos)?;
        Ok(Expr::Arrow {
            func: Box::new(FunctionDef {
                name: None,
                params,
                rest: None,
                body,
                is_arrow: true,
                is_generator: false,
                is_async: false,
                is_strict: body_strict,
                pos,
            }),
            pos,
        })
    }

    fn parse_conditional(&mut self) -> PResult<Expr> {
        let cond = self.parse_binary(0)?;
        self.parse_conditional_continue(cond)
    }

    fn parse_conditional_continue(&mut self, cond: Expr) -> PResult<Expr> {
        if !self.current.is_punct(Punct::Question) {
            return Ok(cond);
        }
        let pos = cond.pos();
        self.bump()?;
        let saved = self.no_in;
        self.no_in = false;
        let cons = self.parse_assignment();
        self.no_in = saved;
        let cons = cons?;
        self.expect_punct(Punct::Colon)?;
        let alt = self.parse_assignment()?;
        Ok(Expr::Conditional {
            cond: Box::new(cond),
            cons: Box::new(cons),
            alt: Box::new(alt),
            pos,
        })
    }

    /// Operator precedence for the climbing loop. Logical operators get the
    /// lowest levels so `a || b && c` groups as `a || (b && c)`.
    fn binary_prec(&self) -> Option<(u8, Result<BinaryOp, LogicalOp>)> {
        let entry = match self.current.kind {
            TokenKind::Punct(Punct::Coalesce) => (1, Err(LogicalOp::Coalesce)),
            TokenKind::Punct(Punct::PipePipe) => (1, Err(LogicalOp::Or)),
            TokenKind::Punct(Punct::AmpAmp) => (2, Err(LogicalOp::And)),
            TokenKind::Punct(Punct::Pipe) => (3, Ok(BinaryOp::BitOr)),
            TokenKind::Punct(Punct::Caret) => (4, Ok(BinaryOp::BitXor)),
            TokenKind::Punct(Punct::Amp) => (5, Ok(BinaryOp::BitAnd)),
            TokenKind::Punct(Punct::EqEq) => (6, Ok(BinaryOp::Eq)),
            TokenKind::Punct(Punct::NotEq) => (6, Ok(BinaryOp::NotEq)),
            TokenKind::Punct(Punct::EqEqEq) => (6, Ok(BinaryOp::StrictEq)),
            TokenKind::Punct(Punct::NotEqEq) => (6, Ok(BinaryOp::StrictNotEq)),
            TokenKind::Punct(Punct::Lt) => (7, Ok(BinaryOp::Lt)),
            TokenKind::Punct(Punct::LtEq) => (7, Ok(BinaryOp::LtEq)),
            TokenKind::Punct(Punct::Gt) => (7, Ok(BinaryOp::Gt)),
            TokenKind::Punct(Punct::GtEq) => (7, Ok(BinaryOp::GtEq)),
            TokenKind::Keyword(Kw::InstanceOf) => (7, Ok(BinaryOp::InstanceOf)),
            TokenKind::Keyword(Kw::In) => {
                if self.no_in {
                    return None;
                }
                (7, Ok(BinaryOp::In))
            }
            TokenKind::Punct(Punct::Shl) => (8, Ok(BinaryOp::Shl)),
            TokenKind::Punct(Punct::Shr) => (8, Ok(BinaryOp::Shr)),
            TokenKind::Punct(Punct::UShr) => (8, Ok(BinaryOp::UShr)),
            TokenKind::Punct(Punct::Plus) => (9, Ok(BinaryOp::Add)),
            TokenKind::Punct(Punct::Minus) => (9, Ok(BinaryOp::Sub)),
            TokenKind::Punct(Punct::Star) => (10, Ok(BinaryOp::Mul)),
            TokenKind::Punct(Punct::Slash) => (10, Ok(BinaryOp::Div)),
            TokenKind::Punct(Punct::Percent) => (10, Ok(BinaryOp::Mod)),
            _ => return None,
        };
        Some(entry)
    }

    fn parse_binary(&mut self, min_prec: u8) -> PResult<Expr> {
        let left = self.parse_unary()?;
        self.parse_binary_continue(left, min_prec)
    }

    fn parse_binary_continue(&mut self, mut left: Expr, min_prec: u8) -> PResult<Expr> {
        while let Some((prec, op)) = self.binary_prec() {
            if prec < min_prec {
                break;
            }
            let pos = left.pos();
            self.bump()?;
            let right = self.parse_binary(prec + 1)?;
            left = match op {
                Ok(bin) => Expr::Binary {
                    op: bin,
                    left: Box::new(left),
                    right: Box::new(right),
                    pos,
                },
                Err(logic) => Expr::Logical {
                    op: logic,
                    left: Box::new(left),
                    right: Box::new(right),
                    pos,
                },
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        self.enter()?;
        let result = self.parse_unary_inner();
        self.leave();
        result
    }

    fn parse_unary_inner(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let op = match self.current.kind {
            TokenKind::Punct(Punct::Minus) => Some(UnaryOp::Neg),
            TokenKind::Punct(Punct::Plus) => Some(UnaryOp::Plus),
            TokenKind::Punct(Punct::Bang) => Some(UnaryOp::Not),
            TokenKind::Punct(Punct::Tilde) => Some(UnaryOp::BitNot),
            TokenKind::Keyword(Kw::TypeOf) => Some(UnaryOp::TypeOf),
            TokenKind::Keyword(Kw::Void) => Some(UnaryOp::Void),
            TokenKind::Keyword(Kw::Delete) => Some(UnaryOp::Delete),
            _ => None,
        };
        if let Some(op) = op {
            self.bump()?;
            let expr = self.parse_unary()?;
            if op == UnaryOp::Delete && self.strict {
                if matches!(expr, Expr::Ident { .. }) {
                    return Err(self.error_at(
                        ParseErrorKind::DeleteOfIdentifier,
                        pos,
                        "delete of a plain identifier in strict mode",
                    ));
                }
            }
            return Ok(Expr::Unary { op, expr: Box::new(expr), pos });
        }

        if self.current.is_punct(Punct::PlusPlus) || self.current.is_punct(Punct::MinusMinus) {
            let inc = self.current.is_punct(Punct::PlusPlus);
            self.bump()?;
            let target = self.parse_unary()?;
            if !target.is_assign_target() {
                return Err(self.error_at(
                    ParseErrorKind::InvalidAssignmentTarget,
                    pos,
                    "invalid increment/decrement target",
                ));
            }
            return Ok(Expr::Update { inc, prefix: true, target: Box::new(target), pos });
        }

        if self.is_ident("await") && self.in_async {
            self.bump()?;
            let arg = self.parse_unary()?;
            return Ok(Expr::Await { arg: Box::new(arg), pos });
        }

        let expr = self.parse_postfix()?;
        Ok(expr)
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let expr = self.parse_call_member(true)?;
        // Postfix ++/-- must stay on the same line (ASI restriction).
        if (self.current.is_punct(Punct::PlusPlus) || self.current.is_punct(Punct::MinusMinus))
            && !self.current.newline_before
        {
            let inc = self.current.is_punct(Punct::PlusPlus);
            let pos = expr.pos();
            if !expr.is_assign_target() {
                return Err(self.error_at(
                    ParseErrorKind::InvalidAssignmentTarget,
                    pos,
                    "invalid increment/decrement target",
                ));
            }
            self.bump()?;
            return Ok(Expr::Update { inc, prefix: false, target: Box::new(expr), pos });
        }
        Ok(expr)
    }

    fn parse_call_member(&mut self, allow_call: bool) -> PResult<Expr> {
        let pos = self.pos();
        if self.current.is_kw(Kw::New) {
            self.bump()?;
            let callee = self.parse_call_member(false)?;
            let args = if self.current.is_punct(Punct::LParen) {
                self.parse_args()?
            } else {
                Vec::new()
            };
            let new_expr = Expr::New { callee: Box::new(callee), args, pos };
            return self.parse_member_chain_with(new_expr, allow_call);
        }
        let primary = self.parse_primary()?;
        self.parse_member_chain_with(primary, allow_call)
    }

    fn parse_member_chain(&mut self, head: Expr) -> PResult<Expr> {
        self.parse_member_chain_with(head, true)
    }

    fn parse_member_chain_with(&mut self, mut expr: Expr, allow_call: bool) -> PResult<Expr> {
        loop {
            let pos = expr.pos();
            if self.current.is_punct(Punct::Dot) {
                self.bump()?;
                let name = match &self.current.kind {
                    TokenKind::Ident(n) => n.clone(),
                    // Keywords are valid member names: obj.delete, obj.new.
                    TokenKind::Keyword(k) => k.text().to_string(),
                    _ => return Err(self.unexpected("expected property name after '.'")),
                };
                self.bump()?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: MemberKey::Name(name),
                    pos,
                };
            } else if self.current.is_punct(Punct::LBracket) {
                self.bump()?;
                let saved = self.no_in;
                self.no_in = false;
                let key = self.parse_expression();
                self.no_in = saved;
                let key = key?;
                self.expect_punct(Punct::RBracket)?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: MemberKey::Computed(Box::new(key)),
                    pos,
                };
            } else if allow_call && self.current.is_punct(Punct::LParen) {
                let args = self.parse_args()?;
                expr = Expr::Call { callee: Box::new(expr), args, pos };
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_args(&mut self) -> PResult<Vec<Arg>> {
        self.expect_punct(Punct::LParen)?;
        let mut args = Vec::new();
        while !self.current.is_punct(Punct::RParen) {
            let spread = self.eat_punct(Punct::Ellipsis)?;
            let saved = self.no_in;
            self.no_in = false;
            let expr = self.parse_assignment();
            self.no_in = saved;
            args.push(Arg { spread, expr: expr? });
            if !self.eat_punct(Punct::Comma)? {
                break;
            }
        }
        self.expect_punct(Punct::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        match &self.current.kind {
            TokenKind::Number(n) => {
                let value = *n;
                if self.strict && self.current.legacy_octal {
                    return Err(self.error_at(
                        ParseErrorKind::OctalInStrictMode,
                        pos,
                        "legacy octal literal in strict mode",
                    ));
                }
                self.bump()?;
                Ok(Expr::Number { value, pos })
            }
            TokenKind::Str(s) => {
                let value = s.clone();
                if self.strict && self.current.octal_escape {
                    return Err(self.error_at(
                        ParseErrorKind::OctalEscapeInStrictMode,
                        pos,
                        "octal escape sequence in strict mode",
                    ));
                }
                self.bump()?;
                Ok(Expr::Str { value, pos })
            }
            TokenKind::Template(_) => {
                let TokenKind::Template(parts) = self.bump()?.kind else { unreachable!() };
                let mut elems = Vec::new();
                for part in parts {
                    match part {
                        TemplatePart::Str(s) => elems.push(TemplateElem::Str(s)),
                        TemplatePart::Expr(src) => {
                            let mut sub = Parser::new(
                                &src,
                                ParseFlags { strict: self.strict, eval: false },
                            )?;
                            sub.in_function = self.in_function;
                            sub.in_generator = self.in_generator;
                            sub.in_async = self.in_async;
                            let expr = sub.parse_expression()?;
                            if sub.current.kind != TokenKind::Eof {
                                return Err(sub.unexpected("unexpected token in template"));
                            }
                            elems.push(TemplateElem::Expr(Box::new(expr)));
                        }
                    }
                }
                Ok(Expr::Template { parts: elems, pos })
            }
            TokenKind::Regexp { .. } => {
                let TokenKind::Regexp { pattern, flags } = self.bump()?.kind else {
                    unreachable!()
                };
                Ok(Expr::Regexp { pattern, flags, pos })
            }
            TokenKind::Keyword(Kw::True) => {
                self.bump()?;
                Ok(Expr::Bool { value: true, pos })
            }
            TokenKind::Keyword(Kw::False) => {
                self.bump()?;
                Ok(Expr::Bool { value: false, pos })
            }
            TokenKind::Keyword(Kw::Null) => {
                self.bump()?;
                Ok(Expr::Null { pos })
            }
            TokenKind::Keyword(Kw::This) => {
                self.bump()?;
                Ok(Expr::This { pos })
            }
            TokenKind::Keyword(Kw::Function) => {
                self.bump()?;
                let is_generator = self.eat_punct(Punct::Star)?;
                let func = self.parse_function_rest(false, is_generator, false, pos)?;
                Ok(Expr::Function { func: Box::new(func), pos })
            }
            TokenKind::Keyword(Kw::Class) => {
                Err(self.unexpected("class expressions are not supported"))
            }
            TokenKind::Ident(name) if name == "async" && !self.current.had_escape => {
                self.bump()?;
                if self.current.is_kw(Kw::Function) && !self.current.newline_before {
                    self.bump()?;
                    let is_generator = self.eat_punct(Punct::Star)?;
                    let func = self.parse_function_rest(false, is_generator, true, pos)?;
                    return Ok(Expr::Function { func: Box::new(func), pos });
                }
                Ok(Expr::Ident { name: "async".into(), pos })
            }
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.bump()?;
                Ok(Expr::Ident { name, pos })
            }
            TokenKind::Keyword(k) if k.strict_only() && !self.strict => {
                let name = k.text().to_string();
                self.bump()?;
                Ok(Expr::Ident { name, pos })
            }
            TokenKind::Punct(Punct::LParen) => {
                self.bump()?;
                if self.current.is_punct(Punct::RParen) {
                    // `()` is only valid as an arrow parameter list.
                    self.bump()?;
                    if !self.current.is_punct(Punct::Arrow) {
                        return Err(self.unexpected("expected '=>' after empty parameter list"));
                    }
                    return Ok(Expr::Sequence { exprs: Vec::new(), pos });
                }
                let saved = self.no_in;
                self.no_in = false;
                let expr = self.parse_expression();
                self.no_in = saved;
                let expr = expr?;
                self.expect_punct(Punct::RParen)?;
                Ok(expr)
            }
            TokenKind::Punct(Punct::LBracket) => {
                self.bump()?;
                let mut elements = Vec::new();
                loop {
                    if self.current.is_punct(Punct::RBracket) {
                        break;
                    }
                    if self.eat_punct(Punct::Comma)? {
                        elements.push(None);
                        continue;
                    }
                    let saved = self.no_in;
                    self.no_in = false;
                    let e = self.parse_assignment();
                    self.no_in = saved;
                    elements.push(Some(e?));
                    if !self.current.is_punct(Punct::RBracket) {
                        self.expect_punct(Punct::Comma)?;
                    }
                }
                self.expect_punct(Punct::RBracket)?;
                Ok(Expr::Array { elements, pos })
            }
            TokenKind::Punct(Punct::LBrace) => self.parse_object_literal(pos),
            TokenKind::Keyword(Kw::Super) => Err(self.unexpected("'super' is not supported here")),
            _ => Err(self.unexpected(&format!("unexpected token {}", self.current.describe()))),
        }
    }

    fn parse_object_literal(&mut self, pos: Position) -> PResult<Expr> {
        self.expect_punct(Punct::LBrace)?;
        let mut props = Vec::new();
        while !self.current.is_punct(Punct::RBrace) {
            let prop_pos = self.pos();

            // get/set accessor unless followed by ':', ',', '(' or '}'.
            let accessor = match &self.current.kind {
                TokenKind::Ident(n) if (n == "get" || n == "set") && !self.current.had_escape => {
                    Some(n.clone())
                }
                _ => None,
            };
            if let Some(kind) = accessor {
                let lookahead_ends_key = {
                    // Peek by cloning state is avoided: consume and decide.
                    self.bump()?;
                    self.current.is_punct(Punct::Colon)
                        || self.current.is_punct(Punct::Comma)
                        || self.current.is_punct(Punct::LParen)
                        || self.current.is_punct(Punct::RBrace)
                };
                if !lookahead_ends_key {
                    let key = self.parse_property_key()?;
                    let (params, rest) = self.parse_params()?;
                    let (body, body_strict) = self.parse_function_body(false, false)?;
                    let func = FunctionDef {
                        name: None,
                        params,
                        rest,
                        body,
                        is_arrow: false,
                        is_generator: false,
                        is_async: false,
                        is_strict: body_strict,
                        pos: prop_pos,
                    };
                    if kind == "get" {
                        props.push(ObjectProp::Getter { key, func });
                    } else {
                        props.push(ObjectProp::Setter { key, func });
                    }
                    if !self.eat_punct(Punct::Comma)? {
                        break;
                    }
                    continue;
                }
                // `get` / `set` was itself the key.
                let key = PropKey::Ident(kind);
                let prop = self.parse_property_tail(key, prop_pos)?;
                props.push(prop);
                if !self.eat_punct(Punct::Comma)? {
                    break;
                }
                continue;
            }

            let key = self.parse_property_key()?;
            let prop = self.parse_property_tail(key, prop_pos)?;
            props.push(prop);
            if !self.eat_punct(Punct::Comma)? {
                break;
            }
        }
        self.expect_punct(Punct::RBrace)?;
        Ok(Expr::Object { props, pos })
    }

    fn parse_property_key(&mut self) -> PResult<PropKey> {
        match &self.current.kind {
            TokenKind::Ident(n) => {
                let n = n.clone();
                self.bump()?;
                Ok(PropKey::Ident(n))
            }
            TokenKind::Keyword(k) => {
                let n = k.text().to_string();
                self.bump()?;
                Ok(PropKey::Ident(n))
            }
            TokenKind::Str(s) => {
                let s = s.clone();
                self.bump()?;
                Ok(PropKey::Str(s))
            }
            TokenKind::Number(n) => {
                let n = *n;
                self.bump()?;
                Ok(PropKey::Num(n))
            }
            TokenKind::Punct(Punct::LBracket) => {
                self.bump()?;
                let e = self.parse_assignment()?;
                self.expect_punct(Punct::RBracket)?;
                Ok(PropKey::Computed(Box::new(e)))
            }
            _ => Err(self.unexpected("expected property key")),
        }
    }

    fn parse_property_tail(&mut self, key: PropKey, pos: Position) -> PResult<ObjectProp> {
        if self.eat_punct(Punct::Colon)? {
            let saved = self.no_in;
            self.no_in = false;
            let value = self.parse_assignment();
            self.no_in = saved;
            return Ok(ObjectProp::Data { key, value: value? });
        }
        if self.current.is_punct(Punct::LParen) {
            // Method shorthand.
            let (params, rest) = self.parse_params()?;
            let (body, body_strict) = self.parse_function_body(false, false)?;
            let func = FunctionDef {
                name: None,
                params,
                rest,
                body,
                is_arrow: false,
                is_generator: false,
                is_async: false,
                is_strict: body_strict,
                pos,
            };
            return Ok(ObjectProp::Data { key, value: Expr::Function { func: Box::new(func), pos } });
        }
        // Shorthand `{ name }`.
        match &key {
            PropKey::Ident(name) => Ok(ObjectProp::Data {
                key: PropKey::Ident(name.clone()),
                value: Expr::Ident { name: name.clone(), pos },
            }),
            _ => Err(self.unexpected("expected ':' after property key")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Vec<Stmt> {
        parse_to_ast(src, ParseFlags::default()).expect("parse ok")
    }

    fn parse_err(src: &str) -> ParseError {
        parse_to_ast(src, ParseFlags::default()).expect_err("parse should fail")
    }

    fn parse_err_strict(src: &str) -> ParseError {
        parse_to_ast(src, ParseFlags { strict: true, eval: false })
            .expect_err("parse should fail")
    }

    #[test]
    fn test_var_and_expression() {
        let body = parse_ok("var x = 1 + 2; x * 10;");
        assert_eq!(body.len(), 2);
        assert!(matches!(&body[0], Stmt::VarDecl { kind: DeclKind::Var, .. }));
        assert!(matches!(&body[1], Stmt::Expr { .. }));
    }

    #[test]
    fn test_asi_inserts_semicolons() {
        let body = parse_ok("var a = 1\nvar b = 2\nb");
        assert_eq!(body.len(), 3);
        // And refuses where no line break helps:
        let err = parse_err("var a = 1 var b = 2");
        assert_eq!(err.kind, ParseErrorKind::MissingSemicolon);
    }

    #[test]
    fn test_precedence_shapes() {
        let body = parse_ok("x = 1 + 2 * 3;");
        let Stmt::Expr { expr: Expr::Assign { value, .. }, .. } = &body[0] else {
            panic!("expected assignment")
        };
        let Expr::Binary { op: BinaryOp::Add, right, .. } = value.as_ref() else {
            panic!("expected + at the top")
        };
        assert!(matches!(right.as_ref(), Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn test_logical_groups_below_bitwise() {
        let body = parse_ok("a || b && c;");
        let Stmt::Expr { expr: Expr::Logical { op: LogicalOp::Or, right, .. }, .. } = &body[0]
        else {
            panic!("expected || at the top")
        };
        assert!(matches!(right.as_ref(), Expr::Logical { op: LogicalOp::And, .. }));
    }

    #[test]
    fn test_arrow_forms() {
        parse_ok("var f = x => x + 1;");
        parse_ok("var g = (a, b) => { return a + b; };");
        parse_ok("var h = () => 42;");
        let err = parse_err("var bad = (1 + 2) => 3;");
        assert_eq!(err.kind, ParseErrorKind::InvalidAssignmentTarget);
    }

    #[test]
    fn test_object_literal_accessors() {
        let body = parse_ok("var o = { x: 1, get y() { return 2; }, set y(v) {}, z };");
        let Stmt::VarDecl { decls, .. } = &body[0] else { panic!() };
        let Some(Expr::Object { props, .. }) = &decls[0].1 else { panic!() };
        assert_eq!(props.len(), 4);
        assert!(matches!(props[1], ObjectProp::Getter { .. }));
        assert!(matches!(props[2], ObjectProp::Setter { .. }));
    }

    #[test]
    fn test_for_variants() {
        parse_ok("for (var i = 0; i < 10; i++) ;");
        parse_ok("for (;;) break;");
        parse_ok("for (var k in o) ;");
        parse_ok("for (var v of arr) ;");
        parse_ok("for (x in o) ;");
        let err = parse_err("for (1 in o) ;");
        assert_eq!(err.kind, ParseErrorKind::InvalidLhsInForLoop);
    }

    #[test]
    fn test_strict_early_errors() {
        assert_eq!(parse_err("\"use strict\"; a = 0777;").kind, ParseErrorKind::OctalInStrictMode);
        assert_eq!(
            parse_err("\"use strict\"; function f(a, a) {}").kind,
            ParseErrorKind::DuplicateParameter
        );
        assert_eq!(
            parse_err("\"use strict\"; delete x;").kind,
            ParseErrorKind::DeleteOfIdentifier
        );
        assert_eq!(
            parse_err_strict("var let = 1;").kind,
            ParseErrorKind::StrictReservedWord
        );
        // All fine in sloppy mode.
        parse_ok("a = 0777; var let = 1;");
    }

    #[test]
    fn test_strict_directive_scoped_to_function() {
        // Octal is legal outside the strict function.
        parse_ok("function f() { \"use strict\"; } var x = 0777;");
        let err = parse_err("function f() { \"use strict\"; var y = 0777; }");
        assert_eq!(err.kind, ParseErrorKind::OctalInStrictMode);
    }

    #[test]
    fn test_break_continue_validation() {
        assert_eq!(parse_err("break;").kind, ParseErrorKind::InvalidBreak);
        assert_eq!(parse_err("continue;").kind, ParseErrorKind::InvalidContinue);
        parse_ok("while (1) { break; }");
        parse_ok("outer: while (1) { while (1) { continue outer; } }");
        assert_eq!(
            parse_err("while (1) { continue missing; }").kind,
            ParseErrorKind::InvalidContinue
        );
    }

    #[test]
    fn test_return_outside_function() {
        assert_eq!(parse_err("return 1;").kind, ParseErrorKind::InvalidReturn);
    }

    #[test]
    fn test_nesting_limit() {
        let src = format!("x = {}1{};", "(".repeat(600), ")".repeat(600));
        let err = parse_err(&src);
        assert_eq!(err.kind, ParseErrorKind::NestingTooDeep);
    }

    #[test]
    fn test_try_requires_handler() {
        assert!(parse_to_ast("try {} ", ParseFlags::default()).is_err());
        parse_ok("try {} catch (e) {}");
        parse_ok("try {} finally {}");
    }

    #[test]
    fn test_generator_yield() {
        parse_ok("function* g() { yield 1; yield* inner(); }");
        let err = parse_err("function f() { yield 1; }");
        assert_eq!(err.kind, ParseErrorKind::UnexpectedToken);
    }

    #[test]
    fn test_member_keywords_allowed() {
        parse_ok("a.delete; b.new; c.in;");
    }

    #[test]
    fn test_template_expression_parsed() {
        let body = parse_ok("var s = `n=${1 + 2}`;");
        let Stmt::VarDecl { decls, .. } = &body[0] else { panic!() };
        let Some(Expr::Template { parts, .. }) = &decls[0].1 else { panic!() };
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[1], TemplateElem::Expr(e) if matches!(e.as_ref(), Expr::Binary { .. })));
    }

    #[test]
    fn test_labeled_statement() {
        let body = parse_ok("loop: for (;;) { break loop; }");
        assert!(matches!(&body[0], Stmt::Labeled { label, .. } if label == "loop"));
    }
}
