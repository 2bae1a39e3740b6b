/// Lexer — source text to tokens, one at a time
///
/// The parser pulls tokens on demand so it can pass context the scanner
/// cannot know on its own: whether a `/` may start a regular-expression
/// literal. Each token records its position, whether a line terminator
/// preceded it (the ASI flag) and lexical facts the parser re-checks under
/// strict mode (legacy octal numbers, octal escapes, identifier escapes).
///
/// Line terminators are CR, LF, CR+LF, U+2028 and U+2029. Columns advance
/// by one per character with tabs aligning to the next multiple of 8.
///
/// Keyword recognition buckets the reserved words by length and binary
/// searches the bucket; an identifier containing a `\uXXXX` escape is never
/// matched as a keyword.

use once_cell::sync::Lazy;

use crate::errors::{ParseError, ParseErrorKind, Position};

// ---------------------------------------------------------------------------
// Keywords
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kw {
    Break,
    Case,
    Catch,
    Class,
    Const,
    Continue,
    Debugger,
    Default,
    Delete,
    Do,
    Else,
    Enum,
    Export,
    Extends,
    False,
    Finally,
    For,
    Function,
    If,
    Import,
    In,
    InstanceOf,
    New,
    Null,
    Return,
    Super,
    Switch,
    This,
    Throw,
    True,
    Try,
    TypeOf,
    Var,
    Void,
    While,
    With,
    Yield,
    // Strict-only reserved: identifiers in sloppy mode.
    Let,
    Static,
    Implements,
    Interface,
    Package,
    Private,
    Protected,
    Public,
}

impl Kw {
    /// Reserved in sloppy mode too.
    pub fn always_reserved(self) -> bool {
        !self.strict_only()
    }

    pub fn strict_only(self) -> bool {
        matches!(
            self,
            Kw::Let
                | Kw::Static
                | Kw::Implements
                | Kw::Interface
                | Kw::Package
                | Kw::Private
                | Kw::Protected
                | Kw::Public
        )
    }

    pub fn text(self) -> &'static str {
        match self {
            Kw::Break => "break",
            Kw::Case => "case",
            Kw::Catch => "catch",
            Kw::Class => "class",
            Kw::Const => "const",
            Kw::Continue => "continue",
            Kw::Debugger => "debugger",
            Kw::Default => "default",
            Kw::Delete => "delete",
            Kw::Do => "do",
            Kw::Else => "else",
            Kw::Enum => "enum",
            Kw::Export => "export",
            Kw::Extends => "extends",
            Kw::False => "false",
            Kw::Finally => "finally",
            Kw::For => "for",
            Kw::Function => "function",
            Kw::If => "if",
            Kw::Import => "import",
            Kw::In => "in",
            Kw::InstanceOf => "instanceof",
            Kw::New => "new",
            Kw::Null => "null",
            Kw::Return => "return",
            Kw::Super => "super",
            Kw::Switch => "switch",
            Kw::This => "this",
            Kw::Throw => "throw",
            Kw::True => "true",
            Kw::Try => "try",
            Kw::TypeOf => "typeof",
            Kw::Var => "var",
            Kw::Void => "void",
            Kw::While => "while",
            Kw::With => "with",
            Kw::Yield => "yield",
            Kw::Let => "let",
            Kw::Static => "static",
            Kw::Implements => "implements",
            Kw::Interface => "interface",
            Kw::Package => "package",
            Kw::Private => "private",
            Kw::Protected => "protected",
            Kw::Public => "public",
        }
    }
}

static KEYWORDS: &[Kw] = &[
    Kw::Break,
    Kw::Case,
    Kw::Catch,
    Kw::Class,
    Kw::Const,
    Kw::Continue,
    Kw::Debugger,
    Kw::Default,
    Kw::Delete,
    Kw::Do,
    Kw::Else,
    Kw::Enum,
    Kw::Export,
    Kw::Extends,
    Kw::False,
    Kw::Finally,
    Kw::For,
    Kw::Function,
    Kw::If,
    Kw::Import,
    Kw::In,
    Kw::InstanceOf,
    Kw::New,
    Kw::Null,
    Kw::Return,
    Kw::Super,
    Kw::Switch,
    Kw::This,
    Kw::Throw,
    Kw::True,
    Kw::Try,
    Kw::TypeOf,
    Kw::Var,
    Kw::Void,
    Kw::While,
    Kw::With,
    Kw::Yield,
    Kw::Let,
    Kw::Static,
    Kw::Implements,
    Kw::Interface,
    Kw::Package,
    Kw::Private,
    Kw::Protected,
    Kw::Public,
];

/// Size-bucketed keyword tables, sorted within each bucket for binary
/// search. Index is the word length.
static KW_BUCKETS: Lazy<Vec<Vec<Kw>>> = Lazy::new(|| {
    let max_len = KEYWORDS.iter().map(|k| k.text().len()).max().unwrap_or(0);
    let mut buckets: Vec<Vec<Kw>> = vec![Vec::new(); max_len + 1];
    for &kw in KEYWORDS {
        buckets[kw.text().len()].push(kw);
    }
    for bucket in &mut buckets {
        bucket.sort_unstable_by_key(|k| k.text());
    }
    buckets
});

pub fn keyword_lookup(ident: &str) -> Option<Kw> {
    let bucket = KW_BUCKETS.get(ident.len())?;
    bucket
        .binary_search_by_key(&ident, |k| k.text())
        .ok()
        .map(|i| bucket[i])
}

// ---------------------------------------------------------------------------
// Punctuators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Punct {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semicolon,
    Comma,
    Dot,
    Ellipsis,
    Arrow,
    Question,
    Colon,
    Coalesce, // ??
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    ShlAssign,
    ShrAssign,
    UShrAssign,
    EqEq,
    NotEq,
    EqEqEq,
    NotEqEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusPlus,
    MinusMinus,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    AmpAmp,
    PipePipe,
    Shl,
    Shr,
    UShr,
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    /// Literal text between placeholders (cooked).
    Str(String),
    /// Raw source of a `${…}` placeholder, re-parsed by the parser.
    Expr(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Keyword(Kw),
    Ident(String),
    Number(f64),
    Str(String),
    Template(Vec<TemplatePart>),
    Regexp { pattern: String, flags: String },
    Punct(Punct),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: Position,
    /// A line terminator appeared since the previous token (ASI input).
    pub newline_before: bool,
    /// Identifier contained a `\uXXXX` escape (never a keyword then).
    pub had_escape: bool,
    /// Number used the legacy `0NNN` octal form (strict-mode early error).
    pub legacy_octal: bool,
    /// String contained an octal escape (strict-mode early error).
    pub octal_escape: bool,
}

impl Token {
    fn at(kind: TokenKind, pos: Position, newline_before: bool) -> Self {
        Token {
            kind,
            pos,
            newline_before,
            had_escape: false,
            legacy_octal: false,
            octal_escape: false,
        }
    }

    pub fn is_punct(&self, p: Punct) -> bool {
        self.kind == TokenKind::Punct(p)
    }

    pub fn is_kw(&self, k: Kw) -> bool {
        self.kind == TokenKind::Keyword(k)
    }

    /// Short description for diagnostics.
    pub fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Keyword(k) => format!("'{}'", k.text()),
            TokenKind::Ident(s) => format!("identifier '{s}'"),
            TokenKind::Number(_) => "number".into(),
            TokenKind::Str(_) => "string".into(),
            TokenKind::Template(_) => "template".into(),
            TokenKind::Regexp { .. } => "regexp".into(),
            TokenKind::Punct(p) => format!("'{p:?}'"),
            TokenKind::Eof => "end of input".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// The lexer
// ---------------------------------------------------------------------------

pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    newline_pending: bool,
}

type LexResult<T> = Result<T, ParseError>;

impl Lexer {
    pub fn new(source: &str) -> Self {
        Lexer {
            input: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            newline_pending: false,
        }
    }

    #[inline]
    fn current(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    #[inline]
    fn peek(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current()?;
        self.pos += 1;
        match ch {
            '\r' => {
                if self.current() == Some('\n') {
                    self.pos += 1;
                }
                self.new_line();
            }
            '\n' | '\u{2028}' | '\u{2029}' => self.new_line(),
            '\t' => self.column = (self.column - 1) / 8 * 8 + 9,
            _ => self.column += 1,
        }
        Some(ch)
    }

    fn new_line(&mut self) {
        self.line += 1;
        self.column = 1;
        self.newline_pending = true;
    }

    pub fn position(&self) -> Position {
        Position::new(self.line, self.column)
    }

    fn error(&self, kind: ParseErrorKind, message: impl Into<String>) -> ParseError {
        ParseError::new(kind, self.position(), message)
    }

    fn is_line_terminator(ch: char) -> bool {
        matches!(ch, '\n' | '\r' | '\u{2028}' | '\u{2029}')
    }

    fn is_ident_start(ch: char) -> bool {
        ch == '_' || ch == '$' || ch.is_alphabetic()
    }

    fn is_ident_part(ch: char) -> bool {
        ch == '_' || ch == '$' || ch.is_alphanumeric()
    }

    fn skip_whitespace_and_comments(&mut self) -> LexResult<()> {
        loop {
            match self.current() {
                Some(ch) if ch.is_whitespace() || ch == '\u{FEFF}' => {
                    self.advance();
                }
                Some('/') if self.peek(1) == Some('/') => {
                    self.advance();
                    self.advance();
                    while let Some(ch) = self.current() {
                        if Self::is_line_terminator(ch) {
                            break;
                        }
                        self.advance();
                    }
                }
                Some('/') if self.peek(1) == Some('*') => {
                    self.advance();
                    self.advance();
                    loop {
                        match self.current() {
                            None => {
                                return Err(self.error(
                                    ParseErrorKind::UnterminatedComment,
                                    "unterminated block comment",
                                ))
                            }
                            Some('*') if self.peek(1) == Some('/') => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            _ => {
                                self.advance();
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Scan the next token. `regexp_allowed` tells the scanner whether a
    /// leading `/` opens a regular-expression literal in this position.
    pub fn next_token(&mut self, regexp_allowed: bool) -> LexResult<Token> {
        self.skip_whitespace_and_comments()?;
        let newline = self.newline_pending;
        self.newline_pending = false;
        let pos = self.position();

        let Some(ch) = self.current() else {
            return Ok(Token::at(TokenKind::Eof, pos, newline));
        };

        if Self::is_ident_start(ch) || ch == '\\' {
            let mut tok = self.scan_identifier()?;
            tok.pos = pos;
            tok.newline_before = newline;
            return Ok(tok);
        }
        if ch.is_ascii_digit() || (ch == '.' && matches!(self.peek(1), Some(c) if c.is_ascii_digit()))
        {
            let mut tok = self.scan_number()?;
            tok.pos = pos;
            tok.newline_before = newline;
            return Ok(tok);
        }
        if ch == '"' || ch == '\'' {
            let mut tok = self.scan_string(ch)?;
            tok.pos = pos;
            tok.newline_before = newline;
            return Ok(tok);
        }
        if ch == '`' {
            let mut tok = self.scan_template()?;
            tok.pos = pos;
            tok.newline_before = newline;
            return Ok(tok);
        }
        if ch == '/' && regexp_allowed {
            let mut tok = self.scan_regexp()?;
            tok.pos = pos;
            tok.newline_before = newline;
            return Ok(tok);
        }

        let punct = self.scan_punct()?;
        Ok(Token::at(TokenKind::Punct(punct), pos, newline))
    }

    // ── Identifiers ──────────────────────────────────────────────────────

    fn scan_identifier(&mut self) -> LexResult<Token> {
        let mut text = String::new();
        let mut had_escape = false;

        loop {
            match self.current() {
                Some('\\') => {
                    if self.peek(1) != Some('u') {
                        return Err(
                            self.error(ParseErrorKind::InvalidEscape, "invalid identifier escape")
                        );
                    }
                    self.advance();
                    self.advance();
                    let ch = self.scan_unicode_escape()?;
                    let valid = if text.is_empty() {
                        Self::is_ident_start(ch)
                    } else {
                        Self::is_ident_part(ch)
                    };
                    if !valid {
                        return Err(self.error(
                            ParseErrorKind::InvalidEscape,
                            "escape does not form a valid identifier character",
                        ));
                    }
                    text.push(ch);
                    had_escape = true;
                }
                Some(ch) if Self::is_ident_part(ch) => {
                    text.push(ch);
                    self.advance();
                }
                _ => break,
            }
        }

        // Escaped identifiers never match keywords.
        if !had_escape {
            if let Some(kw) = keyword_lookup(&text) {
                return Ok(Token::at(TokenKind::Keyword(kw), self.position(), false));
            }
        }
        let mut tok = Token::at(TokenKind::Ident(text), self.position(), false);
        tok.had_escape = had_escape;
        Ok(tok)
    }

    fn scan_unicode_escape(&mut self) -> LexResult<char> {
        let mut code: u32 = 0;
        for _ in 0..4 {
            let Some(d) = self.current().and_then(|c| c.to_digit(16)) else {
                return Err(self.error(ParseErrorKind::InvalidEscape, "invalid \\u escape"));
            };
            code = code * 16 + d;
            self.advance();
        }
        char::from_u32(code)
            .ok_or_else(|| self.error(ParseErrorKind::InvalidEscape, "invalid \\u escape"))
    }

    // ── Numbers ──────────────────────────────────────────────────────────

    fn scan_number(&mut self) -> LexResult<Token> {
        let mut text = String::new();

        if self.current() == Some('0') {
            match self.peek(1) {
                Some('x') | Some('X') => {
                    self.advance();
                    self.advance();
                    let mut hex = String::new();
                    while let Some(c) = self.current() {
                        if c.is_ascii_hexdigit() {
                            hex.push(c);
                            self.advance();
                        } else {
                            break;
                        }
                    }
                    if hex.is_empty() || matches!(self.current(), Some(c) if Self::is_ident_part(c))
                    {
                        return Err(
                            self.error(ParseErrorKind::InvalidNumber, "invalid hex literal")
                        );
                    }
                    let value = u64::from_str_radix(&hex, 16)
                        .map(|v| v as f64)
                        .unwrap_or(f64::INFINITY);
                    return Ok(Token::at(TokenKind::Number(value), self.position(), false));
                }
                Some(c) if c.is_ascii_digit() => {
                    // Legacy octal: consume digits, error later under strict.
                    self.advance();
                    let mut oct = String::new();
                    let mut is_octal = true;
                    while let Some(c) = self.current() {
                        if c.is_ascii_digit() {
                            if c > '7' {
                                is_octal = false;
                            }
                            oct.push(c);
                            self.advance();
                        } else {
                            break;
                        }
                    }
                    if !is_octal {
                        // 08/09 parse as decimal per Annex B.
                        let value: f64 = oct.parse().unwrap_or(f64::NAN);
                        let mut tok =
                            Token::at(TokenKind::Number(value), self.position(), false);
                        tok.legacy_octal = true;
                        return Ok(tok);
                    }
                    let value = u64::from_str_radix(&oct, 8)
                        .map(|v| v as f64)
                        .map_err(|_| self.error(ParseErrorKind::InvalidNumber, "invalid octal"))?;
                    let mut tok = Token::at(TokenKind::Number(value), self.position(), false);
                    tok.legacy_octal = true;
                    return Ok(tok);
                }
                _ => {}
            }
        }

        while let Some(c) = self.current() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if self.current() == Some('.') {
            text.push('.');
            self.advance();
            while let Some(c) = self.current() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if matches!(self.current(), Some('e') | Some('E')) {
            text.push('e');
            self.advance();
            if matches!(self.current(), Some('+') | Some('-')) {
                text.push(self.current().unwrap_or('+'));
                self.advance();
            }
            let mut exp_digits = false;
            while let Some(c) = self.current() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                    exp_digits = true;
                } else {
                    break;
                }
            }
            if !exp_digits {
                return Err(self.error(ParseErrorKind::InvalidNumber, "missing exponent digits"));
            }
        }
        // An identifier character glued to a number is always an error.
        if matches!(self.current(), Some(c) if Self::is_ident_part(c)) {
            return Err(self.error(ParseErrorKind::InvalidNumber, "invalid number literal"));
        }
        let value: f64 = text
            .parse()
            .map_err(|_| self.error(ParseErrorKind::InvalidNumber, "invalid number literal"))?;
        Ok(Token::at(TokenKind::Number(value), self.position(), false))
    }

    // ── Strings ──────────────────────────────────────────────────────────

    fn scan_string(&mut self, quote: char) -> LexResult<Token> {
        self.advance();
        let mut text = String::new();
        let mut octal_escape = false;

        loop {
            match self.current() {
                None => {
                    return Err(self.error(
                        ParseErrorKind::UnterminatedString,
                        "unterminated string literal",
                    ))
                }
                Some(c) if c == quote => {
                    self.advance();
                    break;
                }
                Some(c) if Self::is_line_terminator(c) => {
                    return Err(self.error(
                        ParseErrorKind::UnterminatedString,
                        "unterminated string literal",
                    ))
                }
                Some('\\') => {
                    self.advance();
                    match self.current() {
                        None => {
                            return Err(self.error(
                                ParseErrorKind::UnterminatedString,
                                "unterminated string literal",
                            ))
                        }
                        Some(c) if Self::is_line_terminator(c) => {
                            // Line continuation contributes nothing.
                            self.advance();
                        }
                        Some('n') => {
                            text.push('\n');
                            self.advance();
                        }
                        Some('t') => {
                            text.push('\t');
                            self.advance();
                        }
                        Some('r') => {
                            text.push('\r');
                            self.advance();
                        }
                        Some('b') => {
                            text.push('\u{8}');
                            self.advance();
                        }
                        Some('f') => {
                            text.push('\u{c}');
                            self.advance();
                        }
                        Some('v') => {
                            text.push('\u{b}');
                            self.advance();
                        }
                        Some('0') if !matches!(self.peek(1), Some(c) if c.is_ascii_digit()) => {
                            text.push('\0');
                            self.advance();
                        }
                        Some(c) if ('0'..='7').contains(&c) => {
                            // Octal escape (Annex B); early error under strict.
                            octal_escape = true;
                            let mut code = 0u32;
                            let mut digits = 0;
                            while digits < 3 {
                                match self.current() {
                                    Some(d) if ('0'..='7').contains(&d) => {
                                        let next = code * 8 + (d as u32 - '0' as u32);
                                        if next > 0xFF {
                                            break;
                                        }
                                        code = next;
                                        digits += 1;
                                        self.advance();
                                    }
                                    _ => break,
                                }
                            }
                            if let Some(ch) = char::from_u32(code) {
                                text.push(ch);
                            }
                        }
                        Some('x') => {
                            self.advance();
                            let mut code = 0u32;
                            for _ in 0..2 {
                                let Some(d) = self.current().and_then(|c| c.to_digit(16)) else {
                                    return Err(self.error(
                                        ParseErrorKind::InvalidEscape,
                                        "invalid \\x escape",
                                    ));
                                };
                                code = code * 16 + d;
                                self.advance();
                            }
                            if let Some(ch) = char::from_u32(code) {
                                text.push(ch);
                            }
                        }
                        Some('u') => {
                            self.advance();
                            let ch = self.scan_unicode_escape()?;
                            text.push(ch);
                        }
                        Some(other) => {
                            text.push(other);
                            self.advance();
                        }
                    }
                }
                Some(c) => {
                    text.push(c);
                    self.advance();
                }
            }
        }
        let mut tok = Token::at(TokenKind::Str(text), self.position(), false);
        tok.octal_escape = octal_escape;
        Ok(tok)
    }

    // ── Template literals ────────────────────────────────────────────────

    fn scan_template(&mut self) -> LexResult<Token> {
        self.advance(); // backtick
        let mut parts: Vec<TemplatePart> = Vec::new();
        let mut current = String::new();

        loop {
            match self.current() {
                None => {
                    return Err(self.error(
                        ParseErrorKind::UnterminatedTemplate,
                        "unterminated template literal",
                    ))
                }
                Some('`') => {
                    self.advance();
                    break;
                }
                Some('$') if self.peek(1) == Some('{') => {
                    self.advance();
                    self.advance();
                    if !current.is_empty() {
                        parts.push(TemplatePart::Str(std::mem::take(&mut current)));
                    }
                    let expr = self.scan_template_placeholder()?;
                    parts.push(TemplatePart::Expr(expr));
                }
                Some('\\') => {
                    self.advance();
                    match self.current() {
                        None => {
                            return Err(self.error(
                                ParseErrorKind::UnterminatedTemplate,
                                "unterminated template literal",
                            ))
                        }
                        Some('n') => {
                            current.push('\n');
                            self.advance();
                        }
                        Some('t') => {
                            current.push('\t');
                            self.advance();
                        }
                        Some('r') => {
                            current.push('\r');
                            self.advance();
                        }
                        Some('`') => {
                            current.push('`');
                            self.advance();
                        }
                        Some('$') => {
                            current.push('$');
                            self.advance();
                        }
                        Some('u') => {
                            self.advance();
                            let ch = self.scan_unicode_escape()?;
                            current.push(ch);
                        }
                        Some(other) => {
                            current.push(other);
                            self.advance();
                        }
                    }
                }
                Some(c) => {
                    current.push(c);
                    self.advance();
                }
            }
        }
        if !current.is_empty() {
            parts.push(TemplatePart::Str(current));
        }
        Ok(Token::at(TokenKind::Template(parts), self.position(), false))
    }

    /// Collect the raw source of a `${…}` placeholder up to its matching
    /// brace, skipping braces inside nested strings and templates.
    fn scan_template_placeholder(&mut self) -> LexResult<String> {
        let mut depth = 1usize;
        let mut out = String::new();
        loop {
            match self.current() {
                None => {
                    return Err(self.error(
                        ParseErrorKind::UnterminatedTemplate,
                        "unterminated template placeholder",
                    ))
                }
                Some('{') => {
                    depth += 1;
                    out.push('{');
                    self.advance();
                }
                Some('}') => {
                    depth -= 1;
                    self.advance();
                    if depth == 0 {
                        return Ok(out);
                    }
                    out.push('}');
                }
                Some(q @ ('"' | '\'' | '`')) => {
                    out.push(q);
                    self.advance();
                    loop {
                        match self.current() {
                            None => {
                                return Err(self.error(
                                    ParseErrorKind::UnterminatedTemplate,
                                    "unterminated template placeholder",
                                ))
                            }
                            Some('\\') => {
                                out.push('\\');
                                self.advance();
                                if let Some(c) = self.current() {
                                    out.push(c);
                                    self.advance();
                                }
                            }
                            Some(c) => {
                                out.push(c);
                                self.advance();
                                if c == q {
                                    break;
                                }
                            }
                        }
                    }
                }
                Some(c) => {
                    out.push(c);
                    self.advance();
                }
            }
        }
    }

    // ── Regular expressions ──────────────────────────────────────────────

    fn scan_regexp(&mut self) -> LexResult<Token> {
        self.advance(); // '/'
        let mut pattern = String::new();
        let mut in_class = false;
        loop {
            match self.current() {
                None => {
                    return Err(self.error(
                        ParseErrorKind::UnterminatedRegexp,
                        "unterminated regular expression",
                    ))
                }
                Some(c) if Self::is_line_terminator(c) => {
                    return Err(self.error(
                        ParseErrorKind::UnterminatedRegexp,
                        "unterminated regular expression",
                    ))
                }
                Some('\\') => {
                    pattern.push('\\');
                    self.advance();
                    if let Some(c) = self.current() {
                        pattern.push(c);
                        self.advance();
                    }
                }
                Some('[') => {
                    in_class = true;
                    pattern.push('[');
                    self.advance();
                }
                Some(']') => {
                    in_class = false;
                    pattern.push(']');
                    self.advance();
                }
                Some('/') if !in_class => {
                    self.advance();
                    break;
                }
                Some(c) => {
                    pattern.push(c);
                    self.advance();
                }
            }
        }
        let mut flags = String::new();
        while let Some(c) = self.current() {
            if Self::is_ident_part(c) {
                flags.push(c);
                self.advance();
            } else {
                break;
            }
        }
        Ok(Token::at(TokenKind::Regexp { pattern, flags }, self.position(), false))
    }

    // ── Punctuators ──────────────────────────────────────────────────────

    fn scan_punct(&mut self) -> LexResult<Punct> {
        let ch = self.advance().unwrap_or('\0');
        let p = match ch {
            '(' => Punct::LParen,
            ')' => Punct::RParen,
            '{' => Punct::LBrace,
            '}' => Punct::RBrace,
            '[' => Punct::LBracket,
            ']' => Punct::RBracket,
            ';' => Punct::Semicolon,
            ',' => Punct::Comma,
            ':' => Punct::Colon,
            '~' => Punct::Tilde,
            '.' => {
                if self.current() == Some('.') && self.peek(1) == Some('.') {
                    self.advance();
                    self.advance();
                    Punct::Ellipsis
                } else {
                    Punct::Dot
                }
            }
            '?' => {
                if self.current() == Some('?') {
                    self.advance();
                    Punct::Coalesce
                } else {
                    Punct::Question
                }
            }
            '=' => {
                if self.current() == Some('=') {
                    self.advance();
                    if self.current() == Some('=') {
                        self.advance();
                        Punct::EqEqEq
                    } else {
                        Punct::EqEq
                    }
                } else if self.current() == Some('>') {
                    self.advance();
                    Punct::Arrow
                } else {
                    Punct::Assign
                }
            }
            '!' => {
                if self.current() == Some('=') {
                    self.advance();
                    if self.current() == Some('=') {
                        self.advance();
                        Punct::NotEqEq
                    } else {
                        Punct::NotEq
                    }
                } else {
                    Punct::Bang
                }
            }
            '<' => {
                if self.current() == Some('<') {
                    self.advance();
                    if self.current() == Some('=') {
                        self.advance();
                        Punct::ShlAssign
                    } else {
                        Punct::Shl
                    }
                } else if self.current() == Some('=') {
                    self.advance();
                    Punct::LtEq
                } else {
                    Punct::Lt
                }
            }
            '>' => {
                if self.current() == Some('>') {
                    self.advance();
                    if self.current() == Some('>') {
                        self.advance();
                        if self.current() == Some('=') {
                            self.advance();
                            Punct::UShrAssign
                        } else {
                            Punct::UShr
                        }
                    } else if self.current() == Some('=') {
                        self.advance();
                        Punct::ShrAssign
                    } else {
                        Punct::Shr
                    }
                } else if self.current() == Some('=') {
                    self.advance();
                    Punct::GtEq
                } else {
                    Punct::Gt
                }
            }
            '+' => {
                if self.current() == Some('+') {
                    self.advance();
                    Punct::PlusPlus
                } else if self.current() == Some('=') {
                    self.advance();
                    Punct::PlusAssign
                } else {
                    Punct::Plus
                }
            }
            '-' => {
                if self.current() == Some('-') {
                    self.advance();
                    Punct::MinusMinus
                } else if self.current() == Some('=') {
                    self.advance();
                    Punct::MinusAssign
                } else {
                    Punct::Minus
                }
            }
            '*' => {
                if self.current() == Some('=') {
                    self.advance();
                    Punct::StarAssign
                } else {
                    Punct::Star
                }
            }
            '/' => {
                if self.current() == Some('=') {
                    self.advance();
                    Punct::SlashAssign
                } else {
                    Punct::Slash
                }
            }
            '%' => {
                if self.current() == Some('=') {
                    self.advance();
                    Punct::PercentAssign
                } else {
                    Punct::Percent
                }
            }
            '&' => {
                if self.current() == Some('&') {
                    self.advance();
                    Punct::AmpAmp
                } else if self.current() == Some('=') {
                    self.advance();
                    Punct::AmpAssign
                } else {
                    Punct::Amp
                }
            }
            '|' => {
                if self.current() == Some('|') {
                    self.advance();
                    Punct::PipePipe
                } else if self.current() == Some('=') {
                    self.advance();
                    Punct::PipeAssign
                } else {
                    Punct::Pipe
                }
            }
            '^' => {
                if self.current() == Some('=') {
                    self.advance();
                    Punct::CaretAssign
                } else {
                    Punct::Caret
                }
            }
            other => {
                return Err(ParseError::new(
                    ParseErrorKind::InvalidCharacter(other),
                    self.position(),
                    format!("unexpected character '{other}'"),
                ))
            }
        };
        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(src: &str) -> Vec<TokenKind> {
        let mut lx = Lexer::new(src);
        let mut out = Vec::new();
        loop {
            let t = lx.next_token(true).expect("lex ok");
            if t.kind == TokenKind::Eof {
                break;
            }
            out.push(t.kind);
        }
        out
    }

    #[test]
    fn test_keywords_and_idents() {
        let toks = lex_all("var x = typeof instanceof_");
        assert_eq!(toks[0], TokenKind::Keyword(Kw::Var));
        assert_eq!(toks[1], TokenKind::Ident("x".into()));
        assert_eq!(toks[2], TokenKind::Punct(Punct::Assign));
        assert_eq!(toks[3], TokenKind::Keyword(Kw::TypeOf));
        assert_eq!(toks[4], TokenKind::Ident("instanceof_".into()));
    }

    #[test]
    fn test_keyword_buckets_complete() {
        for kw in [
            "break", "case", "catch", "class", "const", "continue", "debugger", "default",
            "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for",
            "function", "if", "import", "in", "instanceof", "new", "null", "return", "super",
            "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while", "with",
            "yield", "let", "static", "implements", "interface", "package", "private",
            "protected", "public",
        ] {
            let found = keyword_lookup(kw).expect(kw);
            assert_eq!(found.text(), kw);
        }
        assert!(keyword_lookup("of").is_none(), "contextual words stay identifiers");
        assert!(keyword_lookup("async").is_none());
    }

    #[test]
    fn test_escaped_identifier_is_not_keyword() {
        let mut lx = Lexer::new("\\u0076ar");
        let t = lx.next_token(false).unwrap();
        assert_eq!(t.kind, TokenKind::Ident("var".into()));
        assert!(t.had_escape);
    }

    #[test]
    fn test_numbers() {
        let toks = lex_all("0 42 3.5 .5 1e3 1E-2 0xFF");
        let nums: Vec<f64> = toks
            .iter()
            .map(|t| match t {
                TokenKind::Number(n) => *n,
                other => panic!("not a number: {other:?}"),
            })
            .collect();
        assert_eq!(nums, vec![0.0, 42.0, 3.5, 0.5, 1000.0, 0.01, 255.0]);
    }

    #[test]
    fn test_legacy_octal_flagged() {
        let mut lx = Lexer::new("0777");
        let t = lx.next_token(false).unwrap();
        assert_eq!(t.kind, TokenKind::Number(511.0));
        assert!(t.legacy_octal);
    }

    #[test]
    fn test_string_escapes() {
        let toks = lex_all(r#" "a\nb" '\x41' "A" "#);
        assert_eq!(toks[0], TokenKind::Str("a\nb".into()));
        assert_eq!(toks[1], TokenKind::Str("A".into()));
        assert_eq!(toks[2], TokenKind::Str("A".into()));
    }

    #[test]
    fn test_unterminated_string_errors() {
        let mut lx = Lexer::new("\"abc");
        let err = lx.next_token(false).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnterminatedString);
    }

    #[test]
    fn test_template_parts() {
        let mut lx = Lexer::new("`a${x + 1}b`");
        let t = lx.next_token(false).unwrap();
        match t.kind {
            TokenKind::Template(parts) => {
                assert_eq!(parts.len(), 3);
                assert_eq!(parts[0], TemplatePart::Str("a".into()));
                assert_eq!(parts[1], TemplatePart::Expr("x + 1".into()));
                assert_eq!(parts[2], TemplatePart::Str("b".into()));
            }
            other => panic!("expected template, got {other:?}"),
        }
    }

    #[test]
    fn test_regexp_contextual() {
        // After '=', a slash opens a regexp.
        let mut lx = Lexer::new("a = /ab[/]c/gi");
        assert!(matches!(lx.next_token(false).unwrap().kind, TokenKind::Ident(_)));
        assert!(lx.next_token(false).unwrap().is_punct(Punct::Assign));
        let t = lx.next_token(true).unwrap();
        assert_eq!(
            t.kind,
            TokenKind::Regexp { pattern: "ab[/]c".into(), flags: "gi".into() }
        );
        // After an identifier, the same slash is division.
        let mut lx = Lexer::new("a / b");
        assert!(matches!(lx.next_token(false).unwrap().kind, TokenKind::Ident(_)));
        assert!(lx.next_token(false).unwrap().is_punct(Punct::Slash));
    }

    #[test]
    fn test_newline_flag_and_positions() {
        let mut lx = Lexer::new("a\nb");
        let a = lx.next_token(false).unwrap();
        let b = lx.next_token(false).unwrap();
        assert!(!a.newline_before);
        assert!(b.newline_before);
        assert_eq!(b.pos.line, 2);
        assert_eq!(b.pos.column, 1);
    }

    #[test]
    fn test_tab_column_alignment() {
        let mut lx = Lexer::new("\ta");
        let a = lx.next_token(false).unwrap();
        assert_eq!(a.pos.column, 9, "tab aligns to the next multiple of 8");
    }

    #[test]
    fn test_crlf_counts_one_line() {
        let mut lx = Lexer::new("a\r\nb\u{2028}c");
        lx.next_token(false).unwrap();
        let b = lx.next_token(false).unwrap();
        assert_eq!(b.pos.line, 2);
        let c = lx.next_token(false).unwrap();
        assert_eq!(c.pos.line, 3, "U+2028 is a line terminator");
    }

    #[test]
    fn test_punctuator_maximal_munch() {
        let toks = lex_all("a >>>= b !== c ?? d");
        assert!(toks.contains(&TokenKind::Punct(Punct::UShrAssign)));
        assert!(toks.contains(&TokenKind::Punct(Punct::NotEqEq)));
        assert!(toks.contains(&TokenKind::Punct(Punct::Coalesce)));
    }
}
