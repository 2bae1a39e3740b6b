/// Quark — a compact ECMAScript engine for resource-constrained hosts
///
/// Module layout:
///   - heap      — cell arena, compressed pointers, out-of-memory ladder
///   - value     — tagged 64-bit value word
///   - string    — string/symbol/number cells, magic-string table
///   - object    — objects, property pairs, lexical environments
///   - gc        — stop-the-world mark & sweep
///   - literal   — interned literal storage shared by bytecode
///   - lexer / ast / parser — front-end
///   - compiler  — AST → bytecode, register promotion
///   - bytecode  — opcode set, compact encoding, disassembler
///   - vm        — dispatch loop, frames, generators
///   - builtins  — built-in objects, native dispatch, promises
///   - context   — the engine instance and embedder API
///   - snapshot  — compiled-code serialisation
///   - errors    — parse/runtime error types

// ── Core runtime ─────────────────────────────────────────────────────────────
pub mod heap;
pub mod value;
pub mod string;
pub mod object;
pub mod gc;
pub mod literal;

// ── Front-end ────────────────────────────────────────────────────────────────
pub mod lexer;
pub mod ast;
pub mod parser;
pub mod compiler;
pub mod bytecode;

// ── Execution ────────────────────────────────────────────────────────────────
pub mod vm;
pub mod builtins;
pub mod context;
pub mod snapshot;
pub mod errors;

// ── Re-exports for convenience ───────────────────────────────────────────────
pub use context::{Completion, Context, ContextOptions, Thrown};
pub use errors::{EngineError, ErrorClass, ParseError, ParseErrorKind, Position};
pub use heap::Cp;
pub use parser::ParseFlags;
pub use value::Value;
