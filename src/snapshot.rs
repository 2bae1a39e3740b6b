/// Snapshot — serialised compiled code plus its interned literals
///
/// CONTAINER (all integers little-endian)
///   header:   version u32 · block-count u32 · literal-table-offset u32 ·
///             literal-table-size u32
///   blocks:   the compiled-code graph, root first, 4-byte aligned
///   literals: string-count u32 · number-count u32 ·
///             strings as { len u16 · utf8 · pad-to-4 } ·
///             numbers as 8-byte IEEE-754 doubles
///
/// Constant-table entries are rewritten to literal-table indices on save
/// (numbers carry the high bit) and resolved back through find-or-create on
/// load, so loading into a different context re-shares literals correctly.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::bytecode::{CompiledCode, TryKind, TryRange};
use crate::context::Context;
use crate::heap::{Cp, HeapCell};

pub const SNAPSHOT_VERSION: u32 = 0x51_4B_00_01;

const NUMBER_BIT: u32 = 0x8000_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    BadHeader,
    VersionMismatch(u32),
    Truncated,
    Malformed(&'static str),
    OutOfMemory,
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::BadHeader => write!(f, "snapshot header is invalid"),
            SnapshotError::VersionMismatch(v) => {
                write!(f, "snapshot version {v:#010x} is not supported")
            }
            SnapshotError::Truncated => write!(f, "snapshot is truncated"),
            SnapshotError::Malformed(what) => write!(f, "snapshot is malformed: {what}"),
            SnapshotError::OutOfMemory => write!(f, "out of memory while loading snapshot"),
        }
    }
}

impl std::error::Error for SnapshotError {}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

struct SaveState {
    blocks: Vec<Cp>,
    block_ids: HashMap<u32, u32>,
    strings: Vec<String>,
    string_ids: HashMap<String, u32>,
    numbers: Vec<u64>,
}

pub fn save(ctx: &Context, root: Cp) -> Vec<u8> {
    let mut state = SaveState {
        blocks: Vec::new(),
        block_ids: HashMap::new(),
        strings: Vec::new(),
        string_ids: HashMap::new(),
        numbers: Vec::new(),
    };
    collect_blocks(ctx, root, &mut state);

    let mut out = Vec::new();
    out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    out.extend_from_slice(&(state.blocks.len() as u32).to_le_bytes());
    // Offset and size are patched once the stream is written.
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());

    let blocks = state.blocks.clone();
    for &cp in &blocks {
        let code = ctx.heap_ref().code(cp);
        write_block(ctx, &code, &mut state, &mut out);
    }
    while out.len() % 4 != 0 {
        out.push(0);
    }

    let table_offset = out.len() as u32;
    out.extend_from_slice(&(state.strings.len() as u32).to_le_bytes());
    out.extend_from_slice(&(state.numbers.len() as u32).to_le_bytes());
    for s in &state.strings {
        out.extend_from_slice(&(s.len() as u16).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
        while (out.len() - table_offset as usize) % 4 != 0 {
            out.push(0);
        }
    }
    for &bits in &state.numbers {
        out.extend_from_slice(&bits.to_le_bytes());
    }
    let table_size = out.len() as u32 - table_offset;
    out[8..12].copy_from_slice(&table_offset.to_le_bytes());
    out[12..16].copy_from_slice(&table_size.to_le_bytes());
    out
}

fn collect_blocks(ctx: &Context, cp: Cp, state: &mut SaveState) {
    if state.block_ids.contains_key(&cp.raw()) {
        return;
    }
    let id = state.blocks.len() as u32;
    state.block_ids.insert(cp.raw(), id);
    state.blocks.push(cp);
    let code = ctx.heap_ref().code(cp);
    for &inner in &code.inner {
        collect_blocks(ctx, inner, state);
    }
}

fn literal_id(ctx: &Context, cp: Cp, state: &mut SaveState) -> u32 {
    match ctx.heap_ref().get(cp) {
        HeapCell::Str(s) => {
            let text = s.flatten().into_owned();
            if let Some(&id) = state.string_ids.get(&text) {
                return id;
            }
            let id = state.strings.len() as u32;
            state.string_ids.insert(text.clone(), id);
            state.strings.push(text);
            id
        }
        HeapCell::Number(n) => {
            let bits = n.value.to_bits();
            match state.numbers.iter().position(|&b| b == bits) {
                Some(ix) => NUMBER_BIT | ix as u32,
                None => {
                    state.numbers.push(bits);
                    NUMBER_BIT | (state.numbers.len() as u32 - 1)
                }
            }
        }
        other => panic!("constant table holds a {}", other.kind_name()),
    }
}

fn write_block(ctx: &Context, code: &Rc<CompiledCode>, state: &mut SaveState, out: &mut Vec<u8>) {
    out.extend_from_slice(&code.flags.to_le_bytes());
    out.push(code.arg_count);
    out.push(code.reg_count);
    out.extend_from_slice(&code.name_const.unwrap_or(0xFFFF).to_le_bytes());
    out.extend_from_slice(&(code.consts.len() as u16).to_le_bytes());
    out.extend_from_slice(&(code.inner.len() as u16).to_le_bytes());
    out.extend_from_slice(&(code.try_ranges.len() as u16).to_le_bytes());
    for &c in &code.consts {
        out.extend_from_slice(&literal_id(ctx, c, state).to_le_bytes());
    }
    for &inner in &code.inner {
        let id = state.block_ids[&inner.raw()];
        out.extend_from_slice(&id.to_le_bytes());
    }
    for r in &code.try_ranges {
        out.extend_from_slice(&r.start.to_le_bytes());
        out.extend_from_slice(&r.end.to_le_bytes());
        out.extend_from_slice(&r.handler.to_le_bytes());
        let kind: u32 = match r.kind {
            TryKind::Catch => 0,
            TryKind::Finally => 1,
        };
        out.extend_from_slice(&kind.to_le_bytes());
        let depths = r.stack_depth as u32 | (r.env_depth as u32) << 16;
        out.extend_from_slice(&depths.to_le_bytes());
    }
    out.extend_from_slice(&(code.code.len() as u32).to_le_bytes());
    out.extend_from_slice(&code.code);
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, SnapshotError> {
        let b = *self.bytes.get(self.at).ok_or(SnapshotError::Truncated)?;
        self.at += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, SnapshotError> {
        let s = self
            .bytes
            .get(self.at..self.at + 2)
            .ok_or(SnapshotError::Truncated)?;
        self.at += 2;
        Ok(u16::from_le_bytes([s[0], s[1]]))
    }

    fn u32(&mut self) -> Result<u32, SnapshotError> {
        let s = self
            .bytes
            .get(self.at..self.at + 4)
            .ok_or(SnapshotError::Truncated)?;
        self.at += 4;
        Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    fn u64(&mut self) -> Result<u64, SnapshotError> {
        let s = self
            .bytes
            .get(self.at..self.at + 8)
            .ok_or(SnapshotError::Truncated)?;
        self.at += 8;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(s);
        Ok(u64::from_le_bytes(buf))
    }

    fn slice(&mut self, len: usize) -> Result<&'a [u8], SnapshotError> {
        let s = self
            .bytes
            .get(self.at..self.at + len)
            .ok_or(SnapshotError::Truncated)?;
        self.at += len;
        Ok(s)
    }

    fn align4(&mut self, base: usize) {
        while (self.at - base) % 4 != 0 {
            self.at += 1;
        }
    }
}

/// Load a snapshot, interning its literals into this context's pool and
/// rebuilding the compiled-code graph. Returns the root block.
pub fn load(ctx: &mut Context, bytes: &[u8]) -> Result<Cp, SnapshotError> {
    if bytes.len() < 16 {
        return Err(SnapshotError::BadHeader);
    }
    let mut r = Reader { bytes, at: 0 };
    let version = r.u32()?;
    if version != SNAPSHOT_VERSION {
        return Err(SnapshotError::VersionMismatch(version));
    }
    let block_count = r.u32()? as usize;
    let table_offset = r.u32()? as usize;
    let _table_size = r.u32()?;
    if block_count == 0 || table_offset > bytes.len() {
        return Err(SnapshotError::BadHeader);
    }

    // Literal table first, so constant ids can be resolved while blocks are
    // read.
    let mut lit = Reader { bytes, at: table_offset };
    let string_count = lit.u32()? as usize;
    let number_count = lit.u32()? as usize;
    let mut string_cps = Vec::with_capacity(string_count);
    for _ in 0..string_count {
        let len = lit.u16()? as usize;
        let raw = lit.slice(len)?;
        let text =
            std::str::from_utf8(raw).map_err(|_| SnapshotError::Malformed("literal utf8"))?;
        let text = text.to_owned();
        let cp = ctx.intern_string(&text).map_err(|_| SnapshotError::OutOfMemory)?;
        string_cps.push(cp);
        lit.align4(table_offset);
    }
    let mut number_cps = Vec::with_capacity(number_count);
    for _ in 0..number_count {
        let bits = lit.u64()?;
        let cp = ctx
            .intern_number(f64::from_bits(bits))
            .map_err(|_| SnapshotError::OutOfMemory)?;
        number_cps.push(cp);
    }

    // Pass one: decode block bodies with inner references as indices.
    struct RawBlock {
        code: CompiledCode,
        inner_ids: Vec<u32>,
    }
    let mut raw_blocks = Vec::with_capacity(block_count);
    for _ in 0..block_count {
        let flags = r.u16()?;
        let arg_count = r.u8()?;
        let reg_count = r.u8()?;
        let name_const = match r.u16()? {
            0xFFFF => None,
            v => Some(v),
        };
        let const_count = r.u16()? as usize;
        let inner_count = r.u16()? as usize;
        let try_count = r.u16()? as usize;
        let mut consts = Vec::with_capacity(const_count);
        for _ in 0..const_count {
            let id = r.u32()?;
            let cp = if id & NUMBER_BIT != 0 {
                *number_cps
                    .get((id & !NUMBER_BIT) as usize)
                    .ok_or(SnapshotError::Malformed("number literal id"))?
            } else {
                *string_cps
                    .get(id as usize)
                    .ok_or(SnapshotError::Malformed("string literal id"))?
            };
            consts.push(cp);
        }
        let mut inner_ids = Vec::with_capacity(inner_count);
        for _ in 0..inner_count {
            inner_ids.push(r.u32()?);
        }
        let mut try_ranges = Vec::with_capacity(try_count);
        for _ in 0..try_count {
            let start = r.u32()?;
            let end = r.u32()?;
            let handler = r.u32()?;
            let kind = match r.u32()? {
                0 => TryKind::Catch,
                1 => TryKind::Finally,
                _ => return Err(SnapshotError::Malformed("try kind")),
            };
            let depths = r.u32()?;
            try_ranges.push(TryRange {
                start,
                end,
                handler,
                kind,
                stack_depth: (depths & 0xFFFF) as u16,
                env_depth: (depths >> 16) as u16,
            });
        }
        let code_len = r.u32()? as usize;
        let code_bytes = r.slice(code_len)?.to_vec();
        r.align4(0);
        raw_blocks.push(RawBlock {
            code: CompiledCode {
                flags,
                arg_count,
                reg_count,
                consts,
                inner: Vec::new(),
                try_ranges,
                code: code_bytes,
                name_const,
            },
            inner_ids,
        });
    }

    // Pass two: allocate blocks in reverse so inner references (always to
    // later-collected blocks) resolve to already-created cells.
    let mut cps: Vec<Cp> = vec![Cp::NULL; block_count];
    for ix in (0..block_count).rev() {
        let raw = &mut raw_blocks[ix];
        let mut inner = Vec::with_capacity(raw.inner_ids.len());
        for &id in &raw.inner_ids {
            let target = *cps.get(id as usize).ok_or(SnapshotError::Malformed("block id"))?;
            if target.is_null() {
                return Err(SnapshotError::Malformed("forward block reference"));
            }
            inner.push(target);
        }
        let mut code = std::mem::replace(
            &mut raw.code,
            CompiledCode {
                flags: 0,
                arg_count: 0,
                reg_count: 0,
                consts: Vec::new(),
                inner: Vec::new(),
                try_ranges: Vec::new(),
                code: Vec::new(),
                name_const: None,
            },
        );
        code.inner = inner;
        let cp = ctx
            .alloc_code_cell(Rc::new(code))
            .map_err(|_| SnapshotError::OutOfMemory)?;
        cps[ix] = cp;
    }
    Ok(cps[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ParseFlags;

    #[test]
    fn test_snapshot_roundtrip_preserves_stream() {
        let mut ctx = Context::with_default_options();
        let src = "function f(n) { return n <= 1 ? 1 : n * f(n - 1); } f(6);";
        let code = ctx.parse(src, ParseFlags::default()).expect("parse");
        let image = save(&ctx, code);

        let mut other = Context::with_default_options();
        let loaded = load(&mut other, &image).expect("load");
        let a = ctx.heap_ref().code(code);
        let b = other.heap_ref().code(loaded);
        assert_eq!(a.code, b.code, "opcode stream survives the round trip");
        assert_eq!(a.flags, b.flags);
        assert_eq!(a.consts.len(), b.consts.len());
        assert_eq!(a.inner.len(), b.inner.len());
    }

    #[test]
    fn test_snapshot_runs_to_same_result() {
        let mut ctx = Context::with_default_options();
        let code = ctx.parse("var a = 20; a + 22;", ParseFlags::default()).expect("parse");
        let direct = ctx.run(code).expect("run");
        let shown = ctx.to_display_string(direct).unwrap();

        let image = save(&ctx, code);
        let mut other = Context::with_default_options();
        let loaded = load(&mut other, &image).expect("load");
        let replayed = other.run(loaded).expect("run");
        let shown2 = other.to_display_string(replayed).unwrap();
        assert_eq!(shown, shown2);
        assert_eq!(shown, "42");
    }

    #[test]
    fn test_version_check() {
        let mut image = vec![0u8; 16];
        image[0..4].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        let mut ctx = Context::with_default_options();
        assert!(matches!(load(&mut ctx, &image), Err(SnapshotError::VersionMismatch(_))));
        assert_eq!(load(&mut ctx, &[1, 2, 3]), Err(SnapshotError::BadHeader));
    }
}
