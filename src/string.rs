/// Strings, symbols and number boxes
///
/// A string cell is one of three container kinds:
///   • Magic — an index into the static common-string table ("length",
///     "prototype", …). No payload allocation, O(1) equality per id.
///   • Utf8  — owned byte sequence.
///   • Index — canonical uint32 array index, kept numeric until someone
///     needs the characters.
///
/// Strings and number boxes are refcounted: created with one reference,
/// freed when the count returns to zero. They never form cycles, so the
/// tracing collector ignores them except to drop references held by dead
/// objects.

use std::borrow::Cow;

// ---------------------------------------------------------------------------
// Magic (common static) strings
// ---------------------------------------------------------------------------

/// The static common-string table. Sorted so ids can be found by binary
/// search; ids are indices and must stay stable once bytecode refers to them.
pub static MAGIC_STRINGS: &[&str] = &[
    "",
    "Array",
    "Boolean",
    "Error",
    "EvalError",
    "Function",
    "Infinity",
    "Math",
    "NaN",
    "Number",
    "Object",
    "RangeError",
    "ReferenceError",
    "String",
    "Symbol",
    "SyntaxError",
    "TypeError",
    "URIError",
    "arguments",
    "boolean",
    "callee",
    "caller",
    "constructor",
    "done",
    "false",
    "function",
    "global",
    "join",
    "length",
    "message",
    "name",
    "next",
    "null",
    "number",
    "object",
    "prototype",
    "push",
    "string",
    "symbol",
    "this",
    "toString",
    "true",
    "undefined",
    "value",
    "valueOf",
];

/// Index into [`MAGIC_STRINGS`].
pub type MagicStringId = u16;

pub const MAGIC_EMPTY: MagicStringId = 0;

/// Magic id for `s`, when it is one of the common strings. The table is
/// sorted, so ids double as binary-search positions.
pub fn magic_string_id(s: &str) -> Option<MagicStringId> {
    MAGIC_STRINGS.binary_search(&s).ok().map(|i| i as MagicStringId)
}

pub fn magic_string(id: MagicStringId) -> &'static str {
    MAGIC_STRINGS[id as usize]
}

// ---------------------------------------------------------------------------
// String cells
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum StringData {
    /// Common static string, no heap payload
    Magic(MagicStringId),
    /// Owned UTF-8 bytes
    Utf8(Box<str>),
    /// Canonical uint32 array index
    Index(u32),
}

#[derive(Debug)]
pub struct StringCell {
    pub data: StringData,
    pub refs: u32,
    /// Held alive by the literal pool for the context's lifetime.
    pub in_literal_pool: bool,
}

impl StringCell {
    pub fn new(data: StringData) -> Self {
        StringCell { data, refs: 1, in_literal_pool: false }
    }

    /// Container choice for arbitrary text: magic id when common, canonical
    /// index when it spells one, owned bytes otherwise.
    pub fn from_str(s: &str) -> Self {
        if let Some(id) = magic_string_id(s) {
            return StringCell::new(StringData::Magic(id));
        }
        if let Some(ix) = parse_array_index(s) {
            return StringCell::new(StringData::Index(ix));
        }
        StringCell::new(StringData::Utf8(s.into()))
    }

    /// Characters of the string. Index-named strings materialise digits.
    pub fn flatten(&self) -> Cow<'_, str> {
        match &self.data {
            StringData::Magic(id) => Cow::Borrowed(magic_string(*id)),
            StringData::Utf8(s) => Cow::Borrowed(s),
            StringData::Index(n) => Cow::Owned(n.to_string()),
        }
    }

    pub fn len_utf8(&self) -> usize {
        self.flatten().len()
    }

    /// String length in UTF-16 code units (the `length` property).
    pub fn len_utf16(&self) -> usize {
        self.flatten().encode_utf16().count()
    }

    pub fn payload_bytes(&self) -> usize {
        match &self.data {
            StringData::Utf8(s) => s.len(),
            StringData::Magic(_) | StringData::Index(_) => 0,
        }
    }

    /// Equality: same container kind compares directly, otherwise length
    /// then byte contents.
    pub fn equals(&self, other: &StringCell) -> bool {
        match (&self.data, &other.data) {
            (StringData::Magic(a), StringData::Magic(b)) => a == b,
            (StringData::Index(a), StringData::Index(b)) => a == b,
            _ => {
                let a = self.flatten();
                let b = other.flatten();
                a.len() == b.len() && a == b
            }
        }
    }

    /// Relational comparison in UTF-16 code-unit order.
    pub fn compare(&self, other: &StringCell) -> std::cmp::Ordering {
        let a = self.flatten();
        let b = other.flatten();
        a.encode_utf16().cmp(b.encode_utf16())
    }

    /// The index this string canonically names, if any.
    pub fn as_array_index(&self) -> Option<u32> {
        match &self.data {
            StringData::Index(n) => Some(*n),
            StringData::Magic(id) => parse_array_index(magic_string(*id)),
            StringData::Utf8(s) => parse_array_index(s),
        }
    }
}

/// Canonical array index: "0" or a digit string without a leading zero whose
/// value is at most 2^32 - 2.
pub fn parse_array_index(s: &str) -> Option<u32> {
    if s.is_empty() || s.len() > 10 {
        return None;
    }
    let bytes = s.as_bytes();
    if !bytes.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if bytes[0] == b'0' && s.len() > 1 {
        return None;
    }
    let n: u64 = s.parse().ok()?;
    if n <= u32::MAX as u64 - 1 {
        Some(n as u32)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Symbols
// ---------------------------------------------------------------------------

/// Well-known symbols get fixed ids; the rest are unique per allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WellKnownSymbol {
    Iterator,
}

#[derive(Debug)]
pub struct SymbolCell {
    pub description: Option<Box<str>>,
    pub well_known: Option<WellKnownSymbol>,
    pub refs: u32,
}

impl SymbolCell {
    pub fn new(description: Option<&str>) -> Self {
        SymbolCell { description: description.map(Into::into), well_known: None, refs: 1 }
    }

    pub fn well_known(which: WellKnownSymbol) -> Self {
        let desc = match which {
            WellKnownSymbol::Iterator => "Symbol.iterator",
        };
        SymbolCell { description: Some(desc.into()), well_known: Some(which), refs: 1 }
    }
}

// ---------------------------------------------------------------------------
// Number boxes
// ---------------------------------------------------------------------------

/// Boxed f64 for numbers outside the small-int encoding.
#[derive(Debug)]
pub struct NumberCell {
    pub value: f64,
    pub refs: u32,
}

impl NumberCell {
    pub fn new(value: f64) -> Self {
        NumberCell { value, refs: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_table_sorted_and_found() {
        assert!(MAGIC_STRINGS.windows(2).all(|w| w[0] < w[1]));
        let id = magic_string_id("length").unwrap();
        assert_eq!(magic_string(id), "length");
        assert!(magic_string_id("definitely-not-common").is_none());
    }

    #[test]
    fn test_from_str_picks_container() {
        assert!(matches!(StringCell::from_str("length").data, StringData::Magic(_)));
        assert!(matches!(StringCell::from_str("17").data, StringData::Index(17)));
        assert!(matches!(StringCell::from_str("hello world").data, StringData::Utf8(_)));
    }

    #[test]
    fn test_equality_across_containers() {
        let a = StringCell::new(StringData::Index(42));
        let b = StringCell::new(StringData::Utf8("42".into()));
        assert!(a.equals(&b));
        let c = StringCell::new(StringData::Utf8("043".into()));
        assert!(!a.equals(&c));
    }

    #[test]
    fn test_array_index_rules() {
        assert_eq!(parse_array_index("0"), Some(0));
        assert_eq!(parse_array_index("4294967294"), Some(u32::MAX - 1));
        assert_eq!(parse_array_index("4294967295"), None, "2^32-1 is not an index");
        assert_eq!(parse_array_index("01"), None, "leading zero");
        assert_eq!(parse_array_index(""), None);
        assert_eq!(parse_array_index("-1"), None);
    }

    #[test]
    fn test_utf16_ordering() {
        // Supplementary-plane characters compare by surrogate pair in JS.
        let a = StringCell::from_str("\u{ff61}"); // halfwidth ideographic full stop
        let b = StringCell::from_str("\u{10000}"); // linear B syllable
        assert_eq!(a.compare(&b), std::cmp::Ordering::Greater);
    }

    #[test]
    fn test_utf16_length() {
        let s = StringCell::from_str("a\u{10000}");
        assert_eq!(s.len_utf16(), 3, "astral char counts as two units");
    }
}
