/// Tagged Value — 64-bit word encoding every runtime value
///
/// LAYOUT
///
///   63          35                       3   2..0
///   [E] ........ [PAYLOAD: 32]           ... [TAG]
///
/// Tag space (low 3 bits):
///   000 = SMALL INT   (payload: i32, arithmetic is a shift)
///   001 = SIMPLE      (payload: undefined / null / false / true / empty)
///   010 = STRING      (payload: cp to string cell)
///   011 = NUMBER      (payload: cp to boxed f64)
///   100 = OBJECT      (payload: cp to object cell)
///   101 = SYMBOL      (payload: cp to symbol cell)
///
/// Bit 63 is the ERROR flag: a thrown value travelling back through
/// completions. `is_error` is a single comparison; every fallible call site
/// checks it before using the result.
///
/// Floats that are not exactly representable as an i32 small integer are
/// boxed into a number cell and referenced through the NUMBER tag.

use std::fmt;

use crate::heap::Cp;

const TAG_BITS: u32 = 3;
const TAG_MASK: u64 = 0b111;

const TAG_INT: u64 = 0b000;
const TAG_SIMPLE: u64 = 0b001;
const TAG_STRING: u64 = 0b010;
const TAG_NUMBER: u64 = 0b011;
const TAG_OBJECT: u64 = 0b100;
const TAG_SYMBOL: u64 = 0b101;

const ERROR_BIT: u64 = 1 << 63;

// Simple payloads
const SIMPLE_UNDEFINED: u64 = 0;
const SIMPLE_NULL: u64 = 1;
const SIMPLE_FALSE: u64 = 2;
const SIMPLE_TRUE: u64 = 3;
const SIMPLE_EMPTY: u64 = 4;

/// A tagged runtime value. 8 bytes, trivially copyable; heap kinds are held
/// by compressed pointer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    // ── Constructors ─────────────────────────────────────────────────────

    pub const UNDEFINED: Value = Value(SIMPLE_UNDEFINED << TAG_BITS | TAG_SIMPLE);
    pub const NULL: Value = Value(SIMPLE_NULL << TAG_BITS | TAG_SIMPLE);
    pub const FALSE: Value = Value(SIMPLE_FALSE << TAG_BITS | TAG_SIMPLE);
    pub const TRUE: Value = Value(SIMPLE_TRUE << TAG_BITS | TAG_SIMPLE);
    /// Internal sentinel: array hole, uninitialised binding. Never leaks to
    /// script.
    pub const EMPTY: Value = Value(SIMPLE_EMPTY << TAG_BITS | TAG_SIMPLE);

    #[inline(always)]
    pub const fn boolean(b: bool) -> Value {
        if b { Value::TRUE } else { Value::FALSE }
    }

    #[inline(always)]
    pub const fn small_int(n: i32) -> Value {
        Value(((n as u32 as u64) << TAG_BITS) | TAG_INT)
    }

    /// Small-int encoding for an f64, when it is an integral i32 that is not
    /// negative zero. Everything else needs a number box.
    #[inline(always)]
    pub fn small_int_from_f64(n: f64) -> Option<Value> {
        if n.fract() == 0.0
            && n >= i32::MIN as f64
            && n <= i32::MAX as f64
            && !(n == 0.0 && n.is_sign_negative())
        {
            Some(Value::small_int(n as i32))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn string(cp: Cp) -> Value {
        Value(((cp.raw() as u64) << TAG_BITS) | TAG_STRING)
    }

    #[inline(always)]
    pub fn number_box(cp: Cp) -> Value {
        Value(((cp.raw() as u64) << TAG_BITS) | TAG_NUMBER)
    }

    #[inline(always)]
    pub fn object(cp: Cp) -> Value {
        Value(((cp.raw() as u64) << TAG_BITS) | TAG_OBJECT)
    }

    #[inline(always)]
    pub fn symbol(cp: Cp) -> Value {
        Value(((cp.raw() as u64) << TAG_BITS) | TAG_SYMBOL)
    }

    // ── Type checks ──────────────────────────────────────────────────────

    #[inline(always)]
    fn tag(self) -> u64 {
        (self.0 & !ERROR_BIT) & TAG_MASK
    }

    #[inline(always)]
    pub fn is_undefined(self) -> bool {
        self.0 == Value::UNDEFINED.0
    }

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.0 == Value::NULL.0
    }

    #[inline(always)]
    pub fn is_nullish(self) -> bool {
        self.is_undefined() || self.is_null()
    }

    #[inline(always)]
    pub fn is_boolean(self) -> bool {
        self.0 == Value::TRUE.0 || self.0 == Value::FALSE.0
    }

    #[inline(always)]
    pub fn is_true(self) -> bool {
        self.0 == Value::TRUE.0
    }

    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self.0 == Value::EMPTY.0
    }

    #[inline(always)]
    pub fn is_small_int(self) -> bool {
        self.tag() == TAG_INT && !self.is_error()
    }

    #[inline(always)]
    pub fn is_string(self) -> bool {
        self.tag() == TAG_STRING
    }

    #[inline(always)]
    pub fn is_number_box(self) -> bool {
        self.tag() == TAG_NUMBER
    }

    /// Small int or boxed float.
    #[inline(always)]
    pub fn is_number(self) -> bool {
        self.is_small_int() || self.is_number_box()
    }

    #[inline(always)]
    pub fn is_object(self) -> bool {
        self.tag() == TAG_OBJECT
    }

    #[inline(always)]
    pub fn is_symbol(self) -> bool {
        self.tag() == TAG_SYMBOL
    }

    // ── Error flag ───────────────────────────────────────────────────────

    #[inline(always)]
    pub fn is_error(self) -> bool {
        (self.0 & ERROR_BIT) != 0
    }

    /// Tag a thrown value for transport through the context error slot.
    #[inline(always)]
    pub fn with_error_flag(self) -> Value {
        Value(self.0 | ERROR_BIT)
    }

    /// Recover the thrown value.
    #[inline(always)]
    pub fn without_error_flag(self) -> Value {
        Value(self.0 & !ERROR_BIT)
    }

    // ── Extractors ───────────────────────────────────────────────────────

    #[inline(always)]
    pub fn as_small_int(self) -> i32 {
        debug_assert!(self.is_small_int());
        ((self.0 & !ERROR_BIT) >> TAG_BITS) as u32 as i32
    }

    #[inline(always)]
    pub fn as_cp(self) -> Cp {
        debug_assert!(
            self.is_string() || self.is_number_box() || self.is_object() || self.is_symbol()
        );
        Cp::from_raw(((self.0 & !ERROR_BIT) >> TAG_BITS) as u32)
    }

    #[inline(always)]
    pub fn as_bool(self) -> bool {
        self.is_true()
    }

    #[inline(always)]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub fn from_raw(raw: u64) -> Value {
        Value(raw)
    }

    /// Identity on the tagged word. Heap-aware comparisons live on the
    /// context, which can flatten strings and unbox numbers.
    #[inline(always)]
    pub fn same_word(self, other: Value) -> bool {
        self.0 == other.0
    }

    pub fn type_tag_name(self) -> &'static str {
        if self.is_error() {
            return "error";
        }
        match self.tag() {
            TAG_INT => "small-int",
            TAG_SIMPLE => match (self.0 & !ERROR_BIT) >> TAG_BITS {
                SIMPLE_UNDEFINED => "undefined",
                SIMPLE_NULL => "null",
                SIMPLE_FALSE | SIMPLE_TRUE => "boolean",
                SIMPLE_EMPTY => "empty",
                _ => "simple",
            },
            TAG_STRING => "string",
            TAG_NUMBER => "number",
            TAG_OBJECT => "object",
            TAG_SYMBOL => "symbol",
            _ => "unknown",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_error() {
            return write!(f, "error({:?})", self.without_error_flag());
        }
        if self.is_small_int() {
            write!(f, "{}i", self.as_small_int())
        } else if self.is_undefined() {
            write!(f, "undefined")
        } else if self.is_null() {
            write!(f, "null")
        } else if self.is_boolean() {
            write!(f, "{}", self.is_true())
        } else if self.is_empty() {
            write!(f, "<empty>")
        } else if self.is_string() {
            write!(f, "str@{}", self.as_cp().raw())
        } else if self.is_number_box() {
            write!(f, "num@{}", self.as_cp().raw())
        } else if self.is_object() {
            write!(f, "obj@{}", self.as_cp().raw())
        } else if self.is_symbol() {
            write!(f, "sym@{}", self.as_cp().raw())
        } else {
            write!(f, "raw:0x{:016x}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_values_distinct() {
        let all = [
            Value::UNDEFINED,
            Value::NULL,
            Value::TRUE,
            Value::FALSE,
            Value::EMPTY,
        ];
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                assert_eq!(i == j, a.same_word(*b));
            }
        }
    }

    #[test]
    fn test_small_int_roundtrip() {
        for n in [0, 1, -1, 42, i32::MAX, i32::MIN] {
            let v = Value::small_int(n);
            assert!(v.is_small_int());
            assert!(v.is_number());
            assert_eq!(v.as_small_int(), n);
        }
    }

    #[test]
    fn test_small_int_from_f64_rejects_non_canonical() {
        assert_eq!(Value::small_int_from_f64(3.0).unwrap().as_small_int(), 3);
        assert!(Value::small_int_from_f64(3.5).is_none());
        assert!(Value::small_int_from_f64(-0.0).is_none(), "-0 needs a box");
        assert!(Value::small_int_from_f64(f64::NAN).is_none());
        assert!(Value::small_int_from_f64(2.0_f64.powi(40)).is_none());
    }

    #[test]
    fn test_error_flag_transport() {
        let v = Value::object(Cp::from_raw(7));
        let e = v.with_error_flag();
        assert!(e.is_error());
        assert!(!v.is_error());
        assert!(e.without_error_flag().same_word(v));
        assert_eq!(e.as_cp().raw(), 7, "payload survives the flag");
    }

    #[test]
    fn test_heap_tags_carry_cp() {
        let cp = Cp::from_raw(1234);
        assert!(Value::string(cp).is_string());
        assert!(Value::object(cp).is_object());
        assert!(Value::number_box(cp).is_number_box());
        assert!(Value::symbol(cp).is_symbol());
        assert_eq!(Value::object(cp).as_cp(), cp);
    }

    #[test]
    fn test_small_int_not_confused_with_error() {
        // A negative small int sets high payload bits but never bit 63.
        let v = Value::small_int(-1);
        assert!(!v.is_error());
        assert!(v.is_small_int());
    }
}
