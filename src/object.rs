/// Objects, property pairs and lexical environments
///
/// An object is one heap cell: prototype cp, extensibility bit, an optional
/// built-in identity (with its lazy-instantiation bitset), the head of its
/// property-pair chain, and a kind-specific payload. Kinds are distinguished
/// by a type tag and dispatched by match, not by inheritance.
///
/// Properties live in chained two-slot pairs. Within one chain, names are
/// unique among occupied slots; a vacated slot is reused before the chain
/// grows. New pairs are appended at the tail so chain order tracks insertion
/// order.

use crate::builtins::BuiltinId;
use crate::errors::ErrorClass;
use crate::heap::{Cp, Heap};
use crate::string::MagicStringId;
use crate::value::Value;

// ---------------------------------------------------------------------------
// Property names
// ---------------------------------------------------------------------------

/// A property key. Magic and index names carry no heap payload; the string
/// form points at a string cell, symbols at a symbol cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropName {
    Magic(MagicStringId),
    Index(u32),
    Str(Cp),
    Symbol(Cp),
}

/// Content-aware key equality. Two distinct string cells with equal bytes
/// name the same property; symbols compare by identity.
pub fn prop_name_equals(heap: &Heap, a: PropName, b: PropName) -> bool {
    use PropName::*;
    match (a, b) {
        (Magic(x), Magic(y)) => x == y,
        (Index(x), Index(y)) => x == y,
        (Symbol(x), Symbol(y)) => x == y,
        (Symbol(_), _) | (_, Symbol(_)) => false,
        (Str(x), Str(y)) => x == y || heap.string(x).equals(heap.string(y)),
        (Str(x), Magic(y)) | (Magic(y), Str(x)) => {
            heap.string(x).flatten() == crate::string::magic_string(y)
        }
        (Str(x), Index(y)) | (Index(y), Str(x)) => {
            heap.string(x).as_array_index() == Some(y)
        }
        (Magic(x), Index(y)) | (Index(y), Magic(x)) => {
            crate::string::parse_array_index(crate::string::magic_string(x)) == Some(y)
        }
    }
}

// ---------------------------------------------------------------------------
// Property flags and data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropFlags(u8);

impl PropFlags {
    pub const WRITABLE: u8 = 1 << 0;
    pub const ENUMERABLE: u8 = 1 << 1;
    pub const CONFIGURABLE: u8 = 1 << 2;
    pub const ACCESSOR: u8 = 1 << 3;
    /// Materialised from a built-in descriptor table rather than defined by
    /// script.
    pub const VIRTUAL: u8 = 1 << 4;

    /// writable + enumerable + configurable: ordinary assignment result.
    pub fn data_default() -> Self {
        PropFlags(Self::WRITABLE | Self::ENUMERABLE | Self::CONFIGURABLE)
    }

    /// writable + configurable, not enumerable: built-in method default.
    pub fn builtin_default() -> Self {
        PropFlags(Self::WRITABLE | Self::CONFIGURABLE)
    }

    pub fn none() -> Self {
        PropFlags(0)
    }

    pub fn from_bits(bits: u8) -> Self {
        PropFlags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    #[inline(always)]
    pub fn writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    #[inline(always)]
    pub fn enumerable(self) -> bool {
        self.0 & Self::ENUMERABLE != 0
    }

    #[inline(always)]
    pub fn configurable(self) -> bool {
        self.0 & Self::CONFIGURABLE != 0
    }

    #[inline(always)]
    pub fn is_accessor(self) -> bool {
        self.0 & Self::ACCESSOR != 0
    }

    pub fn set(self, bit: u8, on: bool) -> Self {
        if on { PropFlags(self.0 | bit) } else { PropFlags(self.0 & !bit) }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum PropData {
    Value(Value),
    /// Getter/setter object cps; NULL marks an absent half.
    Accessor { getter: Cp, setter: Cp },
}

#[derive(Debug, Clone, Copy)]
pub struct Property {
    pub name: PropName,
    pub flags: PropFlags,
    pub data: PropData,
}

impl Property {
    pub fn data_prop(name: PropName, value: Value, flags: PropFlags) -> Self {
        Property { name, flags, data: PropData::Value(value) }
    }

    pub fn accessor_prop(name: PropName, getter: Cp, setter: Cp, flags: PropFlags) -> Self {
        Property {
            name,
            flags: flags.set(PropFlags::ACCESSOR, true),
            data: PropData::Accessor { getter, setter },
        }
    }

    pub fn value(&self) -> Value {
        match self.data {
            PropData::Value(v) => v,
            PropData::Accessor { .. } => Value::UNDEFINED,
        }
    }
}

/// Two property slots per chunk, chained through `next`.
#[derive(Debug)]
pub struct PropertyPair {
    pub next: Cp,
    pub slots: [Option<Property>; 2],
}

impl PropertyPair {
    pub fn new() -> Self {
        PropertyPair { next: Cp::NULL, slots: [None, None] }
    }

    pub fn with_first(prop: Property) -> Self {
        PropertyPair { next: Cp::NULL, slots: [Some(prop), None] }
    }
}

impl Default for PropertyPair {
    fn default() -> Self {
        PropertyPair::new()
    }
}

// ---------------------------------------------------------------------------
// Property descriptors (define-own-property input)
// ---------------------------------------------------------------------------

/// Partial descriptor as produced by `Object.defineProperty` conversion or
/// built-in tables. Absent fields mean "leave as is / default".
#[derive(Debug, Clone, Copy, Default)]
pub struct PropertyDescriptor {
    pub value: Option<Value>,
    pub writable: Option<bool>,
    pub getter: Option<Cp>,
    pub setter: Option<Cp>,
    pub enumerable: Option<bool>,
    pub configurable: Option<bool>,
}

impl PropertyDescriptor {
    pub fn data(value: Value, writable: bool, enumerable: bool, configurable: bool) -> Self {
        PropertyDescriptor {
            value: Some(value),
            writable: Some(writable),
            enumerable: Some(enumerable),
            configurable: Some(configurable),
            ..Default::default()
        }
    }

    pub fn is_data(&self) -> bool {
        self.value.is_some() || self.writable.is_some()
    }

    pub fn is_accessor(&self) -> bool {
        self.getter.is_some() || self.setter.is_some()
    }

    pub fn is_generic(&self) -> bool {
        !self.is_data() && !self.is_accessor()
    }
}

// ---------------------------------------------------------------------------
// Object kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxedClass {
    Boolean,
    Number,
    String,
    Symbol,
}

impl BoxedClass {
    pub fn name(self) -> &'static str {
        match self {
            BoxedClass::Boolean => "Boolean",
            BoxedClass::Number => "Number",
            BoxedClass::String => "String",
            BoxedClass::Symbol => "Symbol",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterKind {
    ArrayValues,
    ArrayKeys,
    ArrayEntries,
    StringChars,
}

/// Saved execution state of a suspended generator: everything `resume`
/// needs to reinstall the frame.
#[derive(Debug)]
pub struct GeneratorState {
    pub code: Cp,
    pub ip: usize,
    pub regs: Vec<Value>,
    pub stack: Vec<Value>,
    pub env: Cp,
    pub this: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorStatus {
    Suspended,
    Running,
    Done,
}

pub enum ObjectKind {
    General,
    /// Fast array: contiguous backing, holes encoded as EMPTY.
    Array { elements: Vec<Value> },
    /// Script function: compiled code, captured environment, and for
    /// arrows the creation-time `this` (EMPTY otherwise).
    Function { code: Cp, env: Cp, lexical_this: Value },
    /// Built-in or embedder-registered native function. `payload` carries
    /// internal capsule state (promise resolvers), NULL otherwise.
    NativeFunction { id: u16, construct: bool, payload: Cp },
    BoundFunction { target: Cp, bound_this: Value, bound_args: Vec<Value> },
    Boxed { class: BoxedClass, primitive: Value },
    ErrorObject { class: ErrorClass },
    Generator { status: GeneratorStatus, state: Option<Box<GeneratorState>> },
    /// Pattern/flags live as ordinary properties; matching is the embedder's
    /// regexp engine's concern.
    Regexp,
    /// Internal iterator over an array or string.
    Iterator { target: Value, index: u32, kind: IterKind },
    Promise { state: PromiseState, reactions: Vec<PromiseReaction> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

#[derive(Debug, Clone, Copy)]
pub enum PromiseReaction {
    /// `then` handlers; NULL halves pass the settlement through to `next`.
    Then { on_fulfilled: Cp, on_rejected: Cp, next: Cp },
    /// Await continuation: resume the async function's generator.
    AsyncContinue { gen: Cp, promise: Cp },
}

impl ObjectKind {
    pub fn tag_name(&self) -> &'static str {
        match self {
            ObjectKind::General => "object",
            ObjectKind::Array { .. } => "array",
            ObjectKind::Function { .. }
            | ObjectKind::NativeFunction { .. }
            | ObjectKind::BoundFunction { .. } => "function",
            ObjectKind::Boxed { .. } => "boxed",
            ObjectKind::ErrorObject { .. } => "error",
            ObjectKind::Generator { .. } => "generator",
            ObjectKind::Regexp => "regexp",
            ObjectKind::Iterator { .. } => "iterator",
            ObjectKind::Promise { .. } => "promise",
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            ObjectKind::Function { .. }
                | ObjectKind::NativeFunction { .. }
                | ObjectKind::BoundFunction { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Object cells
// ---------------------------------------------------------------------------

pub struct ObjectCell {
    pub proto: Cp,
    pub extensible: bool,
    /// Built-in identity, when this object has a lazy property table.
    pub builtin: Option<BuiltinId>,
    /// One bit per built-in table row already materialised into the chain.
    pub instantiated: u64,
    /// Head of the property-pair chain.
    pub props: Cp,
    pub kind: ObjectKind,
}

impl ObjectCell {
    pub fn ordinary(proto: Cp) -> Self {
        ObjectCell {
            proto,
            extensible: true,
            builtin: None,
            instantiated: 0,
            props: Cp::NULL,
            kind: ObjectKind::General,
        }
    }

    pub fn with_kind(proto: Cp, kind: ObjectKind) -> Self {
        ObjectCell { kind, ..ObjectCell::ordinary(proto) }
    }

    pub fn is_callable(&self) -> bool {
        self.kind.is_callable()
    }

    pub fn payload_bytes(&self) -> usize {
        match &self.kind {
            ObjectKind::Array { elements } => elements.capacity() * 8,
            ObjectKind::BoundFunction { bound_args, .. } => bound_args.len() * 8,
            ObjectKind::Generator { state: Some(s), .. } => {
                (s.regs.len() + s.stack.len()) * 8 + 48
            }
            ObjectKind::Promise { reactions, .. } => reactions.len() * 16,
            _ => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Chain scanning (read-only; mutation allocates and lives on the context)
// ---------------------------------------------------------------------------

/// Locate `name` in the object's own chain: (pair cp, slot index).
pub fn find_own_prop(heap: &Heap, obj: Cp, name: PropName) -> Option<(Cp, usize)> {
    let mut pair_cp = heap.object(obj).props;
    while !pair_cp.is_null() {
        let pair = heap.pair(pair_cp);
        for (i, slot) in pair.slots.iter().enumerate() {
            if let Some(prop) = slot {
                if prop_name_equals(heap, prop.name, name) {
                    return Some((pair_cp, i));
                }
            }
        }
        pair_cp = pair.next;
    }
    None
}

pub fn own_prop(heap: &Heap, obj: Cp, name: PropName) -> Option<Property> {
    find_own_prop(heap, obj, name).map(|(pair, i)| heap.pair(pair).slots[i].unwrap())
}

/// Own string-keyed property names in chain (insertion) order. Index names
/// come back first in ascending order, matching enumeration requirements.
pub fn own_prop_names(heap: &Heap, obj: Cp, enumerable_only: bool) -> Vec<PropName> {
    let mut indexed: Vec<u32> = Vec::new();
    let mut named: Vec<PropName> = Vec::new();
    let mut pair_cp = heap.object(obj).props;
    while !pair_cp.is_null() {
        let pair = heap.pair(pair_cp);
        for slot in pair.slots.iter().flatten() {
            if enumerable_only && !slot.flags.enumerable() {
                continue;
            }
            match slot.name {
                PropName::Symbol(_) => {}
                PropName::Index(n) => indexed.push(n),
                PropName::Str(cp) => match heap.string(cp).as_array_index() {
                    Some(n) => indexed.push(n),
                    None => named.push(slot.name),
                },
                PropName::Magic(id) => {
                    match crate::string::parse_array_index(crate::string::magic_string(id)) {
                        Some(n) => indexed.push(n),
                        None => named.push(slot.name),
                    }
                }
            }
        }
        pair_cp = pair.next;
    }
    indexed.sort_unstable();
    indexed.dedup();
    let mut out: Vec<PropName> = indexed.into_iter().map(PropName::Index).collect();
    out.extend(named);
    out
}

/// Bounded prototype-chain walk checking whether `candidate` already sits
/// above `obj`; used to reject prototype cycles.
pub fn proto_chain_contains(heap: &Heap, mut obj: Cp, candidate: Cp) -> bool {
    let mut hops = 0;
    while !obj.is_null() && hops < 1024 {
        if obj == candidate {
            return true;
        }
        obj = heap.object(obj).proto;
        hops += 1;
    }
    false
}

// ---------------------------------------------------------------------------
// Lexical environments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvKind {
    /// Own binding chain (function scope, block scope, catch scope).
    Declarative,
    /// Bindings delegate to an object (global scope, `with`).
    ObjectBound,
}

pub struct EnvCell {
    pub kind: EnvKind,
    pub outer: Cp,
    /// Declarative: head of the binding chain (property pairs).
    pub props: Cp,
    /// ObjectBound: the binding object.
    pub bound_object: Cp,
}

impl EnvCell {
    pub fn declarative(outer: Cp) -> Self {
        EnvCell { kind: EnvKind::Declarative, outer, props: Cp::NULL, bound_object: Cp::NULL }
    }

    pub fn object_bound(outer: Cp, object: Cp) -> Self {
        EnvCell { kind: EnvKind::ObjectBound, outer, props: Cp::NULL, bound_object: object }
    }
}

/// Locate a binding in a declarative environment's chain.
pub fn find_env_binding(heap: &Heap, env: Cp, name: PropName) -> Option<(Cp, usize)> {
    let mut pair_cp = heap.env(env).props;
    while !pair_cp.is_null() {
        let pair = heap.pair(pair_cp);
        for (i, slot) in pair.slots.iter().enumerate() {
            if let Some(prop) = slot {
                if prop_name_equals(heap, prop.name, name) {
                    return Some((pair_cp, i));
                }
            }
        }
        pair_cp = pair.next;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapCell;
    use crate::string::{StringCell, StringData};

    fn test_heap() -> Heap {
        Heap::new(256 * 1024)
    }

    #[test]
    fn test_prop_name_equality_across_forms() {
        let mut heap = test_heap();
        let s = heap
            .try_alloc(HeapCell::Str(StringCell::new(StringData::Utf8("length".into()))))
            .ok()
            .unwrap();
        let magic = PropName::Magic(crate::string::magic_string_id("length").unwrap());
        assert!(prop_name_equals(&heap, PropName::Str(s), magic));

        let idx_str = heap
            .try_alloc(HeapCell::Str(StringCell::new(StringData::Utf8("3".into()))))
            .ok()
            .unwrap();
        assert!(prop_name_equals(&heap, PropName::Str(idx_str), PropName::Index(3)));
        assert!(!prop_name_equals(&heap, PropName::Index(3), PropName::Index(4)));
    }

    #[test]
    fn test_find_own_prop_scans_chain() {
        let mut heap = test_heap();
        let obj = heap.try_alloc(HeapCell::Object(ObjectCell::ordinary(Cp::NULL))).ok().unwrap();
        let name = PropName::Magic(crate::string::magic_string_id("value").unwrap());
        let pair = heap
            .try_alloc(HeapCell::Pair(PropertyPair::with_first(Property::data_prop(
                name,
                Value::small_int(9),
                PropFlags::data_default(),
            ))))
            .ok()
            .unwrap();
        heap.object_mut(obj).props = pair;

        let (found_pair, slot) = find_own_prop(&heap, obj, name).unwrap();
        assert_eq!(found_pair, pair);
        assert_eq!(slot, 0);
        assert!(find_own_prop(&heap, obj, PropName::Index(0)).is_none());
    }

    #[test]
    fn test_own_prop_names_orders_indices_first() {
        let mut heap = test_heap();
        let obj = heap.try_alloc(HeapCell::Object(ObjectCell::ordinary(Cp::NULL))).ok().unwrap();
        let name = PropName::Magic(crate::string::magic_string_id("name").unwrap());
        let mut first = PropertyPair::with_first(Property::data_prop(
            name,
            Value::UNDEFINED,
            PropFlags::data_default(),
        ));
        first.slots[1] = Some(Property::data_prop(
            PropName::Index(7),
            Value::UNDEFINED,
            PropFlags::data_default(),
        ));
        let second = PropertyPair::with_first(Property::data_prop(
            PropName::Index(2),
            Value::UNDEFINED,
            PropFlags::data_default(),
        ));
        let second_cp = heap.try_alloc(HeapCell::Pair(second)).ok().unwrap();
        first.next = second_cp;
        let first_cp = heap.try_alloc(HeapCell::Pair(first)).ok().unwrap();
        heap.object_mut(obj).props = first_cp;

        let names = own_prop_names(&heap, obj, true);
        assert_eq!(names[0], PropName::Index(2));
        assert_eq!(names[1], PropName::Index(7));
        assert_eq!(names[2], name);
    }

    #[test]
    fn test_proto_cycle_detection() {
        let mut heap = test_heap();
        let a = heap.try_alloc(HeapCell::Object(ObjectCell::ordinary(Cp::NULL))).ok().unwrap();
        let b = heap.try_alloc(HeapCell::Object(ObjectCell::ordinary(a))).ok().unwrap();
        assert!(proto_chain_contains(&heap, b, a));
        assert!(!proto_chain_contains(&heap, a, b));
    }

    #[test]
    fn test_descriptor_classification() {
        let d = PropertyDescriptor::data(Value::TRUE, true, true, true);
        assert!(d.is_data() && !d.is_accessor());
        let mut g = PropertyDescriptor::default();
        g.getter = Some(Cp::NULL);
        assert!(g.is_accessor());
        assert!(PropertyDescriptor::default().is_generic());
    }
}
