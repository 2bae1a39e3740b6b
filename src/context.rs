/// Runtime context — the engine instance
///
/// Everything mutable lives here: the heap, the literal store, the built-in
/// singletons, the current exception slot, the microtask queue and the call
/// stack. Public API calls thread the context explicitly; two contexts are
/// fully independent and single-threaded by design.
///
/// COMPLETIONS
///   Fallible internal operations return `Completion<T>`: `Ok` carries the
///   value, `Err(Thrown)` carries a thrown script value or one of the two
///   uncatchable outcomes (out of memory, external termination). Call sites
///   check with `?`; nothing unwinds through Rust panics.
///
/// OWNERSHIP
///   Strings, symbols and number boxes are refcounted. A `Value` handed to a
///   storing operation transfers one reference; a `Value` returned from a
///   lookup comes with a fresh reference. Objects are traced, so their
///   references are free to copy. Helpers that allocate may trigger GC, so
///   callers park unrooted temporaries on the scratch stack first.

use std::collections::VecDeque;

use crate::builtins::{self, BuiltinRegistry, NativeId};
use crate::bytecode::CompiledCode;
use crate::errors::{EngineError, ErrorClass, ParseError};
use crate::gc::{self, GcStats};
use crate::heap::{Cp, Heap, HeapCell, OomSeverity};
use crate::literal::LiteralStorage;
use crate::object::{
    self, find_own_prop, BoxedClass, ObjectCell, ObjectKind, PropData, PropFlags, PropName,
    Property, PropertyDescriptor, PropertyPair,
};
use crate::string::{self, NumberCell, StringCell, StringData, SymbolCell};
use crate::value::Value;
use crate::vm::{self, Frame};

// ---------------------------------------------------------------------------
// Completions
// ---------------------------------------------------------------------------

/// An in-flight abnormal completion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Thrown {
    /// Script-visible exception; catchable.
    Value(Value),
    /// Allocation failed after the full severity ladder; uncatchable.
    OutOfMemory,
    /// The embedder's poll hook requested termination; uncatchable.
    Terminated,
}

pub type Completion<T = Value> = Result<T, Thrown>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const DEFAULT_HEAP_SIZE: usize = 512 * 1024;

#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Heap byte budget.
    pub heap_size: usize,
    /// Invoke the poll hook every this many back-branches.
    pub poll_interval: u32,
}

impl Default for ContextOptions {
    fn default() -> Self {
        ContextOptions { heap_size: DEFAULT_HEAP_SIZE, poll_interval: 1024 }
    }
}

/// A queued microtask: a plain callback, a promise reaction, or an async
/// function continuation.
pub enum Job {
    Call { callback: Cp, args: Vec<Value> },
    Reaction { handler: Cp, next: Cp, value: Value, rejected: bool },
    AsyncStep { gen: Cp, promise: Cp, value: Value, rejected: bool },
}

pub type ExternalFn = std::rc::Rc<dyn Fn(&mut Context, Value, &[Value]) -> Completion>;

// ---------------------------------------------------------------------------
// The context
// ---------------------------------------------------------------------------

pub struct Context {
    pub(crate) heap: Heap,
    pub(crate) lit: LiteralStorage,
    pub(crate) builtins: BuiltinRegistry,
    pub(crate) global: Cp,
    /// Error-in-progress transport slot; error-flagged when occupied.
    pub(crate) error_slot: Value,
    pub(crate) frames: Vec<Frame>,
    pub(crate) jobs: VecDeque<Job>,
    /// Values acquired through the embedder API.
    pub(crate) api_roots: Vec<Value>,
    /// Mid-construction temporaries the GC must see.
    pub(crate) scratch: Vec<Value>,
    pub(crate) externals: Vec<ExternalFn>,
    pub(crate) gc_stats: GcStats,
    pub(crate) options: ContextOptions,
    pub(crate) poll_hook: Option<Box<dyn FnMut() -> bool>>,
    pub(crate) back_branches: u32,
    /// Set when the active frame suspended at a yield/await opcode.
    pub(crate) suspended: Option<vm::SuspendKind>,
}

impl Context {
    pub fn new(options: ContextOptions) -> Self {
        let mut ctx = Context {
            heap: Heap::new(options.heap_size),
            lit: LiteralStorage::new(),
            builtins: BuiltinRegistry::new(),
            global: Cp::NULL,
            error_slot: Value::EMPTY,
            frames: Vec::new(),
            jobs: VecDeque::new(),
            api_roots: Vec::new(),
            scratch: Vec::new(),
            externals: Vec::new(),
            gc_stats: GcStats::default(),
            options,
            poll_hook: None,
            back_branches: 0,
            suspended: None,
        };
        builtins::initialize(&mut ctx);
        ctx
    }

    pub fn with_default_options() -> Self {
        Context::new(ContextOptions::default())
    }

    /// Install the cooperative-termination hook; returning `true` aborts the
    /// running script with an uncatchable completion.
    pub fn set_poll_hook(&mut self, hook: Box<dyn FnMut() -> bool>) {
        self.poll_hook = Some(hook);
    }

    pub fn heap_stats(&self) -> crate::heap::HeapStats {
        self.heap.stats()
    }

    /// Read-only heap view for tooling (disassembly, stats).
    pub fn heap_view(&self) -> &Heap {
        &self.heap
    }

    pub(crate) fn heap_ref(&self) -> &Heap {
        &self.heap
    }

    pub(crate) fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn gc_stats(&self) -> GcStats {
        self.gc_stats.clone()
    }

    pub fn global_object(&self) -> Value {
        Value::object(self.global)
    }

    /// Explicit collection request.
    pub fn collect_garbage(&mut self) -> usize {
        gc::collect(self)
    }

    // ── Allocation with the out-of-memory ladder ─────────────────────────

    /// Allocate a cell, escalating through the severity ladder before
    /// giving up: Low trims caches only, Medium and above run a full
    /// collection, and a failure after Critical surfaces the memory error.
    pub(crate) fn alloc_cell(&mut self, cell: HeapCell) -> Completion<Cp> {
        if self.heap.over_pressure() {
            gc::collect(self);
        }
        let mut cell = cell;
        match self.heap.try_alloc(cell) {
            Ok(cp) => return Ok(cp),
            Err(back) => cell = back,
        }
        for severity in OomSeverity::LADDER {
            self.oom_hook(severity);
            match self.heap.try_alloc(cell) {
                Ok(cp) => return Ok(cp),
                Err(back) => cell = back,
            }
        }
        Err(Thrown::OutOfMemory)
    }

    fn oom_hook(&mut self, severity: OomSeverity) {
        match severity {
            // Cache trimming would go here; the engine keeps no caches yet.
            OomSeverity::Low => {}
            OomSeverity::Medium | OomSeverity::High | OomSeverity::Critical => {
                gc::collect(self);
            }
        }
    }

    // ── Scratch roots ────────────────────────────────────────────────────

    #[inline]
    pub(crate) fn scratch_push(&mut self, v: Value) {
        self.scratch.push(v);
    }

    #[inline]
    pub(crate) fn scratch_pop(&mut self, n: usize) {
        let keep = self.scratch.len().saturating_sub(n);
        self.scratch.truncate(keep);
    }

    // ── Reference counting ───────────────────────────────────────────────

    /// Take an extra reference for refcounted kinds; no-op otherwise.
    pub fn acquire(&mut self, v: Value) -> Value {
        acquire_value(&mut self.heap, v);
        v
    }

    /// Give a reference back; frees the cell on the last one.
    pub fn release(&mut self, v: Value) {
        release_value(&mut self.heap, v);
    }

    /// Root a value for the embedder until `api_release`.
    pub fn api_acquire(&mut self, v: Value) -> Value {
        acquire_value(&mut self.heap, v);
        self.api_roots.push(v);
        v
    }

    pub fn api_release(&mut self, v: Value) {
        if let Some(pos) = self.api_roots.iter().position(|r| r.same_word(v)) {
            self.api_roots.swap_remove(pos);
            release_value(&mut self.heap, v);
        }
    }

    // ── Value constructors ───────────────────────────────────────────────

    pub fn new_string_value(&mut self, text: &str) -> Completion {
        let cp = self.alloc_cell(HeapCell::Str(StringCell::from_str(text)))?;
        Ok(Value::string(cp))
    }

    /// Number as a value: small-int encoding when canonical, boxed f64
    /// otherwise.
    pub fn number_value(&mut self, n: f64) -> Completion {
        if let Some(v) = Value::small_int_from_f64(n) {
            return Ok(v);
        }
        let cp = self.alloc_cell(HeapCell::Number(NumberCell::new(n)))?;
        Ok(Value::number_box(cp))
    }

    pub fn new_symbol(&mut self, description: Option<&str>) -> Completion {
        let cp = self.alloc_cell(HeapCell::Symbol(SymbolCell::new(description)))?;
        Ok(Value::symbol(cp))
    }

    pub fn new_object(&mut self) -> Completion {
        let proto = self.builtins.object_prototype();
        let cp = self.alloc_cell(HeapCell::Object(ObjectCell::ordinary(proto)))?;
        Ok(Value::object(cp))
    }

    pub(crate) fn new_object_cell(&mut self, cell: ObjectCell) -> Completion<Cp> {
        self.alloc_cell(HeapCell::Object(cell))
    }

    pub(crate) fn alloc_code_cell(&mut self, code: std::rc::Rc<CompiledCode>) -> Completion<Cp> {
        self.alloc_cell(HeapCell::Code(code))
    }

    pub fn new_array(&mut self, elements: Vec<Value>) -> Completion {
        let proto = self.builtins.array_prototype();
        let cell = ObjectCell::with_kind(proto, ObjectKind::Array { elements });
        let cp = self.alloc_cell(HeapCell::Object(cell))?;
        Ok(Value::object(cp))
    }

    // ── Errors ───────────────────────────────────────────────────────────

    /// Build an error object of `class` and return it as a thrown
    /// completion. Allocation failure degrades to the memory error.
    pub fn throw(&mut self, class: ErrorClass, message: &str) -> Thrown {
        match builtins::create_error(self, class, message) {
            Ok(v) => Thrown::Value(v),
            Err(t) => t,
        }
    }

    pub fn throw_type_error<T>(&mut self, message: &str) -> Completion<T> {
        Err(self.throw(ErrorClass::TypeError, message))
    }

    pub fn throw_range_error<T>(&mut self, message: &str) -> Completion<T> {
        Err(self.throw(ErrorClass::RangeError, message))
    }

    pub fn throw_reference_error<T>(&mut self, message: &str) -> Completion<T> {
        Err(self.throw(ErrorClass::ReferenceError, message))
    }

    /// Park a thrown value in the error slot, tagged with the error bit.
    pub(crate) fn set_error_slot(&mut self, v: Value) {
        self.error_slot = v.with_error_flag();
    }

    pub(crate) fn clear_error_slot(&mut self) -> Value {
        let v = self.error_slot;
        self.error_slot = Value::EMPTY;
        v.without_error_flag()
    }

    // ── Interning ────────────────────────────────────────────────────────

    pub(crate) fn intern_string(&mut self, text: &str) -> Completion<Cp> {
        self.lit.find_or_create_string(&mut self.heap, text).ok_or(Thrown::OutOfMemory)
    }

    pub(crate) fn intern_number(&mut self, n: f64) -> Completion<Cp> {
        self.lit.find_or_create_number(&mut self.heap, n).ok_or(Thrown::OutOfMemory)
    }

    // ── Conversions ──────────────────────────────────────────────────────

    pub fn to_boolean(&self, v: Value) -> bool {
        if v.is_boolean() {
            return v.is_true();
        }
        if v.is_undefined() || v.is_null() || v.is_empty() {
            return false;
        }
        if v.is_small_int() {
            return v.as_small_int() != 0;
        }
        if v.is_number_box() {
            let n = self.heap.number(v.as_cp()).value;
            return n != 0.0 && !n.is_nan();
        }
        if v.is_string() {
            return self.heap.string(v.as_cp()).len_utf8() != 0;
        }
        // objects and symbols
        true
    }

    /// Numeric value of a number-tagged value without conversion.
    pub(crate) fn number_of(&self, v: Value) -> f64 {
        if v.is_small_int() {
            v.as_small_int() as f64
        } else {
            self.heap.number(v.as_cp()).value
        }
    }

    pub fn to_number(&mut self, v: Value) -> Completion<f64> {
        if v.is_number() {
            return Ok(self.number_of(v));
        }
        if v.is_undefined() {
            return Ok(f64::NAN);
        }
        if v.is_null() {
            return Ok(0.0);
        }
        if v.is_boolean() {
            return Ok(if v.is_true() { 1.0 } else { 0.0 });
        }
        if v.is_string() {
            let text = self.heap.string(v.as_cp()).flatten().into_owned();
            return Ok(string_to_number(&text));
        }
        if v.is_symbol() {
            return self.throw_type_error("cannot convert a Symbol to a number");
        }
        let prim = self.to_primitive(v, PreferredType::Number)?;
        let n = self.to_number(prim)?;
        release_value(&mut self.heap, prim);
        Ok(n)
    }

    pub fn to_int32(&mut self, v: Value) -> Completion<i32> {
        let n = self.to_number(v)?;
        Ok(to_int32(n))
    }

    pub fn to_uint32(&mut self, v: Value) -> Completion<u32> {
        let n = self.to_number(v)?;
        Ok(to_int32(n) as u32)
    }

    /// ToString, producing a fresh (or shared magic) string value.
    pub fn to_string_value(&mut self, v: Value) -> Completion {
        if v.is_string() {
            acquire_value(&mut self.heap, v);
            return Ok(v);
        }
        if v.is_symbol() {
            return self.throw_type_error("cannot convert a Symbol to a string");
        }
        if v.is_object() {
            let prim = self.to_primitive(v, PreferredType::String)?;
            let s = self.to_string_value(prim)?;
            release_value(&mut self.heap, prim);
            return Ok(s);
        }
        let text = self.to_display_string(v)?;
        self.new_string_value(&text)
    }

    /// Rust-side characters of ToString for non-object values; objects go
    /// through ToPrimitive first.
    pub fn to_display_string(&mut self, v: Value) -> Completion<String> {
        if v.is_undefined() {
            return Ok("undefined".into());
        }
        if v.is_null() {
            return Ok("null".into());
        }
        if v.is_boolean() {
            return Ok(if v.is_true() { "true" } else { "false" }.into());
        }
        if v.is_small_int() {
            return Ok(v.as_small_int().to_string());
        }
        if v.is_number_box() {
            return Ok(number_to_js_string(self.heap.number(v.as_cp()).value));
        }
        if v.is_string() {
            return Ok(self.heap.string(v.as_cp()).flatten().into_owned());
        }
        if v.is_symbol() {
            return self.throw_type_error("cannot convert a Symbol to a string");
        }
        let prim = self.to_primitive(v, PreferredType::String)?;
        let text = self.to_display_string(prim)?;
        release_value(&mut self.heap, prim);
        Ok(text)
    }

    /// OrdinaryToPrimitive: valueOf/toString in hint order.
    pub fn to_primitive(&mut self, v: Value, hint: PreferredType) -> Completion {
        if !v.is_object() {
            acquire_value(&mut self.heap, v);
            return Ok(v);
        }
        let order: [&str; 2] = match hint {
            PreferredType::String => ["toString", "valueOf"],
            PreferredType::Number => ["valueOf", "toString"],
        };
        for name in order {
            let method = self.get_value_property_str(v, name)?;
            if method.is_object() && self.heap.object(method.as_cp()).is_callable() {
                let result = vm::call_value(self, method, v, &[])?;
                if !result.is_object() {
                    return Ok(result);
                }
                release_value(&mut self.heap, result);
            }
        }
        self.throw_type_error("cannot convert object to primitive value")
    }

    /// ToObject: wrap primitives in their boxed class.
    pub fn to_object(&mut self, v: Value) -> Completion {
        if v.is_object() {
            return Ok(v);
        }
        if v.is_nullish() {
            return self.throw_type_error("cannot convert undefined or null to object");
        }
        let (class, proto) = if v.is_string() {
            (BoxedClass::String, self.builtins.string_prototype())
        } else if v.is_number() {
            (BoxedClass::Number, self.builtins.number_prototype())
        } else if v.is_boolean() {
            (BoxedClass::Boolean, self.builtins.boolean_prototype())
        } else {
            (BoxedClass::Symbol, self.builtins.symbol_prototype())
        };
        acquire_value(&mut self.heap, v);
        let cell = ObjectCell::with_kind(proto, ObjectKind::Boxed { class, primitive: v });
        let cp = self.alloc_cell(HeapCell::Object(cell))?;
        Ok(Value::object(cp))
    }

    /// ToPropertyKey: canonical index, magic id, interned-ish string, or
    /// symbol identity.
    pub fn to_property_name(&mut self, key: Value) -> Completion<PropName> {
        if key.is_symbol() {
            return Ok(PropName::Symbol(key.as_cp()));
        }
        if key.is_small_int() {
            let n = key.as_small_int();
            if n >= 0 {
                return Ok(PropName::Index(n as u32));
            }
        }
        let text = self.to_display_string(key)?;
        Ok(self.prop_name_from_str(&text))
    }

    pub(crate) fn prop_name_from_str(&mut self, text: &str) -> PropName {
        if let Some(ix) = string::parse_array_index(text) {
            return PropName::Index(ix);
        }
        if let Some(id) = string::magic_string_id(text) {
            return PropName::Magic(id);
        }
        match self.heap.try_alloc(HeapCell::Str(StringCell::new(StringData::Utf8(text.into())))) {
            Ok(cp) => PropName::Str(cp),
            // Name allocation failure surfaces on the next allocating call;
            // fall back to a magic empty name that cannot match.
            Err(_) => PropName::Magic(string::MAGIC_EMPTY),
        }
    }

    /// Characters of a property name (symbols excluded).
    pub(crate) fn prop_name_text(&self, name: PropName) -> String {
        match name {
            PropName::Magic(id) => string::magic_string(id).to_string(),
            PropName::Index(n) => n.to_string(),
            PropName::Str(cp) => self.heap.string(cp).flatten().into_owned(),
            PropName::Symbol(cp) => {
                let sym = self.heap.symbol(cp);
                match &sym.description {
                    Some(d) => format!("Symbol({d})"),
                    None => "Symbol()".to_string(),
                }
            }
        }
    }

    // ── Equality & ordering ──────────────────────────────────────────────

    /// `===`
    pub fn strict_equals(&self, a: Value, b: Value) -> bool {
        if a.is_number() && b.is_number() {
            return self.number_of(a) == self.number_of(b);
        }
        if a.same_word(b) {
            return true;
        }
        if a.is_string() && b.is_string() {
            return self.heap.string(a.as_cp()).equals(self.heap.string(b.as_cp()));
        }
        false
    }

    /// SameValue: strict equality except NaN equals NaN and ±0 differ.
    pub fn same_value(&self, a: Value, b: Value) -> bool {
        if a.is_number() && b.is_number() {
            let x = self.number_of(a);
            let y = self.number_of(b);
            if x.is_nan() && y.is_nan() {
                return true;
            }
            return x.to_bits() == y.to_bits();
        }
        self.strict_equals(a, b)
    }

    /// `==` coercion ladder.
    pub fn loose_equals(&mut self, a: Value, b: Value) -> Completion<bool> {
        let same_type = (a.is_number() && b.is_number())
            || (a.is_undefined() && b.is_undefined())
            || (a.is_null() && b.is_null())
            || (a.is_boolean() && b.is_boolean())
            || (a.is_string() && b.is_string())
            || (a.is_object() && b.is_object())
            || (a.is_symbol() && b.is_symbol());
        if same_type {
            return Ok(self.strict_equals(a, b));
        }
        if a.is_nullish() && b.is_nullish() {
            return Ok(true);
        }
        if a.is_nullish() || b.is_nullish() {
            return Ok(false);
        }
        if a.is_number() && b.is_string() || a.is_string() && b.is_number() {
            let x = self.to_number(a)?;
            let y = self.to_number(b)?;
            return Ok(x == y);
        }
        if a.is_boolean() {
            let x = self.number_value(if a.is_true() { 1.0 } else { 0.0 })?;
            return self.loose_equals(x, b);
        }
        if b.is_boolean() {
            let y = self.number_value(if b.is_true() { 1.0 } else { 0.0 })?;
            return self.loose_equals(a, y);
        }
        if a.is_object() && (b.is_number() || b.is_string() || b.is_symbol()) {
            let prim = self.to_primitive(a, PreferredType::Number)?;
            return self.loose_equals(prim, b);
        }
        if b.is_object() && (a.is_number() || a.is_string() || a.is_symbol()) {
            let prim = self.to_primitive(b, PreferredType::Number)?;
            return self.loose_equals(a, prim);
        }
        Ok(false)
    }

    /// Abstract relational comparison; `None` means incomparable (NaN).
    pub fn less_than(&mut self, a: Value, b: Value) -> Completion<Option<bool>> {
        let pa = self.to_primitive(a, PreferredType::Number)?;
        let pb = self.to_primitive(b, PreferredType::Number)?;
        if pa.is_string() && pb.is_string() {
            let ord = self.heap.string(pa.as_cp()).compare(self.heap.string(pb.as_cp()));
            return Ok(Some(ord == std::cmp::Ordering::Less));
        }
        let x = self.to_number(pa)?;
        let y = self.to_number(pb)?;
        if x.is_nan() || y.is_nan() {
            return Ok(None);
        }
        Ok(Some(x < y))
    }

    // ── Property access ──────────────────────────────────────────────────

    /// Own property, materialising lazy built-in rows on first touch.
    pub(crate) fn get_own_property(&mut self, obj: Cp, name: PropName) -> Completion<Option<Property>> {
        if let Some((pair, slot)) = find_own_prop(&self.heap, obj, name) {
            return Ok(self.heap.pair(pair).slots[slot]);
        }
        // Virtual array length.
        if let ObjectKind::Array { elements } = &self.heap.object(obj).kind {
            if matches!(name, PropName::Magic(id) if string::magic_string(id) == "length") {
                let len = elements.len() as i32;
                return Ok(Some(Property::data_prop(
                    name,
                    Value::small_int(len),
                    PropFlags::from_bits(PropFlags::WRITABLE),
                )));
            }
            if let PropName::Index(ix) = name {
                if let Some(v) = self.array_element(obj, ix) {
                    return Ok(Some(Property::data_prop(name, v, PropFlags::data_default())));
                }
            }
        }
        // Script-function virtuals: `prototype` materialises on first use,
        // `length` and `name` answer from the code header.
        if let ObjectKind::Function { code, .. } = self.heap.object(obj).kind {
            let code = self.heap.code(code);
            let text = self.prop_name_text(name);
            match text.as_str() {
                "prototype" if !code.is_arrow() => {
                    let proto_obj = self.new_object()?;
                    self.scratch_push(proto_obj);
                    let result = (|| {
                        let cn = self.prop_name_from_str("constructor");
                        let cn = self.own_name_copy(cn)?;
                        self.add_own_property(
                            proto_obj.as_cp(),
                            Property::data_prop(
                                cn,
                                Value::object(obj),
                                PropFlags::builtin_default(),
                            ),
                        )?;
                        let pn = self.own_name_copy(name)?;
                        let prop = Property::data_prop(
                            pn,
                            proto_obj,
                            PropFlags::from_bits(PropFlags::WRITABLE),
                        );
                        self.add_own_property(obj, prop)?;
                        Ok(prop)
                    })();
                    self.scratch_pop(1);
                    return result.map(Some);
                }
                "length" => {
                    return Ok(Some(Property::data_prop(
                        name,
                        Value::small_int(code.arg_count as i32),
                        PropFlags::from_bits(PropFlags::CONFIGURABLE | PropFlags::VIRTUAL),
                    )));
                }
                "name" => {
                    // Both forms are pool-held literals, so the transient
                    // property needs no reference of its own.
                    let value = match code.name_const {
                        Some(ix) => Value::string(code.consts[ix as usize]),
                        None => Value::string(self.intern_string("")?),
                    };
                    return Ok(Some(Property::data_prop(
                        name,
                        value,
                        PropFlags::from_bits(PropFlags::CONFIGURABLE | PropFlags::VIRTUAL),
                    )));
                }
                _ => {}
            }
        }
        if self.heap.object(obj).builtin.is_some() {
            return builtins::instantiate_lazy(self, obj, name);
        }
        Ok(None)
    }

    fn array_element(&self, obj: Cp, index: u32) -> Option<Value> {
        match &self.heap.object(obj).kind {
            ObjectKind::Array { elements } => match elements.get(index as usize) {
                Some(v) if !v.is_empty() => Some(*v),
                _ => None,
            },
            _ => None,
        }
    }

    /// `obj.[[Get]](name, receiver)`: prototype walk plus accessor dispatch.
    pub fn ordinary_get(&mut self, obj: Cp, name: PropName, receiver: Value) -> Completion {
        let mut cur = obj;
        let mut hops = 0;
        while !cur.is_null() {
            if let Some(prop) = self.get_own_property(cur, name)? {
                return match prop.data {
                    PropData::Value(v) => {
                        acquire_value(&mut self.heap, v);
                        Ok(v)
                    }
                    PropData::Accessor { getter, .. } => {
                        if getter.is_null() {
                            Ok(Value::UNDEFINED)
                        } else {
                            vm::call_value(self, Value::object(getter), receiver, &[])
                        }
                    }
                };
            }
            cur = self.heap.object(cur).proto;
            hops += 1;
            if hops > 10_000 {
                return self.throw_range_error("prototype chain too deep");
            }
        }
        Ok(Value::UNDEFINED)
    }

    /// Property read on any base value; primitive fast paths first.
    pub fn get_value_property(&mut self, base: Value, name: PropName) -> Completion {
        if base.is_nullish() {
            let shown = self.prop_name_text(name);
            return Err(self.throw(
                ErrorClass::TypeError,
                &format!("cannot read property '{shown}' of {}", if base.is_null() { "null" } else { "undefined" }),
            ));
        }
        if base.is_string() {
            // String fast paths: length and direct indexing.
            if matches!(name, PropName::Magic(id) if string::magic_string(id) == "length") {
                let len = self.heap.string(base.as_cp()).len_utf16();
                return Ok(Value::small_int(len as i32));
            }
            if let PropName::Index(ix) = name {
                let cell = self.heap.string(base.as_cp());
                let units: Vec<u16> = cell.flatten().encode_utf16().collect();
                if let Some(&unit) = units.get(ix as usize) {
                    let text = String::from_utf16_lossy(&[unit]);
                    return self.new_string_value(&text);
                }
                return Ok(Value::UNDEFINED);
            }
            let proto = self.builtins.string_prototype();
            return self.ordinary_get(proto, name, base);
        }
        if base.is_object() {
            return self.ordinary_get(base.as_cp(), name, base);
        }
        // Remaining primitives delegate to their prototype without boxing.
        let proto = if base.is_number() {
            self.builtins.number_prototype()
        } else if base.is_boolean() {
            self.builtins.boolean_prototype()
        } else {
            self.builtins.symbol_prototype()
        };
        self.ordinary_get(proto, name, base)
    }

    pub fn get_value_property_str(&mut self, base: Value, name: &str) -> Completion {
        let name = self.prop_name_from_str(name);
        self.get_value_property(base, name)
    }

    /// `obj.[[Set]]`: honours setters and read-only properties up the chain,
    /// then creates/updates a data property on the receiver. Consumes one
    /// reference of `value`.
    pub fn set_value_property(
        &mut self,
        base: Value,
        name: PropName,
        value: Value,
        strict: bool,
    ) -> Completion<()> {
        if base.is_nullish() {
            release_value(&mut self.heap, value);
            let shown = self.prop_name_text(name);
            return Err(self.throw(
                ErrorClass::TypeError,
                &format!("cannot set property '{shown}' of {}", if base.is_null() { "null" } else { "undefined" }),
            ));
        }
        if !base.is_object() {
            // Primitive receivers silently drop (throw in strict mode).
            release_value(&mut self.heap, value);
            if strict {
                return Err(self.throw(ErrorClass::TypeError, "cannot create property on primitive"));
            }
            return Ok(());
        }
        let obj = base.as_cp();

        // Fast array path.
        if let PropName::Index(ix) = name {
            if matches!(self.heap.object(obj).kind, ObjectKind::Array { .. }) {
                return self.array_set_element(obj, ix, value, strict);
            }
        }
        if let ObjectKind::Array { .. } = self.heap.object(obj).kind {
            if matches!(name, PropName::Magic(id) if string::magic_string(id) == "length") {
                return self.array_set_length(obj, value, strict);
            }
        }

        // Walk the chain for accessors / read-only conflicts.
        let mut cur = obj;
        while !cur.is_null() {
            if let Some(prop) = self.get_own_property(cur, name)? {
                match prop.data {
                    PropData::Accessor { setter, .. } => {
                        if setter.is_null() {
                            release_value(&mut self.heap, value);
                            if strict {
                                return Err(self.throw(
                                    ErrorClass::TypeError,
                                    "cannot set property with only a getter",
                                ));
                            }
                            return Ok(());
                        }
                        let r = vm::call_value(self, Value::object(setter), base, &[value])?;
                        release_value(&mut self.heap, value);
                        release_value(&mut self.heap, r);
                        return Ok(());
                    }
                    PropData::Value(_) => {
                        if !prop.flags.writable() {
                            release_value(&mut self.heap, value);
                            if strict {
                                let shown = self.prop_name_text(name);
                                return Err(self.throw(
                                    ErrorClass::TypeError,
                                    &format!("cannot assign to read only property '{shown}'"),
                                ));
                            }
                            return Ok(());
                        }
                        if cur == obj {
                            // Overwrite in place.
                            let (pair, slot) = find_own_prop(&self.heap, obj, name)
                                .unwrap_or_else(|| unreachable!("own property vanished"));
                            let old = self.heap.pair(pair).slots[slot]
                                .unwrap_or_else(|| unreachable!())
                                .value();
                            release_value(&mut self.heap, old);
                            if let Some(p) = &mut self.heap.pair_mut(pair).slots[slot] {
                                p.data = PropData::Value(value);
                            }
                            return Ok(());
                        }
                        break;
                    }
                }
            }
            cur = self.heap.object(cur).proto;
        }

        if !self.heap.object(obj).extensible {
            release_value(&mut self.heap, value);
            if strict {
                return Err(self.throw(ErrorClass::TypeError, "object is not extensible"));
            }
            return Ok(());
        }
        let name = self.own_name_copy(name)?;
        self.add_own_property(obj, Property::data_prop(name, value, PropFlags::data_default()))
    }

    fn array_set_element(&mut self, obj: Cp, ix: u32, value: Value, strict: bool) -> Completion<()> {
        let len = match &self.heap.object(obj).kind {
            ObjectKind::Array { elements } => elements.len(),
            _ => unreachable!(),
        };
        if (ix as usize) > len + 4096 {
            // Far out-of-range writes fall back to ordinary properties so a
            // sparse assignment cannot balloon the backing store.
            let name = PropName::Index(ix);
            if find_own_prop(&self.heap, obj, name).is_some() {
                return self.overwrite_own(obj, name, value);
            }
            let _ = strict;
            return self.add_own_property(
                obj,
                Property::data_prop(name, value, PropFlags::data_default()),
            );
        }
        let mut old = None;
        let mut grew = false;
        if let ObjectKind::Array { elements } = &mut self.heap.object_mut(obj).kind {
            if (ix as usize) < elements.len() {
                old = Some(elements[ix as usize]);
                elements[ix as usize] = value;
            } else {
                while elements.len() < ix as usize {
                    elements.push(Value::EMPTY);
                }
                elements.push(value);
                grew = true;
            }
        }
        if let Some(old) = old {
            release_value(&mut self.heap, old);
        }
        if grew && !self.heap.try_recharge(obj) {
            // Roll back the growth and report exhaustion.
            if let ObjectKind::Array { elements } = &mut self.heap.object_mut(obj).kind {
                elements.truncate(len);
            }
            release_value(&mut self.heap, value);
            return Err(Thrown::OutOfMemory);
        }
        Ok(())
    }

    fn array_set_length(&mut self, obj: Cp, value: Value, _strict: bool) -> Completion<()> {
        let n = self.to_number(value)?;
        release_value(&mut self.heap, value);
        let len = n as u32;
        if n.is_nan() || n < 0.0 || (len as f64) != n {
            return self.throw_range_error("invalid array length");
        }
        let mut released = Vec::new();
        if let ObjectKind::Array { elements } = &mut self.heap.object_mut(obj).kind {
            if (len as usize) < elements.len() {
                released.extend(elements.drain(len as usize..));
            } else {
                while elements.len() < len as usize {
                    elements.push(Value::EMPTY);
                }
            }
        }
        for v in released {
            release_value(&mut self.heap, v);
        }
        let _ = self.heap.try_recharge(obj);
        Ok(())
    }

    fn overwrite_own(&mut self, obj: Cp, name: PropName, value: Value) -> Completion<()> {
        let (pair, slot) =
            find_own_prop(&self.heap, obj, name).unwrap_or_else(|| unreachable!());
        let old = self.heap.pair(pair).slots[slot].unwrap_or_else(|| unreachable!()).value();
        release_value(&mut self.heap, old);
        if let Some(p) = &mut self.heap.pair_mut(pair).slots[slot] {
            p.data = PropData::Value(value);
        }
        Ok(())
    }

    /// Fresh reference for a name about to be stored in a chain.
    pub(crate) fn own_name_copy(&mut self, name: PropName) -> Completion<PropName> {
        match name {
            PropName::Str(cp) => {
                self.heap.string_mut(cp).refs += 1;
                Ok(name)
            }
            PropName::Symbol(cp) => {
                self.heap.symbol_mut(cp).refs += 1;
                Ok(name)
            }
            _ => Ok(name),
        }
    }

    /// Append a property, reusing the first vacant slot before the chain
    /// grows a new pair at the tail. The caller owns name and value refs.
    pub(crate) fn add_own_property(&mut self, obj: Cp, prop: Property) -> Completion<()> {
        let mut pair_cp = self.heap.object(obj).props;
        let mut last = Cp::NULL;
        while !pair_cp.is_null() {
            let (vacant, next) = {
                let pair = self.heap.pair(pair_cp);
                (pair.slots.iter().position(|s| s.is_none()), pair.next)
            };
            if let Some(slot) = vacant {
                self.heap.pair_mut(pair_cp).slots[slot] = Some(prop);
                return Ok(());
            }
            last = pair_cp;
            pair_cp = next;
        }
        let fresh = self.alloc_cell(HeapCell::Pair(PropertyPair::with_first(prop)))?;
        if last.is_null() {
            self.heap.object_mut(obj).props = fresh;
        } else {
            self.heap.pair_mut(last).next = fresh;
        }
        Ok(())
    }

    /// ECMA-262 §9.1.6 ordinary [[DefineOwnProperty]].
    pub fn define_own_property(
        &mut self,
        obj: Cp,
        name: PropName,
        desc: PropertyDescriptor,
    ) -> Completion<bool> {
        let current = self.get_own_property(obj, name)?;

        let Some(current) = current else {
            if !self.heap.object(obj).extensible {
                return Ok(false);
            }
            let name = self.own_name_copy(name)?;
            let prop = if desc.is_accessor() {
                let mut flags = PropFlags::none()
                    .set(PropFlags::ENUMERABLE, desc.enumerable.unwrap_or(false))
                    .set(PropFlags::CONFIGURABLE, desc.configurable.unwrap_or(false));
                flags = flags.set(PropFlags::ACCESSOR, true);
                Property {
                    name,
                    flags,
                    data: PropData::Accessor {
                        getter: desc.getter.unwrap_or(Cp::NULL),
                        setter: desc.setter.unwrap_or(Cp::NULL),
                    },
                }
            } else {
                let value = desc.value.unwrap_or(Value::UNDEFINED);
                acquire_value(&mut self.heap, value);
                let flags = PropFlags::none()
                    .set(PropFlags::WRITABLE, desc.writable.unwrap_or(false))
                    .set(PropFlags::ENUMERABLE, desc.enumerable.unwrap_or(false))
                    .set(PropFlags::CONFIGURABLE, desc.configurable.unwrap_or(false));
                Property::data_prop(name, value, flags)
            };
            // Array index definitions keep the fast backing in sync.
            if let (PropName::Index(ix), PropData::Value(v)) = (name, prop.data) {
                if matches!(self.heap.object(obj).kind, ObjectKind::Array { .. })
                    && prop.flags.writable()
                    && prop.flags.enumerable()
                    && prop.flags.configurable()
                {
                    return self.array_set_element(obj, ix, v, false).map(|_| true);
                }
            }
            self.add_own_property(obj, prop)?;
            return Ok(true);
        };

        // Existing property: validate against configurability.
        if !current.flags.configurable() {
            if desc.configurable == Some(true) {
                return Ok(false);
            }
            if let Some(e) = desc.enumerable {
                if e != current.flags.enumerable() {
                    return Ok(false);
                }
            }
            if desc.is_accessor() != current.flags.is_accessor()
                && (desc.is_accessor() || desc.is_data())
            {
                return Ok(false);
            }
            if !current.flags.is_accessor() {
                if !current.flags.writable() {
                    if desc.writable == Some(true) {
                        return Ok(false);
                    }
                    if let Some(v) = desc.value {
                        if !self.same_value(v, current.value()) {
                            return Ok(false);
                        }
                    }
                }
            } else if let PropData::Accessor { getter, setter } = current.data {
                if let Some(g) = desc.getter {
                    if g != getter {
                        return Ok(false);
                    }
                }
                if let Some(s) = desc.setter {
                    if s != setter {
                        return Ok(false);
                    }
                }
            }
        }

        let (pair, slot) = find_own_prop(&self.heap, obj, name)
            .unwrap_or_else(|| unreachable!("descriptor target vanished"));
        let mut updated = current;
        updated.flags = updated
            .flags
            .set(PropFlags::ENUMERABLE, desc.enumerable.unwrap_or(current.flags.enumerable()))
            .set(
                PropFlags::CONFIGURABLE,
                desc.configurable.unwrap_or(current.flags.configurable()),
            );
        if desc.is_accessor() {
            let (old_g, old_s) = match current.data {
                PropData::Accessor { getter, setter } => (getter, setter),
                PropData::Value(v) => {
                    release_value(&mut self.heap, v);
                    (Cp::NULL, Cp::NULL)
                }
            };
            updated.flags = updated.flags.set(PropFlags::ACCESSOR, true).set(PropFlags::WRITABLE, false);
            updated.data = PropData::Accessor {
                getter: desc.getter.unwrap_or(old_g),
                setter: desc.setter.unwrap_or(old_s),
            };
        } else if desc.is_data() {
            if let PropData::Value(old) = current.data {
                if desc.value.is_some() {
                    release_value(&mut self.heap, old);
                }
            }
            let value = match desc.value {
                Some(v) => {
                    acquire_value(&mut self.heap, v);
                    v
                }
                None => current.value(),
            };
            updated.flags = updated
                .flags
                .set(PropFlags::ACCESSOR, false)
                .set(PropFlags::WRITABLE, desc.writable.unwrap_or(current.flags.writable()));
            updated.data = PropData::Value(value);
        }
        self.heap.pair_mut(pair).slots[slot] = Some(updated);
        Ok(true)
    }

    pub fn delete_property(&mut self, obj: Cp, name: PropName) -> Completion<bool> {
        // Fast array elements delete into holes.
        if let PropName::Index(ix) = name {
            let mut holed = None;
            if let ObjectKind::Array { elements } = &mut self.heap.object_mut(obj).kind {
                if (ix as usize) < elements.len() {
                    holed = Some(std::mem::replace(&mut elements[ix as usize], Value::EMPTY));
                }
            }
            if let Some(old) = holed {
                release_value(&mut self.heap, old);
                return Ok(true);
            }
        }
        match find_own_prop(&self.heap, obj, name) {
            None => Ok(true),
            Some((pair, slot)) => {
                let prop = self.heap.pair(pair).slots[slot].unwrap_or_else(|| unreachable!());
                if !prop.flags.configurable() {
                    return Ok(false);
                }
                self.heap.pair_mut(pair).slots[slot] = None;
                match prop.name {
                    PropName::Str(cp) => {
                        let s = self.heap.string_mut(cp);
                        s.refs -= 1;
                        if s.refs == 0 {
                            self.heap.free(cp);
                        }
                    }
                    PropName::Symbol(cp) => {
                        let s = self.heap.symbol_mut(cp);
                        s.refs -= 1;
                        if s.refs == 0 {
                            self.heap.free(cp);
                        }
                    }
                    _ => {}
                }
                if let PropData::Value(v) = prop.data {
                    release_value(&mut self.heap, v);
                }
                Ok(true)
            }
        }
    }

    pub fn has_property(&mut self, obj: Cp, name: PropName) -> Completion<bool> {
        let mut cur = obj;
        while !cur.is_null() {
            if self.get_own_property(cur, name)?.is_some() {
                return Ok(true);
            }
            if let ObjectKind::Array { elements } = &self.heap.object(cur).kind {
                if let PropName::Index(ix) = name {
                    if matches!(elements.get(ix as usize), Some(v) if !v.is_empty()) {
                        return Ok(true);
                    }
                }
            }
            cur = self.heap.object(cur).proto;
        }
        Ok(false)
    }

    /// Own enumerable string-keyed names (Object.keys, for-in seed).
    pub fn own_keys(&mut self, obj: Cp) -> Completion<Vec<PropName>> {
        let mut keys: Vec<PropName> = Vec::new();
        if let ObjectKind::Array { elements } = &self.heap.object(obj).kind {
            for (i, v) in elements.iter().enumerate() {
                if !v.is_empty() {
                    keys.push(PropName::Index(i as u32));
                }
            }
        }
        keys.extend(object::own_prop_names(&self.heap, obj, true));
        Ok(keys)
    }

    pub fn get_prototype(&self, obj: Cp) -> Value {
        let proto = self.heap.object(obj).proto;
        if proto.is_null() {
            Value::NULL
        } else {
            Value::object(proto)
        }
    }

    /// [[SetPrototypeOf]] with cycle and extensibility checks.
    pub fn set_prototype(&mut self, obj: Cp, proto: Value) -> Completion<bool> {
        let new_proto = if proto.is_null() {
            Cp::NULL
        } else if proto.is_object() {
            proto.as_cp()
        } else {
            return self.throw_type_error("prototype must be an object or null");
        };
        if self.heap.object(obj).proto == new_proto {
            return Ok(true);
        }
        if !self.heap.object(obj).extensible {
            return Ok(false);
        }
        if !new_proto.is_null() && object::proto_chain_contains(&self.heap, new_proto, obj) {
            return Ok(false);
        }
        self.heap.object_mut(obj).proto = new_proto;
        Ok(true)
    }

    // ── Microtasks ───────────────────────────────────────────────────────

    pub fn enqueue_job(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    /// Drain the microtask queue; called between top-level executions.
    pub fn run_jobs(&mut self) -> Completion<()> {
        while let Some(job) = self.jobs.pop_front() {
            builtins::run_job(self, job)?;
        }
        Ok(())
    }

    // ── Embedder surface ─────────────────────────────────────────────────

    /// Parse source text into a compiled-code block.
    pub fn parse(&mut self, source: &str, flags: crate::parser::ParseFlags) -> Result<Cp, ParseError> {
        crate::parser::parse(self, source, flags)
    }

    /// Run a compiled-code block as a top-level script, then drain the
    /// microtask queue.
    pub fn run(&mut self, code: Cp) -> Result<Value, EngineError> {
        let global_this = Value::object(self.global);
        let outcome = vm::run_code(self, code, global_this, &[])
            .and_then(|v| self.run_jobs().map(|()| v));
        match outcome {
            Ok(v) => Ok(v),
            Err(Thrown::Value(v)) => {
                let (class, message) = self.describe_thrown(v);
                Err(EngineError::Uncaught { class, message })
            }
            Err(Thrown::OutOfMemory) => Err(EngineError::OutOfMemory),
            Err(Thrown::Terminated) => Err(EngineError::Terminated),
        }
    }

    /// Parse and run in one step.
    pub fn eval(&mut self, source: &str) -> Result<Value, EngineError> {
        let code = self.parse(source, crate::parser::ParseFlags::default())
            .map_err(EngineError::Parse)?;
        self.run(code)
    }

    /// Call a function value through the public API.
    pub fn function_call(&mut self, func: Value, this: Value, args: &[Value]) -> Completion {
        vm::call_value(self, func, this, args)
    }

    /// Register a native function as a global binding. Natives receive
    /// `(ctx, this, args)` and return a completion.
    pub fn register_external_function(
        &mut self,
        name: &str,
        func: ExternalFn,
    ) -> Completion<()> {
        let id = self.externals.len();
        self.externals.push(func);
        let fn_obj = builtins::make_native_function(
            self,
            NativeId::External(id as u16),
            name,
            0,
            false,
        )?;
        let global = self.global;
        let name = self.prop_name_from_str(name);
        let name = self.own_name_copy(name)?;
        self.add_own_property(
            global,
            Property::data_prop(name, fn_obj, PropFlags::data_default()),
        )
    }

    /// Constructor name + message for an uncaught thrown value.
    pub fn describe_thrown(&mut self, v: Value) -> (String, String) {
        if v.is_object() {
            let class = match self.heap.object(v.as_cp()).kind {
                ObjectKind::ErrorObject { class } => class.name().to_string(),
                _ => "Error".to_string(),
            };
            let msg = self
                .get_value_property_str(v, "message")
                .ok()
                .filter(|m| !m.is_undefined())
                .and_then(|m| self.to_display_string(m).ok())
                .unwrap_or_default();
            if matches!(self.heap.object(v.as_cp()).kind, ObjectKind::ErrorObject { .. }) {
                return (class, msg);
            }
            let shown = self.to_display_string(v).unwrap_or_else(|_| "[object]".into());
            return ("Error".to_string(), shown);
        }
        let shown = self.to_display_string(v).unwrap_or_else(|_| "?".into());
        ("Error".to_string(), shown)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let mut lit = std::mem::take(&mut self.lit);
        lit.clear(&mut self.heap);
    }
}

// ---------------------------------------------------------------------------
// Refcount plumbing (shared with the GC sweep)
// ---------------------------------------------------------------------------

pub(crate) fn acquire_value(heap: &mut Heap, v: Value) {
    let v = v.without_error_flag();
    if v.is_string() {
        heap.string_mut(v.as_cp()).refs += 1;
    } else if v.is_number_box() {
        heap.number_mut(v.as_cp()).refs += 1;
    } else if v.is_symbol() {
        heap.symbol_mut(v.as_cp()).refs += 1;
    }
}

pub(crate) fn release_value(heap: &mut Heap, v: Value) {
    let v = v.without_error_flag();
    if v.is_string() {
        let cp = v.as_cp();
        let s = heap.string_mut(cp);
        s.refs = s.refs.saturating_sub(1);
        if s.refs == 0 {
            heap.free(cp);
        }
    } else if v.is_number_box() {
        let cp = v.as_cp();
        let n = heap.number_mut(cp);
        n.refs = n.refs.saturating_sub(1);
        if n.refs == 0 {
            heap.free(cp);
        }
    } else if v.is_symbol() {
        let cp = v.as_cp();
        let s = heap.symbol_mut(cp);
        s.refs = s.refs.saturating_sub(1);
        if s.refs == 0 {
            heap.free(cp);
        }
    }
}

// ---------------------------------------------------------------------------
// Numeric conversions (free functions; no heap involved)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferredType {
    Number,
    String,
}

/// ECMA ToInt32: modulo 2^32 into the signed range.
pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() || n == 0.0 {
        return 0;
    }
    let m = n.trunc() % 4_294_967_296.0;
    let m = if m < 0.0 { m + 4_294_967_296.0 } else { m };
    if m >= 2_147_483_648.0 {
        (m - 4_294_967_296.0) as i32
    } else {
        m as i32
    }
}

/// JS number formatting: integral values print without a point, very small
/// and very large magnitudes switch to exponent form the way `Number
/// .prototype.toString` does.
pub fn number_to_js_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".into();
    }
    if n == 0.0 {
        return "0".into();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity".into() } else { "-Infinity".into() };
    }
    let abs = n.abs();
    if abs >= 1e21 {
        return js_exponential(n);
    }
    if n.fract() == 0.0 && abs < 9.007_199_254_740_992e15 {
        return format!("{}", n as i64);
    }
    if abs < 1e-6 {
        return js_exponential(n);
    }
    format!("{n}")
}

fn js_exponential(n: f64) -> String {
    // Rust's {:e} gives "1.5e7" / "1.5e-7"; JS wants an explicit plus sign.
    let s = format!("{n:e}");
    match s.find('e') {
        Some(pos) if s.as_bytes().get(pos + 1) != Some(&b'-') => {
            format!("{}e+{}", &s[..pos], &s[pos + 1..])
        }
        _ => s,
    }
}

/// JS string-to-number: trimmed, empty is zero, hex accepted, anything else
/// that fails the numeric grammar is NaN.
pub fn string_to_number(text: &str) -> f64 {
    let t = text.trim_matches(|c: char| c.is_whitespace() || c == '\u{FEFF}');
    if t.is_empty() {
        return 0.0;
    }
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        return match u64::from_str_radix(hex, 16) {
            Ok(v) => v as f64,
            Err(_) => f64::NAN,
        };
    }
    let (sign, body) = match t.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, t.strip_prefix('+').unwrap_or(t)),
    };
    if body == "Infinity" {
        return sign * f64::INFINITY;
    }
    if !is_decimal_literal(body) {
        return f64::NAN;
    }
    match body.parse::<f64>() {
        Ok(v) => sign * v,
        Err(_) => f64::NAN,
    }
}

/// StrDecimalLiteral: digits [. digits] [exp] | . digits [exp]
fn is_decimal_literal(s: &str) -> bool {
    let b = s.as_bytes();
    let mut i = 0;
    let mut digits = false;
    while i < b.len() && b[i].is_ascii_digit() {
        i += 1;
        digits = true;
    }
    if i < b.len() && b[i] == b'.' {
        i += 1;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
            digits = true;
        }
    }
    if !digits {
        return false;
    }
    if i < b.len() && (b[i] == b'e' || b[i] == b'E') {
        i += 1;
        if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
            i += 1;
        }
        let mut exp_digits = false;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
            exp_digits = true;
        }
        if !exp_digits {
            return false;
        }
    }
    i == b.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_int32_wraps() {
        assert_eq!(to_int32(0.0), 0);
        assert_eq!(to_int32(-0.0), 0);
        assert_eq!(to_int32(f64::NAN), 0);
        assert_eq!(to_int32(f64::INFINITY), 0);
        assert_eq!(to_int32(2_147_483_648.0), -2_147_483_648);
        assert_eq!(to_int32(4_294_967_296.0), 0);
        assert_eq!(to_int32(-1.9), -1);
    }

    #[test]
    fn test_number_to_js_string_edges() {
        assert_eq!(number_to_js_string(f64::NAN), "NaN");
        assert_eq!(number_to_js_string(0.0), "0");
        assert_eq!(number_to_js_string(-0.0), "0");
        assert_eq!(number_to_js_string(f64::INFINITY), "Infinity");
        assert_eq!(number_to_js_string(42.0), "42");
        assert_eq!(number_to_js_string(-7.5), "-7.5");
        assert_eq!(number_to_js_string(1e21), "1e+21");
        assert_eq!(number_to_js_string(1e-7), "1e-7");
    }

    #[test]
    fn test_string_to_number_grammar() {
        assert_eq!(string_to_number(""), 0.0);
        assert_eq!(string_to_number("   "), 0.0);
        assert_eq!(string_to_number("42"), 42.0);
        assert_eq!(string_to_number(" 3.5 "), 3.5);
        assert_eq!(string_to_number("0x10"), 16.0);
        assert_eq!(string_to_number("-Infinity"), f64::NEG_INFINITY);
        assert_eq!(string_to_number("1e3"), 1000.0);
        assert_eq!(string_to_number(".5"), 0.5);
        assert!(string_to_number("12px").is_nan());
        assert!(string_to_number("inf").is_nan());
        assert!(string_to_number("nan").is_nan());
        assert!(string_to_number("1e").is_nan());
    }

    #[test]
    fn test_roundtrip_int_strings() {
        for n in [-2147483647i64, -1, 0, 1, 7, 2147483647] {
            let s = number_to_js_string(n as f64);
            assert_eq!(string_to_number(&s), n as f64);
        }
    }
}
