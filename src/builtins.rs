/// Built-in objects and native dispatch
///
/// Prototypes, constructors and the global object are created at context
/// start; their METHODS are declared in static descriptor tables and only
/// materialised into a real property chain on first access, recorded in the
/// object's instantiated bitset. Native functions are routed through one
/// dispatch table keyed by a 16-bit id; ids with the high bit set name
/// embedder-registered externals.
///
/// Per-built-in algorithms are kept to the integration surface: enough of
/// Object/Array/String/Number/Math/Error to exercise the object model, the
/// generator resume protocol, and the promise reaction queue.

use crate::context::{
    acquire_value, number_to_js_string, release_value, Completion, Context, Job, Thrown,
};
use crate::errors::ErrorClass;
use crate::heap::{Cp, HeapCell};
use crate::object::{
    find_own_prop, BoxedClass, ObjectCell, ObjectKind, PromiseReaction, PromiseState, PropFlags,
    PropName, Property, PropertyDescriptor,
};
use crate::parser::ParseFlags;
use crate::value::Value;
use crate::vm;

// ---------------------------------------------------------------------------
// Singleton registry
// ---------------------------------------------------------------------------

pub const S_OBJECT_PROTO: usize = 0;
pub const S_FUNCTION_PROTO: usize = 1;
pub const S_ARRAY_PROTO: usize = 2;
pub const S_STRING_PROTO: usize = 3;
pub const S_NUMBER_PROTO: usize = 4;
pub const S_BOOLEAN_PROTO: usize = 5;
pub const S_SYMBOL_PROTO: usize = 6;
/// Error prototypes, base class first, then the six derived classes in
/// `ErrorClass` order.
pub const S_ERROR_PROTO: usize = 7;
pub const S_GENERATOR_PROTO: usize = 14;
pub const S_PROMISE_PROTO: usize = 15;
pub const S_MATH: usize = 16;
pub const SINGLETON_COUNT: usize = 17;

pub struct BuiltinRegistry {
    pub singletons: Vec<Cp>,
    /// xorshift state for Math.random.
    rng: u64,
}

impl BuiltinRegistry {
    pub fn new() -> Self {
        BuiltinRegistry { singletons: vec![Cp::NULL; SINGLETON_COUNT], rng: 0x9E3779B97F4A7C15 }
    }

    pub fn object_prototype(&self) -> Cp {
        self.singletons[S_OBJECT_PROTO]
    }

    pub fn function_prototype(&self) -> Cp {
        self.singletons[S_FUNCTION_PROTO]
    }

    pub fn array_prototype(&self) -> Cp {
        self.singletons[S_ARRAY_PROTO]
    }

    pub fn string_prototype(&self) -> Cp {
        self.singletons[S_STRING_PROTO]
    }

    pub fn number_prototype(&self) -> Cp {
        self.singletons[S_NUMBER_PROTO]
    }

    pub fn boolean_prototype(&self) -> Cp {
        self.singletons[S_BOOLEAN_PROTO]
    }

    pub fn symbol_prototype(&self) -> Cp {
        self.singletons[S_SYMBOL_PROTO]
    }

    pub fn generator_prototype(&self) -> Cp {
        self.singletons[S_GENERATOR_PROTO]
    }

    pub fn promise_prototype(&self) -> Cp {
        self.singletons[S_PROMISE_PROTO]
    }

    pub fn error_prototype(&self, class: ErrorClass) -> Cp {
        self.singletons[S_ERROR_PROTO + class as usize]
    }

    fn next_random(&mut self) -> f64 {
        // xorshift64*, folded to [0, 1).
        let mut x = self.rng;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng = x;
        let bits = x.wrapping_mul(0x2545F4914F6CDD1D) >> 11;
        bits as f64 / (1u64 << 53) as f64
    }
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        BuiltinRegistry::new()
    }
}

// ---------------------------------------------------------------------------
// Built-in identities (objects with lazy descriptor tables)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinId {
    Global,
    ObjectProto,
    FunctionProto,
    ArrayProto,
    StringProto,
    NumberProto,
    BooleanProto,
    SymbolProto,
    ErrorProto,
    GeneratorProto,
    PromiseProto,
    Math,
}

// ---------------------------------------------------------------------------
// Native function ids
// ---------------------------------------------------------------------------

const EXTERNAL_BIT: u16 = 0x8000;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Native {
    Print = 0,
    Eval,
    IsNaN,
    IsFinite,
    ParseInt,
    ParseFloat,
    GcCollect,
    FunctionProtoNoOp,
    FunctionCtor,
    ObjectCtor,
    ObjectKeys,
    ObjectCreate,
    ObjectDefineProperty,
    ObjectGetPrototypeOf,
    ObjectSetPrototypeOf,
    ObjectPreventExtensions,
    ObjectProtoToString,
    ObjectProtoValueOf,
    ObjectProtoHasOwnProperty,
    FunctionProtoCall,
    FunctionProtoApply,
    FunctionProtoBind,
    FunctionProtoToString,
    ArrayCtor,
    ArrayIsArray,
    ArrayProtoPush,
    ArrayProtoPop,
    ArrayProtoJoin,
    ArrayProtoIndexOf,
    ArrayProtoSlice,
    ArrayProtoToString,
    StringCtor,
    StringFromCharCode,
    StringProtoCharAt,
    StringProtoCharCodeAt,
    StringProtoIndexOf,
    StringProtoSlice,
    StringProtoToString,
    StringProtoValueOf,
    NumberCtor,
    NumberProtoToString,
    NumberProtoValueOf,
    BooleanCtor,
    BooleanProtoToString,
    BooleanProtoValueOf,
    SymbolCtor,
    SymbolProtoToString,
    MathFloor,
    MathCeil,
    MathRound,
    MathAbs,
    MathMin,
    MathMax,
    MathPow,
    MathSqrt,
    MathRandom,
    ErrorCtorBase,
    ErrorCtorEval,
    ErrorCtorRange,
    ErrorCtorReference,
    ErrorCtorSyntax,
    ErrorCtorType,
    ErrorCtorUri,
    ErrorProtoToString,
    GeneratorProtoNext,
    GeneratorProtoReturn,
    GeneratorProtoThrow,
    PromiseCtor,
    PromiseProtoThen,
    PromiseProtoCatch,
    PromiseResolveStatic,
    PromiseRejectStatic,
    PromiseResolveFn,
    PromiseRejectFn,
}

const MAX_NATIVE: u16 = Native::PromiseRejectFn as u16;

impl Native {
    fn from_u16(v: u16) -> Native {
        debug_assert!(v <= MAX_NATIVE, "invalid native id {v}");
        unsafe { std::mem::transmute(v) }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum NativeId {
    Native(Native),
    External(u16),
}

impl NativeId {
    fn encode(self) -> u16 {
        match self {
            NativeId::Native(n) => n as u16,
            NativeId::External(ix) => EXTERNAL_BIT | ix,
        }
    }
}

// ---------------------------------------------------------------------------
// Lazy descriptor tables
// ---------------------------------------------------------------------------

enum TableEntry {
    Method(Native, u8),
    Number(f64),
    GlobalThis,
    Singleton(usize),
}

struct TableRow {
    name: &'static str,
    entry: TableEntry,
}

macro_rules! method {
    ($name:literal, $native:ident, $arity:literal) => {
        TableRow { name: $name, entry: TableEntry::Method(Native::$native, $arity) }
    };
}

static GLOBAL_TABLE: &[TableRow] = &[
    TableRow { name: "undefined", entry: TableEntry::Number(f64::NAN) }, // replaced below
    TableRow { name: "NaN", entry: TableEntry::Number(f64::NAN) },
    TableRow { name: "Infinity", entry: TableEntry::Number(f64::INFINITY) },
    TableRow { name: "globalThis", entry: TableEntry::GlobalThis },
    TableRow { name: "Math", entry: TableEntry::Singleton(S_MATH) },
    method!("print", Print, 1),
    method!("eval", Eval, 1),
    method!("isNaN", IsNaN, 1),
    method!("isFinite", IsFinite, 1),
    method!("parseInt", ParseInt, 2),
    method!("parseFloat", ParseFloat, 1),
    method!("gc", GcCollect, 0),
];

static OBJECT_PROTO_TABLE: &[TableRow] = &[
    method!("toString", ObjectProtoToString, 0),
    method!("valueOf", ObjectProtoValueOf, 0),
    method!("hasOwnProperty", ObjectProtoHasOwnProperty, 1),
];

static FUNCTION_PROTO_TABLE: &[TableRow] = &[
    method!("call", FunctionProtoCall, 1),
    method!("apply", FunctionProtoApply, 2),
    method!("bind", FunctionProtoBind, 1),
    method!("toString", FunctionProtoToString, 0),
];

static ARRAY_PROTO_TABLE: &[TableRow] = &[
    method!("push", ArrayProtoPush, 1),
    method!("pop", ArrayProtoPop, 0),
    method!("join", ArrayProtoJoin, 1),
    method!("indexOf", ArrayProtoIndexOf, 1),
    method!("slice", ArrayProtoSlice, 2),
    method!("toString", ArrayProtoToString, 0),
];

static STRING_PROTO_TABLE: &[TableRow] = &[
    method!("charAt", StringProtoCharAt, 1),
    method!("charCodeAt", StringProtoCharCodeAt, 1),
    method!("indexOf", StringProtoIndexOf, 1),
    method!("slice", StringProtoSlice, 2),
    method!("toString", StringProtoToString, 0),
    method!("valueOf", StringProtoValueOf, 0),
];

static NUMBER_PROTO_TABLE: &[TableRow] = &[
    method!("toString", NumberProtoToString, 1),
    method!("valueOf", NumberProtoValueOf, 0),
];

static BOOLEAN_PROTO_TABLE: &[TableRow] = &[
    method!("toString", BooleanProtoToString, 0),
    method!("valueOf", BooleanProtoValueOf, 0),
];

static SYMBOL_PROTO_TABLE: &[TableRow] = &[method!("toString", SymbolProtoToString, 0)];

static ERROR_PROTO_TABLE: &[TableRow] = &[method!("toString", ErrorProtoToString, 0)];

static GENERATOR_PROTO_TABLE: &[TableRow] = &[
    method!("next", GeneratorProtoNext, 1),
    method!("return", GeneratorProtoReturn, 1),
    method!("throw", GeneratorProtoThrow, 1),
];

static PROMISE_PROTO_TABLE: &[TableRow] = &[
    method!("then", PromiseProtoThen, 2),
    method!("catch", PromiseProtoCatch, 1),
];

static MATH_TABLE: &[TableRow] = &[
    TableRow { name: "PI", entry: TableEntry::Number(std::f64::consts::PI) },
    TableRow { name: "E", entry: TableEntry::Number(std::f64::consts::E) },
    method!("floor", MathFloor, 1),
    method!("ceil", MathCeil, 1),
    method!("round", MathRound, 1),
    method!("abs", MathAbs, 1),
    method!("min", MathMin, 2),
    method!("max", MathMax, 2),
    method!("pow", MathPow, 2),
    method!("sqrt", MathSqrt, 1),
    method!("random", MathRandom, 0),
];

fn table_for(id: BuiltinId) -> &'static [TableRow] {
    match id {
        BuiltinId::Global => GLOBAL_TABLE,
        BuiltinId::ObjectProto => OBJECT_PROTO_TABLE,
        BuiltinId::FunctionProto => FUNCTION_PROTO_TABLE,
        BuiltinId::ArrayProto => ARRAY_PROTO_TABLE,
        BuiltinId::StringProto => STRING_PROTO_TABLE,
        BuiltinId::NumberProto => NUMBER_PROTO_TABLE,
        BuiltinId::BooleanProto => BOOLEAN_PROTO_TABLE,
        BuiltinId::SymbolProto => SYMBOL_PROTO_TABLE,
        BuiltinId::ErrorProto => ERROR_PROTO_TABLE,
        BuiltinId::GeneratorProto => GENERATOR_PROTO_TABLE,
        BuiltinId::PromiseProto => PROMISE_PROTO_TABLE,
        BuiltinId::Math => MATH_TABLE,
    }
}

/// Materialise a built-in property on first access: look the name up in the
/// object's descriptor table, create the real property, and record the row
/// in the instantiated bitset so deletion sticks.
pub fn instantiate_lazy(
    ctx: &mut Context,
    obj: Cp,
    name: PropName,
) -> Completion<Option<Property>> {
    if matches!(name, PropName::Symbol(_)) {
        return Ok(None);
    }
    let Some(id) = ctx.heap_ref().object(obj).builtin else { return Ok(None) };
    let table = table_for(id);
    let text = ctx.prop_name_text(name);
    let Some(row_ix) = table.iter().position(|r| r.name == text) else {
        return Ok(None);
    };
    if ctx.heap_ref().object(obj).instantiated & (1 << row_ix) != 0 {
        // Materialised earlier and since deleted by script.
        return Ok(None);
    }
    let row = &table[row_ix];
    let (value, flags) = match &row.entry {
        TableEntry::Method(native, arity) => {
            let f = make_native_function(ctx, NativeId::Native(*native), row.name, *arity, false)?;
            (f, PropFlags::builtin_default())
        }
        TableEntry::Number(n) => {
            let n = if id == BuiltinId::Global && row.name == "undefined" {
                // The table stores a number slot; the binding is undefined.
                return finish_row(ctx, obj, row_ix, row.name, Value::UNDEFINED, PropFlags::none());
            } else {
                *n
            };
            (ctx.number_value(n)?, PropFlags::none())
        }
        TableEntry::GlobalThis => {
            (Value::object(ctx.global), PropFlags::builtin_default())
        }
        TableEntry::Singleton(ix) => {
            (Value::object(ctx.builtins.singletons[*ix]), PropFlags::builtin_default())
        }
    };
    finish_row(ctx, obj, row_ix, row.name, value, flags)
}

fn finish_row(
    ctx: &mut Context,
    obj: Cp,
    row_ix: usize,
    name: &str,
    value: Value,
    flags: PropFlags,
) -> Completion<Option<Property>> {
    ctx.heap_mut().object_mut(obj).instantiated |= 1 << row_ix;
    let pname = ctx.prop_name_from_str(name);
    let pname = ctx.own_name_copy(pname)?;
    let flags = flags.set(PropFlags::VIRTUAL, true);
    let prop = Property::data_prop(pname, value, flags);
    ctx.add_own_property(obj, prop)?;
    Ok(Some(prop))
}

// ---------------------------------------------------------------------------
// Construction helpers
// ---------------------------------------------------------------------------

pub fn make_native_function(
    ctx: &mut Context,
    id: NativeId,
    name: &str,
    arity: u8,
    construct: bool,
) -> Completion<Value> {
    let proto = ctx.builtins.function_prototype();
    let cell = ObjectCell::with_kind(
        proto,
        ObjectKind::NativeFunction { id: id.encode(), construct, payload: Cp::NULL },
    );
    let cp = ctx.new_object_cell(cell)?;
    ctx.scratch_push(Value::object(cp));
    let result = (|| {
        let name_v = ctx.new_string_value(name)?;
        let pn = ctx.prop_name_from_str("name");
        let pn = ctx.own_name_copy(pn)?;
        ctx.add_own_property(
            cp,
            Property::data_prop(pn, name_v, PropFlags::from_bits(PropFlags::CONFIGURABLE)),
        )?;
        let pl = ctx.prop_name_from_str("length");
        let pl = ctx.own_name_copy(pl)?;
        ctx.add_own_property(
            cp,
            Property::data_prop(
                pl,
                Value::small_int(arity as i32),
                PropFlags::from_bits(PropFlags::CONFIGURABLE),
            ),
        )?;
        Ok(())
    })();
    ctx.scratch_pop(1);
    result?;
    Ok(Value::object(cp))
}

fn make_capsule_function(ctx: &mut Context, native: Native, payload: Cp) -> Completion<Value> {
    let proto = ctx.builtins.function_prototype();
    let cell = ObjectCell::with_kind(
        proto,
        ObjectKind::NativeFunction { id: native as u16, construct: false, payload },
    );
    let cp = ctx.new_object_cell(cell)?;
    Ok(Value::object(cp))
}

pub fn create_error(ctx: &mut Context, class: ErrorClass, message: &str) -> Completion {
    let proto = ctx.builtins.error_prototype(class);
    let cell = ObjectCell::with_kind(proto, ObjectKind::ErrorObject { class });
    let cp = ctx.new_object_cell(cell)?;
    if !message.is_empty() {
        ctx.scratch_push(Value::object(cp));
        let result = (|| {
            let msg = ctx.new_string_value(message)?;
            let name = ctx.prop_name_from_str("message");
            let name = ctx.own_name_copy(name)?;
            ctx.add_own_property(
                cp,
                Property::data_prop(name, msg, PropFlags::builtin_default()),
            )
        })();
        ctx.scratch_pop(1);
        result?;
    }
    Ok(Value::object(cp))
}

// ---------------------------------------------------------------------------
// Context bring-up
// ---------------------------------------------------------------------------

pub fn initialize(ctx: &mut Context) {
    try_initialize(ctx).unwrap_or_else(|_| panic!("heap too small for built-in objects"))
}

fn try_initialize(ctx: &mut Context) -> Completion<()> {
    // Prototype chain roots.
    let object_proto = ctx.new_object_cell(ObjectCell {
        proto: Cp::NULL,
        extensible: true,
        builtin: Some(BuiltinId::ObjectProto),
        instantiated: 0,
        props: Cp::NULL,
        kind: ObjectKind::General,
    })?;
    ctx.builtins.singletons[S_OBJECT_PROTO] = object_proto;

    // Function.prototype is itself callable.
    let function_proto = ctx.new_object_cell(ObjectCell {
        proto: object_proto,
        extensible: true,
        builtin: Some(BuiltinId::FunctionProto),
        instantiated: 0,
        props: Cp::NULL,
        kind: ObjectKind::NativeFunction {
            id: Native::FunctionProtoNoOp as u16,
            construct: false,
            payload: Cp::NULL,
        },
    })?;
    ctx.builtins.singletons[S_FUNCTION_PROTO] = function_proto;

    let simple_proto = |ctx: &mut Context, id: BuiltinId, kind: ObjectKind| {
        ctx.new_object_cell(ObjectCell {
            proto: object_proto,
            extensible: true,
            builtin: Some(id),
            instantiated: 0,
            props: Cp::NULL,
            kind,
        })
    };

    let array_proto =
        simple_proto(ctx, BuiltinId::ArrayProto, ObjectKind::Array { elements: Vec::new() })?;
    ctx.builtins.singletons[S_ARRAY_PROTO] = array_proto;
    let string_proto = simple_proto(ctx, BuiltinId::StringProto, ObjectKind::General)?;
    ctx.builtins.singletons[S_STRING_PROTO] = string_proto;
    let number_proto = simple_proto(ctx, BuiltinId::NumberProto, ObjectKind::General)?;
    ctx.builtins.singletons[S_NUMBER_PROTO] = number_proto;
    let boolean_proto = simple_proto(ctx, BuiltinId::BooleanProto, ObjectKind::General)?;
    ctx.builtins.singletons[S_BOOLEAN_PROTO] = boolean_proto;
    let symbol_proto = simple_proto(ctx, BuiltinId::SymbolProto, ObjectKind::General)?;
    ctx.builtins.singletons[S_SYMBOL_PROTO] = symbol_proto;
    let generator_proto = simple_proto(ctx, BuiltinId::GeneratorProto, ObjectKind::General)?;
    ctx.builtins.singletons[S_GENERATOR_PROTO] = generator_proto;
    let promise_proto = simple_proto(ctx, BuiltinId::PromiseProto, ObjectKind::General)?;
    ctx.builtins.singletons[S_PROMISE_PROTO] = promise_proto;
    let math = simple_proto(ctx, BuiltinId::Math, ObjectKind::General)?;
    ctx.builtins.singletons[S_MATH] = math;

    // Error prototypes: the base, then one derived per class.
    let error_proto = simple_proto(ctx, BuiltinId::ErrorProto, ObjectKind::General)?;
    ctx.builtins.singletons[S_ERROR_PROTO] = error_proto;
    set_str_prop(ctx, error_proto, "name", "Error", PropFlags::builtin_default())?;
    set_str_prop(ctx, error_proto, "message", "", PropFlags::builtin_default())?;
    for class in [
        ErrorClass::EvalError,
        ErrorClass::RangeError,
        ErrorClass::ReferenceError,
        ErrorClass::SyntaxError,
        ErrorClass::TypeError,
        ErrorClass::UriError,
    ] {
        let derived = ctx.new_object_cell(ObjectCell {
            proto: error_proto,
            extensible: true,
            builtin: None,
            instantiated: 0,
            props: Cp::NULL,
            kind: ObjectKind::General,
        })?;
        set_str_prop(ctx, derived, "name", class.name(), PropFlags::builtin_default())?;
        ctx.builtins.singletons[S_ERROR_PROTO + class as usize] = derived;
    }

    // The global object.
    let global = ctx.new_object_cell(ObjectCell {
        proto: object_proto,
        extensible: true,
        builtin: Some(BuiltinId::Global),
        instantiated: 0,
        props: Cp::NULL,
        kind: ObjectKind::General,
    })?;
    ctx.global = global;

    // Constructors are created eagerly and wired to their prototypes.
    let ctor = |ctx: &mut Context, name: &str, native: Native, proto: Cp, arity: u8| -> Completion<()> {
        let f = make_native_function(ctx, NativeId::Native(native), name, arity, true)?;
        let f_cp = f.as_cp();
        ctx.scratch_push(f);
        let result = (|| {
            let pn = ctx.prop_name_from_str("prototype");
            let pn = ctx.own_name_copy(pn)?;
            ctx.add_own_property(
                f_cp,
                Property::data_prop(pn, Value::object(proto), PropFlags::none()),
            )?;
            let cn = ctx.prop_name_from_str("constructor");
            let cn = ctx.own_name_copy(cn)?;
            ctx.add_own_property(
                proto,
                Property::data_prop(cn, f, PropFlags::builtin_default()),
            )?;
            let gn = ctx.prop_name_from_str(name);
            let gn = ctx.own_name_copy(gn)?;
            ctx.add_own_property(
                global,
                Property::data_prop(gn, f, PropFlags::builtin_default()),
            )
        })();
        ctx.scratch_pop(1);
        result
    };

    ctor(ctx, "Object", Native::ObjectCtor, object_proto, 1)?;
    ctor(ctx, "Function", Native::FunctionCtor, function_proto, 1)?;
    ctor(ctx, "Array", Native::ArrayCtor, array_proto, 1)?;
    ctor(ctx, "String", Native::StringCtor, string_proto, 1)?;
    ctor(ctx, "Number", Native::NumberCtor, number_proto, 1)?;
    ctor(ctx, "Boolean", Native::BooleanCtor, boolean_proto, 1)?;
    ctor(ctx, "Symbol", Native::SymbolCtor, symbol_proto, 0)?;
    ctor(ctx, "Promise", Native::PromiseCtor, promise_proto, 1)?;
    ctor(ctx, "Error", Native::ErrorCtorBase, error_proto, 1)?;
    for (name, native, class) in [
        ("EvalError", Native::ErrorCtorEval, ErrorClass::EvalError),
        ("RangeError", Native::ErrorCtorRange, ErrorClass::RangeError),
        ("ReferenceError", Native::ErrorCtorReference, ErrorClass::ReferenceError),
        ("SyntaxError", Native::ErrorCtorSyntax, ErrorClass::SyntaxError),
        ("TypeError", Native::ErrorCtorType, ErrorClass::TypeError),
        ("URIError", Native::ErrorCtorUri, ErrorClass::UriError),
    ] {
        let proto = ctx.builtins.error_prototype(class);
        ctor(ctx, name, native, proto, 1)?;
    }

    // Constructor statics.
    let object_ctor = get_global_fn(ctx, "Object")?;
    add_static(ctx, object_ctor, "keys", Native::ObjectKeys, 1)?;
    add_static(ctx, object_ctor, "create", Native::ObjectCreate, 2)?;
    add_static(ctx, object_ctor, "defineProperty", Native::ObjectDefineProperty, 3)?;
    add_static(ctx, object_ctor, "getPrototypeOf", Native::ObjectGetPrototypeOf, 1)?;
    add_static(ctx, object_ctor, "setPrototypeOf", Native::ObjectSetPrototypeOf, 2)?;
    add_static(ctx, object_ctor, "preventExtensions", Native::ObjectPreventExtensions, 1)?;
    let array_ctor = get_global_fn(ctx, "Array")?;
    add_static(ctx, array_ctor, "isArray", Native::ArrayIsArray, 1)?;
    let string_ctor = get_global_fn(ctx, "String")?;
    add_static(ctx, string_ctor, "fromCharCode", Native::StringFromCharCode, 1)?;
    let promise_ctor = get_global_fn(ctx, "Promise")?;
    add_static(ctx, promise_ctor, "resolve", Native::PromiseResolveStatic, 1)?;
    add_static(ctx, promise_ctor, "reject", Native::PromiseRejectStatic, 1)?;
    Ok(())
}

fn get_global_fn(ctx: &mut Context, name: &str) -> Completion<Cp> {
    let global = ctx.global;
    let pname = ctx.prop_name_from_str(name);
    let (pair, slot) = find_own_prop(ctx.heap_ref(), global, pname)
        .unwrap_or_else(|| unreachable!("missing global constructor {name}"));
    Ok(ctx.heap_ref().pair(pair).slots[slot].unwrap_or_else(|| unreachable!()).value().as_cp())
}

fn add_static(
    ctx: &mut Context,
    obj: Cp,
    name: &str,
    native: Native,
    arity: u8,
) -> Completion<()> {
    let f = make_native_function(ctx, NativeId::Native(native), name, arity, false)?;
    ctx.scratch_push(f);
    let result = (|| {
        let pn = ctx.prop_name_from_str(name);
        let pn = ctx.own_name_copy(pn)?;
        ctx.add_own_property(obj, Property::data_prop(pn, f, PropFlags::builtin_default()))
    })();
    ctx.scratch_pop(1);
    result
}

fn set_str_prop(
    ctx: &mut Context,
    obj: Cp,
    name: &str,
    value: &str,
    flags: PropFlags,
) -> Completion<()> {
    let v = ctx.new_string_value(value)?;
    ctx.scratch_push(v);
    let result = (|| {
        let pn = ctx.prop_name_from_str(name);
        let pn = ctx.own_name_copy(pn)?;
        ctx.add_own_property(obj, Property::data_prop(pn, v, flags))
    })();
    ctx.scratch_pop(1);
    result
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub fn dispatch(
    ctx: &mut Context,
    id: u16,
    func: Cp,
    this: Value,
    args: &[Value],
) -> Completion {
    if id & EXTERNAL_BIT != 0 {
        let ix = (id & !EXTERNAL_BIT) as usize;
        let f = std::rc::Rc::clone(&ctx.externals[ix]);
        return f(ctx, this, args);
    }
    let arg = |i: usize| args.get(i).copied().unwrap_or(Value::UNDEFINED);

    match Native::from_u16(id) {
        Native::FunctionProtoNoOp => Ok(Value::UNDEFINED),
        Native::FunctionCtor => {
            ctx.throw_type_error("the Function constructor is not supported")
        }
        Native::Print => {
            let mut parts = Vec::with_capacity(args.len());
            for &a in args {
                parts.push(ctx.to_display_string(a)?);
            }
            println!("{}", parts.join(" "));
            Ok(Value::UNDEFINED)
        }
        Native::Eval => {
            let src = arg(0);
            if !src.is_string() {
                acquire_value(ctx.heap_mut(), src);
                return Ok(src);
            }
            let text = ctx.heap_ref().string(src.as_cp()).flatten().into_owned();
            let flags = ParseFlags { strict: false, eval: true };
            let code = match ctx.parse(&text, flags) {
                Ok(code) => code,
                Err(e) => {
                    return Err(ctx.throw(ErrorClass::SyntaxError, &e.to_string()));
                }
            };
            let global_this = Value::object(ctx.global);
            vm::run_code(ctx, code, global_this, &[])
        }
        Native::IsNaN => {
            let n = ctx.to_number(arg(0))?;
            Ok(Value::boolean(n.is_nan()))
        }
        Native::IsFinite => {
            let n = ctx.to_number(arg(0))?;
            Ok(Value::boolean(n.is_finite()))
        }
        Native::ParseInt => {
            let text = ctx.to_display_string(arg(0))?;
            let radix = if arg(1).is_undefined() { 0 } else { ctx.to_int32(arg(1))? };
            Ok(parse_int(ctx, &text, radix)?)
        }
        Native::ParseFloat => {
            let text = ctx.to_display_string(arg(0))?;
            let trimmed = text.trim_start();
            // Longest numeric prefix.
            let mut end = trimmed.len();
            while end > 0 {
                if trimmed[..end].parse::<f64>().is_ok() {
                    break;
                }
                end -= 1;
            }
            let n = if end == 0 { f64::NAN } else { trimmed[..end].parse().unwrap_or(f64::NAN) };
            ctx.number_value(n)
        }
        Native::GcCollect => {
            let swept = ctx.collect_garbage();
            Ok(Value::small_int(swept as i32))
        }

        // ── Object ───────────────────────────────────────────────────────
        Native::ObjectCtor => {
            let v = arg(0);
            if v.is_object() {
                acquire_value(ctx.heap_mut(), v);
                return Ok(v);
            }
            if v.is_nullish() {
                return ctx.new_object();
            }
            ctx.to_object(v)
        }
        Native::ObjectKeys => {
            let v = arg(0);
            if !v.is_object() {
                return ctx.throw_type_error("Object.keys called on a non-object");
            }
            let keys = ctx.own_keys(v.as_cp())?;
            let mut out = Vec::with_capacity(keys.len());
            for k in keys {
                let text = ctx.prop_name_text(k);
                let s = ctx.new_string_value(&text)?;
                ctx.scratch_push(s);
                out.push(s);
            }
            ctx.scratch_pop(out.len());
            ctx.new_array(out)
        }
        Native::ObjectCreate => {
            let proto = arg(0);
            let proto_cp = if proto.is_null() {
                Cp::NULL
            } else if proto.is_object() {
                proto.as_cp()
            } else {
                return ctx.throw_type_error("prototype must be an object or null");
            };
            let cp = ctx.new_object_cell(ObjectCell::ordinary(proto_cp))?;
            Ok(Value::object(cp))
        }
        Native::ObjectDefineProperty => {
            let target = arg(0);
            if !target.is_object() {
                return ctx.throw_type_error("Object.defineProperty called on a non-object");
            }
            let name = ctx.to_property_name(arg(1))?;
            let desc = to_property_descriptor(ctx, arg(2))?;
            let ok = ctx.define_own_property(target.as_cp(), name, desc);
            if let Some(v) = desc.value {
                release_value(ctx.heap_mut(), v);
            }
            if !ok? {
                return ctx.throw_type_error("cannot define property");
            }
            acquire_value(ctx.heap_mut(), target);
            Ok(target)
        }
        Native::ObjectGetPrototypeOf => {
            let v = arg(0);
            if !v.is_object() {
                return ctx.throw_type_error("Object.getPrototypeOf called on a non-object");
            }
            Ok(ctx.get_prototype(v.as_cp()))
        }
        Native::ObjectSetPrototypeOf => {
            let v = arg(0);
            if !v.is_object() {
                return ctx.throw_type_error("Object.setPrototypeOf called on a non-object");
            }
            if !ctx.set_prototype(v.as_cp(), arg(1))? {
                return ctx.throw_type_error("cannot set prototype");
            }
            acquire_value(ctx.heap_mut(), v);
            Ok(v)
        }
        Native::ObjectPreventExtensions => {
            let v = arg(0);
            if v.is_object() {
                ctx.heap_mut().object_mut(v.as_cp()).extensible = false;
            }
            acquire_value(ctx.heap_mut(), v);
            Ok(v)
        }
        Native::ObjectProtoToString => {
            let tag = if this.is_undefined() {
                "Undefined"
            } else if this.is_null() {
                "Null"
            } else if this.is_object() {
                match &ctx.heap_ref().object(this.as_cp()).kind {
                    ObjectKind::Array { .. } => "Array",
                    k if k.is_callable() => "Function",
                    ObjectKind::ErrorObject { .. } => "Error",
                    ObjectKind::Boxed { class, .. } => class.name(),
                    _ => "Object",
                }
            } else if this.is_number() {
                "Number"
            } else if this.is_string() {
                "String"
            } else if this.is_boolean() {
                "Boolean"
            } else {
                "Object"
            };
            ctx.new_string_value(&format!("[object {tag}]"))
        }
        Native::ObjectProtoValueOf => ctx.to_object(this),
        Native::ObjectProtoHasOwnProperty => {
            let name = ctx.to_property_name(arg(0))?;
            if !this.is_object() {
                return Ok(Value::FALSE);
            }
            let found = ctx.get_own_property(this.as_cp(), name)?.is_some();
            Ok(Value::boolean(found))
        }

        // ── Function ─────────────────────────────────────────────────────
        Native::FunctionProtoCall => {
            let call_this = arg(0);
            let rest: Vec<Value> = args.iter().skip(1).copied().collect();
            vm::call_value(ctx, this, call_this, &rest)
        }
        Native::FunctionProtoApply => {
            let call_this = arg(0);
            let list = arg(1);
            let call_args: Option<Vec<Value>> = if list.is_nullish() {
                Some(Vec::new())
            } else if list.is_object() {
                match &ctx.heap_ref().object(list.as_cp()).kind {
                    ObjectKind::Array { elements } => Some(
                        elements
                            .iter()
                            .map(|v| if v.is_empty() { Value::UNDEFINED } else { *v })
                            .collect(),
                    ),
                    _ => None,
                }
            } else {
                None
            };
            let Some(call_args) = call_args else {
                return ctx.throw_type_error("apply expects an array of arguments");
            };
            vm::call_value(ctx, this, call_this, &call_args)
        }
        Native::FunctionProtoBind => {
            if !this.is_object() || !ctx.heap_ref().object(this.as_cp()).is_callable() {
                return ctx.throw_type_error("bind target is not callable");
            }
            let bound_this = arg(0);
            acquire_value(ctx.heap_mut(), bound_this);
            let bound_args: Vec<Value> = args.iter().skip(1).copied().collect();
            for &a in &bound_args {
                acquire_value(ctx.heap_mut(), a);
            }
            let proto = ctx.builtins.function_prototype();
            let cell = ObjectCell::with_kind(
                proto,
                ObjectKind::BoundFunction { target: this.as_cp(), bound_this, bound_args },
            );
            let cp = ctx.new_object_cell(cell)?;
            Ok(Value::object(cp))
        }
        Native::FunctionProtoToString => {
            let name = ctx
                .get_value_property_str(this, "name")
                .ok()
                .filter(|v| v.is_string())
                .map(|v| ctx.heap_ref().string(v.as_cp()).flatten().into_owned())
                .unwrap_or_default();
            ctx.new_string_value(&format!("function {name}() {{ [native code] }}"))
        }

        // ── Array ────────────────────────────────────────────────────────
        Native::ArrayCtor => array_ctor(ctx, args),
        Native::ArrayIsArray => {
            let v = arg(0);
            let is = v.is_object()
                && matches!(ctx.heap_ref().object(v.as_cp()).kind, ObjectKind::Array { .. });
            Ok(Value::boolean(is))
        }
        Native::ArrayProtoPush => {
            let arr = require_array(ctx, this)?;
            for &a in args {
                let len = array_len(ctx, arr);
                acquire_value(ctx.heap_mut(), a);
                ctx.set_value_property(this, PropName::Index(len), a, false)?;
            }
            Ok(Value::small_int(array_len(ctx, arr) as i32))
        }
        Native::ArrayProtoPop => {
            let arr = require_array(ctx, this)?;
            let len = array_len(ctx, arr);
            if len == 0 {
                return Ok(Value::UNDEFINED);
            }
            let last = match &mut ctx.heap_mut().object_mut(arr).kind {
                ObjectKind::Array { elements } => elements.pop().unwrap_or(Value::UNDEFINED),
                _ => Value::UNDEFINED,
            };
            let _ = ctx.heap_mut().try_recharge(arr);
            Ok(if last.is_empty() { Value::UNDEFINED } else { last })
        }
        Native::ArrayProtoJoin | Native::ArrayProtoToString => {
            let arr = require_array(ctx, this)?;
            let sep = if arg(0).is_undefined() || Native::from_u16(id) == Native::ArrayProtoToString
            {
                ",".to_string()
            } else {
                ctx.to_display_string(arg(0))?
            };
            let len = array_len(ctx, arr);
            let mut out = String::new();
            for i in 0..len {
                if i > 0 {
                    out.push_str(&sep);
                }
                let v = ctx.get_value_property(this, PropName::Index(i))?;
                if !v.is_nullish() {
                    out.push_str(&ctx.to_display_string(v)?);
                }
                release_value(ctx.heap_mut(), v);
            }
            ctx.new_string_value(&out)
        }
        Native::ArrayProtoIndexOf => {
            let arr = require_array(ctx, this)?;
            let needle = arg(0);
            let len = array_len(ctx, arr);
            for i in 0..len {
                let v = ctx.get_value_property(this, PropName::Index(i))?;
                let eq = ctx.strict_equals(v, needle);
                release_value(ctx.heap_mut(), v);
                if eq {
                    return Ok(Value::small_int(i as i32));
                }
            }
            Ok(Value::small_int(-1))
        }
        Native::ArrayProtoSlice => {
            let arr = require_array(ctx, this)?;
            let len = array_len(ctx, arr) as i64;
            let start = slice_index(ctx, arg(0), 0, len)?;
            let end = slice_index(ctx, arg(1), len, len)?;
            let mut out = Vec::new();
            let mut i = start;
            while i < end {
                let v = ctx.get_value_property(this, PropName::Index(i as u32))?;
                ctx.scratch_push(v);
                out.push(v);
                i += 1;
            }
            ctx.scratch_pop(out.len());
            ctx.new_array(out)
        }

        // ── String ───────────────────────────────────────────────────────
        Native::StringCtor => {
            let text = if args.is_empty() {
                String::new()
            } else {
                ctx.to_display_string(arg(0))?
            };
            ctx.new_string_value(&text)
        }
        Native::StringFromCharCode => {
            let mut units = Vec::with_capacity(args.len());
            for &a in args {
                units.push(ctx.to_uint32(a)? as u16);
            }
            ctx.new_string_value(&String::from_utf16_lossy(&units))
        }
        Native::StringProtoCharAt => {
            let text = this_string(ctx, this)?;
            let ix = ctx.to_int32(arg(0))?;
            let units: Vec<u16> = text.encode_utf16().collect();
            if ix < 0 || ix as usize >= units.len() {
                return ctx.new_string_value("");
            }
            ctx.new_string_value(&String::from_utf16_lossy(&units[ix as usize..ix as usize + 1]))
        }
        Native::StringProtoCharCodeAt => {
            let text = this_string(ctx, this)?;
            let ix = ctx.to_int32(arg(0))?;
            let units: Vec<u16> = text.encode_utf16().collect();
            match units.get(ix.max(0) as usize) {
                Some(&u) if ix >= 0 => ctx.number_value(u as f64),
                _ => ctx.number_value(f64::NAN),
            }
        }
        Native::StringProtoIndexOf => {
            let text = this_string(ctx, this)?;
            let needle = ctx.to_display_string(arg(0))?;
            // Report the index in UTF-16 code units.
            match text.find(&needle) {
                Some(byte_ix) => {
                    let units = text[..byte_ix].encode_utf16().count();
                    Ok(Value::small_int(units as i32))
                }
                None => Ok(Value::small_int(-1)),
            }
        }
        Native::StringProtoSlice => {
            let text = this_string(ctx, this)?;
            let units: Vec<u16> = text.encode_utf16().collect();
            let len = units.len() as i64;
            let start = slice_index(ctx, arg(0), 0, len)?;
            let end = slice_index(ctx, arg(1), len, len)?;
            if start >= end {
                return ctx.new_string_value("");
            }
            ctx.new_string_value(&String::from_utf16_lossy(&units[start as usize..end as usize]))
        }
        Native::StringProtoToString | Native::StringProtoValueOf => {
            let text = this_string(ctx, this)?;
            ctx.new_string_value(&text)
        }

        // ── Number / Boolean / Symbol ────────────────────────────────────
        Native::NumberCtor => {
            let n = if args.is_empty() { 0.0 } else { ctx.to_number(arg(0))? };
            ctx.number_value(n)
        }
        Native::NumberProtoToString => {
            let n = this_number(ctx, this)?;
            let radix = if arg(0).is_undefined() { 10 } else { ctx.to_int32(arg(0))? };
            if radix == 10 {
                return ctx.new_string_value(&number_to_js_string(n));
            }
            if !(2..=36).contains(&radix) {
                return ctx.throw_range_error("toString() radix must be between 2 and 36");
            }
            ctx.new_string_value(&format_radix(n, radix as u32))
        }
        Native::NumberProtoValueOf => {
            let n = this_number(ctx, this)?;
            ctx.number_value(n)
        }
        Native::BooleanCtor => Ok(Value::boolean(ctx.to_boolean(arg(0)))),
        Native::BooleanProtoToString => {
            let b = this_boolean(ctx, this)?;
            ctx.new_string_value(if b { "true" } else { "false" })
        }
        Native::BooleanProtoValueOf => {
            let b = this_boolean(ctx, this)?;
            Ok(Value::boolean(b))
        }
        Native::SymbolCtor => {
            let desc = if arg(0).is_undefined() {
                None
            } else {
                Some(ctx.to_display_string(arg(0))?)
            };
            ctx.new_symbol(desc.as_deref())
        }
        Native::SymbolProtoToString => {
            if !this.is_symbol() {
                return ctx.throw_type_error("Symbol.prototype.toString requires a symbol");
            }
            let text = ctx.prop_name_text(PropName::Symbol(this.as_cp()));
            ctx.new_string_value(&text)
        }

        // ── Math ─────────────────────────────────────────────────────────
        Native::MathFloor => math1(ctx, arg(0), f64::floor),
        Native::MathCeil => math1(ctx, arg(0), f64::ceil),
        Native::MathRound => math1(ctx, arg(0), |n| (n + 0.5).floor()),
        Native::MathAbs => math1(ctx, arg(0), f64::abs),
        Native::MathSqrt => math1(ctx, arg(0), f64::sqrt),
        Native::MathPow => {
            let a = ctx.to_number(arg(0))?;
            let b = ctx.to_number(arg(1))?;
            ctx.number_value(a.powf(b))
        }
        Native::MathMin | Native::MathMax => {
            let is_min = Native::from_u16(id) == Native::MathMin;
            let mut best = if is_min { f64::INFINITY } else { f64::NEG_INFINITY };
            for &a in args {
                let n = ctx.to_number(a)?;
                if n.is_nan() {
                    return ctx.number_value(f64::NAN);
                }
                if (is_min && n < best) || (!is_min && n > best) {
                    best = n;
                }
            }
            ctx.number_value(best)
        }
        Native::MathRandom => {
            let r = ctx.builtins.next_random();
            ctx.number_value(r)
        }

        // ── Errors ───────────────────────────────────────────────────────
        Native::ErrorCtorBase
        | Native::ErrorCtorEval
        | Native::ErrorCtorRange
        | Native::ErrorCtorReference
        | Native::ErrorCtorSyntax
        | Native::ErrorCtorType
        | Native::ErrorCtorUri => {
            let class = match Native::from_u16(id) {
                Native::ErrorCtorEval => ErrorClass::EvalError,
                Native::ErrorCtorRange => ErrorClass::RangeError,
                Native::ErrorCtorReference => ErrorClass::ReferenceError,
                Native::ErrorCtorSyntax => ErrorClass::SyntaxError,
                Native::ErrorCtorType => ErrorClass::TypeError,
                Native::ErrorCtorUri => ErrorClass::UriError,
                _ => ErrorClass::Error,
            };
            let message = if arg(0).is_undefined() {
                String::new()
            } else {
                ctx.to_display_string(arg(0))?
            };
            create_error(ctx, class, &message)
        }
        Native::ErrorProtoToString => {
            let name = ctx.get_value_property_str(this, "name")?;
            let name_s = if name.is_undefined() {
                "Error".to_string()
            } else {
                ctx.to_display_string(name)?
            };
            release_value(ctx.heap_mut(), name);
            let msg = ctx.get_value_property_str(this, "message")?;
            let msg_s =
                if msg.is_undefined() { String::new() } else { ctx.to_display_string(msg)? };
            release_value(ctx.heap_mut(), msg);
            if msg_s.is_empty() {
                ctx.new_string_value(&name_s)
            } else {
                ctx.new_string_value(&format!("{name_s}: {msg_s}"))
            }
        }

        // ── Generators ───────────────────────────────────────────────────
        Native::GeneratorProtoNext => {
            let gen = require_generator(ctx, this)?;
            let (value, done) = vm::resume_generator(ctx, gen, arg(0), false)?;
            iter_result(ctx, value, done)
        }
        Native::GeneratorProtoReturn => {
            let gen = require_generator(ctx, this)?;
            finish_generator_obj(ctx, gen);
            let v = arg(0);
            acquire_value(ctx.heap_mut(), v);
            iter_result(ctx, v, true)
        }
        Native::GeneratorProtoThrow => {
            let gen = require_generator(ctx, this)?;
            let (value, done) = vm::resume_generator(ctx, gen, arg(0), true)?;
            iter_result(ctx, value, done)
        }

        // ── Promises ─────────────────────────────────────────────────────
        Native::PromiseCtor => promise_ctor(ctx, arg(0)),
        Native::PromiseProtoThen => promise_then(ctx, this, arg(0), arg(1)),
        Native::PromiseProtoCatch => promise_then(ctx, this, Value::UNDEFINED, arg(0)),
        Native::PromiseResolveStatic => {
            let v = arg(0);
            if v.is_object()
                && matches!(ctx.heap_ref().object(v.as_cp()).kind, ObjectKind::Promise { .. })
            {
                acquire_value(ctx.heap_mut(), v);
                return Ok(v);
            }
            let p = new_promise(ctx)?;
            acquire_value(ctx.heap_mut(), v);
            settle_promise(ctx, p, v, false)?;
            Ok(Value::object(p))
        }
        Native::PromiseRejectStatic => {
            let p = new_promise(ctx)?;
            let v = arg(0);
            acquire_value(ctx.heap_mut(), v);
            settle_promise(ctx, p, v, true)?;
            Ok(Value::object(p))
        }
        Native::PromiseResolveFn | Native::PromiseRejectFn => {
            let rejected = Native::from_u16(id) == Native::PromiseRejectFn;
            let promise = match ctx.heap_ref().object(func).kind {
                ObjectKind::NativeFunction { payload, .. } => payload,
                _ => Cp::NULL,
            };
            if promise.is_null() {
                return Ok(Value::UNDEFINED);
            }
            let v = arg(0);
            if !rejected
                && v.is_object()
                && matches!(ctx.heap_ref().object(v.as_cp()).kind, ObjectKind::Promise { .. })
            {
                // Resolving with a promise adopts its eventual state.
                adopt_promise(ctx, v.as_cp(), promise)?;
                return Ok(Value::UNDEFINED);
            }
            acquire_value(ctx.heap_mut(), v);
            settle_promise(ctx, promise, v, rejected)?;
            Ok(Value::UNDEFINED)
        }
    }
}

// ---------------------------------------------------------------------------
// this-value helpers
// ---------------------------------------------------------------------------

fn require_array(ctx: &mut Context, this: Value) -> Completion<Cp> {
    if this.is_object() {
        if matches!(ctx.heap_ref().object(this.as_cp()).kind, ObjectKind::Array { .. }) {
            return Ok(this.as_cp());
        }
    }
    ctx.throw_type_error("receiver is not an array")
}

fn array_len(ctx: &Context, arr: Cp) -> u32 {
    match &ctx.heap_ref().object(arr).kind {
        ObjectKind::Array { elements } => elements.len() as u32,
        _ => 0,
    }
}

fn this_string(ctx: &mut Context, this: Value) -> Completion<String> {
    if this.is_string() {
        return Ok(ctx.heap_ref().string(this.as_cp()).flatten().into_owned());
    }
    if this.is_object() {
        if let ObjectKind::Boxed { class: BoxedClass::String, primitive } =
            ctx.heap_ref().object(this.as_cp()).kind
        {
            return Ok(ctx.heap_ref().string(primitive.as_cp()).flatten().into_owned());
        }
    }
    ctx.to_display_string(this)
}

fn this_number(ctx: &mut Context, this: Value) -> Completion<f64> {
    if this.is_number() {
        return Ok(ctx.number_of(this));
    }
    if this.is_object() {
        if let ObjectKind::Boxed { class: BoxedClass::Number, primitive } =
            ctx.heap_ref().object(this.as_cp()).kind
        {
            return Ok(ctx.number_of(primitive));
        }
    }
    ctx.throw_type_error("receiver is not a number")
}

fn this_boolean(ctx: &mut Context, this: Value) -> Completion<bool> {
    if this.is_boolean() {
        return Ok(this.is_true());
    }
    if this.is_object() {
        if let ObjectKind::Boxed { class: BoxedClass::Boolean, primitive } =
            ctx.heap_ref().object(this.as_cp()).kind
        {
            return Ok(primitive.is_true());
        }
    }
    ctx.throw_type_error("receiver is not a boolean")
}

fn require_generator(ctx: &mut Context, this: Value) -> Completion<Cp> {
    if this.is_object()
        && matches!(ctx.heap_ref().object(this.as_cp()).kind, ObjectKind::Generator { .. })
    {
        return Ok(this.as_cp());
    }
    ctx.throw_type_error("receiver is not a generator")
}

fn finish_generator_obj(ctx: &mut Context, gen: Cp) {
    let taken = match &mut ctx.heap_mut().object_mut(gen).kind {
        ObjectKind::Generator { status, state } => {
            *status = crate::object::GeneratorStatus::Done;
            state.take()
        }
        _ => None,
    };
    if let Some(s) = taken {
        release_value(ctx.heap_mut(), s.this);
        for v in s.regs {
            release_value(ctx.heap_mut(), v);
        }
        for v in s.stack {
            release_value(ctx.heap_mut(), v);
        }
    }
}

/// `{ value, done }` result object. Takes ownership of `value`.
fn iter_result(ctx: &mut Context, value: Value, done: bool) -> Completion {
    ctx.scratch_push(value);
    let obj = match ctx.new_object() {
        Ok(o) => o,
        Err(t) => {
            ctx.scratch_pop(1);
            release_value(ctx.heap_mut(), value);
            return Err(t);
        }
    };
    let cp = obj.as_cp();
    ctx.scratch_push(obj);
    let result = (|| {
        let vn = ctx.prop_name_from_str("value");
        let vn = ctx.own_name_copy(vn)?;
        ctx.add_own_property(cp, Property::data_prop(vn, value, PropFlags::data_default()))?;
        let dn = ctx.prop_name_from_str("done");
        let dn = ctx.own_name_copy(dn)?;
        ctx.add_own_property(
            cp,
            Property::data_prop(dn, Value::boolean(done), PropFlags::data_default()),
        )
    })();
    ctx.scratch_pop(2);
    result?;
    Ok(obj)
}

// ---------------------------------------------------------------------------
// Small numeric helpers
// ---------------------------------------------------------------------------

fn math1(ctx: &mut Context, v: Value, f: fn(f64) -> f64) -> Completion {
    let n = ctx.to_number(v)?;
    ctx.number_value(f(n))
}

fn parse_int(ctx: &mut Context, text: &str, radix: i32) -> Completion {
    let t = text.trim();
    let (sign, t) = match t.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, t.strip_prefix('+').unwrap_or(t)),
    };
    let (radix, t) = if (radix == 16 || radix == 0) && (t.starts_with("0x") || t.starts_with("0X"))
    {
        (16, &t[2..])
    } else if radix == 0 {
        (10, t)
    } else {
        (radix, t)
    };
    if !(2..=36).contains(&radix) {
        return ctx.number_value(f64::NAN);
    }
    // Longest valid digit prefix.
    let mut value: f64 = 0.0;
    let mut any = false;
    for c in t.chars() {
        match c.to_digit(radix as u32) {
            Some(d) => {
                value = value * radix as f64 + d as f64;
                any = true;
            }
            None => break,
        }
    }
    if !any {
        return ctx.number_value(f64::NAN);
    }
    ctx.number_value(sign * value)
}

fn format_radix(n: f64, radix: u32) -> String {
    if n.is_nan() {
        return "NaN".into();
    }
    if !n.is_finite() {
        return if n > 0.0 { "Infinity".into() } else { "-Infinity".into() };
    }
    let neg = n < 0.0;
    let mut whole = n.abs().trunc() as u64;
    let mut digits = Vec::new();
    if whole == 0 {
        digits.push(b'0');
    }
    while whole > 0 {
        let d = (whole % radix as u64) as u32;
        digits.push(char::from_digit(d, radix).unwrap_or('0') as u8);
        whole /= radix as u64;
    }
    digits.reverse();
    let mut out = String::from_utf8_lossy(&digits).into_owned();
    if neg {
        out.insert(0, '-');
    }
    out
}

fn slice_index(ctx: &mut Context, v: Value, default: i64, len: i64) -> Completion<i64> {
    if v.is_undefined() {
        return Ok(default);
    }
    let n = ctx.to_number(v)?;
    let i = if n.is_nan() { 0 } else { n as i64 };
    Ok(if i < 0 { (len + i).max(0) } else { i.min(len) })
}

fn array_ctor(ctx: &mut Context, args: &[Value]) -> Completion {
    if args.len() == 1 && args[0].is_number() {
        let n = ctx.to_number(args[0])?;
        let len = n as u32;
        if n.is_nan() || n < 0.0 || (len as f64) != n {
            return ctx.throw_range_error("invalid array length");
        }
        return ctx.new_array(vec![Value::EMPTY; len as usize]);
    }
    let elements: Vec<Value> = args.to_vec();
    for &v in &elements {
        acquire_value(ctx.heap_mut(), v);
    }
    ctx.new_array(elements)
}

/// Read a descriptor object into the internal partial-descriptor form.
fn to_property_descriptor(ctx: &mut Context, desc: Value) -> Completion<PropertyDescriptor> {
    if !desc.is_object() {
        return ctx.throw_type_error("property descriptor must be an object");
    }
    let mut out = PropertyDescriptor::default();
    let read = |ctx: &mut Context, name: &str| -> Completion<Option<Value>> {
        let obj = desc.as_cp();
        let pname = ctx.prop_name_from_str(name);
        match ctx.get_own_property(obj, pname)? {
            Some(_) => {
                let v = ctx.get_value_property(desc, pname)?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    };
    if let Some(v) = read(ctx, "value")? {
        // The descriptor keeps this reference; the caller releases it after
        // the define completes.
        out.value = Some(v);
    }
    if let Some(v) = read(ctx, "writable")? {
        out.writable = Some(ctx.to_boolean(v));
        release_value(ctx.heap_mut(), v);
    }
    if let Some(v) = read(ctx, "enumerable")? {
        out.enumerable = Some(ctx.to_boolean(v));
        release_value(ctx.heap_mut(), v);
    }
    if let Some(v) = read(ctx, "configurable")? {
        out.configurable = Some(ctx.to_boolean(v));
        release_value(ctx.heap_mut(), v);
    }
    if let Some(v) = read(ctx, "get")? {
        if !v.is_undefined() {
            if !v.is_object() || !ctx.heap_ref().object(v.as_cp()).is_callable() {
                release_value(ctx.heap_mut(), v);
                return ctx.throw_type_error("getter must be callable");
            }
            out.getter = Some(v.as_cp());
        }
        release_value(ctx.heap_mut(), v);
    }
    if let Some(v) = read(ctx, "set")? {
        if !v.is_undefined() {
            if !v.is_object() || !ctx.heap_ref().object(v.as_cp()).is_callable() {
                release_value(ctx.heap_mut(), v);
                return ctx.throw_type_error("setter must be callable");
            }
            out.setter = Some(v.as_cp());
        }
        release_value(ctx.heap_mut(), v);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Promises and the microtask queue
// ---------------------------------------------------------------------------

fn new_promise(ctx: &mut Context) -> Completion<Cp> {
    let proto = ctx.builtins.promise_prototype();
    let cell = ObjectCell::with_kind(
        proto,
        ObjectKind::Promise { state: PromiseState::Pending, reactions: Vec::new() },
    );
    ctx.new_object_cell(cell)
}

fn promise_ctor(ctx: &mut Context, executor: Value) -> Completion {
    if !executor.is_object() || !ctx.heap_ref().object(executor.as_cp()).is_callable() {
        return ctx.throw_type_error("Promise executor must be callable");
    }
    let p = new_promise(ctx)?;
    ctx.scratch_push(Value::object(p));
    let result = (|| {
        let resolve = make_capsule_function(ctx, Native::PromiseResolveFn, p)?;
        ctx.scratch_push(resolve);
        let reject = make_capsule_function(ctx, Native::PromiseRejectFn, p);
        ctx.scratch_pop(1);
        let reject = reject?;
        vm::call_value(ctx, executor, Value::UNDEFINED, &[resolve, reject])
    })();
    ctx.scratch_pop(1);
    match result {
        Ok(v) => release_value(ctx.heap_mut(), v),
        Err(Thrown::Value(e)) => settle_promise(ctx, p, e, true)?,
        Err(other) => return Err(other),
    }
    Ok(Value::object(p))
}

fn promise_then(ctx: &mut Context, this: Value, on_f: Value, on_r: Value) -> Completion {
    if !this.is_object()
        || !matches!(ctx.heap_ref().object(this.as_cp()).kind, ObjectKind::Promise { .. })
    {
        return ctx.throw_type_error("receiver is not a promise");
    }
    let p = this.as_cp();
    let callable = |ctx: &Context, v: Value| {
        if v.is_object() && ctx.heap_ref().object(v.as_cp()).is_callable() {
            v.as_cp()
        } else {
            Cp::NULL
        }
    };
    let on_fulfilled = callable(ctx, on_f);
    let on_rejected = callable(ctx, on_r);
    let next = new_promise(ctx)?;

    let pending_reaction = PromiseReaction::Then { on_fulfilled, on_rejected, next };
    let state = match &ctx.heap_ref().object(p).kind {
        ObjectKind::Promise { state, .. } => *state,
        _ => unreachable!(),
    };
    match state {
        PromiseState::Pending => {
            if let ObjectKind::Promise { reactions, .. } = &mut ctx.heap_mut().object_mut(p).kind {
                reactions.push(pending_reaction);
            }
            let _ = ctx.heap_mut().try_recharge(p);
        }
        PromiseState::Fulfilled(v) => {
            acquire_value(ctx.heap_mut(), v);
            ctx.enqueue_job(Job::Reaction { handler: on_fulfilled, next, value: v, rejected: false });
        }
        PromiseState::Rejected(v) => {
            acquire_value(ctx.heap_mut(), v);
            ctx.enqueue_job(Job::Reaction { handler: on_rejected, next, value: v, rejected: true });
        }
    }
    Ok(Value::object(next))
}

/// Transition a pending promise and queue its reactions. Takes ownership of
/// one reference of `value`.
pub fn settle_promise(ctx: &mut Context, p: Cp, value: Value, rejected: bool) -> Completion<()> {
    let settleable = matches!(
        &ctx.heap_ref().object(p).kind,
        ObjectKind::Promise { state: PromiseState::Pending, .. }
    );
    if !settleable {
        // Already settled (or not a promise); later settlements are ignored.
        release_value(ctx.heap_mut(), value);
        return Ok(());
    }
    let reactions = match &mut ctx.heap_mut().object_mut(p).kind {
        ObjectKind::Promise { state, reactions } => {
            *state = if rejected {
                PromiseState::Rejected(value)
            } else {
                PromiseState::Fulfilled(value)
            };
            std::mem::take(reactions)
        }
        _ => unreachable!(),
    };
    for r in reactions {
        match r {
            PromiseReaction::Then { on_fulfilled, on_rejected, next } => {
                let handler = if rejected { on_rejected } else { on_fulfilled };
                acquire_value(ctx.heap_mut(), value);
                ctx.enqueue_job(Job::Reaction { handler, next, value, rejected });
            }
            PromiseReaction::AsyncContinue { gen, promise } => {
                acquire_value(ctx.heap_mut(), value);
                ctx.enqueue_job(Job::AsyncStep { gen, promise, value, rejected });
            }
        }
    }
    Ok(())
}

/// `inner`'s eventual settlement flows into `outer`.
fn adopt_promise(ctx: &mut Context, inner: Cp, outer: Cp) -> Completion<()> {
    let state = match &ctx.heap_ref().object(inner).kind {
        ObjectKind::Promise { state, .. } => *state,
        _ => return Ok(()),
    };
    match state {
        PromiseState::Pending => {
            if let ObjectKind::Promise { reactions, .. } =
                &mut ctx.heap_mut().object_mut(inner).kind
            {
                reactions.push(PromiseReaction::Then {
                    on_fulfilled: Cp::NULL,
                    on_rejected: Cp::NULL,
                    next: outer,
                });
            }
            Ok(())
        }
        PromiseState::Fulfilled(v) => {
            acquire_value(ctx.heap_mut(), v);
            settle_promise(ctx, outer, v, false)
        }
        PromiseState::Rejected(v) => {
            acquire_value(ctx.heap_mut(), v);
            settle_promise(ctx, outer, v, true)
        }
    }
}

/// Microtask execution; called by the context's drain loop.
pub fn run_job(ctx: &mut Context, job: Job) -> Completion<()> {
    match job {
        Job::Call { callback, args } => {
            let cb = Value::object(callback);
            let result = vm::call_value(ctx, cb, Value::UNDEFINED, &args);
            for v in args {
                release_value(ctx.heap_mut(), v);
            }
            let v = result?;
            release_value(ctx.heap_mut(), v);
            Ok(())
        }
        Job::Reaction { handler, next, value, rejected } => {
            if handler.is_null() {
                // Pass-through reaction (catch-less then, adoption).
                return settle_promise(ctx, next, value, rejected);
            }
            let result = vm::call_value(ctx, Value::object(handler), Value::UNDEFINED, &[value]);
            release_value(ctx.heap_mut(), value);
            match result {
                Ok(v) => {
                    if v.is_object()
                        && matches!(
                            ctx.heap_ref().object(v.as_cp()).kind,
                            ObjectKind::Promise { .. }
                        )
                    {
                        let inner = v.as_cp();
                        release_value(ctx.heap_mut(), v);
                        adopt_promise(ctx, inner, next)
                    } else {
                        settle_promise(ctx, next, v, false)
                    }
                }
                Err(Thrown::Value(e)) => settle_promise(ctx, next, e, true),
                Err(other) => Err(other),
            }
        }
        Job::AsyncStep { gen, promise, value, rejected } => {
            let r = async_step(ctx, gen, promise, value, rejected);
            release_value(ctx.heap_mut(), value);
            r
        }
    }
}

/// Begin an async function: run to the first await, return the promise.
pub fn async_function_start(ctx: &mut Context, gen: Cp) -> Completion {
    let promise = new_promise(ctx)?;
    ctx.scratch_push(Value::object(promise));
    let r = async_step(ctx, gen, promise, Value::UNDEFINED, false);
    ctx.scratch_pop(1);
    r?;
    Ok(Value::object(promise))
}

/// Resume an async function body and route its next suspension.
fn async_step(
    ctx: &mut Context,
    gen: Cp,
    promise: Cp,
    input: Value,
    is_throw: bool,
) -> Completion<()> {
    match vm::resume_generator(ctx, gen, input, is_throw) {
        Ok((v, true)) => settle_promise(ctx, promise, v, false),
        Ok((v, false)) => {
            // Awaited value: promises chain, everything else continues on
            // the next microtask tick.
            if v.is_object()
                && matches!(ctx.heap_ref().object(v.as_cp()).kind, ObjectKind::Promise { .. })
            {
                let inner = v.as_cp();
                let state = match &ctx.heap_ref().object(inner).kind {
                    ObjectKind::Promise { state, .. } => *state,
                    _ => unreachable!(),
                };
                match state {
                    PromiseState::Pending => {
                        if let ObjectKind::Promise { reactions, .. } =
                            &mut ctx.heap_mut().object_mut(inner).kind
                        {
                            reactions.push(PromiseReaction::AsyncContinue { gen, promise });
                        }
                    }
                    PromiseState::Fulfilled(inner_v) => {
                        acquire_value(ctx.heap_mut(), inner_v);
                        ctx.enqueue_job(Job::AsyncStep {
                            gen,
                            promise,
                            value: inner_v,
                            rejected: false,
                        });
                    }
                    PromiseState::Rejected(inner_v) => {
                        acquire_value(ctx.heap_mut(), inner_v);
                        ctx.enqueue_job(Job::AsyncStep {
                            gen,
                            promise,
                            value: inner_v,
                            rejected: true,
                        });
                    }
                }
                release_value(ctx.heap_mut(), v);
                Ok(())
            } else {
                ctx.enqueue_job(Job::AsyncStep { gen, promise, value: v, rejected: false });
                Ok(())
            }
        }
        Err(Thrown::Value(e)) => settle_promise(ctx, promise, e, true),
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn test_initialize_wires_prototype_chain() {
        let ctx = Context::with_default_options();
        let op = ctx.builtins.object_prototype();
        let ap = ctx.builtins.array_prototype();
        assert!(ctx.heap_ref().object(op).proto.is_null());
        assert_eq!(ctx.heap_ref().object(ap).proto, op);
        assert!(!ctx.global_object().is_nullish());
    }

    #[test]
    fn test_lazy_instantiation_sets_bitset() {
        let mut ctx = Context::with_default_options();
        let math_row = MATH_TABLE.iter().position(|r| r.name == "floor").unwrap();
        let math = ctx.builtins.singletons[S_MATH];
        assert_eq!(ctx.heap_ref().object(math).instantiated & (1 << math_row), 0);
        let name = ctx.prop_name_from_str("floor");
        let prop = ctx.get_own_property(math, name).unwrap();
        assert!(prop.is_some());
        assert_ne!(ctx.heap_ref().object(math).instantiated & (1 << math_row), 0);
        // Second lookup comes from the real chain, not the table.
        let again = ctx.get_own_property(math, name).unwrap();
        assert!(again.is_some());
    }

    #[test]
    fn test_format_radix() {
        assert_eq!(format_radix(255.0, 16), "ff");
        assert_eq!(format_radix(-8.0, 2), "-1000");
        assert_eq!(format_radix(0.0, 8), "0");
    }

    #[test]
    fn test_create_error_shape() {
        let mut ctx = Context::with_default_options();
        let e = create_error(&mut ctx, ErrorClass::TypeError, "boom").unwrap();
        let (class, msg) = ctx.describe_thrown(e);
        assert_eq!(class, "TypeError");
        assert_eq!(msg, "boom");
    }
}
