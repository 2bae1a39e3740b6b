/// Interpreter — bytecode dispatch loop
///
/// One tight loop decodes and executes instructions. Frames live on the
/// context so the collector can walk live registers and operand stacks;
/// script-to-script calls push a frame and stay inside the same loop, so
/// only native code re-enters the interpreter recursively.
///
/// Every fallible operation returns a completion. A throw consults the
/// current code block's try-range table; an unhandled exception pops the
/// frame and keeps unwinding. Out-of-memory and termination completions
/// skip handlers entirely.
///
/// Generators (and async functions) keep a resumable copy of their frame
/// in the generator object: `yield`/`await` serialise ip, registers and
/// operand stack back into it and return to the caller; resume reinstalls
/// them.

use std::rc::Rc;

use crate::builtins;
use crate::bytecode::{code_flags, read_lit_index, read_slot, CompiledCode, Op, OpExt, SlotRef};
use crate::context::{acquire_value, release_value, Completion, Context, Thrown};
use crate::errors::ErrorClass;
use crate::heap::{Cp, HeapCell};
use crate::object::{
    EnvCell, EnvKind, GeneratorState, GeneratorStatus, IterKind, ObjectCell, ObjectKind,
    PropFlags, PropName, Property, PropertyDescriptor, PropertyPair,
};
use crate::string::StringData;
use crate::value::Value;

pub const MAX_CALL_DEPTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendKind {
    Yield,
    Await,
}

/// Activation record. `env` is the innermost environment, `base_env` the
/// function-scope one `var` declarations target.
pub struct Frame {
    pub code_cp: Cp,
    pub code: Rc<CompiledCode>,
    pub ip: usize,
    pub regs: Vec<Value>,
    pub stack: Vec<Value>,
    pub env: Cp,
    pub base_env: Cp,
    pub env_depth: u16,
    pub this: Value,
    /// Generator object this frame is driving, NULL for plain calls.
    pub gen_obj: Cp,
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Run a compiled script: the frame binds the global object environment.
pub fn run_code(ctx: &mut Context, code_cp: Cp, this: Value, args: &[Value]) -> Completion {
    let global = ctx.global;
    let env = ctx
        .alloc_cell(HeapCell::Env(EnvCell::object_bound(Cp::NULL, global)))?;
    let frame = make_frame(ctx, code_cp, env, this, args, Cp::NULL)?;
    let base = ctx.frames.len();
    ctx.frames.push(frame);
    execute(ctx, base)
}

/// Call any callable value. Arguments are borrowed; the result is owned by
/// the caller.
pub fn call_value(ctx: &mut Context, func: Value, this: Value, args: &[Value]) -> Completion {
    if !func.is_object() {
        return Err(not_a_function(ctx, func));
    }
    let func_cp = func.as_cp();
    let mut target = func_cp;
    let mut this = this;
    let mut own_args: Option<Vec<Value>> = None;

    // Unwrap bound-function chains.
    loop {
        match &ctx.heap_ref().object(target).kind {
            ObjectKind::BoundFunction { target: t, bound_this, bound_args } => {
                let mut combined = bound_args.clone();
                match &own_args {
                    Some(a) => combined.extend(a.iter().copied()),
                    None => combined.extend(args.iter().copied()),
                }
                this = *bound_this;
                own_args = Some(combined);
                target = *t;
            }
            _ => break,
        }
    }

    let arg_slice: &[Value] = match &own_args {
        Some(a) => a,
        None => args,
    };

    enum Callee {
        Native(u16),
        Script(Cp),
        NotCallable,
    }
    let callee = match &ctx.heap_ref().object(target).kind {
        ObjectKind::NativeFunction { id, .. } => Callee::Native(*id),
        ObjectKind::Function { code, .. } => Callee::Script(*code),
        _ => Callee::NotCallable,
    };

    match callee {
        Callee::Native(id) => {
            let args_copy: Vec<Value> = arg_slice.to_vec();
            builtins::dispatch(ctx, id, target, this, &args_copy)
        }
        Callee::Script(code_cp) => {
            let code = ctx.heap_ref().code(code_cp);
            if code.is_generator() || code.is_async() {
                let args_copy: Vec<Value> = arg_slice.to_vec();
                return call_generator_function(ctx, target, this, &args_copy, code.is_async());
            }
            if ctx.frames.len() >= MAX_CALL_DEPTH {
                return Err(ctx.throw(ErrorClass::RangeError, "Maximum call stack size exceeded"));
            }
            let env = function_env(ctx, target)?;
            let this = bind_this(ctx, target, &code, this)?;
            let args_copy: Vec<Value> = arg_slice.to_vec();
            let frame = make_frame(ctx, code_cp, env, this, &args_copy, Cp::NULL)?;
            let base = ctx.frames.len();
            ctx.frames.push(frame);
            execute(ctx, base)
        }
        Callee::NotCallable => Err(not_a_function(ctx, func)),
    }
}

/// `new` on a callable: allocate `this` from the constructor's prototype,
/// run it, and keep an explicit object result over the fresh instance.
pub fn construct_value(ctx: &mut Context, ctor: Value, args: &[Value]) -> Completion {
    if !ctor.is_object() || !ctx.heap_ref().object(ctor.as_cp()).is_callable() {
        return Err(not_a_function(ctx, ctor));
    }
    let ctor_cp = ctor.as_cp();
    let script_code = match &ctx.heap_ref().object(ctor_cp).kind {
        ObjectKind::Function { code, .. } => Some(*code),
        _ => None,
    };
    if let Some(code_cp) = script_code {
        let code = ctx.heap_ref().code(code_cp);
        if code.is_arrow() || code.is_generator() || code.is_async() {
            return Err(ctx.throw(ErrorClass::TypeError, "not a constructor"));
        }
    }
    let non_ctor_native = matches!(
        ctx.heap_ref().object(ctor_cp).kind,
        ObjectKind::NativeFunction { construct: false, .. }
    );
    if non_ctor_native {
        return Err(ctx.throw(ErrorClass::TypeError, "not a constructor"));
    }

    let proto_val = ctx.get_value_property_str(ctor, "prototype")?;
    let proto = if proto_val.is_object() {
        proto_val.as_cp()
    } else {
        ctx.builtins.object_prototype()
    };
    let obj = ctx.new_object_cell(ObjectCell::ordinary(proto))?;
    ctx.scratch_push(Value::object(obj));
    let result = call_value(ctx, ctor, Value::object(obj), args);
    ctx.scratch_pop(1);
    let result = result?;
    if result.is_object() {
        Ok(result)
    } else {
        release_value(ctx.heap_mut(), result);
        Ok(Value::object(obj))
    }
}

fn not_a_function(ctx: &mut Context, v: Value) -> Thrown {
    let shown = ctx.to_display_string(v).unwrap_or_else(|_| "value".into());
    ctx.throw(ErrorClass::TypeError, &format!("{shown} is not a function"))
}

// ---------------------------------------------------------------------------
// Frame construction
// ---------------------------------------------------------------------------

/// Fresh environment for a function activation, when the code needs one.
fn function_env(ctx: &mut Context, func_cp: Cp) -> Completion<Cp> {
    let (code_cp, closure_env) = match &ctx.heap_ref().object(func_cp).kind {
        ObjectKind::Function { code, env, .. } => (*code, *env),
        _ => unreachable!("function_env on a non-function"),
    };
    let code = ctx.heap_ref().code(code_cp);
    if code.flags & code_flags::NEEDS_ENV != 0 {
        ctx.alloc_cell(HeapCell::Env(EnvCell::declarative(closure_env)))
    } else {
        Ok(closure_env)
    }
}

/// Ordinary-call `this` binding: arrows use their captured value, strict
/// code takes the argument verbatim, sloppy code substitutes the global
/// object for nullish and boxes primitives.
fn bind_this(
    ctx: &mut Context,
    func_cp: Cp,
    code: &CompiledCode,
    this: Value,
) -> Completion<Value> {
    if code.is_arrow() {
        if let ObjectKind::Function { lexical_this, .. } = ctx.heap_ref().object(func_cp).kind {
            if !lexical_this.is_empty() {
                return Ok(lexical_this);
            }
        }
        return Ok(Value::object(ctx.global));
    }
    if code.is_strict() {
        return Ok(this);
    }
    if this.is_nullish() {
        return Ok(Value::object(ctx.global));
    }
    if !this.is_object() {
        return ctx.to_object(this);
    }
    Ok(this)
}

fn make_frame(
    ctx: &mut Context,
    code_cp: Cp,
    env: Cp,
    this: Value,
    args: &[Value],
    gen_obj: Cp,
) -> Completion<Frame> {
    let code = ctx.heap_ref().code(code_cp);
    let mut regs = vec![Value::UNDEFINED; code.reg_count as usize];
    let argc = code.arg_count as usize;
    for i in 0..argc.min(args.len()) {
        acquire_value(ctx.heap_mut(), args[i]);
        regs[i] = args[i];
    }
    if code.flags & code_flags::HAS_REST != 0 {
        let extra: Vec<Value> = args.iter().skip(argc).copied().collect();
        for &v in &extra {
            acquire_value(ctx.heap_mut(), v);
        }
        let arr = ctx.new_array(extra)?;
        regs[argc] = arr;
    }
    if code.flags & code_flags::HAS_ARGUMENTS != 0 {
        let all: Vec<Value> = args.to_vec();
        for &v in &all {
            acquire_value(ctx.heap_mut(), v);
        }
        let arr = ctx.new_array(all)?;
        declare_binding(ctx, env, "arguments", arr, true)?;
    }
    acquire_value(ctx.heap_mut(), this);
    Ok(Frame {
        code_cp,
        code,
        ip: 0,
        regs,
        stack: Vec::new(),
        env,
        base_env: env,
        env_depth: 0,
        this,
        gen_obj,
    })
}

fn drop_frame(ctx: &mut Context) {
    if let Some(frame) = ctx.frames.pop() {
        for v in frame.regs {
            release_value(ctx.heap_mut(), v);
        }
        for v in frame.stack {
            release_value(ctx.heap_mut(), v);
        }
        release_value(ctx.heap_mut(), frame.this);
    }
}

// ---------------------------------------------------------------------------
// Environment operations
// ---------------------------------------------------------------------------

fn declare_binding(
    ctx: &mut Context,
    env: Cp,
    name: &str,
    value: Value,
    writable: bool,
) -> Completion<()> {
    let pname = ctx.prop_name_from_str(name);
    let pname = ctx.own_name_copy(pname)?;
    let flags = if writable {
        PropFlags::from_bits(PropFlags::WRITABLE | PropFlags::ENUMERABLE)
    } else {
        PropFlags::from_bits(PropFlags::ENUMERABLE)
    };
    let prop = Property::data_prop(pname, value, flags);
    add_env_binding(ctx, env, prop)
}

fn add_env_binding(ctx: &mut Context, env: Cp, prop: Property) -> Completion<()> {
    let mut pair_cp = ctx.heap_ref().env(env).props;
    let mut last = Cp::NULL;
    while !pair_cp.is_null() {
        let (vacant, next) = {
            let pair = ctx.heap_ref().pair(pair_cp);
            (pair.slots.iter().position(|s| s.is_none()), pair.next)
        };
        if let Some(slot) = vacant {
            ctx.heap_mut().pair_mut(pair_cp).slots[slot] = Some(prop);
            return Ok(());
        }
        last = pair_cp;
        pair_cp = next;
    }
    let fresh = ctx.alloc_cell(HeapCell::Pair(PropertyPair::with_first(prop)))?;
    if last.is_null() {
        ctx.heap_mut().env_mut(env).props = fresh;
    } else {
        ctx.heap_mut().pair_mut(last).next = fresh;
    }
    Ok(())
}

/// Declare a `var`-style binding in `env` if absent (declarative form) or
/// as a property of the binding object (global / with form).
fn env_declare_var(ctx: &mut Context, env: Cp, name: PropName) -> Completion<()> {
    match ctx.heap_ref().env(env).kind {
        EnvKind::Declarative => {
            if crate::object::find_env_binding(ctx.heap_ref(), env, name).is_some() {
                return Ok(());
            }
            let name = ctx.own_name_copy(name)?;
            let prop = Property::data_prop(
                name,
                Value::UNDEFINED,
                PropFlags::from_bits(PropFlags::WRITABLE | PropFlags::ENUMERABLE),
            );
            add_env_binding(ctx, env, prop)
        }
        EnvKind::ObjectBound => {
            let obj = ctx.heap_ref().env(env).bound_object;
            if crate::object::find_own_prop(ctx.heap_ref(), obj, name).is_some() {
                return Ok(());
            }
            let name = ctx.own_name_copy(name)?;
            // Global var bindings are not configurable.
            ctx.add_own_property(
                obj,
                Property::data_prop(
                    name,
                    Value::UNDEFINED,
                    PropFlags::from_bits(PropFlags::WRITABLE | PropFlags::ENUMERABLE),
                ),
            )
        }
    }
}

/// Lexical binding in the innermost environment; EMPTY marks the TDZ. The
/// global scope is object-bound, so its lexical bindings become ordinary
/// global properties there.
fn env_declare_lexical(ctx: &mut Context, env: Cp, name: PropName, writable: bool) -> Completion<()> {
    if let EnvKind::ObjectBound = ctx.heap_ref().env(env).kind {
        let obj = ctx.heap_ref().env(env).bound_object;
        if crate::object::find_own_prop(ctx.heap_ref(), obj, name).is_none() {
            let name = ctx.own_name_copy(name)?;
            let flags = if writable {
                PropFlags::from_bits(PropFlags::WRITABLE | PropFlags::ENUMERABLE)
            } else {
                PropFlags::from_bits(PropFlags::ENUMERABLE)
            };
            ctx.add_own_property(obj, Property::data_prop(name, Value::UNDEFINED, flags))?;
        }
        return Ok(());
    }
    let name = ctx.own_name_copy(name)?;
    let flags = if writable {
        PropFlags::from_bits(PropFlags::WRITABLE | PropFlags::ENUMERABLE)
    } else {
        PropFlags::from_bits(PropFlags::ENUMERABLE)
    };
    add_env_binding(ctx, env, Property::data_prop(name, Value::EMPTY, flags))
}

fn env_init_binding(ctx: &mut Context, env: Cp, name: PropName, value: Value) -> Completion<()> {
    match ctx.heap_ref().env(env).kind {
        EnvKind::Declarative => {
            match crate::object::find_env_binding(ctx.heap_ref(), env, name) {
                Some((pair, slot)) => {
                    let old = ctx.heap_ref().pair(pair).slots[slot]
                        .unwrap_or_else(|| unreachable!())
                        .value();
                    if !old.is_empty() {
                        release_value(ctx.heap_mut(), old);
                    }
                    if let Some(p) = &mut ctx.heap_mut().pair_mut(pair).slots[slot] {
                        p.data = crate::object::PropData::Value(value);
                    }
                    Ok(())
                }
                None => {
                    let name = ctx.own_name_copy(name)?;
                    add_env_binding(
                        ctx,
                        env,
                        Property::data_prop(name, value, PropFlags::data_default()),
                    )
                }
            }
        }
        EnvKind::ObjectBound => {
            let obj = ctx.heap_ref().env(env).bound_object;
            ctx.set_value_property(Value::object(obj), name, value, false)
        }
    }
}

/// Resolve an identifier through the environment chain.
fn env_resolve(ctx: &mut Context, mut env: Cp, name: PropName) -> Completion<Option<Value>> {
    while !env.is_null() {
        match ctx.heap_ref().env(env).kind {
            EnvKind::Declarative => {
                if let Some((pair, slot)) =
                    crate::object::find_env_binding(ctx.heap_ref(), env, name)
                {
                    let v = ctx.heap_ref().pair(pair).slots[slot]
                        .unwrap_or_else(|| unreachable!())
                        .value();
                    if v.is_empty() {
                        let shown = ctx.prop_name_text(name);
                        return Err(ctx.throw(
                            ErrorClass::ReferenceError,
                            &format!("cannot access '{shown}' before initialization"),
                        ));
                    }
                    acquire_value(ctx.heap_mut(), v);
                    return Ok(Some(v));
                }
            }
            EnvKind::ObjectBound => {
                let obj = ctx.heap_ref().env(env).bound_object;
                if ctx.has_property(obj, name)? {
                    let v = ctx.ordinary_get(obj, name, Value::object(obj))?;
                    return Ok(Some(v));
                }
            }
        }
        env = ctx.heap_ref().env(env).outer;
    }
    Ok(None)
}

/// Assign through the chain. Consumes one reference of `value`.
fn env_assign(
    ctx: &mut Context,
    mut env: Cp,
    name: PropName,
    value: Value,
    strict: bool,
) -> Completion<()> {
    while !env.is_null() {
        match ctx.heap_ref().env(env).kind {
            EnvKind::Declarative => {
                if let Some((pair, slot)) =
                    crate::object::find_env_binding(ctx.heap_ref(), env, name)
                {
                    let prop = ctx.heap_ref().pair(pair).slots[slot]
                        .unwrap_or_else(|| unreachable!());
                    if !prop.flags.writable() {
                        release_value(ctx.heap_mut(), value);
                        return Err(ctx.throw(
                            ErrorClass::TypeError,
                            "assignment to constant variable",
                        ));
                    }
                    let old = prop.value();
                    if !old.is_empty() {
                        release_value(ctx.heap_mut(), old);
                    }
                    if let Some(p) = &mut ctx.heap_mut().pair_mut(pair).slots[slot] {
                        p.data = crate::object::PropData::Value(value);
                    }
                    return Ok(());
                }
            }
            EnvKind::ObjectBound => {
                let obj = ctx.heap_ref().env(env).bound_object;
                let outer_is_last = ctx.heap_ref().env(env).outer.is_null();
                if ctx.has_property(obj, name)? || (outer_is_last && !strict) {
                    return ctx.set_value_property(Value::object(obj), name, value, strict);
                }
            }
        }
        env = ctx.heap_ref().env(env).outer;
    }
    release_value(ctx.heap_mut(), value);
    let shown = ctx.prop_name_text(name);
    Err(ctx.throw(ErrorClass::ReferenceError, &format!("{shown} is not defined")))
}

// ---------------------------------------------------------------------------
// The dispatch loop
// ---------------------------------------------------------------------------

macro_rules! frame {
    ($ctx:expr) => {
        $ctx.frames.last_mut().unwrap_or_else(|| unreachable!("no active frame"))
    };
}

/// Execute until the frame stack returns to `base` frames.
pub fn execute(ctx: &mut Context, base: usize) -> Completion {
    debug_assert!(ctx.frames.len() == base + 1);
    loop {
        let step = run_frame_step(ctx, base);
        match step {
            Ok(Flow::Continue) => {}
            Ok(Flow::Finished(v)) => return Ok(v),
            Err(thrown) => {
                match unwind(ctx, base, thrown) {
                    // Handler installed; keep running.
                    Ok(()) => {}
                    Err(t) => return Err(t),
                }
            }
        }
    }
}

enum Flow {
    Continue,
    Finished(Value),
}

/// Route a thrown value to the innermost try handler at or above `base`.
fn unwind(ctx: &mut Context, base: usize, thrown: Thrown) -> Result<(), Thrown> {
    let Thrown::Value(exc) = thrown else {
        // Uncatchable: pop everything this activation owns.
        while ctx.frames.len() > base {
            drop_frame(ctx);
        }
        return Err(thrown);
    };
    ctx.set_error_slot(exc);
    loop {
        let found = {
            let frame = ctx
                .frames
                .last()
                .unwrap_or_else(|| unreachable!("unwind without a frame"));
            frame
                .code
                .find_handler(frame.ip as u32)
                .map(|r| (r.handler, r.stack_depth, r.env_depth))
        };
        let Some((handler, stack_depth, env_depth)) = found else {
            if ctx.frames.len() == base + 1 {
                drop_frame(ctx);
                let v = ctx.clear_error_slot();
                return Err(Thrown::Value(v));
            }
            drop_frame(ctx);
            continue;
        };
        // Restore the operand stack and environment chain, then enter the
        // handler with the exception pushed.
        let released: Vec<Value> = {
            let frame = frame!(ctx);
            frame.stack.split_off(stack_depth as usize)
        };
        for v in released {
            release_value(ctx.heap_mut(), v);
        }
        loop {
            let env = {
                let f = frame!(ctx);
                if f.env_depth <= env_depth {
                    break;
                }
                f.env
            };
            let outer = ctx.heap_ref().env(env).outer;
            let f = frame!(ctx);
            f.env = outer;
            f.env_depth -= 1;
        }
        let exc = ctx.clear_error_slot();
        let f = frame!(ctx);
        f.ip = handler as usize;
        f.stack.push(exc);
        return Ok(());
    }
}

/// Decode and execute one instruction of the top frame.
fn run_frame_step(ctx: &mut Context, base: usize) -> Result<Flow, Thrown> {
    let (code, op_start) = {
        let f = frame!(ctx);
        (Rc::clone(&f.code), f.ip)
    };
    let bytes = &code.code;
    let mut ip = op_start;
    let op = Op::from_byte(bytes[ip]);
    ip += 1;

    // The frame's ip stays at the instruction start while it runs, so the
    // unwinder attributes a throw to the right try range; jumps and the
    // fall-through update it at the end.
    macro_rules! finish {
        () => {{
            frame!(ctx).ip = ip;
            return Ok(Flow::Continue);
        }};
    }

    match op {
        Op::Nop => finish!(),
        Op::Push => {
            let slot = read_slot(bytes, &mut ip);
            let v = match slot {
                SlotRef::Lit(ix) => literal_value(ctx, &code, ix),
                SlotRef::Reg(r) => {
                    let v = frame!(ctx).regs[r as usize];
                    acquire_value(ctx.heap_mut(), v);
                    v
                }
            };
            frame!(ctx).stack.push(v);
            finish!()
        }
        Op::PushSmallInt => {
            let v = i16::from_le_bytes([bytes[ip], bytes[ip + 1]]);
            ip += 2;
            frame!(ctx).stack.push(Value::small_int(v as i32));
            finish!()
        }
        Op::PushUndefined => {
            frame!(ctx).stack.push(Value::UNDEFINED);
            finish!()
        }
        Op::PushNull => {
            frame!(ctx).stack.push(Value::NULL);
            finish!()
        }
        Op::PushTrue => {
            frame!(ctx).stack.push(Value::TRUE);
            finish!()
        }
        Op::PushFalse => {
            frame!(ctx).stack.push(Value::FALSE);
            finish!()
        }
        Op::PushThis => {
            let this = frame!(ctx).this;
            acquire_value(ctx.heap_mut(), this);
            frame!(ctx).stack.push(this);
            finish!()
        }
        Op::Store => {
            let slot = read_slot(bytes, &mut ip);
            let SlotRef::Reg(r) = slot else {
                return Err(ctx.throw(ErrorClass::TypeError, "malformed store target"));
            };
            let v = pop(ctx);
            let old = frame!(ctx).regs[r as usize];
            release_value(ctx.heap_mut(), old);
            frame!(ctx).regs[r as usize] = v;
            finish!()
        }
        Op::Dup => {
            let v = *frame!(ctx).stack.last().unwrap_or(&Value::UNDEFINED);
            acquire_value(ctx.heap_mut(), v);
            frame!(ctx).stack.push(v);
            finish!()
        }
        Op::Dup2 => {
            let f = frame!(ctx);
            let n = f.stack.len();
            let a = f.stack[n - 2];
            let b = f.stack[n - 1];
            acquire_value(ctx.heap_mut(), a);
            acquire_value(ctx.heap_mut(), b);
            let f = frame!(ctx);
            f.stack.push(a);
            f.stack.push(b);
            finish!()
        }
        Op::Pop => {
            let v = pop(ctx);
            release_value(ctx.heap_mut(), v);
            finish!()
        }
        Op::Swap => {
            let f = frame!(ctx);
            let n = f.stack.len();
            f.stack.swap(n - 1, n - 2);
            finish!()
        }

        // ── Arithmetic ───────────────────────────────────────────────────
        Op::Add => binary_op(ctx, ip, op_add),
        Op::Sub => numeric_op(ctx, ip, |a, b| a - b),
        Op::Mul => numeric_op(ctx, ip, |a, b| a * b),
        Op::Div => numeric_op(ctx, ip, |a, b| a / b),
        Op::Mod => numeric_op(ctx, ip, |a, b| {
            if b == 0.0 { f64::NAN } else { a - b * (a / b).trunc() }
        }),
        Op::Neg => unary_numeric(ctx, ip, |n| -n),
        Op::Plus | Op::Inc | Op::Dec => {
            let delta = match op {
                Op::Inc => 1.0,
                Op::Dec => -1.0,
                _ => 0.0,
            };
            let v = pop(ctx);
            ctx.scratch_push(v);
            let n = ctx.to_number(v);
            ctx.scratch_pop(1);
            release_value(ctx.heap_mut(), v);
            let out = ctx.number_value(n? + delta)?;
            frame!(ctx).stack.push(out);
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
        Op::BitAnd => int32_op(ctx, ip, |a, b| a & b),
        Op::BitOr => int32_op(ctx, ip, |a, b| a | b),
        Op::BitXor => int32_op(ctx, ip, |a, b| a ^ b),
        Op::Shl => int32_op(ctx, ip, |a, b| a.wrapping_shl(b as u32 & 31)),
        Op::Shr => int32_op(ctx, ip, |a, b| a.wrapping_shr(b as u32 & 31)),
        Op::UShr => {
            let (a, b) = pop2(ctx);
            ctx.scratch_push(a);
            ctx.scratch_push(b);
            let result = (|| {
                let x = ctx.to_uint32(a)?;
                let y = ctx.to_uint32(b)?;
                ctx.number_value((x >> (y & 31)) as f64)
            })();
            ctx.scratch_pop(2);
            release_value(ctx.heap_mut(), a);
            release_value(ctx.heap_mut(), b);
            frame!(ctx).stack.push(result?);
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
        Op::BitNot => {
            let v = pop(ctx);
            ctx.scratch_push(v);
            let n = ctx.to_int32(v);
            ctx.scratch_pop(1);
            release_value(ctx.heap_mut(), v);
            frame!(ctx).stack.push(Value::small_int(!n?));
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }

        // ── Comparison / logic ───────────────────────────────────────────
        Op::Eq | Op::NotEq => {
            let (a, b) = pop2(ctx);
            ctx.scratch_push(a);
            ctx.scratch_push(b);
            let eq = ctx.loose_equals(a, b);
            ctx.scratch_pop(2);
            release_value(ctx.heap_mut(), a);
            release_value(ctx.heap_mut(), b);
            let eq = eq?;
            frame!(ctx).stack.push(Value::boolean(if op == Op::Eq { eq } else { !eq }));
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
        Op::StrictEq | Op::StrictNotEq => {
            let (a, b) = pop2(ctx);
            let eq = ctx.strict_equals(a, b);
            release_value(ctx.heap_mut(), a);
            release_value(ctx.heap_mut(), b);
            frame!(ctx)
                .stack
                .push(Value::boolean(if op == Op::StrictEq { eq } else { !eq }));
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
        Op::Lt | Op::LtEq | Op::Gt | Op::GtEq => {
            let (a, b) = pop2(ctx);
            ctx.scratch_push(a);
            ctx.scratch_push(b);
            // a < b and a > b swap operand order; <= and >= negate.
            let cmp = match op {
                Op::Lt => ctx.less_than(a, b).map(|r| r.unwrap_or(false)),
                Op::Gt => ctx.less_than(b, a).map(|r| r.unwrap_or(false)),
                Op::LtEq => ctx.less_than(b, a).map(|r| !r.unwrap_or(true)),
                _ => ctx.less_than(a, b).map(|r| !r.unwrap_or(true)),
            };
            ctx.scratch_pop(2);
            release_value(ctx.heap_mut(), a);
            release_value(ctx.heap_mut(), b);
            frame!(ctx).stack.push(Value::boolean(cmp?));
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
        Op::InstanceOf => {
            let (a, b) = pop2(ctx);
            ctx.scratch_push(a);
            ctx.scratch_push(b);
            let result = instance_of(ctx, a, b);
            ctx.scratch_pop(2);
            release_value(ctx.heap_mut(), a);
            release_value(ctx.heap_mut(), b);
            frame!(ctx).stack.push(Value::boolean(result?));
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
        Op::In => {
            let (key, obj) = pop2(ctx);
            ctx.scratch_push(key);
            ctx.scratch_push(obj);
            let result = (|| {
                if !obj.is_object() {
                    return ctx
                        .throw_type_error("cannot use 'in' operator on a non-object")
                        .map(|_: Value| false);
                }
                let name = ctx.to_property_name(key)?;
                ctx.has_property(obj.as_cp(), name)
            })();
            ctx.scratch_pop(2);
            release_value(ctx.heap_mut(), key);
            release_value(ctx.heap_mut(), obj);
            frame!(ctx).stack.push(Value::boolean(result?));
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
        Op::Not => {
            let v = pop(ctx);
            let b = ctx.to_boolean(v);
            release_value(ctx.heap_mut(), v);
            frame!(ctx).stack.push(Value::boolean(!b));
            finish!()
        }
        Op::TypeOf => {
            let v = pop(ctx);
            let name = typeof_name(ctx, v);
            release_value(ctx.heap_mut(), v);
            let s = ctx.new_string_value(name)?;
            frame!(ctx).stack.push(s);
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
        Op::TypeOfIdent => {
            let ix = read_lit_index(bytes, &mut ip);
            let name = const_prop_name(ctx, &code, ix);
            let env = frame!(ctx).env;
            let resolved = env_resolve(ctx, env, name);
            let name = match resolved {
                Ok(Some(v)) => {
                    let n = typeof_name(ctx, v);
                    release_value(ctx.heap_mut(), v);
                    n
                }
                Ok(None) => "undefined",
                // TDZ reads still throw inside typeof.
                Err(t) => return Err(t),
            };
            let s = ctx.new_string_value(name)?;
            frame!(ctx).stack.push(s);
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }

        // ── Control flow ─────────────────────────────────────────────────
        Op::Jump => {
            let off = bytes[ip] as i8;
            jump_to(ctx, op_start, off as i32)?;
            Ok(Flow::Continue)
        }
        Op::JumpWide => {
            let off = i16::from_le_bytes([bytes[ip], bytes[ip + 1]]);
            jump_to(ctx, op_start, off as i32)?;
            Ok(Flow::Continue)
        }
        Op::JumpIfTrue | Op::JumpIfFalse => {
            let off = bytes[ip] as i8;
            ip += 1;
            cond_jump(ctx, op_start, ip, off as i32, op == Op::JumpIfTrue)
        }
        Op::JumpIfTrueWide | Op::JumpIfFalseWide => {
            let off = i16::from_le_bytes([bytes[ip], bytes[ip + 1]]);
            ip += 2;
            cond_jump(ctx, op_start, ip, off as i32, op == Op::JumpIfTrueWide)
        }
        Op::JumpIfNullishWide => {
            let off = i16::from_le_bytes([bytes[ip], bytes[ip + 1]]);
            ip += 2;
            let v = pop(ctx);
            let nullish = v.is_nullish();
            release_value(ctx.heap_mut(), v);
            if nullish {
                jump_to(ctx, op_start, off as i32)?;
            } else {
                frame!(ctx).ip = ip;
            }
            Ok(Flow::Continue)
        }
        Op::Throw => {
            let v = pop(ctx);
            frame!(ctx).ip = op_start;
            Err(Thrown::Value(v))
        }
        Op::Return | Op::ReturnUndefined => {
            let ret = if op == Op::Return { pop(ctx) } else { Value::UNDEFINED };
            let gen_obj = frame!(ctx).gen_obj;
            if !gen_obj.is_null() {
                finish_generator(ctx, gen_obj);
            }
            drop_frame(ctx);
            if ctx.frames.len() == base {
                return Ok(Flow::Finished(ret));
            }
            frame!(ctx).stack.push(ret);
            Ok(Flow::Continue)
        }

        // ── Calls ────────────────────────────────────────────────────────
        Op::Call | Op::CallWithThis => {
            let argc = bytes[ip] as usize;
            ip += 1;
            let args = pop_n(ctx, argc);
            let func = pop(ctx);
            let this = if op == Op::CallWithThis { pop(ctx) } else { Value::UNDEFINED };
            frame!(ctx).ip = ip;
            dispatch_call(ctx, func, this, args, base)
        }
        Op::New => {
            let argc = bytes[ip] as usize;
            ip += 1;
            let args = pop_n(ctx, argc);
            let ctor = pop(ctx);
            frame!(ctx).ip = ip;
            for &a in &args {
                ctx.scratch_push(a);
            }
            ctx.scratch_push(ctor);
            let result = construct_value(ctx, ctor, &args);
            ctx.scratch_pop(args.len() + 1);
            release_value(ctx.heap_mut(), ctor);
            for a in args {
                release_value(ctx.heap_mut(), a);
            }
            frame!(ctx).stack.push(result?);
            Ok(Flow::Continue)
        }

        // ── Functions ────────────────────────────────────────────────────
        Op::CreateFunc => {
            let ix = read_lit_index(bytes, &mut ip);
            let inner_cp = code.inner[ix as usize];
            let v = create_function(ctx, inner_cp)?;
            frame!(ctx).stack.push(v);
            finish!()
        }

        // ── Variables ────────────────────────────────────────────────────
        Op::DeclVar => {
            let ix = read_lit_index(bytes, &mut ip);
            let name = const_prop_name(ctx, &code, ix);
            let env = frame!(ctx).base_env;
            env_declare_var(ctx, env, name)?;
            finish!()
        }
        Op::DeclLet | Op::DeclConst => {
            let ix = read_lit_index(bytes, &mut ip);
            let name = const_prop_name(ctx, &code, ix);
            let env = frame!(ctx).env;
            env_declare_lexical(ctx, env, name, op == Op::DeclLet)?;
            finish!()
        }
        Op::InitBinding => {
            let ix = read_lit_index(bytes, &mut ip);
            let name = const_prop_name(ctx, &code, ix);
            let v = pop(ctx);
            let env = frame!(ctx).env;
            env_init_binding(ctx, env, name, v)?;
            finish!()
        }
        Op::Resolve => {
            let ix = read_lit_index(bytes, &mut ip);
            let name = const_prop_name(ctx, &code, ix);
            let env = frame!(ctx).env;
            match env_resolve(ctx, env, name)? {
                Some(v) => {
                    frame!(ctx).stack.push(v);
                    finish!()
                }
                None => {
                    let shown = ctx.prop_name_text(name);
                    Err(ctx.throw(ErrorClass::ReferenceError, &format!("{shown} is not defined")))
                }
            }
        }
        Op::Assign => {
            let ix = read_lit_index(bytes, &mut ip);
            let name = const_prop_name(ctx, &code, ix);
            let v = pop(ctx);
            let env = frame!(ctx).env;
            let strict = code.is_strict();
            env_assign(ctx, env, name, v, strict)?;
            finish!()
        }
        Op::PushEnv => {
            let outer = frame!(ctx).env;
            let fresh = ctx.alloc_cell(HeapCell::Env(EnvCell::declarative(outer)))?;
            let f = frame!(ctx);
            f.env = fresh;
            f.env_depth += 1;
            finish!()
        }
        Op::PopEnv => {
            let env = frame!(ctx).env;
            let outer = ctx.heap_ref().env(env).outer;
            let f = frame!(ctx);
            f.env = outer;
            f.env_depth -= 1;
            finish!()
        }

        // ── Properties ───────────────────────────────────────────────────
        Op::GetProp => {
            let ix = read_lit_index(bytes, &mut ip);
            let name = const_prop_name(ctx, &code, ix);
            let base_v = pop(ctx);
            ctx.scratch_push(base_v);
            let result = ctx.get_value_property(base_v, name);
            ctx.scratch_pop(1);
            release_value(ctx.heap_mut(), base_v);
            frame!(ctx).stack.push(result?);
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
        Op::GetElem => {
            let (obj, key) = pop2(ctx);
            ctx.scratch_push(obj);
            ctx.scratch_push(key);
            let result = (|| {
                let name = ctx.to_property_name(key)?;
                ctx.get_value_property(obj, name)
            })();
            ctx.scratch_pop(2);
            release_value(ctx.heap_mut(), obj);
            release_value(ctx.heap_mut(), key);
            frame!(ctx).stack.push(result?);
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
        Op::SetProp => {
            let ix = read_lit_index(bytes, &mut ip);
            let name = const_prop_name(ctx, &code, ix);
            let value = pop(ctx);
            let obj = pop(ctx);
            ctx.scratch_push(obj);
            let strict = code.is_strict();
            let result = ctx.set_value_property(obj, name, value, strict);
            ctx.scratch_pop(1);
            release_value(ctx.heap_mut(), obj);
            result?;
            finish!()
        }
        Op::SetElem => {
            let value = pop(ctx);
            let (obj, key) = pop2(ctx);
            ctx.scratch_push(obj);
            ctx.scratch_push(key);
            let strict = code.is_strict();
            let result = (|| {
                let name = ctx.to_property_name(key)?;
                ctx.set_value_property(obj, name, value, strict)
            })();
            ctx.scratch_pop(2);
            release_value(ctx.heap_mut(), obj);
            release_value(ctx.heap_mut(), key);
            result?;
            finish!()
        }
        Op::DeleteProp | Op::DeleteElem => {
            let (obj, name) = if op == Op::DeleteProp {
                let ix = read_lit_index(bytes, &mut ip);
                let name = const_prop_name(ctx, &code, ix);
                (pop(ctx), name)
            } else {
                let (obj, key) = pop2(ctx);
                ctx.scratch_push(obj);
                let name = ctx.to_property_name(key);
                ctx.scratch_pop(1);
                release_value(ctx.heap_mut(), key);
                (obj, name?)
            };
            ctx.scratch_push(obj);
            let result = (|| {
                if !obj.is_object() {
                    return Ok(true);
                }
                let deleted = ctx.delete_property(obj.as_cp(), name)?;
                if !deleted && code.is_strict() {
                    return ctx
                        .throw_type_error("cannot delete property")
                        .map(|_: Value| false);
                }
                Ok(deleted)
            })();
            ctx.scratch_pop(1);
            release_value(ctx.heap_mut(), obj);
            frame!(ctx).stack.push(Value::boolean(result?));
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
        Op::DefineOwnProp => {
            let ix = read_lit_index(bytes, &mut ip);
            let name = const_prop_name(ctx, &code, ix);
            let value = pop(ctx);
            let obj = *frame!(ctx).stack.last().unwrap_or(&Value::UNDEFINED);
            let result =
                ctx.define_own_property(obj.as_cp(), name, PropertyDescriptor::data(value, true, true, true));
            release_value(ctx.heap_mut(), value);
            result?;
            finish!()
        }
        Op::DefineOwnElem => {
            let value = pop(ctx);
            let key = pop(ctx);
            let obj = *frame!(ctx).stack.last().unwrap_or(&Value::UNDEFINED);
            ctx.scratch_push(value);
            ctx.scratch_push(key);
            let result = (|| {
                let name = ctx.to_property_name(key)?;
                ctx.define_own_property(
                    obj.as_cp(),
                    name,
                    PropertyDescriptor::data(value, true, true, true),
                )
            })();
            ctx.scratch_pop(2);
            release_value(ctx.heap_mut(), value);
            release_value(ctx.heap_mut(), key);
            result?;
            finish!()
        }

        // ── Objects / arrays ─────────────────────────────────────────────
        Op::CreateObject => {
            let v = ctx.new_object()?;
            frame!(ctx).stack.push(v);
            finish!()
        }
        Op::CreateArray => {
            let v = ctx.new_array(Vec::new())?;
            frame!(ctx).stack.push(v);
            finish!()
        }
        Op::AppendElement => {
            let value = pop(ctx);
            let arr = *frame!(ctx).stack.last().unwrap_or(&Value::UNDEFINED);
            let len = match &ctx.heap_ref().object(arr.as_cp()).kind {
                ObjectKind::Array { elements } => elements.len() as u32,
                _ => 0,
            };
            ctx.set_value_property(arr, PropName::Index(len), value, false)?;
            finish!()
        }

        // ── Iteration / generators ───────────────────────────────────────
        Op::ForInInit => {
            let v = pop(ctx);
            ctx.scratch_push(v);
            let iter = for_in_iterator(ctx, v);
            ctx.scratch_pop(1);
            release_value(ctx.heap_mut(), v);
            frame!(ctx).stack.push(iter?);
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
        Op::ForOfInit => {
            let v = pop(ctx);
            ctx.scratch_push(v);
            let iter = for_of_iterator(ctx, v);
            ctx.scratch_pop(1);
            release_value(ctx.heap_mut(), v);
            frame!(ctx).stack.push(iter?);
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
        Op::IterStep => {
            let off = i16::from_le_bytes([bytes[ip], bytes[ip + 1]]);
            ip += 2;
            let iter = *frame!(ctx).stack.last().unwrap_or(&Value::UNDEFINED);
            let next = iterator_step(ctx, iter)?;
            match next {
                Some(v) => {
                    frame!(ctx).stack.push(v);
                    frame!(ctx).ip = ip;
                }
                None => {
                    let iter = pop(ctx);
                    release_value(ctx.heap_mut(), iter);
                    jump_to(ctx, op_start, off as i32)?;
                }
            }
            Ok(Flow::Continue)
        }
        Op::Yield => {
            // The generator frame is always the entry frame of its own
            // execute() activation, so suspension finishes this run.
            let v = pop(ctx);
            frame!(ctx).ip = ip;
            suspend_frame(ctx, SuspendKind::Yield);
            debug_assert_eq!(ctx.frames.len(), base);
            Ok(Flow::Finished(v))
        }

        Op::Ext => {
            let ext = OpExt::from_byte(bytes[ip]);
            ip += 1;
            run_ext(ctx, ext, &code, ip, base)
        }
    }
}

fn run_ext(
    ctx: &mut Context,
    ext: OpExt,
    code: &Rc<CompiledCode>,
    mut ip: usize,
    base: usize,
) -> Result<Flow, Thrown> {
    let bytes = &code.code;
    match ext {
        OpExt::Debugger => {
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
        OpExt::CallSpread => {
            let argc = bytes[ip] as usize;
            ip += 1;
            let mut args = pop_n(ctx, argc);
            let func = pop(ctx);
            frame!(ctx).ip = ip;
            // Expand the trailing iterable.
            let spread = args.pop().unwrap_or(Value::UNDEFINED);
            ctx.scratch_push(spread);
            let expansion = iterate_to_vec(ctx, spread);
            ctx.scratch_pop(1);
            release_value(ctx.heap_mut(), spread);
            match expansion {
                Ok(tail) => {
                    args.extend(tail);
                    dispatch_call(ctx, func, Value::UNDEFINED, args, base)
                }
                Err(t) => {
                    release_value(ctx.heap_mut(), func);
                    for a in args {
                        release_value(ctx.heap_mut(), a);
                    }
                    Err(t)
                }
            }
        }
        OpExt::DefineGetter | OpExt::DefineSetter => {
            let ix = read_lit_index(bytes, &mut ip);
            let name = const_prop_name(ctx, code, ix);
            let func = pop(ctx);
            let obj = *frame!(ctx).stack.last().unwrap_or(&Value::UNDEFINED);
            let mut desc = PropertyDescriptor {
                enumerable: Some(true),
                configurable: Some(true),
                ..Default::default()
            };
            if ext == OpExt::DefineGetter {
                desc.getter = Some(func.as_cp());
            } else {
                desc.setter = Some(func.as_cp());
            }
            let result = ctx.define_own_property(obj.as_cp(), name, desc);
            result?;
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
        OpExt::CreateRegexp => {
            let p = read_lit_index(bytes, &mut ip);
            let f = read_lit_index(bytes, &mut ip);
            let pattern = literal_value(ctx, code, p);
            let flags = literal_value(ctx, code, f);
            let proto = ctx.builtins.object_prototype();
            let obj = ctx.new_object_cell(ObjectCell::with_kind(proto, ObjectKind::Regexp))?;
            let src_name = ctx.prop_name_from_str("source");
            let src_name = ctx.own_name_copy(src_name)?;
            ctx.add_own_property(obj, Property::data_prop(src_name, pattern, PropFlags::none()))?;
            let flags_name = ctx.prop_name_from_str("flags");
            let flags_name = ctx.own_name_copy(flags_name)?;
            ctx.add_own_property(obj, Property::data_prop(flags_name, flags, PropFlags::none()))?;
            frame!(ctx).stack.push(Value::object(obj));
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
        OpExt::Await => {
            let v = pop(ctx);
            frame!(ctx).ip = ip;
            suspend_frame(ctx, SuspendKind::Await);
            debug_assert_eq!(ctx.frames.len(), base);
            Ok(Flow::Finished(v))
        }
        OpExt::IterClose => {
            let iter = pop(ctx);
            release_value(ctx.heap_mut(), iter);
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
        OpExt::DeleteIdent => {
            let ix = read_lit_index(bytes, &mut ip);
            let name = const_prop_name(ctx, code, ix);
            let env = frame!(ctx).env;
            let result = delete_binding(ctx, env, name)?;
            frame!(ctx).stack.push(Value::boolean(result));
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
        OpExt::PushWithEnv => {
            let v = pop(ctx);
            ctx.scratch_push(v);
            let obj = ctx.to_object(v);
            ctx.scratch_pop(1);
            release_value(ctx.heap_mut(), v);
            let obj = obj?;
            let outer = frame!(ctx).env;
            let fresh =
                ctx.alloc_cell(HeapCell::Env(EnvCell::object_bound(outer, obj.as_cp())))?;
            let f = frame!(ctx);
            f.env = fresh;
            f.env_depth += 1;
            frame!(ctx).ip = ip;
            Ok(Flow::Continue)
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch helpers
// ---------------------------------------------------------------------------

#[inline]
fn pop(ctx: &mut Context) -> Value {
    frame!(ctx).stack.pop().unwrap_or(Value::UNDEFINED)
}

#[inline]
fn pop2(ctx: &mut Context) -> (Value, Value) {
    let b = pop(ctx);
    let a = pop(ctx);
    (a, b)
}

fn pop_n(ctx: &mut Context, n: usize) -> Vec<Value> {
    let f = frame!(ctx);
    let at = f.stack.len().saturating_sub(n);
    f.stack.split_off(at)
}

fn jump_to(ctx: &mut Context, op_start: usize, offset: i32) -> Completion<()> {
    if offset <= 0 {
        // Back branch: give the embedder's poll hook a chance to abort.
        ctx.back_branches += 1;
        if ctx.back_branches >= ctx.options.poll_interval {
            ctx.back_branches = 0;
            if let Some(hook) = &mut ctx.poll_hook {
                if hook() {
                    return Err(Thrown::Terminated);
                }
            }
        }
    }
    let f = frame!(ctx);
    f.ip = (op_start as i64 + offset as i64) as usize;
    Ok(())
}

fn cond_jump(
    ctx: &mut Context,
    op_start: usize,
    next_ip: usize,
    offset: i32,
    when_true: bool,
) -> Result<Flow, Thrown> {
    let v = pop(ctx);
    let truthy = ctx.to_boolean(v);
    release_value(ctx.heap_mut(), v);
    if truthy == when_true {
        jump_to(ctx, op_start, offset)?;
    } else {
        frame!(ctx).ip = next_ip;
    }
    Ok(Flow::Continue)
}

/// Push a value for a constant-table entry (string or interned number).
fn literal_value(ctx: &mut Context, code: &Rc<CompiledCode>, ix: u16) -> Value {
    let cp = code.consts[ix as usize];
    let number = match ctx.heap_ref().get(cp) {
        HeapCell::Str(_) => None,
        HeapCell::Number(n) => Some(n.value),
        other => panic!("constant table holds a {}", other.kind_name()),
    };
    match number {
        None => {
            let v = Value::string(cp);
            acquire_value(ctx.heap_mut(), v);
            v
        }
        Some(n) => match Value::small_int_from_f64(n) {
            Some(v) => v,
            None => {
                let v = Value::number_box(cp);
                acquire_value(ctx.heap_mut(), v);
                v
            }
        },
    }
}

/// Property key for a constant-table string.
fn const_prop_name(ctx: &mut Context, code: &Rc<CompiledCode>, ix: u16) -> PropName {
    let cp = code.consts[ix as usize];
    match &ctx.heap_ref().string(cp).data {
        StringData::Magic(id) => PropName::Magic(*id),
        StringData::Index(n) => PropName::Index(*n),
        StringData::Utf8(_) => PropName::Str(cp),
    }
}

fn typeof_name(ctx: &Context, v: Value) -> &'static str {
    if v.is_undefined() {
        "undefined"
    } else if v.is_null() {
        "object"
    } else if v.is_boolean() {
        "boolean"
    } else if v.is_number() {
        "number"
    } else if v.is_string() {
        "string"
    } else if v.is_symbol() {
        "symbol"
    } else if v.is_object() && ctx.heap_ref().object(v.as_cp()).is_callable() {
        "function"
    } else {
        "object"
    }
}

fn instance_of(ctx: &mut Context, a: Value, b: Value) -> Completion<bool> {
    if !b.is_object() || !ctx.heap_ref().object(b.as_cp()).is_callable() {
        return ctx
            .throw_type_error("right-hand side of 'instanceof' is not callable")
            .map(|_: Value| false);
    }
    if !a.is_object() {
        return Ok(false);
    }
    let proto = ctx.get_value_property_str(b, "prototype")?;
    if !proto.is_object() {
        release_value(ctx.heap_mut(), proto);
        return ctx
            .throw_type_error("prototype is not an object")
            .map(|_: Value| false);
    }
    let target = proto.as_cp();
    let mut cur = ctx.heap_ref().object(a.as_cp()).proto;
    let mut hops = 0;
    while !cur.is_null() && hops < 10_000 {
        if cur == target {
            return Ok(true);
        }
        cur = ctx.heap_ref().object(cur).proto;
        hops += 1;
    }
    Ok(false)
}

/// Close over the current frame: function object creation.
fn create_function(ctx: &mut Context, code_cp: Cp) -> Completion {
    let code = ctx.heap_ref().code(code_cp);
    let (env, this) = {
        let f = frame!(ctx);
        (f.env, f.this)
    };
    let lexical_this = if code.is_arrow() {
        acquire_value(ctx.heap_mut(), this);
        this
    } else {
        Value::EMPTY
    };
    let proto = ctx.builtins.function_prototype();
    let cell = ObjectCell::with_kind(
        proto,
        ObjectKind::Function { code: code_cp, env, lexical_this },
    );
    let cp = ctx.new_object_cell(cell)?;
    Ok(Value::object(cp))
}

/// Call instruction body: script callees push a frame and stay in the
/// loop; everything else resolves immediately.
fn dispatch_call(
    ctx: &mut Context,
    func: Value,
    this: Value,
    args: Vec<Value>,
    _base: usize,
) -> Result<Flow, Thrown> {
    let release_all = |ctx: &mut Context, func: Value, this: Value, args: &[Value]| {
        release_value(ctx.heap_mut(), func);
        release_value(ctx.heap_mut(), this);
        for &a in args {
            release_value(ctx.heap_mut(), a);
        }
    };

    if !func.is_object() {
        let err = not_a_function(ctx, func);
        release_all(ctx, func, this, &args);
        return Err(err);
    }
    let cp = func.as_cp();
    let is_plain_script = matches!(
        &ctx.heap_ref().object(cp).kind,
        ObjectKind::Function { code, .. }
            if {
                let c = ctx.heap_ref().code(*code);
                !c.is_generator() && !c.is_async()
            }
    );

    if is_plain_script {
        let (code_cp, _) = match &ctx.heap_ref().object(cp).kind {
            ObjectKind::Function { code, env, .. } => (*code, *env),
            _ => unreachable!(),
        };
        if ctx.frames.len() >= MAX_CALL_DEPTH {
            let err = ctx.throw(ErrorClass::RangeError, "Maximum call stack size exceeded");
            release_all(ctx, func, this, &args);
            return Err(err);
        }
        let code = ctx.heap_ref().code(code_cp);
        for &a in &args {
            ctx.scratch_push(a);
        }
        ctx.scratch_push(func);
        ctx.scratch_push(this);
        let prepared = (|| {
            let env = function_env(ctx, cp)?;
            let bound = bind_this(ctx, cp, &code, this)?;
            make_frame(ctx, code_cp, env, bound, &args, Cp::NULL)
        })();
        ctx.scratch_pop(args.len() + 2);
        release_all(ctx, func, this, &args);
        let frame = prepared?;
        ctx.frames.push(frame);
        return Ok(Flow::Continue);
    }

    // Native, bound and generator callees resolve through call_value.
    for &a in &args {
        ctx.scratch_push(a);
    }
    ctx.scratch_push(func);
    ctx.scratch_push(this);
    let result = call_value(ctx, func, this, &args);
    ctx.scratch_pop(args.len() + 2);
    release_all(ctx, func, this, &args);
    frame!(ctx).stack.push(result?);
    Ok(Flow::Continue)
}

fn delete_binding(ctx: &mut Context, mut env: Cp, name: PropName) -> Completion<bool> {
    while !env.is_null() {
        match ctx.heap_ref().env(env).kind {
            EnvKind::Declarative => {
                if crate::object::find_env_binding(ctx.heap_ref(), env, name).is_some() {
                    return Ok(false);
                }
            }
            EnvKind::ObjectBound => {
                let obj = ctx.heap_ref().env(env).bound_object;
                if crate::object::find_own_prop(ctx.heap_ref(), obj, name).is_some() {
                    return ctx.delete_property(obj, name);
                }
            }
        }
        env = ctx.heap_ref().env(env).outer;
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

/// for-in: snapshot the enumerable string keys (own chain first, then the
/// prototype chain, shadowed names skipped) into an array iterator.
fn for_in_iterator(ctx: &mut Context, v: Value) -> Completion {
    let mut keys: Vec<Value> = Vec::new();
    if !v.is_nullish() {
        let obj_v = ctx.to_object(v)?;
        let mut cur = obj_v.as_cp();
        let mut seen: Vec<String> = Vec::new();
        while !cur.is_null() {
            for name in ctx.own_keys(cur)? {
                let text = ctx.prop_name_text(name);
                if seen.contains(&text) {
                    continue;
                }
                seen.push(text.clone());
                let s = ctx.new_string_value(&text)?;
                ctx.scratch_push(s);
                keys.push(s);
            }
            cur = ctx.heap_ref().object(cur).proto;
        }
        ctx.scratch_pop(keys.len());
    }
    let arr = ctx.new_array(keys)?;
    ctx.scratch_push(arr);
    let iter = make_array_iterator(ctx, arr, IterKind::ArrayValues);
    ctx.scratch_pop(1);
    iter
}

fn make_array_iterator(ctx: &mut Context, target: Value, kind: IterKind) -> Completion {
    acquire_value(ctx.heap_mut(), target);
    let proto = ctx.builtins.object_prototype();
    let cell = ObjectCell::with_kind(proto, ObjectKind::Iterator { target, index: 0, kind });
    let cp = ctx.new_object_cell(cell)?;
    Ok(Value::object(cp))
}

fn for_of_iterator(ctx: &mut Context, v: Value) -> Completion {
    if v.is_string() {
        return make_array_iterator(ctx, v, IterKind::StringChars);
    }
    if v.is_object() {
        enum Shape {
            Array,
            SelfIterating,
            Other,
        }
        let shape = match &ctx.heap_ref().object(v.as_cp()).kind {
            ObjectKind::Array { .. } => Shape::Array,
            ObjectKind::Generator { .. } | ObjectKind::Iterator { .. } => Shape::SelfIterating,
            _ => Shape::Other,
        };
        match shape {
            Shape::Array => return make_array_iterator(ctx, v, IterKind::ArrayValues),
            Shape::SelfIterating => {
                acquire_value(ctx.heap_mut(), v);
                return Ok(v);
            }
            Shape::Other => {
                // Anything exposing a callable `next` is accepted as an
                // iterator directly.
                let next = ctx.get_value_property_str(v, "next")?;
                let callable =
                    next.is_object() && ctx.heap_ref().object(next.as_cp()).is_callable();
                release_value(ctx.heap_mut(), next);
                if callable {
                    acquire_value(ctx.heap_mut(), v);
                    return Ok(v);
                }
            }
        }
    }
    let shown = ctx.to_display_string(v).unwrap_or_else(|_| "value".into());
    Err(ctx.throw(ErrorClass::TypeError, &format!("{shown} is not iterable")))
}

/// Advance an iterator; `None` means exhausted. The returned value is owned
/// by the caller.
pub fn iterator_step(ctx: &mut Context, iter: Value) -> Completion<Option<Value>> {
    if !iter.is_object() {
        return ctx.throw_type_error("iterator is not an object").map(|_: Value| None);
    }
    let cp = iter.as_cp();
    enum Plan {
        Internal(Value, u32, IterKind),
        Generator,
        Protocol,
    }
    let plan = match &ctx.heap_ref().object(cp).kind {
        ObjectKind::Iterator { target, index, kind } => Plan::Internal(*target, *index, *kind),
        ObjectKind::Generator { .. } => Plan::Generator,
        _ => Plan::Protocol,
    };
    match plan {
        Plan::Internal(target, index, kind) => {
            let next = match kind {
                IterKind::ArrayValues | IterKind::ArrayKeys | IterKind::ArrayEntries => {
                    let elem = match &ctx.heap_ref().object(target.as_cp()).kind {
                        ObjectKind::Array { elements } => elements.get(index as usize).copied(),
                        _ => None,
                    };
                    elem.map(|v| {
                        let v = if v.is_empty() { Value::UNDEFINED } else { v };
                        acquire_value(ctx.heap_mut(), v);
                        v
                    })
                }
                IterKind::StringChars => {
                    let text = ctx.heap_ref().string(target.as_cp()).flatten().into_owned();
                    match text.chars().nth(index as usize) {
                        Some(c) => Some(ctx.new_string_value(&c.to_string())?),
                        None => None,
                    }
                }
            };
            if next.is_some() {
                if let ObjectKind::Iterator { index, .. } =
                    &mut ctx.heap_mut().object_mut(cp).kind
                {
                    *index += 1;
                }
            }
            Ok(next)
        }
        Plan::Generator => {
            let (value, done) = resume_generator(ctx, cp, Value::UNDEFINED, false)?;
            if done {
                release_value(ctx.heap_mut(), value);
                Ok(None)
            } else {
                Ok(Some(value))
            }
        }
        Plan::Protocol => {
            let next_fn = ctx.get_value_property_str(iter, "next")?;
            let result = call_value(ctx, next_fn, iter, &[]);
            release_value(ctx.heap_mut(), next_fn);
            let result = result?;
            ctx.scratch_push(result);
            let done_v = ctx.get_value_property_str(result, "done");
            let out = match done_v {
                Ok(d) => {
                    let done = ctx.to_boolean(d);
                    release_value(ctx.heap_mut(), d);
                    if done {
                        Ok(None)
                    } else {
                        ctx.get_value_property_str(result, "value").map(Some)
                    }
                }
                Err(t) => Err(t),
            };
            ctx.scratch_pop(1);
            release_value(ctx.heap_mut(), result);
            out
        }
    }
}

fn iterate_to_vec(ctx: &mut Context, v: Value) -> Completion<Vec<Value>> {
    let iter = for_of_iterator(ctx, v)?;
    ctx.scratch_push(iter);
    let mut out = Vec::new();
    let mut pushed = 1usize;
    let result = loop {
        match iterator_step(ctx, iter) {
            Ok(Some(item)) => {
                ctx.scratch_push(item);
                pushed += 1;
                out.push(item);
            }
            Ok(None) => break Ok(()),
            Err(t) => break Err(t),
        }
    };
    ctx.scratch_pop(pushed);
    release_value(ctx.heap_mut(), iter);
    match result {
        Ok(()) => Ok(out),
        Err(t) => {
            for item in out {
                release_value(ctx.heap_mut(), item);
            }
            Err(t)
        }
    }
}

// ---------------------------------------------------------------------------
// Generators
// ---------------------------------------------------------------------------

/// Calling a generator (or async) function builds the suspended state
/// without running any of the body.
fn call_generator_function(
    ctx: &mut Context,
    func_cp: Cp,
    this: Value,
    args: &[Value],
    is_async: bool,
) -> Completion {
    let code_cp = match &ctx.heap_ref().object(func_cp).kind {
        ObjectKind::Function { code, .. } => *code,
        _ => unreachable!(),
    };
    let code = ctx.heap_ref().code(code_cp);
    let env = function_env(ctx, func_cp)?;
    let this = bind_this(ctx, func_cp, &code, this)?;

    let mut regs = vec![Value::UNDEFINED; code.reg_count as usize];
    let argc = code.arg_count as usize;
    for i in 0..argc.min(args.len()) {
        acquire_value(ctx.heap_mut(), args[i]);
        regs[i] = args[i];
    }
    acquire_value(ctx.heap_mut(), this);

    let state = GeneratorState { code: code_cp, ip: 0, regs, stack: Vec::new(), env, this };
    let proto = ctx.builtins.generator_prototype();
    let cell = ObjectCell::with_kind(
        proto,
        ObjectKind::Generator { status: GeneratorStatus::Suspended, state: Some(Box::new(state)) },
    );
    let gen = ctx.new_object_cell(cell)?;

    if is_async {
        return builtins::async_function_start(ctx, gen);
    }
    Ok(Value::object(gen))
}

/// Reinstall a suspended generator frame and run it to its next suspension
/// or completion. Returns (value, done).
pub fn resume_generator(
    ctx: &mut Context,
    gen: Cp,
    input: Value,
    throw_in: bool,
) -> Completion<(Value, bool)> {
    let status = match &ctx.heap_ref().object(gen).kind {
        ObjectKind::Generator { status, .. } => Some(*status),
        _ => None,
    };
    match status {
        None => {
            return ctx.throw_type_error("not a generator object").map(|v: Value| (v, true))
        }
        Some(GeneratorStatus::Done) => return Ok((Value::UNDEFINED, true)),
        Some(GeneratorStatus::Running) => {
            return ctx
                .throw_type_error("generator is already running")
                .map(|v: Value| (v, true));
        }
        Some(GeneratorStatus::Suspended) => {}
    }
    let state = match &mut ctx.heap_mut().object_mut(gen).kind {
        ObjectKind::Generator { status, state } => {
            *status = GeneratorStatus::Running;
            state.take().unwrap_or_else(|| unreachable!("suspended without state"))
        }
        _ => unreachable!(),
    };

    if ctx.frames.len() >= MAX_CALL_DEPTH {
        return Err(ctx.throw(ErrorClass::RangeError, "Maximum call stack size exceeded"));
    }

    let resumed_mid_body = state.ip != 0;
    let code = ctx.heap_ref().code(state.code);
    let mut frame = Frame {
        code_cp: state.code,
        code,
        ip: state.ip,
        regs: state.regs,
        stack: state.stack,
        env: state.env,
        base_env: state.env,
        env_depth: 0,
        this: state.this,
        gen_obj: gen,
    };
    if resumed_mid_body {
        // The yield expression's value is whatever next() received.
        acquire_value(ctx.heap_mut(), input);
        frame.stack.push(input);
    }
    let base = ctx.frames.len();
    ctx.frames.push(frame);

    if throw_in {
        // Route the injected exception through the generator's handlers.
        acquire_value(ctx.heap_mut(), input);
        match unwind(ctx, base, Thrown::Value(input)) {
            Ok(()) => {}
            Err(t) => {
                finish_generator(ctx, gen);
                return Err(t);
            }
        }
    }

    ctx.suspended = None;
    let result = execute(ctx, base);
    match result {
        Ok(v) => {
            let was_yield = ctx.suspended.take().is_some();
            if !was_yield {
                finish_generator(ctx, gen);
                return Ok((v, true));
            }
            Ok((v, false))
        }
        Err(t) => {
            finish_generator(ctx, gen);
            Err(t)
        }
    }
}

/// Yield/await: serialise the running frame back into its generator object.
fn suspend_frame(ctx: &mut Context, kind: SuspendKind) {
    let frame = ctx
        .frames
        .pop()
        .unwrap_or_else(|| unreachable!("suspend without a frame"));
    debug_assert!(!frame.gen_obj.is_null(), "suspend outside a generator frame");
    let state = GeneratorState {
        code: frame.code_cp,
        ip: frame.ip,
        regs: frame.regs,
        stack: frame.stack,
        env: frame.env,
        this: frame.this,
    };
    let gen = frame.gen_obj;
    if let ObjectKind::Generator { status, state: slot } = &mut ctx.heap_mut().object_mut(gen).kind
    {
        *status = GeneratorStatus::Suspended;
        *slot = Some(Box::new(state));
    }
    let _ = ctx.heap_mut().try_recharge(gen);
    ctx.suspended = Some(kind);
}

fn finish_generator(ctx: &mut Context, gen: Cp) {
    let released = {
        let obj = ctx.heap_mut().object_mut(gen);
        match &mut obj.kind {
            ObjectKind::Generator { status, state } => {
                *status = GeneratorStatus::Done;
                state.take()
            }
            _ => None,
        }
    };
    if let Some(s) = released {
        release_value(ctx.heap_mut(), s.this);
        for v in s.regs {
            release_value(ctx.heap_mut(), v);
        }
        for v in s.stack {
            release_value(ctx.heap_mut(), v);
        }
    }
}

// ---------------------------------------------------------------------------
// Arithmetic helpers
// ---------------------------------------------------------------------------

/// `+`: small-int fast path, string concatenation after ToPrimitive, IEEE
/// addition otherwise.
fn op_add(ctx: &mut Context, a: Value, b: Value) -> Completion {
    if a.is_small_int() && b.is_small_int() {
        match a.as_small_int().checked_add(b.as_small_int()) {
            Some(r) => return Ok(Value::small_int(r)),
            None => {
                return ctx.number_value(a.as_small_int() as f64 + b.as_small_int() as f64)
            }
        }
    }
    let pa = ctx.to_primitive(a, crate::context::PreferredType::Number)?;
    ctx.scratch_push(pa);
    let pb = ctx.to_primitive(b, crate::context::PreferredType::Number);
    ctx.scratch_pop(1);
    let pb = match pb {
        Ok(v) => v,
        Err(t) => {
            release_value(ctx.heap_mut(), pa);
            return Err(t);
        }
    };
    let result = (|| {
        if pa.is_string() || pb.is_string() {
            let sa = ctx.to_display_string(pa)?;
            let sb = ctx.to_display_string(pb)?;
            let mut joined = String::with_capacity(sa.len() + sb.len());
            joined.push_str(&sa);
            joined.push_str(&sb);
            return ctx.new_string_value(&joined);
        }
        let x = ctx.to_number(pa)?;
        let y = ctx.to_number(pb)?;
        ctx.number_value(x + y)
    })();
    release_value(ctx.heap_mut(), pa);
    release_value(ctx.heap_mut(), pb);
    result
}

fn binary_op(
    ctx: &mut Context,
    ip_after: usize,
    f: fn(&mut Context, Value, Value) -> Completion,
) -> Result<Flow, Thrown> {
    let (a, b) = pop2(ctx);
    ctx.scratch_push(a);
    ctx.scratch_push(b);
    let result = f(ctx, a, b);
    ctx.scratch_pop(2);
    release_value(ctx.heap_mut(), a);
    release_value(ctx.heap_mut(), b);
    frame!(ctx).stack.push(result?);
    frame!(ctx).ip = ip_after;
    Ok(Flow::Continue)
}

fn numeric_op(ctx: &mut Context, ip_after: usize, f: fn(f64, f64) -> f64) -> Result<Flow, Thrown> {
    let (a, b) = pop2(ctx);
    // Small-int fast path falls back to doubles on overflow.
    if a.is_small_int() && b.is_small_int() {
        let x = a.as_small_int() as f64;
        let y = b.as_small_int() as f64;
        let r = f(x, y);
        let out = ctx.number_value(r)?;
        frame!(ctx).stack.push(out);
        frame!(ctx).ip = ip_after;
        return Ok(Flow::Continue);
    }
    ctx.scratch_push(a);
    ctx.scratch_push(b);
    let result = (|| {
        let x = ctx.to_number(a)?;
        let y = ctx.to_number(b)?;
        ctx.number_value(f(x, y))
    })();
    ctx.scratch_pop(2);
    release_value(ctx.heap_mut(), a);
    release_value(ctx.heap_mut(), b);
    frame!(ctx).stack.push(result?);
    frame!(ctx).ip = ip_after;
    Ok(Flow::Continue)
}

fn int32_op(ctx: &mut Context, ip_after: usize, f: fn(i32, i32) -> i32) -> Result<Flow, Thrown> {
    let (a, b) = pop2(ctx);
    ctx.scratch_push(a);
    ctx.scratch_push(b);
    let result = (|| {
        let x = ctx.to_int32(a)?;
        let y = ctx.to_int32(b)?;
        Ok(Value::small_int(f(x, y)))
    })();
    ctx.scratch_pop(2);
    release_value(ctx.heap_mut(), a);
    release_value(ctx.heap_mut(), b);
    frame!(ctx).stack.push(result?);
    frame!(ctx).ip = ip_after;
    Ok(Flow::Continue)
}

fn unary_numeric(ctx: &mut Context, ip_after: usize, f: fn(f64) -> f64) -> Result<Flow, Thrown> {
    let v = pop(ctx);
    ctx.scratch_push(v);
    let result = (|| {
        let n = ctx.to_number(v)?;
        ctx.number_value(f(n))
    })();
    ctx.scratch_pop(1);
    release_value(ctx.heap_mut(), v);
    frame!(ctx).stack.push(result?);
    frame!(ctx).ip = ip_after;
    Ok(Flow::Continue)
}
