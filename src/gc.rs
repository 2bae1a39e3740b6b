/// Garbage collector — stop-the-world mark & sweep
///
/// Traced kinds: objects, environments, property pairs, compiled code.
/// Refcounted kinds (strings, symbols, number boxes) are never swept here;
/// they die when the last reference is released, and the only job of the
/// sweep is to release the references dead objects still hold.
///
/// ROOTS
///   global object · context error slot · built-in singletons · every active
///   frame (registers, operand stack, this, environment, code) · queued
///   microtask jobs · API-acquired values · the scratch stack of values that
///   are mid-construction.
///
/// Marking is a breadth-first walk over the cp fields each cell kind owns.
/// Sweeping finalises dead cells (releasing refcounts they hold — without
/// allocating) and returns their slots to the free list.

use std::time::Instant;

use crate::context::{release_value, Context, Job};
use crate::heap::{Cp, Heap, HeapCell};
use crate::object::{ObjectKind, PromiseReaction, PropData, PropName, PromiseState};
use crate::value::Value;

#[derive(Debug, Default, Clone)]
pub struct GcStats {
    pub collections: u64,
    pub last_marked: usize,
    pub last_swept: usize,
    pub last_pause_us: u64,
    pub total_pause_us: u64,
}

impl GcStats {
    pub fn print(&self) {
        println!("=== GC Statistics ===");
        println!("  Collections:  {}", self.collections);
        println!("  Last marked:  {}", self.last_marked);
        println!("  Last swept:   {}", self.last_swept);
        println!("  Last pause:   {} µs", self.last_pause_us);
        println!("  Total pause:  {} µs", self.total_pause_us);
    }
}

/// Work list of traced cells waiting to have their fields scanned.
struct Marker {
    queue: Vec<Cp>,
    marked: usize,
}

impl Marker {
    fn new() -> Self {
        Marker { queue: Vec::new(), marked: 0 }
    }

    /// Queue a traced cell if it has not been seen yet.
    fn push_cp(&mut self, heap: &mut Heap, cp: Cp) {
        if cp.is_null() {
            return;
        }
        match heap.get(cp) {
            HeapCell::Object(_) | HeapCell::Env(_) | HeapCell::Pair(_) | HeapCell::Code(_) => {
                if heap.set_mark(cp) {
                    self.marked += 1;
                    self.queue.push(cp);
                }
            }
            // Refcounted kinds keep themselves alive.
            HeapCell::Str(_) | HeapCell::Number(_) | HeapCell::Symbol(_) => {}
        }
    }

    fn push_value(&mut self, heap: &mut Heap, v: Value) {
        if v.is_object() {
            self.push_cp(heap, v.without_error_flag().as_cp());
        }
    }
}

/// Full collection. Returns the number of cells swept.
pub fn collect(ctx: &mut Context) -> usize {
    let start = Instant::now();
    ctx.heap.clear_marks();

    let mut marker = Marker::new();
    mark_roots(ctx, &mut marker);

    while let Some(cp) = marker.queue.pop() {
        mark_fields(&mut ctx.heap, cp, &mut marker);
    }

    let swept = sweep(&mut ctx.heap);

    let pause = start.elapsed().as_micros() as u64;
    ctx.gc_stats.collections += 1;
    ctx.gc_stats.last_marked = marker.marked;
    ctx.gc_stats.last_swept = swept;
    ctx.gc_stats.last_pause_us = pause;
    ctx.gc_stats.total_pause_us += pause;
    swept
}

fn mark_roots(ctx: &mut Context, marker: &mut Marker) {
    let heap = &mut ctx.heap;
    marker.push_cp(heap, ctx.global);
    marker.push_value(heap, ctx.error_slot);

    for &cp in &ctx.builtins.singletons {
        marker.push_cp(heap, cp);
    }
    for frame in &ctx.frames {
        marker.push_cp(heap, frame.code_cp);
        marker.push_cp(heap, frame.env);
        marker.push_cp(heap, frame.base_env);
        marker.push_cp(heap, frame.gen_obj);
        marker.push_value(heap, frame.this);
        for &v in &frame.regs {
            marker.push_value(heap, v);
        }
        for &v in &frame.stack {
            marker.push_value(heap, v);
        }
    }
    for job in &ctx.jobs {
        match job {
            Job::Call { callback, args } => {
                marker.push_cp(heap, *callback);
                for &v in args {
                    marker.push_value(heap, v);
                }
            }
            Job::Reaction { handler, next, value, .. } => {
                marker.push_cp(heap, *handler);
                marker.push_cp(heap, *next);
                marker.push_value(heap, *value);
            }
            Job::AsyncStep { gen, promise, value, .. } => {
                marker.push_cp(heap, *gen);
                marker.push_cp(heap, *promise);
                marker.push_value(heap, *value);
            }
        }
    }
    for &v in &ctx.api_roots {
        marker.push_value(heap, v);
    }
    for &v in &ctx.scratch {
        marker.push_value(heap, v);
    }
}

fn mark_fields(heap: &mut Heap, cp: Cp, marker: &mut Marker) {
    // Collect the outgoing edges first; the borrow on the cell must end
    // before the marker mutates mark bits.
    let mut cps: Vec<Cp> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    match heap.get(cp) {
        HeapCell::Object(obj) => {
            cps.push(obj.proto);
            cps.push(obj.props);
            match &obj.kind {
                ObjectKind::General | ObjectKind::Regexp => {}
                ObjectKind::Array { elements } => values.extend(elements.iter().copied()),
                ObjectKind::Function { code, env, lexical_this } => {
                    cps.push(*code);
                    cps.push(*env);
                    values.push(*lexical_this);
                }
                ObjectKind::NativeFunction { payload, .. } => cps.push(*payload),
                ObjectKind::BoundFunction { target, bound_this, bound_args } => {
                    cps.push(*target);
                    values.push(*bound_this);
                    values.extend(bound_args.iter().copied());
                }
                ObjectKind::Boxed { primitive, .. } => values.push(*primitive),
                ObjectKind::ErrorObject { .. } => {}
                ObjectKind::Generator { state, .. } => {
                    if let Some(s) = state {
                        cps.push(s.code);
                        cps.push(s.env);
                        values.push(s.this);
                        values.extend(s.regs.iter().copied());
                        values.extend(s.stack.iter().copied());
                    }
                }
                ObjectKind::Iterator { target, .. } => values.push(*target),
                ObjectKind::Promise { state, reactions } => {
                    match state {
                        PromiseState::Fulfilled(v) | PromiseState::Rejected(v) => {
                            values.push(*v)
                        }
                        PromiseState::Pending => {}
                    }
                    for r in reactions {
                        match r {
                            PromiseReaction::Then { on_fulfilled, on_rejected, next } => {
                                cps.push(*on_fulfilled);
                                cps.push(*on_rejected);
                                cps.push(*next);
                            }
                            PromiseReaction::AsyncContinue { gen, promise } => {
                                cps.push(*gen);
                                cps.push(*promise);
                            }
                        }
                    }
                }
            }
        }
        HeapCell::Pair(pair) => {
            cps.push(pair.next);
            for slot in pair.slots.iter().flatten() {
                match slot.data {
                    PropData::Value(v) => values.push(v),
                    PropData::Accessor { getter, setter } => {
                        cps.push(getter);
                        cps.push(setter);
                    }
                }
            }
        }
        HeapCell::Env(env) => {
            cps.push(env.outer);
            cps.push(env.props);
            cps.push(env.bound_object);
        }
        HeapCell::Code(code) => {
            // Constant-table entries are pool-held refcounted literals; only
            // the nested code blocks are traced.
            cps.extend(code.inner.iter().copied());
        }
        HeapCell::Str(_) | HeapCell::Number(_) | HeapCell::Symbol(_) => {}
    }

    for cp in cps {
        marker.push_cp(heap, cp);
    }
    for v in values {
        marker.push_value(heap, v);
    }
}

/// Free every unmarked traced cell, releasing the refcounted references it
/// owned. Two phases so finalisation never touches a half-swept heap.
fn sweep(heap: &mut Heap) -> usize {
    let mut dead: Vec<Cp> = Vec::new();
    let mut releases: Vec<Value> = Vec::new();
    let mut name_releases: Vec<Cp> = Vec::new();

    for (cp, marked) in heap.live_slots() {
        if marked {
            continue;
        }
        match heap.get(cp) {
            HeapCell::Object(obj) => {
                match &obj.kind {
                    ObjectKind::Array { elements } => releases.extend(elements.iter().copied()),
                    ObjectKind::Function { lexical_this, .. } => releases.push(*lexical_this),
                    ObjectKind::BoundFunction { bound_this, bound_args, .. } => {
                        releases.push(*bound_this);
                        releases.extend(bound_args.iter().copied());
                    }
                    ObjectKind::Boxed { primitive, .. } => releases.push(*primitive),
                    ObjectKind::Generator { state: Some(s), .. } => {
                        releases.push(s.this);
                        releases.extend(s.regs.iter().copied());
                        releases.extend(s.stack.iter().copied());
                    }
                    ObjectKind::Iterator { target, .. } => releases.push(*target),
                    ObjectKind::Promise { state, .. } => match state {
                        PromiseState::Fulfilled(v) | PromiseState::Rejected(v) => {
                            releases.push(*v)
                        }
                        PromiseState::Pending => {}
                    },
                    _ => {}
                }
                dead.push(cp);
            }
            HeapCell::Pair(pair) => {
                for slot in pair.slots.iter().flatten() {
                    match slot.name {
                        PropName::Str(s) => name_releases.push(s),
                        PropName::Symbol(s) => name_releases.push(s),
                        PropName::Magic(_) | PropName::Index(_) => {}
                    }
                    if let PropData::Value(v) = slot.data {
                        releases.push(v);
                    }
                }
                dead.push(cp);
            }
            HeapCell::Env(_) | HeapCell::Code(_) => dead.push(cp),
            HeapCell::Str(_) | HeapCell::Number(_) | HeapCell::Symbol(_) => {}
        }
    }

    let swept = dead.len();
    for cp in dead {
        heap.free(cp);
    }
    for v in releases {
        release_value(heap, v);
    }
    for cp in name_releases {
        release_name_cp(heap, cp);
    }
    swept
}

fn release_name_cp(heap: &mut Heap, cp: Cp) {
    match heap.get_mut(cp) {
        HeapCell::Str(s) => {
            s.refs = s.refs.saturating_sub(1);
            if s.refs == 0 {
                heap.free(cp);
            }
        }
        HeapCell::Symbol(s) => {
            s.refs = s.refs.saturating_sub(1);
            if s.refs == 0 {
                heap.free(cp);
            }
        }
        _ => {}
    }
}
