/// Snapshot round trips through the filesystem, the way the CLI uses them.
use quark::context::Context;
use quark::parser::ParseFlags;
use quark::snapshot;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn display(ctx: &mut Context, v: quark::Value) -> String {
    ctx.to_display_string(v).expect("displayable")
}

// ─── Round trips ──────────────────────────────────────────────────────────────

#[test]
fn test_save_load_through_a_file() {
    let mut ctx = Context::with_default_options();
    let code = ctx
        .parse(
            "function fib(n) { return n < 2 ? n : fib(n - 1) + fib(n - 2); } fib(10);",
            ParseFlags::default(),
        )
        .expect("parse");
    let image = snapshot::save(&ctx, code);

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("fib.qks");
    std::fs::write(&path, &image).expect("write snapshot");
    let bytes = std::fs::read(&path).expect("read snapshot");

    let mut fresh = Context::with_default_options();
    let loaded = snapshot::load(&mut fresh, &bytes).expect("load");
    let result = fresh.run(loaded).expect("run");
    assert_eq!(display(&mut fresh, result), "55");
}

#[test]
fn test_literals_reintern_on_load() {
    let mut ctx = Context::with_default_options();
    let code = ctx
        .parse("var greeting = \"shared text\"; greeting + \"!\";", ParseFlags::default())
        .expect("parse");
    let image = snapshot::save(&ctx, code);

    let mut fresh = Context::with_default_options();
    // Pre-intern the same literal so the loader has to find, not create.
    let pre = fresh
        .parse("\"shared text\";", ParseFlags::default())
        .expect("parse");
    let _ = fresh.run(pre);

    let loaded = snapshot::load(&mut fresh, &image).expect("load");
    let result = fresh.run(loaded).expect("run");
    assert_eq!(display(&mut fresh, result), "shared text!");
}

#[test]
fn test_snapshot_matches_direct_execution() {
    let src = "var total = 0; \
               for (var i = 0; i < 10; i++) { total += i * i; } \
               try { undefinedCall(); } catch (e) { total += 1000; } \
               total;";
    let mut direct_ctx = Context::with_default_options();
    let direct = direct_ctx.eval(src).expect("direct run");
    let direct_shown = display(&mut direct_ctx, direct);

    let mut save_ctx = Context::with_default_options();
    let code = save_ctx.parse(src, ParseFlags::default()).expect("parse");
    let image = snapshot::save(&save_ctx, code);
    let mut load_ctx = Context::with_default_options();
    let loaded = snapshot::load(&mut load_ctx, &image).expect("load");
    let replayed = load_ctx.run(loaded).expect("snapshot run");

    assert_eq!(display(&mut load_ctx, replayed), direct_shown);
    assert_eq!(direct_shown, "1285");
}

#[test]
fn test_corrupt_snapshot_is_rejected() {
    let mut ctx = Context::with_default_options();
    let code = ctx.parse("1 + 1;", ParseFlags::default()).expect("parse");
    let mut image = snapshot::save(&ctx, code);

    // Truncating the image must fail cleanly, never panic.
    image.truncate(image.len() / 2);
    let mut fresh = Context::with_default_options();
    assert!(snapshot::load(&mut fresh, &image).is_err());
}
