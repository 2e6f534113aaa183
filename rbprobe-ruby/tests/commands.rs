//! デバッガコマンドとしての動作のテスト
//!
//! `Debugger::run_line` でコマンドを実行し、出力と便利変数を確認します。

mod common;

use common::*;

#[test]
fn test_object_print() {
    let mut process = RubyProcess::standard();
    let name = process.symbol("name");
    let age = process.symbol("age");
    let alice = process.string("Alice");
    let hash = process.hash(&[(name, alice), (age, (30 << 1) | 1)]);
    let (debugger, _) = process.debugger();

    let out = run(&debugger, &format!("rb-object-print 0x{:x}", hash));
    let expected = format!(
        "<T_HASH@0x{hash:x} AR-Table size=2 bound=2>\n\
         \x20 [   0] K: <T_SYMBOL> :name\n\
         \x20        V: <T_STRING@0x{alice:x} embedded length=5> 'Alice'\n\
         \x20 [   1] K: <T_SYMBOL> :age\n\
         \x20        V: <T_FIXNUM> 30\n"
    );
    assert_eq!(out, expected);

    // 別名
    assert_eq!(run(&debugger, &format!("rp 0x{:x}", hash)), expected);
    assert_eq!(run(&debugger, &format!("rb-print 0x{:x}", hash)), expected);
}

#[test]
fn test_object_print_debug_and_errors() {
    let mut process = RubyProcess::standard();
    let string = process.string("dbg");
    let (debugger, _) = process.debugger();

    let out = run(&debugger, &format!("rb-object-print 0x{:x} --debug", string));
    assert!(out.starts_with(&format!("VALUE: 0x{:x}\n", string)), "{}", out);
    assert!(out.contains("(type 0x5)"), "{}", out);
    assert!(out.contains("'dbg'"), "{}", out);

    assert!(run(&debugger, "rb-object-print").starts_with("Error: "));
    assert!(run(&debugger, "rb-object-print 1 --depth x").starts_with("Error: "));
    assert_eq!(run(&debugger, "rb-object-print 0x4"), "<T_NIL>\n");
}

#[test]
fn test_heap_scan_pages_through_variables() {
    let mut process = RubyProcess::standard();
    let strings: Vec<u64> = (0..12).map(|i| process.string(&format!("str{}", i))).collect();
    process.array(&[QNIL]);
    let (debugger, _) = process.debugger();

    let first = run(&debugger, "rb-heap-scan --type T_STRING --limit 5");
    assert!(first.starts_with("Scanning heap for T_STRING (0x05), limit=5...\n"), "{}", first);
    assert!(first.contains("Found 5 object(s):"), "{}", first);
    assert!(
        first.contains(&format!("  [0] $heap0 = <T_STRING@0x{:x} embedded length=4> 'str0'\n", strings[0])),
        "{}",
        first
    );
    assert!(first.contains(&format!("  [4] $heap4 = <T_STRING@0x{:x} embedded length=4> 'str4'\n", strings[4])));
    assert!(first.contains("Objects saved in $heap0 through $heap4"), "{}", first);
    assert!(first.contains("Next scan cursor saved to $heap: "), "{}", first);
    assert!(first.contains("Run 'rb-heap-scan --type T_STRING --from $heap' for the next page"));

    let session = debugger.session();
    assert_eq!(session.convenience("heap4").unwrap().as_u64().unwrap(), strings[4]);
    assert!(session.convenience("heap").is_some());

    let second = run(&debugger, "rb-heap-scan --type T_STRING --limit 7 --from $heap");
    assert!(second.contains("continuing from"), "{}", second);
    assert!(second.contains("Found 7 object(s):"), "{}", second);
    assert!(second.contains("Reached end of heap"), "{}", second);
    assert_eq!(session.convenience("heap0").unwrap().as_u64().unwrap(), strings[5]);
    assert_eq!(session.convenience("heap6").unwrap().as_u64().unwrap(), strings[11]);
    assert!(session.convenience("heap").is_none());

    // 前回の $heapN は消える
    let third = run(&debugger, "rb-heap-scan --type T_ARRAY");
    assert!(third.contains("Found 1 object(s):"), "{}", third);
    assert!(session.convenience("heap1").is_none());
}

#[test]
fn test_heap_scan_with_unset_cursor_starts_over() {
    let mut process = RubyProcess::standard();
    process.string("only");
    let (debugger, _) = process.debugger();

    let out = run(&debugger, "rb-heap-scan --from $heap");
    assert!(out.starts_with("Note: $heap is not set or invalid, starting from the beginning of the heap\n"));
    assert!(out.contains("Scanning heap for all types, limit=10..."), "{}", out);
    assert!(out.contains("Found 1 object(s):"), "{}", out);
}

#[test]
fn test_heap_scan_no_match_and_bad_type() {
    let (debugger, _) = RubyProcess::standard().debugger();

    let out = run(&debugger, "rb-heap-scan --type T_BIGNUM");
    assert!(out.contains("No objects found"), "{}", out);
    assert!(run(&debugger, "rb-heap-scan --type T_NOPE").starts_with("Error: Unknown type 'T_NOPE'"));
}

#[test]
fn test_fiber_scan_with_no_fibers() {
    let (debugger, state) = RubyProcess::standard().debugger();

    let out = run(&debugger, "rb-fiber-scan-heap");
    assert_eq!(out, "No fibers found\n");
    assert!(state.fibers.borrow().is_empty());

    let out = run(&debugger, "rb-fiber-scan-switch 0");
    assert_eq!(out, "Error: No fibers in cache. Run 'rb-fiber-scan-heap' first.\n");
}

#[test]
fn test_fiber_scan_and_switch() {
    let mut process = RubyProcess::standard();
    let first = process.fiber(FIBER_SUSPENDED);
    let second = process.fiber(FIBER_SUSPENDED);
    let (debugger, state) = process.debugger();

    let out = run(&debugger, "rb-fiber-scan-heap");
    assert!(out.starts_with("Found 2 fiber(s):\n"), "{}", out);
    assert!(out.contains(&format!(
        "Fiber #1: <T_DATA@0x{:x}> -> <struct rb_fiber_struct@0x{:x}>",
        second.value, second.ptr
    )));
    assert!(out.contains("  Status: SUSPENDED"), "{}", out);
    assert!(out.ends_with("Fibers cached. Use 'rb-fiber-scan-switch <index>' to switch to a fiber.\n"));
    assert_eq!(state.fibers.borrow().len(), 2);

    let out = run(&debugger, "rb-fiber-scan-switch 0");
    assert!(out.starts_with(&format!("Switching to Fiber #0: VALUE 0x{:x}\n", first.value)), "{}", out);
    assert!(out.contains("  $fiber     = Current fiber VALUE"), "{}", out);
    assert!(out.contains("To switch back: rb-fiber-switch off"), "{}", out);
    assert!(state.unwinder.is_active());

    let bt = run(&debugger, "bt");
    assert!(bt.contains("coroutine_transfer"), "{}", bt);
    assert!(bt.contains("fiber_entry"), "{}", bt);

    let out = run(&debugger, "rb-fiber-switch off");
    assert_eq!(out, "Fiber unwinder deactivated. Switched back to normal stack view.\n");
    assert!(!state.unwinder.is_active());
    assert!(run(&debugger, "bt").contains("vm_exec_core"));

    assert!(run(&debugger, "rb-fiber-scan-switch abc").starts_with("Error: Invalid index 'abc'"));
}

#[test]
fn test_fiber_switch_by_expression() {
    let mut process = RubyProcess::standard();
    let fiber = process.fiber(FIBER_SUSPENDED);
    let created = process.fiber(FIBER_CREATED);
    let (debugger, state) = process.debugger();

    let out = run(&debugger, &format!("rb-fiber-switch 0x{:x}", created.value));
    assert!(out.starts_with("Error: "), "{}", out);
    assert!(out.contains("never resumed"), "{}", out);
    assert!(!state.unwinder.is_active());

    run(&debugger, &format!("set $f = 0x{:x}", fiber.value));
    let out = run(&debugger, "rb-fiber-switch $f");
    assert!(out.starts_with(&format!(
        "Switched to Fiber: <T_DATA@0x{:x}> -> <struct rb_fiber_struct@0x{:x}>",
        fiber.value, fiber.ptr
    )), "{}", out);
    assert!(state.unwinder.is_active());

    // 切り替え中のスタックトレースはファイバのもの
    let trace = run(&debugger, "rb-stack-trace");
    assert!(trace.contains("[ruby] worker.rb:5:in 'work'"), "{}", trace);
    assert!(!trace.contains("app.rb"), "{}", trace);
}

#[test]
fn test_fiber_scan_cache_file() {
    let mut process = RubyProcess::standard();
    process.fiber(FIBER_SUSPENDED);
    process.fiber(FIBER_TERMINATED);
    let (debugger, state) = process.debugger();
    let path = std::env::temp_dir().join(format!("rbprobe-command-cache-{}.json", std::process::id()));
    std::fs::remove_file(&path).ok();

    let out = run(&debugger, &format!("rb-fiber-scan-heap --cache {} --terminated", path.display()));
    assert!(out.starts_with(&format!("Cache file '{}' not found, scanning the heap...\n", path.display())));
    assert!(out.contains(&format!("Saved 2 fiber VALUE(s) to {}", path.display())), "{}", out);

    state.fibers.borrow_mut().clear();
    let out = run(&debugger, &format!("rb-fiber-scan-heap --cache {}", path.display()));
    std::fs::remove_file(&path).ok();
    assert!(out.starts_with(&format!("Loaded 1 fiber(s) from {}:", path.display())), "{}", out);
    assert_eq!(state.fibers.borrow().len(), 1);

    assert!(run(&debugger, "rb-fiber-scan-heap --limit 0").starts_with("Error: --limit must be positive"));
}

#[test]
fn test_stack_trace_interleaves() {
    let (debugger, _) = RubyProcess::standard().debugger();

    let out = run(&debugger, "rb-stack-trace");
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 8, "{}", out);
    assert!(lines[0].contains("in rb_ary_each ()"), "{}", out);
    assert_eq!(lines[1], "     [ruby] [C function each (rb_ary_each)]");
    assert!(lines[2].contains("in vm_call_cfunc_with_frame ()"));
    assert_eq!(lines[3], "     [ruby] app.rb:12:in 'process'");
    assert_eq!(lines[4], "     [ruby] app.rb:2:in '<main>'");
    assert!(lines[5].contains("in vm_exec_core ()"));
    assert!(lines[7].contains("in main ()"));
}

#[test]
fn test_fiber_stack_trace_all() {
    let mut process = RubyProcess::standard();
    let fiber = process.fiber(FIBER_SUSPENDED);
    let (debugger, _) = process.debugger();

    assert!(run(&debugger, "rb-fiber-scan-stack-trace-all").starts_with("Error: No fibers in cache."));
    run(&debugger, "rb-fiber-scan-heap");
    let out = run(&debugger, "rb-fiber-scan-stack-trace-all");
    assert!(out.starts_with("Printing stack traces for 1 fiber(s)\n"), "{}", out);
    assert!(out.contains(&format!("Fiber #0: VALUE 0x{:x} -> SUSPENDED", fiber.value)), "{}", out);
    assert!(out.contains("#0  worker.rb:5:in 'work'"), "{}", out);
}

#[test]
fn test_context_sets_variables() {
    let mut process = RubyProcess::standard();
    let ec = process.main_ec();
    let error = process.object(process.classes.runtime_error);
    process.set_errinfo(ec, error);
    let (debugger, _) = process.debugger();

    let out = run(&debugger, "rb-context");
    assert!(out.starts_with(&format!("Execution Context:\n  $ec = <rb_execution_context_t@0x{:x}>\n", ec)), "{}", out);
    assert!(out.contains("    Exception present! (RuntimeError)"), "{}", out);
    assert!(out.ends_with("Convenience variables set: $ec, $cfp, $errinfo\n"), "{}", out);
    assert_eq!(debugger.session().convenience("errinfo").unwrap().as_u64().unwrap(), error);
}

#[test]
fn test_context_reports_retval_in_ensure() {
    let mut process = RubyProcess::standard();
    let ec = process.main_ec();
    let value = process.string("returned");
    process.set_tag(ec, value, 1);
    let (debugger, _) = process.debugger();

    let out = run(&debugger, "rb-context");
    assert!(out.contains("    $retval available (in ensure block)"), "{}", out);
    assert!(out.ends_with("Convenience variables set: $ec, $cfp, $retval\n"), "{}", out);
    assert_eq!(debugger.session().convenience("retval").unwrap().as_u64().unwrap(), value);
}

#[test]
fn test_context_storage() {
    let mut process = RubyProcess::standard();
    let ec = process.main_ec();
    let key = process.symbol("request_id");
    let storage = process.hash(&[(key, (99 << 1) | 1)]);
    let (debugger, _) = process.debugger();

    assert_eq!(run(&debugger, "rb-context-storage"), "Fiber storage: nil\n");

    mock(debugger.session()).write_u64(ec + 48, storage);
    let out = run(&debugger, "rb-context-storage");
    assert!(out.starts_with(&format!("Fiber storage:\n<T_HASH@0x{:x} AR-Table size=1 bound=1>\n", storage)), "{}", out);
    assert!(out.contains("K: <T_SYMBOL> :request_id"), "{}", out);
}

#[test]
fn test_exit_report() {
    let mut process = RubyProcess::standard();
    let ec = process.main_ec();
    let error = process.object(process.classes.runtime_error);
    process.set_errinfo(ec, error);
    process.set_interrupts(ec, 0x08, 0);
    process.set_signal_buff_size(1);
    process.mock().set_stop_signal(Some(2));
    let (debugger, _) = process.debugger();

    let out = run(&debugger, "rb-exit-report");
    assert!(out.starts_with("Main thread:\n"), "{}", out);
    assert!(out.contains(&format!("pending exception: RuntimeError <VALUE@0x{:x}>", error)), "{}", out);
    assert!(out.contains("Fibers:\n  no cached fibers"), "{}", out);
    assert!(out.contains("trap"), "{}", out);
    assert!(out.contains("signal_buff.size = 1"), "{}", out);
    assert!(out.contains("SIGINT"), "{}", out);
}

#[test]
fn test_help_lists_ruby_commands() {
    let (debugger, _) = RubyProcess::standard().debugger();

    let out = run(&debugger, "help");
    for name in [
        "rb-object-print",
        "rb-heap-scan",
        "rb-fiber-scan-heap",
        "rb-fiber-scan-switch",
        "rb-fiber-switch",
        "rb-fiber-scan-stack-trace-all",
        "rb-stack-trace",
        "rb-context",
        "rb-context-storage",
        "rb-exit-report",
    ] {
        assert!(out.contains(name), "help does not mention {}:\n{}", name, out);
    }
}
