//! ファイバ関連のコマンド
//!
//! `rb-fiber-scan-heap` / `rb-fiber-scan-switch` / `rb-fiber-switch` / `rb-fiber-scan-stack-trace-all`

use super::eval_value;
use super::stack::print_vm_frames;
use crate::errors::ERR_NO_FIBER_CACHE;
use crate::fiber::{self, FiberCache, SwitchOutcome};
use crate::runtime::Runtime;
use crate::stack::StackWalker;
use crate::{Result, RubyState};
use rbprobe_core::{Arguments, Command, CommandCategory, CommandContext};
use std::io::Write;
use std::path::Path;
use std::rc::Rc;

/// 切り替えを解除する引数
const OFF_WORDS: &[&str] = &["off", "none", "deactivate"];

const SEPARATOR_WIDTH: usize = 80;

/// 一覧を表示する
fn print_cache(rt: &Runtime<'_>, cache: &FiberCache, out: &mut dyn Write) -> Result<()> {
    for record in cache.records() {
        match record.fiber(rt) {
            Ok(fiber) => {
                writeln!(
                    out,
                    "Fiber #{}: <T_DATA@0x{:x}> -> <struct rb_fiber_struct@0x{:x}>",
                    record.index,
                    record.address,
                    fiber.address()
                )?;
                for line in fiber.describe(rt) {
                    writeln!(out, "{}", line)?;
                }
            }
            Err(e) => writeln!(out, "Fiber #{}: <T_DATA@0x{:x}> <error: {:#}>", record.index, record.address, e)?,
        }
        writeln!(out)?;
    }
    Ok(())
}

pub struct FiberScanHeapCommand {
    state: Rc<RubyState>,
}

impl FiberScanHeapCommand {
    pub fn new(state: Rc<RubyState>) -> Self {
        Self { state }
    }
}

impl Command for FiberScanHeapCommand {
    fn name(&self) -> &str {
        "rb-fiber-scan-heap"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::Data
    }

    fn help(&self) -> &str {
        "Scan the heap for Fiber objects and cache them by index.\n\
         Usage: rb-fiber-scan-heap [--limit N] [--cache FILE] [--terminated]\n\
         \n\
         --limit N      stop after N fibers\n\
         --cache FILE   reload fibers from FILE if it exists, otherwise scan and save to FILE\n\
         --terminated   include TERMINATED fibers"
    }

    fn invoke(&self, ctx: &mut CommandContext<'_>, args: &str, _from_tty: bool) -> Result<()> {
        let args = Arguments::parse(args, &["limit", "cache"])?;
        let limit = args.option_usize("limit")?;
        if limit == Some(0) {
            return Err(anyhow::anyhow!("--limit must be positive"));
        }
        let include_terminated = args.flag("terminated");
        let cache_path = args.option("cache").map(Path::new);
        let rt = Runtime::new(ctx.session());

        if let Some(path) = cache_path {
            match FiberCache::load(&rt, path)? {
                Some((mut cache, stale)) => {
                    for error in &stale {
                        writeln!(ctx.out(), "Warning: {}", error)?;
                    }
                    if !include_terminated {
                        cache.retain_live(&rt);
                    }
                    writeln!(ctx.out(), "Loaded {} fiber(s) from {}:", cache.len(), path.display())?;
                    writeln!(ctx.out())?;
                    print_cache(&rt, &cache, ctx.out())?;
                    *self.state.fibers.borrow_mut() = cache;
                    writeln!(ctx.out(), "Fibers cached. Use 'rb-fiber-scan-switch <index>' to switch to a fiber.")?;
                    return Ok(());
                }
                None => writeln!(ctx.out(), "Cache file '{}' not found, scanning the heap...", path.display())?,
            }
        }

        let cache = fiber::scan_heap(&rt, limit, include_terminated)?;
        if cache.is_empty() {
            self.state.fibers.borrow_mut().clear();
            writeln!(ctx.out(), "No fibers found")?;
            return Ok(());
        }

        let limited = limit.is_some_and(|limit| cache.len() >= limit);
        writeln!(
            ctx.out(),
            "Found {} fiber(s){}:",
            cache.len(),
            if limited { " (limit reached)" } else { "" }
        )?;
        writeln!(ctx.out())?;
        print_cache(&rt, &cache, ctx.out())?;

        if let Some(path) = cache_path {
            match cache.save(path) {
                Ok(()) => writeln!(ctx.out(), "Saved {} fiber VALUE(s) to {}", cache.len(), path.display())?,
                Err(e) => writeln!(ctx.out(), "Warning: failed to save cache: {:#}", e)?,
            }
        }
        *self.state.fibers.borrow_mut() = cache;
        writeln!(ctx.out(), "Fibers cached. Use 'rb-fiber-scan-switch <index>' to switch to a fiber.")?;
        Ok(())
    }
}

/// 切り替え結果を表示する
fn print_switch(outcome: &SwitchOutcome, out: &mut dyn Write) -> Result<()> {
    for warning in &outcome.warnings {
        writeln!(out, "Warning: {}", warning)?;
    }
    writeln!(
        out,
        "Switched to Fiber: <T_DATA@0x{:x}> -> <struct rb_fiber_struct@0x{:x}>",
        outcome.fiber, outcome.fiber_ptr
    )?;
    writeln!(out, "  Status: {}", outcome.status)?;
    if let Some(exception) = &outcome.exception {
        writeln!(out, "  Exception: {} <VALUE@0x{:x}>", exception, exception.address)?;
    }
    writeln!(
        out,
        "  Saved registers: rip=0x{:x} rsp=0x{:x} rbp=0x{:x}",
        outcome.registers.rip, outcome.registers.rsp, outcome.registers.rbp
    )?;
    writeln!(out)?;
    writeln!(out, "Convenience variables set:")?;
    for name in &outcome.variables {
        let description = match *name {
            "fiber" => "Current fiber VALUE",
            "fiber_ptr" => "Current fiber pointer (struct rb_fiber_struct *)",
            "ec" => "Execution context (rb_execution_context_t *)",
            "cfp" => "Control frame (rb_control_frame_t *)",
            "errinfo" => "Exception being handled (VALUE)",
            "retval" => "Return value from 'return' (VALUE)",
            _ => "",
        };
        writeln!(out, "  ${:<10}= {}", name, description)?;
    }
    writeln!(out)?;
    writeln!(out, "Now try 'bt' for the fiber's native backtrace or 'rb-stack-trace' for the combined trace.")?;
    writeln!(out, "To switch back: rb-fiber-switch off")?;
    Ok(())
}

fn print_off(out: &mut dyn Write) -> Result<()> {
    writeln!(out, "Fiber unwinder deactivated. Switched back to normal stack view.")?;
    Ok(())
}

pub struct FiberScanSwitchCommand {
    state: Rc<RubyState>,
}

impl FiberScanSwitchCommand {
    pub fn new(state: Rc<RubyState>) -> Self {
        Self { state }
    }
}

impl Command for FiberScanSwitchCommand {
    fn name(&self) -> &str {
        "rb-fiber-scan-switch"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::Stack
    }

    fn help(&self) -> &str {
        "Switch to a fiber from the 'rb-fiber-scan-heap' cache.\n\
         Usage: rb-fiber-scan-switch <index|off>"
    }

    fn invoke(&self, ctx: &mut CommandContext<'_>, args: &str, _from_tty: bool) -> Result<()> {
        let argument = args.trim();
        if argument.is_empty() {
            return Err(anyhow::anyhow!("Usage: rb-fiber-scan-switch <index|off>"));
        }
        let rt = Runtime::new(ctx.session());
        if OFF_WORDS.contains(&argument) {
            fiber::switch_off(&rt, &self.state.unwinder);
            return print_off(ctx.out());
        }

        let cache = self.state.fibers.borrow();
        if cache.is_empty() {
            return Err(anyhow::anyhow!(ERR_NO_FIBER_CACHE));
        }
        let index = argument
            .parse::<usize>()
            .map_err(|_| anyhow::anyhow!("Invalid index '{}'. Must be an integer.", argument))?;
        let outcome = fiber::switch_to_index(&rt, &self.state.unwinder, &cache, index)?;
        writeln!(ctx.out(), "Switching to Fiber #{}: VALUE 0x{:x}", index, outcome.fiber)?;
        print_switch(&outcome, ctx.out())
    }
}

pub struct FiberSwitchCommand {
    state: Rc<RubyState>,
}

impl FiberSwitchCommand {
    pub fn new(state: Rc<RubyState>) -> Self {
        Self { state }
    }
}

impl Command for FiberSwitchCommand {
    fn name(&self) -> &str {
        "rb-fiber-switch"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::Stack
    }

    fn help(&self) -> &str {
        "Switch the native backtrace to a fiber's saved context.\n\
         Usage: rb-fiber-switch <fiber VALUE expression|off>\n\
         \n\
         'off', 'none' or 'deactivate' returns to the live registers."
    }

    fn invoke(&self, ctx: &mut CommandContext<'_>, args: &str, _from_tty: bool) -> Result<()> {
        let target = args.trim();
        if target.is_empty() {
            return Err(anyhow::anyhow!("Usage: rb-fiber-switch <fiber VALUE expression|off>"));
        }
        let session = ctx.session();
        let rt = Runtime::new(session);
        if OFF_WORDS.contains(&target) {
            fiber::switch_off(&rt, &self.state.unwinder);
            return print_off(ctx.out());
        }

        let value = eval_value(session, target)?;
        let outcome = fiber::switch(&rt, &self.state.unwinder, target, value)?;
        print_switch(&outcome, ctx.out())
    }
}

pub struct FiberScanStackTraceAllCommand {
    state: Rc<RubyState>,
}

impl FiberScanStackTraceAllCommand {
    pub fn new(state: Rc<RubyState>) -> Self {
        Self { state }
    }
}

impl Command for FiberScanStackTraceAllCommand {
    fn name(&self) -> &str {
        "rb-fiber-scan-stack-trace-all"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::Stack
    }

    fn help(&self) -> &str {
        "Print the Ruby backtrace of every cached fiber.\n\
         Usage: rb-fiber-scan-stack-trace-all"
    }

    fn invoke(&self, ctx: &mut CommandContext<'_>, _args: &str, _from_tty: bool) -> Result<()> {
        let cache = self.state.fibers.borrow();
        if cache.is_empty() {
            return Err(anyhow::anyhow!(ERR_NO_FIBER_CACHE));
        }
        let rt = Runtime::new(ctx.session());
        let walker = StackWalker::new(&rt);

        writeln!(ctx.out(), "Printing stack traces for {} fiber(s)", cache.len())?;
        writeln!(ctx.out(), "{}", "=".repeat(SEPARATOR_WIDTH))?;
        for record in cache.records() {
            let fiber = match record.fiber(&rt) {
                Ok(fiber) => fiber,
                Err(e) => {
                    writeln!(ctx.out(), "\nFiber #{}: VALUE 0x{:x}", record.index, record.address)?;
                    writeln!(ctx.out(), "{}", "-".repeat(SEPARATOR_WIDTH))?;
                    writeln!(ctx.out(), "<error: {:#}>", e)?;
                    continue;
                }
            };
            let status = fiber
                .status()
                .map(|s| s.to_string())
                .unwrap_or_else(|_| "UNKNOWN".to_string());
            writeln!(ctx.out(), "\nFiber #{}: VALUE 0x{:x} -> {}", record.index, record.address, status)?;
            writeln!(ctx.out(), "{}", "-".repeat(SEPARATOR_WIDTH))?;

            let walked = fiber.context(&rt).and_then(|context| walker.walk(&context));
            match walked {
                Ok((frames, error)) => {
                    print_vm_frames(&rt, &frames, false, ctx.out())?;
                    if let Some(e) = error {
                        writeln!(ctx.out(), "<error: {:#}>", e)?;
                    }
                }
                Err(e) => writeln!(ctx.out(), "<error: {:#}>", e)?,
            }
        }
        Ok(())
    }
}
