//! 実行コンテキストとレポートのコマンド
//!
//! rb-context / rb-context-storage / rb-exit-report

use super::depth_option;
use crate::context::RubyContext;
use crate::diagnose::ExitReport;
use crate::printer::ObjectPrinter;
use crate::runtime::Runtime;
use crate::{Result, RubyState};
use rbprobe_core::{Arguments, CommandCategory, CommandContext, CommandRegistry};
use std::rc::Rc;

pub(crate) fn install(registry: &mut CommandRegistry, state: &Rc<RubyState>) -> Result<()> {
    let shared = state.clone();
    registry.define(
        "context",
        CommandCategory::Status,
        "Show the current execution context and set $ec, $cfp and $errinfo.\nUsage: rb-context",
        move |ctx, args, from_tty| context(&shared, ctx, args, from_tty),
    );
    let shared = state.clone();
    registry.define(
        "context-storage",
        CommandCategory::Data,
        "Print the fiber storage of the current execution context.\nUsage: rb-context-storage [--depth N] [--debug]",
        move |ctx, args, from_tty| context_storage(&shared, ctx, args, from_tty),
    );
    let shared = state.clone();
    registry.define(
        "exit-report",
        CommandCategory::Status,
        "Summarize why the process stopped: pending exceptions, interrupts and the signal.\nUsage: rb-exit-report",
        move |ctx, args, from_tty| exit_report(&shared, ctx, args, from_tty),
    );

    for (name, as_name) in [
        ("context", "rb-context"),
        ("context-storage", "rb-context-storage"),
        ("exit-report", "rb-exit-report"),
    ] {
        registry.install(name, as_name)?;
    }
    Ok(())
}

fn context(state: &RubyState, ctx: &mut CommandContext<'_>, _args: &str, _from_tty: bool) -> Result<()> {
    let rt = Runtime::new(ctx.session());
    let context = RubyContext::current(&rt, &state.unwinder)?;
    context.print_info(&rt, ctx.out())?;

    let mut names = context.set_convenience_variables(&rt);
    if let Some(retval) = context.retval(&rt) {
        rt.session().set_convenience("retval", &rt.value(retval));
        names.push("retval");
    }
    let names: Vec<String> = names.iter().map(|name| format!("${}", name)).collect();
    writeln!(ctx.out())?;
    writeln!(ctx.out(), "Convenience variables set: {}", names.join(", "))?;
    Ok(())
}

fn context_storage(state: &RubyState, ctx: &mut CommandContext<'_>, args: &str, _from_tty: bool) -> Result<()> {
    let args = Arguments::parse(args, &["depth"])?;
    let printer = ObjectPrinter::new(depth_option(&args)?, args.flag("debug"));
    let rt = Runtime::new(ctx.session());
    let context = RubyContext::current(&rt, &state.unwinder)?;

    let storage = context.storage()?;
    if storage == rt.constants().qnil || storage == 0 {
        writeln!(ctx.out(), "Fiber storage: nil")?;
        return Ok(());
    }
    writeln!(ctx.out(), "Fiber storage:")?;
    printer.print(&rt, storage, ctx.out())?;
    Ok(())
}

fn exit_report(state: &RubyState, ctx: &mut CommandContext<'_>, _args: &str, _from_tty: bool) -> Result<()> {
    let rt = Runtime::new(ctx.session());
    let report = ExitReport::collect(&rt, &state.fibers.borrow());
    report.render(ctx.out())
}
