//! 組み込みコマンド
//!
//! print / bt / info threads / thread / set / show convenience / help / quit

use crate::command::{CommandCategory, CommandContext, CommandRegistry};
use crate::unwind::MAX_FRAMES;
use crate::Result;

/// 組み込みコマンドを定義して公開する
pub fn install(registry: &mut CommandRegistry) -> Result<()> {
    registry.define("print", CommandCategory::Data, "Evaluate an expression and print its value.\nUsage: print EXPR", print);
    registry.define(
        "backtrace",
        CommandCategory::Stack,
        "Print the native backtrace of the selected thread.\nUsage: bt [N]",
        backtrace,
    );
    registry.define("info-threads", CommandCategory::Status, "List the threads of the target.", info_threads);
    registry.define("thread", CommandCategory::Status, "Select a thread.\nUsage: thread N", select_thread);
    registry.define(
        "set-var",
        CommandCategory::Data,
        "Set a convenience variable.\nUsage: set $NAME = EXPR",
        set_variable,
    );
    registry.define("show-convenience", CommandCategory::Status, "List convenience variables.", show_convenience);
    registry.define("help", CommandCategory::Support, "List commands, or describe one.\nUsage: help [COMMAND]", help);
    registry.define("quit", CommandCategory::Support, "Exit the debugger.", |ctx, _, _| {
        ctx.request_quit();
        Ok(())
    });

    for (name, as_name) in [
        ("print", "print"),
        ("backtrace", "backtrace"),
        ("info-threads", "info threads"),
        ("thread", "thread"),
        ("set-var", "set"),
        ("show-convenience", "show convenience"),
        ("help", "help"),
        ("quit", "quit"),
    ] {
        registry.install(name, as_name)?;
    }
    registry.alias("p", "print");
    registry.alias("bt", "backtrace");
    registry.alias("q", "quit");
    registry.alias("exit", "quit");
    Ok(())
}

fn print(ctx: &mut CommandContext<'_>, args: &str, _from_tty: bool) -> Result<()> {
    if args.trim().is_empty() {
        return Err(anyhow::anyhow!("Usage: print EXPR"));
    }
    let value = ctx.session().parse_and_eval(args)?;
    let rendered = value.to_string();
    writeln!(ctx.out(), "({}) {}", value.ty(), rendered)?;
    Ok(())
}

fn backtrace(ctx: &mut CommandContext<'_>, args: &str, _from_tty: bool) -> Result<()> {
    let limit = match args.trim() {
        "" => MAX_FRAMES,
        n => n
            .parse::<usize>()
            .map_err(|_| anyhow::anyhow!("Invalid frame count '{}'", n))?,
    };
    let frames = ctx.session().backtrace(limit)?;
    if frames.is_empty() {
        writeln!(ctx.out(), "No stack.")?;
    }
    for frame in frames {
        writeln!(ctx.out(), "{}", frame.describe())?;
    }
    Ok(())
}

fn info_threads(ctx: &mut CommandContext<'_>, _args: &str, _from_tty: bool) -> Result<()> {
    let threads = ctx.session().backend().threads();
    if threads.is_empty() {
        return Err(anyhow::anyhow!(crate::errors::ERR_NO_THREAD_NAVIGATION));
    }
    for thread in threads {
        let marker = if thread.selected { "*" } else { " " };
        let function = ctx
            .session()
            .symbol_at(thread.pc)
            .map(|s| s.name)
            .unwrap_or_else(|| "??".to_string());
        writeln!(
            ctx.out(),
            "{} {:<3} LWP {:<8} 0x{:016x} in {}",
            marker,
            thread.index,
            thread.tid,
            thread.pc,
            function
        )?;
    }
    Ok(())
}

fn select_thread(ctx: &mut CommandContext<'_>, args: &str, _from_tty: bool) -> Result<()> {
    let index = args
        .trim()
        .parse::<usize>()
        .map_err(|_| anyhow::anyhow!("Usage: thread N"))?;
    let session = ctx.session();
    session.backend().select_thread(index)?;
    session.invalidate_frames();
    writeln!(ctx.out(), "[Switching to thread {}]", index)?;
    Ok(())
}

fn set_variable(ctx: &mut CommandContext<'_>, args: &str, _from_tty: bool) -> Result<()> {
    let args = args.trim();
    let args = args.strip_prefix("var ").map(str::trim_start).unwrap_or(args);
    let (name, expression) = args
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Usage: set $NAME = EXPR"))?;
    let name = name.trim();
    let Some(name) = name.strip_prefix('$') else {
        return Err(anyhow::anyhow!("Only convenience variables can be set (target memory is read-only)"));
    };

    let session = ctx.session();
    let value = session.parse_and_eval(expression.trim())?;
    session.set_convenience(name, &value);
    Ok(())
}

fn show_convenience(ctx: &mut CommandContext<'_>, _args: &str, _from_tty: bool) -> Result<()> {
    let session = ctx.session();
    let names = session.convenience_names();
    if names.is_empty() {
        writeln!(ctx.out(), "No convenience variables.")?;
    }
    for name in names {
        if let Some(value) = session.convenience(&name) {
            writeln!(ctx.out(), "${} = ({}) {}", name, value.ty(), value)?;
        }
    }
    Ok(())
}

fn help(ctx: &mut CommandContext<'_>, args: &str, _from_tty: bool) -> Result<()> {
    let registry = ctx.registry();
    let args = args.trim();

    if !args.is_empty() {
        let (command, _) = registry
            .resolve(args)
            .ok_or_else(|| anyhow::anyhow!("Undefined command: \"{}\".", args))?;
        writeln!(ctx.out(), "{}", command.help())?;
        let aliases = registry.aliases_of(command.name());
        if !aliases.is_empty() {
            writeln!(ctx.out(), "Aliases: {}", aliases.join(", "))?;
        }
        return Ok(());
    }

    let mut commands: Vec<_> = registry.commands().cloned().collect();
    commands.sort_by(|a, b| (a.category(), a.name()).cmp(&(b.category(), b.name())));

    let mut current = None;
    for command in commands {
        if current != Some(command.category()) {
            current = Some(command.category());
            writeln!(ctx.out(), "\n{} commands:", command.category().label())?;
        }
        let summary = command.help().lines().next().unwrap_or("");
        writeln!(ctx.out(), "  {:<32} {}", command.name(), summary)?;
    }
    Ok(())
}
