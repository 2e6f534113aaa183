//! Ruby検査コマンド
//!
//! 値や状態を扱うコマンドは `Command` を実装した型で、レポート系のコマンドは
//! 関数を `define` して `install` する形で登録します。

mod context;
mod fiber;
mod heap;
mod object;
mod stack;

pub use fiber::{FiberScanHeapCommand, FiberScanStackTraceAllCommand, FiberScanSwitchCommand, FiberSwitchCommand};
pub use heap::HeapScanCommand;
pub use object::ObjectPrintCommand;
pub use stack::StackTraceCommand;

use crate::{Result, RubyState};
use rbprobe_core::{Arguments, CommandRegistry};
use std::rc::Rc;

/// Ruby検査コマンドを登録する
pub fn install(registry: &mut CommandRegistry, state: &Rc<RubyState>) -> Result<()> {
    registry.register(ObjectPrintCommand);
    registry.register(HeapScanCommand);
    registry.register(FiberScanHeapCommand::new(state.clone()));
    registry.register(FiberScanSwitchCommand::new(state.clone()));
    registry.register(FiberSwitchCommand::new(state.clone()));
    registry.register(FiberScanStackTraceAllCommand::new(state.clone()));
    registry.register(StackTraceCommand::new(state.clone()));
    context::install(registry, state)
}

/// `--depth`（省略時は1）
pub(crate) fn depth_option(args: &Arguments) -> Result<usize> {
    Ok(args.option_usize("depth")?.unwrap_or(1))
}

/// 式を評価して `VALUE` として読む
pub(crate) fn eval_value(session: &rbprobe_core::Session, expression: &str) -> Result<u64> {
    let value = session.parse_and_eval(expression)?;
    value.as_u64()
}
