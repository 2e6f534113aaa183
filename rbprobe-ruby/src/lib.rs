//! rbprobe Rubyランタイム検査機能
//!
//! このクレートは、停止中のRubyプロセスやコアダンプからランタイムの状態を読み取る
//! 機能を提供します。値の分類、ヒープのスキャン、ファイバの列挙と切り替え、
//! VMスタックの走査、終了原因のレポートを行い、それらをデバッガコマンドとして登録します。

pub mod commands;
pub mod constants;
pub mod context;
pub mod diagnose;
pub mod errors;
pub mod exception;
pub mod fiber;
pub mod heap;
pub mod object;
pub mod printer;
pub mod rarray;
pub mod rbignum;
pub mod rclass;
pub mod rfloat;
pub mod rhash;
pub mod rstring;
pub mod rstruct;
pub mod rsymbol;
pub mod runtime;
pub mod stack;
pub mod unwind;

pub use constants::{RubyConstants, RubyType};
pub use context::{RubyContext, RubyVm};
pub use diagnose::ExitReport;
pub use errors::RuntimeError;
pub use fiber::{Fiber, FiberCache, FiberRecord, FiberStatus, SwitchOutcome};
pub use heap::{HeapObject, HeapPage, HeapScanner, ScanCursor, ScanPage};
pub use object::{classify, HashTable, RubyObject, Storage};
pub use printer::ObjectPrinter;
pub use runtime::Runtime;
pub use stack::{interleave, StackWalker, TraceEntry, TransitionDetector, VmFrame};
pub use unwind::{FiberUnwinder, UnwindContext, UnwindState};

use rbprobe_core::Debugger;
use std::cell::RefCell;
use std::rc::Rc;

/// Ruby検査機能の結果型
pub type Result<T> = anyhow::Result<T>;

/// コマンド間で共有する状態
#[derive(Debug, Default)]
pub struct RubyState {
    pub unwinder: Rc<FiberUnwinder>,
    pub fibers: RefCell<FiberCache>,
}

impl RubyState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// アンワインド戦略とコマンドをデバッガに登録する
pub fn install(debugger: &mut Debugger) -> Result<Rc<RubyState>> {
    let state = Rc::new(RubyState::new());
    debugger.session().unwinders().register(state.unwinder.clone());
    commands::install(debugger.registry_mut(), &state)?;
    tracing::debug!("ruby commands installed");
    Ok(state)
}
