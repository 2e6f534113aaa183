//! ファイバのアンワインド
//!
//! 中断中のファイバは `coroutine_transfer` の中で止まっており、callee-saved レジスタと
//! 戻りアドレスを `context.stack_pointer` に積んでいます（x86-64）。
//!
//! ```text
//! [sp + 0]  r15
//! [sp + 8]  r14
//! [sp + 16] r13
//! [sp + 24] r12
//! [sp + 32] rbx
//! [sp + 40] rbp
//! [sp + 48] rip（戻りアドレス）
//! ```
//!
//! `ret` の後の `rsp` は `sp + 56` です。

use crate::Result;
use rbprobe_core::{FrameState, Session, UnwindStrategy};
use std::cell::RefCell;

/// 保存領域のワード数
const SAVED_WORDS: usize = 7;

/// `coroutine_transfer` が保存したレジスタ
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SavedRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64,
    pub rsp: u64,
}

impl SavedRegisters {
    /// `stack_pointer` から保存フレームを読む
    pub fn read(session: &Session, stack_pointer: u64) -> Result<Self> {
        let bytes = session.read_memory(stack_pointer, SAVED_WORDS * 8)?;
        let mut words = bytes
            .chunks_exact(8)
            .map(|w| w.iter().rev().fold(0u64, |acc, b| (acc << 8) | *b as u64));
        let mut next = || words.next().unwrap_or(0);
        Ok(Self {
            r15: next(),
            r14: next(),
            r13: next(),
            r12: next(),
            rbx: next(),
            rbp: next(),
            rip: next(),
            rsp: stack_pointer + (SAVED_WORDS as u64) * 8,
        })
    }

    pub fn frame_state(&self) -> FrameState {
        FrameState {
            pc: self.rip,
            sp: self.rsp,
            fp: self.rbp,
        }
    }
}

/// 切り替え先ファイバのコンテキスト
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindContext {
    /// ファイバの `VALUE`
    pub fiber: u64,
    /// `struct rb_fiber_struct *`
    pub fiber_ptr: u64,
    /// `&fiber->cont.saved_ec`
    pub ec: u64,
    pub registers: SavedRegisters,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UnwindState {
    #[default]
    Inactive,
    Active(UnwindContext),
}

/// ファイバのアンワインド戦略
///
/// 有効な間は、ネイティブバックトレースがライブのレジスタではなく
/// 保存されたレジスタから始まります。
#[derive(Debug, Default)]
pub struct FiberUnwinder {
    state: RefCell<UnwindState>,
}

impl FiberUnwinder {
    pub const NAME: &'static str = "ruby-fiber";

    pub fn new() -> Self {
        Self::default()
    }

    /// 有効なコンテキスト（状態はここからだけ読む）
    pub fn active_context(&self) -> Option<UnwindContext> {
        match &*self.state.borrow() {
            UnwindState::Active(context) => Some(context.clone()),
            UnwindState::Inactive => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_context().is_some()
    }

    /// 有効にする（前のコンテキストは置き換わる）
    pub fn activate(&self, session: &Session, context: UnwindContext) {
        tracing::debug!(
            fiber = format_args!("0x{:x}", context.fiber),
            rip = format_args!("0x{:x}", context.registers.rip),
            "fiber unwinder activated"
        );
        *self.state.borrow_mut() = UnwindState::Active(context);
        session.invalidate_frames();
    }

    pub fn deactivate(&self, session: &Session) {
        if self.is_active() {
            tracing::debug!("fiber unwinder deactivated");
        }
        *self.state.borrow_mut() = UnwindState::Inactive;
        session.invalidate_frames();
    }
}

impl UnwindStrategy for FiberUnwinder {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn redirect(&self, _session: &Session) -> Option<FrameState> {
        let context = self.active_context()?;
        let state = context.registers.frame_state();
        (state.pc != 0 && state.sp != 0).then_some(state)
    }
}
