//! ネイティブスタックのアンワインド
//!
//! x86-64 System V のフレームポインタチェーンをたどります。
//! 登録された `UnwindStrategy` が有効な場合は、ライブレジスタの代わりに
//! 戦略が返すレジスタ状態から呼び出し元をたどります（中断中のファイバの調査用）。

use crate::{Result, Session};
use std::cell::RefCell;
use std::rc::Rc;

/// バックトレースの最大フレーム数
pub const MAX_FRAMES: usize = 256;

/// 1フレーム分のレジスタ状態
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameState {
    pub pc: u64,
    pub sp: u64,
    pub fp: u64,
}

/// アンワインド戦略
pub trait UnwindStrategy {
    fn name(&self) -> &str;

    /// 有効なら、ライブのフレーム#0の呼び出し元として使うレジスタ状態を返す
    fn redirect(&self, session: &Session) -> Option<FrameState>;
}

/// アンワインド戦略の登録先
#[derive(Default)]
pub struct UnwinderRegistry {
    strategies: RefCell<Vec<Rc<dyn UnwindStrategy>>>,
}

impl UnwinderRegistry {
    pub fn register(&self, strategy: Rc<dyn UnwindStrategy>) {
        tracing::debug!(name = strategy.name(), "registered unwinder");
        self.strategies.borrow_mut().push(strategy);
    }

    /// 最初に有効な戦略の名前とレジスタ状態
    pub fn redirect(&self, session: &Session) -> Option<(String, FrameState)> {
        self.strategies
            .borrow()
            .iter()
            .find_map(|s| s.redirect(session).map(|state| (s.name().to_string(), state)))
    }

    pub fn names(&self) -> Vec<String> {
        self.strategies.borrow().iter().map(|s| s.name().to_string()).collect()
    }
}

/// ネイティブフレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeFrame {
    pub index: usize,
    pub pc: u64,
    pub sp: u64,
    pub fp: u64,
    /// 関数名
    pub function: Option<String>,
    /// 関数の先頭アドレス
    pub function_start: Option<u64>,
    /// ソース位置
    pub location: Option<String>,
    /// 戦略が差し込んだフレームの手前にある、ライブのpcだけのフレーム
    pub synthetic: bool,
}

impl NativeFrame {
    /// `#1  0x... in func () at file:line` 形式
    pub fn describe(&self) -> String {
        let mut line = format!("#{:<3}0x{:016x} in {} ()", self.index, self.pc, self.function.as_deref().unwrap_or("??"));
        if let Some(location) = &self.location {
            line.push_str(&format!(" at {}", location));
        }
        if self.synthetic {
            line.push_str(" [live]");
        }
        line
    }
}

/// バックトレースを作る
pub fn unwind(session: &Session, limit: usize) -> Result<Vec<NativeFrame>> {
    let regs = session.registers()?;
    let live = FrameState {
        pc: regs.rip,
        sp: regs.rsp,
        fp: regs.rbp,
    };

    let mut frames = Vec::new();
    let mut state = match session.unwinders().redirect(session) {
        Some((name, redirected)) => {
            tracing::debug!(strategy = %name, pc = format_args!("0x{:x}", redirected.pc), "unwinding from redirected context");
            frames.push(make_frame(session, 0, live, true, true));
            redirected
        }
        None => live,
    };

    while frames.len() < limit && state.pc != 0 {
        let index = frames.len();
        // 呼び出し元フレームのpcは戻りアドレスなので、1つ手前で関数を引く
        frames.push(make_frame(session, index, state, index == 0, false));

        match frame_pointer_step(session, state) {
            Some(next) => state = next,
            None => break,
        }
    }

    Ok(frames)
}

fn make_frame(session: &Session, index: usize, state: FrameState, exact_pc: bool, synthetic: bool) -> NativeFrame {
    let lookup_pc = if exact_pc { state.pc } else { state.pc.saturating_sub(1) };
    let symbol = session.symbol_at(lookup_pc);
    NativeFrame {
        index,
        pc: state.pc,
        sp: state.sp,
        fp: state.fp,
        function: symbol.as_ref().map(|s| s.name.clone()),
        function_start: symbol.as_ref().map(|s| s.start),
        location: symbol.and_then(|s| s.location),
        synthetic,
    }
}

/// `[rbp]` に保存されたrbp、`[rbp+8]` に戻りアドレス
fn frame_pointer_step(session: &Session, state: FrameState) -> Option<FrameState> {
    if state.fp == 0 {
        return None;
    }
    let saved_fp = session.read_u64(state.fp).ok()?;
    let return_address = session.read_u64(state.fp.wrapping_add(8)).ok()?;
    if return_address == 0 {
        return None;
    }

    // スタックは上位アドレスへ伸びるので、保存されたrbpは増えていくはず
    let fp = if saved_fp > state.fp { saved_fp } else { 0 };
    Some(FrameState {
        pc: return_address,
        sp: state.fp.wrapping_add(16),
        fp,
    })
}
