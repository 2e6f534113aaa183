//! スレッド管理機能

use crate::RegisterSnapshot;

/// スレッドID
pub type ThreadId = i32;

/// 検査対象のスレッド
///
/// コアダンプでは各スレッドのレジスタが NT_PRSTATUS に保存されています。
#[derive(Debug, Clone)]
pub struct Thread {
    tid: ThreadId,
    registers: RegisterSnapshot,
    signal: Option<i32>,
}

impl Thread {
    /// スレッドを作成する
    pub fn new(tid: ThreadId, registers: RegisterSnapshot, signal: Option<i32>) -> Self {
        Self {
            tid,
            registers,
            signal,
        }
    }

    /// スレッドIDを取得する
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    /// 保存されたレジスタを取得する
    pub fn registers(&self) -> &RegisterSnapshot {
        &self.registers
    }

    /// このスレッドが受け取っていたシグナル（0はNone）
    pub fn signal(&self) -> Option<i32> {
        self.signal
    }
}
