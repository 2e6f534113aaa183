//! プロセス制御機能
//!
//! 検査は読み取り専用なので、ここで行うのはアタッチ（停止）とデタッチだけです。

use crate::{Memory, Registers, Result};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// 停止イベントの種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// シグナルで停止（アタッチ直後はSIGSTOP）
    Signal(Signal),
    /// プロセス終了
    Exited(i32),
    /// シグナルで終了
    Killed(Signal),
    /// その他の停止
    Other,
}

/// アタッチ中のプロセス
pub struct Process {
    pid: Pid,
    stop_reason: StopReason,
}

impl Process {
    /// 既存のプロセスにアタッチして停止を待つ
    pub fn attach(pid: i32) -> Result<Self> {
        use nix::sys::wait::{waitpid, WaitStatus};

        let pid = Pid::from_raw(pid);
        nix::sys::ptrace::attach(pid)
            .map_err(|e| anyhow::anyhow!("Failed to attach to process {}: {}", pid, e))?;

        let stop_reason = match waitpid(pid, None)? {
            WaitStatus::Stopped(_, signal) => StopReason::Signal(signal),
            WaitStatus::Exited(_, code) => StopReason::Exited(code),
            WaitStatus::Signaled(_, signal, _) => StopReason::Killed(signal),
            _ => StopReason::Other,
        };
        tracing::debug!(pid = pid.as_raw(), ?stop_reason, "attached");

        match stop_reason {
            StopReason::Exited(code) => {
                Err(anyhow::anyhow!("Process {} exited with code {} during attach", pid, code))
            }
            StopReason::Killed(signal) => {
                Err(anyhow::anyhow!("Process {} was killed by {:?} during attach", pid, signal))
            }
            _ => Ok(Self { pid, stop_reason }),
        }
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// アタッチ時の停止理由
    pub fn stop_reason(&self) -> &StopReason {
        &self.stop_reason
    }

    /// メモリアクセスを作成する
    pub fn memory(&self) -> Memory {
        Memory::new(self.pid())
    }

    /// レジスタアクセスを作成する
    pub fn registers(&self) -> Registers {
        Registers::new(self.pid())
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        let _ = nix::sys::ptrace::detach(self.pid, None);
    }
}
