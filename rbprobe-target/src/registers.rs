//! レジスタアクセス機能

use crate::Result;
use nix::unistd::Pid;

/// x86-64 汎用レジスタのスナップショット
///
/// 稼働中のプロセス（PTRACE_GETREGS）とコアダンプ（NT_PRSTATUS）の両方から構築されます。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub eflags: u64,
}

/// user_regs_struct のワード数
pub const USER_REGS_WORDS: usize = 27;

impl RegisterSnapshot {
    /// ptraceのuser_regs_structから構築する
    pub fn from_user_regs(regs: &nix::libc::user_regs_struct) -> Self {
        Self {
            rip: regs.rip,
            rsp: regs.rsp,
            rbp: regs.rbp,
            rbx: regs.rbx,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            rax: regs.rax,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            eflags: regs.eflags,
        }
    }

    /// user_regs_struct と同じ並びのワード列から構築する
    ///
    /// 並び: r15, r14, r13, r12, rbp, rbx, r11, r10, r9, r8, rax, rcx, rdx, rsi, rdi,
    /// orig_rax, rip, cs, eflags, rsp, ...
    pub fn from_user_regs_words(words: &[u64]) -> Result<Self> {
        if words.len() < USER_REGS_WORDS {
            return Err(anyhow::anyhow!(
                "Register block too short: {} words (expected {})",
                words.len(),
                USER_REGS_WORDS
            ));
        }

        Ok(Self {
            r15: words[0],
            r14: words[1],
            r13: words[2],
            r12: words[3],
            rbp: words[4],
            rbx: words[5],
            r11: words[6],
            r10: words[7],
            r9: words[8],
            r8: words[9],
            rax: words[10],
            rcx: words[11],
            rdx: words[12],
            rsi: words[13],
            rdi: words[14],
            rip: words[16],
            eflags: words[18],
            rsp: words[19],
        })
    }

    /// レジスタ名から値を取得する（`$rip` 形式の名前にも対応）
    pub fn get(&self, name: &str) -> Option<u64> {
        let value = match name.trim_start_matches('$') {
            "rip" | "pc" => self.rip,
            "rsp" | "sp" => self.rsp,
            "rbp" | "fp" => self.rbp,
            "rbx" => self.rbx,
            "r12" => self.r12,
            "r13" => self.r13,
            "r14" => self.r14,
            "r15" => self.r15,
            "rax" => self.rax,
            "rcx" => self.rcx,
            "rdx" => self.rdx,
            "rsi" => self.rsi,
            "rdi" => self.rdi,
            "r8" => self.r8,
            "r9" => self.r9,
            "r10" => self.r10,
            "r11" => self.r11,
            "eflags" => self.eflags,
            _ => return None,
        };
        Some(value)
    }
}

/// 稼働中スレッドのレジスタアクセス
pub struct Registers {
    pid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// レジスタを読み取る
    pub fn read(&self) -> Result<RegisterSnapshot> {
        let regs = nix::sys::ptrace::getregs(self.pid)
            .map_err(|e| anyhow::anyhow!("Failed to read registers of {}: {}", self.pid, e))?;
        Ok(RegisterSnapshot::from_user_regs(&regs))
    }

    /// プログラムカウンタ（RIP）を取得する
    pub fn get_pc(&self) -> Result<u64> {
        Ok(self.read()?.rip)
    }
}
