//! デバッガのメインロジック
//!
//! セッションとコマンド登録先をまとめ、コマンド行を実行します。

use crate::backend::Backend;
use crate::command::{CommandContext, CommandRegistry};
use crate::{builtins, Result, Session};
use std::cell::Cell;
use std::io::Write;
use std::path::Path;

/// デバッガ
pub struct Debugger {
    session: Session,
    registry: CommandRegistry,
    quit: Cell<bool>,
}

impl Debugger {
    /// バックエンドからデバッガを作成し、組み込みコマンドを登録する
    pub fn new(backend: Box<dyn Backend>) -> Result<Self> {
        let mut registry = CommandRegistry::new();
        builtins::install(&mut registry)?;
        Ok(Self {
            session: Session::new(backend),
            registry,
            quit: Cell::new(false),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// 拡張コマンドを登録するための可変参照
    pub fn registry_mut(&mut self) -> &mut CommandRegistry {
        &mut self.registry
    }

    /// `quit` が実行されたか
    pub fn quit_requested(&self) -> bool {
        self.quit.get()
    }

    /// コマンド行を実行する
    pub fn execute(&self, line: &str, out: &mut dyn Write, from_tty: bool) -> Result<()> {
        CommandContext::new(&self.session, &self.registry, out, &self.quit).dispatch(line, from_tty)
    }

    /// コマンド行を実行し、失敗は `Error: ...` として出力する
    pub fn run_line(&self, line: &str, out: &mut dyn Write) {
        if let Err(e) = self.execute(line, out, true) {
            tracing::debug!(line, "command failed: {:#}", e);
            let _ = writeln!(out, "Error: {:#}", e);
        }
    }

    /// ファイルの各行をコマンドとして実行する（init ファイルとバッチ用）
    pub fn run_script(&self, path: &Path, out: &mut dyn Write) -> Result<()> {
        let script = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        for line in script.lines() {
            if self.quit_requested() {
                break;
            }
            self.run_line(line, out);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;

    #[test]
    fn test_run_script() {
        let debugger = Debugger::new(Box::new(MockBackend::new())).unwrap();
        let path = std::env::temp_dir().join(format!("rbprobe-script-{}.txt", std::process::id()));
        std::fs::write(&path, "# comment\nset $a = 40 + 2\np $a\nquit\np $a\n").unwrap();

        let mut out = Vec::new();
        debugger.run_script(&path, &mut out).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(String::from_utf8(out).unwrap(), "(long) 42\n");
        assert!(debugger.quit_requested());
    }

    #[test]
    fn test_error_is_printed() {
        let debugger = Debugger::new(Box::new(MockBackend::new())).unwrap();
        let mut out = Vec::new();
        debugger.run_line("p nothing_here", &mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Error: Failed to evaluate 'nothing_here'"), "{}", text);
    }
}
