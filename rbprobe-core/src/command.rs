//! デバッガコマンドの登録と実行
//!
//! 2通りの登録方法に対応します。
//! - `Command` を実装した型を `CommandRegistry::register` で登録する
//! - 関数を `define` で定義し、`install` で名前を付けて公開する

use crate::{Result, Session};
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::rc::Rc;

/// ヘルプでの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommandCategory {
    Data,
    Stack,
    Status,
    Support,
}

impl CommandCategory {
    pub fn label(&self) -> &'static str {
        match self {
            CommandCategory::Data => "data",
            CommandCategory::Stack => "stack",
            CommandCategory::Status => "status",
            CommandCategory::Support => "support",
        }
    }
}

/// デバッガコマンド
pub trait Command {
    fn name(&self) -> &str;

    fn category(&self) -> CommandCategory {
        CommandCategory::Data
    }

    /// 1行目が一覧に表示される
    fn help(&self) -> &str;

    fn aliases(&self) -> &[&'static str] {
        &[]
    }

    /// コマンドを実行する
    fn invoke(&self, ctx: &mut CommandContext<'_>, args: &str, from_tty: bool) -> Result<()>;
}

/// 関数で定義するコマンドの本体
pub type CommandFn = Rc<dyn Fn(&mut CommandContext<'_>, &str, bool) -> Result<()>>;

/// `define` で作られたコマンド
struct FunctionCommand {
    name: String,
    category: CommandCategory,
    help: String,
    func: CommandFn,
}

impl Command for FunctionCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> CommandCategory {
        self.category
    }

    fn help(&self) -> &str {
        &self.help
    }

    fn invoke(&self, ctx: &mut CommandContext<'_>, args: &str, from_tty: bool) -> Result<()> {
        (self.func)(ctx, args, from_tty)
    }
}

/// コマンドの登録先
#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Rc<dyn Command>>,
    aliases: HashMap<String, String>,
    /// 定義済みで未公開の関数コマンド
    defined: HashMap<String, (CommandCategory, String, CommandFn)>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// コマンドオブジェクトを登録する
    pub fn register<C: Command + 'static>(&mut self, command: C) {
        let name = command.name().to_string();
        for alias in command.aliases() {
            self.aliases.insert(alias.to_string(), name.clone());
        }
        tracing::debug!(command = %name, "registered command");
        self.commands.insert(name, Rc::new(command));
    }

    /// 関数コマンドを定義する（`install` するまで呼び出せない）
    pub fn define<F>(&mut self, name: &str, category: CommandCategory, help: &str, func: F)
    where
        F: Fn(&mut CommandContext<'_>, &str, bool) -> Result<()> + 'static,
    {
        self.defined
            .insert(name.to_string(), (category, help.to_string(), Rc::new(func)));
    }

    /// 定義済みの関数コマンドを `as_name` で公開する
    pub fn install(&mut self, name: &str, as_name: &str) -> Result<()> {
        let (category, help, func) = self
            .defined
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Command '{}' is not defined", name))?;
        self.register(FunctionCommand {
            name: as_name.to_string(),
            category,
            help,
            func,
        });
        Ok(())
    }

    /// 別名を追加する
    pub fn alias(&mut self, alias: &str, target: &str) {
        self.aliases.insert(alias.to_string(), target.to_string());
    }

    /// 名前（または別名）でコマンドを検索する
    pub fn lookup(&self, name: &str) -> Option<Rc<dyn Command>> {
        let name = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        self.commands.get(name).cloned()
    }

    /// コマンド行をコマンドと引数に分ける（"info threads" のような2語の名前を優先）
    pub fn resolve<'l>(&self, line: &'l str) -> Option<(Rc<dyn Command>, &'l str)> {
        let line = line.trim();
        let (first, rest) = split_first_word(line);
        if !rest.is_empty() {
            let (second, tail) = split_first_word(rest);
            if let Some(command) = self.lookup(&format!("{} {}", first, second)) {
                return Some((command, tail));
            }
        }
        self.lookup(first).map(|command| (command, rest))
    }

    /// 登録済みのコマンド（名前順）
    pub fn commands(&self) -> impl Iterator<Item = &Rc<dyn Command>> {
        self.commands.values()
    }

    /// コマンドの別名一覧
    pub fn aliases_of(&self, name: &str) -> Vec<String> {
        let mut aliases: Vec<String> = self
            .aliases
            .iter()
            .filter(|(_, target)| target.as_str() == name)
            .map(|(alias, _)| alias.clone())
            .collect();
        aliases.sort();
        aliases
    }
}

fn split_first_word(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(pos) => (&line[..pos], line[pos..].trim_start()),
        None => (line, ""),
    }
}

/// コマンド実行時のコンテキスト
pub struct CommandContext<'a> {
    session: &'a Session,
    registry: &'a CommandRegistry,
    out: &'a mut dyn Write,
    quit: &'a Cell<bool>,
}

impl<'a> CommandContext<'a> {
    pub fn new(session: &'a Session, registry: &'a CommandRegistry, out: &'a mut dyn Write, quit: &'a Cell<bool>) -> Self {
        Self {
            session,
            registry,
            out,
            quit,
        }
    }

    pub fn session(&self) -> &'a Session {
        self.session
    }

    pub fn registry(&self) -> &'a CommandRegistry {
        self.registry
    }

    /// 出力先
    pub fn out(&mut self) -> &mut dyn Write {
        &mut *self.out
    }

    /// 終了を要求する
    pub fn request_quit(&self) {
        self.quit.set(true);
    }

    /// 別の登録済みコマンドを実行する
    pub fn execute(&mut self, line: &str) -> Result<()> {
        self.dispatch(line, false)
    }

    /// コマンド行を実行する
    pub fn dispatch(&mut self, line: &str, from_tty: bool) -> Result<()> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }
        let (command, args) = self
            .registry
            .resolve(line)
            .ok_or_else(|| anyhow::anyhow!("Undefined command: \"{}\". Try \"help\".", split_first_word(line).0))?;
        tracing::debug!(command = command.name(), args, "dispatch");
        command.invoke(self, args, from_tty)
    }
}
