//! rbprobe CLI - コマンドラインインターフェース
//!
//! 停止中のRubyプロセスやコアダンプを検査する rbprobe のREPLインターフェース

mod config;

use anyhow::Result;
use clap::Parser;
use config::{Cli, Config, Target, LOG_ENV};
use rbprobe_core::backend::{self, Backend};
use rbprobe_core::{CoreBackend, Debugger, ProcessBackend};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::Write;
use std::path::Path;
use tracing_subscriber::EnvFilter;

const PROMPT: &str = "(rbprobe) ";

fn main() -> Result<()> {
    let cli = Cli::parse();
    let home = home::home_dir();
    let config = Config::resolve(cli, std::env::var(LOG_ENV).ok(), home.as_deref());
    init_logging(&config.log);
    tracing::debug!(?config, "resolved configuration");

    let debugger = init_debugger(&config)?;
    let mut stdout = std::io::stdout();

    if let Some(init_file) = &config.init_file {
        tracing::info!(path = %init_file.display(), "running init file");
        debugger.run_script(init_file, &mut stdout)?;
    }

    if let Some(batch) = &config.batch {
        if !debugger.quit_requested() {
            debugger.run_script(batch, &mut stdout)?;
        }
        stdout.flush()?;
        return Ok(());
    }

    if debugger.quit_requested() {
        return Ok(());
    }
    run_repl(&debugger)
}

/// ログ出力を標準エラーに設定する
fn init_logging(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|e| {
        eprintln!("Warning: invalid log filter '{}': {}", filter, e);
        EnvFilter::new(config::DEFAULT_LOG)
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// バックエンドを開いてRubyのコマンドを登録する
fn init_debugger(config: &Config) -> Result<Debugger> {
    let backend = open_backend(&config.target, config.binary.as_deref())?;
    println!("Opened {} target", backend.name());

    let mut debugger = Debugger::new(backend)?;
    rbprobe_ruby::install(&mut debugger)?;
    Ok(debugger)
}

fn open_backend(target: &Target, binary: Option<&Path>) -> Result<Box<dyn Backend>> {
    match target {
        Target::Process(pid) => {
            println!("Attaching to process: {}", pid);
            Ok(Box::new(ProcessBackend::attach(*pid, binary)?))
        }
        Target::Core(path) => {
            println!("Loading core file: {}", path.display());
            Ok(Box::new(CoreBackend::open(path, binary)?))
        }
        Target::Detect(target) => backend::detect(target, binary),
    }
}

/// REPLループを実行する
fn run_repl(debugger: &Debugger) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;
    let mut stdout = std::io::stdout();

    loop {
        match rl.readline(PROMPT) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;
                debugger.run_line(line, &mut stdout);
                stdout.flush()?;

                if debugger.quit_requested() {
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}
