//! コマンドライン引数と設定の解決

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// ログフィルタを指定する環境変数
pub const LOG_ENV: &str = "RBPROBE_LOG";

/// 既定のログフィルタ
pub const DEFAULT_LOG: &str = "warn";

/// ホームディレクトリに置く初期化ファイル名
pub const INIT_FILE_NAME: &str = ".rbprobeinit";

/// rbprobe - Ruby process inspector
#[derive(Debug, Parser)]
#[command(name = "rbprobe")]
#[command(version)]
#[command(about = "Inspect the Ruby runtime of a stopped process or a core dump", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: TargetCommand,

    /// Executable or libruby with debug information
    #[arg(long, global = true, value_name = "PATH")]
    pub binary: Option<PathBuf>,

    /// Run commands from FILE at startup instead of ~/.rbprobeinit
    #[arg(long, global = true, value_name = "FILE")]
    pub init_file: Option<PathBuf>,

    /// Do not run any init file
    #[arg(long, global = true)]
    pub no_init: bool,

    /// Run commands from FILE and exit
    #[arg(long, global = true, value_name = "FILE")]
    pub batch: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "rbprobe_ruby=trace" (overrides RBPROBE_LOG)
    #[arg(long, global = true, value_name = "FILTER")]
    pub log: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum TargetCommand {
    /// Attach to a running process
    Attach {
        /// Process ID to attach to
        #[arg(short, long)]
        pid: i32,
    },

    /// Open a core dump
    Core {
        /// Path to the core file
        core: PathBuf,
    },

    /// Open a PID or a core file, whichever the target turns out to be
    Open {
        /// PID, /proc/<pid> or core file path
        target: String,
    },
}

/// 検査対象
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Process(i32),
    Core(PathBuf),
    Detect(String),
}

/// 解決済みの設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub target: Target,
    pub binary: Option<PathBuf>,
    /// 起動時に実行するファイル（なければ `None`）
    pub init_file: Option<PathBuf>,
    pub batch: Option<PathBuf>,
    /// `tracing_subscriber::EnvFilter` に渡す文字列
    pub log: String,
}

impl Config {
    /// 引数、環境変数、ホームディレクトリから設定を決める
    ///
    /// ログは `--log`、`RBPROBE_LOG`、既定値の順に優先します。
    /// 初期化ファイルは明示されたものをそのまま使い、既定の `~/.rbprobeinit` は
    /// 存在する場合だけ使います。
    pub fn resolve(cli: Cli, env_log: Option<String>, home: Option<&Path>) -> Self {
        let target = match cli.command {
            TargetCommand::Attach { pid } => Target::Process(pid),
            TargetCommand::Core { core } => Target::Core(core),
            TargetCommand::Open { target } => Target::Detect(target),
        };

        let init_file = if cli.no_init {
            None
        } else if let Some(path) = cli.init_file {
            Some(path)
        } else {
            home.map(|dir| dir.join(INIT_FILE_NAME)).filter(|path| path.is_file())
        };

        let log = cli
            .log
            .or(env_log.filter(|filter| !filter.trim().is_empty()))
            .unwrap_or_else(|| DEFAULT_LOG.to_string());

        Self {
            target,
            binary: cli.binary,
            init_file,
            batch: cli.batch,
            log,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("rbprobe").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_subcommands() {
        let config = Config::resolve(parse(&["attach", "--pid", "42"]), None, None);
        assert_eq!(config.target, Target::Process(42));

        let config = Config::resolve(parse(&["core", "core.1234", "--binary", "/usr/bin/ruby"]), None, None);
        assert_eq!(config.target, Target::Core(PathBuf::from("core.1234")));
        assert_eq!(config.binary, Some(PathBuf::from("/usr/bin/ruby")));

        let config = Config::resolve(parse(&["open", "/proc/1"]), None, None);
        assert_eq!(config.target, Target::Detect("/proc/1".to_string()));
    }

    #[test]
    fn test_missing_target_is_rejected() {
        assert!(Cli::try_parse_from(["rbprobe"]).is_err());
        assert!(Cli::try_parse_from(["rbprobe", "attach"]).is_err());
    }

    #[test]
    fn test_log_precedence() {
        let config = Config::resolve(parse(&["open", "1"]), None, None);
        assert_eq!(config.log, DEFAULT_LOG);

        let config = Config::resolve(parse(&["open", "1"]), Some("info".to_string()), None);
        assert_eq!(config.log, "info");

        let config = Config::resolve(parse(&["open", "1", "--log", "debug"]), Some("info".to_string()), None);
        assert_eq!(config.log, "debug");

        let config = Config::resolve(parse(&["open", "1"]), Some("  ".to_string()), None);
        assert_eq!(config.log, DEFAULT_LOG);
    }

    #[test]
    fn test_init_file_resolution() {
        let home = std::env::temp_dir().join(format!("rbprobe-home-{}", std::process::id()));
        std::fs::create_dir_all(&home).unwrap();
        let default = home.join(INIT_FILE_NAME);

        // 既定のファイルがなければ何も実行しない
        std::fs::remove_file(&default).ok();
        let config = Config::resolve(parse(&["open", "1"]), None, Some(&home));
        assert_eq!(config.init_file, None);

        std::fs::write(&default, "rb-context\n").unwrap();
        let config = Config::resolve(parse(&["open", "1"]), None, Some(&home));
        assert_eq!(config.init_file, Some(default.clone()));

        let config = Config::resolve(parse(&["open", "1", "--no-init"]), None, Some(&home));
        assert_eq!(config.init_file, None);

        let config = Config::resolve(parse(&["open", "1", "--init-file", "/tmp/other"]), None, Some(&home));
        assert_eq!(config.init_file, Some(PathBuf::from("/tmp/other")));

        std::fs::remove_dir_all(&home).ok();
    }

    #[test]
    fn test_batch_option() {
        let config = Config::resolve(parse(&["--batch", "cmds.txt", "core", "core.1"]), None, None);
        assert_eq!(config.batch, Some(PathBuf::from("cmds.txt")));
    }
}
