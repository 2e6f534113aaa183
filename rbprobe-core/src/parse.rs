//! パース関連のユーティリティ関数

use anyhow::Result;
use std::collections::HashMap;

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポート
///
/// # Examples
/// ```
/// use rbprobe_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| anyhow::anyhow!("Invalid hexadecimal address '{}': {}", s, e))
    } else {
        s.parse::<u64>()
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e))
    }
}

/// コマンド引数
///
/// 位置引数（式）と `--option value`、`--flag` を扱います。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arguments {
    positional: Vec<String>,
    options: HashMap<String, String>,
    flags: Vec<String>,
}

impl Arguments {
    /// 引数文字列をパースする（`value_options` に挙げたオプションは値を取る）
    pub fn parse(input: &str, value_options: &[&str]) -> Result<Self> {
        let mut args = Arguments::default();
        let mut words = split_words(input).into_iter();

        while let Some(word) = words.next() {
            match word.strip_prefix("--") {
                Some(name) if !name.is_empty() => {
                    // --name=value 形式
                    if let Some((name, value)) = name.split_once('=') {
                        args.options.insert(name.to_string(), value.to_string());
                    } else if value_options.contains(&name) {
                        let value = words
                            .next()
                            .ok_or_else(|| anyhow::anyhow!("Option --{} requires a value", name))?;
                        args.options.insert(name.to_string(), value);
                    } else {
                        args.flags.push(name.to_string());
                    }
                }
                _ => args.positional.push(word),
            }
        }

        Ok(args)
    }

    /// 位置引数
    pub fn positional(&self) -> &[String] {
        &self.positional
    }

    /// 位置引数をつなげた式（空ならNone）
    pub fn expression(&self) -> Option<String> {
        (!self.positional.is_empty()).then(|| self.positional.join(" "))
    }

    /// オプションの値
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    /// オプションを数値として取得する
    pub fn option_usize(&self, name: &str) -> Result<Option<usize>> {
        self.option(name)
            .map(|v| {
                v.parse::<usize>()
                    .map_err(|e| anyhow::anyhow!("Invalid value for --{}: '{}' ({})", name, v, e))
            })
            .transpose()
    }

    /// フラグが指定されたか
    pub fn flag(&self, name: &str) -> bool {
        self.flags.iter().any(|f| f == name)
    }
}

/// 空白で区切る（ダブルクォートで囲んだ部分は1語）
fn split_words(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in input.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}
