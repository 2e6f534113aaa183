//! ソース行情報

use crate::{DwarfLoader, DwarfSlice, Result};

/// ソース行情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

impl std::fmt::Display for LineInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// ソース行情報の取得
pub struct LineInfoProvider {
    context: addr2line::Context<DwarfSlice>,
}

impl LineInfoProvider {
    /// ソース行情報プロバイダを作成する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let context = addr2line::Context::from_dwarf(loader.build_dwarf()?)
            .map_err(|e| anyhow::anyhow!("Failed to build line table context: {}", e))?;
        Ok(Self { context })
    }

    /// ファイル内アドレスからソース行情報を取得する
    pub fn lookup(&self, addr: u64) -> Result<Option<LineInfo>> {
        let location = self
            .context
            .find_location(addr)
            .map_err(|e| anyhow::anyhow!("Failed to look up line for 0x{:x}: {}", addr, e))?;

        Ok(location.and_then(|loc| match (loc.file, loc.line) {
            (Some(file), Some(line)) => Some(LineInfo {
                file: file.to_string(),
                line,
                column: loc.column,
            }),
            _ => None,
        }))
    }
}
