//! ELFとDWARFの読み込み機能

use crate::{DwarfSlice, Result};
use std::path::{Path, PathBuf};
use std::fs;
use std::rc::Rc;
use object::{Object, ObjectSection};

/// DWARFローダー
pub struct DwarfLoader {
    /// 読み込んだファイルのパス
    path: PathBuf,
    /// オブジェクトファイル
    object_file: Rc<object::File<'static>>,
    /// DWARFコンテキスト
    dwarf: gimli::Dwarf<DwarfSlice>,
}

impl DwarfLoader {
    /// ELFファイルからDWARF情報を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file_data = fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", path, e))?;

        // セッション中はずっと参照されるので、Box::leakで'staticライフタイムを得る
        let file_data: &'static [u8] = Box::leak(file_data.into_boxed_slice());

        let object_file = object::File::parse(file_data)
            .map_err(|e| anyhow::anyhow!("Failed to parse ELF file {:?}: {}", path, e))?;

        let dwarf = Self::load_sections(&object_file)?;
        tracing::debug!(?path, "loaded DWARF sections");

        Ok(Self {
            path: path.to_path_buf(),
            object_file: Rc::new(object_file),
            dwarf,
        })
    }

    /// オブジェクトファイルからDWARFセクションを読み込む
    fn load_sections(object_file: &object::File<'static>) -> Result<gimli::Dwarf<DwarfSlice>> {
        let endian = if object_file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        let load_section = |id: gimli::SectionId| -> Result<DwarfSlice> {
            let data = object_file
                .section_by_name(id.name())
                .and_then(|section| section.data().ok())
                .unwrap_or(&[]);
            Ok(gimli::EndianSlice::new(data, endian))
        };

        gimli::Dwarf::load(load_section)
            .map_err(|e| anyhow::anyhow!("Failed to load DWARF sections: {}", e))
    }

    /// DWARFコンテキストを新しく構築する（addr2lineなど所有権が必要な利用者向け）
    pub fn build_dwarf(&self) -> Result<gimli::Dwarf<DwarfSlice>> {
        Self::load_sections(&self.object_file)
    }

    /// DWARFコンテキストへの参照を取得
    pub fn dwarf(&self) -> &gimli::Dwarf<DwarfSlice> {
        &self.dwarf
    }

    /// オブジェクトファイルへの参照を取得
    pub fn object_file(&self) -> &object::File<'static> {
        &self.object_file
    }

    /// 読み込んだファイルのパス
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// デバッグ情報（.debug_info）を持っているか
    pub fn has_debug_info(&self) -> bool {
        self.object_file
            .section_by_name(".debug_info")
            .map(|section| section.size() > 0)
            .unwrap_or(false)
    }

    /// 位置独立（PIEまたは共有ライブラリ）かどうかを判定する
    ///
    /// 位置独立の場合、シンボルアドレスはオフセットであり、
    /// 実行時ロードバイアスを加算する必要があります。
    pub fn is_pie(&self) -> bool {
        use object::ObjectKind;

        // ET_DYN = PIE実行ファイルまたは共有ライブラリ
        matches!(self.object_file.kind(), ObjectKind::Dynamic)
    }
}
