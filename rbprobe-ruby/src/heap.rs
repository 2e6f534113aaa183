//! ヒープのスキャン
//!
//! `objspace->heap_pages.sorted` のページを順にたどり、スロットごとに `RBasic.flags` を
//! 読みます。フラグが0のスロットは空きです。ページは一括で読み、失敗したときだけ
//! スロット単位の読み取りに切り替えます。ページヘッダが読めないページは飛ばします。

use crate::context::RubyVm;
use crate::errors::RuntimeError;
use crate::runtime::Runtime;
use crate::Result;
use rbprobe_core::Value;
use std::fmt;

/// 進捗をログに出す間隔（オブジェクト数）
const PROGRESS_INTERVAL: usize = 10_000;

/// ヒープページ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapPage {
    pub index: usize,
    pub start: u64,
    pub slot_size: u64,
    pub total_slots: u64,
}

impl HeapPage {
    pub fn slot_address(&self, slot: u64) -> u64 {
        self.start + slot * self.slot_size
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.start + self.total_slots * self.slot_size
    }
}

/// スキャンの再開位置（上位32ビットがページ、下位32ビットがスロット）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScanCursor(u64);

impl ScanCursor {
    pub fn new(page: usize, slot: u64) -> Self {
        ScanCursor(((page as u64) << 32) | (slot & 0xffff_ffff))
    }

    pub fn from_raw(raw: u64) -> Self {
        ScanCursor(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn page(&self) -> usize {
        (self.0 >> 32) as usize
    }

    pub fn slot(&self) -> u64 {
        self.0 & 0xffff_ffff
    }
}

impl fmt::Display for ScanCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x} (page {}, slot {})", self.0, self.page(), self.slot())
    }
}

/// 生きているオブジェクト
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapObject {
    pub address: u64,
    pub flags: u64,
    pub cursor: ScanCursor,
}

/// スキャン結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub matches: Vec<HeapObject>,
    /// 含めなかった最初の一致（Noneならヒープの終わりまで見た）
    pub next: Option<ScanCursor>,
    pub skipped_pages: usize,
    pub examined: usize,
}

/// ヒープスキャナ
pub struct HeapScanner<'r, 's> {
    rt: &'r Runtime<'s>,
    objspace: Value<'s>,
    page_count: usize,
    flags_offset: u64,
}

impl<'r, 's> HeapScanner<'r, 's> {
    pub fn new(rt: &'r Runtime<'s>) -> Result<Self> {
        let objspace = RubyVm::current(rt)?.objspace(rt)?;
        let heap_pages = objspace.field("heap_pages")?;
        let page_count = if heap_pages.has_field("allocated_pages") {
            heap_pages.field("allocated_pages")?.as_u64()?
        } else {
            heap_pages.field("sorted")?.field("meta")?.field("length")?.as_u64()?
        } as usize;
        let flags_offset = rt
            .session()
            .lookup_type("struct RBasic")
            .ok()
            .and_then(|ty| ty.direct_field("flags").map(|f| f.offset))
            .unwrap_or(0);
        tracing::debug!(pages = page_count, "heap scanner initialized");

        Ok(Self {
            rt,
            objspace,
            page_count,
            flags_offset,
        })
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// `index` 番目のページ
    pub fn page(&self, index: usize) -> Result<HeapPage> {
        let sorted = self.objspace.field("heap_pages")?.field("sorted")?;
        let page = if sorted.has_field("data") {
            sorted.field("data")?.index(index as i64)?
        } else {
            sorted.index(index as i64)?
        };
        Ok(HeapPage {
            index,
            start: page.field("start")?.as_u64()?,
            slot_size: page.field("slot_size")?.as_u64()?,
            total_slots: page.field("total_slots")?.as_u64()?,
        })
    }

    /// 生きているオブジェクトを順に返す（`from` の位置から）
    pub fn objects(&self, from: Option<ScanCursor>) -> HeapObjects<'_, 'r, 's> {
        let (page, slot) = from.map(|c| (c.page(), c.slot())).unwrap_or((0, 0));
        HeapObjects {
            scanner: self,
            page_index: page,
            slot,
            current: None,
            examined: 0,
            skipped_pages: 0,
        }
    }

    /// `filter` の型タグに一致するオブジェクトを最大 `limit` 個集める
    pub fn scan(&self, filter: Option<u64>, limit: Option<usize>, from: Option<ScanCursor>) -> ScanPage {
        let c = self.rt.constants();
        let mut result = ScanPage::default();
        let mut objects = self.objects(from);

        for object in &mut objects {
            if filter.is_some_and(|tag| c.tag_of(object.flags) != tag) {
                continue;
            }
            if limit.is_some_and(|limit| result.matches.len() >= limit) {
                result.next = Some(object.cursor);
                break;
            }
            result.matches.push(object);
        }

        result.examined = objects.examined;
        result.skipped_pages = objects.skipped_pages;
        tracing::debug!(
            matches = result.matches.len(),
            examined = result.examined,
            skipped = result.skipped_pages,
            "heap scan finished"
        );
        result
    }

    /// `type_ptr` を型に持つ `RTypedData` を探す
    ///
    /// `accept` が真を返したものが `limit` 件集まったところで走査をやめます。
    pub fn find_typed_data(
        &self,
        type_ptr: u64,
        limit: Option<usize>,
        mut accept: impl FnMut(&HeapObject) -> bool,
    ) -> Result<Vec<HeapObject>> {
        let data_tag = self.rt.constants().tag(crate::constants::RubyType::Data);
        let typed_data = self.rt.session().lookup_type("struct RTypedData")?;
        let mut found = Vec::new();

        for object in self.objects(None) {
            if limit.is_some_and(|limit| found.len() >= limit) {
                break;
            }
            if self.rt.constants().tag_of(object.flags) != data_tag {
                continue;
            }
            let data = Value::at(self.rt.session(), typed_data.clone(), object.address);
            match data.field("type").and_then(|t| t.as_u64()) {
                Ok(ty) if ty == type_ptr && accept(&object) => found.push(object),
                Ok(_) => {}
                Err(e) => tracing::debug!(address = format_args!("0x{:x}", object.address), "unreadable RTypedData: {:#}", e),
            }
        }
        Ok(found)
    }
}

/// `HeapScanner::objects` のイテレータ
pub struct HeapObjects<'h, 'r, 's> {
    scanner: &'h HeapScanner<'r, 's>,
    page_index: usize,
    slot: u64,
    /// 読み込み中のページと一括読み取りしたバイト列
    current: Option<(HeapPage, Option<Vec<u8>>)>,
    examined: usize,
    skipped_pages: usize,
}

impl HeapObjects<'_, '_, '_> {
    pub fn examined(&self) -> usize {
        self.examined
    }

    pub fn skipped_pages(&self) -> usize {
        self.skipped_pages
    }

    fn advance_page(&mut self) {
        self.current = None;
        self.page_index += 1;
        self.slot = 0;
    }

    fn load_page(&mut self) -> Option<(HeapPage, Option<Vec<u8>>)> {
        let page = match self.scanner.page(self.page_index) {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(page = self.page_index, "skipping unreadable heap page: {:#}", e);
                return None;
            }
        };
        if page.total_slots == 0 || page.slot_size == 0 {
            tracing::warn!(
                page = page.index,
                total_slots = page.total_slots,
                slot_size = page.slot_size,
                "skipping heap page with invalid dimensions"
            );
            return None;
        }
        let size = (page.total_slots * page.slot_size) as usize;
        let bytes = match self.scanner.rt.session().read_memory(page.start, size) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::debug!(page = page.index, "bulk page read failed, reading slots one by one: {:#}", e);
                None
            }
        };
        Some((page, bytes))
    }

    fn read_flags(&self, page: &HeapPage, bytes: Option<&[u8]>, slot: u64) -> Option<u64> {
        let offset = (slot * page.slot_size + self.scanner.flags_offset) as usize;
        if let Some(word) = bytes.and_then(|b| b.get(offset..offset + 8)) {
            return Some(u64::from_le_bytes(word.try_into().ok()?));
        }
        self.scanner
            .rt
            .session()
            .read_u64(page.start + offset as u64)
            .ok()
    }
}

impl Iterator for HeapObjects<'_, '_, '_> {
    type Item = HeapObject;

    fn next(&mut self) -> Option<HeapObject> {
        loop {
            if self.current.is_none() {
                if self.page_index >= self.scanner.page_count {
                    return None;
                }
                match self.load_page() {
                    Some(loaded) => self.current = Some(loaded),
                    None => {
                        self.skipped_pages += 1;
                        self.advance_page();
                        continue;
                    }
                }
            }

            let (page, bytes) = self.current.as_ref()?;
            let page = *page;
            if self.slot >= page.total_slots {
                self.advance_page();
                continue;
            }

            let slot = self.slot;
            self.slot += 1;
            let Some(flags) = self.read_flags(&page, bytes.as_deref(), slot) else {
                continue;
            };
            if flags == 0 {
                continue;
            }

            self.examined += 1;
            if self.examined % PROGRESS_INTERVAL == 0 {
                tracing::info!(examined = self.examined, page = page.index, "scanning heap");
            }
            return Some(HeapObject {
                address: page.slot_address(slot),
                flags,
                cursor: ScanCursor::new(page.index, slot),
            });
        }
    }
}

/// 型フィルタを解釈する
pub fn parse_type_filter(rt: &Runtime<'_>, text: &str) -> Result<u64> {
    let tag = rt
        .constants()
        .parse_type_filter(text)
        .ok_or_else(|| RuntimeError::UnknownTypeFilter(text.to_string()))?;
    if tag > rt.constants().t_mask {
        tracing::warn!(tag, "type value is outside the type-tag range");
    }
    Ok(tag)
}
