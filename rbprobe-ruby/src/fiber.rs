//! ファイバの検査と切り替え
//!
//! ファイバは `RTypedData.type == &fiber_data_type` の `T_DATA` オブジェクトです。
//! ヒープスキャンで見つけたファイバはインデックス付きでキャッシュし、
//! JSON（`{"0": "0x..."}`）に保存できます。

use crate::constants::RubyType;
use crate::context::{ContextSource, RubyContext};
use crate::errors::RuntimeError;
use crate::exception::RubyException;
use crate::heap::HeapScanner;
use crate::runtime::Runtime;
use crate::unwind::{FiberUnwinder, SavedRegisters, UnwindContext};
use crate::Result;
use rbprobe_core::parse::parse_address;
use rbprobe_core::{DebuggerError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// 切り替えで設定・解除するコンビニエンス変数
pub const SWITCH_VARIABLES: &[&str] = &["fiber", "fiber_ptr", "ec", "cfp", "errinfo", "retval"];

/// `rb_fiber_struct.status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    Created,
    Resumed,
    Suspended,
    Terminated,
    Unknown(u64),
}

impl FiberStatus {
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            0 => FiberStatus::Created,
            1 => FiberStatus::Resumed,
            2 => FiberStatus::Suspended,
            3 => FiberStatus::Terminated,
            other => FiberStatus::Unknown(other),
        }
    }
}

impl fmt::Display for FiberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberStatus::Created => f.write_str("CREATED"),
            FiberStatus::Resumed => f.write_str("RESUMED"),
            FiberStatus::Suspended => f.write_str("SUSPENDED"),
            FiberStatus::Terminated => f.write_str("TERMINATED"),
            FiberStatus::Unknown(raw) => write!(f, "UNKNOWN({})", raw),
        }
    }
}

/// `&fiber_data_type`
pub fn fiber_data_type(rt: &Runtime<'_>) -> Result<u64> {
    match rt.global_address("fiber_data_type") {
        Some(address) if address != 0 => Ok(address),
        _ => Err(RuntimeError::FiberTypeUnavailable("symbol not found".to_string()).into()),
    }
}

/// ファイバオブジェクト
pub struct Fiber<'s> {
    value: u64,
    /// `struct rb_fiber_struct *`
    ptr: Value<'s>,
}

impl<'s> Fiber<'s> {
    /// ファイバの `VALUE` から読む（型を確認する）
    pub fn from_value(rt: &Runtime<'s>, value: u64) -> Result<Self> {
        let type_ptr = fiber_data_type(rt)?;
        check_fiber(rt, type_ptr, value)?;
        let data = rt.object(value, "struct RTypedData")?.field("data")?.as_u64()?;
        let ty = rt.session().lookup_type("struct rb_fiber_struct *")?;
        Ok(Self {
            value,
            ptr: Value::scalar(rt.session(), ty, data),
        })
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn address(&self) -> u64 {
        self.ptr.as_u64().unwrap_or(0)
    }

    pub fn pointer(&self) -> &Value<'s> {
        &self.ptr
    }

    pub fn status(&self) -> Result<FiberStatus> {
        Ok(FiberStatus::from_raw(self.ptr.field("status")?.as_u64()?))
    }

    /// `context.stack_pointer`
    pub fn stack_pointer(&self) -> Result<u64> {
        self.ptr.field("context")?.field("stack_pointer")?.as_u64()
    }

    pub fn stack_base(&self) -> Result<u64> {
        self.ptr.field("stack")?.field("base")?.as_u64()
    }

    pub fn stack_size(&self) -> Result<u64> {
        self.ptr.field("stack")?.field("size")?.as_u64()
    }

    /// `&fiber->cont.saved_ec`
    pub fn ec_address(&self) -> Result<u64> {
        self.ptr
            .field("cont")?
            .field("saved_ec")?
            .address()
            .ok_or_else(|| anyhow::anyhow!("saved_ec is not in memory"))
    }

    pub fn context(&self, rt: &Runtime<'s>) -> Result<RubyContext<'s>> {
        RubyContext::at(rt, self.ec_address()?, ContextSource::Fiber)
    }

    pub fn exception(&self, rt: &Runtime<'s>) -> Option<RubyException> {
        self.context(rt).ok()?.exception(rt)
    }

    /// 一覧用の概要
    pub fn describe(&self, rt: &Runtime<'s>) -> Vec<String> {
        let mut lines = Vec::new();
        match self.status() {
            Ok(status) => lines.push(format!("  Status: {}", status)),
            Err(e) => lines.push(format!("  Status: <error: {:#}>", e)),
        }
        if let Some(exception) = self.exception(rt) {
            lines.push(format!("  Exception: {} <VALUE@0x{:x}>", exception, exception.address));
        }
        match (self.stack_base(), self.stack_size()) {
            (Ok(base), Ok(size)) => lines.push(format!("  Stack: <void *@0x{:x}> size={}", base, size)),
            _ => lines.push("  Stack: <unavailable>".to_string()),
        }
        if let Ok(context) = self.context(rt) {
            if let Ok(vm_stack) = context.vm_stack() {
                lines.push(format!("  VM Stack: <VALUE *@0x{:x}>", vm_stack));
            }
            if let Ok(cfp) = context.cfp() {
                lines.push(format!("  CFP: <rb_control_frame_t@0x{:x}>", cfp));
            }
        }
        lines
    }
}

/// 生きているファイバオブジェクトか
fn check_fiber(rt: &Runtime<'_>, type_ptr: u64, value: u64) -> Result<()> {
    if rt.constants().is_special_const(value) {
        return Err(RuntimeError::UnexpectedType {
            address: value,
            expected: "Fiber object",
        }
        .into());
    }
    let tag = rt.heap_tag(value)?;
    if tag != rt.constants().tag(RubyType::Data) {
        anyhow::bail!("not a T_DATA object (type 0x{:x})", tag);
    }
    let ty = rt.object(value, "struct RTypedData")?.field("type")?.as_u64()?;
    if ty != type_ptr {
        anyhow::bail!("RTypedData.type is 0x{:x}, not &fiber_data_type", ty);
    }
    Ok(())
}

/// キャッシュの1エントリ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiberRecord {
    pub index: usize,
    /// ファイバの `VALUE`
    pub address: u64,
}

impl FiberRecord {
    pub fn fiber<'s>(&self, rt: &Runtime<'s>) -> Result<Fiber<'s>> {
        Fiber::from_value(rt, self.address)
    }
}

/// キャッシュファイルの形式（インデックス -> `"0x..."`）
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
struct CacheFile(BTreeMap<usize, String>);

/// ファイバキャッシュ（セッション単位）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FiberCache {
    entries: BTreeMap<usize, u64>,
}

impl FiberCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_addresses(addresses: impl IntoIterator<Item = u64>) -> Self {
        Self {
            entries: addresses.into_iter().enumerate().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<FiberRecord> {
        self.entries.get(&index).map(|&address| FiberRecord { index, address })
    }

    pub fn records(&self) -> impl Iterator<Item = FiberRecord> + '_ {
        self.entries
            .iter()
            .map(|(&index, &address)| FiberRecord { index, address })
    }

    pub fn addresses(&self) -> Vec<u64> {
        self.entries.values().copied().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// `{"0": "0x...", ...}` 形式（キーは数値順）
    pub fn to_json(&self) -> Result<String> {
        let file = CacheFile(
            self.entries
                .iter()
                .map(|(&index, address)| (index, format!("0x{:x}", address)))
                .collect(),
        );
        Ok(serde_json::to_string_pretty(&file)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let CacheFile(map) = serde_json::from_str(text)?;
        let entries = map
            .into_iter()
            .map(|(index, address)| Ok((index, parse_address(&address)?)))
            .collect::<Result<_>>()?;
        Ok(Self { entries })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        tracing::debug!(path = %path.display(), fibers = self.len(), "saved fiber cache");
        Ok(())
    }

    /// ファイルから読み込み、各エントリを検証する
    ///
    /// ファイルがなければ `Ok(None)`。無効なエントリは警告して取り除き、
    /// 残りはインデックスを保ちます。
    pub fn load(rt: &Runtime<'_>, path: &Path) -> Result<Option<(Self, Vec<DebuggerError>)>> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut cache = Self::from_json(&text)?;
        let stale = cache.validate(rt)?;
        Ok(Some((cache, stale)))
    }

    /// 無効になったエントリを取り除く
    pub fn validate(&mut self, rt: &Runtime<'_>) -> Result<Vec<DebuggerError>> {
        let type_ptr = fiber_data_type(rt)?;
        let mut stale = Vec::new();
        self.entries.retain(|&index, &mut address| match check_fiber(rt, type_ptr, address) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(index, address = format_args!("0x{:x}", address), "stale fiber cache entry: {:#}", e);
                stale.push(DebuggerError::StaleCache {
                    index,
                    address,
                    reason: format!("{:#}", e),
                });
                false
            }
        });
        Ok(stale)
    }

    /// 終了したファイバを除く（状態が読めないものは残す）
    pub fn retain_live(&mut self, rt: &Runtime<'_>) {
        self.entries.retain(|_, &mut address| {
            !matches!(
                Fiber::from_value(rt, address).and_then(|f| f.status()),
                Ok(FiberStatus::Terminated)
            )
        });
    }
}

/// ヒープからファイバを探す
pub fn scan_heap(rt: &Runtime<'_>, limit: Option<usize>, include_terminated: bool) -> Result<FiberCache> {
    let type_ptr = fiber_data_type(rt)?;
    let scanner = HeapScanner::new(rt)?;
    let found = scanner.find_typed_data(type_ptr, limit, |object| {
        include_terminated
            || !matches!(
                Fiber::from_value(rt, object.address).and_then(|f| f.status()),
                Ok(FiberStatus::Terminated)
            )
    })?;

    let addresses: Vec<u64> = found.iter().map(|object| object.address).collect();
    tracing::debug!(fibers = addresses.len(), "fiber scan finished");
    Ok(FiberCache::from_addresses(addresses))
}

/// 切り替えの結果
#[derive(Debug, Clone)]
pub struct SwitchOutcome {
    pub fiber: u64,
    pub fiber_ptr: u64,
    pub status: FiberStatus,
    pub exception: Option<RubyException>,
    pub registers: SavedRegisters,
    /// 設定したコンビニエンス変数
    pub variables: Vec<&'static str>,
    pub warnings: Vec<String>,
}

fn invalid_target(target: &str, reason: impl Into<String>) -> anyhow::Error {
    DebuggerError::InvalidSwitchTarget {
        target: target.to_string(),
        reason: reason.into(),
    }
    .into()
}

/// キャッシュのインデックスで切り替える
pub fn switch_to_index(rt: &Runtime<'_>, unwinder: &FiberUnwinder, cache: &FiberCache, index: usize) -> Result<SwitchOutcome> {
    let record = cache.get(index).ok_or_else(|| {
        let reason = match cache.records().last() {
            Some(last) => format!("index out of range (cached indices 0..={})", last.index),
            None => "the fiber cache is empty".to_string(),
        };
        invalid_target(&index.to_string(), reason)
    })?;
    switch(rt, unwinder, &format!("#{}", index), record.address)
}

/// ファイバの `VALUE` に切り替える
///
/// 検証に失敗した場合は状態を変えずに `InvalidSwitchTarget` を返します。
pub fn switch(rt: &Runtime<'_>, unwinder: &FiberUnwinder, target: &str, value: u64) -> Result<SwitchOutcome> {
    let session = rt.session();
    let fiber = Fiber::from_value(rt, value).map_err(|e| invalid_target(target, format!("{:#}", e)))?;
    let status = fiber.status().map_err(|e| invalid_target(target, format!("{:#}", e)))?;
    if status == FiberStatus::Created {
        return Err(invalid_target(target, "fiber was created but never resumed, so it has no saved context"));
    }
    let stack_pointer = fiber.stack_pointer().map_err(|e| invalid_target(target, format!("{:#}", e)))?;
    if stack_pointer == 0 {
        return Err(invalid_target(target, "saved stack pointer is NULL"));
    }
    let registers = SavedRegisters::read(session, stack_pointer)
        .map_err(|e| invalid_target(target, format!("saved registers are unreadable: {:#}", e)))?;
    let ec = fiber.ec_address().map_err(|e| invalid_target(target, format!("{:#}", e)))?;
    // アンワインダを切り替える前にECを確かめる
    let context = fiber.context(rt).map_err(|e| invalid_target(target, format!("{:#}", e)))?;
    let cfp = context
        .cfp()
        .map_err(|e| invalid_target(target, format!("execution context is unreadable: {:#}", e)))?;
    if cfp == 0 {
        return Err(invalid_target(target, "saved control frame pointer is NULL"));
    }

    let mut warnings = Vec::new();
    if status == FiberStatus::Terminated {
        warnings.push("fiber is TERMINATED; its saved context may be stale".to_string());
    }
    if session.symbol_at(registers.rip).is_none() {
        warnings.push(format!("saved rip 0x{:x} does not resolve to a symbol", registers.rip));
    }
    if let (Ok(base), Ok(size)) = (fiber.stack_base(), fiber.stack_size()) {
        if registers.rsp < base || registers.rsp > base + size {
            warnings.push(format!(
                "saved rsp 0x{:x} is outside the fiber stack [0x{:x}, 0x{:x})",
                registers.rsp,
                base,
                base + size
            ));
        }
    }
    for warning in &warnings {
        tracing::warn!(fiber = target, "{}", warning);
    }

    unwinder.activate(
        session,
        UnwindContext {
            fiber: value,
            fiber_ptr: fiber.address(),
            ec,
            registers,
        },
    );

    clear_switch_variables(rt);
    session.set_convenience("fiber", &rt.value(value));
    session.set_convenience("fiber_ptr", fiber.pointer());
    let mut variables = vec!["fiber", "fiber_ptr"];
    variables.extend(context.set_convenience_variables(rt));
    if let Some(retval) = context.retval(rt) {
        session.set_convenience("retval", &rt.value(retval));
        variables.push("retval");
    }

    Ok(SwitchOutcome {
        fiber: value,
        fiber_ptr: fiber.address(),
        status,
        exception: context.exception(rt),
        registers,
        variables,
        warnings,
    })
}

/// 切り替えを解除する
pub fn switch_off(rt: &Runtime<'_>, unwinder: &FiberUnwinder) {
    unwinder.deactivate(rt.session());
    clear_switch_variables(rt);
}

fn clear_switch_variables(rt: &Runtime<'_>) {
    for name in SWITCH_VARIABLES {
        rt.session().clear_convenience(name);
    }
}
