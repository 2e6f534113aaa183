//! VMスタックの走査
//!
//! `ec->cfp` から `(rb_control_frame_t *)(vm_stack + vm_stack_size) - 1` の手前まで、
//! コントロールフレームを内側から外側へたどります。

use crate::constants::RubyType;
use crate::context::RubyContext;
use crate::rarray::RArray;
use crate::rstring::RString;
use crate::rsymbol::id_to_name;
use crate::runtime::Runtime;
use crate::Result;
use rbprobe_core::{NativeFrame, Value};
use regex::Regex;
use std::fmt;

/// 走査するフレーム数の上限
const MAX_VM_FRAMES: usize = 10_000;
/// `--values` で表示するスロット数
pub const MAX_STACK_VALUES: usize = 10;
/// `insns_info.positions` を読む上限
const MAX_POSITIONS: u64 = 1 << 20;

/// `VM_FRAME_MAGIC_*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMagic {
    Method,
    Block,
    Class,
    Top,
    Cfunc,
    Ifunc,
    Eval,
    Rescue,
    Dummy,
}

impl FrameMagic {
    const ALL: [FrameMagic; 9] = [
        FrameMagic::Method,
        FrameMagic::Block,
        FrameMagic::Class,
        FrameMagic::Top,
        FrameMagic::Cfunc,
        FrameMagic::Ifunc,
        FrameMagic::Eval,
        FrameMagic::Rescue,
        FrameMagic::Dummy,
    ];

    fn enumerator(&self) -> &'static str {
        match self {
            FrameMagic::Method => "VM_FRAME_MAGIC_METHOD",
            FrameMagic::Block => "VM_FRAME_MAGIC_BLOCK",
            FrameMagic::Class => "VM_FRAME_MAGIC_CLASS",
            FrameMagic::Top => "VM_FRAME_MAGIC_TOP",
            FrameMagic::Cfunc => "VM_FRAME_MAGIC_CFUNC",
            FrameMagic::Ifunc => "VM_FRAME_MAGIC_IFUNC",
            FrameMagic::Eval => "VM_FRAME_MAGIC_EVAL",
            FrameMagic::Rescue => "VM_FRAME_MAGIC_RESCUE",
            FrameMagic::Dummy => "VM_FRAME_MAGIC_DUMMY",
        }
    }

    fn default_value(&self) -> u64 {
        match self {
            FrameMagic::Method => 0x1111_0001,
            FrameMagic::Block => 0x2222_0001,
            FrameMagic::Class => 0x3333_0001,
            FrameMagic::Top => 0x4444_0001,
            FrameMagic::Cfunc => 0x5555_0001,
            FrameMagic::Ifunc => 0x6666_0001,
            FrameMagic::Eval => 0x7777_0001,
            FrameMagic::Rescue => 0x7888_0001,
            FrameMagic::Dummy => 0x7999_0001,
        }
    }

    pub fn name(&self) -> &'static str {
        self.enumerator().trim_start_matches("VM_FRAME_MAGIC_")
    }
}

impl fmt::Display for FrameMagic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// フレームマジックの値表
pub struct FrameMagicTable {
    mask: u64,
    values: Vec<(FrameMagic, u64)>,
}

impl FrameMagicTable {
    const DEFAULT_MASK: u64 = 0x7fff_0001;

    pub fn load(rt: &Runtime<'_>) -> Self {
        let session = rt.session();
        let lookup = |name: &str, default: u64| {
            session
                .enum_value(Some("vm_frame_env_flags"), name)
                .or_else(|| session.enum_value(None, name))
                .map(|v| v as u64)
                .unwrap_or(default)
        };
        Self {
            mask: lookup("VM_FRAME_MAGIC_MASK", Self::DEFAULT_MASK),
            values: FrameMagic::ALL
                .iter()
                .map(|magic| (*magic, lookup(magic.enumerator(), magic.default_value())))
                .collect(),
        }
    }

    /// `ep[0]` からマジックを取り出す
    pub fn classify(&self, ep0: u64) -> Option<FrameMagic> {
        let magic = ep0 & self.mask;
        self.values.iter().find(|(_, v)| *v == magic).map(|(m, _)| *m)
    }
}

/// フレームの分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Method,
    Block,
    Cfunc,
    Internal,
}

/// iseqのソース位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub path: String,
    pub line: Option<i64>,
    pub label: String,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}:in '{}'", self.path, line, self.label),
            None => write!(f, "{}:???:in '{}'", self.path, self.label),
        }
    }
}

/// コントロールフレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmFrame {
    pub index: usize,
    /// `rb_control_frame_t *`
    pub cfp: u64,
    pub pc: u64,
    pub sp: u64,
    pub ep: u64,
    pub iseq: u64,
    pub self_value: u64,
    pub magic: Option<FrameMagic>,
    pub kind: FrameKind,
    pub location: Option<SourceLocation>,
    pub method_name: Option<String>,
    /// cfuncの関数ポインタ
    pub cfunc: Option<u64>,
    pub cfunc_symbol: Option<String>,
}

impl VmFrame {
    pub fn describe(&self) -> String {
        match self.kind {
            FrameKind::Cfunc => {
                let target = match (&self.cfunc_symbol, self.cfunc) {
                    (Some(symbol), _) => symbol.clone(),
                    (None, Some(func)) => format!("0x{:x}", func),
                    (None, None) => "?".to_string(),
                };
                match &self.method_name {
                    Some(name) => format!("[C function {} ({})]", name, target),
                    None => format!("[C function ({})]", target),
                }
            }
            FrameKind::Internal => match self.magic {
                Some(magic) => format!("[{}]", magic.name().to_lowercase()),
                None => "[internal frame]".to_string(),
            },
            FrameKind::Method | FrameKind::Block => match &self.location {
                Some(location) => location.to_string(),
                None => "???:???:in '???'".to_string(),
            },
        }
    }
}

/// VMフレームを読む
pub struct StackWalker<'r, 's> {
    rt: &'r Runtime<'s>,
    magics: FrameMagicTable,
}

impl<'r, 's> StackWalker<'r, 's> {
    pub fn new(rt: &'r Runtime<'s>) -> Self {
        Self {
            rt,
            magics: FrameMagicTable::load(rt),
        }
    }

    /// ECのフレームを内側から順に読む
    ///
    /// 読めないフレームに当たったら、そこまでのフレームとエラーを返します。
    pub fn walk(&self, ec: &RubyContext<'s>) -> Result<(Vec<VmFrame>, Option<anyhow::Error>)> {
        let cfp_type = self.rt.session().lookup_type("rb_control_frame_t")?;
        let cfp_size = cfp_type.size().max(1);
        let start = ec.cfp()?;
        let vm_stack = ec.vm_stack()?;
        let vm_stack_size = ec.vm_stack_size()?;
        let stack_end = vm_stack_size
            .checked_mul(8)
            .and_then(|bytes| vm_stack.checked_add(bytes))
            .ok_or_else(|| {
                anyhow::anyhow!("VM stack bounds overflow: vm_stack=0x{:x} vm_stack_size={}", vm_stack, vm_stack_size)
            })?;
        // 壊れたサイズでも MAX_VM_FRAMES 個分より先は読まない
        let frame_limit = start.saturating_add((MAX_VM_FRAMES as u64).saturating_mul(cfp_size));
        let end = stack_end.saturating_sub(cfp_size).min(frame_limit);

        let mut frames = Vec::new();
        let mut cfp = start;
        while cfp < end && frames.len() < MAX_VM_FRAMES {
            let frame = Value::at(self.rt.session(), cfp_type.clone(), cfp);
            match self.read_frame(frames.len(), &frame) {
                Ok(vm_frame) => frames.push(vm_frame),
                Err(e) => return Ok((frames, Some(e.context(format!("frame at 0x{:x}", cfp))))),
            }
            cfp += cfp_size;
        }
        Ok((frames, None))
    }

    fn read_frame(&self, index: usize, cfp: &Value<'s>) -> Result<VmFrame> {
        let word = |name: &str| -> Result<u64> { cfp.field(name)?.as_u64() };
        let ep = word("ep")?;
        let magic = if ep != 0 {
            self.rt.session().read_u64(ep).ok().and_then(|ep0| self.magics.classify(ep0))
        } else {
            None
        };

        let mut frame = VmFrame {
            index,
            cfp: cfp.address().unwrap_or(0),
            pc: word("pc")?,
            sp: word("sp")?,
            ep,
            iseq: word("iseq")?,
            self_value: word("self")?,
            magic,
            kind: FrameKind::Internal,
            location: None,
            method_name: None,
            cfunc: None,
            cfunc_symbol: None,
        };

        if magic == Some(FrameMagic::Cfunc) {
            frame.kind = FrameKind::Cfunc;
            if let Err(e) = self.read_cfunc(&mut frame) {
                tracing::debug!(cfp = format_args!("0x{:x}", frame.cfp), "cfunc method entry is unreadable: {:#}", e);
            }
            return Ok(frame);
        }
        if frame.iseq == 0 || frame.pc == 0 || self.is_ifunc(frame.iseq) || matches!(magic, Some(FrameMagic::Ifunc | FrameMagic::Dummy)) {
            return Ok(frame);
        }

        frame.kind = match magic {
            Some(FrameMagic::Block) => FrameKind::Block,
            _ => FrameKind::Method,
        };
        match self.read_location(cfp) {
            Ok(location) => {
                frame.method_name = Some(location.label.clone());
                frame.location = Some(location);
            }
            Err(e) => tracing::debug!(cfp = format_args!("0x{:x}", frame.cfp), "iseq location is unreadable: {:#}", e),
        }
        Ok(frame)
    }

    /// `ep[-2]` のメソッドエントリから関数ポインタとメソッド名を読む
    fn read_cfunc(&self, frame: &mut VmFrame) -> Result<()> {
        let session = self.rt.session();
        let me_address = session.read_u64(frame.ep.wrapping_sub(16))?;
        let me = self.rt.object(me_address, "rb_callable_method_entry_t")?;
        let def = me.field("def")?;
        let func = def.field("body")?.field("cfunc")?.field("func")?.as_u64()?;
        frame.cfunc = Some(func);
        frame.cfunc_symbol = session.symbol_at(func).map(|s| s.name);
        let original_id = def.field("original_id")?.as_u64()?;
        frame.method_name = id_to_name(self.rt, original_id);
        Ok(())
    }

    /// `imemo_ifunc` のiseq
    fn is_ifunc(&self, iseq: u64) -> bool {
        let c = self.rt.constants();
        let Ok(flags) = self.rt.flags(iseq) else {
            return false;
        };
        let imemo = c.tag(RubyType::IMemo);
        let mask = (c.imemo_mask << c.fl_ushift) | c.t_mask;
        let expected = (c.imemo_ifunc << c.fl_ushift) | imemo;
        flags & mask == expected
    }

    fn read_location(&self, cfp: &Value<'s>) -> Result<SourceLocation> {
        let body = cfp.field("iseq")?.field("body")?;
        let location = body.field("location")?;
        let path = self.path_of(location.field("pathobj")?.as_u64()?)?;
        let label = self.string_of(location.field("label")?.as_u64()?)?;
        let line = self.line_number(cfp, &body).or_else(|| location.field("first_lineno").and_then(|l| l.as_i64()).ok());
        Ok(SourceLocation { path, line, label })
    }

    /// `pathobj` は文字列か `[path, realpath]`
    fn path_of(&self, pathobj: u64) -> Result<String> {
        if self.rt.is_type(pathobj, RubyType::Array) {
            let path = RArray::new(self.rt, pathobj)?.get(0)?;
            return self.string_of(path);
        }
        self.string_of(pathobj)
    }

    fn string_of(&self, value: u64) -> Result<String> {
        if !self.rt.is_type(value, RubyType::String) {
            anyhow::bail!("VALUE 0x{:x} is not a String", value);
        }
        RString::new(self.rt, value)?.to_string_lossy()
    }

    /// `pc` の行番号（`insns_info` から）
    fn line_number(&self, cfp: &Value<'s>, body: &Value<'s>) -> Option<i64> {
        let pc = cfp.field("pc").ok()?.as_u64().ok()?;
        let encoded = body.field("iseq_encoded").ok()?.as_u64().ok()?;
        let size = body.field("iseq_size").ok()?.as_u64().ok()?;
        if pc < encoded {
            return None;
        }
        let offset = (pc - encoded) / 8;
        if offset >= size {
            return None;
        }
        // pcは次の命令を指しているので1つ戻す
        let position = offset.saturating_sub(1);

        let info = body.field("insns_info").ok()?;
        let count = info.field("size").ok()?.as_u64().ok()?.min(MAX_POSITIONS);
        let positions = info.field("positions").ok()?;
        let entries = info.field("body").ok()?;
        if count == 0 || positions.as_u64().ok()? == 0 {
            return None;
        }

        let mut found = 0;
        for i in 0..count {
            let p = positions.index(i as i64).ok()?.as_u64().ok()?;
            if p > position {
                break;
            }
            found = i;
        }
        entries.index(found as i64).ok()?.field("line_no").ok()?.as_i64().ok()
    }
}

/// `--values` の1スロット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSlot {
    /// `sp` からの位置（1なら `sp[-1]`）
    pub depth: usize,
    pub address: u64,
    pub value: u64,
}

/// `sp - 1` から `ep` に向かって最大 `max` 個のスロットを読む
pub fn stack_values(rt: &Runtime<'_>, frame: &VmFrame, max: usize) -> Vec<StackSlot> {
    let mut slots = Vec::new();
    if frame.sp == 0 || frame.ep == 0 {
        return slots;
    }
    let mut address = frame.sp.wrapping_sub(8);
    while address >= frame.ep && slots.len() < max {
        match rt.session().read_u64(address) {
            Ok(value) => slots.push(StackSlot {
                depth: slots.len() + 1,
                address,
                value,
            }),
            Err(_) => break,
        }
        address = address.wrapping_sub(8);
    }
    slots
}

/// 統合バックトレースの1行
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEntry {
    /// ネイティブフレーム（cfuncの実装ならそのVMフレーム付き）
    Native { frame: NativeFrame, vm: Option<VmFrame> },
    Vm(VmFrame),
}

/// VMへの遷移関数の検出器
pub struct TransitionDetector {
    pattern: Regex,
}

impl TransitionDetector {
    pub fn new() -> Result<Self> {
        // vm_exec_core / vm_exec / rb_vm_exec（`.cold` などの接尾辞も含む）
        let pattern = Regex::new(r"^(rb_)?vm_exec(_core)?(\.|$)")?;
        Ok(Self { pattern })
    }

    pub fn is_transition(&self, function: &str) -> bool {
        self.pattern.is_match(function)
    }
}

/// ネイティブフレームとVMフレームを混ぜる（ヒューリスティック）
///
/// 遷移関数のフレームの手前に、次のcfuncフレームまでのRubyフレームを差し込みます。
/// 先頭アドレスがcfuncの関数ポインタと一致するネイティブフレームには、そのVMフレームを付けます。
/// 最後に残ったVMフレームは末尾に並べます。
pub fn interleave(detector: &TransitionDetector, native: &[NativeFrame], vm: &[VmFrame]) -> Vec<TraceEntry> {
    let mut pending: std::collections::VecDeque<VmFrame> = vm.iter().cloned().collect();
    let mut trace = Vec::with_capacity(native.len() + vm.len());

    for frame in native {
        let cfunc_match = frame.function_start.and_then(|start| {
            pending
                .iter()
                .position(|f| f.kind == FrameKind::Cfunc && f.cfunc == Some(start))
        });
        if let Some(position) = cfunc_match {
            trace.extend(pending.drain(..position).map(TraceEntry::Vm));
            let vm_frame = pending.pop_front();
            trace.push(TraceEntry::Native {
                frame: frame.clone(),
                vm: vm_frame,
            });
            continue;
        }

        if frame.function.as_deref().is_some_and(|name| detector.is_transition(name)) {
            let run = pending
                .iter()
                .position(|f| f.kind == FrameKind::Cfunc)
                .unwrap_or(pending.len());
            trace.extend(pending.drain(..run).map(TraceEntry::Vm));
        }
        trace.push(TraceEntry::Native {
            frame: frame.clone(),
            vm: None,
        });
    }

    trace.extend(pending.into_iter().map(TraceEntry::Vm));
    trace
}
