//! 終了原因のレポート（`rb-exit-report`）
//!
//! 各セクションは独立して集めます。失敗したセクションはエラーをその場に表示し、
//! 残りのセクションは続けます。

use crate::context::{ContextSource, RubyContext, RubyVm};
use crate::fiber::FiberCache;
use crate::runtime::Runtime;
use crate::Result;
use nix::sys::signal::Signal;
use std::io::Write;

/// 割り込みフラグ（`*_INTERRUPT_MASK`）
const INTERRUPT_BITS: &[(&str, u64, &str)] = &[
    ("TIMER_INTERRUPT_MASK", 0x01, "timer"),
    ("PENDING_INTERRUPT_MASK", 0x02, "pending"),
    ("POSTPONED_JOB_INTERRUPT_MASK", 0x04, "postponed-job"),
    ("TRAP_INTERRUPT_MASK", 0x08, "trap"),
    ("TERMINATE_INTERRUPT_MASK", 0x10, "terminate"),
    ("VM_BARRIER_INTERRUPT_MASK", 0x20, "vm-barrier"),
];

/// レポートの1セクション
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSection {
    pub title: &'static str,
    pub body: std::result::Result<Vec<String>, String>,
}

impl ReportSection {
    fn collect(title: &'static str, body: Result<Vec<String>>) -> Self {
        if let Err(e) = &body {
            tracing::debug!(section = title, "exit report section failed: {:#}", e);
        }
        Self {
            title,
            body: body.map_err(|e| format!("{:#}", e)),
        }
    }
}

/// 終了原因のレポート
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub sections: Vec<ReportSection>,
}

impl ExitReport {
    pub fn collect(rt: &Runtime<'_>, fibers: &FiberCache) -> Self {
        Self {
            sections: vec![
                ReportSection::collect("Main thread", main_thread(rt)),
                ReportSection::collect("Fibers", fiber_exceptions(rt, fibers)),
                ReportSection::collect("Interrupts", interrupts(rt)),
                ReportSection::collect("Signal", signal(rt)),
            ],
        }
    }

    pub fn render(&self, out: &mut dyn Write) -> Result<()> {
        for section in &self.sections {
            writeln!(out, "{}:", section.title)?;
            match &section.body {
                Ok(lines) if lines.is_empty() => writeln!(out, "  (nothing to report)")?,
                Ok(lines) => {
                    for line in lines {
                        writeln!(out, "  {}", line)?;
                    }
                }
                Err(reason) => writeln!(out, "  <error: {}>", reason)?,
            }
        }
        Ok(())
    }
}

fn main_context<'s>(rt: &Runtime<'s>) -> Result<RubyContext<'s>> {
    let ec = RubyVm::current(rt)?.main_thread_ec()?;
    if ec == 0 {
        anyhow::bail!("main thread has no execution context");
    }
    RubyContext::at(rt, ec, ContextSource::MainThread)
}

fn main_thread(rt: &Runtime<'_>) -> Result<Vec<String>> {
    let context = main_context(rt)?;
    let line = match context.exception(rt) {
        Some(exception) => format!("pending exception: {} <VALUE@0x{:x}>", exception, exception.address),
        None => "no pending exception".to_string(),
    };
    Ok(vec![line])
}

fn fiber_exceptions(rt: &Runtime<'_>, fibers: &FiberCache) -> Result<Vec<String>> {
    if fibers.is_empty() {
        return Ok(vec!["no cached fibers (run 'rb-fiber-scan-heap' to include them)".to_string()]);
    }
    let mut lines = Vec::new();
    for record in fibers.records() {
        match record.fiber(rt) {
            Ok(fiber) => {
                if let Some(exception) = fiber.exception(rt) {
                    lines.push(format!(
                        "Fiber #{} <T_DATA@0x{:x}>: {} <VALUE@0x{:x}>",
                        record.index, record.address, exception, exception.address
                    ));
                }
            }
            Err(e) => lines.push(format!("Fiber #{} <T_DATA@0x{:x}>: <error: {:#}>", record.index, record.address, e)),
        }
    }
    if lines.is_empty() {
        lines.push(format!("no pending exceptions in {} cached fiber(s)", fibers.len()));
    }
    Ok(lines)
}

/// 割り込みフラグを名前に分解する
pub fn decode_interrupts(rt: &Runtime<'_>, bits: u64) -> Vec<&'static str> {
    INTERRUPT_BITS
        .iter()
        .filter_map(|(enumerator, default, label)| {
            let mask = rt
                .session()
                .enum_value(None, enumerator)
                .map(|v| v as u64)
                .unwrap_or(*default);
            (bits & mask != 0).then_some(*label)
        })
        .collect()
}

fn describe_bits(rt: &Runtime<'_>, bits: u64) -> String {
    let names = decode_interrupts(rt, bits);
    if names.is_empty() {
        format!("0x{:x}", bits)
    } else {
        format!("0x{:x} ({})", bits, names.join(", "))
    }
}

fn interrupts(rt: &Runtime<'_>) -> Result<Vec<String>> {
    let context = main_context(rt)?;
    let mut lines = vec![
        format!("interrupt_flag = {}", describe_bits(rt, context.interrupt_flag()?)),
        format!("interrupt_mask = {}", describe_bits(rt, context.interrupt_mask()?)),
    ];
    if let Some(buff) = rt.global("signal_buff") {
        if buff.has_field("size") {
            lines.push(format!("signal_buff.size = {}", buff.field("size")?.as_u64()?));
        }
    }
    Ok(lines)
}

/// シグナル番号の名前
pub fn signal_name(signo: i32) -> String {
    match Signal::try_from(signo) {
        Ok(signal) => signal.as_str().to_string(),
        Err(_) => format!("signal {}", signo),
    }
}

fn signal(rt: &Runtime<'_>) -> Result<Vec<String>> {
    let backend = rt.session().backend();
    let line = match backend.stop_signal() {
        Some(0) | None => format!("no signal recorded by the {} backend", backend.name()),
        Some(signo) => format!("{} ({}) from the {} backend", signal_name(signo), signo, backend.name()),
    };
    Ok(vec![line])
}
