//! `rb-stack-trace`

use crate::context::RubyContext;
use crate::object::classify;
use crate::runtime::Runtime;
use crate::stack::{interleave, stack_values, StackWalker, TraceEntry, TransitionDetector, VmFrame, MAX_STACK_VALUES};
use crate::{Result, RubyState};
use rbprobe_core::unwind::MAX_FRAMES;
use rbprobe_core::{Arguments, Command, CommandCategory, CommandContext};
use std::io::Write;
use std::rc::Rc;

/// VMフレームの一覧を表示する
pub(crate) fn print_vm_frames(rt: &Runtime<'_>, frames: &[VmFrame], values: bool, out: &mut dyn Write) -> Result<()> {
    if frames.is_empty() {
        writeln!(out, "No Ruby frames.")?;
    }
    for frame in frames {
        writeln!(out, "#{:<3}{}", frame.index, frame.describe())?;
        if values {
            print_values(rt, frame, out)?;
        }
    }
    Ok(())
}

fn print_values(rt: &Runtime<'_>, frame: &VmFrame, out: &mut dyn Write) -> Result<()> {
    for slot in stack_values(rt, frame, MAX_STACK_VALUES) {
        writeln!(out, "        sp[-{}] = {}", slot.depth, classify(rt, slot.value, 0))?;
    }
    Ok(())
}

pub struct StackTraceCommand {
    state: Rc<RubyState>,
}

impl StackTraceCommand {
    pub fn new(state: Rc<RubyState>) -> Self {
        Self { state }
    }
}

impl Command for StackTraceCommand {
    fn name(&self) -> &str {
        "rb-stack-trace"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::Stack
    }

    fn help(&self) -> &str {
        "Print native and Ruby frames as one backtrace.\n\
         Usage: rb-stack-trace [--values]\n\
         \n\
         Ruby frames are placed before the VM entry point that runs them, and C functions\n\
         called from Ruby are annotated with their method. The interleaving is best-effort.\n\
         --values   also print up to 10 VM stack slots per Ruby frame"
    }

    fn invoke(&self, ctx: &mut CommandContext<'_>, args: &str, _from_tty: bool) -> Result<()> {
        let args = Arguments::parse(args, &[])?;
        let values = args.flag("values");
        let session = ctx.session();
        let rt = Runtime::new(session);

        let native = session.backtrace(MAX_FRAMES)?;
        let vm = match RubyContext::current(&rt, &self.state.unwinder) {
            Ok(context) => {
                let (frames, error) = StackWalker::new(&rt).walk(&context)?;
                if let Some(e) = error {
                    writeln!(ctx.out(), "Warning: Ruby stack walk stopped early: {:#}", e)?;
                }
                frames
            }
            Err(e) => {
                tracing::debug!("no execution context for the combined trace: {:#}", e);
                Vec::new()
            }
        };

        let detector = TransitionDetector::new()?;
        for entry in interleave(&detector, &native, &vm) {
            match entry {
                TraceEntry::Native { frame, vm: None } => writeln!(ctx.out(), "{}", frame.describe())?,
                TraceEntry::Native { frame, vm: Some(vm) } => {
                    writeln!(ctx.out(), "{}", frame.describe())?;
                    writeln!(ctx.out(), "     [ruby] {}", vm.describe())?;
                    if values {
                        print_values(&rt, &vm, ctx.out())?;
                    }
                }
                TraceEntry::Vm(vm) => {
                    writeln!(ctx.out(), "     [ruby] {}", vm.describe())?;
                    if values {
                        print_values(&rt, &vm, ctx.out())?;
                    }
                }
            }
        }
        Ok(())
    }
}
