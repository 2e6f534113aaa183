//! VMと実行コンテキストへのアクセス
//!
//! 現在のVM・ECはここの `RubyVm::current` と `RubyContext::current` だけを通して読みます。

use crate::errors::{RuntimeError, ERR_NO_EXECUTION_CONTEXT};
use crate::exception::RubyException;
use crate::runtime::Runtime;
use crate::unwind::FiberUnwinder;
use crate::Result;
use rbprobe_core::Value;
use std::io::Write;

/// `ruby_current_vm_ptr`
pub struct RubyVm<'s> {
    vm: Value<'s>,
}

impl<'s> RubyVm<'s> {
    pub fn current(rt: &Runtime<'s>) -> Result<Self> {
        let vm = rt.global("ruby_current_vm_ptr").ok_or(RuntimeError::VmNotInitialized)?;
        if vm.as_u64()? == 0 {
            return Err(RuntimeError::VmNotInitialized.into());
        }
        Ok(Self { vm })
    }

    pub fn address(&self) -> Result<u64> {
        self.vm.as_u64()
    }

    /// `vm->gc.objspace`（3.3以降）または `vm->objspace`
    pub fn objspace(&self, rt: &Runtime<'s>) -> Result<Value<'s>> {
        let objspace = if self.vm.has_field("gc") {
            self.vm.field("gc")?.field("objspace")?
        } else {
            self.vm.field("objspace")?
        };
        if objspace.as_u64()? == 0 {
            return Err(RuntimeError::ObjspaceNotInitialized.into());
        }
        let ty = rt.session().lookup_type("rb_objspace_t *")?;
        objspace.cast(&ty)
    }

    /// `vm->ractor.main_thread->ec`
    pub fn main_thread_ec(&self) -> Result<u64> {
        self.vm
            .field("ractor")?
            .field("main_thread")?
            .field("ec")?
            .as_u64()
    }
}

/// ECをどこから得たか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextSource {
    Fiber,
    CurrentEc,
    MainThread,
}

/// `rb_vm_tag`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmTag {
    pub address: u64,
    pub retval: u64,
    pub state: u64,
}

/// 実行コンテキスト（`rb_execution_context_t *`）
pub struct RubyContext<'s> {
    ec: Value<'s>,
    source: ContextSource,
}

impl<'s> RubyContext<'s> {
    /// 現在のEC
    ///
    /// 切り替え中のファイバ、`ruby_current_ec`、メインスレッドの順に探します。
    pub fn current(rt: &Runtime<'s>, unwinder: &FiberUnwinder) -> Result<Self> {
        if let Some(context) = unwinder.active_context() {
            return Self::at(rt, context.ec, ContextSource::Fiber);
        }

        if let Some(ec) = rt.global("ruby_current_ec") {
            match ec.as_u64() {
                Ok(0) => {}
                Ok(address) => return Self::at(rt, address, ContextSource::CurrentEc),
                Err(e) => tracing::debug!("ruby_current_ec is unreadable: {:#}", e),
            }
        }

        let ec = RubyVm::current(rt).and_then(|vm| vm.main_thread_ec()).unwrap_or(0);
        if ec == 0 {
            anyhow::bail!(ERR_NO_EXECUTION_CONTEXT);
        }
        Self::at(rt, ec, ContextSource::MainThread)
    }

    pub fn at(rt: &Runtime<'s>, address: u64, source: ContextSource) -> Result<Self> {
        let ty = rt.session().lookup_type("rb_execution_context_t *")?;
        Ok(Self {
            ec: Value::scalar(rt.session(), ty, address),
            source,
        })
    }

    pub fn address(&self) -> u64 {
        self.ec.as_u64().unwrap_or(0)
    }

    pub fn source(&self) -> ContextSource {
        self.source
    }

    pub fn pointer(&self) -> &Value<'s> {
        &self.ec
    }

    fn word(&self, name: &str) -> Result<u64> {
        self.ec.field(name)?.as_u64()
    }

    pub fn cfp(&self) -> Result<u64> {
        self.word("cfp")
    }

    pub fn vm_stack(&self) -> Result<u64> {
        self.word("vm_stack")
    }

    pub fn vm_stack_size(&self) -> Result<u64> {
        self.word("vm_stack_size")
    }

    pub fn errinfo(&self) -> Result<u64> {
        self.word("errinfo")
    }

    pub fn storage(&self) -> Result<u64> {
        self.word("storage")
    }

    pub fn interrupt_flag(&self) -> Result<u64> {
        self.word("interrupt_flag")
    }

    pub fn interrupt_mask(&self) -> Result<u64> {
        self.word("interrupt_mask")
    }

    /// `ec->tag`（NULLならNone）
    pub fn tag(&self) -> Result<Option<VmTag>> {
        let tag = self.ec.field("tag")?;
        let address = tag.as_u64()?;
        if address == 0 {
            return Ok(None);
        }
        Ok(Some(VmTag {
            address,
            retval: tag.field("retval")?.as_u64()?,
            state: tag.field("state")?.as_u64()?,
        }))
    }

    /// 処理中の例外
    pub fn exception(&self, rt: &Runtime<'_>) -> Option<RubyException> {
        RubyException::from_value(rt, self.errinfo().ok()?)
    }

    /// ensure節で参照できる `tag->retval`
    pub fn retval(&self, rt: &Runtime<'_>) -> Option<u64> {
        let tag = self.tag().ok()??;
        (!rt.constants().is_special_const(tag.retval)).then_some(tag.retval)
    }

    /// `$ec`、`$cfp`、`$errinfo` を設定し、設定した名前を返す
    pub fn set_convenience_variables(&self, rt: &Runtime<'s>) -> Vec<&'static str> {
        let session = rt.session();
        let mut names = vec!["ec"];
        session.set_convenience("ec", &self.ec);

        match self.ec.field("cfp").and_then(|cfp| snapshot(&cfp)) {
            Ok(cfp) => {
                session.set_convenience("cfp", &cfp);
                names.push("cfp");
            }
            Err(e) => tracing::debug!("cfp is unreadable: {:#}", e),
        }

        if let Some(exception) = self.exception(rt) {
            session.set_convenience("errinfo", &rt.value(exception.address));
            names.push("errinfo");
        } else {
            session.clear_convenience("errinfo");
        }
        names
    }

    /// `rb-context` の表示
    pub fn print_info(&self, rt: &Runtime<'_>, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "Execution Context:")?;
        writeln!(out, "  $ec = <rb_execution_context_t@0x{:x}>", self.address())?;

        match (self.vm_stack(), self.vm_stack_size()) {
            (Ok(stack), Ok(size)) => writeln!(out, "  VM Stack: <VALUE@0x{:x}> size={}", stack, size)?,
            _ => writeln!(out, "  VM Stack: <unavailable>")?,
        }
        match self.cfp() {
            Ok(cfp) => writeln!(out, "  $cfp = <rb_control_frame_t@0x{:x}>", cfp)?,
            Err(_) => writeln!(out, "  $cfp = <unavailable>")?,
        }
        if let Ok(storage) = self.storage() {
            if storage != rt.constants().qnil && storage != 0 {
                writeln!(out, "  Storage: <VALUE@0x{:x}>", storage)?;
            }
        }

        match self.exception(rt) {
            Some(exception) => {
                writeln!(out, "  $errinfo = <VALUE@0x{:x}>", exception.address)?;
                writeln!(out, "    Exception present! ({})", exception)?;
            }
            None if self.errinfo().ok() == Some(rt.constants().qfalse) => writeln!(out, "  Exception: None (false)")?,
            None => writeln!(out, "  Exception: None")?,
        }

        if let Ok(Some(tag)) = self.tag() {
            writeln!(out, "  Tag: <rb_vm_tag@0x{:x}> state={}", tag.address, tag.state)?;
            if self.retval(rt).is_some() {
                writeln!(out, "    $retval available (in ensure block)")?;
            }
        }
        Ok(())
    }
}

/// メモリ上の値を現時点のスカラーに固定する
pub(crate) fn snapshot<'s>(value: &Value<'s>) -> Result<Value<'s>> {
    Ok(Value::scalar(value.session(), value.ty().clone(), value.as_u64()?))
}
