//! `rb-object-print`

use super::{depth_option, eval_value};
use crate::printer::ObjectPrinter;
use crate::runtime::Runtime;
use crate::Result;
use rbprobe_core::{Arguments, Command, CommandCategory, CommandContext};

pub struct ObjectPrintCommand;

impl Command for ObjectPrintCommand {
    fn name(&self) -> &str {
        "rb-object-print"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::Data
    }

    fn help(&self) -> &str {
        "Print a Ruby VALUE with its type and contents.\n\
         Usage: rb-object-print <expression> [--depth N] [--debug]\n\
         \n\
         --depth N   expand nested arrays, hashes and structs N levels (default 1)\n\
         --debug     also dump the raw header and struct fields"
    }

    fn aliases(&self) -> &[&'static str] {
        &["rp", "rb-print"]
    }

    fn invoke(&self, ctx: &mut CommandContext<'_>, args: &str, _from_tty: bool) -> Result<()> {
        let args = Arguments::parse(args, &["depth"])?;
        let expression = args
            .expression()
            .ok_or_else(|| anyhow::anyhow!("Usage: rb-object-print <expression> [--depth N] [--debug]"))?;
        let printer = ObjectPrinter::new(depth_option(&args)?, args.flag("debug"));

        let session = ctx.session();
        let raw = eval_value(session, &expression)?;
        let rt = Runtime::new(session);
        printer.print(&rt, raw, ctx.out())?;
        Ok(())
    }
}
