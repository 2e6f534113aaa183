//! `rb-heap-scan`

use super::eval_value;
use crate::heap::{parse_type_filter, HeapScanner, ScanCursor};
use crate::object::classify;
use crate::runtime::Runtime;
use crate::Result;
use rbprobe_core::{Arguments, Command, CommandCategory, CommandContext, Session};

/// 1回のスキャンで表示する件数の既定値
const DEFAULT_LIMIT: usize = 10;

/// 一覧で展開する深さ（コンテナの子は `Shallow` になる）
const LISTING_DEPTH: usize = 1;

pub struct HeapScanCommand;

impl Command for HeapScanCommand {
    fn name(&self) -> &str {
        "rb-heap-scan"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::Data
    }

    fn help(&self) -> &str {
        "Scan the Ruby heap for live objects.\n\
         Usage: rb-heap-scan [--type TYPE] [--limit N] [--from $heap]\n\
         \n\
         --type TYPE   T_STRING, string or a numeric tag like 0x05\n\
         --limit N     stop after N matches (default 10)\n\
         --from EXPR   resume from a cursor saved in $heap\n\
         \n\
         Matches are saved in $heap0..$heapN and the resume cursor in $heap."
    }

    fn invoke(&self, ctx: &mut CommandContext<'_>, args: &str, _from_tty: bool) -> Result<()> {
        let args = Arguments::parse(args, &["type", "limit", "from"])?;
        let session = ctx.session();
        let rt = Runtime::new(session);

        let filter = args.option("type").map(|text| parse_type_filter(&rt, text)).transpose()?;
        let limit = args.option_usize("limit")?.unwrap_or(DEFAULT_LIMIT);
        let from = match args.option("from") {
            Some(expression) => match eval_value(session, expression) {
                Ok(raw) => Some(ScanCursor::from_raw(raw)),
                Err(e) => {
                    tracing::debug!("--from did not evaluate: {:#}", e);
                    writeln!(ctx.out(), "Note: {} is not set or invalid, starting from the beginning of the heap", expression)?;
                    None
                }
            },
            None => None,
        };

        let scanner = HeapScanner::new(&rt)?;
        let description = match filter {
            Some(tag) => match rt.constants().type_of_tag(tag) {
                Some(ty) => format!("{} (0x{:02x})", ty, tag),
                None => format!("type 0x{:02x}", tag),
            },
            None => "all types".to_string(),
        };
        match from {
            Some(cursor) => writeln!(ctx.out(), "Scanning heap for {}, limit={}, continuing from {}...", description, limit, cursor)?,
            None => writeln!(ctx.out(), "Scanning heap for {}, limit={}...", description, limit)?,
        }

        let page = scanner.scan(filter, Some(limit), from);
        if page.skipped_pages > 0 {
            writeln!(ctx.out(), "Warning: skipped {} unreadable heap page(s)", page.skipped_pages)?;
        }

        clear_numbered(session);
        if page.matches.is_empty() {
            session.clear_convenience("heap");
            writeln!(ctx.out(), "No objects found")?;
            if from.is_some() {
                writeln!(ctx.out(), "(You may have reached the end of the heap)")?;
            }
            return Ok(());
        }

        writeln!(ctx.out(), "Found {} object(s):", page.matches.len())?;
        for (i, object) in page.matches.iter().enumerate() {
            let name = format!("heap{}", i);
            session.set_convenience(&name, &rt.value(object.address));
            writeln!(ctx.out(), "  [{}] ${} = {}", i, name, classify(&rt, object.address, LISTING_DEPTH))?;
        }
        writeln!(ctx.out(), "Objects saved in $heap0 through $heap{}", page.matches.len() - 1)?;

        match page.next {
            Some(next) => {
                session.set_convenience("heap", &rt.value(next.raw()));
                writeln!(ctx.out(), "Next scan cursor saved to $heap: {}", next)?;
                let type_arg = args.option("type").unwrap_or("...");
                writeln!(ctx.out(), "Run 'rb-heap-scan --type {} --from $heap' for the next page", type_arg)?;
            }
            None => {
                session.clear_convenience("heap");
                writeln!(ctx.out(), "Reached end of heap")?;
            }
        }
        Ok(())
    }
}

/// 前回の `$heapN` を消す
fn clear_numbered(session: &Session) {
    for name in session.convenience_names() {
        let numbered = name
            .strip_prefix("heap")
            .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()));
        if numbered {
            session.clear_convenience(&name);
        }
    }
}
