// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Coroutine chain tracebacks attached to faults.

use std::fmt::Write;

use super::arena::CoId;
use super::request::ReqCtx;

/// Walk from `start` up through live parents. Bounded by the configured
/// coroutine count and line depth.
pub(crate) fn traceback(ctx: &ReqCtx, start: CoId) -> String {
    let config = ctx.runtime.config();
    let max_cos = config.backtrace_max_coroutines.max(1);
    let max_lines = config.backtrace_depth.max(1);

    let mut out = String::from("stack traceback:");
    let mut lines = 0;
    let mut cur = Some(start);
    let mut level = 0;

    while let Some(id) = cur {
        let Some(co) = ctx.cos.get(id) else {
            break;
        };
        if level > 0 && !co.status.is_alive() {
            break;
        }
        if level >= max_cos || lines >= max_lines {
            out.push_str("\n\t...");
            break;
        }
        let _ = write!(out, "\ncoroutine {level}:");
        let _ = write!(out, "\n\t{} ({})", co.name, co.status);
        lines += 1;
        level += 1;
        cur = co.parent;
    }
    out
}
