use std::io::{self, Write};

/// Operator-facing warning. Rendered as one greppable `key=value` line so a
/// skipped shard or a failed batch stays visible even with logging off.
#[derive(Debug, Clone, Copy)]
pub struct WarnEvent<'a> {
    pub code: &'a str,
    pub stage: &'a str,
    pub action: &'a str,
    pub entry: &'a str,
    pub root: &'a str,
    pub reason: &'a str,
    pub err: &'a str,
}

fn sanitize_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        if ch.is_ascii_whitespace() {
            if !out.is_empty() && !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else if ch.is_ascii_graphic() {
            out.push(ch);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "na".to_string()
    } else {
        trimmed.to_string()
    }
}

fn render(event: &WarnEvent<'_>) -> String {
    format!(
        "DEEPFREEZE_WARN code={} stage={} action={} entry={} root={} reason={} err={}",
        sanitize_value(event.code),
        sanitize_value(event.stage),
        sanitize_value(event.action),
        sanitize_value(event.entry),
        sanitize_value(event.root),
        sanitize_value(event.reason),
        sanitize_value(event.err),
    )
}

fn write_line(out: &mut impl Write, event: &WarnEvent<'_>) -> io::Result<()> {
    writeln!(out, "{}", render(event))
}

/// The stderr line is the operator channel; tracing only sees it at debug
/// so the default filter does not print it twice.
pub fn emit(event: WarnEvent<'_>) {
    tracing::debug!(
        code = event.code,
        stage = event.stage,
        action = event.action,
        entry = event.entry,
        root = event.root,
        reason = event.reason,
        "{}",
        event.err
    );
    let _ = write_line(&mut io::stderr().lock(), &event);
}
