//! Remote command builder
//!
//! Every script statement this crate sends is built here, so quoting and
//! escaping stay in one place. Acknowledgement tokens are the single
//! character prints the device echoes back when a command is checked.

use super::escape::escape_lua;
use crate::script::library::{PRINT_FILE, PRINT_LONG};

pub const OPEN_ACK: &str = "o";
pub const CLOSE_ACK: &str = "c";
pub const DELETE_ACK: &str = "d";
pub const EXISTS_ACK: &str = "o";
pub const LOADED_ACK: &str = "l";
pub const MKDIR_ACK: &str = "c";
pub const DONE_ACK: &str = "done";

/// Bytes a write command adds around its escaped chunk.
pub const WRITE_OVERHEAD: usize = r#"w:write("")"#.len();

/// Quote `value` as a script string literal.
pub fn quoted(value: &str) -> String {
    format!("\"{}\"", escape_lua(value.as_bytes()))
}

fn with_ack(statement: String, ack: Option<&str>) -> String {
    match ack {
        Some(token) => format!("{};print({})", statement, quoted(token)),
        None => statement,
    }
}

pub fn open_for_write(path: &str, checked: bool) -> String {
    with_ack(
        format!("w=frame.file.open({},\"write\")", quoted(path)),
        checked.then_some(OPEN_ACK),
    )
}

/// Append an already escaped chunk to the open file. When `ack` is set the
/// device prints that chunk index back.
pub fn write_chunk(escaped_chunk: &str, ack: Option<usize>) -> String {
    let statement = format!("w:write(\"{}\")", escaped_chunk);
    match ack {
        Some(index) => format!("{};print({})", statement, index),
        None => statement,
    }
}

/// Bytes the acknowledgement for chunk `index` adds to a write command.
pub fn write_ack_overhead(index: usize) -> usize {
    ";print()".len() + index.to_string().len()
}

pub fn close() -> String {
    with_ack("w:close()".to_string(), Some(CLOSE_ACK))
}

pub fn file_exists(path: &str) -> String {
    format!(
        "r=frame.file.open({},\"read\");print({});r:close()",
        quoted(path),
        quoted(EXISTS_ACK)
    )
}

pub fn remove(path: &str) -> String {
    with_ack(
        format!("frame.file.remove({})", quoted(path)),
        Some(DELETE_ACK),
    )
}

pub fn mkdir(path: &str) -> String {
    with_ack(format!("frame.file.mkdir({})", quoted(path)), Some(MKDIR_ACK))
}

/// Load a module by name, e.g. `lib/prntLng` for `/lib/prntLng.lua`.
pub fn require(module: &str, ack: Option<&str>) -> String {
    with_ack(format!("require({})", quoted(module)), ack)
}

/// Prints `true` when a global of that name exists on the device.
pub fn is_defined(name: &str) -> String {
    format!("print({} ~= nil)", name)
}

/// Print the string form of `expression`, long output included.
pub fn evaluate(expression: &str) -> String {
    format!("{}(tostring({}))", PRINT_LONG, expression)
}

/// Stream a file back over the data channel.
pub fn stream_file(path: &str) -> String {
    format!("{}({})", PRINT_FILE, quoted(path))
}

/// Route every `print(` call through the long-print helper so output longer
/// than one notification is framed instead of truncated.
pub fn rewrite_prints(script: &str) -> String {
    const NEEDLE: &str = "print(";
    let mut out = String::with_capacity(script.len());
    let mut rest = script;
    let part_of_name = |c: char| c.is_alphanumeric() || c == '_' || c == '.' || c == ':';
    while let Some(pos) = rest.find(NEEDLE) {
        let previous = rest[..pos].chars().next_back().or_else(|| out.chars().next_back());
        let standalone = !previous.is_some_and(part_of_name);
        out.push_str(&rest[..pos]);
        if standalone {
            out.push_str(PRINT_LONG);
            out.push('(');
        } else {
            out.push_str(NEEDLE);
        }
        rest = &rest[pos + NEEDLE.len()..];
    }
    out.push_str(rest);
    out
}

pub fn sleep(seconds: Option<f32>) -> String {
    match seconds {
        Some(seconds) => format!("frame.sleep({})", seconds),
        None => "frame.sleep()".to_string(),
    }
}

pub fn stay_awake(value: bool) -> String {
    format!("frame.stay_awake({})", value)
}
