//! Helper routines installed on the device
//!
//! Each helper lives in its own module file under `/lib` and defines one
//! global function of the same name. They are loaded in order, so a helper
//! may call the ones listed before it.

/// Prints a string of any length, framing it with the long-text tags when
/// it doesn't fit in one notification.
pub const PRINT_LONG: &str = "prntLng";

/// Sends a string of any length as long-data chunks, retrying each chunk
/// until the BLE stack accepts it. Returns the number of chunks sent.
///
/// `frame.bluetooth.send` already puts the data tag in front of every
/// payload, so the helpers only add the second tag byte.
pub const SEND_PARTIAL: &str = "sendPartial";

/// Streams a whole file back on the data channel.
pub const PRINT_FILE: &str = "printCompleteFile";

const PRINT_LONG_SOURCE: &str = r#"function prntLng(s)
  local mtu = frame.bluetooth.max_length()
  local len = string.len(s)
  if len <= mtu - 3 then
    print(s)
    return
  end
  local i = 1
  local count = 0
  while i <= len do
    local j = i + mtu - 5
    if j > len then
      j = len
    end
    print("\010" .. string.sub(s, i, j))
    count = count + 1
    i = j + 1
  end
  print("\011" .. count)
end
"#;

const SEND_PARTIAL_SOURCE: &str = r#"function sendPartial(data, max_size)
  local len = string.len(data)
  local i = 1
  local count = 0
  while i <= len do
    local j = i + max_size - 4
    if j > len then
      j = len
    end
    local chunk = "\001" .. string.sub(data, i, j)
    while not pcall(frame.bluetooth.send, chunk) do
      frame.sleep(0.0025)
    end
    count = count + 1
    i = j + 1
  end
  return count
end
"#;

const PRINT_FILE_SOURCE: &str = r#"function printCompleteFile(filename)
  local f = frame.file.open(filename, "read")
  local content = ""
  while true do
    local block = f:read()
    if block == nil then
      break
    end
    if string.len(block) == 512 then
      content = content .. block
    else
      content = content .. block .. "\n"
    end
  end
  f:close()
  local count = sendPartial(content, frame.bluetooth.max_length())
  while not pcall(frame.bluetooth.send, "\002" .. count) do
    frame.sleep(0.0025)
  end
end
"#;

/// A named helper and its module source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibraryFunction {
    pub name: &'static str,
    pub source: &'static str,
}

/// Path of the module file holding helper `name` on the device.
pub fn module_path(name: &str) -> String {
    format!("/lib/{}.lua", name)
}

/// Name passed to `require` to load helper `name`.
pub fn module_name(name: &str) -> String {
    format!("lib/{}", name)
}

/// Every helper, in load order.
pub const LIBRARY: [LibraryFunction; 3] = [
    LibraryFunction {
        name: PRINT_LONG,
        source: PRINT_LONG_SOURCE,
    },
    LibraryFunction {
        name: SEND_PARTIAL,
        source: SEND_PARTIAL_SOURCE,
    },
    LibraryFunction {
        name: PRINT_FILE,
        source: PRINT_FILE_SOURCE,
    },
];
