//! Emulated Frame for integration tests
//!
//! Runs on the peripheral end of a simulated link and interprets the
//! statements this crate sends: file open/write/close/remove/mkdir,
//! `require`, `print`, the long-print and file streaming helpers, and a
//! handful of expressions. Files live in memory. Errors are printed back
//! the way the device reports them, aborting the rest of the frame.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use framelink::ble::simulated::{SimBleLink, SimBleNetwork, SimPeripheral};
use framelink::ble::transport::{BleLink, DeviceFilter};
use framelink::protocol::escape::unescape_lua;
use framelink::protocol::{
    BREAK_SIGNAL, DATA_LONG_CHUNK, DATA_LONG_END, DATA_TAG, RESET_SIGNAL, SERVICE_UUID,
    TEXT_LONG_CHUNK, TEXT_LONG_END,
};
use framelink::script::library::{PRINT_FILE, PRINT_LONG};
use framelink::{Frame, Handlers, Session, SessionConfig};
use tokio::task::JoinHandle;

pub const BATTERY_LEVEL: &str = "87";

#[derive(Default)]
pub struct DeviceState {
    pub files: HashMap<String, Vec<u8>>,
    pub dirs: HashSet<String>,
    pub globals: HashSet<String>,
    /// Modules already loaded by `require`; loading again is a no-op.
    pub loaded: HashSet<String>,
    /// Every script frame received, in order.
    pub scripts: Vec<String>,
    pub signals: Vec<u8>,
    /// Print each script frame back instead of running it.
    pub echo: bool,
    /// Ignore everything.
    pub mute: bool,
    /// Make every `w:write` fail.
    pub fail_writes: bool,
    /// Make every `w:close` fail.
    pub fail_close: bool,
    open_write: Option<String>,
}

impl DeviceState {
    /// Forget everything a VM reset would: globals and loaded modules.
    pub fn reboot(&mut self) {
        self.globals.clear();
        self.loaded.clear();
        self.open_write = None;
    }

    pub fn count_scripts(&self, needle: &str) -> usize {
        self.scripts.iter().filter(|s| s.contains(needle)).count()
    }
}

pub struct FakeFrame {
    state: Arc<Mutex<DeviceState>>,
    task: JoinHandle<()>,
}

impl FakeFrame {
    /// Serve every link `peripheral` accepts, one after another.
    pub fn listen(peripheral: SimPeripheral) -> Self {
        let state = Arc::new(Mutex::new(DeviceState::default()));
        let task = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                while let Ok(link) = peripheral.accept().await {
                    serve(&state, link).await;
                }
            })
        };
        Self { state, task }
    }

    pub fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }
}

impl Drop for FakeFrame {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(state: &Mutex<DeviceState>, link: SimBleLink) {
    let max_length = link.mtu() - 3;
    while let Ok(frame) = link.recv().await {
        let replies = handle(&mut state.lock().unwrap(), &frame, max_length);
        for reply in replies {
            if link.notify(&reply).await.is_err() {
                return;
            }
        }
    }
}

fn handle(state: &mut DeviceState, frame: &[u8], max_length: usize) -> Vec<Vec<u8>> {
    if state.mute {
        return Vec::new();
    }
    match frame {
        [DATA_TAG, ..] => vec![frame.to_vec()],
        [BREAK_SIGNAL] | [RESET_SIGNAL] => {
            state.signals.push(frame[0]);
            Vec::new()
        }
        _ => {
            let script = String::from_utf8_lossy(frame).into_owned();
            state.scripts.push(script.clone());
            if state.echo {
                return vec![frame.to_vec()];
            }
            let mut out = Output {
                max_length,
                frames: Vec::new(),
            };
            if let Err(e) = run(state, &script, &mut out) {
                out.print(&format!("[string \"main\"]:1: {}", e));
            }
            out.frames
        }
    }
}

/// Notifications produced while running one frame.
struct Output {
    max_length: usize,
    frames: Vec<Vec<u8>>,
}

impl Output {
    fn print(&mut self, text: &str) {
        let bytes = text.as_bytes();
        self.frames
            .push(bytes[..bytes.len().min(self.max_length)].to_vec());
    }

    /// Same framing as the long-print helper.
    fn print_long(&mut self, text: &str) {
        if text.len() <= self.max_length - 3 {
            self.print(text);
            return;
        }
        let chunks: Vec<&[u8]> = text.as_bytes().chunks(self.max_length - 4).collect();
        for chunk in &chunks {
            self.frames.push([&[TEXT_LONG_CHUNK][..], *chunk].concat());
        }
        self.frames
            .push([vec![TEXT_LONG_END], chunks.len().to_string().into_bytes()].concat());
    }

    /// What `frame.bluetooth.send` puts on the air.
    fn bluetooth_send(&mut self, payload: &[u8]) {
        self.frames.push([&[DATA_TAG][..], payload].concat());
    }

    /// Same blocks and framing as the file streaming helper: 512 byte
    /// reads, a newline after each shorter one, then long-data chunks.
    fn stream_file(&mut self, content: &[u8]) {
        let mut stream = Vec::new();
        for block in content.chunks(512) {
            stream.extend_from_slice(block);
            if block.len() < 512 {
                stream.push(b'\n');
            }
        }
        let chunks: Vec<&[u8]> = stream.chunks(self.max_length - 3).collect();
        for chunk in &chunks {
            self.bluetooth_send(&[&[DATA_LONG_CHUNK][..], *chunk].concat());
        }
        let mut end = vec![DATA_LONG_END];
        end.extend(chunks.len().to_string().into_bytes());
        self.bluetooth_send(&end);
    }
}

fn run(state: &mut DeviceState, script: &str, out: &mut Output) -> Result<(), String> {
    for statement in split_statements(script) {
        exec(state, statement, out)?;
    }
    Ok(())
}

fn exec(state: &mut DeviceState, statement: &str, out: &mut Output) -> Result<(), String> {
    let s = statement.trim();

    if let Some(args) = s.strip_prefix("w=").and_then(|r| call(r, "frame.file.open")) {
        let (path, _mode) = two_args(args)?;
        let path = path_literal(path)?;
        if let Some((dir, _)) = path.trim_start_matches('/').rsplit_once('/') {
            if !state.dirs.contains(dir) {
                return Err(format!("could not open {}", path));
            }
        }
        state.files.insert(path.clone(), Vec::new());
        state.open_write = Some(path);
        return Ok(());
    }
    if let Some(args) = s.strip_prefix("r=").and_then(|r| call(r, "frame.file.open")) {
        let (path, _mode) = two_args(args)?;
        let path = path_literal(path)?;
        return match state.files.contains_key(&path) {
            true => Ok(()),
            false => Err("FILE NOT FOUND".to_string()),
        };
    }
    if s == "r:close()" {
        return Ok(());
    }
    if let Some(arg) = call(s, "w:write") {
        if state.fail_writes {
            return Err("disk full".to_string());
        }
        let data = literal(arg)?;
        let path = state.open_write.clone().ok_or("no open file")?;
        state.files.entry(path).or_default().extend(data);
        return Ok(());
    }
    if s == "w:close()" {
        state.open_write.take().ok_or("no open file")?;
        if state.fail_close {
            return Err("close failed".to_string());
        }
        return Ok(());
    }
    if let Some(arg) = call(s, "frame.file.remove") {
        let path = path_literal(arg)?;
        state.files.remove(&path).ok_or("FILE NOT FOUND")?;
        return Ok(());
    }
    if let Some(arg) = call(s, "frame.file.mkdir") {
        let path = path_literal(arg)?;
        if !state.dirs.insert(path) {
            return Err("FILE EXISTS".to_string());
        }
        return Ok(());
    }
    if let Some(arg) = call(s, "require") {
        let name = path_literal(arg)?;
        return require(state, &name, out);
    }
    if let Some(arg) = call(s, "print") {
        let value = eval(state, arg)?;
        out.print(&value);
        return Ok(());
    }
    if let Some(arg) = call(s, PRINT_LONG) {
        ensure_defined(state, PRINT_LONG)?;
        let value = eval(state, arg)?;
        out.print_long(&value);
        return Ok(());
    }
    if let Some(arg) = call(s, PRINT_FILE) {
        ensure_defined(state, PRINT_FILE)?;
        let path = path_literal(arg)?;
        let content = state.files.get(&path).ok_or("FILE NOT FOUND")?;
        out.stream_file(content);
        return Ok(());
    }
    if call(s, "frame.sleep").is_some() || call(s, "frame.stay_awake").is_some() {
        return Ok(());
    }
    Err(format!("unsupported statement: {}", s))
}

fn require(state: &mut DeviceState, name: &str, out: &mut Output) -> Result<(), String> {
    if state.loaded.contains(name) {
        return Ok(());
    }
    let path = format!("/{}.lua", name);
    let source = state
        .files
        .get(&path)
        .cloned()
        .ok_or_else(|| format!("module '{}' not found", name))?;
    let source = String::from_utf8(source).map_err(|e| e.to_string())?;
    state.loaded.insert(name.to_string());

    match source.strip_prefix("function ") {
        Some(rest) => {
            let global = rest.split('(').next().unwrap_or_default();
            state.globals.insert(global.to_string());
            Ok(())
        }
        None => run(state, &source, out),
    }
}

fn ensure_defined(state: &DeviceState, name: &str) -> Result<(), String> {
    match state.globals.contains(name) {
        true => Ok(()),
        false => Err(format!("attempt to call a nil value (global '{}')", name)),
    }
}

fn eval(state: &DeviceState, expr: &str) -> Result<String, String> {
    let e = expr.trim();
    if let Some(name) = e.strip_suffix("~= nil") {
        return Ok(state.globals.contains(name.trim()).to_string());
    }
    if e.starts_with('"') || e.starts_with('\'') {
        return Ok(String::from_utf8_lossy(&literal(e)?).into_owned());
    }
    if let Some(inner) = call(e, "tostring") {
        return eval(state, inner);
    }
    if let Some(args) = call(e, "string.rep") {
        let (text, count) = two_args(args)?;
        let count: usize = count.trim().parse().map_err(|_| "bad count")?;
        return Ok(eval(state, text)?.repeat(count));
    }
    if e == "frame.battery_level()" {
        return Ok(BATTERY_LEVEL.to_string());
    }
    if e.parse::<f64>().is_ok() || e == "true" || e == "false" {
        return Ok(e.to_string());
    }
    Err(format!("attempt to index a nil value ({})", e))
}

/// Arguments of `name(...)` when `s` is exactly such a call.
fn call<'a>(s: &'a str, name: &str) -> Option<&'a str> {
    s.strip_prefix(name)?.strip_prefix('(')?.strip_suffix(')')
}

fn literal(arg: &str) -> Result<Vec<u8>, String> {
    let arg = arg.trim();
    let quote = arg.chars().next().ok_or("missing string")?;
    if arg.len() < 2 || !(quote == '"' || quote == '\'') || !arg.ends_with(quote) {
        return Err(format!("malformed string {}", arg));
    }
    unescape_lua(&arg[1..arg.len() - 1]).ok_or_else(|| format!("malformed string {}", arg))
}

fn path_literal(arg: &str) -> Result<String, String> {
    String::from_utf8(literal(arg)?).map_err(|e| e.to_string())
}

/// Split at top level commas (outside strings and parentheses).
fn two_args(args: &str) -> Result<(&str, &str), String> {
    let mut depth = 0;
    let mut quote = None;
    let mut escaped = false;
    for (i, c) in args.char_indices() {
        match (quote, c) {
            (Some(_), _) if escaped => escaped = false,
            (Some(_), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth -= 1,
            (None, ',') if depth == 0 => return Ok((&args[..i], &args[i + 1..])),
            _ => {}
        }
    }
    Err(format!("expected two arguments: {}", args))
}

/// Split a frame into statements at `;` and newlines outside strings.
fn split_statements(script: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut quote = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in script.char_indices() {
        match (quote, c) {
            (Some(_), _) if escaped => escaped = false,
            (Some(_), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, ';' | '\n') => {
                statements.push(&script[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    statements.push(&script[start..]);
    statements
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .collect()
}

/// A Frame advertising on a fresh network, with the given MTU.
pub async fn device(mtu: usize) -> (Arc<SimBleNetwork>, FakeFrame) {
    let network = SimBleNetwork::new();
    let mut peripheral = network.create_peripheral("Frame 4F");
    peripheral.set_mtu(mtu);
    peripheral.start_advertising(vec![SERVICE_UUID]).await;
    (network, FakeFrame::listen(peripheral))
}

/// A session connected to an emulated Frame.
pub async fn session(mtu: usize) -> (Session, FakeFrame) {
    let (network, device) = device(mtu).await;
    let session = Session::new(Arc::new(network.central()), SessionConfig::default());
    session
        .connect(&DeviceFilter::Any, Handlers::default())
        .await
        .unwrap();
    (session, device)
}

/// A connected [`Frame`] with the helper library installed.
pub async fn frame(mtu: usize) -> (Frame, FakeFrame) {
    let (network, device) = device(mtu).await;
    let frame = Frame::new(Arc::new(network.central()), SessionConfig::default());
    frame.ensure_connected().await.unwrap();
    (frame, device)
}
