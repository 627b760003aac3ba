//! In-process stand-in for the relay server and one device daemon.
//!
//! Speaks just enough of the host, sync and shell protocols for the
//! integration tests. The device file system lives in memory.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use adbx::{Adb, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const SERIAL: &str = "emulator-5554";
/// Listed by the server, but every request to it fails as unauthorized.
pub const UNAUTHORIZED: &str = "R58M40ABCDE";
/// Answers requests but is missing from the server's device list.
pub const UNLISTED: &str = "emulator-5556";
const FEATURES: &str = "shell_v2,cmd,stat_v2,ls_v2,fixed_push_mkdir,apex,abb,push_sync";
const MAX_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Dir,
    File { data: Vec<u8>, mode: u32, mtime: u32 },
    /// A file that can be stat'ed and listed but not read.
    Sparse { size: u64, mode: u32, mtime: u32 },
}

#[derive(Debug, Default)]
struct State {
    fs: BTreeMap<String, Node>,
    forwards: Vec<(String, String)>,
    largest_chunk: usize,
    features: String,
}

/// Handle to a running fake server; dropped with the test runtime.
#[derive(Clone)]
pub struct FakeAdb {
    pub addr: SocketAddr,
    state: Arc<Mutex<State>>,
}

impl FakeAdb {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut state = State {
            features: FEATURES.to_owned(),
            ..State::default()
        };
        for dir in ["/", "/sdcard", "/data", "/system"] {
            state.fs.insert(dir.to_owned(), Node::Dir);
        }
        let state = Arc::new(Mutex::new(state));
        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = shared.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, state).await;
                });
            }
        });
        Self { addr, state }
    }

    pub fn config(&self) -> ServerConfig {
        let mut config = ServerConfig::default().with_port(self.addr.port());
        config.short_timeout = Duration::from_secs(5);
        config.long_timeout = Duration::from_secs(10);
        config
    }

    pub fn adb(&self) -> Adb {
        Adb::new(self.config())
    }

    pub fn put_file(&self, path: &str, data: &[u8], mode: u32, mtime: u32) {
        let mut state = self.state.lock().unwrap();
        state.fs.insert(
            path.to_owned(),
            Node::File {
                data: data.to_vec(),
                mode,
                mtime,
            },
        );
    }

    pub fn put_sparse(&self, path: &str, size: u64) {
        let node = Node::Sparse {
            size,
            mode: 0o100_644,
            mtime: 1_700_000_000,
        };
        self.state.lock().unwrap().fs.insert(path.to_owned(), node);
    }

    /// Replaces the feature list the device advertises.
    pub fn set_features(&self, features: &str) {
        self.state.lock().unwrap().features = features.to_owned();
    }

    pub fn put_dir(&self, path: &str) {
        self.state.lock().unwrap().fs.insert(path.to_owned(), Node::Dir);
    }

    pub fn node(&self, path: &str) -> Option<Node> {
        self.state.lock().unwrap().fs.get(path).cloned()
    }

    pub fn forwards(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().forwards.clone()
    }

    pub fn largest_chunk(&self) -> usize {
        self.state.lock().unwrap().largest_chunk
    }
}

async fn serve(mut s: TcpStream, state: Arc<Mutex<State>>) -> std::io::Result<()> {
    loop {
        let Some(req) = read_request(&mut s).await? else {
            return Ok(());
        };
        if let Some(transport) = req.strip_prefix("host:transport") {
            if matches!(transport, "-any" | "-local" | "-usb" | "-id:1") || transport == format!(":{SERIAL}") {
                s.write_all(b"OKAY").await?;
                continue;
            }
            return fail(&mut s, "device not found").await;
        }
        if let Some(rest) = req.strip_prefix("host:") {
            if let Some(done) = host_request(&mut s, &state, rest).await? {
                return done;
            }
            continue;
        }
        if let Some(rest) = device_scoped(&req) {
            return match rest {
                Some((serial, _)) if serial == UNAUTHORIZED => {
                    fail(&mut s, "device unauthorized.\nThis adb server's $ADB_VENDOR_KEYS is not set").await
                }
                Some((serial, "get-serialno")) => okay_message(&mut s, serial).await,
                Some((_, rest)) => device_attribute(&mut s, &state, rest).await,
                None => fail(&mut s, &format!("device '{req}' not found")).await,
            };
        }
        if req == "sync:" {
            s.write_all(b"OKAY").await?;
            return sync_loop(&mut s, &state).await;
        }
        if let Some(cmd) = req.strip_prefix("shell,v2:") {
            s.write_all(b"OKAY").await?;
            return shell_v2(&mut s, cmd).await;
        }
        if let Some(cmd) = req.strip_prefix("shell:") {
            s.write_all(b"OKAY").await?;
            return shell_v1(&mut s, &state, cmd).await;
        }
        if req == "remount:" {
            s.write_all(b"OKAY").await?;
            s.write_all(b"remount succeeded\n").await?;
            return Ok(());
        }
        if req.starts_with("tcp:") {
            s.write_all(b"OKAY").await?;
            let mut buf = [0u8; 1024];
            loop {
                let n = s.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                s.write_all(&buf[..n]).await?;
            }
        }
        return fail(&mut s, &format!("unknown request {req}")).await;
    }
}

/// Handles `host:<rest>`; `Some` ends the connection.
async fn host_request(
    s: &mut TcpStream,
    state: &Arc<Mutex<State>>,
    rest: &str,
) -> std::io::Result<Option<std::io::Result<()>>> {
    let reply = match rest {
        "version" => "0029".to_owned(),
        "devices" => format!("{SERIAL}\tdevice\n{UNAUTHORIZED}\tunauthorized\n"),
        "devices-l" => format!(
            "{SERIAL}          device product:sdk_gphone64_x86_64 model:sdk_gphone64_x86_64 device:emu64x transport_id:1\n\
             {UNAUTHORIZED}            unauthorized usb:1-1 transport_id:2\n"
        ),
        "host-features" => "shell_v2,cmd,stat_v2,ls_v2,libusb,push_sync".to_owned(),
        "list-forward" => {
            let state = state.lock().unwrap();
            state
                .forwards
                .iter()
                .map(|(l, r)| format!("{SERIAL} {l} {r}\n"))
                .collect()
        }
        "kill" => {
            s.write_all(b"OKAY").await?;
            return Ok(Some(Ok(())));
        }
        other => {
            if let Some(addr) = other.strip_prefix("connect:") {
                format!("connected to {addr}")
            } else if let Some(addr) = other.strip_prefix("disconnect:") {
                format!("disconnected {addr}")
            } else {
                return Ok(Some(device_attribute(s, state, other).await));
            }
        }
    };
    okay_message(s, &reply).await?;
    Ok(None)
}

/// Splits a per-device host request into the addressed serial and the
/// request; the inner `None` means an unknown device.
fn device_scoped(req: &str) -> Option<Option<(&'static str, &str)>> {
    if let Some(rest) = req.strip_prefix("host-serial:") {
        return Some([SERIAL, UNAUTHORIZED, UNLISTED].into_iter().find_map(|serial| {
            let rest = rest.strip_prefix(serial)?.strip_prefix(':')?;
            Some((serial, rest))
        }));
    }
    if let Some(rest) = req.strip_prefix("host-transport-id:") {
        return Some(rest.strip_prefix("1:").map(|rest| (SERIAL, rest)));
    }
    for prefix in ["host-local:", "host-usb:"] {
        if let Some(rest) = req.strip_prefix(prefix) {
            return Some(Some((SERIAL, rest)));
        }
    }
    None
}

async fn device_attribute(s: &mut TcpStream, state: &Arc<Mutex<State>>, req: &str) -> std::io::Result<()> {
    match req {
        "get-serialno" => okay_message(s, SERIAL).await,
        "get-state" => okay_message(s, "device").await,
        "get-devpath" => okay_message(s, "unknown").await,
        "features" => {
            let features = state.lock().unwrap().features.clone();
            okay_message(s, &features).await
        }
        other => {
            if let Some(spec) = other.strip_prefix("forward:") {
                let (no_rebind, spec) = match spec.strip_prefix("norebind:") {
                    Some(spec) => (true, spec),
                    None => (false, spec),
                };
                let Some((local, remote)) = spec.split_once(';') else {
                    return fail(s, "malformed forward spec").await;
                };
                let bound = {
                    let mut st = state.lock().unwrap();
                    match st.forwards.iter().position(|(l, _)| l == local) {
                        Some(_) if no_rebind => false,
                        Some(i) => {
                            st.forwards[i].1 = remote.to_owned();
                            true
                        }
                        None => {
                            st.forwards.push((local.to_owned(), remote.to_owned()));
                            true
                        }
                    }
                };
                if !bound {
                    return fail(s, "cannot rebind existing socket").await;
                }
                return s.write_all(b"OKAY").await;
            }
            if let Some(local) = other.strip_prefix("killforward:") {
                let removed = {
                    let mut st = state.lock().unwrap();
                    let before = st.forwards.len();
                    st.forwards.retain(|(l, _)| l != local);
                    before != st.forwards.len()
                };
                return if removed {
                    s.write_all(b"OKAY").await
                } else {
                    fail(s, &format!("listener '{local}' not found")).await
                };
            }
            fail(s, &format!("unknown host request {other}")).await
        }
    }
}

async fn read_request(s: &mut TcpStream) -> std::io::Result<Option<String>> {
    let mut len = [0u8; 4];
    if s.read_exact(&mut len).await.is_err() {
        return Ok(None);
    }
    let len = usize::from_str_radix(std::str::from_utf8(&len).unwrap(), 16).unwrap();
    let mut buf = vec![0u8; len];
    s.read_exact(&mut buf).await?;
    Ok(Some(String::from_utf8(buf).unwrap()))
}

async fn okay_message(s: &mut TcpStream, msg: &str) -> std::io::Result<()> {
    s.write_all(format!("OKAY{:04x}{msg}", msg.len()).as_bytes()).await
}

async fn fail(s: &mut TcpStream, msg: &str) -> std::io::Result<()> {
    s.write_all(format!("FAIL{:04x}{msg}", msg.len()).as_bytes()).await
}

async fn sync_fail(s: &mut TcpStream, msg: &str) -> std::io::Result<()> {
    let mut v = b"FAIL".to_vec();
    v.extend_from_slice(&(msg.len() as u32).to_le_bytes());
    v.extend_from_slice(msg.as_bytes());
    s.write_all(&v).await
}

async fn read_sync_header(s: &mut TcpStream) -> std::io::Result<Option<([u8; 4], u32)>> {
    let mut head = [0u8; 8];
    if s.read_exact(&mut head).await.is_err() {
        return Ok(None);
    }
    let id = [head[0], head[1], head[2], head[3]];
    let arg = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
    Ok(Some((id, arg)))
}

fn record(id: &[u8; 4], words: &[u32]) -> Vec<u8> {
    let mut v = id.to_vec();
    for w in words {
        v.extend_from_slice(&w.to_le_bytes());
    }
    v
}

/// Mode, size and mtime of a node.
fn meta(node: &Node) -> (u32, u64, u32) {
    match node {
        Node::Dir => (0o040_755, 4096, 1_600_000_000),
        Node::File { data, mode, mtime } => (*mode, data.len() as u64, *mtime),
        Node::Sparse { size, mode, mtime } => (*mode, *size, *mtime),
    }
}

/// The v1 record truncates the size to 32 bits like a real daemon.
fn stat_words(node: &Node) -> [u32; 3] {
    let (mode, size, mtime) = meta(node);
    [mode, size as u32, mtime]
}

/// The 68-byte `STA2`/`DNT2` body; a missing node reports ENOENT.
fn stat_v2_body(node: Option<&Node>) -> Vec<u8> {
    let mut v = Vec::with_capacity(68);
    let Some(node) = node else {
        v.extend_from_slice(&2u32.to_le_bytes());
        v.resize(68, 0);
        return v;
    };
    let (mode, size, mtime) = meta(node);
    v.extend_from_slice(&0u32.to_le_bytes()); // error
    v.extend_from_slice(&0u64.to_le_bytes()); // dev
    v.extend_from_slice(&0u64.to_le_bytes()); // ino
    v.extend_from_slice(&mode.to_le_bytes());
    v.extend_from_slice(&1u32.to_le_bytes()); // nlink
    v.extend_from_slice(&[0u8; 8]); // uid, gid
    v.extend_from_slice(&size.to_le_bytes());
    for _ in 0..3 {
        v.extend_from_slice(&i64::from(mtime).to_le_bytes());
    }
    v
}

/// Entries of the directory `dir`, led by `.` and `..`.
fn children(state: &Arc<Mutex<State>>, dir: &str) -> Vec<(String, Node)> {
    let st = state.lock().unwrap();
    let prefix = if dir == "/" { "/".to_owned() } else { format!("{dir}/") };
    let mut out = vec![(".".to_owned(), Node::Dir), ("..".to_owned(), Node::Dir)];
    for (path, node) in st.fs.range(prefix.clone()..) {
        let Some(name) = path.strip_prefix(&prefix) else { break };
        if name.is_empty() || name.contains('/') {
            continue;
        }
        out.push((name.to_owned(), node.clone()));
    }
    out
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => "/",
    }
}

async fn sync_loop(s: &mut TcpStream, state: &Arc<Mutex<State>>) -> std::io::Result<()> {
    loop {
        let Some((id, len)) = read_sync_header(s).await? else {
            return Ok(());
        };
        let mut arg = vec![0u8; len as usize];
        s.read_exact(&mut arg).await?;
        let arg = String::from_utf8(arg).unwrap();
        match &id {
            b"STAT" => {
                let node = state.lock().unwrap().fs.get(&arg).cloned();
                let words = node.as_ref().map_or([0; 3], stat_words);
                s.write_all(&record(b"STAT", &words)).await?;
            }
            b"STA2" => {
                let node = state.lock().unwrap().fs.get(&arg).cloned();
                let mut v = b"STA2".to_vec();
                v.extend_from_slice(&stat_v2_body(node.as_ref()));
                s.write_all(&v).await?;
            }
            b"LIST" => {
                for (name, node) in children(state, &arg) {
                    let [mode, size, mtime] = stat_words(&node);
                    let mut v = record(b"DENT", &[mode, size, mtime, name.len() as u32]);
                    v.extend_from_slice(name.as_bytes());
                    s.write_all(&v).await?;
                }
                s.write_all(&record(b"DONE", &[0, 0, 0, 0])).await?;
            }
            b"LIS2" => {
                for (name, node) in children(state, &arg) {
                    let mut v = b"DNT2".to_vec();
                    v.extend_from_slice(&stat_v2_body(Some(&node)));
                    v.extend_from_slice(&(name.len() as u32).to_le_bytes());
                    v.extend_from_slice(name.as_bytes());
                    s.write_all(&v).await?;
                }
                let mut done = b"DONE".to_vec();
                done.resize(4 + 72, 0);
                s.write_all(&done).await?;
            }
            b"SEND" => {
                let (path, mode) = arg.rsplit_once(',').unwrap();
                let mode: u32 = mode.parse().unwrap();
                let mut data = Vec::new();
                let mtime = loop {
                    let (id, n) = read_sync_header(s).await?.expect("transfer cut short");
                    match &id {
                        b"DATA" => {
                            let n = n as usize;
                            assert!(n <= MAX_CHUNK, "DATA chunk of {n} bytes");
                            let mut chunk = vec![0u8; n];
                            s.read_exact(&mut chunk).await?;
                            let mut st = state.lock().unwrap();
                            st.largest_chunk = st.largest_chunk.max(n);
                            data.extend_from_slice(&chunk);
                        }
                        b"DONE" => break n,
                        other => panic!("unexpected {other:?} during SEND"),
                    }
                };
                let verdict = {
                    let mut st = state.lock().unwrap();
                    let dir = parent(path);
                    if dir.starts_with("/system") || dir == "/" {
                        Err("couldn't create file: Read-only file system")
                    } else if st.fs.get(dir) != Some(&Node::Dir) {
                        Err("couldn't create file: No such file or directory")
                    } else if path.ends_with(".deny") {
                        Err("couldn't create file: Permission denied")
                    } else {
                        st.fs.insert(path.to_owned(), Node::File { data, mode, mtime });
                        Ok(())
                    }
                };
                match verdict {
                    Ok(()) => s.write_all(&record(b"OKAY", &[0])).await?,
                    Err(msg) => sync_fail(s, msg).await?,
                }
            }
            b"RECV" => {
                let node = state.lock().unwrap().fs.get(&arg).cloned();
                match node {
                    Some(Node::File { data, mode, .. }) if mode & 0o444 != 0 => {
                        for chunk in data.chunks(MAX_CHUNK) {
                            let mut v = record(b"DATA", &[chunk.len() as u32]);
                            v.extend_from_slice(chunk);
                            s.write_all(&v).await?;
                        }
                        s.write_all(&record(b"DONE", &[0])).await?;
                    }
                    Some(Node::File { .. }) => sync_fail(s, "open failed: Permission denied").await?,
                    _ => sync_fail(s, "No such file or directory").await?,
                }
            }
            b"QUIT" => return Ok(()),
            other => panic!("unexpected sync request {other:?}"),
        }
    }
}

/// Splits a command line on spaces, honouring double quotes.
fn split_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    let mut any = false;
    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                any = true;
            }
            ' ' if !quoted => {
                if any {
                    args.push(std::mem::take(&mut cur));
                    any = false;
                }
            }
            c => {
                cur.push(c);
                any = true;
            }
        }
    }
    if any {
        args.push(cur);
    }
    args
}

fn mkdir(state: &Arc<Mutex<State>>, path: &str) -> Option<String> {
    let path = path.trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };
    let mut st = state.lock().unwrap();
    let dir = parent(path);
    let reason = if st.fs.contains_key(path) {
        "File exists"
    } else if st.fs.get(dir) != Some(&Node::Dir) {
        "No such file or directory"
    } else if dir == "/" || dir.starts_with("/system") {
        "Read-only file system"
    } else if dir.starts_with("/data") {
        "Permission denied"
    } else {
        st.fs.insert(path.to_owned(), Node::Dir);
        return None;
    };
    Some(format!("mkdir: '{path}': {reason}\n"))
}

async fn shell_v1(s: &mut TcpStream, state: &Arc<Mutex<State>>, cmd: &str) -> std::io::Result<()> {
    let args = split_args(cmd);
    let Some((name, rest)) = args.split_first() else {
        return Ok(());
    };
    match name.as_str() {
        "echo" => s.write_all(format!("{}\n", rest.join(" ")).as_bytes()).await,
        "mkdir" => {
            let mut out = String::new();
            for path in rest {
                if let Some(line) = mkdir(state, path) {
                    out.push_str(&line);
                }
            }
            s.write_all(out.as_bytes()).await
        }
        "getprop" => s.write_all(b"34\n").await,
        "sleep" => {
            s.write_all(b"started\n").await?;
            let mut buf = [0u8; 64];
            while s.read(&mut buf).await? > 0 {}
            Ok(())
        }
        other => {
            s.write_all(format!("/system/bin/sh: {other}: inaccessible or not found\n").as_bytes())
                .await
        }
    }
}

fn packet(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut v = vec![tag];
    v.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    v.extend_from_slice(payload);
    v
}

async fn shell_v2(s: &mut TcpStream, cmd: &str) -> std::io::Result<()> {
    let args = split_args(cmd);
    let mut out = Vec::new();
    match args.first().map(String::as_str) {
        Some("demo") => {
            out.extend(packet(1, b"out\n"));
            out.extend(packet(2, b"err\n"));
            out.extend(packet(3, &[3]));
        }
        Some("echo") => {
            out.extend(packet(1, format!("{}\n", args[1..].join(" ")).as_bytes()));
            out.extend(packet(3, &[0]));
        }
        Some(other) => {
            out.extend(packet(2, format!("/system/bin/sh: {other}: inaccessible or not found\n").as_bytes()));
            out.extend(packet(3, &[127]));
        }
        None => out.extend(packet(3, &[0])),
    }
    s.write_all(&out).await
}
