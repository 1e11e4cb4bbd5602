//! Loopback stand-in for a Redis server with the JSON module, speaking RESP2.
#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::{Buf as _, BytesMut};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{TcpListener, TcpStream},
    sync::Mutex,
    task::JoinHandle,
};
use voters::medium::redis::resp::{self, Reply};

/// Keys returned per SCAN call, small so clients have to follow the cursor.
const SCAN_PAGE: usize = 2;

struct Shared {
    json_module: bool,
    dbs: Mutex<BTreeMap<u32, BTreeMap<String, String>>>,
    commands: Mutex<Vec<String>>,
    drop_next: AtomicBool,
}

pub struct FakeCache {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl FakeCache {
    pub async fn spawn() -> Self {
        Self::spawn_with(true).await
    }

    pub async fn spawn_without_json_module() -> Self {
        Self::spawn_with(false).await
    }

    async fn spawn_with(json_module: bool) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            json_module,
            dbs: Mutex::new(BTreeMap::new()),
            commands: Mutex::new(Vec::new()),
            drop_next: AtomicBool::new(false),
        });
        let accept_shared = shared.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, accept_shared.clone()));
            }
        });
        Self { addr, shared, task }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// The next command received on any connection closes that connection unanswered.
    pub fn drop_next_command(&self) {
        self.shared.drop_next.store(true, Ordering::SeqCst);
    }

    pub async fn insert_raw(&self, db: u32, key: &str, value: &str) {
        self.shared
            .dbs
            .lock()
            .await
            .entry(db)
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub async fn raw(&self, db: u32, key: &str) -> Option<String> {
        self.shared
            .dbs
            .lock()
            .await
            .get(&db)
            .and_then(|t| t.get(key).cloned())
    }

    pub async fn keys(&self, db: u32) -> Vec<String> {
        self.shared
            .dbs
            .lock()
            .await
            .get(&db)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Upper-cased command names in the order they were received.
    pub async fn commands(&self) -> Vec<String> {
        self.shared.commands.lock().await.clone()
    }
}

impl Drop for FakeCache {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut buf = BytesMut::with_capacity(4096);
    let mut db = 0u32;
    loop {
        loop {
            let frame = match resp::decode(&buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => return,
            };
            let (request, used) = frame;
            buf.advance(used);

            if shared.drop_next.swap(false, Ordering::SeqCst) {
                return;
            }
            let reply = match args(request) {
                Some(args) => dispatch(&shared, &mut db, args).await,
                None => Reply::Error("ERR protocol error".to_string()),
            };
            let mut out = BytesMut::new();
            reply.encode(&mut out);
            if stream.write_all(&out).await.is_err() {
                return;
            }
        }
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

fn args(request: Reply) -> Option<Vec<String>> {
    let Reply::Array(items) = request else {
        return None;
    };
    items
        .into_iter()
        .map(|item| match item {
            Reply::Bulk(b) => String::from_utf8(b.to_vec()).ok(),
            _ => None,
        })
        .collect()
}

async fn dispatch(shared: &Shared, db: &mut u32, args: Vec<String>) -> Reply {
    let Some(name) = args.first().map(|n| n.to_ascii_uppercase()) else {
        return Reply::Error("ERR empty command".to_string());
    };
    shared.commands.lock().await.push(name.clone());

    if name.starts_with("JSON.") && !shared.json_module {
        return Reply::Error(format!("ERR unknown command '{name}'"));
    }

    let mut dbs = shared.dbs.lock().await;
    let table = dbs.entry(*db).or_default();
    match (name.as_str(), &args[1..]) {
        ("PING", []) => Reply::Simple("PONG".to_string()),
        ("SELECT", [n]) => match n.parse() {
            Ok(n) => {
                *db = n;
                ok()
            }
            Err(_) => Reply::Error("ERR invalid DB index".to_string()),
        },
        ("SET", [key, value]) => {
            table.insert(key.clone(), value.clone());
            ok()
        }
        ("JSON.SET", [key, path, doc]) if path == "$" || path == "." => {
            match serde_json::from_str::<serde_json::Value>(doc) {
                Ok(value) => {
                    table.insert(key.clone(), value.to_string());
                    ok()
                }
                Err(e) => Reply::Error(format!("ERR {e}")),
            }
        }
        ("GET", [key]) | ("JSON.GET", [key]) => match table.get(key) {
            Some(value) => Reply::bulk(value.clone()),
            None => Reply::Nil,
        },
        ("DEL", keys) if !keys.is_empty() => {
            let removed = keys.iter().filter(|k| table.remove(*k).is_some()).count();
            Reply::Integer(removed as i64)
        }
        ("SCAN", [cursor, m, pattern, c, _count])
            if m.eq_ignore_ascii_case("MATCH") && c.eq_ignore_ascii_case("COUNT") =>
        {
            let Ok(start) = cursor.parse::<usize>() else {
                return Reply::Error("ERR invalid cursor".to_string());
            };
            let Some(prefix) = glob_prefix(pattern) else {
                return Reply::Error("ERR unsupported pattern".to_string());
            };
            let all: Vec<&String> = table.keys().collect();
            let end = (start + SCAN_PAGE).min(all.len());
            let page = all
                .get(start..end)
                .unwrap_or_default()
                .iter()
                .filter(|k| k.starts_with(&prefix))
                .map(|k| Reply::bulk((*k).clone()))
                .collect();
            let next = if end >= all.len() { 0 } else { end };
            Reply::Array(vec![Reply::bulk(next.to_string()), Reply::Array(page)])
        }
        _ => Reply::Error(format!("ERR unknown command or wrong arity '{name}'")),
    }
}

fn ok() -> Reply {
    Reply::Simple("OK".to_string())
}

/// Literal prefix of a `prefix*` glob, honouring backslash escapes.
fn glob_prefix(pattern: &str) -> Option<String> {
    let mut out = String::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            '*' => return chars.next().is_none().then_some(out),
            '?' | '[' | ']' => return None,
            c => out.push(c),
        }
    }
    None
}
