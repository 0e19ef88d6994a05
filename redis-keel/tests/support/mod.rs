//! A small in-process Redis stand-in for the end-to-end tests.
//!
//! Speaks enough RESP2 for the reliability scenarios: strings, INCR,
//! AUTH/SELECT/PING/QUIT and pub/sub with glob patterns. Tests can drop
//! live connections or make the server swallow one command and hang up,
//! which is how the delivery-guarantee scenarios create their failure
//! windows.

#![allow(dead_code)]

use bytes::BytesMut;
use redis_keel::protocol::ReplyReader;
use redis_keel::RespValue;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct TestServer {
    port: u16,
    shared: Arc<ServerShared>,
    accept_task: JoinHandle<()>,
}

struct ServerShared {
    store: Mutex<HashMap<String, String>>,
    sessions: Mutex<Vec<Arc<Session>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    password: Option<String>,
    hang_on: Mutex<Option<String>>,
    commands_seen: AtomicUsize,
    connections_accepted: AtomicUsize,
}

struct Session {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    channels: Mutex<HashSet<String>>,
    patterns: Mutex<HashSet<String>>,
    gone: AtomicBool,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with_password(None).await
    }

    pub async fn start_with_password(password: Option<&str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(ServerShared {
            store: Mutex::new(HashMap::new()),
            sessions: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            password: password.map(str::to_string),
            hang_on: Mutex::new(None),
            commands_seen: AtomicUsize::new(0),
            connections_accepted: AtomicUsize::new(0),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                accept_shared
                    .connections_accepted
                    .fetch_add(1, Ordering::SeqCst);
                let task = tokio::spawn(serve(Arc::clone(&accept_shared), socket));
                accept_shared.tasks.lock().unwrap().push(task);
            }
        });

        Self {
            port,
            shared,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("redis://127.0.0.1:{}", self.port)
    }

    pub fn url_with_password(&self, password: &str) -> String {
        format!("redis://{password}@127.0.0.1:{}", self.port)
    }

    /// Tear down every live connection, as if the server restarted.
    pub fn drop_connections(&self) {
        for session in self.shared.sessions.lock().unwrap().iter() {
            session.gone.store(true, Ordering::SeqCst);
            // close marker: the writer drops the socket and sends FIN
            let _ = session.outbound.send(Vec::new());
        }
        for task in self.shared.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Make the server hang up on the next command with this verb, before
    /// executing it.
    pub fn hang_up_on(&self, verb: &str) {
        *self.shared.hang_on.lock().unwrap() = Some(verb.to_ascii_uppercase());
    }

    pub fn commands_seen(&self) -> usize {
        self.shared.commands_seen.load(Ordering::SeqCst)
    }

    pub fn connections_accepted(&self) -> usize {
        self.shared.connections_accepted.load(Ordering::SeqCst)
    }

    pub fn value_of(&self, key: &str) -> Option<String> {
        self.shared.store.lock().unwrap().get(key).cloned()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

async fn serve(shared: Arc<ServerShared>, socket: TcpStream) {
    let (mut read, mut write) = socket.into_split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let session = Arc::new(Session {
        outbound: outbound.clone(),
        channels: Mutex::new(HashSet::new()),
        patterns: Mutex::new(HashSet::new()),
        gone: AtomicBool::new(false),
    });
    shared.sessions.lock().unwrap().push(Arc::clone(&session));

    // an empty chunk is the close marker; everything queued before it is
    // written first, so a QUIT reply always precedes the FIN
    let writer = tokio::spawn(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            if bytes.is_empty() || write.write_all(&bytes).await.is_err() {
                return;
            }
        }
    });

    let mut reader = ReplyReader::new();
    'conn: loop {
        let frame = loop {
            match reader.next_frame() {
                Ok(Some(frame)) => break frame,
                Ok(None) => {}
                Err(_) => break 'conn,
            }
            match read.read_buf(reader.buffer_mut()).await {
                Ok(0) | Err(_) => break 'conn,
                Ok(_) => {}
            }
        };

        let Some(request) = request_parts(&frame) else {
            let _ = outbound.send(b"-ERR protocol error\r\n".to_vec());
            continue;
        };
        let verb = request[0].to_ascii_uppercase();
        shared.commands_seen.fetch_add(1, Ordering::SeqCst);

        let hang = {
            let mut hang_on = shared.hang_on.lock().unwrap();
            if hang_on.as_deref() == Some(verb.as_str()) {
                *hang_on = None;
                true
            } else {
                false
            }
        };
        if hang {
            break 'conn;
        }

        let quit = dispatch(&shared, &session, &verb, &request[1..]);
        if quit {
            break 'conn;
        }
    }

    session.gone.store(true, Ordering::SeqCst);
    let _ = outbound.send(Vec::new());
    drop(outbound);
    let _ = writer.await;
}

/// Handle one request; returns `true` when the connection should close.
fn dispatch(
    shared: &Arc<ServerShared>,
    session: &Arc<Session>,
    verb: &str,
    args: &[String],
) -> bool {
    let reply: Vec<u8> = match verb {
        "PING" => b"+PONG\r\n".to_vec(),
        "QUIT" => {
            let _ = session.outbound.send(b"+OK\r\n".to_vec());
            return true;
        }
        "AUTH" => match (&shared.password, args.first()) {
            (Some(expected), Some(given)) if expected == given => b"+OK\r\n".to_vec(),
            (Some(_), _) => b"-ERR invalid password\r\n".to_vec(),
            (None, _) => b"-ERR Client sent AUTH, but no password is set\r\n".to_vec(),
        },
        "SELECT" => b"+OK\r\n".to_vec(),
        "SET" => {
            if let [key, value, ..] = args {
                shared
                    .store
                    .lock()
                    .unwrap()
                    .insert(key.clone(), value.clone());
                b"+OK\r\n".to_vec()
            } else {
                b"-ERR wrong number of arguments for 'set' command\r\n".to_vec()
            }
        }
        "GET" => match args.first().and_then(|k| shared.store.lock().unwrap().get(k).cloned()) {
            Some(value) => bulk(&value),
            None => b"$-1\r\n".to_vec(),
        },
        "DEL" => {
            let mut store = shared.store.lock().unwrap();
            let removed = args.iter().filter(|k| store.remove(*k).is_some()).count();
            integer(removed as i64)
        }
        "INCR" => match args.first() {
            None => b"-ERR wrong number of arguments for 'incr' command\r\n".to_vec(),
            Some(key) => {
                let mut store = shared.store.lock().unwrap();
                let current = store.get(key).map_or(Ok(0), |v| v.parse::<i64>());
                match current {
                    Ok(n) => {
                        store.insert(key.clone(), (n + 1).to_string());
                        integer(n + 1)
                    }
                    Err(_) => b"-ERR value is not an integer or out of range\r\n".to_vec(),
                }
            }
        },
        "PUBLISH" => {
            if let [channel, payload, ..] = args {
                integer(publish(shared, channel, payload))
            } else {
                b"-ERR wrong number of arguments for 'publish' command\r\n".to_vec()
            }
        }
        "SUBSCRIBE" => {
            for name in args {
                session.channels.lock().unwrap().insert(name.clone());
                let count = subscription_count(session);
                let _ = session.outbound.send(ack("subscribe", name, count));
            }
            return false;
        }
        "UNSUBSCRIBE" => {
            for name in args {
                session.channels.lock().unwrap().remove(name);
                let count = subscription_count(session);
                let _ = session.outbound.send(ack("unsubscribe", name, count));
            }
            return false;
        }
        "PSUBSCRIBE" => {
            for name in args {
                session.patterns.lock().unwrap().insert(name.clone());
                let count = subscription_count(session);
                let _ = session.outbound.send(ack("psubscribe", name, count));
            }
            return false;
        }
        "PUNSUBSCRIBE" => {
            for name in args {
                session.patterns.lock().unwrap().remove(name);
                let count = subscription_count(session);
                let _ = session.outbound.send(ack("punsubscribe", name, count));
            }
            return false;
        }
        other => format!("-ERR unknown command '{other}'\r\n").into_bytes(),
    };

    let _ = session.outbound.send(reply);
    false
}

fn publish(shared: &Arc<ServerShared>, channel: &str, payload: &str) -> i64 {
    let mut receivers = 0;
    let sessions = shared.sessions.lock().unwrap();
    for session in sessions.iter() {
        if session.gone.load(Ordering::SeqCst) {
            continue;
        }
        if session.channels.lock().unwrap().contains(channel) {
            let frame = push_frame(&["message", channel, payload]);
            if session.outbound.send(frame).is_ok() {
                receivers += 1;
            }
        }
        let matching: Vec<String> = session
            .patterns
            .lock()
            .unwrap()
            .iter()
            .filter(|p| glob_match(p, channel))
            .cloned()
            .collect();
        for pattern in matching {
            let frame = push_frame(&["pmessage", &pattern, channel, payload]);
            if session.outbound.send(frame).is_ok() {
                receivers += 1;
            }
        }
    }
    receivers
}

fn subscription_count(session: &Arc<Session>) -> i64 {
    (session.channels.lock().unwrap().len() + session.patterns.lock().unwrap().len()) as i64
}

fn request_parts(frame: &RespValue) -> Option<Vec<String>> {
    let RespValue::Array(items) = frame else {
        return None;
    };
    if items.is_empty() {
        return None;
    }
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        match item {
            RespValue::Bulk(b) => parts.push(String::from_utf8(b.to_vec()).ok()?),
            _ => return None,
        }
    }
    Some(parts)
}

fn bulk(value: &str) -> Vec<u8> {
    format!("${}\r\n{value}\r\n", value.len()).into_bytes()
}

fn integer(value: i64) -> Vec<u8> {
    format!(":{value}\r\n").into_bytes()
}

fn ack(kind: &str, name: &str, count: i64) -> Vec<u8> {
    let mut out = format!("*3\r\n${}\r\n{kind}\r\n", kind.len()).into_bytes();
    out.extend_from_slice(&bulk(name));
    out.extend_from_slice(&integer(count));
    out
}

fn push_frame(parts: &[&str]) -> Vec<u8> {
    let mut out = BytesMut::new();
    out.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
    for part in parts {
        out.extend_from_slice(&bulk(part));
    }
    out.to_vec()
}

/// Redis-style glob: `*` any sequence, `?` any single character.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(a), Some(b)) if a == b => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}
