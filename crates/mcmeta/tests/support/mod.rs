//! An in-process memcached speaking just enough of the meta protocol for
//! the integration tests: mg/ms/md/ma/me/mn over real TCP, with TTLs, cas,
//! vivify, and switchable fault injection.

use std::{
    collections::HashMap,
    io::{BufRead, BufReader, Read, Write},
    net::{TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    Normal,
    /// Answer every command with `SERVER_ERROR` (opaque echoed).
    ServerError,
    /// Read requests, never answer.
    Silent,
}

struct Entry {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
    expires_at: Option<Instant>,
}

struct State {
    store: Mutex<HashMap<Vec<u8>, Entry>>,
    behavior: Mutex<Behavior>,
    cas_counter: AtomicU64,
    connections: AtomicUsize,
}

pub struct MemcachedMock {
    state: Arc<State>,
    addr: String,
    _listener: TcpListener,
}

impl MemcachedMock {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(State {
            store: Mutex::new(HashMap::new()),
            behavior: Mutex::new(Behavior::Normal),
            cas_counter: AtomicU64::new(1),
            connections: AtomicUsize::new(0),
        });

        let accept_state = Arc::clone(&state);
        let accept_listener = listener.try_clone().unwrap();
        thread::spawn(move || {
            while let Ok((stream, _)) = accept_listener.accept() {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let conn_state = Arc::clone(&accept_state);
                thread::spawn(move || serve(stream, &conn_state));
            }
        });

        Self { state, addr, _listener: listener }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.state.behavior.lock().unwrap() = behavior;
    }

    pub fn connections_accepted(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

struct Flags(Vec<(u8, String)>);

impl Flags {
    fn parse<'a>(tokens: impl Iterator<Item = &'a str>) -> Self {
        Self(
            tokens
                .filter(|t| !t.is_empty())
                .map(|t| (t.as_bytes()[0], t[1..].to_string()))
                .collect(),
        )
    }

    fn has(&self, letter: u8) -> bool {
        self.0.iter().any(|(l, _)| *l == letter)
    }

    fn token(&self, letter: u8) -> Option<&str> {
        self.0.iter().rev().find(|(l, _)| *l == letter).map(|(_, t)| t.as_str())
    }

    fn numeric(&self, letter: u8) -> Option<u64> {
        self.token(letter)?.parse().ok()
    }

    /// The echo suffix (` O.. k..`) for a response line.
    fn echo(&self, key: &str) -> String {
        let mut out = String::new();
        if let Some(opaque) = self.token(b'O') {
            out.push_str(" O");
            out.push_str(opaque);
        }
        if self.has(b'k') {
            out.push_str(" k");
            out.push_str(key);
        }
        out
    }
}

fn serve(stream: TcpStream, state: &State) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(&line).trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        let mut tokens = line.split(' ');
        let verb = tokens.next().unwrap_or_default().to_string();

        let behavior = *state.behavior.lock().unwrap();
        match behavior {
            Behavior::Silent => {
                consume_payload(&verb, &line, &mut reader);
                continue;
            }
            Behavior::ServerError => {
                consume_payload(&verb, &line, &mut reader);
                let flags = Flags::parse(line.split(' ').skip(1));
                let echo = flags.token(b'O').map(|o| format!(" O{o}")).unwrap_or_default();
                let _ = write!(writer, "SERVER_ERROR synthetic failure{echo}\r\n");
                continue;
            }
            Behavior::Normal => {}
        }

        let reply: Vec<u8> = match verb.as_str() {
            "mn" => b"MN\r\n".to_vec(),
            "mg" => {
                let key = tokens.next().unwrap_or_default().to_string();
                let flags = Flags::parse(tokens);
                meta_get(state, &key, &flags)
            }
            "ms" => {
                let key = tokens.next().unwrap_or_default().to_string();
                let len: usize = tokens.next().unwrap_or_default().parse().unwrap();
                let flags = Flags::parse(tokens);
                let mut value = vec![0u8; len + 2];
                if reader.read_exact(&mut value).is_err() {
                    return;
                }
                value.truncate(len);
                meta_set(state, &key, value, &flags)
            }
            "md" => {
                let key = tokens.next().unwrap_or_default().to_string();
                let flags = Flags::parse(tokens);
                meta_delete(state, &key, &flags)
            }
            "ma" => {
                let key = tokens.next().unwrap_or_default().to_string();
                let flags = Flags::parse(tokens);
                meta_arithmetic(state, &key, &flags)
            }
            "me" => {
                let key = tokens.next().unwrap_or_default().to_string();
                meta_debug(state, &key)
            }
            _ => b"ERROR\r\n".to_vec(),
        };
        if writer.write_all(&reply).is_err() {
            return;
        }
    }
}

/// In silent/error modes the payload of an `ms` still has to be drained so
/// the next command line parses.
fn consume_payload(verb: &str, line: &str, reader: &mut BufReader<TcpStream>) {
    if verb != "ms" {
        return;
    }
    if let Some(len) = line.split(' ').nth(2).and_then(|t| t.parse::<usize>().ok()) {
        let mut sink = vec![0u8; len + 2];
        let _ = reader.read_exact(&mut sink);
    }
}

fn live_entry<'a>(
    store: &'a mut HashMap<Vec<u8>, Entry>,
    key: &str,
) -> Option<&'a Entry> {
    let expired = store
        .get(key.as_bytes())
        .is_some_and(|e| e.expires_at.is_some_and(|at| Instant::now() >= at));
    if expired {
        store.remove(key.as_bytes());
    }
    store.get(key.as_bytes())
}

fn expiry_from(secs: Option<u64>) -> Option<Instant> {
    match secs {
        None | Some(0) => None,
        Some(s) => Some(Instant::now() + Duration::from_secs(s)),
    }
}

fn meta_get(state: &State, key: &str, flags: &Flags) -> Vec<u8> {
    let mut store = state.store.lock().unwrap();
    match live_entry(&mut store, key) {
        Some(entry) if flags.has(b'v') => {
            let mut head = format!("VA {}", entry.value.len());
            head.push_str(&flags.echo(key));
            if flags.has(b'f') {
                head.push_str(&format!(" f{}", entry.flags));
            }
            if flags.has(b'c') {
                head.push_str(&format!(" c{}", entry.cas));
            }
            let mut reply = head.into_bytes();
            reply.extend_from_slice(b"\r\n");
            reply.extend_from_slice(&entry.value);
            reply.extend_from_slice(b"\r\n");
            reply
        }
        Some(_) => format!("HD{}\r\n", flags.echo(key)).into_bytes(),
        None => format!("EN{}\r\n", flags.echo(key)).into_bytes(),
    }
}

fn meta_set(state: &State, key: &str, value: Vec<u8>, flags: &Flags) -> Vec<u8> {
    let mut store = state.store.lock().unwrap();
    let exists = live_entry(&mut store, key).is_some();
    let mode = flags.token(b'M').unwrap_or("S");

    let refused = match mode {
        "E" => exists,
        "R" | "A" | "P" => !exists,
        _ => false,
    };
    if refused {
        return format!("NS{}\r\n", flags.echo(key)).into_bytes();
    }
    if let Some(cas) = flags.numeric(b'C') {
        match store.get(key.as_bytes()) {
            None => return format!("NF{}\r\n", flags.echo(key)).into_bytes(),
            Some(entry) if entry.cas != cas => {
                return format!("EX{}\r\n", flags.echo(key)).into_bytes();
            }
            Some(_) => {}
        }
    }

    let stored = match mode {
        "A" | "P" => {
            let mut current = store.remove(key.as_bytes()).unwrap();
            if mode == "A" {
                current.value.extend_from_slice(&value);
            } else {
                let mut prepended = value;
                prepended.extend_from_slice(&current.value);
                current.value = prepended;
            }
            current
        }
        _ => Entry {
            value,
            flags: flags.numeric(b'F').unwrap_or(0) as u32,
            cas: 0,
            expires_at: expiry_from(flags.numeric(b'T')),
        },
    };
    let mut stored = stored;
    stored.cas = state.cas_counter.fetch_add(1, Ordering::SeqCst);
    store.insert(key.as_bytes().to_vec(), stored);
    format!("HD{}\r\n", flags.echo(key)).into_bytes()
}

fn meta_delete(state: &State, key: &str, flags: &Flags) -> Vec<u8> {
    let mut store = state.store.lock().unwrap();
    live_entry(&mut store, key);
    match store.remove(key.as_bytes()) {
        Some(_) => format!("HD{}\r\n", flags.echo(key)).into_bytes(),
        None => format!("NF{}\r\n", flags.echo(key)).into_bytes(),
    }
}

fn meta_arithmetic(state: &State, key: &str, flags: &Flags) -> Vec<u8> {
    let mut store = state.store.lock().unwrap();
    let delta = flags.numeric(b'D').unwrap_or(1);
    let decrement = matches!(flags.token(b'M'), Some("D") | Some("-"));

    let current = match live_entry(&mut store, key) {
        Some(entry) => {
            let Some(current) = std::str::from_utf8(&entry.value)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
            else {
                return format!(
                    "CLIENT_ERROR cannot increment or decrement non-numeric value{}\r\n",
                    flags.echo(key)
                )
                .into_bytes();
            };
            Some(current)
        }
        None => None,
    };

    let new_value = match current {
        Some(current) => {
            if decrement {
                current.saturating_sub(delta)
            } else {
                current + delta
            }
        }
        None => {
            // vivify only when N is present
            if flags.token(b'N').is_none() {
                return format!("NF{}\r\n", flags.echo(key)).into_bytes();
            }
            flags.numeric(b'J').unwrap_or(0)
        }
    };

    let rendered = new_value.to_string().into_bytes();
    let cas = state.cas_counter.fetch_add(1, Ordering::SeqCst);
    let expires_at = expiry_from(flags.numeric(b'N'));
    store.insert(
        key.as_bytes().to_vec(),
        Entry { value: rendered.clone(), flags: 0, cas, expires_at },
    );

    if flags.has(b'v') {
        format!(
            "VA {}{}\r\n{}\r\n",
            rendered.len(),
            flags.echo(key),
            String::from_utf8_lossy(&rendered)
        )
        .into_bytes()
    } else {
        format!("HD{}\r\n", flags.echo(key)).into_bytes()
    }
}

fn meta_debug(state: &State, key: &str) -> Vec<u8> {
    let mut store = state.store.lock().unwrap();
    match live_entry(&mut store, key) {
        Some(entry) => format!(
            "ME {key} exp=-1 la=0 cas={} fetch=no cls=1 size={}\r\n",
            entry.cas,
            entry.value.len()
        )
        .into_bytes(),
        None => b"EN\r\n".to_vec(),
    }
}
