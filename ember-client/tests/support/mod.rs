//! An in-process memcached speaking the binary protocol over real TCP.
//!
//! Implements enough of the server side to exercise the whole client
//! stack: flags, cas, expiry, store modes, counters, concat, quiet-get
//! pipelines, stat streams, and SASL PLAIN with a configurable number of
//! continuation rounds. State survives a stop/restart cycle so revival
//! tests can bring "the same server" back on its port.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use ember_core::Limits;
use ember_proto::{read_request_frame, write_response, Opcode, RequestFrame, Status};

/// Relative/absolute pivot of the expiration word.
const THIRTY_DAYS_SECS: u32 = 30 * 24 * 60 * 60;

/// Delta expiration sentinel: fail instead of seeding.
const DELTA_NO_CREATE: u32 = 0xFFFF_FFFF;

struct Item {
    data: Vec<u8>,
    flags: u32,
    cas: u64,
    expires_at: Option<SystemTime>,
}

impl Item {
    fn expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Server-side item table, shared across connections and restarts.
#[derive(Default)]
pub struct Store {
    items: HashMap<Vec<u8>, Item>,
    cas_counter: u64,
}

impl Store {
    fn next_cas(&mut self) -> u64 {
        self.cas_counter += 1;
        self.cas_counter
    }

    fn fetch(&mut self, key: &[u8]) -> Option<&Item> {
        if self
            .items
            .get(key)
            .is_some_and(|item| item.expired(SystemTime::now()))
        {
            self.items.remove(key);
        }
        self.items.get(key)
    }

    fn contains(&mut self, key: &[u8]) -> bool {
        self.fetch(key).is_some()
    }
}

fn expiry_from_word(word: u32) -> Option<SystemTime> {
    if word == 0 {
        None
    } else if word <= THIRTY_DAYS_SECS {
        Some(SystemTime::now() + Duration::from_secs(u64::from(word)))
    } else {
        Some(UNIX_EPOCH + Duration::from_secs(u64::from(word)))
    }
}

/// SASL credentials the server accepts, plus how many `AuthContinue`
/// rounds it demands after the initial `SaslAuth` before succeeding.
#[derive(Clone)]
struct MockAuth {
    username: String,
    password: String,
    continue_steps: u32,
}

pub struct MockServer {
    addr: SocketAddr,
    store: Arc<Mutex<Store>>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept_task: JoinHandle<()>,
}

/// Opt-in logging for test runs: `EMBER_TEST_LOG=debug cargo test`.
fn init_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        if let Ok(filter) = std::env::var("EMBER_TEST_LOG") {
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        }
    });
}

impl MockServer {
    /// Starts an unauthenticated server on an ephemeral port.
    pub async fn start() -> Self {
        Self::launch(None, None, Arc::default()).await
    }

    /// Starts a server requiring SASL PLAIN with these credentials.
    pub async fn start_with_auth(username: &str, password: &str) -> Self {
        Self::start_with_auth_steps(username, password, 0).await
    }

    /// Starts an authenticating server that answers the handshake with
    /// `continue_steps` rounds of `AuthContinue` before succeeding.
    pub async fn start_with_auth_steps(
        username: &str,
        password: &str,
        continue_steps: u32,
    ) -> Self {
        let auth = MockAuth {
            username: username.to_string(),
            password: password.to_string(),
            continue_steps,
        };
        Self::launch(None, Some(auth), Arc::default()).await
    }

    /// Restarts a stopped server on its old address with its old items.
    pub async fn restart(addr: SocketAddr, store: Arc<Mutex<Store>>) -> Self {
        Self::launch(Some(addr), None, store).await
    }

    async fn launch(
        bind: Option<SocketAddr>,
        auth: Option<MockAuth>,
        store: Arc<Mutex<Store>>,
    ) -> Self {
        init_logging();
        let bind = bind.unwrap_or_else(|| "127.0.0.1:0".parse().unwrap());
        let listener = reusable_listener(bind);
        let addr = listener.local_addr().unwrap();

        let connections: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();
        let accept_store = Arc::clone(&store);
        let accept_connections = Arc::clone(&connections);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _peer)) = listener.accept().await else {
                    break;
                };
                let store = Arc::clone(&accept_store);
                let auth = auth.clone();
                let task = tokio::spawn(serve(stream, store, auth));
                accept_connections.lock().unwrap().push(task);
            }
        });

        Self {
            addr,
            store,
            connections,
            accept_task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Kills the listener and every live connection, returning the state
    /// needed to restart in place.
    pub async fn stop(self) -> (SocketAddr, Arc<Mutex<Store>>) {
        self.accept_task.abort();
        for task in self.connections.lock().unwrap().drain(..) {
            task.abort();
        }
        // Let the aborted tasks drop their sockets.
        tokio::time::sleep(Duration::from_millis(50)).await;
        (self.addr, self.store)
    }
}

fn reusable_listener(addr: SocketAddr) -> TcpListener {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    socket.set_reuse_address(true).unwrap();
    socket.set_nonblocking(true).unwrap();
    socket.bind(&addr.into()).unwrap();
    socket.listen(128).unwrap();
    TcpListener::from_std(socket.into()).unwrap()
}

/// Per-connection SASL handshake state.
struct AuthSession {
    authed: bool,
    /// `AuthContinue` rounds still owed before the handshake succeeds.
    steps_remaining: Option<u32>,
}

async fn serve(mut stream: TcpStream, store: Arc<Mutex<Store>>, auth: Option<MockAuth>) {
    let limits = Limits::new();
    let mut session = AuthSession {
        authed: auth.is_none(),
        steps_remaining: None,
    };
    let mut inbound = BytesMut::with_capacity(4096);
    let mut outbound = BytesMut::new();

    loop {
        match stream.read_buf(&mut inbound).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        loop {
            match read_request_frame(&mut inbound, &limits) {
                Ok(Some(frame)) => {
                    let keep_open =
                        handle(&frame, &store, auth.as_ref(), &mut session, &mut outbound);
                    if !keep_open {
                        let _ = stream.write_all(&outbound).await;
                        return;
                    }
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }

        if !outbound.is_empty() {
            if stream.write_all(&outbound).await.is_err() {
                return;
            }
            outbound.clear();
        }
    }
}

#[allow(clippy::too_many_lines)]
fn handle(
    frame: &RequestFrame,
    store: &Mutex<Store>,
    auth: Option<&MockAuth>,
    session: &mut AuthSession,
    out: &mut BytesMut,
) -> bool {
    let opcode = frame.header.opcode;
    let opaque = frame.header.opaque;

    if !session.authed
        && !matches!(
            opcode,
            Opcode::SaslListMechs | Opcode::SaslAuth | Opcode::SaslStep
        )
    {
        write_response(
            out,
            opcode,
            Status::AuthRequired,
            opaque,
            0,
            &[],
            b"",
            b"Authentication required",
        );
        return true;
    }

    match opcode {
        Opcode::Get | Opcode::GetK | Opcode::GetQ | Opcode::GetKQ => {
            let quiet = matches!(opcode, Opcode::GetQ | Opcode::GetKQ);
            let with_key = matches!(opcode, Opcode::GetK | Opcode::GetKQ);
            let mut store = store.lock().unwrap();
            match store.fetch(&frame.key) {
                Some(item) => {
                    let key: &[u8] = if with_key { &frame.key } else { b"" };
                    write_response(
                        out,
                        opcode,
                        Status::NoError,
                        opaque,
                        item.cas,
                        &item.flags.to_be_bytes(),
                        key,
                        &item.data,
                    );
                }
                None if quiet => {}
                None => write_response(
                    out,
                    opcode,
                    Status::KeyNotFound,
                    opaque,
                    0,
                    &[],
                    b"",
                    b"Not found",
                ),
            }
        }

        Opcode::Set | Opcode::Add | Opcode::Replace => {
            if frame.extras.len() != 8 {
                write_response(out, opcode, Status::InvalidArguments, opaque, 0, &[], b"", b"");
                return true;
            }
            let flags = u32::from_be_bytes(frame.extras[..4].try_into().unwrap());
            let expiry = u32::from_be_bytes(frame.extras[4..].try_into().unwrap());

            let mut store = store.lock().unwrap();
            let exists = store.contains(&frame.key);
            let status = if frame.header.cas != 0 {
                match store.fetch(&frame.key) {
                    None => Some(Status::KeyNotFound),
                    Some(item) if item.cas != frame.header.cas => Some(Status::KeyExists),
                    Some(_) => None,
                }
            } else {
                match opcode {
                    Opcode::Add if exists => Some(Status::KeyExists),
                    Opcode::Replace if !exists => Some(Status::KeyNotFound),
                    _ => None,
                }
            };

            if let Some(status) = status {
                write_response(out, opcode, status, opaque, 0, &[], b"", b"Not stored");
            } else {
                let cas = store.next_cas();
                store.items.insert(
                    frame.key.to_vec(),
                    Item {
                        data: frame.value.to_vec(),
                        flags,
                        cas,
                        expires_at: expiry_from_word(expiry),
                    },
                );
                write_response(out, opcode, Status::NoError, opaque, cas, &[], b"", b"");
            }
        }

        Opcode::Delete => {
            let mut store = store.lock().unwrap();
            let existed = store.contains(&frame.key);
            if existed {
                store.items.remove(frame.key.as_ref());
                write_response(out, opcode, Status::NoError, opaque, 0, &[], b"", b"");
            } else {
                write_response(
                    out,
                    opcode,
                    Status::KeyNotFound,
                    opaque,
                    0,
                    &[],
                    b"",
                    b"Not found",
                );
            }
        }

        Opcode::Increment | Opcode::Decrement => {
            if frame.extras.len() != 20 {
                write_response(out, opcode, Status::InvalidArguments, opaque, 0, &[], b"", b"");
                return true;
            }
            let delta = u64::from_be_bytes(frame.extras[..8].try_into().unwrap());
            let initial = u64::from_be_bytes(frame.extras[8..16].try_into().unwrap());
            let expiry = u32::from_be_bytes(frame.extras[16..].try_into().unwrap());

            let mut store = store.lock().unwrap();
            let current = store
                .fetch(&frame.key)
                .map(|item| std::str::from_utf8(&item.data).ok().and_then(|s| s.parse::<u64>().ok()));
            let new_value = match current {
                None => {
                    if expiry == DELTA_NO_CREATE {
                        write_response(
                            out,
                            opcode,
                            Status::KeyNotFound,
                            opaque,
                            0,
                            &[],
                            b"",
                            b"Not found",
                        );
                        return true;
                    }
                    initial
                }
                Some(None) => {
                    write_response(
                        out,
                        opcode,
                        Status::NonNumericValue,
                        opaque,
                        0,
                        &[],
                        b"",
                        b"Non-numeric value",
                    );
                    return true;
                }
                Some(Some(value)) => {
                    if opcode == Opcode::Increment {
                        value.wrapping_add(delta)
                    } else {
                        value.saturating_sub(delta)
                    }
                }
            };

            let cas = store.next_cas();
            let expires_at = store
                .items
                .get(frame.key.as_ref())
                .and_then(|item| item.expires_at)
                .or_else(|| expiry_from_word(expiry));
            store.items.insert(
                frame.key.to_vec(),
                Item {
                    data: new_value.to_string().into_bytes(),
                    flags: 0,
                    cas,
                    expires_at,
                },
            );
            write_response(
                out,
                opcode,
                Status::NoError,
                opaque,
                cas,
                &[],
                b"",
                &new_value.to_be_bytes(),
            );
        }

        Opcode::Append | Opcode::Prepend => {
            let mut store = store.lock().unwrap();
            if !store.contains(&frame.key) {
                write_response(
                    out,
                    opcode,
                    Status::ItemNotStored,
                    opaque,
                    0,
                    &[],
                    b"",
                    b"Not stored",
                );
                return true;
            }
            let cas = store.next_cas();
            let item = store.items.get_mut(frame.key.as_ref()).unwrap();
            if opcode == Opcode::Append {
                item.data.extend_from_slice(&frame.value);
            } else {
                let mut data = frame.value.to_vec();
                data.extend_from_slice(&item.data);
                item.data = data;
            }
            item.cas = cas;
            write_response(out, opcode, Status::NoError, opaque, cas, &[], b"", b"");
        }

        Opcode::Flush => {
            store.lock().unwrap().items.clear();
            write_response(out, opcode, Status::NoError, opaque, 0, &[], b"", b"");
        }

        Opcode::Version => {
            write_response(
                out,
                opcode,
                Status::NoError,
                opaque,
                0,
                &[],
                b"",
                b"1.6.21-ember-mock",
            );
        }

        Opcode::Noop => {
            write_response(out, opcode, Status::NoError, opaque, 0, &[], b"", b"");
        }

        Opcode::Stat => {
            let items = store.lock().unwrap().items.len().to_string();
            for (name, value) in [
                ("pid", "4242"),
                ("version", "1.6.21-ember-mock"),
                ("curr_items", items.as_str()),
            ] {
                write_response(
                    out,
                    opcode,
                    Status::NoError,
                    opaque,
                    0,
                    &[],
                    name.as_bytes(),
                    value.as_bytes(),
                );
            }
            write_response(out, opcode, Status::NoError, opaque, 0, &[], b"", b"");
        }

        Opcode::Quit => {
            write_response(out, opcode, Status::NoError, opaque, 0, &[], b"", b"");
            return false;
        }

        Opcode::SaslListMechs => {
            write_response(out, opcode, Status::NoError, opaque, 0, &[], b"", b"PLAIN");
        }

        Opcode::SaslAuth => {
            let accepted = auth.is_some_and(|auth| {
                let expected = format!("\0{}\0{}", auth.username, auth.password);
                frame.key.as_ref() == b"PLAIN" && frame.value.as_ref() == expected.as_bytes()
            });
            if !accepted {
                write_response(
                    out,
                    opcode,
                    Status::AuthRequired,
                    opaque,
                    0,
                    &[],
                    b"",
                    b"Auth failure",
                );
            } else if auth.is_some_and(|auth| auth.continue_steps > 0) {
                session.steps_remaining = auth.map(|auth| auth.continue_steps);
                write_response(
                    out,
                    opcode,
                    Status::AuthContinue,
                    opaque,
                    0,
                    &[],
                    b"",
                    b"challenge",
                );
            } else {
                session.authed = true;
                write_response(
                    out,
                    opcode,
                    Status::NoError,
                    opaque,
                    0,
                    &[],
                    b"",
                    b"Authenticated",
                );
            }
        }

        Opcode::SaslStep => match session.steps_remaining.take() {
            // A step with no handshake in progress is a refusal.
            None => {
                write_response(
                    out,
                    opcode,
                    Status::AuthRequired,
                    opaque,
                    0,
                    &[],
                    b"",
                    b"Auth failure",
                );
            }
            Some(remaining) if remaining <= 1 => {
                session.authed = true;
                write_response(
                    out,
                    opcode,
                    Status::NoError,
                    opaque,
                    0,
                    &[],
                    b"",
                    b"Authenticated",
                );
            }
            Some(remaining) => {
                session.steps_remaining = Some(remaining - 1);
                write_response(
                    out,
                    opcode,
                    Status::AuthContinue,
                    opaque,
                    0,
                    &[],
                    b"",
                    b"challenge",
                );
            }
        },
    }
    true
}
