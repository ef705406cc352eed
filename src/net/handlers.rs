//! One handler per opcode. Handlers run on a command worker with exclusive
//! access to the keyspace and session table for the duration of a command.

use super::cluster::parse_host_port;
use super::codec::Opcode;
use super::message::{Request, Response, Tuple};
use super::server::{ServerContext, State};
use crate::types::{now, DEFAULT_DB, NO_TTL};
use tracing::debug;

/// What the I/O side should do once the handler is done.
#[derive(Debug)]
pub enum Outcome {
    /// Write this response and rearm the connection for the next request.
    Reply(Response),
    /// Drop the client without a reply (QUIT).
    Drop,
}

/// Execute one request against the store. Takes the store lock for the
/// duration of the command; per-connection ordering is provided by the
/// caller, which never submits two commands for one session concurrently.
pub async fn dispatch(ctx: &ServerContext, session_id: u128, request: Request) -> Outcome {
    let at = now();
    match request {
        Request::Put {
            prefix,
            ttl,
            key,
            value,
        } => {
            let ttl = normalize_ttl(ttl);
            let mut state = ctx.state.lock().await;
            let db = current_db(&mut state, session_id, at);
            if prefix {
                state.keyspace.set_prefix(&db, &key, &value, ttl);
            } else {
                state.keyspace.put(&db, &key, value, ttl);
            }
            Outcome::Reply(Response::ok())
        }

        Request::Get { prefix, key } => {
            let mut state = ctx.state.lock().await;
            let db = current_db(&mut state, session_id, at);
            if prefix {
                let found = state.keyspace.get_prefix(&db, &key, at);
                if found.is_empty() {
                    return Outcome::Reply(Response::nok());
                }
                Outcome::Reply(Response::Many {
                    opcode: Opcode::Get,
                    tuples: to_tuples(found),
                })
            } else {
                match state.keyspace.get(&db, &key, at) {
                    Some((ttl, value)) => Outcome::Reply(Response::Single {
                        opcode: Opcode::Get,
                        tuple: Tuple { ttl, key, value },
                    }),
                    None => Outcome::Reply(Response::nok()),
                }
            }
        }

        Request::Del { prefix, key } => {
            let mut state = ctx.state.lock().await;
            let db = current_db(&mut state, session_id, at);
            let removed = if prefix {
                state.keyspace.delete_prefix(&db, &key) > 0
            } else {
                state.keyspace.delete(&db, &key)
            };
            Outcome::Reply(ack(removed))
        }

        Request::Ttl { ttl, key } => {
            let ttl = normalize_ttl(ttl);
            let mut state = ctx.state.lock().await;
            let db = current_db(&mut state, session_id, at);
            Outcome::Reply(ack(state.keyspace.set_ttl(&db, &key, ttl, at)))
        }

        Request::Inc { prefix, key } => shift(ctx, session_id, prefix, key, 1, at).await,
        Request::Dec { prefix, key } => shift(ctx, session_id, prefix, key, -1, at).await,

        Request::Count { prefix, key } => {
            let mut state = ctx.state.lock().await;
            let db = current_db(&mut state, session_id, at);
            let count = if prefix {
                state.keyspace.count_prefix(&db, &key, at)
            } else {
                state.keyspace.db_size(&db)
            };
            Outcome::Reply(Response::Count(count as u64))
        }

        Request::Use { name } => {
            if name.is_empty() {
                return Outcome::Reply(Response::nok());
            }
            let name = String::from_utf8_lossy(&name).into_owned();
            let mut state = ctx.state.lock().await;
            state.keyspace.ensure_db(&name);
            match state.sessions.get_mut(session_id) {
                Some(session) => {
                    session.last_action = at;
                    session.db = name;
                    Outcome::Reply(Response::ok())
                }
                None => Outcome::Reply(Response::nok()),
            }
        }

        Request::Keys { prefix } => {
            let mut state = ctx.state.lock().await;
            let db = current_db(&mut state, session_id, at);
            let listed = state.keyspace.keys(&db, &prefix, at);
            Outcome::Reply(Response::Many {
                opcode: Opcode::Keys,
                tuples: to_tuples(listed),
            })
        }

        Request::Ping => {
            let mut state = ctx.state.lock().await;
            current_db(&mut state, session_id, at);
            Outcome::Reply(Response::ok())
        }

        Request::Quit => {
            debug!("client requested quit");
            Outcome::Drop
        }

        Request::DbName => {
            let mut state = ctx.state.lock().await;
            let db = current_db(&mut state, session_id, at);
            Outcome::Reply(Response::Single {
                opcode: Opcode::Db,
                tuple: Tuple {
                    ttl: NO_TTL,
                    key: db.into_bytes(),
                    value: Vec::new(),
                },
            })
        }

        Request::Info => {
            let state = ctx.state.lock().await;
            let keys = state.keyspace.total_keys();
            drop(state);
            Outcome::Reply(Response::Single {
                opcode: Opcode::Info,
                tuple: Tuple {
                    ttl: NO_TTL,
                    key: b"info".to_vec(),
                    value: ctx.stats.render_info(keys).into_bytes(),
                },
            })
        }

        Request::Flush => {
            let mut state = ctx.state.lock().await;
            let db = current_db(&mut state, session_id, at);
            state.keyspace.flush(&db);
            Outcome::Reply(Response::ok())
        }

        Request::Join { addr } => {
            let Some(cluster) = &ctx.cluster else {
                return Outcome::Reply(Response::nok());
            };
            match parse_host_port(&addr) {
                Some((host, port)) => {
                    cluster.add_member(&host, port).await;
                    Outcome::Reply(Response::Members(cluster.member_list().await))
                }
                None => Outcome::Reply(Response::nok()),
            }
        }

        Request::Noop => Outcome::Reply(Response::nok()),
    }
}

async fn shift(
    ctx: &ServerContext,
    session_id: u128,
    prefix: bool,
    key: Vec<u8>,
    delta: i64,
    at: u64,
) -> Outcome {
    let mut state = ctx.state.lock().await;
    let db = current_db(&mut state, session_id, at);
    let shifted = if prefix {
        state.keyspace.shift_prefix(&db, &key, delta, at) > 0
    } else {
        state.keyspace.shift(&db, &key, delta, at)
    };
    Outcome::Reply(ack(shifted))
}

fn ack(ok: bool) -> Response {
    if ok {
        Response::ok()
    } else {
        Response::nok()
    }
}

fn to_tuples(found: Vec<(i32, Vec<u8>, Vec<u8>)>) -> Vec<Tuple> {
    found
        .into_iter()
        .map(|(ttl, key, value)| Tuple { ttl, key, value })
        .collect()
}

/// Currently selected database of a session, touching its activity stamp.
/// Falls back to the default database when the session is already gone.
fn current_db(state: &mut State, session_id: u128, at: u64) -> String {
    match state.sessions.get_mut(session_id) {
        Some(session) => {
            session.last_action = at;
            session.db.clone()
        }
        None => DEFAULT_DB.to_string(),
    }
}

/// Wire TTLs at or below zero mean "no expiration".
fn normalize_ttl(ttl: i32) -> i32 {
    if ttl <= 0 {
        NO_TTL
    } else {
        ttl
    }
}
