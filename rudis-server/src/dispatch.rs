//! # Command Dispatch
//!
//! Purpose: Route one tokenized command line to its handler, enforce the
//! read-only rule on slaves, feed successful writes to the append-log, and
//! convert every error into a wire reply without closing the connection.

use std::sync::Arc;

use rudis_common::{Config, RudisError, RudisResult};
use rudis_engine::DbManager;

use crate::commands::{hashes, keyspace, lists, server_info, sets, strings, zsets};
use crate::replication::ReplicationState;
use crate::resp;
use crate::stats::ServerStats;

/// Shared state every connection handler dispatches against.
pub struct ServerContext {
    pub config: Config,
    pub manager: Arc<DbManager>,
    pub stats: Arc<ServerStats>,
    pub replication: Arc<ReplicationState>,
    pub cluster: parking_lot::RwLock<Option<Arc<crate::cluster::ClusterService>>>,
}

impl ServerContext {
    pub fn new(config: Config, manager: Arc<DbManager>) -> Self {
        let replication = Arc::new(ReplicationState::from_config(&config));
        ServerContext {
            config,
            manager,
            stats: Arc::new(ServerStats::new()),
            replication,
            cluster: parking_lot::RwLock::new(None),
        }
    }
}

/// Per-connection state: only the selected shard index.
#[derive(Debug, Default)]
pub struct ConnState {
    pub shard: usize,
}

/// Commands that mutate the keyspace; rejected on slaves and journaled in
/// append-log mode.
fn is_write_command(command: &str) -> bool {
    matches!(
        command,
        "SET" | "GETSET"
            | "INCR"
            | "INCRBY"
            | "DECR"
            | "DECRBY"
            | "DEL"
            | "EXPIRE"
            | "PEXPIRE"
            | "PERSIST"
            | "FLUSHDB"
            | "LPUSH"
            | "RPUSH"
            | "LPOP"
            | "RPOP"
            | "LSET"
            | "LREM"
            | "SADD"
            | "SREM"
            | "SPOP"
            | "HSET"
            | "HMSET"
            | "HSETNX"
            | "HDEL"
            | "HINCRBY"
            | "ZADD"
            | "ZINCRBY"
            | "ZREM"
    )
}

/// Executes one tokenized command and returns the reply frame.
///
/// The tokens still carry their outer quotes; they are stripped here so the
/// handlers see the literal argument bytes.
pub fn dispatch(ctx: &ServerContext, conn: &mut ConnState, tokens: &[Vec<u8>]) -> Vec<u8> {
    ctx.stats.command_dispatched();

    let args: Vec<Vec<u8>> = tokens.iter().map(|t| resp::unquote(t).to_vec()).collect();
    let Some(first) = args.first() else {
        ctx.stats.error_replied();
        return resp::error("ERR empty command");
    };
    let command = String::from_utf8_lossy(first).to_ascii_uppercase();

    match execute(ctx, conn, &command, &args) {
        Ok(reply) => reply,
        Err(err) => {
            ctx.stats.error_replied();
            if err.is_internal() {
                tracing::error!(command = %command, error = %err, "command failed internally");
            }
            resp::error(&err.wire_message())
        }
    }
}

fn execute(
    ctx: &ServerContext,
    conn: &mut ConnState,
    command: &str,
    args: &[Vec<u8>],
) -> RudisResult<Vec<u8>> {
    if is_write_command(command) && ctx.replication.is_slave() {
        return Err(RudisError::ReadOnlySlave);
    }

    let reply = match command {
        // Connection-scoped commands.
        "SELECT" => return select(ctx, conn, args),
        "PING" => return server_info::ping(args),
        "ECHO" => return server_info::echo(args),
        "INFO" => return server_info::info(ctx),
        "READONLY" => return server_info::readonly(args),
        "ROLE" => return server_info::role(ctx),
        "SLAVEOF" => return server_info::slaveof(ctx, args),
        "FAILOVER" => return server_info::failover(ctx, args),
        _ => {
            let shard = ctx.manager.shard(conn.shard)?;
            match command {
                // Keyspace.
                "DEL" => keyspace::del(shard, args),
                "EXISTS" => keyspace::exists(shard, args),
                "TYPE" => keyspace::type_of(shard, args),
                "EXPIRE" => keyspace::expire(shard, args),
                "PEXPIRE" => keyspace::pexpire(shard, args),
                "TTL" => keyspace::ttl(shard, args),
                "PTTL" => keyspace::pttl(shard, args),
                "PERSIST" => keyspace::persist(shard, args),
                "KEYS" => keyspace::keys(shard, args),
                "FLUSHDB" => keyspace::flushdb(shard, args),

                // Strings.
                "SET" => strings::set(shard, args),
                "GET" => strings::get(shard, args),
                "GETSET" => strings::getset(shard, args),
                "INCR" => strings::incr(shard, args),
                "INCRBY" => strings::incrby(shard, args),
                "DECR" => strings::decr(shard, args),
                "DECRBY" => strings::decrby(shard, args),

                // Lists.
                "LPUSH" => lists::lpush(shard, args),
                "RPUSH" => lists::rpush(shard, args),
                "LPOP" => lists::lpop(shard, args),
                "RPOP" => lists::rpop(shard, args),
                "LLEN" => lists::llen(shard, args),
                "LRANGE" => lists::lrange(shard, args),
                "LINDEX" => lists::lindex(shard, args),
                "LSET" => lists::lset(shard, args),
                "LREM" => lists::lrem(shard, args),

                // Sets.
                "SADD" => sets::sadd(shard, args),
                "SREM" => sets::srem(shard, args),
                "SMEMBERS" => sets::smembers(shard, args),
                "SISMEMBER" => sets::sismember(shard, args),
                "SCARD" => sets::scard(shard, args),
                "SPOP" => sets::spop(shard, args),
                "SRANDMEMBER" => sets::srandmember(shard, args),
                "SINTER" => sets::sinter(shard, args),
                "SUNION" => sets::sunion(shard, args),
                "SDIFF" => sets::sdiff(shard, args),

                // Hashes.
                "HSET" => hashes::hset(shard, args),
                "HGET" => hashes::hget(shard, args),
                "HDEL" => hashes::hdel(shard, args),
                "HEXISTS" => hashes::hexists(shard, args),
                "HGETALL" => hashes::hgetall(shard, args),
                "HKEYS" => hashes::hkeys(shard, args),
                "HVALS" => hashes::hvals(shard, args),
                "HLEN" => hashes::hlen(shard, args),
                "HMGET" => hashes::hmget(shard, args),
                "HMSET" => hashes::hmset(shard, args),
                "HSETNX" => hashes::hsetnx(shard, args),
                "HINCRBY" => hashes::hincrby(shard, args),

                // Sorted sets.
                "ZADD" => zsets::zadd(shard, args),
                "ZCARD" => zsets::zcard(shard, args),
                "ZCOUNT" => zsets::zcount(shard, args),
                "ZINCRBY" => zsets::zincrby(shard, args),
                "ZRANGE" => zsets::zrange(shard, args),
                "ZREVRANGE" => zsets::zrevrange(shard, args),
                "ZRANK" => zsets::zrank(shard, args),
                "ZREVRANK" => zsets::zrevrank(shard, args),
                "ZREM" => zsets::zrem(shard, args),
                "ZSCORE" => zsets::zscore(shard, args),

                other => Err(RudisError::UnknownCommand(other.to_string())),
            }
        }
    }?;

    if is_write_command(command) {
        if let Some(log) = ctx.manager.append_log() {
            let parts: Vec<&[u8]> = args.iter().map(|a| a.as_slice()).collect();
            log.append(conn.shard, &parts);
        }
    }
    Ok(reply)
}

fn select(ctx: &ServerContext, conn: &mut ConnState, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    if args.len() != 2 {
        return Err(RudisError::WrongArity("SELECT".to_string()));
    }
    let index: usize = std::str::from_utf8(&args[1])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(RudisError::UnknownShard)?;
    if index >= ctx.manager.database_count() {
        return Err(RudisError::UnknownShard);
    }
    conn.shard = index;
    Ok(resp::simple("OK"))
}
