//! Connection, introspection, and topology commands.

use rudis_common::{RudisError, RudisResult};

use crate::dispatch::ServerContext;
use crate::resp;

pub fn ping(args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    match args.len() {
        1 => Ok(resp::simple("PONG")),
        2 => Ok(resp::bulk(&args[1])),
        _ => Err(RudisError::WrongArity("PING".to_string())),
    }
}

pub fn echo(args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    if args.len() != 2 {
        return Err(RudisError::WrongArity("ECHO".to_string()));
    }
    Ok(resp::bulk(&args[1]))
}

/// `READONLY` is accepted for wire compatibility; slaves already reject
/// writes unconditionally at dispatch.
pub fn readonly(args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    if args.len() != 1 {
        return Err(RudisError::WrongArity("READONLY".to_string()));
    }
    Ok(resp::simple("OK"))
}

pub fn role(ctx: &ServerContext) -> RudisResult<Vec<u8>> {
    let items: Vec<Vec<u8>> = match ctx.replication.master() {
        Some(link) => vec![
            b"slave".to_vec(),
            link.host.into_bytes(),
            link.port.to_string().into_bytes(),
        ],
        None => vec![b"master".to_vec()],
    };
    Ok(resp::array(items))
}

pub fn slaveof(ctx: &ServerContext, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    if args.len() != 3 {
        return Err(RudisError::WrongArity("SLAVEOF".to_string()));
    }
    if args[1].eq_ignore_ascii_case(b"NO") && args[2].eq_ignore_ascii_case(b"ONE") {
        ctx.replication.promote_to_master();
        return Ok(resp::simple("OK"));
    }

    let host = String::from_utf8_lossy(&args[1]).into_owned();
    let port: u16 = std::str::from_utf8(&args[2])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(RudisError::NotAnInteger)?;
    ctx.replication.set_master(host, port, None);
    Ok(resp::simple("OK"))
}

/// Operator-triggered failover; only meaningful in cluster mode.
pub fn failover(ctx: &ServerContext, args: &[Vec<u8>]) -> RudisResult<Vec<u8>> {
    if args.len() > 2 {
        return Err(RudisError::WrongArity("FAILOVER".to_string()));
    }
    let cluster = ctx
        .cluster
        .read()
        .clone()
        .ok_or(RudisError::ClusterDisabled)?;
    let preferred = args
        .get(1)
        .map(|id| String::from_utf8_lossy(id).into_owned());

    tokio::spawn(async move {
        if let Err(err) = cluster.initiate_failover(preferred).await {
            tracing::error!(error = %err, "operator failover failed");
        }
    });
    Ok(resp::simple("OK"))
}

pub fn info(ctx: &ServerContext) -> RudisResult<Vec<u8>> {
    let stats = ctx.stats.snapshot();
    let mut out = String::new();

    out.push_str("# Server\r\n");
    out.push_str(&format!("version:{}\r\n", env!("CARGO_PKG_VERSION")));
    out.push_str(&format!("node_id:{}\r\n", ctx.config.node_id));
    out.push_str(&format!("tcp_port:{}\r\n", ctx.config.port));

    // Role comes from the replication state, never from the cluster flag.
    out.push_str("\r\n# Replication\r\n");
    out.push_str(&format!("role:{}\r\n", ctx.replication.role().as_str()));
    if let Some(link) = ctx.replication.master() {
        out.push_str(&format!("master_host:{}\r\n", link.host));
        out.push_str(&format!("master_port:{}\r\n", link.port));
    }
    out.push_str(&format!("cluster_enabled:{}\r\n", u8::from(ctx.config.cluster_enabled)));

    out.push_str("\r\n# Clients\r\n");
    out.push_str(&format!("connected_clients:{}\r\n", stats.connections_open));

    out.push_str("\r\n# Stats\r\n");
    out.push_str(&format!("total_connections_received:{}\r\n", stats.connections_total));
    out.push_str(&format!("total_commands_processed:{}\r\n", stats.commands_total));
    out.push_str(&format!("total_errors:{}\r\n", stats.errors_total));

    out.push_str("\r\n# Keyspace\r\n");
    for shard in ctx.manager.shards() {
        let keys = shard.len();
        if keys > 0 {
            out.push_str(&format!("db{}:keys={}\r\n", shard.index(), keys));
        }
    }

    Ok(resp::bulk(out.as_bytes()))
}
