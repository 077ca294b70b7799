//! End-to-end command scenarios exercised at the dispatch layer, asserting
//! the literal reply frames a wire client would observe.

use std::sync::Arc;
use std::time::Duration;

use rudis_common::{Config, NodeRole};
use rudis_engine::DbManager;
use rudis_server::dispatch::{dispatch, ConnState, ServerContext};
use rudis_server::resp::tokenize;

struct Harness {
    ctx: ServerContext,
    conn: ConnState,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(mut config: Config) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        config.data_dir = dir.path().to_path_buf();
        let manager = DbManager::new(config.clone()).expect("manager");
        Harness {
            ctx: ServerContext::new(config, manager),
            conn: ConnState::default(),
            _dir: dir,
        }
    }

    fn run(&mut self, line: &str) -> Vec<u8> {
        let tokens = tokenize(line.as_bytes()).expect("tokenize");
        dispatch(&self.ctx, &mut self.conn, &tokens)
    }

    fn run_str(&mut self, line: &str) -> String {
        String::from_utf8_lossy(&self.run(line)).into_owned()
    }
}

#[test]
fn s1_string_basics() {
    let mut h = Harness::new();
    assert_eq!(h.run("SET foo bar"), b"+OK\r\n");
    assert_eq!(h.run("GET foo"), b"$3\r\nbar\r\n");
    assert_eq!(h.run("GET missing"), b"$-1\r\n");
    assert_eq!(h.run("TYPE foo"), b"+string\r\n");
}

#[test]
fn s2_list_push_and_ranges() {
    let mut h = Harness::new();
    assert_eq!(h.run("LPUSH nums a b c"), b":3\r\n");
    assert_eq!(
        h.run("LRANGE nums 0 -1"),
        b"*3\r\n$1\r\nc\r\n$1\r\nb\r\n$1\r\na\r\n"
    );
    assert_eq!(h.run("LINDEX nums -1"), b"$1\r\na\r\n");
}

#[test]
fn s3_set_membership() {
    let mut h = Harness::new();
    assert_eq!(h.run("SADD s x y z"), b":3\r\n");
    assert_eq!(h.run("SADD s x"), b":0\r\n");
    assert_eq!(
        h.run("SMEMBERS s"),
        b"*3\r\n$1\r\nx\r\n$1\r\ny\r\n$1\r\nz\r\n"
    );
    assert_eq!(h.run("SINTER s t"), b"*0\r\n");
}

#[test]
fn s4_sorted_set_order_and_ranks() {
    let mut h = Harness::new();
    assert_eq!(h.run("ZADD z 1 a 2 b 2 c"), b":3\r\n");
    assert_eq!(
        h.run("ZRANGE z 0 -1 WITHSCORES"),
        b"*6\r\n$1\r\na\r\n$3\r\n1.0\r\n$1\r\nb\r\n$3\r\n2.0\r\n$1\r\nc\r\n$3\r\n2.0\r\n"
    );
    assert_eq!(h.run("ZRANK z b"), b":1\r\n");
    assert_eq!(h.run("ZREVRANK z b"), b":1\r\n");
}

#[test]
fn s5_counter_commands() {
    let mut h = Harness::new();
    assert_eq!(h.run("SET n 10"), b"+OK\r\n");
    assert_eq!(h.run("INCR n"), b":11\r\n");
    assert_eq!(h.run("INCRBY n 5"), b":16\r\n");
    assert_eq!(h.run("DECRBY n 6"), b":10\r\n");
    assert_eq!(h.run("DECR n"), b":9\r\n");

    assert_eq!(h.run("SET n notanint"), b"+OK\r\n");
    let reply = h.run_str("INCR n");
    assert_eq!(reply, "-ERR value is not an integer or out of range\r\n");
    // The failed increment left the payload untouched.
    assert_eq!(h.run("GET n"), b"$8\r\nnotanint\r\n");
}

#[test]
fn s6_expiration_end_to_end() {
    let mut h = Harness::new();
    assert_eq!(h.run("SET k v"), b"+OK\r\n");
    assert_eq!(h.run("EXPIRE k 1"), b"+OK\r\n");
    std::thread::sleep(Duration::from_millis(1200));
    assert_eq!(h.run("GET k"), b"$-1\r\n");
    assert_eq!(h.run("TTL k"), b":-2\r\n");
}

#[test]
fn s7_snapshot_roundtrip_preserves_every_variant() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    };

    {
        let manager = DbManager::new(config.clone()).expect("manager");
        let ctx = ServerContext::new(config.clone(), Arc::clone(&manager));
        let mut conn = ConnState::default();
        let mut run = |line: &str| {
            let tokens = tokenize(line.as_bytes()).expect("tokenize");
            dispatch(&ctx, &mut conn, &tokens)
        };
        run("SET str hello");
        run("RPUSH lst one two");
        run("SADD st a b");
        run("HSET hsh f1 v1 f2 v2");
        run("ZADD zst 1 a 2 b 2 c");
        manager.save().expect("save");
    }

    // A fresh manager over the same directory restores identical state.
    let mut h = Harness::with_config(config);
    assert_eq!(h.run("TYPE str"), b"+string\r\n");
    assert_eq!(h.run("GET str"), b"$5\r\nhello\r\n");
    assert_eq!(h.run("TYPE lst"), b"+list\r\n");
    assert_eq!(h.run("LRANGE lst 0 -1"), b"*2\r\n$3\r\none\r\n$3\r\ntwo\r\n");
    assert_eq!(h.run("TYPE st"), b"+set\r\n");
    assert_eq!(h.run("SMEMBERS st"), b"*2\r\n$1\r\na\r\n$1\r\nb\r\n");
    assert_eq!(h.run("TYPE hsh"), b"+hash\r\n");
    assert_eq!(h.run("HGET hsh f2"), b"$2\r\nv2\r\n");
    assert_eq!(h.run("TYPE zst"), b"+zset\r\n");
    assert_eq!(
        h.run("ZRANGE zst 0 -1 WITHSCORES"),
        b"*6\r\n$1\r\na\r\n$3\r\n1.0\r\n$1\r\nb\r\n$3\r\n2.0\r\n$1\r\nc\r\n$3\r\n2.0\r\n"
    );
}

#[test]
fn wrongtype_rejections_leave_values_unchanged() {
    let mut h = Harness::new();
    h.run("SET plain value");
    let reply = h.run_str("LPUSH plain x");
    assert_eq!(
        reply,
        "-WRONGTYPE Operation against a key holding the wrong kind of value\r\n"
    );
    assert_eq!(h.run("GET plain"), b"$5\r\nvalue\r\n");

    h.run("SADD members x");
    let reply = h.run_str("INCR members");
    assert!(reply.starts_with("-WRONGTYPE"));
    assert_eq!(h.run("SMEMBERS members"), b"*1\r\n$1\r\nx\r\n");
}

#[test]
fn multi_key_del_and_exists_count_individually() {
    let mut h = Harness::new();
    h.run("SET a 1");
    h.run("SET b 2");
    assert_eq!(h.run("EXISTS a b missing"), b":2\r\n");
    assert_eq!(h.run("DEL a b missing"), b":2\r\n");
    assert_eq!(h.run("EXISTS a b missing"), b":0\r\n");
}

#[test]
fn ttl_codes_and_persist() {
    let mut h = Harness::new();
    h.run("SET k v");
    assert_eq!(h.run("TTL k"), b":-1\r\n");
    assert_eq!(h.run("TTL missing"), b":-2\r\n");

    h.run("EXPIRE k 100");
    let reply = h.run_str("TTL k");
    let secs: i64 = reply[1..reply.len() - 2].parse().expect("integer");
    assert!(secs > 0 && secs <= 100);

    assert_eq!(h.run("PERSIST k"), b":1\r\n");
    assert_eq!(h.run("TTL k"), b":-1\r\n");
    assert_eq!(h.run("PERSIST k"), b":0\r\n");
}

#[test]
fn select_switches_shards() {
    let mut h = Harness::new();
    h.run("SET only-in-0 v");
    assert_eq!(h.run("SELECT 1"), b"+OK\r\n");
    assert_eq!(h.run("GET only-in-0"), b"$-1\r\n");
    h.run("SET only-in-1 w");
    assert_eq!(h.run("SELECT 0"), b"+OK\r\n");
    assert_eq!(h.run("GET only-in-0"), b"$5\r\nv\r\n");
    assert_eq!(h.run("EXISTS only-in-1"), b":0\r\n");

    let reply = h.run_str("SELECT 99");
    assert_eq!(reply, "-ERR DB index is out of range\r\n");
}

#[test]
fn quoted_arguments_survive_tokenization() {
    let mut h = Harness::new();
    assert_eq!(h.run("SET greeting \"hello world\""), b"+OK\r\n");
    assert_eq!(h.run("GET greeting"), b"$11\r\nhello world\r\n");

    assert_eq!(h.run("ECHO 'a b'"), b"$3\r\na b\r\n");
}

#[test]
fn keys_pattern_matching() {
    let mut h = Harness::new();
    h.run("SET user:1 a");
    h.run("SET user:2 b");
    h.run("SET session:1 c");
    assert_eq!(
        h.run("KEYS user:*"),
        b"*2\r\n$6\r\nuser:1\r\n$6\r\nuser:2\r\n"
    );
    assert_eq!(h.run("KEYS user:?"), b"*2\r\n$6\r\nuser:1\r\n$6\r\nuser:2\r\n");
    assert_eq!(h.run("KEYS nothing*"), b"*0\r\n");
}

#[test]
fn unknown_command_and_arity_errors() {
    let mut h = Harness::new();
    let reply = h.run_str("NOSUCHCOMMAND a b");
    assert_eq!(reply, "-ERR unknown command 'NOSUCHCOMMAND'\r\n");

    let reply = h.run_str("GET");
    assert_eq!(reply, "-ERR wrong number of arguments for 'GET' command\r\n");

    let reply = h.run_str("LSET missing 0 v");
    assert_eq!(reply, "-ERR no such key\r\n");
}

#[test]
fn hash_commands_cover_field_operations() {
    let mut h = Harness::new();
    assert_eq!(h.run("HSET h f1 v1 f2 v2"), b":2\r\n");
    assert_eq!(h.run("HSET h f1 v1b"), b":0\r\n");
    assert_eq!(h.run("HGET h f1"), b"$3\r\nv1b\r\n");
    assert_eq!(h.run("HLEN h"), b":2\r\n");
    assert_eq!(h.run("HEXISTS h f2"), b":1\r\n");
    assert_eq!(h.run("HMGET h f1 missing f2"), b"*3\r\n$3\r\nv1b\r\n$-1\r\n$2\r\nv2\r\n");
    assert_eq!(h.run("HSETNX h f1 ignored"), b":0\r\n");
    assert_eq!(h.run("HSETNX h f3 v3"), b":1\r\n");
    assert_eq!(h.run("HINCRBY h counter 5"), b":5\r\n");
    assert_eq!(h.run("HINCRBY h counter -2"), b":3\r\n");
    assert_eq!(h.run("HDEL h f1 f2 f3 counter"), b":4\r\n");
    // Dropping the last field removes the key itself.
    assert_eq!(h.run("EXISTS h"), b":0\r\n");
}

#[test]
fn writes_are_rejected_on_a_slave() {
    let mut h = Harness::with_config(Config {
        node_role: NodeRole::Slave,
        ..Config::default()
    });
    let reply = h.run_str("SET k v");
    assert_eq!(reply, "-READONLY You can't write against a read only replica\r\n");
    // Reads still work.
    assert_eq!(h.run("GET k"), b"$-1\r\n");
    // And READONLY stays a cheap no-op.
    assert_eq!(h.run("READONLY"), b"+OK\r\n");
}

#[test]
fn info_reports_configured_role() {
    let mut h = Harness::with_config(Config {
        cluster_enabled: true,
        node_role: NodeRole::Master,
        ..Config::default()
    });
    let info = h.run_str("INFO");
    // Role must derive from the node role, not the cluster flag.
    assert!(info.contains("role:master"), "info was: {info}");
    assert!(info.contains("cluster_enabled:1"), "info was: {info}");
}

#[test]
fn role_and_slaveof_transitions() {
    let mut h = Harness::new();
    assert_eq!(h.run("ROLE"), b"*1\r\n$6\r\nmaster\r\n");

    assert_eq!(h.run("SLAVEOF 127.0.0.1 7001"), b"+OK\r\n");
    assert_eq!(
        h.run("ROLE"),
        b"*3\r\n$5\r\nslave\r\n$9\r\n127.0.0.1\r\n$4\r\n7001\r\n"
    );
    // Now a slave: writes bounce.
    let reply = h.run_str("SET k v");
    assert!(reply.starts_with("-READONLY"));

    assert_eq!(h.run("SLAVEOF NO ONE"), b"+OK\r\n");
    assert_eq!(h.run("SET k v"), b"+OK\r\n");
}

#[test]
fn failover_requires_cluster_mode() {
    let mut h = Harness::new();
    let reply = h.run_str("FAILOVER");
    assert_eq!(reply, "-ERR This instance has cluster support disabled\r\n");
}

#[test]
fn spop_and_srandmember_sampling() {
    let mut h = Harness::new();
    h.run("SADD s a b c d e");

    // Distinct draws, never more than the set holds.
    let reply = h.run("SRANDMEMBER s 3");
    assert!(reply.starts_with(b"*3\r\n"));
    let reply = h.run("SRANDMEMBER s 100");
    assert!(reply.starts_with(b"*5\r\n"));
    // Negative count samples with replacement, exactly |n| draws.
    let reply = h.run("SRANDMEMBER s -7");
    assert!(reply.starts_with(b"*7\r\n"));
    // Sampling never removed anything.
    assert_eq!(h.run("SCARD s"), b":5\r\n");

    let reply = h.run("SPOP s 2");
    assert!(reply.starts_with(b"*2\r\n"));
    assert_eq!(h.run("SCARD s"), b":3\r\n");

    h.run("SPOP s 10");
    assert_eq!(h.run("EXISTS s"), b":0\r\n");
    assert_eq!(h.run("SPOP s"), b"$-1\r\n");
}

#[test]
fn list_edit_commands() {
    let mut h = Harness::new();
    h.run("RPUSH l a b a c a");
    assert_eq!(h.run("LLEN l"), b":5\r\n");
    assert_eq!(h.run("LREM l 2 a"), b":2\r\n");
    assert_eq!(h.run("LRANGE l 0 -1"), b"*3\r\n$1\r\nb\r\n$1\r\nc\r\n$1\r\na\r\n");
    assert_eq!(h.run("LSET l 0 z"), b"+OK\r\n");
    assert_eq!(h.run("LINDEX l 0"), b"$1\r\nz\r\n");
    let reply = h.run_str("LSET l 9 x");
    assert_eq!(reply, "-ERR index out of range\r\n");

    assert_eq!(h.run("LPOP l"), b"$1\r\nz\r\n");
    assert_eq!(h.run("RPOP l"), b"$1\r\na\r\n");
    assert_eq!(h.run("RPOP l"), b"$1\r\nc\r\n");
    // Last pop drains the list and deletes the key.
    assert_eq!(h.run("EXISTS l"), b":0\r\n");
}

#[test]
fn zset_score_updates_and_ranges() {
    let mut h = Harness::new();
    h.run("ZADD z 1 a 2 b");
    assert_eq!(h.run("ZCARD z"), b":2\r\n");
    assert_eq!(h.run("ZSCORE z b"), b"$3\r\n2.0\r\n");
    assert_eq!(h.run("ZSCORE z missing"), b"$-1\r\n");

    // Re-adding with a new score moves the member, not the cardinality.
    assert_eq!(h.run("ZADD z 5 a"), b":0\r\n");
    assert_eq!(h.run("ZRANGE z 0 -1"), b"*2\r\n$1\r\nb\r\n$1\r\na\r\n");

    assert_eq!(h.run("ZINCRBY z 2.5 b"), b"$3\r\n4.5\r\n");
    assert_eq!(h.run("ZCOUNT z 4 6"), b":2\r\n");
    assert_eq!(h.run("ZREVRANGE z 0 0"), b"*1\r\n$1\r\na\r\n");

    assert_eq!(h.run("ZREM z a b"), b":2\r\n");
    assert_eq!(h.run("EXISTS z"), b":0\r\n");
}

#[test]
fn getset_and_flushdb() {
    let mut h = Harness::new();
    assert_eq!(h.run("GETSET k first"), b"$-1\r\n");
    assert_eq!(h.run("GETSET k second"), b"$5\r\nfirst\r\n");
    h.run("SADD s x");
    assert_eq!(h.run("FLUSHDB"), b"+OK\r\n");
    assert_eq!(h.run("EXISTS k s"), b":0\r\n");
}
