//! The static verb table and per-verb handlers.
//!
//! Grounded on this codebase's existing "static table of name/handler/bounds
//! rows, extend by adding a row" shape for dispatch. Handlers write their
//! reply directly into the connection's write buffer via the serializer
//! rather than returning an intermediate value.

use crate::{
	bytes::ByteString,
	clock,
	glob::glob_match,
	keyspace::{Keyspace, NO_EXPIRY},
	proto::{self, Value},
};

/// Maximum verb length for dispatch lookup; longer names are truncated and
/// necessarily miss the table (equivalent to "no such command").
const MAX_VERB_LEN: usize = 63;

type Handler = fn(&mut Keyspace, &[ByteString], &mut Vec<u8>);

struct CommandSpec {
	name: &'static str,
	handler: Handler,
	min_argc: usize,
	max_argc: Option<usize>,
}

static COMMANDS: &[CommandSpec] = &[
	CommandSpec { name: "PING", handler: cmd_ping, min_argc: 1, max_argc: Some(2) },
	CommandSpec { name: "ECHO", handler: cmd_echo, min_argc: 2, max_argc: Some(2) },
	CommandSpec { name: "SET", handler: cmd_set, min_argc: 3, max_argc: Some(5) },
	CommandSpec { name: "GET", handler: cmd_get, min_argc: 2, max_argc: Some(2) },
	CommandSpec { name: "DEL", handler: cmd_del, min_argc: 2, max_argc: None },
	CommandSpec { name: "EXISTS", handler: cmd_exists, min_argc: 2, max_argc: None },
	CommandSpec { name: "EXPIRE", handler: cmd_expire, min_argc: 3, max_argc: Some(3) },
	CommandSpec { name: "TTL", handler: cmd_ttl, min_argc: 2, max_argc: Some(2) },
	CommandSpec { name: "KEYS", handler: cmd_keys, min_argc: 2, max_argc: Some(2) },
	CommandSpec { name: "TYPE", handler: cmd_type, min_argc: 2, max_argc: Some(2) },
	CommandSpec { name: "INCR", handler: cmd_incr, min_argc: 2, max_argc: Some(2) },
	CommandSpec { name: "DECR", handler: cmd_decr, min_argc: 2, max_argc: Some(2) },
];

/// Dispatch one parsed request, appending the reply to `out`.
pub fn dispatch(keyspace: &mut Keyspace, request: &Value, out: &mut Vec<u8>) {
	let Value::Array(items) = request else {
		proto::write_error(out, "ERR invalid command format");
		return;
	};
	if items.is_empty() {
		proto::write_error(out, "ERR invalid command format");
		return;
	}

	let mut args = Vec::with_capacity(items.len());
	for item in items {
		match item {
			Value::BulkString(s) => args.push(s.clone()),
			_ => {
				proto::write_error(out, "ERR invalid command format");
				return;
			},
		}
	}

	let verb_len = args[0].len().min(MAX_VERB_LEN);
	let verb: String = args[0][..verb_len].iter().map(|b| b.to_ascii_uppercase() as char).collect();

	match COMMANDS.iter().find(|c| c.name == verb) {
		Some(spec) => {
			let argc = args.len();
			if argc < spec.min_argc || spec.max_argc.is_some_and(|max| argc > max) {
				proto::write_error(out, &format!("ERR wrong number of arguments for '{}' command", spec.name));
				return;
			}
			(spec.handler)(keyspace, &args, out);
		},
		None => proto::write_error(out, &format!("ERR unknown command '{verb}'")),
	}
}

fn parse_arg_i64(arg: &[u8]) -> Option<i64> {
	if arg.is_empty() {
		return None;
	}
	std::str::from_utf8(arg).ok()?.parse().ok()
}

fn cmd_ping(_ks: &mut Keyspace, args: &[ByteString], out: &mut Vec<u8>) {
	if args.len() == 1 {
		proto::write_simple_string(out, "PONG");
	} else {
		proto::write_bulk_string(out, &args[1]);
	}
}

fn cmd_echo(_ks: &mut Keyspace, args: &[ByteString], out: &mut Vec<u8>) {
	proto::write_bulk_string(out, &args[1]);
}

fn cmd_set(ks: &mut Keyspace, args: &[ByteString], out: &mut Vec<u8>) {
	let key = args[1].as_bytes();
	let value = args[2].clone();
	ks.set(key, value);

	if args.len() == 5 {
		let opt: String = args[3].iter().map(|b| b.to_ascii_uppercase() as char).collect();
		if opt != "EX" {
			ks.delete(key);
			proto::write_error(out, "ERR syntax error");
			return;
		}
		match parse_arg_i64(&args[4]) {
			Some(seconds) if seconds > 0 => {
				ks.set_expire(key, clock::now_ms() + seconds * 1000);
			},
			_ => {
				ks.delete(key);
				proto::write_error(out, "ERR invalid expire time in 'set' command");
				return;
			},
		}
	}

	proto::write_simple_string(out, "OK");
}

fn cmd_get(ks: &mut Keyspace, args: &[ByteString], out: &mut Vec<u8>) {
	match ks.get(&args[1]) {
		Some(value) => proto::write_bulk_string(out, value),
		None => proto::write_null_bulk(out),
	}
}

fn cmd_del(ks: &mut Keyspace, args: &[ByteString], out: &mut Vec<u8>) {
	let count = args[1..].iter().filter(|key| ks.delete(key)).count();
	proto::write_integer(out, count as i64);
}

fn cmd_exists(ks: &mut Keyspace, args: &[ByteString], out: &mut Vec<u8>) {
	let count = args[1..].iter().filter(|key| ks.exists(key)).count();
	proto::write_integer(out, count as i64);
}

fn cmd_expire(ks: &mut Keyspace, args: &[ByteString], out: &mut Vec<u8>) {
	let Some(seconds) = parse_arg_i64(&args[2]) else {
		proto::write_error(out, "ERR value is not an integer or out of range");
		return;
	};
	let key = args[1].as_bytes();
	if !ks.exists(key) {
		proto::write_integer(out, 0);
		return;
	}
	ks.set_expire(key, clock::now_ms() + seconds * 1000);
	proto::write_integer(out, 1);
}

fn cmd_ttl(ks: &mut Keyspace, args: &[ByteString], out: &mut Vec<u8>) {
	let key = args[1].as_bytes();
	if !ks.exists(key) {
		proto::write_integer(out, -2);
		return;
	}
	let expire_at = ks.get_expire(key);
	if expire_at == NO_EXPIRY {
		proto::write_integer(out, -1);
		return;
	}
	let remaining_ms = expire_at - clock::now_ms();
	if remaining_ms <= 0 {
		ks.delete(key);
		proto::write_integer(out, -2);
		return;
	}
	proto::write_integer(out, (remaining_ms + 999) / 1000);
}

fn cmd_keys(ks: &mut Keyspace, args: &[ByteString], out: &mut Vec<u8>) {
	let pattern = args[1].as_bytes();
	let matches: Vec<_> = ks.iter().filter(|(key, _)| glob_match(pattern, key)).collect();
	proto::write_array_header(out, matches.len());
	for (key, _) in matches {
		proto::write_bulk_string(out, &key);
	}
}

fn cmd_type(ks: &mut Keyspace, args: &[ByteString], out: &mut Vec<u8>) {
	if ks.exists(&args[1]) {
		proto::write_simple_string(out, "string");
	} else {
		proto::write_simple_string(out, "none");
	}
}

fn incr_by(ks: &mut Keyspace, key: &[u8], delta: i64, out: &mut Vec<u8>) {
	let expire_at = if ks.exists(key) { ks.get_expire(key) } else { NO_EXPIRY };

	let current = match ks.get(key) {
		Some(value) => match std::str::from_utf8(value).ok().and_then(|s| s.parse::<i64>().ok()) {
			Some(n) => n,
			None => {
				proto::write_error(out, "ERR value is not an integer or out of range");
				return;
			},
		},
		None => 0,
	};

	let Some(next) = current.checked_add(delta) else {
		proto::write_error(out, "ERR value is not an integer or out of range");
		return;
	};

	ks.set(key, ByteString::from(next.to_string().as_str()));
	if expire_at != NO_EXPIRY {
		ks.set_expire(key, expire_at);
	}
	proto::write_integer(out, next);
}

fn cmd_incr(ks: &mut Keyspace, args: &[ByteString], out: &mut Vec<u8>) {
	incr_by(ks, &args[1], 1, out);
}

fn cmd_decr(ks: &mut Keyspace, args: &[ByteString], out: &mut Vec<u8>) {
	incr_by(ks, &args[1], -1, out);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::proto::{parse, ParseResult};

	fn request(items: &[&str]) -> Value {
		Value::Array(items.iter().map(|s| Value::BulkString(ByteString::from(*s))).collect())
	}

	fn run(ks: &mut Keyspace, items: &[&str]) -> Vec<u8> {
		let mut out = Vec::new();
		dispatch(ks, &request(items), &mut out);
		out
	}

	fn parse_reply(bytes: &[u8]) -> Value {
		match parse(bytes) {
			ParseResult::Parsed(value, n) => {
				assert_eq!(n, bytes.len());
				value
			},
			other => panic!("expected a full reply, got {other:?}"),
		}
	}

	#[test]
	fn ping_without_args() {
		let mut ks = Keyspace::new();
		let out = run(&mut ks, &["PING"]);
		assert_eq!(parse_reply(&out), Value::SimpleString(ByteString::from("PONG")));
	}

	#[test]
	fn ping_echoes_its_argument() {
		let mut ks = Keyspace::new();
		let out = run(&mut ks, &["PING", "hello"]);
		assert_eq!(parse_reply(&out), Value::BulkString(ByteString::from("hello")));
	}

	#[test]
	fn set_then_get() {
		let mut ks = Keyspace::new();
		assert_eq!(parse_reply(&run(&mut ks, &["SET", "foo", "bar"])), Value::SimpleString(ByteString::from("OK")));
		assert_eq!(parse_reply(&run(&mut ks, &["GET", "foo"])), Value::BulkString(ByteString::from("bar")));
	}

	#[test]
	fn get_missing_key_is_null_bulk() {
		let mut ks = Keyspace::new();
		assert_eq!(parse_reply(&run(&mut ks, &["GET", "missing"])), Value::NullBulk);
	}

	#[test]
	fn set_with_valid_ex_applies_expiry() {
		let mut ks = Keyspace::new();
		run(&mut ks, &["SET", "key", "v", "EX", "100"]);
		assert!(ks.exists(b"key"));
		assert!(ks.get_expire(b"key") > crate::clock::now_ms());
	}

	#[test]
	fn set_with_non_positive_ex_deletes_key_and_errors() {
		let mut ks = Keyspace::new();
		let out = run(&mut ks, &["SET", "key", "v", "EX", "0"]);
		assert_eq!(
			parse_reply(&out),
			Value::Error(ByteString::from("ERR invalid expire time in 'set' command"))
		);
		assert!(!ks.exists(b"key"));
	}

	#[test]
	fn set_with_non_integer_ex_deletes_key_and_errors() {
		let mut ks = Keyspace::new();
		let out = run(&mut ks, &["SET", "key", "v", "EX", "abc"]);
		assert_eq!(
			parse_reply(&out),
			Value::Error(ByteString::from("ERR invalid expire time in 'set' command"))
		);
		assert!(!ks.exists(b"key"));
	}

	#[test]
	fn set_with_non_ex_fourth_token_deletes_key_and_errors() {
		let mut ks = Keyspace::new();
		let out = run(&mut ks, &["SET", "key", "v", "XX", "100"]);
		assert_eq!(parse_reply(&out), Value::Error(ByteString::from("ERR syntax error")));
		assert!(!ks.exists(b"key"));
	}

	#[test]
	fn del_counts_existing_keys() {
		let mut ks = Keyspace::new();
		run(&mut ks, &["SET", "a", "1"]);
		let out = run(&mut ks, &["DEL", "a", "b"]);
		assert_eq!(parse_reply(&out), Value::Integer(1));
	}

	#[test]
	fn exists_counts_duplicates() {
		let mut ks = Keyspace::new();
		run(&mut ks, &["SET", "a", "1"]);
		let out = run(&mut ks, &["EXISTS", "a", "a", "b"]);
		assert_eq!(parse_reply(&out), Value::Integer(2));
	}

	#[test]
	fn expire_on_missing_key_is_zero() {
		let mut ks = Keyspace::new();
		let out = run(&mut ks, &["EXPIRE", "nope", "10"]);
		assert_eq!(parse_reply(&out), Value::Integer(0));
	}

	#[test]
	fn expire_non_integer_seconds_errors() {
		let mut ks = Keyspace::new();
		run(&mut ks, &["SET", "a", "1"]);
		let out = run(&mut ks, &["EXPIRE", "a", "soon"]);
		assert_eq!(parse_reply(&out), Value::Error(ByteString::from("ERR value is not an integer or out of range")));
	}

	#[test]
	fn ttl_reports_absent_no_expiry_and_remaining() {
		let mut ks = Keyspace::new();
		assert_eq!(parse_reply(&run(&mut ks, &["TTL", "nope"])), Value::Integer(-2));
		run(&mut ks, &["SET", "a", "1"]);
		assert_eq!(parse_reply(&run(&mut ks, &["TTL", "a"])), Value::Integer(-1));
		run(&mut ks, &["EXPIRE", "a", "10"]);
		match parse_reply(&run(&mut ks, &["TTL", "a"])) {
			Value::Integer(n) => assert!((1..=10).contains(&n)),
			other => panic!("expected integer, got {other:?}"),
		}
	}

	#[test]
	fn keys_matches_glob_pattern() {
		let mut ks = Keyspace::new();
		run(&mut ks, &["SET", "user:100", "a"]);
		run(&mut ks, &["SET", "user:200", "b"]);
		run(&mut ks, &["SET", "item:1", "c"]);
		let out = run(&mut ks, &["KEYS", "user:*"]);
		match parse_reply(&out) {
			Value::Array(items) => {
				let mut keys: Vec<_> = items
					.into_iter()
					.map(|v| match v {
						Value::BulkString(s) => s,
						other => panic!("expected bulk string, got {other:?}"),
					})
					.collect();
				keys.sort();
				assert_eq!(keys, vec![ByteString::from("user:100"), ByteString::from("user:200")]);
			},
			other => panic!("expected array, got {other:?}"),
		}
	}

	#[test]
	fn type_reports_string_or_none() {
		let mut ks = Keyspace::new();
		run(&mut ks, &["SET", "a", "1"]);
		assert_eq!(parse_reply(&run(&mut ks, &["TYPE", "a"])), Value::SimpleString(ByteString::from("string")));
		assert_eq!(parse_reply(&run(&mut ks, &["TYPE", "nope"])), Value::SimpleString(ByteString::from("none")));
	}

	#[test]
	fn incr_on_missing_key_starts_at_zero() {
		let mut ks = Keyspace::new();
		assert_eq!(parse_reply(&run(&mut ks, &["INCR", "counter"])), Value::Integer(1));
	}

	#[test]
	fn incr_and_decr_round_trip_and_preserve_expiry() {
		let mut ks = Keyspace::new();
		run(&mut ks, &["SET", "a", "10"]);
		run(&mut ks, &["EXPIRE", "a", "100"]);
		assert_eq!(parse_reply(&run(&mut ks, &["INCR", "a"])), Value::Integer(11));
		assert!(ks.get_expire(b"a") != NO_EXPIRY);
		assert_eq!(parse_reply(&run(&mut ks, &["DECR", "a"])), Value::Integer(10));
	}

	#[test]
	fn incr_on_non_integer_value_errors() {
		let mut ks = Keyspace::new();
		run(&mut ks, &["SET", "a", "abc"]);
		let out = run(&mut ks, &["INCR", "a"]);
		assert_eq!(parse_reply(&out), Value::Error(ByteString::from("ERR value is not an integer or out of range")));
	}

	#[test]
	fn incr_overflow_errors() {
		let mut ks = Keyspace::new();
		run(&mut ks, &["SET", "a", &i64::MAX.to_string()]);
		let out = run(&mut ks, &["INCR", "a"]);
		assert_eq!(parse_reply(&out), Value::Error(ByteString::from("ERR value is not an integer or out of range")));
	}

	#[test]
	fn decr_underflow_errors() {
		let mut ks = Keyspace::new();
		run(&mut ks, &["SET", "a", &i64::MIN.to_string()]);
		let out = run(&mut ks, &["DECR", "a"]);
		assert_eq!(parse_reply(&out), Value::Error(ByteString::from("ERR value is not an integer or out of range")));
	}

	#[test]
	fn unknown_verb_errors() {
		let mut ks = Keyspace::new();
		let out = run(&mut ks, &["FROBNICATE", "a"]);
		assert_eq!(parse_reply(&out), Value::Error(ByteString::from("ERR unknown command 'FROBNICATE'")));
	}

	#[test]
	fn arity_mismatch_errors() {
		let mut ks = Keyspace::new();
		let out = run(&mut ks, &["GET"]);
		assert_eq!(
			parse_reply(&out),
			Value::Error(ByteString::from("ERR wrong number of arguments for 'GET' command"))
		);
	}

	#[test]
	fn non_array_request_is_invalid_command_format() {
		let mut ks = Keyspace::new();
		let mut out = Vec::new();
		dispatch(&mut ks, &Value::Integer(1), &mut out);
		assert_eq!(parse_reply(&out), Value::Error(ByteString::from("ERR invalid command format")));
	}
}
