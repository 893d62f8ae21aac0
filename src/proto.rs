//! Incremental parser and serializer for the framed wire protocol.
//!
//! The parser is pure and restartable: it never blocks and never assumes the
//! input buffer holds a whole frame. The event loop calls [`parse`]
//! repeatedly against a growing read buffer and reacts to [`ParseResult`].

use crate::bytes::ByteString;

/// A single wire value, as produced by the parser or accepted by the
/// serializer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
	SimpleString(ByteString),
	Error(ByteString),
	Integer(i64),
	BulkString(ByteString),
	NullBulk,
	Array(Vec<Value>),
}

/// Outcome of attempting to parse one frame from the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
	/// The input is a valid prefix of some frame; the caller must retain all
	/// bytes and try again once more data arrives.
	NeedMore,
	/// One complete value, and the number of bytes it consumed.
	Parsed(Value, usize),
	/// The input cannot be extended into a valid frame; the connection
	/// producing it should be closed.
	Malformed,
}

/// Find `\r\n` in `buf`, returning the offset of the `\r`.
fn find_crlf(buf: &[u8]) -> Option<usize> {
	buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_i64(field: &[u8]) -> Option<i64> {
	if field.is_empty() || field[0] == b'+' {
		return None;
	}
	let text = std::str::from_utf8(field).ok()?;
	text.parse().ok()
}

/// Attempt to parse one frame from the front of `buf`.
pub fn parse(buf: &[u8]) -> ParseResult {
	let mut stack: Vec<(usize, Vec<Value>)> = Vec::new();
	let mut pos = 0usize;

	loop {
		match parse_one(&buf[pos..]) {
			OneResult::NeedMore => return ParseResult::NeedMore,
			OneResult::Malformed => return ParseResult::Malformed,
			OneResult::ArrayHeader(n, consumed) => {
				pos += consumed;
				if n == 0 {
					if let Err(value) = push_value(&mut stack, Value::Array(Vec::new())) {
						return ParseResult::Parsed(value, pos);
					}
				} else {
					stack.push((n, Vec::with_capacity(n)));
				}
			},
			OneResult::Value(value, consumed) => {
				pos += consumed;
				if let Err(value) = push_value(&mut stack, value) {
					return ParseResult::Parsed(value, pos);
				}
			},
		}

		// Drain any arrays that just became complete.
		loop {
			match stack.last() {
				Some((remaining, elements)) if elements.len() == *remaining => {
					let (_, elements) = stack.pop().unwrap();
					let array = Value::Array(elements);
					if let Err(array) = push_value(&mut stack, array) {
						return ParseResult::Parsed(array, pos);
					}
				},
				_ => break,
			}
		}
	}
}

/// Push a freshly parsed child value onto the innermost open array on the
/// stack. Hands `value` back if there is no open array, meaning it is the
/// top-level result.
fn push_value(stack: &mut [(usize, Vec<Value>)], value: Value) -> Result<(), Value> {
	match stack.last_mut() {
		Some((_, elements)) => {
			elements.push(value);
			Ok(())
		},
		None => Err(value),
	}
}

enum OneResult {
	NeedMore,
	Malformed,
	/// `*<n>\r\n` header, with `n` children still to come.
	ArrayHeader(usize, usize),
	Value(Value, usize),
}

fn parse_one(buf: &[u8]) -> OneResult {
	let Some(&tag) = buf.first() else {
		return OneResult::NeedMore;
	};

	match tag {
		b'+' | b'-' => {
			let Some(crlf) = find_crlf(&buf[1..]) else {
				return OneResult::NeedMore;
			};
			let text = ByteString::from(&buf[1..1 + crlf]);
			let value = if tag == b'+' { Value::SimpleString(text) } else { Value::Error(text) };
			OneResult::Value(value, 1 + crlf + 2)
		},
		b':' => {
			let Some(crlf) = find_crlf(&buf[1..]) else {
				return OneResult::NeedMore;
			};
			match parse_i64(&buf[1..1 + crlf]) {
				Some(n) => OneResult::Value(Value::Integer(n), 1 + crlf + 2),
				None => OneResult::Malformed,
			}
		},
		b'$' => {
			let Some(crlf) = find_crlf(&buf[1..]) else {
				return OneResult::NeedMore;
			};
			let header_len = 1 + crlf + 2;
			let len = match parse_i64(&buf[1..1 + crlf]) {
				Some(n) => n,
				None => return OneResult::Malformed,
			};
			if len == -1 {
				return OneResult::Value(Value::NullBulk, header_len);
			}
			if len < -1 {
				return OneResult::Malformed;
			}
			let len = len as usize;
			let total = header_len + len + 2;
			if buf.len() < total {
				return OneResult::NeedMore;
			}
			if &buf[header_len + len..total] != b"\r\n" {
				return OneResult::Malformed;
			}
			OneResult::Value(Value::BulkString(ByteString::from(&buf[header_len..header_len + len])), total)
		},
		b'*' => {
			let Some(crlf) = find_crlf(&buf[1..]) else {
				return OneResult::NeedMore;
			};
			let header_len = 1 + crlf + 2;
			let count = match parse_i64(&buf[1..1 + crlf]) {
				Some(n) => n,
				None => return OneResult::Malformed,
			};
			if count < 0 {
				return OneResult::Malformed;
			}
			OneResult::ArrayHeader(count as usize, header_len)
		},
		_ => OneResult::Malformed,
	}
}

/// Serialize `value` into `out`, appending to whatever is already there.
pub fn write_value(out: &mut Vec<u8>, value: &Value) {
	match value {
		Value::SimpleString(s) => {
			out.push(b'+');
			out.extend_from_slice(s.as_bytes());
			out.extend_from_slice(b"\r\n");
		},
		Value::Error(s) => {
			out.push(b'-');
			out.extend_from_slice(s.as_bytes());
			out.extend_from_slice(b"\r\n");
		},
		Value::Integer(n) => {
			out.push(b':');
			out.extend_from_slice(n.to_string().as_bytes());
			out.extend_from_slice(b"\r\n");
		},
		Value::BulkString(s) => {
			out.push(b'$');
			out.extend_from_slice(s.len().to_string().as_bytes());
			out.extend_from_slice(b"\r\n");
			out.extend_from_slice(s.as_bytes());
			out.extend_from_slice(b"\r\n");
		},
		Value::NullBulk => out.extend_from_slice(b"$-1\r\n"),
		Value::Array(items) => {
			out.push(b'*');
			out.extend_from_slice(items.len().to_string().as_bytes());
			out.extend_from_slice(b"\r\n");
			for item in items {
				write_value(out, item);
			}
		},
	}
}

/// Write a simple string reply (`+OK\r\n`) directly, without building a
/// [`Value`] first — the hot path for command handlers.
pub fn write_simple_string(out: &mut Vec<u8>, text: &str) {
	out.push(b'+');
	out.extend_from_slice(text.as_bytes());
	out.extend_from_slice(b"\r\n");
}

pub fn write_error(out: &mut Vec<u8>, text: &str) {
	out.push(b'-');
	out.extend_from_slice(text.as_bytes());
	out.extend_from_slice(b"\r\n");
}

pub fn write_integer(out: &mut Vec<u8>, n: i64) {
	out.push(b':');
	out.extend_from_slice(n.to_string().as_bytes());
	out.extend_from_slice(b"\r\n");
}

pub fn write_bulk_string(out: &mut Vec<u8>, data: &[u8]) {
	out.push(b'$');
	out.extend_from_slice(data.len().to_string().as_bytes());
	out.extend_from_slice(b"\r\n");
	out.extend_from_slice(data);
	out.extend_from_slice(b"\r\n");
}

pub fn write_null_bulk(out: &mut Vec<u8>) {
	out.extend_from_slice(b"$-1\r\n");
}

pub fn write_array_header(out: &mut Vec<u8>, count: usize) {
	out.push(b'*');
	out.extend_from_slice(count.to_string().as_bytes());
	out.extend_from_slice(b"\r\n");
}
