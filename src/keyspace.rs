//! Open-addressed hash table with linear probing, tombstones, dynamic
//! resizing, and lazy TTL expiration.
//!
//! Deliberately hand-rolled rather than built on [`std::collections::HashMap`]
//! — the probe-chain integrity and lazy-expiry-during-probe invariants are
//! the whole point of this component.

use crate::bytes::ByteString;

const INITIAL_CAPACITY: usize = 64;
const LOAD_FACTOR: f64 = 0.7;

/// Sentinel returned by `get_expire` for a key with no expiry, as well as
/// for a missing key. Callers disambiguate with `exists`.
pub const NO_EXPIRY: i64 = -1;

#[derive(Clone)]
enum Slot {
	Empty,
	Tombstone,
	Occupied { key: ByteString, value: ByteString, expire_at: i64 },
}

/// The process-wide keyspace: one flat table of byte-string key/value pairs
/// with optional absolute-millisecond expiry.
pub struct Keyspace {
	slots: Vec<Slot>,
	capacity: usize,
	count: usize,
	used: usize,
}

enum Probe {
	Found(usize),
	NotFound(usize),
}

impl Keyspace {
	pub fn new() -> Self {
		Self { slots: vec![Slot::Empty; INITIAL_CAPACITY], capacity: INITIAL_CAPACITY, count: 0, used: 0 }
	}

	pub fn count(&self) -> usize {
		self.count
	}

	fn probe(&mut self, key: &[u8], now: i64) -> Probe {
		let hash = fnv1a(key);
		let start = (hash as usize) & (self.capacity - 1);
		let mut insertion_candidate: Option<usize> = None;

		for i in 0..self.capacity {
			let slot = (start + i) & (self.capacity - 1);
			match &self.slots[slot] {
				Slot::Empty => {
					return Probe::NotFound(insertion_candidate.unwrap_or(slot));
				},
				Slot::Tombstone => {
					if insertion_candidate.is_none() {
						insertion_candidate = Some(slot);
					}
				},
				Slot::Occupied { key: k, expire_at, .. } => {
					if k.as_bytes() == key {
						if *expire_at != NO_EXPIRY && *expire_at <= now {
							self.slots[slot] = Slot::Tombstone;
							self.count -= 1;
							if insertion_candidate.is_none() {
								insertion_candidate = Some(slot);
							}
						} else {
							return Probe::Found(slot);
						}
					}
				},
			}
		}

		Probe::NotFound(insertion_candidate.unwrap_or(0))
	}

	fn maybe_resize(&mut self) {
		if self.used as f64 >= self.capacity as f64 * LOAD_FACTOR {
			self.resize();
		}
	}

	fn resize(&mut self) {
		let new_capacity = self.capacity * 2;
		let mut new_slots = vec![Slot::Empty; new_capacity];
		let now = crate::clock::now_ms();

		for slot in std::mem::take(&mut self.slots) {
			if let Slot::Occupied { key, value, expire_at } = slot {
				if expire_at != NO_EXPIRY && expire_at <= now {
					continue; // logically absent; dropped during resize
				}
				let hash = fnv1a(&key);
				let mut idx = (hash as usize) & (new_capacity - 1);
				while matches!(new_slots[idx], Slot::Occupied { .. }) {
					idx = (idx + 1) & (new_capacity - 1);
				}
				new_slots[idx] = Slot::Occupied { key, value, expire_at };
			}
		}

		self.slots = new_slots;
		self.capacity = new_capacity;
		self.used = self.count;
	}

	/// Store `value` under `key`, clearing any prior expiry. Returns `true`
	/// if `key` was newly inserted.
	pub fn set(&mut self, key: &[u8], value: ByteString) -> bool {
		self.maybe_resize();
		let now = crate::clock::now_ms();
		match self.probe(key, now) {
			Probe::Found(slot) => {
				self.slots[slot] = Slot::Occupied { key: ByteString::from(key), value, expire_at: NO_EXPIRY };
				false
			},
			Probe::NotFound(slot) => {
				let was_empty = matches!(self.slots[slot], Slot::Empty);
				self.slots[slot] = Slot::Occupied { key: ByteString::from(key), value, expire_at: NO_EXPIRY };
				self.count += 1;
				if was_empty {
					self.used += 1;
				}
				true
			},
		}
	}

	pub fn get(&mut self, key: &[u8]) -> Option<&ByteString> {
		let now = crate::clock::now_ms();
		match self.probe(key, now) {
			Probe::Found(slot) => match &self.slots[slot] {
				Slot::Occupied { value, .. } => Some(value),
				_ => unreachable!(),
			},
			Probe::NotFound(_) => None,
		}
	}

	pub fn exists(&mut self, key: &[u8]) -> bool {
		let now = crate::clock::now_ms();
		matches!(self.probe(key, now), Probe::Found(_))
	}

	/// Delete `key`. Returns `true` if a deletion occurred.
	pub fn delete(&mut self, key: &[u8]) -> bool {
		let now = crate::clock::now_ms();
		match self.probe(key, now) {
			Probe::Found(slot) => {
				self.slots[slot] = Slot::Tombstone;
				self.count -= 1;
				true
			},
			Probe::NotFound(_) => false,
		}
	}

	/// Set the absolute expiry timestamp for `key`, if present.
	pub fn set_expire(&mut self, key: &[u8], expire_at_ms: i64) {
		let now = crate::clock::now_ms();
		if let Probe::Found(slot) = self.probe(key, now) {
			if let Slot::Occupied { expire_at, .. } = &mut self.slots[slot] {
				*expire_at = expire_at_ms;
			}
		}
	}

	/// Read the absolute expiry timestamp for `key`. Returns [`NO_EXPIRY`]
	/// both for "no expiry set" and "key absent" — disambiguate with
	/// [`Keyspace::exists`].
	pub fn get_expire(&mut self, key: &[u8]) -> i64 {
		let now = crate::clock::now_ms();
		match self.probe(key, now) {
			Probe::Found(slot) => match &self.slots[slot] {
				Slot::Occupied { expire_at, .. } => *expire_at,
				_ => unreachable!(),
			},
			Probe::NotFound(_) => NO_EXPIRY,
		}
	}

	/// A cursor over live (key, value) pairs in storage order, lazily
	/// expiring any slot it passes over.
	pub fn iter(&mut self) -> KeysIter<'_> {
		KeysIter { table: self, index: 0 }
	}
}

impl Default for Keyspace {
	fn default() -> Self {
		Self::new()
	}
}

pub struct KeysIter<'a> {
	table: &'a mut Keyspace,
	index: usize,
}

impl<'a> Iterator for KeysIter<'a> {
	type Item = (ByteString, ByteString);

	fn next(&mut self) -> Option<Self::Item> {
		let now = crate::clock::now_ms();
		while self.index < self.table.capacity {
			let slot = self.index;
			self.index += 1;
			match &self.table.slots[slot] {
				Slot::Occupied { expire_at, .. } if *expire_at != NO_EXPIRY && *expire_at <= now => {
					self.table.slots[slot] = Slot::Tombstone;
					self.table.count -= 1;
				},
				Slot::Occupied { key, value, .. } => return Some((key.clone(), value.clone())),
				_ => (),
			}
		}
		None
	}
}

fn fnv1a(data: &[u8]) -> u32 {
	let mut hash: u32 = 0x811c_9dc5;
	for &byte in data {
		hash ^= byte as u32;
		hash = hash.wrapping_mul(0x0100_0193);
	}
	hash
}

#[cfg(test)]
mod tests {
	use super::*;

	fn b(s: &str) -> ByteString {
		ByteString::from(s)
	}

	#[test]
	fn set_then_get_round_trips() {
		let mut ks = Keyspace::new();
		assert!(ks.set(b"foo", b("bar")));
		assert_eq!(ks.get(b"foo"), Some(&b("bar")));
	}

	#[test]
	fn set_on_existing_key_overwrites_and_is_not_new() {
		let mut ks = Keyspace::new();
		assert!(ks.set(b"foo", b("1")));
		assert!(!ks.set(b"foo", b("2")));
		assert_eq!(ks.get(b"foo"), Some(&b("2")));
	}

	#[test]
	fn set_clears_prior_expiry() {
		let mut ks = Keyspace::new();
		ks.set(b"foo", b("1"));
		ks.set_expire(b"foo", crate::clock::now_ms() + 60_000);
		ks.set(b"foo", b("2"));
		assert_eq!(ks.get_expire(b"foo"), NO_EXPIRY);
	}

	#[test]
	fn delete_missing_key_returns_false() {
		let mut ks = Keyspace::new();
		assert!(!ks.delete(b"nope"));
	}

	#[test]
	fn delete_leaves_tombstone_not_empty_for_probe_continuity() {
		let mut ks = Keyspace::new();
		ks.set(b"a", b("1"));
		ks.set(b"b", b("2"));
		ks.delete(b"a");
		// "b" must still be reachable: deleting "a" must not have broken
		// "b"'s probe chain by writing Empty where a Tombstone belongs.
		assert_eq!(ks.get(b"b"), Some(&b("2")));
	}

	#[test]
	fn tombstone_reuse_does_not_grow_used() {
		let mut ks = Keyspace::new();
		ks.set(b"a", b("1"));
		ks.delete(b"a");
		let used_before = ks.used;
		ks.set(b"a", b("2"));
		assert_eq!(ks.used, used_before);
	}

	#[test]
	fn exists_and_count_are_consistent() {
		let mut ks = Keyspace::new();
		ks.set(b"a", b("1"));
		ks.set(b"b", b("2"));
		assert!(ks.exists(b"a"));
		assert_eq!(ks.count(), 2);
		ks.delete(b"a");
		assert!(!ks.exists(b"a"));
		assert_eq!(ks.count(), 1);
	}

	#[test]
	fn lazy_expiry_on_get() {
		let mut ks = Keyspace::new();
		ks.set(b"foo", b("bar"));
		ks.set_expire(b"foo", crate::clock::now_ms() - 1);
		assert_eq!(ks.get(b"foo"), None);
		assert_eq!(ks.count(), 0);
	}

	#[test]
	fn lazy_expiry_on_exists() {
		let mut ks = Keyspace::new();
		ks.set(b"foo", b("bar"));
		ks.set_expire(b"foo", crate::clock::now_ms() - 1);
		assert!(!ks.exists(b"foo"));
		assert_eq!(ks.count(), 0);
	}

	#[test]
	fn lazy_expiry_during_iteration() {
		let mut ks = Keyspace::new();
		ks.set(b"live", b("1"));
		ks.set(b"dead", b("2"));
		ks.set_expire(b"dead", crate::clock::now_ms() - 1);
		let keys: Vec<_> = ks.iter().map(|(k, _)| k).collect();
		assert_eq!(keys, vec![b("live")]);
		assert_eq!(ks.count(), 1);
	}

	#[test]
	fn resize_triggers_past_load_factor_and_preserves_entries() {
		let mut ks = Keyspace::new();
		for i in 0..50 {
			ks.set(format!("key{i}").as_bytes(), b(&format!("val{i}")));
		}
		assert!(ks.capacity > INITIAL_CAPACITY);
		assert_eq!(ks.count(), 50);
		for i in 0..50 {
			assert_eq!(ks.get(format!("key{i}").as_bytes()), Some(&b(&format!("val{i}"))));
		}
	}

	#[test]
	fn resize_resets_used_to_count_dropping_tombstones() {
		let mut ks = Keyspace::new();
		for i in 0..80 {
			ks.set(format!("k{i}").as_bytes(), b("v"));
			if i % 2 == 0 {
				ks.delete(format!("k{i}").as_bytes());
			}
		}
		assert_eq!(ks.used, ks.count);
	}

	#[test]
	fn binary_safe_keys_and_values() {
		let mut ks = Keyspace::new();
		let key = b"a\x00\r\nb";
		let value = b("v\x00al\r\nue");
		ks.set(key, value.clone());
		assert_eq!(ks.get(key), Some(&value));
	}
}
