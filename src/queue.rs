//! The playback queue: an ordered list of songs with a movable cursor.
//!
//! Nodes live in an arena and link to each other by slot index. Two
//! sentinels bound the list: the head ("before first") and the tail ("after
//! last"). The cursor is either unset (resolves to the first item on first
//! use) or points at any node, sentinels included.

use std::{
	fmt,
	sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::song::SongRef;

const HEAD: usize = 0;
const TAIL: usize = 1;

#[derive(Debug, Clone)]
enum Kind {
	Head,
	Tail,
	Song(SongRef),
}

#[derive(Debug)]
struct Node {
	// sentinels point at themselves on their open side
	prev: usize,
	next: usize,
	kind: Kind,
}

#[derive(Debug)]
struct Slot {
	generation: u64,
	node: Option<Node>,
}

/// Stable reference to a queue node. A handle is never reused for another
/// node, even after the node was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
	slot: usize,
	generation: u64,
}

/// Snapshot of a queue node as returned by cursor navigation.
#[derive(Debug, Clone)]
pub struct QueueItem {
	handle: Handle,
	kind: Kind,
}

impl QueueItem {
	pub fn handle(&self) -> Handle {
		self.handle
	}

	/// The song, `None` for sentinels.
	pub fn song(&self) -> Option<&SongRef> {
		match &self.kind {
			Kind::Song(song) => Some(song),
			Kind::Head | Kind::Tail => None,
		}
	}

	pub fn is_beyond_first(&self) -> bool {
		matches!(self.kind, Kind::Head)
	}

	pub fn is_beyond_last(&self) -> bool {
		matches!(self.kind, Kind::Tail)
	}
}

#[derive(Debug)]
struct Inner {
	slots: Vec<Slot>,
	free: Vec<usize>,
	current: Option<usize>,
	len: usize,
	rng: StdRng,
}

#[derive(Debug)]
pub struct Queue {
	inner: RwLock<Inner>,
}

impl Default for Queue {
	fn default() -> Self {
		Self::new()
	}
}

impl Queue {
	pub fn new() -> Self {
		let mut inner = Inner {
			slots: Vec::new(),
			free: Vec::new(),
			current: None,
			len: 0,
			rng: StdRng::from_entropy(),
		};
		inner.reset();

		Self {
			inner: RwLock::new(inner),
		}
	}

	fn read(&self) -> RwLockReadGuard<'_, Inner> {
		self.inner.read().unwrap_or_else(PoisonError::into_inner)
	}

	fn write(&self) -> RwLockWriteGuard<'_, Inner> {
		self.inner.write().unwrap_or_else(PoisonError::into_inner)
	}

	/// Inserts `song` before the `index`th item, counting from 1; 0 and 1
	/// prepend, a negative or out of range index appends. Queueing right
	/// after the cursor is `insert(current_index() + 2, ..)`.
	pub fn insert(&self, index: isize, song: SongRef) {
		self.write().add(index, song);
	}

	/// Inserts `songs` in order, the first one before the `index`th item as
	/// in [`Queue::insert`]. With a negative index every song is appended.
	pub fn insert_slice(&self, mut index: isize, songs: impl IntoIterator<Item = SongRef>) {
		let mut inner = self.write();
		for song in songs {
			inner.add(index, song);
			if index >= 0 {
				index += 1;
			}
		}
	}

	/// Removes the item at `index`. A cursor on that item moves to its
	/// successor.
	pub fn remove(&self, index: usize) -> Option<SongRef> {
		self.write().remove(index)
	}

	/// The songs in queue order.
	pub fn slice(&self) -> Vec<SongRef> {
		self.read().slice()
	}

	/// The songs and the cursor position, read under one lock.
	pub fn snapshot(&self) -> (Vec<SongRef>, isize) {
		let inner = self.read();
		(inner.slice(), inner.current_index())
	}

	pub fn len(&self) -> usize {
		self.read().len
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// 0-based position of the cursor, `-1` when unset or on a sentinel.
	pub fn current_index(&self) -> isize {
		self.read().current_index()
	}

	pub fn current(&self) -> QueueItem {
		let mut inner = self.write();
		let idx = inner.resolve();
		inner.item(idx)
	}

	/// Moves the cursor forward, stopping at the tail sentinel.
	pub fn next(&self) -> QueueItem {
		let mut inner = self.write();
		let idx = inner.resolve();
		let idx = inner.node(idx).next;
		inner.current = Some(idx);
		inner.item(idx)
	}

	/// Moves the cursor back, stopping at the head sentinel.
	pub fn prev(&self) -> QueueItem {
		let mut inner = self.write();
		let idx = inner.current.unwrap_or(HEAD);
		let idx = inner.node(idx).prev;
		inner.current = Some(idx);
		inner.item(idx)
	}

	/// Positions the cursor on item `i`. Past the end clamps to the last
	/// item; a negative index unsets the cursor.
	pub fn set_current_index(&self, i: isize) {
		let mut inner = self.write();
		if i < 0 {
			inner.current = None;
			return;
		}

		let mut idx = inner.node(HEAD).next;
		for _ in 0..i {
			let next = inner.node(idx).next;
			if next == TAIL {
				break;
			}
			idx = next;
		}
		inner.current = Some(idx);
	}

	/// Randomly permutes items `start..=end`. A negative `start` shuffles
	/// from the first item, a negative `end` through the last one.
	pub fn shuffle_range(&self, start: isize, end: isize) {
		self.write().shuffle_range(start, end);
	}

	pub fn shuffle(&self) {
		self.shuffle_range(-1, -1);
	}

	/// Drops every item and unsets the cursor.
	pub fn reset(&self) {
		self.write().reset();
	}

	/// Checks the link structure; used by tests.
	#[cfg(test)]
	fn walk(&self) -> usize {
		let inner = self.read();
		let mut n = 0;
		let mut idx = inner.node(HEAD).next;
		let mut prev = HEAD;
		while idx != TAIL {
			assert_eq!(inner.node(idx).prev, prev, "broken back link");
			prev = idx;
			idx = inner.node(idx).next;
			n += 1;
		}
		assert_eq!(inner.node(TAIL).prev, prev, "broken tail link");
		n
	}
}

impl fmt::Display for Queue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for (i, song) in self.slice().iter().enumerate() {
			if i != 0 {
				f.write_str("\n")?;
			}
			f.write_str(&song.title())?;
		}
		Ok(())
	}
}

// Inner methods never lock; the public wrappers above hold the lock.
impl Inner {
	fn node(&self, idx: usize) -> &Node {
		match &self.slots[idx].node {
			Some(node) => node,
			None => unreachable!("queue link to freed slot {idx}"),
		}
	}

	fn node_mut(&mut self, idx: usize) -> &mut Node {
		match &mut self.slots[idx].node {
			Some(node) => node,
			None => unreachable!("queue link to freed slot {idx}"),
		}
	}

	fn item(&self, idx: usize) -> QueueItem {
		QueueItem {
			handle: Handle {
				slot: idx,
				generation: self.slots[idx].generation,
			},
			kind: self.node(idx).kind.clone(),
		}
	}

	/// An unset cursor resolves to the first item (or the tail if empty).
	fn resolve(&mut self) -> usize {
		let idx = match self.current {
			Some(idx) => idx,
			None => self.node(HEAD).next,
		};
		self.current = Some(idx);
		idx
	}

	fn reset(&mut self) {
		for (idx, slot) in self.slots.iter_mut().enumerate() {
			if idx > TAIL && slot.node.take().is_some() {
				slot.generation += 1;
				self.free.push(idx);
			}
		}

		if self.slots.is_empty() {
			self.slots.push(Slot {
				generation: 0,
				node: None,
			});
			self.slots.push(Slot {
				generation: 0,
				node: None,
			});
		}

		self.slots[HEAD].node = Some(Node {
			prev: HEAD,
			next: TAIL,
			kind: Kind::Head,
		});
		self.slots[TAIL].node = Some(Node {
			prev: HEAD,
			next: TAIL,
			kind: Kind::Tail,
		});

		self.current = None;
		self.len = 0;
	}

	fn alloc(&mut self, node: Node) -> usize {
		match self.free.pop() {
			Some(idx) => {
				self.slots[idx].node = Some(node);
				idx
			}
			None => {
				self.slots.push(Slot {
					generation: 0,
					node: Some(node),
				});
				self.slots.len() - 1
			}
		}
	}

	fn add(&mut self, index: isize, song: SongRef) {
		// an empty queue whose cursor fell onto the tail would otherwise
		// never reach the new item
		if self.current == Some(TAIL) && self.node(TAIL).prev == HEAD {
			self.current = None;
		}

		let mut target = self.node(HEAD).next;
		let mut n = 1;
		while target != TAIL && (index < 0 || n < index) {
			target = self.node(target).next;
			n += 1;
		}

		let prev = self.node(target).prev;
		let idx = self.alloc(Node {
			prev,
			next: target,
			kind: Kind::Song(song),
		});
		self.node_mut(prev).next = idx;
		self.node_mut(target).prev = idx;
		self.len += 1;
	}

	fn nth(&self, index: usize) -> Option<usize> {
		let mut idx = self.node(HEAD).next;
		for _ in 0..index {
			if idx == TAIL {
				return None;
			}
			idx = self.node(idx).next;
		}

		(idx != TAIL).then_some(idx)
	}

	fn remove(&mut self, index: usize) -> Option<SongRef> {
		let idx = self.nth(index)?;
		let (prev, next) = {
			let node = self.node(idx);
			(node.prev, node.next)
		};

		self.node_mut(prev).next = next;
		self.node_mut(next).prev = prev;
		if self.current == Some(idx) {
			self.current = Some(next);
		}

		let slot = &mut self.slots[idx];
		slot.generation += 1;
		let node = slot.node.take();
		self.free.push(idx);
		self.len -= 1;

		match node.map(|n| n.kind) {
			Some(Kind::Song(song)) => Some(song),
			_ => None,
		}
	}

	fn slice(&self) -> Vec<SongRef> {
		let mut list = Vec::with_capacity(self.len);
		let mut idx = self.node(HEAD).next;
		while idx != TAIL {
			let node = self.node(idx);
			if let Kind::Song(song) = &node.kind {
				list.push(SongRef::clone(song));
			}
			idx = node.next;
		}

		list
	}

	fn current_index(&self) -> isize {
		let Some(current) = self.current else {
			return -1;
		};

		let mut idx = self.node(HEAD).next;
		let mut i = 0;
		while idx != TAIL {
			if idx == current {
				return i;
			}
			idx = self.node(idx).next;
			i += 1;
		}

		-1
	}

	fn shuffle_range(&mut self, start: isize, end: isize) {
		let start = start.max(0);

		// `before` and `after` bound the range; they are sentinels when the
		// range touches either end
		let mut before = HEAD;
		let mut after = TAIL;
		let mut range = Vec::new();

		let mut idx = self.node(HEAD).next;
		let mut n: isize = 0;
		while idx != TAIL {
			if n == start - 1 {
				before = idx;
			} else if end >= 0 && n == end + 1 {
				after = idx;
				break;
			} else if n >= start && (end < 0 || n <= end) {
				range.push(idx);
			}

			idx = self.node(idx).next;
			n += 1;
		}

		if range.len() <= 1 {
			return;
		}

		range.shuffle(&mut self.rng);

		self.node_mut(before).next = range[0];
		self.node_mut(range[0]).prev = before;
		for pair in range.windows(2) {
			self.node_mut(pair[0]).next = pair[1];
			self.node_mut(pair[1]).prev = pair[0];
		}
		let last = range[range.len() - 1];
		self.node_mut(last).next = after;
		self.node_mut(after).prev = last;
	}
}
