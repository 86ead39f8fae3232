use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
	queue::Queue,
	song::{global_id, Song, SongRef},
};

/// A named, ordered list of unique songs.
#[derive(Debug)]
pub struct Playlist {
	name: String,
	songs: RwLock<Vec<SongRef>>,
}

impl Playlist {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			songs: RwLock::default(),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	fn read(&self) -> RwLockReadGuard<'_, Vec<SongRef>> {
		self.songs.read().unwrap_or_else(PoisonError::into_inner)
	}

	fn write(&self) -> RwLockWriteGuard<'_, Vec<SongRef>> {
		self.songs.write().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn list(&self) -> Vec<SongRef> {
		self.read().clone()
	}

	pub fn len(&self) -> usize {
		self.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Appends `song`. A song that is already present (by global id) is
	/// moved to the end instead.
	pub fn add(&self, song: SongRef) {
		let id = global_id(song.as_ref());
		let mut songs = self.write();

		match songs.iter().position(|s| global_id(s.as_ref()) == id) {
			Some(i) => {
				let existing = songs.remove(i);
				songs.push(existing);
			}
			None => songs.push(song),
		}
	}

	pub fn del(&self, song: &dyn Song) {
		let id = global_id(song);
		self.write().retain(|s| global_id(s.as_ref()) != id);
	}

	/// Deletes the songs at the given indexes; out of range indexes are
	/// ignored.
	pub fn del_indexes(&self, indexes: &[usize]) {
		let doomed = self.pick(indexes);
		for song in doomed {
			self.del(song.as_ref());
		}
	}

	fn pick(&self, indexes: &[usize]) -> Vec<SongRef> {
		let songs = self.read();
		indexes
			.iter()
			.filter_map(|&i| songs.get(i).cloned())
			.collect()
	}

	/// Moves `from` in front of `to`.
	fn move_song(&self, from: &str, to: &str) {
		let mut songs = self.write();
		let find = |id: &str| songs.iter().position(|s| global_id(s.as_ref()) == id);
		let (Some(f), Some(mut t)) = (find(from), find(to)) else {
			return;
		};

		if t == f {
			return;
		}
		if t > f {
			t -= 1;
		}

		let song = songs.remove(f);
		songs.insert(t, song);
	}

	/// Moves every song at `from` in front of the song at `to`.
	pub fn move_index(&self, from: &[usize], to: usize) {
		let froms = self.pick(from);
		let Some(target) = self.read().get(to).cloned() else {
			return;
		};

		let target = global_id(target.as_ref());
		for song in froms {
			self.move_song(&global_id(song.as_ref()), &target);
		}
	}

	/// Songs whose title contains every whitespace separated word of `q`,
	/// case insensitively.
	pub fn search(&self, q: &str) -> Vec<SongRef> {
		let words: Vec<_> = q.to_lowercase().split_whitespace().map(str::to_owned).collect();

		self.list()
			.into_iter()
			.filter(|song| {
				let title = song.title().to_lowercase();
				words.iter().all(|w| title.contains(w.as_str()))
			})
			.collect()
	}

	pub fn find(&self, ns: &str, id: &str) -> Option<SongRef> {
		self.read()
			.iter()
			.find(|s| s.ns() == ns && s.id() == id)
			.cloned()
	}

	/// Inserts the whole playlist into the queue at `index`.
	pub fn queue(&self, queue: &Queue, index: isize) {
		queue.insert_slice(index, self.list());
	}

	/// Inserts the songs at `selection` into the queue at `index`.
	pub fn queue_selection(&self, queue: &Queue, index: isize, selection: &[usize]) {
		queue.insert_slice(index, self.pick(selection));
	}
}
