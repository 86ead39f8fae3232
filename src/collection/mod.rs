//! Named playlists, the play queue and everything that keeps them on disk
//! and their songs cached.

use std::{
	collections::HashMap,
	io,
	path::PathBuf,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, PoisonError, RwLock,
	},
};

use tokio::sync::mpsc;

use crate::{
	queue::Queue,
	song::{fs::Store, global_id, Song, SongRef},
};

pub mod pipeline;
pub mod playlist;
pub mod problematic;
pub mod store;

pub use playlist::Playlist;
pub use problematic::{Problematic, Problematics};

/// Reads a namespace payload back into a song.
pub type Unmarshaler = Box<dyn Fn(&mut dyn io::Read) -> io::Result<SongRef> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("IO error: {0}")]
	Io(#[from] io::Error),
	#[error("invalid playlist name {0:?}")]
	InvalidPlaylistName(String),
	#[error("playlist {0:?} already exists")]
	PlaylistExists(String),
	#[error("playlist {0:?} does not exist")]
	PlaylistNotFound(String),
	#[error("no unmarshaler registered for namespace {0:?}")]
	UnknownNamespace(String),
	#[error("corrupt collection: {0}")]
	Format(String),
	#[error("{} unresolved song(s): {}", .0.len(), .0.join(", "))]
	UnresolvedSongs(Vec<String>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A song together with the playlists it appears in.
#[derive(Debug, Clone)]
pub struct SearchResult {
	pub song: SongRef,
	pub playlists: Vec<String>,
}

pub struct Collection {
	store: Arc<Store>,
	queue: Arc<Queue>,
	autosave: bool,
	playlists: RwLock<HashMap<String, Arc<Playlist>>>,
	unmarshalers: RwLock<HashMap<String, Unmarshaler>>,
	problematics: Problematics,

	loading: AtomicBool,
	running: AtomicBool,
	needs_save: mpsc::Sender<()>,
	needs_save_rx: Mutex<Option<mpsc::Receiver<()>>>,
	new_songs: Mutex<Option<mpsc::UnboundedSender<SongRef>>>,
}

impl std::fmt::Debug for Collection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Collection")
			.field("store", &self.store)
			.field("autosave", &self.autosave)
			.field("playlists", &self.list())
			.finish_non_exhaustive()
	}
}

/// Playlist names are trimmed and lowercased.
pub fn clean_name(name: &str) -> String {
	name.trim().to_lowercase()
}

impl Collection {
	pub fn new(store: Arc<Store>, queue: Arc<Queue>, autosave: bool) -> Arc<Self> {
		// one slot: a pending signal already covers any later change
		let (needs_save, rx) = mpsc::channel(1);

		Arc::new(Self {
			store,
			queue,
			autosave,
			playlists: RwLock::default(),
			unmarshalers: RwLock::default(),
			problematics: Problematics::default(),
			loading: AtomicBool::new(false),
			running: AtomicBool::new(false),
			needs_save,
			needs_save_rx: Mutex::new(Some(rx)),
			new_songs: Mutex::new(None),
		})
	}

	pub fn store(&self) -> &Arc<Store> {
		&self.store
	}

	pub fn queue(&self) -> &Arc<Queue> {
		&self.queue
	}

	pub fn problematics(&self) -> Vec<Problematic> {
		self.problematics.list()
	}

	/// Registers how songs of namespace `ns` are read back from disk.
	pub fn register_unmarshaler(
		&self,
		ns: impl Into<String>,
		f: impl Fn(&mut dyn io::Read) -> io::Result<SongRef> + Send + Sync + 'static,
	) {
		self.unmarshalers
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(ns.into(), Box::new(f));
	}

	/// Flags the state as dirty. Ignored while loading.
	pub fn changed(&self) {
		if self.loading.load(Ordering::SeqCst) {
			return;
		}
		let _ = self.needs_save.try_send(());
	}

	/// Hands a song to the cache pipeline, if it runs.
	fn notify(&self, song: &SongRef) {
		let sx = self.new_songs.lock().unwrap_or_else(PoisonError::into_inner);
		if let Some(sx) = sx.as_ref() {
			let _ = sx.send(Arc::clone(song));
		}
	}

	fn map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Playlist>>> {
		self.playlists.read().unwrap_or_else(PoisonError::into_inner)
	}

	fn map_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Playlist>>> {
		self.playlists.write().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn create(&self, name: &str) -> Result<()> {
		let name = clean_name(name);
		if name.is_empty() {
			return Err(Error::InvalidPlaylistName(name));
		}

		{
			let mut map = self.map_mut();
			if map.contains_key(&name) {
				return Err(Error::PlaylistExists(name));
			}
			map.insert(name.clone(), Arc::new(Playlist::new(name)));
		}

		self.changed();
		Ok(())
	}

	pub fn exists(&self, name: &str) -> bool {
		self.map().contains_key(&clean_name(name))
	}

	pub fn delete(&self, name: &str) {
		if self.map_mut().remove(&clean_name(name)).is_some() {
			self.changed();
		}
	}

	pub fn get(&self, name: &str) -> Result<Arc<Playlist>> {
		let name = clean_name(name);
		self.map()
			.get(&name)
			.cloned()
			.ok_or(Error::PlaylistNotFound(name))
	}

	/// Playlist names, sorted.
	pub fn list(&self) -> Vec<String> {
		let mut names: Vec<_> = self.map().keys().cloned().collect();
		names.sort();
		names
	}

	/// Every distinct song across all playlists.
	pub fn songs(&self) -> Vec<SongRef> {
		let mut seen = HashMap::new();
		for playlist in self.map().values() {
			for song in playlist.list() {
				seen.entry(global_id(song.as_ref())).or_insert(song);
			}
		}

		let mut songs: Vec<_> = seen.into_iter().collect();
		songs.sort_by(|a, b| a.0.cmp(&b.0));
		songs.into_iter().map(|(_, s)| s).collect()
	}

	/// Every distinct song across all playlists and the queue.
	fn every_song(&self) -> Vec<SongRef> {
		let mut songs = self.songs();
		let mut seen: std::collections::HashSet<_> =
			songs.iter().map(|s| global_id(s.as_ref())).collect();

		for song in self.queue.slice() {
			if seen.insert(global_id(song.as_ref())) {
				songs.push(song);
			}
		}
		songs
	}

	pub fn playlist_songs(&self, name: &str) -> Result<Vec<SongRef>> {
		Ok(self.get(name)?.list())
	}

	pub fn find(&self, ns: &str, id: &str) -> Option<SongRef> {
		self.map().values().find_map(|p| p.find(ns, id))
	}

	/// The song and every playlist containing it.
	pub fn find_all(&self, ns: &str, id: &str) -> Option<SearchResult> {
		let mut result: Option<SearchResult> = None;
		for (name, playlist) in self.map().iter() {
			if let Some(song) = playlist.find(ns, id) {
				result
					.get_or_insert_with(|| SearchResult {
						song,
						playlists: Vec::new(),
					})
					.playlists
					.push(name.clone());
			}
		}

		if let Some(r) = result.as_mut() {
			r.playlists.sort();
		}
		result
	}

	/// Songs whose title matches every word of `q`, grouped with the
	/// playlists they were found in.
	pub fn search(&self, q: &str) -> Vec<SearchResult> {
		let mut hits: HashMap<String, SearchResult> = HashMap::new();
		for (name, playlist) in self.map().iter() {
			for song in playlist.search(q) {
				hits.entry(global_id(song.as_ref()))
					.or_insert_with(|| SearchResult {
						song,
						playlists: Vec::new(),
					})
					.playlists
					.push(name.clone());
			}
		}

		let mut results: Vec<_> = hits.into_values().collect();
		for r in &mut results {
			r.playlists.sort();
		}
		results.sort_by_key(|r| global_id(r.song.as_ref()));
		results
	}

	pub fn add_song(&self, playlist: &str, song: SongRef) -> Result<()> {
		self.get(playlist)?.add(Arc::clone(&song));
		self.notify(&song);
		self.changed();
		Ok(())
	}

	pub fn del_song(&self, playlist: &str, song: &dyn Song) -> Result<()> {
		self.get(playlist)?.del(song);
		self.changed();
		Ok(())
	}

	pub fn del_song_indexes(&self, playlist: &str, indexes: &[usize]) -> Result<()> {
		self.get(playlist)?.del_indexes(indexes);
		self.changed();
		Ok(())
	}

	pub fn move_song_index(&self, playlist: &str, from: &[usize], to: usize) -> Result<()> {
		self.get(playlist)?.move_index(from, to);
		self.changed();
		Ok(())
	}

	/// Inserts the whole playlist into the queue at `index`.
	pub fn queue_playlist(&self, index: isize, playlist: &str) -> Result<()> {
		self.get(playlist)?.queue(&self.queue, index);
		self.changed();
		Ok(())
	}

	pub fn queue_selection(&self, index: isize, playlist: &str, selection: &[usize]) -> Result<()> {
		self.get(playlist)?.queue_selection(&self.queue, index, selection);
		self.changed();
		Ok(())
	}

	pub fn queue_song(&self, index: isize, song: SongRef) {
		self.queue.insert(index, Arc::clone(&song));
		self.notify(&song);
		self.changed();
	}

	/// Renames a song everywhere it is shared.
	pub fn rename_song(&self, song: &dyn Song, title: impl Into<String>) {
		song.set_title(title.into());
		self.changed();
	}

	/// Cached files that no known song refers to any more.
	pub fn unreferenced_downloads(&self) -> io::Result<Vec<PathBuf>> {
		let songs = self.every_song();
		self.store
			.unreferenced(songs.iter().map(|s| (s.ns(), s.id())))
	}
}
