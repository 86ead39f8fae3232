//! Binary persistence of the collection.
//!
//! The database is a gzip stream of:
//!
//! ```text
//! u64 song count
//! count × [u8 len][ns][namespace payload]
//! playlists × [u16 len][name][u32 n] n × [u8 len][global id]
//! the queue, as a playlist named QUEUE
//! [u16 len][EOS][u32 cursor]
//! ```
//!
//! All integers are little endian. A cursor of `u32::MAX` means unset.

use std::{
	collections::BTreeMap,
	fs,
	io::{self, BufReader, Write},
	sync::{atomic::Ordering, Arc, PoisonError, Weak},
	time::Duration,
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use log::{debug, error, info, warn};
use tokio::{sync::mpsc, time::MissedTickBehavior};

use super::{Collection, Error, Result};
use crate::{
	codec::{self, Width},
	song::{fs::write_atomic, global_id, SongRef},
};

const QUEUE: &str = "__QUEUE\x00\x01\x08";
const EOS: &str = "__eos\x00\x01\x08";
const UNSET: u32 = u32::MAX;

/// How often pending changes are written out.
pub const SAVE_INTERVAL: Duration = Duration::from_secs(5);

impl Collection {
	/// Creates the store directory, restores the saved state and starts the
	/// background saver. Unresolved songs are reported after everything
	/// else has been restored.
	pub fn init(self: &Arc<Self>) -> Result<()> {
		fs::create_dir_all(self.store.dir())?;

		match self.needs_save_rx.lock().unwrap_or_else(PoisonError::into_inner).take() {
			Some(rx) => {
				tokio::spawn(saver(Arc::downgrade(self), rx));
			}
			None => warn!("collection initialized twice"),
		}

		self.loading.store(true, Ordering::SeqCst);
		let res = self.load();
		self.loading.store(false, Ordering::SeqCst);

		res
	}

	fn load(&self) -> Result<()> {
		let file = match fs::File::open(self.store.db()) {
			Ok(file) => file,
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				info!("no collection at {}, starting empty", self.store.db().display());
				return Ok(());
			}
			Err(e) => return Err(e.into()),
		};
		let mut r = BufReader::new(GzDecoder::new(file));

		let mut songs = BTreeMap::new();
		{
			let unmarshalers = self.unmarshalers.read().unwrap_or_else(PoisonError::into_inner);
			let count = codec::read_u64(&mut r)?;
			for _ in 0..count {
				let ns = codec::read_str(&mut r, Width::U8)?;
				let unmarshal = unmarshalers
					.get(&ns)
					.ok_or_else(|| Error::UnknownNamespace(ns.clone()))?;

				let song = unmarshal(&mut r as &mut dyn io::Read)?;
				songs.insert(global_id(song.as_ref()), song);
			}
		}

		let mut unresolved = Vec::new();
		loop {
			let Some(name) = codec::read_str_opt(&mut r, Width::U16)? else {
				warn!("collection ended without an end marker");
				break;
			};
			if name.is_empty() {
				return Err(Error::Format("empty playlist name".into()));
			}

			if name == EOS {
				let cursor = codec::read_u32(&mut r)?;
				if cursor != UNSET {
					self.queue.set_current_index(cursor as isize);
				}
				break;
			}

			let n = codec::read_u32(&mut r)?;
			let mut list: Vec<SongRef> = Vec::with_capacity(n as usize);
			for _ in 0..n {
				let id = codec::read_str(&mut r, Width::U8)?;
				match songs.get(&id) {
					Some(song) => list.push(Arc::clone(song)),
					None => unresolved.push(id),
				}
			}

			if name == QUEUE {
				for song in list {
					self.queue_song(-1, song);
				}
				continue;
			}

			self.create(&name)?;
			for song in list {
				self.add_song(&name, song)?;
			}
		}

		debug!(
			"loaded {} song(s), {} playlist(s), {} queued",
			songs.len(),
			self.list().len(),
			self.queue.len()
		);

		if unresolved.is_empty() {
			Ok(())
		} else {
			Err(Error::UnresolvedSongs(unresolved))
		}
	}

	/// Writes the whole collection, replacing the previous database only
	/// once the new one is complete.
	pub fn save(&self) -> Result<()> {
		let (queued, cursor) = self.queue.snapshot();
		let playlists: BTreeMap<String, Vec<SongRef>> = self
			.map()
			.iter()
			.map(|(name, p)| (name.clone(), p.list()))
			.collect();

		let mut songs = BTreeMap::new();
		for song in playlists.values().flatten().chain(&queued) {
			songs.entry(global_id(song.as_ref())).or_insert_with(|| Arc::clone(song));
		}

		let cursor = u32::try_from(cursor).unwrap_or(UNSET);

		write_atomic(&self.store.db(), |file| -> Result<()> {
			let mut w = GzEncoder::new(file, Compression::fast());

			codec::write_u64(&mut w, songs.len() as u64)?;
			for song in songs.values() {
				codec::write_str(&mut w, song.ns(), Width::U8)?;
				song.marshal(&mut w)?;
			}

			for (name, list) in &playlists {
				write_list(&mut w, name, list)?;
			}
			write_list(&mut w, QUEUE, &queued)?;

			codec::write_str(&mut w, EOS, Width::U16)?;
			codec::write_u32(&mut w, cursor)?;

			w.finish()?.flush()?;
			Ok(())
		})
	}
}

fn write_list(w: &mut dyn Write, name: &str, songs: &[SongRef]) -> io::Result<()> {
	codec::write_str(w, name, Width::U16)?;
	codec::write_u32(w, songs.len() as u32)?;
	for song in songs {
		codec::write_str(w, &global_id(song.as_ref()), Width::U8)?;
	}
	Ok(())
}

/// Debounces change signals into at most one save per [`SAVE_INTERVAL`].
/// With autosave on, a moved queue cursor also counts as a change.
async fn saver(collection: Weak<Collection>, mut changes: mpsc::Receiver<()>) {
	let mut tick = tokio::time::interval(SAVE_INTERVAL);
	tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

	let mut dirty = false;
	let mut last_cursor = None;

	loop {
		tokio::select! {
			Some(()) = changes.recv() => dirty = true,
			_ = tick.tick() => {
				let Some(collection) = collection.upgrade() else {
					break;
				};
				if !collection.autosave {
					continue;
				}

				let cursor = collection.queue.current_index();
				if last_cursor.replace(cursor).is_some_and(|last| last != cursor) {
					dirty = true;
				}
				if !dirty {
					continue;
				}
				dirty = false;

				let res = tokio::task::spawn_blocking(move || collection.save()).await;
				match res {
					Ok(Ok(())) => debug!("collection saved"),
					Ok(Err(e)) => error!("Error saving collection: {e}"),
					Err(e) => error!("collection save task failed: {e}"),
				}
			}
		}
	}
}
