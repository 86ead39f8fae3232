//! Background caching of every known song: titles are looked up for
//! untitled songs and audio is downloaded for songs not yet on disk.

use std::{
	collections::HashSet,
	sync::{atomic::Ordering, Arc, Mutex, PoisonError, Weak},
	time::Duration,
};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::Collection;
use crate::{
	scheduler::{Rate, Scheduler},
	song::{self, download::Downloader, global_id, Song, SongRef},
};

/// Every known song is resubmitted this often.
pub const RESCAN_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Puts a song's audio at [`Song::file`].
#[async_trait]
pub trait Cache: Send + Sync {
	async fn cache(&self, song: &dyn Song) -> Result<(), song::Error>;
}

#[async_trait]
impl Cache for Downloader {
	async fn cache(&self, song: &dyn Song) -> Result<(), song::Error> {
		self.download(song).await
	}
}

pub struct Pipeline {
	/// Workers per stage.
	pub concurrency: usize,
	pub downloads: Rate,
	pub metadata: Rate,
	pub cache: Arc<dyn Cache>,
}

type InFlight = Arc<Mutex<HashSet<String>>>;

impl Collection {
	/// Starts the cache pipeline. Only the first call has an effect.
	pub fn run(self: &Arc<Self>, pipeline: Pipeline) {
		if self.running.swap(true, Ordering::SeqCst) {
			warn!("cache pipeline already running");
			return;
		}

		match self.store.clean_tmp() {
			Ok(0) => {}
			Ok(n) => info!("removed {n} interrupted download(s)"),
			Err(e) => warn!("Error cleaning interrupted downloads: {e}"),
		}

		let downloading = InFlight::default();
		let downloads = Scheduler::start(
			pipeline.concurrency,
			pipeline.downloads,
			{
				let downloading = Arc::clone(&downloading);
				move |song: &SongRef| {
					let id = global_id(song.as_ref());
					let mut in_flight = downloading.lock().unwrap_or_else(PoisonError::into_inner);
					if song.local() {
						in_flight.remove(&id);
						return false;
					}
					in_flight.insert(id)
				}
			},
			{
				let collection = Arc::downgrade(self);
				move |song: SongRef| {
					download(
						Weak::clone(&collection),
						Arc::clone(&pipeline.cache),
						Arc::clone(&downloading),
						song,
					)
				}
			},
		);

		let looking_up = InFlight::default();
		let metadata = Scheduler::start(
			pipeline.concurrency,
			pipeline.metadata,
			{
				let looking_up = Arc::clone(&looking_up);
				move |song: &SongRef| {
					song.title().is_empty()
						&& looking_up
							.lock()
							.unwrap_or_else(PoisonError::into_inner)
							.insert(global_id(song.as_ref()))
				}
			},
			{
				let collection = Arc::downgrade(self);
				move |song: SongRef| update_title(Weak::clone(&collection), Arc::clone(&looking_up), song)
			},
		);

		let (sx, mut rx) = mpsc::unbounded_channel::<SongRef>();
		*self.new_songs.lock().unwrap_or_else(PoisonError::into_inner) = Some(sx);

		tokio::spawn({
			let (downloads, metadata) = (downloads.clone(), metadata.clone());
			async move {
				while let Some(song) = rx.recv().await {
					metadata.add(Arc::clone(&song)).await;
					downloads.add(song).await;
				}
			}
		});

		let collection = Arc::downgrade(self);
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(RESCAN_INTERVAL);
			loop {
				tick.tick().await;
				let Some(songs) = collection.upgrade().map(|c| c.every_song()) else {
					break;
				};

				debug!("resubmitting {} song(s)", songs.len());
				for song in songs {
					metadata.add(Arc::clone(&song)).await;
					downloads.add(song).await;
				}
			}
		});
	}
}

async fn download(collection: Weak<Collection>, cache: Arc<dyn Cache>, in_flight: InFlight, song: SongRef) {
	let id = global_id(song.as_ref());
	info!("Downloading {id}");

	let res = cache.cache(song.as_ref()).await;
	match (&res, collection.upgrade()) {
		(Ok(()), Some(collection)) => {
			info!("Downloaded {id}");
			collection.problematics.del(song.as_ref());
		}
		(Err(e), Some(collection)) => {
			warn!("Error downloading {id}: {e}");
			collection.problematics.add(Arc::clone(&song), e);
		}
		(_, None) => debug!("collection dropped while downloading {id}"),
	}

	// a failed song may be retried by the next submission
	in_flight
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.remove(&id);
}

async fn update_title(collection: Weak<Collection>, in_flight: InFlight, song: SongRef) {
	let id = global_id(song.as_ref());

	let res = song.update_title().await;
	in_flight
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.remove(&id);

	let Some(collection) = collection.upgrade() else {
		return;
	};
	match res {
		Ok(()) => {
			info!("Title of {id}: {}", song.title());
			collection.changed();
		}
		Err(e) => {
			warn!("Error fetching title of {id}: {e}");
			collection.problematics.add(song, e);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use super::*;
	use crate::{
		queue::Queue,
		song::{fs::Store, tests::TestSong},
	};

	#[derive(Default)]
	struct SlowCache {
		calls: AtomicUsize,
	}

	#[async_trait]
	impl Cache for SlowCache {
		async fn cache(&self, song: &dyn Song) -> Result<(), song::Error> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			tokio::time::sleep(Duration::from_millis(100)).await;
			if song.id().starts_with("bad") {
				return Err(song::Error::Redirects);
			}
			Ok(())
		}
	}

	struct Harness {
		collection: Arc<Collection>,
		cache: Arc<SlowCache>,
		downloads: mpsc::Sender<()>,
		metadata: mpsc::Sender<()>,
	}

	fn start() -> Harness {
		let dir = std::env::temp_dir().join("ymbox-pipeline-test-missing");
		let collection = Collection::new(Arc::new(Store::new(dir)), Arc::new(Queue::new()), false);
		let cache = Arc::new(SlowCache::default());
		let (downloads, dl_rate) = mpsc::channel(8);
		let (metadata, meta_rate) = mpsc::channel(8);

		collection.run(Pipeline {
			concurrency: 2,
			downloads: dl_rate,
			metadata: meta_rate,
			cache: cache.clone(),
		});
		collection.create("p").unwrap();

		Harness {
			collection,
			cache,
			downloads,
			metadata,
		}
	}

	async fn settle(ms: u64) {
		tokio::time::sleep(Duration::from_millis(ms)).await;
	}

	#[tokio::test]
	async fn a_song_is_downloaded_once_at_a_time() {
		let h = start();
		let song = TestSong::new("x");

		h.collection.add_song("p", song.clone()).unwrap();
		h.collection.add_song("p", song.clone()).unwrap();
		settle(50).await;

		h.downloads.send(()).await.unwrap();
		h.downloads.send(()).await.unwrap();
		settle(250).await;
		assert_eq!(h.cache.calls.load(Ordering::SeqCst), 1);

		// settled, so a new submission goes through again
		h.collection.queue_song(-1, song.clone());
		settle(50).await;
		h.downloads.send(()).await.unwrap();
		settle(250).await;
		assert_eq!(h.cache.calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn a_title_is_looked_up_once_at_a_time() {
		let h = start();
		let song = TestSong::new("x");
		song.slow_lookup.store(true, Ordering::SeqCst);

		h.collection.add_song("p", song.clone()).unwrap();
		h.collection.queue_song(-1, song.clone());
		settle(50).await;

		h.metadata.send(()).await.unwrap();
		h.metadata.send(()).await.unwrap();
		settle(250).await;

		assert_eq!(song.lookups.load(Ordering::SeqCst), 1);
		assert_eq!(song.title(), "title of x");
	}

	#[tokio::test]
	async fn local_songs_are_not_downloaded() {
		let h = start();
		let song = TestSong::new("cached");
		song.local.store(true, Ordering::SeqCst);

		h.collection.add_song("p", song).unwrap();
		settle(50).await;
		h.downloads.send(()).await.unwrap();
		settle(50).await;

		assert_eq!(h.cache.calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn failures_are_tracked_as_problematic() {
		let h = start();
		h.collection.add_song("p", TestSong::new("bad")).unwrap();
		h.collection.add_song("p", TestSong::broken("broken")).unwrap();
		settle(50).await;

		// the startup scan may have submitted both songs a second time
		h.downloads.send(()).await.unwrap();
		for _ in 0..4 {
			h.metadata.send(()).await.unwrap();
		}
		settle(250).await;

		let problems: Vec<_> = h
			.collection
			.problematics()
			.iter()
			.map(|p| p.song.id().to_owned())
			.collect();
		assert_eq!(problems, ["bad", "broken"]);

		let titles: Vec<_> = h.collection.playlist_songs("p").unwrap().iter().map(|s| s.title()).collect();
		assert_eq!(titles, ["title of bad", ""]);
	}
}
