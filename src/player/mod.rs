//! Plays the queue through a [`Backend`].

use std::{
	path::PathBuf,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use log::{debug, error};
use tokio::sync::{oneshot, Mutex};

use crate::{
	backend::{self, Backend, Whence},
	queue::{Queue, QueueItem},
	song::{self, global_id, SongRef},
};

mod position;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("[{id}] {title}: {source}")]
	Resolve {
		id: String,
		title: String,
		source: song::Error,
	},
	#[error("[{id}] {title}: {source}")]
	Play {
		id: String,
		title: String,
		source: backend::Error,
	},
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
}

impl Error {
	fn resolve(song: &SongRef, source: song::Error) -> Self {
		Self::Resolve {
			id: global_id(song.as_ref()),
			title: song.title(),
			source,
		}
	}

	fn play(song: &SongRef, source: backend::Error) -> Self {
		Self::Play {
			id: global_id(song.as_ref()),
			title: song.title(),
			source,
		}
	}
}

/// Sink for failures the player recovers from by skipping a song.
pub trait ErrorReporter: Send + Sync {
	fn err(&self, err: Error);
}

/// Reports through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
	fn err(&self, err: Error) {
		error!("{err}");
	}
}

#[derive(Default)]
struct State {
	current: Option<QueueItem>,
	/// Bumped on every start; a completion only counts if it still matches.
	seq: u64,
}

pub struct Player {
	backend: Arc<dyn Backend>,
	reporter: Arc<dyn ErrorReporter>,
	queue: Arc<Queue>,
	position_file: PathBuf,
	state: Mutex<State>,
	stopped: AtomicBool,
}

impl Player {
	pub fn new(
		backend: Arc<dyn Backend>,
		reporter: Arc<dyn ErrorReporter>,
		queue: Arc<Queue>,
		position_file: impl Into<PathBuf>,
	) -> Arc<Self> {
		Arc::new(Self {
			backend,
			reporter,
			queue,
			position_file: position_file.into(),
			state: Mutex::default(),
			stopped: AtomicBool::new(false),
		})
	}

	/// The song being played, if any.
	pub async fn current(&self) -> Option<SongRef> {
		self.state.lock().await.current.as_ref().and_then(|i| i.song().cloned())
	}

	/// Resumes a paused player or starts the song under the queue cursor
	/// when nothing is playing.
	pub async fn play(self: &Arc<Self>) {
		let mut state = self.state.lock().await;
		self.play_locked(&mut state).await;
	}

	async fn play_locked(self: &Arc<Self>, state: &mut State) {
		if self.paused() {
			self.stopped.store(false, Ordering::SeqCst);
			self.backend.pause(false).await;
		}

		// failing songs are skipped until one starts or the queue runs out
		while state.current.is_none() {
			state.seq += 1;
			let item = self.queue.current();
			let Some(song) = item.song().cloned() else {
				self.stopped.store(true, Ordering::SeqCst);
				self.backend.stop().await;
				return;
			};

			state.current = Some(item);
			match self.start(&song).await {
				Ok(done) => {
					debug!("playing {}", global_id(song.as_ref()));
					tokio::spawn(Arc::clone(self).watch(state.seq, done));
				}
				Err(e) => {
					self.reporter.err(e);
					state.current = None;
					self.queue.next();
				}
			}
		}
	}

	async fn start(&self, song: &SongRef) -> Result<oneshot::Receiver<()>, Error> {
		let file = song.file().map_err(|e| Error::resolve(song, e))?;
		let token = if song.local() {
			file.display().to_string()
		} else {
			song.url()
				.await
				.map_err(|e| Error::resolve(song, e))?
				.to_string()
		};

		self.backend
			.play(&token)
			.await
			.map_err(|e| Error::play(song, e))
	}

	/// Advances to the next song once `done` fires, unless the player moved
	/// on by itself in the meantime.
	fn watch(self: Arc<Self>, seq: u64, done: oneshot::Receiver<()>) -> BoxFuture<'static, ()> {
		async move {
			if done.await.is_err() {
				return;
			}

			let play = {
				let mut state = self.state.lock().await;
				if state.seq != seq {
					false
				} else {
					state.current = None;
					!self.queue.next().is_beyond_last()
				}
			};

			if play && !self.paused() {
				self.play().await;
			}
		}
		.boxed()
	}

	/// Plays the next song; does nothing on the last one.
	pub async fn next(self: &Arc<Self>) {
		let overshot = {
			let mut state = self.state.lock().await;
			state.current = None;
			self.queue.next().is_beyond_last()
		};

		if overshot {
			self.queue.prev();
			return;
		}
		self.play().await;
	}

	/// Plays the previous song; does nothing on the first one.
	pub async fn prev(self: &Arc<Self>) {
		let overshot = {
			let mut state = self.state.lock().await;
			state.current = None;
			self.queue.prev().is_beyond_first()
		};

		if overshot {
			self.queue.next();
			return;
		}
		self.play().await;
	}

	/// Starts the song under the queue cursor, even if another one is
	/// playing.
	pub async fn force_play(self: &Arc<Self>) {
		let mut state = self.state.lock().await;
		state.current = None;
		self.play_locked(&mut state).await;
	}

	pub async fn pause(&self) {
		self.backend.pause(true).await;
	}

	pub async fn toggle_pause(&self) {
		self.backend.toggle_pause().await;
	}

	/// Explicitly stopped or paused in the backend.
	pub fn paused(&self) -> bool {
		self.stopped.load(Ordering::SeqCst) || self.backend.paused()
	}

	pub fn volume(&self) -> f64 {
		self.backend.volume()
	}

	pub async fn set_volume(&self, volume: f64) {
		self.backend.set_volume(volume).await;
	}

	pub async fn increase_volume(&self, delta: f64) {
		self.backend.increase_volume(delta).await;
	}

	pub async fn seek(&self, seconds: f64, whence: Whence) {
		self.backend.seek(seconds, whence).await;
	}

	pub async fn seek_to(&self, fraction: f64) {
		self.backend.seek_to(fraction).await;
	}

	pub async fn position(&self) -> Duration {
		self.backend.position().await
	}

	pub async fn duration(&self) -> Duration {
		self.backend.duration().await
	}

	pub async fn close(&self) -> backend::Result<()> {
		self.backend.close().await
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use std::sync::Mutex as StdMutex;

	use async_trait::async_trait;

	use super::*;
	use crate::song::tests::TestSong;

	#[derive(Default)]
	pub struct FakeBackend {
		pub plays: StdMutex<Vec<String>>,
		pub calls: StdMutex<Vec<String>>,
		dones: StdMutex<Vec<Option<oneshot::Sender<()>>>>,
		paused: AtomicBool,
	}

	impl FakeBackend {
		/// Ends the `n`th played file.
		pub fn finish(&self, n: usize) {
			if let Some(done) = self.dones.lock().unwrap()[n].take() {
				let _ = done.send(());
			}
		}

		pub fn plays(&self) -> Vec<String> {
			self.plays.lock().unwrap().clone()
		}

		pub fn calls(&self) -> Vec<String> {
			self.calls.lock().unwrap().clone()
		}

		fn record(&self, call: String) {
			self.calls.lock().unwrap().push(call);
		}
	}

	#[async_trait]
	impl Backend for FakeBackend {
		async fn play(&self, token: &str) -> backend::Result<oneshot::Receiver<()>> {
			if token.contains("refused") {
				return Err(backend::Error::Response("refused".into()));
			}

			let (done, rx) = oneshot::channel();
			self.plays.lock().unwrap().push(token.to_owned());
			self.dones.lock().unwrap().push(Some(done));
			self.paused.store(false, Ordering::SeqCst);
			Ok(rx)
		}

		async fn stop(&self) {
			self.record("stop".into());
		}

		fn paused(&self) -> bool {
			self.paused.load(Ordering::SeqCst)
		}

		async fn pause(&self, pause: bool) {
			self.paused.store(pause, Ordering::SeqCst);
			self.record(format!("pause {pause}"));
		}

		fn volume(&self) -> f64 {
			1.0
		}

		async fn set_volume(&self, volume: f64) {
			self.record(format!("volume {volume}"));
		}

		async fn seek(&self, seconds: f64, whence: Whence) {
			self.record(format!("seek {seconds} {whence:?}"));
		}

		async fn seek_to(&self, fraction: f64) {
			self.record(format!("seek_to {fraction}"));
		}

		async fn position(&self) -> Duration {
			Duration::from_millis(61_900)
		}

		async fn duration(&self) -> Duration {
			Duration::from_secs(200)
		}

		async fn close(&self) -> backend::Result<()> {
			Ok(())
		}
	}

	#[derive(Default)]
	pub struct Reports(pub StdMutex<Vec<String>>);

	impl ErrorReporter for Reports {
		fn err(&self, err: Error) {
			self.0.lock().unwrap().push(err.to_string());
		}
	}

	pub struct Setup {
		pub player: Arc<Player>,
		pub backend: Arc<FakeBackend>,
		pub reports: Arc<Reports>,
		pub queue: Arc<Queue>,
	}

	pub fn setup(songs: Vec<SongRef>, position_file: PathBuf) -> Setup {
		let queue = Arc::new(Queue::new());
		queue.insert_slice(-1, songs);
		let backend = Arc::new(FakeBackend::default());
		let reports = Arc::new(Reports::default());
		let player = Player::new(backend.clone(), reports.clone(), Arc::clone(&queue), position_file);

		Setup {
			player,
			backend,
			reports,
			queue,
		}
	}

	fn songs(ids: &[&str]) -> Vec<SongRef> {
		ids.iter()
			.map(|id| -> SongRef {
				if id.starts_with("broken") {
					TestSong::broken(id)
				} else {
					TestSong::titled(id, &id.to_uppercase())
				}
			})
			.collect()
	}

	async fn settle() {
		tokio::time::sleep(Duration::from_millis(20)).await;
	}

	#[tokio::test]
	async fn unresolvable_songs_are_reported_and_skipped() {
		let s = setup(songs(&["broken1", "s2"]), PathBuf::new());
		s.player.play().await;

		let reports = s.reports.0.lock().unwrap().clone();
		assert_eq!(reports.len(), 1);
		assert!(reports[0].starts_with("[test-broken1]"), "{}", reports[0]);

		assert_eq!(s.backend.plays(), ["https://songs.test/s2"]);
		assert_eq!(s.player.current().await.unwrap().id(), "s2");
		assert_eq!(s.queue.current_index(), 1);
	}

	#[tokio::test]
	async fn completion_advances_and_plays_on() {
		let s = setup(songs(&["a", "b"]), PathBuf::new());
		s.player.play().await;

		s.backend.finish(0);
		settle().await;
		assert_eq!(s.backend.plays(), ["https://songs.test/a", "https://songs.test/b"]);
		assert_eq!(s.player.current().await.unwrap().id(), "b");

		// the end of the queue leaves the player idle
		s.backend.finish(1);
		settle().await;
		assert!(s.player.current().await.is_none());
		assert_eq!(s.backend.plays().len(), 2);

		s.player.play().await;
		assert!(s.player.paused());
		assert_eq!(s.backend.calls(), ["stop"]);
	}

	#[tokio::test]
	async fn stale_completions_are_ignored() {
		let s = setup(songs(&["a", "b", "c"]), PathBuf::new());
		s.player.play().await;
		s.player.next().await;
		assert_eq!(s.player.current().await.unwrap().id(), "b");

		// a ends because b replaced it
		s.backend.finish(0);
		settle().await;
		assert_eq!(s.player.current().await.unwrap().id(), "b");
		assert_eq!(s.queue.current_index(), 1);
		assert_eq!(s.backend.plays().len(), 2);
	}

	#[tokio::test]
	async fn navigation_stops_at_the_ends() {
		let s = setup(songs(&["a", "b"]), PathBuf::new());
		s.player.play().await;

		s.player.prev().await;
		assert_eq!(s.queue.current_index(), 0);
		assert_eq!(s.backend.plays().len(), 1);

		s.player.next().await;
		s.player.next().await;
		assert_eq!(s.queue.current_index(), 1);
		assert_eq!(s.backend.plays().len(), 2);

		s.player.prev().await;
		assert_eq!(s.player.current().await.unwrap().id(), "a");
	}

	#[tokio::test]
	async fn refused_playback_is_skipped() {
		let s = setup(songs(&["refused", "ok"]), PathBuf::new());
		s.player.play().await;

		assert_eq!(s.reports.0.lock().unwrap().len(), 1);
		assert_eq!(s.backend.plays(), ["https://songs.test/ok"]);
	}

	#[tokio::test]
	async fn force_play_restarts_the_cursor_song() {
		let s = setup(songs(&["a", "b"]), PathBuf::new());
		s.player.play().await;
		s.queue.set_current_index(1);

		// plain play keeps the current song
		s.player.play().await;
		assert_eq!(s.backend.plays().len(), 1);

		s.player.force_play().await;
		assert_eq!(s.backend.plays(), ["https://songs.test/a", "https://songs.test/b"]);
	}

	#[tokio::test]
	async fn paused_player_does_not_advance() {
		let s = setup(songs(&["a", "b"]), PathBuf::new());
		s.player.play().await;
		s.player.pause().await;
		assert!(s.player.paused());

		s.backend.finish(0);
		settle().await;
		assert_eq!(s.queue.current_index(), 1);
		assert_eq!(s.backend.plays().len(), 1);

		s.player.play().await;
		assert!(!s.player.paused());
		assert_eq!(s.backend.plays().len(), 2);
	}
}
