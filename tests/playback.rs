use std::{
	collections::HashSet,
	fs,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use async_trait::async_trait;
use ymbox::{
	backend::{Driver, Engine, Error, Event, Events, Result},
	player::{LogReporter, Player},
	queue::Queue,
	song::{fs::Store, youtube::YoutubeDl, Song, SongRef},
};

/// Behaves like an engine that starts every file instantly and only ends
/// one when told to.
#[derive(Default)]
struct Scripted {
	events: Mutex<Option<Events>>,
	loads: Mutex<Vec<String>>,
	refuse: Mutex<HashSet<String>>,
	paused: AtomicBool,
}

impl Scripted {
	fn send(&self, event: Event) {
		if let Some(events) = self.events.lock().unwrap().as_ref() {
			events.send(event).unwrap();
		}
	}

	fn loads(&self) -> Vec<String> {
		self.loads.lock().unwrap().clone()
	}
}

#[async_trait]
impl Driver for Scripted {
	fn name(&self) -> &str {
		"scripted"
	}

	async fn init(&self, events: Events) -> Result<()> {
		*self.events.lock().unwrap() = Some(events);
		Ok(())
	}

	async fn close(&self) -> Result<()> {
		self.events.lock().unwrap().take();
		Ok(())
	}

	async fn get_f64(&self, property: &str) -> Result<f64> {
		match property {
			"volume" => Ok(100.0),
			"time-pos" => Ok(12.5),
			"duration" => Ok(200.0),
			_ => Err(Error::Type(property.into())),
		}
	}

	async fn set_f64(&self, _: &str, _: f64) -> Result<()> {
		Ok(())
	}

	async fn get_bool(&self, _: &str) -> Result<bool> {
		Ok(self.paused.load(Ordering::SeqCst))
	}

	async fn set_bool(&self, _: &str, value: bool) -> Result<()> {
		self.paused.store(value, Ordering::SeqCst);
		self.send(Event::PropertyChange);
		Ok(())
	}

	async fn command(&self, args: &[&str]) -> Result<()> {
		if let ["loadfile", token, ..] = args {
			if self.refuse.lock().unwrap().contains(*token) {
				return Err(Error::Playback(format!("cannot open {token}")));
			}
			self.loads.lock().unwrap().push(token.to_string());
			self.send(Event::StartFile);
		}
		Ok(())
	}
}

struct Rig {
	driver: Arc<Scripted>,
	player: Arc<Player>,
	files: Vec<String>,
	_dir: tempfile::TempDir,
}

/// A queue of cached songs played through the scripted engine.
async fn rig(ids: &[&str]) -> Rig {
	let dir = tempfile::tempdir().unwrap();
	let store = Arc::new(Store::new(dir.path()));
	let yt = YoutubeDl::new("yt-dlp", Arc::clone(&store));
	let queue = Arc::new(Queue::new());

	let mut files = Vec::new();
	for id in ids {
		let song = yt.song(*id, *id);
		let file = song.file().unwrap();
		fs::create_dir_all(file.parent().unwrap()).unwrap();
		fs::write(&file, b"audio").unwrap();
		files.push(file.display().to_string());
		queue.insert(-1, song as SongRef);
	}

	let driver = Arc::new(Scripted::default());
	let backend = Engine::start(Arc::clone(&driver)).await.unwrap();
	let player = Player::new(Arc::new(backend), Arc::new(LogReporter), queue, store.position());

	Rig {
		driver,
		player,
		files,
		_dir: dir,
	}
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
	for _ in 0..200 {
		if cond() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("timed out waiting for {what}");
}

fn id_of(song: Option<SongRef>) -> Option<String> {
	song.map(|s| s.id().to_owned())
}

#[tokio::test]
async fn queue_plays_through_to_the_end() {
	let r = rig(&["a", "b", "c"]).await;
	r.player.force_play().await;
	assert_eq!(r.driver.loads(), &r.files[..1]);

	for n in 2..=3 {
		r.driver.send(Event::EndFile);
		eventually("the next file", || r.driver.loads().len() == n).await;
	}
	assert_eq!(r.driver.loads(), r.files);
	assert_eq!(id_of(r.player.current().await), Some("c".to_owned()));

	r.driver.send(Event::EndFile);
	for _ in 0..200 {
		if r.player.current().await.is_none() {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert!(r.player.current().await.is_none());
	assert_eq!(r.driver.loads().len(), 3);
}

#[tokio::test]
async fn unplayable_song_is_skipped() {
	let r = rig(&["a", "b", "c"]).await;
	r.driver.refuse.lock().unwrap().insert(r.files[1].clone());

	r.player.force_play().await;
	r.player.next().await;

	assert_eq!(r.driver.loads(), [r.files[0].clone(), r.files[2].clone()]);
	assert_eq!(id_of(r.player.current().await), Some("c".to_owned()));
}

#[tokio::test]
async fn pause_follows_the_engine() {
	let r = rig(&["a"]).await;
	r.player.force_play().await;
	eventually("playback", || !r.player.paused()).await;

	r.player.toggle_pause().await;
	eventually("pause", || r.player.paused()).await;

	r.player.play().await;
	eventually("resume", || !r.player.paused()).await;
	assert_eq!(r.driver.loads().len(), 1);

	assert_eq!(r.player.position().await, Duration::from_millis(12_500));
	assert_eq!(r.player.duration().await, Duration::from_secs(200));
}

#[tokio::test]
async fn ended_files_do_not_skip_a_fresh_start() {
	let r = rig(&["a", "b"]).await;
	r.player.force_play().await;

	// the user jumps ahead; the first file's end must not advance again
	r.player.next().await;
	r.driver.send(Event::EndFile);
	tokio::time::sleep(Duration::from_millis(50)).await;

	assert_eq!(r.driver.loads(), r.files);
	assert_eq!(id_of(r.player.current().await), Some("b".to_owned()));
}
