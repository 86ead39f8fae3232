//! Playback engines.
//!
//! A [`Driver`] speaks to one concrete engine (an `mpv` process over IPC,
//! or the in-process decoder) in terms of named properties and commands.
//! [`Engine`] turns any driver into a [`Backend`], the capability the
//! player uses, and pairs every `play` with the end of that very file.

use std::{
	collections::VecDeque,
	sync::{Arc, Mutex, PoisonError},
	time::Duration,
};

use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

#[cfg(feature = "embedded")]
pub mod embedded;
pub mod ipc;

/// How long `play` waits for the engine to report the file started.
pub const START_TIMEOUT: Duration = Duration::from_secs(15);

/// The three engine events everything else is normalized into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
	EndFile,
	StartFile,
	/// The pause state may have changed.
	PropertyChange,
}

pub type Events = mpsc::UnboundedSender<Event>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("could not connect to {path}: {source}")]
	Connect {
		path: String,
		source: std::io::Error,
	},
	#[error("malformed frame: {0}")]
	Json(#[from] serde_json::Error),
	#[error("engine replied: {0}")]
	Response(String),
	#[error("property {0} has an unexpected type")]
	Type(String),
	#[error("timed out waiting for {0}")]
	Timeout(&'static str),
	#[error("backend closed")]
	Closed,
	#[error("playback error: {0}")]
	Playback(String),
	#[error("no backend available ({})", .0.join("; "))]
	Unavailable(Vec<String>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Reference point of a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
	Start,
	Current,
}

/// Low level engine control in terms of named properties (`pause`,
/// `volume`, `time-pos`, `percent-pos`, `duration`) and commands
/// (`loadfile <token> replace`, `stop`).
#[async_trait]
pub trait Driver: Send + Sync {
	fn name(&self) -> &str;

	/// Starts the engine. Events must be sent in the order they happen.
	async fn init(&self, events: Events) -> Result<()>;

	async fn close(&self) -> Result<()>;

	async fn get_f64(&self, property: &str) -> Result<f64>;

	async fn set_f64(&self, property: &str, value: f64) -> Result<()>;

	async fn get_bool(&self, property: &str) -> Result<bool>;

	async fn set_bool(&self, property: &str, value: bool) -> Result<()>;

	async fn command(&self, args: &[&str]) -> Result<()>;
}

#[async_trait]
impl<D: Driver + ?Sized> Driver for Arc<D> {
	fn name(&self) -> &str {
		(**self).name()
	}

	async fn init(&self, events: Events) -> Result<()> {
		(**self).init(events).await
	}

	async fn close(&self) -> Result<()> {
		(**self).close().await
	}

	async fn get_f64(&self, property: &str) -> Result<f64> {
		(**self).get_f64(property).await
	}

	async fn set_f64(&self, property: &str, value: f64) -> Result<()> {
		(**self).set_f64(property, value).await
	}

	async fn get_bool(&self, property: &str) -> Result<bool> {
		(**self).get_bool(property).await
	}

	async fn set_bool(&self, property: &str, value: bool) -> Result<()> {
		(**self).set_bool(property, value).await
	}

	async fn command(&self, args: &[&str]) -> Result<()> {
		(**self).command(args).await
	}
}

/// What the player needs from a playback engine.
#[async_trait]
pub trait Backend: Send + Sync {
	/// Starts playing `token` (a file path or url). The receiver fires once
	/// this file has ended.
	async fn play(&self, token: &str) -> Result<oneshot::Receiver<()>>;

	async fn stop(&self);

	fn paused(&self) -> bool;

	async fn pause(&self, pause: bool);

	async fn toggle_pause(&self) {
		self.pause(!self.paused()).await;
	}

	/// Volume in `0..=1`.
	fn volume(&self) -> f64;

	async fn set_volume(&self, volume: f64);

	async fn increase_volume(&self, delta: f64) {
		self.set_volume(self.volume() + delta).await;
	}

	/// Seeks by (`Current`) or to (`Start`) `seconds`.
	async fn seek(&self, seconds: f64, whence: Whence);

	/// Seeks to a fraction (`0..=1`) of the file.
	async fn seek_to(&self, fraction: f64);

	async fn position(&self) -> Duration;

	async fn duration(&self) -> Duration;

	async fn close(&self) -> Result<()>;
}

fn logged(res: Result<()>, what: &str) {
	if let Err(e) = res {
		warn!("{what}: {e}");
	}
}

fn seconds(v: f64) -> Duration {
	if v.is_finite() && v > 0.0 {
		Duration::from_secs_f64(v)
	} else {
		Duration::ZERO
	}
}

#[derive(Debug)]
struct State {
	volume: f64,
	paused: bool,
}

/// A [`Backend`] on top of any [`Driver`].
pub struct Engine<D> {
	driver: Arc<D>,
	state: Arc<Mutex<State>>,
	/// One completion receiver per started file. Holding the lock
	/// serializes `play` calls.
	starts: tokio::sync::Mutex<mpsc::UnboundedReceiver<oneshot::Receiver<()>>>,
}

impl<D: Driver + 'static> Engine<D> {
	/// Initializes `driver` and starts listening to its events.
	pub async fn start(driver: D) -> Result<Self> {
		let driver = Arc::new(driver);
		let (events, rx) = mpsc::unbounded_channel();
		driver.init(events).await?;

		let volume = match driver.get_f64("volume").await {
			Ok(v) => v / 100.0,
			Err(e) => {
				warn!("volume: {e}");
				1.0
			}
		};

		let state = Arc::new(Mutex::new(State {
			volume,
			paused: true,
		}));
		let (starts_sx, starts) = mpsc::unbounded_channel();
		tokio::spawn(listen(Arc::clone(&driver), Arc::clone(&state), rx, starts_sx));

		info!("{} backend ready", driver.name());
		Ok(Self {
			driver,
			state,
			starts: tokio::sync::Mutex::new(starts),
		})
	}

	fn state(&self) -> std::sync::MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	async fn set_time(&self, seconds: f64) {
		logged(self.driver.set_f64("time-pos", seconds.max(0.0)).await, "time-pos");
	}

	async fn get_duration(&self, property: &str) -> Duration {
		match self.driver.get_f64(property).await {
			Ok(v) => seconds(v),
			Err(e) => {
				debug!("{property}: {e}");
				Duration::ZERO
			}
		}
	}
}

/// Pairs starts with ends: every start queues a completion sender, every
/// end fires the oldest one.
async fn listen<D: Driver>(
	driver: Arc<D>,
	state: Arc<Mutex<State>>,
	mut events: mpsc::UnboundedReceiver<Event>,
	starts: mpsc::UnboundedSender<oneshot::Receiver<()>>,
) {
	let mut dones: VecDeque<oneshot::Sender<()>> = VecDeque::new();
	let mut actual_pause = false;

	while let Some(event) = events.recv().await {
		match event {
			Event::EndFile => match dones.pop_front() {
				Some(done) => {
					let _ = done.send(());
				}
				None => debug!("end of file without a started file"),
			},
			Event::StartFile => {
				if !actual_pause {
					state.lock().unwrap_or_else(PoisonError::into_inner).paused = false;
				}

				let (done, rx) = oneshot::channel();
				dones.push_back(done);
				let _ = starts.send(rx);
			}
			Event::PropertyChange => match driver.get_bool("pause").await {
				Ok(paused) => {
					actual_pause = paused;
					state.lock().unwrap_or_else(PoisonError::into_inner).paused = paused;
				}
				Err(e) => warn!("pause: {e}"),
			},
		}
	}

	debug!("{} event stream ended", driver.name());
}

#[async_trait]
impl<D: Driver + 'static> Backend for Engine<D> {
	async fn play(&self, token: &str) -> Result<oneshot::Receiver<()>> {
		let mut starts = self.starts.lock().await;

		// starts nobody waited for, e.g. after a timed out play
		while starts.try_recv().is_ok() {}

		self.driver.command(&["loadfile", token, "replace"]).await?;

		match tokio::time::timeout(START_TIMEOUT, starts.recv()).await {
			Ok(Some(done)) => Ok(done),
			Ok(None) => Err(Error::Closed),
			Err(_) => Err(Error::Timeout("start-file")),
		}
	}

	async fn stop(&self) {
		logged(self.driver.command(&["stop"]).await, "stop");
	}

	fn paused(&self) -> bool {
		self.state().paused
	}

	async fn pause(&self, pause: bool) {
		logged(self.driver.set_bool("pause", pause).await, "pause");
	}

	fn volume(&self) -> f64 {
		self.state().volume
	}

	async fn set_volume(&self, volume: f64) {
		let volume = volume.clamp(0.0, 1.0);
		match self.driver.set_f64("volume", volume * 100.0).await {
			Ok(()) => self.state().volume = volume,
			Err(e) => warn!("volume: {e}"),
		}
	}

	async fn seek(&self, seconds: f64, whence: Whence) {
		if whence == Whence::Start {
			return self.set_time(seconds).await;
		}
		if seconds == 0.0 {
			return;
		}

		match self.driver.get_f64("time-pos").await {
			Ok(current) => self.set_time(current + seconds).await,
			Err(e) => warn!("time-pos: {e}"),
		}
	}

	async fn seek_to(&self, fraction: f64) {
		let percent = fraction.clamp(0.0, 1.0) * 100.0;
		logged(self.driver.set_f64("percent-pos", percent).await, "percent-pos");
	}

	async fn position(&self) -> Duration {
		self.get_duration("time-pos").await
	}

	async fn duration(&self) -> Duration {
		self.get_duration("duration").await
	}

	async fn close(&self) -> Result<()> {
		self.driver.close().await
	}
}

/// A named, not yet initialized backend.
pub struct Candidate {
	name: &'static str,
	start: BoxFuture<'static, Result<Arc<dyn Backend>>>,
}

impl Candidate {
	pub fn new<D: Driver + 'static>(name: &'static str, driver: D) -> Self {
		Self {
			name,
			start: async move { Ok(Arc::new(Engine::start(driver).await?) as Arc<dyn Backend>) }.boxed(),
		}
	}
}

/// Initializes the candidates in order and returns the first that starts.
pub async fn probe(candidates: impl IntoIterator<Item = Candidate>) -> Result<Arc<dyn Backend>> {
	let mut failures = Vec::new();
	for Candidate { name, start } in candidates {
		match start.await {
			Ok(backend) => {
				info!("using {name} backend");
				return Ok(backend);
			}
			Err(e) => {
				warn!("{name} backend unavailable: {e}");
				failures.push(format!("{name}: {e}"));
			}
		}
	}

	Err(Error::Unavailable(failures))
}
