//! `mpv` as a child process, controlled over its JSON IPC endpoint.
//!
//! Frames are single lines of JSON. Requests carry a non-zero
//! `request_id`; frames without an `event` name are the responses to
//! them, frames with one are engine events.

use std::{
	collections::HashMap,
	io,
	path::{Path, PathBuf},
	process::Stdio,
	sync::{Arc, Mutex, OnceLock, PoisonError},
	time::Duration,
};

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
	io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
	process::{Child, Command},
	sync::oneshot,
};

use super::{Driver, Error, Event, Events, Result};

const CONNECT_INTERVAL: Duration = Duration::from_millis(25);
const CONNECT_TRIES: usize = 100;

#[derive(Debug, Serialize)]
struct Request<'a> {
	command: &'a [Value],
	request_id: u16,
}

#[derive(Debug, Default, Deserialize)]
struct Frame {
	#[serde(default)]
	event: Option<String>,
	#[serde(default)]
	error: Option<String>,
	#[serde(default)]
	data: Option<Value>,
	#[serde(default)]
	request_id: Option<u16>,
}

#[derive(Debug, Default)]
struct Pending {
	waiting: HashMap<u16, oneshot::Sender<Frame>>,
	closed: bool,
}

/// Request/response correlation over one duplex byte stream.
pub struct Rpc {
	writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
	next: Mutex<u16>,
	pending: Arc<Mutex<Pending>>,
}

impl Rpc {
	/// Spawns the frame reader; events are forwarded to `events`.
	pub fn new<R, W>(reader: R, writer: W, events: Events) -> Self
	where
		R: AsyncRead + Send + Unpin + 'static,
		W: AsyncWrite + Send + Unpin + 'static,
	{
		let pending = Arc::new(Mutex::new(Pending::default()));
		tokio::spawn(read_frames(reader, Arc::clone(&pending), events));

		Self {
			writer: tokio::sync::Mutex::new(Box::new(writer)),
			next: Mutex::new(0),
			pending,
		}
	}

	fn next_id(&self) -> u16 {
		let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
		*next = next.wrapping_add(1);
		if *next == 0 {
			*next = 1;
		}
		*next
	}

	fn pending(&self) -> std::sync::MutexGuard<'_, Pending> {
		self.pending.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Sends `command` and waits for the response carrying its id.
	pub async fn request(&self, command: &[Value]) -> Result<Value> {
		let id = self.next_id();
		let (sx, rx) = oneshot::channel();
		{
			let mut pending = self.pending();
			if pending.closed {
				return Err(Error::Closed);
			}
			pending.waiting.insert(id, sx);
		}

		let mut line = serde_json::to_vec(&Request {
			command,
			request_id: id,
		})?;
		line.push(b'\n');

		let sent = {
			let mut writer = self.writer.lock().await;
			match writer.write_all(&line).await {
				Ok(()) => writer.flush().await,
				Err(e) => Err(e),
			}
		};
		if let Err(e) = sent {
			self.pending().waiting.remove(&id);
			return Err(e.into());
		}

		let frame = rx.await.map_err(|_| Error::Closed)?;
		match frame.error.as_deref() {
			None | Some("success") => Ok(frame.data.unwrap_or(Value::Null)),
			Some(e) => Err(Error::Response(e.to_owned())),
		}
	}
}

fn event(name: &str) -> Option<Event> {
	match name {
		"end-file" => Some(Event::EndFile),
		"start-file" => Some(Event::StartFile),
		"pause" | "unpause" | "property-change" => Some(Event::PropertyChange),
		_ => None,
	}
}

async fn read_frames<R: AsyncRead + Unpin>(reader: R, pending: Arc<Mutex<Pending>>, events: Events) {
	let mut lines = BufReader::new(reader).lines();
	loop {
		let line = match lines.next_line().await {
			Ok(Some(line)) => line,
			Ok(None) => break,
			Err(e) => {
				warn!("mpv ipc: {e}");
				break;
			}
		};
		if line.trim().is_empty() {
			continue;
		}

		let frame: Frame = match serde_json::from_str(&line) {
			Ok(frame) => frame,
			Err(e) => {
				warn!("malformed frame from mpv: {e}");
				continue;
			}
		};

		if let Some(name) = frame.event.as_deref() {
			if let Some(event) = event(name) {
				let _ = events.send(event);
			}
			continue;
		}

		let waiter = frame
			.request_id
			.and_then(|id| pending.lock().unwrap_or_else(PoisonError::into_inner).waiting.remove(&id));
		match waiter {
			Some(waiter) => {
				let _ = waiter.send(frame);
			}
			None => debug!("unclaimed response {:?}", frame.request_id),
		}
	}

	// waiters see their sender dropped
	let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
	pending.closed = true;
	pending.waiting.clear();
}

/// The name mpv is told to listen on.
#[cfg(not(windows))]
fn endpoint_name(path: &Path) -> String {
	path.display().to_string()
}

#[cfg(windows)]
fn endpoint_name(path: &Path) -> String {
	const PREFIX: &str = r"\\.\pipe\";
	let path = path.display().to_string();
	if path.starts_with(PREFIX) {
		return path;
	}
	format!("{PREFIX}{}", path.replace('/', "\\").trim_start_matches('\\'))
}

#[cfg(not(windows))]
async fn connect(path: &Path) -> io::Result<tokio::net::UnixStream> {
	tokio::net::UnixStream::connect(path).await
}

#[cfg(windows)]
async fn connect(path: &Path) -> io::Result<tokio::net::windows::named_pipe::NamedPipeClient> {
	tokio::net::windows::named_pipe::ClientOptions::new().open(endpoint_name(path))
}

/// An `mpv --idle` child process.
pub struct Mpv {
	executable: PathBuf,
	endpoint: PathBuf,
	flags: Vec<String>,
	child: tokio::sync::Mutex<Option<Child>>,
	rpc: OnceLock<Rpc>,
}

impl Mpv {
	pub fn new(executable: impl Into<PathBuf>, endpoint: impl Into<PathBuf>, flags: Vec<String>) -> Self {
		Self {
			executable: executable.into(),
			endpoint: endpoint.into(),
			flags,
			child: tokio::sync::Mutex::new(None),
			rpc: OnceLock::new(),
		}
	}

	fn rpc(&self) -> Result<&Rpc> {
		self.rpc.get().ok_or(Error::Closed)
	}

	async fn get(&self, property: &str) -> Result<Value> {
		self.rpc()?
			.request(&["get_property".into(), property.into()])
			.await
	}

	async fn set(&self, property: &str, value: Value) -> Result<()> {
		self.rpc()?
			.request(&["set_property".into(), property.into(), value])
			.await
			.map(drop)
	}
}

#[async_trait]
impl Driver for Mpv {
	fn name(&self) -> &str {
		"mpv"
	}

	async fn init(&self, events: Events) -> Result<()> {
		if let Some(parent) = self.endpoint.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		#[cfg(not(windows))]
		{
			// a socket left behind by a crashed instance
			let _ = tokio::fs::remove_file(&self.endpoint).await;
		}

		let mut child = Command::new(&self.executable)
			.args(["--no-video", "--idle", "--no-config"])
			.arg(format!("--input-ipc-server={}", endpoint_name(&self.endpoint)))
			.args(&self.flags)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.kill_on_drop(true)
			.spawn()?;

		let mut tries = 0;
		let conn = loop {
			tokio::time::sleep(CONNECT_INTERVAL).await;
			match connect(&self.endpoint).await {
				Ok(conn) => break conn,
				Err(source) if tries >= CONNECT_TRIES => {
					let _ = child.kill().await;
					return Err(Error::Connect {
						path: endpoint_name(&self.endpoint),
						source,
					});
				}
				Err(_) => tries += 1,
			}
		};

		let (reader, writer) = tokio::io::split(conn);
		let rpc = Rpc::new(reader, writer, events);
		if let Err(e) = rpc.request(&["observe_property".into(), 1.into(), "pause".into()]).await {
			warn!("observe pause: {e}");
		}

		if self.rpc.set(rpc).is_err() {
			warn!("mpv initialized twice");
		}
		*self.child.lock().await = Some(child);

		Ok(())
	}

	async fn close(&self) -> Result<()> {
		match self.child.lock().await.take() {
			Some(mut child) => Ok(child.kill().await?),
			None => Ok(()),
		}
	}

	async fn get_f64(&self, property: &str) -> Result<f64> {
		match self.get(property).await? {
			Value::Null => Ok(0.0),
			v => v.as_f64().ok_or_else(|| Error::Type(property.to_owned())),
		}
	}

	async fn set_f64(&self, property: &str, value: f64) -> Result<()> {
		self.set(property, value.into()).await
	}

	async fn get_bool(&self, property: &str) -> Result<bool> {
		self.get(property)
			.await?
			.as_bool()
			.ok_or_else(|| Error::Type(property.to_owned()))
	}

	async fn set_bool(&self, property: &str, value: bool) -> Result<()> {
		self.set(property, value.into()).await
	}

	async fn command(&self, args: &[&str]) -> Result<()> {
		let command: Vec<Value> = args.iter().map(|&a| a.into()).collect();
		self.rpc()?.request(&command).await.map(drop)
	}
}
