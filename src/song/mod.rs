use std::{fmt, io, path::PathBuf, process::ExitStatus, sync::Arc};

use async_trait::async_trait;
use hyper::Uri;

pub mod download;
pub mod fs;
pub mod http;
pub mod youtube;

/// A playable song from any source namespace.
///
/// Songs are shared between playlists, the queue and the background
/// pipeline, so every method takes `&self` and the title is interior
/// mutable.
#[async_trait]
pub trait Song: fmt::Debug + Send + Sync {
	/// Source namespace, e.g. `yt`.
	fn ns(&self) -> &str;

	/// Identifier unique within [`Song::ns`].
	fn id(&self) -> &str;

	fn title(&self) -> String;

	fn set_title(&self, title: String);

	/// Fetches the title from the remote source and stores it.
	async fn update_title(&self) -> Result<(), Error>;

	/// Whether the song has been cached at [`Song::file`].
	fn local(&self) -> bool;

	/// A (possibly temporary) streaming url.
	async fn url(&self) -> Result<Uri, Error>;

	/// Where the cached copy lives (or will live).
	fn file(&self) -> Result<PathBuf, Error>;

	/// Writes the namespace specific payload. The namespace itself is
	/// written by the caller.
	fn marshal(&self, w: &mut dyn io::Write) -> io::Result<()>;

	/// The human facing page for this song.
	fn page_url(&self) -> Result<Uri, Error>;
}

pub type SongRef = Arc<dyn Song>;

/// Identity of a song across playlists and the queue.
#[inline]
pub fn global_id(song: &(impl Song + ?Sized)) -> String {
	format!("{}-{}", song.ns(), song.id())
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("IO error: {0}")]
	Io(#[from] io::Error),
	#[error("{program} exited with {status}: {stderr}")]
	Process {
		program: String,
		status: ExitStatus,
		stderr: String,
	},
	#[error("HTTP error: {0}")]
	Http(#[from] hyper::Error),
	#[error("HTTP request error: {0}")]
	Request(#[from] hyper::http::Error),
	#[error("unexpected HTTP status {0}")]
	Status(hyper::StatusCode),
	#[error("too many redirects")]
	Redirects,
	#[error("invalid uri: {0}")]
	Uri(#[from] hyper::http::uri::InvalidUri),
	#[error("{0}: received empty title")]
	EmptyTitle(String),
}

impl Error {
	/// Maps a finished child process onto `Ok` or [`Error::Process`].
	pub(crate) fn check(program: &std::path::Path, status: ExitStatus, stderr: &[u8]) -> Result<(), Self> {
		if status.success() {
			return Ok(());
		}

		Err(Self::Process {
			program: program.display().to_string(),
			status,
			stderr: String::from_utf8_lossy(stderr).trim().to_owned(),
		})
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use std::{
		sync::{
			atomic::{AtomicBool, AtomicUsize, Ordering},
			PoisonError, RwLock,
		},
		time::Duration,
	};

	use super::*;
	use crate::codec::{self, Width};

	pub const NS: &str = "test";

	/// In-memory song whose resolution outcome is scripted.
	#[derive(Debug)]
	pub struct TestSong {
		id: String,
		title: RwLock<String>,
		pub local: AtomicBool,
		pub broken: AtomicBool,
		/// Title lookups take 100ms.
		pub slow_lookup: AtomicBool,
		pub lookups: AtomicUsize,
	}

	impl TestSong {
		pub fn new(id: &str) -> Arc<Self> {
			Self::titled(id, "")
		}

		pub fn titled(id: &str, title: &str) -> Arc<Self> {
			Arc::new(Self {
				id: id.to_owned(),
				title: RwLock::new(title.to_owned()),
				local: AtomicBool::new(false),
				broken: AtomicBool::new(false),
				slow_lookup: AtomicBool::new(false),
				lookups: AtomicUsize::new(0),
			})
		}

		/// A song whose url can never be resolved.
		pub fn broken(id: &str) -> Arc<Self> {
			let song = Self::new(id);
			song.broken.store(true, Ordering::SeqCst);
			song
		}

		pub fn unmarshal(r: &mut dyn io::Read) -> io::Result<SongRef> {
			let id = codec::read_str(r, Width::U8)?;
			let title = codec::read_str(r, Width::U16)?;
			Ok(Self::titled(&id, &title))
		}
	}

	#[async_trait]
	impl Song for TestSong {
		fn ns(&self) -> &str {
			NS
		}

		fn id(&self) -> &str {
			&self.id
		}

		fn title(&self) -> String {
			self.title.read().unwrap_or_else(PoisonError::into_inner).clone()
		}

		fn set_title(&self, title: String) {
			*self.title.write().unwrap_or_else(PoisonError::into_inner) = title;
		}

		async fn update_title(&self) -> Result<(), Error> {
			self.lookups.fetch_add(1, Ordering::SeqCst);
			if self.slow_lookup.load(Ordering::SeqCst) {
				tokio::time::sleep(Duration::from_millis(100)).await;
			}
			if self.broken.load(Ordering::SeqCst) {
				return Err(Error::EmptyTitle(self.id.clone()));
			}
			self.set_title(format!("title of {}", self.id));
			Ok(())
		}

		fn local(&self) -> bool {
			self.local.load(Ordering::SeqCst)
		}

		async fn url(&self) -> Result<Uri, Error> {
			if self.broken.load(Ordering::SeqCst) {
				return Err(io::Error::new(io::ErrorKind::NotFound, "unresolvable").into());
			}
			Ok(format!("https://songs.test/{}", self.id).parse()?)
		}

		fn file(&self) -> Result<PathBuf, Error> {
			Ok(PathBuf::from(format!("/cache/{}", self.id)))
		}

		fn marshal(&self, w: &mut dyn io::Write) -> io::Result<()> {
			codec::write_str(w, &self.id, Width::U8)?;
			codec::write_str(w, &self.title(), Width::U16)
		}

		fn page_url(&self) -> Result<Uri, Error> {
			Ok(format!("https://songs.test/page/{}", self.id).parse()?)
		}
	}
}
