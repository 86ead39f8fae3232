use std::{
	fs,
	path::{Path, PathBuf},
	process::Stdio,
};

use hyper::body::HttpBody;
use tokio::{
	io::AsyncWriteExt,
	process::{ChildStdin, Command},
};

use super::{
	fs::temp_file,
	http::{self, Client},
	Error, Song,
};

/// Caches remote songs as local adts files.
#[derive(Debug, Clone)]
pub struct Downloader {
	pub ffmpeg: PathBuf,
	pub http: Client,
}

impl Downloader {
	pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
		Self {
			ffmpeg: ffmpeg.into(),
			http: http::client(),
		}
	}

	/// Streams the song's remote audio through ffmpeg into its cache
	/// location. The destination only ever appears complete.
	pub async fn download(&self, song: &dyn Song) -> Result<(), Error> {
		let file = song.file()?;
		if let Some(parent) = file.parent() {
			fs::create_dir_all(parent)?;
		}
		let uri = song.url().await?;

		let tmp = temp_file(&file);
		match self.transcode(uri, &tmp).await {
			Ok(()) => fs::rename(&tmp, &file).map_err(|e| {
				let _ = fs::remove_file(&tmp);
				Error::from(e)
			}),
			Err(e) => {
				let _ = fs::remove_file(&tmp);
				Err(e)
			}
		}
	}

	async fn transcode(&self, uri: hyper::Uri, dest: &Path) -> Result<(), Error> {
		let out = fs::File::create(dest)?;
		let res = http::get(&self.http, uri).await?;

		let mut child = Command::new(&self.ffmpeg)
			.args(["-loglevel", "error", "-i", "-", "-vn", "-f", "adts", "-"])
			.stdin(Stdio::piped())
			.stdout(Stdio::from(out))
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn()?;

		let stdin = child.stdin.take().ok_or_else(|| {
			std::io::Error::new(std::io::ErrorKind::BrokenPipe, "ffmpeg stdin unavailable")
		})?;

		let (pumped, output) = tokio::join!(pump(res.into_body(), stdin), child.wait_with_output());
		let output = output?;

		Error::check(&self.ffmpeg, output.status, &output.stderr)?;
		pumped
	}
}

async fn pump(mut body: hyper::Body, mut stdin: ChildStdin) -> Result<(), Error> {
	while let Some(chunk) = body.data().await {
		stdin.write_all(&chunk?).await?;
	}
	stdin.shutdown().await?;

	Ok(())
}
