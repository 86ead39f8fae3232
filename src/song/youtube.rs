use std::{
	fmt, io,
	path::PathBuf,
	sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use hyper::Uri;
use scraper::{Html, Selector};
use tokio::process::Command;

use crate::codec::{self, Width};

use super::{
	fs::Store,
	http::{self, Client},
	Error, Song,
};

pub const NS: &str = "yt";

/// Tooling shared by every youtube song: where `yt-dlp` lives, where songs
/// are cached and the HTTP client used for page lookups.
#[derive(Debug)]
pub struct YoutubeDl {
	pub executable: PathBuf,
	pub store: Arc<Store>,
	pub http: Client,
}

impl YoutubeDl {
	pub fn new(executable: impl Into<PathBuf>, store: Arc<Store>) -> Arc<Self> {
		Arc::new(Self {
			executable: executable.into(),
			store,
			http: http::client(),
		})
	}

	pub fn song(self: &Arc<Self>, id: impl Into<String>, title: impl Into<String>) -> Arc<YoutubeSong> {
		let id = id.into();
		Arc::new(YoutubeSong {
			file: self.store.path(NS, &id),
			id,
			title: RwLock::new(title.into()),
			dl: Arc::clone(self),
		})
	}

	/// Reads the payload written by [`YoutubeSong::marshal`].
	pub fn unmarshal(self: &Arc<Self>, r: &mut dyn io::Read) -> io::Result<Arc<YoutubeSong>> {
		let id = codec::read_str(r, Width::U8)?;
		let title = codec::read_str(r, Width::U16)?;
		Ok(self.song(id, title))
	}
}

pub struct YoutubeSong {
	id: String,
	title: RwLock<String>,
	file: PathBuf,
	dl: Arc<YoutubeDl>,
}

impl fmt::Debug for YoutubeSong {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("YoutubeSong")
			.field("id", &self.id)
			.field("title", &self.title())
			.finish()
	}
}

fn page(id: &str) -> Result<Uri, Error> {
	Ok(format!("https://www.youtube.com/watch?v={id}").parse()?)
}

/// Extracts the document title without the site suffix.
fn page_title(html: &str) -> Option<String> {
	let selector = Selector::parse("title").expect("Error parsing static title selector");
	let doc = Html::parse_document(html);

	let title: String = doc.select(&selector).next()?.text().collect();
	let title = title.trim();
	let title = title.strip_suffix("- YouTube").unwrap_or(title).trim();

	(!title.is_empty()).then(|| title.to_owned())
}

#[async_trait]
impl Song for YoutubeSong {
	fn ns(&self) -> &str {
		NS
	}

	fn id(&self) -> &str {
		&self.id
	}

	fn title(&self) -> String {
		self.title
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}

	fn set_title(&self, title: String) {
		*self.title.write().unwrap_or_else(PoisonError::into_inner) = title;
	}

	async fn update_title(&self) -> Result<(), Error> {
		let res = http::get(&self.dl.http, page(&self.id)?).await?;
		let body = hyper::body::to_bytes(res.into_body()).await?;

		let title = page_title(&String::from_utf8_lossy(&body))
			.ok_or_else(|| Error::EmptyTitle(self.id.clone()))?;
		self.set_title(title);

		Ok(())
	}

	fn local(&self) -> bool {
		self.file.is_file()
	}

	async fn url(&self) -> Result<Uri, Error> {
		let out = Command::new(&self.dl.executable)
			.args(["-g", "-f", "bestaudio", "--no-playlist"])
			.arg(page(&self.id)?.to_string())
			.kill_on_drop(true)
			.output()
			.await?;

		Error::check(&self.dl.executable, out.status, &out.stderr)?;

		let stdout = String::from_utf8_lossy(&out.stdout);
		Ok(stdout.lines().next().unwrap_or_default().trim().parse()?)
	}

	fn file(&self) -> Result<PathBuf, Error> {
		Ok(self.file.clone())
	}

	fn marshal(&self, w: &mut dyn io::Write) -> io::Result<()> {
		codec::write_str(w, &self.id, Width::U8)?;
		codec::write_str(w, &self.title(), Width::U16)
	}

	fn page_url(&self) -> Result<Uri, Error> {
		page(&self.id)
	}
}
