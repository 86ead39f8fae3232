use std::{env, path::PathBuf, time::Duration};

use clap::{ArgAction, Parser, ValueEnum};

/// Which playback engine to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
	/// The first engine that starts, in-process first.
	Auto,
	Embedded,
	Mpv,
}

#[derive(Debug, Parser)]
#[command(version, about = "A jukebox that caches and plays YouTube audio")]
pub struct Args {
	/// State directory [default: <cache dir>/ymbox]
	#[arg(long, env = "YMBOX_STORE")]
	pub store: Option<PathBuf>,

	/// Workers per background stage
	#[arg(long, env = "YMBOX_CONCURRENCY", default_value_t = 8)]
	pub concurrency: usize,

	/// Save changes (and cursor moves) every few seconds
	#[arg(long, env = "YMBOX_AUTOSAVE", default_value_t = true, action = ArgAction::Set)]
	pub autosave: bool,

	#[arg(long, env = "YMBOX_BACKEND", value_enum, default_value_t = BackendKind::Auto)]
	pub backend: BackendKind,

	#[arg(long, env = "YMBOX_MPV", default_value = "mpv")]
	pub mpv: PathBuf,

	#[arg(long = "yt-dlp", env = "YMBOX_YT_DLP", default_value = "yt-dlp")]
	pub yt_dlp: PathBuf,

	#[arg(long, env = "YMBOX_FFMPEG", default_value = "ffmpeg")]
	pub ffmpeg: PathBuf,

	/// Seconds between downloads, and between title lookups
	#[arg(long, env = "YMBOX_RATE_INTERVAL", default_value_t = 5)]
	pub rate_interval: u64,

	/// Start playing once loaded
	#[arg(long, env = "YMBOX_PLAY")]
	pub play: bool,

	/// YouTube video ids to append to the queue
	pub ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub store: PathBuf,
	pub concurrency: usize,
	pub autosave: bool,
	pub backend: BackendKind,
	pub mpv: PathBuf,
	pub yt_dlp: PathBuf,
	pub ffmpeg: PathBuf,
	pub rate_interval: Duration,
	pub play: bool,
	pub enqueue: Vec<String>,
}

impl Config {
	pub fn default_store() -> PathBuf {
		dirs::cache_dir().unwrap_or_else(env::temp_dir).join("ymbox")
	}
}

impl From<Args> for Config {
	fn from(args: Args) -> Self {
		Self {
			store: args.store.unwrap_or_else(Self::default_store),
			concurrency: args.concurrency.max(1),
			autosave: args.autosave,
			backend: args.backend,
			mpv: args.mpv,
			yt_dlp: args.yt_dlp,
			ffmpeg: args.ffmpeg,
			rate_interval: Duration::from_secs(args.rate_interval.max(1)),
			play: args.play,
			enqueue: args.ids,
		}
	}
}
