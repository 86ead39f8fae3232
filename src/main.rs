use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use ymbox::{
	backend::{self, ipc::Mpv, Candidate},
	collection::{self, pipeline::Pipeline, Collection},
	config::{Args, BackendKind, Config},
	player::{LogReporter, Player},
	queue::Queue,
	scheduler::ratelimit,
	song::{
		download::Downloader,
		fs::Store,
		youtube::{self, YoutubeDl},
		SongRef,
	},
};

fn candidates(config: &Config, store: &Store) -> Vec<Candidate> {
	let mut list = Vec::new();

	#[cfg(feature = "embedded")]
	{
		if matches!(config.backend, BackendKind::Auto | BackendKind::Embedded) {
			list.push(Candidate::new("embedded", backend::embedded::Embedded::new()));
		}
	}
	#[cfg(not(feature = "embedded"))]
	{
		if config.backend == BackendKind::Embedded {
			warn!("built without the embedded backend");
		}
	}

	if matches!(config.backend, BackendKind::Auto | BackendKind::Mpv) {
		list.push(Candidate::new("mpv", Mpv::new(&config.mpv, store.ipc(), Vec::new())));
	}

	list
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

	let config = Config::from(Args::parse());
	let store = Arc::new(Store::new(&config.store));
	let queue = Arc::new(Queue::new());
	let collection = Collection::new(Arc::clone(&store), Arc::clone(&queue), config.autosave);

	let yt = YoutubeDl::new(&config.yt_dlp, Arc::clone(&store));
	collection.register_unmarshaler(youtube::NS, {
		let yt = Arc::clone(&yt);
		move |r| Ok(yt.unmarshal(r)? as SongRef)
	});

	match collection.init() {
		Ok(()) => {}
		Err(collection::Error::UnresolvedSongs(ids)) => {
			warn!("dropped {} unresolved song reference(s): {}", ids.len(), ids.join(", "))
		}
		Err(e) => return Err(e.into()),
	}

	collection.run(Pipeline {
		concurrency: config.concurrency,
		downloads: ratelimit(1, config.rate_interval),
		metadata: ratelimit(1, config.rate_interval),
		cache: Arc::new(Downloader::new(&config.ffmpeg)),
	});

	for id in &config.enqueue {
		collection.queue_song(-1, yt.song(id.as_str(), ""));
	}

	let backend = backend::probe(candidates(&config, &store)).await?;
	let player = Player::new(backend, Arc::new(LogReporter), Arc::clone(&queue), store.position());

	if let Err(e) = player.load_position().await {
		warn!("Error restoring position: {e}");
	}
	if config.play {
		player.play().await;
	}

	info!(
		"{} playlist(s), {} queued, state in {}",
		collection.list().len(),
		queue.len(),
		store.dir().display()
	);

	tokio::signal::ctrl_c().await?;
	info!("shutting down");

	if let Err(e) = player.save_position().await {
		error!("Error saving position: {e}");
	}
	if let Err(e) = collection.save() {
		error!("Error saving collection: {e}");
	}
	player.close().await?;

	Ok(())
}
