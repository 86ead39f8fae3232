use std::{fs, sync::Arc};

use ymbox::{
	collection::Collection,
	queue::Queue,
	song::{fs::Store, global_id, youtube::YoutubeDl, Song, SongRef},
};

struct Jukebox {
	collection: Arc<Collection>,
	queue: Arc<Queue>,
	yt: Arc<YoutubeDl>,
}

fn open(dir: &std::path::Path) -> Jukebox {
	let store = Arc::new(Store::new(dir));
	let queue = Arc::new(Queue::new());
	let collection = Collection::new(Arc::clone(&store), Arc::clone(&queue), false);

	let yt = YoutubeDl::new("yt-dlp", store);
	collection.register_unmarshaler("yt", {
		let yt = Arc::clone(&yt);
		move |r| Ok(yt.unmarshal(r)? as SongRef)
	});
	collection.init().unwrap();

	Jukebox {
		collection,
		queue,
		yt,
	}
}

fn titles(songs: &[SongRef]) -> Vec<String> {
	songs.iter().map(|s| s.title()).collect()
}

#[tokio::test]
async fn jukebox_survives_restart() {
	let dir = tempfile::tempdir().unwrap();

	{
		let j = open(dir.path());
		let never = j.yt.song("dQw4w9WgXcQ", "Never Gonna Give You Up");
		let gangnam = j.yt.song("9bZkp7q19f0", "Gangnam Style");
		let untitled = j.yt.song("kJQP7kiw5Fk", "");

		j.collection.create(" Party Mix ").unwrap();
		j.collection.create("later").unwrap();
		j.collection.add_song("party mix", never.clone()).unwrap();
		j.collection.add_song("party mix", gangnam.clone()).unwrap();
		j.collection.add_song("later", untitled.clone()).unwrap();

		j.collection.queue_playlist(-1, "party mix").unwrap();
		j.collection.queue_song(-1, untitled);
		j.queue.set_current_index(1);

		j.collection.save().unwrap();
	}

	let j = open(dir.path());
	assert_eq!(j.collection.list(), ["later", "party mix"]);
	assert_eq!(
		titles(&j.collection.playlist_songs("party mix").unwrap()),
		["Never Gonna Give You Up", "Gangnam Style"]
	);
	assert_eq!(titles(&j.collection.playlist_songs("later").unwrap()), [""]);

	let (queued, cursor) = j.queue.snapshot();
	assert_eq!(
		queued.iter().map(|s| global_id(s.as_ref())).collect::<Vec<_>>(),
		["yt-dQw4w9WgXcQ", "yt-9bZkp7q19f0", "yt-kJQP7kiw5Fk"]
	);
	assert_eq!(cursor, 1);

	// a rename through the queue shows up in the playlist
	j.collection.rename_song(queued[1].as_ref(), "강남스타일");
	assert_eq!(
		titles(&j.collection.playlist_songs("party mix").unwrap())[1],
		"강남스타일"
	);
}

#[tokio::test]
async fn stale_downloads_are_reported() {
	let dir = tempfile::tempdir().unwrap();
	let j = open(dir.path());

	let kept = j.yt.song("dQw4w9WgXcQ", "kept");
	let gone = j.yt.song("9bZkp7q19f0", "gone");
	for song in [&kept, &gone] {
		let file = song.file().unwrap();
		fs::create_dir_all(file.parent().unwrap()).unwrap();
		fs::write(&file, b"audio").unwrap();
	}
	assert!(kept.local());

	j.collection.queue_song(-1, kept);
	assert_eq!(j.collection.unreferenced_downloads().unwrap(), [gone.file().unwrap()]);
}
