//! A jukebox engine: playlists and a play queue of remote songs, cached in
//! the background and played through `mpv` or an in-process engine.

pub mod backend;
pub mod codec;
pub mod collection;
pub mod config;
pub mod player;
pub mod queue;
pub mod scheduler;
pub mod song;
