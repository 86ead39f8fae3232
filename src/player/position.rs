//! The playback position survives restarts in a four byte file holding
//! whole seconds, little endian.

use std::{fs, io, sync::Arc};

use log::debug;

use super::{Error, Player};
use crate::{backend::Whence, codec, song::fs::write_atomic};

impl Player {
	/// Writes the current position atomically.
	pub async fn save_position(&self) -> Result<(), Error> {
		let secs = u32::try_from(self.position().await.as_secs()).unwrap_or(u32::MAX);
		let path = self.position_file.clone();

		tokio::task::spawn_blocking(move || {
			write_atomic(&path, |f| codec::write_u32(f, secs))
		})
		.await
		.map_err(io::Error::from)??;

		debug!("saved position {secs}s");
		Ok(())
	}

	/// Seeks the song under the cursor to the saved position, leaving it
	/// paused. Does nothing when a song is already playing or nothing was
	/// saved.
	pub async fn load_position(self: &Arc<Self>) -> Result<(), Error> {
		let secs = match fs::File::open(&self.position_file) {
			Ok(mut f) => codec::read_u32(&mut f)?,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
			Err(e) => return Err(e.into()),
		};

		if self.current().await.is_some() {
			return Ok(());
		}

		self.play().await;
		self.seek(f64::from(secs), Whence::Start).await;
		self.pause().await;

		Ok(())
	}
}
