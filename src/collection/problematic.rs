use std::{
	collections::HashMap,
	sync::{Mutex, PoisonError},
};

use crate::song::{global_id, Song, SongRef};

/// A song the pipeline failed on, with the last failure.
#[derive(Debug, Clone)]
pub struct Problematic {
	pub song: SongRef,
	pub reason: String,
}

/// Songs whose download or metadata lookup last failed, keyed by global id.
#[derive(Debug, Default)]
pub struct Problematics {
	inner: Mutex<HashMap<String, Problematic>>,
}

impl Problematics {
	pub fn add(&self, song: SongRef, reason: impl ToString) {
		let reason = reason.to_string();
		self.inner
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(global_id(song.as_ref()), Problematic { song, reason });
	}

	pub fn del(&self, song: &dyn Song) {
		self.inner
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&global_id(song));
	}

	/// Snapshot ordered by global id.
	pub fn list(&self) -> Vec<Problematic> {
		let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
		let mut list: Vec<_> = inner.iter().collect();
		list.sort_by(|a, b| a.0.cmp(b.0));
		list.into_iter().map(|(_, p)| p.clone()).collect()
	}
}
