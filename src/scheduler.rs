//! A rate limited worker pool.
//!
//! Submitted items pass a cheap filter first (never rate limited). Admitted
//! items wait in a FIFO until a worker receives a rate token, at which point
//! the oldest one is handed to the (expensive) action. A token that finds
//! nothing pending is simply spent.

use std::{
	collections::VecDeque,
	future::Future,
	sync::{Arc, PoisonError},
	time::Duration,
};

use tokio::sync::{mpsc, Mutex};

/// A source of rate tokens, one action per token.
pub type Rate = mpsc::Receiver<()>;

/// Emits `amount` tokens, sleeps `interval`, repeats until every receiver
/// is gone.
pub fn ratelimit(amount: usize, interval: Duration) -> Rate {
	let amount = amount.max(1);
	let (sx, rx) = mpsc::channel(amount);

	tokio::spawn(async move {
		loop {
			for _ in 0..amount {
				if sx.send(()).await.is_err() {
					return;
				}
			}
			tokio::time::sleep(interval).await;
		}
	});

	rx
}

#[derive(Debug)]
pub struct Scheduler<T> {
	sx: mpsc::Sender<T>,
}

impl<T> Clone for Scheduler<T> {
	fn clone(&self) -> Self {
		Self {
			sx: self.sx.clone(),
		}
	}
}

impl<T: Send + 'static> Scheduler<T> {
	/// Spawns `concurrency` filter workers and as many action workers.
	pub fn start<F, A, Fut>(concurrency: usize, rate: Rate, filter: F, action: A) -> Self
	where
		F: Fn(&T) -> bool + Send + Sync + 'static,
		A: Fn(T) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let concurrency = concurrency.max(1);
		let (sx, rx) = mpsc::channel(concurrency);

		let submitted = Arc::new(Mutex::new(rx));
		let rate = Arc::new(Mutex::new(rate));
		let pending = Arc::new(std::sync::Mutex::new(VecDeque::new()));
		let filter = Arc::new(filter);
		let action = Arc::new(action);

		for _ in 0..concurrency {
			tokio::spawn({
				let submitted = Arc::clone(&submitted);
				let pending = Arc::clone(&pending);
				let filter = Arc::clone(&filter);

				async move {
					loop {
						let item = submitted.lock().await.recv().await;
						let Some(item) = item else {
							break;
						};

						if filter(&item) {
							pending
								.lock()
								.unwrap_or_else(PoisonError::into_inner)
								.push_back(item);
						}
					}
				}
			});

			tokio::spawn({
				let rate = Arc::clone(&rate);
				let pending = Arc::clone(&pending);
				let action = Arc::clone(&action);

				async move {
					while rate.lock().await.recv().await.is_some() {
						let item = pending
							.lock()
							.unwrap_or_else(PoisonError::into_inner)
							.pop_front();

						if let Some(item) = item {
							action(item).await;
						}
					}
					log::debug!("rate source closed, worker exiting");
				}
			});
		}

		Self { sx }
	}

	/// Submits an item, waiting while the submission buffer is full.
	pub async fn add(&self, item: T) {
		if self.sx.send(item).await.is_err() {
			log::warn!("scheduler workers are gone, item dropped");
		}
	}
}
