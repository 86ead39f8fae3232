//! In-process playback: files are decoded up front with symphonia and
//! rendered through cpal on a dedicated audio thread.

use std::{
	io::Cursor,
	sync::{
		atomic::{AtomicBool, Ordering},
		mpsc as std_mpsc, Arc, Mutex, MutexGuard, PoisonError,
	},
	thread,
};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, error, warn};
use symphonia::core::{
	audio::SampleBuffer, codecs::DecoderOptions, errors::Error as DecodeError, formats::FormatOptions,
	io::MediaSourceStream, meta::MetadataOptions, probe::Hint,
};
use tokio::sync::oneshot;

use super::{Driver, Error, Event, Events, Result};
use crate::song::http;

/// Decoded audio, interleaved stereo.
struct Track {
	samples: Vec<f32>,
	rate: u32,
	/// Position in frames; fractional when the device rate differs.
	pos: f64,
}

impl Track {
	fn frames(&self) -> usize {
		self.samples.len() / 2
	}

	fn seconds(&self, frames: f64) -> f64 {
		frames / f64::from(self.rate)
	}
}

#[derive(Default)]
struct Shared {
	track: Mutex<Option<Track>>,
	paused: AtomicBool,
	volume: Mutex<f32>,
	events: Mutex<Option<Events>>,
}

impl Shared {
	fn track(&self) -> MutexGuard<'_, Option<Track>> {
		self.track.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn emit(&self, event: Event) {
		if let Some(events) = self.events.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
			let _ = events.send(event);
		}
	}

	/// Fills one device buffer; ends the track when it runs out.
	fn render(&self, out: &mut [f32], channels: usize, device_rate: u32) {
		out.fill(0.0);
		if self.paused.load(Ordering::Relaxed) {
			return;
		}

		let volume = *self.volume.lock().unwrap_or_else(PoisonError::into_inner);
		let mut track = self.track();
		let Some(t) = track.as_mut() else {
			return;
		};

		let step = f64::from(t.rate) / f64::from(device_rate);
		let mut ended = false;
		for frame in out.chunks_mut(channels) {
			let i = t.pos as usize;
			if i >= t.frames() {
				ended = true;
				break;
			}

			for (c, sample) in frame.iter_mut().enumerate() {
				*sample = t.samples[i * 2 + c.min(1)] * volume;
			}
			t.pos += step;
		}

		if ended {
			*track = None;
			drop(track);
			self.emit(Event::EndFile);
		}
	}
}

/// Plays through the default output device.
pub struct Embedded {
	shared: Arc<Shared>,
	http: http::Client,
	shutdown: Mutex<Option<std_mpsc::Sender<()>>>,
}

impl Default for Embedded {
	fn default() -> Self {
		Self::new()
	}
}

impl Embedded {
	pub fn new() -> Self {
		let shared = Shared {
			volume: Mutex::new(1.0),
			..Default::default()
		};
		Self {
			shared: Arc::new(shared),
			http: http::client(),
			shutdown: Mutex::new(None),
		}
	}

	async fn fetch(&self, token: &str) -> Result<Vec<u8>> {
		if !(token.starts_with("http://") || token.starts_with("https://")) {
			return Ok(tokio::fs::read(token).await?);
		}

		let uri = token.parse().map_err(|e| Error::Playback(format!("{token}: {e}")))?;
		let res = http::get(&self.http, uri)
			.await
			.map_err(|e| Error::Playback(e.to_string()))?;
		let body = hyper::body::to_bytes(res.into_body())
			.await
			.map_err(|e| Error::Playback(e.to_string()))?;

		Ok(body.to_vec())
	}

	async fn load(&self, token: &str) -> Result<()> {
		let bytes = self.fetch(token).await?;
		let track = tokio::task::spawn_blocking(move || decode(bytes))
			.await
			.map_err(|e| Error::Playback(e.to_string()))??;

		let replaced = self.shared.track().replace(track).is_some();
		if replaced {
			self.shared.emit(Event::EndFile);
		}
		self.shared.emit(Event::StartFile);

		Ok(())
	}

	fn unavailable(property: &str) -> Error {
		Error::Response(format!("property {property} unavailable"))
	}
}

fn decode(bytes: Vec<u8>) -> Result<Track> {
	let fail = |e: DecodeError| Error::Playback(e.to_string());

	let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
	let probed = symphonia::default::get_probe()
		.format(&Hint::new(), mss, &FormatOptions::default(), &MetadataOptions::default())
		.map_err(fail)?;
	let mut format = probed.format;

	let track = format
		.default_track()
		.ok_or_else(|| Error::Playback("no audio track".into()))?;
	let track_id = track.id;
	let rate = track.codec_params.sample_rate.unwrap_or(44100);
	let mut decoder = symphonia::default::get_codecs()
		.make(&track.codec_params, &DecoderOptions::default())
		.map_err(fail)?;

	let mut samples = Vec::new();
	loop {
		let packet = match format.next_packet() {
			Ok(packet) => packet,
			Err(DecodeError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
			Err(DecodeError::ResetRequired) => break,
			Err(e) => return Err(fail(e)),
		};
		if packet.track_id() != track_id {
			continue;
		}

		let decoded = match decoder.decode(&packet) {
			Ok(decoded) => decoded,
			Err(DecodeError::DecodeError(e)) => {
				debug!("skipping corrupt packet: {e}");
				continue;
			}
			Err(e) => return Err(fail(e)),
		};

		let channels = decoded.spec().channels.count().max(1);
		let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
		buf.copy_interleaved_ref(decoded);

		for frame in buf.samples().chunks(channels) {
			samples.push(frame[0]);
			samples.push(frame[1.min(channels - 1)]);
		}
	}

	Ok(Track { samples, rate, pos: 0.0 })
}

/// Runs the output stream until told to stop. cpal streams cannot move
/// between threads on every platform, so the stream lives and dies here.
fn audio_thread(shared: Arc<Shared>, ready: oneshot::Sender<Result<()>>, shutdown: std_mpsc::Receiver<()>) {
	let stream = (|| -> Result<cpal::Stream> {
		let device = cpal::default_host()
			.default_output_device()
			.ok_or_else(|| Error::Playback("no output device".into()))?;
		let config = device
			.default_output_config()
			.map_err(|e| Error::Playback(e.to_string()))?;
		if config.sample_format() != cpal::SampleFormat::F32 {
			return Err(Error::Playback(format!(
				"unsupported sample format {:?}",
				config.sample_format()
			)));
		}

		let config: cpal::StreamConfig = config.into();
		let channels = usize::from(config.channels).max(1);
		let rate = config.sample_rate.0;

		let stream = device
			.build_output_stream(
				&config,
				move |data: &mut [f32], _: &cpal::OutputCallbackInfo| shared.render(data, channels, rate),
				|e| error!("audio stream: {e}"),
				None,
			)
			.map_err(|e| Error::Playback(e.to_string()))?;
		stream.play().map_err(|e| Error::Playback(e.to_string()))?;

		Ok(stream)
	})();

	let stream = match stream {
		Ok(stream) => {
			let _ = ready.send(Ok(()));
			stream
		}
		Err(e) => {
			let _ = ready.send(Err(e));
			return;
		}
	};

	let _ = shutdown.recv();
	drop(stream);
	debug!("audio thread done");
}

#[async_trait]
impl Driver for Embedded {
	fn name(&self) -> &str {
		"embedded"
	}

	async fn init(&self, events: Events) -> Result<()> {
		*self.shared.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(events);

		let (ready, started) = oneshot::channel();
		let (stop, shutdown) = std_mpsc::channel();
		let shared = Arc::clone(&self.shared);
		thread::Builder::new()
			.name("ymbox-audio".into())
			.spawn(move || audio_thread(shared, ready, shutdown))?;

		started.await.map_err(|_| Error::Closed)??;
		*self.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop);

		Ok(())
	}

	async fn close(&self) -> Result<()> {
		if let Some(stop) = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).take() {
			let _ = stop.send(());
		}
		self.shared.events.lock().unwrap_or_else(PoisonError::into_inner).take();
		Ok(())
	}

	async fn get_f64(&self, property: &str) -> Result<f64> {
		if property == "volume" {
			return Ok(f64::from(*self.shared.volume.lock().unwrap_or_else(PoisonError::into_inner)) * 100.0);
		}

		let track = self.shared.track();
		let t = track.as_ref().ok_or_else(|| Self::unavailable(property))?;
		match property {
			"time-pos" => Ok(t.seconds(t.pos)),
			"duration" => Ok(t.seconds(t.frames() as f64)),
			"percent-pos" => Ok(t.pos / t.frames().max(1) as f64 * 100.0),
			_ => Err(Self::unavailable(property)),
		}
	}

	async fn set_f64(&self, property: &str, value: f64) -> Result<()> {
		if property == "volume" {
			*self.shared.volume.lock().unwrap_or_else(PoisonError::into_inner) = (value / 100.0) as f32;
			return Ok(());
		}

		let mut track = self.shared.track();
		let t = track.as_mut().ok_or_else(|| Self::unavailable(property))?;
		let frames = t.frames() as f64;
		t.pos = match property {
			"time-pos" => value * f64::from(t.rate),
			"percent-pos" => value / 100.0 * frames,
			_ => return Err(Self::unavailable(property)),
		}
		.clamp(0.0, frames);

		Ok(())
	}

	async fn get_bool(&self, property: &str) -> Result<bool> {
		match property {
			"pause" => Ok(self.shared.paused.load(Ordering::SeqCst)),
			_ => Err(Self::unavailable(property)),
		}
	}

	async fn set_bool(&self, property: &str, value: bool) -> Result<()> {
		if property != "pause" {
			return Err(Self::unavailable(property));
		}

		self.shared.paused.store(value, Ordering::SeqCst);
		self.shared.emit(Event::PropertyChange);
		Ok(())
	}

	async fn command(&self, args: &[&str]) -> Result<()> {
		match args {
			["loadfile", token, ..] => self.load(token).await,
			["stop"] => {
				if self.shared.track().take().is_some() {
					self.shared.emit(Event::EndFile);
				}
				Ok(())
			}
			_ => {
				warn!("unsupported command {args:?}");
				Err(Error::Response(format!("unsupported command {}", args.join(" "))))
			}
		}
	}
}
