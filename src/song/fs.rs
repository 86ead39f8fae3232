use std::{
	collections::HashSet,
	fs, io,
	path::{Path, PathBuf},
	time::{SystemTime, UNIX_EPOCH},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};

/// On-disk layout of the jukebox state directory.
#[derive(Debug, Clone)]
pub struct Store {
	dir: PathBuf,
}

impl Store {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self { dir: dir.into() }
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn db(&self) -> PathBuf {
		self.dir.join("db")
	}

	pub fn position(&self) -> PathBuf {
		self.dir.join("player-position")
	}

	pub fn ipc(&self) -> PathBuf {
		self.dir.join("mpv-ipc.sock")
	}

	pub fn songs(&self) -> PathBuf {
		self.dir.join("songs")
	}

	/// `songs/<ns>/<c1>/<c2>/<hash>` where hash is derived from the id.
	pub fn path(&self, ns: &str, id: &str) -> PathBuf {
		let hash = URL_SAFE_NO_PAD.encode(Sha256::digest(id.as_bytes()));
		let mut chars = hash.chars();
		let (c1, c2) = (
			chars.next().unwrap_or('_').to_string(),
			chars.next().unwrap_or('_').to_string(),
		);

		let mut path = self.songs();
		path.push(sanitize_ns(ns));
		path.push(c1);
		path.push(c2);
		path.push(hash);

		path
	}

	/// Every regular file four levels below the song directory.
	fn cached(&self) -> io::Result<Vec<PathBuf>> {
		let mut level = vec![self.songs()];
		for _ in 0..4 {
			let mut next = Vec::new();
			for dir in level {
				let entries = match fs::read_dir(&dir) {
					Ok(entries) => entries,
					Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
					Err(e) => return Err(e),
				};

				for entry in entries {
					next.push(entry?.path());
				}
			}
			level = next;
		}

		Ok(level.into_iter().filter(|p| p.is_file()).collect())
	}

	/// Removes leftovers of interrupted downloads.
	pub fn clean_tmp(&self) -> io::Result<usize> {
		let mut n = 0;
		for path in self.cached()? {
			if path.extension() == Some("tmp".as_ref()) {
				fs::remove_file(&path)?;
				n += 1;
			}
		}

		Ok(n)
	}

	/// Cached files no longer referenced by any of the given `(ns, id)` pairs.
	pub fn unreferenced<'a>(
		&self,
		songs: impl IntoIterator<Item = (&'a str, &'a str)>,
	) -> io::Result<Vec<PathBuf>> {
		let referenced: HashSet<_> = songs
			.into_iter()
			.map(|(ns, id)| self.path(ns, id))
			.collect();

		let mut list: Vec<_> = self
			.cached()?
			.into_iter()
			.filter(|p| !referenced.contains(p))
			.collect();
		list.sort();

		Ok(list)
	}
}

fn sanitize_ns(ns: &str) -> String {
	let mut out = String::with_capacity(ns.len());
	let mut run = false;
	for c in ns.chars() {
		if c.is_ascii_alphanumeric() {
			out.push(c);
			run = false;
		} else if !run {
			out.push('-');
			run = true;
		}
	}

	out
}

/// A sibling of `file` salted with a timestamp and random suffix.
pub fn temp_file(file: &Path) -> PathBuf {
	let nanos = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_nanos())
		.unwrap_or_default();

	let mut rnd = [0u8; 32];
	rand::thread_rng().fill(&mut rnd);

	let mut name = file.as_os_str().to_owned();
	name.push(format!(
		".{}-{}.tmp",
		radix36(nanos),
		URL_SAFE_NO_PAD.encode(rnd)
	));

	PathBuf::from(name)
}

fn radix36(mut n: u128) -> String {
	const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
	if n == 0 {
		return "0".into();
	}

	let mut out = Vec::new();
	while n > 0 {
		out.push(DIGITS[(n % 36) as usize]);
		n /= 36;
	}
	out.reverse();

	String::from_utf8_lossy(&out).into_owned()
}

/// Writes through a temp file and renames it over `dest` once `write`
/// succeeded. On failure the temp file is removed and `dest` is untouched.
pub fn write_atomic<E: From<io::Error>>(
	dest: &Path,
	write: impl FnOnce(&mut fs::File) -> Result<(), E>,
) -> Result<(), E> {
	let tmp = temp_file(dest);
	let mut file = fs::File::create(&tmp)?;

	if let Err(e) = write(&mut file).and_then(|_| file.sync_all().map_err(E::from)) {
		drop(file);
		let _ = fs::remove_file(&tmp);
		return Err(e);
	}

	drop(file);
	if let Err(e) = fs::rename(&tmp, dest) {
		let _ = fs::remove_file(&tmp);
		return Err(e.into());
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn path_is_sharded_by_hash() {
		let store = Store::new("/s");
		let path = store.path("y t!", "abc");
		let rel = path.strip_prefix("/s/songs").unwrap();
		let parts: Vec<_> = rel.iter().map(|p| p.to_string_lossy().into_owned()).collect();

		assert_eq!(parts.len(), 4);
		assert_eq!(parts[0], "y-t-");
		assert!(parts[3].starts_with(&format!("{}{}", parts[1], parts[2])));
		assert_eq!(path, store.path("y t!", "abc"));
		assert_ne!(path, store.path("y t!", "abd"));
	}

	#[test]
	fn temp_file_is_salted_sibling() {
		let a = temp_file(Path::new("/x/db"));
		let b = temp_file(Path::new("/x/db"));

		assert_ne!(a, b);
		assert_eq!(a.parent(), Some(Path::new("/x")));
		assert!(a.to_string_lossy().starts_with("/x/db."));
		assert_eq!(a.extension(), Some("tmp".as_ref()));
	}

	#[test]
	fn failed_atomic_write_keeps_previous_contents() {
		let dir = tempfile::tempdir().unwrap();
		let dest = dir.path().join("state");
		fs::write(&dest, b"old").unwrap();

		let res: io::Result<()> = write_atomic(&dest, |f| {
			io::Write::write_all(f, b"partial")?;
			Err(io::Error::new(io::ErrorKind::Other, "boom"))
		});

		assert!(res.is_err());
		assert_eq!(fs::read(&dest).unwrap(), b"old");
		assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

		write_atomic::<io::Error>(&dest, |f| io::Write::write_all(f, b"new")).unwrap();
		assert_eq!(fs::read(&dest).unwrap(), b"new");
	}

	#[test]
	fn tmp_and_unreferenced_files_are_found() {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::new(dir.path());

		let kept = store.path("yt", "kept");
		let orphan = store.path("yt", "orphan");
		for p in [&kept, &orphan] {
			fs::create_dir_all(p.parent().unwrap()).unwrap();
			fs::write(p, b"x").unwrap();
		}
		let tmp = temp_file(&kept);
		fs::write(&tmp, b"x").unwrap();

		assert_eq!(store.clean_tmp().unwrap(), 1);
		assert!(!tmp.exists());
		assert_eq!(store.unreferenced([("yt", "kept")]).unwrap(), vec![orphan]);
	}
}
