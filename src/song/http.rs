use hyper::{client::HttpConnector, header, Body, Request, Response, StatusCode, Uri};
use hyper_tls::HttpsConnector;

use super::Error;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), " v", env!("CARGO_PKG_VERSION"));
const MAX_REDIRECTS: usize = 10;

pub type Client = hyper::Client<HttpsConnector<HttpConnector>>;

pub fn client() -> Client {
	hyper::Client::builder().build(HttpsConnector::new())
}

/// GET `uri`, following redirects. Only successful responses are returned.
pub async fn get(client: &Client, mut uri: Uri) -> Result<Response<Body>, Error> {
	for _ in 0..=MAX_REDIRECTS {
		let req = Request::get(uri.clone())
			.header(header::USER_AGENT, USER_AGENT)
			.body(Body::empty())?;

		let res = client.request(req).await?;
		let status = res.status();

		if status.is_redirection() {
			let location = res
				.headers()
				.get(header::LOCATION)
				.and_then(|v| v.to_str().ok())
				.ok_or(Error::Status(status))?;
			uri = resolve(&uri, location)?;
			log::debug!("following redirect to {uri}");
			continue;
		}

		if status != StatusCode::OK {
			return Err(Error::Status(status));
		}

		return Ok(res);
	}

	Err(Error::Redirects)
}

/// Resolves a possibly relative `Location` against the request uri.
fn resolve(base: &Uri, location: &str) -> Result<Uri, Error> {
	let target: Uri = location.parse()?;
	if target.scheme().is_some() {
		return Ok(target);
	}

	let scheme = base.scheme_str().unwrap_or("https");
	let authority = base.authority().map(|a| a.as_str()).unwrap_or_default();
	let path = target.path_and_query().map(|p| p.as_str()).unwrap_or("/");

	Ok(format!("{scheme}://{authority}{path}").parse()?)
}
