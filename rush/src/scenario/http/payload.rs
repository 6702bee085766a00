use core::str::FromStr;
use std::{
    collections::HashMap,
    error::Error,
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use bytes::Bytes;
use http::{header, HeaderName, HeaderValue, Method, Request, Uri};
use http_body_util::Empty;
use serde::Deserialize;

/// JSON-line ammo format: one request template per line, blank lines are
/// skipped.
///
/// The "Host" header is set from the dedicated `host` field; a "Host" key
/// inside `headers` would be sent in addition to it, so don't do that.
#[derive(Debug, Deserialize)]
struct AmmoRecord {
    uri: String,
    #[serde(default = "default_method")]
    method: String,
    host: String,
    #[serde(default)]
    headers: HashMap<String, String>,
}

fn default_method() -> String {
    "GET".into()
}

impl AmmoRecord {
    fn into_request(self) -> Result<Request<Empty<Bytes>>, Box<dyn Error>> {
        let uri = Uri::from_str(&self.uri)?;
        if uri.scheme().is_some() || uri.authority().is_some() {
            return Err(format!("ammo URI '{}' must be relative", self.uri).into());
        }
        if uri.path().is_empty() {
            return Err(format!("ammo URI '{}' must have a path", self.uri).into());
        }

        let mut request = Request::builder()
            .method(Method::from_bytes(self.method.as_bytes())?)
            .uri(uri)
            .header(header::HOST, self.host);
        for (name, value) in self.headers {
            request = request.header(HeaderName::from_str(&name)?, HeaderValue::from_str(&value)?);
        }

        Ok(request.body(Empty::new())?)
    }
}

/// Loads request templates from the given ammo file.
pub fn from_fs<P>(path: P) -> Result<Vec<Request<Empty<Bytes>>>, Box<dyn Error>>
where
    P: AsRef<Path>,
{
    log::debug!("loading HTTP requests from '{}' ...", path.as_ref().display());

    let rd = File::open(path)?;
    let rd = BufReader::new(rd);

    let mut requests = Vec::new();
    for line in rd.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let record: AmmoRecord = serde_json::from_str(&line)?;
        let request = record.into_request()?;
        log::debug!("loaded HTTP request: {:?}", request);

        requests.push(request);
    }

    Ok(requests)
}
