use async_nats::HeaderMap;
use bytes::Bytes;
use pipebus_core::payload::Payload;
use serde_json::{Map, Value};

/// Header carrying the payload source.
pub const SOURCE_HEADER: &str = "Pipebus-Source";
/// Header carrying the payload timestamp in microseconds.
pub const TIMESTAMP_HEADER: &str = "Pipebus-Timestamp";
/// Header carrying the payload metadata as a JSON object.
pub const META_HEADER: &str = "Pipebus-Meta";

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Message has no headers")]
    NoHeaders,
    #[error("Message is missing header '{}'", _0)]
    MissingHeader(&'static str),
    #[error("Invalid timestamp header '{value}': {source}")]
    InvalidTimestamp {
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("Invalid metadata header: {source}")]
    InvalidMeta {
        #[source]
        source: serde_json::Error,
    },
}

pub trait PayloadExt {
    type Error;
    /// Headers carrying everything but the content.
    fn to_headers(&self) -> Result<HeaderMap, Self::Error>;
}

pub trait NatsMessageExt {
    type Error;
    fn to_payload(&self) -> Result<Payload, Self::Error>;
}

impl PayloadExt for Payload {
    type Error = Error;

    fn to_headers(&self) -> Result<HeaderMap, Error> {
        let mut headers = HeaderMap::new();
        headers.insert(SOURCE_HEADER, self.source.as_str());
        headers.insert(TIMESTAMP_HEADER, self.timestamp.to_string());
        if let Some(meta) = &self.meta {
            let meta = serde_json::to_string(meta).map_err(|source| Error::InvalidMeta { source })?;
            headers.insert(META_HEADER, meta);
        }
        Ok(headers)
    }
}

impl NatsMessageExt for async_nats::Message {
    type Error = Error;

    fn to_payload(&self) -> Result<Payload, Error> {
        decode(self.payload.clone(), self.headers.as_ref())
    }
}

/// Rebuilds a payload from a message body and its headers.
pub fn decode(content: Bytes, headers: Option<&HeaderMap>) -> Result<Payload, Error> {
    let headers = headers.ok_or(Error::NoHeaders)?;

    let source = headers
        .get(SOURCE_HEADER)
        .ok_or(Error::MissingHeader(SOURCE_HEADER))?
        .as_str()
        .to_string();

    let timestamp = headers
        .get(TIMESTAMP_HEADER)
        .ok_or(Error::MissingHeader(TIMESTAMP_HEADER))?
        .as_str();
    let timestamp = timestamp
        .parse::<i64>()
        .map_err(|source| Error::InvalidTimestamp {
            value: timestamp.to_string(),
            source,
        })?;

    let meta = match headers.get(META_HEADER) {
        Some(meta) => Some(
            serde_json::from_str::<Map<String, Value>>(meta.as_str())
                .map_err(|source| Error::InvalidMeta { source })?,
        ),
        None => None,
    };

    Ok(Payload {
        content,
        source,
        meta,
        timestamp,
    })
}
