use pipebus_core::retry::{retry, RetryConfig};
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// Default NATS Server URL.
pub const DEFAULT_NATS_URL: &str = "localhost:4222";

/// Authentication credentials for NATS connections.
#[derive(serde::Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Credentials {
    pub nkey: Option<NKeyCredentials>,
}

/// NKey authentication using the seed (private key) starting with 'S'.
#[derive(serde::Deserialize, Debug, Clone, PartialEq)]
pub struct NKeyCredentials {
    pub seed: String,
}

/// Errors that can occur during NATS client operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Error reading credentials file '{path}': {source}")]
    ReadCredentials {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Error parsing credentials file: {source}")]
    ParseCredentials {
        #[source]
        source: serde_json::Error,
    },
    #[error("Credentials file '{}' holds no supported credentials", _0.display())]
    NoCredentials(PathBuf),
    #[error("Error connecting to '{url}': {source}")]
    Connect {
        url: String,
        #[source]
        source: async_nats::ConnectError,
    },
}

/// NATS client. Anonymous unless a credentials file is configured.
#[derive(Debug)]
pub struct Client {
    credentials_path: Option<PathBuf>,
    url: String,
    retry: RetryConfig,
    /// Connection, set once `connect` succeeded.
    pub nats_client: Option<async_nats::Client>,
}

impl Client {
    pub fn url(&self) -> &str {
        &self.url
    }

    fn read_credentials(&self) -> Result<Option<NKeyCredentials>, Error> {
        let Some(path) = &self.credentials_path else {
            return Ok(None);
        };
        let content = fs::read_to_string(path).map_err(|source| Error::ReadCredentials {
            path: path.clone(),
            source,
        })?;
        let credentials: Credentials = serde_json::from_str(&content)
            .map_err(|source| Error::ParseCredentials { source })?;
        credentials
            .nkey
            .map(Some)
            .ok_or_else(|| Error::NoCredentials(path.clone()))
    }
}

impl pipebus_core::client::Client for Client {
    type Error = Error;

    /// Connects to the server, retrying per the configured backoff.
    async fn connect(mut self) -> Result<Self, Error> {
        let nkey = self.read_credentials()?;
        let url = self.url.clone();

        let client = retry(&self.retry, || {
            let options = match &nkey {
                Some(nkey) => async_nats::ConnectOptions::with_nkey(nkey.seed.clone()),
                None => async_nats::ConnectOptions::new(),
            };
            let url = url.clone();
            async move { options.connect(url.as_str()).await }
        })
        .await
        .map_err(|source| Error::Connect {
            url: url.clone(),
            source,
        })?;

        info!(url = %url, "Connected to NATS");
        self.nats_client = Some(client);
        Ok(self)
    }
}

/// Builder for configuring and creating NATS clients.
#[derive(Default)]
pub struct ClientBuilder {
    credentials_path: Option<PathBuf>,
    url: Option<String>,
    retry: Option<RetryConfig>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        ClientBuilder::default()
    }

    /// Sets the path to the credentials file.
    ///
    /// ```json
    /// {
    ///   "nkey": {
    ///     "seed": "SUACSSL3UAHUDXKFSNVUZRF5UHPMWZ6BFDTJ7M6USDXIEDNPPQYYYCU3VY"
    ///   }
    /// }
    /// ```
    pub fn credentials_path(mut self, path: Option<PathBuf>) -> Self {
        self.credentials_path = path;
        self
    }

    /// Sets the server URL, e.g. "nats://localhost:4222". Defaults to "localhost:4222".
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Client {
        Client {
            credentials_path: self.credentials_path,
            url: self.url.unwrap_or_else(|| DEFAULT_NATS_URL.to_string()),
            retry: self.retry.unwrap_or_default(),
            nats_client: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builder_defaults() {
        let client = ClientBuilder::new().build();
        assert_eq!(client.url(), DEFAULT_NATS_URL);
        assert!(client.credentials_path.is_none());
        assert!(client.nats_client.is_none());
        assert_eq!(client.retry, RetryConfig::default());
    }

    #[test]
    fn test_anonymous_without_credentials_path() {
        let client = ClientBuilder::new().url("nats://bus:4222").build();
        assert_eq!(client.read_credentials().unwrap(), None);
    }

    #[test]
    fn test_read_nkey_credentials() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"nkey": {{"seed": "SUACSSL3UAHUDXKFSNVUZRF5UHPMWZ6BFDTJ7M6USDXIEDNPPQYYYCU3VY"}}}}"#
        )
        .unwrap();

        let client = ClientBuilder::new()
            .credentials_path(Some(file.path().to_path_buf()))
            .build();

        let nkey = client.read_credentials().unwrap().unwrap();
        assert_eq!(
            nkey.seed,
            "SUACSSL3UAHUDXKFSNVUZRF5UHPMWZ6BFDTJ7M6USDXIEDNPPQYYYCU3VY"
        );
    }

    #[test]
    fn test_empty_credentials_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{}}").unwrap();

        let client = ClientBuilder::new()
            .credentials_path(Some(file.path().to_path_buf()))
            .build();

        assert!(matches!(
            client.read_credentials(),
            Err(Error::NoCredentials(_))
        ));
    }

    #[test]
    fn test_missing_credentials_file() {
        let client = ClientBuilder::new()
            .credentials_path(Some(PathBuf::from("/nonexistent/nats.creds")))
            .build();

        assert!(matches!(
            client.read_credentials(),
            Err(Error::ReadCredentials { .. })
        ));
    }
}
