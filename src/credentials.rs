// Credential resolution: every field is looked up independently across an
// ordered list of layers (command line, environment, credentials file) and
// the first non-empty value wins. Only `api_url` has a fallback.

use crate::error::{Error, Result};
use std::fmt;
use tracing::debug;

pub const DEFAULT_API_URL: &str = "https://api.customer.jp/anymotion/v1/";

pub const CLIENT_ID_ENV: &str = "ANYMOTION_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "ANYMOTION_CLIENT_SECRET";
pub const API_URL_ENV: &str = "ANYMOTION_API_URL";

/// Origin of a value, in precedence order: earlier variants win.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Source {
    Cli,
    Environment,
    File,
    Default,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Source::Cli => "command line",
            Source::Environment => "environment",
            Source::File => "file",
            Source::Default => "default",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    ClientId,
    ClientSecret,
    ApiUrl,
}

impl Field {
    pub const ALL: [Field; 3] = [Field::ClientId, Field::ClientSecret, Field::ApiUrl];

    pub fn name(self) -> &'static str {
        match self {
            Field::ClientId => "client_id",
            Field::ClientSecret => "client_secret",
            Field::ApiUrl => "api_url",
        }
    }

    pub fn env_var(self) -> &'static str {
        match self {
            Field::ClientId => CLIENT_ID_ENV,
            Field::ClientSecret => CLIENT_SECRET_ENV,
            Field::ApiUrl => API_URL_ENV,
        }
    }
}

/// Values supplied by one source. Empty strings count as absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layer {
    source: Source,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub api_url: Option<String>,
}

impl Layer {
    pub fn new(source: Source) -> Self {
        Layer {
            source,
            client_id: None,
            client_secret: None,
            api_url: None,
        }
    }

    /// Reads the `ANYMOTION_*` variables of the current process.
    pub fn from_env() -> Self {
        Self::from_lookup(Source::Environment, |key| std::env::var(key).ok())
    }

    fn from_lookup(source: Source, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut layer = Layer::new(source);
        for field in Field::ALL {
            layer.set(field, lookup(field.env_var()));
        }
        layer
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        let value = match field {
            Field::ClientId => &self.client_id,
            Field::ClientSecret => &self.client_secret,
            Field::ApiUrl => &self.api_url,
        };
        value.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, field: Field, value: Option<String>) {
        let slot = match field {
            Field::ClientId => &mut self.client_id,
            Field::ClientSecret => &mut self.client_secret,
            Field::ApiUrl => &mut self.api_url,
        };
        *slot = value;
    }

    pub fn with(mut self, field: Field, value: impl Into<String>) -> Self {
        self.set(field, Some(value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        Field::ALL.iter().all(|f| self.get(*f).is_none())
    }
}

/// The effective credential pair plus the API root to send it to. The
/// secret never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub api_url: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &mask(&self.client_id))
            .field("client_secret", &"****")
            .field("api_url", &self.api_url)
            .finish()
    }
}

/// Shows only the last four characters of a value.
pub fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), tail)
}

/// Ordered lookup over credential layers.
pub struct CredentialResolver {
    layers: Vec<Layer>,
}

impl CredentialResolver {
    pub fn new(mut layers: Vec<Layer>) -> Self {
        // Stable sort keeps caller order among layers of the same source.
        layers.sort_by_key(|layer| layer.source());
        CredentialResolver { layers }
    }

    /// First non-empty value for `field` and the source it came from.
    pub fn lookup(&self, field: Field) -> Option<(&str, Source)> {
        self.layers
            .iter()
            .find_map(|layer| layer.get(field).map(|value| (value, layer.source())))
    }

    pub fn resolve(&self) -> Result<Credentials> {
        let mut missing = Vec::new();
        let mut required = |field: Field| match self.lookup(field) {
            Some((value, source)) => {
                debug!(field = field.name(), ?source, "credential field resolved");
                value.to_string()
            }
            None => {
                missing.push(field.name());
                String::new()
            }
        };
        let client_id = required(Field::ClientId);
        let client_secret = required(Field::ClientSecret);

        if !missing.is_empty() {
            return Err(Error::MissingCredential { fields: missing });
        }

        let api_url = match self.lookup(Field::ApiUrl) {
            Some((value, source)) => {
                debug!(field = "api_url", ?source, "credential field resolved");
                value.to_string()
            }
            None => {
                debug!(field = "api_url", source = ?Source::Default, "credential field resolved");
                DEFAULT_API_URL.to_string()
            }
        };

        Ok(Credentials {
            client_id,
            client_secret,
            api_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(source: Source, id: Option<&str>, secret: Option<&str>, url: Option<&str>) -> Layer {
        let mut layer = Layer::new(source);
        layer.set(Field::ClientId, id.map(String::from));
        layer.set(Field::ClientSecret, secret.map(String::from));
        layer.set(Field::ApiUrl, url.map(String::from));
        layer
    }

    #[test]
    fn each_field_takes_highest_precedence_non_empty_value() {
        let slots = |tag: &str| [None, Some(String::new()), Some(tag.to_string())];
        for cli in slots("cli") {
            for env in slots("env") {
                for file in slots("file") {
                    // Layers deliberately out of precedence order.
                    let resolver = CredentialResolver::new(vec![
                        layer(Source::File, file.as_deref(), Some("secret"), file.as_deref()),
                        layer(Source::Cli, cli.as_deref(), None, cli.as_deref()),
                        layer(Source::Environment, env.as_deref(), None, env.as_deref()),
                    ]);
                    let expected = [&cli, &env, &file]
                        .into_iter()
                        .flatten()
                        .find(|v| !v.is_empty());

                    match (resolver.resolve(), expected) {
                        (Ok(creds), Some(value)) => {
                            assert_eq!(&creds.client_id, value);
                            assert_eq!(&creds.api_url, value);
                            assert_eq!(creds.client_secret, "secret");
                        }
                        (Err(Error::MissingCredential { fields }), None) => {
                            assert_eq!(fields, vec!["client_id"]);
                        }
                        (other, expected) => panic!(
                            "cli={cli:?} env={env:?} file={file:?}: got {other:?}, expected {expected:?}"
                        ),
                    }
                }
            }
        }
    }

    #[test]
    fn api_url_falls_back_to_default() {
        let resolver = CredentialResolver::new(vec![
            layer(Source::Cli, Some("id"), Some("secret"), Some("")),
            layer(Source::File, None, None, None),
        ]);
        assert_eq!(resolver.resolve().unwrap().api_url, DEFAULT_API_URL);
    }

    #[test]
    fn fields_can_come_from_different_sources() {
        let resolver = CredentialResolver::new(vec![
            layer(Source::File, Some("file-id"), Some("file-secret"), None),
            layer(Source::Environment, None, Some("env-secret"), None),
        ]);

        let creds = resolver.resolve().unwrap();
        assert_eq!(creds.client_id, "file-id");
        assert_eq!(creds.client_secret, "env-secret");
        assert_eq!(creds.api_url, DEFAULT_API_URL);
        assert_eq!(
            resolver.lookup(Field::ClientSecret),
            Some(("env-secret", Source::Environment))
        );
    }

    #[test]
    fn missing_id_and_secret_are_both_named() {
        let resolver = CredentialResolver::new(vec![layer(
            Source::Cli,
            Some("  "),
            None,
            Some("https://x/anymotion/v1/"),
        )]);

        match resolver.resolve() {
            Err(Error::MissingCredential { fields }) => {
                assert_eq!(fields, vec!["client_id", "client_secret"]);
            }
            other => panic!("expected MissingCredential, got {other:?}"),
        }
    }

    #[test]
    fn environment_layer_reads_anymotion_variables() {
        let layer = Layer::from_lookup(Source::Environment, |key| match key {
            CLIENT_ID_ENV => Some("env-id".into()),
            CLIENT_SECRET_ENV => Some(String::new()),
            _ => None,
        });
        assert_eq!(layer.get(Field::ClientId), Some("env-id"));
        assert_eq!(layer.get(Field::ClientSecret), None);
        assert_eq!(layer.get(Field::ApiUrl), None);
    }

    #[test]
    fn debug_output_hides_the_secret() {
        let creds = Credentials {
            client_id: "abcdefgh".into(),
            client_secret: "top-secret".into(),
            api_url: DEFAULT_API_URL.into(),
        };
        let printed = format!("{creds:?}");
        assert!(!printed.contains("top-secret"));
        assert!(printed.contains("****efgh"));
    }
}
