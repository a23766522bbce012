// On-disk settings: the `credentials` and `config` INI files under the
// AnyMotion root directory, one section per profile.
//
// Reading produces the file layer for credential resolution and the polling
// policy. Writing only ever receives values the operator typed on the
// command line; environment values never reach these files.

use crate::credentials::{Field, Layer, Source};
use crate::error::{Error, Result};
use crate::poller::{PollPolicy, DEFAULT_INTERVAL, DEFAULT_TIMEOUT};
use ini::Ini;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const ROOT_ENV: &str = "ANYMOTION_ROOT";
pub const DEFAULT_PROFILE: &str = "default";

const CLIENT_ID_KEY: &str = "anymotion_client_id";
const CLIENT_SECRET_KEY: &str = "anymotion_client_secret";
const API_URL_KEY: &str = "anymotion_api_url";
const INTERVAL_KEY: &str = "polling_interval";
const TIMEOUT_KEY: &str = "timeout";

#[derive(Clone, Debug)]
pub struct Settings {
    profile: String,
    root: PathBuf,
}

impl Settings {
    /// Root is `$ANYMOTION_ROOT` when set, else `~/.anymotion`.
    pub fn locate(profile: &str) -> Result<Self> {
        let root = match std::env::var_os(ROOT_ENV) {
            Some(root) if !root.is_empty() => PathBuf::from(root),
            _ => dirs::home_dir()
                .ok_or_else(|| Error::Config("cannot determine the home directory".into()))?
                .join(".anymotion"),
        };
        Ok(Self::at(root, profile))
    }

    pub fn at(root: impl Into<PathBuf>, profile: &str) -> Self {
        Settings {
            profile: profile.to_string(),
            root: root.into(),
        }
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.root.join("credentials")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config")
    }

    /// Credential values stored for this profile. Missing files yield an
    /// empty layer.
    pub fn file_layer(&self) -> Result<Layer> {
        let credentials = load(&self.credentials_path())?;
        let config = load(&self.config_path())?;
        let profile = Some(self.profile.as_str());

        let mut layer = Layer::new(Source::File);
        layer.set(
            Field::ClientId,
            credentials.get_from(profile, CLIENT_ID_KEY).map(String::from),
        );
        layer.set(
            Field::ClientSecret,
            credentials.get_from(profile, CLIENT_SECRET_KEY).map(String::from),
        );
        layer.set(
            Field::ApiUrl,
            config.get_from(profile, API_URL_KEY).map(String::from),
        );
        Ok(layer)
    }

    /// Polling interval and timeout from the config file, falling back to
    /// the defaults for anything unset.
    pub fn poll_policy(&self) -> Result<PollPolicy> {
        let config = load(&self.config_path())?;
        let profile = Some(self.profile.as_str());
        let seconds = |key: &str| -> Result<Option<u64>> {
            config
                .get_from(profile, key)
                .map(|raw| {
                    raw.trim().parse::<u64>().map_err(|_| {
                        Error::Config(format!("{key} must be a whole number of seconds, got {raw:?}"))
                    })
                })
                .transpose()
        };

        let interval = seconds(INTERVAL_KEY)?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_INTERVAL);
        let timeout = seconds(TIMEOUT_KEY)?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);
        let policy = PollPolicy::from_timeout(interval, timeout);
        debug!(?policy, profile = %self.profile, "polling policy loaded");
        Ok(policy)
    }

    /// Writes operator-entered values into the profile section. Only a
    /// command-line layer is accepted.
    pub fn persist(&self, entered: &Layer) -> Result<()> {
        if entered.source() != Source::Cli {
            return Err(Error::Config(format!(
                "refusing to store values from {:?} in the credentials file",
                entered.source()
            )));
        }

        let profile = self.profile.as_str();
        if entered.get(Field::ClientId).is_some() || entered.get(Field::ClientSecret).is_some() {
            let path = self.credentials_path();
            let mut credentials = load(&path)?;
            if let Some(id) = entered.get(Field::ClientId) {
                credentials.with_section(Some(profile)).set(CLIENT_ID_KEY, id);
            }
            if let Some(secret) = entered.get(Field::ClientSecret) {
                credentials
                    .with_section(Some(profile))
                    .set(CLIENT_SECRET_KEY, secret);
            }
            store(&credentials, &path)?;
        }

        if let Some(url) = entered.get(Field::ApiUrl) {
            let path = self.config_path();
            let mut config = load(&path)?;
            config.with_section(Some(profile)).set(API_URL_KEY, url);
            store(&config, &path)?;
        }

        info!(profile, "settings updated");
        Ok(())
    }
}

fn load(path: &Path) -> Result<Ini> {
    if !path.exists() {
        return Ok(Ini::new());
    }
    Ini::load_from_file(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))
}

fn store(ini: &Ini, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::io(format!("cannot create {}", dir.display()), e))?;
    }
    ini.write_to_file(path)
        .map_err(|e| Error::io(format!("cannot write {}", path.display()), e))
}
