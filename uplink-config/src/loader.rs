//! Settings loading and validation.

use std::io::ErrorKind;
use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::models::Settings;

/// Template written when the settings file is missing. The load still fails
/// so the operator fills it in before the agent does any work.
const TEMPLATE: &str = "\
# uplink agent settings
host = \"\"
port = 21
username = \"\"
password = \"\"
# Remote directory uploads land under
remote_root = \"\"
";

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("could not read settings file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse settings file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("setting '{key}' has no value")]
    EmptyValue { key: &'static str },

    #[error("settings file '{path}' was missing; a template was created, fill it in and restart")]
    TemplateCreated { path: String },

    #[error("could not create settings template '{path}': {source}")]
    TemplateWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Load and validate the settings file.
///
/// A missing file is turned into a commented template so the operator has
/// something concrete to fill in; the load still fails in that case.
pub fn load(path: &Path) -> Result<Settings, ConfigLoadError> {
    let display_path = path.display().to_string();

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(create_template(path));
        }
        Err(source) => {
            return Err(ConfigLoadError::Read {
                path: display_path,
                source,
            });
        }
    };

    let settings: Settings = toml::from_str(&raw).map_err(|source| ConfigLoadError::Parse {
        path: display_path.clone(),
        source,
    })?;
    validate(&settings)?;

    info!(path = %display_path, "loaded settings");
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<(), ConfigLoadError> {
    let keys = [
        ("host", settings.host.as_str()),
        ("username", settings.username.as_str()),
        ("password", settings.password.as_str()),
        ("remote_root", settings.remote_root.as_str()),
    ];
    for (key, value) in keys {
        if value.trim().is_empty() {
            return Err(ConfigLoadError::EmptyValue { key });
        }
    }
    if settings.port == 0 {
        return Err(ConfigLoadError::EmptyValue { key: "port" });
    }
    Ok(())
}

fn create_template(path: &Path) -> ConfigLoadError {
    let display = path.display().to_string();
    match std::fs::write(path, TEMPLATE) {
        Ok(()) => ConfigLoadError::TemplateCreated { path: display },
        Err(source) => ConfigLoadError::TemplateWrite {
            path: display,
            source,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const VALID: &str = "\
host = \"ftp.example.test\"
port = 2121
username = \"submit\"
password = \"secret\"
remote_root = \"/srv/incoming\"
";

    #[test]
    fn loads_a_valid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("uplink.toml");
        std::fs::write(&path, VALID).unwrap();

        let settings = load(&path).unwrap();
        assert_eq!(settings.host, "ftp.example.test");
        assert_eq!(settings.port, 2121);
        assert_eq!(settings.remote_target().root_dir, "/srv/incoming");
    }

    #[test]
    fn missing_file_creates_a_template_and_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("uplink.toml");

        let err = load(&path).unwrap_err();
        assert!(matches!(err, ConfigLoadError::TemplateCreated { .. }));
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("remote_root"));

        // The template itself is not valid yet.
        let err = load(&path).unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::EmptyValue { key: "host" }
        ));
    }

    #[test]
    fn empty_values_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("uplink.toml");
        std::fs::write(&path, VALID.replace("\"secret\"", "\"\"")).unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, ConfigLoadError::EmptyValue { key: "password" }));
    }

    #[test]
    fn missing_keys_are_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("uplink.toml");
        std::fs::write(&path, "host = \"ftp.example.test\"\n").unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, ConfigLoadError::Parse { .. }));
    }
}
